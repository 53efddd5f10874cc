//! Xenbus Probe - read well-known xenstore keys from a Windows guest
//!
//! Connects through whichever PV driver set is configured, reads a few
//! keys and every entry under `drivers`, lists the domain directory, and
//! closes the connection. Useful for checking that the drivers are
//! installed and talking to xenstored.
//!
//! # Usage
//!
//! ```bash
//! # Defaults: session transport, reads vm, domid and the first vif MAC
//! xenbus-probe
//!
//! # Legacy drivers through the device file
//! xenbus-probe --transport device
//!
//! # Specific keys
//! xenbus-probe name control/shutdown
//!
//! # Verbose logging
//! RUST_LOG=debug xenbus-probe
//! ```

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use tracing::{info, warn};

use xenbus_core::config::{load_config_from_path, ConfigOverrides};
use xenbus_core::transport::TransportType;
use xenbus_core::{default_config_path, Op, Packet, XenBusConnection};

const DEFAULT_KEYS: [&str; 3] = ["vm", "domid", "device/vif/0/mac"];

/// Which driver set to talk through
#[derive(Clone, Copy, Debug, ValueEnum)]
enum TransportArg {
    /// GPLPV device file
    Device,
    /// WinPV WMI session
    Session,
}

/// Xenbus Probe - read xenstore keys through the Windows PV drivers
#[derive(Parser, Debug)]
#[command(name = "xenbus-probe")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Transport to use (overrides config file and XENBUS_TRANSPORT)
    #[arg(short = 't', long, value_enum)]
    transport: Option<TransportArg>,

    /// Explicit device path (device transport only)
    #[arg(long, value_name = "PATH")]
    device_path: Option<String>,

    /// Session name (session transport only)
    #[arg(long, value_name = "NAME")]
    session_name: Option<String>,

    /// Configuration file path
    #[arg(short = 'c', long, env = "XENBUS_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "XENBUS_LOG_LEVEL", default_value = "warn")]
    log_level: String,

    /// Keys to read (default: vm, domid, device/vif/0/mac)
    #[arg(value_name = "KEY")]
    keys: Vec<String>,
}

/// Initialize logging
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("xenbus_probe={level},xenbus_core={level}"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

/// One request in lock step: send, wait for the response, check it
struct Requester {
    conn: XenBusConnection,
    next_id: u32,
}

impl Requester {
    fn request(&mut self, op: Op, path: &str) -> Result<Vec<u8>> {
        self.next_id = self.next_id.wrapping_add(1);
        let mut payload = path.as_bytes().to_vec();
        payload.push(0);

        self.conn
            .send(&Packet::new(op, payload, self.next_id, 0))
            .with_context(|| format!("Failed to send {op} for {path:?}"))?;
        let reply = self
            .conn
            .recv()
            .with_context(|| format!("Failed to receive {op} reply for {path:?}"))?;

        if reply.rq_id() != self.next_id {
            bail!("Reply id {} does not match request id {}", reply.rq_id(), self.next_id);
        }
        if reply.op() == Op::Error {
            let code = String::from_utf8_lossy(reply.payload());
            bail!("xenstore returned {} for {path:?}", code.trim_end_matches('\0'));
        }
        Ok(reply.into_payload())
    }

    fn read(&mut self, path: &str) -> Result<String> {
        let value = self.request(Op::Read, path)?;
        Ok(String::from_utf8_lossy(&value).into_owned())
    }

    fn list(&mut self, path: &str) -> Result<Vec<String>> {
        let value = self.request(Op::Directory, path)?;
        Ok(value
            .split(|&b| b == 0)
            .filter(|name| !name.is_empty())
            .map(|name| String::from_utf8_lossy(name).into_owned())
            .collect())
    }

    /// List `dir` and read every child, keeping per-child failures
    fn read_children(&mut self, dir: &str) -> Result<Vec<(String, Result<String>)>> {
        let children = self.list(dir)?;
        Ok(children
            .into_iter()
            .map(|name| {
                let key = format!("{}/{name}", dir.trim_end_matches('/'));
                let value = self.read(&key);
                (key, value)
            })
            .collect())
    }
}

fn overrides(args: &Args) -> ConfigOverrides {
    let mut overrides = ConfigOverrides::new();
    if let Some(transport) = args.transport {
        overrides = overrides.with_transport(match transport {
            TransportArg::Device => TransportType::Device { path: None },
            TransportArg::Session => TransportType::Session,
        });
    }
    if let Some(ref path) = args.device_path {
        overrides = overrides.with_device_path(path.clone());
    }
    if let Some(ref name) = args.session_name {
        overrides = overrides.with_session_name(name.clone());
    }
    overrides
}

fn run(args: &Args) -> Result<()> {
    let path = args.config.clone().or_else(default_config_path);
    let mut config = load_config_from_path(path).context("Failed to load configuration")?;
    overrides(args)
        .apply(&mut config)
        .context("Invalid command-line options")?;

    info!(source = %config.source(), transport = ?config.transport.transport, "Configuration loaded");

    let conn = XenBusConnection::from_config(&config.transport)
        .context("Failed to create xenstore transport")?;
    let mut requester = Requester { conn, next_id: 0 };
    requester
        .conn
        .connect()
        .context("Failed to connect to xenstore")?;

    let keys: Vec<String> = if args.keys.is_empty() {
        DEFAULT_KEYS.iter().map(ToString::to_string).collect()
    } else {
        args.keys.clone()
    };

    let mut domid = None;
    for key in &keys {
        match requester.read(key) {
            Ok(value) => {
                println!("{key} = {value}");
                if key == "domid" {
                    domid = Some(value);
                }
            }
            Err(e) => println!("{key}: {e:#}"),
        }
    }

    match requester.read_children("drivers") {
        Ok(entries) => {
            for (key, value) in entries {
                match value {
                    Ok(value) => println!("{key} = {value}"),
                    Err(e) => println!("{key}: {e:#}"),
                }
            }
        }
        Err(e) => println!("drivers/: {e:#}"),
    }

    if let Some(domid) = domid {
        let dir = format!("/local/domain/{domid}");
        match requester.list(&dir) {
            Ok(children) => println!("{dir}/ = [{}]", children.join(", ")),
            Err(e) => println!("{dir}/: {e:#}"),
        }
    }

    if let Err(e) = requester.conn.close() {
        warn!(error = %e, "Closing the connection failed");
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    run(&args)
}
