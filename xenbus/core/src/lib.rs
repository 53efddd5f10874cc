//! Xenbus Core - Xenstore Transports for Windows Guests
//!
//! A Windows guest on Xen reaches xenstore through whichever paravirtual
//! driver set is installed. This crate hides that choice behind one
//! packet-oriented connection that an external xenstore client (the
//! "router") can drive from its own event loop.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                    Router / xenstore client                     │
//! │         send(Packet) ─┐        poll(fileno) ┌─ recv() -> Packet │
//! └───────────────────────┼─────────────────────┼──────────────────┘
//!                         │                     │
//! ┌───────────────────────┼─────────────────────┼──────────────────┐
//! │                  XenBusConnection (facade)                      │
//! │        Link = ReadinessBridge (loopback pair) + ResponseQueue  │
//! │  ┌──────────────────────────┐   ┌───────────────────────────┐  │
//! │  │      DeviceTransport     │   │     SessionTransport      │  │
//! │  │  GPLPV xenbus device file│   │  WinPV WMI session object │  │
//! │  │  (SetupAPI discovery)    │   │  (bounded RetryPolicy)    │  │
//! │  └──────────────────────────┘   └───────────────────────────┘  │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`Packet`]: one xenstore request or response
//! - [`XenBusConnection`]: lifecycle facade with a pollable descriptor
//! - [`DeviceTransport`]: raw device-file transport
//! - [`SessionTransport`]: management-interface session transport
//! - [`RetryPolicy`]: bounded retry around flaky backend calls
//!
//! # Quick Start
//!
//! ```ignore
//! use xenbus_core::{load_config, Op, Packet, XenBusConnection};
//!
//! let config = load_config()?;
//! let mut conn = XenBusConnection::from_config(&config.transport)?;
//!
//! conn.send(&Packet::new(Op::Read, b"domid\0".to_vec(), 1, 0))?;
//! let reply = conn.recv()?;
//! println!("{}", String::from_utf8_lossy(reply.payload()));
//!
//! conn.close()?;
//! ```
//!
//! # Module Overview
//!
//! - [`packet`]: operation codes, packets and payload helpers
//! - [`transport`]: transports, readiness bridge, retry and framing
//! - [`config`]: TOML and environment configuration

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod packet;
pub mod transport;

// Re-exports for convenience
pub use packet::{Op, Packet, SUCCESS_MARKER};
pub use transport::{
    ConnectionState, DeviceTransport, PacketTransport, RetryPolicy, SessionTransport,
    TransportConfig, TransportError, TransportKind, TransportType, XenBusConnection,
};

// Config exports
pub use config::{
    default_config_path, load_config, load_config_from_path, ConfigError, ConfigOverrides,
    ConfigSource, XenbusConfigFile, XenbusToml,
};
