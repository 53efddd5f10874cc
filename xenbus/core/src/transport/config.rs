//! Transport Configuration
//!
//! Configuration types for selecting and tuning a transport.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::retry::RetryPolicy;
use super::session::{SessionSettings, DEFAULT_SESSION_NAME};

/// Transport type selection
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportType {
    /// Raw device file (GPLPV drivers)
    Device {
        /// Device path (None = discover by interface class)
        #[serde(default)]
        path: Option<String>,
    },

    /// WMI sessions (WinPV drivers)
    ///
    /// The default; the newer driver set.
    #[default]
    Session,
}

impl TransportType {
    /// Parse a transport name, case-insensitively
    ///
    /// Accepts "device"/"gplpv" and "session"/"wmi"; `path` is only used
    /// for the device transport.
    #[must_use]
    pub fn from_name(name: &str, path: Option<String>) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "device" | "gplpv" => Some(Self::Device { path }),
            "session" | "wmi" => Some(Self::Session),
            _ => None,
        }
    }
}

/// Transport configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Which transport to use
    pub transport: TransportType,

    /// Name passed to `AddSession`
    pub session_name: String,

    /// Management connection attempts, including the first
    pub connect_attempts: u32,

    /// Delay between management connection attempts in milliseconds
    pub connect_delay_ms: u64,

    /// Session lookup attempts, including the first
    pub lookup_attempts: u32,

    /// Delay between session lookup attempts in milliseconds
    pub lookup_delay_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            transport: TransportType::default(),
            session_name: DEFAULT_SESSION_NAME.to_string(),
            connect_attempts: 21,
            connect_delay_ms: 2000,
            lookup_attempts: 2,
            lookup_delay_ms: 500,
        }
    }
}

impl TransportConfig {
    /// Configuration for the device transport
    #[must_use]
    pub fn device(path: Option<String>) -> Self {
        Self {
            transport: TransportType::Device { path },
            ..Default::default()
        }
    }

    /// Configuration for the session transport
    #[must_use]
    pub fn session() -> Self {
        Self {
            transport: TransportType::Session,
            ..Default::default()
        }
    }

    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `XENBUS_TRANSPORT`: "device", "gplpv", "session", "wmi"
    /// - `XENBUS_DEVICE_PATH`: Explicit device path (device transport)
    /// - `XENBUS_SESSION_NAME`: Session name (session transport)
    /// - `XENBUS_CONNECT_ATTEMPTS`: Management connection attempts
    /// - `XENBUS_CONNECT_DELAY_MS`: Delay between connection attempts
    /// - `XENBUS_LOOKUP_ATTEMPTS`: Session lookup attempts
    /// - `XENBUS_LOOKUP_DELAY_MS`: Delay between lookup attempts
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Overlay any `XENBUS_*` variables that are set onto `self`
    pub fn apply_env(&mut self) {
        self.apply_vars(|name| std::env::var(name).ok());
    }

    /// Overlay `XENBUS_*` values looked up through `var`
    ///
    /// Each variable overrides only its own field. Naming the device
    /// transport without a path keeps a path that is already configured.
    pub fn apply_vars<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let device_path = var("XENBUS_DEVICE_PATH");
        match var("XENBUS_TRANSPORT") {
            Some(name) => match TransportType::from_name(&name, device_path) {
                Some(TransportType::Device { path: None })
                    if matches!(self.transport, TransportType::Device { path: Some(_) }) => {}
                Some(transport) => self.transport = transport,
                None => tracing::warn!(value = %name, "Ignoring unknown XENBUS_TRANSPORT"),
            },
            None => {
                if let (TransportType::Device { path }, Some(p)) = (&mut self.transport, device_path) {
                    *path = Some(p);
                }
            }
        }

        if let Some(name) = var("XENBUS_SESSION_NAME") {
            self.session_name = name;
        }
        if let Some(v) = parse_number(&var, "XENBUS_CONNECT_ATTEMPTS") {
            self.connect_attempts = v;
        }
        if let Some(v) = parse_number(&var, "XENBUS_CONNECT_DELAY_MS") {
            self.connect_delay_ms = v;
        }
        if let Some(v) = parse_number(&var, "XENBUS_LOOKUP_ATTEMPTS") {
            self.lookup_attempts = v;
        }
        if let Some(v) = parse_number(&var, "XENBUS_LOOKUP_DELAY_MS") {
            self.lookup_delay_ms = v;
        }
    }

    /// Retry policy for management connections
    #[must_use]
    pub fn connect_retry(&self) -> RetryPolicy {
        RetryPolicy::fixed(
            self.connect_attempts,
            Duration::from_millis(self.connect_delay_ms),
        )
    }

    /// Retry policy for session lookup
    #[must_use]
    pub fn lookup_retry(&self) -> RetryPolicy {
        RetryPolicy::fixed(
            self.lookup_attempts,
            Duration::from_millis(self.lookup_delay_ms),
        )
    }

    /// Session transport settings derived from this configuration
    #[must_use]
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            name: self.session_name.clone(),
            connect_retry: self.connect_retry(),
            lookup_retry: self.lookup_retry(),
        }
    }
}

fn parse_number<T, F>(var: &F, name: &str) -> Option<T>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = var(name)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(variable = name, value = %raw, "Ignoring non-numeric value");
            None
        }
    }
}
