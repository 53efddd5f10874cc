//! TOML Configuration File Support
//!
//! Loads transport settings from `~/.config/xenbus/xenbus.toml` (or the
//! platform's equivalent config directory).
//!
//! # Configuration Priority
//!
//! Configuration values are loaded with the following priority (highest first):
//! 1. CLI arguments (when applicable)
//! 2. Environment variables
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [transport]
//! type = "device"
//! device_path = "\\\\?\\pci#ven_5853&dev_0001"
//! session_name = "PyxsSession"
//! connect_attempts = 21
//! connect_delay_ms = 2000
//! lookup_attempts = 2
//! lookup_delay_ms = 500
//! ```

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::transport::config::{TransportConfig, TransportType};

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Tracks where the effective configuration came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// `[transport]` section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportToml {
    /// "device"/"gplpv" or "session"/"wmi"
    #[serde(rename = "type")]
    pub kind: Option<String>,

    /// Explicit device path
    pub device_path: Option<String>,

    /// Session name passed to `AddSession`
    pub session_name: Option<String>,

    /// Management connection attempts
    pub connect_attempts: Option<u32>,

    /// Delay between connection attempts in milliseconds
    pub connect_delay_ms: Option<u64>,

    /// Session lookup attempts
    pub lookup_attempts: Option<u32>,

    /// Delay between lookup attempts in milliseconds
    pub lookup_delay_ms: Option<u64>,
}

/// Root of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct XenbusToml {
    /// Transport settings
    pub transport: TransportToml,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Effective configuration after merging every source
#[derive(Clone, Debug)]
pub struct XenbusConfigFile {
    /// Transport configuration
    pub transport: TransportConfig,

    /// File the configuration was read from, if any
    pub config_file_path: Option<PathBuf>,

    source: ConfigSource,
}

impl Default for XenbusConfigFile {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl XenbusConfigFile {
    /// Highest-priority source that contributed a value
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Check the merged values
    ///
    /// # Errors
    ///
    /// `ValidationError` if an attempt count is zero or the session name is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = &self.transport;
        if t.connect_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "connect_attempts must be at least 1".into(),
            ));
        }
        if t.lookup_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "lookup_attempts must be at least 1".into(),
            ));
        }
        if t.session_name.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "session_name must not be empty".into(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Default configuration file location
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("xenbus").join("xenbus.toml"))
}

/// Load configuration from the default path, then the environment
///
/// # Errors
///
/// See [`load_config_from_path`].
pub fn load_config() -> Result<XenbusConfigFile, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from `path` (if it exists), then the environment
///
/// A missing file is not an error.
///
/// # Errors
///
/// `ReadError` or `ParseError` for an unreadable file, `ValidationError`
/// if the merged values are invalid.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<XenbusConfigFile, ConfigError> {
    load_with_vars(path, |name| std::env::var(name).ok())
}

fn load_with_vars<F>(path: Option<PathBuf>, var: F) -> Result<XenbusConfigFile, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = XenbusConfigFile::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: XenbusToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config)?;
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    let before = config.transport.clone();
    config.transport.apply_vars(var);
    if config.transport != before {
        config.source = ConfigSource::Env;
    }

    config.validate()?;
    Ok(config)
}

fn apply_toml_config(config: &mut XenbusConfigFile, toml: &XenbusToml) -> Result<(), ConfigError> {
    let t = &toml.transport;

    if let Some(ref kind) = t.kind {
        config.transport.transport = TransportType::from_name(kind, t.device_path.clone())
            .ok_or_else(|| ConfigError::ValidationError(format!("Unknown transport type {kind:?}")))?;
    } else if let (TransportType::Device { path }, Some(p)) =
        (&mut config.transport.transport, &t.device_path)
    {
        *path = Some(p.clone());
    }

    if let Some(ref name) = t.session_name {
        config.transport.session_name = name.clone();
    }
    if let Some(attempts) = t.connect_attempts {
        config.transport.connect_attempts = attempts;
    }
    if let Some(delay) = t.connect_delay_ms {
        config.transport.connect_delay_ms = delay;
    }
    if let Some(attempts) = t.lookup_attempts {
        config.transport.lookup_attempts = attempts;
    }
    if let Some(delay) = t.lookup_delay_ms {
        config.transport.lookup_delay_ms = delay;
    }
    Ok(())
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Command-line overrides, applied after [`load_config`]
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Transport override
    pub transport: Option<TransportType>,

    /// Device path override
    pub device_path: Option<String>,

    /// Session name override
    pub session_name: Option<String>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set transport override
    #[must_use]
    pub fn with_transport(mut self, transport: TransportType) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Set device path override
    #[must_use]
    pub fn with_device_path(mut self, path: String) -> Self {
        self.device_path = Some(path);
        self
    }

    /// Set session name override
    #[must_use]
    pub fn with_session_name(mut self, name: String) -> Self {
        self.session_name = Some(name);
        self
    }

    /// Apply overrides to a configuration
    ///
    /// A device path alone switches to the device transport.
    ///
    /// # Errors
    ///
    /// `ValidationError` if the result is invalid.
    pub fn apply(&self, config: &mut XenbusConfigFile) -> Result<(), ConfigError> {
        if self.transport.is_some() || self.device_path.is_some() || self.session_name.is_some() {
            config.source = ConfigSource::Cli;
        }

        if let Some(ref transport) = self.transport {
            let keeps_path = matches!(transport, TransportType::Device { path: None })
                && matches!(config.transport.transport, TransportType::Device { path: Some(_) });
            if !keeps_path {
                config.transport.transport = transport.clone();
            }
        }

        if let Some(ref path) = self.device_path {
            let explicit = self.transport.is_some();
            match config.transport.transport {
                TransportType::Device { path: ref mut current } => *current = Some(path.clone()),
                TransportType::Session if !explicit => {
                    config.transport.transport = TransportType::Device {
                        path: Some(path.clone()),
                    };
                }
                TransportType::Session => {
                    tracing::warn!(path = %path, "Device path ignored for the session transport");
                }
            }
        }

        if let Some(ref name) = self.session_name {
            config.transport.session_name = name.clone();
        }

        config.validate()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_default_config() {
        let config = XenbusConfigFile::default();

        assert_eq!(config.transport, TransportConfig::default());
        assert_eq!(config.source(), ConfigSource::Default);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_config_path() {
        if let Some(p) = default_config_path() {
            assert!(p.ends_with("xenbus/xenbus.toml"));
        }
    }

    #[test]
    fn test_apply_full_toml() {
        let toml_config: XenbusToml = toml::from_str(
            r#"
[transport]
type = "gplpv"
device_path = "/dev/xen/xenbus"
session_name = "Probe"
connect_attempts = 5
connect_delay_ms = 100
lookup_attempts = 3
lookup_delay_ms = 50
"#,
        )
        .unwrap();

        let mut config = XenbusConfigFile::default();
        apply_toml_config(&mut config, &toml_config).unwrap();

        assert_eq!(
            config.transport.transport,
            TransportType::Device {
                path: Some("/dev/xen/xenbus".into())
            }
        );
        assert_eq!(config.transport.session_name, "Probe");
        assert_eq!(config.transport.connect_attempts, 5);
        assert_eq!(config.transport.connect_delay_ms, 100);
        assert_eq!(config.transport.lookup_attempts, 3);
        assert_eq!(config.transport.lookup_delay_ms, 50);
    }

    #[test]
    fn test_apply_partial_toml_keeps_defaults() {
        let toml_config: XenbusToml = toml::from_str("[transport]\nlookup_delay_ms = 250\n").unwrap();

        let mut config = XenbusConfigFile::default();
        apply_toml_config(&mut config, &toml_config).unwrap();

        assert_eq!(config.transport.transport, TransportType::Session);
        assert_eq!(config.transport.lookup_delay_ms, 250);
        assert_eq!(config.transport.connect_attempts, 21);
    }

    #[test]
    fn test_unknown_transport_type() {
        let toml_config: XenbusToml = toml::from_str("[transport]\ntype = \"pipe\"\n").unwrap();

        let mut config = XenbusConfigFile::default();
        let result = apply_toml_config(&mut config, &toml_config);
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_parse_invalid_toml() {
        let file = write_config("[transport\nsession_name = ");
        let result = load_config_from_path(Some(file.path().to_path_buf()));
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config_from_path(Some(dir.path().join("absent.toml"))).unwrap();
        assert!(config.config_file_path.is_none());
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let mut config = XenbusConfigFile::default();
        config.transport.connect_attempts = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(msg)) if msg.contains("connect_attempts")
        ));

        let mut config = XenbusConfigFile::default();
        config.transport.lookup_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_session_name_rejected() {
        let mut config = XenbusConfigFile::default();
        config.transport.session_name = "  ".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_overrides() {
        let mut config = XenbusConfigFile::default();
        ConfigOverrides::new()
            .with_device_path("/dev/xen/xenbus".into())
            .with_session_name("cli".into())
            .apply(&mut config)
            .unwrap();

        assert_eq!(config.source(), ConfigSource::Cli);
        assert_eq!(
            config.transport.transport,
            TransportType::Device {
                path: Some("/dev/xen/xenbus".into())
            }
        );
        assert_eq!(config.transport.session_name, "cli");
    }

    #[test]
    fn test_explicit_session_override_ignores_path() {
        let mut config = XenbusConfigFile::default();
        ConfigOverrides::new()
            .with_transport(TransportType::Session)
            .with_device_path("/dev/xen/xenbus".into())
            .apply(&mut config)
            .unwrap();

        assert_eq!(config.transport.transport, TransportType::Session);
    }

    #[test]
    fn test_empty_overrides_keep_source() {
        let mut config = XenbusConfigFile::default();
        ConfigOverrides::new().apply(&mut config).unwrap();
        assert_eq!(config.source(), ConfigSource::Default);
    }

    #[test]
    fn test_env_transport_keeps_file_device_path() {
        let file = write_config("[transport]\ntype = \"device\"\ndevice_path = \"/dev/xen/xenbus\"\n");
        let env = |name: &str| (name == "XENBUS_TRANSPORT").then(|| "device".to_string());

        let config = load_with_vars(Some(file.path().to_path_buf()), env).unwrap();

        assert_eq!(
            config.transport.transport,
            TransportType::Device {
                path: Some("/dev/xen/xenbus".into())
            }
        );
        assert_eq!(config.source(), ConfigSource::File);
    }

    #[test]
    fn test_env_session_overrides_file_device() {
        let file = write_config("[transport]\ntype = \"device\"\ndevice_path = \"/dev/xen/xenbus\"\n");
        let env = |name: &str| (name == "XENBUS_TRANSPORT").then(|| "wmi".to_string());

        let config = load_with_vars(Some(file.path().to_path_buf()), env).unwrap();

        assert_eq!(config.transport.transport, TransportType::Session);
        assert_eq!(config.source(), ConfigSource::Env);
    }

    #[test]
    fn test_cli_transport_keeps_file_device_path() {
        let file = write_config("[transport]\ntype = \"device\"\ndevice_path = \"/dev/xen/xenbus\"\n");
        let mut config = load_with_vars(Some(file.path().to_path_buf()), |_: &str| None).unwrap();

        ConfigOverrides::new()
            .with_transport(TransportType::Device { path: None })
            .apply(&mut config)
            .unwrap();

        assert_eq!(
            config.transport.transport,
            TransportType::Device {
                path: Some("/dev/xen/xenbus".into())
            }
        );
    }
}
