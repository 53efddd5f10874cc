//! Transport Factory
//!
//! Builds the transport named by a [`TransportConfig`]. Only the pieces
//! that exist on the current host are compiled in; asking for anything
//! else yields `TransportError::Unavailable`.

use super::config::{TransportConfig, TransportType};
use super::device::{DeviceTransport, FixedPathPlatform};
use super::traits::{PacketTransport, TransportError};

/// Create a packet transport based on configuration
///
/// # Errors
///
/// Returns `TransportError::Unavailable` if:
/// - the device transport is requested without a path on a host that has
///   no interface enumeration
/// - the session transport is requested on a host without WMI
pub fn create_transport(
    config: &TransportConfig,
) -> Result<Box<dyn PacketTransport>, TransportError> {
    match &config.transport {
        TransportType::Device { path: Some(path) } => {
            tracing::debug!(path = %path, "Using device transport with fixed path");
            Ok(Box::new(DeviceTransport::new(FixedPathPlatform::new(path))))
        }

        #[cfg(windows)]
        TransportType::Device { path: None } => Ok(Box::new(DeviceTransport::new(
            super::device::SetupApiPlatform,
        ))),

        #[cfg(not(windows))]
        TransportType::Device { path: None } => Err(TransportError::Unavailable {
            context: "Device discovery requires Windows; set a device path".into(),
            source: None,
        }),

        #[cfg(windows)]
        TransportType::Session => Ok(Box::new(super::session::SessionTransport::new(
            super::session::wmi::WmiBackend,
            config.session_settings(),
        ))),

        #[cfg(not(windows))]
        TransportType::Session => Err(TransportError::Unavailable {
            context: "Session transport requires the WinPV WMI provider".into(),
            source: None,
        }),
    }
}
