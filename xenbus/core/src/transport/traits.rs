//! Transport Traits
//!
//! Core trait and error definitions shared by the device-file and session
//! transports.
//!
//! Every backend-specific failure is translated into [`TransportError`] at
//! the transport boundary, so the router never needs to know which driver
//! set is underneath.

use std::error::Error as StdError;
use std::fmt;
use std::io;

use thiserror::Error;

use super::readiness::Link;
use crate::packet::{Op, Packet};

/// Boxed cause carried inside wrapped errors
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Errors surfaced to the router by any transport
#[derive(Debug, Error)]
pub enum TransportError {
    /// The device or management backend is unreachable or cannot be opened
    #[error("Transport unavailable: {context}")]
    Unavailable {
        /// What was being attempted
        context: String,
        /// Underlying cause, if any
        #[source]
        source: Option<BoxError>,
    },

    /// The backend is reachable but the session object is gone
    #[error("No session with SessionId={session_id}")]
    UnknownSession {
        /// Id of the missing session
        session_id: u32,
        /// Last lookup failure, if the session could not be queried at all
        #[source]
        source: Option<BoxError>,
    },

    /// Operation not implemented by the active transport
    #[error("Unsupported xenstore operation {0}")]
    UnsupportedOperation(Op),

    /// A remote method call failed
    #[error("session.{call} call failed")]
    Backend {
        /// Remote method name
        call: &'static str,
        /// Backend failure
        #[source]
        source: BackendError,
    },

    /// Packet payload does not have the shape the operation requires
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    /// Wire framing error on the device transport
    #[error("Framing error: {0}")]
    Framing(String),

    /// The send/recv lock-step was broken by the caller
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// Transport not in expected state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// IO error from the raw handle or the readiness bridge
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    /// Build an `Unavailable` error with a cause
    pub fn unavailable(context: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Unavailable {
            context: context.into(),
            source: Some(source.into()),
        }
    }
}

/// Classification used by the retry policy
pub trait Transient {
    /// Whether retrying the same operation may succeed
    fn is_transient(&self) -> bool;
}

/// Category of a management-interface failure
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendErrorKind {
    /// Could not connect to the management interface
    Unreachable,
    /// An object query failed
    QueryFailed,
    /// A method call on a remote object failed
    CallFailed,
}

impl fmt::Display for BackendErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unreachable => write!(f, "unreachable"),
            Self::QueryFailed => write!(f, "query failed"),
            Self::CallFailed => write!(f, "call failed"),
        }
    }
}

/// Failure reported by a management backend
#[derive(Debug, Error)]
#[error("{kind}: {message}")]
pub struct BackendError {
    kind: BackendErrorKind,
    message: String,
    #[source]
    source: Option<BoxError>,
}

impl BackendError {
    /// Create an error without an underlying cause
    pub fn new(kind: BackendErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    /// Attach the platform error that caused this failure
    #[must_use]
    pub fn with_source(mut self, source: impl Into<BoxError>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Failure category
    #[must_use]
    pub fn kind(&self) -> BackendErrorKind {
        self.kind
    }
}

impl Transient for BackendError {
    fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            BackendErrorKind::Unreachable | BackendErrorKind::QueryFailed
        )
    }
}

/// Which driver set a transport talks to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportKind {
    /// Raw device file exposed by the GPLPV drivers
    Device,
    /// WMI sessions exposed by the WinPV drivers
    Session,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Device => write!(f, "device"),
            Self::Session => write!(f, "session"),
        }
    }
}

/// A packet-oriented transport wrapped by [`super::XenBusConnection`]
///
/// The connection owns the [`Link`] (readiness bridge and response queue)
/// and lends it to the transport on every call, so a transport never has
/// to rebuild it after `close`.
pub trait PacketTransport {
    /// Which backend this transport uses
    fn kind(&self) -> TransportKind;

    /// Whether `op` can be sent at all
    ///
    /// Checked before any lazy connect so unsupported requests never reach
    /// the backend.
    fn supports(&self, op: Op) -> bool {
        let _ = op;
        true
    }

    /// Acquire the device handle or backend session
    fn connect(&mut self) -> Result<(), TransportError>;

    /// Issue a request; its response becomes available through `link`
    fn send(&mut self, packet: &Packet, link: &mut Link) -> Result<(), TransportError>;

    /// Receive the response to the oldest outstanding request
    fn recv(&mut self, link: &mut Link) -> Result<Packet, TransportError>;

    /// Release the device handle or end the backend session
    fn close(&mut self) -> Result<(), TransportError>;
}

impl PacketTransport for Box<dyn PacketTransport> {
    fn kind(&self) -> TransportKind {
        (**self).kind()
    }

    fn supports(&self, op: Op) -> bool {
        (**self).supports(op)
    }

    fn connect(&mut self) -> Result<(), TransportError> {
        (**self).connect()
    }

    fn send(&mut self, packet: &Packet, link: &mut Link) -> Result<(), TransportError> {
        (**self).send(packet, link)
    }

    fn recv(&mut self, link: &mut Link) -> Result<Packet, TransportError> {
        (**self).recv(link)
    }

    fn close(&mut self) -> Result<(), TransportError> {
        (**self).close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_display() {
        let err = TransportError::UnknownSession {
            session_id: 3,
            source: None,
        };
        assert_eq!(err.to_string(), "No session with SessionId=3");

        let err = TransportError::UnsupportedOperation(Op::Watch);
        assert!(err.to_string().contains("WATCH"));

        let io_err = io::Error::new(io::ErrorKind::NotFound, "not found");
        let err = TransportError::from(io_err);
        assert!(err.to_string().contains("IO error"));
    }

    #[test]
    fn test_backend_error_keeps_cause() {
        let cause = io::Error::new(io::ErrorKind::Other, "RPC server unavailable");
        let err = TransportError::Backend {
            call: "GetValue",
            source: BackendError::new(BackendErrorKind::CallFailed, "GetValue").with_source(cause),
        };

        assert_eq!(err.to_string(), "session.GetValue call failed");
        let backend = err.source().unwrap();
        let platform = backend.source().unwrap();
        assert_eq!(platform.to_string(), "RPC server unavailable");
    }

    #[test]
    fn test_backend_error_transience() {
        assert!(BackendError::new(BackendErrorKind::Unreachable, "x").is_transient());
        assert!(BackendError::new(BackendErrorKind::QueryFailed, "x").is_transient());
        assert!(!BackendError::new(BackendErrorKind::CallFailed, "x").is_transient());
    }
}
