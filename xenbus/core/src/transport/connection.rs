//! Connection Facade
//!
//! [`XenBusConnection`] is what a xenstore client holds. It owns the
//! readiness link, drives the lifecycle of whichever transport is active,
//! and exposes the pollable descriptor an external event loop waits on.
//!
//! ```text
//! Disconnected --connect--> Connecting --ok--> Connected --close--> Closed
//!      ^                        |                                     |
//!      +---------- error -------+                                     |
//!      +-------------------------- connect ---------------------------+
//! ```

use std::fmt;

use super::config::TransportConfig;
use super::factory::create_transport;
use super::readiness::{Link, RawDescriptor};
use super::traits::{PacketTransport, TransportError, TransportKind};
use crate::packet::Packet;

/// Lifecycle state of a [`XenBusConnection`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected (initial state, or after a failed connect)
    Disconnected,
    /// Connect in progress
    Connecting,
    /// Ready for traffic
    Connected,
    /// Closed; a later connect starts over
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// A xenstore connection over a device or session transport
pub struct XenBusConnection {
    transport: Box<dyn PacketTransport>,
    link: Option<Link>,
    state: ConnectionState,
}

impl XenBusConnection {
    /// Wrap `transport`; the readiness link is allocated immediately
    ///
    /// # Errors
    ///
    /// `Io` if the loopback endpoints cannot be created.
    pub fn new(transport: Box<dyn PacketTransport>) -> Result<Self, TransportError> {
        Ok(Self {
            transport,
            link: Some(Link::new()?),
            state: ConnectionState::Disconnected,
        })
    }

    /// Build the transport described by `config`
    ///
    /// # Errors
    ///
    /// `Unavailable` if the requested transport does not exist on this host.
    pub fn from_config(config: &TransportConfig) -> Result<Self, TransportError> {
        Self::new(create_transport(config)?)
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Which transport is active
    #[must_use]
    pub fn kind(&self) -> TransportKind {
        self.transport.kind()
    }

    /// Whether `connect` has completed
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Descriptor that becomes readable when a response is waiting
    ///
    /// `None` once the connection is closed.
    #[must_use]
    pub fn fileno(&self) -> Option<RawDescriptor> {
        self.link.as_ref().map(|link| link.bridge.raw_descriptor())
    }

    /// Whether a response is waiting, without blocking
    ///
    /// # Errors
    ///
    /// `InvalidState` if closed; `Io` if polling fails.
    pub fn is_ready(&self) -> Result<bool, TransportError> {
        let link = self
            .link
            .as_ref()
            .ok_or_else(|| TransportError::InvalidState("Connection is closed".into()))?;
        Ok(link.bridge.is_ready()?)
    }

    /// Connect the transport; a no-op if already connected
    ///
    /// # Errors
    ///
    /// Whatever the transport reports, typically `Unavailable` or
    /// `UnknownSession`. The connection is left `Disconnected`.
    pub fn connect(&mut self) -> Result<(), TransportError> {
        if self.state == ConnectionState::Connected {
            return Ok(());
        }

        self.state = ConnectionState::Connecting;
        if self.link.is_none() {
            match Link::new() {
                Ok(link) => self.link = Some(link),
                Err(e) => {
                    self.state = ConnectionState::Disconnected;
                    return Err(e.into());
                }
            }
        }

        match self.transport.connect() {
            Ok(()) => {
                self.state = ConnectionState::Connected;
                tracing::info!(transport = %self.transport.kind(), "Connected to xenstore");
                Ok(())
            }
            Err(e) => {
                self.state = ConnectionState::Disconnected;
                tracing::warn!(transport = %self.transport.kind(), error = %e, "Connect failed");
                Err(e)
            }
        }
    }

    /// Send a request, connecting first if needed
    ///
    /// # Errors
    ///
    /// `UnsupportedOperation` before anything else is touched; otherwise
    /// connect or transport errors.
    pub fn send(&mut self, packet: &Packet) -> Result<(), TransportError> {
        if !self.transport.supports(packet.op()) {
            return Err(TransportError::UnsupportedOperation(packet.op()));
        }

        if !self.is_connected() {
            tracing::debug!("Send on an unconnected transport - connecting now");
            self.connect()?;
        }

        let link = self
            .link
            .as_mut()
            .ok_or_else(|| TransportError::InvalidState("Readiness link torn down".into()))?;
        self.transport.send(packet, link)
    }

    /// Block until the response to the last request is ready, then return it
    ///
    /// # Errors
    ///
    /// `InvalidState` unless connected; transport and framing errors.
    pub fn recv(&mut self) -> Result<Packet, TransportError> {
        if self.state != ConnectionState::Connected {
            return Err(TransportError::InvalidState(format!(
                "Cannot receive while {}",
                self.state
            )));
        }

        let link = self
            .link
            .as_mut()
            .ok_or_else(|| TransportError::InvalidState("Readiness link torn down".into()))?;
        self.transport.recv(link)
    }

    /// Release transport resources and the readiness link
    ///
    /// Local teardown always happens; an error from the remote side is
    /// returned afterwards. Closing twice is a no-op.
    ///
    /// # Errors
    ///
    /// The transport's teardown error, if any.
    pub fn close(&mut self) -> Result<(), TransportError> {
        if self.state == ConnectionState::Closed {
            return Ok(());
        }

        let result = self.transport.close();
        if let Some(mut link) = self.link.take() {
            link.bridge.shutdown();
        }
        self.state = ConnectionState::Closed;

        tracing::info!(transport = %self.transport.kind(), "Connection closed");
        result
    }
}

impl fmt::Debug for XenBusConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("XenBusConnection")
            .field("transport", &self.transport.kind())
            .field("state", &self.state)
            .field("fileno", &self.fileno())
            .finish()
    }
}
