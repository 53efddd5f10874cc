//! Readiness Bridge
//!
//! Neither the PV device handle nor a WMI session object can be waited on
//! by a select/poll loop, so each connection carries a connected pair of
//! local sockets. The transport writes a byte on one end whenever a
//! response becomes available; the other end is handed to the router as
//! the pollable descriptor and is drained one byte per receive.
//!
//! ```text
//!   send() ──► platform op ──► ResponseQueue.push ──► signal() ──┐
//!                                                                 │ 1 byte
//!   router select(fileno) ◄───────────────────────────────────────┘
//!   recv() ──► wait_and_consume() ──► ResponseQueue.pop
//! ```
//!
//! The bridge carries no payload. Bytes accumulate if it is signalled
//! more than once before a wait, so no readiness event is lost.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::Shutdown;

use crate::packet::Packet;

#[cfg(unix)]
type Endpoint = std::os::unix::net::UnixStream;
#[cfg(windows)]
type Endpoint = std::net::TcpStream;

/// Descriptor type handed to the router's multiplexed wait
#[cfg(unix)]
pub type RawDescriptor = std::os::unix::io::RawFd;
/// Descriptor type handed to the router's multiplexed wait
#[cfg(windows)]
pub type RawDescriptor = std::os::windows::io::RawSocket;

#[cfg(unix)]
fn endpoint_pair() -> io::Result<(Endpoint, Endpoint)> {
    Endpoint::pair()
}

// No socketpair(2) on Windows: emulate it over loopback TCP.
#[cfg(windows)]
fn endpoint_pair() -> io::Result<(Endpoint, Endpoint)> {
    use std::net::{Ipv4Addr, TcpListener};

    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
    let writer = Endpoint::connect(listener.local_addr()?)?;
    let (reader, peer) = listener.accept()?;
    if peer != writer.local_addr()? {
        return Err(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            "unexpected peer on readiness listener",
        ));
    }
    writer.set_nodelay(true)?;
    reader.set_nodelay(true)?;
    Ok((reader, writer))
}

/// Loopback byte-signalling channel exposing a pollable descriptor
#[derive(Debug)]
pub struct ReadinessBridge {
    /// Exposed to the router; drained by `wait_and_consume`
    reader: Endpoint,
    /// Retained for signalling
    writer: Endpoint,
    shut_down: bool,
}

impl ReadinessBridge {
    /// Create a connected endpoint pair
    ///
    /// # Errors
    ///
    /// Returns the OS error if the pair cannot be created.
    pub fn new() -> io::Result<Self> {
        let (reader, writer) = endpoint_pair()?;
        Ok(Self {
            reader,
            writer,
            shut_down: false,
        })
    }

    /// Signal that one response is ready
    ///
    /// # Errors
    ///
    /// Returns the OS error if the byte cannot be written.
    pub fn signal(&mut self) -> io::Result<()> {
        self.signal_n(1)
    }

    /// Signal `count` readiness events at once
    ///
    /// # Errors
    ///
    /// Returns the OS error if the bytes cannot be written.
    pub fn signal_n(&mut self, count: usize) -> io::Result<()> {
        self.writer.write_all(&vec![0u8; count])
    }

    /// Block until a readiness byte is available, then consume exactly one
    ///
    /// # Errors
    ///
    /// Returns `UnexpectedEof` if the bridge was shut down while waiting.
    pub fn wait_and_consume(&mut self) -> io::Result<()> {
        let mut byte = [0u8; 1];
        loop {
            match self.reader.read(&mut byte) {
                Ok(1) => return Ok(()),
                Ok(_) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "readiness bridge closed",
                    ))
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Whether a readiness byte is waiting, without consuming it
    ///
    /// # Errors
    ///
    /// Returns the OS error from the zero-timeout poll.
    #[cfg(unix)]
    pub fn is_ready(&self) -> io::Result<bool> {
        use std::os::unix::io::AsRawFd;

        let mut pfd = libc::pollfd {
            fd: self.reader.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        // SAFETY: `pfd` is a single valid pollfd for the duration of the call.
        let rc = unsafe { libc::poll(&mut pfd, 1, 0) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(rc > 0 && (pfd.revents & libc::POLLIN) != 0)
    }

    /// Whether a readiness byte is waiting, without consuming it
    ///
    /// # Errors
    ///
    /// Returns the OS error from the non-blocking peek.
    #[cfg(windows)]
    pub fn is_ready(&self) -> io::Result<bool> {
        let mut byte = [0u8; 1];
        self.reader.set_nonblocking(true)?;
        let result = self.reader.peek(&mut byte);
        self.reader.set_nonblocking(false)?;
        match result {
            Ok(n) => Ok(n > 0),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Descriptor to register with the router's select loop
    #[must_use]
    pub fn raw_descriptor(&self) -> RawDescriptor {
        #[cfg(unix)]
        {
            std::os::unix::io::AsRawFd::as_raw_fd(&self.reader)
        }
        #[cfg(windows)]
        {
            std::os::windows::io::AsRawSocket::as_raw_socket(&self.reader)
        }
    }

    /// Shut down both directions of both endpoints
    ///
    /// Wakes any thread blocked in `wait_and_consume`. Safe to call twice.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;

        for endpoint in [&self.reader, &self.writer] {
            if let Err(e) = endpoint.shutdown(Shutdown::Both) {
                // Already-disconnected endpoints report NotConnected
                if e.kind() != io::ErrorKind::NotConnected {
                    tracing::debug!(error = %e, "Readiness endpoint shutdown failed");
                }
            }
        }
    }
}

impl Drop for ReadinessBridge {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// FIFO of responses synthesized by a send, awaiting `recv`
///
/// Normally holds zero or one packet because the router alternates send
/// and recv in lock-step.
#[derive(Debug, Default)]
pub struct ResponseQueue {
    packets: VecDeque<Packet>,
}

impl ResponseQueue {
    /// Create an empty queue
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a response
    pub fn push(&mut self, packet: Packet) {
        self.packets.push_back(packet);
    }

    /// Dequeue the oldest response
    pub fn pop(&mut self) -> Option<Packet> {
        self.packets.pop_front()
    }

    /// Number of queued responses
    #[must_use]
    pub fn len(&self) -> usize {
        self.packets.len()
    }

    /// Whether the queue is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }
}

/// Per-lifetime channel between a transport and the router
///
/// Allocated by the connection, lent to the transport on each call, and
/// torn down on close.
#[derive(Debug)]
pub struct Link {
    /// Readiness signalling
    pub bridge: ReadinessBridge,
    /// Responses synthesized by send
    pub responses: ResponseQueue,
}

impl Link {
    /// Allocate a fresh bridge and empty queue
    ///
    /// # Errors
    ///
    /// Returns the OS error if the bridge cannot be created.
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            bridge: ReadinessBridge::new()?,
            responses: ResponseQueue::new(),
        })
    }

    /// Queue a response and signal readiness for it
    ///
    /// # Errors
    ///
    /// Returns the OS error if the bridge cannot be signalled.
    pub fn deliver(&mut self, packet: Packet) -> io::Result<()> {
        self.responses.push(packet);
        self.bridge.signal()
    }

    /// Wait for readiness and take the matching response
    ///
    /// # Errors
    ///
    /// Returns `ProtocolViolation` if readiness was signalled with nothing
    /// queued, or the bridge IO error.
    pub fn take(&mut self) -> Result<Packet, super::TransportError> {
        self.bridge.wait_and_consume()?;
        self.responses.pop().ok_or_else(|| {
            super::TransportError::ProtocolViolation(
                "readiness signalled but no response is queued".into(),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Op;

    #[test]
    fn test_signal_then_consume() {
        let mut bridge = ReadinessBridge::new().unwrap();
        assert!(!bridge.is_ready().unwrap());

        bridge.signal().unwrap();
        assert!(bridge.is_ready().unwrap());

        bridge.wait_and_consume().unwrap();
        assert!(!bridge.is_ready().unwrap());
    }

    #[test]
    fn test_signals_accumulate() {
        let mut bridge = ReadinessBridge::new().unwrap();
        bridge.signal().unwrap();
        bridge.signal().unwrap();
        bridge.signal_n(2).unwrap();

        for _ in 0..4 {
            assert!(bridge.is_ready().unwrap());
            bridge.wait_and_consume().unwrap();
        }
        assert!(!bridge.is_ready().unwrap());
    }

    #[test]
    fn test_wait_after_shutdown_fails() {
        let mut bridge = ReadinessBridge::new().unwrap();
        bridge.shutdown();
        bridge.shutdown();

        let err = bridge.wait_and_consume().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_queue_is_fifo() {
        let mut queue = ResponseQueue::new();
        queue.push(Packet::new(Op::Read, b"1".to_vec(), 1, 0));
        queue.push(Packet::new(Op::Read, b"2".to_vec(), 2, 0));

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop().unwrap().rq_id(), 1);
        assert_eq!(queue.pop().unwrap().rq_id(), 2);
        assert!(queue.pop().is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_link_signal_without_response_is_violation() {
        let mut link = Link::new().unwrap();
        link.bridge.signal().unwrap();

        let result = link.take();
        assert!(matches!(
            result,
            Err(crate::transport::TransportError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_link_deliver_and_take() {
        let mut link = Link::new().unwrap();
        link.deliver(Packet::new(Op::Directory, b"a\0b".to_vec(), 9, 0))
            .unwrap();
        assert!(link.bridge.is_ready().unwrap());

        let packet = link.take().unwrap();
        assert_eq!(packet.rq_id(), 9);
        assert!(!link.bridge.is_ready().unwrap());
    }
}
