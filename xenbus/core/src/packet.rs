//! Xenstore Packets
//!
//! The unit exchanged between the router and a transport. The wire encoding
//! of a packet belongs to the protocol layer (see [`crate::transport::frame`]
//! for the device-file framing); transports only look at `op` and `payload`
//! and echo `rq_id`/`tx_id` back in the response.

use std::fmt;

use crate::transport::TransportError;

/// Separator used inside WRITE and DIRECTORY payloads
pub const NUL: u8 = 0;

/// Payload returned for operations that have no result of their own
pub const SUCCESS_MARKER: &[u8] = b"OK";

/// Xenstore operation codes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Op {
    /// Debug request
    Debug = 0,
    /// List the children of a node
    Directory = 1,
    /// Read a node's value
    Read = 2,
    /// Read a node's permissions
    GetPerms = 3,
    /// Register a watch
    Watch = 4,
    /// Remove a watch
    Unwatch = 5,
    /// Begin a transaction
    TransactionStart = 6,
    /// Commit or abort a transaction
    TransactionEnd = 7,
    /// Introduce a domain
    Introduce = 8,
    /// Release a domain
    Release = 9,
    /// Ask for a domain's home path
    GetDomainPath = 10,
    /// Write a node's value
    Write = 11,
    /// Create a node
    Mkdir = 12,
    /// Remove a node
    Rm = 13,
    /// Set a node's permissions
    SetPerms = 14,
    /// Watch fired (server to client)
    WatchEvent = 15,
    /// Error reply (server to client)
    Error = 16,
    /// Query whether a domain was introduced
    IsDomainIntroduced = 17,
    /// Resume a domain
    Resume = 18,
    /// Set a domain's target
    SetTarget = 19,
    /// Reset watches
    Reset = 21,
}

impl Op {
    /// Numeric wire code
    #[must_use]
    pub fn code(self) -> u32 {
        self as u32
    }
}

impl TryFrom<u32> for Op {
    type Error = u32;

    fn try_from(code: u32) -> Result<Self, u32> {
        let op = match code {
            0 => Self::Debug,
            1 => Self::Directory,
            2 => Self::Read,
            3 => Self::GetPerms,
            4 => Self::Watch,
            5 => Self::Unwatch,
            6 => Self::TransactionStart,
            7 => Self::TransactionEnd,
            8 => Self::Introduce,
            9 => Self::Release,
            10 => Self::GetDomainPath,
            11 => Self::Write,
            12 => Self::Mkdir,
            13 => Self::Rm,
            14 => Self::SetPerms,
            15 => Self::WatchEvent,
            16 => Self::Error,
            17 => Self::IsDomainIntroduced,
            18 => Self::Resume,
            19 => Self::SetTarget,
            21 => Self::Reset,
            other => return Err(other),
        };
        Ok(op)
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Debug => "DEBUG",
            Self::Directory => "DIRECTORY",
            Self::Read => "READ",
            Self::GetPerms => "GET_PERMS",
            Self::Watch => "WATCH",
            Self::Unwatch => "UNWATCH",
            Self::TransactionStart => "TRANSACTION_START",
            Self::TransactionEnd => "TRANSACTION_END",
            Self::Introduce => "INTRODUCE",
            Self::Release => "RELEASE",
            Self::GetDomainPath => "GET_DOMAIN_PATH",
            Self::Write => "WRITE",
            Self::Mkdir => "MKDIR",
            Self::Rm => "RM",
            Self::SetPerms => "SET_PERMS",
            Self::WatchEvent => "WATCH_EVENT",
            Self::Error => "ERROR",
            Self::IsDomainIntroduced => "IS_DOMAIN_INTRODUCED",
            Self::Resume => "RESUME",
            Self::SetTarget => "SET_TARGET",
            Self::Reset => "RESET_WATCHES",
        };
        write!(f, "{name}({})", self.code())
    }
}

/// A single xenstore request or response
///
/// Immutable once built: transports read `op` and `payload` and copy the
/// identifiers into the response with [`Packet::reply_to`].
#[derive(Clone, PartialEq, Eq)]
pub struct Packet {
    op: Op,
    payload: Vec<u8>,
    rq_id: u32,
    tx_id: u32,
}

impl Packet {
    /// Create a packet
    pub fn new(op: Op, payload: impl Into<Vec<u8>>, rq_id: u32, tx_id: u32) -> Self {
        Self {
            op,
            payload: payload.into(),
            rq_id,
            tx_id,
        }
    }

    /// Build the response to `request`, echoing its op and identifiers
    pub fn reply_to(request: &Packet, payload: impl Into<Vec<u8>>) -> Self {
        Self::new(request.op, payload, request.rq_id, request.tx_id)
    }

    /// Operation code
    #[must_use]
    pub fn op(&self) -> Op {
        self.op
    }

    /// Raw payload bytes
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Request id chosen by the router
    #[must_use]
    pub fn rq_id(&self) -> u32 {
        self.rq_id
    }

    /// Transaction id (0 outside a transaction)
    #[must_use]
    pub fn tx_id(&self) -> u32 {
        self.tx_id
    }

    /// Consume the packet, returning its payload
    #[must_use]
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("op", &self.op)
            .field("payload", &String::from_utf8_lossy(&self.payload))
            .field("rq_id", &self.rq_id)
            .field("tx_id", &self.tx_id)
            .finish()
    }
}

/// Decode a path payload, dropping one trailing NUL if present
///
/// # Errors
///
/// Returns `TransportError::MalformedPayload` if the path is not UTF-8.
pub fn path_from_payload(payload: &[u8]) -> Result<&str, TransportError> {
    let trimmed = payload.strip_suffix(&[NUL]).unwrap_or(payload);
    std::str::from_utf8(trimmed)
        .map_err(|e| TransportError::MalformedPayload(format!("path is not UTF-8: {e}")))
}

/// Split a WRITE payload into `(path, value)` at the first NUL
///
/// # Errors
///
/// Returns `TransportError::MalformedPayload` if there is no separator or
/// either half is not UTF-8.
pub fn split_write_payload(payload: &[u8]) -> Result<(&str, &str), TransportError> {
    let split = payload
        .iter()
        .position(|&b| b == NUL)
        .ok_or_else(|| TransportError::MalformedPayload("WRITE payload has no NUL separator".into()))?;

    let path = std::str::from_utf8(&payload[..split])
        .map_err(|e| TransportError::MalformedPayload(format!("path is not UTF-8: {e}")))?;
    let value = std::str::from_utf8(&payload[split + 1..])
        .map_err(|e| TransportError::MalformedPayload(format!("value is not UTF-8: {e}")))?;

    Ok((path, value))
}

/// Join child names with single NUL separators (no trailing NUL)
#[must_use]
pub fn join_children<S: AsRef<str>>(children: &[S]) -> Vec<u8> {
    let mut out = Vec::new();
    for (i, child) in children.iter().enumerate() {
        if i > 0 {
            out.push(NUL);
        }
        out.extend_from_slice(child.as_ref().as_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_code_roundtrip() {
        for code in 0..=21 {
            if let Ok(op) = Op::try_from(code) {
                assert_eq!(op.code(), code);
            }
        }
        assert_eq!(Op::try_from(20), Err(20));
        assert_eq!(Op::try_from(99), Err(99));
    }

    #[test]
    fn test_op_display() {
        assert_eq!(Op::Rm.to_string(), "RM(13)");
        assert_eq!(Op::Directory.to_string(), "DIRECTORY(1)");
    }

    #[test]
    fn test_reply_echoes_identifiers() {
        let request = Packet::new(Op::Read, b"vm".to_vec(), 7, 3);
        let reply = Packet::reply_to(&request, b"/vm/abc".to_vec());

        assert_eq!(reply.op(), Op::Read);
        assert_eq!(reply.rq_id(), 7);
        assert_eq!(reply.tx_id(), 3);
        assert_eq!(reply.payload(), b"/vm/abc");
    }

    #[test]
    fn test_split_write_payload() {
        assert_eq!(
            split_write_payload(b"data/key\0value").unwrap(),
            ("data/key", "value")
        );
        // Only the first NUL separates
        assert_eq!(split_write_payload(b"a\0b\0c").unwrap(), ("a", "b\0c"));
        assert_eq!(split_write_payload(b"a\0").unwrap(), ("a", ""));
    }

    #[test]
    fn test_split_write_payload_without_separator() {
        let result = split_write_payload(b"no-separator");
        assert!(matches!(result, Err(TransportError::MalformedPayload(_))));
    }

    #[test]
    fn test_path_from_payload_strips_one_nul() {
        assert_eq!(path_from_payload(b"domid\0").unwrap(), "domid");
        assert_eq!(path_from_payload(b"domid").unwrap(), "domid");
        assert!(matches!(
            path_from_payload(&[0xff, 0xfe]),
            Err(TransportError::MalformedPayload(_))
        ));
    }

    #[test]
    fn test_join_children() {
        assert_eq!(join_children(&["a", "b", "c"]), b"a\0b\0c".to_vec());
        assert_eq!(join_children::<&str>(&[]), Vec::<u8>::new());
        assert_eq!(join_children(&["only"]), b"only".to_vec());
    }
}
