//! Frame Protocol
//!
//! Wire format used on the PV device file. The driver forwards bytes to
//! and from xenstored verbatim, so frames are plain xenstore messages.
//!
//! # Frame Format
//!
//! ```text
//! +-----------+-----------+-----------+-----------+----------------------+
//! | type (4)  | req_id(4) | tx_id (4) | len (4)   | payload (len bytes)  |
//! | LE u32    | LE u32    | LE u32    | LE u32    |                      |
//! +-----------+-----------+-----------+-----------+----------------------+
//! ```
//!
//! # Limits
//!
//! - Payloads larger than `MAX_PAYLOAD` are rejected on encode
//! - The length field is validated before a payload buffer is allocated

use crate::packet::{Op, Packet};

use super::TransportError;

/// Maximum payload size accepted by xenstored
pub const MAX_PAYLOAD: usize = 4096;

/// Frame header size: type + req_id + tx_id + len
pub const HEADER_SIZE: usize = 16;

/// Decoded frame header
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameHeader {
    /// Operation code
    pub op: Op,
    /// Request id
    pub rq_id: u32,
    /// Transaction id
    pub tx_id: u32,
    /// Payload length in bytes
    pub len: usize,
}

/// Packet encoding used by the device transport
///
/// The default is [`XenstoreCodec`]; a protocol library with its own
/// encoder can supply a different implementation.
pub trait PacketCodec {
    /// Encode the fixed-size header for `packet`
    fn encode_header(&self, packet: &Packet) -> Result<[u8; HEADER_SIZE], TransportError>;

    /// Decode a header read from the device
    fn decode_header(&self, bytes: &[u8; HEADER_SIZE]) -> Result<FrameHeader, TransportError>;
}

/// Native xenstore framing
#[derive(Clone, Copy, Debug, Default)]
pub struct XenstoreCodec;

impl PacketCodec for XenstoreCodec {
    fn encode_header(&self, packet: &Packet) -> Result<[u8; HEADER_SIZE], TransportError> {
        let len = packet.payload().len();
        if len > MAX_PAYLOAD {
            return Err(TransportError::Framing(format!(
                "Payload too large: {len} bytes (max: {MAX_PAYLOAD})"
            )));
        }

        let mut header = [0u8; HEADER_SIZE];
        header[0..4].copy_from_slice(&packet.op().code().to_le_bytes());
        header[4..8].copy_from_slice(&packet.rq_id().to_le_bytes());
        header[8..12].copy_from_slice(&packet.tx_id().to_le_bytes());
        // len <= MAX_PAYLOAD, so the cast cannot truncate
        header[12..16].copy_from_slice(&(len as u32).to_le_bytes());
        Ok(header)
    }

    fn decode_header(&self, bytes: &[u8; HEADER_SIZE]) -> Result<FrameHeader, TransportError> {
        let word = |i: usize| u32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);

        let code = word(0);
        let op = Op::try_from(code)
            .map_err(|code| TransportError::Framing(format!("Unknown operation code {code}")))?;

        let len = word(12) as usize;
        if len > MAX_PAYLOAD {
            return Err(TransportError::Framing(format!(
                "Frame size {len} exceeds maximum {MAX_PAYLOAD}"
            )));
        }

        Ok(FrameHeader {
            op,
            rq_id: word(4),
            tx_id: word(8),
            len,
        })
    }
}

/// Encode a whole packet (header followed by payload)
///
/// # Errors
///
/// Returns `TransportError::Framing` if the payload exceeds `MAX_PAYLOAD`.
pub fn encode(packet: &Packet) -> Result<Vec<u8>, TransportError> {
    let header = XenstoreCodec.encode_header(packet)?;
    let mut buf = Vec::with_capacity(HEADER_SIZE + packet.payload().len());
    buf.extend_from_slice(&header);
    buf.extend_from_slice(packet.payload());
    Ok(buf)
}

/// Incremental decoder for a byte stream of frames
///
/// Buffers incoming bytes and yields complete packets.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    /// Create an empty decoder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes to the buffer
    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Number of buffered bytes
    #[must_use]
    pub fn available(&self) -> usize {
        self.buffer.len()
    }

    /// Try to decode the next frame
    ///
    /// Returns:
    /// - `Ok(Some(packet))` if a complete frame was decoded
    /// - `Ok(None)` if more data is needed
    /// - `Err(...)` if the header is invalid
    pub fn decode(&mut self) -> Result<Option<Packet>, TransportError> {
        if self.buffer.len() < HEADER_SIZE {
            return Ok(None);
        }

        let mut raw = [0u8; HEADER_SIZE];
        raw.copy_from_slice(&self.buffer[..HEADER_SIZE]);
        let header = XenstoreCodec.decode_header(&raw)?;

        if self.buffer.len() < HEADER_SIZE + header.len {
            return Ok(None);
        }

        let payload = self.buffer[HEADER_SIZE..HEADER_SIZE + header.len].to_vec();
        self.buffer.drain(..HEADER_SIZE + header.len);

        Ok(Some(Packet::new(header.op, payload, header.rq_id, header.tx_id)))
    }
}
