//! Device-File Transport
//!
//! Talks to xenstore through the PCI device exposed by the GPLPV drivers.
//! The device behaves like the Linux xenbus node: a file that accepts
//! request frames and yields response frames. It can only be opened
//! through the Windows file APIs and cannot be polled, so readiness is
//! reported through the connection's [`ReadinessBridge`].
//!
//! # Discovery
//!
//! The device path is found by enumerating interfaces of class
//! [`XENBUS_INTERFACE_GUID`]. Discovery is expensive, so the first result
//! is kept in a process-wide [`DevicePathCache`] and reused by every
//! enumerating transport afterwards. A configured path never goes through
//! the cache.
//!
//! # Notification cadence
//!
//! The driver handshake expects readiness to lag by one full round trip:
//! the `notify` flag toggles on every raw send, and only every second send
//! signals the bridge. A packet is written as two sends (header, then
//! payload) so each packet produces one notification of
//! [`READS_PER_PACKET`] bytes, which the header read and the payload read
//! of the matching receive consume one byte each.

#[cfg(windows)]
mod setupapi;

use std::fs::OpenOptions;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::OnceLock;

use parking_lot::Mutex;

use super::frame::{PacketCodec, XenstoreCodec, HEADER_SIZE};
use super::readiness::{Link, ReadinessBridge};
use super::traits::{PacketTransport, TransportError, TransportKind};
use crate::packet::Packet;

#[cfg(windows)]
pub use setupapi::SetupApiPlatform;

/// Interface class registered by the GPLPV xenbus driver
pub const XENBUS_INTERFACE_GUID: &str = "{14ce175a-3ee2-4fae-9252-00dbd84f018e}";

/// Bridge bytes consumed by one packet receive (header read + payload read)
pub const READS_PER_PACKET: usize = 2;

/// A bidirectional raw handle to the device
pub trait RawDevice: Read + Write {}

impl<T: Read + Write> RawDevice for T {}

/// Platform seam for locating and opening the device
pub trait DevicePlatform {
    /// Resolve the device path
    ///
    /// For caching platforms, only called when the path cache is empty.
    fn discover(&self) -> Result<String, TransportError>;

    /// Whether `discover` results belong in the shared path cache
    ///
    /// Platforms that enumerate return `true`. A platform bound to one
    /// known path returns `false` so it always opens its own path.
    fn caches_discovery(&self) -> bool {
        true
    }

    /// Open a read/write handle to `path`
    fn open(&self, path: &str) -> io::Result<Box<dyn RawDevice>>;
}

impl<P: DevicePlatform + ?Sized> DevicePlatform for Box<P> {
    fn discover(&self) -> Result<String, TransportError> {
        (**self).discover()
    }

    fn caches_discovery(&self) -> bool {
        (**self).caches_discovery()
    }

    fn open(&self, path: &str) -> io::Result<Box<dyn RawDevice>> {
        (**self).open(path)
    }
}

/// Open `path` for exclusive read/write access
///
/// # Errors
///
/// Returns the OS error (access denied, sharing violation, not found, ...).
pub fn open_exclusive(path: &str) -> io::Result<Box<dyn RawDevice>> {
    let mut options = OpenOptions::new();
    options.read(true).write(true);

    #[cfg(windows)]
    {
        use std::os::windows::fs::OpenOptionsExt;
        options.share_mode(0);
    }

    Ok(Box::new(options.open(path)?))
}

/// Device at a known path, skipping interface enumeration
///
/// Used when the path is configured explicitly, or on hosts that expose a
/// xenbus node at a fixed location.
#[derive(Clone, Debug)]
pub struct FixedPathPlatform {
    path: PathBuf,
}

impl FixedPathPlatform {
    /// Use `path` as the device
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl DevicePlatform for FixedPathPlatform {
    fn discover(&self) -> Result<String, TransportError> {
        self.path
            .to_str()
            .map(str::to_owned)
            .ok_or_else(|| TransportError::Unavailable {
                context: format!("Device path {:?} is not valid Unicode", self.path),
                source: None,
            })
    }

    fn caches_discovery(&self) -> bool {
        false
    }

    fn open(&self, path: &str) -> io::Result<Box<dyn RawDevice>> {
        open_exclusive(path)
    }
}

/// Once-initialized device path shared by all device transports
///
/// A failed discovery leaves the cache empty so a later connect can try
/// again; a successful one is never invalidated.
#[derive(Debug)]
pub struct DevicePathCache {
    path: OnceLock<String>,
    discovery: Mutex<()>,
}

impl DevicePathCache {
    /// Create an empty cache
    #[must_use]
    pub const fn new() -> Self {
        Self {
            path: OnceLock::new(),
            discovery: parking_lot::const_mutex(()),
        }
    }

    /// The cached path, if discovery already succeeded
    #[must_use]
    pub fn get(&self) -> Option<&str> {
        self.path.get().map(String::as_str)
    }

    /// Return the cached path, running `discover` first if it is empty
    ///
    /// Concurrent first calls are serialized; only one runs `discover`.
    ///
    /// # Errors
    ///
    /// Propagates the discovery error; the cache stays empty.
    pub fn get_or_discover<F>(&self, discover: F) -> Result<&str, TransportError>
    where
        F: FnOnce() -> Result<String, TransportError>,
    {
        if let Some(path) = self.get() {
            return Ok(path);
        }

        let _guard = self.discovery.lock();
        if let Some(path) = self.get() {
            return Ok(path);
        }

        let path = discover()?;
        tracing::info!(path = %path, "Discovered xenbus device");
        Ok(self.path.get_or_init(|| path).as_str())
    }
}

impl Default for DevicePathCache {
    fn default() -> Self {
        Self::new()
    }
}

/// The process-wide device path cache
#[must_use]
pub fn device_path_cache() -> &'static DevicePathCache {
    static CACHE: DevicePathCache = DevicePathCache::new();
    &CACHE
}

/// Transport over the GPLPV xenbus device file
pub struct DeviceTransport {
    platform: Box<dyn DevicePlatform>,
    cache: &'static DevicePathCache,
    codec: Box<dyn PacketCodec>,
    handle: Option<Box<dyn RawDevice>>,
    path: Option<String>,
    notify: bool,
}

impl DeviceTransport {
    /// Create a transport using `platform` and the process-wide path cache
    pub fn new(platform: impl DevicePlatform + 'static) -> Self {
        Self {
            platform: Box::new(platform),
            cache: device_path_cache(),
            codec: Box::new(XenstoreCodec),
            handle: None,
            path: None,
            notify: false,
        }
    }

    /// Use a different path cache (tests, or isolated device sets)
    #[must_use]
    pub fn with_path_cache(mut self, cache: &'static DevicePathCache) -> Self {
        self.cache = cache;
        self
    }

    /// Use a different packet encoding
    #[must_use]
    pub fn with_codec(mut self, codec: impl PacketCodec + 'static) -> Self {
        self.codec = Box::new(codec);
        self
    }

    /// Path of the opened device
    #[must_use]
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// Whether the raw handle is open
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    /// Write all of `data` to the device, then advance the notify cadence
    ///
    /// # Errors
    ///
    /// `InvalidState` if not connected; `Io` if the handle fails or stops
    /// accepting bytes. Errors are fatal for the current packet.
    pub fn send_bytes(
        &mut self,
        data: &[u8],
        bridge: &mut ReadinessBridge,
    ) -> Result<(), TransportError> {
        tracing::debug!(len = data.len(), "send");

        let handle = self
            .handle
            .as_mut()
            .ok_or_else(|| TransportError::InvalidState("Device not open".into()))?;

        let mut written = 0;
        while written < data.len() {
            match handle.write(&data[written..]) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "device accepted no bytes",
                    )
                    .into())
                }
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        if self.notify {
            tracing::debug!("send: notifying router");
            bridge.signal_n(READS_PER_PACKET)?;
        }
        self.notify = !self.notify;

        Ok(())
    }

    /// Read exactly `size` bytes, then consume one readiness byte
    ///
    /// A zero-length read never touches the device but still consumes the
    /// readiness byte so sends and receives stay balanced.
    ///
    /// # Errors
    ///
    /// `InvalidState` if not connected; `Io` if the handle fails or reaches
    /// end of file early, or the bridge is shut down.
    pub fn recv_bytes(
        &mut self,
        size: usize,
        bridge: &mut ReadinessBridge,
    ) -> Result<Vec<u8>, TransportError> {
        tracing::debug!(size, "recv");

        let mut buf = vec![0u8; size];
        if size > 0 {
            let handle = self
                .handle
                .as_mut()
                .ok_or_else(|| TransportError::InvalidState("Device not open".into()))?;

            let mut filled = 0;
            while filled < size {
                match handle.read(&mut buf[filled..]) {
                    Ok(0) => {
                        return Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            format!("device closed after {filled} of {size} bytes"),
                        )
                        .into())
                    }
                    Ok(n) => filled += n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e.into()),
                }
            }
        }

        bridge.wait_and_consume()?;
        tracing::debug!("recv: consumed readiness byte, returning data");

        Ok(buf)
    }
}

impl PacketTransport for DeviceTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Device
    }

    fn connect(&mut self) -> Result<(), TransportError> {
        if self.handle.is_some() {
            return Ok(());
        }

        let platform = &self.platform;
        let path = if platform.caches_discovery() {
            self.cache.get_or_discover(|| platform.discover())?.to_owned()
        } else {
            platform.discover()?
        };

        let handle = self.platform.open(&path).map_err(|e| {
            tracing::warn!(error = %e, path = %path, "Failed to open xenbus device");
            TransportError::unavailable(format!("Error while opening {path:?}"), e)
        })?;

        tracing::info!(path = %path, "Opened xenbus device");
        self.handle = Some(handle);
        self.path = Some(path);
        self.notify = false;
        Ok(())
    }

    fn send(&mut self, packet: &Packet, link: &mut Link) -> Result<(), TransportError> {
        tracing::debug!(?packet, "Sending packet to xenstore");

        let header = self.codec.encode_header(packet)?;
        self.send_bytes(&header, &mut link.bridge)?;
        self.send_bytes(packet.payload(), &mut link.bridge)
    }

    fn recv(&mut self, link: &mut Link) -> Result<Packet, TransportError> {
        let raw = self.recv_bytes(HEADER_SIZE, &mut link.bridge)?;
        let mut header_bytes = [0u8; HEADER_SIZE];
        header_bytes.copy_from_slice(&raw);
        let header = match self.codec.decode_header(&header_bytes) {
            Ok(header) => header,
            Err(e) => {
                // No payload read follows; drop its readiness byte too
                link.bridge.wait_and_consume()?;
                return Err(e);
            }
        };

        let payload = self.recv_bytes(header.len, &mut link.bridge)?;
        Ok(Packet::new(header.op, payload, header.rq_id, header.tx_id))
    }

    fn close(&mut self) -> Result<(), TransportError> {
        if self.handle.take().is_some() {
            tracing::info!(path = ?self.path, "Closed xenbus device");
        }
        self.notify = false;
        Ok(())
    }
}
