//! Transport Layer for Xenstore Access on Windows Guests
//!
//! Provides abstraction over the two ways a Windows guest can reach
//! xenstore:
//! - `Device`: the raw xenbus device file exposed by the GPLPV drivers
//! - `Session`: WMI session objects exposed by the WinPV drivers
//!
//! # Design Philosophy
//!
//! Neither backend can be waited on by an ordinary event loop, so every
//! connection carries a [`ReadinessBridge`]: a loopback pair whose read
//! end becomes readable exactly when a response is waiting. The router
//! multiplexes that descriptor alongside its other sources and calls
//! `recv` only once it fires.
//!
//! All calls are synchronous. The only waits are blocking device I/O,
//! the bridge itself, and the pauses inside [`RetryPolicy`].

pub mod config;
pub mod connection;
pub mod device;
pub mod factory;
pub mod frame;
pub mod memory;
pub mod readiness;
pub mod retry;
pub mod session;
pub mod traits;

// Re-exports for convenience
pub use config::{TransportConfig, TransportType};
pub use connection::{ConnectionState, XenBusConnection};
pub use device::{device_path_cache, DevicePathCache, DevicePlatform, DeviceTransport, FixedPathPlatform};
pub use factory::create_transport;
pub use frame::{FrameDecoder, PacketCodec, XenstoreCodec, MAX_PAYLOAD};
pub use memory::{MemoryBackend, MemoryDevice, MemoryDevicePlatform, RecordingPause};
pub use readiness::{Link, RawDescriptor, ReadinessBridge, ResponseQueue};
pub use retry::{Backoff, Pause, RetryError, RetryPolicy, ThreadPause};
pub use session::{
    ManagementBackend, ManagementConnection, RemoteSession, SessionSettings, SessionTransport,
};
pub use traits::{BackendError, BackendErrorKind, PacketTransport, TransportError, TransportKind};

#[cfg(windows)]
pub use device::SetupApiPlatform;
#[cfg(windows)]
pub use session::wmi::WmiBackend;
