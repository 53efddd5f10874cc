//! In-Memory Backends
//!
//! Stand-ins for the two Windows-only surfaces: a management backend with
//! a value tree and controllable failures, and a device that speaks the
//! xenstore wire protocol from a byte buffer. Both keep their state behind
//! an `Arc` so a test can keep a clone for inspection after handing the
//! backend itself to a transport.
//!
//! These are also what the transport layer runs against on hosts without
//! the PV drivers.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::device::{DevicePlatform, RawDevice};
use super::frame::{encode, FrameDecoder};
use super::retry::Pause;
use super::session::{ManagementBackend, ManagementConnection, RemoteSession};
use super::traits::{BackendError, BackendErrorKind, TransportError};
use crate::packet::{join_children, path_from_payload, split_write_payload, Op, Packet, NUL, SUCCESS_MARKER};

/// Path under which [`MemoryDevicePlatform`] reports its device
pub const MEMORY_DEVICE_PATH: &str = "\\\\?\\memory#xenbus";

// ============================================================================
// Value tree
// ============================================================================

/// Flat map of slash-separated paths
#[derive(Debug, Default)]
struct Tree {
    values: BTreeMap<String, String>,
}

impl Tree {
    fn normalize(path: &str) -> &str {
        path.trim_matches('/')
    }

    fn get(&self, path: &str) -> Option<&String> {
        self.values.get(Self::normalize(path))
    }

    fn set(&mut self, path: &str, value: &str) {
        self.values
            .insert(Self::normalize(path).to_string(), value.to_string());
    }

    /// Remove `path` and everything below it; false if nothing matched
    fn remove(&mut self, path: &str) -> bool {
        let path = Self::normalize(path);
        let prefix = format!("{path}/");
        let before = self.values.len();
        self.values
            .retain(|key, _| key != path && !key.starts_with(&prefix));
        self.values.len() != before
    }

    fn children(&self, path: &str) -> Vec<String> {
        let path = Self::normalize(path);
        let prefix = if path.is_empty() {
            String::new()
        } else {
            format!("{path}/")
        };

        let names: BTreeSet<&str> = self
            .values
            .keys()
            .filter_map(|key| key.strip_prefix(prefix.as_str()))
            .filter_map(|rest| rest.split('/').next())
            .filter(|name| !name.is_empty())
            .collect();
        names.into_iter().map(str::to_string).collect()
    }
}

// ============================================================================
// Management backend
// ============================================================================

#[derive(Debug, Default)]
struct BackendState {
    tree: Tree,
    sessions: BTreeMap<u32, String>,
    next_session_id: u32,
    connect_failures: u32,
    missing_base: u32,
    lookup_failures: u32,
    hide_new_sessions: bool,
    last_query: Option<String>,
    connects: u32,
    add_sessions: u32,
    lookups: u32,
    end_sessions: u32,
    calls: u32,
}

/// Management backend holding a xenstore tree in memory
#[derive(Clone, Debug, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<BackendState>>,
}

impl MemoryBackend {
    /// Create an empty backend
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a value
    #[must_use]
    pub fn with_value(self, path: &str, value: &str) -> Self {
        self.state.lock().tree.set(path, value);
        self
    }

    /// Fail the next `count` connects with an unreachable error
    pub fn fail_connects(&self, count: u32) {
        self.state.lock().connect_failures = count;
    }

    /// Report no xenstore base object on the next `count` connects
    ///
    /// The namespace answers but the provider has not registered its base
    /// instance yet.
    pub fn hide_base_for(&self, count: u32) {
        self.state.lock().missing_base = count;
    }

    /// Fail the next `count` session queries
    pub fn fail_lookups(&self, count: u32) {
        self.state.lock().lookup_failures = count;
    }

    /// Make newly added sessions invisible to queries
    pub fn hide_new_sessions(&self, hide: bool) {
        self.state.lock().hide_new_sessions = hide;
    }

    /// Remove a session as if it had been ended elsewhere
    pub fn drop_session(&self, id: u32) {
        self.state.lock().sessions.remove(&id);
    }

    /// Current value at `path`
    #[must_use]
    pub fn value(&self, path: &str) -> Option<String> {
        self.state.lock().tree.get(path).cloned()
    }

    /// Names of live sessions, ordered by id
    #[must_use]
    pub fn session_names(&self) -> Vec<String> {
        self.state.lock().sessions.values().cloned().collect()
    }

    /// Last session query issued
    #[must_use]
    pub fn last_query(&self) -> Option<String> {
        self.state.lock().last_query.clone()
    }

    /// Connect attempts, including failed ones
    #[must_use]
    pub fn connect_count(&self) -> u32 {
        self.state.lock().connects
    }

    /// `AddSession` calls
    #[must_use]
    pub fn add_session_count(&self) -> u32 {
        self.state.lock().add_sessions
    }

    /// Session queries, including failed ones
    #[must_use]
    pub fn lookup_count(&self) -> u32 {
        self.state.lock().lookups
    }

    /// `EndSession` calls that reached a live session
    #[must_use]
    pub fn end_session_count(&self) -> u32 {
        self.state.lock().end_sessions
    }

    /// Value calls (`GetValue`, `SetValue`, `RemoveValue`, `GetChildren`)
    #[must_use]
    pub fn call_count(&self) -> u32 {
        self.state.lock().calls
    }
}

impl ManagementBackend for MemoryBackend {
    type Connection = MemoryConnection;

    fn connect(&self) -> Result<MemoryConnection, BackendError> {
        let mut state = self.state.lock();
        state.connects += 1;
        if state.connect_failures > 0 {
            state.connect_failures -= 1;
            return Err(BackendError::new(
                BackendErrorKind::Unreachable,
                "The RPC server is unavailable",
            ));
        }
        if state.missing_base > 0 {
            state.missing_base -= 1;
            return Err(BackendError::new(
                BackendErrorKind::Unreachable,
                "No XenProjectXenStoreBase instance",
            ));
        }

        Ok(MemoryConnection {
            state: Arc::clone(&self.state),
        })
    }
}

/// Connection to a [`MemoryBackend`]
#[derive(Debug)]
pub struct MemoryConnection {
    state: Arc<Mutex<BackendState>>,
}

impl ManagementConnection for MemoryConnection {
    type Session = MemorySession;

    fn add_session(&self, name: &str) -> Result<u32, BackendError> {
        let mut state = self.state.lock();
        state.add_sessions += 1;
        state.next_session_id += 1;
        let id = state.next_session_id;
        if !state.hide_new_sessions {
            state.sessions.insert(id, name.to_string());
        }
        Ok(id)
    }

    fn find_session(&self, id: u32) -> Result<Option<MemorySession>, BackendError> {
        let mut state = self.state.lock();
        state.lookups += 1;
        state.last_query = Some(super::session::session_query(id));
        if state.lookup_failures > 0 {
            state.lookup_failures -= 1;
            return Err(BackendError::new(
                BackendErrorKind::QueryFailed,
                "Generic failure",
            ));
        }

        Ok(state.sessions.contains_key(&id).then(|| MemorySession {
            id,
            state: Arc::clone(&self.state),
        }))
    }
}

/// Session object in a [`MemoryBackend`]
#[derive(Debug)]
pub struct MemorySession {
    id: u32,
    state: Arc<Mutex<BackendState>>,
}

impl MemorySession {
    fn call<T>(
        &self,
        name: &str,
        f: impl FnOnce(&mut Tree) -> Result<T, String>,
    ) -> Result<T, BackendError> {
        let mut state = self.state.lock();
        state.calls += 1;
        if !state.sessions.contains_key(&self.id) {
            return Err(BackendError::new(
                BackendErrorKind::CallFailed,
                format!("{name}: session {} no longer exists", self.id),
            ));
        }
        f(&mut state.tree)
            .map_err(|msg| BackendError::new(BackendErrorKind::CallFailed, format!("{name}: {msg}")))
    }
}

impl RemoteSession for MemorySession {
    fn get_value(&self, path: &str) -> Result<String, BackendError> {
        self.call("GetValue", |tree| {
            tree.get(path).cloned().ok_or_else(|| format!("{path} not found"))
        })
    }

    fn set_value(&self, path: &str, value: &str) -> Result<(), BackendError> {
        self.call("SetValue", |tree| {
            tree.set(path, value);
            Ok(())
        })
    }

    fn remove_value(&self, path: &str) -> Result<(), BackendError> {
        self.call("RemoveValue", |tree| {
            tree.remove(path);
            Ok(())
        })
    }

    fn get_children(&self, path: &str) -> Result<Vec<String>, BackendError> {
        self.call("GetChildren", |tree| Ok(tree.children(path)))
    }

    fn end_session(&self) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        if state.sessions.remove(&self.id).is_none() {
            return Err(BackendError::new(
                BackendErrorKind::CallFailed,
                format!("EndSession: session {} no longer exists", self.id),
            ));
        }
        state.end_sessions += 1;
        Ok(())
    }
}

// ============================================================================
// Device
// ============================================================================

#[derive(Debug)]
struct DeviceState {
    /// Answer request frames like xenstored; otherwise just buffer bytes
    serve: bool,
    tree: Tree,
    decoder: FrameDecoder,
    written: Vec<u8>,
    outbound: VecDeque<u8>,
    max_chunk: usize,
    write_calls: usize,
    read_calls: usize,
}

impl DeviceState {
    fn answer(&mut self, request: &Packet) -> Packet {
        match self.apply(request) {
            Ok(payload) => Packet::reply_to(request, payload),
            Err(code) => {
                let mut payload = code.as_bytes().to_vec();
                payload.push(NUL);
                Packet::new(Op::Error, payload, request.rq_id(), request.tx_id())
            }
        }
    }

    fn apply(&mut self, request: &Packet) -> Result<Vec<u8>, &'static str> {
        let path = || path_from_payload(request.payload()).map_err(|_| "EINVAL");

        match request.op() {
            Op::Read => self
                .tree
                .get(path()?)
                .map(|value| value.clone().into_bytes())
                .ok_or("ENOENT"),
            Op::Write => {
                let (path, value) = split_write_payload(request.payload()).map_err(|_| "EINVAL")?;
                self.tree.set(path, value);
                Ok(SUCCESS_MARKER.to_vec())
            }
            Op::Rm => {
                if self.tree.remove(path()?) {
                    Ok(SUCCESS_MARKER.to_vec())
                } else {
                    Err("ENOENT")
                }
            }
            Op::Directory => Ok(join_children(&self.tree.children(path()?))),
            _ => Err("ENOSYS"),
        }
    }

    fn ingest(&mut self, data: &[u8]) -> io::Result<()> {
        if !self.serve {
            self.written.extend_from_slice(data);
            return Ok(());
        }

        self.decoder.push(data);
        while let Some(request) = self
            .decoder
            .decode()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?
        {
            let response = self.answer(&request);
            let bytes = encode(&response).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            self.outbound.extend(bytes);
        }
        Ok(())
    }
}

/// Device that answers xenstore requests from an in-memory tree
///
/// Reads on an empty buffer return end-of-file rather than blocking.
#[derive(Clone, Debug)]
pub struct MemoryDevice {
    state: Arc<Mutex<DeviceState>>,
}

impl MemoryDevice {
    fn build(serve: bool) -> Self {
        Self {
            state: Arc::new(Mutex::new(DeviceState {
                serve,
                tree: Tree::default(),
                decoder: FrameDecoder::new(),
                written: Vec::new(),
                outbound: VecDeque::new(),
                max_chunk: usize::MAX,
                write_calls: 0,
                read_calls: 0,
            })),
        }
    }

    /// Device that answers READ, WRITE, RM and DIRECTORY
    #[must_use]
    pub fn new() -> Self {
        Self::build(true)
    }

    /// Device that records writes and replays queued bytes verbatim
    #[must_use]
    pub fn raw() -> Self {
        Self::build(false)
    }

    /// Seed a value
    #[must_use]
    pub fn with_value(self, path: &str, value: &str) -> Self {
        self.state.lock().tree.set(path, value);
        self
    }

    /// Accept and return at most `max` bytes per call
    #[must_use]
    pub fn with_max_chunk(self, max: usize) -> Self {
        self.state.lock().max_chunk = max.max(1);
        self
    }

    /// Append bytes to what the next reads return
    pub fn queue_raw(&self, data: &[u8]) {
        self.state.lock().outbound.extend(data.iter().copied());
    }

    /// Bytes written in raw mode
    #[must_use]
    pub fn written(&self) -> Vec<u8> {
        self.state.lock().written.clone()
    }

    /// Current value at `path`
    #[must_use]
    pub fn value(&self, path: &str) -> Option<String> {
        self.state.lock().tree.get(path).cloned()
    }

    /// Calls to `write`
    #[must_use]
    pub fn write_calls(&self) -> usize {
        self.state.lock().write_calls
    }

    /// Calls to `read`
    #[must_use]
    pub fn read_calls(&self) -> usize {
        self.state.lock().read_calls
    }
}

impl Default for MemoryDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl Read for MemoryDevice {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        state.read_calls += 1;

        let n = buf.len().min(state.outbound.len()).min(state.max_chunk);
        for (slot, byte) in buf.iter_mut().zip(state.outbound.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for MemoryDevice {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        state.write_calls += 1;

        let n = buf.len().min(state.max_chunk);
        state.ingest(&buf[..n])?;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default)]
struct PlatformState {
    open_failure: Option<io::ErrorKind>,
    discover_failure: bool,
    discovers: usize,
    opens: usize,
}

/// Device platform handing out a [`MemoryDevice`]
#[derive(Clone, Debug)]
pub struct MemoryDevicePlatform {
    device: MemoryDevice,
    state: Arc<Mutex<PlatformState>>,
}

impl MemoryDevicePlatform {
    /// Platform whose only device is `device`
    #[must_use]
    pub fn new(device: MemoryDevice) -> Self {
        Self {
            device,
            state: Arc::default(),
        }
    }

    /// Fail every open with `kind`
    pub fn fail_open(&self, kind: io::ErrorKind) {
        self.state.lock().open_failure = Some(kind);
    }

    /// Report no device during discovery
    pub fn fail_discovery(&self) {
        self.state.lock().discover_failure = true;
    }

    /// Calls to `discover`
    #[must_use]
    pub fn discover_count(&self) -> usize {
        self.state.lock().discovers
    }

    /// Successful and failed calls to `open`
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.state.lock().opens
    }
}

impl DevicePlatform for MemoryDevicePlatform {
    fn discover(&self) -> Result<String, TransportError> {
        let mut state = self.state.lock();
        state.discovers += 1;
        if state.discover_failure {
            return Err(TransportError::Unavailable {
                context: "no xenbus device present".into(),
                source: None,
            });
        }
        Ok(MEMORY_DEVICE_PATH.to_string())
    }

    fn open(&self, path: &str) -> io::Result<Box<dyn RawDevice>> {
        let mut state = self.state.lock();
        state.opens += 1;
        if let Some(kind) = state.open_failure {
            return Err(io::Error::new(kind, format!("cannot open {path}")));
        }
        Ok(Box::new(self.device.clone()))
    }
}

// ============================================================================
// Pause
// ============================================================================

/// Pause that records requested delays instead of sleeping
#[derive(Clone, Debug, Default)]
pub struct RecordingPause {
    delays: Arc<Mutex<Vec<Duration>>>,
}

impl RecordingPause {
    /// Create a recorder with no delays
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every delay requested so far
    #[must_use]
    pub fn delays(&self) -> Vec<Duration> {
        self.delays.lock().clone()
    }

    /// Number of pauses
    #[must_use]
    pub fn count(&self) -> usize {
        self.delays.lock().len()
    }

    /// Sum of all delays
    #[must_use]
    pub fn total(&self) -> Duration {
        self.delays.lock().iter().sum()
    }
}

impl Pause for RecordingPause {
    fn pause(&self, delay: Duration) {
        self.delays.lock().push(delay);
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_tree_children_are_direct_and_sorted() {
        let mut tree = Tree::default();
        tree.set("/local/domain/1/name", "guest");
        tree.set("local/domain/1/device/vif/0/mac", "00:16:3e");
        tree.set("local/domain/0/name", "Domain-0");

        assert_eq!(tree.children("local/domain"), vec!["0", "1"]);
        assert_eq!(tree.children("local/domain/1"), vec!["device", "name"]);
        assert_eq!(tree.children(""), vec!["local"]);
        assert!(tree.children("missing").is_empty());
    }

    #[test]
    fn test_tree_remove_is_recursive() {
        let mut tree = Tree::default();
        tree.set("data/a", "1");
        tree.set("data/a/b", "2");
        tree.set("data/ab", "3");

        assert!(tree.remove("data/a"));
        assert_eq!(tree.get("data/ab"), Some(&"3".to_string()));
        assert!(tree.get("data/a/b").is_none());
        assert!(!tree.remove("data/a"));
    }

    #[test]
    fn test_device_answers_requests() {
        let mut device = MemoryDevice::new().with_value("vm", "/vm/1234");

        device
            .write_all(&encode(&Packet::new(Op::Read, b"vm\0".to_vec(), 9, 0)).unwrap())
            .unwrap();

        let mut raw = Vec::new();
        device.read_to_end(&mut raw).unwrap();

        let mut decoder = FrameDecoder::new();
        decoder.push(&raw);
        let reply = decoder.decode().unwrap().unwrap();
        assert_eq!(reply.op(), Op::Read);
        assert_eq!(reply.rq_id(), 9);
        assert_eq!(reply.payload(), b"/vm/1234");
    }

    #[test]
    fn test_device_missing_key_is_error_reply() {
        let mut device = MemoryDevice::new();
        device
            .write_all(&encode(&Packet::new(Op::Read, b"nope".to_vec(), 1, 0)).unwrap())
            .unwrap();

        let mut raw = Vec::new();
        device.read_to_end(&mut raw).unwrap();

        let mut decoder = FrameDecoder::new();
        decoder.push(&raw);
        let reply = decoder.decode().unwrap().unwrap();
        assert_eq!(reply.op(), Op::Error);
        assert_eq!(reply.payload(), b"ENOENT\0");
    }

    #[test]
    fn test_raw_device_records_and_replays() {
        let mut device = MemoryDevice::raw().with_max_chunk(2);
        device.queue_raw(b"abc");

        assert_eq!(device.write(b"xyz").unwrap(), 2);
        assert_eq!(device.written(), b"xy");

        let mut buf = [0u8; 8];
        assert_eq!(device.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"ab");
    }

    #[test]
    fn test_recording_pause() {
        let pause = RecordingPause::new();
        let probe = pause.clone();
        pause.pause(Duration::from_millis(500));
        pause.pause(Duration::from_secs(2));

        assert_eq!(probe.count(), 2);
        assert_eq!(probe.total(), Duration::from_millis(2500));
    }
}
