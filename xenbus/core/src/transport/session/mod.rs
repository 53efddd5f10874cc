//! Session Transport
//!
//! Talks to xenstore through the WMI interface exposed by the WinPV
//! drivers. Instead of framed bytes, each request becomes a method call
//! on a `XenProjectXenStoreSession` object:
//!
//! | Operation | Remote call    | Response payload            |
//! |-----------|----------------|-----------------------------|
//! | READ      | `GetValue`     | the value                   |
//! | WRITE     | `SetValue`     | `OK`                        |
//! | RM        | `RemoveValue`  | `OK`                        |
//! | DIRECTORY | `GetChildren`  | child names joined with NUL |
//!
//! Nothing else is exposed by the interface. Because the result of the
//! call *is* the response, `send` queues it on the connection's link and
//! signals readiness; `recv` just hands it over.

mod backend;
#[cfg(windows)]
pub mod wmi;

pub use backend::{ManagementBackend, ManagementConnection, RemoteSession};

use super::readiness::Link;
use super::retry::{Pause, RetryError, RetryPolicy, ThreadPause};
use super::traits::{BackendError, PacketTransport, TransportError, TransportKind};
use crate::packet::{join_children, path_from_payload, split_write_payload, Op, Packet, SUCCESS_MARKER};

/// Session name used when none is configured
pub const DEFAULT_SESSION_NAME: &str = "PyxsSession";

/// Query used to locate a session object by id
pub const SESSION_QUERY_TEMPLATE: &str =
    "select * from XenProjectXenStoreSession where SessionId = {id}";

/// Render [`SESSION_QUERY_TEMPLATE`] for `id`
#[must_use]
pub fn session_query(id: u32) -> String {
    SESSION_QUERY_TEMPLATE.replace("{id}", &id.to_string())
}

/// A remote session handle together with its identity
#[derive(Debug)]
pub struct Session<H> {
    handle: H,
    id: u32,
    name: String,
}

impl<H> Session<H> {
    /// Remote object
    pub fn handle(&self) -> &H {
        &self.handle
    }

    /// Session id assigned by the backend
    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Name the session was created with
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Tunables for session acquisition
#[derive(Clone, Debug, PartialEq)]
pub struct SessionSettings {
    /// Name passed to `AddSession`
    pub name: String,
    /// Retry policy for connecting to the management interface
    pub connect_retry: RetryPolicy,
    /// Retry policy for locating the session object
    pub lookup_retry: RetryPolicy,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            name: DEFAULT_SESSION_NAME.to_string(),
            connect_retry: RetryPolicy::backend_connect(),
            lookup_retry: RetryPolicy::object_lookup(),
        }
    }
}

type SessionHandle<B> =
    <<B as ManagementBackend>::Connection as ManagementConnection>::Session;

/// Transport over WinPV management-interface sessions
pub struct SessionTransport<B: ManagementBackend> {
    backend: B,
    settings: SessionSettings,
    pause: Box<dyn Pause>,
    /// Owned by this transport only; never shared between instances
    connection: Option<B::Connection>,
    session_id: Option<u32>,
    session: Option<Session<SessionHandle<B>>>,
}

impl<B: ManagementBackend> SessionTransport<B> {
    /// Create a transport; nothing is contacted until `connect`
    pub fn new(backend: B, settings: SessionSettings) -> Self {
        Self {
            backend,
            settings,
            pause: Box::new(ThreadPause),
            connection: None,
            session_id: None,
            session: None,
        }
    }

    /// Replace the wall-clock pause used between retries
    #[must_use]
    pub fn with_pause(mut self, pause: impl Pause + 'static) -> Self {
        self.pause = Box::new(pause);
        self
    }

    /// Current settings
    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Id of the session created by this transport, if any
    #[must_use]
    pub fn session_id(&self) -> Option<u32> {
        self.session_id
    }

    /// The cached session
    pub fn session(&self) -> Option<&Session<SessionHandle<B>>> {
        self.session.as_ref()
    }

    /// Connect (with retry), create the session if needed, and locate it
    ///
    /// # Errors
    ///
    /// `Unavailable` if the management interface cannot be reached within
    /// the connect policy, `Backend` if `AddSession` fails, and
    /// `UnknownSession` if the session object cannot be found.
    pub fn acquire_session(&mut self) -> Result<Session<SessionHandle<B>>, TransportError> {
        let connection = match self.connection.take() {
            Some(connection) => connection,
            None => connect_with_retry(&self.backend, &self.settings.connect_retry, self.pause.as_ref())?,
        };
        let connection = self.connection.insert(connection);

        let id = match self.session_id {
            Some(id) => id,
            None => {
                tracing::debug!(name = %self.settings.name, "Adding a new XenProjectXenStoreSession");
                let id = connection
                    .add_session(&self.settings.name)
                    .map_err(|source| TransportError::Backend {
                        call: "AddSession",
                        source,
                    })?;
                self.session_id = Some(id);
                id
            }
        };

        let handle = lookup_with_retry(&*connection, id, &self.settings.lookup_retry, self.pause.as_ref())?;
        Ok(Session {
            handle,
            id,
            name: self.settings.name.clone(),
        })
    }

    fn release(&mut self) {
        self.session = None;
        self.session_id = None;
        // Dropping the connection releases the backend's per-thread initialisation
        self.connection = None;
    }
}

fn connect_with_retry<B: ManagementBackend>(
    backend: &B,
    policy: &RetryPolicy,
    pause: &dyn Pause,
) -> Result<B::Connection, TransportError> {
    policy
        .run("management connect", pause, |_| backend.connect())
        .map_err(|e| match e {
            RetryError::Exhausted { attempts, last } => TransportError::unavailable(
                format!("Initialising management connection failed after {attempts} attempts"),
                last,
            ),
            RetryError::Fatal(e) => {
                TransportError::unavailable("Initialising management connection failed", e)
            }
        })
}

fn lookup_with_retry<C: ManagementConnection>(
    connection: &C,
    id: u32,
    policy: &RetryPolicy,
    pause: &dyn Pause,
) -> Result<C::Session, TransportError> {
    match policy.run("session lookup", pause, |_| connection.find_session(id)) {
        Ok(Some(handle)) => Ok(handle),
        Ok(None) => Err(TransportError::UnknownSession {
            session_id: id,
            source: None,
        }),
        Err(e) => {
            let last = e.into_inner();
            tracing::error!(session_id = id, error = %last, "Failed finding the XenProjectXenStoreSession");
            Err(TransportError::UnknownSession {
                session_id: id,
                source: Some(Box::new(last)),
            })
        }
    }
}

fn remote<T>(call: &'static str, result: Result<T, BackendError>) -> Result<T, TransportError> {
    result.map_err(|source| TransportError::Backend { call, source })
}

/// Map one request onto the matching remote call
fn dispatch<S: RemoteSession>(session: &S, packet: &Packet) -> Result<Vec<u8>, TransportError> {
    match packet.op() {
        Op::Read => {
            let path = path_from_payload(packet.payload())?;
            Ok(remote("GetValue", session.get_value(path))?.into_bytes())
        }
        Op::Write => {
            let (path, value) = split_write_payload(packet.payload())?;
            remote("SetValue", session.set_value(path, value))?;
            Ok(SUCCESS_MARKER.to_vec())
        }
        Op::Rm => {
            let path = path_from_payload(packet.payload())?;
            remote("RemoveValue", session.remove_value(path))?;
            Ok(SUCCESS_MARKER.to_vec())
        }
        Op::Directory => {
            let path = path_from_payload(packet.payload())?;
            let children = remote("GetChildren", session.get_children(path))?;
            Ok(join_children(&children))
        }
        other => Err(TransportError::UnsupportedOperation(other)),
    }
}

impl<B: ManagementBackend> PacketTransport for SessionTransport<B> {
    fn kind(&self) -> TransportKind {
        TransportKind::Session
    }

    fn supports(&self, op: Op) -> bool {
        matches!(op, Op::Read | Op::Write | Op::Rm | Op::Directory)
    }

    fn connect(&mut self) -> Result<(), TransportError> {
        if self.session.is_some() {
            return Ok(());
        }

        let session = self.acquire_session()?;
        tracing::info!(session_id = session.id, name = %session.name, "Connected xenstore session");
        self.session = Some(session);
        Ok(())
    }

    fn send(&mut self, packet: &Packet, link: &mut Link) -> Result<(), TransportError> {
        if !self.supports(packet.op()) {
            return Err(TransportError::UnsupportedOperation(packet.op()));
        }

        if self.session.is_none() {
            tracing::debug!("Attempt to send without a connection - connecting now");
            self.connect()?;
        }
        let session = self
            .session
            .as_ref()
            .ok_or_else(|| TransportError::InvalidState("No xenstore session".into()))?;

        tracing::debug!(?packet, session_id = session.id, "Sending packet to xenstore");
        let payload = dispatch(&session.handle, packet)?;

        link.deliver(Packet::reply_to(packet, payload))?;
        Ok(())
    }

    fn recv(&mut self, link: &mut Link) -> Result<Packet, TransportError> {
        link.take()
    }

    fn close(&mut self) -> Result<(), TransportError> {
        if self.session_id.is_none() {
            self.release();
            return Ok(());
        }

        tracing::debug!("Closing XenProjectXenStoreSession");
        // The cached object may have been evicted since last use
        let result = match self.acquire_session() {
            Ok(session) => remote("EndSession", session.handle.end_session()),
            Err(TransportError::UnknownSession { session_id, .. }) => {
                tracing::warn!(session_id, "Session already gone; nothing to end");
                Ok(())
            }
            Err(e) => Err(e),
        };

        self.release();
        if let Err(ref e) = result {
            tracing::warn!(error = %e, "Ending xenstore session failed");
        } else {
            tracing::info!("Xenstore session ended");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::transport::memory::{MemoryBackend, RecordingPause};

    fn quick_settings() -> SessionSettings {
        SessionSettings {
            name: "TestSession".into(),
            connect_retry: RetryPolicy::fixed(4, Duration::from_secs(2)),
            lookup_retry: RetryPolicy::fixed(2, Duration::from_millis(500)),
        }
    }

    fn transport(backend: &MemoryBackend) -> (SessionTransport<MemoryBackend>, RecordingPause) {
        let pause = RecordingPause::new();
        let transport =
            SessionTransport::new(backend.clone(), quick_settings()).with_pause(pause.clone());
        (transport, pause)
    }

    #[test]
    fn test_session_query_template() {
        assert_eq!(
            session_query(3),
            "select * from XenProjectXenStoreSession where SessionId = 3"
        );
    }

    #[test]
    fn test_connect_creates_named_session() {
        let backend = MemoryBackend::new();
        let (mut transport, _) = transport(&backend);

        transport.connect().unwrap();

        let session = transport.session().unwrap();
        assert_eq!(session.name(), "TestSession");
        assert_eq!(backend.session_names(), vec!["TestSession".to_string()]);
        assert_eq!(transport.session_id(), Some(session.id()));
    }

    #[test]
    fn test_connect_retries_until_backend_answers() {
        let backend = MemoryBackend::new();
        backend.fail_connects(2);
        let (mut transport, pause) = transport(&backend);

        transport.connect().unwrap();

        assert_eq!(backend.connect_count(), 3);
        assert_eq!(pause.delays(), vec![Duration::from_secs(2); 2]);
    }

    #[test]
    fn test_connect_gives_up_after_ceiling() {
        let backend = MemoryBackend::new();
        backend.fail_connects(10);
        let (mut transport, pause) = transport(&backend);

        let result = transport.connect();

        assert!(matches!(result, Err(TransportError::Unavailable { .. })));
        assert_eq!(backend.connect_count(), 4);
        assert_eq!(pause.total(), Duration::from_secs(6));
        assert_eq!(backend.add_session_count(), 0);
    }

    #[test]
    fn test_connect_retries_while_base_object_missing() {
        let backend = MemoryBackend::new();
        backend.hide_base_for(2);
        let (mut transport, pause) = transport(&backend);

        transport.connect().unwrap();

        assert_eq!(backend.connect_count(), 3);
        assert_eq!(backend.add_session_count(), 1);
        assert_eq!(pause.delays(), vec![Duration::from_secs(2); 2]);
    }

    #[test]
    fn test_missing_base_object_past_ceiling_is_unavailable() {
        let backend = MemoryBackend::new();
        backend.hide_base_for(10);
        let (mut transport, _) = transport(&backend);

        let result = transport.connect();

        assert!(matches!(result, Err(TransportError::Unavailable { .. })));
        assert_eq!(backend.connect_count(), 4);
        assert_eq!(backend.add_session_count(), 0);
    }

    #[test]
    fn test_lookup_retry_once_then_success() {
        let backend = MemoryBackend::new();
        backend.fail_lookups(1);
        let (mut transport, pause) = transport(&backend);

        transport.connect().unwrap();

        assert!(transport.session().is_some());
        assert_eq!(backend.lookup_count(), 2);
        assert_eq!(pause.delays(), vec![Duration::from_millis(500)]);
    }

    #[test]
    fn test_lookup_failing_twice_is_unknown_session() {
        let backend = MemoryBackend::new();
        backend.fail_lookups(2);
        let (mut transport, _) = transport(&backend);

        let result = transport.connect();

        match result {
            Err(TransportError::UnknownSession { source, .. }) => assert!(source.is_some()),
            other => panic!("Expected UnknownSession, got: {other:?}"),
        }
        assert_eq!(backend.lookup_count(), 2);
    }

    #[test]
    fn test_missing_session_object_is_unknown_session() {
        let backend = MemoryBackend::new();
        backend.hide_new_sessions(true);
        let (mut transport, _) = transport(&backend);

        let result = transport.connect();
        assert!(matches!(
            result,
            Err(TransportError::UnknownSession { source: None, .. })
        ));
    }

    #[test]
    fn test_unsupported_operation_never_touches_backend() {
        let backend = MemoryBackend::new();
        let (mut transport, _) = transport(&backend);
        let mut link = Link::new().unwrap();

        let result = transport.send(&Packet::new(Op::Watch, b"a\0tok".to_vec(), 1, 0), &mut link);

        assert!(matches!(
            result,
            Err(TransportError::UnsupportedOperation(Op::Watch))
        ));
        assert_eq!(backend.connect_count(), 0);
        assert!(link.responses.is_empty());
    }

    #[test]
    fn test_send_dispatches_and_queues_response() {
        let backend = MemoryBackend::new();
        let (mut transport, _) = transport(&backend);
        let mut link = Link::new().unwrap();

        transport
            .send(&Packet::new(Op::Write, b"data/a\0one".to_vec(), 4, 0), &mut link)
            .unwrap();
        assert_eq!(link.responses.len(), 1);
        let reply = transport.recv(&mut link).unwrap();
        assert_eq!(reply.payload(), SUCCESS_MARKER);
        assert_eq!(backend.value("data/a"), Some("one".to_string()));

        transport
            .send(&Packet::new(Op::Read, b"data/a\0".to_vec(), 5, 0), &mut link)
            .unwrap();
        let reply = transport.recv(&mut link).unwrap();
        assert_eq!(reply.payload(), b"one");
        assert_eq!(reply.rq_id(), 5);
    }

    #[test]
    fn test_remote_failure_is_backend_error() {
        let backend = MemoryBackend::new();
        let (mut transport, _) = transport(&backend);
        let mut link = Link::new().unwrap();

        let result = transport.send(&Packet::new(Op::Read, b"missing".to_vec(), 1, 0), &mut link);

        assert!(matches!(
            result,
            Err(TransportError::Backend {
                call: "GetValue",
                ..
            })
        ));
        assert!(link.responses.is_empty());
    }

    #[test]
    fn test_malformed_write_is_rejected() {
        let backend = MemoryBackend::new();
        let (mut transport, _) = transport(&backend);
        let mut link = Link::new().unwrap();

        let result = transport.send(&Packet::new(Op::Write, b"no-value".to_vec(), 1, 0), &mut link);
        assert!(matches!(result, Err(TransportError::MalformedPayload(_))));
    }

    #[test]
    fn test_send_does_not_recreate_lost_session() {
        let backend = MemoryBackend::new();
        let (mut transport, _) = transport(&backend);
        let mut link = Link::new().unwrap();

        transport.connect().unwrap();
        let id = transport.session_id().unwrap();
        backend.drop_session(id);

        let result = transport.send(&Packet::new(Op::Read, b"vm".to_vec(), 1, 0), &mut link);
        assert!(matches!(result, Err(TransportError::Backend { .. })));
        assert_eq!(backend.add_session_count(), 1);
    }

    #[test]
    fn test_close_ends_session_once() {
        let backend = MemoryBackend::new();
        let (mut transport, _) = transport(&backend);

        transport.connect().unwrap();
        transport.close().unwrap();
        transport.close().unwrap();

        assert_eq!(backend.end_session_count(), 1);
        assert!(transport.session().is_none());
        assert!(transport.session_id().is_none());
    }

    #[test]
    fn test_close_without_connect_skips_backend() {
        let backend = MemoryBackend::new();
        let (mut transport, _) = transport(&backend);

        transport.close().unwrap();

        assert_eq!(backend.connect_count(), 0);
        assert_eq!(backend.end_session_count(), 0);
    }

    #[test]
    fn test_close_tolerates_session_removed_out_of_band() {
        let backend = MemoryBackend::new();
        let (mut transport, _) = transport(&backend);

        transport.connect().unwrap();
        backend.drop_session(transport.session_id().unwrap());

        transport.close().unwrap();
        assert_eq!(backend.end_session_count(), 0);
        assert!(transport.session_id().is_none());
    }
}
