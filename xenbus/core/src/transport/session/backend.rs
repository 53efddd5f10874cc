//! Management Backend Traits
//!
//! The narrow surface the session transport needs from the management
//! interface. The connection object is returned by value from `connect`
//! and passed explicitly to every later call, so retry logic never has
//! to mutate shared state.

use crate::transport::traits::BackendError;

/// Entry point to the management interface
pub trait ManagementBackend {
    /// An established connection
    type Connection: ManagementConnection;

    /// Connect to the management interface and locate the xenstore base object
    ///
    /// Failures are usually transient while the drivers start, including
    /// a namespace that is up before its base object is registered.
    fn connect(&self) -> Result<Self::Connection, BackendError>;
}

/// An established management connection
pub trait ManagementConnection {
    /// Remote session object
    type Session: RemoteSession;

    /// Ask the xenstore base object to create a named session
    fn add_session(&self, name: &str) -> Result<u32, BackendError>;

    /// Look up the session object with `id`
    ///
    /// `Ok(None)` means the query ran but no such session exists.
    fn find_session(&self, id: u32) -> Result<Option<Self::Session>, BackendError>;
}

/// Methods exposed by a xenstore session object
pub trait RemoteSession {
    /// Read a value
    fn get_value(&self, path: &str) -> Result<String, BackendError>;

    /// Write a value
    fn set_value(&self, path: &str, value: &str) -> Result<(), BackendError>;

    /// Remove a node
    fn remove_value(&self, path: &str) -> Result<(), BackendError>;

    /// List the names of a node's children
    fn get_children(&self, path: &str) -> Result<Vec<String>, BackendError>;

    /// End the session on the remote side
    fn end_session(&self) -> Result<(), BackendError>;
}
