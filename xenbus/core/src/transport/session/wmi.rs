//! WinPV management backend over WMI (`ROOT\WMI`)

use std::collections::HashMap;

use serde::Deserialize;
use wmi::{COMLibrary, WMIConnection, WMIError};

use super::backend::{ManagementBackend, ManagementConnection, RemoteSession};
use super::session_query;
use crate::transport::traits::{BackendError, BackendErrorKind};

const NAMESPACE: &str = "ROOT\\WMI";

fn backend_error(kind: BackendErrorKind, message: &str, e: WMIError) -> BackendError {
    BackendError::new(kind, message).with_source(e)
}

#[derive(Deserialize, Debug)]
#[serde(rename = "XenProjectXenStoreBase")]
struct XenStoreBase {
    #[serde(rename = "__Path")]
    path: String,
}

#[derive(Deserialize, Debug)]
#[serde(rename = "XenProjectXenStoreSession")]
struct XenStoreSessionObject {
    #[serde(rename = "__Path")]
    path: String,
}

#[derive(Deserialize, Debug)]
struct AddSessionOut {
    #[serde(rename = "SessionId")]
    session_id: u32,
}

#[derive(Deserialize, Debug)]
struct GetValueOut {
    value: String,
}

#[derive(Deserialize, Debug)]
struct ChildList {
    #[serde(rename = "ChildNodes", default)]
    child_nodes: Vec<String>,
}

#[derive(Deserialize, Debug)]
struct GetChildrenOut {
    children: ChildList,
}

#[derive(Deserialize, Debug)]
struct NoOutput {}

/// Connects to the WinPV xenstore provider
#[derive(Clone, Copy, Debug, Default)]
pub struct WmiBackend;

impl ManagementBackend for WmiBackend {
    type Connection = WmiConnection;

    fn connect(&self) -> Result<WmiConnection, BackendError> {
        let com = COMLibrary::new().map_err(|e| {
            backend_error(BackendErrorKind::Unreachable, "COM initialisation failed", e)
        })?;
        let connection = WMIConnection::with_namespace_path(NAMESPACE, com).map_err(|e| {
            backend_error(BackendErrorKind::Unreachable, "Connecting to ROOT\\WMI failed", e)
        })?;

        // The provider registers the base instance some time after the namespace appears
        let bases: Vec<XenStoreBase> = connection
            .raw_query("select * from XenProjectXenStoreBase")
            .map_err(|e| {
                backend_error(BackendErrorKind::Unreachable, "XenProjectXenStoreBase query failed", e)
            })?;
        let base = bases.into_iter().next().ok_or_else(|| {
            BackendError::new(BackendErrorKind::Unreachable, "No XenProjectXenStoreBase instance")
        })?;

        Ok(WmiConnection {
            connection,
            base_path: base.path,
        })
    }
}

/// Live `ROOT\WMI` connection bound to the xenstore base object
///
/// Dropping it releases COM for this thread.
pub struct WmiConnection {
    connection: WMIConnection,
    base_path: String,
}

impl ManagementConnection for WmiConnection {
    type Session = WmiSession;

    fn add_session(&self, name: &str) -> Result<u32, BackendError> {
        let params = HashMap::from([("Id", name.to_string())]);
        let out: AddSessionOut = self
            .connection
            .exec_instance_method::<XenStoreBase, _>("AddSession", &self.base_path, params)
            .map_err(|e| backend_error(BackendErrorKind::CallFailed, "AddSession failed", e))?;
        Ok(out.session_id)
    }

    fn find_session(&self, id: u32) -> Result<Option<WmiSession>, BackendError> {
        let found: Vec<XenStoreSessionObject> = self
            .connection
            .raw_query(session_query(id))
            .map_err(|e| backend_error(BackendErrorKind::QueryFailed, "Session query failed", e))?;

        Ok(found.into_iter().next().map(|object| WmiSession {
            connection: self.connection.clone(),
            path: object.path,
        }))
    }
}

/// A `XenProjectXenStoreSession` instance
pub struct WmiSession {
    connection: WMIConnection,
    path: String,
}

impl WmiSession {
    fn call<P, O>(&self, method: &'static str, params: P) -> Result<O, BackendError>
    where
        P: serde::Serialize,
        O: for<'de> Deserialize<'de>,
    {
        self.connection
            .exec_instance_method::<XenStoreSessionObject, O>(method, &self.path, params)
            .map_err(|e| backend_error(BackendErrorKind::CallFailed, method, e))
    }
}

impl RemoteSession for WmiSession {
    fn get_value(&self, path: &str) -> Result<String, BackendError> {
        let out: GetValueOut = self.call("GetValue", HashMap::from([("PathName", path)]))?;
        Ok(out.value)
    }

    fn set_value(&self, path: &str, value: &str) -> Result<(), BackendError> {
        let _: NoOutput = self.call(
            "SetValue",
            HashMap::from([("PathName", path), ("value", value)]),
        )?;
        Ok(())
    }

    fn remove_value(&self, path: &str) -> Result<(), BackendError> {
        let _: NoOutput = self.call("RemoveValue", HashMap::from([("PathName", path)]))?;
        Ok(())
    }

    fn get_children(&self, path: &str) -> Result<Vec<String>, BackendError> {
        let out: GetChildrenOut = self.call("GetChildren", HashMap::from([("PathName", path)]))?;
        Ok(out.children.child_nodes)
    }

    fn end_session(&self) -> Result<(), BackendError> {
        let _: NoOutput = self.call("EndSession", HashMap::<&str, &str>::new())?;
        Ok(())
    }
}
