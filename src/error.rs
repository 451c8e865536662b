use std::time::Duration;

use thiserror::Error;

use crate::tree::NodeError;

/// Errors surfaced by binders, readers and the bridger.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BridgeError {
    /// The value (or keyed-binder key) is not one of the supported leaf kinds.
    #[error("unsupported value kind: {value} ({type_name})")]
    UnsupportedKind {
        value: String,
        type_name: &'static str,
    },
    #[error("timed out after {timeout:?} waiting for key '{key}'")]
    WaitTimeout { key: String, timeout: Duration },
    #[error("structure bound to '{node}' has been destroyed")]
    Destroyed { node: String },
    #[error(transparent)]
    Node(#[from] NodeError),
}

impl BridgeError {
    /// True for errors a caller may reasonably retry (currently only timeouts).
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, BridgeError::WaitTimeout { .. })
    }
}
