//! Error taxonomy shared by both ends of the channel

use serde::{Deserialize, Serialize};
use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Errors returned by library operations.
///
/// Per-file read failures during a tree build never surface here; they are
/// collected into the builder's path-error map instead.
#[derive(Debug, Error)]
pub enum TakiError {
    /// Malformed frame, unexpected stream state, or undecodable payload.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The caller's cancellation token fired first.
    #[error("operation cancelled")]
    Cancelled,

    /// Unknown or already closed virtual file handle.
    #[error("handle {0} not found")]
    Handle(u64),

    /// Operation requires `SetConfig` first.
    #[error("server is not configured")]
    Config,

    /// Operation requires an earlier step of the session.
    #[error("not ready: {0}")]
    NotReady(&'static str),

    /// Root discovery did not yield exactly one candidate.
    #[error("expected exactly one target root, found {}: {:?}", .0.len(), .0)]
    Ambiguity(Vec<String>),

    #[error(transparent)]
    Task(#[from] TaskError),

    /// Failure reported verbatim by the remote side.
    #[error("remote: {0}")]
    Remote(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    /// Failure observed through a shared task result.
    #[error(transparent)]
    Shared(Arc<TakiError>),
}

impl TakiError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        TakiError::Protocol(msg.into())
    }
}

/// Task lookup failures for `TaskProgress`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum TaskError {
    #[error("task does not exist")]
    NotExist,
    #[error("task does not report progress")]
    NotProgressive,
    #[error("task not started")]
    NotStarted,
}

/// Wire form of a failed call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteError {
    Handle(u64),
    Config,
    NotReady(String),
    Ambiguity(Vec<String>),
    Task(TaskError),
    Protocol(String),
    Other(String),
}

impl From<&TakiError> for RemoteError {
    fn from(err: &TakiError) -> Self {
        match err {
            TakiError::Handle(h) => RemoteError::Handle(*h),
            TakiError::Config => RemoteError::Config,
            TakiError::NotReady(what) => RemoteError::NotReady((*what).to_string()),
            TakiError::Ambiguity(roots) => RemoteError::Ambiguity(roots.clone()),
            TakiError::Task(t) => RemoteError::Task(*t),
            TakiError::Protocol(msg) => RemoteError::Protocol(msg.clone()),
            TakiError::Shared(inner) => RemoteError::from(inner.as_ref()),
            other => RemoteError::Other(other.to_string()),
        }
    }
}

impl From<RemoteError> for TakiError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::Handle(h) => TakiError::Handle(h),
            RemoteError::Config => TakiError::Config,
            // The static description is lost on the wire; keep the text.
            RemoteError::NotReady(what) => TakiError::Remote(format!("not ready: {what}")),
            RemoteError::Ambiguity(roots) => TakiError::Ambiguity(roots),
            RemoteError::Task(t) => TakiError::Task(t),
            RemoteError::Protocol(msg) => TakiError::Protocol(format!("remote: {msg}")),
            RemoteError::Other(msg) => TakiError::Remote(msg),
        }
    }
}
