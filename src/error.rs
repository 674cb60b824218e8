//! Error type returned by the engine API

use std::path::PathBuf;
use thiserror::Error;

use crate::traits::{MountError, WatchError};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Invalid option: {0}")]
    InvalidOption(String),
    #[error("Cannot execute '{op}': filesystem is idle, call 'switch' with a dirname first")]
    Idle { op: &'static str },
    #[error("Cannot execute '{op}': path {path:?} is not within the watched directory")]
    PathEscape { op: &'static str, path: String },
    #[error("Cannot execute '{op}': {path} not found")]
    NotFound { op: &'static str, path: PathBuf },
    #[error("Cannot execute '{op}': {path} is a directory")]
    IsADirectory { op: &'static str, path: PathBuf },
    #[error("Public path {0:?} is already registered")]
    RouteConflict(String),
    #[error("Watch error: {0}")]
    Watch(#[from] WatchError),
    #[error("Watch was closed before the tree reflected the operation")]
    Closed,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Stable identifier for this error, sent to remote callers with the message
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::InvalidOption(_) => "invalid_option",
            EngineError::Idle { .. } => "idle",
            EngineError::PathEscape { .. } => "path_escape",
            EngineError::NotFound { .. } => "not_found",
            EngineError::IsADirectory { .. } => "is_a_directory",
            EngineError::RouteConflict(_) => "route_conflict",
            EngineError::Watch(_) => "watch",
            EngineError::Closed => "closed",
            EngineError::Io(_) => "io",
        }
    }
}

impl From<MountError> for EngineError {
    fn from(err: MountError) -> Self {
        match err {
            MountError::Conflict(prefix) => EngineError::RouteConflict(prefix),
            MountError::InvalidPrefix(prefix) => {
                EngineError::InvalidOption(format!("public path {prefix:?} is not a valid url prefix"))
            }
        }
    }
}
