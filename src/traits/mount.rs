//! Static file mount registration trait

use std::path::Path;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MountError {
    #[error("Route already registered: {0}")]
    Conflict(String),
    #[error("Invalid url prefix: {0}")]
    InvalidPrefix(String),
}

/// Registration token returned by `MountRegistrar::mount`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountHandle {
    id: u64,
    prefix: String,
}

impl MountHandle {
    pub fn new(id: u64, prefix: impl Into<String>) -> Self {
        Self { id, prefix: prefix.into() }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

/// Serves a directory under a URL prefix
///
/// Production: `StaticRouteTable`
/// Testing: `MockMountRegistrar`
#[cfg_attr(test, mockall::automock)]
pub trait MountRegistrar: Send + Sync {
    /// Start serving `directory` under `url_prefix`
    fn mount(&self, url_prefix: &str, directory: &Path) -> Result<MountHandle, MountError>;

    /// Stop serving a previously mounted directory
    fn unmount(&self, handle: MountHandle);
}
