//! In-process static route table
//!
//! Maps url prefixes to directories the way an HTTP static middleware would.
//! The transport layer calls `resolve` for each GET and serves the file or
//! answers 404.

use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::sandbox::{is_within, resolve};
use crate::traits::{MountError, MountHandle, MountRegistrar};

#[derive(Debug, Clone)]
struct Route {
    id: u64,
    prefix: String,
    directory: PathBuf,
}

#[derive(Debug, Default)]
pub struct StaticRouteTable {
    routes: RwLock<Vec<Route>>,
    next_id: AtomicU64,
}

impl StaticRouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Route>> {
        self.routes.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Route>> {
        self.routes.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Currently mounted `(prefix, directory)` pairs
    pub fn routes(&self) -> Vec<(String, PathBuf)> {
        self.read()
            .iter()
            .map(|route| (route.prefix.clone(), route.directory.clone()))
            .collect()
    }

    /// File served for `url`, `None` for a 404
    ///
    /// Query strings are ignored. Urls that would leave the mounted directory
    /// and directories themselves are never served.
    pub fn resolve(&self, url: &str) -> Option<PathBuf> {
        let path = url.split(['?', '#']).next().unwrap_or_default();
        let routes = self.read();

        let route = routes
            .iter()
            .filter(|route| {
                path.strip_prefix(route.prefix.as_str())
                    .map(|rest| rest.is_empty() || rest.starts_with('/'))
                    .unwrap_or(false)
            })
            .max_by_key(|route| route.prefix.len())?;

        let rest = path[route.prefix.len()..].trim_start_matches('/');
        let file = resolve(rest, &route.directory);
        if !is_within(&file, &route.directory) {
            tracing::debug!(url, "Refusing url outside mounted directory");
            return None;
        }

        file.is_file().then_some(file)
    }
}

fn valid_prefix(prefix: &str) -> bool {
    prefix.starts_with('/')
        && prefix.len() > 1
        && !prefix.ends_with('/')
        && Path::new(prefix)
            .components()
            .all(|c| matches!(c, Component::RootDir | Component::Normal(_)))
}

impl MountRegistrar for StaticRouteTable {
    fn mount(&self, url_prefix: &str, directory: &Path) -> Result<MountHandle, MountError> {
        if !valid_prefix(url_prefix) {
            return Err(MountError::InvalidPrefix(url_prefix.to_string()));
        }

        let mut routes = self.write();
        if routes.iter().any(|route| route.prefix == url_prefix) {
            return Err(MountError::Conflict(url_prefix.to_string()));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        routes.push(Route {
            id,
            prefix: url_prefix.to_string(),
            directory: directory.to_path_buf(),
        });
        tracing::debug!(prefix = url_prefix, directory = %directory.display(), "Route mounted");

        Ok(MountHandle::new(id, url_prefix))
    }

    fn unmount(&self, handle: MountHandle) {
        self.write().retain(|route| route.id != handle.id());
        tracing::debug!(prefix = handle.prefix(), "Route unmounted");
    }
}
