//! Path containment checks for every mutating operation
//!
//! All comparisons are lexical on absolute, normalized paths: `.` and `..`
//! segments are folded before computing the relative path from the root.
//! Symlinks inside the root are not followed.

use std::path::{Component, Path, PathBuf};

use crate::error::EngineError;

/// Fold `.` and `..` segments without touching the filesystem
pub fn normalize(path: &Path) -> PathBuf {
    let mut out: Vec<Component<'_>> = Vec::new();

    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.last() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                // `/..` is `/`
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => out.push(component),
            },
            other => out.push(other),
        }
    }

    out.iter().map(|c| c.as_os_str()).collect()
}

/// Relative path leading from `from` to `to`
///
/// Both paths are normalized first. Returns an empty path when they are equal.
pub fn relative(from: &Path, to: &Path) -> PathBuf {
    let from = normalize(from);
    let to = normalize(to);

    let from_parts: Vec<_> = from.components().collect();
    let to_parts: Vec<_> = to.components().collect();

    let common = from_parts
        .iter()
        .zip(to_parts.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut rel = PathBuf::new();
    for _ in common..from_parts.len() {
        rel.push("..");
    }
    for part in &to_parts[common..] {
        rel.push(part.as_os_str());
    }
    rel
}

/// Slash-separated rendering, independent of the host separator
pub fn to_slash(path: &Path) -> String {
    let parts: Vec<String> = path
        .components()
        .filter_map(|c| match c {
            Component::RootDir => None,
            other => Some(other.as_os_str().to_string_lossy().into_owned()),
        })
        .collect();

    let joined = parts.join("/");
    if path.has_root() {
        format!("/{joined}")
    } else {
        joined
    }
}

/// Resolve `candidate` against `root` the way a shell would
///
/// Absolute candidates replace the root entirely, which is what lets the
/// containment check reject them.
pub fn resolve(candidate: &str, root: &Path) -> PathBuf {
    normalize(&root.join(candidate))
}

/// Whether `path` lies strictly inside `root`
///
/// The root itself is not within itself: nothing may act on the watched
/// directory as a whole.
pub fn is_within(path: &Path, root: &Path) -> bool {
    let rel = relative(root, path);
    match rel.components().next() {
        None => false,
        Some(Component::ParentDir) => false,
        Some(Component::Normal(_)) => true,
        // a different drive or root entirely
        Some(_) => false,
    }
}

/// Containment guard bound to one watched root
#[derive(Debug, Clone)]
pub struct PathSandbox {
    root: PathBuf,
}

impl PathSandbox {
    /// `root` must be absolute
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: normalize(root.as_ref()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn resolve(&self, candidate: &str) -> PathBuf {
        resolve(candidate, &self.root)
    }

    pub fn is_within(&self, path: &Path) -> bool {
        is_within(path, &self.root)
    }

    /// Resolve `candidate` and fail with `PathEscape` unless it stays inside the root
    pub fn check(&self, op: &'static str, candidate: &str) -> Result<PathBuf, EngineError> {
        let resolved = self.resolve(candidate);
        if !self.is_within(&resolved) {
            tracing::warn!(op, candidate, root = %self.root.display(), "Rejected path outside sandbox");
            return Err(EngineError::PathEscape {
                op,
                path: candidate.to_string(),
            });
        }
        Ok(resolved)
    }
}
