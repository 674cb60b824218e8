//! Directory snapshot model and builder
//!
//! A `TreeNode` is never edited in place: every rebuild produces a fresh tree
//! and the engine swaps the whole value.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use serde::{Deserialize, Serialize};

use crate::sandbox::{normalize, relative, to_slash};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    File,
    Directory,
}

/// One entry of the watched directory snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeNode {
    /// Path relative to the working root, slash separated
    pub path: String,
    /// Path relative to the watched root, empty for the root itself
    pub rel_path: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extension: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// `None` for files and for directories beyond the depth limit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<TreeNode>>,
}

impl TreeNode {
    pub fn is_dir(&self) -> bool {
        self.kind == NodeKind::Directory
    }
}

/// Depth-first, pre-order search returning the first node matching `predicate`
pub fn find_node<'a, F>(tree: &'a TreeNode, mut predicate: F) -> Option<&'a TreeNode>
where
    F: FnMut(&TreeNode) -> bool,
{
    let mut stack = vec![tree];

    while let Some(node) = stack.pop() {
        if predicate(node) {
            return Some(node);
        }
        if let Some(children) = &node.children {
            stack.extend(children.iter().rev());
        }
    }

    None
}

/// Look a node up by path relative to the watched root, working-root path, or url
pub fn find_in_tree<'a>(tree: &'a TreeNode, path_or_url: &str) -> Option<&'a TreeNode> {
    let trimmed = path_or_url.strip_prefix("./").unwrap_or(path_or_url);
    let normalized = to_slash(&normalize(Path::new(trimmed)));

    find_node(tree, |node| {
        node.rel_path == normalized
            || node.path == normalized
            || node.url.as_deref() == Some(path_or_url)
    })
}

/// Map file names to urls for every file whose extension matches `filter_ext`
///
/// The leading dot of `filter_ext` is optional. Names lose their extension
/// unless `keep_extension` is set; a later file with the same name wins.
pub fn url_map(tree: &TreeNode, filter_ext: &str, keep_extension: bool) -> BTreeMap<String, String> {
    let wanted = filter_ext.trim_start_matches('.');
    let mut map = BTreeMap::new();
    let mut stack = vec![tree];

    while let Some(node) = stack.pop() {
        if let (Some(ext), Some(url)) = (&node.extension, &node.url) {
            if !ext.is_empty() && ext.ends_with(wanted) {
                let name = if keep_extension {
                    node.name.clone()
                } else {
                    node.name.strip_suffix(ext.as_str()).unwrap_or(&node.name).to_string()
                };
                map.insert(name, url.clone());
            }
        }
        if let Some(children) = &node.children {
            stack.extend(children.iter().rev());
        }
    }

    map
}

/// Builds snapshots of one watched root
///
/// File sizes are only collected when no depth limit is set.
#[derive(Debug, Clone)]
pub struct TreeBuilder {
    cwd: PathBuf,
    root: PathBuf,
    public_path: Option<String>,
    base_url: Option<String>,
    depth: Option<usize>,
}

impl TreeBuilder {
    /// `cwd` must be absolute; `root` may be relative to it
    pub fn new(
        cwd: &Path,
        root: &Path,
        public_path: Option<String>,
        base_url: Option<String>,
        depth: Option<usize>,
    ) -> Self {
        let cwd = normalize(cwd);
        let root = normalize(&cwd.join(root));
        Self {
            cwd,
            root,
            public_path,
            base_url,
            depth,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of `abs` as exposed in `TreeNode::path`
    pub fn display_path(&self, abs: &Path) -> String {
        to_slash(&relative(&self.cwd, abs))
    }

    /// Whether a path below the root is deep enough to be hidden by the depth limit
    pub fn is_beyond_depth(&self, abs: &Path) -> bool {
        match self.depth {
            Some(depth) => relative(&self.root, abs).components().count() > depth + 1,
            None => false,
        }
    }

    /// Whether a path below the root goes through a dot-prefixed entry, which snapshots skip
    pub fn is_hidden(&self, abs: &Path) -> bool {
        relative(&self.root, abs)
            .components()
            .any(|c| matches!(c, Component::Normal(segment) if segment.to_string_lossy().starts_with('.')))
    }

    /// Walk the root; `None` when the root does not exist (e.g. deleted concurrently)
    pub fn build(&self) -> Option<TreeNode> {
        let meta = match fs::metadata(&self.root) {
            Ok(meta) if meta.is_dir() => meta,
            Ok(_) => {
                tracing::warn!(root = %self.root.display(), "Watched root is not a directory");
                return None;
            }
            Err(e) => {
                tracing::debug!(root = %self.root.display(), error = %e, "Watched root unavailable");
                return None;
            }
        };

        Some(self.build_node(&self.root, &meta, 0))
    }

    fn build_node(&self, abs: &Path, meta: &fs::Metadata, level: usize) -> TreeNode {
        let name = abs
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let rel_path = to_slash(&relative(&self.root, abs));
        let kind = if meta.is_dir() { NodeKind::Directory } else { NodeKind::File };

        let mut node = TreeNode {
            path: self.display_path(abs),
            url: self.url_for(&rel_path, kind),
            rel_path,
            name,
            kind,
            extension: None,
            mime_type: None,
            size: None,
            children: None,
        };

        match kind {
            NodeKind::File => {
                let extension = abs
                    .extension()
                    .map(|e| format!(".{}", e.to_string_lossy()))
                    .unwrap_or_default();
                node.mime_type = mime_type_for(&extension).map(str::to_string);
                node.extension = Some(extension);
                if self.depth.is_none() {
                    node.size = Some(meta.len());
                }
            }
            NodeKind::Directory => {
                let enumerate = self.depth.map_or(true, |depth| level <= depth);
                if enumerate {
                    node.children = Some(self.read_children(abs, level));
                }
            }
        }

        node
    }

    fn read_children(&self, dir: &Path, level: usize) -> Vec<TreeNode> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::debug!(dir = %dir.display(), error = %e, "Failed to read directory");
                return Vec::new();
            }
        };

        let mut children = Vec::new();
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::debug!(dir = %dir.display(), error = %e, "Skipping unreadable entry");
                    continue;
                }
            };

            if entry.file_name().to_string_lossy().starts_with('.') {
                continue;
            }

            let path = entry.path();
            // follows symlinks, entries may vanish between read_dir and stat
            let meta = match fs::metadata(&path) {
                Ok(meta) => meta,
                Err(e) => {
                    tracing::debug!(path = %path.display(), error = %e, "Skipping entry");
                    continue;
                }
            };

            if meta.is_dir() || meta.is_file() {
                children.push(self.build_node(&path, &meta, level + 1));
            }
        }

        children
    }

    fn url_for(&self, rel_path: &str, kind: NodeKind) -> Option<String> {
        let public_path = self.public_path.as_ref()?;

        let mut url = format!("/{}/{}", public_path, rel_path);
        if let Some(base_url) = self.base_url.as_deref().filter(|b| !b.is_empty()) {
            url = format!("/{}/{}", base_url, url);
        }
        if kind == NodeKind::Directory {
            url.push('/');
        }

        Some(collapse_slashes(&url))
    }
}

fn collapse_slashes(url: &str) -> String {
    let mut out = String::with_capacity(url.len());
    let mut previous_slash = false;
    for c in url.chars() {
        if c == '/' {
            if previous_slash {
                continue;
            }
            previous_slash = true;
        } else {
            previous_slash = false;
        }
        out.push(c);
    }
    out
}

/// Mime type from a file extension such as `.json`
pub fn mime_type_for(extension: &str) -> Option<&'static str> {
    let ext = extension.trim_start_matches('.');
    if ext.is_empty() {
        return None;
    }
    mime_guess::from_ext(ext).first_raw()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sorted(mut node: TreeNode) -> TreeNode {
        if let Some(children) = node.children.as_mut() {
            children.sort_by(|a, b| a.name.cmp(&b.name));
            let taken = std::mem::take(children);
            *children = taken.into_iter().map(sorted).collect();
        }
        node
    }

    fn fixture() -> TempDir {
        let cwd = TempDir::new().unwrap();
        let root = cwd.path().join("assets");
        fs::create_dir_all(root.join("sub/deep")).unwrap();
        fs::write(root.join("a.json"), "{}").unwrap();
        fs::write(root.join("sub/f.txt"), "hi").unwrap();
        fs::write(root.join("sub/deep/g.wav"), "RIFF").unwrap();
        fs::write(root.join(".hidden"), "x").unwrap();
        fs::create_dir_all(root.join(".git")).unwrap();
        cwd
    }

    #[test]
    fn test_build_decorates_nodes() {
        let cwd = fixture();
        let builder = TreeBuilder::new(cwd.path(), Path::new("assets"), None, None, None);
        let tree = sorted(builder.build().unwrap());

        assert_eq!(tree.path, "assets");
        assert_eq!(tree.rel_path, "");
        assert_eq!(tree.name, "assets");
        assert!(tree.is_dir());
        assert!(tree.url.is_none());

        let children = tree.children.as_ref().unwrap();
        let names: Vec<_> = children.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["a.json", "sub"]);

        let json = &children[0];
        assert_eq!(json.path, "assets/a.json");
        assert_eq!(json.rel_path, "a.json");
        assert_eq!(json.kind, NodeKind::File);
        assert_eq!(json.extension.as_deref(), Some(".json"));
        assert_eq!(json.mime_type.as_deref(), Some("application/json"));
        assert_eq!(json.size, Some(2));
        assert!(json.children.is_none());

        let sub = &children[1];
        assert!(sub.extension.is_none());
        assert!(sub.size.is_none());
        assert_eq!(sub.rel_path, "sub");
    }

    #[test]
    fn test_build_missing_root_returns_none() {
        let cwd = TempDir::new().unwrap();
        let builder = TreeBuilder::new(cwd.path(), Path::new("missing"), None, None, None);
        assert!(builder.build().is_none());
    }

    #[test]
    fn test_urls_with_public_path_and_base_url() {
        let cwd = fixture();
        let builder = TreeBuilder::new(
            cwd.path(),
            Path::new("assets"),
            Some("public".to_string()),
            None,
            None,
        );
        let tree = builder.build().unwrap();

        assert_eq!(tree.url.as_deref(), Some("/public/"));
        assert_eq!(find_in_tree(&tree, "sub").unwrap().url.as_deref(), Some("/public/sub/"));
        assert_eq!(find_in_tree(&tree, "sub/f.txt").unwrap().url.as_deref(), Some("/public/sub/f.txt"));

        let builder = TreeBuilder::new(
            cwd.path(),
            Path::new("assets"),
            Some("/public/".to_string()),
            Some("app".to_string()),
            None,
        );
        let tree = builder.build().unwrap();
        assert_eq!(tree.url.as_deref(), Some("/app/public/"));
        assert_eq!(find_in_tree(&tree, "a.json").unwrap().url.as_deref(), Some("/app/public/a.json"));
    }

    #[test]
    fn test_depth_limits_enumeration_and_drops_size() {
        let cwd = fixture();
        let builder = TreeBuilder::new(cwd.path(), Path::new("assets"), None, None, Some(0));
        let tree = sorted(builder.build().unwrap());

        let children = tree.children.as_ref().unwrap();
        assert_eq!(children.len(), 2);
        assert!(children[0].size.is_none(), "size is not collected under a depth limit");

        // `sub` sits at level 1: listed, but not enumerated
        assert_eq!(children[1].name, "sub");
        assert!(children[1].children.is_none());
        assert!(find_in_tree(&tree, "sub/f.txt").is_none());

        let builder = TreeBuilder::new(cwd.path(), Path::new("assets"), None, None, Some(1));
        let tree = builder.build().unwrap();
        assert!(find_in_tree(&tree, "sub/f.txt").is_some());
        let deep = find_in_tree(&tree, "sub/deep").unwrap();
        assert!(deep.children.is_none());
        assert!(find_in_tree(&tree, "sub/deep/g.wav").is_none());
    }

    #[test]
    fn test_is_beyond_depth() {
        let cwd = fixture();
        let root = cwd.path().join("assets");
        let builder = TreeBuilder::new(cwd.path(), Path::new("assets"), None, None, Some(0));

        assert!(!builder.is_beyond_depth(&root.join("sub")));
        assert!(builder.is_beyond_depth(&root.join("sub/f.txt")));

        let unlimited = TreeBuilder::new(cwd.path(), Path::new("assets"), None, None, None);
        assert!(!unlimited.is_beyond_depth(&root.join("a/b/c/d")));
    }

    #[test]
    fn test_is_hidden() {
        let cwd = fixture();
        let root = cwd.path().join("assets");
        let builder = TreeBuilder::new(cwd.path(), Path::new("assets"), None, None, None);

        assert!(builder.is_hidden(&root.join(".env")));
        assert!(builder.is_hidden(&root.join(".git/config")));
        assert!(builder.is_hidden(&root.join("sub/.DS_Store")));
        assert!(!builder.is_hidden(&root.join("sub/file.txt")));
        assert!(!builder.is_hidden(&root.join("archive.tar.gz")));
    }

    #[test]
    fn test_rebuild_is_structurally_equal() {
        let cwd = fixture();
        let builder = TreeBuilder::new(cwd.path(), Path::new("assets"), None, None, None);

        let first = sorted(builder.build().unwrap());
        let second = sorted(builder.build().unwrap());
        assert_eq!(first, second);
    }

    #[test]
    fn test_find_in_tree_by_path_and_url() {
        let cwd = fixture();
        let builder = TreeBuilder::new(
            cwd.path(),
            Path::new("assets"),
            Some("public".to_string()),
            None,
            None,
        );
        let tree = builder.build().unwrap();

        assert_eq!(find_in_tree(&tree, "./sub/f.txt").unwrap().name, "f.txt");
        assert_eq!(find_in_tree(&tree, "/public/sub/f.txt").unwrap().name, "f.txt");
        assert_eq!(find_in_tree(&tree, "assets/a.json").unwrap().name, "a.json");
        assert!(find_in_tree(&tree, "nope.txt").is_none());
        assert!(find_in_tree(&tree, ".hidden").is_none());
    }

    #[test]
    fn test_url_map_filters_by_extension() {
        let cwd = fixture();
        let root = cwd.path().join("assets");
        fs::write(root.join("b.wav"), "RIFF").unwrap();

        let builder = TreeBuilder::new(
            cwd.path(),
            Path::new("assets"),
            Some("public".to_string()),
            None,
            None,
        );
        let tree = builder.build().unwrap();

        let map = url_map(&tree, "wav", false);
        assert_eq!(map.len(), 2);
        assert_eq!(map.get("b").map(String::as_str), Some("/public/b.wav"));
        assert_eq!(map.get("g").map(String::as_str), Some("/public/sub/deep/g.wav"));

        let map = url_map(&tree, ".wav", true);
        assert!(map.contains_key("b.wav"));
    }

    #[test]
    fn test_mime_type_lookup() {
        assert_eq!(mime_type_for(".JSON"), Some("application/json"));
        assert!(mime_type_for("wav").unwrap().starts_with("audio/"));
        assert_eq!(mime_type_for(".txt"), Some("text/plain"));
        assert_eq!(mime_type_for(".png"), Some("image/png"));
        assert_eq!(mime_type_for(".unknownext"), None);
        assert_eq!(mime_type_for(""), None);
    }

    #[test]
    fn test_find_node_is_depth_first() {
        let leaf = |name: &str| TreeNode {
            path: name.to_string(),
            rel_path: name.to_string(),
            name: name.to_string(),
            kind: NodeKind::File,
            extension: Some(String::new()),
            mime_type: None,
            size: None,
            url: None,
            children: None,
        };
        let mut dir = leaf("d");
        dir.kind = NodeKind::Directory;
        dir.children = Some(vec![leaf("x")]);
        let mut root = leaf("");
        root.kind = NodeKind::Directory;
        root.children = Some(vec![dir, leaf("x")]);

        let mut visited = Vec::new();
        let found = find_node(&root, |n| {
            visited.push(n.path.clone());
            n.name == "x"
        });
        assert!(found.is_some());
        assert_eq!(visited, vec!["", "d", "x"]);
    }
}
