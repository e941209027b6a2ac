//! Virtual path to backing path resolution.

use std::path::{Path, PathBuf};

use mirrorfs_common::{Result, VirtualPath};

/// Maps virtual paths onto the mirror root. Pure, no I/O.
#[derive(Debug, Clone)]
pub struct PathResolver {
    root: PathBuf,
    max_path_len: usize,
}

impl PathResolver {
    /// Create a resolver for a (canonical) mirror root.
    pub fn new(root: impl Into<PathBuf>, max_path_len: usize) -> Self {
        Self {
            root: root.into(),
            max_path_len,
        }
    }

    /// The mirror root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Parse and normalize a virtual path.
    ///
    /// # Errors
    /// - `InvalidPath` for traversal above the root, NUL bytes and reserved
    ///   names
    /// - `PathTooLong` for over-long paths or components
    pub fn parse(&self, virtual_path: &str) -> Result<VirtualPath> {
        VirtualPath::parse_bounded(virtual_path, self.max_path_len)
    }

    /// Backing path of an already normalized virtual path.
    pub fn backing_path(&self, path: &VirtualPath) -> PathBuf {
        let mut backing = self.root.clone();
        for component in path.components() {
            backing.push(component);
        }
        backing
    }

    /// Resolve a raw virtual path to its backing path.
    pub fn resolve(&self, virtual_path: &str) -> Result<PathBuf> {
        let path = self.parse(virtual_path)?;
        Ok(self.backing_path(&path))
    }
}
