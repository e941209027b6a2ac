//! Common types used throughout mirrorfs.

use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::Zeroize;

/// Default upper bound on the byte length of a virtual path.
pub const DEFAULT_MAX_PATH_LEN: usize = 4096;

/// Upper bound on the byte length of a single path component.
pub const MAX_NAME_LEN: usize = 255;

/// Names starting with this prefix belong to mirrorfs itself (temporary
/// replace files) and can never be addressed through a virtual path.
pub const RESERVED_PREFIX: &str = ".mirrorfs-";

/// A normalized path inside the mounted tree, independent of the mirror root.
///
/// Always absolute, never contains `.` or `..` components.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VirtualPath {
    components: Vec<String>,
}

impl VirtualPath {
    /// Create a root path.
    pub fn root() -> Self {
        Self {
            components: Vec::new(),
        }
    }

    /// Parse and normalize a path string using the default length bound.
    pub fn parse(path: &str) -> crate::Result<Self> {
        Self::parse_bounded(path, DEFAULT_MAX_PATH_LEN)
    }

    /// Parse and normalize a path string.
    ///
    /// Empty and `.` components are dropped and `..` pops the previous
    /// component.
    ///
    /// # Errors
    /// - `PathTooLong` if the path is longer than `max_len` or a component
    ///   is longer than 255 bytes
    /// - `InvalidPath` if the path contains a NUL byte or a reserved
    ///   component, or a `..` would climb above the root
    pub fn parse_bounded(path: &str, max_len: usize) -> crate::Result<Self> {
        if path.len() > max_len {
            return Err(crate::Error::PathTooLong(format!(
                "path exceeds {} bytes",
                max_len
            )));
        }
        if path.contains('\0') {
            return Err(crate::Error::InvalidPath("path contains NUL".to_string()));
        }

        let mut components: Vec<String> = Vec::new();
        for comp in path.split('/') {
            match comp {
                "" | "." => {}
                ".." => {
                    if components.pop().is_none() {
                        return Err(crate::Error::InvalidPath(format!(
                            "{} escapes the mirror root",
                            path
                        )));
                    }
                }
                name => {
                    check_component(name)?;
                    components.push(name.to_string());
                }
            }
        }

        Ok(Self { components })
    }

    /// Check if this is the root path.
    pub fn is_root(&self) -> bool {
        self.components.is_empty()
    }

    /// Get the parent path, if any.
    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            None
        } else {
            let mut components = self.components.clone();
            components.pop();
            Some(Self { components })
        }
    }

    /// Get the file/directory name (last component).
    pub fn name(&self) -> Option<&str> {
        self.components.last().map(|s| s.as_str())
    }

    /// Join this path with a single child component.
    pub fn join(&self, child: &str) -> crate::Result<Self> {
        if child.is_empty() || child == "." || child == ".." || child.contains('/') {
            return Err(crate::Error::InvalidPath(format!(
                "invalid child component: {:?}",
                child
            )));
        }
        check_component(child)?;
        let mut components = self.components.clone();
        components.push(child.to_string());
        Ok(Self { components })
    }

    /// Get the path components.
    pub fn components(&self) -> &[String] {
        &self.components
    }

    /// True if `self` equals `ancestor` or lies underneath it.
    pub fn starts_with(&self, ancestor: &VirtualPath) -> bool {
        self.components.len() >= ancestor.components.len()
            && self.components[..ancestor.components.len()] == ancestor.components[..]
    }

    /// Move this path from under `from` to under `to`.
    ///
    /// Returns `None` if `self` is not at or under `from`.
    pub fn rebase(&self, from: &VirtualPath, to: &VirtualPath) -> Option<Self> {
        if !self.starts_with(from) {
            return None;
        }
        let mut components = to.components.clone();
        components.extend_from_slice(&self.components[from.components.len()..]);
        Some(Self { components })
    }

    /// Convert to a string representation.
    pub fn to_string_path(&self) -> String {
        if self.is_root() {
            "/".to_string()
        } else {
            format!("/{}", self.components.join("/"))
        }
    }
}

impl fmt::Display for VirtualPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_string_path())
    }
}

fn check_component(name: &str) -> crate::Result<()> {
    if name.len() > MAX_NAME_LEN {
        return Err(crate::Error::PathTooLong(format!(
            "component exceeds {} bytes",
            MAX_NAME_LEN
        )));
    }
    if name.starts_with(RESERVED_PREFIX) {
        return Err(crate::Error::InvalidPath(format!(
            "{} is a reserved name",
            name
        )));
    }
    Ok(())
}

/// Sensitive data wrapper that zeroizes on drop.
#[derive(Clone, Zeroize)]
#[zeroize(drop)]
pub struct SensitiveBytes(Vec<u8>);

impl SensitiveBytes {
    /// Create new sensitive bytes.
    pub fn new(data: Vec<u8>) -> Self {
        Self(data)
    }

    /// Get a reference to the inner bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Get the length.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for SensitiveBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SensitiveBytes([REDACTED; {} bytes])", self.0.len())
    }
}
