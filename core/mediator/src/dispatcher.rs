//! Mediation dispatcher: the surface the shim calls.
//!
//! Validates raw arguments, resolves paths and delegates to the
//! [`StagingManager`]. Errors are returned as [`mirrorfs_common::Error`]; the
//! shim maps them to errno.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info};

use crate::buffer::StagingStore;
use crate::codec::{ContainerCodec, KeyedCodec};
use crate::config::MirrorConfig;
use crate::handle::HandleId;
use crate::resolver::PathResolver;
use crate::staging::StagingManager;
use mirrorfs_common::{Error, Result, VirtualPath};

/// Entry point for all mediated file operations of one mount.
pub struct Dispatcher {
    resolver: PathResolver,
    staging: StagingManager,
}

impl Dispatcher {
    /// Validate `config`, derive the mount key and build the dispatcher.
    ///
    /// # Errors
    /// - `InvalidInput` / `NotFound` for a bad configuration
    /// - `Crypto` if key derivation fails
    pub fn new(config: MirrorConfig) -> Result<Self> {
        let root = config.validate()?;
        let codec = KeyedCodec::from_passphrase(config.passphrase.as_bytes(), &config.kdf_params)?;
        Self::build(root, &config, Arc::new(codec))
    }

    /// Build a dispatcher around an existing codec.
    pub fn with_codec(config: MirrorConfig, codec: Arc<dyn ContainerCodec>) -> Result<Self> {
        let root = config.validate()?;
        Self::build(root, &config, codec)
    }

    fn build(root: PathBuf, config: &MirrorConfig, codec: Arc<dyn ContainerCodec>) -> Result<Self> {
        let store = StagingStore::from_mode(&config.staging)?;
        info!("Mediating mirror at {:?}", root);
        Ok(Self {
            resolver: PathResolver::new(root, config.max_path_len),
            staging: StagingManager::new(codec, store),
        })
    }

    /// Canonical mirror root.
    pub fn mirror_root(&self) -> &Path {
        self.resolver.root()
    }

    /// Backing path for a virtual path, for passthrough verbs.
    pub fn resolve(&self, virtual_path: &str) -> Result<PathBuf> {
        self.resolver.resolve(virtual_path)
    }

    /// The staging manager, for inspection.
    pub fn staging(&self) -> &StagingManager {
        &self.staging
    }

    /// Number of open handles.
    pub fn open_handles(&self) -> usize {
        self.staging.open_handles()
    }

    /// Parse a path that must name a file, not the root.
    fn file_path(&self, virtual_path: &str) -> Result<(VirtualPath, PathBuf)> {
        let path = self.resolver.parse(virtual_path)?;
        if path.is_root() {
            return Err(Error::InvalidPath(
                "The root is not a regular file".to_string(),
            ));
        }
        let backing = self.resolver.backing_path(&path);
        Ok((path, backing))
    }

    /// Open an existing file, decrypting it unless a handle is already live.
    ///
    /// # Errors
    /// - `NotFound` if the backing file is missing
    /// - `Format` / `Integrity` if it does not decrypt
    pub fn mediate_open(&self, virtual_path: &str) -> Result<HandleId> {
        let (path, backing) = self.file_path(virtual_path)?;
        debug!("open {}", path);
        self.staging.open(&path, &backing)
    }

    /// Create or truncate a file with permission bits `mode` and open it.
    pub fn mediate_create(&self, virtual_path: &str, mode: u32) -> Result<HandleId> {
        let (path, backing) = self.file_path(virtual_path)?;
        debug!("create {} mode {:o}", path, mode);
        self.staging.create(&path, &backing, mode)
    }

    /// Create an empty file without keeping it open.
    pub fn mediate_mknod(&self, virtual_path: &str, mode: u32) -> Result<()> {
        let id = self.mediate_create(virtual_path, mode)?;
        self.staging.release(id)
    }

    /// Read from an open file's staging area; short at end-of-file.
    pub fn mediate_read(&self, handle: HandleId, offset: i64, size: usize) -> Result<Vec<u8>> {
        let offset = non_negative(offset, "offset")?;
        self.staging.read(handle, offset, size)
    }

    /// Write into an open file's staging area and mark it dirty.
    ///
    /// # Errors
    /// - `OutOfRange` for a negative or overflowing offset
    /// - `FileTooLarge` if the staging area cannot grow that far
    pub fn mediate_write(&self, handle: HandleId, offset: i64, data: &[u8]) -> Result<usize> {
        let offset = non_negative(offset, "offset")?;
        self.staging.write(handle, offset, data)
    }

    /// Re-encrypt a dirty file over its backing path, keeping it open.
    pub fn mediate_fsync(&self, handle: HandleId) -> Result<()> {
        debug!("fsync {}", handle);
        self.staging.fsync(handle)
    }

    /// Drop one opener. The last one flushes and closes the handle.
    pub fn mediate_release(&self, handle: HandleId) -> Result<()> {
        debug!("release {}", handle);
        self.staging.release(handle)
    }

    /// Resize a file, open or not.
    ///
    /// # Errors
    /// - `OutOfRange` for a negative size
    /// - `FileTooLarge` if the size cannot be staged
    pub fn mediate_truncate(&self, virtual_path: &str, size: i64) -> Result<()> {
        let size = non_negative(size, "size")?;
        let (path, backing) = self.file_path(virtual_path)?;
        debug!("truncate {} to {}", path, size);
        self.staging.truncate(&path, &backing, size)
    }

    /// Remove a file. Open handles keep working but are never written back.
    pub fn mediate_unlink(&self, virtual_path: &str) -> Result<()> {
        let (path, backing) = self.file_path(virtual_path)?;
        debug!("unlink {}", path);
        self.staging.unlink(&path, &backing)
    }

    /// Rename a file or directory, carrying open handles along.
    pub fn mediate_rename(&self, from: &str, to: &str) -> Result<()> {
        let (from, _) = self.file_path(from)?;
        let (to, _) = self.file_path(to)?;
        if to.starts_with(&from) && to != from {
            return Err(Error::InvalidPath(format!(
                "Cannot move {} into itself",
                from
            )));
        }
        debug!("rename {} -> {}", from, to);
        self.staging
            .rename(&from, &to, |p| self.resolver.backing_path(p))
    }

    /// Plaintext size to report for a file whose container is `backing_len`
    /// bytes long.
    pub fn logical_size(&self, virtual_path: &str, backing_len: u64) -> Result<u64> {
        let path = self.resolver.parse(virtual_path)?;
        Ok(self
            .staging
            .logical_size(&path)
            .unwrap_or_else(|| mirrorfs_crypto::plaintext_len(backing_len).unwrap_or(0)))
    }
}

fn non_negative(value: i64, what: &str) -> Result<u64> {
    u64::try_from(value).map_err(|_| Error::OutOfRange(format!("Negative {}: {}", what, value)))
}
