//! Mount configuration injected by the bootstrap.

use std::path::{Path, PathBuf};

use mirrorfs_common::{Error, Result, SensitiveBytes, DEFAULT_MAX_PATH_LEN};
use mirrorfs_crypto::KdfParams;

/// Where plaintext staging areas live while a file is open.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StagingMode {
    /// Zeroizing in-process buffers.
    #[default]
    Memory,
    /// Private files in a fresh 0700 directory under `parent`
    /// (the system temp directory if `None`).
    Disk { parent: Option<PathBuf> },
}

/// Configuration for one mounted mirror.
#[derive(Debug, Clone)]
pub struct MirrorConfig {
    /// Directory holding the encrypted containers.
    pub mirror_root: PathBuf,
    /// Passphrase the mount key is derived from.
    pub passphrase: SensitiveBytes,
    /// Staging backend.
    pub staging: StagingMode,
    /// Argon2id parameters for the passphrase stretch.
    pub kdf_params: KdfParams,
    /// Longest virtual path accepted, in bytes.
    pub max_path_len: usize,
}

impl MirrorConfig {
    /// Create a configuration with default staging and KDF settings.
    pub fn new(mirror_root: impl Into<PathBuf>, passphrase: impl Into<Vec<u8>>) -> Self {
        Self {
            mirror_root: mirror_root.into(),
            passphrase: SensitiveBytes::new(passphrase.into()),
            staging: StagingMode::default(),
            kdf_params: KdfParams::mirror_default(),
            max_path_len: DEFAULT_MAX_PATH_LEN,
        }
    }

    /// Set the staging backend.
    pub fn with_staging(mut self, staging: StagingMode) -> Self {
        self.staging = staging;
        self
    }

    /// Set the KDF parameters.
    pub fn with_kdf_params(mut self, params: KdfParams) -> Self {
        self.kdf_params = params;
        self
    }

    /// Set the maximum virtual path length.
    pub fn with_max_path_len(mut self, max_path_len: usize) -> Self {
        self.max_path_len = max_path_len;
        self
    }

    /// Check the configuration and return the canonical mirror root.
    ///
    /// # Errors
    /// - `InvalidInput` for an empty passphrase, a zero path bound, a mirror
    ///   root that is not a directory, or a staging directory inside the
    ///   mirror
    /// - `NotFound` if the mirror root does not exist
    pub fn validate(&self) -> Result<PathBuf> {
        if self.passphrase.is_empty() {
            return Err(Error::InvalidInput("Passphrase cannot be empty".to_string()));
        }
        if self.max_path_len == 0 {
            return Err(Error::InvalidInput(
                "max_path_len must be positive".to_string(),
            ));
        }

        let root = canonical_dir(&self.mirror_root)?;

        if let StagingMode::Disk {
            parent: Some(parent),
        } = &self.staging
        {
            let parent = canonical_dir(parent)?;
            if parent.starts_with(&root) {
                return Err(Error::InvalidInput(format!(
                    "Staging directory {} lies inside the mirror",
                    parent.display()
                )));
            }
        }

        Ok(root)
    }
}

fn canonical_dir(path: &Path) -> Result<PathBuf> {
    let canonical = path
        .canonicalize()
        .map_err(|e| Error::from_backing_io(e, &path.display().to_string()))?;
    if !canonical.is_dir() {
        return Err(Error::InvalidInput(format!(
            "{} is not a directory",
            canonical.display()
        )));
    }
    Ok(canonical)
}
