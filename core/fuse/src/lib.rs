//! FUSE shim for mirrorfs.
//!
//! Presents the plaintext view of a mirror directory as a mounted
//! filesystem. Content operations are mediated by
//! [`mirrorfs_mediator::Dispatcher`]; everything else is passed through to
//! the backing directory.
//!
//! # Feature Flags
//! - `fuse`: Enable FUSE support (requires libfuse3-dev on Linux or macFUSE on macOS)

pub mod errno;
pub mod inode;
pub mod passthrough;

#[cfg(feature = "fuse")]
pub mod filesystem;

#[cfg(feature = "fuse")]
pub mod mount;

#[cfg(feature = "fuse")]
pub use filesystem::MirrorFilesystem;

#[cfg(feature = "fuse")]
pub use mount::{fuse_info, is_fuse_available, mount, MountHandle, MountOptions};

/// Stub module for when FUSE is not available.
#[cfg(not(feature = "fuse"))]
pub mod mount {
    use mirrorfs_common::{Error, Result};
    use mirrorfs_mediator::Dispatcher;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;

    /// Mount options placeholder.
    #[derive(Debug, Clone, Default)]
    pub struct MountOptions {
        pub allow_other: bool,
        pub auto_unmount: bool,
        pub read_only: bool,
        pub default_permissions: bool,
    }

    /// Mount handle placeholder.
    pub struct MountHandle {
        mount_point: PathBuf,
    }

    impl MountHandle {
        pub fn mount_point(&self) -> &Path {
            &self.mount_point
        }

        pub fn unmount(self) {
            drop(self);
        }
    }

    /// Check if FUSE is available (always false without feature).
    pub fn is_fuse_available() -> bool {
        false
    }

    /// Get FUSE info message.
    pub fn fuse_info() -> String {
        "FUSE support not compiled in. Rebuild with --features fuse".to_string()
    }

    /// Mount stub - always returns error.
    pub fn mount<P: AsRef<Path>>(
        _dispatcher: Arc<Dispatcher>,
        _mount_point: P,
        _options: MountOptions,
    ) -> Result<MountHandle> {
        Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "FUSE support not compiled. Rebuild with --features fuse",
        )))
    }
}

#[cfg(not(feature = "fuse"))]
pub use mount::{fuse_info, is_fuse_available, mount, MountHandle, MountOptions};
