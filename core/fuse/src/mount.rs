//! FUSE mount management.
//!
//! Provides a high-level interface for mounting and unmounting mirrors.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use fuser::{BackgroundSession, MountOption};
use tracing::{error, info};

use crate::filesystem::MirrorFilesystem;
use mirrorfs_common::{Error, Result};
use mirrorfs_mediator::Dispatcher;

/// Mount options for the FUSE filesystem.
#[derive(Debug, Clone)]
pub struct MountOptions {
    /// Allow other users to access the mount.
    pub allow_other: bool,
    /// Unmount when the process exits.
    pub auto_unmount: bool,
    /// Read-only mount.
    pub read_only: bool,
    /// Let the kernel enforce permission bits.
    pub default_permissions: bool,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            allow_other: false,
            auto_unmount: true,
            read_only: false,
            default_permissions: true,
        }
    }
}

impl MountOptions {
    fn to_fuse_options(&self) -> Vec<MountOption> {
        let mut options = vec![
            MountOption::FSName("mirrorfs".to_string()),
            MountOption::Subtype("mirrorfs".to_string()),
        ];
        if self.allow_other {
            options.push(MountOption::AllowOther);
        }
        if self.auto_unmount {
            options.push(MountOption::AutoUnmount);
        }
        if self.read_only {
            options.push(MountOption::RO);
        }
        if self.default_permissions {
            options.push(MountOption::DefaultPermissions);
        }
        options
    }
}

/// Handle to a mounted filesystem.
///
/// The session runs on a background thread and is unmounted when this handle
/// is dropped.
pub struct MountHandle {
    mount_point: PathBuf,
    session: Option<BackgroundSession>,
}

impl MountHandle {
    pub fn mount_point(&self) -> &Path {
        &self.mount_point
    }

    /// Unmount the filesystem and wait for the session thread.
    pub fn unmount(mut self) {
        if let Some(session) = self.session.take() {
            info!("Unmounting mirror from {:?}", self.mount_point);
            session.join();
        }
    }
}

impl Drop for MountHandle {
    fn drop(&mut self) {
        if self.session.take().is_some() {
            info!("Unmounting mirror from {:?}", self.mount_point);
        }
    }
}

/// Mount a dispatcher as a FUSE filesystem.
///
/// # Errors
/// - `NotFound` if the mount point does not exist
/// - `InvalidInput` if it is not a directory
/// - `Io` if FUSE refuses the mount
pub fn mount(
    dispatcher: Arc<Dispatcher>,
    mount_point: impl AsRef<Path>,
    options: MountOptions,
) -> Result<MountHandle> {
    let mount_point = mount_point.as_ref().to_path_buf();

    if !mount_point.exists() {
        return Err(Error::NotFound(format!(
            "Mount point does not exist: {:?}",
            mount_point
        )));
    }
    if !mount_point.is_dir() {
        return Err(Error::InvalidInput(format!(
            "Mount point is not a directory: {:?}",
            mount_point
        )));
    }

    info!(
        "Mounting {:?} at {:?}",
        dispatcher.mirror_root(),
        mount_point
    );

    let fs = MirrorFilesystem::new(dispatcher);
    let session = fuser::spawn_mount2(fs, &mount_point, &options.to_fuse_options()).map_err(|e| {
        error!("Failed to create FUSE session: {}", e);
        Error::Io(e)
    })?;

    info!("Mirror mounted at {:?}", mount_point);

    Ok(MountHandle {
        mount_point,
        session: Some(session),
    })
}

/// Check if FUSE is available on the system.
pub fn is_fuse_available() -> bool {
    #[cfg(target_os = "linux")]
    {
        Path::new("/dev/fuse").exists()
    }

    #[cfg(target_os = "macos")]
    {
        Path::new("/Library/Filesystems/macfuse.fs").exists()
            || Path::new("/Library/Filesystems/osxfuse.fs").exists()
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        false
    }
}

/// Platform-specific FUSE availability message.
pub fn fuse_info() -> String {
    #[cfg(target_os = "linux")]
    {
        if is_fuse_available() {
            "FUSE available via /dev/fuse".to_string()
        } else {
            "FUSE not available. Install fuse3 package.".to_string()
        }
    }

    #[cfg(target_os = "macos")]
    {
        if is_fuse_available() {
            "macFUSE available".to_string()
        } else {
            "macFUSE not installed. Visit https://osxfuse.github.io/".to_string()
        }
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        "FUSE not supported on this platform".to_string()
    }
}
