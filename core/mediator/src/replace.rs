//! Atomic replacement of backing files.
//!
//! A container is written to a reserved sibling name in the same directory,
//! synced, then renamed over the target. Readers of the backing path see the
//! old container or the new one, never a mix.

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use tracing::warn;

use mirrorfs_common::{Error, Result, RESERVED_PREFIX};

/// Replace `target` with `contents` in a single rename.
///
/// The replacement inherits the permissions of the file it replaces. On any
/// failure before the rename the temporary file is removed and `target` is
/// left untouched.
///
/// # Errors
/// - `InvalidPath` if `target` has no parent directory
/// - `Io` if writing, syncing or renaming fails
pub fn atomic_replace(target: &Path, contents: &[u8]) -> Result<()> {
    let parent = target
        .parent()
        .ok_or_else(|| Error::InvalidPath(format!("{} has no parent", target.display())))?;

    let mut temp = tempfile::Builder::new()
        .prefix(RESERVED_PREFIX)
        .suffix(".tmp")
        .tempfile_in(parent)?;

    temp.write_all(contents)?;
    if let Ok(existing) = fs::metadata(target) {
        temp.as_file().set_permissions(existing.permissions())?;
    }
    temp.as_file().sync_all()?;

    temp.persist(target).map_err(|e| Error::Io(e.error))?;

    // The rename already happened; a failed directory sync only weakens
    // durability, so it is logged rather than reported.
    if let Err(e) = File::open(parent).and_then(|dir| dir.sync_all()) {
        warn!("Failed to sync directory {:?}: {}", parent, e);
    }

    Ok(())
}
