//! File handle records and their state machine.

use parking_lot::Mutex;
use std::fmt;
use std::path::PathBuf;

use crate::buffer::StagingBuffer;
use mirrorfs_common::{Error, Result, VirtualPath};

/// Opaque identifier handed to the shim for an open file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(u64);

impl HandleId {
    /// Wrap a raw id received back from the shim.
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw value for the shim (e.g. a FUSE `fh`).
    pub fn as_raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fh#{}", self.0)
    }
}

/// Lifecycle state of a file handle.
///
/// `Unopened` is represented by the absence of a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    /// Backing file is being decrypted into the staging area.
    Staging,
    /// Staging area matches the backing file.
    Open,
    /// At least one write since the last flush.
    OpenDirty,
    /// Staging area is being re-encrypted to the backing path.
    Flushing,
    /// Handle was destroyed or failed to stage; lookups must retry.
    Closed,
}

/// Snapshot of a live handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandleInfo {
    pub id: HandleId,
    pub virtual_path: VirtualPath,
    pub backing_path: PathBuf,
    pub refcount: usize,
    pub state: HandleState,
    pub detached: bool,
    pub len: u64,
    pub staging_location: Option<PathBuf>,
}

/// One logical open of one virtual path, shared by all its openers.
pub(crate) struct FileHandle {
    pub(crate) id: HandleId,
    pub(crate) inner: Mutex<HandleInner>,
}

impl FileHandle {
    pub(crate) fn new(id: HandleId, virtual_path: VirtualPath, backing_path: PathBuf) -> Self {
        Self {
            id,
            inner: Mutex::new(HandleInner {
                id,
                virtual_path,
                backing_path,
                refcount: 0,
                state: HandleState::Staging,
                detached: false,
                staging: None,
            }),
        }
    }
}

/// Mutable part of a handle, guarded by the per-handle lock.
pub(crate) struct HandleInner {
    pub(crate) id: HandleId,
    pub(crate) virtual_path: VirtualPath,
    pub(crate) backing_path: PathBuf,
    pub(crate) refcount: usize,
    pub(crate) state: HandleState,
    /// Backing file was unlinked or replaced; never write back.
    pub(crate) detached: bool,
    pub(crate) staging: Option<Box<dyn StagingBuffer>>,
}

impl HandleInner {
    pub(crate) fn is_live(&self) -> bool {
        matches!(self.state, HandleState::Open | HandleState::OpenDirty)
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.state == HandleState::OpenDirty
    }

    pub(crate) fn mark_dirty(&mut self) {
        self.state = HandleState::OpenDirty;
    }

    pub(crate) fn buffer(&self) -> Result<&dyn StagingBuffer> {
        self.staging
            .as_deref()
            .ok_or(Error::BadHandle(self.id.as_raw()))
    }

    pub(crate) fn buffer_mut(&mut self) -> Result<&mut (dyn StagingBuffer + 'static)> {
        let id = self.id.as_raw();
        self.staging.as_deref_mut().ok_or(Error::BadHandle(id))
    }

    pub(crate) fn info(&self) -> HandleInfo {
        HandleInfo {
            id: self.id,
            virtual_path: self.virtual_path.clone(),
            backing_path: self.backing_path.clone(),
            refcount: self.refcount,
            state: self.state,
            detached: self.detached,
            len: self.staging.as_ref().map(|s| s.len()).unwrap_or(0),
            staging_location: self.staging.as_ref().and_then(|s| s.location()),
        }
    }
}
