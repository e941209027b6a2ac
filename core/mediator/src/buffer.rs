//! Staging areas: the plaintext working copy of one open file.
//!
//! Two backends share the [`StagingBuffer`] trait: zeroizing memory buffers
//! and private files in a directory outside the mirror. Both overwrite their
//! contents with zeros when dropped.

use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::{debug, warn};
use zeroize::{Zeroize, Zeroizing};

use crate::config::StagingMode;
use crate::handle::HandleId;
use mirrorfs_common::{Error, Result};

/// Chunk size used when zero-filling disk staging files.
const ZERO_CHUNK: usize = 64 * 1024;

/// Plaintext working copy of one file.
pub trait StagingBuffer: Send {
    /// Current length in bytes.
    fn len(&self) -> u64;

    /// True if the buffer holds no bytes.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read up to `size` bytes at `offset`. Short past end-of-file.
    fn read_at(&self, offset: u64, size: usize) -> Result<Vec<u8>>;

    /// Write `data` at `offset`, zero-filling any gap past the current end.
    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()>;

    /// Grow (zero-filled) or shrink to `len` bytes.
    fn set_len(&mut self, len: u64) -> Result<()>;

    /// Entire contents, for re-encryption.
    fn contents(&self) -> Result<Zeroizing<Vec<u8>>>;

    /// On-disk location, if the buffer lives on disk.
    fn location(&self) -> Option<PathBuf> {
        None
    }
}

fn to_usize(value: u64) -> Result<usize> {
    usize::try_from(value).map_err(|_| Error::OutOfRange(format!("{} exceeds address space", value)))
}

/// Empty vector able to hold `len` bytes without reallocating.
///
/// Sizes come from untrusted offsets and truncate requests, so allocation
/// failure is an error rather than an abort.
fn with_capacity(len: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)
        .map_err(|_| Error::FileTooLarge(format!("cannot stage {} bytes", len)))?;
    Ok(buf)
}

fn end_of(offset: u64, len: usize) -> Result<u64> {
    offset
        .checked_add(len as u64)
        .ok_or_else(|| Error::OutOfRange(format!("{} + {} overflows", offset, len)))
}

/// In-memory staging area.
pub struct MemoryStaging {
    data: Zeroizing<Vec<u8>>,
}

impl MemoryStaging {
    /// Create a buffer holding a copy of `initial`.
    pub fn new(initial: &[u8]) -> Self {
        let mut data = Zeroizing::new(Vec::with_capacity(initial.len()));
        data.extend_from_slice(initial);
        Self { data }
    }

    /// Grow to `new_len`, moving into a fresh allocation when needed so the
    /// old one is zeroized instead of being left behind by a realloc.
    fn grow_to(&mut self, new_len: usize) -> Result<()> {
        if new_len <= self.data.len() {
            return Ok(());
        }
        if new_len > self.data.capacity() {
            let doubled = new_len.max(self.data.capacity().saturating_mul(2));
            let mut grown =
                Zeroizing::new(with_capacity(doubled).or_else(|_| with_capacity(new_len))?);
            grown.extend_from_slice(&self.data);
            self.data = grown;
        }
        self.data.resize(new_len, 0);
        Ok(())
    }
}

impl StagingBuffer for MemoryStaging {
    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_at(&self, offset: u64, size: usize) -> Result<Vec<u8>> {
        if offset >= self.len() {
            return Ok(Vec::new());
        }
        let start = to_usize(offset)?;
        let end = start.saturating_add(size).min(self.data.len());
        Ok(self.data[start..end].to_vec())
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let start = to_usize(offset)?;
        let end = to_usize(end_of(offset, data.len())?)?;
        self.grow_to(end)?;
        self.data[start..end].copy_from_slice(data);
        Ok(())
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        let len = to_usize(len)?;
        if len < self.data.len() {
            self.data[len..].zeroize();
            self.data.truncate(len);
        } else {
            self.grow_to(len)?;
        }
        Ok(())
    }

    fn contents(&self) -> Result<Zeroizing<Vec<u8>>> {
        let mut copy = Zeroizing::new(with_capacity(self.data.len())?);
        copy.extend_from_slice(&self.data);
        Ok(copy)
    }
}

/// Staging area backed by a private file.
///
/// Growing only extends the file sparsely. Plaintext can only sit below
/// `written`, the highest end of any write, so scrubbing stops there.
pub struct DiskStaging {
    path: PathBuf,
    file: File,
    len: u64,
    written: u64,
}

impl DiskStaging {
    /// Create `path` (mode 0600, must not exist) holding `initial`.
    pub fn create(path: PathBuf, initial: &[u8]) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&path)?;

        let mut staging = Self {
            path,
            file,
            len: 0,
            written: 0,
        };
        if let Err(e) = staging.write_at(0, initial) {
            // Drop zeroizes and removes the partial file.
            drop(staging);
            return Err(e);
        }
        Ok(staging)
    }

    fn zero_range(&self, from: u64, to: u64) -> std::io::Result<()> {
        let zeros = [0u8; ZERO_CHUNK];
        let mut pos = from;
        while pos < to {
            let n = ((to - pos) as usize).min(ZERO_CHUNK);
            self.file.write_all_at(&zeros[..n], pos)?;
            pos += n as u64;
        }
        Ok(())
    }
}

impl StagingBuffer for DiskStaging {
    fn len(&self) -> u64 {
        self.len
    }

    fn read_at(&self, offset: u64, size: usize) -> Result<Vec<u8>> {
        if offset >= self.len {
            return Ok(Vec::new());
        }
        let n = to_usize((self.len - offset).min(size as u64))?;
        let mut buf = vec![0u8; n];
        self.file.read_exact_at(&mut buf, offset)?;
        Ok(buf)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let end = end_of(offset, data.len())?;
        self.file.write_all_at(data, offset)?;
        self.len = self.len.max(end);
        self.written = self.written.max(end);
        Ok(())
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        if len < self.len {
            self.zero_range(len, self.written.min(self.len))?;
            self.written = self.written.min(len);
        }
        self.file.set_len(len)?;
        self.len = len;
        Ok(())
    }

    fn contents(&self) -> Result<Zeroizing<Vec<u8>>> {
        let len = to_usize(self.len)?;
        let mut buf = Zeroizing::new(with_capacity(len)?);
        buf.resize(len, 0);
        self.file.read_exact_at(&mut buf, 0)?;
        Ok(buf)
    }

    fn location(&self) -> Option<PathBuf> {
        Some(self.path.clone())
    }
}

impl Drop for DiskStaging {
    fn drop(&mut self) {
        let dirty = self.written.min(self.len);
        if let Err(e) = self.zero_range(0, dirty).and_then(|_| self.file.sync_data()) {
            warn!("Failed to scrub staging file {:?}: {}", self.path, e);
        }
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("Failed to remove staging file {:?}: {}", self.path, e);
        }
    }
}

/// Allocator for staging areas, keyed by handle id.
pub enum StagingStore {
    /// Zeroizing memory buffers.
    Memory,
    /// Files inside a private directory, removed when the store drops.
    Disk { dir: TempDir },
}

impl StagingStore {
    /// Build the store for a staging mode.
    pub fn from_mode(mode: &StagingMode) -> Result<Self> {
        match mode {
            StagingMode::Memory => Ok(Self::Memory),
            StagingMode::Disk { parent } => {
                let mut builder = tempfile::Builder::new();
                builder.prefix("mirrorfs-staging-");
                let dir = match parent {
                    Some(parent) => builder.tempdir_in(parent)?,
                    None => builder.tempdir()?,
                };
                debug!("Staging directory: {:?}", dir.path());
                Ok(Self::Disk { dir })
            }
        }
    }

    /// Directory holding staging files, if disk-backed.
    pub fn directory(&self) -> Option<&Path> {
        match self {
            Self::Memory => None,
            Self::Disk { dir } => Some(dir.path()),
        }
    }

    /// Allocate the staging area for handle `id`, holding `initial`.
    pub fn allocate(&self, id: HandleId, initial: &[u8]) -> Result<Box<dyn StagingBuffer>> {
        match self {
            Self::Memory => Ok(Box::new(MemoryStaging::new(initial))),
            Self::Disk { dir } => {
                let path = dir.path().join(format!("{}.stage", id.as_raw()));
                Ok(Box::new(DiskStaging::create(path, initial)?))
            }
        }
    }
}
