//! Staging manager: the open-file lifecycle.
//!
//! Every open virtual path has at most one [`FileHandle`], shared by all of
//! its openers through a reference count. The first open decrypts the backing
//! file into a staging area; reads and writes touch only the staging area;
//! fsync and the last release re-encrypt it over the backing path.
//!
//! # Locking
//! The table lock is held for lookup, insert and remove, and across the
//! backing-store call of unlink and rename. All staging and crypto work
//! happens under the per-handle lock. When both are needed the
//! order is handle, then table; the opposite order only occurs on a freshly
//! allocated handle that no other thread can reach yet.

use parking_lot::{Mutex, MutexGuard};
use std::collections::{HashMap, HashSet};
use std::fs::{self, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::buffer::{StagingBuffer, StagingStore};
use crate::codec::ContainerCodec;
use crate::handle::{FileHandle, HandleId, HandleInfo, HandleInner, HandleState};
use crate::replace::atomic_replace;
use mirrorfs_common::{Error, Result, VirtualPath};

/// How a handle's staging area is initialized.
#[derive(Debug, Clone, Copy)]
enum OpenMode {
    /// Decrypt the existing backing file.
    Existing,
    /// Create an empty backing file with the given permission bits.
    Create { mode: u32 },
}

#[derive(Default)]
struct HandleTable {
    by_path: HashMap<VirtualPath, Arc<FileHandle>>,
    by_id: HashMap<HandleId, Arc<FileHandle>>,
}

/// Owner of all open-file handles and their staging areas.
pub struct StagingManager {
    codec: Arc<dyn ContainerCodec>,
    store: StagingStore,
    table: Mutex<HandleTable>,
    next_id: AtomicU64,
}

impl StagingManager {
    /// Create a manager encrypting through `codec` and staging in `store`.
    pub fn new(codec: Arc<dyn ContainerCodec>, store: StagingStore) -> Self {
        Self {
            codec,
            store,
            table: Mutex::new(HandleTable::default()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Open an existing file, joining a live handle if there is one.
    ///
    /// # Errors
    /// - `NotFound` if the backing file does not exist
    /// - `Format` / `Integrity` if it does not decode; no handle remains
    pub fn open(&self, path: &VirtualPath, backing: &Path) -> Result<HandleId> {
        self.acquire(path, backing, OpenMode::Existing)
    }

    /// Create (or truncate) a file and open it.
    ///
    /// Joining a live handle truncates its staging area and marks it dirty.
    pub fn create(&self, path: &VirtualPath, backing: &Path, mode: u32) -> Result<HandleId> {
        self.acquire(path, backing, OpenMode::Create { mode })
    }

    fn acquire(&self, path: &VirtualPath, backing: &Path, mode: OpenMode) -> Result<HandleId> {
        loop {
            let mut table = self.table.lock();

            if let Some(existing) = table.by_path.get(path).cloned() {
                drop(table);
                let mut inner = existing.inner.lock();
                if !inner.is_live() {
                    // Tombstone of a handle being torn down; it is already out
                    // of the table, so the next lookup misses.
                    continue;
                }
                if let OpenMode::Create { .. } = mode {
                    inner.buffer_mut()?.set_len(0)?;
                    inner.mark_dirty();
                }
                inner.refcount += 1;
                debug!("{} joined {} (refcount {})", path, existing.id, inner.refcount);
                return Ok(existing.id);
            }

            let id = HandleId::from_raw(self.next_id.fetch_add(1, Ordering::Relaxed));
            let handle = Arc::new(FileHandle::new(id, path.clone(), backing.to_path_buf()));
            let mut inner = handle.inner.lock();
            table.by_path.insert(path.clone(), Arc::clone(&handle));
            table.by_id.insert(id, Arc::clone(&handle));
            drop(table);

            return match self.stage(&inner, mode) {
                Ok(buffer) => {
                    inner.staging = Some(buffer);
                    inner.state = HandleState::Open;
                    inner.refcount = 1;
                    debug!("{} opened as {}", path, id);
                    Ok(id)
                }
                Err(e) => {
                    warn!("Failed to stage {}: {}", path, e);
                    inner.state = HandleState::Closed;
                    self.forget(&handle, &inner);
                    Err(e)
                }
            };
        }
    }

    fn stage(&self, inner: &HandleInner, mode: OpenMode) -> Result<Box<dyn StagingBuffer>> {
        match mode {
            OpenMode::Existing => {
                let container = fs::read(&inner.backing_path)
                    .map_err(|e| Error::from_backing_io(e, &inner.virtual_path.to_string()))?;
                let plaintext = self.codec.decode(&container)?;
                self.store.allocate(inner.id, &plaintext)
            }
            OpenMode::Create { mode } => {
                OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .mode(mode)
                    .open(&inner.backing_path)
                    .map_err(|e| Error::from_backing_io(e, &inner.virtual_path.to_string()))?;
                self.store.allocate(inner.id, &[])
            }
        }
    }

    /// Remove a handle from the table. Caller holds its lock.
    fn forget(&self, handle: &Arc<FileHandle>, inner: &HandleInner) {
        let mut table = self.table.lock();
        if table
            .by_path
            .get(&inner.virtual_path)
            .is_some_and(|h| Arc::ptr_eq(h, handle))
        {
            table.by_path.remove(&inner.virtual_path);
        }
        table.by_id.remove(&handle.id);
    }

    fn lookup(&self, id: HandleId) -> Result<Arc<FileHandle>> {
        self.table
            .lock()
            .by_id
            .get(&id)
            .cloned()
            .ok_or(Error::BadHandle(id.as_raw()))
    }

    fn with_live<T>(
        &self,
        id: HandleId,
        f: impl FnOnce(&mut HandleInner) -> Result<T>,
    ) -> Result<T> {
        let handle = self.lookup(id)?;
        let mut inner = handle.inner.lock();
        if !inner.is_live() {
            return Err(Error::BadHandle(id.as_raw()));
        }
        f(&mut *inner)
    }

    /// Read up to `size` bytes at `offset` from the staging area.
    pub fn read(&self, id: HandleId, offset: u64, size: usize) -> Result<Vec<u8>> {
        self.with_live(id, |inner| inner.buffer()?.read_at(offset, size))
    }

    /// Write `data` at `offset` into the staging area.
    pub fn write(&self, id: HandleId, offset: u64, data: &[u8]) -> Result<usize> {
        self.with_live(id, |inner| {
            inner.buffer_mut()?.write_at(offset, data)?;
            inner.mark_dirty();
            Ok(data.len())
        })
    }

    /// Re-encrypt a dirty handle without closing it.
    pub fn fsync(&self, id: HandleId) -> Result<()> {
        self.with_live(id, |inner| self.flush(inner))
    }

    /// Drop one reference; the last one flushes and destroys the handle.
    ///
    /// The handle is destroyed even if the final flush fails; the error is
    /// still returned.
    pub fn release(&self, id: HandleId) -> Result<()> {
        let handle = self.lookup(id)?;
        let mut inner = handle.inner.lock();
        if !inner.is_live() {
            return Err(Error::BadHandle(id.as_raw()));
        }

        inner.refcount -= 1;
        if inner.refcount > 0 {
            debug!("{} released (refcount {})", id, inner.refcount);
            return Ok(());
        }

        let result = self.flush(&mut inner);
        if let Err(e) = &result {
            error!("Final flush of {} failed, discarding staging: {}", inner.virtual_path, e);
        }

        inner.state = HandleState::Closed;
        inner.staging = None;
        self.forget(&handle, &inner);
        debug!("{} closed", id);
        result
    }

    fn flush(&self, inner: &mut HandleInner) -> Result<()> {
        if !inner.is_dirty() {
            return Ok(());
        }
        if inner.detached {
            inner.state = HandleState::Open;
            return Ok(());
        }

        inner.state = HandleState::Flushing;
        let result = self.write_back(inner);
        inner.state = if result.is_ok() {
            HandleState::Open
        } else {
            HandleState::OpenDirty
        };
        result
    }

    fn write_back(&self, inner: &HandleInner) -> Result<()> {
        let plaintext = inner.buffer()?.contents()?;
        let container = self.codec.encode(&plaintext)?;
        atomic_replace(&inner.backing_path, &container)?;
        info!("Flushed {} ({} bytes)", inner.virtual_path, plaintext.len());
        Ok(())
    }

    /// Resize a file.
    ///
    /// An open handle is resized in place and marked dirty. Otherwise the
    /// file is decrypted, resized and re-encrypted through a transient handle
    /// that is gone by the time this returns.
    pub fn truncate(&self, path: &VirtualPath, backing: &Path, size: u64) -> Result<()> {
        loop {
            let existing = self.table.lock().by_path.get(path).cloned();
            match existing {
                Some(handle) => {
                    let mut inner = handle.inner.lock();
                    if !inner.is_live() {
                        continue;
                    }
                    inner.buffer_mut()?.set_len(size)?;
                    inner.mark_dirty();
                    return Ok(());
                }
                None => {
                    let id = self.open(path, backing)?;
                    let resized = self.with_live(id, |inner| {
                        inner.buffer_mut()?.set_len(size)?;
                        inner.mark_dirty();
                        Ok(())
                    });
                    let released = self.release(id);
                    return resized.and(released);
                }
            }
        }
    }

    /// Remove a file from the backing store.
    ///
    /// A live handle for the path keeps serving its openers but is detached:
    /// it is never written back.
    pub fn unlink(&self, path: &VirtualPath, backing: &Path) -> Result<()> {
        loop {
            let table = self.table.lock();
            let Some(handle) = table.by_path.get(path).cloned() else {
                // Table stays locked across the removal: a racing open must
                // find the file gone.
                let removed = fs::remove_file(backing)
                    .map_err(|e| Error::from_backing_io(e, &path.to_string()));
                drop(table);
                return removed;
            };
            drop(table);

            let mut inner = handle.inner.lock();
            if !inner.is_live() {
                continue;
            }
            fs::remove_file(backing).map_err(|e| Error::from_backing_io(e, &path.to_string()))?;
            inner.detached = true;
            let mut table = self.table.lock();
            if table
                .by_path
                .get(path)
                .is_some_and(|h| Arc::ptr_eq(h, &handle))
            {
                table.by_path.remove(path);
            }
            debug!("{} detached from unlinked {}", handle.id, path);
            return Ok(());
        }
    }

    /// Rename on the backing store and re-key every open handle at or under
    /// `from`. A live handle sitting at `to` is detached, since its backing
    /// file gets replaced.
    ///
    /// The table lock is taken after every affected handle lock and held
    /// through the backing rename, so no handle for an affected path can be
    /// opened unnoticed. If one appeared while the handle locks were being
    /// taken, everything is dropped and the snapshot is retaken.
    pub fn rename(
        &self,
        from: &VirtualPath,
        to: &VirtualPath,
        resolve: impl Fn(&VirtualPath) -> PathBuf,
    ) -> Result<()> {
        let affects = |p: &VirtualPath| p.starts_with(from) || p == to;

        loop {
            let mut affected: Vec<Arc<FileHandle>> = {
                let table = self.table.lock();
                table
                    .by_path
                    .iter()
                    .filter(|(p, _)| affects(*p))
                    .map(|(_, h)| Arc::clone(h))
                    .collect()
            };
            affected.sort_by_key(|h| h.id);

            let mut guards: Vec<(Arc<FileHandle>, MutexGuard<'_, HandleInner>)> = Vec::new();
            for handle in &affected {
                let guard = handle.inner.lock();
                guards.push((Arc::clone(handle), guard));
            }

            let mut table = self.table.lock();
            let locked: HashSet<HandleId> = guards.iter().map(|(h, _)| h.id).collect();
            let missed = table
                .by_path
                .iter()
                .any(|(p, h)| affects(p) && !locked.contains(&h.id));
            if missed {
                debug!("Handle opened under {} during rename, retrying", from);
                continue;
            }

            fs::rename(resolve(from), resolve(to))
                .map_err(|e| Error::from_backing_io(e, &from.to_string()))?;

            for (handle, inner) in guards.iter_mut() {
                if !inner.is_live() {
                    continue;
                }
                let owned = table
                    .by_path
                    .get(&inner.virtual_path)
                    .is_some_and(|h| Arc::ptr_eq(h, handle));

                if let Some(new_path) = inner.virtual_path.rebase(from, to) {
                    if owned {
                        table.by_path.remove(&inner.virtual_path);
                    }
                    debug!("{} moved {} -> {}", handle.id, inner.virtual_path, new_path);
                    inner.backing_path = resolve(&new_path);
                    inner.virtual_path = new_path.clone();
                    if owned {
                        table.by_path.insert(new_path, Arc::clone(handle));
                    }
                } else if inner.virtual_path == *to {
                    if owned {
                        table.by_path.remove(&inner.virtual_path);
                    }
                    debug!("{} detached from replaced {}", handle.id, inner.virtual_path);
                    inner.detached = true;
                }
            }
            return Ok(());
        }
    }

    /// Plaintext length of an open file, if it has a live handle.
    pub fn logical_size(&self, path: &VirtualPath) -> Option<u64> {
        let handle = self.table.lock().by_path.get(path).cloned()?;
        let inner = handle.inner.lock();
        if inner.is_live() {
            inner.staging.as_ref().map(|s| s.len())
        } else {
            None
        }
    }

    /// Snapshot of a live handle.
    pub fn handle_info(&self, id: HandleId) -> Option<HandleInfo> {
        let handle = self.lookup(id).ok()?;
        let inner = handle.inner.lock();
        inner.is_live().then(|| inner.info())
    }

    /// Live handle id for a path, if any.
    pub fn handle_for(&self, path: &VirtualPath) -> Option<HandleId> {
        self.table.lock().by_path.get(path).map(|h| h.id)
    }

    /// Number of handles in the table.
    pub fn open_handles(&self) -> usize {
        self.table.lock().by_id.len()
    }

    /// Directory holding disk staging files, if any.
    pub fn staging_directory(&self) -> Option<&Path> {
        self.store.directory()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StagingMode;
    use crate::testing::CountingCodec;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        _temp: TempDir,
        root: PathBuf,
        codec: Arc<CountingCodec>,
        manager: StagingManager,
    }

    fn fixture_with(mode: StagingMode) -> Fixture {
        let temp = TempDir::new().unwrap();
        let root = temp.path().to_path_buf();
        let codec = Arc::new(CountingCodec::new());
        let manager = StagingManager::new(codec.clone(), StagingStore::from_mode(&mode).unwrap());
        Fixture {
            _temp: temp,
            root,
            codec,
            manager,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(StagingMode::Memory)
    }

    impl Fixture {
        fn path(&self, raw: &str) -> (VirtualPath, PathBuf) {
            let path = VirtualPath::parse(raw).unwrap();
            let backing = self.backing(&path);
            (path, backing)
        }

        fn backing(&self, path: &VirtualPath) -> PathBuf {
            let mut backing = self.root.clone();
            for c in path.components() {
                backing.push(c);
            }
            backing
        }

        fn seed(&self, raw: &str, plaintext: &[u8]) {
            let (_, backing) = self.path(raw);
            fs::write(backing, self.codec.inner().encode(plaintext).unwrap()).unwrap();
        }

        fn plaintext(&self, raw: &str) -> Vec<u8> {
            let (_, backing) = self.path(raw);
            let container = fs::read(backing).unwrap();
            self.codec.inner().decode(&container).unwrap().to_vec()
        }
    }

    #[test]
    fn test_open_reads_decrypted_content() {
        let fx = fixture();
        fx.seed("/a.txt", b"hello world");
        let (path, backing) = fx.path("/a.txt");

        let id = fx.manager.open(&path, &backing).unwrap();
        assert_eq!(fx.manager.read(id, 6, 100).unwrap(), b"world");
        assert_eq!(fx.manager.handle_info(id).unwrap().state, HandleState::Open);

        fx.manager.release(id).unwrap();
        assert_eq!(fx.codec.encodes(), 0);
        assert_eq!(fx.manager.open_handles(), 0);
    }

    #[test]
    fn test_open_missing_is_not_found() {
        let fx = fixture();
        let (path, backing) = fx.path("/missing.txt");

        assert!(matches!(fx.manager.open(&path, &backing), Err(Error::NotFound(_))));
        assert_eq!(fx.manager.open_handles(), 0);
        assert!(fx.manager.handle_for(&path).is_none());
    }

    #[test]
    fn test_corrupt_container_aborts_open() {
        let fx = fixture();
        fx.seed("/a.txt", b"payload");
        let (path, backing) = fx.path("/a.txt");
        let mut container = fs::read(&backing).unwrap();
        let last = container.len() - 1;
        container[last] ^= 0x01;
        fs::write(&backing, &container).unwrap();

        assert!(matches!(fx.manager.open(&path, &backing), Err(Error::Integrity(_))));
        assert_eq!(fx.manager.open_handles(), 0);

        fs::write(&backing, b"garbage").unwrap();
        assert!(matches!(fx.manager.open(&path, &backing), Err(Error::Format(_))));
        assert_eq!(fx.manager.open_handles(), 0);
    }

    #[test]
    fn test_write_then_release_flushes_once() {
        let fx = fixture();
        let (path, backing) = fx.path("/a.txt");

        let id = fx.manager.create(&path, &backing, 0o644).unwrap();
        assert_eq!(fs::metadata(&backing).unwrap().len(), 0);

        fx.manager.write(id, 0, b"AAAA").unwrap();
        fx.manager.write(id, 2, b"BB").unwrap();
        assert_eq!(fx.manager.read(id, 0, 4).unwrap(), b"AABB");
        assert_eq!(fx.manager.handle_info(id).unwrap().state, HandleState::OpenDirty);

        fx.manager.release(id).unwrap();
        assert_eq!(fx.codec.encodes(), 1);
        assert_eq!(fx.plaintext("/a.txt"), b"AABB");
    }

    #[test]
    fn test_fsync_cleans_without_closing() {
        let fx = fixture();
        let (path, backing) = fx.path("/a.txt");
        let id = fx.manager.create(&path, &backing, 0o600).unwrap();

        fx.manager.write(id, 0, b"hello").unwrap();
        fx.manager.fsync(id).unwrap();
        assert_eq!(fx.manager.handle_info(id).unwrap().state, HandleState::Open);
        assert_eq!(fx.plaintext("/a.txt"), b"hello");

        // Clean handle: fsync and release do not re-encrypt.
        fx.manager.fsync(id).unwrap();
        fx.manager.release(id).unwrap();
        assert_eq!(fx.codec.encodes(), 1);
    }

    #[test]
    fn test_concurrent_opens_share_one_handle() {
        const OPENERS: usize = 16;
        let fx = fixture();
        fx.seed("/shared.txt", b"shared");
        let (path, backing) = fx.path("/shared.txt");

        let ids: Vec<HandleId> = thread::scope(|s| {
            let workers: Vec<_> = (0..OPENERS)
                .map(|_| s.spawn(|| fx.manager.open(&path, &backing).unwrap()))
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });

        assert!(ids.iter().all(|id| *id == ids[0]));
        assert_eq!(fx.manager.handle_info(ids[0]).unwrap().refcount, OPENERS);
        assert_eq!(fx.codec.decodes(), 1);

        fx.manager.write(ids[0], 0, b"SH").unwrap();

        thread::scope(|s| {
            for id in &ids {
                let manager = &fx.manager;
                s.spawn(move || manager.release(*id).unwrap());
            }
        });

        assert_eq!(fx.codec.decodes(), 1);
        assert_eq!(fx.codec.encodes(), 1);
        assert_eq!(fx.manager.open_handles(), 0);
        assert_eq!(fx.plaintext("/shared.txt"), b"SHared");
    }

    #[test]
    fn test_reopen_after_close_decodes_again() {
        let fx = fixture();
        fx.seed("/a.txt", b"x");
        let (path, backing) = fx.path("/a.txt");

        let first = fx.manager.open(&path, &backing).unwrap();
        fx.manager.release(first).unwrap();
        let second = fx.manager.open(&path, &backing).unwrap();

        assert_ne!(first, second);
        assert_eq!(fx.codec.decodes(), 2);
        assert!(matches!(fx.manager.read(first, 0, 1), Err(Error::BadHandle(_))));
        fx.manager.release(second).unwrap();
        assert!(matches!(fx.manager.release(second), Err(Error::BadHandle(_))));
    }

    #[test]
    fn test_failed_encode_leaves_container_intact() {
        let fx = fixture();
        fx.seed("/a.txt", b"original");
        let (path, backing) = fx.path("/a.txt");
        let before = fs::read(&backing).unwrap();

        let id = fx.manager.open(&path, &backing).unwrap();
        fx.manager.write(id, 0, b"CHANGED!").unwrap();
        fx.codec.fail_encodes(true);

        assert!(fx.manager.fsync(id).is_err());
        assert_eq!(fx.manager.handle_info(id).unwrap().state, HandleState::OpenDirty);
        assert_eq!(fs::read(&backing).unwrap(), before);

        // Last release still tears the handle down.
        assert!(fx.manager.release(id).is_err());
        assert_eq!(fx.manager.open_handles(), 0);
        assert_eq!(fs::read(&backing).unwrap(), before);
        assert_eq!(fs::read_dir(&fx.root).unwrap().count(), 1);
    }

    #[test]
    fn test_truncate_open_handle() {
        let fx = fixture();
        fx.seed("/a.txt", b"abcdef");
        let (path, backing) = fx.path("/a.txt");
        let id = fx.manager.open(&path, &backing).unwrap();

        fx.manager.truncate(&path, &backing, 3).unwrap();
        assert_eq!(fx.manager.read(id, 0, 10).unwrap(), b"abc");
        assert_eq!(fx.manager.logical_size(&path), Some(3));

        fx.manager.release(id).unwrap();
        assert_eq!(fx.plaintext("/a.txt"), b"abc");
    }

    #[test]
    fn test_truncate_without_handle() {
        let fx = fixture();
        fx.seed("/a.txt", b"abc");
        let (path, backing) = fx.path("/a.txt");

        fx.manager.truncate(&path, &backing, 5).unwrap();

        assert_eq!(fx.plaintext("/a.txt"), b"abc\0\0");
        assert_eq!(fx.manager.open_handles(), 0);
        assert!(matches!(
            fx.manager.truncate(&fx.path("/nope").0, &fx.path("/nope").1, 0),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_create_joining_live_handle_truncates() {
        let fx = fixture();
        fx.seed("/a.txt", b"abc");
        let (path, backing) = fx.path("/a.txt");

        let first = fx.manager.open(&path, &backing).unwrap();
        let second = fx.manager.create(&path, &backing, 0o644).unwrap();

        assert_eq!(first, second);
        assert!(fx.manager.read(first, 0, 10).unwrap().is_empty());
        fx.manager.release(first).unwrap();
        fx.manager.release(second).unwrap();
        assert!(fx.plaintext("/a.txt").is_empty());
    }

    #[test]
    fn test_unlink_detaches_open_handle() {
        let fx = fixture();
        fx.seed("/a.txt", b"abc");
        let (path, backing) = fx.path("/a.txt");
        let id = fx.manager.open(&path, &backing).unwrap();

        fx.manager.unlink(&path, &backing).unwrap();
        assert!(!backing.exists());

        fx.manager.write(id, 0, b"zzz").unwrap();
        assert_eq!(fx.manager.read(id, 0, 3).unwrap(), b"zzz");
        fx.manager.release(id).unwrap();

        assert!(!backing.exists());
        assert_eq!(fx.codec.encodes(), 0);
    }

    #[test]
    fn test_rename_rekeys_open_handle() {
        let fx = fixture();
        fs::create_dir(fx.root.join("docs")).unwrap();
        fx.seed("/docs/a.txt", b"abc");
        let (path, backing) = fx.path("/docs/a.txt");
        let id = fx.manager.open(&path, &backing).unwrap();

        let from = VirtualPath::parse("/docs").unwrap();
        let to = VirtualPath::parse("/archive").unwrap();
        fx.manager.rename(&from, &to, |p| fx.backing(p)).unwrap();

        fx.manager.write(id, 3, b"def").unwrap();
        fx.manager.release(id).unwrap();

        assert!(!fx.root.join("docs").exists());
        assert_eq!(fx.plaintext("/archive/a.txt"), b"abcdef");
        let moved = VirtualPath::parse("/archive/a.txt").unwrap();
        assert!(fx.manager.handle_for(&moved).is_none());
    }

    #[test]
    fn test_rename_rekeys_handle_opened_while_waiting() {
        let fx = fixture();
        fs::create_dir(fx.root.join("docs")).unwrap();
        fx.seed("/docs/a.txt", b"a");
        fx.seed("/docs/b.txt", b"old");
        let (a, a_backing) = fx.path("/docs/a.txt");
        let (b, b_backing) = fx.path("/docs/b.txt");
        let from = VirtualPath::parse("/docs").unwrap();
        let to = VirtualPath::parse("/archive").unwrap();

        let a_id = fx.manager.open(&a, &a_backing).unwrap();
        fx.manager.write(a_id, 0, b"A").unwrap();
        fx.codec.close_gate();

        let b_id = thread::scope(|s| {
            // The fsync parks inside /docs/a.txt's lock, so the rename waits on it.
            let flusher = s.spawn(|| fx.manager.fsync(a_id));
            fx.codec.wait_for_parked(1);
            let renamer = s.spawn(|| fx.manager.rename(&from, &to, |p| fx.backing(p)));
            thread::sleep(Duration::from_millis(50));

            let b_id = fx.manager.open(&b, &b_backing).unwrap();
            fx.manager.write(b_id, 0, b"NEW").unwrap();

            fx.codec.open_gate();
            flusher.join().unwrap().unwrap();
            renamer.join().unwrap().unwrap();
            b_id
        });

        let moved = VirtualPath::parse("/archive/b.txt").unwrap();
        let info = fx.manager.handle_info(b_id).unwrap();
        assert_eq!(info.virtual_path, moved);
        assert_eq!(info.backing_path, fx.backing(&moved));
        assert_eq!(fx.manager.handle_for(&moved), Some(b_id));

        fx.manager.release(b_id).unwrap();
        fx.manager.release(a_id).unwrap();
        assert!(!fx.root.join("docs").exists());
        assert_eq!(fx.plaintext("/archive/a.txt"), b"A");
        assert_eq!(fx.plaintext("/archive/b.txt"), b"NEW");
    }

    #[test]
    fn test_unlink_racing_final_release_detaches_successor() {
        let fx = fixture();
        fx.seed("/a.txt", b"abc");
        let (path, backing) = fx.path("/a.txt");
        let first = fx.manager.open(&path, &backing).unwrap();
        fx.manager.write(first, 0, b"x").unwrap();
        fx.codec.close_gate();

        thread::scope(|s| {
            // Final flush of the first handle parks with its lock held; the
            // opener and the unlink both queue up on that stale handle.
            let closer = s.spawn(|| fx.manager.release(first));
            fx.codec.wait_for_parked(1);
            let opener = s.spawn(|| fx.manager.open(&path, &backing));
            let unlinker = s.spawn(|| fx.manager.unlink(&path, &backing));
            thread::sleep(Duration::from_millis(50));

            fx.codec.open_gate();
            closer.join().unwrap().unwrap();
            unlinker.join().unwrap().unwrap();
            match opener.join().unwrap() {
                Ok(second) => {
                    fx.manager.write(second, 0, b"zombie").unwrap();
                    fx.manager.release(second).unwrap();
                }
                Err(e) => assert!(matches!(e, Error::NotFound(_)), "{e}"),
            }
        });

        assert!(!backing.exists());
        assert_eq!(fx.manager.open_handles(), 0);
    }

    #[test]
    fn test_unlink_after_reopen_detaches_current_handle() {
        let fx = fixture();
        fx.seed("/a.txt", b"abc");
        let (path, backing) = fx.path("/a.txt");

        let first = fx.manager.open(&path, &backing).unwrap();
        fx.manager.release(first).unwrap();
        let second = fx.manager.open(&path, &backing).unwrap();

        fx.manager.unlink(&path, &backing).unwrap();
        assert!(fx.manager.handle_info(second).unwrap().detached);

        fx.manager.write(second, 0, b"zzz").unwrap();
        fx.manager.release(second).unwrap();
        assert!(!backing.exists());
    }

    #[test]
    fn test_flush_does_not_block_other_paths() {
        let fx = fixture();
        fx.seed("/b.txt", b"bee");
        let (a, a_backing) = fx.path("/a.txt");
        let (b, b_backing) = fx.path("/b.txt");
        let a_id = fx.manager.create(&a, &a_backing, 0o600).unwrap();
        fx.manager.write(a_id, 0, b"slow").unwrap();
        fx.codec.close_gate();

        thread::scope(|s| {
            let flusher = s.spawn(|| fx.manager.fsync(a_id));
            fx.codec.wait_for_parked(1);

            let (tx, rx) = mpsc::channel();
            let manager = &fx.manager;
            let (b, b_backing) = (&b, &b_backing);
            s.spawn(move || {
                let result = manager.open(b, b_backing).and_then(|id| {
                    let data = manager.read(id, 0, 16)?;
                    manager.release(id)?;
                    Ok(data)
                });
                let _ = tx.send(result);
            });

            let got = rx.recv_timeout(Duration::from_secs(10));
            fx.codec.open_gate();
            assert_eq!(got.expect("/b.txt stalled behind /a.txt").unwrap(), b"bee");
            flusher.join().unwrap().unwrap();
        });

        fx.manager.release(a_id).unwrap();
        assert_eq!(fx.plaintext("/a.txt"), b"slow");
        assert_eq!(fx.codec.encodes(), 1);
    }

    #[test]
    fn test_write_racing_fsync_is_kept_dirty() {
        let fx = fixture();
        let (path, backing) = fx.path("/a.txt");
        let id = fx.manager.create(&path, &backing, 0o600).unwrap();
        fx.manager.write(id, 0, b"v1").unwrap();
        fx.codec.close_gate();

        thread::scope(|s| {
            let flusher = s.spawn(|| fx.manager.fsync(id));
            fx.codec.wait_for_parked(1);
            let writer = s.spawn(|| fx.manager.write(id, 0, b"v2"));
            thread::sleep(Duration::from_millis(50));

            fx.codec.open_gate();
            flusher.join().unwrap().unwrap();
            assert_eq!(writer.join().unwrap().unwrap(), 2);
        });

        // The write landed after the flush: v1 is on disk, v2 is pending.
        assert_eq!(fx.plaintext("/a.txt"), b"v1");
        assert_eq!(fx.manager.handle_info(id).unwrap().state, HandleState::OpenDirty);
        assert_eq!(fx.manager.read(id, 0, 2).unwrap(), b"v2");

        fx.manager.release(id).unwrap();
        assert_eq!(fx.plaintext("/a.txt"), b"v2");
        assert_eq!(fx.codec.encodes(), 2);
    }

    #[test]
    fn test_disk_staging_lifecycle() {
        let fx = fixture_with(StagingMode::Disk { parent: None });
        fx.seed("/a.txt", b"on disk");
        let (path, backing) = fx.path("/a.txt");

        let id = fx.manager.open(&path, &backing).unwrap();
        let location = fx.manager.handle_info(id).unwrap().staging_location.unwrap();
        assert!(location.starts_with(fx.manager.staging_directory().unwrap()));
        assert!(!location.starts_with(&fx.root));

        fx.manager.write(id, 0, b"ON").unwrap();
        fx.manager.release(id).unwrap();

        assert!(!location.exists());
        assert_eq!(fx.plaintext("/a.txt"), b"ON disk");
    }
}
