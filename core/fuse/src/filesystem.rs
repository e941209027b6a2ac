//! FUSE filesystem over a mediated mirror.
//!
//! Implements the fuser::Filesystem trait. Content verbs (open, create,
//! read, write, fsync, release, truncate, unlink, rename) go through the
//! [`Dispatcher`]; metadata verbs are forwarded to the backing path.

use std::ffi::OsStr;
use std::fs::{self, DirBuilder};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{DirBuilderExt, FileTypeExt, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr, Request, TimeOrNow,
};
use tracing::{debug, warn};

use crate::errno::{io_errno, to_errno};
use crate::inode::{InodeMap, ROOT_INODE};
use crate::passthrough::{self, Timestamp};
use mirrorfs_common::{VirtualPath, RESERVED_PREFIX};
use mirrorfs_mediator::{Dispatcher, HandleId};

type Errno = i32;

/// FUSE filesystem exposing the plaintext view of a mirror.
pub struct MirrorFilesystem {
    dispatcher: Arc<Dispatcher>,
    inodes: InodeMap,
    ttl: Duration,
}

impl MirrorFilesystem {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            dispatcher,
            inodes: InodeMap::new(),
            ttl: Duration::from_secs(1),
        }
    }

    fn path_of(&self, ino: u64) -> Result<VirtualPath, Errno> {
        self.inodes.get_path(ino).cloned().ok_or(libc::ENOENT)
    }

    fn child_of(&self, parent: u64, name: &OsStr) -> Result<VirtualPath, Errno> {
        let name = name.to_str().ok_or(libc::EINVAL)?;
        self.path_of(parent)?
            .join(name)
            .map_err(|e| to_errno(&e))
    }

    fn backing(&self, path: &VirtualPath) -> Result<PathBuf, Errno> {
        self.dispatcher
            .resolve(&path.to_string_path())
            .map_err(|e| to_errno(&e))
    }

    fn attr_for(&mut self, path: &VirtualPath) -> Result<FileAttr, Errno> {
        let backing = self.backing(path)?;
        let meta = fs::symlink_metadata(&backing).map_err(|e| io_errno(&e))?;
        let size = if meta.file_type().is_file() {
            self.dispatcher
                .logical_size(&path.to_string_path(), meta.len())
                .map_err(|e| to_errno(&e))?
        } else {
            meta.len()
        };
        let ino = self.inodes.get_or_create_inode(path);
        Ok(file_attr(ino, &meta, size))
    }

    fn entry_reply(&mut self, path: &VirtualPath, reply: ReplyEntry) {
        match self.attr_for(path) {
            Ok(attr) => reply.entry(&self.ttl, &attr, 0),
            Err(errno) => reply.error(errno),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_setattr(
        &mut self,
        path: &VirtualPath,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
    ) -> Result<FileAttr, Errno> {
        let backing = self.backing(path)?;

        if let Some(mode) = mode {
            fs::set_permissions(&backing, fs::Permissions::from_mode(mode & 0o7777))
                .map_err(|e| io_errno(&e))?;
        }
        if uid.is_some() || gid.is_some() {
            std::os::unix::fs::lchown(&backing, uid, gid).map_err(|e| io_errno(&e))?;
        }
        if let Some(size) = size {
            let size = i64::try_from(size).map_err(|_| libc::EFBIG)?;
            self.dispatcher
                .mediate_truncate(&path.to_string_path(), size)
                .map_err(|e| to_errno(&e))?;
        }
        if atime.is_some() || mtime.is_some() {
            passthrough::set_times(&backing, atime.map(timestamp), mtime.map(timestamp))
                .map_err(|e| io_errno(&e))?;
        }

        self.attr_for(path)
    }
}

fn timestamp(t: TimeOrNow) -> Timestamp {
    match t {
        TimeOrNow::Now => Timestamp::Now,
        TimeOrNow::SpecificTime(at) => Timestamp::At(at),
    }
}

fn system_time(secs: i64, nsecs: i64) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::new(secs as u64, nsecs as u32)
    } else {
        UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs())
    }
}

fn file_kind(ft: fs::FileType) -> FileType {
    if ft.is_dir() {
        FileType::Directory
    } else if ft.is_symlink() {
        FileType::Symlink
    } else if ft.is_block_device() {
        FileType::BlockDevice
    } else if ft.is_char_device() {
        FileType::CharDevice
    } else if ft.is_fifo() {
        FileType::NamedPipe
    } else if ft.is_socket() {
        FileType::Socket
    } else {
        FileType::RegularFile
    }
}

/// Attributes of a backing entry, with `size` replaced by its plaintext size.
fn file_attr(ino: u64, meta: &fs::Metadata, size: u64) -> FileAttr {
    let ctime = system_time(meta.ctime(), meta.ctime_nsec());
    FileAttr {
        ino,
        size,
        blocks: size.div_ceil(512),
        atime: system_time(meta.atime(), meta.atime_nsec()),
        mtime: system_time(meta.mtime(), meta.mtime_nsec()),
        ctime,
        crtime: meta.created().unwrap_or(ctime),
        kind: file_kind(meta.file_type()),
        perm: (meta.mode() & 0o7777) as u16,
        nlink: meta.nlink() as u32,
        uid: meta.uid(),
        gid: meta.gid(),
        rdev: meta.rdev() as u32,
        blksize: meta.blksize() as u32,
        flags: 0,
    }
}

fn is_hidden(name: &OsStr) -> bool {
    name.as_bytes().starts_with(RESERVED_PREFIX.as_bytes())
}

impl Filesystem for MirrorFilesystem {
    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        debug!("lookup: parent={}, name={:?}", parent, name);

        if is_hidden(name) {
            reply.error(libc::ENOENT);
            return;
        }
        match self.child_of(parent, name) {
            Ok(path) => self.entry_reply(&path, reply),
            Err(errno) => reply.error(errno),
        }
    }

    fn getattr(&mut self, _req: &Request, ino: u64, reply: ReplyAttr) {
        debug!("getattr: ino={}", ino);

        match self.path_of(ino).and_then(|p| self.attr_for(&p)) {
            Ok(attr) => reply.attr(&self.ttl, &attr),
            Err(errno) => reply.error(errno),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        debug!("setattr: ino={}, mode={:?}, size={:?}", ino, mode, size);

        let result = self
            .path_of(ino)
            .and_then(|p| self.apply_setattr(&p, mode, uid, gid, size, atime, mtime));
        match result {
            Ok(attr) => reply.attr(&self.ttl, &attr),
            Err(errno) => reply.error(errno),
        }
    }

    fn readlink(&mut self, _req: &Request, ino: u64, reply: ReplyData) {
        debug!("readlink: ino={}", ino);

        let result = self
            .path_of(ino)
            .and_then(|p| self.backing(&p))
            .and_then(|b| fs::read_link(b).map_err(|e| io_errno(&e)));
        match result {
            Ok(target) => reply.data(target.as_os_str().as_bytes()),
            Err(errno) => reply.error(errno),
        }
    }

    fn mknod(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        debug!("mknod: parent={}, name={:?}, mode={:o}", parent, name, mode);

        let path = match self.child_of(parent, name) {
            Ok(p) => p,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };

        let perm = mode & !umask & 0o7777;
        let result = if (mode & libc::S_IFMT as u32) == libc::S_IFREG as u32 {
            self.dispatcher
                .mediate_mknod(&path.to_string_path(), perm)
                .map_err(|e| to_errno(&e))
        } else {
            self.backing(&path).and_then(|b| {
                passthrough::mknod(&b, (mode & libc::S_IFMT as u32) | perm, rdev)
                    .map_err(|e| io_errno(&e))
            })
        };

        match result {
            Ok(()) => self.entry_reply(&path, reply),
            Err(errno) => reply.error(errno),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        debug!("mkdir: parent={}, name={:?}", parent, name);

        let result = self.child_of(parent, name).and_then(|path| {
            let backing = self.backing(&path)?;
            DirBuilder::new()
                .mode(mode & !umask & 0o7777)
                .create(&backing)
                .map_err(|e| io_errno(&e))?;
            Ok(path)
        });
        match result {
            Ok(path) => self.entry_reply(&path, reply),
            Err(errno) => reply.error(errno),
        }
    }

    fn unlink(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        debug!("unlink: parent={}, name={:?}", parent, name);

        let result = self.child_of(parent, name).and_then(|path| {
            self.dispatcher
                .mediate_unlink(&path.to_string_path())
                .map_err(|e| to_errno(&e))?;
            Ok(path)
        });
        match result {
            Ok(path) => {
                self.inodes.remove(&path);
                reply.ok();
            }
            Err(errno) => reply.error(errno),
        }
    }

    fn rmdir(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        debug!("rmdir: parent={}, name={:?}", parent, name);

        let result = self.child_of(parent, name).and_then(|path| {
            let backing = self.backing(&path)?;
            fs::remove_dir(&backing).map_err(|e| io_errno(&e))?;
            Ok(path)
        });
        match result {
            Ok(path) => {
                self.inodes.remove(&path);
                reply.ok();
            }
            Err(errno) => reply.error(errno),
        }
    }

    fn symlink(
        &mut self,
        _req: &Request,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        debug!("symlink: parent={}, name={:?}, target={:?}", parent, link_name, target);

        let result = self.child_of(parent, link_name).and_then(|path| {
            let backing = self.backing(&path)?;
            std::os::unix::fs::symlink(target, &backing).map_err(|e| io_errno(&e))?;
            Ok(path)
        });
        match result {
            Ok(path) => self.entry_reply(&path, reply),
            Err(errno) => reply.error(errno),
        }
    }

    fn rename(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        debug!(
            "rename: {}/{:?} -> {}/{:?}",
            parent, name, newparent, newname
        );

        if flags != 0 {
            reply.error(libc::EINVAL);
            return;
        }

        let result = self.child_of(parent, name).and_then(|from| {
            let to = self.child_of(newparent, newname)?;
            self.dispatcher
                .mediate_rename(&from.to_string_path(), &to.to_string_path())
                .map_err(|e| to_errno(&e))?;
            Ok((from, to))
        });
        match result {
            Ok((from, to)) => {
                self.inodes.rename(&from, &to);
                reply.ok();
            }
            Err(errno) => reply.error(errno),
        }
    }

    fn link(
        &mut self,
        _req: &Request,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        debug!("link: ino={} -> {}/{:?}", ino, newparent, newname);

        let result = self.path_of(ino).and_then(|source| {
            let target = self.child_of(newparent, newname)?;
            let from = self.backing(&source)?;
            let to = self.backing(&target)?;
            fs::hard_link(&from, &to).map_err(|e| io_errno(&e))?;
            Ok(target)
        });
        match result {
            Ok(path) => self.entry_reply(&path, reply),
            Err(errno) => reply.error(errno),
        }
    }

    fn open(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        debug!("open: ino={}, flags={:#x}", ino, flags);

        let result = self.path_of(ino).and_then(|path| {
            self.dispatcher
                .mediate_open(&path.to_string_path())
                .map_err(|e| to_errno(&e))
        });
        match result {
            Ok(id) => reply.opened(id.as_raw(), 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn read(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock: Option<u64>,
        reply: ReplyData,
    ) {
        debug!("read: fh={}, offset={}, size={}", fh, offset, size);

        match self
            .dispatcher
            .mediate_read(HandleId::from_raw(fh), offset, size as usize)
        {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(to_errno(&e)),
        }
    }

    fn write(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock: Option<u64>,
        reply: ReplyWrite,
    ) {
        debug!("write: fh={}, offset={}, size={}", fh, offset, data.len());

        match self
            .dispatcher
            .mediate_write(HandleId::from_raw(fh), offset, data)
        {
            Ok(written) => reply.written(written as u32),
            Err(e) => reply.error(to_errno(&e)),
        }
    }

    fn flush(&mut self, _req: &Request, _ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        debug!("flush: fh={}", fh);
        reply.ok();
    }

    fn release(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        debug!("release: fh={}", fh);

        match self.dispatcher.mediate_release(HandleId::from_raw(fh)) {
            Ok(()) => reply.ok(),
            Err(e) => {
                warn!("release of fh={} reported: {}", fh, e);
                reply.error(to_errno(&e));
            }
        }
    }

    fn fsync(&mut self, _req: &Request, _ino: u64, fh: u64, _datasync: bool, reply: ReplyEmpty) {
        debug!("fsync: fh={}", fh);

        match self.dispatcher.mediate_fsync(HandleId::from_raw(fh)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(to_errno(&e)),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        debug!("readdir: ino={}, offset={}", ino, offset);

        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        let backing = match self.backing(&path) {
            Ok(b) => b,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        let read_dir = match fs::read_dir(&backing) {
            Ok(rd) => rd,
            Err(e) => {
                reply.error(io_errno(&e));
                return;
            }
        };

        let mut entries: Vec<(String, FileType)> = read_dir
            .filter_map(|entry| entry.ok())
            .filter(|entry| !is_hidden(&entry.file_name()))
            .filter_map(|entry| {
                let name = entry.file_name().into_string().ok()?;
                let kind = entry.file_type().map(file_kind).ok()?;
                Some((name, kind))
            })
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        let parent_ino = match path.parent() {
            Some(parent) => self.inodes.get_or_create_inode(&parent),
            None => ROOT_INODE,
        };

        let mut listing: Vec<(u64, FileType, String)> = vec![
            (ino, FileType::Directory, ".".to_string()),
            (parent_ino, FileType::Directory, "..".to_string()),
        ];
        for (name, kind) in entries {
            let child_ino = match path.join(&name) {
                Ok(child) => self.inodes.get_or_create_inode(&child),
                Err(_) => continue,
            };
            listing.push((child_ino, kind, name));
        }

        let start = usize::try_from(offset).unwrap_or(0);
        for (idx, (child_ino, kind, name)) in listing.into_iter().enumerate().skip(start) {
            if reply.add(child_ino, (idx + 1) as i64, kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request, _ino: u64, reply: ReplyStatfs) {
        match passthrough::statvfs(self.dispatcher.mirror_root()) {
            Ok(st) => reply.statfs(
                st.blocks, st.bfree, st.bavail, st.files, st.ffree, st.bsize, st.namelen,
                st.frsize,
            ),
            Err(e) => reply.error(io_errno(&e)),
        }
    }

    fn access(&mut self, _req: &Request, ino: u64, mask: i32, reply: ReplyEmpty) {
        let result = self
            .path_of(ino)
            .and_then(|p| self.backing(&p))
            .and_then(|b| passthrough::access(&b, mask).map_err(|e| io_errno(&e)));
        match result {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    fn create(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        debug!("create: parent={}, name={:?}, flags={:#x}", parent, name, flags);

        let path = match self.child_of(parent, name) {
            Ok(p) => p,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        let id = match self
            .dispatcher
            .mediate_create(&path.to_string_path(), mode & !umask & 0o7777)
        {
            Ok(id) => id,
            Err(e) => {
                reply.error(to_errno(&e));
                return;
            }
        };

        match self.attr_for(&path) {
            Ok(attr) => reply.created(&self.ttl, &attr, 0, id.as_raw(), 0),
            Err(errno) => {
                if let Err(e) = self.dispatcher.mediate_release(id) {
                    warn!("Failed to release {} after create: {}", id, e);
                }
                reply.error(errno);
            }
        }
    }

    #[cfg(target_os = "linux")]
    fn setxattr(
        &mut self,
        _req: &Request,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        let result = self.path_of(ino).and_then(|p| self.backing(&p)).and_then(|b| {
            passthrough::set_xattr(&b, name, value, flags).map_err(|e| io_errno(&e))
        });
        match result {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    #[cfg(target_os = "linux")]
    fn getxattr(&mut self, _req: &Request, ino: u64, name: &OsStr, size: u32, reply: ReplyXattr) {
        let result = self
            .path_of(ino)
            .and_then(|p| self.backing(&p))
            .and_then(|b| passthrough::get_xattr(&b, name, size).map_err(|e| io_errno(&e)));
        xattr_reply(result, reply);
    }

    #[cfg(target_os = "linux")]
    fn listxattr(&mut self, _req: &Request, ino: u64, size: u32, reply: ReplyXattr) {
        let result = self
            .path_of(ino)
            .and_then(|p| self.backing(&p))
            .and_then(|b| passthrough::list_xattr(&b, size).map_err(|e| io_errno(&e)));
        xattr_reply(result, reply);
    }

    #[cfg(target_os = "linux")]
    fn removexattr(&mut self, _req: &Request, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        let result = self
            .path_of(ino)
            .and_then(|p| self.backing(&p))
            .and_then(|b| passthrough::remove_xattr(&b, name).map_err(|e| io_errno(&e)));
        match result {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }
}

#[cfg(target_os = "linux")]
fn xattr_reply(result: Result<passthrough::XattrValue, Errno>, reply: ReplyXattr) {
    match result {
        Ok(passthrough::XattrValue::Size(n)) => reply.size(n),
        Ok(passthrough::XattrValue::Data(data)) => reply.data(&data),
        Err(errno) => reply.error(errno),
    }
}
