//! Metadata calls forwarded to the backing store.
//!
//! Thin wrappers over libc for the operations std does not cover. They work
//! on backing paths and never follow a trailing symlink.

use std::ffi::{CString, OsStr};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// A timestamp requested by setattr.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timestamp {
    Now,
    At(SystemTime),
}

/// Filesystem statistics of the mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsStats {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub namelen: u32,
    pub frsize: u32,
}

fn cstring(s: &OsStr) -> io::Result<CString> {
    CString::new(s.as_bytes()).map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))
}

fn check(ret: libc::c_int) -> io::Result<()> {
    if ret == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

fn timespec(time: Option<Timestamp>) -> libc::timespec {
    let (tv_sec, tv_nsec) = match time {
        None => (0, libc::UTIME_OMIT),
        Some(Timestamp::Now) => (0, libc::UTIME_NOW),
        Some(Timestamp::At(t)) => {
            let d = t.duration_since(UNIX_EPOCH).unwrap_or_default();
            (d.as_secs() as libc::time_t, d.subsec_nanos() as libc::c_long)
        }
    };
    libc::timespec { tv_sec, tv_nsec }
}

/// Set access and modification times; `None` leaves a time unchanged.
pub fn set_times(path: &Path, atime: Option<Timestamp>, mtime: Option<Timestamp>) -> io::Result<()> {
    let cpath = cstring(path.as_os_str())?;
    let times = [timespec(atime), timespec(mtime)];
    check(unsafe {
        libc::utimensat(
            libc::AT_FDCWD,
            cpath.as_ptr(),
            times.as_ptr(),
            libc::AT_SYMLINK_NOFOLLOW,
        )
    })
}

/// Statistics of the filesystem holding `path`.
pub fn statvfs(path: &Path) -> io::Result<FsStats> {
    let cpath = cstring(path.as_os_str())?;
    let mut st = std::mem::MaybeUninit::<libc::statvfs>::zeroed();
    check(unsafe { libc::statvfs(cpath.as_ptr(), st.as_mut_ptr()) })?;
    let st = unsafe { st.assume_init() };
    Ok(FsStats {
        blocks: st.f_blocks as u64,
        bfree: st.f_bfree as u64,
        bavail: st.f_bavail as u64,
        files: st.f_files as u64,
        ffree: st.f_ffree as u64,
        bsize: st.f_bsize as u32,
        namelen: st.f_namemax as u32,
        frsize: st.f_frsize as u32,
    })
}

/// Check access permissions for the calling process.
pub fn access(path: &Path, mask: i32) -> io::Result<()> {
    let cpath = cstring(path.as_os_str())?;
    check(unsafe { libc::access(cpath.as_ptr(), mask) })
}

/// Create a device node, FIFO or socket. Regular files go through the
/// dispatcher instead.
pub fn mknod(path: &Path, mode: u32, rdev: u32) -> io::Result<()> {
    let cpath = cstring(path.as_os_str())?;
    check(unsafe { libc::mknod(cpath.as_ptr(), mode as libc::mode_t, rdev as libc::dev_t) })
}

/// Result of an xattr query that may ask for the size only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XattrValue {
    /// Caller asked for the size only.
    Size(u32),
    Data(Vec<u8>),
}

#[cfg(target_os = "linux")]
fn sized(n: libc::ssize_t, mut buf: Vec<u8>, size_only: bool) -> io::Result<XattrValue> {
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    if size_only {
        return Ok(XattrValue::Size(n as u32));
    }
    buf.truncate(n as usize);
    Ok(XattrValue::Data(buf))
}

#[cfg(target_os = "linux")]
pub fn get_xattr(path: &Path, name: &OsStr, size: u32) -> io::Result<XattrValue> {
    let cpath = cstring(path.as_os_str())?;
    let cname = cstring(name)?;
    let mut buf = vec![0u8; size as usize];
    let n = unsafe {
        libc::lgetxattr(
            cpath.as_ptr(),
            cname.as_ptr(),
            buf.as_mut_ptr().cast(),
            buf.len(),
        )
    };
    sized(n, buf, size == 0)
}

#[cfg(target_os = "linux")]
pub fn list_xattr(path: &Path, size: u32) -> io::Result<XattrValue> {
    let cpath = cstring(path.as_os_str())?;
    let mut buf = vec![0u8; size as usize];
    let n = unsafe { libc::llistxattr(cpath.as_ptr(), buf.as_mut_ptr().cast(), buf.len()) };
    sized(n, buf, size == 0)
}

#[cfg(target_os = "linux")]
pub fn set_xattr(path: &Path, name: &OsStr, value: &[u8], flags: i32) -> io::Result<()> {
    let cpath = cstring(path.as_os_str())?;
    let cname = cstring(name)?;
    check(unsafe {
        libc::lsetxattr(
            cpath.as_ptr(),
            cname.as_ptr(),
            value.as_ptr().cast(),
            value.len(),
            flags,
        )
    })
}

#[cfg(target_os = "linux")]
pub fn remove_xattr(path: &Path, name: &OsStr) -> io::Result<()> {
    let cpath = cstring(path.as_os_str())?;
    let cname = cstring(name)?;
    check(unsafe { libc::lremovexattr(cpath.as_ptr(), cname.as_ptr()) })
}
