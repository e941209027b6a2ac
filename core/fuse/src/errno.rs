//! Error to errno translation for FUSE replies.

use mirrorfs_common::Error;

/// Map a mediation error to the errno reported to the kernel.
pub fn to_errno(err: &Error) -> i32 {
    match err {
        Error::InvalidPath(_) => libc::EINVAL,
        Error::PathTooLong(_) => libc::ENAMETOOLONG,
        Error::NotFound(_) => libc::ENOENT,
        Error::Format(_) | Error::Integrity(_) | Error::Crypto(_) => libc::EIO,
        Error::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        Error::OutOfRange(_) | Error::InvalidInput(_) => libc::EINVAL,
        Error::FileTooLarge(_) => libc::EFBIG,
        Error::BadHandle(_) => libc::EBADF,
    }
}

/// Errno of a raw I/O error from a passthrough call.
pub fn io_errno(err: &std::io::Error) -> i32 {
    err.raw_os_error().unwrap_or(libc::EIO)
}
