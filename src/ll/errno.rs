//! Errno newtype used for per-request error replies.

use std::io;
use std::num::NonZeroI32;

/// A non-zero POSIX error number.
///
/// Request handlers return `Result<_, Errno>`; the reply writer negates the
/// value into the kernel reply header. Keeping the value non-zero makes a
/// "successful error reply" unrepresentable.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Errno(pub NonZeroI32);

impl Errno {
    pub const EPERM: Errno = Errno::from_const(libc::EPERM);
    pub const ENOENT: Errno = Errno::from_const(libc::ENOENT);
    pub const EINTR: Errno = Errno::from_const(libc::EINTR);
    pub const EIO: Errno = Errno::from_const(libc::EIO);
    pub const EAGAIN: Errno = Errno::from_const(libc::EAGAIN);
    pub const EACCES: Errno = Errno::from_const(libc::EACCES);
    pub const EEXIST: Errno = Errno::from_const(libc::EEXIST);
    pub const ENODEV: Errno = Errno::from_const(libc::ENODEV);
    pub const ENOTDIR: Errno = Errno::from_const(libc::ENOTDIR);
    pub const EISDIR: Errno = Errno::from_const(libc::EISDIR);
    pub const EINVAL: Errno = Errno::from_const(libc::EINVAL);
    pub const ERANGE: Errno = Errno::from_const(libc::ERANGE);
    pub const ENOSYS: Errno = Errno::from_const(libc::ENOSYS);
    pub const ENODATA: Errno = Errno::from_const(libc::ENODATA);
    pub const ENOTEMPTY: Errno = Errno::from_const(libc::ENOTEMPTY);
    pub const ENAMETOOLONG: Errno = Errno::from_const(libc::ENAMETOOLONG);
    pub const EPROTO: Errno = Errno::from_const(libc::EPROTO);
    pub const ENOTTY: Errno = Errno::from_const(libc::ENOTTY);
    pub const ETIMEDOUT: Errno = Errno::from_const(libc::ETIMEDOUT);
    pub const EILSEQ: Errno = Errno::from_const(libc::EILSEQ);
    pub const EROFS: Errno = Errno::from_const(libc::EROFS);
    pub const ENOSPC: Errno = Errno::from_const(libc::ENOSPC);
    pub const EMSGSIZE: Errno = Errno::from_const(libc::EMSGSIZE);

    const fn from_const(value: i32) -> Errno {
        match NonZeroI32::new(value) {
            Some(v) => Errno(v),
            None => panic!("errno constants are non-zero"),
        }
    }

    /// Wrap a raw errno value, substituting EIO for zero.
    pub fn from_raw(value: i32) -> Errno {
        NonZeroI32::new(value).map(Errno).unwrap_or(Errno::EIO)
    }

    pub fn raw(self) -> i32 {
        self.0.get()
    }

    fn name(self) -> Option<&'static str> {
        // Covers the errnos this crate generates itself plus the common ones
        // dispatchers are likely to return. Anything else renders numerically.
        Some(match self.0.get() {
            libc::EPERM => "EPERM",
            libc::ENOENT => "ENOENT",
            libc::EINTR => "EINTR",
            libc::EIO => "EIO",
            libc::EAGAIN => "EAGAIN",
            libc::EACCES => "EACCES",
            libc::EEXIST => "EEXIST",
            libc::EXDEV => "EXDEV",
            libc::ENODEV => "ENODEV",
            libc::ENOTDIR => "ENOTDIR",
            libc::EISDIR => "EISDIR",
            libc::EINVAL => "EINVAL",
            libc::EFBIG => "EFBIG",
            libc::ENOSPC => "ENOSPC",
            libc::EROFS => "EROFS",
            libc::EMLINK => "EMLINK",
            libc::EPIPE => "EPIPE",
            libc::ERANGE => "ERANGE",
            libc::ENAMETOOLONG => "ENAMETOOLONG",
            libc::ENOSYS => "ENOSYS",
            libc::ENOTEMPTY => "ENOTEMPTY",
            libc::ENODATA => "ENODATA",
            libc::EPROTO => "EPROTO",
            libc::ENOTTY => "ENOTTY",
            libc::ETIMEDOUT => "ETIMEDOUT",
            libc::EILSEQ => "EILSEQ",
            libc::EMSGSIZE => "EMSGSIZE",
            _ => return None,
        })
    }
}

impl From<io::Error> for Errno {
    fn from(err: io::Error) -> Errno {
        err.raw_os_error().map(Errno::from_raw).unwrap_or(Errno::EIO)
    }
}

impl From<nix::errno::Errno> for Errno {
    fn from(err: nix::errno::Errno) -> Errno {
        Errno::from_raw(err as i32)
    }
}

impl From<Errno> for io::Error {
    fn from(errno: Errno) -> io::Error {
        io::Error::from_raw_os_error(errno.raw())
    }
}

impl std::fmt::Debug for Errno {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "Errno({})", self.0.get()),
        }
    }
}

impl std::fmt::Display for Errno {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_becomes_eio() {
        assert_eq!(Errno::from_raw(0), Errno::EIO);
    }

    #[test]
    fn io_error_round_trip() {
        let err = io::Error::from_raw_os_error(libc::ENOENT);
        assert_eq!(Errno::from(err), Errno::ENOENT);
        let back: io::Error = Errno::ENOENT.into();
        assert_eq!(back.raw_os_error(), Some(libc::ENOENT));
    }

    #[test]
    fn display_uses_symbolic_names() {
        assert_eq!(Errno::ENOSYS.to_string(), "ENOSYS");
        assert_eq!(Errno::from_raw(4095).to_string(), "Errno(4095)");
    }
}
