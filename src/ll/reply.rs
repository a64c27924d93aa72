//! Reply construction for kernel requests.
//!
//! Handlers build a [`Response`]; the channel's reply writer frames it with a
//! `fuse_out_header` and writes the whole thing with a single scatter/gather
//! write. Error results are converted to protocol error replies in exactly
//! one place ([`Response::with_iovec`]).

use std::io::IoSlice;

use smallvec::{SmallVec, smallvec};
use zerocopy::{Immutable, IntoBytes};

use super::fuse_abi as abi;
use super::{Errno, FileHandle, InodeNumber, RequestId};

const INLINE_DATA_THRESHOLD: usize = size_of::<u64>() * 4;

pub(crate) type ResponseBuf = SmallVec<[u8; INLINE_DATA_THRESHOLD]>;

/// One reply to one kernel request.
#[derive(Debug)]
pub enum Response {
    /// An empty reply (`Ok`) or an error reply.
    Error(Option<Errno>),
    /// An owned data payload.
    Data(ResponseBuf),
}

impl Response {
    /// Assemble the framed reply and hand the iovec to `f`.
    pub(crate) fn with_iovec<F: FnOnce(&[IoSlice<'_>]) -> T, T>(&self, unique: RequestId, f: F) -> T {
        let datalen = match self {
            Response::Error(_) => 0,
            Response::Data(v) => v.len(),
        };
        let header = abi::fuse_out_header {
            unique: unique.0,
            error: if let Response::Error(Some(errno)) = self {
                -errno.raw()
            } else {
                0
            },
            len: (size_of::<abi::fuse_out_header>() + datalen) as u32,
        };
        let mut v: SmallVec<[IoSlice<'_>; 2]> = smallvec![IoSlice::new(header.as_bytes())];
        if let Response::Data(d) = self {
            v.push(IoSlice::new(d));
        }
        f(&v)
    }

    pub(crate) fn new_empty() -> Self {
        Self::Error(None)
    }

    pub(crate) fn new_error(errno: Errno) -> Self {
        Self::Error(Some(errno))
    }

    pub(crate) fn new_data(data: impl AsRef<[u8]>) -> Self {
        Self::Data(ResponseBuf::from_slice(data.as_ref()))
    }

    pub(crate) fn from_struct<T: IntoBytes + Immutable + ?Sized>(data: &T) -> Self {
        Self::Data(ResponseBuf::from_slice(data.as_bytes()))
    }

    /// A prefix of a struct; used for the legacy truncated init reply.
    pub(crate) fn from_struct_prefix<T: IntoBytes + Immutable>(data: &T, len: usize) -> Self {
        Self::Data(ResponseBuf::from_slice(&data.as_bytes()[..len]))
    }

    pub(crate) fn new_entry(entry: &abi::fuse_entry_out) -> Self {
        Self::from_struct(entry)
    }

    pub(crate) fn new_attr(attr: &abi::fuse_attr_out) -> Self {
        Self::from_struct(attr)
    }

    pub(crate) fn new_open(fh: FileHandle, flags: abi::FopenFlags) -> Self {
        let r = abi::fuse_open_out {
            fh: fh.0,
            open_flags: flags.bits(),
            padding: 0,
        };
        Self::from_struct(&r)
    }

    /// The create reply concatenates an entry record and an open record into
    /// one payload.
    pub(crate) fn new_create(entry: &abi::fuse_entry_out, open: &abi::fuse_open_out) -> Self {
        let mut buf = ResponseBuf::with_capacity(size_of_val(entry) + size_of_val(open));
        buf.extend_from_slice(entry.as_bytes());
        buf.extend_from_slice(open.as_bytes());
        Self::Data(buf)
    }

    pub(crate) fn new_write(written: u32) -> Self {
        let r = abi::fuse_write_out {
            size: written,
            padding: 0,
        };
        Self::from_struct(&r)
    }

    pub(crate) fn new_statfs(st: abi::fuse_kstatfs) -> Self {
        Self::from_struct(&abi::fuse_statfs_out { st })
    }

    pub(crate) fn new_xattr_size(size: u32) -> Self {
        let r = abi::fuse_getxattr_out { size, padding: 0 };
        Self::from_struct(&r)
    }

    pub(crate) fn new_bmap(block: u64) -> Self {
        Self::from_struct(&abi::fuse_bmap_out { block })
    }
}

/// Builder for a directory listing in the kernel's dirent format.
///
/// Entries are packed as `fuse_dirent` records, each padded to 8 bytes, so
/// the finished buffer can be sent to the kernel verbatim.
#[derive(Debug, Default)]
pub struct DirList {
    buf: Vec<u8>,
    max_size: usize,
}

impl DirList {
    /// A list that will not accept more than `max_size` bytes of packed
    /// entries (the size the kernel asked for).
    pub fn with_max_size(max_size: usize) -> Self {
        DirList {
            buf: Vec::new(),
            max_size,
        }
    }

    /// Append one entry.
    ///
    /// `offset` is the value the kernel passes back to resume the listing
    /// after this entry. Returns false (and adds nothing) once the buffer is
    /// full; the caller should stop iterating.
    pub fn push(&mut self, ino: InodeNumber, offset: u64, kind: DirEntryType, name: &[u8]) -> bool {
        let entlen = size_of::<abi::fuse_dirent>() + name.len();
        let entsize = entlen.next_multiple_of(abi::FUSE_DIRENT_ALIGN);
        if self.buf.len() + entsize > self.max_size {
            return false;
        }
        let dirent = abi::fuse_dirent {
            ino: ino.0,
            off: offset,
            namelen: name.len() as u32,
            typ: kind as u32,
        };
        self.buf.extend_from_slice(dirent.as_bytes());
        self.buf.extend_from_slice(name);
        self.buf.resize(self.buf.len() + (entsize - entlen), 0);
        true
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub(crate) fn into_response(self) -> Response {
        Response::new_data(self.buf)
    }
}

/// d_type values for directory entries, as the kernel expects them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DirEntryType {
    Fifo = 1,
    CharDevice = 2,
    Directory = 4,
    BlockDevice = 6,
    RegularFile = 8,
    Symlink = 10,
    Socket = 12,
}
