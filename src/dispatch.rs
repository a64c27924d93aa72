//! The dispatcher contract between the kernel channel and the inode layer.
//!
//! The channel owns protocol framing; a [`Dispatcher`] implementation owns
//! semantics. One typed method per opcode, all taking `&self` (dispatchers
//! use interior mutability and are called concurrently from the request
//! pool). Every method has a default implementation returning the reply the
//! kernel should see for an unimplemented operation, so partial dispatchers
//! are usable from day one.
//!
//! Methods return `Result<_, Errno>`; the channel converts errors into
//! protocol error replies in one place.

use crate::ll::fuse_abi as abi;
use crate::ll::reply::DirList;
use crate::ll::{Errno, FileHandle, InodeNumber, RequestId};
use crate::path::PathComponent;

pub type DispatchResult<T> = Result<T, Errno>;

/// Identity and bookkeeping for one kernel request.
#[derive(Debug, Clone, Copy)]
pub struct RequestContext {
    pub unique: RequestId,
    pub uid: u32,
    pub gid: u32,
    /// Pid of the requesting process; best-effort only, pids recycle.
    pub pid: u32,
}

impl RequestContext {
    pub(crate) fn from_header(header: &abi::fuse_in_header) -> RequestContext {
        RequestContext {
            unique: RequestId(header.unique),
            uid: header.uid,
            gid: header.gid,
            pid: header.pid,
        }
    }
}

/// Outcome of an open-style operation.
#[derive(Debug, Clone, Copy)]
pub struct OpenReply {
    pub fh: FileHandle,
    pub flags: abi::FopenFlags,
}

/// Outcome of a create: the new entry plus an open handle, sent to the
/// kernel as one combined reply.
#[derive(Debug, Clone, Copy)]
pub struct CreateReply {
    pub entry: abi::fuse_entry_out,
    pub open: OpenReply,
}

/// Filesystem operation implementations for one mount.
#[allow(unused_variables)]
pub trait Dispatcher: Send + Sync {
    /// Called once the kernel connection parameters are negotiated (or
    /// adopted from a takeover).
    fn initialize(&self, conn: &abi::fuse_init_out) {}

    /// Called when the kernel sends the destroy request during unmount.
    fn destroy(&self) {}

    fn lookup(
        &self,
        ctx: &RequestContext,
        parent: InodeNumber,
        name: &PathComponent,
    ) -> DispatchResult<abi::fuse_entry_out> {
        Err(Errno::ENOSYS)
    }

    /// The kernel dropped `nlookup` references to this inode. No reply.
    fn forget(&self, ino: InodeNumber, nlookup: u64) {}

    fn getattr(&self, ctx: &RequestContext, ino: InodeNumber) -> DispatchResult<abi::fuse_attr_out> {
        Err(Errno::ENOSYS)
    }

    fn setattr(
        &self,
        ctx: &RequestContext,
        ino: InodeNumber,
        attr: &abi::fuse_setattr_in,
    ) -> DispatchResult<abi::fuse_attr_out> {
        Err(Errno::ENOSYS)
    }

    fn readlink(&self, ctx: &RequestContext, ino: InodeNumber) -> DispatchResult<Vec<u8>> {
        Err(Errno::ENOSYS)
    }

    fn symlink(
        &self,
        ctx: &RequestContext,
        parent: InodeNumber,
        name: &PathComponent,
        target: &[u8],
    ) -> DispatchResult<abi::fuse_entry_out> {
        Err(Errno::ENOSYS)
    }

    fn mknod(
        &self,
        ctx: &RequestContext,
        parent: InodeNumber,
        name: &PathComponent,
        mode: u32,
        rdev: u32,
    ) -> DispatchResult<abi::fuse_entry_out> {
        Err(Errno::ENOSYS)
    }

    fn mkdir(
        &self,
        ctx: &RequestContext,
        parent: InodeNumber,
        name: &PathComponent,
        mode: u32,
    ) -> DispatchResult<abi::fuse_entry_out> {
        Err(Errno::ENOSYS)
    }

    fn unlink(
        &self,
        ctx: &RequestContext,
        parent: InodeNumber,
        name: &PathComponent,
    ) -> DispatchResult<()> {
        Err(Errno::ENOSYS)
    }

    fn rmdir(
        &self,
        ctx: &RequestContext,
        parent: InodeNumber,
        name: &PathComponent,
    ) -> DispatchResult<()> {
        Err(Errno::ENOSYS)
    }

    fn rename(
        &self,
        ctx: &RequestContext,
        parent: InodeNumber,
        name: &PathComponent,
        new_parent: InodeNumber,
        new_name: &PathComponent,
    ) -> DispatchResult<()> {
        Err(Errno::ENOSYS)
    }

    fn link(
        &self,
        ctx: &RequestContext,
        ino: InodeNumber,
        new_parent: InodeNumber,
        new_name: &PathComponent,
    ) -> DispatchResult<abi::fuse_entry_out> {
        Err(Errno::ENOSYS)
    }

    /// Replying `ENOSYS` here opts into zero-message opens: the kernel
    /// stops sending open requests entirely.
    fn open(&self, ctx: &RequestContext, ino: InodeNumber, flags: u32) -> DispatchResult<OpenReply> {
        Err(Errno::ENOSYS)
    }

    fn read(
        &self,
        ctx: &RequestContext,
        ino: InodeNumber,
        fh: FileHandle,
        offset: u64,
        size: u32,
    ) -> DispatchResult<Vec<u8>> {
        Err(Errno::ENOSYS)
    }

    fn write(
        &self,
        ctx: &RequestContext,
        ino: InodeNumber,
        fh: FileHandle,
        offset: u64,
        data: &[u8],
    ) -> DispatchResult<u32> {
        Err(Errno::ENOSYS)
    }

    fn statfs(&self, ctx: &RequestContext, ino: InodeNumber) -> DispatchResult<abi::fuse_kstatfs> {
        // A plausible default so stat(1) and friends behave before the
        // inode layer supplies real numbers.
        Ok(abi::fuse_kstatfs {
            namelen: 255,
            bsize: 512,
            ..Default::default()
        })
    }

    fn release(&self, ctx: &RequestContext, ino: InodeNumber, fh: FileHandle) -> DispatchResult<()> {
        Ok(())
    }

    fn fsync(&self, ctx: &RequestContext, ino: InodeNumber, datasync: bool) -> DispatchResult<()> {
        Err(Errno::ENOSYS)
    }

    fn setxattr(
        &self,
        ctx: &RequestContext,
        ino: InodeNumber,
        name: &[u8],
        value: &[u8],
        flags: u32,
    ) -> DispatchResult<()> {
        Err(Errno::ENOSYS)
    }

    /// Absent attributes report `ENODATA`.
    fn getxattr(
        &self,
        ctx: &RequestContext,
        ino: InodeNumber,
        name: &[u8],
    ) -> DispatchResult<Vec<u8>> {
        Err(Errno::ENODATA)
    }

    fn listxattr(&self, ctx: &RequestContext, ino: InodeNumber) -> DispatchResult<Vec<Vec<u8>>> {
        Ok(Vec::new())
    }

    fn removexattr(
        &self,
        ctx: &RequestContext,
        ino: InodeNumber,
        name: &[u8],
    ) -> DispatchResult<()> {
        Err(Errno::ENOSYS)
    }

    fn flush(
        &self,
        ctx: &RequestContext,
        ino: InodeNumber,
        fh: FileHandle,
        lock_owner: u64,
    ) -> DispatchResult<()> {
        Ok(())
    }

    /// Directory handles are stateless by default.
    fn opendir(
        &self,
        ctx: &RequestContext,
        ino: InodeNumber,
        flags: u32,
    ) -> DispatchResult<OpenReply> {
        Ok(OpenReply {
            fh: FileHandle(0),
            flags: abi::FopenFlags::empty(),
        })
    }

    /// Fill `list` with entries starting at `offset`. The list buffer is
    /// already in the kernel's dirent format; stop filling when
    /// [`DirList::push`] reports the size cap.
    fn readdir(
        &self,
        ctx: &RequestContext,
        ino: InodeNumber,
        fh: FileHandle,
        offset: u64,
        list: DirList,
    ) -> DispatchResult<DirList> {
        Err(Errno::ENOSYS)
    }

    fn releasedir(
        &self,
        ctx: &RequestContext,
        ino: InodeNumber,
        fh: FileHandle,
    ) -> DispatchResult<()> {
        Ok(())
    }

    fn fsyncdir(&self, ctx: &RequestContext, ino: InodeNumber, datasync: bool) -> DispatchResult<()> {
        Ok(())
    }

    fn access(&self, ctx: &RequestContext, ino: InodeNumber, mask: u32) -> DispatchResult<()> {
        Err(Errno::ENOSYS)
    }

    fn create(
        &self,
        ctx: &RequestContext,
        parent: InodeNumber,
        name: &PathComponent,
        mode: u32,
        flags: u32,
    ) -> DispatchResult<CreateReply> {
        Err(Errno::ENOSYS)
    }

    fn bmap(
        &self,
        ctx: &RequestContext,
        ino: InodeNumber,
        blocksize: u32,
        index: u64,
    ) -> DispatchResult<u64> {
        Err(Errno::ENOSYS)
    }

    /// Only mode 0 reaches implementations; other mode bits are answered
    /// with `ENOSYS` before dispatch so library fallbacks that would write
    /// a byte per block stay disabled.
    fn fallocate(
        &self,
        ctx: &RequestContext,
        ino: InodeNumber,
        fh: FileHandle,
        offset: u64,
        length: u64,
    ) -> DispatchResult<()> {
        Err(Errno::ENOSYS)
    }
}
