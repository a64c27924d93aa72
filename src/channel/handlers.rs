//! Per-opcode request handlers and the dispatch table.
//!
//! Each handler parses its argument bytes, calls the mount's
//! [`Dispatcher`], and builds the reply. Handlers return
//! `Ok(Some(response))` for operations with replies, `Ok(None)` for the
//! forget family (which the kernel never expects a reply to), and
//! `Err(errno)` for failures; the channel converts errors into protocol
//! error replies.

use crate::dispatch::{Dispatcher, RequestContext};
use crate::ll::argument::ArgumentIterator;
use crate::ll::fuse_abi::{self as abi, fuse_opcode};
use crate::ll::reply::{DirList, Response};
use crate::ll::{Errno, FileHandle, InodeNumber};
use crate::path::{PathComponent, PathError};
use crate::telemetry::{AccessType, SamplingGroup};

/// Per-mount settings handlers need while parsing and replying.
pub(crate) struct HandlerContext {
    pub require_utf8_paths: bool,
    /// Negotiated kernel protocol minor version.
    pub minor_version: u32,
}

pub(crate) type Handler = fn(
    &dyn Dispatcher,
    &RequestContext,
    &abi::fuse_in_header,
    &[u8],
    &HandlerContext,
) -> Result<Option<Response>, Errno>;

pub(crate) type ArgRenderer = fn(&[u8]) -> String;

/// One row of the dispatch table.
#[derive(Clone, Copy)]
pub(crate) struct HandlerEntry {
    pub name: &'static str,
    pub handler: Option<Handler>,
    pub arg_renderer: Option<ArgRenderer>,
    pub access_type: AccessType,
    pub sampling_group: SamplingGroup,
}

impl HandlerEntry {
    const fn unimplemented(name: &'static str) -> HandlerEntry {
        HandlerEntry {
            name,
            handler: None,
            arg_renderer: None,
            access_type: AccessType::ChannelOther,
            sampling_group: SamplingGroup::DropAll,
        }
    }

    const fn new(
        name: &'static str,
        handler: Handler,
        arg_renderer: ArgRenderer,
        access_type: AccessType,
        sampling_group: SamplingGroup,
    ) -> HandlerEntry {
        HandlerEntry {
            name,
            handler: Some(handler),
            arg_renderer: Some(arg_renderer),
            access_type,
            sampling_group,
        }
    }

    /// Lowercase short name for strace-style logs: `FUSE_LOOKUP` →
    /// `lookup`.
    pub fn short_name(&self) -> String {
        match self.name.strip_prefix("FUSE_") {
            Some(rest) => rest
                .chars()
                .filter(|c| *c != '_')
                .map(|c| c.to_ascii_lowercase())
                .collect(),
            // Only CUSE ops lack the prefix; return them capitalized and
            // whole.
            None => self.name.to_string(),
        }
    }
}

/// Look up the table entry for an opcode, if the opcode is known at all.
pub(crate) fn lookup_handler_entry(opcode: u32) -> Option<&'static HandlerEntry> {
    if opcode == fuse_opcode::CUSE_INIT as u32 {
        // Kept separate to avoid a 4096-slot table; CUSE is never served.
        return Some(&CUSE_INIT_HANDLER);
    }
    let entry = HANDLERS.get(opcode as usize)?;
    if entry.name.is_empty() {
        return None;
    }
    Some(entry)
}

/// Display name for an opcode, for logs and traces.
pub(crate) fn opcode_name(opcode: u32) -> &'static str {
    lookup_handler_entry(opcode)
        .map(|entry| entry.name)
        .unwrap_or("<unknown>")
}

/// Access classification used by process-level access logging.
pub(crate) fn opcode_access_type(opcode: u32) -> AccessType {
    lookup_handler_entry(opcode)
        .map(|entry| entry.access_type)
        .unwrap_or(AccessType::ChannelOther)
}

/// Sampling group the telemetry sink applies to an opcode.
pub(crate) fn opcode_sampling_group(opcode: u32) -> SamplingGroup {
    lookup_handler_entry(opcode)
        .map(|entry| entry.sampling_group)
        .unwrap_or(SamplingGroup::DropAll)
}

static CUSE_INIT_HANDLER: HandlerEntry = HandlerEntry::unimplemented("CUSE_INIT");

static HANDLERS: [HandlerEntry; 64] = build_handler_table();

const fn build_handler_table() -> [HandlerEntry; 64] {
    use AccessType::{ChannelRead as Read, ChannelWrite as Write};

    let mut table = [HandlerEntry::unimplemented(""); 64];
    // Assignments out of bounds fail to compile, which pins the table size.
    table[fuse_opcode::FUSE_LOOKUP as usize] = HandlerEntry::new(
        "FUSE_LOOKUP",
        lookup,
        render::lookup,
        Read,
        SamplingGroup::Four,
    );
    table[fuse_opcode::FUSE_FORGET as usize] = HandlerEntry::new(
        "FUSE_FORGET",
        forget,
        render::default,
        AccessType::ChannelOther,
        SamplingGroup::DropAll,
    );
    table[fuse_opcode::FUSE_GETATTR as usize] = HandlerEntry::new(
        "FUSE_GETATTR",
        getattr,
        render::default,
        Read,
        SamplingGroup::Three,
    );
    table[fuse_opcode::FUSE_SETATTR as usize] = HandlerEntry::new(
        "FUSE_SETATTR",
        setattr,
        render::default,
        Write,
        SamplingGroup::Two,
    );
    table[fuse_opcode::FUSE_READLINK as usize] = HandlerEntry::new(
        "FUSE_READLINK",
        readlink,
        render::default,
        Read,
        SamplingGroup::DropAll,
    );
    table[fuse_opcode::FUSE_SYMLINK as usize] = HandlerEntry::new(
        "FUSE_SYMLINK",
        symlink,
        render::symlink,
        Write,
        SamplingGroup::DropAll,
    );
    table[fuse_opcode::FUSE_MKNOD as usize] = HandlerEntry::new(
        "FUSE_MKNOD",
        mknod,
        render::mknod,
        Write,
        SamplingGroup::DropAll,
    );
    table[fuse_opcode::FUSE_MKDIR as usize] = HandlerEntry::new(
        "FUSE_MKDIR",
        mkdir,
        render::mkdir,
        Write,
        SamplingGroup::One,
    );
    table[fuse_opcode::FUSE_UNLINK as usize] = HandlerEntry::new(
        "FUSE_UNLINK",
        unlink,
        render::single_string,
        Write,
        SamplingGroup::DropAll,
    );
    table[fuse_opcode::FUSE_RMDIR as usize] = HandlerEntry::new(
        "FUSE_RMDIR",
        rmdir,
        render::single_string,
        Write,
        SamplingGroup::One,
    );
    table[fuse_opcode::FUSE_RENAME as usize] = HandlerEntry::new(
        "FUSE_RENAME",
        rename,
        render::rename,
        Write,
        SamplingGroup::One,
    );
    table[fuse_opcode::FUSE_LINK as usize] = HandlerEntry::new(
        "FUSE_LINK",
        link,
        render::link,
        Write,
        SamplingGroup::DropAll,
    );
    table[fuse_opcode::FUSE_OPEN as usize] = HandlerEntry::new(
        "FUSE_OPEN",
        open,
        render::default,
        AccessType::ChannelOther,
        SamplingGroup::DropAll,
    );
    table[fuse_opcode::FUSE_READ as usize] = HandlerEntry::new(
        "FUSE_READ",
        read,
        render::read,
        Read,
        SamplingGroup::Three,
    );
    table[fuse_opcode::FUSE_WRITE as usize] = HandlerEntry::new(
        "FUSE_WRITE",
        write,
        render::write,
        Write,
        SamplingGroup::Two,
    );
    table[fuse_opcode::FUSE_STATFS as usize] = HandlerEntry::new(
        "FUSE_STATFS",
        statfs,
        render::default,
        Read,
        SamplingGroup::DropAll,
    );
    table[fuse_opcode::FUSE_RELEASE as usize] = HandlerEntry::new(
        "FUSE_RELEASE",
        release,
        render::default,
        AccessType::ChannelOther,
        SamplingGroup::DropAll,
    );
    table[fuse_opcode::FUSE_FSYNC as usize] = HandlerEntry::new(
        "FUSE_FSYNC",
        fsync,
        render::default,
        Write,
        SamplingGroup::DropAll,
    );
    table[fuse_opcode::FUSE_SETXATTR as usize] = HandlerEntry::new(
        "FUSE_SETXATTR",
        setxattr,
        render::xattr_name,
        Write,
        SamplingGroup::DropAll,
    );
    table[fuse_opcode::FUSE_GETXATTR as usize] = HandlerEntry::new(
        "FUSE_GETXATTR",
        getxattr,
        render::xattr_name,
        Read,
        SamplingGroup::Three,
    );
    table[fuse_opcode::FUSE_LISTXATTR as usize] = HandlerEntry::new(
        "FUSE_LISTXATTR",
        listxattr,
        render::default,
        Read,
        SamplingGroup::Two,
    );
    table[fuse_opcode::FUSE_REMOVEXATTR as usize] = HandlerEntry::new(
        "FUSE_REMOVEXATTR",
        removexattr,
        render::single_string,
        Write,
        SamplingGroup::DropAll,
    );
    table[fuse_opcode::FUSE_FLUSH as usize] = HandlerEntry::new(
        "FUSE_FLUSH",
        flush,
        render::default,
        AccessType::ChannelOther,
        SamplingGroup::DropAll,
    );
    table[fuse_opcode::FUSE_INIT as usize] = HandlerEntry::unimplemented("FUSE_INIT");
    table[fuse_opcode::FUSE_OPENDIR as usize] = HandlerEntry::new(
        "FUSE_OPENDIR",
        opendir,
        render::default,
        AccessType::ChannelOther,
        SamplingGroup::DropAll,
    );
    table[fuse_opcode::FUSE_READDIR as usize] = HandlerEntry::new(
        "FUSE_READDIR",
        readdir,
        render::readdir,
        Read,
        SamplingGroup::Three,
    );
    table[fuse_opcode::FUSE_RELEASEDIR as usize] = HandlerEntry::new(
        "FUSE_RELEASEDIR",
        releasedir,
        render::default,
        AccessType::ChannelOther,
        SamplingGroup::DropAll,
    );
    table[fuse_opcode::FUSE_FSYNCDIR as usize] = HandlerEntry::new(
        "FUSE_FSYNCDIR",
        fsyncdir,
        render::default,
        Write,
        SamplingGroup::DropAll,
    );
    table[fuse_opcode::FUSE_GETLK as usize] = HandlerEntry::unimplemented("FUSE_GETLK");
    table[fuse_opcode::FUSE_SETLK as usize] = HandlerEntry::unimplemented("FUSE_SETLK");
    table[fuse_opcode::FUSE_SETLKW as usize] = HandlerEntry::unimplemented("FUSE_SETLKW");
    table[fuse_opcode::FUSE_ACCESS as usize] = HandlerEntry::new(
        "FUSE_ACCESS",
        access,
        render::access,
        Read,
        SamplingGroup::DropAll,
    );
    table[fuse_opcode::FUSE_CREATE as usize] = HandlerEntry::new(
        "FUSE_CREATE",
        create,
        render::create,
        Write,
        SamplingGroup::One,
    );
    table[fuse_opcode::FUSE_INTERRUPT as usize] = HandlerEntry::unimplemented("FUSE_INTERRUPT");
    table[fuse_opcode::FUSE_BMAP as usize] = HandlerEntry::new(
        "FUSE_BMAP",
        bmap,
        render::default,
        AccessType::ChannelOther,
        SamplingGroup::DropAll,
    );
    table[fuse_opcode::FUSE_DESTROY as usize] = HandlerEntry::unimplemented("FUSE_DESTROY");
    table[fuse_opcode::FUSE_IOCTL as usize] = HandlerEntry::unimplemented("FUSE_IOCTL");
    table[fuse_opcode::FUSE_POLL as usize] = HandlerEntry::unimplemented("FUSE_POLL");
    table[fuse_opcode::FUSE_NOTIFY_REPLY as usize] =
        HandlerEntry::unimplemented("FUSE_NOTIFY_REPLY");
    table[fuse_opcode::FUSE_BATCH_FORGET as usize] = HandlerEntry::new(
        "FUSE_BATCH_FORGET",
        batch_forget,
        render::batch_forget,
        AccessType::ChannelOther,
        SamplingGroup::DropAll,
    );
    table[fuse_opcode::FUSE_FALLOCATE as usize] = HandlerEntry::new(
        "FUSE_FALLOCATE",
        fallocate,
        render::fallocate,
        Write,
        SamplingGroup::DropAll,
    );
    table[fuse_opcode::FUSE_READDIRPLUS as usize] =
        HandlerEntry::unimplemented("FUSE_READDIRPLUS");
    table[fuse_opcode::FUSE_RENAME2 as usize] = HandlerEntry::unimplemented("FUSE_RENAME2");
    table[fuse_opcode::FUSE_LSEEK as usize] = HandlerEntry::unimplemented("FUSE_LSEEK");
    table[fuse_opcode::FUSE_COPY_FILE_RANGE as usize] =
        HandlerEntry::unimplemented("FUSE_COPY_FILE_RANGE");
    table[fuse_opcode::FUSE_SETUPMAPPING as usize] =
        HandlerEntry::unimplemented("FUSE_SETUPMAPPING");
    table[fuse_opcode::FUSE_REMOVEMAPPING as usize] =
        HandlerEntry::unimplemented("FUSE_REMOVEMAPPING");
    table
}

// ---------------------------------------------------------------------------
// Parsing helpers

fn fetch<'a, T>(it: &mut ArgumentIterator<'a>) -> Result<&'a T, Errno>
where
    T: zerocopy::FromBytes + zerocopy::KnownLayout + zerocopy::Immutable,
{
    it.fetch::<T>().ok_or(Errno::EINVAL)
}

fn fetch_name<'a>(it: &mut ArgumentIterator<'a>) -> Result<&'a [u8], Errno> {
    it.fetch_bytes().ok_or(Errno::EINVAL)
}

/// Turn raw name bytes into a path component, honoring the mount's UTF-8
/// requirement. Without the requirement the raw byte sequence is accepted
/// as-is.
fn extract_path_component(bytes: &[u8], ctx: &HandlerContext) -> Result<PathComponent, Errno> {
    let result = if ctx.require_utf8_paths {
        PathComponent::from_utf8(bytes)
    } else {
        PathComponent::from_bytes(bytes)
    };
    result.map_err(|err| match err {
        PathError::NotUtf8(_) => Errno::EILSEQ,
        _ => Errno::EINVAL,
    })
}

// ---------------------------------------------------------------------------
// Handlers

fn lookup(
    d: &dyn Dispatcher,
    ctx: &RequestContext,
    header: &abi::fuse_in_header,
    arg: &[u8],
    hctx: &HandlerContext,
) -> Result<Option<Response>, Errno> {
    let mut it = ArgumentIterator::new(arg);
    let name = extract_path_component(fetch_name(&mut it)?, hctx)?;
    let entry = d.lookup(ctx, InodeNumber(header.nodeid), &name)?;
    Ok(Some(Response::new_entry(&entry)))
}

fn forget(
    d: &dyn Dispatcher,
    _ctx: &RequestContext,
    header: &abi::fuse_in_header,
    arg: &[u8],
    _hctx: &HandlerContext,
) -> Result<Option<Response>, Errno> {
    let mut it = ArgumentIterator::new(arg);
    let forget = fetch::<abi::fuse_forget_in>(&mut it)?;
    d.forget(InodeNumber(header.nodeid), forget.nlookup);
    Ok(None)
}

fn getattr(
    d: &dyn Dispatcher,
    ctx: &RequestContext,
    header: &abi::fuse_in_header,
    _arg: &[u8],
    _hctx: &HandlerContext,
) -> Result<Option<Response>, Errno> {
    let attr = d.getattr(ctx, InodeNumber(header.nodeid))?;
    Ok(Some(Response::new_attr(&attr)))
}

fn setattr(
    d: &dyn Dispatcher,
    ctx: &RequestContext,
    header: &abi::fuse_in_header,
    arg: &[u8],
    _hctx: &HandlerContext,
) -> Result<Option<Response>, Errno> {
    let mut it = ArgumentIterator::new(arg);
    let setattr = fetch::<abi::fuse_setattr_in>(&mut it)?;
    let attr = d.setattr(ctx, InodeNumber(header.nodeid), setattr)?;
    Ok(Some(Response::new_attr(&attr)))
}

fn readlink(
    d: &dyn Dispatcher,
    ctx: &RequestContext,
    header: &abi::fuse_in_header,
    _arg: &[u8],
    _hctx: &HandlerContext,
) -> Result<Option<Response>, Errno> {
    let target = d.readlink(ctx, InodeNumber(header.nodeid))?;
    Ok(Some(Response::new_data(target)))
}

fn symlink(
    d: &dyn Dispatcher,
    ctx: &RequestContext,
    header: &abi::fuse_in_header,
    arg: &[u8],
    hctx: &HandlerContext,
) -> Result<Option<Response>, Errno> {
    let mut it = ArgumentIterator::new(arg);
    let name = extract_path_component(fetch_name(&mut it)?, hctx)?;
    // The link target is an arbitrary byte string, not a component.
    let target = fetch_name(&mut it)?;
    let entry = d.symlink(ctx, InodeNumber(header.nodeid), &name, target)?;
    Ok(Some(Response::new_entry(&entry)))
}

fn mknod(
    d: &dyn Dispatcher,
    ctx: &RequestContext,
    header: &abi::fuse_in_header,
    arg: &[u8],
    hctx: &HandlerContext,
) -> Result<Option<Response>, Errno> {
    let mut it = ArgumentIterator::new(arg);
    let mknod = fetch::<abi::fuse_mknod_in>(&mut it)?;
    let name = extract_path_component(fetch_name(&mut it)?, hctx)?;
    let entry = d.mknod(ctx, InodeNumber(header.nodeid), &name, mknod.mode, mknod.rdev)?;
    Ok(Some(Response::new_entry(&entry)))
}

fn mkdir(
    d: &dyn Dispatcher,
    ctx: &RequestContext,
    header: &abi::fuse_in_header,
    arg: &[u8],
    hctx: &HandlerContext,
) -> Result<Option<Response>, Errno> {
    let mut it = ArgumentIterator::new(arg);
    let mkdir = fetch::<abi::fuse_mkdir_in>(&mut it)?;
    let name = extract_path_component(fetch_name(&mut it)?, hctx)?;
    let mode = mkdir.mode & !mkdir.umask;
    let entry = d.mkdir(ctx, InodeNumber(header.nodeid), &name, mode)?;
    Ok(Some(Response::new_entry(&entry)))
}

fn unlink(
    d: &dyn Dispatcher,
    ctx: &RequestContext,
    header: &abi::fuse_in_header,
    arg: &[u8],
    hctx: &HandlerContext,
) -> Result<Option<Response>, Errno> {
    let mut it = ArgumentIterator::new(arg);
    let name = extract_path_component(fetch_name(&mut it)?, hctx)?;
    d.unlink(ctx, InodeNumber(header.nodeid), &name)?;
    Ok(Some(Response::new_empty()))
}

fn rmdir(
    d: &dyn Dispatcher,
    ctx: &RequestContext,
    header: &abi::fuse_in_header,
    arg: &[u8],
    hctx: &HandlerContext,
) -> Result<Option<Response>, Errno> {
    let mut it = ArgumentIterator::new(arg);
    let name = extract_path_component(fetch_name(&mut it)?, hctx)?;
    d.rmdir(ctx, InodeNumber(header.nodeid), &name)?;
    Ok(Some(Response::new_empty()))
}

fn rename(
    d: &dyn Dispatcher,
    ctx: &RequestContext,
    header: &abi::fuse_in_header,
    arg: &[u8],
    hctx: &HandlerContext,
) -> Result<Option<Response>, Errno> {
    let mut it = ArgumentIterator::new(arg);
    let rename = fetch::<abi::fuse_rename_in>(&mut it)?;
    let mut new_dir = rename.newdir;
    let mut old_name = fetch_name(&mut it)?;
    let mut new_name = fetch_name(&mut it)?;

    if old_name.is_empty() || new_name.is_empty() {
        // One driver variant widened the argument block without bumping the
        // protocol version; the extra word is zeroed for a plain rename,
        // which leaves both names decoding as empty. Impossible names, so
        // re-read using the widened layout.
        let mut alt = ArgumentIterator::new(arg);
        let rename_alt = fetch::<abi::fuse_rename_alt_in>(&mut alt)?;
        new_dir = rename_alt.newdir;
        old_name = fetch_name(&mut alt)?;
        new_name = fetch_name(&mut alt)?;
    }

    let old_name = extract_path_component(old_name, hctx)?;
    let new_name = extract_path_component(new_name, hctx)?;
    d.rename(
        ctx,
        InodeNumber(header.nodeid),
        &old_name,
        InodeNumber(new_dir),
        &new_name,
    )?;
    Ok(Some(Response::new_empty()))
}

fn link(
    d: &dyn Dispatcher,
    ctx: &RequestContext,
    header: &abi::fuse_in_header,
    arg: &[u8],
    hctx: &HandlerContext,
) -> Result<Option<Response>, Errno> {
    let mut it = ArgumentIterator::new(arg);
    let link = fetch::<abi::fuse_link_in>(&mut it)?;
    let name = extract_path_component(fetch_name(&mut it)?, hctx)?;
    let entry = d.link(ctx, InodeNumber(link.oldnodeid), InodeNumber(header.nodeid), &name)?;
    Ok(Some(Response::new_entry(&entry)))
}

fn open(
    d: &dyn Dispatcher,
    ctx: &RequestContext,
    header: &abi::fuse_in_header,
    arg: &[u8],
    _hctx: &HandlerContext,
) -> Result<Option<Response>, Errno> {
    let mut it = ArgumentIterator::new(arg);
    let open = fetch::<abi::fuse_open_in>(&mut it)?;
    let reply = d.open(ctx, InodeNumber(header.nodeid), open.flags)?;
    Ok(Some(Response::new_open(
        reply.fh,
        reply.flags | abi::FopenFlags::KEEP_CACHE,
    )))
}

fn read(
    d: &dyn Dispatcher,
    ctx: &RequestContext,
    header: &abi::fuse_in_header,
    arg: &[u8],
    _hctx: &HandlerContext,
) -> Result<Option<Response>, Errno> {
    let mut it = ArgumentIterator::new(arg);
    let read = fetch::<abi::fuse_read_in>(&mut it)?;
    let data = d.read(
        ctx,
        InodeNumber(header.nodeid),
        FileHandle(read.fh),
        read.offset,
        read.size,
    )?;
    Ok(Some(Response::new_data(data)))
}

fn write(
    d: &dyn Dispatcher,
    ctx: &RequestContext,
    header: &abi::fuse_in_header,
    arg: &[u8],
    hctx: &HandlerContext,
) -> Result<Option<Response>, Errno> {
    let mut it = ArgumentIterator::new(arg);
    let write = fetch::<abi::fuse_write_in>(&mut it)?;
    // Before protocol 7.9 the argument block was shorter and the payload
    // started at the old struct size.
    let data = if hctx.minor_version < 9 {
        arg.get(abi::FUSE_COMPAT_WRITE_IN_SIZE..)
            .ok_or(Errno::EINVAL)?
    } else {
        it.fetch_all()
    };
    let data = data.get(..write.size as usize).ok_or(Errno::EINVAL)?;
    let written = d.write(
        ctx,
        InodeNumber(header.nodeid),
        FileHandle(write.fh),
        write.offset,
        data,
    )?;
    Ok(Some(Response::new_write(written)))
}

fn statfs(
    d: &dyn Dispatcher,
    ctx: &RequestContext,
    header: &abi::fuse_in_header,
    _arg: &[u8],
    _hctx: &HandlerContext,
) -> Result<Option<Response>, Errno> {
    let st = d.statfs(ctx, InodeNumber(header.nodeid))?;
    Ok(Some(Response::new_statfs(st)))
}

fn release(
    d: &dyn Dispatcher,
    ctx: &RequestContext,
    header: &abi::fuse_in_header,
    arg: &[u8],
    _hctx: &HandlerContext,
) -> Result<Option<Response>, Errno> {
    let mut it = ArgumentIterator::new(arg);
    let release = fetch::<abi::fuse_release_in>(&mut it)?;
    d.release(ctx, InodeNumber(header.nodeid), FileHandle(release.fh))?;
    Ok(Some(Response::new_empty()))
}

fn fsync(
    d: &dyn Dispatcher,
    ctx: &RequestContext,
    header: &abi::fuse_in_header,
    arg: &[u8],
    _hctx: &HandlerContext,
) -> Result<Option<Response>, Errno> {
    let mut it = ArgumentIterator::new(arg);
    let fsync = fetch::<abi::fuse_fsync_in>(&mut it)?;
    // No symbolic constant for the datasync bit.
    let datasync = fsync.fsync_flags & 1 != 0;
    d.fsync(ctx, InodeNumber(header.nodeid), datasync)?;
    Ok(Some(Response::new_empty()))
}

fn setxattr(
    d: &dyn Dispatcher,
    ctx: &RequestContext,
    header: &abi::fuse_in_header,
    arg: &[u8],
    _hctx: &HandlerContext,
) -> Result<Option<Response>, Errno> {
    let mut it = ArgumentIterator::new(arg);
    let setxattr = fetch::<abi::fuse_setxattr_in>(&mut it)?;
    let name = fetch_name(&mut it)?;
    let value = it.fetch_all();
    let value = value.get(..setxattr.size as usize).ok_or(Errno::EINVAL)?;
    d.setxattr(ctx, InodeNumber(header.nodeid), name, value, setxattr.flags)?;
    Ok(Some(Response::new_empty()))
}

fn getxattr(
    d: &dyn Dispatcher,
    ctx: &RequestContext,
    header: &abi::fuse_in_header,
    arg: &[u8],
    _hctx: &HandlerContext,
) -> Result<Option<Response>, Errno> {
    let mut it = ArgumentIterator::new(arg);
    let getxattr = fetch::<abi::fuse_getxattr_in>(&mut it)?;
    let name = fetch_name(&mut it)?;
    let value = d.getxattr(ctx, InodeNumber(header.nodeid), name)?;
    if getxattr.size == 0 {
        // Caller is probing for the size.
        Ok(Some(Response::new_xattr_size(value.len() as u32)))
    } else if (getxattr.size as usize) < value.len() {
        Err(Errno::ERANGE)
    } else {
        Ok(Some(Response::new_data(value)))
    }
}

fn listxattr(
    d: &dyn Dispatcher,
    ctx: &RequestContext,
    header: &abi::fuse_in_header,
    arg: &[u8],
    _hctx: &HandlerContext,
) -> Result<Option<Response>, Errno> {
    let mut it = ArgumentIterator::new(arg);
    let listxattr = fetch::<abi::fuse_getxattr_in>(&mut it)?;
    let attrs = d.listxattr(ctx, InodeNumber(header.nodeid))?;
    // Each name is NUL-terminated in the reply.
    let count: usize = attrs.iter().map(|attr| attr.len() + 1).sum();
    if listxattr.size == 0 {
        Ok(Some(Response::new_xattr_size(count as u32)))
    } else if (listxattr.size as usize) < count {
        Err(Errno::ERANGE)
    } else {
        let mut buf = Vec::with_capacity(count);
        for attr in attrs {
            buf.extend_from_slice(&attr);
            buf.push(0);
        }
        Ok(Some(Response::new_data(buf)))
    }
}

fn removexattr(
    d: &dyn Dispatcher,
    ctx: &RequestContext,
    header: &abi::fuse_in_header,
    arg: &[u8],
    _hctx: &HandlerContext,
) -> Result<Option<Response>, Errno> {
    let mut it = ArgumentIterator::new(arg);
    let name = fetch_name(&mut it)?;
    d.removexattr(ctx, InodeNumber(header.nodeid), name)?;
    Ok(Some(Response::new_empty()))
}

fn flush(
    d: &dyn Dispatcher,
    ctx: &RequestContext,
    header: &abi::fuse_in_header,
    arg: &[u8],
    _hctx: &HandlerContext,
) -> Result<Option<Response>, Errno> {
    let mut it = ArgumentIterator::new(arg);
    let flush = fetch::<abi::fuse_flush_in>(&mut it)?;
    d.flush(
        ctx,
        InodeNumber(header.nodeid),
        FileHandle(flush.fh),
        flush.lock_owner,
    )?;
    Ok(Some(Response::new_empty()))
}

fn opendir(
    d: &dyn Dispatcher,
    ctx: &RequestContext,
    header: &abi::fuse_in_header,
    arg: &[u8],
    hctx: &HandlerContext,
) -> Result<Option<Response>, Errno> {
    let mut it = ArgumentIterator::new(arg);
    let open = fetch::<abi::fuse_open_in>(&mut it)?;
    let reply = d.opendir(ctx, InodeNumber(header.nodeid), open.flags)?;
    let mut flags = reply.flags;
    if hctx.minor_version >= 28 {
        // Opt into readdir caching.
        flags |= abi::FopenFlags::KEEP_CACHE | abi::FopenFlags::CACHE_DIR;
    }
    Ok(Some(Response::new_open(reply.fh, flags)))
}

fn readdir(
    d: &dyn Dispatcher,
    ctx: &RequestContext,
    header: &abi::fuse_in_header,
    arg: &[u8],
    _hctx: &HandlerContext,
) -> Result<Option<Response>, Errno> {
    let mut it = ArgumentIterator::new(arg);
    let read = fetch::<abi::fuse_read_in>(&mut it)?;
    let list = DirList::with_max_size(read.size as usize);
    let list = d.readdir(
        ctx,
        InodeNumber(header.nodeid),
        FileHandle(read.fh),
        read.offset,
        list,
    )?;
    Ok(Some(list.into_response()))
}

fn releasedir(
    d: &dyn Dispatcher,
    ctx: &RequestContext,
    header: &abi::fuse_in_header,
    arg: &[u8],
    _hctx: &HandlerContext,
) -> Result<Option<Response>, Errno> {
    let mut it = ArgumentIterator::new(arg);
    let release = fetch::<abi::fuse_release_in>(&mut it)?;
    d.releasedir(ctx, InodeNumber(header.nodeid), FileHandle(release.fh))?;
    Ok(Some(Response::new_empty()))
}

fn fsyncdir(
    d: &dyn Dispatcher,
    ctx: &RequestContext,
    header: &abi::fuse_in_header,
    arg: &[u8],
    _hctx: &HandlerContext,
) -> Result<Option<Response>, Errno> {
    let mut it = ArgumentIterator::new(arg);
    let fsync = fetch::<abi::fuse_fsync_in>(&mut it)?;
    let datasync = fsync.fsync_flags & 1 != 0;
    d.fsyncdir(ctx, InodeNumber(header.nodeid), datasync)?;
    Ok(Some(Response::new_empty()))
}

fn access(
    d: &dyn Dispatcher,
    ctx: &RequestContext,
    header: &abi::fuse_in_header,
    arg: &[u8],
    _hctx: &HandlerContext,
) -> Result<Option<Response>, Errno> {
    let mut it = ArgumentIterator::new(arg);
    let access = fetch::<abi::fuse_access_in>(&mut it)?;
    d.access(ctx, InodeNumber(header.nodeid), access.mask)?;
    Ok(Some(Response::new_empty()))
}

fn create(
    d: &dyn Dispatcher,
    ctx: &RequestContext,
    header: &abi::fuse_in_header,
    arg: &[u8],
    hctx: &HandlerContext,
) -> Result<Option<Response>, Errno> {
    let mut it = ArgumentIterator::new(arg);
    let create = fetch::<abi::fuse_create_in>(&mut it)?;
    let name = extract_path_component(fetch_name(&mut it)?, hctx)?;
    let reply = d.create(ctx, InodeNumber(header.nodeid), &name, create.mode, create.flags)?;
    let open = abi::fuse_open_out {
        fh: reply.open.fh.0,
        open_flags: (reply.open.flags | abi::FopenFlags::KEEP_CACHE).bits(),
        padding: 0,
    };
    Ok(Some(Response::new_create(&reply.entry, &open)))
}

fn bmap(
    d: &dyn Dispatcher,
    ctx: &RequestContext,
    header: &abi::fuse_in_header,
    arg: &[u8],
    _hctx: &HandlerContext,
) -> Result<Option<Response>, Errno> {
    let mut it = ArgumentIterator::new(arg);
    let bmap = fetch::<abi::fuse_bmap_in>(&mut it)?;
    let block = d.bmap(ctx, InodeNumber(header.nodeid), bmap.blocksize, bmap.block)?;
    Ok(Some(Response::new_bmap(block)))
}

fn batch_forget(
    d: &dyn Dispatcher,
    _ctx: &RequestContext,
    _header: &abi::fuse_in_header,
    arg: &[u8],
    _hctx: &HandlerContext,
) -> Result<Option<Response>, Errno> {
    let mut it = ArgumentIterator::new(arg);
    let batch = fetch::<abi::fuse_batch_forget_in>(&mut it)?;
    for _ in 0..batch.count {
        let one = fetch::<abi::fuse_forget_one>(&mut it)?;
        d.forget(InodeNumber(one.nodeid), one.nlookup);
    }
    Ok(None)
}

fn fallocate(
    d: &dyn Dispatcher,
    ctx: &RequestContext,
    header: &abi::fuse_in_header,
    arg: &[u8],
    _hctx: &HandlerContext,
) -> Result<Option<Response>, Errno> {
    let mut it = ArgumentIterator::new(arg);
    let fallocate = fetch::<abi::fuse_fallocate_in>(&mut it)?;
    if fallocate.mode != 0 {
        // Replying ENOSYS (rather than EOPNOTSUPP per mode) stops the
        // userspace fallback that would otherwise emulate allocation by
        // writing a byte to every 512-byte block.
        return Err(Errno::ENOSYS);
    }
    d.fallocate(
        ctx,
        InodeNumber(header.nodeid),
        FileHandle(fallocate.fh),
        fallocate.offset,
        fallocate.length,
    )?;
    Ok(Some(Response::new_empty()))
}

// ---------------------------------------------------------------------------
// Argument renderers for trace logs

mod render {
    use super::*;

    fn lossy(bytes: &[u8]) -> String {
        String::from_utf8_lossy(bytes).into_owned()
    }

    pub(super) fn default(_arg: &[u8]) -> String {
        String::new()
    }

    pub(super) fn single_string(arg: &[u8]) -> String {
        let mut it = ArgumentIterator::new(arg);
        it.fetch_bytes().map(lossy).unwrap_or_default()
    }

    pub(super) fn lookup(arg: &[u8]) -> String {
        single_string(arg)
    }

    pub(super) fn symlink(arg: &[u8]) -> String {
        let mut it = ArgumentIterator::new(arg);
        let name = it.fetch_bytes().map(lossy).unwrap_or_default();
        let target = it.fetch_bytes().map(lossy).unwrap_or_default();
        format!("name={name}, target={target}")
    }

    pub(super) fn mknod(arg: &[u8]) -> String {
        let mut it = ArgumentIterator::new(arg);
        let Some(mknod) = it.fetch::<abi::fuse_mknod_in>() else {
            return String::new();
        };
        let name = it.fetch_bytes().map(lossy).unwrap_or_default();
        format!("{name}, mode={:#o}, rdev={}", mknod.mode, mknod.rdev)
    }

    pub(super) fn mkdir(arg: &[u8]) -> String {
        let mut it = ArgumentIterator::new(arg);
        let Some(mkdir) = it.fetch::<abi::fuse_mkdir_in>() else {
            return String::new();
        };
        let name = it.fetch_bytes().map(lossy).unwrap_or_default();
        format!("{name}, mode={:#o}", mkdir.mode & !mkdir.umask)
    }

    pub(super) fn rename(arg: &[u8]) -> String {
        let mut it = ArgumentIterator::new(arg);
        let Some(rename) = it.fetch::<abi::fuse_rename_in>() else {
            return String::new();
        };
        let old = it.fetch_bytes().map(lossy).unwrap_or_default();
        let new = it.fetch_bytes().map(lossy).unwrap_or_default();
        format!("old={old}, newdir={}, new={new}", rename.newdir)
    }

    pub(super) fn link(arg: &[u8]) -> String {
        let mut it = ArgumentIterator::new(arg);
        let Some(link) = it.fetch::<abi::fuse_link_in>() else {
            return String::new();
        };
        let name = it.fetch_bytes().map(lossy).unwrap_or_default();
        format!("oldParent={}, newName={name}", link.oldnodeid)
    }

    pub(super) fn read(arg: &[u8]) -> String {
        let mut it = ArgumentIterator::new(arg);
        let Some(read) = it.fetch::<abi::fuse_read_in>() else {
            return String::new();
        };
        format!("off={}, len={}", read.offset, read.size)
    }

    pub(super) fn write(arg: &[u8]) -> String {
        let mut it = ArgumentIterator::new(arg);
        let Some(write) = it.fetch::<abi::fuse_write_in>() else {
            return String::new();
        };
        format!("off={}, len={}", write.offset, write.size)
    }

    pub(super) fn readdir(arg: &[u8]) -> String {
        let mut it = ArgumentIterator::new(arg);
        let Some(read) = it.fetch::<abi::fuse_read_in>() else {
            return String::new();
        };
        format!("offset={}", read.offset)
    }

    pub(super) fn xattr_name(arg: &[u8]) -> String {
        let mut it = ArgumentIterator::new(arg);
        if it.fetch::<abi::fuse_getxattr_in>().is_none() {
            return String::new();
        }
        let name = it.fetch_bytes().map(lossy).unwrap_or_default();
        format!("name={name}")
    }

    pub(super) fn access(arg: &[u8]) -> String {
        let mut it = ArgumentIterator::new(arg);
        let Some(access) = it.fetch::<abi::fuse_access_in>() else {
            return String::new();
        };
        format!("mask={}", access.mask)
    }

    pub(super) fn create(arg: &[u8]) -> String {
        let mut it = ArgumentIterator::new(arg);
        let Some(create) = it.fetch::<abi::fuse_create_in>() else {
            return String::new();
        };
        let name = it.fetch_bytes().map(lossy).unwrap_or_default();
        format!("name={name}, mode={:#o}", create.mode)
    }

    pub(super) fn batch_forget(arg: &[u8]) -> String {
        let mut it = ArgumentIterator::new(arg);
        let Some(batch) = it.fetch::<abi::fuse_batch_forget_in>() else {
            return String::new();
        };
        format!("count={}", batch.count)
    }

    pub(super) fn fallocate(arg: &[u8]) -> String {
        let mut it = ArgumentIterator::new(arg);
        let Some(fallocate) = it.fetch::<abi::fuse_fallocate_in>() else {
            return String::new();
        };
        format!(
            "mode={}, offset={}, length={}",
            fallocate.mode, fallocate.offset, fallocate.length
        )
    }
}
