//! Wire protocol for the privileged helper process.
//!
//! Mount and unmount syscalls require privileges the daemon drops at
//! startup, so they are proxied to a privileged sibling process over a
//! socketpair. The protocol is hand-rolled rather than using a serialization
//! framework because file descriptors must travel with some messages via
//! `SCM_RIGHTS`, and only this one local pair ever speaks it.
//!
//! Every packet starts with a fixed header:
//! `u32 version || u32 metadata-length || u32 transaction-id || u32 message-type`
//! followed by a typed body. Body encodings are tag-free and
//! length-prefixed: booleans are one byte, strings are `u32 length || bytes`,
//! socket addresses are `bool is-inet` followed by host+port or path,
//! optional values are `bool present || value`. Integers are native-endian;
//! both ends share one machine.

use std::path::PathBuf;
use std::time::Duration;

use bitflags::bitflags;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::socket::Message;

/// Bump on any protocol change so both daemons know which version framing
/// to apply.
pub const PRIVHELPER_CURRENT_VERSION: u32 = 1;

/// Message types. `RespError` is only ever sent helper → daemon.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
pub enum MsgType {
    None = 0,
    RespError = 1,
    ReqMountFuse = 2,
    ReqMountBind = 3,
    ReqUnmountFuse = 4,
    ReqTakeoverShutdown = 5,
    ReqTakeoverStartup = 6,
    ReqSetLogFile = 7,
    ReqUnmountBind = 8,
    ReqSetDaemonTimeout = 9,
    ReqSetUseVeilFs = 10,
    ReqMountNfs = 11,
    ReqUnmountNfs = 12,
    ReqGetPid = 13,
    ReqStartFam = 14,
    ReqStopFam = 15,
    ReqSetMemoryPriorityForProcess = 16,
}

bitflags! {
    /// Options for unmount requests; bit values match umount(2).
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct UnmountOptions: u32 {
        const FORCE = 1 << 0;
        const DETACH = 1 << 1;
        const EXPIRE = 1 << 2;
    }
}

/// This struct's layout should never change; protocol evolution happens in
/// the metadata that follows it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub version: u32,
    /// Size of the metadata that follows the header.
    pub length: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketMetadata {
    pub transaction_id: u32,
    pub msg_type: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Packet {
    pub header: PacketHeader,
    pub metadata: PacketMetadata,
}

impl Packet {
    pub fn msg_type(&self) -> Result<MsgType, PrivHelperError> {
        MsgType::try_from(self.metadata.msg_type)
            .map_err(|_| PrivHelperError::UnknownMessageType(self.metadata.msg_type))
    }
}

/// Errors in privhelper conversations. Protocol-shaped failures are fatal
/// to the connection.
#[derive(Debug, thiserror::Error)]
pub enum PrivHelperError {
    #[error("privhelper protocol version mismatch: expected {expected}, got {got}")]
    VersionMismatch { expected: u32, got: u32 },
    #[error("unknown privhelper message type {0}")]
    UnknownMessageType(u32),
    #[error("expected privhelper response of type {expected:?}, got {got:?}")]
    UnexpectedResponse { expected: MsgType, got: MsgType },
    #[error("truncated privhelper message")]
    Truncated,
    #[error("unexpected trailing data at end of {0}: {1} bytes")]
    TrailingData(&'static str, usize),
    #[error("string in privhelper message is not UTF-8")]
    NotUtf8,
    #[error("remote error ({exception_type}): {message}")]
    Remote {
        exception_type: String,
        message: String,
    },
    #[error(transparent)]
    Os(#[from] std::io::Error),
}

/// Either an inet host/port or a unix path, for the NFS mount endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketAddress {
    Inet { host: String, port: u16 },
    Unix { path: PathBuf },
}

/// Options carried by an NFS mount request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NfsMountOptions {
    pub mountd_addr: SocketAddress,
    pub nfsd_addr: SocketAddress,
    pub read_only: bool,
    pub iosize: u32,
    pub use_readdirplus: bool,
    pub use_soft_mount: bool,
}

// ---------------------------------------------------------------------------
// Cursor / appender primitives

struct Cursor<'a> {
    data: &'a [u8],
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Cursor<'a> {
        Cursor { data }
    }

    fn remaining(&self) -> usize {
        self.data.len()
    }

    fn is_at_end(&self) -> bool {
        self.data.is_empty()
    }

    fn read_exact(&mut self, len: usize) -> Result<&'a [u8], PrivHelperError> {
        if self.data.len() < len {
            return Err(PrivHelperError::Truncated);
        }
        let (out, rest) = self.data.split_at(len);
        self.data = rest;
        Ok(out)
    }

    fn skip(&mut self, len: usize) -> Result<(), PrivHelperError> {
        self.read_exact(len).map(|_| ())
    }

    fn read_u8(&mut self) -> Result<u8, PrivHelperError> {
        Ok(self.read_exact(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16, PrivHelperError> {
        Ok(u16::from_ne_bytes(self.read_exact(2)?.try_into().unwrap()))
    }

    fn read_u32(&mut self) -> Result<u32, PrivHelperError> {
        Ok(u32::from_ne_bytes(self.read_exact(4)?.try_into().unwrap()))
    }

    fn read_i32(&mut self) -> Result<i32, PrivHelperError> {
        Ok(i32::from_ne_bytes(self.read_exact(4)?.try_into().unwrap()))
    }

    fn read_u64(&mut self) -> Result<u64, PrivHelperError> {
        Ok(u64::from_ne_bytes(self.read_exact(8)?.try_into().unwrap()))
    }

    fn read_bool(&mut self) -> Result<bool, PrivHelperError> {
        Ok(self.read_u8()? != 0)
    }

    fn read_string(&mut self) -> Result<String, PrivHelperError> {
        let len = self.read_u32()? as usize;
        let bytes = self.read_exact(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| PrivHelperError::NotUtf8)
    }

    fn read_socket_address(&mut self) -> Result<SocketAddress, PrivHelperError> {
        if self.read_bool()? {
            let host = self.read_string()?;
            let port = self.read_u16()?;
            Ok(SocketAddress::Inet { host, port })
        } else {
            let path = self.read_string()?;
            Ok(SocketAddress::Unix {
                path: PathBuf::from(path),
            })
        }
    }
}

#[derive(Default)]
struct Appender {
    buf: Vec<u8>,
}

impl Appender {
    fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    fn write_u16(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_ne_bytes());
    }

    fn write_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_ne_bytes());
    }

    fn write_i32(&mut self, value: i32) {
        self.buf.extend_from_slice(&value.to_ne_bytes());
    }

    fn write_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_ne_bytes());
    }

    fn write_bool(&mut self, value: bool) {
        self.write_u8(value as u8);
    }

    fn write_string(&mut self, value: &str) {
        self.write_u32(value.len() as u32);
        self.buf.extend_from_slice(value.as_bytes());
    }

    fn write_socket_address(&mut self, addr: &SocketAddress) {
        match addr {
            SocketAddress::Inet { host, port } => {
                self.write_bool(true);
                self.write_string(host);
                self.write_u16(*port);
            }
            SocketAddress::Unix { path } => {
                self.write_bool(false);
                self.write_string(&path.to_string_lossy());
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Packet framing

fn serialize_packet(xid: u32, msg_type: MsgType) -> Appender {
    let mut appender = Appender::default();
    appender.write_u32(PRIVHELPER_CURRENT_VERSION);
    appender.write_u32((size_of::<u32>() * 2) as u32);
    appender.write_u32(xid);
    appender.write_u32(u32::from(msg_type));
    appender
}

/// Parse the packet header and metadata.
///
/// The metadata length in the header is honored: a longer metadata block
/// from a newer peer is skipped over, so body parsing starts at the right
/// offset. A version other than [`PRIVHELPER_CURRENT_VERSION`] is a fatal
/// protocol error.
pub fn parse_packet<'a>(cursor_data: &mut &'a [u8]) -> Result<Packet, PrivHelperError> {
    let mut cursor = Cursor::new(*cursor_data);
    let version = cursor.read_u32()?;
    let length = cursor.read_u32()?;
    if version != PRIVHELPER_CURRENT_VERSION {
        return Err(PrivHelperError::VersionMismatch {
            expected: PRIVHELPER_CURRENT_VERSION,
            got: version,
        });
    }

    let known_len = (size_of::<u32>() * 2) as u32;
    let pulled = length.min(known_len);
    let mut metadata_cursor = Cursor::new(cursor.read_exact(pulled as usize)?);
    let transaction_id = metadata_cursor.read_u32()?;
    let msg_type = metadata_cursor.read_u32()?;
    // Skip metadata this version does not know about.
    cursor.skip((length - pulled) as usize)?;

    *cursor_data = cursor.data;
    Ok(Packet {
        header: PacketHeader { version, length },
        metadata: PacketMetadata {
            transaction_id,
            msg_type,
        },
    })
}

fn check_at_end(cursor: &Cursor<'_>, message_type: &'static str) -> Result<(), PrivHelperError> {
    if !cursor.is_at_end() {
        return Err(PrivHelperError::TrailingData(
            message_type,
            cursor.remaining(),
        ));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Requests

pub fn serialize_mount_fuse_request(
    xid: u32,
    mount_point: &str,
    read_only: bool,
    vfs_type: &str,
) -> Message {
    let mut appender = serialize_packet(xid, MsgType::ReqMountFuse);
    appender.write_string(mount_point);
    appender.write_bool(read_only);
    appender.write_string(vfs_type);
    Message::from_data(appender.buf)
}

pub fn parse_mount_fuse_request(
    body: &[u8],
) -> Result<(String, bool, String), PrivHelperError> {
    let mut cursor = Cursor::new(body);
    let mount_point = cursor.read_string()?;
    let read_only = cursor.read_bool()?;
    let vfs_type = cursor.read_string()?;
    check_at_end(&cursor, "mount request")?;
    Ok((mount_point, read_only, vfs_type))
}

pub fn serialize_mount_nfs_request(
    xid: u32,
    mount_point: &str,
    options: &NfsMountOptions,
) -> Message {
    let mut appender = serialize_packet(xid, MsgType::ReqMountNfs);
    appender.write_string(mount_point);
    appender.write_socket_address(&options.mountd_addr);
    appender.write_socket_address(&options.nfsd_addr);
    appender.write_bool(options.read_only);
    appender.write_u32(options.iosize);
    appender.write_bool(options.use_readdirplus);
    appender.write_bool(options.use_soft_mount);
    Message::from_data(appender.buf)
}

pub fn parse_mount_nfs_request(
    body: &[u8],
) -> Result<(String, NfsMountOptions), PrivHelperError> {
    let mut cursor = Cursor::new(body);
    let mount_point = cursor.read_string()?;
    let options = NfsMountOptions {
        mountd_addr: cursor.read_socket_address()?,
        nfsd_addr: cursor.read_socket_address()?,
        read_only: cursor.read_bool()?,
        iosize: cursor.read_u32()?,
        use_readdirplus: cursor.read_bool()?,
        use_soft_mount: cursor.read_bool()?,
    };
    check_at_end(&cursor, "mount nfs request")?;
    Ok((mount_point, options))
}

pub fn serialize_unmount_fuse_request(
    xid: u32,
    mount_point: &str,
    options: UnmountOptions,
) -> Message {
    let mut appender = serialize_packet(xid, MsgType::ReqUnmountFuse);
    appender.write_string(mount_point);
    appender.write_u32(options.bits());
    Message::from_data(appender.buf)
}

pub fn parse_unmount_fuse_request(
    body: &[u8],
) -> Result<(String, UnmountOptions), PrivHelperError> {
    let mut cursor = Cursor::new(body);
    let mount_point = cursor.read_string()?;
    let options = UnmountOptions::from_bits_truncate(cursor.read_u32()?);
    check_at_end(&cursor, "unmount request")?;
    Ok((mount_point, options))
}

pub fn serialize_unmount_nfs_request(xid: u32, mount_point: &str) -> Message {
    let mut appender = serialize_packet(xid, MsgType::ReqUnmountNfs);
    appender.write_string(mount_point);
    Message::from_data(appender.buf)
}

pub fn parse_unmount_nfs_request(body: &[u8]) -> Result<String, PrivHelperError> {
    let mut cursor = Cursor::new(body);
    let mount_point = cursor.read_string()?;
    check_at_end(&cursor, "unmount nfs request")?;
    Ok(mount_point)
}

pub fn serialize_bind_mount_request(xid: u32, client_path: &str, mount_path: &str) -> Message {
    let mut appender = serialize_packet(xid, MsgType::ReqMountBind);
    appender.write_string(client_path);
    appender.write_string(mount_path);
    Message::from_data(appender.buf)
}

pub fn parse_bind_mount_request(body: &[u8]) -> Result<(String, String), PrivHelperError> {
    let mut cursor = Cursor::new(body);
    let client_path = cursor.read_string()?;
    let mount_path = cursor.read_string()?;
    check_at_end(&cursor, "bind mount request")?;
    Ok((client_path, mount_path))
}

pub fn serialize_bind_unmount_request(xid: u32, mount_path: &str) -> Message {
    let mut appender = serialize_packet(xid, MsgType::ReqUnmountBind);
    appender.write_string(mount_path);
    Message::from_data(appender.buf)
}

pub fn parse_bind_unmount_request(body: &[u8]) -> Result<String, PrivHelperError> {
    let mut cursor = Cursor::new(body);
    let mount_path = cursor.read_string()?;
    check_at_end(&cursor, "bind unmount request")?;
    Ok(mount_path)
}

pub fn serialize_takeover_shutdown_request(xid: u32, mount_point: &str) -> Message {
    let mut appender = serialize_packet(xid, MsgType::ReqTakeoverShutdown);
    appender.write_string(mount_point);
    Message::from_data(appender.buf)
}

pub fn parse_takeover_shutdown_request(body: &[u8]) -> Result<String, PrivHelperError> {
    let mut cursor = Cursor::new(body);
    let mount_point = cursor.read_string()?;
    check_at_end(&cursor, "takeover shutdown request")?;
    Ok(mount_point)
}

pub fn serialize_takeover_startup_request(
    xid: u32,
    mount_point: &str,
    bind_mounts: &[String],
) -> Message {
    let mut appender = serialize_packet(xid, MsgType::ReqTakeoverStartup);
    appender.write_string(mount_point);
    appender.write_u32(bind_mounts.len() as u32);
    for bind_mount in bind_mounts {
        appender.write_string(bind_mount);
    }
    Message::from_data(appender.buf)
}

pub fn parse_takeover_startup_request(
    body: &[u8],
) -> Result<(String, Vec<String>), PrivHelperError> {
    let mut cursor = Cursor::new(body);
    let mount_point = cursor.read_string()?;
    let count = cursor.read_u32()? as usize;
    let mut bind_mounts = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        bind_mounts.push(cursor.read_string()?);
    }
    check_at_end(&cursor, "takeover startup request")?;
    Ok((mount_point, bind_mounts))
}

/// The log file travels as a descriptor, not in the body.
pub fn serialize_set_log_file_request(xid: u32, log_file: std::os::fd::OwnedFd) -> Message {
    let appender = serialize_packet(xid, MsgType::ReqSetLogFile);
    Message {
        data: appender.buf,
        files: vec![log_file],
    }
}

pub fn parse_set_log_file_request(body: &[u8]) -> Result<(), PrivHelperError> {
    check_at_end(&Cursor::new(body), "set log file request")
}

pub fn serialize_set_daemon_timeout_request(xid: u32, duration: Duration) -> Message {
    let mut appender = serialize_packet(xid, MsgType::ReqSetDaemonTimeout);
    appender.write_u64(duration.as_nanos() as u64);
    Message::from_data(appender.buf)
}

pub fn parse_set_daemon_timeout_request(body: &[u8]) -> Result<Duration, PrivHelperError> {
    let mut cursor = Cursor::new(body);
    let nanos = cursor.read_u64()?;
    check_at_end(&cursor, "set daemon timeout request")?;
    Ok(Duration::from_nanos(nanos))
}

pub fn serialize_set_use_veilfs_request(xid: u32, use_veilfs: bool) -> Message {
    let mut appender = serialize_packet(xid, MsgType::ReqSetUseVeilFs);
    appender.write_bool(use_veilfs);
    Message::from_data(appender.buf)
}

pub fn parse_set_use_veilfs_request(body: &[u8]) -> Result<bool, PrivHelperError> {
    let mut cursor = Cursor::new(body);
    let use_veilfs = cursor.read_bool()?;
    check_at_end(&cursor, "set use veilfs request")?;
    Ok(use_veilfs)
}

pub fn serialize_get_pid_request(xid: u32) -> Message {
    Message::from_data(serialize_packet(xid, MsgType::ReqGetPid).buf)
}

pub fn serialize_get_pid_response(xid: u32, pid: i32) -> Message {
    let mut appender = serialize_packet(xid, MsgType::ReqGetPid);
    appender.write_i32(pid);
    Message::from_data(appender.buf)
}

pub fn parse_get_pid_response(msg: &Message) -> Result<i32, PrivHelperError> {
    let mut body = msg.data.as_slice();
    let packet = parse_packet(&mut body)?;
    expect_response_type(&packet, MsgType::ReqGetPid, body)?;
    let mut cursor = Cursor::new(body);
    let pid = cursor.read_i32()?;
    check_at_end(&cursor, "get pid response")?;
    Ok(pid)
}

pub fn serialize_start_fam_request(
    xid: u32,
    paths: &[String],
    tmp_output_path: &str,
    specified_output_path: &str,
    should_upload: bool,
) -> Message {
    let mut appender = serialize_packet(xid, MsgType::ReqStartFam);
    appender.write_u32(paths.len() as u32);
    for path in paths {
        appender.write_string(path);
    }
    appender.write_string(tmp_output_path);
    appender.write_string(specified_output_path);
    appender.write_bool(should_upload);
    Message::from_data(appender.buf)
}

#[allow(clippy::type_complexity)]
pub fn parse_start_fam_request(
    body: &[u8],
) -> Result<(Vec<String>, String, String, bool), PrivHelperError> {
    let mut cursor = Cursor::new(body);
    let count = cursor.read_u32()? as usize;
    let mut paths = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        paths.push(cursor.read_string()?);
    }
    let tmp_output_path = cursor.read_string()?;
    let specified_output_path = cursor.read_string()?;
    let should_upload = cursor.read_bool()?;
    check_at_end(&cursor, "start file access monitor request")?;
    Ok((paths, tmp_output_path, specified_output_path, should_upload))
}

pub fn serialize_stop_fam_request(xid: u32) -> Message {
    Message::from_data(serialize_packet(xid, MsgType::ReqStopFam).buf)
}

pub fn serialize_stop_fam_response(
    xid: u32,
    tmp_output_path: &str,
    specified_output_path: &str,
    should_upload: bool,
) -> Message {
    let mut appender = serialize_packet(xid, MsgType::ReqStopFam);
    appender.write_string(tmp_output_path);
    appender.write_string(specified_output_path);
    appender.write_bool(should_upload);
    Message::from_data(appender.buf)
}

pub fn parse_stop_fam_response(msg: &Message) -> Result<(String, String, bool), PrivHelperError> {
    let mut body = msg.data.as_slice();
    let packet = parse_packet(&mut body)?;
    expect_response_type(&packet, MsgType::ReqStopFam, body)?;
    let mut cursor = Cursor::new(body);
    let tmp_output_path = cursor.read_string()?;
    let specified_output_path = cursor.read_string()?;
    let should_upload = cursor.read_bool()?;
    check_at_end(&cursor, "stop file access monitor response")?;
    Ok((tmp_output_path, specified_output_path, should_upload))
}

pub fn serialize_set_memory_priority_request(xid: u32, pid: i32, target_priority: i32) -> Message {
    let mut appender = serialize_packet(xid, MsgType::ReqSetMemoryPriorityForProcess);
    appender.write_i32(pid);
    appender.write_i32(target_priority);
    Message::from_data(appender.buf)
}

pub fn parse_set_memory_priority_request(
    body: &[u8],
) -> Result<(i32, i32), PrivHelperError> {
    let mut cursor = Cursor::new(body);
    let pid = cursor.read_i32()?;
    let target_priority = cursor.read_i32()?;
    check_at_end(&cursor, "set memory priority for process request")?;
    Ok((pid, target_priority))
}

// ---------------------------------------------------------------------------
// Responses

/// Serialize a success response carrying no body: the request's packet
/// echoed back with its transaction id.
pub fn serialize_empty_response(xid: u32, req_type: MsgType) -> Message {
    Message::from_data(serialize_packet(xid, req_type).buf)
}

pub fn serialize_error_response(
    xid: u32,
    errnum: i32,
    message: &str,
    exception_type: &str,
) -> Message {
    let mut appender = serialize_packet(xid, MsgType::RespError);
    appender.write_u32(errnum as u32);
    appender.write_string(message);
    appender.write_string(exception_type);
    Message::from_data(appender.buf)
}

/// Convert a received error body into the error it describes.
fn rethrow_error_response(body: &[u8]) -> PrivHelperError {
    let mut cursor = Cursor::new(body);
    let parse = (|| -> Result<PrivHelperError, PrivHelperError> {
        let errnum = cursor.read_u32()? as i32;
        let message = cursor.read_string()?;
        let exception_type = cursor.read_string()?;
        if errnum != 0 {
            Ok(PrivHelperError::Os(std::io::Error::from_raw_os_error(
                errnum,
            )))
        } else {
            Ok(PrivHelperError::Remote {
                exception_type,
                message,
            })
        }
    })();
    parse.unwrap_or_else(|err| err)
}

fn expect_response_type(
    packet: &Packet,
    expected: MsgType,
    body: &[u8],
) -> Result<(), PrivHelperError> {
    let got = packet.msg_type()?;
    if got == MsgType::RespError {
        return Err(rethrow_error_response(body));
    }
    if got != expected {
        return Err(PrivHelperError::UnexpectedResponse { expected, got });
    }
    Ok(())
}

/// Parse a response expected to be empty, converting error responses and
/// type mismatches into errors.
pub fn parse_empty_response(req_type: MsgType, msg: &Message) -> Result<(), PrivHelperError> {
    let mut body = msg.data.as_slice();
    let packet = parse_packet(&mut body)?;
    expect_response_type(&packet, req_type, body)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_request(msg: &Message) -> (Packet, Vec<u8>) {
        let mut body = msg.data.as_slice();
        let packet = parse_packet(&mut body).unwrap();
        (packet, body.to_vec())
    }

    #[test]
    fn packet_layout() {
        let msg = serialize_get_pid_request(42);
        // version, metadata-length, xid, msg-type
        assert_eq!(msg.data.len(), 16);
        let (packet, body) = parse_request(&msg);
        assert_eq!(packet.header.version, PRIVHELPER_CURRENT_VERSION);
        assert_eq!(packet.header.length, 8);
        assert_eq!(packet.metadata.transaction_id, 42);
        assert_eq!(packet.msg_type().unwrap(), MsgType::ReqGetPid);
        assert!(body.is_empty());
    }

    #[test]
    fn version_mismatch_is_fatal() {
        let mut msg = serialize_get_pid_request(1);
        msg.data[0..4].copy_from_slice(&99u32.to_ne_bytes());
        let mut body = msg.data.as_slice();
        assert!(matches!(
            parse_packet(&mut body),
            Err(PrivHelperError::VersionMismatch { got: 99, .. })
        ));
    }

    #[test]
    fn oversized_metadata_is_skipped() {
        // A future peer might append extra metadata; the body must still
        // parse from the right offset.
        let mut appender = Appender::default();
        appender.write_u32(PRIVHELPER_CURRENT_VERSION);
        appender.write_u32(12);
        appender.write_u32(7);
        appender.write_u32(u32::from(MsgType::ReqUnmountNfs));
        appender.write_u32(0xdead_beef); // unknown extra metadata
        appender.write_string("/mnt/work");

        let mut body = appender.buf.as_slice();
        let packet = parse_packet(&mut body).unwrap();
        assert_eq!(packet.metadata.transaction_id, 7);
        assert_eq!(
            parse_unmount_nfs_request(body).unwrap(),
            "/mnt/work".to_string()
        );
    }

    #[test]
    fn mount_fuse_round_trip() {
        let msg = serialize_mount_fuse_request(3, "/mnt/repo", true, "fuse.veilfs");
        let (packet, body) = parse_request(&msg);
        assert_eq!(packet.msg_type().unwrap(), MsgType::ReqMountFuse);
        let (mount_point, read_only, vfs_type) =
            parse_mount_fuse_request(&body).unwrap();
        assert_eq!(mount_point, "/mnt/repo");
        assert!(read_only);
        assert_eq!(vfs_type, "fuse.veilfs");
    }

    #[test]
    fn mount_nfs_round_trip() {
        let options = NfsMountOptions {
            mountd_addr: SocketAddress::Inet {
                host: "127.0.0.1".to_string(),
                port: 5253,
            },
            nfsd_addr: SocketAddress::Unix {
                path: PathBuf::from("/tmp/nfsd.sock"),
            },
            read_only: false,
            iosize: 1 << 20,
            use_readdirplus: true,
            use_soft_mount: false,
        };
        let msg = serialize_mount_nfs_request(9, "/mnt/repo", &options);
        let (packet, body) = parse_request(&msg);
        assert_eq!(packet.msg_type().unwrap(), MsgType::ReqMountNfs);
        let (mount_point, parsed) = parse_mount_nfs_request(&body).unwrap();
        assert_eq!(mount_point, "/mnt/repo");
        assert_eq!(parsed, options);
    }

    #[test]
    fn unmount_options_round_trip() {
        let options = UnmountOptions::FORCE | UnmountOptions::DETACH;
        assert_eq!(options.bits(), 3);
        let msg = serialize_unmount_fuse_request(5, "/mnt/repo", options);
        let (_, body) = parse_request(&msg);
        let (mount_point, parsed) = parse_unmount_fuse_request(&body).unwrap();
        assert_eq!(mount_point, "/mnt/repo");
        assert_eq!(parsed, options);
    }

    #[test]
    fn takeover_startup_round_trip() {
        let binds = vec!["/mnt/repo/buck-out".to_string(), "/mnt/repo/out".to_string()];
        let msg = serialize_takeover_startup_request(11, "/mnt/repo", &binds);
        let (_, body) = parse_request(&msg);
        let (mount_point, parsed) =
            parse_takeover_startup_request(&body).unwrap();
        assert_eq!(mount_point, "/mnt/repo");
        assert_eq!(parsed, binds);
    }

    #[test]
    fn error_response_with_errno_maps_to_os_error() {
        let msg = serialize_error_response(2, libc::EPERM, "operation not permitted", "SystemError");
        let err = parse_empty_response(MsgType::ReqMountFuse, &msg).unwrap_err();
        match err {
            PrivHelperError::Os(io_err) => {
                assert_eq!(io_err.raw_os_error(), Some(libc::EPERM));
            }
            other => panic!("expected Os error, got {other:?}"),
        }
    }

    #[test]
    fn error_response_without_errno_keeps_exception_type() {
        let msg = serialize_error_response(2, 0, "mount table full", "RuntimeError");
        let err = parse_empty_response(MsgType::ReqMountFuse, &msg).unwrap_err();
        match err {
            PrivHelperError::Remote {
                exception_type,
                message,
            } => {
                assert_eq!(exception_type, "RuntimeError");
                assert_eq!(message, "mount table full");
            }
            other => panic!("expected Remote error, got {other:?}"),
        }
    }

    #[test]
    fn mismatched_response_type_is_rejected() {
        let msg = serialize_empty_response(4, MsgType::ReqUnmountFuse);
        let err = parse_empty_response(MsgType::ReqMountFuse, &msg).unwrap_err();
        assert!(matches!(
            err,
            PrivHelperError::UnexpectedResponse {
                expected: MsgType::ReqMountFuse,
                got: MsgType::ReqUnmountFuse,
            }
        ));
    }

    #[test]
    fn set_daemon_timeout_round_trip() {
        let msg = serialize_set_daemon_timeout_request(6, Duration::from_secs(90));
        let (_, body) = parse_request(&msg);
        let parsed = parse_set_daemon_timeout_request(&body).unwrap();
        assert_eq!(parsed, Duration::from_secs(90));
    }

    #[test]
    fn truncated_body_is_detected() {
        let msg = serialize_mount_fuse_request(3, "/mnt/repo", false, "fuse.veilfs");
        let (_, body) = parse_request(&msg);
        let truncated = &body[..body.len() - 3];
        assert!(matches!(
            parse_mount_fuse_request(truncated),
            Err(PrivHelperError::Truncated)
        ));
    }

    #[test]
    fn trailing_data_is_detected() {
        let msg = serialize_unmount_nfs_request(3, "/mnt/repo");
        let (_, mut body) = parse_request(&msg);
        body.push(0xff);
        assert!(matches!(
            parse_unmount_nfs_request(&body),
            Err(PrivHelperError::TrailingData(_, 1))
        ));
    }
}
