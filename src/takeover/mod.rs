//! Graceful-restart handover of live mount state.
//!
//! During a graceful restart the outgoing process hands the incoming one its
//! kernel connections, administrative sockets, lock file, and per-mount
//! inode snapshots over a unix-domain socket, so applications using the
//! mounts never observe an interruption.
//!
//! Message framing is
//! `u32be version || u32be header-size || u64be capabilities || payload`,
//! where the header-size and capability words are present only for protocol
//! versions that negotiate capability matching. The payload is a
//! length-delimited binary serialization of the mount list; file
//! descriptors travel out-of-band via `SCM_RIGHTS` in an order declared
//! inside the payload.

use std::os::fd::OwnedFd;
use std::path::PathBuf;

use bitflags::bitflags;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use zerocopy::{FromBytes, IntoBytes};

use crate::ll::fuse_abi::fuse_init_out;
use crate::socket::{Message, SocketError, UnixSocket};

bitflags! {
    /// One bit per protocol feature. The negotiated set is the intersection
    /// of what each side claims to support.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TakeoverCapabilities: u64 {
        /// The legacy hand-rolled serialization; never negotiated anymore
        /// but kept so old version numbers stay decodable.
        const CUSTOM_SERIALIZATION = 1 << 0;
        /// FUSE mounts can be transferred.
        const FUSE = 1 << 1;
        /// The sender pings the receiver before committing.
        const PING = 1 << 2;
        /// The binary payload serialization this crate implements.
        const SERDE_SERIALIZATION = 1 << 3;
        /// Mount entries carry an explicit protocol tag.
        const MOUNT_TYPES = 1 << 4;
        /// NFS mounts can be transferred.
        const NFS = 1 << 5;
        /// The payload is a result type that can carry an error instead of
        /// mount data.
        const RESULT_TYPE_SERIALIZATION = 1 << 6;
        /// File descriptors are sent in a sender-declared order instead of
        /// a fixed one.
        const ORDERED_FDS = 1 << 7;
        /// The mountd socket may be omitted; requires ORDERED_FDS.
        const OPTIONAL_MOUNTD = 1 << 8;
        /// The header carries an explicit capability word.
        const CAPABILITY_MATCHING = 1 << 9;
        /// The header carries its own size for forward compatibility.
        const INCLUDE_HEADER_SIZE = 1 << 10;
        /// Large payloads may be split across framed chunks.
        const CHUNKED_MESSAGE = 1 << 11;
    }
}

/// Protocol versions. Within a version the capability set is fixed; version
/// seven adds the explicit capability word, after which the version only
/// selects header framing.
pub const VERSION_NEVER_SUPPORTED: u32 = 0;
pub const VERSION_ONE: u32 = 1;
pub const VERSION_THREE: u32 = 3;
pub const VERSION_FOUR: u32 = 4;
pub const VERSION_FIVE: u32 = 5;
pub const VERSION_SIX: u32 = 6;
pub const VERSION_SEVEN: u32 = 7;

/// Versions this implementation can speak.
pub const SUPPORTED_VERSIONS: &[u32] = &[
    VERSION_THREE,
    VERSION_FOUR,
    VERSION_FIVE,
    VERSION_SIX,
    VERSION_SEVEN,
];

/// The full capability set of this implementation.
pub fn supported_capabilities() -> TakeoverCapabilities {
    TakeoverCapabilities::FUSE
        | TakeoverCapabilities::MOUNT_TYPES
        | TakeoverCapabilities::PING
        | TakeoverCapabilities::SERDE_SERIALIZATION
        | TakeoverCapabilities::NFS
        | TakeoverCapabilities::RESULT_TYPE_SERIALIZATION
        | TakeoverCapabilities::ORDERED_FDS
        | TakeoverCapabilities::OPTIONAL_MOUNTD
        | TakeoverCapabilities::CAPABILITY_MATCHING
        | TakeoverCapabilities::INCLUDE_HEADER_SIZE
        | TakeoverCapabilities::CHUNKED_MESSAGE
}

/// Default maximum size of one chunk of a chunked message.
///
/// Large enough to amortize per-chunk overhead; small enough that the
/// receive side can reassemble a multi-gigabyte inode snapshot without one
/// frame exceeding the socket layer's message cap.
pub const DEFAULT_MAXIMUM_CHUNK_SIZE: usize = 512 * 1024 * 1024;

/// Sentinel message types, sent as lone 4-byte big-endian words. Regular
/// takeover messages are longer than 4 bytes, so length disambiguates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MessageType {
    Error = 1,
    Ping = 2,
    FirstChunk = 3,
    LastChunk = 4,
}

/// Errors in takeover negotiation and transfer.
#[derive(Debug, thiserror::Error)]
pub enum TakeoverError {
    #[error("unsupported takeover version: {0}")]
    UnsupportedVersion(u32),
    #[error("unsupported combination of capabilities: {0:#x}")]
    UnsupportedCapabilities(u64),
    #[error(
        "the client and the server do not share a common takeover protocol implementation"
    )]
    NoCommonSerialization,
    #[error("optional mountd can not be used without ordered file descriptors")]
    OptionalMountdRequiresOrderedFds,
    #[error("malformed takeover header: {0}")]
    MalformedHeader(String),
    #[error("received {received} file descriptors but expected {expected}")]
    FdCountMismatch { expected: usize, received: usize },
    #[error("mount protocol not permitted by negotiated capabilities: {0}")]
    UnsupportedMountProtocol(String),
    #[error("takeover failed on the remote side: {0}")]
    Remote(String),
    #[error("payload serialization failed: {0}")]
    Payload(#[from] bincode::Error),
    #[error(transparent)]
    Socket(#[from] SocketError),
}

/// Map a version to the capability set it implies.
pub fn version_to_capabilities(version: u32) -> Result<TakeoverCapabilities, TakeoverError> {
    use TakeoverCapabilities as C;
    match version {
        VERSION_NEVER_SUPPORTED => Ok(C::empty()),
        VERSION_ONE => Ok(C::CUSTOM_SERIALIZATION | C::FUSE),
        VERSION_THREE => Ok(C::FUSE | C::SERDE_SERIALIZATION),
        VERSION_FOUR => Ok(C::FUSE | C::SERDE_SERIALIZATION | C::PING),
        VERSION_FIVE => {
            Ok(C::FUSE | C::MOUNT_TYPES | C::PING | C::SERDE_SERIALIZATION | C::NFS)
        }
        VERSION_SIX => Ok(C::FUSE
            | C::MOUNT_TYPES
            | C::PING
            | C::SERDE_SERIALIZATION
            | C::NFS
            | C::RESULT_TYPE_SERIALIZATION
            | C::ORDERED_FDS
            | C::OPTIONAL_MOUNTD),
        VERSION_SEVEN => Ok(version_seven_capabilities()),
        other => Err(TakeoverError::UnsupportedVersion(other)),
    }
}

fn version_seven_capabilities() -> TakeoverCapabilities {
    use TakeoverCapabilities as C;
    C::FUSE
        | C::MOUNT_TYPES
        | C::PING
        | C::SERDE_SERIALIZATION
        | C::NFS
        | C::RESULT_TYPE_SERIALIZATION
        | C::ORDERED_FDS
        | C::OPTIONAL_MOUNTD
        | C::CAPABILITY_MATCHING
        | C::INCLUDE_HEADER_SIZE
        | C::CHUNKED_MESSAGE
}

/// Map a capability set back to the version advertising it.
pub fn capabilities_to_version(
    capabilities: TakeoverCapabilities,
) -> Result<u32, TakeoverError> {
    for version in [
        VERSION_NEVER_SUPPORTED,
        VERSION_ONE,
        VERSION_THREE,
        VERSION_FOUR,
        VERSION_FIVE,
        VERSION_SIX,
        VERSION_SEVEN,
    ] {
        if version_to_capabilities(version)? == capabilities {
            return Ok(version);
        }
    }
    Err(TakeoverError::UnsupportedCapabilities(capabilities.bits()))
}

/// Pick the best version both sides support.
pub fn compute_compatible_version(client: &[u32], supported: &[u32]) -> Option<u32> {
    client
        .iter()
        .copied()
        .filter(|version| supported.contains(version))
        .max()
}

/// Intersect capability sets, enforcing that the result can actually carry
/// a conversation: both sides must share the serialization capability, and
/// the optional-mountd feature cannot stand without ordered descriptors.
pub fn compute_compatible_capabilities(
    client: TakeoverCapabilities,
    supported: TakeoverCapabilities,
) -> Result<TakeoverCapabilities, TakeoverError> {
    let compatible = client & supported;
    if !compatible.contains(TakeoverCapabilities::SERDE_SERIALIZATION) {
        return Err(TakeoverError::NoCommonSerialization);
    }
    if compatible.contains(TakeoverCapabilities::OPTIONAL_MOUNTD)
        && !compatible.contains(TakeoverCapabilities::ORDERED_FDS)
    {
        return Err(TakeoverError::OptionalMountdRequiresOrderedFds);
    }
    Ok(compatible)
}

/// Which channel protocol a mount speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TakeoverMountProtocol {
    Fuse,
    Nfs,
}

/// General (non-mount) file descriptors, in their payload-declared order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileDescriptorType {
    LockFile,
    ThriftSocket,
    MountdSocket,
}

/// State of one mount being handed over.
#[derive(Debug)]
pub struct MountHandoff {
    pub mount_path: PathBuf,
    pub state_directory: PathBuf,
    pub protocol: TakeoverMountProtocol,
    /// Negotiated kernel connection parameters; FUSE mounts only. Stored as
    /// the raw struct bytes: endianness necessarily matches across a
    /// takeover on the same machine.
    pub connection_info: Option<fuse_init_out>,
    /// Opaque inode-map snapshot produced by the inode layer.
    pub inode_map: Vec<u8>,
    /// The kernel device (FUSE) or nfsd socket (NFS) for this mount.
    pub channel_fd: Option<OwnedFd>,
}

/// Everything an outgoing process transfers to its successor.
#[derive(Debug, Default)]
pub struct TakeoverData {
    pub lock_file: Option<OwnedFd>,
    pub thrift_socket: Option<OwnedFd>,
    pub mountd_server_socket: Option<OwnedFd>,
    /// FD order used by the last serialize/deserialize, when ORDERED_FDS is
    /// negotiated.
    pub general_fd_order: Vec<FileDescriptorType>,
    pub mount_points: Vec<MountHandoff>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SerializedMountInfo {
    mount_path: String,
    state_directory: String,
    protocol: TakeoverMountProtocol,
    /// Raw `fuse_init_out` bytes for FUSE mounts, empty otherwise.
    connection_info: Vec<u8>,
    inode_map: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SerializedTakeoverInfo {
    mounts: Vec<SerializedMountInfo>,
    file_descriptors: Vec<FileDescriptorType>,
}

#[derive(Debug, Serialize, Deserialize)]
enum SerializedTakeoverResult {
    Error(String),
    Data(SerializedTakeoverInfo),
}

impl TakeoverData {
    /// The general FD order for this data under the given capabilities:
    /// lock file, thrift socket, then the mountd socket when NFS state is
    /// serialized and the socket is present (or unconditionally when it may
    /// not be omitted).
    fn generate_general_fd_order(
        &self,
        capabilities: TakeoverCapabilities,
    ) -> Vec<FileDescriptorType> {
        let mut order = vec![
            FileDescriptorType::LockFile,
            FileDescriptorType::ThriftSocket,
        ];
        if capabilities.contains(TakeoverCapabilities::NFS)
            && (!capabilities.contains(TakeoverCapabilities::OPTIONAL_MOUNTD)
                || self.mountd_server_socket.is_some())
        {
            order.push(FileDescriptorType::MountdSocket);
        }
        order
    }

    fn take_general_fd(&mut self, fd_type: FileDescriptorType) -> Option<OwnedFd> {
        match fd_type {
            FileDescriptorType::LockFile => self.lock_file.take(),
            FileDescriptorType::ThriftSocket => self.thrift_socket.take(),
            FileDescriptorType::MountdSocket => self.mountd_server_socket.take(),
        }
    }

    fn store_general_fd(&mut self, fd_type: FileDescriptorType, fd: OwnedFd) {
        debug!("restoring takeover fd of type {fd_type:?}");
        match fd_type {
            FileDescriptorType::LockFile => self.lock_file = Some(fd),
            FileDescriptorType::ThriftSocket => self.thrift_socket = Some(fd),
            FileDescriptorType::MountdSocket => self.mountd_server_socket = Some(fd),
        }
    }

    /// Serialize into one framed message, moving the file descriptors into
    /// it in the declared order.
    pub fn serialize(
        &mut self,
        capabilities: TakeoverCapabilities,
    ) -> Result<Message, TakeoverError> {
        let mut data = serialize_header(capabilities)?;

        let mut mounts = Vec::with_capacity(self.mount_points.len());
        for mount in &self.mount_points {
            check_can_serde_mount_type(capabilities, mount.protocol, &mount.mount_path)?;
            mounts.push(SerializedMountInfo {
                mount_path: mount.mount_path.to_string_lossy().into_owned(),
                state_directory: mount.state_directory.to_string_lossy().into_owned(),
                protocol: mount.protocol,
                connection_info: mount
                    .connection_info
                    .as_ref()
                    .map(|conn| conn.as_bytes().to_vec())
                    .unwrap_or_default(),
                inode_map: mount.inode_map.clone(),
            });
        }

        self.general_fd_order = if capabilities.contains(TakeoverCapabilities::ORDERED_FDS) {
            self.generate_general_fd_order(capabilities)
        } else {
            // Fixed legacy order; still tracked so FD collection below is
            // uniform.
            let mut order = vec![
                FileDescriptorType::LockFile,
                FileDescriptorType::ThriftSocket,
            ];
            if capabilities.contains(TakeoverCapabilities::NFS) {
                order.push(FileDescriptorType::MountdSocket);
            }
            order
        };

        let payload = SerializedTakeoverResult::Data(SerializedTakeoverInfo {
            mounts,
            file_descriptors: self.general_fd_order.clone(),
        });
        bincode::serialize_into(&mut data, &payload)?;

        let mut files = Vec::new();
        for fd_type in self.general_fd_order.clone() {
            match self.take_general_fd(fd_type) {
                Some(fd) => files.push(fd),
                None => {
                    return Err(TakeoverError::MalformedHeader(format!(
                        "missing general fd {fd_type:?} during serialization"
                    )));
                }
            }
        }
        for mount in &mut self.mount_points {
            match mount.channel_fd.take() {
                Some(fd) => files.push(fd),
                None => {
                    return Err(TakeoverError::MalformedHeader(format!(
                        "missing channel fd for mount {}",
                        mount.mount_path.display()
                    )));
                }
            }
        }

        Ok(Message { data, files })
    }

    /// Serialize an error result instead of mount data.
    pub fn serialize_error(
        capabilities: TakeoverCapabilities,
        message: &str,
    ) -> Result<Message, TakeoverError> {
        // NeverSupported (empty capabilities) is allowed here so a version
        // mismatch itself can be reported.
        let mut data = if capabilities.is_empty() {
            let mut buf = Vec::with_capacity(4 + message.len());
            buf.extend_from_slice(&VERSION_NEVER_SUPPORTED.to_be_bytes());
            buf
        } else {
            serialize_header(capabilities)?
        };
        bincode::serialize_into(
            &mut data,
            &SerializedTakeoverResult::Error(message.to_string()),
        )?;
        Ok(Message::from_data(data))
    }

    /// Deserialize a received message, restoring file descriptors by the
    /// declared order.
    pub fn deserialize(msg: Message) -> Result<TakeoverData, TakeoverError> {
        let Message { data, files } = msg;
        let mut slice = data.as_slice();
        let capabilities = read_header(&mut slice)?;

        let payload: SerializedTakeoverResult = bincode::deserialize(slice)?;
        let info = match payload {
            SerializedTakeoverResult::Error(message) => {
                return Err(TakeoverError::Remote(message));
            }
            SerializedTakeoverResult::Data(info) => info,
        };

        let mut data = TakeoverData::default();
        let general_order = if capabilities.contains(TakeoverCapabilities::ORDERED_FDS) {
            info.file_descriptors.clone()
        } else {
            let mut order = vec![
                FileDescriptorType::LockFile,
                FileDescriptorType::ThriftSocket,
            ];
            if capabilities.contains(TakeoverCapabilities::NFS) {
                order.push(FileDescriptorType::MountdSocket);
            }
            order
        };

        let expected = general_order.len() + info.mounts.len();
        if files.len() != expected {
            return Err(TakeoverError::FdCountMismatch {
                expected,
                received: files.len(),
            });
        }

        let mut files = files.into_iter();
        for fd_type in &general_order {
            let fd = files.next().expect("count verified above");
            data.store_general_fd(*fd_type, fd);
        }
        data.general_fd_order = general_order;

        for mount in info.mounts {
            let connection_info = if mount.connection_info.is_empty() {
                None
            } else {
                Some(
                    fuse_init_out::read_from_bytes(&mount.connection_info).map_err(|_| {
                        TakeoverError::MalformedHeader(
                            "connection info bytes do not form an init block".to_string(),
                        )
                    })?,
                )
            };
            data.mount_points.push(MountHandoff {
                mount_path: PathBuf::from(mount.mount_path),
                state_directory: PathBuf::from(mount.state_directory),
                protocol: mount.protocol,
                connection_info,
                inode_map: mount.inode_map,
                channel_fd: Some(files.next().expect("count verified above")),
            });
        }

        Ok(data)
    }
}

fn check_can_serde_mount_type(
    capabilities: TakeoverCapabilities,
    protocol: TakeoverMountProtocol,
    mount_path: &std::path::Path,
) -> Result<(), TakeoverError> {
    let ok = match protocol {
        TakeoverMountProtocol::Fuse => capabilities.contains(TakeoverCapabilities::FUSE),
        TakeoverMountProtocol::Nfs => capabilities.contains(TakeoverCapabilities::NFS),
    };
    if !ok {
        return Err(TakeoverError::UnsupportedMountProtocol(format!(
            "{protocol:?} for mount {}",
            mount_path.display()
        )));
    }
    Ok(())
}

/// Write the message header for the given capability set.
fn serialize_header(capabilities: TakeoverCapabilities) -> Result<Vec<u8>, TakeoverError> {
    let version = capabilities_to_version(capabilities)?;
    let mut buf = Vec::with_capacity(16);
    buf.extend_from_slice(&version.to_be_bytes());
    if capabilities.contains(TakeoverCapabilities::INCLUDE_HEADER_SIZE) {
        buf.extend_from_slice(&(size_of::<u64>() as u32).to_be_bytes());
    }
    if capabilities.contains(TakeoverCapabilities::CAPABILITY_MATCHING) {
        buf.extend_from_slice(&capabilities.bits().to_be_bytes());
    }
    Ok(buf)
}

/// Read the message header, advancing `slice` past it, and return the
/// capability set governing the rest of the message.
fn read_header(slice: &mut &[u8]) -> Result<TakeoverCapabilities, TakeoverError> {
    let version = read_u32(slice)?;
    match version {
        VERSION_NEVER_SUPPORTED
        | VERSION_THREE
        | VERSION_FOUR
        | VERSION_FIVE
        | VERSION_SIX => version_to_capabilities(version),
        VERSION_SEVEN => {
            // Version seven always carries the header size and capability
            // word; check the assumption rather than assuming quietly.
            let header_size = read_u32(slice)?;
            if header_size as usize != size_of::<u64>() {
                return Err(TakeoverError::MalformedHeader(format!(
                    "invalid takeover header size {header_size}, expected {}",
                    size_of::<u64>()
                )));
            }
            let bits = read_u64(slice)?;
            TakeoverCapabilities::from_bits(bits)
                .ok_or(TakeoverError::UnsupportedCapabilities(bits))
        }
        other => Err(TakeoverError::UnsupportedVersion(other)),
    }
}

fn read_u32(slice: &mut &[u8]) -> Result<u32, TakeoverError> {
    if slice.len() < 4 {
        return Err(TakeoverError::MalformedHeader(
            "truncated takeover header".to_string(),
        ));
    }
    let (word, rest) = slice.split_at(4);
    *slice = rest;
    Ok(u32::from_be_bytes(word.try_into().unwrap()))
}

fn read_u64(slice: &mut &[u8]) -> Result<u64, TakeoverError> {
    if slice.len() < 8 {
        return Err(TakeoverError::MalformedHeader(
            "truncated takeover header".to_string(),
        ));
    }
    let (word, rest) = slice.split_at(8);
    *slice = rest;
    Ok(u64::from_be_bytes(word.try_into().unwrap()))
}

fn sentinel(message_type: MessageType) -> Message {
    Message::from_data((message_type as u32).to_be_bytes().to_vec())
}

fn is_sentinel(data: &[u8], message_type: MessageType) -> bool {
    data.len() == 4 && u32::from_be_bytes(data.try_into().unwrap()) == message_type as u32
}

/// A zero-body liveness probe the outgoing side sends before committing.
pub fn serialize_ping() -> Message {
    sentinel(MessageType::Ping)
}

pub fn is_ping(data: &[u8]) -> bool {
    is_sentinel(data, MessageType::Ping)
}

pub fn serialize_first_chunk() -> Message {
    sentinel(MessageType::FirstChunk)
}

pub fn is_first_chunk(data: &[u8]) -> bool {
    is_sentinel(data, MessageType::FirstChunk)
}

pub fn serialize_last_chunk() -> Message {
    sentinel(MessageType::LastChunk)
}

pub fn is_last_chunk(data: &[u8]) -> bool {
    is_sentinel(data, MessageType::LastChunk)
}

/// Send a serialized takeover message, splitting the payload into chunks
/// when the negotiated capabilities allow it and the payload exceeds
/// `maximum_chunk_size`.
///
/// Chunked transfer brackets the body chunks with first-chunk and
/// last-chunk sentinels; the file descriptors ride on the last-chunk
/// sentinel so they arrive only once the receiver has the full payload.
pub fn send_takeover_message(
    socket: &mut UnixSocket,
    capabilities: TakeoverCapabilities,
    mut msg: Message,
    maximum_chunk_size: usize,
) -> Result<(), TakeoverError> {
    if !capabilities.contains(TakeoverCapabilities::CHUNKED_MESSAGE)
        || msg.data.len() <= maximum_chunk_size
    {
        socket.send(msg, None)?;
        return Ok(());
    }

    let chunk_count = msg.data.len().div_ceil(maximum_chunk_size);
    info!(
        "sending takeover data of {} bytes in {} chunks",
        msg.data.len(),
        chunk_count
    );
    socket.send(serialize_first_chunk(), None)?;
    for chunk in msg.data.chunks(maximum_chunk_size) {
        socket.send(Message::from_data(chunk.to_vec()), None)?;
    }
    let mut last = serialize_last_chunk();
    last.files = std::mem::take(&mut msg.files);
    socket.send(last, None)?;
    Ok(())
}

/// Receive one takeover message, reassembling chunked transfers.
pub fn receive_takeover_message(socket: &mut UnixSocket) -> Result<Message, TakeoverError> {
    let first = socket.recv()?;
    if !is_first_chunk(&first.data) {
        return Ok(first);
    }

    let mut assembled = Message::default();
    loop {
        let mut chunk = socket.recv()?;
        if is_last_chunk(&chunk.data) {
            assembled.files = std::mem::take(&mut chunk.files);
            return Ok(assembled);
        }
        assembled.data.extend_from_slice(&chunk.data);
        assembled.files.extend(chunk.files.drain(..));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;

    fn make_fd() -> OwnedFd {
        OwnedFd::from(tempfile::tempfile().unwrap())
    }

    fn fuse_conn_info() -> fuse_init_out {
        fuse_init_out {
            major: 7,
            minor: 31,
            max_readahead: 128 * 1024,
            flags: 0x1b,
            max_background: 12,
            congestion_threshold: 9,
            max_write: 1 << 20,
            time_gran: 1,
            max_pages: 256,
            map_alignment: 0,
            unused: [0; 8],
        }
    }

    fn sample_data(protocol: TakeoverMountProtocol) -> TakeoverData {
        TakeoverData {
            lock_file: Some(make_fd()),
            thrift_socket: Some(make_fd()),
            mountd_server_socket: Some(make_fd()),
            general_fd_order: Vec::new(),
            mount_points: vec![MountHandoff {
                mount_path: PathBuf::from("/mnt/repo"),
                state_directory: PathBuf::from("/home/user/.veilfs/clients/repo"),
                protocol,
                connection_info: match protocol {
                    TakeoverMountProtocol::Fuse => Some(fuse_conn_info()),
                    TakeoverMountProtocol::Nfs => None,
                },
                inode_map: vec![1, 2, 3, 4, 5],
                channel_fd: Some(make_fd()),
            }],
        }
    }

    #[test]
    fn version_capability_mapping_round_trips() {
        for &version in SUPPORTED_VERSIONS {
            let capabilities = version_to_capabilities(version).unwrap();
            assert_eq!(capabilities_to_version(capabilities).unwrap(), version);
        }
        assert!(version_to_capabilities(2).is_err());
    }

    #[test]
    fn compatible_version_picks_highest_shared() {
        assert_eq!(
            compute_compatible_version(&[3, 4, 5, 6, 7], SUPPORTED_VERSIONS),
            Some(7)
        );
        assert_eq!(
            compute_compatible_version(&[3, 5], SUPPORTED_VERSIONS),
            Some(5)
        );
        assert_eq!(compute_compatible_version(&[2, 99], SUPPORTED_VERSIONS), None);
    }

    #[test]
    fn capability_intersection_requires_serialization() {
        let err = compute_compatible_capabilities(
            TakeoverCapabilities::FUSE,
            supported_capabilities(),
        )
        .unwrap_err();
        assert!(matches!(err, TakeoverError::NoCommonSerialization));
    }

    #[test]
    fn optional_mountd_requires_ordered_fds() {
        let client = TakeoverCapabilities::SERDE_SERIALIZATION
            | TakeoverCapabilities::FUSE
            | TakeoverCapabilities::OPTIONAL_MOUNTD;
        let err =
            compute_compatible_capabilities(client, client).unwrap_err();
        assert!(matches!(
            err,
            TakeoverError::OptionalMountdRequiresOrderedFds
        ));

        let with_ordered = client | TakeoverCapabilities::ORDERED_FDS;
        let negotiated = compute_compatible_capabilities(with_ordered, with_ordered).unwrap();
        assert!(negotiated.contains(TakeoverCapabilities::OPTIONAL_MOUNTD));
    }

    #[test]
    fn mismatched_capabilities_lower_the_feature_set() {
        let old_peer = version_to_capabilities(VERSION_FIVE).unwrap();
        let negotiated =
            compute_compatible_capabilities(old_peer, supported_capabilities()).unwrap();
        assert_eq!(negotiated, old_peer);
    }

    #[test]
    fn header_round_trip_v7() {
        let capabilities = version_seven_capabilities();
        let header = serialize_header(capabilities).unwrap();
        assert_eq!(header.len(), 4 + 4 + 8);
        let mut slice = header.as_slice();
        assert_eq!(read_header(&mut slice).unwrap(), capabilities);
        assert!(slice.is_empty());
    }

    #[test]
    fn header_round_trip_v5() {
        let capabilities = version_to_capabilities(VERSION_FIVE).unwrap();
        let header = serialize_header(capabilities).unwrap();
        assert_eq!(header.len(), 4);
        let mut slice = header.as_slice();
        assert_eq!(read_header(&mut slice).unwrap(), capabilities);
    }

    #[test]
    fn ping_is_a_lone_message_type_word() {
        let ping = serialize_ping();
        assert_eq!(ping.data, vec![0, 0, 0, 2]);
        assert!(is_ping(&ping.data));
        assert!(!is_ping(&serialize_last_chunk().data));
    }

    #[test]
    fn takeover_round_trip_nfs_with_ordered_fds() {
        let capabilities = version_seven_capabilities();
        let mut data = sample_data(TakeoverMountProtocol::Nfs);
        let mountd_raw = data.mountd_server_socket.as_ref().unwrap().as_raw_fd();

        let msg = data.serialize(capabilities).unwrap();
        assert_eq!(
            data.general_fd_order,
            vec![
                FileDescriptorType::LockFile,
                FileDescriptorType::ThriftSocket,
                FileDescriptorType::MountdSocket
            ]
        );
        // lock, thrift, mountd, one per-mount nfsd socket
        assert_eq!(msg.files.len(), 4);
        assert_eq!(msg.files[2].as_raw_fd(), mountd_raw);

        let restored = TakeoverData::deserialize(msg).unwrap();
        assert!(restored.lock_file.is_some());
        assert!(restored.thrift_socket.is_some());
        assert!(restored.mountd_server_socket.is_some());
        assert_eq!(restored.mount_points.len(), 1);
        let mount = &restored.mount_points[0];
        assert_eq!(mount.mount_path, PathBuf::from("/mnt/repo"));
        assert_eq!(mount.protocol, TakeoverMountProtocol::Nfs);
        assert_eq!(mount.inode_map, vec![1, 2, 3, 4, 5]);
        assert!(mount.connection_info.is_none());
        assert!(mount.channel_fd.is_some());
    }

    #[test]
    fn takeover_round_trip_fuse_preserves_conn_info() {
        let capabilities = version_seven_capabilities();
        let mut data = sample_data(TakeoverMountProtocol::Fuse);
        let msg = data.serialize(capabilities).unwrap();
        let restored = TakeoverData::deserialize(msg).unwrap();
        assert_eq!(
            restored.mount_points[0].connection_info,
            Some(fuse_conn_info())
        );
    }

    #[test]
    fn omitted_mountd_socket_shrinks_fd_order() {
        let capabilities = version_seven_capabilities();
        let mut data = sample_data(TakeoverMountProtocol::Fuse);
        data.mountd_server_socket = None;
        let msg = data.serialize(capabilities).unwrap();
        assert_eq!(
            data.general_fd_order,
            vec![
                FileDescriptorType::LockFile,
                FileDescriptorType::ThriftSocket
            ]
        );
        assert_eq!(msg.files.len(), 3);
        let restored = TakeoverData::deserialize(msg).unwrap();
        assert!(restored.mountd_server_socket.is_none());
    }

    #[test]
    fn fd_count_mismatch_is_detected() {
        let capabilities = version_seven_capabilities();
        let mut data = sample_data(TakeoverMountProtocol::Fuse);
        let mut msg = data.serialize(capabilities).unwrap();
        msg.files.pop();
        assert!(matches!(
            TakeoverData::deserialize(msg),
            Err(TakeoverError::FdCountMismatch {
                expected: 4,
                received: 3
            })
        ));
    }

    #[test]
    fn nfs_mount_requires_nfs_capability() {
        let capabilities = version_to_capabilities(VERSION_FOUR).unwrap();
        let mut data = sample_data(TakeoverMountProtocol::Nfs);
        assert!(matches!(
            data.serialize(capabilities),
            Err(TakeoverError::UnsupportedMountProtocol(_))
        ));
    }

    #[test]
    fn error_payload_round_trips() {
        let msg =
            TakeoverData::serialize_error(version_seven_capabilities(), "shutdown raced").unwrap();
        match TakeoverData::deserialize(msg) {
            Err(TakeoverError::Remote(message)) => assert_eq!(message, "shutdown raced"),
            other => panic!("expected remote error, got {other:?}"),
        }
    }

    #[test]
    fn chunked_transfer_reassembles() {
        let capabilities = version_seven_capabilities();
        let (mut tx, mut rx) = UnixSocket::pair().unwrap();
        let mut data = sample_data(TakeoverMountProtocol::Fuse);
        // Fatten the inode map so the message splits into several chunks.
        data.mount_points[0].inode_map = vec![0xab; 16 * 1024];
        let msg = data.serialize(capabilities).unwrap();
        let original_len = msg.data.len();

        send_takeover_message(&mut tx, capabilities, msg, 4 * 1024).unwrap();
        let received = receive_takeover_message(&mut rx).unwrap();
        assert_eq!(received.data.len(), original_len);
        assert_eq!(received.files.len(), 4);

        let restored = TakeoverData::deserialize(received).unwrap();
        assert_eq!(restored.mount_points[0].inode_map.len(), 16 * 1024);
    }

    #[test]
    fn small_messages_skip_chunking() {
        let capabilities = version_seven_capabilities();
        let (mut tx, mut rx) = UnixSocket::pair().unwrap();
        let mut data = sample_data(TakeoverMountProtocol::Fuse);
        let msg = data.serialize(capabilities).unwrap();
        send_takeover_message(&mut tx, capabilities, msg, DEFAULT_MAXIMUM_CHUNK_SIZE).unwrap();
        let received = receive_takeover_message(&mut rx).unwrap();
        assert!(!is_first_chunk(&received.data));
        assert!(TakeoverData::deserialize(received).is_ok());
    }
}
