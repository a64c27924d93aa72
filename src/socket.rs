//! Unix-domain message socket with file-descriptor transfer.
//!
//! Frames each message as `u32 data-length || u32 fd-count || data`, with
//! any file descriptors attached to the first `sendmsg` of the message via
//! `SCM_RIGHTS`. Outbound messages go through a FIFO send queue whose
//! entries track the byte position of the last partial send, so a short
//! write resumes exactly where it stopped. The send queue is single-writer:
//! only one thread may pump it.

use std::collections::VecDeque;
use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};

use nix::sys::socket::{
    ControlMessage, ControlMessageOwned, MsgFlags, RecvMsg, recvmsg, sendmsg,
};

/// Largest data payload accepted for a single message.
pub const MAX_DATA_LENGTH: u32 = 1 << 30;
/// Largest number of files transferable with a single message.
pub const MAX_FD_COUNT: u32 = 253;

const HEADER_LEN: usize = 8;

/// One message: a byte payload plus file descriptors delivered alongside it.
#[derive(Debug, Default)]
pub struct Message {
    pub data: Vec<u8>,
    pub files: Vec<OwnedFd>,
}

impl Message {
    pub fn from_data(data: Vec<u8>) -> Message {
        Message {
            data,
            files: Vec::new(),
        }
    }
}

/// Errors from socket send/receive operations.
#[derive(Debug, thiserror::Error)]
pub enum SocketError {
    #[error("message data length {0} exceeds maximum")]
    DataTooLong(usize),
    #[error("message carries {0} files, exceeding the per-message maximum")]
    TooManyFiles(usize),
    #[error("malformed frame header: {0}")]
    MalformedHeader(String),
    #[error("peer closed the socket")]
    Closed,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Completion callback invoked when a queued message has been fully sent
/// (or failed).
pub type SendCallback = Box<dyn FnOnce(Result<(), std::io::Error>) + Send>;

/// A queued outbound message.
///
/// Owns the framed bytes and the files until the `sendmsg` that transfers
/// them, and remembers how much of the frame has already been written.
struct SendQueueEntry {
    header: [u8; HEADER_LEN],
    data: Vec<u8>,
    files: Vec<OwnedFd>,
    bytes_sent: usize,
    callback: Option<SendCallback>,
}

impl SendQueueEntry {
    fn total_len(&self) -> usize {
        HEADER_LEN + self.data.len()
    }
}

/// A connected unix-domain socket speaking the framed message protocol.
pub struct UnixSocket {
    fd: OwnedFd,
    send_queue: VecDeque<SendQueueEntry>,
}

impl UnixSocket {
    pub fn new(fd: OwnedFd) -> UnixSocket {
        UnixSocket {
            fd,
            send_queue: VecDeque::new(),
        }
    }

    /// Create a connected pair, as `socketpair(AF_UNIX, SOCK_STREAM)`.
    pub fn pair() -> Result<(UnixSocket, UnixSocket), SocketError> {
        let (a, b) = nix::sys::socket::socketpair(
            nix::sys::socket::AddressFamily::Unix,
            nix::sys::socket::SockType::Stream,
            None,
            nix::sys::socket::SockFlag::SOCK_CLOEXEC,
        )
        .map_err(|err| SocketError::Io(err.into()))?;
        Ok((UnixSocket::new(a), UnixSocket::new(b)))
    }

    pub fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    /// Take back the underlying descriptor, dropping any queued sends.
    pub fn into_fd(self) -> OwnedFd {
        self.fd
    }

    /// Number of bytes not yet written across all queued entries.
    pub fn queued_bytes(&self) -> usize {
        self.send_queue
            .iter()
            .map(|entry| entry.total_len() - entry.bytes_sent)
            .sum()
    }

    /// Queue a message for sending and pump the queue.
    ///
    /// The callback (if any) fires when the message's bytes and files have
    /// been handed to the kernel, or with the error that made the send fail.
    pub fn send(
        &mut self,
        message: Message,
        callback: Option<SendCallback>,
    ) -> Result<(), SocketError> {
        if message.data.len() > MAX_DATA_LENGTH as usize {
            return Err(SocketError::DataTooLong(message.data.len()));
        }
        if message.files.len() > MAX_FD_COUNT as usize {
            return Err(SocketError::TooManyFiles(message.files.len()));
        }

        let mut header = [0u8; HEADER_LEN];
        header[..4].copy_from_slice(&(message.data.len() as u32).to_be_bytes());
        header[4..].copy_from_slice(&(message.files.len() as u32).to_be_bytes());

        self.send_queue.push_back(SendQueueEntry {
            header,
            data: message.data,
            files: message.files,
            bytes_sent: 0,
            callback: None,
        });
        // Attach the callback after the push so a failed push cannot leak it.
        self.send_queue.back_mut().unwrap().callback = callback;

        self.try_send()
    }

    /// Write queued entries in order until the queue drains or the kernel
    /// pushes back (`EAGAIN`). Partial writes leave the entry at the front
    /// with its position advanced; the total of unsent bytes never
    /// increases.
    pub fn try_send(&mut self) -> Result<(), SocketError> {
        while let Some(entry) = self.send_queue.front_mut() {
            let header_remaining = HEADER_LEN.saturating_sub(entry.bytes_sent);
            let data_offset = entry.bytes_sent.saturating_sub(HEADER_LEN);

            let mut iov: smallvec::SmallVec<[IoSlice<'_>; 2]> = smallvec::SmallVec::new();
            if header_remaining > 0 {
                iov.push(IoSlice::new(&entry.header[entry.bytes_sent..]));
            }
            if data_offset < entry.data.len() {
                iov.push(IoSlice::new(&entry.data[data_offset..]));
            }

            // Files ride on the first sendmsg of the frame.
            let raw_fds: Vec<i32> = if entry.bytes_sent == 0 {
                entry.files.iter().map(|f| f.as_raw_fd()).collect()
            } else {
                Vec::new()
            };
            let cmsgs: &[ControlMessage<'_>] = &[ControlMessage::ScmRights(&raw_fds)];
            let cmsgs = if raw_fds.is_empty() { &[][..] } else { cmsgs };

            let sendmsg_result = sendmsg::<()>(
                self.fd.as_raw_fd(),
                &iov,
                cmsgs,
                MsgFlags::empty(),
                None,
            );
            drop(iov);

            let sent = match sendmsg_result {
                Ok(sent) => sent,
                Err(nix::errno::Errno::EAGAIN) => return Ok(()),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(err) => {
                    let io_err = std::io::Error::from(err);
                    if let Some(callback) = entry.callback.take() {
                        callback(Err(std::io::Error::from(err)));
                    }
                    self.send_queue.pop_front();
                    return Err(SocketError::Io(io_err));
                }
            };

            if entry.bytes_sent == 0 {
                // Ownership of the files transferred with the first write.
                entry.files.clear();
            }
            entry.bytes_sent += sent;

            if entry.bytes_sent >= entry.total_len() {
                if let Some(callback) = entry.callback.take() {
                    callback(Ok(()));
                }
                self.send_queue.pop_front();
            }
        }
        Ok(())
    }

    /// Receive one full message, blocking until it arrives.
    pub fn recv(&mut self) -> Result<Message, SocketError> {
        let mut header = [0u8; HEADER_LEN];
        let mut files = Vec::new();
        self.recv_exact(&mut header, &mut files)?;

        let data_len = u32::from_be_bytes(header[..4].try_into().unwrap());
        let fd_count = u32::from_be_bytes(header[4..].try_into().unwrap());
        if data_len > MAX_DATA_LENGTH {
            return Err(SocketError::MalformedHeader(format!(
                "data length {data_len} over maximum"
            )));
        }
        if fd_count > MAX_FD_COUNT {
            return Err(SocketError::MalformedHeader(format!(
                "file count {fd_count} over maximum"
            )));
        }

        let mut data = vec![0u8; data_len as usize];
        self.recv_exact(&mut data, &mut files)?;

        if files.len() != fd_count as usize {
            return Err(SocketError::MalformedHeader(format!(
                "expected {fd_count} files, received {}",
                files.len()
            )));
        }

        Ok(Message { data, files })
    }

    fn recv_exact(
        &mut self,
        buf: &mut [u8],
        files: &mut Vec<OwnedFd>,
    ) -> Result<(), SocketError> {
        let mut filled = 0;
        while filled < buf.len() {
            let mut cmsg_space = nix::cmsg_space!([std::os::fd::RawFd; MAX_FD_COUNT as usize]);
            let mut iov = [IoSliceMut::new(&mut buf[filled..])];
            let msg: RecvMsg<'_, '_, ()> = match recvmsg(
                self.fd.as_raw_fd(),
                &mut iov,
                Some(&mut cmsg_space),
                MsgFlags::MSG_CMSG_CLOEXEC,
            ) {
                Ok(msg) => msg,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(err) => return Err(SocketError::Io(err.into())),
            };

            let received = msg.bytes;
            for cmsg in msg.cmsgs().map_err(|err| SocketError::Io(err.into()))? {
                if let ControlMessageOwned::ScmRights(received_fds) = cmsg {
                    for raw in received_fds {
                        // Safety: SCM_RIGHTS gives us ownership of the
                        // freshly dup'd descriptor.
                        files.push(unsafe {
                            <OwnedFd as std::os::fd::FromRawFd>::from_raw_fd(raw)
                        });
                    }
                }
            }

            if received == 0 {
                return Err(SocketError::Closed);
            }
            filled += received;
        }
        Ok(())
    }
}

impl std::fmt::Debug for UnixSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnixSocket")
            .field("fd", &self.fd.as_raw_fd())
            .field("queued", &self.send_queue.len())
            .finish()
    }
}
