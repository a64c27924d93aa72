//! Channel tests against a fake kernel device (a seqpacket socketpair, so
//! message boundaries behave like the real device).

use super::*;
use crate::dispatch::{CreateReply, DispatchResult, OpenReply};
use crate::ll::FileHandle;
use crate::ll::reply::{DirEntryType, DirList};
use nix::sys::socket::{AddressFamily, SockFlag, SockType, socketpair};
use std::sync::atomic::AtomicU32;
use zerocopy::IntoBytes;

struct FakeDevice {
    fd: OwnedFd,
}

impl FakeDevice {
    fn pair() -> (OwnedFd, FakeDevice) {
        let (channel_end, test_end) = socketpair(
            AddressFamily::Unix,
            SockType::SeqPacket,
            None,
            SockFlag::empty(),
        )
        .unwrap();
        (channel_end, FakeDevice { fd: test_end })
    }

    fn send_request(&self, opcode: u32, unique: u64, nodeid: u64, pid: u32, body: &[u8]) {
        let header = abi::fuse_in_header {
            len: (size_of::<abi::fuse_in_header>() + body.len()) as u32,
            opcode,
            unique,
            nodeid,
            uid: 1000,
            gid: 1000,
            pid,
            padding: 0,
        };
        let mut packet = header.as_bytes().to_vec();
        packet.extend_from_slice(body);
        nix::unistd::write(self.fd.as_fd(), &packet).unwrap();
    }

    fn recv_raw(&self, timeout_ms: u16) -> Option<Vec<u8>> {
        use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
        let mut fds = [PollFd::new(self.fd.as_fd(), PollFlags::POLLIN)];
        let ready = poll(&mut fds, PollTimeout::from(timeout_ms)).unwrap();
        if ready == 0 {
            return None;
        }
        let mut buf = vec![0u8; 128 * 1024];
        let size = nix::unistd::read(self.fd.as_fd(), &mut buf).unwrap();
        buf.truncate(size);
        Some(buf)
    }

    /// Read one reply, panicking if none arrives in time.
    fn recv_reply(&self) -> (abi::fuse_out_header, Vec<u8>) {
        let packet = self.recv_raw(5000).expect("timed out waiting for a reply");
        let header_len = size_of::<abi::fuse_out_header>();
        let header = abi::fuse_out_header::read_from_bytes(&packet[..header_len]).unwrap();
        assert_eq!(header.len as usize, packet.len());
        (header, packet[header_len..].to_vec())
    }

    fn perform_init(&self) -> abi::fuse_init_out {
        let init = abi::fuse_init_in {
            major: abi::FUSE_KERNEL_VERSION,
            minor: abi::FUSE_KERNEL_MINOR_VERSION,
            max_readahead: 128 * 1024,
            flags: 0xffff_ffff,
        };
        self.send_request(
            fuse_opcode::FUSE_INIT as u32,
            1,
            abi::FUSE_ROOT_ID,
            0,
            init.as_bytes(),
        );
        let (header, body) = self.recv_reply();
        assert_eq!(header.error, 0);
        assert_eq!(header.unique, 1);
        abi::fuse_init_out::read_from_bytes(&body).unwrap()
    }
}

#[derive(Default)]
struct TestDispatcher {
    forgets: Mutex<Vec<(u64, u64)>>,
    renames: Mutex<Vec<(u64, String, u64, String)>>,
    fallocates: AtomicU32,
    read_delay: Option<Duration>,
}

impl Dispatcher for TestDispatcher {
    fn lookup(
        &self,
        _ctx: &RequestContext,
        parent: InodeNumber,
        name: &PathComponent,
    ) -> DispatchResult<abi::fuse_entry_out> {
        if parent == InodeNumber::ROOT && name.as_bytes() == b"hello" {
            Ok(abi::fuse_entry_out {
                nodeid: 2,
                generation: 1,
                attr: abi::fuse_attr {
                    ino: 2,
                    size: 13,
                    mode: libc::S_IFREG | 0o644,
                    nlink: 1,
                    ..Default::default()
                },
                ..Default::default()
            })
        } else {
            Err(Errno::ENOENT)
        }
    }

    fn forget(&self, ino: InodeNumber, nlookup: u64) {
        self.forgets.lock().push((ino.get(), nlookup));
    }

    fn read(
        &self,
        _ctx: &RequestContext,
        _ino: InodeNumber,
        _fh: FileHandle,
        _offset: u64,
        _size: u32,
    ) -> DispatchResult<Vec<u8>> {
        if let Some(delay) = self.read_delay {
            std::thread::sleep(delay);
        }
        Ok(b"hello, world\n".to_vec())
    }

    fn rename(
        &self,
        _ctx: &RequestContext,
        parent: InodeNumber,
        name: &PathComponent,
        new_parent: InodeNumber,
        new_name: &PathComponent,
    ) -> DispatchResult<()> {
        self.renames.lock().push((
            parent.get(),
            name.to_string(),
            new_parent.get(),
            new_name.to_string(),
        ));
        Ok(())
    }

    fn readdir(
        &self,
        _ctx: &RequestContext,
        _ino: InodeNumber,
        _fh: FileHandle,
        offset: u64,
        mut list: DirList,
    ) -> DispatchResult<DirList> {
        if offset == 0 {
            list.push(InodeNumber(2), 1, DirEntryType::RegularFile, b"hello");
            list.push(InodeNumber(3), 2, DirEntryType::Directory, b"src");
        }
        Ok(list)
    }

    fn create(
        &self,
        _ctx: &RequestContext,
        _parent: InodeNumber,
        _name: &PathComponent,
        _mode: u32,
        _flags: u32,
    ) -> DispatchResult<CreateReply> {
        Ok(CreateReply {
            entry: abi::fuse_entry_out {
                nodeid: 9,
                ..Default::default()
            },
            open: OpenReply {
                fh: FileHandle(41),
                flags: abi::FopenFlags::empty(),
            },
        })
    }

    fn fallocate(
        &self,
        _ctx: &RequestContext,
        _ino: InodeNumber,
        _fh: FileHandle,
        _offset: u64,
        _length: u64,
    ) -> DispatchResult<()> {
        self.fallocates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct TestHarness {
    channel: Arc<FuseChannel<TestDispatcher>>,
    device: FakeDevice,
    stop: Option<StopFuture>,
    dispatcher: Arc<TestDispatcher>,
}

impl TestHarness {
    fn start(dispatcher: TestDispatcher) -> TestHarness {
        Self::start_with(dispatcher, |_| {})
    }

    fn start_with(
        dispatcher: TestDispatcher,
        configure: impl FnOnce(&mut FuseChannelOptions),
    ) -> TestHarness {
        let _ = env_logger::builder().is_test(true).try_init();
        let (channel_end, device) = FakeDevice::pair();
        let dispatcher = Arc::new(dispatcher);
        let mut options = FuseChannelOptions::new(PathBuf::from("/mnt/test"));
        options.num_threads = 2;
        // The fake device cannot recycle our own pid, so pick one no test
        // request uses unless it means to.
        options.process_id = 999_999;
        configure(&mut options);
        let channel = FuseChannel::new(channel_end, options, dispatcher.clone()).unwrap();

        let init = channel.initialize();
        device.perform_init();
        let stop = init.wait().unwrap();

        TestHarness {
            channel,
            device,
            stop: Some(stop),
            dispatcher,
        }
    }

    /// Close the fake device, collect the stop data, and tear down.
    fn finish(mut self) -> StopData {
        drop(self.device);
        let data = self
            .stop
            .take()
            .unwrap()
            .wait()
            .expect("channel never stopped");
        self.channel.destroy();
        data
    }
}

#[test]
fn handshake_negotiates_connection_parameters() {
    let (channel_end, device) = FakeDevice::pair();
    let dispatcher = Arc::new(TestDispatcher::default());
    let mut options = FuseChannelOptions::new(PathBuf::from("/mnt/test"));
    options.num_threads = 2;
    options.maximum_background_requests = 100_000; // clamps to u16
    let channel = FuseChannel::new(channel_end, options, dispatcher).unwrap();

    let init = channel.initialize();
    let reply = device.perform_init();
    let stop = init.wait().unwrap();

    assert_eq!(reply.major, abi::FUSE_KERNEL_VERSION);
    assert_eq!(reply.minor, abi::FUSE_KERNEL_MINOR_VERSION);
    assert_eq!(reply.max_write as usize, MIN_BUFFER_SIZE - 4096);
    assert_eq!(reply.max_background, u16::MAX);
    // The want mask is a subset of what the kernel offered.
    assert_ne!(reply.flags, 0);
    assert!(channel.connection_info().is_some());

    drop(device);
    let data = stop.wait().unwrap();
    assert_eq!(data.reason, StopReason::Unmounted);
    assert!(data.device.is_none());
    channel.destroy();
}

#[test]
fn rejects_unsupported_kernel_major_version() {
    let (channel_end, device) = FakeDevice::pair();
    let dispatcher = Arc::new(TestDispatcher::default());
    let mut options = FuseChannelOptions::new(PathBuf::from("/mnt/test"));
    options.num_threads = 1;
    let channel = FuseChannel::new(channel_end, options, dispatcher).unwrap();

    let init = channel.initialize();
    let bad_init = abi::fuse_init_in {
        major: 6,
        minor: 0,
        max_readahead: 0,
        flags: 0,
    };
    device.send_request(
        fuse_opcode::FUSE_INIT as u32,
        1,
        abi::FUSE_ROOT_ID,
        0,
        bad_init.as_bytes(),
    );
    let (header, _) = device.recv_reply();
    assert_eq!(header.error, -libc::EPROTO);
    assert!(init.wait().is_err());
    channel.destroy();
}

#[test]
fn lookup_dispatches_and_replies() {
    let harness = TestHarness::start(TestDispatcher::default());
    harness.device.send_request(
        fuse_opcode::FUSE_LOOKUP as u32,
        7,
        abi::FUSE_ROOT_ID,
        1234,
        b"hello\0",
    );
    let (header, body) = harness.device.recv_reply();
    assert_eq!(header.unique, 7);
    assert_eq!(header.error, 0);
    let entry = abi::fuse_entry_out::read_from_bytes(&body).unwrap();
    assert_eq!(entry.nodeid, 2);
    assert_eq!(entry.attr.size, 13);
    harness.finish();
}

#[test]
fn per_request_errors_become_error_replies() {
    let harness = TestHarness::start(TestDispatcher::default());
    harness.device.send_request(
        fuse_opcode::FUSE_LOOKUP as u32,
        8,
        abi::FUSE_ROOT_ID,
        1234,
        b"missing\0",
    );
    let (header, body) = harness.device.recv_reply();
    assert_eq!(header.error, -libc::ENOENT);
    assert!(body.is_empty());
    // The channel keeps serving.
    harness.device.send_request(
        fuse_opcode::FUSE_LOOKUP as u32,
        9,
        abi::FUSE_ROOT_ID,
        1234,
        b"hello\0",
    );
    let (header, _) = harness.device.recv_reply();
    assert_eq!(header.error, 0);
    harness.finish();
}

#[test]
fn self_call_guard_replies_eio() {
    let harness = TestHarness::start(TestDispatcher::default());
    // The reporting pid equals the channel's own process id.
    harness.device.send_request(
        fuse_opcode::FUSE_LOOKUP as u32,
        10,
        abi::FUSE_ROOT_ID,
        999_999,
        b"hello\0",
    );
    let (header, _) = harness.device.recv_reply();
    assert_eq!(header.unique, 10);
    assert_eq!(header.error, -libc::EIO);
    harness.finish();
}

#[test]
fn xattr_fast_path_answers_without_dispatch() {
    let harness = TestHarness::start(TestDispatcher::default());
    for (unique, name) in [
        (11u64, &b"security.capability"[..]),
        (12, b"system.posix_acl_access"),
        (13, b"system.posix_acl_default"),
    ] {
        let mut body = abi::fuse_getxattr_in {
            size: 0,
            padding: 0,
        }
        .as_bytes()
        .to_vec();
        body.extend_from_slice(name);
        body.push(0);
        harness
            .device
            .send_request(fuse_opcode::FUSE_GETXATTR as u32, unique, 2, 1234, &body);
        let (header, _) = harness.device.recv_reply();
        assert_eq!(header.unique, unique);
        assert_eq!(header.error, -libc::ENODATA);
    }
    harness.finish();
}

#[test]
fn lock_opcodes_are_left_to_the_kernel() {
    let harness = TestHarness::start(TestDispatcher::default());
    let lk = abi::fuse_lk_in {
        fh: 1,
        owner: 2,
        lk: abi::fuse_file_lock {
            start: 0,
            end: 10,
            typ: libc::F_RDLCK,
            pid: 1234,
        },
        lk_flags: 0,
        padding: 0,
    };
    for (unique, opcode) in [
        (20u64, fuse_opcode::FUSE_GETLK),
        (21, fuse_opcode::FUSE_SETLK),
        (22, fuse_opcode::FUSE_SETLKW),
    ] {
        harness
            .device
            .send_request(opcode as u32, unique, 2, 1234, lk.as_bytes());
        let (header, _) = harness.device.recv_reply();
        assert_eq!(header.error, -libc::ENOSYS);
    }
    harness.finish();
}

#[test]
fn unknown_opcodes_reply_enosys_and_log_once() {
    let harness = TestHarness::start(TestDispatcher::default());
    for unique in [30u64, 31] {
        harness.device.send_request(63, unique, 2, 1234, &[]);
        let (header, _) = harness.device.recv_reply();
        assert_eq!(header.error, -libc::ENOSYS);
    }
    // Logged exactly once regardless of how often it shows up.
    assert_eq!(harness.channel.unhandled_opcodes.lock().len(), 1);
    harness.finish();
}

#[test]
fn forget_produces_no_reply() {
    let harness = TestHarness::start(TestDispatcher::default());
    let forget = abi::fuse_forget_in { nlookup: 3 };
    harness
        .device
        .send_request(fuse_opcode::FUSE_FORGET as u32, 40, 2, 1234, forget.as_bytes());

    let batch = abi::fuse_batch_forget_in { count: 2, dummy: 0 };
    let mut body = batch.as_bytes().to_vec();
    body.extend_from_slice(abi::fuse_forget_one { nodeid: 5, nlookup: 1 }.as_bytes());
    body.extend_from_slice(abi::fuse_forget_one { nodeid: 6, nlookup: 2 }.as_bytes());
    harness
        .device
        .send_request(fuse_opcode::FUSE_BATCH_FORGET as u32, 41, 0, 1234, &body);

    // A lookup afterwards gets the next reply; the forgets got none.
    harness.device.send_request(
        fuse_opcode::FUSE_LOOKUP as u32,
        42,
        abi::FUSE_ROOT_ID,
        1234,
        b"hello\0",
    );
    let (header, _) = harness.device.recv_reply();
    assert_eq!(header.unique, 42);

    let forgets = harness.dispatcher.forgets.lock().clone();
    assert_eq!(forgets, vec![(2, 3), (5, 1), (6, 2)]);
    harness.finish();
}

#[test]
fn rename_falls_back_to_alternate_layout() {
    let harness = TestHarness::start(TestDispatcher::default());

    // Standard layout.
    let mut body = abi::fuse_rename_in { newdir: 3 }.as_bytes().to_vec();
    body.extend_from_slice(b"old\0new\0");
    harness
        .device
        .send_request(fuse_opcode::FUSE_RENAME as u32, 50, 1, 1234, &body);
    let (header, _) = harness.device.recv_reply();
    assert_eq!(header.error, 0);

    // Widened layout: an extra zeroed word makes the names decode empty
    // under the standard layout.
    let mut body = abi::fuse_rename_alt_in {
        newdir: 4,
        undocumented: 0,
    }
    .as_bytes()
    .to_vec();
    body.extend_from_slice(b"alt_old\0alt_new\0");
    harness
        .device
        .send_request(fuse_opcode::FUSE_RENAME as u32, 51, 1, 1234, &body);
    let (header, _) = harness.device.recv_reply();
    assert_eq!(header.error, 0);

    let renames = harness.dispatcher.renames.lock().clone();
    assert_eq!(
        renames,
        vec![
            (1, "old".to_string(), 3, "new".to_string()),
            (1, "alt_old".to_string(), 4, "alt_new".to_string()),
        ]
    );
    harness.finish();
}

#[test]
fn create_reply_concatenates_entry_and_open() {
    let harness = TestHarness::start(TestDispatcher::default());
    let mut body = abi::fuse_create_in {
        flags: libc::O_RDWR as u32,
        mode: 0o644,
        umask: 0,
        open_flags: 0,
    }
    .as_bytes()
    .to_vec();
    body.extend_from_slice(b"newfile\0");
    harness
        .device
        .send_request(fuse_opcode::FUSE_CREATE as u32, 60, 1, 1234, &body);
    let (header, body) = harness.device.recv_reply();
    assert_eq!(header.error, 0);
    assert_eq!(
        body.len(),
        size_of::<abi::fuse_entry_out>() + size_of::<abi::fuse_open_out>()
    );
    let entry =
        abi::fuse_entry_out::read_from_bytes(&body[..size_of::<abi::fuse_entry_out>()]).unwrap();
    assert_eq!(entry.nodeid, 9);
    let open =
        abi::fuse_open_out::read_from_bytes(&body[size_of::<abi::fuse_entry_out>()..]).unwrap();
    assert_eq!(open.fh, 41);
    harness.finish();
}

#[test]
fn readdir_serves_preserialized_listing() {
    let harness = TestHarness::start(TestDispatcher::default());
    let read = abi::fuse_read_in {
        fh: 0,
        offset: 0,
        size: 4096,
        read_flags: 0,
        lock_owner: 0,
        flags: 0,
        padding: 0,
    };
    harness
        .device
        .send_request(fuse_opcode::FUSE_READDIR as u32, 61, 1, 1234, read.as_bytes());
    let (header, body) = harness.device.recv_reply();
    assert_eq!(header.error, 0);

    let first = abi::fuse_dirent::read_from_bytes(&body[..size_of::<abi::fuse_dirent>()]).unwrap();
    assert_eq!(first.ino, 2);
    assert_eq!(first.namelen, 5);
    assert_eq!(
        &body[size_of::<abi::fuse_dirent>()..size_of::<abi::fuse_dirent>() + 5],
        b"hello"
    );
    harness.finish();
}

#[test]
fn fallocate_rejects_nonzero_mode_bits() {
    let harness = TestHarness::start(TestDispatcher::default());
    let mut fallocate = abi::fuse_fallocate_in {
        fh: 1,
        offset: 0,
        length: 4096,
        mode: libc::FALLOC_FL_KEEP_SIZE as u32,
        padding: 0,
    };
    harness.device.send_request(
        fuse_opcode::FUSE_FALLOCATE as u32,
        70,
        2,
        1234,
        fallocate.as_bytes(),
    );
    let (header, _) = harness.device.recv_reply();
    assert_eq!(header.error, -libc::ENOSYS);
    assert_eq!(harness.dispatcher.fallocates.load(Ordering::SeqCst), 0);

    fallocate.mode = 0;
    harness.device.send_request(
        fuse_opcode::FUSE_FALLOCATE as u32,
        71,
        2,
        1234,
        fallocate.as_bytes(),
    );
    let (header, _) = harness.device.recv_reply();
    assert_eq!(header.error, 0);
    assert_eq!(harness.dispatcher.fallocates.load(Ordering::SeqCst), 1);
    harness.finish();
}

#[test]
fn timed_out_requests_get_a_timeout_reply_and_late_results_are_discarded() {
    let harness = TestHarness::start_with(
        TestDispatcher {
            read_delay: Some(Duration::from_millis(400)),
            ..Default::default()
        },
        |options| {
            options.request_timeout = Duration::from_millis(50);
        },
    );
    let read = abi::fuse_read_in {
        fh: 1,
        offset: 0,
        size: 16,
        read_flags: 0,
        lock_owner: 0,
        flags: 0,
        padding: 0,
    };
    harness
        .device
        .send_request(fuse_opcode::FUSE_READ as u32, 80, 2, 1234, read.as_bytes());
    let (header, _) = harness.device.recv_reply();
    assert_eq!(header.unique, 80);
    assert_eq!(header.error, -libc::ETIMEDOUT);

    // The handler finishes long after the timeout; its reply must never
    // materialize.
    assert!(harness.device.recv_raw(600).is_none());
    harness.finish();
}

#[test]
fn invalidations_flow_through_the_channel() {
    let harness = TestHarness::start(TestDispatcher::default());
    harness.channel.invalidate_inode(InodeNumber(7), 0, 0);
    harness
        .channel
        .invalidate_entry(InodeNumber(1), "cached-name".into());
    let barrier = harness.channel.flush_invalidations();

    let first = harness.device.recv_raw(5000).unwrap();
    let header = abi::fuse_out_header::read_from_bytes(
        &first[..size_of::<abi::fuse_out_header>()],
    )
    .unwrap();
    assert_eq!(header.unique, 0);
    assert_eq!(header.error, abi::FUSE_NOTIFY_INVAL_INODE);

    let second = harness.device.recv_raw(5000).unwrap();
    let header = abi::fuse_out_header::read_from_bytes(
        &second[..size_of::<abi::fuse_out_header>()],
    )
    .unwrap();
    assert_eq!(header.error, abi::FUSE_NOTIFY_INVAL_ENTRY);
    assert!(second.ends_with(b"cached-name\x00"));

    assert!(barrier.wait_for(Duration::from_secs(5)));
    harness.finish();
}

#[test]
fn session_exit_yields_device_for_takeover() {
    let harness = TestHarness::start(TestDispatcher::default());
    harness.channel.request_session_exit(StopReason::Takeover);
    let data = harness.stop.as_ref().unwrap().wait_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(data.reason, StopReason::Takeover);
    assert!(data.device.is_some());
    let conn = data.connection_info.unwrap();
    assert_eq!(conn.major, abi::FUSE_KERNEL_VERSION);
    harness.channel.destroy();
}

#[test]
fn takeover_channel_skips_handshake() {
    let (channel_end, device) = FakeDevice::pair();
    let dispatcher = Arc::new(TestDispatcher::default());
    let mut options = FuseChannelOptions::new(PathBuf::from("/mnt/test"));
    options.num_threads = 2;
    let channel = FuseChannel::new(channel_end, options, dispatcher).unwrap();

    let conn = abi::fuse_init_out {
        major: abi::FUSE_KERNEL_VERSION,
        minor: abi::FUSE_KERNEL_MINOR_VERSION,
        max_write: 1 << 20,
        ..Default::default()
    };
    let stop = channel.initialize_from_takeover(conn);

    // No handshake: a request is served immediately.
    device.send_request(
        fuse_opcode::FUSE_LOOKUP as u32,
        90,
        abi::FUSE_ROOT_ID,
        1234,
        b"hello\0",
    );
    let (header, _) = device.recv_reply();
    assert_eq!(header.unique, 90);
    assert_eq!(header.error, 0);

    drop(device);
    let data = stop.wait().unwrap();
    assert_eq!(data.reason, StopReason::Unmounted);
    channel.destroy();
}

/// Build a channel that never starts workers, so stop-reason transitions
/// can be observed without racing session completion.
fn idle_channel() -> (Arc<FuseChannel<TestDispatcher>>, FakeDevice) {
    let (channel_end, device) = FakeDevice::pair();
    let mut options = FuseChannelOptions::new(PathBuf::from("/mnt/test"));
    options.num_threads = 1;
    let channel =
        FuseChannel::new(channel_end, options, Arc::new(TestDispatcher::default())).unwrap();
    (channel, device)
}

#[test]
fn stop_reason_never_downgrades_from_fatal() {
    let (channel, _device) = idle_channel();

    // A benign reason first...
    channel.request_session_exit(StopReason::Takeover);
    // ...is replaced by one that invalidates the device...
    channel.request_session_exit(StopReason::Unmounted);
    assert_eq!(channel.state.lock().stop_reason, StopReason::Unmounted);
    // ...and never restored by a later benign reason.
    channel.request_session_exit(StopReason::Takeover);
    assert_eq!(channel.state.lock().stop_reason, StopReason::Unmounted);
    channel.destroy();
}

#[test]
fn benign_reasons_do_not_replace_each_other() {
    let (channel, _device) = idle_channel();
    channel.request_session_exit(StopReason::Takeover);
    channel.request_session_exit(StopReason::SessionExit);
    assert_eq!(channel.state.lock().stop_reason, StopReason::Takeover);
    channel.destroy();
}

#[test]
fn fatal_reasons_keep_the_first_recorded_cause() {
    let (channel, _device) = idle_channel();
    channel.request_session_exit(StopReason::ReadError);
    channel.request_session_exit(StopReason::WriteError);
    assert_eq!(channel.state.lock().stop_reason, StopReason::ReadError);
    channel.destroy();
}
