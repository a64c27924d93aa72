//! The per-mount kernel channel.
//!
//! A `FuseChannel` owns one file descriptor connected to the kernel
//! filesystem driver. N worker threads block reading framed requests from
//! it; each decoded request is handed to a shared request pool, and the
//! completed handler's reply is written back with a single scatter/gather
//! write. A dedicated invalidation thread writes cache-invalidation
//! notifications while holding none of our locks (see
//! [`invalidation`]), and a timeout thread bounds every request's
//! lifetime.
//!
//! Lifecycle: `Initializing` (one worker performs the kernel handshake) →
//! `Running` (all workers reading) → `Draining` (stop requested, in-flight
//! requests finishing) → `Stopped` (a [`StopData`] describing why, and for
//! graceful handover, the still-open device).

pub(crate) mod handlers;
pub mod invalidation;
mod pool;
mod timeout;

pub use invalidation::FlushBarrier;

use std::collections::HashSet;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Once};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex};
use zerocopy::FromBytes;

use crate::CaseSensitivity;
use crate::dispatch::{Dispatcher, RequestContext};
use crate::ll::fuse_abi::{self as abi, fuse_opcode};
use crate::ll::reply::Response;
use crate::ll::{Errno, InodeNumber, RequestId};
use crate::path::PathComponent;
use crate::telemetry::{ActivityBuffer, ChannelStats, TraceEvent, TraceEventKind};

use handlers::{HandlerContext, HandlerEntry, lookup_handler_entry};
use invalidation::{InvalidationEntry, InvalidationQueue};
use pool::CpuPool;
use timeout::TimeoutTracker;

/// The minimum device read size; kernels reject smaller reads outright, and
/// the read buffer must additionally cover `max_write` plus headers.
pub const MIN_BUFFER_SIZE: usize = 0x21000;

/// Headroom on top of `max_write` for the request header and argument
/// structs.
const WRITE_HEADROOM: usize = 4096;

/// `get-xattr` names answered "no data" without consulting the dispatcher.
///
/// With security caps enabled the kernel precedes every write with a
/// `security.capability` probe, and some systems probe the POSIX ACL names
/// just as eagerly; none of them ever has data in a virtual checkout.
const XATTR_FAST_TRACKS: [&[u8]; 3] = [
    b"security.capability",
    b"system.posix_acl_access",
    b"system.posix_acl_default",
];

/// Why a channel stopped (or has not).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Running,
    InitFailed,
    /// The kernel reported the filesystem unmounted (`ENODEV`).
    Unmounted,
    /// Stopped to hand the device to a successor process.
    Takeover,
    /// Stopped by `destroy()`.
    Destruction,
    /// Cooperative shutdown requested through `request_session_exit`.
    SessionExit,
    ReadError,
    WriteError,
    /// The kernel delivered a partial request header.
    TruncatedRequest,
    /// A worker thread failed unexpectedly.
    WorkerException,
}

impl StopReason {
    /// Whether this reason leaves the kernel device usable, meaning it can
    /// be handed over instead of closed.
    pub fn device_still_usable(self) -> bool {
        matches!(
            self,
            StopReason::Running
                | StopReason::Takeover
                | StopReason::Destruction
                | StopReason::SessionExit
        )
    }
}

/// What a stopped channel yields.
#[derive(Debug)]
pub struct StopData {
    pub reason: StopReason,
    /// The kernel device, present only when `reason` leaves it usable and
    /// the connection was established; hand it to
    /// [`FuseChannel::initialize_from_takeover`] in the successor.
    pub device: Option<OwnedFd>,
    /// The negotiated connection parameters accompanying `device`.
    pub connection_info: Option<abi::fuse_init_out>,
}

/// Construction parameters for a channel.
pub struct FuseChannelOptions {
    pub mount_path: PathBuf,
    /// Number of kernel-reading worker threads (and the size of the request
    /// pool). Must be at least 1.
    pub num_threads: usize,
    /// Hard deadline for each dispatched request.
    pub request_timeout: Duration,
    /// Value negotiated into the kernel's `max_background`; clamped to
    /// `u16`.
    pub maximum_background_requests: u32,
    pub case_sensitivity: CaseSensitivity,
    /// Reject request names that are not valid UTF-8.
    pub require_utf8_paths: bool,
    /// Negotiate the writeback cache capability.
    pub use_write_back_cache: bool,
    /// Device read buffer size; clamped up to [`MIN_BUFFER_SIZE`]. The
    /// negotiated `max_write` is this minus header headroom.
    pub buffer_size: usize,
    /// Pid used by the self-request guard. Best-effort: the OS recycles
    /// pids, so a recycled pid can theoretically defeat or misfire the
    /// guard.
    pub process_id: u32,
    pub stats: Arc<ChannelStats>,
    pub trace_bus: Arc<ActivityBuffer>,
}

impl FuseChannelOptions {
    pub fn new(mount_path: PathBuf) -> FuseChannelOptions {
        FuseChannelOptions {
            mount_path,
            num_threads: 4,
            request_timeout: Duration::from_secs(60),
            maximum_background_requests: 12,
            case_sensitivity: CaseSensitivity::Sensitive,
            require_utf8_paths: true,
            use_write_back_cache: false,
            buffer_size: MIN_BUFFER_SIZE,
            process_id: std::process::id(),
            stats: Arc::new(ChannelStats::new()),
            trace_bus: Arc::new(ActivityBuffer::new(25_000)),
        }
    }
}

/// Resolves once the kernel handshake completes.
pub struct InitFuture {
    init_rx: mpsc::Receiver<std::io::Result<()>>,
    stop: Option<StopFuture>,
}

impl InitFuture {
    /// Block until initialization finishes, yielding the future that
    /// resolves at final stop.
    pub fn wait(mut self) -> std::io::Result<StopFuture> {
        match self.init_rx.recv() {
            Ok(Ok(())) => Ok(self.stop.take().expect("stop future present until wait")),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(std::io::Error::other("channel dropped during initialization")),
        }
    }
}

/// Resolves when the channel has fully stopped.
pub struct StopFuture {
    rx: mpsc::Receiver<StopData>,
}

impl StopFuture {
    /// Block until the channel stops.
    pub fn wait(self) -> std::io::Result<StopData> {
        self.rx
            .recv()
            .map_err(|_| std::io::Error::other("channel dropped before completing"))
    }

    /// Block up to `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<StopData> {
        self.rx.recv_timeout(timeout).ok()
    }
}

struct ChannelState {
    stop_reason: StopReason,
    workers: Vec<JoinHandle<()>>,
    worker_thread_ids: Vec<std::thread::ThreadId>,
    started_workers: usize,
    stopped_workers: usize,
    pending_requests: usize,
    session_completed: bool,
}

/// Bookkeeping shared between a dispatched request's completion path and
/// its timeout.
struct PendingRequest {
    unique: u64,
    opcode: u32,
    nodeid: u64,
    pid: u32,
    replied: AtomicBool,
}

enum LoopAction {
    Continue,
    Exit,
}

/// The per-mount kernel channel. See the module docs for the thread model.
pub struct FuseChannel<D: Dispatcher + 'static> {
    /// Back-reference so methods can hand owned clones to the threads and
    /// closures they spawn. Always upgradable while any such thread runs.
    self_weak: std::sync::Weak<FuseChannel<D>>,
    dispatcher: Arc<D>,
    mount_path: PathBuf,
    num_threads: usize,
    request_timeout: Duration,
    maximum_background_requests: u32,
    case_sensitivity: CaseSensitivity,
    require_utf8_paths: bool,
    use_write_back_cache: bool,
    buffer_size: usize,
    process_id: u32,
    stats: Arc<ChannelStats>,
    trace_bus: Arc<ActivityBuffer>,
    trace_detailed_arguments: AtomicBool,

    /// Raw device fd used by workers and reply writers; remains valid until
    /// `session_complete` runs, which is after all of them have finished.
    device_raw: RawFd,
    device: Mutex<Option<OwnedFd>>,

    stop: AtomicBool,
    stop_pipe_read: OwnedFd,
    /// Dropping the write end wakes every worker out of `poll`.
    stop_pipe_write: Mutex<Option<OwnedFd>>,

    /// Protects worker bookkeeping and the stop reason. Never held during
    /// I/O.
    state: Mutex<ChannelState>,
    state_cv: Condvar,

    conn: Mutex<Option<abi::fuse_init_out>>,
    invalidation_queue: Arc<InvalidationQueue>,
    invalidation_thread: Mutex<Option<JoinHandle<()>>>,
    pool: CpuPool,
    timeouts: TimeoutTracker,
    unhandled_opcodes: Mutex<HashSet<u32>>,
    unmount_log_once: Once,

    session_complete_tx: Mutex<Option<mpsc::SyncSender<StopData>>>,
    stop_future_rx: Mutex<Option<mpsc::Receiver<StopData>>>,
}

impl<D: Dispatcher + 'static> FuseChannel<D> {
    /// Wrap a connected kernel device. No threads run until
    /// [`initialize`](Self::initialize) or
    /// [`initialize_from_takeover`](Self::initialize_from_takeover).
    pub fn new(
        device: OwnedFd,
        options: FuseChannelOptions,
        dispatcher: Arc<D>,
    ) -> std::io::Result<Arc<FuseChannel<D>>> {
        assert!(options.num_threads >= 1, "worker count must be at least 1");

        // Workers multiplex the device against the shutdown pipe, so the
        // device must not block a racing reader forever.
        nix::fcntl::fcntl(
            device.as_fd(),
            nix::fcntl::FcntlArg::F_SETFL(nix::fcntl::OFlag::O_NONBLOCK),
        )?;
        let (pipe_read, pipe_write) = nix::unistd::pipe()?;

        let thread_label = options
            .mount_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "mount".to_string());
        let pool = CpuPool::new(&format!("fusework-{thread_label}-"), options.num_threads)?;
        let timeouts = TimeoutTracker::new(format!("fusetimer-{thread_label}"))?;

        let (session_tx, session_rx) = mpsc::sync_channel(1);

        Ok(Arc::new_cyclic(|self_weak| FuseChannel {
            self_weak: self_weak.clone(),
            dispatcher,
            mount_path: options.mount_path,
            num_threads: options.num_threads,
            request_timeout: options.request_timeout,
            maximum_background_requests: options.maximum_background_requests,
            case_sensitivity: options.case_sensitivity,
            require_utf8_paths: options.require_utf8_paths,
            use_write_back_cache: options.use_write_back_cache,
            buffer_size: options.buffer_size.max(MIN_BUFFER_SIZE),
            process_id: options.process_id,
            stats: options.stats,
            trace_bus: options.trace_bus,
            trace_detailed_arguments: AtomicBool::new(false),
            device_raw: device.as_raw_fd(),
            device: Mutex::new(Some(device)),
            stop: AtomicBool::new(false),
            stop_pipe_read: pipe_read,
            stop_pipe_write: Mutex::new(Some(pipe_write)),
            state: Mutex::new(ChannelState {
                stop_reason: StopReason::Running,
                workers: Vec::new(),
                worker_thread_ids: Vec::new(),
                started_workers: 0,
                stopped_workers: 0,
                pending_requests: 0,
                session_completed: false,
            }),
            state_cv: Condvar::new(),
            conn: Mutex::new(None),
            invalidation_queue: Arc::new(InvalidationQueue::new()),
            invalidation_thread: Mutex::new(None),
            pool,
            timeouts,
            unhandled_opcodes: Mutex::new(HashSet::new()),
            unmount_log_once: Once::new(),
            session_complete_tx: Mutex::new(Some(session_tx)),
            stop_future_rx: Mutex::new(Some(session_rx)),
        }))
    }

    fn arc(&self) -> Arc<Self> {
        self.self_weak
            .upgrade()
            .expect("channel outlives its worker threads")
    }

    pub fn mount_path(&self) -> &std::path::Path {
        &self.mount_path
    }

    /// The negotiated connection parameters, once initialization is done.
    pub fn connection_info(&self) -> Option<abi::fuse_init_out> {
        *self.conn.lock()
    }

    /// Enable rendering request arguments into trace events.
    pub fn set_detailed_tracing(&self, enabled: bool) {
        self.trace_detailed_arguments
            .store(enabled, Ordering::Release);
    }

    /// Start one worker that performs the kernel handshake; once that
    /// completes the remaining workers and the invalidation thread start
    /// and the returned future resolves.
    pub fn initialize(&self) -> InitFuture {
        let (init_tx, init_rx) = mpsc::sync_channel(1);
        let stop_future = StopFuture {
            rx: self
                .stop_future_rx
                .lock()
                .take()
                .expect("channel initialized twice"),
        };

        let spawned = self.spawn_worker(move |channel| {
            let result = channel.read_init_packet();
            match result {
                Ok(()) => {
                    channel.start_worker_threads();
                    let _ = init_tx.send(Ok(()));
                    channel.process_session();
                }
                Err(err) => {
                    channel.request_session_exit(StopReason::InitFailed);
                    let _ = init_tx.send(Err(err));
                }
            }
        });
        if let Err(err) = spawned {
            self.request_session_exit(StopReason::InitFailed);
            let (tx, rx) = mpsc::sync_channel(1);
            let _ = tx.send(Err(err));
            return InitFuture {
                init_rx: rx,
                stop: Some(stop_future),
            };
        }

        InitFuture {
            init_rx,
            stop: Some(stop_future),
        }
    }

    /// Adopt a pre-negotiated connection from a takeover: no handshake is
    /// performed and all workers start immediately.
    pub fn initialize_from_takeover(
        &self,
        connection_info: abi::fuse_init_out,
    ) -> StopFuture {
        info!(
            "takeover for {}: max_write={}, max_readahead={}, flags={:#x}",
            self.mount_path.display(),
            connection_info.max_write,
            connection_info.max_readahead,
            connection_info.flags
        );
        *self.conn.lock() = Some(connection_info);
        self.dispatcher.initialize(&connection_info);

        let stop_future = StopFuture {
            rx: self
                .stop_future_rx
                .lock()
                .take()
                .expect("channel initialized twice"),
        };
        self.start_worker_threads();
        stop_future
    }

    /// Queue a data/attribute invalidation for `ino`.
    pub fn invalidate_inode(&self, ino: InodeNumber, offset: i64, len: i64) {
        self.invalidation_queue
            .enqueue(InvalidationEntry::Inode { ino, offset, len });
    }

    /// Queue a directory-entry invalidation for `name` under `parent`.
    pub fn invalidate_entry(&self, parent: InodeNumber, name: PathComponent) {
        self.invalidation_queue
            .enqueue(InvalidationEntry::Entry { parent, name });
    }

    /// Barrier resolving when every previously queued invalidation has been
    /// written to the kernel.
    pub fn flush_invalidations(&self) -> FlushBarrier {
        self.invalidation_queue.enqueue_flush()
    }

    /// Cooperatively stop the channel. Workers finish in-flight requests
    /// but issue no new reads; invalidations continue to drain until the
    /// last request completes.
    pub fn request_session_exit(&self, reason: StopReason) {
        let mut state = self.state.lock();
        self.request_session_exit_locked(&mut state, reason);
    }

    fn request_session_exit_locked(&self, state: &mut ChannelState, reason: StopReason) {
        if state.stop_reason != StopReason::Running {
            // Already stopping. Replace the recorded reason only when the
            // earlier reason left the device usable for handover but the
            // new one does not; a fatal reason must never be masked by a
            // benign one, and never downgrades back.
            if state.stop_reason.device_still_usable() && !reason.device_still_usable() {
                state.stop_reason = reason;
            }
            return;
        }

        debug!(
            "stop requested for {}: {reason:?}",
            self.mount_path.display()
        );
        state.stop_reason = reason;
        self.stop.store(true, Ordering::Relaxed);
        // Closing the pipe's write end makes the read end permanently
        // readable, waking every worker out of poll.
        *self.stop_pipe_write.lock() = None;
    }

    /// Block until all in-flight requests complete and every thread the
    /// channel owns has been joined.
    ///
    /// Calling this from one of the channel's own worker threads is a
    /// programming error and panics: a worker cannot join itself.
    pub fn destroy(&self) {
        {
            let state = self.state.lock();
            assert!(
                !state
                    .worker_thread_ids
                    .contains(&std::thread::current().id()),
                "cannot destroy a channel from inside one of its own worker threads"
            );
        }
        self.request_session_exit(StopReason::Destruction);

        let workers = {
            let mut state = self.state.lock();
            std::mem::take(&mut state.workers)
        };
        for worker in workers {
            let _ = worker.join();
        }

        // Wait for outstanding requests; the last completion performs
        // session_complete.
        {
            let mut state = self.state.lock();
            while state.pending_requests > 0 {
                self.state_cv.wait(&mut state);
            }
            if !state.session_completed && state.started_workers == 0 {
                // Never initialized; complete the session ourselves so the
                // stop future resolves.
                self.session_complete(state);
            }
        }

        self.pool.shutdown();
        self.timeouts.shutdown();
        self.stop_invalidation_thread();
    }

    // -----------------------------------------------------------------
    // Thread management

    fn spawn_worker(
        &self,
        body: impl FnOnce(&Self) + Send + 'static,
    ) -> std::io::Result<()> {
        let thread_label = self
            .mount_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "mount".to_string());
        let channel = self.arc();
        let mut state = self.state.lock();
        if state.stop_reason != StopReason::Running {
            // A destroy may already be joining the worker list; spawning
            // into it now would leave an unjoined thread behind.
            return Err(std::io::Error::other("channel is stopping"));
        }
        let handle = std::thread::Builder::new()
            .name(format!("fuse-{thread_label}"))
            .spawn(move || {
                {
                    let mut state = channel.state.lock();
                    state.worker_thread_ids.push(std::thread::current().id());
                }
                body(&channel);
                channel.note_worker_stopped();
            })?;
        state.started_workers += 1;
        state.workers.push(handle);
        Ok(())
    }

    /// Bring the worker pool up to strength and start the invalidation
    /// thread. Called after the handshake (or takeover adoption). If a stop
    /// was requested while initializing, does nothing: the destructor may
    /// already be joining threads.
    fn start_worker_threads(&self) {
        {
            let state = self.state.lock();
            if state.stop_reason != StopReason::Running {
                return;
            }
        }

        let mut spawn_error = None;
        while {
            let state = self.state.lock();
            state.started_workers < self.num_threads && state.stop_reason == StopReason::Running
        } {
            if let Err(err) = self.spawn_worker(|channel| channel.process_session()) {
                spawn_error = Some(err);
                break;
            }
        }
        if let Some(err) = spawn_error {
            // A stop racing in makes spawn_worker refuse; that is not a
            // failure to report.
            if self.state.lock().stop_reason == StopReason::Running {
                error!("error starting channel worker threads: {err}");
                self.request_session_exit(StopReason::InitFailed);
            }
            return;
        }

        let mut invalidation_thread = self.invalidation_thread.lock();
        if invalidation_thread.is_none() {
            let queue = self.invalidation_queue.clone();
            let device_raw = self.device_raw;
            let thread_label = self
                .mount_path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| "mount".to_string());
            match std::thread::Builder::new()
                .name(format!("inval-{thread_label}"))
                .spawn(move || queue.run_sender(device_raw))
            {
                Ok(handle) => *invalidation_thread = Some(handle),
                Err(err) => {
                    error!("error starting invalidation thread: {err}");
                    drop(invalidation_thread);
                    self.request_session_exit(StopReason::InitFailed);
                }
            }
        }
    }

    fn note_worker_stopped(&self) {
        let mut state = self.state.lock();
        state.stopped_workers += 1;
        // If this was the last worker and no requests are outstanding, the
        // session is complete. Otherwise the final completing request will
        // get there.
        if state.stopped_workers == state.started_workers && state.pending_requests == 0 {
            self.session_complete(state);
        } else {
            drop(state);
        }
        self.state_cv.notify_all();
    }

    fn finish_request(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.pending_requests > 0, "pending request underflow");
        state.pending_requests -= 1;
        if state.pending_requests == 0
            && state.started_workers > 0
            && state.stopped_workers == state.started_workers
        {
            self.session_complete(state);
        } else {
            drop(state);
        }
        self.state_cv.notify_all();
    }

    /// Final stage of shutdown: runs exactly once, after the last worker
    /// has stopped and the last request completed.
    fn session_complete(&self, mut state: parking_lot::MutexGuard<'_, ChannelState>) {
        if state.session_completed {
            return;
        }
        state.session_completed = true;
        let reason = if state.stop_reason == StopReason::Running {
            // Workers only exit once a stop reason is recorded, so this is
            // unreachable outside destroy-before-initialize.
            StopReason::Destruction
        } else {
            state.stop_reason
        };
        drop(state);

        // Stop the invalidation thread only now, not at stop-request time:
        // invalidations generated by the requests that just drained still
        // have to reach the kernel.
        self.stop_invalidation_thread();

        let connection_info = *self.conn.lock();
        let device = if reason.device_still_usable() && connection_info.is_some() {
            self.device.lock().take()
        } else {
            // Dropping closes it.
            self.device.lock().take();
            None
        };

        let data = StopData {
            reason,
            device,
            connection_info,
        };
        if let Some(tx) = self.session_complete_tx.lock().take() {
            let _ = tx.send(data);
        }
        self.state_cv.notify_all();
    }

    fn stop_invalidation_thread(&self) {
        self.invalidation_queue.stop();
        if let Some(handle) = self.invalidation_thread.lock().take() {
            let _ = handle.join();
        }
    }

    // -----------------------------------------------------------------
    // Device I/O

    fn device_fd(&self) -> BorrowedFd<'_> {
        // Safety: device_raw stays open until session_complete, which runs
        // only after every thread that can reach this call has finished
        // with it.
        unsafe { BorrowedFd::borrow_raw(self.device_raw) }
    }

    /// Wait until the device is readable or a stop is requested.
    fn poll_device(&self) -> LoopAction {
        use nix::poll::{PollFd, PollFlags, PollTimeout, poll};

        let device = self.device_fd();
        let mut fds = [
            PollFd::new(device.as_fd(), PollFlags::POLLIN),
            PollFd::new(self.stop_pipe_read.as_fd(), PollFlags::POLLIN),
        ];
        match poll(&mut fds, PollTimeout::NONE) {
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => return LoopAction::Continue,
            Err(err) => {
                warn!("error polling kernel device: {err}");
                self.request_session_exit(StopReason::ReadError);
                return LoopAction::Exit;
            }
        }
        if self.stop.load(Ordering::Relaxed) {
            return LoopAction::Exit;
        }
        if fds[1].revents().is_some_and(|ev| !ev.is_empty()) {
            return LoopAction::Exit;
        }
        LoopAction::Continue
    }

    /// Write a framed reply. Returns false on a write failure that should
    /// stop the channel.
    fn write_response(&self, unique: RequestId, response: &Response) -> bool {
        let result = response.with_iovec(unique, |iov| {
            let expected: usize = iov.iter().map(|slice| slice.len()).sum();
            match nix::sys::uio::writev(self.device_fd(), iov) {
                Ok(written) if written == expected => Ok(()),
                Ok(written) => Err(std::io::Error::other(format!(
                    "short write to kernel device: {written} of {expected} bytes"
                ))),
                Err(err) => Err(std::io::Error::from(err)),
            }
        });
        match result {
            Ok(()) => true,
            Err(err)
                if matches!(err.raw_os_error(), Some(libc::ENOENT) | Some(libc::ENODEV)) =>
            {
                // The kernel tore the connection down underneath us; the
                // read side will observe the unmount shortly.
                info!("kernel closed the device while replying: {err}");
                true
            }
            Err(err) => {
                error!("failed to write reply to kernel device: {err}");
                self.request_session_exit(StopReason::WriteError);
                false
            }
        }
    }

    fn reply_error(&self, unique: u64, errno: Errno) -> bool {
        self.write_response(RequestId(unique), &Response::new_error(errno))
    }

    // -----------------------------------------------------------------
    // Initialization handshake

    fn read_init_packet(&self) -> std::io::Result<()> {
        // Kernels insist on a large read buffer even for the INIT request.
        let mut buffer = vec![0u8; size_of::<abi::fuse_in_header>() + abi::FUSE_MIN_READ_BUFFER];
        let buf = aligned_sub_buf(&mut buffer, align_of::<abi::fuse_in_header>());

        let size = loop {
            if self.stop.load(Ordering::Relaxed) {
                return Err(std::io::Error::other(format!(
                    "channel for {:?} stopped while waiting for the init request",
                    self.mount_path
                )));
            }
            if matches!(self.poll_device(), LoopAction::Exit) {
                return Err(std::io::Error::other(format!(
                    "channel for {:?} stopped while waiting for the init request",
                    self.mount_path
                )));
            }
            match nix::unistd::read(self.device_fd(), buf) {
                Ok(0) => {
                    return Err(std::io::Error::from_raw_os_error(libc::ENODEV));
                }
                Ok(size) => break size,
                Err(nix::errno::Errno::EINTR)
                | Err(nix::errno::Errno::EAGAIN)
                | Err(nix::errno::Errno::ENOENT) => continue,
                Err(err) => return Err(err.into()),
            }
        };

        let header_len = size_of::<abi::fuse_in_header>();
        let init_len = size_of::<abi::fuse_init_in>();
        if size < header_len + init_len {
            return Err(std::io::Error::other(format!(
                "partial init packet on mount {:?}: size={size}",
                self.mount_path
            )));
        }
        let header = abi::fuse_in_header::read_from_bytes(&buf[..header_len])
            .expect("header size checked");
        let init = abi::fuse_init_in::read_from_bytes(&buf[header_len..header_len + init_len])
            .expect("init size checked");

        if header.opcode != fuse_opcode::FUSE_INIT as u32 {
            self.reply_error(header.unique, Errno::EPROTO);
            return Err(std::io::Error::other(format!(
                "expected init request on mount {:?} but got opcode {}",
                self.mount_path, header.opcode
            )));
        }

        if init.major != abi::FUSE_KERNEL_VERSION {
            self.reply_error(header.unique, Errno::EPROTO);
            return Err(std::io::Error::other(format!(
                "unsupported kernel protocol version {}.{} on mount {:?}",
                init.major, init.minor, self.mount_path
            )));
        }

        let capable = abi::InitFlags::from_bits_retain(init.flags);
        let mut want = abi::InitFlags::ASYNC_READ | abi::InitFlags::BIG_WRITES;
        // Setuid and setgid bits are not supported anyway.
        want |= abi::InitFlags::HANDLE_KILLPRIV;
        // Let the kernel cache ACL xattrs even though setting them always
        // fails.
        want |= abi::InitFlags::POSIX_ACL;
        want |= abi::InitFlags::CACHE_SYMLINKS;
        want |= abi::InitFlags::PARALLEL_DIROPS;
        // Handles are stateless, so zero-message open and opendir apply.
        want |= abi::InitFlags::NO_OPEN_SUPPORT;
        want |= abi::InitFlags::NO_OPENDIR_SUPPORT;
        if self.use_write_back_cache {
            want |= abi::InitFlags::WRITEBACK_CACHE;
        }
        if self.case_sensitivity == CaseSensitivity::Insensitive {
            want |= abi::InitFlags::CASE_INSENSITIVE;
        }
        // Only what the kernel is capable of.
        want &= capable;

        let connection_info = abi::fuse_init_out {
            major: abi::FUSE_KERNEL_VERSION,
            minor: abi::FUSE_KERNEL_MINOR_VERSION,
            max_readahead: init.max_readahead,
            flags: want.bits(),
            // The documented scope of max_background is readahead and
            // direct I/O, but in practice it also caps concurrent
            // foreground requests on Linux; leaving it at the kernel
            // default quietly limits parallelism to 16.
            max_background: self.maximum_background_requests.min(u16::MAX as u32) as u16,
            // Kernel defaults congestion to 3/4 of max_background.
            congestion_threshold: 0,
            max_write: (self.buffer_size - WRITE_HEADROOM) as u32,
            time_gran: 1,
            max_pages: 0,
            map_alignment: 0,
            unused: [0; 8],
        };

        info!(
            "speaking fuse protocol kernel={}.{} local={}.{} on mount {:?}, max_write={}, max_readahead={}, capable={:#x}, want={:#x}",
            init.major,
            init.minor,
            abi::FUSE_KERNEL_VERSION,
            abi::FUSE_KERNEL_MINOR_VERSION,
            self.mount_path,
            connection_info.max_write,
            connection_info.max_readahead,
            capable.bits(),
            want.bits(),
        );

        // Reply before telling the dispatcher, so the kernel unblocks
        // filesystem access without waiting on dispatcher callbacks.
        let response = if init.minor > 22 {
            Response::from_struct(&connection_info)
        } else {
            // Protocol minors predating the init-out expansion only accept
            // the legacy prefix.
            Response::from_struct_prefix(&connection_info, abi::FUSE_COMPAT_22_INIT_OUT_SIZE)
        };
        if !self.write_response(RequestId(header.unique), &response) {
            return Err(std::io::Error::other("failed to write init reply"));
        }

        // Record the kernel's minor version for compat checks during
        // request parsing.
        let mut negotiated = connection_info;
        negotiated.minor = init.minor.min(abi::FUSE_KERNEL_MINOR_VERSION);
        *self.conn.lock() = Some(negotiated);
        self.dispatcher.initialize(&negotiated);
        Ok(())
    }

    // -----------------------------------------------------------------
    // Request loop

    fn process_session(&self) {
        let mut buffer = vec![0u8; self.buffer_size];
        let buf = aligned_sub_buf(&mut buffer, align_of::<abi::fuse_in_header>());

        while !self.stop.load(Ordering::Relaxed) {
            if matches!(self.poll_device(), LoopAction::Exit) {
                break;
            }

            let size = match nix::unistd::read(self.device_fd(), buf) {
                Ok(size) => size,
                Err(nix::errno::Errno::EINTR)
                | Err(nix::errno::Errno::EAGAIN)
                | Err(nix::errno::Errno::ENOENT) => {
                    // All variations of being interrupted (another worker
                    // may have raced us to the request); try again.
                    continue;
                }
                Err(nix::errno::Errno::ENODEV) => {
                    self.unmount_log_once.call_once(|| {
                        debug!("received unmount event on mount {:?}", self.mount_path);
                    });
                    self.request_session_exit(StopReason::Unmounted);
                    break;
                }
                Err(err) => {
                    warn!("error reading from kernel device: {err}");
                    self.request_session_exit(StopReason::ReadError);
                    break;
                }
            };

            if size < size_of::<abi::fuse_in_header>() {
                if size == 0 {
                    // EOF happens with fake devices in tests; a real kernel
                    // reports ENODEV on unmount instead.
                    self.request_session_exit(StopReason::Unmounted);
                } else {
                    error!("read truncated request from kernel device: len={size}");
                    self.request_session_exit(StopReason::TruncatedRequest);
                }
                break;
            }

            if matches!(self.handle_request(&buf[..size]), LoopAction::Exit) {
                break;
            }
        }
    }

    fn handle_request(&self, packet: &[u8]) -> LoopAction {
        let header_len = size_of::<abi::fuse_in_header>();
        let header =
            abi::fuse_in_header::read_from_bytes(&packet[..header_len]).expect("length checked");
        let arg = &packet[header_len..];

        debug!(
            "request opcode={} {} unique={} nodeid={} pid={}",
            header.opcode,
            handlers::opcode_name(header.opcode),
            header.unique,
            header.nodeid,
            header.pid
        );
        self.stats.record(header.opcode);

        // Short-circuit xattr probes the kernel issues constantly and that
        // never have data here, before any other work.
        if header.opcode == fuse_opcode::FUSE_GETXATTR as u32 {
            let name_bytes = &arg[size_of::<abi::fuse_getxattr_in>().min(arg.len())..];
            if let Some(end) = memchr::memchr(0, name_bytes) {
                let name = &name_bytes[..end];
                if XATTR_FAST_TRACKS.contains(&name) {
                    self.reply_error(header.unique, Errno::ENODATA);
                    return LoopAction::Continue;
                }
            }
        }

        // Requests from our own process would deadlock against kernel inode
        // locks that the requesting thread already holds; refuse them
        // outright. (Pid comparison is best-effort; pids recycle.)
        if header.pid == self.process_id {
            self.reply_error(header.unique, Errno::EIO);
            error!(
                "received kernel request from our own process: opcode={} nodeid={} pid={}",
                header.opcode, header.nodeid, header.pid
            );
            return LoopAction::Continue;
        }

        match fuse_opcode::try_from(header.opcode) {
            Ok(fuse_opcode::FUSE_INIT) => {
                // A second init after initialization is a protocol breach.
                self.reply_error(header.unique, Errno::EPROTO);
                error!("received a second init request after initialization");
                self.request_session_exit(StopReason::WorkerException);
                return LoopAction::Exit;
            }
            Ok(fuse_opcode::FUSE_GETLK) | Ok(fuse_opcode::FUSE_SETLK)
            | Ok(fuse_opcode::FUSE_SETLKW) => {
                // Deliberately unimplemented so the kernel handles locking
                // locally.
                self.reply_error(header.unique, Errno::ENOSYS);
                return LoopAction::Continue;
            }
            Ok(fuse_opcode::FUSE_LSEEK) => {
                // Handles are stateless, so lseek is meaningless here;
                // ENOSYS makes the kernel implement it and stop asking.
                self.reply_error(header.unique, Errno::ENOSYS);
                return LoopAction::Continue;
            }
            Ok(fuse_opcode::FUSE_POLL) => {
                self.reply_error(header.unique, Errno::ENOSYS);
                return LoopAction::Continue;
            }
            Ok(fuse_opcode::FUSE_INTERRUPT) => {
                // Interrupting reliably is not possible: request ids can be
                // recycled faster than an interrupt can be matched. Ignore;
                // no reply is expected.
                return LoopAction::Continue;
            }
            Ok(fuse_opcode::FUSE_DESTROY) => {
                debug!("destroy request");
                self.dispatcher.destroy();
                // Linux does not care whether destroy gets a reply, but
                // other kernels block the unmount syscall until one
                // arrives, which would stall graceful unmount.
                self.write_response(RequestId(header.unique), &Response::new_empty());
                return LoopAction::Continue;
            }
            Ok(fuse_opcode::FUSE_NOTIFY_REPLY) => {
                // Nothing outstanding ever expects one of these.
                return LoopAction::Continue;
            }
            Ok(fuse_opcode::FUSE_IOCTL) => {
                // ENOTTY, not the default ENOSYS: the requested ioctl is
                // unsupported, not the opcode.
                self.reply_error(header.unique, Errno::ENOTTY);
                return LoopAction::Continue;
            }
            Ok(fuse_opcode::FUSE_FORGET) | Ok(fuse_opcode::FUSE_BATCH_FORGET) => {
                // No reply, no timeout; run inline.
                if let Some(entry) = lookup_handler_entry(header.opcode) {
                    if let Some(handler) = entry.handler {
                        let ctx = RequestContext::from_header(&header);
                        let hctx = self.handler_context();
                        let _ = handler(self.dispatcher.as_ref(), &ctx, &header, arg, &hctx);
                    }
                }
                return LoopAction::Continue;
            }
            _ => {}
        }

        if let Some(entry) = lookup_handler_entry(header.opcode) {
            if let Some(handler) = entry.handler {
                self.dispatch_request(entry, handler, header, arg.to_vec());
                return LoopAction::Continue;
            }
        }

        // Unknown (or known-but-unserved) opcode: log the first sighting of
        // each, then tell the kernel it is not implemented.
        {
            let mut unhandled = self.unhandled_opcodes.lock();
            if unhandled.insert(header.opcode) {
                warn!("unhandled kernel opcode {}", header.opcode);
            }
        }
        if !self.reply_error(header.unique, Errno::ENOSYS) {
            return LoopAction::Exit;
        }
        LoopAction::Continue
    }

    fn handler_context(&self) -> HandlerContext {
        HandlerContext {
            require_utf8_paths: self.require_utf8_paths,
            minor_version: self
                .conn
                .lock()
                .map(|conn| conn.minor)
                .unwrap_or(abi::FUSE_KERNEL_MINOR_VERSION),
        }
    }

    fn publish_trace(&self, request: &PendingRequest, kind: TraceEventKind, result: Option<i32>) {
        self.trace_bus.publish(TraceEvent {
            kind,
            unique: request.unique,
            opcode: request.opcode,
            nodeid: request.nodeid,
            pid: request.pid,
            arguments: None,
            result,
        });
    }

    /// Hand one decoded request to the pool, with a registered deadline.
    /// Exactly one of the completion path and the timeout path sends the
    /// reply; the loser's result is discarded.
    fn dispatch_request(
        &self,
        entry: &'static HandlerEntry,
        handler: handlers::Handler,
        header: abi::fuse_in_header,
        arg: Vec<u8>,
    ) {
        let request = Arc::new(PendingRequest {
            unique: header.unique,
            opcode: header.opcode,
            nodeid: header.nodeid,
            pid: header.pid,
            replied: AtomicBool::new(false),
        });

        if self.trace_detailed_arguments.load(Ordering::Acquire) {
            if let Some(renderer) = entry.arg_renderer {
                debug!(
                    "{}({}, {})",
                    entry.short_name(),
                    header.nodeid,
                    renderer(&arg)
                );
                self.trace_bus.publish(TraceEvent {
                    kind: TraceEventKind::Start,
                    unique: header.unique,
                    opcode: header.opcode,
                    nodeid: header.nodeid,
                    pid: header.pid,
                    arguments: Some(renderer(&arg)),
                    result: None,
                });
            }
        } else {
            self.publish_trace(&request, TraceEventKind::Start, None);
        }

        self.state.lock().pending_requests += 1;

        let timeout_channel = self.arc();
        let timeout_request = request.clone();
        let timeout_handle = self.timeouts.register(
            Instant::now() + self.request_timeout,
            move || {
                if timeout_request
                    .replied
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    warn!(
                        "request timed out: opcode={} unique={}",
                        timeout_request.opcode, timeout_request.unique
                    );
                    timeout_channel.write_response(
                        RequestId(timeout_request.unique),
                        &Response::new_error(Errno::ETIMEDOUT),
                    );
                    timeout_channel.publish_trace(
                        &timeout_request,
                        TraceEventKind::Finish,
                        Some(Errno::ETIMEDOUT.raw()),
                    );
                    timeout_channel.finish_request();
                }
            },
        );

        let channel = self.arc();
        self.pool.execute(move || {
            let ctx = RequestContext::from_header(&header);
            let hctx = channel.handler_context();
            let result = handler(channel.dispatcher.as_ref(), &ctx, &header, &arg, &hctx);

            channel.timeouts.cancel(timeout_handle);
            if request
                .replied
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                // Timed out; the work completed anyway but its result is
                // discarded.
                debug!(
                    "discarding result of timed-out request: opcode={} unique={}",
                    request.opcode, request.unique
                );
                return;
            }

            let (response, errno) = match result {
                Ok(Some(response)) => (response, 0),
                // No-reply operations never reach the pool.
                Ok(None) => (Response::new_empty(), 0),
                Err(errno) => (Response::new_error(errno), errno.raw()),
            };
            channel.write_response(RequestId(request.unique), &response);
            channel.publish_trace(&request, TraceEventKind::Finish, Some(errno));
            channel.finish_request();
        });
    }
}

/// Display name of an opcode, for logs and telemetry sinks.
pub fn opcode_name(opcode: u32) -> &'static str {
    handlers::opcode_name(opcode)
}

/// Read/write/other classification of an opcode for process-level access
/// accounting.
pub fn opcode_access_type(opcode: u32) -> crate::telemetry::AccessType {
    handlers::opcode_access_type(opcode)
}

/// Sampling group the telemetry sink should apply to an opcode.
pub fn opcode_sampling_group(opcode: u32) -> crate::telemetry::SamplingGroup {
    handlers::opcode_sampling_group(opcode)
}

/// Slide a buffer forward so it is aligned for `alignment`.
fn aligned_sub_buf(buf: &mut [u8], alignment: usize) -> &mut [u8] {
    let off = alignment - (buf.as_ptr() as usize) % alignment;
    if off == alignment { buf } else { &mut buf[off..] }
}

#[cfg(test)]
mod tests;
