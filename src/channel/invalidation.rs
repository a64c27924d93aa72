//! Kernel cache-invalidation queue and its dedicated sender thread.
//!
//! Invalidation notifications block inside the kernel until it can take the
//! target inode's lock. Another process may already hold that lock while it
//! waits on one of our own requests, which in turn may wait on a lock held
//! by the thread wanting to invalidate. Sending from a thread that holds no
//! locks of ours breaks the cycle; that is this thread's entire reason to
//! exist, and nothing here may ever acquire a lock other than the queue's
//! own.
//!
//! For example: a process calling `unlink(parent, "foo")` makes the kernel
//! take parent's inode lock and send us the unlink request, which needs the
//! mount's rename lock. A checkout operation holding the rename lock
//! generates invalidations for parent. If the checkout waited on those
//! invalidations from its own thread, nothing would ever move again.

use std::io::IoSlice;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error};
use parking_lot::{Condvar, Mutex};
use zerocopy::IntoBytes;

use crate::ll::fuse_abi as abi;
use crate::ll::{Errno, InodeNumber};
use crate::path::PathComponent;

/// Resolves once every invalidation queued before it has been written to
/// the kernel.
#[derive(Debug, Clone)]
pub struct FlushBarrier {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl FlushBarrier {
    pub(crate) fn new() -> FlushBarrier {
        FlushBarrier {
            inner: Arc::new((Mutex::new(false), Condvar::new())),
        }
    }

    pub(crate) fn complete(&self) {
        let (lock, condvar) = &*self.inner;
        *lock.lock() = true;
        condvar.notify_all();
    }

    /// Block until the barrier resolves.
    pub fn wait(&self) {
        let (lock, condvar) = &*self.inner;
        let mut done = lock.lock();
        while !*done {
            condvar.wait(&mut done);
        }
    }

    /// Block until the barrier resolves or `timeout` passes. Returns true
    /// if it resolved.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let (lock, condvar) = &*self.inner;
        let mut done = lock.lock();
        if !*done {
            let _ = condvar.wait_for(&mut done, timeout);
        }
        *done
    }

    pub fn is_complete(&self) -> bool {
        *self.inner.0.lock()
    }
}

/// One queued invalidation.
#[derive(Debug)]
pub(crate) enum InvalidationEntry {
    /// Drop cached data for an inode; `len == 0` means "to end of file",
    /// with `offset == 0` dropping attributes as well.
    Inode {
        ino: InodeNumber,
        offset: i64,
        len: i64,
    },
    /// Drop a cached directory entry.
    Entry {
        parent: InodeNumber,
        name: PathComponent,
    },
    /// Resolve the barrier once all prior entries are written.
    Flush(FlushBarrier),
}

#[derive(Default)]
struct QueueState {
    queue: Vec<InvalidationEntry>,
    stop: bool,
}

/// The mutex-protected FIFO shared between producers and the sender thread.
pub(crate) struct InvalidationQueue {
    state: Mutex<QueueState>,
    condvar: Condvar,
}

impl InvalidationQueue {
    pub fn new() -> InvalidationQueue {
        InvalidationQueue {
            state: Mutex::new(QueueState::default()),
            condvar: Condvar::new(),
        }
    }

    pub fn enqueue(&self, entry: InvalidationEntry) {
        self.state.lock().queue.push(entry);
        self.condvar.notify_one();
    }

    /// Queue a flush barrier. Returns a pre-resolved barrier if the queue
    /// has already stopped: an unmount can race a checkout, and by then the
    /// kernel cache is gone with the mount anyway.
    pub fn enqueue_flush(&self) -> FlushBarrier {
        let barrier = FlushBarrier::new();
        {
            let mut state = self.state.lock();
            if state.stop {
                drop(state);
                barrier.complete();
                return barrier;
            }
            state.queue.push(InvalidationEntry::Flush(barrier.clone()));
        }
        self.condvar.notify_one();
        barrier
    }

    /// Tell the sender thread to exit after draining what is queued.
    pub fn stop(&self) {
        self.state.lock().stop = true;
        self.condvar.notify_one();
    }

    /// The sender thread body. `device_fd` stays valid for the thread's
    /// whole life: the channel joins this thread before releasing the
    /// device.
    pub fn run_sender(&self, device_fd: RawFd) {
        loop {
            let mut entries = Vec::new();
            {
                let mut state = self.state.lock();
                while state.queue.is_empty() {
                    if state.stop {
                        return;
                    }
                    self.condvar.wait(&mut state);
                }
                // Swap the whole batch out and release the lock before any
                // I/O happens.
                std::mem::swap(&mut state.queue, &mut entries);
            }

            for entry in entries {
                send_invalidation(device_fd, entry);
            }
        }
    }
}

/// Write one queue entry to the kernel. Runs only on the sender thread.
fn send_invalidation(device_fd: RawFd, entry: InvalidationEntry) {
    match entry {
        InvalidationEntry::Inode { ino, offset, len } => {
            debug!("sending inode invalidation: ino={ino}, off={offset}, len={len}");
            let notify = abi::fuse_notify_inval_inode_out {
                ino: ino.get(),
                off: offset,
                len,
            };
            let out = abi::fuse_out_header {
                len: (size_of::<abi::fuse_out_header>() + size_of_val(&notify)) as u32,
                error: abi::FUSE_NOTIFY_INVAL_INODE,
                unique: 0,
            };
            let iov = [IoSlice::new(out.as_bytes()), IoSlice::new(notify.as_bytes())];
            if let Err(errno) = write_notification(device_fd, &iov) {
                report_send_error("inode", &format!("ino={ino}"), errno);
            }
        }
        InvalidationEntry::Entry { parent, name } => {
            debug!("sending entry invalidation: parent={parent}, name={name}");
            let notify = abi::fuse_notify_inval_entry_out {
                parent: parent.get(),
                namelen: name.as_bytes().len() as u32,
                padding: 0,
            };
            let out = abi::fuse_out_header {
                len: (size_of::<abi::fuse_out_header>()
                    + size_of_val(&notify)
                    + name.as_bytes().len()
                    + 1) as u32,
                error: abi::FUSE_NOTIFY_INVAL_ENTRY,
                unique: 0,
            };
            // The kernel's length accounting assumes a NUL after the name
            // even though namelen is explicit; send one in its own iov slot
            // rather than copying the name around.
            let iov = [
                IoSlice::new(out.as_bytes()),
                IoSlice::new(notify.as_bytes()),
                IoSlice::new(name.as_bytes()),
                IoSlice::new(b"\x00"),
            ];
            if let Err(errno) = write_notification(device_fd, &iov) {
                report_send_error("entry", &format!("parent={parent}, name={name}"), errno);
            }
        }
        InvalidationEntry::Flush(barrier) => {
            // Everything queued before this barrier in the same swap has
            // been written; resolve it.
            barrier.complete();
        }
    }
}

fn write_notification(device_fd: RawFd, iov: &[IoSlice<'_>]) -> Result<(), Errno> {
    // Safety: the channel keeps the device open until this thread exits.
    let fd = unsafe { std::os::fd::BorrowedFd::borrow_raw(device_fd) };
    nix::sys::uio::writev(fd, iov).map_err(Errno::from)?;
    Ok(())
}

fn report_send_error(kind: &str, detail: &str, errno: Errno) {
    // ENOENT only means the kernel never cached the entity: common for
    // inode numbers we allocated but never returned to the kernel.
    if errno == Errno::ENOENT {
        debug!("received ENOENT sending {kind} invalidation ({detail})");
    } else {
        error!("error sending {kind} invalidation ({detail}): {errno}");
    }
}
