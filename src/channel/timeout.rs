//! Per-request deadline enforcement.
//!
//! Every dispatched request registers a deadline with an expiry action.
//! A dedicated thread waits for the earliest deadline; when one elapses the
//! action runs on that thread (it substitutes a timeout error reply for the
//! pending request). Completion cancels the registration; whichever side
//! runs first wins and the other becomes a no-op, so exactly one reply is
//! ever produced. The underlying handler may keep running after a timeout;
//! its result is discarded.

use std::collections::BTreeMap;
use std::thread::JoinHandle;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

type ExpiryAction = Box<dyn FnOnce() + Send + 'static>;

/// Identifies one registration; used to cancel it on completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TimeoutHandle {
    deadline: Instant,
    token: u64,
}

#[derive(Default)]
struct TrackerState {
    pending: BTreeMap<(Instant, u64), ExpiryAction>,
    next_token: u64,
    stop: bool,
}

struct TrackerShared {
    state: Mutex<TrackerState>,
    condvar: Condvar,
}

pub(crate) struct TimeoutTracker {
    shared: std::sync::Arc<TrackerShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl TimeoutTracker {
    pub fn new(thread_name: String) -> std::io::Result<TimeoutTracker> {
        let shared = std::sync::Arc::new(TrackerShared {
            state: Mutex::new(TrackerState::default()),
            condvar: Condvar::new(),
        });
        let thread_shared = shared.clone();
        let thread = std::thread::Builder::new()
            .name(thread_name)
            .spawn(move || expiry_thread(&thread_shared))?;
        Ok(TimeoutTracker {
            shared,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Register `action` to run at `deadline` unless cancelled first.
    pub fn register(
        &self,
        deadline: Instant,
        action: impl FnOnce() + Send + 'static,
    ) -> TimeoutHandle {
        let mut state = self.shared.state.lock();
        let token = state.next_token;
        state.next_token += 1;
        let is_earliest = state
            .pending
            .first_key_value()
            .is_none_or(|((first, _), _)| deadline < *first);
        state.pending.insert((deadline, token), Box::new(action));
        drop(state);
        if is_earliest {
            self.shared.condvar.notify_one();
        }
        TimeoutHandle { deadline, token }
    }

    /// Cancel a registration. Returns false if the action already ran (or
    /// is about to run on the expiry thread).
    pub fn cancel(&self, handle: TimeoutHandle) -> bool {
        self.shared
            .state
            .lock()
            .pending
            .remove(&(handle.deadline, handle.token))
            .is_some()
    }

    /// Stop the expiry thread without running outstanding actions.
    /// Idempotent.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock();
            state.stop = true;
            state.pending.clear();
        }
        self.shared.condvar.notify_one();
        if let Some(thread) = self.thread.lock().take() {
            let _ = thread.join();
        }
    }
}

impl Drop for TimeoutTracker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn expiry_thread(shared: &TrackerShared) {
    let mut state = shared.state.lock();
    loop {
        if state.stop {
            return;
        }
        let now = Instant::now();
        match state.pending.first_key_value() {
            None => {
                shared.condvar.wait(&mut state);
            }
            Some(((deadline, _), _)) if *deadline > now => {
                let deadline = *deadline;
                let _ = shared.condvar.wait_until(&mut state, deadline);
            }
            Some(_) => {
                let ((_, _), action) = state.pending.pop_first().expect("checked non-empty");
                // Never hold the lock across the action: it sends a reply.
                drop(state);
                action();
                state = shared.state.lock();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn expired_action_runs_once() {
        let tracker = TimeoutTracker::new("test-timeout".to_string()).unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        let handle = tracker.register(Instant::now() + Duration::from_millis(10), move || {
            fired2.fetch_add(1, Ordering::SeqCst);
        });
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        // Too late to cancel.
        assert!(!tracker.cancel(handle));
    }

    #[test]
    fn cancelled_action_never_runs() {
        let tracker = TimeoutTracker::new("test-timeout".to_string()).unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        let handle = tracker.register(Instant::now() + Duration::from_millis(50), move || {
            fired2.fetch_add(1, Ordering::SeqCst);
        });
        assert!(tracker.cancel(handle));
        std::thread::sleep(Duration::from_millis(120));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn earlier_registration_preempts_later_wait() {
        let tracker = TimeoutTracker::new("test-timeout".to_string()).unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        let order_late = order.clone();
        tracker.register(Instant::now() + Duration::from_millis(80), move || {
            order_late.lock().push("late");
        });
        let order_early = order.clone();
        tracker.register(Instant::now() + Duration::from_millis(10), move || {
            order_early.lock().push("early");
        });

        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(*order.lock(), vec!["early", "late"]);
    }
}
