//! Bounded worker pool executing dispatched request handlers.
//!
//! Channel read-loop workers never run handlers themselves; they hand each
//! request to this pool and go straight back to reading. Handlers that
//! block on backing-store fetches therefore stall pool capacity, not the
//! kernel read path.

use std::sync::Arc;
use std::sync::mpsc;
use std::thread::JoinHandle;

use log::error;
use parking_lot::Mutex;

type Job = Box<dyn FnOnce() + Send + 'static>;

pub(crate) struct CpuPool {
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl CpuPool {
    /// Spawn `threads` workers named `<name_prefix><index>`.
    pub fn new(name_prefix: &str, threads: usize) -> std::io::Result<CpuPool> {
        assert!(threads >= 1, "pool requires at least one thread");
        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));

        let mut workers = Vec::with_capacity(threads);
        for index in 0..threads {
            let receiver = receiver.clone();
            let handle = std::thread::Builder::new()
                .name(format!("{name_prefix}{index}"))
                .spawn(move || {
                    loop {
                        // Holding the lock only while receiving keeps jobs
                        // from serializing behind a long-running handler.
                        let job = {
                            let guard = receiver.lock();
                            guard.recv()
                        };
                        match job {
                            Ok(job) => job(),
                            // Channel closed: pool is shutting down.
                            Err(_) => return,
                        }
                    }
                })?;
            workers.push(handle);
        }

        Ok(CpuPool {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
        })
    }

    /// Queue one job. Jobs run in submission order per worker, with no
    /// ordering across workers.
    pub fn execute(&self, job: impl FnOnce() + Send + 'static) {
        let sender = self.sender.lock();
        match sender.as_ref() {
            Some(sender) => {
                if sender.send(Box::new(job)).is_err() {
                    error!("request pool is shut down; dropping job");
                }
            }
            None => error!("request pool is shut down; dropping job"),
        }
    }

    /// Drop the queue and join every worker, blocking until in-flight jobs
    /// finish. Idempotent.
    pub fn shutdown(&self) {
        *self.sender.lock() = None;
        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            if let Err(panic) = handle.join() {
                error!("request pool worker panicked: {panic:?}");
            }
        }
    }
}

impl Drop for CpuPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
