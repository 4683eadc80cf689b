//! Dedicated offload executors for work that must not run on the async
//! runtime's worker threads.
//!
//! Two instances back the engine: an io pool for io-bound and
//! memory-intensive handlers, and a compute pool that isolates cpu-heavy
//! handlers on their own OS threads. Handler futures are driven to
//! completion on the pool thread with a local executor.
//!
//! Limitation, by contract: once a job has been handed to a pool thread it
//! cannot be preempted. Cancellation and timeout make the engine stop
//! waiting on the result; the native work runs to completion and its result
//! is discarded.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;

use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::SchedulerError;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed pool of named OS threads draining a job channel.
pub struct BlockingPool {
    label: String,
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
    terminated: AtomicBool,
}

impl BlockingPool {
    /// Spawn `size` threads named `{label}-{i}`.
    pub fn new(label: impl Into<String>, size: usize) -> Self {
        let label = label.into();
        let (tx, rx) = mpsc::channel::<Job>();
        let rx = Arc::new(Mutex::new(rx));

        let mut handles = Vec::with_capacity(size.max(1));
        for i in 0..size.max(1) {
            let rx = Arc::clone(&rx);
            let name = format!("{label}-{i}");
            let handle = thread::Builder::new()
                .name(name.clone())
                .spawn(move || {
                    loop {
                        let job = {
                            let guard = rx.lock().expect("pool receiver lock poisoned");
                            guard.recv()
                        };
                        match job {
                            Ok(job) => job(),
                            // Channel closed: pool is shutting down.
                            Err(_) => break,
                        }
                    }
                    debug!(thread = %name, "pool thread exiting");
                })
                .expect("failed to spawn pool thread");
            handles.push(handle);
        }

        Self {
            label,
            sender: Mutex::new(Some(tx)),
            handles: Mutex::new(handles),
            terminated: AtomicBool::new(false),
        }
    }

    /// Submit a closure; the returned channel yields its value, or the
    /// caught panic if the closure panicked. A panicking job never takes
    /// the pool thread down.
    pub fn submit<T, F>(&self, f: F) -> Result<oneshot::Receiver<thread::Result<T>>, SchedulerError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::new(move || {
            let result = catch_unwind(AssertUnwindSafe(f));
            // Receiver may have stopped waiting (cancel/timeout); the
            // result is simply discarded then.
            let _ = tx.send(result);
        });

        let guard = self.sender.lock().expect("pool sender lock poisoned");
        match guard.as_ref() {
            Some(sender) => sender
                .send(job)
                .map_err(|_| SchedulerError::NotRunning)
                .map(|_| rx),
            None => Err(SchedulerError::NotRunning),
        }
    }

    /// Stop accepting jobs, let queued and in-flight work finish, and join
    /// every thread.
    pub fn shutdown(&self) {
        {
            let mut guard = self.sender.lock().expect("pool sender lock poisoned");
            guard.take();
        }

        let handles = {
            let mut guard = self.handles.lock().expect("pool handles lock poisoned");
            std::mem::take(&mut *guard)
        };
        for handle in handles {
            if handle.join().is_err() {
                warn!(pool = %self.label, "pool thread panicked during shutdown");
            }
        }

        self.terminated.store(true, Ordering::SeqCst);
        debug!(pool = %self.label, "pool terminated");
    }

    /// Whether `shutdown` has completed.
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}
