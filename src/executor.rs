//! Executor capability and the worker pool.
//!
//! The interpreter never owns threads. Every thread migration — `EvalOn`,
//! `Cede`, child spawning, async resumption — goes through an injected
//! [`Executor`]. The executor must queue the submitted action and run it on
//! some thread later; submission doubles as the release/acquire edge that
//! publishes the fiber's stack writes to the next worker.
//!
//! A rejected submission (a pool that has shut down) is a signal the runtime
//! swallows: the runloop is dropped silently and the fiber ceases progress.

use crossbeam_queue::SegQueue;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::tracing_compat::debug;

/// An action submitted to an executor.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// A shared handle to an executor capability.
pub type Exec = Arc<dyn Executor>;

/// Error returned when an executor refuses a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RejectedTask;

impl fmt::Display for RejectedTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("executor rejected task")
    }
}

impl std::error::Error for RejectedTask {}

/// A capability that accepts actions for eventual execution.
///
/// Implementations must accept submissions from any thread and must not run
/// the action on the caller's stack frame: the runtime submits continuations
/// of a runloop that may still hold that fiber's state, so synchronous
/// execution would re-enter it. Queue the action and run it later.
pub trait Executor: Send + Sync {
    /// Submits an action, or rejects it if the executor is no longer
    /// accepting work.
    fn execute(&self, task: Task) -> Result<(), RejectedTask>;
}

/// Compares two executor handles for identity.
pub(crate) fn exec_eq(a: &Exec, b: &Exec) -> bool {
    Arc::ptr_eq(a, b)
}

/// A value wrapper carrying an executor handle through an effect program.
///
/// This is what a `ReadExecutor` node produces.
#[derive(Clone)]
pub struct ExecutorHandle(
    /// The wrapped executor.
    pub Exec,
);

impl fmt::Debug for ExecutorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ExecutorHandle")
    }
}

/// Placeholder executor installed before a fiber is seeded.
///
/// Rejects everything; a fiber that has not been `run` has nowhere to go.
pub(crate) struct NullExecutor;

impl Executor for NullExecutor {
    fn execute(&self, _task: Task) -> Result<(), RejectedTask> {
        Err(RejectedTask)
    }
}

/// A fixed-size pool of worker threads draining a shared injector queue.
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    queue: SegQueue<Task>,
    shutdown: AtomicBool,
    live_threads: AtomicUsize,
    condvar: Condvar,
    mutex: Mutex<()>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Creates a pool with `threads` worker threads.
    ///
    /// # Panics
    ///
    /// Panics if `threads` is 0.
    #[must_use]
    pub fn new(threads: usize) -> Self {
        assert!(threads > 0, "worker pool needs at least one thread");
        let inner = Arc::new(PoolInner {
            queue: SegQueue::new(),
            shutdown: AtomicBool::new(false),
            live_threads: AtomicUsize::new(threads),
            condvar: Condvar::new(),
            mutex: Mutex::new(()),
            handles: Mutex::new(Vec::with_capacity(threads)),
        });

        for index in 0..threads {
            let worker = Arc::clone(&inner);
            let handle = thread::Builder::new()
                .name(format!("filament-worker-{index}"))
                .spawn(move || worker_loop(&worker))
                .expect("failed to spawn worker thread");
            inner.handles.lock().expect("pool handles poisoned").push(handle);
        }

        Self { inner }
    }

    /// Returns true if the pool has been shut down.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }

    /// Stops accepting submissions and wakes all workers.
    ///
    /// Tasks already queued still run; workers exit once the queue drains.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        let _guard = self.inner.mutex.lock().expect("pool mutex poisoned");
        self.inner.condvar.notify_all();
    }

    /// Shuts down and waits up to `timeout` for workers to exit.
    ///
    /// Returns true if every worker exited in time.
    pub fn shutdown_and_wait(&self, timeout: Duration) -> bool {
        self.shutdown();
        let deadline = std::time::Instant::now() + timeout;

        while self.inner.live_threads.load(Ordering::Acquire) > 0 {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                return false;
            }
            {
                let _guard = self.inner.mutex.lock().expect("pool mutex poisoned");
                self.inner.condvar.notify_all();
            }
            thread::sleep(Duration::from_millis(5).min(remaining));
        }

        let mut handles = self.inner.handles.lock().expect("pool handles poisoned");
        for handle in handles.drain(..) {
            let _ = handle.join();
        }
        true
    }
}

impl Executor for WorkerPool {
    fn execute(&self, task: Task) -> Result<(), RejectedTask> {
        if self.inner.shutdown.load(Ordering::Acquire) {
            return Err(RejectedTask);
        }
        self.inner.queue.push(task);
        let _guard = self.inner.mutex.lock().expect("pool mutex poisoned");
        self.inner.condvar.notify_one();
        Ok(())
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("live_threads", &self.inner.live_threads.load(Ordering::Relaxed))
            .field("pending", &self.inner.queue.len())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        let _ = self.shutdown_and_wait(Duration::from_secs(5));
    }
}

fn worker_loop(inner: &Arc<PoolInner>) {
    loop {
        if let Some(task) = inner.queue.pop() {
            // A panicking task must not take the worker down with it; the
            // runtime catches user panics earlier, so this only fires for
            // foreign submissions.
            if crate::error::catch(task).is_err() {
                debug!("worker task panicked; worker continues");
            }
            continue;
        }

        if inner.shutdown.load(Ordering::Acquire) {
            break;
        }

        let guard = inner.mutex.lock().expect("pool mutex poisoned");
        // Re-check under the lock so a submission between the pop and the
        // park cannot strand its task.
        if !inner.queue.is_empty() || inner.shutdown.load(Ordering::Acquire) {
            continue;
        }
        let _guard = inner.condvar.wait(guard).expect("pool mutex poisoned");
    }
    inner.live_threads.fetch_sub(1, Ordering::AcqRel);
}
