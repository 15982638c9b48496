//! Deterministic lab runtime for testing.
//!
//! Real executors and timers make interleavings a function of the scheduler
//! and the wall clock. The lab pair removes both sources of nondeterminism:
//! [`StepExecutor`] queues every submission and drains it only when asked,
//! on the calling thread, in FIFO order; [`VirtualTimer`] only moves when
//! the test advances it. A test drives a fiber to a known point, advances
//! time, flushes, and asserts — the same schedule every run.

use std::collections::{BinaryHeap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::executor::{Exec, Executor, RejectedTask, Task};
use crate::timer::{SleepHandle, Timer, TimerThunk};

/// A FIFO executor drained manually on the calling thread.
#[derive(Default)]
pub struct StepExecutor {
    queue: Mutex<VecDeque<Task>>,
}

impl StepExecutor {
    /// Creates an empty executor.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of queued tasks.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// Runs the oldest queued task, if any. Returns whether one ran.
    pub fn step(&self) -> bool {
        let task = self.queue.lock().pop_front();
        match task {
            Some(task) => {
                task();
                true
            }
            None => false,
        }
    }

    /// Runs tasks (including newly enqueued ones) until the queue is empty.
    /// Returns how many ran.
    pub fn run_until_idle(&self) -> usize {
        let mut ran = 0;
        while self.step() {
            ran += 1;
        }
        ran
    }
}

impl Executor for StepExecutor {
    fn execute(&self, task: Task) -> Result<(), RejectedTask> {
        self.queue.lock().push_back(task);
        Ok(())
    }
}

impl std::fmt::Debug for StepExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepExecutor")
            .field("pending", &self.pending())
            .finish()
    }
}

struct VirtualEntry {
    deadline_nanos: i64,
    generation: u64,
    thunk: TimerThunk,
    handle: SleepHandle,
}

impl PartialEq for VirtualEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline_nanos == other.deadline_nanos && self.generation == other.generation
    }
}

impl Eq for VirtualEntry {}

impl Ord for VirtualEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reverse ordering for min-heap (earliest deadline first).
        other
            .deadline_nanos
            .cmp(&self.deadline_nanos)
            .then_with(|| other.generation.cmp(&self.generation))
    }
}

impl PartialOrd for VirtualEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

struct VirtualState {
    now_nanos: i64,
    next_generation: u64,
    queue: BinaryHeap<VirtualEntry>,
}

/// A manually advanced clock.
///
/// Sleeps queue until [`VirtualTimer::advance`] moves the clock past their
/// deadline; thunks fire in deadline order on the advancing thread.
pub struct VirtualTimer {
    state: Mutex<VirtualState>,
}

impl VirtualTimer {
    /// Creates a timer at time zero.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(VirtualState {
                now_nanos: 0,
                next_generation: 0,
                queue: BinaryHeap::new(),
            }),
        }
    }

    /// Number of pending sleeps.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Moves the clock forward, firing every sleep whose deadline is
    /// reached — including sleeps scheduled by fired thunks, as long as
    /// they land within the new time.
    pub fn advance(&self, delta: Duration) {
        {
            let mut state = self.state.lock();
            state.now_nanos += delta.as_nanos() as i64;
        }
        loop {
            let due = {
                let mut state = self.state.lock();
                let now = state.now_nanos;
                let mut due = Vec::new();
                while let Some(entry) = state.queue.peek() {
                    if entry.deadline_nanos <= now {
                        if let Some(entry) = state.queue.pop() {
                            if !entry.handle.is_canceled() {
                                due.push(entry.thunk);
                            }
                        }
                    } else {
                        break;
                    }
                }
                due
            };
            if due.is_empty() {
                return;
            }
            for thunk in due {
                thunk();
            }
        }
    }
}

impl Default for VirtualTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl Timer for VirtualTimer {
    fn now_millis(&self) -> i64 {
        self.state.lock().now_nanos / 1_000_000
    }

    fn monotonic_nanos(&self) -> i64 {
        self.state.lock().now_nanos
    }

    fn sleep(&self, delay: Duration, thunk: TimerThunk) -> SleepHandle {
        let handle = SleepHandle::new();
        let mut state = self.state.lock();
        let generation = state.next_generation;
        state.next_generation += 1;
        let deadline_nanos = state.now_nanos + delay.as_nanos() as i64;
        state.queue.push(VirtualEntry {
            deadline_nanos,
            generation,
            thunk,
            handle: handle.clone(),
        });
        handle
    }
}

impl std::fmt::Debug for VirtualTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualTimer")
            .field("now_nanos", &self.state.lock().now_nanos)
            .field("pending", &self.pending())
            .finish()
    }
}

/// The deterministic executor/timer pair, bundled.
pub struct LabRuntime {
    executor: Arc<StepExecutor>,
    timer: Arc<VirtualTimer>,
}

impl LabRuntime {
    /// Creates a fresh lab.
    #[must_use]
    pub fn new() -> Self {
        Self {
            executor: Arc::new(StepExecutor::new()),
            timer: Arc::new(VirtualTimer::new()),
        }
    }

    /// The lab's executor as an injectable capability.
    #[must_use]
    pub fn executor(&self) -> Exec {
        Arc::clone(&self.executor) as Exec
    }

    /// The lab's timer as an injectable capability.
    #[must_use]
    pub fn timer(&self) -> Arc<dyn Timer> {
        Arc::clone(&self.timer) as Arc<dyn Timer>
    }

    /// Drains the executor queue. Returns how many tasks ran.
    pub fn flush(&self) -> usize {
        self.executor.run_until_idle()
    }

    /// Advances the clock, then drains everything the firing unblocked.
    pub fn advance(&self, delta: Duration) {
        self.timer.advance(delta);
        self.executor.run_until_idle();
    }
}

impl Default for LabRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LabRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LabRuntime")
            .field("executor", &self.executor)
            .field("timer", &self.timer)
            .finish()
    }
}
