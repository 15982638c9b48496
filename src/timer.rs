//! Timer capability and the wheel driver.
//!
//! Time is injected: the interpreter asks its [`Timer`] for wall-clock and
//! monotonic readings and schedules `Sleep` nodes through it. The contract
//! on `sleep` is strict — the thunk is invoked at most once, whether or not
//! cancellation races the firing — because the thunk completes an async
//! callback that itself enforces at-most-once delivery.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// A thunk scheduled for delivery after a delay.
pub type TimerThunk = Box<dyn FnOnce() + Send + 'static>;

/// Handle to a pending sleep; dropping it does not cancel the delivery.
#[derive(Clone, Debug)]
pub struct SleepHandle {
    canceled: Arc<AtomicBool>,
}

impl SleepHandle {
    pub(crate) fn new() -> Self {
        Self {
            canceled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Requests cancellation of the pending delivery.
    ///
    /// Idempotent. If the thunk has already fired, this is a no-op; if the
    /// cancellation races the firing, the thunk still runs at most once.
    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::Release);
    }

    pub(crate) fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }
}

/// A capability providing clock readings and delayed delivery.
pub trait Timer: Send + Sync {
    /// Wall-clock milliseconds since the Unix epoch.
    fn now_millis(&self) -> i64;

    /// Nanoseconds on a monotonic clock with an arbitrary origin.
    fn monotonic_nanos(&self) -> i64;

    /// Schedules `thunk` to run after `delay`. The thunk runs at most once.
    fn sleep(&self, delay: Duration, thunk: TimerThunk) -> SleepHandle;
}

struct TimerEntry {
    deadline: Instant,
    generation: u64,
    thunk: TimerThunk,
    handle: SleepHandle,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.generation == other.generation
    }
}

impl Eq for TimerEntry {}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reverse ordering for min-heap (earliest deadline first).
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.generation.cmp(&self.generation))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

struct WheelState {
    heap: BinaryHeap<TimerEntry>,
    next_generation: u64,
    shutdown: bool,
}

/// A timer backed by one driver thread over a deadline min-heap.
pub struct WheelTimer {
    state: Arc<(Mutex<WheelState>, Condvar)>,
    origin: Instant,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl WheelTimer {
    /// Creates a timer and starts its driver thread.
    #[must_use]
    pub fn new() -> Self {
        let state = Arc::new((
            Mutex::new(WheelState {
                heap: BinaryHeap::new(),
                next_generation: 0,
                shutdown: false,
            }),
            Condvar::new(),
        ));

        let driver_state = Arc::clone(&state);
        let driver = thread::Builder::new()
            .name("filament-timer".to_string())
            .spawn(move || driver_loop(&driver_state))
            .expect("failed to spawn timer thread");

        Self {
            state,
            origin: Instant::now(),
            driver: Mutex::new(Some(driver)),
        }
    }

    /// Stops the driver thread. Pending thunks that have not fired are
    /// dropped without running.
    pub fn shutdown(&self) {
        {
            let (lock, condvar) = &*self.state;
            let mut state = lock.lock().expect("timer mutex poisoned");
            state.shutdown = true;
            condvar.notify_all();
        }
        if let Some(handle) = self.driver.lock().expect("driver slot poisoned").take() {
            let _ = handle.join();
        }
    }
}

impl Default for WheelTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl Timer for WheelTimer {
    fn now_millis(&self) -> i64 {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        since_epoch.as_millis() as i64
    }

    fn monotonic_nanos(&self) -> i64 {
        self.origin.elapsed().as_nanos() as i64
    }

    fn sleep(&self, delay: Duration, thunk: TimerThunk) -> SleepHandle {
        let handle = SleepHandle::new();
        let (lock, condvar) = &*self.state;
        let mut state = lock.lock().expect("timer mutex poisoned");
        let generation = state.next_generation;
        state.next_generation += 1;
        state.heap.push(TimerEntry {
            deadline: Instant::now() + delay,
            generation,
            thunk,
            handle: handle.clone(),
        });
        condvar.notify_all();
        handle
    }
}

impl fmt::Debug for WheelTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pending = self
            .state
            .0
            .lock()
            .map(|s| s.heap.len())
            .unwrap_or(0);
        f.debug_struct("WheelTimer").field("pending", &pending).finish()
    }
}

impl Drop for WheelTimer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn driver_loop(state: &Arc<(Mutex<WheelState>, Condvar)>) {
    let (lock, condvar) = &**state;
    let mut guard = lock.lock().expect("timer mutex poisoned");
    loop {
        if guard.shutdown {
            return;
        }

        let now = Instant::now();
        let mut due = Vec::new();
        while let Some(entry) = guard.heap.peek() {
            if entry.deadline <= now {
                if let Some(entry) = guard.heap.pop() {
                    if !entry.handle.is_canceled() {
                        due.push(entry.thunk);
                    }
                }
            } else {
                break;
            }
        }

        if !due.is_empty() {
            drop(guard);
            for thunk in due {
                thunk();
            }
            guard = lock.lock().expect("timer mutex poisoned");
            continue;
        }

        guard = match guard.heap.peek().map(|e| e.deadline) {
            Some(deadline) => {
                let wait = deadline.saturating_duration_since(Instant::now());
                condvar
                    .wait_timeout(guard, wait)
                    .expect("timer mutex poisoned")
                    .0
            }
            None => condvar.wait(guard).expect("timer mutex poisoned"),
        };
    }
}
