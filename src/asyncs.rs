//! The async handshake cell and its delivery callback.
//!
//! Registration (on the fiber) and delivery (on any thread) race over two
//! atomics. `done` guards at-most-once delivery; `phase` records how far
//! registration got. The legal phase transitions are monotonic:
//!
//! ```text
//! Initial -> Registered | RegisteredWithFinalizer | Complete
//! Registered* -> Complete
//! ```
//!
//! The delivered result is written before the phase swaps to `Complete`, so
//! whichever side loses the phase race reads a fully published result.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};

use crate::effect::Val;
use crate::error::Cause;
use crate::fiber::FiberShared;

/// Registrar has not completed and no callback has fired.
pub(crate) const PHASE_INITIAL: u8 = 0;
/// Registered without a cancel finalizer; the fiber is suspending.
pub(crate) const PHASE_REGISTERED: u8 = 1;
/// Registered with a cancel finalizer pushed on the fiber.
pub(crate) const PHASE_REGISTERED_FIN: u8 = 2;
/// A result has been delivered.
pub(crate) const PHASE_COMPLETE: u8 = 3;

/// The two-atomic cell coordinating one async suspension.
pub(crate) struct AsyncCell {
    done: AtomicBool,
    phase: AtomicU8,
    result: OnceLock<Result<Val, Cause>>,
}

impl AsyncCell {
    pub(crate) fn new() -> Self {
        Self {
            done: AtomicBool::new(false),
            phase: AtomicU8::new(PHASE_INITIAL),
            result: OnceLock::new(),
        }
    }

    /// Claims the single delivery slot. The first caller wins.
    pub(crate) fn claim(&self) -> bool {
        !self.done.swap(true, Ordering::AcqRel)
    }

    /// Attempts to move `Initial` to the given registered phase.
    ///
    /// Fails iff a delivery won the race, in which case the result is
    /// already readable.
    pub(crate) fn try_register(&self, phase: u8) -> bool {
        self.phase
            .compare_exchange(PHASE_INITIAL, phase, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Publishes the delivered result and swaps the phase to `Complete`,
    /// returning the previous phase.
    pub(crate) fn complete(&self, result: Result<Val, Cause>) -> u8 {
        let _ = self.result.set(result);
        self.phase.swap(PHASE_COMPLETE, Ordering::AcqRel)
    }

    /// Reads the delivered result, if delivery has completed.
    pub(crate) fn delivered(&self) -> Option<Result<Val, Cause>> {
        self.result.get().cloned()
    }
}

/// The result callback handed to an async registrar.
///
/// Invoking it more than once is harmless: only the first result is
/// delivered, later calls are ignored.
#[derive(Clone)]
pub struct AsyncCallback {
    pub(crate) cell: Arc<AsyncCell>,
    pub(crate) fiber: Arc<FiberShared>,
}

impl AsyncCallback {
    /// Delivers the operation's result.
    pub fn complete(&self, result: Result<Val, Cause>) {
        if !self.cell.claim() {
            return;
        }
        let previous = self.cell.complete(result.clone());
        if previous == PHASE_INITIAL {
            // The registrar is still running on the fiber; it will observe
            // the completed phase and continue inline.
            return;
        }
        self.fiber
            .resume_after_delivery(previous == PHASE_REGISTERED_FIN, result);
    }

    /// Delivers a successful result.
    pub fn succeed(&self, value: Val) {
        self.complete(Ok(value));
    }

    /// Delivers a failure.
    pub fn fail(&self, cause: Cause) {
        self.complete(Err(cause));
    }
}

impl std::fmt::Debug for AsyncCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncCallback").finish()
    }
}
