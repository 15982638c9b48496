//! Effect nodes: immutable descriptions of one step of a program.
//!
//! An [`Effect`] is a tree of tagged nodes. Nothing runs at construction
//! time; a [`Fiber`](crate::fiber::Fiber) interprets the tree, pushing one
//! continuation frame per compound node as it descends. Values carried
//! between nodes are type-erased ([`Val`]) so heterogeneous user programs
//! flow through a single interpreter; typed reads happen at the edges.
//!
//! Effects are cheap to clone: payloads are reference-counted, so a cancel
//! effect can be retained by a finalizer and a program can be retried or
//! raced without copying its body.

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::asyncs::AsyncCallback;
use crate::error::Cause;
use crate::executor::Exec;
use crate::outcome::Outcome;

/// A type-erased value carried between effect nodes.
pub type Val = Arc<dyn Any + Send + Sync>;

/// Erases a value for transport through an effect program.
#[must_use]
pub fn val<T: Any + Send + Sync>(value: T) -> Val {
    Arc::new(value)
}

/// The erased unit value.
#[must_use]
pub fn unit_val() -> Val {
    val(())
}

/// A side-effecting thunk producing a value.
pub type ThunkFn = Arc<dyn Fn() -> Val + Send + Sync>;
/// A value-to-value mapping function.
pub type MapFn = Arc<dyn Fn(Val) -> Val + Send + Sync>;
/// A value-to-effect continuation function.
pub type BindFn = Arc<dyn Fn(Val) -> Effect + Send + Sync>;
/// An error handler producing a recovery effect.
pub type HandlerFn = Arc<dyn Fn(Cause) -> Effect + Send + Sync>;
/// An outcome observer producing a finalization effect.
pub type CaseFn = Arc<dyn Fn(&Outcome) -> Effect + Send + Sync>;
/// The body of an uncancelable region, handed its polling transform.
pub type BodyFn = Arc<dyn Fn(Poll) -> Effect + Send + Sync>;
/// An async registrar: receives the result callback, returns an effect
/// producing an [`AsyncRegistration`].
pub type RegistrarFn = Arc<dyn Fn(AsyncCallback) -> Effect + Send + Sync>;

/// The result of an async registration: an optional effect that cancels the
/// registered operation.
#[derive(Clone)]
pub struct AsyncRegistration {
    pub(crate) cancel: Option<Effect>,
}

impl AsyncRegistration {
    /// Wraps an optional cancel effect.
    #[must_use]
    pub fn new(cancel: Option<Effect>) -> Self {
        Self { cancel }
    }
}

impl fmt::Debug for AsyncRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncRegistration")
            .field("has_cancel", &self.cancel.is_some())
            .finish()
    }
}

/// An opaque transform revealing cancellation inside an uncancelable region.
///
/// The body of [`Effect::uncancelable`] receives a `Poll` tied to the mask
/// level at which its region was entered, so nested regions cannot
/// cross-unmask each other.
#[derive(Debug, Clone, Copy)]
pub struct Poll {
    mask_id: u32,
}

impl Poll {
    pub(crate) const fn new(mask_id: u32) -> Self {
        Self { mask_id }
    }

    /// Wraps `effect` so that cancellation is observable while it runs.
    #[must_use]
    pub fn apply(&self, effect: Effect) -> Effect {
        Effect::Unmask(Arc::new(effect), self.mask_id)
    }
}

/// One step of an effect program.
///
/// The variants map one-to-one onto interpreter dispatch cases; see the
/// constructor methods for the user-facing meaning of each.
#[derive(Clone)]
pub enum Effect {
    /// An already-computed value.
    Pure(Val),
    /// A side-effecting thunk, run when interpreted.
    Delay(ThunkFn),
    /// A raised failure.
    Error(Cause),
    /// An asynchronous boundary; see [`Effect::async_`].
    Async(RegistrarFn),
    /// Produces the executor the fiber is currently running on.
    ReadExecutor,
    /// Runs the inner effect on the given executor, then shifts back.
    EvalOn(Arc<Effect>, Exec),
    /// Transforms the inner effect's value.
    Map(Arc<Effect>, MapFn),
    /// Sequences a dependent effect after the inner one.
    FlatMap(Arc<Effect>, BindFn),
    /// Recovers from a failure of the inner effect.
    HandleErrorWith(Arc<Effect>, HandlerFn),
    /// Observes the inner effect's outcome on every exit path.
    OnCase(Arc<Effect>, CaseFn),
    /// Suppresses cancellation for the body, except where polled.
    Uncancelable(BodyFn),
    /// Requests cancellation of the current fiber.
    Canceled,
    /// Starts the inner effect on a new child fiber.
    Start(Arc<Effect>),
    /// Races two child fibers; completes with the first to finish.
    RacePair(Arc<Effect>, Arc<Effect>),
    /// Suspends for the given duration.
    Sleep(Duration),
    /// Produces the wall clock in milliseconds.
    RealTime,
    /// Produces the monotonic clock in nanoseconds.
    Monotonic,
    /// Yields the worker thread, rescheduling the continuation.
    Cede,
    /// Reveals cancellation for the inner effect if the mask id matches.
    Unmask(Arc<Effect>, u32),
}

impl Effect {
    /// Lifts a value into an effect.
    #[must_use]
    pub fn pure<T: Any + Send + Sync>(value: T) -> Self {
        Self::Pure(val(value))
    }

    /// Lifts an already-erased value into an effect.
    #[must_use]
    pub fn pure_val(value: Val) -> Self {
        Self::Pure(value)
    }

    /// The unit effect.
    #[must_use]
    pub fn unit() -> Self {
        Self::pure(())
    }

    /// Suspends a side-effecting computation.
    ///
    /// The thunk runs when the node is interpreted; an unwinding panic is
    /// captured as a failure.
    #[must_use]
    pub fn delay<T, F>(thunk: F) -> Self
    where
        T: Any + Send + Sync,
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self::Delay(Arc::new(move || val(thunk())))
    }

    /// Raises a failure.
    #[must_use]
    pub fn raise(cause: Cause) -> Self {
        Self::Error(cause)
    }

    /// Introduces an asynchronous boundary.
    ///
    /// The registrar receives the result callback and returns an effect
    /// whose value must be an [`AsyncRegistration`] (use
    /// [`Effect::registration`]). If the callback has not fired by the time
    /// registration completes, the fiber suspends until it does.
    #[must_use]
    pub fn async_<F>(registrar: F) -> Self
    where
        F: Fn(AsyncCallback) -> Effect + Send + Sync + 'static,
    {
        Self::Async(Arc::new(registrar))
    }

    /// An effect producing an [`AsyncRegistration`]; the terminal step of a
    /// registrar.
    #[must_use]
    pub fn registration(cancel: Option<Effect>) -> Self {
        Self::Pure(val(AsyncRegistration::new(cancel)))
    }

    /// An async boundary that never completes. Cancelable.
    #[must_use]
    pub fn never() -> Self {
        Self::async_(|_cb| Self::registration(None))
    }

    /// Produces the current executor as an
    /// [`ExecutorHandle`](crate::executor::ExecutorHandle).
    #[must_use]
    pub fn read_executor() -> Self {
        Self::ReadExecutor
    }

    /// Runs this effect on `exec`, restoring the previous executor after.
    #[must_use]
    pub fn eval_on(self, exec: Exec) -> Self {
        Self::EvalOn(Arc::new(self), exec)
    }

    /// Transforms the produced value.
    #[must_use]
    pub fn map<F>(self, f: F) -> Self
    where
        F: Fn(Val) -> Val + Send + Sync + 'static,
    {
        Self::Map(Arc::new(self), Arc::new(f))
    }

    /// Sequences a dependent effect after this one.
    #[must_use]
    pub fn flat_map<F>(self, f: F) -> Self
    where
        F: Fn(Val) -> Effect + Send + Sync + 'static,
    {
        Self::FlatMap(Arc::new(self), Arc::new(f))
    }

    /// Sequences `next` after this effect, discarding this effect's value.
    #[must_use]
    pub fn and_then(self, next: Effect) -> Self {
        self.flat_map(move |_| next.clone())
    }

    /// Discards the produced value.
    #[must_use]
    pub fn void(self) -> Self {
        self.map(|_| unit_val())
    }

    /// Recovers from a failure with the given handler.
    #[must_use]
    pub fn handle_error_with<F>(self, handler: F) -> Self
    where
        F: Fn(Cause) -> Effect + Send + Sync + 'static,
    {
        Self::HandleErrorWith(Arc::new(self), Arc::new(handler))
    }

    /// Observes this effect's outcome on every exit path — completion,
    /// failure, or cancellation. The handler's effect runs pinned to the
    /// executor that was current at registration; failures inside it are
    /// swallowed.
    #[must_use]
    pub fn guarantee_case<F>(self, handler: F) -> Self
    where
        F: Fn(&Outcome) -> Effect + Send + Sync + 'static,
    {
        Self::OnCase(Arc::new(self), Arc::new(handler))
    }

    /// Runs the body with cancellation suppressed.
    ///
    /// The body receives a [`Poll`]; wrapping an inner effect with
    /// [`Poll::apply`] restores cancelability for just that window.
    #[must_use]
    pub fn uncancelable<F>(body: F) -> Self
    where
        F: Fn(Poll) -> Effect + Send + Sync + 'static,
    {
        Self::Uncancelable(Arc::new(body))
    }

    /// Requests cancellation of the current fiber.
    ///
    /// Unmasked, the fiber begins finalization immediately; masked, the
    /// request is deferred and revealed at the next cancelable point.
    #[must_use]
    pub fn canceled() -> Self {
        Self::Canceled
    }

    /// Starts this effect on a new child fiber, producing the child's
    /// [`Fiber`](crate::fiber::Fiber) handle.
    #[must_use]
    pub fn start(self) -> Self {
        Self::Start(Arc::new(self))
    }

    /// Races two effects on child fibers, producing a
    /// [`RaceWinner`](crate::fiber::RaceWinner).
    ///
    /// The loser keeps running and is handed back with the winner's value;
    /// cancel it or join it as needed. Known hazard inherited from the
    /// source semantics: self-cancellation inside a nested poll around a
    /// race can leave the outer fiber suspended, because the race uses the
    /// mask level at its own position rather than the poll's.
    #[must_use]
    pub fn race_pair(lhs: Effect, rhs: Effect) -> Self {
        Self::RacePair(Arc::new(lhs), Arc::new(rhs))
    }

    /// Suspends the fiber for `delay`.
    #[must_use]
    pub fn sleep(delay: Duration) -> Self {
        Self::Sleep(delay)
    }

    /// Produces the wall clock in milliseconds since the Unix epoch (`i64`).
    #[must_use]
    pub fn real_time() -> Self {
        Self::RealTime
    }

    /// Produces a monotonic reading in nanoseconds (`i64`).
    #[must_use]
    pub fn monotonic() -> Self {
        Self::Monotonic
    }

    /// Yields the worker, rescheduling the continuation on the current
    /// executor.
    #[must_use]
    pub fn cede() -> Self {
        Self::Cede
    }

    /// Returns the node's dispatch tag.
    #[must_use]
    pub const fn tag(&self) -> u8 {
        match self {
            Self::Pure(_) => 0,
            Self::Delay(_) => 1,
            Self::Error(_) => 2,
            Self::Async(_) => 3,
            Self::ReadExecutor => 4,
            Self::EvalOn(..) => 5,
            Self::Map(..) => 6,
            Self::FlatMap(..) => 7,
            Self::HandleErrorWith(..) => 8,
            Self::OnCase(..) => 9,
            Self::Uncancelable(_) => 10,
            Self::Canceled => 11,
            Self::Start(_) => 12,
            Self::RacePair(..) => 13,
            Self::Sleep(_) => 14,
            Self::RealTime => 15,
            Self::Monotonic => 16,
            Self::Cede => 17,
            Self::Unmask(..) => 18,
        }
    }

    const fn name(&self) -> &'static str {
        match self {
            Self::Pure(_) => "Pure",
            Self::Delay(_) => "Delay",
            Self::Error(_) => "Error",
            Self::Async(_) => "Async",
            Self::ReadExecutor => "ReadExecutor",
            Self::EvalOn(..) => "EvalOn",
            Self::Map(..) => "Map",
            Self::FlatMap(..) => "FlatMap",
            Self::HandleErrorWith(..) => "HandleErrorWith",
            Self::OnCase(..) => "OnCase",
            Self::Uncancelable(_) => "Uncancelable",
            Self::Canceled => "Canceled",
            Self::Start(_) => "Start",
            Self::RacePair(..) => "RacePair",
            Self::Sleep(_) => "Sleep",
            Self::RealTime => "RealTime",
            Self::Monotonic => "Monotonic",
            Self::Cede => "Cede",
            Self::Unmask(..) => "Unmask",
        }
    }
}

impl fmt::Debug for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
