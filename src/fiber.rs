//! The fiber: one cooperative unit of execution and its interpreter loop.
//!
//! A fiber owns its stacks outright; no other thread reads them while the
//! runloop is resident on a worker. Ownership of the runloop moves between
//! threads in exactly two ways:
//!
//! 1. **Executor submission** — `EvalOn`, `Cede`, child starts, and async
//!    resumptions queue a task; the queue is the synchronization edge.
//! 2. **The `suspended` CAS** — when an async registration completes, the
//!    fiber parks behind an atomic flag. Whoever flips `suspended` from
//!    true to false (the delivery callback or a canceller) owns the runloop
//!    next, and only an owner may lock the fiber's state.
//!
//! That discipline is what makes the state mutex uncontended and cycle-free:
//! a thread only ever locks a fiber it owns, and ownership of each fiber is
//! exclusive.
//!
//! Cancellation is cooperative. `cancel` raises a flag; the flag is polled
//! at the gate on every loop iteration and acted on only when the fiber is
//! unmasked. A canceller that finds the target suspended steals finalization
//! and drives the finalizer stack itself; otherwise it joins and waits.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::asyncs::{AsyncCallback, AsyncCell, PHASE_REGISTERED, PHASE_REGISTERED_FIN};
use crate::cont::Cont;
use crate::effect::{unit_val, val, AsyncRegistration, Effect, Poll, Val};
use crate::error::{catch, Cause};
use crate::executor::{exec_eq, Exec, ExecutorHandle, NullExecutor};
use crate::joiners::{JoinerRegistry, Listener};
use crate::outcome::Outcome;
use crate::stack::{BoolStack, ContStack};
use crate::timer::Timer;
use crate::tracing_compat::{debug, trace};

/// Deepest native recursion continuation dispatch may reach; past this,
/// results are reified as `Pure`/`Error` nodes and trampolined through the
/// loop.
const MAX_STACK_DEPTH: u32 = 512;

/// Dispatches between read barriers on the `suspended` flag.
const READ_BARRIER_INTERVAL: u32 = 512;

/// Mask-id offset separating a child fiber's unmask space from its parent's.
const CHILD_MASK_OFFSET: u32 = 255;

/// Process-wide counter supplying unique fiber names.
static FIBER_IDS: AtomicU64 = AtomicU64::new(0);

/// A finalizer: observes the outcome of its scope and produces the effect
/// that cleans up. The second argument is the executor current at the time
/// the finalizer runs, for handlers pinned to their registration executor.
type Finalizer = Arc<dyn Fn(&Outcome, &Exec) -> Effect + Send + Sync>;

type TerminalFn = Box<dyn FnOnce(Outcome) + Send>;

/// An entry in the fiber's object stack: the side state of one frame.
enum Obj {
    Map(crate::effect::MapFn),
    Bind(crate::effect::BindFn),
    Handler(crate::effect::HandlerFn),
    Async(Arc<AsyncCell>),
    Saved(Val),
    SavedCause(Cause),
}

/// How a runloop segment is entered.
enum Entry {
    Interpret(Effect),
    Succeeded(Val),
    Failed(Cause),
}

/// The result of one continuation or dispatch step.
enum Step {
    /// Keep looping; `None` means the cancellation gate claims the fiber.
    Continue(Option<Effect>),
    /// The fiber is finished (outcome published or runloop dropped).
    Done,
    /// The fiber parked behind the `suspended` flag.
    Suspend,
    /// Hand the runloop to an executor with the given entry.
    Reschedule(Exec, Entry),
}

/// How a runloop segment exits; `Reschedule` is submitted after the state
/// lock is released.
enum Exit {
    Done,
    Suspended,
    Reschedule(Exec, Entry),
}

/// The interpreter state owned by whichever thread the fiber is resident on.
struct FiberState {
    conts: ContStack,
    objects: Vec<Obj>,
    bools: BoolStack,
    ctxs: Vec<Exec>,
    current_ctx: Exec,
    finalizers: Vec<Finalizer>,
    masks: u32,
}

impl FiberState {
    fn new() -> Self {
        Self {
            conts: ContStack::new(),
            objects: Vec::new(),
            bools: BoolStack::new(),
            ctxs: Vec::new(),
            current_ctx: Arc::new(NullExecutor),
            finalizers: Vec::new(),
            masks: 0,
        }
    }
}

/// The shared half of a fiber: atomics, outcome cell, joiners, and the
/// state mutex guarding the owned half.
pub(crate) struct FiberShared {
    name: String,
    init_mask: u32,
    timer: Arc<dyn Timer>,
    canceled: AtomicBool,
    suspended: AtomicBool,
    started: AtomicBool,
    outcome: OnceLock<Outcome>,
    joiners: JoinerRegistry,
    terminal: Mutex<Option<TerminalFn>>,
    state: Mutex<FiberState>,
}

/// A handle to a running (or runnable) fiber.
///
/// Handles are cheap to clone and are themselves values: `Start` produces
/// the child's handle, and a race hands back the loser's.
#[derive(Clone)]
pub struct Fiber {
    shared: Arc<FiberShared>,
}

/// The value produced by a race: the winner's result plus the still-live
/// loser fiber.
#[derive(Clone)]
pub enum RaceWinner {
    /// The left effect finished first.
    Left(Val, Fiber),
    /// The right effect finished first.
    Right(Fiber, Val),
}

impl std::fmt::Debug for RaceWinner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Left(_, loser) => write!(f, "Left(<value>, {})", loser.name()),
            Self::Right(loser, _) => write!(f, "Right({}, <value>)", loser.name()),
        }
    }
}

enum RaceSide {
    Left,
    Right,
}

impl Fiber {
    /// Creates a root fiber.
    ///
    /// `on_complete` is the terminal callback, invoked exactly once with the
    /// fiber's outcome. `init_mask` is normally 0 for a root fiber.
    #[must_use]
    pub fn new<F>(timer: Arc<dyn Timer>, on_complete: F, init_mask: u32) -> Self
    where
        F: FnOnce(Outcome) + Send + 'static,
    {
        Self::with_parts(timer, Some(Box::new(on_complete)), init_mask)
    }

    fn with_parts(timer: Arc<dyn Timer>, terminal: Option<TerminalFn>, init_mask: u32) -> Self {
        let id = FIBER_IDS.fetch_add(1, Ordering::Relaxed);
        Self {
            shared: Arc::new(FiberShared {
                name: format!("fiber-{id}"),
                init_mask,
                timer,
                canceled: AtomicBool::new(false),
                suspended: AtomicBool::new(false),
                started: AtomicBool::new(false),
                outcome: OnceLock::new(),
                joiners: JoinerRegistry::new(),
                terminal: Mutex::new(terminal),
                state: Mutex::new(FiberState::new()),
            }),
        }
    }

    /// Seeds the fiber with a program and enters the interpreter on the
    /// calling thread. Call exactly once; later calls are ignored.
    pub fn run(&self, effect: Effect, exec: Exec, masks: u32) {
        if self.shared.started.swap(true, Ordering::AcqRel) {
            debug!(fiber = %self.shared.name, "run invoked more than once; ignored");
            return;
        }
        trace!(fiber = %self.shared.name, "fiber seeded");
        let exit = {
            let mut st = self.shared.state.lock();
            st.masks = masks;
            st.ctxs.push(Arc::clone(&exec));
            st.current_ctx = exec;
            st.conts.push(Cont::RunTerminus);
            self.shared.run_loop(&mut st, Entry::Interpret(effect))
        };
        if let Exit::Reschedule(next_exec, entry) = exit {
            self.shared.reschedule(next_exec, entry);
        }
    }

    /// An effect that cancels this fiber.
    ///
    /// Running it raises the cancellation flag; if the target is suspended,
    /// the canceller steals finalization and completes immediately,
    /// otherwise it waits for the target to finalize naturally.
    #[must_use]
    pub fn cancel(&self) -> Effect {
        let shared = Arc::clone(&self.shared);
        let target = self.clone();
        Effect::Delay(Arc::new(move || val(shared.cancel_now())))
            .flat_map(move |stolen| {
                let stolen = stolen.downcast_ref::<bool>().copied().unwrap_or(false);
                if stolen {
                    Effect::unit()
                } else {
                    target.join().void()
                }
            })
    }

    /// An effect producing this fiber's terminal [`Outcome`].
    ///
    /// Joiners registered before or after termination all observe the same
    /// outcome.
    #[must_use]
    pub fn join(&self) -> Effect {
        let shared = Arc::clone(&self.shared);
        Effect::async_(move |cb| {
            let shared = Arc::clone(&shared);
            Effect::Delay(Arc::new(move || {
                let deliver = cb.clone();
                shared.register_listener(Box::new(move |outcome| deliver.succeed(val(outcome))));
                val(AsyncRegistration::new(None))
            }))
        })
    }

    /// Non-blocking read of the published outcome, if any.
    #[must_use]
    pub fn outcome(&self) -> Option<Outcome> {
        self.shared.outcome.get().cloned()
    }

    /// The fiber's unique name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// The mask level at which this fiber counts as unmasked.
    #[must_use]
    pub fn init_mask(&self) -> u32 {
        self.shared.init_mask
    }
}

impl std::fmt::Debug for Fiber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fiber")
            .field("name", &self.shared.name)
            .field("outcome", &self.shared.outcome.get())
            .field("suspended", &self.shared.suspended.load(Ordering::Relaxed))
            .finish()
    }
}

/// Unwraps a shared node, cloning only when the tree is actually shared.
fn unwrap_node(node: Arc<Effect>) -> Effect {
    Arc::try_unwrap(node).unwrap_or_else(|shared| (*shared).clone())
}

impl FiberShared {
    /// Runs one resident segment of the interpreter. The caller must hold
    /// the state lock, i.e. own the runloop.
    fn run_loop(self: &Arc<Self>, st: &mut FiberState, entry: Entry) -> Exit {
        let mut step = if self.should_finalize(st) {
            self.begin_cancelation(st)
        } else {
            match entry {
                Entry::Interpret(effect) => Step::Continue(Some(effect)),
                Entry::Succeeded(value) => self.succeeded(st, value, 0),
                Entry::Failed(cause) => self.failed(st, cause, 0),
            }
        };

        let mut fuel: u32 = 0;
        loop {
            let node = match step {
                Step::Continue(node) => node,
                Step::Done => return Exit::Done,
                Step::Suspend => return Exit::Suspended,
                Step::Reschedule(exec, entry) => return Exit::Reschedule(exec, entry),
            };

            if self.should_finalize(st) {
                step = self.begin_cancelation(st);
                continue;
            }

            let Some(node) = node else {
                unreachable!("runloop has no node and no pending cancelation");
            };

            fuel += 1;
            if fuel >= READ_BARRIER_INTERVAL {
                fuel = 0;
                let _ = self.suspended.load(Ordering::Relaxed);
            }

            step = self.dispatch(st, node);
        }
    }

    /// Locks the state and runs a segment; the entry point for every
    /// executor-submitted resumption.
    fn execute(self: &Arc<Self>, entry: Entry) {
        let exit = {
            let mut st = self.state.lock();
            self.run_loop(&mut st, entry)
        };
        if let Exit::Reschedule(exec, entry) = exit {
            self.reschedule(exec, entry);
        }
    }

    fn reschedule(self: &Arc<Self>, exec: Exec, entry: Entry) {
        let fiber = Arc::clone(self);
        if exec.execute(Box::new(move || fiber.execute(entry))).is_err() {
            trace!(fiber = %self.name, "executor rejected resumption; runloop dropped");
        }
    }

    fn should_finalize(&self, st: &FiberState) -> bool {
        self.canceled.load(Ordering::Relaxed) && st.masks == self.init_mask
    }

    fn dispatch(self: &Arc<Self>, st: &mut FiberState, node: Effect) -> Step {
        match node {
            Effect::Pure(value) => self.succeeded(st, value, 0),
            Effect::Delay(thunk) => match catch(|| thunk()) {
                Ok(value) => self.succeeded(st, value, 0),
                Err(cause) => self.failed(st, cause, 0),
            },
            Effect::Error(cause) => self.failed(st, cause, 0),
            Effect::Async(registrar) => {
                let cell = Arc::new(AsyncCell::new());
                st.objects.push(Obj::Async(Arc::clone(&cell)));
                st.conts.push(Cont::Async);
                let callback = AsyncCallback {
                    cell,
                    fiber: Arc::clone(self),
                };
                match catch(|| registrar(callback)) {
                    Ok(effect) => Step::Continue(Some(effect)),
                    Err(cause) => self.failed(st, cause, 0),
                }
            }
            Effect::ReadExecutor => {
                let handle = ExecutorHandle(st.current_ctx.clone());
                self.succeeded(st, val(handle), 0)
            }
            Effect::EvalOn(inner, exec) => {
                st.ctxs.push(Arc::clone(&exec));
                st.current_ctx = Arc::clone(&exec);
                st.conts.push(Cont::EvalOn);
                Step::Reschedule(exec, Entry::Interpret(unwrap_node(inner)))
            }
            Effect::Map(inner, f) => {
                st.objects.push(Obj::Map(f));
                st.conts.push(Cont::Map);
                Step::Continue(Some(unwrap_node(inner)))
            }
            Effect::FlatMap(inner, f) => {
                st.objects.push(Obj::Bind(f));
                st.conts.push(Cont::FlatMap);
                Step::Continue(Some(unwrap_node(inner)))
            }
            Effect::HandleErrorWith(inner, handler) => {
                st.objects.push(Obj::Handler(handler));
                st.conts.push(Cont::HandleErrorWith);
                Step::Continue(Some(unwrap_node(inner)))
            }
            Effect::OnCase(inner, handler) => {
                let registered_ctx = st.current_ctx.clone();
                let finalizer: Finalizer = Arc::new(move |outcome: &Outcome, current: &Exec| {
                    // Handler failures are swallowed; the finalization effect
                    // is pinned to the executor current at registration.
                    let effect = match catch(|| handler(outcome)) {
                        Ok(effect) => effect,
                        Err(_) => Effect::unit(),
                    };
                    if exec_eq(&registered_ctx, current) {
                        effect
                    } else {
                        Effect::EvalOn(Arc::new(effect), registered_ctx.clone())
                    }
                });
                st.finalizers.push(finalizer);
                st.conts.push(Cont::OnCase);
                Step::Continue(Some(unwrap_node(inner)))
            }
            Effect::Uncancelable(body) => {
                st.masks += 1;
                let poll = Poll::new(st.masks);
                st.conts.push(Cont::Uncancelable);
                match catch(|| body(poll)) {
                    Ok(effect) => Step::Continue(Some(effect)),
                    Err(cause) => self.failed(st, cause, 0),
                }
            }
            Effect::Canceled => {
                self.canceled.store(true, Ordering::Relaxed);
                if st.masks == self.init_mask {
                    Step::Continue(None)
                } else {
                    self.succeeded(st, unit_val(), 0)
                }
            }
            Effect::Start(body) => {
                let child = self.spawn_child();
                let exec = st.current_ctx.clone();
                let child_mask = child.init_mask();
                let run_child = child.clone();
                let run_exec = Arc::clone(&exec);
                let effect = unwrap_node(body);
                if exec
                    .execute(Box::new(move || run_child.run(effect, run_exec, child_mask)))
                    .is_err()
                {
                    trace!(fiber = %self.name, "executor rejected child start");
                }
                self.succeeded(st, val(child), 0)
            }
            Effect::RacePair(lhs, rhs) => {
                let node = self.race_pair_node(st.current_ctx.clone(), lhs, rhs);
                Step::Continue(Some(node))
            }
            Effect::Sleep(delay) => {
                let timer = Arc::clone(&self.timer);
                let node = Effect::async_(move |cb| {
                    let timer = Arc::clone(&timer);
                    Effect::Delay(Arc::new(move || {
                        let waker = cb.clone();
                        let handle =
                            timer.sleep(delay, Box::new(move || waker.succeed(unit_val())));
                        val(AsyncRegistration::new(Some(Effect::delay(move || {
                            handle.cancel();
                        }))))
                    }))
                });
                Step::Continue(Some(node))
            }
            Effect::RealTime => {
                let now = self.timer.now_millis();
                self.succeeded(st, val(now), 0)
            }
            Effect::Monotonic => {
                let now = self.timer.monotonic_nanos();
                self.succeeded(st, val(now), 0)
            }
            Effect::Cede => Step::Reschedule(
                st.current_ctx.clone(),
                Entry::Succeeded(unit_val()),
            ),
            Effect::Unmask(inner, mask_id) => {
                if st.masks == mask_id {
                    st.masks -= 1;
                    st.conts.push(Cont::Unmask);
                }
                Step::Continue(Some(unwrap_node(inner)))
            }
        }
    }

    fn succeeded(self: &Arc<Self>, st: &mut FiberState, value: Val, depth: u32) -> Step {
        let Some(cont) = st.conts.pop() else {
            unreachable!("continuation stack underflow");
        };
        match cont {
            Cont::RunTerminus => self.terminus(st, Ok(value)),
            Cont::CancelationLoop => self.cancelation_loop(st),
            Cont::Async => self.async_registered(st, &value),
            Cont::EvalOn => {
                let _ = st.ctxs.pop();
                let Some(restored) = st.ctxs.last().cloned() else {
                    unreachable!("executor stack underflow");
                };
                st.current_ctx = Arc::clone(&restored);
                if self.should_finalize(st) {
                    Step::Continue(None)
                } else {
                    Step::Reschedule(restored, Entry::Succeeded(value))
                }
            }
            Cont::Map => {
                let Some(Obj::Map(f)) = st.objects.pop() else {
                    unreachable!("object stack mismatch under Map");
                };
                match catch(|| f(value)) {
                    Ok(next) => {
                        if depth >= MAX_STACK_DEPTH {
                            Step::Continue(Some(Effect::Pure(next)))
                        } else {
                            self.succeeded(st, next, depth + 1)
                        }
                    }
                    Err(cause) => {
                        if depth >= MAX_STACK_DEPTH {
                            Step::Continue(Some(Effect::Error(cause)))
                        } else {
                            self.failed(st, cause, depth + 1)
                        }
                    }
                }
            }
            Cont::FlatMap => {
                let Some(Obj::Bind(f)) = st.objects.pop() else {
                    unreachable!("object stack mismatch under FlatMap");
                };
                match catch(|| f(value)) {
                    Ok(effect) => Step::Continue(Some(effect)),
                    Err(cause) => {
                        if depth >= MAX_STACK_DEPTH {
                            Step::Continue(Some(Effect::Error(cause)))
                        } else {
                            self.failed(st, cause, depth + 1)
                        }
                    }
                }
            }
            Cont::HandleErrorWith => {
                let Some(Obj::Handler(_)) = st.objects.pop() else {
                    unreachable!("object stack mismatch under HandleErrorWith");
                };
                if depth >= MAX_STACK_DEPTH {
                    Step::Continue(Some(Effect::Pure(value)))
                } else {
                    self.succeeded(st, value, depth + 1)
                }
            }
            Cont::OnCase => {
                let Some(finalizer) = st.finalizers.pop() else {
                    unreachable!("finalizer stack underflow");
                };
                let outcome = Outcome::Completed(value.clone());
                let effect = finalizer(&outcome, &st.current_ctx);
                st.objects.push(Obj::Saved(value));
                st.bools.push(true);
                st.conts.push(Cont::OnCaseForwarder);
                Step::Continue(Some(effect))
            }
            Cont::OnCaseForwarder => self.forward_saved(st, depth),
            Cont::Uncancelable => {
                st.masks -= 1;
                if depth >= MAX_STACK_DEPTH {
                    Step::Continue(Some(Effect::Pure(value)))
                } else {
                    self.succeeded(st, value, depth + 1)
                }
            }
            Cont::Unmask => {
                st.masks += 1;
                if depth >= MAX_STACK_DEPTH {
                    Step::Continue(Some(Effect::Pure(value)))
                } else {
                    self.succeeded(st, value, depth + 1)
                }
            }
        }
    }

    /// Unwinds the continuation stack with a failure, skipping `Map` and
    /// `FlatMap` frames (and their object-stack entries) until a frame that
    /// observes failures is found.
    fn failed(self: &Arc<Self>, st: &mut FiberState, cause: Cause, depth: u32) -> Step {
        let mut cause = cause;
        loop {
            let Some(cont) = st.conts.pop() else {
                unreachable!("continuation stack underflow");
            };
            match cont {
                Cont::Map | Cont::FlatMap => {
                    let _ = st.objects.pop();
                }
                Cont::RunTerminus => return self.terminus(st, Err(cause)),
                Cont::CancelationLoop => {
                    trace!(fiber = %self.name, error = %cause, "finalizer error swallowed");
                    return self.cancelation_loop(st);
                }
                Cont::Async => return self.async_registration_failed(st, cause),
                Cont::EvalOn => {
                    let _ = st.ctxs.pop();
                    let Some(restored) = st.ctxs.last().cloned() else {
                        unreachable!("executor stack underflow");
                    };
                    st.current_ctx = Arc::clone(&restored);
                    return if self.should_finalize(st) {
                        Step::Continue(None)
                    } else {
                        Step::Reschedule(restored, Entry::Failed(cause))
                    };
                }
                Cont::HandleErrorWith => {
                    let Some(Obj::Handler(handler)) = st.objects.pop() else {
                        unreachable!("object stack mismatch under HandleErrorWith");
                    };
                    match catch(|| handler(cause)) {
                        Ok(effect) => return Step::Continue(Some(effect)),
                        // A throwing handler keeps unwinding with its own
                        // failure.
                        Err(next_cause) => cause = next_cause,
                    }
                }
                Cont::OnCase => {
                    let Some(finalizer) = st.finalizers.pop() else {
                        unreachable!("finalizer stack underflow");
                    };
                    let outcome = Outcome::Errored(cause.clone());
                    let effect = finalizer(&outcome, &st.current_ctx);
                    st.objects.push(Obj::SavedCause(cause));
                    st.bools.push(false);
                    st.conts.push(Cont::OnCaseForwarder);
                    return Step::Continue(Some(effect));
                }
                Cont::OnCaseForwarder => {
                    trace!(fiber = %self.name, error = %cause, "finalizer error swallowed");
                    return self.forward_saved(st, depth);
                }
                Cont::Uncancelable => st.masks -= 1,
                Cont::Unmask => st.masks += 1,
            }
        }
    }

    /// Restores the result that was pending while an `OnCase` finalizer ran.
    fn forward_saved(self: &Arc<Self>, st: &mut FiberState, depth: u32) -> Step {
        let Some(success) = st.bools.pop() else {
            unreachable!("boolean stack underflow");
        };
        if success {
            let Some(Obj::Saved(saved)) = st.objects.pop() else {
                unreachable!("object stack mismatch under OnCaseForwarder");
            };
            if depth >= MAX_STACK_DEPTH {
                Step::Continue(Some(Effect::Pure(saved)))
            } else {
                self.succeeded(st, saved, depth + 1)
            }
        } else {
            let Some(Obj::SavedCause(saved)) = st.objects.pop() else {
                unreachable!("object stack mismatch under OnCaseForwarder");
            };
            if depth >= MAX_STACK_DEPTH {
                Step::Continue(Some(Effect::Error(saved)))
            } else {
                self.failed(st, saved, depth + 1)
            }
        }
    }

    /// The registrar's effect completed; arm the async cell or short-circuit
    /// if the callback won.
    fn async_registered(self: &Arc<Self>, st: &mut FiberState, value: &Val) -> Step {
        let Some(Obj::Async(cell)) = st.objects.pop() else {
            unreachable!("object stack mismatch under Async");
        };

        let cancel = match value.downcast_ref::<AsyncRegistration>() {
            Some(registration) => registration.cancel.clone(),
            None => {
                debug!(
                    fiber = %self.name,
                    "registrar produced a non-registration value; no cancel effect"
                );
                None
            }
        };

        let unmasked = st.masks == self.init_mask;
        let with_finalizer = if let (true, Some(cancel_effect)) = (unmasked, cancel) {
            let finalizer: Finalizer = Arc::new(move |outcome: &Outcome, _current: &Exec| {
                if outcome.is_canceled() {
                    cancel_effect.clone()
                } else {
                    Effect::unit()
                }
            });
            st.finalizers.push(finalizer);
            true
        } else {
            false
        };

        if self.should_finalize(st) {
            // The gate claims the fiber; a pushed finalizer cancels the
            // pending operation during finalization.
            return Step::Continue(None);
        }

        let phase = if with_finalizer {
            PHASE_REGISTERED_FIN
        } else {
            PHASE_REGISTERED
        };
        if cell.try_register(phase) {
            self.suspended.store(true, Ordering::Release);
            trace!(fiber = %self.name, "suspended awaiting async callback");
            Step::Suspend
        } else {
            // The callback fired while the registrar ran; resume with its
            // result through the executor.
            if with_finalizer {
                let _ = st.finalizers.pop();
            }
            let Some(result) = cell.delivered() else {
                unreachable!("complete phase without a published result");
            };
            let entry = match result {
                Ok(v) => Entry::Succeeded(v),
                Err(c) => Entry::Failed(c),
            };
            Step::Reschedule(st.current_ctx.clone(), entry)
        }
    }

    /// The registrar's effect failed.
    fn async_registration_failed(self: &Arc<Self>, st: &mut FiberState, cause: Cause) -> Step {
        let Some(Obj::Async(cell)) = st.objects.pop() else {
            unreachable!("object stack mismatch under Async");
        };
        if cell.claim() {
            // No result was or will be delivered; propagate inline.
            Step::Continue(Some(Effect::Error(cause)))
        } else {
            // A result was already delivered. The registrar's failure wins
            // and is rerouted through the executor; the delivered result is
            // dropped without a second resumption.
            Step::Reschedule(st.current_ctx.clone(), Entry::Failed(cause))
        }
    }

    /// Delivery side of the async handshake, called from the callback on an
    /// arbitrary thread once a result has been published.
    pub(crate) fn resume_after_delivery(
        self: &Arc<Self>,
        pop_finalizer: bool,
        result: Result<Val, Cause>,
    ) {
        loop {
            if self
                .suspended
                .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                if self.outcome.get().is_none() {
                    let exec = {
                        let mut st = self.state.lock();
                        if pop_finalizer {
                            let _ = st.finalizers.pop();
                        }
                        st.current_ctx.clone()
                    };
                    let entry = match result {
                        Ok(v) => Entry::Succeeded(v),
                        Err(c) => Entry::Failed(c),
                    };
                    self.reschedule(exec, entry);
                }
                return;
            }
            if self.outcome.get().is_some() {
                // A canceller owns finalization; the result is abandoned.
                return;
            }
            // The fiber is between registration and the suspended store.
            std::hint::spin_loop();
        }
    }

    /// Entered from the gate: publish `Canceled` and start driving
    /// finalizers, unless someone else already published.
    fn begin_cancelation(self: &Arc<Self>, st: &mut FiberState) -> Step {
        if self.outcome.set(Outcome::Canceled).is_err() {
            return Step::Done;
        }
        debug!(fiber = %self.name, "canceled; finalizing");
        self.publish_outcome();
        if st.finalizers.is_empty() {
            self.invalidate(st);
            return Step::Done;
        }
        st.conts.clear();
        st.objects.clear();
        st.bools.clear();
        // Finalizers are not themselves cancelable.
        st.masks += 1;
        self.cancelation_loop(st)
    }

    /// Runs the next finalizer, or invalidates the fiber when none remain.
    fn cancelation_loop(self: &Arc<Self>, st: &mut FiberState) -> Step {
        if let Some(finalizer) = st.finalizers.pop() {
            st.conts.push(Cont::CancelationLoop);
            let effect = finalizer(&Outcome::Canceled, &st.current_ctx);
            Step::Continue(Some(effect))
        } else {
            self.invalidate(st);
            Step::Done
        }
    }

    /// Final frame: publish the program's own result.
    ///
    /// `Canceled` is published only by the gate and by a stealing canceller;
    /// a cancellation that was never revealed at a gate does not void a
    /// completed result.
    fn terminus(self: &Arc<Self>, st: &mut FiberState, result: Result<Val, Cause>) -> Step {
        debug_assert!(st.conts.is_empty(), "frames left below the terminus");
        let outcome = Outcome::from_result(result);
        if self.outcome.set(outcome).is_ok() {
            self.publish_outcome();
        }
        self.invalidate(st);
        Step::Done
    }

    /// Invokes the terminal callback and every joiner with the published
    /// outcome. Panicking observers are swallowed.
    fn publish_outcome(&self) {
        let Some(outcome) = self.outcome.get() else {
            return;
        };
        debug!(fiber = %self.name, outcome = ?outcome, "outcome published");
        if let Some(terminal) = self.terminal.lock().take() {
            if catch(|| terminal(outcome.clone())).is_err() {
                debug!(fiber = %self.name, "terminal callback panicked; swallowed");
            }
        }
        for listener in self.joiners.drain() {
            if catch(|| listener(outcome.clone())).is_err() {
                debug!(fiber = %self.name, "joiner panicked; swallowed");
            }
        }
    }

    /// Installs a joiner, delivering immediately if the fiber already
    /// terminated.
    pub(crate) fn register_listener(&self, listener: Listener) {
        if let Err(listener) = self.joiners.register(listener) {
            if let Some(outcome) = self.outcome.get() {
                listener(outcome.clone());
            }
        }
    }

    /// Raises the cancellation flag and, if the target is suspended, steals
    /// finalization. Returns true if finalization was stolen (or found
    /// nothing to do).
    pub(crate) fn cancel_now(self: &Arc<Self>) -> bool {
        self.canceled.store(true, Ordering::Relaxed);
        if self
            .suspended
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            debug!(fiber = %self.name, "canceller stole finalization");
            let exit = {
                let mut st = self.state.lock();
                match self.begin_cancelation(&mut st) {
                    Step::Continue(Some(effect)) => {
                        self.run_loop(&mut st, Entry::Interpret(effect))
                    }
                    _ => Exit::Done,
                }
            };
            if let Exit::Reschedule(exec, entry) = exit {
                self.reschedule(exec, entry);
            }
            true
        } else {
            false
        }
    }

    fn spawn_child(self: &Arc<Self>) -> Fiber {
        Fiber::with_parts(
            Arc::clone(&self.timer),
            None,
            self.init_mask.wrapping_add(CHILD_MASK_OFFSET),
        )
    }

    /// Reifies a race as an async registration spawning two children.
    fn race_pair_node(self: &Arc<Self>, exec: Exec, lhs: Arc<Effect>, rhs: Arc<Effect>) -> Effect {
        let parent = Arc::clone(self);
        Effect::async_(move |cb| {
            let parent = Arc::clone(&parent);
            let exec = Arc::clone(&exec);
            let lhs = Arc::clone(&lhs);
            let rhs = Arc::clone(&rhs);
            Effect::Delay(Arc::new(move || {
                let fiber_a = parent.spawn_child();
                let fiber_b = parent.spawn_child();
                let first_error: Arc<OnceLock<Cause>> = Arc::new(OnceLock::new());
                let first_canceled = Arc::new(AtomicBool::new(false));

                fiber_a.shared.register_listener(race_listener(
                    RaceSide::Left,
                    cb.clone(),
                    fiber_b.clone(),
                    Arc::clone(&first_error),
                    Arc::clone(&first_canceled),
                    Arc::clone(&parent),
                ));
                fiber_b.shared.register_listener(race_listener(
                    RaceSide::Right,
                    cb.clone(),
                    fiber_a.clone(),
                    Arc::clone(&first_error),
                    Arc::clone(&first_canceled),
                    Arc::clone(&parent),
                ));

                let cancel_both = {
                    let cancel_b = fiber_b.cancel();
                    fiber_a.cancel().flat_map(move |_| cancel_b.clone())
                };

                for (fiber, body) in [(fiber_a, Arc::clone(&lhs)), (fiber_b, Arc::clone(&rhs))] {
                    let mask = fiber.init_mask();
                    let run_exec = Arc::clone(&exec);
                    let effect = (*body).clone();
                    if exec
                        .execute(Box::new(move || fiber.run(effect, run_exec, mask)))
                        .is_err()
                    {
                        trace!(fiber = %parent.name, "executor rejected race child");
                    }
                }

                val(AsyncRegistration::new(Some(cancel_both)))
            }))
        })
    }

    fn invalidate(&self, st: &mut FiberState) {
        st.conts.clear();
        st.objects.clear();
        st.bools.clear();
        st.ctxs.clear();
        st.finalizers.clear();
    }
}

/// The listener installed on each race child. First successful completion
/// wins; errors and cancellations follow the `first_error`/`first_canceled`
/// protocol, and a double cancellation cancels the race itself.
fn race_listener(
    side: RaceSide,
    cb: AsyncCallback,
    other: Fiber,
    first_error: Arc<OnceLock<Cause>>,
    first_canceled: Arc<AtomicBool>,
    parent: Arc<FiberShared>,
) -> Listener {
    Box::new(move |outcome| match outcome {
        Outcome::Completed(value) => {
            let winner = match side {
                RaceSide::Left => RaceWinner::Left(value, other),
                RaceSide::Right => RaceWinner::Right(other, value),
            };
            cb.succeed(val(winner));
        }
        Outcome::Errored(cause) => {
            if first_error.set(cause.clone()).is_ok() {
                if first_canceled.load(Ordering::Acquire) {
                    cb.fail(cause);
                }
            } else {
                // Second error: delivered; the first stays in the cell.
                cb.fail(cause);
            }
        }
        Outcome::Canceled => {
            if first_canceled.swap(true, Ordering::AcqRel) {
                // Both children canceled: cancel the race itself.
                parent.cancel_now();
            } else if let Some(cause) = first_error.get() {
                cb.fail(cause.clone());
            }
        }
    })
}
