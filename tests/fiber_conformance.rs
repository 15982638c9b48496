//! Fiber runtime conformance tests.
//!
//! These tests verify the runtime's observable contract end to end: the
//! pure interpretation path, error recovery and propagation, cancellation
//! through masks, finalizer guarantees, race semantics, join consistency,
//! and the async one-shot property. Deterministic cases run on the lab
//! runtime (manual executor + virtual clock); a small threaded section
//! exercises the worker pool and the heap timer for real parallelism.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex, Once};
use std::time::Duration;

use filament::asyncs::AsyncCallback;
use filament::{
    val, Cause, Effect, Exec, ExecutorHandle, Fiber, LabRuntime, Outcome, RaceWinner,
    StepExecutor, Val, WheelTimer, WorkerPool,
};

static INIT_LOGGING: Once = Once::new();

fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .with_ansi(false)
            .try_init();
    });
}

type OutcomeSlot = Arc<Mutex<Option<Outcome>>>;

fn spawn(lab: &LabRuntime, effect: Effect) -> (Fiber, OutcomeSlot) {
    let slot: OutcomeSlot = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&slot);
    let fiber = Fiber::new(
        lab.timer(),
        move |outcome| *sink.lock().expect("slot lock") = Some(outcome),
        0,
    );
    fiber.run(effect, lab.executor(), 0);
    (fiber, slot)
}

fn lab_outcome(lab: &LabRuntime, effect: Effect) -> Outcome {
    let (_, slot) = spawn(lab, effect);
    lab.flush();
    let outcome = slot.lock().expect("slot lock").take();
    outcome.expect("fiber should have terminated")
}

fn taken(slot: &OutcomeSlot) -> Option<Outcome> {
    slot.lock().expect("slot lock").take()
}

fn int(v: &Val) -> i32 {
    *v.downcast_ref::<i32>().expect("i32 value")
}

// ============================================================================
// Scenario: pure path
// ============================================================================

#[test]
fn pure_path_maps_and_binds() {
    init_test_logging();
    let lab = LabRuntime::new();
    let program = Effect::pure(1_i32)
        .map(|v| val(int(&v) + 1))
        .flat_map(|v| Effect::pure(int(&v) * 10));

    let outcome = lab_outcome(&lab, program);
    assert_eq!(outcome.value_as::<i32>(), Some(&20));
}

#[test]
fn map_identity_is_observationally_neutral() {
    init_test_logging();
    let lab = LabRuntime::new();
    let plain = lab_outcome(&lab, Effect::pure(11_i32));
    let mapped = lab_outcome(&lab, Effect::pure(11_i32).map(|v| v));
    assert_eq!(plain.value_as::<i32>(), mapped.value_as::<i32>());
}

#[test]
fn flat_map_pure_is_identity() {
    init_test_logging();
    let lab = LabRuntime::new();
    let bound = lab_outcome(&lab, Effect::pure(11_i32).flat_map(Effect::pure_val));
    assert_eq!(bound.value_as::<i32>(), Some(&11));
}

// ============================================================================
// Scenario: error recovery
// ============================================================================

#[test]
fn handler_recovers_and_absence_propagates() {
    init_test_logging();
    let lab = LabRuntime::new();

    let recovered = lab_outcome(
        &lab,
        Effect::raise(Cause::raised("E")).handle_error_with(|_| Effect::pure(42_i32)),
    );
    assert_eq!(recovered.value_as::<i32>(), Some(&42));

    let unhandled = lab_outcome(&lab, Effect::raise(Cause::raised("E")));
    assert_eq!(unhandled.cause().map(Cause::message), Some("E"));
}

#[test]
fn handler_sees_the_original_cause_through_map_frames() {
    init_test_logging();
    let lab = LabRuntime::new();
    let observed = Arc::new(Mutex::new(None));
    let seen = Arc::clone(&observed);

    let program = Effect::raise(Cause::raised("root"))
        .map(|v| v)
        .flat_map(|_| Effect::pure(0_i32))
        .handle_error_with(move |cause| {
            *seen.lock().expect("seen lock") = Some(cause.message().to_string());
            Effect::pure(1_i32)
        });

    let outcome = lab_outcome(&lab, program);
    assert_eq!(outcome.value_as::<i32>(), Some(&1));
    assert_eq!(observed.lock().expect("seen lock").as_deref(), Some("root"));
}

#[test]
fn panicking_handler_keeps_unwinding_with_its_own_failure() {
    init_test_logging();
    let lab = LabRuntime::new();
    let program = Effect::raise(Cause::raised("first"))
        .handle_error_with(|_| -> Effect { panic!("handler blew up") });
    let outcome = lab_outcome(&lab, program);
    let cause = outcome.cause().expect("errored");
    assert!(cause.is_panic());
    assert_eq!(cause.message(), "handler blew up");
}

// ============================================================================
// Scenario: cancellation through mask
// ============================================================================

#[test]
fn masked_self_cancel_completes_when_never_revealed() {
    init_test_logging();
    let lab = LabRuntime::new();
    let program =
        Effect::uncancelable(|_| Effect::canceled().and_then(Effect::pure(1_i32)));
    let outcome = lab_outcome(&lab, program);
    assert_eq!(outcome.value_as::<i32>(), Some(&1));
}

#[test]
fn polled_self_cancel_cancels() {
    init_test_logging();
    let lab = LabRuntime::new();
    let program = Effect::uncancelable(|poll| {
        poll.apply(Effect::canceled()).and_then(Effect::pure(1_i32))
    });
    assert!(lab_outcome(&lab, program).is_canceled());
}

#[test]
fn deferred_cancel_is_revealed_at_the_next_gate() {
    init_test_logging();
    let lab = LabRuntime::new();
    let ran_after = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&ran_after);

    let program = Effect::uncancelable(|_| Effect::canceled())
        .and_then(Effect::delay(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

    assert!(lab_outcome(&lab, program).is_canceled());
    assert_eq!(ran_after.load(Ordering::SeqCst), 0);
}

#[test]
fn nested_polls_do_not_cross_unmask() {
    init_test_logging();
    let lab = LabRuntime::new();
    // The outer poll applied inside the inner region targets the wrong mask
    // level, so the cancellation stays suppressed until the regions close.
    let program = Effect::uncancelable(|outer| {
        Effect::uncancelable(move |_inner| {
            outer.apply(Effect::canceled()).and_then(Effect::pure(5_i32))
        })
    });
    let outcome = lab_outcome(&lab, program);
    assert_eq!(outcome.value_as::<i32>(), Some(&5));
}

// ============================================================================
// Scenario: finalizer on cancel
// ============================================================================

#[test]
fn external_cancel_runs_the_finalizer_with_canceled() {
    init_test_logging();
    let lab = LabRuntime::new();
    let records = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&records);

    let program = Effect::never().guarantee_case(move |outcome| {
        let canceled = outcome.is_canceled();
        let sink = Arc::clone(&sink);
        Effect::delay(move || sink.lock().expect("records lock").push(canceled))
    });

    let (target, slot) = spawn(&lab, program);
    lab.flush();
    assert!(taken(&slot).is_none(), "target must be suspended");

    let canceller = Fiber::new(lab.timer(), |_| {}, 0);
    canceller.run(target.cancel(), lab.executor(), 0);
    lab.flush();

    assert!(taken(&slot).expect("terminated").is_canceled());
    assert_eq!(*records.lock().expect("records lock"), vec![true]);
    assert!(matches!(target.outcome(), Some(Outcome::Canceled)));
}

#[test]
fn finalizers_run_in_reverse_registration_order() {
    init_test_logging();
    let lab = LabRuntime::new();
    let order = Arc::new(Mutex::new(Vec::new()));

    let record = |label: &'static str, order: &Arc<Mutex<Vec<&'static str>>>| {
        let order = Arc::clone(order);
        move |_: &Outcome| {
            let order = Arc::clone(&order);
            Effect::delay(move || order.lock().expect("order lock").push(label))
        }
    };

    let program = Effect::never()
        .guarantee_case(record("inner", &order))
        .guarantee_case(record("outer", &order));

    let (target, _) = spawn(&lab, program);
    lab.flush();

    let canceller = Fiber::new(lab.timer(), |_| {}, 0);
    canceller.run(target.cancel(), lab.executor(), 0);
    lab.flush();

    assert_eq!(*order.lock().expect("order lock"), vec!["inner", "outer"]);
}

#[test]
fn finalizer_runs_once_on_normal_completion_too() {
    init_test_logging();
    let lab = LabRuntime::new();
    let records = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&records);

    let program = Effect::pure(3_i32).guarantee_case(move |outcome| {
        let completed = outcome.is_completed();
        let sink = Arc::clone(&sink);
        Effect::delay(move || sink.lock().expect("records lock").push(completed))
    });

    let outcome = lab_outcome(&lab, program);
    assert_eq!(outcome.value_as::<i32>(), Some(&3));
    assert_eq!(*records.lock().expect("records lock"), vec![true]);
}

#[test]
fn failing_finalizer_is_swallowed() {
    init_test_logging();
    let lab = LabRuntime::new();
    let program = Effect::pure(4_i32)
        .guarantee_case(|_| Effect::raise(Cause::raised("finalizer failed")));
    let outcome = lab_outcome(&lab, program);
    assert_eq!(outcome.value_as::<i32>(), Some(&4));
}

#[test]
fn canceling_a_sleeper_cancels_the_timer_registration() {
    init_test_logging();
    let lab = LabRuntime::new();
    let program = Effect::sleep(Duration::from_millis(100)).and_then(Effect::pure(1_i32));

    let (target, slot) = spawn(&lab, program);
    lab.flush();

    let canceller = Fiber::new(lab.timer(), |_| {}, 0);
    canceller.run(target.cancel(), lab.executor(), 0);
    lab.flush();
    assert!(taken(&slot).expect("terminated").is_canceled());

    // The timer entry was canceled: advancing past the deadline must not
    // resurrect the fiber.
    lab.advance(Duration::from_millis(200));
    assert!(taken(&slot).is_none());
}

// ============================================================================
// Scenario: race left wins
// ============================================================================

#[test]
fn race_left_wins_and_loser_stays_observable() {
    init_test_logging();
    let lab = LabRuntime::new();
    let program = Effect::race_pair(
        Effect::sleep(Duration::from_millis(10)).and_then(Effect::pure("A")),
        Effect::sleep(Duration::from_millis(100)).and_then(Effect::pure("B")),
    );

    let (_, slot) = spawn(&lab, program);
    lab.flush();
    assert!(taken(&slot).is_none(), "both children still sleeping");

    lab.advance(Duration::from_millis(10));
    let outcome = taken(&slot).expect("race decided");
    let winner = outcome.value_as::<RaceWinner>().expect("race winner");
    let loser = match winner {
        RaceWinner::Left(value, loser) => {
            assert_eq!(value.downcast_ref::<&str>(), Some(&"A"));
            loser.clone()
        }
        RaceWinner::Right(..) => panic!("expected the left side to win"),
    };

    // The loser is still live and can be canceled by the caller.
    assert!(loser.outcome().is_none());
    let canceller = Fiber::new(lab.timer(), |_| {}, 0);
    canceller.run(loser.cancel(), lab.executor(), 0);
    lab.flush();
    assert!(matches!(loser.outcome(), Some(Outcome::Canceled)));
}

#[test]
fn race_second_error_is_delivered() {
    init_test_logging();
    let lab = LabRuntime::new();
    let program = Effect::race_pair(
        Effect::raise(Cause::raised("first")),
        Effect::sleep(Duration::from_millis(10)).and_then(Effect::raise(Cause::raised("second"))),
    );

    let (_, slot) = spawn(&lab, program);
    lab.flush();
    assert!(taken(&slot).is_none(), "first error alone does not decide");

    lab.advance(Duration::from_millis(10));
    let outcome = taken(&slot).expect("race decided");
    assert_eq!(outcome.cause().map(Cause::message), Some("second"));
}

#[test]
fn race_error_after_cancel_is_delivered() {
    init_test_logging();
    let lab = LabRuntime::new();
    let program = Effect::race_pair(
        Effect::canceled(),
        Effect::sleep(Duration::from_millis(10)).and_then(Effect::raise(Cause::raised("E"))),
    );

    let (_, slot) = spawn(&lab, program);
    lab.flush();
    lab.advance(Duration::from_millis(10));

    let outcome = taken(&slot).expect("race decided");
    assert_eq!(outcome.cause().map(Cause::message), Some("E"));
}

#[test]
fn race_with_both_children_canceled_cancels_the_race() {
    init_test_logging();
    let lab = LabRuntime::new();
    let program = Effect::race_pair(Effect::canceled(), Effect::canceled());

    let (_, slot) = spawn(&lab, program);
    lab.flush();
    assert!(taken(&slot).expect("race decided").is_canceled());
}

#[test]
fn race_completes_with_an_immediate_winner() {
    init_test_logging();
    let lab = LabRuntime::new();
    let program = Effect::race_pair(Effect::pure(1_i32), Effect::never());
    let outcome = lab_outcome(&lab, program);
    let winner = outcome.value_as::<RaceWinner>().expect("race winner");
    assert!(matches!(winner, RaceWinner::Left(..)));
}

// ============================================================================
// Scenario: async queue semantics
// ============================================================================

#[test]
fn registrar_failure_after_delivery_wins() {
    init_test_logging();
    let lab = LabRuntime::new();
    let program = Effect::async_(|cb| {
        Effect::delay(move || cb.succeed(val(1_i32)))
            .and_then(Effect::raise(Cause::raised("registrar failed")))
    });

    let outcome = lab_outcome(&lab, program);
    assert_eq!(outcome.cause().map(Cause::message), Some("registrar failed"));
}

#[test]
fn registrar_panic_without_delivery_errors_the_fiber() {
    init_test_logging();
    let lab = LabRuntime::new();
    let program = Effect::async_(|_cb| -> Effect { panic!("registrar exploded") });
    let outcome = lab_outcome(&lab, program);
    assert!(outcome.cause().expect("errored").is_panic());
}

#[test]
fn synchronous_delivery_resumes_without_suspension() {
    init_test_logging();
    let lab = LabRuntime::new();
    let program = Effect::async_(|cb| {
        Effect::delay(move || cb.succeed(val(9_i32))).and_then(Effect::registration(None))
    });
    let outcome = lab_outcome(&lab, program);
    assert_eq!(outcome.value_as::<i32>(), Some(&9));
}

#[test]
fn async_callback_resumes_exactly_once() {
    init_test_logging();
    let lab = LabRuntime::new();
    let parked: Arc<Mutex<Option<AsyncCallback>>> = Arc::new(Mutex::new(None));
    let park = Arc::clone(&parked);

    let program = Effect::async_(move |cb| {
        let park = Arc::clone(&park);
        Effect::delay(move || {
            *park.lock().expect("park lock") = Some(cb.clone());
        })
        .and_then(Effect::registration(None))
    });

    let (_, slot) = spawn(&lab, program);
    lab.flush();
    assert!(taken(&slot).is_none(), "fiber must be suspended");

    let cb = parked
        .lock()
        .expect("park lock")
        .take()
        .expect("callback parked");
    cb.succeed(val(10_i32));
    cb.succeed(val(20_i32));
    lab.flush();

    let outcome = taken(&slot).expect("terminated");
    assert_eq!(outcome.value_as::<i32>(), Some(&10));
}

// ============================================================================
// Invariants: completion and join consistency
// ============================================================================

#[test]
fn terminal_callback_fires_exactly_once_despite_late_cancel() {
    init_test_logging();
    let lab = LabRuntime::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);

    let fiber = Fiber::new(
        lab.timer(),
        move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        },
        0,
    );
    fiber.run(Effect::pure(1_i32), lab.executor(), 0);
    lab.flush();

    let canceller = Fiber::new(lab.timer(), |_| {}, 0);
    canceller.run(fiber.cancel(), lab.executor(), 0);
    lab.flush();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(matches!(fiber.outcome(), Some(Outcome::Completed(_))));
}

#[test]
fn joiners_before_and_after_termination_see_the_same_outcome() {
    init_test_logging();
    let lab = LabRuntime::new();
    let program = Effect::sleep(Duration::from_millis(5)).and_then(Effect::pure(7_i32));
    let (target, _) = spawn(&lab, program);
    lab.flush();

    // Three joiners install while the target sleeps (exercising the
    // single-to-many slot upgrade), one more after termination.
    let mut joiners: Vec<(Fiber, OutcomeSlot)> =
        (0..3).map(|_| spawn(&lab, target.join())).collect();
    lab.flush();

    lab.advance(Duration::from_millis(5));
    joiners.push(spawn(&lab, target.join()));
    lab.flush();

    for (_, slot) in &joiners {
        let outcome = taken(slot).expect("joiner finished");
        let joined = outcome.value_as::<Outcome>().expect("joined outcome");
        assert_eq!(joined.value_as::<i32>(), Some(&7));
    }
}

#[test]
fn canceller_that_loses_the_steal_joins_the_natural_outcome() {
    init_test_logging();
    let lab = LabRuntime::new();
    // The target completes before the canceller runs, so the cancel effect
    // falls back to joining the published outcome.
    let (target, _) = spawn(&lab, Effect::pure(2_i32));
    lab.flush();

    let (canceller, slot) = spawn(&lab, target.cancel());
    let _ = canceller;
    lab.flush();
    assert!(taken(&slot).expect("cancel effect finished").is_completed());
    assert!(matches!(target.outcome(), Some(Outcome::Completed(_))));
}

// ============================================================================
// Executor semantics
// ============================================================================

#[test]
fn eval_on_shifts_and_restores_the_executor() {
    init_test_logging();
    let lab = LabRuntime::new();
    let other = Arc::new(StepExecutor::new());
    let other_exec: Exec = Arc::clone(&other) as Exec;

    let seen: Arc<Mutex<Vec<Exec>>> = Arc::new(Mutex::new(Vec::new()));
    let observe = |seen: &Arc<Mutex<Vec<Exec>>>| {
        let seen = Arc::clone(seen);
        move |v: Val| {
            let handle = v.downcast_ref::<ExecutorHandle>().expect("executor handle");
            seen.lock().expect("seen lock").push(handle.0.clone());
            Effect::unit()
        }
    };

    let program = Effect::read_executor()
        .flat_map(observe(&seen))
        .and_then(
            Effect::read_executor()
                .flat_map(observe(&seen))
                .eval_on(Arc::clone(&other_exec)),
        )
        .and_then(Effect::read_executor().flat_map(observe(&seen)));

    let (fiber, slot) = spawn(&lab, program);
    let _ = fiber;
    while taken(&slot).is_none() {
        let progressed = lab.flush() + other.run_until_idle();
        assert!(progressed > 0, "fiber stalled between executors");
    }

    let seen = seen.lock().expect("seen lock");
    assert_eq!(seen.len(), 3);
    assert!(Arc::ptr_eq(&seen[0], &lab.executor()));
    assert!(Arc::ptr_eq(&seen[1], &other_exec));
    assert!(Arc::ptr_eq(&seen[2], &lab.executor()));
}

// ============================================================================
// Threaded smoke tests (worker pool + wheel timer)
// ============================================================================

#[test]
fn threaded_race_resolves_fast_side() {
    init_test_logging();
    let pool: Exec = Arc::new(WorkerPool::new(4));
    let timer = Arc::new(WheelTimer::new());
    let (tx, rx) = mpsc::channel();

    let fiber = Fiber::new(
        Arc::clone(&timer) as Arc<dyn filament::Timer>,
        move |outcome| {
            let _ = tx.send(outcome);
        },
        0,
    );
    let program = Effect::race_pair(
        Effect::sleep(Duration::from_millis(10)).and_then(Effect::pure("fast")),
        Effect::sleep(Duration::from_millis(400)).and_then(Effect::pure("slow")),
    );
    fiber.run(program, pool, 0);

    let outcome = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("race should resolve");
    let winner = outcome.value_as::<RaceWinner>().expect("race winner");
    match winner {
        RaceWinner::Left(value, _) => assert_eq!(value.downcast_ref::<&str>(), Some(&"fast")),
        RaceWinner::Right(..) => panic!("expected the fast side to win"),
    }
}

#[test]
fn threaded_cancel_finalizes_a_suspended_fiber() {
    init_test_logging();
    let pool: Exec = Arc::new(WorkerPool::new(4));
    let timer: Arc<dyn filament::Timer> = Arc::new(WheelTimer::new());
    let (tx, rx) = mpsc::channel();
    let finalized = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&finalized);

    let target = Fiber::new(
        Arc::clone(&timer),
        move |outcome| {
            let _ = tx.send(outcome);
        },
        0,
    );
    let program = Effect::never().guarantee_case(move |_| {
        let counter = Arc::clone(&counter);
        Effect::delay(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    });
    target.run(program, Arc::clone(&pool), 0);

    let canceller = Fiber::new(timer, |_| {}, 0);
    canceller.run(target.cancel(), pool, 0);

    let outcome = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("cancel should terminate the target");
    assert!(outcome.is_canceled());

    // Publication precedes finalization, so give the finalizer a moment.
    for _ in 0..200 {
        if finalized.load(Ordering::SeqCst) == 1 {
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(finalized.load(Ordering::SeqCst), 1);
}
