//! Test utilities.
//!
//! Shared helpers for unit tests:
//! - Consistent tracing-based logging initialization
//! - Phase/completion macros for readable test output
//! - Outcome assertion macros

use std::sync::Once;

static INIT_LOGGING: Once = Once::new();

/// Initialize test logging with trace-level output.
///
/// Safe to call multiple times; only initializes once.
pub(crate) fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_test_writer()
            .with_target(true)
            .with_thread_ids(true)
            .with_ansi(false)
            .try_init();
    });
}

/// Log a test phase transition with a visual separator.
#[macro_export]
macro_rules! test_phase {
    ($name:expr) => {
        tracing::info!(phase = %$name, "========================================");
        tracing::info!(phase = %$name, "TEST PHASE: {}", $name);
        tracing::info!(phase = %$name, "========================================");
    };
}

/// Log test completion with summary.
#[macro_export]
macro_rules! test_complete {
    ($name:expr) => {
        tracing::info!(test = %$name, "test completed successfully: {}", $name);
    };
}

/// Log before assertions for context.
#[macro_export]
macro_rules! assert_with_log {
    ($cond:expr, $msg:expr, $expected:expr, $actual:expr) => {
        tracing::debug!(
            expected = ?$expected,
            actual = ?$actual,
            "Asserting: {}",
            $msg
        );
        assert!($cond, "{}: expected {:?}, got {:?}", $msg, $expected, $actual);
    };
}

/// Assert that an outcome is `Completed` with a specific typed value.
#[macro_export]
macro_rules! assert_outcome_completed {
    ($outcome:expr, $ty:ty, $expected:expr) => {
        match &$outcome {
            $crate::outcome::Outcome::Completed(v) => {
                assert_eq!(v.downcast_ref::<$ty>(), Some(&$expected));
            }
            other => unreachable!("expected Outcome::Completed({:?}), got {:?}", $expected, other),
        }
    };
}

/// Assert that an outcome is `Errored`.
#[macro_export]
macro_rules! assert_outcome_errored {
    ($outcome:expr) => {
        match &$outcome {
            $crate::outcome::Outcome::Errored(_) => {}
            other => unreachable!("expected Outcome::Errored, got {:?}", other),
        }
    };
}

/// Assert that an outcome is `Canceled`.
#[macro_export]
macro_rules! assert_outcome_canceled {
    ($outcome:expr) => {
        match &$outcome {
            $crate::outcome::Outcome::Canceled => {}
            other => unreachable!("expected Outcome::Canceled, got {:?}", other),
        }
    };
}
