//! The terminal outcome of a fiber.
//!
//! An [`Outcome`] is published exactly once per fiber and is observed by the
//! terminal callback and by every joiner, before or after termination. The
//! three variants mirror the three exits of the interpreter: normal
//! completion, failure, and cancellation.

use core::fmt;

use crate::effect::Val;
use crate::error::Cause;

/// The terminal state of a fiber. Immutable once published.
#[derive(Clone)]
pub enum Outcome {
    /// The program ran to completion with a value.
    Completed(Val),
    /// The program failed with an unhandled cause.
    Errored(Cause),
    /// The fiber was canceled before completing.
    Canceled,
}

impl Outcome {
    /// Returns true if this outcome is `Completed`.
    #[must_use]
    pub const fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }

    /// Returns true if this outcome is `Errored`.
    #[must_use]
    pub const fn is_errored(&self) -> bool {
        matches!(self, Self::Errored(_))
    }

    /// Returns true if this outcome is `Canceled`.
    #[must_use]
    pub const fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }

    /// Returns the completion value, if any.
    #[must_use]
    pub fn value(&self) -> Option<&Val> {
        match self {
            Self::Completed(v) => Some(v),
            _ => None,
        }
    }

    /// Returns the completion value downcast to `T`, if both apply.
    #[must_use]
    pub fn value_as<T: 'static>(&self) -> Option<&T> {
        self.value().and_then(|v| v.downcast_ref::<T>())
    }

    /// Returns the failure cause, if any.
    #[must_use]
    pub fn cause(&self) -> Option<&Cause> {
        match self {
            Self::Errored(c) => Some(c),
            _ => None,
        }
    }

    /// Builds an outcome from an interpreter result.
    #[must_use]
    pub fn from_result(result: Result<Val, Cause>) -> Self {
        match result {
            Ok(v) => Self::Completed(v),
            Err(c) => Self::Errored(c),
        }
    }
}

impl fmt::Debug for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed(_) => f.write_str("Completed(<value>)"),
            Self::Errored(c) => write!(f, "Errored({c})"),
            Self::Canceled => f.write_str("Canceled"),
        }
    }
}
