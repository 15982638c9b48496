//! Error types for the fiber runtime.
//!
//! The interpreter carries user failures as a [`Cause`]: either an error
//! raised deliberately through an `Error` node, or a panic captured at one of
//! the user-code boundaries (thunks, mapping functions, error handlers,
//! outcome handlers, async registrars). Causes are cheap to clone so they can
//! flow through continuation frames, finalizers, and joiner callbacks.
//!
//! Panics that unwind are treated as recoverable program errors; aborts and
//! other non-unwinding failures are outside the runtime's jurisdiction.

use core::fmt;
use std::any::Any;
use std::sync::Arc;

/// The kind of failure carried by a [`Cause`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CauseKind {
    /// An error raised explicitly by user code.
    Raised,
    /// A panic captured at a user-code boundary.
    Panic,
}

/// A cloneable failure value: the runtime's "throwable".
#[derive(Clone)]
pub struct Cause {
    kind: CauseKind,
    message: String,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl Cause {
    /// Creates a raised error with the given message.
    #[must_use]
    pub fn raised(message: impl Into<String>) -> Self {
        Self {
            kind: CauseKind::Raised,
            message: message.into(),
            source: None,
        }
    }

    /// Creates a cause from a captured panic payload.
    ///
    /// String payloads (the common case from `panic!`) are extracted; any
    /// other payload type is rendered opaquely.
    #[must_use]
    pub fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "opaque panic payload".to_string()
        };
        Self {
            kind: CauseKind::Panic,
            message,
            source: None,
        }
    }

    /// Adds a source error to the chain.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    /// Returns the kind of this cause.
    #[must_use]
    pub const fn kind(&self) -> CauseKind {
        self.kind
    }

    /// Returns the failure message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns true if this cause was captured from a panic.
    #[must_use]
    pub const fn is_panic(&self) -> bool {
        matches!(self.kind, CauseKind::Panic)
    }
}

impl fmt::Debug for Cause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cause")
            .field("kind", &self.kind)
            .field("message", &self.message)
            .field("source", &self.source.as_ref().map(|s| s.to_string()))
            .finish()
    }
}

impl fmt::Display for Cause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            CauseKind::Raised => write!(f, "{}", self.message),
            CauseKind::Panic => write!(f, "panic: {}", self.message),
        }
    }
}

impl PartialEq for Cause {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.message == other.message
    }
}

impl Eq for Cause {}

impl std::error::Error for Cause {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as _)
    }
}

/// Runs a closure, converting an unwinding panic into a [`Cause`].
///
/// This is the single choke point through which all user code is invoked.
pub(crate) fn catch<T>(f: impl FnOnce() -> T) -> Result<T, Cause> {
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)) {
        Ok(value) => Ok(value),
        Err(payload) => Err(Cause::from_panic(payload.as_ref())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[derive(Debug)]
    struct Underlying;

    impl fmt::Display for Underlying {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "underlying")
        }
    }

    impl std::error::Error for Underlying {}

    #[test]
    fn raised_display_is_bare_message() {
        let cause = Cause::raised("boom");
        assert_eq!(cause.to_string(), "boom");
        assert_eq!(cause.kind(), CauseKind::Raised);
        assert!(!cause.is_panic());
    }

    #[test]
    fn panic_display_is_prefixed() {
        let cause = Cause::from_panic(&"went sideways");
        assert_eq!(cause.to_string(), "panic: went sideways");
        assert!(cause.is_panic());
    }

    #[test]
    fn source_chain_is_exposed() {
        let cause = Cause::raised("outer").with_source(Underlying);
        let source = cause.source().expect("source missing");
        assert_eq!(source.to_string(), "underlying");
    }

    #[test]
    fn catch_converts_str_panics() {
        let result: Result<(), Cause> = catch(|| panic!("bad input"));
        let cause = result.expect_err("expected a cause");
        assert_eq!(cause.kind(), CauseKind::Panic);
        assert_eq!(cause.message(), "bad input");
    }

    #[test]
    fn catch_converts_string_panics() {
        let n = 3;
        let result: Result<(), Cause> = catch(|| panic!("bad input {n}"));
        assert_eq!(result.expect_err("expected a cause").message(), "bad input 3");
    }

    #[test]
    fn catch_passes_values_through() {
        assert_eq!(catch(|| 41 + 1).expect("ok"), 42);
    }

    #[test]
    fn equality_ignores_source() {
        let a = Cause::raised("same").with_source(Underlying);
        let b = Cause::raised("same");
        assert_eq!(a, b);
        assert_ne!(a, Cause::from_panic(&"same"));
    }
}
