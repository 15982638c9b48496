//! Tracing compatibility layer for structured logging.
//!
//! This module provides a unified interface for tracing that works whether
//! or not the `tracing-integration` feature is enabled:
//!
//! - **With the feature**: re-exports the event macros from the `tracing`
//!   crate.
//! - **Without it**: no-op macros that compile to nothing, for zero runtime
//!   overhead in the interpreter.
//!
//! # Usage
//!
//! ```rust,ignore
//! use filament::tracing_compat::{debug, trace};
//!
//! debug!(fiber = %name, "fiber seeded");
//! trace!("suspended awaiting async callback");
//! ```
//!
//! # Feature Flag
//!
//! Enable tracing by adding the feature to your `Cargo.toml`:
//!
//! ```toml
//! filament = { version = "0.1", features = ["tracing-integration"] }
//! ```

#[cfg(feature = "tracing-integration")]
pub use tracing::{debug, error, info, trace, warn};

// When tracing is disabled, provide no-op macros
#[cfg(not(feature = "tracing-integration"))]
mod noop {
    //! No-op implementations when tracing is disabled.
    //!
    //! These macros expand to nothing, ensuring zero compile-time and
    //! runtime cost.

    /// No-op trace-level logging macro.
    #[macro_export]
    macro_rules! trace {
        ($($arg:tt)*) => {};
    }

    /// No-op debug-level logging macro.
    #[macro_export]
    macro_rules! debug {
        ($($arg:tt)*) => {};
    }

    /// No-op info-level logging macro.
    #[macro_export]
    macro_rules! info {
        ($($arg:tt)*) => {};
    }

    /// No-op warn-level logging macro.
    #[macro_export]
    macro_rules! warn {
        ($($arg:tt)*) => {};
    }

    /// No-op error-level logging macro.
    #[macro_export]
    macro_rules! error {
        ($($arg:tt)*) => {};
    }

    // Re-export the macros at module level
    pub use crate::{debug, error, info, trace, warn};
}

#[cfg(not(feature = "tracing-integration"))]
pub use noop::*;
