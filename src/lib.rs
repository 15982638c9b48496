//! Filament: a cooperative fiber runtime interpreting effect trees.
//!
//! # Overview
//!
//! Filament executes programs described as immutable trees of effect nodes.
//! A [`Fiber`] interprets one such tree on injected capabilities (an
//! [`Executor`] and a [`Timer`]), providing user-space cooperative
//! scheduling, structured cancellation with masking, asynchronous
//! suspension across arbitrary callback boundaries, and composable
//! finalizers.
//!
//! # Core Guarantees
//!
//! - **At-most-once completion**: a fiber publishes exactly one terminal
//!   outcome; every joiner and the terminal callback observe the same one
//! - **Cancel-correctness**: cancellation is cooperative and masked-aware;
//!   at most one party ever drives a fiber's finalizers, and finalizers run
//!   uncancelable, in reverse registration order
//! - **Async one-shot**: across arbitrary races between registration and
//!   callback delivery, a suspension resumes exactly once with the first
//!   result
//! - **Single residency**: the runloop is resident on at most one worker at
//!   any instant; ownership moves only through executor submission or the
//!   suspension handshake
//!
//! # Module Structure
//!
//! - [`effect`]: effect nodes, constructors, and the combinator surface
//! - [`fiber`]: the fiber and its interpreter loop
//! - [`outcome`]: terminal outcomes
//! - [`error`]: the `Cause` failure type and panic capture
//! - [`asyncs`]: the async suspension handshake
//! - [`executor`]: the executor capability and a worker pool
//! - [`timer`]: the timer capability and a heap-based driver
//! - [`lab`]: deterministic executor/timer pair for testing
//! - [`tracing_compat`]: feature-gated structured logging shim

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]

pub mod asyncs;
mod cont;
pub mod effect;
pub mod error;
pub mod executor;
pub mod fiber;
mod joiners;
pub mod lab;
pub mod outcome;
mod stack;
#[cfg(test)]
mod test_utils;
pub mod timer;
pub mod tracing_compat;

// Re-exports for convenient access to core types
pub use asyncs::AsyncCallback;
pub use effect::{unit_val, val, AsyncRegistration, Effect, Poll, Val};
pub use error::{Cause, CauseKind};
pub use executor::{Exec, Executor, ExecutorHandle, RejectedTask, Task, WorkerPool};
pub use fiber::{Fiber, RaceWinner};
pub use lab::{LabRuntime, StepExecutor, VirtualTimer};
pub use outcome::Outcome;
pub use timer::{SleepHandle, Timer, WheelTimer};
