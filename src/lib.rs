//! # Python Executor
//!
//! Bounded, observable execution of untrusted Python snippets.
//!
//! ## Architecture
//!
//! A request flows through three layers:
//! - **Server**: accepts `POST /execute?timeout=N` and returns the report text
//! - **Supervisor**: installs call-scoped interception, dispatches the snippet
//!   to a dedicated worker process and waits for it under the deadline
//! - **Runtime**: starts the interpreter with a bootstrap that captures shell
//!   escapes and records uncaught errors as structured traces
//!
//! ## Guarantees
//!
//! - Every call produces exactly one report; snippet failures are report text
//! - A timed-out worker and everything it started is killed before reporting
//! - Interception is restored on every exit path
//! - Failure traces never show supervisor frames or synthetic identities

#![forbid(unsafe_code)]
#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    rust_2018_idioms
)]
#![warn(missing_docs)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod runtime;
pub mod server;
pub mod supervisor;
pub mod trace;
pub mod types;

pub use runtime::{PythonRuntime, SnippetRuntime};
pub use supervisor::{Supervisor, SupervisorConfig, SupervisorError};
pub use trace::TracePolicy;
pub use types::{ExecutionReport, ExecutionRequest, Outcome};

/// Service version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
