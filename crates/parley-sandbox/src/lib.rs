//! Parley Sandbox - bounded snippet execution
//!
//! This crate runs user-triggered data-analysis snippets under strict
//! limits:
//! - Import allow-listing, enforced by a static scan before any process
//!   is spawned
//! - A hard wall-clock budget, after which the interpreter process is
//!   forcibly killed
//! - A scrubbed environment and no filesystem/network capabilities beyond
//!   the injected parameter bindings
//! - Output validation (size cap, JSON decoding) before results are handed
//!   back to the caller

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod executor;
pub mod job;
pub mod scan;

pub use error::{Error, Result};
pub use executor::{RunOutput, SandboxConfig, SandboxExecutor};
pub use job::{ExecutionJob, DEFAULT_ALLOWED_IMPORTS, DEFAULT_MAX_OUTPUT_BYTES, DEFAULT_TIMEOUT};
pub use scan::ImportScanner;
