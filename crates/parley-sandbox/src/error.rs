//! Error types for parley-sandbox

use thiserror::Error;

/// Sandbox error type
#[derive(Debug, Error)]
pub enum Error {
    /// Hard wall-clock budget exceeded; the child process was killed
    #[error("execution timed out after {0}ms")]
    Timeout(u64),

    /// Snippet referenced a module outside the allow-list
    #[error("restricted import: {0}")]
    RestrictedImport(String),

    /// Snippet referenced a banned capability (filesystem, network, eval)
    #[error("restricted capability: {0}")]
    RestrictedCapability(String),

    /// Snippet output failed validation (oversized or not decodable)
    #[error("output rejected: {0}")]
    OutputRejected(String),

    /// Execution was cancelled by the caller
    #[error("execution cancelled")]
    Cancelled,

    /// Interpreter process could not be started
    #[error("spawn failed: {0}")]
    Spawn(String),

    /// Snippet exited with a non-zero status
    #[error("execution failed: {0}")]
    Execution(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
