//! Error types for parley-core
//!
//! Every failure the core can produce maps to one of these variants, and
//! every variant maps to exactly one bounded user-visible message. Nothing
//! here is allowed to surface as a raw fault: the caller always receives
//! an answer, one clarifying question, or one explicit failure notice.

use thiserror::Error;

/// Core error type
#[derive(Debug, Error)]
pub enum Error {
    /// Router could not reach its confidence threshold
    #[error("routing confidence {confidence:.2} below threshold")]
    LowConfidenceRouting {
        /// Best score reached
        confidence: f32,
    },

    /// Action is valid in principle but disallowed at the current stage
    #[error("action '{action}' is blocked at stage '{stage}'")]
    GateBlocked {
        /// Action that was classified
        action: String,
        /// Stage that blocks it
        stage: String,
    },

    /// Interpreter could not fill one or more required parameters
    #[error("unresolved parameter '{parameter}'")]
    ArgumentUnresolved {
        /// Parameter that could not be resolved
        parameter: String,
        /// The single clarifying question to surface
        question: String,
    },

    /// Snippet execution exceeded its wall-clock budget
    #[error("execution timed out after {budget_ms}ms")]
    ExecutionTimeout {
        /// Budget that was exceeded
        budget_ms: u64,
    },

    /// Snippet referenced a disallowed import or capability
    #[error("restricted capability: {0}")]
    RestrictedCapability(String),

    /// Optimistic version check failed after the bounded retries
    #[error("state version conflict after {attempts} attempts")]
    StateConflict {
        /// Attempts made before giving up
        attempts: u32,
    },

    /// Shared state store unreachable; the only hard failure
    #[error("state store unavailable: {0}")]
    StoreUnavailable(String),

    /// Record not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Operation not valid in the record's current state
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Internal error (serialization, invariant breach)
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Bounded user-facing message for this error.
    ///
    /// This is the only text a chat user ever sees for a failure; it is
    /// never a raw fault and never empty.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Error::LowConfidenceRouting { .. } => {
                "I'm not sure what you'd like to do. Could you rephrase that?".to_string()
            }
            Error::GateBlocked { stage, .. } => format!(
                "That isn't available right now. Let's finish the current step first ({}).",
                stage
            ),
            Error::ArgumentUnresolved { question, .. } => question.clone(),
            Error::ExecutionTimeout { .. } => {
                "That analysis took too long to run. Try a narrower request.".to_string()
            }
            Error::RestrictedCapability(name) => format!(
                "That request needs a capability ('{}') that isn't permitted here.",
                name
            ),
            Error::StateConflict { .. } => {
                "The conversation was updated elsewhere. Please try that again.".to_string()
            }
            Error::StoreUnavailable(_) => {
                "The service is temporarily unavailable. Please try again shortly.".to_string()
            }
            Error::NotFound(what) => format!("I couldn't find {}.", what),
            Error::InvalidState(msg) => msg.clone(),
            Error::Configuration(_) => {
                "The service is misconfigured. Please contact an administrator.".to_string()
            }
            Error::Internal(_) => "Something went wrong on our side. Please try again.".to_string(),
        }
    }
}

impl From<parley_sandbox::Error> for Error {
    fn from(e: parley_sandbox::Error) -> Self {
        use parley_sandbox::Error as SandboxError;
        match e {
            SandboxError::Timeout(ms) => Error::ExecutionTimeout { budget_ms: ms },
            SandboxError::RestrictedImport(name) | SandboxError::RestrictedCapability(name) => {
                Error::RestrictedCapability(name)
            }
            SandboxError::Cancelled => Error::InvalidState("execution cancelled".to_string()),
            SandboxError::OutputRejected(msg)
            | SandboxError::Spawn(msg)
            | SandboxError::Execution(msg) => Error::Internal(msg),
            SandboxError::Io(e) => Error::Internal(e.to_string()),
        }
    }
}
