//! Structured error types for the ecosim workspace.

use std::time::Duration;

use thiserror::Error;

/// Unified error type for all ecosim operations.
#[derive(Debug, Error)]
pub enum EcosimError {
    /// I/O error (file not found, permission denied, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Unparsable bracket (Newick) notation. No partial tree is ever returned.
    #[error("malformed tree at byte {position} near '{token}': {reason}")]
    MalformedTree {
        /// The offending token as it appeared in the input.
        token: String,
        /// Byte offset of the token.
        position: usize,
        /// What the parser expected instead.
        reason: String,
    },

    /// Invalid input (bad arguments, out-of-range values)
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The external oracle exited unsuccessfully or produced an unreadable response.
    #[error("oracle invocation failed: {0}")]
    OracleInvocation(String),

    /// The external oracle did not finish within its allotted time.
    #[error("oracle call {iteration} timed out after {timeout:?}")]
    OracleTimeout {
        /// Iteration tag of the call that hung.
        iteration: usize,
        /// The limit that was exceeded.
        timeout: Duration,
    },

    /// Invalid or unreadable configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Catch-all for other errors
    #[error("{0}")]
    Other(String),
}

impl EcosimError {
    /// Shorthand for a [`EcosimError::MalformedTree`] at `position`.
    pub fn malformed(token: impl Into<String>, position: usize, reason: impl Into<String>) -> Self {
        Self::MalformedTree {
            token: token.into(),
            position,
            reason: reason.into(),
        }
    }
}

/// Convenience alias used throughout the ecosim workspace.
pub type Result<T> = std::result::Result<T, EcosimError>;
