//! Typed errors for solver calls.

use thiserror::Error;

/// Errors that can occur when talking to the solver endpoint.
#[derive(Debug, Error)]
pub enum SolverError {
    /// HTTP transport failed
    #[error("solver request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Endpoint returned a non-success status
    #[error("solver returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// Response body did not match the completion contract
    #[error("malformed solver response: {0}")]
    Malformed(String),

    /// Recipe file missing or unreadable
    #[error("recipe not found: {name}")]
    RecipeNotFound { name: String },

    /// Configuration missing
    #[error("solver config error: {0}")]
    Config(String),
}

/// Result type alias for solver operations.
pub type Result<T> = std::result::Result<T, SolverError>;
