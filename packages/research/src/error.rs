//! Typed errors for research orchestration.

use thiserror::Error;

/// Errors that end a research hop or the whole request.
#[derive(Debug, Error)]
pub enum ResearchError {
    /// Browser stack failure.
    #[error("browser error: {0}")]
    Browser(#[from] browser::BrowserError),

    /// Extraction pipeline failure.
    #[error("perception error: {0}")]
    Perception(#[from] perception::PerceptionError),

    /// Solver failure.
    #[error("solver error: {0}")]
    Solver(#[from] solver_client::SolverError),

    /// All fetch transports failed.
    #[error("fetch failed for {url}: {summary}")]
    FetchFailed { url: String, summary: String },

    /// Blocked and the human intervention timed out.
    #[error("blocked at {url}, intervention timed out")]
    InterventionTimedOut { url: String },

    /// Every search engine in the chain failed or was blocked.
    #[error("all search engines failed for query: {query}")]
    SearchFailed { query: String },

    /// The request was cancelled.
    #[error("research cancelled")]
    Cancelled,

    /// Filesystem failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for research operations.
pub type Result<T> = std::result::Result<T, ResearchError>;
