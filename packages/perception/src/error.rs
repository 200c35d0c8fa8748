//! Typed errors for the perception pipeline.

use thiserror::Error;

/// Errors that can occur during extraction operations.
#[derive(Debug, Error)]
pub enum PerceptionError {
    /// Browser operation failed underneath an extractor.
    #[error("browser error: {0}")]
    Browser(#[from] browser::BrowserError),

    /// Solver call failed.
    #[error("solver error: {0}")]
    Solver(#[from] solver_client::SolverError),

    /// OCR engine failed or is unavailable.
    #[error("ocr error: {0}")]
    Ocr(String),

    /// Persistent store (schemas, rejection patterns) failed.
    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),

    /// A persisted record could not be decoded.
    #[error("store decode error: {0}")]
    Decode(#[from] serde_json::Error),

    /// Extraction produced nothing usable and the caller should downshift.
    #[error("extraction failed: {reason}")]
    ExtractionFailed { reason: String },
}

/// Result type alias for perception operations.
pub type Result<T> = std::result::Result<T, PerceptionError>;
