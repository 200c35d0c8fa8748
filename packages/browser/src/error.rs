//! Typed errors for the browser stack.

use thiserror::Error;

/// Errors from browser, session and intervention operations.
#[derive(Debug, Error)]
pub enum BrowserError {
    /// The browser process could not be launched or has gone away.
    #[error("browser unavailable: {0}")]
    Unavailable(String),

    /// CDP protocol failure.
    #[error("browser protocol error: {0}")]
    Cdp(#[from] chromiumoxide::error::CdpError),

    /// Session is unknown to the manager or registry.
    #[error("unknown session: {session_id}")]
    UnknownSession { session_id: String },

    /// Recovery was attempted but refused or failed.
    #[error("recovery failed for {session_id}: {reason}")]
    Recovery { session_id: String, reason: String },

    /// Intervention queue file is locked by another process.
    #[error("intervention queue busy")]
    QueueBusy,

    /// Intervention id not found in memory or on disk.
    #[error("unknown intervention: {id}")]
    UnknownIntervention { id: String },

    /// Filesystem failure for persisted session or queue state.
    #[error("state io error: {0}")]
    Io(#[from] std::io::Error),

    /// Persisted state could not be decoded.
    #[error("state decode error: {0}")]
    Decode(#[from] serde_json::Error),

    /// Navigation produced no usable page.
    #[error("navigation failed: {url}: {reason}")]
    Navigation { url: String, reason: String },
}

/// Result type alias for browser operations.
pub type Result<T> = std::result::Result<T, BrowserError>;
