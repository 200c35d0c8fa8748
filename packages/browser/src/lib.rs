//! Browser session, recovery and intervention stack.
//!
//! This crate owns the browser process and everything stateful around it:
//!
//! - [`session`] - the session manager: per-(domain, session, user) contexts
//!   with deterministic fingerprints and persisted cookies
//! - [`registry`] - the central directory of live sessions
//! - [`recovery`] - serialized, budgeted recovery of dead sessions
//! - [`intervention`] - the file-backed human-intervention queue
//! - [`blocker`] - blocker classification over page snapshots
//! - [`driver`] - the thin wrapper over the CDP browser
//!
//! Ownership rules: the session manager owns contexts (strong); the registry
//! holds status records only and never participates in context cleanup;
//! interventions hold the session id, never the session itself.

pub mod blocker;
pub mod driver;
pub mod error;
pub mod intervention;
pub mod recovery;
pub mod registry;
pub mod session;

pub use blocker::{detect_blocker, BlockerDetection, BlockerKind, PageSnapshot};
pub use driver::{BrowserProcess, DrivenPage, LaunchOptions, WaitPolicy};
pub use error::{BrowserError, Result};
pub use intervention::{Intervention, InterventionBroker, POLL_INTERVAL, SETTLE_DELAY};
pub use recovery::{RecoveryConfig, RecoveryManager, SessionHealth};
pub use registry::{SessionRecord, SessionRegistry, SessionStatus};
pub use session::{ContextKey, Fingerprint, SessionContext, SessionManager, SessionManagerConfig};
