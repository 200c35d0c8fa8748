//! Centralized recovery discipline for dead browser sessions.
//!
//! Connection errors are classified by substring; recovery per session is
//! serialized, budgeted and backed off. A fatal error or a run of
//! consecutive failures escalates to a full browser restart.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{BrowserError, Result};
use crate::session::{ContextKey, SessionContext, SessionManager};

/// Error substrings indicating the page/context/browser connection is gone.
const DEAD_CONNECTION_PATTERNS: &[&str] = &[
    "writeunixstransport closed",
    "handler is closed",
    "target page, context or browser has been closed",
    "target page or context has been closed",
    "browser has been closed",
    "connection refused",
    "target closed",
    "session closed",
    "closed=true",
    "protocol error",
    "execution context was destroyed",
    "page has been closed",
    "context has been closed",
    "browser closed",
    "connection closed",
    "websocket closed",
    "broken pipe",
    "connection reset",
    "no such session",
    "cdp session closed",
];

/// Subset that means the whole browser process is dead, not just one page.
const FATAL_PATTERNS: &[&str] = &[
    "browser has been closed",
    "browser closed",
    "writeunixstransport closed",
    "connection refused",
];

/// Consecutive failures on one session that force a browser restart.
const FATAL_FAILURE_THRESHOLD: u32 = 10;

/// Recovery tuning. The pattern lists are configuration: deployments extend
/// them as new failure strings show up in the field.
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub cooldown: Duration,
    pub dead_patterns: Vec<String>,
    pub fatal_patterns: Vec<String>,
    pub max_history: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
            cooldown: Duration::from_secs(30),
            dead_patterns: DEAD_CONNECTION_PATTERNS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            fatal_patterns: FATAL_PATTERNS.iter().map(|s| s.to_string()).collect(),
            max_history: 100,
        }
    }
}

/// Per-session health bookkeeping.
#[derive(Debug, Clone)]
pub struct SessionHealth {
    pub is_healthy: bool,
    pub consecutive_failures: u32,
    pub recovery_attempts: u32,
    pub last_error: Option<String>,
    pub last_recovery: Option<Instant>,
}

impl Default for SessionHealth {
    fn default() -> Self {
        Self {
            is_healthy: true,
            consecutive_failures: 0,
            recovery_attempts: 0,
            last_error: None,
            last_recovery: None,
        }
    }
}

/// One completed recovery attempt, kept in a bounded history.
#[derive(Debug, Clone)]
pub struct RecoveryAttempt {
    pub session_id: String,
    pub attempt_number: u32,
    pub success: bool,
    pub error: Option<String>,
    pub duration: Duration,
}

/// Serializes and budgets recovery per session.
pub struct RecoveryManager {
    config: RecoveryConfig,
    manager: Arc<SessionManager>,
    health: Mutex<HashMap<String, SessionHealth>>,
    recovering: Mutex<HashSet<String>>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    history: Mutex<VecDeque<RecoveryAttempt>>,
}

impl RecoveryManager {
    pub fn new(config: RecoveryConfig, manager: Arc<SessionManager>) -> Self {
        Self {
            config,
            manager,
            health: Mutex::new(HashMap::new()),
            recovering: Mutex::new(HashSet::new()),
            locks: Mutex::new(HashMap::new()),
            history: Mutex::new(VecDeque::new()),
        }
    }

    /// Does this error message indicate a dead connection?
    pub fn is_connection_error(&self, error: &str) -> bool {
        let lower = error.to_lowercase();
        self.config.dead_patterns.iter().any(|p| lower.contains(p))
    }

    fn is_fatal_error(&self, error: &str) -> bool {
        let lower = error.to_lowercase();
        self.config.fatal_patterns.iter().any(|p| lower.contains(p))
    }

    pub fn is_recovering(&self, session_id: &str) -> bool {
        self.recovering.lock().contains(session_id)
    }

    pub fn health(&self, session_id: &str) -> SessionHealth {
        self.health
            .lock()
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Record a successful operation.
    pub fn mark_healthy(&self, session_id: &str) {
        let mut health = self.health.lock();
        let entry = health.entry(session_id.to_string()).or_default();
        entry.is_healthy = true;
        entry.consecutive_failures = 0;
        entry.last_error = None;
    }

    /// Record a connection failure. A fatal pattern or a run of failures
    /// schedules an asynchronous browser restart and resets the counters.
    pub fn mark_unhealthy(&self, session_id: &str, error: &str) {
        let should_restart = {
            let mut health = self.health.lock();
            let entry = health.entry(session_id.to_string()).or_default();
            entry.is_healthy = false;
            entry.consecutive_failures += 1;
            entry.last_error = Some(error.to_string());

            let fatal =
                self.is_fatal_error(error) || entry.consecutive_failures >= FATAL_FAILURE_THRESHOLD;
            if fatal {
                entry.consecutive_failures = 0;
                entry.recovery_attempts = 0;
            }
            fatal
        };

        tracing::warn!(session_id, error, "session marked unhealthy");

        if should_restart {
            tracing::error!(session_id, "fatal browser failure, scheduling restart");
            let manager = self.manager.clone();
            tokio::spawn(async move {
                if let Err(e) = manager.restart_browser().await {
                    tracing::error!(error = %e, "scheduled browser restart failed");
                }
            });
        }
    }

    /// Whether a recovery attempt is currently allowed, and why not.
    pub fn can_recover(&self, session_id: &str) -> (bool, String) {
        if self.is_recovering(session_id) {
            return (false, "recovery already in progress".to_string());
        }

        let mut health = self.health.lock();
        let entry = health.entry(session_id.to_string()).or_default();

        if entry.recovery_attempts >= self.config.max_attempts {
            // Attempts reset only after an extended cooldown.
            let reset_after = self.config.cooldown * 3;
            match entry.last_recovery {
                Some(last) if last.elapsed() >= reset_after => {
                    entry.recovery_attempts = 0;
                }
                _ => {
                    return (
                        false,
                        format!(
                            "recovery budget exhausted ({} attempts)",
                            self.config.max_attempts
                        ),
                    );
                }
            }
        }

        if let Some(last) = entry.last_recovery {
            if last.elapsed() < self.config.cooldown {
                return (false, "in recovery cooldown".to_string());
            }
        }

        (true, String::new())
    }

    fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        (self.config.initial_backoff * factor).min(self.config.max_backoff)
    }

    fn session_lock(&self, session_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn record_attempt(&self, attempt: RecoveryAttempt) {
        let mut history = self.history.lock();
        history.push_back(attempt);
        while history.len() > self.config.max_history {
            history.pop_front();
        }
    }

    pub fn recent_attempts(&self) -> Vec<RecoveryAttempt> {
        self.history.lock().iter().cloned().collect()
    }

    /// Recover the session: close what is dead, restart the browser if the
    /// process itself is gone, back off, then rebuild the context and probe
    /// it. Serialized per session.
    pub async fn recover_session(&self, key: &ContextKey) -> Result<SessionContext> {
        let lock = self.session_lock(&key.session_id);
        let _guard = lock.lock().await;

        let (allowed, reason) = self.can_recover(&key.session_id);
        if !allowed {
            return Err(BrowserError::Recovery {
                session_id: key.session_id.clone(),
                reason,
            });
        }

        self.recovering.lock().insert(key.session_id.clone());
        let started = Instant::now();

        let attempt_number = {
            let mut health = self.health.lock();
            let entry = health.entry(key.session_id.clone()).or_default();
            entry.recovery_attempts += 1;
            entry.last_recovery = Some(Instant::now());
            entry.recovery_attempts
        };

        tracing::info!(
            session_id = %key.session_id,
            attempt = attempt_number,
            max = self.config.max_attempts,
            "session recovery starting"
        );

        let outcome = self.run_recovery(key, attempt_number).await;

        self.recovering.lock().remove(&key.session_id);
        match &outcome {
            Ok(_) => {
                self.mark_healthy(&key.session_id);
                self.record_attempt(RecoveryAttempt {
                    session_id: key.session_id.clone(),
                    attempt_number,
                    success: true,
                    error: None,
                    duration: started.elapsed(),
                });
                tracing::info!(session_id = %key.session_id, "session recovered");
            }
            Err(e) => {
                self.record_attempt(RecoveryAttempt {
                    session_id: key.session_id.clone(),
                    attempt_number,
                    success: false,
                    error: Some(e.to_string()),
                    duration: started.elapsed(),
                });
                tracing::warn!(session_id = %key.session_id, error = %e, "session recovery failed");
            }
        }
        outcome
    }

    async fn run_recovery(&self, key: &ContextKey, attempt: u32) -> Result<SessionContext> {
        // Drop whatever is left of the dead session.
        self.manager.close_contexts_for_session(&key.session_id).await;
        self.manager
            .registry()
            .close(&key.session_id, "recovery: closing dead session");

        if !self.manager.is_browser_alive().await {
            tracing::warn!(session_id = %key.session_id, "browser dead during recovery, restarting");
            self.manager.restart_browser().await?;
        }

        tokio::time::sleep(self.backoff_for_attempt(attempt)).await;

        let context = self.manager.get_or_create(key).await?;
        if !context.page.health_probe(Duration::from_secs(5)).await {
            return Err(BrowserError::Recovery {
                session_id: key.session_id.clone(),
                reason: "new page failed health probe".to_string(),
            });
        }
        Ok(context)
    }

    /// Run `op` against a live context, recovering and retrying on
    /// connection errors. Non-connection errors surface immediately.
    pub async fn execute_with_recovery<T, F, Fut>(
        &self,
        key: &ContextKey,
        op: F,
        max_retries: u32,
    ) -> Result<T>
    where
        F: Fn(SessionContext) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            let context = self.manager.get_or_create(key).await?;
            match op(context).await {
                Ok(value) => {
                    self.mark_healthy(&key.session_id);
                    return Ok(value);
                }
                Err(e) => {
                    let message = e.to_string();
                    if !self.is_connection_error(&message) {
                        return Err(e);
                    }
                    self.mark_unhealthy(&key.session_id, &message);
                    if attempt >= max_retries {
                        return Err(e);
                    }
                    let (allowed, reason) = self.can_recover(&key.session_id);
                    if !allowed {
                        return Err(BrowserError::Recovery {
                            session_id: key.session_id.clone(),
                            reason,
                        });
                    }
                    self.recover_session(key).await?;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::SessionRegistry;
    use crate::session::SessionManagerConfig;

    fn manager() -> Arc<SessionManager> {
        Arc::new(SessionManager::new(
            SessionManagerConfig::default(),
            Arc::new(SessionRegistry::new()),
        ))
    }

    #[tokio::test]
    async fn test_connection_error_classification() {
        let recovery = RecoveryManager::new(RecoveryConfig::default(), manager());

        assert!(recovery.is_connection_error("Target page or context has been closed"));
        assert!(recovery.is_connection_error("underlying WebSocket closed unexpectedly"));
        assert!(recovery.is_connection_error("Execution context was destroyed by navigation"));
        assert!(!recovery.is_connection_error("selector .price not found"));
        assert!(!recovery.is_connection_error("HTTP 404"));
    }

    #[tokio::test]
    async fn test_backoff_is_capped() {
        let recovery = RecoveryManager::new(RecoveryConfig::default(), manager());

        assert_eq!(recovery.backoff_for_attempt(1), Duration::from_millis(500));
        assert_eq!(recovery.backoff_for_attempt(2), Duration::from_secs(1));
        assert_eq!(recovery.backoff_for_attempt(3), Duration::from_secs(2));
        assert_eq!(recovery.backoff_for_attempt(20), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_can_recover_enforces_budget() {
        let config = RecoveryConfig {
            cooldown: Duration::from_secs(3600),
            ..Default::default()
        };
        let recovery = RecoveryManager::new(config, manager());

        {
            let mut health = recovery.health.lock();
            let entry = health.entry("s1".to_string()).or_default();
            entry.recovery_attempts = 3;
            entry.last_recovery = Some(Instant::now());
        }

        let (allowed, reason) = recovery.can_recover("s1");
        assert!(!allowed);
        assert!(reason.contains("budget"));
    }

    #[tokio::test]
    async fn test_can_recover_enforces_cooldown() {
        let recovery = RecoveryManager::new(RecoveryConfig::default(), manager());
        {
            let mut health = recovery.health.lock();
            let entry = health.entry("s1".to_string()).or_default();
            entry.recovery_attempts = 1;
            entry.last_recovery = Some(Instant::now());
        }

        let (allowed, reason) = recovery.can_recover("s1");
        assert!(!allowed);
        assert!(reason.contains("cooldown"));
    }

    #[tokio::test]
    async fn test_can_recover_blocks_concurrent_recovery() {
        let recovery = RecoveryManager::new(RecoveryConfig::default(), manager());
        recovery.recovering.lock().insert("s1".to_string());

        let (allowed, reason) = recovery.can_recover("s1");
        assert!(!allowed);
        assert!(reason.contains("in progress"));
    }

    #[tokio::test]
    async fn test_mark_unhealthy_tracks_failures() {
        let recovery = RecoveryManager::new(RecoveryConfig::default(), manager());

        recovery.mark_unhealthy("s1", "websocket closed");
        recovery.mark_unhealthy("s1", "websocket closed");
        assert_eq!(recovery.health("s1").consecutive_failures, 2);
        assert!(!recovery.health("s1").is_healthy);

        recovery.mark_healthy("s1");
        assert_eq!(recovery.health("s1").consecutive_failures, 0);
        assert!(recovery.health("s1").is_healthy);
    }

    #[tokio::test]
    async fn test_fatal_error_resets_counters() {
        let recovery = RecoveryManager::new(RecoveryConfig::default(), manager());

        recovery.mark_unhealthy("s1", "selector timeout, websocket closed");
        assert_eq!(recovery.health("s1").consecutive_failures, 1);

        // Fatal substring: counters reset for the post-restart world.
        recovery.mark_unhealthy("s1", "browser has been closed");
        assert_eq!(recovery.health("s1").consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let config = RecoveryConfig {
            max_history: 5,
            ..Default::default()
        };
        let recovery = RecoveryManager::new(config, manager());

        for i in 0..20 {
            recovery.record_attempt(RecoveryAttempt {
                session_id: format!("s{i}"),
                attempt_number: 1,
                success: false,
                error: None,
                duration: Duration::from_millis(1),
            });
        }
        assert_eq!(recovery.recent_attempts().len(), 5);
        assert_eq!(recovery.recent_attempts()[0].session_id, "s15");
    }
}
