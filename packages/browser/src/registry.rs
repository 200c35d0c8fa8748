//! Central directory of live browser sessions.
//!
//! The registry holds status and metadata only; it never owns the browser
//! contexts themselves. Sessions are registered by the session manager and
//! looked up by the intervention broker and the HTTP surface.

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Browser session status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Paused,
    Closed,
    Timeout,
}

/// A registered session: lookup and status data, not lifecycle ownership.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub status: SessionStatus,
    pub current_url: String,
    /// Remote-viewing URL for manual intervention, when available.
    pub view_url: Option<String>,
    /// Linked intervention if paused.
    pub intervention_id: Option<String>,
    pub user_agent: Option<String>,
    pub viewport: Option<(u32, u32)>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub last_url_update: DateTime<Utc>,
    pub close_reason: Option<String>,
}

impl SessionRecord {
    fn new(session_id: String) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            status: SessionStatus::Active,
            current_url: "about:blank".to_string(),
            view_url: None,
            intervention_id: None,
            user_agent: None,
            viewport: None,
            created_at: now,
            last_activity: now,
            last_url_update: now,
            close_reason: None,
        }
    }

    pub fn is_idle(&self, timeout_minutes: i64) -> bool {
        Utc::now() - self.last_activity > Duration::minutes(timeout_minutes)
    }
}

/// Thread-safe session directory.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, SessionRecord>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session, replacing any stale record under the same id.
    pub fn register(&self, session_id: &str) -> SessionRecord {
        let record = SessionRecord::new(session_id.to_string());
        self.sessions
            .write()
            .insert(session_id.to_string(), record.clone());
        tracing::info!(session_id, "session registered");
        record
    }

    pub fn get(&self, session_id: &str) -> Option<SessionRecord> {
        self.sessions.read().get(session_id).cloned()
    }

    /// Update the current URL, bumping both URL and activity timestamps.
    pub fn update_url(&self, session_id: &str, url: &str) {
        let mut sessions = self.sessions.write();
        if let Some(record) = sessions.get_mut(session_id) {
            record.current_url = url.to_string();
            let now = Utc::now();
            record.last_url_update = now;
            record.last_activity = now;
        }
    }

    /// Record activity without a URL change.
    pub fn touch(&self, session_id: &str) {
        let mut sessions = self.sessions.write();
        if let Some(record) = sessions.get_mut(session_id) {
            record.last_activity = Utc::now();
        }
    }

    /// Attach fingerprint metadata to the record.
    pub fn set_fingerprint(&self, session_id: &str, user_agent: &str, viewport: (u32, u32)) {
        let mut sessions = self.sessions.write();
        if let Some(record) = sessions.get_mut(session_id) {
            record.user_agent = Some(user_agent.to_string());
            record.viewport = Some(viewport);
            record.last_activity = Utc::now();
        }
    }

    pub fn set_view_url(&self, session_id: &str, view_url: &str) {
        let mut sessions = self.sessions.write();
        if let Some(record) = sessions.get_mut(session_id) {
            record.view_url = Some(view_url.to_string());
            record.last_activity = Utc::now();
        }
    }

    /// Pause a session for an intervention.
    pub fn mark_paused(&self, session_id: &str, intervention_id: &str, reason: &str) {
        let mut sessions = self.sessions.write();
        if let Some(record) = sessions.get_mut(session_id) {
            record.status = SessionStatus::Paused;
            record.intervention_id = Some(intervention_id.to_string());
            record.last_activity = Utc::now();
            tracing::info!(session_id, intervention_id, reason, "session paused");
        }
    }

    /// Resume a paused session.
    pub fn mark_resumed(&self, session_id: &str) {
        let mut sessions = self.sessions.write();
        if let Some(record) = sessions.get_mut(session_id) {
            record.status = SessionStatus::Active;
            record.intervention_id = None;
            record.last_activity = Utc::now();
            tracing::info!(session_id, "session resumed");
        }
    }

    /// Close a session, keeping the record for inspection.
    pub fn close(&self, session_id: &str, reason: &str) {
        let mut sessions = self.sessions.write();
        if let Some(record) = sessions.get_mut(session_id) {
            record.status = SessionStatus::Closed;
            record.close_reason = Some(reason.to_string());
            record.last_activity = Utc::now();
            tracing::info!(session_id, reason, "session closed");
        }
    }

    /// Drop the record entirely.
    pub fn remove(&self, session_id: &str) -> Option<SessionRecord> {
        self.sessions.write().remove(session_id)
    }

    pub fn list(&self) -> Vec<SessionRecord> {
        self.sessions.read().values().cloned().collect()
    }

    pub fn by_status(&self, status: SessionStatus) -> Vec<SessionRecord> {
        self.sessions
            .read()
            .values()
            .filter(|r| r.status == status)
            .cloned()
            .collect()
    }

    /// Close sessions idle past the timeout; returns the ids that were closed.
    pub fn cleanup_idle_sessions(&self, timeout_minutes: i64) -> Vec<String> {
        let mut closed = Vec::new();
        let mut sessions = self.sessions.write();
        for record in sessions.values_mut() {
            if record.status == SessionStatus::Active && record.is_idle(timeout_minutes) {
                record.status = SessionStatus::Timeout;
                record.close_reason = Some(format!("idle for over {timeout_minutes} minutes"));
                closed.push(record.session_id.clone());
            }
        }
        if !closed.is_empty() {
            tracing::info!(count = closed.len(), "idle sessions timed out");
        }
        closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_lookup() {
        let registry = SessionRegistry::new();
        registry.register("user1_research");

        let record = registry.get("user1_research").unwrap();
        assert_eq!(record.status, SessionStatus::Active);
        assert_eq!(record.current_url, "about:blank");
    }

    #[test]
    fn test_pause_resume_links_intervention() {
        let registry = SessionRegistry::new();
        registry.register("s1");

        registry.mark_paused("s1", "iv-42", "recaptcha");
        let paused = registry.get("s1").unwrap();
        assert_eq!(paused.status, SessionStatus::Paused);
        assert_eq!(paused.intervention_id.as_deref(), Some("iv-42"));

        registry.mark_resumed("s1");
        let resumed = registry.get("s1").unwrap();
        assert_eq!(resumed.status, SessionStatus::Active);
        assert!(resumed.intervention_id.is_none());
    }

    #[test]
    fn test_update_url_bumps_activity() {
        let registry = SessionRegistry::new();
        registry.register("s1");
        let before = registry.get("s1").unwrap().last_activity;

        registry.update_url("s1", "https://shop.example/laptops");
        let record = registry.get("s1").unwrap();
        assert_eq!(record.current_url, "https://shop.example/laptops");
        assert!(record.last_activity >= before);
    }

    #[test]
    fn test_idle_cleanup_only_touches_stale_sessions() {
        let registry = SessionRegistry::new();
        registry.register("fresh");
        registry.register("stale");

        {
            let mut sessions = registry.sessions.write();
            let record = sessions.get_mut("stale").unwrap();
            record.last_activity = Utc::now() - Duration::minutes(45);
        }

        let closed = registry.cleanup_idle_sessions(30);
        assert_eq!(closed, vec!["stale".to_string()]);
        assert_eq!(registry.get("stale").unwrap().status, SessionStatus::Timeout);
        assert_eq!(registry.get("fresh").unwrap().status, SessionStatus::Active);
    }

    #[test]
    fn test_by_status_filters() {
        let registry = SessionRegistry::new();
        registry.register("a");
        registry.register("b");
        registry.close("b", "done");

        assert_eq!(registry.by_status(SessionStatus::Active).len(), 1);
        assert_eq!(registry.by_status(SessionStatus::Closed).len(), 1);
    }
}
