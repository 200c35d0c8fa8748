//! Human-intervention broker.
//!
//! Interventions are durable records describing a blocker plus the page
//! state, awaiting a human. The durable side is a JSON array at
//! `shared_state/captcha_queue.json`, mutated read-modify-write under an
//! exclusive file lock so gateway and worker processes can share it. The
//! in-memory side serves same-process waiters. Cross-process notification is
//! polling: resolution removes the record from the file, and any process
//! watching the file observes the removal within one poll interval.

use chrono::{DateTime, Utc};
use fs2::FileExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use crate::blocker::BlockerKind;
use crate::error::{BrowserError, Result};
use crate::registry::SessionRegistry;

/// How often cross-process waiters re-read the queue file.
pub const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Delay after a successful resolution before navigation resumes.
pub const SETTLE_DELAY: Duration = Duration::from_secs(5);

/// Bounded attempts to take the queue file lock before giving up.
const LOCK_ATTEMPTS: u32 = 3;
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(100);

/// A durable intervention record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Intervention {
    pub id: String,
    pub kind: BlockerKind,
    pub url: String,
    pub domain: String,
    pub session_id: String,
    #[serde(default)]
    pub screenshot_path: Option<String>,
    /// Remote-viewing URL for the human resolver.
    #[serde(default)]
    pub view_url: Option<String>,
    #[serde(default)]
    pub details: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub resolved: bool,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub skip_reason: Option<String>,
    #[serde(default)]
    pub captured_cookies: Option<serde_json::Value>,
}

impl Intervention {
    /// Terminal means a resolution outcome has been recorded.
    pub fn is_terminal(&self) -> bool {
        self.resolved
    }

    /// A terminal record counts as successful when it was resolved without a
    /// skip.
    pub fn is_success(&self) -> bool {
        self.resolved && self.success.unwrap_or(false) && self.skip_reason.is_none()
    }
}

/// File-backed broker with in-memory waiters.
pub struct InterventionBroker {
    queue_path: PathBuf,
    lock_path: PathBuf,
    view_url_base: Option<String>,
    registry: Arc<SessionRegistry>,
    records: Mutex<HashMap<String, Intervention>>,
    notifiers: Mutex<HashMap<String, Arc<Notify>>>,
    poll_interval: Duration,
}

impl InterventionBroker {
    /// Create a broker over the given queue file.
    ///
    /// `view_url_base` comes from `NOVNC_URL` and is attached to every new
    /// intervention so the resolver UI can open the live browser.
    pub fn new(
        queue_path: impl Into<PathBuf>,
        view_url_base: Option<String>,
        registry: Arc<SessionRegistry>,
    ) -> Self {
        let queue_path = queue_path.into();
        let lock_path = queue_path.with_extension("lock");
        Self {
            queue_path,
            lock_path,
            view_url_base,
            registry,
            records: Mutex::new(HashMap::new()),
            notifiers: Mutex::new(HashMap::new()),
            poll_interval: POLL_INTERVAL,
        }
    }

    /// Override the poll cadence (tests).
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn queue_path(&self) -> &Path {
        &self.queue_path
    }

    /// Create, persist and register a new intervention; pauses the session.
    pub fn request_intervention(
        &self,
        kind: BlockerKind,
        url: &str,
        screenshot_path: Option<String>,
        session_id: &str,
        details: Option<serde_json::Value>,
    ) -> Result<Intervention> {
        let domain = url::Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.trim_start_matches("www.").to_string()))
            .unwrap_or_default();

        let intervention = Intervention {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            url: url.to_string(),
            domain,
            session_id: session_id.to_string(),
            screenshot_path,
            view_url: self.view_url_base.clone(),
            details,
            created_at: Utc::now(),
            resolved: false,
            resolved_at: None,
            success: None,
            skip_reason: None,
            captured_cookies: None,
        };

        self.with_queue_file(|queue| {
            queue.push(intervention.clone());
        })?;

        self.records
            .lock()
            .insert(intervention.id.clone(), intervention.clone());
        self.notifier_for(&intervention.id);

        self.registry
            .mark_paused(session_id, &intervention.id, kind.as_str());

        tracing::warn!(
            id = %intervention.id,
            kind = kind.as_str(),
            url = %intervention.url,
            session_id,
            "intervention requested"
        );

        Ok(intervention)
    }

    /// Look up by id: memory first, then the queue file.
    pub fn get(&self, id: &str) -> Option<Intervention> {
        if let Some(record) = self.records.lock().get(id).cloned() {
            return Some(record);
        }
        let from_file = self
            .read_queue()
            .ok()?
            .into_iter()
            .find(|record| record.id == id)?;
        self.records
            .lock()
            .insert(from_file.id.clone(), from_file.clone());
        Some(from_file)
    }

    /// All unresolved interventions, merged across memory and file.
    pub fn list_pending(&self) -> Vec<Intervention> {
        let mut by_id: HashMap<String, Intervention> = HashMap::new();
        if let Ok(queue) = self.read_queue() {
            for record in queue {
                by_id.insert(record.id.clone(), record);
            }
        }
        for record in self.records.lock().values() {
            if !record.is_terminal() {
                by_id.entry(record.id.clone()).or_insert_with(|| record.clone());
            }
        }
        let mut pending: Vec<_> = by_id.into_values().filter(|r| !r.is_terminal()).collect();
        pending.sort_by_key(|r| r.created_at);
        pending
    }

    /// Resolve an intervention. Idempotent: re-resolving a terminal record
    /// returns its existing state and does not touch the queue file again.
    pub fn resolve(&self, id: &str, success: bool, skip_reason: Option<String>) -> Result<Intervention> {
        {
            let records = self.records.lock();
            if let Some(existing) = records.get(id) {
                if existing.is_terminal() {
                    return Ok(existing.clone());
                }
            }
        }

        let mut record = self
            .get(id)
            .ok_or_else(|| BrowserError::UnknownIntervention { id: id.to_string() })?;

        record.resolved = true;
        record.resolved_at = Some(Utc::now());
        record.success = Some(success);
        record.skip_reason = skip_reason;

        self.with_queue_file(|queue| {
            queue.retain(|entry| entry.id != id);
        })?;

        self.records.lock().insert(id.to_string(), record.clone());
        self.notifier_for(id).notify_waiters();

        if record.is_success() {
            self.registry.mark_resumed(&record.session_id);
        } else {
            self.registry
                .close(&record.session_id, "intervention skipped or failed");
        }

        tracing::info!(id, success, "intervention resolved");
        Ok(record)
    }

    /// Wait until the intervention reaches a terminal state.
    ///
    /// Local resolutions wake the waiter immediately; resolutions from other
    /// processes are observed by polling the queue file. Returns `true` only
    /// for a successful (non-skip) resolution within the timeout.
    pub async fn wait_for_resolution(&self, id: &str, timeout: Duration) -> bool {
        let notify = self.notifier_for(id);
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if let Some(record) = self.records.lock().get(id) {
                if record.is_terminal() {
                    return record.is_success();
                }
            }

            // Removal from the file means another process resolved it.
            match self.read_queue() {
                Ok(queue) if !queue.iter().any(|record| record.id == id) => {
                    let records = self.records.lock();
                    return match records.get(id) {
                        Some(record) if record.is_terminal() => record.is_success(),
                        // No local state: the resolving process removed it,
                        // which only happens on resolve.
                        _ => true,
                    };
                }
                _ => {}
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                tracing::warn!(id, "intervention wait timed out");
                return false;
            }
            let sleep_for = self.poll_interval.min(deadline - now);
            tokio::select! {
                _ = notify.notified() => {}
                _ = tokio::time::sleep(sleep_for) => {}
            }
        }
    }

    fn notifier_for(&self, id: &str) -> Arc<Notify> {
        self.notifiers
            .lock()
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    /// Read the queue without taking the write lock.
    fn read_queue(&self) -> Result<Vec<Intervention>> {
        match std::fs::read_to_string(&self.queue_path) {
            Ok(body) if !body.trim().is_empty() => Ok(serde_json::from_str(&body)?),
            Ok(_) => Ok(Vec::new()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Read-modify-write of the queue file under the exclusive lock.
    fn with_queue_file(&self, mutate: impl FnOnce(&mut Vec<Intervention>)) -> Result<()> {
        if let Some(parent) = self.queue_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let lock_file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&self.lock_path)?;
        Self::lock_with_retries(&lock_file)?;

        let result = (|| -> Result<()> {
            let mut queue = self.read_queue()?;
            mutate(&mut queue);
            let tmp_path = self.queue_path.with_extension("tmp");
            std::fs::write(&tmp_path, serde_json::to_string_pretty(&queue)?)?;
            std::fs::rename(&tmp_path, &self.queue_path)?;
            Ok(())
        })();

        let _ = lock_file.unlock();
        result
    }

    fn lock_with_retries(lock_file: &File) -> Result<()> {
        for attempt in 0..LOCK_ATTEMPTS {
            match lock_file.try_lock_exclusive() {
                Ok(()) => return Ok(()),
                Err(_) if attempt + 1 < LOCK_ATTEMPTS => {
                    std::thread::sleep(LOCK_RETRY_DELAY);
                }
                Err(_) => break,
            }
        }
        Err(BrowserError::QueueBusy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn broker(dir: &Path) -> InterventionBroker {
        InterventionBroker::new(
            dir.join("captcha_queue.json"),
            Some("http://localhost:6080/vnc_lite.html".to_string()),
            Arc::new(SessionRegistry::new()),
        )
        .with_poll_interval(Duration::from_millis(20))
    }

    #[tokio::test]
    async fn test_request_persists_to_queue_file() {
        let dir = tempfile::tempdir().unwrap();
        let broker = broker(dir.path());

        let iv = broker
            .request_intervention(
                BlockerKind::Recaptcha,
                "https://www.google.com/sorry/index",
                None,
                "s1",
                None,
            )
            .unwrap();

        assert_eq!(iv.domain, "google.com");
        let body = std::fs::read_to_string(broker.queue_path()).unwrap();
        let queue: Vec<Intervention> = serde_json::from_str(&body).unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].id, iv.id);
    }

    #[tokio::test]
    async fn test_resolve_removes_from_file_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let broker = broker(dir.path());

        let iv = broker
            .request_intervention(BlockerKind::Cloudflare, "https://shop.example/x", None, "s1", None)
            .unwrap();

        let first = broker.resolve(&iv.id, true, None).unwrap();
        assert!(first.is_success());

        let queue: Vec<Intervention> =
            serde_json::from_str(&std::fs::read_to_string(broker.queue_path()).unwrap()).unwrap();
        assert!(queue.is_empty());

        // Second resolve observes the same terminal state and never re-adds.
        let second = broker.resolve(&iv.id, true, None).unwrap();
        assert!(second.is_success());
        let queue: Vec<Intervention> =
            serde_json::from_str(&std::fs::read_to_string(broker.queue_path()).unwrap()).unwrap();
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_wait_returns_true_after_local_resolve() {
        let dir = tempfile::tempdir().unwrap();
        let broker = Arc::new(broker(dir.path()));

        let iv = broker
            .request_intervention(BlockerKind::Recaptcha, "https://shop.example/x", None, "s1", None)
            .unwrap();

        let waiter = {
            let broker = broker.clone();
            let id = iv.id.clone();
            tokio::spawn(async move { broker.wait_for_resolution(&id, Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        broker.resolve(&iv.id, true, None).unwrap();

        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_wait_returns_false_on_skip() {
        let dir = tempfile::tempdir().unwrap();
        let broker = broker(dir.path());

        let iv = broker
            .request_intervention(BlockerKind::RateLimit, "https://shop.example/x", None, "s1", None)
            .unwrap();
        broker
            .resolve(&iv.id, false, Some("operator skipped".to_string()))
            .unwrap();

        assert!(!broker.wait_for_resolution(&iv.id, Duration::from_millis(200)).await);
    }

    #[tokio::test]
    async fn test_wait_observes_cross_process_removal() {
        let dir = tempfile::tempdir().unwrap();
        let broker_a = broker(dir.path());
        let iv = broker_a
            .request_intervention(BlockerKind::Hcaptcha, "https://shop.example/x", None, "s1", None)
            .unwrap();

        // A second broker over the same file, as another process would hold.
        let broker_b = broker(dir.path());
        assert_eq!(broker_b.list_pending().len(), 1);

        broker_b.resolve(&iv.id, true, None).unwrap();

        // broker_a has no terminal memory state; the removal is the signal.
        assert!(broker_a.wait_for_resolution(&iv.id, Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn test_wait_times_out_on_unresolved() {
        let dir = tempfile::tempdir().unwrap();
        let broker = broker(dir.path());
        let iv = broker
            .request_intervention(BlockerKind::Recaptcha, "https://shop.example/x", None, "s1", None)
            .unwrap();

        assert!(!broker.wait_for_resolution(&iv.id, Duration::from_millis(100)).await);
    }

    #[tokio::test]
    async fn test_registry_pause_and_resume_linkage() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(SessionRegistry::new());
        registry.register("s1");
        let broker = InterventionBroker::new(
            dir.path().join("captcha_queue.json"),
            None,
            registry.clone(),
        );

        let iv = broker
            .request_intervention(BlockerKind::Recaptcha, "https://shop.example/x", None, "s1", None)
            .unwrap();
        assert_eq!(
            registry.get("s1").unwrap().intervention_id.as_deref(),
            Some(iv.id.as_str())
        );

        broker.resolve(&iv.id, true, None).unwrap();
        assert_eq!(
            registry.get("s1").unwrap().status,
            crate::registry::SessionStatus::Active
        );
    }
}
