//! Browser session manager.
//!
//! Owns the single long-lived browser process and hands out per
//! `(domain, session, user)` contexts with deterministic fingerprints and
//! cookie persistence under `shared_state/crawler_sessions/`.

use chromiumoxide::cdp::browser_protocol::browser::BrowserContextId;
use chromiumoxide::cdp::browser_protocol::network::CookieParam;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::driver::{BrowserProcess, DrivenPage, LaunchOptions};
use crate::error::{BrowserError, Result};
use crate::registry::SessionRegistry;

const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/130.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/130.0.0.0 Safari/537.36",
];

const VIEWPORTS: &[(u32, u32)] = &[
    (1920, 1080),
    (1366, 768),
    (1536, 864),
    (1440, 900),
    (1280, 720),
];

const TIMEZONES: &[&str] = &[
    "America/New_York",
    "America/Chicago",
    "America/Denver",
    "America/Los_Angeles",
];

const LOCALES: &[&str] = &["en-US"];

/// Identity of one browser context.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContextKey {
    pub domain: String,
    pub session_id: String,
    pub user_id: String,
}

impl ContextKey {
    pub fn new(
        domain: impl Into<String>,
        session_id: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            domain: domain.into(),
            session_id: session_id.into(),
            user_id: user_id.into(),
        }
    }

    /// Filesystem-safe name for the domain directory.
    pub fn domain_key(&self) -> String {
        self.domain
            .trim_start_matches("www.")
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                    c.to_ascii_lowercase()
                } else {
                    '_'
                }
            })
            .collect()
    }

    fn map_key(&self) -> String {
        format!("{}|{}|{}", self.domain, self.session_id, self.user_id)
    }
}

/// Deterministic per-(user, session) browser fingerprint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Fingerprint {
    pub user_agent: String,
    pub viewport: (u32, u32),
    pub timezone: String,
    pub locale: String,
}

impl Fingerprint {
    /// Derive from `sha256(user_id:session_id)`; stable across restarts so a
    /// rehydrated session presents the same identity to the site.
    pub fn derive(user_id: &str, session_id: &str) -> Self {
        let digest = Sha256::digest(format!("{user_id}:{session_id}").as_bytes());
        Self {
            user_agent: USER_AGENTS[digest[0] as usize % USER_AGENTS.len()].to_string(),
            viewport: VIEWPORTS[digest[1] as usize % VIEWPORTS.len()],
            timezone: TIMEZONES[digest[2] as usize % TIMEZONES.len()].to_string(),
            locale: LOCALES[digest[3] as usize % LOCALES.len()].to_string(),
        }
    }
}

/// Persisted cookie/storage snapshot.
#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedState {
    #[serde(default)]
    cookies: Vec<CookieParam>,
}

const METADATA_VERSION: u32 = 1;

/// Persisted session metadata, versioned for forward migration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetadata {
    #[serde(default)]
    pub version: u32,
    pub fingerprint: Fingerprint,
    pub created_at: DateTime<Utc>,
    pub last_saved: Option<DateTime<Utc>>,
}

/// Migrate a raw metadata document to the current version. Idempotent: a
/// document already at the current version is returned unchanged.
pub fn migrate_metadata(mut value: serde_json::Value) -> serde_json::Value {
    if let Some(object) = value.as_object_mut() {
        let version = object.get("version").and_then(|v| v.as_u64()).unwrap_or(0);
        if version < u64::from(METADATA_VERSION) {
            object.insert("version".to_string(), serde_json::json!(METADATA_VERSION));
        }
    }
    value
}

/// A live context handle given to callers.
#[derive(Clone)]
pub struct SessionContext {
    pub key: ContextKey,
    pub fingerprint: Fingerprint,
    pub page: DrivenPage,
    pub state_dir: PathBuf,
    context_id: BrowserContextId,
}

/// Manager configuration.
#[derive(Debug, Clone)]
pub struct SessionManagerConfig {
    /// Root for persisted session state.
    pub state_root: PathBuf,
    pub launch: LaunchOptions,
}

impl Default for SessionManagerConfig {
    fn default() -> Self {
        Self {
            state_root: PathBuf::from("shared_state/crawler_sessions"),
            launch: LaunchOptions::default(),
        }
    }
}

struct ManagerState {
    process: Option<BrowserProcess>,
    contexts: HashMap<String, SessionContext>,
    restarts: u32,
}

/// Owns the browser process and all contexts spawned from it.
pub struct SessionManager {
    config: SessionManagerConfig,
    registry: Arc<SessionRegistry>,
    state: Mutex<ManagerState>,
}

impl SessionManager {
    pub fn new(config: SessionManagerConfig, registry: Arc<SessionRegistry>) -> Self {
        Self {
            config,
            registry,
            state: Mutex::new(ManagerState {
                process: None,
                contexts: HashMap::new(),
                restarts: 0,
            }),
        }
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        self.registry.clone()
    }

    fn state_dir(&self, key: &ContextKey) -> PathBuf {
        self.config
            .state_root
            .join(&key.session_id)
            .join(key.domain_key())
    }

    /// Get the existing context for the key or create one, hydrating
    /// persisted cookies when the session directory already exists.
    pub async fn get_or_create(&self, key: &ContextKey) -> Result<SessionContext> {
        let mut state = self.state.lock().await;

        if let Some(existing) = state.contexts.get(&key.map_key()) {
            return Ok(existing.clone());
        }

        Self::ensure_process(&self.config, &mut state).await?;
        let process = state
            .process
            .as_ref()
            .ok_or_else(|| BrowserError::Unavailable("no browser process".to_string()))?;

        let fingerprint = Fingerprint::derive(&key.user_id, &key.session_id);
        let context_id = process.new_context().await?;
        let page = process.new_page(Some(&context_id)).await?;

        page.set_user_agent(&fingerprint.user_agent).await?;
        page.set_viewport(fingerprint.viewport.0, fingerprint.viewport.1)
            .await?;
        page.set_timezone(&fingerprint.timezone).await?;
        page.set_locale(&fingerprint.locale).await?;

        let state_dir = self.state_dir(key);
        if state_dir.exists() {
            if let Some(persisted) = load_state(&state_dir) {
                let count = persisted.cookies.len();
                if page.set_cookies(persisted.cookies).await.is_ok() {
                    tracing::info!(
                        session_id = %key.session_id,
                        domain = %key.domain,
                        cookies = count,
                        "session state rehydrated"
                    );
                }
            }
        } else {
            std::fs::create_dir_all(&state_dir)?;
        }
        write_metadata(&state_dir, &fingerprint)?;

        let context = SessionContext {
            key: key.clone(),
            fingerprint: fingerprint.clone(),
            page,
            state_dir,
            context_id,
        };

        self.registry.register(&key.session_id);
        self.registry.set_fingerprint(
            &key.session_id,
            &fingerprint.user_agent,
            fingerprint.viewport,
        );

        state.contexts.insert(key.map_key(), context.clone());
        tracing::info!(
            session_id = %key.session_id,
            domain = %key.domain,
            user_agent = %fingerprint.user_agent,
            "browser context created"
        );
        Ok(context)
    }

    /// Snapshot cookies back to disk.
    pub async fn save_state(&self, key: &ContextKey) -> Result<()> {
        let context = {
            let state = self.state.lock().await;
            state
                .contexts
                .get(&key.map_key())
                .cloned()
                .ok_or_else(|| BrowserError::UnknownSession {
                    session_id: key.session_id.clone(),
                })?
        };

        let cookies = context.page.cookies().await?;
        std::fs::create_dir_all(&context.state_dir)?;
        let persisted = PersistedState { cookies };
        let tmp = context.state_dir.join("state.json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(&persisted)?)?;
        std::fs::rename(&tmp, context.state_dir.join("state.json"))?;
        touch_metadata(&context.state_dir)?;
        tracing::debug!(session_id = %key.session_id, domain = %key.domain, "session state saved");
        Ok(())
    }

    /// Enumerate live contexts, optionally filtered to one user.
    pub async fn list_sessions(&self, user_id: Option<&str>) -> Vec<ContextKey> {
        let state = self.state.lock().await;
        state
            .contexts
            .values()
            .map(|c| c.key.clone())
            .filter(|k| user_id.map(|u| k.user_id == u).unwrap_or(true))
            .collect()
    }

    /// Close a context and forget it. The on-disk directory is retained for
    /// future rehydration.
    pub async fn delete_session(&self, key: &ContextKey) -> Result<()> {
        let removed = {
            let mut state = self.state.lock().await;
            state.contexts.remove(&key.map_key())
        };
        let Some(context) = removed else {
            return Err(BrowserError::UnknownSession {
                session_id: key.session_id.clone(),
            });
        };

        let state = self.state.lock().await;
        if let Some(process) = state.process.as_ref() {
            let _ = context.page.close().await;
            let _ = process.dispose_context(context.context_id).await;
        }
        self.registry.close(&key.session_id, "deleted");
        tracing::info!(session_id = %key.session_id, domain = %key.domain, "session deleted");
        Ok(())
    }

    /// Drop every context belonging to a session id (recovery path).
    pub async fn close_contexts_for_session(&self, session_id: &str) {
        let removed: Vec<SessionContext> = {
            let mut state = self.state.lock().await;
            let keys: Vec<String> = state
                .contexts
                .iter()
                .filter(|(_, c)| c.key.session_id == session_id)
                .map(|(k, _)| k.clone())
                .collect();
            keys.into_iter()
                .filter_map(|k| state.contexts.remove(&k))
                .collect()
        };

        let state = self.state.lock().await;
        for context in removed {
            let _ = context.page.close().await;
            if let Some(process) = state.process.as_ref() {
                let _ = process.dispose_context(context.context_id).await;
            }
        }
    }

    /// Best-effort probe of the shared browser process.
    pub async fn is_browser_alive(&self) -> bool {
        let state = self.state.lock().await;
        match state.process.as_ref() {
            Some(process) => process.is_alive().await,
            None => false,
        }
    }

    /// Tear everything down and relaunch the browser.
    pub async fn restart_browser(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let stale: Vec<String> = state
            .contexts
            .values()
            .map(|c| c.key.session_id.clone())
            .collect();
        state.contexts.clear();

        if let Some(process) = state.process.take() {
            process.shutdown().await;
        }
        for session_id in stale {
            self.registry.close(&session_id, "browser restart");
        }

        state.process = Some(
            BrowserProcess::launch(&self.config.launch)
                .await
                .map_err(|e| BrowserError::Unavailable(e.to_string()))?,
        );
        state.restarts += 1;
        tracing::warn!(restarts = state.restarts, "browser restarted");
        Ok(())
    }

    /// Number of restarts since process start.
    pub async fn restart_count(&self) -> u32 {
        self.state.lock().await.restarts
    }

    async fn ensure_process(config: &SessionManagerConfig, state: &mut ManagerState) -> Result<()> {
        if state.process.is_none() {
            state.process = Some(
                BrowserProcess::launch(&config.launch)
                    .await
                    .map_err(|e| BrowserError::Unavailable(e.to_string()))?,
            );
        }
        Ok(())
    }
}

fn load_state(dir: &Path) -> Option<PersistedState> {
    let body = std::fs::read_to_string(dir.join("state.json")).ok()?;
    serde_json::from_str(&body).ok()
}

fn write_metadata(dir: &Path, fingerprint: &Fingerprint) -> Result<()> {
    let path = dir.join("metadata.json");
    let metadata = if let Ok(body) = std::fs::read_to_string(&path) {
        let migrated = migrate_metadata(serde_json::from_str(&body)?);
        serde_json::from_value::<SessionMetadata>(migrated).unwrap_or_else(|_| SessionMetadata {
            version: METADATA_VERSION,
            fingerprint: fingerprint.clone(),
            created_at: Utc::now(),
            last_saved: None,
        })
    } else {
        SessionMetadata {
            version: METADATA_VERSION,
            fingerprint: fingerprint.clone(),
            created_at: Utc::now(),
            last_saved: None,
        }
    };
    std::fs::write(&path, serde_json::to_string_pretty(&metadata)?)?;
    Ok(())
}

fn touch_metadata(dir: &Path) -> Result<()> {
    let path = dir.join("metadata.json");
    if let Ok(body) = std::fs::read_to_string(&path) {
        if let Ok(mut metadata) =
            serde_json::from_value::<SessionMetadata>(migrate_metadata(serde_json::from_str(&body)?))
        {
            metadata.last_saved = Some(Utc::now());
            std::fs::write(&path, serde_json::to_string_pretty(&metadata)?)?;
        }
    }
    Ok(())
}
