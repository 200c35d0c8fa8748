//! Application state: the fully wired research stack.

use std::path::PathBuf;
use std::sync::Arc;

use browser::{
    InterventionBroker, RecoveryConfig, RecoveryManager, SessionManager, SessionManagerConfig,
    SessionRegistry,
};
use perception::{
    PdpExtractor, PerceptionConfig, PerceptionPipeline, ProductVerifier, RejectionTracker,
    ViabilityFilter, VisionExtractor,
};
use perception::intelligence::PageIntelligence;
use perception::ocr::{HttpOcr, OcrEngine};
use research::{ResearchConfig, ResearchOrchestrator, ResilientFetcher};
use solver_client::{Solver, SolverClient};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<ResearchOrchestrator>,
    pub broker: Arc<InterventionBroker>,
    pub registry: Arc<SessionRegistry>,
    pub sessions: Arc<SessionManager>,
    pub recovery: Arc<RecoveryManager>,
    pub fetcher: Arc<ResilientFetcher>,
}

/// Filesystem layout owned by the core.
pub struct StateDirs {
    pub shared_state: PathBuf,
    pub schemas: PathBuf,
}

impl Default for StateDirs {
    fn default() -> Self {
        Self {
            shared_state: PathBuf::from("shared_state"),
            schemas: PathBuf::from("schemas"),
        }
    }
}

/// Wire the whole stack from environment configuration.
pub fn build_state(dirs: StateDirs) -> anyhow::Result<AppState> {
    let solver: Arc<dyn Solver> = Arc::new(SolverClient::from_env()?);
    let perception_config = PerceptionConfig::from_env();

    let ocr: Arc<dyn OcrEngine> = Arc::new(HttpOcr::new(
        std::env::var("OCR_SIDECAR_URL").unwrap_or_else(|_| "http://127.0.0.1:8765".to_string()),
        perception_config.ocr_timeout_ms,
        perception_config.ocr_use_gpu,
    ));

    let registry = Arc::new(SessionRegistry::new());
    let sessions = Arc::new(SessionManager::new(
        SessionManagerConfig {
            state_root: dirs.shared_state.join("crawler_sessions"),
            ..Default::default()
        },
        registry.clone(),
    ));
    let recovery = Arc::new(RecoveryManager::new(
        RecoveryConfig::default(),
        sessions.clone(),
    ));

    let broker = Arc::new(InterventionBroker::new(
        dirs.shared_state.join("captcha_queue.json"),
        std::env::var("NOVNC_URL").ok(),
        registry.clone(),
    ));

    let intelligence = Arc::new(PageIntelligence::new(solver.clone(), dirs.schemas));
    let vision = VisionExtractor::new(solver.clone(), ocr.clone(), perception_config.clone());
    let pipeline = Arc::new(PerceptionPipeline::new(
        perception_config.clone(),
        vision,
        intelligence.clone(),
    ));
    let pdp = Arc::new(PdpExtractor::new(
        solver.clone(),
        ocr,
        intelligence,
        perception_config.clone(),
    ));
    let verifier = Arc::new(ProductVerifier::new(
        pdp.clone(),
        Some(broker.clone()),
        perception_config.clone(),
    ));
    let viability = Arc::new(ViabilityFilter::new(solver.clone()));
    let rejections = Arc::new(RejectionTracker::new(
        dirs.shared_state.join("rejection_patterns.json"),
    ));

    let orchestrator = Arc::new(ResearchOrchestrator::new(
        solver,
        sessions.clone(),
        recovery.clone(),
        broker.clone(),
        pipeline,
        pdp,
        verifier,
        viability,
        rejections,
        perception_config,
        ResearchConfig::default(),
    ));

    Ok(AppState {
        orchestrator,
        broker,
        registry,
        sessions,
        recovery,
        fetcher: Arc::new(ResilientFetcher::new()),
    })
}

/// Background sweeper: closes sessions idle past the timeout.
pub fn spawn_idle_sweeper(registry: Arc<SessionRegistry>, timeout_minutes: i64) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
        loop {
            interval.tick().await;
            let closed = registry.cleanup_idle_sessions(timeout_minutes);
            for session_id in closed {
                tracing::info!(session_id, "idle session timed out");
            }
        }
    });
}
