//! HTTP handlers for the research surface.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use browser::BrowserError;
use research::{EventEmitter, ResearchRequest};

use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ResearchBody {
    pub query: String,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default = "default_true")]
    pub human_assist_allowed: bool,
    #[serde(default)]
    pub query_type: Option<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Serialize)]
pub struct ResearchResponse {
    pub results: serde_json::Value,
    pub mode: String,
    pub strategy_used: String,
    pub passes: u32,
    pub stats: serde_json::Value,
}

/// `POST /research`
pub async fn research_handler(
    State(state): State<AppState>,
    Json(body): Json<ResearchBody>,
) -> Response {
    let mode = body.mode.unwrap_or_else(|| "standard".to_string());
    let request = ResearchRequest {
        query: body.query.clone(),
        session_id: body
            .session_id
            .unwrap_or_else(|| format!("research-{}", chrono::Utc::now().timestamp())),
        user_id: "gateway".to_string(),
        deep: mode == "deep",
    };

    let cancel = CancellationToken::new();
    let outcome = state
        .orchestrator
        .research(&request, EventEmitter::disabled(), cancel)
        .await;

    match outcome {
        Ok(outcome) => {
            let response = ResearchResponse {
                results: serde_json::to_value(&outcome.by_vendor).unwrap_or_default(),
                mode,
                strategy_used: "browser_research".to_string(),
                passes: outcome.passes,
                stats: serde_json::json!({
                    "viable": outcome.viable_count,
                    "rejected": outcome.rejected.len(),
                    "queries_run": outcome.queries_run,
                    "caveats": outcome.caveats,
                    "extraction": outcome.stats,
                }),
            };
            (StatusCode::OK, Json(response)).into_response()
        }
        Err(e) => {
            tracing::error!(error = %e, "research request failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": e.to_string()})),
            )
                .into_response()
        }
    }
}

/// `GET /api/captchas/pending`
pub async fn pending_interventions_handler(State(state): State<AppState>) -> Response {
    let interventions = state.broker.list_pending();
    (
        StatusCode::OK,
        Json(serde_json::json!({ "interventions": interventions })),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
pub struct ResolveBody {
    pub resolved: bool,
    #[serde(default)]
    pub skip_reason: Option<String>,
}

/// `POST /interventions/{id}/resolve`
pub async fn resolve_intervention_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ResolveBody>,
) -> Response {
    match state.broker.resolve(&id, body.resolved, body.skip_reason) {
        Ok(intervention) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "id": intervention.id,
                "resolved": intervention.resolved,
                "success": intervention.success,
            })),
        )
            .into_response(),
        Err(BrowserError::UnknownIntervention { .. }) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "unknown intervention"})),
        )
            .into_response(),
        Err(BrowserError::QueueBusy) => (
            StatusCode::SERVICE_UNAVAILABLE,
            [("Retry-After", "1")],
            Json(serde_json::json!({"error": "queue busy"})),
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "resolve failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": e.to_string()})),
            )
                .into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ExploreCatalogBody {
    pub vendor_url: String,
    pub vendor_name: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default = "default_max_items")]
    pub max_items: usize,
    #[serde(default)]
    pub session_id: Option<String>,
}

fn default_max_items() -> usize {
    50
}

/// `POST /vendor.explore_catalog`
pub async fn explore_catalog_handler(
    State(state): State<AppState>,
    Json(body): Json<ExploreCatalogBody>,
) -> Response {
    let url = match &body.category {
        Some(category) if !category.is_empty() => {
            format!("{}/{}", body.vendor_url.trim_end_matches('/'), category)
        }
        _ => body.vendor_url.clone(),
    };

    match research::explore_catalog(&state.fetcher, &url, &body.vendor_name, body.max_items).await {
        Ok(result) => (StatusCode::OK, Json(result)).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "catalog exploration failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": e.to_string()})),
            )
                .into_response()
        }
    }
}

/// `GET /health`
pub async fn health_handler(State(state): State<AppState>) -> Response {
    let sessions = state.registry.list();
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "ok",
            "sessions": sessions.len(),
            "pending_interventions": state.broker.list_pending().len(),
        })),
    )
        .into_response()
}
