//! HTTP surface for the research core.
//!
//! Exposes the minimal gateway: research requests, the pending-intervention
//! feed for the resolver UI, intervention resolution, and vendor catalog
//! exploration.

pub mod routes;
pub mod state;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use state::AppState;

/// Build the application router.
pub fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(routes::health_handler))
        .route("/research", post(routes::research_handler))
        .route("/api/captchas/pending", get(routes::pending_interventions_handler))
        .route(
            "/interventions/:id/resolve",
            post(routes::resolve_intervention_handler),
        )
        .route("/vendor.explore_catalog", post(routes::explore_catalog_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
