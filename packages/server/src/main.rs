// Main entry point for the research core server

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use server_core::state::{build_state, spawn_idle_sweeper, StateDirs};

/// Session idle timeout before the sweeper closes it.
const IDLE_TIMEOUT_MINUTES: i64 = 30;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,server_core=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("starting research core server");

    let state = build_state(StateDirs::default()).context("failed to wire research stack")?;
    spawn_idle_sweeper(state.registry.clone(), IDLE_TIMEOUT_MINUTES);

    let app = server_core::build_app(state);

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8088);
    let addr = format!("0.0.0.0:{port}");
    tracing::info!(addr, "listening");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("failed to bind")?;
    axum::serve(listener, app).await.context("server error")?;

    Ok(())
}
