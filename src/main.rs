// =============================================================================
// Arena Engine — Main Entry Point
// =============================================================================
//
// Boots the shared state, resumes a running match if one exists in the
// relational store, and serves the HTTP API. Matches are created and started
// through the admin surface; once one is running, settlement automatically
// rolls a successor every 24 hours.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod compiler;
mod coordinator;
mod execution;
mod feed;
mod portfolio;
mod rules;
mod runtime_config;
mod store;
mod strategy;
mod types;

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::coordinator::{MatchCoordinator, Participant};
use crate::runtime_config::RuntimeConfig;
use crate::store::RelationalStore;

const CONFIG_PATH: &str = "runtime_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("arena engine starting up");

    let mut config = RuntimeConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        RuntimeConfig::default()
    });

    // Env overrides.
    if let Ok(addr) = std::env::var("ARENA_BIND_ADDR") {
        config.bind_addr = addr;
    }
    if let Ok(path) = std::env::var("ARENA_DB_PATH") {
        config.db_path = path;
    }
    if let Ok(url) = std::env::var("ARENA_FEED_URL") {
        config.feed_base_url = url;
    }

    info!(
        bind_addr = %config.bind_addr,
        db_path = %config.db_path,
        feed = %config.feed_base_url,
        llm_compiler = config.enable_llm_compiler,
        "configuration resolved"
    );

    // ── 2. Build shared state ────────────────────────────────────────────
    let relational = RelationalStore::new(&config.db_path)?;
    let state = Arc::new(AppState::new(config, relational));

    // ── 3. Resume a running match, if any ────────────────────────────────
    match state.relational.running_match().await {
        Ok(Some(row)) => {
            let roster: Vec<Participant> = state
                .relational
                .participants_for_match(&row.id)
                .await?
                .into_iter()
                .map(|r| Participant {
                    id: r.id,
                    owner: r.owner,
                    name: r.name,
                    strategy: r.strategy,
                })
                .collect();
            info!(
                match_id = %row.id,
                participants = roster.len(),
                "resuming running match from relational store"
            );
            MatchCoordinator::start(state.coordinator_deps(), &row, roster);
        }
        Ok(None) => info!("no running match to resume — waiting for admin start"),
        Err(e) => error!(error = %e, "failed to query running match"),
    }

    // ── 4. Serve the API ─────────────────────────────────────────────────
    let bind_addr = state.runtime_config.read().bind_addr.clone();
    let app = api::rest::router(state.clone());
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, "API server listening");

    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "API server failed");
        }
    });

    // ── 5. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping");
    server.abort();

    if let Err(e) = state.runtime_config.read().save(CONFIG_PATH) {
        error!(error = %e, "failed to save runtime config on shutdown");
    }

    info!("arena engine shut down complete");
    Ok(())
}
