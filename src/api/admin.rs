// =============================================================================
// Admin API — match lifecycle, winner payout, usage stats
// =============================================================================
//
// Every handler requires the Bearer token checked by `AuthBearer`. Creating
// and starting matches enforces the single-running-match rule with 409s;
// settlement errors surface to the caller so settlement can be retried
// manually.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::Utc;
use serde::Deserialize;
use tracing::{error, info};
use uuid::Uuid;

use crate::api::auth::AuthBearer;
use crate::app_state::AppState;
use crate::coordinator::{MatchCoordinator, Participant};
use crate::store::relational::{MatchRow, ParticipantRow};
use crate::types::MatchStatus;

fn internal_error(e: anyhow::Error) -> (StatusCode, Json<serde_json::Value>) {
    error!(error = %e, "admin request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": e.to_string() })),
    )
}

fn roster_from_rows(rows: Vec<ParticipantRow>) -> Vec<Participant> {
    rows.into_iter()
        .map(|r| Participant {
            id: r.id,
            owner: r.owner,
            name: r.name,
            strategy: r.strategy,
        })
        .collect()
}

// =============================================================================
// Match lifecycle
// =============================================================================

/// POST /admin/match — create a pending match. 409 while any match is not
/// yet settled.
pub async fn create_match(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    match state.relational.any_unsettled_match().await {
        Ok(true) => {
            return (
                StatusCode::CONFLICT,
                Json(serde_json::json!({ "error": "a pending or running match already exists" })),
            )
                .into_response();
        }
        Ok(false) => {}
        Err(e) => return internal_error(e).into_response(),
    }

    let now = Utc::now().timestamp_millis();
    let duration_ms = state.runtime_config.read().match_duration_hours * 3_600_000;
    let row = MatchRow {
        id: Uuid::new_v4().to_string(),
        start_ts: now,
        end_ts: now + duration_ms,
        status: MatchStatus::Pending,
        result_hash: None,
    };

    if let Err(e) = state.relational.create_match(&row).await {
        return internal_error(e).into_response();
    }

    info!(match_id = %row.id, "match created");
    (StatusCode::CREATED, Json(serde_json::json!(row))).into_response()
}

/// POST /admin/match/{id}/start — 409 if another match is running.
pub async fn start_match(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let row = match state.relational.get_match(&id).await {
        Ok(Some(row)) => row,
        Ok(None) => return StatusCode::NOT_FOUND.into_response(),
        Err(e) => return internal_error(e).into_response(),
    };

    match state.relational.running_match().await {
        Ok(Some(running)) if running.id != id => {
            return (
                StatusCode::CONFLICT,
                Json(serde_json::json!({
                    "error": format!("match {} is already running", running.id)
                })),
            )
                .into_response();
        }
        Ok(_) => {}
        Err(e) => return internal_error(e).into_response(),
    }
    if state.registry.get(&id).is_some_and(|c| c.is_running()) {
        return (
            StatusCode::CONFLICT,
            Json(serde_json::json!({ "error": "coordinator already running" })),
        )
            .into_response();
    }

    let now = Utc::now().timestamp_millis();
    let duration_ms = state.runtime_config.read().match_duration_hours * 3_600_000;
    let end_ts = now + duration_ms;
    if let Err(e) = state.relational.start_match(&id, now, end_ts).await {
        return internal_error(e).into_response();
    }

    let roster = match state.relational.participants_for_match(&id).await {
        Ok(rows) => roster_from_rows(rows),
        Err(e) => return internal_error(e).into_response(),
    };

    let started_row = MatchRow {
        start_ts: now,
        end_ts,
        status: MatchStatus::Running,
        ..row
    };
    MatchCoordinator::start(state.coordinator_deps(), &started_row, roster);

    info!(match_id = %id, "match started");
    Json(serde_json::json!(started_row)).into_response()
}

/// POST /admin/match/{id}/reset — wipe coordinator state and restart from
/// the relational roster.
pub async fn reset_match(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let roster = match state.relational.participants_for_match(&id).await {
        Ok(rows) => roster_from_rows(rows),
        Err(e) => return internal_error(e).into_response(),
    };

    if let Some(coordinator) = state.registry.get(&id) {
        coordinator.reset(roster);
        return Json(serde_json::json!({ "status": "reset" })).into_response();
    }

    // No resident coordinator (e.g. after a crash): rebuild from the match
    // row.
    match state.relational.get_match(&id).await {
        Ok(Some(row)) => {
            MatchCoordinator::start(state.coordinator_deps(), &row, roster);
            Json(serde_json::json!({ "status": "restarted" })).into_response()
        }
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => internal_error(e).into_response(),
    }
}

/// POST /admin/match/{id}/settle — force settlement. Errors propagate so
/// the caller can retry.
pub async fn settle_match(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let Some(coordinator) = state.registry.get(&id) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    match coordinator.settle().await {
        Ok(()) => Json(serde_json::json!({ "status": "settled" })).into_response(),
        Err(e) => internal_error(e).into_response(),
    }
}

// =============================================================================
// Winners
// =============================================================================

#[derive(Deserialize)]
pub struct MarkPaidBody {
    pub tx_hash: String,
}

/// POST /admin/winner/{id}/mark-paid
pub async fn mark_winner_paid(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<MarkPaidBody>,
) -> impl IntoResponse {
    match state.relational.mark_winner_paid(&id, &body.tx_hash).await {
        Ok(true) => Json(serde_json::json!({ "status": "paid" })).into_response(),
        Ok(false) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => internal_error(e).into_response(),
    }
}

// =============================================================================
// Burns
// =============================================================================

#[derive(Deserialize)]
pub struct RecordBurnBody {
    pub owner: String,
    pub tx_hash: String,
    pub amount: f64,
    #[serde(default)]
    pub verified: bool,
}

/// POST /admin/burn — the external fee verifier lands burn records here;
/// bot creation consults them as the entry gate.
pub async fn record_burn(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Json(body): Json<RecordBurnBody>,
) -> impl IntoResponse {
    let ts = Utc::now().timestamp_millis();
    match state
        .relational
        .record_burn(&body.owner, &body.tx_hash, body.amount, body.verified, ts)
        .await
    {
        Ok(()) => {
            info!(owner = %body.owner, tx_hash = %body.tx_hash, verified = body.verified, "burn recorded");
            (StatusCode::CREATED, Json(serde_json::json!({ "status": "recorded" }))).into_response()
        }
        Err(e) => internal_error(e).into_response(),
    }
}

// =============================================================================
// Usage stats
// =============================================================================

/// GET /admin/api-usage — cache, rate, and credit statistics.
pub async fn api_usage(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let usage = state.fetcher.gates().usage();
    let body = serde_json::json!({
        "feed": usage,
        "cache_age_secs": state.fetcher.cache_age_secs(),
        "blob_keys": state.blob.len(),
        "recent_errors": state.errors.recent(),
        "uptime_secs": state.uptime_secs(),
    });
    Json(body)
}
