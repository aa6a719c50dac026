// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// Public read surface plus the bot-create path. Admin endpoints live under
// `/admin` and require the Bearer token; everything else is open. CORS is
// configured permissively for development.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use chrono::Utc;
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;
use uuid::Uuid;

use crate::api::admin;
use crate::app_state::AppState;
use crate::compiler::CompileError;
use crate::coordinator::{LeaderboardEntry, Participant, SettlementRow};
use crate::portfolio::START_BALANCE;
use crate::store::relational::ParticipantRow;
use crate::types::participant_seed;

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST API router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/health", get(health))
        .route("/leaderboard", get(leaderboard))
        .route("/bot", post(create_bot))
        .route("/bot/preview", post(preview_bot))
        .route("/bot/:id", get(bot_detail))
        .route("/match/current", get(current_match))
        .route("/match/history", get(match_history))
        .route("/match/results/:id", get(match_results))
        // ── Admin (Bearer token) ────────────────────────────────────
        .route("/admin/match", post(admin::create_match))
        .route("/admin/match/:id/start", post(admin::start_match))
        .route("/admin/match/:id/reset", post(admin::reset_match))
        .route("/admin/match/:id/settle", post(admin::settle_match))
        .route("/admin/winner/:id/mark-paid", post(admin::mark_winner_paid))
        .route("/admin/burn", post(admin::record_burn))
        .route("/admin/api-usage", get(admin::api_usage))
        // ── Middleware & State ──────────────────────────────────────
        .layer(cors)
        .with_state(state)
}

fn internal_error(e: anyhow::Error) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": e.to_string() })),
    )
}

// =============================================================================
// Health (public)
// =============================================================================

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "uptime_secs": state.uptime_secs(),
        "server_time": Utc::now().timestamp_millis(),
    }))
}

// =============================================================================
// Leaderboard
// =============================================================================

/// GET /leaderboard — live coordinator standings merged with the relational
/// roster. Roster members the coordinator has not ticked yet appear with the
/// start balance and status "waiting".
async fn leaderboard(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let Some(coordinator) = state.running_coordinator() else {
        return Json(Vec::<LeaderboardEntry>::new()).into_response();
    };

    let mut entries = coordinator.leaderboard();

    let roster = match state
        .relational
        .participants_for_match(coordinator.match_id())
        .await
    {
        Ok(rows) => rows,
        Err(e) => return internal_error(e).into_response(),
    };
    for row in roster {
        if !entries.iter().any(|e| e.participant_id == row.id) {
            entries.push(LeaderboardEntry {
                participant_id: row.id,
                owner: row.owner,
                name: row.name,
                total_value: START_BALANCE,
                gain_pct: 0.0,
                open_positions: 0,
                orders: 0,
                status: "waiting",
            });
        }
    }

    entries.sort_by(|a, b| {
        b.total_value
            .partial_cmp(&a.total_value)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    Json(entries).into_response()
}

// =============================================================================
// Bot create / preview / detail
// =============================================================================

#[derive(Deserialize)]
struct CreateBotBody {
    /// Signature-verified identity, attached upstream of this API.
    owner: String,
    name: String,
    prompt: String,
}

fn compile_error_response(e: CompileError) -> (StatusCode, Json<serde_json::Value>) {
    let status = match e {
        CompileError::InvalidPrompt { .. } => StatusCode::BAD_REQUEST,
        CompileError::ParseFailed { .. } => StatusCode::UNPROCESSABLE_ENTITY,
    };
    (status, Json(serde_json::json!({ "error": e.to_string() })))
}

/// POST /bot — compile the prompt and enter the running match. Requires a
/// verified entry burn since match start.
async fn create_bot(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateBotBody>,
) -> impl IntoResponse {
    let name = body.name.trim().to_string();
    if name.is_empty() || name.chars().count() > 64 {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "bot name must be 1-64 characters" })),
        )
            .into_response();
    }

    let Some(coordinator) = state.running_coordinator() else {
        return (
            StatusCode::CONFLICT,
            Json(serde_json::json!({ "error": "no running match to join" })),
        )
            .into_response();
    };
    let match_id = coordinator.match_id().to_string();
    let match_start = coordinator.state_snapshot().start_ts;

    match state.relational.participant_name_taken(&name).await {
        Ok(true) => {
            return (
                StatusCode::CONFLICT,
                Json(serde_json::json!({ "error": "bot name already taken" })),
            )
                .into_response();
        }
        Ok(false) => {}
        Err(e) => return internal_error(e).into_response(),
    }

    match state
        .relational
        .has_verified_burn(&body.owner, match_start)
        .await
    {
        Ok(true) => {}
        Ok(false) => {
            return (
                StatusCode::FORBIDDEN,
                Json(serde_json::json!({ "error": "no verified entry burn for this match" })),
            )
                .into_response();
        }
        Err(e) => return internal_error(e).into_response(),
    }

    let id = Uuid::new_v4().to_string();
    let created_at = Utc::now().timestamp_millis();
    // Uniqueness seed: participant-id fold xor submission time.
    let seed = u64::from(participant_seed(&id)) ^ created_at as u64;

    let strategy = match state.compiler.compile(&body.prompt, seed).await {
        Ok(spec) => spec,
        Err(e) => return compile_error_response(e).into_response(),
    };

    let row = ParticipantRow {
        id: id.clone(),
        owner: body.owner.clone(),
        match_id,
        name: name.clone(),
        prompt_raw: body.prompt.clone(),
        strategy: strategy.clone(),
        created_at,
    };
    if let Err(e) = state.relational.insert_participant(&row).await {
        return internal_error(e).into_response();
    }

    coordinator.add_participant(Participant {
        id: id.clone(),
        owner: body.owner.clone(),
        name: name.clone(),
        strategy: strategy.clone(),
    });

    info!(participant = %id, owner = %body.owner, name = %name, "bot created");
    (
        StatusCode::CREATED,
        Json(serde_json::json!({
            "id": id,
            "name": name,
            "owner": body.owner,
            "strategy": strategy,
        })),
    )
        .into_response()
}

#[derive(Deserialize)]
struct PreviewBody {
    prompt: String,
}

/// POST /bot/preview — compile without persisting anything.
async fn preview_bot(
    State(state): State<Arc<AppState>>,
    Json(body): Json<PreviewBody>,
) -> impl IntoResponse {
    match state.compiler.preview(&body.prompt).await {
        Ok(spec) => Json(serde_json::json!({ "strategy": spec })).into_response(),
        Err(e) => compile_error_response(e).into_response(),
    }
}

/// GET /bot/{id} — live portfolio while the match runs, projections after.
async fn bot_detail(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let row = match state.relational.participant_by_id(&id).await {
        Ok(Some(row)) => row,
        Ok(None) => return StatusCode::NOT_FOUND.into_response(),
        Err(e) => return internal_error(e).into_response(),
    };

    // Live data when the participant's match is running here.
    if let Some(coordinator) = state.registry.get(&row.match_id) {
        if coordinator.is_running() {
            if let Some(portfolio) = coordinator.portfolio_of(&id) {
                return Json(serde_json::json!({
                    "participant": row,
                    "status": "running",
                    "portfolio": portfolio,
                }))
                .into_response();
            }
        }
    }

    // Otherwise project from the winners table.
    let winners = match state.relational.winners_for_match(&row.match_id).await {
        Ok(rows) => rows,
        Err(e) => return internal_error(e).into_response(),
    };
    let result = winners.into_iter().find(|w| w.participant_id == id);
    Json(serde_json::json!({
        "participant": row,
        "status": "finished",
        "result": result,
    }))
    .into_response()
}

// =============================================================================
// Match views
// =============================================================================

/// GET /match/current
async fn current_match(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    if let Some(coordinator) = state.running_coordinator() {
        let s = coordinator.state_snapshot();
        let now = Utc::now().timestamp_millis();
        return Json(serde_json::json!({
            "match_id": s.match_id,
            "status": "running",
            "start_ts": s.start_ts,
            "end_ts": s.end_ts,
            "remaining_ms": (s.end_ts - now).max(0),
            "participants": s.participants.len(),
            "last_tick_ts": s.last_tick_ts,
            "balance_history": s.balance_history,
        }))
        .into_response();
    }

    match state.relational.running_match().await {
        Ok(Some(row)) => Json(serde_json::json!(row)).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => internal_error(e).into_response(),
    }
}

/// GET /match/history
async fn match_history(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.relational.match_history(50).await {
        Ok(rows) => Json(rows).into_response(),
        Err(e) => internal_error(e).into_response(),
    }
}

/// GET /match/results/{id} — archived results, falling back to winner rows.
async fn match_results(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    if let Some(results) = state
        .blob
        .get::<Vec<SettlementRow>>(&format!("results:match-{id}"))
    {
        return Json(serde_json::json!({ "match_id": id, "results": results })).into_response();
    }

    match state.relational.winners_for_match(&id).await {
        Ok(rows) if !rows.is_empty() => {
            Json(serde_json::json!({ "match_id": id, "results": rows })).into_response()
        }
        Ok(_) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => internal_error(e).into_response(),
    }
}
