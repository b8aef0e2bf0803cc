// =============================================================================
// REST API Endpoints — Axum 0.7 (C8, SPEC_FULL §4.8)
// =============================================================================
//
// Endpoints A-D from spec.md §6, plus an ambient `/api/health` liveness probe
// in the teacher's style. `update-settings` and `control` sit behind the
// optional bearer-token gate (`AuthBearer`); `tick`/`ui-data`/`health` do not,
// since the terminal and UI poll both every second and a default install
// should not require provisioning a token just to receive its own heartbeat.
//
// CORS is permissive, matching §6 "CORS permissive".
// =============================================================================

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::warn;

use crate::api::auth::AuthBearer;
use crate::app_state::{AppState, ControlCommand};
use crate::engine::TickInput;
use crate::error::EngineError;
use crate::settings::UserSettings;
use crate::types::Side;

/// Build the full REST API router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(health))
        .route("/api/tick", post(tick))
        .route("/api/ui-data", get(ui_data))
        .route("/api/update-settings", post(update_settings))
        .route("/api/control", post(control))
        .layer(cors)
        .with_state(state)
}

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

// =============================================================================
// GET /api/health — ambient liveness probe
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    state_version: u64,
    server_time_ms: i64,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        state_version: state.state_version(),
        server_time_ms: chrono::Utc::now().timestamp_millis(),
    })
}

// =============================================================================
// POST /api/tick — Endpoint A
// =============================================================================

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

async fn tick(
    State(state): State<Arc<AppState>>,
    body: Result<Json<TickInput>, axum::extract::rejection::JsonRejection>,
) -> impl IntoResponse {
    // §7 "Malformed tick / invalid JSON: reject with 4xx; do not advance
    // state." — the engine is never touched for a body that fails to parse.
    let Json(payload) = match body {
        Ok(json) => json,
        Err(e) => {
            warn!(error = %e, "rejected malformed tick");
            return (
                StatusCode::BAD_REQUEST,
                Json(ErrorBody { error: format!("malformed tick: {e}") }),
            )
                .into_response();
        }
    };

    let outcome = state.process_tick(&payload, now_secs());
    Json(outcome).into_response()
}

// =============================================================================
// GET /api/ui-data — Endpoint B
// =============================================================================

async fn ui_data(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.snapshot())
}

// =============================================================================
// POST /api/update-settings — Endpoint C
// =============================================================================

#[derive(Deserialize)]
struct UpdateSettingsRequest {
    side: String,
    #[serde(flatten)]
    settings: UserSettings,
}

async fn update_settings(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    body: Result<Json<UpdateSettingsRequest>, axum::extract::rejection::JsonRejection>,
) -> impl IntoResponse {
    let Json(req) = match body {
        Ok(json) => json,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ErrorBody { error: format!("malformed settings update: {e}") }),
            )
                .into_response();
        }
    };

    let side = match parse_side(&req.side) {
        Some(s) => s,
        None => {
            let err = EngineError::UnknownSide(req.side.clone());
            return (StatusCode::BAD_REQUEST, Json(ErrorBody { error: err.to_string() })).into_response();
        }
    };

    // A rejected settings update keeps prior settings (§7) and is reported
    // as 200-with-rejection-body, not a transport error — only malformed
    // wire input is a 4xx (SPEC_FULL §7).
    match state.update_settings(side, req.settings) {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(e) => (StatusCode::OK, Json(ErrorBody { error: e.to_string() })).into_response(),
    }
}

// =============================================================================
// POST /api/control — Endpoint D
// =============================================================================

/// Any subset of the four control fields; each present field is applied in
/// declaration order within one event, per §6.
#[derive(Debug, Deserialize, Default)]
struct ControlRequest {
    #[serde(default)]
    buy_switch: Option<bool>,
    #[serde(default)]
    sell_switch: Option<bool>,
    #[serde(default)]
    cyclic: Option<bool>,
    #[serde(default)]
    emergency_close: Option<bool>,
}

async fn control(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    body: Result<Json<ControlRequest>, axum::extract::rejection::JsonRejection>,
) -> impl IntoResponse {
    let Json(req) = match body {
        Ok(json) => json,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ErrorBody { error: format!("malformed control command: {e}") }),
            )
                .into_response();
        }
    };

    // Every present field is collected first and applied through a single
    // `apply_control_batch` call, under one lock acquisition, in declaration
    // order — §5/§6 require the whole request to land as one event, not one
    // event per field (see `AppState::apply_control_batch`).
    let mut cmds = Vec::new();
    if let Some(on) = req.buy_switch {
        cmds.push(ControlCommand::SetSideOn { side: Side::Buy, on });
    }
    if let Some(on) = req.sell_switch {
        cmds.push(ControlCommand::SetSideOn { side: Side::Sell, on });
    }
    if let Some(on) = req.cyclic {
        cmds.push(ControlCommand::SetCyclic { on });
    }
    if req.emergency_close == Some(true) {
        cmds.push(ControlCommand::EmergencyClose);
    }

    let result = state.apply_control_batch(&cmds, now_secs());
    Json(result).into_response()
}

fn parse_side(raw: &str) -> Option<Side> {
    match raw {
        "buy" => Some(Side::Buy),
        "sell" => Some(Side::Sell),
        _ => None,
    }
}
