//! Axum REST API handlers.
//!
//! Engine calls are synchronous and may back off under contention, so every
//! call that can place a member runs on the blocking pool. Committed events
//! are handed to the payout worker before the response is sent.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use matrix_engine::{
    EngineError, MatrixConfig, MatrixEngine, MatrixId, MemberId, PlacementOutcome, PositionId,
};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::db;
use crate::errors::{Result, ServiceError};
use crate::events::{CycleRow, EngineEvent, PayoutRecord};

#[derive(Clone)]
pub struct ApiState {
    pub engine: MatrixEngine,
    pub pool: SqlitePool,
    pub events: mpsc::Sender<EngineEvent>,
}

/// Build the application router.
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/members", post(register_member))
        .route("/members/:id/payouts", get(get_member_payouts))
        .route("/matrices", get(list_matrices).post(create_matrix))
        .route("/matrices/:id", get(get_matrix))
        .route("/matrices/:id/disable", post(disable_matrix))
        .route("/matrices/:id/placements", post(place_member))
        .route("/matrices/:id/claims", post(claim_position))
        .route("/matrices/:id/cycles", get(get_matrix_cycles))
        .route("/matrices/:id/positions/:pos", get(get_position))
        .route("/matrices/:id/positions/:pos/confirm", post(confirm_position))
        .route("/matrices/:id/positions/:pos/cancel", post(cancel_position))
        .route("/matrices/:id/positions/:pos/block", post(block_position))
        .route("/matrices/:id/positions/:pos/reset", post(reset_position))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ─────────────────────────────────────────────────────────
// Request / response shapes
// ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct RegisterMemberRequest {
    pub id: MemberId,
    #[serde(default)]
    pub sponsor: Option<MemberId>,
}

#[derive(Debug, Deserialize)]
pub struct PlacementRequest {
    pub member: MemberId,
    #[serde(default)]
    pub sponsor: Option<MemberId>,
}

#[derive(Serialize)]
pub struct MatrixResponse {
    pub config: MatrixConfig,
    pub enabled: bool,
    pub positions: usize,
    pub cycles: usize,
}

#[derive(Serialize)]
pub struct CyclesResponse {
    pub matrix_id: MatrixId,
    pub count: usize,
    pub cycles: Vec<CycleRow>,
}

#[derive(Serialize)]
pub struct PayoutsResponse {
    pub member_id: MemberId,
    pub count: usize,
    pub payouts: Vec<PayoutRecord>,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = match &self {
            ServiceError::Engine(e) => engine_status(e),
            ServiceError::PayoutIdempotencyViolation(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!("Request failed: {self}");
        }
        (
            status,
            Json(ErrorResponse {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

fn engine_status(err: &EngineError) -> StatusCode {
    match err {
        EngineError::MatrixNotFound(_)
        | EngineError::PositionNotFound { .. }
        | EngineError::MemberNotFound(_) => StatusCode::NOT_FOUND,
        EngineError::MatrixFull(_)
        | EngineError::ConcurrentSlotConflict(_)
        | EngineError::MatrixExists(_)
        | EngineError::MatrixDisabled(_)
        | EngineError::MemberExists(_)
        | EngineError::InvalidTransition { .. } => StatusCode::CONFLICT,
        EngineError::InvalidConfig(_) => StatusCode::UNPROCESSABLE_ENTITY,
    }
}

/// Run an engine call on the blocking pool.
async fn blocking<T, F>(state: &ApiState, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&MatrixEngine) -> matrix_engine::Result<T> + Send + 'static,
{
    let engine = state.engine.clone();
    Ok(tokio::task::spawn_blocking(move || f(&engine)).await??)
}

/// Hand the events of a committed placement to the payout worker.
async fn enqueue(state: &ApiState, outcome: &PlacementOutcome) {
    for event in EngineEvent::from_outcome(outcome) {
        if let Err(e) = state.events.send(event).await {
            error!("Payout worker is gone, dropping {} event", e.0.kind().as_str());
        }
    }
}

// ─────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────

/// `GET /health`
pub async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// `POST /members`
pub async fn register_member(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<RegisterMemberRequest>,
) -> Result<impl IntoResponse> {
    let member = state.engine.register_member(body.id, body.sponsor)?;
    Ok((StatusCode::CREATED, Json(member)))
}

/// `POST /matrices`
pub async fn create_matrix(
    State(state): State<Arc<ApiState>>,
    Json(config): Json<MatrixConfig>,
) -> Result<impl IntoResponse> {
    let config = state.engine.create_matrix(config)?;
    info!("Matrix {} ({}) created", config.id, config.name);
    Ok((StatusCode::CREATED, Json(config.as_ref().clone())))
}

/// `GET /matrices`
pub async fn list_matrices(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    let configs: Vec<MatrixConfig> = state
        .engine
        .store()
        .configs()
        .iter()
        .map(|c| c.as_ref().clone())
        .collect();
    Json(configs)
}

/// `GET /matrices/:id`
pub async fn get_matrix(
    State(state): State<Arc<ApiState>>,
    Path(matrix_id): Path<MatrixId>,
) -> Result<impl IntoResponse> {
    let matrix = state.engine.store().matrix(matrix_id)?;
    let (positions, cycles) = {
        let tree = matrix.read();
        (tree.positions().len(), tree.cycles().len())
    };
    Ok(Json(MatrixResponse {
        config: matrix.config().as_ref().clone(),
        enabled: matrix.is_enabled(),
        positions,
        cycles,
    }))
}

/// `POST /matrices/:id/disable`
pub async fn disable_matrix(
    State(state): State<Arc<ApiState>>,
    Path(matrix_id): Path<MatrixId>,
) -> Result<impl IntoResponse> {
    state.engine.disable_matrix(matrix_id)?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /matrices/:id/placements`
///
/// Places and confirms the member in one step.
pub async fn place_member(
    State(state): State<Arc<ApiState>>,
    Path(matrix_id): Path<MatrixId>,
    Json(body): Json<PlacementRequest>,
) -> Result<impl IntoResponse> {
    let outcome = blocking(&state, move |engine| {
        engine.place_member(body.sponsor, matrix_id, body.member)
    })
    .await?;
    enqueue(&state, &outcome).await;
    Ok((StatusCode::CREATED, Json(outcome)))
}

/// `POST /matrices/:id/claims`
///
/// Reserves a position that stays `pending` until confirmed or cancelled.
pub async fn claim_position(
    State(state): State<Arc<ApiState>>,
    Path(matrix_id): Path<MatrixId>,
    Json(body): Json<PlacementRequest>,
) -> Result<impl IntoResponse> {
    let position = blocking(&state, move |engine| {
        engine.claim_position(body.sponsor, matrix_id, body.member)
    })
    .await?;
    Ok((StatusCode::CREATED, Json(position)))
}

/// `POST /matrices/:id/positions/:pos/confirm`
pub async fn confirm_position(
    State(state): State<Arc<ApiState>>,
    Path((matrix_id, position_id)): Path<(MatrixId, PositionId)>,
) -> Result<impl IntoResponse> {
    let outcome = blocking(&state, move |engine| {
        engine.confirm_position(matrix_id, position_id)
    })
    .await?;
    enqueue(&state, &outcome).await;
    Ok(Json(outcome))
}

/// `POST /matrices/:id/positions/:pos/cancel`
pub async fn cancel_position(
    State(state): State<Arc<ApiState>>,
    Path((matrix_id, position_id)): Path<(MatrixId, PositionId)>,
) -> Result<impl IntoResponse> {
    let position = state.engine.cancel_position(matrix_id, position_id)?;
    Ok(Json(position))
}

/// `GET /matrices/:id/positions/:pos`
pub async fn get_position(
    State(state): State<Arc<ApiState>>,
    Path((matrix_id, position_id)): Path<(MatrixId, PositionId)>,
) -> Result<impl IntoResponse> {
    Ok(Json(state.engine.position(matrix_id, position_id)?))
}

/// `POST /matrices/:id/positions/:pos/block`
pub async fn block_position(
    State(state): State<Arc<ApiState>>,
    Path((matrix_id, position_id)): Path<(MatrixId, PositionId)>,
) -> Result<impl IntoResponse> {
    Ok(Json(state.engine.block_position(matrix_id, position_id)?))
}

/// `POST /matrices/:id/positions/:pos/reset`
pub async fn reset_position(
    State(state): State<Arc<ApiState>>,
    Path((matrix_id, position_id)): Path<(MatrixId, PositionId)>,
) -> Result<impl IntoResponse> {
    Ok(Json(state.engine.reset_position(matrix_id, position_id)?))
}

/// `GET /matrices/:id/cycles`
///
/// Returns the persisted cycle audit log of the matrix.
pub async fn get_matrix_cycles(
    State(state): State<Arc<ApiState>>,
    Path(matrix_id): Path<MatrixId>,
) -> Result<impl IntoResponse> {
    state.engine.config(matrix_id)?;
    let cycles = db::get_cycles_for_matrix(&state.pool, matrix_id).await?;
    Ok(Json(CyclesResponse {
        matrix_id,
        count: cycles.len(),
        cycles,
    }))
}

/// `GET /members/:id/payouts`
pub async fn get_member_payouts(
    State(state): State<Arc<ApiState>>,
    Path(member_id): Path<MemberId>,
) -> Result<impl IntoResponse> {
    let payouts = db::get_payouts_for_member(&state.pool, member_id).await?;
    Ok(Json(PayoutsResponse {
        member_id,
        count: payouts.len(),
        payouts,
    }))
}
