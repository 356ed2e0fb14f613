//! API request handlers

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    Json,
};
use conclave_kernel_chain::{Envelope, EnvelopeDraft};
use conclave_kernel_halt::HaltReport;
use conclave_kernel_lifecycle::TaskRecord;
use conclave_kernel_merkle::InclusionProof;
use conclave_substrate::SubstrateHealth;
use conclave_types::{ActorId, EventId, TaskId};
use serde::Serialize;

use crate::api::state::AppState;
use crate::error::{ApiError, ApiResult};

/// Header naming who pulled the halt. Defaults to [`DEFAULT_HALT_ACTOR`].
pub const ACTOR_HEADER: &str = "x-conclave-actor";
pub const DEFAULT_HALT_ACTOR: &str = "operator";

/// Append one event. The ledger assigns sequence, timestamp and hashes.
pub async fn append_event(
    State(state): State<AppState>,
    Json(draft): Json<EnvelopeDraft>,
) -> ApiResult<(StatusCode, Json<Envelope>)> {
    let envelope = state.substrate.append(draft).await?;
    Ok((StatusCode::CREATED, Json(envelope)))
}

/// The whole chain, genesis to tail.
pub async fn export_ledger(State(state): State<AppState>) -> ApiResult<Json<Vec<Envelope>>> {
    Ok(Json(state.substrate.export().await?))
}

pub async fn get_proof(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
) -> ApiResult<Json<InclusionProof>> {
    let event_id: EventId = event_id
        .parse()
        .map_err(|e| ApiError::BadRequest(format!("invalid event id {event_id}: {e}")))?;
    Ok(Json(state.substrate.prove(&event_id).await?))
}

/// Raise the halt. Repeating the call while halted changes nothing.
pub async fn trigger_halt(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<HaltReport>> {
    authorize_halt(&state, &headers)?;
    let actor = headers
        .get(ACTOR_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .unwrap_or(DEFAULT_HALT_ACTOR);

    let report = state.substrate.trigger_halt(ActorId::new(actor)).await;
    Ok(Json(report))
}

fn authorize_halt(state: &AppState, headers: &HeaderMap) -> ApiResult<()> {
    let Some(expected) = state.halt_token.as_deref() else {
        return Err(ApiError::Unauthorized("halt endpoint has no token configured".into()));
    };
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    match presented {
        Some(token) if token == expected => Ok(()),
        Some(_) => Err(ApiError::Unauthorized("invalid bearer token".into())),
        None => Err(ApiError::Unauthorized("missing bearer token".into())),
    }
}

pub async fn get_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> ApiResult<Json<TaskRecord>> {
    let task_id = TaskId::new(task_id);
    state
        .substrate
        .task(&task_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("task {task_id}")))
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime: String,
    #[serde(flatten)]
    pub substrate: SubstrateHealth,
}

pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let substrate = state.substrate.health().await;
    let status = if substrate.integrity_fault.is_some() {
        "integrity_locked"
    } else if substrate.halted {
        "halted"
    } else {
        "healthy"
    };
    Json(HealthResponse {
        status: status.to_string(),
        version: state.version.clone(),
        uptime: state.uptime(),
        substrate,
    })
}
