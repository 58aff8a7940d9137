//! HTTP handlers (spec §6 "External interfaces").

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use shield_core::{JobState, ProtectionRequest};

use crate::dispatch::Job;
use crate::AppState;

#[derive(Serialize)]
pub struct SubmitResponse {
    pub status: &'static str,
    pub job_id: String,
    pub artwork_id: String,
}

/// `POST /v1/protect` (spec §6 "Submit protection"). Enqueues the job and
/// returns immediately; the input fetch and pipeline run in the background.
pub async fn submit_protection(
    State(state): State<AppState>,
    Json(request): Json<ProtectionRequest>,
) -> impl IntoResponse {
    let job_id = uuid::Uuid::new_v4().to_string();
    let artwork_id = request.artwork_id.clone();

    if state
        .dispatcher
        .submit(Job { request })
        .await
        .is_err()
    {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({"error": "dispatcher is not accepting jobs"})),
        )
            .into_response();
    }

    (
        StatusCode::OK,
        Json(SubmitResponse {
            status: "queued",
            job_id,
            artwork_id,
        }),
    )
        .into_response()
}

#[derive(Deserialize)]
pub struct BulkStatusRequest {
    pub artwork_ids: Vec<String>,
    #[serde(default)]
    pub ack_ids: Vec<String>,
}

/// `POST /v1/jobs/status` (spec §6 "Check status (bulk)"). `ack_ids` remove
/// their entries from the state map after being read once.
pub async fn bulk_status(
    State(state): State<AppState>,
    Json(body): Json<BulkStatusRequest>,
) -> impl IntoResponse {
    let states: std::collections::HashMap<String, JobState> = state
        .job_store
        .bulk_read(&body.artwork_ids, &body.ack_ids);
    Json(states)
}

pub async fn health() -> impl IntoResponse {
    StatusCode::OK
}
