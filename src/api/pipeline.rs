//! Live pipeline status endpoint

use std::sync::Arc;

use axum::{Json, Router, extract::State, http::StatusCode, routing::get};
use serde::Serialize;

use super::{ApiError, ApiState, error_response};
use crate::pipeline::{ResponseId, Stage};

/// Build pipeline router
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/", get(get_pipeline))
        .with_state(state)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineResponse {
    pub status: String,
    pub stage: Stage,
    pub is_recording: bool,
    pub is_assistant_speaking: bool,
    pub is_processing: bool,
    pub active_response_id: Option<ResponseId>,
    /// Milliseconds since the last accepted user speech
    pub last_user_speech_ms_ago: Option<u128>,
}

/// Snapshot of the attached session
async fn get_pipeline(
    State(state): State<Arc<ApiState>>,
) -> Result<Json<PipelineResponse>, ApiError> {
    let Some(pipeline) = state.pipeline.as_ref() else {
        return Err(error_response(
            StatusCode::NOT_FOUND,
            "not_found",
            "no pipeline attached",
        ));
    };

    let snapshot = pipeline.snapshot();
    Ok(Json(PipelineResponse {
        status: pipeline.status().to_string(),
        stage: pipeline.stage(),
        is_recording: snapshot.is_recording,
        is_assistant_speaking: snapshot.is_assistant_speaking,
        is_processing: snapshot.is_processing,
        active_response_id: snapshot.active_response_id,
        last_user_speech_ms_ago: snapshot
            .last_user_speech_at
            .map(|at| at.elapsed().as_millis()),
    }))
}
