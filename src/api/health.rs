//! Health check endpoints

use super::{ApiResponse, ApiState};
use crate::node::types::InitState;
use axum::{extract::State, response::Json};
use serde::Serialize;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Service status
    pub status: String,
    /// Service version
    pub version: String,
    /// Selected backend adapter
    pub implementation: String,
    /// Current initialization state
    pub init_state: InitState,
    /// Connected SSE clients
    pub sse_subscribers: usize,
}

/// Health check endpoint
pub async fn health_check(State(state): State<ApiState>) -> Json<ApiResponse<HealthResponse>> {
    let init_state = state.app.session.state();

    let response = HealthResponse {
        status: if init_state == InitState::Done {
            "healthy".to_string()
        } else {
            "starting".to_string()
        },
        version: env!("CARGO_PKG_VERSION").to_string(),
        implementation: state.app.session.implementation().to_string(),
        init_state,
        sse_subscribers: state.app.hub.subscriber_count(),
    };

    Json(ApiResponse::success(response))
}
