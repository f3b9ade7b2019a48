// Copyright 2025 Sushanth (https://github.com/sushanthpy)
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! HTTP ingress.
//!
//! Thin boundary layer: validates submissions against the tool registry,
//! assigns identifiers, bulk-enqueues into the store, and reads progress
//! back out. All shaping happens in the scheduler.

pub mod health;
pub mod stats;
pub mod status;
pub mod submit;
pub mod tools;

use crate::auth::{self, RateLimiter};
use crate::config::GatewayConfig;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use dripway_core::{JobStore, StoreError, ToolRegistry};
use serde_json::json;
use std::sync::Arc;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn JobStore>,
    pub registry: Arc<ToolRegistry>,
    pub config: Arc<GatewayConfig>,
    pub limiter: Arc<RateLimiter>,
}

/// API error type.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unknown tool: {tool}")]
    UnknownTool { tool: String, available: Vec<String> },

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::NotFound(message) => {
                (StatusCode::NOT_FOUND, Json(json!({"error": message}))).into_response()
            }
            ApiError::BadRequest(message) => {
                (StatusCode::BAD_REQUEST, Json(json!({"error": message}))).into_response()
            }
            ApiError::UnknownTool { tool, available } => (
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "error": format!("Unknown tool: {tool}"),
                    "available_tools": available,
                })),
            )
                .into_response(),
            ApiError::Internal(message) => {
                tracing::error!(error = %message, "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({"error": message})),
                )
                    .into_response()
            }
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError::Internal(err.to_string())
    }
}

/// Assemble the ingress router with its guard layers.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/batch", post(submit::submit_batch))
        .route("/api/single", post(submit::submit_single))
        .route("/api/status/:batch_id", get(status::batch_status))
        .route("/api/tools", get(tools::list_tools))
        .route("/api/stats", get(stats::queue_stats))
        .route("/api/health", get(health::health_check))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            auth::rate_limit_middleware,
        ))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            auth::secret_middleware,
        ))
        .with_state(state)
}
