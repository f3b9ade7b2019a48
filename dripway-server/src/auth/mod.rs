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

//! Ingress guards: shared-secret check and per-source rate limiting.

pub mod rate_limit;

pub use rate_limit::{extract_source, RateLimitConfig, RateLimitDecision, RateLimiter};

use crate::api::AppState;
use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

pub const SECRET_HEADER: &str = "x-webhook-secret";

/// Health stays reachable for probes that cannot carry the secret.
fn is_exempt(path: &str) -> bool {
    path == "/api/health"
}

/// Reject requests without the shared secret (401) or with a wrong one (403).
pub async fn secret_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    if is_exempt(request.uri().path()) {
        return next.run(request).await;
    }

    match request.headers().get(SECRET_HEADER) {
        None => (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": format!("Missing {SECRET_HEADER} header")})),
        )
            .into_response(),
        Some(provided) if provided.as_bytes() == state.config.webhook_secret.as_bytes() => {
            next.run(request).await
        }
        Some(_) => (
            StatusCode::FORBIDDEN,
            Json(json!({"error": "Invalid webhook secret"})),
        )
            .into_response(),
    }
}

/// Coarse per-source limit guarding the ingress itself.
pub async fn rate_limit_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    if is_exempt(request.uri().path()) {
        return next.run(request).await;
    }

    let source = extract_source(request.headers());
    match state.limiter.check(&source) {
        RateLimitDecision::Allowed { .. } => next.run(request).await,
        RateLimitDecision::Limited { retry_after } => {
            tracing::warn!(source = %source, "ingress rate limit exceeded");
            let secs = retry_after.as_secs().max(1);
            (
                StatusCode::TOO_MANY_REQUESTS,
                [("retry-after", secs.to_string())],
                Json(json!({
                    "error": "Rate limit exceeded",
                    "retry_after_seconds": secs,
                })),
            )
                .into_response()
        }
    }
}
