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

//! Operator-facing queue stats.

use super::{ApiError, AppState};
use axum::{extract::State, response::IntoResponse, Json};
use serde_json::json;

/// GET /api/stats
pub async fn queue_stats(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let queue = state.store.stats().await?;
    let drain_seconds = state.config.estimated_completion_seconds(queue.backlog());

    Ok(Json(json!({
        "queue": queue,
        "config": {
            "drip_interval_ms": state.config.drip_interval_ms,
            "max_batch_size": state.config.max_batch_size,
            "max_job_attempts": state.config.max_job_attempts,
            "callback_max_retries": state.config.callback_max_retries,
            "result_ttl_seconds": state.config.result_ttl_seconds,
        },
        "estimated_drain_time_seconds": drain_seconds,
    })))
}
