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

//! Batch progress reads.

use super::{ApiError, AppState};
use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::json;

const DEFAULT_RESULT_LIMIT: usize = 100;

#[derive(Debug, Deserialize)]
pub struct StatusParams {
    /// Include the result records collected so far.
    #[serde(default)]
    pub results: bool,
    pub limit: Option<usize>,
}

/// GET /api/status/:batch_id
pub async fn batch_status(
    State(state): State<AppState>,
    Path(batch_id): Path<String>,
    Query(params): Query<StatusParams>,
) -> Result<impl IntoResponse, ApiError> {
    let progress = state
        .store
        .get_batch(&batch_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("No batch with id {batch_id}")))?;

    let mut body = json!({
        "batch_id": progress.batch_id,
        "tool": progress.tool,
        "created_at": progress.created_at,
        "total": progress.total,
        "completed": progress.completed,
        "failed": progress.failed,
        "pending": progress.pending(),
        "done": progress.is_terminal(),
    });

    if params.results {
        let limit = params.limit.unwrap_or(DEFAULT_RESULT_LIMIT);
        let records = state.store.results_for_batch(&batch_id, limit).await?;
        body["results"] = serde_json::to_value(records)
            .map_err(|e| ApiError::Internal(e.to_string()))?;
    }

    Ok(Json(body))
}
