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

//! Submission endpoints.
//!
//! Required-parameter checks are deliberately left to the worker so one bad
//! record cannot block its batch at the door; the ingress only verifies the
//! envelope (tool exists, sizes, URL and priority shapes).

use super::{ApiError, AppState};
use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use dripway_core::{
    job::short_uuid, BatchProgress, Job, PRIORITY_DEFAULT, PRIORITY_HIGHEST, PRIORITY_LOWEST,
};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::info;

#[derive(Debug, Deserialize)]
pub struct BatchSubmission {
    pub tool: String,
    pub records: Vec<Value>,
    #[serde(default)]
    pub callback_url: Option<String>,
    #[serde(default)]
    pub priority: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct SingleSubmission {
    pub tool: String,
    pub params: Value,
    #[serde(default)]
    pub row_id: Option<String>,
    #[serde(default)]
    pub callback_url: Option<String>,
    #[serde(default)]
    pub priority: Option<i64>,
}

fn check_tool(state: &AppState, tool: &str) -> Result<(), ApiError> {
    if state.registry.contains(tool) {
        return Ok(());
    }
    Err(ApiError::UnknownTool {
        tool: tool.to_string(),
        available: state.registry.list().iter().map(|s| s.to_string()).collect(),
    })
}

fn check_callback_url(url: &Option<String>) -> Result<(), ApiError> {
    let Some(url) = url else { return Ok(()) };
    let parsed = reqwest::Url::parse(url)
        .map_err(|_| ApiError::BadRequest(format!("callback_url is not an absolute URL: {url}")))?;
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Err(ApiError::BadRequest(format!(
            "callback_url must be http or https, got {}",
            parsed.scheme()
        )));
    }
    Ok(())
}

fn check_priority(priority: Option<i64>) -> Result<u8, ApiError> {
    match priority {
        None => Ok(PRIORITY_DEFAULT),
        Some(p) if (PRIORITY_HIGHEST as i64..=PRIORITY_LOWEST as i64).contains(&p) => Ok(p as u8),
        Some(p) => Err(ApiError::BadRequest(format!(
            "priority must be between {PRIORITY_HIGHEST} and {PRIORITY_LOWEST}, got {p}"
        ))),
    }
}

/// POST /api/batch
pub async fn submit_batch(
    State(state): State<AppState>,
    Json(submission): Json<BatchSubmission>,
) -> Result<impl IntoResponse, ApiError> {
    check_tool(&state, &submission.tool)?;

    if submission.records.is_empty() {
        return Err(ApiError::BadRequest(
            "records must contain at least one entry".to_string(),
        ));
    }
    if submission.records.len() > state.config.max_batch_size {
        return Err(ApiError::BadRequest(format!(
            "records exceeds the batch cap: {} entries (maximum {})",
            submission.records.len(),
            state.config.max_batch_size
        )));
    }
    check_callback_url(&submission.callback_url)?;
    let priority = check_priority(submission.priority)?;

    let batch_id = format!("batch_{}", short_uuid());
    let total = submission.records.len() as u64;

    let mut jobs = Vec::with_capacity(submission.records.len());
    for (index, record) in submission.records.into_iter().enumerate() {
        let mut record: Map<String, Value> = match record {
            Value::Object(map) => map,
            other => {
                return Err(ApiError::BadRequest(format!(
                    "records[{index}] must be an object, got {}",
                    value_kind(&other)
                )))
            }
        };
        let row_id = match record.remove("row_id") {
            Some(Value::String(s)) if !s.is_empty() => s,
            _ => format!("{batch_id}_{index}"),
        };
        let job = Job::new(
            submission.tool.clone(),
            Value::Object(record),
            row_id,
            state.config.max_job_attempts,
        )
        .with_batch(batch_id.clone())
        .with_callback(submission.callback_url.clone())
        .with_priority(priority);
        jobs.push(job);
    }

    let batch = BatchProgress::new(batch_id.clone(), submission.tool.clone(), total);
    state.store.create_batch(&batch, state.config.batch_ttl()).await?;
    let queued = state.store.push_bulk(jobs).await?;

    info!(
        batch_id = %batch_id,
        tool = %submission.tool,
        jobs_queued = queued,
        "batch accepted"
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "success": true,
            "batch_id": batch_id,
            "jobs_queued": queued,
            "estimated_completion_seconds": state.config.estimated_completion_seconds(total),
            "status_url": format!("/api/status/{batch_id}"),
        })),
    ))
}

/// POST /api/single
pub async fn submit_single(
    State(state): State<AppState>,
    Json(submission): Json<SingleSubmission>,
) -> Result<impl IntoResponse, ApiError> {
    check_tool(&state, &submission.tool)?;

    if !submission.params.is_object() {
        return Err(ApiError::BadRequest(format!(
            "params must be an object, got {}",
            value_kind(&submission.params)
        )));
    }
    check_callback_url(&submission.callback_url)?;
    let priority = check_priority(submission.priority)?;

    let row_id = submission
        .row_id
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| format!("single_{}", short_uuid()));

    let job = Job::new(
        submission.tool.clone(),
        submission.params,
        row_id.clone(),
        state.config.max_job_attempts,
    )
    .with_callback(submission.callback_url)
    .with_priority(priority);
    let job_id = job.job_id.clone();

    // position is informational; a claim racing this read only shifts it by one
    let stats = state.store.stats().await?;
    let position = stats.waiting + stats.active + 1;

    state.store.push_one(job).await?;

    info!(job_id = %job_id, tool = %submission.tool, position, "single job accepted");

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "success": true,
            "job_id": job_id,
            "row_id": row_id,
            "position": position,
            "estimated_wait_seconds": state.config.estimated_completion_seconds(position),
        })),
    ))
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
