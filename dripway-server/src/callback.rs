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

//! Callback fan-out.
//!
//! Delivers a per-job result payload to the caller's URL. Delivery is
//! at-least-once: the `x-idempotency-key` header carries the job id so
//! receivers can deduplicate replays after a worker restart. A callback
//! failure is reported and logged but never changes the job's terminal
//! status.

use crate::config::GatewayConfig;
use chrono::{DateTime, Utc};
use dripway_core::{JobStatus, ResultRecord, RetryPolicy};
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

const USER_AGENT: &str = concat!("dripway/", env!("CARGO_PKG_VERSION"));

/// Body POSTed to the caller's `callback_url`.
#[derive(Debug, Clone, Serialize)]
pub struct CallbackPayload {
    pub job_id: String,
    pub row_id: String,
    pub batch_id: Option<String>,
    pub tool: String,
    pub status: JobStatus,
    pub processed_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
}

impl CallbackPayload {
    /// Built from the already-stored result record; the record write always
    /// precedes delivery.
    pub fn from_record(record: &ResultRecord) -> Self {
        Self {
            job_id: record.job_id.clone(),
            row_id: record.row_id.clone(),
            batch_id: record.batch_id.clone(),
            tool: record.tool.clone(),
            status: record.status,
            processed_at: record.finished_at,
            data: record.data.clone(),
            error: record.error.clone(),
            attempts: match record.status {
                JobStatus::Failed => Some(record.attempts),
                JobStatus::Completed => None,
            },
        }
    }
}

/// What happened to one delivery, reported back to the scheduler.
#[derive(Debug, Clone)]
pub struct CallbackOutcome {
    pub success: bool,
    pub attempts: u32,
    pub skipped: bool,
    pub error: Option<String>,
}

impl CallbackOutcome {
    fn skipped() -> Self {
        Self {
            success: true,
            attempts: 0,
            skipped: true,
            error: None,
        }
    }
}

pub struct CallbackDispatcher {
    client: reqwest::Client,
    policy: RetryPolicy,
}

impl CallbackDispatcher {
    pub fn new(config: &GatewayConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.callback_timeout_ms))
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self {
            client,
            policy: RetryPolicy::callback()
                .with_max_attempts(config.callback_max_retries)
                .with_initial_delay(Duration::from_millis(config.callback_retry_delay_ms)),
        })
    }

    /// Deliver `payload` to `callback_url`, retrying transient failures on
    /// an independent schedule. `None` URL is a successful no-op.
    pub async fn dispatch(
        &self,
        callback_url: Option<&str>,
        payload: &CallbackPayload,
    ) -> CallbackOutcome {
        let Some(url) = callback_url else {
            return CallbackOutcome::skipped();
        };

        let mut last_error = String::new();
        for attempt in 1..=self.policy.max_attempts {
            let delay = self.policy.delay_before_attempt(attempt);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            match self.attempt(url, payload, attempt).await {
                Ok(()) => {
                    debug!(job_id = %payload.job_id, attempt, "callback delivered");
                    return CallbackOutcome {
                        success: true,
                        attempts: attempt,
                        skipped: false,
                        error: None,
                    };
                }
                Err(AttemptError { retryable, message }) => {
                    warn!(
                        job_id = %payload.job_id,
                        attempt,
                        error = %message,
                        "callback attempt failed"
                    );
                    last_error = message;
                    if !retryable {
                        return CallbackOutcome {
                            success: false,
                            attempts: attempt,
                            skipped: false,
                            error: Some(last_error),
                        };
                    }
                }
            }
        }

        CallbackOutcome {
            success: false,
            attempts: self.policy.max_attempts,
            skipped: false,
            error: Some(last_error),
        }
    }

    async fn attempt(
        &self,
        url: &str,
        payload: &CallbackPayload,
        attempt: u32,
    ) -> Result<(), AttemptError> {
        let response = self
            .client
            .post(url)
            .header("x-attempt", attempt)
            .header("x-idempotency-key", &payload.job_id)
            .json(payload)
            .send()
            .await
            .map_err(|e| AttemptError {
                retryable: true,
                message: e.to_string(),
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        Err(AttemptError {
            retryable: status.as_u16() == 429 || status.is_server_error(),
            message: format!("callback receiver answered HTTP {status}"),
        })
    }
}

struct AttemptError {
    retryable: bool,
    message: String,
}
