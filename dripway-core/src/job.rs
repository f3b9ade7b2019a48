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

//! Job, batch and result data model.
//!
//! A [`Job`] is one downstream API call plus its correlation metadata. Jobs
//! are created by the ingress, mutated only by the worker that holds their
//! lease, and eventually trimmed by the store's retention policy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lowest numeric value is the highest priority.
pub const PRIORITY_HIGHEST: u8 = 1;
pub const PRIORITY_LOWEST: u8 = 10;
pub const PRIORITY_DEFAULT: u8 = 5;

/// One unit of downstream work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Server-assigned opaque identifier.
    pub job_id: String,

    /// Name of a registered tool.
    pub tool: String,

    /// Request body forwarded verbatim to the downstream endpoint.
    pub params: Value,

    /// Caller correlation key for matching the result back to a source row.
    pub row_id: String,

    /// Group key; `None` for singleton submissions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,

    /// Absolute URL the result is POSTed to, if the caller wants one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,

    /// 1 (highest) to 10 (lowest).
    #[serde(default = "default_priority")]
    pub priority: u8,

    /// Executions already consumed by this job.
    #[serde(default)]
    pub attempts_made: u32,

    /// Execution budget; the job turns terminal once exhausted.
    pub max_attempts: u32,

    pub enqueued_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

fn default_priority() -> u8 {
    PRIORITY_DEFAULT
}

impl Job {
    /// Create a freshly enqueued job with a server-assigned id.
    pub fn new(
        tool: impl Into<String>,
        params: Value,
        row_id: impl Into<String>,
        max_attempts: u32,
    ) -> Self {
        Self {
            job_id: format!("job_{}", short_uuid()),
            tool: tool.into(),
            params,
            row_id: row_id.into(),
            batch_id: None,
            callback_url: None,
            priority: PRIORITY_DEFAULT,
            attempts_made: 0,
            max_attempts,
            enqueued_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn with_batch(mut self, batch_id: impl Into<String>) -> Self {
        self.batch_id = Some(batch_id.into());
        self
    }

    pub fn with_callback(mut self, url: Option<String>) -> Self {
        self.callback_url = url;
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority.clamp(PRIORITY_HIGHEST, PRIORITY_LOWEST);
        self
    }
}

/// First segment of a v4 UUID; enough entropy for process-lifetime uniqueness
/// while staying readable in logs and URLs.
pub fn short_uuid() -> String {
    let id = uuid::Uuid::new_v4().to_string();
    id.split('-').next().unwrap_or(&id).to_string()
}

/// Terminal outcome of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

/// Aggregate accounting for a group of jobs submitted together.
///
/// `completed + failed <= total` holds at all times; equality is the
/// terminal state. Counters only ever increase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchProgress {
    pub batch_id: String,
    pub tool: String,
    pub created_at: DateTime<Utc>,
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
}

impl BatchProgress {
    pub fn new(batch_id: impl Into<String>, tool: impl Into<String>, total: u64) -> Self {
        Self {
            batch_id: batch_id.into(),
            tool: tool.into(),
            created_at: Utc::now(),
            total,
            completed: 0,
            failed: 0,
        }
    }

    pub fn pending(&self) -> u64 {
        self.total.saturating_sub(self.completed + self.failed)
    }

    pub fn is_terminal(&self) -> bool {
        self.completed + self.failed >= self.total
    }
}

/// Written exactly once per job on terminal outcome, before any callback
/// attempt for that job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultRecord {
    pub job_id: String,
    pub row_id: String,
    pub tool: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub attempts: u32,
    pub finished_at: DateTime<Utc>,
    pub stored_at: DateTime<Utc>,
}

impl ResultRecord {
    pub fn completed(job: &Job, data: Value, attempts: u32) -> Self {
        Self::build(job, JobStatus::Completed, Some(data), None, attempts)
    }

    pub fn failed(job: &Job, error: impl Into<String>, attempts: u32) -> Self {
        Self::build(job, JobStatus::Failed, None, Some(error.into()), attempts)
    }

    fn build(
        job: &Job,
        status: JobStatus,
        data: Option<Value>,
        error: Option<String>,
        attempts: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            job_id: job.job_id.clone(),
            row_id: job.row_id.clone(),
            tool: job.tool.clone(),
            batch_id: job.batch_id.clone(),
            status,
            data,
            error,
            attempts,
            finished_at: job.finished_at.unwrap_or(now),
            stored_at: now,
        }
    }
}

/// Point-in-time queue occupancy, reported by the store.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct QueueStats {
    pub waiting: u64,
    pub active: u64,
    pub delayed: u64,
    /// Completed jobs still retained (bounded by count and age).
    pub completed: u64,
    /// Failed jobs still retained (bounded by count and age).
    pub failed: u64,
}

impl QueueStats {
    /// Jobs that still have to pass through the drip gate.
    pub fn backlog(&self) -> u64 {
        self.waiting + self.active + self.delayed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn job_ids_are_unique() {
        let a = Job::new("get_linkedin_profile", json!({}), "r1", 3);
        let b = Job::new("get_linkedin_profile", json!({}), "r1", 3);
        assert_ne!(a.job_id, b.job_id);
        assert!(a.job_id.starts_with("job_"));
    }

    #[test]
    fn priority_is_clamped() {
        let job = Job::new("t", json!({}), "r", 3).with_priority(42);
        assert_eq!(job.priority, PRIORITY_LOWEST);
        let job = Job::new("t", json!({}), "r", 3).with_priority(0);
        assert_eq!(job.priority, PRIORITY_HIGHEST);
    }

    #[test]
    fn batch_pending_never_underflows() {
        let mut batch = BatchProgress::new("batch_x", "t", 2);
        batch.completed = 2;
        batch.failed = 1; // over-count cannot push pending negative
        assert_eq!(batch.pending(), 0);
        assert!(batch.is_terminal());
    }

    #[test]
    fn result_record_roundtrips_through_json() {
        let job = Job::new("get_twitter_profile", json!({"handle": "x"}), "r9", 3)
            .with_batch("batch_abc");
        let record = ResultRecord::completed(&job, json!({"ok": true}), 1);
        let text = serde_json::to_string(&record).unwrap();
        let back: ResultRecord = serde_json::from_str(&text).unwrap();
        assert_eq!(back.job_id, job.job_id);
        assert_eq!(back.status, JobStatus::Completed);
        assert!(back.error.is_none());
    }
}
