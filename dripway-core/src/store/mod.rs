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

//! Durable job store.
//!
//! Four surfaces behind one trait: the priority queue with leased claims,
//! batch counters, TTL-bounded result records, and occupancy stats. Two
//! implementations: [`MemoryStore`] for tests and single-process
//! deployments, [`RedisStore`] for anything where the ingress and the
//! worker run as separate processes.

mod memory;
mod redis;

pub use memory::MemoryStore;
pub use redis::RedisStore;

use crate::job::{BatchProgress, Job, JobStatus, QueueStats, ResultRecord};
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Default lease on a claimed job; a worker that dies mid-job loses the
/// lease and the job returns to waiting.
pub const DEFAULT_CLAIM_LEASE: Duration = Duration::from_secs(300);

/// Default renewal period for held leases.
pub const DEFAULT_LEASE_RENEW_INTERVAL: Duration = Duration::from_secs(30);

/// Retention: completed jobs kept while fewer than this many or younger
/// than [`DEFAULT_COMPLETED_RETENTION_AGE`].
pub const DEFAULT_COMPLETED_RETENTION_COUNT: usize = 1000;
pub const DEFAULT_COMPLETED_RETENTION_AGE: Duration = Duration::from_secs(24 * 3600);
pub const DEFAULT_FAILED_RETENTION_COUNT: usize = 500;
pub const DEFAULT_FAILED_RETENTION_AGE: Duration = Duration::from_secs(7 * 24 * 3600);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store connection failed: {0}")]
    Connection(String),

    #[error("store operation failed: {0}")]
    Operation(String),

    #[error("corrupt record for {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("no active lease for job {0}")]
    LeaseLost(String),
}

impl From<::redis::RedisError> for StoreError {
    fn from(err: ::redis::RedisError) -> Self {
        if err.is_connection_refusal() || err.is_connection_dropped() || err.is_io_error() {
            StoreError::Connection(err.to_string())
        } else {
            StoreError::Operation(err.to_string())
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Corrupt {
            key: String::new(),
            reason: err.to_string(),
        }
    }
}

/// A claimed job together with its lease duration.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub job: Job,
    pub lease: Duration,
}

/// The store every component shares. All counter updates are atomic; the
/// lease holder is the sole mutator of its claimed job.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Enqueue a single job into the waiting set.
    async fn push_one(&self, job: Job) -> Result<(), StoreError>;

    /// Enqueue many jobs preserving submission order within a priority.
    async fn push_bulk(&self, jobs: Vec<Job>) -> Result<u64, StoreError>;

    /// Move the highest-priority waiting job to the active holding area and
    /// lease it to the caller. Blocks up to `timeout` waiting for work;
    /// returns `None` on timeout. Single-consumer.
    async fn claim_next(&self, timeout: Duration) -> Result<Option<ClaimedJob>, StoreError>;

    /// Extend the lease on an active job.
    async fn renew_lease(&self, job_id: &str) -> Result<(), StoreError>;

    /// Put a claimed job back into the waiting set after `delay`, with its
    /// mutated attempt counter. Consumes the lease.
    async fn requeue_delayed(&self, job: Job, delay: Duration) -> Result<(), StoreError>;

    /// Retire a claimed job into the terminal retention set. Consumes the
    /// lease and applies the retention policy.
    async fn finish(&self, job: &Job, status: JobStatus) -> Result<(), StoreError>;

    /// Create batch counters with a TTL measured from creation.
    async fn create_batch(&self, batch: &BatchProgress, ttl: Duration) -> Result<(), StoreError>;

    async fn get_batch(&self, batch_id: &str) -> Result<Option<BatchProgress>, StoreError>;

    /// Atomically bump one of the terminal counters.
    async fn incr_batch(&self, batch_id: &str, status: JobStatus) -> Result<(), StoreError>;

    /// Write the per-job result record with its own TTL.
    async fn put_result(&self, record: &ResultRecord, ttl: Duration) -> Result<(), StoreError>;

    /// Enumerate result records belonging to a batch, most recent last.
    async fn results_for_batch(
        &self,
        batch_id: &str,
        limit: usize,
    ) -> Result<Vec<ResultRecord>, StoreError>;

    async fn stats(&self) -> Result<QueueStats, StoreError>;

    /// Cheap reachability probe for the health endpoint.
    async fn ping(&self) -> Result<(), StoreError>;
}

/// Retention limits applied when a job turns terminal.
#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    pub completed_count: usize,
    pub completed_age: Duration,
    pub failed_count: usize,
    pub failed_age: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            completed_count: DEFAULT_COMPLETED_RETENTION_COUNT,
            completed_age: DEFAULT_COMPLETED_RETENTION_AGE,
            failed_count: DEFAULT_FAILED_RETENTION_COUNT,
            failed_age: DEFAULT_FAILED_RETENTION_AGE,
        }
    }
}
