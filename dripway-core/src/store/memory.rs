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

//! In-process job store.
//!
//! Queue ordering uses a composite `(priority, seq)` key so a plain
//! `BTreeMap` yields highest-priority-first, FIFO within a priority.
//! Leases, delayed retries, batch TTLs and result TTLs are all swept
//! lazily on access.

use super::{ClaimedJob, JobStore, RetentionPolicy, StoreError, DEFAULT_CLAIM_LEASE};
use crate::job::{BatchProgress, Job, JobStatus, QueueStats, ResultRecord};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::{Duration, Instant};

const CLAIM_POLL_INTERVAL: Duration = Duration::from_millis(20);

struct ActiveJob {
    job: Job,
    lease_deadline: Instant,
}

struct BatchSlot {
    progress: BatchProgress,
    expires_at: Instant,
}

struct ResultSlot {
    record: ResultRecord,
    expires_at: Instant,
}

#[derive(Default)]
struct Inner {
    seq: u64,
    waiting: BTreeMap<(u8, u64), Job>,
    delayed: BTreeMap<(Instant, u64), Job>,
    active: HashMap<String, ActiveJob>,
    batches: HashMap<String, BatchSlot>,
    results: BTreeMap<String, ResultSlot>,
    completed: VecDeque<(Instant, String)>,
    failed: VecDeque<(Instant, String)>,
}

impl Inner {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    /// Promote due delayed jobs and reclaim expired leases.
    fn sweep(&mut self, now: Instant) {
        while self
            .delayed
            .first_key_value()
            .map(|(&(due, _), _)| due <= now)
            .unwrap_or(false)
        {
            if let Some((_, job)) = self.delayed.pop_first() {
                let seq = self.next_seq();
                self.waiting.insert((job.priority, seq), job);
            }
        }

        let expired: Vec<String> = self
            .active
            .iter()
            .filter(|(_, entry)| entry.lease_deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for job_id in expired {
            if let Some(entry) = self.active.remove(&job_id) {
                tracing::warn!(job_id = %job_id, "lease expired, returning job to waiting");
                let seq = self.next_seq();
                self.waiting.insert((entry.job.priority, seq), entry.job);
            }
        }
    }

    fn purge_expired(&mut self, now: Instant) {
        self.batches.retain(|_, slot| slot.expires_at > now);
        self.results.retain(|_, slot| slot.expires_at > now);
    }

    fn trim_retention(&mut self, retention: &RetentionPolicy, now: Instant) {
        while self.completed.len() > retention.completed_count {
            self.completed.pop_front();
        }
        while self
            .completed
            .front()
            .map(|(at, _)| now.duration_since(*at) > retention.completed_age)
            .unwrap_or(false)
        {
            self.completed.pop_front();
        }
        while self.failed.len() > retention.failed_count {
            self.failed.pop_front();
        }
        while self
            .failed
            .front()
            .map(|(at, _)| now.duration_since(*at) > retention.failed_age)
            .unwrap_or(false)
        {
            self.failed.pop_front();
        }
    }
}

/// Job store backed by process memory. State does not survive a restart;
/// the gateway and the worker must share the process.
pub struct MemoryStore {
    inner: Mutex<Inner>,
    lease: Duration,
    retention: RetentionPolicy,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_lease(DEFAULT_CLAIM_LEASE)
    }

    pub fn with_lease(lease: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            lease,
            retention: RetentionPolicy::default(),
        }
    }

    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    fn result_key(record: &ResultRecord) -> String {
        match &record.batch_id {
            Some(batch_id) => format!("{}:{}", record.job_id, batch_id),
            None => record.job_id.clone(),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn push_one(&self, job: Job) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let seq = inner.next_seq();
        inner.waiting.insert((job.priority, seq), job);
        Ok(())
    }

    async fn push_bulk(&self, jobs: Vec<Job>) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock();
        let count = jobs.len() as u64;
        for job in jobs {
            let seq = inner.next_seq();
            inner.waiting.insert((job.priority, seq), job);
        }
        Ok(count)
    }

    async fn claim_next(&self, timeout: Duration) -> Result<Option<ClaimedJob>, StoreError> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut inner = self.inner.lock();
                let now = Instant::now();
                inner.sweep(now);
                if let Some((_, job)) = inner.waiting.pop_first() {
                    inner.active.insert(
                        job.job_id.clone(),
                        ActiveJob {
                            job: job.clone(),
                            lease_deadline: now + self.lease,
                        },
                    );
                    return Ok(Some(ClaimedJob {
                        job,
                        lease: self.lease,
                    }));
                }
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(CLAIM_POLL_INTERVAL.min(timeout)).await;
        }
    }

    async fn renew_lease(&self, job_id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        match inner.active.get_mut(job_id) {
            Some(entry) => {
                entry.lease_deadline = Instant::now() + self.lease;
                Ok(())
            }
            None => Err(StoreError::LeaseLost(job_id.to_string())),
        }
    }

    async fn requeue_delayed(&self, job: Job, delay: Duration) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner.active.remove(&job.job_id);
        let seq = inner.next_seq();
        inner.delayed.insert((Instant::now() + delay, seq), job);
        Ok(())
    }

    async fn finish(&self, job: &Job, status: JobStatus) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        inner.active.remove(&job.job_id);
        match status {
            JobStatus::Completed => inner.completed.push_back((now, job.job_id.clone())),
            JobStatus::Failed => inner.failed.push_back((now, job.job_id.clone())),
        }
        inner.trim_retention(&self.retention, now);
        Ok(())
    }

    async fn create_batch(&self, batch: &BatchProgress, ttl: Duration) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner.batches.insert(
            batch.batch_id.clone(),
            BatchSlot {
                progress: batch.clone(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn get_batch(&self, batch_id: &str) -> Result<Option<BatchProgress>, StoreError> {
        let mut inner = self.inner.lock();
        inner.purge_expired(Instant::now());
        Ok(inner.batches.get(batch_id).map(|slot| slot.progress.clone()))
    }

    async fn incr_batch(&self, batch_id: &str, status: JobStatus) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if let Some(slot) = inner.batches.get_mut(batch_id) {
            match status {
                JobStatus::Completed => slot.progress.completed += 1,
                JobStatus::Failed => slot.progress.failed += 1,
            }
        }
        Ok(())
    }

    async fn put_result(&self, record: &ResultRecord, ttl: Duration) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner.results.insert(
            Self::result_key(record),
            ResultSlot {
                record: record.clone(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn results_for_batch(
        &self,
        batch_id: &str,
        limit: usize,
    ) -> Result<Vec<ResultRecord>, StoreError> {
        let mut inner = self.inner.lock();
        inner.purge_expired(Instant::now());
        let mut records: Vec<ResultRecord> = inner
            .results
            .values()
            .filter(|slot| slot.record.batch_id.as_deref() == Some(batch_id))
            .map(|slot| slot.record.clone())
            .collect();
        records.sort_by_key(|r| r.stored_at);
        records.truncate(limit);
        Ok(records)
    }

    async fn stats(&self) -> Result<QueueStats, StoreError> {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        inner.sweep(now);
        inner.trim_retention(&self.retention, now);
        Ok(QueueStats {
            waiting: inner.waiting.len() as u64,
            active: inner.active.len() as u64,
            delayed: inner.delayed.len() as u64,
            completed: inner.completed.len() as u64,
            failed: inner.failed.len() as u64,
        })
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
