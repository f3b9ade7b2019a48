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

//! Redis-backed job store.
//!
//! Key layout under a configurable prefix:
//!
//! ```text
//! {p}:jobs                          sorted set, score = priority * 1e12 + seq
//! {p}:delayed                       sorted set, score = due time (ms epoch)
//! {p}:active                        hash, job_id -> lease deadline (ms epoch)
//! {p}:job:{job_id}                  job JSON while queued or active
//! {p}:batch:{batch_id}              hash (total/completed/failed/created_at/tool), TTL
//! {p}:result:{job_id}[:{batch_id}]  result JSON, TTL
//! {p}:completed / {p}:failed        sorted sets of retired job ids, score = finish ms
//! {p}:seq                           monotonic counter for FIFO tie-breaks
//! ```
//!
//! `claim_next` is a single-consumer pop; each individual mutation is
//! atomic, so concurrent read-only observers (stats, status) are safe.

use super::{ClaimedJob, JobStore, RetentionPolicy, StoreError, DEFAULT_CLAIM_LEASE};
use crate::job::{BatchProgress, Job, JobStatus, QueueStats, ResultRecord};
use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use std::collections::HashMap;
use std::time::{Duration, Instant};

const CLAIM_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Spread between priority bands in the queue score; seq must stay below
/// this for FIFO order to hold within a band.
const PRIORITY_BAND: f64 = 1e12;

pub struct RedisStore {
    conn: ConnectionManager,
    prefix: String,
    lease: Duration,
    retention: RetentionPolicy,
}

impl RedisStore {
    /// Connect eagerly so a bad `STORE_URL` fails at boot, not first use.
    pub async fn connect(url: &str, prefix: impl Into<String>) -> Result<Self, StoreError> {
        let client =
            redis::Client::open(url).map_err(|e| StoreError::Connection(e.to_string()))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        Ok(Self {
            conn,
            prefix: prefix.into(),
            lease: DEFAULT_CLAIM_LEASE,
            retention: RetentionPolicy::default(),
        })
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}:{}", self.prefix, suffix)
    }

    fn job_key(&self, job_id: &str) -> String {
        self.key(&format!("job:{job_id}"))
    }

    fn result_key(job_id: &str, batch_id: Option<&str>) -> String {
        match batch_id {
            Some(batch_id) => format!("result:{job_id}:{batch_id}"),
            None => format!("result:{job_id}"),
        }
    }

    async fn next_seq(&self, conn: &mut ConnectionManager) -> Result<i64, StoreError> {
        let seq: i64 = redis::cmd("INCR")
            .arg(self.key("seq"))
            .query_async(conn)
            .await?;
        Ok(seq)
    }

    fn queue_score(priority: u8, seq: i64) -> f64 {
        priority as f64 * PRIORITY_BAND + seq as f64
    }

    async fn enqueue(&self, conn: &mut ConnectionManager, job: &Job) -> Result<(), StoreError> {
        let seq = self.next_seq(conn).await?;
        let payload = serde_json::to_string(job)?;
        redis::pipe()
            .atomic()
            .cmd("SET")
            .arg(self.job_key(&job.job_id))
            .arg(payload)
            .ignore()
            .cmd("ZADD")
            .arg(self.key("jobs"))
            .arg(Self::queue_score(job.priority, seq))
            .arg(&job.job_id)
            .ignore()
            .query_async::<_, ()>(conn)
            .await?;
        Ok(())
    }

    /// Move due delayed jobs back into the waiting set.
    async fn promote_due(&self, conn: &mut ConnectionManager) -> Result<(), StoreError> {
        let now_ms = Utc::now().timestamp_millis();
        let due: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(self.key("delayed"))
            .arg("-inf")
            .arg(now_ms)
            .arg("LIMIT")
            .arg(0)
            .arg(100)
            .query_async(conn)
            .await?;

        for job_id in due {
            let removed: i64 = redis::cmd("ZREM")
                .arg(self.key("delayed"))
                .arg(&job_id)
                .query_async(conn)
                .await?;
            if removed == 0 {
                continue;
            }
            let raw: Option<String> = redis::cmd("GET")
                .arg(self.job_key(&job_id))
                .query_async(conn)
                .await?;
            let Some(raw) = raw else { continue };
            let job: Job = serde_json::from_str(&raw).map_err(|e| StoreError::Corrupt {
                key: self.job_key(&job_id),
                reason: e.to_string(),
            })?;
            let seq = self.next_seq(conn).await?;
            redis::cmd("ZADD")
                .arg(self.key("jobs"))
                .arg(Self::queue_score(job.priority, seq))
                .arg(&job_id)
                .query_async::<_, ()>(conn)
                .await?;
        }
        Ok(())
    }

    /// Return jobs whose lease deadline has passed to the waiting set.
    async fn reclaim_stalled(&self, conn: &mut ConnectionManager) -> Result<(), StoreError> {
        let now_ms = Utc::now().timestamp_millis();
        let active: HashMap<String, i64> = redis::cmd("HGETALL")
            .arg(self.key("active"))
            .query_async(conn)
            .await?;

        for (job_id, deadline_ms) in active {
            if deadline_ms > now_ms {
                continue;
            }
            let removed: i64 = redis::cmd("HDEL")
                .arg(self.key("active"))
                .arg(&job_id)
                .query_async(conn)
                .await?;
            if removed == 0 {
                continue;
            }
            tracing::warn!(job_id = %job_id, "lease expired, returning job to waiting");
            let raw: Option<String> = redis::cmd("GET")
                .arg(self.job_key(&job_id))
                .query_async(conn)
                .await?;
            let Some(raw) = raw else { continue };
            let job: Job = serde_json::from_str(&raw).map_err(|e| StoreError::Corrupt {
                key: self.job_key(&job_id),
                reason: e.to_string(),
            })?;
            let seq = self.next_seq(conn).await?;
            redis::cmd("ZADD")
                .arg(self.key("jobs"))
                .arg(Self::queue_score(job.priority, seq))
                .arg(&job_id)
                .query_async::<_, ()>(conn)
                .await?;
        }
        Ok(())
    }

    async fn trim_terminal(
        &self,
        conn: &mut ConnectionManager,
        set: &str,
        keep: usize,
        age: Duration,
    ) -> Result<(), StoreError> {
        let cutoff_ms = Utc::now().timestamp_millis() - age.as_millis() as i64;
        redis::pipe()
            .cmd("ZREMRANGEBYRANK")
            .arg(self.key(set))
            .arg(0)
            .arg(-(keep as i64 + 1))
            .ignore()
            .cmd("ZREMRANGEBYSCORE")
            .arg(self.key(set))
            .arg("-inf")
            .arg(cutoff_ms)
            .ignore()
            .query_async::<_, ()>(conn)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for RedisStore {
    async fn push_one(&self, job: Job) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        self.enqueue(&mut conn, &job).await
    }

    async fn push_bulk(&self, jobs: Vec<Job>) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        let count = jobs.len() as u64;
        for job in &jobs {
            self.enqueue(&mut conn, job).await?;
        }
        Ok(count)
    }

    async fn claim_next(&self, timeout: Duration) -> Result<Option<ClaimedJob>, StoreError> {
        let mut conn = self.conn.clone();
        let deadline = Instant::now() + timeout;
        loop {
            self.promote_due(&mut conn).await?;
            self.reclaim_stalled(&mut conn).await?;

            let popped: Vec<(String, f64)> = redis::cmd("ZPOPMIN")
                .arg(self.key("jobs"))
                .arg(1)
                .query_async(&mut conn)
                .await?;

            if let Some((job_id, _score)) = popped.into_iter().next() {
                let raw: Option<String> = redis::cmd("GET")
                    .arg(self.job_key(&job_id))
                    .query_async(&mut conn)
                    .await?;
                let Some(raw) = raw else {
                    tracing::warn!(job_id = %job_id, "queued job record missing, skipping");
                    continue;
                };
                let job: Job = serde_json::from_str(&raw).map_err(|e| StoreError::Corrupt {
                    key: self.job_key(&job_id),
                    reason: e.to_string(),
                })?;
                let lease_deadline = Utc::now().timestamp_millis() + self.lease.as_millis() as i64;
                redis::cmd("HSET")
                    .arg(self.key("active"))
                    .arg(&job_id)
                    .arg(lease_deadline)
                    .query_async::<_, ()>(&mut conn)
                    .await?;
                return Ok(Some(ClaimedJob {
                    job,
                    lease: self.lease,
                }));
            }

            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(CLAIM_POLL_INTERVAL.min(timeout)).await;
        }
    }

    async fn renew_lease(&self, job_id: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let held: bool = redis::cmd("HEXISTS")
            .arg(self.key("active"))
            .arg(job_id)
            .query_async(&mut conn)
            .await?;
        if !held {
            return Err(StoreError::LeaseLost(job_id.to_string()));
        }
        let lease_deadline = Utc::now().timestamp_millis() + self.lease.as_millis() as i64;
        redis::cmd("HSET")
            .arg(self.key("active"))
            .arg(job_id)
            .arg(lease_deadline)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn requeue_delayed(&self, job: Job, delay: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let due_ms = Utc::now().timestamp_millis() + delay.as_millis() as i64;
        let payload = serde_json::to_string(&job)?;
        redis::pipe()
            .atomic()
            .cmd("HDEL")
            .arg(self.key("active"))
            .arg(&job.job_id)
            .ignore()
            .cmd("SET")
            .arg(self.job_key(&job.job_id))
            .arg(payload)
            .ignore()
            .cmd("ZADD")
            .arg(self.key("delayed"))
            .arg(due_ms)
            .arg(&job.job_id)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn finish(&self, job: &Job, status: JobStatus) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let now_ms = Utc::now().timestamp_millis();
        let set = match status {
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        };
        redis::pipe()
            .atomic()
            .cmd("HDEL")
            .arg(self.key("active"))
            .arg(&job.job_id)
            .ignore()
            .cmd("DEL")
            .arg(self.job_key(&job.job_id))
            .ignore()
            .cmd("ZADD")
            .arg(self.key(set))
            .arg(now_ms)
            .arg(&job.job_id)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;

        match status {
            JobStatus::Completed => {
                self.trim_terminal(
                    &mut conn,
                    "completed",
                    self.retention.completed_count,
                    self.retention.completed_age,
                )
                .await
            }
            JobStatus::Failed => {
                self.trim_terminal(
                    &mut conn,
                    "failed",
                    self.retention.failed_count,
                    self.retention.failed_age,
                )
                .await
            }
        }
    }

    async fn create_batch(&self, batch: &BatchProgress, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let key = self.key(&format!("batch:{}", batch.batch_id));
        redis::pipe()
            .atomic()
            .cmd("HSET")
            .arg(&key)
            .arg("total")
            .arg(batch.total)
            .arg("completed")
            .arg(batch.completed)
            .arg("failed")
            .arg(batch.failed)
            .arg("created_at")
            .arg(batch.created_at.to_rfc3339())
            .arg("tool")
            .arg(&batch.tool)
            .ignore()
            .cmd("EXPIRE")
            .arg(&key)
            .arg(ttl.as_secs())
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn get_batch(&self, batch_id: &str) -> Result<Option<BatchProgress>, StoreError> {
        let mut conn = self.conn.clone();
        let key = self.key(&format!("batch:{batch_id}"));
        let fields: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(&key)
            .query_async(&mut conn)
            .await?;
        if fields.is_empty() {
            return Ok(None);
        }
        let get_u64 = |name: &str| -> Result<u64, StoreError> {
            fields
                .get(name)
                .and_then(|v| v.parse().ok())
                .ok_or_else(|| StoreError::Corrupt {
                    key: key.clone(),
                    reason: format!("missing or non-numeric field {name}"),
                })
        };
        let created_at = fields
            .get("created_at")
            .and_then(|v| chrono::DateTime::parse_from_rfc3339(v).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .ok_or_else(|| StoreError::Corrupt {
                key: key.clone(),
                reason: "missing or malformed created_at".to_string(),
            })?;
        Ok(Some(BatchProgress {
            batch_id: batch_id.to_string(),
            tool: fields.get("tool").cloned().unwrap_or_default(),
            created_at,
            total: get_u64("total")?,
            completed: get_u64("completed")?,
            failed: get_u64("failed")?,
        }))
    }

    async fn incr_batch(&self, batch_id: &str, status: JobStatus) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let field = match status {
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        };
        redis::cmd("HINCRBY")
            .arg(self.key(&format!("batch:{batch_id}")))
            .arg(field)
            .arg(1)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn put_result(&self, record: &ResultRecord, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let key = self.key(&Self::result_key(&record.job_id, record.batch_id.as_deref()));
        let payload = serde_json::to_string(record)?;
        redis::cmd("SETEX")
            .arg(&key)
            .arg(ttl.as_secs())
            .arg(payload)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn results_for_batch(
        &self,
        batch_id: &str,
        limit: usize,
    ) -> Result<Vec<ResultRecord>, StoreError> {
        let mut conn = self.conn.clone();
        let pattern = self.key(&format!("result:*:{batch_id}"));

        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, chunk): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await?;
            keys.extend(chunk);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        let mut records = Vec::with_capacity(keys.len().min(limit));
        for key in keys {
            let raw: Option<String> = redis::cmd("GET").arg(&key).query_async(&mut conn).await?;
            let Some(raw) = raw else { continue };
            let record: ResultRecord =
                serde_json::from_str(&raw).map_err(|e| StoreError::Corrupt {
                    key: key.clone(),
                    reason: e.to_string(),
                })?;
            records.push(record);
        }
        records.sort_by_key(|r| r.stored_at);
        records.truncate(limit);
        Ok(records)
    }

    async fn stats(&self) -> Result<QueueStats, StoreError> {
        let mut conn = self.conn.clone();
        let (waiting, delayed, completed, failed): (u64, u64, u64, u64) = redis::pipe()
            .cmd("ZCARD")
            .arg(self.key("jobs"))
            .cmd("ZCARD")
            .arg(self.key("delayed"))
            .cmd("ZCARD")
            .arg(self.key("completed"))
            .cmd("ZCARD")
            .arg(self.key("failed"))
            .query_async(&mut conn)
            .await?;
        let active: u64 = redis::cmd("HLEN")
            .arg(self.key("active"))
            .query_async(&mut conn)
            .await?;
        Ok(QueueStats {
            waiting,
            active,
            delayed,
            completed,
            failed,
        })
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        if pong == "PONG" {
            Ok(())
        } else {
            Err(StoreError::Connection(format!("unexpected PING reply: {pong}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_score_orders_priority_before_seq() {
        // a later high-priority job still beats an earlier low-priority one
        let early_low = RedisStore::queue_score(5, 10);
        let late_high = RedisStore::queue_score(1, 10_000);
        assert!(late_high < early_low);

        // FIFO within a band
        let first = RedisStore::queue_score(5, 11);
        let second = RedisStore::queue_score(5, 12);
        assert!(first < second);
    }

    #[test]
    fn result_keys_encode_batch_membership() {
        assert_eq!(RedisStore::result_key("job_1", None), "result:job_1");
        assert_eq!(
            RedisStore::result_key("job_1", Some("batch_9")),
            "result:job_1:batch_9"
        );
    }
}
