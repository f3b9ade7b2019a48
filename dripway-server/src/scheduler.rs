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

//! Drip scheduler.
//!
//! The single-flight consumer of the job queue. At most one job is in
//! flight system-wide, and consecutive job executions start at least one
//! drip interval apart. A slow job does not earn the next one an early
//! start, and there is no catch-up burst after a stall.
//!
//! Two retry layers meet here and stay separate: the downstream client
//! retries transport faults inside one execution without touching the job's
//! attempt budget, while this module's re-queues consume that budget and
//! pass through the drip gate like any other job.

use crate::callback::{CallbackDispatcher, CallbackPayload};
use crate::config::GatewayConfig;
use crate::downstream::Downstream;
use chrono::Utc;
use dripway_core::{
    job_retry_delay, ClaimedJob, Job, JobStatus, JobStore, ResultRecord, ToolRegistry,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Minimum spacing between job execution starts.
    pub drip_interval: Duration,
    /// How long one `claim_next` poll blocks before the loop re-checks
    /// for shutdown.
    pub claim_poll: Duration,
    /// Base delay for job-level retries (`base * 2^(n-1)`).
    pub retry_base_delay: Duration,
    /// Lease renewal period while a job executes.
    pub lease_renew_interval: Duration,
    /// TTL applied to result records.
    pub result_ttl: Duration,
    /// How long shutdown waits for the in-flight job.
    pub grace: Duration,
}

impl SchedulerConfig {
    pub fn from_gateway(config: &GatewayConfig) -> Self {
        Self {
            drip_interval: config.drip_interval(),
            claim_poll: Duration::from_secs(1),
            retry_base_delay: Duration::from_secs(5),
            lease_renew_interval: (config.claim_lease() / 2).min(Duration::from_secs(30)),
            result_ttl: config.result_ttl(),
            grace: config.shutdown_grace(),
        }
    }
}

/// Token gate with capacity one, refilled once per drip interval.
struct DripGate {
    interval: Duration,
    last_start: Option<Instant>,
}

impl DripGate {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_start: None,
        }
    }

    /// Wait until a full interval has passed since the previous start,
    /// then mark the new start.
    async fn pace(&mut self) {
        if let Some(last) = self.last_start {
            tokio::time::sleep_until(last + self.interval).await;
        }
        self.last_start = Some(Instant::now());
    }
}

pub struct DripScheduler {
    store: Arc<dyn JobStore>,
    registry: Arc<ToolRegistry>,
    downstream: Arc<dyn Downstream>,
    callbacks: Arc<CallbackDispatcher>,
    config: SchedulerConfig,
}

impl DripScheduler {
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: Arc<ToolRegistry>,
        downstream: Arc<dyn Downstream>,
        callbacks: Arc<CallbackDispatcher>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            registry,
            downstream,
            callbacks,
            config,
        }
    }

    /// Main loop. Returns once `shutdown` flips to `true` and the in-flight
    /// job (if any) has drained or the grace period elapsed.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut gate = DripGate::new(self.config.drip_interval);
        info!(
            drip_interval_ms = self.config.drip_interval.as_millis() as u64,
            "drip scheduler started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let claimed = tokio::select! {
                _ = shutdown.changed() => break,
                result = self.store.claim_next(self.config.claim_poll) => match result {
                    Ok(Some(claimed)) => claimed,
                    Ok(None) => continue,
                    Err(err) => {
                        error!(error = %err, "claim failed, backing off");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                },
            };

            // the claimed job waits out the gate under its lease; if
            // shutdown lands here the lease lapses and the job is reclaimed
            tokio::select! {
                _ = gate.pace() => {}
                _ = shutdown.changed() => break,
            }

            let work = self.process_claimed(claimed);
            tokio::pin!(work);
            tokio::select! {
                _ = &mut work => {}
                _ = shutdown.changed() => {
                    info!("shutdown requested, draining in-flight job");
                    if tokio::time::timeout(self.config.grace, &mut work).await.is_err() {
                        warn!("grace period elapsed, abandoning in-flight job to lease recovery");
                    }
                    break;
                }
            }
        }

        info!("drip scheduler stopped");
    }

    /// Run one claimed job while keeping its lease renewed.
    async fn process_claimed(&self, claimed: ClaimedJob) {
        let job_id = claimed.job.job_id.clone();
        let mut renew = tokio::time::interval(self.config.lease_renew_interval);
        renew.set_missed_tick_behavior(MissedTickBehavior::Delay);
        renew.tick().await; // first tick fires immediately

        let work = self.process_job(claimed.job);
        tokio::pin!(work);
        loop {
            tokio::select! {
                _ = &mut work => break,
                _ = renew.tick() => {
                    if let Err(err) = self.store.renew_lease(&job_id).await {
                        warn!(job_id = %job_id, error = %err, "lease renewal failed");
                    }
                }
            }
        }
    }

    async fn process_job(&self, mut job: Job) {
        job.attempts_made += 1;
        job.started_at = Some(Utc::now());
        let attempt = job.attempts_made;
        info!(
            job_id = %job.job_id,
            tool = %job.tool,
            attempt,
            max_attempts = job.max_attempts,
            "job claimed"
        );

        let Some(entry) = self.registry.lookup(&job.tool) else {
            let msg = format!("Unknown tool: {}", job.tool);
            self.fail_terminal(job, msg, attempt).await;
            return;
        };

        let check = self.registry.validate(&job.tool, &job.params);
        if !check.ok {
            self.fail_terminal(
                job,
                format!("Missing required parameters: {}", check.missing.join(", ")),
                attempt,
            )
            .await;
            return;
        }

        match self.downstream.call(entry, &job.params).await {
            Ok(data) => self.complete(job, data, attempt).await,
            Err(err) if err.retryable() && attempt < job.max_attempts => {
                let delay = job_retry_delay(self.config.retry_base_delay, attempt);
                info!(
                    job_id = %job.job_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retry scheduled"
                );
                if let Err(store_err) = self.store.requeue_delayed(job, delay).await {
                    error!(error = %store_err, "failed to requeue job for retry");
                }
            }
            Err(err) => {
                self.fail_terminal(job, err.upstream_message(), attempt)
                    .await
            }
        }
    }

    async fn complete(&self, mut job: Job, data: serde_json::Value, attempts: u32) {
        job.finished_at = Some(Utc::now());
        let record = ResultRecord::completed(&job, data, attempts);
        self.retire(job, record, JobStatus::Completed).await;
    }

    async fn fail_terminal(&self, mut job: Job, error: String, attempts: u32) {
        job.finished_at = Some(Utc::now());
        warn!(job_id = %job.job_id, attempts, error = %error, "job failed terminally");
        let record = ResultRecord::failed(&job, error, attempts);
        self.retire(job, record, JobStatus::Failed).await;
    }

    /// Common terminal path: result record first, then batch counters,
    /// then lease release, then callback fan-out.
    async fn retire(&self, job: Job, record: ResultRecord, status: JobStatus) {
        let stored = match self.store.put_result(&record, self.config.result_ttl).await {
            Ok(()) => true,
            Err(err) => {
                error!(job_id = %job.job_id, error = %err, "failed to store result record");
                false
            }
        };

        if let Some(batch_id) = &job.batch_id {
            if let Err(err) = self.store.incr_batch(batch_id, status).await {
                error!(batch_id = %batch_id, error = %err, "failed to bump batch counter");
            }
        }

        if let Err(err) = self.store.finish(&job, status).await {
            error!(job_id = %job.job_id, error = %err, "failed to retire job");
        }

        info!(
            job_id = %job.job_id,
            status = status.as_str(),
            attempts = record.attempts,
            "job finished"
        );

        // fan out concurrently with the next drip tick; a record must exist
        // before any delivery attempt
        if stored && job.callback_url.is_some() {
            let dispatcher = Arc::clone(&self.callbacks);
            let url = job.callback_url.clone();
            let payload = CallbackPayload::from_record(&record);
            tokio::spawn(async move {
                let outcome = dispatcher.dispatch(url.as_deref(), &payload).await;
                if outcome.success {
                    info!(
                        job_id = %payload.job_id,
                        attempts = outcome.attempts,
                        "callback delivered"
                    );
                } else {
                    warn!(
                        job_id = %payload.job_id,
                        attempts = outcome.attempts,
                        error = outcome.error.as_deref().unwrap_or("unknown"),
                        "callback delivery failed, job status unchanged"
                    );
                }
            });
        }
    }
}
