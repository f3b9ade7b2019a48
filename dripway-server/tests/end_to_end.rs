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

//! End-to-end scenarios with a real downstream server and callback
//! receiver on ephemeral ports.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use dripway_core::{
    BatchProgress, Job, JobStatus, JobStore, MemoryStore, RetryPolicy, ToolRegistry,
};
use dripway_server::callback::CallbackDispatcher;
use dripway_server::config::GatewayConfig;
use dripway_server::downstream::{Downstream, HttpDownstream};
use dripway_server::scheduler::{DripScheduler, SchedulerConfig};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Downstream double: scripted status codes, captured request bodies.
#[derive(Clone, Default)]
struct FakeDownstream {
    script: Arc<Mutex<VecDeque<u16>>>,
    requests: Arc<Mutex<Vec<Value>>>,
    delay: Option<Duration>,
}

impl FakeDownstream {
    fn scripted(codes: &[u16]) -> Self {
        Self {
            script: Arc::new(Mutex::new(codes.iter().copied().collect())),
            ..Self::default()
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    fn requests(&self) -> Vec<Value> {
        self.requests.lock().unwrap().clone()
    }

    async fn spawn(self) -> SocketAddr {
        let router = Router::new()
            .route("/api/linkedin/profile", post(fake_downstream_handler))
            .with_state(self.clone());
        spawn_server(router).await
    }
}

async fn fake_downstream_handler(
    State(fake): State<FakeDownstream>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    fake.requests.lock().unwrap().push(body);
    if let Some(delay) = fake.delay {
        tokio::time::sleep(delay).await;
    }
    let code = fake.script.lock().unwrap().pop_front().unwrap_or(200);
    match code {
        200 => (StatusCode::OK, Json(json!({"profile": {"name": "Test"}}))),
        code => (
            StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            Json(json!({"error": "scripted failure"})),
        ),
    }
}

/// Callback receiver double: records attempt headers and payloads.
#[derive(Clone, Default)]
struct CallbackReceiver {
    script: Arc<Mutex<VecDeque<u16>>>,
    deliveries: Arc<Mutex<Vec<(u32, String, Value)>>>,
}

impl CallbackReceiver {
    fn scripted(codes: &[u16]) -> Self {
        Self {
            script: Arc::new(Mutex::new(codes.iter().copied().collect())),
            ..Self::default()
        }
    }

    fn deliveries(&self) -> Vec<(u32, String, Value)> {
        self.deliveries.lock().unwrap().clone()
    }

    async fn spawn(self) -> SocketAddr {
        let router = Router::new()
            .route("/hooks/result", post(callback_receiver_handler))
            .with_state(self.clone());
        spawn_server(router).await
    }
}

async fn callback_receiver_handler(
    State(receiver): State<CallbackReceiver>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> StatusCode {
    let attempt = headers
        .get("x-attempt")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let idempotency_key = headers
        .get("x-idempotency-key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    receiver
        .deliveries
        .lock()
        .unwrap()
        .push((attempt, idempotency_key, body));
    let code = receiver.script.lock().unwrap().pop_front().unwrap_or(200);
    StatusCode::from_u16(code).unwrap_or(StatusCode::OK)
}

async fn spawn_server(router: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

fn gateway_config(downstream: SocketAddr) -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.webhook_secret = "secret".to_string();
    config.downstream_api_key = "test-key".to_string();
    config.store_url = "memory://".to_string();
    config.downstream_base_url = format!("http://{downstream}");
    config.downstream_timeout_ms = 2000;
    config.callback_timeout_ms = 2000;
    config.callback_retry_delay_ms = 20;
    config
}

fn fast_retry_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        initial_delay: Duration::from_millis(20),
        max_delay: Duration::from_millis(200),
        multiplier: 2.0,
        jitter: 0.1,
    }
}

fn scheduler_config(drip_ms: u64) -> SchedulerConfig {
    SchedulerConfig {
        drip_interval: Duration::from_millis(drip_ms),
        claim_poll: Duration::from_millis(20),
        retry_base_delay: Duration::from_millis(20),
        lease_renew_interval: Duration::from_millis(500),
        result_ttl: Duration::from_secs(60),
        grace: Duration::from_secs(5),
    }
}

struct Harness {
    store: Arc<MemoryStore>,
    shutdown: watch::Sender<bool>,
    worker: tokio::task::JoinHandle<()>,
}

impl Harness {
    fn start(config: &GatewayConfig, scheduler_config: SchedulerConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let downstream: Arc<dyn Downstream> = Arc::new(
            HttpDownstream::new(config)
                .unwrap()
                .with_policy(fast_retry_policy()),
        );
        let callbacks = Arc::new(CallbackDispatcher::new(config).unwrap());
        let scheduler = DripScheduler::new(
            store.clone(),
            Arc::new(ToolRegistry::new()),
            downstream,
            callbacks,
            scheduler_config,
        );
        let (tx, rx) = watch::channel(false);
        let worker = tokio::spawn(async move { scheduler.run(rx).await });
        Self {
            store,
            shutdown: tx,
            worker,
        }
    }

    async fn stop(self) {
        self.shutdown.send(true).ok();
        self.worker.await.unwrap();
    }
}

async fn wait_for<F>(mut condition: F, budget: Duration, what: &str)
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + budget;
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn wait_for_stats<F>(store: &Arc<MemoryStore>, budget: Duration, what: &str, check: F)
where
    F: Fn(dripway_core::QueueStats) -> bool,
{
    let deadline = Instant::now() + budget;
    loop {
        let stats = store.stats().await.unwrap();
        if check(stats) {
            return;
        }
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn single_happy_path_reaches_downstream_verbatim() {
    let fake = FakeDownstream::default();
    let addr = fake.clone().spawn().await;
    let config = gateway_config(addr);
    let harness = Harness::start(&config, scheduler_config(30));

    let job = Job::new(
        "get_linkedin_profile",
        json!({"user": "https://linkedin.com/in/x"}),
        "r1",
        3,
    );
    harness.store.push_one(job).await.unwrap();

    wait_for_stats(&harness.store, Duration::from_secs(5), "job completion", |s| {
        s.completed == 1
    })
    .await;

    let requests = fake.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0], json!({"user": "https://linkedin.com/in/x"}));

    harness.stop().await;
}

#[tokio::test]
async fn rate_limited_downstream_recovers_without_spending_job_budget() {
    // 429 twice, then success: transport retries absorb it inside one
    // job execution
    let fake = FakeDownstream::scripted(&[429, 429, 200]);
    let addr = fake.clone().spawn().await;
    let config = gateway_config(addr);
    let harness = Harness::start(&config, scheduler_config(10));

    let batch = BatchProgress::new("batch_429", "get_linkedin_profile", 1);
    harness
        .store
        .create_batch(&batch, Duration::from_secs(60))
        .await
        .unwrap();
    let job = Job::new(
        "get_linkedin_profile",
        json!({"user": "https://linkedin.com/in/x"}),
        "r1",
        3,
    )
    .with_batch("batch_429");
    harness.store.push_one(job).await.unwrap();

    wait_for_stats(&harness.store, Duration::from_secs(5), "job completion", |s| {
        s.completed == 1
    })
    .await;

    assert_eq!(fake.request_count(), 3);
    let records = harness
        .store
        .results_for_batch("batch_429", 10)
        .await
        .unwrap();
    assert_eq!(records[0].status, JobStatus::Completed);
    // one execution consumed, despite three wire attempts
    assert_eq!(records[0].attempts, 1);

    harness.stop().await;
}

#[tokio::test]
async fn persistent_server_errors_exhaust_both_retry_layers() {
    // every wire attempt answers 503; 3 transport attempts per execution,
    // 3 executions per job
    let fake = FakeDownstream::scripted(&[503; 9]);
    let addr = fake.clone().spawn().await;
    let config = gateway_config(addr);

    let receiver = CallbackReceiver::default();
    let receiver_addr = receiver.clone().spawn().await;

    let harness = Harness::start(&config, scheduler_config(10));
    let batch = BatchProgress::new("batch_503", "get_linkedin_profile", 1);
    harness
        .store
        .create_batch(&batch, Duration::from_secs(60))
        .await
        .unwrap();
    let job = Job::new(
        "get_linkedin_profile",
        json!({"user": "https://linkedin.com/in/x"}),
        "r1",
        3,
    )
    .with_batch("batch_503")
    .with_callback(Some(format!("http://{receiver_addr}/hooks/result")));
    harness.store.push_one(job.clone()).await.unwrap();

    wait_for_stats(&harness.store, Duration::from_secs(10), "job failure", |s| {
        s.failed == 1
    })
    .await;

    assert_eq!(fake.request_count(), 9);
    let records = harness
        .store
        .results_for_batch("batch_503", 10)
        .await
        .unwrap();
    assert_eq!(records[0].status, JobStatus::Failed);
    assert_eq!(records[0].attempts, 3);
    assert!(records[0].error.as_deref().unwrap().contains("503"));

    let progress = harness.store.get_batch("batch_503").await.unwrap().unwrap();
    assert_eq!(progress.failed, 1);

    // failure callback arrives once with the attempt count
    wait_for(
        || !receiver.deliveries().is_empty(),
        Duration::from_secs(5),
        "failure callback",
    )
    .await;
    let deliveries = receiver.deliveries();
    assert_eq!(deliveries.len(), 1);
    let (attempt, idempotency_key, payload) = &deliveries[0];
    assert_eq!(*attempt, 1);
    assert_eq!(idempotency_key, &job.job_id);
    assert_eq!(payload["status"], "failed");
    assert_eq!(payload["attempts"], 3);
    assert_eq!(payload["row_id"], "r1");

    harness.stop().await;
}

#[tokio::test]
async fn callback_failures_never_change_job_status() {
    let fake = FakeDownstream::default();
    let addr = fake.clone().spawn().await;
    let config = gateway_config(addr);

    let receiver = CallbackReceiver::scripted(&[500, 500, 500]);
    let receiver_addr = receiver.clone().spawn().await;

    let harness = Harness::start(&config, scheduler_config(10));
    let batch = BatchProgress::new("batch_cb", "get_linkedin_profile", 1);
    harness
        .store
        .create_batch(&batch, Duration::from_secs(60))
        .await
        .unwrap();
    let job = Job::new(
        "get_linkedin_profile",
        json!({"user": "https://linkedin.com/in/x"}),
        "r1",
        3,
    )
    .with_batch("batch_cb")
    .with_callback(Some(format!("http://{receiver_addr}/hooks/result")));
    harness.store.push_one(job).await.unwrap();

    wait_for_stats(&harness.store, Duration::from_secs(5), "job completion", |s| {
        s.completed == 1
    })
    .await;

    // all delivery attempts burn out against the receiver
    wait_for(
        || receiver.deliveries().len() == 3,
        Duration::from_secs(5),
        "callback retries",
    )
    .await;

    let attempts: Vec<u32> = receiver.deliveries().iter().map(|(a, _, _)| *a).collect();
    assert_eq!(attempts, vec![1, 2, 3]);

    // job and batch state are untouched by the delivery failure
    let records = harness.store.results_for_batch("batch_cb", 10).await.unwrap();
    assert_eq!(records[0].status, JobStatus::Completed);
    let progress = harness.store.get_batch("batch_cb").await.unwrap().unwrap();
    assert_eq!(progress.completed, 1);
    assert_eq!(progress.failed, 0);

    harness.stop().await;
}

#[tokio::test]
async fn batch_drip_pacing_spaces_downstream_requests() {
    let fake = FakeDownstream::default();
    let addr = fake.clone().spawn().await;
    let config = gateway_config(addr);
    let drip = Duration::from_millis(100);
    let harness = Harness::start(&config, scheduler_config(100));

    let batch = BatchProgress::new("batch_pace", "get_linkedin_profile", 3);
    harness
        .store
        .create_batch(&batch, Duration::from_secs(60))
        .await
        .unwrap();
    let jobs: Vec<Job> = (0..3)
        .map(|i| {
            Job::new(
                "get_linkedin_profile",
                json!({"user": format!("https://linkedin.com/in/u{i}")}),
                format!("r{i}"),
                3,
            )
            .with_batch("batch_pace")
        })
        .collect();

    let started = Instant::now();
    harness.store.push_bulk(jobs).await.unwrap();

    wait_for_stats(&harness.store, Duration::from_secs(5), "batch drain", |s| {
        s.completed == 3
    })
    .await;
    let elapsed = started.elapsed();

    // three executions, two full gaps between them
    assert!(
        elapsed >= drip.mul_f64(1.8),
        "batch drained in {}ms, faster than the drip interval allows",
        elapsed.as_millis()
    );

    let progress = harness.store.get_batch("batch_pace").await.unwrap().unwrap();
    assert_eq!(progress.completed, 3);
    assert_eq!(progress.failed, 0);

    harness.stop().await;
}

#[tokio::test]
async fn shutdown_mid_job_finishes_the_job_first() {
    let fake = FakeDownstream::default().with_delay(Duration::from_millis(300));
    let addr = fake.clone().spawn().await;
    let config = gateway_config(addr);
    let harness = Harness::start(&config, scheduler_config(10));

    let job = Job::new(
        "get_linkedin_profile",
        json!({"user": "https://linkedin.com/in/x"}),
        "r1",
        3,
    );
    harness.store.push_one(job).await.unwrap();

    // wait until the downstream call is in flight, then ask for shutdown
    wait_for(
        || fake.request_count() == 1,
        Duration::from_secs(5),
        "downstream call start",
    )
    .await;
    harness.shutdown.send(true).ok();
    harness.worker.await.unwrap();

    // the in-flight job completed during the grace period
    let stats = harness.store.stats().await.unwrap();
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.active, 0);
}
