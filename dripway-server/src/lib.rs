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

//! Dripway gateway service.
//!
//! Two roles share this crate and its configuration: `run_server` hosts the
//! HTTP ingress, `run_worker` hosts the single drip scheduler. They meet
//! only in the job store, so they normally run as separate processes.
//! Running more than one worker against the same store breaks the
//! rate-limit contract and is unsupported.

pub mod api;
pub mod auth;
pub mod callback;
pub mod config;
pub mod downstream;
pub mod scheduler;

use anyhow::Result;
use api::AppState;
use auth::{RateLimitConfig, RateLimiter};
use callback::CallbackDispatcher;
use config::GatewayConfig;
use downstream::{Downstream, HttpDownstream};
use dripway_core::{JobStore, MemoryStore, RedisStore, ToolRegistry};
use scheduler::{DripScheduler, SchedulerConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing. `LOG_LEVEL` sets the gateway's own level; `RUST_LOG`
/// still wins for fine-grained per-target control.
pub fn init_tracing() {
    let filter = match std::env::var("LOG_LEVEL") {
        Ok(level) => tracing_subscriber::EnvFilter::new(format!(
            "dripway_server={level},dripway_core={level},tower_http=info"
        )),
        Err(_) => tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "dripway_server=info,dripway_core=info,tower_http=info".into()
        }),
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Open the job store selected by `STORE_URL`.
pub async fn connect_store(config: &GatewayConfig) -> Result<Arc<dyn JobStore>> {
    if config.store_url.starts_with("memory://") {
        info!("using in-process job store; state will not survive a restart");
        Ok(Arc::new(MemoryStore::with_lease(config.claim_lease())))
    } else {
        info!(url = %config.store_url, prefix = %config.store_prefix, "connecting to redis job store");
        let store = RedisStore::connect(&config.store_url, config.store_prefix.clone())
            .await?
            .with_lease(config.claim_lease());
        Ok(Arc::new(store))
    }
}

/// Build the shared application state for the ingress.
pub fn build_state(config: GatewayConfig, store: Arc<dyn JobStore>) -> AppState {
    let limiter = RateLimiter::new(RateLimitConfig {
        max_requests: config.rate_limit_max_requests,
        window: Duration::from_secs(config.rate_limit_window_secs),
        ..RateLimitConfig::default()
    });
    AppState {
        store,
        registry: Arc::new(ToolRegistry::new()),
        config: Arc::new(config),
        limiter: Arc::new(limiter),
    }
}

/// Run the HTTP ingress until a shutdown signal arrives.
pub async fn run_server(config: GatewayConfig) -> Result<()> {
    config.validate()?;
    let port = config.port;
    let store = connect_store(&config).await?;
    let state = build_state(config, store);

    let app = api::router(state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("ingress listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("ingress stopped");
    Ok(())
}

/// Run the drip worker until a shutdown signal arrives, then drain the
/// in-flight job within the configured grace period.
pub async fn run_worker(config: GatewayConfig) -> Result<()> {
    config.validate()?;
    let store = connect_store(&config).await?;
    let downstream: Arc<dyn Downstream> = Arc::new(HttpDownstream::new(&config)?);
    let callbacks = Arc::new(CallbackDispatcher::new(&config)?);
    let scheduler_config = SchedulerConfig::from_gateway(&config);
    let scheduler = DripScheduler::new(
        store,
        Arc::new(ToolRegistry::new()),
        downstream,
        callbacks,
        scheduler_config,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    scheduler.run(shutdown_rx).await;
    Ok(())
}

/// Resolve on SIGTERM or ctrl-c.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to install ctrl-c handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => tracing::error!(error = %err, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}
