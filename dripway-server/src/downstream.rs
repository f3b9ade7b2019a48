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

//! Downstream API client.
//!
//! One logical call may span several transport attempts; those retries are
//! internal and never consume the job's attempt budget. The scheduler only
//! sees the final outcome.

use crate::config::GatewayConfig;
use async_trait::async_trait;
use dripway_core::{registry::ToolEntry, RetryPolicy};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum DownstreamError {
    #[error("transport failure calling {endpoint}: {message}")]
    Transport { endpoint: String, message: String },

    #[error("rate limited by downstream at {endpoint}")]
    RateLimited {
        endpoint: String,
        response_body: Option<String>,
    },

    #[error("downstream server error {status} at {endpoint}")]
    Server {
        endpoint: String,
        status: u16,
        response_body: Option<String>,
    },

    #[error("downstream rejected request with {status} at {endpoint}")]
    Client {
        endpoint: String,
        status: u16,
        response_body: Option<String>,
    },

    #[error("downstream returned a non-JSON body at {endpoint}: {message}")]
    Decode { endpoint: String, message: String },
}

impl DownstreamError {
    /// Whether another attempt (at either retry layer) can succeed.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            DownstreamError::Transport { .. }
                | DownstreamError::RateLimited { .. }
                | DownstreamError::Server { .. }
        )
    }

    /// Short text stored in the result record and callback payload.
    pub fn upstream_message(&self) -> String {
        match self {
            DownstreamError::Server {
                response_body: Some(body),
                status,
                ..
            }
            | DownstreamError::Client {
                response_body: Some(body),
                status,
                ..
            } => format!("HTTP {status}: {}", truncate(body, 512)),
            other => other.to_string(),
        }
    }
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Seam between the scheduler and the wire so tests can substitute a stub.
#[async_trait]
pub trait Downstream: Send + Sync {
    async fn call(&self, entry: &ToolEntry, params: &Value) -> Result<Value, DownstreamError>;
}

/// reqwest-backed client with bearer auth and internal retry/backoff.
pub struct HttpDownstream {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    policy: RetryPolicy,
}

impl HttpDownstream {
    pub fn new(config: &GatewayConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.downstream_timeout_ms))
            .build()?;
        Ok(Self {
            client,
            base_url: config.downstream_base_url.trim_end_matches('/').to_string(),
            api_key: config.downstream_api_key.clone(),
            policy: RetryPolicy::downstream().with_max_attempts(config.downstream_max_retries),
        })
    }

    /// Override the transport retry schedule (tests shrink the delays).
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    async fn attempt(&self, entry: &ToolEntry, params: &Value) -> Result<Value, DownstreamError> {
        let url = format!("{}{}", self.base_url, entry.endpoint_path);
        let method = reqwest::Method::from_bytes(entry.method.as_bytes())
            .unwrap_or(reqwest::Method::POST);

        let response = self
            .client
            .request(method, &url)
            .bearer_auth(&self.api_key)
            .json(params)
            .send()
            .await
            .map_err(|e| classify_transport(&url, &e))?;

        let status = response.status();
        if status.is_success() {
            return response.json::<Value>().await.map_err(|e| {
                DownstreamError::Decode {
                    endpoint: url.clone(),
                    message: e.to_string(),
                }
            });
        }

        let body = response.text().await.ok().filter(|b| !b.is_empty());
        Err(match status.as_u16() {
            429 => DownstreamError::RateLimited {
                endpoint: url,
                response_body: body,
            },
            code if code >= 500 => DownstreamError::Server {
                endpoint: url,
                status: code,
                response_body: body,
            },
            code => DownstreamError::Client {
                endpoint: url,
                status: code,
                response_body: body,
            },
        })
    }
}

fn classify_transport(endpoint: &str, err: &reqwest::Error) -> DownstreamError {
    let message = if err.is_timeout() {
        "request timed out".to_string()
    } else if err.is_connect() {
        format!("connection failed: {err}")
    } else {
        err.to_string()
    };
    DownstreamError::Transport {
        endpoint: endpoint.to_string(),
        message,
    }
}

#[async_trait]
impl Downstream for HttpDownstream {
    async fn call(&self, entry: &ToolEntry, params: &Value) -> Result<Value, DownstreamError> {
        let mut last_err = None;
        for attempt in 1..=self.policy.max_attempts {
            let delay = self.policy.delay_before_attempt(attempt);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            match self.attempt(entry, params).await {
                Ok(data) => {
                    debug!(tool = entry.name, attempt, "downstream call succeeded");
                    return Ok(data);
                }
                Err(err) if err.retryable() && attempt < self.policy.max_attempts => {
                    warn!(
                        tool = entry.name,
                        attempt,
                        error = %err,
                        "downstream attempt failed, retrying"
                    );
                    last_err = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        // reachable only when the policy allows zero attempts
        Err(last_err.unwrap_or_else(|| DownstreamError::Transport {
            endpoint: entry.endpoint_path.to_string(),
            message: "no attempts were made".to_string(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn err_client(status: u16) -> DownstreamError {
        DownstreamError::Client {
            endpoint: "/api/x".to_string(),
            status,
            response_body: Some("nope".to_string()),
        }
    }

    #[test]
    fn retryable_classification() {
        assert!(DownstreamError::Transport {
            endpoint: "e".into(),
            message: "connection reset".into()
        }
        .retryable());
        assert!(DownstreamError::RateLimited {
            endpoint: "e".into(),
            response_body: None
        }
        .retryable());
        assert!(DownstreamError::Server {
            endpoint: "e".into(),
            status: 503,
            response_body: None
        }
        .retryable());

        assert!(!err_client(400).retryable());
        assert!(!err_client(404).retryable());
        assert!(!DownstreamError::Decode {
            endpoint: "e".into(),
            message: "bad".into()
        }
        .retryable());
    }

    #[test]
    fn upstream_message_includes_status_and_body() {
        let message = err_client(422).upstream_message();
        assert!(message.contains("422"));
        assert!(message.contains("nope"));
    }

    #[test]
    fn upstream_message_truncates_large_bodies() {
        let err = DownstreamError::Server {
            endpoint: "/api/x".to_string(),
            status: 500,
            response_body: Some("x".repeat(5000)),
        };
        assert!(err.upstream_message().len() < 600);
    }
}
