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

//! Gateway configuration.
//!
//! Everything comes from the environment, is validated once at boot, and is
//! immutable afterwards.

use anyhow::Result;
use serde::Serialize;
use std::time::Duration;

#[derive(Debug, Clone, Serialize)]
pub struct GatewayConfig {
    /// HTTP listen port for the ingress.
    pub port: u16,

    /// Shared secret expected in `x-webhook-secret` on every API call.
    #[serde(skip_serializing)]
    pub webhook_secret: String,

    /// Job store location: `redis://...` or `memory://`.
    pub store_url: String,

    /// Key prefix for everything the store writes.
    pub store_prefix: String,

    /// Base URL of the downstream API.
    pub downstream_base_url: String,

    /// Bearer credential attached to every downstream request.
    #[serde(skip_serializing)]
    pub downstream_api_key: String,

    /// Per-request timeout for downstream calls (ms).
    pub downstream_timeout_ms: u64,

    /// Transport-level attempts per downstream call.
    pub downstream_max_retries: u32,

    /// Minimum wall-clock spacing between job execution starts (ms).
    pub drip_interval_ms: u64,

    /// Upper bound on records per batch submission.
    pub max_batch_size: usize,

    /// Execution budget per job.
    pub max_job_attempts: u32,

    /// TTL on per-job result records (seconds).
    pub result_ttl_seconds: u64,

    /// TTL on batch counters, measured from creation (seconds).
    pub batch_ttl_seconds: u64,

    /// Callback delivery attempts.
    pub callback_max_retries: u32,

    /// Per-attempt callback timeout (ms).
    pub callback_timeout_ms: u64,

    /// Base delay between callback attempts (ms).
    pub callback_retry_delay_ms: u64,

    /// Ingress rate limit: requests per window per source.
    pub rate_limit_max_requests: u32,

    /// Ingress rate limit window (seconds).
    pub rate_limit_window_secs: u64,

    /// How long a shutdown waits for the in-flight job (seconds).
    pub shutdown_grace_secs: u64,

    /// Lease on a claimed job (seconds); renewed at half interval.
    pub claim_lease_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            webhook_secret: String::new(),
            store_url: "redis://127.0.0.1:6379".to_string(),
            store_prefix: "dripway".to_string(),
            downstream_base_url: "http://127.0.0.1:9000".to_string(),
            downstream_api_key: String::new(),
            downstream_timeout_ms: 60_000,
            downstream_max_retries: 3,
            drip_interval_ms: 10_000,
            max_batch_size: 2000,
            max_job_attempts: 3,
            result_ttl_seconds: 86_400,
            batch_ttl_seconds: 172_800,
            callback_max_retries: 3,
            callback_timeout_ms: 10_000,
            callback_retry_delay_ms: 1000,
            rate_limit_max_requests: 100,
            rate_limit_window_secs: 60,
            shutdown_grace_secs: 30,
            claim_lease_secs: 300,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, fallback: T) -> T {
    match std::env::var(name) {
        Ok(raw) => raw.parse().unwrap_or(fallback),
        Err(_) => fallback,
    }
}

impl GatewayConfig {
    /// Load configuration from environment variables, falling back to
    /// defaults for anything unset.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            port: env_parse("PORT", defaults.port),
            webhook_secret: std::env::var("WEBHOOK_SECRET").unwrap_or(defaults.webhook_secret),
            store_url: std::env::var("STORE_URL").unwrap_or(defaults.store_url),
            store_prefix: std::env::var("STORE_PREFIX").unwrap_or(defaults.store_prefix),
            downstream_base_url: std::env::var("DOWNSTREAM_BASE_URL")
                .unwrap_or(defaults.downstream_base_url),
            downstream_api_key: std::env::var("DOWNSTREAM_API_KEY")
                .unwrap_or(defaults.downstream_api_key),
            downstream_timeout_ms: env_parse(
                "DOWNSTREAM_TIMEOUT_MS",
                defaults.downstream_timeout_ms,
            ),
            downstream_max_retries: env_parse(
                "DOWNSTREAM_MAX_RETRIES",
                defaults.downstream_max_retries,
            ),
            drip_interval_ms: env_parse("DRIP_INTERVAL_MS", defaults.drip_interval_ms),
            max_batch_size: env_parse("MAX_BATCH_SIZE", defaults.max_batch_size),
            max_job_attempts: env_parse("MAX_JOB_ATTEMPTS", defaults.max_job_attempts),
            result_ttl_seconds: env_parse("RESULT_TTL_SECONDS", defaults.result_ttl_seconds),
            batch_ttl_seconds: env_parse("BATCH_TTL_SECONDS", defaults.batch_ttl_seconds),
            callback_max_retries: env_parse("CALLBACK_MAX_RETRIES", defaults.callback_max_retries),
            callback_timeout_ms: env_parse("CALLBACK_TIMEOUT_MS", defaults.callback_timeout_ms),
            callback_retry_delay_ms: env_parse(
                "CALLBACK_RETRY_DELAY_MS",
                defaults.callback_retry_delay_ms,
            ),
            rate_limit_max_requests: env_parse(
                "RATE_LIMIT_MAX_REQUESTS",
                defaults.rate_limit_max_requests,
            ),
            rate_limit_window_secs: env_parse(
                "RATE_LIMIT_WINDOW_SECS",
                defaults.rate_limit_window_secs,
            ),
            shutdown_grace_secs: env_parse("SHUTDOWN_GRACE_SECS", defaults.shutdown_grace_secs),
            claim_lease_secs: env_parse("CLAIM_LEASE_SECS", defaults.claim_lease_secs),
        }
    }

    pub fn drip_interval(&self) -> Duration {
        Duration::from_millis(self.drip_interval_ms)
    }

    pub fn result_ttl(&self) -> Duration {
        Duration::from_secs(self.result_ttl_seconds)
    }

    pub fn batch_ttl(&self) -> Duration {
        Duration::from_secs(self.batch_ttl_seconds)
    }

    pub fn claim_lease(&self) -> Duration {
        Duration::from_secs(self.claim_lease_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// Seconds a newly submitted batch of `n` records needs to drain.
    pub fn estimated_completion_seconds(&self, n: u64) -> u64 {
        (n * self.drip_interval_ms).div_ceil(1000)
    }

    pub fn validate(&self) -> Result<()> {
        if self.webhook_secret.is_empty() {
            anyhow::bail!("WEBHOOK_SECRET must be set");
        }
        if self.downstream_api_key.is_empty() {
            anyhow::bail!("DOWNSTREAM_API_KEY must be set");
        }
        if self.drip_interval_ms == 0 {
            anyhow::bail!("DRIP_INTERVAL_MS must be positive");
        }
        if self.max_batch_size == 0 {
            anyhow::bail!("MAX_BATCH_SIZE must be positive");
        }
        if self.max_job_attempts == 0 {
            anyhow::bail!("MAX_JOB_ATTEMPTS must be positive");
        }
        reqwest::Url::parse(&self.downstream_base_url)
            .map_err(|e| anyhow::anyhow!("DOWNSTREAM_BASE_URL is not a valid URL: {e}"))?;
        if !self.store_url.starts_with("redis://")
            && !self.store_url.starts_with("rediss://")
            && !self.store_url.starts_with("memory://")
        {
            anyhow::bail!(
                "STORE_URL must be redis://, rediss:// or memory:// (got {})",
                self.store_url
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = GatewayConfig::default();
        assert_eq!(config.drip_interval_ms, 10_000);
        assert_eq!(config.max_batch_size, 2000);
        assert_eq!(config.max_job_attempts, 3);
        assert_eq!(config.result_ttl_seconds, 86_400);
    }

    #[test]
    fn validate_requires_secret_and_key() {
        let mut config = GatewayConfig::default();
        assert!(config.validate().is_err());

        config.webhook_secret = "s3cret".to_string();
        assert!(config.validate().is_err());

        config.downstream_api_key = "key".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_unknown_store_scheme() {
        let mut config = GatewayConfig::default();
        config.webhook_secret = "s".to_string();
        config.downstream_api_key = "k".to_string();
        config.store_url = "postgres://nope".to_string();
        assert!(config.validate().is_err());

        config.store_url = "memory://".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn completion_estimate_rounds_up() {
        let mut config = GatewayConfig::default();
        config.drip_interval_ms = 10_000;
        assert_eq!(config.estimated_completion_seconds(3), 30);

        config.drip_interval_ms = 1500;
        assert_eq!(config.estimated_completion_seconds(3), 5); // 4500ms -> 5s
    }
}
