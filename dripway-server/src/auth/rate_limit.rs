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

//! Per-source ingress rate limiting.
//!
//! Token bucket per source identifier (client IP), held in a bounded moka
//! cache so an open ingress cannot grow an unbounded bucket table.

use moka::sync::Cache;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Maximum requests per window.
    pub max_requests: u32,
    /// Window duration.
    pub window: Duration,
    /// Maximum number of tracked sources.
    pub max_sources: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 100,
            window: Duration::from_secs(60),
            max_sources: 100_000,
        }
    }
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Capacity `max_requests`, refilled continuously over the window.
struct TokenBucket {
    state: Mutex<BucketState>,
    capacity: f64,
    refill_rate: f64,
}

impl TokenBucket {
    fn new(capacity: u32, window: Duration) -> Self {
        Self {
            state: Mutex::new(BucketState {
                tokens: capacity as f64,
                last_refill: Instant::now(),
            }),
            capacity: capacity as f64,
            refill_rate: capacity as f64 / window.as_secs_f64(),
        }
    }

    fn try_consume(&self) -> Result<u32, Duration> {
        let mut state = self.state.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_rate).min(self.capacity);
        state.last_refill = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            Ok(state.tokens.floor() as u32)
        } else {
            let needed = 1.0 - state.tokens;
            Err(Duration::from_secs_f64(needed / self.refill_rate))
        }
    }
}

/// Outcome of a rate-limit check.
#[derive(Debug)]
pub enum RateLimitDecision {
    Allowed { remaining: u32 },
    Limited { retry_after: Duration },
}

pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: Cache<String, Arc<TokenBucket>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        // idle entries evict well after the window so refill math stays
        // correct for active sources
        let idle_ttl = config.window * 10;
        let buckets = Cache::builder()
            .max_capacity(config.max_sources)
            .time_to_idle(idle_ttl)
            .build();
        Self { config, buckets }
    }

    pub fn check(&self, source: &str) -> RateLimitDecision {
        let bucket = self.buckets.get_with(source.to_string(), || {
            Arc::new(TokenBucket::new(
                self.config.max_requests,
                self.config.window,
            ))
        });

        match bucket.try_consume() {
            Ok(remaining) => RateLimitDecision::Allowed { remaining },
            Err(retry_after) => RateLimitDecision::Limited { retry_after },
        }
    }

    pub fn tracked_sources(&self) -> u64 {
        self.buckets.entry_count()
    }
}

/// Best-effort client identity from proxy headers.
pub fn extract_source(headers: &axum::http::HeaderMap) -> String {
    if let Some(forwarded) = headers.get("x-forwarded-for") {
        if let Ok(value) = forwarded.to_str() {
            if let Some(first) = value.split(',').next() {
                let first = first.trim();
                if !first.is_empty() {
                    return first.to_string();
                }
            }
        }
    }
    if let Some(real_ip) = headers.get("x-real-ip") {
        if let Ok(value) = real_ip.to_str() {
            return value.to_string();
        }
    }
    "unknown".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_exhausts_and_reports_retry_delay() {
        let bucket = TokenBucket::new(5, Duration::from_secs(5));
        for _ in 0..5 {
            assert!(bucket.try_consume().is_ok());
        }
        let retry_after = bucket.try_consume().unwrap_err();
        assert!(retry_after > Duration::ZERO);
        assert!(retry_after <= Duration::from_secs(1));
    }

    #[test]
    fn bucket_refills_over_time() {
        let bucket = TokenBucket::new(10, Duration::from_secs(1));
        for _ in 0..10 {
            assert!(bucket.try_consume().is_ok());
        }
        std::thread::sleep(Duration::from_millis(150));
        assert!(bucket.try_consume().is_ok());
    }

    #[test]
    fn limiter_isolates_sources() {
        let limiter = RateLimiter::new(RateLimitConfig {
            max_requests: 2,
            window: Duration::from_secs(60),
            max_sources: 100,
        });

        for _ in 0..2 {
            assert!(matches!(
                limiter.check("10.0.0.1"),
                RateLimitDecision::Allowed { .. }
            ));
        }
        assert!(matches!(
            limiter.check("10.0.0.1"),
            RateLimitDecision::Limited { .. }
        ));
        // a different source is untouched
        assert!(matches!(
            limiter.check("10.0.0.2"),
            RateLimitDecision::Allowed { .. }
        ));
    }

    #[test]
    fn source_extraction_prefers_forwarded_for() {
        let mut headers = axum::http::HeaderMap::new();
        headers.insert("x-forwarded-for", "203.0.113.9, 10.0.0.1".parse().unwrap());
        headers.insert("x-real-ip", "10.0.0.1".parse().unwrap());
        assert_eq!(extract_source(&headers), "203.0.113.9");

        headers.remove("x-forwarded-for");
        assert_eq!(extract_source(&headers), "10.0.0.1");

        headers.remove("x-real-ip");
        assert_eq!(extract_source(&headers), "unknown");
    }
}
