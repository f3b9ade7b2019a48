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

//! Retry policy primitives.
//!
//! Two independent retry layers use this: the downstream client retries
//! transport faults inside a single job execution, and the scheduler
//! re-queues whole executions through the drip gate. They carry separate
//! budgets and separate schedules.

use rand::Rng;
use std::time::Duration;

/// Exponential backoff with a delay cap and proportional jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    /// Hard cap applied before jitter.
    pub max_delay: Duration,
    /// Growth factor per attempt.
    pub multiplier: f64,
    /// Jitter amplitude as a fraction of the capped delay (0.1 = ±10%).
    pub jitter: f64,
}

impl RetryPolicy {
    /// Schedule used for downstream transport retries: 3 attempts,
    /// 1s base, 30s cap, ±10% jitter.
    pub fn downstream() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }

    /// Schedule used for callback delivery: same shape, wider jitter.
    pub fn callback() -> Self {
        Self {
            jitter: 0.2,
            ..Self::downstream()
        }
    }

    /// Delay before attempt `attempt` (1-based; attempt 1 has no delay).
    ///
    /// The uncapped curve is `initial * multiplier^(attempt-2)`, clamped to
    /// `max_delay`, then jittered uniformly by `±jitter`.
    pub fn delay_before_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let exponent = (attempt - 2) as i32;
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = base.min(self.max_delay.as_secs_f64());
        let jittered = if self.jitter > 0.0 {
            let factor = 1.0 + rand::thread_rng().gen_range(-self.jitter..=self.jitter);
            capped * factor
        } else {
            capped
        };
        Duration::from_secs_f64(jittered.max(0.0))
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }
}

/// Backoff for job-level re-executions: `base * 2^(n-1)` where `n` is the
/// number of executions already consumed. Unjittered; re-attempts pass
/// through the drip gate.
pub fn job_retry_delay(base: Duration, attempts_made: u32) -> Duration {
    let exponent = attempts_made.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << exponent)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_attempt_has_no_delay() {
        let policy = RetryPolicy::downstream();
        assert_eq!(policy.delay_before_attempt(1), Duration::ZERO);
    }

    #[test]
    fn delays_grow_exponentially_within_jitter() {
        let policy = RetryPolicy::downstream();

        for (attempt, expected_secs) in [(2u32, 1.0f64), (3, 2.0), (4, 4.0), (5, 8.0)] {
            let delay = policy.delay_before_attempt(attempt).as_secs_f64();
            let lo = expected_secs * (1.0 - policy.jitter) - 1e-6;
            let hi = expected_secs * (1.0 + policy.jitter) + 1e-6;
            assert!(
                (lo..=hi).contains(&delay),
                "attempt {attempt}: delay {delay} outside [{lo}, {hi}]"
            );
        }
    }

    #[test]
    fn delay_is_capped_before_jitter() {
        let policy = RetryPolicy::downstream();
        // attempt 10 would be 256s uncapped
        let delay = policy.delay_before_attempt(10).as_secs_f64();
        let cap = policy.max_delay.as_secs_f64();
        assert!(delay <= cap * (1.0 + policy.jitter) + 1e-6);
        assert!(delay >= cap * (1.0 - policy.jitter) - 1e-6);
    }

    #[test]
    fn job_retry_delay_doubles() {
        let base = Duration::from_secs(5);
        assert_eq!(job_retry_delay(base, 1), Duration::from_secs(5));
        assert_eq!(job_retry_delay(base, 2), Duration::from_secs(10));
        assert_eq!(job_retry_delay(base, 3), Duration::from_secs(20));
    }
}
