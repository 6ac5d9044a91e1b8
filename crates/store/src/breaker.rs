// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Retrying circuit breaker for outbound calls.
//!
//! Wraps any fallible async operation. On a closed circuit the operation is
//! retried with a fixed delay and a per-attempt timeout; repeated run
//! failures trip the circuit, which then fails fast until a cooldown elapses
//! and a half-open probe succeeds.

use std::{
    future::Future,
    sync::{
        Mutex,
        atomic::{AtomicI64, AtomicU64, Ordering},
    },
    time::Duration,
};

use lazy_static::lazy_static;
use prometheus::{IntCounter, register_int_counter};
use serde::Serialize;
use tracing::{debug, warn};

lazy_static! {
    static ref BREAKER_TRIPS: IntCounter = register_int_counter!(
        "sdq_breaker_trips_total",
        "Total number of circuit breaker open transitions"
    )
    .unwrap();
}

/// Breaker tuning. The retry defaults mirror the broker contract:
/// 3 retries, 5 seconds apart.
#[derive(Debug, Clone, bon::Builder)]
pub struct BreakerConfig {
    #[builder(default = 3)]
    pub retries:           u32,
    #[builder(default = Duration::from_secs(5), into)]
    pub retry_delay:       Duration,
    /// Per-attempt timeout.
    #[builder(default = Duration::from_secs(10), into)]
    pub timeout:           Duration,
    /// Consecutive failed runs before the circuit opens.
    #[builder(default = 5)]
    pub failure_threshold: u32,
    /// How long an open circuit rejects calls before a half-open probe.
    #[builder(default = Duration::from_secs(60), into)]
    pub cooldown:          Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self { BreakerConfig::builder().build() }
}

/// Failure modes of a breaker-wrapped call.
#[derive(Debug)]
pub enum BreakerError<E> {
    /// The circuit is open; the callee was not invoked.
    Open,
    /// The final attempt exceeded the per-attempt timeout.
    Timeout { millis: u64 },
    /// The final attempt failed with the callee's own error.
    Inner(E),
}

/// Counter snapshot returned by [`CircuitBreaker::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerStats {
    pub total:           u64,
    pub timeouts:        u64,
    pub success:         u64,
    pub failure:         u64,
    pub concurrent:      i64,
    pub average_time_ms: f64,
    pub is_closed:       bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct Inner {
    state:     CircuitState,
    failures:  u32,
    opened_at: Option<tokio::time::Instant>,
}

/// Composable retrying circuit breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    config:        BreakerConfig,
    inner:         Mutex<Inner>,
    total:         AtomicU64,
    timeouts:      AtomicU64,
    success:       AtomicU64,
    failure:       AtomicU64,
    concurrent:    AtomicI64,
    total_time_ms: AtomicU64,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(config: BreakerConfig) -> Self {
        CircuitBreaker {
            config,
            inner: Mutex::new(Inner {
                state:     CircuitState::Closed,
                failures:  0,
                opened_at: None,
            }),
            total: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            success: AtomicU64::new(0),
            failure: AtomicU64::new(0),
            concurrent: AtomicI64::new(0),
            total_time_ms: AtomicU64::new(0),
        }
    }

    /// Run `op` through the breaker.
    ///
    /// `op` is a factory so each retry gets a fresh future. On an open
    /// circuit the call fails fast with [`BreakerError::Open`] without
    /// invoking the callee.
    pub async fn run<T, E, F, Fut>(&self, op: F) -> Result<T, BreakerError<E>>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: std::fmt::Debug,
    {
        self.total.fetch_add(1, Ordering::Relaxed);
        if !self.admit() {
            self.failure.fetch_add(1, Ordering::Relaxed);
            return Err(BreakerError::Open);
        }

        self.concurrent.fetch_add(1, Ordering::Relaxed);
        let started = tokio::time::Instant::now();
        let result = self.attempt_loop(op).await;
        let elapsed = started.elapsed().as_millis();
        self.concurrent.fetch_sub(1, Ordering::Relaxed);
        self.total_time_ms
            .fetch_add(u64::try_from(elapsed).unwrap_or(u64::MAX), Ordering::Relaxed);

        match &result {
            Ok(_) => {
                self.success.fetch_add(1, Ordering::Relaxed);
                self.record_success();
            }
            Err(_) => {
                self.failure.fetch_add(1, Ordering::Relaxed);
                self.record_failure();
            }
        }
        result
    }

    async fn attempt_loop<T, E, F, Fut>(&self, op: F) -> Result<T, BreakerError<E>>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: std::fmt::Debug,
    {
        let mut attempt = 0u32;
        loop {
            let outcome = tokio::time::timeout(self.config.timeout, op()).await;
            let last = match outcome {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => {
                    debug!(attempt, error = ?e, "Breaker attempt failed");
                    BreakerError::Inner(e)
                }
                Err(_) => {
                    self.timeouts.fetch_add(1, Ordering::Relaxed);
                    debug!(attempt, timeout = ?self.config.timeout, "Breaker attempt timed out");
                    BreakerError::Timeout {
                        millis: u64::try_from(self.config.timeout.as_millis()).unwrap_or(u64::MAX),
                    }
                }
            };

            if attempt >= self.config.retries {
                return Err(last);
            }
            attempt += 1;
            tokio::time::sleep(self.config.retry_delay).await;
        }
    }

    /// Gate a call on the circuit state, probing half-open after cooldown.
    fn admit(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = inner.opened_at.map(|at| at.elapsed());
                if elapsed.is_some_and(|e| e >= self.config.cooldown) {
                    debug!("Circuit cooldown elapsed, probing half-open");
                    inner.state = CircuitState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.failures = 0;
        if inner.state != CircuitState::Closed {
            debug!("Circuit closed");
            inner.state = CircuitState::Closed;
            inner.opened_at = None;
        }
    }

    fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.failures += 1;
        if inner.state == CircuitState::HalfOpen || inner.failures >= self.config.failure_threshold
        {
            if inner.state != CircuitState::Open {
                warn!(failures = inner.failures, "Circuit opened");
                BREAKER_TRIPS.inc();
            }
            inner.state = CircuitState::Open;
            inner.opened_at = Some(tokio::time::Instant::now());
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().state == CircuitState::Closed
    }

    #[must_use]
    pub fn stats(&self) -> BreakerStats {
        let total = self.total.load(Ordering::Relaxed);
        let success = self.success.load(Ordering::Relaxed);
        let failure = self.failure.load(Ordering::Relaxed);
        let completed = success + failure;
        let average_time_ms = if completed == 0 {
            0.0
        } else {
            self.total_time_ms.load(Ordering::Relaxed) as f64 / completed as f64
        };
        BreakerStats {
            total,
            timeouts: self.timeouts.load(Ordering::Relaxed),
            success,
            failure,
            concurrent: self.concurrent.load(Ordering::Relaxed),
            average_time_ms,
            is_closed: self.is_closed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use super::*;

    fn quick_config() -> BreakerConfig {
        BreakerConfig::builder()
            .retries(2)
            .retry_delay(Duration::from_millis(10))
            .timeout(Duration::from_millis(500))
            .failure_threshold(2)
            .cooldown(Duration::from_millis(100))
            .build()
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success() {
        let breaker = CircuitBreaker::new(quick_config());
        let attempts = AtomicU32::new(0);

        let result: Result<u32, BreakerError<&str>> = breaker
            .run(|| async {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                if n < 2 { Err("not yet") } else { Ok(n) }
            })
            .await;

        assert!(matches!(result, Ok(2)));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        let stats = breaker.stats();
        assert_eq!(stats.success, 1);
        assert_eq!(stats.failure, 0);
        assert!(stats.is_closed);
    }

    #[tokio::test(start_paused = true)]
    async fn opens_after_threshold_and_fails_fast() {
        let breaker = CircuitBreaker::new(quick_config());
        let attempts = AtomicU32::new(0);

        for _ in 0..2 {
            let result: Result<(), BreakerError<&str>> = breaker
                .run(|| async {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err("down")
                })
                .await;
            assert!(matches!(result, Err(BreakerError::Inner("down"))));
        }
        assert!(!breaker.is_closed());

        let invoked = attempts.load(Ordering::SeqCst);
        let result: Result<(), BreakerError<&str>> = breaker
            .run(|| async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err("down")
            })
            .await;
        assert!(matches!(result, Err(BreakerError::Open)));
        assert_eq!(attempts.load(Ordering::SeqCst), invoked, "open circuit skips the callee");
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_probe_closes_on_success() {
        let breaker = CircuitBreaker::new(quick_config());

        for _ in 0..2 {
            let _: Result<(), BreakerError<&str>> = breaker.run(|| async { Err("down") }).await;
        }
        assert!(!breaker.is_closed());

        tokio::time::sleep(Duration::from_millis(150)).await;

        let result: Result<u32, BreakerError<&str>> = breaker.run(|| async { Ok(7) }).await;
        assert!(matches!(result, Ok(7)));
        assert!(breaker.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_counts_and_surfaces() {
        let config = BreakerConfig::builder()
            .retries(0)
            .retry_delay(Duration::from_millis(1))
            .timeout(Duration::from_millis(50))
            .failure_threshold(10)
            .cooldown(Duration::from_millis(100))
            .build();
        let breaker = CircuitBreaker::new(config);

        let result: Result<(), BreakerError<&str>> = breaker
            .run(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(BreakerError::Timeout { millis: 50 })));
        assert_eq!(breaker.stats().timeouts, 1);
    }
}
