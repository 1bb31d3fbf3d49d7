//! Circuit breaker gating calls to the remote predictor.
//!
//! # States
//! - Closed: predictor is trusted, calls pass through
//! - Open: predictor assumed degraded, callers use the heuristic fallback
//! - HalfOpen: probing whether the predictor recovered
//!
//! # State Transitions
//! ```text
//! Closed   → Open:     failure_count >= failure_threshold
//! Open     → HalfOpen: first can_execute() after reset_timeout (lazy, no timer)
//! HalfOpen → Closed:   success_threshold consecutive successes
//! HalfOpen → Open:     any failure
//! ```
//!
//! A call slower than the latency threshold is a failure and bumps
//! `failure_count` one extra time: for real-time bidding a slow predictor is
//! worse than an erroring one.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bidguard_core::config::BreakerConfig;
use bidguard_core::{DecisionSource, FailureKind, GuardResult, SharedClock};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::metrics::MetricsCollector;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }

    /// Numeric encoding for gauges.
    pub fn as_gauge(&self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::HalfOpen => 1.0,
            CircuitState::Open => 2.0,
        }
    }
}

/// Breaker state plus its counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub half_open_successes: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub last_state_change_time: DateTime<Utc>,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub fallback_activations: u64,
}

/// A value produced under breaker control, tagged with where it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Guarded<T> {
    pub value: T,
    pub source: DecisionSource,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BreakerCallError<E> {
    /// Primary failed but the breaker is still accepting calls.
    #[error("primary call failed: {0}")]
    Primary(E),

    #[error("primary call exceeded its {0:?} deadline")]
    DeadlineExceeded(Duration),

    #[error("fallback failed: {0}")]
    Fallback(E),
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    half_open_successes: u32,
    last_failure_time: Option<DateTime<Utc>>,
    last_state_change_time: DateTime<Utc>,
    total_requests: u64,
    successful_requests: u64,
    failed_requests: u64,
    fallback_activations: u64,
}

impl BreakerInner {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            half_open_successes: 0,
            last_failure_time: None,
            last_state_change_time: now,
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            fallback_activations: 0,
        }
    }
}

/// Circuit breaker owned by a single platform connector.
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    success_threshold: u32,
    latency_threshold: Duration,
    reset_timeout: chrono::Duration,
    clock: SharedClock,
    metrics: Option<Arc<MetricsCollector>>,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: &BreakerConfig, clock: SharedClock) -> GuardResult<Self> {
        config.validate()?;
        let now = clock.now();
        Ok(Self {
            name: name.into(),
            failure_threshold: config.failure_threshold,
            success_threshold: config.success_threshold,
            latency_threshold: config.latency_threshold(),
            reset_timeout: config.reset_timeout(),
            clock,
            metrics: None,
            inner: Mutex::new(BreakerInner::new(now)),
        })
    }

    /// Attach a metrics collector. Without one the breaker does no metrics work.
    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn metrics(&self) -> Option<&Arc<MetricsCollector>> {
        self.metrics.as_ref()
    }

    pub fn latency_threshold(&self) -> Duration {
        self.latency_threshold
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitState) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        inner.last_state_change_time = self.clock.now();
        inner.half_open_successes = 0;
        if to == CircuitState::Closed {
            inner.failure_count = 0;
        }

        match to {
            CircuitState::Open => warn!(
                breaker = %self.name,
                from = from.as_str(),
                failures = inner.failure_count,
                "circuit breaker opened, switching to fallback"
            ),
            _ => info!(
                breaker = %self.name,
                from = from.as_str(),
                to = to.as_str(),
                "circuit breaker state change"
            ),
        }
        if let Some(m) = &self.metrics {
            m.record_state_transition(from, to);
        }
    }

    /// Whether the predictor may be called. Performs the lazy Open → HalfOpen check.
    pub fn can_execute(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = self.clock.now() - inner.last_state_change_time;
                if elapsed > self.reset_timeout {
                    self.transition(&mut inner, CircuitState::HalfOpen);
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful call. An over-threshold latency is recorded as a failure instead.
    pub fn record_success(&self, latency: Duration) {
        if latency > self.latency_threshold {
            self.record_failure_with(latency, "latency_exceeded");
            return;
        }

        {
            let mut inner = self.inner.lock();
            inner.total_requests += 1;
            inner.successful_requests += 1;
            match inner.state {
                CircuitState::Closed => inner.failure_count = 0,
                CircuitState::HalfOpen => {
                    inner.half_open_successes += 1;
                    if inner.half_open_successes >= self.success_threshold {
                        self.transition(&mut inner, CircuitState::Closed);
                    }
                }
                // A late answer from before the breaker opened changes nothing.
                CircuitState::Open => {}
            }
        }
        if let Some(m) = &self.metrics {
            m.record_success(latency);
        }
    }

    /// Record a failed call. Returns true if this failure opened the breaker.
    pub fn record_failure(&self, latency: Duration) -> bool {
        let kind = if latency > self.latency_threshold {
            "latency_exceeded"
        } else {
            "error"
        };
        self.record_failure_with(latency, kind)
    }

    /// Like `record_failure`, labelling the failure for per-error-type metrics.
    pub fn record_failure_with(&self, latency: Duration, error_type: &str) -> bool {
        let opened = {
            let mut inner = self.inner.lock();
            inner.total_requests += 1;
            inner.failed_requests += 1;
            inner.failure_count = inner.failure_count.saturating_add(1);
            if latency > self.latency_threshold {
                // Slow calls count twice.
                inner.failure_count = inner.failure_count.saturating_add(1);
            }
            inner.last_failure_time = Some(self.clock.now());

            match inner.state {
                CircuitState::Closed if inner.failure_count >= self.failure_threshold => {
                    self.transition(&mut inner, CircuitState::Open);
                    true
                }
                CircuitState::HalfOpen => {
                    self.transition(&mut inner, CircuitState::Open);
                    true
                }
                _ => false,
            }
        };
        if let Some(m) = &self.metrics {
            m.record_failure(latency, error_type);
        }
        opened
    }

    /// Count a fallback decision. Never changes state.
    pub fn record_fallback(&self) {
        self.inner.lock().fallback_activations += 1;
        if let Some(m) = &self.metrics {
            m.record_fallback();
        }
    }

    pub fn is_fallback_mode(&self) -> bool {
        self.state() == CircuitState::Open
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failure_count
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        BreakerSnapshot {
            state: inner.state,
            failure_count: inner.failure_count,
            half_open_successes: inner.half_open_successes,
            last_failure_time: inner.last_failure_time,
            last_state_change_time: inner.last_state_change_time,
            total_requests: inner.total_requests,
            successful_requests: inner.successful_requests,
            failed_requests: inner.failed_requests,
            fallback_activations: inner.fallback_activations,
        }
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        *inner = BreakerInner::new(self.clock.now());
        debug!(breaker = %self.name, "circuit breaker reset");
    }

    /// Run `primary` under `deadline` if the breaker allows it, otherwise `fallback`.
    ///
    /// A primary failure (error, deadline or over-latency) that newly opens the
    /// breaker is compensated by calling `fallback` in the same request.
    pub async fn call_with_breaker<T, E, P, Fut, F>(
        &self,
        deadline: Duration,
        primary: P,
        fallback: F,
    ) -> Result<Guarded<T>, BreakerCallError<E>>
    where
        P: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        F: FnOnce() -> Result<T, E>,
        E: FailureKind,
    {
        if !self.can_execute() {
            self.record_fallback();
            return fallback()
                .map(|value| Guarded {
                    value,
                    source: DecisionSource::Fallback,
                })
                .map_err(BreakerCallError::Fallback);
        }

        let started = tokio::time::Instant::now();
        let outcome = tokio::time::timeout(deadline, primary()).await;
        let latency = started.elapsed();

        let (result, kind) = match outcome {
            Ok(Ok(value)) if latency <= self.latency_threshold => {
                self.record_success(latency);
                return Ok(Guarded {
                    value,
                    source: DecisionSource::Ai,
                });
            }
            Ok(Ok(value)) => (Ok(value), "latency_exceeded"),
            Ok(Err(e)) => {
                let kind = e.kind();
                (Err(BreakerCallError::Primary(e)), kind)
            }
            Err(_) => (Err(BreakerCallError::DeadlineExceeded(deadline)), "timeout"),
        };

        if self.record_failure_with(latency, kind) {
            self.record_fallback();
            return fallback()
                .map(|value| Guarded {
                    value,
                    source: DecisionSource::FallbackAfterCircuitOpen,
                })
                .map_err(BreakerCallError::Fallback);
        }

        result.map(|value| Guarded {
            value,
            source: DecisionSource::Ai,
        })
    }
}
