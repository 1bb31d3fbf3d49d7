//! Per-breaker metrics collector.
//!
//! Keeps its own counters and a bounded latency sample buffer for on-demand
//! percentiles, and mirrors everything into the `metrics` facade so a
//! Prometheus recorder can expose it on scrape.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bidguard_core::config::MAX_SAMPLE_CAPACITY;
use bidguard_core::SharedClock;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::circuit_breaker::CircuitState;

/// Upper bounds (ms) of the latency histogram; a final +Inf bucket follows.
pub const LATENCY_BUCKETS_MS: [f64; 10] = [
    10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0,
];

pub const LATENCY_HISTOGRAM: &str = "bidguard_predictor_latency_ms";

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencyPercentiles {
    pub p50: f64,
    pub p75: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistogramBucket {
    /// Upper bound, `"+Inf"` for the overflow bucket.
    pub le: String,
    pub count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StateChange {
    pub from: CircuitState,
    pub to: CircuitState,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSummary {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub fallback_activations: u64,
    pub latency_samples: usize,
    pub percentiles: LatencyPercentiles,
    pub histogram: Vec<HistogramBucket>,
    pub errors_by_type: HashMap<String, u64>,
    /// Keyed `"from->to"`.
    pub state_transitions: HashMap<String, u64>,
    pub last_state_change: Option<StateChange>,
}

#[derive(Debug)]
struct Samples {
    latencies_ms: VecDeque<f64>,
    buckets: [u64; LATENCY_BUCKETS_MS.len() + 1],
    errors_by_type: HashMap<String, u64>,
    state_transitions: HashMap<String, u64>,
    last_state_change: Option<StateChange>,
}

pub struct MetricsCollector {
    label: String,
    max_samples: usize,
    clock: SharedClock,
    requests: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    fallbacks: AtomicU64,
    samples: RwLock<Samples>,
}

impl MetricsCollector {
    /// `label` becomes the `platform` label on every exported series.
    pub fn new(label: impl Into<String>, max_samples: usize, clock: SharedClock) -> Self {
        Self {
            label: label.into(),
            max_samples: max_samples.clamp(1, MAX_SAMPLE_CAPACITY),
            clock,
            requests: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            fallbacks: AtomicU64::new(0),
            samples: RwLock::new(Samples {
                latencies_ms: VecDeque::with_capacity(max_samples.clamp(1, MAX_SAMPLE_CAPACITY)),
                buckets: [0; LATENCY_BUCKETS_MS.len() + 1],
                errors_by_type: HashMap::new(),
                state_transitions: HashMap::new(),
                last_state_change: None,
            }),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        ::metrics::counter!("bidguard_requests_total", "platform" => self.label.clone()).increment(1);
    }

    pub fn record_success(&self, latency: Duration) {
        self.successes.fetch_add(1, Ordering::Relaxed);
        self.observe_latency(latency);
        ::metrics::counter!(
            "bidguard_predictor_calls_total",
            "platform" => self.label.clone(),
            "outcome" => "success"
        )
        .increment(1);
    }

    pub fn record_failure(&self, latency: Duration, error_type: &str) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        self.observe_latency(latency);
        *self
            .samples
            .write()
            .errors_by_type
            .entry(error_type.to_string())
            .or_insert(0) += 1;
        ::metrics::counter!(
            "bidguard_predictor_calls_total",
            "platform" => self.label.clone(),
            "outcome" => "failure"
        )
        .increment(1);
        ::metrics::counter!(
            "bidguard_errors_total",
            "platform" => self.label.clone(),
            "error_type" => error_type.to_string()
        )
        .increment(1);
    }

    pub fn record_fallback(&self) {
        self.fallbacks.fetch_add(1, Ordering::Relaxed);
        ::metrics::counter!("bidguard_fallback_activations_total", "platform" => self.label.clone())
            .increment(1);
    }

    pub fn record_state_transition(&self, from: CircuitState, to: CircuitState) {
        let at = self.clock.now();
        {
            let mut samples = self.samples.write();
            *samples
                .state_transitions
                .entry(format!("{}->{}", from.as_str(), to.as_str()))
                .or_insert(0) += 1;
            samples.last_state_change = Some(StateChange { from, to, at });
        }
        ::metrics::counter!(
            "bidguard_breaker_transitions_total",
            "platform" => self.label.clone(),
            "from" => from.as_str(),
            "to" => to.as_str()
        )
        .increment(1);
    }

    fn observe_latency(&self, latency: Duration) {
        let ms = latency.as_nanos() as f64 / 1_000_000.0;
        {
            let mut samples = self.samples.write();
            if samples.latencies_ms.len() >= self.max_samples {
                samples.latencies_ms.pop_front();
            }
            samples.latencies_ms.push_back(ms);
            let idx = LATENCY_BUCKETS_MS
                .iter()
                .position(|le| ms <= *le)
                .unwrap_or(LATENCY_BUCKETS_MS.len());
            samples.buckets[idx] += 1;
        }
        ::metrics::histogram!(LATENCY_HISTOGRAM, "platform" => self.label.clone()).record(ms);
    }

    /// Nearest-rank percentiles over the retained samples (full sort, N is bounded).
    pub fn latency_percentiles(&self) -> LatencyPercentiles {
        let mut sorted: Vec<f64> = self.samples.read().latencies_ms.iter().copied().collect();
        if sorted.is_empty() {
            return LatencyPercentiles::default();
        }
        sorted.sort_by(f64::total_cmp);
        LatencyPercentiles {
            p50: nearest_rank(&sorted, 50.0),
            p75: nearest_rank(&sorted, 75.0),
            p90: nearest_rank(&sorted, 90.0),
            p95: nearest_rank(&sorted, 95.0),
            p99: nearest_rank(&sorted, 99.0),
        }
    }

    pub fn summary(&self) -> MetricsSummary {
        let percentiles = self.latency_percentiles();
        let samples = self.samples.read();
        let histogram = LATENCY_BUCKETS_MS
            .iter()
            .map(|le| format!("{le}"))
            .chain(std::iter::once("+Inf".to_string()))
            .zip(samples.buckets.iter())
            .map(|(le, count)| HistogramBucket { le, count: *count })
            .collect();

        MetricsSummary {
            total_requests: self.requests.load(Ordering::Relaxed),
            successful_requests: self.successes.load(Ordering::Relaxed),
            failed_requests: self.failures.load(Ordering::Relaxed),
            fallback_activations: self.fallbacks.load(Ordering::Relaxed),
            latency_samples: samples.latencies_ms.len(),
            percentiles,
            histogram,
            errors_by_type: samples.errors_by_type.clone(),
            state_transitions: samples.state_transitions.clone(),
            last_state_change: samples.last_state_change,
        }
    }

    /// Push derived values (quantiles, last transition time) to the facade as gauges.
    pub fn publish(&self) {
        let p = self.latency_percentiles();
        for (quantile, value) in [
            ("0.5", p.p50),
            ("0.75", p.p75),
            ("0.9", p.p90),
            ("0.95", p.p95),
            ("0.99", p.p99),
        ] {
            ::metrics::gauge!(
                "bidguard_latency_quantile_ms",
                "platform" => self.label.clone(),
                "quantile" => quantile
            )
            .set(value);
        }
        if let Some(change) = self.samples.read().last_state_change {
            ::metrics::gauge!(
                "bidguard_breaker_last_state_change_seconds",
                "platform" => self.label.clone()
            )
            .set(change.at.timestamp_millis() as f64 / 1000.0);
        }
    }

    pub fn reset(&self) {
        self.requests.store(0, Ordering::Relaxed);
        self.successes.store(0, Ordering::Relaxed);
        self.failures.store(0, Ordering::Relaxed);
        self.fallbacks.store(0, Ordering::Relaxed);
        let mut samples = self.samples.write();
        samples.latencies_ms.clear();
        samples.buckets = [0; LATENCY_BUCKETS_MS.len() + 1];
        samples.errors_by_type.clear();
        samples.state_transitions.clear();
        samples.last_state_change = None;
    }
}

fn nearest_rank(sorted: &[f64], percentile: f64) -> f64 {
    let rank = (percentile * sorted.len() as f64 / 100.0).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}
