//! Uniform stats capability for every breaker-owning connector.

use bidguard_core::Platform;
use serde::{Deserialize, Serialize};

use crate::budget::BudgetStatus;
use crate::circuit_breaker::BreakerSnapshot;
use crate::metrics::MetricsSummary;
use crate::rate_limit::RateLimitStatus;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardStats {
    pub platform: Platform,
    pub breaker: BreakerSnapshot,
    pub budget: BudgetStatus,
    pub rate_limit: RateLimitStatus,
    pub fallback_samples: usize,
    /// Present only when metrics collection is enabled for the breaker.
    pub metrics: Option<MetricsSummary>,
}

pub trait StatsProvider: Send + Sync {
    fn platform(&self) -> Platform;

    fn stats(&self) -> GuardStats;

    /// Mirror current values into the `metrics` facade ahead of a scrape.
    fn publish_metrics(&self) {}
}
