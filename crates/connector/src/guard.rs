//! Per-platform admission pipeline.
//!
//! A `PlatformGuard` owns every resilience primitive for one ad platform and
//! runs the bid protocol in order: value (predictor or fallback), rate check,
//! budget check, commit. A vetoed bid commits no spend.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bidguard_core::config::{
    AppConfig, BreakerConfig, BudgetConfig, FallbackConfig, PlatformConfig, RetryConfig,
};
use bidguard_core::{DecisionSource, GuardResult, Platform, SharedClock, TransportError};
use bidguard_resilience::{
    BudgetError, CallRateLimiter, CircuitBreaker, FallbackEngine, GuardStats, MetricsCollector,
    RetryOutcome, RetryPolicy, SpendGovernor, StatsProvider,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::predictor::Predictor;

/// A request to place one bid on the guard's platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BidRequest {
    pub campaign_id: String,
    /// Hard per-bid cap set by the campaign.
    pub max_bid: f64,
    /// Heuristic value used by the fallback when no LTV history exists yet.
    pub default_value: f64,
    /// Model features forwarded to the predictor untouched.
    #[serde(default)]
    pub features: HashMap<String, f64>,
}

/// An admitted bid. The spend and the call slot are already committed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BidDecision {
    pub decision_id: Uuid,
    pub platform: Platform,
    pub campaign_id: String,
    pub amount: f64,
    pub predicted_value: f64,
    pub source: DecisionSource,
    pub decided_at: DateTime<Utc>,
}

/// Why a bid was not placed.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BidVeto {
    #[error("invalid bid request: {0}")]
    InvalidRequest(String),

    /// The predictor failed and the breaker has not opened yet.
    #[error("predictor failed: {0}")]
    PredictorFailed(String),

    #[error("no positive bid value (value {value})")]
    NoValue { value: f64 },

    #[error("rate limit of {limit} calls/min reached")]
    RateLimited { limit: u32 },

    #[error(transparent)]
    BudgetExceeded(#[from] BudgetError),
}

impl BidVeto {
    pub fn reason(&self) -> &'static str {
        match self {
            BidVeto::InvalidRequest(_) => "invalid_request",
            BidVeto::PredictorFailed(_) => "predictor_failed",
            BidVeto::NoValue { .. } => "no_value",
            BidVeto::RateLimited { .. } => "rate_limited",
            BidVeto::BudgetExceeded(_) => "budget_exceeded",
        }
    }
}

/// Everything needed to build one guard.
#[derive(Debug, Clone)]
pub struct GuardSettings {
    pub breaker: BreakerConfig,
    pub budget: BudgetConfig,
    pub calls_per_minute: u32,
    pub fallback: FallbackConfig,
    pub retry: RetryConfig,
    pub predictor_deadline: Duration,
    pub metrics_enabled: bool,
    pub latency_sample_size: usize,
}

impl GuardSettings {
    pub fn from_app(config: &AppConfig, platform: &PlatformConfig, budget: BudgetConfig) -> Self {
        Self {
            breaker: config.breaker.clone(),
            budget,
            calls_per_minute: platform.calls_per_minute,
            fallback: config.fallback.clone(),
            retry: config.retry.clone(),
            predictor_deadline: config.predictor.deadline(),
            metrics_enabled: config.metrics.enabled,
            latency_sample_size: config.metrics.latency_sample_size,
        }
    }
}

impl Default for GuardSettings {
    fn default() -> Self {
        let config = AppConfig::default();
        Self::from_app(&config, &PlatformConfig::default(), config.budget.clone())
    }
}

pub struct PlatformGuard {
    platform: Platform,
    breaker: CircuitBreaker,
    governor: SpendGovernor,
    limiter: CallRateLimiter,
    fallback: FallbackEngine,
    metrics: Option<Arc<MetricsCollector>>,
    retry: RetryPolicy,
    predictor: Arc<dyn Predictor>,
    deadline: Duration,
    clock: SharedClock,
}

impl PlatformGuard {
    pub fn new(
        platform: Platform,
        settings: &GuardSettings,
        predictor: Arc<dyn Predictor>,
        clock: SharedClock,
    ) -> GuardResult<Self> {
        let mut breaker = CircuitBreaker::new(platform.slug(), &settings.breaker, clock.clone())?;
        let metrics = settings.metrics_enabled.then(|| {
            Arc::new(MetricsCollector::new(
                platform.slug(),
                settings.latency_sample_size,
                clock.clone(),
            ))
        });
        if let Some(m) = &metrics {
            breaker = breaker.with_metrics(m.clone());
        }

        Ok(Self {
            platform,
            breaker,
            governor: SpendGovernor::new(&settings.budget, clock.clone())?,
            limiter: CallRateLimiter::new(settings.calls_per_minute, clock.clone())?,
            fallback: FallbackEngine::new(&settings.fallback)?,
            metrics,
            retry: RetryPolicy::from_config(&settings.retry)?,
            predictor,
            deadline: settings.predictor_deadline,
            clock,
        })
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn governor(&self) -> &SpendGovernor {
        &self.governor
    }

    pub fn limiter(&self) -> &CallRateLimiter {
        &self.limiter
    }

    pub fn fallback(&self) -> &FallbackEngine {
        &self.fallback
    }

    pub fn metrics(&self) -> Option<&Arc<MetricsCollector>> {
        self.metrics.as_ref()
    }

    /// Run the admission pipeline for one bid.
    pub async fn decide_bid(&self, request: &BidRequest) -> Result<BidDecision, BidVeto> {
        let key = self.platform.slug();
        ::metrics::counter!("bidguard_bid_attempts_total", "platform" => key).increment(1);
        validate_request(request).map_err(|v| self.vetoed(v))?;

        let guarded = self
            .breaker
            .call_with_breaker(
                self.deadline,
                || self.predictor.predict(request),
                || Ok::<_, TransportError>(self.fallback.fallback_value(key, request.default_value)),
            )
            .await
            .map_err(|e| self.vetoed(BidVeto::PredictorFailed(e.to_string())))?;

        let value = guarded.value;
        if guarded.source == DecisionSource::Ai {
            if let Err(e) = self.fallback.record_sample(key, value) {
                warn!(platform = key, campaign_id = %request.campaign_id, error = %e, "predicted value not recorded");
            }
        }
        if !value.is_finite() {
            return Err(self.vetoed(BidVeto::NoValue { value }));
        }

        let amount = request.max_bid.min(value);
        if amount <= 0.0 {
            return Err(self.vetoed(BidVeto::NoValue { value }));
        }

        if !self.limiter.can_make_call() {
            return Err(self.vetoed(BidVeto::RateLimited {
                limit: self.limiter.limit(),
            }));
        }
        self.governor
            .check_spend(amount)
            .map_err(|e| self.vetoed(e.into()))?;

        // Commit. Both re-check under their own locks, so a concurrent bid
        // that won the race turns this one into a veto instead of an overrun.
        if !self.limiter.try_acquire() {
            return Err(self.vetoed(BidVeto::RateLimited {
                limit: self.limiter.limit(),
            }));
        }
        self.governor
            .record_spend(amount, &request.campaign_id)
            .map_err(|e| self.vetoed(e.into()))?;
        if let Some(m) = &self.metrics {
            m.record_request();
        }

        let decision = BidDecision {
            decision_id: Uuid::new_v4(),
            platform: self.platform,
            campaign_id: request.campaign_id.clone(),
            amount,
            predicted_value: value,
            source: guarded.source,
            decided_at: self.clock.now(),
        };

        ::metrics::counter!(
            "bidguard_bid_decisions_total",
            "platform" => key,
            "source" => decision.source.as_str()
        )
        .increment(1);
        ::metrics::histogram!("bidguard_bid_amount", "platform" => key).record(amount);
        debug!(
            platform = key,
            campaign_id = %decision.campaign_id,
            decision_id = %decision.decision_id,
            amount,
            source = %decision.source,
            "bid admitted"
        );

        Ok(decision)
    }

    /// Run one external platform API call under this guard's retry policy.
    pub async fn execute_platform_call<T, Op, Fut>(
        &self,
        cancel: &CancellationToken,
        op: Op,
    ) -> RetryOutcome<T, TransportError>
    where
        Op: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let outcome = self.retry.execute(cancel, op).await;
        let status = if outcome.result.is_ok() { "success" } else { "failure" };
        if outcome.attempts > 1 {
            ::metrics::counter!("bidguard_retries_total", "platform" => self.platform.slug())
                .increment(u64::from(outcome.attempts - 1));
        }
        ::metrics::counter!(
            "bidguard_platform_calls_total",
            "platform" => self.platform.slug(),
            "status" => status
        )
        .increment(1);
        if let Err(e) = &outcome.result {
            warn!(
                platform = self.platform.slug(),
                attempts = outcome.attempts,
                error = %e,
                "platform call failed"
            );
        }
        outcome
    }

    /// Clear every primitive back to its initial state.
    pub fn reset(&self) {
        self.breaker.reset();
        self.governor.reset();
        self.limiter.reset();
        self.fallback.reset();
        if let Some(m) = &self.metrics {
            m.reset();
        }
        info!(platform = self.platform.slug(), "platform guard reset");
    }

    fn vetoed(&self, veto: BidVeto) -> BidVeto {
        ::metrics::counter!(
            "bidguard_bid_vetoes_total",
            "platform" => self.platform.slug(),
            "reason" => veto.reason()
        )
        .increment(1);
        debug!(platform = self.platform.slug(), reason = veto.reason(), error = %veto, "bid vetoed");
        veto
    }
}

fn validate_request(request: &BidRequest) -> Result<(), BidVeto> {
    if request.campaign_id.trim().is_empty() {
        return Err(BidVeto::InvalidRequest("campaign_id must not be empty".into()));
    }
    if !request.max_bid.is_finite() || request.max_bid <= 0.0 {
        return Err(BidVeto::InvalidRequest(format!(
            "max_bid must be a positive amount, got {}",
            request.max_bid
        )));
    }
    if !request.default_value.is_finite() || request.default_value < 0.0 {
        return Err(BidVeto::InvalidRequest(format!(
            "default_value must be a non-negative amount, got {}",
            request.default_value
        )));
    }
    Ok(())
}

impl StatsProvider for PlatformGuard {
    fn platform(&self) -> Platform {
        self.platform
    }

    fn stats(&self) -> GuardStats {
        GuardStats {
            platform: self.platform,
            breaker: self.breaker.snapshot(),
            budget: self.governor.status(),
            rate_limit: self.limiter.status(),
            fallback_samples: self.fallback.sample_count(self.platform.slug()),
            metrics: self.metrics.as_ref().map(|m| m.summary()),
        }
    }

    fn publish_metrics(&self) {
        let platform = self.platform.slug();
        ::metrics::gauge!("bidguard_breaker_state", "platform" => platform)
            .set(self.breaker.state().as_gauge());
        let budget = self.governor.status();
        ::metrics::gauge!("bidguard_budget_spend", "platform" => platform).set(budget.current_spend);
        ::metrics::gauge!("bidguard_budget_utilization_pct", "platform" => platform)
            .set(budget.utilization_pct);
        ::metrics::gauge!("bidguard_rate_limit_remaining", "platform" => platform)
            .set(self.limiter.remaining() as f64);
        if let Some(m) = &self.metrics {
            m.publish();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::predictor::StaticPredictor;
    use bidguard_core::ManualClock;

    fn guard(value: f64) -> PlatformGuard {
        let clock = Arc::new(ManualClock::default());
        PlatformGuard::new(
            Platform::MetaAds,
            &GuardSettings::default(),
            Arc::new(StaticPredictor::new(value)),
            clock,
        )
        .unwrap()
    }

    fn request(max_bid: f64) -> BidRequest {
        BidRequest {
            campaign_id: "spring-sale".into(),
            max_bid,
            default_value: 3.0,
            features: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_bid_capped_at_max_bid() {
        let g = guard(12.0);
        let d = g.decide_bid(&request(5.0)).await.unwrap();
        assert_eq!(d.amount, 5.0);
        assert_eq!(d.predicted_value, 12.0);
        assert_eq!(d.source, DecisionSource::Ai);
        assert_eq!(g.governor().current_spend(), 5.0);
        assert_eq!(g.limiter().current_calls(), 1);
        assert_eq!(g.fallback().sample_count("meta_ads"), 1);
    }

    #[tokio::test]
    async fn test_zero_value_is_vetoed_without_commit() {
        let g = guard(0.0);
        let veto = g.decide_bid(&request(5.0)).await.unwrap_err();
        assert_eq!(veto, BidVeto::NoValue { value: 0.0 });
        assert_eq!(g.governor().current_spend(), 0.0);
        assert_eq!(g.limiter().current_calls(), 0);
    }

    #[tokio::test]
    async fn test_invalid_request_rejected() {
        let g = guard(10.0);
        let veto = g.decide_bid(&request(f64::NAN)).await.unwrap_err();
        assert_eq!(veto.reason(), "invalid_request");

        let mut r = request(5.0);
        r.campaign_id = " ".into();
        assert!(matches!(
            g.decide_bid(&r).await,
            Err(BidVeto::InvalidRequest(_))
        ));
        assert_eq!(g.metrics().unwrap().summary().total_requests, 0);
    }

    #[tokio::test]
    async fn test_only_placed_bids_count_as_requests() {
        let settings = GuardSettings {
            budget: BudgetConfig {
                window_secs: 600,
                burst_limit: 8.0,
            },
            ..GuardSettings::default()
        };
        let g = PlatformGuard::new(
            Platform::MetaAds,
            &settings,
            Arc::new(StaticPredictor::new(5.0)),
            Arc::new(ManualClock::default()),
        )
        .unwrap();

        g.decide_bid(&request(10.0)).await.unwrap();
        let veto = g.decide_bid(&request(10.0)).await.unwrap_err();
        assert_eq!(veto.reason(), "budget_exceeded");

        let summary = g.metrics().unwrap().summary();
        assert_eq!(summary.total_requests, 1);
        assert_eq!(g.governor().current_spend(), 5.0);
    }

    #[tokio::test]
    async fn test_non_finite_prediction_not_recorded() {
        let g = guard(f64::NAN);
        let veto = g.decide_bid(&request(5.0)).await.unwrap_err();
        assert_eq!(veto.reason(), "no_value");
        assert_eq!(g.fallback().sample_count("meta_ads"), 0);
        assert_eq!(g.governor().current_spend(), 0.0);
        assert_eq!(g.limiter().current_calls(), 0);
        assert_eq!(g.metrics().unwrap().summary().total_requests, 0);
    }

    #[tokio::test]
    async fn test_stats_reflect_decisions() {
        let g = guard(4.0);
        g.decide_bid(&request(10.0)).await.unwrap();
        let stats = g.stats();
        assert_eq!(stats.platform, Platform::MetaAds);
        assert_eq!(stats.budget.current_spend, 4.0);
        assert_eq!(stats.rate_limit.calls_in_window, 1);
        assert_eq!(stats.fallback_samples, 1);
        assert_eq!(stats.metrics.unwrap().total_requests, 1);

        g.reset();
        let stats = g.stats();
        assert_eq!(stats.budget.current_spend, 0.0);
        assert_eq!(stats.fallback_samples, 0);
    }

    #[tokio::test]
    async fn test_metrics_disabled() {
        let settings = GuardSettings {
            metrics_enabled: false,
            ..GuardSettings::default()
        };
        let g = PlatformGuard::new(
            Platform::Reddit,
            &settings,
            Arc::new(StaticPredictor::new(1.0)),
            Arc::new(ManualClock::default()),
        )
        .unwrap();
        g.decide_bid(&request(5.0)).await.unwrap();
        assert!(g.stats().metrics.is_none());
    }
}
