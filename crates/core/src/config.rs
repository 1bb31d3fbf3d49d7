use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

use crate::error::{GuardError, GuardResult};
use crate::types::Platform;

/// Longest accepted budget window (30 days).
pub const MAX_BUDGET_WINDOW_SECS: u64 = 30 * 24 * 3600;
/// Longest accepted breaker reset timeout (1 day).
pub const MAX_RESET_TIMEOUT_MS: u64 = 24 * 3600 * 1000;
/// Upper bound for preallocated sample buffers and LTV histories.
pub const MAX_SAMPLE_CAPACITY: usize = 1_000_000;

/// Root application configuration. Loaded from an optional TOML file and
/// environment variables with the prefix `BIDGUARD__`.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub predictor: PredictorConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub fallback: FallbackConfig,
    #[serde(default = "default_platforms")]
    pub platforms: HashMap<String, PlatformConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Attach a metrics collector to every breaker.
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_latency_sample_size")]
    pub latency_sample_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PredictorConfig {
    #[serde(default = "default_predictor_url")]
    pub url: String,
    /// Hard deadline for a single prediction call.
    #[serde(default = "default_predictor_deadline_ms")]
    pub deadline_ms: u64,
}

impl PredictorConfig {
    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }
}

/// Circuit breaker thresholds, one breaker per platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    /// Calls slower than this count as failures twice over.
    #[serde(default = "default_latency_threshold_ms")]
    pub latency_threshold_ms: u64,
    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,
}

impl BreakerConfig {
    pub fn latency_threshold(&self) -> Duration {
        Duration::from_millis(self.latency_threshold_ms)
    }

    /// Clamped to `MAX_RESET_TIMEOUT_MS`; `validate()` rejects anything above it.
    pub fn reset_timeout(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.reset_timeout_ms.min(MAX_RESET_TIMEOUT_MS) as i64)
    }
}

/// Sliding-window spend ceiling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    #[serde(default = "default_budget_window_secs")]
    pub window_secs: u64,
    #[serde(default = "default_burst_limit")]
    pub burst_limit: f64,
}

impl BudgetConfig {
    /// Clamped to `MAX_BUDGET_WINDOW_SECS`; `validate()` rejects anything above it.
    pub fn window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.window_secs.min(MAX_BUDGET_WINDOW_SECS) as i64)
    }
}

/// Exponential backoff with jitter for retryable single calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub multiplier: f64,
    /// Symmetric jitter as a fraction of the computed backoff (0.0 disables).
    #[serde(default = "default_jitter_fraction")]
    pub jitter_fraction: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackConfig {
    #[serde(default = "default_max_history")]
    pub max_history: usize,
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,
    /// Per-key bid multipliers; unlisted keys bid at parity (1.0).
    #[serde(default = "default_multipliers")]
    pub multipliers: HashMap<String, f64>,
}

/// Per-platform overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformConfig {
    #[serde(default = "default_platform_enabled")]
    pub enabled: bool,
    #[serde(default = "default_calls_per_minute")]
    pub calls_per_minute: u32,
    /// Overrides `budget.burst_limit` for this platform.
    #[serde(default)]
    pub burst_limit: Option<f64>,
}

// Default functions
fn default_node_id() -> String {
    "bidguard-01".to_string()
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_http_port() -> u16 {
    8080
}
fn default_metrics_enabled() -> bool {
    true
}
fn default_latency_sample_size() -> usize {
    1000
}
fn default_predictor_url() -> String {
    "http://localhost:8500/v1/predict".to_string()
}
fn default_predictor_deadline_ms() -> u64 {
    100
}
fn default_failure_threshold() -> u32 {
    3
}
fn default_success_threshold() -> u32 {
    2
}
fn default_latency_threshold_ms() -> u64 {
    500
}
fn default_reset_timeout_ms() -> u64 {
    30_000
}
fn default_budget_window_secs() -> u64 {
    600
}
fn default_burst_limit() -> f64 {
    1000.0
}
fn default_max_attempts() -> u32 {
    3
}
fn default_initial_backoff_ms() -> u64 {
    100
}
fn default_max_backoff_ms() -> u64 {
    5_000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_jitter_fraction() -> f64 {
    0.1
}
fn default_max_history() -> usize {
    100
}
fn default_min_samples() -> usize {
    1
}
fn default_multipliers() -> HashMap<String, f64> {
    // Short-form video earns a viral-reach premium, professional networks a B2B premium.
    HashMap::from([
        (Platform::TikTok.slug().to_string(), 1.2),
        (Platform::LinkedIn.slug().to_string(), 1.3),
    ])
}
fn default_platform_enabled() -> bool {
    true
}
fn default_calls_per_minute() -> u32 {
    100
}

fn default_platforms() -> HashMap<String, PlatformConfig> {
    let ceiling = |platform: Platform| match platform {
        Platform::GoogleAds => 1000,
        Platform::MetaAds => 200,
        Platform::TikTok => 600,
        Platform::LinkedIn => 100,
        Platform::AmazonAds => 40,
        Platform::MicrosoftAds => 300,
        Platform::Snapchat => 120,
        Platform::Pinterest => 100,
        Platform::Reddit => 60,
        Platform::XAds => 50,
    };
    Platform::ALL
        .iter()
        .map(|p| {
            (
                p.slug().to_string(),
                PlatformConfig {
                    enabled: true,
                    calls_per_minute: ceiling(*p),
                    burst_limit: None,
                },
            )
        })
        .collect()
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            http_port: default_http_port(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            latency_sample_size: default_latency_sample_size(),
        }
    }
}

impl Default for PredictorConfig {
    fn default() -> Self {
        Self {
            url: default_predictor_url(),
            deadline_ms: default_predictor_deadline_ms(),
        }
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            latency_threshold_ms: default_latency_threshold_ms(),
            reset_timeout_ms: default_reset_timeout_ms(),
        }
    }
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            window_secs: default_budget_window_secs(),
            burst_limit: default_burst_limit(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            multiplier: default_backoff_multiplier(),
            jitter_fraction: default_jitter_fraction(),
        }
    }
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            max_history: default_max_history(),
            min_samples: default_min_samples(),
            multipliers: default_multipliers(),
        }
    }
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            enabled: default_platform_enabled(),
            calls_per_minute: default_calls_per_minute(),
            burst_limit: None,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            api: ApiConfig::default(),
            metrics: MetricsConfig::default(),
            predictor: PredictorConfig::default(),
            breaker: BreakerConfig::default(),
            budget: BudgetConfig::default(),
            retry: RetryConfig::default(),
            fallback: FallbackConfig::default(),
            platforms: default_platforms(),
        }
    }
}

impl BreakerConfig {
    pub fn validate(&self) -> GuardResult<()> {
        if self.failure_threshold == 0 {
            return Err(GuardError::Config("breaker.failure_threshold must be > 0".into()));
        }
        if self.success_threshold == 0 {
            return Err(GuardError::Config("breaker.success_threshold must be > 0".into()));
        }
        if self.latency_threshold_ms == 0 {
            return Err(GuardError::Config("breaker.latency_threshold_ms must be > 0".into()));
        }
        if self.reset_timeout_ms > MAX_RESET_TIMEOUT_MS {
            return Err(GuardError::Config(format!(
                "breaker.reset_timeout_ms must be <= {MAX_RESET_TIMEOUT_MS}"
            )));
        }
        Ok(())
    }
}

impl BudgetConfig {
    pub fn validate(&self) -> GuardResult<()> {
        if self.window_secs == 0 || self.window_secs > MAX_BUDGET_WINDOW_SECS {
            return Err(GuardError::Config(format!(
                "budget.window_secs must be within 1..={MAX_BUDGET_WINDOW_SECS}"
            )));
        }
        validate_limit(self.burst_limit, "budget.burst_limit")
    }
}

impl RetryConfig {
    pub fn validate(&self) -> GuardResult<()> {
        if self.max_attempts == 0 {
            return Err(GuardError::Config("retry.max_attempts must be > 0".into()));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(GuardError::Config("retry.multiplier must be >= 1.0".into()));
        }
        if !(0.0..=1.0).contains(&self.jitter_fraction) {
            return Err(GuardError::Config(
                "retry.jitter_fraction must be within [0, 1]".into(),
            ));
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err(GuardError::Config(
                "retry.initial_backoff_ms must not exceed retry.max_backoff_ms".into(),
            ));
        }
        Ok(())
    }
}

impl FallbackConfig {
    pub fn validate(&self) -> GuardResult<()> {
        if self.max_history == 0 || self.max_history > MAX_SAMPLE_CAPACITY {
            return Err(GuardError::Config(format!(
                "fallback.max_history must be within 1..={MAX_SAMPLE_CAPACITY}"
            )));
        }
        if self.min_samples == 0 || self.min_samples > self.max_history {
            return Err(GuardError::Config(
                "fallback.min_samples must be within 1..=max_history".into(),
            ));
        }
        for (key, m) in &self.multipliers {
            if !m.is_finite() || *m < 0.0 {
                return Err(GuardError::Config(format!(
                    "fallback.multipliers.{key} must be a non-negative number"
                )));
            }
        }
        Ok(())
    }
}

fn validate_limit(limit: f64, field: &str) -> GuardResult<()> {
    if !limit.is_finite() || limit <= 0.0 {
        return Err(GuardError::Config(format!("{field} must be a positive amount")));
    }
    Ok(())
}

impl AppConfig {
    /// Load configuration from an optional file and environment variables.
    pub fn load(path: Option<&str>) -> GuardResult<Self> {
        let builder = config::Config::builder()
            .add_source(config::File::with_name(path.unwrap_or("bidguard")).required(path.is_some()))
            .add_source(
                config::Environment::with_prefix("BIDGUARD")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(","),
            );

        let config: AppConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        debug!(
            file = path.unwrap_or("bidguard (optional)"),
            platforms = config.platforms.len(),
            "configuration loaded"
        );
        Ok(config)
    }

    /// Reject invalid construction parameters up front; nothing is silently defaulted.
    pub fn validate(&self) -> GuardResult<()> {
        if self.predictor.deadline_ms == 0 {
            return Err(GuardError::Config("predictor.deadline_ms must be > 0".into()));
        }
        if self.metrics.latency_sample_size == 0
            || self.metrics.latency_sample_size > MAX_SAMPLE_CAPACITY
        {
            return Err(GuardError::Config(format!(
                "metrics.latency_sample_size must be within 1..={MAX_SAMPLE_CAPACITY}"
            )));
        }
        self.breaker.validate()?;
        self.budget.validate()?;
        self.retry.validate()?;
        self.fallback.validate()?;

        for (name, platform) in &self.platforms {
            name.parse::<Platform>()?;
            if platform.calls_per_minute == 0 {
                return Err(GuardError::Config(format!(
                    "platforms.{name}.calls_per_minute must be > 0"
                )));
            }
            if let Some(limit) = platform.burst_limit {
                validate_limit(limit, &format!("platforms.{name}.burst_limit"))?;
            }
        }
        Ok(())
    }

    /// Enabled platforms with their effective budget settings.
    pub fn enabled_platforms(&self) -> GuardResult<Vec<(Platform, PlatformConfig, BudgetConfig)>> {
        let mut out = Vec::new();
        for (name, platform) in &self.platforms {
            if !platform.enabled {
                continue;
            }
            let budget = BudgetConfig {
                window_secs: self.budget.window_secs,
                burst_limit: platform.burst_limit.unwrap_or(self.budget.burst_limit),
            };
            out.push((name.parse::<Platform>()?, platform.clone(), budget));
        }
        out.sort_by_key(|(p, _, _)| *p);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        config.validate().unwrap();
        assert_eq!(config.breaker.failure_threshold, 3);
        assert_eq!(config.breaker.success_threshold, 2);
        assert_eq!(config.breaker.latency_threshold(), Duration::from_millis(500));
        assert_eq!(config.budget.window(), chrono::Duration::minutes(10));
        assert_eq!(config.predictor.deadline(), Duration::from_millis(100));
        assert_eq!(config.platforms.len(), Platform::ALL.len());
    }

    #[test]
    fn test_non_positive_budget_rejected() {
        let mut config = AppConfig::default();
        config.budget.burst_limit = 0.0;
        assert!(matches!(config.validate(), Err(GuardError::Config(_))));

        config.budget.burst_limit = f64::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_platform_key_rejected() {
        let mut config = AppConfig::default();
        config
            .platforms
            .insert("friendster".to_string(), PlatformConfig::default());
        assert!(matches!(
            config.validate(),
            Err(GuardError::UnknownPlatform(_))
        ));
    }

    #[test]
    fn test_platform_burst_override() {
        let mut config = AppConfig::default();
        config.platforms.retain(|k, _| k == "linkedin" || k == "reddit");
        if let Some(p) = config.platforms.get_mut("reddit") {
            p.burst_limit = Some(250.0);
        }
        let enabled = config.enabled_platforms().unwrap();
        assert_eq!(enabled.len(), 2);
        let (_, _, linkedin_budget) = &enabled[0];
        let (_, _, reddit_budget) = &enabled[1];
        assert_eq!(linkedin_budget.burst_limit, 1000.0);
        assert_eq!(reddit_budget.burst_limit, 250.0);
    }

    #[test]
    fn test_oversized_budget_window_rejected() {
        for window_secs in [u64::MAX, 100_000_000_000_000_000, MAX_BUDGET_WINDOW_SECS + 1] {
            let budget = BudgetConfig {
                window_secs,
                burst_limit: 100.0,
            };
            assert!(
                matches!(budget.validate(), Err(GuardError::Config(_))),
                "window_secs {window_secs} accepted"
            );
            // Never wraps negative, even unvalidated.
            assert!(budget.window() > chrono::Duration::zero());
        }

        let widest = BudgetConfig {
            window_secs: MAX_BUDGET_WINDOW_SECS,
            burst_limit: 100.0,
        };
        widest.validate().unwrap();
        assert_eq!(widest.window(), chrono::Duration::days(30));
    }

    #[test]
    fn test_oversized_reset_timeout_rejected() {
        for reset_timeout_ms in [u64::MAX, MAX_RESET_TIMEOUT_MS + 1] {
            let breaker = BreakerConfig {
                reset_timeout_ms,
                ..BreakerConfig::default()
            };
            assert!(matches!(breaker.validate(), Err(GuardError::Config(_))));
            assert!(breaker.reset_timeout() > chrono::Duration::zero());
        }

        let mut config = AppConfig::default();
        config.breaker.reset_timeout_ms = u64::MAX;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_oversized_buffers_rejected() {
        let mut config = AppConfig::default();
        config.metrics.latency_sample_size = usize::MAX;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.fallback.max_history = usize::MAX;
        config.fallback.min_samples = 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_retry_config_validation() {
        let mut retry = RetryConfig::default();
        retry.validate().unwrap();
        retry.jitter_fraction = 1.5;
        assert!(retry.validate().is_err());
    }
}
