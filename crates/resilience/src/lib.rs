//! Admission-control primitives for real-money bidding: spend and call-rate
//! vetoes, a circuit breaker around the predictor, a heuristic fallback for
//! when it is open, per-breaker metrics and a retry executor.

pub mod budget;
pub mod circuit_breaker;
pub mod fallback;
pub mod metrics;
pub mod rate_limit;
pub mod retry;
pub mod stats;

pub use budget::{BudgetError, BudgetStatus, SpendEvent, SpendGovernor};
pub use circuit_breaker::{BreakerCallError, BreakerSnapshot, CircuitBreaker, CircuitState, Guarded};
pub use fallback::FallbackEngine;
pub use metrics::{LatencyPercentiles, MetricsCollector, MetricsSummary};
pub use rate_limit::{CallRateLimiter, RateLimitStatus};
pub use retry::{RetryError, RetryOutcome, RetryPolicy};
pub use stats::{GuardStats, StatsProvider};
