//! Sliding-window budget governor.
//!
//! Keeps an append-ordered ledger of spend events and vetoes any spend that
//! would push the non-expired total above the burst limit. Every operation
//! evicts expired events from the front first; `record_spend` re-checks the
//! limit under the same lock it appends under (check-then-append), so
//! concurrent callers can never over-commit.

use std::collections::{HashMap, VecDeque};

use bidguard_core::config::BudgetConfig;
use bidguard_core::{GuardResult, SharedClock};
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// A single accepted spend. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpendEvent {
    pub timestamp: DateTime<Utc>,
    pub amount: f64,
    pub key: String,
}

/// Why a spend was refused. `Exceeded` is a veto: callers must not retry it blindly.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BudgetError {
    #[error(
        "budget exceeded: current {current:.2} + requested {requested:.2} > limit {limit:.2} \
         (window {window_start} .. {window_end})"
    )]
    Exceeded {
        current: f64,
        requested: f64,
        limit: f64,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    },

    #[error("invalid spend amount: {0}")]
    InvalidAmount(f64),
}

/// Point-in-time view of the governor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetStatus {
    pub total_budget: f64,
    pub current_spend: f64,
    pub remaining: f64,
    pub spend_rate_per_minute: f64,
    pub utilization_pct: f64,
    pub event_count: usize,
    /// The window's spend has reached the limit.
    pub exceeded: bool,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Ledger {
    events: VecDeque<SpendEvent>,
    total: f64,
}

impl Ledger {
    fn evict_before(&mut self, cutoff: DateTime<Utc>) {
        while let Some(front) = self.events.front() {
            if front.timestamp >= cutoff {
                break;
            }
            self.total -= front.amount;
            self.events.pop_front();
        }
        if self.events.is_empty() {
            // Drop accumulated float drift once the window is empty.
            self.total = 0.0;
        }
    }
}

pub struct SpendGovernor {
    burst_limit: f64,
    window: Duration,
    clock: SharedClock,
    ledger: Mutex<Ledger>,
}

impl SpendGovernor {
    /// Fails on a non-positive limit or window; invalid budgets are never defaulted.
    pub fn new(config: &BudgetConfig, clock: SharedClock) -> GuardResult<Self> {
        config.validate()?;
        Ok(Self {
            burst_limit: config.burst_limit,
            window: config.window(),
            clock,
            ledger: Mutex::new(Ledger::default()),
        })
    }

    pub fn burst_limit(&self) -> f64 {
        self.burst_limit
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Lock the ledger with expired events already evicted.
    fn locked(&self) -> (parking_lot::MutexGuard<'_, Ledger>, DateTime<Utc>) {
        let now = self.clock.now();
        let mut ledger = self.ledger.lock();
        ledger.evict_before(now - self.window);
        (ledger, now)
    }

    /// True iff `amount` fits in the window right now. Does not reserve anything.
    pub fn can_spend(&self, amount: f64) -> bool {
        self.check_spend(amount).is_ok()
    }

    /// Read-only variant of `record_spend`: the veto it would return, without appending.
    pub fn check_spend(&self, amount: f64) -> Result<(), BudgetError> {
        if !is_valid_amount(amount) {
            return Err(BudgetError::InvalidAmount(amount));
        }
        let (ledger, now) = self.locked();
        self.check_locked(&ledger, amount, now)
    }

    fn check_locked(&self, ledger: &Ledger, amount: f64, now: DateTime<Utc>) -> Result<(), BudgetError> {
        if ledger.total + amount > self.burst_limit {
            return Err(BudgetError::Exceeded {
                current: ledger.total,
                requested: amount,
                limit: self.burst_limit,
                window_start: now - self.window,
                window_end: now,
            });
        }
        Ok(())
    }

    /// Re-check the limit and append the spend only if it still fits.
    pub fn record_spend(&self, amount: f64, key: &str) -> Result<(), BudgetError> {
        if !is_valid_amount(amount) {
            return Err(BudgetError::InvalidAmount(amount));
        }
        let (mut ledger, now) = self.locked();
        if let Err(veto) = self.check_locked(&ledger, amount, now) {
            debug!(
                current = ledger.total,
                requested = amount,
                limit = self.burst_limit,
                key,
                "spend vetoed by budget governor"
            );
            return Err(veto);
        }
        ledger.total += amount;
        ledger.events.push_back(SpendEvent {
            timestamp: now,
            amount,
            key: key.to_string(),
        });
        Ok(())
    }

    pub fn current_spend(&self) -> f64 {
        self.locked().0.total
    }

    pub fn remaining_budget(&self) -> f64 {
        (self.burst_limit - self.current_spend()).max(0.0)
    }

    pub fn status(&self) -> BudgetStatus {
        let (ledger, now) = self.locked();
        let current = ledger.total;
        let window_minutes = self.window.num_milliseconds() as f64 / 60_000.0;
        BudgetStatus {
            total_budget: self.burst_limit,
            current_spend: current,
            remaining: (self.burst_limit - current).max(0.0),
            spend_rate_per_minute: if window_minutes > 0.0 {
                current / window_minutes
            } else {
                0.0
            },
            utilization_pct: current / self.burst_limit * 100.0,
            event_count: ledger.events.len(),
            exceeded: current >= self.burst_limit,
            window_start: now - self.window,
            window_end: now,
        }
    }

    /// Non-expired spend grouped by key.
    pub fn spend_by_key(&self) -> HashMap<String, f64> {
        let (ledger, _) = self.locked();
        let mut by_key = HashMap::new();
        for event in &ledger.events {
            *by_key.entry(event.key.clone()).or_insert(0.0) += event.amount;
        }
        by_key
    }

    pub fn reset(&self) {
        let mut ledger = self.ledger.lock();
        ledger.events.clear();
        ledger.total = 0.0;
    }
}

fn is_valid_amount(amount: f64) -> bool {
    amount.is_finite() && amount >= 0.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use bidguard_core::ManualClock;
    use std::sync::Arc;

    fn governor(limit: f64, window_secs: u64) -> (SpendGovernor, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let config = BudgetConfig {
            window_secs,
            burst_limit: limit,
        };
        (SpendGovernor::new(&config, clock.clone()).unwrap(), clock)
    }

    #[test]
    fn test_unbounded_window_rejected() {
        let clock = Arc::new(ManualClock::default());
        for window_secs in [u64::MAX, 100_000_000_000_000_000] {
            let config = BudgetConfig {
                window_secs,
                burst_limit: 100.0,
            };
            assert!(SpendGovernor::new(&config, clock.clone()).is_err());
        }

        // The widest accepted window still enforces the limit.
        let (gov, clock) = governor(100.0, bidguard_core::config::MAX_BUDGET_WINDOW_SECS);
        for _ in 0..10 {
            let _ = gov.record_spend(90.0, "campaign-a");
            clock.advance(Duration::seconds(1));
        }
        assert_eq!(gov.current_spend(), 90.0);
    }

    #[test]
    fn test_burst_limit_scenario() {
        let (gov, _) = governor(1000.0, 600);

        gov.record_spend(900.0, "campaign-a").unwrap();
        gov.record_spend(50.0, "campaign-b").unwrap();
        assert_eq!(gov.current_spend(), 950.0);

        match gov.record_spend(100.0, "campaign-a") {
            Err(BudgetError::Exceeded {
                current,
                requested,
                limit,
                window_start,
                window_end,
            }) => {
                assert_eq!(current, 950.0);
                assert_eq!(requested, 100.0);
                assert_eq!(limit, 1000.0);
                assert_eq!(window_end - window_start, Duration::minutes(10));
            }
            other => panic!("expected budget veto, got {other:?}"),
        }
        // The vetoed spend was not appended.
        assert_eq!(gov.current_spend(), 950.0);
        assert_eq!(gov.status().event_count, 2);
    }

    #[test]
    fn test_can_spend_never_allows_breach() {
        let (gov, _) = governor(100.0, 600);
        assert!(gov.can_spend(100.0));
        assert!(!gov.can_spend(100.01));
        gov.record_spend(60.0, "k").unwrap();
        assert!(gov.can_spend(40.0));
        assert!(!gov.can_spend(40.5));
        assert!(!gov.can_spend(-1.0));
        assert!(!gov.can_spend(f64::NAN));
    }

    #[test]
    fn test_window_expiry_returns_spend_to_zero() {
        let (gov, clock) = governor(500.0, 600);
        gov.record_spend(200.0, "a").unwrap();
        clock.advance(Duration::minutes(5));
        gov.record_spend(300.0, "b").unwrap();
        assert!(!gov.can_spend(1.0));

        clock.advance(Duration::minutes(5) + Duration::seconds(1));
        assert_eq!(gov.current_spend(), 300.0);
        assert!(gov.can_spend(200.0));

        clock.advance(Duration::minutes(10));
        assert_eq!(gov.current_spend(), 0.0);
        assert_eq!(gov.remaining_budget(), 500.0);
    }

    #[test]
    fn test_spend_by_key_and_status() {
        let (gov, _) = governor(1000.0, 600);
        gov.record_spend(100.0, "a").unwrap();
        gov.record_spend(150.0, "b").unwrap();
        gov.record_spend(250.0, "a").unwrap();

        let by_key = gov.spend_by_key();
        assert_eq!(by_key["a"], 350.0);
        assert_eq!(by_key["b"], 150.0);

        let status = gov.status();
        assert_eq!(status.current_spend, 500.0);
        assert_eq!(status.remaining, 500.0);
        assert_eq!(status.utilization_pct, 50.0);
        assert_eq!(status.spend_rate_per_minute, 50.0);
        assert!(!status.exceeded);

        gov.record_spend(500.0, "c").unwrap();
        assert!(gov.status().exceeded);
    }

    #[test]
    fn test_invalid_construction_rejected() {
        let clock = Arc::new(ManualClock::default());
        let bad_limit = BudgetConfig {
            window_secs: 600,
            burst_limit: -5.0,
        };
        assert!(SpendGovernor::new(&bad_limit, clock.clone()).is_err());

        let bad_window = BudgetConfig {
            window_secs: 0,
            burst_limit: 100.0,
        };
        assert!(SpendGovernor::new(&bad_window, clock).is_err());
    }

    #[test]
    fn test_invalid_amount_rejected() {
        let (gov, _) = governor(100.0, 60);
        assert_eq!(
            gov.record_spend(f64::INFINITY, "k"),
            Err(BudgetError::InvalidAmount(f64::INFINITY))
        );
        assert!(matches!(
            gov.record_spend(-3.0, "k"),
            Err(BudgetError::InvalidAmount(_))
        ));
    }

    #[test]
    fn test_concurrent_spend_never_over_commits() {
        let (gov, _) = governor(1000.0, 600);
        let gov = Arc::new(gov);

        std::thread::scope(|s| {
            for t in 0..16 {
                let gov = gov.clone();
                s.spawn(move || {
                    for _ in 0..100 {
                        let _ = gov.record_spend(7.0, &format!("worker-{t}"));
                    }
                });
            }
        });

        let total = gov.current_spend();
        assert!(total <= 1000.0, "over-committed: {total}");
        // 142 * 7 = 994; one more would breach.
        assert_eq!(gov.status().event_count, 142);
        assert!(!gov.can_spend(7.0));
    }
}
