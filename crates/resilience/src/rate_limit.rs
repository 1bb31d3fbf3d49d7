//! Per-platform sliding-window call limiter (calls per rolling minute).

use std::collections::VecDeque;

use bidguard_core::{GuardError, GuardResult, SharedClock};
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Current usage of a limiter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitStatus {
    pub limit: u32,
    pub calls_in_window: usize,
    pub remaining: u32,
    /// When the oldest call in the window expires, if any.
    pub reset_at: Option<DateTime<Utc>>,
}

pub struct CallRateLimiter {
    calls_per_minute: u32,
    clock: SharedClock,
    calls: Mutex<VecDeque<DateTime<Utc>>>,
}

impl CallRateLimiter {
    pub fn new(calls_per_minute: u32, clock: SharedClock) -> GuardResult<Self> {
        if calls_per_minute == 0 {
            return Err(GuardError::Config("calls_per_minute must be > 0".into()));
        }
        Ok(Self {
            calls_per_minute,
            clock,
            calls: Mutex::new(VecDeque::new()),
        })
    }

    fn window() -> Duration {
        Duration::minutes(1)
    }

    fn locked(&self) -> (parking_lot::MutexGuard<'_, VecDeque<DateTime<Utc>>>, DateTime<Utc>) {
        let now = self.clock.now();
        let cutoff = now - Self::window();
        let mut calls = self.calls.lock();
        while calls.front().is_some_and(|ts| *ts < cutoff) {
            calls.pop_front();
        }
        (calls, now)
    }

    pub fn can_make_call(&self) -> bool {
        let (calls, _) = self.locked();
        calls.len() < self.calls_per_minute as usize
    }

    /// Record a call unconditionally. Pair with `can_make_call`.
    pub fn record_call(&self) {
        let (mut calls, now) = self.locked();
        calls.push_back(now);
    }

    /// Check and record under one lock.
    pub fn try_acquire(&self) -> bool {
        let (mut calls, now) = self.locked();
        if calls.len() >= self.calls_per_minute as usize {
            return false;
        }
        calls.push_back(now);
        true
    }

    pub fn current_calls(&self) -> usize {
        self.locked().0.len()
    }

    pub fn remaining(&self) -> u32 {
        let used = self.current_calls() as u32;
        self.calls_per_minute.saturating_sub(used)
    }

    pub fn limit(&self) -> u32 {
        self.calls_per_minute
    }

    pub fn status(&self) -> RateLimitStatus {
        let (calls, _) = self.locked();
        RateLimitStatus {
            limit: self.calls_per_minute,
            calls_in_window: calls.len(),
            remaining: self.calls_per_minute.saturating_sub(calls.len() as u32),
            reset_at: calls.front().map(|ts| *ts + Self::window()),
        }
    }

    pub fn reset(&self) {
        self.calls.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bidguard_core::{Clock, ManualClock};
    use std::sync::Arc;

    #[test]
    fn test_ceiling_and_recovery() {
        let clock = Arc::new(ManualClock::default());
        let limiter = CallRateLimiter::new(100, clock.clone()).unwrap();
        let first = clock.now();

        for i in 0..100 {
            assert!(limiter.can_make_call(), "call {i} should be allowed");
            limiter.record_call();
            clock.advance(Duration::milliseconds(100));
        }

        // 101st call, ~10s after the first.
        assert!(!limiter.can_make_call());
        assert_eq!(limiter.remaining(), 0);

        // 61s after the first call, it has left the window.
        clock.set(first + Duration::seconds(61));
        assert!(limiter.can_make_call());
        assert!(limiter.remaining() >= 1);
    }

    #[test]
    fn test_try_acquire_is_atomic() {
        let clock = Arc::new(ManualClock::default());
        let limiter = Arc::new(CallRateLimiter::new(40, clock).unwrap());

        let granted: usize = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let limiter = limiter.clone();
                    s.spawn(move || (0..20).filter(|_| limiter.try_acquire()).count())
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });

        assert_eq!(granted, 40);
        assert_eq!(limiter.current_calls(), 40);
    }

    #[test]
    fn test_status_reports_reset_time() {
        let clock = Arc::new(ManualClock::default());
        let start = clock.now();
        let limiter = CallRateLimiter::new(2, clock.clone()).unwrap();
        assert!(limiter.status().reset_at.is_none());

        limiter.record_call();
        clock.advance(Duration::seconds(5));
        limiter.record_call();

        let status = limiter.status();
        assert_eq!(status.calls_in_window, 2);
        assert_eq!(status.remaining, 0);
        assert_eq!(status.reset_at, Some(start + Duration::minutes(1)));

        limiter.reset();
        assert_eq!(limiter.current_calls(), 0);
    }

    #[test]
    fn test_zero_ceiling_rejected() {
        let clock = Arc::new(ManualClock::default());
        assert!(CallRateLimiter::new(0, clock).is_err());
    }
}
