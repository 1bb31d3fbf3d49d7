//! Heuristic fallback bids from locally recorded LTV history.
//!
//! Only consulted while the predictor is circuit-broken: trades optimality
//! for availability using nothing but the last N predictions per key.

use std::collections::{HashMap, VecDeque};

use bidguard_core::config::FallbackConfig;
use bidguard_core::{GuardError, GuardResult};
use parking_lot::RwLock;
use tracing::debug;

pub struct FallbackEngine {
    max_history: usize,
    min_samples: usize,
    history: RwLock<HashMap<String, VecDeque<f64>>>,
    multipliers: RwLock<HashMap<String, f64>>,
}

impl FallbackEngine {
    pub fn new(config: &FallbackConfig) -> GuardResult<Self> {
        config.validate()?;
        Ok(Self {
            max_history: config.max_history,
            min_samples: config.min_samples,
            history: RwLock::new(HashMap::new()),
            multipliers: RwLock::new(config.multipliers.clone()),
        })
    }

    /// Append an observed LTV for `key`, evicting the oldest beyond `max_history`.
    pub fn record_sample(&self, key: &str, value: f64) -> GuardResult<()> {
        if !value.is_finite() {
            return Err(GuardError::InvalidSample {
                key: key.to_string(),
                value,
            });
        }
        let mut history = self.history.write();
        let ring = history
            .entry(key.to_string())
            .or_insert_with(|| VecDeque::with_capacity(self.max_history));
        if ring.len() >= self.max_history {
            ring.pop_front();
        }
        ring.push_back(value);
        Ok(())
    }

    /// `median(history) * multiplier` once enough samples exist, else `default * multiplier`.
    pub fn fallback_value(&self, key: &str, default_value: f64) -> f64 {
        let multiplier = self.multiplier(key);
        let median = {
            let history = self.history.read();
            history
                .get(key)
                .filter(|ring| ring.len() >= self.min_samples)
                .and_then(|ring| median(ring.iter().copied()))
        };

        match median {
            Some(m) => m * multiplier,
            None => {
                debug!(key, default_value, "no LTV history, using default");
                default_value * multiplier
            }
        }
    }

    /// Multiplier for `key`; unconfigured keys bid at parity.
    pub fn multiplier(&self, key: &str) -> f64 {
        self.multipliers.read().get(key).copied().unwrap_or(1.0)
    }

    pub fn set_multiplier(&self, key: &str, multiplier: f64) -> GuardResult<()> {
        if !multiplier.is_finite() || multiplier < 0.0 {
            return Err(GuardError::Config(format!(
                "multiplier for '{key}' must be a non-negative number"
            )));
        }
        self.multipliers.write().insert(key.to_string(), multiplier);
        Ok(())
    }

    pub fn sample_count(&self, key: &str) -> usize {
        self.history.read().get(key).map_or(0, VecDeque::len)
    }

    pub fn reset(&self) {
        self.history.write().clear();
    }
}

/// Exact median: mean of the two middle values for even lengths.
pub fn median(values: impl IntoIterator<Item = f64>) -> Option<f64> {
    let mut sorted: Vec<f64> = values.into_iter().collect();
    if sorted.is_empty() {
        return None;
    }
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> FallbackEngine {
        FallbackEngine::new(&FallbackConfig {
            multipliers: HashMap::new(),
            ..FallbackConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_median_odd_and_even() {
        let e = engine();
        for v in [120.0, 100.0, 115.0, 105.0, 110.0] {
            e.record_sample("meta_ads", v).unwrap();
        }
        assert_eq!(e.fallback_value("meta_ads", 0.0), 110.0);

        for v in [40.0, 10.0, 30.0, 20.0] {
            e.record_sample("reddit", v).unwrap();
        }
        assert_eq!(e.fallback_value("reddit", 0.0), 25.0);
    }

    #[test]
    fn test_default_used_without_history() {
        let e = engine();
        assert_eq!(e.fallback_value("unknown", 42.0), 42.0);
        e.set_multiplier("unknown", 0.5).unwrap();
        assert_eq!(e.fallback_value("unknown", 42.0), 21.0);
    }

    #[test]
    fn test_multiplier_applies_to_median() {
        let e = FallbackEngine::new(&FallbackConfig::default()).unwrap();
        for v in [10.0, 20.0, 30.0] {
            e.record_sample("linkedin", v).unwrap();
            e.record_sample("google_ads", v).unwrap();
        }
        assert_eq!(e.multiplier("google_ads"), 1.0);
        assert_eq!(e.fallback_value("google_ads", 0.0), 20.0);
        assert!((e.fallback_value("linkedin", 0.0) - 26.0).abs() < 1e-9);
    }

    #[test]
    fn test_history_is_bounded() {
        let e = FallbackEngine::new(&FallbackConfig {
            max_history: 100,
            min_samples: 1,
            multipliers: HashMap::new(),
        })
        .unwrap();
        for i in 0..250 {
            e.record_sample("tiktok", i as f64).unwrap();
        }
        assert_eq!(e.sample_count("tiktok"), 100);
        // Remaining values are 150..=249.
        assert_eq!(e.fallback_value("tiktok", 0.0), 199.5);
    }

    #[test]
    fn test_min_samples_gate() {
        let e = FallbackEngine::new(&FallbackConfig {
            max_history: 10,
            min_samples: 3,
            multipliers: HashMap::new(),
        })
        .unwrap();
        e.record_sample("snapchat", 80.0).unwrap();
        e.record_sample("snapchat", 90.0).unwrap();
        assert_eq!(e.fallback_value("snapchat", 5.0), 5.0);
        e.record_sample("snapchat", 100.0).unwrap();
        assert_eq!(e.fallback_value("snapchat", 5.0), 90.0);
    }

    #[test]
    fn test_rejects_bad_input() {
        let e = engine();
        assert!(e.record_sample("x_ads", f64::NAN).is_err());
        assert!(e.set_multiplier("x_ads", -1.0).is_err());
        assert_eq!(e.sample_count("x_ads"), 0);
    }
}
