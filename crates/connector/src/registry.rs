use std::sync::Arc;

use bidguard_core::{AppConfig, GuardResult, Platform, SharedClock};
use bidguard_resilience::{GuardStats, StatsProvider};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::info;

use crate::guard::{GuardSettings, PlatformGuard};
use crate::predictor::Predictor;

/// Platform → guard lookup shared by the API handlers.
pub struct GuardRegistry {
    guards: DashMap<Platform, Arc<PlatformGuard>>,
}

impl Default for GuardRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl GuardRegistry {
    pub fn new() -> Self {
        Self {
            guards: DashMap::new(),
        }
    }

    /// One guard per enabled platform. `predictor_for` supplies each guard's model client.
    pub fn from_config<F>(config: &AppConfig, clock: SharedClock, predictor_for: F) -> GuardResult<Self>
    where
        F: Fn(Platform) -> GuardResult<Arc<dyn Predictor>>,
    {
        config.validate()?;
        let registry = Self::new();
        for (platform, platform_config, budget) in config.enabled_platforms()? {
            let settings = GuardSettings::from_app(config, &platform_config, budget);
            let guard = PlatformGuard::new(platform, &settings, predictor_for(platform)?, clock.clone())?;
            info!(
                platform = platform.slug(),
                calls_per_minute = settings.calls_per_minute,
                burst_limit = settings.budget.burst_limit,
                "platform guard registered"
            );
            registry.register(guard);
        }
        Ok(registry)
    }

    /// Register a guard. Returns false if the platform already has one.
    pub fn register(&self, guard: PlatformGuard) -> bool {
        match self.guards.entry(guard.platform()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(guard));
                true
            }
        }
    }

    pub fn get(&self, platform: Platform) -> Option<Arc<PlatformGuard>> {
        self.guards.get(&platform).map(|g| g.value().clone())
    }

    /// Registered platforms in declaration order.
    pub fn platforms(&self) -> Vec<Platform> {
        let mut platforms: Vec<Platform> = self.guards.iter().map(|e| *e.key()).collect();
        platforms.sort();
        platforms
    }

    pub fn providers(&self) -> Vec<Arc<dyn StatsProvider>> {
        self.platforms()
            .into_iter()
            .filter_map(|p| self.get(p))
            .map(|g| g as Arc<dyn StatsProvider>)
            .collect()
    }

    pub fn all_stats(&self) -> Vec<GuardStats> {
        self.providers().iter().map(|p| p.stats()).collect()
    }

    /// Refresh every guard's gauges ahead of a scrape.
    pub fn publish_all(&self) {
        for provider in self.providers() {
            provider.publish_metrics();
        }
    }

    pub fn len(&self) -> usize {
        self.guards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.guards.is_empty()
    }
}
