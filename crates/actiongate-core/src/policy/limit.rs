//! Per-feature quota state.
//!
//! A [`LimitPolicy`] is a thin adapter over the state store: it reads and
//! writes usage and the cooldown start, and asks a [`LimitSource`] for the
//! current quota and window on every call. It has no side effects beyond the
//! store and never caches configuration.

use chrono::{DateTime, Duration, Utc};
use std::sync::{Arc, RwLock};
use tracing::warn;

use crate::clock::{from_epoch_ms, to_epoch_ms};
use crate::feature::Feature;
use crate::storage::{Config, StateStore, MAX_WINDOW_SECS};

/// Configuration shared between the composition root and every adapter.
/// Writers swap values in place; readers always see the latest.
pub type SharedConfig = Arc<RwLock<Config>>;

/// Quota state of a single feature.
pub trait LimitPolicy: Send {
    fn feature(&self) -> Feature;

    fn current_usage(&self) -> u32;

    fn limit(&self) -> u32;

    fn cooldown_duration(&self) -> Duration;

    fn set_usage(&mut self, usage: u32);

    fn cooldown_start(&self) -> Option<DateTime<Utc>>;

    fn set_cooldown_start(&mut self, at: Option<DateTime<Utc>>);
}

/// Supplier of quota and cooldown window, typically remote configuration.
pub trait LimitSource: Send + Sync {
    fn limit(&self, feature: Feature) -> u32;

    fn cooldown_duration(&self, feature: Feature) -> Duration;
}

/// Store key names for one feature's limit state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimitKeys {
    pub usage: String,
    pub cooldown_start: String,
    /// Remote override of the quota.
    pub limit: String,
    /// Remote override of the cooldown window, in seconds.
    pub cooldown_secs: String,
}

impl LimitKeys {
    /// Prefix shared by every limit key; wiping it clears all limit state.
    pub const PREFIX: &'static str = "limits.";

    pub fn for_feature(feature: Feature) -> Self {
        let id = feature.id();
        Self {
            usage: format!("limits.{id}.usage"),
            cooldown_start: format!("limits.{id}.cooldown_start_ms"),
            limit: format!("limits.{id}.limit"),
            cooldown_secs: format!("limits.{id}.cooldown_secs"),
        }
    }
}

/// Limits from the TOML config, overridden by values the remote
/// configuration collaborator writes into the store.
///
/// A missing or zero value falls through to the next layer and finally to
/// the feature's built-in default, so a feature is never unlimited.
pub struct ConfigLimits {
    config: SharedConfig,
    store: Arc<dyn StateStore>,
}

impl ConfigLimits {
    pub fn new(config: SharedConfig, store: Arc<dyn StateStore>) -> Self {
        Self { config, store }
    }

    fn configured(&self, feature: Feature) -> crate::storage::FeatureLimitConfig {
        let config = self.config.read().unwrap_or_else(|e| e.into_inner());
        config.limits.get(feature)
    }
}

impl LimitSource for ConfigLimits {
    fn limit(&self, feature: Feature) -> u32 {
        let keys = LimitKeys::for_feature(feature);
        let remote = match self.store.get_int(&keys.limit) {
            Ok(value) => value,
            Err(e) => {
                warn!(%feature, error = %e, "failed to read remote limit");
                None
            }
        };
        [remote, Some(self.configured(feature).limit)]
            .into_iter()
            .flatten()
            .find(|&limit| limit > 0)
            .unwrap_or_else(|| feature.default_limit())
    }

    fn cooldown_duration(&self, feature: Feature) -> Duration {
        let keys = LimitKeys::for_feature(feature);
        let remote = match self.store.get_i64(&keys.cooldown_secs) {
            Ok(value) => value.map(|secs| secs.max(0) as u64),
            Err(e) => {
                warn!(%feature, error = %e, "failed to read remote cooldown");
                None
            }
        };
        let secs = [remote, Some(self.configured(feature).cooldown_secs)]
            .into_iter()
            .flatten()
            .find(|&secs| secs > 0)
            .unwrap_or_else(|| feature.default_cooldown_secs());
        Duration::seconds(secs.min(MAX_WINDOW_SECS) as i64)
    }
}

/// Store-backed [`LimitPolicy`] parameterized by key names.
pub struct StoredLimit {
    feature: Feature,
    keys: LimitKeys,
    store: Arc<dyn StateStore>,
    source: Arc<dyn LimitSource>,
}

impl StoredLimit {
    pub fn new(feature: Feature, store: Arc<dyn StateStore>, source: Arc<dyn LimitSource>) -> Self {
        Self {
            feature,
            keys: LimitKeys::for_feature(feature),
            store,
            source,
        }
    }

    pub fn keys(&self) -> &LimitKeys {
        &self.keys
    }
}

impl LimitPolicy for StoredLimit {
    fn feature(&self) -> Feature {
        self.feature
    }

    fn current_usage(&self) -> u32 {
        match self.store.get_int(&self.keys.usage) {
            Ok(usage) => usage.unwrap_or(0),
            Err(e) => {
                warn!(feature = %self.feature, error = %e, "failed to read usage, assuming zero");
                0
            }
        }
    }

    fn limit(&self) -> u32 {
        self.source.limit(self.feature)
    }

    fn cooldown_duration(&self) -> Duration {
        self.source.cooldown_duration(self.feature)
    }

    fn set_usage(&mut self, usage: u32) {
        if let Err(e) = self.store.set_int(&self.keys.usage, usage) {
            warn!(feature = %self.feature, error = %e, "failed to persist usage");
        }
    }

    fn cooldown_start(&self) -> Option<DateTime<Utc>> {
        match self.store.get_i64(&self.keys.cooldown_start) {
            Ok(ms) => ms.and_then(from_epoch_ms),
            Err(e) => {
                warn!(
                    feature = %self.feature,
                    error = %e,
                    "failed to read cooldown start, assuming none"
                );
                None
            }
        }
    }

    fn set_cooldown_start(&mut self, at: Option<DateTime<Utc>>) {
        let result = match at {
            Some(at) => self.store.set_i64(&self.keys.cooldown_start, to_epoch_ms(at)),
            None => self.store.remove(&self.keys.cooldown_start),
        };
        if let Err(e) = result {
            warn!(feature = %self.feature, error = %e, "failed to persist cooldown start");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::storage::MemoryStore;

    fn setup() -> (Arc<MemoryStore>, SharedConfig) {
        (
            Arc::new(MemoryStore::new()),
            Arc::new(RwLock::new(Config::default())),
        )
    }

    fn stored(feature: Feature, store: &Arc<MemoryStore>, config: &SharedConfig) -> StoredLimit {
        let store: Arc<dyn StateStore> = store.clone();
        let source = Arc::new(ConfigLimits::new(config.clone(), store.clone()));
        StoredLimit::new(feature, store, source)
    }

    #[test]
    fn fresh_state_reads_as_zero() {
        let (store, config) = setup();
        let policy = stored(Feature::Search, &store, &config);
        assert_eq!(policy.current_usage(), 0);
        assert_eq!(policy.cooldown_start(), None);
        assert_eq!(policy.limit(), 20);
        assert_eq!(policy.cooldown_duration(), Duration::seconds(300));
    }

    #[test]
    fn clearing_cooldown_start_removes_the_key() {
        let (store, config) = setup();
        let mut policy = stored(Feature::Filter, &store, &config);
        let now = ManualClock::at_secs(1_700_000_000).now();
        policy.set_cooldown_start(Some(now));
        assert_eq!(policy.cooldown_start(), Some(now));
        policy.set_cooldown_start(None);
        assert_eq!(store.get_raw("limits.filter.cooldown_start_ms").unwrap(), None);
    }

    #[test]
    fn config_changes_are_seen_without_rebuilding() {
        let (store, config) = setup();
        let policy = stored(Feature::Refresh, &store, &config);
        assert_eq!(policy.limit(), 10);
        config.write().unwrap().limits.refresh.limit = 3;
        assert_eq!(policy.limit(), 3);
    }

    #[test]
    fn remote_override_beats_config_and_zero_falls_back() {
        let (store, config) = setup();
        let policy = stored(Feature::Message, &store, &config);
        store.set_int("limits.message.limit", 7).unwrap();
        assert_eq!(policy.limit(), 7);

        store.set_int("limits.message.limit", 0).unwrap();
        config.write().unwrap().limits.message.limit = 0;
        assert_eq!(policy.limit(), Feature::Message.default_limit());
    }

    #[test]
    fn oversized_cooldowns_are_clamped() {
        let (store, config) = setup();
        let policy = stored(Feature::Search, &store, &config);
        let ten_years = Duration::seconds(MAX_WINDOW_SECS as i64);

        store.set_i64("limits.search.cooldown_secs", i64::MAX).unwrap();
        assert_eq!(policy.cooldown_duration(), ten_years);

        store.remove("limits.search.cooldown_secs").unwrap();
        config.write().unwrap().limits.search.cooldown_secs = u64::MAX;
        assert_eq!(policy.cooldown_duration(), ten_years);
    }

    #[test]
    fn corrupt_usage_degrades_to_zero() {
        let (store, config) = setup();
        let policy = stored(Feature::Search, &store, &config);
        store.set_raw("limits.search.usage", "??").unwrap();
        assert_eq!(policy.current_usage(), 0);
    }
}
