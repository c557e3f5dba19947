//! Composition root: one engine per feature, explicitly constructed.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::decision::{Decision, LimitSnapshot, PopupOutcome};
use super::engine::LimitEngine;
use crate::clock::Clock;
use crate::feature::Feature;
use crate::policy::{
    BypassPolicy, ConfigLimits, FirstUseSource, LimitKeys, LimitSource, ShadowBanGate,
    SharedConfig, StoredLimit, StoredSession, TierSource,
};
use crate::storage::StateStore;

/// Collaborators every engine is built from.
#[derive(Clone)]
pub struct GateDeps {
    pub store: Arc<dyn StateStore>,
    pub config: SharedConfig,
    pub clock: Arc<dyn Clock>,
    pub limits: Arc<dyn LimitSource>,
    pub tier: Arc<dyn TierSource>,
    pub first_use: Arc<dyn FirstUseSource>,
}

impl GateDeps {
    /// Everything backed by the state store and config: limits from
    /// [`ConfigLimits`], tier and first use from [`StoredSession`].
    pub fn stored(store: Arc<dyn StateStore>, config: SharedConfig, clock: Arc<dyn Clock>) -> Self {
        let session = Arc::new(StoredSession::new(store.clone()));
        Self {
            limits: Arc::new(ConfigLimits::new(config.clone(), store.clone())),
            tier: session.clone(),
            first_use: session,
            store,
            config,
            clock,
        }
    }
}

/// Owns exactly one [`LimitEngine`] per registered feature.
pub struct LimitRegistry {
    engines: BTreeMap<Feature, LimitEngine>,
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
}

impl LimitRegistry {
    /// Registry without engines; add them with [`LimitRegistry::register`].
    pub fn empty(store: Arc<dyn StateStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            engines: BTreeMap::new(),
            store,
            clock,
        }
    }

    /// Registry with every feature wired to stored limits, the shared
    /// bypass policy, and the shadow-ban gate in front of conversations.
    pub fn from_deps(deps: &GateDeps) -> Self {
        let bypass = Arc::new(BypassPolicy::new(
            deps.tier.clone(),
            deps.first_use.clone(),
            deps.config.clone(),
        ));
        let mut registry = Self::empty(deps.store.clone(), deps.clock.clone());
        for feature in Feature::ALL {
            let policy = StoredLimit::new(feature, deps.store.clone(), deps.limits.clone());
            let mut engine = LimitEngine::new(
                Box::new(policy),
                bypass.clone(),
                deps.clock.clone(),
                deps.config.clone(),
            );
            if feature.is_moderated() {
                engine = engine.with_shadow_ban(ShadowBanGate::new(
                    deps.store.clone(),
                    deps.config.clone(),
                ));
            }
            registry.register(engine);
        }
        registry
    }

    /// Add an engine, replacing any previous one for the same feature.
    pub fn register(&mut self, engine: LimitEngine) -> Option<LimitEngine> {
        self.engines.insert(engine.feature(), engine)
    }

    pub fn features(&self) -> Vec<Feature> {
        self.engines.keys().copied().collect()
    }

    pub fn engine(&self, feature: Feature) -> Option<&LimitEngine> {
        self.engines.get(&feature)
    }

    pub fn engine_mut(&mut self, feature: Feature) -> Option<&mut LimitEngine> {
        self.engines.get_mut(&feature)
    }

    pub fn engines_mut(&mut self) -> impl Iterator<Item = &mut LimitEngine> {
        self.engines.values_mut()
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// The gate in front of whichever engine is moderated.
    pub fn shadow_ban(&self) -> Option<&ShadowBanGate> {
        self.engines.values().find_map(LimitEngine::shadow_ban)
    }

    /// Check a feature. Unregistered features are always allowed; there is
    /// nothing to enforce against.
    pub fn check(&mut self, feature: Feature) -> Decision {
        match self.engines.get_mut(&feature) {
            Some(engine) => engine.check(),
            None => unregistered(feature),
        }
    }

    pub fn try_consume(&mut self, feature: Feature) -> Decision {
        match self.engines.get_mut(&feature) {
            Some(engine) => engine.try_consume(),
            None => unregistered(feature),
        }
    }

    pub fn check_conversation_limit(&mut self) -> Decision {
        self.check(Feature::Conversation)
    }

    pub fn check_refresh_limit(&mut self) -> Decision {
        self.check(Feature::Refresh)
    }

    pub fn check_filter_limit(&mut self) -> Decision {
        self.check(Feature::Filter)
    }

    pub fn check_search_limit(&mut self) -> Decision {
        self.check(Feature::Search)
    }

    pub fn check_message_limit(&mut self) -> Decision {
        self.check(Feature::Message)
    }

    pub fn increment_usage(&mut self, feature: Feature) {
        if let Some(engine) = self.engines.get_mut(&feature) {
            engine.increment_usage();
        }
    }

    pub fn start_cooldown_on_popup_open(&mut self, feature: Feature) -> PopupOutcome {
        match self.engines.get_mut(&feature) {
            Some(engine) => engine.start_cooldown_on_popup_open(),
            None => PopupOutcome::NotNeeded,
        }
    }

    pub fn reset_cooldown(&mut self, feature: Feature) {
        if let Some(engine) = self.engines.get_mut(&feature) {
            engine.reset_cooldown();
        }
    }

    pub fn snapshots(&self) -> Vec<LimitSnapshot> {
        self.engines.values().map(LimitEngine::snapshot).collect()
    }

    /// Drop every feature's persisted limit state, as a session wipe does.
    pub fn wipe(&mut self) -> crate::Result<usize> {
        Ok(self.store.clear_prefix(LimitKeys::PREFIX)?)
    }
}

fn unregistered(feature: Feature) -> Decision {
    Decision {
        feature,
        can_proceed: true,
        show_popup: false,
        remaining_cooldown_ms: 0,
        current_usage: 0,
        limit: 0,
    }
}
