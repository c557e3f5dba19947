//! End-to-end quota and moderation scenarios.
//!
//! These tests drive a fully wired registry with a manual clock and check
//! the decisions a caller would see over time.

use std::sync::{Arc, RwLock};

use chrono::Duration;

use actiongate_core::policy::StoredSession;
use actiongate_core::{
    Clock, Config, Feature, GateDeps, LimitRegistry, ManualClock, MemoryStore, PopupOutcome,
    ShadowBanGate, SharedConfig, SqliteStore, StateStore,
};

const T0: i64 = 1_700_000_000;

fn wire(
    store: Arc<dyn StateStore>,
    config: Config,
    clock: &ManualClock,
) -> (LimitRegistry, SharedConfig) {
    let config: SharedConfig = Arc::new(RwLock::new(config));
    let registry = LimitRegistry::from_deps(&GateDeps::stored(
        store,
        config.clone(),
        Arc::new(clock.clone()),
    ));
    (registry, config)
}

fn search_limited(limit: u32, cooldown_secs: u64) -> Config {
    let mut config = Config::default();
    config.limits.search.limit = limit;
    config.limits.search.cooldown_secs = cooldown_secs;
    config
}

#[test]
fn test_quota_cooldown_and_recovery() {
    let clock = ManualClock::at_secs(T0);
    let (mut registry, _) = wire(Arc::new(MemoryStore::new()), search_limited(2, 60), &clock);
    let start = clock.now();

    // Two uses bring usage to the limit
    registry.increment_usage(Feature::Search);
    registry.increment_usage(Feature::Search);

    // Exhausted, but the clock has not started yet
    let decision = registry.check_search_limit();
    assert!(!decision.can_proceed);
    assert!(decision.show_popup);
    assert_eq!(decision.remaining_cooldown_ms, 0);

    // Showing the popup starts the full window
    assert_eq!(
        registry.start_cooldown_on_popup_open(Feature::Search),
        PopupOutcome::Started {
            ends_at: start + Duration::seconds(60)
        }
    );

    // Just short of the tolerance: still blocked with about a second left
    clock.set(start + Duration::milliseconds(58_900));
    let decision = registry.check_search_limit();
    assert!(!decision.can_proceed);
    assert_eq!(decision.remaining_cooldown_ms, 1_100);
    assert_eq!(decision.current_usage, 2);

    // At 59s exactly one second is left, which is within the tolerance
    clock.set(start + Duration::seconds(59));
    let decision = registry.check_search_limit();
    assert!(decision.can_proceed);
    assert_eq!(decision.current_usage, 0);
    assert_eq!(decision.remaining_cooldown_ms, 0);

    // Past the window: still allowed with usage reset
    clock.set(start + Duration::seconds(61));
    let decision = registry.check_search_limit();
    assert!(decision.can_proceed);
    assert_eq!(decision.current_usage, 0);
    let snapshot = registry.engine(Feature::Search).unwrap().snapshot();
    assert!(snapshot.cooldown_start.is_none());
}

#[test]
fn test_shadow_ban_blocks_conversation_until_expiry() {
    let clock = ManualClock::at_secs(T0);
    let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
    let (mut registry, config) = wire(store.clone(), Config::default(), &clock);
    let start = clock.now();

    ShadowBanGate::new(store, config)
        .impose(start, Duration::seconds(900))
        .unwrap();

    // Blocked on every check until the ban runs out, without consuming quota
    for secs in [0, 1, 300, 899] {
        clock.set(start + Duration::seconds(secs));
        let decision = registry.check_conversation_limit();
        assert!(!decision.can_proceed, "allowed at t={secs}");
        assert!(decision.show_popup);
        assert_eq!(decision.current_usage, 0);
    }

    // Other features are unaffected
    assert!(registry.check_search_limit().can_proceed);

    // At t=900 the next check clears the ban and quota logic resumes
    clock.set(start + Duration::seconds(900));
    let decision = registry.check_conversation_limit();
    assert!(decision.can_proceed);
    assert!(!registry.shadow_ban().unwrap().state().active);

    let decision = registry.try_consume(Feature::Conversation);
    assert!(decision.can_proceed);
    assert_eq!(decision.current_usage, 1);
}

#[test]
fn test_new_user_grace_expires() {
    let clock = ManualClock::at_secs(T0);
    let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
    let mut config = search_limited(1, 60);
    config.bypass.grace_period_secs = 3600;
    let (mut registry, _) = wire(store.clone(), config, &clock);

    StoredSession::new(store).set_first_use(clock.now()).unwrap();

    // Inside the grace period quota is not enforced
    for _ in 0..5 {
        let decision = registry.try_consume(Feature::Search);
        assert!(decision.can_proceed);
        assert!(!decision.show_popup);
    }

    // Afterwards the counted usage applies
    clock.advance(Duration::seconds(3601));
    let decision = registry.check_search_limit();
    assert!(!decision.can_proceed);
    assert!(decision.show_popup);
}

#[test]
fn test_exempt_tier_never_consumes_cooldown() {
    let clock = ManualClock::at_secs(T0);
    let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
    let (mut registry, _) = wire(store.clone(), search_limited(1, 60), &clock);

    StoredSession::new(store).set_exempt_tier(true).unwrap();

    for _ in 0..3 {
        assert!(registry.check_search_limit().can_proceed);
        registry.increment_usage(Feature::Search);
    }
    let snapshot = registry.engine(Feature::Search).unwrap().snapshot();
    assert!(snapshot.cooldown_start.is_none());
}

#[test]
fn test_cooldown_survives_restart() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("actiongate.db");
    let clock = ManualClock::at_secs(T0);
    let start = clock.now();

    {
        let store: Arc<dyn StateStore> = Arc::new(SqliteStore::open_at(&path).unwrap());
        let (mut registry, _) = wire(store, search_limited(1, 60), &clock);
        registry.try_consume(Feature::Search);
        registry.start_cooldown_on_popup_open(Feature::Search);
    }

    // A fresh process sees the same cooldown, measured from wall-clock time
    clock.set(start + Duration::seconds(30));
    let store: Arc<dyn StateStore> = Arc::new(SqliteStore::open_at(&path).unwrap());
    let (mut registry, _) = wire(store, search_limited(1, 60), &clock);
    let decision = registry.check_search_limit();
    assert!(!decision.can_proceed);
    assert_eq!(decision.remaining_cooldown_ms, 30_000);

    clock.set(start + Duration::seconds(60));
    assert!(registry.check_search_limit().can_proceed);
}

#[test]
fn test_always_show_features_surface_popup_when_allowed() {
    let clock = ManualClock::at_secs(T0);
    let (mut registry, _) = wire(Arc::new(MemoryStore::new()), Config::default(), &clock);

    for feature in [Feature::Conversation, Feature::Refresh, Feature::Filter] {
        let decision = registry.check(feature);
        assert!(decision.can_proceed, "{feature} blocked");
        assert!(decision.show_popup, "{feature} hid its popup");
    }
    for feature in [Feature::Search, Feature::Message] {
        let decision = registry.check(feature);
        assert!(decision.can_proceed);
        assert!(!decision.show_popup, "{feature} showed its popup early");
    }
}
