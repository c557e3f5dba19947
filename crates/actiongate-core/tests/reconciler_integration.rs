//! Integration tests for background reconciliation.
//!
//! The sweep and the precise timers race for the same expiry; whichever
//! runs first must win and the other must observe nothing to do.

use std::sync::{Arc, RwLock};

use chrono::Duration;

use actiongate_core::reconciler::RecordingHost;
use actiongate_core::{
    BackgroundReconciler, BroadcastBus, Clock, Config, EventLog, Feature, GateDeps, LimitEvent,
    LimitRegistry, ManualClock, MemoryStore, ReconcilerPhase, ShadowBanGate, SharedConfig,
    StateStore,
};

struct Harness {
    clock: ManualClock,
    store: Arc<dyn StateStore>,
    config: SharedConfig,
    registry: LimitRegistry,
    log: Arc<EventLog>,
    reconciler: BackgroundReconciler,
}

fn harness() -> Harness {
    let mut config = Config::default();
    config.limits.search.limit = 1;
    config.limits.search.cooldown_secs = 60;
    config.limits.message.limit = 1;
    config.limits.message.cooldown_secs = 120;

    let clock = ManualClock::at_secs(1_700_000_000);
    let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
    let config: SharedConfig = Arc::new(RwLock::new(config));
    let registry = LimitRegistry::from_deps(&GateDeps::stored(
        store.clone(),
        config.clone(),
        Arc::new(clock.clone()),
    ));
    let log = Arc::new(EventLog::new());
    Harness {
        reconciler: BackgroundReconciler::new(log.clone()),
        clock,
        store,
        config,
        registry,
        log,
    }
}

impl Harness {
    fn exhaust(&mut self, feature: Feature) {
        self.registry.try_consume(feature);
        self.registry.start_cooldown_on_popup_open(feature);
    }

    fn expired_events(&self) -> Vec<Feature> {
        self.log
            .snapshot()
            .into_iter()
            .filter_map(|event| match event {
                LimitEvent::FeatureExpired { feature, .. } => Some(feature),
                _ => None,
            })
            .collect()
    }
}

#[test]
fn test_sweep_then_timer_converges() {
    let mut h = harness();
    h.exhaust(Feature::Search);
    let now = h.clock.now();
    h.reconciler.start_monitoring(&mut h.registry, now);
    h.reconciler.schedule_precise_timers(&mut h.registry, now);

    h.clock.advance(Duration::seconds(60));
    let now = h.clock.now();
    assert_eq!(h.reconciler.sweep(&mut h.registry, now), vec![Feature::Search]);
    assert!(h.reconciler.fire_due_timers(&mut h.registry, now).is_empty());

    assert_eq!(h.expired_events(), vec![Feature::Search]);
    assert_eq!(h.log.snapshot().len(), 2);
}

#[test]
fn test_timer_then_sweep_converges() {
    let mut h = harness();
    h.exhaust(Feature::Search);
    let now = h.clock.now();
    h.reconciler.start_monitoring(&mut h.registry, now);
    h.reconciler.schedule_precise_timers(&mut h.registry, now);

    h.clock.advance(Duration::seconds(60));
    let now = h.clock.now();
    assert_eq!(
        h.reconciler.fire_due_timers(&mut h.registry, now),
        vec![Feature::Search]
    );
    assert!(h.reconciler.sweep(&mut h.registry, now).is_empty());

    assert_eq!(h.expired_events(), vec![Feature::Search]);
}

#[test]
fn test_foreground_check_before_reconciler() {
    let mut h = harness();
    h.exhaust(Feature::Search);
    let now = h.clock.now();
    h.reconciler.start_monitoring(&mut h.registry, now);

    // The decision path resets first; the sweep then has nothing to do
    h.clock.advance(Duration::seconds(61));
    assert!(h.registry.check_search_limit().can_proceed);
    let now = h.clock.now();
    assert!(h.reconciler.sweep(&mut h.registry, now).is_empty());
    assert!(h.log.snapshot().is_empty());
}

#[test]
fn test_each_feature_expires_on_its_own_schedule() {
    let mut h = harness();
    h.exhaust(Feature::Search);
    h.exhaust(Feature::Message);
    let start = h.clock.now();
    h.reconciler.start_monitoring(&mut h.registry, start);
    assert_eq!(h.reconciler.pending_timers(), 2);
    assert_eq!(
        h.reconciler.next_deadline(),
        Some(start + Duration::seconds(60))
    );

    h.clock.set(start + Duration::seconds(60));
    let now = h.clock.now();
    h.reconciler.fire_due_timers(&mut h.registry, now);
    assert_eq!(
        h.reconciler.next_deadline(),
        Some(start + Duration::seconds(120))
    );

    h.clock.set(start + Duration::seconds(120));
    let now = h.clock.now();
    h.reconciler.fire_due_timers(&mut h.registry, now);
    assert_eq!(h.expired_events(), vec![Feature::Search, Feature::Message]);
    assert_eq!(h.reconciler.pending_timers(), 0);
}

#[test]
fn test_aggregate_event_follows_feature_event() {
    let mut h = harness();
    h.exhaust(Feature::Message);
    h.clock.advance(Duration::seconds(120));
    let now = h.clock.now();
    h.reconciler.sweep(&mut h.registry, now);

    assert_eq!(
        h.log.drain(),
        vec![
            LimitEvent::FeatureExpired {
                feature: Feature::Message,
                at: now
            },
            LimitEvent::AnyFeatureExpired {
                feature: Feature::Message,
                at: now
            },
        ]
    );
}

#[test]
fn test_sweep_clears_expired_shadow_ban() {
    let mut h = harness();
    let start = h.clock.now();
    ShadowBanGate::new(h.store.clone(), h.config.clone())
        .impose(start, Duration::seconds(900))
        .unwrap();

    h.clock.set(start + Duration::seconds(899));
    let now = h.clock.now();
    h.reconciler.sweep(&mut h.registry, now);
    assert!(h.log.snapshot().is_empty());

    h.clock.set(start + Duration::seconds(900));
    let now = h.clock.now();
    h.reconciler.sweep(&mut h.registry, now);
    assert_eq!(h.log.drain(), vec![LimitEvent::ShadowBanCleared { at: now }]);
    assert!(!h.registry.shadow_ban().unwrap().state().active);
}

#[test]
fn test_background_round_trip_releases_budget() {
    let mut h = harness();
    let host = RecordingHost::new();
    h.exhaust(Feature::Search);
    let now = h.clock.now();
    h.reconciler.start_monitoring(&mut h.registry, now);

    h.reconciler.on_enter_background(&mut h.registry, &host, now);
    assert_eq!(h.reconciler.phase(), ReconcilerPhase::Backgrounded);
    assert!(h.reconciler.is_sweeping());
    assert_eq!(host.open_budgets().len(), 1);

    // Suspended well past the deadline; nothing fired in the meantime
    h.clock.advance(Duration::minutes(30));
    let now = h.clock.now();
    h.reconciler.on_enter_foreground(&mut h.registry, &host, now);
    assert_eq!(h.reconciler.phase(), ReconcilerPhase::Monitoring);
    assert!(host.open_budgets().is_empty());
    assert_eq!(h.expired_events(), vec![Feature::Search]);
    assert_eq!(h.reconciler.pending_timers(), 0);
}

#[test]
fn test_terminated_reconciler_ignores_lifecycle() {
    let mut h = harness();
    let host = RecordingHost::new();
    let now = h.clock.now();
    h.reconciler.start_monitoring(&mut h.registry, now);
    h.reconciler.on_terminate(&host);

    h.reconciler.on_enter_background(&mut h.registry, &host, now);
    h.reconciler.on_enter_foreground(&mut h.registry, &host, now);
    assert_eq!(h.reconciler.phase(), ReconcilerPhase::Terminated);
    assert!(host.open_budgets().is_empty());
}

#[tokio::test]
async fn test_events_reach_bus_subscribers() {
    let mut h = harness();
    let bus = BroadcastBus::default();
    let mut rx = bus.subscribe();
    let mut reconciler = BackgroundReconciler::new(Arc::new(bus));

    h.exhaust(Feature::Search);
    h.clock.advance(Duration::seconds(60));
    let now = h.clock.now();
    reconciler.sweep(&mut h.registry, now);

    let first = rx.recv().await.unwrap();
    let second = rx.recv().await.unwrap();
    assert_eq!(first.feature(), Some(Feature::Search));
    assert!(matches!(second, LimitEvent::AnyFeatureExpired { .. }));
}
