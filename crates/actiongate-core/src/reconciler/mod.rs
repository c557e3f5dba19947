//! Background reconciliation of expired cooldowns.
//!
//! Two mechanisms detect expiry and both call [`BackgroundReconciler::reconcile`]:
//!
//! - **Sweep**: on a fixed interval, every registered feature is recomputed
//!   from wall-clock deltas.
//! - **Precise timers**: one deadline per feature in cooldown, at the
//!   predicted expiry instant, so detection usually beats the sweep.
//!
//! Whichever runs first performs the auto-reset and publishes; the other
//! finds no cooldown recorded and does nothing.
//!
//! ## Phases
//!
//! ```text
//! Idle -> Monitoring <-> Backgrounded
//!             \              /
//!              -> Terminated <-
//! ```
//!
//! The host may suspend the process while backgrounded, so coming back to
//! the foreground always sweeps before anything else.

mod deadline;
mod host;

pub use deadline::{DeadlineQueue, TimerHandle};
pub use host::{BudgetToken, ExecutionHost, NoopHost, RecordingHost};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::events::{EventSink, LimitEvent};
use crate::feature::Feature;
use crate::gate::LimitRegistry;
use crate::policy::GateVerdict;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconcilerPhase {
    Idle,
    Monitoring,
    Backgrounded,
    Terminated,
}

/// A pending precise timer for one feature.
#[derive(Debug, Clone, Copy)]
struct PreciseTimer {
    handle: TimerHandle,
    deadline: DateTime<Utc>,
}

pub struct BackgroundReconciler {
    phase: ReconcilerPhase,
    timers: DeadlineQueue<Feature>,
    pending: HashMap<Feature, PreciseTimer>,
    sink: Arc<dyn EventSink>,
    budget: Option<BudgetToken>,
}

impl BackgroundReconciler {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self {
            phase: ReconcilerPhase::Idle,
            timers: DeadlineQueue::new(),
            pending: HashMap::new(),
            sink,
            budget: None,
        }
    }

    // ── Queries ──────────────────────────────────────────────────────

    pub fn phase(&self) -> ReconcilerPhase {
        self.phase
    }

    /// Whether the periodic sweep should be running.
    pub fn is_sweeping(&self) -> bool {
        matches!(
            self.phase,
            ReconcilerPhase::Monitoring | ReconcilerPhase::Backgrounded
        )
    }

    /// Earliest pending precise deadline.
    pub fn next_deadline(&mut self) -> Option<DateTime<Utc>> {
        self.timers.next_deadline()
    }

    pub fn pending_timers(&self) -> usize {
        self.pending.len()
    }

    pub fn has_budget(&self) -> bool {
        self.budget.is_some()
    }

    // ── Reconciliation ───────────────────────────────────────────────

    /// Auto-reset `feature` if its cooldown is within tolerance of expiring
    /// and publish the expiry. Returns whether this call did the reset.
    pub fn reconcile(
        &mut self,
        registry: &mut LimitRegistry,
        feature: Feature,
        now: DateTime<Utc>,
    ) -> bool {
        let Some(engine) = registry.engine_mut(feature) else {
            return false;
        };
        if !engine.expire_if_due(now) {
            return false;
        }

        if let Some(timer) = self.pending.remove(&feature) {
            self.timers.cancel(timer.handle);
        }
        self.sink.publish(LimitEvent::FeatureExpired { feature, at: now });
        self.sink
            .publish(LimitEvent::AnyFeatureExpired { feature, at: now });
        true
    }

    /// Reconcile every registered feature and the shadow ban. Returns the
    /// features that were reset.
    pub fn sweep(&mut self, registry: &mut LimitRegistry, now: DateTime<Utc>) -> Vec<Feature> {
        if self.phase == ReconcilerPhase::Terminated {
            return Vec::new();
        }

        let expired: Vec<Feature> = registry
            .features()
            .into_iter()
            .filter(|&feature| self.reconcile(registry, feature, now))
            .collect();

        if let Some(gate) = registry.shadow_ban() {
            if gate.evaluate(now) == GateVerdict::Cleared {
                self.sink.publish(LimitEvent::ShadowBanCleared { at: now });
            }
        }

        if !expired.is_empty() {
            debug!(?expired, "sweep reset expired cooldowns");
        }
        expired
    }

    /// Keep exactly one precise timer per feature in cooldown, at its
    /// current predicted expiry. Features already due are reconciled now.
    pub fn schedule_precise_timers(&mut self, registry: &mut LimitRegistry, now: DateTime<Utc>) {
        if self.phase == ReconcilerPhase::Terminated {
            return;
        }

        for feature in registry.features() {
            let deadline = registry
                .engine(feature)
                .and_then(|engine| engine.cooldown_deadline());

            let Some(deadline) = deadline else {
                if let Some(timer) = self.pending.remove(&feature) {
                    self.timers.cancel(timer.handle);
                }
                continue;
            };

            if self.reconcile(registry, feature, now) {
                continue;
            }

            let armed = self.pending.get(&feature).map(|timer| timer.deadline);
            if armed != Some(deadline) {
                self.arm(feature, deadline);
            }
        }
    }

    /// Fire every precise timer due at `now`. Each runs the same check as
    /// the sweep rather than resetting blindly, since the sweep may have
    /// already reset the feature. Returns the features that were reset.
    pub fn fire_due_timers(
        &mut self,
        registry: &mut LimitRegistry,
        now: DateTime<Utc>,
    ) -> Vec<Feature> {
        let mut expired = Vec::new();
        for (handle, feature) in self.timers.pop_due(now) {
            if self.pending.get(&feature).map(|t| t.handle) == Some(handle) {
                self.pending.remove(&feature);
            }
            if self.reconcile(registry, feature, now) {
                expired.push(feature);
                continue;
            }
            // The window may have been lengthened since the timer was armed.
            let still_running = registry
                .engine(feature)
                .and_then(|engine| engine.cooldown_deadline());
            if let Some(deadline) = still_running {
                if !self.pending.contains_key(&feature) {
                    self.arm(feature, deadline.max(now));
                }
            }
        }
        expired
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Begin monitoring: sweep once and arm precise timers.
    pub fn start_monitoring(&mut self, registry: &mut LimitRegistry, now: DateTime<Utc>) {
        if self.phase != ReconcilerPhase::Idle {
            return;
        }
        self.phase = ReconcilerPhase::Monitoring;
        info!("reconciler monitoring started");
        self.sweep(registry, now);
        self.schedule_precise_timers(registry, now);
    }

    /// The app moved to the background: ask the host for execution time
    /// and sweep once while we still can.
    pub fn on_enter_background(
        &mut self,
        registry: &mut LimitRegistry,
        host: &dyn ExecutionHost,
        now: DateTime<Utc>,
    ) {
        if self.phase == ReconcilerPhase::Terminated {
            return;
        }
        if self.budget.is_none() {
            self.budget = host.begin_background_budget();
        }
        self.phase = ReconcilerPhase::Backgrounded;
        info!(budget = self.budget.is_some(), "entered background");
        self.sweep(registry, now);
    }

    /// The app returned to the foreground: timers may not have fired while
    /// suspended, so recompute from wall-clock time, then re-arm timers.
    pub fn on_enter_foreground(
        &mut self,
        registry: &mut LimitRegistry,
        host: &dyn ExecutionHost,
        now: DateTime<Utc>,
    ) {
        if self.phase == ReconcilerPhase::Terminated {
            return;
        }
        self.release_budget(host);
        self.phase = ReconcilerPhase::Monitoring;
        info!("entered foreground");
        self.sweep(registry, now);
        self.schedule_precise_timers(registry, now);
    }

    /// Cancel the sweep and every precise timer and release any budget.
    pub fn on_terminate(&mut self, host: &dyn ExecutionHost) {
        if self.phase == ReconcilerPhase::Terminated {
            return;
        }
        self.timers.clear();
        self.pending.clear();
        self.release_budget(host);
        self.phase = ReconcilerPhase::Terminated;
        info!("reconciler terminated");
    }

    // ── Internal ─────────────────────────────────────────────────────

    fn arm(&mut self, feature: Feature, deadline: DateTime<Utc>) {
        if let Some(previous) = self.pending.remove(&feature) {
            self.timers.cancel(previous.handle);
        }
        let handle = self.timers.schedule(deadline, feature);
        self.pending.insert(feature, PreciseTimer { handle, deadline });
        debug!(%feature, %deadline, "precise timer armed");
    }

    fn release_budget(&mut self, host: &dyn ExecutionHost) {
        if let Some(token) = self.budget.take() {
            host.end_background_budget(token);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::events::EventLog;
    use crate::gate::GateDeps;
    use crate::policy::SharedConfig;
    use crate::storage::{Config, MemoryStore, StateStore};
    use chrono::Duration;
    use std::sync::RwLock;

    struct Fixture {
        clock: ManualClock,
        config: SharedConfig,
        registry: LimitRegistry,
        log: Arc<EventLog>,
        reconciler: BackgroundReconciler,
    }

    fn fixture() -> Fixture {
        let mut config = Config::default();
        config.limits.search.limit = 1;
        config.limits.search.cooldown_secs = 60;
        let clock = ManualClock::at_secs(1_700_000_000);
        let config: SharedConfig = Arc::new(RwLock::new(config));
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        let registry = LimitRegistry::from_deps(&GateDeps::stored(
            store,
            config.clone(),
            Arc::new(clock.clone()),
        ));
        let log = Arc::new(EventLog::new());
        Fixture {
            clock,
            config,
            registry,
            reconciler: BackgroundReconciler::new(log.clone()),
            log,
        }
    }

    fn exhaust_search(fx: &mut Fixture) {
        fx.registry.try_consume(Feature::Search);
        fx.registry.start_cooldown_on_popup_open(Feature::Search);
    }

    #[test]
    fn sweep_resets_and_publishes_both_events() {
        let mut fx = fixture();
        exhaust_search(&mut fx);
        fx.clock.advance(Duration::seconds(59));

        let now = fx.clock.now();
        assert_eq!(fx.reconciler.sweep(&mut fx.registry, now), vec![Feature::Search]);
        assert_eq!(
            fx.log.drain(),
            vec![
                LimitEvent::FeatureExpired {
                    feature: Feature::Search,
                    at: now
                },
                LimitEvent::AnyFeatureExpired {
                    feature: Feature::Search,
                    at: now
                },
            ]
        );
    }

    #[test]
    fn sweep_leaves_running_cooldowns() {
        let mut fx = fixture();
        exhaust_search(&mut fx);
        fx.clock.advance(Duration::seconds(30));
        let now = fx.clock.now();
        assert!(fx.reconciler.sweep(&mut fx.registry, now).is_empty());
        assert!(fx.log.snapshot().is_empty());
    }

    #[test]
    fn one_timer_per_feature() {
        let mut fx = fixture();
        exhaust_search(&mut fx);
        let now = fx.clock.now();
        fx.reconciler.schedule_precise_timers(&mut fx.registry, now);
        fx.reconciler.schedule_precise_timers(&mut fx.registry, now);
        assert_eq!(fx.reconciler.pending_timers(), 1);
        assert_eq!(
            fx.reconciler.next_deadline(),
            Some(now + Duration::seconds(60))
        );
    }

    #[test]
    fn timer_rearms_when_window_grows() {
        let mut fx = fixture();
        exhaust_search(&mut fx);
        let start = fx.clock.now();
        fx.reconciler.schedule_precise_timers(&mut fx.registry, start);

        fx.config.write().unwrap().limits.search.cooldown_secs = 120;
        fx.clock.advance(Duration::seconds(60));
        let now = fx.clock.now();
        assert!(fx.reconciler.fire_due_timers(&mut fx.registry, now).is_empty());
        assert_eq!(fx.reconciler.pending_timers(), 1);
        assert_eq!(
            fx.reconciler.next_deadline(),
            Some(start + Duration::seconds(120))
        );

        fx.clock.advance(Duration::seconds(60));
        let later = fx.clock.now();
        assert_eq!(
            fx.reconciler.fire_due_timers(&mut fx.registry, later),
            vec![Feature::Search]
        );
        assert_eq!(fx.log.snapshot().len(), 2);
    }

    #[test]
    fn timer_after_sweep_is_a_no_op() {
        let mut fx = fixture();
        exhaust_search(&mut fx);
        let start = fx.clock.now();
        fx.reconciler.schedule_precise_timers(&mut fx.registry, start);
        fx.clock.advance(Duration::seconds(60));
        let now = fx.clock.now();

        assert_eq!(fx.reconciler.sweep(&mut fx.registry, now), vec![Feature::Search]);
        assert!(fx.reconciler.fire_due_timers(&mut fx.registry, now).is_empty());
        assert_eq!(fx.log.snapshot().len(), 2);
    }

    #[test]
    fn foreground_sweeps_after_suspension() {
        let mut fx = fixture();
        let host = RecordingHost::new();
        let now = fx.clock.now();
        fx.reconciler.start_monitoring(&mut fx.registry, now);
        exhaust_search(&mut fx);
        fx.reconciler.on_enter_background(&mut fx.registry, &host, now);
        assert!(fx.reconciler.has_budget());

        fx.clock.advance(Duration::minutes(10));
        let later = fx.clock.now();
        fx.reconciler.on_enter_foreground(&mut fx.registry, &host, later);
        assert_eq!(fx.reconciler.phase(), ReconcilerPhase::Monitoring);
        assert!(!fx.reconciler.has_budget());
        assert!(host.open_budgets().is_empty());
        assert_eq!(fx.registry.snapshots().iter().map(|s| s.usage).sum::<u32>(), 0);
        assert_eq!(fx.log.snapshot().len(), 2);
    }

    #[test]
    fn terminate_cancels_everything_and_releases_budget() {
        let mut fx = fixture();
        let host = RecordingHost::new();
        let now = fx.clock.now();
        fx.reconciler.start_monitoring(&mut fx.registry, now);
        exhaust_search(&mut fx);
        fx.reconciler.schedule_precise_timers(&mut fx.registry, now);
        fx.reconciler.on_enter_background(&mut fx.registry, &host, now);
        assert_eq!(host.open_budgets().len(), 1);

        fx.reconciler.on_terminate(&host);
        assert_eq!(fx.reconciler.phase(), ReconcilerPhase::Terminated);
        assert!(!fx.reconciler.is_sweeping());
        assert_eq!(fx.reconciler.pending_timers(), 0);
        assert_eq!(fx.reconciler.next_deadline(), None);
        assert!(host.open_budgets().is_empty());

        fx.clock.advance(Duration::seconds(120));
        let later = fx.clock.now();
        assert!(fx.reconciler.sweep(&mut fx.registry, later).is_empty());
    }
}
