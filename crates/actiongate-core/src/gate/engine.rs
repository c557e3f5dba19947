//! Limit engine: quota and cooldown decisions for one feature.
//!
//! The engine is a wall-clock state machine over persisted state:
//!
//! ```text
//! Available --(usage reaches limit)--> Exhausted
//! Exhausted --(popup opened)---------> CoolingDown
//! CoolingDown --(remaining <= tolerance)--> Available   (auto-reset)
//! ```
//!
//! Exhausted does not start the clock on its own. The cooldown begins when
//! the blocking popup is actually surfaced, so the user always sees the full
//! window. Auto-reset is idempotent; the decision path and the reconciler
//! both funnel into [`LimitEngine::expire_if_due`].

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{debug, info};

use super::decision::{duration_ms, Decision, LimitSnapshot, PopupOutcome};
use crate::clock::Clock;
use crate::feature::{Feature, PopupPolicy};
use crate::policy::{BypassPolicy, GateVerdict, LimitPolicy, ShadowBanGate, SharedConfig};

pub struct LimitEngine {
    policy: Box<dyn LimitPolicy>,
    bypass: Arc<BypassPolicy>,
    shadow_ban: Option<ShadowBanGate>,
    clock: Arc<dyn Clock>,
    config: SharedConfig,
}

impl LimitEngine {
    pub fn new(
        policy: Box<dyn LimitPolicy>,
        bypass: Arc<BypassPolicy>,
        clock: Arc<dyn Clock>,
        config: SharedConfig,
    ) -> Self {
        Self {
            policy,
            bypass,
            shadow_ban: None,
            clock,
            config,
        }
    }

    /// Put a moderation override in front of every check.
    pub fn with_shadow_ban(mut self, gate: ShadowBanGate) -> Self {
        self.shadow_ban = Some(gate);
        self
    }

    // ── Queries ──────────────────────────────────────────────────────

    pub fn feature(&self) -> Feature {
        self.policy.feature()
    }

    pub fn policy(&self) -> &dyn LimitPolicy {
        self.policy.as_ref()
    }

    pub fn shadow_ban(&self) -> Option<&ShadowBanGate> {
        self.shadow_ban.as_ref()
    }

    pub fn tolerance(&self) -> Duration {
        self.config
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .reconciler
            .tolerance()
    }

    pub fn is_in_cooldown(&self) -> bool {
        self.is_in_cooldown_at(self.clock.now())
    }

    pub fn is_in_cooldown_at(&self, now: DateTime<Utc>) -> bool {
        match self.policy.cooldown_start() {
            Some(start) => now - start < self.policy.cooldown_duration(),
            None => false,
        }
    }

    pub fn remaining_cooldown(&self) -> Duration {
        self.remaining_cooldown_at(self.clock.now())
    }

    /// `max(0, duration - elapsed)`, or zero without a recorded cooldown.
    /// A clock that moved backwards never yields more than the full window.
    pub fn remaining_cooldown_at(&self, now: DateTime<Utc>) -> Duration {
        match self.policy.cooldown_start() {
            Some(start) => {
                let elapsed = (now - start).max(Duration::zero());
                (self.policy.cooldown_duration() - elapsed).max(Duration::zero())
            }
            None => Duration::zero(),
        }
    }

    /// Instant the recorded cooldown ends, if one is recorded.
    pub fn cooldown_deadline(&self) -> Option<DateTime<Utc>> {
        self.policy
            .cooldown_start()
            .and_then(|start| start.checked_add_signed(self.policy.cooldown_duration()))
    }

    pub fn snapshot(&self) -> LimitSnapshot {
        let now = self.clock.now();
        LimitSnapshot {
            feature: self.feature(),
            usage: self.policy.current_usage(),
            limit: self.policy.limit(),
            cooldown_secs: self.policy.cooldown_duration().num_seconds(),
            cooldown_start: self.policy.cooldown_start(),
            in_cooldown: self.is_in_cooldown_at(now),
            remaining_cooldown_ms: duration_ms(self.remaining_cooldown_at(now)),
        }
    }

    // ── Commands ─────────────────────────────────────────────────────

    pub fn can_perform_action(&mut self) -> bool {
        let now = self.clock.now();
        if self.bypass.is_exempt(now) {
            return true;
        }
        self.quota_allows(now)
    }

    pub fn increment_usage(&mut self) {
        let usage = self.policy.current_usage().saturating_add(1);
        self.policy.set_usage(usage);
        debug!(feature = %self.feature(), usage, "usage incremented");
    }

    /// Clear usage and the cooldown start. Idempotent.
    pub fn reset_cooldown(&mut self) {
        self.policy.set_usage(0);
        self.policy.set_cooldown_start(None);
    }

    pub fn start_cooldown(&mut self) {
        let now = self.clock.now();
        self.policy.set_cooldown_start(Some(now));
        info!(
            feature = %self.feature(),
            duration_secs = self.policy.cooldown_duration().num_seconds(),
            "cooldown started"
        );
    }

    /// Start the cooldown when the blocking popup is shown.
    ///
    /// A recorded cooldown is never restarted: if it already ran out while
    /// nothing was polling, the state is reset instead.
    pub fn start_cooldown_on_popup_open(&mut self) -> PopupOutcome {
        let now = self.clock.now();
        if self.policy.cooldown_start().is_some() {
            if self.expire_if_due(now) {
                return PopupOutcome::Reset;
            }
            return PopupOutcome::AlreadyRunning {
                remaining_ms: duration_ms(self.remaining_cooldown_at(now)),
            };
        }

        if self.policy.current_usage() >= self.policy.limit() {
            self.start_cooldown();
            let ends_at = now
                .checked_add_signed(self.policy.cooldown_duration())
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
            return PopupOutcome::Started { ends_at };
        }
        PopupOutcome::NotNeeded
    }

    /// Auto-reset the feature if its recorded cooldown is within the
    /// tolerance of expiring. Returns whether a reset happened; a second
    /// call for the same expiry is a no-op.
    pub fn expire_if_due(&mut self, now: DateTime<Utc>) -> bool {
        if self.policy.cooldown_start().is_none() {
            return false;
        }
        if self.remaining_cooldown_at(now) > self.tolerance() {
            return false;
        }
        self.reset_cooldown();
        info!(feature = %self.feature(), "cooldown expired, usage reset");
        true
    }

    /// Full per-feature check: shadow ban, bypass, quota, popup policy.
    pub fn check(&mut self) -> Decision {
        let now = self.clock.now();

        if let Some(gate) = &self.shadow_ban {
            if let GateVerdict::Blocked { remaining } = gate.evaluate(now) {
                debug!(feature = %self.feature(), "blocked by shadow ban");
                return Decision {
                    feature: self.feature(),
                    can_proceed: false,
                    show_popup: true,
                    remaining_cooldown_ms: duration_ms(remaining),
                    current_usage: self.policy.current_usage(),
                    limit: self.policy.limit(),
                };
            }
        }

        if let Some(reason) = self.bypass.reason(now) {
            debug!(feature = %self.feature(), ?reason, "bypassed quota");
            return Decision {
                feature: self.feature(),
                can_proceed: true,
                show_popup: false,
                remaining_cooldown_ms: 0,
                current_usage: self.policy.current_usage(),
                limit: self.policy.limit(),
            };
        }

        let can_proceed = self.quota_allows(now);
        let usage = self.policy.current_usage();
        let limit = self.policy.limit();
        let in_cooldown = self.is_in_cooldown_at(now);
        let show_popup = match self.feature().popup_policy() {
            PopupPolicy::AlwaysShow => true,
            PopupPolicy::Threshold => usage >= limit || in_cooldown,
        };

        let decision = Decision {
            feature: self.feature(),
            can_proceed,
            show_popup,
            remaining_cooldown_ms: duration_ms(self.remaining_cooldown_at(now)),
            current_usage: usage,
            limit,
        };
        debug!(feature = %self.feature(), can_proceed, show_popup, usage, limit, "checked");
        decision
    }

    /// `check`, then count the action if it may proceed.
    pub fn try_consume(&mut self) -> Decision {
        let mut decision = self.check();
        if decision.can_proceed {
            self.increment_usage();
            decision.current_usage = self.policy.current_usage();
        }
        decision
    }

    // ── Internal ─────────────────────────────────────────────────────

    fn quota_allows(&mut self, now: DateTime<Utc>) -> bool {
        if self.policy.current_usage() < self.policy.limit() {
            return true;
        }
        if self.policy.cooldown_start().is_some() {
            return self.expire_if_due(now);
        }
        // Limit reached but the popup has not started the clock yet.
        false
    }
}
