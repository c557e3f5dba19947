//! Moderation override for the conversation feature.
//!
//! The moderation collaborator records a shadow ban in the state store. While
//! it is active and unexpired every conversation check is blocked regardless
//! of quota. The gate clears the flags itself the first time it observes the
//! ban as expired, from either the decision path or the reconciler.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use super::limit::SharedConfig;
use crate::clock::{from_epoch_ms, to_epoch_ms};
use crate::storage::{StateStore, MAX_WINDOW_SECS};

const ACTIVE_KEY: &str = "moderation.shadow_ban.active";
const START_KEY: &str = "moderation.shadow_ban.start_ms";
const DURATION_KEY: &str = "moderation.shadow_ban.duration_secs";

/// Persisted shadow-ban record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ShadowBanState {
    pub active: bool,
    pub start: Option<DateTime<Utc>>,
    /// Seconds. `None` when the moderation collaborator did not record one.
    pub duration_secs: Option<i64>,
}

/// Outcome of evaluating the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateVerdict {
    /// No ban recorded.
    Open,
    /// A ban was active but had expired; its flags are now cleared.
    Cleared,
    /// Ban in force.
    Blocked { remaining: Duration },
}

pub struct ShadowBanGate {
    store: Arc<dyn StateStore>,
    config: SharedConfig,
}

impl ShadowBanGate {
    pub fn new(store: Arc<dyn StateStore>, config: SharedConfig) -> Self {
        Self { store, config }
    }

    /// Current record. Unreadable fields read as absent.
    pub fn state(&self) -> ShadowBanState {
        let active = self.store.get_bool(ACTIVE_KEY).unwrap_or_else(|e| {
            warn!(error = %e, "failed to read shadow-ban flag");
            None
        });
        let start = self.store.get_i64(START_KEY).unwrap_or_else(|e| {
            warn!(error = %e, "failed to read shadow-ban start");
            None
        });
        let duration_secs = self.store.get_i64(DURATION_KEY).unwrap_or_else(|e| {
            warn!(error = %e, "failed to read shadow-ban duration");
            None
        });
        ShadowBanState {
            active: active.unwrap_or(false),
            start: start.and_then(from_epoch_ms),
            duration_secs: duration_secs.filter(|&secs| secs > 0),
        }
    }

    /// Record a ban starting at `start`. Called on behalf of moderation.
    pub fn impose(&self, start: DateTime<Utc>, duration: Duration) -> crate::Result<()> {
        self.store.set_i64(START_KEY, to_epoch_ms(start))?;
        self.store.set_i64(DURATION_KEY, duration.num_seconds())?;
        self.store.set_bool(ACTIVE_KEY, true)?;
        info!(duration_secs = duration.num_seconds(), "shadow ban imposed");
        Ok(())
    }

    /// Remove every shadow-ban flag.
    pub fn lift(&self) -> crate::Result<()> {
        self.store.set_bool(ACTIVE_KEY, false)?;
        self.store.remove(START_KEY)?;
        self.store.remove(DURATION_KEY)?;
        Ok(())
    }

    /// Duration of the recorded ban.
    ///
    /// The moderation-supplied value is authoritative. The configured
    /// default only applies when none was recorded.
    pub fn effective_duration(&self, state: &ShadowBanState) -> Duration {
        match state.duration_secs {
            Some(secs) => Duration::seconds(secs.min(MAX_WINDOW_SECS as i64)),
            None => {
                let fallback = self
                    .config
                    .read()
                    .unwrap_or_else(|e| e.into_inner())
                    .shadow_ban_default();
                warn!(
                    fallback_secs = fallback.num_seconds(),
                    "shadow ban recorded without a duration, using configured default"
                );
                fallback
            }
        }
    }

    /// Remaining ban time at `now`, or zero when none is in force.
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        match self.evaluate_state(&self.state(), now) {
            Some(remaining) => remaining,
            None => Duration::zero(),
        }
    }

    /// Decide whether the ban blocks at `now`, clearing it if expired.
    pub fn evaluate(&self, now: DateTime<Utc>) -> GateVerdict {
        let mut state = self.state();
        if !state.active {
            return GateVerdict::Open;
        }

        if state.start.is_none() {
            // An active ban without a start can never expire; anchor it now.
            warn!("active shadow ban has no start time, anchoring at now");
            if let Err(e) = self.store.set_i64(START_KEY, to_epoch_ms(now)) {
                warn!(error = %e, "failed to anchor shadow-ban start");
            }
            state.start = Some(now);
        }

        match self.evaluate_state(&state, now) {
            Some(remaining) => GateVerdict::Blocked { remaining },
            None => {
                if let Err(e) = self.lift() {
                    warn!(error = %e, "failed to clear expired shadow ban");
                }
                info!("shadow ban expired and was cleared");
                GateVerdict::Cleared
            }
        }
    }

    fn evaluate_state(&self, state: &ShadowBanState, now: DateTime<Utc>) -> Option<Duration> {
        if !state.active {
            return None;
        }
        let start = state.start?;
        let duration = self.effective_duration(state);
        let elapsed = (now - start).max(Duration::zero());
        if elapsed < duration {
            Some(duration - elapsed)
        } else {
            None
        }
    }
}
