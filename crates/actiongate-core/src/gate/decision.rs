use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::feature::Feature;

/// Answer to a per-feature check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub feature: Feature,
    pub can_proceed: bool,
    pub show_popup: bool,
    pub remaining_cooldown_ms: u64,
    pub current_usage: u32,
    pub limit: u32,
}

impl Decision {
    pub fn remaining_cooldown(&self) -> Duration {
        Duration::milliseconds(self.remaining_cooldown_ms as i64)
    }
}

/// Point-in-time view of a feature's limit state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitSnapshot {
    pub feature: Feature,
    pub usage: u32,
    pub limit: u32,
    pub cooldown_secs: i64,
    pub cooldown_start: Option<DateTime<Utc>>,
    pub in_cooldown: bool,
    pub remaining_cooldown_ms: u64,
}

/// What `start_cooldown_on_popup_open` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PopupOutcome {
    /// A fresh cooldown started now and ends at `ends_at`.
    Started { ends_at: DateTime<Utc> },
    /// A cooldown was already running and was left untouched.
    AlreadyRunning { remaining_ms: u64 },
    /// The recorded cooldown had silently expired; state was reset instead.
    Reset,
    /// Quota not exhausted, nothing to start.
    NotNeeded,
}

pub(crate) fn duration_ms(d: Duration) -> u64 {
    d.num_milliseconds().max(0) as u64
}
