use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tokio::sync::broadcast;
use tracing::debug;

use crate::feature::Feature;

/// Every state change the reconciler or runtime wants the UI to know about.
/// UI listeners consume these; they never produce them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum LimitEvent {
    /// A feature's cooldown expired and its state was reset.
    FeatureExpired {
        feature: Feature,
        at: DateTime<Utc>,
    },
    /// Aggregate companion of `FeatureExpired`, for listeners watching
    /// every feature at once.
    AnyFeatureExpired {
        feature: Feature,
        at: DateTime<Utc>,
    },
    CooldownStarted {
        feature: Feature,
        ends_at: DateTime<Utc>,
        at: DateTime<Utc>,
    },
    ShadowBanCleared {
        at: DateTime<Utc>,
    },
}

impl LimitEvent {
    pub fn feature(&self) -> Option<Feature> {
        match self {
            LimitEvent::FeatureExpired { feature, .. }
            | LimitEvent::AnyFeatureExpired { feature, .. }
            | LimitEvent::CooldownStarted { feature, .. } => Some(*feature),
            LimitEvent::ShadowBanCleared { .. } => None,
        }
    }
}

/// Destination for published events.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: LimitEvent);
}

/// Fan-out bus over a tokio broadcast channel.
///
/// Publishing never blocks. Slow subscribers lag and miss events rather than
/// stalling the reconciler.
#[derive(Debug, Clone)]
pub struct BroadcastBus {
    tx: broadcast::Sender<LimitEvent>,
}

impl BroadcastBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(16));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LimitEvent> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastBus {
    fn default() -> Self {
        Self::new(64)
    }
}

impl EventSink for BroadcastBus {
    fn publish(&self, event: LimitEvent) {
        if self.tx.send(event).is_err() {
            debug!("event published with no subscribers");
        }
    }
}

/// Sink that keeps every event in memory, in publish order.
#[derive(Debug, Default)]
pub struct EventLog {
    events: Mutex<Vec<LimitEvent>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Vec<LimitEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Take every recorded event, leaving the log empty.
    pub fn drain(&self) -> Vec<LimitEvent> {
        std::mem::take(&mut *self.events.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

impl EventSink for EventLog {
    fn publish(&self, event: LimitEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
    }
}
