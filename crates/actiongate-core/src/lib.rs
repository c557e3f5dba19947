//! # ActionGate Core Library
//!
//! Usage quotas with cooldowns for gated in-app actions. Each feature gets a
//! fixed number of uses; once exhausted, a blocking popup starts a cooldown
//! and the feature resets itself when the cooldown runs out, whether or not
//! anyone is polling at that moment.
//!
//! ## Architecture
//!
//! - **Limit Engine**: a wall-clock state machine per feature, deriving
//!   everything from persisted timestamps so state survives restarts
//! - **Policies**: quota storage, exempt tiers and new-user grace, and a
//!   conversation-only shadow ban
//! - **Reconciler**: periodic sweep plus precise one-shot timers that
//!   auto-reset expired cooldowns and publish events
//! - **Runtime**: a single tokio task that owns all mutable state
//! - **Storage**: SQLite-backed key-value state and TOML configuration
//!
//! ## Key Components
//!
//! - [`LimitEngine`]: per-feature decisions
//! - [`LimitRegistry`]: one engine per [`Feature`]
//! - [`BackgroundReconciler`]: expiry detection
//! - [`GateRuntime`]: async front door over the registry
//! - [`Config`]: application configuration

pub mod clock;
pub mod error;
pub mod events;
pub mod feature;
pub mod gate;
pub mod policy;
pub mod reconciler;
pub mod runtime;
pub mod storage;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{ConfigError, CoreError, Result, StoreError};
pub use events::{BroadcastBus, EventLog, EventSink, LimitEvent};
pub use feature::{Feature, PopupPolicy};
pub use gate::{Decision, GateDeps, LimitEngine, LimitRegistry, LimitSnapshot, PopupOutcome};
pub use policy::{BypassPolicy, BypassReason, GateVerdict, ShadowBanGate, SharedConfig};
pub use reconciler::{BackgroundReconciler, ExecutionHost, NoopHost, ReconcilerPhase};
pub use runtime::{GateHandle, GateRuntime, Lifecycle};
pub use storage::{Config, MemoryStore, SqliteStore, StateStore};
