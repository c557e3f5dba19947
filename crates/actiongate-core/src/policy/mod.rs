//! Policies consulted by the limit engine.
//!
//! - [`LimitPolicy`]: per-feature quota state over the state store
//! - [`BypassPolicy`]: exemptions evaluated before quota math
//! - [`ShadowBanGate`]: the conversation-only moderation override

mod bypass;
mod limit;
mod shadow_ban;

pub use bypass::{BypassPolicy, BypassReason, FirstUseSource, StoredSession, TierSource};
pub use limit::{ConfigLimits, LimitKeys, LimitPolicy, LimitSource, SharedConfig, StoredLimit};
pub use shadow_ban::{GateVerdict, ShadowBanGate, ShadowBanState};
