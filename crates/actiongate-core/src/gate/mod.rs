//! Per-feature gating: decisions, the limit engine, and the registry that
//! owns one engine per feature.

mod decision;
mod engine;
mod registry;

pub use decision::{Decision, LimitSnapshot, PopupOutcome};
pub use engine::LimitEngine;
pub use registry::{GateDeps, LimitRegistry};
