use std::sync::Arc;

use actiongate_core::{BackgroundReconciler, EventLog, Feature};
use serde_json::json;

use super::{print_json, CliResult, Gate};

pub fn check(feature: Feature) -> CliResult {
    let mut gate = Gate::open()?;
    print_json(&gate.registry.check(feature))
}

pub fn consume(feature: Feature) -> CliResult {
    let mut gate = Gate::open()?;
    print_json(&gate.registry.try_consume(feature))
}

pub fn popup(feature: Feature) -> CliResult {
    let mut gate = Gate::open()?;
    let outcome = gate.registry.start_cooldown_on_popup_open(feature);
    let snapshot = gate.registry.engine(feature).map(|engine| engine.snapshot());
    print_json(&json!({ "popup": outcome, "state": snapshot }))
}

pub fn reset(feature: Feature) -> CliResult {
    let mut gate = Gate::open()?;
    gate.registry.reset_cooldown(feature);
    println!("{feature} reset");
    Ok(())
}

pub fn status() -> CliResult {
    let gate = Gate::open()?;
    print_json(&gate.registry.snapshots())
}

pub fn sweep() -> CliResult {
    let mut gate = Gate::open()?;
    let log = Arc::new(EventLog::new());
    let mut reconciler = BackgroundReconciler::new(log.clone());
    let now = gate.registry.clock().now();
    reconciler.sweep(&mut gate.registry, now);
    print_json(&log.drain())
}

pub fn wipe() -> CliResult {
    let mut gate = Gate::open()?;
    let removed = gate.registry.wipe()?;
    println!("removed {removed} entries");
    Ok(())
}
