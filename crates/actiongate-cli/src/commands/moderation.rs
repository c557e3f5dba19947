use chrono::{DateTime, Duration, Utc};
use clap::Subcommand;
use serde_json::json;

use actiongate_core::{GateVerdict, ShadowBanGate};

use super::{print_json, CliResult, Gate};

#[derive(Subcommand)]
pub enum ShadowBanAction {
    /// Impose a shadow ban on conversations
    Impose {
        /// Ban length in seconds
        #[arg(long)]
        secs: u32,
        /// Start time (RFC 3339); defaults to now
        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },
    /// Lift the shadow ban
    Clear,
    /// Print the shadow-ban state as JSON
    Status,
}

pub fn run(action: ShadowBanAction) -> CliResult {
    let gate = Gate::open()?;
    let ban = ShadowBanGate::new(gate.store.clone(), gate.config.clone());
    let now = gate.registry.clock().now();

    match action {
        ShadowBanAction::Impose { secs, at } => {
            ban.impose(at.unwrap_or(now), Duration::seconds(i64::from(secs)))?;
            println!("shadow ban imposed for {secs}s");
        }
        ShadowBanAction::Clear => {
            ban.lift()?;
            println!("shadow ban cleared");
        }
        ShadowBanAction::Status => {
            let state = ban.state();
            let remaining_ms = match ban.evaluate(now) {
                GateVerdict::Blocked { remaining } => remaining.num_milliseconds(),
                GateVerdict::Open | GateVerdict::Cleared => 0,
            };
            print_json(&json!({
                "active": state.active,
                "start": state.start,
                "duration_secs": state.duration_secs,
                "remaining_ms": remaining_ms,
            }))?;
        }
    }
    Ok(())
}
