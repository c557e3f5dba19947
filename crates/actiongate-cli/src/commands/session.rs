use chrono::{DateTime, Utc};
use clap::Subcommand;

use actiongate_core::policy::StoredSession;

use super::{CliResult, Gate};

#[derive(Subcommand)]
pub enum SessionAction {
    /// Record when the user first used the app
    FirstUse {
        /// Timestamp (RFC 3339); defaults to now
        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },
    /// Set whether the subscription tier is exempt from quotas
    Tier {
        #[arg(long, action = clap::ArgAction::Set)]
        exempt: bool,
    },
}

pub fn run(action: SessionAction) -> CliResult {
    let gate = Gate::open()?;
    let session = StoredSession::new(gate.store.clone());

    match action {
        SessionAction::FirstUse { at } => {
            let at = at.unwrap_or_else(|| gate.registry.clock().now());
            session.set_first_use(at)?;
            println!("first use recorded at {}", at.to_rfc3339());
        }
        SessionAction::Tier { exempt } => {
            session.set_exempt_tier(exempt)?;
            println!("exempt tier: {exempt}");
        }
    }
    Ok(())
}
