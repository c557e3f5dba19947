use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "actiongate", version, about = "ActionGate CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check whether a feature may be used, without counting a use
    Check {
        feature: actiongate_core::Feature,
    },
    /// Check a feature and count the use if allowed
    Use {
        feature: actiongate_core::Feature,
    },
    /// Record that the blocking popup was shown
    Popup {
        feature: actiongate_core::Feature,
    },
    /// Clear usage and cooldown for a feature
    Reset {
        feature: actiongate_core::Feature,
    },
    /// Print the state of every feature as JSON
    Status,
    /// Run one reconciliation sweep and print published events
    Sweep,
    /// Run the gate runtime and stream events as JSON lines
    Watch {
        /// How long to watch before exiting
        #[arg(long, default_value = "30")]
        seconds: u64,
    },
    /// Conversation shadow-ban management
    ShadowBan {
        #[command(subcommand)]
        action: commands::moderation::ShadowBanAction,
    },
    /// Session fields used for quota exemptions
    Session {
        #[command(subcommand)]
        action: commands::session::SessionAction,
    },
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: commands::config::ConfigAction,
    },
    /// Clear all persisted limit state
    Wipe,
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_env("ACTIONGATE_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    init_tracing();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Check { feature } => commands::limits::check(feature),
        Commands::Use { feature } => commands::limits::consume(feature),
        Commands::Popup { feature } => commands::limits::popup(feature),
        Commands::Reset { feature } => commands::limits::reset(feature),
        Commands::Status => commands::limits::status(),
        Commands::Sweep => commands::limits::sweep(),
        Commands::Watch { seconds } => commands::watch::run(seconds),
        Commands::ShadowBan { action } => commands::moderation::run(action),
        Commands::Session { action } => commands::session::run(action),
        Commands::Config { action } => commands::config::run(action),
        Commands::Wipe => commands::limits::wipe(),
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}
