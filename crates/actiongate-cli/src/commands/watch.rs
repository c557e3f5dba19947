use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

use actiongate_core::{BroadcastBus, GateRuntime, NoopHost};

use super::{CliResult, Gate};

/// Run the gate runtime for `seconds` and print each event as a JSON line.
pub fn run(seconds: u64) -> CliResult {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    rt.block_on(watch(seconds))
}

async fn watch(seconds: u64) -> CliResult {
    let gate = Gate::open()?;
    let bus = BroadcastBus::default();
    let mut events = bus.subscribe();
    let runtime = GateRuntime::spawn(gate.registry, gate.config, bus, Arc::new(NoopHost));

    let deadline = tokio::time::sleep(Duration::from_secs(seconds));
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            event = events.recv() => match event {
                Ok(event) => println!("{}", serde_json::to_string(&event)?),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "watcher fell behind"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    runtime.shutdown().await?;
    Ok(())
}
