//! Single-owner gate runtime.
//!
//! One tokio task owns the [`LimitRegistry`] and the [`BackgroundReconciler`].
//! Callers talk to it through a cloneable [`GateHandle`]; every command,
//! sweep tick and precise timer is serialized through the task's loop, so
//! no two reconciliation passes ever race on the same feature.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::events::{BroadcastBus, EventSink, LimitEvent};
use crate::feature::Feature;
use crate::gate::{Decision, LimitRegistry, LimitSnapshot, PopupOutcome};
use crate::policy::SharedConfig;
use crate::reconciler::{BackgroundReconciler, ExecutionHost, ReconcilerPhase};
use crate::Result;

const COMMAND_BUFFER: usize = 64;

/// App lifecycle transitions forwarded by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lifecycle {
    Background,
    Foreground,
}

enum GateCommand {
    Check {
        feature: Feature,
        reply: oneshot::Sender<Decision>,
    },
    TryConsume {
        feature: Feature,
        reply: oneshot::Sender<Decision>,
    },
    Increment {
        feature: Feature,
        reply: oneshot::Sender<()>,
    },
    PopupOpened {
        feature: Feature,
        reply: oneshot::Sender<PopupOutcome>,
    },
    Reset {
        feature: Feature,
        reply: oneshot::Sender<()>,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<LimitSnapshot>>,
    },
    Sweep {
        reply: oneshot::Sender<Vec<Feature>>,
    },
    Lifecycle {
        transition: Lifecycle,
        reply: oneshot::Sender<ReconcilerPhase>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable front door to a running [`GateRuntime`].
#[derive(Clone)]
pub struct GateHandle {
    tx: mpsc::Sender<GateCommand>,
    bus: BroadcastBus,
}

impl GateHandle {
    pub async fn check(&self, feature: Feature) -> Result<Decision> {
        self.request(|reply| GateCommand::Check { feature, reply }).await
    }

    pub async fn try_consume(&self, feature: Feature) -> Result<Decision> {
        self.request(|reply| GateCommand::TryConsume { feature, reply }).await
    }

    pub async fn increment_usage(&self, feature: Feature) -> Result<()> {
        self.request(|reply| GateCommand::Increment { feature, reply }).await
    }

    pub async fn popup_opened(&self, feature: Feature) -> Result<PopupOutcome> {
        self.request(|reply| GateCommand::PopupOpened { feature, reply }).await
    }

    pub async fn reset_cooldown(&self, feature: Feature) -> Result<()> {
        self.request(|reply| GateCommand::Reset { feature, reply }).await
    }

    pub async fn snapshots(&self) -> Result<Vec<LimitSnapshot>> {
        self.request(|reply| GateCommand::Snapshot { reply }).await
    }

    /// Run a sweep now, outside the periodic schedule.
    pub async fn sweep(&self) -> Result<Vec<Feature>> {
        self.request(|reply| GateCommand::Sweep { reply }).await
    }

    pub async fn lifecycle(&self, transition: Lifecycle) -> Result<ReconcilerPhase> {
        self.request(|reply| GateCommand::Lifecycle { transition, reply }).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LimitEvent> {
        self.bus.subscribe()
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> GateCommand,
    ) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(command(reply)).await?;
        Ok(rx.await?)
    }
}

pub struct GateRuntime {
    handle: GateHandle,
    task: JoinHandle<()>,
}

impl GateRuntime {
    /// Spawn the owner task on the current tokio runtime. Monitoring starts
    /// immediately.
    pub fn spawn(
        registry: LimitRegistry,
        config: SharedConfig,
        bus: BroadcastBus,
        host: Arc<dyn ExecutionHost>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let reconciler = BackgroundReconciler::new(Arc::new(bus.clone()));
        let owner = Owner {
            registry,
            reconciler,
            config,
            sink: bus.clone(),
            host,
        };
        let task = tokio::spawn(owner.run(rx));
        Self {
            handle: GateHandle { tx, bus },
            task,
        }
    }

    pub fn handle(&self) -> GateHandle {
        self.handle.clone()
    }

    /// Stop the loop, cancel every timer and release any background budget.
    pub async fn shutdown(self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        if self.handle.tx.send(GateCommand::Shutdown { reply }).await.is_ok() {
            // The loop may already be gone; joining below covers that.
            let _ = rx.await;
        }
        self.task
            .await
            .map_err(|e| crate::CoreError::Runtime(e.to_string()))
    }
}

struct Owner {
    registry: LimitRegistry,
    reconciler: BackgroundReconciler,
    config: SharedConfig,
    sink: BroadcastBus,
    host: Arc<dyn ExecutionHost>,
}

impl Owner {
    async fn run(mut self, mut rx: mpsc::Receiver<GateCommand>) {
        let period = self
            .config
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .reconciler
            .sweep_interval();
        let mut sweep = interval(period);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let now = self.now();
        self.reconciler.start_monitoring(&mut self.registry, now);
        info!(sweep_ms = period.as_millis() as u64, "gate runtime started");

        loop {
            let wake = self.next_wake();
            let sweeping = self.reconciler.is_sweeping();

            tokio::select! {
                msg = rx.recv() => {
                    match msg {
                        Some(command) => {
                            if !self.handle(command) {
                                break;
                            }
                        }
                        None => {
                            debug!("all gate handles dropped");
                            break;
                        }
                    }
                }

                _ = sweep.tick(), if sweeping => {
                    let now = self.now();
                    self.reconciler.sweep(&mut self.registry, now);
                }

                _ = sleep_until(wake.unwrap_or_else(Instant::now)), if wake.is_some() => {
                    let now = self.now();
                    self.reconciler.fire_due_timers(&mut self.registry, now);
                }
            }
        }

        self.reconciler.on_terminate(self.host.as_ref());
        info!("gate runtime stopped");
    }

    /// Returns false when the loop should stop.
    fn handle(&mut self, command: GateCommand) -> bool {
        let now = self.now();
        match command {
            GateCommand::Check { feature, reply } => {
                let _ = reply.send(self.registry.check(feature));
            }
            GateCommand::TryConsume { feature, reply } => {
                let _ = reply.send(self.registry.try_consume(feature));
            }
            GateCommand::Increment { feature, reply } => {
                self.registry.increment_usage(feature);
                let _ = reply.send(());
            }
            GateCommand::PopupOpened { feature, reply } => {
                let outcome = self.registry.start_cooldown_on_popup_open(feature);
                if let PopupOutcome::Started { ends_at } = outcome {
                    self.sink.publish(LimitEvent::CooldownStarted {
                        feature,
                        ends_at,
                        at: now,
                    });
                }
                let _ = reply.send(outcome);
            }
            GateCommand::Reset { feature, reply } => {
                self.registry.reset_cooldown(feature);
                let _ = reply.send(());
            }
            GateCommand::Snapshot { reply } => {
                let _ = reply.send(self.registry.snapshots());
            }
            GateCommand::Sweep { reply } => {
                let expired = self.reconciler.sweep(&mut self.registry, now);
                let _ = reply.send(expired);
            }
            GateCommand::Lifecycle { transition, reply } => {
                let host = self.host.clone();
                match transition {
                    Lifecycle::Background => {
                        self.reconciler
                            .on_enter_background(&mut self.registry, host.as_ref(), now)
                    }
                    Lifecycle::Foreground => {
                        self.reconciler
                            .on_enter_foreground(&mut self.registry, host.as_ref(), now)
                    }
                }
                let _ = reply.send(self.reconciler.phase());
            }
            GateCommand::Shutdown { reply } => {
                let _ = reply.send(());
                return false;
            }
        }

        let now = self.now();
        self.reconciler.schedule_precise_timers(&mut self.registry, now);
        true
    }

    /// Tokio instant matching the earliest precise deadline.
    fn next_wake(&mut self) -> Option<Instant> {
        let deadline = self.reconciler.next_deadline()?;
        Some(instant_for(deadline, self.now()))
    }

    fn now(&self) -> DateTime<Utc> {
        self.registry.clock().now()
    }
}

fn instant_for(deadline: DateTime<Utc>, now: DateTime<Utc>) -> Instant {
    match (deadline - now).to_std() {
        Ok(delay) => Instant::now() + delay,
        Err(_) => {
            if deadline < now {
                debug!(%deadline, "precise deadline already passed");
            } else {
                warn!(%deadline, "precise deadline out of range");
            }
            Instant::now()
        }
    }
}
