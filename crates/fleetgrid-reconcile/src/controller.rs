//! The controller loop and its handle.
//!
//! A [`FleetController`] owns the [`Reconciler`] and is the only task that
//! mutates fleet state. Periodic ticks and control commands are serialized
//! through one event queue; [`ControllerHandle`] is the cloneable front
//! door used by the daemon, metric pollers and tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use fleetgrid_rollout::{RolloutSpec, RolloutView};
use fleetgrid_state::{FleetError, FleetResult, RolloutId, ScalingPolicy, Timestamp};

use crate::config::ReconcilerConfig;
use crate::reconciler::{CancelBoard, FleetView, Reconciler, TickReport};

/// Source of the current time in epoch seconds.
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        epoch_secs()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock(AtomicU64);

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self(AtomicU64::new(start))
    }

    pub fn set(&self, now: Timestamp) {
        self.0.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, secs: u64) -> Timestamp {
        self.0.fetch_add(secs, Ordering::SeqCst) + secs
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        self.0.load(Ordering::SeqCst)
    }
}

pub fn epoch_secs() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

type Reply<T> = oneshot::Sender<FleetResult<T>>;

/// Events processed by the controller loop, in arrival order.
#[derive(Debug)]
pub enum Command {
    StartRollout { spec: RolloutSpec, reply: Reply<RolloutId> },
    Approve { id: RolloutId, reply: Reply<()> },
    Cancel { id: RolloutId, reply: Reply<()> },
    RolloutStatus { id: RolloutId, reply: Reply<RolloutView> },
    FleetStatus { reply: oneshot::Sender<FleetView> },
    SetPolicy { policy: Option<ScalingPolicy>, reply: Reply<()> },
    SetBounds { min: u32, max: u32, reply: Reply<()> },
    OverrideCapacity { desired: u32, reply: Reply<()> },
    Exposition { reply: oneshot::Sender<String> },
    /// New observations are available; reconcile now.
    Nudge,
    /// Run a tick now and report it.
    Tick { reply: oneshot::Sender<TickReport> },
}

impl Command {
    /// Whether the command can change what the next tick would do.
    fn triggers_tick(&self) -> bool {
        matches!(
            self,
            Self::StartRollout { .. }
                | Self::Approve { .. }
                | Self::Cancel { .. }
                | Self::SetPolicy { .. }
                | Self::SetBounds { .. }
                | Self::OverrideCapacity { .. }
                | Self::Nudge
        )
    }
}

/// Runs the reconciliation loop.
pub struct FleetController {
    reconciler: Reconciler,
    events: mpsc::Receiver<Command>,
    clock: Arc<dyn Clock>,
    interval: std::time::Duration,
}

impl FleetController {
    pub fn new(reconciler: Reconciler, config: &ReconcilerConfig) -> (Self, ControllerHandle) {
        let (tx, rx) = mpsc::channel(config.queue_depth.max(1));
        let handle = ControllerHandle {
            tx,
            cancels: reconciler.cancel_board(),
        };
        let controller = Self {
            reconciler,
            events: rx,
            clock: Arc::new(SystemClock),
            interval: config.tick_interval(),
        };
        (controller, handle)
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Run until shutdown is signalled or every handle is dropped, then
    /// hand the reconciler back.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Reconciler {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval_secs = self.interval.as_secs(), "fleet controller started");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick().await;
                }
                event = self.events.recv() => {
                    let Some(command) = event else {
                        info!("all controller handles dropped, stopping");
                        break;
                    };
                    let reconcile = command.triggers_tick();
                    self.handle(command).await;
                    if reconcile {
                        self.tick().await;
                    }
                }
                _ = shutdown.changed() => {
                    info!("fleet controller shutting down");
                    break;
                }
            }
        }
        self.reconciler
    }

    async fn tick(&mut self) -> TickReport {
        let report = self.reconciler.tick(self.clock.now()).await;
        if report.conflict.is_some() || !report.failures.is_empty() {
            warn!(
                tick = report.tick,
                failures = report.failures.len(),
                conflict = report.conflict.as_deref().unwrap_or(""),
                "tick finished with problems"
            );
        } else if !report.applied.is_empty() {
            debug!(tick = report.tick, applied = report.applied.len(), "tick applied actions");
        }
        report
    }

    async fn handle(&mut self, command: Command) {
        let now = self.clock.now();
        let rec = &mut self.reconciler;
        // A dropped reply receiver only means the caller stopped waiting.
        match command {
            Command::StartRollout { spec, reply } => {
                let _ = reply.send(rec.start_rollout(spec, now));
            }
            Command::Approve { id, reply } => {
                let _ = reply.send(rec.approve(&id));
            }
            Command::Cancel { id, reply } => {
                let _ = reply.send(rec.cancel(&id));
            }
            Command::RolloutStatus { id, reply } => {
                let _ = reply.send(rec.rollout_status(&id));
            }
            Command::FleetStatus { reply } => {
                let _ = reply.send(rec.fleet_status());
            }
            Command::SetPolicy { policy, reply } => {
                let _ = reply.send(rec.set_policy(policy));
            }
            Command::SetBounds { min, max, reply } => {
                let _ = reply.send(rec.set_bounds(min, max));
            }
            Command::OverrideCapacity { desired, reply } => {
                let _ = reply.send(rec.override_capacity(desired));
            }
            Command::Exposition { reply } => {
                let _ = reply.send(rec.exposition());
            }
            Command::Nudge => {}
            Command::Tick { reply } => {
                let report = self.tick().await;
                let _ = reply.send(report);
            }
        }
    }
}

/// Cloneable handle for issuing commands to a running controller.
#[derive(Debug, Clone)]
pub struct ControllerHandle {
    tx: mpsc::Sender<Command>,
    cancels: CancelBoard,
}

impl ControllerHandle {
    async fn request<T>(&self, command: Command, rx: oneshot::Receiver<T>) -> FleetResult<T> {
        self.tx.send(command).await.map_err(|_| FleetError::Stopped)?;
        rx.await.map_err(|_| FleetError::Stopped)
    }

    pub async fn start_rollout(&self, spec: RolloutSpec) -> FleetResult<RolloutId> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::StartRollout { spec, reply }, rx).await?
    }

    pub async fn approve(&self, id: &str) -> FleetResult<()> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::Approve { id: id.to_string(), reply }, rx)
            .await?
    }

    /// Cancel a rollout. Creates already in flight observe the cancel
    /// before the command reaches the loop.
    pub async fn cancel(&self, id: &str) -> FleetResult<()> {
        self.cancels.request(id);
        let (reply, rx) = oneshot::channel();
        let result = self
            .request(Command::Cancel { id: id.to_string(), reply }, rx)
            .await
            .and_then(|r| r);
        if result.is_err() {
            self.cancels.clear(id);
        }
        result
    }

    pub async fn rollout_status(&self, id: &str) -> FleetResult<RolloutView> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::RolloutStatus { id: id.to_string(), reply }, rx)
            .await?
    }

    pub async fn fleet_status(&self) -> FleetResult<FleetView> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::FleetStatus { reply }, rx).await
    }

    pub async fn set_policy(&self, policy: Option<ScalingPolicy>) -> FleetResult<()> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::SetPolicy { policy, reply }, rx).await?
    }

    pub async fn set_bounds(&self, min: u32, max: u32) -> FleetResult<()> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::SetBounds { min, max, reply }, rx).await?
    }

    pub async fn override_capacity(&self, desired: u32) -> FleetResult<()> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::OverrideCapacity { desired, reply }, rx)
            .await?
    }

    pub async fn prometheus(&self) -> FleetResult<String> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::Exposition { reply }, rx).await
    }

    /// Run a tick immediately.
    pub async fn tick(&self) -> FleetResult<TickReport> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::Tick { reply }, rx).await
    }

    /// Ask for a reconciliation pass without waiting. Dropped when the
    /// queue is full, since a pending event already implies one.
    pub fn notify(&self) {
        if let Err(mpsc::error::TrySendError::Closed(_)) = self.tx.try_send(Command::Nudge) {
            debug!("controller stopped, nudge dropped");
        }
    }
}
