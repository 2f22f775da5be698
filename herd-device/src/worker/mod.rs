//! Supervised units of background work.
//!
//! A [`Worker`] is the body; a [`WorkerHandle`] is what the device owns. The handle
//! runs the body in its own tokio task behind a panic boundary, so a crashing
//! worker can only ever reach the device through two doors: its [`HealthCell`]
//! and, for lethal workers, a stop request.
//!
//! Cancellation is cooperative. Workers poll their [`StopSignal`] at least every
//! [`STOP_POLL`]; `WorkerHandle::stop` escalates when they do not:
//!
//! 1. graceful: trip the stop flag, wait `grace`
//! 2. terminate: abort the task (drops child processes with SIGKILL), wait `kill`
//! 3. give up waiting: the task is detached and reported as killed

mod process;

pub use process::{ProcessWorker, ResourcePolicy, SignalLadder};

use crate::device::DeviceHandle;
use crate::error::{DeviceError, WorkerError};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Upper bound between two stop-flag checks
pub const STOP_POLL: Duration = Duration::from_millis(250);

/// Self-reported operational status of a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    Ok,
    Warning,
    Error,
}

impl Health {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Health::Ok,
            1 => Health::Warning,
            _ => Health::Error,
        }
    }
}

/// Lock-free, shareable health value
#[derive(Debug, Clone, Default)]
pub struct HealthCell(Arc<AtomicU8>);

impl HealthCell {
    pub fn get(&self) -> Health {
        Health::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, health: Health) {
        self.0.store(health as u8, Ordering::Release);
    }
}

/// Harshest step a worker needed to wind down what it owns (a child process,
/// say). Read by [`WorkerHandle::stop`] once the worker task has joined.
#[derive(Debug, Clone, Default)]
pub struct EscalationCell(Arc<AtomicU8>);

impl EscalationCell {
    /// Keeps the harshest outcome recorded so far
    pub fn record(&self, outcome: StopOutcome) {
        let level = match outcome {
            StopOutcome::Terminated => 1,
            StopOutcome::Killed => 2,
            _ => 0,
        };
        self.0.fetch_max(level, Ordering::AcqRel);
    }

    pub fn get(&self) -> StopOutcome {
        match self.0.load(Ordering::Acquire) {
            0 => StopOutcome::Graceful,
            1 => StopOutcome::Terminated,
            _ => StopOutcome::Killed,
        }
    }
}

/// Device-wide stop flag combined with a per-worker one
#[derive(Debug, Clone)]
pub struct StopSignal {
    device: Arc<AtomicBool>,
    local: Arc<AtomicBool>,
}

impl StopSignal {
    pub fn new(device: Arc<AtomicBool>) -> Self {
        Self {
            device,
            local: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.device.load(Ordering::SeqCst) || self.local.load(Ordering::SeqCst)
    }

    /// Stops this worker only
    pub fn request(&self) {
        self.local.store(true, Ordering::SeqCst);
    }

    /// Resolves once the flag trips (observed within [`STOP_POLL`])
    pub async fn stopped(&self) {
        while !self.is_stopped() {
            tokio::time::sleep(STOP_POLL).await;
        }
    }

    /// Sleeps for `duration` in poll-sized slices. Returns `true` if the flag
    /// tripped before the full duration elapsed.
    pub async fn sleep(&self, duration: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + duration;
        loop {
            if self.is_stopped() {
                return true;
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return false;
            }
            tokio::time::sleep((deadline - now).min(STOP_POLL)).await;
        }
    }
}

/// Bounds of the stop escalation ladder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopTimeouts {
    pub grace: Duration,
    pub kill: Duration,
}

impl Default for StopTimeouts {
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(2),
            kill: Duration::from_secs(1),
        }
    }
}

/// Everything a running worker may touch outside itself
#[derive(Clone)]
pub struct WorkerContext {
    pub name: String,
    pub device: DeviceHandle,
    pub stop: StopSignal,
    pub health: HealthCell,
    pub escalation: EscalationCell,
}

impl WorkerContext {
    /// `[device_id][worker]` log prefix
    pub fn tag(&self) -> String {
        format!("[{}][{}]", self.device.device_id(), self.name)
    }
}

/// A unit of long-running work
pub trait Worker: Send + 'static {
    fn name(&self) -> &str;

    /// A lethal worker's failure shuts the whole device down
    fn lethal(&self) -> bool {
        false
    }

    fn stop_timeouts(&self) -> StopTimeouts {
        StopTimeouts::default()
    }

    /// Body of the worker. Must return promptly once `ctx.stop` trips.
    fn run(self: Box<Self>, ctx: WorkerContext) -> BoxFuture<'static, Result<(), WorkerError>>;
}

/// How a `stop()` call ended. `Terminated` and `Killed` also cover a worker
/// that exited in time but had to SIGTERM or SIGKILL its own child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    NeverStarted,
    AlreadyStopped,
    Graceful,
    Terminated,
    Killed,
}

enum Slot {
    Pending(Box<dyn Worker>),
    Running(JoinHandle<()>),
    Finished,
}

/// Owning handle on one worker instance. Single use: once stopped, a fresh
/// worker must be built for the next run.
pub struct WorkerHandle {
    name: String,
    tag: String,
    lethal: bool,
    timeouts: StopTimeouts,
    health: HealthCell,
    escalation: EscalationCell,
    stop: Option<StopSignal>,
    slot: Slot,
}

impl WorkerHandle {
    pub fn new(worker: Box<dyn Worker>) -> Self {
        let name = worker.name().to_string();
        Self {
            tag: format!("[{name}]"),
            lethal: worker.lethal(),
            timeouts: worker.stop_timeouts(),
            health: HealthCell::default(),
            escalation: EscalationCell::default(),
            stop: None,
            slot: Slot::Pending(worker),
            name,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lethal(&self) -> bool {
        self.lethal
    }

    pub fn timeouts(&self) -> StopTimeouts {
        self.timeouts
    }

    pub fn health(&self) -> Health {
        self.health.get()
    }

    pub fn health_cell(&self) -> HealthCell {
        self.health.clone()
    }

    pub fn is_started(&self) -> bool {
        !matches!(self.slot, Slot::Pending(_))
    }

    pub fn is_alive(&self) -> bool {
        matches!(&self.slot, Slot::Running(task) if !task.is_finished())
    }

    /// Launches the worker in its own task. Never blocks.
    pub fn start(&mut self, device: &DeviceHandle) -> Result<(), DeviceError> {
        if !matches!(self.slot, Slot::Pending(_)) {
            return Err(DeviceError::InvalidState("already started"));
        }
        let Slot::Pending(worker) = std::mem::replace(&mut self.slot, Slot::Finished) else {
            return Err(DeviceError::InvalidState("already started"));
        };

        let stop = StopSignal::new(device.stop_flag());
        let ctx = WorkerContext {
            name: self.name.clone(),
            device: device.clone(),
            stop: stop.clone(),
            health: self.health.clone(),
            escalation: self.escalation.clone(),
        };
        self.tag = ctx.tag();
        self.stop = Some(stop.clone());

        let tag = self.tag.clone();
        let name = self.name.clone();
        let lethal = self.lethal;
        let health = self.health.clone();
        let device = device.clone();

        let task = tokio::spawn(async move {
            let outcome = AssertUnwindSafe(async move { worker.run(ctx).await })
                .catch_unwind()
                .await;
            let failure = match outcome {
                Ok(Ok(())) => {
                    debug!("{} exited", tag);
                    return;
                }
                Ok(Err(e)) => e,
                Err(panic) => WorkerError::Panicked(panic_message(panic.as_ref())),
            };

            if stop.is_stopped() {
                warn!("{} failed while stopping: {}", tag, failure);
                return;
            }
            health.set(Health::Error);
            error!("{} failed: {}", tag, failure);
            device.report_worker_failure(&name, &failure);
            if lethal {
                error!("{} is lethal, requesting device shutdown", tag);
                device.kill_device(&name);
            }
        });

        self.slot = Slot::Running(task);
        debug!("{} started", self.tag);
        Ok(())
    }

    /// Graceful stop with bounded escalation. Idempotent.
    pub async fn stop(&mut self) -> StopOutcome {
        let mut task = match std::mem::replace(&mut self.slot, Slot::Finished) {
            Slot::Pending(_) => return StopOutcome::NeverStarted,
            Slot::Finished => return StopOutcome::AlreadyStopped,
            Slot::Running(task) => task,
        };

        if let Some(stop) = &self.stop {
            stop.request();
        }
        info!("{} Stopping ...", self.tag);

        if tokio::time::timeout(self.timeouts.grace, &mut task).await.is_ok() {
            let outcome = self.escalation.get();
            if outcome == StopOutcome::Graceful {
                info!("{} stopped gracefully", self.tag);
            } else {
                warn!("{} stopped, its child needed {:?}", self.tag, outcome);
            }
            return outcome;
        }

        warn!("{} did not exit within {:?}, terminating", self.tag, self.timeouts.grace);
        task.abort();
        if tokio::time::timeout(self.timeouts.kill, &mut task).await.is_ok() {
            warn!("{} terminated", self.tag);
            return StopOutcome::Terminated;
        }

        error!("{} still alive after terminate, killed and detached", self.tag);
        StopOutcome::Killed
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
