//! The device kernel.
//!
//! A [`Device`] owns its workers, its command table and the receiving end of the
//! command inbox; everything shared with workers and listeners lives behind a
//! cloneable [`DeviceHandle`]. Commands are dispatched one at a time by
//! [`Device::run`], so handlers may freely mutate the device.
//!
//! State machine: `Created -> Starting -> Running -> Stopping -> Stopped`.
//! There is no way out of `Stopped`; build a new device to restart.

mod commands;

pub use commands::{string_argument, Command, CommandTable, Handler, BUILTIN_COMMANDS};

use crate::bus::SharedBus;
use crate::error::{DeviceError, StoreError, WorkerError};
use crate::identity::{probe_ip, ConfigStore, DeviceIdentity, NameChange};
use crate::profiles::DeviceProfile;
use crate::protocol::{unix_now, HealthReport, HeartbeatRecord};
use crate::services::{CommandListener, IffPublisher, LocalHealthPublisher, StatusApi};
use crate::worker::{Health, HealthCell, StopOutcome, Worker, WorkerHandle};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Notify};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceState {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl DeviceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceState::Created => "created",
            DeviceState::Starting => "starting",
            DeviceState::Running => "running",
            DeviceState::Stopping => "stopping",
            DeviceState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle notifications, broadcast to any number of observers
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    Started { workers: usize },
    Stopping { reason: String },
    Stopped,
    NameChanged { old: String, new: String },
    WorkerFailed { worker: String, error: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    /// Delay between two worker starts
    pub start_stagger: Duration,
    /// Dispatcher wait on an empty inbox before re-checking state
    pub dispatch_idle: Duration,
    /// Pause after all stop requests, before the liveness report
    pub stop_settle: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            start_stagger: Duration::from_millis(100),
            dispatch_idle: Duration::from_millis(100),
            stop_settle: Duration::from_millis(500),
        }
    }
}

struct Shared {
    identity: DeviceIdentity,
    store: ConfigStore,
    debug: bool,
    bus: SharedBus,
    stopped: Arc<AtomicBool>,
    state: Mutex<DeviceState>,
    inbox: mpsc::UnboundedSender<Command>,
    kill: Notify,
    kill_reason: Mutex<Option<String>>,
    events: broadcast::Sender<DeviceEvent>,
    health: Mutex<BTreeMap<String, HealthCell>>,
}

/// Cloneable shared half of a device
#[derive(Clone)]
pub struct DeviceHandle {
    shared: Arc<Shared>,
}

impl DeviceHandle {
    pub fn identity(&self) -> &DeviceIdentity {
        &self.shared.identity
    }

    pub fn device_id(&self) -> &str {
        &self.shared.identity.device_id
    }

    pub fn group_id(&self) -> &str {
        &self.shared.identity.group_id
    }

    pub fn ip(&self) -> &str {
        &self.shared.identity.ip
    }

    pub fn debug(&self) -> bool {
        self.shared.debug
    }

    pub fn bus(&self) -> SharedBus {
        self.shared.bus.clone()
    }

    pub fn uptime(&self) -> Duration {
        self.shared.identity.uptime()
    }

    pub fn state(&self) -> DeviceState {
        *self.shared.state.lock()
    }

    /// Display name from the durable store, `"unknown"` if unset or unreadable
    pub fn name(&self) -> String {
        self.shared.store.name()
    }

    /// Persists a new name and fires [`DeviceEvent::NameChanged`]. Setting the
    /// current name again writes nothing and fires nothing.
    pub fn set_name(&self, name: &str) -> Result<NameChange, StoreError> {
        let change = self.shared.store.set_name(name)?;
        if let NameChange::Renamed { old, new } = &change {
            self.emit(DeviceEvent::NameChanged {
                old: old.clone(),
                new: new.clone(),
            });
        }
        Ok(change)
    }

    pub fn store(&self) -> &ConfigStore {
        &self.shared.store
    }

    /// The device-wide `stopped` flag every worker polls
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.shared.stopped.clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::SeqCst)
    }

    /// Enqueues a command for the dispatcher. Returns `false` once the device
    /// has stopped and the inbox is closed.
    pub fn put_command(&self, verb: impl Into<String>, argument: Option<Value>) -> bool {
        self.shared.inbox.send(Command::new(verb, argument)).is_ok()
    }

    /// Asks the dispatcher to run `Device::stop`. Only the first reason is kept.
    pub fn request_stop(&self, reason: impl Into<String>) {
        let reason = reason.into();
        {
            let mut slot = self.shared.kill_reason.lock();
            if slot.is_some() {
                return;
            }
            *slot = Some(reason.clone());
        }
        warn!("[{}] stop requested: {}", self.device_id(), reason);
        self.shared.kill.notify_one();
    }

    /// Lethal-failure entry point
    pub fn kill_device(&self, worker: &str) {
        self.request_stop(format!("lethal worker {worker} failed"));
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<DeviceEvent> {
        self.shared.events.subscribe()
    }

    pub(crate) fn report_worker_failure(&self, worker: &str, error: &WorkerError) {
        self.emit(DeviceEvent::WorkerFailed {
            worker: worker.to_string(),
            error: error.to_string(),
        });
    }

    /// Current health of every registered worker
    pub fn worker_health(&self) -> BTreeMap<String, Health> {
        self.shared
            .health
            .lock()
            .iter()
            .map(|(name, cell)| (name.clone(), cell.get()))
            .collect()
    }

    pub fn heartbeat_record(&self) -> HeartbeatRecord {
        HeartbeatRecord {
            timestamp: unix_now(),
            device_id: self.device_id().to_string(),
            name: self.name(),
            ip: self.ip().to_string(),
        }
    }

    pub fn health_report(&self) -> HealthReport {
        HealthReport {
            record: self.heartbeat_record(),
            state: self.state(),
            uptime_secs: self.uptime().as_secs(),
            workers: self.worker_health(),
        }
    }

    fn emit(&self, event: DeviceEvent) {
        // no observers is fine
        let _ = self.shared.events.send(event);
    }

    fn set_state(&self, state: DeviceState) {
        *self.shared.state.lock() = state;
    }

    fn register_health(&self, name: &str, cell: HealthCell) {
        self.shared.health.lock().insert(name.to_string(), cell);
    }

    fn unregister_health(&self, name: &str) {
        self.shared.health.lock().remove(name);
    }
}

/// Assembles a device: identity from the store, mandatory workers, then the
/// profile's workers and commands.
pub struct DeviceBuilder {
    bus: SharedBus,
    local_bus: Option<SharedBus>,
    store_path: PathBuf,
    group_id: String,
    debug: bool,
    ip: Option<String>,
    heartbeat_interval: Duration,
    status_bind: Option<SocketAddr>,
    timing: Timing,
}

impl DeviceBuilder {
    pub fn new(bus: SharedBus) -> Self {
        Self {
            bus,
            local_bus: None,
            store_path: PathBuf::from("device.cfg"),
            group_id: "herd".into(),
            debug: false,
            ip: None,
            heartbeat_interval: Duration::from_secs(1),
            status_bind: None,
            timing: Timing::default(),
        }
    }

    /// Loopback-only transport for the local health publisher
    pub fn local_bus(mut self, bus: SharedBus) -> Self {
        self.local_bus = Some(bus);
        self
    }

    pub fn store_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.store_path = path.into();
        self
    }

    pub fn group_id(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = group_id.into();
        self
    }

    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Skips the outbound-interface probe
    pub fn ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = Some(ip.into());
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn status_api(mut self, bind: Option<SocketAddr>) -> Self {
        self.status_bind = bind;
        self
    }

    pub fn timing(mut self, timing: Timing) -> Self {
        self.timing = timing;
        self
    }

    pub fn build<P: DeviceProfile>(self, mut profile: P) -> Result<Device<P>, DeviceError> {
        let store = ConfigStore::open(&self.store_path);
        let device_id = store.ensure_device_id()?;
        let ip = self.ip.unwrap_or_else(probe_ip);
        let identity = DeviceIdentity::new(device_id, self.group_id, ip);

        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(64);
        let handle = DeviceHandle {
            shared: Arc::new(Shared {
                identity,
                store,
                debug: self.debug,
                bus: self.bus.clone(),
                stopped: Arc::new(AtomicBool::new(false)),
                state: Mutex::new(DeviceState::Created),
                inbox: inbox_tx,
                kill: Notify::new(),
                kill_reason: Mutex::new(None),
                events,
                health: Mutex::new(BTreeMap::new()),
            }),
        };

        let mut declared: Vec<Box<dyn Worker>> = vec![
            Box::new(CommandListener::new()),
            Box::new(IffPublisher::new(self.heartbeat_interval)),
        ];
        if let Some(local) = &self.local_bus {
            declared.push(Box::new(LocalHealthPublisher::new(local.clone(), self.heartbeat_interval)));
        }
        if let Some(bind) = self.status_bind {
            declared.push(Box::new(StatusApi::new(bind)));
        }
        declared.extend(profile.workers(&handle));

        let mut workers: Vec<WorkerHandle> = Vec::with_capacity(declared.len());
        for worker in declared {
            if workers.iter().any(|w| w.name() == worker.name()) {
                warn!("[{}] duplicate worker {:?} dropped", handle.device_id(), worker.name());
                continue;
            }
            let worker = WorkerHandle::new(worker);
            handle.register_health(worker.name(), worker.health_cell());
            workers.push(worker);
        }

        let mut commands = CommandTable::builtins();
        commands.merge(P::commands());

        let mut buses = vec![self.bus];
        buses.extend(self.local_bus);

        info!(
            "[{}] {} device ready: {} workers, commands {:?}",
            handle.device_id(),
            profile.kind(),
            workers.len(),
            commands.verbs()
        );

        Ok(Device {
            handle,
            profile,
            workers,
            commands,
            inbox: inbox_rx,
            buses,
            timing: self.timing,
        })
    }
}

pub struct Device<P: DeviceProfile> {
    handle: DeviceHandle,
    profile: P,
    workers: Vec<WorkerHandle>,
    commands: CommandTable<P>,
    inbox: mpsc::UnboundedReceiver<Command>,
    buses: Vec<SharedBus>,
    timing: Timing,
}

enum Step {
    Kill,
    Dispatch(Command),
    Idle,
}

impl<P: DeviceProfile> Device<P> {
    pub fn handle(&self) -> &DeviceHandle {
        &self.handle
    }

    pub fn profile(&self) -> &P {
        &self.profile
    }

    pub fn profile_mut(&mut self) -> &mut P {
        &mut self.profile
    }

    pub fn state(&self) -> DeviceState {
        self.handle.state()
    }

    /// Worker names in start order
    pub fn worker_names(&self) -> Vec<String> {
        self.workers.iter().map(|w| w.name().to_string()).collect()
    }

    pub fn has_worker(&self, name: &str) -> bool {
        self.workers.iter().any(|w| w.name() == name)
    }

    pub fn is_worker_alive(&self, name: &str) -> bool {
        self.workers.iter().any(|w| w.name() == name && w.is_alive())
    }

    pub fn commands(&self) -> &CommandTable<P> {
        &self.commands
    }

    /// Starts every worker in declared order without waiting for readiness
    pub async fn start(&mut self) -> Result<(), DeviceError> {
        {
            let mut state = self.handle.shared.state.lock();
            if *state != DeviceState::Created {
                return Err(DeviceError::InvalidState(state.as_str()));
            }
            *state = DeviceState::Starting;
        }

        let mut started = 0;
        for (i, worker) in self.workers.iter_mut().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.timing.start_stagger).await;
            }
            if self.handle.is_stopped() {
                break;
            }
            worker.start(&self.handle)?;
            started += 1;
        }

        self.handle.set_state(DeviceState::Running);
        self.handle.emit(DeviceEvent::Started { workers: started });
        info!("[{}] started {} workers", self.handle.device_id(), started);
        Ok(())
    }

    /// Stops every worker in order, then closes the liveness channel.
    /// Returns `false` if the device was already stopping or stopped.
    pub async fn stop(&mut self, reason: &str) -> bool {
        {
            let mut state = self.handle.shared.state.lock();
            if matches!(*state, DeviceState::Stopping | DeviceState::Stopped) {
                return false;
            }
            *state = DeviceState::Stopping;
        }
        let id = self.handle.device_id().to_string();
        info!("[{}] stopping: {}", id, reason);
        self.handle.emit(DeviceEvent::Stopping {
            reason: reason.to_string(),
        });
        self.handle.shared.stopped.store(true, Ordering::SeqCst);

        for worker in self.workers.iter_mut() {
            worker.stop().await;
        }

        tokio::time::sleep(self.timing.stop_settle).await;
        for worker in &self.workers {
            let liveness = if worker.is_alive() { "alive" } else { "stopped" };
            info!("[{}][{}] {}", id, worker.name(), liveness);
        }

        for bus in &self.buses {
            if let Err(e) = bus.close().await {
                warn!("[{}] closing bus failed: {}", id, e);
            }
        }
        self.inbox.close();

        self.handle.set_state(DeviceState::Stopped);
        self.handle.emit(DeviceEvent::Stopped);
        info!("[{}] stopped", id);
        true
    }

    /// Dispatcher loop. Starts the device if needed and returns once it is stopped.
    pub async fn run(&mut self) -> Result<(), DeviceError> {
        if self.state() == DeviceState::Created {
            self.start().await?;
        }

        let handle = self.handle.clone();
        while self.state() != DeviceState::Stopped {
            let step = tokio::select! {
                _ = handle.shared.kill.notified() => Step::Kill,
                next = tokio::time::timeout(self.timing.dispatch_idle, self.inbox.recv()) => match next {
                    Ok(Some(command)) => Step::Dispatch(command),
                    _ => Step::Idle,
                },
            };

            match step {
                Step::Kill => {
                    let reason = handle
                        .shared
                        .kill_reason
                        .lock()
                        .clone()
                        .unwrap_or_else(|| "stop requested".into());
                    self.stop(&reason).await;
                }
                Step::Dispatch(command) => self.dispatch(command).await,
                Step::Idle => {}
            }
        }
        Ok(())
    }

    /// Dispatches whatever is queued right now, without waiting for more
    pub async fn dispatch_pending(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(command) = self.inbox.try_recv() {
            self.dispatch(command).await;
            handled += 1;
        }
        handled
    }

    async fn dispatch(&mut self, command: Command) {
        let id = self.handle.device_id().to_string();
        let Some(handler) = self.commands.get(&command.verb) else {
            warn!("[{}] unknown command {:?} dropped", id, command.verb);
            return;
        };

        info!("[{}] command {} {:?}", id, command.verb, command.argument);
        let outcome = AssertUnwindSafe(handler(self, command.argument)).catch_unwind().await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("[{}] command {} failed: {:#}", id, command.verb, e),
            Err(_) => error!("[{}] command {} panicked", id, command.verb),
        }
    }

    /// Adds and starts a worker on a running device (e.g. a recorder)
    pub fn spawn_worker(&mut self, worker: Box<dyn Worker>) -> Result<(), DeviceError> {
        let state = self.state();
        if matches!(state, DeviceState::Stopping | DeviceState::Stopped) {
            return Err(DeviceError::InvalidState(state.as_str()));
        }
        if self.has_worker(worker.name()) {
            return Err(DeviceError::DuplicateWorker(worker.name().to_string()));
        }

        let mut worker = WorkerHandle::new(worker);
        if state != DeviceState::Created {
            worker.start(&self.handle)?;
        }
        self.handle.register_health(worker.name(), worker.health_cell());
        self.workers.push(worker);
        Ok(())
    }

    /// Stops one worker and forgets it. `None` if no worker has that name.
    pub async fn retire_worker(&mut self, name: &str) -> Option<StopOutcome> {
        let index = self.workers.iter().position(|w| w.name() == name)?;
        let mut worker = self.workers.remove(index);
        let outcome = worker.stop().await;
        self.handle.unregister_health(name);
        Some(outcome)
    }

    pub fn log_status(&self) {
        let h = &self.handle;
        info!(
            "[{}] status: name={} ip={} group={} state={} uptime={}s debug={}",
            h.device_id(),
            h.name(),
            h.ip(),
            h.group_id(),
            h.state(),
            h.uptime().as_secs(),
            h.debug()
        );
        for worker in &self.workers {
            info!(
                "[{}][{}] health={:?} alive={}",
                h.device_id(),
                worker.name(),
                worker.health(),
                worker.is_alive()
            );
        }
    }
}
