/*!
Scripted workers for supervision tests

Each worker follows a fixed [`Behavior`] and reports what happened to it
through a shared [`Probe`], so tests can assert on starts, clean exits and
whether the body is still running after a stop.
*/

use futures::future::BoxFuture;
use herd_device::device::DeviceHandle;
use herd_device::error::WorkerError;
use herd_device::profiles::MediaFactory;
use herd_device::worker::{StopTimeouts, Worker, WorkerContext};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Default)]
pub enum Behavior {
    /// Polls the stop flag and exits cleanly
    #[default]
    UntilStopped,
    /// Returns an error after the delay (unless stopped first)
    FailAfter(Duration),
    /// Panics after the delay (unless stopped first)
    PanicAfter(Duration),
    /// Never looks at the stop flag, only an abort ends it
    IgnoreStop,
    /// Blocks its thread for the duration, deaf to both stop and abort
    BlockFor(Duration),
}

#[derive(Debug, Default)]
struct Counters {
    starts: AtomicUsize,
    clean_exits: AtomicUsize,
    running: AtomicUsize,
}

/// Shared view on what a scripted worker did
#[derive(Debug, Clone, Default)]
pub struct Probe(Arc<Counters>);

impl Probe {
    pub fn starts(&self) -> usize {
        self.0.starts.load(Ordering::SeqCst)
    }

    pub fn clean_exits(&self) -> usize {
        self.0.clean_exits.load(Ordering::SeqCst)
    }

    /// Bodies currently executing (an aborted body counts as finished)
    pub fn running(&self) -> usize {
        self.0.running.load(Ordering::SeqCst)
    }
}

struct RunningGuard(Probe);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0 .0.running.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct ScriptedWorker {
    name: String,
    behavior: Behavior,
    lethal: bool,
    timeouts: StopTimeouts,
    probe: Probe,
}

impl ScriptedWorker {
    pub fn new(name: impl Into<String>, behavior: Behavior) -> Self {
        Self {
            name: name.into(),
            behavior,
            lethal: false,
            timeouts: StopTimeouts::default(),
            probe: Probe::default(),
        }
    }

    pub fn lethal(mut self, lethal: bool) -> Self {
        self.lethal = lethal;
        self
    }

    pub fn timeouts(mut self, grace: Duration, kill: Duration) -> Self {
        self.timeouts = StopTimeouts { grace, kill };
        self
    }

    /// Shares an existing probe (e.g. across the recorders of several runs)
    pub fn with_probe(mut self, probe: Probe) -> Self {
        self.probe = probe;
        self
    }

    pub fn probe(&self) -> Probe {
        self.probe.clone()
    }

    pub fn boxed(self) -> Box<dyn Worker> {
        Box::new(self)
    }
}

impl Worker for ScriptedWorker {
    fn name(&self) -> &str {
        &self.name
    }

    fn lethal(&self) -> bool {
        self.lethal
    }

    fn stop_timeouts(&self) -> StopTimeouts {
        self.timeouts
    }

    fn run(self: Box<Self>, ctx: WorkerContext) -> BoxFuture<'static, Result<(), WorkerError>> {
        Box::pin(perform(self.behavior, self.probe, ctx))
    }
}

async fn perform(behavior: Behavior, probe: Probe, ctx: WorkerContext) -> Result<(), WorkerError> {
    probe.0.starts.fetch_add(1, Ordering::SeqCst);
    probe.0.running.fetch_add(1, Ordering::SeqCst);
    let _guard = RunningGuard(probe.clone());

    match behavior {
        Behavior::UntilStopped => {
            ctx.stop.stopped().await;
        }
        Behavior::FailAfter(delay) => {
            if !ctx.stop.sleep(delay).await {
                return Err(WorkerError::Failed(format!("{} scripted failure", ctx.name)));
            }
        }
        Behavior::PanicAfter(delay) => {
            if !ctx.stop.sleep(delay).await {
                panic!("{} scripted panic", ctx.name);
            }
        }
        Behavior::IgnoreStop => loop {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        },
        Behavior::BlockFor(duration) => {
            std::thread::sleep(duration);
        }
    }

    probe.0.clean_exits.fetch_add(1, Ordering::SeqCst);
    Ok(())
}

#[derive(Debug, Default)]
struct MediaLog {
    built: Vec<String>,
    recordings: Vec<PathBuf>,
}

/// Media factory producing scripted workers instead of pipelines
#[derive(Clone, Default)]
pub struct ScriptedMedia {
    controller: Behavior,
    recorder_probe: Probe,
    refused_camera: Option<u32>,
    log: Arc<Mutex<MediaLog>>,
}

impl ScriptedMedia {
    pub fn new() -> Self {
        Self::default()
    }

    /// Controllers follow `behavior` instead of running until stopped
    pub fn with_controller(mut self, behavior: Behavior) -> Self {
        self.controller = behavior;
        self
    }

    /// Building the recorder for `camera` fails
    pub fn refuse_recorder(mut self, camera: u32) -> Self {
        self.refused_camera = Some(camera);
        self
    }

    /// Names of every worker built so far, in build order
    pub fn built(&self) -> Vec<String> {
        self.log.lock().built.clone()
    }

    /// Output paths handed to recorders
    pub fn recordings(&self) -> Vec<PathBuf> {
        self.log.lock().recordings.clone()
    }

    /// Probe shared by every recorder this factory builds
    pub fn recorder_probe(&self) -> Probe {
        self.recorder_probe.clone()
    }

    fn note(&self, name: &str) {
        self.log.lock().built.push(name.to_string());
    }
}

impl MediaFactory for ScriptedMedia {
    fn controller(&self, name: &str, _camera: u32, _device: &DeviceHandle) -> Result<Box<dyn Worker>, WorkerError> {
        self.note(name);
        Ok(ScriptedWorker::new(name, self.controller.clone()).lethal(true).boxed())
    }

    fn streamer(&self, name: &str, _camera: u32, _device: &DeviceHandle) -> Result<Box<dyn Worker>, WorkerError> {
        self.note(name);
        Ok(ScriptedWorker::new(name, Behavior::UntilStopped).boxed())
    }

    fn recorder(
        &self,
        name: &str,
        camera: u32,
        output: &Path,
        _device: &DeviceHandle,
    ) -> Result<Box<dyn Worker>, WorkerError> {
        if self.refused_camera == Some(camera) {
            return Err(WorkerError::Failed(format!("no encoder for camera {camera}")));
        }
        self.note(name);
        self.log.lock().recordings.push(output.to_path_buf());
        Ok(ScriptedWorker::new(name, Behavior::UntilStopped)
            .with_probe(self.recorder_probe.clone())
            .boxed())
    }
}
