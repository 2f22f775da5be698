//! Camera device: capture controller + streamer per camera, recorders on demand.
//!
//! Frames flow through a shared-memory socket per camera. The controller owns
//! it (lethal: no controller, no camera device); streamer and recorders wait
//! for it to appear before launching.

use super::DeviceProfile;
use crate::device::{string_argument, CommandTable, Device, DeviceHandle};
use crate::error::WorkerError;
use crate::worker::{ProcessWorker, ResourcePolicy, SignalLadder, Worker};
use anyhow::Context;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use time::macros::format_description;
use time::OffsetDateTime;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraSettings {
    pub launcher: String,
    pub shm_base: String,
    pub overwrite_shm: bool,
    pub shm_size: u64,
    pub output_dir: PathBuf,
    pub multicast_ip: String,
    pub stream_port: u16,
    pub dependency_timeout_secs: u64,
    pub recorder_grace_secs: u64,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            launcher: "gst-launch-1.0".into(),
            shm_base: "/tmp/pi_cam_shm_".into(),
            overwrite_shm: true,
            shm_size: 13_442_688,
            output_dir: PathBuf::from("trials"),
            multicast_ip: "224.1.1.1".into(),
            stream_port: 5000,
            dependency_timeout_secs: 10,
            recorder_grace_secs: 10,
        }
    }
}

impl CameraSettings {
    pub fn shm_path(&self, camera: u32) -> PathBuf {
        PathBuf::from(format!("{}{}", self.shm_base, camera))
    }
}

/// Builds the media workers of a camera device
pub trait MediaFactory: Send + Sync + 'static {
    fn controller(&self, name: &str, camera: u32, device: &DeviceHandle) -> Result<Box<dyn Worker>, WorkerError>;
    fn streamer(&self, name: &str, camera: u32, device: &DeviceHandle) -> Result<Box<dyn Worker>, WorkerError>;
    fn recorder(
        &self,
        name: &str,
        camera: u32,
        output: &Path,
        device: &DeviceHandle,
    ) -> Result<Box<dyn Worker>, WorkerError>;
}

/// GStreamer pipelines launched out of process with `gst-launch-1.0`
pub struct GstMediaFactory {
    settings: CameraSettings,
}

// libcamera names of the two CSI ports on a Pi 5
const PI5_CAMERAS: [&str; 2] = [
    "/base/axi/pcie@1000120000/rp1/i2c@88000/imx708@1a",
    "/base/axi/pcie@1000120000/rp1/i2c@80000/imx708@1a",
];

impl GstMediaFactory {
    pub fn new(settings: CameraSettings) -> Self {
        Self { settings }
    }

    fn raw_caps(debug: bool) -> &'static str {
        if debug {
            "video/x-raw,format=I420,width=640,height=480,framerate=30/1"
        } else {
            "video/x-raw,format=I420,width=2304,height=1296,framerate=30/1"
        }
    }

    fn shm_source(&self, camera: u32, debug: bool) -> String {
        format!(
            "shmsrc socket-path={} do-timestamp=true is-live=true ! {}",
            self.settings.shm_path(camera).display(),
            Self::raw_caps(debug)
        )
    }

    pub fn controller_pipeline(&self, camera: u32, device: &DeviceHandle) -> Result<String, WorkerError> {
        let sink = format!(
            "shmsink socket-path={} shm-size={} sync=false wait-for-connection=false",
            self.settings.shm_path(camera).display(),
            self.settings.shm_size
        );
        if device.debug() {
            return Ok(format!(
                "videotestsrc is-live=true pattern=ball ! {} ! queue leaky=downstream max-size-buffers=2 ! {}",
                Self::raw_caps(true),
                sink
            ));
        }

        let camera_name = PI5_CAMERAS
            .get(camera as usize)
            .ok_or_else(|| WorkerError::Failed(format!("no camera port for index {camera}")))?;
        let label = format!("{}:{}", device.device_id(), device.name());
        Ok(format!(
            "libcamerasrc af-mode=continuous camera-name=\"{camera_name}\" ! videoconvert ! \
             textoverlay halignment=center valignment=top text=\"{label}\" font-desc=\"Sans, 5\" ! \
             clockoverlay halignment=right valignment=top time-format=\"%D_%H:%M:%S\" font-desc=\"Sans, 5\" ! \
             {} ! queue leaky=downstream max-size-buffers=2 ! {sink}",
            Self::raw_caps(false)
        ))
    }

    fn dependency_timeout(&self) -> Duration {
        Duration::from_secs(self.settings.dependency_timeout_secs)
    }
}

impl MediaFactory for GstMediaFactory {
    fn controller(&self, name: &str, camera: u32, device: &DeviceHandle) -> Result<Box<dyn Worker>, WorkerError> {
        let pipeline = self.controller_pipeline(camera, device)?;
        info!("[{}][{}] GStreamer pipeline: {}", device.device_id(), name, pipeline);
        let policy = if self.settings.overwrite_shm {
            ResourcePolicy::Overwrite
        } else {
            ResourcePolicy::Strict
        };
        let worker = ProcessWorker::pipeline(name, &self.settings.launcher, &pipeline)?
            .lethal(true)
            .claim(self.settings.shm_path(camera), policy);
        Ok(Box::new(worker))
    }

    fn streamer(&self, name: &str, camera: u32, device: &DeviceHandle) -> Result<Box<dyn Worker>, WorkerError> {
        let port = self.settings.stream_port + camera as u16;
        let pipeline = format!(
            "{} ! videoconvert ! x264enc tune=zerolatency bitrate=10000 speed-preset=ultrafast ! \
             rtph264pay config-interval=1 pt=96 ! udpsink host={} port={} auto-multicast=true",
            self.shm_source(camera, device.debug()),
            self.settings.multicast_ip,
            port
        );
        let worker = ProcessWorker::pipeline(name, &self.settings.launcher, &pipeline)?
            .requires(self.settings.shm_path(camera), self.dependency_timeout());
        Ok(Box::new(worker))
    }

    fn recorder(
        &self,
        name: &str,
        camera: u32,
        output: &Path,
        device: &DeviceHandle,
    ) -> Result<Box<dyn Worker>, WorkerError> {
        let pipeline = format!(
            "{} ! videoconvert ! x264enc tune=zerolatency speed-preset=veryfast pass=qual quantizer=10 ! \
             matroskamux ! filesink location=\"{}\" sync=false",
            self.shm_source(camera, device.debug()),
            output.display()
        );
        let worker = ProcessWorker::pipeline(name, &self.settings.launcher, &pipeline)?
            .requires(self.settings.shm_path(camera), self.dependency_timeout())
            .ladder(SignalLadder {
                interrupt_wait: Duration::from_secs(self.settings.recorder_grace_secs),
                terminate_wait: Duration::from_secs(2),
            });
        Ok(Box::new(worker))
    }
}

pub struct CameraProfile {
    cameras: Vec<u32>,
    settings: CameraSettings,
    media: Arc<dyn MediaFactory>,
    recording: bool,
    in_trial: bool,
    recorders: Vec<String>,
}

impl CameraProfile {
    pub fn new(cameras: Vec<u32>, settings: CameraSettings) -> Self {
        let media = Arc::new(GstMediaFactory::new(settings.clone()));
        Self::with_media(cameras, settings, media)
    }

    pub fn with_media(cameras: Vec<u32>, settings: CameraSettings, media: Arc<dyn MediaFactory>) -> Self {
        let cameras = if cameras.is_empty() { vec![0] } else { cameras };
        Self {
            cameras,
            settings,
            media,
            recording: false,
            in_trial: false,
            recorders: Vec::new(),
        }
    }

    pub fn cameras(&self) -> &[u32] {
        &self.cameras
    }

    pub fn is_recording(&self) -> bool {
        self.recording
    }

    pub fn in_trial(&self) -> bool {
        self.in_trial
    }

    /// Names of the live recorder workers
    pub fn recorders(&self) -> &[String] {
        &self.recorders
    }
}

pub fn controller_name(camera: u32) -> String {
    format!("controller_{camera}")
}

pub fn streamer_name(camera: u32) -> String {
    format!("streamer_{camera}")
}

pub fn recorder_name(camera: u32) -> String {
    format!("recorder_{camera}")
}

impl DeviceProfile for CameraProfile {
    fn kind(&self) -> &'static str {
        "camera"
    }

    fn workers(&mut self, device: &DeviceHandle) -> Vec<Box<dyn Worker>> {
        let mut workers = Vec::new();
        for &camera in &self.cameras {
            let controller = self.media.controller(&controller_name(camera), camera, device);
            let streamer = self.media.streamer(&streamer_name(camera), camera, device);
            match (controller, streamer) {
                (Ok(controller), Ok(streamer)) => {
                    workers.push(controller);
                    workers.push(streamer);
                }
                (Err(e), _) | (_, Err(e)) => {
                    error!("[{}] camera {} skipped: {}", device.device_id(), camera, e);
                }
            }
        }
        workers
    }

    fn commands() -> CommandTable<Self> {
        CommandTable::new()
            .with("start_recorder", cmd_start_recorder)
            .with("stop_recorder", cmd_stop_recorder)
            .with("start_trial", cmd_start_trial)
            .with("stop_trial", cmd_stop_trial)
    }
}

fn cmd_start_recorder(device: &mut Device<CameraProfile>, arg: Option<Value>) -> BoxFuture<'_, anyhow::Result<()>> {
    Box::pin(start_recorder(device, string_argument(&arg, "file_base")))
}

fn cmd_stop_recorder(device: &mut Device<CameraProfile>, _arg: Option<Value>) -> BoxFuture<'_, anyhow::Result<()>> {
    Box::pin(stop_recorder(device))
}

fn cmd_start_trial(device: &mut Device<CameraProfile>, arg: Option<Value>) -> BoxFuture<'_, anyhow::Result<()>> {
    Box::pin(start_trial(device, string_argument(&arg, "trial_name")))
}

fn cmd_stop_trial(device: &mut Device<CameraProfile>, _arg: Option<Value>) -> BoxFuture<'_, anyhow::Result<()>> {
    Box::pin(stop_trial(device))
}

async fn start_recorder(device: &mut Device<CameraProfile>, file_base: Option<String>) -> anyhow::Result<()> {
    let id = device.handle().device_id().to_string();
    if device.profile().recording {
        warn!("[{}] recorder is already running", id);
        return Ok(());
    }

    let output_dir = device.profile().settings.output_dir.clone();
    std::fs::create_dir_all(&output_dir).with_context(|| format!("creating {}", output_dir.display()))?;

    let stamp = file_stamp();
    let cameras = device.profile().cameras.clone();
    let media = device.profile().media.clone();
    let mut started: Vec<String> = Vec::new();
    for &camera in &cameras {
        let mut file = match &file_base {
            Some(base) => format!("{stamp}_{base}"),
            None => format!("{stamp}_{id}_output"),
        };
        if cameras.len() > 1 {
            file.push_str(&format!("_cam{camera}"));
        }
        let output = output_dir.join(format!("{file}.mkv"));
        let name = recorder_name(camera);

        let spawned = match media.recorder(&name, camera, &output, device.handle()) {
            Ok(worker) => device.spawn_worker(worker).map_err(anyhow::Error::from),
            Err(e) => Err(anyhow::Error::from(e)),
        };
        if let Err(e) = spawned {
            for name in &started {
                device.retire_worker(name).await;
            }
            return Err(e.context(format!("starting recorder for camera {camera}")));
        }
        info!("[{}][{}] recording to {}", id, name, output.display());
        started.push(name);
    }

    let count = started.len();
    let profile = device.profile_mut();
    profile.recording = true;
    profile.recorders = started;
    info!("[{}] {} recorder(s) started", id, count);
    Ok(())
}

async fn stop_recorder(device: &mut Device<CameraProfile>) -> anyhow::Result<()> {
    let id = device.handle().device_id().to_string();
    if !device.profile().recording || device.profile().recorders.is_empty() {
        warn!("[{}] no recorder is running", id);
        return Ok(());
    }

    let recorders = std::mem::take(&mut device.profile_mut().recorders);
    device.profile_mut().recording = false;
    for name in recorders {
        match device.retire_worker(&name).await {
            Some(outcome) => info!("[{}][{}] recorder stopped: {:?}", id, name, outcome),
            None => warn!("[{}][{}] recorder was already gone", id, name),
        }
    }
    Ok(())
}

async fn start_trial(device: &mut Device<CameraProfile>, trial_name: Option<String>) -> anyhow::Result<()> {
    let id = device.handle().device_id().to_string();
    let trial_name = trial_name.unwrap_or_else(default_trial_name);
    info!("[{}] starting trial {}", id, trial_name);

    if device.profile().in_trial {
        warn!("[{}] a trial is already in progress", id);
        return Ok(());
    }
    device.profile_mut().in_trial = true;

    if device.profile().recording {
        warn!("[{}] recorder already running, stopping trial", id);
        return stop_trial(device).await;
    }
    let file_base = format!("{}_{}", trial_name, device.handle().name());
    start_recorder(device, Some(file_base)).await
}

async fn stop_trial(device: &mut Device<CameraProfile>) -> anyhow::Result<()> {
    info!("[{}] trial stopped", device.handle().device_id());
    let result = stop_recorder(device).await;
    device.profile_mut().in_trial = false;
    result
}

fn file_stamp() -> String {
    let format = format_description!("[year]-[month]-[day]_[hour]-[minute]-[second]");
    OffsetDateTime::now_utc().format(&format).unwrap_or_else(|_| "0000-00-00_00-00-00".into())
}

fn default_trial_name() -> String {
    let format = format_description!("[year][month][day]_[hour][minute][second]");
    let stamp = OffsetDateTime::now_utc().format(&format).unwrap_or_default();
    format!("trial_{stamp}")
}
