use anyhow::Context;
use clap::{Parser, ValueEnum};
use herd_device::bus::{MemoryBus, MqttBus, SharedBus, TransportScope};
use herd_device::config::{config_path, load_config, HerdConfig};
use herd_device::device::{DeviceBuilder, Timing};
use herd_device::identity::ConfigStore;
use herd_device::logging::init_logging;
use herd_device::profiles::{CameraProfile, DeviceProfile, MasterProfile};
use herd_device::signals::wait_for_shutdown_signal;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ProfileKind {
    Camera,
    Master,
}

/// Supervised edge device of a herd fleet
#[derive(Debug, Parser)]
#[command(name = "herd-device", version)]
struct Args {
    /// Test-pattern sources instead of real cameras
    #[arg(long, env = "HERD_DEBUG")]
    debug: bool,

    /// Camera indices, comma separated
    #[arg(long, value_delimiter = ',', default_value = "0")]
    cameras: Vec<u32>,

    #[arg(long, value_enum, default_value = "camera")]
    profile: ProfileKind,

    /// YAML config file (defaults to $HERD_CONFIG, then herd.yaml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// In-process bus instead of the MQTT broker
    #[arg(long)]
    memory_bus: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let path = config_path(args.config.as_deref());
    let cfg = load_config(&path);
    init_logging(Some(&cfg.log_path))?;
    info!(
        "herd-device {} starting: {:?} profile, debug={}, config {}",
        env!("CARGO_PKG_VERSION"),
        args.profile,
        args.debug,
        path.display()
    );

    let device_id = ConfigStore::open(&cfg.store_path)
        .ensure_device_id()
        .context("device identity store")?;
    let (bus, local_bus) = open_buses(&device_id, &cfg, args.memory_bus)?;

    let mut builder = DeviceBuilder::new(bus)
        .store_path(&cfg.store_path)
        .group_id(&cfg.group_id)
        .debug(args.debug)
        .heartbeat_interval(cfg.heartbeat.interval())
        .status_api(cfg.status_api.as_ref().map(|s| s.bind))
        .timing(Timing::from(&cfg.timing));
    if let Some(local) = local_bus {
        builder = builder.local_bus(local);
    }

    match args.profile {
        ProfileKind::Camera => run_device(builder, CameraProfile::new(args.cameras, cfg.camera.clone())).await,
        ProfileKind::Master => run_device(builder, MasterProfile).await,
    }
}

fn open_buses(device_id: &str, cfg: &HerdConfig, memory: bool) -> anyhow::Result<(SharedBus, Option<SharedBus>)> {
    if memory {
        let bus = MemoryBus::new();
        info!("[bus] in-process bus, nothing leaves this host");
        return Ok((Arc::new(bus.clone()), Some(Arc::new(bus))));
    }

    let fleet = MqttBus::connect(device_id, &cfg.mqtt, TransportScope::Fleet)?;
    let local = match MqttBus::connect(&format!("{device_id}-health"), &cfg.mqtt, TransportScope::Loopback) {
        Ok(bus) => Some(Arc::new(bus) as SharedBus),
        Err(e) => {
            warn!("[bus] local health disabled: {}", e);
            None
        }
    };
    Ok((Arc::new(fleet), local))
}

async fn run_device<P: DeviceProfile>(builder: DeviceBuilder, profile: P) -> anyhow::Result<()> {
    let mut device = builder.build(profile)?;
    let handle = device.handle().clone();
    let mut runner = tokio::spawn(async move { device.run().await });

    tokio::select! {
        signal = wait_for_shutdown_signal() => {
            if let Err(e) = signal {
                error!("signal handler failed: {}", e);
            }
            info!("shutdown signal received");
            handle.request_stop("shutdown signal");
            runner.await??;
        }
        finished = &mut runner => finished??,
    }

    info!("[{}] herd-device exited", handle.device_id());
    Ok(())
}
