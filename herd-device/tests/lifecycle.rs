use devkit::{wait_until, Behavior, ScriptedWorker, TestHarness};
use herd_device::bus::{Bus, MemoryBus, MqttBus, MqttSettings, TransportScope};
use herd_device::device::{CommandTable, Device, DeviceBuilder, DeviceEvent, DeviceHandle, DeviceState};
use herd_device::error::DeviceError;
use herd_device::profiles::{DeviceProfile, MasterProfile};
use herd_device::protocol::{HealthReport, HeartbeatRecord, IFF_TOPIC, LOCAL_HEALTH_TOPIC};
use herd_device::services::IFF_WORKER;
use herd_device::worker::{Health, StopOutcome, Worker};
use serde_json::json;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Profile carrying a fixed set of scripted workers
struct Scripted(Vec<Box<dyn Worker>>);

impl DeviceProfile for Scripted {
    fn kind(&self) -> &'static str {
        "scripted"
    }

    fn workers(&mut self, _device: &DeviceHandle) -> Vec<Box<dyn Worker>> {
        std::mem::take(&mut self.0)
    }
}

type Runner<P> = JoinHandle<(Device<P>, Result<(), DeviceError>)>;

fn spawn_run<P: DeviceProfile>(mut device: Device<P>) -> Runner<P> {
    tokio::spawn(async move {
        let result = device.run().await;
        (device, result)
    })
}

async fn join<P: DeviceProfile>(runner: Runner<P>) -> Device<P> {
    let (device, result) = tokio::time::timeout(Duration::from_secs(10), runner)
        .await
        .expect("device did not stop in time")
        .expect("runner panicked");
    result.expect("device run failed");
    device
}

fn drain(events: &mut broadcast::Receiver<DeviceEvent>) -> Vec<DeviceEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

#[tokio::test]
async fn test_rename_over_group_scope_then_stop() {
    let harness = TestHarness::new();
    harness.seed_store(json!({ "device_id": "dev-abcdef" }));

    let device = harness.builder().build(MasterProfile).unwrap();
    let handle = device.handle().clone();
    assert_eq!(handle.device_id(), "dev-abcdef");
    let runner = spawn_run(device);
    assert!(harness.wait_for_subscribers(1).await);

    harness.send_command("fleet1", "rename", Some(json!("north-cam"))).await;
    assert!(wait_until(Duration::from_secs(2), || handle.name() == "north-cam").await);
    assert_eq!(
        harness.read_store(),
        json!({ "device_id": "dev-abcdef", "device_name": "north-cam" })
    );
    assert!(wait_until(Duration::from_secs(2), || harness.acks("fleet1") == 1).await);

    harness.send_command("fleet1", "stop", None).await;
    let device = join(runner).await;
    assert_eq!(device.state(), DeviceState::Stopped);
    assert!(handle.is_stopped());
    assert!(harness.bus.is_closed());
}

#[tokio::test]
async fn test_rename_to_same_name_fires_once() {
    let harness = TestHarness::new();
    let device = harness.builder().build(MasterProfile).unwrap();
    let handle = device.handle().clone();
    let mut events = handle.subscribe_events();
    let runner = spawn_run(device);
    assert!(harness.wait_for_subscribers(1).await);

    let scope = handle.device_id().to_string();
    harness.send_command(&scope, "rename", Some(json!({ "name": "bench" }))).await;
    harness.send_command(&scope, "rename", Some(json!("bench"))).await;
    assert!(wait_until(Duration::from_secs(2), || harness.acks(&scope) == 2).await);

    handle.request_stop("test over");
    join(runner).await;

    let renames: Vec<_> = drain(&mut events)
        .into_iter()
        .filter(|e| matches!(e, DeviceEvent::NameChanged { .. }))
        .collect();
    assert_eq!(
        renames,
        vec![DeviceEvent::NameChanged {
            old: "unknown".into(),
            new: "bench".into()
        }]
    );
    assert_eq!(handle.name(), "bench");
}

#[tokio::test]
async fn test_empty_rename_is_rejected() {
    let harness = TestHarness::new();
    let device = harness.builder().build(MasterProfile).unwrap();
    let handle = device.handle().clone();
    let runner = spawn_run(device);
    assert!(harness.wait_for_subscribers(1).await);

    harness.send_command("global", "rename", Some(json!("   "))).await;
    harness.send_command("global", "rename", None).await;
    assert!(wait_until(Duration::from_secs(2), || harness.acks("global") == 2).await);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(handle.name(), "unknown");
    assert_eq!(handle.state(), DeviceState::Running);
    handle.request_stop("test over");
    join(runner).await;
}

#[tokio::test]
async fn test_unknown_and_malformed_commands_leave_device_running() {
    let harness = TestHarness::new();
    let device = harness.builder().build(MasterProfile).unwrap();
    let handle = device.handle().clone();
    let runner = spawn_run(device);
    assert!(harness.wait_for_subscribers(1).await);

    harness.send_command("fleet1", "self_destruct", Some(json!(3))).await;
    harness
        .bus
        .publish("fleet1/COMMAND", b"not json at all".to_vec())
        .await
        .unwrap();
    assert!(wait_until(Duration::from_secs(2), || harness.acks("fleet1") == 1).await);
    tokio::time::sleep(Duration::from_millis(100)).await;

    // only the decodable command is acknowledged
    assert_eq!(harness.acks("fleet1"), 1);
    assert_eq!(handle.state(), DeviceState::Running);
    assert_eq!(handle.worker_health().get("command_listener"), Some(&Health::Ok));

    handle.request_stop("test over");
    join(runner).await;
}

#[tokio::test]
async fn test_heartbeat_announces_identity() {
    let harness = TestHarness::new();
    harness.seed_store(json!({ "device_id": "dev-01", "device_name": "porch" }));
    let device = harness.builder().build(MasterProfile).unwrap();
    let handle = device.handle().clone();
    let runner = spawn_run(device);

    assert!(wait_until(Duration::from_secs(2), || harness.bus.published_on(IFF_TOPIC).len() >= 2).await);
    let beats = harness.bus.published_on(IFF_TOPIC);
    let first = HeartbeatRecord::decode(&beats[0].payload).unwrap();
    let second = HeartbeatRecord::decode(&beats[1].payload).unwrap();
    assert_eq!(first.device_id, "dev-01");
    assert_eq!(first.name, "porch");
    assert_eq!(first.ip, "10.0.0.7");
    assert!(second.timestamp >= first.timestamp);

    handle.request_stop("test over");
    join(runner).await;
}

#[tokio::test]
async fn test_stop_is_idempotent_and_final() {
    let harness = TestHarness::new();
    let mut device = harness.builder().build(MasterProfile).unwrap();
    let mut events = device.handle().subscribe_events();

    device.start().await.unwrap();
    assert_eq!(device.state(), DeviceState::Running);
    assert!(device.stop("first").await);
    assert!(!device.stop("second").await);
    assert_eq!(device.state(), DeviceState::Stopped);
    assert!(matches!(device.start().await, Err(DeviceError::InvalidState("stopped"))));
    assert!(!device.handle().put_command("status", None));

    let seen = drain(&mut events);
    let stopping = seen
        .iter()
        .filter(|e| matches!(e, DeviceEvent::Stopping { .. }))
        .count();
    assert_eq!(stopping, 1);
    assert_eq!(seen.last(), Some(&DeviceEvent::Stopped));
}

#[tokio::test]
async fn test_request_stop_keeps_first_reason() {
    let harness = TestHarness::new();
    let device = harness.builder().build(MasterProfile).unwrap();
    let handle = device.handle().clone();
    let mut events = handle.subscribe_events();
    let runner = spawn_run(device);

    handle.request_stop("operator");
    handle.request_stop("late second request");
    join(runner).await;

    let reasons: Vec<_> = drain(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            DeviceEvent::Stopping { reason } => Some(reason),
            _ => None,
        })
        .collect();
    assert_eq!(reasons, vec!["operator".to_string()]);
}

#[tokio::test]
async fn test_duplicate_worker_names_keep_first() {
    let harness = TestHarness::new();
    let first = ScriptedWorker::new("sensor", Behavior::UntilStopped);
    let first_probe = first.probe();
    let second = ScriptedWorker::new("sensor", Behavior::UntilStopped);
    let second_probe = second.probe();
    let shadow = ScriptedWorker::new("iff", Behavior::UntilStopped);
    let shadow_probe = shadow.probe();

    let mut device = harness
        .builder()
        .build(Scripted(vec![first.boxed(), second.boxed(), shadow.boxed()]))
        .unwrap();
    assert_eq!(device.worker_names(), vec!["command_listener", "iff", "sensor"]);

    device.start().await.unwrap();
    assert!(wait_until(Duration::from_secs(1), || first_probe.starts() == 1).await);
    assert_eq!(second_probe.starts(), 0);
    assert_eq!(shadow_probe.starts(), 0);

    let again = ScriptedWorker::new("sensor", Behavior::UntilStopped).boxed();
    assert!(matches!(device.spawn_worker(again), Err(DeviceError::DuplicateWorker(_))));

    device.stop("test over").await;
    assert_eq!(first_probe.clean_exits(), 1);
}

#[tokio::test]
async fn test_spawn_after_stop_is_refused() {
    let harness = TestHarness::new();
    let mut device = harness.builder().build(MasterProfile).unwrap();
    device.start().await.unwrap();
    device.stop("test over").await;

    let late = ScriptedWorker::new("late", Behavior::UntilStopped).boxed();
    assert!(matches!(device.spawn_worker(late), Err(DeviceError::InvalidState(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stop_escalation_is_bounded() {
    let harness = TestHarness::new();
    let mut device = harness.builder().build(MasterProfile).unwrap();
    device.start().await.unwrap();

    let grace = Duration::from_millis(150);
    let kill = Duration::from_millis(150);
    let bound = grace + kill + Duration::from_millis(250);

    let polite = ScriptedWorker::new("polite", Behavior::UntilStopped);
    let deaf = ScriptedWorker::new("deaf", Behavior::IgnoreStop).timeouts(grace, kill);
    let deaf_probe = deaf.probe();
    let stuck = ScriptedWorker::new("stuck", Behavior::BlockFor(Duration::from_secs(2))).timeouts(grace, kill);
    device.spawn_worker(polite.boxed()).unwrap();
    device.spawn_worker(deaf.boxed()).unwrap();
    device.spawn_worker(stuck.boxed()).unwrap();
    assert!(wait_until(Duration::from_secs(1), || deaf_probe.running() == 1).await);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(device.retire_worker("polite").await, Some(StopOutcome::Graceful));

    let t = Instant::now();
    assert_eq!(device.retire_worker("deaf").await, Some(StopOutcome::Terminated));
    assert!(t.elapsed() < bound);
    assert_eq!(deaf_probe.running(), 0);
    assert_eq!(deaf_probe.clean_exits(), 0);

    let t = Instant::now();
    assert_eq!(device.retire_worker("stuck").await, Some(StopOutcome::Killed));
    assert!(t.elapsed() < bound);

    assert_eq!(device.retire_worker("stuck").await, None);
    device.stop("test over").await;
}

#[tokio::test]
async fn test_non_lethal_failure_degrades_health_only() {
    let harness = TestHarness::new();
    let flaky = ScriptedWorker::new("flaky", Behavior::FailAfter(Duration::from_millis(30)));
    let device = harness.builder().build(Scripted(vec![flaky.boxed()])).unwrap();
    let handle = device.handle().clone();
    let mut events = handle.subscribe_events();
    let runner = spawn_run(device);

    assert!(wait_until(Duration::from_secs(2), || {
        handle.worker_health().get("flaky") == Some(&Health::Error)
    })
    .await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(handle.state(), DeviceState::Running);
    assert!(!handle.is_stopped());

    handle.request_stop("test over");
    join(runner).await;

    let failures: Vec<_> = drain(&mut events)
        .into_iter()
        .filter(|e| matches!(e, DeviceEvent::WorkerFailed { .. }))
        .collect();
    assert_eq!(failures.len(), 1);
}

#[tokio::test]
async fn test_lethal_failure_stops_device() {
    let harness = TestHarness::new();
    let capture = ScriptedWorker::new("capture", Behavior::PanicAfter(Duration::from_millis(30))).lethal(true);
    let sidecar = ScriptedWorker::new("sidecar", Behavior::UntilStopped);
    let sidecar_probe = sidecar.probe();
    let device = harness
        .builder()
        .build(Scripted(vec![capture.boxed(), sidecar.boxed()]))
        .unwrap();
    let handle = device.handle().clone();
    let mut events = handle.subscribe_events();
    let runner = spawn_run(device);

    let device = join(runner).await;
    assert_eq!(device.state(), DeviceState::Stopped);
    assert_eq!(sidecar_probe.clean_exits(), 1);

    let seen = drain(&mut events);
    assert!(seen.iter().any(|e| matches!(
        e,
        DeviceEvent::WorkerFailed { worker, error } if worker == "capture" && error.contains("scripted panic")
    )));
    assert!(seen.contains(&DeviceEvent::Stopping {
        reason: "lethal worker capture failed".into()
    }));
}

static SHADOW_RENAME_CALLED: std::sync::atomic::AtomicBool = std::sync::atomic::AtomicBool::new(false);

/// Profile trying to take over the built-in `rename`
struct Shadowing;

fn shadow_rename(
    _device: &mut Device<Shadowing>,
    _arg: Option<serde_json::Value>,
) -> futures::future::BoxFuture<'_, anyhow::Result<()>> {
    SHADOW_RENAME_CALLED.store(true, std::sync::atomic::Ordering::SeqCst);
    Box::pin(async { anyhow::Ok(()) })
}

impl DeviceProfile for Shadowing {
    fn kind(&self) -> &'static str {
        "shadowing"
    }

    fn workers(&mut self, _device: &DeviceHandle) -> Vec<Box<dyn Worker>> {
        Vec::new()
    }

    fn commands() -> CommandTable<Self> {
        CommandTable::new().with("rename", shadow_rename)
    }
}

#[tokio::test]
async fn test_builtin_commands_cannot_be_shadowed() {
    let harness = TestHarness::new();
    let mut device = harness.builder().build(Shadowing).unwrap();
    device.start().await.unwrap();

    assert!(device.handle().put_command("rename", Some(json!("kept"))));
    assert_eq!(device.dispatch_pending().await, 1);
    assert_eq!(device.handle().name(), "kept");
    assert!(!SHADOW_RENAME_CALLED.load(std::sync::atomic::Ordering::SeqCst));
    device.stop("test over").await;
}

#[tokio::test]
async fn test_local_health_report_stays_on_local_bus() {
    let harness = TestHarness::new();
    let local = MemoryBus::recording();
    let device = harness
        .builder()
        .local_bus(std::sync::Arc::new(local.clone()))
        .build(MasterProfile)
        .unwrap();
    let handle = device.handle().clone();
    let runner = spawn_run(device);

    assert!(wait_until(Duration::from_secs(2), || !local.published_on(LOCAL_HEALTH_TOPIC).is_empty()).await);
    let report: HealthReport = serde_json::from_slice(&local.published_on(LOCAL_HEALTH_TOPIC)[0].payload).unwrap();
    assert_eq!(report.record.device_id, handle.device_id());
    assert!(report.workers.contains_key("local_health"));
    assert!(harness.bus.published_on(LOCAL_HEALTH_TOPIC).is_empty());

    handle.request_stop("test over");
    join(runner).await;
    assert!(local.is_closed());
}

#[tokio::test]
async fn test_unreachable_broker_degrades_iff_health() {
    let harness = TestHarness::new();
    let port = std::net::TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
    let settings = MqttSettings {
        host: "127.0.0.1".into(),
        port,
        ..MqttSettings::default()
    };
    let bus = MqttBus::connect("test-dead-broker", &settings, TransportScope::Fleet).unwrap();
    let mut device = DeviceBuilder::new(std::sync::Arc::new(bus))
        .store_path(harness.store_path())
        .heartbeat_interval(Duration::from_millis(5))
        .build(MasterProfile)
        .unwrap();
    device.start().await.unwrap();

    let iff_health = || device.handle().worker_health().get(IFF_WORKER).copied();
    assert!(wait_until(Duration::from_secs(5), || iff_health() == Some(Health::Warning)).await);
    assert!(device.is_worker_alive(IFF_WORKER));
    assert_eq!(device.state(), DeviceState::Running);

    let stopped = tokio::time::timeout(Duration::from_secs(10), device.stop("test over")).await;
    assert_eq!(stopped.ok(), Some(true));
}
