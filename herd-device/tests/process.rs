#![cfg(unix)]

use devkit::{wait_until, TestHarness};
use herd_device::device::{Device, DeviceState};
use herd_device::profiles::MasterProfile;
use herd_device::worker::{Health, ProcessWorker, ResourcePolicy, SignalLadder, StopOutcome};
use std::time::{Duration, Instant};
use tempfile::TempDir;

const SHORT_LADDER: SignalLadder = SignalLadder {
    interrupt_wait: Duration::from_millis(200),
    terminate_wait: Duration::from_millis(200),
};

fn shell(name: &str, script: &str) -> ProcessWorker {
    ProcessWorker::new(name, "sh", vec!["-c".to_string(), script.to_string()]).ladder(SHORT_LADDER)
}

async fn running_device(harness: &TestHarness) -> Device<MasterProfile> {
    let mut device = harness.builder().build(MasterProfile).unwrap();
    device.start().await.unwrap();
    device
}

fn health_of(device: &Device<MasterProfile>, name: &str) -> Option<Health> {
    device.handle().worker_health().get(name).copied()
}

#[tokio::test]
async fn test_child_ignoring_signals_is_killed_within_ladder() {
    let harness = TestHarness::new();
    let mut device = running_device(&harness).await;

    let deaf = shell("deaf", "trap '' INT TERM; while true; do sleep 0.1; done");
    device.spawn_worker(Box::new(deaf)).unwrap();
    assert!(wait_until(Duration::from_secs(2), || health_of(&device, "deaf") == Some(Health::Ok)).await);
    // let the shell install its traps
    tokio::time::sleep(Duration::from_millis(300)).await;

    let started = Instant::now();
    let outcome = device.retire_worker("deaf").await;
    assert_eq!(outcome, Some(StopOutcome::Killed));
    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(!device.has_worker("deaf"));

    device.stop("test over").await;
}

#[tokio::test]
async fn test_child_honouring_sigterm_reports_terminated() {
    let harness = TestHarness::new();
    let mut device = running_device(&harness).await;

    device
        .spawn_worker(Box::new(shell("stubborn", "trap '' INT; while true; do sleep 0.1; done")))
        .unwrap();
    assert!(wait_until(Duration::from_secs(2), || health_of(&device, "stubborn") == Some(Health::Ok)).await);
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(device.retire_worker("stubborn").await, Some(StopOutcome::Terminated));
    device.stop("test over").await;
}

#[tokio::test]
async fn test_child_exiting_on_sigint_is_graceful() {
    let harness = TestHarness::new();
    let mut device = running_device(&harness).await;

    device.spawn_worker(Box::new(shell("polite", "exec sleep 30"))).unwrap();
    assert!(wait_until(Duration::from_secs(2), || health_of(&device, "polite") == Some(Health::Ok)).await);

    assert_eq!(device.retire_worker("polite").await, Some(StopOutcome::Graceful));
    device.stop("test over").await;
}

#[tokio::test]
async fn test_strict_claim_on_stale_endpoint_leaves_device_running() {
    let harness = TestHarness::new();
    let scratch = TempDir::new().unwrap();
    let socket = scratch.path().join("pi_cam_shm_0");
    std::fs::write(&socket, b"").unwrap();
    let mut device = running_device(&harness).await;

    let source = shell("controller_0", "exec sleep 30").claim(&socket, ResourcePolicy::Strict);
    device.spawn_worker(Box::new(source)).unwrap();

    assert!(wait_until(Duration::from_secs(2), || health_of(&device, "controller_0") == Some(Health::Error)).await);
    assert_eq!(device.state(), DeviceState::Running);
    assert!(wait_until(Duration::from_secs(1), || !device.is_worker_alive("controller_0")).await);
    assert!(socket.exists());

    device.stop("test over").await;
}

#[tokio::test]
async fn test_overwrite_claim_replaces_stale_endpoint() {
    let harness = TestHarness::new();
    let scratch = TempDir::new().unwrap();
    let socket = scratch.path().join("pi_cam_shm_0");
    std::fs::write(&socket, b"stale").unwrap();
    let mut device = running_device(&harness).await;

    let script = format!("printf '' > '{}'; exec sleep 30", socket.display());
    let source = shell("controller_0", &script).claim(&socket, ResourcePolicy::Overwrite);
    device.spawn_worker(Box::new(source)).unwrap();

    // stale content removed first, then the child creates a fresh endpoint
    let fresh = || std::fs::read(&socket).map(|b| b.is_empty()).unwrap_or(false);
    assert!(wait_until(Duration::from_secs(3), || fresh() && health_of(&device, "controller_0") == Some(Health::Ok)).await);

    assert_eq!(device.retire_worker("controller_0").await, Some(StopOutcome::Graceful));
    // the endpoint is released on the way out
    assert!(!socket.exists());
    device.stop("test over").await;
}

#[tokio::test]
async fn test_child_waits_for_required_path() {
    let harness = TestHarness::new();
    let scratch = TempDir::new().unwrap();
    let socket = scratch.path().join("pi_cam_shm_0");
    let marker = scratch.path().join("launched");
    let mut device = running_device(&harness).await;

    let script = format!("touch '{}'; exec sleep 30", marker.display());
    let recorder = shell("recorder_0", &script).requires(&socket, Duration::from_secs(10));
    device.spawn_worker(Box::new(recorder)).unwrap();

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(health_of(&device, "recorder_0"), Some(Health::Warning));
    assert!(!marker.exists());

    std::fs::write(&socket, b"").unwrap();
    assert!(wait_until(Duration::from_secs(3), || health_of(&device, "recorder_0") == Some(Health::Ok)).await);
    assert!(wait_until(Duration::from_secs(2), || marker.exists()).await);

    assert_eq!(device.retire_worker("recorder_0").await, Some(StopOutcome::Graceful));
    device.stop("test over").await;
}

#[tokio::test]
async fn test_missing_required_path_fails_the_worker() {
    let harness = TestHarness::new();
    let scratch = TempDir::new().unwrap();
    let mut device = running_device(&harness).await;

    let recorder = shell("recorder_0", "exec sleep 30").requires(scratch.path().join("never"), Duration::from_millis(300));
    device.spawn_worker(Box::new(recorder)).unwrap();

    assert!(wait_until(Duration::from_secs(3), || health_of(&device, "recorder_0") == Some(Health::Error)).await);
    assert_eq!(device.state(), DeviceState::Running);
    device.stop("test over").await;
}
