use devkit::{wait_until, TestHarness};
use herd_device::profiles::MasterProfile;
use herd_device::services::StatusView;
use herd_device::worker::Health;
use serde_json::json;
use std::collections::BTreeMap;
use std::net::{SocketAddr, TcpListener};
use std::time::Duration;

fn free_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

#[tokio::test]
async fn test_status_api_reports_and_accepts_commands() {
    let harness = TestHarness::new();
    harness.seed_store(json!({ "device_id": "dev-api", "device_name": "desk" }));
    let addr = free_addr();
    let mut device = harness.builder().status_api(Some(addr)).build(MasterProfile).unwrap();
    let handle = device.handle().clone();
    assert!(device.has_worker("status_api"));
    let runner = tokio::spawn(async move { device.run().await });

    let base = format!("http://{addr}");
    let client = reqwest::Client::new();
    let mut status = None;
    for _ in 0..50 {
        if let Ok(resp) = client.get(format!("{base}/status")).send().await {
            status = Some(resp.json::<StatusView>().await.unwrap());
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let status = status.expect("status API never came up");
    assert_eq!(status.device_id, "dev-api");
    assert_eq!(status.name, "desk");
    assert_eq!(status.group_id, "fleet1");
    assert_eq!(status.ip, "10.0.0.7");

    let health: BTreeMap<String, Health> = client
        .get(format!("{base}/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(health.contains_key("command_listener"));
    assert!(health.contains_key("status_api"));

    let resp = client
        .post(format!("{base}/rename"))
        .json(&json!({ "name": "lab" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 202);
    assert!(wait_until(Duration::from_secs(2), || handle.name() == "lab").await);

    let resp = client
        .post(format!("{base}/command"))
        .json(&json!({ "command": "stop" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 202);
    tokio::time::timeout(Duration::from_secs(10), runner)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(client.get(format!("{base}/status")).send().await.is_err());
}
