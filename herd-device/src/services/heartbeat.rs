// Heartbeat publishers: the fleet-wide IFF announcement and the loopback-only
// health record. A failed publish degrades health to Warning and the loop
// carries on; neither worker is lethal.

use crate::bus::SharedBus;
use crate::error::WorkerError;
use crate::protocol::{IFF_TOPIC, LOCAL_HEALTH_TOPIC};
use crate::worker::{Health, Worker, WorkerContext};
use futures::future::BoxFuture;
use std::time::Duration;
use tracing::{debug, warn};

pub const IFF_WORKER: &str = "iff";
pub const LOCAL_HEALTH_WORKER: &str = "local_health";

pub struct IffPublisher {
    interval: Duration,
}

impl IffPublisher {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

impl Worker for IffPublisher {
    fn name(&self) -> &str {
        IFF_WORKER
    }

    fn run(self: Box<Self>, ctx: WorkerContext) -> BoxFuture<'static, Result<(), WorkerError>> {
        Box::pin(announce(self.interval, ctx))
    }
}

pub struct LocalHealthPublisher {
    bus: SharedBus,
    interval: Duration,
}

impl LocalHealthPublisher {
    /// `bus` must be a loopback-scoped transport
    pub fn new(bus: SharedBus, interval: Duration) -> Self {
        Self { bus, interval }
    }
}

impl Worker for LocalHealthPublisher {
    fn name(&self) -> &str {
        LOCAL_HEALTH_WORKER
    }

    fn run(self: Box<Self>, ctx: WorkerContext) -> BoxFuture<'static, Result<(), WorkerError>> {
        Box::pin(report_health(self.bus, self.interval, ctx))
    }
}

async fn announce(interval: Duration, ctx: WorkerContext) -> Result<(), WorkerError> {
    let bus = ctx.device.bus();
    let tag = ctx.tag();
    loop {
        let payload = ctx.device.heartbeat_record().to_payload();
        publish_tick(&bus, IFF_TOPIC, payload, &ctx, &tag).await;
        if ctx.stop.sleep(interval).await {
            break;
        }
    }
    debug!("{} heartbeat loop finished", tag);
    Ok(())
}

async fn report_health(bus: SharedBus, interval: Duration, ctx: WorkerContext) -> Result<(), WorkerError> {
    let tag = ctx.tag();
    loop {
        let report = ctx.device.health_report();
        match serde_json::to_vec(&report) {
            Ok(payload) => publish_tick(&bus, LOCAL_HEALTH_TOPIC, payload, &ctx, &tag).await,
            Err(e) => warn!("{} could not encode health report: {}", tag, e),
        }
        if ctx.stop.sleep(interval).await {
            break;
        }
    }
    Ok(())
}

async fn publish_tick(bus: &SharedBus, topic: &str, payload: Vec<u8>, ctx: &WorkerContext, tag: &str) {
    match bus.publish(topic, payload).await {
        Ok(()) => ctx.health.set(Health::Ok),
        Err(e) => {
            if !ctx.stop.is_stopped() {
                warn!("{} publish on {} failed: {}", tag, topic, e);
                ctx.health.set(Health::Warning);
            }
        }
    }
}
