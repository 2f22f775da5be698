use crate::bus::Message;
use crate::error::{BusError, WorkerError};
use crate::protocol::{ack_topic_for, command_topic, CommandEnvelope, ACK_PAYLOAD, GLOBAL_SCOPE};
use crate::worker::{Health, Worker, WorkerContext, STOP_POLL};
use futures::future::BoxFuture;
use tracing::{debug, info, warn};

pub const LISTENER_WORKER: &str = "command_listener";

/// Feeds `{global,group,device}/COMMAND` into the device inbox and ACKs each
/// decoded command on the matching ACK scope.
#[derive(Default)]
pub struct CommandListener;

impl CommandListener {
    pub fn new() -> Self {
        Self
    }
}

impl Worker for CommandListener {
    fn name(&self) -> &str {
        LISTENER_WORKER
    }

    fn run(self: Box<Self>, ctx: WorkerContext) -> BoxFuture<'static, Result<(), WorkerError>> {
        Box::pin(listen(ctx))
    }
}

async fn listen(ctx: WorkerContext) -> Result<(), WorkerError> {
    let tag = ctx.tag();
    let bus = ctx.device.bus();
    let filters = vec![
        command_topic(GLOBAL_SCOPE),
        command_topic(ctx.device.group_id()),
        command_topic(ctx.device.device_id()),
    ];
    let mut subscription = bus.subscribe(&filters).await?;
    info!("{} listening on {:?}", tag, filters);

    while !ctx.stop.is_stopped() {
        let msg = match tokio::time::timeout(STOP_POLL, subscription.recv()).await {
            Err(_) => continue,
            Ok(Some(msg)) => msg,
            Ok(None) if ctx.stop.is_stopped() => break,
            Ok(None) => return Err(BusError::Closed.into()),
        };
        handle_message(&ctx, &tag, msg).await;
    }
    debug!("{} finished", tag);
    Ok(())
}

async fn handle_message(ctx: &WorkerContext, tag: &str, msg: Message) {
    let envelope = match CommandEnvelope::decode(&msg.payload) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!("{} dropped malformed command on {}: {}", tag, msg.topic, e);
            return;
        }
    };

    debug!("{} {} <- {}", tag, envelope.command, msg.topic);
    if !ctx.device.put_command(envelope.command, envelope.property) {
        debug!("{} inbox closed, command ignored", tag);
        return;
    }

    let Some(ack) = ack_topic_for(&msg.topic) else { return };
    match ctx.device.bus().publish(&ack, ACK_PAYLOAD.as_bytes().to_vec()).await {
        Ok(()) => ctx.health.set(Health::Ok),
        Err(e) => {
            warn!("{} ACK on {} failed: {}", tag, ack, e);
            ctx.health.set(Health::Warning);
        }
    }
}
