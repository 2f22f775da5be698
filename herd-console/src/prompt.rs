//! Operator prompt.
//!
//! ```text
//! <scope> <command> [property]   publish {"command","property"} on {scope}/COMMAND
//! list                            print the fleet table
//! exit                            quit the console
//! ```
//!
//! `property` is parsed as JSON when it can be, otherwise taken as a plain string.

use crate::fleet::FleetAggregator;
use crate::render::render_table;
use herd_device::bus::SharedBus;
use herd_device::protocol::{command_topic, CommandEnvelope};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{info, warn};

pub const ACK_FILTER: &str = "+/ACK";

#[derive(Debug, Clone, PartialEq)]
pub enum PromptAction {
    Send {
        scope: String,
        command: String,
        property: Option<Value>,
    },
    List,
    Exit,
    Empty,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PromptError {
    #[error("usage: <scope> <command> [property] | list | exit")]
    Usage,
}

pub fn parse_line(line: &str) -> Result<PromptAction, PromptError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(PromptAction::Empty);
    }
    match line {
        "list" => return Ok(PromptAction::List),
        "exit" | "quit" => return Ok(PromptAction::Exit),
        _ => {}
    }

    let mut parts = line.splitn(3, char::is_whitespace);
    let scope = parts.next().unwrap_or_default();
    let Some(command) = parts.next().filter(|c| !c.is_empty()) else {
        return Err(PromptError::Usage);
    };
    let property = parts.next().map(str::trim).filter(|p| !p.is_empty()).map(|raw| {
        serde_json::from_str::<Value>(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
    });

    Ok(PromptAction::Send {
        scope: scope.to_string(),
        command: command.to_string(),
        property,
    })
}

/// Reads operator lines from `input` until `exit` or end of input
pub async fn run_prompt<R>(input: R, bus: SharedBus, fleet: FleetAggregator) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await? {
        match parse_line(&line) {
            Ok(PromptAction::Empty) => {}
            Ok(PromptAction::Exit) => break,
            Ok(PromptAction::List) => print!("{}", render_table(&fleet.snapshot())),
            Ok(PromptAction::Send {
                scope,
                command,
                property,
            }) => {
                let topic = command_topic(&scope);
                let payload = CommandEnvelope::new(command.as_str(), property).to_payload();
                match bus.publish(&topic, payload).await {
                    Ok(()) => info!("[console] {} -> {}", command, topic),
                    Err(e) => warn!("[console] publishing {} on {} failed: {}", command, topic, e),
                }
            }
            Err(e) => println!("{e}"),
        }
    }
    Ok(())
}

/// Logs every acknowledgement seen on the fleet until the bus closes
pub async fn log_acks(bus: SharedBus) -> anyhow::Result<()> {
    let mut subscription = bus.subscribe(&[ACK_FILTER.to_string()]).await?;
    while let Some(msg) = subscription.recv().await {
        info!("[console] {} {}", msg.topic, msg.payload_str().unwrap_or("<binary>"));
    }
    Ok(())
}
