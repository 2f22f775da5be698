/*!
# Herd DevKit - test support for the device kernel and the console

- Scripted workers with controllable failure modes (error, panic, hang)
- A scripted media factory so camera devices run without GStreamer
- Payload builders for heartbeats and commands
- A harness owning a temp store and an in-memory bus
*/

pub mod messages;
pub mod scripted;
pub mod test_utils;

pub use messages::MessageBuilder;
pub use scripted::{Behavior, Probe, ScriptedMedia, ScriptedWorker};
pub use test_utils::{wait_until, TestHarness};
