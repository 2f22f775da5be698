//! Command table: built-in verbs merged with profile-declared ones.

use super::Device;
use crate::profiles::DeviceProfile;
use anyhow::{anyhow, bail};
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{info, warn};

/// A queued `(verb, argument)` pair
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub verb: String,
    pub argument: Option<Value>,
}

impl Command {
    pub fn new(verb: impl Into<String>, argument: Option<Value>) -> Self {
        Self {
            verb: verb.into(),
            argument,
        }
    }
}

/// Command handler. Runs on the dispatcher, one at a time.
pub type Handler<P> = for<'a> fn(&'a mut Device<P>, Option<Value>) -> BoxFuture<'a, anyhow::Result<()>>;

pub const BUILTIN_COMMANDS: [&str; 4] = ["stop", "start", "status", "rename"];

pub struct CommandTable<P: DeviceProfile> {
    handlers: BTreeMap<String, Handler<P>>,
}

impl<P: DeviceProfile> Default for CommandTable<P> {
    fn default() -> Self {
        Self {
            handlers: BTreeMap::new(),
        }
    }
}

impl<P: DeviceProfile> CommandTable<P> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Table holding only `stop`, `start`, `status` and `rename`
    pub fn builtins() -> Self {
        let mut table = Self::new();
        table.handlers.insert("stop".into(), cmd_stop::<P>);
        table.handlers.insert("start".into(), cmd_start::<P>);
        table.handlers.insert("status".into(), cmd_status::<P>);
        table.handlers.insert("rename".into(), cmd_rename::<P>);
        table
    }

    /// Builder-style registration, used by profiles
    pub fn with(mut self, verb: &str, handler: Handler<P>) -> Self {
        self.register(verb, handler);
        self
    }

    /// Registers `verb`. The first registration of a verb wins; later ones are
    /// rejected with a warning.
    pub fn register(&mut self, verb: &str, handler: Handler<P>) -> bool {
        if self.handlers.contains_key(verb) {
            warn!("[commands] {:?} already registered, ignoring override", verb);
            return false;
        }
        self.handlers.insert(verb.to_string(), handler);
        true
    }

    /// Merges `extra` into this table; collisions keep the existing entry
    pub fn merge(&mut self, extra: CommandTable<P>) {
        for (verb, handler) in extra.handlers {
            self.register(&verb, handler);
        }
    }

    pub fn get(&self, verb: &str) -> Option<Handler<P>> {
        self.handlers.get(verb).copied()
    }

    pub fn contains(&self, verb: &str) -> bool {
        self.handlers.contains_key(verb)
    }

    pub fn verbs(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }
}

/// Reads a string argument either bare (`"x"`) or from an object field (`{"key": "x"}`)
pub fn string_argument(argument: &Option<Value>, key: &str) -> Option<String> {
    match argument {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Object(map)) => map.get(key).and_then(Value::as_str).map(str::to_string),
        _ => None,
    }
}

fn cmd_stop<P: DeviceProfile>(device: &mut Device<P>, _arg: Option<Value>) -> BoxFuture<'_, anyhow::Result<()>> {
    Box::pin(async move {
        device.stop("stop command").await;
        anyhow::Ok(())
    })
}

fn cmd_start<P: DeviceProfile>(device: &mut Device<P>, _arg: Option<Value>) -> BoxFuture<'_, anyhow::Result<()>> {
    Box::pin(async move {
        device.start().await?;
        anyhow::Ok(())
    })
}

fn cmd_status<P: DeviceProfile>(device: &mut Device<P>, _arg: Option<Value>) -> BoxFuture<'_, anyhow::Result<()>> {
    Box::pin(async move {
        device.log_status();
        anyhow::Ok(())
    })
}

fn cmd_rename<P: DeviceProfile>(device: &mut Device<P>, arg: Option<Value>) -> BoxFuture<'_, anyhow::Result<()>> {
    Box::pin(async move {
        let name = string_argument(&arg, "name").ok_or_else(|| anyhow!("rename needs a name, got {:?}", arg))?;
        let name = name.trim();
        if name.is_empty() {
            bail!("rename to an empty name refused");
        }
        let before = device.handle().name();
        device.handle().set_name(name)?;
        info!("[{}] name: {} -> {}", device.handle().device_id(), before, name);
        anyhow::Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profiles::MasterProfile;
    use serde_json::json;

    fn noop(_d: &mut Device<MasterProfile>, _a: Option<Value>) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async { anyhow::Ok(()) })
    }

    #[test]
    fn test_builtins_win_collisions() {
        let mut table = CommandTable::<MasterProfile>::builtins();
        assert!(!table.register("rename", noop));

        let extra = CommandTable::new().with("stop", noop).with("snapshot", noop);
        table.merge(extra);

        assert!(table.contains("snapshot"));
        for verb in BUILTIN_COMMANDS {
            assert!(table.contains(verb));
        }
        assert_eq!(table.verbs().len(), BUILTIN_COMMANDS.len() + 1);
    }

    #[test]
    fn test_string_argument_shapes() {
        assert_eq!(string_argument(&Some(json!("north")), "name").as_deref(), Some("north"));
        assert_eq!(string_argument(&Some(json!({"name": "north"})), "name").as_deref(), Some("north"));
        assert_eq!(string_argument(&Some(json!({"other": 1})), "name"), None);
        assert_eq!(string_argument(&Some(json!(42)), "name"), None);
        assert_eq!(string_argument(&None, "name"), None);
    }
}
