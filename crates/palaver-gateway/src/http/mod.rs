pub mod error;
pub mod health;
pub mod ipc;
pub mod webhooks;

use palaver_core::{IpcCommand, Trigger};
use serde_json::Value;

/// Build a pushed command. A payload naming both `platform` and
/// `conversation` is routed to that conversation, so it serializes with
/// the conversation's turns.
pub fn push_command(name: &str, payload: Value) -> IpcCommand {
    let target = match (
        payload.get("platform").and_then(Value::as_str),
        payload.get("conversation").and_then(Value::as_str),
    ) {
        (Some(p), Some(c)) => Some((p.to_string(), c.to_string())),
        _ => None,
    };
    let command = IpcCommand::new(name, payload, Trigger::Push);
    match target {
        Some((platform, conversation)) => command.for_conversation(platform.into(), conversation.into()),
        None => command,
    }
}
