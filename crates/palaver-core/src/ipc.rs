//! Out-of-band command types and the non-blocking sinks extensions use to
//! hand work back to the runtime.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::warn;

use crate::types::{ConversationId, Message, Platform};

/// What caused an IPC command to be issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    /// Fired by the schedule engine.
    Scheduled,
    /// Pushed by an external caller (webhook, HTTP API).
    Push,
    /// Raised by a trigger-detection extension while a turn was running.
    Detected,
}

/// An asynchronous command routed by name to exactly one handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcCommand {
    pub name: String,
    /// Opaque structured data; its schema belongs to the handler.
    #[serde(default)]
    pub payload: serde_json::Value,
    pub trigger: Trigger,
    /// Set when the command touches one conversation's context; the router
    /// then serialises it with that conversation's pipeline runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation: Option<ConversationId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
}

impl IpcCommand {
    pub fn new(name: impl Into<String>, payload: serde_json::Value, trigger: Trigger) -> Self {
        Self {
            name: name.into(),
            payload,
            trigger,
            conversation: None,
            platform: None,
        }
    }

    pub fn for_conversation(mut self, platform: Platform, conversation: ConversationId) -> Self {
        self.platform = Some(platform);
        self.conversation = Some(conversation);
        self
    }
}

/// Fire-and-forget queue of IPC commands (consumed by the command router).
#[derive(Debug, Clone)]
pub struct CommandSink {
    tx: mpsc::Sender<IpcCommand>,
}

impl CommandSink {
    pub fn new(tx: mpsc::Sender<IpcCommand>) -> Self {
        Self { tx }
    }

    /// A bounded sink plus its receiving half.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<IpcCommand>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Enqueue without waiting. Returns `false` (and logs) when the queue is
    /// full or the consumer is gone.
    pub fn enqueue(&self, command: IpcCommand) -> bool {
        let name = command.name.clone();
        match self.tx.try_send(command) {
            Ok(()) => true,
            Err(e) => {
                warn!(command = %name, error = %e, "command queue rejected command");
                false
            }
        }
    }
}

/// Queue of synthetic inbound messages fed back into the pipeline.
#[derive(Debug, Clone)]
pub struct InboundSink {
    tx: mpsc::Sender<Message>,
}

impl InboundSink {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    pub fn enqueue(&self, message: Message) -> bool {
        let conversation = message.conversation_id.clone();
        match self.tx.try_send(message) {
            Ok(()) => true,
            Err(e) => {
                warn!(%conversation, error = %e, "inbound queue rejected message");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn command_sink_delivers_in_order() {
        let (sink, mut rx) = CommandSink::channel(4);
        assert!(sink.enqueue(IpcCommand::new("a", serde_json::Value::Null, Trigger::Push)));
        assert!(sink.enqueue(IpcCommand::new("b", serde_json::Value::Null, Trigger::Push)));
        assert_eq!(rx.recv().await.unwrap().name, "a");
        assert_eq!(rx.recv().await.unwrap().name, "b");
    }

    #[test]
    fn full_command_sink_rejects() {
        let (sink, _rx) = CommandSink::channel(1);
        assert!(sink.enqueue(IpcCommand::new("a", serde_json::Value::Null, Trigger::Push)));
        assert!(!sink.enqueue(IpcCommand::new("b", serde_json::Value::Null, Trigger::Push)));
    }

    #[test]
    fn command_json_omits_unset_conversation() {
        let cmd = IpcCommand::new("ping", serde_json::json!({"x": 1}), Trigger::Scheduled);
        let json = serde_json::to_string(&cmd).unwrap();
        assert!(json.contains(r#""trigger":"scheduled""#));
        assert!(!json.contains("conversation"));
    }
}
