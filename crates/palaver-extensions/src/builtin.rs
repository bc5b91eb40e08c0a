//! Extensions that ship with palaver, registered under `builtin.*`.

use std::sync::Arc;

use async_trait::async_trait;
use palaver_channels::{OutboundMessage, PlatformDispatcher};
use palaver_context::ConversationContextStore;
use palaver_core::{
    CommandSink, ContextEntry, ConversationId, InboundSink, IpcCommand, KnowledgeBackend, Message,
    PalaverError, Platform, Role, Trigger,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::error::{ExtensionError, Result};
use crate::factory::{FactoryContext, FactoryTable};
use crate::stage::{CpExtension, CtExtension, CtxExtension, Extension, IpcExtension, RagExtension, TurnContext};

pub const PERSONA: &str = "builtin.persona";
pub const CLEAR_HISTORY: &str = "builtin.clear_history";
pub const KNOWLEDGE: &str = "builtin.knowledge";
pub const KEYWORD_TRIGGER: &str = "builtin.keyword_trigger";
pub const INJECT_MESSAGE: &str = "builtin.inject_message";
pub const SEND_MESSAGE: &str = "builtin.send_message";

pub const CLEARED_REPLY: &str = "Context cleared.";
const DEFAULT_KNOWLEDGE_LIMIT: usize = 3;

pub(crate) fn register_all(table: &mut FactoryTable) {
    table.register(PERSONA, |ctx: &FactoryContext<'_>| {
        let text = ctx
            .option_str("text")
            .map(str::to_string)
            .unwrap_or_else(|| ctx.services.config.assistant.persona.clone());
        Ok(Extension::Ctx(Arc::new(Persona::new(text))))
    });

    table.register(CLEAR_HISTORY, |ctx: &FactoryContext<'_>| {
        let command = ctx
            .option_str("command")
            .map(str::to_string)
            .unwrap_or_else(|| ctx.services.config.commands.clear.clone());
        Ok(Extension::Cp(Arc::new(ClearHistory::new(
            command,
            Arc::clone(&ctx.services.store),
        ))))
    });

    table.register(KNOWLEDGE, |ctx: &FactoryContext<'_>| {
        let backend = ctx.services.knowledge.clone().ok_or_else(|| {
            PalaverError::config(format!("{} needs a knowledge backend", ctx.module))
        })?;
        let cache_key = ctx.option_str("cache_key").unwrap_or(ctx.module).to_string();
        let limit = ctx
            .option_u64("limit")
            .map(|n| n as usize)
            .unwrap_or(DEFAULT_KNOWLEDGE_LIMIT);
        Ok(Extension::Rag(Arc::new(Knowledge {
            backend,
            cache_key,
            limit,
            shared: ctx.option_bool("shared_cache"),
        })))
    });

    table.register(KEYWORD_TRIGGER, |ctx: &FactoryContext<'_>| {
        let command = ctx.require_str("command")?.to_string();
        let phrases = ctx.option_strings("phrases");
        if phrases.is_empty() {
            return Err(PalaverError::config(format!(
                "{} needs at least one phrase",
                ctx.module
            )));
        }
        Ok(Extension::Ct(Arc::new(KeywordTrigger::new(
            phrases,
            command,
            ctx.services.commands.clone(),
        ))))
    });

    table.register(INJECT_MESSAGE, |ctx: &FactoryContext<'_>| {
        Ok(Extension::Ipc(Arc::new(InjectMessage {
            inbound: ctx.services.inbound.clone(),
        })))
    });

    table.register(SEND_MESSAGE, |ctx: &FactoryContext<'_>| {
        Ok(Extension::Ipc(Arc::new(SendMessage {
            dispatcher: Arc::clone(&ctx.services.dispatcher),
        })))
    });
}

// ---------------------------------------------------------------------------
// CTX
// ---------------------------------------------------------------------------

/// Adds the persona as a pinned system entry the first time a conversation
/// is seen.
pub struct Persona {
    text: String,
}

impl Persona {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

#[async_trait]
impl CtxExtension for Persona {
    fn name(&self) -> &str {
        PERSONA
    }

    async fn context_for(&self, turn: &TurnContext<'_>) -> Result<Vec<ContextEntry>> {
        if self.text.trim().is_empty() || turn.has_entry_from(PERSONA) {
            return Ok(Vec::new());
        }
        Ok(vec![ContextEntry::system(self.text.clone())
            .pinned()
            .with_source(PERSONA)])
    }
}

// ---------------------------------------------------------------------------
// CP
// ---------------------------------------------------------------------------

pub struct ClearHistory {
    command: String,
    store: Arc<ConversationContextStore>,
}

impl ClearHistory {
    pub fn new(command: impl Into<String>, store: Arc<ConversationContextStore>) -> Self {
        Self {
            command: command.into(),
            store,
        }
    }
}

#[async_trait]
impl CpExtension for ClearHistory {
    fn name(&self) -> &str {
        CLEAR_HISTORY
    }

    fn commands(&self) -> Vec<String> {
        vec![self.command.clone()]
    }

    async fn process(&self, _command: &str, message: &Message) -> Result<String> {
        self.store
            .clear(&message.conversation_id)
            .await
            .map_err(ExtensionError::failed)?;
        info!(conversation = %message.conversation_id, "conversation history cleared");
        Ok(CLEARED_REPLY.to_string())
    }
}

// ---------------------------------------------------------------------------
// RAG
// ---------------------------------------------------------------------------

pub struct Knowledge {
    backend: Arc<dyn KnowledgeBackend>,
    cache_key: String,
    limit: usize,
    shared: bool,
}

#[async_trait]
impl RagExtension for Knowledge {
    fn name(&self) -> &str {
        KNOWLEDGE
    }

    fn cache_key(&self) -> &str {
        &self.cache_key
    }

    fn shared_cache(&self) -> bool {
        self.shared
    }

    async fn retrieve(&self, sender: &str, text: &str) -> Result<Vec<ContextEntry>> {
        let hits = self
            .backend
            .query(text, self.limit)
            .await
            .map_err(ExtensionError::failed)?;
        debug!(sender, backend = self.backend.name(), hits = hits.len(), "knowledge retrieved");
        Ok(hits.into_iter().map(|h| h.into_entry(KNOWLEDGE)).collect())
    }
}

// ---------------------------------------------------------------------------
// CT
// ---------------------------------------------------------------------------

/// Enqueues an IPC command when the response mentions one of its phrases.
pub struct KeywordTrigger {
    phrases: Vec<String>,
    command: String,
    sink: CommandSink,
}

impl KeywordTrigger {
    pub fn new(phrases: Vec<String>, command: impl Into<String>, sink: CommandSink) -> Self {
        Self {
            phrases: phrases.into_iter().map(|p| p.to_lowercase()).collect(),
            command: command.into(),
            sink,
        }
    }

    fn matches(&self, response: &str) -> Option<&str> {
        let haystack = response.to_lowercase();
        self.phrases
            .iter()
            .find(|p| haystack.contains(p.as_str()))
            .map(String::as_str)
    }
}

#[async_trait]
impl CtExtension for KeywordTrigger {
    fn name(&self) -> &str {
        KEYWORD_TRIGGER
    }

    async fn detect(&self, response: &str, role: Role, message: &Message) -> Result<()> {
        let Some(phrase) = self.matches(response) else {
            return Ok(());
        };
        let payload = json!({
            "phrase": phrase,
            "response": response,
            "role": role,
            "sender": message.sender,
        });
        let command = IpcCommand::new(self.command.clone(), payload, Trigger::Detected)
            .for_conversation(message.platform.clone(), message.conversation_id.clone());
        if !self.sink.enqueue(command) {
            return Err(ExtensionError::failed("command queue is full"));
        }
        debug!(command = %self.command, phrase, "trigger fired");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// IPC
// ---------------------------------------------------------------------------

/// Payload shared by the message-producing IPC commands. `platform` and
/// `conversation` fall back to the command's own routing fields.
#[derive(Debug, Deserialize)]
struct MessagePayload {
    platform: Option<String>,
    conversation: Option<String>,
    sender: Option<String>,
    text: String,
}

impl MessagePayload {
    fn parse(command: &IpcCommand) -> Result<(Platform, ConversationId, Option<String>, String)> {
        let p: MessagePayload = serde_json::from_value(command.payload.clone())
            .map_err(|e| ExtensionError::InvalidInput(e.to_string()))?;
        let platform = p
            .platform
            .map(Platform::from)
            .or_else(|| command.platform.clone())
            .ok_or_else(|| ExtensionError::InvalidInput("missing platform".into()))?;
        let conversation = p
            .conversation
            .map(ConversationId::from)
            .or_else(|| command.conversation.clone())
            .ok_or_else(|| ExtensionError::InvalidInput("missing conversation".into()))?;
        Ok((platform, conversation, p.sender, p.text))
    }
}

/// `inject_message`: feed a synthetic text message into the pipeline.
pub struct InjectMessage {
    inbound: InboundSink,
}

#[async_trait]
impl IpcExtension for InjectMessage {
    fn name(&self) -> &str {
        INJECT_MESSAGE
    }

    fn commands(&self) -> Vec<String> {
        vec!["inject_message".to_string()]
    }

    async fn handle(&self, command: &IpcCommand) -> Result<Value> {
        let (platform, conversation, sender, text) = MessagePayload::parse(command)?;
        let sender = sender.unwrap_or_else(|| "ipc".to_string());
        let message = Message::text(platform, conversation.clone(), sender, text);
        if !self.inbound.enqueue(message) {
            return Err(ExtensionError::failed("inbound queue is full"));
        }
        Ok(json!({ "queued": true, "conversation": conversation }))
    }
}

/// `send_message`: deliver text straight through the dispatcher.
pub struct SendMessage {
    dispatcher: Arc<PlatformDispatcher>,
}

#[async_trait]
impl IpcExtension for SendMessage {
    fn name(&self) -> &str {
        SEND_MESSAGE
    }

    fn commands(&self) -> Vec<String> {
        vec!["send_message".to_string()]
    }

    async fn handle(&self, command: &IpcCommand) -> Result<Value> {
        let (platform, conversation, _, text) = MessagePayload::parse(command)?;
        self.dispatcher
            .send(&platform, &conversation, &OutboundMessage::text(text))
            .await
            .map_err(ExtensionError::failed)?;
        Ok(json!({ "delivered": true }))
    }
}
