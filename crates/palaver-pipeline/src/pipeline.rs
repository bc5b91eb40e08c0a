//! The message-lifecycle orchestrator.
//!
//! `process` runs one turn per inbound message through the fixed stages:
//! RECEIVED → NON_TEXT_HANDLING → CONTEXT_BUILD → KNOWLEDGE_RETRIEVAL →
//! COMPLETION → RESPONSE_PREPROCESS → TRIGGER_DETECTION → DISPATCHED.
//!
//! Turns of one conversation are serialized on that conversation's lane.
//! All context writes of a turn are staged in a `TurnGuard` and committed
//! right before dispatch; a turn that is cancelled or fails part-way leaves
//! the conversation exactly as it found it.

use std::future::Future;
use std::sync::Arc;

use palaver_channels::{OutboundMessage, PlatformDispatcher};
use palaver_context::{ConversationContextStore, TurnGuard};
use palaver_core::{
    ContextEntry, ConversationId, Message, MessageContent, PalaverConfig, PalaverError, Result,
    Role,
};
use palaver_extensions::{guarded, ExtensionError, ExtensionRegistry, TurnContext};
use tokio::sync::oneshot;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::completion::CompletionInvoker;
use crate::lane::ConversationLanes;
use crate::outcome::{Resolution, StageFailure, TurnOutcome, TurnStage};

pub struct MessageLifecyclePipeline {
    config: Arc<PalaverConfig>,
    registry: Arc<ExtensionRegistry>,
    store: Arc<ConversationContextStore>,
    completion: CompletionInvoker,
    dispatcher: Arc<PlatformDispatcher>,
    lanes: ConversationLanes,
}

impl MessageLifecyclePipeline {
    pub fn new(
        config: Arc<PalaverConfig>,
        registry: Arc<ExtensionRegistry>,
        store: Arc<ConversationContextStore>,
        completion: CompletionInvoker,
        dispatcher: Arc<PlatformDispatcher>,
    ) -> Self {
        let lanes = ConversationLanes::new(config.pipeline.queue_depth);
        Self {
            config,
            registry,
            store,
            completion,
            dispatcher,
            lanes,
        }
    }

    pub fn store(&self) -> &Arc<ConversationContextStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<ExtensionRegistry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Arc<PlatformDispatcher> {
        &self.dispatcher
    }

    /// Queue a message on its conversation's lane.
    ///
    /// Returns `Busy` immediately when the lane is full; otherwise the
    /// receiver resolves once the turn has been dispatched (or failed).
    pub fn submit(self: &Arc<Self>, message: Message) -> Result<oneshot::Receiver<Result<TurnOutcome>>> {
        let conversation = message.conversation_id.clone();
        let this = Arc::clone(self);
        self.lanes.submit(&conversation, this.run_turn(message))
    }

    /// Queue a message and wait for its turn to finish.
    pub async fn process(self: &Arc<Self>, message: Message) -> Result<TurnOutcome> {
        let conversation = message.conversation_id.clone();
        let rx = self.submit(message)?;
        rx.await.map_err(|_| PalaverError::Cancelled {
            conversation: conversation.to_string(),
        })?
    }

    /// Run CONTEXT_BUILD alone on a throw-away turn and return the window the
    /// completion backend would have seen (before retrieval). Nothing is
    /// committed.
    pub async fn preview_context(self: &Arc<Self>, message: Message) -> Result<Vec<ContextEntry>> {
        let conversation = message.conversation_id.clone();
        let this = Arc::clone(self);
        self.lanes
            .run_exclusive(&conversation, this.preview_turn(message))
            .await?
    }

    /// Run arbitrary work serialized with the conversation's turns.
    pub async fn run_exclusive<F, T>(&self, conversation: &ConversationId, fut: F) -> Result<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.lanes.run_exclusive(conversation, fut).await
    }

    /// Tear a conversation down: cancels its running turn (discarding the
    /// turn's writes), fails queued messages with `Cancelled`, and drops the
    /// in-memory context once the lane has let go of the turn. Persisted
    /// history is kept.
    pub async fn close(&self, conversation: &ConversationId) -> bool {
        let closed = self.lanes.close(conversation).await;
        self.store.evict(conversation);
        closed
    }

    /// Cancel every lane. Used at shutdown.
    pub fn shutdown(&self) {
        self.lanes.close_all();
    }

    fn extension_timeout_ms(&self) -> u64 {
        self.config.pipeline.extension_timeout_ms
    }

    async fn run_turn(self: Arc<Self>, message: Message) -> Result<TurnOutcome> {
        let guard = self.store.begin_turn(&message.conversation_id).await?;
        let span = info_span!(
            "turn",
            conversation = %message.conversation_id,
            platform = %message.platform,
            turn = %guard.turn_id(),
        );
        self.drive(message, guard).instrument(span).await
    }

    async fn drive(&self, message: Message, guard: TurnGuard) -> Result<TurnOutcome> {
        let turn_id = guard.turn_id().clone();
        let mut failures = Vec::new();
        debug!(stage = %TurnStage::Received, content = message.content.kind(), "turn started");

        if let Some((extension, reply)) = self.run_command(&message, &mut failures).await {
            guard.commit().await?;
            let send_error = self.dispatch(&message, &reply).await;
            return Ok(TurnOutcome {
                turn_id,
                response: Some(reply),
                resolution: Resolution::Command { extension },
                failures,
                send_error,
            });
        }

        let user_entry = match message.content.as_text() {
            Some(text) => ContextEntry::user(text),
            None => {
                debug!(stage = %TurnStage::NonTextHandling, "offering message to handlers");
                if let Some(extension) = self.handle_non_text(&message, &mut failures).await {
                    guard.commit().await?;
                    info!(extension = %extension, "non-text message handled by extension");
                    return Ok(TurnOutcome {
                        turn_id,
                        response: None,
                        resolution: Resolution::Handled { extension },
                        failures,
                        send_error: None,
                    });
                }
                ContextEntry::user(placeholder(&message.content))
            }
        };

        self.build_context(&message, &guard, user_entry, &mut failures).await?;

        if let Some(text) = message.content.as_text() {
            self.retrieve_knowledge(&message, &guard, text, &mut failures).await?;
        }

        debug!(stage = %TurnStage::Completion, "requesting completion");
        let window = guard.snapshot();
        let (response, resolution) = match self.completion.invoke(&window).await {
            Ok(reply) => {
                let response = self.preprocess(&message, &guard, reply, &mut failures).await;
                self.detect_triggers(&message, &response);
                (response, Resolution::Completed)
            }
            Err(e) => {
                warn!("completion failed, sending fallback response");
                (
                    self.config.assistant.fallback_response.clone(),
                    Resolution::Fallback { error: e.to_string() },
                )
            }
        };

        guard.append(ContextEntry::assistant(response.clone()))?;
        guard.commit().await?;
        let send_error = self.dispatch(&message, &response).await;

        Ok(TurnOutcome {
            turn_id,
            response: Some(response),
            resolution,
            failures,
            send_error,
        })
    }

    async fn preview_turn(self: Arc<Self>, message: Message) -> Result<Vec<ContextEntry>> {
        let guard = self.store.begin_turn(&message.conversation_id).await?;
        let entry = match message.content.as_text() {
            Some(text) => ContextEntry::user(text),
            None => ContextEntry::user(placeholder(&message.content)),
        };
        let mut failures = Vec::new();
        self.build_context(&message, &guard, entry, &mut failures).await?;
        let window = guard.snapshot();
        guard.abort();
        Ok(window)
    }

    /// RECEIVED: an exact command match short-circuits the turn.
    async fn run_command(&self, message: &Message, failures: &mut Vec<StageFailure>) -> Option<(String, String)> {
        let text = message.content.as_text()?.trim();
        for ext in self.registry.cp(&message.platform) {
            if !ext.commands().iter().any(|c| c == text) {
                continue;
            }
            let name = ext.name().to_string();
            debug!(stage = %TurnStage::Received, extension = %name, "command matched");
            let reply = match guarded(&name, self.extension_timeout_ms(), ext.process(text, message)).await {
                Ok(reply) => reply,
                Err(e) => {
                    record(failures, TurnStage::Received, &name, e);
                    self.config.assistant.fallback_response.clone()
                }
            };
            return Some((name, reply));
        }
        None
    }

    /// NON_TEXT_HANDLING: the first handler that claims the message wins.
    async fn handle_non_text(&self, message: &Message, failures: &mut Vec<StageFailure>) -> Option<String> {
        for ext in self.registry.mh(&message.platform) {
            match guarded(ext.name(), self.extension_timeout_ms(), ext.handle(message)).await {
                Ok(true) => return Some(ext.name().to_string()),
                Ok(false) => {}
                Err(e) => record(failures, TurnStage::NonTextHandling, ext.name(), e),
            }
        }
        None
    }

    /// CONTEXT_BUILD: CTX contributions first, then the user's own entry.
    async fn build_context(
        &self,
        message: &Message,
        guard: &TurnGuard,
        user_entry: ContextEntry,
        failures: &mut Vec<StageFailure>,
    ) -> Result<()> {
        for ext in self.registry.ctx(&message.platform) {
            let history = guard.snapshot();
            let turn = TurnContext::new(message, &history);
            match guarded(ext.name(), self.extension_timeout_ms(), ext.context_for(&turn)).await {
                Ok(entries) => {
                    debug!(stage = %TurnStage::ContextBuild, extension = ext.name(), added = entries.len(), "context contributed");
                    for entry in entries {
                        guard.append(entry)?;
                    }
                }
                Err(e) => record(failures, TurnStage::ContextBuild, ext.name(), e),
            }
        }
        guard.append(user_entry)?;
        Ok(())
    }

    /// KNOWLEDGE_RETRIEVAL: each cache key is filled at most once per turn.
    async fn retrieve_knowledge(
        &self,
        message: &Message,
        guard: &TurnGuard,
        text: &str,
        failures: &mut Vec<StageFailure>,
    ) -> Result<()> {
        for ext in self.registry.rag(&message.platform) {
            let key = ext.cache_key();
            if guard.scratch_get(key).is_some() {
                debug!(stage = %TurnStage::KnowledgeRetrieval, extension = ext.name(), cache_key = key, "already retrieved this turn");
                continue;
            }
            match guarded(ext.name(), self.extension_timeout_ms(), ext.retrieve(&message.sender, text)).await {
                Ok(entries) => {
                    guard.scratch_put(key, serde_json::to_value(&entries)?)?;
                    debug!(stage = %TurnStage::KnowledgeRetrieval, extension = ext.name(), added = entries.len(), "knowledge retrieved");
                    for entry in entries {
                        guard.append(entry)?;
                    }
                }
                Err(e) => record(failures, TurnStage::KnowledgeRetrieval, ext.name(), e),
            }
        }
        Ok(())
    }

    /// RESPONSE_PREPROCESS: fold the response through every RPP in order.
    async fn preprocess(
        &self,
        message: &Message,
        guard: &TurnGuard,
        reply: String,
        failures: &mut Vec<StageFailure>,
    ) -> String {
        let extensions = self.registry.rpp(&message.platform);
        if extensions.is_empty() {
            return reply;
        }
        let history = guard.snapshot();
        let mut response = reply;
        for ext in extensions {
            let turn = TurnContext::new(message, &history);
            match guarded(ext.name(), self.extension_timeout_ms(), ext.preprocess(&response, &turn)).await {
                Ok(next) => response = next,
                Err(e) => record(failures, TurnStage::ResponsePreprocess, ext.name(), e),
            }
        }
        response
    }

    /// TRIGGER_DETECTION: detectors run detached so they never delay dispatch.
    fn detect_triggers(&self, message: &Message, response: &str) {
        let timeout_ms = self.extension_timeout_ms();
        for ext in self.registry.ct(&message.platform) {
            let response = response.to_string();
            let message = message.clone();
            tokio::spawn(
                async move {
                    let name = ext.name().to_string();
                    if let Err(e) = guarded(&name, timeout_ms, ext.detect(&response, Role::Assistant, &message)).await {
                        warn!(stage = %TurnStage::TriggerDetection, extension = %name, error = %e, "trigger detection failed");
                    }
                }
                .in_current_span(),
            );
        }
    }

    /// DISPATCHED: send failures are logged and reported, never retried here.
    async fn dispatch(&self, message: &Message, response: &str) -> Option<String> {
        let outbound = OutboundMessage::text(response);
        match self
            .dispatcher
            .send(&message.platform, &message.conversation_id, &outbound)
            .await
        {
            Ok(()) => {
                debug!(stage = %TurnStage::Dispatched, chars = response.len(), "response dispatched");
                None
            }
            Err(e) => {
                error!(stage = %TurnStage::Dispatched, error = %e, "response dropped after send failure");
                Some(e.to_string())
            }
        }
    }
}

fn record(failures: &mut Vec<StageFailure>, stage: TurnStage, extension: &str, e: ExtensionError) {
    warn!(stage = %stage, extension, error = %e, "extension failed, skipping its contribution");
    failures.push(StageFailure {
        stage,
        extension: extension.to_string(),
        error: e.to_string(),
    });
}

/// Context entry text standing in for a non-text message nobody handled.
fn placeholder(content: &MessageContent) -> String {
    match content {
        MessageContent::Text { text } => text.clone(),
        MessageContent::Media { mime_type, uri } => format!("[unhandled {mime_type} attachment: {uri}]"),
        MessageContent::Structured { .. } => "[unhandled structured message]".to_string(),
    }
}
