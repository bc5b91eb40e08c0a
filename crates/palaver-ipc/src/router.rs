use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use palaver_core::{IpcCommand, PalaverError, Result};
use palaver_extensions::{guarded, ExtensionRegistry, IpcExtension};
use palaver_pipeline::MessageLifecyclePipeline;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Collects command handlers at startup. Each command name maps to exactly
/// one handler.
pub struct IpcCommandRouterBuilder {
    handlers: HashMap<String, Arc<dyn IpcExtension>>,
    timeout_ms: u64,
}

impl IpcCommandRouterBuilder {
    pub fn new(timeout_ms: u64) -> Self {
        Self {
            handlers: HashMap::new(),
            timeout_ms,
        }
    }

    pub fn register(&mut self, command: impl Into<String>, handler: Arc<dyn IpcExtension>) -> Result<()> {
        let command = command.into();
        if let Some(existing) = self.handlers.get(&command) {
            return Err(PalaverError::Configuration(format!(
                "command '{}' is already handled by '{}', cannot also register '{}'",
                command,
                existing.name(),
                handler.name()
            )));
        }
        debug!(command = %command, extension = handler.name(), "command handler registered");
        self.handlers.insert(command, handler);
        Ok(())
    }

    /// Register `handler` under every command it declares.
    pub fn register_extension(&mut self, handler: Arc<dyn IpcExtension>) -> Result<()> {
        for command in handler.commands() {
            self.register(command, Arc::clone(&handler))?;
        }
        Ok(())
    }

    /// Freeze the table. With a pipeline attached, commands that name a
    /// conversation run inside that conversation's lane.
    pub fn build(self, pipeline: Option<Arc<MessageLifecyclePipeline>>) -> IpcCommandRouter {
        IpcCommandRouter {
            handlers: self.handlers,
            timeout_ms: self.timeout_ms,
            pipeline,
        }
    }
}

/// Routes asynchronous commands by name to their IPC extension.
///
/// Commands run concurrently with each other and with message turns. A
/// command carrying a conversation id is serialized with that
/// conversation's turns, so its handler must not submit a turn for the same
/// conversation and wait on it.
pub struct IpcCommandRouter {
    handlers: HashMap<String, Arc<dyn IpcExtension>>,
    timeout_ms: u64,
    pipeline: Option<Arc<MessageLifecyclePipeline>>,
}

impl IpcCommandRouter {
    pub fn builder(timeout_ms: u64) -> IpcCommandRouterBuilder {
        IpcCommandRouterBuilder::new(timeout_ms)
    }

    /// Build the routing table from every IPC extension in `registry`.
    pub fn from_registry(
        registry: &ExtensionRegistry,
        pipeline: Option<Arc<MessageLifecyclePipeline>>,
        timeout_ms: u64,
    ) -> Result<Self> {
        let mut builder = Self::builder(timeout_ms);
        for handler in registry.ipc() {
            builder.register_extension(handler)?;
        }
        Ok(builder.build(pipeline))
    }

    pub fn contains(&self, command: &str) -> bool {
        self.handlers.contains_key(command)
    }

    /// Registered command names, sorted.
    pub fn commands(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn dispatch(&self, command: IpcCommand) -> Result<Value> {
        let handler = self
            .handlers
            .get(&command.name)
            .cloned()
            .ok_or_else(|| PalaverError::UnknownCommand {
                command: command.name.clone(),
            })?;

        let t = Instant::now();
        let name = command.name.clone();
        let trigger = command.trigger;
        let conversation = command.conversation.clone();
        let extension = handler.name().to_string();
        let timeout_ms = self.timeout_ms;

        let call = async move {
            let label = handler.name().to_string();
            guarded(&label, timeout_ms, handler.handle(&command)).await
        };

        let result = match (conversation, &self.pipeline) {
            (Some(conversation), Some(pipeline)) => pipeline.run_exclusive(&conversation, call).await?,
            _ => call.await,
        };
        let duration_ms = t.elapsed().as_millis() as u64;

        match result {
            Ok(value) => {
                info!(command = %name, ?trigger, extension = %extension, duration_ms, "command handled");
                Ok(value)
            }
            Err(e) => {
                warn!(command = %name, ?trigger, extension = %extension, error = %e, "command failed");
                Err(e.into_palaver(&extension))
            }
        }
    }

    /// Consume `commands` until the queue closes or `shutdown` flips to true.
    /// Each command runs on its own task; failures are logged, not returned.
    pub fn spawn_consumer(
        self: Arc<Self>,
        mut commands: mpsc::Receiver<IpcCommand>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(commands = ?self.commands(), "command router started");
            loop {
                tokio::select! {
                    next = commands.recv() => {
                        let Some(command) = next else { break };
                        let router = Arc::clone(&self);
                        tokio::spawn(async move {
                            let name = command.name.clone();
                            if let Err(e) = router.dispatch(command).await {
                                error!(command = %name, code = e.code(), error = %e, "queued command not handled");
                            }
                        });
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("command router stopped");
        })
    }
}
