//! Explicit construction of every runtime component from configuration.
//!
//! Order matters: the platform dispatcher and the sinks exist before the
//! extension factories run, FW extensions finish `setup()` before the
//! pipeline is created, and the command router is built from the frozen
//! registry.

use std::sync::Arc;
use std::time::Instant;

use palaver_channels::PlatformDispatcher;
use palaver_context::{ConversationContextStore, KeyValueStore, MemoryKeyValueStore, SqliteKeyValueStore};
use palaver_core::config::StorageBackend;
use palaver_core::{CommandSink, InboundSink, IpcCommand, Message, PalaverConfig, PalaverError, Result};
use palaver_extensions::{guarded, ExtensionRegistry, FactoryTable, Services};
use palaver_ipc::{IpcCommandRouter, ScheduleEngine};
use palaver_pipeline::{CompletionInvoker, MessageLifecyclePipeline};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::app::AppState;
use crate::backends::{build_completion, build_knowledge};
use crate::telnet::TelnetClient;

const COMMAND_QUEUE_CAPACITY: usize = 256;
const INBOUND_QUEUE_CAPACITY: usize = 256;

/// Everything `main` needs to start the background tasks.
pub struct Runtime {
    pub state: Arc<AppState>,
    pub commands: mpsc::Receiver<IpcCommand>,
    pub inbound: mpsc::Receiver<Message>,
    pub schedules: ScheduleEngine,
}

pub async fn build(config: PalaverConfig, factories: &FactoryTable) -> Result<Runtime> {
    let config = Arc::new(config);

    let store = Arc::new(build_store(&config)?);

    let telnet = config.telnet.enabled.then(|| Arc::new(TelnetClient::new()));
    let mut dispatcher = PlatformDispatcher::from_config(&config.dispatch);
    if let Some(ref client) = telnet {
        dispatcher.register(client.clone());
    }
    let dispatcher = Arc::new(dispatcher);

    let (commands, commands_rx) = CommandSink::channel(COMMAND_QUEUE_CAPACITY);
    let (inbound, inbound_rx) = InboundSink::channel(INBOUND_QUEUE_CAPACITY);

    let services = Services {
        config: Arc::clone(&config),
        store: Arc::clone(&store),
        dispatcher: Arc::clone(&dispatcher),
        knowledge: build_knowledge(&config),
        commands: commands.clone(),
        inbound,
    };
    let registry = Arc::new(factories.build_registry(&services)?);
    info!(extensions = registry.len(), "extension registry built");

    run_setup(&registry, config.pipeline.extension_timeout_ms).await?;

    let completion = CompletionInvoker::new(build_completion(&config), config.pipeline.completion_timeout_ms)
        .with_debug_conversation(config.pipeline.debug_conversation);

    let pipeline = Arc::new(MessageLifecyclePipeline::new(
        Arc::clone(&config),
        Arc::clone(&registry),
        store,
        completion,
        dispatcher,
    ));

    let router = Arc::new(IpcCommandRouter::from_registry(
        &registry,
        Some(Arc::clone(&pipeline)),
        config.pipeline.extension_timeout_ms,
    )?);

    let schedules = ScheduleEngine::new(&config.schedules, commands.clone());

    let state = Arc::new(AppState {
        config,
        pipeline,
        router,
        commands,
        telnet,
        started_at: Instant::now(),
    });

    Ok(Runtime {
        state,
        commands: commands_rx,
        inbound: inbound_rx,
        schedules,
    })
}

fn build_store(config: &PalaverConfig) -> Result<ConversationContextStore> {
    let budget = config.context.budget;
    if !config.context.persist {
        info!("conversation history is not persisted");
        return Ok(ConversationContextStore::new(budget));
    }

    let kv: Arc<dyn KeyValueStore> = match config.storage.backend {
        StorageBackend::Sqlite => {
            ensure_parent_dir(&config.storage.path);
            info!(path = %config.storage.path, "opening SQLite key-value store");
            Arc::new(SqliteKeyValueStore::open(&config.storage.path)?)
        }
        StorageBackend::Memory => Arc::new(MemoryKeyValueStore::new()),
    };
    Ok(ConversationContextStore::with_persistence(budget, kv))
}

/// Run every FW extension's `setup()` in order. Any failure stops startup.
async fn run_setup(registry: &ExtensionRegistry, timeout_ms: u64) -> Result<()> {
    for fw in registry.fw() {
        guarded(fw.name(), timeout_ms, fw.setup())
            .await
            .map_err(|e| PalaverError::config(format!("extension '{}' setup failed: {e}", fw.name())))?;
        info!(extension = fw.name(), "framework extension ready");
    }
    Ok(())
}

/// Feed synthetic inbound messages (from IPC handlers) into the pipeline.
pub fn spawn_inbound(
    pipeline: Arc<MessageLifecyclePipeline>,
    mut inbound: mpsc::Receiver<Message>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                next = inbound.recv() => {
                    let Some(message) = next else { break };
                    let conversation = message.conversation_id.clone();
                    if let Err(e) = pipeline.submit(message) {
                        warn!(%conversation, code = e.code(), error = %e, "injected message rejected");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

/// Ensure the parent directory for a file path exists.
fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}
