//! One capability trait per stage kind.
//!
//! Extensions never hold a reference to a conversation's context across
//! turns: everything a stage needs is passed in, and anything they want to
//! add is returned to the pipeline, which appends it through the context
//! store.

use std::sync::Arc;

use async_trait::async_trait;
use palaver_core::{ContextEntry, ExtensionKind, IpcCommand, Message, Role};

use crate::error::Result;

/// Read-only view of the turn in progress.
#[derive(Debug, Clone, Copy)]
pub struct TurnContext<'a> {
    pub message: &'a Message,
    /// Snapshot of the window when the extension is called, including what
    /// earlier extensions contributed this turn.
    pub history: &'a [ContextEntry],
}

impl<'a> TurnContext<'a> {
    pub fn new(message: &'a Message, history: &'a [ContextEntry]) -> Self {
        Self { message, history }
    }

    /// Whether some earlier entry was contributed by `source`.
    pub fn has_entry_from(&self, source: &str) -> bool {
        self.history.iter().any(|e| e.source.as_deref() == Some(source))
    }
}

/// Startup-only setup (FW).
#[async_trait]
pub trait FwExtension: Send + Sync {
    fn name(&self) -> &str;

    async fn setup(&self) -> Result<()>;
}

/// Out-of-band command handler (IPC).
#[async_trait]
pub trait IpcExtension: Send + Sync {
    fn name(&self) -> &str;

    /// Command names this extension answers to.
    fn commands(&self) -> Vec<String>;

    async fn handle(&self, command: &IpcCommand) -> Result<serde_json::Value>;
}

/// Exact-match text commands that bypass completion (CP).
#[async_trait]
pub trait CpExtension: Send + Sync {
    fn name(&self) -> &str;

    fn commands(&self) -> Vec<String>;

    /// Returns the reply sent back to the conversation.
    async fn process(&self, command: &str, message: &Message) -> Result<String>;
}

/// Non-text message handler (MH).
#[async_trait]
pub trait MhExtension: Send + Sync {
    fn name(&self) -> &str;

    /// `Ok(true)` claims the message; no further MH extension sees it.
    async fn handle(&self, message: &Message) -> Result<bool>;
}

/// Context contributor (CTX).
#[async_trait]
pub trait CtxExtension: Send + Sync {
    fn name(&self) -> &str;

    async fn context_for(&self, turn: &TurnContext<'_>) -> Result<Vec<ContextEntry>>;
}

/// Knowledge retrieval (RAG).
#[async_trait]
pub trait RagExtension: Send + Sync {
    fn name(&self) -> &str;

    /// Scratch-cache key. Results are reused for the rest of the turn.
    fn cache_key(&self) -> &str;

    /// Opt in to sharing `cache_key` with other RAG extensions.
    fn shared_cache(&self) -> bool {
        false
    }

    async fn retrieve(&self, sender: &str, text: &str) -> Result<Vec<ContextEntry>>;
}

/// Response rewrite (RPP). Runs as a fold over the configured order.
#[async_trait]
pub trait RppExtension: Send + Sync {
    fn name(&self) -> &str;

    async fn preprocess(&self, response: &str, turn: &TurnContext<'_>) -> Result<String>;
}

/// Trigger detection (CT). Runs detached from the turn.
#[async_trait]
pub trait CtExtension: Send + Sync {
    fn name(&self) -> &str;

    async fn detect(&self, response: &str, role: Role, message: &Message) -> Result<()>;
}

/// A loaded extension, tagged by the stage it runs in.
#[derive(Clone)]
pub enum Extension {
    Fw(Arc<dyn FwExtension>),
    Ipc(Arc<dyn IpcExtension>),
    Cp(Arc<dyn CpExtension>),
    Mh(Arc<dyn MhExtension>),
    Ctx(Arc<dyn CtxExtension>),
    Rag(Arc<dyn RagExtension>),
    Rpp(Arc<dyn RppExtension>),
    Ct(Arc<dyn CtExtension>),
}

impl Extension {
    pub fn kind(&self) -> ExtensionKind {
        match self {
            Extension::Fw(_) => ExtensionKind::Fw,
            Extension::Ipc(_) => ExtensionKind::Ipc,
            Extension::Cp(_) => ExtensionKind::Cp,
            Extension::Mh(_) => ExtensionKind::Mh,
            Extension::Ctx(_) => ExtensionKind::Ctx,
            Extension::Rag(_) => ExtensionKind::Rag,
            Extension::Rpp(_) => ExtensionKind::Rpp,
            Extension::Ct(_) => ExtensionKind::Ct,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Extension::Fw(e) => e.name(),
            Extension::Ipc(e) => e.name(),
            Extension::Cp(e) => e.name(),
            Extension::Mh(e) => e.name(),
            Extension::Ctx(e) => e.name(),
            Extension::Rag(e) => e.name(),
            Extension::Rpp(e) => e.name(),
            Extension::Ct(e) => e.name(),
        }
    }
}

impl std::fmt::Debug for Extension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Extension")
            .field(&self.kind())
            .field(&self.name())
            .finish()
    }
}
