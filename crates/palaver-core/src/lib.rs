//! `palaver-core`: types, error taxonomy, configuration and collaborator
//! traits shared by every palaver crate.

pub mod backend;
pub mod config;
pub mod error;
pub mod ipc;
pub mod types;

pub use backend::{CompletionBackend, CompletionError, KnowledgeBackend, KnowledgeError, KnowledgeHit};
pub use config::PalaverConfig;
pub use error::{PalaverError, Result};
pub use ipc::{CommandSink, InboundSink, IpcCommand, Trigger};
pub use types::{
    ContextEntry, ConversationId, Direction, ExtensionKind, Message, MessageContent, Platform,
    Role, TurnId,
};
