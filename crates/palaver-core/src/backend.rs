//! Collaborator interfaces consumed by the pipeline at runtime.
//!
//! Concrete language-model and retrieval backends live outside the core;
//! they are reached only through these traits.

use async_trait::async_trait;
use thiserror::Error;

use crate::types::{ContextEntry, Role};

#[derive(Debug, Clone, Error)]
pub enum CompletionError {
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("Backend returned an error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Completion timed out after {ms}ms")]
    Timeout { ms: u64 },

    #[error("Malformed backend response: {0}")]
    Parse(String),
}

/// Produces the assistant's reply for an assembled context window.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    /// Backend name for logging.
    fn name(&self) -> &str;

    async fn complete(&self, context: &[ContextEntry]) -> Result<String, CompletionError>;
}

/// A ranked knowledge hit returned by a [`KnowledgeBackend`].
#[derive(Debug, Clone, PartialEq)]
pub struct KnowledgeHit {
    pub content: String,
    /// Higher is more relevant. Only the order matters to callers.
    pub score: f32,
}

impl KnowledgeHit {
    /// Convert into a context entry suitable for the current turn only.
    pub fn into_entry(self, source: &str) -> ContextEntry {
        ContextEntry::new(Role::System, self.content)
            .transient()
            .with_source(source)
    }
}

#[derive(Debug, Clone, Error)]
#[error("Knowledge query failed: {0}")]
pub struct KnowledgeError(pub String);

/// Retrieval collaborator used by RAG extensions.
#[async_trait]
pub trait KnowledgeBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Return hits ordered best-first.
    async fn query(&self, text: &str, limit: usize) -> Result<Vec<KnowledgeHit>, KnowledgeError>;
}
