//! Local collaborator implementations selected from `[completion]` and
//! `[knowledge]`.

use std::sync::Arc;

use async_trait::async_trait;
use palaver_core::config::{CompletionBackendKind, KnowledgeDocument};
use palaver_core::{
    CompletionBackend, CompletionError, ContextEntry, KnowledgeBackend, KnowledgeError,
    KnowledgeHit, PalaverConfig, Role,
};
use tracing::{info, warn};

pub fn build_completion(config: &PalaverConfig) -> Arc<dyn CompletionBackend> {
    match config.completion.backend {
        CompletionBackendKind::Echo => {
            info!("completion backend: echo");
            Arc::new(EchoBackend)
        }
        CompletionBackendKind::None => {
            warn!("completion backend: none, every turn will use the fallback reply");
            Arc::new(UnavailableBackend)
        }
    }
}

/// `None` when no documents are configured, so RAG factories can refuse
/// to load instead of silently retrieving nothing.
pub fn build_knowledge(config: &PalaverConfig) -> Option<Arc<dyn KnowledgeBackend>> {
    if config.knowledge.documents.is_empty() {
        return None;
    }
    info!(documents = config.knowledge.documents.len(), "keyword knowledge backend loaded");
    Some(Arc::new(KeywordKnowledge::new(config.knowledge.documents.clone())))
}

/// Replies with the most recent user entry.
pub struct EchoBackend;

#[async_trait]
impl CompletionBackend for EchoBackend {
    fn name(&self) -> &str {
        "echo"
    }

    async fn complete(&self, context: &[ContextEntry]) -> Result<String, CompletionError> {
        context
            .iter()
            .rev()
            .find(|e| e.role == Role::User)
            .map(|e| e.content.clone())
            .ok_or_else(|| CompletionError::Parse("no user entry in context".to_string()))
    }
}

pub struct UnavailableBackend;

#[async_trait]
impl CompletionBackend for UnavailableBackend {
    fn name(&self) -> &str {
        "none"
    }

    async fn complete(&self, _context: &[ContextEntry]) -> Result<String, CompletionError> {
        Err(CompletionError::Unavailable(
            "no completion backend configured, set completion.backend in palaver.toml".into(),
        ))
    }
}

/// Scores documents by how many distinct query words appear in their topic
/// or content. Topic matches count double.
pub struct KeywordKnowledge {
    documents: Vec<KnowledgeDocument>,
}

impl KeywordKnowledge {
    pub fn new(documents: Vec<KnowledgeDocument>) -> Self {
        Self { documents }
    }

    fn score(doc: &KnowledgeDocument, words: &[String]) -> f32 {
        let topic = doc.topic.to_lowercase();
        let content = doc.content.to_lowercase();
        words
            .iter()
            .map(|w| {
                let mut s = 0.0;
                if topic.contains(w.as_str()) {
                    s += 2.0;
                }
                if content.contains(w.as_str()) {
                    s += 1.0;
                }
                s
            })
            .sum()
    }
}

fn query_words(text: &str) -> Vec<String> {
    let mut words: Vec<String> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() >= 3)
        .map(str::to_lowercase)
        .collect();
    words.sort();
    words.dedup();
    words
}

#[async_trait]
impl KnowledgeBackend for KeywordKnowledge {
    fn name(&self) -> &str {
        "keyword"
    }

    async fn query(&self, text: &str, limit: usize) -> Result<Vec<KnowledgeHit>, KnowledgeError> {
        let words = query_words(text);
        if words.is_empty() {
            return Ok(Vec::new());
        }

        let mut hits: Vec<KnowledgeHit> = self
            .documents
            .iter()
            .filter_map(|doc| {
                let score = Self::score(doc, &words);
                (score > 0.0).then(|| KnowledgeHit {
                    content: format!("{}: {}", doc.topic, doc.content),
                    score,
                })
            })
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(limit);
        Ok(hits)
    }
}
