use std::fmt;

use palaver_core::TurnId;
use serde::Serialize;

/// Fixed lifecycle stages of one turn, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TurnStage {
    Received,
    NonTextHandling,
    ContextBuild,
    KnowledgeRetrieval,
    Completion,
    ResponsePreprocess,
    TriggerDetection,
    Dispatched,
}

impl TurnStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnStage::Received => "RECEIVED",
            TurnStage::NonTextHandling => "NON_TEXT_HANDLING",
            TurnStage::ContextBuild => "CONTEXT_BUILD",
            TurnStage::KnowledgeRetrieval => "KNOWLEDGE_RETRIEVAL",
            TurnStage::Completion => "COMPLETION",
            TurnStage::ResponsePreprocess => "RESPONSE_PREPROCESS",
            TurnStage::TriggerDetection => "TRIGGER_DETECTION",
            TurnStage::Dispatched => "DISPATCHED",
        }
    }
}

impl fmt::Display for TurnStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A non-fatal extension failure recorded during a turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageFailure {
    pub stage: TurnStage,
    pub extension: String,
    pub error: String,
}

/// How the turn produced its response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Resolution {
    /// The completion backend answered.
    Completed,
    /// Completion failed and the fallback text was used.
    Fallback { error: String },
    /// A command processor answered without calling completion.
    Command { extension: String },
    /// A non-text handler claimed the message; nothing was sent.
    Handled { extension: String },
}

/// Summary of a finished turn.
#[derive(Debug, Clone, Serialize)]
pub struct TurnOutcome {
    pub turn_id: TurnId,
    /// Text handed to the dispatcher. `None` when a handler claimed the message.
    pub response: Option<String>,
    pub resolution: Resolution,
    pub failures: Vec<StageFailure>,
    /// Set when delivery failed after retries. The turn still counts as complete.
    pub send_error: Option<String>,
}

impl TurnOutcome {
    pub fn is_fallback(&self) -> bool {
        matches!(self.resolution, Resolution::Fallback { .. })
    }

    pub fn failures_in(&self, stage: TurnStage) -> impl Iterator<Item = &StageFailure> {
        self.failures.iter().filter(move |f| f.stage == stage)
    }
}
