use palaver_core::PalaverError;
use thiserror::Error;

/// Errors raised by the context store and its persistence layer.
#[derive(Debug, Error)]
pub enum ContextError {
    /// A SQLite operation failed.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Stored history could not be (de)serialised.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// `begin_turn` was called while another turn is still open.
    ///
    /// The pipeline's per-conversation lane makes this unreachable in
    /// normal operation; seeing it means a caller bypassed the lane.
    #[error("a turn is already in progress for conversation {conversation}")]
    TurnInProgress { conversation: String },

    #[error("no turn in progress for conversation {conversation}")]
    NoActiveTurn { conversation: String },

    /// The turn was aborted or its conversation evicted; its writes are void.
    #[error("turn is no longer open for conversation {conversation}")]
    TurnClosed { conversation: String },

    /// A blocking storage task failed to complete.
    #[error("storage task failed: {0}")]
    Task(String),
}

impl From<ContextError> for PalaverError {
    fn from(e: ContextError) -> Self {
        match e {
            ContextError::Serialization(e) => PalaverError::Serialization(e),
            ContextError::TurnClosed { conversation } => PalaverError::Cancelled { conversation },
            other => PalaverError::Storage(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, ContextError>;
