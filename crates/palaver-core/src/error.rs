use thiserror::Error;

/// Process-wide error taxonomy.
///
/// Component crates keep their own narrower enums (`SendError`,
/// `ExtensionError`, …) and convert into this one at the API surface.
#[derive(Debug, Error)]
pub enum PalaverError {
    /// Startup-time misconfiguration. The process does not start.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A stage-local extension failure. Non-fatal for the turn.
    #[error("Extension '{extension}' failed: {reason}")]
    Extension { extension: String, reason: String },

    /// The completion backend failed. Fatal for the turn, triggers the fallback.
    #[error("Completion failed: {0}")]
    Completion(String),

    /// Outbound delivery failed after retries.
    #[error("Send failed ({platform}): {reason}")]
    Send { platform: String, reason: String },

    #[error("Unknown command: {command}")]
    UnknownCommand { command: String },

    /// The conversation's queue is full; the message was not accepted.
    #[error("Conversation {conversation} is busy (queue depth {depth})")]
    Busy { conversation: String, depth: usize },

    /// The conversation was torn down before the work ran to completion.
    #[error("Conversation {conversation} was closed")]
    Cancelled { conversation: String },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PalaverError {
    /// Short error code string returned to HTTP callers.
    pub fn code(&self) -> &'static str {
        match self {
            PalaverError::Configuration(_) => "CONFIG_ERROR",
            PalaverError::Extension { .. } => "EXTENSION_ERROR",
            PalaverError::Completion(_) => "COMPLETION_ERROR",
            PalaverError::Send { .. } => "SEND_ERROR",
            PalaverError::UnknownCommand { .. } => "UNKNOWN_COMMAND",
            PalaverError::Busy { .. } => "BUSY",
            PalaverError::Cancelled { .. } => "CANCELLED",
            PalaverError::Storage(_) => "STORAGE_ERROR",
            PalaverError::Serialization(_) => "SERIALIZATION_ERROR",
            PalaverError::Io(_) => "IO_ERROR",
            PalaverError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn config(reason: impl Into<String>) -> Self {
        PalaverError::Configuration(reason.into())
    }
}

pub type Result<T> = std::result::Result<T, PalaverError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_code_is_stable() {
        let e = PalaverError::Busy {
            conversation: "r1".into(),
            depth: 2,
        };
        assert_eq!(e.code(), "BUSY");
        assert_eq!(e.to_string(), "Conversation r1 is busy (queue depth 2)");
    }
}
