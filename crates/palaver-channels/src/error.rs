use palaver_core::{Platform, PalaverError};
use thiserror::Error;

/// Errors raised while delivering a message to a platform session.
#[derive(Debug, Clone, Error)]
pub enum SendError {
    /// A transport hiccup worth retrying (connection reset, 5xx, rate limit).
    #[error("Transient send failure: {0}")]
    Transient(String),

    /// The operation exceeded its time budget. Retried like `Transient`.
    #[error("Send timed out after {ms}ms")]
    Timeout { ms: u64 },

    /// The conversation/session no longer exists on the platform.
    #[error("Invalid session {conversation} on {platform}")]
    InvalidSession {
        platform: String,
        conversation: String,
    },

    /// The platform refused the payload for good (too large, forbidden, ...).
    #[error("Send rejected: {0}")]
    Rejected(String),

    /// No client is registered for the platform.
    #[error("Unknown platform: {0}")]
    UnknownPlatform(String),

    /// Every retry attempt failed with a transient error.
    #[error("Send failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },
}

impl SendError {
    /// Whether the dispatcher should retry after this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout { .. })
    }

    pub fn into_palaver(self, platform: &Platform) -> PalaverError {
        PalaverError::Send {
            platform: platform.to_string(),
            reason: self.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transport_failures_are_transient() {
        assert!(SendError::Transient("reset".into()).is_transient());
        assert!(SendError::Timeout { ms: 10 }.is_transient());
        assert!(!SendError::Rejected("too long".into()).is_transient());
        assert!(!SendError::UnknownPlatform("irc".into()).is_transient());
        assert!(!SendError::InvalidSession {
            platform: "telnet".into(),
            conversation: "r1".into(),
        }
        .is_transient());
    }

    #[test]
    fn converts_to_send_code() {
        let err = SendError::Rejected("nope".into()).into_palaver(&Platform::from("telnet"));
        assert_eq!(err.code(), "SEND_ERROR");
    }
}
