use palaver_core::{ConversationId, Platform};
use serde::{Deserialize, Serialize};

/// A platform session: one conversation on one platform.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionTarget {
    pub platform: Platform,
    pub conversation_id: ConversationId,
}

impl SessionTarget {
    pub fn new(platform: impl Into<Platform>, conversation_id: impl Into<ConversationId>) -> Self {
        Self {
            platform: platform.into(),
            conversation_id: conversation_id.into(),
        }
    }
}

impl std::fmt::Display for SessionTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.platform, self.conversation_id)
    }
}

/// A message to be delivered to a platform session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    /// Content to deliver. May be empty: an empty acknowledgement is valid.
    pub content: String,

    /// Formatting hint for the target platform.
    #[serde(default)]
    pub format: MessageFormat,
}

impl OutboundMessage {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            format: MessageFormat::PlainText,
        }
    }
}

/// Formatting hint for outbound message content.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageFormat {
    #[default]
    PlainText,
    Markdown,
    Html,
}

/// Runtime state of a platform client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    Connected,
    Connecting,
    Disconnected,
    Error(String),
}
