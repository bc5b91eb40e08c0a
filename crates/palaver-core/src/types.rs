use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique key of a logical chat thread.
///
/// Platform adapters choose the value (a telnet connection id, a WhatsApp
/// `wa_id`, a Matrix room id, …). The core treats it as opaque.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConversationId(pub String);

impl ConversationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ConversationId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConversationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Stable lowercase platform name (e.g. `"telnet"`, `"whatsapp"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Platform(pub String);

impl Platform {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for Platform {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for Platform {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Per-turn identifier (random UUID). Correlates logs and fences writes
/// from a turn that is no longer open.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TurnId(pub String);

impl TurnId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TurnId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TurnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which way a message travels relative to the assistant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Typed message payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageContent {
    /// Plain text, the only kind the pipeline sends to completion as-is.
    Text { text: String },
    /// A pointer to media stored elsewhere (audio, image, file, …).
    Media { mime_type: String, uri: String },
    /// Platform-specific structured data (locations, contact cards, …).
    Structured { data: serde_json::Value },
}

impl MessageContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Returns the text when this is a plain-text payload.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            _ => None,
        }
    }

    pub fn is_text(&self) -> bool {
        matches!(self, Self::Text { .. })
    }

    /// Short label used in logs and placeholders.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::Media { .. } => "media",
            Self::Structured { .. } => "structured",
        }
    }
}

/// A single chat message. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub platform: Platform,
    pub conversation_id: ConversationId,
    pub sender: String,
    pub content: MessageContent,
    pub timestamp: DateTime<Utc>,
    pub direction: Direction,
}

impl Message {
    /// Build an inbound message stamped with the current time.
    pub fn inbound(
        platform: impl Into<Platform>,
        conversation_id: impl Into<ConversationId>,
        sender: impl Into<String>,
        content: MessageContent,
    ) -> Self {
        Self {
            platform: platform.into(),
            conversation_id: conversation_id.into(),
            sender: sender.into(),
            content,
            timestamp: Utc::now(),
            direction: Direction::Inbound,
        }
    }

    /// Shorthand for an inbound plain-text message.
    pub fn text(
        platform: impl Into<Platform>,
        conversation_id: impl Into<ConversationId>,
        sender: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self::inbound(platform, conversation_id, sender, MessageContent::text(text))
    }
}

/// Role tag of a context entry, mirroring chat-completion conventions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        };
        write!(f, "{s}")
    }
}

/// One role-tagged entry of a conversation's context window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextEntry {
    pub role: Role,
    pub content: String,
    /// Pinned entries are never evicted by the window budget.
    #[serde(default)]
    pub pinned: bool,
    /// Transient entries only live for the turn that appended them.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub transient: bool,
    /// Name of the extension (or `"pipeline"`) that contributed the entry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl ContextEntry {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            pinned: false,
            transient: false,
            source: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn pinned(mut self) -> Self {
        self.pinned = true;
        self
    }

    pub fn transient(mut self) -> Self {
        self.transient = true;
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// Lifecycle stage an extension attaches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtensionKind {
    /// Framework: `setup()` once at startup.
    Fw,
    /// Out-of-band command handler.
    Ipc,
    /// Command processor for exact-match text commands.
    Cp,
    /// Non-text message handler.
    Mh,
    /// Context contributor.
    Ctx,
    /// Knowledge retrieval.
    Rag,
    /// Response preprocessor.
    Rpp,
    /// Conversational trigger.
    Ct,
}

impl ExtensionKind {
    pub const ALL: [ExtensionKind; 8] = [
        ExtensionKind::Fw,
        ExtensionKind::Ipc,
        ExtensionKind::Cp,
        ExtensionKind::Mh,
        ExtensionKind::Ctx,
        ExtensionKind::Rag,
        ExtensionKind::Rpp,
        ExtensionKind::Ct,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ExtensionKind::Fw => "fw",
            ExtensionKind::Ipc => "ipc",
            ExtensionKind::Cp => "cp",
            ExtensionKind::Mh => "mh",
            ExtensionKind::Ctx => "ctx",
            ExtensionKind::Rag => "rag",
            ExtensionKind::Rpp => "rpp",
            ExtensionKind::Ct => "ct",
        }
    }
}

impl fmt::Display for ExtensionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExtensionKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        ExtensionKind::ALL
            .into_iter()
            .find(|k| k.as_str() == lower)
            .ok_or_else(|| format!("unknown extension kind: {s}"))
    }
}
