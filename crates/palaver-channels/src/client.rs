use async_trait::async_trait;
use palaver_core::{ConversationId, Platform};

use crate::{
    error::SendError,
    types::{ChannelStatus, OutboundMessage},
};

/// Outbound side of a platform adapter (telnet, instant messaging, ...).
///
/// Implementations must be `Send + Sync`: one client serves every
/// conversation on its platform and is driven from many pipeline lanes at
/// once, so `send` takes `&self`.
#[async_trait]
pub trait PlatformClient: Send + Sync {
    /// Stable lowercase platform identifier (e.g. `"telnet"`). Used as the
    /// dispatcher key and must be unique.
    fn platform(&self) -> Platform;

    /// Deliver one message to a conversation on this platform.
    ///
    /// Return [`SendError::Transient`] or [`SendError::Timeout`] for failures
    /// worth retrying; anything else is reported to the caller immediately.
    async fn send(&self, conversation: &ConversationId, msg: &OutboundMessage) -> Result<(), SendError>;

    fn status(&self) -> ChannelStatus {
        ChannelStatus::Connected
    }
}
