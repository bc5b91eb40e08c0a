pub mod client;
pub mod dispatcher;
pub mod error;
pub mod types;

pub use client::PlatformClient;
pub use dispatcher::{PlatformDispatcher, RetryPolicy};
pub use error::SendError;
pub use types::{ChannelStatus, MessageFormat, OutboundMessage, SessionTarget};
