pub mod db;
pub mod error;
pub mod kv;
pub mod store;
pub mod window;

pub use error::ContextError;
pub use kv::{KeyValueStore, MemoryKeyValueStore, SqliteKeyValueStore};
pub use store::{ConversationContextStore, TurnGuard};
