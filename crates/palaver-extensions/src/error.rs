use palaver_core::PalaverError;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ExtensionError {
    /// The extension returned an error of its own.
    #[error("Extension failed: {0}")]
    Failed(String),

    /// The extension exceeded its wall-clock budget.
    #[error("Extension timed out after {ms}ms")]
    Timeout { ms: u64 },

    /// The extension panicked; the panic was contained at the call boundary.
    #[error("Extension panicked: {0}")]
    Panicked(String),

    /// The payload or options handed to the extension were unusable.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl ExtensionError {
    pub fn failed(reason: impl std::fmt::Display) -> Self {
        Self::Failed(reason.to_string())
    }

    pub fn into_palaver(self, extension: &str) -> PalaverError {
        PalaverError::Extension {
            extension: extension.to_string(),
            reason: self.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ExtensionError>;
