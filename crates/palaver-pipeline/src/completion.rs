use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use palaver_core::{CompletionBackend, CompletionError, ContextEntry};
use tracing::{debug, error, info};

/// Calls the completion backend once per turn, under a time budget.
pub struct CompletionInvoker {
    backend: Arc<dyn CompletionBackend>,
    timeout_ms: u64,
    debug_conversation: bool,
}

impl CompletionInvoker {
    pub fn new(backend: Arc<dyn CompletionBackend>, timeout_ms: u64) -> Self {
        Self {
            backend,
            timeout_ms,
            debug_conversation: false,
        }
    }

    /// Log the full window sent to the backend at debug level.
    pub fn with_debug_conversation(mut self, enabled: bool) -> Self {
        self.debug_conversation = enabled;
        self
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub async fn invoke(&self, context: &[ContextEntry]) -> Result<String, CompletionError> {
        if self.debug_conversation {
            debug!(entries = ?context, "completion context");
        }

        let t = Instant::now();
        let call = AssertUnwindSafe(self.backend.complete(context)).catch_unwind();
        let result = match tokio::time::timeout(Duration::from_millis(self.timeout_ms), call).await {
            Err(_) => Err(CompletionError::Timeout { ms: self.timeout_ms }),
            Ok(Err(_)) => Err(CompletionError::Unavailable("backend panicked".to_string())),
            Ok(Ok(r)) => r,
        };
        let latency_ms = t.elapsed().as_millis() as u64;

        match &result {
            Ok(text) => info!(
                backend = self.backend.name(),
                entries = context.len(),
                chars = text.len(),
                latency_ms,
                "completion finished"
            ),
            Err(e) => error!(
                backend = self.backend.name(),
                latency_ms,
                error = %e,
                "completion failed"
            ),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct Slow;

    #[async_trait]
    impl CompletionBackend for Slow {
        fn name(&self) -> &str {
            "slow"
        }

        async fn complete(&self, _context: &[ContextEntry]) -> Result<String, CompletionError> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok("late".into())
        }
    }

    struct LastUser;

    #[async_trait]
    impl CompletionBackend for LastUser {
        fn name(&self) -> &str {
            "last-user"
        }

        async fn complete(&self, context: &[ContextEntry]) -> Result<String, CompletionError> {
            context
                .last()
                .map(|e| e.content.clone())
                .ok_or_else(|| CompletionError::Parse("empty context".into()))
        }
    }

    #[tokio::test]
    async fn returns_backend_reply() {
        let invoker = CompletionInvoker::new(Arc::new(LastUser), 1000);
        let reply = invoker.invoke(&[ContextEntry::user("ping")]).await.unwrap();
        assert_eq!(reply, "ping");
    }

    #[tokio::test]
    async fn backend_error_passes_through() {
        let invoker = CompletionInvoker::new(Arc::new(LastUser), 1000);
        assert!(matches!(invoker.invoke(&[]).await, Err(CompletionError::Parse(_))));
    }

    #[tokio::test]
    async fn slow_backend_times_out() {
        let invoker = CompletionInvoker::new(Arc::new(Slow), 20);
        assert!(matches!(
            invoker.invoke(&[]).await,
            Err(CompletionError::Timeout { ms: 20 })
        ));
    }
}
