use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use tracing::{debug, warn};

use crate::error::{ExtensionError, Result};

/// Run one extension call with a time budget, containing panics.
///
/// Timeouts and panics come back as [`ExtensionError`]s so the caller can
/// apply the stage's failure policy instead of unwinding.
pub async fn guarded<T, F>(extension: &str, timeout_ms: u64, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let t = Instant::now();
    let outcome = tokio::time::timeout(
        Duration::from_millis(timeout_ms),
        AssertUnwindSafe(fut).catch_unwind(),
    )
    .await;
    let duration_ms = t.elapsed().as_millis() as u64;

    let result = match outcome {
        Err(_) => Err(ExtensionError::Timeout { ms: timeout_ms }),
        Ok(Err(panic)) => Err(ExtensionError::Panicked(panic_message(panic.as_ref()))),
        Ok(Ok(r)) => r,
    };

    match &result {
        Ok(_) => debug!(extension, duration_ms, "extension call completed"),
        // Callers decide the failure policy and log it with stage context.
        Err(ExtensionError::Panicked(msg)) => warn!(extension, duration_ms, panic = %msg, "extension panicked"),
        Err(e) => debug!(extension, duration_ms, error = %e, "extension call failed"),
    }
    result
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn passes_through_ok_and_err() {
        let ok = guarded("ok", 1000, async { Ok::<_, ExtensionError>(7) }).await;
        assert_eq!(ok.unwrap(), 7);

        let err = guarded("err", 1000, async { Err::<u8, _>(ExtensionError::failed("boom")) }).await;
        assert!(matches!(err, Err(ExtensionError::Failed(_))));
    }

    #[tokio::test]
    async fn slow_call_times_out() {
        let r = guarded("slow", 10, async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, ExtensionError>(())
        })
        .await;
        assert!(matches!(r, Err(ExtensionError::Timeout { ms: 10 })));
    }

    #[tokio::test]
    async fn panic_is_contained() {
        let explode = true;
        let r: Result<()> = guarded("panicky", 1000, async move {
            if explode {
                panic!("kaboom");
            }
            Ok(())
        })
        .await;
        match r {
            Err(ExtensionError::Panicked(msg)) => assert!(msg.contains("kaboom")),
            other => panic!("expected panic error, got {other:?}"),
        }
    }
}
