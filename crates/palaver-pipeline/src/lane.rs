//! Per-conversation serialization.
//!
//! Every conversation gets a lane: a bounded FIFO of jobs drained by one
//! worker task. Jobs of one conversation therefore run strictly one at a
//! time and in arrival order, while lanes of different conversations run
//! in parallel on the runtime's worker pool.

use std::future::Future;

use dashmap::DashMap;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use palaver_core::{ConversationId, PalaverError, Result};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type Job = BoxFuture<'static, ()>;

struct Lane {
    tx: mpsc::Sender<Job>,
    cancel: CancellationToken,
    worker: JoinHandle<()>,
}

/// Lanes keyed by conversation, created lazily on first use.
pub struct ConversationLanes {
    lanes: DashMap<ConversationId, Lane>,
    /// Jobs allowed to wait behind the one that is running.
    depth: usize,
}

impl ConversationLanes {
    pub fn new(depth: usize) -> Self {
        Self {
            lanes: DashMap::new(),
            depth: depth.max(1),
        }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Number of live lanes.
    pub fn len(&self) -> usize {
        self.lanes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lanes.is_empty()
    }

    /// Queue `fut` on the conversation's lane without waiting for it.
    ///
    /// Fails with `Busy` when `depth` jobs are already waiting. The receiver
    /// yields the job's output, or an error if the lane was closed before
    /// the job finished.
    pub fn submit<F, T>(&self, conversation: &ConversationId, fut: F) -> Result<oneshot::Receiver<T>>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job = async move {
            let _ = tx.send(fut.await);
        }
        .boxed();

        let lane = self
            .lanes
            .entry(conversation.clone())
            .or_insert_with(|| self.spawn_lane(conversation));

        match lane.tx.try_send(job) {
            Ok(()) => Ok(rx),
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(conversation = %conversation, depth = self.depth, "lane full");
                Err(PalaverError::Busy {
                    conversation: conversation.to_string(),
                    depth: self.depth,
                })
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(PalaverError::Cancelled {
                conversation: conversation.to_string(),
            }),
        }
    }

    /// Queue `fut` and wait for its output.
    pub async fn run_exclusive<F, T>(&self, conversation: &ConversationId, fut: F) -> Result<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let rx = self.submit(conversation, fut)?;
        rx.await.map_err(|_| PalaverError::Cancelled {
            conversation: conversation.to_string(),
        })
    }

    /// Tear the lane down: the running job is dropped at its next suspension
    /// point and queued jobs are discarded. Resolves once the worker has
    /// dropped them. Returns `false` if there was no lane.
    pub async fn close(&self, conversation: &ConversationId) -> bool {
        let Some((_, lane)) = self.lanes.remove(conversation) else {
            return false;
        };
        lane.cancel.cancel();
        drop(lane.tx);
        if let Err(e) = lane.worker.await {
            warn!(conversation = %conversation, error = %e, "lane worker ended abnormally");
        }
        info!(conversation = %conversation, "conversation lane closed");
        true
    }

    pub fn close_all(&self) {
        for lane in self.lanes.iter() {
            lane.cancel.cancel();
        }
        self.lanes.clear();
    }

    fn spawn_lane(&self, conversation: &ConversationId) -> Lane {
        let (tx, mut rx) = mpsc::channel::<Job>(self.depth);
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let conversation = conversation.clone();

        let worker = tokio::spawn(async move {
            debug!(conversation = %conversation, "lane worker started");
            loop {
                let job = tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    job = rx.recv() => match job {
                        Some(job) => job,
                        None => break,
                    },
                };
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = job => {}
                }
            }
            debug!(conversation = %conversation, "lane worker stopped");
        });

        Lane { tx, cancel, worker }
    }
}

impl Drop for ConversationLanes {
    fn drop(&mut self) {
        self.close_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::sync::Notify;

    #[tokio::test]
    async fn jobs_of_one_conversation_run_in_order() {
        let lanes = ConversationLanes::new(8);
        let conv = ConversationId::from("r1");
        let log = Arc::new(Mutex::new(Vec::new()));

        let mut receivers = Vec::new();
        for i in 0..5 {
            let log = Arc::clone(&log);
            receivers.push(
                lanes
                    .submit(&conv, async move {
                        tokio::time::sleep(Duration::from_millis(5 - i)).await;
                        log.lock().unwrap().push(i);
                    })
                    .unwrap(),
            );
        }
        for rx in receivers {
            rx.await.unwrap();
        }
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn never_two_jobs_at_once_per_conversation() {
        let lanes = ConversationLanes::new(16);
        let conv = ConversationId::from("r1");
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut receivers = Vec::new();
        for _ in 0..10 {
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            receivers.push(
                lanes
                    .submit(&conv, async move {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::task::yield_now().await;
                        active.fetch_sub(1, Ordering::SeqCst);
                    })
                    .unwrap(),
            );
        }
        for rx in receivers {
            rx.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn different_conversations_run_in_parallel() {
        let lanes = ConversationLanes::new(4);
        let gate = Arc::new(Notify::new());

        // r1 blocks until r2 has run; would deadlock if lanes were shared.
        let waiting = Arc::clone(&gate);
        let first = lanes
            .submit(&ConversationId::from("r1"), async move { waiting.notified().await })
            .unwrap();
        let opener = Arc::clone(&gate);
        lanes
            .run_exclusive(&ConversationId::from("r2"), async move { opener.notify_one() })
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), first)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn full_lane_reports_busy() {
        let lanes = ConversationLanes::new(1);
        let conv = ConversationId::from("r1");
        let gate = Arc::new(Notify::new());

        let blocker = Arc::clone(&gate);
        let _running = lanes
            .submit(&conv, async move { blocker.notified().await })
            .unwrap();
        // Let the worker pick up the running job so the queue is empty again.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let _queued = lanes.submit(&conv, async {}).unwrap();

        let err = lanes.submit(&conv, async {}).unwrap_err();
        assert_eq!(err.code(), "BUSY");
        gate.notify_one();
    }

    #[tokio::test]
    async fn close_cancels_running_and_queued_jobs() {
        let lanes = ConversationLanes::new(4);
        let conv = ConversationId::from("r1");

        let running = lanes
            .submit(&conv, async { tokio::time::sleep(Duration::from_secs(60)).await })
            .unwrap();
        let queued = lanes.submit(&conv, async { 1 }).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(lanes.close(&conv).await);
        assert!(running.await.is_err());
        assert!(queued.await.is_err());
        assert!(lanes.is_empty());

        // A fresh lane is created on the next submit.
        assert_eq!(lanes.run_exclusive(&conv, async { 2 }).await.unwrap(), 2);
    }
}
