//! Line-oriented TCP platform. Each connection is one conversation.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use palaver_channels::{OutboundMessage, PlatformClient, SendError};
use palaver_core::{ConversationId, Message, PalaverError, Platform};
use palaver_pipeline::MessageLifecyclePipeline;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

pub const PLATFORM: &str = "telnet";

/// Lines a client can type to hang up.
const QUIT_COMMANDS: [&str; 2] = ["\\q", ".quit"];

const OUTBOX_CAPACITY: usize = 32;

/// Outbound side: one writer queue per open connection.
#[derive(Default)]
pub struct TelnetClient {
    connections: DashMap<ConversationId, mpsc::Sender<String>>,
}

impl TelnetClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

#[async_trait]
impl PlatformClient for TelnetClient {
    fn platform(&self) -> Platform {
        Platform::new(PLATFORM)
    }

    async fn send(&self, conversation: &ConversationId, msg: &OutboundMessage) -> Result<(), SendError> {
        let invalid = || SendError::InvalidSession {
            platform: PLATFORM.to_string(),
            conversation: conversation.to_string(),
        };
        let tx = self
            .connections
            .get(conversation)
            .map(|entry| entry.value().clone())
            .ok_or_else(invalid)?;
        tx.send(msg.content.clone()).await.map_err(|_| invalid())
    }
}

/// Accept connections until `shutdown` flips to true.
pub async fn serve(
    listener: TcpListener,
    pipeline: Arc<MessageLifecyclePipeline>,
    client: Arc<TelnetClient>,
    mut shutdown: watch::Receiver<bool>,
) {
    match listener.local_addr() {
        Ok(addr) => info!(%addr, "telnet platform listening"),
        Err(e) => warn!(error = %e, "telnet listener has no local address"),
    }

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let pipeline = Arc::clone(&pipeline);
                        let client = Arc::clone(&client);
                        tokio::spawn(run_connection(stream, peer, pipeline, client));
                    }
                    Err(e) => warn!(error = %e, "telnet accept failed"),
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("telnet platform shutting down");
                    break;
                }
            }
        }
    }
}

/// Per-connection loop: lines in become pipeline messages, replies come
/// back through [`TelnetClient::send`].
async fn run_connection(
    stream: TcpStream,
    peer: SocketAddr,
    pipeline: Arc<MessageLifecyclePipeline>,
    client: Arc<TelnetClient>,
) {
    let conversation = ConversationId::new(format!("telnet-{}", uuid::Uuid::new_v4()));
    info!(%conversation, %peer, "telnet connection opened");

    let (read_half, mut write_half) = stream.into_split();
    let (tx, mut rx) = mpsc::channel::<String>(OUTBOX_CAPACITY);
    client.connections.insert(conversation.clone(), tx.clone());

    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            let line = format!("{}\r\n", text.replace('\n', "\r\n"));
            if write_half.write_all(line.as_bytes()).await.is_err() {
                break;
            }
        }
    });

    let _ = tx
        .send(format!("palaver: connected as {conversation}. Type \\q to quit."))
        .await;

    let mut lines = BufReader::new(read_half).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                debug!(%conversation, error = %e, "telnet read failed");
                break;
            }
        };
        let text = line.trim();
        if text.is_empty() {
            continue;
        }
        if QUIT_COMMANDS.contains(&text) {
            let _ = tx.send("bye".to_string()).await;
            break;
        }

        let message = Message::text(PLATFORM, conversation.clone(), peer.to_string(), text);
        match pipeline.submit(message) {
            // The reply arrives through the dispatcher.
            Ok(_) => {}
            Err(PalaverError::Busy { depth, .. }) => {
                let _ = tx
                    .send(format!("(busy: {depth} messages already waiting, try again shortly)"))
                    .await;
            }
            Err(e) => {
                warn!(%conversation, error = %e, "telnet message not accepted");
                break;
            }
        }
    }

    client.connections.remove(&conversation);
    pipeline.close(&conversation).await;
    drop(tx);
    let _ = writer.await;
    info!(%conversation, %peer, "telnet connection closed");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use palaver_channels::PlatformDispatcher;
    use palaver_context::ConversationContextStore;
    use palaver_core::PalaverConfig;
    use palaver_extensions::ExtensionRegistry;
    use palaver_pipeline::CompletionInvoker;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    use super::*;
    use crate::backends::EchoBackend;

    async fn start() -> (SocketAddr, Arc<TelnetClient>, watch::Sender<bool>) {
        let config = Arc::new(PalaverConfig::default());
        let client = Arc::new(TelnetClient::new());
        let mut dispatcher = PlatformDispatcher::default();
        dispatcher.register(client.clone());

        let pipeline = Arc::new(MessageLifecyclePipeline::new(
            Arc::clone(&config),
            Arc::new(ExtensionRegistry::empty()),
            Arc::new(ConversationContextStore::new(config.context.budget)),
            CompletionInvoker::new(Arc::new(EchoBackend), 1_000),
            Arc::new(dispatcher),
        ));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop, stopped) = watch::channel(false);
        tokio::spawn(serve(listener, pipeline, client.clone(), stopped));
        (addr, client, stop)
    }

    async fn read_line<R: tokio::io::AsyncBufRead + Unpin>(lines: &mut tokio::io::Lines<R>) -> String {
        tokio::time::timeout(Duration::from_secs(2), lines.next_line())
            .await
            .unwrap()
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn line_round_trips_through_pipeline() {
        let (addr, client, _stop) = start().await;
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        assert!(read_line(&mut lines).await.starts_with("palaver: connected as telnet-"));
        assert_eq!(client.connection_count(), 1);

        write_half.write_all(b"hello there\r\n").await.unwrap();
        assert_eq!(read_line(&mut lines).await, "hello there");

        write_half.write_all(b".quit\r\n").await.unwrap();
        assert_eq!(read_line(&mut lines).await, "bye");

        for _ in 0..50 {
            if client.connection_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(client.connection_count(), 0);
    }

    #[tokio::test]
    async fn send_to_closed_connection_is_invalid_session() {
        let client = TelnetClient::new();
        let err = client
            .send(&ConversationId::new("telnet-gone"), &OutboundMessage::text("hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, SendError::InvalidSession { .. }));
        assert!(!err.is_transient());
    }
}
