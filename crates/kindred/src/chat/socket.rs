//! Per-conversation streaming connection.
//!
//! A [`SessionSocket`] is one open WebSocket bound to one conversation.
//! Inbound frames are exposed as a stream that ends when the connection
//! does; outbound text is queued and written by a background task.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use kindred_protocol::chat::{InboundFrame, OutboundFrame};

use super::error::{ChatError, ChatResult};

/// How long `close` waits for the io task before aborting it.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Decoded inbound frames, in arrival order.
pub type InboundStream = BoxStream<'static, InboundFrame>;

/// One live connection for one conversation.
#[async_trait]
pub trait SessionSocket: Send {
    fn conversation_id(&self) -> &str;

    /// Queue `text` for delivery. Dropped if the connection is gone.
    fn send(&self, text: &str);

    /// Hand out the inbound stream. Only the first call returns it.
    fn take_inbound(&mut self) -> Option<InboundStream>;

    /// Close the connection. Calling it again does nothing.
    async fn close(&mut self);
}

/// Opens session sockets.
#[async_trait]
pub trait SocketConnector: Send + Sync {
    async fn connect(
        &self,
        conversation_id: &str,
        access_token: &str,
    ) -> ChatResult<Box<dyn SessionSocket>>;
}

/// Connector for `{ws_base}/{conversation_id}/?token={access}`.
#[derive(Debug, Clone)]
pub struct WsConnector {
    ws_base: String,
}

impl WsConnector {
    pub fn new(ws_base: impl Into<String>) -> Self {
        Self {
            ws_base: ws_base.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn url_for(&self, conversation_id: &str, access_token: &str) -> String {
        format!(
            "{}/{}/?token={}",
            self.ws_base,
            urlencoding::encode(conversation_id),
            urlencoding::encode(access_token)
        )
    }
}

#[async_trait]
impl SocketConnector for WsConnector {
    async fn connect(
        &self,
        conversation_id: &str,
        access_token: &str,
    ) -> ChatResult<Box<dyn SessionSocket>> {
        let url = self.url_for(conversation_id, access_token);
        let (ws, _response) = connect_async(url.as_str())
            .await
            .map_err(|e| ChatError::Connect {
                conversation: conversation_id.to_string(),
                message: e.to_string(),
            })?;
        info!("Chat connected for conversation {}", conversation_id);
        Ok(Box::new(WsSessionSocket::spawn(
            conversation_id.to_string(),
            ws,
        )))
    }
}

/// WebSocket-backed [`SessionSocket`].
pub struct WsSessionSocket {
    conversation_id: String,
    outbound: mpsc::UnboundedSender<String>,
    inbound: Option<InboundStream>,
    shutdown: Option<oneshot::Sender<()>>,
    io_task: Option<JoinHandle<()>>,
}

impl WsSessionSocket {
    fn spawn<S>(conversation_id: String, ws: tokio_tungstenite::WebSocketStream<S>) -> Self
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let (mut ws_write, mut ws_read) = ws.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<InboundFrame>();
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let conversation = conversation_id.clone();

        let io_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        let _ = ws_write.send(Message::Close(None)).await;
                        break;
                    }
                    Some(text) = outbound_rx.recv() => {
                        if let Err(e) = ws_write.send(Message::Text(text.into())).await {
                            warn!("Chat send failed for {}: {}", conversation, e);
                            break;
                        }
                    }
                    frame = ws_read.next() => match frame {
                        Some(Ok(Message::Text(text))) => {
                            match serde_json::from_str::<InboundFrame>(&text) {
                                Ok(frame) => {
                                    let _ = inbound_tx.send(frame);
                                }
                                Err(e) => warn!("Skipping undecodable chat frame: {}", e),
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            debug!("Chat connection for {} closed by peer", conversation);
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!("Chat connection for {} failed: {}", conversation, e);
                            break;
                        }
                    }
                }
            }
        });

        Self {
            conversation_id,
            outbound: outbound_tx,
            inbound: Some(UnboundedReceiverStream::new(inbound_rx).boxed()),
            shutdown: Some(shutdown_tx),
            io_task: Some(io_task),
        }
    }
}

#[async_trait]
impl SessionSocket for WsSessionSocket {
    fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    fn send(&self, text: &str) {
        let payload = match serde_json::to_string(&OutboundFrame::new(text)) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Failed to encode chat message: {}", e);
                return;
            }
        };
        if self.outbound.send(payload).is_err() {
            debug!(
                "Chat connection for {} is gone, dropping message",
                self.conversation_id
            );
        }
    }

    fn take_inbound(&mut self) -> Option<InboundStream> {
        self.inbound.take()
    }

    async fn close(&mut self) {
        let Some(shutdown) = self.shutdown.take() else {
            return;
        };
        let _ = shutdown.send(());
        if let Some(mut task) = self.io_task.take() {
            if tokio::time::timeout(CLOSE_TIMEOUT, &mut task).await.is_err() {
                warn!(
                    "Chat connection for {} did not shut down in {:?}, aborting",
                    self.conversation_id, CLOSE_TIMEOUT
                );
                task.abort();
            }
        }
        debug!("Chat connection for {} closed", self.conversation_id);
    }
}

impl Drop for WsSessionSocket {
    fn drop(&mut self) {
        if let Some(task) = self.io_task.take() {
            task.abort();
        }
    }
}
