//! Chat session manager.
//!
//! Owns the single active chat session of the client. Opening a
//! conversation tears down the previous socket, loads history, then goes
//! live. Every `open`/`close` bumps a generation counter; results that
//! arrive for an older generation (late history, late handshakes, late
//! frames) are discarded.

use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use chrono::Utc;
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::{Mutex, broadcast, oneshot};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, instrument, warn};

use super::error::{ChatError, ChatResult};
use super::history::HistoryFetcher;
use super::log::{ChatMessage, MessageLog};
use super::socket::{InboundStream, SessionSocket, SocketConnector};
use crate::auth::CredentialStore;

/// Broadcast buffer for session events.
const EVENT_BUFFER_SIZE: usize = 256;

/// Source of the signed-in user's id.
pub trait IdentityProvider: Send + Sync {
    fn current_user_id(&self) -> Option<String>;
}

/// Identity fixed at construction.
#[derive(Debug, Clone)]
pub struct StaticIdentity(pub String);

impl IdentityProvider for StaticIdentity {
    fn current_user_id(&self) -> Option<String> {
        Some(self.0.clone())
    }
}

/// Lifecycle of the managed session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "conversation_id", rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Loading(String),
    Live(String),
}

/// How an `open` call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenOutcome {
    /// The session for the requested conversation is live.
    Live,
    /// A later `open` or `close` took over before this one finished.
    Superseded,
}

/// Changes to the managed session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    /// The log was emptied and bound to a new conversation.
    Reset { conversation_id: String },
    /// History was merged into the log.
    HistoryLoaded { conversation_id: String, count: usize },
    /// A live message was appended.
    Message {
        conversation_id: String,
        message: ChatMessage,
    },
    /// The server side of the connection went away.
    StreamClosed { conversation_id: String },
    /// The session was closed by the caller.
    Closed,
}

struct SessionInner {
    generation: u64,
    state: SessionState,
    log: MessageLog,
    socket: Option<Box<dyn SessionSocket>>,
    pump: Option<JoinHandle<()>>,
    /// Cancels the handshake of the current generation while it is running.
    connecting: Option<oneshot::Sender<()>>,
}

struct Shared {
    inner: Mutex<SessionInner>,
    events: broadcast::Sender<ChatEvent>,
    /// Copy of the pump's abort handle, reachable without the async lock.
    pump_abort: StdMutex<Option<AbortHandle>>,
}

impl Shared {
    fn emit(&self, event: ChatEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn set_pump_abort(&self, handle: Option<AbortHandle>) {
        *self
            .pump_abort
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = handle;
    }
}

/// Single-session chat orchestrator.
pub struct ChatSessionManager {
    shared: Arc<Shared>,
    history: HistoryFetcher,
    connector: Arc<dyn SocketConnector>,
    credentials: Arc<dyn CredentialStore>,
    identity: Arc<dyn IdentityProvider>,
}

impl ChatSessionManager {
    pub fn new(
        history: HistoryFetcher,
        connector: Arc<dyn SocketConnector>,
        credentials: Arc<dyn CredentialStore>,
        identity: Arc<dyn IdentityProvider>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER_SIZE);
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(SessionInner {
                    generation: 0,
                    state: SessionState::Idle,
                    log: MessageLog::new(),
                    socket: None,
                    pump: None,
                    connecting: None,
                }),
                events,
                pump_abort: StdMutex::new(None),
            }),
            history,
            connector,
            credentials,
            identity,
        }
    }

    /// Switch to `conversation_id`.
    ///
    /// Returns [`OpenOutcome::Superseded`] when another `open` or `close`
    /// started before this one went live. History failures leave an empty
    /// log; connection failures are returned and not retried.
    #[instrument(skip(self))]
    pub async fn open(&self, conversation_id: &str) -> ChatResult<OpenOutcome> {
        let me = self
            .identity
            .current_user_id()
            .ok_or(ChatError::NoIdentity)?;
        if self.credentials.get().is_none() {
            return Err(ChatError::NotAuthenticated);
        }

        let (generation, previous) = {
            let mut inner = self.shared.inner.lock().await;
            inner.generation += 1;
            inner.log.reset(conversation_id);
            inner.state = SessionState::Loading(conversation_id.to_string());
            (inner.generation, Teardown::take(&self.shared, &mut inner))
        };
        self.shared.emit(ChatEvent::Reset {
            conversation_id: conversation_id.to_string(),
        });
        previous.run().await;

        let history = match self.history.fetch(conversation_id).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("History for {} unavailable: {}", conversation_id, e);
                Vec::new()
            }
        };

        let cancelled = {
            let mut inner = self.shared.inner.lock().await;
            if inner.generation != generation {
                debug!("Discarding stale history for {}", conversation_id);
                return Ok(OpenOutcome::Superseded);
            }
            inner.log.replace_with_history(
                history
                    .into_iter()
                    .map(|entry| ChatMessage::from_history(entry, &me)),
            );
            let count = inner.log.len();
            self.shared.emit(ChatEvent::HistoryLoaded {
                conversation_id: conversation_id.to_string(),
                count,
            });
            let (cancel, cancelled) = oneshot::channel();
            inner.connecting = Some(cancel);
            cancelled
        };

        // Read again: the history call may have refreshed or cleared the pair.
        let Some(access) = self.credentials.get().map(|pair| pair.access) else {
            self.settle_failed(generation).await;
            return Err(ChatError::NotAuthenticated);
        };

        // A later `open` or `close` fires `cancelled` and abandons the handshake.
        let connected = tokio::select! {
            biased;
            _ = cancelled => {
                debug!("Handshake for {} cancelled", conversation_id);
                return Ok(OpenOutcome::Superseded);
            }
            connected = self.connector.connect(conversation_id, &access) => connected,
        };
        let mut socket = match connected {
            Ok(socket) => socket,
            Err(e) => {
                self.settle_failed(generation).await;
                return Err(e);
            }
        };

        let mut inner = self.shared.inner.lock().await;
        if inner.generation != generation {
            drop(inner);
            debug!("Closing stale connection for {}", conversation_id);
            socket.close().await;
            return Ok(OpenOutcome::Superseded);
        }

        inner.connecting = None;
        if let Some(inbound) = socket.take_inbound() {
            let handle = tokio::spawn(pump(
                self.shared.clone(),
                generation,
                conversation_id.to_string(),
                me,
                inbound,
            ));
            self.shared.set_pump_abort(Some(handle.abort_handle()));
            inner.pump = Some(handle);
        }
        inner.socket = Some(socket);
        inner.state = SessionState::Live(conversation_id.to_string());
        info!("Chat session for {} is live", conversation_id);
        Ok(OpenOutcome::Live)
    }

    /// Send `text` on the open session. Blank text is ignored; without an
    /// open session the text is dropped. Nothing is appended locally.
    pub async fn send(&self, text: &str) {
        if text.trim().is_empty() {
            return;
        }
        let inner = self.shared.inner.lock().await;
        match &inner.socket {
            Some(socket) => socket.send(text),
            None => debug!("No open chat session, dropping message"),
        }
    }

    /// Close the session. The log stays readable until the next `open`.
    pub async fn close(&self) {
        let previous = {
            let mut inner = self.shared.inner.lock().await;
            inner.generation += 1;
            inner.state = SessionState::Idle;
            Teardown::take(&self.shared, &mut inner)
        };
        previous.run().await;
        self.shared.emit(ChatEvent::Closed);
    }

    pub async fn messages(&self) -> Vec<ChatMessage> {
        self.shared.inner.lock().await.log.messages().to_vec()
    }

    pub async fn state(&self) -> SessionState {
        self.shared.inner.lock().await.state.clone()
    }

    pub async fn conversation_id(&self) -> Option<String> {
        self.shared
            .inner
            .lock()
            .await
            .log
            .conversation_id()
            .map(str::to_string)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.shared.events.subscribe()
    }

    async fn settle_failed(&self, generation: u64) {
        let mut inner = self.shared.inner.lock().await;
        if inner.generation == generation {
            inner.state = SessionState::Idle;
            inner.connecting = None;
        }
    }
}

impl Drop for ChatSessionManager {
    fn drop(&mut self) {
        if let Some(pump) = self
            .shared
            .pump_abort
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            pump.abort();
        }
        if let Ok(mut inner) = self.shared.inner.try_lock() {
            inner.generation += 1;
            inner.pump = None;
            inner.connecting = None;
            inner.socket = None;
        }
    }
}

/// Everything a superseded generation still holds.
struct Teardown {
    socket: Option<Box<dyn SessionSocket>>,
    pump: Option<JoinHandle<()>>,
    connecting: Option<oneshot::Sender<()>>,
}

impl Teardown {
    /// Called with the session lock held.
    fn take(shared: &Shared, inner: &mut SessionInner) -> Self {
        if inner.pump.is_some() {
            shared.set_pump_abort(None);
        }
        Self {
            socket: inner.socket.take(),
            pump: inner.pump.take(),
            connecting: inner.connecting.take(),
        }
    }

    async fn run(self) {
        if let Some(cancel) = self.connecting {
            let _ = cancel.send(());
        }
        if let Some(pump) = self.pump {
            pump.abort();
        }
        if let Some(mut socket) = self.socket {
            debug!("Closing chat connection for {}", socket.conversation_id());
            socket.close().await;
        }
    }
}

/// Move inbound frames of one generation into the log.
async fn pump(
    shared: Arc<Shared>,
    generation: u64,
    conversation_id: String,
    me: String,
    mut inbound: InboundStream,
) {
    while let Some(frame) = inbound.next().await {
        let message = ChatMessage::from_frame(frame, &me, Utc::now());
        let mut inner = shared.inner.lock().await;
        if inner.generation != generation {
            return;
        }
        if inner.log.push(message.clone()) {
            shared.emit(ChatEvent::Message {
                conversation_id: conversation_id.clone(),
                message,
            });
        }
    }

    let socket = {
        let mut inner = shared.inner.lock().await;
        if inner.generation != generation {
            return;
        }
        inner.state = SessionState::Idle;
        inner.pump = None;
        shared.set_pump_abort(None);
        inner.socket.take()
    };
    info!("Chat stream for {} ended", conversation_id);
    if let Some(mut socket) = socket {
        socket.close().await;
    }
    shared.emit(ChatEvent::StreamClosed { conversation_id });
}
