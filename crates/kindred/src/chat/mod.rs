//! Realtime chat.
//!
//! ```text
//! open(id) --> HistoryFetcher (REST, retried) --> MessageLog
//!          \-> SocketConnector --> SessionSocket --inbound--> MessageLog
//! ```
//!
//! [`ChatSessionManager`] keeps at most one session alive and hands out
//! snapshots plus a broadcast of [`ChatEvent`]s.

mod error;
mod history;
mod log;
mod manager;
mod socket;

pub use error::{ChatError, ChatResult};
pub use history::{HistoryApi, HistoryFetcher, RetryPolicy};
pub use log::{ChatMessage, MessageLog};
pub use manager::{
    ChatEvent, ChatSessionManager, IdentityProvider, OpenOutcome, SessionState, StaticIdentity,
};
pub use socket::{InboundStream, SessionSocket, SocketConnector, WsConnector, WsSessionSocket};
