//! Client core for the Kindred matching service.
//!
//! ```text
//! AuthService / ProfileService / SocialService
//!            |
//!        ApiClient  --(bearer, refresh-on-401)-->  REST backend
//!            |
//!     CredentialStore
//!
//! ChatSessionManager --> HistoryFetcher (via ApiClient)
//!                    \-> SocketConnector --> WebSocket backend
//! ```
//!
//! The credential store is injected everywhere it is needed; nothing in the
//! crate keeps global state.

pub mod api;
pub mod auth;
pub mod chat;
pub mod config;
pub mod profile;
pub mod social;

pub use api::{ApiClient, ApiError, ApiResult};
pub use auth::{AuthService, CredentialPair, CredentialStore};
pub use chat::{ChatError, ChatEvent, ChatSessionManager};
pub use config::ClientConfig;
pub use profile::ProfileService;
pub use social::SocialService;

pub use kindred_protocol as protocol;
