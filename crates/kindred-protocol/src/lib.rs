//! Wire types for the Kindred REST/WebSocket backend.
//!
//! ```text
//! Client <--[REST: auth, profiles, social, chat history]--> Backend
//! Client <--[WS: {ws_base}/{match_id}/?token=...]--------> Backend
//! ```
//!
//! Every type here mirrors a JSON payload exactly as the backend sends or
//! accepts it. Client-side semantics (ordering, ownership, de-duplication)
//! live in the `kindred` crate.

pub mod auth;
pub mod chat;
pub mod profiles;
pub mod social;

mod ids;

pub use ids::{deserialize_id, deserialize_optional_id};
