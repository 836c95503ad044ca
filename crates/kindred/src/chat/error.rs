//! Chat session error types.

use thiserror::Error;

use crate::api::ApiError;

/// Result type for chat session operations.
pub type ChatResult<T> = Result<T, ChatError>;

/// Errors surfaced by the chat session manager.
///
/// A closed stream is reported as an event, not an error.
#[derive(Debug, Error)]
pub enum ChatError {
    /// No access credential is stored.
    #[error("Not signed in")]
    NotAuthenticated,

    /// The current user's id is unknown, so ownership cannot be decided.
    #[error("Current user identity is unknown")]
    NoIdentity,

    /// The streaming connection could not be established.
    #[error("Failed to connect chat for conversation {conversation}: {message}")]
    Connect {
        conversation: String,
        message: String,
    },

    #[error(transparent)]
    Api(#[from] ApiError),
}
