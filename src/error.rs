//! Hub error taxonomy.
//!
//! Every failure a caller can observe maps onto one of these variants.
//! Handler failures travel back as `Error`-status responses with the message
//! preserved in metadata; [`crate::message::ApiResponse::into_result`]
//! rehydrates them into a [`HubError`] on the caller side.

use std::time::Duration;

use thiserror::Error;

use crate::wire::WireError;

/// Errors surfaced by hub operations.
#[derive(Debug, Error)]
pub enum HubError {
    /// No matching endpoint after interception, local lookup, escalation,
    /// fallback and approximation all came up empty.
    #[error("no endpoint matched path `{0}`")]
    NotFound(String),
    /// The path (or link) is already registered at this hub.
    #[error("duplicate registration: {0}")]
    Conflict(String),
    /// A channel broke, TLS failed, or a frame would not decode.
    #[error("transport failure: {0}")]
    Transport(String),
    /// The request deadline elapsed before a response arrived.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    /// A user-supplied handler failed; its message is passed through.
    #[error("handler failed: {0}")]
    Handler(String),
    /// An interceptor acting as a gate rejected the call.
    #[error("rejected by interceptor: {0}")]
    Policy(String),
    /// The hub is draining or stopped and refuses new work.
    #[error("hub is shutting down")]
    ShuttingDown,
}

impl From<WireError> for HubError {
    fn from(value: WireError) -> Self {
        Self::Transport(value.to_string())
    }
}
