//! Gateway error taxonomy
//!
//! Every error raised inside a connection's loops is local to that
//! connection: it is logged, mapped to a close frame and the connection is
//! torn down. Nothing here crosses into other connections or back to the
//! HTTP caller.

use crate::model::{MessageId, UserId};
use axum::extract::ws::{CloseFrame, close_code};

/// Result alias used throughout the gateway
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Errors raised by the storage collaborator
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("message with id '{0}' was not found")]
    NotFound(MessageId),

    #[error("conflicting write: {0}")]
    Conflict(String),

    #[error("storage backend failure: {0}")]
    Backend(String),
}

/// Gateway errors
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("received unknown event type: {0}")]
    UnknownEventType(String),

    #[error("read-only connection attempted to write")]
    GuestWrite,

    #[error("payload claims sender {claimed} but connection belongs to user {actual}")]
    SenderMismatch { claimed: UserId, actual: UserId },

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to encode event: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("no pong received within the heartbeat window")]
    HeartbeatTimeout,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("transport error: {0}")]
    Transport(String),
}

impl GatewayError {
    /// Protocol violations are the client's fault: guests writing, unknown
    /// event tags or impersonation attempts.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Self::UnknownEventType(_)
                | Self::GuestWrite
                | Self::SenderMismatch { .. }
                | Self::Forbidden(_)
        )
    }

    /// Close code written to the peer before the connection is dropped
    pub fn close_code(&self) -> u16 {
        match self {
            Self::UnknownEventType(_)
            | Self::GuestWrite
            | Self::SenderMismatch { .. }
            | Self::Forbidden(_)
            | Self::Validation(_) => close_code::POLICY,
            Self::InvalidPayload(_) => close_code::INVALID,
            Self::MessageTooLarge { .. } => close_code::SIZE,
            Self::HeartbeatTimeout => close_code::AWAY,
            Self::ConnectionClosed => close_code::NORMAL,
            Self::Store(_) | Self::Serialization(_) | Self::Transport(_) => close_code::ERROR,
        }
    }

    /// Close frame carrying [`Self::close_code`] and a short reason
    pub fn close_frame(&self) -> CloseFrame {
        let reason = match self {
            Self::GuestWrite => "Read-only users not allowed to write.",
            Self::UnknownEventType(_) => "Unknown event type.",
            Self::SenderMismatch { .. } | Self::Forbidden(_) => "Not allowed.",
            Self::InvalidPayload(_) | Self::Validation(_) => "Invalid event.",
            Self::MessageTooLarge { .. } => "Message too large.",
            Self::HeartbeatTimeout => "Heartbeat timeout.",
            Self::ConnectionClosed => "",
            Self::Store(_) | Self::Serialization(_) | Self::Transport(_) => "Internal error.",
        };
        CloseFrame {
            code: self.close_code(),
            reason: reason.into(),
        }
    }
}
