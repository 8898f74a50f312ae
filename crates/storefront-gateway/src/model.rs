//! Domain types shared between the gateway and its storage collaborator

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a storefront user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub u64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for UserId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Primary key of a chat message
pub type MessageId = u64;

/// Delivery status of a chat message
///
/// Statuses are ordered: a message only ever moves towards `Seen`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    #[default]
    Sent,
    Delivered,
    Seen,
}

impl MessageStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Seen => "seen",
        }
    }

    /// Whether a message currently in `self` may be marked `next`.
    /// Re-applying the current status is allowed.
    pub fn can_advance_to(self, next: MessageStatus) -> bool {
        next >= self
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted direct message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub from: UserId,
    pub to: UserId,
    pub content: String,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Message {
    /// Users that should hear about changes to this message
    pub fn participants(&self) -> Vec<UserId> {
        if self.from == self.to {
            vec![self.from]
        } else {
            vec![self.from, self.to]
        }
    }
}

/// Message about to be persisted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub from: UserId,
    pub to: UserId,
    pub content: String,
}

/// Partial update applied to an existing message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageChanges {
    pub content: Option<String>,
}

/// Stock reduction of a single product after an order is fulfilled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductStockDelta {
    pub id: u64,
    pub discount_amount: u64,
}

/// Lowest page size accepted by [`Cursor`]
pub const MIN_PAGE_LIMIT: usize = 10;

/// Backwards pagination cursor over a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cursor {
    /// Only messages created strictly before this instant are returned.
    /// `None` starts from the newest message.
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub limit: usize,
}

impl Cursor {
    /// Clamp the limit so a page is never smaller than [`MIN_PAGE_LIMIT`]
    pub fn normalized(mut self) -> Self {
        if self.limit < MIN_PAGE_LIMIT {
            self.limit = MIN_PAGE_LIMIT;
        }
        self
    }
}
