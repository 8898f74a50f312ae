//! Wire protocol: the JSON event envelope and its typed payloads
//!
//! Every application frame, in both directions, is a text frame carrying
//!
//! ```json
//! {"type": "<event-type-tag>", "payload": <json>}
//! ```
//!
//! Heartbeats use WebSocket ping/pong control frames and never appear here.

use crate::{
    error::{GatewayError, GatewayResult},
    model::{MessageId, MessageStatus, UserId},
};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::{fmt, str::FromStr};

/// Event type tags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    MessageCreate,
    MessageUpdate,
    MessageDelete,
    MessageStatusUpdate,
    MessageCreated,
    MessageUpdated,
    MessageDeleted,
    MessageStatusUpdated,
    ProductsStockUpdate,
}

impl EventType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MessageCreate => "message_create",
            Self::MessageUpdate => "message_update",
            Self::MessageDelete => "message_delete",
            Self::MessageStatusUpdate => "message_status_update",
            Self::MessageCreated => "message_created",
            Self::MessageUpdated => "message_updated",
            Self::MessageDeleted => "message_deleted",
            Self::MessageStatusUpdated => "message_status_updated",
            Self::ProductsStockUpdate => "products_stock_update",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "message_create" => Ok(Self::MessageCreate),
            "message_update" => Ok(Self::MessageUpdate),
            "message_delete" => Ok(Self::MessageDelete),
            "message_status_update" => Ok(Self::MessageStatusUpdate),
            "message_created" => Ok(Self::MessageCreated),
            "message_updated" => Ok(Self::MessageUpdated),
            "message_deleted" => Ok(Self::MessageDeleted),
            "message_status_updated" => Ok(Self::MessageStatusUpdated),
            "products_stock_update" => Ok(Self::ProductsStockUpdate),
            other => Err(GatewayError::UnknownEventType(other.to_string())),
        }
    }
}

/// Event envelope
///
/// The tag is kept as a raw string so that an unrecognised tag decodes
/// successfully and is reported by the router as an unknown event type
/// rather than as a malformed frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Event {
    pub fn new(event_type: EventType, payload: serde_json::Value) -> Self {
        Self {
            event_type: event_type.as_str().to_string(),
            payload,
        }
    }

    /// Build an envelope around any serializable entity
    pub fn from_entity<T: Serialize + ?Sized>(
        event_type: EventType,
        entity: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(event_type, serde_json::to_value(entity)?))
    }

    /// Decode an inbound frame
    pub fn decode(frame: &[u8]) -> GatewayResult<Self> {
        serde_json::from_slice(frame).map_err(|e| GatewayError::InvalidPayload(e.to_string()))
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Resolve the tag against the known event types
    pub fn kind(&self) -> GatewayResult<EventType> {
        self.event_type.parse()
    }

    /// Decode the payload into a typed structure
    pub fn payload_as<T: DeserializeOwned>(&self) -> GatewayResult<T> {
        T::deserialize(&self.payload).map_err(|e| {
            GatewayError::InvalidPayload(format!("{} payload: {}", self.event_type, e))
        })
    }
}

/// `message_create` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateMessagePayload {
    pub from: UserId,
    pub to: UserId,
    pub content: String,
}

/// `message_update` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateMessagePayload {
    pub id: MessageId,
    pub from: UserId,
    pub content: String,
}

/// `message_delete` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteMessagePayload {
    pub id: MessageId,
    pub from: UserId,
}

/// `message_status_update` payload; `from` is the user marking the message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdatePayload {
    pub id: MessageId,
    pub from: UserId,
    pub status: MessageStatus,
}

/// `message_deleted` payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletedMessagePayload {
    pub id: MessageId,
}
