//! Fan-out of server-originated events
//!
//! Broadcasting is a best-effort side effect of a mutation that already
//! succeeded. Encoding failures are logged and the broadcast is abandoned;
//! they never surface to the caller.

use crate::{
    model::UserId,
    protocol::{Event, EventType},
    registry::{BroadcastOutcome, Registry},
};
use axum::extract::ws::Utf8Bytes;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error};

/// Serializes entities into event envelopes and hands them to the registry
#[derive(Debug, Clone)]
pub struct Broadcaster {
    registry: Arc<Registry>,
}

impl Broadcaster {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    /// Deliver `entity` to every connection of the given users
    pub async fn broadcast_to_users<T: Serialize + ?Sized>(
        &self,
        entity: &T,
        user_ids: &[UserId],
        event_type: EventType,
    ) -> BroadcastOutcome {
        let Some(text) = encode(entity, event_type) else {
            return BroadcastOutcome::default();
        };
        let outcome = self.registry.broadcast_to_users(user_ids, text).await;
        debug!(
            event_type = %event_type,
            users = ?user_ids,
            delivered = outcome.delivered,
            pruned = outcome.pruned,
            "targeted broadcast"
        );
        outcome
    }

    /// Deliver `entity` to every connection, guests included
    pub async fn broadcast_all<T: Serialize + ?Sized>(
        &self,
        entity: &T,
        event_type: EventType,
    ) -> BroadcastOutcome {
        let Some(text) = encode(entity, event_type) else {
            return BroadcastOutcome::default();
        };
        let outcome = self.registry.broadcast_all(text).await;
        debug!(
            event_type = %event_type,
            delivered = outcome.delivered,
            pruned = outcome.pruned,
            "broadcast to all connections"
        );
        outcome
    }
}

fn encode<T: Serialize + ?Sized>(entity: &T, event_type: EventType) -> Option<Utf8Bytes> {
    let encoded = Event::from_entity(event_type, entity).and_then(|event| event.encode());
    match encoded {
        Ok(json) => Some(Utf8Bytes::from(json)),
        Err(e) => {
            error!(event_type = %event_type, error = %e, "failed to serialize broadcast, dropping it");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        model::ProductStockDelta,
        registry::ConnectionHandle,
    };
    use std::collections::HashMap;

    #[tokio::test]
    async fn test_broadcast_all_wraps_entity_in_envelope() {
        let registry = Arc::new(Registry::new());
        let (guest, mut rx) = ConnectionHandle::new(None, 4);
        registry.add(guest).await;
        let broadcaster = Broadcaster::new(Arc::clone(&registry));

        let deltas = [ProductStockDelta {
            id: 1,
            discount_amount: 3,
        }];
        let outcome = broadcaster
            .broadcast_all(&deltas[..], EventType::ProductsStockUpdate)
            .await;
        assert_eq!(outcome.delivered, 1);

        let text = rx.try_recv().unwrap();
        let json: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "type": "products_stock_update",
                "payload": [{"id": 1, "discountAmount": 3}]
            })
        );
    }

    #[tokio::test]
    async fn test_serialization_failure_is_swallowed() {
        let registry = Arc::new(Registry::new());
        let (handle, mut rx) = ConnectionHandle::new(Some(UserId(1)), 4);
        registry.add(handle).await;
        let broadcaster = Broadcaster::new(Arc::clone(&registry));

        // JSON object keys must be strings
        let mut bad = HashMap::new();
        bad.insert(vec![1u8], 1u8);

        let outcome = broadcaster
            .broadcast_to_users(&bad, &[UserId(1)], EventType::MessageCreated)
            .await;
        assert_eq!(outcome, BroadcastOutcome::default());
        assert!(rx.try_recv().is_err());
        assert_eq!(registry.len().await, 1);
    }
}
