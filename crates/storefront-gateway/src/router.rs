//! Dispatch of inbound events to their handlers

use crate::{
    error::{GatewayError, GatewayResult},
    model::UserId,
    protocol::{Event, EventType},
    registry::ConnectionId,
};
use std::{collections::HashMap, fmt, sync::Arc};

/// The authenticated connection an event arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerContext {
    pub conn_id: ConnectionId,
    pub user_id: UserId,
}

/// Business logic for one event type
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event, ctx: &HandlerContext) -> GatewayResult<()>;
}

/// Table from event type to handler
#[derive(Default)]
pub struct EventRouter {
    handlers: HashMap<EventType, Arc<dyn EventHandler>>,
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `event_type`, returning the handler it replaces
    pub fn register(
        &mut self,
        event_type: EventType,
        handler: Arc<dyn EventHandler>,
    ) -> Option<Arc<dyn EventHandler>> {
        self.handlers.insert(event_type, handler)
    }

    pub fn handles(&self, event_type: EventType) -> bool {
        self.handlers.contains_key(&event_type)
    }

    /// Route `event` to its handler
    ///
    /// Tags that are not recognised, or recognised but without a handler
    /// (the outbound-only tags), are both unknown event types.
    pub async fn dispatch(&self, event: &Event, ctx: &HandlerContext) -> GatewayResult<()> {
        let event_type = event.kind()?;
        let handler = self
            .handlers
            .get(&event_type)
            .ok_or_else(|| GatewayError::UnknownEventType(event.event_type.clone()))?;
        handler.handle(event, ctx).await
    }
}

impl fmt::Debug for EventRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut registered: Vec<_> = self.handlers.keys().map(|t| t.as_str()).collect();
        registered.sort_unstable();
        f.debug_struct("EventRouter")
            .field("handlers", &registered)
            .finish()
    }
}
