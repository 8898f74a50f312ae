//! Chat event handlers
//!
//! Every handler follows the same sequence: decode the payload, check that
//! the claimed sender is the connection's user, validate, persist through
//! the [`MessageStore`] and broadcast the persisted result to both
//! participants. Any failure aborts the sequence before the broadcast.

use crate::{
    broadcaster::Broadcaster,
    error::{GatewayError, GatewayResult, StoreError},
    model::{Message, MessageChanges, NewMessage, UserId},
    protocol::{
        CreateMessagePayload, DeleteMessagePayload, DeletedMessagePayload, Event, EventType,
        StatusUpdatePayload, UpdateMessagePayload,
    },
    router::{EventHandler, EventRouter, HandlerContext},
    store::MessageStore,
};
use std::sync::Arc;
use tracing::debug;

/// Collaborators shared by the chat handlers
#[derive(Clone)]
pub struct ChatDeps {
    pub store: Arc<dyn MessageStore>,
    pub broadcaster: Broadcaster,
    pub max_content_length: usize,
}

/// Register the handlers for all inbound chat events
pub fn register_chat_handlers(router: &mut EventRouter, deps: ChatDeps) {
    router.register(
        EventType::MessageCreate,
        Arc::new(CreateMessageHandler { deps: deps.clone() }),
    );
    router.register(
        EventType::MessageUpdate,
        Arc::new(UpdateMessageHandler { deps: deps.clone() }),
    );
    router.register(
        EventType::MessageDelete,
        Arc::new(DeleteMessageHandler { deps: deps.clone() }),
    );
    router.register(
        EventType::MessageStatusUpdate,
        Arc::new(StatusUpdateHandler { deps }),
    );
}

/// `message_create`
pub struct CreateMessageHandler {
    deps: ChatDeps,
}

#[async_trait::async_trait]
impl EventHandler for CreateMessageHandler {
    async fn handle(&self, event: &Event, ctx: &HandlerContext) -> GatewayResult<()> {
        let payload: CreateMessagePayload = event.payload_as()?;
        ensure_sender(payload.from, ctx)?;
        validate_content(&payload.content, self.deps.max_content_length)?;

        let message = self
            .deps
            .store
            .create_message(NewMessage {
                from: payload.from,
                to: payload.to,
                content: payload.content,
            })
            .await?;
        debug!(conn_id = %ctx.conn_id, message_id = message.id, "message created");

        self.deps
            .broadcaster
            .broadcast_to_users(&message, &message.participants(), EventType::MessageCreated)
            .await;
        Ok(())
    }
}

/// `message_update`, author only
pub struct UpdateMessageHandler {
    deps: ChatDeps,
}

#[async_trait::async_trait]
impl EventHandler for UpdateMessageHandler {
    async fn handle(&self, event: &Event, ctx: &HandlerContext) -> GatewayResult<()> {
        let payload: UpdateMessagePayload = event.payload_as()?;
        ensure_sender(payload.from, ctx)?;
        validate_content(&payload.content, self.deps.max_content_length)?;

        let existing = self.deps.store.get_message(payload.id).await?;
        ensure_author(&existing, ctx)?;

        let message = self
            .deps
            .store
            .update_message(
                payload.id,
                MessageChanges {
                    content: Some(payload.content),
                },
            )
            .await?;

        self.deps
            .broadcaster
            .broadcast_to_users(&message, &message.participants(), EventType::MessageUpdated)
            .await;
        Ok(())
    }
}

/// `message_delete`, author only
pub struct DeleteMessageHandler {
    deps: ChatDeps,
}

#[async_trait::async_trait]
impl EventHandler for DeleteMessageHandler {
    async fn handle(&self, event: &Event, ctx: &HandlerContext) -> GatewayResult<()> {
        let payload: DeleteMessagePayload = event.payload_as()?;
        ensure_sender(payload.from, ctx)?;

        let existing = self.deps.store.get_message(payload.id).await?;
        ensure_author(&existing, ctx)?;
        self.deps.store.delete_message(payload.id).await?;

        self.deps
            .broadcaster
            .broadcast_to_users(
                &DeletedMessagePayload { id: payload.id },
                &existing.participants(),
                EventType::MessageDeleted,
            )
            .await;
        Ok(())
    }
}

/// `message_status_update`, recipient only, forward only
pub struct StatusUpdateHandler {
    deps: ChatDeps,
}

#[async_trait::async_trait]
impl EventHandler for StatusUpdateHandler {
    async fn handle(&self, event: &Event, ctx: &HandlerContext) -> GatewayResult<()> {
        let payload: StatusUpdatePayload = event.payload_as()?;
        ensure_sender(payload.from, ctx)?;

        let existing = self.deps.store.get_message(payload.id).await?;
        if existing.to != ctx.user_id {
            return Err(GatewayError::Forbidden(format!(
                "only the recipient may change the status of message {}",
                existing.id
            )));
        }

        // Forward-only is checked by the store, atomically with the write
        let message = match self
            .deps
            .store
            .update_message_status(payload.id, payload.status)
            .await
        {
            Err(StoreError::Conflict(reason)) => return Err(GatewayError::Validation(reason)),
            result => result?,
        };

        self.deps
            .broadcaster
            .broadcast_to_users(
                &message,
                &message.participants(),
                EventType::MessageStatusUpdated,
            )
            .await;
        Ok(())
    }
}

/// The payload's claimed sender must be the connection's user
fn ensure_sender(claimed: UserId, ctx: &HandlerContext) -> GatewayResult<()> {
    if claimed != ctx.user_id {
        return Err(GatewayError::SenderMismatch {
            claimed,
            actual: ctx.user_id,
        });
    }
    Ok(())
}

fn ensure_author(message: &Message, ctx: &HandlerContext) -> GatewayResult<()> {
    if message.from != ctx.user_id {
        return Err(GatewayError::Forbidden(format!(
            "message {} belongs to user {}",
            message.id, message.from
        )));
    }
    Ok(())
}

fn validate_content(content: &str, max_chars: usize) -> GatewayResult<()> {
    if content.trim().is_empty() {
        return Err(GatewayError::Validation(
            "content must not be empty".to_string(),
        ));
    }
    let chars = content.chars().count();
    if chars > max_chars {
        return Err(GatewayError::Validation(format!(
            "content is {chars} characters long (max: {max_chars})"
        )));
    }
    Ok(())
}
