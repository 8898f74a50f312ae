//! Storage collaborator
//!
//! The gateway never talks to the relational store directly. Handlers go
//! through [`MessageStore`], which the host application implements on top of
//! its repository layer. [`InMemoryMessageStore`] backs tests and the local
//! development server.

use crate::{
    error::StoreError,
    model::{Cursor, Message, MessageChanges, MessageId, MessageStatus, NewMessage, UserId},
};
use chrono::Utc;
use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
};
use tokio::sync::RwLock;

/// Persistence operations the chat handlers depend on
///
/// Each call is expected to be atomic on its own; the gateway performs a
/// single write per inbound event.
#[async_trait::async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a new message with status `sent`
    async fn create_message(&self, message: NewMessage) -> Result<Message, StoreError>;

    async fn get_message(&self, id: MessageId) -> Result<Message, StoreError>;

    async fn update_message(
        &self,
        id: MessageId,
        changes: MessageChanges,
    ) -> Result<Message, StoreError>;

    async fn delete_message(&self, id: MessageId) -> Result<(), StoreError>;

    /// Move a message to `status`
    ///
    /// The forward-only check and the write must happen atomically: an
    /// implementation re-reads the current status inside the same
    /// transaction (or under the same lock) and fails with
    /// [`StoreError::Conflict`] when `status` would move it backwards.
    async fn update_message_status(
        &self,
        id: MessageId,
        status: MessageStatus,
    ) -> Result<Message, StoreError>;

    /// Messages exchanged between `a` and `b`, newest first, older than the
    /// cursor position
    async fn conversation(
        &self,
        a: UserId,
        b: UserId,
        cursor: Cursor,
    ) -> Result<Vec<Message>, StoreError>;
}

/// In-memory message store
#[derive(Debug, Default)]
pub struct InMemoryMessageStore {
    messages: RwLock<BTreeMap<MessageId, Message>>,
    next_id: AtomicU64,
    fail_next_write: AtomicBool,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next write fail with a backend error
    pub fn fail_next_write(&self) {
        self.fail_next_write.store(true, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        self.messages.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.messages.read().await.is_empty()
    }

    fn check_injected_failure(&self) -> Result<(), StoreError> {
        if self.fail_next_write.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Backend("injected write failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn create_message(&self, message: NewMessage) -> Result<Message, StoreError> {
        self.check_injected_failure()?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let now = Utc::now();
        let message = Message {
            id,
            from: message.from,
            to: message.to,
            content: message.content,
            status: MessageStatus::Sent,
            created_at: now,
            updated_at: now,
        };
        self.messages.write().await.insert(id, message.clone());
        Ok(message)
    }

    async fn get_message(&self, id: MessageId) -> Result<Message, StoreError> {
        self.messages
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    async fn update_message(
        &self,
        id: MessageId,
        changes: MessageChanges,
    ) -> Result<Message, StoreError> {
        self.check_injected_failure()?;

        let mut messages = self.messages.write().await;
        let message = messages.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if let Some(content) = changes.content {
            message.content = content;
        }
        message.updated_at = Utc::now();
        Ok(message.clone())
    }

    async fn delete_message(&self, id: MessageId) -> Result<(), StoreError> {
        self.check_injected_failure()?;

        self.messages
            .write()
            .await
            .remove(&id)
            .map(|_| ())
            .ok_or(StoreError::NotFound(id))
    }

    async fn update_message_status(
        &self,
        id: MessageId,
        status: MessageStatus,
    ) -> Result<Message, StoreError> {
        self.check_injected_failure()?;

        let mut messages = self.messages.write().await;
        let message = messages.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if !message.status.can_advance_to(status) {
            return Err(StoreError::Conflict(format!(
                "status of message {id} cannot go from {} to {status}",
                message.status
            )));
        }
        message.status = status;
        message.updated_at = Utc::now();
        Ok(message.clone())
    }

    async fn conversation(
        &self,
        a: UserId,
        b: UserId,
        cursor: Cursor,
    ) -> Result<Vec<Message>, StoreError> {
        let cursor = cursor.normalized();
        let messages = self.messages.read().await;
        let page = messages
            .values()
            .rev()
            .filter(|m| (m.from == a && m.to == b) || (m.from == b && m.to == a))
            .filter(|m| cursor.created_at.is_none_or(|before| m.created_at < before))
            .take(cursor.limit)
            .cloned()
            .collect();
        Ok(page)
    }
}
