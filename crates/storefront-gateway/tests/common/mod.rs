//! Shared helpers for gateway integration tests
//!
//! A fake client stands in for a WebSocket peer: the gateway writes into an
//! unbounded channel the test reads from, and reads from a channel the test
//! writes into.

#![allow(dead_code)]

use axum::{
    body::Bytes,
    extract::ws::{CloseFrame, Message},
};
use futures::{StreamExt, channel::mpsc};
use serde_json::Value;
use std::{sync::Arc, time::Duration};
use storefront_gateway::{
    Classification, ConnectionId, ExtensionIdentity, GatewayConfig, GatewayManager,
    InMemoryMessageStore, UserId,
};

/// How long a test waits for a frame it expects
pub const FRAME_TIMEOUT: Duration = Duration::from_secs(2);

pub struct TestGateway {
    pub manager: Arc<GatewayManager>,
    pub store: Arc<InMemoryMessageStore>,
}

impl TestGateway {
    pub fn new() -> Self {
        Self::with_config(GatewayConfig::default())
    }

    pub fn with_config(config: GatewayConfig) -> Self {
        let store = Arc::new(InMemoryMessageStore::new());
        let manager = GatewayManager::start(config, store.clone(), Arc::new(ExtensionIdentity));
        Self { manager, store }
    }

    /// Go through the OTP handshake for `user` and attach a client
    pub async fn connect_user(&self, user: u64) -> FakeClient {
        let otp = self.manager.issue_otp().await.expect("OTP issuance failed");
        let classification = self
            .manager
            .classify(Some(&otp.key), Some(UserId(user)))
            .await;
        assert_eq!(classification, Classification::Authenticated(UserId(user)));
        self.attach(classification).await
    }

    pub async fn connect_guest(&self) -> FakeClient {
        let classification = self.manager.classify(None, None).await;
        self.attach(classification).await
    }

    pub async fn attach(&self, classification: Classification) -> FakeClient {
        let (sink, from_server) = mpsc::unbounded::<Message>();
        let (to_server, stream) = mpsc::unbounded::<Result<Message, String>>();
        let id = self.manager.attach(sink, stream, classification).await;
        FakeClient {
            id,
            to_server,
            from_server,
        }
    }

    /// Wait until the supervisor has removed `id` from the registry
    pub async fn wait_removed(&self, id: ConnectionId) {
        tokio::time::timeout(FRAME_TIMEOUT, async {
            while self.manager.registry().contains(id).await {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("connection was not removed from the registry");
    }
}

pub struct FakeClient {
    pub id: ConnectionId,
    pub to_server: mpsc::UnboundedSender<Result<Message, String>>,
    pub from_server: mpsc::UnboundedReceiver<Message>,
}

impl FakeClient {
    pub fn send_json(&self, event: Value) {
        self.to_server
            .unbounded_send(Ok(Message::Text(event.to_string().into())))
            .expect("gateway stopped reading");
    }

    pub fn pong(&self) {
        self.to_server
            .unbounded_send(Ok(Message::Pong(Bytes::new())))
            .expect("gateway stopped reading");
    }

    /// Next frame of any kind, `None` once the gateway closed the socket
    pub async fn next_frame(&mut self) -> Option<Message> {
        tokio::time::timeout(FRAME_TIMEOUT, self.from_server.next())
            .await
            .expect("timed out waiting for a frame")
    }

    /// Next application event, skipping heartbeat pings
    pub async fn next_event(&mut self) -> Value {
        loop {
            match self.next_frame().await {
                Some(Message::Text(text)) => {
                    return serde_json::from_str(text.as_str()).expect("event is not JSON");
                }
                Some(Message::Ping(_)) => continue,
                other => panic!("expected an event, got {other:?}"),
            }
        }
    }

    pub async fn expect_close(&mut self) -> CloseFrame {
        loop {
            match self.next_frame().await {
                Some(Message::Close(Some(frame))) => return frame,
                Some(Message::Ping(_)) => continue,
                other => panic!("expected a close frame, got {other:?}"),
            }
        }
    }

    /// Assert that nothing arrives within a short window
    pub async fn expect_silence(&mut self) {
        let next = tokio::time::timeout(Duration::from_millis(100), self.from_server.next()).await;
        assert!(next.is_err(), "unexpected frame: {next:?}");
    }
}
