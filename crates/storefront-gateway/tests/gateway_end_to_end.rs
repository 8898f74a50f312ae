//! End-to-end tests of the gateway driven through fake sockets

mod common;

use axum::extract::ws::{Message, close_code};
use common::TestGateway;
use futures::StreamExt;
use serde_json::json;
use std::time::Duration;
use storefront_gateway::{GatewayConfig, ProductStockDelta};
use tokio::time::Instant;

#[tokio::test]
async fn test_chat_reaches_participants_and_stock_reaches_everyone() {
    let gateway = TestGateway::new();
    let mut alice = gateway.connect_user(5).await;
    let mut bob = gateway.connect_user(9).await;
    let mut guest = gateway.connect_guest().await;

    alice.send_json(json!({
        "type": "message_create",
        "payload": {"from": 5, "to": 9, "content": "is the blue one back in stock?"}
    }));

    for client in [&mut alice, &mut bob] {
        let event = client.next_event().await;
        assert_eq!(event["type"], "message_created");
        assert_eq!(event["payload"]["from"], 5);
        assert_eq!(event["payload"]["to"], 9);
        assert_eq!(event["payload"]["status"], "sent");
    }
    guest.expect_silence().await;

    let outcome = gateway
        .manager
        .broadcast_stock_update(&[ProductStockDelta {
            id: 17,
            discount_amount: 2,
        }])
        .await;
    assert_eq!(outcome.delivered, 3);

    let expected = json!({
        "type": "products_stock_update",
        "payload": [{"id": 17, "discountAmount": 2}]
    });
    assert_eq!(guest.next_event().await, expected);
    assert_eq!(alice.next_event().await, expected);
    assert_eq!(bob.next_event().await, expected);
}

#[tokio::test]
async fn test_user_with_several_devices_receives_on_all() {
    let gateway = TestGateway::new();
    let mut alice = gateway.connect_user(5).await;
    let mut bob_phone = gateway.connect_user(9).await;
    let mut bob_laptop = gateway.connect_user(9).await;

    let stats = gateway.manager.stats().await;
    assert_eq!(stats.authenticated_connections, 3);
    assert_eq!(stats.distinct_users, 2);

    alice.send_json(json!({
        "type": "message_create",
        "payload": {"from": 5, "to": 9, "content": "hello"}
    }));

    assert_eq!(alice.next_event().await["type"], "message_created");
    assert_eq!(bob_phone.next_event().await["type"], "message_created");
    assert_eq!(bob_laptop.next_event().await["type"], "message_created");
}

#[tokio::test]
async fn test_guest_write_is_closed_with_policy_violation() {
    let gateway = TestGateway::new();
    let mut guest = gateway.connect_guest().await;

    guest.send_json(json!({
        "type": "message_create",
        "payload": {"from": 5, "to": 9, "content": "let me in"}
    }));

    let frame = guest.expect_close().await;
    assert_eq!(frame.code, close_code::POLICY);
    assert_eq!(frame.reason.as_str(), "Read-only users not allowed to write.");

    gateway.wait_removed(guest.id).await;
    assert!(gateway.store.is_empty().await);
}

#[tokio::test]
async fn test_sender_mismatch_terminates_connection() {
    let gateway = TestGateway::new();
    let mut alice = gateway.connect_user(5).await;
    let mut bob = gateway.connect_user(9).await;

    alice.send_json(json!({
        "type": "message_create",
        "payload": {"from": 9, "to": 5, "content": "I am bob"}
    }));

    assert_eq!(alice.expect_close().await.code, close_code::POLICY);
    gateway.wait_removed(alice.id).await;

    assert!(gateway.store.is_empty().await);
    bob.expect_silence().await;
    assert!(gateway.manager.registry().contains(bob.id).await);
}

#[tokio::test]
async fn test_invalid_events_terminate_connection() {
    let gateway = TestGateway::new();

    let mut client = gateway.connect_user(5).await;
    client.send_json(json!({"type": "message_shout", "payload": {}}));
    assert_eq!(client.expect_close().await.code, close_code::POLICY);

    let mut client = gateway.connect_user(5).await;
    client
        .to_server
        .unbounded_send(Ok(Message::Text("{not json".into())))
        .unwrap();
    assert_eq!(client.expect_close().await.code, close_code::INVALID);

    let mut client = gateway.connect_user(5).await;
    client.send_json(json!({
        "type": "message_create",
        "payload": {"from": 5, "to": 9, "content": "x".repeat(600)}
    }));
    assert_eq!(client.expect_close().await.code, close_code::SIZE);

    gateway.wait_removed(client.id).await;
    assert!(gateway.store.is_empty().await);
}

#[tokio::test]
async fn test_peer_close_removes_connection() {
    let gateway = TestGateway::new();
    let mut client = gateway.connect_user(5).await;

    client
        .to_server
        .unbounded_send(Ok(Message::Close(None)))
        .unwrap();

    assert_eq!(client.expect_close().await.code, close_code::NORMAL);
    gateway.wait_removed(client.id).await;
    assert!(client.next_frame().await.is_none());
}

#[tokio::test]
async fn test_broadcast_prunes_only_the_stuck_peer() {
    let config = GatewayConfig::builder()
        .outbound_buffer(2)
        .unwrap()
        .build();
    let gateway = TestGateway::with_config(config);

    let mut healthy = Vec::new();
    for user in 1..=3 {
        healthy.push(gateway.connect_user(user).await);
    }
    // Socket nobody reads: its write loop blocks and its queue fills up
    let (stuck_sink, _stuck_rx) = futures::channel::mpsc::channel::<Message>(0);
    let (_stuck_tx, stuck_stream) =
        futures::channel::mpsc::unbounded::<Result<Message, String>>();
    let stuck = gateway
        .manager
        .attach(
            stuck_sink,
            stuck_stream,
            storefront_gateway::Classification::Guest,
        )
        .await;

    let mut pruned = 0;
    for id in 0..10 {
        let outcome = gateway
            .manager
            .broadcast_stock_update(&[ProductStockDelta {
                id,
                discount_amount: 1,
            }])
            .await;
        pruned += outcome.pruned;
        tokio::task::yield_now().await;
    }

    assert_eq!(pruned, 1);
    gateway.wait_removed(stuck).await;
    for client in &mut healthy {
        for id in 0..10 {
            assert_eq!(client.next_event().await["payload"][0]["id"], id);
        }
        assert!(gateway.manager.registry().contains(client.id).await);
    }
    assert_eq!(gateway.manager.stats().await.total_connections, 3);
    gateway.manager.registry().check_invariants().await.unwrap();
}

#[tokio::test]
async fn test_backlogged_guest_still_gets_policy_close_code() {
    let config = GatewayConfig::builder()
        .outbound_buffer(1)
        .unwrap()
        .build();
    let gateway = TestGateway::with_config(config);

    // The socket accepts one frame and then waits for the peer to read
    let (sink, mut written) = futures::channel::mpsc::channel::<Message>(0);
    let (to_server, stream) = futures::channel::mpsc::unbounded::<Result<Message, String>>();
    let guest = gateway
        .manager
        .attach(sink, stream, storefront_gateway::Classification::Guest)
        .await;

    for id in 0..2 {
        let outcome = gateway
            .manager
            .broadcast_stock_update(&[ProductStockDelta {
                id,
                discount_amount: 1,
            }])
            .await;
        assert_eq!(outcome.pruned, 0);
        tokio::task::yield_now().await;
    }
    assert!(gateway.manager.registry().contains(guest).await);

    to_server
        .unbounded_send(Ok(Message::Text(r#"{"type":"message_create"}"#.into())))
        .unwrap();

    let frame = tokio::time::timeout(common::FRAME_TIMEOUT, async {
        loop {
            match written.next().await {
                Some(Message::Close(Some(frame))) => break frame,
                Some(Message::Text(_) | Message::Ping(_)) => continue,
                other => panic!("expected a close frame, got {other:?}"),
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(frame.code, close_code::POLICY);
    gateway.wait_removed(guest).await;
}

#[tokio::test(start_paused = true)]
async fn test_silent_peer_is_dropped_after_pong_wait() {
    let gateway = TestGateway::new();
    let mut client = gateway.connect_user(5).await;
    let started = Instant::now();

    assert!(matches!(client.from_server.next().await, Some(Message::Ping(_))));
    assert_eq!(started.elapsed(), Duration::from_secs(9));

    let Some(Message::Close(Some(frame))) = client.from_server.next().await else {
        panic!("expected a close frame");
    };
    assert_eq!(frame.code, close_code::AWAY);
    assert_eq!(started.elapsed(), Duration::from_secs(10));

    gateway.wait_removed(client.id).await;
}

#[tokio::test(start_paused = true)]
async fn test_answering_pings_keeps_connection_alive() {
    let gateway = TestGateway::new();
    let mut guest = gateway.connect_guest().await;
    let started = Instant::now();

    while started.elapsed() < Duration::from_secs(60) {
        match guest.from_server.next().await {
            Some(Message::Ping(_)) => guest.pong(),
            other => panic!("expected a ping, got {other:?}"),
        }
    }

    assert!(gateway.manager.registry().contains(guest.id).await);
}

#[tokio::test]
async fn test_shutdown_closes_every_connection() {
    let gateway = TestGateway::new();
    let mut alice = gateway.connect_user(5).await;
    let mut guest = gateway.connect_guest().await;

    gateway.manager.shutdown().await;

    assert_eq!(alice.expect_close().await.code, close_code::NORMAL);
    assert_eq!(guest.expect_close().await.code, close_code::NORMAL);
    assert_eq!(gateway.manager.stats().await.total_connections, 0);
}
