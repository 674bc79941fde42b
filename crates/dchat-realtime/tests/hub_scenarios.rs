//! End-to-end hub scenarios over in-memory transports.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{
    connect, eventually, stalled_transport_pair, test_hub, FailingStore, RecordingStore,
    StoreCall,
};
use dchat_realtime::{EnvelopeKind, FailureNotice, Frame, HubConfig, UserId};

fn config() -> HubConfig {
    HubConfig {
        write_timeout: Duration::from_secs(1),
        ..HubConfig::default()
    }
}

#[tokio::test]
async fn test_chat_between_online_users() {
    let store = Arc::new(RecordingStore::new());
    let hub = test_hub(store.clone(), config());
    let mut alice = connect(&hub, 1);
    let mut bob = connect(&hub, 2);

    alice.send_json(r#"{"type":"chat","to":2,"content":"hi"}"#);

    let chat = bob.expect_kind(EnvelopeKind::Chat).await;
    assert_eq!(chat.from(), UserId(1));
    assert_eq!(chat.to(), UserId(2));
    assert_eq!(chat.content(), "hi");
    assert!(!chat.encrypted());

    let sent = alice.expect_kind(EnvelopeKind::Sent).await;
    assert_eq!(sent.to(), UserId(2));
    assert_eq!(sent.data().unwrap()["content"], "hi");

    assert_eq!(
        store.calls(),
        vec![StoreCall::Create {
            sender: UserId(1),
            recipient: UserId(2),
            content: "hi".to_string(),
            encrypted: false,
        }]
    );
}

#[tokio::test]
async fn test_chat_to_offline_user_is_stored_and_confirmed() {
    let store = Arc::new(RecordingStore::new());
    let hub = test_hub(store.clone(), config());
    let mut alice = connect(&hub, 1);

    alice.send_json(r#"{"type":"chat","to":2,"content":"see you later","encrypted":true}"#);

    let sent = alice.expect_kind(EnvelopeKind::Sent).await;
    assert_eq!(sent.to(), UserId(2));

    let stored = store.messages();
    assert_eq!(stored.len(), 1);
    assert!(stored[0].encrypted);
    assert!(!stored[0].read);
    assert!(!hub.is_online(UserId(2)));
}

#[tokio::test]
async fn test_read_receipt_reaches_original_sender() {
    let store = Arc::new(RecordingStore::new());
    let hub = test_hub(store.clone(), config());
    let mut alice = connect(&hub, 1);
    let mut bob = connect(&hub, 2);

    alice.send_json(r#"{"type":"chat","to":2,"content":"hi"}"#);
    bob.expect_kind(EnvelopeKind::Chat).await;

    bob.send_json(r#"{"type":"read","to":1}"#);

    let receipt = alice.expect_kind(EnvelopeKind::Read).await;
    assert_eq!(receipt.from(), UserId(2));
    assert_eq!(receipt.to(), UserId(1));
    assert!(store.calls().contains(&StoreCall::MarkRead {
        sender: UserId(1),
        recipient: UserId(2),
    }));
    assert!(store.messages().iter().all(|m| m.read));
}

#[tokio::test]
async fn test_sender_identity_cannot_be_spoofed() {
    let store = Arc::new(RecordingStore::new());
    let hub = test_hub(store.clone(), config());
    let alice = connect(&hub, 1);
    let mut bob = connect(&hub, 2);

    alice.send_json(r#"{"type":"chat","from":99,"to":2,"content":"x"}"#);

    let chat = bob.expect_kind(EnvelopeKind::Chat).await;
    assert_eq!(chat.from(), UserId(1));
    assert!(matches!(
        &store.calls()[0],
        StoreCall::Create { sender, .. } if *sender == UserId(1)
    ));
}

#[tokio::test]
async fn test_presence_online_and_offline() {
    let hub = test_hub(Arc::new(RecordingStore::new()), config());
    let mut alice = connect(&hub, 1);
    let bob = connect(&hub, 2);

    let online = alice.expect_kind(EnvelopeKind::Status).await;
    assert_eq!(online.from(), UserId(2));
    assert_eq!(online.data().unwrap()["online"], true);

    bob.send_frame(Frame::Close(None));

    let offline = alice.expect_kind(EnvelopeKind::Status).await;
    assert_eq!(offline.from(), UserId(2));
    assert_eq!(offline.data().unwrap()["online"], false);
    eventually(|| !hub.is_online(UserId(2))).await;
}

#[tokio::test]
async fn test_reconnect_supersedes_previous_session() {
    let hub = test_hub(Arc::new(RecordingStore::new()), config());
    let mut first = connect(&hub, 1);
    let mut bob = connect(&hub, 2);
    let mut second = connect(&hub, 1);

    let close = first.expect_closed().await.expect("close frame");
    assert_eq!(close.code, 4000);
    assert_eq!(hub.connection_count(), 2);

    // Bob sees user 1 come online again and never go offline
    let statuses: Vec<_> = bob
        .collect_for(Duration::from_millis(200))
        .await
        .into_iter()
        .filter(|e| e.kind() == &EnvelopeKind::Status)
        .map(|e| e.data().unwrap()["online"].as_bool().unwrap())
        .collect();
    assert_eq!(statuses, vec![true]);

    bob.send_json(r#"{"type":"chat","to":1,"content":"which one?"}"#);
    let chat = second.expect_kind(EnvelopeKind::Chat).await;
    assert_eq!(chat.content(), "which one?");
    assert!(first.next_frame().await.is_none());
}

#[tokio::test]
async fn test_unanswered_keepalive_closes_connection() {
    let hub = test_hub(
        Arc::new(RecordingStore::new()),
        HubConfig {
            keepalive_interval: Duration::from_millis(100),
            keepalive_timeout: Duration::from_millis(100),
            ..config()
        },
    );
    let mut alice = connect(&hub, 1);

    assert!(matches!(alice.next_frame().await, Some(Frame::Ping(_))));
    let close = alice.expect_closed().await.expect("close frame");
    assert_eq!(close.code, 1001);
    eventually(|| !hub.is_online(UserId(1))).await;
}

#[tokio::test]
async fn test_answered_keepalive_keeps_connection() {
    let hub = test_hub(
        Arc::new(RecordingStore::new()),
        HubConfig {
            keepalive_interval: Duration::from_millis(50),
            keepalive_timeout: Duration::from_millis(200),
            ..config()
        },
    );
    let mut alice = connect(&hub, 1);

    let mut pings = 0;
    while pings < 3 {
        match alice.next_frame().await {
            Some(Frame::Ping(payload)) => {
                alice.send_frame(Frame::Pong(payload));
                pings += 1;
            }
            other => panic!("Unexpected frame {other:?}"),
        }
    }
    assert!(hub.is_online(UserId(1)));
}

#[tokio::test]
async fn test_transport_error_unregisters() {
    let hub = test_hub(Arc::new(RecordingStore::new()), config());
    let mut alice = connect(&hub, 1);
    let bob = connect(&hub, 2);

    bob.fail("connection reset");

    eventually(|| !hub.is_online(UserId(2))).await;
    // First status is bob coming online
    let online = alice.expect_kind(EnvelopeKind::Status).await;
    assert_eq!(online.data().unwrap()["online"], true);
    let offline = alice.expect_kind(EnvelopeKind::Status).await;
    assert_eq!(offline.data().unwrap()["online"], false);
}

#[tokio::test]
async fn test_stream_end_unregisters() {
    let hub = test_hub(Arc::new(RecordingStore::new()), config());
    let mut alice = connect(&hub, 1);

    alice.hang_up();

    eventually(|| hub.connection_count() == 0).await;
    assert_eq!(alice.expect_closed().await.map(|f| f.code), Some(1000));
}

#[tokio::test]
async fn test_oversized_frame_closes_connection() {
    let hub = test_hub(
        Arc::new(RecordingStore::new()),
        HubConfig {
            max_frame_bytes: 64,
            ..config()
        },
    );
    let mut alice = connect(&hub, 1);

    alice.send_json(&format!(r#"{{"type":"chat","to":2,"content":"{}"}}"#, "x".repeat(100)));

    let close = alice.expect_closed().await.expect("close frame");
    assert_eq!(close.code, 1009);
    eventually(|| !hub.is_online(UserId(1))).await;
}

#[tokio::test]
async fn test_malformed_envelope_keeps_connection() {
    let hub = test_hub(Arc::new(RecordingStore::new()), config());
    let mut alice = connect(&hub, 1);

    alice.send_json("{not json");
    alice.send_json(r#"{"type":"reaction","to":2}"#);
    alice.send_json(r#"{"type":"ping"}"#);

    let pong = alice.expect_kind(EnvelopeKind::Pong).await;
    assert_eq!(pong.to(), UserId(1));
    assert!(hub.is_online(UserId(1)));
}

#[tokio::test]
async fn test_online_users_request() {
    let hub = test_hub(Arc::new(RecordingStore::new()), config());
    let mut alice = connect(&hub, 3);
    let _bob = connect(&hub, 1);

    alice.send_json(r#"{"type":"online_users"}"#);

    let reply = alice.expect_kind(EnvelopeKind::OnlineUsers).await;
    let data = reply.data().unwrap();
    assert_eq!(data["count"], 2);
    assert_eq!(data["users"], serde_json::json!([1, 3]));
}

#[tokio::test]
async fn test_slow_consumer_is_evicted() {
    let hub = test_hub(
        Arc::new(RecordingStore::new()),
        HubConfig {
            outbound_capacity: 4,
            ..config()
        },
    );
    let (transport, _stalled_client) = stalled_transport_pair();
    hub.accept(transport, UserId(2));
    let mut alice = connect(&hub, 1);

    for _ in 0..16 {
        alice.send_json(r#"{"type":"typing","to":2}"#);
    }

    eventually(|| !hub.is_online(UserId(2))).await;
    let offline = alice.expect_kind(EnvelopeKind::Status).await;
    assert_eq!(offline.from(), UserId(2));
    assert_eq!(offline.data().unwrap()["online"], false);

    // Unrelated connection unaffected
    assert!(hub.is_online(UserId(1)));
    alice.send_json(r#"{"type":"ping"}"#);
    alice.expect_kind(EnvelopeKind::Pong).await;
}

#[tokio::test]
async fn test_failure_notice_policy() {
    let hub = test_hub(
        Arc::new(FailingStore),
        HubConfig {
            failure_notice: FailureNotice::NotifySender,
            ..config()
        },
    );
    let mut alice = connect(&hub, 1);

    alice.send_json(r#"{"type":"chat","to":2,"content":"lost"}"#);

    let error = alice.expect_kind(EnvelopeKind::Error).await;
    assert_eq!(error.data().unwrap()["code"], "MESSAGE_SAVE_FAILED");
    let rest = alice.collect_for(Duration::from_millis(100)).await;
    assert!(rest.iter().all(|e| e.kind() != &EnvelopeKind::Sent));
}

#[tokio::test]
async fn test_silent_policy_sends_nothing_on_failure() {
    let hub = test_hub(Arc::new(FailingStore), config());
    let mut alice = connect(&hub, 1);

    alice.send_json(r#"{"type":"chat","to":2,"content":"lost"}"#);

    assert!(alice.collect_for(Duration::from_millis(200)).await.is_empty());
    assert!(hub.is_online(UserId(1)));
}

#[tokio::test]
async fn test_shutdown_closes_everyone() {
    let hub = test_hub(Arc::new(RecordingStore::new()), config());
    let mut alice = connect(&hub, 1);
    let mut bob = connect(&hub, 2);

    assert_eq!(hub.shutdown().await, 2);
    assert_eq!(hub.connection_count(), 0);
    assert_eq!(alice.expect_closed().await.map(|f| f.code), Some(1001));
    assert_eq!(bob.expect_closed().await.map(|f| f.code), Some(1001));
}
