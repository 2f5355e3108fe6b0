//! Text and Signal Bus Integration Tests

mod harness;

use std::sync::Arc;
use std::time::Duration;

use callmesh::{ConnectionId, MessageType, SignalFilter, SignalMessage, StreamRole, TypeDetail};
use harness::{wait_until, Mesh};
use parking_lot::Mutex;

#[tokio::test]
async fn test_text_reaches_others_and_echoes_locally() {
    let mesh = Mesh::new();
    let mut a = mesh.join("con_a");
    let mut b = mesh.join("con_b");
    let mut c = mesh.join("con_c");

    a.send_text("hello").await.unwrap();

    // The repeater answers before send() returns
    let echo = a.drain_texts();
    assert_eq!(echo.len(), 1);
    assert_eq!(echo[0].system.stream_role, StreamRole::Publisher);
    assert_eq!(echo[0].custom.text, "hello");

    for receiver in [&mut b, &mut c] {
        let received = receiver.next_text().await;
        assert_eq!(received.custom.text, "hello");
        assert_eq!(received.system.from, ConnectionId::from("con_a"));
        assert_eq!(received.system.stream_role, StreamRole::Subscriber);
    }

    // Our own broadcast comes back through the session but is filtered out
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(a.drain_texts().is_empty());
}

#[tokio::test]
async fn test_text_is_logged() {
    let mesh = Mesh::new();
    let (a, log) = mesh.join_recording("con_a");
    let mut b = mesh.join("con_b");

    a.send_text("for the record").await.unwrap();
    b.next_text().await;

    let counter = log.clone();
    wait_until("text record", move || {
        let counter = counter.clone();
        async move { counter.count() == 1 }
    })
    .await;

    let record = log.records().remove(0);
    assert_eq!(record.message_type, MessageType::Text);
    assert_eq!(record.connection_id, ConnectionId::from("con_a"));
    assert_eq!(
        record.type_detail,
        TypeDetail::Text {
            text: "for the record".to_string()
        }
    );
}

#[tokio::test]
async fn test_text_send_fails_when_disconnected() {
    let mesh = Mesh::new();
    let mut a = mesh.participant("con_a", Arc::new(callmesh::NoopTransferLog));

    let result = a.send_text("nobody hears this").await;
    assert!(result.is_err());
    // The local echo still ran
    assert_eq!(a.drain_texts().len(), 1);
}

#[tokio::test]
async fn test_bus_routes_custom_signals() {
    let mesh = Mesh::new();
    let a = mesh.join("con_a");
    let b = mesh.join("con_b");
    let c = mesh.join("con_c");

    let seen: Arc<Mutex<Vec<(String, SignalMessage)>>> = Arc::new(Mutex::new(Vec::new()));
    for participant in [&a, &b, &c] {
        let seen = seen.clone();
        let name = participant.id.to_string();
        participant.transports.bus().on_signal(
            Some("mute"),
            SignalFilter::NotOwn,
            move |message: SignalMessage| {
                let seen = seen.clone();
                let name = name.clone();
                async move {
                    seen.lock().push((name, message));
                }
            },
        );
    }

    // Broadcast: everyone but the sender
    a.transports
        .bus()
        .send("mute", &serde_json::json!({"muted": true}), &[])
        .await
        .unwrap();
    // Targeted: only c
    b.transports
        .bus()
        .send("mute", &serde_json::json!({"muted": false}), &[c.id.clone()])
        .await
        .unwrap();

    let counter = seen.clone();
    wait_until("three deliveries", move || {
        let counter = counter.clone();
        async move { counter.lock().len() == 3 }
    })
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let seen = seen.lock();
    assert_eq!(seen.len(), 3);
    let to_c: Vec<_> = seen.iter().filter(|(name, _)| name == "con_c").collect();
    assert_eq!(to_c.len(), 2);
    assert!(seen
        .iter()
        .all(|(name, message)| name.as_str() != message.from.as_str()));
    assert!(seen
        .iter()
        .any(|(_, message)| message.from.as_str() == "con_b" && message.data["muted"] == false));
}
