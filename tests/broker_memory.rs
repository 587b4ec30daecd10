// tests/broker_memory.rs

use serde::{Deserialize, Serialize};
use tokio::time::{timeout, Duration};

use mom_trigger::{
    // ---
    create_memory_broker,
    BrokerErrorKind,
    ConnectionDescriptor,
    EntityIdentity,
    MemoryBroker,
    MemoryBrokerOptions,
    OutgoingMessage,
    ReceiveMode,
};

const WAIT: Duration = Duration::from_millis(50);

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct Order {
    id: u32,
    sku: String,
}

#[tokio::test]
async fn memory_send_then_receive_delivers() {
    // ---
    // Arrange
    // ---
    let broker = create_memory_broker();
    let entity = EntityIdentity::subscription("orders", "audit", ConnectionDescriptor::named("Messaging"));
    let receiver = broker
        .provider()
        .create_receiver(&entity, 0)
        .await
        .expect("failed to create receiver");

    let order = Order {
        id: 7,
        sku: "A-100".into(),
    };
    let message = OutgoingMessage::json(&order)
        .expect("serializable order")
        .with_message_id("order-7");

    // ---
    // Act
    // ---
    let sequence = broker.send(entity.path(), message);
    let received = timeout(Duration::from_millis(500), receiver.receive(10, Duration::from_secs(1)))
        .await
        .expect("timed out waiting for message")
        .expect("receive failed");

    // ---
    // Assert
    // ---
    assert_eq!(received.len(), 1);
    let message = &received[0];
    assert_eq!(message.message_id, "order-7");
    assert_eq!(message.sequence_number, sequence);
    assert_eq!(message.delivery_count, 1);
    assert_eq!(message.content_type.as_deref(), Some("application/json"));
    assert_eq!(message.deserialize_body::<Order>().unwrap(), order);
    assert_eq!(broker.locked_count(entity.path()), 1);
}

#[tokio::test]
async fn memory_receive_waits_for_later_send() {
    // ---
    let broker = create_memory_broker();
    let receiver = broker.receiver("q");

    let sender = broker.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        sender.send("q", OutgoingMessage::new("late"));
    });

    let received = receiver.receive(1, Duration::from_secs(2)).await.unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(&received[0].body[..], b"late");
}

#[tokio::test]
async fn memory_abandon_redelivers_with_higher_count() {
    // ---
    let broker = create_memory_broker();
    broker.send("q", OutgoingMessage::new("retry-me"));
    let receiver = broker.receiver("q");

    let first = receiver.receive(1, WAIT).await.unwrap().remove(0);
    receiver.abandon(&[first.lock_token.clone()]).await.unwrap();
    let second = receiver.receive(1, WAIT).await.unwrap().remove(0);

    assert_eq!(second.message_id, first.message_id);
    assert_eq!(second.delivery_count, 2);
    assert_ne!(second.lock_token, first.lock_token);

    let err = receiver.complete(&[first.lock_token]).await.unwrap_err();
    assert_eq!(err.kind(), BrokerErrorKind::LockLost);
    receiver.complete(&[second.lock_token]).await.unwrap();
    assert_eq!(broker.available_count("q"), 0);
    assert_eq!(broker.locked_count("q"), 0);
}

#[tokio::test]
async fn memory_sessions_are_exclusive() {
    // ---
    let broker = create_memory_broker();
    broker.send("q", OutgoingMessage::new("a1").with_session_id("a"));
    broker.send("q", OutgoingMessage::new("a2").with_session_id("a"));

    let first = broker.session_client("q");
    let second = broker.session_client("q");

    let session = first.accept_session(WAIT).await.unwrap();
    assert_eq!(session.session_id(), "a");

    let err = second.accept_session(WAIT).await.unwrap_err();
    assert_eq!(err.kind(), BrokerErrorKind::Timeout);

    // Plain receivers never see session messages.
    assert!(broker.receiver("q").receive(1, WAIT).await.unwrap().is_empty());

    let messages = session.receiver().receive(10, WAIT).await.unwrap();
    let bodies: Vec<&[u8]> = messages.iter().map(|m| &m.body[..]).collect();
    assert_eq!(bodies, [b"a1".as_slice(), b"a2".as_slice()]);

    session.receiver().close().await.unwrap();
    let reaccepted = second.accept_session(WAIT).await.unwrap();
    let again = reaccepted.receiver().receive(10, WAIT).await.unwrap();
    assert_eq!(again.len(), 2);
    assert!(again.iter().all(|m| m.delivery_count == 1));
}

#[tokio::test]
async fn memory_receive_and_delete_needs_no_settlement() {
    // ---
    let broker = MemoryBroker::new(MemoryBrokerOptions {
        receive_mode: ReceiveMode::ReceiveAndDelete,
        ..Default::default()
    });
    broker.send("q", OutgoingMessage::new("once"));
    let receiver = broker.receiver("q");

    assert_eq!(receiver.receive_mode(), ReceiveMode::ReceiveAndDelete);
    let received = receiver.receive(1, WAIT).await.unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(broker.available_count("q"), 0);
    assert_eq!(broker.locked_count("q"), 0);
}

#[tokio::test]
async fn memory_closed_receiver_is_disposed() {
    // ---
    let broker = create_memory_broker();
    let receiver = broker.receiver("q");
    receiver.close().await.unwrap();
    receiver.close().await.unwrap();

    assert!(receiver.is_closed());
    let err = receiver.receive(1, WAIT).await.unwrap_err();
    assert_eq!(err.kind(), BrokerErrorKind::Disposed);
}
