use super::*;
use std::time::Duration;

fn endpoint() -> BrokerEndpoint {
    BrokerEndpoint::new("memory", 5672, "guest", "guest")
}

async fn channel(broker: &MemoryBroker) -> MemoryChannel {
    let link = broker.open(&endpoint()).await.unwrap();
    link.create_channel().await.unwrap()
}

fn props(correlation_id: &str) -> MessageProperties {
    MessageProperties {
        correlation_id: Some(correlation_id.to_string()),
        ..Default::default()
    }
}

async fn next(stream: &mut DeliveryStream) -> Delivery {
    tokio::time::timeout(Duration::from_secs(1), stream.next())
        .await
        .expect("delivery expected")
        .expect("stream ended")
        .unwrap()
}

#[tokio::test]
async fn test_publish_and_consume() {
    let broker = MemoryBroker::new();
    let ch = channel(&broker).await;
    ch.declare_queue("svc.op", QueueKind::Durable).await.unwrap();

    let mut stream = ch.consume("svc.op").await.unwrap();
    ch.publish("svc.op", props("c1"), b"hello".to_vec())
        .await
        .unwrap();

    let delivery = next(&mut stream).await;
    assert_eq!(delivery.body, b"hello");
    assert_eq!(delivery.properties.correlation_id.as_deref(), Some("c1"));
    ch.ack(delivery.tag).await.unwrap();
    assert_eq!(broker.unacked_count(), 0);
}

#[tokio::test]
async fn test_unknown_queue_drops_message() {
    let broker = MemoryBroker::new();
    let ch = channel(&broker).await;

    assert!(ch.publish("nowhere", props("c1"), vec![]).await.is_ok());
    assert!(!broker.queue_exists("nowhere"));
    assert!(ch.consume("nowhere").await.is_err());
}

#[tokio::test]
async fn test_exclusive_queue_named_by_server_and_removed_on_close() {
    let broker = MemoryBroker::new();
    let ch = channel(&broker).await;

    let name = ch.declare_queue("", QueueKind::Exclusive).await.unwrap();
    assert!(name.starts_with("amq.gen-"));
    assert!(broker.queue_exists(&name));

    ch.close().await.unwrap();
    assert!(!broker.queue_exists(&name));
    assert!(ch.publish(&name, props("c1"), vec![]).await.is_err());
}

#[tokio::test]
async fn test_durable_queue_requires_name() {
    let broker = MemoryBroker::new();
    let ch = channel(&broker).await;
    assert!(matches!(
        ch.declare_queue("", QueueKind::Durable).await,
        Err(BrokerError::Declare(_))
    ));
}

#[tokio::test]
async fn test_prefetch_limits_unacked_deliveries() {
    let broker = MemoryBroker::new();
    let ch = channel(&broker).await;
    ch.declare_queue("svc.op", QueueKind::Durable).await.unwrap();
    ch.set_prefetch(1).await.unwrap();

    let mut stream = ch.consume("svc.op").await.unwrap();
    for id in ["a", "b"] {
        ch.publish("svc.op", props(id), vec![]).await.unwrap();
    }

    let first = next(&mut stream).await;
    let blocked = tokio::time::timeout(Duration::from_millis(30), stream.next()).await;
    assert!(blocked.is_err(), "second delivery must wait for the ack");

    ch.ack(first.tag).await.unwrap();
    let second = next(&mut stream).await;
    assert_eq!(second.properties.correlation_id.as_deref(), Some("b"));
}

#[tokio::test]
async fn test_competing_consumers_split_messages() {
    let broker = MemoryBroker::new();
    let a = channel(&broker).await;
    let b = channel(&broker).await;
    a.declare_queue("svc.op", QueueKind::Durable).await.unwrap();

    let mut stream_a = a.consume("svc.op").await.unwrap();
    let mut stream_b = b.consume("svc.op").await.unwrap();
    for i in 0..4 {
        a.publish("svc.op", props(&i.to_string()), vec![])
            .await
            .unwrap();
    }

    let mut received = 0;
    for _ in 0..4 {
        tokio::select! {
            Some(Ok(d)) = stream_a.next() => { a.ack(d.tag).await.unwrap(); received += 1; }
            Some(Ok(d)) = stream_b.next() => { b.ack(d.tag).await.unwrap(); received += 1; }
        }
    }
    assert_eq!(received, 4);
    assert!(tokio::time::timeout(Duration::from_millis(20), stream_a.next())
        .await
        .is_err());
}

#[tokio::test]
async fn test_unacked_delivery_requeued_on_close() {
    let broker = MemoryBroker::new();
    let first = channel(&broker).await;
    first
        .declare_queue("svc.op", QueueKind::Durable)
        .await
        .unwrap();
    let mut stream = first.consume("svc.op").await.unwrap();
    first.publish("svc.op", props("c1"), vec![]).await.unwrap();
    let _unacked = next(&mut stream).await;
    assert_eq!(broker.unacked_count(), 1);

    first.close().await.unwrap();
    assert!(tokio::time::timeout(Duration::from_secs(1), stream.next())
        .await
        .unwrap()
        .is_none());

    let second = channel(&broker).await;
    let mut stream = second.consume("svc.op").await.unwrap();
    let redelivered = next(&mut stream).await;
    assert_eq!(redelivered.properties.correlation_id.as_deref(), Some("c1"));
}

#[tokio::test]
async fn test_severed_link_ends_streams() {
    let broker = MemoryBroker::new();
    let link = broker.open(&endpoint()).await.unwrap();
    let ch = link.create_channel().await.unwrap();
    ch.declare_queue("svc.op", QueueKind::Durable).await.unwrap();
    let mut stream = ch.consume("svc.op").await.unwrap();

    broker.sever_connections();

    assert!(!link.is_connected());
    assert!(tokio::time::timeout(Duration::from_secs(1), stream.next())
        .await
        .unwrap()
        .is_none());
    assert!(link.create_channel().await.is_err());
}

#[tokio::test]
async fn test_refused_connections() {
    let broker = MemoryBroker::new();
    broker.set_refuse_connections(true);
    assert!(matches!(
        broker.open(&endpoint()).await,
        Err(BrokerError::Connection(_))
    ));
    assert_eq!(broker.connections_opened(), 0);
}
