//! Integration tests against a real RabbitMQ broker
//!
//! These tests start RabbitMQ via testcontainers to ensure:
//! - Queues are declared and become ready
//! - Confirmed publishes are acknowledged by the broker
//! - Consumers receive and acknowledge messages
//! - Rejected credentials stop the client without retrying
//!
//! Run with `cargo test -p broker -- --ignored` (requires Docker).

use broker::{BrokerClient, BrokerError, ClientConfig, ConnectionState};
use futures::StreamExt;
use std::time::Duration;
use test_utils::{assertions::*, TestDataBuilder, TestRabbitMq};

const WAIT: Duration = Duration::from_secs(30);

// ============================================================================
// Publish / Consume
// ============================================================================

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_confirmed_publish_and_consume() {
    let rabbit = TestRabbitMq::new().await;
    let builder = TestDataBuilder::from_test_name("confirmed_publish_and_consume");
    let queue = builder.queue_name("orders");

    let client = BrokerClient::new(rabbit.amqp_url(), ClientConfig::default());
    tokio::time::timeout(WAIT, client.ensure_queue(&queue))
        .await
        .expect("queue not ready in time")
        .unwrap();

    for index in 0..3 {
        client.send_confirmed(&queue, &builder.payload(index)).await.unwrap();
    }

    let mut deliveries = client.consume(&queue).await.unwrap();
    for index in 0..3 {
        let delivery = tokio::time::timeout(WAIT, deliveries.next())
            .await
            .expect("no delivery in time");
        let delivery = assert_some(delivery, "delivery stream ended").unwrap();
        assert_payload_eq(&delivery.data, &builder.payload(index), "delivery order");
        delivery.ack().await.unwrap();
    }

    client.close().await.unwrap();
    assert_eq!(client.connection_state(), ConnectionState::Closed);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_unconfirmed_publish() {
    let rabbit = TestRabbitMq::new().await;
    let builder = TestDataBuilder::from_test_name("unconfirmed_publish");
    let queue = builder.queue_name("events");

    let client = BrokerClient::new(rabbit.amqp_url(), ClientConfig::default());
    client.ensure_queue(&queue).await.unwrap();
    client.send_unconfirmed(&queue, &builder.payload(0)).await.unwrap();

    let mut deliveries = client.consume(&queue).await.unwrap();
    let delivery = tokio::time::timeout(WAIT, deliveries.next())
        .await
        .expect("no delivery in time");
    let delivery = assert_some(delivery, "delivery stream ended").unwrap();
    assert_eq!(delivery.routing_key, queue);
    delivery.ack().await.unwrap();

    client.close().await.unwrap();
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_rejected_delivery_is_redelivered() {
    let rabbit = TestRabbitMq::new().await;
    let builder = TestDataBuilder::from_test_name("rejected_delivery");
    let queue = builder.queue_name("jobs");

    let client = BrokerClient::new(rabbit.amqp_url(), ClientConfig::default());
    client.ensure_queue(&queue).await.unwrap();
    client.send_confirmed(&queue, &builder.payload(0)).await.unwrap();

    let mut deliveries = client.consume(&queue).await.unwrap();
    let first = deliveries.next().await.unwrap().unwrap();
    assert!(!first.redelivered);
    first.reject(true).await.unwrap();

    let second = tokio::time::timeout(WAIT, deliveries.next())
        .await
        .expect("no redelivery in time")
        .unwrap()
        .unwrap();
    assert!(second.redelivered);
    assert_payload_eq(&second.data, &builder.payload(0), "redelivered payload");
    second.ack().await.unwrap();

    client.close().await.unwrap();
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_bad_credentials_are_fatal() {
    let rabbit = TestRabbitMq::new().await;
    let builder = TestDataBuilder::from_test_name("bad_credentials");

    let client = BrokerClient::new(rabbit.amqp_url_with_bad_credentials(), ClientConfig::default());
    let result = tokio::time::timeout(WAIT, client.ensure_queue(&builder.queue_name("orders")))
        .await
        .expect("client kept retrying");

    assert!(
        matches!(result, Err(BrokerError::Fatal(_)) | Err(BrokerError::Shutdown)),
        "unexpected result: {result:?}"
    );
    assert_eq!(client.connection_state(), ConnectionState::Fatal);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_operations_fail_after_close() {
    let rabbit = TestRabbitMq::new().await;
    let builder = TestDataBuilder::from_test_name("operations_after_close");
    let queue = builder.queue_name("orders");

    let client = BrokerClient::new(rabbit.amqp_url(), ClientConfig::default());
    client.ensure_queue(&queue).await.unwrap();
    client.close().await.unwrap();

    assert!(matches!(client.close().await, Err(BrokerError::AlreadyClosed)));
    assert!(matches!(client.ensure_queue(&queue).await, Err(BrokerError::AlreadyClosed)));
    assert!(matches!(client.send_confirmed(&queue, b"x").await, Err(BrokerError::NotConnected)));
    assert!(matches!(client.consume(&queue).await, Err(BrokerError::NotConnected)));
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_broker_loss_marks_queue_not_ready() {
    let rabbit = TestRabbitMq::new().await;
    let builder = TestDataBuilder::from_test_name("broker_loss");
    let queue = builder.queue_name("orders");

    let client = BrokerClient::new(rabbit.amqp_url(), ClientConfig::default());
    client.ensure_queue(&queue).await.unwrap();

    let mut watch = client.watch_queue(&queue).unwrap();
    rabbit.stop().await;

    let state = tokio::time::timeout(WAIT, watch.wait_for(|s| !s.is_ready()))
        .await
        .expect("queue still ready after broker stopped");
    assert!(state.is_some());
    assert!(matches!(
        client.send_unconfirmed(&queue, b"x").await,
        Err(BrokerError::NotConnected)
    ));
}
