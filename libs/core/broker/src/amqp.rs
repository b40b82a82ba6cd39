//! AMQP 0-9-1 transport built on `lapin`.

use crate::config::QueueOptions;
use crate::error::TransportError;
use crate::supervisor::redact_address;
use crate::transport::{
    Acker, Channel, CloseNotifier, CloseReason, CloseSignal, Confirmation, Connection, Connector,
    Delivery, DeliveryStream, MessageProperties, PendingConfirm,
};
use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    BasicRejectOptions, ConfirmSelectOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, ConnectionProperties};
use std::sync::Arc;
use tracing::{debug, warn};

/// AMQP reply codes reported on close.
const REPLY_SUCCESS: u16 = 200;
const CONNECTION_FORCED: u16 = 320;
const CHANNEL_ERROR: u16 = 504;

/// Dials RabbitMQ (or any AMQP 0-9-1 broker) with `lapin`.
#[derive(Debug, Clone)]
pub struct AmqpConnector {
    connection_name: Option<String>,
}

impl AmqpConnector {
    pub fn new() -> Self {
        Self {
            connection_name: None,
        }
    }

    /// Name shown for the connection in the broker's management UI.
    pub fn with_connection_name(mut self, name: impl Into<String>) -> Self {
        self.connection_name = Some(name.into());
        self
    }

    /// Connection properties running lapin's I/O on the current tokio
    /// runtime. Must be called from within that runtime.
    fn properties(&self) -> ConnectionProperties {
        let properties = ConnectionProperties::default()
            .with_executor(tokio_executor_trait::Tokio::current())
            .with_reactor(tokio_reactor_trait::Tokio);
        match &self.connection_name {
            Some(name) => properties.with_connection_name(name.clone().into()),
            None => properties,
        }
    }
}

impl Default for AmqpConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    async fn dial(&self, addr: &str) -> Result<Arc<dyn Connection>, TransportError> {
        addr.parse::<lapin::uri::AMQPUri>()
            .map_err(TransportError::invalid_address)?;

        let connection = lapin::Connection::connect(addr, self.properties()).await?;
        debug!(address = %redact_address(addr), "AMQP connection opened");

        let closed = CloseNotifier::new();
        let notifier = closed.clone();
        connection.on_error(move |err| {
            warn!(error = %err, "AMQP connection error");
            notifier.notify(CloseReason::new(CONNECTION_FORCED, err.to_string()));
        });

        Ok(Arc::new(AmqpConnection {
            inner: connection,
            closed,
        }))
    }
}

struct AmqpConnection {
    inner: lapin::Connection,
    closed: CloseNotifier,
}

#[async_trait]
impl Connection for AmqpConnection {
    async fn open_channel(&self) -> Result<Arc<dyn Channel>, TransportError> {
        let channel = self.inner.create_channel().await?;

        let closed = CloseNotifier::new();
        let notifier = closed.clone();
        let id = channel.id();
        channel.on_error(move |err| {
            debug!(channel = id, error = %err, "AMQP channel error");
            notifier.notify(CloseReason::new(CHANNEL_ERROR, err.to_string()));
        });

        Ok(Arc::new(AmqpChannel {
            inner: channel,
            closed,
        }))
    }

    fn close_signal(&self) -> CloseSignal {
        self.closed.signal()
    }

    async fn close(&self) -> Result<(), TransportError> {
        let result = self.inner.close(REPLY_SUCCESS, "Bye").await;
        self.closed
            .notify(CloseReason::new(REPLY_SUCCESS, "closed by client"));
        result.map_err(TransportError::from)
    }
}

struct AmqpChannel {
    inner: lapin::Channel,
    closed: CloseNotifier,
}

#[async_trait]
impl Channel for AmqpChannel {
    async fn enable_confirms(&self) -> Result<(), TransportError> {
        self.inner
            .confirm_select(ConfirmSelectOptions::default())
            .await?;
        Ok(())
    }

    async fn declare_queue(&self, name: &str, options: &QueueOptions) -> Result<(), TransportError> {
        let declare = QueueDeclareOptions {
            durable: options.durable,
            exclusive: options.exclusive,
            auto_delete: options.auto_delete,
            ..Default::default()
        };
        self.inner
            .queue_declare(name, declare, FieldTable::default())
            .await?;
        Ok(())
    }

    async fn publish(
        &self,
        queue: &str,
        payload: &[u8],
        properties: &MessageProperties,
    ) -> Result<PendingConfirm, TransportError> {
        let confirm = self
            .inner
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                payload,
                BasicProperties::default().with_content_type(properties.content_type.clone().into()),
            )
            .await?;

        Ok(PendingConfirm::new(async move {
            let confirmation = confirm.await?;
            Ok(if confirmation.is_nack() {
                Confirmation::Nack
            } else {
                Confirmation::Ack
            })
        }))
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), TransportError> {
        self.inner
            .basic_qos(count, BasicQosOptions::default())
            .await?;
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, TransportError> {
        let consumer = self
            .inner
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        let deliveries = consumer.map(|delivery| -> Result<Delivery, TransportError> {
            let delivery = delivery?;
            Ok(Delivery::new(
                delivery.delivery_tag,
                delivery.routing_key.as_str(),
                delivery.redelivered,
                delivery.data,
                Box::new(AmqpAcker {
                    inner: delivery.acker,
                }),
            ))
        });
        Ok(deliveries.boxed())
    }

    fn close_signal(&self) -> CloseSignal {
        self.closed.signal()
    }

    async fn close(&self) -> Result<(), TransportError> {
        let result = self.inner.close(REPLY_SUCCESS, "Bye").await;
        self.closed
            .notify(CloseReason::new(REPLY_SUCCESS, "closed by client"));
        result.map_err(TransportError::from)
    }
}

struct AmqpAcker {
    inner: lapin::acker::Acker,
}

#[async_trait]
impl Acker for AmqpAcker {
    async fn ack(&self) -> Result<(), TransportError> {
        self.inner.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<(), TransportError> {
        self.inner
            .nack(BasicNackOptions {
                requeue,
                ..Default::default()
            })
            .await?;
        Ok(())
    }

    async fn reject(&self, requeue: bool) -> Result<(), TransportError> {
        self.inner.reject(BasicRejectOptions { requeue }).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportErrorKind;

    #[tokio::test]
    async fn test_invalid_address_is_fatal() {
        let connector = AmqpConnector::new();
        let err = match connector.dial("http://not-amqp").await {
            Ok(_) => panic!("dial should fail"),
            Err(e) => e,
        };
        assert_eq!(err.kind(), TransportErrorKind::InvalidAddress);
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_properties_run_on_tokio() {
        let properties = AmqpConnector::new()
            .with_connection_name("broker-tests")
            .properties();
        assert!(properties.executor.is_some());
        assert!(properties.reactor.is_some());
    }
}
