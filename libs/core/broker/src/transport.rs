//! Transport capability traits
//!
//! The client never talks to a wire library directly. It drives a broker
//! through three small traits:
//!
//! - [`Connector`] dials an address and yields a [`Connection`]
//! - [`Connection`] opens [`Channel`]s and reports its own closure
//! - [`Channel`] declares queues, publishes with per-message confirmation
//!   and opens delivery streams
//!
//! [`crate::amqp`] implements them on top of `lapin`; [`crate::mock`] keeps an
//! in-memory broker for tests.

use crate::config::QueueOptions;
use crate::error::TransportError;
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::watch;

/// Dials a broker.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a new connection to `addr`.
    async fn dial(&self, addr: &str) -> Result<Arc<dyn Connection>, TransportError>;
}

/// A live broker connection.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Open a new channel multiplexed over this connection.
    async fn open_channel(&self) -> Result<Arc<dyn Channel>, TransportError>;

    /// Close notification point for this connection.
    fn close_signal(&self) -> CloseSignal;

    /// Close the connection.
    async fn close(&self) -> Result<(), TransportError>;
}

/// A broker channel. One channel incarnation serves one queue.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Put the channel into publisher confirmation mode.
    async fn enable_confirms(&self) -> Result<(), TransportError>;

    /// Declare `name` with the given properties. Declaring an existing queue
    /// with matching properties is a no-op.
    async fn declare_queue(&self, name: &str, options: &QueueOptions) -> Result<(), TransportError>;

    /// Publish `payload` to `queue` through the default exchange.
    ///
    /// Returns once the transport accepted the message; the returned
    /// [`PendingConfirm`] resolves when the broker acknowledges it.
    async fn publish(
        &self,
        queue: &str,
        payload: &[u8],
        properties: &MessageProperties,
    ) -> Result<PendingConfirm, TransportError>;

    /// Limit the number of unacknowledged deliveries on this channel.
    async fn set_prefetch(&self, count: u16) -> Result<(), TransportError>;

    /// Start consuming `queue` with manual acknowledgement.
    async fn consume(&self, queue: &str, consumer_tag: &str)
    -> Result<DeliveryStream, TransportError>;

    /// Close notification point for this channel.
    fn close_signal(&self) -> CloseSignal;

    /// Close the channel.
    async fn close(&self) -> Result<(), TransportError>;
}

/// Properties attached to a published message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageProperties {
    pub content_type: String,
}

impl MessageProperties {
    pub fn new(content_type: impl Into<String>) -> Self {
        Self {
            content_type: content_type.into(),
        }
    }
}

/// Why a connection or channel closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    /// Broker reply code (320 connection-forced, 504 channel-error, ...)
    pub code: u16,
    /// Broker reply text or local error description
    pub text: String,
}

impl CloseReason {
    pub fn new(code: u16, text: impl Into<String>) -> Self {
        Self {
            code,
            text: text.into(),
        }
    }

    /// The notifier went away without reporting a reason.
    fn dropped() -> Self {
        Self::new(0, "close notifier dropped")
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.text)
    }
}

/// Sending side of a close notification point.
///
/// The first [`notify`](CloseNotifier::notify) wins; later calls are ignored,
/// so each point fires at most once.
#[derive(Debug, Clone)]
pub struct CloseNotifier {
    tx: Arc<watch::Sender<Option<CloseReason>>>,
}

impl CloseNotifier {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Fire the notification. Returns false if it had already fired.
    pub fn notify(&self, reason: CloseReason) -> bool {
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        })
    }

    /// Create a reader for this notification point.
    pub fn signal(&self) -> CloseSignal {
        CloseSignal {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for CloseNotifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving side of a close notification point. Cheap to clone; every clone
/// observes the same single close event.
#[derive(Debug, Clone)]
pub struct CloseSignal {
    rx: watch::Receiver<Option<CloseReason>>,
}

impl CloseSignal {
    /// Whether the close event already happened.
    pub fn is_closed(&self) -> bool {
        self.rx.borrow().is_some() || self.rx.has_changed().is_err()
    }

    /// Wait for the close event.
    ///
    /// A dropped notifier counts as closed.
    pub async fn closed(&self) -> CloseReason {
        let mut rx = self.rx.clone();
        match rx.wait_for(Option::is_some).await {
            Ok(reason) => reason.clone().unwrap_or_else(CloseReason::dropped),
            Err(_) => CloseReason::dropped(),
        }
    }
}

/// Broker verdict for one published message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Ack,
    Nack,
}

impl Confirmation {
    pub fn is_ack(&self) -> bool {
        matches!(self, Confirmation::Ack)
    }
}

/// Confirmation point for one publish on one channel incarnation.
///
/// Resolves to the broker's verdict, or to a `Closed` transport error when
/// the channel goes away before the verdict arrives.
pub struct PendingConfirm {
    inner: BoxFuture<'static, Result<Confirmation, TransportError>>,
}

impl PendingConfirm {
    pub fn new<F>(future: F) -> Self
    where
        F: Future<Output = Result<Confirmation, TransportError>> + Send + 'static,
    {
        Self {
            inner: Box::pin(future),
        }
    }

    /// A confirmation that is already known.
    pub fn ready(confirmation: Confirmation) -> Self {
        Self::new(futures::future::ready(Ok(confirmation)))
    }
}

impl Future for PendingConfirm {
    type Output = Result<Confirmation, TransportError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.as_mut().poll(cx)
    }
}

impl fmt::Debug for PendingConfirm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingConfirm").finish_non_exhaustive()
    }
}

/// Acknowledges one delivery.
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self) -> Result<(), TransportError>;
    async fn nack(&self, requeue: bool) -> Result<(), TransportError>;
    async fn reject(&self, requeue: bool) -> Result<(), TransportError>;
}

/// Stream of deliveries returned by [`Channel::consume`].
pub type DeliveryStream = BoxStream<'static, Result<Delivery, TransportError>>;

/// A message delivered to a consumer.
///
/// Every delivery must be acknowledged or rejected by the receiver; with
/// prefetch 1 the broker sends nothing more on this channel until it is.
pub struct Delivery {
    pub delivery_tag: u64,
    pub routing_key: String,
    pub redelivered: bool,
    pub data: Vec<u8>,
    acker: Box<dyn Acker>,
}

impl Delivery {
    pub fn new(
        delivery_tag: u64,
        routing_key: impl Into<String>,
        redelivered: bool,
        data: Vec<u8>,
        acker: Box<dyn Acker>,
    ) -> Self {
        Self {
            delivery_tag,
            routing_key: routing_key.into(),
            redelivered,
            data,
            acker,
        }
    }

    /// Positively acknowledge the delivery.
    pub async fn ack(&self) -> Result<(), TransportError> {
        self.acker.ack().await
    }

    /// Negatively acknowledge the delivery.
    pub async fn nack(&self, requeue: bool) -> Result<(), TransportError> {
        self.acker.nack(requeue).await
    }

    /// Reject the delivery.
    pub async fn reject(&self, requeue: bool) -> Result<(), TransportError> {
        self.acker.reject(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("len", &self.data.len())
            .finish()
    }
}
