//! In-memory broker for tests
//!
//! [`MockBroker`] implements [`Connector`] and hands out connections and
//! channels that behave like a single well-behaved broker, with hooks to
//! script failures:
//!
//! - dial outcomes ([`MockBroker::push_dial`])
//! - channel open failures ([`MockBroker::fail_open_channel`])
//! - confirmation verdicts ([`MockBroker::set_confirm_mode`], [`MockBroker::push_confirms`])
//! - connection and channel drops ([`MockBroker::drop_connection`], [`MockBroker::close_channel`])
//! - deliveries to consumers ([`MockBroker::deliver`])
//! - client-initiated channel close failures ([`MockBroker::fail_channel_close`])

use crate::client::lock;
use crate::config::QueueOptions;
use crate::error::TransportError;
use crate::transport::{
    Acker, Channel, CloseNotifier, CloseReason, CloseSignal, Confirmation, Connection, Connector,
    Delivery, DeliveryStream, MessageProperties, PendingConfirm,
};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Scripted result of one dial.
#[derive(Debug, Clone)]
pub enum DialOutcome {
    Connect,
    Fail(TransportError),
}

/// How the mock broker answers a publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmMode {
    Ack,
    Nack,
    /// Never answer; the confirm resolves to an error when the channel closes
    Silent,
}

/// A message the mock broker accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub queue: String,
    pub payload: Vec<u8>,
    pub content_type: String,
}

/// An acknowledgement sent by a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckRecord {
    Ack(u64),
    Nack { delivery_tag: u64, requeue: bool },
    Reject { delivery_tag: u64, requeue: bool },
}

/// In-memory broker. Clones share state.
#[derive(Clone, Default)]
pub struct MockBroker {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    dial_script: Mutex<VecDeque<DialOutcome>>,
    dials: AtomicUsize,
    open_failures: AtomicUsize,
    channels_opened: AtomicUsize,
    channels_closed: AtomicUsize,
    connections_closed: AtomicUsize,
    close_failures: Mutex<Vec<String>>,
    confirm_mode: Mutex<Option<ConfirmMode>>,
    confirm_script: Mutex<VecDeque<ConfirmMode>>,
    connection: Mutex<Option<Arc<MockConnection>>>,
    channels: Mutex<Vec<Arc<MockChannel>>>,
    published: Mutex<Vec<PublishedMessage>>,
    declared: Mutex<Vec<(String, QueueOptions)>>,
    acks: Arc<Mutex<Vec<AckRecord>>>,
    prefetch: Mutex<Option<u16>>,
    delivery_tags: AtomicU64,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the outcome of the next dial. Dials past the script connect.
    pub fn push_dial(&self, outcome: DialOutcome) {
        lock(&self.inner.dial_script).push_back(outcome);
    }

    /// Make the next `count` channel opens fail.
    pub fn fail_open_channel(&self, count: usize) {
        self.inner.open_failures.store(count, Ordering::SeqCst);
    }

    /// Make client-initiated closes of channels serving `queue` fail. The
    /// channel stays open until its connection closes.
    pub fn fail_channel_close(&self, queue: &str) {
        lock(&self.inner.close_failures).push(queue.to_string());
    }

    /// Verdict for publishes past the confirm script (default: ack).
    pub fn set_confirm_mode(&self, mode: ConfirmMode) {
        *lock(&self.inner.confirm_mode) = Some(mode);
    }

    /// Queue verdicts for the next publishes, in order.
    pub fn push_confirms(&self, modes: impl IntoIterator<Item = ConfirmMode>) {
        lock(&self.inner.confirm_script).extend(modes);
    }

    /// Close the current connection and all of its channels, as a broker
    /// restart would.
    pub fn drop_connection(&self) -> bool {
        let connection = lock(&self.inner.connection).take();
        match connection {
            Some(connection) => {
                connection.shut(CloseReason::new(320, "CONNECTION_FORCED - broker forced connection closure"));
                true
            }
            None => false,
        }
    }

    /// Close every open channel serving `queue`. Returns how many closed.
    pub fn close_channel(&self, queue: &str) -> usize {
        let channels: Vec<_> = lock(&self.inner.channels)
            .iter()
            .filter(|c| !c.is_closed() && c.queue().as_deref() == Some(queue))
            .cloned()
            .collect();
        for channel in &channels {
            channel.shut(CloseReason::new(504, "CHANNEL_ERROR - channel closed by test"));
        }
        channels.len()
    }

    /// Deliver `payload` to the first consumer of `queue`.
    pub fn deliver(&self, queue: &str, payload: &[u8]) -> bool {
        let channels = lock(&self.inner.channels).clone();
        for channel in channels.iter().filter(|c| !c.is_closed()) {
            let consumers = lock(&channel.consumers);
            if let Some((_, tx)) = consumers.iter().find(|(q, _)| q == queue) {
                let delivery_tag = self.inner.delivery_tags.fetch_add(1, Ordering::SeqCst) + 1;
                let delivery = Delivery::new(
                    delivery_tag,
                    queue,
                    false,
                    payload.to_vec(),
                    Box::new(MockAcker {
                        delivery_tag,
                        acks: self.inner.acks.clone(),
                    }),
                );
                return tx.send(Ok(delivery)).is_ok();
            }
        }
        false
    }

    pub fn dial_count(&self) -> usize {
        self.inner.dials.load(Ordering::SeqCst)
    }

    /// Successfully opened channels.
    pub fn channels_opened(&self) -> usize {
        self.inner.channels_opened.load(Ordering::SeqCst)
    }

    /// Channels the client closed successfully.
    pub fn channels_closed(&self) -> usize {
        self.inner.channels_closed.load(Ordering::SeqCst)
    }

    /// Connections the client closed.
    pub fn connections_closed(&self) -> usize {
        self.inner.connections_closed.load(Ordering::SeqCst)
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        lock(&self.inner.published).clone()
    }

    /// Names of declared queues, in declaration order, without repeats.
    pub fn declared_queues(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for (name, _) in lock(&self.inner.declared).iter() {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }
        names
    }

    pub fn declared_options(&self, queue: &str) -> Option<QueueOptions> {
        lock(&self.inner.declared)
            .iter()
            .rev()
            .find(|(name, _)| name == queue)
            .map(|(_, options)| *options)
    }

    pub fn acks(&self) -> Vec<AckRecord> {
        lock(&self.inner.acks).clone()
    }

    /// Last prefetch count set on any channel.
    pub fn prefetch(&self) -> Option<u16> {
        *lock(&self.inner.prefetch)
    }

    /// A channel not tied to any connection.
    pub fn detached_channel(&self) -> Arc<dyn Channel> {
        Arc::new(MockChannel::new(self.inner.clone()))
    }

    fn next_confirm(&self) -> ConfirmMode {
        lock(&self.inner.confirm_script)
            .pop_front()
            .or(*lock(&self.inner.confirm_mode))
            .unwrap_or(ConfirmMode::Ack)
    }
}

#[async_trait]
impl Connector for MockBroker {
    async fn dial(&self, _addr: &str) -> Result<Arc<dyn Connection>, TransportError> {
        self.inner.dials.fetch_add(1, Ordering::SeqCst);
        let outcome = lock(&self.inner.dial_script)
            .pop_front()
            .unwrap_or(DialOutcome::Connect);

        match outcome {
            DialOutcome::Connect => {
                let connection = Arc::new(MockConnection {
                    broker: self.clone(),
                    closed: CloseNotifier::new(),
                    channels: Mutex::new(Vec::new()),
                });
                *lock(&self.inner.connection) = Some(connection.clone());
                Ok(connection)
            }
            DialOutcome::Fail(e) => Err(e),
        }
    }
}

struct MockConnection {
    broker: MockBroker,
    closed: CloseNotifier,
    channels: Mutex<Vec<Arc<MockChannel>>>,
}

impl MockConnection {
    fn shut(&self, reason: CloseReason) {
        if self.closed.notify(reason.clone()) {
            for channel in lock(&self.channels).drain(..) {
                channel.shut(reason.clone());
            }
        }
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn open_channel(&self) -> Result<Arc<dyn Channel>, TransportError> {
        if self.closed.signal().is_closed() {
            return Err(TransportError::closed("connection is closed"));
        }
        let failures = &self.broker.inner.open_failures;
        if failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(TransportError::other("channel open refused"));
        }

        let channel = Arc::new(MockChannel::new(self.broker.inner.clone()));
        lock(&self.channels).push(channel.clone());
        lock(&self.broker.inner.channels).push(channel.clone());
        self.broker.inner.channels_opened.fetch_add(1, Ordering::SeqCst);
        Ok(channel)
    }

    fn close_signal(&self) -> CloseSignal {
        self.closed.signal()
    }

    async fn close(&self) -> Result<(), TransportError> {
        if !self.closed.signal().is_closed() {
            self.broker.inner.connections_closed.fetch_add(1, Ordering::SeqCst);
        }
        self.shut(CloseReason::new(200, "Bye"));
        Ok(())
    }
}

struct MockChannel {
    inner: Arc<Inner>,
    closed: CloseNotifier,
    queue: Mutex<Option<String>>,
    pending: Mutex<Vec<oneshot::Sender<Confirmation>>>,
    consumers: Mutex<Vec<(String, mpsc::UnboundedSender<Result<Delivery, TransportError>>)>>,
}

impl MockChannel {
    fn new(inner: Arc<Inner>) -> Self {
        Self {
            inner,
            closed: CloseNotifier::new(),
            queue: Mutex::new(None),
            pending: Mutex::new(Vec::new()),
            consumers: Mutex::new(Vec::new()),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.signal().is_closed()
    }

    fn queue(&self) -> Option<String> {
        lock(&self.queue).clone()
    }

    fn check_open(&self) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::closed("channel is closed"));
        }
        Ok(())
    }

    /// Close the channel: outstanding confirms fail, consumer streams end.
    fn shut(&self, reason: CloseReason) {
        if self.closed.notify(reason) {
            lock(&self.pending).clear();
            lock(&self.consumers).clear();
        }
    }
}

#[async_trait]
impl Channel for MockChannel {
    async fn enable_confirms(&self) -> Result<(), TransportError> {
        self.check_open()
    }

    async fn declare_queue(&self, name: &str, options: &QueueOptions) -> Result<(), TransportError> {
        self.check_open()?;
        *lock(&self.queue) = Some(name.to_string());
        lock(&self.inner.declared).push((name.to_string(), *options));
        Ok(())
    }

    async fn publish(
        &self,
        queue: &str,
        payload: &[u8],
        properties: &MessageProperties,
    ) -> Result<PendingConfirm, TransportError> {
        self.check_open()?;
        lock(&self.inner.published).push(PublishedMessage {
            queue: queue.to_string(),
            payload: payload.to_vec(),
            content_type: properties.content_type.clone(),
        });

        let broker = MockBroker {
            inner: self.inner.clone(),
        };
        match broker.next_confirm() {
            ConfirmMode::Ack => Ok(PendingConfirm::ready(Confirmation::Ack)),
            ConfirmMode::Nack => Ok(PendingConfirm::ready(Confirmation::Nack)),
            ConfirmMode::Silent => {
                let (tx, rx) = oneshot::channel();
                lock(&self.pending).push(tx);
                Ok(PendingConfirm::new(async move {
                    rx.await
                        .map_err(|_| TransportError::closed("channel closed before confirmation"))
                }))
            }
        }
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), TransportError> {
        self.check_open()?;
        *lock(&self.inner.prefetch) = Some(count);
        Ok(())
    }

    async fn consume(&self, queue: &str, _consumer_tag: &str) -> Result<DeliveryStream, TransportError> {
        self.check_open()?;
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.consumers).push((queue.to_string(), tx));
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    fn close_signal(&self) -> CloseSignal {
        self.closed.signal()
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.check_open()?;
        if let Some(queue) = self.queue() {
            if lock(&self.inner.close_failures).contains(&queue) {
                return Err(TransportError::other(format!("close of {queue} channel refused")));
            }
        }
        self.shut(CloseReason::new(200, "Bye"));
        self.inner.channels_closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct MockAcker {
    delivery_tag: u64,
    acks: Arc<Mutex<Vec<AckRecord>>>,
}

#[async_trait]
impl Acker for MockAcker {
    async fn ack(&self) -> Result<(), TransportError> {
        lock(&self.acks).push(AckRecord::Ack(self.delivery_tag));
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<(), TransportError> {
        lock(&self.acks).push(AckRecord::Nack {
            delivery_tag: self.delivery_tag,
            requeue,
        });
        Ok(())
    }

    async fn reject(&self, requeue: bool) -> Result<(), TransportError> {
        lock(&self.acks).push(AckRecord::Reject {
            delivery_tag: self.delivery_tag,
            requeue,
        });
        Ok(())
    }
}
