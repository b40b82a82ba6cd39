//! Per-queue channel management
//!
//! Every registered queue is owned by one long-lived task. The task waits
//! for a live connection, opens a channel, enables publisher confirms and
//! declares the queue, then watches for the channel or the connection going
//! away and starts over. Queues never share a channel, so one queue's
//! failure leaves the others untouched.

use crate::client::{Shared, lock};
use crate::error::TransportError;
use crate::metrics::QueueMetrics;
use crate::state::QueueState;
use crate::transport::{Channel, CloseSignal, Connection};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// One channel opened for one queue.
///
/// A queue's channel is replaced whole on every re-initialization, together
/// with its close notification point, so readers never pair a channel with
/// another incarnation's signal.
pub(crate) struct ChannelIncarnation {
    pub(crate) id: u64,
    /// Connection generation the channel was opened on
    pub(crate) generation: u64,
    pub(crate) channel: Arc<dyn Channel>,
    pub(crate) closed: CloseSignal,
}

#[derive(Clone)]
pub(crate) struct QueueSnapshot {
    pub(crate) state: QueueState,
    pub(crate) incarnation: Option<Arc<ChannelIncarnation>>,
}

/// Registration record for one queue.
pub(crate) struct QueueHandle {
    name: String,
    snapshot: watch::Sender<QueueSnapshot>,
    task: Mutex<Option<JoinHandle<()>>>,
    metrics: QueueMetrics,
}

impl QueueHandle {
    pub(crate) fn new(name: &str) -> Self {
        let (snapshot, _) = watch::channel(QueueSnapshot {
            state: QueueState::NotReady,
            incarnation: None,
        });
        Self {
            name: name.to_string(),
            snapshot,
            task: Mutex::new(None),
            metrics: QueueMetrics::new(name),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn metrics(&self) -> &QueueMetrics {
        &self.metrics
    }

    pub(crate) fn state(&self) -> QueueState {
        self.snapshot.borrow().state
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<QueueSnapshot> {
        self.snapshot.subscribe()
    }

    pub(crate) fn watch(&self) -> QueueWatch {
        QueueWatch {
            rx: self.snapshot.subscribe(),
        }
    }

    pub(crate) fn set_state(&self, state: QueueState) {
        self.snapshot.send_if_modified(|snapshot| {
            if snapshot.state == state || snapshot.state == QueueState::Closed {
                return false;
            }
            snapshot.state = state;
            true
        });
    }

    /// Install a new channel and mark the queue ready in one step.
    fn install(&self, incarnation: Arc<ChannelIncarnation>) {
        self.snapshot.send_modify(|snapshot| {
            snapshot.state = QueueState::Ready;
            snapshot.incarnation = Some(incarnation);
        });
        self.metrics.set_ready(true);
    }

    /// Drop the current channel and mark the queue not ready in one step.
    fn retire(&self) {
        self.snapshot.send_modify(|snapshot| {
            snapshot.state = QueueState::NotReady;
            snapshot.incarnation = None;
        });
        self.metrics.set_ready(false);
    }

    /// The current channel, if the queue is ready.
    pub(crate) fn ready_incarnation(&self) -> Option<Arc<ChannelIncarnation>> {
        let snapshot = self.snapshot.borrow();
        match snapshot.state {
            QueueState::Ready => snapshot.incarnation.clone(),
            _ => None,
        }
    }

    pub(crate) fn take_incarnation(&self) -> Option<Arc<ChannelIncarnation>> {
        let mut taken = None;
        self.snapshot.send_if_modified(|snapshot| {
            taken = snapshot.incarnation.take();
            taken.is_some()
        });
        self.metrics.set_ready(false);
        taken
    }

    pub(crate) fn set_task(&self, task: JoinHandle<()>) {
        *lock(&self.task) = Some(task);
    }

    pub(crate) fn take_task(&self) -> Option<JoinHandle<()>> {
        lock(&self.task).take()
    }
}

/// Watches the state of one queue.
#[derive(Clone)]
pub struct QueueWatch {
    rx: watch::Receiver<QueueSnapshot>,
}

impl QueueWatch {
    /// Latest observed state.
    pub fn state(&self) -> QueueState {
        self.rx.borrow().state
    }

    /// Whether the state changed since it was last observed.
    pub fn has_changed(&self) -> bool {
        self.rx.has_changed().unwrap_or(true)
    }

    /// Wait for the next state change. Returns None once the client is gone.
    pub async fn changed(&mut self) -> Option<QueueState> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().state)
    }

    /// Wait until the state satisfies `condition`.
    pub async fn wait_for(
        &mut self,
        mut condition: impl FnMut(&QueueState) -> bool,
    ) -> Option<QueueState> {
        let snapshot = self.rx.wait_for(|s| condition(&s.state)).await.ok()?;
        Some(snapshot.state)
    }
}

impl std::fmt::Debug for QueueWatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueWatch").field("state", &self.state()).finish()
    }
}

enum InitOutcome {
    Ready(Arc<ChannelIncarnation>),
    ConnectionLost,
    Shutdown,
}

/// Queue task: keep a ready channel for `queue` until shutdown.
pub(crate) async fn run(shared: Arc<Shared>, queue: Arc<QueueHandle>) {
    let name = queue.name().to_string();
    debug!(queue = %name, "Queue task started");

    loop {
        let connection = tokio::select! {
            _ = shared.shutdown.wait() => break,
            connection = shared.wait_for_connection() => connection,
        };
        let Some((generation, connection)) = connection else {
            debug!(queue = %name, "Connection gave up, stopping queue task");
            break;
        };

        let incarnation = match init_with_retry(&shared, &queue, generation, connection).await {
            InitOutcome::Ready(incarnation) => incarnation,
            InitOutcome::ConnectionLost => continue,
            InitOutcome::Shutdown => break,
        };

        let closed = incarnation.closed.clone();
        let id = incarnation.id;
        queue.install(incarnation);
        info!(queue = %name, channel = id, generation, "Queue ready");

        tokio::select! {
            _ = shared.shutdown.wait() => break,
            _ = shared.connection_lost(generation) => {
                queue.retire();
                warn!(queue = %name, channel = id, "Connection lost, waiting for reconnect");
            }
            reason = closed.closed() => {
                queue.retire();
                warn!(
                    queue = %name,
                    channel = id,
                    code = reason.code,
                    reason = %reason.text,
                    "Channel closed, re-initializing"
                );
            }
        }
    }

    if shared.shutdown.is_triggered() {
        queue.set_state(QueueState::Closing);
    } else {
        queue.retire();
        queue.set_state(QueueState::Closed);
    }
    debug!(queue = %name, "Queue task stopped");
}

async fn init_with_retry(
    shared: &Shared,
    queue: &QueueHandle,
    generation: u64,
    connection: Arc<dyn Connection>,
) -> InitOutcome {
    let policy = &shared.config.reinit;
    let mut failures = 0u32;

    loop {
        queue.set_state(QueueState::Initializing);
        let attempt = tokio::select! {
            _ = shared.shutdown.wait() => return InitOutcome::Shutdown,
            _ = shared.connection_lost(generation) => return InitOutcome::ConnectionLost,
            attempt = init(shared, queue.name(), generation, connection.as_ref()) => attempt,
        };

        match attempt {
            Ok(incarnation) => {
                queue.metrics().channel_init("success");
                return InitOutcome::Ready(Arc::new(incarnation));
            }
            Err(e) => {
                failures += 1;
                queue.set_state(QueueState::NotReady);
                queue.metrics().channel_init("failure");
                warn!(queue = %queue.name(), attempt = failures, error = %e, "Failed to initialize channel");
            }
        }

        if policy.is_exhausted(failures) {
            error!(
                queue = %queue.name(),
                attempts = failures,
                "Channel re-initialization budget exhausted, waiting for reconnect"
            );
            return tokio::select! {
                _ = shared.shutdown.wait() => InitOutcome::Shutdown,
                _ = shared.connection_lost(generation) => InitOutcome::ConnectionLost,
            };
        }

        let delay = policy.delay(failures);
        tokio::select! {
            _ = shared.shutdown.wait() => return InitOutcome::Shutdown,
            _ = shared.connection_lost(generation) => return InitOutcome::ConnectionLost,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Open a channel, enable confirms and declare the queue on it.
async fn init(
    shared: &Shared,
    name: &str,
    generation: u64,
    connection: &dyn Connection,
) -> Result<ChannelIncarnation, TransportError> {
    let channel = connection.open_channel().await?;

    let setup = async {
        channel.enable_confirms().await?;
        channel.declare_queue(name, &shared.config.queue_options).await
    };
    if let Err(e) = setup.await {
        if let Err(close_err) = channel.close().await {
            debug!(queue = %name, error = %close_err, "Failed to close half-initialized channel");
        }
        return Err(e);
    }

    Ok(ChannelIncarnation {
        id: shared.next_incarnation(),
        generation,
        closed: channel.close_signal(),
        channel,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_and_retire_swap_together() {
        let queue = QueueHandle::new("orders");
        assert_eq!(queue.state(), QueueState::NotReady);
        assert!(queue.ready_incarnation().is_none());

        let broker = crate::mock::MockBroker::new();
        let channel = broker.detached_channel();
        let incarnation = Arc::new(ChannelIncarnation {
            id: 7,
            generation: 1,
            closed: channel.close_signal(),
            channel,
        });

        queue.install(incarnation);
        assert_eq!(queue.state(), QueueState::Ready);
        assert_eq!(queue.ready_incarnation().map(|i| i.id), Some(7));

        queue.retire();
        assert_eq!(queue.state(), QueueState::NotReady);
        assert!(queue.ready_incarnation().is_none());
    }

    #[test]
    fn test_closed_is_final() {
        let queue = QueueHandle::new("orders");
        queue.set_state(QueueState::Closed);
        queue.set_state(QueueState::Initializing);
        assert_eq!(queue.state(), QueueState::Closed);
    }

    #[tokio::test]
    async fn test_queue_watch_wait_for() {
        let queue = QueueHandle::new("orders");
        let mut watch = queue.watch();

        queue.set_state(QueueState::Initializing);
        let state = watch.wait_for(|s| *s == QueueState::Initializing).await;
        assert_eq!(state, Some(QueueState::Initializing));
    }
}
