//! Shutdown signalling and client teardown.

use crate::client::{BrokerClient, Shared};
use crate::error::BrokerError;
use crate::state::{ConnectionState, QueueState};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// One-shot shutdown signal shared by every background task.
///
/// Once triggered it never resets; every loop treats it as terminal.
#[derive(Debug)]
pub(crate) struct Shutdown {
    tx: watch::Sender<bool>,
}

impl Shutdown {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// Set the signal. Returns true only for the call that set it.
    pub(crate) fn trigger(&self) -> bool {
        let fired = self.tx.send_if_modified(|triggered| {
            if *triggered {
                return false;
            }
            *triggered = true;
            true
        });
        if fired {
            info!("Broker client shutdown signalled");
        }
        fired
    }

    pub(crate) fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolve once the signal is set. Cancel safe.
    pub(crate) async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|triggered| *triggered).await;
    }
}

impl BrokerClient {
    /// Close every queue channel and the connection.
    ///
    /// Fails with [`BrokerError::AlreadyClosed`] unless the client is
    /// currently connected, so a second call after a successful close fails
    /// too. Waits for the supervisor and every queue task to stop; channel
    /// close failures are logged and do not stop the remaining teardown.
    /// Returns the connection close error, if any.
    pub async fn close(&self) -> Result<(), BrokerError> {
        if self.shared.state() != ConnectionState::Connected {
            return Err(BrokerError::AlreadyClosed);
        }
        if !self.shared.shutdown.trigger() {
            return Err(BrokerError::AlreadyClosed);
        }
        self.shared.transition(ConnectionState::ShuttingDown);
        info!("Closing broker client");

        let result = self.shared.teardown().await;
        match &result {
            Ok(()) => info!("Broker client closed"),
            Err(e) => warn!(error = %e, "Broker client closed with error"),
        }
        result
    }
}

impl Shared {
    /// Stop background tasks, then close channels and the connection.
    ///
    /// Safe to run more than once; later runs find nothing left to close.
    pub(crate) async fn teardown(&self) -> Result<(), BrokerError> {
        let supervisor = self.take_supervisor();
        if let Some(task) = supervisor {
            if let Err(e) = task.await {
                warn!(error = %e, "Connection supervisor task failed");
            }
        }

        let queues = self.registered_queues();
        for queue in &queues {
            if let Some(task) = queue.take_task() {
                if let Err(e) = task.await {
                    warn!(queue = %queue.name(), error = %e, "Queue task failed");
                }
            }
        }

        for queue in &queues {
            if let Some(incarnation) = queue.take_incarnation() {
                match incarnation.channel.close().await {
                    Ok(()) => debug!(queue = %queue.name(), channel = incarnation.id, "Channel closed"),
                    Err(e) => warn!(
                        queue = %queue.name(),
                        channel = incarnation.id,
                        error = %e,
                        "Failed to close channel"
                    ),
                }
            }
            queue.set_state(QueueState::Closed);
        }

        let result = match self.take_connection() {
            Some(connection) => connection.close().await.map_err(BrokerError::from),
            None => Ok(()),
        };
        self.transition(ConnectionState::Closed);
        result
    }
}
