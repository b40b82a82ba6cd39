//! Broker client handle and shared client state.

use crate::amqp::AmqpConnector;
use crate::channel::{self, ChannelIncarnation, QueueHandle, QueueWatch};
use crate::config::ClientConfig;
use crate::error::BrokerError;
use crate::metrics;
use crate::shutdown::Shutdown;
use crate::state::{ConnectionState, QueueState};
use crate::supervisor::{self, redact_address};
use crate::transport::{Connection, Connector};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Resilient broker client.
///
/// Construction starts a background supervisor that dials the broker and
/// keeps redialing it when the connection drops. Each queue registered with
/// [`ensure_queue`](Self::ensure_queue) gets its own task that (re)creates a
/// confirm-mode channel for it whenever the old one goes away.
///
/// Cloning is cheap; clones share the same connection. Dropping the last
/// clone signals shutdown.
#[derive(Clone)]
pub struct BrokerClient {
    pub(crate) shared: Arc<Shared>,
    _guard: Arc<DropGuard>,
}

impl BrokerClient {
    /// Create a client for an AMQP broker at `addr`.
    ///
    /// Returns immediately; connecting happens in the background. Must be
    /// called from within a tokio runtime.
    pub fn new(addr: impl Into<String>, config: ClientConfig) -> Self {
        Self::with_connector(addr, config, Arc::new(AmqpConnector::new()))
    }

    /// Create a client that dials through `connector`.
    pub fn with_connector(
        addr: impl Into<String>,
        config: ClientConfig,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let addr = addr.into();
        let (connection, _) = watch::channel(ConnectionSnapshot::default());
        let shared = Arc::new(Shared {
            addr,
            config,
            connector,
            shutdown: Shutdown::new(),
            connection,
            queues: Mutex::new(HashMap::new()),
            supervisor: Mutex::new(None),
            next_incarnation: AtomicU64::new(1),
        });

        info!(address = %redact_address(&shared.addr), "Starting broker client");
        let task = tokio::spawn(supervisor::run(shared.clone()));
        *lock(&shared.supervisor) = Some(task);

        Self {
            _guard: Arc::new(DropGuard {
                shared: shared.clone(),
            }),
            shared,
        }
    }

    /// Current connection state.
    pub fn connection_state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Whether the connection is currently up.
    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    /// Watch connection state changes.
    pub fn subscribe_connection(&self) -> ConnectionWatch {
        ConnectionWatch {
            rx: self.shared.connection.subscribe(),
        }
    }

    /// Wait until the connection is up.
    ///
    /// Fails as soon as the client reaches a state it cannot recover from.
    pub async fn wait_connected(&self) -> Result<(), BrokerError> {
        let mut rx = self.shared.connection.subscribe();
        loop {
            {
                let snapshot = rx.borrow_and_update();
                if snapshot.state == ConnectionState::Connected {
                    return Ok(());
                }
            }
            self.shared.check_usable()?;
            if rx.changed().await.is_err() {
                return Err(BrokerError::Shutdown);
            }
        }
    }

    /// Register `name` and wait until its channel is ready.
    ///
    /// Returns immediately when the queue is already ready. Concurrent calls
    /// for the same name share one channel.
    pub async fn ensure_queue(&self, name: &str) -> Result<(), BrokerError> {
        self.shared.check_usable()?;
        let queue = self.shared.register_queue(name)?;
        if queue.state().is_ready() {
            return Ok(());
        }
        self.shared.wait_queue_ready(&queue).await
    }

    /// Current state of a registered queue.
    pub fn queue_state(&self, name: &str) -> Option<QueueState> {
        self.shared.queue(name).map(|queue| queue.state())
    }

    /// Watch the state of a registered queue, e.g. to notice its channel
    /// closing.
    pub fn watch_queue(&self, name: &str) -> Result<QueueWatch, BrokerError> {
        self.shared
            .queue(name)
            .map(|queue| queue.watch())
            .ok_or_else(|| BrokerError::QueueNotFound(name.to_string()))
    }

    /// Names of every registered queue.
    pub fn queues(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.shared.queues).keys().cloned().collect();
        names.sort();
        names
    }

    /// Client configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }
}

impl std::fmt::Debug for BrokerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerClient")
            .field("address", &redact_address(&self.shared.addr))
            .field("state", &self.shared.state())
            .finish()
    }
}

/// Triggers shutdown when the last client clone goes away.
struct DropGuard {
    shared: Arc<Shared>,
}

impl Drop for DropGuard {
    fn drop(&mut self) {
        if !self.shared.shutdown.trigger() {
            return;
        }
        debug!("Last broker client handle dropped");
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let shared = self.shared.clone();
            runtime.spawn(async move {
                let _ = shared.teardown().await;
            });
        }
    }
}

/// Watches client connection state.
#[derive(Debug, Clone)]
pub struct ConnectionWatch {
    rx: watch::Receiver<ConnectionSnapshot>,
}

impl ConnectionWatch {
    /// Latest observed state.
    pub fn state(&self) -> ConnectionState {
        self.rx.borrow().state
    }

    /// Wait for the next state change. Returns None once the client is gone.
    pub async fn changed(&mut self) -> Option<ConnectionState> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().state)
    }
}

/// Connection record published by the supervisor.
#[derive(Clone)]
pub(crate) struct ConnectionSnapshot {
    pub(crate) state: ConnectionState,
    /// Bumped on every successful dial
    pub(crate) generation: u64,
    pub(crate) connection: Option<Arc<dyn Connection>>,
    /// Consecutive failed dials when the supervisor halted
    pub(crate) attempts: u32,
    /// Error that made the client give up
    pub(crate) detail: Option<String>,
}

impl Default for ConnectionSnapshot {
    fn default() -> Self {
        Self {
            state: ConnectionState::Connecting,
            generation: 0,
            connection: None,
            attempts: 0,
            detail: None,
        }
    }
}

impl std::fmt::Debug for ConnectionSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSnapshot")
            .field("state", &self.state)
            .field("generation", &self.generation)
            .field("connected", &self.connection.is_some())
            .finish()
    }
}

/// State shared between the client handles and background tasks.
pub(crate) struct Shared {
    pub(crate) addr: String,
    pub(crate) config: ClientConfig,
    pub(crate) connector: Arc<dyn Connector>,
    pub(crate) shutdown: Shutdown,
    pub(crate) connection: watch::Sender<ConnectionSnapshot>,
    queues: Mutex<HashMap<String, Arc<QueueHandle>>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    next_incarnation: AtomicU64,
}

impl Shared {
    pub(crate) fn state(&self) -> ConnectionState {
        self.connection.borrow().state
    }

    /// Move to `next` unless the current state forbids it.
    ///
    /// Closed is final. ShuttingDown, Fatal and Exhausted only lead to Closed.
    pub(crate) fn transition(&self, next: ConnectionState) -> bool {
        let changed = self.connection.send_if_modified(|snapshot| {
            if !can_transition(snapshot.state, next) {
                return false;
            }
            snapshot.state = next;
            true
        });
        if changed {
            metrics::set_connection_ready(next == ConnectionState::Connected);
        }
        changed
    }

    /// Publish a freshly dialed connection. Returns its generation.
    pub(crate) fn install_connection(&self, connection: Arc<dyn Connection>) -> u64 {
        let mut generation = 0;
        self.connection.send_modify(|snapshot| {
            snapshot.generation += 1;
            snapshot.connection = Some(connection);
            snapshot.attempts = 0;
            generation = snapshot.generation;
            if can_transition(snapshot.state, ConnectionState::Connected) {
                snapshot.state = ConnectionState::Connected;
            }
        });
        metrics::set_connection_ready(self.state() == ConnectionState::Connected);
        generation
    }

    /// Forget the connection of `generation` after it closed.
    pub(crate) fn drop_connection(&self, generation: u64) {
        self.connection.send_if_modified(|snapshot| {
            if snapshot.generation != generation || snapshot.connection.is_none() {
                return false;
            }
            snapshot.connection = None;
            if can_transition(snapshot.state, ConnectionState::Connecting) {
                snapshot.state = ConnectionState::Connecting;
            }
            true
        });
        metrics::set_connection_ready(false);
    }

    pub(crate) fn take_connection(&self) -> Option<Arc<dyn Connection>> {
        let mut taken = None;
        self.connection.send_if_modified(|snapshot| {
            taken = snapshot.connection.take();
            taken.is_some()
        });
        taken
    }

    /// Record a halt of the supervisor (fatal error or exhausted budget).
    pub(crate) fn halt(&self, state: ConnectionState, attempts: u32, detail: Option<String>) {
        self.connection.send_if_modified(|snapshot| {
            if !can_transition(snapshot.state, state) {
                return false;
            }
            snapshot.state = state;
            snapshot.attempts = attempts;
            snapshot.detail = detail;
            true
        });
        metrics::set_connection_ready(false);
    }

    /// Fail fast when the client can no longer serve requests.
    pub(crate) fn check_usable(&self) -> Result<(), BrokerError> {
        let snapshot = self.connection.borrow();
        match snapshot.state {
            ConnectionState::Closed => Err(BrokerError::AlreadyClosed),
            ConnectionState::ShuttingDown => Err(BrokerError::Shutdown),
            ConnectionState::Fatal => Err(BrokerError::Fatal(
                snapshot.detail.clone().unwrap_or_else(|| "broker rejected the connection".into()),
            )),
            ConnectionState::Exhausted => Err(BrokerError::MaxAttemptsExceeded {
                attempts: snapshot.attempts,
            }),
            _ if self.shutdown.is_triggered() => Err(BrokerError::Shutdown),
            _ => Ok(()),
        }
    }

    /// Wait for a live connection. Returns None once the client gave up.
    pub(crate) async fn wait_for_connection(&self) -> Option<(u64, Arc<dyn Connection>)> {
        let mut rx = self.connection.subscribe();
        let snapshot = rx
            .wait_for(|s| {
                s.state.is_terminal()
                    || (s.state == ConnectionState::Connected && s.connection.is_some())
            })
            .await
            .ok()?;
        if snapshot.state.is_terminal() {
            return None;
        }
        let connection = snapshot.connection.clone()?;
        Some((snapshot.generation, connection))
    }

    /// Resolve once the client reaches a state it cannot recover from.
    pub(crate) async fn halted(&self) {
        let mut rx = self.connection.subscribe();
        let _ = rx.wait_for(|s| s.state.is_terminal()).await;
    }

    /// The error callers get once the client halted.
    pub(crate) fn halt_error(&self) -> BrokerError {
        self.check_usable().err().unwrap_or(BrokerError::NotConnected)
    }

    /// Resolve once the connection of `generation` is gone.
    pub(crate) async fn connection_lost(&self, generation: u64) {
        let mut rx = self.connection.subscribe();
        let _ = rx
            .wait_for(|s| s.generation != generation || s.connection.is_none())
            .await;
    }

    pub(crate) fn next_incarnation(&self) -> u64 {
        self.next_incarnation.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn queue(&self, name: &str) -> Option<Arc<QueueHandle>> {
        lock(&self.queues).get(name).cloned()
    }

    pub(crate) fn registered_queues(&self) -> Vec<Arc<QueueHandle>> {
        lock(&self.queues).values().cloned().collect()
    }

    /// Get or create the registration for `name`, spawning its task once.
    pub(crate) fn register_queue(self: &Arc<Self>, name: &str) -> Result<Arc<QueueHandle>, BrokerError> {
        let mut queues = lock(&self.queues);
        if let Some(queue) = queues.get(name) {
            return Ok(queue.clone());
        }
        if self.shutdown.is_triggered() {
            return Err(BrokerError::Shutdown);
        }

        let queue = Arc::new(QueueHandle::new(name));
        let task = tokio::spawn(channel::run(self.clone(), queue.clone()));
        queue.set_task(task);
        queues.insert(name.to_string(), queue.clone());
        debug!(queue = %name, "Queue registered");
        Ok(queue)
    }

    async fn wait_queue_ready(&self, queue: &QueueHandle) -> Result<(), BrokerError> {
        let mut queue_rx = queue.subscribe();
        let mut connection_rx = self.connection.subscribe();
        loop {
            if queue_rx.borrow_and_update().state.is_ready() {
                return Ok(());
            }
            self.check_usable()?;
            tokio::select! {
                changed = queue_rx.changed() => {
                    if changed.is_err() {
                        return Err(BrokerError::Shutdown);
                    }
                }
                changed = connection_rx.changed() => {
                    if changed.is_err() {
                        return Err(BrokerError::Shutdown);
                    }
                }
                _ = self.shutdown.wait() => {}
            }
        }
    }

    /// The current channel of a ready queue.
    pub(crate) fn ready_incarnation(&self, name: &str) -> Result<Arc<ChannelIncarnation>, BrokerError> {
        if self.state() != ConnectionState::Connected {
            return Err(BrokerError::NotConnected);
        }
        let queue = self
            .queue(name)
            .ok_or_else(|| BrokerError::QueueNotFound(name.to_string()))?;
        queue.ready_incarnation().ok_or(BrokerError::NotConnected)
    }

    pub(crate) fn take_supervisor(&self) -> Option<JoinHandle<()>> {
        lock(&self.supervisor).take()
    }
}

fn can_transition(from: ConnectionState, to: ConnectionState) -> bool {
    match from {
        ConnectionState::Closed => false,
        ConnectionState::ShuttingDown | ConnectionState::Fatal | ConnectionState::Exhausted => {
            to == ConnectionState::Closed
        }
        _ => from != to,
    }
}

/// Lock a mutex, recovering the data if a holder panicked.
///
/// Guarded data is only ever swapped whole, so a poisoned lock still holds
/// a consistent value.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
