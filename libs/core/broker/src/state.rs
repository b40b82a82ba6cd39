//! Client and queue state machines.

use std::fmt;

/// Client-level connection state.
///
/// ```text
/// Connecting -> Connected <-> Connecting -> ShuttingDown -> Closed
/// Connecting -> Fatal        (authentication / negotiation rejected)
/// Connecting -> Exhausted    (reconnect budget used up)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    ShuttingDown,
    Closed,
    Fatal,
    Exhausted,
}

impl ConnectionState {
    /// No further automatic recovery will happen from this state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConnectionState::ShuttingDown
                | ConnectionState::Closed
                | ConnectionState::Fatal
                | ConnectionState::Exhausted
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::ShuttingDown => "shutting_down",
            ConnectionState::Closed => "closed",
            ConnectionState::Fatal => "fatal",
            ConnectionState::Exhausted => "exhausted",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-queue channel state.
///
/// ```text
/// NotReady -> Initializing -> Ready -> NotReady   (channel or connection lost)
///                                   -> Closing    (shutdown)
/// Closing -> Closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    NotReady,
    Initializing,
    Ready,
    Closing,
    Closed,
}

impl QueueState {
    pub fn is_ready(&self) -> bool {
        matches!(self, QueueState::Ready)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueState::NotReady => "not_ready",
            QueueState::Initializing => "initializing",
            QueueState::Ready => "ready",
            QueueState::Closing => "closing",
            QueueState::Closed => "closed",
        }
    }
}

impl fmt::Display for QueueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
