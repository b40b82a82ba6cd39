//! Broker error types and error categorization
//!
//! Two layers of errors exist:
//! - [`TransportError`]: what the wire library reported (dial, channel, publish failures)
//! - [`BrokerError`]: what the client reports to application code
//!
//! Errors are categorized to tell callers what to do next:
//! - **Transient**: the queue or connection is recovering, retry later
//! - **Caller**: the call itself was wrong (closed client, unknown queue)
//! - **Terminal**: the client is shutting down or has given up for good

use lapin::protocol::{AMQPErrorKind, AMQPHardError, AMQPSoftError};
use std::fmt;
use thiserror::Error;

/// Kind of failure reported by the broker transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// Credentials or SASL mechanism rejected by the broker
    Auth,
    /// Protocol negotiation failed (version, vhost, frame errors)
    Protocol,
    /// Network level failure (refused, reset, unreachable)
    Io,
    /// The connection or channel is already closed
    Closed,
    /// The operation did not complete in time
    Timeout,
    /// The broker address could not be parsed
    InvalidAddress,
    /// Anything else
    Other,
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportErrorKind::Auth => write!(f, "auth"),
            TransportErrorKind::Protocol => write!(f, "protocol"),
            TransportErrorKind::Io => write!(f, "io"),
            TransportErrorKind::Closed => write!(f, "closed"),
            TransportErrorKind::Timeout => write!(f, "timeout"),
            TransportErrorKind::InvalidAddress => write!(f, "invalid_address"),
            TransportErrorKind::Other => write!(f, "other"),
        }
    }
}

/// Error reported by a broker transport operation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind} error: {message}")]
pub struct TransportError {
    kind: TransportErrorKind,
    message: String,
}

impl TransportError {
    /// Create a transport error of the given kind.
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Auth, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Protocol, message)
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Io, message)
    }

    pub fn closed(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Closed, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Timeout, message)
    }

    pub fn invalid_address(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::InvalidAddress, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Other, message)
    }

    /// Get the error kind
    pub fn kind(&self) -> TransportErrorKind {
        self.kind
    }

    /// Get the error message
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whether a dial failing with this error must never be retried.
    ///
    /// Rejected credentials, failed negotiation and unparsable addresses will
    /// fail the same way on every attempt.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind,
            TransportErrorKind::Auth
                | TransportErrorKind::Protocol
                | TransportErrorKind::InvalidAddress
        )
    }
}

/// Category of a [`BrokerError`], used to decide what a caller should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// The connection or queue is recovering - retry later
    Transient,
    /// The call was invalid for the client's current state
    Caller,
    /// The client is shutting down or has halted - do not retry
    Terminal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Transient => write!(f, "transient"),
            ErrorCategory::Caller => write!(f, "caller"),
            ErrorCategory::Terminal => write!(f, "terminal"),
        }
    }
}

/// Errors returned by [`BrokerClient`](crate::BrokerClient) operations.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The connection or the queue's channel is not currently ready
    #[error("not connected to a server")]
    NotConnected,

    /// `close()` was called on a client that is not ready
    #[error("already closed: not connected to the server")]
    AlreadyClosed,

    /// The client is shutting down; retry loops abort
    #[error("client is shutting down")]
    Shutdown,

    /// The broker rejected authentication or protocol negotiation
    #[error("fatal broker error: {0}")]
    Fatal(String),

    /// The queue was never registered with `ensure_queue`
    #[error("queue {0} not found")]
    QueueNotFound(String),

    /// The reconnect budget ran out; the connection supervisor halted
    #[error("connection could not be re-established after {attempts} attempts")]
    MaxAttemptsExceeded { attempts: u32 },

    /// A confirmed publish used up its resend budget
    #[error("message not confirmed after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },

    /// Transport failure passed through from the wire library
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

impl BrokerError {
    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            BrokerError::NotConnected => ErrorCategory::Transient,
            BrokerError::Transport(e) if e.is_fatal() => ErrorCategory::Terminal,
            BrokerError::Transport(_) => ErrorCategory::Transient,
            BrokerError::RetriesExhausted { .. } => ErrorCategory::Transient,
            BrokerError::AlreadyClosed => ErrorCategory::Caller,
            BrokerError::QueueNotFound(_) => ErrorCategory::Caller,
            BrokerError::Config(_) => ErrorCategory::Caller,
            BrokerError::Shutdown => ErrorCategory::Terminal,
            BrokerError::Fatal(_) => ErrorCategory::Terminal,
            BrokerError::MaxAttemptsExceeded { .. } => ErrorCategory::Terminal,
        }
    }

    /// Check if the failed operation may succeed when called again later
    pub fn is_retryable(&self) -> bool {
        self.category() == ErrorCategory::Transient
    }
}

impl From<lapin::Error> for TransportError {
    fn from(err: lapin::Error) -> Self {
        let message = err.to_string();
        let kind = match &err {
            lapin::Error::ProtocolError(e) if is_access_refused(e.kind()) => TransportErrorKind::Auth,
            lapin::Error::ProtocolError(_) if is_auth_failure(&message) => TransportErrorKind::Auth,
            lapin::Error::ProtocolError(_) => TransportErrorKind::Protocol,
            lapin::Error::IOError(_) => TransportErrorKind::Io,
            lapin::Error::InvalidConnectionState(_) | lapin::Error::InvalidChannelState(_) => {
                TransportErrorKind::Closed
            }
            _ if is_auth_failure(&message) => TransportErrorKind::Auth,
            _ => TransportErrorKind::Other,
        };
        Self { kind, message }
    }
}

impl From<lapin::Error> for BrokerError {
    fn from(err: lapin::Error) -> Self {
        BrokerError::Transport(err.into())
    }
}

/// Reply codes the broker uses to refuse a login or a virtual host.
fn is_access_refused(kind: &AMQPErrorKind) -> bool {
    matches!(
        kind,
        AMQPErrorKind::Soft(AMQPSoftError::ACCESSREFUSED)
            | AMQPErrorKind::Hard(AMQPHardError::NOTALLOWED)
    )
}

/// Detect credential / SASL rejections from the broker's reply text.
///
/// Fallback for errors that carry no reply code.
pub(crate) fn is_auth_failure(message: &str) -> bool {
    let upper = message.to_ascii_uppercase();
    upper.contains("ACCESS_REFUSED")
        || upper.contains("ACCESS-REFUSED")
        || upper.contains("SASL")
        || upper.contains("CREDENTIALS")
        || upper.contains("AUTHENTICATION")
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::protocol::AMQPError;

    #[test]
    fn test_fatal_transport_kinds() {
        assert!(TransportError::auth("bad password").is_fatal());
        assert!(TransportError::protocol("version mismatch").is_fatal());
        assert!(TransportError::invalid_address("no scheme").is_fatal());

        assert!(!TransportError::io("connection refused").is_fatal());
        assert!(!TransportError::closed("channel closed").is_fatal());
        assert!(!TransportError::timeout("publish").is_fatal());
    }

    #[test]
    fn test_error_categories() {
        assert_eq!(BrokerError::NotConnected.category(), ErrorCategory::Transient);
        assert_eq!(BrokerError::AlreadyClosed.category(), ErrorCategory::Caller);
        assert_eq!(
            BrokerError::QueueNotFound("orders".into()).category(),
            ErrorCategory::Caller
        );
        assert_eq!(BrokerError::Shutdown.category(), ErrorCategory::Terminal);
        assert_eq!(
            BrokerError::MaxAttemptsExceeded { attempts: 15 }.category(),
            ErrorCategory::Terminal
        );
        assert_eq!(
            BrokerError::from(TransportError::io("reset")).category(),
            ErrorCategory::Transient
        );
        assert_eq!(
            BrokerError::from(TransportError::auth("refused")).category(),
            ErrorCategory::Terminal
        );
    }

    #[test]
    fn test_should_retry() {
        assert!(BrokerError::NotConnected.is_retryable());
        assert!(!BrokerError::Shutdown.is_retryable());
        assert!(!BrokerError::AlreadyClosed.is_retryable());
    }

    #[test]
    fn test_auth_failure_detection() {
        assert!(is_auth_failure(
            "ACCESS_REFUSED - Login was refused using authentication mechanism PLAIN"
        ));
        assert!(is_auth_failure("invalid credentials"));
        assert!(!is_auth_failure("Connection refused (os error 111)"));
    }

    #[test]
    fn test_access_refused_reply_is_auth() {
        let refused = lapin::Error::ProtocolError(AMQPError::new(
            AMQPErrorKind::Soft(AMQPSoftError::ACCESSREFUSED),
            "login was refused".into(),
        ));
        assert_eq!(TransportError::from(refused).kind(), TransportErrorKind::Auth);

        let vhost = lapin::Error::ProtocolError(AMQPError::new(
            AMQPErrorKind::Hard(AMQPHardError::NOTALLOWED),
            "vhost not found".into(),
        ));
        assert_eq!(TransportError::from(vhost).kind(), TransportErrorKind::Auth);

        let other = lapin::Error::ProtocolError(AMQPError::new(
            AMQPErrorKind::Hard(AMQPHardError::FRAMEERROR),
            "malformed frame".into(),
        ));
        let other = TransportError::from(other);
        assert_eq!(other.kind(), TransportErrorKind::Protocol);
        assert!(other.is_fatal());
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(
            BrokerError::NotConnected.to_string(),
            "not connected to a server"
        );
        assert_eq!(
            BrokerError::QueueNotFound("orders".into()).to_string(),
            "queue orders not found"
        );
        assert_eq!(
            TransportError::io("connection refused").to_string(),
            "io error: connection refused"
        );
    }
}
