//! Configuration types for the broker client.

use std::time::Duration;

/// Client configuration.
///
/// Every delay, budget and timeout the client uses lives here so the
/// recovery behaviour can be tuned (and tested) without touching control flow.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Backoff between failed dials, and the reconnect attempt budget
    pub reconnect: BackoffPolicy,

    /// Backoff between failed channel (re)initializations
    pub reinit: BackoffPolicy,

    /// Backoff between failed sends of a confirmed publish, and its send budget
    pub resend: BackoffPolicy,

    /// Timeout for a single publish call
    pub publish_timeout: Duration,

    /// Timeout for one acknowledgement wait (None = wait until ack or shutdown)
    pub confirm_timeout: Option<Duration>,

    /// Maximum unacknowledged deliveries per consumer
    pub prefetch: u16,

    /// Properties used when declaring queues
    pub queue_options: QueueOptions,

    /// Content type attached to published messages
    pub content_type: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            reconnect: BackoffPolicy::fixed(Duration::from_secs(5)).with_max_attempts(15),
            reinit: BackoffPolicy::fixed(Duration::from_secs(2)),
            resend: BackoffPolicy::fixed(Duration::from_secs(5)),
            publish_timeout: Duration::from_secs(30),
            confirm_timeout: Some(Duration::from_secs(30)),
            prefetch: 1,
            queue_options: QueueOptions::default(),
            content_type: "text/plain".to_string(),
        }
    }
}

impl ClientConfig {
    /// Create a configuration with the default timings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the reconnect policy.
    pub fn with_reconnect(mut self, policy: BackoffPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Set the channel re-initialization policy.
    pub fn with_reinit(mut self, policy: BackoffPolicy) -> Self {
        self.reinit = policy;
        self
    }

    /// Set the confirmed publish resend policy.
    pub fn with_resend(mut self, policy: BackoffPolicy) -> Self {
        self.resend = policy;
        self
    }

    /// Set the per-call publish timeout.
    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    /// Set the acknowledgement wait bound.
    pub fn with_confirm_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.confirm_timeout = timeout;
        self
    }

    /// Set the consumer prefetch count.
    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    /// Set the queue declaration properties.
    pub fn with_queue_options(mut self, options: QueueOptions) -> Self {
        self.queue_options = options;
        self
    }

    /// Set the message content type.
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }
}

#[cfg(feature = "config")]
impl From<&core_config::rabbitmq::RabbitMqConfig> for ClientConfig {
    fn from(config: &core_config::rabbitmq::RabbitMqConfig) -> Self {
        let mut reconnect = BackoffPolicy::fixed(config.reconnect_delay);
        reconnect.max_attempts = config.max_reconnect_attempts;

        Self {
            reconnect,
            confirm_timeout: config.confirm_timeout,
            prefetch: config.prefetch,
            ..Default::default()
        }
    }
}

/// Queue declaration properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueOptions {
    /// Survive broker restarts
    pub durable: bool,

    /// Restrict the queue to the declaring connection
    pub exclusive: bool,

    /// Delete the queue when its last consumer goes away
    pub auto_delete: bool,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            durable: true,
            exclusive: false,
            auto_delete: false,
        }
    }
}

/// Retry policy: how long to wait between attempts and how many attempts to make.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Delay strategy
    pub strategy: BackoffStrategy,

    /// Maximum consecutive attempts (None = unlimited)
    pub max_attempts: Option<u32>,
}

impl BackoffPolicy {
    /// Fixed delay, unlimited attempts.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            strategy: BackoffStrategy::Fixed(delay),
            max_attempts: None,
        }
    }

    /// Exponential delay, unlimited attempts.
    pub fn exponential(base: Duration, max: Duration) -> Self {
        Self {
            strategy: BackoffStrategy::Exponential { base, max },
            max_attempts: None,
        }
    }

    /// Limit the number of consecutive attempts.
    pub fn with_max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = Some(max);
        self
    }

    /// Delay before the retry following `failures` consecutive failures.
    pub fn delay(&self, failures: u32) -> Duration {
        self.strategy.delay(failures.saturating_sub(1))
    }

    /// Whether `attempts` attempts use up the budget.
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone)]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed(Duration),

    /// Exponential backoff (base * 2^retry_count, capped at max)
    Exponential { base: Duration, max: Duration },

    /// Linear backoff (base * (retry_count + 1), capped at max)
    Linear { base: Duration, max: Duration },
}

impl BackoffStrategy {
    /// Calculate the delay for a given retry count.
    pub fn delay(&self, retry_count: u32) -> Duration {
        match self {
            BackoffStrategy::Fixed(d) => *d,
            BackoffStrategy::Exponential { base, max } => {
                let delay = base.saturating_mul(2u32.saturating_pow(retry_count));
                delay.min(*max)
            }
            BackoffStrategy::Linear { base, max } => {
                let delay = base.saturating_mul(retry_count.saturating_add(1));
                delay.min(*max)
            }
        }
    }
}
