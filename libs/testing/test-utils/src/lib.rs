//! Shared test utilities for the broker crates
//!
//! - `TestRabbitMq`: RabbitMQ container with automatic cleanup (feature: "rabbitmq")
//! - `TestDataBuilder`: Deterministic queue names and payloads (always available)
//! - `assertions`: Custom assertion helpers (always available)
//!
//! # Usage
//!
//! Add `features = ["rabbitmq"]` to your dev-dependencies:
//!
//! ```toml
//! [dev-dependencies]
//! test-utils = { workspace = true, features = ["rabbitmq"] }
//! ```
//!
//! Then in your tests:
//!
//! ```rust,ignore
//! use test_utils::{TestDataBuilder, TestRabbitMq};
//!
//! #[tokio::test]
//! #[ignore = "requires Docker"]
//! async fn my_broker_test() {
//!     let rabbit = TestRabbitMq::new().await;
//!     let data = TestDataBuilder::from_test_name("my_broker_test");
//!
//!     let queue = data.queue_name("orders");
//!     let client = broker::BrokerClient::new(rabbit.amqp_url(), Default::default());
//!     client.ensure_queue(&queue).await.unwrap();
//! }
//! ```

use uuid::Uuid;

#[cfg(feature = "rabbitmq")]
mod rabbitmq;

#[cfg(feature = "rabbitmq")]
pub use rabbitmq::TestRabbitMq;

/// Builder for test data with deterministic randomization
///
/// Queue names derived from the test name keep parallel tests against one
/// broker from reading each other's messages.
pub struct TestDataBuilder {
    seed: u64,
}

impl TestDataBuilder {
    /// Create a new builder with a seed (for deterministic tests)
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    /// Create from test name (generates seed from test name hash)
    ///
    /// # Example
    ///
    /// ```
    /// use test_utils::TestDataBuilder;
    ///
    /// let builder = TestDataBuilder::from_test_name("test_confirmed_publish");
    /// ```
    pub fn from_test_name(name: &str) -> Self {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        Self::new(hasher.finish())
    }

    /// Queue name unique to this builder's seed
    ///
    /// # Example
    ///
    /// ```
    /// use test_utils::TestDataBuilder;
    ///
    /// let builder = TestDataBuilder::new(7);
    /// assert_eq!(builder.queue_name("orders"), "test.orders.7");
    /// ```
    pub fn queue_name(&self, base: &str) -> String {
        format!("test.{}.{}", base, self.seed)
    }

    /// Deterministic message id
    pub fn message_id(&self, index: u64) -> Uuid {
        let bytes = self.seed.to_le_bytes();
        let mut uuid_bytes = [0u8; 16];
        uuid_bytes[..8].copy_from_slice(&bytes);
        uuid_bytes[8..16].copy_from_slice(&index.to_le_bytes());
        Uuid::from_bytes(uuid_bytes)
    }

    /// Payload carrying the message id, so deliveries can be matched to sends
    pub fn payload(&self, index: u64) -> Vec<u8> {
        format!("message-{}-{}", index, self.message_id(index)).into_bytes()
    }
}

/// Test assertion helpers
pub mod assertions {
    /// Assert that a delivered payload matches what was sent
    pub fn assert_payload_eq(actual: &[u8], expected: &[u8], context: &str) {
        assert_eq!(
            actual,
            expected,
            "{}: expected payload {:?}, got {:?}",
            context,
            String::from_utf8_lossy(expected),
            String::from_utf8_lossy(actual)
        );
    }

    /// Assert that an optional value is Some
    pub fn assert_some<T>(value: Option<T>, context: &str) -> T {
        value.unwrap_or_else(|| panic!("{}: expected Some, got None", context))
    }
}
