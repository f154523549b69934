//! Shared test utilities for queue testing
//!
//! This crate provides reusable test infrastructure:
//! - `TestRedis`: Redis container with automatic cleanup (feature: "redis")
//! - `TestDataBuilder`: Deterministic shop domains, topic keys and IDs (always available)
//! - `assertions`: Custom assertion and polling helpers (always available)
//!
//! # Features
//!
//! - `redis`: Enables Redis test infrastructure
//! - `all`: Enables everything
//!
//! # Usage
//!
//! Add `features = ["redis"]` to your dev-dependencies:
//!
//! ```toml
//! [dev-dependencies]
//! test-utils = { workspace = true, features = ["redis"] }
//! ```
//!
//! Then in your tests:
//!
//! ```rust,ignore
//! use test_utils::{TestDataBuilder, TestRedis};
//!
//! #[tokio::test]
//! #[ignore] // Requires Docker
//! async fn my_redis_test() {
//!     let redis = TestRedis::new().await;
//!     let manager = redis.connection_manager().await;
//!     let builder = TestDataBuilder::from_test_name("my_redis_test");
//!
//!     let shop = builder.shop_domain("main");
//!     let topic = builder.topic_key("orders");
//! }
//! ```

#[cfg(feature = "redis")]
mod redis;

#[cfg(feature = "redis")]
pub use redis::TestRedis;

/// Builder for test data with deterministic randomization
///
/// This ensures tests are reproducible by deriving every value from a seed.
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
    /// let builder = TestDataBuilder::from_test_name("test_purge_shop");
    /// ```
    pub fn from_test_name(name: &str) -> Self {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        Self::new(hasher.finish())
    }

    /// Unique shop domain for a tenant in this test
    ///
    /// # Example
    ///
    /// ```
    /// use test_utils::TestDataBuilder;
    ///
    /// let builder = TestDataBuilder::new(7);
    /// assert_eq!(builder.shop_domain("alpha"), "test-7-alpha.myshopify.com");
    /// ```
    pub fn shop_domain(&self, tenant: &str) -> String {
        format!("test-{}-{}.myshopify.com", self.seed, tenant)
    }

    /// Unique topic key, so concurrent tests never share a topic
    ///
    /// ```
    /// use test_utils::TestDataBuilder;
    ///
    /// let builder = TestDataBuilder::new(7);
    /// assert_eq!(builder.topic_key("orders/create"), "orders/create-7");
    /// ```
    pub fn topic_key(&self, event: &str) -> String {
        format!("{}-{}", event, self.seed)
    }

    /// Unique key prefix for Redis-backed tests
    pub fn key_prefix(&self) -> String {
        format!("test-{}", self.seed)
    }
}

/// Test assertion helpers
pub mod assertions {
    use std::time::Duration;

    /// Assert that an optional value is Some
    pub fn assert_some<T>(value: Option<T>, context: &str) -> T {
        value.unwrap_or_else(|| panic!("{}: expected Some, got None", context))
    }

    /// Poll `check` every 5ms until it returns true or `timeout` elapses
    pub async fn eventually<F>(timeout: Duration, mut check: F) -> bool
    where
        F: FnMut() -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if check() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Panic with `context` unless `check` becomes true within `timeout`
    pub async fn assert_eventually<F>(timeout: Duration, check: F, context: &str)
    where
        F: FnMut() -> bool,
    {
        assert!(
            eventually(timeout, check).await,
            "{}: condition not met within {:?}",
            context,
            timeout
        );
    }
}
