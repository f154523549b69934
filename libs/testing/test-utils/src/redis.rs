//! Redis test infrastructure
//!
//! Provides a `TestRedis` helper that runs a Redis container for queue tests.

use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::Client;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::redis::Redis;

/// Test Redis wrapper that ensures proper cleanup
///
/// The container is automatically stopped and removed when this struct is dropped.
///
/// # Example
///
/// ```no_run
/// use test_utils::TestRedis;
///
/// # async fn example() {
/// let redis = TestRedis::new().await;
/// let manager = redis.connection_manager().await;
/// // Hand `manager` to a RedisQueue or JobQueue
/// # }
/// ```
pub struct TestRedis {
    #[allow(dead_code)]
    container: ContainerAsync<Redis>,
    client: Client,
    connection: MultiplexedConnection,
    pub connection_string: String,
}

impl TestRedis {
    /// Create a new test Redis instance
    ///
    /// Uses Redis 8 Alpine image by default.
    pub async fn new() -> Self {
        let redis_image = Redis::default().with_tag("8-alpine");

        let container = redis_image
            .start()
            .await
            .expect("Failed to start Redis container");

        let host_port = container
            .get_host_port_ipv4(6379)
            .await
            .expect("Failed to get Redis port");

        let connection_string = format!("redis://127.0.0.1:{}", host_port);

        let client = Client::open(connection_string.clone())
            .expect("Failed to create Redis client");

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .expect("Failed to connect to Redis");

        tracing::info!(port = host_port, "Test Redis ready (Redis 8-alpine)");

        Self {
            container,
            client,
            connection,
            connection_string,
        }
    }

    /// Get a cloned multiplexed connection for raw inspection
    pub fn connection(&self) -> MultiplexedConnection {
        self.connection.clone()
    }

    /// Get a reconnecting connection manager, as the queue engines expect
    pub async fn connection_manager(&self) -> ConnectionManager {
        ConnectionManager::new(self.client.clone())
            .await
            .expect("Failed to create Redis connection manager")
    }

    /// Get the connection string for manual client creation
    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }
}

// Container is automatically cleaned up when TestRedis is dropped
impl Drop for TestRedis {
    fn drop(&mut self) {
        tracing::debug!("Cleaning up test Redis container");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use redis::AsyncCommands;

    #[tokio::test]
    #[ignore] // Requires Docker
    async fn test_stream_roundtrip() {
        let redis = TestRedis::new().await;
        let mut conn = redis.connection();

        let _: String = conn
            .xadd("test:stream", "*", &[("message", "{}")])
            .await
            .unwrap();
        let len: usize = conn.xlen("test:stream").await.unwrap();
        assert_eq!(len, 1);
    }

    #[tokio::test]
    #[ignore] // Requires Docker
    async fn test_connection_manager_ping() {
        let redis = TestRedis::new().await;
        let mut manager = redis.connection_manager().await;

        let pong: String = redis::cmd("PING").query_async(&mut manager).await.unwrap();
        assert_eq!(pong, "PONG");
    }
}
