//! Redis-based implementation of Broker

use async_trait::async_trait;
use futures::StreamExt;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, error};

use taskmesh_core::{BrokerError, BrokerResult};

use crate::broker::{Broker, PayloadStream};
use crate::config::BrokerConfig;

/// Classify a Redis error; only connectivity problems are transient
fn map_redis_error(err: redis::RedisError) -> BrokerError {
    if err.is_timeout() {
        BrokerError::Timeout(err.to_string())
    } else if err.is_connection_dropped() || err.is_connection_refusal() || err.is_io_error() {
        BrokerError::Connection(err.to_string())
    } else {
        BrokerError::Backend(err.to_string())
    }
}

/// Redis-backed broker using a deadpool connection pool
pub struct RedisBroker {
    pool: deadpool_redis::Pool,
    config: BrokerConfig,
}

impl RedisBroker {
    /// Connect with default configuration
    pub async fn new(url: impl Into<String>) -> BrokerResult<Self> {
        Self::with_config(BrokerConfig::new(url)).await
    }

    /// Connect with custom configuration
    pub async fn with_config(config: BrokerConfig) -> BrokerResult<Self> {
        config
            .validate()
            .map_err(|e| BrokerError::Backend(e.to_string()))?;

        let mut redis_config = deadpool_redis::Config::from_url(&config.url);
        let mut pool_config = deadpool_redis::PoolConfig::new(config.pool_size);
        pool_config.timeouts.wait = Some(config.connect_timeout);
        pool_config.timeouts.create = Some(config.connect_timeout);
        redis_config.pool = Some(pool_config);

        let pool = redis_config
            .create_pool(Some(deadpool_redis::Runtime::Tokio1))
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        let broker = Self { pool, config };
        broker
            .ping()
            .await
            .map_err(|e| BrokerError::Connection(format!("PING failed: {}", e)))?;

        debug!(pool_size = broker.config.pool_size, "Redis broker connected");
        Ok(broker)
    }

    /// Get a connection from the pool
    async fn get_connection(&self) -> BrokerResult<deadpool_redis::Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))
    }

    /// Bound a command by the configured command timeout plus `extra`
    async fn timed<T, F>(&self, extra: Duration, command: F) -> BrokerResult<T>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        let limit = self.config.command_timeout + extra;
        match tokio::time::timeout(limit, command).await {
            Ok(result) => result.map_err(map_redis_error),
            Err(_) => Err(BrokerError::Timeout(format!(
                "command exceeded {}ms",
                limit.as_millis()
            ))),
        }
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn hset(&self, key: &str, fields: &[(&str, String)]) -> BrokerResult<()> {
        let mut conn = self.get_connection().await?;
        self.timed(Duration::ZERO, conn.hset_multiple::<_, _, _, ()>(key, fields))
            .await
    }

    async fn hget(&self, key: &str, field: &str) -> BrokerResult<Option<String>> {
        let mut conn = self.get_connection().await?;
        self.timed(Duration::ZERO, conn.hget(key, field)).await
    }

    async fn hgetall(&self, key: &str) -> BrokerResult<HashMap<String, String>> {
        let mut conn = self.get_connection().await?;
        self.timed(Duration::ZERO, conn.hgetall(key)).await
    }

    async fn hincr(&self, key: &str, field: &str, delta: i64) -> BrokerResult<i64> {
        let mut conn = self.get_connection().await?;
        self.timed(Duration::ZERO, conn.hincr(key, field, delta))
            .await
    }

    async fn exists(&self, key: &str) -> BrokerResult<bool> {
        let mut conn = self.get_connection().await?;
        self.timed(Duration::ZERO, conn.exists(key)).await
    }

    async fn keys(&self, pattern: &str) -> BrokerResult<Vec<String>> {
        let mut conn = self.get_connection().await?;
        self.timed(Duration::ZERO, conn.keys(pattern)).await
    }

    async fn push(&self, key: &str, value: String) -> BrokerResult<()> {
        let mut conn = self.get_connection().await?;
        // LPUSH + BRPOP keeps the list FIFO
        self.timed(Duration::ZERO, conn.lpush::<_, _, ()>(key, value))
            .await
    }

    async fn pop(&self, key: &str, wait: Duration) -> BrokerResult<Option<String>> {
        let mut conn = self.get_connection().await?;

        // BRPOP with a zero timeout blocks forever
        if wait.is_zero() {
            return self
                .timed(Duration::ZERO, conn.rpop::<_, Option<String>>(key, None))
                .await;
        }

        let result: Option<(String, String)> = self
            .timed(wait, conn.brpop(key, wait.as_secs_f64()))
            .await?;
        Ok(result.map(|(_key, value)| value))
    }

    async fn len(&self, key: &str) -> BrokerResult<usize> {
        let mut conn = self.get_connection().await?;
        self.timed(Duration::ZERO, conn.llen(key)).await
    }

    async fn range(&self, key: &str, limit: usize) -> BrokerResult<Vec<String>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.get_connection().await?;
        // The oldest entries sit at the tail of an LPUSH list
        let start = -(limit as isize);
        let mut values: Vec<String> = self
            .timed(Duration::ZERO, conn.lrange(key, start, -1))
            .await?;
        values.reverse();
        Ok(values)
    }

    async fn publish(&self, channel: &str, payload: String) -> BrokerResult<usize> {
        let mut conn = self.get_connection().await?;
        let receivers: usize = self
            .timed(Duration::ZERO, conn.publish(channel, payload))
            .await?;
        debug!("Published to {} ({} receivers)", channel, receivers);
        Ok(receivers)
    }

    async fn subscribe(&self, channel: &str) -> BrokerResult<PayloadStream> {
        // For pub/sub we need a dedicated connection
        let client = redis::Client::open(self.config.url.as_str()).map_err(map_redis_error)?;

        let mut pubsub = client
            .get_async_pubsub()
            .await
            .map_err(map_redis_error)?;

        pubsub.subscribe(channel).await.map_err(map_redis_error)?;

        debug!("Subscribed to channel {}", channel);

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            match msg.get_payload::<String>() {
                Ok(payload) => Some(payload),
                Err(e) => {
                    error!("Failed to get message payload: {}", e);
                    None
                }
            }
        });

        Ok(Box::pin(stream))
    }

    async fn ping(&self) -> BrokerResult<()> {
        let mut conn = self.get_connection().await?;
        self.timed(
            Duration::ZERO,
            redis::cmd("PING").query_async::<String>(&mut *conn),
        )
        .await
        .map(|_| ())
    }
}
