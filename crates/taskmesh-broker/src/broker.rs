//! Core Broker trait for the shared substrate

use async_trait::async_trait;
use futures::Stream;
use std::collections::HashMap;
use std::pin::Pin;
use std::time::Duration;

use taskmesh_core::BrokerResult;

/// Stream of payloads published on a channel
pub type PayloadStream = Pin<Box<dyn Stream<Item = String> + Send + 'static>>;

/// Shared key-value, list, and publish/subscribe store
///
/// Every process taking part in orchestration talks to the same broker. Each
/// write is a single atomic command; callers never rely on multi-key
/// transactions.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Set one or more fields of a hash
    async fn hset(&self, key: &str, fields: &[(&str, String)]) -> BrokerResult<()>;

    /// Read one field of a hash
    async fn hget(&self, key: &str, field: &str) -> BrokerResult<Option<String>>;

    /// Read every field of a hash; an absent hash reads as empty
    async fn hgetall(&self, key: &str) -> BrokerResult<HashMap<String, String>>;

    /// Atomically add `delta` to an integer hash field, returning the new value
    async fn hincr(&self, key: &str, field: &str, delta: i64) -> BrokerResult<i64>;

    /// Whether a key holds any value
    async fn exists(&self, key: &str) -> BrokerResult<bool>;

    /// Keys matching a glob pattern
    async fn keys(&self, pattern: &str) -> BrokerResult<Vec<String>>;

    /// Append a value to the tail of a FIFO list
    async fn push(&self, key: &str, value: String) -> BrokerResult<()>;

    /// Take the value at the head of a FIFO list, waiting up to `wait`
    ///
    /// A zero `wait` never blocks.
    async fn pop(&self, key: &str, wait: Duration) -> BrokerResult<Option<String>>;

    /// Number of values in a list
    async fn len(&self, key: &str) -> BrokerResult<usize>;

    /// Up to `limit` values from the head of a list, oldest first, without
    /// removing them
    async fn range(&self, key: &str, limit: usize) -> BrokerResult<Vec<String>>;

    /// Publish a payload, returning how many subscribers received it
    async fn publish(&self, channel: &str, payload: String) -> BrokerResult<usize>;

    /// Subscribe to payloads published on a channel after this call
    async fn subscribe(&self, channel: &str) -> BrokerResult<PayloadStream>;

    /// Round-trip check
    async fn ping(&self) -> BrokerResult<()>;
}
