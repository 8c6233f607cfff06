//! Global trace counters in the `message_trace` hash

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use taskmesh_broker::Broker;
use taskmesh_core::{OrchestrationResult, RetryPolicy, keys};

const CREATED_AT: &str = "created_at";

/// A counter in the `message_trace` hash
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    /// Tasks that reached the point of enqueue
    TotalMessages,
    /// Traces that ended `failed`
    FailedMessages,
}

impl Counter {
    pub fn field(&self) -> &'static str {
        match self {
            Counter::TotalMessages => "total_messages",
            Counter::FailedMessages => "failed_messages",
        }
    }
}

/// Snapshot of the global counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceStatistics {
    pub created_at: Option<DateTime<Utc>>,
    pub total_messages: u64,
    pub failed_messages: u64,
}

#[derive(Clone)]
pub struct TraceCounters {
    broker: Arc<dyn Broker>,
    retry: RetryPolicy,
}

impl TraceCounters {
    pub fn new(broker: Arc<dyn Broker>, retry: RetryPolicy) -> Self {
        Self { broker, retry }
    }

    /// Create the counters hash unless another process already did
    pub async fn init(&self) -> OrchestrationResult<()> {
        if self.broker.exists(keys::MESSAGE_TRACE).await? {
            return Ok(());
        }

        let fields = [
            (CREATED_AT, Utc::now().to_rfc3339()),
            (Counter::TotalMessages.field(), "0".to_string()),
            (Counter::FailedMessages.field(), "0".to_string()),
        ];
        self.broker.hset(keys::MESSAGE_TRACE, &fields).await?;
        debug!("Initialized message trace counters");
        Ok(())
    }

    /// Bump `counter` by one, returning the new value
    pub async fn increment(&self, counter: Counter) -> OrchestrationResult<u64> {
        let broker = &self.broker;
        let field = counter.field();
        let value = self
            .retry
            .run("increment_counter", move || async move {
                broker.hincr(keys::MESSAGE_TRACE, field, 1).await
            })
            .await?;
        Ok(value.max(0) as u64)
    }

    pub async fn snapshot(&self) -> OrchestrationResult<TraceStatistics> {
        let hash = self.broker.hgetall(keys::MESSAGE_TRACE).await?;
        let count = |counter: Counter| {
            hash.get(counter.field())
                .and_then(|raw| raw.parse::<u64>().ok())
                .unwrap_or(0)
        };

        let created_at = match hash.get(CREATED_AT) {
            Some(raw) => match DateTime::parse_from_rfc3339(raw) {
                Ok(ts) => Some(ts.with_timezone(&Utc)),
                Err(e) => {
                    warn!("Ignoring unreadable counters timestamp '{}': {}", raw, e);
                    None
                }
            },
            None => None,
        };

        Ok(TraceStatistics {
            created_at,
            total_messages: count(Counter::TotalMessages),
            failed_messages: count(Counter::FailedMessages),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskmesh_broker::InMemoryBroker;

    #[tokio::test]
    async fn test_init_starts_at_zero() {
        let counters = TraceCounters::new(Arc::new(InMemoryBroker::new()), RetryPolicy::none());
        counters.init().await.unwrap();

        let stats = counters.snapshot().await.unwrap();
        assert!(stats.created_at.is_some());
        assert_eq!(stats.total_messages, 0);
        assert_eq!(stats.failed_messages, 0);
    }

    #[tokio::test]
    async fn test_init_keeps_existing_counts() {
        let broker = Arc::new(InMemoryBroker::new());
        let first = TraceCounters::new(broker.clone(), RetryPolicy::none());
        first.init().await.unwrap();
        first.increment(Counter::TotalMessages).await.unwrap();
        let before = first.snapshot().await.unwrap();

        let second = TraceCounters::new(broker, RetryPolicy::none());
        second.init().await.unwrap();
        assert_eq!(second.snapshot().await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_increment() {
        let counters = TraceCounters::new(Arc::new(InMemoryBroker::new()), RetryPolicy::none());
        counters.init().await.unwrap();

        assert_eq!(counters.increment(Counter::TotalMessages).await.unwrap(), 1);
        assert_eq!(counters.increment(Counter::TotalMessages).await.unwrap(), 2);
        assert_eq!(counters.increment(Counter::FailedMessages).await.unwrap(), 1);

        let stats = counters.snapshot().await.unwrap();
        assert_eq!(stats.total_messages, 2);
        assert_eq!(stats.failed_messages, 1);
    }

    #[tokio::test]
    async fn test_snapshot_without_init() {
        let counters = TraceCounters::new(Arc::new(InMemoryBroker::new()), RetryPolicy::none());
        assert_eq!(counters.snapshot().await.unwrap(), TraceStatistics::default());
    }
}
