//! In-process broker implementation
//!
//! `InMemoryBroker` mirrors the semantics of the Redis backend (FIFO lists with
//! blocking pop, hashes with atomic increments, broadcast pub/sub) inside one
//! process. It backs single-process deployments and every test in the
//! workspace, and supports fault injection so delivery failures can be
//! reproduced deterministically.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{Notify, broadcast};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tracing::debug;

use taskmesh_core::{BrokerError, BrokerResult};

use crate::broker::{Broker, PayloadStream};

const CHANNEL_CAPACITY: usize = 256;

/// Injected failure for one key
#[derive(Debug, Clone)]
struct Fault {
    error: BrokerError,
    /// `None` fails forever
    remaining: Option<usize>,
}

#[derive(Default)]
struct State {
    hashes: HashMap<String, HashMap<String, String>>,
    lists: HashMap<String, VecDeque<String>>,
    channels: HashMap<String, broadcast::Sender<String>>,
    push_faults: HashMap<String, Fault>,
    read_faults: HashMap<String, Fault>,
    push_attempts: HashMap<String, usize>,
    offline: bool,
}

/// Process-local broker with fault injection
///
/// # Example
///
/// ```rust
/// use taskmesh_broker::{Broker, InMemoryBroker};
/// use std::time::Duration;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let broker = InMemoryBroker::new();
/// broker.push("queue:jobs", "first".to_string()).await?;
/// broker.push("queue:jobs", "second".to_string()).await?;
///
/// let next = broker.pop("queue:jobs", Duration::ZERO).await?;
/// assert_eq!(next.as_deref(), Some("first"));
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<State>>,
    pushed: Arc<Notify>,
}

impl Fault {
    /// Error for this attempt, if the fault still fires
    fn fire(&mut self) -> Option<BrokerError> {
        match self.remaining.as_mut() {
            None => Some(self.error.clone()),
            Some(0) => None,
            Some(n) => {
                *n -= 1;
                Some(self.error.clone())
            }
        }
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> BrokerResult<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|e| BrokerError::Backend(format!("Lock poisoned: {}", e)))
    }

    fn online(&self) -> BrokerResult<MutexGuard<'_, State>> {
        let state = self.lock()?;
        if state.offline {
            return Err(BrokerError::Connection(
                "in-memory broker is offline".to_string(),
            ));
        }
        Ok(state)
    }

    /// Make pushes to `key` fail with `error`, `times` times or forever
    pub fn fail_pushes(&self, key: &str, error: BrokerError, times: Option<usize>) {
        if let Ok(mut state) = self.lock() {
            state.push_faults.insert(
                key.to_string(),
                Fault {
                    error,
                    remaining: times,
                },
            );
        }
    }

    /// Make hash reads of `key` fail with `error`, `times` times or forever
    pub fn fail_reads(&self, key: &str, error: BrokerError, times: Option<usize>) {
        if let Ok(mut state) = self.lock() {
            state.read_faults.insert(
                key.to_string(),
                Fault {
                    error,
                    remaining: times,
                },
            );
        }
    }

    /// Remove every injected failure
    pub fn clear_faults(&self) {
        if let Ok(mut state) = self.lock() {
            state.push_faults.clear();
            state.read_faults.clear();
        }
    }

    /// Number of push attempts made against `key`, including failed ones
    pub fn push_attempts(&self, key: &str) -> usize {
        self.lock()
            .map(|state| state.push_attempts.get(key).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// While offline every operation fails with a connection error
    pub fn set_offline(&self, offline: bool) {
        if let Ok(mut state) = self.lock() {
            state.offline = offline;
        }
    }

    fn readable(&self, key: &str) -> BrokerResult<MutexGuard<'_, State>> {
        let mut state = self.online()?;
        if let Some(error) = state.read_faults.get_mut(key).and_then(Fault::fire) {
            return Err(error);
        }
        Ok(state)
    }

    fn try_pop(&self, key: &str) -> BrokerResult<Option<String>> {
        let mut state = self.online()?;
        Ok(state.lists.get_mut(key).and_then(|list| list.pop_front()))
    }
}

/// Glob match supporting `*` wildcards, enough for key-space scans
fn glob_match(pattern: &str, candidate: &str) -> bool {
    let mut parts = pattern.split('*');
    let first = parts.next().unwrap_or("");
    if !candidate.starts_with(first) {
        return false;
    }
    let mut rest = &candidate[first.len()..];
    let parts: Vec<&str> = parts.collect();
    if parts.is_empty() {
        return rest.is_empty();
    }
    for (i, part) in parts.iter().enumerate() {
        let last = i == parts.len() - 1;
        if last {
            return rest.ends_with(part);
        }
        match rest.find(part) {
            Some(pos) => rest = &rest[pos + part.len()..],
            None => return false,
        }
    }
    true
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn hset(&self, key: &str, fields: &[(&str, String)]) -> BrokerResult<()> {
        let mut state = self.online()?;
        let hash = state.hashes.entry(key.to_string()).or_default();
        for (field, value) in fields {
            hash.insert((*field).to_string(), value.clone());
        }
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> BrokerResult<Option<String>> {
        let state = self.readable(key)?;
        Ok(state.hashes.get(key).and_then(|h| h.get(field)).cloned())
    }

    async fn hgetall(&self, key: &str) -> BrokerResult<HashMap<String, String>> {
        let state = self.readable(key)?;
        Ok(state.hashes.get(key).cloned().unwrap_or_default())
    }

    async fn hincr(&self, key: &str, field: &str, delta: i64) -> BrokerResult<i64> {
        let mut state = self.online()?;
        let hash = state.hashes.entry(key.to_string()).or_default();
        let current = match hash.get(field) {
            Some(raw) => raw.parse::<i64>().map_err(|_| {
                BrokerError::Backend(format!("hash value is not an integer: {key}.{field}"))
            })?,
            None => 0,
        };
        let next = current.checked_add(delta).ok_or_else(|| {
            BrokerError::Backend(format!("increment would overflow: {key}.{field}"))
        })?;
        hash.insert(field.to_string(), next.to_string());
        Ok(next)
    }

    async fn exists(&self, key: &str) -> BrokerResult<bool> {
        let state = self.online()?;
        Ok(state.hashes.get(key).is_some_and(|h| !h.is_empty())
            || state.lists.get(key).is_some_and(|l| !l.is_empty()))
    }

    async fn keys(&self, pattern: &str) -> BrokerResult<Vec<String>> {
        let state = self.online()?;
        let mut keys: Vec<String> = state
            .hashes
            .keys()
            .chain(state.lists.keys())
            .filter(|k| glob_match(pattern, k))
            .cloned()
            .collect();
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn push(&self, key: &str, value: String) -> BrokerResult<()> {
        {
            let mut state = self.lock()?;
            *state.push_attempts.entry(key.to_string()).or_insert(0) += 1;

            if state.offline {
                return Err(BrokerError::Connection(
                    "in-memory broker is offline".to_string(),
                ));
            }

            if let Some(error) = state.push_faults.get_mut(key).and_then(Fault::fire) {
                return Err(error);
            }

            state
                .lists
                .entry(key.to_string())
                .or_default()
                .push_back(value);
        }
        self.pushed.notify_waiters();
        Ok(())
    }

    async fn pop(&self, key: &str, wait: Duration) -> BrokerResult<Option<String>> {
        let deadline = tokio::time::Instant::now() + wait;

        loop {
            let notified = self.pushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(value) = self.try_pop(key)? {
                return Ok(Some(value));
            }

            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }

            if tokio::time::timeout(remaining, notified).await.is_err() {
                return self.try_pop(key);
            }
        }
    }

    async fn len(&self, key: &str) -> BrokerResult<usize> {
        let state = self.online()?;
        Ok(state.lists.get(key).map_or(0, |l| l.len()))
    }

    async fn range(&self, key: &str, limit: usize) -> BrokerResult<Vec<String>> {
        let state = self.online()?;
        Ok(state
            .lists
            .get(key)
            .map(|l| l.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn publish(&self, channel: &str, payload: String) -> BrokerResult<usize> {
        let state = self.online()?;
        let delivered = match state.channels.get(channel) {
            Some(sender) => sender.send(payload).unwrap_or(0),
            None => 0,
        };
        debug!("Published to {} ({} receivers)", channel, delivered);
        Ok(delivered)
    }

    async fn subscribe(&self, channel: &str) -> BrokerResult<PayloadStream> {
        let mut state = self.online()?;
        let receiver = state
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe();

        let stream = BroadcastStream::new(receiver).filter_map(|item| item.ok());
        Ok(Box::pin(stream))
    }

    async fn ping(&self) -> BrokerResult<()> {
        self.online().map(|_| ())
    }
}
