//! # Ordered Log Transport
//!
//! The protocol runs over two single-partition logs:
//!
//! ```text
//!   replicas ──publish──► <prefix>-unresolved ──poll──► sequencer
//!   sequencer ─publish──► <prefix>-resolved ───poll──► every replica
//! ```
//!
//! A record is `(envelope key, sealed payload)`; a record without a payload
//! is an error marker. The transport must preserve order within a topic,
//! deliver at least once, and keep consumer-group offsets independently.
//!
//! [`InMemoryLog`] implements the trait in-process for tests and simulations.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::warn;

use crate::config::RetryPolicy;
use crate::error::{Error, Result};
use crate::signal::StopSignal;

/// Topic suffix for submissions waiting for the sequencer.
pub const UNRESOLVED_SUFFIX: &str = "unresolved";

/// Topic suffix for sequenced transactions.
pub const RESOLVED_SUFFIX: &str = "resolved";

/// Consumer group shared by every sequencer candidate.
pub const SEQUENCER_GROUP: &str = "sequencer";

// =============================================================================
// Records and Topics
// =============================================================================

/// One message on a log topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub key: Vec<u8>,
    /// `None` marks a rejected transaction.
    pub value: Option<Vec<u8>>,
}

/// A record together with its offset in the topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumedRecord {
    pub offset: u64,
    pub record: LogRecord,
}

/// Names of the two topics of one managed database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    pub unresolved: String,
    pub resolved: String,
}

impl Topics {
    pub fn new(prefix: &str) -> Self {
        Self {
            unresolved: format!("{}-{}", prefix, UNRESOLVED_SUFFIX),
            resolved: format!("{}-{}", prefix, RESOLVED_SUFFIX),
        }
    }
}

/// Consumer group of one replica's applier.
pub fn applier_group(replica: &crate::types::ReplicaId) -> String {
    format!("{}-applier", replica)
}

// =============================================================================
// Transport Trait
// =============================================================================

/// Ordered, at-least-once log with consumer-group offsets.
#[async_trait]
pub trait LogTransport: Send + Sync {
    /// Appends a record and returns its offset.
    async fn publish(&self, topic: &str, record: LogRecord) -> Result<u64>;

    /// Returns up to `max` records starting at offset `from`, waiting up to
    /// `wait` if none are available yet.
    async fn poll(
        &self,
        topic: &str,
        from: u64,
        max: usize,
        wait: Duration,
    ) -> Result<Vec<ConsumedRecord>>;

    /// Next offset `group` should read from `topic` (0 if never committed).
    async fn committed_offset(&self, topic: &str, group: &str) -> Result<u64>;

    /// Records that `group` has consumed everything before `next`.
    async fn commit_offset(&self, topic: &str, group: &str, next: u64) -> Result<()>;

    /// Offset the next published record will get.
    async fn end_offset(&self, topic: &str) -> Result<u64>;
}

/// Runs a transport call, retrying [`Error::Transport`] failures with
/// exponential backoff.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, operation: &str, mut call: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(Error::Transport(msg)) if attempt < policy.max_retries => {
                let delay = policy.delay_for(attempt);
                warn!(operation, attempt, delay_ms = delay.as_millis() as u64, error = %msg, "transport call failed, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Like [`with_retry`], but gives up once `stop` trips: no attempt starts
/// after the latch and backoff sleeps end early. Returns `Ok(None)` if
/// stopped before a call succeeded.
pub async fn with_retry_until<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    stop: &StopSignal,
    mut call: F,
) -> Result<Option<T>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut stopped = stop.clone();
    let mut attempt = 0;
    loop {
        if stop.is_stopped() {
            return Ok(None);
        }
        match call().await {
            Ok(value) => return Ok(Some(value)),
            Err(Error::Transport(msg)) if attempt < policy.max_retries => {
                let delay = policy.delay_for(attempt);
                warn!(operation, attempt, delay_ms = delay.as_millis() as u64, error = %msg, "transport call failed, retrying");
                tokio::select! {
                    _ = stopped.stopped() => return Ok(None),
                    _ = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

// =============================================================================
// In-Memory Log
// =============================================================================

#[derive(Default)]
struct LogState {
    topics: HashMap<String, Vec<LogRecord>>,
    offsets: HashMap<(String, String), u64>,
    failing_publishes: usize,
}

/// In-process [`LogTransport`] with fault injection.
#[derive(Default)]
pub struct InMemoryLog {
    state: Mutex<LogState>,
    appended: Notify,
}

impl InMemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, LogState>> {
        self.state
            .lock()
            .map_err(|_| Error::Transport("in-memory log poisoned".into()))
    }

    /// Makes the next `count` publishes fail with [`Error::Transport`].
    pub fn fail_next_publishes(&self, count: usize) {
        if let Ok(mut state) = self.lock() {
            state.failing_publishes = count;
        }
    }

    /// Snapshot of every record on `topic`.
    pub fn records(&self, topic: &str) -> Vec<LogRecord> {
        self.lock()
            .map(|state| state.topics.get(topic).cloned().unwrap_or_default())
            .unwrap_or_default()
    }
}

#[async_trait]
impl LogTransport for InMemoryLog {
    async fn publish(&self, topic: &str, record: LogRecord) -> Result<u64> {
        let offset = {
            let mut state = self.lock()?;
            if state.failing_publishes > 0 {
                state.failing_publishes -= 1;
                return Err(Error::Transport(format!("injected publish failure on {}", topic)));
            }
            let log = state.topics.entry(topic.to_string()).or_default();
            log.push(record);
            (log.len() - 1) as u64
        };
        self.appended.notify_waiters();
        Ok(offset)
    }

    async fn poll(
        &self,
        topic: &str,
        from: u64,
        max: usize,
        wait: Duration,
    ) -> Result<Vec<ConsumedRecord>> {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.appended.notified();
            tokio::pin!(notified);
            // Register before checking so a publish in between is not missed.
            notified.as_mut().enable();

            {
                let state = self.lock()?;
                if let Some(log) = state.topics.get(topic) {
                    let start = from as usize;
                    if start < log.len() {
                        return Ok(log[start..]
                            .iter()
                            .take(max)
                            .enumerate()
                            .map(|(i, record)| ConsumedRecord {
                                offset: from + i as u64,
                                record: record.clone(),
                            })
                            .collect());
                    }
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn committed_offset(&self, topic: &str, group: &str) -> Result<u64> {
        let state = self.lock()?;
        Ok(state
            .offsets
            .get(&(topic.to_string(), group.to_string()))
            .copied()
            .unwrap_or(0))
    }

    async fn commit_offset(&self, topic: &str, group: &str, next: u64) -> Result<()> {
        let mut state = self.lock()?;
        state
            .offsets
            .insert((topic.to_string(), group.to_string()), next);
        Ok(())
    }

    async fn end_offset(&self, topic: &str) -> Result<u64> {
        let state = self.lock()?;
        Ok(state.topics.get(topic).map(|log| log.len() as u64).unwrap_or(0))
    }
}
