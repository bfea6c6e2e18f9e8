//! # Pending-Operation Table
//!
//! Maps every outstanding submission of this replica to the handle its
//! caller is waiting on. Entries live only in memory and are removed exactly
//! once: the first matching resolved message (or error marker) completes the
//! entry, and any later duplicate finds nothing.
//!
//! Also home to [`ResolvedOrigins`], the bounded memory of submissions that
//! already made it onto the resolved log.

use std::collections::HashMap;
use std::future::Future;
use std::num::NonZeroUsize;
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard};
use std::task::{Context, Poll};

use lru::LruCache;
use tokio::sync::oneshot;

use crate::envelope::PendingKey;
use crate::error::{Error, Result};
use crate::types::{CorrelationMap, OriginSeq};

type Completion = oneshot::Sender<Result<CorrelationMap>>;

/// Outstanding submissions of one replica.
#[derive(Default)]
pub struct PendingTable {
    entries: Mutex<HashMap<PendingKey, Completion>>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<PendingKey, Completion>> {
        // A panic while holding the lock cannot leave the map half-updated.
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Registers a submission and returns the handle its caller awaits.
    pub fn register(&self, key: PendingKey) -> SubmitHandle {
        let (tx, rx) = oneshot::channel();
        let origin_seq = key.origin_seq;
        self.entries().insert(key, tx);
        SubmitHandle { origin_seq, rx }
    }

    /// Registers a submission that is removed again when the returned guard
    /// drops, unless [`PendingGuard::keep`] is called first.
    ///
    /// Covers the window between registering and publishing: a caller that
    /// gives up mid-publish leaves no entry behind.
    pub fn register_guarded(&self, key: PendingKey) -> (SubmitHandle, PendingGuard<'_>) {
        let handle = self.register(key.clone());
        (
            handle,
            PendingGuard {
                table: self,
                key: Some(key),
            },
        )
    }

    /// Completes and removes the entry for `key`.
    ///
    /// Returns `false` if there was no entry (already completed, or not ours).
    pub fn complete(&self, key: &PendingKey, result: Result<CorrelationMap>) -> bool {
        match self.entries().remove(key) {
            Some(tx) => {
                // The caller may have dropped its handle; the entry is gone either way.
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }

    /// Removes an entry without completing it (its handle sees a shutdown error).
    pub fn abandon(&self, key: &PendingKey) {
        self.entries().remove(key);
    }

    /// Fails every outstanding entry, e.g. when the replica shuts down.
    pub fn fail_all(&self, reason: &str) {
        for (_, tx) in self.entries().drain() {
            let _ = tx.send(Err(Error::Shutdown(reason.to_string())));
        }
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Abandons its entry on drop unless kept.
#[must_use = "dropping the guard abandons the registration"]
pub struct PendingGuard<'a> {
    table: &'a PendingTable,
    key: Option<PendingKey>,
}

impl PendingGuard<'_> {
    /// Leaves the entry in place for the applier to complete.
    pub fn keep(mut self) {
        self.key = None;
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.table.abandon(&key);
        }
    }
}

/// Future resolving to the record ids assigned to a submission.
///
/// Dropping the handle abandons interest; the protocol carries on regardless.
#[derive(Debug)]
pub struct SubmitHandle {
    origin_seq: OriginSeq,
    rx: oneshot::Receiver<Result<CorrelationMap>>,
}

impl SubmitHandle {
    /// Origin sequence of the submission this handle tracks.
    pub fn origin_seq(&self) -> OriginSeq {
        self.origin_seq
    }
}

impl Future for SubmitHandle {
    type Output = Result<CorrelationMap>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|received| {
            received.unwrap_or_else(|_| Err(Error::Shutdown("pending operation abandoned".into())))
        })
    }
}

/// Bounded set of pending keys already seen on the resolved log.
///
/// The sequencer consults it to drop duplicate deliveries of a submission
/// it (or a predecessor) has already sequenced.
pub struct ResolvedOrigins {
    seen: Mutex<LruCache<PendingKey, ()>>,
}

impl ResolvedOrigins {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            seen: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn seen(&self) -> MutexGuard<'_, LruCache<PendingKey, ()>> {
        self.seen.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn insert(&self, key: PendingKey) {
        self.seen().put(key, ());
    }

    pub fn contains(&self, key: &PendingKey) -> bool {
        self.seen().contains(key)
    }
}
