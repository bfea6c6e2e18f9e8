//! # Replica Applier
//!
//! Every replica, including the one currently sequencing, runs one applier.
//! It follows the resolved log from its consumer group's committed offset and
//! applies each transaction to local storage in log order.
//!
//! ```text
//!  <prefix>-resolved ──poll──► decode key ──► open + decode ──► order check ──► writer.apply
//!                                  │               │                 │               │
//!                              skip (warn)    fail own op       replay / halt    complete own op
//! ```
//!
//! ## Ordering
//!
//! A packet is applied only when its transaction id is exactly `last + 1`.
//!
//! - `id <= last`: a replay (at-least-once delivery). Skipped and counted.
//!   If the origin is still waiting on it, this copy was never applied and
//!   the submission fails.
//! - `id > last + 1`: a gap. The applier halts with [`Error::OrderViolation`]
//!   and never applies anything again; a gap means the replicas can no longer
//!   be trusted to converge.
//!
//! ## Own Submissions
//!
//! Messages whose origin is this replica go through the same checks and the
//! same apply path as everyone else's. The pending operation is completed
//! afterwards, so a caller always observes its writes locally.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::codec::decode_packet;
use crate::config::ClusterConfig;
use crate::crypto::PacketCipher;
use crate::envelope::{MessageEnvelope, PendingKey};
use crate::error::{Error, Result};
use crate::pending::{PendingTable, ResolvedOrigins};
use crate::signal::StopSignal;
use crate::transport::{applier_group, with_retry, ConsumedRecord, LogTransport, Topics};
use crate::types::{ReplicaId, SequencerSeq, TransactionId};
use crate::writer::StorageWriterHandle;

// =============================================================================
// Progress
// =============================================================================

/// What the applier has done so far, published on a watch channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplierProgress {
    /// Next resolved-log offset to consume.
    pub next_offset: u64,

    /// Last transaction applied to local storage.
    pub last_transaction_id: TransactionId,

    /// Highest sequencer sequence seen on the resolved log.
    pub max_sequencer_seq: Option<SequencerSeq>,

    /// Replayed messages skipped so far.
    pub replays: u64,

    /// Set once the applier has stopped on an unrecoverable error.
    pub halted: bool,
}

/// Waits until `done` holds for the applier's progress.
///
/// # Errors
///
/// [`Error::Shutdown`] if the applier halts or goes away first.
pub(crate) async fn wait_for_progress(
    progress: &mut watch::Receiver<ApplierProgress>,
    mut done: impl FnMut(&ApplierProgress) -> bool,
) -> Result<ApplierProgress> {
    loop {
        {
            let current = progress.borrow_and_update();
            if done(&current) {
                return Ok(current.clone());
            }
            if current.halted {
                return Err(Error::Shutdown("applier halted".into()));
            }
        }
        progress
            .changed()
            .await
            .map_err(|_| Error::Shutdown("applier stopped".into()))?;
    }
}

// =============================================================================
// Applier
// =============================================================================

pub(crate) struct ReplicaApplier {
    replica_id: ReplicaId,
    group: String,
    topics: Topics,
    config: ClusterConfig,
    transport: Arc<dyn LogTransport>,
    cipher: PacketCipher,
    writer: StorageWriterHandle,
    pending: Arc<PendingTable>,
    resolved_origins: Arc<ResolvedOrigins>,
    progress: watch::Sender<ApplierProgress>,
    last_applied: TransactionId,
}

impl ReplicaApplier {
    pub(crate) fn new(
        config: ClusterConfig,
        transport: Arc<dyn LogTransport>,
        cipher: PacketCipher,
        writer: StorageWriterHandle,
        pending: Arc<PendingTable>,
        resolved_origins: Arc<ResolvedOrigins>,
        progress: watch::Sender<ApplierProgress>,
    ) -> Self {
        Self {
            replica_id: config.replica_id.clone(),
            group: applier_group(&config.replica_id),
            topics: Topics::new(&config.topic_prefix),
            config,
            transport,
            cipher,
            writer,
            pending,
            resolved_origins,
            progress,
            last_applied: TransactionId::NONE,
        }
    }

    /// Consumes the resolved log until `stop` trips or an unrecoverable error.
    ///
    /// Transport outages are waited out. Only a gap or a failed local apply
    /// halts the applier; outstanding submissions then fail at once.
    pub(crate) async fn run(mut self, stop: StopSignal) -> Result<()> {
        let outcome = self.follow(stop).await;
        if let Err(e) = &outcome {
            error!(replica = %self.replica_id, error = %e, "applier halted");
            self.progress.send_modify(|p| p.halted = true);
            self.pending.fail_all("applier halted");
        }
        outcome
    }

    async fn follow(&mut self, mut stop: StopSignal) -> Result<()> {
        let topic = self.topics.resolved.clone();
        let group = self.group.clone();

        let mut next = loop {
            let transport = &self.transport;
            match with_retry(&self.config.retry, "committed_offset", || {
                transport.committed_offset(&topic, &group)
            })
            .await
            {
                Ok(next) => break next,
                Err(e @ Error::Transport(_)) => {
                    if !self.wait_out_outage(&mut stop, &e).await {
                        return Ok(());
                    }
                }
                Err(e) => return Err(e),
            }
        };
        self.last_applied = self.writer.last_applied().await?;
        let last = self.last_applied;
        self.progress.send_modify(|p| {
            p.next_offset = next;
            p.last_transaction_id = last;
        });
        info!(replica = %self.replica_id, offset = next, txn_id = %last, "applier started");

        loop {
            let polled = tokio::select! {
                _ = stop.stopped() => break,
                batch = with_retry(&self.config.retry, "poll", || {
                    self.transport.poll(&topic, next, self.config.poll_batch_max, self.config.poll_timeout)
                }) => batch,
            };
            let batch = match polled {
                Ok(batch) => batch,
                Err(e @ Error::Transport(_)) => {
                    if !self.wait_out_outage(&mut stop, &e).await {
                        break;
                    }
                    continue;
                }
                Err(e) => return Err(e),
            };
            if batch.is_empty() {
                continue;
            }

            for consumed in batch {
                let offset = consumed.offset;
                self.handle(consumed).await?;
                next = offset + 1;
                self.progress.send_modify(|p| p.next_offset = next);
            }

            // A missed commit is retried with the next batch; replays cover
            // anything redelivered meanwhile.
            if let Err(e) = with_retry(&self.config.retry, "commit_offset", || {
                self.transport.commit_offset(&topic, &group, next)
            })
            .await
            {
                match e {
                    Error::Transport(_) => {
                        warn!(replica = %self.replica_id, offset = next, error = %e, "failed to commit applier offset");
                    }
                    other => return Err(other),
                }
            }
        }

        debug!(replica = %self.replica_id, "applier stopped");
        Ok(())
    }

    /// Backs off after the transport gave up. Returns `false` if `stop`
    /// tripped meanwhile.
    async fn wait_out_outage(&self, stop: &mut StopSignal, error: &Error) -> bool {
        let delay = self.config.retry.max_delay;
        warn!(
            replica = %self.replica_id,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "resolved log unavailable, waiting"
        );
        tokio::select! {
            _ = stop.stopped() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    async fn handle(&mut self, consumed: ConsumedRecord) -> Result<()> {
        let offset = consumed.offset;
        let envelope = match MessageEnvelope::decode(&consumed.record.key) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(replica = %self.replica_id, offset, error = %e, "skipping resolved message with malformed key");
                return Ok(());
            }
        };
        let Some(stamp) = envelope.sequencer.as_ref() else {
            warn!(replica = %self.replica_id, offset, "skipping unstamped message on resolved log");
            return Ok(());
        };
        let seq = stamp.seq;
        self.progress.send_modify(|p| {
            p.max_sequencer_seq = Some(p.max_sequencer_seq.map_or(seq, |m| m.max(seq)));
        });

        let key = envelope.pending_key();
        let own = envelope.origin == self.replica_id;
        self.resolved_origins.insert(key.clone());

        let Some(payload) = consumed.record.value else {
            warn!(
                replica = %self.replica_id,
                origin = %envelope.origin,
                origin_seq = %envelope.origin_seq,
                "transaction rejected by sequencer"
            );
            if own {
                self.pending.complete(
                    &key,
                    Err(Error::TransactionRejected {
                        origin_seq: envelope.origin_seq,
                    }),
                );
            }
            return Ok(());
        };

        let packet = match self
            .cipher
            .open(&payload, &envelope)
            .and_then(|bytes| decode_packet(&bytes))
        {
            Ok(packet) if !packet.transaction_id.is_none() => packet,
            Ok(_) => {
                warn!(replica = %self.replica_id, offset, "skipping resolved packet without transaction id");
                self.fail_own(own, &key, Error::MalformedPacket("missing transaction id".into()));
                return Ok(());
            }
            Err(e) => {
                warn!(replica = %self.replica_id, offset, error = %e, "skipping undecodable resolved packet");
                self.fail_own(own, &key, e);
                return Ok(());
            }
        };

        let txn = packet.transaction_id;
        let correlations = packet.correlation_map();

        if txn <= self.last_applied {
            warn!(replica = %self.replica_id, txn_id = %txn, last = %self.last_applied, "skipping replayed transaction");
            self.progress.send_modify(|p| p.replays += 1);
            // Still pending means this copy lost the race for its id and was
            // never applied.
            self.fail_own(
                own,
                &key,
                Error::TransactionRejected {
                    origin_seq: envelope.origin_seq,
                },
            );
            return Ok(());
        }

        let expected = self.last_applied.next();
        if txn != expected {
            error!(replica = %self.replica_id, expected = %expected, actual = %txn, "gap in resolved log");
            self.fail_own(own, &key, Error::OrderViolation { expected, actual: txn });
            return Err(Error::OrderViolation { expected, actual: txn });
        }

        if let Err(e) = self.writer.apply(packet).await {
            self.fail_own(own, &key, Error::StorageWrite(e.to_string()));
            return Err(e);
        }
        self.last_applied = txn;
        self.progress.send_modify(|p| p.last_transaction_id = txn);
        debug!(replica = %self.replica_id, txn_id = %txn, origin = %envelope.origin, "transaction applied");

        if own {
            self.pending.complete(&key, Ok(correlations));
        }
        Ok(())
    }

    fn fail_own(&self, own: bool, key: &PendingKey, err: Error) {
        if own {
            self.pending.complete(key, Err(err));
        }
    }
}
