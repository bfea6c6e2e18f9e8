//! # Sequencer
//!
//! The leader role. While this process holds the election lock, the
//! sequencer turns the unresolved log into the resolved log, one message at
//! a time:
//!
//! ```text
//!  <prefix>-unresolved ──► open ──► resolve (rehearsal) ──┬─ ok ──► publish resolved ──► wait for local apply
//!                                                          └─ err ─► publish error marker
//!                                              then commit the unresolved offset past the message
//! ```
//!
//! ## Taking Over
//!
//! A new leader first waits for its own applier to reach the end of the
//! resolved log as it stood at takeover, so its local state includes every
//! transaction any predecessor published. It then resumes the unresolved
//! log from the shared `sequencer` group's committed offset.
//!
//! ## Stepping Down
//!
//! The stop signal is checked before every publish attempt, retries
//! included, and cuts retry backoff short. Once it trips the loop exits with
//! [`Error::LeadershipLost`], which [`Sequencer::run`] reports as a clean
//! stop.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::applier::{wait_for_progress, ApplierProgress};
use crate::codec::{current_time_micros, decode_packet, encode_packet};
use crate::config::ClusterConfig;
use crate::crypto::PacketCipher;
use crate::envelope::MessageEnvelope;
use crate::error::{Error, Result};
use crate::pending::ResolvedOrigins;
use crate::signal::StopSignal;
use crate::transport::{
    with_retry, with_retry_until, ConsumedRecord, LogRecord, LogTransport, Topics, SEQUENCER_GROUP,
};
use crate::types::{ReplicaId, SequencerSeq, TransactionId};
use crate::writer::StorageWriterHandle;

pub(crate) struct Sequencer {
    sequencer_id: ReplicaId,
    fencing_token: u64,
    topics: Topics,
    config: ClusterConfig,
    transport: Arc<dyn LogTransport>,
    cipher: PacketCipher,
    writer: StorageWriterHandle,
    resolved_origins: Arc<ResolvedOrigins>,
    applier: watch::Receiver<ApplierProgress>,
    next_seq: SequencerSeq,
}

impl Sequencer {
    pub(crate) fn new(
        config: ClusterConfig,
        fencing_token: u64,
        transport: Arc<dyn LogTransport>,
        cipher: PacketCipher,
        writer: StorageWriterHandle,
        resolved_origins: Arc<ResolvedOrigins>,
        applier: watch::Receiver<ApplierProgress>,
    ) -> Self {
        Self {
            sequencer_id: config.sequencer_id.clone(),
            fencing_token,
            topics: Topics::new(&config.topic_prefix),
            config,
            transport,
            cipher,
            writer,
            resolved_origins,
            applier,
            next_seq: SequencerSeq::from_raw(0),
        }
    }

    /// Sequences until leadership is lost (`Ok`) or an unrecoverable error.
    pub(crate) async fn run(mut self, stop: StopSignal) -> Result<()> {
        match self.lead(&stop).await {
            Err(Error::LeadershipLost) => {
                info!(sequencer = %self.sequencer_id, fencing_token = self.fencing_token, "sequencer stopped");
                Ok(())
            }
            other => other,
        }
    }

    async fn lead(&mut self, stop: &StopSignal) -> Result<()> {
        self.catch_up(stop).await?;

        let transport = &self.transport;
        let topic = self.topics.unresolved.clone();
        let mut offset = with_retry(&self.config.retry, "committed_offset", || {
            transport.committed_offset(&topic, SEQUENCER_GROUP)
        })
        .await?;
        info!(
            sequencer = %self.sequencer_id,
            fencing_token = self.fencing_token,
            offset,
            seq = %self.next_seq,
            "sequencer started"
        );

        let mut stopped = stop.clone();
        loop {
            self.ensure_leader(stop)?;
            let batch = tokio::select! {
                _ = stopped.stopped() => return Err(Error::LeadershipLost),
                batch = with_retry(&self.config.retry, "poll", || {
                    self.transport.poll(&topic, offset, self.config.poll_batch_max, self.config.poll_timeout)
                }) => batch?,
            };

            for consumed in batch {
                let next = consumed.offset + 1;
                self.handle_message(consumed, stop).await?;
                offset = next;
                with_retry(&self.config.retry, "commit_offset", || {
                    self.transport.commit_offset(&topic, SEQUENCER_GROUP, offset)
                })
                .await?;
            }
        }
    }

    /// Waits until the local applier has consumed the resolved log up to
    /// its current end, then seeds the sequencer sequence above anything
    /// already published.
    async fn catch_up(&mut self, stop: &StopSignal) -> Result<()> {
        let transport = &self.transport;
        let topic = self.topics.resolved.as_str();
        let end = with_retry(&self.config.retry, "end_offset", || transport.end_offset(topic)).await?;
        debug!(sequencer = %self.sequencer_id, end, "catching up with resolved log");

        let mut applier = self.applier.clone();
        let mut stopped = stop.clone();
        let progress = tokio::select! {
            _ = stopped.stopped() => return Err(Error::LeadershipLost),
            progress = wait_for_progress(&mut applier, |p| p.next_offset >= end) => progress?,
        };

        let floor = progress
            .max_sequencer_seq
            .map(|seq| seq.next().as_raw())
            .unwrap_or(0);
        self.next_seq = SequencerSeq::from_raw(current_time_micros().max(floor));
        Ok(())
    }

    async fn handle_message(&mut self, consumed: ConsumedRecord, stop: &StopSignal) -> Result<()> {
        let offset = consumed.offset;
        let envelope = match MessageEnvelope::decode(&consumed.record.key) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(offset, error = %e, "dropping unresolved message with malformed key");
                return Ok(());
            }
        };
        if envelope.is_resolved() {
            warn!(offset, origin = %envelope.origin, "dropping already-stamped message on unresolved log");
            return Ok(());
        }
        if self.resolved_origins.contains(&envelope.pending_key()) {
            debug!(offset, origin = %envelope.origin, origin_seq = %envelope.origin_seq, "dropping duplicate submission");
            return Ok(());
        }
        let Some(payload) = consumed.record.value else {
            warn!(offset, origin = %envelope.origin, "dropping unresolved message without payload");
            return Ok(());
        };
        let packet = match self
            .cipher
            .open(&payload, &envelope)
            .and_then(|bytes| decode_packet(&bytes))
        {
            Ok(packet) => packet,
            Err(e) => {
                warn!(offset, origin = %envelope.origin, origin_seq = %envelope.origin_seq, error = %e, "dropping malformed submission");
                return Ok(());
            }
        };

        let outgoing = envelope.resolved_by(self.sequencer_id.clone(), self.next_seq);
        self.next_seq = self.next_seq.next();

        match self.writer.resolve(packet).await {
            Ok(resolved) => {
                let txn = resolved.packet.transaction_id;
                let sealed = self.cipher.seal(&encode_packet(&resolved.packet)?, &outgoing)?;
                self.publish(&outgoing, Some(sealed), stop).await?;
                debug!(txn_id = %txn, origin = %outgoing.origin, origin_seq = %outgoing.origin_seq, "transaction sequenced");
                self.await_applied(txn, stop).await
            }
            Err(e) if e.is_packet_rejection() => {
                warn!(origin = %outgoing.origin, origin_seq = %outgoing.origin_seq, error = %e, "rejecting transaction");
                self.publish(&outgoing, None, stop).await
            }
            Err(e) => Err(e),
        }
    }

    async fn publish(&self, envelope: &MessageEnvelope, value: Option<Vec<u8>>, stop: &StopSignal) -> Result<()> {
        let record = LogRecord {
            key: envelope.encode()?,
            value,
        };
        let transport = &self.transport;
        let topic = self.topics.resolved.as_str();
        with_retry_until(&self.config.retry, "publish", stop, || transport.publish(topic, record.clone()))
            .await?
            .map(|_| ())
            .ok_or(Error::LeadershipLost)
    }

    /// Blocks until the local applier has applied `txn`, so the next
    /// resolution sees its effects.
    async fn await_applied(&self, txn: TransactionId, stop: &StopSignal) -> Result<()> {
        let mut applier = self.applier.clone();
        let mut stopped = stop.clone();
        tokio::select! {
            _ = stopped.stopped() => Err(Error::LeadershipLost),
            progress = wait_for_progress(&mut applier, |p| p.last_transaction_id >= txn) => progress.map(|_| ()),
        }
    }

    fn ensure_leader(&self, stop: &StopSignal) -> Result<()> {
        if stop.is_stopped() {
            Err(Error::LeadershipLost)
        } else {
            Ok(())
        }
    }
}

