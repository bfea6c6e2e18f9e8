//! # Message Envelope
//!
//! The envelope is the key of every log record. It says what kind of message
//! the record holds, which replica submitted it and, once the sequencer has
//! handled it, which sequencer resolved it.
//!
//! ## Key Layout
//!
//! ```text
//! ┌──────┬────────────────────┬────────────┬──────┬───────────────────────┬───────────────┐
//! │ kind │ origin (len + utf8)│ origin seq │ flag │ sequencer (len + utf8)│ sequencer seq │
//! │  u8  │  u16 + bytes       │    u64     │  u8  │  u16 + bytes          │     u64       │
//! └──────┴────────────────────┴────────────┴──────┴───────────────────────┴───────────────┘
//!                                                  └──── present only when flag = 1 ────┘
//! ```
//!
//! Only `(kind, origin, origin seq)` identifies a pending operation; the
//! sequencer fields are stamped on the way through and never used for lookup.

use crate::codec::ByteReader;
use crate::error::{Error, Result};
use crate::types::{OriginSeq, ReplicaId, SequencerSeq};

/// What a log record carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// A transaction packet (or its error marker).
    Transaction,
}

impl MessageKind {
    fn tag(self) -> u8 {
        match self {
            MessageKind::Transaction => 1,
        }
    }

    fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            1 => Ok(MessageKind::Transaction),
            other => Err(Error::MalformedPacket(format!("unknown message kind {}", other))),
        }
    }
}

/// Sequencer identity stamped on a resolved message.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SequencerStamp {
    pub replica: ReplicaId,
    pub seq: SequencerSeq,
}

/// Identity of an outstanding submission, used by the pending-operation table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PendingKey {
    pub kind: MessageKind,
    pub origin: ReplicaId,
    pub origin_seq: OriginSeq,
}

/// Addressing metadata of a log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEnvelope {
    pub kind: MessageKind,
    pub origin: ReplicaId,
    pub origin_seq: OriginSeq,
    /// `None` on the unresolved log, `Some` on the resolved log.
    pub sequencer: Option<SequencerStamp>,
}

impl MessageEnvelope {
    /// Envelope for a fresh submission.
    pub fn unresolved(origin: ReplicaId, origin_seq: OriginSeq) -> Self {
        Self {
            kind: MessageKind::Transaction,
            origin,
            origin_seq,
            sequencer: None,
        }
    }

    /// Copy of this envelope stamped by a sequencer. Origin fields are kept.
    pub fn resolved_by(&self, sequencer: ReplicaId, seq: SequencerSeq) -> Self {
        Self {
            sequencer: Some(SequencerStamp {
                replica: sequencer,
                seq,
            }),
            ..self.clone()
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.sequencer.is_some()
    }

    pub fn pending_key(&self) -> PendingKey {
        PendingKey {
            kind: self.kind,
            origin: self.origin.clone(),
            origin_seq: self.origin_seq,
        }
    }

    /// Encodes the envelope as a log record key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedPacket`] if a replica id exceeds 65535 bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(32 + self.origin.as_str().len());
        buf.push(self.kind.tag());
        put_str(&mut buf, self.origin.as_str())?;
        buf.extend_from_slice(&self.origin_seq.as_raw().to_be_bytes());
        match &self.sequencer {
            None => buf.push(0),
            Some(stamp) => {
                buf.push(1);
                put_str(&mut buf, stamp.replica.as_str())?;
                buf.extend_from_slice(&stamp.seq.as_raw().to_be_bytes());
            }
        }
        Ok(buf)
    }

    /// Decodes an envelope from a log record key.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut r = ByteReader::new(bytes);
        let kind = MessageKind::from_tag(r.u8()?)?;
        let origin = ReplicaId::new(read_str(&mut r)?);
        let origin_seq = OriginSeq::from_raw(r.u64()?);
        let sequencer = match r.u8()? {
            0 => None,
            1 => {
                let replica = ReplicaId::new(read_str(&mut r)?);
                let seq = SequencerSeq::from_raw(r.u64()?);
                Some(SequencerStamp { replica, seq })
            }
            other => {
                return Err(Error::MalformedPacket(format!(
                    "invalid sequencer flag {}",
                    other
                )));
            }
        };
        r.finish()?;

        Ok(Self {
            kind,
            origin,
            origin_seq,
            sequencer,
        })
    }
}

fn put_str(buf: &mut Vec<u8>, s: &str) -> Result<()> {
    let len = u16::try_from(s.len())
        .map_err(|_| Error::MalformedPacket(format!("replica id too long ({} bytes)", s.len())))?;
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(s.as_bytes());
    Ok(())
}

fn read_str(r: &mut ByteReader<'_>) -> Result<String> {
    let raw = r.bytes_u16()?;
    String::from_utf8(raw.to_vec())
        .map_err(|e| Error::MalformedPacket(format!("invalid utf-8 replica id: {}", e)))
}
