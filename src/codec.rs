//! # Transaction Packet Encoding and Decoding
//!
//! Binary codec for [`TransactionPacket`]s. The same layout is used for
//! unresolved and resolved packets; only the ids differ.
//!
//! ## Packet Format
//!
//! All integers are big-endian.
//!
//! ```text
//! ┌─────────┬──────────┬─────────┬──────────────┬─────────────┐
//! │ version │ txn id   │ user id │ timestamp ms │ write count │
//! │   u8    │   u64    │   u32   │     u64      │     u32     │
//! └─────────┴──────────┴─────────┴──────────────┴─────────────┘
//! per write:
//! ┌───────┬──────┬───────────┬────────────────┬──────────────┐
//! │ table │ kind │ record id │ correlation id │ column count │
//! │  u32  │  u8  │    u32    │      u32       │     u16      │
//! └───────┴──────┴───────────┴────────────────┴──────────────┘
//! per column:
//! ┌───────────┬─────┬──────────────────────────────────────────┐
//! │ column id │ tag │ payload (fixed width or u32 length + data)│
//! │    u16    │ u8  │                                          │
//! └───────────┴─────┴──────────────────────────────────────────┘
//! ```
//!
//! Every process in a cluster must agree on [`CODEC_VERSION`] byte for byte.
//! Obfuscation of the encoded bytes lives in [`crate::crypto`].

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{Error, Result};
use crate::types::{
    ColumnId, ColumnValue, CorrelationId, MultiReferenceEdit, RecordId, RecordRef, RecordWrite,
    TableId, TransactionId, TransactionPacket, UserId, WriteKind,
};

// =============================================================================
// Constants
// =============================================================================

/// Wire format version written as the first byte of every packet.
pub const CODEC_VERSION: u8 = 1;

const KIND_CREATE: u8 = 1;
const KIND_UPDATE: u8 = 2;
const KIND_DELETE: u8 = 3;

const TAG_NULL: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_SHORT: u8 = 2;
const TAG_INT: u8 = 3;
const TAG_LONG: u8 = 4;
const TAG_FLOAT: u8 = 5;
const TAG_DOUBLE: u8 = 6;
const TAG_TEXT: u8 = 7;
const TAG_BINARY: u8 = 8;
const TAG_TIMESTAMP: u8 = 9;
const TAG_DATETIME: u8 = 10;
const TAG_REFERENCE: u8 = 11;
const TAG_MULTI_REFERENCE: u8 = 12;

const REF_KNOWN: u8 = 0;
const REF_PENDING: u8 = 1;

/// Smallest possible encoded write (no columns).
const MIN_WRITE_SIZE: usize = 4 + 1 + 4 + 4 + 2;

// =============================================================================
// Encoding
// =============================================================================

/// Encodes a packet into its wire representation.
///
/// Encoding is deterministic: equal packets produce equal bytes.
///
/// # Errors
///
/// [`Error::MalformedPacket`] if a count or length does not fit its field.
pub fn encode_packet(packet: &TransactionPacket) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(32 + packet.writes.len() * 32);
    buf.push(CODEC_VERSION);
    buf.extend_from_slice(&packet.transaction_id.as_raw().to_be_bytes());
    buf.extend_from_slice(&packet.user_id.as_raw().to_be_bytes());
    buf.extend_from_slice(&packet.timestamp_ms.to_be_bytes());
    buf.extend_from_slice(&len_u32(packet.writes.len(), "write count")?.to_be_bytes());

    for write in &packet.writes {
        encode_write(&mut buf, write)?;
    }
    Ok(buf)
}

fn len_u32(len: usize, what: &str) -> Result<u32> {
    u32::try_from(len).map_err(|_| Error::MalformedPacket(format!("{} {} exceeds u32", what, len)))
}

fn encode_write(buf: &mut Vec<u8>, write: &RecordWrite) -> Result<()> {
    buf.extend_from_slice(&write.table.as_raw().to_be_bytes());
    buf.push(match write.kind {
        WriteKind::Create => KIND_CREATE,
        WriteKind::Update => KIND_UPDATE,
        WriteKind::Delete => KIND_DELETE,
    });
    buf.extend_from_slice(&write.record_id.as_raw().to_be_bytes());
    buf.extend_from_slice(&write.correlation_id.as_raw().to_be_bytes());
    let columns = u16::try_from(write.values.len()).map_err(|_| {
        Error::MalformedPacket(format!(
            "write to table {} sets {} columns, more than a u16 count holds",
            write.table,
            write.values.len()
        ))
    })?;
    buf.extend_from_slice(&columns.to_be_bytes());

    for (column, value) in &write.values {
        buf.extend_from_slice(&column.as_raw().to_be_bytes());
        encode_value(buf, value)?;
    }
    Ok(())
}

/// Encodes one column value on its own (tag + payload).
pub(crate) fn encode_column_value(value: &ColumnValue) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    encode_value(&mut buf, value)?;
    Ok(buf)
}

/// Decodes a value produced by [`encode_column_value`].
pub(crate) fn decode_column_value(bytes: &[u8]) -> Result<ColumnValue> {
    let mut r = ByteReader::new(bytes);
    let value = decode_value(&mut r)?;
    r.finish()?;
    Ok(value)
}

fn encode_value(buf: &mut Vec<u8>, value: &ColumnValue) -> Result<()> {
    match value {
        ColumnValue::Null => buf.push(TAG_NULL),
        ColumnValue::Bool(v) => {
            buf.push(TAG_BOOL);
            buf.push(u8::from(*v));
        }
        ColumnValue::Short(v) => {
            buf.push(TAG_SHORT);
            buf.extend_from_slice(&v.to_be_bytes());
        }
        ColumnValue::Int(v) => {
            buf.push(TAG_INT);
            buf.extend_from_slice(&v.to_be_bytes());
        }
        ColumnValue::Long(v) => {
            buf.push(TAG_LONG);
            buf.extend_from_slice(&v.to_be_bytes());
        }
        ColumnValue::Float(v) => {
            buf.push(TAG_FLOAT);
            buf.extend_from_slice(&v.to_bits().to_be_bytes());
        }
        ColumnValue::Double(v) => {
            buf.push(TAG_DOUBLE);
            buf.extend_from_slice(&v.to_bits().to_be_bytes());
        }
        ColumnValue::Text(v) => {
            buf.push(TAG_TEXT);
            put_bytes(buf, v.as_bytes())?;
        }
        ColumnValue::Binary(v) => {
            buf.push(TAG_BINARY);
            put_bytes(buf, v)?;
        }
        ColumnValue::Timestamp(v) => {
            buf.push(TAG_TIMESTAMP);
            buf.extend_from_slice(&v.to_be_bytes());
        }
        ColumnValue::DateTime(v) => {
            buf.push(TAG_DATETIME);
            buf.extend_from_slice(&v.to_be_bytes());
        }
        ColumnValue::Reference(r) => {
            buf.push(TAG_REFERENCE);
            encode_ref(buf, r);
        }
        ColumnValue::MultiReference(edit) => {
            buf.push(TAG_MULTI_REFERENCE);
            buf.push(u8::from(edit.remove_all));
            for list in [&edit.set, &edit.add, &edit.remove] {
                buf.extend_from_slice(&len_u32(list.len(), "reference list length")?.to_be_bytes());
                for r in list {
                    encode_ref(buf, r);
                }
            }
        }
    }
    Ok(())
}

fn encode_ref(buf: &mut Vec<u8>, r: &RecordRef) {
    match r {
        RecordRef::Known(id) => {
            buf.push(REF_KNOWN);
            buf.extend_from_slice(&id.as_raw().to_be_bytes());
        }
        RecordRef::Pending(c) => {
            buf.push(REF_PENDING);
            buf.extend_from_slice(&c.as_raw().to_be_bytes());
        }
    }
}

fn put_bytes(buf: &mut Vec<u8>, data: &[u8]) -> Result<()> {
    buf.extend_from_slice(&len_u32(data.len(), "value length")?.to_be_bytes());
    buf.extend_from_slice(data);
    Ok(())
}

// =============================================================================
// Decoding
// =============================================================================

/// Decodes a packet from its wire representation.
///
/// # Errors
///
/// Returns [`Error::MalformedPacket`] if the version or any tag is unknown, a
/// length runs past the buffer, text is not UTF-8, or bytes trail the last
/// write.
pub fn decode_packet(bytes: &[u8]) -> Result<TransactionPacket> {
    let mut r = ByteReader::new(bytes);

    let version = r.u8()?;
    if version != CODEC_VERSION {
        return Err(Error::MalformedPacket(format!(
            "unsupported codec version {}",
            version
        )));
    }

    let transaction_id = TransactionId::from_raw(r.u64()?);
    let user_id = UserId::new(r.u32()?);
    let timestamp_ms = r.u64()?;
    let count = r.u32()? as usize;
    if count > r.remaining() / MIN_WRITE_SIZE {
        return Err(Error::MalformedPacket(format!(
            "write count {} exceeds remaining {} bytes",
            count,
            r.remaining()
        )));
    }

    let mut writes = Vec::with_capacity(count);
    for _ in 0..count {
        writes.push(decode_write(&mut r)?);
    }
    r.finish()?;

    Ok(TransactionPacket {
        transaction_id,
        user_id,
        timestamp_ms,
        writes,
    })
}

fn decode_write(r: &mut ByteReader<'_>) -> Result<RecordWrite> {
    let table = TableId::new(r.u32()?);
    let kind = match r.u8()? {
        KIND_CREATE => WriteKind::Create,
        KIND_UPDATE => WriteKind::Update,
        KIND_DELETE => WriteKind::Delete,
        other => {
            return Err(Error::MalformedPacket(format!("unknown write kind {}", other)));
        }
    };
    let record_id = RecordId::new(r.u32()?);
    let correlation_id = CorrelationId::new(r.u32()?);
    let columns = r.u16()?;

    let mut values = BTreeMap::new();
    for _ in 0..columns {
        let column = ColumnId::new(r.u16()?);
        values.insert(column, decode_value(r)?);
    }

    Ok(RecordWrite {
        table,
        kind,
        record_id,
        correlation_id,
        values,
    })
}

fn decode_value(r: &mut ByteReader<'_>) -> Result<ColumnValue> {
    let value = match r.u8()? {
        TAG_NULL => ColumnValue::Null,
        TAG_BOOL => ColumnValue::Bool(r.u8()? != 0),
        TAG_SHORT => ColumnValue::Short(r.u16()? as i16),
        TAG_INT => ColumnValue::Int(r.u32()? as i32),
        TAG_LONG => ColumnValue::Long(r.u64()? as i64),
        TAG_FLOAT => ColumnValue::Float(f32::from_bits(r.u32()?)),
        TAG_DOUBLE => ColumnValue::Double(f64::from_bits(r.u64()?)),
        TAG_TEXT => {
            let raw = r.bytes_u32()?;
            let text = std::str::from_utf8(raw)
                .map_err(|e| Error::MalformedPacket(format!("invalid utf-8 text: {}", e)))?;
            ColumnValue::Text(text.to_string())
        }
        TAG_BINARY => ColumnValue::Binary(r.bytes_u32()?.to_vec()),
        TAG_TIMESTAMP => ColumnValue::Timestamp(r.u32()? as i32),
        TAG_DATETIME => ColumnValue::DateTime(r.u64()? as i64),
        TAG_REFERENCE => ColumnValue::Reference(decode_ref(r)?),
        TAG_MULTI_REFERENCE => {
            let remove_all = r.u8()? != 0;
            let set = decode_ref_list(r)?;
            let add = decode_ref_list(r)?;
            let remove = decode_ref_list(r)?;
            ColumnValue::MultiReference(MultiReferenceEdit {
                remove_all,
                set,
                add,
                remove,
            })
        }
        other => {
            return Err(Error::MalformedPacket(format!("unknown value tag {}", other)));
        }
    };
    Ok(value)
}

fn decode_ref(r: &mut ByteReader<'_>) -> Result<RecordRef> {
    match r.u8()? {
        REF_KNOWN => Ok(RecordRef::Known(RecordId::new(r.u32()?))),
        REF_PENDING => Ok(RecordRef::Pending(CorrelationId::new(r.u32()?))),
        other => Err(Error::MalformedPacket(format!("unknown reference tag {}", other))),
    }
}

fn decode_ref_list(r: &mut ByteReader<'_>) -> Result<Vec<RecordRef>> {
    let count = r.u32()? as usize;
    // Each reference is five bytes.
    if count > r.remaining() / 5 {
        return Err(Error::MalformedPacket(format!(
            "reference count {} exceeds remaining {} bytes",
            count,
            r.remaining()
        )));
    }
    (0..count).map(|_| decode_ref(r)).collect()
}

// =============================================================================
// Byte Reader
// =============================================================================

/// Bounds-checked big-endian cursor shared by the packet and envelope codecs.
pub(crate) struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub(crate) fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if len > self.remaining() {
            return Err(Error::MalformedPacket(format!(
                "need {} bytes at offset {}, only {} left",
                len,
                self.pos,
                self.remaining()
            )));
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub(crate) fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.array()?))
    }

    pub(crate) fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    pub(crate) fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.array()?))
    }

    pub(crate) fn bytes_u32(&mut self) -> Result<&'a [u8]> {
        let len = self.u32()? as usize;
        self.take(len)
    }

    pub(crate) fn bytes_u16(&mut self) -> Result<&'a [u8]> {
        let len = self.u16()? as usize;
        self.take(len)
    }

    /// Fails if any bytes were left unread.
    pub(crate) fn finish(&self) -> Result<()> {
        if self.remaining() != 0 {
            return Err(Error::MalformedPacket(format!(
                "{} trailing bytes",
                self.remaining()
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Clock Helpers
// =============================================================================

/// Returns the current time in milliseconds since Unix epoch.
pub fn current_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Returns the current time in microseconds since Unix epoch.
///
/// Used to seed per-process sequences so a restart lands above any value the
/// previous incarnation could have minted.
pub fn current_time_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

// =============================================================================
// Tests
// =============================================================================
