//! # Transaction Resolver
//!
//! Turns an unresolved packet into a resolved one: assigns the global
//! transaction id, numbers new records, rewrites correlation references to
//! record ids and runs every write against storage.
//!
//! ## Two Entry Points, One Execution Path
//!
//! ```text
//! resolve()  (sequencer)                  apply()  (every replica)
//!   begin                                   begin
//!   txn = last + 1                          │
//!   pass 1: assign ids, map correlations    │
//!   pass 2: rewrite Pending -> Known        │
//!   execute_writes ◄────── shared ─────────► execute_writes
//!   rollback (rehearsal only)               commit(txn)
//! ```
//!
//! The sequencer never commits locally. Its own replica commits the packet
//! when the resolved message comes back through the applier, which keeps a
//! single apply path for every replica.

use crate::error::{Error, Result};
use crate::storage::Storage;
use crate::types::{CorrelationMap, RecordRef, TransactionPacket, WriteKind};

/// A packet with every id final, plus the ids the origin replica asked for.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedTransaction {
    pub packet: TransactionPacket,
    pub correlations: CorrelationMap,
}

/// Resolves `packet` against the current local state without committing.
///
/// The transaction id is always `last_committed + 1`, so a rejected packet
/// never consumes an id.
///
/// # Errors
///
/// - [`Error::MalformedPacket`] if two creates share a correlation id
/// - [`Error::UnresolvedCorrelation`] if a reference names no create
/// - [`Error::StorageWrite`] if any write fails
pub fn resolve<S: Storage + ?Sized>(
    storage: &mut S,
    packet: TransactionPacket,
) -> Result<ResolvedTransaction> {
    packet.validate()?;

    storage.begin()?;
    let outcome = resolve_in_scope(storage, packet);
    storage.rollback()?;
    outcome
}

fn resolve_in_scope<S: Storage + ?Sized>(
    storage: &mut S,
    mut packet: TransactionPacket,
) -> Result<ResolvedTransaction> {
    packet.transaction_id = storage.last_committed_transaction_id()?.next();

    // Pass 1: number new records, map correlations.
    let mut correlations = CorrelationMap::new();
    for write in packet.writes.iter_mut() {
        if write.needs_record_id() {
            write.record_id = storage.assign_record_id(write.table).map_err(into_storage_write)?;
        }
        if write.kind == WriteKind::Create {
            if write.correlation_id.as_raw() != 0 {
                correlations.insert(write.correlation_id, write.record_id);
            }
        } else if write.record_id.is_unassigned() {
            write.record_id = *correlations.get(&write.correlation_id).ok_or(
                Error::UnresolvedCorrelation {
                    correlation_id: write.correlation_id,
                },
            )?;
        }
    }

    // Pass 2: rewrite references.
    for write in packet.writes.iter_mut() {
        for value in write.values.values_mut() {
            for r in value.refs_mut() {
                if let RecordRef::Pending(c) = *r {
                    let id = correlations
                        .get(&c)
                        .ok_or(Error::UnresolvedCorrelation { correlation_id: c })?;
                    *r = RecordRef::Known(*id);
                }
            }
        }
    }

    execute_writes(storage, &packet)?;

    Ok(ResolvedTransaction {
        packet,
        correlations,
    })
}

/// Applies a resolved packet and commits it as the next transaction.
///
/// # Errors
///
/// - [`Error::StorageWrite`] if the packet still has unassigned ids or any
///   write fails; nothing is committed
/// - [`Error::OrderViolation`] if the packet is not `last + 1`
pub fn apply<S: Storage + ?Sized>(storage: &mut S, packet: &TransactionPacket) -> Result<()> {
    if !packet.is_resolved() {
        return Err(Error::StorageWrite(format!(
            "transaction {} is not fully resolved",
            packet.transaction_id
        )));
    }

    storage.begin()?;
    let outcome = execute_writes(storage, packet).and_then(|_| storage.commit(packet.transaction_id));
    if outcome.is_err() {
        storage.rollback()?;
    }
    outcome
}

/// Runs every write in packet order; the first failure aborts the rest.
fn execute_writes<S: Storage + ?Sized>(storage: &mut S, packet: &TransactionPacket) -> Result<()> {
    for write in &packet.writes {
        storage
            .apply_write(packet.transaction_id, packet.user_id, write)
            .map_err(into_storage_write)?;
    }
    Ok(())
}

fn into_storage_write(err: Error) -> Error {
    match err {
        Error::Sqlite(e) => Error::StorageWrite(e.to_string()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SqliteStorage;
    use crate::types::{
        ColumnId, ColumnValue, CorrelationId, MultiReferenceEdit, RecordId, RecordWrite, TableId,
        TransactionId, UserId,
    };

    const T: TableId = TableId::new(1);

    fn storage() -> SqliteStorage {
        SqliteStorage::open_in_memory().unwrap()
    }

    fn resolve_and_apply(s: &mut SqliteStorage, packet: TransactionPacket) -> ResolvedTransaction {
        let resolved = resolve(s, packet).unwrap();
        apply(s, &resolved.packet).unwrap();
        resolved
    }

    #[test]
    fn test_reference_resolves_to_created_id() {
        let mut s = storage();
        let c = CorrelationId::new(7);
        let packet = TransactionPacket::new(
            UserId::new(1),
            vec![
                RecordWrite::create(T, c),
                RecordWrite::create(T, CorrelationId::new(8))
                    .with_value(ColumnId::new(1), ColumnValue::Reference(RecordRef::Pending(c))),
            ],
        );

        let resolved = resolve(&mut s, packet).unwrap();
        assert_eq!(resolved.packet.transaction_id, TransactionId::from_raw(1));
        assert_eq!(
            resolved.packet.writes[1].values[&ColumnId::new(1)],
            ColumnValue::Reference(RecordRef::Known(resolved.correlations[&c]))
        );
        assert!(resolved.packet.is_resolved());
    }

    #[test]
    fn test_resolve_is_a_rehearsal() {
        let mut s = storage();
        let packet = TransactionPacket::new(UserId::new(1), vec![RecordWrite::create(T, CorrelationId::new(1))]);

        let first = resolve(&mut s, packet.clone()).unwrap();
        let second = resolve(&mut s, packet).unwrap();

        assert_eq!(s.last_committed_transaction_id().unwrap(), TransactionId::NONE);
        assert_eq!(first.packet.transaction_id, second.packet.transaction_id);
        assert_eq!(first.correlations, second.correlations);
        assert!(s.read_record(T, first.packet.writes[0].record_id).unwrap().is_none());
    }

    #[test]
    fn test_apply_commits_resolved_ids() {
        let mut s = storage();
        let c = CorrelationId::new(3);
        let packet = TransactionPacket::new(
            UserId::new(4),
            vec![
                RecordWrite::create(T, c),
                RecordWrite::update_pending(T, c).with_value(ColumnId::new(2), ColumnValue::Long(5)),
            ],
        );

        let resolved = resolve_and_apply(&mut s, packet);
        let id = resolved.correlations[&c];
        assert_eq!(resolved.packet.writes[1].record_id, id);

        let rec = s.read_record(T, id).unwrap().unwrap();
        assert_eq!(rec.values[&ColumnId::new(2)], ColumnValue::Long(5));
        assert_eq!(s.last_committed_transaction_id().unwrap(), TransactionId::from_raw(1));

        // The next resolution sees the committed state.
        let next = resolve(&mut s, TransactionPacket::new(UserId::new(4), vec![RecordWrite::create(T, c)])).unwrap();
        assert_eq!(next.packet.transaction_id, TransactionId::from_raw(2));
        assert_eq!(next.correlations[&c], RecordId::new(id.as_raw() + 1));
    }

    #[test]
    fn test_multi_reference_pending_rewritten() {
        let mut s = storage();
        let a = CorrelationId::new(1);
        let b = CorrelationId::new(2);
        let packet = TransactionPacket::new(
            UserId::new(1),
            vec![
                RecordWrite::create(T, a),
                RecordWrite::create(T, b).with_value(
                    ColumnId::new(9),
                    ColumnValue::MultiReference(MultiReferenceEdit::set(vec![RecordRef::Pending(a)])),
                ),
            ],
        );

        let resolved = resolve_and_apply(&mut s, packet);
        let rec = s.read_record(T, resolved.correlations[&b]).unwrap().unwrap();
        assert_eq!(rec.references[&ColumnId::new(9)], vec![resolved.correlations[&a]]);
    }

    #[test]
    fn test_unresolved_correlation_rejected() {
        let mut s = storage();
        let packet = TransactionPacket::new(
            UserId::new(1),
            vec![RecordWrite::update_pending(T, CorrelationId::new(44))],
        );
        assert!(matches!(
            resolve(&mut s, packet),
            Err(Error::UnresolvedCorrelation { .. })
        ));
    }

    #[test]
    fn test_storage_failure_aborts_whole_packet() {
        let mut s = storage();
        let packet = TransactionPacket::new(
            UserId::new(1),
            vec![
                RecordWrite::create(T, CorrelationId::new(1)),
                RecordWrite::update(T, RecordId::new(500)),
            ],
        );
        assert!(matches!(resolve(&mut s, packet), Err(Error::StorageWrite(_))));
        assert!(s.read_record(T, RecordId::new(1)).unwrap().is_none());
        assert_eq!(s.last_committed_transaction_id().unwrap(), TransactionId::NONE);
    }

    #[test]
    fn test_apply_rejects_unresolved_packet() {
        let mut s = storage();
        let mut packet = TransactionPacket::new(UserId::new(1), vec![RecordWrite::create(T, CorrelationId::new(1))]);
        packet.transaction_id = TransactionId::from_raw(1);
        assert!(matches!(apply(&mut s, &packet), Err(Error::StorageWrite(_))));
    }

    #[test]
    fn test_apply_out_of_order_rolls_back() {
        let mut s = storage();
        let mut packet = TransactionPacket::new(
            UserId::new(1),
            vec![RecordWrite::create_with_id(T, RecordId::new(3), CorrelationId::new(1))],
        );
        packet.transaction_id = TransactionId::from_raw(2);

        assert!(matches!(apply(&mut s, &packet), Err(Error::OrderViolation { .. })));
        assert!(s.read_record(T, RecordId::new(3)).unwrap().is_none());
    }
}
