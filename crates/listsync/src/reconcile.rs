/// Reconciliation of operations issued against a stale list version
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::{
    ChangeLog, Delta, Field, ItemId, Operation, OperationKind, Result, Stamp, SyncError, Version,
};

/// A field write that lost to an entry committed after the operation's base version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldConflict {
    pub item_id: ItemId,
    pub field: Field,

    /// Stamp of the dropped write
    pub incoming: Stamp,

    /// Stamp of the committed write that kept the field
    pub winner: Stamp,

    /// Version of the entry holding the winning write
    pub winner_version: Version,
}

/// Outcome of reconciling one operation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciled {
    pub dropped: Vec<FieldConflict>,
}

impl Reconciled {
    /// Fields the store must leave untouched
    pub fn suppressed(&self) -> BTreeSet<Field> {
        self.dropped.iter().map(|c| c.field).collect()
    }

    pub fn dropped_fields(&self) -> Vec<Field> {
        self.dropped.iter().map(|c| c.field).collect()
    }
}

/// Merges an incoming operation against the history it has not seen.
///
/// Scalar fields are last-writer-wins by [`Stamp`]. Deletes dominate: once an
/// entry in (base, head] deleted the target, updates and checks fail with
/// `StaleTarget` instead of resurrecting the item.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReconciliationEngine;

impl ReconciliationEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn reconcile(&self, op: &Operation, log: &ChangeLog) -> Result<Reconciled> {
        let head = log.head();
        if op.base_version > head {
            return Err(SyncError::InvalidOperation(format!(
                "base version {} is ahead of list version {}",
                op.base_version, head
            )));
        }

        let target = op.target();
        let incoming = op.stamp();

        // Newest committed stamp per field since the base version
        let mut winners: BTreeMap<Field, (Stamp, Version)> = BTreeMap::new();

        for entry in log.entries_since(op.base_version) {
            if entry.delta.target() != target {
                continue;
            }

            match (&entry.delta, &op.kind) {
                (Delta::Deleted { .. }, OperationKind::Delete { .. }) => {
                    return Err(SyncError::NotFound(target));
                }
                (Delta::Deleted { .. }, _) => {
                    return Err(SyncError::StaleTarget(target));
                }
                (Delta::Added { .. }, OperationKind::Add { .. }) => {
                    return Err(SyncError::DuplicateId(target));
                }
                _ => {}
            }

            let stamp = entry.delta.stamp();
            for field in entry.delta.fields() {
                let slot = winners.entry(field).or_insert((stamp, entry.version));
                if stamp > slot.0 {
                    *slot = (stamp, entry.version);
                }
            }
        }

        if let OperationKind::Add { .. } = op.kind {
            return Ok(Reconciled::default());
        }

        let dropped = op
            .kind
            .changes()
            .iter()
            .filter_map(|change| {
                let field = change.field();
                winners
                    .get(&field)
                    .filter(|(winner, _)| *winner >= incoming)
                    .map(|(winner, version)| FieldConflict {
                        item_id: target,
                        field,
                        incoming,
                        winner: *winner,
                        winner_version: *version,
                    })
            })
            .collect();

        Ok(Reconciled { dropped })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ChangeLogEntry, ClientId, FieldChange, ItemDraft, ItemStore, LamportClock, ListId, UserId,
    };

    struct Harness {
        list: ListId,
        store: ItemStore,
        log: ChangeLog,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                list: ListId::new(),
                store: ItemStore::new(),
                log: ChangeLog::new(),
            }
        }

        fn op(&self, client: ClientId, clock: u64, base: Version, kind: OperationKind) -> Operation {
            Operation::new(self.list, client, clock, base, LamportClock(clock), kind)
        }

        fn commit(&mut self, op: Operation) -> Result<Reconciled> {
            let reconciled = ReconciliationEngine::new().reconcile(&op, &self.log)?;
            let author = UserId::new();
            let delta = self.store.check(&op, author, &reconciled.suppressed())?;
            self.store.apply_delta(&delta)?;
            self.log.append(ChangeLogEntry {
                version: self.log.next_version(),
                timestamp: op.clock,
                author,
                operation: op,
                delta,
                committed_at: chrono::Utc::now(),
            })?;
            Ok(reconciled)
        }
    }

    #[test]
    fn test_delete_then_stale_update() {
        let mut h = Harness::new();
        let a = ClientId::new();
        let b = ClientId::new();
        let draft = ItemDraft::new("milk");
        let id = draft.id;

        h.commit(h.op(a, 1, 0, OperationKind::Add { item: draft })).unwrap();
        h.commit(h.op(a, 2, 1, OperationKind::Delete { item_id: id }))
            .unwrap();

        // B saw version 1 and edits the quantity offline
        let update = h.op(
            b,
            5,
            1,
            OperationKind::Update {
                item_id: id,
                changes: vec![FieldChange::Quantity(2)],
            },
        );
        assert_eq!(
            ReconciliationEngine::new().reconcile(&update, &h.log),
            Err(SyncError::StaleTarget(id))
        );

        let check = h.op(
            b,
            6,
            1,
            OperationKind::Check {
                item_id: id,
                checked: true,
            },
        );
        assert_eq!(
            ReconciliationEngine::new().reconcile(&check, &h.log),
            Err(SyncError::StaleTarget(id))
        );

        let delete = h.op(b, 7, 1, OperationKind::Delete { item_id: id });
        assert_eq!(
            ReconciliationEngine::new().reconcile(&delete, &h.log),
            Err(SyncError::NotFound(id))
        );
    }

    #[test]
    fn test_newer_committed_field_wins_other_fields_apply() {
        let mut h = Harness::new();
        let a = ClientId::new();
        let b = ClientId::new();
        let draft = ItemDraft::new("eggs");
        let id = draft.id;

        h.commit(h.op(a, 1, 0, OperationKind::Add { item: draft })).unwrap();
        h.commit(h.op(
            a,
            10,
            1,
            OperationKind::Update {
                item_id: id,
                changes: vec![FieldChange::Quantity(12)],
            },
        ))
        .unwrap();

        // B is behind and carries an older clock
        let reconciled = h
            .commit(h.op(
                b,
                4,
                1,
                OperationKind::Update {
                    item_id: id,
                    changes: vec![
                        FieldChange::Quantity(6),
                        FieldChange::Category(Some("dairy".to_string())),
                    ],
                },
            ))
            .unwrap();

        assert_eq!(reconciled.dropped_fields(), vec![Field::Quantity]);
        assert_eq!(reconciled.dropped[0].winner_version, 2);

        let item = h.store.get(&id).unwrap();
        assert_eq!(item.quantity, 12);
        assert_eq!(item.category.as_deref(), Some("dairy"));
        assert_eq!(h.log.head(), 3);
    }

    #[test]
    fn test_equal_clock_tie_breaks_on_client() {
        let mut h = Harness::new();
        let low = ClientId(uuid::Uuid::from_u128(1));
        let high = ClientId(uuid::Uuid::from_u128(2));
        let draft = ItemDraft::new("tea");
        let id = draft.id;

        h.commit(h.op(low, 1, 0, OperationKind::Add { item: draft })).unwrap();
        h.commit(h.op(
            high,
            5,
            1,
            OperationKind::Check {
                item_id: id,
                checked: true,
            },
        ))
        .unwrap();

        let reconciled = h
            .commit(h.op(
                low,
                5,
                1,
                OperationKind::Check {
                    item_id: id,
                    checked: false,
                },
            ))
            .unwrap();
        assert_eq!(reconciled.dropped_fields(), vec![Field::Checked]);
        assert!(h.store.get(&id).unwrap().checked);
    }

    #[test]
    fn test_concurrent_duplicate_add() {
        let mut h = Harness::new();
        let draft = ItemDraft::new("salt");
        h.commit(h.op(
            ClientId::new(),
            1,
            0,
            OperationKind::Add {
                item: draft.clone(),
            },
        ))
        .unwrap();

        let again = h.op(ClientId::new(), 1, 0, OperationKind::Add { item: draft.clone() });
        assert_eq!(
            ReconciliationEngine::new().reconcile(&again, &h.log),
            Err(SyncError::DuplicateId(draft.id))
        );
    }

    #[test]
    fn test_future_base_version_is_invalid() {
        let h = Harness::new();
        let op = h.op(ClientId::new(), 1, 3, OperationKind::Delete { item_id: ItemId::new() });
        assert!(matches!(
            ReconciliationEngine::new().reconcile(&op, &h.log),
            Err(SyncError::InvalidOperation(_))
        ));
    }

    #[test]
    fn test_current_base_has_nothing_to_replay() {
        let mut h = Harness::new();
        let draft = ItemDraft::new("oil");
        let id = draft.id;
        h.commit(h.op(ClientId::new(), 1, 0, OperationKind::Add { item: draft })).unwrap();

        let op = h.op(
            ClientId::new(),
            2,
            1,
            OperationKind::Update {
                item_id: id,
                changes: vec![FieldChange::Name("olive oil".to_string())],
            },
        );
        let reconciled = ReconciliationEngine::new().reconcile(&op, &h.log).unwrap();
        assert!(reconciled.dropped.is_empty());
    }
}
