/// Authoritative item state of one list
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::{
    ChangeLogEntry, Delta, Field, Item, ItemId, Operation, OperationKind, Result, Stamp,
    SyncError, UserId,
};

/// Record kept for a deleted item so its id is never reused
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tombstone {
    pub item_id: ItemId,

    /// User whose delete committed
    pub deleted_by: UserId,

    /// Stamp of the deleting operation
    pub stamp: Stamp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
enum Slot {
    Live(Item),
    Deleted(Tombstone),
}

/// Items of a list keyed by id, tombstones included
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemStore {
    slots: BTreeMap<ItemId, Slot>,
}

impl ItemStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a store by applying committed entries in order
    pub fn replay<'a>(entries: impl IntoIterator<Item = &'a ChangeLogEntry>) -> Result<Self> {
        let mut store = Self::new();
        for entry in entries {
            store.apply_delta(&entry.delta)?;
        }
        Ok(store)
    }

    /// Rebuild a store from a snapshot's live items and tombstones
    pub fn from_parts(items: Vec<Item>, tombstones: Vec<Tombstone>) -> Self {
        let mut slots = BTreeMap::new();
        for item in items {
            slots.insert(item.id, Slot::Live(item));
        }
        for tombstone in tombstones {
            slots.insert(tombstone.item_id, Slot::Deleted(tombstone));
        }
        Self { slots }
    }

    /// Validate and apply an operation, returning the effective change
    pub fn apply(&mut self, op: &Operation, author: UserId) -> Result<Delta> {
        let delta = self.check(op, author, &BTreeSet::new())?;
        self.apply_delta(&delta)?;
        Ok(delta)
    }

    /// Compute the delta `op` would produce without mutating the store.
    /// Fields in `suppressed` lost reconciliation and are left out.
    pub fn check(
        &self,
        op: &Operation,
        author: UserId,
        suppressed: &BTreeSet<Field>,
    ) -> Result<Delta> {
        let stamp = op.stamp();

        match &op.kind {
            OperationKind::Add { item } => match self.slots.get(&item.id) {
                Some(Slot::Live(_)) => Err(SyncError::DuplicateId(item.id)),
                Some(Slot::Deleted(_)) => Err(SyncError::StaleTarget(item.id)),
                None => Ok(Delta::Added {
                    item: Item::from_draft(item, author, stamp),
                }),
            },

            OperationKind::Update { item_id, .. } | OperationKind::Check { item_id, .. } => {
                let item = self.live(item_id)?;
                let changes = op
                    .kind
                    .changes()
                    .into_iter()
                    .filter(|change| !suppressed.contains(&change.field()))
                    .filter(|change| item.accepts(change.field(), stamp))
                    .collect();

                Ok(Delta::Updated {
                    item_id: *item_id,
                    changes,
                    stamp,
                    author,
                })
            }

            OperationKind::Delete { item_id } => match self.slots.get(item_id) {
                // Deletes dominate: no stamp comparison against earlier updates
                Some(Slot::Live(_)) => Ok(Delta::Deleted {
                    item_id: *item_id,
                    stamp,
                    author,
                }),
                Some(Slot::Deleted(_)) | None => Err(SyncError::NotFound(*item_id)),
            },
        }
    }

    /// Apply an already-effective delta (commit or log replay)
    pub fn apply_delta(&mut self, delta: &Delta) -> Result<()> {
        match delta {
            Delta::Added { item } => {
                if self.slots.contains_key(&item.id) {
                    return Err(SyncError::CorruptLog(format!(
                        "item {} added twice",
                        item.id
                    )));
                }
                self.slots.insert(item.id, Slot::Live(item.clone()));
            }

            Delta::Updated {
                item_id,
                changes,
                stamp,
                author,
            } => {
                let Some(Slot::Live(item)) = self.slots.get_mut(item_id) else {
                    return Err(SyncError::CorruptLog(format!(
                        "update of missing item {}",
                        item_id
                    )));
                };
                for change in changes {
                    item.write(change, *stamp, *author);
                }
            }

            Delta::Deleted {
                item_id,
                stamp,
                author,
            } => {
                if !matches!(self.slots.get(item_id), Some(Slot::Live(_))) {
                    return Err(SyncError::CorruptLog(format!(
                        "delete of missing item {}",
                        item_id
                    )));
                }
                self.slots.insert(
                    *item_id,
                    Slot::Deleted(Tombstone {
                        item_id: *item_id,
                        deleted_by: *author,
                        stamp: *stamp,
                    }),
                );
            }
        }
        Ok(())
    }

    fn live(&self, item_id: &ItemId) -> Result<&Item> {
        match self.slots.get(item_id) {
            Some(Slot::Live(item)) => Ok(item),
            Some(Slot::Deleted(_)) => Err(SyncError::StaleTarget(*item_id)),
            None => Err(SyncError::NotFound(*item_id)),
        }
    }

    /// Get a live item by id
    pub fn get(&self, item_id: &ItemId) -> Option<&Item> {
        match self.slots.get(item_id) {
            Some(Slot::Live(item)) => Some(item),
            _ => None,
        }
    }

    /// Whether the id was ever deleted
    pub fn is_tombstoned(&self, item_id: &ItemId) -> bool {
        matches!(self.slots.get(item_id), Some(Slot::Deleted(_)))
    }

    /// Live items in creation order
    pub fn items(&self) -> Vec<&Item> {
        let mut items: Vec<&Item> = self
            .slots
            .values()
            .filter_map(|slot| match slot {
                Slot::Live(item) => Some(item),
                Slot::Deleted(_) => None,
            })
            .collect();
        items.sort_by_key(|item| (item.created, item.id));
        items
    }

    /// All tombstones, ordered by item id
    pub fn tombstones(&self) -> Vec<&Tombstone> {
        self.slots
            .values()
            .filter_map(|slot| match slot {
                Slot::Deleted(tombstone) => Some(tombstone),
                Slot::Live(_) => None,
            })
            .collect()
    }

    /// Number of live items
    pub fn len(&self) -> usize {
        self.slots
            .values()
            .filter(|slot| matches!(slot, Slot::Live(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ClientId, FieldChange, ItemDraft, LamportClock, ListId};

    struct Fixture {
        list: ListId,
        client: ClientId,
        author: UserId,
        clock: u64,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                list: ListId::new(),
                client: ClientId::new(),
                author: UserId::new(),
                clock: 0,
            }
        }

        fn op(&mut self, kind: OperationKind) -> Operation {
            self.clock += 1;
            Operation::new(
                self.list,
                self.client,
                self.clock,
                0,
                LamportClock(self.clock),
                kind,
            )
        }
    }

    #[test]
    fn test_add_then_duplicate() {
        let mut fx = Fixture::new();
        let mut store = ItemStore::new();
        let draft = ItemDraft::new("milk");

        let add = fx.op(OperationKind::Add {
            item: draft.clone(),
        });
        let delta = store.apply(&add, fx.author).unwrap();
        assert!(matches!(delta, Delta::Added { .. }));
        assert_eq!(store.len(), 1);

        let again = fx.op(OperationKind::Add { item: draft.clone() });
        assert_eq!(
            store.apply(&again, fx.author),
            Err(SyncError::DuplicateId(draft.id))
        );
    }

    #[test]
    fn test_missing_and_tombstoned_targets() {
        let mut fx = Fixture::new();
        let mut store = ItemStore::new();
        let draft = ItemDraft::new("bread");
        let id = draft.id;

        let missing = fx.op(OperationKind::Check {
            item_id: id,
            checked: true,
        });
        assert_eq!(store.apply(&missing, fx.author), Err(SyncError::NotFound(id)));

        store
            .apply(&fx.op(OperationKind::Add { item: draft.clone() }), fx.author)
            .unwrap();
        store
            .apply(&fx.op(OperationKind::Delete { item_id: id }), fx.author)
            .unwrap();
        assert!(store.is_tombstoned(&id));
        assert!(store.get(&id).is_none());

        let update = fx.op(OperationKind::Update {
            item_id: id,
            changes: vec![FieldChange::Quantity(2)],
        });
        assert_eq!(store.apply(&update, fx.author), Err(SyncError::StaleTarget(id)));

        let delete = fx.op(OperationKind::Delete { item_id: id });
        assert_eq!(store.apply(&delete, fx.author), Err(SyncError::NotFound(id)));

        // Ids are never recycled
        let readd = fx.op(OperationKind::Add { item: draft });
        assert_eq!(store.apply(&readd, fx.author), Err(SyncError::StaleTarget(id)));
    }

    #[test]
    fn test_stale_field_writes_are_dropped_from_delta() {
        let mut fx = Fixture::new();
        let mut store = ItemStore::new();
        let draft = ItemDraft::new("apples").with_quantity(3);
        let id = draft.id;

        fx.clock = 10;
        store
            .apply(&fx.op(OperationKind::Add { item: draft }), fx.author)
            .unwrap();

        // Issued with an older clock than the add
        let old = Operation::new(
            fx.list,
            fx.client,
            99,
            0,
            LamportClock(3),
            OperationKind::Update {
                item_id: id,
                changes: vec![FieldChange::Quantity(7)],
            },
        );
        let delta = store.apply(&old, fx.author).unwrap();
        match delta {
            Delta::Updated { changes, .. } => assert!(changes.is_empty()),
            other => panic!("unexpected delta {:?}", other),
        }
        assert_eq!(store.get(&id).unwrap().quantity, 3);
    }

    #[test]
    fn test_suppressed_fields_are_skipped() {
        let mut fx = Fixture::new();
        let mut store = ItemStore::new();
        let draft = ItemDraft::new("rice");
        let id = draft.id;
        store
            .apply(&fx.op(OperationKind::Add { item: draft }), fx.author)
            .unwrap();

        let update = fx.op(OperationKind::Update {
            item_id: id,
            changes: vec![
                FieldChange::Quantity(2),
                FieldChange::Unit(Some("kg".to_string())),
            ],
        });
        let suppressed: BTreeSet<Field> = [Field::Quantity].into_iter().collect();
        let delta = store.check(&update, fx.author, &suppressed).unwrap();
        assert_eq!(delta.fields(), vec![Field::Unit]);
    }

    #[test]
    fn test_items_are_in_creation_order() {
        let mut fx = Fixture::new();
        let mut store = ItemStore::new();
        for name in ["a", "b", "c"] {
            store
                .apply(
                    &fx.op(OperationKind::Add {
                        item: ItemDraft::new(name),
                    }),
                    fx.author,
                )
                .unwrap();
        }
        let names: Vec<_> = store.items().iter().map(|i| i.name.clone()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }
}
