/// Runtime state of one shared list: membership, items, history
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::{
    ChangeLog, ChangeLogEntry, Delta, Field, Item, ItemStore, LamportClock, ListId, Operation,
    OperationId, ReconciliationEngine, Reconciled, Result, SyncError, Tombstone, UserId, Version,
};

/// Identity and membership of a list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListMeta {
    pub id: ListId,
    pub name: String,
    pub owner: UserId,

    /// Users allowed to read and edit; always contains the owner
    pub collaborators: BTreeSet<UserId>,

    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl ListMeta {
    pub fn new(name: impl Into<String>, owner: UserId) -> Self {
        let mut collaborators = BTreeSet::new();
        collaborators.insert(owner);
        Self {
            id: ListId::new(),
            name: name.into(),
            owner,
            collaborators,
            created_at: chrono::Utc::now(),
        }
    }

    pub fn with_collaborators(mut self, users: impl IntoIterator<Item = UserId>) -> Self {
        self.collaborators.extend(users);
        self
    }

    pub fn is_member(&self, user: UserId) -> bool {
        self.collaborators.contains(&user)
    }

    pub fn share(&mut self, by: UserId, user: UserId) -> Result<bool> {
        self.require_owner(by)?;
        Ok(self.collaborators.insert(user))
    }

    pub fn unshare(&mut self, by: UserId, user: UserId) -> Result<bool> {
        self.require_owner(by)?;
        if user == self.owner {
            return Err(SyncError::PermissionDenied(
                "the owner cannot be removed from a list".to_string(),
            ));
        }
        Ok(self.collaborators.remove(&user))
    }

    fn require_owner(&self, user: UserId) -> Result<()> {
        if user != self.owner {
            return Err(SyncError::PermissionDenied(format!(
                "only the owner can change who list {} is shared with",
                self.id
            )));
        }
        Ok(())
    }
}

/// Full list state sent to a session once on subscribe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListSnapshot {
    pub list: ListMeta,
    pub version: Version,
    pub clock: LamportClock,
    pub items: Vec<Item>,
    pub tombstones: Vec<Tombstone>,
}

/// An operation that passed reconciliation and validation but is not committed yet
#[derive(Debug, Clone)]
pub struct PreparedCommit {
    pub entry: ChangeLogEntry,
    pub reconciled: Reconciled,
}

/// Result of a successful commit, reported back to the submitting client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitReceipt {
    pub operation_id: OperationId,
    pub seq: u64,
    pub version: Version,
    pub clock: LamportClock,
    pub delta: Delta,

    /// Fields that lost reconciliation and were not written
    pub dropped: Vec<Field>,
}

/// Single-writer state of a list. All mutation goes through `prepare` + `commit`.
#[derive(Debug, Clone)]
pub struct ListState {
    meta: ListMeta,
    store: ItemStore,
    log: ChangeLog,
    clock: LamportClock,
    engine: ReconciliationEngine,
}

impl ListState {
    pub fn new(meta: ListMeta) -> Self {
        Self {
            meta,
            store: ItemStore::new(),
            log: ChangeLog::new(),
            clock: LamportClock::new(),
            engine: ReconciliationEngine::new(),
        }
    }

    /// Restore a list from durable history by replaying it
    pub fn restore(meta: ListMeta, entries: Vec<ChangeLogEntry>) -> Result<Self> {
        let log = ChangeLog::from_entries(entries)?;
        let store = ItemStore::replay(log.iter())?;
        let clock = log
            .iter()
            .map(|entry| entry.timestamp)
            .max()
            .unwrap_or_default();

        Ok(Self {
            meta,
            store,
            log,
            clock,
            engine: ReconciliationEngine::new(),
        })
    }

    pub fn id(&self) -> ListId {
        self.meta.id
    }

    pub fn meta(&self) -> &ListMeta {
        &self.meta
    }

    pub fn meta_mut(&mut self) -> &mut ListMeta {
        &mut self.meta
    }

    pub fn version(&self) -> Version {
        self.log.head()
    }

    pub fn clock(&self) -> LamportClock {
        self.clock
    }

    pub fn store(&self) -> &ItemStore {
        &self.store
    }

    pub fn log(&self) -> &ChangeLog {
        &self.log
    }

    pub fn authorize(&self, user: UserId) -> Result<()> {
        if !self.meta.is_member(user) {
            return Err(SyncError::Unauthorized(format!(
                "user {} is not a collaborator on list {}",
                user, self.meta.id
            )));
        }
        Ok(())
    }

    /// Reconcile and validate `op` without changing any state
    pub fn prepare(&self, op: &Operation, author: UserId) -> Result<PreparedCommit> {
        if op.list_id != self.meta.id {
            return Err(SyncError::InvalidOperation(format!(
                "operation targets list {}, not {}",
                op.list_id, self.meta.id
            )));
        }
        op.validate()?;

        let reconciled = self.engine.reconcile(op, &self.log)?;
        let delta = self.store.check(op, author, &reconciled.suppressed())?;

        let mut timestamp = self.clock;
        timestamp.update(op.clock);

        Ok(PreparedCommit {
            entry: ChangeLogEntry {
                version: self.log.next_version(),
                timestamp,
                author,
                operation: op.clone(),
                delta,
                committed_at: chrono::Utc::now(),
            },
            reconciled,
        })
    }

    /// Apply a prepared change and append it to the log in one step
    pub fn commit(&mut self, prepared: PreparedCommit) -> Result<CommitReceipt> {
        let PreparedCommit { entry, reconciled } = prepared;
        if entry.version != self.log.next_version() {
            return Err(SyncError::CorruptLog(format!(
                "prepared version {} but list is at {}",
                entry.version,
                self.log.head()
            )));
        }

        self.store.apply_delta(&entry.delta)?;
        self.clock = entry.timestamp;
        let entry = self.log.append(entry)?;

        Ok(CommitReceipt {
            operation_id: entry.operation.id,
            seq: entry.operation.seq,
            version: entry.version,
            clock: entry.timestamp,
            delta: entry.delta.clone(),
            dropped: reconciled.dropped_fields(),
        })
    }

    /// Prepare and commit in one call, for callers without a durable store
    pub fn apply(&mut self, op: &Operation, author: UserId) -> Result<CommitReceipt> {
        self.authorize(author)?;
        let prepared = self.prepare(op, author)?;
        self.commit(prepared)
    }

    pub fn snapshot(&self) -> ListSnapshot {
        ListSnapshot {
            list: self.meta.clone(),
            version: self.version(),
            clock: self.clock,
            items: self.store.items().into_iter().cloned().collect(),
            tombstones: self.store.tombstones().into_iter().cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ClientId, FieldChange, ItemDraft, ItemId, OperationKind};

    fn op(state: &ListState, client: ClientId, clock: u64, kind: OperationKind) -> Operation {
        Operation::new(
            state.id(),
            client,
            clock,
            state.version(),
            LamportClock(clock),
            kind,
        )
    }

    #[test]
    fn test_owner_is_always_a_collaborator() {
        let owner = UserId::new();
        let guest = UserId::new();
        let mut meta = ListMeta::new("Groceries", owner);
        assert!(meta.is_member(owner));

        assert!(meta.share(owner, guest).unwrap());
        assert!(meta.is_member(guest));

        assert!(matches!(
            meta.share(guest, UserId::new()),
            Err(SyncError::PermissionDenied(_))
        ));
        assert!(matches!(
            meta.unshare(owner, owner),
            Err(SyncError::PermissionDenied(_))
        ));
        assert!(meta.unshare(owner, guest).unwrap());
        assert!(!meta.is_member(guest));
    }

    #[test]
    fn test_versions_increase_by_one_per_commit() {
        let owner = UserId::new();
        let client = ClientId::new();
        let mut state = ListState::new(ListMeta::new("Weekly", owner));
        let draft = ItemDraft::new("milk");
        let id = draft.id;

        let receipt = state
            .apply(&op(&state, client, 1, OperationKind::Add { item: draft }), owner)
            .unwrap();
        assert_eq!(receipt.version, 1);

        let receipt = state
            .apply(
                &op(
                    &state,
                    client,
                    2,
                    OperationKind::Update {
                        item_id: id,
                        changes: vec![FieldChange::Quantity(2)],
                    },
                ),
                owner,
            )
            .unwrap();
        assert_eq!(receipt.version, 2);
        assert_eq!(state.log().head(), 2);
    }

    #[test]
    fn test_failed_operations_leave_state_untouched() {
        let owner = UserId::new();
        let client = ClientId::new();
        let mut state = ListState::new(ListMeta::new("Party", owner));
        let missing = ItemId::new();

        let before = state.snapshot();
        let result = state.apply(
            &op(&state, client, 1, OperationKind::Delete { item_id: missing }),
            owner,
        );
        assert_eq!(result, Err(SyncError::NotFound(missing)));
        assert_eq!(state.snapshot(), before);
        assert_eq!(state.version(), 0);

        let stranger = UserId::new();
        let result = state.apply(
            &op(
                &state,
                client,
                2,
                OperationKind::Add {
                    item: ItemDraft::new("chips"),
                },
            ),
            stranger,
        );
        assert!(matches!(result, Err(SyncError::Unauthorized(_))));
        assert_eq!(state.version(), 0);
    }

    #[test]
    fn test_server_clock_moves_past_client_clock() {
        let owner = UserId::new();
        let mut state = ListState::new(ListMeta::new("Clock", owner));
        let receipt = state
            .apply(
                &op(
                    &state,
                    ClientId::new(),
                    41,
                    OperationKind::Add {
                        item: ItemDraft::new("bananas"),
                    },
                ),
                owner,
            )
            .unwrap();
        assert_eq!(receipt.clock, LamportClock(42));
        assert_eq!(state.clock(), LamportClock(42));
    }

    #[test]
    fn test_restore_replays_history() {
        let owner = UserId::new();
        let client = ClientId::new();
        let mut state = ListState::new(ListMeta::new("Replay", owner));
        for (i, name) in ["a", "b", "c"].iter().enumerate() {
            state
                .apply(
                    &op(
                        &state,
                        client,
                        i as u64 + 1,
                        OperationKind::Add {
                            item: ItemDraft::new(*name),
                        },
                    ),
                    owner,
                )
                .unwrap();
        }

        let entries: Vec<_> = state.log().iter().cloned().collect();
        let restored = ListState::restore(state.meta().clone(), entries).unwrap();
        assert_eq!(restored.snapshot(), state.snapshot());
    }

    #[test]
    fn test_operation_for_another_list_is_invalid() {
        let owner = UserId::new();
        let state = ListState::new(ListMeta::new("Mine", owner));
        let foreign = Operation::new(
            ListId::new(),
            ClientId::new(),
            1,
            0,
            LamportClock(1),
            OperationKind::Add {
                item: ItemDraft::new("x"),
            },
        );
        assert!(matches!(
            state.prepare(&foreign, owner),
            Err(SyncError::InvalidOperation(_))
        ));
    }
}
