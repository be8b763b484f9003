/// Client-side mirror of a shared list
/// Applies server events in version order and keeps local operations until acknowledged.
use tracing::{debug, warn};

use crate::{
    ChangeLogEntry, ClientId, Delta, ErrorCode, Item, ItemId, ItemStore, LamportClock, ListId,
    ListMeta, OfflineQueue, Operation, OperationKind, Result, ServerMessage, SyncError, Tombstone,
    Version,
};

pub struct ListReplica {
    list_id: ListId,
    client_id: ClientId,
    meta: Option<ListMeta>,
    store: ItemStore,

    /// Last server version applied
    version: Version,

    clock: LamportClock,
    queue: OfflineQueue,
}

impl ListReplica {
    pub fn new(list_id: ListId, client_id: ClientId) -> Self {
        Self::from_queue(OfflineQueue::new(list_id, client_id))
    }

    /// Resume with operations saved while offline
    pub fn from_queue(queue: OfflineQueue) -> Self {
        Self {
            list_id: queue.list_id,
            client_id: queue.client_id,
            meta: None,
            store: ItemStore::new(),
            version: queue.last_known_version,
            clock: queue.last_known_clock,
            queue,
        }
    }

    pub fn list_id(&self) -> ListId {
        self.list_id
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn meta(&self) -> Option<&ListMeta> {
        self.meta.as_ref()
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn clock(&self) -> LamportClock {
        self.clock
    }

    pub fn store(&self) -> &ItemStore {
        &self.store
    }

    pub fn items(&self) -> Vec<&Item> {
        self.store.items()
    }

    pub fn get(&self, item_id: &ItemId) -> Option<&Item> {
        self.store.get(item_id)
    }

    /// Operations issued here and not yet acknowledged
    pub fn pending(&self) -> &[Operation] {
        self.queue.pending()
    }

    pub fn queue(&self) -> &OfflineQueue {
        &self.queue
    }

    pub fn queue_mut(&mut self) -> &mut OfflineQueue {
        &mut self.queue
    }

    /// Issue a new operation against the last applied version and queue it
    pub fn local(&mut self, kind: OperationKind) -> Operation {
        self.clock.tick();
        let op = Operation::new(
            self.list_id,
            self.client_id,
            self.queue.last_seq + 1,
            self.version,
            self.clock,
            kind,
        );
        self.queue.enqueue(op.clone());
        self.queue.last_known_clock = self.clock;
        op
    }

    pub fn apply_snapshot(
        &mut self,
        list: ListMeta,
        version: Version,
        clock: LamportClock,
        items: Vec<Item>,
        tombstones: Vec<Tombstone>,
    ) {
        self.store = ItemStore::from_parts(items, tombstones);
        self.meta = Some(list);
        self.set_version(version);
        self.observe(clock);
    }

    /// Apply one committed entry. Returns false if it was already applied.
    /// Own operations are acknowledged either way, e.g. after a snapshot jumped past them.
    pub fn apply_entry(&mut self, entry: &ChangeLogEntry) -> Result<bool> {
        let applied = self.advance(entry.version, entry.timestamp, &entry.delta)?;
        if entry.operation.client_id == self.client_id {
            self.queue.acknowledge(entry.operation.id);
        }
        Ok(applied)
    }

    pub fn apply_entries<'a>(
        &mut self,
        entries: impl IntoIterator<Item = &'a ChangeLogEntry>,
    ) -> Result<usize> {
        let mut applied = 0;
        for entry in entries {
            if self.apply_entry(entry)? {
                applied += 1;
            }
        }
        Ok(applied)
    }

    /// Fold one server message into the mirror
    pub fn apply_message(&mut self, message: &ServerMessage) -> Result<()> {
        match message {
            ServerMessage::Snapshot {
                list,
                version,
                clock,
                items,
                tombstones,
                ..
            } => {
                self.apply_snapshot(
                    list.clone(),
                    *version,
                    *clock,
                    items.clone(),
                    tombstones.clone(),
                );
            }
            ServerMessage::ItemAdded {
                version,
                clock,
                item,
            } => {
                let delta = Delta::Added { item: item.clone() };
                self.advance(*version, *clock, &delta)?;
            }
            ServerMessage::ItemUpdated {
                version,
                clock,
                item_id,
                changes,
                stamp,
                author,
            } => {
                let delta = Delta::Updated {
                    item_id: *item_id,
                    changes: changes.clone(),
                    stamp: *stamp,
                    author: *author,
                };
                self.advance(*version, *clock, &delta)?;
            }
            ServerMessage::ItemDeleted {
                version,
                clock,
                item_id,
                stamp,
                author,
            } => {
                let delta = Delta::Deleted {
                    item_id: *item_id,
                    stamp: *stamp,
                    author: *author,
                };
                self.advance(*version, *clock, &delta)?;
            }
            ServerMessage::Ack {
                operation_id,
                version,
                clock,
                delta,
                ..
            } => {
                self.advance(*version, *clock, delta)?;
                self.queue.acknowledge(*operation_id);
            }
            ServerMessage::Rejected {
                operation_id,
                code,
                message,
                ..
            } => {
                // Storage outages are retried; every other rejection is final
                if *code != ErrorCode::PersistenceUnavailable {
                    warn!("Operation {} rejected: {}", operation_id, message);
                    self.queue.acknowledge(*operation_id);
                }
            }
            ServerMessage::Entries { entries, .. } => {
                self.apply_entries(entries)?;
            }
            ServerMessage::ListMembers { list } => self.meta = Some(list.clone()),
            _ => {}
        }
        Ok(())
    }

    /// Operations to send again after reconnecting.
    ///
    /// Apply the `entries` reply for the last known version first: entries
    /// carrying this client's own operations acknowledge them, so nothing
    /// that already committed is submitted twice.
    pub fn resubmit(&mut self) -> Vec<Operation> {
        self.queue.optimize();
        self.queue.pending().to_vec()
    }

    fn advance(&mut self, version: Version, clock: LamportClock, delta: &Delta) -> Result<bool> {
        if version <= self.version {
            debug!("Skipping version {} already applied", version);
            return Ok(false);
        }
        if version != self.version + 1 {
            return Err(SyncError::CorruptLog(format!(
                "replica at version {} received version {}",
                self.version, version
            )));
        }

        self.store.apply_delta(delta)?;
        self.set_version(version);
        self.observe(clock);
        Ok(true)
    }

    fn set_version(&mut self, version: Version) {
        self.version = version;
        self.queue.last_known_version = version;
    }

    fn observe(&mut self, remote: LamportClock) {
        self.clock.update(remote);
        self.queue.last_known_clock = self.clock;
    }
}
