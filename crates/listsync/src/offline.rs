/// Offline support for list editing
/// Queue operations while disconnected and resubmit them on reconnect
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

use crate::{
    ClientId, Field, FieldChange, ItemId, LamportClock, ListId, Operation, OperationId,
    OperationKind, Result, SyncError, Version,
};

/// Operations issued by one client that the server has not acknowledged yet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfflineQueue {
    /// List the operations target
    pub list_id: ListId,

    /// Client installation that issued them
    pub client_id: ClientId,

    /// In issue order
    pub pending_operations: Vec<Operation>,

    /// Last list version the client had applied
    pub last_known_version: Version,

    /// Lamport clock after the last local or remote event
    pub last_known_clock: LamportClock,

    /// Last sequence number handed out, so a restored client keeps counting
    pub last_seq: u64,

    /// When the queue was started
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl OfflineQueue {
    /// Create an empty queue for a list and client
    pub fn new(list_id: ListId, client_id: ClientId) -> Self {
        Self {
            list_id,
            client_id,
            pending_operations: Vec::new(),
            last_known_version: 0,
            last_known_clock: LamportClock::new(),
            last_seq: 0,
            created_at: chrono::Utc::now(),
        }
    }

    /// Add an operation to the queue
    pub fn enqueue(&mut self, operation: Operation) {
        self.last_seq = self.last_seq.max(operation.seq);
        self.pending_operations.push(operation);
    }

    /// Take all pending operations, leaving the queue empty
    pub fn drain_pending(&mut self) -> Vec<Operation> {
        std::mem::take(&mut self.pending_operations)
    }

    /// Forget an operation the server has committed or finally rejected
    pub fn acknowledge(&mut self, operation_id: OperationId) -> bool {
        let before = self.pending_operations.len();
        self.pending_operations.retain(|op| op.id != operation_id);
        self.pending_operations.len() != before
    }

    /// Operations not yet acknowledged, oldest first
    pub fn pending(&self) -> &[Operation] {
        &self.pending_operations
    }

    pub fn is_empty(&self) -> bool {
        self.pending_operations.is_empty()
    }

    /// Get queue size
    pub fn len(&self) -> usize {
        self.pending_operations.len()
    }

    /// Drop queued operations a later queued operation makes redundant.
    ///
    /// Items both added and deleted inside the queue vanish entirely, and a
    /// field write is removed when a later queued operation writes the same
    /// field or deletes the item. Returns how many operations were dropped.
    pub fn optimize(&mut self) -> usize {
        let before = self.pending_operations.len();
        let operations = self.drain_pending();

        let added: HashSet<ItemId> = operations
            .iter()
            .filter(|op| matches!(op.kind, OperationKind::Add { .. }))
            .map(Operation::target)
            .collect();
        let deleted: HashSet<ItemId> = operations
            .iter()
            .filter(|op| matches!(op.kind, OperationKind::Delete { .. }))
            .map(Operation::target)
            .collect();

        // Walk newest first, remembering which fields a later op already writes
        let mut written_later: HashMap<ItemId, BTreeSet<Field>> = HashMap::new();
        let mut kept = Vec::with_capacity(operations.len());

        for mut op in operations.into_iter().rev() {
            let target = op.target();
            if added.contains(&target) && deleted.contains(&target) {
                continue;
            }

            let later = written_later.entry(target).or_default();
            match &mut op.kind {
                OperationKind::Add { .. } => {}
                OperationKind::Delete { .. } => later.extend(Field::ALL),
                OperationKind::Update { changes, .. } => {
                    changes.retain(|change| !later.contains(&change.field()));
                    if changes.is_empty() {
                        continue;
                    }
                    later.extend(changes.iter().map(FieldChange::field));
                }
                OperationKind::Check { .. } => {
                    if !later.insert(Field::Checked) {
                        continue;
                    }
                }
            }
            kept.push(op);
        }

        kept.reverse();
        self.pending_operations = kept;

        let dropped = before - self.pending_operations.len();
        if dropped > 0 {
            debug!("Optimized offline queue, dropped {} operations", dropped);
        }
        dropped
    }
}

/// Offline queue manager with persistent storage
pub struct OfflineQueueManager {
    storage_dir: PathBuf,
    current_queue: Option<OfflineQueue>,
}

impl OfflineQueueManager {
    /// Create a manager storing queues under `storage_dir`
    pub fn new(storage_dir: impl AsRef<Path>) -> Self {
        Self {
            storage_dir: storage_dir.as_ref().to_path_buf(),
            current_queue: None,
        }
    }

    /// Start a fresh queue, replacing any current one
    pub fn start_queue(&mut self, list_id: ListId, client_id: ClientId) {
        self.current_queue = Some(OfflineQueue::new(list_id, client_id));
    }

    /// Adopt an existing queue, e.g. one taken from a replica going offline
    pub fn set_queue(&mut self, queue: OfflineQueue) {
        self.current_queue = Some(queue);
    }

    /// Get the current queue
    pub fn current(&self) -> Option<&OfflineQueue> {
        self.current_queue.as_ref()
    }

    /// Remove and return the current queue
    pub fn take_queue(&mut self) -> Option<OfflineQueue> {
        self.current_queue.take()
    }

    /// Add an operation to the current queue
    pub fn enqueue(&mut self, operation: Operation) -> Result<()> {
        match &mut self.current_queue {
            Some(queue) => {
                queue.enqueue(operation);
                Ok(())
            }
            None => Err(SyncError::InvalidOperation(
                "no active offline queue".to_string(),
            )),
        }
    }

    /// Take all pending operations from the current queue
    pub fn drain_pending(&mut self) -> Vec<Operation> {
        self.current_queue
            .as_mut()
            .map(OfflineQueue::drain_pending)
            .unwrap_or_default()
    }

    /// Check if there are pending operations
    pub fn has_pending(&self) -> bool {
        self.current_queue
            .as_ref()
            .map(|q| !q.is_empty())
            .unwrap_or(false)
    }

    /// Get the number of pending operations
    pub fn pending_count(&self) -> usize {
        self.current_queue.as_ref().map(|q| q.len()).unwrap_or(0)
    }

    fn queue_path(&self, list_id: ListId, client_id: ClientId) -> PathBuf {
        self.storage_dir
            .join(format!("offline_queue_{}_{}.json", list_id.0, client_id.0))
    }

    /// Save the current queue to disk as JSON
    pub async fn save_queue(&self) -> Result<()> {
        let Some(queue) = &self.current_queue else {
            return Ok(());
        };

        fs::create_dir_all(&self.storage_dir)
            .await
            .map_err(|e| io_error("create offline storage directory", e))?;

        let json = serde_json::to_string_pretty(queue)?;
        fs::write(self.queue_path(queue.list_id, queue.client_id), json)
            .await
            .map_err(|e| io_error("write offline queue", e))?;

        debug!(
            "Saved offline queue for list {} with {} operations",
            queue.list_id,
            queue.len()
        );
        Ok(())
    }

    /// Load a saved queue. Returns false when none was saved.
    pub async fn load_queue(&mut self, list_id: ListId, client_id: ClientId) -> Result<bool> {
        let path = self.queue_path(list_id, client_id);
        if !fs::try_exists(&path)
            .await
            .map_err(|e| io_error("stat offline queue", e))?
        {
            return Ok(false);
        }

        let json = fs::read_to_string(&path)
            .await
            .map_err(|e| io_error("read offline queue", e))?;
        self.current_queue = Some(serde_json::from_str(&json)?);
        Ok(true)
    }

    /// Delete a saved queue file, if any
    pub async fn delete_saved_queue(&self, list_id: ListId, client_id: ClientId) -> Result<()> {
        let path = self.queue_path(list_id, client_id);
        if fs::try_exists(&path)
            .await
            .map_err(|e| io_error("stat offline queue", e))?
        {
            fs::remove_file(&path)
                .await
                .map_err(|e| io_error("delete offline queue", e))?;
        }
        Ok(())
    }
}

fn io_error(action: &str, err: std::io::Error) -> SyncError {
    SyncError::PersistenceUnavailable(format!("failed to {}: {}", action, err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ItemDraft;

    struct Issuer {
        list: ListId,
        client: ClientId,
        seq: u64,
    }

    impl Issuer {
        fn new() -> Self {
            Self {
                list: ListId::new(),
                client: ClientId::new(),
                seq: 0,
            }
        }

        fn op(&mut self, kind: OperationKind) -> Operation {
            self.seq += 1;
            Operation::new(
                self.list,
                self.client,
                self.seq,
                0,
                LamportClock(self.seq),
                kind,
            )
        }
    }

    #[test]
    fn test_offline_queue() {
        let mut issuer = Issuer::new();
        let mut queue = OfflineQueue::new(issuer.list, issuer.client);
        assert!(queue.is_empty());

        let op = issuer.op(OperationKind::Add {
            item: ItemDraft::new("rice"),
        });
        let id = op.id;
        queue.enqueue(op);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.last_seq, 1);

        assert!(queue.acknowledge(id));
        assert!(!queue.acknowledge(id));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_optimize_drops_items_added_and_deleted_offline() {
        let mut issuer = Issuer::new();
        let mut queue = OfflineQueue::new(issuer.list, issuer.client);
        let draft = ItemDraft::new("temporary");
        let id = draft.id;
        let kept = ItemDraft::new("keeper");

        queue.enqueue(issuer.op(OperationKind::Add { item: draft }));
        queue.enqueue(issuer.op(OperationKind::Add { item: kept.clone() }));
        queue.enqueue(issuer.op(OperationKind::Check {
            item_id: id,
            checked: true,
        }));
        queue.enqueue(issuer.op(OperationKind::Delete { item_id: id }));

        assert_eq!(queue.optimize(), 3);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pending()[0].target(), kept.id);
    }

    #[test]
    fn test_optimize_keeps_latest_field_writes() {
        let mut issuer = Issuer::new();
        let mut queue = OfflineQueue::new(issuer.list, issuer.client);
        let item_id = ItemId::new();

        queue.enqueue(issuer.op(OperationKind::Update {
            item_id,
            changes: vec![FieldChange::Quantity(2), FieldChange::Unit(Some("kg".into()))],
        }));
        queue.enqueue(issuer.op(OperationKind::Check {
            item_id,
            checked: true,
        }));
        queue.enqueue(issuer.op(OperationKind::Update {
            item_id,
            changes: vec![FieldChange::Quantity(3), FieldChange::Checked(false)],
        }));

        assert_eq!(queue.optimize(), 1);
        let pending = queue.pending();
        assert_eq!(pending.len(), 2);
        assert_eq!(
            pending[0].kind,
            OperationKind::Update {
                item_id,
                changes: vec![FieldChange::Unit(Some("kg".into()))],
            }
        );
        assert_eq!(pending[1].seq, 3);
    }

    #[test]
    fn test_optimize_drops_writes_before_delete_of_server_item() {
        let mut issuer = Issuer::new();
        let mut queue = OfflineQueue::new(issuer.list, issuer.client);
        let item_id = ItemId::new();

        queue.enqueue(issuer.op(OperationKind::Update {
            item_id,
            changes: vec![FieldChange::Name("oat milk".into())],
        }));
        queue.enqueue(issuer.op(OperationKind::Delete { item_id }));

        assert_eq!(queue.optimize(), 1);
        assert!(matches!(
            queue.pending()[0].kind,
            OperationKind::Delete { .. }
        ));
    }

    #[tokio::test]
    async fn test_queue_manager_persists_queue() {
        let dir = tempfile::tempdir().unwrap();
        let mut issuer = Issuer::new();
        let mut manager = OfflineQueueManager::new(dir.path());

        assert!(manager.enqueue(issuer.op(OperationKind::Delete { item_id: ItemId::new() })).is_err());

        manager.start_queue(issuer.list, issuer.client);
        manager
            .enqueue(issuer.op(OperationKind::Add {
                item: ItemDraft::new("coffee"),
            }))
            .unwrap();
        assert!(manager.has_pending());
        manager.save_queue().await.unwrap();

        let mut restored = OfflineQueueManager::new(dir.path());
        assert!(restored.load_queue(issuer.list, issuer.client).await.unwrap());
        assert_eq!(restored.pending_count(), 1);
        assert_eq!(restored.current(), manager.current());

        restored
            .delete_saved_queue(issuer.list, issuer.client)
            .await
            .unwrap();
        let mut empty = OfflineQueueManager::new(dir.path());
        assert!(!empty.load_queue(issuer.list, issuer.client).await.unwrap());
    }
}
