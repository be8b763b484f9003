/// Directory of running list workers
/// Lists are loaded from the durable store on first use; each gets its own worker.
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

use crate::{
    ChangeLogEntry, CommitReceipt, ListHandle, ListId, ListMeta, ListSnapshot, ListState,
    ListStore, ListWorker, Operation, Result, SyncConfig, SyncError,
    UserId, Version,
};

pub struct ListRegistry {
    lists: RwLock<HashMap<ListId, ListHandle>>,
    store: Arc<dyn ListStore>,
    config: SyncConfig,
}

impl ListRegistry {
    pub fn new(store: Arc<dyn ListStore>, config: SyncConfig) -> Self {
        Self {
            lists: RwLock::new(HashMap::new()),
            store,
            config,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Create and persist a new list, then start its worker
    pub async fn create_list(
        &self,
        owner: UserId,
        name: impl Into<String>,
        collaborators: impl IntoIterator<Item = UserId>,
    ) -> Result<ListMeta> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(SyncError::InvalidOperation(
                "list name must not be empty".to_string(),
            ));
        }

        let meta = ListMeta::new(name, owner).with_collaborators(collaborators);
        self.store.save_meta(&meta).await?;

        let handle = ListWorker::spawn(
            ListState::new(meta.clone()),
            self.store.clone(),
            self.config.clone(),
        );
        self.lists.write().await.insert(meta.id, handle);

        info!("Created list {} ({}) for user {}", meta.id, meta.name, owner);
        Ok(meta)
    }

    /// Handle of a list's worker, loading the list on a cold start
    pub async fn handle(&self, list_id: ListId) -> Result<ListHandle> {
        if let Some(handle) = self.lists.read().await.get(&list_id) {
            if !handle.is_closed() {
                return Ok(handle.clone());
            }
        }

        let mut lists = self.lists.write().await;
        if let Some(handle) = lists.get(&list_id) {
            if !handle.is_closed() {
                return Ok(handle.clone());
            }
        }

        let stored = self
            .store
            .load(list_id)
            .await?
            .ok_or(SyncError::ListNotFound(list_id))?;
        let entries = stored.entries.len();
        let state = ListState::restore(stored.meta, stored.entries)?;
        info!("Loaded list {} with {} entries", list_id, entries);

        let handle = ListWorker::spawn(state, self.store.clone(), self.config.clone());
        lists.insert(list_id, handle.clone());
        Ok(handle)
    }

    pub async fn loaded(&self) -> usize {
        self.lists.read().await.len()
    }

    /// Submit outside of any session; no ack is queued anywhere
    pub async fn submit(&self, operation: Operation, author: UserId) -> Result<CommitReceipt> {
        self.handle(operation.list_id)
            .await?
            .submit(operation, author, None)
            .await
    }

    pub async fn entries_since(
        &self,
        list_id: ListId,
        user: UserId,
        version: Version,
    ) -> Result<Vec<ChangeLogEntry>> {
        self.handle(list_id)
            .await?
            .entries_since(user, version)
            .await
    }

    pub async fn snapshot(&self, list_id: ListId, user: UserId) -> Result<ListSnapshot> {
        self.handle(list_id).await?.snapshot(user).await
    }

    pub async fn share(&self, list_id: ListId, by: UserId, user: UserId) -> Result<ListMeta> {
        self.handle(list_id).await?.share(by, user).await
    }

    pub async fn unshare(&self, list_id: ListId, by: UserId, user: UserId) -> Result<ListMeta> {
        self.handle(list_id).await?.unshare(by, user).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ClientId, ItemDraft, LamportClock, MemoryStore, OperationKind};

    #[tokio::test]
    async fn test_unknown_list_is_not_found() {
        let registry = ListRegistry::new(Arc::new(MemoryStore::new()), SyncConfig::default());
        let missing = ListId::new();
        assert_eq!(
            registry.handle(missing).await.err(),
            Some(SyncError::ListNotFound(missing))
        );
    }

    #[tokio::test]
    async fn test_cold_start_restores_history() {
        let store = Arc::new(MemoryStore::new());
        let owner = UserId::new();

        let list_id = {
            let registry = ListRegistry::new(store.clone(), SyncConfig::default());
            let meta = registry.create_list(owner, "Weekend", Vec::<UserId>::new()).await.unwrap();
            let op = Operation::new(
                meta.id,
                ClientId::new(),
                1,
                0,
                LamportClock(1),
                OperationKind::Add {
                    item: ItemDraft::new("charcoal"),
                },
            );
            registry.submit(op, owner).await.unwrap();
            meta.id
        };

        let registry = ListRegistry::new(store, SyncConfig::default());
        assert_eq!(registry.loaded().await, 0);
        let snapshot = registry.snapshot(list_id, owner).await.unwrap();
        assert_eq!(snapshot.version, 1);
        assert_eq!(snapshot.items[0].name, "charcoal");
        assert_eq!(registry.loaded().await, 1);
    }

    #[tokio::test]
    async fn test_blank_list_name_is_rejected() {
        let registry = ListRegistry::new(Arc::new(MemoryStore::new()), SyncConfig::default());
        assert!(matches!(
            registry.create_list(UserId::new(), "  ", []).await,
            Err(SyncError::InvalidOperation(_))
        ));
    }
}
