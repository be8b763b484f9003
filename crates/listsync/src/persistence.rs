/// Durable storage for list membership and change logs
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::{ChangeLogEntry, ListId, ListMeta, Result, SyncError, Version};

/// What the durable store keeps for one list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredList {
    pub meta: ListMeta,
    pub entries: Vec<ChangeLogEntry>,
}

impl StoredList {
    pub fn new(meta: ListMeta) -> Self {
        Self {
            meta,
            entries: Vec::new(),
        }
    }

    pub fn version(&self) -> Version {
        self.entries.len() as Version
    }

    /// Append `entry` unless that version is already stored.
    /// Returns false for a repeated version; a gap is an error.
    pub fn append(&mut self, entry: &ChangeLogEntry) -> Result<bool> {
        let head = self.version();
        if entry.version <= head {
            return Ok(false);
        }
        if entry.version != head + 1 {
            return Err(SyncError::CorruptLog(format!(
                "persist of version {} onto stored head {}",
                entry.version, head
            )));
        }
        self.entries.push(entry.clone());
        Ok(true)
    }
}

/// Durable store the core loads lists from and persists commits to
#[async_trait]
pub trait ListStore: Send + Sync {
    /// Load a list's membership and history; `None` if it was never created
    async fn load(&self, list_id: ListId) -> Result<Option<StoredList>>;

    /// Create a list or replace its membership
    async fn save_meta(&self, meta: &ListMeta) -> Result<()>;

    /// Persist one committed entry; idempotent by version
    async fn persist(&self, list_id: ListId, entry: &ChangeLogEntry) -> Result<()>;
}

/// In-process store, mainly for tests and ephemeral servers
pub struct MemoryStore {
    lists: RwLock<HashMap<ListId, StoredList>>,
    available: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            lists: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate the backing store going away or coming back
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn stored(&self, list_id: ListId) -> Option<StoredList> {
        self.lists.read().get(&list_id).cloned()
    }

    fn ensure_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SyncError::PersistenceUnavailable(
                "memory store is offline".to_string(),
            ))
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ListStore for MemoryStore {
    async fn load(&self, list_id: ListId) -> Result<Option<StoredList>> {
        self.ensure_available()?;
        Ok(self.stored(list_id))
    }

    async fn save_meta(&self, meta: &ListMeta) -> Result<()> {
        self.ensure_available()?;
        let mut lists = self.lists.write();
        match lists.get_mut(&meta.id) {
            Some(stored) => stored.meta = meta.clone(),
            None => {
                lists.insert(meta.id, StoredList::new(meta.clone()));
            }
        }
        Ok(())
    }

    async fn persist(&self, list_id: ListId, entry: &ChangeLogEntry) -> Result<()> {
        self.ensure_available()?;
        let mut lists = self.lists.write();
        let stored = lists
            .get_mut(&list_id)
            .ok_or(SyncError::ListNotFound(list_id))?;
        if !stored.append(entry)? {
            debug!("Version {} of list {} already stored", entry.version, list_id);
        }
        Ok(())
    }
}

/// Per list under a directory: a bincode membership file and an append-only entry log.
///
/// Log records are a little-endian `u32` length followed by one bincode
/// `ChangeLogEntry`. A commit appends one record, so history is never rewritten.
pub struct FileStore {
    dir: PathBuf,

    /// Stored head version per list, filled on first touch
    heads: Mutex<HashMap<ListId, Version>>,
}

impl FileStore {
    /// Open (and create if needed) a storage directory
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| unavailable("create storage directory", e))?;
        Ok(Self {
            dir,
            heads: Mutex::new(HashMap::new()),
        })
    }

    fn meta_path(&self, list_id: ListId) -> PathBuf {
        self.dir.join(format!("list-{}.meta", list_id.0))
    }

    fn log_path(&self, list_id: ListId) -> PathBuf {
        self.dir.join(format!("list-{}.log", list_id.0))
    }

    async fn read_meta(&self, list_id: ListId) -> Result<Option<ListMeta>> {
        let path = self.meta_path(list_id);
        if !exists(&path).await? {
            return Ok(None);
        }
        let bytes = fs::read(&path)
            .await
            .map_err(|e| unavailable("read list meta", e))?;
        Ok(Some(bincode::deserialize(&bytes)?))
    }

    /// Read every complete record; a torn trailing record is cut off
    async fn read_log(&self, list_id: ListId) -> Result<Vec<ChangeLogEntry>> {
        let path = self.log_path(list_id);
        if !exists(&path).await? {
            return Ok(Vec::new());
        }
        let bytes = fs::read(&path)
            .await
            .map_err(|e| unavailable("read list log", e))?;

        let (entries, valid_len) = decode_records(&bytes)?;
        if valid_len < bytes.len() {
            warn!(
                "Truncating {} torn bytes from the log of list {}",
                bytes.len() - valid_len,
                list_id
            );
            let file = fs::OpenOptions::new()
                .write(true)
                .open(&path)
                .await
                .map_err(|e| unavailable("open list log", e))?;
            file.set_len(valid_len as u64)
                .await
                .map_err(|e| unavailable("truncate list log", e))?;
        }

        self.heads.lock().insert(list_id, entries.len() as Version);
        Ok(entries)
    }

    async fn head(&self, list_id: ListId) -> Result<Version> {
        let cached = self.heads.lock().get(&list_id).copied();
        match cached {
            Some(head) => Ok(head),
            None => Ok(self.read_log(list_id).await?.len() as Version),
        }
    }
}

#[async_trait]
impl ListStore for FileStore {
    async fn load(&self, list_id: ListId) -> Result<Option<StoredList>> {
        let Some(meta) = self.read_meta(list_id).await? else {
            return Ok(None);
        };
        let entries = self.read_log(list_id).await?;
        Ok(Some(StoredList { meta, entries }))
    }

    async fn save_meta(&self, meta: &ListMeta) -> Result<()> {
        let path = self.meta_path(meta.id);
        let tmp = path.with_extension("meta.tmp");
        let bytes = bincode::serialize(meta)?;

        fs::write(&tmp, bytes)
            .await
            .map_err(|e| unavailable("write list meta", e))?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| unavailable("replace list meta", e))?;
        Ok(())
    }

    async fn persist(&self, list_id: ListId, entry: &ChangeLogEntry) -> Result<()> {
        if !exists(&self.meta_path(list_id)).await? {
            return Err(SyncError::ListNotFound(list_id));
        }

        let head = self.head(list_id).await?;
        if entry.version <= head {
            debug!("Version {} of list {} already on disk", entry.version, list_id);
            return Ok(());
        }
        if entry.version != head + 1 {
            return Err(SyncError::CorruptLog(format!(
                "persist of version {} onto stored head {}",
                entry.version, head
            )));
        }

        let record = encode_record(entry)?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path(list_id))
            .await
            .map_err(|e| unavailable("open list log", e))?;
        file.write_all(&record)
            .await
            .map_err(|e| unavailable("append to list log", e))?;
        file.sync_data()
            .await
            .map_err(|e| unavailable("sync list log", e))?;

        self.heads.lock().insert(list_id, entry.version);
        Ok(())
    }
}

fn encode_record(entry: &ChangeLogEntry) -> Result<Vec<u8>> {
    let body = bincode::serialize(entry)?;
    let len = u32::try_from(body.len())
        .map_err(|_| SyncError::Serialization("log record too large".to_string()))?;

    let mut record = Vec::with_capacity(body.len() + 4);
    record.extend_from_slice(&len.to_le_bytes());
    record.extend_from_slice(&body);
    Ok(record)
}

/// Decoded entries and the length of the prefix holding complete records
fn decode_records(bytes: &[u8]) -> Result<(Vec<ChangeLogEntry>, usize)> {
    let mut entries = Vec::new();
    let mut offset = 0;

    while bytes.len() - offset >= 4 {
        let mut prefix = [0u8; 4];
        prefix.copy_from_slice(&bytes[offset..offset + 4]);
        let len = u32::from_le_bytes(prefix) as usize;

        let start = offset + 4;
        if bytes.len() - start < len {
            break;
        }
        entries.push(bincode::deserialize(&bytes[start..start + len])?);
        offset = start + len;
    }
    Ok((entries, offset))
}

async fn exists(path: &Path) -> Result<bool> {
    fs::try_exists(path)
        .await
        .map_err(|e| unavailable("stat list file", e))
}

fn unavailable(action: &str, err: std::io::Error) -> SyncError {
    SyncError::PersistenceUnavailable(format!("failed to {}: {}", action, err))
}
