/// Append-only history of committed operations for one list
use serde::{Deserialize, Serialize};

use crate::{Delta, LamportClock, Operation, Result, SyncError, UserId, Version};

/// A committed operation and the change it produced
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeLogEntry {
    /// List version after this entry was applied
    pub version: Version,

    /// Server-assigned logical timestamp
    pub timestamp: LamportClock,

    /// Authenticated user who submitted the operation
    pub author: UserId,

    pub operation: Operation,
    pub delta: Delta,
    pub committed_at: chrono::DateTime<chrono::Utc>,
}

/// Entries in version order: entry `n` sits at index `n - 1`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeLog {
    entries: Vec<ChangeLogEntry>,
}

impl ChangeLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a log from stored entries, refusing gaps or reordering
    pub fn from_entries(entries: Vec<ChangeLogEntry>) -> Result<Self> {
        for (index, entry) in entries.iter().enumerate() {
            let expected = index as Version + 1;
            if entry.version != expected {
                return Err(SyncError::CorruptLog(format!(
                    "expected version {} at position {}, found {}",
                    expected, index, entry.version
                )));
            }
        }
        Ok(Self { entries })
    }

    /// Current list version
    pub fn head(&self) -> Version {
        self.entries.len() as Version
    }

    pub fn next_version(&self) -> Version {
        self.head() + 1
    }

    pub fn append(&mut self, entry: ChangeLogEntry) -> Result<&ChangeLogEntry> {
        if entry.version != self.next_version() {
            return Err(SyncError::CorruptLog(format!(
                "append of version {} onto head {}",
                entry.version,
                self.head()
            )));
        }
        self.entries.push(entry);
        Ok(&self.entries[self.entries.len() - 1])
    }

    /// Entries with a version greater than `version`, in order
    pub fn entries_since(&self, version: Version) -> &[ChangeLogEntry] {
        let start = (version as usize).min(self.entries.len());
        &self.entries[start..]
    }

    pub fn get(&self, version: Version) -> Option<&ChangeLogEntry> {
        if version == 0 {
            return None;
        }
        self.entries.get(version as usize - 1)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChangeLogEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
