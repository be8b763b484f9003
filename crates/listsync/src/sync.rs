/// Wire protocol between clients and the sync server
/// JSON objects tagged by `type`; list and user events use the `scope:noun:verb` names.
use serde::{Deserialize, Serialize};

use crate::{
    ChangeLogEntry, CloseReason, CommitReceipt, Delta, ErrorCode, Field, FieldChange, Item,
    ItemId, LamportClock, ListId, ListMeta, ListSnapshot, Operation, OperationId,
    PresenceEvent, Stamp, SyncError, Tombstone, UserId, Version,
};

/// Messages sent by clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Authenticate and subscribe to a list
    Connect { token: String, list_id: ListId },

    /// Create a list owned by the token's user
    CreateList {
        token: String,
        name: String,
        #[serde(default)]
        collaborators: Vec<UserId>,
    },

    /// Submit an operation to the subscribed list
    Operation { operation: Operation },

    /// Request committed entries after a version
    SyncRequest { since: Version },

    Typing { typing: bool },

    /// Owner only
    Share { user_id: UserId },

    /// Owner only
    Unshare { user_id: UserId },

    Ping,
}

/// Messages sent by the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// Full list state, sent once after subscribing
    #[serde(rename = "snapshot")]
    Snapshot {
        list: ListMeta,
        version: Version,
        clock: LamportClock,
        items: Vec<Item>,
        tombstones: Vec<Tombstone>,
        present: Vec<UserId>,
    },

    #[serde(rename = "list_created")]
    ListCreated { list: ListMeta },

    /// Membership after a share or unshare
    #[serde(rename = "list_members")]
    ListMembers { list: ListMeta },

    #[serde(rename = "list:item:added")]
    ItemAdded {
        version: Version,
        clock: LamportClock,
        item: Item,
    },

    #[serde(rename = "list:item:updated")]
    ItemUpdated {
        version: Version,
        clock: LamportClock,
        item_id: ItemId,
        changes: Vec<FieldChange>,
        stamp: Stamp,
        author: UserId,
    },

    #[serde(rename = "list:item:deleted")]
    ItemDeleted {
        version: Version,
        clock: LamportClock,
        item_id: ItemId,
        stamp: Stamp,
        author: UserId,
    },

    /// The submitting client's operation was committed
    #[serde(rename = "ack")]
    Ack {
        operation_id: OperationId,
        seq: u64,
        version: Version,
        clock: LamportClock,
        delta: Delta,
        dropped: Vec<Field>,
    },

    /// The submitting client's operation was not committed
    #[serde(rename = "rejected")]
    Rejected {
        operation_id: OperationId,
        seq: u64,
        code: ErrorCode,
        message: String,
    },

    /// Reply to a sync request
    #[serde(rename = "entries")]
    Entries {
        entries: Vec<ChangeLogEntry>,
        version: Version,
    },

    #[serde(rename = "user:joined")]
    UserJoined { user_id: UserId },

    #[serde(rename = "user:left")]
    UserLeft { user_id: UserId },

    #[serde(rename = "user:typing")]
    UserTyping { user_id: UserId, typing: bool },

    /// A request that is not an operation failed without ending the session
    #[serde(rename = "error")]
    Error { code: ErrorCode, message: String },

    /// Terminal; nothing follows
    #[serde(rename = "closed")]
    Closed { reason: CloseReason },

    #[serde(rename = "pong")]
    Pong,
}

impl ServerMessage {
    pub fn snapshot(snapshot: ListSnapshot, present: Vec<UserId>) -> Self {
        ServerMessage::Snapshot {
            list: snapshot.list,
            version: snapshot.version,
            clock: snapshot.clock,
            items: snapshot.items,
            tombstones: snapshot.tombstones,
            present,
        }
    }

    /// The `list:item:*` event for a committed entry
    pub fn from_entry(entry: &ChangeLogEntry) -> Self {
        let version = entry.version;
        let clock = entry.timestamp;
        match &entry.delta {
            Delta::Added { item } => ServerMessage::ItemAdded {
                version,
                clock,
                item: item.clone(),
            },
            Delta::Updated {
                item_id,
                changes,
                stamp,
                author,
            } => ServerMessage::ItemUpdated {
                version,
                clock,
                item_id: *item_id,
                changes: changes.clone(),
                stamp: *stamp,
                author: *author,
            },
            Delta::Deleted {
                item_id,
                stamp,
                author,
            } => ServerMessage::ItemDeleted {
                version,
                clock,
                item_id: *item_id,
                stamp: *stamp,
                author: *author,
            },
        }
    }

    pub fn ack(receipt: CommitReceipt) -> Self {
        ServerMessage::Ack {
            operation_id: receipt.operation_id,
            seq: receipt.seq,
            version: receipt.version,
            clock: receipt.clock,
            delta: receipt.delta,
            dropped: receipt.dropped,
        }
    }

    pub fn rejected(operation: &Operation, error: &SyncError) -> Self {
        ServerMessage::Rejected {
            operation_id: operation.id,
            seq: operation.seq,
            code: error.code(),
            message: error.to_string(),
        }
    }

    pub fn error(error: &SyncError) -> Self {
        ServerMessage::Error {
            code: error.code(),
            message: error.to_string(),
        }
    }

    pub fn presence(event: PresenceEvent) -> Self {
        match event {
            PresenceEvent::Joined { user_id } => ServerMessage::UserJoined { user_id },
            PresenceEvent::Left { user_id } => ServerMessage::UserLeft { user_id },
            PresenceEvent::Typing { user_id, typing } => {
                ServerMessage::UserTyping { user_id, typing }
            }
        }
    }

    /// Committed list version this message carries, if any
    pub fn version(&self) -> Option<Version> {
        match self {
            ServerMessage::ItemAdded { version, .. }
            | ServerMessage::ItemUpdated { version, .. }
            | ServerMessage::ItemDeleted { version, .. }
            | ServerMessage::Ack { version, .. } => Some(*version),
            _ => None,
        }
    }
}
