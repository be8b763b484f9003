/// Collaborative shopping-list synchronization core
/// Realtime multi-client list editing with a single writer per list
use serde::{Deserialize, Serialize};
use thiserror::Error;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        pub struct $name(pub uuid::Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(uuid::Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

mod operations;
pub use operations::*;

mod store;
pub use store::*;

mod changelog;
pub use changelog::*;

mod reconcile;
pub use reconcile::*;

mod list;
pub use list::*;

mod worker;
pub use worker::*;

mod registry;
pub use registry::*;

mod sync;
pub use sync::*;

mod session;
pub use session::*;

mod presence;
pub use presence::*;

mod persistence;
pub use persistence::*;

mod auth;
pub use auth::*;

mod config;
pub use config::*;

mod replica;
pub use replica::*;

mod offline;
pub use offline::*;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("item {0} already exists")]
    DuplicateId(ItemId),

    #[error("item {0} not found")]
    NotFound(ItemId),

    #[error("item {0} was deleted")]
    StaleTarget(ItemId),

    #[error("persistence unavailable: {0}")]
    PersistenceUnavailable(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("list not found: {0}")]
    ListNotFound(ListId),

    #[error("corrupt change log: {0}")]
    CorruptLog(String),

    #[error("worker for list {0} has stopped")]
    WorkerGone(ListId),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl SyncError {
    /// Errors that end the session that hit them
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::Unauthorized(_)
                | SyncError::ProtocolViolation(_)
                | SyncError::InvalidOperation(_)
                | SyncError::WorkerGone(_)
        )
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            SyncError::Unauthorized(_) => ErrorCode::Unauthorized,
            SyncError::PermissionDenied(_) => ErrorCode::PermissionDenied,
            SyncError::DuplicateId(_) => ErrorCode::DuplicateId,
            SyncError::NotFound(_) => ErrorCode::NotFound,
            SyncError::StaleTarget(_) => ErrorCode::StaleTarget,
            SyncError::PersistenceUnavailable(_) => ErrorCode::PersistenceUnavailable,
            SyncError::InvalidOperation(_) => ErrorCode::InvalidOperation,
            SyncError::ProtocolViolation(_) => ErrorCode::ProtocolViolation,
            SyncError::ListNotFound(_) => ErrorCode::ListNotFound,
            SyncError::CorruptLog(_) | SyncError::WorkerGone(_) | SyncError::Serialization(_) => {
                ErrorCode::Internal
            }
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Serialization(err.to_string())
    }
}

impl From<bincode::Error> for SyncError {
    fn from(err: bincode::Error) -> Self {
        SyncError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// Error category reported to clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Unauthorized,
    PermissionDenied,
    DuplicateId,
    NotFound,
    StaleTarget,
    PersistenceUnavailable,
    InvalidOperation,
    ProtocolViolation,
    ListNotFound,
    Internal,
}

/// List version: number of operations committed to the list's change log
pub type Version = u64;

uuid_id!(
    /// Shopping list identifier
    ListId
);

uuid_id!(
    /// Authenticated user identifier
    UserId
);

uuid_id!(
    /// Identifier of one client installation; breaks Lamport ties
    ClientId
);

uuid_id!(
    /// Identifier of one connected sync session
    SessionId
);

/// Lamport timestamp for causality tracking
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct LamportClock(pub u64);

impl LamportClock {
    pub fn new() -> Self {
        Self(0)
    }

    pub fn tick(&mut self) {
        self.0 += 1;
    }

    pub fn update(&mut self, other: LamportClock) {
        self.0 = self.0.max(other.0) + 1;
    }
}
