/// Tunables for list workers and sync sessions
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{Result, SyncError};

/// Longest presence timeout accepted, one week
pub const MAX_PRESENCE_TIMEOUT_SECS: u64 = 7 * 24 * 60 * 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Events buffered per session before it is dropped for overflow
    pub session_queue_capacity: usize,

    /// Commands buffered per list worker
    pub mailbox_capacity: usize,

    /// Presence entries older than this are evicted
    pub presence_timeout_secs: u64,

    /// How often each worker sweeps expired presence
    pub presence_sweep_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            session_queue_capacity: 256,
            mailbox_capacity: 1024,
            presence_timeout_secs: 30,
            presence_sweep_ms: 5_000,
        }
    }
}

impl SyncConfig {
    pub fn validate(&self) -> Result<()> {
        if self.session_queue_capacity == 0 {
            return Err(SyncError::InvalidOperation(
                "session_queue_capacity must be > 0".to_string(),
            ));
        }
        if self.mailbox_capacity == 0 {
            return Err(SyncError::InvalidOperation(
                "mailbox_capacity must be > 0".to_string(),
            ));
        }
        if self.presence_timeout_secs > MAX_PRESENCE_TIMEOUT_SECS {
            return Err(SyncError::InvalidOperation(format!(
                "presence_timeout_secs must be <= {}",
                MAX_PRESENCE_TIMEOUT_SECS
            )));
        }
        if self.presence_sweep_ms == 0 {
            return Err(SyncError::InvalidOperation(
                "presence_sweep_ms must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn presence_timeout(&self) -> chrono::Duration {
        // Clamped; validate() rejects anything larger
        chrono::Duration::seconds(self.presence_timeout_secs.min(MAX_PRESENCE_TIMEOUT_SECS) as i64)
    }

    pub fn presence_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.presence_sweep_ms.max(1))
    }
}
