use serde::{Deserialize, Serialize};

/// Per-queue counters reported by heartbeat and status views.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub record_count: u64,
    pub file_size: u64,
    pub currently_running: u64,
}

impl QueueStatus {
    /// Pending-only view used for store-backed queues.
    pub fn pending(record_count: u64) -> Self {
        Self {
            record_count,
            ..Self::default()
        }
    }
}
