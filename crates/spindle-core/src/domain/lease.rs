use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{FeatureSet, LeaseId, QueueName, ServiceId};

/// A unit of work handed to a worker.
///
/// Memory-queue tasks carry a `task_id` and are tracked by the TaskManager
/// until completed or lost. Prep and pull batches are tracked by store rows
/// instead, so their `task_id` is `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    pub task: QueueName,
    pub data: Value,
    pub task_id: Option<LeaseId>,
    pub features: FeatureSet,
    pub service: ServiceId,
    pub created: DateTime<Utc>,
    pub division: String,
    /// Number of files in a pull batch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub records: Option<usize>,
}

/// What a queue hands back from `next()`: the resources the task consumes and
/// its (possibly replaced) payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Selected {
    pub uses_resources: FeatureSet,
    pub data: Value,
}
