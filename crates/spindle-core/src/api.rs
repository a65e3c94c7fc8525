//! Wire types of the dispatch protocol, shared by the HTTP server and the
//! worker client.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{QueueName, QueueStatus, ServiceId};
use crate::ports::PullRowUpdate;

/// Body of `POST nexttask`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NextTaskRequest {
    pub features: Vec<String>,
    pub tasks: Vec<String>,
    pub division: String,
    pub service: ServiceId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_task_id: Option<String>,
    /// Outcome of `previous_task_id`; a missing value counts as failure.
    #[serde(default)]
    pub returned: bool,
}

/// Body of `PUT taskcomplete`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskCompleteRequest {
    pub task_id: String,
    pub returned: bool,
    pub division: String,
}

/// Body of `PUT task`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PutTaskRequest {
    pub task: TaskSubmission,
}

/// A task handed back to its queue; `data` is one object or a list of them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSubmission {
    pub task: String,
    pub data: Value,
    #[serde(default)]
    pub features: Vec<String>,
    pub division: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCompleteResponse {
    /// False when the lease was unknown (already completed or reclaimed).
    pub completed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PutTaskResponse {
    pub queued: usize,
}

/// Body of `PUT pull/{pull_queue_id}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutPullRequest {
    pub division: String,
    #[serde(flatten)]
    pub update: PullRowUpdate,
}

/// One line a restore command prints on stdout for a row it handled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRowReport {
    pub pull_queue_id: i64,
    #[serde(flatten)]
    pub update: PullRowUpdate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdatedResponse {
    pub updated: bool,
}

/// Body of `POST service`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterServiceRequest {
    pub division: String,
    #[serde(default)]
    pub threads: u32,
    #[serde(default)]
    pub host: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterServiceResponse {
    pub service: ServiceId,
}

/// Body of `POST resourceoffline` / `POST resourceonline`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub division: String,
    pub resource: String,
    pub service: ServiceId,
}

/// Services still reporting `resource` unreachable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceResponse {
    pub resource: String,
    pub services: Vec<ServiceId>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatusQuery {
    #[serde(default)]
    pub reset: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletedResponse {
    pub deleted: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleasedResponse {
    pub released: bool,
}

/// Extra pull priorities switched on, after a band change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnabledResponse {
    pub priorities: Vec<u32>,
}

/// `GET heartbeat/{division}/{service}`: counters per queue, prep and pull included.
pub type HeartbeatResponse = BTreeMap<QueueName, QueueStatus>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn next_task_defaults_optional_fields() {
        let req: NextTaskRequest = serde_json::from_value(json!({
            "features": ["hsi_1"],
            "tasks": ["copy"],
            "division": "jgi",
            "service": 3,
        }))
        .unwrap();
        assert_eq!(req.previous_task_id, None);
        assert!(!req.returned);
    }

    #[test]
    fn pull_report_lines_carry_optional_location() {
        let located: PullRowReport = serde_json::from_str(
            r#"{"pull_queue_id": 1, "status": "REGISTERED", "volume": "AU2972", "position_a": 427, "position_b": 0}"#,
        )
        .unwrap();
        assert_eq!(located.update.volume.as_deref(), Some("AU2972"));

        let done: PullRowReport =
            serde_json::from_value(json!({"pull_queue_id": 2, "status": "COMPLETE"})).unwrap();
        assert_eq!(done.update, PullRowUpdate::status(crate::domain::RowStatus::Complete));
        assert_eq!(
            serde_json::to_value(&done).unwrap(),
            json!({"pull_queue_id": 2, "status": "COMPLETE"})
        );
    }

    #[test]
    fn put_task_accepts_object_or_list() {
        let one: PutTaskRequest = serde_json::from_value(json!({
            "task": {"task": "put", "data": {"file_id": 1}, "division": "jgi"}
        }))
        .unwrap();
        assert!(one.task.data.is_object());
        assert!(one.task.features.is_empty());

        let many: PutTaskRequest = serde_json::from_value(json!({
            "task": {"task": "put", "data": [{"file_id": 1}, {"file_id": 2}],
                     "features": ["hsi_1"], "division": "jgi"}
        }))
        .unwrap();
        assert_eq!(many.task.data.as_array().map(Vec::len), Some(2));
    }
}
