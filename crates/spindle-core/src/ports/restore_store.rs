//! RestoreStore port - pull_queue テーブル（tape からのリストア要求）
//!
//! PullQueue / PrepQueue はこのポート越しに行を選択・更新する。
//! pull は division 単位、prep は backup service 単位でスコープされる。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::StoreError;
use crate::domain::{FileStatus, RowStatus, TaskRecord};

/// The oldest registered row of the best volume, as returned by [`RestoreStore::next_volume`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeCandidate {
    pub pull_queue_id: i64,
    pub volume: String,
    pub priority: u32,
}

/// A worker's report on one prep or pull row.
///
/// Prep sets `volume` and the positions and moves the row back to
/// `REGISTERED`; pull ends in `COMPLETE` or `FAILED`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRowUpdate {
    pub status: RowStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position_a: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position_b: Option<i64>,
}

impl PullRowUpdate {
    pub fn status(status: RowStatus) -> Self {
        Self {
            status,
            volume: None,
            position_a: None,
            position_b: None,
        }
    }
}

/// A row moved back to `REGISTERED` by [`RestoreStore::requeue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequeuedRow {
    pub pull_queue_id: i64,
    pub volume: Option<String>,
}

#[async_trait]
pub trait RestoreStore: Send + Sync {
    /// Registered row with a known volume, `priority` in `priorities` and
    /// volume not in `excluded`, ordered by `(priority, pull_queue_id)`.
    async fn next_volume(
        &self,
        division: &str,
        priorities: &[u32],
        excluded: &[String],
    ) -> Result<Option<VolumeCandidate>, StoreError>;

    /// Flips every registered row on `volume` to `IN_PROGRESS` (and its file to
    /// `RESTORE_IN_PROGRESS`) and returns the joined detail rows.
    async fn claim_volume(
        &self,
        division: &str,
        volume: &str,
        backup_service: i64,
    ) -> Result<Vec<TaskRecord>, StoreError>;

    async fn registered_at_priority(&self, division: &str, priority: u32)
    -> Result<u64, StoreError>;

    /// Distinct volumes with registered rows.
    async fn pending_volume_count(&self, division: &str) -> Result<u64, StoreError>;

    /// Volumes with rows currently `IN_PROGRESS`.
    async fn in_progress_volumes(&self, division: &str) -> Result<Vec<VolumeCandidate>, StoreError>;

    /// Deletes registered rows for `file_id`; returns how many went.
    async fn delete_registered_for_file(&self, file_id: i64) -> Result<u64, StoreError>;

    /// Up to `limit` registered rows without a volume, backed up to `backup_service`.
    async fn registered_prep_ids(
        &self,
        backup_service: i64,
        limit: usize,
    ) -> Result<Vec<i64>, StoreError>;

    async fn mark_prep_in_progress(&self, ids: &[i64]) -> Result<(), StoreError>;

    /// Rows joined with tar and backup metadata for `backup_service`.
    async fn prep_details(
        &self,
        backup_service: i64,
        ids: &[i64],
    ) -> Result<Vec<TaskRecord>, StoreError>;

    async fn pending_prep_count(&self, backup_service: i64) -> Result<u64, StoreError>;

    /// Applies a worker's report to one of `division`'s rows. `COMPLETE` marks
    /// the file `RESTORED`, `IN_PROGRESS` marks it `RESTORE_IN_PROGRESS`.
    async fn update_pull_row(
        &self,
        division: &str,
        pull_queue_id: i64,
        update: &PullRowUpdate,
    ) -> Result<(), StoreError>;

    /// Moves `division`'s rows in status `from` (and, when given, last
    /// modified before `modified_before`) back to `REGISTERED`, optionally
    /// resetting their files to `file_status`.
    async fn requeue(
        &self,
        division: &str,
        from: RowStatus,
        modified_before: Option<DateTime<Utc>>,
        file_status: Option<FileStatus>,
    ) -> Result<Vec<RequeuedRow>, StoreError>;
}
