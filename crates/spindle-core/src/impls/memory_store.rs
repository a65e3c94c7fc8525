//! InMemoryArchiveStore - 開発・テスト用のカタログ + pull_queue ストア
//!
//! 本番ではリレーショナル DB が正本になる。ここでは同じ問い合わせを
//! テーブル相当の Vec に対して行う。`StoreSnapshot` は JSON から読み込める
//! ので、`spindle serve --seed` で任意の初期状態から起動できる。

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tokio::sync::Mutex;

use crate::domain::{BackupRecordStatus, FileStatus, QueueKind, RowStatus, TaskRecord};
use crate::ports::{
    CatalogStore, Clock, PullRowUpdate, RequeuedRow, RestoreStore, StoreError, VolumeCandidate,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRow {
    pub file_id: i64,
    pub division: String,
    pub status: FileStatus,
    #[serde(default)]
    pub file_size: u64,
    pub file_path: String,
    pub file_name: String,
    #[serde(default)]
    pub origin_file_path: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    /// Catalog metadata joined into tar tasks.
    #[serde(default)]
    pub metadata: Option<Map<String, Value>>,
}

impl FileRow {
    fn to_record(&self) -> TaskRecord {
        let mut record = TaskRecord::default();
        record.insert("file_id", self.file_id);
        record.insert("division", self.division.clone());
        record.insert("file_size", self.file_size);
        record.insert("file_path", self.file_path.clone());
        record.insert("file_name", self.file_name.clone());
        if let Some(origin) = &self.origin_file_path {
            record.insert("origin_file_path", origin.clone());
        }
        if let Some(source) = &self.source {
            record.insert("source", source.clone());
        }
        record
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupRow {
    pub backup_record_id: i64,
    pub file_id: i64,
    pub service: i64,
    pub status: BackupRecordStatus,
    #[serde(default)]
    pub remote_file_path: Option<String>,
    #[serde(default)]
    pub remote_file_name: Option<String>,
    #[serde(default)]
    pub tar_record_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TarRow {
    pub tar_record_id: i64,
    pub remote_path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullRow {
    pub pull_queue_id: i64,
    pub file_id: i64,
    pub status: RowStatus,
    pub priority: u32,
    #[serde(default)]
    pub volume: Option<String>,
    #[serde(default)]
    pub position_a: Option<i64>,
    #[serde(default)]
    pub position_b: Option<i64>,
    #[serde(default)]
    pub tar_record_id: Option<i64>,
    #[serde(default)]
    pub requestor: Option<String>,
    #[serde(default)]
    pub dt_modified: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Md5Row {
    pub md5_queue_id: i64,
    pub file_id: i64,
    pub division: String,
    pub status: RowStatus,
    pub file_path: String,
    #[serde(default)]
    pub file_size: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestRow {
    pub file_ingest_id: i64,
    pub division: String,
    pub status: FileStatus,
    #[serde(rename = "_file")]
    pub file: String,
    #[serde(default)]
    pub source: Option<String>,
}

/// Whole store contents; the `--seed` file format.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    #[serde(default)]
    pub files: Vec<FileRow>,
    #[serde(default)]
    pub backup_records: Vec<BackupRow>,
    #[serde(default)]
    pub tar_records: Vec<TarRow>,
    #[serde(default)]
    pub pull_queue: Vec<PullRow>,
    #[serde(default)]
    pub md5_queue: Vec<Md5Row>,
    #[serde(default)]
    pub file_ingest: Vec<IngestRow>,
}

impl StoreSnapshot {
    fn file(&self, file_id: i64) -> Option<&FileRow> {
        self.files.iter().find(|f| f.file_id == file_id)
    }

    fn file_mut(&mut self, file_id: i64) -> Option<&mut FileRow> {
        self.files.iter_mut().find(|f| f.file_id == file_id)
    }

    fn in_division(&self, row: &PullRow, division: &str) -> bool {
        self.file(row.file_id)
            .is_some_and(|file| file.division == division)
    }

    fn backed_up_to(&self, file_id: i64, service: i64) -> Option<&BackupRow> {
        self.backup_records
            .iter()
            .find(|b| b.file_id == file_id && b.service == service)
    }

    fn remote_path(&self, tar_record_id: Option<i64>) -> Option<&str> {
        let id = tar_record_id?;
        self.tar_records
            .iter()
            .find(|t| t.tar_record_id == id)
            .map(|t| t.remote_path.as_str())
    }
}

pub struct InMemoryArchiveStore {
    tables: Mutex<StoreSnapshot>,
    clock: Arc<dyn Clock>,
}

impl InMemoryArchiveStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::from_snapshot(StoreSnapshot::default(), clock)
    }

    pub fn from_snapshot(snapshot: StoreSnapshot, clock: Arc<dyn Clock>) -> Self {
        Self {
            tables: Mutex::new(snapshot),
            clock,
        }
    }

    pub async fn snapshot(&self) -> StoreSnapshot {
        self.tables.lock().await.clone()
    }

    pub async fn file_status(&self, file_id: i64) -> Option<FileStatus> {
        self.tables.lock().await.file(file_id).map(|f| f.status)
    }

    pub async fn pull_row(&self, pull_queue_id: i64) -> Option<PullRow> {
        let tables = self.tables.lock().await;
        tables
            .pull_queue
            .iter()
            .find(|r| r.pull_queue_id == pull_queue_id)
            .cloned()
    }

    pub async fn insert_pull(&self, row: PullRow) {
        self.tables.lock().await.pull_queue.push(row);
    }
}

#[async_trait]
impl CatalogStore for InMemoryArchiveStore {
    async fn pending_records(
        &self,
        division: &str,
        kind: QueueKind,
    ) -> Result<Vec<TaskRecord>, StoreError> {
        let tables = self.tables.lock().await;
        let files_in = |status: FileStatus| -> Vec<TaskRecord> {
            tables
                .files
                .iter()
                .filter(|f| f.division == division && f.status == status)
                .map(FileRow::to_record)
                .collect()
        };

        let records = match kind {
            QueueKind::Ingest => tables
                .file_ingest
                .iter()
                .filter(|r| r.division == division && r.status == FileStatus::Registered)
                .filter_map(|r| {
                    let mut value = json!({
                        "file_ingest_id": r.file_ingest_id,
                        "_file": r.file,
                    });
                    if let Some(source) = &r.source {
                        value["source"] = json!(source);
                    }
                    TaskRecord::from_value(value)
                })
                .collect(),
            QueueKind::Copy => files_in(FileStatus::CopyReady),
            QueueKind::Tar => files_in(FileStatus::TarReady),
            QueueKind::Purge => files_in(FileStatus::PurgeReady),
            QueueKind::Delete => Vec::new(),
            QueueKind::Put => tables
                .files
                .iter()
                .filter(|f| f.division == division && f.status == FileStatus::BackupReady)
                .filter_map(|f| {
                    let backups: Vec<Value> = tables
                        .backup_records
                        .iter()
                        .filter(|b| {
                            b.file_id == f.file_id && b.status == BackupRecordStatus::TransferReady
                        })
                        .map(|b| json!({"backup_record_id": b.backup_record_id, "service": b.service}))
                        .collect();
                    if backups.is_empty() {
                        return None;
                    }
                    let mut record = f.to_record();
                    record.insert("backup_records", backups);
                    Some(record)
                })
                .collect(),
            QueueKind::Md5 => tables
                .md5_queue
                .iter()
                .filter(|m| m.division == division && m.status == RowStatus::Registered)
                .filter_map(|m| {
                    TaskRecord::from_value(json!({
                        "md5_queue_id": m.md5_queue_id,
                        "file_id": m.file_id,
                        "file_path": m.file_path,
                        "file_size": m.file_size,
                    }))
                })
                .collect(),
        };
        Ok(records)
    }

    async fn set_file_status(&self, file_id: i64, status: FileStatus) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        let file = tables
            .file_mut(file_id)
            .ok_or_else(|| StoreError::NotFound(format!("file_id={file_id}")))?;
        file.status = status;
        Ok(())
    }

    async fn file_metadata(&self, file_id: i64) -> Result<Option<Map<String, Value>>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables.file(file_id).and_then(|f| f.metadata.clone()))
    }

    async fn set_md5_status(&self, md5_queue_id: i64, status: RowStatus) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        let row = tables
            .md5_queue
            .iter_mut()
            .find(|m| m.md5_queue_id == md5_queue_id)
            .ok_or_else(|| StoreError::NotFound(format!("md5_queue_id={md5_queue_id}")))?;
        row.status = status;
        Ok(())
    }

    async fn set_backup_record_status(
        &self,
        backup_record_id: i64,
        status: BackupRecordStatus,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        let row = tables
            .backup_records
            .iter_mut()
            .find(|b| b.backup_record_id == backup_record_id)
            .ok_or_else(|| StoreError::NotFound(format!("backup_record_id={backup_record_id}")))?;
        row.status = status;
        Ok(())
    }
}

#[async_trait]
impl RestoreStore for InMemoryArchiveStore {
    async fn next_volume(
        &self,
        division: &str,
        priorities: &[u32],
        excluded: &[String],
    ) -> Result<Option<VolumeCandidate>, StoreError> {
        let tables = self.tables.lock().await;
        let best = tables
            .pull_queue
            .iter()
            .filter(|r| r.status == RowStatus::Registered && priorities.contains(&r.priority))
            .filter(|r| r.volume.as_ref().is_some_and(|v| !excluded.contains(v)))
            .filter(|r| tables.in_division(r, division))
            .min_by_key(|r| (r.priority, r.pull_queue_id));
        Ok(best.and_then(|r| {
            Some(VolumeCandidate {
                pull_queue_id: r.pull_queue_id,
                volume: r.volume.clone()?,
                priority: r.priority,
            })
        }))
    }

    async fn claim_volume(
        &self,
        division: &str,
        volume: &str,
        backup_service: i64,
    ) -> Result<Vec<TaskRecord>, StoreError> {
        let now = self.clock.now();
        let mut tables = self.tables.lock().await;
        let claimed: Vec<usize> = tables
            .pull_queue
            .iter()
            .enumerate()
            .filter(|(_, r)| {
                r.status == RowStatus::Registered
                    && r.volume.as_deref() == Some(volume)
                    && tables.in_division(r, division)
            })
            .map(|(i, _)| i)
            .collect();

        let mut details = Vec::with_capacity(claimed.len());
        for index in claimed {
            let row = {
                let row = &mut tables.pull_queue[index];
                row.status = RowStatus::InProgress;
                row.dt_modified = Some(now);
                row.clone()
            };
            if let Some(file) = tables.file_mut(row.file_id) {
                file.status = FileStatus::RestoreInProgress;
            }

            let file = tables.file(row.file_id);
            let backup = tables.backup_records.iter().find(|b| {
                b.file_id == row.file_id && b.service == backup_service
            });
            let tar_record_id = backup.and_then(|b| b.tar_record_id);
            let detail = json!({
                "pull_queue_id": row.pull_queue_id,
                "volume": row.volume,
                "position_a": row.position_a,
                "position_b": row.position_b,
                "requestor": row.requestor,
                "priority": row.priority,
                "file_path": file.map(|f| f.file_path.clone()),
                "file_name": file.map(|f| f.file_name.clone()),
                "division": division,
                "service": backup.map(|b| b.service),
                "backup_record_id": backup.map(|b| b.backup_record_id),
                "remote_file_path": backup.and_then(|b| b.remote_file_path.clone()),
                "remote_file_name": backup.and_then(|b| b.remote_file_name.clone()),
                "tar_record_id": tar_record_id,
                "remote_path": tables.remote_path(tar_record_id),
            });
            details.extend(TaskRecord::from_value(detail));
        }
        Ok(details)
    }

    async fn registered_at_priority(
        &self,
        division: &str,
        priority: u32,
    ) -> Result<u64, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .pull_queue
            .iter()
            .filter(|r| r.status == RowStatus::Registered && r.priority == priority)
            .filter(|r| tables.in_division(r, division))
            .count() as u64)
    }

    async fn pending_volume_count(&self, division: &str) -> Result<u64, StoreError> {
        let tables = self.tables.lock().await;
        let volumes: BTreeSet<&str> = tables
            .pull_queue
            .iter()
            .filter(|r| r.status == RowStatus::Registered && tables.in_division(r, division))
            .filter_map(|r| r.volume.as_deref())
            .collect();
        Ok(volumes.len() as u64)
    }

    async fn in_progress_volumes(&self, division: &str) -> Result<Vec<VolumeCandidate>, StoreError> {
        let tables = self.tables.lock().await;
        let mut volumes: BTreeMap<String, VolumeCandidate> = BTreeMap::new();
        for row in tables
            .pull_queue
            .iter()
            .filter(|r| r.status == RowStatus::InProgress && tables.in_division(r, division))
        {
            let Some(volume) = &row.volume else { continue };
            volumes.entry(volume.clone()).or_insert(VolumeCandidate {
                pull_queue_id: row.pull_queue_id,
                volume: volume.clone(),
                priority: row.priority,
            });
        }
        Ok(volumes.into_values().collect())
    }

    async fn delete_registered_for_file(&self, file_id: i64) -> Result<u64, StoreError> {
        let mut tables = self.tables.lock().await;
        let before = tables.pull_queue.len();
        tables
            .pull_queue
            .retain(|r| !(r.file_id == file_id && r.status == RowStatus::Registered));
        Ok((before - tables.pull_queue.len()) as u64)
    }

    async fn registered_prep_ids(
        &self,
        backup_service: i64,
        limit: usize,
    ) -> Result<Vec<i64>, StoreError> {
        let tables = self.tables.lock().await;
        let mut ids: Vec<i64> = tables
            .pull_queue
            .iter()
            .filter(|r| r.status == RowStatus::Registered && r.volume.is_none())
            .filter(|r| tables.backed_up_to(r.file_id, backup_service).is_some())
            .map(|r| r.pull_queue_id)
            .collect();
        ids.sort_unstable();
        ids.truncate(limit);
        Ok(ids)
    }

    async fn mark_prep_in_progress(&self, ids: &[i64]) -> Result<(), StoreError> {
        let now = self.clock.now();
        let mut tables = self.tables.lock().await;
        for row in tables
            .pull_queue
            .iter_mut()
            .filter(|r| ids.contains(&r.pull_queue_id))
        {
            row.status = RowStatus::PrepInProgress;
            row.dt_modified = Some(now);
        }
        Ok(())
    }

    async fn prep_details(
        &self,
        backup_service: i64,
        ids: &[i64],
    ) -> Result<Vec<TaskRecord>, StoreError> {
        let tables = self.tables.lock().await;
        let details = tables
            .pull_queue
            .iter()
            .filter(|r| ids.contains(&r.pull_queue_id))
            .filter_map(|r| {
                let backup = tables.backed_up_to(r.file_id, backup_service)?;
                let tar_record_id = r.tar_record_id.or(backup.tar_record_id);
                TaskRecord::from_value(json!({
                    "pull_queue_id": r.pull_queue_id,
                    "tar_record_id": tar_record_id,
                    "remote_path": tables.remote_path(tar_record_id),
                    "remote_file_path": backup.remote_file_path,
                    "remote_file_name": backup.remote_file_name,
                    "service": backup.service,
                }))
            })
            .collect();
        Ok(details)
    }

    async fn pending_prep_count(&self, backup_service: i64) -> Result<u64, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .pull_queue
            .iter()
            .filter(|r| r.status == RowStatus::Registered && r.volume.is_none())
            .filter(|r| tables.backed_up_to(r.file_id, backup_service).is_some())
            .count() as u64)
    }

    async fn update_pull_row(
        &self,
        division: &str,
        pull_queue_id: i64,
        update: &PullRowUpdate,
    ) -> Result<(), StoreError> {
        let now = self.clock.now();
        let mut tables = self.tables.lock().await;
        let index = tables
            .pull_queue
            .iter()
            .position(|r| r.pull_queue_id == pull_queue_id && tables.in_division(r, division))
            .ok_or_else(|| StoreError::NotFound(format!("pull_queue_id={pull_queue_id}")))?;

        let file_id = {
            let row = &mut tables.pull_queue[index];
            row.status = update.status;
            if let Some(volume) = &update.volume {
                row.volume = Some(volume.clone());
            }
            if let Some(position) = update.position_a {
                row.position_a = Some(position);
            }
            if let Some(position) = update.position_b {
                row.position_b = Some(position);
            }
            row.dt_modified = Some(now);
            row.file_id
        };

        let file_status = match update.status {
            RowStatus::Complete => Some(FileStatus::Restored),
            RowStatus::InProgress => Some(FileStatus::RestoreInProgress),
            _ => None,
        };
        if let Some(status) = file_status
            && let Some(file) = tables.file_mut(file_id)
        {
            file.status = status;
        }
        Ok(())
    }

    async fn requeue(
        &self,
        division: &str,
        from: RowStatus,
        modified_before: Option<DateTime<Utc>>,
        file_status: Option<FileStatus>,
    ) -> Result<Vec<RequeuedRow>, StoreError> {
        let now = self.clock.now();
        let mut tables = self.tables.lock().await;
        let matching: Vec<usize> = tables
            .pull_queue
            .iter()
            .enumerate()
            .filter(|(_, r)| r.status == from && tables.in_division(r, division))
            .filter(|(_, r)| match (modified_before, r.dt_modified) {
                (Some(cutoff), Some(modified)) => modified < cutoff,
                (Some(_), None) => true,
                (None, _) => true,
            })
            .map(|(i, _)| i)
            .collect();

        let mut requeued = Vec::with_capacity(matching.len());
        for index in matching {
            let (file_id, row) = {
                let row = &mut tables.pull_queue[index];
                row.status = RowStatus::Registered;
                row.dt_modified = Some(now);
                (
                    row.file_id,
                    RequeuedRow {
                        pull_queue_id: row.pull_queue_id,
                        volume: row.volume.clone(),
                    },
                )
            };
            if let Some(status) = file_status
                && let Some(file) = tables.file_mut(file_id)
            {
                file.status = status;
            }
            requeued.push(row);
        }
        Ok(requeued)
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use crate::ports::FixedClock;
    use chrono::Duration;

    fn store(snapshot: StoreSnapshot) -> (Arc<FixedClock>, InMemoryArchiveStore) {
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let store = InMemoryArchiveStore::from_snapshot(snapshot, clock.clone());
        (clock, store)
    }

    #[tokio::test]
    async fn next_volume_orders_by_priority_then_id_and_skips_excluded() {
        let (_, store) = store(StoreSnapshot {
            files: (1..=4).map(|id| file(id, "jgi", FileStatus::RestoreRegistered)).collect(),
            pull_queue: vec![
                pull(10, 1, 1, Some("VOL_B")),
                pull(11, 2, 0, Some("VOL_C")),
                pull(12, 3, 0, Some("VOL_A")),
                pull(13, 4, 0, None),
            ],
            ..Default::default()
        });

        let best = store.next_volume("jgi", &[0, 1], &[]).await.unwrap().unwrap();
        assert_eq!((best.pull_queue_id, best.volume.as_str()), (11, "VOL_C"));

        let next = store
            .next_volume("jgi", &[0, 1], &["VOL_C".into(), "VOL_A".into()])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next.volume, "VOL_B");
        assert!(store.next_volume("other", &[0, 1], &[]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_volume_flips_rows_and_files() {
        let (_, store) = store(StoreSnapshot {
            files: (1..=2).map(|id| file(id, "jgi", FileStatus::RestoreRegistered)).collect(),
            backup_records: vec![backup(100, 1, 1)],
            pull_queue: vec![pull(10, 1, 0, Some("VOL")), pull(11, 2, 0, Some("VOL"))],
            ..Default::default()
        });

        let details = store.claim_volume("jgi", "VOL", 1).await.unwrap();
        assert_eq!(details.len(), 2);
        assert_eq!(details[0].get_i64("backup_record_id"), Some(100));
        assert_eq!(store.pull_row(10).await.unwrap().status, RowStatus::InProgress);
        assert_eq!(store.file_status(2).await, Some(FileStatus::RestoreInProgress));
        assert_eq!(store.pending_volume_count("jgi").await.unwrap(), 0);
        assert_eq!(store.in_progress_volumes("jgi").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn requeue_respects_age_cutoff() {
        let (clock, store) = store(StoreSnapshot {
            files: (1..=2).map(|id| file(id, "jgi", FileStatus::RestoreInProgress)).collect(),
            pull_queue: vec![pull(10, 1, 0, Some("VOL")), pull(11, 2, 0, Some("VOL2"))],
            ..Default::default()
        });
        store.claim_volume("jgi", "VOL", 1).await.unwrap();
        clock.advance(Duration::hours(4));
        store.claim_volume("jgi", "VOL2", 1).await.unwrap();

        let cutoff = clock.now() - Duration::hours(3);
        let requeued = store
            .requeue("jgi", RowStatus::InProgress, Some(cutoff), Some(FileStatus::RestoreRegistered))
            .await
            .unwrap();
        assert_eq!(
            requeued,
            vec![RequeuedRow {
                pull_queue_id: 10,
                volume: Some("VOL".into())
            }]
        );
        assert_eq!(store.file_status(1).await, Some(FileStatus::RestoreRegistered));
        assert_eq!(store.pull_row(11).await.unwrap().status, RowStatus::InProgress);
    }

    #[tokio::test]
    async fn row_updates_locate_and_finish_restores() {
        let (_, store) = store(StoreSnapshot {
            files: vec![
                file(1, "jgi", FileStatus::RestoreRegistered),
                file(2, "other", FileStatus::RestoreRegistered),
            ],
            pull_queue: vec![pull(10, 1, 0, None), pull(11, 2, 0, None)],
            ..Default::default()
        });

        let located = PullRowUpdate {
            status: RowStatus::Registered,
            volume: Some("AU2972".into()),
            position_a: Some(427),
            position_b: Some(1_351_567),
        };
        store.update_pull_row("jgi", 10, &located).await.unwrap();
        let row = store.pull_row(10).await.unwrap();
        assert_eq!(row.volume.as_deref(), Some("AU2972"));
        assert_eq!((row.position_a, row.position_b), (Some(427), Some(1_351_567)));
        assert_eq!(store.file_status(1).await, Some(FileStatus::RestoreRegistered));

        store
            .update_pull_row("jgi", 10, &PullRowUpdate::status(RowStatus::Complete))
            .await
            .unwrap();
        let row = store.pull_row(10).await.unwrap();
        assert_eq!(row.status, RowStatus::Complete);
        assert_eq!(row.volume.as_deref(), Some("AU2972"));
        assert_eq!(store.file_status(1).await, Some(FileStatus::Restored));

        let foreign = store
            .update_pull_row("jgi", 11, &PullRowUpdate::status(RowStatus::Complete))
            .await;
        assert!(matches!(foreign, Err(StoreError::NotFound(_))));
        assert_eq!(store.file_status(2).await, Some(FileStatus::RestoreRegistered));
    }

    #[tokio::test]
    async fn prep_candidates_are_scoped_to_the_backup_service() {
        let (_, store) = store(StoreSnapshot {
            files: (1..=3).map(|id| file(id, "jgi", FileStatus::RestoreRegistered)).collect(),
            backup_records: vec![backup(100, 1, 1), backup(101, 2, 2), backup(102, 3, 1)],
            pull_queue: vec![pull(10, 1, 0, None), pull(11, 2, 0, None), pull(12, 3, 0, None)],
            ..Default::default()
        });

        assert_eq!(store.pending_prep_count(1).await.unwrap(), 2);
        assert_eq!(store.registered_prep_ids(1, 1).await.unwrap(), vec![10]);
        assert_eq!(store.registered_prep_ids(1, 10).await.unwrap(), vec![10, 12]);
    }

    #[tokio::test]
    async fn put_seed_joins_transfer_ready_backups() {
        let mut ready = backup(100, 1, 1);
        ready.status = BackupRecordStatus::TransferReady;
        let (_, store) = store(StoreSnapshot {
            files: vec![
                file(1, "jgi", FileStatus::BackupReady),
                file(2, "jgi", FileStatus::BackupReady),
            ],
            backup_records: vec![ready],
            ..Default::default()
        });

        let records = store.pending_records("jgi", QueueKind::Put).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].get("backup_records").unwrap()[0]["backup_record_id"], 100);
    }

    #[tokio::test]
    async fn snapshot_parses_from_json() {
        let raw = r#"{
            "files": [{"file_id": 1, "division": "jgi", "status": "COPY_READY",
                       "file_path": "/a", "file_name": "b"}],
            "pull_queue": [{"pull_queue_id": 5, "file_id": 1, "status": "REGISTERED", "priority": 0}]
        }"#;
        let snapshot: StoreSnapshot = serde_json::from_str(raw).unwrap();
        assert_eq!(snapshot.files[0].status, FileStatus::CopyReady);
        assert_eq!(snapshot.pull_queue[0].volume, None);
    }

    #[tokio::test]
    async fn shipped_seed_feeds_the_queues() {
        let snapshot: StoreSnapshot =
            serde_json::from_str(include_str!("../../../../config/seed.json")).unwrap();
        let (_, store) = store(snapshot);
        assert_eq!(store.pending_records("jgi", QueueKind::Copy).await.unwrap().len(), 1);
        assert_eq!(store.pending_records("jgi", QueueKind::Put).await.unwrap().len(), 1);
        assert_eq!(store.pending_records("jgi", QueueKind::Md5).await.unwrap().len(), 1);
        assert_eq!(store.pending_volume_count("jgi").await.unwrap(), 1);
    }
}
