//! Catalog-backed queue hooks.
//!
//! Selection flips the catalog row to its in-progress status. A lost lease
//! flips it back to ready and puts the record back in the queue.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info};

use crate::domain::{
    BackupRecordStatus, FeatureSet, FileStatus, QueueKind, RowStatus, TaskRecord,
};
use crate::ports::{CatalogStore, StoreError};
use crate::queue::{Queue, QueueHooks, Selection};

pub struct StatusHooks {
    kind: QueueKind,
    catalog: Arc<dyn CatalogStore>,
}

impl StatusHooks {
    pub fn new(kind: QueueKind, catalog: Arc<dyn CatalogStore>) -> Self {
        Self { kind, catalog }
    }

    async fn set_backup_records(
        &self,
        record: &TaskRecord,
        status: BackupRecordStatus,
    ) -> Result<(), StoreError> {
        let ids = record
            .get("backup_records")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(|b| b.get("backup_record_id").and_then(Value::as_i64));
        for id in ids {
            self.catalog.set_backup_record_status(id, status).await?;
        }
        Ok(())
    }

    async fn mark_selected(&self, record: &TaskRecord) -> Result<Selection, StoreError> {
        let file_id = record.get_i64("file_id");
        match (self.kind, file_id) {
            (QueueKind::Copy, Some(id)) => {
                self.catalog
                    .set_file_status(id, FileStatus::CopyInProgress)
                    .await?;
                Ok(Selection::Keep)
            }
            (QueueKind::Tar, Some(id)) => {
                let Some(metadata) = self.catalog.file_metadata(id).await? else {
                    // メタデータのないファイルは tar できない。削除対象にして捨てる
                    info!(file_id = id, "tar skipped, no catalog metadata");
                    self.catalog.set_file_status(id, FileStatus::Delete).await?;
                    return Ok(Selection::Skip);
                };
                self.catalog
                    .set_file_status(id, FileStatus::TarInProgress)
                    .await?;
                let mut joined = record.clone();
                joined.insert("metadata", Value::Object(metadata));
                Ok(Selection::Replace(joined))
            }
            (QueueKind::Put, Some(id)) => {
                self.set_backup_records(record, BackupRecordStatus::TransferInProgress)
                    .await?;
                self.catalog
                    .set_file_status(id, FileStatus::BackupInProgress)
                    .await?;
                Ok(Selection::Keep)
            }
            (QueueKind::Md5, _) => {
                if let Some(id) = record.get_i64("md5_queue_id") {
                    self.catalog.set_md5_status(id, RowStatus::InProgress).await?;
                }
                Ok(Selection::Keep)
            }
            _ => Ok(Selection::Keep),
        }
    }

    /// Puts the catalog row back into the status that made it queueable.
    async fn revert(&self, record: &TaskRecord) -> Result<(), StoreError> {
        let file_id = record.get_i64("file_id");
        match (self.kind, file_id) {
            (QueueKind::Copy, Some(id)) => {
                self.catalog.set_file_status(id, FileStatus::CopyReady).await
            }
            (QueueKind::Tar, Some(id)) => {
                self.catalog.set_file_status(id, FileStatus::TarReady).await
            }
            (QueueKind::Put, Some(id)) => {
                self.set_backup_records(record, BackupRecordStatus::TransferReady)
                    .await?;
                self.catalog.set_file_status(id, FileStatus::BackupReady).await
            }
            (QueueKind::Md5, _) => match record.get_i64("md5_queue_id") {
                Some(id) => self.catalog.set_md5_status(id, RowStatus::Registered).await,
                None => Ok(()),
            },
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl QueueHooks for StatusHooks {
    /// A record whose catalog row has vanished is stale and skipped.
    async fn selected(&self, record: &TaskRecord) -> Result<Selection, StoreError> {
        match self.mark_selected(record).await {
            Err(StoreError::NotFound(row)) => {
                debug!(queue = %self.kind, %row, "catalog row gone, skipping");
                Ok(Selection::Skip)
            }
            other => other,
        }
    }

    async fn lost(
        &self,
        queue: &Queue,
        features: &FeatureSet,
        data: &Value,
    ) -> Result<(), StoreError> {
        let Some(record) = TaskRecord::from_value(data.clone()) else {
            return Ok(());
        };
        match self.revert(&record).await {
            // 行が消えたファイルは戻さない
            Err(StoreError::NotFound(_)) => return Ok(()),
            other => other?,
        }
        queue.add(record, features, false).await;
        Ok(())
    }
}
