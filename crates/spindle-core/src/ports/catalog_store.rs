//! CatalogStore port - ファイル/バックアップ記録の永続ストア
//!
//! memory queue の起動時シードと、queue hook からのステータス更新に使う。
//! スケジューラ自体はカタログの内容を解釈しない。

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::domain::{BackupRecordStatus, FileStatus, QueueKind, RowStatus, TaskRecord};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("store backend error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Records that should sit in the `kind` queue of `division` at startup.
    async fn pending_records(
        &self,
        division: &str,
        kind: QueueKind,
    ) -> Result<Vec<TaskRecord>, StoreError>;

    async fn set_file_status(&self, file_id: i64, status: FileStatus) -> Result<(), StoreError>;

    /// Catalog metadata for the file, `None` when the file has none.
    async fn file_metadata(&self, file_id: i64) -> Result<Option<Map<String, Value>>, StoreError>;

    async fn set_md5_status(&self, md5_queue_id: i64, status: RowStatus) -> Result<(), StoreError>;

    async fn set_backup_record_status(
        &self,
        backup_record_id: i64,
        status: BackupRecordStatus,
    ) -> Result<(), StoreError>;
}
