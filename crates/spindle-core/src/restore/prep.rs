//! PrepQueue - tape 上の位置（volume/position）を引くためのバッチキュー

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use crate::domain::{FeatureSet, QueueName, Selected};
use crate::ports::{RestoreStore, StoreError};
use crate::queue::Dispatchable;

pub const DEFAULT_BATCH_SIZE: usize = 1000;

pub struct PrepQueue {
    name: QueueName,
    backup_service: i64,
    default_features: FeatureSet,
    batch_size: usize,
    store: Arc<dyn RestoreStore>,
    lock: Mutex<()>,
}

impl PrepQueue {
    pub fn new(
        backup_service: i64,
        default_features: FeatureSet,
        batch_size: usize,
        store: Arc<dyn RestoreStore>,
    ) -> Self {
        Self {
            name: QueueName::from(QueueName::PREP),
            backup_service,
            default_features,
            batch_size,
            store,
            lock: Mutex::new(()),
        }
    }

    /// Claims up to `batch_size` unlocated rows and returns their details.
    pub async fn next(&self, available: &[String]) -> Result<Option<Selected>, StoreError> {
        if !self.default_features.intersects(available) {
            return Ok(None);
        }

        let ids = {
            let _guard = self.lock.lock().await;
            let ids = self
                .store
                .registered_prep_ids(self.backup_service, self.batch_size)
                .await?;
            if !ids.is_empty() {
                self.store.mark_prep_in_progress(&ids).await?;
            }
            ids
        };
        if ids.is_empty() {
            return Ok(None);
        }
        debug!(backup_service = self.backup_service, rows = ids.len(), "prep batch claimed");

        let details = self.store.prep_details(self.backup_service, &ids).await?;
        Ok(Some(Selected {
            uses_resources: self.default_features.clone(),
            data: Value::Array(details.into_iter().map(Value::from).collect()),
        }))
    }

    pub async fn pending_count(&self) -> Result<u64, StoreError> {
        self.store.pending_prep_count(self.backup_service).await
    }
}

#[async_trait]
impl Dispatchable for PrepQueue {
    fn name(&self) -> &QueueName {
        &self.name
    }

    async fn next(&self, available: &[String]) -> Result<Option<Selected>, StoreError> {
        PrepQueue::next(self, available).await
    }

    async fn size(&self) -> Result<u64, StoreError> {
        self.pending_count().await
    }
}
