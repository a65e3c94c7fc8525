//! PullQueue - tape volume 単位のリストアキュー
//!
//! # 順序
//! ロック取得 → 候補選択と volume lock の予約 → ロック解放 → 行の更新（I/O）
//! の順を守る。予約をロック内で済ませるので、同じ volume が二度選ばれることはない。

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::domain::{FeatureSet, QueueName, Selected};
use crate::ports::{Clock, RestoreStore, StoreError, VolumeCandidate};
use crate::queue::Dispatchable;

/// Priorities always served.
pub const BASE_PRIORITIES: [u32; 2] = [0, 1];

/// Extra priority bands switched on by schedule and off once drained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Band {
    Short,
    Long,
}

impl Band {
    pub fn priorities(self) -> &'static [u32] {
        match self {
            Band::Short => &[2, 3],
            Band::Long => &[4, 5, 6, 7],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VolumeLock {
    pub pull_queue_id: i64,
    pub locked: DateTime<Utc>,
}

#[derive(Default)]
struct PullState {
    volume_locks: BTreeMap<String, VolumeLock>,
    enabled: Vec<u32>,
}

impl PullState {
    fn priorities(&self) -> Vec<u32> {
        let mut priorities: Vec<u32> = BASE_PRIORITIES.iter().chain(&self.enabled).copied().collect();
        priorities.sort_unstable();
        priorities.dedup();
        priorities
    }
}

pub struct PullQueue {
    name: QueueName,
    division: String,
    backup_service: i64,
    default_features: FeatureSet,
    store: Arc<dyn RestoreStore>,
    clock: Arc<dyn Clock>,
    state: Mutex<PullState>,
}

impl PullQueue {
    pub fn new(
        division: impl Into<String>,
        backup_service: i64,
        default_features: FeatureSet,
        store: Arc<dyn RestoreStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            name: QueueName::from(QueueName::PULL),
            division: division.into(),
            backup_service,
            default_features,
            store,
            clock,
            state: Mutex::new(PullState::default()),
        }
    }

    /// Next volume's batch of files, or `None`.
    ///
    /// Only served to callers that advertise one of this queue's features.
    pub async fn next(&self, available: &[String]) -> Result<Option<Selected>, StoreError> {
        if !self.default_features.intersects(available) {
            return Ok(None);
        }

        let candidate = {
            let mut state = self.state.lock().await;
            let priorities = state.priorities();
            let excluded: Vec<String> = state.volume_locks.keys().cloned().collect();
            let Some(candidate) = self
                .store
                .next_volume(&self.division, &priorities, &excluded)
                .await?
            else {
                return Ok(None);
            };
            state.volume_locks.insert(
                candidate.volume.clone(),
                VolumeLock {
                    pull_queue_id: candidate.pull_queue_id,
                    locked: self.clock.now(),
                },
            );
            candidate
        };
        debug!(division = %self.division, volume = %candidate.volume, priority = candidate.priority, "volume locked");

        let records = match self
            .store
            .claim_volume(&self.division, &candidate.volume, self.backup_service)
            .await
        {
            Ok(records) if !records.is_empty() => records,
            Ok(_) => {
                // 選択後に別経路で行が消えた
                self.clear_lock(&candidate.volume).await;
                return Ok(None);
            }
            Err(err) => {
                self.clear_lock(&candidate.volume).await;
                return Err(err);
            }
        };

        self.quiesce_band(candidate.priority).await?;

        Ok(Some(Selected {
            uses_resources: self.default_features.clone(),
            data: Value::Array(records.into_iter().map(Value::from).collect()),
        }))
    }

    /// Turns off an enabled priority once it has nothing registered left.
    async fn quiesce_band(&self, priority: u32) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if !state.enabled.contains(&priority) {
            return Ok(());
        }
        let remaining = self
            .store
            .registered_at_priority(&self.division, priority)
            .await?;
        if remaining == 0 {
            state.enabled.retain(|p| *p != priority);
            info!(division = %self.division, priority, "priority drained, disabled");
        }
        Ok(())
    }

    /// Locks volumes that are already in progress, after a restart.
    pub async fn init_locks(&self, volumes: impl IntoIterator<Item = VolumeCandidate>) {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        for volume in volumes {
            state.volume_locks.insert(
                volume.volume,
                VolumeLock {
                    pull_queue_id: volume.pull_queue_id,
                    locked: now,
                },
            );
        }
    }

    /// Releases a volume. Returns whether it was locked.
    pub async fn clear_lock(&self, volume: &str) -> bool {
        let released = self.state.lock().await.volume_locks.remove(volume).is_some();
        if released {
            debug!(division = %self.division, volume, "volume released");
        }
        released
    }

    pub async fn enable(&self, band: Band) {
        let mut state = self.state.lock().await;
        let mut added = Vec::new();
        for priority in band.priorities() {
            if !state.enabled.contains(priority) {
                state.enabled.push(*priority);
                added.push(*priority);
            }
        }
        if !added.is_empty() {
            info!(division = %self.division, ?band, priorities = ?added, "priority band enabled");
        }
    }

    pub async fn enable_short(&self) {
        self.enable(Band::Short).await;
    }

    pub async fn enable_long(&self) {
        self.enable(Band::Long).await;
    }

    pub async fn enabled_priorities(&self) -> Vec<u32> {
        let mut enabled = self.state.lock().await.enabled.clone();
        enabled.sort_unstable();
        enabled
    }

    pub async fn volume_locks(&self) -> BTreeMap<String, VolumeLock> {
        self.state.lock().await.volume_locks.clone()
    }

    /// Drops registered restores of a file that has been replaced since.
    pub async fn delete_pending_tasks_for_file(&self, file_id: i64) -> Result<u64, StoreError> {
        let _state = self.state.lock().await;
        let deleted = self.store.delete_registered_for_file(file_id).await?;
        if deleted > 0 {
            info!(division = %self.division, file_id, deleted, "pending restores dropped");
        }
        Ok(deleted)
    }

    /// Distinct volumes waiting to be pulled.
    pub async fn pending_count(&self) -> Result<u64, StoreError> {
        self.store.pending_volume_count(&self.division).await
    }
}

#[async_trait]
impl Dispatchable for PullQueue {
    fn name(&self) -> &QueueName {
        &self.name
    }

    async fn next(&self, available: &[String]) -> Result<Option<Selected>, StoreError> {
        PullQueue::next(self, available).await
    }

    async fn size(&self) -> Result<u64, StoreError> {
        self.pending_count().await
    }
}
