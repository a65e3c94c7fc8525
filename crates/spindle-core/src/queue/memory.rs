//! In-memory queue implementation.
//!
//! One queue holds one task type. Records are partitioned by their exact
//! feature signature; each partition is FIFO and partitions are served round
//! robin. Contents are not persisted: a restart reseeds from the catalog.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use super::{Dispatchable, NoHooks, QueueHooks, Selection};
use crate::domain::{FeatureSet, FeatureSignature, QueueName, QueueStatus, Selected, TaskRecord};
use crate::ports::StoreError;

struct Partition {
    features: FeatureSet,
    records: VecDeque<TaskRecord>,
}

/// In-memory queue state.
///
/// Every signature in `partitions` appears exactly once in `round_robin`.
/// `record_count` and `file_size` always equal the sums over all partitions.
#[derive(Default)]
struct QueueState {
    partitions: HashMap<FeatureSignature, Partition>,
    round_robin: Vec<FeatureSignature>,
    cursor: usize,
    record_count: u64,
    file_size: u64,
    currently_running: u64,
}

impl QueueState {
    fn push(&mut self, features: FeatureSet, record: TaskRecord, front: bool) {
        let signature = features.signature();
        if !self.partitions.contains_key(&signature) {
            self.round_robin.push(signature.clone());
        }
        let partition = self.partitions.entry(signature).or_insert_with(|| Partition {
            features,
            records: VecDeque::new(),
        });
        self.record_count += 1;
        self.file_size += record.file_size().unwrap_or(0);
        if front {
            partition.records.push_front(record);
        } else {
            partition.records.push_back(record);
        }
    }

    /// Pops the head of the first eligible partition, starting at the cursor.
    fn pop_eligible(&mut self, available: &[String]) -> Option<(FeatureSet, TaskRecord)> {
        let n = self.round_robin.len();
        for offset in 0..n {
            let at = (self.cursor + offset) % n;
            let Some(partition) = self.partitions.get_mut(&self.round_robin[at]) else {
                continue;
            };
            if partition.records.is_empty() || !partition.features.is_satisfied_by(available) {
                continue;
            }
            self.cursor = (at + 1) % n;
            let record = partition.records.pop_front()?;
            let features = partition.features.clone();
            self.record_count = self.record_count.saturating_sub(1);
            self.file_size = self
                .file_size
                .saturating_sub(record.file_size().unwrap_or(0));
            return Some((features, record));
        }
        None
    }

    fn recount(&mut self) {
        let (count, size) = self
            .partitions
            .values()
            .flat_map(|p| p.records.iter())
            .fold((0u64, 0u64), |(count, size), record| {
                (count + 1, size + record.file_size().unwrap_or(0))
            });
        self.record_count = count;
        self.file_size = size;
    }
}

/// Builder for [`Queue`].
pub struct QueueBuilder {
    name: QueueName,
    priority: u32,
    default_features: FeatureSet,
    hooks: Arc<dyn QueueHooks>,
}

impl QueueBuilder {
    pub fn default_features(mut self, features: FeatureSet) -> Self {
        self.default_features = features;
        self
    }

    pub fn hooks(mut self, hooks: Arc<dyn QueueHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn build(self) -> Queue {
        Queue {
            name: self.name,
            priority: self.priority,
            default_features: self.default_features,
            hooks: self.hooks,
            state: Mutex::new(QueueState::default()),
        }
    }
}

/// Feature-partitioned, round-robin FIFO for one task type.
pub struct Queue {
    name: QueueName,
    priority: u32,
    default_features: FeatureSet,
    hooks: Arc<dyn QueueHooks>,
    state: Mutex<QueueState>,
}

impl Queue {
    pub fn builder(name: impl Into<QueueName>, priority: u32) -> QueueBuilder {
        QueueBuilder {
            name: name.into(),
            priority,
            default_features: FeatureSet::default(),
            hooks: Arc::new(NoHooks),
        }
    }

    pub fn name(&self) -> &QueueName {
        &self.name
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    pub fn default_features(&self) -> &FeatureSet {
        &self.default_features
    }

    fn effective_features(&self, features: &FeatureSet, add_default_features: bool) -> FeatureSet {
        if add_default_features {
            features.with_defaults(&self.default_features)
        } else {
            features.clone()
        }
    }

    pub async fn add(&self, record: TaskRecord, features: &FeatureSet, add_default_features: bool) {
        let features = self.effective_features(features, add_default_features);
        let mut state = self.state.lock().await;
        state.push(features, record, false);
    }

    /// Adds every record with the same features under one lock acquisition.
    pub async fn add_all(
        &self,
        records: impl IntoIterator<Item = TaskRecord>,
        features: &FeatureSet,
        add_default_features: bool,
    ) {
        let features = self.effective_features(features, add_default_features);
        let mut state = self.state.lock().await;
        for record in records {
            state.push(features.clone(), record, false);
        }
    }

    /// Next eligible task, or `None` when nothing pending fits `available`.
    pub async fn next(&self, available: &[String]) -> Result<Option<Selected>, StoreError> {
        loop {
            let popped = self.state.lock().await.pop_eligible(available);
            let Some((features, record)) = popped else {
                return Ok(None);
            };

            let data = match self.hooks.selected(&record).await {
                Ok(Selection::Keep) => record.into_value(),
                Ok(Selection::Replace(replacement)) => replacement.into_value(),
                Ok(Selection::Skip) => {
                    debug!(queue = %self.name, "skipping stale record");
                    continue;
                }
                Err(err) => {
                    // 取り出したレコードを失わないよう先頭に戻す
                    self.state.lock().await.push(features, record, true);
                    return Err(err);
                }
            };

            self.state.lock().await.currently_running += 1;
            return Ok(Some(Selected {
                uses_resources: features,
                data,
            }));
        }
    }

    async fn release(&self) {
        let mut state = self.state.lock().await;
        state.currently_running = state.currently_running.saturating_sub(1);
    }

    pub async fn lost(&self, features: &FeatureSet, data: &Value) -> Result<(), StoreError> {
        self.release().await;
        self.hooks.lost(self, features, data).await
    }

    pub async fn failed(&self, data: &Value) -> Result<(), StoreError> {
        self.release().await;
        self.hooks.failed(self, data).await
    }

    pub async fn finished(&self, data: &Value) -> Result<(), StoreError> {
        self.release().await;
        self.hooks.finished(self, data).await
    }

    /// Recomputes the counters from the partitions. `currently_running` is
    /// zeroed only when the queue is empty.
    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        state.recount();
        if state.record_count == 0 {
            state.currently_running = 0;
        }
    }

    pub async fn status(&self) -> QueueStatus {
        let state = self.state.lock().await;
        QueueStatus {
            record_count: state.record_count,
            file_size: state.file_size,
            currently_running: state.currently_running,
        }
    }

    pub async fn len(&self) -> u64 {
        self.state.lock().await.record_count
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Pending records by feature signature, in round-robin order.
    pub async fn snapshot(&self) -> BTreeMap<String, Vec<Value>> {
        let state = self.state.lock().await;
        state
            .round_robin
            .iter()
            .filter_map(|signature| {
                let partition = state.partitions.get(signature)?;
                let records = partition
                    .records
                    .iter()
                    .map(|r| r.clone().into_value())
                    .collect();
                Some((signature.to_string(), records))
            })
            .collect()
    }
}

#[async_trait]
impl Dispatchable for Queue {
    fn name(&self) -> &QueueName {
        &self.name
    }

    async fn next(&self, available: &[String]) -> Result<Option<Selected>, StoreError> {
        Queue::next(self, available).await
    }

    async fn size(&self) -> Result<u64, StoreError> {
        Ok(self.len().await)
    }
}
