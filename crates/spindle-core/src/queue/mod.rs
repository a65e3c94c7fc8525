//! Queue module: the dispatch seam shared by every queue kind, the hooks a
//! queue calls around selection and completion, and the in-memory queue.

mod memory;

pub use memory::{Queue, QueueBuilder};

use async_trait::async_trait;
use serde_json::Value;

use crate::domain::{FeatureSet, QueueName, Selected, TaskRecord};
use crate::ports::StoreError;

/// Anything a worker can pull work from.
///
/// Implemented by the in-memory [`Queue`] and by the store-backed pull and prep
/// queues. `next` never blocks waiting for work; callers poll.
#[async_trait]
pub trait Dispatchable: Send + Sync {
    fn name(&self) -> &QueueName;

    async fn next(&self, available: &[String]) -> Result<Option<Selected>, StoreError>;

    /// Pending work, in the queue's own unit (records or volumes).
    async fn size(&self) -> Result<u64, StoreError>;
}

/// Outcome of the selection hook.
#[derive(Debug, Clone, PartialEq)]
pub enum Selection {
    /// Hand out the record unchanged.
    Keep,
    /// Hand out this record instead.
    Replace(TaskRecord),
    /// The record went stale; drop it and try the next candidate.
    Skip,
}

/// Callbacks a [`Queue`] runs around selection and lease completion.
///
/// Every method has a no-op default. The queue never holds its own lock while
/// a hook runs, so hooks may call back into the queue (e.g. `add` on lost).
#[async_trait]
pub trait QueueHooks: Send + Sync {
    async fn selected(&self, _record: &TaskRecord) -> Result<Selection, StoreError> {
        Ok(Selection::Keep)
    }

    async fn lost(
        &self,
        _queue: &Queue,
        _features: &FeatureSet,
        _data: &Value,
    ) -> Result<(), StoreError> {
        Ok(())
    }

    async fn failed(&self, _queue: &Queue, _data: &Value) -> Result<(), StoreError> {
        Ok(())
    }

    async fn finished(&self, _queue: &Queue, _data: &Value) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Hooks for queues that need none.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHooks;

impl QueueHooks for NoHooks {}
