//! Priority levels per requested task set, with a round-robin cursor per level.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::domain::QueueName;
use crate::queue::Queue;

/// Cache key: the set of task names a worker asked for, order-insensitive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskSetKey(BTreeSet<QueueName>);

impl TaskSetKey {
    pub fn new(names: impl IntoIterator<Item = QueueName>) -> Self {
        Self(names.into_iter().collect())
    }
}

/// Peer queues of one priority plus where the next scan starts.
#[derive(Clone)]
pub struct LevelSnapshot {
    pub queues: Vec<Arc<Queue>>,
    pub cursor: usize,
}

struct Levels {
    levels: Vec<Vec<Arc<Queue>>>,
    cursors: Vec<usize>,
}

#[derive(Default)]
pub struct LevelCache {
    entries: HashMap<TaskSetKey, Levels>,
}

impl LevelCache {
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Levels for `key`, built from `queues` (already in `(priority, name)`
    /// order) on first use.
    pub fn levels_for(&mut self, key: &TaskSetKey, queues: &[Arc<Queue>]) -> Vec<LevelSnapshot> {
        let entry = self.entries.entry(key.clone()).or_insert_with(|| {
            let mut levels: Vec<Vec<Arc<Queue>>> = Vec::new();
            let mut current: Option<u32> = None;
            for queue in queues.iter().filter(|q| key.0.contains(q.name())) {
                if current != Some(queue.priority()) {
                    current = Some(queue.priority());
                    levels.push(Vec::new());
                }
                if let Some(level) = levels.last_mut() {
                    level.push(Arc::clone(queue));
                }
            }
            let cursors = vec![0; levels.len()];
            Levels { levels, cursors }
        });

        entry
            .levels
            .iter()
            .zip(&entry.cursors)
            .map(|(queues, cursor)| LevelSnapshot {
                queues: queues.clone(),
                cursor: *cursor,
            })
            .collect()
    }

    /// No-op when the entry was dropped by a concurrent `clear`.
    pub fn set_cursor(&mut self, key: &TaskSetKey, level: usize, cursor: usize) {
        if let Some(cursor_slot) = self
            .entries
            .get_mut(key)
            .and_then(|entry| entry.cursors.get_mut(level))
        {
            *cursor_slot = cursor;
        }
    }
}
