//! TaskManager - 優先度つきラウンドロビンのスケジューラ
//!
//! # 責務
//! - queue を (priority, name) 順に並べ、同じ priority の queue 同士でラウンドロビン
//! - feature ごとの同時実行数（max_resources）を守る
//! - 発行した lease と worker service の heartbeat を管理し、途絶えた service の lease を回収
//!
//! # ロック
//! 自分の state のロックを握ったまま queue を呼ばない（queue 側にも独自のロックがある）。
//! そのため quota の判定から lease 記録までの間に別リクエストが割り込むと、
//! max_resources を一時的に 1 件超えることがある。

mod levels;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::Duration;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use self::levels::{LevelCache, TaskSetKey};
use crate::domain::{
    FeatureSet, Lease, LeaseId, QueueName, QueueStatus, ServiceId, ServiceInfo,
};
use crate::ports::{Clock, IdGenerator, StoreError};
use crate::queue::Queue;

/// Observability view returned by [`TaskManager::get_status`].
#[derive(Debug, Clone, Serialize)]
pub struct ManagerStatus {
    pub tasks: BTreeMap<QueueName, QueueStatus>,
    pub current_used_resources: BTreeMap<String, u64>,
    pub current_tasks: Vec<Lease>,
    pub services: BTreeMap<ServiceId, ServiceInfo>,
}

/// Result of one [`TaskManager::monitor_lost_tasks`] pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LostReport {
    pub services: Vec<ServiceId>,
    pub leases: Vec<LeaseId>,
}

#[derive(Default)]
struct ManagerState {
    queues: Vec<Arc<Queue>>,
    by_name: HashMap<QueueName, Arc<Queue>>,
    levels: LevelCache,
    leases: HashMap<LeaseId, Lease>,
    resource_counts: BTreeMap<String, u64>,
    services: BTreeMap<ServiceId, ServiceInfo>,
}

impl ManagerState {
    fn useable_resources(&self, has_resources: &[String], max: &BTreeMap<String, u64>) -> Vec<String> {
        has_resources
            .iter()
            .filter(|resource| match max.get(resource.as_str()) {
                Some(limit) => self.resource_counts.get(resource.as_str()).copied().unwrap_or(0) < *limit,
                None => true,
            })
            .cloned()
            .collect()
    }

    fn acquire(&mut self, features: &FeatureSet) {
        for feature in features.iter() {
            *self.resource_counts.entry(feature.to_string()).or_insert(0) += 1;
        }
    }

    fn release(&mut self, features: &FeatureSet) {
        for feature in features.iter() {
            if let Some(count) = self.resource_counts.get_mut(feature) {
                *count = count.saturating_sub(1);
            }
        }
    }
}

pub struct TaskManager {
    division: String,
    max_resources: BTreeMap<String, u64>,
    heartbeat_timeout: Duration,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    state: Mutex<ManagerState>,
}

impl TaskManager {
    pub fn new(
        division: impl Into<String>,
        max_resources: BTreeMap<String, u64>,
        heartbeat_timeout: Duration,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
    ) -> Self {
        Self {
            division: division.into(),
            max_resources,
            heartbeat_timeout,
            clock,
            ids,
            state: Mutex::new(ManagerState::default()),
        }
    }

    pub fn division(&self) -> &str {
        &self.division
    }

    /// Replaces the managed queues, ordered by `(priority, name)`.
    ///
    /// The level cache is dropped, so a changed queue set takes effect on the
    /// next request.
    pub async fn set_queues(&self, queues: impl IntoIterator<Item = Arc<Queue>>) {
        let mut queues: Vec<Arc<Queue>> = queues.into_iter().collect();
        queues.sort_by(|a, b| (a.priority(), a.name()).cmp(&(b.priority(), b.name())));

        let mut state = self.state.lock().await;
        state.by_name = queues
            .iter()
            .map(|q| (q.name().clone(), Arc::clone(q)))
            .collect();
        state.queues = queues;
        state.levels.clear();
    }

    pub async fn queue(&self, name: &str) -> Option<Arc<Queue>> {
        self.state.lock().await.by_name.get(name).cloned()
    }

    pub async fn queues(&self) -> Vec<Arc<Queue>> {
        self.state.lock().await.queues.clone()
    }

    /// Hands out the next task the caller may run, or `None`.
    ///
    /// `previous` is the caller's last lease and whether it succeeded; it is
    /// completed before any queue is consulted.
    pub async fn get_task(
        &self,
        has_resources: &[String],
        has_tasks: &[QueueName],
        previous: Option<(LeaseId, bool)>,
        service: ServiceId,
    ) -> Result<Option<Lease>, StoreError> {
        if let Some((task_id, returned)) = previous {
            self.set_task_complete(task_id, returned).await;
        }

        let key = TaskSetKey::new(has_tasks.iter().cloned());
        let (useable, levels) = {
            let mut state = self.state.lock().await;
            let useable = state.useable_resources(has_resources, &self.max_resources);
            let queues = state.queues.clone();
            let levels = state.levels.levels_for(&key, &queues);
            (useable, levels)
        };

        for (level, snapshot) in levels.iter().enumerate() {
            let len = snapshot.queues.len();
            for offset in 0..len {
                let getting = (snapshot.cursor + offset) % len;
                let queue = &snapshot.queues[getting];
                if queue.is_empty().await {
                    continue;
                }
                self.state
                    .lock()
                    .await
                    .levels
                    .set_cursor(&key, level, getting + 1);

                let Some(selected) = queue.next(&useable).await? else {
                    continue;
                };

                let lease = Lease {
                    task: queue.name().clone(),
                    data: selected.data,
                    task_id: Some(self.ids.generate_lease_id()),
                    features: selected.uses_resources,
                    service,
                    created: self.clock.now(),
                    division: self.division.clone(),
                    records: None,
                };
                let mut state = self.state.lock().await;
                state.acquire(&lease.features);
                if let Some(task_id) = lease.task_id {
                    state.leases.insert(task_id, lease.clone());
                    debug!(division = %self.division, queue = %lease.task, %task_id, service, "lease issued");
                }
                return Ok(Some(lease));
            }
        }
        Ok(None)
    }

    /// Completes a lease. Unknown ids (already completed or reclaimed) are a
    /// no-op and return `false`.
    pub async fn set_task_complete(&self, task_id: LeaseId, returned: bool) -> bool {
        let (lease, queue) = {
            let mut state = self.state.lock().await;
            let Some(lease) = state.leases.remove(&task_id) else {
                debug!(division = %self.division, %task_id, "completion for unknown lease ignored");
                return false;
            };
            state.release(&lease.features);
            let queue = state.by_name.get(&lease.task).cloned();
            (lease, queue)
        };

        debug!(division = %self.division, queue = %lease.task, %task_id, returned, "lease completed");
        if let Some(queue) = queue {
            let outcome = if returned {
                queue.finished(&lease.data).await
            } else {
                queue.failed(&lease.data).await
            };
            if let Err(err) = outcome {
                warn!(division = %self.division, queue = %lease.task, %task_id, error = %err, "completion hook failed");
            }
        }
        true
    }

    pub async fn add_service(&self, service: ServiceId, threads: u32, host: Option<String>) {
        let now = self.clock.now();
        self.state.lock().await.services.insert(
            service,
            ServiceInfo {
                started: now,
                heartbeat: now,
                threads,
                host,
            },
        );
    }

    /// Records a liveness beat and returns every queue's counters.
    pub async fn heartbeat(&self, service: ServiceId) -> BTreeMap<QueueName, QueueStatus> {
        let now = self.clock.now();
        {
            let mut state = self.state.lock().await;
            state
                .services
                .entry(service)
                .and_modify(|info| info.heartbeat = now)
                .or_insert(ServiceInfo {
                    started: now,
                    heartbeat: now,
                    threads: 0,
                    host: None,
                });
        }
        self.get_short_status().await
    }

    /// Drops services silent for at least the heartbeat timeout and marks
    /// each of their leases lost exactly once.
    pub async fn monitor_lost_tasks(&self) -> LostReport {
        let now = self.clock.now();
        let (report, reclaimed) = {
            let mut state = self.state.lock().await;
            let lost_services: Vec<ServiceId> = state
                .services
                .iter()
                .filter(|(_, info)| now - info.heartbeat >= self.heartbeat_timeout)
                .map(|(id, _)| *id)
                .collect();
            if lost_services.is_empty() {
                return LostReport::default();
            }
            for service in &lost_services {
                state.services.remove(service);
            }

            let lost_ids: Vec<LeaseId> = state
                .leases
                .iter()
                .filter(|(_, lease)| lost_services.contains(&lease.service))
                .map(|(id, _)| *id)
                .collect();
            let mut reclaimed = Vec::with_capacity(lost_ids.len());
            for task_id in &lost_ids {
                if let Some(lease) = state.leases.remove(task_id) {
                    state.release(&lease.features);
                    let queue = state.by_name.get(&lease.task).cloned();
                    reclaimed.push((lease, queue));
                }
            }
            (
                LostReport {
                    services: lost_services,
                    leases: lost_ids,
                },
                reclaimed,
            )
        };

        info!(
            division = %self.division,
            services = ?report.services,
            leases = report.leases.len(),
            "reclaiming leases of silent services"
        );
        for (lease, queue) in reclaimed {
            let Some(queue) = queue else { continue };
            if let Err(err) = queue.lost(&lease.features, &lease.data).await {
                warn!(division = %self.division, queue = %lease.task, error = %err, "lost hook failed");
            }
        }
        report
    }

    pub async fn get_short_status(&self) -> BTreeMap<QueueName, QueueStatus> {
        let queues = self.queues().await;
        let mut out = BTreeMap::new();
        for queue in queues {
            out.insert(queue.name().clone(), queue.status().await);
        }
        out
    }

    pub async fn get_status(&self) -> ManagerStatus {
        let tasks = self.get_short_status().await;
        let state = self.state.lock().await;
        let mut current_tasks: Vec<Lease> = state.leases.values().cloned().collect();
        current_tasks.sort_by_key(|lease| lease.task_id);
        ManagerStatus {
            tasks,
            current_used_resources: state.resource_counts.clone(),
            current_tasks,
            services: state.services.clone(),
        }
    }

    /// Recounts every queue.
    pub async fn reset(&self) {
        for queue in self.queues().await {
            queue.reset().await;
        }
    }

    /// Data and features of an outstanding lease.
    pub async fn lease(&self, task_id: LeaseId) -> Option<(FeatureSet, Value)> {
        let state = self.state.lock().await;
        state
            .leases
            .get(&task_id)
            .map(|lease| (lease.features.clone(), lease.data.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TaskRecord;
    use crate::ports::{FixedClock, UlidGenerator};
    use crate::queue::{QueueHooks, Selection};
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    struct Fixture {
        clock: Arc<FixedClock>,
        manager: TaskManager,
    }

    fn fixture(max_resources: &[(&str, u64)]) -> Fixture {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap(),
        ));
        let shared: Arc<dyn Clock> = clock.clone();
        let manager = TaskManager::new(
            "jgi",
            max_resources
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect(),
            Duration::seconds(600),
            shared.clone(),
            Arc::new(UlidGenerator::new(shared)),
        );
        Fixture { clock, manager }
    }

    fn features(tags: &[&str]) -> FeatureSet {
        FeatureSet::new(tags.iter().copied()).unwrap()
    }

    fn strings(tags: &[&str]) -> Vec<String> {
        tags.iter().map(|t| t.to_string()).collect()
    }

    fn names(tags: &[&str]) -> Vec<QueueName> {
        tags.iter().map(|t| QueueName::from(*t)).collect()
    }

    fn record(id: i64) -> TaskRecord {
        TaskRecord::from_value(json!({ "file_id": id })).unwrap()
    }

    async fn queue_with(name: &str, priority: u32, ids: &[i64], tags: &[&str]) -> Arc<Queue> {
        let queue = Arc::new(Queue::builder(name, priority).build());
        for id in ids {
            queue.add(record(*id), &features(tags), true).await;
        }
        queue
    }

    #[tokio::test]
    async fn lower_priority_number_is_served_first() {
        let f = fixture(&[]);
        let copy = queue_with("copy", 2, &[1], &[]).await;
        let tar = queue_with("tar", 3, &[2], &[]).await;
        f.manager.set_queues([tar, copy]).await;

        let tasks = names(&["copy", "tar"]);
        let first = f.manager.get_task(&[], &tasks, None, 1).await.unwrap().unwrap();
        let second = f.manager.get_task(&[], &tasks, None, 1).await.unwrap().unwrap();
        assert_eq!(first.task.as_str(), "copy");
        assert_eq!(second.task.as_str(), "tar");
        assert!(f.manager.get_task(&[], &tasks, None, 1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn priority_wins_over_round_robin_turn() {
        let f = fixture(&[]);
        let ingest = queue_with("ingest", 0, &[1, 2, 3], &[]).await;
        let purge = queue_with("purge", 4, &[10], &[]).await;
        f.manager.set_queues([ingest, purge]).await;

        let tasks = names(&["ingest", "purge"]);
        for _ in 0..3 {
            let lease = f.manager.get_task(&[], &tasks, None, 1).await.unwrap().unwrap();
            assert_eq!(lease.task.as_str(), "ingest");
        }
        let lease = f.manager.get_task(&[], &tasks, None, 1).await.unwrap().unwrap();
        assert_eq!(lease.task.as_str(), "purge");
    }

    #[tokio::test]
    async fn peers_at_one_priority_alternate() {
        let f = fixture(&[]);
        let purge = queue_with("purge", 4, &[1, 2], &[]).await;
        let delete = queue_with("delete", 4, &[3, 4], &[]).await;
        f.manager.set_queues([purge, delete]).await;

        let tasks = names(&["purge", "delete"]);
        let mut order = Vec::new();
        for _ in 0..4 {
            let lease = f.manager.get_task(&[], &tasks, None, 1).await.unwrap().unwrap();
            order.push(lease.task.to_string());
        }
        assert_eq!(order, vec!["delete", "purge", "delete", "purge"]);
    }

    #[tokio::test]
    async fn queues_outside_has_tasks_are_never_consulted() {
        let f = fixture(&[]);
        let copy = queue_with("copy", 2, &[1], &[]).await;
        f.manager.set_queues([copy]).await;

        assert!(f.manager.get_task(&[], &names(&["tar"]), None, 1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn quota_blocks_until_the_lease_completes() {
        let f = fixture(&[("hsi_1", 1)]);
        let put = queue_with("put", 5, &[1, 2], &["hsi_1"]).await;
        f.manager.set_queues([put]).await;

        let tasks = names(&["put"]);
        let hsi = strings(&["hsi_1"]);
        let first = f.manager.get_task(&hsi, &tasks, None, 1).await.unwrap().unwrap();
        assert!(f.manager.get_task(&hsi, &tasks, None, 1).await.unwrap().is_none());

        let second = f
            .manager
            .get_task(&hsi, &tasks, first.task_id.map(|id| (id, true)), 1)
            .await
            .unwrap();
        assert!(second.is_some());
    }

    #[tokio::test]
    async fn resource_counts_follow_outstanding_leases() {
        let f = fixture(&[]);
        let put = queue_with("put", 5, &[1, 2, 3], &["hsi_1", "dna_w"]).await;
        f.manager.set_queues([put]).await;

        let tasks = names(&["put"]);
        let avail = strings(&["hsi_1", "dna_w"]);
        let a = f.manager.get_task(&avail, &tasks, None, 1).await.unwrap().unwrap();
        let b = f.manager.get_task(&avail, &tasks, None, 2).await.unwrap().unwrap();
        let _c = f.manager.get_task(&avail, &tasks, None, 2).await.unwrap().unwrap();

        let used = f.manager.get_status().await.current_used_resources;
        assert_eq!(used["hsi_1"], 3);
        assert_eq!(used["dna_w"], 3);

        f.manager.set_task_complete(a.task_id.unwrap(), true).await;
        f.manager.set_task_complete(b.task_id.unwrap(), false).await;
        let status = f.manager.get_status().await;
        assert_eq!(status.current_used_resources["hsi_1"], 1);
        assert_eq!(status.current_tasks.len(), 1);
    }

    #[derive(Default)]
    struct Journal {
        events: StdMutex<Vec<String>>,
    }

    impl Journal {
        fn push(&self, event: String) {
            self.events.lock().unwrap().push(event);
        }

        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl QueueHooks for Journal {
        async fn selected(&self, record: &TaskRecord) -> Result<Selection, StoreError> {
            self.push(format!("selected {}", record.get_i64("file_id").unwrap_or(0)));
            Ok(Selection::Keep)
        }

        async fn lost(&self, _: &Queue, _: &FeatureSet, data: &Value) -> Result<(), StoreError> {
            self.push(format!("lost {}", data["file_id"]));
            Ok(())
        }

        async fn failed(&self, _: &Queue, data: &Value) -> Result<(), StoreError> {
            self.push(format!("failed {}", data["file_id"]));
            Ok(())
        }

        async fn finished(&self, _: &Queue, data: &Value) -> Result<(), StoreError> {
            self.push(format!("finished {}", data["file_id"]));
            Ok(())
        }
    }

    async fn journaled(f: &Fixture, ids: &[i64]) -> Arc<Journal> {
        let journal = Arc::new(Journal::default());
        let queue = Arc::new(Queue::builder("copy", 2).hooks(journal.clone()).build());
        for id in ids {
            queue.add(record(*id), &FeatureSet::default(), true).await;
        }
        f.manager.set_queues([queue]).await;
        journal
    }

    #[tokio::test]
    async fn failed_previous_is_completed_before_the_next_pick() {
        let f = fixture(&[]);
        let journal = journaled(&f, &[1, 2]).await;
        let tasks = names(&["copy"]);

        let first = f.manager.get_task(&[], &tasks, None, 1).await.unwrap().unwrap();
        let first_id = first.task_id.unwrap();
        f.manager
            .get_task(&[], &tasks, Some((first_id, false)), 1)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(journal.events(), vec!["selected 1", "failed 1", "selected 2"]);
        assert!(f.manager.lease(first_id).await.is_none());
    }

    #[tokio::test]
    async fn completing_an_unknown_lease_is_a_no_op() {
        let f = fixture(&[]);
        let journal = journaled(&f, &[1]).await;
        let lease = f
            .manager
            .get_task(&[], &names(&["copy"]), None, 1)
            .await
            .unwrap()
            .unwrap();
        let id = lease.task_id.unwrap();

        assert!(f.manager.set_task_complete(id, true).await);
        assert!(!f.manager.set_task_complete(id, true).await);
        assert_eq!(journal.events(), vec!["selected 1", "finished 1"]);
    }

    #[tokio::test]
    async fn silent_services_lose_their_leases_exactly_once() {
        let f = fixture(&[]);
        let journal = journaled(&f, &[1, 2]).await;
        let tasks = names(&["copy"]);

        f.manager.add_service(7, 2, Some("dtn01".into())).await;
        f.manager.add_service(8, 1, None).await;
        let dead = f.manager.get_task(&[], &tasks, None, 7).await.unwrap().unwrap();
        let alive = f.manager.get_task(&[], &tasks, None, 8).await.unwrap().unwrap();

        f.clock.advance(Duration::seconds(599));
        f.manager.heartbeat(8).await;
        assert_eq!(f.manager.monitor_lost_tasks().await, LostReport::default());

        f.clock.advance(Duration::seconds(1));
        let report = f.manager.monitor_lost_tasks().await;
        assert_eq!(report.services, vec![7]);
        assert_eq!(report.leases, vec![dead.task_id.unwrap()]);

        assert_eq!(f.manager.monitor_lost_tasks().await, LostReport::default());
        let status = f.manager.get_status().await;
        assert!(!status.services.contains_key(&7));
        assert_eq!(status.current_tasks.len(), 1);
        assert_eq!(status.current_tasks[0].task_id, alive.task_id);
        assert_eq!(
            journal.events().iter().filter(|e| e.starts_with("lost")).count(),
            1
        );

        // 回収済み lease の完了報告は無視される
        assert!(!f.manager.set_task_complete(dead.task_id.unwrap(), true).await);
    }

    #[tokio::test]
    async fn heartbeat_reports_every_queue() {
        let f = fixture(&[]);
        let copy = queue_with("copy", 2, &[1, 2], &[]).await;
        let tar = queue_with("tar", 3, &[], &[]).await;
        f.manager.set_queues([copy, tar]).await;

        let summary = f.manager.heartbeat(3).await;
        assert_eq!(summary[&QueueName::from("copy")].record_count, 2);
        assert_eq!(summary[&QueueName::from("tar")], QueueStatus::default());
        assert!(f.manager.get_status().await.services.contains_key(&3));
    }

    #[tokio::test]
    async fn set_queues_invalidates_cached_levels() {
        let f = fixture(&[]);
        let copy = queue_with("copy", 2, &[], &[]).await;
        f.manager.set_queues([copy.clone()]).await;
        let tasks = names(&["copy", "tar"]);
        assert!(f.manager.get_task(&[], &tasks, None, 1).await.unwrap().is_none());

        let tar = queue_with("tar", 3, &[9], &[]).await;
        f.manager.set_queues([copy, tar]).await;
        let lease = f.manager.get_task(&[], &tasks, None, 1).await.unwrap().unwrap();
        assert_eq!(lease.task.as_str(), "tar");
    }
}
