//! Dispatcher - ワーカー向けディスパッチプロトコルの実装
//!
//! HTTP 層はこの型のメソッドを 1 対 1 で呼ぶだけ。division の解決、feature の
//! 検証、prep → pull → TaskManager の順の特別扱いはすべてここで行う。

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::Duration;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::api::{
    HeartbeatResponse, NextTaskRequest, PutPullRequest, PutTaskRequest, RegisterServiceRequest,
    ResourceRequest, ResourceResponse, TaskCompleteRequest,
};
use crate::config::SchedulerSettings;
use crate::division::{Division, ReapReport, ResetFailedReport};
use crate::domain::{
    FeatureSet, Lease, LeaseId, QueueKind, QueueName, QueueStatus, SchedulerError, Selected,
    ServiceId, TaskRecord,
};
use crate::manager::ManagerStatus;
use crate::ports::{Clock, StoreError};
use crate::restore::{Band, VolumeLock};

/// resource → services reporting it unreachable.
pub type OfflineResources = BTreeMap<String, BTreeSet<ServiceId>>;

/// Everything `taskstatus` shows for one division.
#[derive(Debug, Clone, Serialize)]
pub struct DivisionStatus {
    #[serde(flatten)]
    pub manager: ManagerStatus,
    pub volume_locks: BTreeMap<String, VolumeLock>,
    pub enabled_priorities: Vec<u32>,
    pub resources_offline: OfflineResources,
}

pub struct Dispatcher {
    divisions: BTreeMap<String, Arc<Division>>,
    settings: SchedulerSettings,
    clock: Arc<dyn Clock>,
    offline: Mutex<BTreeMap<String, OfflineResources>>,
    next_service: AtomicI64,
}

impl Dispatcher {
    pub(crate) fn new(
        divisions: impl IntoIterator<Item = Division>,
        settings: SchedulerSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        // 再起動前に配った service id と重ならないよう起動時刻から数える
        let first_service = clock.now().timestamp_millis().max(1);
        Self {
            divisions: divisions
                .into_iter()
                .map(|d| (d.name().to_string(), Arc::new(d)))
                .collect(),
            settings,
            clock,
            offline: Mutex::new(BTreeMap::new()),
            next_service: AtomicI64::new(first_service),
        }
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    pub fn division(&self, name: &str) -> Result<&Arc<Division>, SchedulerError> {
        self.divisions
            .get(name)
            .ok_or_else(|| SchedulerError::UnknownDivision(name.to_string()))
    }

    pub fn divisions(&self) -> impl Iterator<Item = &Arc<Division>> {
        self.divisions.values()
    }

    /// NextTask: completes `previous_task_id`, then serves prep, pull, and
    /// finally the priority ladder.
    pub async fn next_task(&self, req: NextTaskRequest) -> Result<Option<Lease>, SchedulerError> {
        let division = self.division(&req.division)?;
        let available = FeatureSet::new(req.features)?.as_slice().to_vec();
        let tasks = parse_tasks(&req.tasks)?;

        if let Some(previous) = req.previous_task_id.as_deref()
            && let Some(task_id) = parse_lease_id(previous)
        {
            division
                .task_manager()
                .set_task_complete(task_id, req.returned)
                .await;
        }

        let wants = |name: &str| tasks.iter().any(|t| t.as_str() == name);
        if wants(QueueName::PREP)
            && let Some(selected) = division.prep().next(&available).await?
        {
            return Ok(Some(self.store_lease(division, QueueName::PREP, selected, req.service)));
        }
        if wants(QueueName::PULL)
            && let Some(selected) = division.pull().next(&available).await?
        {
            return Ok(Some(self.store_lease(division, QueueName::PULL, selected, req.service)));
        }

        let memory: Vec<QueueName> = tasks
            .into_iter()
            .filter(|t| t.as_str() != QueueName::PREP && t.as_str() != QueueName::PULL)
            .collect();
        if memory.is_empty() {
            return Ok(None);
        }
        Ok(division
            .task_manager()
            .get_task(&available, &memory, None, req.service)
            .await?)
    }

    /// Prep and pull batches are tracked by their store rows, not by a lease.
    fn store_lease(
        &self,
        division: &Division,
        task: &str,
        selected: Selected,
        service: ServiceId,
    ) -> Lease {
        let records = match (task, &selected.data) {
            (QueueName::PULL, Value::Array(files)) => Some(files.len()),
            _ => None,
        };
        debug!(division = %division.name(), queue = task, service, ?records, "restore batch issued");
        Lease {
            task: QueueName::from(task),
            data: selected.data,
            task_id: None,
            features: selected.uses_resources,
            service,
            created: self.clock.now(),
            division: division.name().to_string(),
            records,
        }
    }

    /// Explicit completion. Unknown or malformed ids return `false`.
    pub async fn task_complete(&self, req: TaskCompleteRequest) -> Result<bool, SchedulerError> {
        let division = self.division(&req.division)?;
        let Some(task_id) = parse_lease_id(&req.task_id) else {
            return Ok(false);
        };
        Ok(division
            .task_manager()
            .set_task_complete(task_id, req.returned)
            .await)
    }

    /// Puts work back on a memory queue. Returns how many records were queued.
    pub async fn put_task(&self, req: PutTaskRequest) -> Result<usize, SchedulerError> {
        let submission = req.task;
        let division = self.division(&submission.division)?;
        let queue = division
            .queue(&submission.task)
            .await
            .ok_or_else(|| SchedulerError::UnknownQueue(submission.task.clone()))?;
        let features = FeatureSet::new(submission.features)?;
        let records = records_of(submission.data)?;

        let add_default = !features.iter().any(|f| division.router().is_remote_feature(f));
        let queued = records.len();
        queue.add_all(records, &features, add_default).await;
        info!(division = %division.name(), queue = %submission.task, queued, "task returned to queue");
        Ok(queued)
    }

    /// Records a prep or pull result for one restore row.
    pub async fn put_pull(
        &self,
        pull_queue_id: i64,
        req: PutPullRequest,
    ) -> Result<(), SchedulerError> {
        let division = self.division(&req.division)?;
        match division.update_pull_row(pull_queue_id, &req.update).await {
            Err(StoreError::NotFound(_)) => Err(SchedulerError::UnknownPullRow(pull_queue_id)),
            other => Ok(other?),
        }
    }

    pub async fn register_service(
        &self,
        req: RegisterServiceRequest,
    ) -> Result<ServiceId, SchedulerError> {
        let division = self.division(&req.division)?;
        let service = self.next_service.fetch_add(1, Ordering::Relaxed);
        info!(division = %division.name(), service, threads = req.threads, host = ?req.host, "service registered");
        division
            .task_manager()
            .add_service(service, req.threads, req.host)
            .await;
        Ok(service)
    }

    /// Heartbeat; prep reports pending rows and pull pending volumes.
    pub async fn heartbeat(
        &self,
        division: &str,
        service: ServiceId,
    ) -> Result<HeartbeatResponse, SchedulerError> {
        let division = self.division(division)?;
        let mut summary = division.task_manager().heartbeat(service).await;
        summary.insert(
            QueueName::from(QueueName::PREP),
            QueueStatus::pending(division.prep().pending_count().await?),
        );
        summary.insert(
            QueueName::from(QueueName::PULL),
            QueueStatus::pending(division.pull().pending_count().await?),
        );
        Ok(summary)
    }

    pub async fn resource_offline(
        &self,
        req: ResourceRequest,
    ) -> Result<ResourceResponse, SchedulerError> {
        self.division(&req.division)?;
        let mut offline = self.offline.lock().await;
        let services = offline
            .entry(req.division.clone())
            .or_default()
            .entry(req.resource.clone())
            .or_default();
        if services.insert(req.service) {
            warn!(division = %req.division, resource = %req.resource, service = req.service, "resource reported offline");
        }
        Ok(ResourceResponse {
            resource: req.resource,
            services: services.iter().copied().collect(),
        })
    }

    /// Clears one service's offline report; the rest are returned.
    pub async fn resource_online(
        &self,
        req: ResourceRequest,
    ) -> Result<ResourceResponse, SchedulerError> {
        self.division(&req.division)?;
        let mut offline = self.offline.lock().await;
        let mut remaining = Vec::new();
        if let Some(resources) = offline.get_mut(&req.division)
            && let Some(services) = resources.get_mut(&req.resource)
        {
            services.remove(&req.service);
            remaining = services.iter().copied().collect();
            if services.is_empty() {
                resources.remove(&req.resource);
                info!(division = %req.division, resource = %req.resource, "resource back online");
            }
        }
        Ok(ResourceResponse {
            resource: req.resource,
            services: remaining,
        })
    }

    pub async fn offline_resources(&self, division: &str) -> Result<OfflineResources, SchedulerError> {
        self.division(division)?;
        Ok(self
            .offline
            .lock()
            .await
            .get(division)
            .cloned()
            .unwrap_or_default())
    }

    pub async fn release_volume(&self, division: &str, volume: &str) -> Result<bool, SchedulerError> {
        Ok(self.division(division)?.pull().clear_lock(volume).await)
    }

    /// Turns `band` on and returns every extra priority now enabled.
    pub async fn enable_band(&self, division: &str, band: Band) -> Result<Vec<u32>, SchedulerError> {
        let pull = self.division(division)?.pull();
        pull.enable(band).await;
        Ok(pull.enabled_priorities().await)
    }

    /// Turns `band` on in every division.
    pub async fn enable_band_everywhere(&self, band: Band) {
        for division in self.divisions() {
            division.pull().enable(band).await;
        }
    }

    pub async fn delete_pending_restores(
        &self,
        division: &str,
        file_id: i64,
    ) -> Result<u64, SchedulerError> {
        Ok(self
            .division(division)?
            .pull()
            .delete_pending_tasks_for_file(file_id)
            .await?)
    }

    /// Full status per division, optionally recounting the queues first.
    pub async fn task_status(&self, reset: bool) -> BTreeMap<String, DivisionStatus> {
        let offline = self.offline.lock().await.clone();
        let mut out = BTreeMap::new();
        for division in self.divisions() {
            let manager = division.task_manager();
            if reset {
                manager.reset().await;
            }
            out.insert(
                division.name().to_string(),
                DivisionStatus {
                    manager: manager.get_status().await,
                    volume_locks: division.pull().volume_locks().await,
                    enabled_priorities: division.pull().enabled_priorities().await,
                    resources_offline: offline.get(division.name()).cloned().unwrap_or_default(),
                },
            );
        }
        out
    }

    /// Pending records of every memory queue, by feature signature.
    pub async fn task_list(
        &self,
        division: &str,
    ) -> Result<BTreeMap<QueueName, BTreeMap<String, Vec<Value>>>, SchedulerError> {
        let division = self.division(division)?;
        let mut out = BTreeMap::new();
        for queue in division.task_manager().queues().await {
            out.insert(queue.name().clone(), queue.snapshot().await);
        }
        Ok(out)
    }

    pub async fn reset_failed(&self, division: &str) -> Result<ResetFailedReport, SchedulerError> {
        Ok(self.division(division)?.reset_failed().await?)
    }

    /// One reclamation pass over every division. A failing division is
    /// logged and skipped.
    pub async fn reap(&self) -> BTreeMap<String, ReapReport> {
        let prep_stale = Duration::seconds(secs(self.settings.prep_stale_secs));
        let pull_stale = Duration::seconds(secs(self.settings.pull_stale_secs));
        let mut out = BTreeMap::new();
        for division in self.divisions() {
            match division.reap(prep_stale, pull_stale).await {
                Ok(report) => {
                    out.insert(division.name().to_string(), report);
                }
                Err(err) => {
                    warn!(division = %division.name(), error = %err, "reap failed");
                }
            }
        }
        out
    }
}

fn secs(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Task names a worker may ask for: the memory queue kinds plus prep and pull.
fn parse_tasks(tasks: &[String]) -> Result<Vec<QueueName>, SchedulerError> {
    tasks
        .iter()
        .map(|name| {
            let known = QueueKind::from_name(name).is_some()
                || name == QueueName::PREP
                || name == QueueName::PULL;
            if known {
                Ok(QueueName::new(name.as_str()))
            } else {
                Err(SchedulerError::UnknownQueue(name.clone()))
            }
        })
        .collect()
}

/// A malformed id can never name a live lease, so it is treated as unknown.
fn parse_lease_id(raw: &str) -> Option<LeaseId> {
    match raw.parse() {
        Ok(id) => Some(id),
        Err(err) => {
            debug!(task_id = raw, error = %err, "unparseable task id ignored");
            None
        }
    }
}

fn records_of(data: Value) -> Result<Vec<TaskRecord>, SchedulerError> {
    let items = match data {
        Value::Array(items) => items,
        other => vec![other],
    };
    items
        .into_iter()
        .map(|item| {
            TaskRecord::from_value(item)
                .ok_or_else(|| SchedulerError::MalformedData("task data must be an object".into()))
        })
        .collect()
}
