//! Worker fleet - `spindle worker`
//!
//! 1 プロセス = 1 service。register の後に heartbeat タスクと `threads` 本の
//! runner を起動する。runner は nexttask をポーリングし、前回の結果は次の
//! nexttask に相乗りさせて報告する。
//!
//! prep/pull は lease ではなく pull_queue の行で追跡されるので、コマンドの
//! 行報告（なければ終了コードから決めた既定の状態）を行ごとに PUT する。
//! 失った resource は heartbeat ごとに `resources/{division}` を見て、
//! この service の offline 報告が消えたら再び広告する。
//!
//! # 停止
//! shutdown を受けた runner はポーリングをやめ、未報告の結果があれば
//! taskcomplete で明示的に報告してから終わる。

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{RwLock, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use spindle_core::api::{
    NextTaskRequest, PutPullRequest, PutTaskRequest, RegisterServiceRequest, ResourceRequest,
    TaskCompleteRequest, TaskSubmission,
};
use spindle_core::app::OfflineResources;
use spindle_core::domain::{Lease, QueueName, RowStatus, ServiceId};
use spindle_core::ports::PullRowUpdate;

use crate::backoff::PollBackoff;
use crate::client::DispatchClient;
use crate::executor::{Execution, Outcome, TaskExecutor};

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub division: String,
    pub features: Vec<String>,
    pub tasks: Vec<String>,
    pub threads: u32,
    pub backoff: PollBackoff,
    pub heartbeat: Duration,
    pub host: Option<String>,
}

/// Per-runner counters, summed over the fleet when it stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerReport {
    pub succeeded: u64,
    pub failed: u64,
    pub returned: u64,
}

impl WorkerReport {
    fn absorb(&mut self, other: WorkerReport) {
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.returned += other.returned;
    }

    fn record(&mut self, outcome: &Outcome) {
        match outcome {
            Outcome::Success => self.succeeded += 1,
            Outcome::Failed(_) => self.failed += 1,
            Outcome::ResourceLost => self.returned += 1,
        }
    }
}

/// Features currently advertised; a lost backend is dropped until the
/// dispatcher stops listing it offline for this service.
type SharedFeatures = Arc<RwLock<Vec<String>>>;

pub struct Worker {
    client: DispatchClient,
    executor: Arc<dyn TaskExecutor>,
    settings: WorkerSettings,
}

impl Worker {
    pub fn new(
        client: DispatchClient,
        executor: Arc<dyn TaskExecutor>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            client,
            executor,
            settings,
        }
    }

    /// Registers, runs until `shutdown` flips to true, and returns the totals.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<WorkerReport> {
        let service = self
            .client
            .register(&RegisterServiceRequest {
                division: self.settings.division.clone(),
                threads: self.settings.threads,
                host: self.settings.host.clone(),
            })
            .await
            .context("register service")?;
        info!(service, division = %self.settings.division, threads = self.settings.threads, "service registered");

        let settings = Arc::new(self.settings);
        let features: SharedFeatures = Arc::new(RwLock::new(settings.features.clone()));

        let heartbeat = tokio::spawn(heartbeat_loop(
            self.client.clone(),
            Arc::clone(&settings),
            service,
            Arc::clone(&features),
            shutdown.clone(),
        ));

        let mut runners = JoinSet::new();
        for runner in 0..settings.threads.max(1) {
            let ctx = Runner {
                id: runner,
                service,
                client: self.client.clone(),
                executor: Arc::clone(&self.executor),
                settings: Arc::clone(&settings),
                features: Arc::clone(&features),
            };
            runners.spawn(ctx.run(shutdown.clone()));
        }

        let mut report = WorkerReport::default();
        while let Some(joined) = runners.join_next().await {
            match joined {
                Ok(stats) => report.absorb(stats),
                Err(err) => warn!(service, error = %err, "runner panicked"),
            }
        }
        if let Err(err) = heartbeat.await {
            warn!(service, error = %err, "heartbeat task panicked");
        }
        info!(service, ?report, "service stopped");
        Ok(report)
    }
}

async fn heartbeat_loop(
    client: DispatchClient,
    settings: Arc<WorkerSettings>,
    service: ServiceId,
    features: SharedFeatures,
    mut shutdown: watch::Receiver<bool>,
) {
    let division = settings.division.as_str();
    let mut ticker = tokio::time::interval(settings.heartbeat);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                match client.heartbeat(division, service).await {
                    Ok(status) => debug!(service, queues = status.len(), "heartbeat"),
                    Err(err) => warn!(service, error = %format!("{err:#}"), "heartbeat failed"),
                }
                let dropped = features.read().await.len() < settings.features.len();
                if dropped {
                    match client.offline_resources(division).await {
                        Ok(offline) => {
                            let restored =
                                readvertise(&features, &settings.features, &offline, service).await;
                            if !restored.is_empty() {
                                info!(service, resources = ?restored, "resources back online");
                            }
                        }
                        Err(err) => warn!(service, error = %format!("{err:#}"), "resource check failed"),
                    }
                }
            }
        }
    }
}

/// Adds back every configured feature that `service` no longer reports
/// offline, keeping the configured order. Returns the features added.
async fn readvertise(
    features: &SharedFeatures,
    configured: &[String],
    offline: &OfflineResources,
    service: ServiceId,
) -> Vec<String> {
    let mut current = features.write().await;
    let restored: Vec<String> = configured
        .iter()
        .filter(|f| !current.contains(f))
        .filter(|f| !offline.get(*f).is_some_and(|services| services.contains(&service)))
        .cloned()
        .collect();
    if !restored.is_empty() {
        let advertised: Vec<String> = configured
            .iter()
            .filter(|f| current.contains(f) || restored.contains(f))
            .cloned()
            .collect();
        *current = advertised;
    }
    restored
}

struct Runner {
    id: u32,
    service: ServiceId,
    client: DispatchClient,
    executor: Arc<dyn TaskExecutor>,
    settings: Arc<WorkerSettings>,
    features: SharedFeatures,
}

impl Runner {
    async fn run(self, mut shutdown: watch::Receiver<bool>) -> WorkerReport {
        let mut report = WorkerReport::default();
        // (task_id, returned) of the lease not yet reported
        let mut previous: Option<(String, bool)> = None;
        let mut idle_polls = 0u32;

        while !*shutdown.borrow() {
            let req = NextTaskRequest {
                features: self.features.read().await.clone(),
                tasks: self.settings.tasks.clone(),
                division: self.settings.division.clone(),
                service: self.service,
                previous_task_id: previous.as_ref().map(|(id, _)| id.clone()),
                returned: previous.as_ref().is_some_and(|(_, returned)| *returned),
            };

            let lease = match self.client.next_task(&req).await {
                Ok(lease) => {
                    previous = None;
                    lease
                }
                Err(err) => {
                    // completion is idempotent, so `previous` is resent next time
                    warn!(runner = self.id, error = %format!("{err:#}"), "nexttask failed");
                    None
                }
            };

            let Some(lease) = lease else {
                idle_polls = idle_polls.saturating_add(1);
                let delay = self.settings.backoff.next_delay(idle_polls);
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
                continue;
            };
            idle_polls = 0;

            debug!(runner = self.id, task = %lease.task, task_id = ?lease.task_id, "executing");
            let execution = self.executor.execute(&lease).await;
            report.record(&execution.outcome);

            let returned = match &execution.outcome {
                Outcome::ResourceLost => self.give_back(&lease).await,
                Outcome::Failed(reason) => {
                    warn!(runner = self.id, task = %lease.task, %reason, "task failed");
                    false
                }
                Outcome::Success => true,
            };
            if lease.task_id.is_none() {
                self.report_rows(&lease, &execution).await;
            }
            if lease.task.as_str() == QueueName::PULL {
                self.release_volume(&lease).await;
            }
            previous = lease.task_id.map(|id| (id.to_string(), returned));
        }

        if let Some((task_id, returned)) = previous {
            let req = TaskCompleteRequest {
                task_id,
                returned,
                division: self.settings.division.clone(),
            };
            if let Err(err) = self.client.task_complete(&req).await {
                warn!(runner = self.id, error = %format!("{err:#}"), "final taskcomplete failed");
            }
        }
        report
    }

    /// Hands a task back after its backend went away, reports the backend
    /// offline and stops advertising it. Returns the completion flag for the
    /// original lease.
    async fn give_back(&self, lease: &Lease) -> bool {
        let lost: BTreeSet<String> = lease.features.iter().map(str::to_string).collect();
        // prep and pull rows go back to REGISTERED through `report_rows`
        if lease.task_id.is_some() {
            let req = PutTaskRequest {
                task: TaskSubmission {
                    task: lease.task.as_str().to_string(),
                    data: lease.data.clone(),
                    features: lease.features.as_slice().to_vec(),
                    division: lease.division.clone(),
                },
            };
            match self.client.put_task(&req).await {
                Ok(queued) => info!(runner = self.id, task = %lease.task, queued, "task handed back"),
                Err(err) => {
                    warn!(runner = self.id, error = %format!("{err:#}"), "put task failed");
                    return false;
                }
            }
        }

        for resource in &lost {
            let req = ResourceRequest {
                division: self.settings.division.clone(),
                resource: resource.clone(),
                service: self.service,
            };
            if let Err(err) = self.client.resource_offline(&req).await {
                warn!(runner = self.id, %resource, error = %format!("{err:#}"), "resourceoffline failed");
            }
        }
        self.features.write().await.retain(|f| !lost.contains(f));
        info!(runner = self.id, resources = ?lost, "stopped advertising lost resources");
        true
    }

    /// Sends one row update per restore row of `lease`. Rows the command did
    /// not report on get a status from its outcome.
    async fn report_rows(&self, lease: &Lease, execution: &Execution) {
        let mut updates: BTreeMap<i64, PullRowUpdate> = BTreeMap::new();
        let fallback = unreported_status(lease.task.as_str(), &execution.outcome);
        for row in lease.data.as_array().into_iter().flatten() {
            if let Some(id) = row.get("pull_queue_id").and_then(|v| v.as_i64()) {
                updates.insert(id, PullRowUpdate::status(fallback));
            }
        }
        for row in &execution.rows {
            updates.insert(row.pull_queue_id, row.update.clone());
        }

        for (pull_queue_id, update) in updates {
            let req = PutPullRequest {
                division: lease.division.clone(),
                update,
            };
            if let Err(err) = self.client.put_pull(pull_queue_id, &req).await {
                warn!(runner = self.id, pull_queue_id, error = %format!("{err:#}"), "pull row update failed");
            }
        }
    }

    async fn release_volume(&self, lease: &Lease) {
        let volume = lease
            .data
            .as_array()
            .and_then(|rows| rows.first())
            .and_then(|row| row.get("volume"))
            .and_then(|v| v.as_str());
        let Some(volume) = volume else {
            return;
        };
        match self
            .client
            .release_volume(&self.settings.division, volume)
            .await
        {
            Ok(released) => debug!(runner = self.id, volume, released, "volume released"),
            Err(err) => warn!(runner = self.id, volume, error = %format!("{err:#}"), "release volume failed"),
        }
    }
}

/// Status for a restore row the command said nothing about. A prep that
/// never located its file has failed.
fn unreported_status(task: &str, outcome: &Outcome) -> RowStatus {
    match (task, outcome) {
        (_, Outcome::ResourceLost) => RowStatus::Registered,
        (QueueName::PULL, Outcome::Success) => RowStatus::Complete,
        (QueueName::PULL, Outcome::Failed(_)) => RowStatus::Failed,
        _ => RowStatus::PrepFailed,
    }
}
