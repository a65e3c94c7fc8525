//! Division - 1 つの division が持つキュー一式
//!
//! memory queue 7 本（ingest/copy/tar/purge/delete/put/md5）を TaskManager に、
//! store-backed の prep/pull を別枠で持つ。起動時にカタログから memory queue を
//! 埋め直し、IN_PROGRESS の volume から pull の lock を復元する。

mod hooks;
mod router;

pub use self::hooks::StatusHooks;
pub use self::router::FeatureRouter;

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Duration;
use tracing::{debug, info, warn};

use crate::config::{DivisionConfig, SchedulerSettings};
use crate::domain::{FeatureSet, FileStatus, QueueKind, QueueName, RowStatus, SchedulerError};
use crate::manager::{LostReport, TaskManager};
use crate::ports::{CatalogStore, Clock, IdGenerator, PullRowUpdate, RestoreStore, StoreError};
use crate::queue::Queue;
use crate::restore::{PrepQueue, PullQueue};

/// Outcome of one reclamation pass over a division.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapReport {
    pub lost: LostReport,
    pub prep_requeued: usize,
    pub pull_requeued: usize,
    pub unlocked_volumes: Vec<String>,
}

/// Rows moved back to `REGISTERED` by an admin reset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct ResetFailedReport {
    pub failed: usize,
    pub prep_failed: usize,
}

pub struct Division {
    name: String,
    manager: TaskManager,
    prep: PrepQueue,
    pull: PullQueue,
    router: Arc<FeatureRouter>,
    restore: Arc<dyn RestoreStore>,
    clock: Arc<dyn Clock>,
}

impl Division {
    /// Builds the division's queues and seeds them from the stores.
    pub async fn open(
        config: &DivisionConfig,
        settings: &SchedulerSettings,
        router: Arc<FeatureRouter>,
        catalog: Arc<dyn CatalogStore>,
        restore: Arc<dyn RestoreStore>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
    ) -> Result<Self, SchedulerError> {
        let manager = TaskManager::new(
            config.name.clone(),
            config.max_resources.clone(),
            Duration::seconds(secs(settings.heartbeat_timeout_secs)),
            Arc::clone(&clock),
            ids,
        );

        let mut queues = Vec::with_capacity(QueueKind::ALL.len());
        for kind in QueueKind::ALL {
            let queue = Queue::builder(kind.name(), kind.priority())
                .default_features(config.features_for(kind.name())?)
                .hooks(Arc::new(StatusHooks::new(kind, Arc::clone(&catalog))))
                .build();
            let seeded = seed(&queue, kind, &config.name, &router, catalog.as_ref()).await?;
            if seeded > 0 {
                info!(division = %config.name, queue = %kind, records = seeded, "queue seeded");
            }
            queues.push(Arc::new(queue));
        }
        manager.set_queues(queues).await;

        let prep = PrepQueue::new(
            config.default_backup_service,
            config.features_for(QueueName::PREP)?,
            settings.prep_batch_size,
            Arc::clone(&restore),
        );
        let pull = PullQueue::new(
            config.name.clone(),
            config.default_backup_service,
            config.features_for(QueueName::PULL)?,
            Arc::clone(&restore),
            Arc::clone(&clock),
        );
        pull.init_locks(restore.in_progress_volumes(&config.name).await?)
            .await;

        Ok(Self {
            name: config.name.clone(),
            manager,
            prep,
            pull,
            router,
            restore,
            clock,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn task_manager(&self) -> &TaskManager {
        &self.manager
    }

    pub fn prep(&self) -> &PrepQueue {
        &self.prep
    }

    pub fn pull(&self) -> &PullQueue {
        &self.pull
    }

    pub fn router(&self) -> &FeatureRouter {
        &self.router
    }

    pub async fn queue(&self, name: &str) -> Option<Arc<Queue>> {
        self.manager.queue(name).await
    }

    /// Records a worker's prep or pull result for one row. Rows that leave
    /// `PREP_IN_PROGRESS`/`IN_PROGRESS` this way are no longer reaped.
    pub async fn update_pull_row(
        &self,
        pull_queue_id: i64,
        update: &PullRowUpdate,
    ) -> Result<(), StoreError> {
        self.restore
            .update_pull_row(&self.name, pull_queue_id, update)
            .await?;
        debug!(
            division = %self.name,
            pull_queue_id,
            status = ?update.status,
            volume = ?update.volume,
            "restore row updated"
        );
        Ok(())
    }

    /// Reclaims lost leases and stale restore rows.
    pub async fn reap(
        &self,
        prep_stale: Duration,
        pull_stale: Duration,
    ) -> Result<ReapReport, StoreError> {
        let lost = self.manager.monitor_lost_tasks().await;
        let now = self.clock.now();

        let prep = self
            .restore
            .requeue(&self.name, RowStatus::PrepInProgress, Some(now - prep_stale), None)
            .await?;
        let pull = self
            .restore
            .requeue(
                &self.name,
                RowStatus::InProgress,
                Some(now - pull_stale),
                Some(FileStatus::RestoreRegistered),
            )
            .await?;

        let volumes: BTreeSet<String> = pull.iter().filter_map(|row| row.volume.clone()).collect();
        let mut unlocked_volumes = Vec::new();
        for volume in volumes {
            if self.pull.clear_lock(&volume).await {
                unlocked_volumes.push(volume);
            }
        }

        let report = ReapReport {
            lost,
            prep_requeued: prep.len(),
            pull_requeued: pull.len(),
            unlocked_volumes,
        };
        if report.prep_requeued > 0 || report.pull_requeued > 0 {
            info!(
                division = %self.name,
                prep = report.prep_requeued,
                pull = report.pull_requeued,
                volumes = ?report.unlocked_volumes,
                "stale restore rows requeued"
            );
        }
        Ok(report)
    }

    /// Admin requeue of failed restores.
    pub async fn reset_failed(&self) -> Result<ResetFailedReport, StoreError> {
        let failed = self
            .restore
            .requeue(
                &self.name,
                RowStatus::Failed,
                None,
                Some(FileStatus::RestoreRegistered),
            )
            .await?;
        let prep_failed = self
            .restore
            .requeue(&self.name, RowStatus::PrepFailed, None, None)
            .await?;
        info!(division = %self.name, failed = failed.len(), prep_failed = prep_failed.len(), "failed restores reset");
        Ok(ResetFailedReport {
            failed: failed.len(),
            prep_failed: prep_failed.len(),
        })
    }
}

fn secs(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Loads a queue's pending catalog rows, routing each to its features.
async fn seed(
    queue: &Queue,
    kind: QueueKind,
    division: &str,
    router: &FeatureRouter,
    catalog: &dyn CatalogStore,
) -> Result<usize, SchedulerError> {
    let records = catalog.pending_records(division, kind).await?;
    let count = records.len();
    let mut defaulted = Vec::new();
    for record in records {
        match router.route(kind, &record) {
            Ok(Some(features)) => queue.add(record, &features, false).await,
            Ok(None) => defaulted.push(record),
            Err(err) => {
                warn!(division, queue = %kind, error = %err, "record with unusable source seeded with defaults");
                defaulted.push(record);
            }
        }
    }
    queue.add_all(defaulted, &FeatureSet::default(), true).await;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RemoteSource;
    use crate::impls::memory_store::fixtures::{backup, file, pull};
    use crate::impls::{IngestRow, InMemoryArchiveStore, StoreSnapshot};
    use crate::ports::{FixedClock, UlidGenerator};
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;

    struct Fixture {
        clock: Arc<FixedClock>,
        store: Arc<InMemoryArchiveStore>,
        division: Division,
    }

    fn config() -> DivisionConfig {
        DivisionConfig {
            name: "jgi".into(),
            default_backup_service: 1,
            default_queue_features: BTreeMap::from([
                ("copy".to_string(), vec!["local".to_string()]),
                ("pull".to_string(), vec!["hsi_1".to_string()]),
                ("prep".to_string(), vec!["hsi_1".to_string()]),
            ]),
            max_resources: BTreeMap::new(),
        }
    }

    async fn fixture(snapshot: StoreSnapshot) -> Fixture {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap(),
        ));
        let shared: Arc<dyn Clock> = clock.clone();
        let store = Arc::new(InMemoryArchiveStore::from_snapshot(snapshot, shared.clone()));
        let router = Arc::new(FeatureRouter::new(&BTreeMap::from([(
            "dna_w".to_string(),
            RemoteSource {
                path_prefix: "/global/dna".into(),
            },
        )])));
        let division = Division::open(
            &config(),
            &SchedulerSettings::default(),
            router,
            store.clone(),
            store.clone(),
            shared.clone(),
            Arc::new(UlidGenerator::new(shared)),
        )
        .await
        .unwrap();
        Fixture {
            clock,
            store,
            division,
        }
    }

    #[tokio::test]
    async fn seeds_memory_queues_with_routed_features() {
        let mut remote = file(2, "jgi", FileStatus::CopyReady);
        remote.origin_file_path = Some("/global/dna/x.fastq".into());
        let f = fixture(StoreSnapshot {
            files: vec![file(1, "jgi", FileStatus::CopyReady), remote],
            file_ingest: vec![IngestRow {
                file_ingest_id: 5,
                division: "jgi".into(),
                status: FileStatus::Registered,
                file: "/data/a".into(),
                source: None,
            }],
            ..Default::default()
        })
        .await;

        let copy = f.division.queue("copy").await.unwrap();
        let snapshot = copy.snapshot().await;
        assert_eq!(snapshot["local"].len(), 1);
        assert_eq!(snapshot["dna_w"].len(), 1);
        assert_eq!(f.division.queue("ingest").await.unwrap().len().await, 1);
        assert_eq!(f.division.task_manager().queues().await.len(), 7);
    }

    #[tokio::test]
    async fn restores_volume_locks_from_in_progress_rows() {
        let mut busy = pull(9, 1, 0, Some("VOL"));
        busy.status = RowStatus::InProgress;
        let f = fixture(StoreSnapshot {
            files: vec![file(1, "jgi", FileStatus::RestoreInProgress)],
            pull_queue: vec![busy],
            ..Default::default()
        })
        .await;

        let locks = f.division.pull().volume_locks().await;
        assert_eq!(locks["VOL"].pull_queue_id, 9);
    }

    #[tokio::test]
    async fn reap_requeues_stale_rows_and_unlocks_volumes() {
        let f = fixture(StoreSnapshot {
            files: (1..=2).map(|id| file(id, "jgi", FileStatus::RestoreRegistered)).collect(),
            backup_records: vec![backup(100, 1, 1), backup(101, 2, 1)],
            pull_queue: vec![pull(10, 1, 0, Some("VOL")), pull(11, 2, 0, None)],
            ..Default::default()
        })
        .await;
        let hsi = vec!["hsi_1".to_string()];
        f.division.pull().next(&hsi).await.unwrap().unwrap();
        f.division.prep().next(&hsi).await.unwrap().unwrap();

        f.clock.advance(Duration::seconds(599));
        let early = f
            .division
            .reap(Duration::seconds(600), Duration::hours(3))
            .await
            .unwrap();
        assert_eq!(early.prep_requeued, 0);

        f.clock.advance(Duration::hours(3));
        let report = f
            .division
            .reap(Duration::seconds(600), Duration::hours(3))
            .await
            .unwrap();
        assert_eq!(report.prep_requeued, 1);
        assert_eq!(report.pull_requeued, 1);
        assert_eq!(report.unlocked_volumes, vec!["VOL".to_string()]);
        assert!(f.division.pull().volume_locks().await.is_empty());
        assert_eq!(f.store.file_status(1).await, Some(FileStatus::RestoreRegistered));
    }

    #[tokio::test]
    async fn reported_restores_are_not_reaped() {
        let f = fixture(StoreSnapshot {
            files: vec![file(1, "jgi", FileStatus::RestoreRegistered)],
            backup_records: vec![backup(100, 1, 1)],
            pull_queue: vec![pull(10, 1, 0, None)],
            ..Default::default()
        })
        .await;
        let hsi = vec!["hsi_1".to_string()];

        f.division.prep().next(&hsi).await.unwrap().unwrap();
        assert!(f.division.pull().next(&hsi).await.unwrap().is_none());
        let located = PullRowUpdate {
            status: RowStatus::Registered,
            volume: Some("AG1234".into()),
            position_a: Some(5711),
            position_b: Some(0),
        };
        f.division.update_pull_row(10, &located).await.unwrap();

        let batch = f.division.pull().next(&hsi).await.unwrap().unwrap();
        assert_eq!(batch.data[0]["volume"], "AG1234");
        f.division
            .update_pull_row(10, &PullRowUpdate::status(RowStatus::Complete))
            .await
            .unwrap();
        assert!(f.division.pull().clear_lock("AG1234").await);

        for _ in 0..3 {
            f.clock.advance(Duration::hours(4));
            let report = f
                .division
                .reap(Duration::seconds(600), Duration::hours(3))
                .await
                .unwrap();
            assert_eq!((report.prep_requeued, report.pull_requeued), (0, 0));
            assert!(f.division.prep().next(&hsi).await.unwrap().is_none());
            assert!(f.division.pull().next(&hsi).await.unwrap().is_none());
        }
        assert_eq!(f.store.file_status(1).await, Some(FileStatus::Restored));
    }

    #[tokio::test]
    async fn row_updates_are_scoped_to_the_division() {
        let f = fixture(StoreSnapshot {
            files: vec![file(1, "other", FileStatus::RestoreRegistered)],
            pull_queue: vec![pull(10, 1, 0, None)],
            ..Default::default()
        })
        .await;
        let result = f
            .division
            .update_pull_row(10, &PullRowUpdate::status(RowStatus::Complete))
            .await;
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn reset_failed_requeues_both_failure_kinds() {
        let mut failed = pull(10, 1, 0, Some("VOL"));
        failed.status = RowStatus::Failed;
        let mut prep_failed = pull(11, 2, 0, None);
        prep_failed.status = RowStatus::PrepFailed;
        let f = fixture(StoreSnapshot {
            files: (1..=2).map(|id| file(id, "jgi", FileStatus::RestoreInProgress)).collect(),
            pull_queue: vec![failed, prep_failed],
            ..Default::default()
        })
        .await;

        let report = f.division.reset_failed().await.unwrap();
        assert_eq!(report, ResetFailedReport { failed: 1, prep_failed: 1 });
        assert_eq!(f.store.pull_row(10).await.unwrap().status, RowStatus::Registered);
        assert_eq!(f.store.file_status(1).await, Some(FileStatus::RestoreRegistered));
        assert_eq!(f.store.file_status(2).await, Some(FileStatus::RestoreInProgress));
    }
}
