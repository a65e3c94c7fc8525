//! End-to-end dispatch against the in-memory archive store.

use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use serde_json::json;

use spindle_core::api::{
    NextTaskRequest, PutPullRequest, PutTaskRequest, RegisterServiceRequest, ResourceRequest,
    TaskCompleteRequest, TaskSubmission,
};
use spindle_core::app::{Dispatcher, DispatcherBuilder};
use spindle_core::config::Config;
use spindle_core::domain::{ErrorKind, FileStatus, QueueName, RowStatus};
use spindle_core::impls::{InMemoryArchiveStore, StoreSnapshot};
use spindle_core::ports::{Clock, FixedClock, PullRowUpdate};

const CONFIG: &str = r#"
    [scheduler]
    heartbeat_timeout_secs = 600

    [remote_sources.dna_w]
    path_prefix = "/global/dna"

    [[division]]
    name = "jgi"
    default_backup_service = 1
    [division.default_queue_features]
    put = ["hsi_1"]
    pull = ["hsi_1"]
    prep = ["hsi_1"]
    [division.max_resources]
    hsi_1 = 1
"#;

struct Harness {
    clock: Arc<FixedClock>,
    store: Arc<InMemoryArchiveStore>,
    dispatcher: Dispatcher,
}

async fn harness(seed: serde_json::Value) -> Harness {
    let clock = Arc::new(FixedClock::new(
        Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap(),
    ));
    let shared: Arc<dyn Clock> = clock.clone();
    let snapshot: StoreSnapshot = serde_json::from_value(seed).unwrap();
    let store = Arc::new(InMemoryArchiveStore::from_snapshot(snapshot, shared.clone()));
    let dispatcher = DispatcherBuilder::new(Config::from_toml_str(CONFIG).unwrap())
        .catalog(store.clone())
        .restore(store.clone())
        .clock(shared)
        .build()
        .await
        .unwrap();
    Harness {
        clock,
        store,
        dispatcher,
    }
}

fn next(tasks: &[&str], features: &[&str], service: i64) -> NextTaskRequest {
    NextTaskRequest {
        features: features.iter().map(|s| s.to_string()).collect(),
        tasks: tasks.iter().map(|s| s.to_string()).collect(),
        division: "jgi".into(),
        service,
        previous_task_id: None,
        returned: false,
    }
}

fn file(id: i64, status: &str) -> serde_json::Value {
    json!({"file_id": id, "division": "jgi", "status": status,
           "file_path": "/archive/jgi", "file_name": format!("f{id}"), "file_size": 10})
}

#[tokio::test]
async fn prep_then_pull_then_priority_ladder() {
    let h = harness(json!({
        "files": [file(1, "RESTORE_REGISTERED"), file(2, "RESTORE_REGISTERED"),
                  file(3, "RESTORE_REGISTERED"), file(4, "COPY_READY")],
        "backup_records": [
            {"backup_record_id": 10, "file_id": 1, "service": 1, "status": "TRANSFER_COMPLETE"},
            {"backup_record_id": 11, "file_id": 2, "service": 1, "status": "TRANSFER_COMPLETE"},
            {"backup_record_id": 12, "file_id": 3, "service": 1, "status": "TRANSFER_COMPLETE"}
        ],
        "pull_queue": [
            {"pull_queue_id": 100, "file_id": 1, "status": "REGISTERED", "priority": 0},
            {"pull_queue_id": 101, "file_id": 2, "status": "REGISTERED", "priority": 0, "volume": "VOL1"},
            {"pull_queue_id": 102, "file_id": 3, "status": "REGISTERED", "priority": 0, "volume": "VOL1"}
        ]
    }))
    .await;
    let tasks = ["prep", "pull", "copy"];

    let prep = h.dispatcher.next_task(next(&tasks, &["hsi_1"], 1)).await.unwrap().unwrap();
    assert_eq!(prep.task.as_str(), "prep");
    assert_eq!(prep.task_id, None);

    let pull = h.dispatcher.next_task(next(&tasks, &["hsi_1"], 1)).await.unwrap().unwrap();
    assert_eq!(pull.task.as_str(), "pull");
    assert_eq!(pull.records, Some(2));
    assert!(h.dispatcher.division("jgi").unwrap().pull().volume_locks().await.contains_key("VOL1"));

    let copy = h.dispatcher.next_task(next(&tasks, &["hsi_1"], 1)).await.unwrap().unwrap();
    assert_eq!(copy.task.as_str(), "copy");
    assert!(copy.task_id.is_some());
    assert_eq!(h.store.file_status(4).await, Some(FileStatus::CopyInProgress));

    assert!(h.dispatcher.next_task(next(&tasks, &["hsi_1"], 1)).await.unwrap().is_none());
    assert!(h.dispatcher.release_volume("jgi", "VOL1").await.unwrap());
}

fn report(update: PullRowUpdate) -> PutPullRequest {
    PutPullRequest {
        division: "jgi".into(),
        update,
    }
}

#[tokio::test]
async fn reported_restores_leave_the_reaper_alone() {
    let h = harness(json!({
        "files": [file(1, "RESTORE_REGISTERED"), file(2, "RESTORE_REGISTERED")],
        "backup_records": [
            {"backup_record_id": 10, "file_id": 1, "service": 1, "status": "TRANSFER_COMPLETE"},
            {"backup_record_id": 11, "file_id": 2, "service": 1, "status": "TRANSFER_COMPLETE"}
        ],
        "pull_queue": [
            {"pull_queue_id": 100, "file_id": 1, "status": "REGISTERED", "priority": 0},
            {"pull_queue_id": 101, "file_id": 2, "status": "REGISTERED", "priority": 0, "volume": "VOL1"}
        ]
    }))
    .await;
    let tasks = ["prep", "pull"];
    let mut prep_batches = 0;
    let mut pull_batches = 0;

    for _ in 0..3 {
        while let Some(lease) = h.dispatcher.next_task(next(&tasks, &["hsi_1"], 1)).await.unwrap() {
            let rows = lease.data.as_array().unwrap().clone();
            match lease.task.as_str() {
                "prep" => {
                    prep_batches += 1;
                    for row in rows {
                        let id = row["pull_queue_id"].as_i64().unwrap();
                        let located = PullRowUpdate {
                            status: RowStatus::Registered,
                            volume: Some("VOL2".into()),
                            position_a: Some(1),
                            position_b: Some(id),
                        };
                        h.dispatcher.put_pull(id, report(located)).await.unwrap();
                    }
                }
                "pull" => {
                    pull_batches += 1;
                    for row in &rows {
                        let id = row["pull_queue_id"].as_i64().unwrap();
                        let done = PullRowUpdate::status(RowStatus::Complete);
                        h.dispatcher.put_pull(id, report(done)).await.unwrap();
                    }
                    let volume = rows[0]["volume"].as_str().unwrap();
                    assert!(h.dispatcher.release_volume("jgi", volume).await.unwrap());
                }
                other => panic!("unexpected task {other}"),
            }
        }
        h.clock.advance(Duration::hours(4));
        let reaped = h.dispatcher.reap().await;
        assert_eq!((reaped["jgi"].prep_requeued, reaped["jgi"].pull_requeued), (0, 0));
    }

    assert_eq!((prep_batches, pull_batches), (1, 2));
    assert_eq!(h.store.file_status(1).await, Some(FileStatus::Restored));
    assert_eq!(h.store.file_status(2).await, Some(FileStatus::Restored));
    assert_eq!(h.store.pull_row(100).await.unwrap().volume.as_deref(), Some("VOL2"));
}

#[tokio::test]
async fn unknown_pull_rows_are_not_found() {
    let h = harness(json!({})).await;
    let err = h
        .dispatcher
        .put_pull(5, report(PullRowUpdate::status(RowStatus::Complete)))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn restore_queues_need_their_feature() {
    let h = harness(json!({
        "files": [file(1, "RESTORE_REGISTERED")],
        "backup_records": [{"backup_record_id": 10, "file_id": 1, "service": 1, "status": "TRANSFER_COMPLETE"}],
        "pull_queue": [{"pull_queue_id": 100, "file_id": 1, "status": "REGISTERED", "priority": 0}]
    }))
    .await;
    assert!(h.dispatcher.next_task(next(&["prep"], &["hsi_2"], 1)).await.unwrap().is_none());
}

#[tokio::test]
async fn piggybacked_completion_frees_the_quota() {
    let h = harness(json!({
        "files": [file(1, "BACKUP_READY"), file(2, "BACKUP_READY")],
        "backup_records": [
            {"backup_record_id": 10, "file_id": 1, "service": 1, "status": "TRANSFER_READY"},
            {"backup_record_id": 11, "file_id": 2, "service": 1, "status": "TRANSFER_READY"}
        ]
    }))
    .await;

    let first = h.dispatcher.next_task(next(&["put"], &["hsi_1"], 1)).await.unwrap().unwrap();
    assert_eq!(first.features.as_slice(), &["hsi_1".to_string()]);
    assert!(h.dispatcher.next_task(next(&["put"], &["hsi_1"], 2)).await.unwrap().is_none());

    let mut again = next(&["put"], &["hsi_1"], 1);
    again.previous_task_id = first.task_id.map(|id| id.to_string());
    again.returned = true;
    let second = h.dispatcher.next_task(again).await.unwrap().unwrap();
    assert_ne!(second.data["file_id"], first.data["file_id"]);

    let complete = TaskCompleteRequest {
        task_id: second.task_id.unwrap().to_string(),
        returned: true,
        division: "jgi".into(),
    };
    assert!(h.dispatcher.task_complete(complete.clone()).await.unwrap());
    assert!(!h.dispatcher.task_complete(complete).await.unwrap());
}

#[tokio::test]
async fn put_task_with_remote_feature_skips_defaults() {
    let h = harness(json!({})).await;
    let queued = h
        .dispatcher
        .put_task(PutTaskRequest {
            task: TaskSubmission {
                task: "put".into(),
                data: json!([{"tar_record_id": 1}, {"tar_record_id": 2}]),
                features: vec!["dna_w".into()],
                division: "jgi".into(),
            },
        })
        .await
        .unwrap();
    assert_eq!(queued, 2);

    let list = h.dispatcher.task_list("jgi").await.unwrap();
    assert_eq!(list[&QueueName::from("put")]["dna_w"].len(), 2);

    // hsi_1 が無くても dna_w だけで取れる
    let lease = h.dispatcher.next_task(next(&["put"], &["dna_w"], 1)).await.unwrap();
    assert!(lease.is_some());
}

#[tokio::test]
async fn protocol_errors_are_classified() {
    let h = harness(json!({})).await;

    let unknown_queue = h.dispatcher.next_task(next(&["tape"], &[], 1)).await.unwrap_err();
    assert_eq!(unknown_queue.kind(), ErrorKind::Protocol);

    let bad_feature = h.dispatcher.next_task(next(&["copy"], &["a,b"], 1)).await.unwrap_err();
    assert_eq!(bad_feature.kind(), ErrorKind::Protocol);

    let mut elsewhere = next(&["copy"], &[], 1);
    elsewhere.division = "nmdc".into();
    assert_eq!(
        h.dispatcher.next_task(elsewhere).await.unwrap_err().kind(),
        ErrorKind::NotFound
    );
}

#[tokio::test]
async fn silent_worker_loses_its_copy_back_to_the_queue() {
    let h = harness(json!({"files": [file(1, "COPY_READY")]})).await;
    let service = h
        .dispatcher
        .register_service(RegisterServiceRequest {
            division: "jgi".into(),
            threads: 1,
            host: None,
        })
        .await
        .unwrap();

    let lease = h.dispatcher.next_task(next(&["copy"], &[], service)).await.unwrap().unwrap();
    assert_eq!(h.store.file_status(1).await, Some(FileStatus::CopyInProgress));

    h.clock.advance(Duration::seconds(600));
    let reaped = h.dispatcher.reap().await;
    assert_eq!(reaped["jgi"].lost.leases, vec![lease.task_id.unwrap()]);
    assert_eq!(h.store.file_status(1).await, Some(FileStatus::CopyReady));

    let retry = h.dispatcher.next_task(next(&["copy"], &[], 99)).await.unwrap().unwrap();
    assert_eq!(retry.data["file_id"], 1);
}

#[tokio::test]
async fn heartbeat_reports_restore_backlog() {
    let h = harness(json!({
        "files": [file(1, "RESTORE_REGISTERED"), file(2, "RESTORE_REGISTERED")],
        "pull_queue": [
            {"pull_queue_id": 100, "file_id": 1, "status": "REGISTERED", "priority": 0, "volume": "A"},
            {"pull_queue_id": 101, "file_id": 2, "status": "REGISTERED", "priority": 0, "volume": "B"}
        ]
    }))
    .await;
    let summary = h.dispatcher.heartbeat("jgi", 5).await.unwrap();
    assert_eq!(summary[&QueueName::from("pull")].record_count, 2);
    assert_eq!(summary[&QueueName::from("prep")].record_count, 0);
    assert_eq!(summary.len(), 9);
}

#[tokio::test]
async fn offline_reports_are_tracked_per_service() {
    let h = harness(json!({})).await;
    let report = |service| ResourceRequest {
        division: "jgi".into(),
        resource: "hsi_1".into(),
        service,
    };
    h.dispatcher.resource_offline(report(1)).await.unwrap();
    let both = h.dispatcher.resource_offline(report(2)).await.unwrap();
    assert_eq!(both.services, vec![1, 2]);

    let left = h.dispatcher.resource_online(report(1)).await.unwrap();
    assert_eq!(left.services, vec![2]);
    h.dispatcher.resource_online(report(2)).await.unwrap();
    assert!(h.dispatcher.offline_resources("jgi").await.unwrap().is_empty());
}
