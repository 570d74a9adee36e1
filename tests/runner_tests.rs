//! Integration tests for the in-pod `recover` and `check` commands

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use common::{recovery, restic, FakeCluster, FakeTransfer, RecordingEvents};
use stash_operator::crd::{RecoveryPhase, RecoveryStatus, RestoreStats};
use stash_operator::runner::JobRunner;
use stash_operator::Error;

fn runner() -> (JobRunner, Arc<FakeCluster>, Arc<RecordingEvents>) {
    let cluster = FakeCluster::new();
    let events = RecordingEvents::new();
    cluster.add_secret("default", "stash-demo", &[("RESTIC_PASSWORD", "changeit")]);
    cluster.add_restic(restic("nightly", "web"));
    (
        JobRunner::new(cluster.clone(), events.clone()),
        cluster,
        events,
    )
}

// ============================================================================
// recover
// ============================================================================

#[tokio::test]
async fn every_path_is_attempted_in_order() {
    let (runner, cluster, events) = runner();
    let restore = recovery("restore-1", &["/data/a", "/data/b", "/data/c"]);
    cluster.add_recovery(restore.clone());
    let transfer = FakeTransfer::failing(&["/data/b"]);

    let phase = runner.restore_paths(&restore, &transfer, "web").await.unwrap();

    assert_eq!(phase, RecoveryPhase::Failed);
    assert_eq!(
        transfer.calls(),
        vec![
            ("/data/a".to_string(), "web".to_string()),
            ("/data/b".to_string(), "web".to_string()),
            ("/data/c".to_string(), "web".to_string()),
        ]
    );

    let status = cluster.recovery("default", "restore-1").status.unwrap();
    let outcome: Vec<_> = status
        .stats
        .iter()
        .map(|s| (s.path.as_str(), s.phase))
        .collect();
    assert_eq!(
        outcome,
        vec![
            ("/data/a", RecoveryPhase::Succeeded),
            ("/data/b", RecoveryPhase::Failed),
            ("/data/c", RecoveryPhase::Succeeded),
        ]
    );
    assert_eq!(
        status.message.as_deref(),
        Some("Failed to complete recovery restore-1, reason: failed paths: /data/b")
    );

    let recorded = events.all();
    assert_eq!(recorded.len(), 2);
    assert!(recorded[0].note.starts_with("failed to recover FileGroup /data/b, reason:"));
    assert_eq!(recorded[1].reason, "FailedToRecover");
    assert!(recorded.iter().all(|e| e.warning));
}

#[tokio::test]
async fn stats_are_written_after_each_path() {
    let (runner, cluster, _) = runner();
    let restore = recovery("restore-1", &["/data/a", "/data/b"]);
    cluster.add_recovery(restore.clone());

    runner
        .restore_paths(&restore, &FakeTransfer::default(), "web")
        .await
        .unwrap();

    let writes: Vec<RecoveryStatus> = cluster.state().status_writes.clone();
    let sizes: Vec<_> = writes.iter().map(|s| s.stats.len()).collect();
    assert_eq!(sizes, vec![1, 2, 2]);
    assert_eq!(writes[2].phase, Some(RecoveryPhase::Succeeded));
}

#[tokio::test]
async fn stats_of_paths_no_longer_declared_do_not_fail_the_run() {
    let (runner, cluster, _) = runner();
    let mut restore = recovery("restore-1", &["/data/a"]);
    restore.status = Some(RecoveryStatus {
        phase: Some(RecoveryPhase::Running),
        stats: vec![RestoreStats {
            path: "/data/old".to_string(),
            duration: "3s".to_string(),
            phase: RecoveryPhase::Failed,
        }],
        ..Default::default()
    });
    cluster.add_recovery(restore.clone());

    let phase = runner
        .restore_paths(&restore, &FakeTransfer::default(), "web")
        .await
        .unwrap();

    assert_eq!(phase, RecoveryPhase::Succeeded);
    let stats = cluster.recovery("default", "restore-1").status.unwrap().stats;
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].path, "/data/a");
}

#[tokio::test]
async fn successful_recovery_is_reported() {
    let (runner, cluster, events) = runner();
    cluster.add_recovery(recovery("restore-1", &["/data/a"]));

    let phase = runner
        .recover("default", "restore-1", |_, _, prefix| async move {
            assert_eq!(prefix, "Deployment/web");
            Ok::<_, Error>(FakeTransfer::default())
        })
        .await
        .unwrap();

    assert_eq!(phase, RecoveryPhase::Succeeded);
    let recovery = cluster.recovery("default", "restore-1");
    assert_eq!(recovery.phase(), RecoveryPhase::Succeeded);
    assert_eq!(
        recovery.status.unwrap().message.as_deref(),
        Some("Recovery restore-1 succeeded")
    );
    assert_eq!(events.reasons(), vec!["SuccessfulRecovery"]);
}

#[tokio::test]
async fn finished_recovery_is_not_run_again() {
    let (runner, cluster, events) = runner();
    let mut done = recovery("restore-1", &["/data/a"]);
    done.status = Some(RecoveryStatus {
        phase: Some(RecoveryPhase::Succeeded),
        ..Default::default()
    });
    cluster.add_recovery(done);
    let connected = AtomicBool::new(false);

    let phase = runner
        .recover("default", "restore-1", |_, _, _| async {
            connected.store(true, Ordering::SeqCst);
            Ok::<_, Error>(FakeTransfer::default())
        })
        .await
        .unwrap();

    assert_eq!(phase, RecoveryPhase::Succeeded);
    assert!(!connected.load(Ordering::SeqCst));
    assert!(cluster.state().status_writes.is_empty());
    assert!(events.all().is_empty());
}

#[tokio::test]
async fn invalid_recovery_fails_without_restoring() {
    let (runner, cluster, events) = runner();
    let mut invalid = recovery("restore-1", &["/data/a"]);
    invalid.spec.workload.kind = "CronJob".to_string();
    cluster.add_recovery(invalid);

    let phase = runner
        .recover("default", "restore-1", |_, _, _| async {
            Ok::<_, Error>(FakeTransfer::default())
        })
        .await
        .unwrap();

    assert_eq!(phase, RecoveryPhase::Failed);
    let message = cluster
        .recovery("default", "restore-1")
        .status
        .unwrap()
        .message
        .unwrap();
    assert!(message.starts_with("Failed to validate recovery restore-1, reason:"));
    assert_eq!(events.reasons(), vec!["FailedToRecover"]);
}

#[tokio::test]
async fn missing_storage_secret_fails_the_recovery() {
    let (runner, cluster, _) = runner();
    cluster.state().secrets.clear();
    cluster.add_recovery(recovery("restore-1", &["/data/a"]));

    let phase = runner
        .recover("default", "restore-1", |_, _, _| async {
            Ok::<_, Error>(FakeTransfer::default())
        })
        .await
        .unwrap();

    assert_eq!(phase, RecoveryPhase::Failed);
    let message = cluster
        .recovery("default", "restore-1")
        .status
        .unwrap()
        .message
        .unwrap();
    assert!(message.contains("stash-demo"));
}

#[tokio::test]
async fn unknown_recovery_is_an_error() {
    let (runner, _, _) = runner();

    let err = runner
        .recover("default", "missing", |_, _, _| async {
            Ok::<_, Error>(FakeTransfer::default())
        })
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Validation(_)));
}

// ============================================================================
// check
// ============================================================================

#[tokio::test]
async fn successful_check_is_reported_on_the_restic() {
    let (runner, _, events) = runner();

    runner
        .check("default", "nightly", "Deployment/web", |_, secret, prefix| async move {
            assert_eq!(prefix, "Deployment/web");
            assert!(secret.data.unwrap().contains_key("RESTIC_PASSWORD"));
            Ok::<_, Error>(FakeTransfer::default())
        })
        .await
        .unwrap();

    let recorded = events.all();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].object, "nightly");
    assert_eq!(recorded[0].reason, "SuccessfulCheck");
    assert_eq!(recorded[0].note, "Check successful for prefix Deployment/web");
}

#[tokio::test]
async fn failed_check_is_reported_and_returned() {
    let (runner, _, events) = runner();

    let result = runner
        .check("default", "nightly", "Deployment/web", |_, _, _| async {
            Ok::<_, Error>(FakeTransfer::failing_check())
        })
        .await;

    assert!(matches!(result, Err(Error::DataTransfer(_))));
    let recorded = events.all();
    assert_eq!(recorded[0].reason, "FailedToCheck");
    assert!(recorded[0].warning);
    assert!(recorded[0]
        .note
        .starts_with("Check failed for prefix Deployment/web, reason:"));
}
