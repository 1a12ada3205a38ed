use std::sync::Arc;
use std::time::Duration;

use twinsync_agent::config::{PathPair, SyncSection};
use twinsync_agent::execution::ExecutionResult;
use twinsync_agent::notify::Severity;
use twinsync_agent::sync::{pairs_for, Direction, PairOutcome, SyncCategory, SyncEngine};
use twinsync_devkit::TestHarness;

fn engine(harness: &TestHarness, section: &SyncSection) -> SyncEngine {
    SyncEngine::new(
        harness.runner(),
        Arc::new(harness.notifier.clone()),
        section,
        Duration::from_secs(600),
        Duration::from_secs(5),
    )
}

fn section(pairs: Vec<(&str, &str)>) -> SyncSection {
    SyncSection {
        main: pairs
            .into_iter()
            .map(|(s, d)| PathPair { source: s.to_string(), destination: d.to_string() })
            .collect(),
        ..SyncSection::default()
    }
}

#[tokio::test]
async fn test_unset_pairs_transfer_nothing() {
    let harness = TestHarness::responder().unwrap();
    let section = section(vec![("", ""), ("/mnt/user/data", ""), ("", "/mnt/backup")]);

    let pairs = pairs_for(SyncCategory::Main, &section);
    let report = engine(&harness, &section).sync_category(SyncCategory::Main, Direction::Pull, &pairs).await;

    assert_eq!(report.transferred(), 0);
    assert!(report.pairs.iter().all(|(_, o)| matches!(o, PairOutcome::Skipped(_))));
    assert!(harness.executor.calls().is_empty());
    assert!(harness.notifier.sent().is_empty());
}

#[tokio::test]
async fn test_root_destination_is_rejected_with_alert() {
    let harness = TestHarness::responder().unwrap();
    harness.peer_sources_populated();
    let section = section(vec![("/mnt/user/data", "/")]);

    let pairs = pairs_for(SyncCategory::Main, &section);
    let report = engine(&harness, &section).sync_category(SyncCategory::Main, Direction::Pull, &pairs).await;

    assert_eq!(report.rejected(), 1);
    assert_eq!(harness.executor.count("rsync"), 0);
    let alerts = harness.notifier.with_severity(Severity::Alert);
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].subject, "Sync pair rejected");
}

#[tokio::test]
async fn test_relative_paths_are_rejected_with_alert() {
    let harness = TestHarness::responder().unwrap();
    harness.peer_sources_populated();
    let section = section(vec![
        ("/mnt/user/data", "."),
        ("/mnt/user/data", ".."),
        ("/mnt/user/data", "../.."),
        ("mnt/user/data", "/mnt/backup/data"),
    ]);

    let pairs = pairs_for(SyncCategory::Main, &section);
    let report = engine(&harness, &section).sync_category(SyncCategory::Main, Direction::Pull, &pairs).await;

    assert_eq!(report.rejected(), 4);
    assert!(harness.executor.calls().is_empty());
    let alerts = harness.notifier.with_severity(Severity::Alert);
    assert_eq!(alerts.len(), 4);
    assert!(alerts.iter().all(|a| a.subject == "Sync pair rejected" && a.message.contains("not an absolute path")));
}

#[tokio::test]
async fn test_remote_source_check_follows_symlinked_directory() {
    let harness = TestHarness::responder().unwrap();
    harness.peer_sources_populated();
    let section = section(vec![("/mnt/user/data", "/mnt/backup/data"), ("/mnt/user/media/", "/mnt/backup/media")]);

    let pairs = pairs_for(SyncCategory::Main, &section);
    let report = engine(&harness, &section).sync_category(SyncCategory::Main, Direction::Pull, &pairs).await;

    assert_eq!(report.transferred(), 2);
    let finds = harness.executor.find("find ");
    assert_eq!(finds.len(), 2);
    assert!(finds.iter().all(|c| c.is_remote()));
    assert!(finds[0].line.contains("find /mnt/user/data/ -mindepth 1"));
    assert!(finds[1].line.contains("find /mnt/user/media/ -mindepth 1"));
}

#[tokio::test]
async fn test_empty_remote_source_is_never_mirrored() {
    let harness = TestHarness::responder().unwrap();
    // find succeeds without printing anything: the directory is empty
    harness.executor.on("find ", ExecutionResult::ok(""));
    let section = section(vec![("/mnt/user/data", "/mnt/backup/data")]);

    let pairs = pairs_for(SyncCategory::Main, &section);
    let report = engine(&harness, &section).sync_category(SyncCategory::Main, Direction::Pull, &pairs).await;

    assert!(matches!(&report.pairs[0].1, PairOutcome::Skipped(reason) if reason.contains("empty")));
    assert_eq!(harness.executor.count("rsync"), 0);
    assert_eq!(harness.notifier.with_severity(Severity::Warning).len(), 1);
}

#[tokio::test]
async fn test_absent_remote_source_is_skipped() {
    let harness = TestHarness::responder().unwrap();
    harness.executor.fail("find ");
    let section = section(vec![("/mnt/user/missing", "/mnt/backup/data")]);

    let pairs = pairs_for(SyncCategory::Main, &section);
    let report = engine(&harness, &section).sync_category(SyncCategory::Main, Direction::Pull, &pairs).await;

    assert!(matches!(&report.pairs[0].1, PairOutcome::Skipped(reason) if reason.contains("does not exist")));
    assert_eq!(harness.executor.count("rsync"), 0);
}

#[tokio::test]
async fn test_pull_mirrors_peer_into_local_destination() {
    let harness = TestHarness::responder().unwrap();
    harness.peer_sources_populated();
    let destination = tempfile::tempdir().unwrap();
    let dest = destination.path().display().to_string();
    let section = section(vec![("/mnt/user/data", dest.as_str())]);

    let pairs = pairs_for(SyncCategory::Main, &section);
    let report = engine(&harness, &section).sync_category(SyncCategory::Main, Direction::Pull, &pairs).await;

    assert_eq!(report.transferred(), 1);
    let rsync = harness.executor.find("rsync");
    assert_eq!(rsync.len(), 1);
    let args = &rsync[0].spec.args;
    assert_eq!(args[0], "-aH");
    assert!(args.contains(&"--delete".to_string()));
    assert!(args.contains(&"--timeout=600".to_string()));
    assert_eq!(args[args.len() - 2], "root@10.0.0.2:/mnt/user/data/");
    assert_eq!(args[args.len() - 1], format!("{}/", dest));
}

#[tokio::test]
async fn test_push_checks_local_source_and_mirrors_to_peer() {
    let harness = TestHarness::initiator().unwrap();
    let source = tempfile::tempdir().unwrap();
    std::fs::write(source.path().join("photo.jpg"), b"jpeg").unwrap();
    let empty = tempfile::tempdir().unwrap();
    let src = source.path().display().to_string();
    let empty_src = empty.path().display().to_string();
    let section = section(vec![(src.as_str(), "/mnt/backup/photos"), (empty_src.as_str(), "/mnt/backup/empty")]);

    let pairs = pairs_for(SyncCategory::Main, &section);
    let report = engine(&harness, &section).sync_category(SyncCategory::Main, Direction::Push, &pairs).await;

    assert_eq!(report.transferred(), 1);
    assert!(matches!(report.pairs[1].1, PairOutcome::Skipped(_)));
    // local sources are inspected on disk, never through ssh
    assert_eq!(harness.executor.count("find"), 0);
    let rsync = harness.executor.find("rsync");
    assert_eq!(rsync.len(), 1);
    assert_eq!(rsync[0].spec.args.last().unwrap(), "root@10.0.0.2:/mnt/backup/photos/");
}

#[tokio::test]
async fn test_failed_pair_does_not_stop_the_next_one() {
    let harness = TestHarness::responder().unwrap();
    harness.peer_sources_populated();
    harness.executor.fail("root@10.0.0.2:/mnt/user/first/");
    let section = section(vec![("/mnt/user/first", "/mnt/backup/first"), ("/mnt/user/second", "/mnt/backup/second")]);

    let pairs = pairs_for(SyncCategory::Main, &section);
    let report = engine(&harness, &section).sync_category(SyncCategory::Main, Direction::Pull, &pairs).await;

    assert_eq!(report.failed(), 1);
    assert_eq!(report.transferred(), 1);
    assert_eq!(harness.executor.count("rsync"), 2);
    assert_eq!(harness.notifier.find("Sync pair failed").len(), 1);
}
