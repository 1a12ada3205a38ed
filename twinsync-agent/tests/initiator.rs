use twinsync_agent::config::{PathPair, PowerOffTarget};
use twinsync_agent::execution::ExecutionResult;
use twinsync_agent::notify::Severity;
use twinsync_agent::orchestrator::Phase;
use twinsync_agent::{OrchestratorError, RunOutcome};
use twinsync_devkit::{TestHarness, PEER_ADDRESS};

fn populated_source() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("notes.txt"), b"notes").unwrap();
    dir
}

#[tokio::test]
async fn test_wakes_peer_then_pushes() {
    let mut harness = TestHarness::initiator().unwrap();
    let source = populated_source();
    harness.config.sync.main = vec![PathPair {
        source: source.path().display().to_string(),
        destination: "/mnt/backup/notes".into(),
    }];
    harness.executor.on_sequence(
        "ping",
        vec![ExecutionResult::failed(1, "down"), ExecutionResult::failed(1, "down"), ExecutionResult::ok("")],
    );

    let report = harness.run().await.unwrap();

    assert!(matches!(report.outcome, RunOutcome::Completed));
    assert!(report.reached(Phase::WakePeer));
    assert!(report.reached(Phase::AwaitReady));
    assert_eq!(harness.executor.count("ping"), 3);
    let rsync = harness.executor.find("rsync");
    assert_eq!(rsync.len(), 1);
    assert_eq!(rsync[0].spec.args.last().unwrap(), "root@10.0.0.2:/mnt/backup/notes/");
    assert_eq!(harness.notifier.find("Backup finished")[0].severity, Severity::Normal);
}

#[tokio::test]
async fn test_peer_that_never_answers_times_out() {
    let harness = TestHarness::initiator().unwrap();
    harness.peer_online(false);

    let report = harness.run().await.unwrap();

    assert!(matches!(report.outcome, RunOutcome::Aborted(OrchestratorError::ReadinessTimeout { attempts: 3, .. })));
    assert_eq!(report.exit_code(), 12);
    // one initial probe, then the bounded wait
    assert_eq!(harness.executor.count("ping"), 4);
    assert!(harness.executor.calls().iter().all(|c| !c.is_remote()));
    assert_eq!(harness.notifier.find("Backup aborted").len(), 1);
}

#[tokio::test]
async fn test_peer_already_online_is_only_a_warning() {
    let harness = TestHarness::initiator().unwrap();

    let report = harness.run().await.unwrap();

    assert!(matches!(report.outcome, RunOutcome::Completed));
    assert!(!report.reached(Phase::WakePeer));
    assert_eq!(harness.notifier.find("Backup already online")[0].severity, Severity::Warning);
}

#[tokio::test]
async fn test_delegate_sync_hands_the_plan_to_the_peer() {
    let mut harness = TestHarness::initiator().unwrap();
    harness.config.flags.delegate_sync = true;
    harness.config.flags.copy_app_data = true;
    harness.config.workloads.containers = vec!["svcA".into()];

    let report = harness.run().await.unwrap();

    assert!(matches!(report.outcome, RunOutcome::Completed));
    assert!(report.reached(Phase::Handoff));
    assert!(!report.reached(Phase::QuiesceWorkloads));

    let state_dir = harness.state_dir().display().to_string();
    let mkdir = harness.executor.remote_position(&format!("mkdir -p {}", state_dir)).unwrap();
    let trigger_target = format!("{}:{}", "root@10.0.0.2", harness.config.state.trigger_file.display());
    let copy = harness.executor.local_position("rsync", &trigger_target).unwrap();
    assert!(mkdir < copy);
    assert_eq!(harness.executor.count("docker"), 0);
    assert_eq!(harness.notifier.find("Backup requested").len(), 1);
}

#[tokio::test]
async fn test_power_off_both_records_marker_then_shuts_down_last() {
    let mut harness = TestHarness::initiator().unwrap();
    harness.config.flags.power_off_target = PowerOffTarget::Both;

    let report = harness.run().await.unwrap();

    assert!(matches!(report.outcome, RunOutcome::Completed));
    let peer_off = harness.executor.remote_position("poweroff").unwrap();
    let local_off = harness.executor.local_position("shutdown", "-h now").unwrap();
    assert!(peer_off < local_off);
    assert_eq!(local_off, harness.executor.calls().len() - 1);
    assert_eq!(harness.marker().read().await.unwrap().peer, PEER_ADDRESS);
}

#[tokio::test]
async fn test_switch_server_resumes_workloads_on_backup() {
    let mut harness = TestHarness::initiator().unwrap();
    harness.config.flags.copy_app_data = true;
    harness.config.flags.switch_server = true;
    harness.config.workloads.containers = vec!["svcA".into(), "svcB".into()];

    let report = harness.run().await.unwrap();

    assert!(matches!(report.outcome, RunOutcome::Completed));
    let starts = harness.executor.find("docker start");
    assert_eq!(starts.len(), 2);
    assert!(starts.iter().all(|c| c.is_remote()));
    // quiesce stops both sides, source first
    let local_stop = harness.executor.local_position("docker", "stop svcA").unwrap();
    let peer_stop = harness.executor.remote_position("docker stop svcA").unwrap();
    assert!(local_stop < peer_stop);
}
