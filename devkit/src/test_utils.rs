/*!
Test harness for orchestrator scenarios

- Mock executor and recording notifier already wired
- State files (trigger, peer-off marker) in a private temp directory
- No delays: every interval and settle time is zero
*/

use crate::mock_executor::MockExecutor;
use crate::notifier::RecordingNotifier;
use anyhow::Result;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use twinsync_agent::config::{Config, Role, Timing};
use twinsync_agent::execution::{ExecutionResult, HostRunner, SshTarget};
use twinsync_agent::state::{PeerOffMarker, PlanSnapshot, TriggerFile};
use twinsync_agent::{Orchestrator, RunReport};

pub const PEER_ADDRESS: &str = "10.0.0.2";

pub struct TestHarness {
    pub executor: MockExecutor,
    pub notifier: RecordingNotifier,
    pub config: Config,
    state_dir: TempDir,
}

impl TestHarness {
    pub fn new(role: Role) -> Result<Self> {
        env_logger::builder().is_test(true).try_init().ok();

        let state_dir = tempfile::tempdir()?;
        let mut config = Config::for_peer(role, PEER_ADDRESS);
        config.timing = Timing::immediate();
        config.timing.ready_attempts = 3;
        config.timing.storage_attempts = 3;
        config.timing.trigger_wait_attempts = 3;
        config.state.trigger_file = state_dir.path().join("sync.trigger");
        config.state.peer_off_marker = state_dir.path().join("peer-powered-off.json");

        Ok(Self {
            executor: MockExecutor::new(),
            notifier: RecordingNotifier::new(),
            config,
            state_dir,
        })
    }

    pub fn responder() -> Result<Self> {
        Self::new(Role::Responder)
    }

    pub fn initiator() -> Result<Self> {
        Self::new(Role::Initiator)
    }

    pub fn state_dir(&self) -> &Path {
        self.state_dir.path()
    }

    /// Peer answers (or not) to ping
    pub fn peer_online(&self, online: bool) -> &Self {
        if online {
            self.executor.on("ping", ExecutionResult::ok(""));
        } else {
            self.executor.fail("ping");
        }
        self
    }

    /// Remote `find` sees content under every source path
    pub fn peer_sources_populated(&self) -> &Self {
        self.executor.on("find ", ExecutionResult::ok("entry\n"));
        self
    }

    pub fn trigger(&self) -> TriggerFile {
        TriggerFile::new(self.config.state.trigger_file.clone())
    }

    pub fn marker(&self) -> PeerOffMarker {
        PeerOffMarker::new(self.config.state.peer_off_marker.clone())
    }

    /// Empty trigger: a sync request without a plan
    pub async fn place_trigger(&self) -> Result<()> {
        tokio::fs::write(&self.config.state.trigger_file, "").await?;
        Ok(())
    }

    pub async fn place_plan(&self, plan: &PlanSnapshot) -> Result<()> {
        self.trigger().write(plan).await
    }

    pub fn runner(&self) -> HostRunner {
        HostRunner::new(Arc::new(self.executor.clone()), SshTarget::from_config(&self.config))
    }

    pub fn orchestrator(&self) -> Orchestrator {
        Orchestrator::new(
            self.config.clone(),
            Arc::new(self.executor.clone()),
            Arc::new(self.notifier.clone()),
        )
    }

    /// One complete run, bounded so a stuck scenario fails instead of hanging
    pub async fn run(&self) -> Result<RunReport> {
        let report = tokio::time::timeout(Duration::from_secs(30), self.orchestrator().run()).await?;
        log::info!("Run finished: {:?} via {:?}", report.outcome, report.phases);
        Ok(report)
    }
}
