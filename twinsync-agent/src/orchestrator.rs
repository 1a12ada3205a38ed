//! Workflow orchestrator
//!
//! One linear run per invocation, parameterized by [`Role`]:
//!
//! ```text
//! ProbePeer -> (AwaitTrigger) -> (WakePeer -> AwaitReady) -> VerifyRemoteExec -> (AwaitStorageOnline)
//!   -> CheckVms -> SyncData(main) -> QuiesceWorkloads -> SyncData(app-data)
//!   -> ResumeWorkloads -> Cleanup -> (PowerOff) -> Done
//! ```
//!
//! Any fatal precondition moves the run to `Aborted` before the next side
//! effect. Per-pair and per-workload failures are reported, never fatal.

use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{Config, PowerOffTarget, Role};
use crate::error::{OrchestratorError, EXIT_NOTHING_TO_DO};
use crate::execution::{CommandSpec, HostRunner, Location, SharedExecutor, SshTarget};
use crate::notify::{Severity, SharedNotifier};
use crate::power::PowerController;
use crate::probe::Prober;
use crate::state::{PeerOffMarker, PlanSnapshot, TriggerFile};
use crate::sync::{pairs_for, Direction, SyncCategory, SyncEngine, SyncReport};
use crate::workloads::{WorkloadManager, WorkloadReport, WorkloadSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Phase {
    ProbePeer,
    AwaitTrigger,
    WakePeer,
    AwaitReady,
    VerifyRemoteExec,
    AwaitStorageOnline,
    Failover,
    Handoff,
    CheckVms,
    SyncData(SyncCategory),
    QuiesceWorkloads,
    ResumeWorkloads,
    Cleanup,
    PowerOff,
    Done,
    Aborted,
}

/// Per-run view of both hosts, derived fresh on every run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LifecycleState {
    pub source_online: bool,
    pub backup_online: bool,
    pub vms_running: bool,
    pub sync_requested: bool,
    pub power_off_target: PowerOffTarget,
    pub switch_server: bool,
}

#[derive(Debug)]
pub enum RunOutcome {
    Completed,
    NothingToDo(String),
    Aborted(OrchestratorError),
}

#[derive(Debug)]
pub struct RunReport {
    pub run_id: Uuid,
    pub role: Role,
    pub outcome: RunOutcome,
    pub phases: Vec<Phase>,
    pub state: LifecycleState,
    pub sync_reports: Vec<SyncReport>,
    pub workload_reports: Vec<WorkloadReport>,
}

impl RunReport {
    pub fn exit_code(&self) -> u8 {
        match &self.outcome {
            RunOutcome::Completed => 0,
            RunOutcome::NothingToDo(_) => EXIT_NOTHING_TO_DO,
            RunOutcome::Aborted(e) => e.exit_code(),
        }
    }

    pub fn reached(&self, phase: Phase) -> bool {
        self.phases.contains(&phase)
    }
}

enum Finish {
    Completed,
    NothingToDo(String),
}

pub struct Orchestrator {
    config: Config,
    run_id: Uuid,
    runner: HostRunner,
    prober: Prober,
    power: PowerController,
    workloads: WorkloadManager,
    notifier: SharedNotifier,
    trigger: TriggerFile,
    marker: PeerOffMarker,
    state: LifecycleState,
    phases: Vec<Phase>,
    sync_reports: Vec<SyncReport>,
    workload_reports: Vec<WorkloadReport>,
}

impl Orchestrator {
    pub fn new(config: Config, executor: SharedExecutor, notifier: SharedNotifier) -> Self {
        let runner = HostRunner::new(executor, SshTarget::from_config(&config));
        let timing = &config.timing;
        let prober = Prober::new(
            runner.clone(),
            std::time::Duration::from_secs(timing.probe_timeout_secs),
            timing.command_timeout(),
        );
        let power = PowerController::new(runner.clone(), &config);
        let workloads = WorkloadManager::new(
            runner.clone(),
            config.workloads.runtime.clone(),
            timing.settle(),
            timing.command_timeout(),
        );
        let state = LifecycleState {
            source_online: false,
            backup_online: false,
            vms_running: false,
            sync_requested: false,
            power_off_target: config.flags.power_off_target,
            switch_server: config.flags.switch_server,
        };

        Self {
            trigger: TriggerFile::new(config.state.trigger_file.clone()),
            marker: PeerOffMarker::new(config.state.peer_off_marker.clone()),
            run_id: Uuid::new_v4(),
            config,
            runner,
            prober,
            power,
            workloads,
            notifier,
            state,
            phases: Vec::new(),
            sync_reports: Vec::new(),
            workload_reports: Vec::new(),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Execute the whole workflow for the configured role
    pub async fn run(mut self) -> RunReport {
        info!("Run {} started as {}", self.run_id, self.config.role);

        let result = match self.config.role {
            Role::Initiator => self.run_initiator().await,
            Role::Responder => self.run_responder().await,
        };

        let outcome = match result {
            Ok(Finish::Completed) => {
                self.enter(Phase::Done);
                RunOutcome::Completed
            }
            Ok(Finish::NothingToDo(reason)) => {
                info!("Nothing to do: {}", reason);
                RunOutcome::NothingToDo(reason)
            }
            Err(e) => {
                self.enter(Phase::Aborted);
                warn!("Run aborted: {}", e);
                self.notifier.notify(Severity::Alert, "Backup aborted", &e.to_string()).await;
                RunOutcome::Aborted(e)
            }
        };

        RunReport {
            run_id: self.run_id,
            role: self.config.role,
            outcome,
            phases: self.phases,
            state: self.state,
            sync_reports: self.sync_reports,
            workload_reports: self.workload_reports,
        }
    }

    async fn run_responder(&mut self) -> Result<Finish, OrchestratorError> {
        let mut trigger_present = self.trigger.exists().await;
        self.state.sync_requested = trigger_present || self.config.flags.force_start;
        self.state.backup_online = true;

        self.enter(Phase::ProbePeer);
        self.state.source_online = self.prober.probe().await;

        if !self.state.source_online {
            if self.marker.exists().await {
                return Ok(Finish::NothingToDo("source was powered off by this host".into()));
            }
            if self.config.flags.check_and_start {
                return Ok(self.failover().await);
            }
            return Ok(Finish::NothingToDo("source is offline".into()));
        }
        self.clear_peer_off_marker().await;

        if !self.state.sync_requested {
            trigger_present = self.await_trigger().await;
            if !trigger_present {
                return Ok(Finish::NothingToDo("no trigger present and force start disabled".into()));
            }
            self.state.sync_requested = true;
        }

        if trigger_present {
            if let Some(plan) = self.trigger.read_plan().await {
                let planned = self.config.with_plan(&plan.flags, &plan.sync);
                match planned.validate() {
                    Ok(()) => {
                        info!("Using plan {} from {} ({})", plan.run_id, plan.initiator, plan.created_at);
                        self.config = planned;
                    }
                    Err(e) => warn!("Ignoring plan {}: {}", plan.run_id, e),
                }
            }
        }

        self.verify_remote_exec().await?;
        self.await_storage_online().await?;
        self.sync_and_finish().await
    }

    async fn run_initiator(&mut self) -> Result<Finish, OrchestratorError> {
        self.state.source_online = true;

        self.enter(Phase::ProbePeer);
        if self.prober.probe().await {
            warn!("Backup {} is already online", self.config.peer.address);
            self.notifier
                .notify(Severity::Warning, "Backup already online", "The backup server was expected to be off")
                .await;
        } else {
            self.enter(Phase::WakePeer);
            if let Err(e) = self.power.power_on().await {
                warn!("Power on request failed: {:#}", e);
                self.notifier.notify(Severity::Warning, "Power on failed", &format!("{:#}", e)).await;
            }

            self.enter(Phase::AwaitReady);
            let timing = &self.config.timing;
            let readiness = self.prober.wait_until_ready(timing.ready_attempts, timing.ready_interval()).await;
            if !readiness.is_ready() {
                return Err(OrchestratorError::ReadinessTimeout {
                    host: self.config.peer.address.clone(),
                    attempts: readiness.attempts(),
                });
            }
        }
        self.state.backup_online = true;
        self.clear_peer_off_marker().await;

        self.verify_remote_exec().await?;

        if self.config.flags.delegate_sync {
            self.enter(Phase::Handoff);
            self.handoff().await?;
            return Ok(Finish::Completed);
        }

        self.state.sync_requested = true;
        self.sync_and_finish().await
    }

    /// Polls for a trigger handed off by a delegating Initiator, for as long as the source stays up
    async fn await_trigger(&mut self) -> bool {
        let attempts = self.config.timing.trigger_wait_attempts;
        if attempts == 0 {
            return false;
        }
        self.enter(Phase::AwaitTrigger);
        let interval = self.config.timing.trigger_wait_interval();

        for attempt in 1..=attempts {
            tokio::time::sleep(interval).await;
            if self.trigger.exists().await {
                info!("Trigger appeared after {} checks", attempt);
                return true;
            }
            if !self.prober.probe().await {
                info!("Source went offline while waiting for a trigger");
                self.state.source_online = false;
                return false;
            }
            debug!("No trigger yet ({}/{})", attempt, attempts);
        }
        false
    }

    /// Steps shared by both roles once the source is usable
    async fn sync_and_finish(&mut self) -> Result<Finish, OrchestratorError> {
        self.state.power_off_target = self.config.flags.power_off_target;
        self.state.switch_server = self.config.flags.switch_server;

        self.check_vms().await?;
        self.notifier.notify(Severity::Normal, "Backup started", &format!("run {}", self.run_id)).await;

        let direction = self.direction();
        let engine = SyncEngine::new(
            self.runner.clone(),
            self.notifier.clone(),
            &self.config.sync,
            std::time::Duration::from_secs(self.config.timing.sync_idle_timeout_secs),
            self.config.timing.command_timeout(),
        );

        if self.config.flags.copy_main_data {
            self.enter(Phase::SyncData(SyncCategory::Main));
            let pairs = pairs_for(SyncCategory::Main, &self.config.sync);
            let report = engine.sync_category(SyncCategory::Main, direction, &pairs).await;
            self.sync_reports.push(report);
        }

        if self.config.flags.copy_app_data {
            let set = WorkloadSet::new(self.config.workloads.containers.clone());

            self.enter(Phase::QuiesceWorkloads);
            let local = self.workloads.stop(&set, Location::Local).await;
            let peer = self.workloads.stop(&set, Location::Peer).await;
            let quiesced = local.all_succeeded() && peer.all_succeeded();
            self.workload_reports.extend([local, peer]);

            if quiesced {
                self.enter(Phase::SyncData(SyncCategory::AppData));
                let pairs = pairs_for(SyncCategory::AppData, &self.config.sync);
                let report = engine.sync_category(SyncCategory::AppData, direction, &pairs).await;
                self.sync_reports.push(report);
            } else {
                warn!("Skipping app-data sync: not every workload stopped");
                self.notifier
                    .notify(Severity::Alert, "App-data sync skipped", "Some workloads could not be stopped")
                    .await;
            }

            self.enter(Phase::ResumeWorkloads);
            let primary = self.primary_location();
            let resumed = self.workloads.start(&set, primary).await;
            if !resumed.all_succeeded() {
                let names: Vec<&str> = resumed.failed.iter().map(|(n, _)| n.as_str()).collect();
                self.notifier
                    .notify(Severity::Alert, "Workloads not started", &format!("{:?} on {}", names, primary))
                    .await;
            }
            self.workload_reports.push(resumed);
        }

        self.enter(Phase::Cleanup);
        if let Err(e) = self.cleanup().await {
            warn!("Cleanup failed: {:#}", e);
            self.notifier.notify(Severity::Alert, "Trigger cleanup failed", &format!("{:#}", e)).await;
        }

        let failed: usize = self.sync_reports.iter().map(SyncReport::failed).sum();
        let transferred: usize = self.sync_reports.iter().map(SyncReport::transferred).sum();
        let severity = if failed > 0 { Severity::Warning } else { Severity::Normal };
        self.notifier
            .notify(severity, "Backup finished", &format!("{} pair(s) mirrored, {} failed", transferred, failed))
            .await;

        self.power_off().await;
        Ok(Finish::Completed)
    }

    /// Consume the local trigger file; a missing trigger is not an error
    pub async fn cleanup(&self) -> anyhow::Result<bool> {
        self.trigger.consume().await
    }

    async fn failover(&mut self) -> Finish {
        self.enter(Phase::Failover);
        warn!("Source {} is offline, starting failover workloads", self.config.peer.address);

        let set = WorkloadSet::new(self.config.workloads.failover_containers.clone());
        let report = self.workloads.start(&set, Location::Local).await;
        let severity = if report.all_succeeded() { Severity::Warning } else { Severity::Alert };
        self.notifier
            .notify(
                severity,
                "Source offline",
                &format!("started {:?}, failed {}", report.succeeded, report.failed.len()),
            )
            .await;
        self.workload_reports.push(report);
        Finish::Completed
    }

    async fn verify_remote_exec(&mut self) -> Result<(), OrchestratorError> {
        self.enter(Phase::VerifyRemoteExec);
        if self.prober.verify_remote_exec().await {
            Ok(())
        } else {
            Err(OrchestratorError::RemoteExecUnavailable(self.config.peer.address.clone()))
        }
    }

    async fn await_storage_online(&mut self) -> Result<(), OrchestratorError> {
        self.enter(Phase::AwaitStorageOnline);
        let timing = self.config.timing.clone();
        let path = self.config.peer.storage_path.clone();

        let readiness = self
            .prober
            .wait_for_path(&path, timing.storage_attempts, timing.storage_interval())
            .await;
        if !readiness.is_ready() {
            return Err(OrchestratorError::StorageTimeout {
                host: self.config.peer.address.clone(),
                path,
                attempts: readiness.attempts(),
            });
        }

        if !timing.stabilization().is_zero() {
            info!("Storage online, waiting {:?} for services to settle", timing.stabilization());
            tokio::time::sleep(timing.stabilization()).await;
        }
        Ok(())
    }

    /// VM veto: guarded VMs on the source keep it (and the run) alive
    async fn check_vms(&mut self) -> Result<(), OrchestratorError> {
        if self.config.vms.guarded.is_empty() {
            return Ok(());
        }
        self.enter(Phase::CheckVms);

        let running = self.running_guarded_vms().await;
        if running.is_empty() {
            return Ok(());
        }
        self.state.vms_running = true;

        if !self.config.flags.continue_if_vms_running {
            return Err(OrchestratorError::VmVeto(running));
        }

        warn!("Guarded VMs running ({:?}); only the backup may be powered off", running);
        self.state.power_off_target = PowerOffTarget::Backup;
        self.state.switch_server = false;
        self.notifier
            .notify(
                Severity::Warning,
                "Virtual machines running",
                &format!("{:?} running, source stays up and primary", running),
            )
            .await;
        Ok(())
    }

    async fn running_guarded_vms(&self) -> Vec<String> {
        let command = CommandSpec::new("virsh", ["list", "--state-running", "--name"])
            .with_timeout(self.config.timing.command_timeout());
        let guarded = &self.config.vms.guarded;

        match self.runner.run_at(self.source_location(), &command).await {
            Ok(result) if result.success => {
                let running: Vec<&str> = result.output.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
                guarded.iter().filter(|vm| running.contains(&vm.as_str())).cloned().collect()
            }
            Ok(result) => {
                warn!("Could not list VMs ({}), assuming guarded VMs run", result.describe_failure());
                guarded.clone()
            }
            Err(e) => {
                warn!("Could not list VMs ({}), assuming guarded VMs run", e);
                guarded.clone()
            }
        }
    }

    /// Place the plan snapshot as the trigger file on the peer
    async fn handoff(&mut self) -> Result<(), OrchestratorError> {
        let plan = PlanSnapshot::new(self.run_id, &self.config.flags, &self.config.sync);
        let remote_path = self.config.state.trigger_file.clone();
        let staging = std::env::temp_dir().join(format!("twinsync-plan-{}.json", self.run_id));
        tokio::fs::write(&staging, plan.to_json()?).await?;

        let result = self.push_trigger(&staging, &remote_path).await;
        if let Err(e) = tokio::fs::remove_file(&staging).await {
            warn!("Failed to remove {}: {}", staging.display(), e);
        }
        result?;

        self.state.sync_requested = true;
        self.notifier
            .notify(Severity::Normal, "Backup requested", &format!("plan {} handed to {}", self.run_id, self.config.peer.address))
            .await;
        Ok(())
    }

    async fn push_trigger(&self, staging: &std::path::Path, remote_path: &std::path::Path) -> anyhow::Result<()> {
        let timeout = self.config.timing.command_timeout();
        if let Some(parent) = remote_path.parent() {
            let mkdir = CommandSpec::new("mkdir", ["-p".to_string(), parent.display().to_string()]).with_timeout(timeout);
            let result = self.runner.run_on_peer(&mkdir).await?;
            if !result.success {
                anyhow::bail!("Failed to create {} on peer: {}", parent.display(), result.describe_failure());
            }
        }

        let ssh = self.runner.ssh();
        let copy = CommandSpec::new(
            "rsync",
            [
                "-e".to_string(),
                ssh.rsync_transport(),
                staging.display().to_string(),
                format!("{}:{}", ssh.destination(), remote_path.display()),
            ],
        )
        .with_timeout(timeout);
        let result = self.runner.run_local(&copy).await?;
        if !result.success {
            anyhow::bail!("Failed to copy trigger to peer: {}", result.describe_failure());
        }
        Ok(())
    }

    async fn power_off(&mut self) {
        let target = self.state.power_off_target;
        if target == PowerOffTarget::None {
            return;
        }
        self.enter(Phase::PowerOff);

        let (peer_off, local_off) = match self.config.role {
            Role::Initiator => (target.includes_backup(), target.includes_source()),
            Role::Responder => (target.includes_source(), target.includes_backup()),
        };

        if peer_off {
            match self.marker.record(&self.config.peer.address, self.run_id).await {
                Ok(()) => {
                    if let Err(e) = self.power.power_off_peer().await {
                        warn!("Peer power off failed: {:#}", e);
                        self.notifier.notify(Severity::Alert, "Peer power off failed", &format!("{:#}", e)).await;
                    }
                }
                Err(e) => {
                    warn!("Not powering off peer, marker could not be written: {:#}", e);
                    self.notifier.notify(Severity::Alert, "Peer left running", &format!("{:#}", e)).await;
                }
            }
        }

        if local_off {
            self.notifier.notify(Severity::Normal, "Shutting down", "this host powers off now").await;
            if let Err(e) = self.power.power_off_local().await {
                warn!("Local power off failed: {:#}", e);
                self.notifier.notify(Severity::Alert, "Power off failed", &format!("{:#}", e)).await;
            }
        }
    }

    async fn clear_peer_off_marker(&self) {
        match self.marker.clear().await {
            Ok(true) => info!("Peer is back online, cleared power-off marker"),
            Ok(false) => {}
            Err(e) => warn!("Failed to clear power-off marker: {:#}", e),
        }
    }

    fn direction(&self) -> Direction {
        match self.config.role {
            Role::Initiator => Direction::Push,
            Role::Responder => Direction::Pull,
        }
    }

    fn source_location(&self) -> Location {
        self.direction().source_location()
    }

    /// Host that serves the workloads once the run is over
    fn primary_location(&self) -> Location {
        let source = self.source_location();
        if self.state.switch_server {
            match source {
                Location::Local => Location::Peer,
                Location::Peer => Location::Local,
            }
        } else {
            source
        }
    }

    fn enter(&mut self, phase: Phase) {
        info!("[{}] -> {:?}", &self.run_id.to_string()[..8], phase);
        self.phases.push(phase);
    }
}
