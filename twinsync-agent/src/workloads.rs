//! Service lifecycle management
//!
//! Stops and starts named containers on this host or on the peer. A set is
//! processed member by member; a failing member is logged and recorded but
//! never stops the rest of the set. Once the whole set is done the manager
//! waits for the settle delay so that containers finish flushing before the
//! next step touches their data.

use serde::Serialize;
use std::time::Duration;
use tracing::{info, warn};

use crate::execution::{CommandSpec, HostRunner, Location};

/// Named containers handled together
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkloadSet {
    names: Vec<String>,
}

impl WorkloadSet {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names
                .into_iter()
                .map(Into::into)
                .filter(|n: &String| !n.trim().is_empty())
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkloadAction {
    Start,
    Stop,
}

impl WorkloadAction {
    fn verb(self) -> &'static str {
        match self {
            WorkloadAction::Start => "start",
            WorkloadAction::Stop => "stop",
        }
    }
}

/// Per-member outcome of a start/stop over a set
#[derive(Debug, Clone, Serialize)]
pub struct WorkloadReport {
    pub action: WorkloadAction,
    pub location: Location,
    pub succeeded: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl WorkloadReport {
    pub fn all_succeeded(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Clone)]
pub struct WorkloadManager {
    runner: HostRunner,
    runtime: String,
    settle: Duration,
    command_timeout: Duration,
}

impl WorkloadManager {
    pub fn new(runner: HostRunner, runtime: impl Into<String>, settle: Duration, command_timeout: Duration) -> Self {
        Self { runner, runtime: runtime.into(), settle, command_timeout }
    }

    pub async fn stop(&self, set: &WorkloadSet, location: Location) -> WorkloadReport {
        self.apply(WorkloadAction::Stop, set, location).await
    }

    pub async fn start(&self, set: &WorkloadSet, location: Location) -> WorkloadReport {
        self.apply(WorkloadAction::Start, set, location).await
    }

    async fn apply(&self, action: WorkloadAction, set: &WorkloadSet, location: Location) -> WorkloadReport {
        let mut report = WorkloadReport {
            action,
            location,
            succeeded: Vec::new(),
            failed: Vec::new(),
        };
        if set.is_empty() {
            return report;
        }

        info!("{} {} workload(s) on {}: {:?}", action.verb(), set.names().len(), location, set.names());
        for name in set.names() {
            let command = CommandSpec::new(self.runtime.clone(), [action.verb(), name.as_str()])
                .with_timeout(self.command_timeout);
            match self.runner.run_at(location, &command).await {
                Ok(result) if result.success => report.succeeded.push(name.clone()),
                Ok(result) => {
                    let reason = result.describe_failure();
                    warn!("Failed to {} {} on {}: {}", action.verb(), name, location, reason);
                    report.failed.push((name.clone(), reason));
                }
                Err(e) => {
                    warn!("Failed to {} {} on {}: {}", action.verb(), name, location, e);
                    report.failed.push((name.clone(), e.to_string()));
                }
            }
        }

        if !self.settle.is_zero() {
            info!("Waiting {:?} for workloads to settle", self.settle);
            tokio::time::sleep(self.settle).await;
        }
        report
    }
}
