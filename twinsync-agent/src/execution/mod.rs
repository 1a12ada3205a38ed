//! Command execution module
//!
//! Every side effect on a host goes through an [`Executor`]:
//! - Local commands (ping, rsync, ipmitool, shutdown)
//! - Peer commands wrapped in a non-interactive SSH invocation
//! - Optional timeout per command; children are killed when dropped
//!
//! Tests substitute the executor with a recording double.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command as AsyncCommand;
use tracing::debug;

use crate::config::Config;

/// A program invocation, not interpreted by any shell
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            timeout: None,
        }
    }

    /// Parse a configured command line such as `shutdown -h now`
    pub fn parse(command_line: &str) -> Result<Self> {
        let mut words = shell_words::split(command_line)
            .with_context(|| format!("Invalid command line: {}", command_line))?;
        if words.is_empty() {
            anyhow::bail!("Empty command line");
        }
        let program = words.remove(0);
        Ok(Self { program, args: words, timeout: None })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Shell-quoted rendering, used for logs and for the SSH remote command
    pub fn rendered(&self) -> String {
        let mut words = Vec::with_capacity(self.args.len() + 1);
        words.push(self.program.as_str());
        words.extend(self.args.iter().map(String::as_str));
        shell_words::join(words)
    }
}

/// Command execution result
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
    pub exit_code: Option<i32>,
    pub execution_time_ms: u128,
}

impl ExecutionResult {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            error: None,
            exit_code: Some(0),
            execution_time_ms: 0,
        }
    }

    pub fn failed(exit_code: i32, error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: Some(error.into()),
            exit_code: Some(exit_code),
            execution_time_ms: 0,
        }
    }

    /// One-line reason for logs and notifications
    pub fn describe_failure(&self) -> String {
        match (&self.error, self.exit_code) {
            (Some(e), _) => e.trim().to_string(),
            (None, Some(code)) => format!("exit code {}", code),
            (None, None) => "terminated by signal".to_string(),
        }
    }
}

/// Runs commands on the local machine
#[async_trait]
pub trait Executor: Send + Sync {
    /// Spawn failures and timeouts are reported as unsuccessful results;
    /// `Err` is reserved for problems the caller cannot act on.
    async fn run(&self, command: &CommandSpec) -> Result<ExecutionResult>;
}

pub type SharedExecutor = Arc<dyn Executor>;

/// Real process executor backed by `tokio::process`
pub struct SystemExecutor;

#[async_trait]
impl Executor for SystemExecutor {
    async fn run(&self, command: &CommandSpec) -> Result<ExecutionResult> {
        let start_time = Instant::now();
        debug!("Executing: {} (timeout: {:?})", command.rendered(), command.timeout);

        let child = AsyncCommand::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = match command.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, child).await {
                Ok(output) => output,
                Err(_) => {
                    return Ok(ExecutionResult {
                        success: false,
                        output: String::new(),
                        error: Some(format!("Command timed out after {:?}", timeout)),
                        exit_code: None,
                        execution_time_ms: start_time.elapsed().as_millis(),
                    })
                }
            },
            None => child.await,
        };

        let execution_time = start_time.elapsed().as_millis();

        let output = match output {
            Ok(output) => output,
            Err(e) => {
                return Ok(ExecutionResult {
                    success: false,
                    output: String::new(),
                    error: Some(format!("Failed to execute {}: {}", command.program, e)),
                    exit_code: Some(-1),
                    execution_time_ms: execution_time,
                })
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        Ok(ExecutionResult {
            success: output.status.success(),
            output: stdout,
            error: if stderr.trim().is_empty() { None } else { Some(stderr) },
            exit_code: output.status.code(),
            execution_time_ms: execution_time,
        })
    }
}

/// Where a host-level operation runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Location {
    Local,
    Peer,
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Location::Local => f.write_str("local"),
            Location::Peer => f.write_str("peer"),
        }
    }
}

/// SSH access to the peer
#[derive(Debug, Clone)]
pub struct SshTarget {
    pub user: String,
    pub address: String,
    pub port: u16,
    pub identity: Option<PathBuf>,
    pub connect_timeout: Duration,
}

impl SshTarget {
    pub fn from_config(config: &Config) -> Self {
        Self {
            user: config.peer.ssh_user.clone(),
            address: config.peer.address.clone(),
            port: config.peer.ssh_port,
            identity: config.peer.ssh_identity.clone(),
            connect_timeout: Duration::from_secs(config.timing.ssh_connect_timeout_secs),
        }
    }

    /// `user@address`
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.address)
    }

    /// Options shared by `ssh` and rsync's `-e` transport
    pub fn options(&self) -> Vec<String> {
        let mut opts = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            "-p".to_string(),
            self.port.to_string(),
        ];
        if let Some(identity) = &self.identity {
            opts.push("-i".to_string());
            opts.push(identity.display().to_string());
        }
        opts
    }

    /// Transport string for `rsync -e`
    pub fn rsync_transport(&self) -> String {
        let mut words = vec!["ssh".to_string()];
        words.extend(self.options());
        shell_words::join(words)
    }

    /// Wrap `command` so that it runs on the peer
    pub fn wrap(&self, command: &CommandSpec) -> CommandSpec {
        let mut args = self.options();
        args.push(self.destination());
        args.push("--".to_string());
        args.push(command.rendered());
        CommandSpec { program: "ssh".to_string(), args, timeout: command.timeout }
    }
}

/// Executor plus the peer's SSH target: runs a command at a [`Location`]
#[derive(Clone)]
pub struct HostRunner {
    executor: SharedExecutor,
    ssh: SshTarget,
}

impl HostRunner {
    pub fn new(executor: SharedExecutor, ssh: SshTarget) -> Self {
        Self { executor, ssh }
    }

    pub fn ssh(&self) -> &SshTarget {
        &self.ssh
    }

    pub async fn run_local(&self, command: &CommandSpec) -> Result<ExecutionResult> {
        self.executor.run(command).await
    }

    pub async fn run_on_peer(&self, command: &CommandSpec) -> Result<ExecutionResult> {
        self.executor.run(&self.ssh.wrap(command)).await
    }

    pub async fn run_at(&self, location: Location, command: &CommandSpec) -> Result<ExecutionResult> {
        match location {
            Location::Local => self.run_local(command).await,
            Location::Peer => self.run_on_peer(command).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> SshTarget {
        SshTarget {
            user: "root".into(),
            address: "192.168.1.10".into(),
            port: 2222,
            identity: Some(PathBuf::from("/root/.ssh/backup key")),
            connect_timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_parse_and_render_command_line() {
        let spec = CommandSpec::parse("shutdown -h now").unwrap();
        assert_eq!(spec.program, "shutdown");
        assert_eq!(spec.args, vec!["-h", "now"]);
        assert_eq!(spec.rendered(), "shutdown -h now");

        let quoted = CommandSpec::new("test", ["-d", "/mnt/user/My Files"]);
        assert_eq!(quoted.rendered(), "test -d '/mnt/user/My Files'");

        assert!(CommandSpec::parse("   ").is_err());
    }

    #[test]
    fn test_ssh_wrap_is_non_interactive() {
        let wrapped = target().wrap(&CommandSpec::new("docker", ["stop", "mariadb"]));
        assert_eq!(wrapped.program, "ssh");
        assert!(wrapped.args.contains(&"BatchMode=yes".to_string()));
        assert!(wrapped.args.contains(&"ConnectTimeout=5".to_string()));
        assert!(wrapped.args.contains(&"2222".to_string()));
        assert!(wrapped.args.contains(&"/root/.ssh/backup key".to_string()));
        assert_eq!(wrapped.args.last().unwrap(), "docker stop mariadb");
        assert_eq!(wrapped.args[wrapped.args.len() - 3], "root@192.168.1.10");
    }

    #[test]
    fn test_rsync_transport_quotes_identity() {
        let transport = target().rsync_transport();
        assert!(transport.starts_with("ssh -o BatchMode=yes"));
        assert!(transport.contains("'/root/.ssh/backup key'"));
    }

    #[tokio::test]
    async fn test_system_executor_runs_command() {
        let result = SystemExecutor
            .run(&CommandSpec::new("echo", ["Hello World"]).with_timeout(Duration::from_secs(5)))
            .await
            .unwrap();

        assert!(result.success);
        assert!(result.output.contains("Hello World"));
        assert!(result.execution_time_ms < 5000);
    }

    #[tokio::test]
    async fn test_system_executor_timeout() {
        let result = SystemExecutor
            .run(&CommandSpec::new("sleep", ["10"]).with_timeout(Duration::from_secs(1)))
            .await
            .unwrap();

        assert!(!result.success);
        assert!(result.error.is_some());
    }

    #[tokio::test]
    async fn test_system_executor_missing_program() {
        let result = SystemExecutor
            .run(&CommandSpec::new("twinsync-definitely-not-a-program", Vec::<String>::new()))
            .await
            .unwrap();

        assert!(!result.success);
        assert!(result.describe_failure().contains("Failed to execute"));
    }
}
