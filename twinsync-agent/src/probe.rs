//! Readiness probing
//!
//! Reachability (ICMP) and remote execution (SSH) are distinct capabilities:
//! a host can answer pings long before sshd accepts commands. Every wait here
//! is bounded by an attempt count.

use std::time::Duration;
use tracing::{debug, info, warn};

use crate::execution::{CommandSpec, HostRunner};

/// Outcome of a bounded wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready { attempts: u32 },
    TimedOut { attempts: u32 },
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        matches!(self, Readiness::Ready { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            Readiness::Ready { attempts } | Readiness::TimedOut { attempts } => *attempts,
        }
    }
}

#[derive(Clone)]
pub struct Prober {
    runner: HostRunner,
    probe_timeout: Duration,
    command_timeout: Duration,
}

impl Prober {
    pub fn new(runner: HostRunner, probe_timeout: Duration, command_timeout: Duration) -> Self {
        Self { runner, probe_timeout, command_timeout }
    }

    /// One ICMP echo against the peer
    pub async fn probe(&self) -> bool {
        let wait = self.probe_timeout.as_secs().max(1);
        let command = CommandSpec::new(
            "ping",
            ["-c".to_string(), "1".to_string(), "-W".to_string(), wait.to_string(), self.runner.ssh().address.clone()],
        )
        .with_timeout(self.probe_timeout + Duration::from_secs(2));

        match self.runner.run_local(&command).await {
            Ok(result) => result.success,
            Err(e) => {
                warn!("Probe of {} failed to run: {}", self.runner.ssh().address, e);
                false
            }
        }
    }

    /// Poll [`Prober::probe`] until it succeeds, at most `max_attempts` times
    pub async fn wait_until_ready(&self, max_attempts: u32, interval: Duration) -> Readiness {
        let address = &self.runner.ssh().address;
        for attempt in 1..=max_attempts {
            if self.probe().await {
                info!("{} is reachable (attempt {}/{})", address, attempt, max_attempts);
                return Readiness::Ready { attempts: attempt };
            }
            debug!("{} not reachable yet (attempt {}/{})", address, attempt, max_attempts);
            if attempt < max_attempts {
                tokio::time::sleep(interval).await;
            }
        }
        warn!("{} still unreachable after {} attempts", address, max_attempts);
        Readiness::TimedOut { attempts: max_attempts }
    }

    /// Authenticated command execution works on the peer
    pub async fn verify_remote_exec(&self) -> bool {
        let command = CommandSpec::new("true", Vec::<String>::new())
            .with_timeout(self.runner.ssh().connect_timeout + Duration::from_secs(5));

        match self.runner.run_on_peer(&command).await {
            Ok(result) if result.success => true,
            Ok(result) => {
                warn!("Remote execution on {} failed: {}", self.runner.ssh().address, result.describe_failure());
                false
            }
            Err(e) => {
                warn!("Remote execution on {} failed to run: {}", self.runner.ssh().address, e);
                false
            }
        }
    }

    /// Poll until `path` exists as a directory on the peer
    pub async fn wait_for_path(&self, path: &str, max_attempts: u32, interval: Duration) -> Readiness {
        let command = CommandSpec::new("test", ["-d", path]).with_timeout(self.command_timeout);
        for attempt in 1..=max_attempts {
            match self.runner.run_on_peer(&command).await {
                Ok(result) if result.success => {
                    info!("{} is online on {} (attempt {}/{})", path, self.runner.ssh().address, attempt, max_attempts);
                    return Readiness::Ready { attempts: attempt };
                }
                Ok(_) => debug!("{} not online yet (attempt {}/{})", path, attempt, max_attempts),
                Err(e) => warn!("Storage check failed to run: {}", e),
            }
            if attempt < max_attempts {
                tokio::time::sleep(interval).await;
            }
        }
        Readiness::TimedOut { attempts: max_attempts }
    }
}
