//! Error types and process exit codes
//!
//! Configuration problems are reported before any side effect happens.
//! Orchestrator errors are the fatal outcomes of a run; everything else
//! (a single pair, a single container) is best-effort and never surfaces here.

use std::path::PathBuf;

/// Errors raised while loading or validating the configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    NotFound(PathBuf),
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("missing required setting: {0}")]
    Missing(&'static str),
    #[error("invalid setting {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
    #[error("category {category} has {count} pairs, at most {max} are allowed")]
    TooManyPairs {
        category: &'static str,
        count: usize,
        max: usize,
    },
    #[error("could not determine the configuration directory")]
    NoConfigDir,
}

/// Fatal conditions that abort a run
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("remote execution on {0} is not usable")]
    RemoteExecUnavailable(String),
    #[error("{host} did not become reachable after {attempts} attempts")]
    ReadinessTimeout { host: String, attempts: u32 },
    #[error("storage {path} on {host} did not come online after {attempts} attempts")]
    StorageTimeout {
        host: String,
        path: String,
        attempts: u32,
    },
    #[error("guarded virtual machines are running: {0:?}")]
    VmVeto(Vec<String>),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub const EXIT_FATAL: u8 = 1;
pub const EXIT_NOTHING_TO_DO: u8 = 2;
pub const EXIT_CONFIG: u8 = 10;
pub const EXIT_REMOTE_EXEC: u8 = 11;
pub const EXIT_TIMEOUT: u8 = 12;
pub const EXIT_VM_VETO: u8 = 13;
pub const EXIT_INTERRUPTED: u8 = 130;

impl OrchestratorError {
    pub fn exit_code(&self) -> u8 {
        match self {
            OrchestratorError::RemoteExecUnavailable(_) => EXIT_REMOTE_EXEC,
            OrchestratorError::ReadinessTimeout { .. } => EXIT_TIMEOUT,
            OrchestratorError::StorageTimeout { .. } => EXIT_TIMEOUT,
            OrchestratorError::VmVeto(_) => EXIT_VM_VETO,
            OrchestratorError::Io(_) | OrchestratorError::Other(_) => EXIT_FATAL,
        }
    }
}
