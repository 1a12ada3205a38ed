//! twinsync - source/backup server sync orchestration
//!
//! Wakes the backup server, waits until it is usable, quiesces containers,
//! mirrors directory pairs with rsync and powers hosts off, the same library
//! serving both ends of the pair:
//! - Initiator (source server): wake, verify, hand off or push the sync
//! - Responder (backup server): consume the trigger, pull, clean up

pub mod config;
pub mod error;
pub mod execution;
pub mod notify;
pub mod orchestrator;
pub mod power;
pub mod probe;
pub mod state;
pub mod sync;
pub mod workloads;

pub use config::{Config, Role};
pub use error::{ConfigError, OrchestratorError};
pub use execution::{CommandSpec, ExecutionResult, Executor, Location, SystemExecutor};
pub use notify::{Notifier, Severity};
pub use orchestrator::{Orchestrator, Phase, RunOutcome, RunReport};
