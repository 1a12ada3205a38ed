//! Directory sync engine
//!
//! Mirrors configured (source, destination) pairs with rsync. Source paths
//! live on the source server, destination paths on the backup server; the
//! role decides which of the two is local ([`Direction`]).
//!
//! Guards, checked for every pair before any transfer:
//! - a pair with an empty path is skipped silently
//! - a destination that resolves to `/` is rejected (alert)
//! - an absent or empty source is skipped (warning), so an empty source can
//!   never wipe a populated destination through `--delete`
//!
//! Pairs are independent: a failure is notified and the next pair runs.

use serde::Serialize;
use std::path::{Component, Path};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::{PathPair, SyncSection};
use crate::execution::{CommandSpec, HostRunner, Location};
use crate::notify::{Severity, SharedNotifier};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncCategory {
    Main,
    AppData,
}

impl std::fmt::Display for SyncCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncCategory::Main => f.write_str("main"),
            SyncCategory::AppData => f.write_str("app-data"),
        }
    }
}

/// Which way data flows relative to this host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Local source, peer destination (Initiator)
    Push,
    /// Peer source, local destination (Responder)
    Pull,
}

impl Direction {
    pub fn source_location(self) -> Location {
        match self {
            Direction::Push => Location::Local,
            Direction::Pull => Location::Peer,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncPair {
    /// 1-based position in its category
    pub index: usize,
    pub category: SyncCategory,
    pub source: String,
    pub destination: String,
}

impl SyncPair {
    pub fn is_configured(&self) -> bool {
        !self.source.trim().is_empty() && !self.destination.trim().is_empty()
    }
}

impl std::fmt::Display for SyncPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} #{} ({} -> {})", self.category, self.index, self.source, self.destination)
    }
}

/// Ordered pairs of one category, as configured
pub fn pairs_for(category: SyncCategory, section: &SyncSection) -> Vec<SyncPair> {
    let pairs: &[PathPair] = match category {
        SyncCategory::Main => &section.main,
        SyncCategory::AppData => &section.app_data,
    };
    pairs
        .iter()
        .enumerate()
        .map(|(i, p)| SyncPair {
            index: i + 1,
            category,
            source: p.source.trim().to_string(),
            destination: p.destination.trim().to_string(),
        })
        .collect()
}

/// `true` when `path` resolves to the filesystem root (`/`, `//`, `/./`, `/..`)
pub fn is_root_path(path: &str) -> bool {
    let path = Path::new(path.trim());
    if !path.has_root() {
        return false;
    }
    let mut depth: usize = 0;
    for component in path.components() {
        match component {
            Component::Normal(_) => depth += 1,
            Component::ParentDir => depth = depth.saturating_sub(1),
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
        }
    }
    depth == 0
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum PairOutcome {
    Transferred,
    /// Not eligible (unset path, absent or empty source)
    Skipped(String),
    /// Safety guard refused the pair
    Rejected(String),
    Failed(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub category: SyncCategory,
    pub direction: Direction,
    pub pairs: Vec<(SyncPair, PairOutcome)>,
}

impl SyncReport {
    pub fn count(&self, pred: impl Fn(&PairOutcome) -> bool) -> usize {
        self.pairs.iter().filter(|(_, o)| pred(o)).count()
    }

    pub fn transferred(&self) -> usize {
        self.count(|o| matches!(o, PairOutcome::Transferred))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, PairOutcome::Failed(_)))
    }

    pub fn rejected(&self) -> usize {
        self.count(|o| matches!(o, PairOutcome::Rejected(_)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum SourceState {
    Populated,
    Empty,
    Absent,
    Unavailable(String),
}

#[derive(Clone)]
pub struct SyncEngine {
    runner: HostRunner,
    notifier: SharedNotifier,
    delete_extraneous: bool,
    extra_args: Vec<String>,
    idle_timeout: Duration,
    command_timeout: Duration,
}

impl SyncEngine {
    pub fn new(
        runner: HostRunner,
        notifier: SharedNotifier,
        section: &SyncSection,
        idle_timeout: Duration,
        command_timeout: Duration,
    ) -> Self {
        Self {
            runner,
            notifier,
            delete_extraneous: section.delete_extraneous,
            extra_args: section.extra_args.clone(),
            idle_timeout,
            command_timeout,
        }
    }

    /// Mirror every eligible pair of `category`, one after the other
    pub async fn sync_category(&self, category: SyncCategory, direction: Direction, pairs: &[SyncPair]) -> SyncReport {
        info!("Syncing {} data ({:?}, {} pair(s))", category, direction, pairs.len());
        let mut report = SyncReport { category, direction, pairs: Vec::with_capacity(pairs.len()) };

        for pair in pairs {
            let outcome = self.sync_pair(pair, direction).await;
            report.pairs.push((pair.clone(), outcome));
        }

        info!(
            "{} sync done: {} transferred, {} failed, {} rejected",
            category,
            report.transferred(),
            report.failed(),
            report.rejected()
        );
        report
    }

    async fn sync_pair(&self, pair: &SyncPair, direction: Direction) -> PairOutcome {
        if !pair.is_configured() {
            debug!("{} #{} not configured, skipping", pair.category, pair.index);
            return PairOutcome::Skipped("path not set".into());
        }

        let rejection = if !Path::new(&pair.destination).is_absolute() {
            Some(format!("destination {} is not an absolute path", pair.destination))
        } else if is_root_path(&pair.destination) {
            Some(format!("destination {} is the filesystem root", pair.destination))
        } else if !Path::new(&pair.source).is_absolute() {
            Some(format!("source {} is not an absolute path", pair.source))
        } else {
            None
        };
        if let Some(reason) = rejection {
            warn!("Rejecting {}: {}", pair, reason);
            self.notifier.notify(Severity::Alert, "Sync pair rejected", &format!("{}: {}", pair, reason)).await;
            return PairOutcome::Rejected(reason);
        }

        let reason = match self.source_state(&pair.source, direction).await {
            SourceState::Populated => None,
            SourceState::Empty => Some(format!("source {} is empty", pair.source)),
            SourceState::Absent => Some(format!("source {} does not exist", pair.source)),
            SourceState::Unavailable(e) => Some(format!("source {} could not be checked: {}", pair.source, e)),
        };
        if let Some(reason) = reason {
            warn!("Skipping {}: {}", pair, reason);
            self.notifier.notify(Severity::Warning, "Sync pair skipped", &format!("{}: {}", pair, reason)).await;
            return PairOutcome::Skipped(reason);
        }

        let command = self.rsync_command(pair, direction);
        info!("Mirroring {}", pair);
        match self.runner.run_local(&command).await {
            Ok(result) if result.success => PairOutcome::Transferred,
            Ok(result) => self.fail(pair, result.describe_failure()).await,
            Err(e) => self.fail(pair, e.to_string()).await,
        }
    }

    async fn fail(&self, pair: &SyncPair, reason: String) -> PairOutcome {
        warn!("Sync of {} failed: {}", pair, reason);
        self.notifier.notify(Severity::Alert, "Sync pair failed", &format!("{}: {}", pair, reason)).await;
        PairOutcome::Failed(reason)
    }

    async fn source_state(&self, source: &str, direction: Direction) -> SourceState {
        match direction.source_location() {
            Location::Local => local_source_state(Path::new(source)).await,
            Location::Peer => {
                // trailing slash so a symlinked source directory is followed
                let dir = format!("{}/", source.trim_end_matches('/'));
                let command = CommandSpec::new("find", [dir.as_str(), "-mindepth", "1", "-maxdepth", "1", "-print", "-quit"])
                    .with_timeout(self.command_timeout);
                match self.runner.run_on_peer(&command).await {
                    Ok(result) if result.success && result.output.trim().is_empty() => SourceState::Empty,
                    Ok(result) if result.success => SourceState::Populated,
                    Ok(_) => SourceState::Absent,
                    Err(e) => SourceState::Unavailable(e.to_string()),
                }
            }
        }
    }

    /// rsync invocation for `pair`; trailing slashes mirror directory contents
    pub fn rsync_command(&self, pair: &SyncPair, direction: Direction) -> CommandSpec {
        let ssh = self.runner.ssh();
        let local_dir = |p: &str| format!("{}/", p.trim_end_matches('/'));
        let peer_dir = |p: &str| format!("{}:{}/", ssh.destination(), p.trim_end_matches('/'));

        let (src, dst) = match direction {
            Direction::Push => (local_dir(&pair.source), peer_dir(&pair.destination)),
            Direction::Pull => (peer_dir(&pair.source), local_dir(&pair.destination)),
        };

        let mut args = vec!["-aH".to_string()];
        if self.delete_extraneous {
            args.push("--delete".to_string());
        }
        args.push(format!("--timeout={}", self.idle_timeout.as_secs()));
        args.extend(self.extra_args.iter().cloned());
        args.push("-e".to_string());
        args.push(ssh.rsync_transport());
        args.push(src);
        args.push(dst);

        CommandSpec::new("rsync", args)
    }
}

async fn local_source_state(path: &Path) -> SourceState {
    match tokio::fs::read_dir(path).await {
        Ok(mut entries) => match entries.next_entry().await {
            Ok(Some(_)) => SourceState::Populated,
            Ok(None) => SourceState::Empty,
            Err(e) => SourceState::Unavailable(e.to_string()),
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => SourceState::Absent,
        // a regular file is not a directory tree to mirror
        Err(_) if path.exists() => SourceState::Absent,
        Err(e) => SourceState::Unavailable(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_detection() {
        for root in ["/", "//", "/./", "/.", " / ", "/mnt/..", "/../.."] {
            assert!(is_root_path(root), "{root:?} should be root");
        }
        for not_root in ["/mnt/user", "/mnt", "relative", "./", ""] {
            assert!(!is_root_path(not_root), "{not_root:?} should not be root");
        }
    }

    #[test]
    fn test_pairs_keep_order_and_index() {
        let section = SyncSection {
            main: vec![
                PathPair { source: "/a".into(), destination: "/b".into() },
                PathPair::default(),
                PathPair { source: " /c ".into(), destination: "/d".into() },
            ],
            ..SyncSection::default()
        };
        let pairs = pairs_for(SyncCategory::Main, &section);
        assert_eq!(pairs.len(), 3);
        assert_eq!(pairs[2].index, 3);
        assert_eq!(pairs[2].source, "/c");
        assert!(!pairs[1].is_configured());
        assert!(pairs_for(SyncCategory::AppData, &section).is_empty());
    }

    #[tokio::test]
    async fn test_local_source_state() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(local_source_state(dir.path()).await, SourceState::Empty);

        std::fs::write(dir.path().join("file.txt"), b"data").unwrap();
        assert_eq!(local_source_state(dir.path()).await, SourceState::Populated);

        assert_eq!(local_source_state(&dir.path().join("missing")).await, SourceState::Absent);
        assert_eq!(local_source_state(&dir.path().join("file.txt")).await, SourceState::Absent);
    }
}
