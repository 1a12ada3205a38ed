//! Durable flags shared across runs
//!
//! - Trigger file: "a sync cycle is requested". Written by the Initiator
//!   (carrying a plan snapshot), consumed once by the Responder.
//! - Peer-off marker: "this host deliberately powered off its peer".
//!
//! These two files are the only state that outlives a run.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{Flags, SyncSection};

/// Sync plan agreed for one cycle, serialized into the trigger file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanSnapshot {
    pub run_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub initiator: String,
    pub flags: Flags,
    pub sync: SyncSection,
}

impl PlanSnapshot {
    pub fn new(run_id: Uuid, flags: &Flags, sync: &SyncSection) -> Self {
        Self {
            run_id,
            created_at: Utc::now(),
            initiator: local_hostname(),
            flags: flags.clone(),
            sync: sync.clone(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize plan snapshot")
    }
}

pub fn local_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}

async fn write_file(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    tokio::fs::write(path, content)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))
}

/// Delete `path`; `Ok(false)` when it was already gone
async fn remove_if_present(path: &Path) -> Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
    }
}

#[derive(Debug, Clone)]
pub struct TriggerFile {
    path: PathBuf,
}

impl TriggerFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub async fn exists(&self) -> bool {
        tokio::fs::try_exists(&self.path).await.unwrap_or(false)
    }

    /// Plan carried by the trigger; `None` when absent, empty or unreadable
    pub async fn read_plan(&self) -> Option<PlanSnapshot> {
        let content = tokio::fs::read_to_string(&self.path).await.ok()?;
        if content.trim().is_empty() {
            return None;
        }
        match serde_json::from_str(&content) {
            Ok(plan) => Some(plan),
            Err(e) => {
                warn!("Ignoring unreadable plan in {}: {}", self.path.display(), e);
                None
            }
        }
    }

    pub async fn write(&self, plan: &PlanSnapshot) -> Result<()> {
        write_file(&self.path, &plan.to_json()?).await?;
        info!("Trigger written to {}", self.path.display());
        Ok(())
    }

    /// Remove the trigger. Idempotent: consuming an absent trigger is a no-op.
    pub async fn consume(&self) -> Result<bool> {
        let removed = remove_if_present(&self.path).await?;
        if removed {
            info!("Trigger {} consumed", self.path.display());
        } else {
            debug!("No trigger at {}, nothing to consume", self.path.display());
        }
        Ok(removed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerOffRecord {
    pub peer: String,
    pub run_id: Uuid,
    pub powered_off_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct PeerOffMarker {
    path: PathBuf,
}

impl PeerOffMarker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub async fn exists(&self) -> bool {
        tokio::fs::try_exists(&self.path).await.unwrap_or(false)
    }

    pub async fn read(&self) -> Option<PeerOffRecord> {
        let content = tokio::fs::read_to_string(&self.path).await.ok()?;
        serde_json::from_str(&content).ok()
    }

    /// Must be written before the shutdown request is issued
    pub async fn record(&self, peer: &str, run_id: Uuid) -> Result<()> {
        let record = PeerOffRecord {
            peer: peer.to_string(),
            run_id,
            powered_off_at: Utc::now(),
        };
        let content = serde_json::to_string_pretty(&record).context("Failed to serialize marker")?;
        write_file(&self.path, &content).await
    }

    pub async fn clear(&self) -> Result<bool> {
        remove_if_present(&self.path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_trigger_roundtrip_and_consume_twice() {
        let dir = tempfile::tempdir().unwrap();
        let trigger = TriggerFile::new(dir.path().join("state/sync.trigger"));
        assert!(!trigger.exists().await);

        let plan = PlanSnapshot::new(Uuid::new_v4(), &Flags::default(), &SyncSection::default());
        trigger.write(&plan).await.unwrap();
        assert!(trigger.exists().await);
        assert_eq!(trigger.read_plan().await.unwrap().run_id, plan.run_id);

        assert!(trigger.consume().await.unwrap());
        assert!(!trigger.consume().await.unwrap());
        assert!(!trigger.exists().await);
    }

    #[tokio::test]
    async fn test_empty_trigger_counts_but_has_no_plan() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.trigger");
        std::fs::write(&path, "").unwrap();

        let trigger = TriggerFile::new(&path);
        assert!(trigger.exists().await);
        assert!(trigger.read_plan().await.is_none());
    }

    #[tokio::test]
    async fn test_peer_off_marker() {
        let dir = tempfile::tempdir().unwrap();
        let marker = PeerOffMarker::new(dir.path().join("peer-powered-off.json"));
        let run_id = Uuid::new_v4();

        marker.record("192.168.1.10", run_id).await.unwrap();
        assert!(marker.exists().await);
        assert_eq!(marker.read().await.unwrap().run_id, run_id);

        assert!(marker.clear().await.unwrap());
        assert!(!marker.clear().await.unwrap());
    }
}
