//! Configuration management
//!
//! Handles:
//! - Peer endpoint (address, SSH credential, MAC, power method)
//! - Run flags (which categories to copy, failover, power-off target)
//! - Sync pairs per category, workloads, guarded VMs
//! - Timing bounds for every wait loop
//!
//! The configuration is loaded once, validated, and never mutated afterwards.
//! A plan snapshot carried by a trigger file may replace `flags` and `sync`
//! for a single run, see [`Config::with_plan`].

use crate::error::ConfigError;
use crate::power;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Maximum number of sync pairs per category
pub const MAX_PAIRS_PER_CATEGORY: usize = 9;

const CONFIG_ENV: &str = "TWINSYNC_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub role: Role,
    pub peer: PeerConfig,
    #[serde(default)]
    pub local: LocalConfig,
    #[serde(default)]
    pub flags: Flags,
    #[serde(default)]
    pub timing: Timing,
    #[serde(default)]
    pub sync: SyncSection,
    #[serde(default)]
    pub workloads: WorkloadConfig,
    #[serde(default)]
    pub vms: VmConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
}

/// Which side of the pair this process runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Source server: wakes the backup and hands off (or pushes) the sync
    Initiator,
    /// Backup server: consumes the trigger and pulls from the source
    #[default]
    Responder,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Initiator => f.write_str("initiator"),
            Role::Responder => f.write_str("responder"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    pub address: String,
    #[serde(default = "default_ssh_user")]
    pub ssh_user: String,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    #[serde(default)]
    pub ssh_identity: Option<PathBuf>,
    #[serde(default)]
    pub mac: Option<String>,
    /// Directory whose presence means the source's storage is online
    #[serde(default = "default_storage_path")]
    pub storage_path: String,
    #[serde(default = "default_remote_shutdown")]
    pub shutdown_command: String,
    #[serde(default)]
    pub power: PowerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PowerConfig {
    #[serde(default)]
    pub method: PowerMethod,
    /// Broadcast address for wake packets (default 255.255.255.255)
    #[serde(default)]
    pub broadcast: Option<String>,
    #[serde(default)]
    pub ipmi_host: Option<String>,
    #[serde(default)]
    pub ipmi_user: Option<String>,
    #[serde(default)]
    pub ipmi_password: Option<String>,
    #[serde(default)]
    pub outlet_address: Option<String>,
    #[serde(default)]
    pub outlet_kind: OutletKind,
    /// Switch the outlet off before switching it on
    #[serde(default)]
    pub power_cycle: bool,
}

impl Default for PowerConfig {
    fn default() -> Self {
        Self {
            method: PowerMethod::WakePacket,
            broadcast: None,
            ipmi_host: None,
            ipmi_user: None,
            ipmi_password: None,
            outlet_address: None,
            outlet_kind: OutletKind::Shelly,
            power_cycle: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PowerMethod {
    #[default]
    WakePacket,
    Ipmi,
    SmartOutlet,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutletKind {
    #[default]
    Shelly,
    Tasmota,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalConfig {
    #[serde(default = "default_local_shutdown")]
    pub shutdown_command: String,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self { shutdown_command: default_local_shutdown() }
    }
}

/// Host(s) to power off at the end of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerOffTarget {
    #[default]
    None,
    Source,
    Backup,
    Both,
}

impl PowerOffTarget {
    pub fn includes_source(self) -> bool {
        matches!(self, PowerOffTarget::Source | PowerOffTarget::Both)
    }

    pub fn includes_backup(self) -> bool {
        matches!(self, PowerOffTarget::Backup | PowerOffTarget::Both)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flags {
    #[serde(default = "default_true")]
    pub copy_main_data: bool,
    #[serde(default)]
    pub copy_app_data: bool,
    /// Run even when no trigger file is present
    #[serde(default)]
    pub force_start: bool,
    /// Start the failover workloads locally when the source is down
    #[serde(default)]
    pub check_and_start: bool,
    /// The backup becomes the primary once the sync is done
    #[serde(default)]
    pub switch_server: bool,
    #[serde(default)]
    pub power_off_target: PowerOffTarget,
    #[serde(default)]
    pub continue_if_vms_running: bool,
    /// Initiator only: write the trigger on the peer instead of pushing
    #[serde(default)]
    pub delegate_sync: bool,
}

impl Default for Flags {
    fn default() -> Self {
        Self {
            copy_main_data: true,
            copy_app_data: false,
            force_start: false,
            check_and_start: false,
            switch_server: false,
            power_off_target: PowerOffTarget::None,
            continue_if_vms_running: false,
            delegate_sync: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timing {
    pub probe_timeout_secs: u64,
    pub ready_attempts: u32,
    pub ready_interval_secs: u64,
    pub ssh_connect_timeout_secs: u64,
    pub storage_attempts: u32,
    pub storage_interval_secs: u64,
    pub stabilization_secs: u64,
    pub settle_secs: u64,
    pub command_timeout_secs: u64,
    pub sync_idle_timeout_secs: u64,
    pub outlet_cycle_secs: u64,
    /// Wait between the remote shutdown request and cutting outlet power
    pub outlet_off_delay_secs: u64,
    /// Responder: polls for a trigger handed off while the source is up
    pub trigger_wait_attempts: u32,
    pub trigger_wait_interval_secs: u64,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            probe_timeout_secs: 2,
            ready_attempts: 30,
            ready_interval_secs: 10,
            ssh_connect_timeout_secs: 10,
            storage_attempts: 30,
            storage_interval_secs: 10,
            stabilization_secs: 30,
            settle_secs: 10,
            command_timeout_secs: 120,
            sync_idle_timeout_secs: 600,
            outlet_cycle_secs: 5,
            outlet_off_delay_secs: 60,
            trigger_wait_attempts: 30,
            trigger_wait_interval_secs: 10,
        }
    }
}

impl Timing {
    /// Timing with no delays, for dry environments and tests
    pub fn immediate() -> Self {
        Self {
            ready_interval_secs: 0,
            storage_interval_secs: 0,
            stabilization_secs: 0,
            settle_secs: 0,
            outlet_cycle_secs: 0,
            outlet_off_delay_secs: 0,
            trigger_wait_interval_secs: 0,
            ..Self::default()
        }
    }

    pub fn ready_interval(&self) -> Duration {
        Duration::from_secs(self.ready_interval_secs)
    }

    pub fn storage_interval(&self) -> Duration {
        Duration::from_secs(self.storage_interval_secs)
    }

    pub fn stabilization(&self) -> Duration {
        Duration::from_secs(self.stabilization_secs)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_secs(self.settle_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn outlet_cycle(&self) -> Duration {
        Duration::from_secs(self.outlet_cycle_secs)
    }

    pub fn outlet_off_delay(&self) -> Duration {
        Duration::from_secs(self.outlet_off_delay_secs)
    }

    pub fn trigger_wait_interval(&self) -> Duration {
        Duration::from_secs(self.trigger_wait_interval_secs)
    }
}

/// A (source, destination) pair as written in the config file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathPair {
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub destination: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSection {
    /// Delete destination entries that are absent from the source
    #[serde(default = "default_true")]
    pub delete_extraneous: bool,
    #[serde(default)]
    pub extra_args: Vec<String>,
    #[serde(default)]
    pub main: Vec<PathPair>,
    #[serde(default)]
    pub app_data: Vec<PathPair>,
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            delete_extraneous: true,
            extra_args: Vec::new(),
            main: Vec::new(),
            app_data: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadConfig {
    #[serde(default = "default_runtime")]
    pub runtime: String,
    /// Stopped around app-data syncs, started on the primary afterwards
    #[serde(default)]
    pub containers: Vec<String>,
    /// Started locally when the source is found down
    #[serde(default)]
    pub failover_containers: Vec<String>,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            runtime: default_runtime(),
            containers: Vec::new(),
            failover_containers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VmConfig {
    #[serde(default)]
    pub guarded: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    #[serde(default = "default_trigger_file")]
    pub trigger_file: PathBuf,
    #[serde(default = "default_peer_off_marker")]
    pub peer_off_marker: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            trigger_file: default_trigger_file(),
            peer_off_marker: default_peer_off_marker(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotifyConfig {
    /// e.g. `notify -i {severity} -s {subject} -d {message}`
    #[serde(default)]
    pub command: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_ssh_user() -> String {
    "root".to_string()
}

fn default_ssh_port() -> u16 {
    22
}

fn default_storage_path() -> String {
    "/mnt/user".to_string()
}

fn default_remote_shutdown() -> String {
    "poweroff".to_string()
}

fn default_local_shutdown() -> String {
    "shutdown -h now".to_string()
}

fn default_runtime() -> String {
    "docker".to_string()
}

fn default_trigger_file() -> PathBuf {
    PathBuf::from("/var/lib/twinsync/sync.trigger")
}

fn default_peer_off_marker() -> PathBuf {
    PathBuf::from("/var/lib/twinsync/peer-powered-off.json")
}

impl Config {
    /// Minimal config pointing at `address`, everything else defaulted
    pub fn for_peer(role: Role, address: impl Into<String>) -> Self {
        Self {
            role,
            peer: PeerConfig {
                address: address.into(),
                ssh_user: default_ssh_user(),
                ssh_port: default_ssh_port(),
                ssh_identity: None,
                mac: None,
                storage_path: default_storage_path(),
                shutdown_command: default_remote_shutdown(),
                power: PowerConfig { method: PowerMethod::None, ..PowerConfig::default() },
            },
            local: LocalConfig::default(),
            flags: Flags::default(),
            timing: Timing::default(),
            sync: SyncSection::default(),
            workloads: WorkloadConfig::default(),
            vms: VmConfig::default(),
            state: StateConfig::default(),
            notify: NotifyConfig::default(),
        }
    }

    /// Load and validate the config from `explicit`, `$TWINSYNC_CONFIG`
    /// or the OS config directory, in that order
    pub async fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match explicit {
            Some(p) => p.to_path_buf(),
            None => match std::env::var(CONFIG_ENV) {
                Ok(p) if !p.trim().is_empty() => PathBuf::from(p),
                _ => Self::config_file_path()?,
            },
        };

        if !path.exists() {
            return Err(ConfigError::NotFound(path));
        }

        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| ConfigError::Read { path: path.clone(), source })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Get OS-specific config file path
    pub fn config_file_path() -> Result<PathBuf, ConfigError> {
        let mut path = dirs::config_dir().ok_or(ConfigError::NoConfigDir)?;
        path.push("twinsync");
        path.push("config.toml");
        Ok(path)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.peer.address.trim().is_empty() {
            return Err(ConfigError::Missing("peer.address"));
        }
        if self.peer.ssh_user.trim().is_empty() {
            return Err(ConfigError::Missing("peer.ssh_user"));
        }
        if self.timing.ready_attempts == 0 {
            return Err(ConfigError::Invalid {
                key: "timing.ready_attempts",
                reason: "must be at least 1".into(),
            });
        }

        for (category, key, pairs) in [
            ("main", "sync.main", &self.sync.main),
            ("app_data", "sync.app_data", &self.sync.app_data),
        ] {
            if pairs.len() > MAX_PAIRS_PER_CATEGORY {
                return Err(ConfigError::TooManyPairs {
                    category,
                    count: pairs.len(),
                    max: MAX_PAIRS_PER_CATEGORY,
                });
            }
            // relative paths resolve against the cwd or the ssh home, `..` included
            for (i, pair) in pairs.iter().enumerate() {
                for path in [&pair.source, &pair.destination] {
                    let path = path.trim();
                    if !path.is_empty() && !Path::new(path).is_absolute() {
                        return Err(ConfigError::Invalid {
                            key,
                            reason: format!("pair #{}: {} is not an absolute path", i + 1, path),
                        });
                    }
                }
            }
        }

        let power = &self.peer.power;
        match power.method {
            PowerMethod::WakePacket => {
                let mac = self.peer.mac.as_deref().ok_or(ConfigError::Missing("peer.mac"))?;
                power::parse_mac(mac).map_err(|e| ConfigError::Invalid {
                    key: "peer.mac",
                    reason: e.to_string(),
                })?;
            }
            PowerMethod::Ipmi => {
                if power.ipmi_host.as_deref().map_or(true, |h| h.trim().is_empty()) {
                    return Err(ConfigError::Missing("peer.power.ipmi_host"));
                }
                if power.ipmi_user.as_deref().map_or(true, |u| u.trim().is_empty()) {
                    return Err(ConfigError::Missing("peer.power.ipmi_user"));
                }
            }
            PowerMethod::SmartOutlet => {
                if power.outlet_address.as_deref().map_or(true, |a| a.trim().is_empty()) {
                    return Err(ConfigError::Missing("peer.power.outlet_address"));
                }
            }
            PowerMethod::None => {}
        }

        for (key, path) in [
            ("state.trigger_file", &self.state.trigger_file),
            ("state.peer_off_marker", &self.state.peer_off_marker),
        ] {
            if !path.is_absolute() {
                return Err(ConfigError::Invalid { key, reason: "must be an absolute path".into() });
            }
        }

        for (key, command) in [
            ("peer.shutdown_command", Some(self.peer.shutdown_command.as_str())),
            ("local.shutdown_command", Some(self.local.shutdown_command.as_str())),
            ("notify.command", self.notify.command.as_deref()),
        ] {
            if let Some(command) = command {
                let words = shell_words::split(command)
                    .map_err(|e| ConfigError::Invalid { key, reason: e.to_string() })?;
                if words.is_empty() {
                    return Err(ConfigError::Invalid { key, reason: "empty command".into() });
                }
            }
        }

        Ok(())
    }

    /// Copy of this config with flags and pairs taken from a plan snapshot
    pub fn with_plan(&self, flags: &Flags, sync: &SyncSection) -> Self {
        let mut config = self.clone();
        config.flags = flags.clone();
        config.sync = sync.clone();
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        role = "responder"

        [peer]
        address = "192.168.1.10"
        mac = "AA:BB:CC:DD:EE:FF"

        [flags]
        copy_app_data = true
        power_off_target = "source"

        [[sync.main]]
        source = "/mnt/user/media"
        destination = "/mnt/user/media"

        [[sync.app_data]]
        source = "/mnt/user/appdata"
        destination = "/mnt/user/appdata"

        [workloads]
        containers = ["nextcloud", "mariadb"]
    "#;

    #[test]
    fn test_parse_sample_config() {
        let config = Config::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.role, Role::Responder);
        assert_eq!(config.peer.ssh_user, "root");
        assert_eq!(config.peer.power.method, PowerMethod::WakePacket);
        assert!(config.flags.copy_main_data);
        assert!(config.flags.copy_app_data);
        assert_eq!(config.flags.power_off_target, PowerOffTarget::Source);
        assert_eq!(config.sync.app_data.len(), 1);
        assert!(config.sync.delete_extraneous);
        assert_eq!(config.workloads.runtime, "docker");
        assert_eq!(config.timing.sync_idle_timeout_secs, 600);
    }

    #[test]
    fn test_missing_peer_address_is_rejected() {
        let mut config = Config::for_peer(Role::Initiator, "  ");
        config.peer.power.method = PowerMethod::None;
        assert!(matches!(config.validate(), Err(ConfigError::Missing("peer.address"))));
    }

    #[test]
    fn test_too_many_pairs_is_rejected() {
        let mut config = Config::for_peer(Role::Responder, "backup.lan");
        config.sync.main = vec![PathPair::default(); MAX_PAIRS_PER_CATEGORY + 1];
        assert!(matches!(config.validate(), Err(ConfigError::TooManyPairs { category: "main", .. })));

        config.sync.main.truncate(MAX_PAIRS_PER_CATEGORY);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_wake_packet_requires_valid_mac() {
        let mut config = Config::for_peer(Role::Initiator, "backup.lan");
        config.peer.power.method = PowerMethod::WakePacket;
        assert!(matches!(config.validate(), Err(ConfigError::Missing("peer.mac"))));

        config.peer.mac = Some("AA:BB:CC".into());
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { key: "peer.mac", .. })));

        config.peer.mac = Some("aa-bb-cc-dd-ee-ff".into());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_relative_trigger_path_is_rejected() {
        let mut config = Config::for_peer(Role::Responder, "source.lan");
        config.state.trigger_file = PathBuf::from("sync.trigger");
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { key: "state.trigger_file", .. })
        ));
    }

    #[test]
    fn test_relative_sync_paths_are_rejected() {
        for path in [".", "..", "../..", "backups/data"] {
            let mut config = Config::for_peer(Role::Responder, "source.lan");
            config.sync.main = vec![PathPair { source: "/mnt/user/data".into(), destination: path.into() }];
            assert!(
                matches!(config.validate(), Err(ConfigError::Invalid { key: "sync.main", .. })),
                "destination {:?} accepted",
                path
            );

            let mut config = Config::for_peer(Role::Responder, "source.lan");
            config.sync.app_data = vec![PathPair { source: path.into(), destination: "/mnt/user/appdata".into() }];
            assert!(matches!(config.validate(), Err(ConfigError::Invalid { key: "sync.app_data", .. })));
        }
    }

    #[test]
    fn test_with_plan_replaces_flags_and_pairs_only() {
        let config = Config::from_toml_str(SAMPLE).unwrap();
        let flags = Flags { force_start: true, copy_main_data: false, ..Flags::default() };
        let sync = SyncSection::default();

        let planned = config.with_plan(&flags, &sync);
        assert!(planned.flags.force_start);
        assert!(planned.sync.main.is_empty());
        assert_eq!(planned.peer.address, config.peer.address);
        assert_eq!(planned.workloads.containers, config.workloads.containers);
    }

    #[test]
    fn test_config_file_path() {
        let path = Config::config_file_path().unwrap();
        assert!(path.to_string_lossy().contains("twinsync"));
        assert!(path.to_string_lossy().contains("config.toml"));
    }
}
