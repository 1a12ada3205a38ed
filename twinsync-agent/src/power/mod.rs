//! Power control for the peer (and this host)
//!
//! Power-on strategies, selected by `peer.power.method`:
//! - wake-packet: magic packet over UDP broadcast (ports 9 and 7)
//! - ipmi: `ipmitool chassis power on` against the BMC
//! - smart-outlet: HTTP relay switch (Shelly or Tasmota)
//!
//! Power-off is a best-effort request: nothing waits for the host to go down.

use anyhow::{anyhow, bail, Context, Result};
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::{Config, OutletKind, PowerConfig, PowerMethod, Timing};
use crate::execution::{CommandSpec, HostRunner};

const WAKE_PORTS: [u16; 2] = [9, 7];
const WAKE_REPEAT: usize = 3;
const OUTLET_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MacError {
    #[error("bad mac length")]
    Length,
    #[error("bad mac hex")]
    Hex,
}

/// Accepts `AA:BB:CC:DD:EE:FF`, `aa-bb-cc-dd-ee-ff` or bare hex
pub fn parse_mac(mac: &str) -> Result<[u8; 6], MacError> {
    if mac.chars().any(|c| !(c.is_ascii_hexdigit() || c == ':' || c == '-' || c == '.')) {
        return Err(MacError::Hex);
    }
    let hex: String = mac.chars().filter(|c| c.is_ascii_hexdigit()).collect();
    if hex.len() != 12 {
        return Err(MacError::Length);
    }
    let mut out = [0u8; 6];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).map_err(|_| MacError::Hex)?;
    }
    Ok(out)
}

pub fn magic_packet(mac: [u8; 6]) -> [u8; 102] {
    let mut pkt = [0xFFu8; 102];
    // 16 fois l'adresse MAC
    for i in 0..16 {
        let base = 6 + i * 6;
        pkt[base..base + 6].copy_from_slice(&mac);
    }
    pkt
}

fn parse_broadcast(hint: Option<&str>) -> Ipv4Addr {
    hint.and_then(|s| s.parse::<Ipv4Addr>().ok())
        .unwrap_or(Ipv4Addr::BROADCAST)
}

/// Relay URL for a smart outlet; `address` may carry a scheme
pub fn outlet_url(kind: OutletKind, address: &str, on: bool) -> String {
    let base = address.trim_end_matches('/');
    let base = if base.starts_with("http://") || base.starts_with("https://") {
        base.to_string()
    } else {
        format!("http://{}", base)
    };
    match kind {
        OutletKind::Shelly => format!("{}/relay/0?turn={}", base, if on { "on" } else { "off" }),
        OutletKind::Tasmota => format!("{}/cm?cmnd=Power%20{}", base, if on { "On" } else { "Off" }),
    }
}

pub struct PowerController {
    runner: HostRunner,
    power: PowerConfig,
    mac: Option<String>,
    peer_shutdown: String,
    local_shutdown: String,
    timing: Timing,
}

impl PowerController {
    pub fn new(runner: HostRunner, config: &Config) -> Self {
        Self {
            runner,
            power: config.peer.power.clone(),
            mac: config.peer.mac.clone(),
            peer_shutdown: config.peer.shutdown_command.clone(),
            local_shutdown: config.local.shutdown_command.clone(),
            timing: config.timing.clone(),
        }
    }

    /// Request the peer to power on with the configured strategy
    pub async fn power_on(&self) -> Result<()> {
        info!("Powering on peer via {:?}", self.power.method);
        match self.power.method {
            PowerMethod::WakePacket => self.send_wake_packet().await,
            PowerMethod::Ipmi => self.ipmi_power_on().await,
            PowerMethod::SmartOutlet => {
                if self.power.power_cycle {
                    self.switch_outlet(false).await?;
                    tokio::time::sleep(self.timing.outlet_cycle()).await;
                }
                self.switch_outlet(true).await
            }
            PowerMethod::None => {
                debug!("No power-on method configured, skipping");
                Ok(())
            }
        }
    }

    /// Ask the peer to shut down; never waits for it to go down
    pub async fn power_off_peer(&self) -> Result<()> {
        let command = CommandSpec::parse(&self.peer_shutdown)?
            .with_timeout(self.timing.command_timeout());
        info!("Requesting peer shutdown: {}", command.rendered());

        // the SSH session usually dies with the host, so a failure here is expected
        match self.runner.run_on_peer(&command).await {
            Ok(result) if !result.success => {
                debug!("Peer shutdown returned: {}", result.describe_failure())
            }
            Ok(_) => {}
            Err(e) => warn!("Peer shutdown request failed: {}", e),
        }

        if self.power.method == PowerMethod::SmartOutlet {
            tokio::time::sleep(self.timing.outlet_off_delay()).await;
            self.switch_outlet(false).await?;
        }
        Ok(())
    }

    /// Shut this host down
    pub async fn power_off_local(&self) -> Result<()> {
        let command = CommandSpec::parse(&self.local_shutdown)?
            .with_timeout(self.timing.command_timeout());
        info!("Shutting down this host: {}", command.rendered());

        let result = self.runner.run_local(&command).await?;
        if !result.success {
            bail!("Local shutdown failed: {}", result.describe_failure());
        }
        Ok(())
    }

    async fn send_wake_packet(&self) -> Result<()> {
        let mac = self.mac.as_deref().ok_or_else(|| anyhow!("No MAC address configured"))?;
        let mac = parse_mac(mac).map_err(|e| anyhow!("Invalid MAC {}: {}", mac, e))?;
        let pkt = magic_packet(mac);
        let bcast = parse_broadcast(self.power.broadcast.as_deref());

        let sock = UdpSocket::bind(("0.0.0.0", 0)).context("Failed to bind UDP socket")?;
        sock.set_broadcast(true).context("Failed to enable broadcast")?;

        // Envoie plusieurs fois (certains NIC sont sourds)
        let mut sent = false;
        for _ in 0..WAKE_REPEAT {
            for port in WAKE_PORTS {
                let addr = SocketAddrV4::new(bcast, port);
                match sock.send_to(&pkt, addr) {
                    Ok(_) => sent = true,
                    Err(e) => warn!("Wake packet send error to {}: {}", addr, e),
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        if sent {
            info!("Wake packet sent to {}", bcast);
            Ok(())
        } else {
            bail!("Wake packet could not be sent to {}", bcast)
        }
    }

    async fn ipmi_power_on(&self) -> Result<()> {
        let host = self.power.ipmi_host.as_deref().ok_or_else(|| anyhow!("No IPMI host configured"))?;
        let user = self.power.ipmi_user.as_deref().ok_or_else(|| anyhow!("No IPMI user configured"))?;

        let mut args = vec!["-I", "lanplus", "-H", host, "-U", user];
        if let Some(password) = self.power.ipmi_password.as_deref() {
            args.extend(["-P", password]);
        }
        args.extend(["chassis", "power", "on"]);

        let command = CommandSpec::new("ipmitool", args).with_timeout(self.timing.command_timeout());
        let result = self.runner.run_local(&command).await?;
        if !result.success {
            bail!("IPMI power on failed: {}", result.describe_failure());
        }
        Ok(())
    }

    async fn switch_outlet(&self, on: bool) -> Result<()> {
        let address = self
            .power
            .outlet_address
            .as_deref()
            .ok_or_else(|| anyhow!("No outlet address configured"))?;
        let url = outlet_url(self.power.outlet_kind, address, on);
        debug!("Switching outlet: {}", url);

        // outlets sit on the LAN, never behind a proxy
        let http = reqwest::Client::builder()
            .timeout(OUTLET_TIMEOUT)
            .no_proxy()
            .build()
            .context("Failed to build HTTP client")?;
        let response = http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("Outlet request failed: {}", url))?;
        if !response.status().is_success() {
            bail!("Outlet returned {} for {}", response.status(), url);
        }
        Ok(())
    }
}
