//! Server configuration
//!
//! Loaded once at startup from a YAML file. Every section has defaults so a
//! minimal file only needs the managed subnet and its dynamic pool.

use crate::agent::DEFAULT_AGENT_PORT;
use crate::dispatcher::DispatcherLimits;
use anyhow::{bail, Context, Result};
use kestrel_common::Mac;
use kestrel_dhcp::{CommandDhcpService, DhcpConfig};
use kestrel_snmp::SnmpOptions;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/kestrel/server.yaml";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Managed subnet, handed to the DHCP generator as is
    pub network: DhcpConfig,
    #[serde(default)]
    pub snmp: SnmpOptions,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub dhcp: DhcpSection,
    #[serde(default)]
    pub power: PowerConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    /// Uplink switches the topology walk starts from
    #[serde(default)]
    pub seeds: Vec<SeedSwitch>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PathsConfig {
    pub dhcp_config: PathBuf,
    pub images_root: PathBuf,
    pub state_db: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            dhcp_config: PathBuf::from("/etc/dhcp/dhcpd.conf"),
            images_root: PathBuf::from("/var/lib/kestrel/images"),
            state_db: PathBuf::from("/var/lib/kestrel/state.redb"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DhcpSection {
    /// Command run after the configuration file changed
    pub reload: CommandDhcpService,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PowerConfig {
    pub soft_reboot_timeout_secs: u64,
    /// Time a port stays unpowered during a hard reboot
    pub poe_settle_secs: u64,
    /// Deadline for one switch request, retries included
    pub switch_timeout_secs: u64,
    pub agent_port: u16,
}

impl Default for PowerConfig {
    fn default() -> Self {
        Self {
            soft_reboot_timeout_secs: 10,
            poe_settle_secs: 2,
            switch_timeout_secs: 3,
            agent_port: DEFAULT_AGENT_PORT,
        }
    }
}

impl PowerConfig {
    pub fn soft_reboot_timeout(&self) -> Duration {
        Duration::from_secs(self.soft_reboot_timeout_secs)
    }

    pub fn poe_settle(&self) -> Duration {
        Duration::from_secs(self.poe_settle_secs)
    }

    pub fn switch_timeout(&self) -> Duration {
        Duration::from_secs(self.switch_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DispatcherConfig {
    pub workers: usize,
    pub per_destination: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        let limits = DispatcherLimits::default();
        Self {
            workers: limits.workers,
            per_destination: limits.per_destination,
        }
    }
}

impl From<&DispatcherConfig> for DispatcherLimits {
    fn from(config: &DispatcherConfig) -> Self {
        DispatcherLimits {
            workers: config.workers,
            per_destination: config.per_destination,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SeedSwitch {
    pub mac: Mac,
    pub ip: Ipv4Addr,
    #[serde(default)]
    pub name: Option<String>,
}

impl ServerConfig {
    /// Minimal configuration for a subnet, every other section defaulted
    pub fn new(network: DhcpConfig) -> Self {
        Self {
            network,
            snmp: SnmpOptions::default(),
            paths: PathsConfig::default(),
            dhcp: DhcpSection::default(),
            power: PowerConfig::default(),
            dispatcher: DispatcherConfig::default(),
            seeds: Vec::new(),
        }
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let config: ServerConfig =
            serde_yaml::from_str(text).context("Failed to parse server configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file: {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("Invalid configuration in {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        self.network
            .validate()
            .context("Invalid network section")?;

        if self.dispatcher.workers == 0 {
            bail!("dispatcher.workers must be at least 1");
        }
        if self.dispatcher.per_destination == 0 {
            bail!("dispatcher.per_destination must be at least 1");
        }
        if self.snmp.community.is_empty() {
            bail!("snmp.community must not be empty");
        }
        if self.power.switch_timeout_secs == 0 || self.power.soft_reboot_timeout_secs == 0 {
            bail!("power timeouts must be at least one second");
        }
        if self.dhcp.reload.program.trim().is_empty() {
            bail!("dhcp.reload.program must not be empty");
        }

        let mut seen = std::collections::HashSet::new();
        for seed in &self.seeds {
            if !seen.insert(seed.mac) {
                bail!("seed switch {} listed twice", seed.mac);
            }
        }
        Ok(())
    }
}
