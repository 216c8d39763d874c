//! DHCP configuration model
//!
//! Network settings for the managed subnet and the static reservations
//! derived from the device registry.

use crate::error::{DhcpError, Result};
use kestrel_common::Mac;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// Managed subnet and dynamic pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DhcpConfig {
    /// Network address of the managed subnet
    pub subnet: Ipv4Addr,

    #[serde(default = "default_netmask")]
    pub netmask: Ipv4Addr,

    /// Default gateway handed to clients
    #[serde(default)]
    pub router: Option<Ipv4Addr>,

    /// DNS servers
    #[serde(default)]
    pub dns_servers: Vec<Ipv4Addr>,

    /// Default lease time in seconds
    #[serde(default = "default_lease_time")]
    pub lease_time: u32,

    /// Dynamic pool start; required, unknown devices lease from the pool
    #[serde(default)]
    pub pool_start: Option<Ipv4Addr>,

    /// Dynamic pool end (inclusive); required
    #[serde(default)]
    pub pool_end: Option<Ipv4Addr>,

    /// Boot filename handed to network-booting clients
    #[serde(default)]
    pub boot_filename: Option<String>,

    /// TFTP/next-server address
    #[serde(default)]
    pub next_server: Option<Ipv4Addr>,
}

fn default_netmask() -> Ipv4Addr {
    Ipv4Addr::new(255, 255, 255, 0)
}

fn default_lease_time() -> u32 {
    86400 // 24 hours
}

impl DhcpConfig {
    pub fn new(subnet: Ipv4Addr) -> Self {
        Self {
            subnet,
            netmask: default_netmask(),
            router: None,
            dns_servers: Vec::new(),
            lease_time: default_lease_time(),
            pool_start: None,
            pool_end: None,
            boot_filename: None,
            next_server: None,
        }
    }

    pub fn with_netmask(mut self, netmask: Ipv4Addr) -> Self {
        self.netmask = netmask;
        self
    }

    pub fn with_router(mut self, router: Ipv4Addr) -> Self {
        self.router = Some(router);
        self
    }

    pub fn with_dns_server(mut self, dns: Ipv4Addr) -> Self {
        self.dns_servers.push(dns);
        self
    }

    pub fn with_lease_time(mut self, seconds: u32) -> Self {
        self.lease_time = seconds;
        self
    }

    pub fn with_pool_range(mut self, start: Ipv4Addr, end: Ipv4Addr) -> Self {
        self.pool_start = Some(start);
        self.pool_end = Some(end);
        self
    }

    pub fn with_boot_filename(mut self, filename: impl Into<String>) -> Self {
        self.boot_filename = Some(filename.into());
        self
    }

    pub fn with_next_server(mut self, server: Ipv4Addr) -> Self {
        self.next_server = Some(server);
        self
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let mask = u32::from(self.netmask);
        (u32::from(ip) & mask) == (u32::from(self.subnet) & mask)
    }

    /// Whether `ip` falls inside the dynamic pool
    pub fn in_pool(&self, ip: Ipv4Addr) -> bool {
        match (self.pool_start, self.pool_end) {
            (Some(start), Some(end)) => {
                let v = u32::from(ip);
                v >= u32::from(start) && v <= u32::from(end)
            }
            _ => false,
        }
    }

    /// Check internal consistency
    pub fn validate(&self) -> Result<()> {
        let mask = u32::from(self.netmask);
        if mask.leading_ones() + mask.trailing_zeros() != 32 {
            return Err(DhcpError::ConfigError(format!(
                "netmask {} is not contiguous",
                self.netmask
            )));
        }
        match (self.pool_start, self.pool_end) {
            (Some(start), Some(end)) => {
                if !self.contains(start) || !self.contains(end) {
                    return Err(DhcpError::ConfigError(format!(
                        "pool {}-{} is outside subnet {}/{}",
                        start, end, self.subnet, self.netmask
                    )));
                }
                if u32::from(start) > u32::from(end) {
                    return Err(DhcpError::ConfigError(format!(
                        "pool start {} is after pool end {}",
                        start, end
                    )));
                }
            }
            (None, None) => {
                return Err(DhcpError::ConfigError(
                    "a dynamic pool (pool_start, pool_end) is required".to_string(),
                ))
            }
            _ => {
                return Err(DhcpError::ConfigError(
                    "pool_start and pool_end must be set together".to_string(),
                ))
            }
        }
        if let Some(router) = self.router {
            if !self.contains(router) {
                return Err(DhcpError::InvalidIp(format!(
                    "router {} is outside the managed subnet",
                    router
                )));
            }
        }
        Ok(())
    }
}

/// A static MAC -> IP reservation
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Reservation {
    pub mac: Mac,
    pub ip: Ipv4Addr,
    #[serde(default)]
    pub hostname: Option<String>,
}

impl Reservation {
    pub fn new(mac: Mac, ip: Ipv4Addr) -> Self {
        Self {
            mac,
            ip,
            hostname: None,
        }
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }
}
