//! Common types for switch operations

use kestrel_common::Mac;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::time::Duration;

/// SNMP protocol version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SnmpVersion {
    #[serde(rename = "1")]
    V1,
    #[default]
    #[serde(rename = "2c")]
    V2c,
}

impl SnmpVersion {
    pub fn as_arg(&self) -> &'static str {
        match self {
            SnmpVersion::V1 => "1",
            SnmpVersion::V2c => "2c",
        }
    }
}

/// SNMP session options shared by all switches
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SnmpOptions {
    pub version: SnmpVersion,
    pub community: String,
    /// Retries per request
    pub retries: u32,
    /// Per-request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for SnmpOptions {
    fn default() -> Self {
        Self {
            version: SnmpVersion::V2c,
            community: "private".to_string(),
            retries: 2,
            timeout_secs: 1,
        }
    }
}

impl SnmpOptions {
    pub fn with_community(mut self, community: impl Into<String>) -> Self {
        self.community = community.into();
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Worst-case duration of one request including retries
    pub fn request_budget(&self) -> Duration {
        self.timeout() * (self.retries + 1)
    }
}

/// Address of a managed switch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SwitchTarget {
    pub mac: Mac,
    pub ip: Ipv4Addr,
}

impl SwitchTarget {
    pub fn new(mac: Mac, ip: Ipv4Addr) -> Self {
        Self { mac, ip }
    }
}

/// One entry of a switch's LLDP remote table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Neighbor {
    /// Port on the queried switch
    pub local_port: u32,
    /// Chassis id of the remote device
    pub remote_mac: Mac,
    /// Remote port, when advertised as a number
    pub remote_port: Option<u32>,
    /// Advertised system name
    pub remote_name: Option<String>,
    /// Advertised management address
    pub remote_ip: Option<Ipv4Addr>,
    /// Remote advertises the bridge capability
    pub bridge: bool,
}

impl Neighbor {
    pub fn new(local_port: u32, remote_mac: Mac) -> Self {
        Self {
            local_port,
            remote_mac,
            remote_port: None,
            remote_name: None,
            remote_ip: None,
            bridge: false,
        }
    }

    pub fn with_remote_port(mut self, port: u32) -> Self {
        self.remote_port = Some(port);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.remote_name = Some(name.into());
        self
    }

    pub fn with_ip(mut self, ip: Ipv4Addr) -> Self {
        self.remote_ip = Some(ip);
        self
    }

    pub fn as_bridge(mut self) -> Self {
        self.bridge = true;
        self
    }
}
