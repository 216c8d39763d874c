//! Topology edges
//!
//! Links are undirected physically but stored directed: `device_a` is the
//! switch that reported the link (upstream, closer to the server) and
//! `device_b` is the neighbor seen on `port_a`.

use crate::mac::Mac;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A port on a switch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PortRef {
    pub switch: Mac,
    pub port: u32,
}

impl PortRef {
    pub fn new(switch: Mac, port: u32) -> Self {
        Self { switch, port }
    }
}

impl fmt::Display for PortRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.switch, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TopologyEdge {
    pub device_a: Mac,
    pub port_a: u32,
    pub device_b: Mac,
    /// Remote port, when the neighbor advertises one
    #[serde(default)]
    pub port_b: Option<u32>,
}

impl TopologyEdge {
    pub fn new(upstream: PortRef, device_b: Mac, port_b: Option<u32>) -> Self {
        Self {
            device_a: upstream.switch,
            port_a: upstream.port,
            device_b,
            port_b,
        }
    }

    /// The switch port feeding `device_b`
    pub fn upstream_port(&self) -> PortRef {
        PortRef::new(self.device_a, self.port_a)
    }

    pub fn touches(&self, mac: Mac) -> bool {
        self.device_a == mac || self.device_b == mac
    }
}
