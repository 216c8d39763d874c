//! Devices, nodes and image bindings.
//!
//! A `Device` is anything seen on the fleet network. Devices of kind
//! `Node` also carry a `NodeState`; the constructors and `set_kind` keep
//! that pairing intact so a node always has an image tag.

use crate::error::Error;
use crate::mac::Mac;
use crate::DEFAULT_IMAGE;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// Stable, monotonically assigned device identifier.
///
/// Allocation order doubles as registry insertion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(pub u64);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Switch,
    Node,
    #[default]
    Unknown,
}

impl DeviceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceKind::Switch => "switch",
            DeviceKind::Node => "node",
            DeviceKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "switch" => Ok(DeviceKind::Switch),
            "node" => Ok(DeviceKind::Node),
            "unknown" => Ok(DeviceKind::Unknown),
            _ => Err(Error::InvalidKind(s.to_string())),
        }
    }
}

/// Power state of a node as last observed through PoE
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerState {
    On,
    Off,
    #[default]
    Unknown,
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PowerState::On => write!(f, "on"),
            PowerState::Off => write!(f, "off"),
            PowerState::Unknown => write!(f, "unknown"),
        }
    }
}

impl FromStr for PowerState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "on" => Ok(PowerState::On),
            "off" => Ok(PowerState::Off),
            "unknown" => Ok(PowerState::Unknown),
            _ => Err(Error::InvalidPowerState(s.to_string())),
        }
    }
}

/// Node-only state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeState {
    /// User owning the node; `None` means the node is free
    #[serde(default)]
    pub owner: Option<String>,
    /// Image tag the node boots
    #[serde(default = "default_image")]
    pub image: String,
    #[serde(default)]
    pub power: PowerState,
    /// Whether the last soft reboot request was acknowledged
    #[serde(default)]
    pub soft_reboot_ok: bool,
}

fn default_image() -> String {
    DEFAULT_IMAGE.to_string()
}

impl Default for NodeState {
    fn default() -> Self {
        Self {
            owner: None,
            image: default_image(),
            power: PowerState::Unknown,
            soft_reboot_ok: false,
        }
    }
}

impl NodeState {
    pub fn is_free(&self) -> bool {
        self.owner.is_none()
    }

    pub fn is_owned_by(&self, user: &str) -> bool {
        self.owner.as_deref() == Some(user)
    }
}

/// A discovered network entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    pub name: String,
    pub mac: Mac,
    #[serde(default)]
    pub ip: Option<Ipv4Addr>,
    kind: DeviceKind,
    pub last_seen: DateTime<Utc>,
    #[serde(default)]
    pub reachable: bool,
    /// Present if and only if `kind == Node`
    #[serde(default)]
    node: Option<NodeState>,
}

impl Device {
    pub fn new(id: DeviceId, name: impl Into<String>, mac: Mac, kind: DeviceKind) -> Self {
        Self {
            id,
            name: name.into(),
            mac,
            ip: None,
            kind,
            last_seen: Utc::now(),
            reachable: true,
            node: (kind == DeviceKind::Node).then(NodeState::default),
        }
    }

    pub fn with_ip(mut self, ip: Ipv4Addr) -> Self {
        self.ip = Some(ip);
        self
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    pub fn is_node(&self) -> bool {
        self.kind == DeviceKind::Node
    }

    pub fn is_switch(&self) -> bool {
        self.kind == DeviceKind::Switch
    }

    /// Change the device kind, creating or dropping node state as needed.
    pub fn set_kind(&mut self, kind: DeviceKind) {
        self.kind = kind;
        match kind {
            DeviceKind::Node => {
                if self.node.is_none() {
                    self.node = Some(NodeState::default());
                }
            }
            _ => self.node = None,
        }
    }

    pub fn node(&self) -> Option<&NodeState> {
        self.node.as_ref()
    }

    pub fn node_mut(&mut self) -> Option<&mut NodeState> {
        self.node.as_mut()
    }

    /// Re-establish the node state pairing after deserialization
    pub fn normalized(mut self) -> Self {
        let kind = self.kind;
        self.set_kind(kind);
        self
    }

    /// Record a sighting at the current time
    pub fn touch(&mut self) {
        self.last_seen = Utc::now();
        self.reachable = true;
    }
}

/// Image assignment of a node, with the owner recorded at bind time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageBinding {
    pub mac: Mac,
    pub image: String,
    pub owner: Option<String>,
    pub bound_at: DateTime<Utc>,
}

impl ImageBinding {
    /// Binding the default image releases ownership
    pub fn new(mac: Mac, image: impl Into<String>, requester: &str) -> Self {
        let image = image.into();
        let owner = (image != DEFAULT_IMAGE).then(|| requester.to_string());
        Self {
            mac,
            image,
            owner,
            bound_at: Utc::now(),
        }
    }
}

/// One line of derived DHCP state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DhcpEntry {
    pub mac: Mac,
    pub ip: Ipv4Addr,
    /// Static entries come from known registry devices, others are pool leases
    pub is_static: bool,
    pub hostname: Option<String>,
}
