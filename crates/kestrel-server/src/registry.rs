//! Device and topology registry
//!
//! In-memory view of every device the server knows about, the links between
//! them, and node image bindings. Owned by the orchestration loop; nothing
//! else mutates it.
//!
//! Mutations record what they touched in a change set which the fleet
//! flushes to the persistent store after each operation.

use crate::error::{FleetError, Result};
use comfy_table::{presets::UTF8_FULL, Table};
use kestrel_common::{
    Device, DeviceId, DeviceKind, ImageBinding, Mac, NodeState, PortRef, TopologyEdge,
    DEFAULT_IMAGE,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::{self, Write};
use std::net::Ipv4Addr;
use tracing::{debug, info, warn};

/// Node-set keyword: nodes owned by the requester
pub const MY_NODES: &str = "my-nodes";
/// Node-set keyword: every node
pub const ALL_NODES: &str = "all-nodes";

const MAX_NAME_LEN: usize = 63;

/// What a scan or a DHCP lease told us about a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sighting {
    pub mac: Mac,
    pub kind: DeviceKind,
    pub name: Option<String>,
    pub ip: Option<Ipv4Addr>,
}

impl Sighting {
    pub fn new(mac: Mac) -> Self {
        Self {
            mac,
            kind: DeviceKind::Unknown,
            name: None,
            ip: None,
        }
    }

    pub fn with_kind(mut self, kind: DeviceKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_ip(mut self, ip: Ipv4Addr) -> Self {
        self.ip = Some(ip);
        self
    }
}

/// Result of [`Registry::upsert_device`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Upsert {
    pub id: DeviceId,
    pub created: bool,
    /// Kind moved forward from `unknown`
    pub promoted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    NotFound,
    NotANode,
    /// Candidate node names
    Ambiguous(Vec<String>),
}

/// A node-set token that could not be resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenFailure {
    pub token: String,
    pub reason: FailureReason,
}

impl TokenFailure {
    pub fn new(token: impl Into<String>, reason: FailureReason) -> Self {
        Self {
            token: token.into(),
            reason,
        }
    }
}

impl fmt::Display for TokenFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.reason {
            FailureReason::NotFound => write!(f, "no node matches '{}'", self.token),
            FailureReason::NotANode => write!(f, "'{}' is not a node", self.token),
            FailureReason::Ambiguous(names) => write!(
                f,
                "'{}' is ambiguous (matches {})",
                self.token,
                format_names(names)
            ),
        }
    }
}

/// Resolved node-set expression, in registry insertion order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeSet {
    pub nodes: Vec<Mac>,
    pub failures: Vec<TokenFailure>,
}

impl NodeSet {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// All-or-nothing view used by mutating operations
    pub fn into_result(self) -> Result<Vec<Mac>> {
        if self.failures.is_empty() {
            Ok(self.nodes)
        } else {
            Err(FleetError::Resolution(self.failures))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// No node belongs to another user and at least one is free
    Unowned,
    /// Every node belongs to the requester
    OwnedByRequester,
    /// At least one node belongs to another user
    ContainsOthers,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnershipReport {
    pub class: Ownership,
    /// Names of nodes owned by other users
    pub conflicting: Vec<String>,
    /// Names of nodes nobody owns
    pub free: Vec<String>,
    /// User-facing sentence, set when a warning was requested and applies
    pub warning: Option<String>,
}

impl OwnershipReport {
    pub fn needs_confirmation(&self) -> bool {
        self.class == Ownership::ContainsOthers
    }
}

/// What changed since the last flush
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Changes {
    pub devices: BTreeSet<Mac>,
    pub removed: BTreeSet<Mac>,
    pub bindings: BTreeSet<Mac>,
    pub edges: bool,
}

impl Changes {
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty() && self.removed.is_empty() && self.bindings.is_empty() && !self.edges
    }

    fn merge(&mut self, other: Changes) {
        self.devices.extend(other.devices);
        self.removed.extend(other.removed);
        self.bindings.extend(other.bindings);
        self.edges |= other.edges;
    }
}

#[derive(Debug, Default)]
pub struct Registry {
    devices: BTreeMap<DeviceId, Device>,
    by_mac: HashMap<Mac, DeviceId>,
    by_name: HashMap<String, DeviceId>,
    /// Keyed by upstream port: one neighbor per switch port
    edges: BTreeMap<PortRef, TopologyEdge>,
    bindings: BTreeMap<Mac, ImageBinding>,
    next_id: u64,
    changes: Changes,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted state.
    ///
    /// Edges with an unknown endpoint, a second upstream for the same
    /// device, or that would close a cycle are dropped with a warning.
    pub fn restore(mut devices: Vec<Device>, edges: Vec<TopologyEdge>, bindings: Vec<ImageBinding>) -> Self {
        let mut registry = Self::new();
        devices.sort_by_key(|d| d.id);

        for device in devices {
            let mut device = device.normalized();
            if registry.by_mac.contains_key(&device.mac) {
                warn!(mac = %device.mac, "duplicate device in store, keeping first");
                continue;
            }
            if registry.by_name.contains_key(&device.name) {
                device.name = registry.unique_name(&device.name);
            }
            registry.next_id = registry.next_id.max(device.id.0 + 1);
            registry.insert(device);
        }

        for edge in edges {
            let known = registry.by_mac.contains_key(&edge.device_a) && registry.by_mac.contains_key(&edge.device_b);
            let fits = known
                && edge.device_a != edge.device_b
                && registry.upstream_of(edge.device_b).is_none()
                && !registry.is_ancestor(edge.device_b, edge.device_a);
            if fits {
                registry.edges.insert(edge.upstream_port(), edge);
            } else {
                warn!(from = %edge.device_a, to = %edge.device_b, "dropping inconsistent stored edge");
            }
        }

        for binding in bindings {
            let mac = binding.mac;
            let applied = registry.with_node(mac, |node| {
                node.image = binding.image.clone();
                node.owner = binding.owner.clone();
            });
            if applied {
                registry.bindings.insert(mac, binding);
            }
        }

        registry.changes = Changes::default();
        debug!(
            devices = registry.devices.len(),
            edges = registry.edges.len(),
            "registry restored"
        );
        registry
    }

    fn insert(&mut self, device: Device) {
        self.by_mac.insert(device.mac, device.id);
        self.by_name.insert(device.name.clone(), device.id);
        self.devices.insert(device.id, device);
    }

    /// Hand over the pending change set
    pub fn take_changes(&mut self) -> Changes {
        std::mem::take(&mut self.changes)
    }

    /// Put back a change set that could not be persisted, so the next flush
    /// writes it again
    pub fn restore_changes(&mut self, changes: Changes) {
        self.changes.merge(changes);
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Devices in insertion order
    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    pub fn device(&self, mac: Mac) -> Option<&Device> {
        self.by_mac.get(&mac).and_then(|id| self.devices.get(id))
    }

    fn device_mut(&mut self, mac: Mac) -> Option<&mut Device> {
        let id = self.by_mac.get(&mac)?;
        let device = self.devices.get_mut(id)?;
        self.changes.devices.insert(mac);
        Some(device)
    }

    pub fn by_name(&self, name: &str) -> Option<&Device> {
        self.by_name.get(name).and_then(|id| self.devices.get(id))
    }

    /// Look a device up by name, then by full MAC address
    pub fn find(&self, token: &str) -> Option<&Device> {
        self.by_name(token)
            .or_else(|| token.parse::<Mac>().ok().and_then(|mac| self.device(mac)))
    }

    pub fn list_by_kind(&self, kind: DeviceKind) -> Vec<&Device> {
        self.devices.values().filter(|d| d.kind() == kind).collect()
    }

    pub fn binding(&self, mac: Mac) -> Option<&ImageBinding> {
        self.bindings.get(&mac)
    }

    /// Create or refresh a device from a sighting.
    ///
    /// A new device takes the advertised name if it is usable, otherwise a
    /// provisional one. An existing device keeps its name; its kind only
    /// moves forward from `unknown`.
    pub fn upsert_device(&mut self, sighting: Sighting) -> Upsert {
        if let Some(&id) = self.by_mac.get(&sighting.mac) {
            let mut promoted = false;
            if let Some(device) = self.device_mut(sighting.mac) {
                device.touch();
                if let Some(ip) = sighting.ip {
                    device.ip = Some(ip);
                }
                promoted = device.kind() == DeviceKind::Unknown && sighting.kind != DeviceKind::Unknown;
            }
            if promoted {
                self.apply_kind(sighting.mac, sighting.kind);
            }
            return Upsert {
                id,
                created: false,
                promoted,
            };
        }

        let base = sighting
            .name
            .as_deref()
            .and_then(sanitize_name)
            .unwrap_or_else(|| provisional_name(sighting.kind, sighting.mac));
        let name = self.unique_name(&base);
        let id = DeviceId(self.next_id);
        self.next_id += 1;

        let mut device = Device::new(id, name, sighting.mac, sighting.kind);
        device.ip = sighting.ip;
        info!(mac = %device.mac, name = %device.name, kind = %device.kind(), "new device");
        self.changes.devices.insert(device.mac);
        self.insert(device);

        Upsert {
            id,
            created: true,
            promoted: false,
        }
    }

    /// Move a device forward from `unknown`; returns whether it changed
    pub fn promote(&mut self, mac: Mac, kind: DeviceKind) -> bool {
        match self.device(mac) {
            Some(d) if d.kind() == DeviceKind::Unknown && kind != DeviceKind::Unknown => {
                self.apply_kind(mac, kind);
                true
            }
            _ => false,
        }
    }

    /// Operator classification, may set any kind
    pub fn classify(&mut self, name: &str, kind: DeviceKind) -> Result<bool> {
        let device = self
            .find(name)
            .ok_or_else(|| FleetError::DeviceNotFound(name.to_string()))?;
        if device.kind() == kind {
            return Ok(false);
        }
        let mac = device.mac;
        self.apply_kind(mac, kind);
        Ok(true)
    }

    fn apply_kind(&mut self, mac: Mac, kind: DeviceKind) {
        let Some(device) = self.device(mac) else {
            return;
        };
        let old_kind = device.kind();
        let id = device.id;
        let keeps_provisional_name = device.name == provisional_name(old_kind, mac);

        if let Some(device) = self.device_mut(mac) {
            device.set_kind(kind);
        }
        if kind != DeviceKind::Node && self.bindings.remove(&mac).is_some() {
            self.changes.bindings.insert(mac);
        }
        if keeps_provisional_name {
            let name = self.unique_name(&provisional_name(kind, mac));
            self.set_name(id, name);
        }
        info!(mac = %mac, from = %old_kind, to = %kind, "device classified");
    }

    pub fn rename(&mut self, old_name: &str, new_name: &str) -> Result<()> {
        let device = self
            .by_name(old_name)
            .ok_or_else(|| FleetError::DeviceNotFound(old_name.to_string()))?;
        let id = device.id;
        if old_name == new_name {
            return Ok(());
        }
        if !is_valid_name(new_name) {
            return Err(FleetError::InvalidName(new_name.to_string()));
        }
        if self.by_name.contains_key(new_name) {
            return Err(FleetError::NameTaken(new_name.to_string()));
        }
        self.set_name(id, new_name.to_string());
        info!(from = old_name, to = new_name, "device renamed");
        Ok(())
    }

    fn set_name(&mut self, id: DeviceId, name: String) {
        if let Some(device) = self.devices.get_mut(&id) {
            self.by_name.remove(&device.name);
            self.by_name.insert(name.clone(), id);
            device.name = name;
            self.changes.devices.insert(device.mac);
        }
    }

    /// Drop a device with its node state, binding and every edge touching it
    pub fn remove_device(&mut self, mac: Mac) -> Option<Device> {
        let id = self.by_mac.remove(&mac)?;
        let device = self.devices.remove(&id)?;
        self.by_name.remove(&device.name);
        self.bindings.remove(&mac);

        let before = self.edges.len();
        self.edges.retain(|_, edge| !edge.touches(mac));
        if self.edges.len() != before {
            self.changes.edges = true;
        }
        self.changes.devices.remove(&mac);
        self.changes.bindings.remove(&mac);
        self.changes.removed.insert(mac);
        info!(mac = %mac, name = %device.name, "device forgotten");
        Some(device)
    }

    pub fn set_reachable(&mut self, mac: Mac, reachable: bool) {
        let changed = self.device(mac).is_some_and(|d| d.reachable != reachable);
        if changed {
            if let Some(device) = self.device_mut(mac) {
                device.reachable = reachable;
            }
        }
    }

    pub fn set_ip(&mut self, mac: Mac, ip: Ipv4Addr) {
        if let Some(device) = self.device_mut(mac) {
            device.ip = Some(ip);
        }
    }

    /// Apply `f` to a node's state; `false` if `mac` is not a node
    pub fn with_node(&mut self, mac: Mac, f: impl FnOnce(&mut NodeState)) -> bool {
        match self.device_mut(mac).and_then(|d| d.node_mut()) {
            Some(node) => {
                f(node);
                true
            }
            None => false,
        }
    }

    /// Record an image binding on a node.
    ///
    /// Updates the node's image and owner from the binding.
    pub fn set_binding(&mut self, binding: ImageBinding) -> Result<()> {
        let mac = binding.mac;
        let name = self
            .device(mac)
            .map(|d| d.name.clone())
            .unwrap_or_else(|| mac.to_string());
        let applied = self.with_node(mac, |node| {
            node.image = binding.image.clone();
            node.owner = binding.owner.clone();
        });
        if !applied {
            return Err(FleetError::DeviceNotFound(name));
        }
        self.bindings.insert(mac, binding);
        self.changes.bindings.insert(mac);
        Ok(())
    }

    /// Undo a binding, back to `previous` (or free on the default image)
    pub fn restore_binding(&mut self, mac: Mac, previous: Option<ImageBinding>) {
        let (image, owner) = match &previous {
            Some(binding) => (binding.image.clone(), binding.owner.clone()),
            None => (DEFAULT_IMAGE.to_string(), None),
        };
        self.with_node(mac, |node| {
            node.image = image;
            node.owner = owner;
        });
        match previous {
            Some(binding) => self.bindings.insert(mac, binding),
            None => self.bindings.remove(&mac),
        };
        self.changes.bindings.insert(mac);
    }

    // === Topology ===

    pub fn edges(&self) -> impl Iterator<Item = &TopologyEdge> {
        self.edges.values()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// The edge feeding `mac`, if any
    pub fn upstream_of(&self, mac: Mac) -> Option<&TopologyEdge> {
        self.edges.values().find(|e| e.device_b == mac)
    }

    /// Edges below `switch`, in port order
    pub fn children(&self, switch: Mac) -> Vec<&TopologyEdge> {
        self.edges
            .range(PortRef::new(switch, 0)..=PortRef::new(switch, u32::MAX))
            .map(|(_, e)| e)
            .collect()
    }

    /// Whether `candidate` sits on the upstream path of `of`
    pub fn is_ancestor(&self, candidate: Mac, of: Mac) -> bool {
        let mut current = of;
        // Bounded walk, the graph is acyclic but stored data may not be
        for _ in 0..=self.edges.len() {
            match self.upstream_of(current) {
                Some(edge) if edge.device_a == candidate => return true,
                Some(edge) => current = edge.device_a,
                None => return false,
            }
        }
        false
    }

    /// Point `upstream` at `device`, replacing whatever was on that port.
    ///
    /// A device keeps a single upstream edge: any other edge feeding it is
    /// removed. Returns whether the edge set changed.
    pub fn record_edge(&mut self, upstream: PortRef, device: Mac, remote_port: Option<u32>) -> bool {
        let edge = TopologyEdge::new(upstream, device, remote_port);
        if self.edges.get(&upstream) == Some(&edge) {
            return false;
        }

        let stale: Vec<PortRef> = self
            .edges
            .iter()
            .filter(|(port, e)| e.device_b == device && **port != upstream)
            .map(|(port, _)| *port)
            .collect();
        for port in stale {
            debug!(device = %device, old = %port, new = %upstream, "device moved");
            self.edges.remove(&port);
        }

        self.edges.insert(upstream, edge);
        self.changes.edges = true;
        true
    }

    /// Remove edges of `switch` on ports not listed in `keep`
    pub fn retain_ports(&mut self, switch: Mac, keep: &BTreeSet<u32>) -> usize {
        let before = self.edges.len();
        self.edges
            .retain(|port, _| port.switch != switch || keep.contains(&port.port));
        let removed = before - self.edges.len();
        if removed > 0 {
            self.changes.edges = true;
        }
        removed
    }

    // === Node sets ===

    fn nodes(&self) -> impl Iterator<Item = &Device> {
        self.devices.values().filter(|d| d.is_node())
    }

    /// Resolve a node-set expression.
    ///
    /// Tokens are `my-nodes`, `all-nodes`, node names, or MAC suffixes. The
    /// result is de-duplicated and in registry insertion order; unresolvable
    /// tokens are listed in `failures`.
    pub fn resolve_node_set(&self, expression: &str, requester: &str) -> NodeSet {
        let mut selected: BTreeSet<DeviceId> = BTreeSet::new();
        let mut failures = Vec::new();

        let tokens: Vec<&str> = expression
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .collect();
        if tokens.is_empty() {
            failures.push(TokenFailure::new(expression.trim(), FailureReason::NotFound));
        }

        for token in tokens {
            match token {
                MY_NODES => selected.extend(
                    self.nodes()
                        .filter(|d| d.node().is_some_and(|n| n.is_owned_by(requester)))
                        .map(|d| d.id),
                ),
                ALL_NODES => selected.extend(self.nodes().map(|d| d.id)),
                _ => match self.resolve_token(token) {
                    Ok(id) => {
                        selected.insert(id);
                    }
                    Err(reason) => failures.push(TokenFailure::new(token, reason)),
                },
            }
        }

        NodeSet {
            nodes: selected
                .into_iter()
                .filter_map(|id| self.devices.get(&id))
                .map(|d| d.mac)
                .collect(),
            failures,
        }
    }

    fn resolve_token(&self, token: &str) -> std::result::Result<DeviceId, FailureReason> {
        if let Some(device) = self.by_name(token) {
            return if device.is_node() {
                Ok(device.id)
            } else {
                Err(FailureReason::NotANode)
            };
        }

        let matches: Vec<&Device> = self
            .devices
            .values()
            .filter(|d| d.mac.ends_with_fragment(token))
            .collect();
        let nodes: Vec<&Device> = matches.iter().copied().filter(|d| d.is_node()).collect();

        match nodes.as_slice() {
            [one] => Ok(one.id),
            [] if matches.is_empty() => Err(FailureReason::NotFound),
            [] => Err(FailureReason::NotANode),
            many => Err(FailureReason::Ambiguous(
                many.iter().map(|d| d.name.clone()).collect(),
            )),
        }
    }

    /// Classify who owns the given nodes
    pub fn ownership(&self, nodes: &[Mac], requester: &str, warn: bool) -> OwnershipReport {
        let mut foreign = Vec::new();
        let mut owners = BTreeSet::new();
        let mut free = Vec::new();

        for device in nodes.iter().filter_map(|mac| self.device(*mac)) {
            let Some(node) = device.node() else { continue };
            match node.owner.as_deref() {
                None => free.push(device.name.clone()),
                Some(owner) if owner == requester => {}
                Some(owner) => {
                    foreign.push(device.name.clone());
                    owners.insert(owner.to_string());
                }
            }
        }

        // A mix of the requester's nodes and free ones is not fully owned
        let class = if !foreign.is_empty() {
            Ownership::ContainsOthers
        } else if !free.is_empty() {
            Ownership::Unowned
        } else {
            Ownership::OwnedByRequester
        };

        let warning = match class {
            _ if !warn => None,
            Ownership::ContainsOthers => Some(format!(
                "{} {} owned by another user ({}).",
                format_names(&foreign),
                if foreign.len() == 1 { "is" } else { "are" },
                owners.into_iter().collect::<Vec<_>>().join(", ")
            )),
            Ownership::Unowned => Some(format!(
                "{} {} free: deploy an image on {} to take ownership.",
                format_names(&free),
                if free.len() == 1 { "is" } else { "are" },
                if free.len() == 1 { "it" } else { "them" }
            )),
            _ => None,
        };

        OwnershipReport {
            class,
            conflicting: foreign,
            free,
            warning,
        }
    }

    /// Device name, or the MAC if the device is gone
    pub fn name_of(&self, mac: Mac) -> String {
        self.device(mac)
            .map(|d| d.name.clone())
            .unwrap_or_else(|| mac.to_string())
    }

    pub fn names_of(&self, macs: &[Mac]) -> Vec<String> {
        macs.iter().map(|mac| self.name_of(*mac)).collect()
    }

    // === Views ===

    fn label(&self, device: &Device) -> String {
        let mut label = format!("{} [{}]", device.name, device.kind());
        if !device.reachable {
            label.push_str(" (unreachable)");
        }
        label
    }

    /// Text rendering of the topology forest
    pub fn device_tree(&self) -> String {
        let mut out = String::new();
        let mut unlinked = Vec::new();

        for device in self.devices.values() {
            if self.upstream_of(device.mac).is_some() {
                continue;
            }
            if device.is_switch() || !self.children(device.mac).is_empty() {
                let _ = writeln!(out, "{}", self.label(device));
                self.render_children(device.mac, "", 0, &mut out);
            } else {
                unlinked.push(device.name.clone());
            }
        }

        if !unlinked.is_empty() {
            let _ = writeln!(out, "unknown topology: {}", unlinked.join(", "));
        }
        if out.is_empty() {
            out.push_str("No devices detected yet.\n");
        }
        out
    }

    fn render_children(&self, switch: Mac, prefix: &str, depth: usize, out: &mut String) {
        if depth > self.devices.len() {
            return;
        }
        let children = self.children(switch);
        for (i, edge) in children.iter().enumerate() {
            let Some(device) = self.device(edge.device_b) else {
                continue;
            };
            let last = i + 1 == children.len();
            let _ = writeln!(
                out,
                "{}{} {}: {}",
                prefix,
                if last { "└─" } else { "├─" },
                edge.port_a,
                self.label(device)
            );
            let nested = format!("{}{}", prefix, if last { "   " } else { "│  " });
            self.render_children(device.mac, &nested, depth + 1, out);
        }
    }

    /// Table of every device
    pub fn show_devices(&self) -> String {
        if self.devices.is_empty() {
            return "No devices detected yet.".to_string();
        }
        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_header(vec!["name", "type", "mac", "ip", "reachable"]);
        for device in self.devices.values() {
            table.add_row(vec![
                device.name.clone(),
                device.kind().to_string(),
                device.mac.to_string(),
                device.ip.map(|ip| ip.to_string()).unwrap_or_else(|| "-".to_string()),
                if device.reachable { "yes" } else { "NO" }.to_string(),
            ]);
        }
        table.to_string()
    }

    /// Table of nodes; without `show_all`, nodes owned by others are hidden
    pub fn show_nodes(&self, requester: &str, show_all: bool) -> String {
        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_header(vec!["name", "image", "owner", "ip", "reachable"]);

        let mut shown = 0usize;
        let mut hidden = 0usize;
        for device in self.nodes() {
            let Some(node) = device.node() else { continue };
            if !show_all && !(node.is_free() || node.is_owned_by(requester)) {
                hidden += 1;
                continue;
            }
            shown += 1;
            table.add_row(vec![
                device.name.clone(),
                node.image.clone(),
                node.owner.clone().unwrap_or_else(|| "free".to_string()),
                device.ip.map(|ip| ip.to_string()).unwrap_or_else(|| "-".to_string()),
                if device.reachable { "yes" } else { "NO" }.to_string(),
            ]);
        }

        let mut out = if shown == 0 {
            "No nodes to show.".to_string()
        } else {
            table.to_string()
        };
        if hidden > 0 {
            let _ = write!(
                out,
                "\n({} node(s) owned by other users not shown, use --all to see them.)",
                hidden
            );
        }
        out
    }

    fn unique_name(&self, base: &str) -> String {
        if !self.by_name.contains_key(base) {
            return base.to_string();
        }
        (2..)
            .map(|n| format!("{}-{}", base, n))
            .find(|candidate| !self.by_name.contains_key(candidate))
            .unwrap_or_else(|| base.to_string())
    }
}

/// `<kind>-<last three MAC octets>`
pub fn provisional_name(kind: DeviceKind, mac: Mac) -> String {
    format!("{}-{}", kind, mac.short_suffix())
}

pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name != MY_NODES
        && name != ALL_NODES
        && !name.starts_with('-')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// Turn an advertised system name into a usable device name
fn sanitize_name(raw: &str) -> Option<String> {
    let cleaned: String = raw
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '-'
            }
        })
        .collect();
    let cleaned: String = cleaned.trim_matches('-').chars().take(MAX_NAME_LEN).collect();
    is_valid_name(&cleaned).then_some(cleaned)
}

/// `a`, `a and b`, `a, b and c`
pub fn format_names(names: &[String]) -> String {
    match names {
        [] => String::new(),
        [one] => one.clone(),
        [init @ .., last] => format!("{} and {}", init.join(", "), last),
    }
}
