//! Fleet state and the operations clients can run against it.
//!
//! `Fleet` owns the registry, the PoE guard and the DHCP synchronizer. It is
//! driven by a single task (see [`crate::orchestrator`]) so none of this
//! state needs locking; blocking work goes through the dispatcher and the
//! task only waits on the returned handles.
//!
//! Every mutating operation persists the registry changes it made before
//! returning, and re-syncs DHCP when device addresses or names may have
//! moved.

use crate::agent::NodeAgent;
use crate::config::ServerConfig;
use crate::confirm::Confirm;
use crate::dhcp_sync::{DhcpSynchronizer, SyncOutcome};
use crate::dispatcher::Dispatcher;
use crate::error::{FleetError, Result};
use crate::event_manager::{EventManager, FleetEvent};
use crate::images::{bind_nodes, deployment_sentence, ImageStore};
use crate::poe::PoeGuard;
use crate::power::{PowerController, PowerReport, PowerSettings, RebootReport};
use crate::registry::{format_names, FailureReason, NodeSet, OwnershipReport, Registry, Sighting, TokenFailure};
use crate::scanner::{ScanReport, Scanner};
use crate::store::{Batch, FleetStore};
use kestrel_common::{Device, DeviceKind, Mac, DEFAULT_IMAGE};
use kestrel_dhcp::DhcpService;
use kestrel_snmp::SwitchAgent;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const NODE_VENDOR_CLASS: &str = "kestrel.node";
const SWITCH_VENDOR_CLASS: &str = "kestrel.switch";

/// External collaborators the fleet talks to
#[derive(Clone)]
pub struct Capabilities {
    pub switches: Arc<dyn SwitchAgent>,
    pub nodes: Arc<dyn NodeAgent>,
    pub images: Arc<dyn ImageStore>,
    pub dhcp: Arc<dyn DhcpService>,
    pub store: Arc<dyn FleetStore>,
}

/// Result of deploying an image on a node set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingOutcome {
    pub bound: Vec<String>,
    /// Node name and reason
    pub failed: Vec<(String, String)>,
    /// Soft reboot of the bound nodes
    pub reboot: Option<RebootReport>,
    /// Unknown-topology warning, when requested
    pub warning: Option<String>,
    /// Sentence shown to the requester
    pub message: String,
}

pub struct Fleet {
    registry: Registry,
    guard: PoeGuard,
    scanner: Scanner,
    dhcp: DhcpSynchronizer,
    power: PowerController,
    images: Arc<dyn ImageStore>,
    store: Arc<dyn FleetStore>,
    dispatcher: Dispatcher,
    events: EventManager,
}

/// Kind announced by a DHCP vendor class, if any
fn kind_from_vendor_class(vendor_class: Option<&str>) -> DeviceKind {
    match vendor_class {
        Some(vc) if vc.starts_with(NODE_VENDOR_CLASS) => DeviceKind::Node,
        Some(vc) if vc.starts_with(SWITCH_VENDOR_CLASS) => DeviceKind::Switch,
        _ => DeviceKind::Unknown,
    }
}

impl Fleet {
    /// Build the fleet from persisted state
    pub async fn load(config: &ServerConfig, capabilities: Capabilities, dispatcher: Dispatcher) -> Result<Self> {
        let snapshot = capabilities.store.snapshot().await?;
        info!(
            devices = snapshot.devices.len(),
            edges = snapshot.edges.len(),
            bindings = snapshot.bindings.len(),
            "loaded fleet state"
        );
        let mut registry = Registry::restore(snapshot.devices, snapshot.edges, snapshot.bindings);
        // Restoring may normalize stored data; nothing to write back yet
        registry.take_changes();

        let switch_timeout = config.power.switch_timeout();
        Ok(Self {
            registry,
            guard: PoeGuard::new(),
            scanner: Scanner::new(capabilities.switches.clone(), config.seeds.clone(), switch_timeout),
            dhcp: DhcpSynchronizer::new(
                config.network.clone(),
                config.paths.dhcp_config.clone(),
                capabilities.dhcp,
            ),
            power: PowerController::new(
                capabilities.switches,
                capabilities.nodes,
                PowerSettings::from(&config.power),
            ),
            images: capabilities.images,
            store: capabilities.store,
            dispatcher,
            events: EventManager::new(),
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn events(&self) -> &EventManager {
        &self.events
    }

    /// Write pending registry changes to the store and announce them.
    ///
    /// All changes go in one batch. If it cannot be written the registry
    /// keeps them pending for the next flush, and nothing is announced.
    async fn flush(&mut self) -> Result<()> {
        let changes = self.registry.take_changes();
        if changes.is_empty() {
            return Ok(());
        }

        let (bindings, unbound): (Vec<Mac>, Vec<Mac>) = changes
            .bindings
            .iter()
            .copied()
            .partition(|mac| self.registry.binding(*mac).is_some());
        let batch = Batch {
            devices: changes
                .devices
                .iter()
                .filter_map(|mac| self.registry.device(*mac).cloned())
                .collect(),
            removed: changes.removed.iter().copied().collect(),
            bindings: bindings
                .iter()
                .filter_map(|mac| self.registry.binding(*mac).cloned())
                .collect(),
            unbound,
            edges: changes.edges.then(|| self.registry.edges().cloned().collect()),
        };
        let devices = batch.devices.len();
        if let Err(e) = self.store.apply(batch).await {
            error!(error = %e, "cannot persist fleet state, changes kept pending");
            self.registry.restore_changes(changes);
            return Err(e.into());
        }
        debug!(
            devices,
            removed = changes.removed.len(),
            bindings = changes.bindings.len(),
            edges = changes.edges,
            "fleet state persisted"
        );

        for mac in changes.devices {
            self.events.send(FleetEvent::DeviceUpdated(mac));
        }
        for mac in changes.removed {
            self.events.send(FleetEvent::DeviceForgotten(mac));
        }
        for mac in changes.bindings {
            self.events.send(FleetEvent::BindingChanged(mac));
        }
        if changes.edges {
            self.events.send(FleetEvent::TopologyChanged);
        }
        Ok(())
    }

    // === Node sets ===

    pub fn resolve_node_set(&self, expression: &str, requester: &str) -> NodeSet {
        self.registry.resolve_node_set(expression, requester)
    }

    pub fn ownership_check(&self, expression: &str, requester: &str, warn: bool) -> Result<OwnershipReport> {
        let nodes = self.resolve_node_set(expression, requester).into_result()?;
        Ok(self.registry.ownership(&nodes, requester, warn))
    }

    /// Expand an expression to the comma-separated node names it designates
    pub fn develop_node_set(&self, expression: &str, requester: &str) -> Result<String> {
        let nodes = self.resolve_node_set(expression, requester).into_result()?;
        Ok(self.registry.names_of(&nodes).join(","))
    }

    // === Topology and DHCP ===

    pub async fn rescan_topology(&mut self) -> Result<ScanReport> {
        let report = self.scanner.rescan(&mut self.registry, &self.dispatcher).await;
        self.flush().await?;
        self.sync_dhcp(false).await?;
        Ok(report)
    }

    pub async fn sync_dhcp(&mut self, force: bool) -> Result<SyncOutcome> {
        let outcome = self.dhcp.sync(&self.registry, &self.dispatcher, force).await?;
        if let SyncOutcome::Applied { hosts } = outcome {
            self.events.send(FleetEvent::DhcpApplied { hosts });
        }
        Ok(outcome)
    }

    /// Boot-time refresh: DHCP must be up before switches can be reached
    pub async fn startup_update(&mut self) -> Result<ScanReport> {
        self.sync_dhcp(true).await?;
        self.rescan_topology().await
    }

    /// A DHCP lease was handed out
    pub async fn record_lease(&mut self, mac: Mac, ip: Ipv4Addr, vendor_class: Option<&str>) -> Result<()> {
        let kind = kind_from_vendor_class(vendor_class);
        let upsert = self
            .registry
            .upsert_device(Sighting::new(mac).with_kind(kind).with_ip(ip));
        if upsert.created || upsert.promoted {
            info!(mac = %mac, ip = %ip, kind = %kind, "device seen through DHCP");
        }
        self.flush().await?;
        self.sync_dhcp(false).await?;
        Ok(())
    }

    // === Power ===

    pub async fn set_power(&mut self, expression: &str, requester: &str, on: bool, warn: bool) -> Result<PowerReport> {
        let nodes = self.resolve_node_set(expression, requester).into_result()?;
        let mut report = self
            .power
            .set_power(&mut self.registry, &mut self.guard, &self.dispatcher, &nodes, on)
            .await;
        self.flush().await?;
        if warn && !report.unsupported.is_empty() {
            report.message = Some(format!(
                "{}: unknown topology, cannot power {}.",
                format_names(&report.unsupported),
                if on { "on" } else { "off" }
            ));
        }
        Ok(report)
    }

    pub async fn reboot_nodes(&mut self, expression: &str, requester: &str, hard: bool) -> Result<RebootReport> {
        let nodes = self.resolve_node_set(expression, requester).into_result()?;
        let report = self
            .power
            .reboot(&mut self.registry, &mut self.guard, &self.dispatcher, &nodes, hard)
            .await;
        self.flush().await?;
        Ok(report)
    }

    // === Images ===

    pub async fn has_image(&self, tag: &str) -> Result<bool> {
        let images = self.images.clone();
        let tag = tag.to_string();
        Ok(self.dispatcher.submit(None, move || images.exists(&tag)).wait().await?)
    }

    /// Nodes with a known switch port, and the names of the others
    fn filter_on_connectivity(&self, nodes: &[Mac]) -> (Vec<Mac>, Vec<String>) {
        let (connected, unknown): (Vec<Mac>, Vec<Mac>) = nodes
            .iter()
            .copied()
            .partition(|mac| self.registry.upstream_of(*mac).is_some());
        (connected, self.registry.names_of(&unknown))
    }

    /// Deploy `tag` on a node set and soft reboot the nodes.
    ///
    /// Nothing changes if the image is missing, the expression does not
    /// resolve, or the requester declines to take over someone else's
    /// nodes. Nodes of unknown topology are left alone and listed as
    /// failed; with `warn_unknown_topology` the outcome also carries a
    /// warning naming them.
    pub async fn set_image_binding(
        &mut self,
        expression: &str,
        requester: &str,
        tag: &str,
        warn_unknown_topology: bool,
        confirm: &dyn Confirm,
    ) -> Result<BindingOutcome> {
        if !self.has_image(tag).await? {
            return Err(FleetError::ImageNotFound(tag.to_string()));
        }
        let nodes = self.resolve_node_set(expression, requester).into_result()?;
        let (nodes, unknown) = self.filter_on_connectivity(&nodes);
        if !unknown.is_empty() {
            warn!(nodes = ?unknown, image = tag, "unknown topology, not deploying");
        }
        let warning = (warn_unknown_topology && !unknown.is_empty()).then(|| {
            format!(
                "{}: unknown topology, use 'kestrel device rescan' to update.",
                format_names(&unknown)
            )
        });

        let ownership = self.registry.ownership(&nodes, requester, true);
        if ownership.needs_confirmation() {
            let warning = ownership.warning.clone().unwrap_or_default();
            let question = format!("{} Deploy anyway?", warning);
            if !confirm.confirm(&question).await {
                info!(requester, image = tag, "deployment declined");
                return Err(FleetError::OwnershipConflict(ownership.conflicting));
            }
            warn!(requester, nodes = ?ownership.conflicting, "taking over nodes owned by another user");
        }

        let previous: Vec<_> = nodes
            .iter()
            .map(|mac| (*mac, self.registry.binding(*mac).cloned()))
            .collect();
        let mut report = bind_nodes(&mut self.registry, &nodes, tag, requester);
        let mut failed: Vec<(String, String)> = unknown
            .into_iter()
            .map(|name| (name, "unknown topology".to_string()))
            .collect();
        failed.append(&mut report.failed);

        if let Err(e) = self.flush().await {
            // Nodes must not reboot into an image the store does not know
            for (mac, binding) in previous.into_iter().filter(|(mac, _)| report.bound.contains(mac)) {
                self.registry.restore_binding(mac, binding);
                failed.push((self.registry.name_of(mac), format!("binding not saved: {}", e)));
            }
            report.bound.clear();
        }

        let bound = self.registry.names_of(&report.bound);
        let reboot = if report.bound.is_empty() {
            None
        } else {
            let reboot = self
                .power
                .reboot(&mut self.registry, &mut self.guard, &self.dispatcher, &report.bound, false)
                .await;
            if let Err(e) = self.flush().await {
                warn!(error = %e, "reboot state not persisted yet");
            }
            Some(reboot)
        };

        let resolved_default = if tag == DEFAULT_IMAGE {
            let images = self.images.clone();
            match self.dispatcher.submit(None, move || images.resolve_default()).wait().await {
                Ok(name) => name,
                Err(e) => {
                    error!(error = %e, "cannot resolve the default image");
                    DEFAULT_IMAGE.to_string()
                }
            }
        } else {
            String::new()
        };
        let message = if bound.is_empty() {
            "No node was updated.".to_string()
        } else {
            deployment_sentence(&bound, tag, &resolved_default)
        };

        Ok(BindingOutcome {
            bound,
            failed,
            reboot,
            warning,
            message,
        })
    }

    /// Switch the identification LED of a node; returns whether it acked
    pub async fn blink(&self, name: &str, on: bool) -> Result<bool> {
        let mac = self.node_named(name)?.mac;
        Ok(self.power.blink(&self.registry, &self.dispatcher, mac, on).await)
    }

    // === Lookups ===

    fn device_named(&self, name: &str) -> Result<&Device> {
        self.registry
            .find(name)
            .ok_or_else(|| FleetError::DeviceNotFound(name.to_string()))
    }

    pub fn get_device_ip(&self, name: &str) -> Result<Option<Ipv4Addr>> {
        Ok(self.device_named(name)?.ip)
    }

    pub fn is_device_reachable(&self, name: &str) -> Result<bool> {
        Ok(self.device_named(name)?.reachable)
    }

    fn node_named(&self, name: &str) -> Result<&Device> {
        let device = self.registry.find(name).ok_or_else(|| {
            FleetError::Resolution(vec![TokenFailure::new(name, FailureReason::NotFound)])
        })?;
        if !device.is_node() {
            return Err(FleetError::Resolution(vec![TokenFailure::new(name, FailureReason::NotANode)]));
        }
        Ok(device)
    }

    pub fn get_node_ip(&self, name: &str) -> Result<Option<Ipv4Addr>> {
        Ok(self.node_named(name)?.ip)
    }

    /// Addresses of the reachable nodes of a set, in set order
    pub fn get_reachable_nodes_ip(&self, expression: &str, requester: &str) -> Result<Vec<Ipv4Addr>> {
        let nodes = self.resolve_node_set(expression, requester).into_result()?;
        Ok(nodes
            .iter()
            .filter_map(|mac| self.registry.device(*mac))
            .filter(|d| d.reachable)
            .filter_map(|d| d.ip)
            .collect())
    }

    /// Names of the nodes of a set that are not reachable, in set order
    pub fn unready_nodes(&self, expression: &str, requester: &str) -> Result<Vec<String>> {
        let nodes = self.resolve_node_set(expression, requester).into_result()?;
        Ok(nodes
            .iter()
            .filter_map(|mac| self.registry.device(*mac))
            .filter(|d| !d.reachable)
            .map(|d| d.name.clone())
            .collect())
    }

    // === Device administration ===

    pub async fn rename_device(&mut self, old_name: &str, new_name: &str) -> Result<()> {
        self.registry.rename(old_name, new_name)?;
        self.flush().await?;
        self.sync_dhcp(false).await?;
        Ok(())
    }

    pub async fn forget_device(&mut self, name: &str) -> Result<()> {
        let mac = self.device_named(name)?.mac;
        for port in self.registry.children(mac).iter().map(|e| e.upstream_port()).collect::<Vec<_>>() {
            self.guard.clear(port);
        }
        self.registry.remove_device(mac);
        self.flush().await?;
        self.sync_dhcp(false).await?;
        Ok(())
    }

    /// Returns whether the kind changed
    pub async fn classify_device(&mut self, name: &str, kind: DeviceKind) -> Result<bool> {
        let changed = self.registry.classify(name, kind)?;
        if changed {
            self.flush().await?;
            self.sync_dhcp(false).await?;
        }
        Ok(changed)
    }

    // === Views ===

    pub fn device_tree(&self) -> String {
        self.registry.device_tree()
    }

    pub fn show_devices(&self) -> String {
        self.registry.show_devices()
    }

    pub fn show_nodes(&self, requester: &str, show_all: bool) -> String {
        self.registry.show_nodes(requester, show_all)
    }
}
