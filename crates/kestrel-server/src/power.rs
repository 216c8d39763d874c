//! Power and reboot control
//!
//! A soft reboot asks each node's agent to restart. Nodes that do not
//! acknowledge can be hard rebooted by cycling PoE on the switch port that
//! feeds them: the port is forced off, left off for a settle delay, then
//! restored. The [`PoeGuard`] counts holders per port so overlapping cycles
//! restore power once, after the last one is done, and a port that was
//! already off before the cycle stays off.

use crate::agent::{NodeAgent, Ack};
use crate::config::PowerConfig;
use crate::dispatcher::{Dispatcher, TaskError};
use crate::poe::PoeGuard;
use crate::registry::{format_names, Registry};
use kestrel_common::{Mac, PortRef, PowerState};
use kestrel_snmp::{SwitchAgent, SwitchTarget};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PowerSettings {
    pub soft_timeout: Duration,
    pub settle_delay: Duration,
    pub switch_timeout: Duration,
}

impl From<&PowerConfig> for PowerSettings {
    fn from(config: &PowerConfig) -> Self {
        Self {
            soft_timeout: config.soft_reboot_timeout(),
            settle_delay: config.poe_settle(),
            switch_timeout: config.switch_timeout(),
        }
    }
}

impl Default for PowerSettings {
    fn default() -> Self {
        Self::from(&PowerConfig::default())
    }
}

/// Outcome of a PoE cycle, by node name
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PoeReport {
    /// Forced off and powered again
    pub cycled: Vec<String>,
    /// Port was off before the cycle, left alone
    pub already_off: Vec<String>,
    /// No known switch port, or the switch has no address
    pub unsupported: Vec<String>,
    /// Node name and reason
    pub failed: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebootReport {
    /// Acknowledged the soft reboot
    pub ok: Vec<String>,
    /// Did not acknowledge
    pub ko: Vec<String>,
    /// Present when a hard reboot was attempted
    pub poe: Option<PoeReport>,
    /// Guidance for the requester, set when something needs attention
    pub message: Option<String>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PowerReport {
    pub switched: Vec<String>,
    pub unsupported: Vec<String>,
    pub failed: Vec<(String, String)>,
    /// Unknown-topology warning, when requested
    pub message: Option<String>,
}

/// A node and the switch port feeding it
#[derive(Debug, Clone)]
struct Feed {
    node: Mac,
    name: String,
    switch: SwitchTarget,
    port: PortRef,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ForceOff {
    Cut,
    NotCut,
    /// Still running after the switch timeout
    Late,
}

pub struct PowerController {
    switches: Arc<dyn SwitchAgent>,
    nodes: Arc<dyn NodeAgent>,
    settings: PowerSettings,
}

fn flatten<T, E: std::fmt::Display>(result: Result<Result<T, E>, TaskError>) -> Result<T, String> {
    match result {
        Ok(inner) => inner.map_err(|e| e.to_string()),
        Err(e) => Err(e.to_string()),
    }
}

impl PowerController {
    pub fn new(switches: Arc<dyn SwitchAgent>, nodes: Arc<dyn NodeAgent>, settings: PowerSettings) -> Self {
        Self {
            switches,
            nodes,
            settings,
        }
    }

    /// Ask each node to reboot. Returns `(acknowledged, not acknowledged)`,
    /// both in the order given.
    pub async fn soft_reboot(
        &self,
        registry: &mut Registry,
        dispatcher: &Dispatcher,
        nodes: &[Mac],
    ) -> (Vec<Mac>, Vec<Mac>) {
        let timeout = self.settings.soft_timeout;
        let pending: Vec<_> = nodes
            .iter()
            .map(|&mac| {
                let handle = registry.device(mac).and_then(|d| d.ip).map(|ip| {
                    let agent = self.nodes.clone();
                    dispatcher.submit(Some(mac), move || agent.request_reboot(ip, timeout))
                });
                (mac, handle)
            })
            .collect();

        let mut ok = Vec::new();
        let mut ko = Vec::new();
        for (mac, handle) in pending {
            let name = registry.name_of(mac);
            let acked = match handle {
                None => {
                    warn!(node = %name, "no known address, cannot request a reboot");
                    false
                }
                // Connect and read each get the full timeout, counted from
                // the moment this node's request starts
                Some(handle) => match flatten(handle.wait_timeout(timeout * 2).await) {
                    Ok(Ack::Acked) => true,
                    Ok(Ack::Timeout) => {
                        debug!(node = %name, "reboot not acknowledged in time");
                        false
                    }
                    Err(reason) => {
                        warn!(node = %name, error = %reason, "reboot request failed");
                        false
                    }
                },
            };
            registry.with_node(mac, |node| node.soft_reboot_ok = acked);
            if acked {
                // Down until the restarted node asks for a lease again
                registry.set_reachable(mac, false);
                ok.push(mac);
            } else {
                ko.push(mac);
            }
        }
        info!(ok = ok.len(), ko = ko.len(), "soft reboot requested");
        (ok, ko)
    }

    /// Switch a node's identification LED. `false` when the node has no
    /// known address or did not acknowledge.
    pub async fn blink(&self, registry: &Registry, dispatcher: &Dispatcher, node: Mac, on: bool) -> bool {
        let name = registry.name_of(node);
        let Some(ip) = registry.device(node).and_then(|d| d.ip) else {
            warn!(node = %name, "no known address, cannot blink");
            return false;
        };
        let timeout = self.settings.soft_timeout;
        let agent = self.nodes.clone();
        let handle = dispatcher.submit(Some(node), move || agent.blink(ip, on, timeout));
        match flatten(handle.wait_timeout(timeout * 2).await) {
            Ok(Ack::Acked) => {
                debug!(node = %name, on, "blink acknowledged");
                true
            }
            Ok(Ack::Timeout) => {
                debug!(node = %name, "blink not acknowledged in time");
                false
            }
            Err(reason) => {
                warn!(node = %name, error = %reason, "blink request failed");
                false
            }
        }
    }

    fn feed(registry: &Registry, node: Mac) -> Option<Feed> {
        let edge = registry.upstream_of(node)?;
        let switch = registry.device(edge.device_a)?;
        let ip = switch.ip?;
        Some(Feed {
            node,
            name: registry.name_of(node),
            switch: SwitchTarget::new(switch.mac, ip),
            port: edge.upstream_port(),
        })
    }

    /// Split `nodes` into those with a usable switch port and the names of
    /// the others
    fn feeds(registry: &Registry, nodes: &[Mac]) -> (Vec<Feed>, Vec<String>) {
        let mut feeds = Vec::new();
        let mut unsupported = Vec::new();
        for &mac in nodes {
            match Self::feed(registry, mac) {
                Some(feed) => feeds.push(feed),
                None => {
                    let name = registry.name_of(mac);
                    warn!(node = %name, "no PoE port known for node");
                    unsupported.push(name);
                }
            }
        }
        (feeds, unsupported)
    }

    async fn switch_port(&self, dispatcher: &Dispatcher, feed: &Feed, on: bool) -> Result<bool, String> {
        let agent = self.switches.clone();
        let switch = feed.switch;
        let port = feed.port.port;
        let handle = dispatcher.submit(Some(switch.mac), move || agent.set_port_power(&switch, port, on));
        flatten(handle.wait_timeout(self.settings.switch_timeout).await)
    }

    fn force_off_outcome(
        &self,
        registry: &mut Registry,
        feed: &Feed,
        result: Result<bool, String>,
        report: &mut PoeReport,
    ) -> ForceOff {
        match result {
            Ok(true) => {
                registry.with_node(feed.node, |n| n.power = PowerState::Off);
                ForceOff::Cut
            }
            Ok(false) => {
                warn!(node = %feed.name, port = %feed.port, "switch refused to cut power");
                report.failed.push((feed.name.clone(), "switch refused to cut power".to_string()));
                ForceOff::NotCut
            }
            Err(reason) => {
                error!(node = %feed.name, port = %feed.port, error = %reason, "PoE force-off failed");
                report.failed.push((feed.name.clone(), reason));
                ForceOff::NotCut
            }
        }
    }

    /// Cycle PoE on the ports feeding `nodes`.
    ///
    /// Every port forced off here is restored after the settle delay unless
    /// another cycle still holds it, including when the force-off itself
    /// failed. A force-off still running after the switch timeout is waited
    /// for before its port is restored.
    pub async fn hard_cycle(
        &self,
        registry: &mut Registry,
        guard: &mut PoeGuard,
        dispatcher: &Dispatcher,
        nodes: &[Mac],
    ) -> PoeReport {
        let (feeds, unsupported) = Self::feeds(registry, nodes);
        let mut report = PoeReport {
            unsupported,
            ..PoeReport::default()
        };

        // Ports already off stay off
        let reads: Vec<_> = feeds
            .iter()
            .map(|feed| {
                let agent = self.switches.clone();
                let switch = feed.switch;
                let port = feed.port.port;
                dispatcher.submit(Some(switch.mac), move || agent.port_power(&switch, port))
            })
            .collect();
        let mut targets = Vec::new();
        for (feed, read) in feeds.into_iter().zip(reads) {
            match flatten(read.wait_timeout(self.settings.switch_timeout).await) {
                Ok(Some(false)) => {
                    info!(node = %feed.name, port = %feed.port, "port already off, not cycling");
                    report.already_off.push(feed.name);
                }
                Ok(_) => targets.push(feed),
                Err(reason) => {
                    debug!(node = %feed.name, error = %reason, "port state unknown, cycling anyway");
                    targets.push(feed);
                }
            }
        }

        let mut offs: Vec<_> = targets
            .iter()
            .map(|feed| {
                guard.hold(feed.port);
                let agent = self.switches.clone();
                let switch = feed.switch;
                let port = feed.port.port;
                dispatcher.submit(Some(switch.mac), move || agent.set_port_power(&switch, port, false))
            })
            .collect();

        let mut cut = Vec::with_capacity(targets.len());
        for (feed, off) in targets.iter().zip(offs.iter_mut()) {
            let Some(result) = off.try_wait(self.settings.switch_timeout).await else {
                warn!(node = %feed.name, port = %feed.port, "PoE force-off is slow, restore will wait for it");
                cut.push(ForceOff::Late);
                continue;
            };
            cut.push(self.force_off_outcome(registry, feed, flatten(result), &mut report));
        }

        if !targets.is_empty() {
            tokio::time::sleep(self.settings.settle_delay).await;
        }

        for ((feed, outcome), off) in targets.iter().zip(cut).zip(offs) {
            let was_cut = match outcome {
                ForceOff::Cut => true,
                ForceOff::NotCut => false,
                // The restore must not overtake a force-off still in flight
                ForceOff::Late => {
                    let result = flatten(off.wait().await);
                    let cut = self.force_off_outcome(registry, feed, result, &mut report) == ForceOff::Cut;
                    if cut {
                        tokio::time::sleep(self.settings.settle_delay).await;
                    }
                    cut
                }
            };

            if !guard.release(feed.port) {
                debug!(node = %feed.name, port = %feed.port, "port still held, restore deferred");
                continue;
            }
            match self.switch_port(dispatcher, feed, true).await {
                Ok(true) => {
                    registry.with_node(feed.node, |n| n.power = PowerState::On);
                    if was_cut {
                        registry.set_reachable(feed.node, false);
                        report.cycled.push(feed.name.clone());
                    }
                }
                Ok(false) => {
                    error!(node = %feed.name, port = %feed.port, "switch refused to restore power");
                    report.failed.push((feed.name.clone(), "switch refused to restore power".to_string()));
                }
                Err(reason) => {
                    error!(node = %feed.name, port = %feed.port, error = %reason, "PoE restore failed");
                    report.failed.push((feed.name.clone(), format!("restore failed: {}", reason)));
                }
            }
        }

        info!(
            cycled = report.cycled.len(),
            already_off = report.already_off.len(),
            unsupported = report.unsupported.len(),
            failed = report.failed.len(),
            "PoE cycle complete"
        );
        report
    }

    /// Soft reboot, then PoE cycle the nodes that did not answer if `hard`
    pub async fn reboot(
        &self,
        registry: &mut Registry,
        guard: &mut PoeGuard,
        dispatcher: &Dispatcher,
        nodes: &[Mac],
        hard: bool,
    ) -> RebootReport {
        let (ok, ko) = self.soft_reboot(registry, dispatcher, nodes).await;
        let mut report = RebootReport {
            ok: registry.names_of(&ok),
            ko: registry.names_of(&ko),
            poe: None,
            message: None,
        };
        if ko.is_empty() {
            return report;
        }

        if !hard {
            report.message = Some(soft_failure_message(&report.ko));
            return report;
        }

        let poe = self.hard_cycle(registry, guard, dispatcher, &ko).await;
        report.message = hard_failure_message(&poe);
        report.poe = Some(poe);
        report
    }

    /// Switch PoE on or off for each node.
    ///
    /// Powering a port on clears any pending hold on it.
    pub async fn set_power(
        &self,
        registry: &mut Registry,
        guard: &mut PoeGuard,
        dispatcher: &Dispatcher,
        nodes: &[Mac],
        on: bool,
    ) -> PowerReport {
        let (feeds, unsupported) = Self::feeds(registry, nodes);
        let mut report = PowerReport {
            unsupported,
            ..PowerReport::default()
        };

        let handles: Vec<_> = feeds
            .iter()
            .map(|feed| {
                let agent = self.switches.clone();
                let switch = feed.switch;
                let port = feed.port.port;
                dispatcher.submit(Some(switch.mac), move || agent.set_port_power(&switch, port, on))
            })
            .collect();

        for (feed, handle) in feeds.into_iter().zip(handles) {
            match flatten(handle.wait_timeout(self.settings.switch_timeout).await) {
                Ok(true) => {
                    if on {
                        guard.clear(feed.port);
                    }
                    let state = if on { PowerState::On } else { PowerState::Off };
                    registry.with_node(feed.node, |n| n.power = state);
                    report.switched.push(feed.name);
                }
                Ok(false) => report.failed.push((feed.name, "switch refused the change".to_string())),
                Err(reason) => {
                    warn!(node = %feed.name, error = %reason, "PoE change failed");
                    report.failed.push((feed.name, reason));
                }
            }
        }
        info!(on, switched = report.switched.len(), failed = report.failed.len(), "power change");
        report
    }
}

fn soft_failure_message(ko: &[String]) -> String {
    let (who, were) = if ko.len() == 1 { ("It", "was") } else { ("They", "were") };
    format!(
        "{} did not acknowledge the reboot request. {} {} probably not fully booted.\n\
         Retry with a hard reboot: kestrel node reboot {} --hard",
        format_names(ko),
        who,
        were,
        ko.join(",")
    )
}

fn hard_failure_message(poe: &PoeReport) -> Option<String> {
    let mut lines = Vec::new();
    if !poe.unsupported.is_empty() {
        lines.push(format!(
            "{}: PoE is not available (unknown switch port), power cycle manually.",
            format_names(&poe.unsupported)
        ));
    }
    if !poe.already_off.is_empty() {
        lines.push(format!(
            "{}: port is powered off, use 'kestrel node on' first.",
            format_names(&poe.already_off)
        ));
    }
    for (name, reason) in &poe.failed {
        lines.push(format!("{}: {}", name, reason));
    }
    (!lines.is_empty()).then(|| lines.join("\n"))
}
