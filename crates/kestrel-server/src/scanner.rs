//! Topology discovery
//!
//! Walks the switch graph breadth first, starting from every known switch.
//! Each switch's LLDP table gives its neighbors; bridge-capable neighbors
//! become switches and are queried in the same pass, so a second rescan of
//! an unchanged network finds nothing new and writes the same edges.
//!
//! When two switches report the same device, the edge written last wins.
//! Switches are queried level by level and results are applied in
//! registry order, so the outcome only depends on what the switches
//! report.

use crate::config::SeedSwitch;
use crate::dispatcher::Dispatcher;
use crate::registry::{Registry, Sighting};
use kestrel_common::{DeviceKind, Mac, PortRef};
use kestrel_snmp::{Neighbor, SwitchAgent, SwitchTarget};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Outcome of one rescan pass
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScanReport {
    pub switches_queried: usize,
    /// Switch name and reason
    pub failed_switches: Vec<(String, String)>,
    pub new_devices: Vec<String>,
    pub unreachable: Vec<String>,
    pub devices: usize,
    pub edges: usize,
}

pub struct Scanner {
    agent: Arc<dyn SwitchAgent>,
    seeds: Vec<SeedSwitch>,
    timeout: Duration,
}

/// Mutable state of one pass
struct Pass {
    roots: BTreeSet<Mac>,
    visited: BTreeSet<Mac>,
    seen: BTreeSet<Mac>,
    failed: BTreeSet<Mac>,
    next: Vec<SwitchTarget>,
    report: ScanReport,
}

impl Scanner {
    pub fn new(agent: Arc<dyn SwitchAgent>, seeds: Vec<SeedSwitch>, timeout: Duration) -> Self {
        Self {
            agent,
            seeds,
            timeout,
        }
    }

    pub async fn rescan(&self, registry: &mut Registry, dispatcher: &Dispatcher) -> ScanReport {
        self.register_seeds(registry);

        let mut pass = Pass {
            roots: self.seeds.iter().map(|s| s.mac).collect(),
            visited: BTreeSet::new(),
            seen: BTreeSet::new(),
            failed: BTreeSet::new(),
            next: Vec::new(),
            report: ScanReport::default(),
        };

        let mut level = Vec::new();
        for switch in registry.list_by_kind(DeviceKind::Switch) {
            pass.visited.insert(switch.mac);
            match switch.ip {
                Some(ip) => level.push(SwitchTarget::new(switch.mac, ip)),
                None => {
                    warn!(switch = %switch.name, "switch has no IP address, skipping");
                    pass.report
                        .failed_switches
                        .push((switch.name.clone(), "no IP address".to_string()));
                }
            }
        }
        if level.is_empty() {
            warn!("no switch to query");
        }

        while !level.is_empty() {
            self.scan_level(registry, dispatcher, &level, &mut pass).await;
            level = std::mem::take(&mut pass.next);
        }

        let macs: Vec<Mac> = registry.devices().map(|d| d.mac).collect();
        for mac in macs {
            let reachable = pass.seen.contains(&mac) && !pass.failed.contains(&mac);
            registry.set_reachable(mac, reachable);
            if !reachable {
                pass.report.unreachable.push(registry.name_of(mac));
            }
        }

        let mut report = pass.report;
        report.devices = registry.len();
        report.edges = registry.edge_count();
        info!(
            switches = report.switches_queried,
            failed = report.failed_switches.len(),
            new = report.new_devices.len(),
            edges = report.edges,
            "topology rescan complete"
        );
        report
    }

    fn register_seeds(&self, registry: &mut Registry) {
        for seed in &self.seeds {
            match registry.device(seed.mac) {
                None => {
                    let mut sighting = Sighting::new(seed.mac)
                        .with_kind(DeviceKind::Switch)
                        .with_ip(seed.ip);
                    if let Some(name) = &seed.name {
                        sighting = sighting.with_name(name.clone());
                    }
                    registry.upsert_device(sighting);
                }
                Some(device) => {
                    if device.ip != Some(seed.ip) {
                        registry.set_ip(seed.mac, seed.ip);
                    }
                    registry.promote(seed.mac, DeviceKind::Switch);
                }
            }
        }
    }

    async fn scan_level(
        &self,
        registry: &mut Registry,
        dispatcher: &Dispatcher,
        level: &[SwitchTarget],
        pass: &mut Pass,
    ) {
        let handles: Vec<_> = level
            .iter()
            .map(|target| {
                let agent = self.agent.clone();
                let target = *target;
                (target, dispatcher.submit(Some(target.mac), move || agent.neighbors(&target)))
            })
            .collect();

        // Each query gets the full timeout once it starts
        for (target, handle) in handles {
            let name = registry.name_of(target.mac);
            let result = match handle.wait_timeout(self.timeout).await {
                Ok(result) => result.map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };
            match result {
                Ok(neighbors) => {
                    debug!(switch = %name, neighbors = neighbors.len(), "LLDP table read");
                    pass.report.switches_queried += 1;
                    pass.seen.insert(target.mac);
                    self.apply(registry, target.mac, neighbors, pass);
                }
                Err(reason) => {
                    error!(switch = %name, ip = %target.ip, error = %reason, "switch query failed, skipping");
                    pass.failed.insert(target.mac);
                    pass.report.failed_switches.push((name, reason));
                }
            }
        }
    }

    fn apply(&self, registry: &mut Registry, switch: Mac, mut neighbors: Vec<Neighbor>, pass: &mut Pass) {
        neighbors.sort_by_key(|n| n.local_port);
        let mut kept = BTreeSet::new();

        for neighbor in neighbors {
            let remote = neighbor.remote_mac;
            if remote == switch {
                continue;
            }

            let kind = if neighbor.bridge {
                DeviceKind::Switch
            } else {
                DeviceKind::Unknown
            };
            let mut sighting = Sighting::new(remote).with_kind(kind);
            if let Some(name) = neighbor.remote_name {
                sighting = sighting.with_name(name);
            }
            if let Some(ip) = neighbor.remote_ip {
                sighting = sighting.with_ip(ip);
            }
            if registry.upsert_device(sighting).created {
                pass.report.new_devices.push(registry.name_of(remote));
            }
            pass.seen.insert(remote);

            // LLDP back-link to where we came from
            if pass.roots.contains(&remote) || registry.is_ancestor(remote, switch) {
                debug!(switch = %switch, port = neighbor.local_port, remote = %remote, "uplink, no edge");
                continue;
            }

            registry.record_edge(PortRef::new(switch, neighbor.local_port), remote, neighbor.remote_port);
            kept.insert(neighbor.local_port);

            if let Some(device) = registry.device(remote) {
                if device.is_switch() && pass.visited.insert(remote) {
                    match device.ip {
                        Some(ip) => pass.next.push(SwitchTarget::new(remote, ip)),
                        None => {
                            warn!(switch = %device.name, "discovered switch has no IP address");
                            pass.report
                                .failed_switches
                                .push((device.name.clone(), "no IP address".to_string()));
                        }
                    }
                }
            }
        }

        let dropped = registry.retain_ports(switch, &kept);
        if dropped > 0 {
            debug!(switch = %switch, dropped, "stale edges removed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::DispatcherLimits;
    use crate::test_helpers::{mac, FakeSwitches};
    use kestrel_common::TopologyEdge;
    use std::net::Ipv4Addr;

    fn seed(last: u8, ip_last: u8) -> SeedSwitch {
        SeedSwitch {
            mac: mac(last),
            ip: Ipv4Addr::new(192, 168, 152, ip_last),
            name: Some(format!("sw{}", last)),
        }
    }

    fn edges(registry: &Registry) -> Vec<TopologyEdge> {
        registry.edges().cloned().collect()
    }

    /// root(sw1) port 1 -> sw2 (bridge) -> port 3 node A, port 4 node B
    /// root port 2 -> node C
    fn two_level_fabric() -> Arc<FakeSwitches> {
        let fake = Arc::new(FakeSwitches::default());
        fake.set_neighbors(
            mac(1),
            vec![
                Neighbor::new(1, mac(2))
                    .as_bridge()
                    .with_ip(Ipv4Addr::new(192, 168, 152, 3))
                    .with_remote_port(24),
                Neighbor::new(2, mac(0x13)).with_name("rpi-c"),
            ],
        );
        fake.set_neighbors(
            mac(2),
            vec![
                Neighbor::new(24, mac(1)).as_bridge(),
                Neighbor::new(3, mac(0x11)),
                Neighbor::new(4, mac(0x12)),
            ],
        );
        fake
    }

    fn scanner(fake: Arc<FakeSwitches>) -> Scanner {
        Scanner::new(fake, vec![seed(1, 2)], Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_discovers_whole_fabric_in_one_pass() {
        let fake = two_level_fabric();
        let scanner = scanner(fake.clone());
        let dispatcher = Dispatcher::new(DispatcherLimits::default());
        let mut registry = Registry::new();

        let report = scanner.rescan(&mut registry, &dispatcher).await;
        assert_eq!(report.switches_queried, 2);
        assert!(report.failed_switches.is_empty());
        assert_eq!(report.new_devices.len(), 4);
        assert_eq!(report.edges, 4);

        assert!(registry.device(mac(2)).unwrap().is_switch());
        assert_eq!(registry.device(mac(0x11)).unwrap().kind(), DeviceKind::Unknown);
        assert_eq!(registry.device(mac(0x13)).unwrap().name, "rpi-c");
        assert_eq!(
            registry.upstream_of(mac(0x11)).unwrap().upstream_port(),
            PortRef::new(mac(2), 3)
        );
        // The back-link from sw2 to the root is not an edge
        assert!(registry.upstream_of(mac(1)).is_none());
        assert!(registry.devices().all(|d| d.reachable));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_queued_switch_queries_get_their_own_timeout() {
        let fake = Arc::new(FakeSwitches::default());
        let children: Vec<_> = (2..8u8)
            .map(|last| {
                Neighbor::new(u32::from(last), mac(last))
                    .as_bridge()
                    .with_ip(Ipv4Addr::new(192, 168, 152, 10 + last))
            })
            .collect();
        fake.set_neighbors(mac(1), children);
        fake.set_delay(Duration::from_millis(80));
        let scanner = Scanner::new(fake, vec![seed(1, 2)], Duration::from_millis(150));
        // One query at a time: the last switch of the level waits ~400ms
        let dispatcher = Dispatcher::new(DispatcherLimits {
            workers: 1,
            per_destination: 1,
        });
        let mut registry = Registry::new();

        let report = scanner.rescan(&mut registry, &dispatcher).await;
        assert!(report.failed_switches.is_empty(), "{:?}", report.failed_switches);
        assert_eq!(report.switches_queried, 7);
    }

    #[tokio::test]
    async fn test_rescan_is_idempotent() {
        let fake = two_level_fabric();
        let scanner = scanner(fake.clone());
        let dispatcher = Dispatcher::new(DispatcherLimits::default());
        let mut registry = Registry::new();

        scanner.rescan(&mut registry, &dispatcher).await;
        let first = edges(&registry);
        registry.take_changes();

        let report = scanner.rescan(&mut registry, &dispatcher).await;
        assert!(report.new_devices.is_empty());
        assert_eq!(edges(&registry), first);
        assert!(!registry.take_changes().edges);
    }

    #[tokio::test]
    async fn test_unreachable_switch_is_skipped() {
        let fake = two_level_fabric();
        let scanner = scanner(fake.clone());
        let dispatcher = Dispatcher::new(DispatcherLimits::default());
        let mut registry = Registry::new();
        scanner.rescan(&mut registry, &dispatcher).await;

        fake.make_unreachable(mac(2));
        let report = scanner.rescan(&mut registry, &dispatcher).await;
        assert_eq!(report.failed_switches.len(), 1);
        assert_eq!(report.failed_switches[0].0, "switch-000002");

        // Edges of the failed switch are kept, its devices are unreachable
        assert!(registry.upstream_of(mac(0x11)).is_some());
        assert!(!registry.device(mac(0x11)).unwrap().reachable);
        assert!(!registry.device(mac(2)).unwrap().reachable);
        assert!(registry.device(mac(0x13)).unwrap().reachable);
        assert!(registry.device(mac(0x11)).is_some());
    }

    #[tokio::test]
    async fn test_vanished_port_loses_edge_not_device() {
        let fake = two_level_fabric();
        let scanner = scanner(fake.clone());
        let dispatcher = Dispatcher::new(DispatcherLimits::default());
        let mut registry = Registry::new();
        scanner.rescan(&mut registry, &dispatcher).await;

        fake.set_neighbors(mac(2), vec![Neighbor::new(3, mac(0x11))]);
        let report = scanner.rescan(&mut registry, &dispatcher).await;

        assert!(registry.upstream_of(mac(0x12)).is_none());
        assert!(!registry.device(mac(0x12)).unwrap().reachable);
        assert!(report.unreachable.contains(&"unknown-000012".to_string()));
    }

    #[tokio::test]
    async fn test_conflicting_reports_last_write_wins() {
        // Two seed switches both claim node X
        let fake = Arc::new(FakeSwitches::default());
        fake.set_neighbors(mac(1), vec![Neighbor::new(5, mac(0x20))]);
        fake.set_neighbors(mac(2), vec![Neighbor::new(7, mac(0x20))]);
        let scanner = Scanner::new(fake.clone(), vec![seed(1, 2), seed(2, 3)], Duration::from_secs(1));
        let dispatcher = Dispatcher::new(DispatcherLimits::default());
        let mut registry = Registry::new();

        scanner.rescan(&mut registry, &dispatcher).await;
        let edge = registry.upstream_of(mac(0x20)).unwrap().upstream_port();
        assert_eq!(edge, PortRef::new(mac(2), 7));
        assert_eq!(registry.edge_count(), 1);

        // Same answer on every pass
        scanner.rescan(&mut registry, &dispatcher).await;
        assert_eq!(registry.upstream_of(mac(0x20)).unwrap().upstream_port(), edge);
        assert_eq!(registry.edge_count(), 1);
    }

    #[tokio::test]
    async fn test_switch_loop_does_not_create_cycle() {
        // sw1 -> sw2 -> sw3 -> back to sw1 through a non-root port
        let fake = Arc::new(FakeSwitches::default());
        let ip = |n| Ipv4Addr::new(192, 168, 152, n);
        fake.set_neighbors(mac(1), vec![Neighbor::new(1, mac(2)).as_bridge().with_ip(ip(3))]);
        fake.set_neighbors(mac(2), vec![Neighbor::new(2, mac(3)).as_bridge().with_ip(ip(4))]);
        fake.set_neighbors(mac(3), vec![Neighbor::new(3, mac(2)).as_bridge()]);
        let scanner = scanner(fake);
        let dispatcher = Dispatcher::new(DispatcherLimits::default());
        let mut registry = Registry::new();

        scanner.rescan(&mut registry, &dispatcher).await;
        assert_eq!(registry.edge_count(), 2);
        assert!(registry.is_ancestor(mac(1), mac(3)));
        assert!(!registry.is_ancestor(mac(3), mac(2)));
    }
}
