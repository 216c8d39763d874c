//! Test helpers: in-memory stand-ins for switches, node agents, the image
//! backend and the DHCP daemon, plus a ready-to-use fleet.

use crate::agent::{AgentError, NodeAgent, Ack};
use crate::config::{PowerConfig, SeedSwitch, ServerConfig};
use crate::dispatcher::{Dispatcher, DispatcherLimits};
use crate::fleet::{Capabilities, Fleet};
use crate::images::ImageStore;
use crate::store::{Batch, FleetStore, MemoryStore, StoreError};
use async_trait::async_trait;
use kestrel_common::{Device, ImageBinding, Mac, PortRef, TopologyEdge, DEFAULT_IMAGE};
use kestrel_dhcp::{DhcpConfig, DhcpError, DhcpService};
use kestrel_snmp::{Neighbor, SnmpError, SwitchAgent, SwitchTarget};
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

pub fn mac(last: u8) -> Mac {
    Mac::new([0xb8, 0x27, 0xeb, 0x00, 0x00, last])
}

pub fn ip(last: u8) -> Ipv4Addr {
    Ipv4Addr::new(192, 168, 152, last)
}

/// One PoE command as seen by a switch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoeCall {
    pub port: PortRef,
    pub on: bool,
}

/// Switches answering from tables set up by the test
#[derive(Default)]
pub struct FakeSwitches {
    tables: Mutex<HashMap<Mac, Vec<Neighbor>>>,
    unreachable: Mutex<HashSet<Mac>>,
    ports: Mutex<HashMap<PortRef, bool>>,
    refuse_off: Mutex<HashSet<PortRef>>,
    calls: Mutex<Vec<PoeCall>>,
    delay: Mutex<Option<Duration>>,
    off_delay: Mutex<Option<Duration>>,
}

impl FakeSwitches {
    pub fn set_neighbors(&self, switch: Mac, neighbors: Vec<Neighbor>) {
        self.tables.lock().unwrap().insert(switch, neighbors);
    }

    pub fn make_unreachable(&self, switch: Mac) {
        self.unreachable.lock().unwrap().insert(switch);
    }

    pub fn set_port(&self, port: PortRef, on: bool) {
        self.ports.lock().unwrap().insert(port, on);
    }

    pub fn port_state(&self, port: PortRef) -> bool {
        self.ports.lock().unwrap().get(&port).copied().unwrap_or(true)
    }

    /// Forcing this port off fails with an agent error
    pub fn refuse_power_off(&self, port: PortRef) {
        self.refuse_off.lock().unwrap().insert(port);
    }

    /// Every LLDP read and PoE change sleeps this long first
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    /// Forcing a port off sleeps this long first; powering on stays fast
    pub fn set_off_delay(&self, delay: Duration) {
        *self.off_delay.lock().unwrap() = Some(delay);
    }

    pub fn calls(&self) -> Vec<PoeCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_on(&self, port: PortRef) -> Vec<bool> {
        self.calls().into_iter().filter(|c| c.port == port).map(|c| c.on).collect()
    }

    fn check(&self, switch: &SwitchTarget) -> kestrel_snmp::Result<()> {
        if self.unreachable.lock().unwrap().contains(&switch.mac) {
            return Err(SnmpError::Timeout(switch.ip));
        }
        Ok(())
    }
}

impl SwitchAgent for FakeSwitches {
    fn neighbors(&self, switch: &SwitchTarget) -> kestrel_snmp::Result<Vec<Neighbor>> {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        self.check(switch)?;
        Ok(self.tables.lock().unwrap().get(&switch.mac).cloned().unwrap_or_default())
    }

    fn set_port_power(&self, switch: &SwitchTarget, port: u32, on: bool) -> kestrel_snmp::Result<bool> {
        let delay = *self.delay.lock().unwrap();
        let off_delay = if on { None } else { *self.off_delay.lock().unwrap() };
        if let Some(delay) = delay.or(off_delay) {
            std::thread::sleep(delay);
        }
        self.check(switch)?;
        let port = PortRef::new(switch.mac, port);
        self.calls.lock().unwrap().push(PoeCall { port, on });
        if !on && self.refuse_off.lock().unwrap().contains(&port) {
            return Err(SnmpError::CommandFailed(format!("port {} is locked", port.port)));
        }
        self.set_port(port, on);
        Ok(true)
    }

    fn port_power(&self, switch: &SwitchTarget, port: u32) -> kestrel_snmp::Result<Option<bool>> {
        self.check(switch)?;
        Ok(Some(self.port_state(PortRef::new(switch.mac, port))))
    }
}

/// Node agents; only the listed addresses acknowledge reboots
#[derive(Default)]
pub struct FakeNodes {
    acking: Mutex<HashSet<Ipv4Addr>>,
    requests: Mutex<Vec<Ipv4Addr>>,
    blinks: Mutex<Vec<(Ipv4Addr, bool)>>,
    ack_delay: Mutex<Option<Duration>>,
}

impl FakeNodes {
    pub fn ack(&self, ip: Ipv4Addr) {
        self.acking.lock().unwrap().insert(ip);
    }

    pub fn requests(&self) -> Vec<Ipv4Addr> {
        self.requests.lock().unwrap().clone()
    }

    pub fn blinks(&self) -> Vec<(Ipv4Addr, bool)> {
        self.blinks.lock().unwrap().clone()
    }

    /// Acking nodes answer after `delay`; silent ones use up the whole
    /// timeout like a real agent would
    pub fn set_ack_delay(&self, delay: Duration) {
        *self.ack_delay.lock().unwrap() = Some(delay);
    }
}

impl NodeAgent for FakeNodes {
    fn request_reboot(&self, ip: Ipv4Addr, timeout: Duration) -> Result<Ack, AgentError> {
        self.requests.lock().unwrap().push(ip);
        let acking = self.acking.lock().unwrap().contains(&ip);
        let delay = *self.ack_delay.lock().unwrap();
        if let Some(delay) = delay {
            std::thread::sleep(if acking { delay } else { timeout });
        }
        if acking {
            Ok(Ack::Acked)
        } else {
            Ok(Ack::Timeout)
        }
    }

    fn blink(&self, ip: Ipv4Addr, on: bool, _timeout: Duration) -> Result<Ack, AgentError> {
        self.blinks.lock().unwrap().push((ip, on));
        if self.acking.lock().unwrap().contains(&ip) {
            Ok(Ack::Acked)
        } else {
            Ok(Ack::Timeout)
        }
    }
}

pub struct FakeImages {
    tags: Mutex<HashSet<String>>,
}

impl Default for FakeImages {
    fn default() -> Self {
        Self {
            tags: Mutex::new(HashSet::from([DEFAULT_IMAGE.to_string()])),
        }
    }
}

impl FakeImages {
    pub fn add(&self, tag: &str) {
        self.tags.lock().unwrap().insert(tag.to_string());
    }
}

impl ImageStore for FakeImages {
    fn exists(&self, tag: &str) -> bool {
        self.tags.lock().unwrap().contains(tag)
    }

    fn resolve_default(&self) -> String {
        "raspbian-lite".to_string()
    }
}

/// DHCP daemon counting reloads
#[derive(Default)]
pub struct FakeDhcp {
    reloads: AtomicUsize,
    failing: AtomicBool,
}

impl FakeDhcp {
    pub fn reloads(&self) -> usize {
        self.reloads.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl DhcpService for FakeDhcp {
    fn reload(&self) -> kestrel_dhcp::Result<()> {
        self.reloads.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(DhcpError::ReloadFailed("dhcpd exited with status 1".to_string()));
        }
        Ok(())
    }
}

/// Memory store whose writes fail on demand, reads keep working
#[derive(Default)]
pub struct TestStore {
    inner: MemoryStore,
    failing: AtomicBool,
}

impl TestStore {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl FleetStore for TestStore {
    async fn get_device(&self, mac: Mac) -> crate::store::Result<Option<Device>> {
        self.inner.get_device(mac).await
    }

    async fn list_devices(&self) -> crate::store::Result<Vec<Device>> {
        self.inner.list_devices().await
    }

    async fn list_edges(&self) -> crate::store::Result<Vec<TopologyEdge>> {
        self.inner.list_edges().await
    }

    async fn list_bindings(&self) -> crate::store::Result<Vec<ImageBinding>> {
        self.inner.list_bindings().await
    }

    async fn apply(&self, batch: Batch) -> crate::store::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Database("No space left on device".to_string()));
        }
        self.inner.apply(batch).await
    }
}

pub fn test_network() -> DhcpConfig {
    DhcpConfig::new(Ipv4Addr::new(192, 168, 152, 0)).with_pool_range(ip(100), ip(200))
}

/// Configuration for tests: one seed switch, short delays
pub fn test_config(tmp: &TempDir) -> ServerConfig {
    let mut config = ServerConfig::new(test_network());
    config.paths.dhcp_config = tmp.path().join("dhcpd.conf");
    config.paths.images_root = tmp.path().join("images");
    config.power = PowerConfig {
        soft_reboot_timeout_secs: 1,
        poe_settle_secs: 0,
        switch_timeout_secs: 1,
        ..PowerConfig::default()
    };
    config.seeds = vec![SeedSwitch {
        mac: mac(1),
        ip: ip(2),
        name: Some("sw1".to_string()),
    }];
    config
}

/// A fleet wired to fakes, with handles on every fake
pub struct TestFleet {
    pub fleet: Fleet,
    pub switches: Arc<FakeSwitches>,
    pub nodes: Arc<FakeNodes>,
    pub images: Arc<FakeImages>,
    pub dhcp: Arc<FakeDhcp>,
    pub store: Arc<TestStore>,
    pub dhcp_path: PathBuf,
    pub tmp: TempDir,
}

/// sw1 (seed, 192.168.152.2) with nodes on ports 1..=3:
/// rpi1 .11, rpi2 .12, rpi3 .13; an unknown device on port 4.
pub fn fabric(switches: &FakeSwitches) {
    switches.set_neighbors(
        mac(1),
        vec![
            Neighbor::new(1, mac(0x11)).with_name("rpi1").with_ip(ip(11)),
            Neighbor::new(2, mac(0x12)).with_name("rpi2").with_ip(ip(12)),
            Neighbor::new(3, mac(0x13)).with_name("rpi3").with_ip(ip(13)),
            Neighbor::new(4, mac(0x40)),
        ],
    );
}

pub async fn test_fleet() -> TestFleet {
    let tmp = tempfile::tempdir().unwrap();
    let config = test_config(&tmp);
    let switches = Arc::new(FakeSwitches::default());
    let nodes = Arc::new(FakeNodes::default());
    let images = Arc::new(FakeImages::default());
    let dhcp = Arc::new(FakeDhcp::default());
    let store = Arc::new(TestStore::default());
    fabric(&switches);

    let capabilities = Capabilities {
        switches: switches.clone(),
        nodes: nodes.clone(),
        images: images.clone(),
        dhcp: dhcp.clone(),
        store: store.clone() as Arc<dyn FleetStore>,
    };
    let dispatcher = Dispatcher::new(DispatcherLimits::default());
    let fleet = Fleet::load(&config, capabilities, dispatcher).await.unwrap();

    TestFleet {
        fleet,
        switches,
        nodes,
        images,
        dhcp,
        store,
        dhcp_path: config.paths.dhcp_config.clone(),
        tmp,
    }
}

impl TestFleet {
    /// Scan the fabric and turn rpi1..rpi3 into nodes
    pub async fn discovered(mut self) -> Self {
        self.fleet.rescan_topology().await.unwrap();
        for name in ["rpi1", "rpi2", "rpi3"] {
            self.fleet.classify_device(name, kestrel_common::DeviceKind::Node).await.unwrap();
        }
        self
    }

    pub fn port_of(&self, last: u8) -> PortRef {
        self.fleet
            .registry()
            .upstream_of(mac(last))
            .map(|e| e.upstream_port())
            .unwrap()
    }
}
