//! The orchestration loop
//!
//! A single task owns the [`Fleet`] and runs commands one at a time.
//! Sessions hold a cloneable [`Orchestrator`] handle; every call sends a
//! [`Command`] and waits for its reply.

use crate::confirm::Confirm;
use crate::dhcp_sync::SyncOutcome;
use crate::error::{FleetError, Result};
use crate::event_manager::FleetEvent;
use crate::fleet::{BindingOutcome, Fleet};
use crate::power::{PowerReport, RebootReport};
use crate::registry::{NodeSet, OwnershipReport};
use crate::scanner::ScanReport;
use kestrel_common::{DeviceKind, Mac};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio::task::JoinHandle;
use tracing::{debug, info};

const COMMAND_QUEUE: usize = 64;

type Reply<T> = oneshot::Sender<Result<T>>;

pub enum Command {
    ResolveNodeSet {
        expression: String,
        requester: String,
        reply: Reply<NodeSet>,
    },
    OwnershipCheck {
        expression: String,
        requester: String,
        warn: bool,
        reply: Reply<OwnershipReport>,
    },
    DevelopNodeSet {
        expression: String,
        requester: String,
        reply: Reply<String>,
    },
    StartupUpdate(Reply<ScanReport>),
    Rescan(Reply<ScanReport>),
    SyncDhcp {
        force: bool,
        reply: Reply<SyncOutcome>,
    },
    RecordLease {
        mac: Mac,
        ip: Ipv4Addr,
        vendor_class: Option<String>,
        reply: Reply<()>,
    },
    SetPower {
        expression: String,
        requester: String,
        on: bool,
        warn: bool,
        reply: Reply<PowerReport>,
    },
    Reboot {
        expression: String,
        requester: String,
        hard: bool,
        reply: Reply<RebootReport>,
    },
    HasImage {
        tag: String,
        reply: Reply<bool>,
    },
    SetImageBinding {
        expression: String,
        requester: String,
        tag: String,
        warn: bool,
        confirm: Arc<dyn Confirm>,
        reply: Reply<BindingOutcome>,
    },
    Blink {
        name: String,
        on: bool,
        reply: Reply<bool>,
    },
    UnreadyNodes {
        expression: String,
        requester: String,
        reply: Reply<Vec<String>>,
    },
    GetNodeIp {
        name: String,
        reply: Reply<Option<Ipv4Addr>>,
    },
    GetReachableNodesIp {
        expression: String,
        requester: String,
        reply: Reply<Vec<Ipv4Addr>>,
    },
    GetDeviceIp {
        name: String,
        reply: Reply<Option<Ipv4Addr>>,
    },
    IsDeviceReachable {
        name: String,
        reply: Reply<bool>,
    },
    Rename {
        old_name: String,
        new_name: String,
        reply: Reply<()>,
    },
    Forget {
        name: String,
        reply: Reply<()>,
    },
    Classify {
        name: String,
        kind: DeviceKind,
        reply: Reply<bool>,
    },
    DeviceTree(Reply<String>),
    ShowDevices(Reply<String>),
    ShowNodes {
        requester: String,
        show_all: bool,
        reply: Reply<String>,
    },
    Subscribe(Reply<broadcast::Receiver<FleetEvent>>),
    Shutdown(Reply<()>),
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Command::ResolveNodeSet { .. } => "resolve_node_set",
            Command::OwnershipCheck { .. } => "ownership_check",
            Command::DevelopNodeSet { .. } => "develop_node_set",
            Command::StartupUpdate(_) => "startup_update",
            Command::Rescan(_) => "rescan_topology",
            Command::SyncDhcp { .. } => "sync_dhcp",
            Command::RecordLease { .. } => "record_lease",
            Command::SetPower { .. } => "set_power",
            Command::Reboot { .. } => "reboot_nodes",
            Command::HasImage { .. } => "has_image",
            Command::SetImageBinding { .. } => "set_image_binding",
            Command::Blink { .. } => "blink",
            Command::UnreadyNodes { .. } => "unready_nodes",
            Command::GetNodeIp { .. } => "get_node_ip",
            Command::GetReachableNodesIp { .. } => "get_reachable_nodes_ip",
            Command::GetDeviceIp { .. } => "get_device_ip",
            Command::IsDeviceReachable { .. } => "is_device_reachable",
            Command::Rename { .. } => "rename_device",
            Command::Forget { .. } => "forget_device",
            Command::Classify { .. } => "classify_device",
            Command::DeviceTree(_) => "device_tree",
            Command::ShowDevices(_) => "show_devices",
            Command::ShowNodes { .. } => "show_nodes",
            Command::Subscribe(_) => "subscribe",
            Command::Shutdown(_) => "shutdown",
        }
    }
}

// A dropped receiver means the caller went away; nothing to do about it
fn send<T>(reply: Reply<T>, value: Result<T>) {
    let _ = reply.send(value);
}

/// Run one command. Returns the shutdown reply if the loop must stop.
async fn handle(fleet: &mut Fleet, command: Command) -> Option<Reply<()>> {
    debug!(command = command.name(), "handling command");
    match command {
        Command::ResolveNodeSet {
            expression,
            requester,
            reply,
        } => send(reply, Ok(fleet.resolve_node_set(&expression, &requester))),
        Command::OwnershipCheck {
            expression,
            requester,
            warn,
            reply,
        } => send(reply, fleet.ownership_check(&expression, &requester, warn)),
        Command::DevelopNodeSet {
            expression,
            requester,
            reply,
        } => send(reply, fleet.develop_node_set(&expression, &requester)),
        Command::StartupUpdate(reply) => send(reply, fleet.startup_update().await),
        Command::Rescan(reply) => send(reply, fleet.rescan_topology().await),
        Command::SyncDhcp { force, reply } => send(reply, fleet.sync_dhcp(force).await),
        Command::RecordLease {
            mac,
            ip,
            vendor_class,
            reply,
        } => send(reply, fleet.record_lease(mac, ip, vendor_class.as_deref()).await),
        Command::SetPower {
            expression,
            requester,
            on,
            warn,
            reply,
        } => send(reply, fleet.set_power(&expression, &requester, on, warn).await),
        Command::Reboot {
            expression,
            requester,
            hard,
            reply,
        } => send(reply, fleet.reboot_nodes(&expression, &requester, hard).await),
        Command::HasImage { tag, reply } => send(reply, fleet.has_image(&tag).await),
        Command::SetImageBinding {
            expression,
            requester,
            tag,
            warn,
            confirm,
            reply,
        } => send(
            reply,
            fleet
                .set_image_binding(&expression, &requester, &tag, warn, confirm.as_ref())
                .await,
        ),
        Command::Blink { name, on, reply } => send(reply, fleet.blink(&name, on).await),
        Command::UnreadyNodes {
            expression,
            requester,
            reply,
        } => send(reply, fleet.unready_nodes(&expression, &requester)),
        Command::GetNodeIp { name, reply } => send(reply, fleet.get_node_ip(&name)),
        Command::GetReachableNodesIp {
            expression,
            requester,
            reply,
        } => send(reply, fleet.get_reachable_nodes_ip(&expression, &requester)),
        Command::GetDeviceIp { name, reply } => send(reply, fleet.get_device_ip(&name)),
        Command::IsDeviceReachable { name, reply } => send(reply, fleet.is_device_reachable(&name)),
        Command::Rename {
            old_name,
            new_name,
            reply,
        } => send(reply, fleet.rename_device(&old_name, &new_name).await),
        Command::Forget { name, reply } => send(reply, fleet.forget_device(&name).await),
        Command::Classify { name, kind, reply } => send(reply, fleet.classify_device(&name, kind).await),
        Command::DeviceTree(reply) => send(reply, Ok(fleet.device_tree())),
        Command::ShowDevices(reply) => send(reply, Ok(fleet.show_devices())),
        Command::ShowNodes {
            requester,
            show_all,
            reply,
        } => send(reply, Ok(fleet.show_nodes(&requester, show_all))),
        Command::Subscribe(reply) => send(reply, Ok(fleet.events().subscribe())),
        Command::Shutdown(reply) => return Some(reply),
    }
    None
}

async fn run_loop(mut fleet: Fleet, mut commands: mpsc::Receiver<Command>, mut shutdown: watch::Receiver<()>) {
    info!("fleet orchestrator started");
    let mut pending_reply = None;
    loop {
        tokio::select! {
            biased;
            // A dropped sender also means stop
            _ = shutdown.changed() => {
                info!("shutdown signal received");
                break;
            }
            command = commands.recv() => match command {
                Some(command) => {
                    if let Some(reply) = handle(&mut fleet, command).await {
                        pending_reply = Some(reply);
                        break;
                    }
                }
                None => break,
            },
        }
    }

    // Refuse anything still queued
    commands.close();
    let dispatcher = fleet.dispatcher();
    dispatcher.close();
    dispatcher.drain().await;
    info!("fleet orchestrator stopped");

    if let Some(reply) = pending_reply {
        send(reply, Ok(()));
    }
}

/// Handle on the orchestration loop
#[derive(Clone)]
pub struct Orchestrator {
    tx: mpsc::Sender<Command>,
}

/// Start the loop on its own task
pub fn spawn(fleet: Fleet, shutdown: watch::Receiver<()>) -> (Orchestrator, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
    let task = tokio::spawn(run_loop(fleet, rx, shutdown));
    (Orchestrator { tx }, task)
}

impl Orchestrator {
    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| FleetError::ShuttingDown)?;
        response.await.map_err(|_| FleetError::ShuttingDown)?
    }

    pub async fn resolve_node_set(&self, expression: &str, requester: &str) -> Result<NodeSet> {
        self.request(|reply| Command::ResolveNodeSet {
            expression: expression.to_string(),
            requester: requester.to_string(),
            reply,
        })
        .await
    }

    pub async fn ownership_check(&self, expression: &str, requester: &str, warn: bool) -> Result<OwnershipReport> {
        self.request(|reply| Command::OwnershipCheck {
            expression: expression.to_string(),
            requester: requester.to_string(),
            warn,
            reply,
        })
        .await
    }

    pub async fn develop_node_set(&self, expression: &str, requester: &str) -> Result<String> {
        self.request(|reply| Command::DevelopNodeSet {
            expression: expression.to_string(),
            requester: requester.to_string(),
            reply,
        })
        .await
    }

    pub async fn startup_update(&self) -> Result<ScanReport> {
        self.request(Command::StartupUpdate).await
    }

    pub async fn rescan_topology(&self) -> Result<ScanReport> {
        self.request(Command::Rescan).await
    }

    pub async fn sync_dhcp(&self, force: bool) -> Result<SyncOutcome> {
        self.request(|reply| Command::SyncDhcp { force, reply }).await
    }

    pub async fn record_lease(&self, mac: Mac, ip: Ipv4Addr, vendor_class: Option<&str>) -> Result<()> {
        self.request(|reply| Command::RecordLease {
            mac,
            ip,
            vendor_class: vendor_class.map(str::to_string),
            reply,
        })
        .await
    }

    pub async fn set_power(&self, expression: &str, requester: &str, on: bool, warn: bool) -> Result<PowerReport> {
        self.request(|reply| Command::SetPower {
            expression: expression.to_string(),
            requester: requester.to_string(),
            on,
            warn,
            reply,
        })
        .await
    }

    pub async fn reboot_nodes(&self, expression: &str, requester: &str, hard: bool) -> Result<RebootReport> {
        self.request(|reply| Command::Reboot {
            expression: expression.to_string(),
            requester: requester.to_string(),
            hard,
            reply,
        })
        .await
    }

    pub async fn has_image(&self, tag: &str) -> Result<bool> {
        self.request(|reply| Command::HasImage {
            tag: tag.to_string(),
            reply,
        })
        .await
    }

    pub async fn set_image_binding(
        &self,
        expression: &str,
        requester: &str,
        tag: &str,
        warn_unknown_topology: bool,
        confirm: Arc<dyn Confirm>,
    ) -> Result<BindingOutcome> {
        self.request(|reply| Command::SetImageBinding {
            expression: expression.to_string(),
            requester: requester.to_string(),
            tag: tag.to_string(),
            warn: warn_unknown_topology,
            confirm,
            reply,
        })
        .await
    }

    /// Switch a node's identification LED; `true` if the node acked
    pub async fn blink(&self, name: &str, on: bool) -> Result<bool> {
        self.request(|reply| Command::Blink {
            name: name.to_string(),
            on,
            reply,
        })
        .await
    }

    /// Blink a node for `duration`, then switch the LED off again. The
    /// loop stays free while the LED is on.
    pub async fn blink_for(&self, name: &str, duration: Duration) -> Result<bool> {
        if !self.blink(name, true).await? {
            return Ok(false);
        }
        tokio::time::sleep(duration).await;
        self.blink(name, false).await
    }

    pub async fn unready_nodes(&self, expression: &str, requester: &str) -> Result<Vec<String>> {
        self.request(|reply| Command::UnreadyNodes {
            expression: expression.to_string(),
            requester: requester.to_string(),
            reply,
        })
        .await
    }

    /// Wait until every node of the set is reachable.
    ///
    /// Waits on fleet events between checks, so the loop keeps serving
    /// other callers. Fails with the nodes still down after `timeout`.
    pub async fn wait_for_nodes(&self, expression: &str, requester: &str, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut events = self.subscribe().await?;
        loop {
            let pending = self.unready_nodes(expression, requester).await?;
            if pending.is_empty() {
                return Ok(());
            }
            match tokio::time::timeout_at(deadline, events.recv()).await {
                Err(_) => return Err(FleetError::NodesNotReady(pending)),
                Ok(Err(broadcast::error::RecvError::Closed)) => return Err(FleetError::ShuttingDown),
                // A change or missed events, check again
                Ok(_) => {}
            }
        }
    }

    pub async fn get_node_ip(&self, name: &str) -> Result<Option<Ipv4Addr>> {
        self.request(|reply| Command::GetNodeIp {
            name: name.to_string(),
            reply,
        })
        .await
    }

    pub async fn get_reachable_nodes_ip(&self, expression: &str, requester: &str) -> Result<Vec<Ipv4Addr>> {
        self.request(|reply| Command::GetReachableNodesIp {
            expression: expression.to_string(),
            requester: requester.to_string(),
            reply,
        })
        .await
    }

    pub async fn get_device_ip(&self, name: &str) -> Result<Option<Ipv4Addr>> {
        self.request(|reply| Command::GetDeviceIp {
            name: name.to_string(),
            reply,
        })
        .await
    }

    pub async fn is_device_reachable(&self, name: &str) -> Result<bool> {
        self.request(|reply| Command::IsDeviceReachable {
            name: name.to_string(),
            reply,
        })
        .await
    }

    pub async fn rename_device(&self, old_name: &str, new_name: &str) -> Result<()> {
        self.request(|reply| Command::Rename {
            old_name: old_name.to_string(),
            new_name: new_name.to_string(),
            reply,
        })
        .await
    }

    pub async fn forget_device(&self, name: &str) -> Result<()> {
        self.request(|reply| Command::Forget {
            name: name.to_string(),
            reply,
        })
        .await
    }

    pub async fn classify_device(&self, name: &str, kind: DeviceKind) -> Result<bool> {
        self.request(|reply| Command::Classify {
            name: name.to_string(),
            kind,
            reply,
        })
        .await
    }

    pub async fn device_tree(&self) -> Result<String> {
        self.request(Command::DeviceTree).await
    }

    pub async fn show_devices(&self) -> Result<String> {
        self.request(Command::ShowDevices).await
    }

    pub async fn show_nodes(&self, requester: &str, show_all: bool) -> Result<String> {
        self.request(|reply| Command::ShowNodes {
            requester: requester.to_string(),
            show_all,
            reply,
        })
        .await
    }

    pub async fn subscribe(&self) -> Result<broadcast::Receiver<FleetEvent>> {
        self.request(Command::Subscribe).await
    }

    /// Stop the loop once in-flight blocking work has finished
    pub async fn shutdown(&self) -> Result<()> {
        self.request(Command::Shutdown).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::confirm::AutoConfirm;
    use crate::test_helpers::{ip, mac, test_fleet};

    #[tokio::test]
    async fn test_commands_round_trip() {
        let t = test_fleet().await;
        t.images.add("debian");
        t.nodes.ack(ip(11));
        let (_shutdown_tx, shutdown_rx) = watch::channel(());
        let (orchestrator, task) = spawn(t.fleet, shutdown_rx);

        let report = orchestrator.startup_update().await.unwrap();
        assert_eq!(report.new_devices.len(), 4);
        assert!(orchestrator.classify_device("rpi1", DeviceKind::Node).await.unwrap());
        assert!(orchestrator.has_image("debian").await.unwrap());

        let mut events = orchestrator.subscribe().await.unwrap();
        let outcome = orchestrator
            .set_image_binding("rpi1", "alice", "debian", false, Arc::new(AutoConfirm(true)))
            .await
            .unwrap();
        assert_eq!(outcome.bound, vec!["rpi1"]);
        assert!(matches!(events.recv().await.unwrap(), FleetEvent::DeviceUpdated(_) | FleetEvent::BindingChanged(_)));

        assert_eq!(orchestrator.develop_node_set("my-nodes", "alice").await.unwrap(), "rpi1");
        assert_eq!(orchestrator.get_node_ip("rpi1").await.unwrap(), Some(ip(11)));
        assert!(orchestrator.device_tree().await.unwrap().contains("rpi1 [node]"));

        orchestrator.shutdown().await.unwrap();
        task.await.unwrap();
        assert!(matches!(
            orchestrator.show_devices().await,
            Err(FleetError::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn test_wait_for_nodes() {
        let t = test_fleet().await.discovered().await;
        t.nodes.ack(ip(11));
        let (_shutdown_tx, shutdown_rx) = watch::channel(());
        let (orchestrator, task) = spawn(t.fleet, shutdown_rx);

        orchestrator.wait_for_nodes("all-nodes", "alice", Duration::from_millis(10)).await.unwrap();
        assert!(orchestrator.blink_for("rpi1", Duration::from_millis(10)).await.unwrap());
        assert!(!orchestrator.blink_for("rpi2", Duration::from_millis(10)).await.unwrap());
        assert_eq!(t.nodes.blinks(), vec![(ip(11), true), (ip(11), false), (ip(12), true)]);

        orchestrator.reboot_nodes("rpi1", "alice", false).await.unwrap();
        let err = orchestrator
            .wait_for_nodes("rpi1,rpi2", "alice", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::NodesNotReady(ref names) if names == &["rpi1".to_string()]));

        // The lease of the restarted node ends the wait
        let waiter = orchestrator.clone();
        let wait = tokio::spawn(async move { waiter.wait_for_nodes("rpi1", "alice", Duration::from_secs(5)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        orchestrator.record_lease(mac(0x11), ip(11), Some("kestrel.node")).await.unwrap();
        wait.await.unwrap().unwrap();

        orchestrator.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_callers_are_serialized() {
        let t = test_fleet().await;
        let (_shutdown_tx, shutdown_rx) = watch::channel(());
        let (orchestrator, task) = spawn(t.fleet, shutdown_rx);
        orchestrator.rescan_topology().await.unwrap();

        let mut calls = Vec::new();
        for (i, name) in ["rpi1", "rpi2", "rpi3"].into_iter().enumerate() {
            let handle = orchestrator.clone();
            calls.push(tokio::spawn(async move {
                handle.classify_device(name, DeviceKind::Node).await.unwrap();
                handle.rename_device(name, &format!("n{}", i)).await
            }));
        }
        for call in calls {
            call.await.unwrap().unwrap();
        }

        let set = orchestrator.resolve_node_set("all-nodes", "alice").await.unwrap();
        assert_eq!(set.nodes.len(), 3);
        assert_eq!(orchestrator.develop_node_set("all-nodes", "alice").await.unwrap(), "n0,n1,n2");

        orchestrator.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_signal_stops_loop() {
        let t = test_fleet().await;
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let (orchestrator, task) = spawn(t.fleet, shutdown_rx);
        assert!(orchestrator.show_nodes("alice", false).await.is_ok());

        shutdown_tx.send(()).unwrap();
        task.await.unwrap();
        assert!(matches!(
            orchestrator.rescan_topology().await,
            Err(FleetError::ShuttingDown)
        ));
    }
}
