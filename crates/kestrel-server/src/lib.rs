//! Kestrel fleet orchestration core
//!
//! Owns the device and topology registry of a fleet of network-booted
//! nodes, discovers the switch topology over LLDP, keeps the DHCP daemon's
//! reservations in line with it, drives node reboots (soft, then PoE hard
//! reboot) and binds boot images to nodes.
//!
//! All fleet state lives in a single orchestration task ([`orchestrator`]).
//! Anything that blocks (switch queries, node agents, the DHCP reload, the
//! image backend) runs on the [`dispatcher`].

pub mod agent;
pub mod config;
pub mod confirm;
pub mod dhcp_sync;
pub mod dispatcher;
pub mod error;
pub mod event_manager;
pub mod fleet;
pub mod images;
pub mod orchestrator;
pub mod poe;
pub mod power;
pub mod registry;
pub mod scanner;
pub mod store;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use config::{ServerConfig, DEFAULT_CONFIG_PATH};
pub use error::{FleetError, Result};
pub use fleet::{Capabilities, Fleet};
pub use orchestrator::Orchestrator;

use crate::agent::TcpNodeAgent;
use crate::dispatcher::{Dispatcher, DispatcherLimits};
use crate::images::DirImageStore;
use crate::store::{create_store, StoreConfig};
use anyhow::Context;
use kestrel_snmp::NetSnmpAgent;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

/// Run the server until `shutdown` fires.
///
/// Loads the persisted fleet, refreshes DHCP and the topology, then serves
/// commands. A failed startup refresh stops the server.
pub async fn run(config: ServerConfig, shutdown: watch::Receiver<()>) -> anyhow::Result<()> {
    let store = create_store(&StoreConfig::Redb {
        path: config.paths.state_db.clone(),
    })
    .with_context(|| format!("Failed to open state database {}", config.paths.state_db.display()))?;

    let capabilities = Capabilities {
        switches: Arc::new(NetSnmpAgent::new(config.snmp.clone())),
        nodes: Arc::new(TcpNodeAgent::new(config.power.agent_port)),
        images: Arc::new(DirImageStore::new(&config.paths.images_root)),
        dhcp: Arc::new(config.dhcp.reload.clone()),
        store,
    };
    let dispatcher = Dispatcher::new(DispatcherLimits::from(&config.dispatcher));
    let fleet = Fleet::load(&config, capabilities, dispatcher)
        .await
        .context("Failed to load fleet state")?;

    let (orchestrator, task) = orchestrator::spawn(fleet, shutdown);

    match orchestrator.startup_update().await {
        Ok(report) => info!(
            devices = report.devices,
            edges = report.edges,
            failed_switches = report.failed_switches.len(),
            "startup update complete"
        ),
        Err(FleetError::ShuttingDown) => {}
        Err(e) => {
            error!(error = %e, "startup update failed");
            let _ = orchestrator.shutdown().await;
            let _ = task.await;
            return Err(e).context("Startup update failed");
        }
    }

    info!("kestrel server ready");
    task.await.context("Orchestration task failed")?;
    info!("shutdown complete");
    Ok(())
}
