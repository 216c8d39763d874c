//! Keeps the DHCP daemon's configuration in line with the registry.
//!
//! Every device with a known address inside the managed subnet gets a
//! fixed reservation. The rendered text is compared with what was last
//! applied; the file is only rewritten and the daemon only reloaded when it
//! differs, or when forced.

use crate::dispatcher::Dispatcher;
use crate::error::{FleetError, Result};
use crate::registry::Registry;
use kestrel_dhcp::{render, write_atomic, DhcpConfig, DhcpService, Reservation};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// File written and daemon reloaded
    Applied { hosts: usize },
    /// Nothing changed since the last successful apply
    Unchanged,
}

pub struct DhcpSynchronizer {
    config: DhcpConfig,
    path: PathBuf,
    service: Arc<dyn DhcpService>,
    last_applied: Option<String>,
}

impl DhcpSynchronizer {
    pub fn new(config: DhcpConfig, path: impl Into<PathBuf>, service: Arc<dyn DhcpService>) -> Self {
        Self {
            config,
            path: path.into(),
            service,
            last_applied: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// One reservation per addressed device, in MAC order.
    ///
    /// Addresses outside the subnet and second claims on an address are
    /// left out with a warning.
    pub fn reservations(&self, registry: &Registry) -> Vec<Reservation> {
        let mut devices: Vec<_> = registry
            .devices()
            .filter_map(|d| d.ip.map(|ip| (d.mac, ip, d.name.as_str())))
            .collect();
        devices.sort_by_key(|(mac, _, _)| *mac);

        let mut claimed: HashMap<_, &str> = HashMap::new();
        let mut out = Vec::with_capacity(devices.len());
        for (mac, ip, name) in devices {
            if !self.config.contains(ip) {
                warn!(device = name, ip = %ip, "address outside the managed subnet, no reservation");
                continue;
            }
            if let Some(first) = claimed.get(&ip) {
                warn!(device = name, ip = %ip, holder = *first, "address already reserved, skipping");
                continue;
            }
            claimed.insert(ip, name);
            out.push(Reservation::new(mac, ip).with_hostname(name));
        }
        out
    }

    pub fn render(&self, registry: &Registry) -> Result<String> {
        Ok(render(&self.config, &self.reservations(registry))?)
    }

    pub async fn sync(&mut self, registry: &Registry, dispatcher: &Dispatcher, force: bool) -> Result<SyncOutcome> {
        let reservations = self.reservations(registry);
        let hosts = reservations.len();
        let text = render(&self.config, &reservations)?;

        if !force && self.last_applied.as_deref() == Some(text.as_str()) {
            debug!("DHCP configuration unchanged");
            return Ok(SyncOutcome::Unchanged);
        }

        let path = self.path.clone();
        let service = self.service.clone();
        let contents = text.clone();
        let applied = dispatcher
            .submit(None, move || {
                write_atomic(&path, &contents)?;
                service.reload()
            })
            .wait()
            .await;

        match applied {
            Ok(Ok(())) => {
                info!(hosts, path = %self.path.display(), "DHCP configuration applied");
                self.last_applied = Some(text);
                Ok(SyncOutcome::Applied { hosts })
            }
            Ok(Err(e)) => {
                // Retry on the next sync, whatever the registry looks like
                self.last_applied = None;
                Err(e.into())
            }
            Err(e) => {
                self.last_applied = None;
                Err(FleetError::Task(e))
            }
        }
    }
}
