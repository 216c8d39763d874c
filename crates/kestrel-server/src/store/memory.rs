//! In-memory storage backend
//!
//! Simple storage for testing and development.

use super::{Batch, FleetStore, Result, StoreError};
use async_trait::async_trait;
use kestrel_common::{Device, ImageBinding, Mac, PortRef, TopologyEdge};
use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// In-memory storage backend
#[derive(Default)]
pub struct MemoryStore {
    devices: RwLock<BTreeMap<Mac, Device>>,
    edges: RwLock<BTreeMap<PortRef, TopologyEdge>>,
    bindings: RwLock<BTreeMap<Mac, ImageBinding>>,
}

impl MemoryStore {
    /// Create a new empty memory store
    pub fn new() -> Self {
        Self::default()
    }
}

fn read<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>> {
    lock.read()
        .map_err(|e| StoreError::Database(format!("lock poisoned: {}", e)))
}

fn write<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>> {
    lock.write()
        .map_err(|e| StoreError::Database(format!("lock poisoned: {}", e)))
}

#[async_trait]
impl FleetStore for MemoryStore {
    async fn get_device(&self, mac: Mac) -> Result<Option<Device>> {
        Ok(read(&self.devices)?.get(&mac).cloned())
    }

    async fn list_devices(&self) -> Result<Vec<Device>> {
        let mut devices: Vec<Device> = read(&self.devices)?.values().cloned().collect();
        devices.sort_by_key(|d| d.id);
        Ok(devices)
    }

    async fn list_edges(&self) -> Result<Vec<TopologyEdge>> {
        Ok(read(&self.edges)?.values().cloned().collect())
    }

    async fn list_bindings(&self) -> Result<Vec<ImageBinding>> {
        Ok(read(&self.bindings)?.values().cloned().collect())
    }

    async fn apply(&self, batch: Batch) -> Result<()> {
        // All locks first, so a failure leaves nothing half written
        let mut devices = write(&self.devices)?;
        let mut edges = write(&self.edges)?;
        let mut bindings = write(&self.bindings)?;

        for device in batch.devices {
            devices.insert(device.mac, device);
        }
        for mac in batch.removed {
            devices.remove(&mac);
            bindings.remove(&mac);
        }
        for binding in batch.bindings {
            bindings.insert(binding.mac, binding);
        }
        for mac in batch.unbound {
            bindings.remove(&mac);
        }
        if let Some(new_edges) = batch.edges {
            edges.clear();
            for edge in new_edges {
                edges.insert(edge.upstream_port(), edge);
            }
        }
        Ok(())
    }
}
