//! Storage backends for Kestrel
//!
//! This module provides the `FleetStore` trait and two implementations:
//! - `MemoryStore` - In-memory storage for testing
//! - `RedbStore` - Local embedded database using ReDB
//!
//! The registry is rebuilt from the store at startup; afterwards the store
//! only receives writes, one [`Batch`] per flush.

mod memory;
mod redb_store;

pub use memory::MemoryStore;
pub use redb_store::RedbStore;

use async_trait::async_trait;
use kestrel_common::{Device, ImageBinding, Mac, TopologyEdge};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Errors from storage operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Everything needed to rebuild the registry
#[derive(Debug, Default, Clone)]
pub struct Snapshot {
    pub devices: Vec<Device>,
    pub edges: Vec<TopologyEdge>,
    pub bindings: Vec<ImageBinding>,
}

/// Changes written together: either all of them land or none does.
#[derive(Debug, Default, Clone)]
pub struct Batch {
    /// Inserted or updated
    pub devices: Vec<Device>,
    /// Deleted, together with their bindings
    pub removed: Vec<Mac>,
    pub bindings: Vec<ImageBinding>,
    pub unbound: Vec<Mac>,
    /// New full edge set, when the topology changed
    pub edges: Option<Vec<TopologyEdge>>,
}

impl Batch {
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
            && self.removed.is_empty()
            && self.bindings.is_empty()
            && self.unbound.is_empty()
            && self.edges.is_none()
    }
}

/// Storage backend trait for Kestrel
///
/// The trait is object-safe and can be used with `Arc<dyn FleetStore>`.
#[async_trait]
pub trait FleetStore: Send + Sync {
    async fn get_device(&self, mac: Mac) -> Result<Option<Device>>;

    async fn list_devices(&self) -> Result<Vec<Device>>;

    async fn list_edges(&self) -> Result<Vec<TopologyEdge>>;

    async fn list_bindings(&self) -> Result<Vec<ImageBinding>>;

    /// Write a batch in a single transaction
    async fn apply(&self, batch: Batch) -> Result<()>;

    /// Load everything at once
    async fn snapshot(&self) -> Result<Snapshot> {
        Ok(Snapshot {
            devices: self.list_devices().await?,
            edges: self.list_edges().await?,
            bindings: self.list_bindings().await?,
        })
    }
}

/// Storage configuration
#[derive(Debug, Clone, Default)]
pub enum StoreConfig {
    /// In-memory storage (for testing)
    #[default]
    Memory,

    /// ReDB local database
    Redb { path: PathBuf },
}

/// Create a store from configuration
pub fn create_store(config: &StoreConfig) -> Result<Arc<dyn FleetStore>> {
    match config {
        StoreConfig::Memory => Ok(Arc::new(MemoryStore::new())),
        StoreConfig::Redb { path } => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::Database(format!("failed to create {}: {}", parent.display(), e))
                })?;
            }
            let store = RedbStore::open(path)?;
            Ok(Arc::new(store))
        }
    }
}
