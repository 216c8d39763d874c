//! ReDB storage backend
//!
//! Local embedded database for standalone deployments. Values are JSON
//! documents keyed by MAC address (devices, bindings) or upstream port
//! (edges).

use super::{Batch, FleetStore, Result, StoreError};
use async_trait::async_trait;
use kestrel_common::{Device, ImageBinding, Mac, TopologyEdge};
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::Arc;

// Table definitions
const DEVICES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("devices");
const EDGES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("edges");
const BINDINGS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("bindings");

fn db_err<E: std::fmt::Display>(context: &'static str) -> impl Fn(E) -> StoreError {
    move |e| StoreError::Database(format!("{}: {}", context, e))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value)
        .map_err(|e| StoreError::Serialization(format!("failed to serialize: {}", e)))
}

fn from_json<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes)
        .map_err(|e| StoreError::Serialization(format!("failed to deserialize: {}", e)))
}

/// Edge keys sort like `PortRef`
fn edge_key(edge: &TopologyEdge) -> String {
    format!("{}#{:010}", edge.device_a, edge.port_a)
}

/// ReDB storage backend
pub struct RedbStore {
    db: Arc<Database>,
}

impl RedbStore {
    /// Open or create a ReDB database at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = Database::create(path.as_ref())
            .map_err(|e| StoreError::Database(format!("failed to open database: {}", e)))?;

        // Create tables if they don't exist
        let write_txn = db.begin_write().map_err(db_err("failed to begin transaction"))?;
        for table in [DEVICES_TABLE, EDGES_TABLE, BINDINGS_TABLE] {
            write_txn
                .open_table(table)
                .map_err(db_err("failed to create table"))?;
        }
        write_txn
            .commit()
            .map_err(db_err("failed to commit"))?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Run database work on the blocking pool; commits fsync
    async fn blocking<T, F>(&self, work: F) -> Result<T>
    where
        F: FnOnce(&Database) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || work(db.as_ref()))
            .await
            .map_err(|e| StoreError::Database(format!("task join error: {}", e)))?
    }

    async fn list<T>(&self, definition: TableDefinition<'static, &'static str, &'static [u8]>) -> Result<Vec<T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        self.blocking(move |db| {
            let read_txn = db.begin_read().map_err(db_err("failed to begin read"))?;
            let table = read_txn
                .open_table(definition)
                .map_err(db_err("failed to open table"))?;

            let mut results = Vec::new();
            for entry in table.iter().map_err(db_err("iter failed"))? {
                let (_, value) = entry.map_err(db_err("entry read failed"))?;
                results.push(from_json(value.value())?);
            }
            Ok(results)
        })
        .await
    }
}

/// Serialize everything before the transaction starts
struct EncodedBatch {
    devices: Vec<(String, Vec<u8>)>,
    removed: Vec<String>,
    bindings: Vec<(String, Vec<u8>)>,
    unbound: Vec<String>,
    edges: Option<Vec<(String, Vec<u8>)>>,
}

impl EncodedBatch {
    fn new(batch: &Batch) -> Result<Self> {
        let devices = batch
            .devices
            .iter()
            .map(|d| Ok((d.mac.to_string(), to_json(d)?)))
            .collect::<Result<_>>()?;
        let bindings = batch
            .bindings
            .iter()
            .map(|b| Ok((b.mac.to_string(), to_json(b)?)))
            .collect::<Result<_>>()?;
        let edges = match &batch.edges {
            Some(edges) => Some(
                edges
                    .iter()
                    .map(|e| Ok((edge_key(e), to_json(e)?)))
                    .collect::<Result<_>>()?,
            ),
            None => None,
        };
        Ok(Self {
            devices,
            removed: batch.removed.iter().map(Mac::to_string).collect(),
            bindings,
            unbound: batch.unbound.iter().map(Mac::to_string).collect(),
            edges,
        })
    }

    fn write(self, db: &Database) -> Result<()> {
        let write_txn = db.begin_write().map_err(db_err("failed to begin write"))?;
        {
            let mut devices = write_txn
                .open_table(DEVICES_TABLE)
                .map_err(db_err("failed to open table"))?;
            let mut bindings = write_txn
                .open_table(BINDINGS_TABLE)
                .map_err(db_err("failed to open table"))?;
            let mut edges = write_txn
                .open_table(EDGES_TABLE)
                .map_err(db_err("failed to open table"))?;

            for (key, bytes) in &self.devices {
                devices
                    .insert(key.as_str(), bytes.as_slice())
                    .map_err(db_err("insert failed"))?;
            }
            for key in &self.removed {
                devices.remove(key.as_str()).map_err(db_err("remove failed"))?;
                bindings.remove(key.as_str()).map_err(db_err("remove failed"))?;
            }
            for (key, bytes) in &self.bindings {
                bindings
                    .insert(key.as_str(), bytes.as_slice())
                    .map_err(db_err("insert failed"))?;
            }
            for key in &self.unbound {
                bindings.remove(key.as_str()).map_err(db_err("remove failed"))?;
            }
            if let Some(new_edges) = &self.edges {
                edges.retain(|_, _| false).map_err(db_err("clear failed"))?;
                for (key, bytes) in new_edges {
                    edges
                        .insert(key.as_str(), bytes.as_slice())
                        .map_err(db_err("insert failed"))?;
                }
            }
        }
        // Dropping an uncommitted transaction aborts it
        write_txn.commit().map_err(db_err("commit failed"))
    }
}

#[async_trait]
impl FleetStore for RedbStore {
    async fn get_device(&self, mac: Mac) -> Result<Option<Device>> {
        self.blocking(move |db| {
            let read_txn = db.begin_read().map_err(db_err("failed to begin read"))?;
            let table = read_txn
                .open_table(DEVICES_TABLE)
                .map_err(db_err("failed to open table"))?;

            let key = mac.to_string();
            match table.get(key.as_str()) {
                Ok(Some(value)) => {
                    let device: Device = from_json(value.value())?;
                    Ok(Some(device.normalized()))
                }
                Ok(None) => Ok(None),
                Err(e) => Err(db_err("get failed")(e)),
            }
        })
        .await
    }

    async fn list_devices(&self) -> Result<Vec<Device>> {
        let mut devices: Vec<Device> = self
            .list::<Device>(DEVICES_TABLE)
            .await?
            .into_iter()
            .map(Device::normalized)
            .collect();
        devices.sort_by_key(|d| d.id);
        Ok(devices)
    }

    async fn list_edges(&self) -> Result<Vec<TopologyEdge>> {
        self.list(EDGES_TABLE).await
    }

    async fn list_bindings(&self) -> Result<Vec<ImageBinding>> {
        self.list(BINDINGS_TABLE).await
    }

    async fn apply(&self, batch: Batch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let encoded = EncodedBatch::new(&batch)?;
        self.blocking(move |db| encoded.write(db)).await
    }
}
