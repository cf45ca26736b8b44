//! Cluster configuration directory.
//!
//! The directory is the storage core's window onto cluster state: server
//! addresses and health, per-table metadata transaction cursors, and the
//! cluster-wide replication factor. In a full deployment it is fed by the
//! membership layer; [`MemoryDirectory`] is the in-process implementation
//! used for embedding and tests.

use std::collections::BTreeMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::ids::Sha1Hash;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerStatus {
    Up,
    Down,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub server_id: String,
    /// `host:port` of the server's RPC listener; empty while offline.
    pub addr: String,
    pub status: ServerStatus,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub replication_factor: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            replication_factor: 3,
        }
    }
}

/// Mutable per-table state tracked in the directory.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableConfig {
    pub namespace: String,
    pub table_id: String,
    /// Transaction id of the table's current metadata file.
    pub metadata_txnid: Sha1Hash,
    /// Monotone counter advanced by every committed metadata operation.
    pub metadata_txnseq: u64,
    /// Servers that hold replicas of the table's metadata file.
    pub metadata_servers: Vec<String>,
    /// Per-table override of the partition split threshold, in bytes.
    pub partition_split_threshold_override: Option<u64>,
    /// Per-table override of the urgent-commit arena record count.
    pub max_arena_records_override: Option<usize>,
    /// Ask splits to finalize without waiting for replication to the child
    /// partitions.
    pub enable_async_split: bool,
}

impl TableConfig {
    pub fn new(namespace: impl Into<String>, table_id: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            table_id: table_id.into(),
            metadata_txnid: Sha1Hash::ZERO,
            metadata_txnseq: 0,
            metadata_servers: Vec::new(),
            partition_split_threshold_override: None,
            max_arena_records_override: None,
            enable_async_split: false,
        }
    }
}

/// Read/update access to cluster configuration.
pub trait ConfigDirectory: Send + Sync {
    fn get_server_config(&self, server_id: &str) -> Result<ServerConfig>;
    fn list_servers(&self) -> Result<Vec<ServerConfig>>;
    fn get_table_config(&self, namespace: &str, table_id: &str) -> Result<TableConfig>;
    fn update_table_config(&self, config: TableConfig) -> Result<()>;
    fn get_cluster_config(&self) -> ClusterConfig;
    /// Id of the local server.
    fn get_server_id(&self) -> String;
}

/// In-memory directory implementation.
pub struct MemoryDirectory {
    server_id: String,
    cluster: ClusterConfig,
    servers: RwLock<BTreeMap<String, ServerConfig>>,
    tables: RwLock<BTreeMap<(String, String), TableConfig>>,
}

impl MemoryDirectory {
    pub fn new(server_id: impl Into<String>, cluster: ClusterConfig) -> Self {
        Self {
            server_id: server_id.into(),
            cluster,
            servers: RwLock::new(BTreeMap::new()),
            tables: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn put_server(&self, config: ServerConfig) {
        self.servers
            .write()
            .unwrap()
            .insert(config.server_id.clone(), config);
    }

    pub fn put_table(&self, config: TableConfig) {
        self.tables.write().unwrap().insert(
            (config.namespace.clone(), config.table_id.clone()),
            config,
        );
    }
}

impl ConfigDirectory for MemoryDirectory {
    fn get_server_config(&self, server_id: &str) -> Result<ServerConfig> {
        self.servers
            .read()
            .unwrap()
            .get(server_id)
            .cloned()
            .ok_or_else(|| Error::Runtime(format!("unknown server: {server_id}")))
    }

    fn list_servers(&self) -> Result<Vec<ServerConfig>> {
        Ok(self.servers.read().unwrap().values().cloned().collect())
    }

    fn get_table_config(&self, namespace: &str, table_id: &str) -> Result<TableConfig> {
        self.tables
            .read()
            .unwrap()
            .get(&(namespace.to_string(), table_id.to_string()))
            .cloned()
            .ok_or_else(|| Error::Runtime(format!("unknown table: {namespace}/{table_id}")))
    }

    fn update_table_config(&self, config: TableConfig) -> Result<()> {
        self.tables.write().unwrap().insert(
            (config.namespace.clone(), config.table_id.clone()),
            config,
        );
        Ok(())
    }

    fn get_cluster_config(&self) -> ClusterConfig {
        self.cluster
    }

    fn get_server_id(&self) -> String {
        self.server_id.clone()
    }
}
