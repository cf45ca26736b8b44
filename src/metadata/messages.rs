//! Request/response bodies exchanged with metadata servers.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::ids::Sha1Hash;
use crate::partition::snapshot::LifecycleState;
use crate::replication::ReplicationTarget;

/// Returned by a metadata server that applied an operation. The checksum is
/// over the metadata file the server would commit; the coordinator refuses
/// to commit when servers disagree.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataOperationResult {
    pub metadata_file_checksum: u64,
}

impl MetadataOperationResult {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(raw)?)
    }
}

/// Asks the metadata servers for a partition's current assignment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionDiscoveryRequest {
    pub namespace: String,
    pub table_id: String,
    pub partition_id: Sha1Hash,
    /// The caller's view of the table's metadata txnseq; servers behind it
    /// cannot answer authoritatively.
    pub min_txnseq: u64,
    pub lsm_sequence: u64,
    pub keyrange_begin: Vec<u8>,
    /// Filled in by the coordinator with the local server id.
    pub requester_id: String,
}

impl PartitionDiscoveryRequest {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(raw)?)
    }
}

/// A partition's assignment and lifecycle, as answered by a metadata server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionDiscoveryResponse {
    pub code: LifecycleState,
    pub txnid: Sha1Hash,
    pub txnseq: u64,
    pub replication_targets: Vec<ReplicationTarget>,
    pub keyrange_begin: Vec<u8>,
    pub keyrange_end: Vec<u8>,
    pub is_splitting: bool,
    pub split_partition_ids: Vec<Sha1Hash>,
}

impl PartitionDiscoveryResponse {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(raw)?)
    }
}
