//! Metadata operations: transitions between metadata transactions.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::ids::Sha1Hash;

/// The six operation kinds. The wire form carries this tag next to the
/// payload so that decoding can reject a mismatched envelope.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetadataOperationKind {
    RemoveDeadServers,
    SplitPartition,
    FinalizeSplit,
    JoinServers,
    FinalizeJoin,
    CreatePartition,
}

/// Drop placements on servers that left the cluster.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveDeadServersOperation {
    pub server_ids: Vec<String>,
}

/// Split one partition into two children at an encoded key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitPartitionOperation {
    pub partition_id: Sha1Hash,
    pub split_point: Vec<u8>,
    pub split_servers_low: Vec<String>,
    pub split_servers_high: Vec<String>,
    pub split_partition_id_low: Sha1Hash,
    pub split_partition_id_high: Sha1Hash,
    pub placement_id: Sha1Hash,
    pub finalize_immediately: bool,
}

/// Retire a split parent once its children serve.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizeSplitOperation {
    pub partition_id: Sha1Hash,
}

/// Add joining replicas to a partition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinServersOperation {
    pub partition_id: Sha1Hash,
    pub server_ids: Vec<String>,
    pub placement_id: Sha1Hash,
}

/// Promote one joining replica to a full member.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizeJoinOperation {
    pub partition_id: Sha1Hash,
    pub server_id: String,
    pub placement_id: Sha1Hash,
}

/// Add a partition to the table's map.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatePartitionOperation {
    pub partition_id: Sha1Hash,
    pub keyrange_begin: Vec<u8>,
    pub keyrange_end: Vec<u8>,
    pub servers: Vec<String>,
    pub placement_id: Sha1Hash,
}

/// Operation payload, tagged by kind.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MetadataOperationData {
    RemoveDeadServers(RemoveDeadServersOperation),
    SplitPartition(SplitPartitionOperation),
    FinalizeSplit(FinalizeSplitOperation),
    JoinServers(JoinServersOperation),
    FinalizeJoin(FinalizeJoinOperation),
    CreatePartition(CreatePartitionOperation),
}

impl MetadataOperationData {
    pub fn kind(&self) -> MetadataOperationKind {
        match self {
            Self::RemoveDeadServers(_) => MetadataOperationKind::RemoveDeadServers,
            Self::SplitPartition(_) => MetadataOperationKind::SplitPartition,
            Self::FinalizeSplit(_) => MetadataOperationKind::FinalizeSplit,
            Self::JoinServers(_) => MetadataOperationKind::JoinServers,
            Self::FinalizeJoin(_) => MetadataOperationKind::FinalizeJoin,
            Self::CreatePartition(_) => MetadataOperationKind::CreatePartition,
        }
    }

    fn encode_payload(&self) -> Result<Vec<u8>> {
        let raw = match self {
            Self::RemoveDeadServers(op) => bincode::serialize(op)?,
            Self::SplitPartition(op) => bincode::serialize(op)?,
            Self::FinalizeSplit(op) => bincode::serialize(op)?,
            Self::JoinServers(op) => bincode::serialize(op)?,
            Self::FinalizeJoin(op) => bincode::serialize(op)?,
            Self::CreatePartition(op) => bincode::serialize(op)?,
        };
        Ok(raw)
    }

    fn decode_payload(kind: MetadataOperationKind, raw: &[u8]) -> Result<Self> {
        let data = match kind {
            MetadataOperationKind::RemoveDeadServers => {
                Self::RemoveDeadServers(bincode::deserialize(raw)?)
            }
            MetadataOperationKind::SplitPartition => {
                Self::SplitPartition(bincode::deserialize(raw)?)
            }
            MetadataOperationKind::FinalizeSplit => {
                Self::FinalizeSplit(bincode::deserialize(raw)?)
            }
            MetadataOperationKind::JoinServers => Self::JoinServers(bincode::deserialize(raw)?),
            MetadataOperationKind::FinalizeJoin => Self::FinalizeJoin(bincode::deserialize(raw)?),
            MetadataOperationKind::CreatePartition => {
                Self::CreatePartition(bincode::deserialize(raw)?)
            }
        };
        Ok(data)
    }
}

/// A metadata operation envelope.
///
/// `input_txnid` is the transaction the operation was prepared against; the
/// coordinator rejects the operation when the table has moved past it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetadataOperation {
    pub namespace: String,
    pub table_id: String,
    pub input_txnid: Sha1Hash,
    pub output_txnid: Sha1Hash,
    pub data: MetadataOperationData,
}

/// Wire form: the payload is an opaque byte string next to its kind tag.
#[derive(Serialize, Deserialize)]
struct WireOperation {
    namespace: String,
    table_id: String,
    input_txnid: Sha1Hash,
    output_txnid: Sha1Hash,
    optype: MetadataOperationKind,
    opdata: Vec<u8>,
}

impl MetadataOperation {
    pub fn kind(&self) -> MetadataOperationKind {
        self.data.kind()
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let wire = WireOperation {
            namespace: self.namespace.clone(),
            table_id: self.table_id.clone(),
            input_txnid: self.input_txnid,
            output_txnid: self.output_txnid,
            optype: self.data.kind(),
            opdata: self.data.encode_payload()?,
        };
        Ok(bincode::serialize(&wire)?)
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        let wire: WireOperation = bincode::deserialize(raw)?;
        let data = MetadataOperationData::decode_payload(wire.optype, &wire.opdata)?;
        // The payload must parse *exactly* as the tagged variant; a shorter
        // variant can otherwise parse a prefix of a longer payload.
        if data.encode_payload()? != wire.opdata {
            return Err(Error::InvalidData(format!(
                "operation payload does not match optype {:?}",
                wire.optype
            )));
        }
        Ok(Self {
            namespace: wire.namespace,
            table_id: wire.table_id,
            input_txnid: wire.input_txnid,
            output_txnid: wire.output_txnid,
            data,
        })
    }
}
