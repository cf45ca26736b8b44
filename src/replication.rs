//! Replication targets and per-partition replication cursors.

use serde::{Deserialize, Serialize};

use crate::ids::Sha1Hash;
use crate::keys::KeyRange;

/// One destination a partition replicates toward, as assigned by the
/// metadata layer.
///
/// During a split the parent partition's targets include the two child
/// placements with `is_joining = true` until the split finalizes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationTarget {
    pub server_id: String,
    pub placement_id: Sha1Hash,
    pub partition_id: Sha1Hash,
    pub keyrange: KeyRange,
    pub is_joining: bool,
}

/// Replication progress for one partition, maintained by the replication
/// collaborator and persisted inside the partition snapshot.
///
/// The state is tagged with the uuid of the partition generation it was
/// recorded against. A partition that is dropped and recreated under the
/// same id gets a fresh uuid, which invalidates any cursor recorded against
/// the previous generation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationState {
    pub uuid: Sha1Hash,
    pub targets: Vec<ReplicaCursor>,
}

impl ReplicationState {
    pub fn for_uuid(uuid: Sha1Hash) -> Self {
        Self {
            uuid,
            targets: Vec::new(),
        }
    }
}

/// Position of one replication target within the partition's sequence order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaCursor {
    /// Placement this cursor belongs to.
    pub placement_id: Sha1Hash,
    /// Server the placement lives on.
    pub server_id: String,
    /// Highest `lsm_sequence` confirmed replicated to the target.
    pub replicated_offset: u64,
}
