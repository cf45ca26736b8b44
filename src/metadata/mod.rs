//! Table metadata: the authoritative partition map and the quorum protocol
//! that advances it.
//!
//! Every table has one metadata file replicated across its metadata servers.
//! The file is immutable per transaction id; a [`MetadataOperation`]
//! describes the transition from one txnid to the next and is committed by
//! the [`MetadataCoordinator`] only when a majority of metadata servers
//! applied it and all successful applications agree on the resulting file
//! checksum.

pub mod coordinator;
pub mod file;
pub mod messages;
pub mod operation;
pub mod transport;

pub use coordinator::MetadataCoordinator;
pub use file::{MetadataFile, PartitionEntry};
pub use messages::{
    MetadataOperationResult, PartitionDiscoveryRequest, PartitionDiscoveryResponse,
};
pub use operation::{
    CreatePartitionOperation, FinalizeJoinOperation, FinalizeSplitOperation,
    JoinServersOperation, MetadataOperation, MetadataOperationData, MetadataOperationKind,
    RemoveDeadServersOperation, SplitPartitionOperation,
};
pub use transport::{HttpMetadataTransport, MetadataTransport};
