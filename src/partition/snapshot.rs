//! Immutable partition snapshots and the publication cell.
//!
//! A snapshot is the complete value-typed state of a partition: its segment
//! list, arenas, keyrange, lifecycle, and metadata cursor. Mutators never
//! modify a published snapshot; they clone it, edit the clone, persist the
//! durable projection, and publish through the [`SnapshotCell`]. Readers get
//! a stable `Arc` that stays internally consistent for as long as they hold
//! it.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use byteorder::{BigEndian, ByteOrder};
use crc::{Crc, CRC_32_ISCSI};
use serde::{Deserialize, Serialize};

use crate::arena::{sync_dir, PartitionArena};
use crate::error::{Error, Result};
use crate::file_tracker::FileGuard;
use crate::ids::Sha1Hash;
use crate::keys::KeyRange;
use crate::replication::{ReplicationState, ReplicationTarget};
use crate::segment::Segment;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Name of the durable snapshot file inside the partition directory.
pub const SNAPSHOT_FILE: &str = "snapshot.meta";

/// Position of a partition in its lifecycle state machine.
///
/// Transitions are driven exclusively by discovery responses applied through
/// the writer; local code never moves a partition between states on its own.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleState {
    /// Created from discovery; local data not yet complete.
    Load,
    /// Serving reads and writes.
    Serve,
    /// Reassigned away; stops accepting writes.
    Unload,
    /// Reassigned away and local data should be removed.
    UnloadAndDelete,
}

/// Immutable state of one partition.
#[derive(Clone, Debug)]
pub struct PartitionSnapshot {
    pub partition_id: Sha1Hash,
    pub namespace: String,
    pub table_id: String,
    pub keyrange: KeyRange,
    pub lsm_sequence: u64,
    pub segments: Vec<Segment>,
    pub head_arena: Arc<PartitionArena>,
    pub compacting_arena: Option<Arc<PartitionArena>>,
    pub lifecycle: LifecycleState,
    pub is_splitting: bool,
    pub split_partition_ids: Vec<Sha1Hash>,
    pub last_metadata_txnid: Sha1Hash,
    pub last_metadata_txnseq: u64,
    pub replication_targets: Vec<ReplicationTarget>,
    pub has_joining_servers: bool,
    pub replication_state: ReplicationState,
    /// Identity of this partition *generation*; regenerated when the
    /// partition is recreated, which invalidates stale replication cursors.
    pub uuid: Sha1Hash,
    pub base_path: PathBuf,
    /// Live file-tracker references for every segment file this snapshot
    /// can read. Not persisted; the writer rebuilds them on open.
    pub file_guards: Vec<Arc<FileGuard>>,
}

impl PartitionSnapshot {
    /// A fresh snapshot for a newly discovered partition.
    pub fn create(
        partition_id: Sha1Hash,
        namespace: &str,
        table_id: &str,
        keyrange: KeyRange,
        base_path: PathBuf,
    ) -> Self {
        let uuid = Sha1Hash::random();
        Self {
            partition_id,
            namespace: namespace.to_string(),
            table_id: table_id.to_string(),
            keyrange,
            lsm_sequence: 0,
            segments: Vec::new(),
            head_arena: Arc::new(PartitionArena::new()),
            compacting_arena: None,
            lifecycle: LifecycleState::Load,
            is_splitting: false,
            split_partition_ids: Vec::new(),
            last_metadata_txnid: Sha1Hash::ZERO,
            last_metadata_txnseq: 0,
            replication_targets: Vec::new(),
            has_joining_servers: false,
            replication_state: ReplicationState::for_uuid(uuid),
            uuid,
            base_path,
            file_guards: Vec::new(),
        }
    }

    /// Summed data-file bytes across the segment list.
    pub fn total_segment_bytes(&self) -> u64 {
        self.segments.iter().map(|s| s.size_bytes).sum()
    }

    /// Persist the durable projection of this snapshot.
    ///
    /// The arenas are deliberately excluded: their contents are recovered
    /// through replication, not local redo. The file is written to a
    /// temporary sibling, fsynced, and atomically renamed over the previous
    /// generation; the directory is fsynced afterwards.
    pub fn write_to_disk(&self) -> Result<()> {
        std::fs::create_dir_all(&self.base_path)?;

        let durable = DurableSnapshot::from(self);
        let body = bincode::serialize(&durable)?;
        let mut trailer = [0u8; 4];
        BigEndian::write_u32(&mut trailer, CRC32.checksum(&body));

        let tmp_path = self.base_path.join(format!("{SNAPSHOT_FILE}.tmp"));
        let final_path = self.base_path.join(SNAPSHOT_FILE);
        {
            let mut file = std::fs::File::create(&tmp_path)?;
            use std::io::Write;
            file.write_all(&body)?;
            file.write_all(&trailer)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp_path, &final_path)?;
        sync_dir(&self.base_path)?;
        Ok(())
    }

    /// Restore the durable projection from a partition directory. Arenas
    /// come back empty; the compacting slot is always clear after restart.
    pub fn read_from_disk(base_path: &Path) -> Result<Self> {
        let raw = std::fs::read(base_path.join(SNAPSHOT_FILE))?;
        if raw.len() < 4 {
            return Err(Error::InvalidData("snapshot file truncated".to_string()));
        }
        let (body, trailer) = raw.split_at(raw.len() - 4);
        if CRC32.checksum(body) != BigEndian::read_u32(trailer) {
            return Err(Error::InvalidData(
                "snapshot file checksum mismatch".to_string(),
            ));
        }

        let durable: DurableSnapshot = bincode::deserialize(body)?;
        Ok(durable.into_snapshot(base_path.to_path_buf()))
    }
}

/// The persisted projection of a snapshot.
#[derive(Serialize, Deserialize)]
struct DurableSnapshot {
    partition_id: Sha1Hash,
    namespace: String,
    table_id: String,
    keyrange: KeyRange,
    lsm_sequence: u64,
    segments: Vec<Segment>,
    lifecycle: LifecycleState,
    is_splitting: bool,
    split_partition_ids: Vec<Sha1Hash>,
    last_metadata_txnid: Sha1Hash,
    last_metadata_txnseq: u64,
    replication_targets: Vec<ReplicationTarget>,
    has_joining_servers: bool,
    replication_state: ReplicationState,
    uuid: Sha1Hash,
}

impl From<&PartitionSnapshot> for DurableSnapshot {
    fn from(snap: &PartitionSnapshot) -> Self {
        Self {
            partition_id: snap.partition_id,
            namespace: snap.namespace.clone(),
            table_id: snap.table_id.clone(),
            keyrange: snap.keyrange.clone(),
            lsm_sequence: snap.lsm_sequence,
            segments: snap.segments.clone(),
            lifecycle: snap.lifecycle,
            is_splitting: snap.is_splitting,
            split_partition_ids: snap.split_partition_ids.clone(),
            last_metadata_txnid: snap.last_metadata_txnid,
            last_metadata_txnseq: snap.last_metadata_txnseq,
            replication_targets: snap.replication_targets.clone(),
            has_joining_servers: snap.has_joining_servers,
            replication_state: snap.replication_state.clone(),
            uuid: snap.uuid,
        }
    }
}

impl DurableSnapshot {
    fn into_snapshot(self, base_path: PathBuf) -> PartitionSnapshot {
        PartitionSnapshot {
            partition_id: self.partition_id,
            namespace: self.namespace,
            table_id: self.table_id,
            keyrange: self.keyrange,
            lsm_sequence: self.lsm_sequence,
            segments: self.segments,
            head_arena: Arc::new(PartitionArena::new()),
            compacting_arena: None,
            lifecycle: self.lifecycle,
            is_splitting: self.is_splitting,
            split_partition_ids: self.split_partition_ids,
            last_metadata_txnid: self.last_metadata_txnid,
            last_metadata_txnseq: self.last_metadata_txnseq,
            replication_targets: self.replication_targets,
            has_joining_servers: self.has_joining_servers,
            replication_state: self.replication_state,
            uuid: self.uuid,
            base_path,
            file_guards: Vec::new(),
        }
    }
}

/// Single-writer, many-reader holder of the current snapshot.
pub struct SnapshotCell {
    head: RwLock<Arc<PartitionSnapshot>>,
}

impl SnapshotCell {
    pub fn new(snapshot: PartitionSnapshot) -> Self {
        Self {
            head: RwLock::new(Arc::new(snapshot)),
        }
    }

    /// A stable reference to the current snapshot.
    pub fn load(&self) -> Arc<PartitionSnapshot> {
        self.head.read().unwrap().clone()
    }

    /// Atomically replace the current snapshot.
    pub fn publish(&self, snapshot: PartitionSnapshot) -> Arc<PartitionSnapshot> {
        let snapshot = Arc::new(snapshot);
        *self.head.write().unwrap() = snapshot.clone();
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;

    fn snapshot(dir: &Path) -> PartitionSnapshot {
        PartitionSnapshot::create(
            Sha1Hash::compute(b"p1"),
            "analytics",
            "events",
            KeyRange::unbounded(),
            dir.to_path_buf(),
        )
    }

    #[test]
    fn test_persist_roundtrip() {
        let dir = TempDir::new().unwrap();
        let mut snap = snapshot(dir.path());
        snap.lsm_sequence = 42;
        snap.segments.push(Segment {
            filename: "00aa00aa00aa00aa".to_string(),
            first_sequence: 1,
            last_sequence: 42,
            size_bytes: 8192,
            has_skip_index: true,
        });
        snap.lifecycle = LifecycleState::Serve;
        snap.last_metadata_txnseq = 7;
        snap.write_to_disk().unwrap();

        let restored = PartitionSnapshot::read_from_disk(dir.path()).unwrap();
        assert_eq!(restored.partition_id, snap.partition_id);
        assert_eq!(restored.lsm_sequence, 42);
        assert_eq!(restored.segments, snap.segments);
        assert_eq!(restored.lifecycle, LifecycleState::Serve);
        assert_eq!(restored.last_metadata_txnseq, 7);
        assert_eq!(restored.uuid, snap.uuid);
        // Arenas never persist.
        assert!(restored.head_arena.is_empty());
        assert!(restored.compacting_arena.is_none());
    }

    #[test]
    fn test_persist_overwrites_previous_generation() {
        let dir = TempDir::new().unwrap();
        let mut snap = snapshot(dir.path());
        snap.write_to_disk().unwrap();

        snap.lsm_sequence = 9;
        snap.write_to_disk().unwrap();

        let restored = PartitionSnapshot::read_from_disk(dir.path()).unwrap();
        assert_eq!(restored.lsm_sequence, 9);
    }

    #[test]
    fn test_read_detects_corruption() {
        let dir = TempDir::new().unwrap();
        let snap = snapshot(dir.path());
        snap.write_to_disk().unwrap();

        let path = dir.path().join(SNAPSHOT_FILE);
        let mut raw = std::fs::read(&path).unwrap();
        raw[10] ^= 0xff;
        std::fs::write(&path, raw).unwrap();

        assert!(PartitionSnapshot::read_from_disk(dir.path()).is_err());
    }

    #[test]
    fn test_cell_publish_does_not_disturb_readers() {
        let dir = TempDir::new().unwrap();
        let cell = SnapshotCell::new(snapshot(dir.path()));

        let held = cell.load();
        let mut next = (*held).clone();
        next.lsm_sequence = 99;
        cell.publish(next);

        // The held reference still sees the old state.
        assert_eq!(held.lsm_sequence, 0);
        assert_eq!(cell.load().lsm_sequence, 99);
    }
}
