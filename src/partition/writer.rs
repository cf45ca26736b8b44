//! Per-partition write coordination.
//!
//! The writer owns every mutation of a partition: batched inserts into the
//! head arena, commits (arena → segment), compaction, split proposals, and
//! integration of discovery responses. Reads never go through the writer;
//! they take a snapshot from the cell and use a [`PartitionReader`].
//!
//! Lock discipline (acquisition never nests in the other direction):
//! - `write_mutex` guards snapshot read-modify-publish steps. Held briefly,
//!   never across file flushes, merges, or RPC.
//! - `commit_mutex` serializes commits across the arena flip, the flush,
//!   and the segment-list append.
//! - `compaction_mutex` and `split_mutex` are try-locks: concurrent
//!   attempts no-op rather than queue.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::allocator::{AllocationPolicy, ServerAllocator};
use crate::config::PartitionConfig;
use crate::directory::ConfigDirectory;
use crate::error::{Error, Result};
use crate::file_tracker::{FileGuard, FileTracker};
use crate::ids::{random_hex64, RecordId, Sha1Hash};
use crate::index_cache::SkipIndexCache;
use crate::metadata::{
    MetadataCoordinator, MetadataOperation, MetadataOperationData, MetadataTransport,
    PartitionDiscoveryResponse, SplitPartitionOperation,
};
use crate::record::{validate_batch, Record};
use crate::replication::ReplicationState;
use crate::segment::{Segment, sibling_paths};
use crate::table::TableHandle;

use super::compaction::CompactionStrategy;
use super::reader::PartitionReader;
use super::snapshot::{LifecycleState, PartitionSnapshot, SnapshotCell};
use crate::arena::PartitionArena;

pub struct PartitionWriter {
    head: Arc<SnapshotCell>,
    table: Arc<TableHandle>,
    directory: Arc<dyn ConfigDirectory>,
    transport: Arc<dyn MetadataTransport>,
    index_cache: Arc<SkipIndexCache>,
    file_tracker: Arc<FileTracker>,
    compaction_strategy: Arc<dyn CompactionStrategy>,

    max_arena_records: usize,
    max_lsm_segments: usize,
    partition_split_threshold: u64,

    frozen: AtomicBool,
    write_mutex: std::sync::Mutex<()>,
    commit_mutex: tokio::sync::Mutex<()>,
    compaction_mutex: tokio::sync::Mutex<()>,
    split_mutex: tokio::sync::Mutex<()>,
}

impl PartitionWriter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        head: Arc<SnapshotCell>,
        table: Arc<TableHandle>,
        directory: Arc<dyn ConfigDirectory>,
        transport: Arc<dyn MetadataTransport>,
        index_cache: Arc<SkipIndexCache>,
        file_tracker: Arc<FileTracker>,
        compaction_strategy: Arc<dyn CompactionStrategy>,
        config: &PartitionConfig,
    ) -> Self {
        // Table-level overrides win over host-level defaults.
        let table_config = directory
            .get_table_config(table.namespace(), table.table_id())
            .ok();
        let partition_split_threshold = table_config
            .as_ref()
            .and_then(|t| t.partition_split_threshold_override)
            .unwrap_or(config.partition_split_threshold_bytes);
        let max_arena_records = table_config
            .as_ref()
            .and_then(|t| t.max_arena_records_override)
            .unwrap_or(config.max_arena_records);

        Self {
            head,
            table,
            directory,
            transport,
            index_cache,
            file_tracker,
            compaction_strategy,
            max_arena_records,
            max_lsm_segments: config.max_lsm_segments,
            partition_split_threshold,
            frozen: AtomicBool::new(false),
            write_mutex: std::sync::Mutex::new(()),
            commit_mutex: tokio::sync::Mutex::new(()),
            compaction_mutex: tokio::sync::Mutex::new(()),
            split_mutex: tokio::sync::Mutex::new(()),
        }
    }

    /// Mark the writer read-only. Irreversible for this writer instance.
    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::SeqCst);
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::SeqCst)
    }

    // -----------------------------------------------------------------------
    // Insert
    // -----------------------------------------------------------------------

    /// Insert a batch of records. Returns the ids actually written to the
    /// head arena, which is what the replication log ships.
    ///
    /// Deduplication: a record loses against any stored version `>=` its
    /// own, whether that version lives in a segment, the compacting arena,
    /// or the head arena.
    pub async fn insert(&self, records: &[Record]) -> Result<HashSet<RecordId>> {
        validate_batch(records)?;
        if records.is_empty() {
            return Ok(HashSet::new());
        }

        let mut rec_versions: HashMap<RecordId, u64> =
            records.iter().map(|r| (r.id, 0)).collect();

        // Opportunistic pre-lookup outside the critical section: most of the
        // skip-index work happens here, amortized across concurrent
        // inserters.
        let snap = self.head.load();
        let mut prepared: HashSet<String> = HashSet::new();
        for segment in snap.segments.iter().rev() {
            let index = self
                .index_cache
                .lookup(&segment.index_path(&snap.base_path))?;
            index.lookup(&mut rec_versions);
            prepared.insert(segment.filename.clone());
        }

        let inserted = {
            let _write = self.write_mutex.lock()?;

            if self.is_frozen() {
                return Err(Error::IllegalState("partition is frozen".to_string()));
            }

            let snap = self.head.load();
            if snap.segments.len() > self.max_lsm_segments {
                return Err(Error::Overloaded(
                    "partition has too many segments, can't insert".to_string(),
                ));
            }

            tracing::trace!(
                records = records.len(),
                namespace = %snap.namespace,
                table = %snap.table_id,
                partition = %snap.partition_id,
                "inserting batch"
            );

            // Re-consult state that may have changed since the pre-lookup:
            // the compacting arena, and any segment committed meanwhile.
            if let Some(compacting) = &snap.compacting_arena {
                for (id, version) in rec_versions.iter_mut() {
                    let arena_version = compacting.fetch_record_version(id);
                    if arena_version > *version {
                        *version = arena_version;
                    }
                }
            }
            for segment in snap.segments.iter().rev() {
                if prepared.contains(&segment.filename) {
                    continue;
                }
                // A lookup failure here means a published segment has no
                // readable index; that is corruption, not a recoverable
                // error.
                let index = self
                    .index_cache
                    .lookup(&segment.index_path(&snap.base_path))
                    .unwrap_or_else(|e| {
                        panic!("skip index unreadable for published segment: {e}")
                    });
                index.lookup(&mut rec_versions);
            }

            let mut skip = vec![false; records.len()];
            let mut update = vec![false; records.len()];
            for (i, record) in records.iter().enumerate() {
                let stored = rec_versions[&record.id];
                if stored > 0 {
                    update[i] = true;
                }
                // Ties go to the already-stored copy.
                if record.version <= stored {
                    skip[i] = true;
                }
            }

            snap.head_arena.insert(records, &skip, &update)
        };

        // I/O-heavy follow-ups run outside the critical section. Their
        // failures are logged and retried by the background tasks; the
        // insert itself has already succeeded.
        if self.needs_urgent_commit() {
            if let Err(e) = self.commit().await {
                tracing::warn!(error = %e, "urgent commit failed");
            }
        }
        if self.needs_urgent_compaction() {
            if let Err(e) = self.compact(false).await {
                tracing::warn!(error = %e, "urgent compaction failed");
            }
        }

        Ok(inserted)
    }

    // -----------------------------------------------------------------------
    // Commit
    // -----------------------------------------------------------------------

    pub fn needs_commit(&self) -> bool {
        self.head.load().head_arena.size() > 0
    }

    pub fn needs_urgent_commit(&self) -> bool {
        self.head.load().head_arena.size() > self.max_arena_records
    }

    pub fn needs_compaction(&self) -> bool {
        if self.needs_commit() {
            return true;
        }
        self.compaction_strategy
            .needs_compaction(&self.head.load().segments)
    }

    pub fn needs_urgent_compaction(&self) -> bool {
        self.compaction_strategy
            .needs_urgent_compaction(&self.head.load().segments)
    }

    /// Flush the pending arena to a new segment. Returns true iff a segment
    /// was written.
    ///
    /// A failed flush leaves the compacting arena in place; the next commit
    /// retries it. The partial segment files are handed to the tracker for
    /// deletion.
    pub async fn commit(&self) -> Result<bool> {
        let _commit = self.commit_mutex.lock().await;

        // Flip arenas under the short write lock if records are pending.
        let arena: Option<Arc<PartitionArena>> = {
            let _write = self.write_mutex.lock()?;
            let snap = self.head.load();
            if snap.compacting_arena.is_none() && snap.head_arena.size() > 0 {
                let mut next = (*snap).clone();
                next.compacting_arena = Some(next.head_arena.clone());
                next.head_arena = Arc::new(PartitionArena::new());
                // The flip is memory-only: nothing durable changed yet.
                self.head.publish(next).compacting_arena.clone()
            } else {
                snap.compacting_arena.clone()
            }
        };

        let Some(arena) = arena else {
            return Ok(false);
        };
        if arena.size() == 0 {
            return Ok(false);
        }

        // Flush outside the write lock.
        let snap = self.head.load();
        let filename = random_hex64();
        let first_sequence = snap.lsm_sequence + 1;
        let t0 = Instant::now();
        let size_bytes = match arena.flush_to_disk(&snap.base_path, &filename, first_sequence) {
            Ok(size) => size,
            Err(e) => {
                tracing::error!(
                    namespace = %snap.namespace,
                    table = %snap.table_id,
                    partition = %snap.partition_id,
                    error = %e,
                    "error while committing partition"
                );
                // The partial files are unreferenced; let the tracker GC
                // them.
                let (data_path, index_path) = sibling_paths(&snap.base_path, &filename);
                let orphans = HashSet::from([
                    data_path.to_string_lossy().into_owned(),
                    index_path.to_string_lossy().into_owned(),
                ]);
                if let Err(gc) = self.file_tracker.delete_files(orphans) {
                    tracing::warn!(error = %gc, "failed to GC partial segment");
                }
                return Err(e);
            }
        };

        tracing::debug!(
            namespace = %snap.namespace,
            table = %snap.table_id,
            partition = %snap.partition_id,
            num_records = arena.size(),
            first_sequence,
            last_sequence = snap.lsm_sequence + arena.size() as u64,
            elapsed_ms = t0.elapsed().as_millis() as u64,
            "committing partition"
        );

        // Append the segment descriptor under the write lock and publish.
        {
            let _write = self.write_mutex.lock()?;
            let snap = self.head.load();
            let mut next = (*snap).clone();
            let last_sequence = next.lsm_sequence + arena.size() as u64;
            let segment = Segment {
                filename: filename.clone(),
                first_sequence,
                last_sequence,
                size_bytes,
                has_skip_index: true,
            };
            next.file_guards.extend(self.guards_for(&segment, &next));
            next.segments.push(segment);
            next.lsm_sequence = last_sequence;
            next.compacting_arena = None;
            next.write_to_disk()?;
            self.head.publish(next);
        }

        drop(_commit);

        if self.needs_split() {
            if let Err(e) = self.split().await {
                tracing::warn!(error = %e, "partition split failed");
            }
        }

        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Compaction
    // -----------------------------------------------------------------------

    /// Merge segments according to the compaction strategy. Returns true iff
    /// anything was written (a commit counts).
    pub async fn compact(&self, force: bool) -> Result<bool> {
        let Ok(_compact) = self.compaction_mutex.try_lock() else {
            return Ok(false);
        };

        let dirty = self.commit().await?;

        let snap = self.head.load();
        let old_segments = snap.segments.clone();

        if !force && !self.compaction_strategy.needs_compaction(&old_segments) {
            return Ok(dirty);
        }

        let mut new_segments = Vec::new();
        let t0 = Instant::now();
        if !self
            .compaction_strategy
            .compact(&old_segments, &mut new_segments)?
        {
            return Ok(dirty);
        }

        tracing::debug!(
            namespace = %snap.namespace,
            table = %snap.table_id,
            partition = %snap.partition_id,
            elapsed_ms = t0.elapsed().as_millis() as u64,
            "compacting partition"
        );

        // Verify the snapshot's segment list still starts with the list we
        // compacted, then append whatever was committed meanwhile.
        let delete_stems: HashSet<String> = {
            let _write = self.write_mutex.lock()?;
            let snap = self.head.load();
            let mut next = (*snap).clone();

            if next.segments.len() < old_segments.len() {
                return Err(Error::ConcurrentModification(
                    "segment list changed under compaction".to_string(),
                ));
            }
            for (i, segment) in next.segments.iter().enumerate() {
                if i < old_segments.len() {
                    if old_segments[i].filename != segment.filename {
                        return Err(Error::ConcurrentModification(
                            "segment list changed under compaction".to_string(),
                        ));
                    }
                } else {
                    new_segments.push(segment.clone());
                }
            }

            next.segments = new_segments;
            next.file_guards = next
                .segments
                .iter()
                .flat_map(|segment| self.guards_for(segment, &next))
                .collect();
            next.write_to_disk()?;
            self.head.publish(next.clone());

            let kept: HashSet<String> =
                next.segments.iter().map(|s| s.filename.clone()).collect();
            old_segments
                .iter()
                .map(|s| s.filename.clone())
                .filter(|stem| !kept.contains(stem))
                .collect()
        };

        // Flush the index cache for removed segments and hand their files to
        // the tracker. Cache invalidation is explicit: eviction order is
        // never a correctness mechanism.
        let mut delete_files = HashSet::new();
        for stem in &delete_stems {
            let (data_path, index_path) = sibling_paths(&snap.base_path, stem);
            self.index_cache.flush(&index_path);
            delete_files.insert(data_path.to_string_lossy().into_owned());
            delete_files.insert(index_path.to_string_lossy().into_owned());
        }
        self.file_tracker.delete_files(delete_files)?;

        drop(_compact);

        if self.needs_split() {
            if let Err(e) = self.split().await {
                tracing::warn!(error = %e, "partition split failed");
            }
        }

        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Split
    // -----------------------------------------------------------------------

    /// Whether this partition has outgrown its split threshold.
    pub fn needs_split(&self) -> bool {
        let snap = self.head.load();
        if snap.is_splitting {
            return false;
        }
        if snap.lifecycle != LifecycleState::Serve {
            return false;
        }
        snap.total_segment_bytes() > self.partition_split_threshold
    }

    /// Propose a `SplitPartition` metadata operation for this partition.
    ///
    /// The split is only *proposed* here; the partition keeps serving its
    /// full keyrange until a later discovery response flips `is_splitting`
    /// and eventually retires it.
    pub async fn split(&self) -> Result<()> {
        let Ok(_split) = self.split_mutex.try_lock() else {
            return Err(Error::ConcurrentModification(
                "split is already running".to_string(),
            ));
        };

        let snap = self.head.load();
        if snap.lifecycle != LifecycleState::Serve {
            return Err(Error::InvalidInput(
                "can't split non-serving partition".to_string(),
            ));
        }

        let keyspace = self.table.keyspace();
        let reader = PartitionReader::new(snap.clone(), self.index_cache.clone());
        let (min, median, max) = reader.find_median_value(keyspace)?;
        if median == min || median == max {
            return Err(Error::Runtime("no suitable split point found".to_string()));
        }

        tracing::info!(
            namespace = %snap.namespace,
            table = %snap.table_id,
            partition = %snap.partition_id,
            "splitting partition"
        );

        let cluster = self.directory.get_cluster_config();
        let allocator = ServerAllocator::new(self.directory.clone());
        let split_servers_low = allocator.allocate(
            AllocationPolicy::MustAllocate,
            cluster.replication_factor,
            &HashSet::new(),
        )?;
        let split_servers_high = allocator.allocate(
            AllocationPolicy::MustAllocate,
            cluster.replication_factor,
            &split_servers_low.iter().cloned().collect(),
        )?;

        let table_config = self
            .directory
            .get_table_config(&snap.namespace, &snap.table_id)?;

        let op = MetadataOperation {
            namespace: snap.namespace.clone(),
            table_id: snap.table_id.clone(),
            input_txnid: table_config.metadata_txnid,
            output_txnid: Sha1Hash::random(),
            data: MetadataOperationData::SplitPartition(SplitPartitionOperation {
                partition_id: snap.partition_id,
                split_point: median,
                split_servers_low,
                split_servers_high,
                split_partition_id_low: Sha1Hash::random(),
                split_partition_id_high: Sha1Hash::random(),
                placement_id: Sha1Hash::random(),
                finalize_immediately: table_config.enable_async_split,
            }),
        };

        let coordinator =
            MetadataCoordinator::new(self.directory.clone(), self.transport.clone());
        coordinator
            .perform_and_commit_operation(&snap.namespace, &snap.table_id, op)
            .await
    }

    // -----------------------------------------------------------------------
    // Metadata & replication state
    // -----------------------------------------------------------------------

    /// Integrate a discovery response into the snapshot.
    ///
    /// Responses at or below the snapshot's txnseq are stale and rejected
    /// without mutating anything, which makes redelivery harmless.
    pub fn apply_metadata_change(&self, discovery: &PartitionDiscoveryResponse) -> Result<()> {
        let _write = self.write_mutex.lock()?;
        let snap = self.head.load();

        tracing::trace!(
            namespace = %snap.namespace,
            table = %snap.table_id,
            partition = %snap.partition_id,
            txnseq = discovery.txnseq,
            "applying metadata change"
        );

        if discovery.txnseq <= snap.last_metadata_txnseq {
            return Err(Error::ConcurrentModification("version conflict".to_string()));
        }

        let mut next = (*snap).clone();
        next.last_metadata_txnid = discovery.txnid;
        next.last_metadata_txnseq = discovery.txnseq;
        next.lifecycle = discovery.code;
        next.is_splitting = discovery.is_splitting;

        // Early snapshots may predate the keyrange's upper bound.
        if next.keyrange.end.is_empty() && !discovery.keyrange_end.is_empty() {
            next.keyrange.end = discovery.keyrange_end.clone();
        }

        next.split_partition_ids = discovery.split_partition_ids.clone();
        next.replication_targets = discovery.replication_targets.clone();
        next.has_joining_servers =
            next.replication_targets.iter().any(|t| t.is_joining);

        next.write_to_disk()?;
        self.head.publish(next);
        Ok(())
    }

    /// The replication cursor for this partition generation. A cursor taken
    /// against an earlier generation of the same partition id is discarded.
    pub fn fetch_replication_state(&self) -> ReplicationState {
        let snap = self.head.load();
        if snap.replication_state.uuid == snap.uuid {
            snap.replication_state.clone()
        } else {
            ReplicationState::for_uuid(snap.uuid)
        }
    }

    pub fn commit_replication_state(&self, state: ReplicationState) -> Result<()> {
        let _write = self.write_mutex.lock()?;
        let snap = self.head.load();
        let mut next = (*snap).clone();
        next.replication_state = state;
        next.write_to_disk()?;
        self.head.publish(next);
        Ok(())
    }

    // -----------------------------------------------------------------------

    fn guards_for(&self, segment: &Segment, snap: &PartitionSnapshot) -> Vec<Arc<FileGuard>> {
        vec![
            self.file_tracker.guard(
                segment
                    .data_path(&snap.base_path)
                    .to_string_lossy()
                    .into_owned(),
            ),
            self.file_tracker.guard(
                segment
                    .index_path(&snap.base_path)
                    .to_string_lossy()
                    .into_owned(),
            ),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{ClusterConfig, MemoryDirectory, ServerConfig, ServerStatus, TableConfig};
    use crate::keys::{KeyRange, KeyspaceType};
    use crate::metadata::{MetadataFile, PartitionDiscoveryRequest};
    use crate::metadata::MetadataOperationResult;
    use crate::partition::compaction::SimpleCompactionStrategy;
    use crate::table::TableHandle;
    use crate::tmpfs::TempDir;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Transport that applies every operation successfully with one agreed
    /// checksum, recording what it saw.
    #[derive(Default)]
    struct RecordingTransport {
        operations: Mutex<Vec<MetadataOperation>>,
    }

    impl RecordingTransport {
        fn operations(&self) -> Vec<MetadataOperation> {
            self.operations.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MetadataTransport for RecordingTransport {
        async fn perform_operation(
            &self,
            _addr: &str,
            _namespace: &str,
            _table_id: &str,
            op: &MetadataOperation,
        ) -> Result<MetadataOperationResult> {
            self.operations.lock().unwrap().push(op.clone());
            Ok(MetadataOperationResult {
                metadata_file_checksum: 42,
            })
        }

        async fn create_file(
            &self,
            _addr: &str,
            _namespace: &str,
            _table_id: &str,
            _file: &MetadataFile,
        ) -> Result<()> {
            Ok(())
        }

        async fn discover(
            &self,
            _addr: &str,
            _request: &PartitionDiscoveryRequest,
        ) -> Result<PartitionDiscoveryResponse> {
            Err(Error::IO("not scripted".to_string()))
        }
    }

    struct Fixture {
        writer: Arc<PartitionWriter>,
        cell: Arc<SnapshotCell>,
        cache: Arc<SkipIndexCache>,
        tracker: Arc<FileTracker>,
        directory: Arc<MemoryDirectory>,
        transport: Arc<RecordingTransport>,
        _dir: TempDir,
    }

    fn fixture_with(config: PartitionConfig, table_config: TableConfig) -> Fixture {
        let dir = TempDir::new().unwrap();
        let base_path = dir.path().join("p1");

        let directory = Arc::new(MemoryDirectory::new("local", ClusterConfig { replication_factor: 1 }));
        for i in 0..4 {
            directory.put_server(ServerConfig {
                server_id: format!("s{i}"),
                addr: format!("10.0.0.{i}:7003"),
                status: ServerStatus::Up,
            });
        }
        let mut table_config = table_config;
        table_config.metadata_servers = vec!["s0".to_string()];
        directory.put_table(table_config);

        let transport = Arc::new(RecordingTransport::default());
        let cache = Arc::new(SkipIndexCache::new(64));
        let tracker = FileTracker::open(dir.path()).unwrap();
        let table = TableHandle::new("analytics", "events", "time", KeyspaceType::Text);

        let snapshot = PartitionSnapshot::create(
            Sha1Hash::compute(b"p1"),
            "analytics",
            "events",
            KeyRange::unbounded(),
            base_path,
        );
        snapshot.write_to_disk().unwrap();
        let cell = Arc::new(SnapshotCell::new(snapshot));

        let strategy = Arc::new(
            SimpleCompactionStrategy::new(cell.load().base_path.clone()).with_limits(4, 2),
        );
        let writer = Arc::new(PartitionWriter::new(
            cell.clone(),
            table,
            directory.clone(),
            transport.clone(),
            cache.clone(),
            tracker.clone(),
            strategy,
            &config,
        ));

        Fixture {
            writer,
            cell,
            cache,
            tracker,
            directory,
            transport,
            _dir: dir,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(
            PartitionConfig::new("unused"),
            TableConfig::new("analytics", "events"),
        )
    }

    fn record(seed: &[u8], version: u64) -> Record {
        Record::new(
            RecordId::from_content(seed),
            version,
            seed.to_vec(),
            format!("payload-{version}").into_bytes(),
        )
    }

    fn serve_response(txnseq: u64) -> PartitionDiscoveryResponse {
        PartitionDiscoveryResponse {
            code: LifecycleState::Serve,
            txnid: Sha1Hash::compute(b"txn"),
            txnseq,
            replication_targets: Vec::new(),
            keyrange_begin: Vec::new(),
            keyrange_end: Vec::new(),
            is_splitting: false,
            split_partition_ids: Vec::new(),
        }
    }

    fn reader(fixture: &Fixture) -> PartitionReader {
        PartitionReader::new(fixture.cell.load(), fixture.cache.clone())
    }

    #[tokio::test]
    async fn test_within_batch_dedup() {
        let f = fixture();

        let inserted = f
            .writer
            .insert(&[
                record(b"A", 1_500_000_000_000_001),
                record(b"A", 1_500_000_000_000_002),
                record(b"A", 1_500_000_000_000_001),
            ])
            .await
            .unwrap();
        assert_eq!(inserted, HashSet::from([RecordId::from_content(b"A")]));

        assert!(f.writer.commit().await.unwrap());

        let reader = reader(&f);
        assert_eq!(
            reader
                .fetch_record_version(&RecordId::from_content(b"A"))
                .unwrap(),
            1_500_000_000_000_002
        );
        assert_eq!(reader.live_record_count().unwrap(), 1);

        let snap = f.cell.load();
        assert_eq!(snap.segments.len(), 1);
        assert_eq!(snap.segments[0].first_sequence, 1);
        assert_eq!(snap.segments[0].last_sequence, 1);
        assert_eq!(snap.lsm_sequence, 1);
    }

    #[tokio::test]
    async fn test_cross_segment_dedup_elides_stale_batch() {
        let f = fixture();

        f.writer
            .insert(&[record(b"A", 1_500_000_000_000_005)])
            .await
            .unwrap();
        assert!(f.writer.commit().await.unwrap());

        // An older version of the same record arrives after the commit.
        let inserted = f
            .writer
            .insert(&[record(b"A", 1_500_000_000_000_003)])
            .await
            .unwrap();
        assert!(inserted.is_empty(), "stale record must be masked");

        // Nothing pending, so no second segment appears.
        assert!(!f.writer.commit().await.unwrap());
        let snap = f.cell.load();
        assert_eq!(snap.segments.len(), 1);

        assert_eq!(
            reader(&f)
                .fetch_record_version(&RecordId::from_content(b"A"))
                .unwrap(),
            1_500_000_000_000_005
        );
    }

    #[tokio::test]
    async fn test_lsm_sequence_accounts_for_every_commit() {
        let f = fixture();

        let mut last_sequence = 0;
        let mut committed = 0u64;
        for batch in 0..3 {
            let records: Vec<Record> = (0..4)
                .map(|i| {
                    record(
                        format!("b{batch}-r{i}").as_bytes(),
                        1_500_000_000_000_010 + batch * 10 + i,
                    )
                })
                .collect();
            f.writer.insert(&records).await.unwrap();
            f.writer.commit().await.unwrap();
            committed += 4;

            let snap = f.cell.load();
            assert!(snap.lsm_sequence > last_sequence, "sequence must advance");
            last_sequence = snap.lsm_sequence;
            let span: u64 = snap
                .segments
                .iter()
                .map(|s| s.last_sequence - s.first_sequence + 1)
                .sum();
            assert_eq!(span, committed);
        }
    }

    #[tokio::test]
    async fn test_insert_rejected_when_frozen() {
        let f = fixture();
        f.writer.freeze();
        let result = f.writer.insert(&[record(b"A", 1_500_000_000_000_001)]).await;
        assert!(matches!(result, Err(Error::IllegalState(_))));
    }

    #[tokio::test]
    async fn test_insert_rejected_when_overloaded() {
        let f = fixture_with(
            PartitionConfig::new("unused").max_lsm_segments(1),
            TableConfig::new("analytics", "events"),
        );

        for i in 0..2u64 {
            f.writer
                .insert(&[record(format!("r{i}").as_bytes(), 1_500_000_000_000_001 + i)])
                .await
                .unwrap();
            f.writer.commit().await.unwrap();
        }

        let result = f
            .writer
            .insert(&[record(b"one-too-many", 1_500_000_000_000_099)])
            .await;
        assert!(matches!(result, Err(Error::Overloaded(_))));
    }

    #[tokio::test]
    async fn test_insert_rejects_epoch_floor_versions() {
        let f = fixture();
        let result = f.writer.insert(&[record(b"A", 1_000_000_000_000_005)]).await;
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_urgent_commit_triggered_by_insert() {
        let f = fixture_with(
            PartitionConfig::new("unused").max_arena_records(2),
            TableConfig::new("analytics", "events"),
        );

        let records: Vec<Record> = (0..5)
            .map(|i| record(format!("r{i}").as_bytes(), 1_500_000_000_000_001 + i))
            .collect();
        f.writer.insert(&records).await.unwrap();

        // The batch exceeded the arena bound, so insert committed it.
        let snap = f.cell.load();
        assert_eq!(snap.segments.len(), 1);
        assert_eq!(snap.head_arena.size(), 0);
        assert_eq!(snap.lsm_sequence, 5);
    }

    #[tokio::test]
    async fn test_failed_commit_retries_to_same_state() {
        let f = fixture();

        let records: Vec<Record> = (0..3)
            .map(|i| record(format!("r{i}").as_bytes(), 1_500_000_000_000_001 + i))
            .collect();
        f.writer.insert(&records).await.unwrap();

        // Sabotage the flush by removing the partition directory.
        let base_path = f.cell.load().base_path.clone();
        std::fs::remove_dir_all(&base_path).unwrap();
        assert!(f.writer.commit().await.is_err());

        // The arena survived the failure in the compacting slot.
        let snap = f.cell.load();
        let pending = snap.compacting_arena.as_ref().unwrap();
        assert_eq!(pending.size(), 3);
        assert_eq!(snap.segments.len(), 0);

        // Restore the directory; the retry commits the same batch.
        std::fs::create_dir_all(&base_path).unwrap();
        assert!(f.writer.commit().await.unwrap());

        let snap = f.cell.load();
        assert!(snap.compacting_arena.is_none());
        assert_eq!(snap.segments.len(), 1);
        assert_eq!(snap.lsm_sequence, 3);
        let reader = reader(&f);
        for record in &records {
            assert_eq!(
                reader.fetch_record_version(&record.id).unwrap(),
                record.version
            );
        }
    }

    #[tokio::test]
    async fn test_compaction_merges_and_hands_files_to_tracker() {
        let f = fixture();

        for batch in 0..3u64 {
            f.writer
                .insert(&[record(
                    format!("r{batch}").as_bytes(),
                    1_500_000_000_000_001 + batch,
                )])
                .await
                .unwrap();
            f.writer.commit().await.unwrap();
        }
        let old_segments = f.cell.load().segments.clone();
        assert_eq!(old_segments.len(), 3);

        assert!(f.writer.compact(true).await.unwrap());

        let snap = f.cell.load();
        assert_eq!(snap.segments.len(), 1);
        assert_eq!(snap.segments[0].first_sequence, 1);
        assert_eq!(snap.segments[0].last_sequence, 3);

        // Reads are unchanged after compaction.
        let reader = reader(&f);
        for batch in 0..3u64 {
            assert_eq!(
                reader
                    .fetch_record_version(&RecordId::from_content(
                        format!("r{batch}").as_bytes()
                    ))
                    .unwrap(),
                1_500_000_000_000_001 + batch
            );
        }

        // The replaced files are gone once their snapshots dropped.
        drop(old_segments);
        f.tracker.sweep().unwrap();
        for segment in &f.cell.load().segments {
            assert!(segment.data_path(&snap.base_path).exists());
        }
        assert_eq!(f.tracker.pending_count(), 0);
    }

    /// Strategy that simulates a commit landing while the merge runs: it
    /// merges the two segments it was given and sneaks a third segment into
    /// the published snapshot before returning.
    struct RacingStrategy {
        inner: SimpleCompactionStrategy,
        cell: Arc<SnapshotCell>,
    }

    impl CompactionStrategy for RacingStrategy {
        fn needs_compaction(&self, segments: &[Segment]) -> bool {
            segments.len() >= 2
        }

        fn needs_urgent_compaction(&self, _segments: &[Segment]) -> bool {
            false
        }

        fn compact(&self, segments: &[Segment], output: &mut Vec<Segment>) -> Result<bool> {
            let merged = self.inner.compact(segments, output)?;

            // Concurrent commit: S3 appears after the merge input was taken.
            let snap = self.cell.load();
            let mut next = (*snap).clone();
            let arena = PartitionArena::new();
            arena.insert(
                &[Record::new(
                    RecordId::from_content(b"late"),
                    1_500_000_000_000_099,
                    b"late".to_vec(),
                    b"late".to_vec(),
                )],
                &[false],
                &[false],
            );
            let first = next.lsm_sequence + 1;
            let size = arena
                .flush_to_disk(&next.base_path, "concurrent", first)
                .unwrap();
            next.segments.push(Segment {
                filename: "concurrent".to_string(),
                first_sequence: first,
                last_sequence: first,
                size_bytes: size,
                has_skip_index: true,
            });
            next.lsm_sequence = first;
            self.cell.publish(next);

            Ok(merged)
        }
    }

    #[tokio::test]
    async fn test_compaction_keeps_segments_added_during_merge() {
        let f = fixture();

        for batch in 0..2u64 {
            f.writer
                .insert(&[record(
                    format!("r{batch}").as_bytes(),
                    1_500_000_000_000_001 + batch,
                )])
                .await
                .unwrap();
            f.writer.commit().await.unwrap();
        }
        let old_segments = f.cell.load().segments.clone();

        // Swap in the racing strategy through a second writer over the same
        // cell and tracker.
        let racing = Arc::new(RacingStrategy {
            inner: SimpleCompactionStrategy::new(f.cell.load().base_path.clone())
                .with_limits(4, 2),
            cell: f.cell.clone(),
        });
        let racing_writer = PartitionWriter::new(
            f.cell.clone(),
            TableHandle::new("analytics", "events", "time", KeyspaceType::Text),
            f.directory.clone(),
            f.transport.clone(),
            f.cache.clone(),
            f.tracker.clone(),
            racing,
            &PartitionConfig::new("unused"),
        );

        assert!(racing_writer.compact(true).await.unwrap());

        // Final list: the merged segment, then the concurrently committed
        // one.
        let snap = f.cell.load();
        assert_eq!(snap.segments.len(), 2);
        assert_eq!(snap.segments[1].filename, "concurrent");
        assert_eq!(snap.segments[0].first_sequence, 1);
        assert_eq!(snap.segments[0].last_sequence, 2);

        // Both replaced inputs went to the tracker.
        let base_path = snap.base_path.clone();
        drop(snap);
        for old in &old_segments {
            assert!(
                !old.data_path(&base_path).exists(),
                "replaced segment data must be deleted"
            );
            assert!(
                !old.index_path(&base_path).exists(),
                "replaced segment index must be deleted"
            );
        }
        assert_eq!(
            reader(&f)
                .fetch_record_version(&RecordId::from_content(b"late"))
                .unwrap(),
            1_500_000_000_000_099
        );
    }

    #[tokio::test]
    async fn test_split_refused_without_usable_median() {
        let mut table_config = TableConfig::new("analytics", "events");
        table_config.partition_split_threshold_override = Some(1);
        let f = fixture_with(PartitionConfig::new("unused"), table_config);

        f.writer.apply_metadata_change(&serve_response(1)).unwrap();

        // Every record carries the same partition key.
        let records: Vec<Record> = (0..4)
            .map(|i| {
                Record::new(
                    RecordId::from_content(format!("id{i}").as_bytes()),
                    1_500_000_000_000_001 + i,
                    b"hot-key".to_vec(),
                    vec![0u8; 64],
                )
            })
            .collect();
        f.writer.insert(&records).await.unwrap();
        // The commit notices the threshold and tries to split; the refusal
        // is logged, not returned.
        f.writer.commit().await.unwrap();

        let direct = f.writer.split().await;
        match direct {
            Err(Error::Runtime(msg)) => assert!(msg.contains("no suitable split point")),
            other => panic!("expected split refusal, got {other:?}"),
        }
        assert!(
            f.transport.operations().is_empty(),
            "no metadata operation may be dispatched"
        );
    }

    #[tokio::test]
    async fn test_split_proposes_metadata_operation() {
        let mut table_config = TableConfig::new("analytics", "events");
        table_config.partition_split_threshold_override = Some(1);
        table_config.metadata_txnid = Sha1Hash::compute(b"txn-current");
        let f = fixture_with(PartitionConfig::new("unused"), table_config);

        f.writer.apply_metadata_change(&serve_response(1)).unwrap();

        let records: Vec<Record> = (0..8)
            .map(|i| {
                Record::new(
                    RecordId::from_content(format!("id{i}").as_bytes()),
                    1_500_000_000_000_001 + i,
                    format!("key-{i}").into_bytes(),
                    vec![0u8; 64],
                )
            })
            .collect();
        f.writer.insert(&records).await.unwrap();
        f.writer.commit().await.unwrap();

        let operations = f.transport.operations();
        assert_eq!(operations.len(), 1, "commit must propose exactly one split");
        let op = &operations[0];
        assert_eq!(op.input_txnid, Sha1Hash::compute(b"txn-current"));
        match &op.data {
            MetadataOperationData::SplitPartition(split) => {
                assert_eq!(split.partition_id, Sha1Hash::compute(b"p1"));
                assert_eq!(split.split_servers_low.len(), 1);
                assert_eq!(split.split_servers_high.len(), 1);
                assert_ne!(split.split_servers_low, split.split_servers_high);
                assert_ne!(split.split_partition_id_low, split.split_partition_id_high);
                assert!(!split.split_point.is_empty());
            }
            other => panic!("expected split operation, got {other:?}"),
        }

        // The quorum commit advanced the table's metadata cursor.
        let table = f.directory.get_table_config("analytics", "events").unwrap();
        assert_eq!(table.metadata_txnseq, 1);
        assert_eq!(table.metadata_txnid, op.output_txnid);
    }

    #[tokio::test]
    async fn test_split_skipped_while_already_splitting() {
        let mut table_config = TableConfig::new("analytics", "events");
        table_config.partition_split_threshold_override = Some(1);
        let f = fixture_with(PartitionConfig::new("unused"), table_config);

        let mut response = serve_response(1);
        response.is_splitting = true;
        response.split_partition_ids =
            vec![Sha1Hash::compute(b"low"), Sha1Hash::compute(b"high")];
        f.writer.apply_metadata_change(&response).unwrap();

        let records: Vec<Record> = (0..4)
            .map(|i| {
                Record::new(
                    RecordId::from_content(format!("id{i}").as_bytes()),
                    1_500_000_000_000_001 + i,
                    format!("key-{i}").into_bytes(),
                    vec![0u8; 64],
                )
            })
            .collect();
        // Writes still succeed while splitting.
        f.writer.insert(&records).await.unwrap();
        f.writer.commit().await.unwrap();

        assert!(!f.writer.needs_split());
        assert!(f.transport.operations().is_empty());
    }

    #[tokio::test]
    async fn test_apply_metadata_change_is_idempotent() {
        let f = fixture();

        let mut response = serve_response(2);
        response.keyrange_end = b"m".to_vec();
        f.writer.apply_metadata_change(&response).unwrap();

        let snap_before = f.cell.load();
        assert_eq!(snap_before.lifecycle, LifecycleState::Serve);
        assert_eq!(snap_before.last_metadata_txnseq, 2);
        assert_eq!(snap_before.keyrange.end, b"m".to_vec());

        // Redelivery of the same txnseq mutates nothing.
        let result = f.writer.apply_metadata_change(&response);
        assert!(matches!(result, Err(Error::ConcurrentModification(_))));
        let snap_after = f.cell.load();
        assert_eq!(snap_after.last_metadata_txnseq, 2);
        assert_eq!(snap_after.lifecycle, LifecycleState::Serve);

        // A lower txnseq is rejected the same way.
        assert!(f.writer.apply_metadata_change(&serve_response(1)).is_err());
    }

    #[tokio::test]
    async fn test_replication_state_tagged_by_generation() {
        let f = fixture();

        let mut state = f.writer.fetch_replication_state();
        assert_eq!(state.uuid, f.cell.load().uuid);

        state.targets.push(crate::replication::ReplicaCursor {
            placement_id: Sha1Hash::compute(b"pl"),
            server_id: "s1".to_string(),
            replicated_offset: 17,
        });
        f.writer.commit_replication_state(state.clone()).unwrap();
        assert_eq!(f.writer.fetch_replication_state(), state);

        // A cursor recorded against another generation is discarded.
        {
            let snap = f.cell.load();
            let mut next = (*snap).clone();
            next.uuid = Sha1Hash::compute(b"recreated");
            f.cell.publish(next);
        }
        let fresh = f.writer.fetch_replication_state();
        assert_eq!(fresh.uuid, Sha1Hash::compute(b"recreated"));
        assert!(fresh.targets.is_empty());
    }
}
