//! Partitions: horizontal shards of a table.
//!
//! A partition is an aggregate of cells, not an object graph: the snapshot
//! cell holds all mutable state, the writer coordinates mutation, and
//! readers are constructed per-operation over a stable snapshot. Nothing in
//! here points back at a table registry or a server.

pub mod compaction;
pub mod reader;
pub mod snapshot;
pub mod writer;

use std::path::PathBuf;
use std::sync::Arc;

pub use compaction::{CompactionStrategy, SimpleCompactionStrategy};
pub use reader::PartitionReader;
pub use snapshot::{LifecycleState, PartitionSnapshot, SnapshotCell};
pub use writer::PartitionWriter;

use crate::config::PartitionConfig;
use crate::directory::ConfigDirectory;
use crate::error::Result;
use crate::file_tracker::FileTracker;
use crate::ids::Sha1Hash;
use crate::index_cache::SkipIndexCache;
use crate::keys::KeyRange;
use crate::metadata::MetadataTransport;
use crate::table::TableHandle;

/// One partition hosted by this process.
pub struct Partition {
    table: Arc<TableHandle>,
    cell: Arc<SnapshotCell>,
    writer: Arc<PartitionWriter>,
    index_cache: Arc<SkipIndexCache>,
}

impl Partition {
    /// Create a partition that has never existed on this server, or reopen
    /// one whose snapshot file is present under its directory.
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        partition_id: Sha1Hash,
        table: Arc<TableHandle>,
        keyrange: KeyRange,
        config: &PartitionConfig,
        directory: Arc<dyn ConfigDirectory>,
        transport: Arc<dyn MetadataTransport>,
        index_cache: Arc<SkipIndexCache>,
        file_tracker: Arc<FileTracker>,
    ) -> Result<Self> {
        let base_path = partition_dir(config, table.as_ref(), &partition_id);

        let snapshot = match PartitionSnapshot::read_from_disk(&base_path) {
            Ok(restored) => restored,
            Err(_) => {
                let fresh = PartitionSnapshot::create(
                    partition_id,
                    table.namespace(),
                    table.table_id(),
                    keyrange,
                    base_path,
                );
                fresh.write_to_disk()?;
                fresh
            }
        };

        let mut snapshot = snapshot;
        // Reopened snapshots need live tracker references for their files.
        for segment in snapshot.segments.clone() {
            snapshot.file_guards.push(
                file_tracker.guard(
                    segment
                        .data_path(&snapshot.base_path)
                        .to_string_lossy()
                        .into_owned(),
                ),
            );
            snapshot.file_guards.push(
                file_tracker.guard(
                    segment
                        .index_path(&snapshot.base_path)
                        .to_string_lossy()
                        .into_owned(),
                ),
            );
        }

        let base_path = snapshot.base_path.clone();
        let cell = Arc::new(SnapshotCell::new(snapshot));
        let strategy = Arc::new(SimpleCompactionStrategy::new(base_path));
        let writer = Arc::new(PartitionWriter::new(
            cell.clone(),
            table.clone(),
            directory,
            transport,
            index_cache.clone(),
            file_tracker,
            strategy,
            config,
        ));

        Ok(Self {
            table,
            cell,
            writer,
            index_cache,
        })
    }

    pub fn table(&self) -> &Arc<TableHandle> {
        &self.table
    }

    pub fn snapshot_cell(&self) -> &Arc<SnapshotCell> {
        &self.cell
    }

    pub fn writer(&self) -> &Arc<PartitionWriter> {
        &self.writer
    }

    /// A reader over the current snapshot.
    pub fn reader(&self) -> PartitionReader {
        PartitionReader::new(self.cell.load(), self.index_cache.clone())
    }
}

/// Directory layout: `<base>/<namespace>/<table>/<partition-id>`.
fn partition_dir(
    config: &PartitionConfig,
    table: &TableHandle,
    partition_id: &Sha1Hash,
) -> PathBuf {
    config
        .base_dir
        .join(table.namespace())
        .join(table.table_id())
        .join(partition_id.to_string())
}
