//! In-memory write arena for one partition.
//!
//! The arena absorbs inserts between commits. It is backed by a concurrent
//! skip map so that readers holding a snapshot can consult it without locks,
//! while mutation stays confined to the partition writer's critical section.
//! Once the writer moves an arena into the compacting slot it is read-only
//! by convention and shared freely via `Arc`.
//!
//! Within the arena, records reconcile last-write-wins by version: an
//! incoming record loses against a resident record of the same id with an
//! equal or higher version.

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_skiplist::SkipMap;

use crate::error::Result;
use crate::ids::RecordId;
use crate::record::Record;
use crate::segment::{sibling_paths, SegmentWriter, SkipIndex, StoredRecord};

#[derive(Debug, Clone)]
struct ArenaRecord {
    version: u64,
    partition_key: Vec<u8>,
    payload: Vec<u8>,
}

/// Mutable record buffer for a single partition.
#[derive(Debug, Default)]
pub struct PartitionArena {
    data: SkipMap<RecordId, ArenaRecord>,
    size: AtomicUsize,
}

impl PartitionArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct records buffered.
    pub fn size(&self) -> usize {
        self.size.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// The buffered version for a record id, or 0 if absent.
    pub fn fetch_record_version(&self, id: &RecordId) -> u64 {
        self.data.get(id).map_or(0, |entry| entry.value().version)
    }

    /// The buffered record for an id, if present.
    pub fn fetch_record(&self, id: &RecordId) -> Option<Record> {
        self.data.get(id).map(|entry| {
            let r = entry.value();
            Record::new(*id, r.version, r.partition_key.clone(), r.payload.clone())
        })
    }

    /// Append the unmasked records of a batch.
    ///
    /// `skip` and `update` are the per-record flags the writer computed from
    /// the partition's segments and compacting arena; the arena itself only
    /// adds reconciliation against its own contents. Returns the ids that
    /// were actually written.
    ///
    /// Must only be called from the writer's critical section.
    pub fn insert(
        &self,
        records: &[Record],
        skip: &[bool],
        update: &[bool],
    ) -> HashSet<RecordId> {
        debug_assert_eq!(records.len(), skip.len());
        debug_assert_eq!(records.len(), update.len());

        let mut inserted = HashSet::new();
        for (i, record) in records.iter().enumerate() {
            if skip[i] {
                continue;
            }
            let _ = update[i]; // carried for the replication log, not used here

            // Within-arena last-write-wins; ties keep the resident copy.
            if let Some(existing) = self.data.get(&record.id) {
                if existing.value().version >= record.version {
                    continue;
                }
            } else {
                self.size.fetch_add(1, Ordering::SeqCst);
            }

            self.data.insert(
                record.id,
                ArenaRecord {
                    version: record.version,
                    partition_key: record.partition_key.clone(),
                    payload: record.payload.clone(),
                },
            );
            inserted.insert(record.id);
        }
        inserted
    }

    /// Visit every buffered record in record-id order.
    pub fn scan(&self, mut visitor: impl FnMut(&RecordId, u64, &[u8], &[u8])) {
        for entry in self.data.iter() {
            let r = entry.value();
            visitor(entry.key(), r.version, &r.partition_key, &r.payload);
        }
    }

    /// Flush the arena to a segment file pair under `base`, assigning
    /// sequences `[first_sequence, first_sequence + size)`. Returns the data
    /// file's size in bytes.
    ///
    /// The files and their directory are fsynced before returning; a failure
    /// leaves at most an unreferenced partial file for the tracker's sweep.
    pub fn flush_to_disk(&self, base: &Path, stem: &str, first_sequence: u64) -> Result<u64> {
        let (data_path, index_path) = sibling_paths(base, stem);

        let mut writer = SegmentWriter::create(&data_path)?;
        let mut index = SkipIndex::new();
        let mut sequence = first_sequence;

        for entry in self.data.iter() {
            let r = entry.value();
            let offset = writer.append(&StoredRecord {
                id: *entry.key(),
                version: r.version,
                sequence,
                partition_key: r.partition_key.clone(),
                payload: r.payload.clone(),
            })?;
            index.push(*entry.key(), r.version, offset);
            sequence += 1;
        }

        let size_bytes = writer.finalize()?;
        index.write_to(&index_path)?;
        sync_dir(base)?;

        Ok(size_bytes)
    }
}

/// Fsync a directory so renames and file creations within it are durable.
pub(crate) fn sync_dir(path: &Path) -> Result<()> {
    std::fs::File::open(path)?.sync_all()?;
    Ok(())
}
