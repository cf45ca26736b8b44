//! Read access to a stable partition snapshot.
//!
//! A reader is constructed over one snapshot reference and answers every
//! query from that view: the head arena, the compacting arena (if a commit
//! is in flight), and the segment list, newest to oldest. Reconciliation is
//! last-write-wins by version throughout.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::ids::RecordId;
use crate::index_cache::SkipIndexCache;
use crate::keys::{compare_partition_keys, KeyspaceType};
use crate::record::Record;
use crate::segment::SegmentReader;

use super::snapshot::PartitionSnapshot;

pub struct PartitionReader {
    snapshot: Arc<PartitionSnapshot>,
    index_cache: Arc<SkipIndexCache>,
}

impl PartitionReader {
    pub fn new(snapshot: Arc<PartitionSnapshot>, index_cache: Arc<SkipIndexCache>) -> Self {
        Self {
            snapshot,
            index_cache,
        }
    }

    pub fn snapshot(&self) -> &Arc<PartitionSnapshot> {
        &self.snapshot
    }

    /// Highest version stored for a record id, or 0 if the partition has
    /// never seen it.
    pub fn fetch_record_version(&self, id: &RecordId) -> Result<u64> {
        let mut version = self.snapshot.head_arena.fetch_record_version(id);
        if let Some(compacting) = &self.snapshot.compacting_arena {
            version = version.max(compacting.fetch_record_version(id));
        }
        for segment in self.snapshot.segments.iter().rev() {
            let index = self
                .index_cache
                .lookup(&segment.index_path(&self.snapshot.base_path))?;
            version = version.max(index.version_of(id));
        }
        Ok(version)
    }

    /// The winning record for an id, if any.
    pub fn get_record(&self, id: &RecordId) -> Result<Option<Record>> {
        let mut best: Option<Record> = None;

        let mut consider = |candidate: Record| {
            let wins = best
                .as_ref()
                .map_or(true, |current| candidate.version > current.version);
            if wins {
                best = Some(candidate);
            }
        };

        if let Some(record) = self.snapshot.head_arena.fetch_record(id) {
            consider(record);
        }
        if let Some(compacting) = &self.snapshot.compacting_arena {
            if let Some(record) = compacting.fetch_record(id) {
                consider(record);
            }
        }

        for segment in self.snapshot.segments.iter().rev() {
            let index = self
                .index_cache
                .lookup(&segment.index_path(&self.snapshot.base_path))?;
            let Some(offset) = index.offset_of(id) else {
                continue;
            };
            let reader = SegmentReader::open(&segment.data_path(&self.snapshot.base_path))?;
            let stored = reader.read_at(offset)?;
            consider(Record::new(
                stored.id,
                stored.version,
                stored.partition_key,
                stored.payload,
            ));
        }

        Ok(best)
    }

    /// Visit every live record once, in record-id order, after last-write-
    /// wins reconciliation across arenas and segments.
    pub fn scan(&self, mut visitor: impl FnMut(&Record)) -> Result<()> {
        for record in self.merged_view()?.values() {
            visitor(record);
        }
        Ok(())
    }

    /// Count of live records in this snapshot.
    pub fn live_record_count(&self) -> Result<usize> {
        Ok(self.merged_view()?.len())
    }

    /// Minimum, median, and maximum partition key across live records,
    /// compared in the table's keyspace order.
    ///
    /// The median is taken over the multiset of live keys, so a heavily
    /// repeated key can surface as the median; callers treat
    /// `median == min || median == max` as "no usable split point".
    pub fn find_median_value(
        &self,
        keyspace: KeyspaceType,
    ) -> Result<(Vec<u8>, Vec<u8>, Vec<u8>)> {
        let mut keys: Vec<Vec<u8>> = self
            .merged_view()?
            .values()
            .map(|record| record.partition_key.clone())
            .collect();

        if keys.is_empty() {
            return Err(Error::Runtime(
                "cannot find median of an empty partition".to_string(),
            ));
        }

        keys.sort_by(|a, b| compare_partition_keys(keyspace, a, b));
        let min = keys.first().cloned().unwrap_or_default();
        let max = keys.last().cloned().unwrap_or_default();
        let median = keys[keys.len() / 2].clone();
        Ok((min, median, max))
    }

    /// Materialize the reconciled `record_id → record` view.
    fn merged_view(&self) -> Result<BTreeMap<RecordId, Record>> {
        let mut view = BTreeMap::new();

        let mut merge = |record: Record| {
            view.entry(record.id)
                .and_modify(|current: &mut Record| {
                    if record.version > current.version {
                        *current = record.clone();
                    }
                })
                .or_insert(record);
        };

        // Oldest segments first so newer versions overwrite on merge.
        for segment in &self.snapshot.segments {
            let reader = SegmentReader::open(&segment.data_path(&self.snapshot.base_path))?;
            for stored in reader.iter()? {
                let stored = stored?;
                merge(Record::new(
                    stored.id,
                    stored.version,
                    stored.partition_key,
                    stored.payload,
                ));
            }
        }
        if let Some(compacting) = &self.snapshot.compacting_arena {
            compacting.scan(|id, version, key, payload| {
                merge(Record::new(*id, version, key.to_vec(), payload.to_vec()));
            });
        }
        self.snapshot.head_arena.scan(|id, version, key, payload| {
            merge(Record::new(*id, version, key.to_vec(), payload.to_vec()));
        });

        Ok(view)
    }
}
