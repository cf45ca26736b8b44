//! Segment compaction strategies.
//!
//! A strategy decides which contiguous run of segments to merge and writes
//! the merged replacement. The writer owns everything around the merge:
//! snapshot verification, publication, and handing replaced files to the
//! file tracker.

use std::cmp::Reverse;
use std::path::PathBuf;

use itertools::Itertools;

use crate::error::Result;
use crate::ids::random_hex64;
use crate::segment::{sibling_paths, Segment, SegmentReader, SegmentWriter, SkipIndex, StoredRecord};

/// Soft bound on the segment count; beyond it compaction becomes urgent.
pub const SOFT_SEGMENT_LIMIT: usize = 16;

/// Minimum number of segments worth merging in one pass.
pub const MIN_MERGE_WIDTH: usize = 4;

/// Segments within this size ratio of a run's smallest member belong to the
/// same tier.
pub const TIER_SIZE_RATIO: u64 = 4;

pub trait CompactionStrategy: Send + Sync {
    /// Whether a merge would improve the segment list.
    fn needs_compaction(&self, segments: &[Segment]) -> bool;

    /// Whether the segment count threatens the hard bound and inserts
    /// should force a merge soon.
    fn needs_urgent_compaction(&self, segments: &[Segment]) -> bool;

    /// Merge a run of `segments` and produce the replacement list in
    /// `output`. Returns false (with `output` untouched) when there is
    /// nothing to do. The input list must be in snapshot order.
    fn compact(&self, segments: &[Segment], output: &mut Vec<Segment>) -> Result<bool>;
}

/// Size-tiered strategy: merges the longest contiguous run of segments that
/// sit in the same size tier, falling back to the cheapest window when the
/// segment count itself is the problem.
pub struct SimpleCompactionStrategy {
    base_path: PathBuf,
    soft_segment_limit: usize,
    min_merge_width: usize,
}

impl SimpleCompactionStrategy {
    pub fn new(base_path: PathBuf) -> Self {
        Self {
            base_path,
            soft_segment_limit: SOFT_SEGMENT_LIMIT,
            min_merge_width: MIN_MERGE_WIDTH,
        }
    }

    /// Override thresholds, for tests and aggressive table configs.
    pub fn with_limits(mut self, soft_segment_limit: usize, min_merge_width: usize) -> Self {
        self.soft_segment_limit = soft_segment_limit;
        self.min_merge_width = min_merge_width.max(2);
        self
    }

    /// The longest contiguous run whose members are within
    /// [`TIER_SIZE_RATIO`] of the run's smallest segment.
    fn find_tier_run(&self, segments: &[Segment]) -> Option<(usize, usize)> {
        let mut best: Option<(usize, usize)> = None;
        for start in 0..segments.len() {
            let mut smallest = segments[start].size_bytes.max(1);
            let mut largest = segments[start].size_bytes.max(1);
            let mut end = start + 1;
            while end < segments.len() {
                let size = segments[end].size_bytes.max(1);
                let lo = smallest.min(size);
                let hi = largest.max(size);
                if hi / lo > TIER_SIZE_RATIO {
                    break;
                }
                smallest = lo;
                largest = hi;
                end += 1;
            }
            let len = end - start;
            if len >= self.min_merge_width
                && best.map_or(true, |(bs, be)| len > be - bs)
            {
                best = Some((start, end));
            }
        }
        best
    }

    /// Cheapest contiguous window of `width` segments, by summed bytes.
    fn find_cheapest_window(&self, segments: &[Segment], width: usize) -> (usize, usize) {
        let width = width.min(segments.len()).max(2);
        let mut best_start = 0;
        let mut best_cost = u64::MAX;
        for start in 0..=(segments.len() - width) {
            let cost: u64 = segments[start..start + width]
                .iter()
                .map(|s| s.size_bytes)
                .sum();
            if cost < best_cost {
                best_cost = cost;
                best_start = start;
            }
        }
        (best_start, best_start + width)
    }

    fn pick_run(&self, segments: &[Segment]) -> Option<(usize, usize)> {
        if segments.len() < 2 {
            return None;
        }
        if let Some(run) = self.find_tier_run(segments) {
            return Some(run);
        }
        if segments.len() > self.soft_segment_limit {
            return Some(self.find_cheapest_window(segments, self.min_merge_width));
        }
        None
    }

    /// Merge the run `[start, end)` into one new segment file pair.
    fn merge_run(&self, segments: &[Segment], start: usize, end: usize) -> Result<Segment> {
        let mut inputs: Vec<Vec<StoredRecord>> = Vec::with_capacity(end - start);
        for segment in &segments[start..end] {
            let reader = SegmentReader::open(&segment.data_path(&self.base_path))?;
            inputs.push(reader.iter()?.collect::<Result<Vec<_>>>()?);
        }

        let stem = random_hex64();
        let (data_path, index_path) = sibling_paths(&self.base_path, &stem);
        let mut writer = SegmentWriter::create(&data_path)?;
        let mut index = SkipIndex::new();

        // Each input is already sorted by record id, so a k-way merge keyed
        // by (id, descending version) puts each id's newest record first;
        // dedup then drops the superseded versions.
        let merged = inputs
            .into_iter()
            .kmerge_by(|a, b| (a.id, Reverse(a.version)) < (b.id, Reverse(b.version)))
            .dedup_by(|a, b| a.id == b.id);
        for record in merged {
            let offset = writer.append(&record)?;
            index.push(record.id, record.version, offset);
        }
        let size_bytes = writer.finalize()?;
        index.write_to(&index_path)?;

        // The merged segment keeps the run's full sequence span so that
        // commit accounting survives deduplication.
        Ok(Segment {
            filename: stem,
            first_sequence: segments[start].first_sequence,
            last_sequence: segments[end - 1].last_sequence,
            size_bytes,
            has_skip_index: true,
        })
    }
}

impl CompactionStrategy for SimpleCompactionStrategy {
    fn needs_compaction(&self, segments: &[Segment]) -> bool {
        self.pick_run(segments).is_some()
    }

    fn needs_urgent_compaction(&self, segments: &[Segment]) -> bool {
        segments.len() > self.soft_segment_limit
    }

    fn compact(&self, segments: &[Segment], output: &mut Vec<Segment>) -> Result<bool> {
        let Some((start, end)) = self.pick_run(segments) else {
            return Ok(false);
        };

        tracing::debug!(
            run_start = start,
            run_len = end - start,
            total_segments = segments.len(),
            "merging segment run"
        );

        let merged = self.merge_run(segments, start, end)?;
        output.extend_from_slice(&segments[..start]);
        output.push(merged);
        output.extend_from_slice(&segments[end..]);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::PartitionArena;
    use crate::ids::RecordId;
    use crate::record::Record;
    use crate::tmpfs::TempDir;
    use std::path::Path;

    fn write_segment(
        base: &Path,
        stem: &str,
        first_sequence: u64,
        records: &[(&[u8], u64)],
    ) -> Segment {
        let arena = PartitionArena::new();
        let batch: Vec<Record> = records
            .iter()
            .map(|(seed, version)| {
                Record::new(
                    RecordId::from_content(seed),
                    *version,
                    seed.to_vec(),
                    format!("v{version}").into_bytes(),
                )
            })
            .collect();
        let skip = vec![false; batch.len()];
        let update = vec![false; batch.len()];
        arena.insert(&batch, &skip, &update);
        let size = arena.flush_to_disk(base, stem, first_sequence).unwrap();
        Segment {
            filename: stem.to_string(),
            first_sequence,
            last_sequence: first_sequence + arena.size() as u64 - 1,
            size_bytes: size,
            has_skip_index: true,
        }
    }

    #[test]
    fn test_no_compaction_for_short_lists() {
        let dir = TempDir::new().unwrap();
        let strategy = SimpleCompactionStrategy::new(dir.path().to_path_buf());
        let segments = vec![write_segment(
            dir.path(),
            "s1",
            1,
            &[(b"a", 1_500_000_000_000_001)],
        )];
        assert!(!strategy.needs_compaction(&segments));
        let mut output = Vec::new();
        assert!(!strategy.compact(&segments, &mut output).unwrap());
        assert!(output.is_empty());
    }

    #[test]
    fn test_merge_preserves_newest_versions_and_span() {
        let dir = TempDir::new().unwrap();
        let strategy =
            SimpleCompactionStrategy::new(dir.path().to_path_buf()).with_limits(16, 2);

        // Same record id in both segments; the second write is newer.
        let s1 = write_segment(
            dir.path(),
            "s1",
            1,
            &[(b"a", 1_500_000_000_000_001), (b"b", 1_500_000_000_000_002)],
        );
        let s2 = write_segment(
            dir.path(),
            "s2",
            3,
            &[(b"a", 1_500_000_000_000_009)],
        );
        let segments = vec![s1, s2];

        let mut output = Vec::new();
        assert!(strategy.compact(&segments, &mut output).unwrap());
        assert_eq!(output.len(), 1);

        let merged = &output[0];
        assert_eq!(merged.first_sequence, 1);
        assert_eq!(merged.last_sequence, 3);

        let reader = SegmentReader::open(&merged.data_path(dir.path())).unwrap();
        let records: Vec<StoredRecord> =
            reader.iter().unwrap().map(|r| r.unwrap()).collect();
        assert_eq!(records.len(), 2);
        let a = records
            .iter()
            .find(|r| r.id == RecordId::from_content(b"a"))
            .unwrap();
        assert_eq!(a.version, 1_500_000_000_000_009);
    }

    #[test]
    fn test_urgent_threshold() {
        let dir = TempDir::new().unwrap();
        let strategy =
            SimpleCompactionStrategy::new(dir.path().to_path_buf()).with_limits(3, 2);

        let mut segments = Vec::new();
        for i in 0..4 {
            segments.push(write_segment(
                dir.path(),
                &format!("s{i}"),
                (i + 1) as u64,
                &[(format!("k{i}").as_bytes(), 1_500_000_000_000_001 + i as u64)],
            ));
        }
        assert!(strategy.needs_urgent_compaction(&segments));
        assert!(!strategy.needs_urgent_compaction(&segments[..2]));
    }

    #[test]
    fn test_tier_run_skips_oversized_segment() {
        let dir = TempDir::new().unwrap();
        let strategy =
            SimpleCompactionStrategy::new(dir.path().to_path_buf()).with_limits(16, 2);

        // One big segment followed by small ones: the run must not include
        // the big one.
        let mut big_records: Vec<(Vec<u8>, u64)> = Vec::new();
        for i in 0..200u64 {
            big_records.push((
                format!("big-{i}").into_bytes(),
                1_500_000_000_000_001 + i,
            ));
        }
        let big_refs: Vec<(&[u8], u64)> = big_records
            .iter()
            .map(|(k, v)| (k.as_slice(), *v))
            .collect();
        let big = write_segment(dir.path(), "big", 1, &big_refs);
        let small1 = write_segment(dir.path(), "sm1", 201, &[(b"x", 1_500_000_000_000_301)]);
        let small2 = write_segment(dir.path(), "sm2", 202, &[(b"y", 1_500_000_000_000_302)]);
        let segments = vec![big.clone(), small1, small2];

        let mut output = Vec::new();
        assert!(strategy.compact(&segments, &mut output).unwrap());
        // Big segment survives untouched at the front.
        assert_eq!(output.len(), 2);
        assert_eq!(output[0].filename, big.filename);
        assert_eq!(output[1].first_sequence, 201);
        assert_eq!(output[1].last_sequence, 202);
    }
}
