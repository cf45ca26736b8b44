//! Immutable on-disk segments.
//!
//! A segment is one committed batch of records for a partition, stored as a
//! pair of sibling files under the partition directory:
//!
//! - `<stem>.cst` — the record data, ordered by record id
//! - `<stem>.idx` — the skip index: `(record_id, version, offset)` entries
//!
//! Stems are random 64-bit hex strings. Segments are written once (by an
//! arena flush or a compaction merge) and never modified; deletion is owned
//! by the file tracker once no published snapshot references them.

pub mod file;
pub mod skipindex;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub use file::{SegmentReader, SegmentWriter, StoredRecord};
pub use skipindex::SkipIndex;

/// Extension of the record data file.
pub const DATA_EXT: &str = "cst";

/// Extension of the skip index file.
pub const INDEX_EXT: &str = "idx";

/// Descriptor of one segment within a partition snapshot.
///
/// Sequences are the dense span `[first_sequence, last_sequence]` this
/// segment occupies in the partition's commit order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub filename: String,
    pub first_sequence: u64,
    pub last_sequence: u64,
    pub size_bytes: u64,
    pub has_skip_index: bool,
}

impl Segment {
    /// Width of the segment's sequence span. Compaction preserves the span
    /// of the segments it merges, so this can exceed the physical record
    /// count after deduplication.
    pub fn sequence_span(&self) -> u64 {
        self.last_sequence - self.first_sequence + 1
    }

    /// Path of the data file under the given partition directory.
    pub fn data_path(&self, base: &Path) -> PathBuf {
        base.join(format!("{}.{}", self.filename, DATA_EXT))
    }

    /// Path of the skip index file under the given partition directory.
    pub fn index_path(&self, base: &Path) -> PathBuf {
        base.join(format!("{}.{}", self.filename, INDEX_EXT))
    }
}

/// Data and index paths for a filename stem.
pub fn sibling_paths(base: &Path, stem: &str) -> (PathBuf, PathBuf) {
    (
        base.join(format!("{stem}.{DATA_EXT}")),
        base.join(format!("{stem}.{INDEX_EXT}")),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_span() {
        let segment = Segment {
            filename: "00ff00ff00ff00ff".to_string(),
            first_sequence: 11,
            last_sequence: 15,
            size_bytes: 4096,
            has_skip_index: true,
        };
        assert_eq!(segment.sequence_span(), 5);
    }

    #[test]
    fn test_sibling_paths() {
        let base = Path::new("/data/p1");
        let (data, index) = sibling_paths(base, "abcd");
        assert_eq!(data, PathBuf::from("/data/p1/abcd.cst"));
        assert_eq!(index, PathBuf::from("/data/p1/abcd.idx"));
    }
}
