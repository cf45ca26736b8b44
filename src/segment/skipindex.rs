//! Skip index for record-id lookups against a segment.
//!
//! The index holds one fixed-width entry per record, sorted by record id,
//! and is small enough to load fully into memory. Its job on the write path
//! is version reconciliation: given a map of candidate record ids, raise
//! each candidate's version to the version stored in this segment, if any.
//!
//! ## Index File Layout
//!
//! ```text
//! +--------------------------+
//! | magic "EMBI" (4 bytes)   |
//! | format version (u16)     |
//! | entry count (u64)        |
//! +--------------------------+
//! | record_id (16 bytes)     |
//! | version (u64)            |
//! | offset (u64)             |   × entry count, sorted by record_id
//! +--------------------------+
//! ```

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};
use crate::ids::{RecordId, RECORD_ID_BYTES};

const MAGIC: &[u8; 4] = b"EMBI";
const FORMAT_VERSION: u16 = 1;

/// In-memory skip index for one segment.
///
/// Entries are `(record_id, version, frame_offset)`, sorted by record id.
#[derive(Debug, Clone, Default)]
pub struct SkipIndex {
    entries: Vec<(RecordId, u64, u64)>,
}

impl SkipIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry. Callers must push in ascending record-id order.
    pub fn push(&mut self, id: RecordId, version: u64, offset: u64) {
        debug_assert!(self.entries.last().map_or(true, |(last, _, _)| *last < id));
        self.entries.push((id, version, offset));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn find(&self, id: &RecordId) -> Option<&(RecordId, u64, u64)> {
        self.entries
            .binary_search_by(|(entry_id, _, _)| entry_id.cmp(id))
            .ok()
            .map(|idx| &self.entries[idx])
    }

    /// The version this segment stores for a record id, or 0 if absent.
    pub fn version_of(&self, id: &RecordId) -> u64 {
        self.find(id).map_or(0, |(_, version, _)| *version)
    }

    /// The data-file frame offset for a record id.
    pub fn offset_of(&self, id: &RecordId) -> Option<u64> {
        self.find(id).map(|(_, _, offset)| *offset)
    }

    /// Raise each candidate's version to this segment's version for the same
    /// id, where present. Entries for ids this segment does not contain are
    /// left untouched; versions only ever move up.
    pub fn lookup(&self, rec_versions: &mut HashMap<RecordId, u64>) {
        for (id, version) in rec_versions.iter_mut() {
            let stored = self.version_of(id);
            if stored > *version {
                *version = stored;
            }
        }
    }

    /// Write the index to its sibling `.idx` file.
    pub fn write_to(&self, path: &Path) -> Result<()> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file.try_clone()?);

        writer.write_all(MAGIC)?;
        writer.write_u16::<BigEndian>(FORMAT_VERSION)?;
        writer.write_u64::<BigEndian>(self.entries.len() as u64)?;
        for (id, version, offset) in &self.entries {
            writer.write_all(id.as_bytes())?;
            writer.write_u64::<BigEndian>(*version)?;
            writer.write_u64::<BigEndian>(*offset)?;
        }
        writer.flush()?;
        file.sync_all()?;
        Ok(())
    }

    /// Load an index from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);

        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(Error::InvalidData("bad skip index magic".to_string()));
        }
        let version = reader.read_u16::<BigEndian>()?;
        if version != FORMAT_VERSION {
            return Err(Error::InvalidData(format!(
                "unsupported skip index format version {version}"
            )));
        }
        let count = reader.read_u64::<BigEndian>()? as usize;

        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let mut id = [0u8; RECORD_ID_BYTES];
            reader.read_exact(&mut id)?;
            let record_version = reader.read_u64::<BigEndian>()?;
            let offset = reader.read_u64::<BigEndian>()?;
            entries.push((RecordId::from_bytes(id), record_version, offset));
        }

        Ok(Self { entries })
    }
}
