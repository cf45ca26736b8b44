//! The metadata file: one table's authoritative partitioning.

use crc::{Crc, CRC_64_ECMA_182};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::ids::Sha1Hash;

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

/// One partition of the table's keyspace.
///
/// A partition owns the keyrange from its `keyrange_begin` (inclusive) to
/// the next entry's `keyrange_begin` (exclusive); the last entry extends to
/// the end of the keyspace.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionEntry {
    pub partition_id: Sha1Hash,
    pub keyrange_begin: Vec<u8>,
    pub servers: Vec<String>,
}

/// The partition map of one table at one metadata transaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataFile {
    pub txnid: Sha1Hash,
    pub txnseq: u64,
    pub entries: Vec<PartitionEntry>,
}

impl MetadataFile {
    pub fn new(txnid: Sha1Hash, txnseq: u64, entries: Vec<PartitionEntry>) -> Self {
        Self {
            txnid,
            txnseq,
            entries,
        }
    }

    /// Content checksum over the canonical encoding.
    ///
    /// The coordinator compares checksums returned by different metadata
    /// servers; any divergence aborts the operation, so the checksum must be
    /// a pure function of the file's logical content.
    pub fn checksum(&self) -> Result<u64> {
        let encoded = bincode::serialize(self)?;
        Ok(CRC64.checksum(&encoded))
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(raw)?)
    }

    /// The entry owning an encoded partition key.
    pub fn partition_for_key(&self, key: &[u8]) -> Option<&PartitionEntry> {
        self.entries
            .iter()
            .rev()
            .find(|entry| entry.keyrange_begin.as_slice() <= key)
    }

    /// Validate entry ordering: the first entry starts at the beginning of
    /// the keyspace and begins are strictly ascending.
    pub fn verify_order(&self) -> Result<()> {
        if let Some(first) = self.entries.first() {
            if !first.keyrange_begin.is_empty() {
                return Err(Error::InvalidData(
                    "metadata file must start at the beginning of the keyspace".to_string(),
                ));
            }
        }
        for window in self.entries.windows(2) {
            if window[0].keyrange_begin >= window[1].keyrange_begin {
                return Err(Error::InvalidData(
                    "metadata file entries out of order".to_string(),
                ));
            }
        }
        Ok(())
    }
}
