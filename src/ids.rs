//! Identifier types shared across the storage and metadata layers.
//!
//! Records carry a 128-bit [`RecordId`]; partitions, metadata transactions,
//! placements, and snapshot generations are identified by a 160-bit
//! [`Sha1Hash`]. Both are plain byte arrays with value semantics so they can
//! be embedded in persisted snapshots and wire messages without indirection.

use rand::Rng;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::fmt;

use crate::error::{Error, Result};

/// Number of bytes in a record identifier.
pub const RECORD_ID_BYTES: usize = 16;

/// Number of bytes in a SHA-1 identifier.
pub const SHA1_BYTES: usize = 20;

/// A 128-bit record identifier.
///
/// Ingestion assigns these from a content hash of the record's primary key;
/// the storage layer treats them as opaque and orders them bytewise.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordId([u8; RECORD_ID_BYTES]);

impl RecordId {
    pub fn from_bytes(bytes: [u8; RECORD_ID_BYTES]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; RECORD_ID_BYTES] {
        &self.0
    }

    /// Derive a record id by hashing arbitrary data (truncated SHA-1).
    pub fn from_content(data: &[u8]) -> Self {
        let hash = Sha1::digest(data);
        let mut bytes = [0u8; RECORD_ID_BYTES];
        bytes.copy_from_slice(&hash[..RECORD_ID_BYTES]);
        Self(bytes)
    }

    /// Generate a random record id.
    pub fn random() -> Self {
        let mut bytes = [0u8; RECORD_ID_BYTES];
        rand::thread_rng().fill(&mut bytes);
        Self(bytes)
    }
}

impl fmt::Debug for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecordId({self})")
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Show the first four bytes as hex for readability.
        for byte in &self.0[..4] {
            write!(f, "{:02x}", byte)?;
        }
        write!(f, "…")
    }
}

impl RecordId {
    /// Full hex rendering, used in file-level diagnostics.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

/// A 160-bit SHA-1 identifier.
///
/// Used for partition ids, metadata transaction ids, placement ids, and the
/// snapshot uuid that tags replication cursors.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Sha1Hash([u8; SHA1_BYTES]);

impl Sha1Hash {
    /// The all-zeros hash, used as the txnid of a table with no metadata
    /// file yet.
    pub const ZERO: Self = Self([0u8; SHA1_BYTES]);

    pub fn from_bytes(bytes: [u8; SHA1_BYTES]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SHA1_BYTES] {
        &self.0
    }

    /// Hash arbitrary data.
    pub fn compute(data: &[u8]) -> Self {
        let hash = Sha1::digest(data);
        let mut bytes = [0u8; SHA1_BYTES];
        bytes.copy_from_slice(&hash);
        Self(bytes)
    }

    /// Generate a random hash, e.g. for new partition ids and placement ids.
    pub fn random() -> Self {
        let mut bytes = [0u8; SHA1_BYTES];
        rand::thread_rng().fill(&mut bytes);
        Self(bytes)
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let raw = hex::decode(s).map_err(|e| Error::InvalidInput(e.to_string()))?;
        if raw.len() != SHA1_BYTES {
            return Err(Error::InvalidInput(format!(
                "expected {} hex bytes, got {}",
                SHA1_BYTES,
                raw.len()
            )));
        }
        let mut bytes = [0u8; SHA1_BYTES];
        bytes.copy_from_slice(&raw);
        Ok(Self(bytes))
    }
}

impl Default for Sha1Hash {
    fn default() -> Self {
        Self::ZERO
    }
}

impl fmt::Debug for Sha1Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sha1Hash({self})")
    }
}

impl fmt::Display for Sha1Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// A fresh random 64-bit hex string, used for segment filename stems.
pub fn random_hex64() -> String {
    let v: u64 = rand::thread_rng().gen();
    format!("{:016x}", v)
}
