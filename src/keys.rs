//! Partition key encoding and keyranges.
//!
//! Partition keys are routed and compared in an *encoded* form: a byte string
//! whose lexicographic order equals the keyspace's natural order. Text keys
//! encode as their raw bytes; unsigned integer keys encode big-endian so that
//! numeric and bytewise order coincide. Keyranges are half-open
//! `[begin, end)` over encoded keys, with an empty `end` meaning unbounded.

use std::cmp::Ordering;

use byteorder::{BigEndian, ByteOrder};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// The key domain a table partitions over.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyspaceType {
    /// Arbitrary UTF-8 keys, ordered bytewise.
    Text,
    /// Unsigned 64-bit keys (e.g. event timestamps), ordered numerically.
    Uint64,
}

/// Encode a partition key into its order-preserving byte form.
pub fn encode_partition_key(keyspace: KeyspaceType, key: &str) -> Result<Vec<u8>> {
    match keyspace {
        KeyspaceType::Text => Ok(key.as_bytes().to_vec()),
        KeyspaceType::Uint64 => {
            let Ok(v) = key.parse::<u64>() else {
                return crate::errinput!("not a uint64 key: {key:?}");
            };
            let mut buf = [0u8; 8];
            BigEndian::write_u64(&mut buf, v);
            Ok(buf.to_vec())
        }
    }
}

/// Decode an encoded partition key back into its display form.
pub fn decode_partition_key(keyspace: KeyspaceType, encoded: &[u8]) -> Result<String> {
    match keyspace {
        KeyspaceType::Text => String::from_utf8(encoded.to_vec())
            .map_err(|e| Error::InvalidData(e.to_string())),
        KeyspaceType::Uint64 => {
            if encoded.len() != 8 {
                return Err(Error::InvalidData(format!(
                    "uint64 key must be 8 bytes, got {}",
                    encoded.len()
                )));
            }
            Ok(BigEndian::read_u64(encoded).to_string())
        }
    }
}

/// Compare two encoded partition keys.
///
/// Encoding is order-preserving, so comparison is bytewise regardless of
/// keyspace; the keyspace parameter documents intent at call sites that
/// compare user-supplied keys.
pub fn compare_partition_keys(_keyspace: KeyspaceType, a: &[u8], b: &[u8]) -> Ordering {
    a.cmp(b)
}

/// A half-open `[begin, end)` range of encoded partition keys.
///
/// An empty `begin` means the range starts at the beginning of the keyspace;
/// an empty `end` means it extends to the end.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRange {
    pub begin: Vec<u8>,
    pub end: Vec<u8>,
}

impl KeyRange {
    pub fn new(begin: Vec<u8>, end: Vec<u8>) -> Self {
        Self { begin, end }
    }

    /// The full keyspace.
    pub fn unbounded() -> Self {
        Self::default()
    }

    /// Whether an encoded key falls inside this range.
    pub fn contains(&self, key: &[u8]) -> bool {
        if key < self.begin.as_slice() {
            return false;
        }
        self.end.is_empty() || key < self.end.as_slice()
    }

    /// Whether the range has an open upper bound.
    pub fn is_end_open(&self) -> bool {
        self.end.is_empty()
    }
}
