//! Records and record batches.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::ids::RecordId;

/// Versions are microsecond wallclock timestamps. Anything at or below this
/// floor (mid-2014) cannot be a valid version and is rejected at the insert
/// boundary rather than asserted deep inside the write path.
pub const MIN_RECORD_VERSION: u64 = 1_400_000_000_000_000;

/// A single schema-conforming record.
///
/// The columnar payload encoding is opaque to the storage engine; the
/// partition key is carried alongside in its encoded, order-preserving form
/// so that splits can find a median without decoding payloads.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    pub version: u64,
    pub partition_key: Vec<u8>,
    pub payload: Vec<u8>,
}

impl Record {
    pub fn new(id: RecordId, version: u64, partition_key: Vec<u8>, payload: Vec<u8>) -> Self {
        Self {
            id,
            version,
            partition_key,
            payload,
        }
    }
}

/// Validate a batch before it enters the write path.
///
/// Two records with equal id are legal (the arena reconciles them by
/// version); a version at or below the epoch floor is not.
pub fn validate_batch(records: &[Record]) -> Result<()> {
    for record in records {
        if record.version <= MIN_RECORD_VERSION {
            return Err(Error::InvalidInput(format!(
                "record {} version {} is below the epoch floor",
                record.id, record.version
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(seed: &[u8], version: u64) -> Record {
        Record::new(RecordId::from_content(seed), version, seed.to_vec(), vec![1, 2, 3])
    }

    #[test]
    fn test_validate_accepts_wallclock_versions() {
        let batch = vec![record(b"a", MIN_RECORD_VERSION + 1), record(b"b", 1_500_000_000_000_000)];
        assert!(validate_batch(&batch).is_ok());
    }

    #[test]
    fn test_validate_rejects_epoch_floor() {
        let batch = vec![record(b"a", MIN_RECORD_VERSION)];
        assert!(matches!(
            validate_batch(&batch),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_validate_rejects_zero() {
        let batch = vec![record(b"a", 0)];
        assert!(validate_batch(&batch).is_err());
    }
}
