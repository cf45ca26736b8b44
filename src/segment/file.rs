//! Segment data file reading and writing.
//!
//! ## Data File Layout
//!
//! ```text
//! +--------------------+
//! | Header (22 bytes)  |
//! +--------------------+
//! | Record Frame 1     |
//! +--------------------+
//! | Record Frame 2     |
//! +--------------------+
//! | ...                |
//! +--------------------+
//! ```
//!
//! ## Record Frame Format
//!
//! ```text
//! +-----------+--------------------+-----------+
//! |length:u32 | serialized_record  |crc32:u32  |
//! +-----------+--------------------+-----------+
//! | 4 bytes   | variable length    | 4 bytes   |
//! +-----------+--------------------+-----------+
//! ```
//!
//! Records are written in record-id order. Big-endian encoding and a
//! CRC-32/iSCSI per frame, so corruption is caught at the frame where it
//! happened rather than surfacing as garbage records downstream.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::ids::RecordId;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

const MAGIC: &[u8; 4] = b"EMBS";
const FORMAT_VERSION: u16 = 1;

/// Header size: magic (4) + format version (2) + record count (8) +
/// reserved (8).
pub const HEADER_SIZE: usize = 22;

/// A record as stored inside a segment: the logical record plus the commit
/// sequence it was assigned.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub id: RecordId,
    pub version: u64,
    pub sequence: u64,
    pub partition_key: Vec<u8>,
    pub payload: Vec<u8>,
}

/// Writes a new segment data file.
///
/// Callers must append records in ascending record-id order and call
/// [`SegmentWriter::finalize`] when done; a writer that is dropped without
/// finalizing leaves a file with a zero record count, which readers reject.
pub struct SegmentWriter {
    file: File,
    writer: BufWriter<File>,
    path: PathBuf,
    record_count: u64,
    offset: u64,
}

impl SegmentWriter {
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file.try_clone()?);
        write_header(&mut writer, 0)?;
        Ok(Self {
            file,
            writer,
            path: path.to_path_buf(),
            record_count: 0,
            offset: HEADER_SIZE as u64,
        })
    }

    /// Append one record frame. Returns the frame's byte offset, which the
    /// skip index records for targeted reads.
    pub fn append(&mut self, record: &StoredRecord) -> Result<u64> {
        let frame_offset = self.offset;
        let body = bincode::serialize(record)?;
        let checksum = CRC32.checksum(&body);

        self.writer.write_u32::<BigEndian>(body.len() as u32)?;
        self.writer.write_all(&body)?;
        self.writer.write_u32::<BigEndian>(checksum)?;

        self.record_count += 1;
        self.offset += 4 + body.len() as u64 + 4;
        Ok(frame_offset)
    }

    /// Flush frames, rewrite the header with the final record count, and
    /// sync the file. Returns the file's size in bytes.
    pub fn finalize(mut self) -> Result<u64> {
        self.writer.flush()?;

        let mut file = self.file.try_clone()?;
        file.seek(SeekFrom::Start(0))?;
        let mut head = BufWriter::new(file);
        write_header(&mut head, self.record_count)?;
        head.flush()?;
        self.file.sync_all()?;

        Ok(std::fs::metadata(&self.path)?.len())
    }
}

fn write_header(w: &mut impl Write, record_count: u64) -> Result<()> {
    w.write_all(MAGIC)?;
    w.write_u16::<BigEndian>(FORMAT_VERSION)?;
    w.write_u64::<BigEndian>(record_count)?;
    w.write_u64::<BigEndian>(0)?; // reserved
    Ok(())
}

/// Reads an existing segment data file.
pub struct SegmentReader {
    file: File,
    record_count: u64,
}

impl SegmentReader {
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = File::open(path)?;
        let record_count = read_header(&mut file)?;
        if record_count == 0 {
            return Err(Error::InvalidData(format!(
                "segment {} was never finalized",
                path.display()
            )));
        }
        Ok(Self { file, record_count })
    }

    pub fn record_count(&self) -> u64 {
        self.record_count
    }

    /// Sequential iterator over all record frames.
    pub fn iter(&self) -> Result<SegmentIterator> {
        let mut reader = BufReader::new(self.file.try_clone()?);
        reader.seek(SeekFrom::Start(HEADER_SIZE as u64))?;
        Ok(SegmentIterator {
            reader,
            remaining: self.record_count,
        })
    }

    /// Read the single record frame starting at the given byte offset, as
    /// recorded by the skip index.
    pub fn read_at(&self, offset: u64) -> Result<StoredRecord> {
        let mut reader = BufReader::new(self.file.try_clone()?);
        reader.seek(SeekFrom::Start(offset))?;
        read_frame(&mut reader)
    }
}

fn read_header(file: &mut File) -> Result<u64> {
    let mut magic = [0u8; 4];
    file.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(Error::InvalidData("bad segment magic".to_string()));
    }
    let version = file.read_u16::<BigEndian>()?;
    if version != FORMAT_VERSION {
        return Err(Error::InvalidData(format!(
            "unsupported segment format version {version}"
        )));
    }
    let record_count = file.read_u64::<BigEndian>()?;
    let _reserved = file.read_u64::<BigEndian>()?;
    Ok(record_count)
}

fn read_frame(reader: &mut impl Read) -> Result<StoredRecord> {
    let len = reader.read_u32::<BigEndian>()? as usize;
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    let stored_checksum = reader.read_u32::<BigEndian>()?;
    if CRC32.checksum(&body) != stored_checksum {
        return Err(Error::InvalidData(
            "segment record frame checksum mismatch".to_string(),
        ));
    }
    Ok(bincode::deserialize(&body)?)
}

pub struct SegmentIterator {
    reader: BufReader<File>,
    remaining: u64,
}

impl Iterator for SegmentIterator {
    type Item = Result<StoredRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        Some(read_frame(&mut self.reader))
    }
}
