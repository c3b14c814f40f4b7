//! On-disk layout: the segment header that precedes all records, and the
//! per-record frame header that precedes each payload.
use std::convert::TryInto;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

use crate::{Error, Result};

/// Maximum size of a single segment file.
pub const CHUNK_SIZE: usize = 64 * 1024 * 1024;

/// Bytes of per-record frame header (`length` + `flags`).
pub const OBJECT_HEADER_BYTES: usize = 8;

/// Bytes of the segment header (`num_entries` + `uncompressed_bytes`).
pub const SEGMENT_HEADER_BYTES: usize = 8;

pub const COUNT_OFFSET: usize = 0;
pub const SIZE_OFFSET: usize = 4;

/// Largest payload a single `offer` may carry, as named by the wire-format
/// contract: one 4-byte field of headroom plus the record frame header.
pub const MAX_RECORD_BYTES: usize = CHUNK_SIZE - 4 - OBJECT_HEADER_BYTES;

/// Usable capacity for records when partitioning a `push` batch.
pub const PUSH_BATCH_CAPACITY: usize = CHUNK_SIZE - 4;

/// Frame flag bit indicating the payload was stored via the block
/// compressor.
pub const FLAG_COMPRESSED: i32 = 0b01;

/// The two leading i32 fields of a segment file: total record count and the
/// sum of uncompressed payload bytes across all records.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SegmentHeader {
    pub num_entries: i32,
    pub uncompressed_bytes: i32,
}

impl SegmentHeader {
    pub fn encode(&self) -> [u8; SEGMENT_HEADER_BYTES] {
        let mut buf = [0u8; SEGMENT_HEADER_BYTES];
        buf[COUNT_OFFSET..COUNT_OFFSET + 4].copy_from_slice(&self.num_entries.to_le_bytes());
        buf[SIZE_OFFSET..SIZE_OFFSET + 4].copy_from_slice(&self.uncompressed_bytes.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8; SEGMENT_HEADER_BYTES]) -> Self {
        let num_entries = i32::from_le_bytes(
            buf[COUNT_OFFSET..COUNT_OFFSET + 4].try_into().expect("slice length"),
        );
        let uncompressed_bytes = i32::from_le_bytes(
            buf[SIZE_OFFSET..SIZE_OFFSET + 4].try_into().expect("slice length"),
        );
        Self { num_entries, uncompressed_bytes }
    }

    /// Read the header from the start of `file`, leaving the cursor
    /// positioned just past it.
    pub fn read_from(file: &mut File) -> Result<Self> {
        file.seek(SeekFrom::Start(0))?;
        let mut buf = [0u8; SEGMENT_HEADER_BYTES];
        file.read_exact(&mut buf)?;
        Ok(Self::decode(&buf))
    }

    /// Rewrite the header in place, restoring the cursor to its prior
    /// position afterwards.
    pub fn write_to(&self, file: &mut File) -> Result<()> {
        let resume_at = file.stream_position()?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&self.encode())?;
        file.seek(SeekFrom::Start(resume_at))?;
        Ok(())
    }
}

/// Per-record frame header: the length of the stored (possibly compressed)
/// payload, and a flags word.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecordFrameHeader {
    pub stored_length: i32,
    pub flags: i32,
}

impl RecordFrameHeader {
    pub fn is_compressed(&self) -> bool {
        self.flags & FLAG_COMPRESSED != 0
    }

    pub fn encode(&self) -> [u8; OBJECT_HEADER_BYTES] {
        let mut buf = [0u8; OBJECT_HEADER_BYTES];
        buf[0..4].copy_from_slice(&self.stored_length.to_le_bytes());
        buf[4..8].copy_from_slice(&self.flags.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8; OBJECT_HEADER_BYTES]) -> Result<Self> {
        let stored_length = i32::from_le_bytes(buf[0..4].try_into().expect("slice length"));
        let flags = i32::from_le_bytes(buf[4..8].try_into().expect("slice length"));
        if stored_length < 0 {
            return Err(Error::Corrupt(format!(
                "negative record length {stored_length} in frame header"
            )));
        }
        Ok(Self { stored_length, flags })
    }
}
