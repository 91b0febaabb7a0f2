//! Binary layout of log records and checkpoint files
//!
//! Record = RecordHeader (16 bytes) + payload
//! payload = key_len(u32 LE) + value_len(u32 LE) + key_bytes + value_bytes
//!
//! The same record encoding is used for WAL segments and for the body of a
//! checkpoint file, so a single scanner recovers both.

use std::path::Path;

use crate::error::{KvError, KvResult};

/// Magic bytes opening every record: "KVPL"
pub const RECORD_MAGIC: [u8; 4] = *b"KVPL";

/// Magic bytes opening a checkpoint file: "KVPS"
pub const CHECKPOINT_MAGIC: [u8; 4] = *b"KVPS";

/// Record header size in bytes
pub const HEADER_SIZE: usize = 16;

/// Checkpoint file header size in bytes
pub const CHECKPOINT_HEADER_SIZE: usize = 32;

/// Checkpoint format version
pub const CHECKPOINT_VERSION: u32 = 1;

/// Fixed part of the payload (key_len + value_len)
const PAYLOAD_PREFIX: usize = 8;

/// Log operation types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Operation {
    /// Insert or replace a record
    Put = 1,
    /// Remove a record
    Remove = 2,
}

impl Operation {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Operation::Put),
            2 => Some(Operation::Remove),
            _ => None,
        }
    }
}

/// Fixed-size header for each record
///
/// Layout:
///   [0..4]   magic:    "KVPL"
///   [4..8]   length:   u32 LE - payload length in bytes
///   [8..12]  checksum: u32 LE - CRC32C of payload bytes
///   [12]     op:       u8
///   [13..16] reserved, zero
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub magic: [u8; 4],
    pub length: u32,
    pub checksum: u32,
    pub op: u8,
}

impl RecordHeader {
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.magic);
        buf[4..8].copy_from_slice(&self.length.to_le_bytes());
        buf[8..12].copy_from_slice(&self.checksum.to_le_bytes());
        buf[12] = self.op;
        buf
    }

    pub fn from_bytes(bytes: &[u8; HEADER_SIZE]) -> Self {
        Self {
            magic: [bytes[0], bytes[1], bytes[2], bytes[3]],
            length: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            checksum: u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
            op: bytes[12],
        }
    }
}

/// A decoded record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub op: Operation,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// Serialize one record.
///
/// Sizes are validated by the caller against the pool limits; this only
/// guards the u32 length fields.
pub fn encode_record(op: Operation, key: &[u8], value: &[u8]) -> KvResult<Vec<u8>> {
    let payload_len = PAYLOAD_PREFIX as u64 + key.len() as u64 + value.len() as u64;
    if payload_len > u32::MAX as u64 {
        return Err(KvError::OversizedEntry {
            entry_size: payload_len,
            max_size: u32::MAX as u64,
            component: "record",
        });
    }

    let mut buf = Vec::with_capacity(HEADER_SIZE + payload_len as usize);
    buf.extend_from_slice(&[0u8; HEADER_SIZE]);
    buf.extend_from_slice(&(key.len() as u32).to_le_bytes());
    buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
    buf.extend_from_slice(key);
    buf.extend_from_slice(value);

    let checksum = crc32c::crc32c(&buf[HEADER_SIZE..]);
    let header = RecordHeader {
        magic: RECORD_MAGIC,
        length: payload_len as u32,
        checksum,
        op: op as u8,
    };
    buf[..HEADER_SIZE].copy_from_slice(&header.to_bytes());
    Ok(buf)
}

/// Outcome of decoding at one offset of a buffer.
#[derive(Debug)]
pub enum Decoded {
    /// A valid record spanning `len` bytes
    Record { record: LogRecord, len: usize },
    /// The buffer ends inside a record started at this offset
    Torn,
}

/// Decode the record starting at `offset` of `buf`.
///
/// `path` only feeds error context.
pub fn decode_record(buf: &[u8], offset: usize, path: &Path) -> KvResult<Decoded> {
    let rest = &buf[offset..];
    if rest.len() < HEADER_SIZE {
        return Ok(Decoded::Torn);
    }

    let mut header_bytes = [0u8; HEADER_SIZE];
    header_bytes.copy_from_slice(&rest[..HEADER_SIZE]);
    let header = RecordHeader::from_bytes(&header_bytes);

    if header.magic != RECORD_MAGIC {
        return Err(KvError::WalCorrupted {
            path: path.to_path_buf(),
            offset: offset as u64,
            reason: format!("bad magic {:02x?}", header.magic),
        });
    }

    let total = HEADER_SIZE + header.length as usize;
    if rest.len() < total {
        return Ok(Decoded::Torn);
    }

    let payload = &rest[HEADER_SIZE..total];
    let actual = crc32c::crc32c(payload);
    if actual != header.checksum {
        return Err(KvError::ChecksumMismatch {
            path: path.to_path_buf(),
            expected: header.checksum,
            actual,
            offset: offset as u64,
        });
    }

    let op = Operation::from_byte(header.op).ok_or_else(|| KvError::WalCorrupted {
        path: path.to_path_buf(),
        offset: offset as u64 + 12,
        reason: format!("invalid operation type: {}", header.op),
    })?;

    if payload.len() < PAYLOAD_PREFIX {
        return Err(KvError::WalCorrupted {
            path: path.to_path_buf(),
            offset: offset as u64,
            reason: "payload too short for length fields".into(),
        });
    }
    let key_len = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]) as usize;
    let value_len = u32::from_le_bytes([payload[4], payload[5], payload[6], payload[7]]) as usize;
    let key_end = PAYLOAD_PREFIX + key_len;
    if key_end + value_len != payload.len() {
        return Err(KvError::WalCorrupted {
            path: path.to_path_buf(),
            offset: offset as u64,
            reason: format!(
                "length fields key({}) + value({}) disagree with payload of {} bytes",
                key_len,
                value_len,
                payload.len()
            ),
        });
    }

    Ok(Decoded::Record {
        record: LogRecord {
            op,
            key: payload[PAYLOAD_PREFIX..key_end].to_vec(),
            value: payload[key_end..].to_vec(),
        },
        len: total,
    })
}

/// Scan forward for the next record magic, used to resync after corruption.
pub fn find_next_magic(buf: &[u8], start: usize) -> Option<usize> {
    if start >= buf.len() {
        return None;
    }
    buf[start..]
        .windows(RECORD_MAGIC.len())
        .position(|w| w == RECORD_MAGIC)
        .map(|i| start + i)
}

/// Checkpoint file header
///
/// Layout:
///   [0..4]   magic:     "KVPS"
///   [4..8]   version:   u32 LE
///   [8..16]  segment:   u64 LE - first WAL segment not covered by this checkpoint
///   [16..24] records:   u64 LE - number of records in the body
///   [24..28] checksum:  u32 LE - CRC32C of bytes [0..24]
///   [28..32] reserved, zero
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointHeader {
    pub segment: u64,
    pub records: u64,
}

impl CheckpointHeader {
    pub fn to_bytes(&self) -> [u8; CHECKPOINT_HEADER_SIZE] {
        let mut buf = [0u8; CHECKPOINT_HEADER_SIZE];
        buf[0..4].copy_from_slice(&CHECKPOINT_MAGIC);
        buf[4..8].copy_from_slice(&CHECKPOINT_VERSION.to_le_bytes());
        buf[8..16].copy_from_slice(&self.segment.to_le_bytes());
        buf[16..24].copy_from_slice(&self.records.to_le_bytes());
        let checksum = crc32c::crc32c(&buf[0..24]);
        buf[24..28].copy_from_slice(&checksum.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8], path: &Path) -> KvResult<Self> {
        if buf.len() < CHECKPOINT_HEADER_SIZE {
            return Err(KvError::TornWrite {
                path: path.to_path_buf(),
                expected_size: CHECKPOINT_HEADER_SIZE as u32,
                available_bytes: buf.len() as u64,
                offset: 0,
            });
        }
        if buf[0..4] != CHECKPOINT_MAGIC {
            return Err(KvError::WalCorrupted {
                path: path.to_path_buf(),
                offset: 0,
                reason: "not a checkpoint file".into(),
            });
        }
        let version = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
        if version != CHECKPOINT_VERSION {
            return Err(KvError::WalCorrupted {
                path: path.to_path_buf(),
                offset: 4,
                reason: format!("unsupported checkpoint version {}", version),
            });
        }
        let expected = u32::from_le_bytes([buf[24], buf[25], buf[26], buf[27]]);
        let actual = crc32c::crc32c(&buf[0..24]);
        if expected != actual {
            return Err(KvError::ChecksumMismatch {
                path: path.to_path_buf(),
                expected,
                actual,
                offset: 0,
            });
        }
        let mut segment = [0u8; 8];
        segment.copy_from_slice(&buf[8..16]);
        let mut records = [0u8; 8];
        records.copy_from_slice(&buf[16..24]);
        Ok(Self {
            segment: u64::from_le_bytes(segment),
            records: u64::from_le_bytes(records),
        })
    }
}
