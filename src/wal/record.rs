//! On-disk record codec for the write-ahead log.
//!
//! One record is a fixed big-endian frame:
//!
//! ```text
//! [ lsn: u64 ][ op_type: u8 ][ len: u32 ][ payload: len bytes ][ checksum: u32 ][ timestamp: i64 ]
//! ```
//!
//! The checksum is CRC32/IEEE over the on-disk payload bytes. For a
//! compressed log the payload is compressed before framing, so the checksum
//! covers the compressed bytes and recovery never needs to decompress a
//! record it cannot verify.

use std::io::{self, Read};

use byteorder::{BigEndian, ByteOrder};
use crc32fast::Hasher;
use serde::{Deserialize, Serialize};

use crate::errors::{GraphdError, StorageError};

/// Bytes before the payload: lsn(8) + op_type(1) + len(4).
pub const RECORD_PREFIX_SIZE: usize = 13;
/// Bytes after the payload: checksum(4) + timestamp(8).
pub const RECORD_SUFFIX_SIZE: usize = 12;

/// Default ceiling on a single record payload.
pub const DEFAULT_MAX_PAYLOAD_LEN: usize = 16 * 1024 * 1024;

/// Operation carried by a WAL record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum OpType {
    CreateNode = 1,
    UpdateNode = 2,
    DeleteNode = 3,
    CreateEdge = 4,
    UpdateEdge = 5,
    DeleteEdge = 6,
    CreatePropertyIndex = 7,
    DropPropertyIndex = 8,
}

impl TryFrom<u8> for OpType {
    type Error = GraphdError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::CreateNode),
            2 => Ok(Self::UpdateNode),
            3 => Ok(Self::DeleteNode),
            4 => Ok(Self::CreateEdge),
            5 => Ok(Self::UpdateEdge),
            6 => Ok(Self::DeleteEdge),
            7 => Ok(Self::CreatePropertyIndex),
            8 => Ok(Self::DropPropertyIndex),
            _ => Err(StorageError(format!("invalid op type: {value}")).into()),
        }
    }
}

/// A decoded WAL record.
///
/// `payload` holds the logical bytes (decompressed for a compressed log);
/// `checksum` is the CRC32 that was stored on disk, computed over the on-disk
/// payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub lsn: u64,
    pub op_type: OpType,
    pub payload: Vec<u8>,
    pub checksum: u32,
    pub timestamp: i64,
}

impl Record {
    /// Build a record, computing the checksum over `payload` as stored.
    pub fn new(lsn: u64, op_type: OpType, payload: Vec<u8>, timestamp: i64) -> Self {
        let mut hasher = Hasher::new();
        hasher.update(&payload);
        let checksum = hasher.finalize();
        Self {
            lsn,
            op_type,
            payload,
            checksum,
            timestamp,
        }
    }
}

/// Per-log payload transform. The choice is a property of the whole log file
/// (selected by file name at open), never of an individual record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Plain,
    Snappy,
}

impl Codec {
    pub(crate) fn encode(&self, logical: &[u8]) -> Result<Vec<u8>, GraphdError> {
        match self {
            Codec::Plain => Ok(logical.to_vec()),
            Codec::Snappy => snap::raw::Encoder::new()
                .compress_vec(logical)
                .map_err(|e| StorageError(format!("snappy compression failed: {e}")).into()),
        }
    }

    pub(crate) fn decode(&self, on_disk: &[u8]) -> Result<Vec<u8>, GraphdError> {
        match self {
            Codec::Plain => Ok(on_disk.to_vec()),
            Codec::Snappy => snap::raw::Decoder::new()
                .decompress_vec(on_disk)
                .map_err(|e| GraphdError::CorruptLog(format!("snappy decompression failed: {e}"))),
        }
    }
}

/// Result of reading one record from a log stream.
#[derive(Debug)]
pub enum DecodeOutcome {
    Record(Record),
    /// Clean end of log: zero bytes available where a record would start.
    Eof,
    /// The stream ends mid-record or fails verification. Replay stops here.
    Corrupt(String),
}

/// Encode one record frame into `buf`. The payload passed here must already
/// be the on-disk form (post-compression for a compressed log).
pub fn encode_record(
    buf: &mut Vec<u8>,
    lsn: u64,
    op_type: OpType,
    on_disk_payload: &[u8],
    timestamp: i64,
) {
    let mut hasher = Hasher::new();
    hasher.update(on_disk_payload);
    let checksum = hasher.finalize();

    buf.reserve(RECORD_PREFIX_SIZE + on_disk_payload.len() + RECORD_SUFFIX_SIZE);
    buf.extend_from_slice(&lsn.to_be_bytes());
    buf.push(op_type as u8);
    buf.extend_from_slice(&(on_disk_payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(on_disk_payload);
    buf.extend_from_slice(&checksum.to_be_bytes());
    buf.extend_from_slice(&timestamp.to_be_bytes());
}

/// Size of the full frame for a payload of `payload_len` on-disk bytes.
pub fn frame_size(payload_len: usize) -> usize {
    RECORD_PREFIX_SIZE + payload_len + RECORD_SUFFIX_SIZE
}

/// Read exactly one record from `reader`.
///
/// Corruption never surfaces as an `Err`: a short read in any field, a
/// payload shorter than its declared length, an unknown op type, an oversized
/// length, and a checksum mismatch all yield `DecodeOutcome::Corrupt`. `Err`
/// is reserved for genuine I/O failures underneath the log.
pub fn decode_record<R: Read>(
    reader: &mut R,
    codec: Codec,
    max_payload_len: usize,
) -> Result<DecodeOutcome, GraphdError> {
    let mut prefix = [0u8; RECORD_PREFIX_SIZE];
    match read_exact_or_eof(reader, &mut prefix)? {
        ReadOutcome::Eof => return Ok(DecodeOutcome::Eof),
        ReadOutcome::Short(n) => {
            return Ok(DecodeOutcome::Corrupt(format!(
                "short record prefix: {n} of {RECORD_PREFIX_SIZE} bytes"
            )))
        }
        ReadOutcome::Full => {}
    }

    let lsn = BigEndian::read_u64(&prefix[0..8]);
    let op_byte = prefix[8];
    let len = BigEndian::read_u32(&prefix[9..13]) as usize;

    let op_type = match OpType::try_from(op_byte) {
        Ok(op) => op,
        Err(_) => {
            return Ok(DecodeOutcome::Corrupt(format!(
                "invalid op type {op_byte} at lsn {lsn}"
            )))
        }
    };

    if len > max_payload_len {
        return Ok(DecodeOutcome::Corrupt(format!(
            "payload length {len} exceeds limit {max_payload_len} at lsn {lsn}"
        )));
    }

    let mut on_disk = vec![0u8; len];
    match read_exact_or_eof(reader, &mut on_disk)? {
        ReadOutcome::Full => {}
        ReadOutcome::Eof | ReadOutcome::Short(_) => {
            return Ok(DecodeOutcome::Corrupt(format!(
                "payload shorter than declared length {len} at lsn {lsn}"
            )))
        }
    }

    let mut suffix = [0u8; RECORD_SUFFIX_SIZE];
    match read_exact_or_eof(reader, &mut suffix)? {
        ReadOutcome::Full => {}
        ReadOutcome::Eof | ReadOutcome::Short(_) => {
            return Ok(DecodeOutcome::Corrupt(format!(
                "short record suffix at lsn {lsn}"
            )))
        }
    }

    let stored_checksum = BigEndian::read_u32(&suffix[0..4]);
    let timestamp = BigEndian::read_i64(&suffix[4..12]);

    let mut hasher = Hasher::new();
    hasher.update(&on_disk);
    let computed = hasher.finalize();
    if computed != stored_checksum {
        return Ok(DecodeOutcome::Corrupt(format!(
            "checksum mismatch at lsn {lsn}: stored {stored_checksum:08x}, computed {computed:08x}"
        )));
    }

    let payload = match codec.decode(&on_disk) {
        Ok(bytes) => bytes,
        Err(e) => {
            return Ok(DecodeOutcome::Corrupt(format!(
                "payload decode failed at lsn {lsn}: {e}"
            )))
        }
    };

    Ok(DecodeOutcome::Record(Record {
        lsn,
        op_type,
        payload,
        checksum: stored_checksum,
        timestamp,
    }))
}

enum ReadOutcome {
    Full,
    Eof,
    Short(usize),
}

fn read_exact_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<ReadOutcome, GraphdError> {
    let mut filled = 0usize;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(ReadOutcome::Eof),
            Ok(0) => return Ok(ReadOutcome::Short(filled)),
            Ok(n) => filled += n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(ReadOutcome::Full)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn encode_one(lsn: u64, op: OpType, payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        encode_record(&mut buf, lsn, op, payload, 1_700_000_000);
        buf
    }

    #[test]
    fn record_round_trip() {
        let buf = encode_one(7, OpType::CreateNode, b"node payload");
        let mut cursor = Cursor::new(buf);

        match decode_record(&mut cursor, Codec::Plain, DEFAULT_MAX_PAYLOAD_LEN).unwrap() {
            DecodeOutcome::Record(record) => {
                assert_eq!(record.lsn, 7);
                assert_eq!(record.op_type, OpType::CreateNode);
                assert_eq!(record.payload, b"node payload");
                assert_eq!(record.timestamp, 1_700_000_000);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }

        match decode_record(&mut cursor, Codec::Plain, DEFAULT_MAX_PAYLOAD_LEN).unwrap() {
            DecodeOutcome::Eof => {}
            other => panic!("expected eof, got {other:?}"),
        }
    }

    #[test]
    fn empty_payload_round_trip() {
        let buf = encode_one(1, OpType::DropPropertyIndex, b"");
        let mut cursor = Cursor::new(buf);
        match decode_record(&mut cursor, Codec::Plain, DEFAULT_MAX_PAYLOAD_LEN).unwrap() {
            DecodeOutcome::Record(record) => assert!(record.payload.is_empty()),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn checksum_mismatch_is_corrupt() {
        let mut buf = encode_one(3, OpType::CreateEdge, b"edge payload");
        let payload_start = RECORD_PREFIX_SIZE;
        buf[payload_start] ^= 0xff;

        let mut cursor = Cursor::new(buf);
        match decode_record(&mut cursor, Codec::Plain, DEFAULT_MAX_PAYLOAD_LEN).unwrap() {
            DecodeOutcome::Corrupt(reason) => assert!(reason.contains("checksum mismatch")),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn truncated_payload_is_corrupt() {
        let buf = encode_one(3, OpType::CreateEdge, b"edge payload");
        let cut = RECORD_PREFIX_SIZE + 4;
        let mut cursor = Cursor::new(buf[..cut].to_vec());
        match decode_record(&mut cursor, Codec::Plain, DEFAULT_MAX_PAYLOAD_LEN).unwrap() {
            DecodeOutcome::Corrupt(reason) => assert!(reason.contains("shorter than declared")),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn truncated_prefix_is_corrupt() {
        let buf = encode_one(3, OpType::CreateNode, b"x");
        let mut cursor = Cursor::new(buf[..5].to_vec());
        match decode_record(&mut cursor, Codec::Plain, DEFAULT_MAX_PAYLOAD_LEN).unwrap() {
            DecodeOutcome::Corrupt(reason) => assert!(reason.contains("short record prefix")),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn invalid_op_type_is_corrupt() {
        let mut buf = encode_one(3, OpType::CreateNode, b"x");
        buf[8] = 0xEE;
        let mut cursor = Cursor::new(buf);
        match decode_record(&mut cursor, Codec::Plain, DEFAULT_MAX_PAYLOAD_LEN).unwrap() {
            DecodeOutcome::Corrupt(reason) => assert!(reason.contains("invalid op type")),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn oversized_length_is_corrupt() {
        let buf = encode_one(3, OpType::CreateNode, b"abcdef");
        let mut cursor = Cursor::new(buf);
        match decode_record(&mut cursor, Codec::Plain, 4).unwrap() {
            DecodeOutcome::Corrupt(reason) => assert!(reason.contains("exceeds limit")),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn snappy_codec_round_trips() {
        let logical = vec![42u8; 4096];
        let on_disk = Codec::Snappy.encode(&logical).unwrap();
        assert!(on_disk.len() < logical.len());

        let buf = {
            let mut buf = Vec::new();
            encode_record(&mut buf, 1, OpType::CreateNode, &on_disk, 0);
            buf
        };
        let mut cursor = Cursor::new(buf);
        match decode_record(&mut cursor, Codec::Snappy, DEFAULT_MAX_PAYLOAD_LEN).unwrap() {
            DecodeOutcome::Record(record) => assert_eq!(record.payload, logical),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn op_type_rejects_unknown_discriminator() {
        assert!(OpType::try_from(0).is_err());
        assert!(OpType::try_from(9).is_err());
        assert_eq!(OpType::try_from(4).unwrap(), OpType::CreateEdge);
    }
}
