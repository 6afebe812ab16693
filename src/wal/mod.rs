//! Write-ahead log engine.
//!
//! A single append-only file per log, records laid out back-to-back with no
//! file header. Opening a log replays it once to recover the last assigned
//! LSN and truncates any corrupt tail left by a crash. Every successful
//! `append` implies the record has been fsynced.
//!
//! Three concrete log flavors share the same operation set: [`Wal`] (plain),
//! [`GroupCommitWal`](group_commit::GroupCommitWal) (wraps a `Wal`, one fsync
//! per batch), and [`CompressedWal`](compressed::CompressedWal)
//! (Snappy-framed payloads). Composition is static; none of them is a trait
//! object.

pub mod compressed;
pub mod group_commit;
pub mod record;

use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::errors::{GraphdError, StorageError};
use record::{decode_record, encode_record, Codec, DecodeOutcome, OpType, Record};

/// Plain log file name.
pub const WAL_FILE_NAME: &str = "wal.log";
/// Compressed-variant log file name. The name is the compression
/// discriminator; the two files must never coexist in one data directory.
pub const COMPRESSED_WAL_FILE_NAME: &str = "wal_compressed.log";

/// Tuning knobs shared by every log flavor.
#[derive(Debug, Clone)]
pub struct WalOptions {
    /// Ceiling on a single logical payload.
    pub max_payload_len: usize,
}

impl Default for WalOptions {
    fn default() -> Self {
        Self {
            max_payload_len: record::DEFAULT_MAX_PAYLOAD_LEN,
        }
    }
}

struct WalInner {
    file: File,
    path: PathBuf,
    write_buffer: Vec<u8>,
    codec: Codec,
    max_payload_len: usize,
    current_lsn: u64,
    end_offset: u64,
    closed: bool,
}

/// Append-only write-ahead log with strict serial LSNs.
///
/// One mutex serializes `append`, `replay`, `truncate`, and `close`;
/// `current_lsn` reads an atomic mirror and never takes the lock.
pub struct Wal {
    inner: Mutex<WalInner>,
    lsn: AtomicU64,
}

impl Wal {
    /// Open or create the plain log in `dir`, recovering the last LSN and
    /// truncating any corrupt tail.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self, GraphdError> {
        Self::open_with(dir, WalOptions::default())
    }

    pub fn open_with<P: AsRef<Path>>(dir: P, options: WalOptions) -> Result<Self, GraphdError> {
        Self::open_file(dir.as_ref(), WAL_FILE_NAME, COMPRESSED_WAL_FILE_NAME, Codec::Plain, options)
    }

    pub(crate) fn open_file(
        dir: &Path,
        file_name: &str,
        sibling_name: &str,
        codec: Codec,
        options: WalOptions,
    ) -> Result<Self, GraphdError> {
        std::fs::create_dir_all(dir)?;

        let sibling = dir.join(sibling_name);
        if sibling.exists() {
            return Err(GraphdError::InvalidConfig(format!(
                "conflicting log variant already present: {}",
                sibling.display()
            )));
        }

        let path = dir.join(file_name);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let (current_lsn, end_offset, recovered, truncate_reason) =
            scan_log_tail(&path, codec, options.max_payload_len)?;

        let file_len = file.metadata()?.len();
        if end_offset < file_len {
            if let Some(reason) = truncate_reason {
                warn!(
                    recovered,
                    offset = end_offset,
                    "truncating corrupt WAL tail: {reason}"
                );
            }
            file.set_len(end_offset)?;
            file.sync_data()?;
        }
        file.seek(SeekFrom::Start(end_offset))?;

        Ok(Self {
            lsn: AtomicU64::new(current_lsn),
            inner: Mutex::new(WalInner {
                file,
                path,
                write_buffer: Vec::with_capacity(64 * 1024),
                codec,
                max_payload_len: options.max_payload_len,
                current_lsn,
                end_offset,
                closed: false,
            }),
        })
    }

    /// Append one record and fsync it. Returns the assigned LSN.
    pub fn append(&self, op_type: OpType, payload: &[u8]) -> Result<u64, GraphdError> {
        let mut inner = self.inner.lock();
        let start_lsn = inner.current_lsn;
        let start_offset = inner.end_offset;

        let lsn = match self.append_locked(&mut inner, op_type, payload) {
            Ok(lsn) => lsn,
            Err(e) => {
                rollback(&mut inner, start_lsn, start_offset);
                return Err(e);
            }
        };
        match inner.file.sync_data() {
            Ok(()) => {
                self.lsn.store(inner.current_lsn, Ordering::Release);
                Ok(lsn)
            }
            Err(e) => {
                rollback(&mut inner, start_lsn, start_offset);
                Err(e.into())
            }
        }
    }

    /// Append a batch of records with a single fsync.
    ///
    /// LSNs are contiguous in slice order. If any write or the fsync fails,
    /// the whole batch is rolled back and every entry shares the failure.
    pub fn append_batch(&self, entries: &[(OpType, Vec<u8>)]) -> Result<Vec<u64>, GraphdError> {
        if entries.is_empty() {
            return Ok(Vec::new());
        }

        let mut inner = self.inner.lock();
        let start_lsn = inner.current_lsn;
        let start_offset = inner.end_offset;

        let mut lsns = Vec::with_capacity(entries.len());
        for (op_type, payload) in entries {
            match self.append_locked(&mut inner, *op_type, payload) {
                Ok(lsn) => lsns.push(lsn),
                Err(e) => {
                    rollback(&mut inner, start_lsn, start_offset);
                    return Err(e);
                }
            }
        }

        match inner.file.sync_data() {
            Ok(()) => {
                self.lsn.store(inner.current_lsn, Ordering::Release);
                Ok(lsns)
            }
            Err(e) => {
                rollback(&mut inner, start_lsn, start_offset);
                Err(e.into())
            }
        }
    }

    /// Write one record into the file without syncing. Advances the
    /// in-memory LSN; the caller commits or rolls back.
    fn append_locked(
        &self,
        inner: &mut WalInner,
        op_type: OpType,
        payload: &[u8],
    ) -> Result<u64, GraphdError> {
        if inner.closed {
            return Err(GraphdError::AlreadyClosed);
        }
        if inner.current_lsn == u64::MAX {
            return Err(GraphdError::WalExhausted);
        }
        if payload.len() > inner.max_payload_len {
            return Err(StorageError(format!(
                "payload length {} exceeds limit {}",
                payload.len(),
                inner.max_payload_len
            ))
            .into());
        }

        let lsn = inner.current_lsn + 1;
        let on_disk = inner.codec.encode(payload)?;
        let timestamp = unix_timestamp();

        inner.write_buffer.clear();
        encode_record(&mut inner.write_buffer, lsn, op_type, &on_disk, timestamp);

        let frame_len = inner.write_buffer.len() as u64;
        inner.file.write_all(&inner.write_buffer)?;

        inner.current_lsn = lsn;
        inner.end_offset += frame_len;
        Ok(lsn)
    }

    /// Stream every valid record, in order, to `handler`.
    ///
    /// Stops at the first corrupt entry and logs how many records were
    /// recovered; corruption is not an error. The handler's first error is
    /// returned immediately.
    pub fn replay<F>(&self, mut handler: F) -> Result<(), GraphdError>
    where
        F: FnMut(Record) -> Result<(), GraphdError>,
    {
        let inner = self.inner.lock();
        if inner.closed {
            return Err(GraphdError::AlreadyClosed);
        }

        let read_file = File::open(&inner.path)?;
        let mut reader = BufReader::new(read_file);
        let codec = inner.codec;
        let max_payload_len = inner.max_payload_len;
        drop(inner);

        let mut count = 0u64;
        loop {
            match decode_record(&mut reader, codec, max_payload_len)? {
                DecodeOutcome::Record(record) => {
                    handler(record)?;
                    count += 1;
                }
                DecodeOutcome::Corrupt(reason) => {
                    warn!(recovered = count, "replay stopped at corrupt entry: {reason}");
                    break;
                }
                DecodeOutcome::Eof => break,
            }
        }
        info!(records = count, "WAL replay complete");
        Ok(())
    }

    /// Reset the log to empty by creating a fresh sibling file and atomically
    /// renaming it over the live one. On success `current_lsn` is 0.
    pub fn truncate(&self) -> Result<(), GraphdError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(GraphdError::AlreadyClosed);
        }
        inner.file.sync_data()?;

        let tmp_path = inner.path.with_extension("log.new");
        let tmp = File::create(&tmp_path)?;
        tmp.sync_all()?;

        if let Err(e) = std::fs::rename(&tmp_path, &inner.path) {
            let _ = std::fs::remove_file(&tmp_path);
            // The old log is still the live file; reopen it so the handle
            // stays usable.
            let mut file = OpenOptions::new().read(true).write(true).open(&inner.path)?;
            let end = file.seek(SeekFrom::End(0))?;
            inner.file = file;
            inner.end_offset = end;
            return Err(e.into());
        }

        let mut file = OpenOptions::new().read(true).write(true).open(&inner.path)?;
        file.seek(SeekFrom::Start(0))?;
        inner.file = file;
        inner.current_lsn = 0;
        inner.end_offset = 0;
        self.lsn.store(0, Ordering::Release);
        Ok(())
    }

    /// Last assigned LSN; 0 for a fresh or freshly truncated log.
    pub fn current_lsn(&self) -> u64 {
        self.lsn.load(Ordering::Acquire)
    }

    /// Flush, fsync, and close the log. A second close is an invariant
    /// violation and returns [`GraphdError::AlreadyClosed`].
    pub fn close(&self) -> Result<(), GraphdError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(GraphdError::AlreadyClosed);
        }
        inner.file.sync_all()?;
        inner.closed = true;
        Ok(())
    }

    /// Path of the live log file.
    pub fn path(&self) -> PathBuf {
        self.inner.lock().path.clone()
    }
}

/// Rewind the LSN counter and trim partially written frames, best effort, so
/// the in-memory state matches the durable prefix of the file.
fn rollback(inner: &mut WalInner, start_lsn: u64, start_offset: u64) {
    inner.current_lsn = start_lsn;
    let _ = inner.file.set_len(start_offset);
    let _ = inner.file.seek(SeekFrom::Start(start_offset));
    inner.end_offset = start_offset;
}

fn unix_timestamp() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(e) => -(e.duration().as_secs() as i64),
    }
}

/// Scan the log from the start, returning the last valid record's LSN, the
/// offset just past it, how many records were seen, and the corruption reason
/// if the tail is bad.
fn scan_log_tail(
    path: &Path,
    codec: Codec,
    max_payload_len: usize,
) -> Result<(u64, u64, u64, Option<String>), GraphdError> {
    let file = File::open(path)?;
    let mut reader = CountingReader::new(BufReader::new(file));

    let mut last_lsn = 0u64;
    let mut good_offset = 0u64;
    let mut count = 0u64;
    let truncate_reason = loop {
        match decode_record(&mut reader, codec, max_payload_len)? {
            DecodeOutcome::Record(record) => {
                last_lsn = record.lsn;
                good_offset = reader.bytes_read;
                count += 1;
            }
            DecodeOutcome::Corrupt(reason) => break Some(reason),
            DecodeOutcome::Eof => break None,
        }
    };

    Ok((last_lsn, good_offset, count, truncate_reason))
}

struct CountingReader<R> {
    inner: R,
    bytes_read: u64,
}

impl<R> CountingReader<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            bytes_read: 0,
        }
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.bytes_read += n as u64;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn append_assigns_serial_lsns() {
        let dir = tempdir().unwrap();
        let wal = Wal::open(dir.path()).unwrap();

        assert_eq!(wal.append(OpType::CreateNode, b"n1").unwrap(), 1);
        assert_eq!(wal.append(OpType::CreateEdge, b"e1").unwrap(), 2);
        assert_eq!(wal.append(OpType::DeleteNode, b"n1").unwrap(), 3);
        assert_eq!(wal.current_lsn(), 3);
    }

    #[test]
    fn reopen_recovers_current_lsn() {
        let dir = tempdir().unwrap();
        {
            let wal = Wal::open(dir.path()).unwrap();
            wal.append(OpType::CreateNode, b"n1").unwrap();
            wal.append(OpType::CreateNode, b"n2").unwrap();
            wal.close().unwrap();
        }

        let wal = Wal::open(dir.path()).unwrap();
        assert_eq!(wal.current_lsn(), 2);
        assert_eq!(wal.append(OpType::CreateNode, b"n3").unwrap(), 3);
    }

    #[test]
    fn replay_streams_records_in_order() {
        let dir = tempdir().unwrap();
        let wal = Wal::open(dir.path()).unwrap();
        wal.append(OpType::CreateNode, b"a").unwrap();
        wal.append(OpType::CreateEdge, b"b").unwrap();

        let mut seen = Vec::new();
        wal.replay(|record| {
            seen.push((record.lsn, record.op_type, record.payload));
            Ok(())
        })
        .unwrap();

        assert_eq!(
            seen,
            vec![
                (1, OpType::CreateNode, b"a".to_vec()),
                (2, OpType::CreateEdge, b"b".to_vec()),
            ]
        );
    }

    #[test]
    fn replay_returns_handler_error() {
        let dir = tempdir().unwrap();
        let wal = Wal::open(dir.path()).unwrap();
        wal.append(OpType::CreateNode, b"a").unwrap();

        let result = wal.replay(|_| Err(StorageError("handler rejected".into()).into()));
        assert!(matches!(result, Err(GraphdError::Storage(_))));
    }

    #[test]
    fn corrupt_tail_is_truncated_on_open() {
        let dir = tempdir().unwrap();
        let path = {
            let wal = Wal::open(dir.path()).unwrap();
            wal.append(OpType::CreateNode, b"node1").unwrap();
            wal.append(OpType::CreateEdge, b"edge1").unwrap();
            wal.append(OpType::CreateNode, b"node2").unwrap();
            wal.close().unwrap();
            wal.path()
        };

        // Zero the last 10 bytes, destroying the third record's suffix.
        let len = std::fs::metadata(&path).unwrap().len();
        {
            use std::io::{Seek, SeekFrom, Write};
            let mut file = OpenOptions::new().write(true).open(&path).unwrap();
            file.seek(SeekFrom::Start(len - 10)).unwrap();
            file.write_all(&[0u8; 10]).unwrap();
        }

        let wal = Wal::open(dir.path()).unwrap();
        assert_eq!(wal.current_lsn(), 2);

        let mut count = 0;
        wal.replay(|_| {
            count += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn truncate_resets_lsn_and_empties_log() {
        let dir = tempdir().unwrap();
        let wal = Wal::open(dir.path()).unwrap();
        wal.append(OpType::CreateNode, b"n1").unwrap();
        wal.append(OpType::CreateNode, b"n2").unwrap();

        wal.truncate().unwrap();
        assert_eq!(wal.current_lsn(), 0);

        let mut count = 0;
        wal.replay(|_| {
            count += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(count, 0);

        // The log is writable again and LSNs restart from 1.
        assert_eq!(wal.append(OpType::CreateNode, b"n3").unwrap(), 1);
    }

    #[test]
    fn double_close_is_an_error() {
        let dir = tempdir().unwrap();
        let wal = Wal::open(dir.path()).unwrap();
        wal.close().unwrap();
        assert!(matches!(wal.close(), Err(GraphdError::AlreadyClosed)));
        assert!(matches!(
            wal.append(OpType::CreateNode, b"x"),
            Err(GraphdError::AlreadyClosed)
        ));
    }

    #[test]
    fn append_batch_is_contiguous_with_single_sync() {
        let dir = tempdir().unwrap();
        let wal = Wal::open(dir.path()).unwrap();
        wal.append(OpType::CreateNode, b"first").unwrap();

        let entries = vec![
            (OpType::CreateNode, b"a".to_vec()),
            (OpType::CreateEdge, b"b".to_vec()),
            (OpType::DeleteEdge, b"c".to_vec()),
        ];
        let lsns = wal.append_batch(&entries).unwrap();
        assert_eq!(lsns, vec![2, 3, 4]);
        assert_eq!(wal.current_lsn(), 4);
    }

    #[test]
    fn oversized_payload_is_rejected_without_lsn_gap() {
        let dir = tempdir().unwrap();
        let wal = Wal::open_with(
            dir.path(),
            WalOptions {
                max_payload_len: 8,
            },
        )
        .unwrap();

        wal.append(OpType::CreateNode, b"ok").unwrap();
        assert!(wal
            .append(OpType::CreateNode, b"way too large payload")
            .is_err());
        // The failed append must not burn an LSN.
        assert_eq!(wal.append(OpType::CreateNode, b"next").unwrap(), 2);
    }
}
