//! Snappy-compressed log variant.
//!
//! Same frame layout and recovery path as the plain log; the payload is
//! Snappy-compressed before framing, so the record checksum covers the
//! compressed bytes and a corrupt tail is detected without decompressing.
//! The file name (`wal_compressed.log`) is the compression discriminator;
//! readers need no per-record flag.

use std::path::{Path, PathBuf};

use crate::errors::GraphdError;
use crate::wal::record::{Codec, OpType, Record};
use crate::wal::{Wal, WalOptions, COMPRESSED_WAL_FILE_NAME, WAL_FILE_NAME};

/// A write-ahead log whose payloads are Snappy-compressed on disk.
pub struct CompressedWal {
    inner: Wal,
}

impl CompressedWal {
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self, GraphdError> {
        Self::open_with(dir, WalOptions::default())
    }

    pub fn open_with<P: AsRef<Path>>(dir: P, options: WalOptions) -> Result<Self, GraphdError> {
        let inner = Wal::open_file(
            dir.as_ref(),
            COMPRESSED_WAL_FILE_NAME,
            WAL_FILE_NAME,
            Codec::Snappy,
            options,
        )?;
        Ok(Self { inner })
    }

    pub fn append(&self, op_type: OpType, payload: &[u8]) -> Result<u64, GraphdError> {
        self.inner.append(op_type, payload)
    }

    pub fn append_batch(&self, entries: &[(OpType, Vec<u8>)]) -> Result<Vec<u64>, GraphdError> {
        self.inner.append_batch(entries)
    }

    pub fn replay<F>(&self, handler: F) -> Result<(), GraphdError>
    where
        F: FnMut(Record) -> Result<(), GraphdError>,
    {
        self.inner.replay(handler)
    }

    pub fn truncate(&self) -> Result<(), GraphdError> {
        self.inner.truncate()
    }

    pub fn current_lsn(&self) -> u64 {
        self.inner.current_lsn()
    }

    pub fn close(&self) -> Result<(), GraphdError> {
        self.inner.close()
    }

    pub fn path(&self) -> PathBuf {
        self.inner.path()
    }
}
