//! Replication wire protocol.
//!
//! Every message is an [`Envelope`]: `{type, timestamp, data}` where `data`
//! holds the JSON-encoded typed payload. Envelopes are themselves
//! JSON-encoded and framed length-delimited: a big-endian `u32` length
//! followed by the envelope bytes.
//!
//! The pub/sub profile reuses the same envelope bytes prefixed with the
//! `WAL:` topic; [`wrap_topic`] and [`strip_topic`] convert between the two
//! forms without touching payload semantics or ordering.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::errors::GraphdError;
use crate::wal::record::Record;

/// Upper bound on a single frame; anything larger is a protocol error.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Topic prefix for WAL fan-out on the pub/sub profile.
pub const WAL_TOPIC: &[u8] = b"WAL:";

/// Message discriminator carried in every envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum MessageType {
    Handshake = 1,
    Heartbeat = 2,
    Ack = 3,
    Sync = 4,
    WalEntry = 5,
    Snapshot = 6,
    Error = 7,
}

/// Framed message envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    pub timestamp: i64,
    pub data: Vec<u8>,
}

impl Envelope {
    /// Build an envelope around a typed payload.
    pub fn new<T: Serialize>(msg_type: MessageType, payload: &T) -> Result<Self, GraphdError> {
        Ok(Self {
            msg_type,
            timestamp: unix_millis(),
            data: serde_json::to_vec(payload)?,
        })
    }

    /// Decode the typed payload this envelope carries.
    pub fn decode_as<T: DeserializeOwned>(&self) -> Result<T, GraphdError> {
        Ok(serde_json::from_slice(&self.data)?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub replica_id: String,
    /// Highest LSN the replica has durably applied.
    pub last_lsn: u64,
    pub version: String,
    pub capabilities: Vec<String>,
    pub epoch: u64,
    pub term: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeResponse {
    pub primary_id: String,
    pub current_lsn: u64,
    pub version: String,
    pub accepted: bool,
    pub error_message: Option<String>,
    pub epoch: u64,
    pub term: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub from: String,
    /// Strictly monotonic per primary process; replicas echo it verbatim.
    pub sequence: u64,
    pub current_lsn: u64,
    pub node_count: u64,
    pub edge_count: u64,
    pub lag_ms: u64,
    pub epoch: u64,
    pub term: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalEntryMessage {
    pub entry: Record,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ack {
    pub last_applied_lsn: u64,
    pub replica_id: String,
    /// The last heartbeat sequence the replica observed.
    pub heartbeat_sequence: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub code: u32,
    pub message: String,
    pub fatal: bool,
}

/// Snapshot metadata. Streaming restore is a deliberate gap; receivers
/// validate, log, and acknowledge without applying state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMessage {
    pub snapshot_id: String,
    pub size: u64,
    pub compressed: bool,
}

/// Write one length-delimited envelope.
pub async fn write_envelope<W: AsyncWrite + Unpin>(
    writer: &mut W,
    envelope: &Envelope,
) -> Result<(), GraphdError> {
    let bytes = serde_json::to_vec(envelope)?;
    if bytes.len() > MAX_FRAME_LEN {
        return Err(GraphdError::replication(format!(
            "outbound frame of {} bytes exceeds limit",
            bytes.len()
        )));
    }
    writer.write_all(&(bytes.len() as u32).to_be_bytes()).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-delimited envelope. An I/O error (including EOF mid-frame)
/// surfaces as `Io`; the caller treats it as a disconnect.
pub async fn read_envelope<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Envelope, GraphdError> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(GraphdError::replication(format!(
            "inbound frame of {len} bytes exceeds limit"
        )));
    }

    let mut bytes = vec![0u8; len];
    reader.read_exact(&mut bytes).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Prefix an envelope frame with the WAL fan-out topic.
pub fn wrap_topic(frame: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(WAL_TOPIC.len() + frame.len());
    out.extend_from_slice(WAL_TOPIC);
    out.extend_from_slice(frame);
    out
}

/// Strip the WAL topic prefix; `None` when the frame is for another topic.
pub fn strip_topic(frame: &[u8]) -> Option<&[u8]> {
    frame.strip_prefix(WAL_TOPIC)
}

fn unix_millis() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_millis() as i64,
        Err(e) => -(e.duration().as_millis() as i64),
    }
}
