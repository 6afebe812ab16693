use thiserror::Error;

#[derive(Debug, Error)]
pub enum GraphdError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// The WAL has assigned every representable LSN. The log must be rotated.
    #[error("WAL exhausted: LSN space is full")]
    WalExhausted,

    #[error("log already closed")]
    AlreadyClosed,

    /// The primary's in-memory WAL fan-out channel did not accept the record
    /// before the stream timeout. The caller must fail the write.
    #[error("WAL stream buffer full: record not accepted within {0:?}")]
    WalStreamFull(std::time::Duration),

    #[error("replication is not running")]
    ReplicationStopped,

    /// A handshake carried a newer epoch than ours; this node must step down.
    #[error("stale epoch: peer epoch {peer_epoch} > local epoch {local_epoch}")]
    EpochFenced { peer_epoch: u64, local_epoch: u64 },

    #[error("max replicas reached")]
    MaxReplicasReached,

    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),

    #[error("fatal peer error {code}: {message}")]
    FatalPeerError { code: u32, message: String },

    #[error("corrupt log: {0}")]
    CorruptLog(String),

    #[error("replication error: {0}")]
    Replication(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

#[derive(Debug, Error)]
#[error("{0}")]
pub struct StorageError(pub String);

impl GraphdError {
    pub(crate) fn replication(msg: impl Into<String>) -> Self {
        GraphdError::Replication(msg.into())
    }
}
