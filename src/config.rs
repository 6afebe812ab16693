use std::net::SocketAddr;
use std::time::Duration;

use crate::errors::GraphdError;

/// Default port for replica connections / WAL publish.
pub const DEFAULT_REPLICATION_PORT: u16 = 9090;
/// Default port for the health survey channel.
pub const DEFAULT_HEALTH_PORT: u16 = 9091;
/// Default port for the write buffer (push/pull) channel.
pub const DEFAULT_WRITE_BUFFER_PORT: u16 = 9092;

/// Bounds for the per-replica outbound queue depth.
const SEND_BUFFER_MIN: usize = 10;
const SEND_BUFFER_MAX: usize = 10_000;

/// How long `stream_wal_entry` waits when no timeout is configured.
pub const DEFAULT_WAL_STREAM_TIMEOUT: Duration = Duration::from_secs(5);

/// Durability acknowledgement policy for primary writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// Return as soon as the record enters the fan-out buffer.
    #[default]
    Async,
    /// Wait for at least one replica ACK.
    Sync,
    /// Wait for a majority of attached replicas to ACK.
    Quorum,
}

/// Configuration for both replication roles.
///
/// Follows the builder-method convention: construct with `Default` and chain
/// setters for the knobs that differ from the defaults.
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// Selects the role this node plays.
    pub is_primary: bool,
    /// Address the primary listens on for replica connections.
    pub listen_addr: SocketAddr,
    /// Address a replica dials to reach the primary.
    pub primary_addr: Option<SocketAddr>,
    /// Ceiling on concurrently attached replicas.
    pub max_replicas: usize,
    /// Primary broadcaster tick; also the replica echo tick.
    pub heartbeat_interval: Duration,
    /// Replica backoff after a disconnect.
    pub reconnect_delay: Duration,
    /// Depth of the primary's in-memory WAL fan-out channel.
    pub wal_buffer_size: usize,
    /// How long `stream_wal_entry` waits; zero selects the 5 s default.
    pub wal_stream_timeout: Duration,
    /// Per-replica outbound queue depth, clamped to [10, 10000].
    pub send_buffer_size: usize,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_connection_age: Duration,
    pub sync_mode: SyncMode,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            is_primary: true,
            listen_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_REPLICATION_PORT)),
            primary_addr: None,
            max_replicas: 16,
            heartbeat_interval: Duration::from_secs(1),
            reconnect_delay: Duration::from_millis(500),
            wal_buffer_size: 1024,
            wal_stream_timeout: DEFAULT_WAL_STREAM_TIMEOUT,
            send_buffer_size: 1000,
            connect_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(300),
            max_connection_age: Duration::from_secs(3600),
            sync_mode: SyncMode::Async,
        }
    }
}

impl ReplicationConfig {
    pub fn primary(listen_addr: SocketAddr) -> Self {
        Self {
            is_primary: true,
            listen_addr,
            ..Default::default()
        }
    }

    pub fn replica(primary_addr: SocketAddr) -> Self {
        Self {
            is_primary: false,
            primary_addr: Some(primary_addr),
            ..Default::default()
        }
    }

    pub fn max_replicas(mut self, max_replicas: usize) -> Self {
        self.max_replicas = max_replicas;
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn wal_buffer_size(mut self, size: usize) -> Self {
        self.wal_buffer_size = size;
        self
    }

    pub fn wal_stream_timeout(mut self, timeout: Duration) -> Self {
        self.wal_stream_timeout = timeout;
        self
    }

    pub fn send_buffer_size(mut self, size: usize) -> Self {
        self.send_buffer_size = size;
        self
    }

    pub fn sync_mode(mut self, mode: SyncMode) -> Self {
        self.sync_mode = mode;
        self
    }

    /// Effective `stream_wal_entry` wait; zero means the 5 s default.
    pub fn effective_wal_stream_timeout(&self) -> Duration {
        if self.wal_stream_timeout.is_zero() {
            DEFAULT_WAL_STREAM_TIMEOUT
        } else {
            self.wal_stream_timeout
        }
    }

    /// Per-replica outbound queue depth within the supported bounds.
    pub fn effective_send_buffer_size(&self) -> usize {
        self.send_buffer_size.clamp(SEND_BUFFER_MIN, SEND_BUFFER_MAX)
    }

    pub fn validate(&self) -> Result<(), GraphdError> {
        if self.max_replicas == 0 {
            return Err(GraphdError::InvalidConfig(
                "max_replicas must be greater than 0".into(),
            ));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(GraphdError::InvalidConfig(
                "heartbeat_interval must be greater than 0".into(),
            ));
        }
        if self.wal_buffer_size == 0 {
            return Err(GraphdError::InvalidConfig(
                "wal_buffer_size must be greater than 0".into(),
            ));
        }
        if !self.is_primary && self.primary_addr.is_none() {
            return Err(GraphdError::InvalidConfig(
                "replica role requires primary_addr".into(),
            ));
        }
        Ok(())
    }
}

/// Knobs for the group-commit adapter.
#[derive(Debug, Clone)]
pub struct GroupCommitConfig {
    /// Flush when this many entries are pending.
    pub batch_size: usize,
    /// Flush on this cadence even when the batch is not full.
    pub flush_interval: Duration,
}

impl Default for GroupCommitConfig {
    fn default() -> Self {
        Self {
            batch_size: 64,
            flush_interval: Duration::from_millis(10),
        }
    }
}

impl GroupCommitConfig {
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn validate(&self) -> Result<(), GraphdError> {
        if self.batch_size == 0 {
            return Err(GraphdError::InvalidConfig(
                "batch_size must be greater than 0".into(),
            ));
        }
        if self.flush_interval.is_zero() {
            return Err(GraphdError::InvalidConfig(
                "flush_interval must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}
