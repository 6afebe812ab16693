mod config;
mod errors;
mod graph;
pub mod replication;
pub mod wal;

pub use crate::config::{
    GroupCommitConfig, ReplicationConfig, SyncMode, DEFAULT_HEALTH_PORT,
    DEFAULT_REPLICATION_PORT, DEFAULT_WRITE_BUFFER_PORT,
};
pub use crate::errors::{GraphdError, StorageError};
pub use crate::graph::{Edge, GraphStore, InMemoryGraph, Node, Properties, SharedGraphStore};
pub use crate::replication::primary::{BecomeFollowerCallback, PrimaryManager};
pub use crate::replication::replica::ReplicaNode;
pub use crate::replication::{
    lag_lsn, ReplicaStatus, ReplicationState, MISSED_HEARTBEATS_THRESHOLD,
};
pub use crate::wal::compressed::CompressedWal;
pub use crate::wal::group_commit::GroupCommitWal;
pub use crate::wal::record::{OpType, Record};
pub use crate::wal::{Wal, WalOptions};
