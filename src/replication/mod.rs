//! Primary/replica replication over the WAL.
//!
//! The primary streams WAL records to attached replicas and tracks their
//! health by heartbeat sequence lag, not TCP state. Replicas apply records,
//! acknowledge progress, and echo heartbeat sequences back.

pub mod health;
pub mod primary;
pub mod protocol;
pub mod replica;
pub mod transport;

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::watch;

/// A peer is declared dead after this many missed heartbeat sequences
/// (the "Paranoid Pirate" rule).
pub const MISSED_HEARTBEATS_THRESHOLD: u64 = 5;

/// Protocol version carried in handshakes.
pub const PROTOCOL_VERSION: &str = "1";

/// Logical replication lag in records.
pub fn lag_lsn(primary_current: u64, last_applied: u64) -> u64 {
    primary_current.saturating_sub(last_applied)
}

/// Snapshot of one attached replica, as seen by the primary.
#[derive(Debug, Clone)]
pub struct ReplicaStatus {
    pub id: String,
    /// Heartbeat-lag based liveness; TCP state alone never keeps this true.
    pub connected: bool,
    /// Wall clock of the last response, in unix milliseconds.
    pub last_seen_unix_ms: u64,
    pub last_applied_lsn: u64,
    /// Milliseconds since the last response.
    pub lag_ms: u64,
    /// Heartbeat sequences the replica is behind by.
    pub heartbeat_lag: u64,
    /// Messages dropped for this replica because its queue was full.
    pub dropped_messages: u64,
}

/// Snapshot of the replication subsystem on either role.
#[derive(Debug, Clone)]
pub struct ReplicationState {
    pub node_id: String,
    pub is_primary: bool,
    /// Set on replicas once a handshake has succeeded.
    pub primary_id: Option<String>,
    /// Primary: last streamed LSN. Replica: last applied LSN.
    pub current_lsn: u64,
    pub replica_count: usize,
    pub replicas: Vec<ReplicaStatus>,
}

/// Shutdown signal closed at most once, observed by every task of a
/// component. Cloning the receiver side is cheap; `raise` is idempotent.
pub(crate) struct StopSignal {
    raised: AtomicBool,
    tx: watch::Sender<bool>,
}

impl StopSignal {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            raised: AtomicBool::new(false),
            tx,
        }
    }

    /// Close the signal. Only the first call has an effect.
    pub(crate) fn raise(&self) {
        if !self.raised.swap(true, Ordering::SeqCst) {
            let _ = self.tx.send(true);
        }
    }

    pub(crate) fn is_raised(&self) -> bool {
        self.raised.load(Ordering::SeqCst)
    }

    /// Resolve once the signal is raised.
    pub(crate) async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        if *rx.borrow() {
            return;
        }
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[test]
    fn lag_never_underflows() {
        assert_eq!(lag_lsn(10, 3), 7);
        assert_eq!(lag_lsn(3, 10), 0);
    }

    #[tokio::test]
    async fn stop_signal_raises_once_and_wakes_waiters() {
        let stop = Arc::new(StopSignal::new());
        assert!(!stop.is_raised());

        let waiter = {
            let stop = Arc::clone(&stop);
            tokio::spawn(async move { stop.cancelled().await })
        };

        stop.raise();
        stop.raise();
        assert!(stop.is_raised());

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();

        // Late subscribers observe the raised state immediately.
        tokio::time::timeout(Duration::from_millis(100), stop.cancelled())
            .await
            .expect("already-raised signal resolves at once");
    }
}
