//! Primary-side replication manager.
//!
//! Accepts replica connections, streams WAL records, broadcasts heartbeats
//! with a process-lifetime monotonic sequence, and reports per-replica lag.
//! Liveness is judged by heartbeat-sequence lag, never by TCP state. A
//! handshake carrying a newer epoch fences this primary: the connection is
//! rejected and the election collaborator's `become_follower` callback fires.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{ReplicationConfig, SyncMode};
use crate::errors::GraphdError;
use crate::graph::SharedGraphStore;
use crate::replication::health::HealthSurveyor;
use crate::replication::protocol::{
    read_envelope, wrap_topic, write_envelope, Ack, Envelope, ErrorMessage, HandshakeRequest,
    HandshakeResponse, Heartbeat, MessageType, WalEntryMessage,
};
use crate::replication::transport::{PubSocket, SocketFactory};
use crate::replication::{
    ReplicaStatus, ReplicationState, StopSignal, MISSED_HEARTBEATS_THRESHOLD, PROTOCOL_VERSION,
};
use crate::wal::record::Record;

/// Election-collaborator callback invoked with the fencing epoch and term.
pub type BecomeFollowerCallback = Arc<dyn Fn(u64, u64) + Send + Sync>;

struct ResponseState {
    last_response: Instant,
    last_response_unix_ms: u64,
    last_response_heartbeat_seq: u64,
    last_applied_lsn: u64,
}

/// Per-connection state owned by the manager. The connection tasks hold only
/// the channel ends and the stop signal; no handle points back at the
/// manager.
struct ReplicaHandle {
    id: String,
    addr: SocketAddr,
    outbound: mpsc::Sender<Envelope>,
    stop: Arc<StopSignal>,
    response: Mutex<ResponseState>,
    dropped: AtomicU64,
}

impl ReplicaHandle {
    fn new(id: String, addr: SocketAddr, outbound: mpsc::Sender<Envelope>) -> Self {
        Self {
            id,
            addr,
            outbound,
            stop: Arc::new(StopSignal::new()),
            response: Mutex::new(ResponseState {
                last_response: Instant::now(),
                last_response_unix_ms: unix_millis(),
                last_response_heartbeat_seq: 0,
                last_applied_lsn: 0,
            }),
            dropped: AtomicU64::new(0),
        }
    }

    /// Non-blocking enqueue; a full queue drops the message for this replica
    /// only and bumps the drop counter.
    fn try_enqueue(&self, envelope: Envelope, what: &str) -> bool {
        match self.outbound.try_send(envelope) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(replica = %self.id, "outbound queue full, dropping {what}");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

/// Replication manager for the primary role.
pub struct PrimaryManager {
    id: String,
    config: ReplicationConfig,
    storage: SharedGraphStore,
    epoch: AtomicU64,
    term: AtomicU64,
    heartbeat_seq: AtomicU64,
    current_lsn: AtomicU64,
    running: AtomicBool,
    stopped: AtomicBool,
    stop: Arc<StopSignal>,
    replicas: Arc<RwLock<HashMap<String, Arc<ReplicaHandle>>>>,
    wal_tx: Mutex<Option<mpsc::Sender<Record>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
    become_follower: Mutex<Option<BecomeFollowerCallback>>,
    socket_factory: Mutex<Option<Arc<dyn SocketFactory>>>,
    health: Mutex<Option<HealthSurveyor>>,
}

impl PrimaryManager {
    pub fn new(config: ReplicationConfig, storage: SharedGraphStore) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            config,
            storage,
            epoch: AtomicU64::new(0),
            term: AtomicU64::new(0),
            heartbeat_seq: AtomicU64::new(0),
            current_lsn: AtomicU64::new(0),
            running: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            stop: Arc::new(StopSignal::new()),
            replicas: Arc::new(RwLock::new(HashMap::new())),
            wal_tx: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            local_addr: Mutex::new(None),
            become_follower: Mutex::new(None),
            socket_factory: Mutex::new(None),
            health: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    pub fn set_epoch(&self, epoch: u64) {
        self.epoch.store(epoch, Ordering::SeqCst);
    }

    pub fn term(&self) -> u64 {
        self.term.load(Ordering::SeqCst)
    }

    pub fn set_term(&self, term: u64) {
        self.term.store(term, Ordering::SeqCst);
    }

    /// Last heartbeat sequence broadcast. Monotonic for the process lifetime.
    pub fn heartbeat_sequence(&self) -> u64 {
        self.heartbeat_seq.load(Ordering::SeqCst)
    }

    /// Address actually bound; set once `start` has succeeded.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Install the election-collaborator callback fired on epoch fencing.
    pub fn on_become_follower(&self, callback: BecomeFollowerCallback) {
        *self.become_follower.lock() = Some(callback);
    }

    /// Install a messaging collaborator: WAL envelopes are additionally
    /// published topic-prefixed, and a health surveyor runs on `start`.
    pub fn with_socket_factory(&self, factory: Arc<dyn SocketFactory>) {
        *self.socket_factory.lock() = Some(factory);
    }

    /// Bind the listener and launch the accept loop, heartbeat broadcaster,
    /// and WAL broadcaster. A second `start` fails.
    pub async fn start(self: &Arc<Self>) -> Result<(), GraphdError> {
        self.config.validate()?;
        if !self.config.is_primary {
            return Err(GraphdError::InvalidConfig(
                "replica-role config passed to primary manager".into(),
            ));
        }
        if self.stopped.load(Ordering::SeqCst) {
            return Err(GraphdError::ReplicationStopped);
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(GraphdError::replication("primary already running"));
        }

        let listener = TcpListener::bind(self.config.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        *self.local_addr.lock() = Some(local_addr);
        info!(primary = %self.id, addr = %local_addr, "primary listening");

        let (wal_tx, wal_rx) = mpsc::channel(self.config.wal_buffer_size);
        *self.wal_tx.lock() = Some(wal_tx);

        let publisher = self.open_publisher(local_addr);

        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(Arc::clone(self).accept_loop(listener)));
        tasks.push(tokio::spawn(Arc::clone(self).heartbeat_loop()));
        tasks.push(tokio::spawn(Arc::clone(self).wal_fanout_loop(wal_rx, publisher)));
        drop(tasks);

        self.start_health_surveyor();
        Ok(())
    }

    fn open_publisher(&self, local_addr: SocketAddr) -> Option<Box<dyn PubSocket>> {
        let factory = self.socket_factory.lock().clone()?;
        match factory.new_pub(&format!("wal://{local_addr}")) {
            Ok(socket) => Some(socket),
            Err(e) => {
                warn!("WAL publisher unavailable: {e}");
                None
            }
        }
    }

    fn start_health_surveyor(&self) {
        let factory = self.socket_factory.lock().clone();
        if let Some(factory) = factory {
            match factory.new_surveyor("health://primary") {
                Ok(socket) => {
                    let surveyor = HealthSurveyor::start(socket, self.config.heartbeat_interval);
                    *self.health.lock() = Some(surveyor);
                }
                Err(e) => warn!("health surveyor unavailable: {e}"),
            }
        }
    }

    /// Enqueue a record for broadcast to every attached replica.
    ///
    /// Waits up to the configured stream timeout for buffer space; on timeout
    /// the caller must fail the write. The record never silently drops from
    /// the primary's outbound stream.
    pub async fn stream_wal_entry(&self, record: Record) -> Result<(), GraphdError> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(GraphdError::ReplicationStopped);
        }
        let tx = match self.wal_tx.lock().as_ref() {
            Some(tx) => tx.clone(),
            None => return Err(GraphdError::ReplicationStopped),
        };

        self.current_lsn.fetch_max(record.lsn, Ordering::SeqCst);
        let wait = self.config.effective_wal_stream_timeout();
        match timeout(wait, tx.send(record)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(GraphdError::ReplicationStopped),
            Err(_) => Err(GraphdError::WalStreamFull(wait)),
        }
    }

    /// Stream a record and wait per the configured sync mode: `Async` returns
    /// at once, `Sync` waits for one ACK, `Quorum` for a majority of attached
    /// replicas.
    pub async fn replicate(&self, record: Record) -> Result<(), GraphdError> {
        let lsn = record.lsn;
        self.stream_wal_entry(record).await?;

        let required = match self.config.sync_mode {
            SyncMode::Async => return Ok(()),
            SyncMode::Sync => 1,
            SyncMode::Quorum => self.replicas.read().len() / 2 + 1,
        };
        self.wait_for_acks(lsn, required).await
    }

    async fn wait_for_acks(&self, lsn: u64, required: usize) -> Result<(), GraphdError> {
        let deadline = Instant::now() + self.config.write_timeout;
        loop {
            let acked = self
                .replicas
                .read()
                .values()
                .filter(|handle| handle.response.lock().last_applied_lsn >= lsn)
                .count();
            if acked >= required {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(GraphdError::replication(format!(
                    "ack timeout at lsn {lsn}: got {acked}, need {required}"
                )));
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Snapshot of the primary and every attached replica.
    pub fn get_replication_state(&self) -> ReplicationState {
        let current_seq = self.heartbeat_seq.load(Ordering::SeqCst);
        let replicas: Vec<ReplicaStatus> = self
            .replicas
            .read()
            .values()
            .map(|handle| {
                let response = handle.response.lock();
                let heartbeat_lag =
                    current_seq.saturating_sub(response.last_response_heartbeat_seq);
                ReplicaStatus {
                    id: handle.id.clone(),
                    connected: heartbeat_lag <= MISSED_HEARTBEATS_THRESHOLD,
                    last_seen_unix_ms: response.last_response_unix_ms,
                    last_applied_lsn: response.last_applied_lsn,
                    lag_ms: response.last_response.elapsed().as_millis() as u64,
                    heartbeat_lag,
                    dropped_messages: handle.dropped.load(Ordering::Relaxed),
                }
            })
            .collect();

        ReplicationState {
            node_id: self.id.clone(),
            is_primary: true,
            primary_id: Some(self.id.clone()),
            current_lsn: self.current_lsn.load(Ordering::SeqCst),
            replica_count: replicas.len(),
            replicas,
        }
    }

    /// Signal shutdown, close the listener and every connection, and wait for
    /// all tasks. Idempotent.
    pub async fn stop(&self) -> Result<(), GraphdError> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.stopped.store(true, Ordering::SeqCst);
        info!(primary = %self.id, "primary stopping");

        self.stop.raise();
        self.wal_tx.lock().take();
        for handle in self.replicas.read().values() {
            handle.stop.raise();
        }
        if let Some(health) = self.health.lock().take() {
            health.stop();
        }

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        let mut failures = Vec::new();
        for task in tasks {
            if let Err(e) = task.await {
                failures.push(e.to_string());
            }
        }
        self.replicas.write().clear();

        if failures.is_empty() {
            Ok(())
        } else {
            Err(GraphdError::replication(format!(
                "shutdown completed with task failures: {}",
                failures.join("; ")
            )))
        }
    }

    // -- background loops ---------------------------------------------------

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        // Bounds concurrent handshake handlers; sockets beyond it are closed
        // immediately.
        let permits = Arc::new(tokio::sync::Semaphore::new(self.config.max_replicas + 5));
        loop {
            tokio::select! {
                _ = self.stop.cancelled() => break,
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!("accept failed: {e}");
                            continue;
                        }
                    };
                    let permit = match Arc::clone(&permits).try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            warn!(%addr, "handshake capacity exhausted, closing socket");
                            drop(stream);
                            continue;
                        }
                    };
                    let manager = Arc::clone(&self);
                    let task = tokio::spawn(async move {
                        let _permit = permit;
                        manager.handle_incoming(stream, addr).await;
                    });
                    self.tasks.lock().push(task);
                }
            }
        }
        debug!("accept loop exited");
    }

    async fn handle_incoming(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        let (mut reader, mut writer) = stream.into_split();

        let request = match timeout(self.config.handshake_timeout, read_envelope(&mut reader)).await
        {
            Ok(Ok(envelope)) if envelope.msg_type == MessageType::Handshake => {
                match envelope.decode_as::<HandshakeRequest>() {
                    Ok(request) => request,
                    Err(e) => {
                        warn!(%addr, "malformed handshake: {e}");
                        return;
                    }
                }
            }
            Ok(Ok(envelope)) => {
                warn!(%addr, "expected handshake, got {:?}", envelope.msg_type);
                return;
            }
            Ok(Err(e)) => {
                warn!(%addr, "handshake read failed: {e}");
                return;
            }
            Err(_) => {
                warn!(%addr, "handshake deadline exceeded");
                return;
            }
        };

        // Epoch fencing: a newer epoch wins; reject and step down.
        let local_epoch = self.epoch();
        if request.epoch > local_epoch {
            warn!(
                replica = %request.replica_id,
                peer_epoch = request.epoch,
                local_epoch,
                "stale epoch detected, stepping down"
            );
            let response = self.handshake_response(false, Some("stale epoch".into()));
            let _ = write_envelope(&mut writer, &response_envelope(&response)).await;
            self.trigger_step_down(request.epoch, request.term);
            return;
        }

        if self.replicas.read().len() >= self.config.max_replicas {
            let response = self.handshake_response(false, Some("max replicas reached".into()));
            let _ = write_envelope(&mut writer, &response_envelope(&response)).await;
            info!(replica = %request.replica_id, "rejected: max replicas reached");
            return;
        }

        let response = self.handshake_response(true, None);
        if let Err(e) = write_envelope(&mut writer, &response_envelope(&response)).await {
            warn!(replica = %request.replica_id, "handshake response failed: {e}");
            return;
        }

        let (outbound_tx, outbound_rx) =
            mpsc::channel(self.config.effective_send_buffer_size());
        let handle = Arc::new(ReplicaHandle::new(
            request.replica_id.clone(),
            addr,
            outbound_tx,
        ));
        {
            let mut handle_state = handle.response.lock();
            handle_state.last_applied_lsn = request.last_lsn;
        }
        self.replicas
            .write()
            .insert(request.replica_id.clone(), Arc::clone(&handle));
        // A shutdown that raced this handshake must still reach the new
        // connection's stop signal.
        if self.stop.is_raised() {
            handle.stop.raise();
        }
        info!(
            replica = %request.replica_id,
            %addr,
            last_lsn = request.last_lsn,
            "replica attached"
        );

        let sender = tokio::spawn(Arc::clone(&self).connection_sender(
            Arc::clone(&handle),
            writer,
            outbound_rx,
        ));
        let receiver =
            tokio::spawn(Arc::clone(&self).connection_receiver(Arc::clone(&handle), reader));
        let mut tasks = self.tasks.lock();
        tasks.push(sender);
        tasks.push(receiver);
    }

    fn handshake_response(&self, accepted: bool, error_message: Option<String>) -> HandshakeResponse {
        HandshakeResponse {
            primary_id: self.id.clone(),
            current_lsn: self.current_lsn.load(Ordering::SeqCst),
            version: PROTOCOL_VERSION.to_string(),
            accepted,
            error_message,
            epoch: self.epoch(),
            term: self.term(),
        }
    }

    /// Invoke the election collaborator asynchronously so the rejection
    /// response finishes first.
    fn trigger_step_down(&self, epoch: u64, term: u64) {
        let callback = self.become_follower.lock().clone();
        if let Some(callback) = callback {
            tokio::spawn(async move {
                callback(epoch, term);
            });
        } else {
            warn!("no become_follower callback installed; fencing observed without step-down");
        }
    }

    async fn connection_sender(
        self: Arc<Self>,
        handle: Arc<ReplicaHandle>,
        mut writer: OwnedWriteHalf,
        mut outbound: mpsc::Receiver<Envelope>,
    ) {
        loop {
            tokio::select! {
                _ = handle.stop.cancelled() => break,
                _ = self.stop.cancelled() => break,
                maybe = outbound.recv() => match maybe {
                    Some(envelope) => {
                        match timeout(self.config.write_timeout, write_envelope(&mut writer, &envelope)).await {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => {
                                debug!(replica = %handle.id, "send failed: {e}");
                                handle.stop.raise();
                                break;
                            }
                            Err(_) => {
                                warn!(replica = %handle.id, "write deadline exceeded");
                                handle.stop.raise();
                                break;
                            }
                        }
                    }
                    None => break,
                },
            }
        }

        // Best-effort drain so queued records reach a replica that is being
        // shut down cleanly.
        while let Ok(envelope) = outbound.try_recv() {
            match timeout(self.config.write_timeout, write_envelope(&mut writer, &envelope)).await {
                Ok(Ok(())) => {}
                _ => break,
            }
        }
        self.detach_replica(&handle.id);
    }

    async fn connection_receiver(self: Arc<Self>, handle: Arc<ReplicaHandle>, mut reader: OwnedReadHalf) {
        let connected_at = Instant::now();
        let mut last_activity = Instant::now();

        loop {
            tokio::select! {
                _ = handle.stop.cancelled() => break,
                _ = self.stop.cancelled() => break,
                read = timeout(self.config.read_timeout, read_envelope(&mut reader)) => {
                    match read {
                        Ok(Ok(envelope)) => {
                            last_activity = Instant::now();
                            // One bad envelope must not take the connection
                            // down with it.
                            let dispatch = catch_unwind(AssertUnwindSafe(|| {
                                self.dispatch_reply(&handle, &envelope)
                            }));
                            match dispatch {
                                Ok(Ok(())) => {}
                                Ok(Err(e)) => {
                                    warn!(replica = %handle.id, "dropping bad envelope: {e}");
                                }
                                Err(_) => {
                                    error!(replica = %handle.id, "panic isolated while handling envelope");
                                }
                            }
                        }
                        Ok(Err(e)) => {
                            debug!(replica = %handle.id, "connection closed: {e}");
                            handle.stop.raise();
                            break;
                        }
                        Err(_) => {
                            if last_activity.elapsed() >= self.config.idle_timeout {
                                info!(replica = %handle.id, "idle timeout, closing connection");
                                handle.stop.raise();
                                break;
                            }
                            if connected_at.elapsed() >= self.config.max_connection_age {
                                info!(replica = %handle.id, "connection aged out");
                                handle.stop.raise();
                                break;
                            }
                        }
                    }
                }
            }
        }
        self.detach_replica(&handle.id);
    }

    /// Route one inbound envelope by type. Heartbeats and ACKs refresh the
    /// replica's response state; a fatal error message raises the connection
    /// stop signal.
    fn dispatch_reply(&self, handle: &ReplicaHandle, envelope: &Envelope) -> Result<(), GraphdError> {
        match envelope.msg_type {
            MessageType::Heartbeat => {
                let heartbeat: Heartbeat = envelope.decode_as()?;
                let mut response = handle.response.lock();
                response.last_response = Instant::now();
                response.last_response_unix_ms = unix_millis();
                if heartbeat.sequence > response.last_response_heartbeat_seq {
                    response.last_response_heartbeat_seq = heartbeat.sequence;
                }
            }
            MessageType::Ack => {
                let ack: Ack = envelope.decode_as()?;
                let mut response = handle.response.lock();
                response.last_response = Instant::now();
                response.last_response_unix_ms = unix_millis();
                if ack.last_applied_lsn > response.last_applied_lsn {
                    response.last_applied_lsn = ack.last_applied_lsn;
                }
                if ack.heartbeat_sequence > response.last_response_heartbeat_seq {
                    response.last_response_heartbeat_seq = ack.heartbeat_sequence;
                }
            }
            MessageType::Error => {
                let message: ErrorMessage = envelope.decode_as()?;
                if message.fatal {
                    error!(replica = %handle.id, code = message.code, "fatal peer error: {}", message.message);
                    handle.stop.raise();
                } else {
                    warn!(replica = %handle.id, code = message.code, "peer error: {}", message.message);
                }
            }
            other => {
                warn!(replica = %handle.id, "unexpected message type {other:?} from replica");
            }
        }
        Ok(())
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.stop.cancelled() => break,
                _ = ticker.tick() => {
                    // The sequence advances exactly once per interval, for
                    // every replica, whether or not each enqueue succeeds.
                    let sequence = self.heartbeat_seq.fetch_add(1, Ordering::SeqCst) + 1;
                    let heartbeat = Heartbeat {
                        from: self.id.clone(),
                        sequence,
                        current_lsn: self.current_lsn.load(Ordering::SeqCst),
                        node_count: self.storage.node_count(),
                        edge_count: self.storage.edge_count(),
                        lag_ms: 0,
                        epoch: self.epoch(),
                        term: self.term(),
                    };
                    let envelope = match Envelope::new(MessageType::Heartbeat, &heartbeat) {
                        Ok(envelope) => envelope,
                        Err(e) => {
                            error!("heartbeat encode failed: {e}");
                            continue;
                        }
                    };
                    for handle in self.replicas.read().values() {
                        handle.try_enqueue(envelope.clone(), "heartbeat");
                    }
                }
            }
        }
        debug!("heartbeat loop exited");
    }

    async fn wal_fanout_loop(
        self: Arc<Self>,
        mut wal_rx: mpsc::Receiver<Record>,
        publisher: Option<Box<dyn PubSocket>>,
    ) {
        loop {
            tokio::select! {
                _ = self.stop.cancelled() => break,
                maybe = wal_rx.recv() => {
                    let record = match maybe {
                        Some(record) => record,
                        None => break,
                    };
                    let message = WalEntryMessage { entry: record };
                    let envelope = match Envelope::new(MessageType::WalEntry, &message) {
                        Ok(envelope) => envelope,
                        Err(e) => {
                            error!("wal entry encode failed: {e}");
                            continue;
                        }
                    };

                    for handle in self.replicas.read().values() {
                        handle.try_enqueue(envelope.clone(), "wal entry");
                    }

                    if let Some(publisher) = &publisher {
                        match serde_json::to_vec(&envelope) {
                            Ok(frame) => {
                                if let Err(e) = publisher.publish(&wrap_topic(&frame)) {
                                    warn!("wal publish failed: {e}");
                                }
                            }
                            Err(e) => error!("wal frame encode failed: {e}"),
                        }
                    }
                }
            }
        }
        debug!("wal fan-out loop exited");
    }

    fn detach_replica(&self, id: &str) {
        if let Some(handle) = self.replicas.write().remove(id) {
            handle.stop.raise();
            info!(replica = %handle.id, addr = %handle.addr, "replica detached");
        }
    }
}

fn response_envelope(response: &HandshakeResponse) -> Envelope {
    // Handshake responses carry no opaque payload that can fail to encode.
    Envelope::new(MessageType::Handshake, response)
        .unwrap_or_else(|_| Envelope {
            msg_type: MessageType::Handshake,
            timestamp: 0,
            data: Vec::new(),
        })
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
