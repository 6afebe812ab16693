//! Replica-side replication node.
//!
//! Loops connect → handshake → receive → backoff → reconnect, applies
//! streamed WAL records to the storage collaborator, ACKs with the highest
//! applied LSN, and echoes the primary's heartbeat sequence. Replicas never
//! originate heartbeat sequences; the periodic sender mirrors the last one
//! received.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::ReplicationConfig;
use crate::errors::GraphdError;
use crate::graph::{Edge, Node, SharedGraphStore};
use crate::replication::health::HealthResponder;
use crate::replication::protocol::{
    read_envelope, write_envelope, Ack, Envelope, ErrorMessage, HandshakeRequest,
    HandshakeResponse, Heartbeat, MessageType, SnapshotMessage, WalEntryMessage,
};
use crate::replication::transport::SocketFactory;
use crate::replication::{
    lag_lsn, ReplicationState, StopSignal, MISSED_HEARTBEATS_THRESHOLD, PROTOCOL_VERSION,
};
use crate::wal::record::{OpType, Record};

/// Capabilities advertised in the handshake.
const CAPABILITIES: &[&str] = &["wal-streaming", "heartbeat-echo", "snapshot-metadata"];

/// Replication node for the replica role.
pub struct ReplicaNode {
    id: String,
    config: ReplicationConfig,
    storage: SharedGraphStore,
    epoch: AtomicU64,
    term: AtomicU64,
    last_applied_lsn: Arc<AtomicU64>,
    last_heartbeat_seq: Arc<AtomicU64>,
    primary_current_lsn: AtomicU64,
    primary_id: Mutex<Option<String>>,
    connected: AtomicBool,
    running: AtomicBool,
    stopped: AtomicBool,
    reconnects: AtomicU64,
    stop: Arc<StopSignal>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    socket_factory: Mutex<Option<Arc<dyn SocketFactory>>>,
    health: Mutex<Option<HealthResponder>>,
}

impl ReplicaNode {
    pub fn new(config: ReplicationConfig, storage: SharedGraphStore) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            config,
            storage,
            epoch: AtomicU64::new(0),
            term: AtomicU64::new(0),
            last_applied_lsn: Arc::new(AtomicU64::new(0)),
            last_heartbeat_seq: Arc::new(AtomicU64::new(0)),
            primary_current_lsn: AtomicU64::new(0),
            primary_id: Mutex::new(None),
            connected: AtomicBool::new(false),
            running: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            reconnects: AtomicU64::new(0),
            stop: Arc::new(StopSignal::new()),
            tasks: Mutex::new(Vec::new()),
            socket_factory: Mutex::new(None),
            health: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn last_applied_lsn(&self) -> u64 {
        self.last_applied_lsn.load(Ordering::SeqCst)
    }

    pub fn last_received_heartbeat_seq(&self) -> u64 {
        self.last_heartbeat_seq.load(Ordering::SeqCst)
    }

    pub fn reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::SeqCst)
    }

    pub fn set_epoch(&self, epoch: u64) {
        self.epoch.store(epoch, Ordering::SeqCst);
    }

    pub fn set_term(&self, term: u64) {
        self.term.store(term, Ordering::SeqCst);
    }

    /// Logical records behind the primary, by its last advertised LSN.
    pub fn lag(&self) -> u64 {
        lag_lsn(
            self.primary_current_lsn.load(Ordering::SeqCst),
            self.last_applied_lsn(),
        )
    }

    /// Install a messaging collaborator; a survey respondent answers health
    /// probes with this replica's id and applied LSN.
    pub fn with_socket_factory(&self, factory: Arc<dyn SocketFactory>) {
        *self.socket_factory.lock() = Some(factory);
    }

    pub fn get_replication_state(&self) -> ReplicationState {
        ReplicationState {
            node_id: self.id.clone(),
            is_primary: false,
            primary_id: self.primary_id.lock().clone(),
            current_lsn: self.last_applied_lsn(),
            replica_count: 0,
            replicas: Vec::new(),
        }
    }

    /// Launch the connection manager task. A second `start` fails.
    pub async fn start(self: &Arc<Self>) -> Result<(), GraphdError> {
        self.config.validate()?;
        if self.config.is_primary {
            return Err(GraphdError::InvalidConfig(
                "primary-role config passed to replica node".into(),
            ));
        }
        if self.stopped.load(Ordering::SeqCst) {
            return Err(GraphdError::ReplicationStopped);
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(GraphdError::replication("replica already running"));
        }

        self.start_health_responder();

        let node = Arc::clone(self);
        let task = tokio::spawn(node.connection_manager());
        self.tasks.lock().push(task);
        Ok(())
    }

    fn start_health_responder(&self) {
        let factory = self.socket_factory.lock().clone();
        if let Some(factory) = factory {
            match factory.new_respondent("health://primary") {
                Ok(socket) => {
                    let responder = HealthResponder::start(
                        socket,
                        self.id.clone(),
                        Arc::clone(&self.last_applied_lsn),
                    );
                    *self.health.lock() = Some(responder);
                }
                Err(e) => warn!("health respondent unavailable: {e}"),
            }
        }
    }

    /// Signal shutdown, disconnect, and join all tasks. Idempotent.
    pub async fn stop(&self) -> Result<(), GraphdError> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.stopped.store(true, Ordering::SeqCst);
        info!(replica = %self.id, "replica stopping");

        self.stop.raise();
        if let Some(health) = self.health.lock().take() {
            health.stop();
        }

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn connection_manager(self: Arc<Self>) {
        let primary_addr = match self.config.primary_addr {
            Some(addr) => addr,
            None => {
                error!("replica started without primary_addr");
                return;
            }
        };

        loop {
            if self.stop.is_raised() {
                break;
            }

            match self.run_connection(primary_addr).await {
                Ok(()) => debug!("connection closed cleanly"),
                Err(e) => warn!(primary = %primary_addr, "replication link lost: {e}"),
            }
            self.connected.store(false, Ordering::SeqCst);

            tokio::select! {
                _ = self.stop.cancelled() => break,
                _ = tokio::time::sleep(self.config.reconnect_delay) => {
                    self.reconnects.fetch_add(1, Ordering::SeqCst);
                }
            }
        }
        debug!("connection manager exited");
    }

    async fn run_connection(&self, primary_addr: std::net::SocketAddr) -> Result<(), GraphdError> {
        let stream = timeout(self.config.connect_timeout, TcpStream::connect(primary_addr))
            .await
            .map_err(|_| GraphdError::replication("connect timeout"))??;
        let (mut reader, mut writer) = stream.into_split();

        let request = HandshakeRequest {
            replica_id: self.id.clone(),
            last_lsn: self.last_applied_lsn(),
            version: PROTOCOL_VERSION.to_string(),
            capabilities: CAPABILITIES.iter().map(|s| s.to_string()).collect(),
            epoch: self.epoch.load(Ordering::SeqCst),
            term: self.term.load(Ordering::SeqCst),
        };
        let envelope = Envelope::new(MessageType::Handshake, &request)?;

        let response: HandshakeResponse = timeout(self.config.handshake_timeout, async {
            write_envelope(&mut writer, &envelope).await?;
            let reply = read_envelope(&mut reader).await?;
            reply.decode_as::<HandshakeResponse>()
        })
        .await
        .map_err(|_| GraphdError::replication("handshake deadline exceeded"))??;

        if !response.accepted {
            let reason = response
                .error_message
                .unwrap_or_else(|| "unspecified".to_string());
            return Err(match reason.as_str() {
                "max replicas reached" => GraphdError::MaxReplicasReached,
                "stale epoch" => GraphdError::EpochFenced {
                    peer_epoch: response.epoch,
                    local_epoch: self.epoch.load(Ordering::SeqCst),
                },
                _ => GraphdError::HandshakeRejected(reason),
            });
        }

        info!(
            primary = %response.primary_id,
            primary_lsn = response.current_lsn,
            epoch = response.epoch,
            "connected to primary"
        );
        *self.primary_id.lock() = Some(response.primary_id);
        self.primary_current_lsn
            .store(response.current_lsn, Ordering::SeqCst);
        self.connected.store(true, Ordering::SeqCst);

        // Writer task plus heartbeat echo task; the receive loop runs here.
        let conn_stop = Arc::new(StopSignal::new());
        let (outbound_tx, outbound_rx) =
            mpsc::channel::<Envelope>(self.config.effective_send_buffer_size());

        let writer_task = tokio::spawn(run_writer(
            writer,
            outbound_rx,
            Arc::clone(&conn_stop),
            self.config.write_timeout,
        ));
        let heartbeat_task = tokio::spawn(heartbeat_echo_loop(
            outbound_tx.clone(),
            Arc::clone(&conn_stop),
            HeartbeatState {
                replica_id: self.id.clone(),
                storage: Arc::clone(&self.storage),
                last_applied: Arc::clone(&self.last_applied_lsn),
                last_seq: Arc::clone(&self.last_heartbeat_seq),
                epoch: self.epoch.load(Ordering::SeqCst),
                term: self.term.load(Ordering::SeqCst),
            },
            self.config.heartbeat_interval,
        ));

        let result = self.receive_loop(&mut reader, &outbound_tx, &conn_stop).await;

        conn_stop.raise();
        drop(outbound_tx);
        let _ = writer_task.await;
        let _ = heartbeat_task.await;
        result
    }

    async fn receive_loop(
        &self,
        reader: &mut OwnedReadHalf,
        outbound: &mpsc::Sender<Envelope>,
        conn_stop: &Arc<StopSignal>,
    ) -> Result<(), GraphdError> {
        // Any traffic proves the primary alive; silence for more than the
        // missed-heartbeat budget forces a reconnect.
        let liveness_deadline =
            self.config.heartbeat_interval * (MISSED_HEARTBEATS_THRESHOLD as u32 + 1);

        loop {
            if self.stop.is_raised() || conn_stop.is_raised() {
                return Ok(());
            }

            let envelope = tokio::select! {
                _ = self.stop.cancelled() => return Ok(()),
                read = timeout(liveness_deadline, read_envelope(reader)) => match read {
                    Ok(Ok(envelope)) => envelope,
                    Ok(Err(e)) => return Err(e),
                    Err(_) => {
                        return Err(GraphdError::replication(format!(
                            "no heartbeat within {liveness_deadline:?}, primary presumed dead"
                        )));
                    }
                },
            };

            match envelope.msg_type {
                MessageType::Heartbeat => {
                    let heartbeat: Heartbeat = match envelope.decode_as() {
                        Ok(heartbeat) => heartbeat,
                        Err(e) => {
                            warn!("dropping malformed heartbeat: {e}");
                            continue;
                        }
                    };
                    self.last_heartbeat_seq
                        .fetch_max(heartbeat.sequence, Ordering::SeqCst);
                    self.primary_current_lsn
                        .store(heartbeat.current_lsn, Ordering::SeqCst);

                    // Echo the same sequence straight back.
                    let echo = self.own_heartbeat(heartbeat.sequence);
                    if let Ok(envelope) = Envelope::new(MessageType::Heartbeat, &echo) {
                        let _ = outbound.try_send(envelope);
                    }
                }
                MessageType::WalEntry => {
                    let message: WalEntryMessage = match envelope.decode_as() {
                        Ok(message) => message,
                        Err(e) => {
                            warn!("dropping malformed wal entry: {e}");
                            continue;
                        }
                    };
                    let lsn = message.entry.lsn;
                    match self.apply_guarded(message.entry) {
                        Ok(()) => {
                            self.last_applied_lsn.fetch_max(lsn, Ordering::SeqCst);
                            let ack = Ack {
                                last_applied_lsn: self.last_applied_lsn(),
                                replica_id: self.id.clone(),
                                heartbeat_sequence: self.last_received_heartbeat_seq(),
                            };
                            if let Ok(envelope) = Envelope::new(MessageType::Ack, &ack) {
                                let _ = outbound.try_send(envelope);
                            }
                        }
                        Err(e) => {
                            error!(lsn, "apply failed: {e}");
                        }
                    }
                }
                MessageType::Snapshot => {
                    // Metadata only: validate, log, acknowledge. Streaming
                    // restore is a deliberate gap.
                    let snapshot: SnapshotMessage = match envelope.decode_as() {
                        Ok(snapshot) => snapshot,
                        Err(e) => {
                            warn!("dropping malformed snapshot metadata: {e}");
                            continue;
                        }
                    };
                    if snapshot.snapshot_id.is_empty() {
                        warn!("snapshot metadata missing id, ignoring");
                        continue;
                    }
                    info!(
                        snapshot = %snapshot.snapshot_id,
                        size = snapshot.size,
                        compressed = snapshot.compressed,
                        "snapshot metadata received (restore not implemented)"
                    );
                    let ack = Ack {
                        last_applied_lsn: self.last_applied_lsn(),
                        replica_id: self.id.clone(),
                        heartbeat_sequence: self.last_received_heartbeat_seq(),
                    };
                    if let Ok(envelope) = Envelope::new(MessageType::Ack, &ack) {
                        let _ = outbound.try_send(envelope);
                    }
                }
                MessageType::Error => {
                    let message: ErrorMessage = match envelope.decode_as() {
                        Ok(message) => message,
                        Err(e) => {
                            warn!("dropping malformed error message: {e}");
                            continue;
                        }
                    };
                    error!(code = message.code, fatal = message.fatal, "primary error: {}", message.message);
                    // Either way the receive loop stops and the outer loop
                    // reconnects after the backoff delay.
                    if message.fatal {
                        return Err(GraphdError::FatalPeerError {
                            code: message.code,
                            message: message.message,
                        });
                    }
                    return Err(GraphdError::replication(message.message));
                }
                other => {
                    warn!("unexpected message type {other:?} from primary");
                }
            }
        }
    }

    fn own_heartbeat(&self, sequence: u64) -> Heartbeat {
        Heartbeat {
            from: self.id.clone(),
            sequence,
            current_lsn: self.last_applied_lsn(),
            node_count: self.storage.node_count(),
            edge_count: self.storage.edge_count(),
            lag_ms: 0,
            epoch: self.epoch.load(Ordering::SeqCst),
            term: self.term.load(Ordering::SeqCst),
        }
    }

    /// Apply one record, converting panics into application errors so a bad
    /// payload cannot crash the replica.
    fn apply_guarded(&self, record: Record) -> Result<(), GraphdError> {
        match catch_unwind(AssertUnwindSafe(|| self.apply(record))) {
            Ok(result) => result,
            Err(_) => Err(GraphdError::replication("panic isolated in apply path")),
        }
    }

    fn apply(&self, record: Record) -> Result<(), GraphdError> {
        match record.op_type {
            OpType::CreateNode => {
                let node: Node = serde_json::from_slice(&record.payload)?;
                self.storage.create_node(node)?;
            }
            OpType::CreateEdge => {
                let edge: Edge = serde_json::from_slice(&record.payload)?;
                self.storage.create_edge(edge)?;
            }
            other => {
                // Forward compatibility: unknown operations are skipped, the
                // connection stays up, and the LSN still advances.
                debug!(lsn = record.lsn, "skipping unsupported op type {other:?}");
            }
        }
        Ok(())
    }
}

struct HeartbeatState {
    replica_id: String,
    storage: SharedGraphStore,
    last_applied: Arc<AtomicU64>,
    last_seq: Arc<AtomicU64>,
    epoch: u64,
    term: u64,
}

/// Periodic heartbeat sender. The sequence mirrors the last one the receive
/// loop recorded; replicas never originate sequences of their own.
async fn heartbeat_echo_loop(
    outbound: mpsc::Sender<Envelope>,
    conn_stop: Arc<StopSignal>,
    state: HeartbeatState,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = conn_stop.cancelled() => break,
            _ = ticker.tick() => {
                let heartbeat = Heartbeat {
                    from: state.replica_id.clone(),
                    sequence: state.last_seq.load(Ordering::SeqCst),
                    current_lsn: state.last_applied.load(Ordering::SeqCst),
                    node_count: state.storage.node_count(),
                    edge_count: state.storage.edge_count(),
                    lag_ms: 0,
                    epoch: state.epoch,
                    term: state.term,
                };
                match Envelope::new(MessageType::Heartbeat, &heartbeat) {
                    Ok(envelope) => {
                        if outbound.try_send(envelope).is_err() {
                            debug!("heartbeat skipped, outbound queue unavailable");
                        }
                    }
                    Err(e) => warn!("heartbeat encode failed: {e}"),
                }
            }
        }
    }
}

async fn run_writer(
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::Receiver<Envelope>,
    conn_stop: Arc<StopSignal>,
    write_timeout: Duration,
) {
    loop {
        tokio::select! {
            _ = conn_stop.cancelled() => break,
            maybe = outbound.recv() => match maybe {
                Some(envelope) => {
                    match timeout(write_timeout, write_envelope(&mut writer, &envelope)).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            debug!("writer stopping: {e}");
                            conn_stop.raise();
                            break;
                        }
                        Err(_) => {
                            warn!("write deadline exceeded");
                            conn_stop.raise();
                            break;
                        }
                    }
                }
                None => break,
            },
        }
    }
}
