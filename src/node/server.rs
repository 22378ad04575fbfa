//! Replica server
//!
//! [`NodeCore`] holds every piece of mutable replica state and is driven
//! synchronously; [`Node`] owns the sockets and runs the single event loop
//! that feeds it. Connection tasks only move lines between sockets and the
//! loop's bounded inbox, so no state is shared across tasks.

use crate::common::audit::{AuditEventType, AuditLog};
use crate::common::metrics::NodeMetrics;
use crate::common::wire::{ClientFrame, Reading, SensorId, ServerFrame};
use crate::common::{timestamp_now_millis, Error, NodeConfig, NodeRole, Result};
use crate::node::ack_window::AckWindowManager;
use crate::node::aggregator::TelemetryAggregator;
use crate::node::fsm::{Event, FailoverCoordinator, FatalCondition, Outcome, State};
use crate::node::heartbeat::HeartbeatBus;
use crate::node::replication::{
    DirectoryMirror, LocalOnly, ReplicaSnapshot, ReplicaTransport, ReplicationStore,
};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

pub struct NodeCore {
    role: NodeRole,
    window_secs: u64,
    coordinator: FailoverCoordinator,
    aggregator: TelemetryAggregator,
    acks: AckWindowManager,
    store: Arc<Mutex<ReplicationStore>>,
    metrics: NodeMetrics,
    audit: AuditLog,
    dirty: bool,
}

impl NodeCore {
    /// Build the core and restore whatever snapshot the store holds.
    pub fn new(config: &NodeConfig, store: ReplicationStore, audit: AuditLog) -> Self {
        let mut core = Self {
            role: config.role,
            window_secs: config.window_secs,
            coordinator: FailoverCoordinator::new(config.role, config.heartbeat_interval_ms),
            aggregator: TelemetryAggregator::new(config.window_secs),
            acks: AckWindowManager::new(),
            store: Arc::new(Mutex::new(store)),
            metrics: NodeMetrics::new(),
            audit,
            dirty: false,
        };
        let state = core.state();
        core.audit.record(
            AuditEventType::Startup,
            None,
            state,
            format!("{} replica starting", core.role),
        );
        core.restore("boot");
        core.refresh_gauges();
        core
    }

    pub fn state(&self) -> State {
        self.coordinator.state()
    }

    pub fn metrics(&self) -> &NodeMetrics {
        &self.metrics
    }

    pub fn aggregator(&self) -> &TelemetryAggregator {
        &self.aggregator
    }

    pub fn acks(&self) -> &AckWindowManager {
        &self.acks
    }

    pub fn coordinator(&self) -> &FailoverCoordinator {
        &self.coordinator
    }

    /// Handle one raw line from a sensor. Malformed lines are dropped.
    pub fn on_client_line(&mut self, line: &str, now_ms: u64) -> Result<Vec<ServerFrame>> {
        match line.parse::<ClientFrame>() {
            Ok(frame) => self.on_client_frame(frame, now_ms),
            Err(e) => {
                self.metrics.malformed_frames.inc();
                tracing::warn!("Dropping client frame: {}", e);
                Ok(Vec::new())
            }
        }
    }

    /// Gate a sensor frame through the coordinator, then apply it. Returns
    /// the frames owed to that sensor; empty if the request is refused.
    pub fn on_client_frame(&mut self, frame: ClientFrame, now_ms: u64) -> Result<Vec<ServerFrame>> {
        let outcome = self.drive(Event::ClientRequest, now_ms)?;
        if !outcome.serve {
            self.metrics.rejected_requests.inc();
            tracing::debug!(
                "Refusing sensor {} while {}",
                frame.sensor_id(),
                outcome.to
            );
            return Ok(Vec::new());
        }

        let frames = match frame {
            ClientFrame::Reading(reading) => self.on_reading(reading),
            ClientFrame::AverageAck {
                sensor_id,
                sequence,
            } => {
                self.on_average_ack(sensor_id, sequence);
                Vec::new()
            }
        };
        self.refresh_gauges();
        Ok(frames)
    }

    /// Feed the peer's published state to the coordinator.
    pub fn on_peer_state(&mut self, peer: State, now_ms: u64) -> Result<()> {
        self.metrics.peer_events.inc();
        self.drive(Event::from_peer(peer), now_ms)?;
        self.refresh_gauges();
        Ok(())
    }

    fn on_reading(&mut self, reading: Reading) -> Vec<ServerFrame> {
        let sensor = reading.sensor_id;
        self.acks
            .register(sensor, self.aggregator.highest_sequence());
        self.acks.queue_reading_ack(reading.clone());
        self.metrics.readings_ingested.inc();

        match self.aggregator.ingest(reading) {
            Some(average) => {
                tracing::debug!(
                    "Average {} = {} from sensor {}",
                    average.sequence,
                    average.value,
                    sensor
                );
                self.acks.record(average);
                self.metrics.averages_emitted.inc();
            }
            None => self.metrics.duplicate_readings.inc(),
        }
        self.dirty = true;

        self.acks.outgoing(sensor)
    }

    fn on_average_ack(&mut self, sensor: SensorId, sequence: u64) {
        let collected =
            self.acks
                .acknowledge(sensor, sequence, self.aggregator.highest_sequence());
        self.metrics.averages_collected.add(collected as u64);
        self.dirty = true;
    }

    /// Run an event through the coordinator and react to the outcome.
    fn drive(&mut self, event: Event, now_ms: u64) -> Result<Outcome> {
        let outcome = match self.coordinator.handle(event, now_ms) {
            Ok(outcome) => outcome,
            Err(condition) => return Err(self.fatal(condition)),
        };

        if outcome.changed() {
            tracing::info!("State {} -> {} on {:?}", outcome.from, outcome.to, event);
            self.audit.record(
                AuditEventType::Transition,
                Some(outcome.from),
                outcome.to,
                format!("{:?}", event),
            );
        }
        if outcome.took_over() {
            self.restore("takeover");
        }
        Ok(outcome)
    }

    fn fatal(&mut self, condition: FatalCondition) -> Error {
        let state = self.state();
        tracing::error!("Fatal: {} (state {})", condition, state);
        self.audit
            .record(AuditEventType::Fatal, None, state, condition.to_string());
        Error::Fatal(condition)
    }

    /// Replace in-memory state with the latest persisted snapshot.
    fn restore(&mut self, reason: &str) {
        let restored = self
            .store
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .load();
        if !restored.fallbacks.is_empty() {
            tracing::warn!(
                "Restore ({}) fell back to empty for {:?}; averages may repeat or be lost",
                reason,
                restored.fallbacks
            );
        }
        let snapshot = restored.snapshot;
        tracing::info!(
            "Restored ({}): {} averages, {} sensors, {} window readings, next sequence {}",
            reason,
            snapshot.averages.len(),
            snapshot.cursors.len(),
            snapshot.window.len(),
            snapshot.next_sequence
        );
        let state = self.state();
        self.audit.record(
            AuditEventType::Restore,
            None,
            state,
            format!("{}: next sequence {}", reason, snapshot.next_sequence),
        );

        self.aggregator =
            TelemetryAggregator::from_parts(snapshot.window, snapshot.next_sequence, self.window_secs);
        self.acks = AckWindowManager::from_parts(snapshot.averages, snapshot.cursors);
        self.metrics.restores.inc();
        self.dirty = false;
    }

    pub fn snapshot(&self) -> ReplicaSnapshot {
        ReplicaSnapshot {
            averages: self.acks.averages().clone(),
            cursors: self.acks.cursors().clone(),
            window: self.aggregator.window().cloned().collect(),
            next_sequence: self.aggregator.next_sequence(),
        }
    }

    /// Shared handle to the artifact store, for writes off the event loop.
    pub fn store(&self) -> Arc<Mutex<ReplicationStore>> {
        Arc::clone(&self.store)
    }

    /// Take the snapshot owed to storage, if any. Only an accepting replica
    /// writes, and only when something changed since the last write.
    pub fn pending_snapshot(&mut self) -> Option<ReplicaSnapshot> {
        if !self.dirty || !self.state().accepts_clients() {
            return None;
        }
        self.dirty = false;
        Some(self.snapshot())
    }

    /// Record the outcome of a snapshot write. A failed write is logged and
    /// retried on the next cycle.
    pub fn persist_done(&mut self, result: Result<()>) {
        match result {
            Ok(()) => self.metrics.snapshots_written.inc(),
            Err(e) => {
                self.dirty = true;
                self.metrics.snapshot_failures.inc();
                tracing::error!("Snapshot write failed, will retry: {}", e);
            }
        }
    }

    /// Persist inline, on the calling thread. Used for the last flush once
    /// the event loop has stopped.
    pub fn persist_cycle(&mut self) {
        if let Some(snapshot) = self.pending_snapshot() {
            let result = self
                .store
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .persist(&snapshot);
            self.persist_done(result);
        }
    }

    fn refresh_gauges(&self) {
        self.metrics.fsm_state.set(self.state().code() as u64);
        self.metrics
            .retained_averages
            .set(self.acks.averages().len() as u64);
        self.metrics
            .known_sensors
            .set(self.acks.cursors().len() as u64);
        self.metrics
            .window_len
            .set(self.aggregator.window_len() as u64);
    }
}

/// Write `snapshot` on the blocking pool so fsync and mirror copies cannot
/// delay heartbeats.
fn persist_blocking(
    store: Arc<Mutex<ReplicationStore>>,
    snapshot: ReplicaSnapshot,
) -> JoinHandle<Result<()>> {
    tokio::task::spawn_blocking(move || {
        let mut store = store.lock().unwrap_or_else(PoisonError::into_inner);
        store.persist(&snapshot)
    })
}

/// A line received from a sensor connection, with the way back.
#[derive(Debug)]
pub struct Inbound {
    pub conn: u64,
    pub line: String,
    pub reply: mpsc::UnboundedSender<String>,
}

enum Wake {
    Client(Option<Inbound>),
    Peer(Result<Option<State>>),
    Tick,
}

pub struct Node {
    core: NodeCore,
    listener: TcpListener,
    heartbeat: HeartbeatBus,
    heartbeat_interval: Duration,
    inbox_capacity: usize,
}

impl Node {
    /// Bind sockets and restore local state. Nothing runs until [`Node::serve`].
    pub async fn bind(config: NodeConfig) -> Result<Self> {
        config.validate()?;

        let transport: Box<dyn ReplicaTransport> = match &config.replica_mirror_dir {
            Some(dir) => Box::new(DirectoryMirror::new(dir)),
            None => Box::new(LocalOnly),
        };
        let store = ReplicationStore::open(&config.data_dir, transport)?;
        let audit = match &config.audit_log {
            Some(path) => AuditLog::open(path),
            None => AuditLog::disabled(),
        };

        let listener = TcpListener::bind(config.client_addr).await?;
        let heartbeat = HeartbeatBus::bind(config.heartbeat_addr, config.peer_heartbeat_addr).await?;
        let core = NodeCore::new(&config, store, audit);

        Ok(Self {
            core,
            listener,
            heartbeat,
            heartbeat_interval: config.heartbeat_interval(),
            inbox_capacity: config.inbox_capacity,
        })
    }

    pub fn client_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn heartbeat_addr(&self) -> Result<SocketAddr> {
        self.heartbeat.local_addr()
    }

    /// Run the event loop until a fatal failover condition.
    pub async fn serve(self) -> Result<()> {
        let Node {
            mut core,
            listener,
            mut heartbeat,
            heartbeat_interval,
            inbox_capacity,
        } = self;

        tracing::info!("Starting {} replica", core.role);
        tracing::info!("  Sensors: {}", listener.local_addr()?);
        tracing::info!("  Heartbeat: {}", heartbeat.local_addr()?);

        let (inbox_tx, mut inbox) = mpsc::channel(inbox_capacity);
        let accept_handle = tokio::spawn(accept_sensors(listener, inbox_tx));

        let mut send_state_at = Instant::now() + heartbeat_interval;
        // at most one snapshot write in flight
        let mut persisting: Option<JoinHandle<Result<()>>> = None;

        let result = loop {
            let wake = tokio::select! {
                inbound = inbox.recv() => Wake::Client(inbound),
                peer = heartbeat.recv() => Wake::Peer(peer),
                _ = sleep_until(send_state_at) => Wake::Tick,
            };

            match wake {
                Wake::Client(Some(inbound)) => {
                    tracing::trace!("conn {}: {}", inbound.conn, inbound.line);
                    match core.on_client_line(&inbound.line, timestamp_now_millis()) {
                        Ok(frames) => {
                            for frame in frames {
                                // a closed connection is the sensor's problem; it will retry
                                let _ = inbound.reply.send(frame.to_string());
                            }
                        }
                        Err(e) => break Err(e),
                    }
                }
                Wake::Client(None) => {
                    break Err(Error::Internal("sensor listener stopped".into()));
                }
                Wake::Peer(Ok(Some(peer))) => {
                    if let Err(e) = core.on_peer_state(peer, timestamp_now_millis()) {
                        break Err(e);
                    }
                }
                Wake::Peer(Ok(None)) => {}
                Wake::Peer(Err(e)) => tracing::warn!("Heartbeat receive failed: {}", e),
                Wake::Tick => {}
            }

            if Instant::now() >= send_state_at {
                match heartbeat.publish(core.state()).await {
                    Ok(()) => core.metrics().heartbeats_sent.inc(),
                    Err(e) => tracing::warn!("Heartbeat publish failed: {}", e),
                }
                tracing::debug!("metrics:\n{}", core.metrics().to_prometheus());
                send_state_at = Instant::now() + heartbeat_interval;
            }

            if persisting.as_ref().map_or(true, |h| h.is_finished()) {
                if let Some(handle) = persisting.take() {
                    core.persist_done(join_persist(handle).await);
                }
                if let Some(snapshot) = core.pending_snapshot() {
                    persisting = Some(persist_blocking(core.store(), snapshot));
                }
            }
        };

        accept_handle.abort();
        if let Some(handle) = persisting {
            core.persist_done(join_persist(handle).await);
        }
        match &result {
            Err(e) if e.is_fatal() => tracing::error!("Replica pair halted: {}", e),
            _ => core.persist_cycle(),
        }
        result
    }
}

async fn join_persist(handle: JoinHandle<Result<()>>) -> Result<()> {
    handle
        .await
        .unwrap_or_else(|e| Err(Error::Internal(format!("snapshot task failed: {}", e))))
}

async fn accept_sensors(listener: TcpListener, inbox: mpsc::Sender<Inbound>) {
    let mut next_conn = 0u64;
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                next_conn += 1;
                tracing::info!("Sensor connection {} from {}", next_conn, addr);
                tokio::spawn(handle_connection(next_conn, stream, inbox.clone()));
            }
            Err(e) => {
                tracing::warn!("Accept failed: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn handle_connection(conn: u64, stream: TcpStream, inbox: mpsc::Sender<Inbound>) {
    let (read_half, mut write_half) = stream.into_split();
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<String>();

    let writer = tokio::spawn(async move {
        while let Some(mut line) = reply_rx.recv().await {
            line.push('\n');
            if let Err(e) = write_half.write_all(line.as_bytes()).await {
                tracing::debug!("conn {}: write failed: {}", conn, e);
                break;
            }
        }
    });

    let mut lines = BufReader::new(read_half).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let inbound = Inbound {
                    conn,
                    line,
                    reply: reply_tx.clone(),
                };
                if inbox.send(inbound).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!("conn {}: read failed: {}", conn, e);
                break;
            }
        }
    }

    tracing::info!("Sensor connection {} closed", conn);
    drop(reply_tx);
    let _ = writer.await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn core_in(dir: &std::path::Path, role: NodeRole) -> NodeCore {
        let mut config = NodeConfig::for_role(role);
        config.data_dir = dir.to_path_buf();
        let store = ReplicationStore::open(dir, Box::new(LocalOnly)).unwrap();
        NodeCore::new(&config, store, AuditLog::disabled())
    }

    #[test]
    fn test_primary_serves_reading() {
        let dir = tempdir().unwrap();
        let mut core = core_in(dir.path(), NodeRole::Primary);

        let frames = core.on_client_line("5,0,Speed,90,1000", 1).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].to_string(), "5,0,Speed,90,1000");
        assert_eq!(frames[1].to_string(), "0,Average,90,1000");
    }

    #[test]
    fn test_malformed_line_dropped() {
        let dir = tempdir().unwrap();
        let mut core = core_in(dir.path(), NodeRole::Primary);
        assert!(core.on_client_line("garbage", 1).unwrap().is_empty());
        assert_eq!(core.metrics().malformed_frames.get(), 1);
        // next frame still processed
        assert_eq!(core.on_client_line("5,0,Speed,90,1000", 2).unwrap().len(), 2);
    }

    #[test]
    fn test_persist_only_when_accepting_and_dirty() {
        let dir = tempdir().unwrap();
        let mut core = core_in(dir.path(), NodeRole::Primary);
        core.persist_cycle();
        assert_eq!(core.metrics().snapshots_written.get(), 0);

        core.on_client_line("5,0,Speed,90,1000", 1).unwrap();
        core.persist_cycle();
        core.persist_cycle();
        assert_eq!(core.metrics().snapshots_written.get(), 1);
    }

    #[test]
    fn test_failed_write_is_retried() {
        let dir = tempdir().unwrap();
        let mut core = core_in(dir.path(), NodeRole::Primary);
        core.on_client_line("5,0,Speed,90,1000", 1).unwrap();

        let snapshot = core.pending_snapshot().unwrap();
        assert!(core.pending_snapshot().is_none());
        core.persist_done(Err(Error::Transport("mirror unreachable".into())));
        assert_eq!(core.metrics().snapshot_failures.get(), 1);

        assert_eq!(core.pending_snapshot(), Some(snapshot));
    }

    #[tokio::test]
    async fn test_blocking_persist_writes_artifacts() {
        let dir = tempdir().unwrap();
        let mut core = core_in(dir.path(), NodeRole::Primary);
        core.on_client_line("5,0,Speed,90,1000", 1).unwrap();

        let snapshot = core.pending_snapshot().unwrap();
        let handle = persist_blocking(core.store(), snapshot.clone());
        core.persist_done(join_persist(handle).await);
        assert_eq!(core.metrics().snapshots_written.get(), 1);

        let restored = core.store().lock().unwrap().load();
        assert_eq!(restored.snapshot, snapshot);
    }

    #[test]
    fn test_backup_serving_before_contact_is_fatal() {
        let dir = tempdir().unwrap();
        let mut core = core_in(dir.path(), NodeRole::Backup);
        let err = core.on_client_line("5,0,Speed,90,1000", 1).unwrap_err();
        assert!(err.is_fatal());
    }
}
