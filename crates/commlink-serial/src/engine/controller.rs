//! Connection controller.
//!
//! The controller is the engine's front door: it owns the connection
//! registry, spawns one worker and one event pump per open port, fans
//! worker events out through the [`EventBus`], and arbitrates the
//! per-port file transfer slot.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use commlink_core::events::{EngineEvent, EventBus, Subscription};
use commlink_core::types::{EngineError, ErrorKind, FramingKind, Packet, PortConfig};
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::sync::RwLock;

use crate::engine::logging::{LogConfig, LogWriter};
use crate::engine::parser::{make_parser, PacketParser};
use crate::engine::transport::{SimulatedTransport, Transport};
use crate::engine::worker::{spawn_worker, WorkerEvent, WorkerHandle};

/// Bounded wait for a cancelled transfer to unregister, and for a
/// stopped worker's pump to deregister the connection.
const CLOSE_WAIT_TIMEOUT: Duration = Duration::from_secs(2);
const CLOSE_POLL_INTERVAL: Duration = Duration::from_millis(10);

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Registry entries
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct Connection {
    config: PortConfig,
    worker: Arc<WorkerHandle>,
    parser: Arc<StdMutex<Box<dyn PacketParser>>>,
    capture: Arc<StdMutex<Option<LogWriter>>>,
}

struct TransferTicket {
    transfer_id: String,
    cancel: Arc<AtomicBool>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Controller
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Multi-port connection registry and event hub.
pub struct ConnectionController {
    connections: Arc<RwLock<HashMap<String, Connection>>>,
    transfers: Arc<RwLock<HashMap<String, TransferTicket>>>,
    events: Arc<EventBus>,
}

impl ConnectionController {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            connections: Arc::new(RwLock::new(HashMap::new())),
            transfers: Arc::new(RwLock::new(HashMap::new())),
            events: Arc::new(EventBus::new()),
        })
    }

    /// The engine event bus, shared with the transfer and macro
    /// services.
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn subscribe(&self) -> Subscription {
        self.events.subscribe()
    }

    pub fn unsubscribe(&self, id: u64) {
        self.events.unsubscribe(id);
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Open a connection on a simulated transport.
    pub async fn open_connection(&self, config: PortConfig) -> Result<(), EngineError> {
        let transport = SimulatedTransport::new(config.port_name.clone());
        self.open_connection_with(config, transport).await
    }

    /// Open a connection on a caller-supplied transport back-end.
    ///
    /// Rejects empty port names and duplicates without side effects.
    pub async fn open_connection_with(
        &self,
        config: PortConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<(), EngineError> {
        if config.port_name.is_empty() {
            return Err(EngineError::new(
                ErrorKind::InvalidConfig,
                "port name must not be empty",
            ));
        }
        {
            let connections = self.connections.read().await;
            if connections.contains_key(&config.port_name) {
                return Err(EngineError::new(
                    ErrorKind::AlreadyOpen,
                    format!("connection already open on {}", config.port_name),
                )
                .with_port(&config.port_name));
            }
        }

        transport.open(&config).await?;
        info!("opened {} ({})", config.port_name, config.shorthand());

        let (worker, event_rx) = spawn_worker(Arc::clone(&transport), &config);
        let parser: Arc<StdMutex<Box<dyn PacketParser>>> =
            Arc::new(StdMutex::new(make_parser(&FramingKind::Raw)));
        let capture: Arc<StdMutex<Option<LogWriter>>> = Arc::new(StdMutex::new(None));

        let connection = Connection {
            config: config.clone(),
            worker,
            parser: Arc::clone(&parser),
            capture: Arc::clone(&capture),
        };
        {
            // Re-check under the write lock: a concurrent open of the
            // same name may have won while the transport was opening.
            let mut connections = self.connections.write().await;
            if connections.contains_key(&config.port_name) {
                drop(connections);
                // back out: stopping the worker closes the transport,
                // and with no pump spawned the surviving connection's
                // registry entry is untouched
                connection.worker.stop().await;
                return Err(EngineError::new(
                    ErrorKind::AlreadyOpen,
                    format!("connection already open on {}", config.port_name),
                )
                .with_port(&config.port_name));
            }
            connections.insert(config.port_name.clone(), connection);
        }

        spawn_event_pump(
            config.port_name.clone(),
            event_rx,
            parser,
            capture,
            Arc::clone(&self.connections),
            Arc::clone(&self.events),
        );

        self.events.emit(EngineEvent::PortOpened {
            port_name: config.port_name,
        });
        Ok(())
    }

    /// Close one connection, or all of them when `port_name` is
    /// `None`. Cancels any in-flight transfer on the port first and
    /// waits (bounded) for it to unregister.
    pub async fn close_connection(&self, port_name: Option<&str>) -> Result<(), EngineError> {
        match port_name {
            Some(name) => self.close_one(name).await,
            None => {
                let names: Vec<String> = {
                    let connections = self.connections.read().await;
                    connections.keys().cloned().collect()
                };
                for name in names {
                    if let Err(err) = self.close_one(&name).await {
                        warn!("close failed on {}: {}", name, err);
                    }
                }
                Ok(())
            }
        }
    }

    async fn close_one(&self, name: &str) -> Result<(), EngineError> {
        // Cancel a registered transfer and wait for it to let go.
        let cancel = {
            let transfers = self.transfers.read().await;
            transfers.get(name).map(|t| Arc::clone(&t.cancel))
        };
        if let Some(cancel) = cancel {
            cancel.store(true, Ordering::SeqCst);
            let deadline = tokio::time::Instant::now() + CLOSE_WAIT_TIMEOUT;
            loop {
                {
                    let transfers = self.transfers.read().await;
                    if !transfers.contains_key(name) {
                        break;
                    }
                }
                if tokio::time::Instant::now() >= deadline {
                    warn!("transfer on {} did not unregister in time", name);
                    break;
                }
                tokio::time::sleep(CLOSE_POLL_INTERVAL).await;
            }
        }

        let worker = {
            let connections = self.connections.read().await;
            match connections.get(name) {
                Some(conn) => Arc::clone(&conn.worker),
                None => {
                    return Err(EngineError::new(
                        ErrorKind::PortNotFound,
                        format!("no open connection on {}", name),
                    )
                    .with_port(name))
                }
            }
        };
        worker.stop().await;

        // The pump deregisters on the worker's Closed event.
        let deadline = tokio::time::Instant::now() + CLOSE_WAIT_TIMEOUT;
        loop {
            {
                let connections = self.connections.read().await;
                if !connections.contains_key(name) {
                    break;
                }
            }
            if tokio::time::Instant::now() >= deadline {
                warn!("pump for {} did not deregister in time", name);
                break;
            }
            tokio::time::sleep(CLOSE_POLL_INTERVAL).await;
        }
        Ok(())
    }

    pub async fn is_connected(&self, name: &str) -> bool {
        let connections = self.connections.read().await;
        connections.contains_key(name)
    }

    pub async fn list_connections(&self) -> Vec<String> {
        let connections = self.connections.read().await;
        connections.keys().cloned().collect()
    }

    pub async fn get_config(&self, name: &str) -> Result<PortConfig, EngineError> {
        let connections = self.connections.read().await;
        connections
            .get(name)
            .map(|c| c.config.clone())
            .ok_or_else(|| not_found(name))
    }

    // ── Sending ──────────────────────────────────────────────────────

    /// Queue bytes for transmission on one port.
    pub async fn send_data(&self, name: &str, data: Vec<u8>) -> Result<(), EngineError> {
        let connections = self.connections.read().await;
        let conn = connections.get(name).ok_or_else(|| not_found(name))?;
        conn.worker.enqueue_write(data)
    }

    /// Queue bytes on every broadcast-enabled connection. Ports with a
    /// full queue are skipped. Returns the number of ports reached.
    pub async fn send_broadcast_data(&self, data: &[u8]) -> usize {
        self.send_to_many(data, true).await
    }

    /// Queue bytes on every connection regardless of the broadcast
    /// flag. Returns the number of ports reached.
    pub async fn send_data_to_all(&self, data: &[u8]) -> usize {
        self.send_to_many(data, false).await
    }

    async fn send_to_many(&self, data: &[u8], respect_flag: bool) -> usize {
        let connections = self.connections.read().await;
        let mut sent = 0;
        for (name, conn) in connections.iter() {
            if respect_flag && !conn.config.broadcast_enabled {
                continue;
            }
            match conn.worker.enqueue_write(data.to_vec()) {
                Ok(()) => sent += 1,
                Err(err) => warn!("broadcast skipped {}: {}", name, err),
            }
        }
        sent
    }

    /// Depth of a port's outbound queue, the backpressure signal.
    pub async fn get_write_queue_size(&self, name: &str) -> Result<usize, EngineError> {
        let connections = self.connections.read().await;
        let conn = connections.get(name).ok_or_else(|| not_found(name))?;
        Ok(conn.worker.queue_len())
    }

    // ── Framing ──────────────────────────────────────────────────────

    /// Swap a connection's packet parser. Partial frame state from the
    /// previous parser is discarded.
    pub async fn set_framing(&self, name: &str, kind: &FramingKind) -> Result<(), EngineError> {
        self.set_parser(name, make_parser(kind)).await
    }

    /// Install a concrete parser, for delimiter or frame-length values
    /// the factory defaults don't cover.
    pub async fn set_parser(
        &self,
        name: &str,
        parser: Box<dyn PacketParser>,
    ) -> Result<(), EngineError> {
        let connections = self.connections.read().await;
        let conn = connections.get(name).ok_or_else(|| not_found(name))?;
        let mut slot = conn
            .parser
            .lock()
            .map_err(|_| EngineError::new(ErrorKind::Shutdown, "parser lock poisoned"))?;
        debug!("framing on {} set to {}", name, parser.framing().label());
        *slot = parser;
        Ok(())
    }

    // ── File transfer slot ───────────────────────────────────────────

    /// Claim the port's single transfer slot. Returns the cooperative
    /// cancellation flag for the transfer task.
    pub async fn register_file_transfer(
        &self,
        name: &str,
        transfer_id: &str,
    ) -> Result<Arc<AtomicBool>, EngineError> {
        {
            let connections = self.connections.read().await;
            if !connections.contains_key(name) {
                return Err(not_found(name));
            }
        }
        let mut transfers = self.transfers.write().await;
        if transfers.contains_key(name) {
            return Err(EngineError::new(
                ErrorKind::TransferBusy,
                format!("a transfer is already active on {}", name),
            )
            .with_port(name));
        }
        let cancel = Arc::new(AtomicBool::new(false));
        transfers.insert(
            name.to_string(),
            TransferTicket {
                transfer_id: transfer_id.to_string(),
                cancel: Arc::clone(&cancel),
            },
        );
        Ok(cancel)
    }

    /// Release the transfer slot. Unknown or mismatched tickets are
    /// ignored, so the call is idempotent.
    pub async fn unregister_file_transfer(&self, name: &str, transfer_id: &str) {
        let mut transfers = self.transfers.write().await;
        if transfers
            .get(name)
            .map(|t| t.transfer_id == transfer_id)
            .unwrap_or(false)
        {
            transfers.remove(name);
        }
    }

    /// Request cancellation of the port's active transfer, if any.
    pub async fn cancel_transfer(&self, name: &str) -> bool {
        let transfers = self.transfers.read().await;
        match transfers.get(name) {
            Some(ticket) => {
                ticket.cancel.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    pub async fn has_active_transfer(&self, name: &str) -> bool {
        let transfers = self.transfers.read().await;
        transfers.contains_key(name)
    }

    // ── Capture logging ──────────────────────────────────────────────

    /// Start writing the port's traffic to a capture log.
    pub async fn start_capture(&self, name: &str, config: LogConfig) -> Result<(), EngineError> {
        let connections = self.connections.read().await;
        let conn = connections.get(name).ok_or_else(|| not_found(name))?;
        let mut writer = LogWriter::new(config)?;
        writer.write_header(name, &conn.config.shorthand())?;
        let mut slot = conn
            .capture
            .lock()
            .map_err(|_| EngineError::new(ErrorKind::Shutdown, "capture lock poisoned"))?;
        *slot = Some(writer);
        Ok(())
    }

    /// Stop and close the port's capture log, if one is running.
    pub async fn stop_capture(&self, name: &str) -> Result<(), EngineError> {
        let connections = self.connections.read().await;
        let conn = connections.get(name).ok_or_else(|| not_found(name))?;
        let mut slot = conn
            .capture
            .lock()
            .map_err(|_| EngineError::new(ErrorKind::Shutdown, "capture lock poisoned"))?;
        if let Some(mut writer) = slot.take() {
            writer.flush()?;
            writer.close();
        }
        Ok(())
    }
}

fn not_found(name: &str) -> EngineError {
    EngineError::new(
        ErrorKind::PortNotFound,
        format!("no open connection on {}", name),
    )
    .with_port(name)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Event pump
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Per-connection task that translates worker events into engine
/// events. Raw data is always emitted before the packets derived from
/// the same read, and deregistration happens exactly once, on the
/// worker's final `Closed` event.
fn spawn_event_pump(
    port_name: String,
    mut event_rx: mpsc::UnboundedReceiver<WorkerEvent>,
    parser: Arc<StdMutex<Box<dyn PacketParser>>>,
    capture: Arc<StdMutex<Option<LogWriter>>>,
    connections: Arc<RwLock<HashMap<String, Connection>>>,
    events: Arc<EventBus>,
) {
    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            match event {
                WorkerEvent::Data(data) => {
                    log_capture(&capture, &port_name, true, &data);
                    events.emit(EngineEvent::DataReceived {
                        port_name: port_name.clone(),
                        data: data.clone(),
                        timestamp: Utc::now(),
                    });
                    let packets: Vec<Packet> = match parser.lock() {
                        Ok(mut p) => p.parse(&data),
                        Err(_) => Vec::new(),
                    };
                    for packet in packets {
                        events.emit(EngineEvent::PacketReceived {
                            port_name: port_name.clone(),
                            packet,
                        });
                    }
                }
                WorkerEvent::Sent(data) => {
                    log_capture(&capture, &port_name, false, &data);
                    events.emit(EngineEvent::DataSent {
                        port_name: port_name.clone(),
                        data,
                        timestamp: Utc::now(),
                    });
                }
                WorkerEvent::Fatal(error) => {
                    events.emit(EngineEvent::PortError {
                        port_name: port_name.clone(),
                        error,
                    });
                }
                WorkerEvent::Closed => {
                    {
                        let mut map = connections.write().await;
                        map.remove(&port_name);
                    }
                    if let Ok(mut slot) = capture.lock() {
                        if let Some(mut writer) = slot.take() {
                            let _ = writer.flush();
                            writer.close();
                        }
                    }
                    events.emit(EngineEvent::PortClosed {
                        port_name: port_name.clone(),
                    });
                    break;
                }
            }
        }
    });
}

fn log_capture(
    capture: &Arc<StdMutex<Option<LogWriter>>>,
    port_name: &str,
    rx: bool,
    data: &Bytes,
) {
    if let Ok(mut slot) = capture.lock() {
        if let Some(writer) = slot.as_mut() {
            let result = if rx {
                writer.log_rx(data)
            } else {
                writer.log_tx(data)
            };
            if let Err(err) = result {
                warn!("capture write failed on {}: {}", port_name, err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::parser::DelimiterParser;
    use tokio::time::{sleep, timeout};

    fn config(port: &str) -> PortConfig {
        PortConfig {
            port_name: port.to_string(),
            ..Default::default()
        }
    }

    async fn recv_event(sub: &mut Subscription) -> EngineEvent {
        timeout(Duration::from_secs(1), sub.receiver.recv())
            .await
            .expect("timed out waiting for engine event")
            .expect("event bus closed")
    }

    #[tokio::test]
    async fn test_open_and_close_connection() {
        let controller = ConnectionController::new();
        let mut sub = controller.subscribe();

        controller.open_connection(config("COM1")).await.unwrap();
        assert!(controller.is_connected("COM1").await);
        match recv_event(&mut sub).await {
            EngineEvent::PortOpened { port_name } => assert_eq!(port_name, "COM1"),
            other => panic!("unexpected event: {:?}", other),
        }

        controller.close_connection(Some("COM1")).await.unwrap();
        assert!(!controller.is_connected("COM1").await);
        match recv_event(&mut sub).await {
            EngineEvent::PortClosed { port_name } => assert_eq!(port_name, "COM1"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_duplicate_open_rejected() {
        let controller = ConnectionController::new();
        controller.open_connection(config("COM1")).await.unwrap();
        let err = controller.open_connection(config("COM1")).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::AlreadyOpen);
        // the original connection is untouched
        assert!(controller.is_connected("COM1").await);
        controller.close_connection(None).await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_port_name_rejected() {
        let controller = ConnectionController::new();
        let err = controller.open_connection(config("")).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidConfig);
    }

    #[tokio::test]
    async fn test_open_failure_leaves_no_connection() {
        let controller = ConnectionController::new();
        let transport = SimulatedTransport::new("COM1");
        transport.fail_next_open();
        let err = controller
            .open_connection_with(config("COM1"), transport)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::OpenFailed);
        assert!(!controller.is_connected("COM1").await);
    }

    /// Transport whose `open` takes long enough for another open of
    /// the same name to interleave.
    struct SlowOpenTransport {
        inner: Arc<SimulatedTransport>,
    }

    #[async_trait::async_trait]
    impl crate::engine::transport::Transport for SlowOpenTransport {
        async fn open(&self, config: &PortConfig) -> Result<(), EngineError> {
            sleep(Duration::from_millis(100)).await;
            self.inner.open(config).await
        }
        async fn close(&self) -> Result<(), EngineError> {
            self.inner.close().await
        }
        async fn read(&self, max: usize) -> Result<Vec<u8>, EngineError> {
            self.inner.read(max).await
        }
        async fn write(&self, buf: &[u8]) -> Result<usize, EngineError> {
            self.inner.write(buf).await
        }
        async fn in_waiting(&self) -> Result<usize, EngineError> {
            self.inner.in_waiting().await
        }
        fn is_open(&self) -> bool {
            self.inner.is_open()
        }
        fn port_name(&self) -> &str {
            self.inner.port_name()
        }
    }

    #[tokio::test]
    async fn test_concurrent_opens_of_same_port_leave_one_connection() {
        let controller = ConnectionController::new();
        let a = Arc::new(SlowOpenTransport {
            inner: SimulatedTransport::new("COM1"),
        });
        let b = Arc::new(SlowOpenTransport {
            inner: SimulatedTransport::new("COM1"),
        });

        let (ra, rb) = tokio::join!(
            controller.open_connection_with(config("COM1"), a.clone()),
            controller.open_connection_with(config("COM1"), b.clone()),
        );

        // exactly one open wins, the other is rejected
        assert_ne!(ra.is_ok(), rb.is_ok());
        let err = ra.err().or(rb.err()).unwrap();
        assert_eq!(err.kind, ErrorKind::AlreadyOpen);

        // the loser's transport was closed during the back-out
        sleep(Duration::from_millis(20)).await;
        assert_ne!(a.inner.is_open(), b.inner.is_open());

        // no orphaned pump removes the survivor later
        sleep(Duration::from_millis(100)).await;
        assert!(controller.is_connected("COM1").await);
        assert_eq!(controller.list_connections().await.len(), 1);

        controller.close_connection(Some("COM1")).await.unwrap();
        assert!(!controller.is_connected("COM1").await);
    }

    #[tokio::test]
    async fn test_raw_data_before_derived_packets() {
        let controller = ConnectionController::new();
        let transport = SimulatedTransport::new("COM1");
        controller
            .open_connection_with(config("COM1"), transport.clone())
            .await
            .unwrap();
        controller
            .set_framing("COM1", &FramingKind::AtLine)
            .await
            .unwrap();
        let mut sub = controller.subscribe();

        transport.inject_rx(b"OK\r\n").await;

        match recv_event(&mut sub).await {
            EngineEvent::DataReceived { data, .. } => assert_eq!(&data[..], b"OK\r\n"),
            other => panic!("expected raw data first, got {:?}", other),
        }
        match recv_event(&mut sub).await {
            EngineEvent::PacketReceived { packet, .. } => {
                assert_eq!(&packet.data[..], b"OK\r\n");
                assert_eq!(packet.framing, FramingKind::AtLine);
            }
            other => panic!("expected packet second, got {:?}", other),
        }
        controller.close_connection(None).await.unwrap();
    }

    #[tokio::test]
    async fn test_send_data_reaches_wire() {
        let controller = ConnectionController::new();
        let transport = SimulatedTransport::new("COM1");
        controller
            .open_connection_with(config("COM1"), transport.clone())
            .await
            .unwrap();
        let mut sub = controller.subscribe();

        controller.send_data("COM1", b"ping".to_vec()).await.unwrap();
        match recv_event(&mut sub).await {
            EngineEvent::DataSent { data, .. } => assert_eq!(&data[..], b"ping"),
            other => panic!("unexpected event: {:?}", other),
        }
        sleep(Duration::from_millis(20)).await;
        assert_eq!(transport.drain_tx().await, b"ping");
        controller.close_connection(None).await.unwrap();
    }

    #[tokio::test]
    async fn test_send_to_unknown_port() {
        let controller = ConnectionController::new();
        let err = controller
            .send_data("COM9", b"x".to_vec())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::PortNotFound);
    }

    #[tokio::test]
    async fn test_broadcast_respects_flag() {
        let controller = ConnectionController::new();
        controller.open_connection(config("COM1")).await.unwrap();
        let mut muted = config("COM2");
        muted.broadcast_enabled = false;
        controller.open_connection(muted).await.unwrap();

        assert_eq!(controller.send_broadcast_data(b"hello").await, 1);
        assert_eq!(controller.send_data_to_all(b"hello").await, 2);
        controller.close_connection(None).await.unwrap();
    }

    #[tokio::test]
    async fn test_custom_delimiter_parser() {
        let controller = ConnectionController::new();
        let transport = SimulatedTransport::new("COM1");
        controller
            .open_connection_with(config("COM1"), transport.clone())
            .await
            .unwrap();
        controller
            .set_parser("COM1", Box::new(DelimiterParser::new(vec![b';'])))
            .await
            .unwrap();
        let mut sub = controller.subscribe();

        transport.inject_rx(b"a;b;").await;
        let mut packets = Vec::new();
        for _ in 0..3 {
            if let EngineEvent::PacketReceived { packet, .. } = recv_event(&mut sub).await {
                packets.push(packet.data.to_vec());
            }
        }
        assert_eq!(packets, vec![b"a;".to_vec(), b"b;".to_vec()]);
        controller.close_connection(None).await.unwrap();
    }

    #[tokio::test]
    async fn test_fatal_error_emits_port_error_then_closed() {
        let controller = ConnectionController::new();
        let transport = SimulatedTransport::new("COM1");
        controller
            .open_connection_with(config("COM1"), transport.clone())
            .await
            .unwrap();
        let mut sub = controller.subscribe();

        transport.fail_writes(true);
        controller.send_data("COM1", b"doomed".to_vec()).await.unwrap();

        match recv_event(&mut sub).await {
            EngineEvent::PortError { error, .. } => {
                assert_eq!(error.kind, ErrorKind::WriteFailed)
            }
            other => panic!("unexpected event: {:?}", other),
        }
        match recv_event(&mut sub).await {
            EngineEvent::PortClosed { port_name } => assert_eq!(port_name, "COM1"),
            other => panic!("unexpected event: {:?}", other),
        }
        // the pump deregistered the dead connection
        sleep(Duration::from_millis(20)).await;
        assert!(!controller.is_connected("COM1").await);
    }

    #[tokio::test]
    async fn test_transfer_slot_is_exclusive() {
        let controller = ConnectionController::new();
        controller.open_connection(config("COM1")).await.unwrap();

        let cancel = controller
            .register_file_transfer("COM1", "t-1")
            .await
            .unwrap();
        assert!(!cancel.load(Ordering::SeqCst));
        let err = controller
            .register_file_transfer("COM1", "t-2")
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::TransferBusy);

        // unregister with the wrong id is a no-op
        controller.unregister_file_transfer("COM1", "t-2").await;
        assert!(controller.has_active_transfer("COM1").await);
        controller.unregister_file_transfer("COM1", "t-1").await;
        assert!(!controller.has_active_transfer("COM1").await);
        controller.close_connection(None).await.unwrap();
    }

    #[tokio::test]
    async fn test_close_cancels_registered_transfer() {
        let controller = ConnectionController::new();
        controller.open_connection(config("COM1")).await.unwrap();
        let cancel = controller
            .register_file_transfer("COM1", "t-1")
            .await
            .unwrap();

        // Simulated transfer task: unregisters once cancelled.
        let ctrl = Arc::clone(&controller);
        let flag = Arc::clone(&cancel);
        let task = tokio::spawn(async move {
            while !flag.load(Ordering::SeqCst) {
                sleep(Duration::from_millis(5)).await;
            }
            ctrl.unregister_file_transfer("COM1", "t-1").await;
        });

        controller.close_connection(Some("COM1")).await.unwrap();
        task.await.unwrap();
        assert!(cancel.load(Ordering::SeqCst));
        assert!(!controller.has_active_transfer("COM1").await);
        assert!(!controller.is_connected("COM1").await);
    }

    #[tokio::test]
    async fn test_capture_records_traffic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("com1.log");
        let controller = ConnectionController::new();
        let transport = SimulatedTransport::new("COM1");
        controller
            .open_connection_with(config("COM1"), transport.clone())
            .await
            .unwrap();
        controller
            .start_capture(
                "COM1",
                LogConfig {
                    file_path: path.to_string_lossy().to_string(),
                    format: crate::engine::logging::LogFormat::PlainText,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        controller.send_data("COM1", b"ping".to_vec()).await.unwrap();
        transport.inject_rx(b"pong").await;
        sleep(Duration::from_millis(100)).await;
        controller.stop_capture("COM1").await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains(">>> ping"));
        assert!(contents.contains("<<< pong"));
        controller.close_connection(None).await.unwrap();
    }
}
