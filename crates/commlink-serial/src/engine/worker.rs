//! Per-connection worker task.
//!
//! One worker owns the transport of one open port. Its loop polls the
//! receive side, batches reads into `Data` events, and drains the
//! bounded outbound queue. All exits, cooperative or fatal, funnel
//! through a single finalization path that closes the transport and
//! emits `Closed` exactly once.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use bytes::Bytes;
use commlink_core::buffers::BoundedQueue;
use commlink_core::types::{EngineError, ErrorKind, PortConfig};
use log::{debug, error, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::engine::transport::Transport;

/// Maximum bytes pulled from the transport per read.
pub const READ_CHUNK: usize = 4096;
/// A read batch is emitted once it reaches this size.
pub const BATCH_SIZE: usize = 2048;
/// ... or once this much time has passed since its first byte.
pub const BATCH_TIMEOUT: Duration = Duration::from_millis(20);
/// Loop sleep when no I/O happened this iteration.
pub const IDLE_DELAY: Duration = Duration::from_millis(5);
/// Bounded wait for the worker task to finish after `stop()`.
const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Worker events & state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Events a worker reports to its event pump.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// One batched read.
    Data(Bytes),
    /// One outbound chunk written to the transport.
    Sent(Bytes),
    /// Fatal I/O error; the worker shuts down after this.
    Fatal(EngineError),
    /// Final event, emitted exactly once.
    Closed,
}

/// Worker lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Opening,
    Running,
    Closing,
    Closed,
}

impl WorkerState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Opening,
            1 => Self::Running,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Handle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Handle to a spawned connection worker.
pub struct WorkerHandle {
    port_name: String,
    tx_queue: Arc<StdMutex<BoundedQueue<Vec<u8>>>>,
    stop_flag: Arc<AtomicBool>,
    state: Arc<AtomicU8>,
    join: StdMutex<Option<JoinHandle<()>>>,
}

impl WorkerHandle {
    /// Queue an outbound chunk. `QueueFull` is the backpressure
    /// signal; the caller decides whether to wait and retry.
    pub fn enqueue_write(&self, data: Vec<u8>) -> Result<(), EngineError> {
        let mut queue = self
            .tx_queue
            .lock()
            .map_err(|_| poisoned(&self.port_name))?;
        if !queue.push(data) {
            return Err(EngineError::new(
                ErrorKind::QueueFull,
                format!("write queue full ({} chunks)", queue.maxlen()),
            )
            .with_port(&self.port_name));
        }
        Ok(())
    }

    /// Number of chunks waiting in the outbound queue.
    pub fn queue_len(&self) -> usize {
        self.tx_queue.lock().map(|q| q.len()).unwrap_or(0)
    }

    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_running(&self) -> bool {
        self.state() == WorkerState::Running
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    /// Request a cooperative stop and wait (bounded) for the worker to
    /// finish. Idempotent.
    pub async fn stop(&self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        let handle = match self.join.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        if let Some(handle) = handle {
            if tokio::time::timeout(STOP_JOIN_TIMEOUT, handle).await.is_err() {
                warn!("worker for {} did not stop in time", self.port_name);
            }
        }
    }
}

fn poisoned(port: &str) -> EngineError {
    EngineError::new(ErrorKind::Shutdown, "worker queue lock poisoned").with_port(port)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Worker task
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Spawn a worker for an already-open transport. Returns the handle
/// and the event stream for the controller's event pump.
pub fn spawn_worker(
    transport: Arc<dyn Transport>,
    config: &PortConfig,
) -> (Arc<WorkerHandle>, mpsc::UnboundedReceiver<WorkerEvent>) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let tx_queue = Arc::new(StdMutex::new(BoundedQueue::new(config.tx_queue_limit)));
    let stop_flag = Arc::new(AtomicBool::new(false));
    let state = Arc::new(AtomicU8::new(WorkerState::Opening as u8));

    let task = tokio::spawn(run_worker(
        transport,
        config.port_name.clone(),
        Arc::clone(&tx_queue),
        Arc::clone(&stop_flag),
        Arc::clone(&state),
        event_tx,
    ));

    let handle = Arc::new(WorkerHandle {
        port_name: config.port_name.clone(),
        tx_queue,
        stop_flag,
        state,
        join: StdMutex::new(Some(task)),
    });
    (handle, event_rx)
}

async fn run_worker(
    transport: Arc<dyn Transport>,
    port_name: String,
    tx_queue: Arc<StdMutex<BoundedQueue<Vec<u8>>>>,
    stop_flag: Arc<AtomicBool>,
    state: Arc<AtomicU8>,
    event_tx: mpsc::UnboundedSender<WorkerEvent>,
) {
    state.store(WorkerState::Running as u8, Ordering::SeqCst);
    debug!("worker started for {}", port_name);

    let mut batch: Vec<u8> = Vec::new();
    let mut batch_started = Instant::now();

    loop {
        if stop_flag.load(Ordering::SeqCst) {
            break;
        }
        let mut active = false;

        // 1) Poll the receive side.
        match transport.in_waiting().await {
            Ok(n) if n > 0 => match transport.read(READ_CHUNK).await {
                Ok(data) if !data.is_empty() => {
                    if batch.is_empty() {
                        batch_started = Instant::now();
                    }
                    batch.extend_from_slice(&data);
                    active = true;
                }
                Ok(_) => {}
                Err(err) => {
                    error!("read failed on {}: {}", port_name, err);
                    let _ = event_tx.send(WorkerEvent::Fatal(err));
                    break;
                }
            },
            Ok(_) => {}
            Err(err) => {
                error!("poll failed on {}: {}", port_name, err);
                let _ = event_tx.send(WorkerEvent::Fatal(err));
                break;
            }
        }

        // 2) Emit the batch on size or age.
        if !batch.is_empty()
            && (batch.len() >= BATCH_SIZE || batch_started.elapsed() >= BATCH_TIMEOUT)
        {
            let data = std::mem::take(&mut batch);
            let _ = event_tx.send(WorkerEvent::Data(Bytes::from(data)));
        }

        // 3) Drain the outbound queue fully.
        let mut write_error = None;
        loop {
            let chunk = match tx_queue.lock() {
                Ok(mut queue) => queue.pop(),
                Err(_) => None,
            };
            let Some(chunk) = chunk else { break };
            active = true;
            match transport.write(&chunk).await {
                Ok(_) => {
                    let _ = event_tx.send(WorkerEvent::Sent(Bytes::from(chunk)));
                }
                Err(err) => {
                    error!("write failed on {}: {}", port_name, err);
                    write_error = Some(err);
                    break;
                }
            }
        }
        if let Some(err) = write_error {
            let _ = event_tx.send(WorkerEvent::Fatal(err));
            break;
        }

        // 4) Back off only when idle.
        if !active {
            tokio::time::sleep(IDLE_DELAY).await;
        }
    }

    // Finalization, the only exit path.
    state.store(WorkerState::Closing as u8, Ordering::SeqCst);
    if !batch.is_empty() {
        let _ = event_tx.send(WorkerEvent::Data(Bytes::from(batch)));
    }
    if let Err(err) = transport.close().await {
        warn!("close failed on {}: {}", port_name, err);
    }
    state.store(WorkerState::Closed as u8, Ordering::SeqCst);
    let _ = event_tx.send(WorkerEvent::Closed);
    debug!("worker finished for {}", port_name);
}
