//! Backpressure-aware file transfer.
//!
//! Sends a file over an open connection in raw chunks, gated by the
//! port's outbound queue depth and paced to the configured baud rate.
//! One transfer per port; the slot is arbitrated by the controller.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use commlink_core::events::EngineEvent;
use commlink_core::types::{EngineError, ErrorKind, PortConfig};
use log::{debug, info, warn};
use tokio::io::AsyncReadExt;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::engine::controller::ConnectionController;

/// Queue depth above which the sender waits before the next chunk.
pub const BACKPRESSURE_THRESHOLD: usize = 8;
/// Poll interval while waiting for queue room.
const BACKPRESSURE_POLL: Duration = Duration::from_millis(10);
/// Chunk sizes by line speed.
const CHUNK_FAST: usize = 1024;
const CHUNK_SLOW: usize = 256;
/// Baud rate at and above which the large chunk size is used.
const FAST_BAUD: u32 = 57600;

/// Chunk size for a given baud rate.
pub fn chunk_size_for_baud(baud: u32) -> usize {
    if baud >= FAST_BAUD {
        CHUNK_FAST
    } else {
        CHUNK_SLOW
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Handle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Handle to a running file transfer.
#[derive(Debug)]
pub struct FileTransferHandle {
    transfer_id: String,
    port_name: String,
    cancel: Arc<AtomicBool>,
    join: StdMutex<Option<JoinHandle<bool>>>,
}

impl FileTransferHandle {
    pub fn transfer_id(&self) -> &str {
        &self.transfer_id
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    /// Request cooperative cancellation.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Wait for the transfer to finish. Returns `true` when the whole
    /// file was sent.
    pub async fn wait(&self) -> bool {
        let handle = match self.join.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        match handle {
            Some(handle) => handle.await.unwrap_or(false),
            None => false,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Service
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct FileTransferService;

impl FileTransferService {
    /// Start sending `path` over `port_name`. Claims the port's
    /// transfer slot and stats the file before spawning; on either
    /// failure nothing runs and a `FileError` is emitted.
    pub async fn start(
        controller: Arc<ConnectionController>,
        port_name: &str,
        path: impl AsRef<Path>,
    ) -> Result<FileTransferHandle, EngineError> {
        let transfer_id = Uuid::new_v4().to_string();
        let path: PathBuf = path.as_ref().to_path_buf();

        let config = controller.get_config(port_name).await?;
        let cancel = controller
            .register_file_transfer(port_name, &transfer_id)
            .await
            .map_err(|err| {
                emit_file_error(&controller, port_name, &transfer_id, &err);
                err
            })?;

        let total = match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => meta.len(),
            _ => {
                let err = EngineError::new(
                    ErrorKind::FileNotFound,
                    format!("file not found: {}", path.display()),
                )
                .with_port(port_name);
                controller
                    .unregister_file_transfer(port_name, &transfer_id)
                    .await;
                emit_file_error(&controller, port_name, &transfer_id, &err);
                return Err(err);
            }
        };
        info!(
            "transfer {} started: {} ({} bytes) on {}",
            transfer_id,
            path.display(),
            total,
            port_name
        );

        let task = tokio::spawn(run_transfer(
            Arc::clone(&controller),
            config,
            path,
            total,
            transfer_id.clone(),
            Arc::clone(&cancel),
        ));

        Ok(FileTransferHandle {
            transfer_id,
            port_name: port_name.to_string(),
            cancel,
            join: StdMutex::new(Some(task)),
        })
    }
}

fn emit_file_error(
    controller: &ConnectionController,
    port_name: &str,
    transfer_id: &str,
    error: &EngineError,
) {
    controller.events().emit(EngineEvent::FileError {
        port_name: port_name.to_string(),
        transfer_id: transfer_id.to_string(),
        error: error.clone(),
    });
}

async fn run_transfer(
    controller: Arc<ConnectionController>,
    config: PortConfig,
    path: PathBuf,
    total: u64,
    transfer_id: String,
    cancel: Arc<AtomicBool>,
) -> bool {
    let port_name = config.port_name.clone();
    let baud = config.baud_rate.value();
    let chunk_size = chunk_size_for_baud(baud);
    let pace = !config.flow_control.is_hardware();

    let result = send_loop(
        &controller,
        &config,
        &path,
        total,
        &transfer_id,
        &cancel,
        chunk_size,
        pace,
    )
    .await;

    // Single finalization path for EOF, cancel, and error.
    controller
        .unregister_file_transfer(&port_name, &transfer_id)
        .await;
    let success = match result {
        Ok(()) => true,
        Err(err) => {
            if err.kind != ErrorKind::TransferAborted {
                warn!("transfer {} failed: {}", transfer_id, err);
                emit_file_error(&controller, &port_name, &transfer_id, &err);
            } else {
                debug!("transfer {} cancelled", transfer_id);
            }
            false
        }
    };
    controller.events().emit(EngineEvent::FileCompleted {
        port_name,
        transfer_id,
        success,
    });
    success
}

#[allow(clippy::too_many_arguments)]
async fn send_loop(
    controller: &ConnectionController,
    config: &PortConfig,
    path: &Path,
    total: u64,
    transfer_id: &str,
    cancel: &AtomicBool,
    chunk_size: usize,
    pace: bool,
) -> Result<(), EngineError> {
    let port_name = &config.port_name;
    let mut file = tokio::fs::File::open(path).await.map_err(|e| {
        EngineError::new(
            ErrorKind::FileNotFound,
            format!("cannot open {}: {}", path.display(), e),
        )
        .with_port(port_name)
    })?;

    let mut chunk = vec![0u8; chunk_size];
    let mut sent: u64 = 0;

    loop {
        if cancel.load(Ordering::SeqCst) {
            return Err(aborted(port_name));
        }

        let n = file.read(&mut chunk).await.map_err(|e| {
            EngineError::new(
                ErrorKind::TransferFailed,
                format!("read from {} failed: {}", path.display(), e),
            )
            .with_port(port_name)
        })?;
        if n == 0 {
            return Ok(());
        }

        // Backpressure gate: wait for queue room, re-checking
        // cancellation around every sleep.
        loop {
            let depth = controller.get_write_queue_size(port_name).await?;
            if depth <= BACKPRESSURE_THRESHOLD {
                break;
            }
            if cancel.load(Ordering::SeqCst) {
                return Err(aborted(port_name));
            }
            tokio::time::sleep(BACKPRESSURE_POLL).await;
            if cancel.load(Ordering::SeqCst) {
                return Err(aborted(port_name));
            }
        }

        controller
            .send_data(port_name, chunk[..n].to_vec())
            .await
            .map_err(|err| {
                EngineError::new(
                    ErrorKind::TransferFailed,
                    format!("send failed: {}", err.message),
                )
                .with_port(port_name)
            })?;
        sent += n as u64;

        controller.events().emit(EngineEvent::FileProgress {
            port_name: port_name.clone(),
            transfer_id: transfer_id.to_string(),
            bytes_sent: sent,
            bytes_total: total,
        });

        // Without hardware flow control, pace to the wire time of the
        // chunk so the far end is not flooded.
        if pace {
            let bits = n as u64 * config.bits_per_char() as u64;
            let secs = bits as f64 / config.baud_rate.value().max(1) as f64;
            tokio::time::sleep(Duration::from_secs_f64(secs)).await;
        }
    }
}

fn aborted(port_name: &str) -> EngineError {
    EngineError::new(ErrorKind::TransferAborted, "transfer cancelled").with_port(port_name)
}
