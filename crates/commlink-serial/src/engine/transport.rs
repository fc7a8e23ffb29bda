//! Serial port transport abstraction.
//!
//! The engine never touches OS-level serial I/O directly; a platform
//! back-end is injected through the [`Transport`] trait. The bundled
//! [`SimulatedTransport`] is a fully in-memory implementation used by
//! the test suite and for offline operation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use commlink_core::buffers::RingBuffer;
use commlink_core::types::{ControlLines, EngineError, ErrorKind, PortConfig};
use tokio::sync::Mutex;

/// Capacity of the simulated RX/TX buffers. Like a hardware FIFO, a
/// runaway peer overruns the oldest bytes instead of growing memory.
const SIM_BUFFER_CAPACITY: usize = 64 * 1024;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Transport trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Platform-agnostic serial port transport.
///
/// Implementations must be `Send + Sync` so they can be held behind an
/// `Arc` and used from multiple async tasks.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Open the port with the given configuration.
    async fn open(&self, config: &PortConfig) -> Result<(), EngineError>;

    /// Close the port. Closing an already-closed port is a no-op.
    async fn close(&self) -> Result<(), EngineError>;

    /// Read up to `max` pending bytes. An empty result means nothing
    /// was waiting; this call never blocks on the wire.
    async fn read(&self, max: usize) -> Result<Vec<u8>, EngineError>;

    /// Write all bytes in `buf`. Returns the number written, which is
    /// `buf.len()` on success; partial writes are an error.
    async fn write(&self, buf: &[u8]) -> Result<usize, EngineError>;

    /// Number of bytes waiting in the receive buffer.
    async fn in_waiting(&self) -> Result<usize, EngineError>;

    /// Set DTR (Data Terminal Ready). Default no-op for hardware
    /// without control lines.
    async fn set_dtr(&self, _state: bool) -> Result<(), EngineError> {
        Ok(())
    }

    /// Set RTS (Request To Send). Default no-op.
    async fn set_rts(&self, _state: bool) -> Result<(), EngineError> {
        Ok(())
    }

    /// Read current control line states. Default returns all-low.
    async fn read_control_lines(&self) -> Result<ControlLines, EngineError> {
        Ok(ControlLines::default())
    }

    /// Check whether the port is open.
    fn is_open(&self) -> bool;

    /// Retrieve the port name.
    fn port_name(&self) -> &str;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Simulated transport (for testing & offline use)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A fully in-memory transport useful for unit tests and offline demos.
pub struct SimulatedTransport {
    name: String,
    open: AtomicBool,
    config: Mutex<PortConfig>,
    rx_buf: Mutex<RingBuffer>,
    tx_buf: Mutex<RingBuffer>,
    control_lines: Mutex<ControlLines>,
    loopback: AtomicBool,
    fail_next_open: AtomicBool,
    fail_writes: AtomicBool,
}

impl SimulatedTransport {
    /// Create a new simulated transport for the given port name.
    pub fn new(port_name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: port_name.into(),
            open: AtomicBool::new(false),
            config: Mutex::new(PortConfig::default()),
            rx_buf: Mutex::new(RingBuffer::new(SIM_BUFFER_CAPACITY)),
            tx_buf: Mutex::new(RingBuffer::new(SIM_BUFFER_CAPACITY)),
            control_lines: Mutex::new(ControlLines::default()),
            loopback: AtomicBool::new(false),
            fail_next_open: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
        })
    }

    /// Enable loopback mode (TX data is immediately available in RX).
    pub fn set_loopback(&self, enabled: bool) {
        self.loopback.store(enabled, Ordering::SeqCst);
    }

    /// Make the next `open` call fail.
    pub fn fail_next_open(&self) {
        self.fail_next_open.store(true, Ordering::SeqCst);
    }

    /// Make all subsequent `write` calls fail.
    pub fn fail_writes(&self, enabled: bool) {
        self.fail_writes.store(enabled, Ordering::SeqCst);
    }

    /// Inject bytes into the receive buffer (simulate incoming data).
    pub async fn inject_rx(&self, data: &[u8]) {
        let mut buf = self.rx_buf.lock().await;
        buf.write(data);
    }

    /// Drain all bytes from the transmit buffer (for test assertions).
    pub async fn drain_tx(&self) -> Vec<u8> {
        let mut buf = self.tx_buf.lock().await;
        let len = buf.len();
        buf.read(len)
    }

    /// Peek at the transmit buffer contents without draining.
    pub async fn peek_tx(&self) -> Vec<u8> {
        let buf = self.tx_buf.lock().await;
        buf.peek()
    }
}

#[async_trait::async_trait]
impl Transport for SimulatedTransport {
    async fn open(&self, config: &PortConfig) -> Result<(), EngineError> {
        if self.fail_next_open.swap(false, Ordering::SeqCst) {
            return Err(
                EngineError::new(ErrorKind::OpenFailed, "simulated open failure")
                    .with_port(&self.name),
            );
        }
        if self.open.load(Ordering::SeqCst) {
            return Err(
                EngineError::new(ErrorKind::AlreadyOpen, "port already open")
                    .with_port(&self.name),
            );
        }
        let mut cfg = self.config.lock().await;
        *cfg = config.clone();
        self.open.store(true, Ordering::SeqCst);

        // Simulate a connected peer
        let mut cl = self.control_lines.lock().await;
        cl.dsr = true;
        cl.cts = true;
        Ok(())
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.open.store(false, Ordering::SeqCst);
        let mut cl = self.control_lines.lock().await;
        *cl = ControlLines::default();
        Ok(())
    }

    async fn read(&self, max: usize) -> Result<Vec<u8>, EngineError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(EngineError::new(ErrorKind::ReadFailed, "port not open")
                .with_port(&self.name));
        }
        let mut rx = self.rx_buf.lock().await;
        let count = max.min(rx.len());
        Ok(rx.read(count))
    }

    async fn write(&self, buf: &[u8]) -> Result<usize, EngineError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(EngineError::new(ErrorKind::WriteFailed, "port not open")
                .with_port(&self.name));
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(
                EngineError::new(ErrorKind::WriteFailed, "simulated write failure")
                    .with_port(&self.name),
            );
        }
        let mut tx = self.tx_buf.lock().await;
        tx.write(buf);
        drop(tx);

        if self.loopback.load(Ordering::SeqCst) {
            self.inject_rx(buf).await;
        }
        Ok(buf.len())
    }

    async fn in_waiting(&self) -> Result<usize, EngineError> {
        let rx = self.rx_buf.lock().await;
        Ok(rx.len())
    }

    async fn set_dtr(&self, state: bool) -> Result<(), EngineError> {
        let mut cl = self.control_lines.lock().await;
        cl.dtr = state;
        Ok(())
    }

    async fn set_rts(&self, state: bool) -> Result<(), EngineError> {
        let mut cl = self.control_lines.lock().await;
        cl.rts = state;
        Ok(())
    }

    async fn read_control_lines(&self) -> Result<ControlLines, EngineError> {
        let cl = self.control_lines.lock().await;
        Ok(*cl)
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn port_name(&self) -> &str {
        &self.name
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Hex helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Format bytes as space-separated uppercase hex ("48 65 6C").
pub fn bytes_to_hex(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Parse a hex string into bytes. Whitespace and "0x" prefixes are
/// tolerated; anything else malformed is an `InvalidHex` error.
pub fn hex_to_bytes(input: &str) -> Result<Vec<u8>, EngineError> {
    let cleaned: String = input
        .split_whitespace()
        .map(|tok| tok.strip_prefix("0x").unwrap_or(tok))
        .collect();
    if cleaned.len() % 2 != 0 {
        return Err(EngineError::new(
            ErrorKind::InvalidHex,
            format!("odd-length hex string: {:?}", input),
        ));
    }
    hex::decode(&cleaned).map_err(|e| {
        EngineError::new(ErrorKind::InvalidHex, format!("invalid hex {:?}: {}", input, e))
    })
}

/// Format bytes as a hex dump string (offset + hex + ASCII).
pub fn hex_dump(data: &[u8], offset: usize) -> String {
    let mut output = String::new();
    for (i, chunk) in data.chunks(16).enumerate() {
        let addr = offset + i * 16;
        output.push_str(&format!("{:08X}  ", addr));

        for (j, byte) in chunk.iter().enumerate() {
            output.push_str(&format!("{:02X} ", byte));
            if j == 7 {
                output.push(' ');
            }
        }

        // Padding for short lines
        let pad = 16 - chunk.len();
        for j in 0..pad {
            output.push_str("   ");
            if chunk.len() + j == 7 {
                output.push(' ');
            }
        }

        output.push_str(" |");
        for byte in chunk {
            if byte.is_ascii_graphic() || *byte == b' ' {
                output.push(*byte as char);
            } else {
                output.push('.');
            }
        }
        output.push_str("|\n");
    }
    output
}
