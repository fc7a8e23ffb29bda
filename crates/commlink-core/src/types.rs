//! Shared types for the CommLink engine.
//!
//! Covers port configuration, packet and framing metadata, macro
//! entries, and the structured engine error type.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Port Configuration
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Standard baud rates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BaudRate {
    #[serde(rename = "1200")]
    Baud1200,
    #[serde(rename = "2400")]
    Baud2400,
    #[serde(rename = "4800")]
    Baud4800,
    #[serde(rename = "9600")]
    Baud9600,
    #[serde(rename = "19200")]
    Baud19200,
    #[serde(rename = "38400")]
    Baud38400,
    #[serde(rename = "57600")]
    Baud57600,
    #[serde(rename = "115200")]
    Baud115200,
    #[serde(rename = "230400")]
    Baud230400,
    #[serde(rename = "460800")]
    Baud460800,
    #[serde(rename = "921600")]
    Baud921600,
    /// Custom / non-standard baud rate.
    Custom(u32),
}

impl Default for BaudRate {
    fn default() -> Self {
        Self::Baud115200
    }
}

impl BaudRate {
    /// Numeric value of the baud rate.
    pub fn value(&self) -> u32 {
        match self {
            Self::Baud1200 => 1200,
            Self::Baud2400 => 2400,
            Self::Baud4800 => 4800,
            Self::Baud9600 => 9600,
            Self::Baud19200 => 19200,
            Self::Baud38400 => 38400,
            Self::Baud57600 => 57600,
            Self::Baud115200 => 115200,
            Self::Baud230400 => 230400,
            Self::Baud460800 => 460800,
            Self::Baud921600 => 921600,
            Self::Custom(v) => *v,
        }
    }

    /// Map a numeric value onto the enum, falling back to `Custom`.
    pub fn from_value(v: u32) -> Self {
        match v {
            1200 => Self::Baud1200,
            2400 => Self::Baud2400,
            4800 => Self::Baud4800,
            9600 => Self::Baud9600,
            19200 => Self::Baud19200,
            38400 => Self::Baud38400,
            57600 => Self::Baud57600,
            115200 => Self::Baud115200,
            230400 => Self::Baud230400,
            460800 => Self::Baud460800,
            921600 => Self::Baud921600,
            other => Self::Custom(other),
        }
    }

    /// All standard baud rate values.
    pub fn standard_rates() -> Vec<u32> {
        vec![
            1200, 2400, 4800, 9600, 19200, 38400, 57600, 115200, 230400,
            460800, 921600,
        ]
    }
}

/// Number of data bits per character.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataBits {
    #[serde(rename = "5")]
    Five,
    #[serde(rename = "6")]
    Six,
    #[serde(rename = "7")]
    Seven,
    #[serde(rename = "8")]
    Eight,
}

impl Default for DataBits {
    fn default() -> Self {
        Self::Eight
    }
}

impl DataBits {
    pub fn value(&self) -> u8 {
        match self {
            Self::Five => 5,
            Self::Six => 6,
            Self::Seven => 7,
            Self::Eight => 8,
        }
    }

    pub fn from_value(v: u8) -> Option<Self> {
        match v {
            5 => Some(Self::Five),
            6 => Some(Self::Six),
            7 => Some(Self::Seven),
            8 => Some(Self::Eight),
            _ => None,
        }
    }
}

/// Parity checking mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Parity {
    None,
    Odd,
    Even,
    Mark,
    Space,
}

impl Default for Parity {
    fn default() -> Self {
        Self::None
    }
}

impl Parity {
    pub fn label(&self) -> &'static str {
        match self {
            Self::None => "N",
            Self::Odd => "O",
            Self::Even => "E",
            Self::Mark => "M",
            Self::Space => "S",
        }
    }

    /// Bits a parity setting adds to each character on the wire.
    pub fn bit_count(&self) -> u32 {
        match self {
            Self::None => 0,
            _ => 1,
        }
    }
}

/// Number of stop bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopBits {
    #[serde(rename = "1")]
    One,
    #[serde(rename = "1.5")]
    OnePointFive,
    #[serde(rename = "2")]
    Two,
}

impl Default for StopBits {
    fn default() -> Self {
        Self::One
    }
}

impl StopBits {
    pub fn label(&self) -> &'static str {
        match self {
            Self::One => "1",
            Self::OnePointFive => "1.5",
            Self::Two => "2",
        }
    }

    /// Stop bits rounded up to whole wire bits for pacing estimates.
    pub fn bit_count(&self) -> u32 {
        match self {
            Self::One => 1,
            Self::OnePointFive | Self::Two => 2,
        }
    }
}

/// Flow control mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FlowControl {
    None,
    /// Software flow control (XON/XOFF).
    XonXoff,
    /// Hardware flow control (RTS/CTS).
    RtsCts,
    /// Hardware flow control (DTR/DSR).
    DtrDsr,
}

impl Default for FlowControl {
    fn default() -> Self {
        Self::None
    }
}

impl FlowControl {
    /// Whether the mode relies on hardware control lines.
    pub fn is_hardware(&self) -> bool {
        matches!(self, Self::RtsCts | Self::DtrDsr)
    }
}

/// RS-232 control line state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlLines {
    /// Data Terminal Ready (output).
    pub dtr: bool,
    /// Request To Send (output).
    pub rts: bool,
    /// Clear To Send (input).
    pub cts: bool,
    /// Data Set Ready (input).
    pub dsr: bool,
    /// Ring Indicator (input).
    pub ri: bool,
    /// Data Carrier Detect (input).
    pub dcd: bool,
}

/// Complete serial port configuration.
///
/// Constructed once by the caller and owned by the controller for the
/// lifetime of the connection; never mutated while the port is open.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortConfig {
    /// Port name (e.g. `COM3`, `/dev/ttyUSB0`). Unique connection key.
    pub port_name: String,

    /// Baud rate.
    #[serde(default)]
    pub baud_rate: BaudRate,

    /// Data bits per character.
    #[serde(default)]
    pub data_bits: DataBits,

    /// Parity mode.
    #[serde(default)]
    pub parity: Parity,

    /// Stop bits.
    #[serde(default)]
    pub stop_bits: StopBits,

    /// Flow control mode.
    #[serde(default)]
    pub flow_control: FlowControl,

    /// Maximum number of chunks the outbound queue holds before
    /// rejecting enqueues.
    #[serde(default = "default_tx_queue_limit")]
    pub tx_queue_limit: usize,

    /// Whether this connection participates in broadcast sends.
    #[serde(default = "default_true")]
    pub broadcast_enabled: bool,

    /// Optional label / description.
    #[serde(default)]
    pub label: Option<String>,
}

fn default_tx_queue_limit() -> usize {
    64
}
fn default_true() -> bool {
    true
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: BaudRate::default(),
            data_bits: DataBits::default(),
            parity: Parity::default(),
            stop_bits: StopBits::default(),
            flow_control: FlowControl::default(),
            tx_queue_limit: default_tx_queue_limit(),
            broadcast_enabled: true,
            label: None,
        }
    }
}

impl PortConfig {
    /// Shorthand notation (e.g. "9600-8N1").
    pub fn shorthand(&self) -> String {
        format!(
            "{}-{}{}{}",
            self.baud_rate.value(),
            self.data_bits.value(),
            self.parity.label(),
            self.stop_bits.label()
        )
    }

    /// Wire bits per character including start, parity, and stop bits.
    pub fn bits_per_char(&self) -> u32 {
        1 + self.data_bits.value() as u32
            + self.parity.bit_count()
            + self.stop_bits.bit_count()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Packets & Framing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Framing strategy used to split a byte stream into packets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FramingKind {
    /// Every read batch is one packet.
    Raw,
    /// `\r\n`-terminated lines (Hayes AT style).
    AtLine,
    /// Frames terminated by an arbitrary byte sequence.
    Delimiter,
    /// Fixed-size frames of `n` bytes.
    FixedLength,
}

impl FramingKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Raw => "Raw",
            Self::AtLine => "AT",
            Self::Delimiter => "Delimiter",
            Self::FixedLength => "Fixed-Length",
        }
    }
}

/// A framed packet emitted by a parser.
///
/// Immutable once produced; ownership passes to the event consumer.
/// `Bytes` keeps the fan-out to multiple subscribers allocation-free.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Raw frame bytes, terminator included where the framing has one.
    pub data: Bytes,
    /// Capture timestamp, assigned when the packet was framed.
    pub timestamp: DateTime<Utc>,
    /// Framing strategy that produced this packet.
    pub framing: FramingKind,
}

impl Packet {
    pub fn new(data: impl Into<Bytes>, framing: FramingKind) -> Self {
        Self {
            data: data.into(),
            timestamp: Utc::now(),
            framing,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Macros
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One scripted macro step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MacroEntry {
    /// Disabled entries are skipped without delay.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Command text; interpreted as hex digits when `hex_mode` is set.
    pub command: String,

    /// Decode `command` as hex bytes instead of UTF-8 text.
    #[serde(default)]
    pub hex_mode: bool,

    /// Apply the runner's prefix bytes before the command.
    #[serde(default)]
    pub prefix: bool,

    /// Apply the runner's suffix bytes after the command.
    #[serde(default = "default_true")]
    pub suffix: bool,

    /// Delay before advancing to the next step, in milliseconds.
    #[serde(default = "default_step_delay")]
    pub delay_ms: u64,

    /// Pattern to wait for before advancing. Carried but not yet
    /// matched; see `MacroRunner`.
    #[serde(default)]
    pub expect: Option<String>,

    /// Timeout for the expect wait in milliseconds.
    #[serde(default = "default_expect_timeout")]
    pub expect_timeout_ms: u64,
}

fn default_step_delay() -> u64 {
    100
}
fn default_expect_timeout() -> u64 {
    5000
}

impl Default for MacroEntry {
    fn default() -> Self {
        Self {
            enabled: true,
            command: String::new(),
            hex_mode: false,
            prefix: false,
            suffix: true,
            delay_ms: default_step_delay(),
            expect: None,
            expect_timeout_ms: default_expect_timeout(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Errors
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Error kinds raised by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    /// Driver-level failure opening the transport; the connection
    /// never starts.
    OpenFailed,
    /// Fatal write failure; terminates the connection.
    WriteFailed,
    /// Fatal read failure; terminates the connection.
    ReadFailed,
    PortNotFound,
    AlreadyOpen,
    InvalidConfig,
    /// Outbound queue full — the backpressure signal, not a fault.
    QueueFull,
    InvalidHex,
    FileNotFound,
    /// A transfer is already registered on the port.
    TransferBusy,
    /// Transfer cancelled by the user or a forced port closure.
    TransferAborted,
    TransferFailed,
    MacroStep,
    Shutdown,
}

/// Structured engine error.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineError {
    pub kind: ErrorKind,
    pub message: String,
    pub port_name: Option<String>,
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.port_name {
            Some(port) => write!(f, "[{:?}] {} ({})", self.kind, self.message, port),
            None => write!(f, "[{:?}] {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for EngineError {}

impl EngineError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            port_name: None,
        }
    }

    pub fn with_port(mut self, port: impl Into<String>) -> Self {
        self.port_name = Some(port.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_baud_rate_value_roundtrip() {
        for rate in BaudRate::standard_rates() {
            let br = BaudRate::from_value(rate);
            assert_eq!(br.value(), rate);
        }
        assert_eq!(BaudRate::Custom(250000).value(), 250000);
    }

    #[test]
    fn test_data_bits_roundtrip() {
        for v in [5, 6, 7, 8] {
            let db = DataBits::from_value(v).unwrap();
            assert_eq!(db.value(), v);
        }
        assert!(DataBits::from_value(9).is_none());
    }

    #[test]
    fn test_config_shorthand() {
        let cfg = PortConfig {
            port_name: "COM3".to_string(),
            baud_rate: BaudRate::Baud115200,
            ..Default::default()
        };
        assert_eq!(cfg.shorthand(), "115200-8N1");
    }

    #[test]
    fn test_config_shorthand_7e1() {
        let cfg = PortConfig {
            port_name: "COM1".to_string(),
            baud_rate: BaudRate::Baud19200,
            data_bits: DataBits::Seven,
            parity: Parity::Even,
            ..Default::default()
        };
        assert_eq!(cfg.shorthand(), "19200-7E1");
    }

    #[test]
    fn test_bits_per_char() {
        // 8N1: start + 8 data + 1 stop
        assert_eq!(PortConfig::default().bits_per_char(), 10);

        let cfg = PortConfig {
            data_bits: DataBits::Seven,
            parity: Parity::Even,
            stop_bits: StopBits::Two,
            ..Default::default()
        };
        // start + 7 data + parity + 2 stop
        assert_eq!(cfg.bits_per_char(), 11);
    }

    #[test]
    fn test_flow_control_is_hardware() {
        assert!(!FlowControl::None.is_hardware());
        assert!(!FlowControl::XonXoff.is_hardware());
        assert!(FlowControl::RtsCts.is_hardware());
        assert!(FlowControl::DtrDsr.is_hardware());
    }

    #[test]
    fn test_serde_config_roundtrip() {
        let cfg = PortConfig {
            port_name: "COM4".to_string(),
            baud_rate: BaudRate::Baud115200,
            flow_control: FlowControl::RtsCts,
            broadcast_enabled: false,
            ..Default::default()
        };
        let json = serde_json::to_string(&cfg).unwrap();
        let back: PortConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.port_name, "COM4");
        assert_eq!(back.baud_rate, BaudRate::Baud115200);
        assert_eq!(back.flow_control, FlowControl::RtsCts);
        assert!(!back.broadcast_enabled);
    }

    #[test]
    fn test_serde_config_defaults() {
        let cfg: PortConfig = serde_json::from_str(r#"{"portName":"COM9"}"#).unwrap();
        assert_eq!(cfg.port_name, "COM9");
        assert_eq!(cfg.baud_rate, BaudRate::Baud115200);
        assert_eq!(cfg.tx_queue_limit, 64);
        assert!(cfg.broadcast_enabled);
    }

    #[test]
    fn test_macro_entry_defaults() {
        let entry: MacroEntry =
            serde_json::from_str(r#"{"command":"AT"}"#).unwrap();
        assert!(entry.enabled);
        assert!(!entry.hex_mode);
        assert!(entry.suffix);
        assert_eq!(entry.delay_ms, 100);
        assert_eq!(entry.expect_timeout_ms, 5000);
    }

    #[test]
    fn test_packet_new() {
        let pkt = Packet::new(b"OK\r\n".to_vec(), FramingKind::AtLine);
        assert_eq!(&pkt.data[..], b"OK\r\n");
        assert_eq!(pkt.framing, FramingKind::AtLine);
    }

    #[test]
    fn test_engine_error_builder() {
        let err = EngineError::new(ErrorKind::PortNotFound, "COM99 not found")
            .with_port("COM99");
        assert_eq!(err.kind, ErrorKind::PortNotFound);
        assert_eq!(err.port_name.as_deref(), Some("COM99"));
        assert!(err.to_string().contains("COM99 not found"));
    }

    #[test]
    fn test_control_lines_default() {
        let cl = ControlLines::default();
        assert!(!cl.dtr && !cl.rts && !cl.cts && !cl.dsr && !cl.ri && !cl.dcd);
    }
}
