//! Traffic capture logging.
//!
//! Records RX/TX traffic on a connection to a file in plain text, hex
//! dump, or timestamped format. Driven by the controller's capture
//! hooks.

use std::io::Write;

use chrono::{DateTime, Utc};
use commlink_core::types::{EngineError, ErrorKind};
use serde::{Deserialize, Serialize};

use crate::engine::transport::hex_dump;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Direction marker
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Data direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataDirection {
    Tx,
    Rx,
}

impl DataDirection {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Tx => "TX",
            Self::Rx => "RX",
        }
    }

    pub fn arrow(&self) -> &'static str {
        match self {
            Self::Tx => ">>>",
            Self::Rx => "<<<",
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Configuration
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Capture log format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LogFormat {
    PlainText,
    HexDump,
    Timestamped,
}

impl Default for LogFormat {
    fn default() -> Self {
        Self::Timestamped
    }
}

/// Capture logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub file_path: String,
    #[serde(default)]
    pub format: LogFormat,
    #[serde(default = "default_enabled")]
    pub timestamps: bool,
    #[serde(default = "default_enabled")]
    pub direction_markers: bool,
    /// Append to an existing file instead of truncating.
    #[serde(default)]
    pub append: bool,
}

fn default_enabled() -> bool {
    true
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            file_path: String::new(),
            format: LogFormat::default(),
            timestamps: true,
            direction_markers: true,
            append: false,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Formatters
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One captured chunk of traffic.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub direction: DataDirection,
    pub data: Vec<u8>,
}

impl LogEntry {
    pub fn new(direction: DataDirection, data: Vec<u8>) -> Self {
        Self {
            timestamp: Utc::now(),
            direction,
            data,
        }
    }

    fn text(&self) -> String {
        String::from_utf8_lossy(&self.data).to_string()
    }
}

/// Format a log entry as plain text.
pub fn format_plain(entry: &LogEntry, direction_markers: bool) -> String {
    if direction_markers {
        format!("{} {}", entry.direction.arrow(), entry.text())
    } else {
        entry.text()
    }
}

/// Format a log entry as a timestamped line.
pub fn format_timestamped(entry: &LogEntry, direction_markers: bool) -> String {
    let ts = entry.timestamp.format("%Y-%m-%d %H:%M:%S%.3f");
    if direction_markers {
        format!("[{}] {} {}", ts, entry.direction.label(), entry.text())
    } else {
        format!("[{}] {}", ts, entry.text())
    }
}

/// Format a log entry as a hex dump block.
pub fn format_hex_dump(entry: &LogEntry, offset: usize, direction_markers: bool) -> String {
    let mut output = String::new();
    if direction_markers {
        output.push_str(&format!(
            "--- {} {} bytes {} ---\n",
            entry.direction.label(),
            entry.data.len(),
            entry.timestamp.format("%H:%M:%S%.3f")
        ));
    }
    output.push_str(&hex_dump(&entry.data, offset));
    output
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Log Writer
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Capture log writer for one connection.
pub struct LogWriter {
    config: LogConfig,
    file: Option<std::fs::File>,
    byte_offset: usize,
}

impl LogWriter {
    pub fn new(config: LogConfig) -> Result<Self, EngineError> {
        let file = if config.enabled && !config.file_path.is_empty() {
            Some(Self::open_file(&config)?)
        } else {
            None
        };
        Ok(Self {
            config,
            file,
            byte_offset: 0,
        })
    }

    fn open_file(config: &LogConfig) -> Result<std::fs::File, EngineError> {
        std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .append(config.append)
            .truncate(!config.append)
            .open(&config.file_path)
            .map_err(|e| {
                EngineError::new(
                    ErrorKind::InvalidConfig,
                    format!("failed to open log file {}: {}", config.file_path, e),
                )
            })
    }

    /// Write the capture header.
    pub fn write_header(&mut self, port_name: &str, config_shorthand: &str) -> Result<(), EngineError> {
        if let Some(ref mut file) = self.file {
            writeln!(
                file,
                "=== Capture: {} ({}) started {} ===",
                port_name,
                config_shorthand,
                Utc::now().format("%Y-%m-%d %H:%M:%S UTC")
            )
            .map_err(io_error)?;
        }
        Ok(())
    }

    /// Write one entry in the configured format.
    pub fn log(&mut self, entry: LogEntry) -> Result<(), EngineError> {
        if !self.config.enabled {
            return Ok(());
        }
        if let Some(ref mut file) = self.file {
            let formatted = match self.config.format {
                LogFormat::PlainText => format_plain(&entry, self.config.direction_markers),
                LogFormat::Timestamped => {
                    format_timestamped(&entry, self.config.direction_markers)
                }
                LogFormat::HexDump => {
                    let s =
                        format_hex_dump(&entry, self.byte_offset, self.config.direction_markers);
                    self.byte_offset += entry.data.len();
                    s
                }
            };
            writeln!(file, "{}", formatted).map_err(io_error)?;
        }
        Ok(())
    }

    /// Log transmitted data.
    pub fn log_tx(&mut self, data: &[u8]) -> Result<(), EngineError> {
        self.log(LogEntry::new(DataDirection::Tx, data.to_vec()))
    }

    /// Log received data.
    pub fn log_rx(&mut self, data: &[u8]) -> Result<(), EngineError> {
        self.log(LogEntry::new(DataDirection::Rx, data.to_vec()))
    }

    pub fn flush(&mut self) -> Result<(), EngineError> {
        if let Some(ref mut file) = self.file {
            file.flush().map_err(io_error)?;
        }
        Ok(())
    }

    pub fn close(&mut self) {
        if let Some(file) = self.file.take() {
            drop(file);
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled && self.file.is_some()
    }

    pub fn config(&self) -> &LogConfig {
        &self.config
    }
}

fn io_error(e: std::io::Error) -> EngineError {
    EngineError::new(ErrorKind::TransferFailed, format!("log write failed: {}", e))
}
