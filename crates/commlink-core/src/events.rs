//! Engine event hub.
//!
//! Events flow from workers and services into the [`EventBus`], which
//! fans them out to every live subscriber. Emission order from a single
//! source is delivery order for each subscriber.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::types::{EngineError, Packet};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Events
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Everything the engine reports to the outside world.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A connection finished opening and its worker is running.
    PortOpened { port_name: String },
    /// A connection closed; emitted exactly once per connection.
    PortClosed { port_name: String },
    /// Fatal connection error; a `PortClosed` follows.
    PortError { port_name: String, error: EngineError },
    /// One read batch of raw bytes, before any framing.
    DataReceived {
        port_name: String,
        data: Bytes,
        timestamp: DateTime<Utc>,
    },
    /// One outbound chunk written to the transport.
    DataSent {
        port_name: String,
        data: Bytes,
        timestamp: DateTime<Utc>,
    },
    /// A framed packet derived from received data.
    PacketReceived { port_name: String, packet: Packet },
    /// File transfer progress update.
    FileProgress {
        port_name: String,
        transfer_id: String,
        bytes_sent: u64,
        bytes_total: u64,
    },
    /// File transfer finished; `success` is false on error or cancel.
    FileCompleted {
        port_name: String,
        transfer_id: String,
        success: bool,
    },
    /// File transfer failed before or during sending.
    FileError {
        port_name: String,
        transfer_id: String,
        error: EngineError,
    },
    /// A macro step began executing.
    MacroStepStarted { port_name: String, step_index: usize },
    /// A macro step finished. `success` is false when encoding or the
    /// send failed; the error rides along so subscribers see why.
    MacroStepCompleted {
        port_name: String,
        step_index: usize,
        success: bool,
        error: Option<EngineError>,
    },
    /// The macro run ended, by completion or by stop.
    MacroFinished { port_name: String, completed: bool },
}

impl EngineEvent {
    /// Port this event concerns.
    pub fn port_name(&self) -> &str {
        match self {
            Self::PortOpened { port_name }
            | Self::PortClosed { port_name }
            | Self::PortError { port_name, .. }
            | Self::DataReceived { port_name, .. }
            | Self::DataSent { port_name, .. }
            | Self::PacketReceived { port_name, .. }
            | Self::FileProgress { port_name, .. }
            | Self::FileCompleted { port_name, .. }
            | Self::FileError { port_name, .. }
            | Self::MacroStepStarted { port_name, .. }
            | Self::MacroStepCompleted { port_name, .. }
            | Self::MacroFinished { port_name, .. } => port_name,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Event Bus
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A live subscription to engine events.
pub struct Subscription {
    pub id: u64,
    pub receiver: mpsc::UnboundedReceiver<EngineEvent>,
}

/// Typed fan-out hub for [`EngineEvent`]s.
///
/// Subscribers receive every event emitted after they subscribe, in
/// emission order. Dropped receivers are pruned on the next emit.
pub struct EventBus {
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<u64, mpsc::UnboundedSender<EngineEvent>>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    /// Register a new subscriber.
    pub fn subscribe(&self) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.insert(id, tx);
        }
        Subscription { id, receiver: rx }
    }

    /// Remove a subscriber. Unknown ids are ignored.
    pub fn unsubscribe(&self, id: u64) {
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.remove(&id);
        }
    }

    /// Deliver an event to every live subscriber.
    pub fn emit(&self, event: EngineEvent) {
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.retain(|_, tx| tx.send(event.clone()).is_ok());
        }
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map(|s| s.len()).unwrap_or(0)
    }
}
