//! Scripted command macros.
//!
//! A `MacroRunner` plays a list of [`MacroEntry`] steps against one
//! connection: encode, send, delay, advance, with optional looping.
//! Pause freezes the current wait without losing position; stop
//! cancels from any state.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use commlink_core::events::EngineEvent;
use commlink_core::types::{EngineError, ErrorKind, MacroEntry};
use log::{debug, error, warn};
use tokio::task::JoinHandle;

use crate::engine::controller::ConnectionController;
use crate::engine::transport::hex_to_bytes;

/// Floor for the per-step delay.
pub const MIN_STEP_DELAY: Duration = Duration::from_millis(10);
/// Granularity of pauseable waits.
const TICK: Duration = Duration::from_millis(10);
/// Bounded wait for the sequencer task after `stop()`.
const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  State
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Macro runner lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacroState {
    Idle,
    Running,
    Paused,
    Stopped,
}

impl MacroState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Idle,
            1 => Self::Running,
            2 => Self::Paused,
            _ => Self::Stopped,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Runner
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Step sequencer for one connection.
pub struct MacroRunner {
    controller: Arc<ConnectionController>,
    port_name: String,
    entries: StdMutex<Vec<MacroEntry>>,
    prefix: StdMutex<Vec<u8>>,
    suffix: StdMutex<Vec<u8>>,
    state: Arc<AtomicU8>,
    stop_flag: Arc<AtomicBool>,
    join: StdMutex<Option<JoinHandle<()>>>,
}

impl MacroRunner {
    pub fn new(controller: Arc<ConnectionController>, port_name: impl Into<String>) -> Self {
        Self {
            controller,
            port_name: port_name.into(),
            entries: StdMutex::new(Vec::new()),
            prefix: StdMutex::new(Vec::new()),
            suffix: StdMutex::new(b"\r\n".to_vec()),
            state: Arc::new(AtomicU8::new(MacroState::Idle as u8)),
            stop_flag: Arc::new(AtomicBool::new(false)),
            join: StdMutex::new(None),
        }
    }

    pub fn state(&self) -> MacroState {
        MacroState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    /// Bytes prepended to steps with the prefix flag set.
    pub fn set_prefix(&self, bytes: Vec<u8>) {
        if let Ok(mut prefix) = self.prefix.lock() {
            *prefix = bytes;
        }
    }

    /// Bytes appended to steps with the suffix flag set. Defaults to
    /// CRLF.
    pub fn set_suffix(&self, bytes: Vec<u8>) {
        if let Ok(mut suffix) = self.suffix.lock() {
            *suffix = bytes;
        }
    }

    /// Replace the pending step list. Hex-mode commands are decoded up
    /// front so a malformed step fails here instead of mid-run.
    pub fn load_macro(&self, entries: Vec<MacroEntry>) -> Result<(), EngineError> {
        if matches!(self.state(), MacroState::Running | MacroState::Paused) {
            return Err(EngineError::new(
                ErrorKind::MacroStep,
                "cannot replace steps while the macro is running",
            )
            .with_port(&self.port_name));
        }
        for (idx, entry) in entries.iter().enumerate() {
            if entry.hex_mode {
                hex_to_bytes(&entry.command).map_err(|err| {
                    EngineError::new(
                        ErrorKind::MacroStep,
                        format!("step {}: {}", idx, err.message),
                    )
                    .with_port(&self.port_name)
                })?;
            }
            if let Some(expect) = &entry.expect {
                if expect.is_empty() || entry.expect_timeout_ms == 0 {
                    return Err(EngineError::new(
                        ErrorKind::MacroStep,
                        format!("step {}: invalid expect settings", idx),
                    )
                    .with_port(&self.port_name));
                }
            }
        }
        let mut slot = self
            .entries
            .lock()
            .map_err(|_| poisoned(&self.port_name))?;
        *slot = entries;
        Ok(())
    }

    /// Start the sequencer. `loop_count` of zero repeats forever;
    /// `interval_ms` is the pause between loops.
    pub fn start(&self, loop_count: u32, interval_ms: u64) -> Result<(), EngineError> {
        if matches!(self.state(), MacroState::Running | MacroState::Paused) {
            return Err(EngineError::new(
                ErrorKind::MacroStep,
                "macro already running",
            )
            .with_port(&self.port_name));
        }
        let entries = {
            let slot = self
                .entries
                .lock()
                .map_err(|_| poisoned(&self.port_name))?;
            slot.clone()
        };
        if entries.is_empty() {
            return Err(EngineError::new(ErrorKind::MacroStep, "no steps loaded")
                .with_port(&self.port_name));
        }
        let prefix = self.prefix.lock().map(|p| p.clone()).unwrap_or_default();
        let suffix = self.suffix.lock().map(|s| s.clone()).unwrap_or_default();

        self.stop_flag.store(false, Ordering::SeqCst);
        self.state.store(MacroState::Running as u8, Ordering::SeqCst);

        let task = tokio::spawn(run_macro(
            Arc::clone(&self.controller),
            self.port_name.clone(),
            entries,
            prefix,
            suffix,
            loop_count,
            interval_ms,
            Arc::clone(&self.state),
            Arc::clone(&self.stop_flag),
        ));
        if let Ok(mut slot) = self.join.lock() {
            *slot = Some(task);
        }
        Ok(())
    }

    /// Freeze the run at the current position.
    pub fn pause(&self) {
        let _ = self.state.compare_exchange(
            MacroState::Running as u8,
            MacroState::Paused as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    /// Resume a paused run.
    pub fn resume(&self) {
        let _ = self.state.compare_exchange(
            MacroState::Paused as u8,
            MacroState::Running as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    /// Cancel the run from any state. Always leaves the runner
    /// `Stopped` with a final `MacroFinished` emitted.
    pub async fn stop(&self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        // a paused task must wake up to see the flag
        self.resume();
        let handle = match self.join.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        match handle {
            Some(handle) => {
                if tokio::time::timeout(STOP_JOIN_TIMEOUT, handle).await.is_err() {
                    warn!("macro on {} did not stop in time", self.port_name);
                }
            }
            None => {
                // never started: report the terminal state directly
                self.state.store(MacroState::Stopped as u8, Ordering::SeqCst);
                self.controller.events().emit(EngineEvent::MacroFinished {
                    port_name: self.port_name.clone(),
                    completed: false,
                });
            }
        }
    }
}

fn poisoned(port: &str) -> EngineError {
    EngineError::new(ErrorKind::Shutdown, "macro state lock poisoned").with_port(port)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Sequencer task
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[allow(clippy::too_many_arguments)]
async fn run_macro(
    controller: Arc<ConnectionController>,
    port_name: String,
    entries: Vec<MacroEntry>,
    prefix: Vec<u8>,
    suffix: Vec<u8>,
    loop_count: u32,
    interval_ms: u64,
    state: Arc<AtomicU8>,
    stop_flag: Arc<AtomicBool>,
) {
    let mut completed = false;
    let mut loops_done: u32 = 0;

    'run: loop {
        for (idx, entry) in entries.iter().enumerate() {
            if wait_while_paused(&state, &stop_flag).await {
                break 'run;
            }
            if !entry.enabled {
                continue;
            }

            controller.events().emit(EngineEvent::MacroStepStarted {
                port_name: port_name.clone(),
                step_index: idx,
            });

            let payload = match encode_step(entry, &prefix, &suffix) {
                Ok(payload) => payload,
                Err(err) => {
                    error!("macro step {} on {} failed: {}", idx, port_name, err);
                    emit_step_completed(&controller, &port_name, idx, Some(err));
                    break 'run;
                }
            };
            if let Err(err) = controller.send_data(&port_name, payload).await {
                error!("macro step {} on {} failed: {}", idx, port_name, err);
                emit_step_completed(&controller, &port_name, idx, Some(err));
                break 'run;
            }

            emit_step_completed(&controller, &port_name, idx, None);

            let delay = Duration::from_millis(entry.delay_ms).max(MIN_STEP_DELAY);
            if pauseable_sleep(delay, &state, &stop_flag).await {
                break 'run;
            }
        }

        loops_done += 1;
        if loop_count != 0 && loops_done >= loop_count {
            completed = true;
            break;
        }
        debug!("macro on {} looping ({} done)", port_name, loops_done);
        if interval_ms > 0
            && pauseable_sleep(Duration::from_millis(interval_ms), &state, &stop_flag).await
        {
            break;
        }
    }

    state.store(MacroState::Stopped as u8, Ordering::SeqCst);
    controller.events().emit(EngineEvent::MacroFinished {
        port_name,
        completed,
    });
}

fn emit_step_completed(
    controller: &ConnectionController,
    port_name: &str,
    step_index: usize,
    error: Option<EngineError>,
) {
    controller.events().emit(EngineEvent::MacroStepCompleted {
        port_name: port_name.to_string(),
        step_index,
        success: error.is_none(),
        error,
    });
}

/// Encode a step's command with the runner's prefix/suffix applied per
/// the entry flags.
fn encode_step(
    entry: &MacroEntry,
    prefix: &[u8],
    suffix: &[u8],
) -> Result<Vec<u8>, EngineError> {
    let command = if entry.hex_mode {
        hex_to_bytes(&entry.command)?
    } else {
        entry.command.as_bytes().to_vec()
    };
    let mut payload = Vec::with_capacity(prefix.len() + command.len() + suffix.len());
    if entry.prefix {
        payload.extend_from_slice(prefix);
    }
    payload.extend_from_slice(&command);
    if entry.suffix {
        payload.extend_from_slice(suffix);
    }
    Ok(payload)
}

/// Block while paused. Returns `true` when the run should stop.
async fn wait_while_paused(state: &AtomicU8, stop_flag: &AtomicBool) -> bool {
    loop {
        if stop_flag.load(Ordering::SeqCst) {
            return true;
        }
        if MacroState::from_u8(state.load(Ordering::SeqCst)) != MacroState::Paused {
            return false;
        }
        tokio::time::sleep(TICK).await;
    }
}

/// Sleep in ticks, freezing while paused. Returns `true` when the run
/// should stop.
async fn pauseable_sleep(total: Duration, state: &AtomicU8, stop_flag: &AtomicBool) -> bool {
    let mut remaining = total;
    while remaining > Duration::ZERO {
        if stop_flag.load(Ordering::SeqCst) {
            return true;
        }
        if MacroState::from_u8(state.load(Ordering::SeqCst)) == MacroState::Paused {
            // paused time does not consume the delay
            tokio::time::sleep(TICK).await;
            continue;
        }
        let step = TICK.min(remaining);
        tokio::time::sleep(step).await;
        remaining = remaining.saturating_sub(step);
    }
    stop_flag.load(Ordering::SeqCst)
}
