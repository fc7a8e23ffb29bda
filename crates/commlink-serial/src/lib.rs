//! CommLink serial engine.
//!
//! A multi-port serial communication engine: transport abstraction,
//! packet framing, per-port connection workers with a bounded outbound
//! queue, backpressure-aware file transfer, and scripted command
//! macros. All observable behavior flows through the engine event bus.

pub mod engine;

pub use commlink_core::{
    BaudRate, BoundedQueue, ControlLines, DataBits, EngineError, EngineEvent,
    ErrorKind, EventBus, FlowControl, FramingKind, MacroEntry, Packet, Parity,
    PortConfig, RingBuffer, StopBits, Subscription,
};
pub use engine::{
    ConnectionController, FileTransferHandle, FileTransferService, MacroRunner,
    MacroState, SimulatedTransport, Transport,
};
