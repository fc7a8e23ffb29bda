//! Shared foundation for the CommLink serial engine: value types,
//! structured errors, the event hub, and fixed-capacity containers.

pub mod buffers;
pub mod events;
pub mod types;

pub use buffers::{BoundedQueue, RingBuffer};
pub use events::{EngineEvent, EventBus, Subscription};
pub use types::{
    BaudRate, ControlLines, DataBits, EngineError, ErrorKind, FlowControl,
    FramingKind, MacroEntry, Packet, Parity, PortConfig, StopBits,
};
