//! Engine sub-modules.

pub mod controller;
pub mod logging;
pub mod macro_runner;
pub mod parser;
pub mod transfer;
pub mod transport;
pub mod worker;

// Re-export top-level items for convenience.
pub use controller::ConnectionController;
pub use macro_runner::{MacroRunner, MacroState};
pub use parser::{make_parser, PacketParser};
pub use transfer::{FileTransferHandle, FileTransferService};
pub use transport::{SimulatedTransport, Transport};
