//! Kernel transports.
//!
//! This module defines the [`Transport`] trait that both kernel connections
//! implement, plus the two concrete transports.
//!
//! # Architecture
//!
//! ```text
//! Session
//!     |
//!     v
//! Box<dyn Transport>
//!     |   submit(request) --> TurnId
//!     |   poll_event(timeout) --> Envelope | Timeout | failure
//!     |   shutdown()
//!     |
//!     +-- ChannelTransport: signed frames over shell + iopub sockets
//!     +-- ConsoleTransport: child stdin/stdout/stderr lines
//!              |
//!              v
//!        reader tasks --> EventQueue (bounded, ordered)
//! ```

pub mod channel;
pub mod console;
mod queue;
pub mod trait_def;
pub mod wire;

pub use channel::{ChannelTransport, ConnectionInfo};
pub use console::{ConsoleConfig, ConsoleTransport};
pub use trait_def::{CompletionMode, Transport};
