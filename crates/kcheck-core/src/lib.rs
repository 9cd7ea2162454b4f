//! Turn-level verification of interactive compute kernels.
//!
//! A [`session::Session`] drives one kernel over a [`transport::Transport`],
//! collects each turn's output with the [`collector`], checks it with the
//! [`validate`] validators, and summarizes everything in a
//! [`report::Report`].

pub mod collector;
pub mod error;
pub mod event;
pub mod presets;
pub mod report;
pub mod script;
pub mod session;
pub mod transport;
pub mod validate;

pub use collector::{Completion, CollectorConfig, TurnResult};
pub use error::{HarnessError, TransportError};
pub use event::{Envelope, Event, Request, TurnId};
pub use report::Report;
pub use session::{Session, SessionConfig};
pub use validate::{Expectations, Verdict};
