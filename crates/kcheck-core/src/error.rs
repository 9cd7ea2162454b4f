//! Error taxonomy for transports and sessions.
//!
//! Collection outcomes that still yield a partial turn live in
//! [`crate::collector::CollectError`]. A [`HarnessError`] carries at most the
//! judged report of the turn that was cut short.

use std::time::Duration;

use crate::event::TurnId;
use crate::report::TurnReport;

/// Failures raised by a [`crate::transport::Transport`].
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// No event arrived within the poll window. Not fatal on its own.
    #[error("no event within {0:?}")]
    Timeout(Duration),

    /// The connection or child process is gone.
    #[error("transport closed: {0}")]
    Closed(String),

    /// A frame arrived but could not be decoded or authenticated.
    #[error("failed to decode frame: {0}")]
    Decode(String),

    #[error("failed to spawn {program:?}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Whether this is a poll-window timeout rather than a real failure.
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout(_))
    }
}

/// Errors that abort a harness session.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    /// The kernel connection or process died. The session has been torn
    /// down and no further turns can run. `partial` is the evaluated output
    /// the interrupted turn produced before the failure.
    #[error("transport failure{}: {source}", turn_suffix(.turn))]
    Transport {
        turn: Option<TurnId>,
        partial: Option<Box<TurnReport>>,
        #[source]
        source: TransportError,
    },

    #[error("session has been torn down")]
    SessionClosed,
}

impl HarnessError {
    /// A transport failure outside any turn.
    pub fn transport(source: TransportError) -> Self {
        HarnessError::Transport {
            turn: None,
            partial: None,
            source,
        }
    }

    /// Take the report of the interrupted turn, if there was one.
    pub fn take_partial(&mut self) -> Option<TurnReport> {
        match self {
            HarnessError::Transport { partial, .. } => partial.take().map(|report| *report),
            HarnessError::SessionClosed => None,
        }
    }
}

fn turn_suffix(turn: &Option<TurnId>) -> String {
    match turn {
        Some(id) => format!(" in turn {id}"),
        None => String::new(),
    }
}
