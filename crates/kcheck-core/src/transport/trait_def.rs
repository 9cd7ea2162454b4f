//! The `Transport` trait -- the capability interface over a kernel
//! connection.
//!
//! Each concrete transport (structured channel, interactive console)
//! implements this trait. The trait is object-safe so sessions can hold a
//! `Box<dyn Transport>` chosen at runtime.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::TransportError;
use crate::event::{Envelope, Request, TurnId};

/// How the end of a turn is detected on a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletionMode {
    /// The kernel emits an explicit terminal signal (`Status{idle}`).
    Explicit,
    /// No terminal signal exists; a turn ends after a quiet window.
    Quiescence,
}

/// Capability interface for submitting requests and polling kernel output.
///
/// A transport serves one session: at most one request is outstanding at a
/// time and a single caller polls it.
#[async_trait]
pub trait Transport: Send {
    /// Human-readable name for this transport (e.g. "channel").
    fn name(&self) -> &str;

    fn completion_mode(&self) -> CompletionMode;

    /// Submit a request and return the id its output will be attributed to.
    async fn submit(&mut self, request: &Request) -> Result<TurnId, TransportError>;

    /// Wait at most `timeout` for the next event.
    ///
    /// Returns [`TransportError::Timeout`] when the window elapses with no
    /// event; any other error means the transport is unusable.
    async fn poll_event(&mut self, timeout: Duration) -> Result<Envelope, TransportError>;

    /// Release the connection or child process.
    ///
    /// Must be idempotent: calling it after a failure or a second time is a
    /// no-op that returns `Ok(())`.
    async fn shutdown(&mut self) -> Result<(), TransportError>;
}

// Compile-time assertion: Transport must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn Transport) {}
};
