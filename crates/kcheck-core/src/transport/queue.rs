//! Bounded event queue shared by the transports.
//!
//! Reader tasks own the wire side (sockets, child pipes) and push decoded
//! envelopes or a terminal error into the queue; `poll_event` is a bounded
//! receive on the other end. Both transports poll through this one type.

use std::time::Duration;

use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::event::Envelope;

/// Capacity of the per-transport event queue.
const QUEUE_CAPACITY: usize = 1024;

pub(crate) type FeedItem = Result<Envelope, TransportError>;

/// Producer half held by reader tasks.
pub(crate) type Feed = mpsc::Sender<FeedItem>;

/// Consumer half owned by the transport.
#[derive(Debug)]
pub(crate) struct EventQueue {
    rx: mpsc::Receiver<FeedItem>,
    /// Set once the queue has yielded a terminal error or run dry.
    failed: Option<String>,
}

impl EventQueue {
    pub(crate) fn new() -> (Feed, Self) {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        (tx, Self { rx, failed: None })
    }

    /// Receive the next envelope, waiting at most `timeout`.
    ///
    /// Already-queued envelopes are returned even for a zero timeout. Once a
    /// reader has reported an error or every producer is gone, every later
    /// call fails with [`TransportError::Closed`].
    pub(crate) async fn next(&mut self, timeout: Duration) -> Result<Envelope, TransportError> {
        if let Some(reason) = &self.failed {
            return Err(TransportError::Closed(reason.clone()));
        }
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Err(_elapsed) => Err(TransportError::Timeout(timeout)),
            Ok(Some(Ok(envelope))) => Ok(envelope),
            Ok(Some(Err(e))) => {
                self.failed = Some(e.to_string());
                Err(e)
            }
            Ok(None) => {
                let reason = "event source ended".to_string();
                self.failed = Some(reason.clone());
                Err(TransportError::Closed(reason))
            }
        }
    }

    /// Stop accepting events; pending reader sends fail and the readers exit.
    pub(crate) fn close(&mut self) {
        self.rx.close();
        if self.failed.is_none() {
            self.failed = Some("transport shut down".to_string());
        }
    }
}
