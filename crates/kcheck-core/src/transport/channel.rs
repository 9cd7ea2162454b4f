//! Channel transport: structured frames over a request/reply connection and
//! a broadcast connection.
//!
//! The kernel is addressed by a connection file naming its host, the port
//! of the request/reply path (`shell_port`), the port of the broadcast path
//! (`iopub_port`) and the signing key. Both connections carry
//! [`super::wire`] frames, one per line.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::queue::{EventQueue, Feed};
use super::trait_def::{CompletionMode, Transport};
use super::wire::{self, Header, Message, Signer};
use crate::error::TransportError;
use crate::event::{Envelope, Request, TurnId};

/// The only signature scheme the wire format implements.
pub const SIGNATURE_SCHEME: &str = "hmac-sha256";

/// Address and credentials of a running kernel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    #[serde(default = "default_ip")]
    pub ip: String,
    /// Request/reply path.
    pub shell_port: u16,
    /// Broadcast status/output path.
    pub iopub_port: u16,
    /// Signing key; empty disables signing.
    #[serde(default)]
    pub key: String,
    #[serde(default = "default_scheme")]
    pub signature_scheme: String,
}

fn default_ip() -> String {
    "127.0.0.1".to_string()
}

fn default_scheme() -> String {
    SIGNATURE_SCHEME.to_string()
}

impl ConnectionInfo {
    /// Load a JSON connection file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read connection file {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse connection file {}", path.display()))
    }

    /// Build the frame signer for this connection.
    pub fn signer(&self) -> Result<Signer, TransportError> {
        if self.key.is_empty() {
            return Ok(Signer::disabled());
        }
        if self.signature_scheme != SIGNATURE_SCHEME {
            return Err(TransportError::Decode(format!(
                "unsupported signature scheme {:?} (expected {SIGNATURE_SCHEME})",
                self.signature_scheme
            )));
        }
        Ok(Signer::new(self.key.as_bytes().to_vec()))
    }

    fn addr(&self, port: u16) -> String {
        format!("{}:{port}", self.ip)
    }
}

/// Transport over a kernel's request/reply and broadcast connections.
pub struct ChannelTransport {
    /// Client session id stamped on every outgoing header.
    session: String,
    signer: Signer,
    shell: Option<OwnedWriteHalf>,
    queue: EventQueue,
    readers: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for ChannelTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelTransport")
            .field("session", &self.session)
            .field("open", &self.shell.is_some())
            .finish()
    }
}

impl ChannelTransport {
    /// Connect to both paths of the kernel described by `info`.
    ///
    /// The broadcast path is connected first so no output of the first
    /// request can be missed.
    pub async fn connect(info: &ConnectionInfo) -> Result<Self, TransportError> {
        let signer = info.signer()?;

        let iopub_addr = info.addr(info.iopub_port);
        let iopub = TcpStream::connect(&iopub_addr)
            .await
            .map_err(|source| TransportError::Connect {
                addr: iopub_addr.clone(),
                source,
            })?;

        let shell_addr = info.addr(info.shell_port);
        let shell = TcpStream::connect(&shell_addr)
            .await
            .map_err(|source| TransportError::Connect {
                addr: shell_addr.clone(),
                source,
            })?;

        let (feed, queue) = EventQueue::new();
        let (iopub_read, _iopub_write) = iopub.into_split();
        let (shell_read, shell_write) = shell.into_split();

        let readers = vec![
            tokio::spawn(pump(iopub_read, signer.clone(), feed.clone(), "iopub")),
            tokio::spawn(pump(shell_read, signer.clone(), feed, "shell")),
        ];

        let session = Uuid::new_v4().to_string();
        info!(%iopub_addr, %shell_addr, session = %session, signed = signer.is_enabled(), "connected to kernel");

        Ok(Self {
            session,
            signer,
            shell: Some(shell_write),
            queue,
            readers,
        })
    }
}

/// Read frames from one connection and forward them as envelopes.
///
/// Stops at the first decode failure or at end of stream, reporting either
/// as a terminal error on the feed.
async fn pump<R>(reader: R, signer: Signer, feed: Feed, channel: &'static str)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        let item = match lines.next_line().await {
            Ok(Some(line)) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match wire::decode_frame(trimmed, &signer) {
                    Ok(message) => {
                        let envelope = wire::message_to_envelope(&message);
                        debug!(channel, kind = envelope.event.kind(), "received frame");
                        Ok(envelope)
                    }
                    Err(e) => {
                        warn!(channel, error = %e, "undecodable frame");
                        Err(e)
                    }
                }
            }
            Ok(None) => Err(TransportError::Closed(format!(
                "{channel} connection closed by kernel"
            ))),
            Err(e) => Err(TransportError::Io(e)),
        };

        let terminal = item.is_err();
        if feed.send(item).await.is_err() || terminal {
            break;
        }
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    fn name(&self) -> &str {
        "channel"
    }

    fn completion_mode(&self) -> CompletionMode {
        CompletionMode::Explicit
    }

    async fn submit(&mut self, request: &Request) -> Result<TurnId, TransportError> {
        let shell = self
            .shell
            .as_mut()
            .ok_or_else(|| TransportError::Closed("channel transport is shut down".to_string()))?;

        let turn = TurnId::new();
        let mut header = Header::new("execute_request", self.session.clone());
        header.msg_id = turn.to_string();

        let message = Message::new(
            header,
            None,
            json!({
                "code": request.code(),
                "silent": false,
                "store_history": true,
                "user_expressions": {},
                "allow_stdin": false,
                "stop_on_error": true,
            }),
        );
        let mut line = wire::encode_frame(&message, &self.signer)?;
        line.push('\n');

        shell.write_all(line.as_bytes()).await?;
        shell.flush().await?;

        debug!(turn_id = %turn, bytes = line.len(), "submitted execute request");
        Ok(turn)
    }

    async fn poll_event(&mut self, timeout: Duration) -> Result<Envelope, TransportError> {
        self.queue.next(timeout).await
    }

    async fn shutdown(&mut self) -> Result<(), TransportError> {
        let Some(mut shell) = self.shell.take() else {
            return Ok(());
        };
        if let Err(e) = shell.shutdown().await {
            debug!(error = %e, "error closing shell connection");
        }
        self.queue.close();
        for reader in self.readers.drain(..) {
            reader.abort();
        }
        info!(session = %self.session, "channel transport shut down");
        Ok(())
    }
}

impl Drop for ChannelTransport {
    fn drop(&mut self) {
        for reader in &self.readers {
            reader.abort();
        }
    }
}
