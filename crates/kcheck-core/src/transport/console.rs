//! Console transport: an interactive child process driven over its standard
//! streams.
//!
//! Requests are written to the child's stdin followed by a submission
//! terminator. Every line the child prints on stdout or stderr becomes an
//! [`Event::RawLine`] with terminal escape sequences removed. The console
//! has no structured end-of-turn signal, so turns complete by quiescence.

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::LinesStream;
use tracing::{debug, info, warn};

use super::queue::{EventQueue, Feed};
use super::trait_def::{CompletionMode, Transport};
use crate::error::TransportError;
use crate::event::{Envelope, Event, LineSource, Request, TurnId};

/// CSI sequences, OSC sequences terminated by BEL or ST, and two-byte escapes.
static ANSI_ESCAPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1b\[[0-?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[@-Z\\-_]")
        .expect("ANSI escape pattern is valid")
});

/// Remove terminal escape sequences and a trailing carriage return.
pub fn strip_ansi(line: &str) -> String {
    let stripped = ANSI_ESCAPE.replace_all(line, "");
    stripped.trim_end_matches('\r').to_string()
}

/// How to launch and talk to the console process.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsoleConfig {
    /// Executable to spawn (looked up on `$PATH`).
    pub program: String,
    pub args: Vec<String>,
    /// Written after the request text to make the console execute it.
    pub terminator: String,
    /// Written to stdin on teardown before closing it, if set.
    pub exit_command: Option<String>,
    /// How long teardown waits at each escalation step.
    pub shutdown_grace: Duration,
}

impl ConsoleConfig {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            terminator: "\n".to_string(),
            exit_command: Some("exit".to_string()),
            shutdown_grace: Duration::from_secs(5),
        }
    }

    /// Split a shell-style command line on whitespace into program and args.
    ///
    /// Quoting is not interpreted; use [`ConsoleConfig::new`] plus `args`
    /// for arguments containing spaces.
    pub fn from_command_line(command: &str) -> Option<Self> {
        let mut parts = command.split_whitespace();
        let program = parts.next()?;
        let mut config = Self::new(program);
        config.args = parts.map(str::to_string).collect();
        Some(config)
    }

    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn terminator(mut self, terminator: impl Into<String>) -> Self {
        self.terminator = terminator.into();
        self
    }

    pub fn exit_command(mut self, command: Option<String>) -> Self {
        self.exit_command = command;
        self
    }

    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// The command line as a single display string.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Transport over a console child process.
pub struct ConsoleTransport {
    config: ConsoleConfig,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    pid: Option<u32>,
    queue: EventQueue,
    reader: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for ConsoleTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsoleTransport")
            .field("command", &self.config.display())
            .field("pid", &self.pid)
            .finish()
    }
}

impl ConsoleTransport {
    /// Spawn the console process and start reading its output.
    ///
    /// The child is killed if the transport is dropped without an explicit
    /// [`Transport::shutdown`].
    pub fn spawn(config: ConsoleConfig) -> Result<Self, TransportError> {
        let mut cmd = Command::new(&config.program);
        cmd.args(&config.args);
        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| TransportError::Spawn {
            program: config.program.clone(),
            source,
        })?;

        let pid = child.id();
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (feed, queue) = EventQueue::new();
        let reader = match (stdout, stderr) {
            (Some(stdout), Some(stderr)) => Some(tokio::spawn(pump_lines(stdout, stderr, feed))),
            _ => {
                warn!(?pid, "console child has no output pipes");
                None
            }
        };

        info!(command = %config.display(), ?pid, "spawned console kernel");

        Ok(Self {
            config,
            child: Some(child),
            stdin,
            pid,
            queue,
            reader,
        })
    }

    /// OS process id of the child, while it is running.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Whether the child process is still alive.
    pub fn is_running(&mut self) -> bool {
        match self.child.as_mut().map(Child::try_wait) {
            Some(Ok(None)) => true,
            Some(Ok(Some(_))) => false,
            Some(Err(e)) => {
                warn!(pid = ?self.pid, error = %e, "error checking console process status");
                false
            }
            None => false,
        }
    }
}

/// Merge stdout and stderr lines into the event feed until both close.
async fn pump_lines(
    stdout: tokio::process::ChildStdout,
    stderr: tokio::process::ChildStderr,
    feed: Feed,
) {
    let out = LinesStream::new(BufReader::new(stdout).lines()).map(|l| (LineSource::Stdout, l));
    let err = LinesStream::new(BufReader::new(stderr).lines()).map(|l| (LineSource::Stderr, l));
    let merged = out.merge(err);
    tokio::pin!(merged);

    while let Some((source, line)) = merged.next().await {
        let item = match line {
            Ok(line) => Ok(Envelope::unattributed(Event::RawLine {
                source,
                text: strip_ansi(&line),
            })),
            Err(e) => Err(TransportError::Io(e)),
        };
        let terminal = item.is_err();
        if feed.send(item).await.is_err() || terminal {
            return;
        }
    }

    let _ = feed
        .send(Err(TransportError::Closed(
            "console process closed its output".to_string(),
        )))
        .await;
}

#[async_trait]
impl Transport for ConsoleTransport {
    fn name(&self) -> &str {
        "console"
    }

    fn completion_mode(&self) -> CompletionMode {
        CompletionMode::Quiescence
    }

    async fn submit(&mut self, request: &Request) -> Result<TurnId, TransportError> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| TransportError::Closed("console stdin is closed".to_string()))?;

        let mut payload = String::with_capacity(request.code().len() + self.config.terminator.len());
        payload.push_str(request.code());
        payload.push_str(&self.config.terminator);

        stdin.write_all(payload.as_bytes()).await?;
        stdin.flush().await?;

        let turn = TurnId::new();
        debug!(turn_id = %turn, bytes = payload.len(), "submitted request to console");
        Ok(turn)
    }

    async fn poll_event(&mut self, timeout: Duration) -> Result<Envelope, TransportError> {
        self.queue.next(timeout).await
    }

    async fn shutdown(&mut self) -> Result<(), TransportError> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        let pid = self.pid.take();
        let grace = self.config.shutdown_grace;

        // Ask politely, then close stdin.
        if let Some(mut stdin) = self.stdin.take() {
            if let Some(exit) = &self.config.exit_command {
                let line = format!("{exit}\n");
                if let Err(e) = stdin.write_all(line.as_bytes()).await {
                    debug!(?pid, error = %e, "could not write exit command");
                }
                let _ = stdin.flush().await;
            }
            drop(stdin);
        }

        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => debug!(?pid, %status, "console process exited"),
            _ => {
                #[cfg(unix)]
                {
                    if let Some(pid) = pid {
                        // SAFETY: pid belongs to a child we spawned and have not reaped.
                        let ret = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
                        if ret != 0 {
                            warn!(pid, "SIGTERM failed, proceeding to SIGKILL");
                        }
                    }
                }
                match tokio::time::timeout(grace, child.wait()).await {
                    Ok(Ok(status)) => debug!(?pid, %status, "console process exited after SIGTERM"),
                    _ => {
                        debug!(?pid, "console process still running, sending SIGKILL");
                        if let Err(e) = child.kill().await {
                            warn!(?pid, error = %e, "failed to kill console process");
                        }
                    }
                }
            }
        }

        self.queue.close();
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        info!(?pid, "console transport shut down");
        Ok(())
    }
}

impl Drop for ConsoleTransport {
    fn drop(&mut self) {
        if let Some(reader) = &self.reader {
            reader.abort();
        }
    }
}
