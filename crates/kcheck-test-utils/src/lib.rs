//! Shared test utilities for kcheck integration tests.
//!
//! Three kinds of fake kernel, from cheapest to most realistic:
//! - [`ScriptedTransport`]: in-memory [`Transport`] replaying timed events.
//!   Works under a paused tokio clock.
//! - [`FakeChannelKernel`]: a TCP server speaking the signed frame format
//!   on a request/reply socket and a broadcast socket.
//! - [`ConsoleScript`]: a `/bin/sh` script in a temp dir that behaves like
//!   an interactive console kernel.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use kcheck_core::error::TransportError;
use kcheck_core::event::{Envelope, Event, KernelState, LineSource, Request, TurnId};
use kcheck_core::transport::wire::{self, Header, Message, Signer};
use kcheck_core::transport::{CompletionMode, ConnectionInfo, ConsoleConfig, Transport};

// ---------------------------------------------------------------------------
// Scripted in-memory transport
// ---------------------------------------------------------------------------

/// Which turn a scripted event claims to belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attribution {
    /// The turn being collected.
    Current,
    /// The turn submitted before this one.
    Previous,
    /// No parent, like console output.
    None,
}

/// One scripted step, delivered `after` the previous step.
#[derive(Debug)]
pub struct Step {
    pub after: Duration,
    pub attribution: Attribution,
    pub outcome: Result<Event, TransportError>,
}

impl Step {
    pub fn event(event: Event) -> Self {
        Self {
            after: Duration::ZERO,
            attribution: Attribution::Current,
            outcome: Ok(event),
        }
    }

    pub fn fail(error: TransportError) -> Self {
        Self {
            after: Duration::ZERO,
            attribution: Attribution::Current,
            outcome: Err(error),
        }
    }

    pub fn after(mut self, delay: Duration) -> Self {
        self.after = delay;
        self
    }

    pub fn attributed(mut self, attribution: Attribution) -> Self {
        self.attribution = attribution;
        self
    }

    pub fn idle() -> Self {
        Self::event(Event::Status {
            state: KernelState::Idle,
        })
    }

    pub fn busy() -> Self {
        Self::event(Event::Status {
            state: KernelState::Busy,
        })
    }

    pub fn stream(text: &str) -> Self {
        Self::event(Event::Stream {
            name: "stdout".into(),
            text: text.into(),
        })
    }

    pub fn line(text: &str) -> Self {
        Self::event(Event::RawLine {
            source: LineSource::Stdout,
            text: text.into(),
        })
        .attributed(Attribution::None)
    }

    pub fn html(body: &str) -> Self {
        Self::event(Event::DisplayPayload {
            data: [("text/html".to_string(), json!(body))].into(),
        })
    }
}

/// Observations shared between a [`ScriptedTransport`] and its test.
#[derive(Debug, Default)]
pub struct ScriptLog {
    pub submitted: Vec<String>,
    pub shutdowns: usize,
}

/// In-memory transport replaying one list of steps per submitted request.
///
/// Steps queued before the first submit (see [`ScriptedTransport::preload`])
/// model unsolicited startup output.
pub struct ScriptedTransport {
    mode: CompletionMode,
    turns: VecDeque<Vec<Step>>,
    pending: VecDeque<(Step, Option<TurnId>)>,
    /// When the head of `pending` becomes deliverable.
    head_due: Option<Instant>,
    previous: Option<TurnId>,
    log: Arc<Mutex<ScriptLog>>,
}

impl ScriptedTransport {
    pub fn new(mode: CompletionMode, turns: Vec<Vec<Step>>) -> Self {
        Self {
            mode,
            turns: turns.into(),
            pending: VecDeque::new(),
            head_due: None,
            previous: None,
            log: Arc::new(Mutex::new(ScriptLog::default())),
        }
    }

    /// Queue steps that are delivered without any submission.
    pub fn preload(mut self, steps: Vec<Step>) -> Self {
        self.enqueue(steps, None);
        self
    }

    pub fn log(&self) -> Arc<Mutex<ScriptLog>> {
        Arc::clone(&self.log)
    }

    fn enqueue(&mut self, steps: Vec<Step>, turn: Option<TurnId>) {
        for step in steps {
            let parent = match step.attribution {
                Attribution::Current => turn,
                Attribution::Previous => Some(self.previous.unwrap_or_default()),
                Attribution::None => None,
            };
            self.pending.push_back((step, parent));
        }
        if self.head_due.is_none() {
            self.head_due = self.pending.front().map(|(s, _)| Instant::now() + s.after);
        }
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    fn name(&self) -> &str {
        "scripted"
    }

    fn completion_mode(&self) -> CompletionMode {
        self.mode
    }

    async fn submit(&mut self, request: &Request) -> Result<TurnId, TransportError> {
        self.log
            .lock()
            .unwrap()
            .submitted
            .push(request.code().to_string());
        let turn = TurnId::new();
        let steps = self.turns.pop_front().unwrap_or_default();
        self.enqueue(steps, Some(turn));
        self.previous = Some(turn);
        Ok(turn)
    }

    async fn poll_event(&mut self, timeout: Duration) -> Result<Envelope, TransportError> {
        let Some(due) = self.head_due else {
            tokio::time::sleep(timeout).await;
            return Err(TransportError::Timeout(timeout));
        };
        let window_end = Instant::now() + timeout;
        if due > window_end {
            tokio::time::sleep_until(window_end).await;
            return Err(TransportError::Timeout(timeout));
        }
        tokio::time::sleep_until(due).await;

        let (step, parent) = self
            .pending
            .pop_front()
            .ok_or(TransportError::Closed("script exhausted".into()))?;
        self.head_due = self.pending.front().map(|(s, _)| Instant::now() + s.after);
        step.outcome.map(|event| Envelope::new(parent, event))
    }

    async fn shutdown(&mut self) -> Result<(), TransportError> {
        self.log.lock().unwrap().shutdowns += 1;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Fake channel kernel
// ---------------------------------------------------------------------------

/// Something the fake kernel sends in response to a request.
#[derive(Debug, Clone)]
pub enum Outgoing {
    /// A frame on the broadcast socket, parented to the request.
    Broadcast { msg_type: String, content: Value },
    /// An `execute_reply` on the request/reply socket.
    Reply { status: String },
    /// A broadcast frame with a wrong signature.
    Forged { msg_type: String, content: Value },
    Delay(Duration),
    /// Drop both connections.
    Hangup,
}

impl Outgoing {
    pub fn broadcast(msg_type: &str, content: Value) -> Self {
        Outgoing::Broadcast {
            msg_type: msg_type.into(),
            content,
        }
    }

    pub fn status(state: &str) -> Self {
        Self::broadcast("status", json!({ "execution_state": state }))
    }

    pub fn stream(text: &str) -> Self {
        Self::broadcast("stream", json!({ "name": "stdout", "text": text }))
    }

    pub fn display(mimetype: &str, body: &str) -> Self {
        Self::broadcast(
            "display_data",
            json!({ "data": { mimetype: body }, "metadata": {} }),
        )
    }

    pub fn reply_ok() -> Self {
        Outgoing::Reply {
            status: "ok".into(),
        }
    }

    /// busy, the given outputs, idle, then an `ok` reply.
    pub fn turn(outputs: Vec<Outgoing>) -> Vec<Outgoing> {
        let mut all = vec![Self::status("busy")];
        all.extend(outputs);
        all.push(Self::status("idle"));
        all.push(Self::reply_ok());
        all
    }
}

/// A kernel listening on two local TCP ports and answering execute requests
/// from a fixed script, one entry per request.
pub struct FakeChannelKernel {
    info: ConnectionInfo,
    received: Arc<Mutex<Vec<String>>>,
    task: JoinHandle<()>,
}

impl FakeChannelKernel {
    /// Bind the sockets and start serving. An empty `key` disables signing.
    pub async fn start(key: &str, script: Vec<Vec<Outgoing>>) -> std::io::Result<Self> {
        let iopub = TcpListener::bind("127.0.0.1:0").await?;
        let shell = TcpListener::bind("127.0.0.1:0").await?;
        let info = ConnectionInfo {
            ip: "127.0.0.1".into(),
            shell_port: shell.local_addr()?.port(),
            iopub_port: iopub.local_addr()?.port(),
            key: key.into(),
            signature_scheme: "hmac-sha256".into(),
        };
        let signer = if key.is_empty() {
            Signer::disabled()
        } else {
            Signer::new(key.as_bytes().to_vec())
        };
        let received = Arc::new(Mutex::new(Vec::new()));
        let task = tokio::spawn(serve(iopub, shell, signer, script, Arc::clone(&received)));
        Ok(Self {
            info,
            received,
            task,
        })
    }

    pub fn connection_info(&self) -> ConnectionInfo {
        self.info.clone()
    }

    /// Write a connection file into `dir` and return its path.
    pub fn write_connection_file(&self, dir: &Path) -> std::io::Result<PathBuf> {
        let path = dir.join("kernel.json");
        let body = serde_json::to_string_pretty(&self.info).map_err(std::io::Error::other)?;
        std::fs::write(&path, body)?;
        Ok(path)
    }

    /// Code of every request received so far.
    pub fn received(&self) -> Vec<String> {
        self.received.lock().unwrap().clone()
    }
}

impl Drop for FakeChannelKernel {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(
    iopub: TcpListener,
    shell: TcpListener,
    signer: Signer,
    script: Vec<Vec<Outgoing>>,
    received: Arc<Mutex<Vec<String>>>,
) {
    let Ok(((mut iopub_conn, _), (shell_conn, _))) =
        futures::future::try_join(iopub.accept(), shell.accept()).await
    else {
        return;
    };
    let (shell_read, mut shell_write) = shell_conn.into_split();
    let mut requests = BufReader::new(shell_read).lines();
    let forger = Signer::new(b"not-the-key".to_vec());
    let mut script = VecDeque::from(script);

    while let Ok(Some(line)) = requests.next_line().await {
        let Ok(request) = wire::decode_frame(&line, &signer) else {
            continue;
        };
        if let Some(code) = request.content.get("code").and_then(Value::as_str) {
            received.lock().unwrap().push(code.to_string());
        }

        for outgoing in script.pop_front().unwrap_or_default() {
            let (frame, to_shell) = match outgoing {
                Outgoing::Broadcast { msg_type, content } => {
                    let message = Message::new(Header::new(msg_type, "fake-kernel"), Some(&request.header), content);
                    (wire::encode_frame(&message, &signer), false)
                }
                Outgoing::Forged { msg_type, content } => {
                    let message = Message::new(Header::new(msg_type, "fake-kernel"), Some(&request.header), content);
                    (wire::encode_frame(&message, &forger), false)
                }
                Outgoing::Reply { status } => {
                    let message = Message::new(
                        Header::new("execute_reply", "fake-kernel"),
                        Some(&request.header),
                        json!({ "status": status }),
                    );
                    (wire::encode_frame(&message, &signer), true)
                }
                Outgoing::Delay(delay) => {
                    tokio::time::sleep(delay).await;
                    continue;
                }
                Outgoing::Hangup => return,
            };
            let Ok(mut frame) = frame else { continue };
            frame.push('\n');
            let written = if to_shell {
                shell_write.write_all(frame.as_bytes()).await
            } else {
                iopub_conn.write_all(frame.as_bytes()).await
            };
            if written.is_err() {
                return;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Fake console kernel
// ---------------------------------------------------------------------------

/// Builder for a shell script that imitates an interactive console kernel.
///
/// The script prints its banner, then for every stdin line: optionally
/// echoes it behind a line number, prints the text of `%put <text>;`
/// statements, prints the completion marker if one is leaked, and exits on
/// `exit`.
#[derive(Debug, Clone, Default)]
pub struct ConsoleScript {
    banner: Vec<String>,
    echo_input: bool,
    leak_marker: Option<String>,
    reinit_phrase: Option<String>,
}

impl ConsoleScript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn banner(mut self, line: &str) -> Self {
        self.banner.push(line.to_string());
        self
    }

    /// Echo each input line as `<n>   <line>`.
    pub fn echo_input(mut self, enabled: bool) -> Self {
        self.echo_input = enabled;
        self
    }

    pub fn leak_marker(mut self, marker: &str) -> Self {
        self.leak_marker = Some(marker.to_string());
        self
    }

    /// Print `phrase` again after every statement, as if re-initializing.
    pub fn reinitialize_with(mut self, phrase: &str) -> Self {
        self.reinit_phrase = Some(phrase.to_string());
        self
    }

    fn body(&self) -> String {
        let mut body = String::from("#!/bin/sh\n");
        for line in &self.banner {
            body.push_str(&format!("echo '{line}'\n"));
        }
        body.push_str("n=0\nwhile IFS= read -r line; do\n");
        body.push_str("  [ \"$line\" = \"exit\" ] && exit 0\n");
        body.push_str("  n=$((n + 1))\n");
        if self.echo_input {
            body.push_str("  echo \"$n   $line\"\n");
        }
        body.push_str(
            "  case \"$line\" in\n    '%put '*) msg=\"${line#%put }\"; echo \"${msg%;}\" ;;\n  esac\n",
        );
        if let Some(marker) = &self.leak_marker {
            body.push_str(&format!("  echo '{marker}_'\"$n\"\n"));
        }
        if let Some(phrase) = &self.reinit_phrase {
            body.push_str(&format!("  echo 'NOTE: {phrase} used:'\n"));
        }
        body.push_str("done\n");
        body
    }

    /// Write the script into `dir` and return a console configuration that
    /// runs it with a short shutdown grace.
    #[cfg(unix)]
    pub fn write(&self, dir: &Path) -> std::io::Result<ConsoleConfig> {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("fake-console.sh");
        std::fs::write(&path, self.body())?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
        Ok(ConsoleConfig::new(path.to_string_lossy().into_owned())
            .shutdown_grace(Duration::from_millis(500)))
    }
}

/// A temp dir holding a [`ConsoleScript`]; the dir lives as long as the value.
#[cfg(unix)]
pub struct TempConsole {
    pub dir: tempfile::TempDir,
    pub config: ConsoleConfig,
}

#[cfg(unix)]
impl TempConsole {
    pub fn new(script: &ConsoleScript) -> std::io::Result<Self> {
        let dir = tempfile::TempDir::new()?;
        let config = script.write(dir.path())?;
        Ok(Self { dir, config })
    }
}
