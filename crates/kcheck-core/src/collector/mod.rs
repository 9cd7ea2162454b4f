//! Turn collector: drains a transport until the turn's terminal signal.
//!
//! Two clocks govern a collection:
//!
//! - the **poll window** bounds each individual wait. An empty window is
//!   not an error; a slow kernel that is still working just costs more
//!   windows.
//! - the **overall deadline** bounds the whole turn. Reaching it without a
//!   terminal signal is a [`CollectError::Timeout`], never raised earlier.
//!
//! With [`CompletionMode::Explicit`] the terminal signal is the first
//! `Status{idle}` whose parent is the turn, and only frames naming the turn
//! as parent are its output; unparented or foreign frames are strays. With
//! [`CompletionMode::Quiescence`] the terminal signal is a settle window with
//! no new event, and unattributed output belongs to the turn.

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::event::{Envelope, Event, TurnId};
use crate::transport::{CompletionMode, Transport};

/// Shortest poll window the collector will use.
const MIN_POLL: Duration = Duration::from_millis(1);

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Timing policy for one collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectorConfig {
    /// Hard bound on the whole turn.
    pub overall_timeout: Duration,
    /// Bound on a single poll in explicit mode.
    pub poll_interval: Duration,
    /// Quiet window that ends a turn in quiescence mode.
    pub settle: Duration,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            overall_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(500),
            settle: Duration::from_secs(2),
        }
    }
}

/// How a turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Completion {
    /// The kernel reported `idle` for this turn.
    Idle,
    /// No output arrived for a full settle window.
    Quiescent,
    /// Collection stopped without a terminal signal.
    Incomplete,
}

impl fmt::Display for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Completion::Idle => "idle",
            Completion::Quiescent => "quiescent",
            Completion::Incomplete => "incomplete",
        };
        f.write_str(s)
    }
}

/// A protocol-level anomaly observed while collecting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolViolation {
    /// A terminal signal attributed to a different turn, i.e. a second
    /// `idle` for a turn that has already ended.
    StrayTerminal { parent: TurnId },
    /// The terminal signal of a turn that was abandoned at its deadline.
    /// Not a duplicate: the turn never saw its first one.
    LateTerminal { parent: TurnId },
}

impl ProtocolViolation {
    pub fn parent(&self) -> TurnId {
        match self {
            ProtocolViolation::StrayTerminal { parent }
            | ProtocolViolation::LateTerminal { parent } => *parent,
        }
    }
}

impl fmt::Display for ProtocolViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolViolation::StrayTerminal { parent } => write!(
                f,
                "extra terminal signal for already-finished turn {parent}"
            ),
            ProtocolViolation::LateTerminal { parent } => write!(
                f,
                "terminal signal for turn {parent} arrived after it timed out"
            ),
        }
    }
}

/// Everything collected for one turn, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnResult {
    pub turn: TurnId,
    /// Events attributed to this turn. In explicit mode the last one is the
    /// terminal idle when `completion` is [`Completion::Idle`].
    pub events: Vec<Event>,
    pub completion: Completion,
    /// Events not attributed to this turn, kept for diagnostics only.
    pub stray: Vec<Envelope>,
    pub violations: Vec<ProtocolViolation>,
    pub elapsed: Duration,
}

impl TurnResult {
    pub fn new(turn: TurnId) -> Self {
        Self {
            turn,
            events: Vec::new(),
            completion: Completion::Incomplete,
            stray: Vec::new(),
            violations: Vec::new(),
            elapsed: Duration::ZERO,
        }
    }

    /// Number of terminal `idle` statuses among this turn's events.
    pub fn terminal_count(&self) -> usize {
        self.events.iter().filter(|e| e.is_idle()).count()
    }
}

/// A collection that ended without a terminal signal.
///
/// Both variants carry the partial result gathered before the failure.
#[derive(Debug, thiserror::Error)]
pub enum CollectError {
    #[error("no terminal signal within {elapsed:?} ({} events collected)", partial.events.len())]
    Timeout {
        partial: TurnResult,
        elapsed: Duration,
    },

    #[error("transport failed after {} events: {source}", partial.events.len())]
    Transport {
        partial: TurnResult,
        #[source]
        source: TransportError,
    },
}

impl CollectError {
    pub fn partial(&self) -> &TurnResult {
        match self {
            CollectError::Timeout { partial, .. } | CollectError::Transport { partial, .. } => {
                partial
            }
        }
    }

    pub fn into_partial(self) -> TurnResult {
        match self {
            CollectError::Timeout { partial, .. } | CollectError::Transport { partial, .. } => {
                partial
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Collection
// ---------------------------------------------------------------------------

/// Collect the output of `turn` using the transport's own completion mode.
pub async fn collect(
    transport: &mut dyn Transport,
    turn: TurnId,
    config: &CollectorConfig,
) -> Result<TurnResult, CollectError> {
    let mode = transport.completion_mode();
    collect_with_mode(transport, turn, mode, config).await
}

/// Collect the output of `turn`, detecting completion with `mode`.
pub async fn collect_with_mode(
    transport: &mut dyn Transport,
    turn: TurnId,
    mode: CompletionMode,
    config: &CollectorConfig,
) -> Result<TurnResult, CollectError> {
    let start = Instant::now();
    let deadline = start + config.overall_timeout;
    let mut last_event = start;
    let mut result = TurnResult::new(turn);

    loop {
        let now = Instant::now();
        let quiet_at = last_event + config.settle;

        if mode == CompletionMode::Quiescence && now >= quiet_at {
            result.completion = Completion::Quiescent;
            result.elapsed = start.elapsed();
            debug!(turn_id = %turn, events = result.events.len(), elapsed_ms = result.elapsed.as_millis() as u64, "turn quiescent");
            return Ok(result);
        }
        if now >= deadline {
            result.elapsed = start.elapsed();
            warn!(turn_id = %turn, events = result.events.len(), "no terminal signal before overall timeout");
            return Err(CollectError::Timeout {
                elapsed: result.elapsed,
                partial: result,
            });
        }

        let until_deadline = deadline - now;
        let window = match mode {
            CompletionMode::Explicit => config.poll_interval.max(MIN_POLL).min(until_deadline),
            CompletionMode::Quiescence => (quiet_at - now).min(until_deadline),
        };

        match transport.poll_event(window).await {
            Ok(envelope) => {
                last_event = Instant::now();

                let ours = match mode {
                    CompletionMode::Explicit => envelope.is_from(turn),
                    CompletionMode::Quiescence => envelope.belongs_to(turn),
                };
                if !ours {
                    match envelope.parent() {
                        Some(parent) if envelope.event.is_idle() => {
                            warn!(turn_id = %turn, %parent, "terminal signal for another turn");
                            result
                                .violations
                                .push(ProtocolViolation::StrayTerminal { parent });
                        }
                        _ => {
                            debug!(turn_id = %turn, origin = ?envelope.origin, kind = envelope.event.kind(), "stray event");
                        }
                    }
                    result.stray.push(envelope);
                    continue;
                }

                let terminal = mode == CompletionMode::Explicit && envelope.event.is_idle();
                result.events.push(envelope.event);
                if terminal {
                    result.completion = Completion::Idle;
                    result.elapsed = start.elapsed();
                    debug!(turn_id = %turn, events = result.events.len(), elapsed_ms = result.elapsed.as_millis() as u64, "turn idle");
                    return Ok(result);
                }
            }
            Err(e) if e.is_timeout() => {
                // An empty window is progress-neutral; the loop head decides.
            }
            Err(source) => {
                result.elapsed = start.elapsed();
                info!(turn_id = %turn, events = result.events.len(), error = %source, "transport failed mid-turn");
                return Err(CollectError::Transport {
                    partial: result,
                    source,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{KernelState, LineSource, Request};
    use async_trait::async_trait;
    use std::collections::VecDeque;

    /// Yields queued items immediately, then times out (after sleeping the
    /// full window, so paused-clock tests observe real deadlines).
    struct QueueSource {
        mode: CompletionMode,
        items: VecDeque<Result<Envelope, TransportError>>,
        polls: usize,
    }

    impl QueueSource {
        fn new(mode: CompletionMode, items: Vec<Result<Envelope, TransportError>>) -> Self {
            Self {
                mode,
                items: items.into(),
                polls: 0,
            }
        }
    }

    #[async_trait]
    impl Transport for QueueSource {
        fn name(&self) -> &str {
            "queue"
        }

        fn completion_mode(&self) -> CompletionMode {
            self.mode
        }

        async fn submit(&mut self, _request: &Request) -> Result<TurnId, TransportError> {
            Ok(TurnId::new())
        }

        async fn poll_event(&mut self, timeout: Duration) -> Result<Envelope, TransportError> {
            self.polls += 1;
            match self.items.pop_front() {
                Some(item) => item,
                None => {
                    tokio::time::sleep(timeout).await;
                    Err(TransportError::Timeout(timeout))
                }
            }
        }

        async fn shutdown(&mut self) -> Result<(), TransportError> {
            Ok(())
        }
    }

    fn status(turn: TurnId, state: KernelState) -> Result<Envelope, TransportError> {
        Ok(Envelope::new(Some(turn), Event::Status { state }))
    }

    fn stream(turn: TurnId, text: &str) -> Result<Envelope, TransportError> {
        Ok(Envelope::new(
            Some(turn),
            Event::Stream {
                name: "stdout".into(),
                text: text.into(),
            },
        ))
    }

    fn line(text: &str) -> Result<Envelope, TransportError> {
        Ok(Envelope::unattributed(Event::RawLine {
            source: LineSource::Stdout,
            text: text.into(),
        }))
    }

    #[tokio::test(start_paused = true)]
    async fn stops_at_idle_and_ignores_trailing_events() {
        let turn = TurnId::new();
        let mut source = QueueSource::new(
            CompletionMode::Explicit,
            vec![
                status(turn, KernelState::Busy),
                stream(turn, "hello"),
                status(turn, KernelState::Idle),
                stream(turn, "after idle"),
            ],
        );

        let result = collect(&mut source, turn, &CollectorConfig::default())
            .await
            .unwrap();
        assert_eq!(result.completion, Completion::Idle);
        assert_eq!(result.events.len(), 3);
        assert!(result.events.last().unwrap().is_idle());
        assert_eq!(result.terminal_count(), 1);
        // The trailing event is still queued, not consumed.
        assert_eq!(source.items.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_kernel_is_not_a_timeout() {
        let turn = TurnId::new();
        let config = CollectorConfig {
            overall_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(100),
            settle: Duration::from_secs(1),
        };
        // Several empty windows, then progress, then idle.
        let mut source = QueueSource::new(
            CompletionMode::Explicit,
            vec![
                Err(TransportError::Timeout(config.poll_interval)),
                Err(TransportError::Timeout(config.poll_interval)),
                stream(turn, "working"),
                Err(TransportError::Timeout(config.poll_interval)),
                status(turn, KernelState::Idle),
            ],
        );

        let result = collect(&mut source, turn, &config).await.unwrap();
        assert_eq!(result.completion, Completion::Idle);
        assert_eq!(result.events.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_terminals_times_out_at_overall_deadline() {
        let turn = TurnId::new();
        let config = CollectorConfig {
            overall_timeout: Duration::from_secs(3),
            poll_interval: Duration::from_millis(700),
            settle: Duration::from_secs(1),
        };
        let mut source = QueueSource::new(CompletionMode::Explicit, vec![stream(turn, "partial")]);

        let started = Instant::now();
        let err = collect(&mut source, turn, &config).await.unwrap_err();
        assert_eq!(started.elapsed(), Duration::from_secs(3));
        match err {
            CollectError::Timeout { partial, elapsed } => {
                assert_eq!(elapsed, Duration::from_secs(3));
                assert_eq!(partial.completion, Completion::Incomplete);
                assert_eq!(partial.events.len(), 1);
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transport_failure_returns_partial_immediately() {
        let turn = TurnId::new();
        let mut source = QueueSource::new(
            CompletionMode::Explicit,
            vec![
                stream(turn, "first"),
                Err(TransportError::Decode("bad frame".into())),
                status(turn, KernelState::Idle),
            ],
        );

        let started = Instant::now();
        let err = collect(&mut source, turn, &CollectorConfig::default())
            .await
            .unwrap_err();
        assert_eq!(started.elapsed(), Duration::ZERO);
        match err {
            CollectError::Transport { partial, source } => {
                assert_eq!(partial.events.len(), 1);
                assert_eq!(partial.completion, Completion::Incomplete);
                assert!(matches!(source, TransportError::Decode(_)));
            }
            other => panic!("expected transport error, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stray_idle_is_a_violation_not_a_terminal() {
        let turn = TurnId::new();
        let previous = TurnId::new();
        let mut source = QueueSource::new(
            CompletionMode::Explicit,
            vec![
                status(previous, KernelState::Idle),
                stream(previous, "late output"),
                status(turn, KernelState::Busy),
                status(turn, KernelState::Idle),
            ],
        );

        let result = collect(&mut source, turn, &CollectorConfig::default())
            .await
            .unwrap();
        assert_eq!(result.events.len(), 2);
        assert_eq!(result.stray.len(), 2);
        assert_eq!(
            result.violations,
            vec![ProtocolViolation::StrayTerminal { parent: previous }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_mode_only_accepts_frames_parented_to_the_turn() {
        let turn = TurnId::new();
        let idle = || Event::Status { state: KernelState::Idle };
        let mut source = QueueSource::new(
            CompletionMode::Explicit,
            vec![
                Ok(Envelope::foreign("3f2a9c_1234_7", idle())),
                Ok(Envelope::unattributed(idle())),
                line("kernel banner"),
                stream(turn, "ours"),
                status(turn, KernelState::Idle),
            ],
        );

        let result = collect(&mut source, turn, &CollectorConfig::default())
            .await
            .unwrap();
        assert_eq!(result.completion, Completion::Idle);
        assert_eq!(result.events.len(), 2, "foreign and unparented idles must not end the turn");
        assert_eq!(result.events[0].visible_text(), Some("ours"));
        assert_eq!(result.stray.len(), 3);
        assert!(result.violations.is_empty(), "only our own turns can be duplicated");
    }

    #[tokio::test(start_paused = true)]
    async fn quiescence_ends_after_settle_window() {
        let turn = TurnId::new();
        let config = CollectorConfig {
            overall_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(100),
            settle: Duration::from_secs(2),
        };
        let mut source = QueueSource::new(
            CompletionMode::Quiescence,
            vec![line("1   %put hi;"), line("hi")],
        );

        let started = Instant::now();
        let result = collect(&mut source, turn, &config).await.unwrap();
        assert_eq!(result.completion, Completion::Quiescent);
        assert_eq!(result.events.len(), 2);
        assert_eq!(started.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn quiescence_ignores_idle_status() {
        let turn = TurnId::new();
        let mut source = QueueSource::new(
            CompletionMode::Quiescence,
            vec![status(turn, KernelState::Idle), line("still going")],
        );
        let result = collect(&mut source, turn, &CollectorConfig::default())
            .await
            .unwrap();
        assert_eq!(result.events.len(), 2);
        assert_eq!(result.completion, Completion::Quiescent);
    }

    #[test]
    fn collect_error_exposes_partial() {
        let turn = TurnId::new();
        let err = CollectError::Timeout {
            partial: TurnResult::new(turn),
            elapsed: Duration::from_secs(1),
        };
        assert_eq!(err.partial().turn, turn);
        assert!(err.to_string().contains("0 events"));
        assert_eq!(err.into_partial().completion, Completion::Incomplete);
    }

    #[test]
    fn violation_display_names_turn() {
        let parent = TurnId::new();
        let text = ProtocolViolation::StrayTerminal { parent }.to_string();
        assert!(text.contains(&parent.to_string()));

        let late = ProtocolViolation::LateTerminal { parent };
        assert_eq!(late.parent(), parent);
        assert!(late.to_string().contains("after it timed out"));
        assert!(!late.to_string().contains("already-finished"));
    }
}
