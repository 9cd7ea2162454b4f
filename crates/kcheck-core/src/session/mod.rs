//! Harness session: one kernel connection spanning many turns.
//!
//! A [`Session`] owns the transport and the session-scoped state (the
//! initialization counter and the turns it has issued). Each
//! [`Session::run`] submits one request, collects its output, and evaluates
//! it. Turn-level failures (timeouts, protocol violations, failed
//! validators) are verdicts; a transport failure tears the session down and
//! is returned as an error carrying the interrupted turn's report.

pub mod runner;

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::collector::{self, CollectError, CollectorConfig, ProtocolViolation, TurnResult};
use crate::error::HarnessError;
use crate::event::{Request, TurnId};
use crate::report::TurnReport;
use crate::transport::{CompletionMode, Transport};
use crate::validate::{self, Expectations, InitTracker};

/// Label of the pseudo-turn that drains console startup output.
pub const STARTUP_LABEL: &str = "startup";

/// Timing policy for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    pub collector: CollectorConfig,
    /// Overall bound on the startup settle.
    pub startup_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            collector: CollectorConfig::default(),
            startup_timeout: Duration::from_secs(60),
        }
    }
}

pub struct Session {
    transport: Box<dyn Transport>,
    config: SessionConfig,
    init: InitTracker,
    /// Every turn submitted this session, in order.
    issued: Vec<TurnId>,
    /// Turns abandoned at their overall deadline.
    timed_out: HashSet<TurnId>,
    closed: bool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("transport", &self.transport.name())
            .field("turns_run", &self.issued.len())
            .field("init_count", &self.init.count())
            .field("closed", &self.closed)
            .finish()
    }
}

impl Session {
    pub fn new(transport: Box<dyn Transport>, config: SessionConfig) -> Self {
        Self {
            transport,
            config,
            init: InitTracker::default(),
            issued: Vec::new(),
            timed_out: HashSet::new(),
            closed: false,
        }
    }

    pub fn transport_name(&self) -> &str {
        self.transport.name()
    }

    /// Initialization phrase occurrences seen so far this session.
    pub fn init_count(&self) -> usize {
        self.init.count()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Drain startup output of a quiescence transport before the first turn.
    ///
    /// Startup lines are checked for marker leakage and count toward the
    /// initialization bound. Returns `None` for explicit-completion
    /// transports, which have no unsolicited startup output.
    pub async fn settle_startup(
        &mut self,
        expectations: &Expectations,
    ) -> Result<Option<TurnReport>, HarnessError> {
        self.ensure_open()?;
        if self.transport.completion_mode() != CompletionMode::Quiescence {
            return Ok(None);
        }

        let started_at = Utc::now();
        let config = CollectorConfig {
            overall_timeout: self.config.startup_timeout,
            ..self.config.collector
        };
        // Console output is unattributed, so any id collects it.
        let turn = TurnId::new();
        let outcome = collector::collect_with_mode(
            self.transport.as_mut(),
            turn,
            CompletionMode::Quiescence,
            &config,
        )
        .await;

        let report = self
            .conclude(STARTUP_LABEL, None, outcome, expectations, started_at)
            .await?;
        info!(events = report.events, elapsed_ms = report.elapsed_ms, "startup settled");
        Ok(Some(report))
    }

    /// Submit `request`, collect its output and evaluate it.
    pub async fn run(
        &mut self,
        request: &Request,
        expectations: &Expectations,
    ) -> Result<TurnReport, HarnessError> {
        self.ensure_open()?;
        let started_at = Utc::now();

        let turn = match self.transport.submit(request).await {
            Ok(turn) => turn,
            Err(source) => {
                self.abort().await;
                return Err(HarnessError::transport(source));
            }
        };
        self.issued.push(turn);
        let label = format!("turn {}", self.issued.len());
        info!(turn_id = %turn, turn = self.issued.len(), "turn submitted");

        let outcome = collector::collect(self.transport.as_mut(), turn, &self.config.collector).await;
        let report = self
            .conclude(&label, Some(request), outcome, expectations, started_at)
            .await?;
        info!(
            turn_id = %turn,
            completion = %report.completion,
            passed = report.passed(),
            "turn evaluated"
        );
        Ok(report)
    }

    /// Read one more poll window after the last turn of an explicit
    /// transport and return terminal signals that arrived for turns this
    /// session already finished.
    ///
    /// The collector stops at a turn's first `idle`, so a duplicate on the
    /// final turn is only visible here. Quiescence transports and closed
    /// sessions return nothing. A transport failure ends the drain quietly.
    pub async fn drain_trailing(&mut self) -> Vec<ProtocolViolation> {
        let mut violations = Vec::new();
        if self.closed || self.transport.completion_mode() != CompletionMode::Explicit {
            return violations;
        }

        let deadline = Instant::now() + self.config.collector.poll_interval;
        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            match self.transport.poll_event(deadline - now).await {
                Ok(envelope) => match envelope.parent() {
                    Some(parent) if envelope.event.is_idle() => {
                        warn!(%parent, "terminal signal after the last turn");
                        violations.push(ProtocolViolation::StrayTerminal { parent });
                    }
                    _ => debug!(origin = ?envelope.origin, kind = envelope.event.kind(), "trailing event"),
                },
                Err(e) if e.is_timeout() => break,
                Err(e) => {
                    warn!(error = %e, "transport failed while draining trailing output");
                    break;
                }
            }
        }
        self.classify(&mut violations);
        violations
    }

    /// Shut the transport down and reset session state. Idempotent.
    pub async fn teardown(&mut self) -> Result<(), HarnessError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.init = InitTracker::default();
        self.transport.shutdown().await.map_err(HarnessError::transport)?;
        info!(turns = self.issued.len(), "session torn down");
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), HarnessError> {
        if self.closed {
            Err(HarnessError::SessionClosed)
        } else {
            Ok(())
        }
    }

    /// Tear down after a fatal transport failure, keeping the original error.
    async fn abort(&mut self) {
        if let Err(e) = self.teardown().await {
            warn!(error = %e, "teardown after transport failure also failed");
        }
    }

    /// Name terminal signals by what this session knows of their turn: a
    /// timed-out turn's idle is late, not a duplicate, and turns this
    /// session never issued are not its business.
    fn classify(&self, violations: &mut Vec<ProtocolViolation>) {
        violations.retain(|v| {
            let known = self.issued.contains(&v.parent());
            if !known {
                debug!(parent = %v.parent(), "terminal signal for a turn this session did not issue");
            }
            known
        });
        for violation in violations.iter_mut() {
            let parent = violation.parent();
            if self.timed_out.contains(&parent) {
                *violation = ProtocolViolation::LateTerminal { parent };
            }
        }
    }

    /// Judge a collection outcome. On transport failure the partial output
    /// is judged first, then the session is aborted and the report travels
    /// inside the error.
    async fn conclude(
        &mut self,
        label: &str,
        request: Option<&Request>,
        outcome: Result<TurnResult, CollectError>,
        expectations: &Expectations,
        started_at: DateTime<Utc>,
    ) -> Result<TurnReport, HarnessError> {
        let (mut result, timed_out, failure) = match outcome {
            Ok(result) => (result, false, None),
            Err(CollectError::Timeout { partial, .. }) => (partial, true, None),
            Err(CollectError::Transport { partial, source }) => (partial, false, Some(source)),
        };
        self.classify(&mut result.violations);
        if timed_out {
            self.timed_out.insert(result.turn);
        }
        let report = self.judge(label, request, &result, timed_out, expectations, started_at);

        match failure {
            None => Ok(report),
            Some(source) => {
                warn!(turn_id = %result.turn, events = result.events.len(), error = %source, "aborting session");
                self.abort().await;
                Err(HarnessError::Transport {
                    turn: Some(result.turn),
                    partial: Some(Box::new(report)),
                    source,
                })
            }
        }
    }

    fn judge(
        &mut self,
        label: &str,
        request: Option<&Request>,
        result: &TurnResult,
        timed_out: bool,
        expectations: &Expectations,
        started_at: DateTime<Utc>,
    ) -> TurnReport {
        let mut verdicts = vec![validate::completion_verdict(result, timed_out)];
        verdicts.extend(validate::protocol_verdict(&result.violations));
        verdicts.extend(validate::evaluate(
            result,
            request,
            expectations,
            &mut self.init,
        ));
        TurnReport::from_result(label, result, verdicts, started_at)
    }
}
