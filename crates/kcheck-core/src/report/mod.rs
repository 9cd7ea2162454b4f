//! Session reports: per-turn verdicts aggregated into one exit status.
//!
//! A report passes iff every verdict of every turn passes and the session
//! was not aborted by a transport failure.

use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::collector::{Completion, TurnResult};
use crate::error::HarnessError;
use crate::event::TurnId;
use crate::validate::Verdict;

/// Every verdict passed.
pub const EXIT_PASS: i32 = 0;
/// A validation, timeout or protocol verdict failed.
pub const EXIT_FAIL: i32 = 1;
/// The kernel connection or process failed.
pub const EXIT_TRANSPORT: i32 = 2;

/// Outcome of one turn.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TurnReport {
    pub label: String,
    pub turn_id: TurnId,
    pub completion: Completion,
    /// Events attributed to the turn.
    pub events: usize,
    /// Events from other turns observed while collecting.
    pub stray_events: usize,
    pub elapsed_ms: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub verdicts: Vec<Verdict>,
}

impl TurnReport {
    pub fn from_result(
        label: impl Into<String>,
        result: &TurnResult,
        verdicts: Vec<Verdict>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            label: label.into(),
            turn_id: result.turn,
            completion: result.completion,
            events: result.events.len(),
            stray_events: result.stray.len(),
            elapsed_ms: result.elapsed.as_millis() as u64,
            started_at,
            finished_at: Utc::now(),
            verdicts,
        }
    }

    pub fn passed(&self) -> bool {
        self.verdicts.iter().all(|v| v.passed)
    }

    pub fn failures(&self) -> impl Iterator<Item = &Verdict> {
        self.verdicts.iter().filter(|v| !v.passed)
    }
}

/// Outcome of a whole session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Report {
    /// Description of the kernel the session talked to.
    pub target: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub turns: Vec<TurnReport>,
    /// Set when a transport failure aborted the session.
    pub transport_failure: Option<String>,
}

impl Report {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            started_at: Utc::now(),
            finished_at: None,
            turns: Vec::new(),
            transport_failure: None,
        }
    }

    pub fn push(&mut self, turn: TurnReport) {
        self.turns.push(turn);
    }

    /// Record the transport failure that ended the session.
    pub fn abort(&mut self, error: &HarnessError) {
        self.transport_failure = Some(error.to_string());
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    pub fn passed(&self) -> bool {
        self.transport_failure.is_none() && self.turns.iter().all(TurnReport::passed)
    }

    pub fn exit_code(&self) -> i32 {
        if self.transport_failure.is_some() {
            EXIT_TRANSPORT
        } else if self.passed() {
            EXIT_PASS
        } else {
            EXIT_FAIL
        }
    }

    /// Every failing verdict, with the label of its turn.
    pub fn failures(&self) -> Vec<(&str, &Verdict)> {
        self.turns
            .iter()
            .flat_map(|t| t.failures().map(move |v| (t.label.as_str(), v)))
            .collect()
    }

    /// Human-readable report, one line per verdict.
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "kcheck: {}", self.target);
        for turn in &self.turns {
            let _ = writeln!(
                out,
                "\n{} ({}, {} events, {}ms)",
                turn.label, turn.completion, turn.events, turn.elapsed_ms
            );
            for verdict in &turn.verdicts {
                let tag = if verdict.passed { "PASS" } else { "FAIL" };
                let _ = writeln!(out, "  [{tag}] {}", verdict.name);
                if !verdict.passed {
                    let _ = writeln!(out, "         {}", verdict.detail);
                }
            }
        }
        if let Some(failure) = &self.transport_failure {
            let _ = writeln!(out, "\n[FAIL] transport: {failure}");
        }

        let failures = self.failures().len();
        let summary = match (&self.transport_failure, failures) {
            (Some(_), _) => "ABORTED".to_string(),
            (None, 0) => "PASSED".to_string(),
            (None, n) => format!("FAILED ({n} failing verdicts)"),
        };
        let _ = writeln!(out, "\n{} turns, {summary}", self.turns.len());
        out
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
