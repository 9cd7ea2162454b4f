//! Turn validators.
//!
//! Each validator is a pure check over a [`TurnResult`] returning a
//! [`Verdict`]. The initialization bound is the one exception: it also
//! updates the session-scoped [`InitTracker`] it is handed.
//!
//! [`evaluate`] runs every validator enabled by an [`Expectations`] value,
//! in a fixed order, and returns one verdict per validator.

pub mod content;
pub mod init;
pub mod leakage;
pub mod payload;

use serde::Serialize;

use crate::collector::{Completion, ProtocolViolation, TurnResult};
use crate::event::Request;

pub use init::InitTracker;

/// Verdict names, stable for reports and scripts.
pub const PAYLOAD_COMPLETENESS: &str = "payload-completeness";
pub const MARKER_ABSENCE: &str = "marker-absence";
pub const ECHO_ABSENCE: &str = "echo-absence";
pub const INIT_BOUND: &str = "init-bound";
pub const CONTENT_PRESENCE: &str = "content-presence";
pub const TURN_COMPLETION: &str = "turn-completion";
pub const PROTOCOL: &str = "protocol";

/// Maximum bytes of event text quoted in a verdict detail.
const SNIPPET_BYTES: usize = 120;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Outcome of one validator for one turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Verdict {
    pub name: String,
    pub passed: bool,
    pub detail: String,
}

impl Verdict {
    pub fn pass(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: true,
            detail: detail.into(),
        }
    }

    pub fn fail(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: false,
            detail: detail.into(),
        }
    }
}

/// What a turn is checked against.
///
/// Use [`Expectations::new`] and chain the setters. Payload completeness is
/// on by default; every other check is enabled by supplying its input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expectations {
    /// Literal substring some event must contain.
    pub expect: Option<String>,
    /// Internal completion marker that must never reach visible output.
    pub marker: Option<String>,
    /// Phrase the kernel prints once when it initializes.
    pub init_phrase: Option<String>,
    /// Whether console lines are checked for numbered input echo.
    pub check_echo: bool,
    pub check_payloads: bool,
}

impl Default for Expectations {
    fn default() -> Self {
        Self::new()
    }
}

impl Expectations {
    pub fn new() -> Self {
        Self {
            expect: None,
            marker: None,
            init_phrase: None,
            check_echo: false,
            check_payloads: true,
        }
    }

    pub fn expect(mut self, substring: impl Into<String>) -> Self {
        self.expect = Some(substring.into());
        self
    }

    pub fn marker(mut self, token: impl Into<String>) -> Self {
        self.marker = Some(token.into());
        self
    }

    pub fn init_phrase(mut self, phrase: impl Into<String>) -> Self {
        self.init_phrase = Some(phrase.into());
        self
    }

    pub fn check_echo(mut self, enabled: bool) -> Self {
        self.check_echo = enabled;
        self
    }

    pub fn check_payloads(mut self, enabled: bool) -> Self {
        self.check_payloads = enabled;
        self
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// Run every enabled validator over `turn`.
///
/// `request` is the submitted request, if any (startup output has none; the
/// echo check is skipped then).
pub fn evaluate(
    turn: &TurnResult,
    request: Option<&Request>,
    expectations: &Expectations,
    init: &mut InitTracker,
) -> Vec<Verdict> {
    let events = &turn.events;
    let mut verdicts = Vec::new();

    if expectations.check_payloads {
        verdicts.push(payload::payload_completeness(events));
    }
    if let Some(marker) = &expectations.marker {
        verdicts.push(leakage::marker_absence(events, marker));
    }
    if let (true, Some(request)) = (expectations.check_echo, request) {
        verdicts.push(leakage::echo_absence(events, request));
    }
    if let Some(phrase) = &expectations.init_phrase {
        verdicts.push(init::init_bound(events, phrase, init));
    }
    if let Some(expected) = &expectations.expect {
        verdicts.push(content::content_presence(events, expected));
    }

    verdicts
}

/// Verdict for how the turn ended.
pub fn completion_verdict(turn: &TurnResult, timed_out: bool) -> Verdict {
    match turn.completion {
        Completion::Idle => Verdict::pass(
            TURN_COMPLETION,
            format!("idle after {} events in {}ms", turn.events.len(), turn.elapsed.as_millis()),
        ),
        Completion::Quiescent => Verdict::pass(
            TURN_COMPLETION,
            format!(
                "quiescent after {} events in {}ms",
                turn.events.len(),
                turn.elapsed.as_millis()
            ),
        ),
        Completion::Incomplete if timed_out => Verdict::fail(
            TURN_COMPLETION,
            format!(
                "timed out: no terminal signal within {}ms ({} events collected)",
                turn.elapsed.as_millis(),
                turn.events.len()
            ),
        ),
        Completion::Incomplete => Verdict::fail(
            TURN_COMPLETION,
            format!("incomplete after {} events", turn.events.len()),
        ),
    }
}

/// Verdict for protocol violations observed during the turn, if any.
pub fn protocol_verdict(violations: &[ProtocolViolation]) -> Option<Verdict> {
    if violations.is_empty() {
        return None;
    }
    let detail = violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ");
    Some(Verdict::fail(PROTOCOL, detail))
}

/// Truncate a string to at most `max_bytes` bytes, appending "..." if
/// truncated.
pub(crate) fn truncate_snippet(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_owned();
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    let mut truncated = s[..end].to_owned();
    truncated.push_str("...");
    truncated
}

/// Quote event text for a verdict detail.
pub(crate) fn snippet(s: &str) -> String {
    format!("{:?}", truncate_snippet(s.trim(), SNIPPET_BYTES))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Event, KernelState, LineSource, TurnId};
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn turn_with(events: Vec<Event>, completion: Completion) -> TurnResult {
        let mut turn = TurnResult::new(TurnId::new());
        turn.events = events;
        turn.completion = completion;
        turn.elapsed = Duration::from_millis(1500);
        turn
    }

    #[test]
    fn truncate_short_string_unchanged() {
        assert_eq!(truncate_snippet("hello", 10), "hello");
    }

    #[test]
    fn truncate_long_string_with_ellipsis() {
        assert_eq!(truncate_snippet("abcdefghij", 5), "abcde...");
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_snippet("ééé", 3), "é...");
    }

    #[test]
    fn evaluate_runs_only_enabled_validators_in_order() {
        let turn = turn_with(vec![], Completion::Idle);
        let mut init = InitTracker::default();

        let verdicts = evaluate(&turn, None, &Expectations::new(), &mut init);
        let names: Vec<&str> = verdicts.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, vec![PAYLOAD_COMPLETENESS]);

        let all = Expectations::new()
            .expect("x")
            .marker("END_MARK")
            .init_phrase("initialization")
            .check_echo(true);
        let request = Request::new("x");
        let verdicts = evaluate(&turn, Some(&request), &all, &mut init);
        let names: Vec<&str> = verdicts.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                PAYLOAD_COMPLETENESS,
                MARKER_ABSENCE,
                ECHO_ABSENCE,
                INIT_BOUND,
                CONTENT_PRESENCE
            ]
        );
    }

    #[test]
    fn echo_check_skipped_without_request() {
        let turn = turn_with(vec![], Completion::Quiescent);
        let mut init = InitTracker::default();
        let verdicts = evaluate(
            &turn,
            None,
            &Expectations::new().check_payloads(false).check_echo(true),
            &mut init,
        );
        assert!(verdicts.is_empty());
    }

    #[test]
    fn end_to_end_channel_turn_passes() {
        let html = "<html><body><table><tr><td>1</td></tr></table></body></html>";
        let turn = turn_with(
            vec![
                Event::DisplayPayload {
                    data: BTreeMap::from([("text/html".to_string(), json!(html))]),
                },
                Event::Status {
                    state: KernelState::Idle,
                },
            ],
            Completion::Idle,
        );
        let mut init = InitTracker::default();
        let verdicts = evaluate(
            &turn,
            Some(&Request::new("print dataset X")),
            &Expectations::new().expect("<table"),
            &mut init,
        );
        assert_eq!(verdicts.len(), 2);
        assert!(verdicts.iter().all(|v| v.passed), "{verdicts:?}");
    }

    #[test]
    fn echo_failure_coexists_with_content_pass() {
        let turn = turn_with(
            vec![
                Event::RawLine {
                    source: LineSource::Stdout,
                    text: "1   %put hello world;".into(),
                },
                Event::RawLine {
                    source: LineSource::Stdout,
                    text: "hello world".into(),
                },
            ],
            Completion::Quiescent,
        );
        let mut init = InitTracker::default();
        let verdicts = evaluate(
            &turn,
            Some(&Request::new("%put hello world;")),
            &Expectations::new().expect("hello world").check_echo(true),
            &mut init,
        );
        let echo = verdicts.iter().find(|v| v.name == ECHO_ABSENCE).unwrap();
        let content = verdicts.iter().find(|v| v.name == CONTENT_PRESENCE).unwrap();
        assert!(!echo.passed);
        assert!(content.passed);
    }

    #[test]
    fn completion_verdicts() {
        let idle = turn_with(vec![], Completion::Idle);
        assert!(completion_verdict(&idle, false).passed);

        let quiet = turn_with(vec![], Completion::Quiescent);
        assert!(completion_verdict(&quiet, false).detail.starts_with("quiescent"));

        let timed_out = turn_with(vec![], Completion::Incomplete);
        let verdict = completion_verdict(&timed_out, true);
        assert!(!verdict.passed);
        assert!(verdict.detail.contains("timed out"), "{}", verdict.detail);
        assert!(verdict.detail.contains("1500ms"), "{}", verdict.detail);
    }

    #[test]
    fn protocol_verdict_only_when_violated() {
        assert!(protocol_verdict(&[]).is_none());
        let parent = TurnId::new();
        let verdict =
            protocol_verdict(&[ProtocolViolation::StrayTerminal { parent }]).unwrap();
        assert!(!verdict.passed);
        assert_eq!(verdict.name, PROTOCOL);
        assert!(verdict.detail.contains(&parent.to_string()));
    }
}
