//! Event model shared by every transport.
//!
//! Transports translate their wire input (signed JSON frames on the channel
//! transport, raw text lines on the console transport) into [`Event`]
//! values wrapped in an [`Envelope`]. The collector consumes envelopes in
//! arrival order and never reorders them.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Turn identity and requests
// ---------------------------------------------------------------------------

/// Identifier for one submitted request.
///
/// On the channel transport this is the `msg_id` of the execute request, and
/// every broadcast frame caused by that request carries it as its parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TurnId(Uuid);

impl TurnId {
    /// Mint a fresh random turn id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }
}

impl Default for TurnId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TurnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A unit of executable text submitted once per turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    code: String,
}

impl Request {
    pub fn new(code: impl Into<String>) -> Self {
        Self { code: code.into() }
    }

    /// The submitted text, exactly as sent.
    pub fn code(&self) -> &str {
        &self.code
    }

    /// Non-blank lines of the request, trimmed.
    ///
    /// A console kernel that echoes input echoes it line by line, so the echo
    /// check matches against these.
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.code.lines().map(str::trim).filter(|l| !l.is_empty())
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Kernel execution state carried by a status event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KernelState {
    Starting,
    Busy,
    Idle,
}

impl KernelState {
    /// Parse a wire `execution_state` value. Unknown states return `None`.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "starting" => Some(Self::Starting),
            "busy" => Some(Self::Busy),
            "idle" => Some(Self::Idle),
            _ => None,
        }
    }
}

/// Which standard stream of a console child a line was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineSource {
    Stdout,
    Stderr,
}

/// One unit of kernel output, as decoded by a transport.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Text written to a named output stream (`stdout`, `stderr`).
    Stream { name: String, text: String },
    /// Rich display output keyed by mimetype.
    DisplayPayload { data: BTreeMap<String, Value> },
    /// The value of the executed request, keyed by mimetype.
    ExecuteResult {
        execution_count: Option<u64>,
        data: BTreeMap<String, Value>,
    },
    /// An error raised by the executed code.
    Error { kind: String, message: String },
    /// Kernel execution state change. `Idle` ends a channel turn.
    Status { state: KernelState },
    /// The kernel's broadcast of the code it is about to run.
    ExecuteInput { code: String },
    /// The control-path reply to a submission (`ok`, `error`, `abort`).
    Reply { status: String },
    /// One line of console output, with terminal escapes removed.
    RawLine { source: LineSource, text: String },
    /// A well-formed frame whose kind the harness does not model.
    Unknown { kind: String, content: Value },
}

impl Event {
    /// Short stable name of the variant, used in logs and diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Stream { .. } => "stream",
            Event::DisplayPayload { .. } => "display_data",
            Event::ExecuteResult { .. } => "execute_result",
            Event::Error { .. } => "error",
            Event::Status { .. } => "status",
            Event::ExecuteInput { .. } => "execute_input",
            Event::Reply { .. } => "reply",
            Event::RawLine { .. } => "raw_line",
            Event::Unknown { .. } => "unknown",
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(
            self,
            Event::Status {
                state: KernelState::Idle
            }
        )
    }

    /// Text a user would see in a terminal: stream text and console lines.
    ///
    /// Marker leakage is only meaningful here; rich payloads are rendered,
    /// not printed.
    pub fn visible_text(&self) -> Option<&str> {
        match self {
            Event::Stream { text, .. } | Event::RawLine { text, .. } => Some(text),
            _ => None,
        }
    }

    /// Every piece of kernel output text carried by this event.
    ///
    /// Mimetype bundles contribute each value (strings verbatim, structured
    /// values as compact JSON). Input broadcasts, replies, status changes and
    /// unknown frames contribute nothing.
    pub fn output_text(&self) -> Vec<Cow<'_, str>> {
        match self {
            Event::Stream { text, .. } | Event::RawLine { text, .. } => {
                vec![Cow::Borrowed(text.as_str())]
            }
            Event::DisplayPayload { data } | Event::ExecuteResult { data, .. } => {
                data.values().map(value_text).collect()
            }
            Event::Error { kind, message } => vec![Cow::Owned(format!("{kind}: {message}"))],
            Event::Status { .. }
            | Event::ExecuteInput { .. }
            | Event::Reply { .. }
            | Event::Unknown { .. } => Vec::new(),
        }
    }

    /// Mimetype bundle of a rich payload, if this event carries one.
    pub fn mime_bundle(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Event::DisplayPayload { data } | Event::ExecuteResult { data, .. } => Some(data),
            _ => None,
        }
    }
}

fn value_text(value: &Value) -> Cow<'_, str> {
    match value {
        Value::String(s) => Cow::Borrowed(s.as_str()),
        // Multi-line text is sometimes sent as an array of lines.
        Value::Array(parts) if parts.iter().all(Value::is_string) => Cow::Owned(
            parts
                .iter()
                .filter_map(Value::as_str)
                .collect::<Vec<_>>()
                .concat(),
        ),
        other => Cow::Owned(other.to_string()),
    }
}

/// What an incoming frame names as its cause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    /// No parent reference: console lines and unsolicited kernel status.
    Unattributed,
    /// A request submitted through this harness.
    Turn(TurnId),
    /// A parent message id this harness never issued, e.g. another client's
    /// request. Kept verbatim for diagnostics.
    Foreign(String),
}

/// An event plus what caused it, as far as the transport knows.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub origin: Origin,
    pub event: Event,
}

impl Envelope {
    pub fn new(parent: Option<TurnId>, event: Event) -> Self {
        Self {
            origin: parent.map_or(Origin::Unattributed, Origin::Turn),
            event,
        }
    }

    /// An envelope with no parent attribution.
    pub fn unattributed(event: Event) -> Self {
        Self {
            origin: Origin::Unattributed,
            event,
        }
    }

    /// An envelope parented to a message id that is not one of our turns.
    pub fn foreign(msg_id: impl Into<String>, event: Event) -> Self {
        Self {
            origin: Origin::Foreign(msg_id.into()),
            event,
        }
    }

    /// The turn this envelope names as its parent, if it is one of ours.
    pub fn parent(&self) -> Option<TurnId> {
        match &self.origin {
            Origin::Turn(id) => Some(*id),
            Origin::Unattributed | Origin::Foreign(_) => None,
        }
    }

    /// Whether this envelope explicitly names `turn` as its parent.
    ///
    /// Explicit-completion transports attribute every frame, so only these
    /// envelopes are output of the turn.
    pub fn is_from(&self, turn: TurnId) -> bool {
        self.origin == Origin::Turn(turn)
    }

    /// Whether this envelope may be output of `turn`: it names `turn` or
    /// names nothing. Console lines are never attributed.
    pub fn belongs_to(&self, turn: TurnId) -> bool {
        matches!(self.origin, Origin::Unattributed) || self.is_from(turn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_lines_skip_blank_and_trim() {
        let req = Request::new("\nDATA work.x;\n   RUN;  \n\n");
        let lines: Vec<&str> = req.lines().collect();
        assert_eq!(lines, vec!["DATA work.x;", "RUN;"]);
    }

    #[test]
    fn kernel_state_parse() {
        assert_eq!(KernelState::parse("idle"), Some(KernelState::Idle));
        assert_eq!(KernelState::parse("busy"), Some(KernelState::Busy));
        assert_eq!(KernelState::parse("starting"), Some(KernelState::Starting));
        assert_eq!(KernelState::parse("restarting"), None);
    }

    #[test]
    fn only_idle_status_is_idle() {
        assert!(Event::Status { state: KernelState::Idle }.is_idle());
        assert!(!Event::Status { state: KernelState::Busy }.is_idle());
        assert!(!Event::RawLine { source: LineSource::Stdout, text: "idle".into() }.is_idle());
    }

    #[test]
    fn visible_text_covers_stream_and_raw_line_only() {
        let stream = Event::Stream { name: "stdout".into(), text: "hi".into() };
        let line = Event::RawLine { source: LineSource::Stderr, text: "there".into() };
        let display = Event::DisplayPayload {
            data: BTreeMap::from([("text/plain".to_string(), json!("hidden"))]),
        };
        assert_eq!(stream.visible_text(), Some("hi"));
        assert_eq!(line.visible_text(), Some("there"));
        assert_eq!(display.visible_text(), None);
    }

    #[test]
    fn output_text_flattens_mime_bundles() {
        let event = Event::ExecuteResult {
            execution_count: Some(3),
            data: BTreeMap::from([
                ("text/html".to_string(), json!("<table></table>")),
                ("text/plain".to_string(), json!(["a\n", "b"])),
                ("application/json".to_string(), json!({"rows": 2})),
            ]),
        };
        let texts: Vec<String> = event.output_text().into_iter().map(|c| c.into_owned()).collect();
        assert!(texts.contains(&"<table></table>".to_string()));
        assert!(texts.contains(&"a\nb".to_string()));
        assert!(texts.contains(&r#"{"rows":2}"#.to_string()));
    }

    #[test]
    fn output_text_ignores_input_and_status() {
        assert!(Event::ExecuteInput { code: "x".into() }.output_text().is_empty());
        assert!(Event::Status { state: KernelState::Busy }.output_text().is_empty());
        assert!(Event::Reply { status: "ok".into() }.output_text().is_empty());
    }

    #[test]
    fn error_text_includes_kind_and_message() {
        let event = Event::Error { kind: "SASError".into(), message: "bad".into() };
        assert_eq!(event.output_text(), vec![Cow::<str>::Owned("SASError: bad".into())]);
    }

    #[test]
    fn unattributed_envelope_may_belong_to_any_turn_but_is_from_none() {
        let turn = TurnId::new();
        let env = Envelope::unattributed(Event::Status { state: KernelState::Idle });
        assert!(env.belongs_to(turn));
        assert!(!env.is_from(turn));
        assert_eq!(env.parent(), None);

        let other = Envelope::new(Some(TurnId::new()), Event::Status { state: KernelState::Idle });
        assert!(!other.belongs_to(turn));
        let ours = Envelope::new(Some(turn), Event::Status { state: KernelState::Busy });
        assert!(ours.belongs_to(turn));
        assert!(ours.is_from(turn));
        assert_eq!(ours.parent(), Some(turn));
    }

    #[test]
    fn foreign_parent_never_belongs_to_our_turn() {
        let turn = TurnId::new();
        let env = Envelope::foreign("3f2a9c_1234_7", Event::Status { state: KernelState::Idle });
        assert_eq!(env.origin, Origin::Foreign("3f2a9c_1234_7".into()));
        assert_eq!(env.parent(), None);
        assert!(!env.belongs_to(turn));
        assert!(!env.is_from(turn));
    }
}
