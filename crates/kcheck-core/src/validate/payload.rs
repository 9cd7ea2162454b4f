//! Payload completeness: a rich document payload must not be cut short.
//!
//! A mimetype with a known document root (HTML, SVG) is complete when,
//! after trimming whitespace, it ends with the root's closing token. The
//! requirement applies whenever the root element opens somewhere in the
//! payload, so a document rendered behind a leading `<style>` block is still
//! checked; fragments such as a bare `<table>` carry no closing-token
//! obligation.

use serde_json::Value;

use super::{PAYLOAD_COMPLETENESS, Verdict};
use crate::event::Event;

/// Characters of payload tail quoted when a payload is truncated.
pub const TAIL_CHARS: usize = 100;

/// Document mimetypes with a required closing token.
const CLOSING_RULES: &[ClosingRule] = &[
    ClosingRule {
        mimetype: "text/html",
        roots: &["<html", "<!doctype html"],
        close: "</html>",
    },
    ClosingRule {
        mimetype: "application/xhtml+xml",
        roots: &["<html", "<!doctype html"],
        close: "</html>",
    },
    ClosingRule {
        mimetype: "image/svg+xml",
        roots: &["<svg"],
        close: "</svg>",
    },
];

struct ClosingRule {
    mimetype: &'static str,
    /// Lowercase openings that mark a full document.
    roots: &'static [&'static str],
    close: &'static str,
}

/// Result of checking one payload value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadCheck {
    /// Mimetype has no closing-token rule, or the value is not text.
    NotApplicable,
    /// Text of a known mimetype that never opens a full document.
    Fragment,
    /// Full document ending in its closing token.
    Complete { table_rows: usize },
    /// Full document missing its closing token.
    Truncated {
        bytes: usize,
        close: &'static str,
        tail: String,
    },
}

fn rule_for(mimetype: &str) -> Option<&'static ClosingRule> {
    let base = mimetype.split(';').next().unwrap_or(mimetype).trim();
    CLOSING_RULES
        .iter()
        .find(|r| r.mimetype.eq_ignore_ascii_case(base))
}

/// Check a single payload value of the given mimetype.
pub fn check_payload(mimetype: &str, value: &Value) -> PayloadCheck {
    let Some(rule) = rule_for(mimetype) else {
        return PayloadCheck::NotApplicable;
    };
    let text = match value {
        Value::String(s) => s.clone(),
        Value::Array(parts) if parts.iter().all(Value::is_string) => {
            parts.iter().filter_map(Value::as_str).collect()
        }
        _ => return PayloadCheck::NotApplicable,
    };

    let trimmed = text.trim();
    let lower = trimmed.to_ascii_lowercase();
    if !rule.roots.iter().any(|root| lower.contains(root)) {
        return PayloadCheck::Fragment;
    }

    if lower.ends_with(rule.close) {
        PayloadCheck::Complete {
            table_rows: lower.matches("</tr>").count(),
        }
    } else {
        PayloadCheck::Truncated {
            bytes: trimmed.len(),
            close: rule.close,
            tail: tail_chars(trimmed, TAIL_CHARS),
        }
    }
}

/// The last `n` characters of `s`.
fn tail_chars(s: &str, n: usize) -> String {
    let start = s
        .char_indices()
        .rev()
        .nth(n.saturating_sub(1))
        .map_or(0, |(i, _)| i);
    s[start..].to_string()
}

/// Check every document payload among `events`.
///
/// Both display payloads and execute results are inspected.
pub fn payload_completeness(events: &[Event]) -> Verdict {
    let mut complete = Vec::new();
    let mut failures = Vec::new();

    for (index, event) in events.iter().enumerate() {
        let Some(bundle) = event.mime_bundle() else {
            continue;
        };
        for (mimetype, value) in bundle {
            match check_payload(mimetype, value) {
                PayloadCheck::NotApplicable | PayloadCheck::Fragment => {}
                PayloadCheck::Complete { table_rows } => {
                    complete.push(format!("{mimetype}: {table_rows} table rows"));
                }
                PayloadCheck::Truncated { bytes, close, tail } => {
                    failures.push(format!(
                        "event #{index} {mimetype} payload of {bytes} bytes does not end with {close}; last {TAIL_CHARS} chars: {tail:?}"
                    ));
                }
            }
        }
    }

    if !failures.is_empty() {
        return Verdict::fail(PAYLOAD_COMPLETENESS, failures.join("; "));
    }
    if complete.is_empty() {
        Verdict::pass(PAYLOAD_COMPLETENESS, "no document payloads")
    } else {
        Verdict::pass(
            PAYLOAD_COMPLETENESS,
            format!("{} complete ({})", complete.len(), complete.join(", ")),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn display(mimetype: &str, body: &str) -> Event {
        Event::DisplayPayload {
            data: BTreeMap::from([(mimetype.to_string(), json!(body))]),
        }
    }

    #[test]
    fn closing_tokens_by_mimetype() {
        let close = |mimetype| rule_for(mimetype).map(|r| r.close);
        assert_eq!(close("text/html"), Some("</html>"));
        assert_eq!(close("TEXT/HTML; charset=utf-8"), Some("</html>"));
        assert_eq!(close("image/svg+xml"), Some("</svg>"));
        assert_eq!(close("text/plain"), None);
    }

    #[test]
    fn complete_html_passes_with_row_count() {
        let html = "<html><body><table><tr><td>a</td></tr><tr><td>b</td></tr></table></body></html>\n";
        assert_eq!(
            check_payload("text/html", &json!(html)),
            PayloadCheck::Complete { table_rows: 2 }
        );
        let verdict = payload_completeness(&[display("text/html", html)]);
        assert!(verdict.passed);
        assert!(verdict.detail.contains("2 table rows"), "{}", verdict.detail);
    }

    #[test]
    fn truncated_html_fails_with_length_and_tail() {
        let html = "<html><body><table><tr><td>a</td></tr>";
        let verdict = payload_completeness(&[display("text/html", html)]);
        assert!(!verdict.passed);
        assert!(verdict.detail.contains(&format!("{} bytes", html.len())), "{}", verdict.detail);
        assert!(verdict.detail.contains("</html>"));
        assert!(verdict.detail.contains("<td>a</td></tr>"));
    }

    #[test]
    fn doctype_opening_counts_as_document() {
        let html = "<!DOCTYPE html>\n<HTML><body>cut";
        assert!(matches!(
            check_payload("text/html", &json!(html)),
            PayloadCheck::Truncated { close: "</html>", .. }
        ));
        let closed = "<!DOCTYPE html>\n<HTML><body></body></HTML>";
        assert!(matches!(
            check_payload("text/html", &json!(closed)),
            PayloadCheck::Complete { .. }
        ));
    }

    #[test]
    fn styled_document_is_checked_behind_its_style_block() {
        let prefix = "<style type=\"text/css\">\n.table { border: 1px; }\n</style>\n<!DOCTYPE html>\n";
        let truncated = format!("{prefix}<html><body><table><tr><td>1</td></tr>");
        let verdict = payload_completeness(&[display("text/html", &truncated)]);
        assert!(!verdict.passed, "{}", verdict.detail);
        assert!(verdict.detail.contains(&format!("{} bytes", truncated.len())), "{}", verdict.detail);

        let complete = format!("{prefix}<html><body><table><tr><td>1</td></tr></table></body></html>\n");
        let verdict = payload_completeness(&[display("text/html", &complete)]);
        assert!(verdict.passed, "{}", verdict.detail);
        assert!(verdict.detail.contains("1 table rows"), "{}", verdict.detail);
    }

    #[test]
    fn html_fragment_has_no_closing_obligation() {
        assert_eq!(
            check_payload("text/html", &json!("<table><tr><td>1</td></tr>")),
            PayloadCheck::Fragment
        );
        assert!(payload_completeness(&[display("text/html", "<b>bold")]).passed);
    }

    #[test]
    fn truncated_svg_fails() {
        let verdict = payload_completeness(&[display("image/svg+xml", "<svg width=\"10\"><rect/>")]);
        assert!(!verdict.passed);
        assert!(verdict.detail.contains("</svg>"));
    }

    #[test]
    fn execute_result_payloads_are_checked() {
        let event = Event::ExecuteResult {
            execution_count: Some(1),
            data: BTreeMap::from([
                ("text/plain".to_string(), json!("<html>")),
                ("text/html".to_string(), json!(["<html><body>", "cut off"])),
            ]),
        };
        let verdict = payload_completeness(&[event]);
        assert!(!verdict.passed);
        assert!(verdict.detail.starts_with("event #0 text/html"), "{}", verdict.detail);
    }

    #[test]
    fn tail_is_last_hundred_chars() {
        let body = format!("<html>{}", "x".repeat(300));
        let PayloadCheck::Truncated { tail, .. } = check_payload("text/html", &json!(body)) else {
            panic!("expected truncation");
        };
        assert_eq!(tail.chars().count(), TAIL_CHARS);
        assert_eq!(tail_chars("héllo", 3), "llo");
        assert_eq!(tail_chars("ab", 100), "ab");
    }

    #[test]
    fn no_payloads_passes() {
        let verdict = payload_completeness(&[Event::Stream {
            name: "stdout".into(),
            text: "<html>".into(),
        }]);
        assert!(verdict.passed);
        assert_eq!(verdict.detail, "no document payloads");
    }
}
