//! Leakage checks: kernel plumbing that must never reach user output.

use super::{ECHO_ABSENCE, MARKER_ABSENCE, Verdict, snippet};
use crate::event::{Event, Request};

/// Fail if any visible text contains the internal completion marker.
pub fn marker_absence(events: &[Event], marker: &str) -> Verdict {
    let leaks: Vec<String> = events
        .iter()
        .enumerate()
        .filter_map(|(index, event)| {
            let text = event.visible_text()?;
            text.contains(marker)
                .then(|| format!("#{index} {}: {}", event.kind(), snippet(text)))
        })
        .collect();

    if leaks.is_empty() {
        Verdict::pass(MARKER_ABSENCE, format!("marker {marker:?} not visible"))
    } else {
        Verdict::fail(
            MARKER_ABSENCE,
            format!(
                "marker {marker:?} leaked in {} line(s): {}",
                leaks.len(),
                leaks.join("; ")
            ),
        )
    }
}

/// Fail if a console line echoes a request line behind a line number,
/// e.g. `12   %put hello world;` for the request `%put hello world;`.
pub fn echo_absence(events: &[Event], request: &Request) -> Verdict {
    let lines: Vec<&str> = request.lines().collect();
    let echoes: Vec<String> = events
        .iter()
        .enumerate()
        .filter_map(|(index, event)| match event {
            Event::RawLine { text, .. } if lines.iter().any(|l| is_numbered_echo(text, l)) => {
                Some(format!("#{index}: {}", snippet(text)))
            }
            _ => None,
        })
        .collect();

    if echoes.is_empty() {
        Verdict::pass(
            ECHO_ABSENCE,
            format!("no numbered echo of {} request line(s)", lines.len()),
        )
    } else {
        Verdict::fail(
            ECHO_ABSENCE,
            format!(
                "input echoed in {} line(s): {}",
                echoes.len(),
                echoes.join("; ")
            ),
        )
    }
}

/// Whether `text` contains `line` preceded by digits and whitespace.
fn is_numbered_echo(text: &str, line: &str) -> bool {
    text.match_indices(line).any(|(at, _)| {
        let before = &text[..at];
        let number = before.trim_end();
        number.len() < before.len() && number.ends_with(|c: char| c.is_ascii_digit())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::LineSource;

    fn raw(text: &str) -> Event {
        Event::RawLine {
            source: LineSource::Stdout,
            text: text.into(),
        }
    }

    #[test]
    fn numbered_echo_detection() {
        assert!(is_numbered_echo("1   %put hello world;", "%put hello world;"));
        assert!(is_numbered_echo("NOTE: 12 %put x;", "%put x;"));
        assert!(!is_numbered_echo("%put hello world;", "%put hello world;"));
        assert!(!is_numbered_echo("1%put x;", "%put x;"));
        assert!(!is_numbered_echo("hello world", "%put hello world;"));
    }

    #[test]
    fn echo_in_console_output_fails() {
        let events = vec![raw("1   %put hello world;"), raw("hello world")];
        let verdict = echo_absence(&events, &Request::new("%put hello world;"));
        assert!(!verdict.passed);
        assert!(verdict.detail.contains("#0"), "{}", verdict.detail);
        assert!(!verdict.detail.contains("#1"), "{}", verdict.detail);
    }

    #[test]
    fn multi_line_request_checks_each_line() {
        let request = Request::new("data a;\n  set b;\nrun;");
        let verdict = echo_absence(&[raw("2      set b;")], &request);
        assert!(!verdict.passed);
        assert!(echo_absence(&[raw("NOTE: done")], &request).passed);
    }

    #[test]
    fn echo_only_checks_console_lines() {
        let events = vec![Event::Stream {
            name: "stdout".into(),
            text: "1   %put hello world;".into(),
        }];
        assert!(echo_absence(&events, &Request::new("%put hello world;")).passed);
    }

    #[test]
    fn marker_in_stream_fails() {
        let events = vec![
            Event::Stream {
                name: "stdout".into(),
                text: "result\nEND_MARK_42\n".into(),
            },
            raw("clean"),
        ];
        let verdict = marker_absence(&events, "END_MARK");
        assert!(!verdict.passed);
        assert!(verdict.detail.contains("1 line(s)"), "{}", verdict.detail);
        assert!(verdict.detail.contains("#0 stream"), "{}", verdict.detail);
    }

    #[test]
    fn marker_in_payload_is_not_visible() {
        let events = vec![Event::DisplayPayload {
            data: [("text/html".to_string(), serde_json::json!("<!-- END_MARK -->"))].into(),
        }];
        assert!(marker_absence(&events, "END_MARK").passed);
    }
}
