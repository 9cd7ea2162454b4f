//! Content presence: the expected output must appear somewhere.

use super::{CONTENT_PRESENCE, Verdict};
use crate::event::Event;

/// Pass if any event's output text contains `expected` as a literal substring.
pub fn content_presence(events: &[Event], expected: &str) -> Verdict {
    let found = events.iter().enumerate().find(|(_, event)| {
        event
            .output_text()
            .iter()
            .any(|text| text.contains(expected))
    });

    match found {
        Some((index, event)) => Verdict::pass(
            CONTENT_PRESENCE,
            format!("found {expected:?} in event #{index} ({})", event.kind()),
        ),
        None => Verdict::fail(
            CONTENT_PRESENCE,
            format!(
                "expected output not found: {expected:?} (searched {} events)",
                events.len()
            ),
        ),
    }
}
