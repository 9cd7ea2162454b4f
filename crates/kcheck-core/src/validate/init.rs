//! Initialization bound: a kernel initializes at most once per session.

use super::{INIT_BOUND, Verdict};
use crate::event::Event;

/// Session-scoped count of initialization phrase occurrences.
///
/// Owned by the session and threaded through every turn's evaluation, so the
/// bound holds across turns rather than within one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InitTracker {
    count: usize,
}

impl InitTracker {
    pub fn count(&self) -> usize {
        self.count
    }

    /// Add the occurrences of `phrase` in `events`; returns how many were added.
    pub fn observe(&mut self, events: &[Event], phrase: &str) -> usize {
        if phrase.is_empty() {
            return 0;
        }
        let added: usize = events
            .iter()
            .flat_map(Event::output_text)
            .map(|text| text.matches(phrase).count())
            .sum();
        self.count += added;
        added
    }
}

/// Count `phrase` in this turn, then fail if the session total exceeds one.
pub fn init_bound(events: &[Event], phrase: &str, tracker: &mut InitTracker) -> Verdict {
    let added = tracker.observe(events, phrase);
    let total = tracker.count();
    if total <= 1 {
        Verdict::pass(
            INIT_BOUND,
            format!("{phrase:?} seen {total} time(s) this session"),
        )
    } else {
        Verdict::fail(
            INIT_BOUND,
            format!(
                "kernel re-initialized: {phrase:?} seen {total} times this session ({added} in this turn)"
            ),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::LineSource;

    const PHRASE: &str = "SAS initialization";

    fn raw(text: &str) -> Event {
        Event::RawLine {
            source: LineSource::Stdout,
            text: text.into(),
        }
    }

    #[test]
    fn single_initialization_passes_every_turn() {
        let mut tracker = InitTracker::default();
        assert!(init_bound(&[raw("NOTE: SAS initialization used:")], PHRASE, &mut tracker).passed);
        assert!(init_bound(&[raw("hello world")], PHRASE, &mut tracker).passed);
        assert_eq!(tracker.count(), 1);
    }

    #[test]
    fn second_initialization_fails_with_count() {
        let mut tracker = InitTracker::default();
        assert!(init_bound(&[raw("SAS initialization used")], PHRASE, &mut tracker).passed);
        let verdict = init_bound(&[raw("SAS initialization used")], PHRASE, &mut tracker);
        assert!(!verdict.passed);
        assert!(verdict.detail.contains("2 times"), "{}", verdict.detail);
        assert!(verdict.detail.contains("1 in this turn"), "{}", verdict.detail);
    }

    #[test]
    fn occurrences_counted_not_events() {
        let mut tracker = InitTracker::default();
        let added = tracker.observe(
            &[raw("SAS initialization ... SAS initialization")],
            PHRASE,
        );
        assert_eq!(added, 2);
        assert!(!init_bound(&[], PHRASE, &mut tracker).passed);
    }

    #[test]
    fn zero_occurrences_pass() {
        let mut tracker = InitTracker::default();
        let verdict = init_bound(&[raw("nothing")], PHRASE, &mut tracker);
        assert!(verdict.passed);
        assert!(verdict.detail.contains("0 time(s)"));
    }
}
