//! Timestamped loop events and the ordering invariant helpers

use crate::types::ShortMessage;

/// One recorded message with its position in the loop
///
/// `at` is seconds since loop start; `delta` is seconds since the previous
/// event in the same channel (0 for the first). A channel sequence is kept
/// non-decreasing in `at`, with every `delta` derived from the neighboring
/// `at` values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimedEvent {
    pub message: ShortMessage,
    pub delta: f64,
    pub at: f64,
}

impl TimedEvent {
    pub fn new(message: ShortMessage, at: f64) -> Self {
        Self {
            message,
            delta: 0.0,
            at,
        }
    }
}

/// Rewrite every `delta` from the `at` values (first event gets 0)
pub fn recompute_deltas(events: &mut [TimedEvent]) {
    let mut prev = 0.0;
    for (i, ev) in events.iter_mut().enumerate() {
        ev.delta = if i == 0 { 0.0 } else { (ev.at - prev).max(0.0) };
        prev = ev.at;
    }
}

/// Restore the channel invariant after a raw batch merge
///
/// The stable sort keeps capture order for events with identical timestamps,
/// and also absorbs non-monotonic timestamps from interleaved input/output
/// capture without surfacing an error.
pub fn sort_and_recompute(events: &mut [TimedEvent]) {
    events.sort_by(|a, b| a.at.total_cmp(&b.at));
    recompute_deltas(events);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ev(note: u8, at: f64) -> TimedEvent {
        TimedEvent::new(ShortMessage::note_on(0, note, 100), at)
    }

    #[test]
    fn test_sort_restores_monotonic_order() {
        let mut events = vec![ev(1, 0.5), ev(2, 0.1), ev(3, 0.3)];
        sort_and_recompute(&mut events);
        let times: Vec<f64> = events.iter().map(|e| e.at).collect();
        assert_eq!(times, vec![0.1, 0.3, 0.5]);
    }

    #[test]
    fn test_deltas_match_absolute_times() {
        let mut events = vec![ev(1, 0.2), ev(2, 0.9), ev(3, 1.0)];
        sort_and_recompute(&mut events);
        assert_eq!(events[0].delta, 0.0);
        assert!((events[1].delta - 0.7).abs() < 1e-12);
        assert!((events[2].delta - 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_equal_timestamps_keep_capture_order() {
        let mut events = vec![ev(1, 0.4), ev(2, 0.4), ev(3, 0.4)];
        sort_and_recompute(&mut events);
        let notes: Vec<u8> = events.iter().map(|e| e.message.data1()).collect();
        assert_eq!(notes, vec![1, 2, 3]);
        assert!(events.iter().all(|e| e.delta == 0.0 || e.at == 0.4));
    }
}
