//! Per-channel storage of recorded loops
//!
//! The authoritative store lives on the capture-sorter thread, which is the
//! only mutator once recording hands a batch off. The audio thread plays
//! from whole-channel copies published through a lock-free update queue.

use crate::engine::event::TimedEvent;
use crate::types::NUM_CHANNELS;

/// 16 independent ordered event sequences, one per MIDI channel
#[derive(Debug, Clone, Default)]
pub struct LoopStore {
    channels: [Vec<TimedEvent>; NUM_CHANNELS],
}

impl LoopStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Events of one channel; empty slice for an out-of-range index
    pub fn channel(&self, channel: usize) -> &[TimedEvent] {
        self.channels
            .get(channel)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub(crate) fn channel_mut(&mut self, channel: usize) -> Option<&mut Vec<TimedEvent>> {
        self.channels.get_mut(channel)
    }

    /// Replace a channel wholesale, returning the previous contents
    pub fn replace_channel(&mut self, channel: usize, events: Vec<TimedEvent>) -> Vec<TimedEvent> {
        match self.channels.get_mut(channel) {
            Some(slot) => std::mem::replace(slot, events),
            None => events,
        }
    }

    /// Drop a channel's loop, returning what was there
    pub fn clear_channel(&mut self, channel: usize) -> Vec<TimedEvent> {
        self.replace_channel(channel, Vec::new())
    }

    pub fn is_channel_empty(&self, channel: usize) -> bool {
        self.channel(channel).is_empty()
    }

    /// Number of channels holding at least one event
    pub fn non_empty_channels(&self) -> usize {
        self.channels.iter().filter(|c| !c.is_empty()).count()
    }

    /// Duration of one channel's loop: its last event's absolute time
    pub fn channel_len_secs(&self, channel: usize) -> f64 {
        self.channel(channel).last().map(|e| e.at).unwrap_or(0.0)
    }

    /// Master loop length: the longest loop across all channels
    ///
    /// Defines the synchronized wrap point; 0.0 when nothing is recorded.
    pub fn max_loop_time(&self) -> f64 {
        (0..NUM_CHANNELS)
            .map(|ch| self.channel_len_secs(ch))
            .fold(0.0, f64::max)
    }

    /// Total event count across all channels
    pub fn total_events(&self) -> usize {
        self.channels.iter().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ShortMessage;

    fn ev(at: f64) -> TimedEvent {
        TimedEvent::new(ShortMessage::note_on(0, 60, 100), at)
    }

    #[test]
    fn test_max_loop_time_tracks_longest_channel() {
        let mut store = LoopStore::new();
        assert_eq!(store.max_loop_time(), 0.0);

        store.replace_channel(2, vec![ev(0.0), ev(1.5)]);
        store.replace_channel(9, vec![ev(0.0), ev(4.0)]);
        assert_eq!(store.max_loop_time(), 4.0);
        assert_eq!(store.channel_len_secs(2), 1.5);
        assert_eq!(store.non_empty_channels(), 2);
    }

    #[test]
    fn test_clear_returns_old_contents() {
        let mut store = LoopStore::new();
        store.replace_channel(0, vec![ev(0.0), ev(1.0)]);
        let old = store.clear_channel(0);
        assert_eq!(old.len(), 2);
        assert!(store.is_channel_empty(0));
    }

    #[test]
    fn test_out_of_range_channel_is_harmless() {
        let mut store = LoopStore::new();
        assert!(store.channel(99).is_empty());
        let back = store.replace_channel(99, vec![ev(0.0)]);
        assert_eq!(back.len(), 1);
    }
}
