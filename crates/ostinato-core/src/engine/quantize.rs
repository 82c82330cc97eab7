//! One-beat edits at the loop edges
//!
//! Lets a player trim or pad silence at either end of the recorded material
//! without re-recording: head edits slide the whole timeline, tail edits
//! move only each channel's final event (which defines the loop length).
//! These run on the sorter thread; the engine republishes afterwards.

use crate::engine::event::recompute_deltas;
use crate::engine::store::LoopStore;
use crate::types::NUM_CHANNELS;

/// Which end of the loop an edit applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopEdge {
    Head,
    Tail,
}

/// Trim a beat of silence, or insert one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeOp {
    Clip,
    Clap,
}

/// Apply a one-beat edge edit across all 16 channels
///
/// `beat_secs` is `60 / current BPM`. Returns false and leaves the store
/// untouched when the edit would reorder or lose events:
/// - a tail clip may not move a channel's last event at or before its
///   second-to-last event (nor below zero for a single-event channel);
/// - a head clip may not move any event below zero. Events pinned at time
///   zero (the seeded bank/program pair) stay at zero.
pub fn shift_edge(store: &mut LoopStore, edge: LoopEdge, op: EdgeOp, beat_secs: f64) -> bool {
    if beat_secs <= 0.0 {
        return false;
    }
    match (edge, op) {
        (LoopEdge::Head, EdgeOp::Clip) => head_clip(store, beat_secs),
        (LoopEdge::Head, EdgeOp::Clap) => head_clap(store, beat_secs),
        (LoopEdge::Tail, EdgeOp::Clip) => tail_clip(store, beat_secs),
        (LoopEdge::Tail, EdgeOp::Clap) => tail_clap(store, beat_secs),
    }
}

fn head_clip(store: &mut LoopStore, beat: f64) -> bool {
    // Validate every channel before touching any of them
    for ch in 0..NUM_CHANNELS {
        if store
            .channel(ch)
            .iter()
            .any(|e| e.at > 0.0 && e.at < beat)
        {
            return false;
        }
    }
    for ch in 0..NUM_CHANNELS {
        if let Some(events) = store.channel_mut(ch) {
            for e in events.iter_mut() {
                if e.at > 0.0 {
                    e.at -= beat;
                }
            }
            recompute_deltas(events);
        }
    }
    true
}

fn head_clap(store: &mut LoopStore, beat: f64) -> bool {
    for ch in 0..NUM_CHANNELS {
        if let Some(events) = store.channel_mut(ch) {
            for e in events.iter_mut() {
                if e.at > 0.0 {
                    e.at += beat;
                }
            }
            recompute_deltas(events);
        }
    }
    true
}

fn tail_clip(store: &mut LoopStore, beat: f64) -> bool {
    for ch in 0..NUM_CHANNELS {
        let events = store.channel(ch);
        if let Some(last) = events.last() {
            let shifted = last.at - beat;
            let floor = if events.len() >= 2 {
                events[events.len() - 2].at
            } else {
                0.0
            };
            if shifted <= floor && events.len() >= 2 {
                return false;
            }
            if shifted < 0.0 {
                return false;
            }
        }
    }
    for ch in 0..NUM_CHANNELS {
        if let Some(events) = store.channel_mut(ch) {
            if let Some(last) = events.last_mut() {
                last.at -= beat;
            }
            recompute_deltas(events);
        }
    }
    true
}

fn tail_clap(store: &mut LoopStore, beat: f64) -> bool {
    for ch in 0..NUM_CHANNELS {
        if let Some(events) = store.channel_mut(ch) {
            if let Some(last) = events.last_mut() {
                last.at += beat;
                last.delta += beat;
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::event::{sort_and_recompute, TimedEvent};
    use crate::types::ShortMessage;

    fn channel_with(times: &[f64]) -> Vec<TimedEvent> {
        let mut events: Vec<TimedEvent> = times
            .iter()
            .map(|&at| TimedEvent::new(ShortMessage::note_on(0, 60, 100), at))
            .collect();
        sort_and_recompute(&mut events);
        events
    }

    #[test]
    fn test_tail_clip_shifts_last_event_back_one_beat() {
        let mut store = LoopStore::new();
        store.replace_channel(0, channel_with(&[0.0, 2.3, 3.0]));

        // Beat of 0.5s at 120 BPM: 3.0 - 0.5 = 2.5 > 2.3, accepted
        assert!(shift_edge(&mut store, LoopEdge::Tail, EdgeOp::Clip, 0.5));
        let events = store.channel(0);
        assert!((events[2].at - 2.5).abs() < 1e-12);
        assert!((events[2].delta - 0.2).abs() < 1e-12);
        assert_eq!(store.max_loop_time(), 2.5);
    }

    #[test]
    fn test_tail_clip_rejected_when_it_would_pass_previous_event() {
        let mut store = LoopStore::new();
        store.replace_channel(0, channel_with(&[0.0, 2.6, 3.0]));

        // 3.0 - 0.5 = 2.5 <= 2.6: rejected with no mutation
        assert!(!shift_edge(&mut store, LoopEdge::Tail, EdgeOp::Clip, 0.5));
        let events = store.channel(0);
        assert!((events[2].at - 3.0).abs() < 1e-12);
        assert!((events[1].at - 2.6).abs() < 1e-12);
    }

    #[test]
    fn test_tail_clap_extends_loop_by_one_beat() {
        let mut store = LoopStore::new();
        store.replace_channel(3, channel_with(&[0.0, 1.0]));
        assert!(shift_edge(&mut store, LoopEdge::Tail, EdgeOp::Clap, 0.5));
        assert!((store.channel_len_secs(3) - 1.5).abs() < 1e-12);
        assert!((store.channel(3)[1].delta - 1.5).abs() < 1e-12);
    }

    #[test]
    fn test_head_clip_slides_timeline_but_pins_time_zero() {
        let mut store = LoopStore::new();
        store.replace_channel(0, channel_with(&[0.0, 0.8, 2.0]));
        assert!(shift_edge(&mut store, LoopEdge::Head, EdgeOp::Clip, 0.5));
        let events = store.channel(0);
        assert_eq!(events[0].at, 0.0);
        assert!((events[1].at - 0.3).abs() < 1e-12);
        assert!((events[2].at - 1.5).abs() < 1e-12);
    }

    #[test]
    fn test_head_clip_rejected_when_an_event_would_go_negative() {
        let mut store = LoopStore::new();
        store.replace_channel(0, channel_with(&[0.0, 0.3, 2.0]));
        assert!(!shift_edge(&mut store, LoopEdge::Head, EdgeOp::Clip, 0.5));
        assert!((store.channel(0)[1].at - 0.3).abs() < 1e-12);
    }

    #[test]
    fn test_head_clap_adds_leading_silence() {
        let mut store = LoopStore::new();
        store.replace_channel(0, channel_with(&[0.0, 0.8]));
        assert!(shift_edge(&mut store, LoopEdge::Head, EdgeOp::Clap, 0.5));
        let events = store.channel(0);
        assert_eq!(events[0].at, 0.0);
        assert!((events[1].at - 1.3).abs() < 1e-12);
        assert!((events[1].delta - 1.3).abs() < 1e-12);
    }

    #[test]
    fn test_edit_applies_to_all_channels_or_none() {
        let mut store = LoopStore::new();
        store.replace_channel(0, channel_with(&[0.0, 2.3, 3.0]));
        store.replace_channel(5, channel_with(&[0.0, 1.9, 2.0]));

        // Channel 5 rejects (2.0 - 0.5 <= 1.9), so channel 0 must be
        // untouched as well
        assert!(!shift_edge(&mut store, LoopEdge::Tail, EdgeOp::Clip, 0.5));
        assert!((store.channel(0)[2].at - 3.0).abs() < 1e-12);
        assert!((store.channel(5)[2].at - 2.0).abs() < 1e-12);
    }
}
