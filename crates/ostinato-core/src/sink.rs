//! Event sinks: how the engine reports back to the control layer
//!
//! The engine and the note mapper call into an [`EventSink`] for key-matrix
//! visuals, tempo estimates, and transport changes. Implementations called
//! from the engine must be wait-free; [`QueueSink`] (a bounded channel that
//! drops on overflow) is the intended GUI-side implementation.

use std::sync::Arc;

use crate::types::Transport;

/// Capability set the engine needs from whichever layer is listening
///
/// All methods default to no-ops so implementors subscribe only to what
/// they care about.
pub trait EventSink: Send + Sync {
    /// A note-on/off was observed or emitted (input, playback, or mapping).
    /// `note` is the post-mapping note number.
    fn on_note_event(&self, _channel: u8, _note: u8, _velocity: u8, _on: bool) {}

    /// The beat-clock estimator locked onto a new tempo
    fn on_bpm_changed(&self, _bpm: u16) {}

    /// Transport or recording state changed (including auto-stopped takes)
    fn on_transport_changed(&self, _transport: Transport, _recording: bool) {}
}

/// Sink that ignores everything (headless use, tests)
pub struct NullSink;

impl EventSink for NullSink {}

/// One notification from the engine, as carried by [`QueueSink`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkEvent {
    Note {
        channel: u8,
        note: u8,
        velocity: u8,
        on: bool,
    },
    BpmChanged(u16),
    TransportChanged {
        transport: Transport,
        recording: bool,
    },
}

/// Channel-backed sink for GUIs
///
/// Sends never block: when the receiver falls behind, notifications are
/// dropped rather than stalling the audio thread.
pub struct QueueSink {
    tx: flume::Sender<SinkEvent>,
}

impl QueueSink {
    /// Create a sink and the receiver the control layer polls
    pub fn bounded(capacity: usize) -> (Arc<Self>, flume::Receiver<SinkEvent>) {
        let (tx, rx) = flume::bounded(capacity);
        (Arc::new(Self { tx }), rx)
    }
}

impl EventSink for QueueSink {
    fn on_note_event(&self, channel: u8, note: u8, velocity: u8, on: bool) {
        let _ = self.tx.try_send(SinkEvent::Note {
            channel,
            note,
            velocity,
            on,
        });
    }

    fn on_bpm_changed(&self, bpm: u16) {
        let _ = self.tx.try_send(SinkEvent::BpmChanged(bpm));
    }

    fn on_transport_changed(&self, transport: Transport, recording: bool) {
        let _ = self.tx.try_send(SinkEvent::TransportChanged {
            transport,
            recording,
        });
    }
}
