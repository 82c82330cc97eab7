//! Real-time multi-channel MIDI loop recorder/player engine
//!
//! This crate provides:
//! - The [`engine::LoopEngine`] driven from the audio-server callback:
//!   per-cycle outbound draining, MIDI-through, recording capture, and
//!   synchronized multi-channel loop playback with tempo scaling
//! - The capture-sorter and note-mapper background threads
//! - Lock-free outbound staging shared between threads
//! - Beat-clock tempo estimation
//! - The JACK backend (Linux, `jack-backend` feature)
//! - YAML persistence for engine settings and the mapping table
//!
//! # Architecture
//!
//! ```text
//! input port → LoopEngine → {staging, NoteMapper, capture}
//!                  ▲                        │
//!                  └── sorted loops ── CaptureSorter
//! LoopEngine playback → staging drain → output port (+ ALSA mirror)
//! ```
//!
//! The audio thread never blocks and never allocates in steady state; all
//! cross-thread traffic is bounded queues, whole-buffer swaps, and relaxed
//! atomics.

pub mod audio;
pub mod config;
pub mod engine;
pub mod sink;
pub mod types;

pub use engine::{build_engine, EngineHandle, LoopEngine, LoopStore, NoteMap, TimedEvent};
pub use sink::{EventSink, NullSink, QueueSink, SinkEvent};
pub use types::{ShortMessage, Transport, NUM_CHANNELS};
