//! MIDI boundary for the ostinato loop engine
//!
//! This crate provides:
//! - Standard MIDI file import/export of recorded loops via midly
//! - The ALSA-sequencer bridge worker mirroring engine output via midir
//!
//! Byte-level SMF parsing and sequencer port management are delegated to
//! those libraries; this crate only maps between their event shapes and the
//! engine's [`ostinato_core::TimedEvent`] form.

mod bridge;
mod file;

pub use bridge::{BridgeError, SequencerBridge};
pub use file::{
    load_loops, loops_from_bytes, loops_to_bytes, loops_to_smf, save_loops, FileError,
};
