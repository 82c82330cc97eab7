//! Audio-server backend
//!
//! The engine runs inside a JACK process callback (Linux, default
//! `jack-backend` feature; PipeWire's JACK compatibility layer works too).
//! Without the backend the engine library still builds everywhere for
//! headless and test use; only [`start_midi_system`] is platform-gated.

mod config;
mod error;

#[cfg(all(target_os = "linux", feature = "jack-backend"))]
mod jack_backend;

pub use config::AudioConfig;
pub use error::{AudioError, AudioResult};

#[cfg(all(target_os = "linux", feature = "jack-backend"))]
pub use jack_backend::{
    list_midi_ports, start_midi_system, JackMidiHandle, MidiSystemResult,
};
