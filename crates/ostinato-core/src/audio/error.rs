//! Audio backend error types

use thiserror::Error;

/// Errors that can occur while bringing up or driving the audio server client
#[derive(Error, Debug)]
pub enum AudioError {
    /// Could not create the client (server not running, name clash)
    #[error("Failed to create JACK client: {0}")]
    ClientCreate(String),

    /// Could not register a MIDI port
    #[error("Failed to register port '{0}': {1}")]
    PortRegister(String, String),

    /// Could not activate the client
    #[error("Failed to activate JACK client: {0}")]
    Activate(String),

    /// Port connection failed
    #[error("Failed to connect ports: {0}")]
    Connect(String),

    /// The backend is not compiled in on this platform
    #[error("No audio backend available on this platform")]
    NoBackend,
}

/// Result type for audio operations
pub type AudioResult<T> = Result<T, AudioError>;
