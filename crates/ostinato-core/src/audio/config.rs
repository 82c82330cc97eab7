//! Audio client configuration

use serde::{Deserialize, Serialize};

/// Settings for the audio-server client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Client name registered with the server
    pub client_name: String,
    /// Substring of a hardware MIDI output port to connect our input to
    /// (case-insensitive); None leaves routing to the user
    pub connect_input_from: Option<String>,
    /// Substring of a MIDI input port to connect our output to
    pub connect_output_to: Option<String>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            client_name: "ostinato".to_string(),
            connect_input_from: None,
            connect_output_to: None,
        }
    }
}
