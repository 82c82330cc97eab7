//! Mirror of engine output to an external sequencer port
//!
//! The engine mirrors every outgoing message into a second staging table;
//! this worker drains that table on a short cadence and writes it to a
//! midir output connection (ALSA sequencer on Linux). Send failures are
//! logged and skipped; the engine never notices the bridge at all.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use midir::{MidiOutput, MidiOutputConnection};
use thiserror::Error;

use ostinato_core::engine::OutboundStaging;

/// Drain cadence; bounds the extra latency of the mirrored stream
const BRIDGE_POLL: Duration = Duration::from_millis(2);

/// Errors while bringing the bridge up
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Failed to initialize MIDI output: {0}")]
    Init(String),

    #[error("No MIDI output port matching pattern: {0}")]
    PortNotFound(String),

    #[error("Failed to connect to MIDI port: {0}")]
    Connect(String),
}

/// Background worker owning the sequencer connection; joins on drop
pub struct SequencerBridge {
    shutdown: Option<flume::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl SequencerBridge {
    /// Connect to the first output port whose name contains `port_match`
    /// (case-insensitive) and start mirroring `staging` into it
    pub fn spawn(
        port_match: &str,
        staging: Arc<OutboundStaging>,
    ) -> Result<Self, BridgeError> {
        let pattern = port_match.to_lowercase();
        let midi_out =
            MidiOutput::new("ostinato-bridge").map_err(|e| BridgeError::Init(e.to_string()))?;

        let ports = midi_out.ports();
        let port = ports
            .iter()
            .find(|port| {
                midi_out
                    .port_name(port)
                    .map(|name| name.to_lowercase().contains(&pattern))
                    .unwrap_or(false)
            })
            .ok_or_else(|| BridgeError::PortNotFound(port_match.to_string()))?;
        let port_name = midi_out.port_name(port).unwrap_or_default();

        let connection = midi_out
            .connect(port, "ostinato-bridge-out")
            .map_err(|e| BridgeError::Connect(e.to_string()))?;
        log::info!("Bridge connected to {}", port_name);

        let (shutdown_tx, shutdown_rx) = flume::bounded::<()>(1);
        let thread = std::thread::Builder::new()
            .name("alsa-bridge".into())
            .spawn(move || run(shutdown_rx, connection, staging))
            .expect("Failed to spawn bridge thread");

        Ok(Self {
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        })
    }
}

fn run(
    shutdown: flume::Receiver<()>,
    mut connection: MidiOutputConnection,
    staging: Arc<OutboundStaging>,
) {
    log::info!("Sequencer bridge started");
    let mut cursor = 0usize;

    loop {
        match shutdown.recv_timeout(BRIDGE_POLL) {
            Err(flume::RecvTimeoutError::Timeout) => {
                while let Some(msg) = staging.drain_next(&mut cursor) {
                    if let Err(e) = connection.send(msg.as_bytes()) {
                        log::warn!("Bridge send failed: {}", e);
                    }
                }
            }
            // Shutdown signal or handle dropped
            _ => break,
        }
    }

    log::info!("Sequencer bridge shutting down");
}

impl Drop for SequencerBridge {
    fn drop(&mut self) {
        self.shutdown.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
