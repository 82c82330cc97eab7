//! Native JACK MIDI backend
//!
//! Registers one MIDI input and one MIDI output port and drives the
//! [`LoopEngine`] from the server's process callback. The engine is owned
//! exclusively by the callback; the control layer talks to it only through
//! the handle returned from [`start_midi_system`].
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐                     ┌─────────────────────┐
//! │  Control thread  │───commands─────────►│  JACK RT thread     │
//! │  (EngineHandle)  │◄──atomics───────────│  (owns LoopEngine)  │
//! └──────────────────┘                     └─────────────────────┘
//! ```
//!
//! Server shutdown is fatal to the engine: it is propagated to the control
//! layer through the quit channel and never retried.

use std::sync::Arc;

use jack::{Client, ClientOptions, Control, MidiIn, MidiOut as JackMidiOutSpec, Port, ProcessScope};

use super::config::AudioConfig;
use super::error::{AudioError, AudioResult};
use crate::engine::{build_engine, EngineHandle, InEvent, LoopEngine, MidiOut};
use crate::sink::EventSink;
use crate::types::ShortMessage;

/// JACK port names
const MIDI_IN: &str = "midi_in";
const MIDI_OUT: &str = "midi_out";

/// Handle keeping the JACK client alive; drop it to disconnect
pub struct JackMidiHandle {
    _async_client: jack::AsyncClient<JackNotifications, JackProcessor>,
    sample_rate: u32,
    buffer_size: u32,
}

impl JackMidiHandle {
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn buffer_size(&self) -> u32 {
        self.buffer_size
    }

    /// One-way latency of a full cycle in milliseconds
    pub fn latency_ms(&self) -> f32 {
        (self.buffer_size as f32 / self.sample_rate as f32) * 1000.0
    }
}

/// Everything the control layer needs after startup
pub struct MidiSystemResult {
    /// Actual client name (the server may rename on clashes)
    pub client_name: String,
    /// Keeps the client running
    pub handle: JackMidiHandle,
    /// Engine control surface
    pub engine: EngineHandle,
    /// Fires once when the server shuts the client down (fatal)
    pub quit_rx: flume::Receiver<()>,
    pub sample_rate: u32,
    pub buffer_size: u32,
}

/// Adapts the engine's output onto the cycle's MIDI writer
struct WriterOut<'a> {
    writer: jack::MidiWriter<'a>,
}

impl MidiOut for WriterOut<'_> {
    fn write(&mut self, frame: u32, message: &[u8]) {
        // A full port buffer drops the message; there is nothing real-time
        // safe left to do about it here
        let _ = self.writer.write(&jack::RawMidi {
            time: frame,
            bytes: message,
        });
    }
}

/// JACK process handler; owns the engine exclusively
struct JackProcessor {
    midi_in: Port<MidiIn>,
    midi_out: Port<JackMidiOutSpec>,
    engine: LoopEngine,
}

impl jack::ProcessHandler for JackProcessor {
    fn process(&mut self, _client: &Client, ps: &ProcessScope) -> Control {
        let events = self.midi_in.iter(ps).filter_map(|raw| {
            // Sysex and malformed data never enter the engine
            ShortMessage::new(raw.bytes).map(|message| InEvent {
                frame: raw.time,
                message,
            })
        });
        let mut out = WriterOut {
            writer: self.midi_out.writer(ps),
        };
        self.engine.run_cycle(ps.n_frames(), events, &mut out);
        Control::Continue
    }
}

/// JACK notification handler
struct JackNotifications {
    quit_tx: flume::Sender<()>,
}

impl jack::NotificationHandler for JackNotifications {
    fn sample_rate(&mut self, _client: &Client, srate: jack::Frames) -> Control {
        log::info!("JACK sample rate changed to: {}", srate);
        Control::Continue
    }

    fn xrun(&mut self, _client: &Client) -> Control {
        log::warn!("JACK xrun detected");
        Control::Continue
    }

    unsafe fn shutdown(&mut self, _status: jack::ClientStatus, reason: &str) {
        log::error!("JACK server shut us down: {}", reason);
        let _ = self.quit_tx.try_send(());
    }
}

/// Start the JACK MIDI system
///
/// Creates the client, wires up the engine and its worker threads, and
/// starts processing. Auto-connects ports when the config names patterns.
pub fn start_midi_system(
    config: &AudioConfig,
    sink: Arc<dyn EventSink>,
) -> AudioResult<MidiSystemResult> {
    let (client, _status) = Client::new(&config.client_name, ClientOptions::NO_START_SERVER)
        .map_err(|e| AudioError::ClientCreate(e.to_string()))?;
    let actual_client_name = client.name().to_string();

    let sample_rate = client.sample_rate() as u32;
    let buffer_size = client.buffer_size();

    log::info!(
        "JACK client '{}' created (sample rate: {}Hz, buffer: {} frames, cycle: {:.1}ms)",
        actual_client_name,
        sample_rate,
        buffer_size,
        (buffer_size as f32 / sample_rate as f32) * 1000.0
    );

    let midi_in = client
        .register_port(MIDI_IN, MidiIn::default())
        .map_err(|e| AudioError::PortRegister(MIDI_IN.into(), e.to_string()))?;
    let midi_out = client
        .register_port(MIDI_OUT, JackMidiOutSpec::default())
        .map_err(|e| AudioError::PortRegister(MIDI_OUT.into(), e.to_string()))?;

    let (engine, handle) = build_engine(sample_rate, sink);
    let (quit_tx, quit_rx) = flume::bounded(1);

    let processor = JackProcessor {
        midi_in,
        midi_out,
        engine,
    };

    let async_client = client
        .activate_async(JackNotifications { quit_tx }, processor)
        .map_err(|e| AudioError::Activate(e.to_string()))?;

    log::info!("JACK client activated");

    if let Err(e) = auto_connect(&actual_client_name, config) {
        log::warn!("Auto-connect failed: {}", e);
    }

    Ok(MidiSystemResult {
        client_name: actual_client_name,
        handle: JackMidiHandle {
            _async_client: async_client,
            sample_rate,
            buffer_size,
        },
        engine: handle,
        quit_rx,
        sample_rate,
        buffer_size,
    })
}

/// List MIDI ports visible on the server, filtered by flags
pub fn list_midi_ports(flags: jack::PortFlags) -> Vec<String> {
    let (client, _) = match Client::new("ostinato_port_query", ClientOptions::NO_START_SERVER) {
        Ok(c) => c,
        Err(e) => {
            log::debug!("Could not connect to JACK to enumerate ports: {}", e);
            return vec![];
        }
    };
    client.ports(None, Some("midi"), flags)
}

/// Connect our ports to peers matching the configured patterns
fn auto_connect(client_name: &str, config: &AudioConfig) -> AudioResult<()> {
    if config.connect_input_from.is_none() && config.connect_output_to.is_none() {
        return Ok(());
    }

    let (client, _) = Client::new(
        &format!("{}_connect", client_name),
        ClientOptions::NO_START_SERVER,
    )
    .map_err(|e| AudioError::ClientCreate(e.to_string()))?;

    if let Some(pattern) = &config.connect_input_from {
        let needle = pattern.to_lowercase();
        let sources = client.ports(None, Some("midi"), jack::PortFlags::IS_OUTPUT);
        match sources.iter().find(|p| p.to_lowercase().contains(&needle)) {
            Some(source) => {
                let our_in = format!("{}:{}", client_name, MIDI_IN);
                client
                    .connect_ports_by_name(source, &our_in)
                    .map_err(|e| AudioError::Connect(e.to_string()))?;
                log::info!("Connected input from {}", source);
            }
            None => log::warn!("No MIDI source port matching '{}'", pattern),
        }
    }

    if let Some(pattern) = &config.connect_output_to {
        let needle = pattern.to_lowercase();
        let sinks = client.ports(None, Some("midi"), jack::PortFlags::IS_INPUT);
        match sinks.iter().find(|p| p.to_lowercase().contains(&needle)) {
            Some(dest) => {
                let our_out = format!("{}:{}", client_name, MIDI_OUT);
                client
                    .connect_ports_by_name(&our_out, dest)
                    .map_err(|e| AudioError::Connect(e.to_string()))?;
                log::info!("Connected output to {}", dest);
            }
            None => log::warn!("No MIDI sink port matching '{}'", pattern),
        }
    }

    Ok(())
}
