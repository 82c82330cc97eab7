//! The loop engine and its supporting subsystems
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  commands (rtrb)   ┌──────────────────────┐
//! │ EngineHandle │───────────────────►│  LoopEngine          │
//! │ (control)    │◄──atomics──────────│  (audio callback)    │
//! └──────┬───────┘                    └───┬─────────▲────────┘
//!        │ clear/edit/replace             │ batches │ sorted channels
//!        ▼                                ▼         │
//! ┌──────────────────┐   flume    ┌─────────────────┴────┐
//! │   NoteMapper     │            │   CaptureSorter      │
//! │ (mapping thread) │            │ (owns the LoopStore) │
//! └──────────────────┘            └──────────────────────┘
//! ```
//!
//! The audio thread owns all play state exclusively; the two background
//! threads communicate with it only through bounded queues and whole-buffer
//! swaps. The control layer reads state through [`EngineAtomics`] without
//! locking.

mod atomics;
mod capture;
mod clock;
mod command;
#[allow(clippy::module_inception)]
mod engine;
mod event;
mod mapper;
mod quantize;
mod staging;
mod store;

pub use atomics::{EngineAtomics, DEFAULT_BPM};
pub use capture::{SorterHandle, CAPTURE_SWAP_THRESHOLD};
pub use clock::{BeatClockEstimator, MAX_BPM, MIN_BPM};
pub use command::{command_channel, CommandSender, EngineCommand};
pub use engine::{InEvent, LoopEngine, MidiOut};
pub use event::{recompute_deltas, sort_and_recompute, TimedEvent};
pub use mapper::{MapTarget, NoteMap, NoteMapper};
pub use quantize::{EdgeOp, LoopEdge};
pub use staging::{OutboundStaging, STAGING_SLOTS};
pub use store::LoopStore;

use std::sync::Arc;

use crate::sink::EventSink;
use crate::types::Transport;

/// Assemble the engine and all supporting threads
///
/// Returns the [`LoopEngine`] (to be moved onto the audio thread) and the
/// [`EngineHandle`] the control layer keeps.
pub fn build_engine(sample_rate: u32, sink: Arc<dyn EventSink>) -> (LoopEngine, EngineHandle) {
    let atomics = Arc::new(EngineAtomics::new());
    let out_staging = Arc::new(OutboundStaging::new());
    let bridge_staging = Arc::new(OutboundStaging::new());

    let (command_tx, command_rx) = command_channel();
    let (sorter, wiring) = capture::spawn_capture_sorter();
    let (mapper, mapper_tx) = mapper::spawn_note_mapper(out_staging.clone(), sink.clone());

    let engine = LoopEngine::new(
        sample_rate,
        atomics.clone(),
        sink,
        out_staging.clone(),
        bridge_staging.clone(),
        command_rx,
        wiring,
        mapper_tx,
    );
    let handle = EngineHandle {
        atomics,
        commands: command_tx,
        sorter,
        mapper,
        out_staging,
        bridge_staging,
    };
    (engine, handle)
}

/// Control-layer surface of the engine
///
/// All methods are safe to call from any non-real-time thread; none of them
/// can stall the audio callback.
pub struct EngineHandle {
    atomics: Arc<EngineAtomics>,
    commands: CommandSender,
    sorter: SorterHandle,
    mapper: NoteMapper,
    out_staging: Arc<OutboundStaging>,
    bridge_staging: Arc<OutboundStaging>,
}

impl EngineHandle {
    fn command(&mut self, cmd: EngineCommand) {
        if self.commands.send(cmd).is_err() {
            log::warn!("Engine command queue full; command dropped");
        }
    }

    // ─────────────────────────────────────────────────────────────
    // Transport and recording
    // ─────────────────────────────────────────────────────────────

    pub fn record_start(&mut self, channel: u8) {
        self.command(EngineCommand::RecordStart { channel });
    }

    pub fn record_stop(&mut self) {
        self.command(EngineCommand::RecordStop);
    }

    pub fn play(&mut self) {
        self.command(EngineCommand::Play);
    }

    pub fn pause(&mut self) {
        self.command(EngineCommand::Pause);
    }

    pub fn stop(&mut self) {
        self.command(EngineCommand::Stop);
    }

    pub fn set_program(&mut self, channel: u8, bank: u8, program: u8) {
        self.command(EngineCommand::SetProgram {
            channel,
            bank,
            program,
        });
    }

    pub fn all_notes_off(&mut self) {
        self.command(EngineCommand::AllNotesOff);
    }

    pub fn transport(&self) -> Transport {
        self.atomics.transport()
    }

    pub fn is_recording(&self) -> bool {
        self.atomics.is_recording()
    }

    // ─────────────────────────────────────────────────────────────
    // Flags and tempo
    // ─────────────────────────────────────────────────────────────

    pub fn set_freewheel(&self, on: bool) {
        self.atomics.set_freewheel(on);
    }

    pub fn set_muted(&self, channel: u8, muted: bool) {
        self.atomics.set_muted(channel, muted);
    }

    pub fn set_midi_through(&self, on: bool) {
        self.atomics.set_midi_through(on);
    }

    pub fn set_bpm(&self, bpm: f64) {
        self.atomics.set_bpm(bpm);
    }

    pub fn bpm(&self) -> f64 {
        self.atomics.bpm()
    }

    pub fn set_channel_ratio(&self, channel: u8, ratio: f64) {
        self.atomics.set_channel_ratio(channel, ratio);
    }

    /// Last tempo reported by the beat-clock estimator
    pub fn clock_bpm(&self) -> Option<u16> {
        self.atomics.clock_bpm()
    }

    // ─────────────────────────────────────────────────────────────
    // Key matrix
    // ─────────────────────────────────────────────────────────────

    pub fn is_sounding(&self, channel: u8, note: u8) -> bool {
        self.atomics.is_sounding(channel, note)
    }

    pub fn any_sounding(&self, channel: u8) -> bool {
        self.atomics.any_sounding(channel)
    }

    // ─────────────────────────────────────────────────────────────
    // Mapping
    // ─────────────────────────────────────────────────────────────

    /// Swap in a mapping table; takes effect for events routed afterwards
    pub fn set_mapping(&self, table: NoteMap) {
        self.mapper.set_table(table);
    }

    /// Route note input through the mapping table (true) or directly (false)
    pub fn engage_mapping(&self, on: bool) {
        self.atomics.set_mapper_engaged(on);
    }

    // ─────────────────────────────────────────────────────────────
    // Loop contents
    // ─────────────────────────────────────────────────────────────

    pub fn clear_channel(&self, channel: u8) {
        self.sorter.clear_channel(channel);
    }

    pub fn clear_all(&self) {
        self.sorter.clear_all();
    }

    /// One-beat edit at a loop edge, using the current tempo's beat length.
    /// Intended for a stopped transport; applying it mid-playback causes an
    /// audible discontinuity.
    pub fn edge_edit(&self, edge: LoopEdge, op: EdgeOp) {
        let bpm = self.atomics.bpm();
        if bpm > 0.0 {
            self.sorter.quantize(edge, op, 60.0 / bpm);
        }
    }

    /// Clone the recorded loops (for saving)
    pub fn snapshot(&self) -> anyhow::Result<LoopStore> {
        self.sorter.snapshot()
    }

    /// Replace all loops (file import); `recorded_bpm` is the tempo the
    /// material plays back 1:1 at
    pub fn replace_loops(&self, store: LoopStore, recorded_bpm: f64) {
        self.atomics.set_recorded_bpm(recorded_bpm);
        self.sorter.replace_all(store);
    }

    // ─────────────────────────────────────────────────────────────
    // Plumbing
    // ─────────────────────────────────────────────────────────────

    /// Shared atomic state, for layers that want direct reads
    pub fn atomics(&self) -> Arc<EngineAtomics> {
        self.atomics.clone()
    }

    /// Staging table mirrored to the ALSA bridge worker
    pub fn bridge_staging(&self) -> Arc<OutboundStaging> {
        self.bridge_staging.clone()
    }

    /// Requests dropped because the outbound staging table was full
    pub fn staging_dropped(&self) -> u64 {
        self.out_staging.dropped()
    }
}
