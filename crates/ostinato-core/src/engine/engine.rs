//! The real-time loop engine
//!
//! Runs inside the audio-server callback and owns everything it touches per
//! cycle: the published play sequences, per-channel cursors, capture
//! buffers, and the drain cursor of the outbound staging table. Control
//! traffic arrives through the lock-free command queue; sorted loop data
//! arrives through the update ring; retired buffers leave through the trash
//! ring. Nothing here blocks, and the steady-state path never allocates.

use std::sync::Arc;

use crate::engine::atomics::EngineAtomics;
use crate::engine::capture::{CaptureWiring, SorterMsg, CAPTURE_SWAP_THRESHOLD};
use crate::engine::clock::BeatClockEstimator;
use crate::engine::command::EngineCommand;
use crate::engine::event::TimedEvent;
use crate::engine::mapper::MapperMsg;
use crate::engine::staging::OutboundStaging;
use crate::sink::EventSink;
use crate::types::{
    ShortMessage, Transport, CC_ALL_NOTES_OFF, CC_BANK_SELECT, NUM_CHANNELS,
    STATUS_CONTROL_CHANGE, STATUS_PROGRAM_CHANGE, TIMING_CLOCK,
};

/// Where cycle output goes
///
/// The JACK backend adapts this onto its MIDI writer; tests collect into
/// memory. Implementations must be wait-free.
pub trait MidiOut {
    /// Reserve the message at a frame offset within the current cycle
    fn write(&mut self, frame: u32, message: &[u8]);
}

/// One input event with its frame offset within the cycle
#[derive(Debug, Clone, Copy)]
pub struct InEvent {
    pub frame: u32,
    pub message: ShortMessage,
}

/// Published play state of one channel
struct PlayChannel {
    /// Sorted events, swapped in wholesale from the sorter
    events: Vec<TimedEvent>,
    /// Index of the next event to fire
    pos: usize,
    /// Reference point the next event's delta is measured from
    segment_start: f64,
    /// When the current pass over this loop began
    loop_start: f64,
}

impl PlayChannel {
    fn new() -> Self {
        Self {
            events: Vec::new(),
            pos: 0,
            segment_start: 0.0,
            loop_start: 0.0,
        }
    }

    /// Loop length in (unscaled) seconds
    fn len_secs(&self) -> f64 {
        self.events.last().map(|e| e.at).unwrap_or(0.0)
    }
}

/// The callback-driven core of the loop recorder/player
pub struct LoopEngine {
    sample_rate: f64,
    atomics: Arc<EngineAtomics>,
    sink: Arc<dyn EventSink>,

    out_staging: Arc<OutboundStaging>,
    bridge_staging: Arc<OutboundStaging>,
    drain_cursor: usize,

    commands: rtrb::Consumer<EngineCommand>,
    wiring: CaptureWiring,
    mapper_tx: flume::Sender<MapperMsg>,

    channels: [PlayChannel; NUM_CHANNELS],
    /// Round-robin start for the per-frame playback scan
    scan_from: usize,
    /// Channel holding the longest loop (the only one allowed to wrap in
    /// synchronized mode)
    master_channel: Option<usize>,

    now_frames: u64,
    clock: BeatClockEstimator,

    /// Actively written capture buffer (one of the sorter's pool)
    capture: Vec<TimedEvent>,
    capture_overflow: u64,
    record_start: f64,
    last_capture_at: f64,
    take_seeded: bool,
    open_notes: i32,

    bank: [u8; NUM_CHANNELS],
    program: [u8; NUM_CHANNELS],

    pause_started: f64,
}

impl LoopEngine {
    pub(crate) fn new(
        sample_rate: u32,
        atomics: Arc<EngineAtomics>,
        sink: Arc<dyn EventSink>,
        out_staging: Arc<OutboundStaging>,
        bridge_staging: Arc<OutboundStaging>,
        commands: rtrb::Consumer<EngineCommand>,
        mut wiring: CaptureWiring,
        mapper_tx: flume::Sender<MapperMsg>,
    ) -> Self {
        let capture = wiring
            .spares
            .pop()
            .unwrap_or_else(|_| Vec::with_capacity(crate::engine::capture::CAPTURE_BUFFER_CAPACITY));
        Self {
            sample_rate: sample_rate as f64,
            atomics,
            sink,
            out_staging,
            bridge_staging,
            drain_cursor: 0,
            commands,
            wiring,
            mapper_tx,
            channels: std::array::from_fn(|_| PlayChannel::new()),
            scan_from: 0,
            master_channel: None,
            now_frames: 0,
            clock: BeatClockEstimator::new(),
            capture,
            capture_overflow: 0,
            record_start: 0.0,
            last_capture_at: 0.0,
            take_seeded: false,
            open_notes: 0,
            bank: [0; NUM_CHANNELS],
            program: [0; NUM_CHANNELS],
            pause_started: 0.0,
        }
    }

    /// Run one audio-server cycle
    ///
    /// `input` must be sorted by frame offset (the server guarantees this).
    pub fn run_cycle<I>(&mut self, nframes: u32, input: I, out: &mut dyn MidiOut)
    where
        I: IntoIterator<Item = InEvent>,
    {
        self.process_commands();
        self.apply_loop_updates();

        let mut input = input.into_iter().peekable();
        for frame in 0..nframes {
            while input.peek().is_some_and(|e| e.frame <= frame) {
                if let Some(ev) = input.next() {
                    self.process_midi_in(ev.message, frame, out);
                }
            }
            self.frame_step(frame, out);
        }
        // Anything timestamped past the cycle end lands on the final frame
        let last = nframes.saturating_sub(1);
        for ev in input {
            self.process_midi_in(ev.message, last, out);
        }

        self.end_cycle_bookkeeping(nframes);
        self.now_frames += u64::from(nframes);
    }

    /// Events dropped because capture outran the buffer pool
    pub fn capture_overflow(&self) -> u64 {
        self.capture_overflow
    }

    fn frame_secs(&self, frame: u32) -> f64 {
        (self.now_frames + u64::from(frame)) as f64 / self.sample_rate
    }

    // ─────────────────────────────────────────────────────────────
    // Per-frame dispatch
    // ─────────────────────────────────────────────────────────────

    /// One frame slot: drain a staged outbound message, else advance one
    /// playback cursor
    fn frame_step(&mut self, frame: u32, out: &mut dyn MidiOut) {
        if let Some(msg) = self.out_staging.drain_next(&mut self.drain_cursor) {
            out.write(frame, msg.as_bytes());
            self.bridge_staging.try_enqueue(msg);
            self.track_note(&msg);
            if self.atomics.is_recording() {
                self.capture_event(msg, frame);
            }
            return;
        }
        if self.atomics.transport() == Transport::Playing {
            self.playback_step(frame, out);
        }
    }

    /// Advance at most one due channel's cursor and emit its event
    fn playback_step(&mut self, frame: u32, out: &mut dyn MidiOut) {
        let now = self.frame_secs(frame);
        let freewheel = self.atomics.freewheel();
        let recording = self.atomics.is_recording();
        let record_channel = self.atomics.record_channel() as usize;

        for k in 0..NUM_CHANNELS {
            let ch = (self.scan_from + k) % NUM_CHANNELS;
            // No self-feedback into the channel being recorded
            if recording && ch == record_channel {
                continue;
            }
            if self.channels[ch].events.is_empty() {
                continue;
            }
            let ratio = self.effective_ratio(ch as u8);
            if ratio <= 0.0 {
                continue;
            }

            if self.channels[ch].pos >= self.channels[ch].events.len() {
                let len = self.channels[ch].len_secs();
                if len <= 0.0 {
                    continue;
                }
                if freewheel {
                    if now - self.channels[ch].loop_start >= len * ratio {
                        let pc = &mut self.channels[ch];
                        pc.loop_start += len * ratio;
                        pc.segment_start = pc.loop_start;
                        pc.pos = 0;
                    }
                } else if Some(ch) == self.master_channel
                    && now - self.channels[ch].loop_start >= len * ratio
                {
                    // Hard quantization: only the longest loop wraps, and it
                    // resets everyone
                    let wrap = self.channels[ch].loop_start + len * ratio;
                    self.resync_all(wrap);
                }
                continue;
            }

            let ev = self.channels[ch].events[self.channels[ch].pos];
            if now - self.channels[ch].segment_start < ev.delta * ratio {
                continue;
            }

            {
                let pc = &mut self.channels[ch];
                pc.segment_start += ev.delta * ratio;
                pc.pos += 1;
            }
            self.scan_from = (ch + 1) % NUM_CHANNELS;

            let msg = ev.message;
            if msg.is_note_on() && self.atomics.is_muted(ch as u8) {
                // Mute suppresses note-ons only; note-offs always pass so a
                // mute flipped mid-note cannot hang it
                return;
            }
            out.write(frame, msg.as_bytes());
            self.bridge_staging.try_enqueue(msg);
            if msg.is_note() {
                self.track_note(&msg);
                self.sink.on_note_event(
                    msg.channel(),
                    msg.data1(),
                    msg.data2(),
                    msg.is_note_on(),
                );
            }
            return;
        }
    }

    /// Reset every channel to the top of its loop at `time`
    fn resync_all(&mut self, time: f64) {
        for pc in &mut self.channels {
            pc.pos = 0;
            pc.loop_start = time;
            pc.segment_start = time;
        }
    }

    fn effective_ratio(&self, channel: u8) -> f64 {
        let bpm = self.atomics.bpm();
        let recorded = self.atomics.recorded_bpm();
        let base = if bpm > 0.0 { recorded / bpm } else { 1.0 };
        base * self.atomics.channel_ratio(channel)
    }

    // ─────────────────────────────────────────────────────────────
    // Input processing
    // ─────────────────────────────────────────────────────────────

    fn process_midi_in(&mut self, msg: ShortMessage, frame: u32, out: &mut dyn MidiOut) {
        if msg.as_bytes()[0] == TIMING_CLOCK {
            let t = self.frame_secs(frame);
            if let Some(bpm) = self.clock.observe(t) {
                self.atomics.set_clock_bpm(bpm);
                self.sink.on_bpm_changed(bpm);
            }
            return;
        }
        if !msg.is_channel_voice() {
            return;
        }

        let is_note = msg.is_note();
        if is_note {
            // Key-matrix feedback for the played key, whatever the routing
            self.sink
                .on_note_event(msg.channel(), msg.data1(), msg.data2(), msg.is_note_on());
        }

        // Shadow bank/program selections passing through so take seeding
        // reproduces the active instrument
        match msg.status() {
            STATUS_CONTROL_CHANGE if msg.data1() == CC_BANK_SELECT => {
                self.bank[msg.channel() as usize] = msg.data2();
            }
            STATUS_PROGRAM_CHANGE => {
                self.program[msg.channel() as usize] = msg.data1();
            }
            _ => {}
        }

        if is_note && self.atomics.mapper_engaged() {
            let _ = self.mapper_tx.try_send(MapperMsg::Event(msg));
            return;
        }

        if self.atomics.midi_through() {
            out.write(frame, msg.as_bytes());
            self.bridge_staging.try_enqueue(msg);
            self.track_note(&msg);
            if self.atomics.is_recording() {
                self.capture_event(msg, frame);
            }
        }
    }

    fn track_note(&mut self, msg: &ShortMessage) {
        if msg.is_note_on() {
            self.atomics.note_sounding(msg.channel(), msg.data1(), true);
        } else if msg.is_note_off() {
            self.atomics.note_sounding(msg.channel(), msg.data1(), false);
        }
    }

    // ─────────────────────────────────────────────────────────────
    // Recording
    // ─────────────────────────────────────────────────────────────

    fn capture_event(&mut self, msg: ShortMessage, frame: u32) {
        if !msg.is_channel_voice() {
            return;
        }
        let t = self.frame_secs(frame);
        if !self.take_seeded {
            // First captured event of the take: seed the loop with the
            // active bank/program so reloading it reproduces the instrument
            self.take_seeded = true;
            let ch = self.atomics.record_channel();
            let bank = self.bank[ch as usize];
            let program = self.program[ch as usize];
            self.push_capture(TimedEvent::new(
                ShortMessage::control_change(ch, CC_BANK_SELECT, bank),
                0.0,
            ));
            self.push_capture(TimedEvent::new(ShortMessage::program_change(ch, program), 0.0));
        }

        let at = (t - self.record_start).max(0.0);
        let mut ev = TimedEvent::new(msg, at);
        ev.delta = (at - self.last_capture_at).max(0.0);
        self.last_capture_at = at;

        if msg.is_note_on() {
            self.open_notes += 1;
        } else if msg.is_note_off() {
            self.open_notes -= 1;
        }
        self.push_capture(ev);
    }

    fn push_capture(&mut self, ev: TimedEvent) {
        if self.capture.len() < self.capture.capacity() {
            self.capture.push(ev);
        } else {
            self.capture_overflow += 1;
        }
    }

    /// Swap the active capture buffer for a recycled spare and hand the
    /// full one to the sorter
    fn send_capture_batch(&mut self, done: bool) {
        if self.capture.is_empty() && !done {
            return;
        }
        let replacement = match self.wiring.spares.pop() {
            Ok(mut spare) => {
                spare.clear();
                spare
            }
            // No spare yet: keep appending into the headroom until one
            // returns, unless the take is over
            Err(_) if done => Vec::new(),
            Err(_) => return,
        };
        let batch = std::mem::replace(&mut self.capture, replacement);
        let channel = self.atomics.record_channel();
        if let Err(err) = self.wiring.batch_tx.try_send(SorterMsg::Batch {
            channel,
            events: batch,
            done,
        }) {
            // Inbox full or sorter gone: recover the buffer and let the
            // trash path free it off-thread
            let msg = err.into_inner();
            if let SorterMsg::Batch { events, .. } = msg {
                self.capture_overflow += events.len() as u64;
                let _ = self.wiring.trash.push(events);
            }
        }
    }

    fn finish_take(&mut self) {
        if !self.atomics.is_recording() {
            return;
        }
        self.send_capture_batch(true);
        self.atomics.set_recording(false);
        self.take_seeded = false;
        self.open_notes = 0;
        self.sink
            .on_transport_changed(self.atomics.transport(), false);
    }

    fn end_cycle_bookkeeping(&mut self, nframes: u32) {
        if !self.atomics.is_recording() {
            return;
        }
        if self.capture.len() >= CAPTURE_SWAP_THRESHOLD {
            self.send_capture_batch(false);
        }

        // Auto-terminate the take once it has outrun the master loop, no
        // notes are held, and some other channel already defines a loop.
        // The very first take is never auto-stopped: its length defines
        // the loop.
        if !self.take_seeded || self.open_notes > 0 {
            return;
        }
        let record_channel = self.atomics.record_channel() as usize;
        let others_len = (0..NUM_CHANNELS)
            .filter(|&ch| ch != record_channel)
            .map(|ch| self.channels[ch].len_secs() * self.effective_ratio(ch as u8))
            .fold(0.0, f64::max);
        if others_len <= 0.0 {
            return;
        }
        let elapsed = self.frame_secs(nframes) - self.record_start;
        if elapsed >= others_len {
            self.finish_take();
        }
    }

    // ─────────────────────────────────────────────────────────────
    // Commands and loop updates
    // ─────────────────────────────────────────────────────────────

    fn process_commands(&mut self) {
        let now = self.frame_secs(0);
        while let Ok(cmd) = self.commands.pop() {
            match cmd {
                EngineCommand::RecordStart { channel } => self.start_take(channel & 0x0F, now),
                EngineCommand::RecordStop => self.finish_take(),
                EngineCommand::Play => self.start_playback(now),
                EngineCommand::Pause => {
                    if self.atomics.transport() == Transport::Playing {
                        self.pause_started = now;
                        self.atomics.set_transport(Transport::Paused);
                        self.sink
                            .on_transport_changed(Transport::Paused, self.atomics.is_recording());
                    }
                }
                EngineCommand::Stop => {
                    self.finish_take();
                    self.release_sounding();
                    self.atomics.set_transport(Transport::Stopped);
                    self.resync_all(now);
                    self.sink.on_transport_changed(Transport::Stopped, false);
                }
                EngineCommand::SetProgram {
                    channel,
                    bank,
                    program,
                } => {
                    let ch = channel & 0x0F;
                    self.bank[ch as usize] = bank & 0x7F;
                    self.program[ch as usize] = program & 0x7F;
                    self.out_staging
                        .try_enqueue(ShortMessage::control_change(ch, CC_BANK_SELECT, bank));
                    self.out_staging
                        .try_enqueue(ShortMessage::program_change(ch, program));
                }
                EngineCommand::AllNotesOff => self.release_sounding(),
            }
        }
    }

    fn start_take(&mut self, channel: u8, now: f64) {
        if self.atomics.is_recording() {
            return;
        }
        // The first take defines the reference tempo the loops are scaled
        // against later
        if self.channels.iter().all(|c| c.events.is_empty()) {
            self.atomics.set_recorded_bpm(self.atomics.bpm());
        }
        self.atomics.set_record_channel(channel);
        self.capture.clear();
        self.take_seeded = false;
        self.open_notes = 0;
        self.last_capture_at = 0.0;
        self.record_start = now;
        self.atomics.set_recording(true);
        let _ = self
            .wiring
            .batch_tx
            .try_send(SorterMsg::BeginTake { channel });
        self.sink
            .on_transport_changed(self.atomics.transport(), true);
    }

    fn start_playback(&mut self, now: f64) {
        match self.atomics.transport() {
            Transport::Paused => {
                let shift = now - self.pause_started;
                for pc in &mut self.channels {
                    pc.loop_start += shift;
                    pc.segment_start += shift;
                }
                self.atomics.set_transport(Transport::Playing);
            }
            Transport::Stopped => {
                self.resync_all(now);
                self.atomics.set_transport(Transport::Playing);
            }
            Transport::Playing => return,
        }
        self.sink
            .on_transport_changed(Transport::Playing, self.atomics.is_recording());
    }

    /// Stage all-notes-off for every channel with sounding notes
    fn release_sounding(&mut self) {
        for ch in 0..NUM_CHANNELS as u8 {
            if self.atomics.any_sounding(ch) {
                self.out_staging
                    .try_enqueue(ShortMessage::control_change(ch, CC_ALL_NOTES_OFF, 0));
                self.atomics.clear_sounding(ch);
            }
        }
    }

    /// Swap in freshly sorted channel sequences from the sorter
    fn apply_loop_updates(&mut self) {
        let mut changed = false;
        while let Ok(update) = self.wiring.updates.pop() {
            let ch = (update.channel as usize) % NUM_CHANNELS;
            let pc = &mut self.channels[ch];
            let old = std::mem::replace(&mut pc.events, update.events);
            // Swapped-in channels rejoin playback at the next wrap point
            pc.pos = pc.events.len();
            let _ = self.wiring.trash.push(old);
            changed = true;
        }
        if changed {
            self.recompute_master();
        }
    }

    fn recompute_master(&mut self) {
        self.master_channel = None;
        let mut longest = 0.0;
        for (ch, pc) in self.channels.iter().enumerate() {
            let len = pc.len_secs();
            if len > longest {
                longest = len;
                self.master_channel = Some(ch);
            }
        }
    }
}
