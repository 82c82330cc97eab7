//! Lock-free engine state shared between threads
//!
//! The control layer writes flags and tempo here and reads transport and
//! note state back without ever touching the audio thread. The audio thread
//! reads flags each cycle and owns the transport and sounding-note fields.
//!
//! `Relaxed` ordering is used throughout: these are independent values where
//! only visibility matters. Payload handoff (staged messages, loop updates)
//! goes through the dedicated queues, never through these flags.

use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, AtomicU8, Ordering};

use crate::types::{Transport, MAX_NOTE, NUM_CHANNELS};

/// Default tempo when nothing is configured or estimated
pub const DEFAULT_BPM: f64 = 120.0;

/// Shared atomic engine state
pub struct EngineAtomics {
    /// Transport state, written by the audio thread
    transport: AtomicU8,
    /// A take is in progress
    recording: AtomicBool,
    /// Channel the current/last take records into
    record_channel: AtomicU8,
    /// Channels loop independently instead of following the master wrap
    freewheel: AtomicBool,
    /// Copy input straight to the output port
    midi_through: AtomicBool,
    /// Route note input through the mapping table
    mapper_engaged: AtomicBool,
    /// Bit per channel: suppress note-ons during playback
    mute_mask: AtomicU16,
    /// Current playback tempo (f64 bits)
    bpm: AtomicU64,
    /// Tempo the stored loops were recorded at (f64 bits)
    recorded_bpm: AtomicU64,
    /// Per-channel tempo ratio multiplier (f64 bits)
    channel_ratio: [AtomicU64; NUM_CHANNELS],
    /// Last BPM reported by the beat-clock estimator (0 = none yet)
    clock_bpm: AtomicU16,
    /// 128-bit sounding-note bitmap per channel
    sounding: [[AtomicU64; 2]; NUM_CHANNELS],
}

impl EngineAtomics {
    pub fn new() -> Self {
        Self {
            transport: AtomicU8::new(Transport::Stopped.as_u8()),
            recording: AtomicBool::new(false),
            record_channel: AtomicU8::new(0),
            freewheel: AtomicBool::new(false),
            midi_through: AtomicBool::new(true),
            mapper_engaged: AtomicBool::new(false),
            mute_mask: AtomicU16::new(0),
            bpm: AtomicU64::new(DEFAULT_BPM.to_bits()),
            recorded_bpm: AtomicU64::new(DEFAULT_BPM.to_bits()),
            channel_ratio: std::array::from_fn(|_| AtomicU64::new(1.0f64.to_bits())),
            clock_bpm: AtomicU16::new(0),
            sounding: std::array::from_fn(|_| [AtomicU64::new(0), AtomicU64::new(0)]),
        }
    }

    #[inline]
    pub fn transport(&self) -> Transport {
        Transport::from_u8(self.transport.load(Ordering::Relaxed))
    }

    pub(crate) fn set_transport(&self, t: Transport) {
        self.transport.store(t.as_u8(), Ordering::Relaxed);
    }

    #[inline]
    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::Relaxed)
    }

    pub(crate) fn set_recording(&self, on: bool) {
        self.recording.store(on, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_channel(&self) -> u8 {
        self.record_channel.load(Ordering::Relaxed) & 0x0F
    }

    pub(crate) fn set_record_channel(&self, channel: u8) {
        self.record_channel.store(channel & 0x0F, Ordering::Relaxed);
    }

    #[inline]
    pub fn freewheel(&self) -> bool {
        self.freewheel.load(Ordering::Relaxed)
    }

    pub fn set_freewheel(&self, on: bool) {
        self.freewheel.store(on, Ordering::Relaxed);
    }

    #[inline]
    pub fn midi_through(&self) -> bool {
        self.midi_through.load(Ordering::Relaxed)
    }

    pub fn set_midi_through(&self, on: bool) {
        self.midi_through.store(on, Ordering::Relaxed);
    }

    #[inline]
    pub fn mapper_engaged(&self) -> bool {
        self.mapper_engaged.load(Ordering::Relaxed)
    }

    pub fn set_mapper_engaged(&self, on: bool) {
        self.mapper_engaged.store(on, Ordering::Relaxed);
    }

    #[inline]
    pub fn is_muted(&self, channel: u8) -> bool {
        if channel as usize >= NUM_CHANNELS {
            return false;
        }
        self.mute_mask.load(Ordering::Relaxed) & (1 << channel) != 0
    }

    pub fn set_muted(&self, channel: u8, muted: bool) {
        if channel as usize >= NUM_CHANNELS {
            return;
        }
        let bit = 1u16 << channel;
        if muted {
            self.mute_mask.fetch_or(bit, Ordering::Relaxed);
        } else {
            self.mute_mask.fetch_and(!bit, Ordering::Relaxed);
        }
    }

    pub fn mute_mask(&self) -> u16 {
        self.mute_mask.load(Ordering::Relaxed)
    }

    pub fn set_mute_mask(&self, mask: u16) {
        self.mute_mask.store(mask, Ordering::Relaxed);
    }

    #[inline]
    pub fn bpm(&self) -> f64 {
        f64::from_bits(self.bpm.load(Ordering::Relaxed))
    }

    pub fn set_bpm(&self, bpm: f64) {
        let clamped = bpm.clamp(crate::engine::clock::MIN_BPM, crate::engine::clock::MAX_BPM);
        self.bpm.store(clamped.to_bits(), Ordering::Relaxed);
    }

    #[inline]
    pub fn recorded_bpm(&self) -> f64 {
        f64::from_bits(self.recorded_bpm.load(Ordering::Relaxed))
    }

    pub fn set_recorded_bpm(&self, bpm: f64) {
        let clamped = bpm.clamp(crate::engine::clock::MIN_BPM, crate::engine::clock::MAX_BPM);
        self.recorded_bpm.store(clamped.to_bits(), Ordering::Relaxed);
    }

    #[inline]
    pub fn channel_ratio(&self, channel: u8) -> f64 {
        match self.channel_ratio.get(channel as usize) {
            Some(r) => f64::from_bits(r.load(Ordering::Relaxed)),
            None => 1.0,
        }
    }

    pub fn set_channel_ratio(&self, channel: u8, ratio: f64) {
        if let Some(r) = self.channel_ratio.get(channel as usize) {
            r.store(ratio.clamp(0.0625, 16.0).to_bits(), Ordering::Relaxed);
        }
    }

    /// Last stabilized beat-clock estimate, if any arrived
    pub fn clock_bpm(&self) -> Option<u16> {
        match self.clock_bpm.load(Ordering::Relaxed) {
            0 => None,
            v => Some(v),
        }
    }

    pub(crate) fn set_clock_bpm(&self, bpm: u16) {
        self.clock_bpm.store(bpm, Ordering::Relaxed);
    }

    pub(crate) fn note_sounding(&self, channel: u8, note: u8, on: bool) {
        if channel as usize >= NUM_CHANNELS || note > MAX_NOTE {
            return;
        }
        let word = &self.sounding[channel as usize][(note / 64) as usize];
        let bit = 1u64 << (note % 64);
        if on {
            word.fetch_or(bit, Ordering::Relaxed);
        } else {
            word.fetch_and(!bit, Ordering::Relaxed);
        }
    }

    pub(crate) fn clear_sounding(&self, channel: u8) {
        if let Some(words) = self.sounding.get(channel as usize) {
            words[0].store(0, Ordering::Relaxed);
            words[1].store(0, Ordering::Relaxed);
        }
    }

    /// Is this note currently sounding on this channel? (key-matrix query)
    pub fn is_sounding(&self, channel: u8, note: u8) -> bool {
        if channel as usize >= NUM_CHANNELS || note > MAX_NOTE {
            return false;
        }
        let word = &self.sounding[channel as usize][(note / 64) as usize];
        word.load(Ordering::Relaxed) & (1u64 << (note % 64)) != 0
    }

    /// Is anything sounding on this channel?
    pub fn any_sounding(&self, channel: u8) -> bool {
        match self.sounding.get(channel as usize) {
            Some(words) => {
                words[0].load(Ordering::Relaxed) != 0 || words[1].load(Ordering::Relaxed) != 0
            }
            None => false,
        }
    }
}

impl Default for EngineAtomics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mute_mask_bits() {
        let a = EngineAtomics::new();
        a.set_muted(3, true);
        a.set_muted(15, true);
        assert!(a.is_muted(3));
        assert!(a.is_muted(15));
        assert!(!a.is_muted(4));
        a.set_muted(3, false);
        assert!(!a.is_muted(3));
        // Out-of-range channels are never muted and never panic
        assert!(!a.is_muted(16));
        a.set_muted(200, true);
    }

    #[test]
    fn test_sounding_bitmap() {
        let a = EngineAtomics::new();
        a.note_sounding(2, 61, true);
        a.note_sounding(2, 100, true);
        assert!(a.is_sounding(2, 61));
        assert!(a.is_sounding(2, 100));
        assert!(a.any_sounding(2));
        assert!(!a.is_sounding(3, 61));

        a.note_sounding(2, 61, false);
        assert!(!a.is_sounding(2, 61));
        a.clear_sounding(2);
        assert!(!a.any_sounding(2));
        // Defensive bounds
        assert!(!a.is_sounding(16, 0));
        assert!(!a.is_sounding(0, 128));
    }

    #[test]
    fn test_bpm_clamped() {
        let a = EngineAtomics::new();
        a.set_bpm(1000.0);
        assert_eq!(a.bpm(), 360.0);
        a.set_bpm(1.0);
        assert_eq!(a.bpm(), 24.0);
    }
}
