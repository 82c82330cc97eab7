//! Standard MIDI file import/export of recorded loops
//!
//! Loops serialize as SMF format 1: a tempo track followed by one track per
//! non-empty channel, at 480 ticks per quarter note. Import accepts any
//! format-0/1 file, keeps channel voice messages, and rebuilds the
//! second-domain event times from the file's initial tempo (mid-file tempo
//! changes are ignored; loops are single-tempo material here).

use std::path::Path;

use midly::num::{u14, u15, u24, u28, u4, u7};
use midly::{Format, Header, MetaMessage, MidiMessage, Smf, Timing, TrackEvent, TrackEventKind};
use thiserror::Error;

use ostinato_core::engine::{sort_and_recompute, TimedEvent};
use ostinato_core::types::{
    STATUS_CHANNEL_AFTERTOUCH, STATUS_CONTROL_CHANGE, STATUS_NOTE_OFF, STATUS_NOTE_ON,
    STATUS_PITCH_BEND, STATUS_POLY_AFTERTOUCH, STATUS_PROGRAM_CHANGE,
};
use ostinato_core::{LoopStore, ShortMessage, NUM_CHANNELS};

/// Ticks per quarter note in exported files
const PPQ: u16 = 480;

/// Tempo assumed when a file carries no tempo event
const FALLBACK_BPM: f64 = 120.0;

/// Errors for loop file operations
#[derive(Debug, Error)]
pub enum FileError {
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not a readable MIDI file: {0}")]
    Parse(String),

    #[error("SMPTE-timecode MIDI files are not supported")]
    UnsupportedTiming,
}

impl From<midly::Error> for FileError {
    fn from(e: midly::Error) -> Self {
        FileError::Parse(e.to_string())
    }
}

fn secs_to_ticks(at: f64, bpm: f64) -> u64 {
    (at * bpm / 60.0 * f64::from(PPQ)).round() as u64
}

/// Our 2/3-byte message to a midly channel event
fn message_to_midly(msg: &ShortMessage) -> Option<(u4, MidiMessage)> {
    let channel = u4::from(msg.channel());
    let message = match msg.status() {
        STATUS_NOTE_OFF => MidiMessage::NoteOff {
            key: u7::from(msg.data1()),
            vel: u7::from(msg.data2()),
        },
        STATUS_NOTE_ON => MidiMessage::NoteOn {
            key: u7::from(msg.data1()),
            vel: u7::from(msg.data2()),
        },
        STATUS_POLY_AFTERTOUCH => MidiMessage::Aftertouch {
            key: u7::from(msg.data1()),
            vel: u7::from(msg.data2()),
        },
        STATUS_CONTROL_CHANGE => MidiMessage::Controller {
            controller: u7::from(msg.data1()),
            value: u7::from(msg.data2()),
        },
        STATUS_PROGRAM_CHANGE => MidiMessage::ProgramChange {
            program: u7::from(msg.data1()),
        },
        STATUS_CHANNEL_AFTERTOUCH => MidiMessage::ChannelAftertouch {
            vel: u7::from(msg.data1()),
        },
        STATUS_PITCH_BEND => {
            let raw = (u16::from(msg.data2()) << 7) | u16::from(msg.data1());
            MidiMessage::PitchBend {
                bend: midly::PitchBend(u14::from(raw)),
            }
        }
        _ => return None,
    };
    Some((channel, message))
}

/// A midly channel event back into our raw-byte form
fn midly_to_message(channel: u4, message: &MidiMessage) -> Option<ShortMessage> {
    let ch = channel.as_int();
    let bytes: Vec<u8> = match message {
        MidiMessage::NoteOff { key, vel } => {
            vec![STATUS_NOTE_OFF | ch, key.as_int(), vel.as_int()]
        }
        MidiMessage::NoteOn { key, vel } => {
            vec![STATUS_NOTE_ON | ch, key.as_int(), vel.as_int()]
        }
        MidiMessage::Aftertouch { key, vel } => {
            vec![STATUS_POLY_AFTERTOUCH | ch, key.as_int(), vel.as_int()]
        }
        MidiMessage::Controller { controller, value } => {
            vec![STATUS_CONTROL_CHANGE | ch, controller.as_int(), value.as_int()]
        }
        MidiMessage::ProgramChange { program } => {
            vec![STATUS_PROGRAM_CHANGE | ch, program.as_int()]
        }
        MidiMessage::ChannelAftertouch { vel } => {
            vec![STATUS_CHANNEL_AFTERTOUCH | ch, vel.as_int()]
        }
        MidiMessage::PitchBend { bend } => {
            let raw = bend.0.as_int();
            vec![
                STATUS_PITCH_BEND | ch,
                (raw & 0x7F) as u8,
                ((raw >> 7) & 0x7F) as u8,
            ]
        }
    };
    ShortMessage::new(&bytes)
}

/// Build the SMF representation of the recorded loops
pub fn loops_to_smf(store: &LoopStore, bpm: f64) -> Smf<'static> {
    let micros_per_quarter = (60_000_000.0 / bpm.max(1.0)).round() as u32;
    let mut tracks = vec![vec![
        TrackEvent {
            delta: u28::from(0u32),
            kind: TrackEventKind::Meta(MetaMessage::Tempo(u24::from(micros_per_quarter))),
        },
        TrackEvent {
            delta: u28::from(0u32),
            kind: TrackEventKind::Meta(MetaMessage::EndOfTrack),
        },
    ]];

    for ch in 0..NUM_CHANNELS {
        let events = store.channel(ch);
        if events.is_empty() {
            continue;
        }
        let mut track = Vec::with_capacity(events.len() + 1);
        let mut prev_tick = 0u64;
        for ev in events {
            let (channel, message) = match message_to_midly(&ev.message) {
                Some(m) => m,
                None => continue,
            };
            let tick = secs_to_ticks(ev.at, bpm);
            let delta = tick.saturating_sub(prev_tick).min(0x0FFF_FFFF) as u32;
            prev_tick = tick;
            track.push(TrackEvent {
                delta: u28::from(delta),
                kind: TrackEventKind::Midi { channel, message },
            });
        }
        track.push(TrackEvent {
            delta: u28::from(0u32),
            kind: TrackEventKind::Meta(MetaMessage::EndOfTrack),
        });
        tracks.push(track);
    }

    Smf {
        header: Header::new(Format::Parallel, Timing::Metrical(u15::from(PPQ))),
        tracks,
    }
}

/// Serialize the loops to SMF bytes
pub fn loops_to_bytes(store: &LoopStore, bpm: f64) -> Result<Vec<u8>, FileError> {
    let smf = loops_to_smf(store, bpm);
    let mut bytes = Vec::new();
    smf.write_std(&mut bytes)?;
    Ok(bytes)
}

/// Save the loops as a standard MIDI file
pub fn save_loops(path: &Path, store: &LoopStore, bpm: f64) -> Result<(), FileError> {
    let bytes = loops_to_bytes(store, bpm)?;
    std::fs::write(path, bytes)?;
    log::info!(
        "Saved {} events to {:?} at {:.1} BPM",
        store.total_events(),
        path,
        bpm
    );
    Ok(())
}

/// Parse SMF bytes back into a loop store and its recorded tempo
pub fn loops_from_bytes(bytes: &[u8]) -> Result<(LoopStore, f64), FileError> {
    let smf = Smf::parse(bytes)?;
    let ppq = match smf.header.timing {
        Timing::Metrical(t) => f64::from(t.as_int()),
        Timing::Timecode(..) => return Err(FileError::UnsupportedTiming),
    };

    let mut bpm = FALLBACK_BPM;
    'tempo: for track in &smf.tracks {
        for event in track {
            if let TrackEventKind::Meta(MetaMessage::Tempo(t)) = &event.kind {
                bpm = 60_000_000.0 / f64::from(t.as_int());
                break 'tempo;
            }
        }
    }

    let secs_per_tick = 60.0 / (bpm * ppq);
    let mut channels: Vec<Vec<TimedEvent>> = (0..NUM_CHANNELS).map(|_| Vec::new()).collect();

    for track in &smf.tracks {
        let mut tick = 0u64;
        for event in track {
            tick += u64::from(event.delta.as_int());
            if let TrackEventKind::Midi { channel, message } = &event.kind {
                if let Some(msg) = midly_to_message(*channel, message) {
                    let at = tick as f64 * secs_per_tick;
                    channels[msg.channel() as usize].push(TimedEvent::new(msg, at));
                }
            }
        }
    }

    let mut store = LoopStore::new();
    for (ch, mut events) in channels.into_iter().enumerate() {
        if events.is_empty() {
            continue;
        }
        sort_and_recompute(&mut events);
        store.replace_channel(ch, events);
    }
    Ok((store, bpm))
}

/// Load loops from a standard MIDI file
pub fn load_loops(path: &Path) -> Result<(LoopStore, f64), FileError> {
    let bytes = std::fs::read(path)?;
    let result = loops_from_bytes(&bytes)?;
    log::info!(
        "Loaded {} events from {:?} at {:.1} BPM",
        result.0.total_events(),
        path,
        result.1
    );
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// One bar of material on two channels, with the seed pair a real
    /// recording would carry
    fn sample_store() -> LoopStore {
        let mut store = LoopStore::new();

        let mut ch0 = vec![
            TimedEvent::new(ShortMessage::control_change(0, 0, 2), 0.0),
            TimedEvent::new(ShortMessage::program_change(0, 17), 0.0),
            TimedEvent::new(ShortMessage::note_on(0, 60, 100), 0.25),
            TimedEvent::new(ShortMessage::note_off(0, 60, 0), 0.75),
            TimedEvent::new(ShortMessage::note_on(0, 64, 90), 1.0),
            TimedEvent::new(ShortMessage::note_off(0, 64, 0), 2.0),
        ];
        sort_and_recompute(&mut ch0);
        store.replace_channel(0, ch0);

        let mut ch9 = vec![
            TimedEvent::new(ShortMessage::note_on(9, 36, 127), 0.0),
            TimedEvent::new(ShortMessage::note_off(9, 36, 0), 0.1),
        ];
        sort_and_recompute(&mut ch9);
        store.replace_channel(9, ch9);

        store
    }

    #[test]
    fn test_roundtrip_preserves_events_and_tempo() {
        let store = sample_store();
        let bytes = loops_to_bytes(&store, 95.0).unwrap();
        let (loaded, bpm) = loops_from_bytes(&bytes).unwrap();

        assert!((bpm - 95.0).abs() < 0.1);
        assert_eq!(loaded.channel(0).len(), 6);
        assert_eq!(loaded.channel(9).len(), 2);
        assert_eq!(loaded.non_empty_channels(), 2);

        // Times survive within tick quantization (1/760s per tick at 95 BPM)
        for (orig, back) in store.channel(0).iter().zip(loaded.channel(0)) {
            assert_eq!(orig.message, back.message);
            assert!(
                (orig.at - back.at).abs() < 2e-3,
                "time drifted: {} vs {}",
                orig.at,
                back.at
            );
        }
    }

    #[test]
    fn test_file_roundtrip_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("take.mid");
        let store = sample_store();

        save_loops(&path, &store, 120.0).unwrap();
        let (loaded, bpm) = load_loops(&path).unwrap();
        assert!((bpm - 120.0).abs() < 0.1);
        assert_eq!(loaded.total_events(), store.total_events());
    }

    #[test]
    fn test_missing_file_is_an_io_error() {
        let err = load_loops(Path::new("/nonexistent/take.mid")).unwrap_err();
        assert!(matches!(err, FileError::Io(_)));
    }

    #[test]
    fn test_garbage_is_a_parse_error() {
        let err = loops_from_bytes(b"not a midi file").unwrap_err();
        assert!(matches!(err, FileError::Parse(_)));
    }

    #[test]
    fn test_import_merges_same_channel_across_tracks() {
        // Two tracks both writing channel 3: the loop store merges them
        // into one sorted sequence
        let mut store_a = LoopStore::new();
        let mut ch = vec![
            TimedEvent::new(ShortMessage::note_on(3, 50, 80), 0.0),
            TimedEvent::new(ShortMessage::note_off(3, 50, 0), 1.0),
        ];
        sort_and_recompute(&mut ch);
        store_a.replace_channel(3, ch);

        let mut smf = loops_to_smf(&store_a, 120.0);
        // Duplicate the channel track
        let extra = smf.tracks[1].clone();
        smf.tracks.push(extra);
        let mut bytes = Vec::new();
        smf.write_std(&mut bytes).unwrap();

        let (loaded, _) = loops_from_bytes(&bytes).unwrap();
        assert_eq!(loaded.channel(3).len(), 4);
        let times: Vec<f64> = loaded.channel(3).iter().map(|e| e.at).collect();
        assert!(times.windows(2).all(|w| w[0] <= w[1]));
    }
}
