//! Keyboard mapping on a background thread
//!
//! Note-on/off events from the audio thread are rewritten through a
//! 128-entry table before they reach the output path. A `Skip` entry drops
//! the event outright: it is not forwarded, not recorded, not played.
//! Rewritten events are staged into the general outbound table, so the
//! audio thread plays, mirrors, and captures them like any other outgoing
//! message; the key-state sink is told about the *mapped* note so key-matrix
//! visuals match what actually sounds.
//!
//! The table is swapped in as a whole through the message queue and never
//! mutated in place while mapping is engaged.

use std::sync::Arc;
use std::thread::JoinHandle;

use crate::engine::staging::OutboundStaging;
use crate::sink::EventSink;
use crate::types::{ShortMessage, MAX_NOTE};

/// Bound on pending raw events; enough for several dense cycles
pub const MAPPER_QUEUE_CAPACITY: usize = 256;

/// One entry of the keyboard mapping table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapTarget {
    /// Substitute this note number
    Note(u8),
    /// Drop the event entirely
    Skip,
}

/// 128-entry note substitution/skip table
#[derive(Debug, Clone)]
pub struct NoteMap {
    targets: [MapTarget; 128],
}

impl NoteMap {
    /// Table that maps every note to itself
    pub fn identity() -> Self {
        Self {
            targets: std::array::from_fn(|i| MapTarget::Note(i as u8)),
        }
    }

    pub fn set(&mut self, note: u8, target: MapTarget) {
        if note <= MAX_NOTE {
            self.targets[note as usize] = match target {
                MapTarget::Note(n) => MapTarget::Note(n & 0x7F),
                MapTarget::Skip => MapTarget::Skip,
            };
        }
    }

    /// Look up a note; out-of-range input is skipped rather than mapped
    pub fn get(&self, note: u8) -> MapTarget {
        self.targets
            .get(note as usize)
            .copied()
            .unwrap_or(MapTarget::Skip)
    }
}

impl Default for NoteMap {
    fn default() -> Self {
        Self::identity()
    }
}

/// Messages the mapper thread consumes
pub enum MapperMsg {
    /// A raw note-on/off from the input port
    Event(ShortMessage),
    /// Replace the whole table
    SetTable(Box<NoteMap>),
    /// Exit the thread (the audio thread may still hold a sender clone, so
    /// disconnect alone cannot end the loop)
    Shutdown,
}

/// Handle to the mapper thread; joins on drop
pub struct NoteMapper {
    tx: Option<flume::Sender<MapperMsg>>,
    thread: Option<JoinHandle<()>>,
}

/// Spawn the mapper thread with an identity table
pub fn spawn_note_mapper(
    staging: Arc<OutboundStaging>,
    sink: Arc<dyn EventSink>,
) -> (NoteMapper, flume::Sender<MapperMsg>) {
    let (tx, rx) = flume::bounded(MAPPER_QUEUE_CAPACITY);

    let thread = std::thread::Builder::new()
        .name("note-mapper".into())
        .spawn(move || run(rx, staging, sink))
        .expect("Failed to spawn note mapper thread");

    let handle = NoteMapper {
        tx: Some(tx.clone()),
        thread: Some(thread),
    };
    (handle, tx)
}

fn run(rx: flume::Receiver<MapperMsg>, staging: Arc<OutboundStaging>, sink: Arc<dyn EventSink>) {
    #[cfg(all(target_os = "linux", feature = "embedded-rt"))]
    promote_thread_priority();

    let mut table = NoteMap::identity();
    log::info!("Note mapper started");

    for msg in rx.iter() {
        match msg {
            MapperMsg::Event(event) => map_event(&table, &event, &staging, sink.as_ref()),
            MapperMsg::SetTable(new_table) => {
                table = *new_table;
                log::info!("Mapping table replaced");
            }
            MapperMsg::Shutdown => break,
        }
    }

    log::info!("Note mapper shutting down");
}

fn map_event(
    table: &NoteMap,
    event: &ShortMessage,
    staging: &OutboundStaging,
    sink: &dyn EventSink,
) {
    if !event.is_note() {
        // Only note-on/off are eligible for mapping; anything else that
        // reaches us is forwarded untouched
        staging.try_enqueue(*event);
        return;
    }

    let note = event.data1();
    match table.get(note) {
        MapTarget::Skip => {
            log::trace!("Mapping skipped note {}", note);
        }
        MapTarget::Note(mapped) => {
            let rewritten = event.with_note(mapped);
            staging.try_enqueue(rewritten);
            sink.on_note_event(
                rewritten.channel(),
                mapped,
                rewritten.data2(),
                rewritten.is_note_on(),
            );
        }
    }
}

#[cfg(all(target_os = "linux", feature = "embedded-rt"))]
fn promote_thread_priority() {
    // Match the audio thread's scheduling class so mapped notes do not lag
    // behind direct through-routing under load
    let param = libc::sched_param { sched_priority: 70 };
    let rc = unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) };
    if rc != 0 {
        log::warn!("Could not raise note mapper to SCHED_FIFO (needs rtprio rlimit)");
    } else {
        log::info!("Note mapper running at SCHED_FIFO priority 70");
    }
}

impl NoteMapper {
    /// Sender for the audio thread (events) and control layer (tables)
    pub fn sender(&self) -> Option<flume::Sender<MapperMsg>> {
        self.tx.clone()
    }

    /// Swap in a new table (blocks only on a saturated queue)
    pub fn set_table(&self, table: NoteMap) {
        if let Some(tx) = &self.tx {
            if tx.send(MapperMsg::SetTable(Box::new(table))).is_err() {
                log::warn!("Note mapper is gone; table dropped");
            }
        }
    }
}

impl Drop for NoteMapper {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(MapperMsg::Shutdown);
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{QueueSink, SinkEvent};
    use std::time::{Duration, Instant};

    fn drain_staging(staging: &OutboundStaging) -> Vec<ShortMessage> {
        let mut cursor = 0;
        let mut out = Vec::new();
        while let Some(msg) = staging.drain_next(&mut cursor) {
            out.push(msg);
        }
        out
    }

    fn wait_for_messages(staging: &OutboundStaging, n: usize) -> Vec<ShortMessage> {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut out = Vec::new();
        while Instant::now() < deadline {
            out.extend(drain_staging(staging));
            if out.len() >= n {
                return out;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        panic!("expected {} staged messages, got {}", n, out.len());
    }

    #[test]
    fn test_skip_entry_drops_event_entirely() {
        let staging = Arc::new(OutboundStaging::new());
        let (sink, _rx) = QueueSink::bounded(16);
        let (mapper, tx) = spawn_note_mapper(staging.clone(), sink);

        let mut table = NoteMap::identity();
        table.set(61, MapTarget::Skip);
        mapper.set_table(table);

        tx.send(MapperMsg::Event(ShortMessage::note_on(0, 61, 100)))
            .unwrap();
        tx.send(MapperMsg::Event(ShortMessage::note_off(0, 61, 0)))
            .unwrap();
        // A non-skipped note proves the skipped ones were processed first
        tx.send(MapperMsg::Event(ShortMessage::note_on(0, 62, 100)))
            .unwrap();

        let staged = wait_for_messages(&staging, 1);
        assert_eq!(staged.len(), 1);
        assert_eq!(staged[0].data1(), 62);
        drop(mapper);
    }

    #[test]
    fn test_substitution_rewrites_note_and_reports_mapped_key() {
        let staging = Arc::new(OutboundStaging::new());
        let (sink, sink_rx) = QueueSink::bounded(16);
        let (mapper, tx) = spawn_note_mapper(staging.clone(), sink);

        let mut table = NoteMap::identity();
        table.set(60, MapTarget::Note(59));
        mapper.set_table(table);

        tx.send(MapperMsg::Event(ShortMessage::note_on(2, 60, 99)))
            .unwrap();

        let staged = wait_for_messages(&staging, 1);
        assert_eq!(staged[0], ShortMessage::note_on(2, 59, 99));

        let reported = sink_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("no key-state notification");
        assert_eq!(
            reported,
            SinkEvent::Note {
                channel: 2,
                note: 59,
                velocity: 99,
                on: true
            }
        );
        drop(mapper);
    }

    #[test]
    fn test_identity_passthrough() {
        let staging = Arc::new(OutboundStaging::new());
        let (sink, _rx) = QueueSink::bounded(16);
        let (mapper, tx) = spawn_note_mapper(staging.clone(), sink);

        let msg = ShortMessage::note_off(5, 40, 64);
        tx.send(MapperMsg::Event(msg)).unwrap();
        let staged = wait_for_messages(&staging, 1);
        assert_eq!(staged[0], msg);
        drop(mapper);
    }
}
