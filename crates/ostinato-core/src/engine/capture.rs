//! Capture sorting on a background thread
//!
//! The audio thread appends captured events into one of a pool of
//! pre-allocated batch buffers and hands a full buffer off here. This
//! thread owns the authoritative [`LoopStore`]: it merges each batch into
//! the target channel, stable-sorts by absolute time, recomputes deltas,
//! and publishes the updated channel back to the audio thread as a whole
//! replacement sequence. Emptied batch buffers return to the audio thread
//! through a spare ring; retired play sequences come back on a trash ring
//! and are dropped here, so the audio thread never frees memory.
//!
//! Control-plane loop mutations (clear, edge edits, file replacement,
//! snapshots for saving) also run here, keeping a single mutator for the
//! store after handoff.

use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::Context;

use crate::engine::event::{sort_and_recompute, TimedEvent};
use crate::engine::quantize::{shift_edge, EdgeOp, LoopEdge};
use crate::engine::store::LoopStore;
use crate::types::NUM_CHANNELS;

/// Batch size at which the audio thread swaps capture buffers mid-take
pub const CAPTURE_SWAP_THRESHOLD: usize = 256;

/// Capacity of each capture buffer; headroom past the swap threshold so a
/// dense cycle never forces an allocation
pub(crate) const CAPTURE_BUFFER_CAPACITY: usize = 1024;

/// Batch buffers in rotation between the audio thread and the sorter
const CAPTURE_POOL: usize = 4;

const SORTER_INBOX_CAPACITY: usize = 64;
const UPDATE_RING_CAPACITY: usize = 64;
const TRASH_RING_CAPACITY: usize = 64;

/// How long the sorter sleeps between idle housekeeping passes
const IDLE_TICK: Duration = Duration::from_secs(1);

/// Everything the sorter thread can be asked to do
pub enum SorterMsg {
    /// A take is starting on this channel
    BeginTake { channel: u8 },
    /// A capture buffer handed off by the audio thread
    Batch {
        channel: u8,
        events: Vec<TimedEvent>,
        done: bool,
    },
    /// Drop one channel's loop
    Clear { channel: u8 },
    /// Drop every loop
    ClearAll,
    /// One-beat edge edit across all channels
    Quantize {
        edge: LoopEdge,
        op: EdgeOp,
        beat_secs: f64,
    },
    /// Replace the whole store (file import)
    ReplaceAll { store: Box<LoopStore> },
    /// Clone the store for serialization
    Snapshot { reply: flume::Sender<LoopStore> },
    /// Exit the thread (the audio thread may still hold a sender clone, so
    /// disconnect alone cannot end the loop)
    Shutdown,
}

/// A freshly sorted channel sequence for the audio thread to swap in
pub struct LoopUpdate {
    pub channel: u8,
    pub events: Vec<TimedEvent>,
}

/// Audio-thread ends of the sorter plumbing
pub struct CaptureWiring {
    /// Hot-path sends from the audio thread (drop on full)
    pub(crate) batch_tx: flume::Sender<SorterMsg>,
    /// Sorted channel sequences to swap into the play set
    pub(crate) updates: rtrb::Consumer<LoopUpdate>,
    /// Recycled, emptied capture buffers
    pub(crate) spares: rtrb::Consumer<Vec<TimedEvent>>,
    /// Retired play sequences, to be dropped on the sorter thread
    pub(crate) trash: rtrb::Producer<Vec<TimedEvent>>,
}

/// Control-side handle; joins the thread on drop
pub struct SorterHandle {
    tx: Option<flume::Sender<SorterMsg>>,
    thread: Option<JoinHandle<()>>,
}

/// Spawn the sorter thread with an empty store
pub fn spawn_capture_sorter() -> (SorterHandle, CaptureWiring) {
    let (tx, rx) = flume::bounded(SORTER_INBOX_CAPACITY);
    let (update_tx, update_rx) = rtrb::RingBuffer::new(UPDATE_RING_CAPACITY);
    let (mut spare_tx, spare_rx) = rtrb::RingBuffer::new(CAPTURE_POOL + 1);
    let (trash_tx, trash_rx) = rtrb::RingBuffer::new(TRASH_RING_CAPACITY);

    for _ in 0..CAPTURE_POOL {
        let _ = spare_tx.push(Vec::with_capacity(CAPTURE_BUFFER_CAPACITY));
    }

    let thread = std::thread::Builder::new()
        .name("capture-sorter".into())
        .spawn(move || run(rx, update_tx, spare_tx, trash_rx))
        .expect("Failed to spawn capture sorter thread");

    let handle = SorterHandle {
        tx: Some(tx.clone()),
        thread: Some(thread),
    };
    let wiring = CaptureWiring {
        batch_tx: tx,
        updates: update_rx,
        spares: spare_rx,
        trash: trash_tx,
    };
    (handle, wiring)
}

fn run(
    rx: flume::Receiver<SorterMsg>,
    mut updates: rtrb::Producer<LoopUpdate>,
    mut spares: rtrb::Producer<Vec<TimedEvent>>,
    mut trash: rtrb::Consumer<Vec<TimedEvent>>,
) {
    let mut store = LoopStore::new();
    log::info!("Capture sorter started");

    loop {
        match rx.recv_timeout(IDLE_TICK) {
            Ok(SorterMsg::Shutdown) => break,
            Ok(msg) => handle(msg, &mut store, &mut updates, &mut spares),
            Err(flume::RecvTimeoutError::Timeout) => {}
            Err(flume::RecvTimeoutError::Disconnected) => break,
        }
        // Deferred drops from the audio thread
        while trash.pop().is_ok() {}
    }

    log::info!("Capture sorter shutting down");
}

fn handle(
    msg: SorterMsg,
    store: &mut LoopStore,
    updates: &mut rtrb::Producer<LoopUpdate>,
    spares: &mut rtrb::Producer<Vec<TimedEvent>>,
) {
    match msg {
        SorterMsg::BeginTake { channel } => {
            log::debug!("Take starting on channel {}", channel);
        }
        SorterMsg::Batch {
            channel,
            mut events,
            done,
        } => {
            let count = events.len();
            if let Some(seq) = store.channel_mut(channel as usize) {
                seq.append(&mut events);
                sort_and_recompute(seq);
                publish(updates, channel, seq.clone());
            }
            // Hand the emptied buffer back for reuse; if the spare ring is
            // somehow full the buffer is simply dropped here
            events.clear();
            let _ = spares.push(events);
            if done {
                log::info!(
                    "Take finished on channel {}: {} events ({} in final batch)",
                    channel,
                    store.channel(channel as usize).len(),
                    count
                );
            }
        }
        SorterMsg::Clear { channel } => {
            store.clear_channel(channel as usize);
            publish(updates, channel, Vec::new());
            log::info!("Cleared channel {}", channel);
        }
        SorterMsg::ClearAll => {
            for ch in 0..NUM_CHANNELS {
                store.clear_channel(ch);
                publish(updates, ch as u8, Vec::new());
            }
            log::info!("Cleared all channels");
        }
        SorterMsg::Quantize {
            edge,
            op,
            beat_secs,
        } => {
            if shift_edge(store, edge, op, beat_secs) {
                for ch in 0..NUM_CHANNELS {
                    if !store.is_channel_empty(ch) {
                        publish(updates, ch as u8, store.channel(ch).to_vec());
                    }
                }
                log::info!("Applied {:?}/{:?} edit of {:.3}s", edge, op, beat_secs);
            } else {
                log::warn!("Rejected {:?}/{:?} edit of {:.3}s", edge, op, beat_secs);
            }
        }
        SorterMsg::ReplaceAll { store: new_store } => {
            *store = *new_store;
            for ch in 0..NUM_CHANNELS {
                publish(updates, ch as u8, store.channel(ch).to_vec());
            }
            log::info!(
                "Replaced loop store: {} events across {} channels",
                store.total_events(),
                store.non_empty_channels()
            );
        }
        SorterMsg::Snapshot { reply } => {
            let _ = reply.send(store.clone());
        }
        SorterMsg::Shutdown => {}
    }
}

/// Push an update to the audio thread, waiting briefly for ring space.
/// If the audio thread is gone the update is abandoned after a bounded
/// number of attempts so shutdown can never hang on a full ring.
fn publish(updates: &mut rtrb::Producer<LoopUpdate>, channel: u8, events: Vec<TimedEvent>) {
    let mut update = LoopUpdate { channel, events };
    for _ in 0..500 {
        match updates.push(update) {
            Ok(()) => return,
            Err(rtrb::PushError::Full(u)) => {
                update = u;
                std::thread::sleep(Duration::from_millis(1));
            }
        }
    }
    log::warn!("Loop update for channel {} dropped: ring full", channel);
}

impl SorterHandle {
    fn send(&self, msg: SorterMsg) {
        if let Some(tx) = &self.tx {
            if tx.send(msg).is_err() {
                log::warn!("Capture sorter is gone; message dropped");
            }
        }
    }

    pub fn clear_channel(&self, channel: u8) {
        self.send(SorterMsg::Clear { channel });
    }

    pub fn clear_all(&self) {
        self.send(SorterMsg::ClearAll);
    }

    pub fn quantize(&self, edge: LoopEdge, op: EdgeOp, beat_secs: f64) {
        self.send(SorterMsg::Quantize {
            edge,
            op,
            beat_secs,
        });
    }

    pub fn replace_all(&self, store: LoopStore) {
        self.send(SorterMsg::ReplaceAll {
            store: Box::new(store),
        });
    }

    /// Clone the authoritative store (for serialization)
    pub fn snapshot(&self) -> anyhow::Result<LoopStore> {
        let (reply_tx, reply_rx) = flume::bounded(1);
        self.send(SorterMsg::Snapshot { reply: reply_tx });
        reply_rx
            .recv_timeout(Duration::from_secs(2))
            .context("Capture sorter did not answer snapshot request")
    }
}

impl Drop for SorterHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(SorterMsg::Shutdown);
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ShortMessage;
    use std::time::Instant;

    fn ev(note: u8, at: f64) -> TimedEvent {
        TimedEvent::new(ShortMessage::note_on(0, note, 100), at)
    }

    /// Pop updates until one arrives for `channel` with at least `min_len`
    /// events, or panic after a timeout
    fn wait_for_update(
        updates: &mut rtrb::Consumer<LoopUpdate>,
        channel: u8,
        min_len: usize,
    ) -> Vec<TimedEvent> {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut last = None;
        while Instant::now() < deadline {
            while let Ok(u) = updates.pop() {
                if u.channel == channel {
                    last = Some(u.events);
                }
            }
            if last.as_ref().is_some_and(|e| e.len() >= min_len) {
                return last.expect("checked above");
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        panic!("no update of length {} for channel {}", min_len, channel);
    }

    fn assert_invariant(events: &[TimedEvent]) {
        let mut prev = 0.0;
        for (i, e) in events.iter().enumerate() {
            assert!(e.at >= prev, "event {} out of order", i);
            let expected = if i == 0 { 0.0 } else { e.at - prev };
            assert!((e.delta - expected).abs() < 1e-9, "bad delta at {}", i);
            prev = e.at;
        }
    }

    /// 300 pseudo-shuffled events split into two overlapping batches
    fn scrambled_events() -> Vec<TimedEvent> {
        (0..300u32)
            .map(|i| {
                let scrambled = (i * 113) % 300;
                ev((i % 128) as u8, scrambled as f64 * 0.01)
            })
            .collect()
    }

    #[test]
    fn test_batches_merge_sorted_with_correct_deltas() {
        let (handle, mut wiring) = spawn_capture_sorter();
        let all = scrambled_events();

        wiring
            .batch_tx
            .send(SorterMsg::BeginTake { channel: 0 })
            .unwrap();
        wiring
            .batch_tx
            .send(SorterMsg::Batch {
                channel: 0,
                events: all[..170].to_vec(),
                done: false,
            })
            .unwrap();
        wiring
            .batch_tx
            .send(SorterMsg::Batch {
                channel: 0,
                events: all[170..].to_vec(),
                done: true,
            })
            .unwrap();

        let merged = wait_for_update(&mut wiring.updates, 0, 300);
        assert_eq!(merged.len(), 300);
        assert_invariant(&merged);
        drop(handle);
    }

    #[test]
    fn test_final_sequence_independent_of_batch_split() {
        let all = scrambled_events();
        let mut results = Vec::new();

        for split in [150usize, 256] {
            let (handle, mut wiring) = spawn_capture_sorter();
            wiring
                .batch_tx
                .send(SorterMsg::Batch {
                    channel: 5,
                    events: all[..split].to_vec(),
                    done: false,
                })
                .unwrap();
            wiring
                .batch_tx
                .send(SorterMsg::Batch {
                    channel: 5,
                    events: all[split..].to_vec(),
                    done: true,
                })
                .unwrap();
            let merged = wait_for_update(&mut wiring.updates, 5, 300);
            results.push(
                merged
                    .iter()
                    .map(|e| (e.message.data1(), e.at))
                    .collect::<Vec<_>>(),
            );
            drop(handle);
        }

        assert_eq!(results[0], results[1]);
    }

    #[test]
    fn test_clear_publishes_empty_channel() {
        let (handle, mut wiring) = spawn_capture_sorter();
        wiring
            .batch_tx
            .send(SorterMsg::Batch {
                channel: 2,
                events: vec![ev(1, 0.0), ev(2, 1.0)],
                done: true,
            })
            .unwrap();
        wait_for_update(&mut wiring.updates, 2, 2);

        handle.clear_channel(2);
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Ok(u) = wiring.updates.pop() {
                if u.channel == 2 && u.events.is_empty() {
                    break;
                }
            }
            assert!(Instant::now() < deadline, "no empty update for channel 2");
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_snapshot_matches_merged_contents() {
        let (handle, mut wiring) = spawn_capture_sorter();
        wiring
            .batch_tx
            .send(SorterMsg::Batch {
                channel: 7,
                events: vec![ev(3, 0.5), ev(4, 0.25)],
                done: true,
            })
            .unwrap();
        wait_for_update(&mut wiring.updates, 7, 2);

        let snap = handle.snapshot().unwrap();
        let events = snap.channel(7);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].message.data1(), 4);
        assert_invariant(events);
    }

    #[test]
    fn test_quantize_republishes_edited_channels() {
        let (handle, mut wiring) = spawn_capture_sorter();
        wiring
            .batch_tx
            .send(SorterMsg::Batch {
                channel: 1,
                events: vec![ev(1, 0.0), ev(2, 1.0)],
                done: true,
            })
            .unwrap();
        wait_for_update(&mut wiring.updates, 1, 2);

        handle.quantize(LoopEdge::Tail, EdgeOp::Clap, 0.5);
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Ok(u) = wiring.updates.pop() {
                if u.channel == 1 && !u.events.is_empty() && (u.events[1].at - 1.5).abs() < 1e-9 {
                    break;
                }
            }
            assert!(Instant::now() < deadline, "edited channel never republished");
            std::thread::sleep(Duration::from_millis(2));
        }
    }
}
