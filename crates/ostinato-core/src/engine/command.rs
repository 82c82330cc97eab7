//! Lock-free command queue for the audio thread
//!
//! The control layer pushes commands onto an SPSC ringbuffer; the audio
//! thread pops them at the start of each cycle. Neither side ever blocks,
//! so a slow UI can never stall the callback and a busy callback can never
//! stall the UI.

/// Capacity of the command ringbuffer; far beyond what a UI produces in
/// the few milliseconds between cycles
pub const COMMAND_QUEUE_CAPACITY: usize = 64;

/// Commands processed by the audio thread at frame boundaries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineCommand {
    /// Begin a take on one channel (overdubs onto existing content)
    RecordStart { channel: u8 },
    /// Finish the current take
    RecordStop,
    /// Start playback from the loop top, or resume from pause
    Play,
    /// Freeze playback in place
    Pause,
    /// Stop playback, rewind all cursors, release sounding notes
    Stop,
    /// Select bank/program on a channel (sent out and remembered for
    /// take seeding)
    SetProgram { channel: u8, bank: u8, program: u8 },
    /// Emit all-notes-off on every channel with sounding notes
    AllNotesOff,
}

/// Sending half, held by the control layer
pub struct CommandSender {
    producer: rtrb::Producer<EngineCommand>,
}

impl CommandSender {
    /// Queue a command (non-blocking); hands the command back when the
    /// ringbuffer is full
    pub fn send(&mut self, cmd: EngineCommand) -> Result<(), EngineCommand> {
        self.producer.push(cmd).map_err(|rtrb::PushError::Full(c)| c)
    }
}

/// Create the command queue; the consumer goes to the audio thread
pub fn command_channel() -> (CommandSender, rtrb::Consumer<EngineCommand>) {
    let (producer, consumer) = rtrb::RingBuffer::new(COMMAND_QUEUE_CAPACITY);
    (CommandSender { producer }, consumer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commands_flow_in_order() {
        let (mut tx, mut rx) = command_channel();
        tx.send(EngineCommand::Play).unwrap();
        tx.send(EngineCommand::RecordStart { channel: 3 }).unwrap();
        assert_eq!(rx.pop().unwrap(), EngineCommand::Play);
        assert_eq!(rx.pop().unwrap(), EngineCommand::RecordStart { channel: 3 });
        assert!(rx.pop().is_err());
    }

    #[test]
    fn test_full_queue_returns_command() {
        let (mut tx, _rx) = command_channel();
        for _ in 0..COMMAND_QUEUE_CAPACITY {
            tx.send(EngineCommand::Play).unwrap();
        }
        assert_eq!(tx.send(EngineCommand::Stop), Err(EngineCommand::Stop));
    }
}
