pub mod choice;
pub mod clock;
pub mod communication;
pub mod inbound_queue;
pub mod logging;
pub mod process;

use std::fmt;
use std::time::SystemTime;

pub type MachineId = usize;

/// A timestamped message. `clock` is the sender's logical clock right after
/// the increment for the send event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Message {
    pub sender: MachineId,
    pub clock: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EventKind {
    Internal,
    Send {
        targets: Vec<MachineId>,
    },
    Receive {
        from: MachineId,
        sender_clock: u64,
        /// Queue size immediately before the dequeue.
        queue_length: usize,
    },
}

impl EventKind {
    pub fn label(&self) -> &'static str {
        match self {
            EventKind::Internal => "INTERNAL",
            EventKind::Send { .. } => "SEND",
            EventKind::Receive { .. } => "RECEIVE",
        }
    }

    pub fn queue_length(&self) -> Option<usize> {
        match self {
            EventKind::Receive { queue_length, .. } => Some(*queue_length),
            _ => None,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One record per tick, handed to an [`logging::EventSink`].
#[derive(Clone, Debug)]
pub struct EventRecord {
    pub machine_id: MachineId,
    pub timestamp: SystemTime,
    pub kind: EventKind,
    pub logical_clock: u64,
}
