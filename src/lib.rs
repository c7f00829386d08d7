//! Asynchronous machines exchanging timestamped messages and keeping
//! Lamport logical clocks.
//!
//! ```text
//! Coordinator
//!   ├─ Machine 1 ── LamportClock, InboundQueue, Sampler
//!   ├─ Machine 2        │
//!   └─ Machine N        └─ LinkSender ──> peer InboundQueue
//!          │
//!          └─ EventSink ──> EventLogger (vm_<id>_trial<n>.log)
//! ```

pub mod abstractions;
pub mod config;
pub mod coordinator;
pub mod error;

pub use abstractions::clock::LamportClock;
pub use abstractions::inbound_queue::{Dequeued, InboundQueue};
pub use abstractions::process::{Machine, MachineReport, MachineState};
pub use abstractions::{EventKind, EventRecord, MachineId, Message};
pub use config::SimulationConfig;
pub use coordinator::{Coordinator, SimulationReport};
