use thiserror::Error;

use crate::abstractions::MachineId;

/// A message could not be handed to a peer. The message is lost.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("machine {0} is not a known peer")]
    UnknownPeer(MachineId),
    #[error("no connection to machine {0}")]
    NotConnected(MachineId),
    #[error("machine {0} has stopped")]
    PeerStopped(MachineId),
}

/// Rejected configuration, reported before any machine starts.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("tick rate must be at least 1 tick per second")]
    ZeroRate,
    #[error("tick rate range is inverted: min {min} > max {max}")]
    InvertedRateRange { min: u32, max: u32 },
    #[error("tick rate {rate} exceeds the maximum of {max} ticks per second")]
    RateTooHigh { rate: u32, max: u32 },
    #[error("event weights sum to zero")]
    EmptyProbabilitySpace,
    #[error("expected four comma-separated weights, got {0:?}")]
    InvalidWeights(String),
    #[error("at least 2 machines are required, got {0}")]
    TooFewMachines(usize),
    #[error("run duration must be non-zero")]
    ZeroDuration,
    #[error("invalid peer: {0}")]
    InvalidPeer(String),
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed wire message: {0}")]
    Json(#[from] serde_json::Error),
    #[error("clock {0} cannot be advanced past")]
    ClockExhausted(u64),
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("machine {0} crashed")]
    Crash(MachineId),
}

#[derive(Debug, Error)]
pub enum SimulationError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
