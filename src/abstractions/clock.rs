use std::cmp::max;

/// Lamport logical clock for a single machine.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LamportClock {
    value: u64,
}

impl LamportClock {
    pub fn new() -> Self {
        Self { value: 0 }
    }

    pub fn starting_at(value: u64) -> Self {
        Self { value }
    }

    pub fn value(&self) -> u64 {
        self.value
    }

    /// Local or send event. Saturates at `u64::MAX`.
    pub fn advance(&mut self) -> u64 {
        self.value = self.value.saturating_add(1);
        self.value
    }

    /// Receive event. Always increments, even when `remote` is behind.
    pub fn observe(&mut self, remote: u64) -> u64 {
        self.value = max(self.value, remote).saturating_add(1);
        self.value
    }
}
