//! Randomized inputs of a machine: its tick rate, drawn once, and the event
//! chosen on every tick with an empty queue.
//!
//! Machines never see literal ranges. They call [`Sampler`] methods with a
//! [`RateRange`] or [`EventWeights`], so tests can script exact draws.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::VecDeque;
use std::num::NonZeroU32;
use std::time::Duration;

use crate::abstractions::MachineId;
use crate::error::ConfigError;

/// Fastest rate whose tick interval is still at least one nanosecond.
pub const MAX_TICKS_PER_SECOND: u32 = 1_000_000_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TickRate(NonZeroU32);

impl TickRate {
    pub fn new(ticks_per_second: u32) -> Result<Self, ConfigError> {
        check_rate_ceiling(ticks_per_second)?;
        NonZeroU32::new(ticks_per_second)
            .map(Self)
            .ok_or(ConfigError::ZeroRate)
    }

    pub fn per_second(&self) -> u32 {
        self.0.get()
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(1) / self.0.get()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateRange {
    min: u32,
    max: u32,
}

impl RateRange {
    pub fn new(min: u32, max: u32) -> Result<Self, ConfigError> {
        if min == 0 {
            return Err(ConfigError::ZeroRate);
        }
        if min > max {
            return Err(ConfigError::InvertedRateRange { min, max });
        }
        check_rate_ceiling(max)?;
        Ok(Self { min, max })
    }

    pub fn min(&self) -> u32 {
        self.min
    }

    pub fn max(&self) -> u32 {
        self.max
    }
}

fn check_rate_ceiling(ticks_per_second: u32) -> Result<(), ConfigError> {
    if ticks_per_second > MAX_TICKS_PER_SECOND {
        return Err(ConfigError::RateTooHigh {
            rate: ticks_per_second,
            max: MAX_TICKS_PER_SECOND,
        });
    }
    Ok(())
}

impl Default for RateRange {
    fn default() -> Self {
        Self { min: 1, max: 20 }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventChoice {
    Internal,
    SendFirst,
    SendSecond,
    SendBoth,
}

/// Split points of the event-choice probability space.
///
/// A draw `d` in `1..=total()` falls into, in order: send-to-first,
/// send-to-second, send-to-both, internal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EventWeights {
    pub send_first: u32,
    pub send_second: u32,
    pub send_both: u32,
    pub internal: u32,
}

impl EventWeights {
    pub fn new(
        send_first: u32,
        send_second: u32,
        send_both: u32,
        internal: u32,
    ) -> Result<Self, ConfigError> {
        let weights = Self {
            send_first,
            send_second,
            send_both,
            internal,
        };
        weights.validate()?;
        Ok(weights)
    }

    pub fn internal_only() -> Self {
        Self {
            send_first: 0,
            send_second: 0,
            send_both: 0,
            internal: 1,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.total() {
            Some(0) | None => Err(ConfigError::EmptyProbabilitySpace),
            Some(_) => Ok(()),
        }
    }

    pub fn total(&self) -> Option<u32> {
        self.send_first
            .checked_add(self.send_second)?
            .checked_add(self.send_both)?
            .checked_add(self.internal)
    }

    /// Maps a draw in `1..=total()` onto a choice. Draws past the end land
    /// on `Internal`.
    pub fn choice_for(&self, draw: u32) -> EventChoice {
        let mut upper = self.send_first;
        if draw <= upper && self.send_first > 0 {
            return EventChoice::SendFirst;
        }
        upper = upper.saturating_add(self.send_second);
        if draw <= upper && self.send_second > 0 {
            return EventChoice::SendSecond;
        }
        upper = upper.saturating_add(self.send_both);
        if draw <= upper && self.send_both > 0 {
            return EventChoice::SendBoth;
        }
        EventChoice::Internal
    }
}

impl Default for EventWeights {
    fn default() -> Self {
        Self {
            send_first: 1,
            send_second: 1,
            send_both: 1,
            internal: 17,
        }
    }
}

pub trait Sampler: Send + 'static {
    fn sample_rate(&mut self, range: &RateRange) -> TickRate;
    fn sample_event(&mut self, weights: &EventWeights) -> EventChoice;
}

/// ChaCha-backed sampler; the same seed gives the same draws.
#[derive(Clone, Debug)]
pub struct SeededSampler {
    rng: ChaCha8Rng,
}

impl SeededSampler {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    pub fn from_entropy() -> Self {
        Self {
            rng: ChaCha8Rng::from_entropy(),
        }
    }

    /// Independent stream per machine derived from one run seed.
    pub fn for_machine(seed: u64, id: MachineId) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        rng.set_stream(id as u64);
        Self { rng }
    }
}

impl Sampler for SeededSampler {
    fn sample_rate(&mut self, range: &RateRange) -> TickRate {
        let rate = self.rng.gen_range(range.min..=range.max);
        TickRate(NonZeroU32::new(rate).unwrap_or(NonZeroU32::MIN))
    }

    fn sample_event(&mut self, weights: &EventWeights) -> EventChoice {
        match weights.total() {
            Some(total) if total > 0 => weights.choice_for(self.rng.gen_range(1..=total)),
            _ => EventChoice::Internal,
        }
    }
}

/// Replays a fixed sequence of choices. Once the script runs out every
/// further tick is `Internal`; rates fall back to the range minimum.
#[derive(Clone, Debug, Default)]
pub struct ScriptedSampler {
    rates: VecDeque<u32>,
    choices: VecDeque<EventChoice>,
}

impl ScriptedSampler {
    pub fn new(choices: impl IntoIterator<Item = EventChoice>) -> Self {
        Self {
            rates: VecDeque::new(),
            choices: choices.into_iter().collect(),
        }
    }

    pub fn with_rates(mut self, rates: impl IntoIterator<Item = u32>) -> Self {
        self.rates = rates.into_iter().collect();
        self
    }
}

impl Sampler for ScriptedSampler {
    fn sample_rate(&mut self, range: &RateRange) -> TickRate {
        let rate = self
            .rates
            .pop_front()
            .unwrap_or(range.min)
            .clamp(range.min, range.max);
        TickRate(NonZeroU32::new(rate).unwrap_or(NonZeroU32::MIN))
    }

    fn sample_event(&mut self, _weights: &EventWeights) -> EventChoice {
        self.choices.pop_front().unwrap_or(EventChoice::Internal)
    }
}
