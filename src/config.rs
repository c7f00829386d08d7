use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::abstractions::choice::{EventWeights, RateRange};
use crate::abstractions::MachineId;
use crate::error::ConfigError;

/// Everything the coordinator needs to run one trial in-process.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SimulationConfig {
    pub machines: usize,
    pub rates: RateRange,
    pub weights: EventWeights,
    /// `None` runs until cancelled.
    pub duration: Option<Duration>,
    pub trial: u32,
    /// Fixed seed for reproducible rates and choices; entropy otherwise.
    pub seed: Option<u64>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            machines: 3,
            rates: RateRange::default(),
            weights: EventWeights::default(),
            duration: Some(Duration::from_secs(60)),
            trial: 1,
            seed: None,
        }
    }
}

impl SimulationConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.machines < 2 {
            return Err(ConfigError::TooFewMachines(self.machines));
        }
        RateRange::new(self.rates.min(), self.rates.max())?;
        self.weights.validate()?;
        validate_duration(self.duration)
    }
}

/// A single machine talking to its peers over TCP.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeConfig {
    pub id: MachineId,
    pub listen: SocketAddr,
    pub peers: BTreeMap<MachineId, SocketAddr>,
    pub rates: RateRange,
    pub weights: EventWeights,
    pub duration: Option<Duration>,
    pub trial: u32,
    pub seed: Option<u64>,
    pub connect_retry: Duration,
}

impl NodeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.peers.is_empty() {
            return Err(ConfigError::InvalidPeer("no peers configured".to_string()));
        }
        if self.peers.contains_key(&self.id) {
            return Err(ConfigError::InvalidPeer(format!(
                "machine {} listed as its own peer",
                self.id
            )));
        }
        RateRange::new(self.rates.min(), self.rates.max())?;
        self.weights.validate()?;
        validate_duration(self.duration)
    }
}

fn validate_duration(duration: Option<Duration>) -> Result<(), ConfigError> {
    match duration {
        Some(duration) if duration.is_zero() => Err(ConfigError::ZeroDuration),
        _ => Ok(()),
    }
}

/// `send_first,send_second,send_both,internal`, e.g. `1,1,1,17`.
impl FromStr for EventWeights {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts = s
            .split(',')
            .map(|part| part.trim().parse::<u32>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| ConfigError::InvalidWeights(s.to_string()))?;
        match parts.as_slice() {
            [first, second, both, internal] => EventWeights::new(*first, *second, *both, *internal),
            _ => Err(ConfigError::InvalidWeights(s.to_string())),
        }
    }
}

/// `<id>=<host:port>`, e.g. `2=127.0.0.1:8002`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PeerAddr {
    pub id: MachineId,
    pub addr: SocketAddr,
}

impl FromStr for PeerAddr {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (id, addr) = s
            .split_once('=')
            .ok_or_else(|| ConfigError::InvalidPeer(s.to_string()))?;
        let id: MachineId = id
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidPeer(s.to_string()))?;
        let addr: SocketAddr = addr
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidPeer(s.to_string()))?;
        Ok(Self { id, addr })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert_eq!(SimulationConfig::default().validate(), Ok(()));
    }

    #[test]
    fn rejects_single_machine() {
        let config = SimulationConfig {
            machines: 1,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::TooFewMachines(1)));
    }

    #[test]
    fn rejects_empty_probability_space() {
        let config = SimulationConfig {
            weights: EventWeights {
                send_first: 0,
                send_second: 0,
                send_both: 0,
                internal: 0,
            },
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::EmptyProbabilitySpace));
    }

    #[test]
    fn rejects_zero_duration_but_allows_unbounded() {
        let zero = SimulationConfig {
            duration: Some(Duration::ZERO),
            ..Default::default()
        };
        assert_eq!(zero.validate(), Err(ConfigError::ZeroDuration));

        let unbounded = SimulationConfig {
            duration: None,
            ..Default::default()
        };
        assert_eq!(unbounded.validate(), Ok(()));
    }

    #[test]
    fn parses_weights() {
        let weights: EventWeights = "2, 0, 1, 7".parse().unwrap();
        assert_eq!(weights, EventWeights::new(2, 0, 1, 7).unwrap());
        assert_eq!(
            "1,2,3".parse::<EventWeights>(),
            Err(ConfigError::InvalidWeights("1,2,3".to_string()))
        );
        assert_eq!(
            "0,0,0,0".parse::<EventWeights>(),
            Err(ConfigError::EmptyProbabilitySpace)
        );
    }

    #[test]
    fn parses_peer_addresses() {
        let peer: PeerAddr = "2=127.0.0.1:8002".parse().unwrap();
        assert_eq!(peer.id, 2);
        assert_eq!(peer.addr, "127.0.0.1:8002".parse().unwrap());
        assert!("127.0.0.1:8002".parse::<PeerAddr>().is_err());
        assert!("x=127.0.0.1:8002".parse::<PeerAddr>().is_err());
    }

    #[test]
    fn node_cannot_peer_with_itself() {
        let addr: SocketAddr = "127.0.0.1:8001".parse().unwrap();
        let config = NodeConfig {
            id: 1,
            listen: addr,
            peers: BTreeMap::from([(1, addr)]),
            rates: RateRange::default(),
            weights: EventWeights::default(),
            duration: None,
            trial: 1,
            seed: None,
            connect_retry: Duration::from_secs(2),
        };
        assert!(matches!(config.validate(), Err(ConfigError::InvalidPeer(_))));
    }
}
