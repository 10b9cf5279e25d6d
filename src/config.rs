//! Configuration file support for the consensus engine.
//!
//! Loads optional `moira.toml` from the data directory. Host-provided values
//! override config file values. If no config file exists, defaults are used.

use serde::Deserialize;
use std::path::Path;

use crate::constants::{NANOS_PER_HOUR, NANOS_PER_SECOND};

/// Top-level configuration.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct MoiraConfig {
    pub consensus: ConsensusConfig,
    pub gas_power: GasPowerConfig,
}

/// Consensus engine tuning.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    /// Number of decided frames before the epoch is sealed.
    pub epoch_len: u64,
    /// Hard upper bound on parent references per event.
    pub max_parents: usize,
    /// Cap on events by a single creator placed in one block.
    pub max_validator_events_in_block: u64,
    /// Total gas budget of one block; ordered events past it are spilled
    /// tail-first into the next decided frame.
    pub block_gas_hard_limit: u64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        ConsensusConfig {
            epoch_len: 100,
            max_parents: crate::constants::MAX_PARENTS,
            max_validator_events_in_block: 10,
            block_gas_hard_limit: 22_000_000,
        }
    }
}

/// Gas-power regulator tuning. Periods are in nanoseconds.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct GasPowerConfig {
    /// Gas power allocated per hour across the whole validator set.
    pub total_per_hour: u64,
    /// Accumulation window: a validator may bank at most
    /// `per_hour * max_gas_power_period / 1h` of unspent power.
    pub max_gas_power_period: u64,
    /// Window used to compute the initial grant of a fresh validator.
    pub startup_period: u64,
    /// Floor on the initial grant, so tiny stakes can still emit.
    pub min_startup_gas_power: u64,
}

impl Default for GasPowerConfig {
    fn default() -> Self {
        GasPowerConfig {
            total_per_hour: 50_000_000,
            max_gas_power_period: 5 * 60 * NANOS_PER_SECOND,
            startup_period: 5 * NANOS_PER_SECOND,
            min_startup_gas_power: 20_000,
        }
    }
}

impl MoiraConfig {
    /// Load configuration from `moira.toml` in the given directory.
    /// Returns `Default` if the file doesn't exist.
    pub fn load(data_dir: &Path) -> Self {
        let config_path = data_dir.join("moira.toml");
        match std::fs::read_to_string(&config_path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {}", config_path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!(
                        "Failed to parse {}: {}, using defaults",
                        config_path.display(),
                        e
                    );
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }
}

impl GasPowerConfig {
    /// Sanity bound: the per-hour total times the accumulation period must
    /// not overflow the widening arithmetic of the regulator.
    pub fn is_sane(&self) -> bool {
        self.max_gas_power_period <= 24 * NANOS_PER_HOUR
            && self.startup_period <= self.max_gas_power_period
    }
}
