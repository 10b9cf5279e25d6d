//! Per-validator gas-power regulation.
//!
//! Each validator continuously accrues gas power proportional to its stake
//! share of `total_per_hour`, banks at most `max_gas_power_period` worth of
//! it, and starts an epoch with a `startup_period` grant. Products are
//! widened to u128 before division so intermediate values cannot overflow;
//! all rounding is toward zero.

use crate::config::GasPowerConfig;
use crate::consensus::event::EventHeader;
use crate::consensus::validators::Validators;
use crate::constants::NANOS_PER_HOUR;
use crate::Address;

/// Static per-validator rates derived from stake and configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ValidatorRates {
    /// Gas power accrued per hour.
    pub per_hour: u64,
    /// Cap on banked gas power.
    pub max_gas_power: u64,
    /// Initial grant for a validator with no prior events.
    pub startup: u64,
}

fn mul_div(value: u64, mul: u64, div: u64) -> u64 {
    ((value as u128) * (mul as u128) / (div as u128)) as u64
}

/// Compute the rates of `validator`. A validator with no stake gets zeros.
pub fn validator_rates(
    cfg: &GasPowerConfig,
    validators: &Validators,
    validator: &Address,
) -> ValidatorRates {
    let stake = validators.get(validator);
    if stake == 0 {
        return ValidatorRates {
            per_hour: 0,
            max_gas_power: 0,
            startup: 0,
        };
    }

    let per_hour = mul_div(cfg.total_per_hour, stake, validators.total_stake());
    let max_gas_power = mul_div(per_hour, cfg.max_gas_power_period, NANOS_PER_HOUR);
    let startup =
        mul_div(per_hour, cfg.startup_period, NANOS_PER_HOUR).max(cfg.min_startup_gas_power);

    ValidatorRates {
        per_hour,
        max_gas_power,
        startup,
    }
}

/// Gas power available to `e`: banked power carried from the self-parent
/// (or the startup grant), plus power accrued since the self-parent's
/// claimed time, capped at the banking limit.
///
/// `prev_epoch_header` is the creator's last confirmed header of the
/// previous epoch, consulted when `e` has no self-parent in this epoch.
pub fn gas_power_available(
    cfg: &GasPowerConfig,
    validators: &Validators,
    e: &EventHeader,
    self_parent: Option<&EventHeader>,
    prev_epoch_header: Option<&EventHeader>,
) -> u64 {
    let rates = validator_rates(cfg, validators, &e.creator);

    let (prior_left, since) = match self_parent {
        Some(parent) => (parent.gas_power_left, Some(parent.claimed_time)),
        None => match prev_epoch_header {
            Some(prev) => (prev.gas_power_left.max(rates.startup), None),
            None => (rates.startup, None),
        },
    };

    let allocated = match since {
        Some(parent_time) => {
            let dt = e.claimed_time.saturating_sub(parent_time);
            mul_div(rates.per_hour, dt, NANOS_PER_HOUR)
        }
        // Without a self-parent there is no accrual interval; the startup
        // grant (or the carried balance) is all the validator has.
        None => 0,
    };

    ((prior_left as u128) + (allocated as u128)).min(rates.max_gas_power as u128) as u64
}
