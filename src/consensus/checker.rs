//! Layered event validation.
//!
//! Checks run in a fixed order and the first failure aborts without
//! touching storage: structural limits, epoch match, parent presence,
//! signature, gas power, and finally the heavy relational checks against
//! the resolved parents. Fork detection is part of the heavy layer but is
//! not a failure — the event is still stored and the creator flagged.

use std::collections::BTreeMap;

use crate::config::{ConsensusConfig, GasPowerConfig};
use crate::consensus::event::{EventHeader, EventId};
use crate::consensus::gas;
use crate::consensus::validators::Validators;
use crate::consensus::vector::VectorIndex;
use crate::consensus::ConsensusError;
use crate::crypto::keys::SigningPublicKey;
use crate::store::Storage;
use crate::Address;

/// Everything the check pipeline consults.
pub struct CheckContext<'a, S: Storage> {
    pub store: &'a S,
    pub vi: &'a VectorIndex,
    pub validators: &'a Validators,
    pub keys: &'a BTreeMap<Address, SigningPublicKey>,
    pub consensus: &'a ConsensusConfig,
    pub gas: &'a GasPowerConfig,
    pub epoch: u64,
    /// Last confirmed headers of the previous epoch, for the gas
    /// regulator's carry-over rule.
    pub prev_epoch_headers: &'a BTreeMap<Address, EventHeader>,
}

/// Result of a passed check pipeline.
#[derive(Clone, Debug, Default)]
pub struct CheckOutcome {
    /// Set when the event occupies a `(creator, seq)` slot already taken
    /// by a different hash. The event is stored regardless; the engine
    /// flags the creator.
    pub forks_with: Option<EventId>,
}

/// Run every validation layer against `e`.
pub fn check<S: Storage>(
    ctx: &CheckContext<'_, S>,
    e: &EventHeader,
) -> Result<CheckOutcome, ConsensusError> {
    check_basic(ctx, e)?;
    check_epoch(ctx, e)?;
    let parents = check_parents(ctx, e)?;
    check_signature(ctx, e)?;
    check_gas(ctx, e, &parents)?;
    check_heavy(ctx, e, &parents)
}

/// Structural limits that need no storage access.
fn check_basic<S: Storage>(
    ctx: &CheckContext<'_, S>,
    e: &EventHeader,
) -> Result<(), ConsensusError> {
    if e.seq == 0 {
        return Err(ConsensusError::BadStructure("seq must be >= 1"));
    }
    if e.parents.len() > ctx.consensus.max_parents {
        return Err(ConsensusError::BadStructure("too many parents"));
    }
    if e.extra.len() > crate::constants::MAX_EXTRA_BYTES {
        return Err(ConsensusError::BadStructure("extra exceeds 2 KiB"));
    }
    if e.frame != 0 || e.is_root || e.median_time != 0 {
        return Err(ConsensusError::BadStructure(
            "computed fields must be unset on ingress",
        ));
    }
    let mut seen = std::collections::HashSet::new();
    for (i, p) in e.parents.iter().enumerate() {
        if p.is_zero() {
            if i != 0 {
                return Err(ConsensusError::BadStructure(
                    "zero hash outside the self-parent slot",
                ));
            }
            continue;
        }
        if !seen.insert(*p) {
            return Err(ConsensusError::BadStructure("duplicate parent"));
        }
    }
    if e.sig.is_empty() {
        return Err(ConsensusError::BadStructure("missing signature"));
    }
    Ok(())
}

/// Stale or future events are reported as a mismatch, before parent
/// resolution can misclassify them as missing-parent.
fn check_epoch<S: Storage>(
    ctx: &CheckContext<'_, S>,
    e: &EventHeader,
) -> Result<(), ConsensusError> {
    if e.epoch != ctx.epoch {
        return Err(ConsensusError::EpochMismatch {
            event: e.epoch,
            current: ctx.epoch,
        });
    }
    Ok(())
}

/// Resolve every parent from the epoch's store.
fn check_parents<S: Storage>(
    ctx: &CheckContext<'_, S>,
    e: &EventHeader,
) -> Result<Vec<EventHeader>, ConsensusError> {
    let mut parents = Vec::with_capacity(e.parents.len());
    for p in e.real_parents() {
        match ctx.store.get_event(&p)? {
            Some(header) => parents.push(header),
            None => return Err(ConsensusError::MissingParent(p)),
        }
    }
    Ok(parents)
}

fn check_signature<S: Storage>(
    ctx: &CheckContext<'_, S>,
    e: &EventHeader,
) -> Result<(), ConsensusError> {
    let key = ctx.keys.get(&e.creator).ok_or(ConsensusError::BadSignature)?;
    if !ctx.validators.contains(&e.creator) {
        return Err(ConsensusError::BadSignature);
    }
    if !e.verify_signature(key) {
        return Err(ConsensusError::BadSignature);
    }
    Ok(())
}

/// Recompute the regulator's view and demand the creator agreed with it.
fn check_gas<S: Storage>(
    ctx: &CheckContext<'_, S>,
    e: &EventHeader,
    parents: &[EventHeader],
) -> Result<(), ConsensusError> {
    let self_parent = e
        .self_parent()
        .and_then(|sp| parents.iter().find(|p| p.id() == sp));
    let prev = ctx.prev_epoch_headers.get(&e.creator);
    let available = gas::gas_power_available(ctx.gas, ctx.validators, e, self_parent, prev);

    let computed = match available.checked_sub(e.gas_power_used) {
        Some(left) => left,
        None => {
            return Err(ConsensusError::GasMismatch {
                claimed: e.gas_power_left,
                computed: 0,
            })
        }
    };
    if e.gas_power_left != computed {
        return Err(ConsensusError::GasMismatch {
            claimed: e.gas_power_left,
            computed,
        });
    }
    Ok(())
}

/// Relational checks against the resolved parents, plus fork detection.
fn check_heavy<S: Storage>(
    ctx: &CheckContext<'_, S>,
    e: &EventHeader,
    parents: &[EventHeader],
) -> Result<CheckOutcome, ConsensusError> {
    match e.self_parent() {
        Some(sp) => {
            let sp_header = parents
                .iter()
                .find(|p| p.id() == sp)
                .expect("self-parent resolved by the parents layer");
            if sp_header.creator != e.creator {
                return Err(ConsensusError::BadStructure(
                    "self-parent by a different creator",
                ));
            }
            if e.seq != sp_header.seq + 1 {
                return Err(ConsensusError::BadStructure(
                    "seq must increment the self-parent's",
                ));
            }
            if e.claimed_time <= sp_header.claimed_time {
                return Err(ConsensusError::BadStructure(
                    "claimed time must advance the self-parent's",
                ));
            }
        }
        None => {
            if e.seq != 1 {
                return Err(ConsensusError::BadStructure(
                    "first event of a creator must have seq 1",
                ));
            }
        }
    }

    let expected_lamport = parents
        .iter()
        .map(|p| p.lamport)
        .max()
        .map(|max| max + 1)
        .unwrap_or(0);
    if e.lamport != expected_lamport {
        return Err(ConsensusError::BadStructure(
            "lamport must be 1 + max parent lamport",
        ));
    }

    let id = e.id();
    let forks_with = ctx
        .vi
        .events_at(&e.creator, e.seq)
        .iter()
        .find(|&&other| other != id)
        .copied();
    Ok(CheckOutcome { forks_with })
}
