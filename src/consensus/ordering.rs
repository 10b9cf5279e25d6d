//! Fare ordering: from a decided atropos to a deterministic block.
//!
//! The decided frame's atropos confirms its not-yet-confirmed ancestry.
//! Every event gets a consensus time: the stake-weighted median of the
//! claimed times observed by the atropos that first confirms it, clamped
//! to be at or above the previous block's time and at or above each of its
//! parents' consensus times. An event spilled by the block caps keeps its
//! assigned time and is carried into the next block, so the parent clamp
//! holds across spills. Events are ordered by (consensus time, Lamport
//! time, hash), which every honest node computes identically.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::config::ConsensusConfig;
use crate::consensus::event::{EventHeader, EventId};
use crate::consensus::vector::VectorIndex;
use crate::store::{Storage, StorageError};
use crate::{Address, Timestamp};

/// One finalised block of the ledger.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Dense, monotone block number.
    pub index: u64,
    /// Consensus time of the deciding frame.
    pub time: Timestamp,
    pub atropos: EventId,
    pub prev_atropos: EventId,
    /// Confirmed events in application order.
    pub events: Vec<EventId>,
}

/// Result of confirming one decided frame.
#[derive(Clone, Debug)]
pub struct FrameConfirmation {
    /// The atropos's consensus time; the block's `LastConsensusTime`.
    pub block_time: Timestamp,
    /// Retained events in final order, `median_time` assigned.
    pub events: Vec<EventHeader>,
    /// Events pushed out of this block by the caps, to be carried into
    /// the next decided frame.
    pub spilled: Vec<EventId>,
}

/// Confirm the sub-DAG of `atropos`, stamp it onto `frame`, assign
/// consensus times, and produce the block's event order.
///
/// `carried` are the previous block's spilled events; they re-enter this
/// block with the consensus time assigned when they were first confirmed.
/// Over-cap events are spilled tail-first: their confirmation mark is
/// cleared and they are returned for the caller to carry forward. The
/// atropos itself is never spilled.
pub fn confirm_frame<S: Storage>(
    store: &S,
    vi: &VectorIndex,
    frame: u64,
    atropos: &EventId,
    cfg: &ConsensusConfig,
    prev_block_time: Timestamp,
    cheaters: &HashSet<Address>,
    carried: &[EventId],
) -> Result<FrameConfirmation, StorageError> {
    // Walk the unconfirmed ancestry of the atropos, stamping as we go.
    // Carried spills are seeded into the walk: they sit below already
    // confirmed events and may not even be ancestors of this atropos.
    let mut confirmed: Vec<EventHeader> = Vec::new();
    let mut visited: HashSet<EventId> = HashSet::new();
    let mut stack = vec![*atropos];
    stack.extend(carried.iter().copied());
    while let Some(id) = stack.pop() {
        if !visited.insert(id) {
            continue;
        }
        if store.get_confirmed_on(&id)?.is_some() {
            continue;
        }
        store.set_confirmed_on(&id, frame)?;
        let header = store
            .get_event(&id)?
            .expect("confirmed event is stored");
        if let Some(parents) = store.get_parents(&id)? {
            stack.extend(parents);
        }
        confirmed.push(header);
    }

    let frame_time = consensus_time(store, vi, atropos)?.max(prev_block_time);

    // An event first confirmed by this frame gets the frame's median; a
    // carried spill keeps the non-zero time stamped when it was first
    // confirmed.
    let base_time =
        |h: &EventHeader| if h.median_time != 0 { h.median_time } else { frame_time };

    // Total order is (consensus time, Lamport, hash). Carried spills sort
    // ahead of this frame's events by their earlier time; within the
    // frame, (Lamport, hash) decides. Parents always precede children.
    let mut ordered: Vec<(EventId, EventHeader)> = confirmed
        .into_iter()
        .map(|h| (h.id(), h))
        .collect();
    ordered.sort_by(|(a_id, a), (b_id, b)| {
        (base_time(a), a.lamport, a_id).cmp(&(base_time(b), b.lamport, b_id))
    });

    // Assign per-event consensus times and apply the block caps
    // tail-first. Parents sort first, so each clamp reads settled values.
    let mut kept: Vec<EventHeader> = Vec::new();
    let mut spilled: Vec<EventId> = Vec::new();
    let mut assigned: HashMap<EventId, Timestamp> = HashMap::new();
    let mut gas_used = 0u128;
    let mut gas_exhausted = false;
    let mut per_creator: HashMap<Address, u64> = HashMap::new();
    for (id, mut header) in ordered {
        // Clamp the event's time to never precede its parents'. Parents
        // of this walk are either in `assigned` or carry a stored
        // `median_time` from an earlier block.
        let mut time = base_time(&header);
        for p in header.real_parents() {
            if let Some(&parent_time) = assigned.get(&p) {
                time = time.max(parent_time);
            } else if let Some(parent) = store.get_event(&p)? {
                if parent.median_time != 0 {
                    time = time.max(parent.median_time);
                }
            }
        }
        header.median_time = time;
        assigned.insert(id, time);
        // Persisted for spilled events too, so the time survives into the
        // block that finally includes them.
        store.update_event(&header)?;

        let creator_count = per_creator.entry(header.creator).or_insert(0);
        let over_creator_cap = *creator_count >= cfg.max_validator_events_in_block;
        if !gas_exhausted
            && gas_used + header.gas_power_used as u128 > cfg.block_gas_hard_limit as u128
        {
            gas_exhausted = true;
        }
        if (gas_exhausted || over_creator_cap) && id != *atropos {
            store.clear_confirmed_on(&id)?;
            spilled.push(id);
            continue;
        }
        *creator_count += 1;
        gas_used += header.gas_power_used as u128;

        // Track the highest-seq confirmed event per honest creator.
        if !cheaters.contains(&header.creator) {
            let newer = match store.get_last_header(&header.creator)? {
                Some(prev) => header.seq > prev.seq,
                None => true,
            };
            if newer {
                store.set_last_header(&header)?;
            }
        }
        kept.push(header);
    }

    let block_time = assigned
        .get(atropos)
        .copied()
        .expect("atropos is confirmed in its own frame");
    Ok(FrameConfirmation {
        block_time,
        events: kept,
        spilled,
    })
}

/// Stake-weighted median of the claimed times the atropos observed, one
/// sample per validator. Fork-flagged validators are excluded; the median
/// is the smallest time at which the running stake exceeds half of the
/// counted stake.
fn consensus_time<S: Storage>(
    store: &S,
    vi: &VectorIndex,
    atropos: &EventId,
) -> Result<Timestamp, StorageError> {
    let hb = vi
        .highest_before(atropos)
        .expect("atropos is vector-indexed");
    let validators = vi.validators();

    let mut samples: Vec<(Timestamp, u64)> = Vec::with_capacity(validators.len());
    let mut counted_stake = 0u64;
    for (slot, entry) in hb.iter().enumerate() {
        if entry.seq == 0 || entry.fork {
            continue;
        }
        let observed = store
            .get_event(&entry.id)?
            .expect("observed event is stored");
        let stake = validators.stake_at(slot);
        samples.push((observed.claimed_time, stake));
        counted_stake += stake;
    }
    if samples.is_empty() {
        // The atropos observes at least itself unless its own slot is
        // forked; fall back to its claimed time.
        let own = store
            .get_event(atropos)?
            .expect("atropos is stored");
        return Ok(own.claimed_time);
    }

    samples.sort_unstable();
    let mut acc = 0u64;
    for (time, stake) in &samples {
        acc += stake;
        if (acc as u128) * 2 > counted_stake as u128 {
            return Ok(*time);
        }
    }
    Ok(samples.last().expect("samples non-empty").0)
}
