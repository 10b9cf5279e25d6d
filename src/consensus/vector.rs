//! Causal vector clocks and the forkless-cause relation.
//!
//! For every inserted event `e` the index maintains:
//! - `highest_before[e][v]` — the highest sequence number (and hash) of a
//!   `v`-authored event in `e`'s causal past, with a fork flag set when that
//!   past contains two incomparable `v`-events;
//! - `lowest_after[e][v]` — the lowest sequence number of a `v`-authored
//!   event that has `e` in its past, back-propagated as events arrive.
//!
//! `a` forkless-causes `b` when validators holding a quorum of stake have
//! observed `b` (their lowest-after entry of `b` is at or below what `a`
//! knows of them) without any fork of theirs visible to `a`. The relation
//! is a function of `a`'s causal past alone, so every honest node computes
//! identical answers regardless of delivery order.
//!
//! All caches key events by hash; no in-memory parent pointers exist
//! (events form cycles of references only through the store).

use std::collections::HashMap;

use crate::consensus::event::{EventHeader, EventId};
use crate::consensus::validators::Validators;
use crate::Address;

/// One component of a highest-before vector. `seq == 0` means "no event of
/// this validator observed".
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HbEntry {
    pub seq: u64,
    /// Hash of the observed highest event, for fork discrimination and
    /// consensus-time lookups.
    pub id: EventId,
    /// Two incomparable events of this validator exist in the observer's
    /// past.
    pub fork: bool,
}

impl Default for HbEntry {
    fn default() -> Self {
        HbEntry {
            seq: 0,
            id: crate::consensus::event::ZERO_EVENT,
            fork: false,
        }
    }
}

/// Evidence of a fork: a second event occupying an already-seen
/// `(creator, seq)` slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ForkEvidence {
    pub creator: Address,
    pub seq: u64,
    pub existing: EventId,
    pub forked: EventId,
}

#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
pub enum VectorError {
    #[error("creator {} has no validator slot", hex::encode(.0))]
    UnknownCreator(Address),
    #[error("parent {0:?} is not indexed")]
    MissingParent(EventId),
    #[error("event {0:?} is already indexed")]
    AlreadyIndexed(EventId),
}

struct EventMeta {
    slot: usize,
    seq: u64,
    self_parent: Option<EventId>,
    parents: Vec<EventId>,
}

/// The epoch-scoped vector-clock index.
pub struct VectorIndex {
    validators: Validators,
    events: HashMap<EventId, EventMeta>,
    highest_before: HashMap<EventId, Vec<HbEntry>>,
    lowest_after: HashMap<EventId, Vec<u64>>,
    /// `(slot, seq)` → event hashes; more than one entry is a fork.
    seq_index: HashMap<(usize, u64), Vec<EventId>>,
    /// Per slot: the lowest sequence at which a fork has been observed.
    fork_points: Vec<Option<u64>>,
}

impl VectorIndex {
    pub fn new(validators: Validators) -> Self {
        let n = validators.len();
        VectorIndex {
            validators,
            events: HashMap::new(),
            highest_before: HashMap::new(),
            lowest_after: HashMap::new(),
            seq_index: HashMap::new(),
            fork_points: vec![None; n],
        }
    }

    /// Erase all state and adopt the next epoch's validator set.
    pub fn reset(&mut self, validators: Validators) {
        *self = VectorIndex::new(validators);
    }

    pub fn contains(&self, id: &EventId) -> bool {
        self.events.contains_key(id)
    }

    /// Known hashes occupying `(creator, seq)`; used by the checker for
    /// duplicate/fork classification.
    pub fn events_at(&self, creator: &Address, seq: u64) -> &[EventId] {
        self.validators
            .slot(creator)
            .and_then(|slot| self.seq_index.get(&(slot, seq)))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Index a checked event. Parents must already be indexed. Returns fork
    /// evidence if the event occupies a taken `(creator, seq)` slot.
    pub fn insert(&mut self, header: &EventHeader) -> Result<Option<ForkEvidence>, VectorError> {
        let id = header.id();
        if self.events.contains_key(&id) {
            return Err(VectorError::AlreadyIndexed(id));
        }
        let slot = self
            .validators
            .slot(&header.creator)
            .ok_or(VectorError::UnknownCreator(header.creator))?;
        let n = self.validators.len();

        let parents: Vec<EventId> = header.real_parents().collect();
        for p in &parents {
            if !self.events.contains_key(p) {
                return Err(VectorError::MissingParent(*p));
            }
        }

        // Fork detection before the merge, so the fork point is visible to
        // this event's own highest-before computation.
        let taken = self.seq_index.entry((slot, header.seq)).or_default();
        let evidence = taken.first().filter(|&&existing| existing != id).map(|&existing| {
            ForkEvidence {
                creator: header.creator,
                seq: header.seq,
                existing,
                forked: id,
            }
        });
        taken.push(id);
        if evidence.is_some() {
            let fp = &mut self.fork_points[slot];
            *fp = Some(fp.map_or(header.seq, |cur| cur.min(header.seq)));
            tracing::warn!(
                creator = %hex::encode(header.creator),
                seq = header.seq,
                "Fork observed: two events occupy one creator slot"
            );
        }

        // Highest-before: merge the parents' vectors, then the event itself.
        let mut hb = vec![HbEntry::default(); n];
        for p in &parents {
            let hb_p = self.highest_before[p].clone();
            for v in 0..n {
                hb[v] = self.merge_entry(v, hb[v], hb_p[v]);
            }
        }
        hb[slot] = self.merge_own_entry(slot, hb[slot], header, id);

        // Lowest-after: the event sees itself; back-propagate through its
        // ancestry, pruning where an equal-or-lower seq is already set.
        let mut la = vec![0u64; n];
        la[slot] = header.seq;
        self.lowest_after.insert(id, la);

        let mut stack: Vec<EventId> = parents.clone();
        while let Some(x) = stack.pop() {
            let la_x = self
                .lowest_after
                .get_mut(&x)
                .expect("ancestor indexed before descendant");
            if la_x[slot] != 0 && la_x[slot] <= header.seq {
                continue;
            }
            la_x[slot] = header.seq;
            stack.extend(self.events[&x].parents.iter().copied());
        }

        self.highest_before.insert(id, hb);
        self.events.insert(
            id,
            EventMeta {
                slot,
                seq: header.seq,
                self_parent: header.self_parent(),
                parents,
            },
        );
        Ok(evidence)
    }

    /// Merge two highest-before components for validator slot `v`.
    fn merge_entry(&self, v: usize, a: HbEntry, b: HbEntry) -> HbEntry {
        if a.seq == 0 {
            return b;
        }
        if b.seq == 0 {
            return a;
        }
        let mut fork = a.fork || b.fork;
        let (hi, lo) = if a.seq >= b.seq { (a, b) } else { (b, a) };
        if hi.seq == lo.seq {
            if hi.id != lo.id {
                fork = true;
            }
            return HbEntry {
                seq: hi.seq,
                id: hi.id.min(lo.id),
                fork,
            };
        }
        // Unequal seqs are only ambiguous once a fork of `v` is on record;
        // with a single chain the lower entry is always an ancestor of the
        // higher one.
        if !fork {
            if let Some(fp) = self.fork_points[v] {
                if fp <= lo.seq && self.self_ancestor_at(&hi.id, lo.seq) != Some(lo.id) {
                    fork = true;
                }
            }
        }
        HbEntry {
            seq: hi.seq,
            id: hi.id,
            fork,
        }
    }

    /// Merge the event's own `(seq, id)` into what its parents saw of its
    /// creator. Handled apart from `merge_entry` because the event itself
    /// is not indexed yet, so branch walks must start at the self-parent.
    fn merge_own_entry(
        &self,
        slot: usize,
        seen: HbEntry,
        header: &EventHeader,
        id: EventId,
    ) -> HbEntry {
        if seen.seq == 0 {
            return HbEntry {
                seq: header.seq,
                id,
                fork: false,
            };
        }
        if seen.seq >= header.seq {
            // The parents already saw a creator event at or above this
            // event's own seq; that event cannot be a self-ancestor, so the
            // two are incomparable.
            return HbEntry {
                seq: seen.seq.max(header.seq),
                id: seen.id,
                fork: true,
            };
        }
        let mut fork = seen.fork;
        if !fork {
            if let Some(fp) = self.fork_points[slot] {
                if fp <= seen.seq {
                    let ancestor = header
                        .self_parent()
                        .and_then(|sp| self.self_ancestor_at(&sp, seen.seq));
                    if ancestor != Some(seen.id) {
                        fork = true;
                    }
                }
            }
        }
        HbEntry {
            seq: header.seq,
            id,
            fork,
        }
    }

    /// Walk the self-parent chain of `tip` down to `seq`.
    pub fn self_ancestor_at(&self, tip: &EventId, seq: u64) -> Option<EventId> {
        let mut cur = *tip;
        loop {
            let meta = self.events.get(&cur)?;
            if meta.seq == seq {
                return Some(cur);
            }
            if meta.seq < seq {
                return None;
            }
            cur = meta.self_parent?;
        }
    }

    /// The highest-before vector of an indexed event.
    pub fn highest_before(&self, id: &EventId) -> Option<&[HbEntry]> {
        self.highest_before.get(id).map(Vec::as_slice)
    }

    /// Stake-weighted causal observation: true iff validators carrying a
    /// quorum of stake have `b` in the past of events that `a` knows of,
    /// with no fork of theirs visible to `a`. The relation is false
    /// outright when `a` sees a fork by `b`'s own creator — neither branch
    /// of a forked slot can be trusted as observed.
    pub fn forkless_cause(&self, a: &EventId, b: &EventId) -> bool {
        let (Some(hb_a), Some(la_b)) = (self.highest_before.get(a), self.lowest_after.get(b))
        else {
            return false;
        };
        let Some(meta_b) = self.events.get(b) else {
            return false;
        };
        if hb_a[meta_b.slot].fork {
            return false;
        }

        let mut observing_stake = 0u64;
        for v in 0..self.validators.len() {
            let hb = hb_a[v];
            let la = la_b[v];
            if la != 0 && la <= hb.seq && !hb.fork {
                observing_stake += self.validators.stake_at(v);
            }
        }
        self.validators.has_quorum(observing_stake)
    }

    /// True once a fork by the validator in `slot` has been observed.
    pub fn fork_registered(&self, slot: usize) -> bool {
        self.fork_points[slot].is_some()
    }

    pub fn validators(&self) -> &Validators {
        &self.validators
    }
}
