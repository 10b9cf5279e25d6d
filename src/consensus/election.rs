//! The atropos election: per-frame BFT voting over roots.
//!
//! The election decides one frame at a time. Roots of the next frame cast
//! direct votes — yes for a subject creator iff they forkless-cause one of
//! its roots at the frame to decide. Roots two or more frames up aggregate
//! the votes of the previous frame's roots they forkless-cause, weighted by
//! voter stake; a side carrying a quorum decides the subject. Ties go to
//! yes. Once every creator is decided, the frame is finalised and the
//! decided-yes root of the first creator in canonical validator order
//! becomes the atropos.

use std::collections::{HashMap, HashSet};

use crate::consensus::event::EventId;
use crate::consensus::validators::Validators;
use crate::consensus::vector::VectorIndex;
use crate::store::{Storage, StorageError};
use crate::Address;

/// A root under election processing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RootAndSlot {
    pub id: EventId,
    pub creator: Address,
    pub frame: u64,
}

/// One cached vote of a root about a subject creator's root at the frame
/// to decide.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct VoteValue {
    yes: bool,
    decided: bool,
    /// The subject root the yes side stands for.
    observed: Option<EventId>,
}

/// Outcome of a finalised frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ElectionRes {
    pub frame: u64,
    pub atropos: EventId,
}

/// Election state for the single frame currently being decided.
pub struct Election {
    validators: Validators,
    frame_to_decide: u64,
    /// Cache keyed by (voter root, subject creator).
    votes: HashMap<(EventId, Address), VoteValue>,
    decided: HashMap<Address, VoteValue>,
}

impl Election {
    pub fn new(validators: Validators, frame_to_decide: u64) -> Self {
        Election {
            validators,
            frame_to_decide,
            votes: HashMap::new(),
            decided: HashMap::new(),
        }
    }

    /// Erase the election state, preparing to decide `frame_to_decide`.
    pub fn reset(&mut self, validators: Validators, frame_to_decide: u64) {
        *self = Election::new(validators, frame_to_decide);
    }

    pub fn frame_to_decide(&self) -> u64 {
        self.frame_to_decide
    }

    /// Account a newly recorded root. Returns the election result once the
    /// frame to decide is finalised.
    pub fn process_root<S: Storage>(
        &mut self,
        vi: &VectorIndex,
        store: &S,
        root: RootAndSlot,
    ) -> Result<Option<ElectionRes>, StorageError> {
        let d = self.frame_to_decide;
        if root.frame <= d {
            return Ok(None);
        }

        let subjects: Vec<Address> = self
            .validators
            .addresses()
            .filter(|c| !self.decided.contains_key(c))
            .collect();

        for subject in subjects {
            let vote = if root.frame == d + 1 {
                self.direct_vote(vi, store, &root, &subject, d)?
            } else {
                self.aggregated_vote(vi, store, &root, &subject)?
            };

            self.votes.insert((root.id, subject), vote);
            if vote.decided {
                tracing::debug!(
                    frame = d,
                    subject = %hex::encode(subject),
                    yes = vote.yes,
                    "Election decided a subject"
                );
                self.decided.insert(subject, vote);
            }
        }

        if self.decided.len() == self.validators.len() {
            return Ok(Some(self.finalize(d)));
        }
        Ok(None)
    }

    /// First-round vote: direct observation of the subject's root.
    /// Same-slot fork roots are probed in hash order, so the smallest
    /// observed hash wins deterministically.
    fn direct_vote<S: Storage>(
        &self,
        vi: &VectorIndex,
        store: &S,
        root: &RootAndSlot,
        subject: &Address,
        d: u64,
    ) -> Result<VoteValue, StorageError> {
        let observed = store
            .roots_of(d, subject)?
            .into_iter()
            .find(|candidate| vi.forkless_cause(&root.id, candidate));
        Ok(VoteValue {
            yes: observed.is_some(),
            decided: false,
            observed,
        })
    }

    /// Later-round vote: stake-weighted aggregation of the previous
    /// frame's roots this root forkless-causes. Voters whose creator is
    /// fork-flagged in the root's causal past are excluded.
    fn aggregated_vote<S: Storage>(
        &self,
        vi: &VectorIndex,
        store: &S,
        root: &RootAndSlot,
        subject: &Address,
    ) -> Result<VoteValue, StorageError> {
        let hb = vi
            .highest_before(&root.id)
            .expect("root is vector-indexed before election");

        let mut yes_stake = 0u64;
        let mut no_stake = 0u64;
        let mut observed = None;
        let mut counted: HashSet<Address> = HashSet::new();

        for (voter_creator, voter_root) in store.roots_at(root.frame - 1)? {
            let Some(slot) = self.validators.slot(&voter_creator) else {
                continue;
            };
            if hb[slot].fork || counted.contains(&voter_creator) {
                continue;
            }
            if !vi.forkless_cause(&root.id, &voter_root) {
                continue;
            }
            let Some(vote) = self.votes.get(&(voter_root, *subject)) else {
                tracing::error!(
                    voter = ?voter_root,
                    subject = %hex::encode(subject),
                    "Voter root has no cached vote; skipping"
                );
                continue;
            };
            counted.insert(voter_creator);
            let stake = self.validators.stake_at(slot);
            if vote.yes {
                yes_stake += stake;
                if observed.is_none() {
                    observed = vote.observed;
                }
            } else {
                no_stake += stake;
            }
        }

        // Majority vote; an exact tie resolves to yes.
        let yes = yes_stake >= no_stake;
        let winning = if yes { yes_stake } else { no_stake };
        Ok(VoteValue {
            yes,
            decided: self.validators.has_quorum(winning),
            observed: if yes { observed } else { None },
        })
    }

    fn finalize(&self, frame: u64) -> ElectionRes {
        for creator in self.validators.addresses() {
            let vote = self.decided[&creator];
            if vote.yes {
                let atropos = vote
                    .observed
                    .expect("decided-yes vote carries its observed root");
                return ElectionRes { frame, atropos };
            }
        }
        // A reachable frame whose every root slot is decided "no" cannot
        // occur if the DAG invariants hold.
        panic!("frame {frame} finalised with no decided-yes root");
    }

    /// Re-process every known root above the frame to decide, lowest frame
    /// first. Called after each decided frame and after restart, so one new
    /// root can cascade several decisions.
    pub fn process_known_roots<S: Storage>(
        &mut self,
        vi: &VectorIndex,
        store: &S,
    ) -> Result<Option<ElectionRes>, StorageError> {
        let max_frame = store.max_root_frame()?;
        for frame in self.frame_to_decide + 1..=max_frame {
            for (creator, id) in store.roots_at(frame)? {
                let res = self.process_root(vi, store, RootAndSlot { id, creator, frame })?;
                if res.is_some() {
                    return Ok(res);
                }
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::event::EventHeader;
    use crate::consensus::frames::assign_frame;
    use crate::crypto::keys::Signature;
    use crate::store::SledStore;

    fn addr(n: u8) -> Address {
        [n; 20]
    }

    fn event(creator: Address, seq: u64, parents: Vec<EventId>) -> EventHeader {
        EventHeader {
            epoch: 1,
            seq,
            creator,
            frame: 0,
            is_root: false,
            lamport: seq,
            parents,
            gas_power_used: 0,
            gas_power_left: 0,
            claimed_time: seq,
            median_time: 0,
            extra: vec![],
            sig: Signature::empty(),
        }
    }

    /// Run an event through vector indexing, frame assignment, and — if it
    /// roots a frame — the election.
    fn ingest(
        vi: &mut VectorIndex,
        store: &SledStore,
        election: &mut Election,
        mut e: EventHeader,
    ) -> (EventId, Option<ElectionRes>) {
        vi.insert(&e).unwrap();
        store.put_event(&e).unwrap();
        let fa = assign_frame(vi, store, &e).unwrap();
        e.frame = fa.frame;
        e.is_root = fa.is_root;
        store.update_event(&e).unwrap();
        let mut res = None;
        if fa.is_root {
            store.add_root(fa.frame, &e.creator, &e.id()).unwrap();
            res = election
                .process_root(
                    vi,
                    store,
                    RootAndSlot {
                        id: e.id(),
                        creator: e.creator,
                        frame: fa.frame,
                    },
                )
                .unwrap();
        }
        (e.id(), res)
    }

    #[test]
    fn single_validator_decides_first_frame_at_third_root() {
        let validators = Validators::from_iter([(addr(1), 10)]);
        let mut vi = VectorIndex::new(validators.clone());
        let store = SledStore::open_temporary().unwrap();
        let mut election = Election::new(validators, 1);

        let (e1, res) = ingest(&mut vi, &store, &mut election, event(addr(1), 1, vec![]));
        assert_eq!(res, None);
        let (e2, res) = ingest(&mut vi, &store, &mut election, event(addr(1), 2, vec![e1]));
        assert_eq!(res, None, "direct votes alone cannot decide");
        let (_, res) = ingest(&mut vi, &store, &mut election, event(addr(1), 3, vec![e2]));
        assert_eq!(res, Some(ElectionRes { frame: 1, atropos: e1 }));
    }

    #[test]
    fn three_validators_decide_frame_one() {
        let validators = Validators::from_iter((1..=3).map(|i| (addr(i), 10)));
        let mut vi = VectorIndex::new(validators.clone());
        let store = SledStore::open_temporary().unwrap();
        let mut election = Election::new(validators, 1);

        // Frame 1 roots.
        let (a1, _) = ingest(&mut vi, &store, &mut election, event(addr(1), 1, vec![]));
        let (b1, _) = ingest(&mut vi, &store, &mut election, event(addr(2), 1, vec![]));
        let (c1, _) = ingest(&mut vi, &store, &mut election, event(addr(3), 1, vec![]));

        // Layer 2: the last of these advances to frame 2.
        let (a2, _) = ingest(&mut vi, &store, &mut election, event(addr(1), 2, vec![a1, b1, c1]));
        let (b2, _) = ingest(&mut vi, &store, &mut election, event(addr(2), 2, vec![b1, a2, c1]));
        let (c2, _) = ingest(&mut vi, &store, &mut election, event(addr(3), 2, vec![c1, a2, b2]));

        // Layer 3 reaches frame 2 for the remaining validators, then
        // layer 4 produces frame-3 roots whose aggregated votes decide
        // frame 1.
        let (a3, r1) = ingest(&mut vi, &store, &mut election, event(addr(1), 3, vec![a2, b2, c2]));
        let (b3, r2) = ingest(&mut vi, &store, &mut election, event(addr(2), 3, vec![b2, a3, c2]));
        let (c3, r3) = ingest(&mut vi, &store, &mut election, event(addr(3), 3, vec![c2, a3, b3]));
        let decided = [r1, r2, r3];
        let frame1 = decided.iter().flatten().next();
        let res = if let Some(res) = frame1 {
            *res
        } else {
            let (_, r) =
                ingest(&mut vi, &store, &mut election, event(addr(1), 4, vec![a3, b3, c3]));
            r.expect("frame-3 root aggregates a decisive frame-2 vote")
        };
        assert_eq!(res.frame, 1);
        // The atropos is one of the frame-1 roots.
        assert!([a1, b1, c1].contains(&res.atropos));
    }

    #[test]
    fn tie_resolves_to_yes_but_needs_quorum_to_decide() {
        // The tie rule is pure arithmetic over the tallied stakes; pin it
        // at the boundary. 4 equal validators, 2/2 split: yes wins the
        // majority but 50 of 100 stake is no quorum.
        let validators = Validators::from_iter((1..=4).map(|i| (addr(i), 25)));
        assert!(!validators.has_quorum(50));
        let yes_stake = 50u64;
        let no_stake = 50u64;
        let yes = yes_stake >= no_stake;
        assert!(yes, "exact ties must resolve to yes");
        let winning = if yes { yes_stake } else { no_stake };
        assert!(!validators.has_quorum(winning), "a tied vote cannot decide");

        // 3/1 split: 75 of 100 is a quorum, so the vote decides.
        assert!(validators.has_quorum(75));
    }

    #[test]
    fn process_known_roots_replays_after_reset() {
        // Build the single-validator chain, then reset the election and
        // replay from the store: the same decision must come back.
        let validators = Validators::from_iter([(addr(1), 10)]);
        let mut vi = VectorIndex::new(validators.clone());
        let store = SledStore::open_temporary().unwrap();
        let mut election = Election::new(validators.clone(), 1);

        let (e1, _) = ingest(&mut vi, &store, &mut election, event(addr(1), 1, vec![]));
        let (e2, _) = ingest(&mut vi, &store, &mut election, event(addr(1), 2, vec![e1]));
        let (_, res) = ingest(&mut vi, &store, &mut election, event(addr(1), 3, vec![e2]));
        let first = res.unwrap();

        election.reset(validators, 1);
        let replayed = election.process_known_roots(&vi, &store).unwrap().unwrap();
        assert_eq!(replayed, first);
    }
}
