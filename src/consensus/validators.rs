//! The validator stake table of one epoch.
//!
//! Iteration order is canonical — stake descending, address ascending as the
//! tiebreaker — so every stake-weighted computation is deterministic across
//! nodes. Vector clocks address validators by their slot in this order.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::Address;

/// Ordered mapping validator address → stake.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validators {
    /// Entries in canonical order (stake descending, address ascending).
    list: Vec<(Address, u64)>,
    /// Address → slot in `list`.
    #[serde(skip)]
    slots: HashMap<Address, usize>,
}

impl Validators {
    pub fn new() -> Self {
        Validators::default()
    }

    /// Build a table from arbitrary (address, stake) pairs. Zero-stake
    /// entries are dropped; duplicate addresses keep the last stake.
    pub fn from_iter<I: IntoIterator<Item = (Address, u64)>>(entries: I) -> Self {
        let mut v = Validators::new();
        for (addr, stake) in entries {
            v.set(addr, stake);
        }
        v
    }

    /// Stake of a validator, or 0 if absent.
    pub fn get(&self, addr: &Address) -> u64 {
        self.slots
            .get(addr)
            .map(|&i| self.list[i].1)
            .unwrap_or(0)
    }

    pub fn contains(&self, addr: &Address) -> bool {
        self.slots.contains_key(addr)
    }

    /// Set a validator's stake. Setting 0 removes the entry.
    pub fn set(&mut self, addr: Address, stake: u64) {
        self.list.retain(|(a, _)| *a != addr);
        if stake > 0 {
            self.list.push((addr, stake));
        }
        self.normalize();
    }

    fn normalize(&mut self) {
        self.list
            .sort_by(|(a_addr, a_stake), (b_addr, b_stake)| {
                b_stake.cmp(a_stake).then(a_addr.cmp(b_addr))
            });
        self.slots = self
            .list
            .iter()
            .enumerate()
            .map(|(i, (addr, _))| (*addr, i))
            .collect();
    }

    /// Sum of all stakes. Callers must size stakes so this fits u64.
    pub fn total_stake(&self) -> u64 {
        self.list.iter().map(|(_, s)| s).sum()
    }

    /// The `n` highest-staked validators as a new table.
    pub fn top(&self, n: usize) -> Validators {
        Validators::from_iter(self.list.iter().take(n).copied())
    }

    /// Number of validators.
    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    /// Canonical-order iteration (stake descending, address ascending).
    pub fn iter(&self) -> impl Iterator<Item = (Address, u64)> + '_ {
        self.list.iter().copied()
    }

    /// Addresses in canonical order.
    pub fn addresses(&self) -> impl Iterator<Item = Address> + '_ {
        self.list.iter().map(|(a, _)| *a)
    }

    /// The vector-clock slot of an address, if present.
    pub fn slot(&self, addr: &Address) -> Option<usize> {
        self.slots.get(addr).copied()
    }

    /// Address occupying a vector-clock slot.
    pub fn address_at(&self, slot: usize) -> Address {
        self.list[slot].0
    }

    /// Stake occupying a vector-clock slot.
    pub fn stake_at(&self, slot: usize) -> u64 {
        self.list[slot].1
    }

    /// True iff `stake` strictly exceeds 2/3 of the total stake.
    pub fn has_quorum(&self, stake: u64) -> bool {
        (stake as u128) * 3 > (self.total_stake() as u128) * 2
    }
}

// Rebuild the slot index dropped by `#[serde(skip)]` after deserialization.
impl Validators {
    pub(crate) fn rebuild_slots(&mut self) {
        self.normalize();
    }
}
