//! The consensus orchestrator.
//!
//! `Engine::process_event` drives the whole pipeline under one mutex:
//! check → store → vector index → frame assignment → election → ordering →
//! block emission → checkpoint, and finally epoch sealing once enough
//! frames are decided. Concurrent callers serialise on `engine_mu`; cheap
//! `(epoch, validators)` reads go through a separate snapshot lock.
//!
//! A restart rehydrates every in-memory index by replaying the stored
//! epoch's headers in Lamport order through the same code paths, then
//! resumes any election decision that was in flight.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, RwLock};

use crate::config::MoiraConfig;
use crate::consensus::checker::{self, CheckContext};
use crate::consensus::election::{Election, ElectionRes, RootAndSlot};
use crate::consensus::event::{EventHeader, EventId, ZERO_EVENT};
use crate::consensus::frames;
use crate::consensus::ordering::{self, Block};
use crate::consensus::validators::Validators;
use crate::consensus::vector::VectorIndex;
use crate::consensus::ConsensusError;
use crate::constants::{FIRST_FRAME, MAX_VALIDATORS};
use crate::crypto::keys::SigningPublicKey;
use crate::store::{Checkpoint, EpochRecord, EventSource, PrevEpochState, Storage};
use crate::{Address, Hash};

/// External state machine invoked once per block, synchronously, under the
/// engine mutex. Returns the new state hash and the validator set under
/// construction for the next epoch.
pub type ApplyBlockFn = Box<dyn FnMut(&Block, Hash, Validators) -> (Hash, Validators) + Send>;

/// Cheap copy of the epoch identity served to readers.
#[derive(Clone, Debug)]
pub struct EpochSnapshot {
    pub epoch: u64,
    pub validators: Validators,
}

struct Inner {
    epoch: u64,
    validators: Validators,
    keys: BTreeMap<Address, SigningPublicKey>,
    prev_epoch: PrevEpochState,
    checkpoint: Checkpoint,
    vi: VectorIndex,
    election: Election,
    cheaters: HashSet<Address>,
    /// Events spilled from the last block, to be carried into the next.
    pending_spills: Vec<EventId>,
    apply_block: Option<ApplyBlockFn>,
}

/// The consensus engine of one node.
pub struct Engine<S: Storage> {
    store: S,
    config: MoiraConfig,
    engine_mu: Mutex<Inner>,
    epoch_mu: RwLock<EpochSnapshot>,
}

impl<S: Storage + EventSource> Engine<S> {
    /// Open the engine over `store`. A fresh store is bootstrapped from
    /// the genesis validator keys and stakes; an existing one is
    /// rehydrated and any in-flight frame decision is resumed.
    pub fn open(
        store: S,
        config: MoiraConfig,
        genesis: &[(SigningPublicKey, u64)],
        apply_block: Option<ApplyBlockFn>,
    ) -> Result<Self, ConsensusError> {
        let record = match store.get_epoch_record()? {
            Some(rec) => rec,
            None => {
                let validators =
                    Validators::from_iter(genesis.iter().map(|(key, stake)| (key.address(), *stake)));
                let keys = genesis
                    .iter()
                    .map(|(key, _)| (key.address(), *key))
                    .collect();
                let rec = EpochRecord {
                    epoch: crate::constants::FIRST_EPOCH,
                    validators,
                    keys,
                    prev_epoch: PrevEpochState {
                        epoch: 0,
                        time: 0,
                        last_atropos: ZERO_EVENT,
                        state_hash: [0u8; 32],
                        last_headers: BTreeMap::new(),
                    },
                };
                store.set_epoch_record(&rec)?;
                store.set_checkpoint(&Checkpoint {
                    last_decided_frame: 0,
                    last_block_n: 0,
                    last_atropos: ZERO_EVENT,
                    state_hash: [0u8; 32],
                    last_consensus_time: 0,
                    next_validators: rec.validators.clone(),
                })?;
                tracing::info!(
                    epoch = rec.epoch,
                    validators = rec.validators.len(),
                    "Bootstrapped consensus state"
                );
                rec
            }
        };

        if !config.gas_power.is_sane() {
            tracing::warn!("Gas-power periods exceed sane bounds; regulator math may saturate");
        }
        let checkpoint = store
            .get_checkpoint()?
            .expect("checkpoint persisted with epoch record");
        store.recreate_epoch_tables(record.epoch)?;

        let inner = Inner {
            epoch: record.epoch,
            validators: record.validators.clone(),
            keys: record.keys,
            prev_epoch: record.prev_epoch,
            vi: VectorIndex::new(record.validators.clone()),
            election: Election::new(
                record.validators.clone(),
                checkpoint.last_decided_frame + 1,
            ),
            checkpoint,
            cheaters: HashSet::new(),
            pending_spills: Vec::new(),
            apply_block,
        };
        let snapshot = EpochSnapshot {
            epoch: inner.epoch,
            validators: inner.validators.clone(),
        };
        let engine = Engine {
            store,
            config,
            engine_mu: Mutex::new(inner),
            epoch_mu: RwLock::new(snapshot),
        };
        engine.rehydrate()?;
        Ok(engine)
    }

    /// Register (or replace) the block application callback.
    pub fn set_apply_block(&self, apply: ApplyBlockFn) {
        self.lock().apply_block = Some(apply);
    }

    /// Current epoch number.
    pub fn get_epoch(&self) -> u64 {
        self.epoch_mu.read().expect("epoch lock poisoned").epoch
    }

    /// Validators of the current epoch.
    pub fn get_validators(&self) -> Validators {
        self.epoch_mu
            .read()
            .expect("epoch lock poisoned")
            .validators
            .clone()
    }

    /// Atomically read validators and epoch together.
    pub fn get_epoch_validators(&self) -> (Validators, u64) {
        let snap = self.epoch_mu.read().expect("epoch lock poisoned");
        (snap.validators.clone(), snap.epoch)
    }

    /// Creators flagged as cheaters in the current epoch.
    pub fn cheaters(&self) -> Vec<Address> {
        let mut list: Vec<Address> = self.lock().cheaters.iter().copied().collect();
        list.sort();
        list
    }

    /// Available gas power for a prospective event, exactly as the checker
    /// will compute it. Emitters call this to fill `gas_power_left` before
    /// signing.
    pub fn gas_power_available(&self, e: &EventHeader) -> Result<u64, ConsensusError> {
        let inner = self.lock();
        let self_parent = match e.self_parent() {
            Some(sp) => self.store.get_event(&sp)?,
            None => None,
        };
        Ok(crate::consensus::gas::gas_power_available(
            &self.config.gas_power,
            &inner.validators,
            e,
            self_parent.as_ref(),
            inner.prev_epoch.last_headers.get(&e.creator),
        ))
    }

    /// Snapshot of the sealed previous epoch.
    pub fn prev_epoch(&self) -> PrevEpochState {
        self.lock().prev_epoch.clone()
    }

    /// Current checkpoint (last decided frame, block cursor, next
    /// validators).
    pub fn checkpoint(&self) -> Checkpoint {
        self.lock().checkpoint.clone()
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &MoiraConfig {
        &self.config
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.engine_mu.lock().expect("engine lock poisoned")
    }

    /// Validate, store, and index one event, driving any frame decisions
    /// and epoch seal it triggers. Events of one creator must arrive in
    /// seq order; an out-of-order event fails with `MissingParent` and may
    /// be re-fed once its parents are connected.
    pub fn process_event(&self, e: EventHeader) -> Result<(), ConsensusError> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let id = e.id();

        if self.store.has_event(&id)? {
            return Err(ConsensusError::AlreadyConnected);
        }

        let ctx = CheckContext {
            store: &self.store,
            vi: &inner.vi,
            validators: &inner.validators,
            keys: &inner.keys,
            consensus: &self.config.consensus,
            gas: &self.config.gas_power,
            epoch: inner.epoch,
            prev_epoch_headers: &inner.prev_epoch.last_headers,
        };
        let outcome = match checker::check(&ctx, &e) {
            Ok(outcome) => outcome,
            Err(err) => {
                if matches!(err, ConsensusError::BadSignature) {
                    tracing::warn!(
                        event = ?id,
                        creator = %hex::encode(e.creator),
                        "Discarding event with invalid signature"
                    );
                }
                return Err(err);
            }
        };

        self.store.put_event(&e)?;
        match self.connect(inner, e, outcome.forks_with.is_some()) {
            Ok(()) => Ok(()),
            Err(err) => {
                // Insert is atomic: remove the partial record before
                // surfacing the failure.
                if let Err(cleanup) = self.store.delete_event(&id) {
                    tracing::error!(error = %cleanup, "Rollback of failed insert also failed");
                }
                Err(err)
            }
        }
    }

    /// Post-storage half of ingest: vector index, frame assignment, root
    /// registration, and election processing.
    fn connect(
        &self,
        inner: &mut Inner,
        e: EventHeader,
        forks: bool,
    ) -> Result<(), ConsensusError> {
        let id = e.id();
        let evidence = inner
            .vi
            .insert(&e)
            .expect("checked event must be indexable");
        if forks || evidence.is_some() {
            if inner.cheaters.insert(e.creator) {
                tracing::warn!(
                    creator = %hex::encode(e.creator),
                    "Creator flagged as cheater for the remainder of the epoch"
                );
            }
        }

        let fa = frames::assign_frame(&inner.vi, &self.store, &e)?;
        let mut stored = e;
        stored.frame = fa.frame;
        stored.is_root = fa.is_root;
        self.store.update_event(&stored)?;

        if !fa.is_root {
            return Ok(());
        }
        self.store.add_root(fa.frame, &stored.creator, &id)?;
        tracing::debug!(
            event = ?id,
            frame = fa.frame,
            creator = %hex::encode(stored.creator),
            "New root"
        );

        let mut decision = inner.election.process_root(
            &inner.vi,
            &self.store,
            RootAndSlot {
                id,
                creator: stored.creator,
                frame: fa.frame,
            },
        )?;
        while let Some(res) = decision {
            let sealed = self.on_frame_decided(inner, res)?;
            if sealed {
                // The election restarted for a new epoch; stale roots of
                // the old epoch have nothing more to decide.
                break;
            }
            decision = inner.election.process_known_roots(&inner.vi, &self.store)?;
        }
        Ok(())
    }

    /// Confirm the decided frame into a block and advance the checkpoint.
    /// Returns true when the decision sealed the epoch.
    fn on_frame_decided(
        &self,
        inner: &mut Inner,
        res: ElectionRes,
    ) -> Result<bool, ConsensusError> {
        tracing::info!(frame = res.frame, atropos = ?res.atropos, "Frame decided");
        inner
            .election
            .reset(inner.validators.clone(), res.frame + 1);

        let fc = ordering::confirm_frame(
            &self.store,
            &inner.vi,
            res.frame,
            &res.atropos,
            &self.config.consensus,
            inner.checkpoint.last_consensus_time,
            &inner.cheaters,
            &inner.pending_spills,
        )?;
        if fc.events.is_empty() {
            // Unreachable while the DAG invariants hold: the atropos
            // itself is always freshly confirmed.
            panic!("frame {} decided with no confirmed events", res.frame);
        }

        inner.checkpoint.last_block_n += 1;
        let block = Block {
            index: inner.checkpoint.last_block_n,
            time: fc.block_time,
            atropos: res.atropos,
            prev_atropos: inner.checkpoint.last_atropos,
            events: fc.events.iter().map(|h| h.id()).collect(),
        };
        if let Some(apply) = inner.apply_block.as_mut() {
            let (state_hash, next_validators) = apply(
                &block,
                inner.checkpoint.state_hash,
                inner.checkpoint.next_validators.clone(),
            );
            inner.checkpoint.state_hash = state_hash;
            inner.checkpoint.next_validators = next_validators.top(MAX_VALIDATORS);
        }
        inner.checkpoint.last_atropos = res.atropos;
        inner.checkpoint.last_consensus_time = fc.block_time;
        inner.checkpoint.last_decided_frame = res.frame;

        self.store.put_block(&block)?;
        self.store.set_checkpoint(&inner.checkpoint)?;
        tracing::info!(
            block = block.index,
            events = block.events.len(),
            spilled = fc.spilled.len(),
            "Block emitted"
        );
        inner.pending_spills = fc.spilled;

        if inner.checkpoint.last_decided_frame >= self.config.consensus.epoch_len {
            self.seal_epoch(inner, res.atropos)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Snapshot the closing epoch, install the next validator set, and
    /// reset all epoch-scoped state.
    fn seal_epoch(&self, inner: &mut Inner, atropos: EventId) -> Result<(), ConsensusError> {
        let mut last_headers = BTreeMap::new();
        for header in self.store.last_headers()? {
            if !inner.cheaters.contains(&header.creator) {
                last_headers.insert(header.creator, header);
            }
        }
        inner.prev_epoch = PrevEpochState {
            epoch: inner.epoch,
            time: inner.checkpoint.last_consensus_time,
            last_atropos: atropos,
            state_hash: inner.checkpoint.state_hash,
            last_headers,
        };

        let next = inner.checkpoint.next_validators.top(MAX_VALIDATORS);
        inner.epoch += 1;
        inner.validators = next.clone();
        inner.checkpoint.next_validators = next.clone();
        inner.checkpoint.last_decided_frame = 0;

        self.store.set_epoch_record(&EpochRecord {
            epoch: inner.epoch,
            validators: inner.validators.clone(),
            keys: inner.keys.clone(),
            prev_epoch: inner.prev_epoch.clone(),
        })?;
        self.store.set_checkpoint(&inner.checkpoint)?;
        self.store.recreate_epoch_tables(inner.epoch)?;

        inner.vi.reset(next.clone());
        inner.election.reset(next, FIRST_FRAME);
        inner.cheaters.clear();
        // Spills of the sealed epoch are gone with its tables.
        inner.pending_spills.clear();

        *self.epoch_mu.write().expect("epoch lock poisoned") = EpochSnapshot {
            epoch: inner.epoch,
            validators: inner.validators.clone(),
        };
        tracing::info!(
            epoch = inner.epoch,
            validators = inner.validators.len(),
            "Epoch sealed"
        );
        Ok(())
    }

    /// Rebuild the vector clock and election from the stored epoch by
    /// replaying headers in Lamport order, then resume any decision the
    /// previous run did not finish. Headers are fetched through the
    /// event-source seam, walking the ancestry back from the DAG heads.
    fn rehydrate(&self) -> Result<(), ConsensusError> {
        let mut guard = self.lock();
        let inner = &mut *guard;

        let mut headers: Vec<EventHeader> = Vec::new();
        let mut visited: HashSet<EventId> = HashSet::new();
        let mut stack = self.store.heads()?;
        while let Some(id) = stack.pop() {
            if !visited.insert(id) {
                continue;
            }
            let header = self
                .store
                .event_header(inner.epoch, &id)?
                .expect("reachable event of the current epoch is stored");
            stack.extend(header.real_parents());
            headers.push(header);
        }
        if headers.is_empty() {
            return Ok(());
        }
        headers.sort_by_key(|h| (h.lamport, h.id()));

        for header in &headers {
            let evidence = inner
                .vi
                .insert(header)
                .expect("stored event must be indexable");
            if evidence.is_some() {
                inner.cheaters.insert(header.creator);
            }
        }

        // A stamped consensus time without a confirmation mark identifies
        // an event spilled from the last block before shutdown.
        let mut pending: Vec<(u64, EventId)> = Vec::new();
        for header in &headers {
            if header.median_time == 0 {
                continue;
            }
            let id = header.id();
            if self.store.get_confirmed_on(&id)?.is_none() {
                pending.push((header.lamport, id));
            }
        }
        pending.sort_unstable();
        inner.pending_spills = pending.into_iter().map(|(_, id)| id).collect();
        tracing::info!(
            events = headers.len(),
            pending_spills = inner.pending_spills.len(),
            "Rehydrated vector index"
        );

        let mut decision = inner.election.process_known_roots(&inner.vi, &self.store)?;
        while let Some(res) = decision {
            let sealed = self.on_frame_decided(inner, res)?;
            if sealed {
                break;
            }
            decision = inner.election.process_known_roots(&inner.vi, &self.store)?;
        }
        Ok(())
    }
}
