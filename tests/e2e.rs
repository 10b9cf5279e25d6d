//! End-to-end scenarios: whole epochs driven through a real engine over a
//! real store, including stake transfers, forks, restarts, and seals.

use std::collections::HashMap;

use moira::config::MoiraConfig;
use moira::consensus::engine::{ApplyBlockFn, Engine};
use moira::consensus::event::{EventHeader, EventId, ZERO_EVENT};
use moira::consensus::ordering::Block;
use moira::crypto::keys::{Signature, SigningKeypair, SigningPublicKey};
use moira::store::{SledStore, Storage};
use moira::{keccak256_concat, Address};

const SECOND: u64 = moira::constants::NANOS_PER_SECOND;

// ── Harness ─────────────────────────────────────────────────────────────

fn make_keypairs(n: u8) -> Vec<SigningKeypair> {
    (1..=n).map(|i| SigningKeypair::from_seed([i; 32])).collect()
}

fn genesis_of(keypairs: &[SigningKeypair], stake: u64) -> Vec<(SigningPublicKey, u64)> {
    keypairs.iter().map(|kp| (kp.public, stake)).collect()
}

fn short_epochs(epoch_len: u64) -> MoiraConfig {
    let mut config = MoiraConfig::default();
    config.consensus.epoch_len = epoch_len;
    config
}

/// Deterministic round-robin event emitter (same parent-selection policy
/// as the property-test harness).
struct Emitter {
    keypairs: Vec<SigningKeypair>,
    last: HashMap<Address, EventHeader>,
    clock: u64,
    epoch_seen: u64,
    next: usize,
}

impl Emitter {
    fn new(keypairs: Vec<SigningKeypair>) -> Self {
        Emitter {
            keypairs,
            last: HashMap::new(),
            clock: 0,
            epoch_seen: 1,
            next: 0,
        }
    }

    fn tick(&mut self, engine: &Engine<SledStore>) -> Option<EventHeader> {
        let epoch = engine.get_epoch();
        if epoch != self.epoch_seen {
            self.epoch_seen = epoch;
            self.last.clear();
        }

        let kp = self.keypairs[self.next].clone();
        self.next = (self.next + 1) % self.keypairs.len();
        let creator = kp.address();
        if engine.get_validators().get(&creator) == 0 {
            return None;
        }

        let self_parent = self.last.get(&creator).map(|h| h.id());
        let mut parents: Vec<EventId> = match self_parent {
            Some(sp) => vec![sp],
            None => vec![],
        };
        let mut heads = engine.store().heads().unwrap();
        heads.sort();
        let max_others = engine.config().consensus.max_parents - 1;
        let others: Vec<EventId> = heads
            .into_iter()
            .filter(|h| Some(*h) != self_parent)
            .take(max_others)
            .collect();
        if self_parent.is_none() && !others.is_empty() {
            parents.push(ZERO_EVENT);
        }
        parents.extend(others);

        let mut lamport = 0;
        for p in parents.iter().filter(|p| !p.is_zero()) {
            let header = engine.store().get_event(p).unwrap().unwrap();
            lamport = lamport.max(header.lamport + 1);
        }

        self.clock += SECOND;
        let mut e = EventHeader {
            epoch,
            seq: self.last.get(&creator).map(|h| h.seq + 1).unwrap_or(1),
            creator,
            frame: 0,
            is_root: false,
            lamport,
            parents,
            gas_power_used: 1,
            gas_power_left: 0,
            claimed_time: self.clock,
            median_time: 0,
            extra: vec![],
            sig: Signature::empty(),
        };
        let available = engine.gas_power_available(&e).unwrap();
        e.gas_power_left = available - e.gas_power_used;
        e.sign(&kp);

        engine.process_event(e.clone()).unwrap();
        self.last.insert(creator, e.clone());
        Some(e)
    }
}

fn drive_until(
    engine: &Engine<SledStore>,
    emitter: &mut Emitter,
    max_ticks: usize,
    cond: impl Fn(&Engine<SledStore>) -> bool,
) -> Vec<EventHeader> {
    let mut log = Vec::new();
    for _ in 0..max_ticks {
        if cond(engine) {
            return log;
        }
        if let Some(e) = emitter.tick(engine) {
            log.push(e);
        }
    }
    panic!("condition not reached within {max_ticks} ticks");
}

fn blocks_of(engine: &Engine<SledStore>) -> Vec<Block> {
    let mut blocks = Vec::new();
    let mut n = 1;
    while let Some(block) = engine.store().get_block(n).unwrap() {
        blocks.push(block);
        n += 1;
    }
    blocks
}

// ── Scenario 1: stake transfer reshapes the next validator set ──────────

/// Five equal validators; the state machine moves validator 0's entire
/// stake to validator 1 at block 1. When the epoch seals after 10 decided
/// frames, the new set has four members and validator 0 is gone.
#[test]
fn stake_transfer_drops_validator_at_seal() {
    let keypairs = make_keypairs(5);
    let addr0 = keypairs[0].address();
    let addr1 = keypairs[1].address();

    let apply: ApplyBlockFn = Box::new(move |block, state_hash, mut next| {
        if block.index == 1 {
            let moved = next.get(&addr0);
            next.set(addr1, next.get(&addr1) + moved);
            next.set(addr0, 0);
        }
        (keccak256_concat(&[&state_hash, &block.atropos.0]), next)
    });

    let engine = Engine::open(
        SledStore::open_temporary().unwrap(),
        short_epochs(10),
        &genesis_of(&keypairs, 100),
        Some(apply),
    )
    .unwrap();

    let mut emitter = Emitter::new(keypairs);
    drive_until(&engine, &mut emitter, 2000, |e| e.get_epoch() >= 2);

    let (validators, epoch) = engine.get_epoch_validators();
    assert_eq!(epoch, 2);
    assert_eq!(validators.len(), 4);
    assert!(!validators.contains(&addr0));
    assert_eq!(validators.get(&addr1), 200);

    // The closed epoch is snapshotted with its last confirmed headers.
    let prev = engine.prev_epoch();
    assert_eq!(prev.epoch, 1);
    assert!(prev.time > 0);

    // The new epoch keeps producing blocks with the reduced set.
    let sealed_at = engine.checkpoint().last_block_n;
    drive_until(&engine, &mut emitter, 600, |e| {
        e.checkpoint().last_block_n >= sealed_at + 2
    });
}

// ── Scenario 2: gas-power regulator worked example ──────────────────────

/// 360 000 gas/hour over 1000 total stake; a 250-stake validator gets
/// 90 000/hour, banks at most 250 (10 s window), and starts with
/// max(125, 100) = 125.
#[test]
fn gas_regulator_worked_example() {
    let keypairs = make_keypairs(4);
    let mut config = MoiraConfig::default();
    config.gas_power.total_per_hour = 360_000;
    config.gas_power.max_gas_power_period = 10 * SECOND;
    config.gas_power.startup_period = 5 * SECOND;
    config.gas_power.min_startup_gas_power = 100;

    let engine = Engine::open(
        SledStore::open_temporary().unwrap(),
        config,
        &genesis_of(&keypairs, 250),
        None,
    )
    .unwrap();

    let kp = &keypairs[0];
    let mut first = EventHeader {
        epoch: 1,
        seq: 1,
        creator: kp.address(),
        frame: 0,
        is_root: false,
        lamport: 0,
        parents: vec![],
        gas_power_used: 25,
        gas_power_left: 0,
        claimed_time: SECOND,
        median_time: 0,
        extra: vec![],
        sig: Signature::empty(),
    };
    assert_eq!(engine.gas_power_available(&first).unwrap(), 125);
    first.gas_power_left = 100;
    first.sign(kp);
    engine.process_event(first.clone()).unwrap();

    // Four seconds later: 100 carried + 90 000/h * 4 s = 100 more, below
    // the 250 cap.
    let mut second = first.clone();
    second.seq = 2;
    second.parents = vec![first.id()];
    second.lamport = 1;
    second.claimed_time = 5 * SECOND;
    second.gas_power_used = 0;
    assert_eq!(engine.gas_power_available(&second).unwrap(), 200);

    // A long idle period saturates at the banking cap.
    second.claimed_time = SECOND + moira::constants::NANOS_PER_HOUR;
    assert_eq!(engine.gas_power_available(&second).unwrap(), 250);
}

// ── Scenario 3: fork detection ──────────────────────────────────────────

/// Two events with the same (creator, seq) and different hashes are both
/// stored; the creator is flagged and consensus continues on the honest
/// three-quarters of stake.
#[test]
fn fork_is_stored_and_creator_flagged() {
    let keypairs = make_keypairs(4);
    let engine = Engine::open(
        SledStore::open_temporary().unwrap(),
        MoiraConfig::default(),
        &genesis_of(&keypairs, 100),
        None,
    )
    .unwrap();

    // The cheater signs two distinct seq-1 events.
    let cheater = &keypairs[3];
    let mut branch_a = EventHeader {
        epoch: 1,
        seq: 1,
        creator: cheater.address(),
        frame: 0,
        is_root: false,
        lamport: 0,
        parents: vec![],
        gas_power_used: 0,
        gas_power_left: 0,
        claimed_time: SECOND / 2,
        median_time: 0,
        extra: vec![],
        sig: Signature::empty(),
    };
    branch_a.gas_power_left = engine.gas_power_available(&branch_a).unwrap();
    let mut branch_b = branch_a.clone();
    branch_b.extra = b"equivocation".to_vec();
    branch_a.sign(cheater);
    branch_b.sign(cheater);
    assert_ne!(branch_a.id(), branch_b.id());

    engine.process_event(branch_a.clone()).unwrap();
    engine.process_event(branch_b.clone()).unwrap();
    assert!(engine.store().has_event(&branch_a.id()).unwrap());
    assert!(engine.store().has_event(&branch_b.id()).unwrap());
    assert_eq!(engine.cheaters(), vec![cheater.address()]);

    // Both branches occupy the same root slot.
    assert_eq!(
        engine
            .store()
            .roots_of(1, &cheater.address())
            .unwrap()
            .len(),
        2
    );

    // The honest 3/4 of stake still decides frames and emits blocks.
    let mut emitter = Emitter::new(keypairs[..3].to_vec());
    emitter.clock = SECOND; // stay ahead of the fork events' claimed time
    drive_until(&engine, &mut emitter, 300, |e| {
        e.checkpoint().last_block_n >= 2
    });
}

// ── Scenario 4: four validators reach decisions ─────────────────────────

/// With four equal validators every decision crosses the 3-of-4 quorum
/// boundary (the tie-handling regime of the election).
#[test]
fn four_equal_validators_decide_frames() {
    let keypairs = make_keypairs(4);
    let engine = Engine::open(
        SledStore::open_temporary().unwrap(),
        MoiraConfig::default(),
        &genesis_of(&keypairs, 25),
        None,
    )
    .unwrap();
    let mut emitter = Emitter::new(keypairs);
    drive_until(&engine, &mut emitter, 400, |e| {
        e.checkpoint().last_block_n >= 3
    });
    let blocks = blocks_of(&engine);
    assert!(blocks.len() >= 3);
}

// ── Scenario 5: restart ─────────────────────────────────────────────────

/// Persist through a few blocks, restart from disk, and keep producing —
/// the combined block sequence must match a node that never restarted.
#[test]
fn restart_resumes_identical_blocks() {
    let keypairs = make_keypairs(3);
    let dir = tempfile::tempdir().unwrap();
    let mut emitter = Emitter::new(keypairs.clone());

    // Phase 1: run to three blocks, then shut down.
    let mut log = {
        let engine = Engine::open(
            SledStore::open(dir.path()).unwrap(),
            MoiraConfig::default(),
            &genesis_of(&keypairs, 100),
            None,
        )
        .unwrap();
        let log = drive_until(&engine, &mut emitter, 300, |e| {
            e.checkpoint().last_block_n >= 3
        });
        engine.store().flush().unwrap();
        log
    };

    // Phase 2: reopen from the same directory and continue.
    let engine = Engine::open(
        SledStore::open(dir.path()).unwrap(),
        MoiraConfig::default(),
        &genesis_of(&keypairs, 100),
        None,
    )
    .unwrap();
    assert!(
        engine.checkpoint().last_block_n >= 3,
        "restart must recover the persisted checkpoint"
    );
    log.extend(drive_until(&engine, &mut emitter, 300, |e| {
        e.checkpoint().last_block_n >= 6
    }));
    let restarted_blocks = blocks_of(&engine);

    // Control: a fresh node fed the same events without any restart.
    let control = Engine::open(
        SledStore::open_temporary().unwrap(),
        MoiraConfig::default(),
        &genesis_of(&keypairs, 100),
        None,
    )
    .unwrap();
    for e in &log {
        control.process_event(e.clone()).unwrap();
    }
    assert_eq!(blocks_of(&control), restarted_blocks);
}

// ── Scenario 6: epoch seal without stake changes ────────────────────────

/// Sealing with no pending transfers keeps the validator set, bumps the
/// epoch, resets the decided-frame counter, empties the epoch tables, and
/// continues the block sequence without a gap.
#[test]
fn epoch_seal_without_transfers() {
    let keypairs = make_keypairs(3);
    let engine = Engine::open(
        SledStore::open_temporary().unwrap(),
        short_epochs(2),
        &genesis_of(&keypairs, 100),
        None,
    )
    .unwrap();
    let before = engine.get_validators();

    let mut emitter = Emitter::new(keypairs);
    drive_until(&engine, &mut emitter, 300, |e| e.get_epoch() >= 2);

    let (validators, epoch) = engine.get_epoch_validators();
    assert_eq!(epoch, 2);
    assert_eq!(validators, before);

    let checkpoint = engine.checkpoint();
    assert_eq!(checkpoint.last_decided_frame, 0);
    assert_eq!(checkpoint.last_block_n, 2);

    // Epoch tables were recreated empty.
    assert!(engine.store().heads().unwrap().is_empty());
    assert_eq!(engine.store().max_root_frame().unwrap(), 0);

    // Sealed-epoch snapshot: one last header per non-cheater creator.
    let prev = engine.prev_epoch();
    assert_eq!(prev.epoch, 1);
    assert_eq!(prev.last_headers.len(), 3);
    for (creator, header) in &prev.last_headers {
        assert_eq!(&header.creator, creator);
        assert!(header.seq >= 1);
    }

    // Blocks continue densely after the seal.
    drive_until(&engine, &mut emitter, 300, |e| {
        e.checkpoint().last_block_n >= 4
    });
    let blocks = blocks_of(&engine);
    for (i, block) in blocks.iter().enumerate() {
        assert_eq!(block.index, i as u64 + 1);
    }
}
