//! Persistent storage for consensus data.
//!
//! Provides a `Storage` trait and a sled-backed implementation. The store is
//! split into persistent tables (epoch record, checkpoint, blocks) and
//! epoch-scoped tables (event headers, parents, heads, roots, confirmed-on
//! marks, last-headers) that are dropped and recreated wholesale when an
//! epoch is sealed.
//!
//! Reads return `Ok(None)` for absent keys; only I/O and codec failures are
//! errors.

use std::collections::BTreeMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::consensus::event::{EventHeader, EventId};
use crate::consensus::ordering::Block;
use crate::consensus::validators::Validators;
use crate::crypto::keys::SigningPublicKey;
use crate::{Address, Hash, Timestamp};

/// Errors from storage operations.
#[derive(Clone, Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage I/O error: {0}")]
    Io(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

type Result<T> = std::result::Result<T, StorageError>;

/// Epoch state persisted at bootstrap and at every seal.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EpochRecord {
    pub epoch: u64,
    pub validators: Validators,
    /// Known signing keys, by address. Extended as validators register.
    pub keys: BTreeMap<Address, SigningPublicKey>,
    pub prev_epoch: PrevEpochState,
}

/// Snapshot of the previous epoch taken at seal time.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PrevEpochState {
    pub epoch: u64,
    /// Consensus time of the sealing frame.
    pub time: Timestamp,
    pub last_atropos: EventId,
    pub state_hash: Hash,
    /// Highest-seq confirmed event of each non-cheater creator.
    pub last_headers: BTreeMap<Address, EventHeader>,
}

/// Mutable consensus checkpoint, persisted after every block.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Checkpoint {
    pub last_decided_frame: u64,
    pub last_block_n: u64,
    pub last_atropos: EventId,
    pub state_hash: Hash,
    pub last_consensus_time: Timestamp,
    /// Validator set under construction for the next epoch.
    pub next_validators: Validators,
}

/// Source of event headers for vector-clock rehydration after restart.
/// The store itself is the default implementation.
pub trait EventSource {
    fn event_header(&self, epoch: u64, id: &EventId) -> Result<Option<EventHeader>>;
}

/// Trait for consensus storage backends.
pub trait Storage {
    // ── persistent tables ───────────────────────────────────────────────
    fn get_epoch_record(&self) -> Result<Option<EpochRecord>>;
    fn set_epoch_record(&self, rec: &EpochRecord) -> Result<()>;
    fn get_checkpoint(&self) -> Result<Option<Checkpoint>>;
    fn set_checkpoint(&self, ck: &Checkpoint) -> Result<()>;
    fn put_block(&self, block: &Block) -> Result<()>;
    fn get_block(&self, index: u64) -> Result<Option<Block>>;

    // ── epoch-scoped tables ─────────────────────────────────────────────
    /// Insert a new event: header, parent links, and head bookkeeping.
    /// On a later pipeline failure the caller rolls back with
    /// [`Storage::delete_event`].
    fn put_event(&self, header: &EventHeader) -> Result<()>;
    /// Rewrite an already-inserted header (frame/median-time assignment).
    fn update_event(&self, header: &EventHeader) -> Result<()>;
    fn get_event(&self, id: &EventId) -> Result<Option<EventHeader>>;
    fn has_event(&self, id: &EventId) -> Result<bool>;
    fn delete_event(&self, id: &EventId) -> Result<()>;
    fn get_parents(&self, id: &EventId) -> Result<Option<Vec<EventId>>>;
    /// Current DAG tips: events that no stored event references as a parent.
    fn heads(&self) -> Result<Vec<EventId>>;
    /// Visit every stored header; the visitor returns `false` to stop.
    fn for_each_event(&self, visit: &mut dyn FnMut(EventHeader) -> bool) -> Result<()>;

    fn add_root(&self, frame: u64, creator: &Address, id: &EventId) -> Result<()>;
    fn roots_at(&self, frame: u64) -> Result<Vec<(Address, EventId)>>;
    /// Roots of one slot (frame, creator); more than one only under forks.
    /// Sorted by hash for deterministic iteration.
    fn roots_of(&self, frame: u64, creator: &Address) -> Result<Vec<EventId>>;
    /// Highest frame with any recorded root, or 0.
    fn max_root_frame(&self) -> Result<u64>;

    fn get_confirmed_on(&self, id: &EventId) -> Result<Option<u64>>;
    fn set_confirmed_on(&self, id: &EventId, frame: u64) -> Result<()>;
    fn clear_confirmed_on(&self, id: &EventId) -> Result<()>;

    fn set_last_header(&self, header: &EventHeader) -> Result<()>;
    fn get_last_header(&self, creator: &Address) -> Result<Option<EventHeader>>;
    fn last_headers(&self) -> Result<Vec<EventHeader>>;

    /// Switch to a fresh set of epoch tables, dropping the old epoch's.
    fn recreate_epoch_tables(&self, epoch: u64) -> Result<()>;
    fn flush(&self) -> Result<()>;
}

// ── sled implementation ─────────────────────────────────────────────────

/// Sled-backed storage.
pub struct SledStore {
    db: sled::Db,
    epoch_rec: sled::Tree,
    checkpoint: sled::Tree,
    blocks: sled::Tree,
    epoch: RwLock<EpochTrees>,
}

struct EpochTrees {
    n: u64,
    headers: sled::Tree,
    parents: sled::Tree,
    heads: sled::Tree,
    roots: sled::Tree,
    confirmed: sled::Tree,
    last_headers: sled::Tree,
}

const EPOCH_TREE_PREFIXES: [&str; 6] = ["e", "p", "hd", "rt", "co", "lh"];

fn io(e: sled::Error) -> StorageError {
    StorageError::Io(e.to_string())
}

fn codec(e: bincode::Error) -> StorageError {
    StorageError::Serialization(e.to_string())
}

impl SledStore {
    /// Open or create a database at the given path.
    pub fn open(path: &std::path::Path) -> Result<Self> {
        let db = sled::open(path).map_err(io)?;
        Self::from_db(db)
    }

    /// Open a temporary in-memory database (for testing).
    pub fn open_temporary() -> Result<Self> {
        let config = sled::Config::new().temporary(true);
        let db = config.open().map_err(io)?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self> {
        let epoch_rec = db.open_tree("ep").map_err(io)?;
        let checkpoint = db.open_tree("ck").map_err(io)?;
        let blocks = db.open_tree("b").map_err(io)?;
        // The real epoch is installed via `recreate_epoch_tables` once the
        // caller has read the epoch record.
        let epoch = EpochTrees::open(&db, crate::constants::FIRST_EPOCH)?;
        Ok(SledStore {
            db,
            epoch_rec,
            checkpoint,
            blocks,
            epoch: RwLock::new(epoch),
        })
    }

    fn epoch_trees(&self) -> std::sync::RwLockReadGuard<'_, EpochTrees> {
        self.epoch.read().expect("epoch tree lock poisoned")
    }
}

impl EpochTrees {
    fn open(db: &sled::Db, n: u64) -> Result<Self> {
        let tree = |prefix: &str| db.open_tree(format!("{prefix}/{n}")).map_err(io);
        Ok(EpochTrees {
            n,
            headers: tree("e")?,
            parents: tree("p")?,
            heads: tree("hd")?,
            roots: tree("rt")?,
            confirmed: tree("co")?,
            last_headers: tree("lh")?,
        })
    }
}

/// Key of a root entry: frame (big-endian for ordered scans), creator, hash.
fn root_key(frame: u64, creator: &Address, id: &EventId) -> Vec<u8> {
    let mut key = Vec::with_capacity(8 + 20 + 32);
    key.extend_from_slice(&frame.to_be_bytes());
    key.extend_from_slice(creator);
    key.extend_from_slice(&id.0);
    key
}

impl Storage for SledStore {
    fn get_epoch_record(&self) -> Result<Option<EpochRecord>> {
        match self.epoch_rec.get(b"current").map_err(io)? {
            Some(bytes) => {
                let mut rec: EpochRecord = bincode::deserialize(&bytes).map_err(codec)?;
                rec.validators.rebuild_slots();
                Ok(Some(rec))
            }
            None => Ok(None),
        }
    }

    fn set_epoch_record(&self, rec: &EpochRecord) -> Result<()> {
        let value = bincode::serialize(rec).map_err(codec)?;
        self.epoch_rec.insert(b"current", value).map_err(io)?;
        Ok(())
    }

    fn get_checkpoint(&self) -> Result<Option<Checkpoint>> {
        match self.checkpoint.get(b"current").map_err(io)? {
            Some(bytes) => {
                let mut ck: Checkpoint = bincode::deserialize(&bytes).map_err(codec)?;
                ck.next_validators.rebuild_slots();
                Ok(Some(ck))
            }
            None => Ok(None),
        }
    }

    fn set_checkpoint(&self, ck: &Checkpoint) -> Result<()> {
        let value = bincode::serialize(ck).map_err(codec)?;
        self.checkpoint.insert(b"current", value).map_err(io)?;
        Ok(())
    }

    fn put_block(&self, block: &Block) -> Result<()> {
        let value = bincode::serialize(block).map_err(codec)?;
        self.blocks
            .insert(block.index.to_be_bytes(), value)
            .map_err(io)?;
        Ok(())
    }

    fn get_block(&self, index: u64) -> Result<Option<Block>> {
        match self.blocks.get(index.to_be_bytes()).map_err(io)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes).map_err(codec)?)),
            None => Ok(None),
        }
    }

    fn put_event(&self, header: &EventHeader) -> Result<()> {
        let trees = self.epoch_trees();
        let id = header.id();
        let value = bincode::serialize(header).map_err(codec)?;
        trees.headers.insert(id.0, value).map_err(io)?;

        let parents: Vec<EventId> = header.real_parents().collect();
        let plinks = bincode::serialize(&parents).map_err(codec)?;
        trees.parents.insert(id.0, plinks).map_err(io)?;

        // The new event is a head; its parents no longer are.
        let mut heads = sled::Batch::default();
        heads.insert(&id.0, &[]);
        for p in &parents {
            heads.remove(&p.0);
        }
        trees.heads.apply_batch(heads).map_err(io)?;
        Ok(())
    }

    fn update_event(&self, header: &EventHeader) -> Result<()> {
        let trees = self.epoch_trees();
        let value = bincode::serialize(header).map_err(codec)?;
        trees.headers.insert(header.id().0, value).map_err(io)?;
        Ok(())
    }

    fn get_event(&self, id: &EventId) -> Result<Option<EventHeader>> {
        match self.epoch_trees().headers.get(id.0).map_err(io)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes).map_err(codec)?)),
            None => Ok(None),
        }
    }

    fn has_event(&self, id: &EventId) -> Result<bool> {
        self.epoch_trees().headers.contains_key(id.0).map_err(io)
    }

    fn delete_event(&self, id: &EventId) -> Result<()> {
        let trees = self.epoch_trees();
        trees.headers.remove(id.0).map_err(io)?;
        trees.parents.remove(id.0).map_err(io)?;
        trees.heads.remove(id.0).map_err(io)?;
        Ok(())
    }

    fn get_parents(&self, id: &EventId) -> Result<Option<Vec<EventId>>> {
        match self.epoch_trees().parents.get(id.0).map_err(io)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes).map_err(codec)?)),
            None => Ok(None),
        }
    }

    fn heads(&self) -> Result<Vec<EventId>> {
        let mut out = Vec::new();
        for entry in self.epoch_trees().heads.iter() {
            let (key, _) = entry.map_err(io)?;
            let raw: Hash = key
                .as_ref()
                .try_into()
                .map_err(|_| StorageError::Serialization("bad head key length".into()))?;
            out.push(EventId(raw));
        }
        Ok(out)
    }

    fn for_each_event(&self, visit: &mut dyn FnMut(EventHeader) -> bool) -> Result<()> {
        for entry in self.epoch_trees().headers.iter() {
            let (_, bytes) = entry.map_err(io)?;
            let header = bincode::deserialize(&bytes).map_err(codec)?;
            if !visit(header) {
                break;
            }
        }
        Ok(())
    }

    fn add_root(&self, frame: u64, creator: &Address, id: &EventId) -> Result<()> {
        self.epoch_trees()
            .roots
            .insert(root_key(frame, creator, id), &[])
            .map_err(io)?;
        Ok(())
    }

    fn roots_at(&self, frame: u64) -> Result<Vec<(Address, EventId)>> {
        let mut out = Vec::new();
        for entry in self.epoch_trees().roots.scan_prefix(frame.to_be_bytes()) {
            let (key, _) = entry.map_err(io)?;
            let creator: Address = key[8..28]
                .try_into()
                .map_err(|_| StorageError::Serialization("bad root key".into()))?;
            let raw: Hash = key[28..]
                .try_into()
                .map_err(|_| StorageError::Serialization("bad root key".into()))?;
            out.push((creator, EventId(raw)));
        }
        Ok(out)
    }

    fn roots_of(&self, frame: u64, creator: &Address) -> Result<Vec<EventId>> {
        let mut prefix = Vec::with_capacity(28);
        prefix.extend_from_slice(&frame.to_be_bytes());
        prefix.extend_from_slice(creator);
        let mut out = Vec::new();
        for entry in self.epoch_trees().roots.scan_prefix(prefix) {
            let (key, _) = entry.map_err(io)?;
            let raw: Hash = key[28..]
                .try_into()
                .map_err(|_| StorageError::Serialization("bad root key".into()))?;
            out.push(EventId(raw));
        }
        // Keys sort by (frame, creator, hash), so `out` is already
        // hash-ordered within the slot.
        Ok(out)
    }

    fn max_root_frame(&self) -> Result<u64> {
        match self.epoch_trees().roots.last().map_err(io)? {
            Some((key, _)) => {
                let raw: [u8; 8] = key[..8]
                    .try_into()
                    .map_err(|_| StorageError::Serialization("bad root key".into()))?;
                Ok(u64::from_be_bytes(raw))
            }
            None => Ok(0),
        }
    }

    fn get_confirmed_on(&self, id: &EventId) -> Result<Option<u64>> {
        match self.epoch_trees().confirmed.get(id.0).map_err(io)? {
            Some(bytes) => {
                let raw: [u8; 8] = bytes
                    .as_ref()
                    .try_into()
                    .map_err(|_| StorageError::Serialization("bad frame value".into()))?;
                Ok(Some(u64::from_be_bytes(raw)))
            }
            None => Ok(None),
        }
    }

    fn set_confirmed_on(&self, id: &EventId, frame: u64) -> Result<()> {
        self.epoch_trees()
            .confirmed
            .insert(id.0, &frame.to_be_bytes())
            .map_err(io)?;
        Ok(())
    }

    fn clear_confirmed_on(&self, id: &EventId) -> Result<()> {
        self.epoch_trees().confirmed.remove(id.0).map_err(io)?;
        Ok(())
    }

    fn set_last_header(&self, header: &EventHeader) -> Result<()> {
        let value = bincode::serialize(header).map_err(codec)?;
        self.epoch_trees()
            .last_headers
            .insert(header.creator, value)
            .map_err(io)?;
        Ok(())
    }

    fn get_last_header(&self, creator: &Address) -> Result<Option<EventHeader>> {
        match self.epoch_trees().last_headers.get(creator).map_err(io)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes).map_err(codec)?)),
            None => Ok(None),
        }
    }

    fn last_headers(&self) -> Result<Vec<EventHeader>> {
        let mut out = Vec::new();
        for entry in self.epoch_trees().last_headers.iter() {
            let (_, bytes) = entry.map_err(io)?;
            out.push(bincode::deserialize(&bytes).map_err(codec)?);
        }
        Ok(out)
    }

    fn recreate_epoch_tables(&self, epoch: u64) -> Result<()> {
        let mut guard = self.epoch.write().expect("epoch tree lock poisoned");
        let old = guard.n;
        let trees = EpochTrees::open(&self.db, epoch)?;
        *guard = trees;
        if old != epoch {
            for prefix in EPOCH_TREE_PREFIXES {
                self.db
                    .drop_tree(format!("{prefix}/{old}"))
                    .map_err(io)?;
            }
        }
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.db.flush().map_err(io)?;
        Ok(())
    }
}

impl EventSource for SledStore {
    fn event_header(&self, epoch: u64, id: &EventId) -> Result<Option<EventHeader>> {
        if self.epoch_trees().n != epoch {
            return Ok(None);
        }
        self.get_event(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::Signature;

    fn temp_store() -> SledStore {
        SledStore::open_temporary().unwrap()
    }

    fn test_event(seq: u64, parents: Vec<EventId>) -> EventHeader {
        EventHeader {
            epoch: 1,
            seq,
            creator: [7u8; 20],
            frame: 0,
            is_root: false,
            lamport: seq,
            parents,
            gas_power_used: 0,
            gas_power_left: 0,
            claimed_time: seq * 1000,
            median_time: 0,
            extra: vec![],
            sig: Signature::empty(),
        }
    }

    #[test]
    fn event_put_get_roundtrip() {
        let store = temp_store();
        let e = test_event(1, vec![]);
        let id = e.id();

        assert!(!store.has_event(&id).unwrap());
        store.put_event(&e).unwrap();
        assert!(store.has_event(&id).unwrap());
        assert_eq!(store.get_event(&id).unwrap().unwrap(), e);
    }

    #[test]
    fn absent_event_is_none_not_error() {
        let store = temp_store();
        assert!(store.get_event(&EventId([9u8; 32])).unwrap().is_none());
        assert!(store.get_parents(&EventId([9u8; 32])).unwrap().is_none());
        assert!(store.get_confirmed_on(&EventId([9u8; 32])).unwrap().is_none());
    }

    #[test]
    fn heads_track_tips() {
        let store = temp_store();
        let e1 = test_event(1, vec![]);
        store.put_event(&e1).unwrap();
        assert_eq!(store.heads().unwrap(), vec![e1.id()]);

        let e2 = test_event(2, vec![e1.id()]);
        store.put_event(&e2).unwrap();
        assert_eq!(store.heads().unwrap(), vec![e2.id()]);
    }

    #[test]
    fn delete_event_rolls_back_insert() {
        let store = temp_store();
        let e = test_event(1, vec![]);
        let id = e.id();
        store.put_event(&e).unwrap();
        store.delete_event(&id).unwrap();
        assert!(!store.has_event(&id).unwrap());
        assert!(store.heads().unwrap().is_empty());
    }

    #[test]
    fn roots_scan_by_frame_and_slot() {
        let store = temp_store();
        let a = [1u8; 20];
        let b = [2u8; 20];
        let r1 = EventId([10u8; 32]);
        let r2 = EventId([11u8; 32]);
        let r3 = EventId([12u8; 32]);
        store.add_root(1, &a, &r1).unwrap();
        store.add_root(1, &b, &r2).unwrap();
        store.add_root(2, &a, &r3).unwrap();

        let frame1 = store.roots_at(1).unwrap();
        assert_eq!(frame1, vec![(a, r1), (b, r2)]);
        assert_eq!(store.roots_of(1, &a).unwrap(), vec![r1]);
        assert_eq!(store.roots_of(2, &a).unwrap(), vec![r3]);
        assert_eq!(store.max_root_frame().unwrap(), 2);
    }

    #[test]
    fn confirmed_on_set_and_clear() {
        let store = temp_store();
        let id = EventId([3u8; 32]);
        store.set_confirmed_on(&id, 4).unwrap();
        assert_eq!(store.get_confirmed_on(&id).unwrap(), Some(4));
        store.clear_confirmed_on(&id).unwrap();
        assert_eq!(store.get_confirmed_on(&id).unwrap(), None);
    }

    #[test]
    fn checkpoint_roundtrip() {
        let store = temp_store();
        assert!(store.get_checkpoint().unwrap().is_none());
        let ck = Checkpoint {
            last_decided_frame: 2,
            last_block_n: 3,
            last_atropos: EventId([1u8; 32]),
            state_hash: [2u8; 32],
            last_consensus_time: 99,
            next_validators: Validators::from_iter([([5u8; 20], 10)]),
        };
        store.set_checkpoint(&ck).unwrap();
        let loaded = store.get_checkpoint().unwrap().unwrap();
        assert_eq!(loaded.last_block_n, 3);
        assert_eq!(loaded.next_validators.get(&[5u8; 20]), 10);
    }

    #[test]
    fn recreate_epoch_tables_drops_old_epoch() {
        let store = temp_store();
        let e = test_event(1, vec![]);
        store.put_event(&e).unwrap();
        store.add_root(1, &e.creator, &e.id()).unwrap();

        store.recreate_epoch_tables(2).unwrap();
        assert!(!store.has_event(&e.id()).unwrap());
        assert!(store.roots_at(1).unwrap().is_empty());
        assert_eq!(store.max_root_frame().unwrap(), 0);

        // Persistent tables survive the switch.
        let block = Block {
            index: 1,
            time: 5,
            atropos: EventId([1u8; 32]),
            prev_atropos: EventId([0u8; 32]),
            events: vec![],
        };
        store.put_block(&block).unwrap();
        store.recreate_epoch_tables(3).unwrap();
        assert!(store.get_block(1).unwrap().is_some());
    }

    #[test]
    fn last_headers_accumulate_per_creator() {
        let store = temp_store();
        let mut e1 = test_event(1, vec![]);
        e1.creator = [1u8; 20];
        let mut e2 = test_event(5, vec![]);
        e2.creator = [2u8; 20];
        store.set_last_header(&e1).unwrap();
        store.set_last_header(&e2).unwrap();

        assert_eq!(
            store.get_last_header(&[1u8; 20]).unwrap().unwrap().seq,
            1
        );
        assert_eq!(store.last_headers().unwrap().len(), 2);
    }
}
