//! Event headers: canonical encoding, hashing, and signatures.
//!
//! The event hash is Keccak-256 over the canonical encoding with the
//! signature empty and the consensus-computed fields (`frame`, `is_root`,
//! `median_time`) zeroed — those are outputs of insertion and confirmation,
//! not claims of the creator, so filling them later must not change the
//! event's identity. The signature is over the hash.

use serde::{Deserialize, Serialize};

use crate::crypto::keys::{Signature, SigningKeypair, SigningPublicKey};
use crate::{keccak256, Address, Hash, Timestamp};

/// Unique identifier of an event (its canonical hash).
#[derive(
    Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct EventId(pub Hash);

/// The zero hash, used in the self-parent slot of a creator's first event.
pub const ZERO_EVENT: EventId = EventId([0u8; 32]);

impl EventId {
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl std::fmt::Debug for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EventId({})", hex::encode(&self.0[..8]))
    }
}

/// A signed event header — immutable after signing, except for the
/// consensus-computed fields excluded from the hash.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventHeader {
    /// Epoch this event belongs to.
    pub epoch: u64,
    /// Per-creator sequence, starting at 1.
    pub seq: u64,
    /// Creator's validator address.
    pub creator: Address,
    /// DAG frame, assigned on insert (0 on the wire).
    pub frame: u64,
    /// Whether the event is a root of its frame, assigned on insert.
    pub is_root: bool,
    /// 1 + max parent Lamport time; 0 for a parentless event.
    pub lamport: u64,
    /// Parent references; slot 0 is the self-parent (zero hash if none).
    pub parents: Vec<EventId>,
    /// Gas consumed by this event's payload.
    pub gas_power_used: u64,
    /// Remaining gas power claimed by the creator, validated on insert.
    pub gas_power_left: u64,
    /// Creator's wall-clock claim, nanoseconds.
    pub claimed_time: Timestamp,
    /// Consensus time, assigned when the event is confirmed (0 on the wire).
    pub median_time: Timestamp,
    /// Opaque payload commitment, at most 2 KiB.
    pub extra: Vec<u8>,
    /// Creator's signature over the event hash.
    pub sig: Signature,
}

/// Errors from decoding a canonical event buffer.
#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("buffer ended inside field `{0}`")]
    UnexpectedEnd(&'static str),
    #[error("length prefix of `{0}` exceeds remaining buffer")]
    BadLength(&'static str),
    #[error("{0} trailing bytes after event")]
    TrailingBytes(usize),
}

impl EventHeader {
    /// The event's self-parent, if any.
    pub fn self_parent(&self) -> Option<EventId> {
        self.parents.first().copied().filter(|p| !p.is_zero())
    }

    /// Parents excluding the zero-hash self-parent placeholder.
    pub fn real_parents(&self) -> impl Iterator<Item = EventId> + '_ {
        self.parents.iter().copied().filter(|p| !p.is_zero())
    }

    /// Canonical encoding of the full header, signature included.
    pub fn encode(&self) -> Vec<u8> {
        self.encode_inner(false)
    }

    /// The byte string the hash (and hence the signature) commits to:
    /// canonical encoding with `sig` empty and computed fields zeroed.
    fn signed_payload(&self) -> Vec<u8> {
        self.encode_inner(true)
    }

    fn encode_inner(&self, for_hash: bool) -> Vec<u8> {
        let mut buf = Vec::with_capacity(128 + 32 * self.parents.len() + self.extra.len());
        buf.extend_from_slice(&self.epoch.to_le_bytes());
        buf.extend_from_slice(&self.seq.to_le_bytes());
        buf.extend_from_slice(&self.creator);
        let frame = if for_hash { 0 } else { self.frame };
        buf.extend_from_slice(&frame.to_le_bytes());
        buf.push(u8::from(!for_hash && self.is_root));
        buf.extend_from_slice(&self.lamport.to_le_bytes());
        buf.extend_from_slice(&(self.parents.len() as u32).to_le_bytes());
        for p in &self.parents {
            buf.extend_from_slice(&p.0);
        }
        buf.extend_from_slice(&self.gas_power_used.to_le_bytes());
        buf.extend_from_slice(&self.gas_power_left.to_le_bytes());
        buf.extend_from_slice(&self.claimed_time.to_le_bytes());
        let median = if for_hash { 0 } else { self.median_time };
        buf.extend_from_slice(&median.to_le_bytes());
        buf.extend_from_slice(&(self.extra.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.extra);
        let sig: &[u8] = if for_hash { &[] } else { self.sig.as_bytes() };
        buf.extend_from_slice(&(sig.len() as u32).to_le_bytes());
        buf.extend_from_slice(sig);
        buf
    }

    /// Decode a canonical buffer. Fails on truncation at any position and
    /// on trailing bytes.
    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader { buf, pos: 0 };
        let epoch = r.u64("epoch")?;
        let seq = r.u64("seq")?;
        let creator: Address = r
            .bytes(20, "creator")?
            .try_into()
            .expect("reader returned exactly 20 bytes");
        let frame = r.u64("frame")?;
        let is_root = r.u8("is_root")? != 0;
        let lamport = r.u64("lamport")?;
        let n_parents = r.u32("parents.len")? as usize;
        let mut parents = Vec::with_capacity(n_parents.min(64));
        for _ in 0..n_parents {
            let raw: Hash = r
                .bytes(32, "parents")?
                .try_into()
                .expect("reader returned exactly 32 bytes");
            parents.push(EventId(raw));
        }
        let gas_power_used = r.u64("gas_power_used")?;
        let gas_power_left = r.u64("gas_power_left")?;
        let claimed_time = r.u64("claimed_time")?;
        let median_time = r.u64("median_time")?;
        let extra_len = r.u32("extra.len")? as usize;
        let extra = r.bytes(extra_len, "extra")?.to_vec();
        let sig_len = r.u32("sig.len")? as usize;
        let sig = Signature::from_bytes(r.bytes(sig_len, "sig")?.to_vec())
            .ok_or(DecodeError::BadLength("sig"))?;
        if r.pos != buf.len() {
            return Err(DecodeError::TrailingBytes(buf.len() - r.pos));
        }
        Ok(EventHeader {
            epoch,
            seq,
            creator,
            frame,
            is_root,
            lamport,
            parents,
            gas_power_used,
            gas_power_left,
            claimed_time,
            median_time,
            extra,
            sig,
        })
    }

    /// The canonical hash identifying this event.
    pub fn id(&self) -> EventId {
        EventId(keccak256(&self.signed_payload()))
    }

    /// Sign the event with the creator's key, filling `sig`.
    pub fn sign(&mut self, keypair: &SigningKeypair) {
        let id = self.id();
        self.sig = keypair.sign(&id.0);
    }

    /// Verify `sig` against the given public key.
    pub fn verify_signature(&self, key: &SigningPublicKey) -> bool {
        key.verify(&self.id().0, &self.sig)
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn bytes(&mut self, n: usize, field: &'static str) -> Result<&'a [u8], DecodeError> {
        if self.buf.len() - self.pos < n {
            return Err(DecodeError::UnexpectedEnd(field));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self, field: &'static str) -> Result<u8, DecodeError> {
        Ok(self.bytes(1, field)?[0])
    }

    fn u32(&mut self, field: &'static str) -> Result<u32, DecodeError> {
        let raw = self.bytes(4, field)?;
        Ok(u32::from_le_bytes(raw.try_into().expect("4 bytes")))
    }

    fn u64(&mut self, field: &'static str) -> Result<u64, DecodeError> {
        let raw = self.bytes(8, field)?;
        Ok(u64::from_le_bytes(raw.try_into().expect("8 bytes")))
    }
}
