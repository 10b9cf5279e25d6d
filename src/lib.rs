//! # Moira
//!
//! The consensus core of an asynchronous BFT event-DAG ledger:
//! - **Event DAG** — validators emit signed events referencing multiple parents;
//!   the DAG, not a linear chain, is the unit of replication
//! - **Forkless-cause vector clocks** — a stake-weighted causal-observation
//!   relation that stays sound with up to 1/3 Byzantine stake
//! - **Atropos election** — per-frame voting that finalises exactly one root,
//!   whose sub-DAG becomes a block
//! - **Deterministic ordering** — confirmed events are totally ordered by
//!   consensus time, Lamport time, and hash; every honest node derives the
//!   same block sequence from the same events in any delivery order
//! - **Gas-power regulation** — per-validator, stake-proportional rate limiting
//!   of event emission
//!
//! Peer-to-peer gossip, transaction execution, and the emitter live outside
//! this crate; the engine consumes already-fetched events and calls back into
//! an external state machine once per block.

pub mod config;
pub mod consensus;
pub mod crypto;
pub mod store;

/// Protocol constants
pub mod constants {
    /// Maximum number of parent references per event
    pub const MAX_PARENTS: usize = 8;
    /// Maximum size of an event's opaque `extra` payload (2 KiB)
    pub const MAX_EXTRA_BYTES: usize = 2048;
    /// Frames are numbered from 1; frame 0 means "not confirmed"
    pub const FIRST_FRAME: u64 = 1;
    /// Epochs are numbered from 1
    pub const FIRST_EPOCH: u64 = 1;
    /// Upper bound on the validator set installed at each epoch seal
    pub const MAX_VALIDATORS: usize = 30;
    /// Nanoseconds per hour, the base period of the gas-power regulator
    pub const NANOS_PER_HOUR: u64 = 3_600_000_000_000;
    /// Nanoseconds per second
    pub const NANOS_PER_SECOND: u64 = 1_000_000_000;
}

/// 32-byte hash used throughout the protocol
pub type Hash = [u8; 32];

/// 20-byte validator address (Keccak-256 of the public key, last 20 bytes)
pub type Address = [u8; 20];

/// Monotone timestamp in nanoseconds
pub type Timestamp = u64;

/// Compute the Keccak-256 hash of a byte slice.
pub fn keccak256(data: &[u8]) -> Hash {
    use sha3::{Digest, Keccak256};
    let mut hasher = Keccak256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Compute Keccak-256 over length-prefixed concatenated slices.
///
/// Each part is prefixed with its length as a little-endian u64, preventing
/// ambiguous concatenation (e.g., `["AB","C"]` vs `["A","BC"]`).
pub fn keccak256_concat(parts: &[&[u8]]) -> Hash {
    use sha3::{Digest, Keccak256};
    let mut hasher = Keccak256::new();
    for part in parts {
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part);
    }
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keccak_known_vector() {
        // Keccak-256 of the empty string (the Ethereum constant).
        let h = keccak256(b"");
        assert_eq!(
            hex::encode(h),
            "c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
        );
    }

    #[test]
    fn concat_is_prefix_unambiguous() {
        let a = keccak256_concat(&[b"AB", b"C"]);
        let b = keccak256_concat(&[b"A", b"BC"]);
        assert_ne!(a, b);
    }

    #[test]
    fn concat_differs_from_plain() {
        assert_ne!(keccak256_concat(&[b"AB"]), keccak256(b"AB"));
    }
}
