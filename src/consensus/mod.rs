//! # aBFT event-DAG consensus
//!
//! Validators emit signed events that reference up to `MAX_PARENTS` earlier
//! events, forming a DAG. Consensus proceeds without extra messages — the
//! DAG itself is the vote transcript:
//!
//! 1. Every inserted event gets a vector clock summarising its causal past
//!    (`vector`). The stake-weighted *forkless-cause* relation derived from
//!    it tolerates up to 1/3 Byzantine stake.
//! 2. Events advance through *frames*; an event that forkless-causes a
//!    quorum of the previous frame's roots becomes a root of the next
//!    (`frames`).
//! 3. Roots vote across frames until exactly one root per frame — the
//!    *atropos* — is decided (`election`).
//! 4. The atropos's unconfirmed ancestry becomes a block, deterministically
//!    ordered by consensus time, Lamport time, and hash (`ordering`).
//! 5. Event emission is rate-limited per validator by stake-proportional
//!    gas power (`gas`), validated on ingress (`checker`).
//! 6. After a configured number of decided frames the epoch is sealed: the
//!    next validator set installs and all epoch-scoped state resets
//!    (`engine`).

pub mod checker;
pub mod election;
pub mod engine;
pub mod event;
pub mod frames;
pub mod gas;
pub mod ordering;
pub mod validators;
pub mod vector;

use event::EventId;

/// Failures of the ingest pipeline. Fork detection is deliberately absent:
/// forks are recorded, not rejected.
#[derive(Debug, thiserror::Error)]
pub enum ConsensusError {
    #[error("event is already connected")]
    AlreadyConnected,
    #[error("missing parent {0:?}")]
    MissingParent(EventId),
    #[error("event epoch {event} does not match current epoch {current}")]
    EpochMismatch { event: u64, current: u64 },
    #[error("signature does not verify against the creator's key")]
    BadSignature,
    #[error("malformed event: {0}")]
    BadStructure(&'static str),
    #[error("claimed gas power left {claimed} does not match computed {computed}")]
    GasMismatch { claimed: u64, computed: u64 },
    #[error(transparent)]
    StorageIO(#[from] crate::store::StorageError),
}
