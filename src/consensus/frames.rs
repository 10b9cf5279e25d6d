//! Frame assignment and root detection.
//!
//! An event's frame is derived from its parents: if the event
//! forkless-causes roots carrying a quorum of stake at its parents' highest
//! frame, it advances to the next frame and becomes that frame's root for
//! its creator; otherwise it stays at the parents' frame. Parentless events
//! open the epoch as roots of frame 1.

use std::collections::HashSet;

use crate::consensus::event::{EventHeader, EventId};
use crate::consensus::vector::VectorIndex;
use crate::constants::FIRST_FRAME;
use crate::store::{Storage, StorageError};

/// The computed placement of an event in the frame lattice.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameAssignment {
    pub frame: u64,
    pub is_root: bool,
}

/// Compute the frame and root flag of an inserted, vector-indexed event.
/// Parent headers must already be stored with their frames assigned.
pub fn assign_frame<S: Storage>(
    vi: &VectorIndex,
    store: &S,
    header: &EventHeader,
) -> Result<FrameAssignment, StorageError> {
    let id = header.id();

    let mut max_parent_frame = 0u64;
    let mut self_parent_frame = None;
    for p in header.real_parents() {
        let parent = store
            .get_event(&p)?
            .expect("checked event has stored parents");
        max_parent_frame = max_parent_frame.max(parent.frame);
        if Some(p) == header.self_parent() {
            self_parent_frame = Some(parent.frame);
        }
    }

    if max_parent_frame == 0 {
        // First events of the epoch.
        return Ok(FrameAssignment {
            frame: FIRST_FRAME,
            is_root: true,
        });
    }

    let frame = if sees_quorum_of_roots(vi, store, &id, max_parent_frame)? {
        max_parent_frame + 1
    } else {
        max_parent_frame
    };

    let is_root = match self_parent_frame {
        Some(sp_frame) => frame > sp_frame,
        // A validator's first event of the epoch opens its root slot at
        // whatever frame it lands on.
        None => true,
    };

    Ok(FrameAssignment { frame, is_root })
}

/// True iff the roots of `frame` that `observer` forkless-causes carry a
/// quorum of stake. Forked same-slot roots count their creator's stake once.
pub fn sees_quorum_of_roots<S: Storage>(
    vi: &VectorIndex,
    store: &S,
    observer: &EventId,
    frame: u64,
) -> Result<bool, StorageError> {
    let mut counted = HashSet::new();
    let mut stake = 0u64;
    for (creator, root) in store.roots_at(frame)? {
        if counted.contains(&creator) {
            continue;
        }
        if vi.forkless_cause(observer, &root) {
            counted.insert(creator);
            stake += vi.validators().get(&creator);
        }
    }
    Ok(vi.validators().has_quorum(stake))
}
