//! # Dirty-Key Tracker
//!
//! The shadow set that records which in-memory entries diverge from the
//! freezer. Each logical database owns one [`DirtyTracker`] with two sets:
//!
//! - **dirty** — keys mutated since the last flush began.
//! - **flushing** — keys captured by the currently running flush.
//!
//! A key present in either set is *shadowed*: the freezer's copy for it is
//! stale or missing, so reads must treat the in-memory tier as
//! authoritative and never fall through to disk.
//!
//! ## Rotation protocol
//!
//! The flush coordinator drives the sets through a strict cycle:
//!
//! 1. [`rotate`](DirtyTracker::rotate) — dirty becomes flushing, dirty is
//!    emptied (precondition: flushing is empty; the coordinator checks).
//! 2. The background worker drains the captured keys.
//! 3. On success, [`clear_flushing`](DirtyTracker::clear_flushing); on
//!    failure, [`merge_flushing_back`](DirtyTracker::merge_flushing_back) —
//!    how far the worker got is unknown, so everything is treated as still
//!    dirty. A redundant rewrite is cheaper than a lost one.
//!
//! Outside the rotation instant, `dirty ∩ flushing = ∅` always holds:
//! `touch` inserts into `dirty` only, and the three transitions above move
//! whole sets.
//!
//! Keys are stored as owned copies, severing any lifetime coupling to the
//! live map — deleting a live entry never invalidates its shadow.

#[cfg(test)]
mod tests;

use std::collections::HashSet;

use tracing::trace;

/// Per-database dirty/flushing shadow sets.
#[derive(Debug, Default)]
pub struct DirtyTracker {
    /// Keys mutated since the last flush began.
    dirty: HashSet<Vec<u8>>,

    /// Keys captured by the in-flight flush.
    flushing: HashSet<Vec<u8>>,
}

impl DirtyTracker {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `key` has diverged from the freezer. Idempotent;
    /// returns `true` when the key was newly inserted.
    pub fn touch(&mut self, key: &[u8]) -> bool {
        if self.dirty.contains(key) {
            return false;
        }
        self.dirty.insert(key.to_vec())
    }

    /// Whether `key` is shadowed — in `dirty` **or** `flushing` — meaning
    /// the freezer copy must not be served.
    pub fn is_shadowed(&self, key: &[u8]) -> bool {
        self.dirty.contains(key) || self.flushing.contains(key)
    }

    /// Number of dirty keys.
    pub fn dirty_len(&self) -> usize {
        self.dirty.len()
    }

    /// Number of keys captured by the in-flight flush.
    pub fn flushing_len(&self) -> usize {
        self.flushing.len()
    }

    /// Iterate the dirty keys (capture order unspecified).
    pub fn dirty_keys(&self) -> impl Iterator<Item = &Vec<u8>> {
        self.dirty.iter()
    }

    /// Swap `dirty` into `flushing`, leaving `dirty` empty.
    ///
    /// The caller must have verified that `flushing` is empty — rotating
    /// over a live flushing set would orphan its keys.
    pub fn rotate(&mut self) {
        debug_assert!(self.flushing.is_empty(), "rotate over a live flushing set");
        std::mem::swap(&mut self.dirty, &mut self.flushing);
        trace!(captured = self.flushing.len(), "dirty set rotated");
    }

    /// Move every flushing key back into `dirty`; used when the background
    /// worker fails and the keys must be re-flushed.
    pub fn merge_flushing_back(&mut self) {
        trace!(restored = self.flushing.len(), "flushing set merged back");
        self.dirty.extend(self.flushing.drain());
    }

    /// Forget the flushing set; used when the background worker succeeded.
    pub fn clear_flushing(&mut self) {
        self.flushing.clear();
    }
}
