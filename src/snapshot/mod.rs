//! # Snapshot Coordinator
//!
//! Produces an on-disk, atomic copy of the freezer environment,
//! serialized against flushes.
//!
//! A snapshot always rides on top of a flush: the background worker first
//! drains the captured dirty keys, then copies the environment. The copy
//! therefore reflects exactly the state the flush wrote — there is no
//! window in which the snapshot can contain a half-drained freezer.
//!
//! When a flush is already running, the request is *deferred*: the
//! completion handler starts a follow-up flush with the snapshot flag
//! set. Only one snapshot can be pending or in progress at a time, and
//! the requesting client parks in the single requester slot for its
//! deferred reply.
//!
//! The snapshot directory is removed and recreated on every snapshot, so
//! its contents are always a single coherent copy.

#[cfg(test)]
mod tests;

use std::{fs, io, path::Path};

use tracing::info;

use crate::flush::{DeferredReply, requester_pair};
use crate::freezer::{FreezerEnv, FreezerError};
use crate::store::{Store, StoreError};

impl Store {
    /// Request a flush+snapshot, parking the caller for a deferred reply.
    ///
    /// Rejected with [`StoreError::Busy`] when a snapshot is already
    /// pending or in progress, or when another client occupies the
    /// requester slot. If a plain flush is running, the snapshot is
    /// queued behind it and started by the completion handler.
    pub fn snapshot_begin(&mut self) -> Result<DeferredReply, StoreError> {
        if self.background.snapshot_pending || self.background.snapshot_in_progress {
            return Err(StoreError::Busy(
                "a snapshot is already pending or in progress".into(),
            ));
        }
        if self.background.requester.is_some() {
            return Err(StoreError::Busy(
                "another client is waiting on a background operation".into(),
            ));
        }

        if self.background.job.is_some() {
            let (requester, reply) = requester_pair();
            self.background.requester = Some(requester);
            self.background.snapshot_pending = true;
            info!("snapshot deferred until the running flush completes");
            return Ok(reply);
        }

        self.background.snapshot_in_progress = true;
        match self.flush_begin() {
            Ok(()) => {
                let (requester, reply) = requester_pair();
                self.background.requester = Some(requester);
                Ok(reply)
            }
            Err(e) => {
                self.background.snapshot_in_progress = false;
                Err(e)
            }
        }
    }
}

/// Replace `dest` with a fresh, coherent copy of the freezer environment.
///
/// Runs on the background worker after the drain, when no write
/// transaction is open; the copy's point-in-time consistency is the
/// freezer's [`FreezerEnv::copy_to`] contract.
pub(crate) fn write_snapshot(env: &FreezerEnv, dest: &Path) -> Result<(), FreezerError> {
    match fs::remove_dir_all(dest) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    fs::create_dir_all(dest)?;
    env.copy_to(dest)?;
    info!(dest = %dest.display(), "snapshot written");
    Ok(())
}
