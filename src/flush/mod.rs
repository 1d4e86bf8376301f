//! # Background Flush Coordinator
//!
//! Drains dirty keys into the freezer without blocking foreground traffic.
//!
//! ## Protocol
//!
//! [`Store::flush_begin`] runs entirely in the foreground:
//!
//! 1. Reject if a worker is already running; fail loudly if any flushing
//!    set was left undrained (the completion handler never ran — a
//!    programmer error, not a runtime condition).
//! 2. Snapshot the global dirty-op counter.
//! 3. **Capture**: encode every dirty key's live value into a dump-payload
//!    (absence is captured as a deletion). This is the point-in-time
//!    boundary — the worker only ever sees this copy.
//! 4. Spawn the worker thread. A spawn failure mutates nothing.
//! 5. **Rotate** every tracker: the captured keys become `flushing`, the
//!    dirty sets are empty again, and foreground mutations from here on
//!    land in the next flush cycle.
//!
//! The worker writes the captured batch through ordinary freezer write
//! transactions and reports on a channel. It never touches the live map
//! or the trackers — merging results back is the foreground's job,
//! performed by [`Store::poll_background`] from the event loop:
//!
//! - **Success** — flushing sets cleared, dirty-op counter decremented by
//!   the captured amount, stats stamped, parked requester answered.
//! - **Failure** (error or worker panic) — every flushing set merges back
//!   into dirty. How far the worker got is unknown; re-flushing a key
//!   that made it is harmless, losing one that did not is not.
//!
//! A deferred snapshot request chains a follow-up flush from the
//! completion handler with `snapshot_in_progress` set.


use std::{path::PathBuf, sync::Arc, thread, time::SystemTime};

use crossbeam::channel::{Receiver, Sender, TryRecvError, bounded};
use tracing::{debug, error, info};

use crate::freezer::{FreezerEnv, FreezerError};
use crate::payload;
use crate::snapshot::write_snapshot;
use crate::store::{Store, StoreError};

// ------------------------------------------------------------------------------------------------
// Coordinator state
// ------------------------------------------------------------------------------------------------

/// Deferred reply handed to the caller of an admin `FLUSH`/`SNAPSHOT`:
/// resolves to `Ok(message)` on completion, `Err(message)` on failure.
pub type DeferredReply = Receiver<Result<String, String>>;

/// The single pending-requester slot's sending half.
pub(crate) struct Requester {
    reply: Sender<Result<String, String>>,
}

impl Requester {
    pub(crate) fn send_ok(self, message: &str) {
        let _ = self.reply.send(Ok(message.to_string()));
    }

    pub(crate) fn send_err(self, message: String) {
        let _ = self.reply.send(Err(message));
    }
}

/// Create a parked requester and the receiver its reply will arrive on.
pub(crate) fn requester_pair() -> (Requester, DeferredReply) {
    let (tx, rx) = bounded(1);
    (Requester { reply: tx }, rx)
}

/// A running background worker.
pub(crate) struct FlushJob {
    worker: thread::JoinHandle<()>,
    done: Receiver<FlushOutcome>,

    /// Whether this job writes a snapshot after draining.
    snapshot: bool,
}

/// What the worker reports on its completion channel.
#[derive(Debug)]
pub(crate) enum FlushOutcome {
    Completed { puts: u64, dels: u64 },
    Failed { stage: FailureStage, message: String },
}

/// Which phase of the background job failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FailureStage {
    Flush,
    Snapshot,
}

/// Completion event returned by [`Store::poll_background`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackgroundEvent {
    /// A plain flush finished and its flushing sets were cleared.
    FlushCompleted,
    /// A plain flush failed; its keys were merged back into dirty.
    FlushFailed,
    /// A flush+snapshot finished; the snapshot directory is coherent.
    SnapshotCompleted,
    /// A flush+snapshot failed in either phase.
    SnapshotFailed,
}

/// Coordinator state owned by the store.
pub(crate) struct BackgroundState {
    pub(crate) job: Option<FlushJob>,
    pub(crate) requester: Option<Requester>,
    pub(crate) snapshot_pending: bool,
    pub(crate) snapshot_in_progress: bool,

    /// Value of the dirty-op counter when the running flush was captured.
    pub(crate) dirty_before_flush: u64,

    pub(crate) flushes_completed: u64,
    pub(crate) flushes_failed: u64,
    pub(crate) last_flush_at: Option<SystemTime>,
}

impl BackgroundState {
    pub(crate) fn new() -> Self {
        Self {
            job: None,
            requester: None,
            snapshot_pending: false,
            snapshot_in_progress: false,
            dirty_before_flush: 0,
            flushes_completed: 0,
            flushes_failed: 0,
            last_flush_at: None,
        }
    }
}

/// The captured dirty entries of one logical database. `None` payloads
/// are deletions.
struct LdbBatch {
    ldb: u32,
    entries: Vec<(Vec<u8>, Option<Vec<u8>>)>,
}

// ------------------------------------------------------------------------------------------------
// Coordinator — foreground side
// ------------------------------------------------------------------------------------------------

impl Store {
    /// Start a background flush of all dirty keys.
    ///
    /// Returns [`StoreError::Busy`] while a worker is running and
    /// [`StoreError::Internal`] if a flushing set was left undrained.
    /// On [`StoreError::SpawnFailed`] nothing has been rotated and the
    /// dirty sets are untouched.
    pub fn flush_begin(&mut self) -> Result<(), StoreError> {
        if self.background.job.is_some() {
            return Err(StoreError::Busy(
                "a background flush is already running".into(),
            ));
        }
        for db in &self.ldbs {
            if db.tracker.flushing_len() != 0 {
                error!(
                    ldb = db.id,
                    stranded = db.tracker.flushing_len(),
                    "flushing set not drained before new flush"
                );
                return Err(StoreError::Internal(
                    "flushing set not drained; a completion handler never ran".into(),
                ));
            }
        }

        // Everything fallible happens before rotation so a failure here
        // leaves the store exactly as it was.
        let env = self.env_handle()?;
        let dirty_before = self.dirty_ops;

        let mut batches = Vec::new();
        let mut captured = 0usize;
        for db in &self.ldbs {
            if db.tracker.dirty_len() == 0 {
                continue;
            }
            let mut entries = Vec::with_capacity(db.tracker.dirty_len());
            for key in db.tracker.dirty_keys() {
                let op = match db.live.get(key.as_slice()) {
                    Some(value) => Some(payload::encode(value)?),
                    None => None,
                };
                entries.push((key.clone(), op));
            }
            captured += entries.len();
            batches.push(LdbBatch {
                ldb: db.id,
                entries,
            });
        }

        let with_snapshot = self.background.snapshot_in_progress;
        let snapshot_dest = with_snapshot.then(|| self.config.snapshot_dir.clone());

        let (done_tx, done_rx) = bounded(1);
        let worker_env = Arc::clone(&env);
        let worker = thread::Builder::new()
            .name("permafrost-flush".into())
            .spawn(move || drain(worker_env, batches, snapshot_dest, done_tx))
            .map_err(StoreError::SpawnFailed)?;

        for db in &mut self.ldbs {
            db.tracker.rotate();
        }
        self.background.dirty_before_flush = dirty_before;
        self.background.job = Some(FlushJob {
            worker,
            done: done_rx,
            snapshot: with_snapshot,
        });

        info!(captured, snapshot = with_snapshot, "background flush started");
        Ok(())
    }

    /// Start a flush on behalf of an admin client, parking it in the
    /// requester slot for a deferred reply.
    pub fn flush_request(&mut self) -> Result<DeferredReply, StoreError> {
        if self.background.requester.is_some() {
            return Err(StoreError::Busy(
                "another client is waiting on a background operation".into(),
            ));
        }
        self.flush_begin()?;
        let (requester, reply) = requester_pair();
        self.background.requester = Some(requester);
        Ok(reply)
    }

    /// Non-blocking completion check, meant to be called periodically from
    /// the event loop. Returns the completion event when the worker has
    /// finished, `None` otherwise.
    pub fn poll_background(&mut self) -> Option<BackgroundEvent> {
        let outcome = {
            let job = self.background.job.as_ref()?;
            match job.done.try_recv() {
                Ok(outcome) => outcome,
                Err(TryRecvError::Empty) => return None,
                // A dropped sender without a message: the worker died
                // mid-drain (panic). Same handling as a reported failure.
                Err(TryRecvError::Disconnected) => FlushOutcome::Failed {
                    stage: FailureStage::Flush,
                    message: "background worker terminated abnormally".into(),
                },
            }
        };

        let job = self.background.job.take()?;
        if job.worker.join().is_err() {
            error!("background worker panicked");
        }
        Some(self.on_background_exit(job.snapshot, outcome))
    }

    /// The completion handler: merge the worker's result back into
    /// foreground state, answer the parked requester, and chain a
    /// deferred snapshot if one is queued.
    fn on_background_exit(&mut self, was_snapshot: bool, outcome: FlushOutcome) -> BackgroundEvent {
        let event = match outcome {
            FlushOutcome::Completed { puts, dels } => {
                for db in &mut self.ldbs {
                    db.tracker.clear_flushing();
                }
                self.dirty_ops = self
                    .dirty_ops
                    .saturating_sub(self.background.dirty_before_flush);
                self.background.dirty_before_flush = 0;
                self.background.last_flush_at = Some(SystemTime::now());
                self.background.flushes_completed += 1;
                if was_snapshot {
                    self.background.snapshot_in_progress = false;
                }

                info!(puts, dels, snapshot = was_snapshot, "background flush completed");

                // A requester parked while a snapshot is pending is
                // waiting for the follow-up flush+snapshot, not this one.
                if !self.background.snapshot_pending
                    && let Some(requester) = self.background.requester.take()
                {
                    requester.send_ok(if was_snapshot {
                        "snapshot complete"
                    } else {
                        "flush complete"
                    });
                }

                if was_snapshot {
                    BackgroundEvent::SnapshotCompleted
                } else {
                    BackgroundEvent::FlushCompleted
                }
            }

            FlushOutcome::Failed { stage, message } => {
                // How far the worker got is unknown: treat everything it
                // captured as still dirty.
                for db in &mut self.ldbs {
                    db.tracker.merge_flushing_back();
                }
                self.background.dirty_before_flush = 0;
                self.background.flushes_failed += 1;
                if was_snapshot {
                    self.background.snapshot_in_progress = false;
                }

                error!(?stage, %message, "background operation failed");

                if let Some(requester) = self.background.requester.take() {
                    requester.send_err(match stage {
                        FailureStage::Flush => {
                            format!("background flush failed; consult logs ({message})")
                        }
                        FailureStage::Snapshot => {
                            format!("snapshot failed; consult logs ({message})")
                        }
                    });
                }
                // The failure also answered a client waiting on a
                // deferred snapshot; do not chain one on its behalf.
                self.background.snapshot_pending = false;

                if was_snapshot || stage == FailureStage::Snapshot {
                    BackgroundEvent::SnapshotFailed
                } else {
                    BackgroundEvent::FlushFailed
                }
            }
        };

        if self.background.snapshot_pending {
            self.background.snapshot_pending = false;
            self.background.snapshot_in_progress = true;
            debug!("starting deferred flush+snapshot");
            if let Err(e) = self.flush_begin() {
                error!(error = %e, "deferred snapshot failed to start");
                self.background.snapshot_in_progress = false;
                if let Some(requester) = self.background.requester.take() {
                    requester.send_err(format!("snapshot failed to start; consult logs ({e})"));
                }
            }
        }

        event
    }
}

// ------------------------------------------------------------------------------------------------
// Worker — background side
// ------------------------------------------------------------------------------------------------

/// Drain the captured batches into the freezer, then write the snapshot
/// if this job carries one. Runs on the worker thread; reports exactly
/// once on `done`.
fn drain(
    env: Arc<FreezerEnv>,
    batches: Vec<LdbBatch>,
    snapshot_dest: Option<PathBuf>,
    done: Sender<FlushOutcome>,
) {
    let mut puts = 0u64;
    let mut dels = 0u64;

    for batch in &batches {
        if let Err(e) = drain_one(&env, batch, &mut puts, &mut dels) {
            error!(ldb = batch.ldb, error = %e, "flush drain failed");
            let _ = done.send(FlushOutcome::Failed {
                stage: FailureStage::Flush,
                message: e.to_string(),
            });
            return;
        }
    }

    if let Some(dest) = snapshot_dest {
        if let Err(e) = write_snapshot(&env, &dest) {
            error!(dest = %dest.display(), error = %e, "snapshot write failed");
            let _ = done.send(FlushOutcome::Failed {
                stage: FailureStage::Snapshot,
                message: e.to_string(),
            });
            return;
        }
    }

    debug!(puts, dels, "flush drain finished");
    let _ = done.send(FlushOutcome::Completed { puts, dels });
}

/// Write one database's captured entries through a single freezer write
/// transaction. The handle absorbs write-buffer overflow internally, so
/// this loop stays oblivious to mid-transaction commits.
fn drain_one(
    env: &FreezerEnv,
    batch: &LdbBatch,
    puts: &mut u64,
    dels: &mut u64,
) -> Result<(), FreezerError> {
    let mut handle = env.begin_write(batch.ldb)?;
    for (key, op) in &batch.entries {
        match op {
            Some(envelope) => {
                handle.put(key, envelope)?;
                *puts += 1;
            }
            None => {
                // Absent from the capture: deleted in memory. NotFound is
                // fine — the key may never have reached the freezer.
                handle.del(key)?;
                *dels += 1;
            }
        }
    }
    handle.close()
}
