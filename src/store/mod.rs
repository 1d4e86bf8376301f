//! # Spillover Store
//!
//! The glue between the in-memory tier and the freezer: logical databases,
//! read-through on miss, write-back via the dirty tracker, preload, and
//! the nuke operation.
//!
//! ## Consistency rules
//!
//! - Writes land in the live map and mark the key dirty; the freezer is
//!   never written in the foreground. The background flush propagates
//!   dirty keys later.
//! - A read that misses the live map consults the tracker first: a
//!   *shadowed* key (dirty or flushing) is memory-authoritative, so an
//!   absent shadowed key is logically deleted and the freezer copy must
//!   not be served — it may predate the unflushed mutation.
//! - Only unshadowed misses fall through to the freezer. The payload read
//!   back is checksum-verified; corruption is logged and reported as a
//!   miss. Freezer errors never fail the foreground read path.
//!
//! ## Durability limit
//!
//! The dirty set lives in memory only. A crash before a flush loses the
//! mutations recorded in it; what the last successful flush wrote is what
//! survives.

#[cfg(test)]
mod tests;

use std::{
    collections::HashMap,
    fs, io,
    path::{Path, PathBuf},
    sync::Arc,
    time::SystemTime,
};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::flush::BackgroundState;
use crate::freezer::{EnvOptions, FreezerEnv, FreezerError, Walk};
use crate::payload::{self, PayloadError};
use crate::tracker::DirtyTracker;

/// Directory under the store root holding the freezer environment.
pub const FREEZER_DIR: &str = "freezer";

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Error originating from the freezer store.
    #[error("freezer error: {0}")]
    Freezer(#[from] FreezerError),

    /// Error originating from the dump-payload codec.
    #[error("payload error: {0}")]
    Payload(#[from] PayloadError),

    /// A background operation is already in flight, or the single
    /// pending-requester slot is occupied.
    #[error("busy: {0}")]
    Busy(String),

    /// The background worker thread could not be spawned.
    #[error("background worker spawn failed: {0}")]
    SpawnFailed(io::Error),

    /// The logical database id is outside `0..databases`.
    #[error("unknown logical database {0}")]
    UnknownDatabase(u32),

    /// Rejected configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Underlying filesystem I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Internal invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Configuration and stats
// ------------------------------------------------------------------------------------------------

/// Configuration for a [`Store`] instance. Passed to [`Store::open`].
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Number of logical databases (server-wide constant).
    pub databases: u32,

    /// Freezer address-space reservation: ceiling on total committed bytes.
    pub map_reserve: u64,

    /// Freezer writer transaction buffer capacity in bytes.
    pub txn_write_buffer: usize,

    /// During preload, run the service callback every this many keys.
    pub preload_yield_every: u64,

    /// Where snapshots are written. Removed and recreated on every
    /// snapshot.
    pub snapshot_dir: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            databases: 16,
            map_reserve: 1 << 40, // 1 TiB
            txn_write_buffer: 4 * 1024 * 1024,
            preload_yield_every: 1000,
            snapshot_dir: PathBuf::from("./snapshot"),
        }
    }
}

impl StoreConfig {
    fn validate(&self) -> Result<(), StoreError> {
        if self.databases == 0 {
            return Err(StoreError::Config("databases must be at least 1".into()));
        }
        if self.txn_write_buffer == 0 {
            return Err(StoreError::Config(
                "txn_write_buffer must be non-zero".into(),
            ));
        }
        if self.preload_yield_every == 0 {
            return Err(StoreError::Config(
                "preload_yield_every must be non-zero".into(),
            ));
        }
        if self.snapshot_dir.as_os_str().is_empty() {
            return Err(StoreError::Config("snapshot_dir must be set".into()));
        }
        Ok(())
    }
}

/// Snapshot of store statistics returned by [`Store::stats`].
#[derive(Debug, Clone)]
pub struct StoreStats {
    /// Reads answered from the live map.
    pub hits: u64,
    /// Reads that missed the live map (freezer consulted or shadowed).
    pub misses: u64,
    /// Completed background flushes.
    pub flushes_completed: u64,
    /// Failed background flushes (including snapshot failures).
    pub flushes_failed: u64,
    /// Wall-clock time of the last successful flush.
    pub last_flush_at: Option<SystemTime>,
    /// Keys in the dirty sets, summed over all databases.
    pub dirty_keys: usize,
    /// Keys captured by the in-flight flush, summed over all databases.
    pub flushing_keys: usize,
    /// Mutations since the last successful flush.
    pub dirty_ops: u64,
    /// Whether a preload walk is currently running.
    pub preload_in_progress: bool,
    /// Whether a preload has completed since the store opened.
    pub preload_complete: bool,
    /// Whether a background worker is currently running.
    pub background_active: bool,
    /// Whether a snapshot is queued behind the running flush.
    pub snapshot_pending: bool,
    /// Whether the running (or starting) flush carries a snapshot.
    pub snapshot_in_progress: bool,
}

// ------------------------------------------------------------------------------------------------
// Logical database
// ------------------------------------------------------------------------------------------------

/// One numbered partition: the live map plus its dirty-key shadow sets.
pub(crate) struct LogicalDb {
    pub(crate) id: u32,
    pub(crate) live: HashMap<Vec<u8>, Vec<u8>>,
    pub(crate) tracker: DirtyTracker,
}

impl LogicalDb {
    fn new(id: u32) -> Self {
        Self {
            id,
            live: HashMap::new(),
            tracker: DirtyTracker::new(),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Store
// ------------------------------------------------------------------------------------------------

/// The spillover store: an in-memory key/value tier whose working set may
/// exceed RAM thanks to the on-disk freezer behind it.
///
/// The store is single-owner and foreground-single-threaded by design —
/// all methods take `&mut self`. The only state shared with the
/// background flush worker is the internally-locked freezer environment
/// and a completion channel.
pub struct Store {
    pub(crate) root: PathBuf,
    pub(crate) config: StoreConfig,
    pub(crate) ldbs: Vec<LogicalDb>,

    /// Lazily-opened freezer environment. All access goes through
    /// [`Store::env_handle`]; nothing else may open a second environment.
    env: Option<Arc<FreezerEnv>>,

    pub(crate) hits: u64,
    pub(crate) misses: u64,

    /// Mutations since the last successful flush. Snapshotted into the
    /// coordinator at flush start and subtracted on success.
    pub(crate) dirty_ops: u64,

    pub(crate) preload_in_progress: bool,
    pub(crate) preload_complete: bool,

    pub(crate) background: BackgroundState,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

impl Store {
    /// Opens (or creates) a store rooted at the given directory.
    ///
    /// The freezer environment itself is opened lazily by the first
    /// operation that needs it.
    pub fn open(root: impl AsRef<Path>, config: StoreConfig) -> Result<Self, StoreError> {
        config.validate()?;
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;

        let ldbs = (0..config.databases).map(LogicalDb::new).collect();

        info!(
            root = %root.display(),
            databases = config.databases,
            "spillover store opened"
        );

        Ok(Self {
            root,
            config,
            ldbs,
            env: None,
            hits: 0,
            misses: 0,
            dirty_ops: 0,
            preload_in_progress: false,
            preload_complete: false,
            background: BackgroundState::new(),
        })
    }

    /// The narrow accessor to the freezer environment singleton. Opens it
    /// on first use; duplicate opens are impossible by construction.
    pub(crate) fn env_handle(&mut self) -> Result<Arc<FreezerEnv>, StoreError> {
        if let Some(env) = &self.env {
            return Ok(Arc::clone(env));
        }
        let env = Arc::new(FreezerEnv::open(EnvOptions {
            root: self.root.join(FREEZER_DIR),
            max_subdbs: self.config.databases,
            map_reserve: self.config.map_reserve,
            txn_write_buffer: self.config.txn_write_buffer,
        })?);
        self.env = Some(Arc::clone(&env));
        Ok(env)
    }

    fn check_ldb(&self, ldb: u32) -> Result<(), StoreError> {
        if (ldb as usize) < self.ldbs.len() {
            Ok(())
        } else {
            Err(StoreError::UnknownDatabase(ldb))
        }
    }

    // --------------------------------------------------------------------------------------------
    // Key operations
    // --------------------------------------------------------------------------------------------

    /// Look up `key` in logical database `ldb`.
    ///
    /// Live map first; on a miss, shadowed keys are treated as absent and
    /// only unshadowed keys read through to the freezer.
    pub fn get(&mut self, ldb: u32, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.check_ldb(ldb)?;

        if let Some(value) = self.ldbs[ldb as usize].live.get(key) {
            self.hits += 1;
            return Ok(Some(value.clone()));
        }
        self.misses += 1;

        if self.ldbs[ldb as usize].tracker.is_shadowed(key) {
            // Dirty but absent from memory: logically deleted.
            return Ok(None);
        }
        Ok(self.read_through(ldb, key))
    }

    /// Whether `key` exists in logical database `ldb`.
    pub fn exists(&mut self, ldb: u32, key: &[u8]) -> Result<bool, StoreError> {
        self.check_ldb(ldb)?;

        if self.ldbs[ldb as usize].live.contains_key(key) {
            self.hits += 1;
            return Ok(true);
        }
        self.misses += 1;

        if self.ldbs[ldb as usize].tracker.is_shadowed(key) {
            return Ok(false);
        }
        Ok(self.exists_frozen(ldb, key))
    }

    /// Insert or replace `key` → `value`. The key is marked dirty; the
    /// freezer is untouched until the next flush.
    pub fn set(&mut self, ldb: u32, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.check_ldb(ldb)?;

        let db = &mut self.ldbs[ldb as usize];
        db.live.insert(key.to_vec(), value.to_vec());
        db.tracker.touch(key);
        self.dirty_ops += 1;
        Ok(())
    }

    /// Delete `key`. Returns whether the key logically existed.
    ///
    /// The live entry (if any) is removed and the key marked dirty so the
    /// flush propagates the deletion. A key living only in the freezer is
    /// shadowed the same way; its on-disk copy dies at the next flush.
    pub fn del(&mut self, ldb: u32, key: &[u8]) -> Result<bool, StoreError> {
        self.check_ldb(ldb)?;

        let db = &mut self.ldbs[ldb as usize];
        if db.live.remove(key).is_some() {
            db.tracker.touch(key);
            self.dirty_ops += 1;
            return Ok(true);
        }
        if db.tracker.is_shadowed(key) {
            // Already logically deleted.
            return Ok(false);
        }
        if self.exists_frozen(ldb, key) {
            let db = &mut self.ldbs[ldb as usize];
            db.tracker.touch(key);
            self.dirty_ops += 1;
            return Ok(true);
        }
        Ok(false)
    }

    /// Remove every entry from every freezer sub-database.
    ///
    /// Rejected while a background operation is running — the drain must
    /// not interleave with the wipe. The live map and trackers are left
    /// alone: still-dirty keys legitimately diverge from the now-empty
    /// freezer and will be re-propagated by the next flush.
    pub fn nuke_all(&mut self) -> Result<(), StoreError> {
        if self.background.job.is_some() {
            return Err(StoreError::Busy(
                "cannot nuke while a background operation is running".into(),
            ));
        }

        let env = self.env_handle()?;
        for ldb in 0..self.config.databases {
            let mut handle = env.begin_write(ldb)?;
            handle.clear()?;
            handle.close()?;
        }
        info!(databases = self.config.databases, "freezer nuked");
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Freezer read path (errors demoted to misses)
    // --------------------------------------------------------------------------------------------

    fn read_through(&mut self, ldb: u32, key: &[u8]) -> Option<Vec<u8>> {
        let env = match self.env_handle() {
            Ok(env) => env,
            Err(e) => {
                warn!(ldb, error = %e, "freezer unavailable; treating read as miss");
                return None;
            }
        };
        let handle = match env.begin_read(ldb) {
            Ok(handle) => handle,
            Err(e) => {
                warn!(ldb, error = %e, "freezer read transaction failed; treating as miss");
                return None;
            }
        };
        let envelope = match handle.get(key) {
            Ok(Some(envelope)) => envelope,
            Ok(None) => return None,
            Err(e) => {
                warn!(ldb, error = %e, "freezer read failed; treating as miss");
                return None;
            }
        };
        match payload::decode(&envelope) {
            Ok(body) => Some(body),
            Err(e) => {
                warn!(ldb, error = %e, "corrupt freezer payload; treating as miss");
                None
            }
        }
    }

    fn exists_frozen(&mut self, ldb: u32, key: &[u8]) -> bool {
        let env = match self.env_handle() {
            Ok(env) => env,
            Err(e) => {
                warn!(ldb, error = %e, "freezer unavailable; treating exists as miss");
                return false;
            }
        };
        match env.begin_read(ldb).and_then(|handle| handle.exists(key)) {
            Ok(present) => present,
            Err(e) => {
                warn!(ldb, error = %e, "freezer exists failed; treating as miss");
                false
            }
        }
    }

    // --------------------------------------------------------------------------------------------
    // Preload
    // --------------------------------------------------------------------------------------------

    /// Load every freezer key into the live map.
    ///
    /// Idempotent: only the first call performs work. The `service`
    /// callback is invoked every `preload_yield_every` keys so a
    /// cooperative event loop can run file events while the walk is in
    /// progress; it must not re-enter the store.
    ///
    /// Shadowed keys are skipped even when absent from the live map — a
    /// dirty-deleted key is logically deleted, and resurrecting its
    /// freezer copy would serve a stale value.
    pub fn preload(&mut self, service: &mut dyn FnMut()) -> Result<(), StoreError> {
        if self.preload_in_progress || self.preload_complete {
            debug!("preload skipped (already running or complete)");
            return Ok(());
        }

        self.preload_in_progress = true;
        let result = self.preload_inner(service);
        self.preload_in_progress = false;
        if result.is_ok() {
            self.preload_complete = true;
        }
        result
    }

    fn preload_inner(&mut self, service: &mut dyn FnMut()) -> Result<(), StoreError> {
        let env = self.env_handle()?;
        let yield_every = self.config.preload_yield_every;
        let mut loaded = 0u64;

        for id in 0..self.config.databases {
            let handle = env.begin_read(id)?;
            let db = &mut self.ldbs[id as usize];

            handle.walk_keys(yield_every, service, &mut |key| {
                if db.live.contains_key(key) || db.tracker.is_shadowed(key) {
                    return Walk::Continue;
                }
                match handle.get(key) {
                    Ok(Some(envelope)) => match payload::decode(&envelope) {
                        Ok(body) => {
                            db.live.insert(key.to_vec(), body);
                            loaded += 1;
                        }
                        Err(e) => {
                            warn!(ldb = id, error = %e, "corrupt payload skipped during preload");
                        }
                    },
                    Ok(None) => {}
                    Err(e) => {
                        warn!(ldb = id, error = %e, "freezer read failed during preload");
                    }
                }
                Walk::Continue
            })?;
            handle.close()?;
        }

        info!(loaded, "freezer preload complete");
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Stats
    // --------------------------------------------------------------------------------------------

    /// Returns a snapshot of store statistics.
    pub fn stats(&self) -> StoreStats {
        let dirty_keys = self.ldbs.iter().map(|db| db.tracker.dirty_len()).sum();
        let flushing_keys = self.ldbs.iter().map(|db| db.tracker.flushing_len()).sum();

        StoreStats {
            hits: self.hits,
            misses: self.misses,
            flushes_completed: self.background.flushes_completed,
            flushes_failed: self.background.flushes_failed,
            last_flush_at: self.background.last_flush_at,
            dirty_keys,
            flushing_keys,
            dirty_ops: self.dirty_ops,
            preload_in_progress: self.preload_in_progress,
            preload_complete: self.preload_complete,
            background_active: self.background.job.is_some(),
            snapshot_pending: self.background.snapshot_pending,
            snapshot_in_progress: self.background.snapshot_in_progress,
        }
    }

    /// Zero the hit/miss counters.
    pub fn clear_stats(&mut self) {
        self.hits = 0;
        self.misses = 0;
    }

    /// Keys in the dirty sets, summed over all databases.
    pub fn dirty_count(&self) -> usize {
        self.ldbs.iter().map(|db| db.tracker.dirty_len()).sum()
    }

    /// Keys captured by the in-flight flush, summed over all databases.
    pub fn flushing_count(&self) -> usize {
        self.ldbs.iter().map(|db| db.tracker.flushing_len()).sum()
    }
}
