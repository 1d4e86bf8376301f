//! # Freezer Store
//!
//! The on-disk tier of the spillover store: an embedded key/value
//! environment holding one named **sub-database** per logical database,
//! mapping opaque byte keys to opaque byte payloads.
//!
//! ## Design Overview
//!
//! A [`FreezerEnv`] is rooted at a directory and sized with an
//! address-space reservation (`map_reserve`) that caps the total committed
//! bytes across all sub-databases. Each sub-database is a single
//! append-only file, `freezer_<id>.frz`:
//!
//! ```text
//! [HEADER_BYTES][HEADER_CRC32_LE]
//! [REC_LEN_LE][REC_BYTES][REC_CRC32_LE]
//! [REC_LEN_LE][REC_BYTES][REC_CRC32_LE]
//! ...
//! ```
//!
//! Records are `Put { key, payload }` / `Del { key }`; last write wins. An
//! in-memory index (key → committed record slot) is rebuilt by replaying
//! the file when the sub-database is first opened; a torn or corrupt tail
//! is logged and truncated. Committed bytes are read back through a
//! memory map that is refreshed after every commit.
//!
//! ## Transactions
//!
//! All access goes through a short-lived [`FreezerHandle`], the pairing of
//! one transaction with one sub-database:
//!
//! - **Readers** ([`FreezerEnv::begin_read`]) observe committed state only.
//! - **Writers** ([`FreezerEnv::begin_write`]) hold the environment's
//!   single write lock for their whole lifetime and buffer mutations in a
//!   write batch. [`FreezerHandle::close`] commits: records are appended,
//!   fsynced, indexed, and the map refreshed, atomically with respect to
//!   readers. When the batch outgrows `txn_write_buffer`, `put` commits
//!   the batch in place and retries once; only a single record that can
//!   never fit surfaces [`FreezerError::TxnFull`].
//!
//! Dropping an uncommitted writer aborts its batch (logged at debug).
//!
//! ## Environment copy
//!
//! [`FreezerEnv::copy_to`] produces a point-in-time copy of every
//! sub-database file into a destination directory. It takes the write lock
//! and per-sub-database read locks, so the copy is serialized against
//! writers while readers proceed concurrently.


use std::{
    collections::{BTreeMap, HashMap},
    fs::{self, File, OpenOptions},
    io::{self, BufReader, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex, MutexGuard, RwLock,
        atomic::{AtomicU64, Ordering},
    },
};

use crc32fast::Hasher as Crc32;
use memmap2::Mmap;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

const U32_SIZE: usize = std::mem::size_of::<u32>();

/// Per-record framing overhead: 4-byte length prefix + 4-byte CRC32.
const RECORD_FRAMING: usize = 2 * U32_SIZE;

/// File name of a sub-database inside the environment root.
fn subdb_file_name(id: u32) -> String {
    format!("freezer_{id}.frz")
}

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by freezer operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum FreezerError {
    /// The environment could not be created, opened, or sized.
    #[error("environment init failed: {0}")]
    EnvInit(String),

    /// A transaction could not be started.
    #[error("transaction begin failed: {0}")]
    TxnBegin(String),

    /// A sub-database could not be opened or created.
    #[error("sub-database open failed: {0}")]
    DbiOpen(String),

    /// A single record can never fit the transaction write buffer.
    #[error("transaction write buffer exhausted (record needs {needed} bytes, capacity {capacity})")]
    TxnFull {
        /// Bytes the offending record would occupy.
        needed: usize,
        /// Configured write-buffer capacity.
        capacity: usize,
    },

    /// Committing would exceed the environment's address-space reservation.
    #[error("environment reservation exhausted (reserved {reserved} bytes, need {needed} more)")]
    EnvFull {
        /// Configured reservation in bytes.
        reserved: u64,
        /// Additional bytes the commit required.
        needed: u64,
    },

    /// A committed record could not be read back intact.
    #[error("corrupt freezer data: {0}")]
    Corrupt(String),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Internal invariant violation: a poisoned lock, or a record field
    /// past the u32 frame limit. Never produced by ordinary data.
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Options and small result types
// ------------------------------------------------------------------------------------------------

/// Configuration for a [`FreezerEnv`].
#[derive(Debug, Clone)]
pub struct EnvOptions {
    /// Directory holding the sub-database files.
    pub root: PathBuf,

    /// Number of named sub-databases the environment can hold.
    pub max_subdbs: u32,

    /// Address-space reservation: hard ceiling on total committed bytes.
    pub map_reserve: u64,

    /// Writer transaction buffer capacity in bytes.
    pub txn_write_buffer: usize,
}

/// Result of a [`FreezerHandle::del`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelOutcome {
    /// The key existed and a deletion record was staged.
    Deleted,
    /// The key was not present.
    NotFound,
}

/// Flow control for [`FreezerHandle::walk_keys`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Walk {
    /// Keep iterating.
    Continue,
    /// Stop the walk early.
    Stop,
}

// ------------------------------------------------------------------------------------------------
// On-disk format
// ------------------------------------------------------------------------------------------------
//
// Every multi-byte integer on disk is little-endian; variable-length
// fields are framed as `[u32 len][bytes]`. The freezer has exactly two
// things to serialize (the file header and the mutation records), so
// each one writes its own fixed layout — there is no general
// serialization layer behind this module.

/// Record tag for a stored value.
const TAG_PUT: u32 = 0;

/// Record tag for a deletion.
const TAG_DEL: u32 = 1;

/// Metadata at the start of every sub-database file: twelve raw bytes
/// followed by a CRC32 of them.
#[derive(Debug)]
struct SubDbHeader {
    /// Magic constant identifying freezer files (`b"FRZ1"`).
    magic: [u8; 4],

    /// File format version.
    version: u32,

    /// Sub-database id this file belongs to. Guards against files being
    /// shuffled between slots on disk.
    subdb: u32,
}

impl SubDbHeader {
    const MAGIC: [u8; 4] = *b"FRZ1";
    const VERSION: u32 = 1;

    /// Raw size: magic(4) + version(4) + subdb(4).
    const ENCODED_SIZE: usize = 12;

    /// Total on-disk size including the trailing CRC32.
    const DISK_SIZE: u64 = (Self::ENCODED_SIZE + U32_SIZE) as u64;

    fn new(subdb: u32) -> Self {
        Self {
            magic: Self::MAGIC,
            version: Self::VERSION,
            subdb,
        }
    }

    fn to_bytes(&self) -> [u8; Self::ENCODED_SIZE] {
        let mut raw = [0u8; Self::ENCODED_SIZE];
        raw[..4].copy_from_slice(&self.magic);
        raw[4..8].copy_from_slice(&self.version.to_le_bytes());
        raw[8..].copy_from_slice(&self.subdb.to_le_bytes());
        raw
    }

    fn from_bytes(raw: &[u8; Self::ENCODED_SIZE]) -> Self {
        Self {
            magic: [raw[0], raw[1], raw[2], raw[3]],
            version: u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]),
            subdb: u32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]),
        }
    }
}

/// A single mutation record inside a sub-database file.
#[derive(Debug)]
enum SubDbRecord {
    /// Store `payload` under `key`.
    Put { key: Vec<u8>, payload: Vec<u8> },

    /// Remove `key`.
    Del { key: Vec<u8> },
}

/// Serialize a record: a u32 tag, then each field framed.
fn encode_record(record: &SubDbRecord) -> Result<Vec<u8>, FreezerError> {
    let mut buf = Vec::new();
    match record {
        SubDbRecord::Put { key, payload } => {
            buf.extend_from_slice(&TAG_PUT.to_le_bytes());
            frame_field(&mut buf, key)?;
            frame_field(&mut buf, payload)?;
        }
        SubDbRecord::Del { key } => {
            buf.extend_from_slice(&TAG_DEL.to_le_bytes());
            frame_field(&mut buf, key)?;
        }
    }
    Ok(buf)
}

/// Parse a record from its exact byte range. `None` means malformed:
/// unknown tag, bad framing, or trailing bytes.
fn decode_record(buf: &[u8]) -> Option<SubDbRecord> {
    let (tag, at) = split_u32(buf, 0)?;
    match tag {
        TAG_PUT => {
            let (key, at) = split_field(buf, at)?;
            let (payload, at) = split_field(buf, at)?;
            (at == buf.len()).then(|| SubDbRecord::Put {
                key: key.to_vec(),
                payload: payload.to_vec(),
            })
        }
        TAG_DEL => {
            let (key, at) = split_field(buf, at)?;
            (at == buf.len()).then(|| SubDbRecord::Del { key: key.to_vec() })
        }
        _ => None,
    }
}

/// Append `[u32 len][bytes]` to `buf`.
fn frame_field(buf: &mut Vec<u8>, field: &[u8]) -> Result<(), FreezerError> {
    let len = u32::try_from(field.len()).map_err(|_| {
        FreezerError::Internal(format!("{}-byte field exceeds the frame limit", field.len()))
    })?;
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(field);
    Ok(())
}

/// Read the u32 at `at`, returning it with the offset just past it.
fn split_u32(buf: &[u8], at: usize) -> Option<(u32, usize)> {
    let end = at.checked_add(U32_SIZE)?;
    let raw: [u8; U32_SIZE] = buf.get(at..end)?.try_into().ok()?;
    Some((u32::from_le_bytes(raw), end))
}

/// Read a framed `[u32 len][bytes]` field starting at `at`.
fn split_field(buf: &[u8], at: usize) -> Option<(&[u8], usize)> {
    let (len, start) = split_u32(buf, at)?;
    let end = start.checked_add(len as usize)?;
    Some((buf.get(start..end)?, end))
}

/// Exact on-disk cost of a `Put` record including framing.
fn put_cost(key_len: usize, payload_len: usize) -> usize {
    RECORD_FRAMING + U32_SIZE + (U32_SIZE + key_len) + (U32_SIZE + payload_len)
}

/// Exact on-disk cost of a `Del` record including framing.
fn del_cost(key_len: usize) -> usize {
    RECORD_FRAMING + U32_SIZE + (U32_SIZE + key_len)
}

// ------------------------------------------------------------------------------------------------
// Sub-database
// ------------------------------------------------------------------------------------------------

/// Location of a committed record's encoded bytes inside the file.
#[derive(Debug, Clone, Copy)]
struct Slot {
    /// Byte offset of the record bytes (past the length prefix).
    offset: u64,

    /// Length of the record bytes (excluding framing).
    len: u32,
}

/// Mutable state of one sub-database, protected by an `RwLock`.
struct SubDbState {
    /// Append handle to the backing file.
    file: File,

    /// Memory map over the committed region; refreshed after each commit.
    map: Option<Mmap>,

    /// Committed index: key → record slot. `Del` records are never indexed.
    index: HashMap<Vec<u8>, Slot>,

    /// Bytes of the file covered by `index` and `map`.
    committed_len: u64,
}

/// One named sub-database (`freezer_<id>.frz`) inside the environment.
pub(crate) struct SubDb {
    id: u32,
    path: PathBuf,
    state: RwLock<SubDbState>,
}

impl SubDb {
    /// Opens or creates the sub-database file and rebuilds the committed
    /// index by replay. A torn or corrupt tail is truncated with a warning.
    fn open(root: &Path, id: u32) -> Result<Self, FreezerError> {
        let path = root.join(subdb_file_name(id));
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .map_err(|e| FreezerError::DbiOpen(format!("{}: {e}", path.display())))?;

        let file_len = file.metadata()?.len();
        let mut index = HashMap::new();
        let committed_len;

        if file_len == 0 {
            write_header(&mut file, &SubDbHeader::new(id))?;
            file.sync_all()?;
            committed_len = SubDbHeader::DISK_SIZE;
            info!(path = %path.display(), subdb = id, "freezer sub-database created");
        } else {
            committed_len = Self::replay(&file, file_len, id, &path, &mut index)?;
            if committed_len < file_len {
                warn!(
                    path = %path.display(),
                    good = committed_len,
                    total = file_len,
                    "truncating corrupt freezer tail"
                );
                file.set_len(committed_len)?;
                file.sync_all()?;
            }
            debug!(
                path = %path.display(),
                subdb = id,
                keys = index.len(),
                bytes = committed_len,
                "freezer sub-database replayed"
            );
        }

        let map = if committed_len > 0 {
            // SAFETY: the file is append-only and indexed slots never
            // reach past `committed_len`, which the map always covers.
            Some(unsafe { Mmap::map(&file)? })
        } else {
            None
        };

        Ok(Self {
            id,
            path,
            state: RwLock::new(SubDbState {
                file,
                map,
                index,
                committed_len,
            }),
        })
    }

    /// Replays the file into `index`, returning the length of the valid
    /// prefix. Stops (without error) at the first torn or corrupt record.
    fn replay(
        file: &File,
        file_len: u64,
        id: u32,
        path: &Path,
        index: &mut HashMap<Vec<u8>, Slot>,
    ) -> Result<u64, FreezerError> {
        let mut reader = BufReader::new(file);
        reader.seek(SeekFrom::Start(0))?;

        if file_len < SubDbHeader::DISK_SIZE {
            return Err(FreezerError::Corrupt(format!(
                "{}: file shorter than header",
                path.display()
            )));
        }

        let mut header_bytes = [0u8; SubDbHeader::ENCODED_SIZE];
        reader.read_exact(&mut header_bytes)?;
        let mut crc_bytes = [0u8; U32_SIZE];
        reader.read_exact(&mut crc_bytes)?;
        verify_crc(&[&header_bytes], u32::from_le_bytes(crc_bytes))
            .map_err(|_| FreezerError::Corrupt(format!("{}: header checksum", path.display())))?;

        let header = SubDbHeader::from_bytes(&header_bytes);
        if header.magic != SubDbHeader::MAGIC {
            return Err(FreezerError::Corrupt(format!(
                "{}: bad magic",
                path.display()
            )));
        }
        if header.version != SubDbHeader::VERSION {
            return Err(FreezerError::Corrupt(format!(
                "{}: unsupported version {}",
                path.display(),
                header.version
            )));
        }
        if header.subdb != id {
            return Err(FreezerError::Corrupt(format!(
                "{}: header names sub-database {} but slot is {}",
                path.display(),
                header.subdb,
                id
            )));
        }

        let mut offset = SubDbHeader::DISK_SIZE;
        while offset < file_len {
            let remaining = file_len - offset;
            if remaining < U32_SIZE as u64 {
                break; // torn length prefix
            }
            let mut len_bytes = [0u8; U32_SIZE];
            reader.read_exact(&mut len_bytes)?;
            let record_len = u32::from_le_bytes(len_bytes);

            if remaining < (RECORD_FRAMING as u64) + record_len as u64 {
                break; // torn record body or checksum
            }

            let mut record_bytes = vec![0u8; record_len as usize];
            reader.read_exact(&mut record_bytes)?;
            let mut crc_bytes = [0u8; U32_SIZE];
            reader.read_exact(&mut crc_bytes)?;

            if verify_crc(&[&len_bytes, &record_bytes], u32::from_le_bytes(crc_bytes)).is_err() {
                break; // corrupt record, valid prefix ends here
            }

            let Some(record) = decode_record(&record_bytes) else {
                break;
            };

            let slot = Slot {
                offset: offset + U32_SIZE as u64,
                len: record_len,
            };
            match record {
                SubDbRecord::Put { key, .. } => {
                    index.insert(key, slot);
                }
                SubDbRecord::Del { key } => {
                    index.remove(&key);
                }
            }
            offset += RECORD_FRAMING as u64 + record_len as u64;
        }

        Ok(offset)
    }

    fn lock_read(&self) -> Result<std::sync::RwLockReadGuard<'_, SubDbState>, FreezerError> {
        self.state
            .read()
            .map_err(|_| FreezerError::Internal("sub-database lock poisoned".into()))
    }

    fn lock_write(&self) -> Result<std::sync::RwLockWriteGuard<'_, SubDbState>, FreezerError> {
        self.state
            .write()
            .map_err(|_| FreezerError::Internal("sub-database lock poisoned".into()))
    }

    /// Fetch the committed payload stored under `key`, if any.
    fn read_committed(&self, key: &[u8]) -> Result<Option<Vec<u8>>, FreezerError> {
        let state = self.lock_read()?;
        let Some(slot) = state.index.get(key) else {
            return Ok(None);
        };
        let Some(map) = state.map.as_ref() else {
            return Err(FreezerError::Corrupt(format!(
                "{}: committed slot with no mapped region",
                self.path.display()
            )));
        };

        let start = slot.offset as usize;
        let end = start + slot.len as usize;
        if end > map.len() {
            return Err(FreezerError::Corrupt(format!(
                "{}: slot {}..{} beyond mapped {} bytes",
                self.path.display(),
                start,
                end,
                map.len()
            )));
        }

        match decode_record(&map[start..end]) {
            Some(SubDbRecord::Put { payload, .. }) => Ok(Some(payload)),
            Some(SubDbRecord::Del { .. }) => Err(FreezerError::Corrupt(format!(
                "{}: index points at a deletion record",
                self.path.display()
            ))),
            None => Err(FreezerError::Corrupt(format!(
                "{}: undecodable committed record",
                self.path.display()
            ))),
        }
    }

    fn contains_committed(&self, key: &[u8]) -> Result<bool, FreezerError> {
        Ok(self.lock_read()?.index.contains_key(key))
    }

    /// Snapshot of all committed keys, in unspecified order.
    fn committed_keys(&self) -> Result<Vec<Vec<u8>>, FreezerError> {
        Ok(self.lock_read()?.index.keys().cloned().collect())
    }

    fn committed_entry_count(&self) -> Result<usize, FreezerError> {
        Ok(self.lock_read()?.index.len())
    }

    fn committed_len(&self) -> Result<u64, FreezerError> {
        Ok(self.lock_read()?.committed_len)
    }

    /// Append, fsync, index, and remap the batched mutations.
    fn commit(&self, env: &FreezerEnv, txn: &mut WriteTxn<'_>) -> Result<(), FreezerError> {
        if txn.batch.is_empty() {
            return Ok(());
        }

        let mut state = self.lock_write()?;

        let mut out: Vec<u8> = Vec::with_capacity(txn.pending_bytes);
        let mut applied: Vec<(Vec<u8>, Option<Slot>)> = Vec::with_capacity(txn.batch.len());
        let mut cursor = state.committed_len;

        for (key, op) in &txn.batch {
            let record = match op {
                Some(payload) => SubDbRecord::Put {
                    key: key.clone(),
                    payload: payload.clone(),
                },
                None => SubDbRecord::Del { key: key.clone() },
            };
            let record_bytes = encode_record(&record)?;
            let record_len = u32::try_from(record_bytes.len()).map_err(|_| {
                FreezerError::Internal(format!(
                    "{}-byte record exceeds the frame limit",
                    record_bytes.len()
                ))
            })?;

            let len_bytes = record_len.to_le_bytes();
            let crc = compute_crc(&[&len_bytes, &record_bytes]);

            out.extend_from_slice(&len_bytes);
            out.extend_from_slice(&record_bytes);
            out.extend_from_slice(&crc.to_le_bytes());

            let slot = Slot {
                offset: cursor + U32_SIZE as u64,
                len: record_len,
            };
            cursor += RECORD_FRAMING as u64 + record_len as u64;
            applied.push((key.clone(), op.as_ref().map(|_| slot)));
        }

        let grow = out.len() as u64;
        let total = env.committed_bytes.load(Ordering::Acquire);
        if total + grow > env.opts.map_reserve {
            return Err(FreezerError::EnvFull {
                reserved: env.opts.map_reserve,
                needed: total + grow - env.opts.map_reserve,
            });
        }

        state.file.write_all(&out)?;
        state.file.sync_all()?;
        env.committed_bytes.fetch_add(grow, Ordering::AcqRel);
        state.committed_len = cursor;

        for (key, slot) in applied {
            match slot {
                Some(slot) => {
                    state.index.insert(key, slot);
                }
                None => {
                    state.index.remove(&key);
                }
            }
        }

        // SAFETY: same append-only argument as in `open` — slots never
        // point past `committed_len`, which the fresh map covers.
        state.map = Some(unsafe { Mmap::map(&state.file)? });

        trace!(
            path = %self.path.display(),
            records = txn.batch.len(),
            bytes = grow,
            "freezer batch committed"
        );

        txn.batch.clear();
        txn.pending_bytes = 0;
        Ok(())
    }

    /// Remove every entry: truncate to an empty file and rewrite the header.
    fn wipe(&self, env: &FreezerEnv) -> Result<(), FreezerError> {
        let mut state = self.lock_write()?;

        let reclaimed = state.committed_len.saturating_sub(SubDbHeader::DISK_SIZE);
        state.file.set_len(0)?;
        write_header(&mut state.file, &SubDbHeader::new(self.id))?;
        state.file.sync_all()?;

        state.index.clear();
        state.committed_len = SubDbHeader::DISK_SIZE;
        // SAFETY: freshly-written header region, no outstanding slots.
        state.map = Some(unsafe { Mmap::map(&state.file)? });
        env.committed_bytes.fetch_sub(reclaimed, Ordering::AcqRel);

        info!(path = %self.path.display(), subdb = self.id, "freezer sub-database wiped");
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Environment
// ------------------------------------------------------------------------------------------------

/// The freezer environment: a directory of named sub-databases with a
/// single-writer discipline and a total-size reservation.
pub struct FreezerEnv {
    opts: EnvOptions,

    /// Lazily-opened sub-databases.
    subdbs: Mutex<HashMap<u32, Arc<SubDb>>>,

    /// The environment-wide write lock. Writer handles hold it for their
    /// whole lifetime; `copy_to` takes it for the duration of the copy.
    writer_gate: Mutex<()>,

    /// Committed bytes across all *opened* sub-databases, measured
    /// against `opts.map_reserve`. A sub-database joins the tally when it
    /// is first opened.
    committed_bytes: AtomicU64,
}

impl FreezerEnv {
    /// Creates the root directory (if needed) and opens the environment.
    ///
    /// Sub-databases themselves are opened lazily by the first handle that
    /// touches them; their committed bytes count toward the reservation
    /// from the moment they are opened.
    pub fn open(opts: EnvOptions) -> Result<Self, FreezerError> {
        fs::create_dir_all(&opts.root)
            .map_err(|e| FreezerError::EnvInit(format!("{}: {e}", opts.root.display())))?;

        info!(
            root = %opts.root.display(),
            max_subdbs = opts.max_subdbs,
            map_reserve = opts.map_reserve,
            "freezer environment opened"
        );

        Ok(Self {
            opts,
            subdbs: Mutex::new(HashMap::new()),
            writer_gate: Mutex::new(()),
            committed_bytes: AtomicU64::new(0),
        })
    }

    /// Root directory of this environment.
    pub fn root(&self) -> &Path {
        &self.opts.root
    }

    fn open_subdb(&self, ldb: u32) -> Result<Arc<SubDb>, FreezerError> {
        if ldb >= self.opts.max_subdbs {
            return Err(FreezerError::DbiOpen(format!(
                "sub-database {ldb} exceeds environment capacity {}",
                self.opts.max_subdbs
            )));
        }

        let mut subdbs = self
            .subdbs
            .lock()
            .map_err(|_| FreezerError::Internal("sub-database table poisoned".into()))?;

        if let Some(db) = subdbs.get(&ldb) {
            return Ok(Arc::clone(db));
        }

        let db = Arc::new(SubDb::open(&self.opts.root, ldb)?);
        self.committed_bytes
            .fetch_add(db.committed_len()?, Ordering::AcqRel);
        subdbs.insert(ldb, Arc::clone(&db));
        Ok(db)
    }

    /// Begin a read transaction against sub-database `ldb`.
    pub fn begin_read(&self, ldb: u32) -> Result<FreezerHandle<'_>, FreezerError> {
        let subdb = self.open_subdb(ldb)?;
        Ok(FreezerHandle {
            env: self,
            subdb,
            txn: TxnKind::Read,
        })
    }

    /// Begin a write transaction against sub-database `ldb`, acquiring the
    /// environment's single write lock.
    pub fn begin_write(&self, ldb: u32) -> Result<FreezerHandle<'_>, FreezerError> {
        let subdb = self.open_subdb(ldb)?;
        let gate = self
            .writer_gate
            .lock()
            .map_err(|_| FreezerError::TxnBegin("writer gate poisoned".into()))?;
        Ok(FreezerHandle {
            env: self,
            subdb,
            txn: TxnKind::Write(WriteTxn {
                _gate: gate,
                batch: BTreeMap::new(),
                pending_bytes: 0,
            }),
        })
    }

    /// Write an atomic, point-in-time copy of every sub-database file into
    /// `dest`, creating the directory if needed.
    ///
    /// Serialized against writers: the write lock and all open
    /// sub-database read locks are held for the duration. Files present on
    /// disk but not opened this process are copied as-is (no writer can
    /// exist for them either).
    pub fn copy_to(&self, dest: &Path) -> Result<(), FreezerError> {
        let _gate = self
            .writer_gate
            .lock()
            .map_err(|_| FreezerError::TxnBegin("writer gate poisoned".into()))?;

        fs::create_dir_all(dest)?;

        let open: Vec<Arc<SubDb>> = {
            let subdbs = self
                .subdbs
                .lock()
                .map_err(|_| FreezerError::Internal("sub-database table poisoned".into()))?;
            subdbs.values().cloned().collect()
        };
        let mut guards = Vec::with_capacity(open.len());
        for db in &open {
            guards.push(db.lock_read()?);
        }

        let mut copied = 0usize;
        for entry in fs::read_dir(&self.opts.root)? {
            let path = entry?.path();
            if !is_subdb_file(&path) {
                continue;
            }
            let Some(name) = path.file_name() else {
                continue;
            };
            let to = dest.join(name);
            fs::copy(&path, &to)?;
            File::open(&to)?.sync_all()?;
            copied += 1;
        }
        drop(guards);

        if let Ok(dir) = File::open(dest) {
            dir.sync_all()?;
        }

        info!(dest = %dest.display(), files = copied, "freezer environment copied");
        Ok(())
    }
}

fn is_subdb_file(path: &Path) -> bool {
    path.is_file()
        && path.extension().and_then(|s| s.to_str()) == Some("frz")
        && path
            .file_name()
            .and_then(|s| s.to_str())
            .is_some_and(|name| name.starts_with("freezer_"))
}

// ------------------------------------------------------------------------------------------------
// Handle
// ------------------------------------------------------------------------------------------------

/// Writer-side transaction state: the environment write lock plus the
/// buffered batch. `None` values are staged deletions.
struct WriteTxn<'env> {
    _gate: MutexGuard<'env, ()>,
    batch: BTreeMap<Vec<u8>, Option<Vec<u8>>>,

    /// On-disk bytes the batch will occupy at commit. Approximate in one
    /// respect: re-staging the same key counts its cost again.
    pending_bytes: usize,
}

enum TxnKind<'env> {
    Read,
    Write(WriteTxn<'env>),
}

/// A short-lived transaction bound to one sub-database.
///
/// Obtained from [`FreezerEnv::begin_read`] / [`FreezerEnv::begin_write`]
/// and owned by the caller for the duration of a single operation.
/// [`FreezerHandle::close`] commits a writer; dropping an uncommitted
/// writer aborts its batch.
pub struct FreezerHandle<'env> {
    env: &'env FreezerEnv,
    subdb: Arc<SubDb>,
    txn: TxnKind<'env>,
}

impl std::fmt::Debug for FreezerHandle<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FreezerHandle").finish_non_exhaustive()
    }
}

impl<'env> FreezerHandle<'env> {
    /// Sub-database id this handle is bound to.
    pub fn ldb(&self) -> u32 {
        self.subdb.id
    }

    /// Whether this handle holds the environment write lock.
    pub fn is_writer(&self) -> bool {
        matches!(self.txn, TxnKind::Write(_))
    }

    /// Fetch the payload stored under `key`.
    ///
    /// Writers observe their own uncommitted batch; readers observe
    /// committed state only. A miss is `Ok(None)`, never an error.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, FreezerError> {
        if let TxnKind::Write(txn) = &self.txn
            && let Some(op) = txn.batch.get(key)
        {
            return Ok(op.clone());
        }
        self.subdb.read_committed(key)
    }

    /// Whether `key` is present.
    pub fn exists(&self, key: &[u8]) -> Result<bool, FreezerError> {
        if let TxnKind::Write(txn) = &self.txn
            && let Some(op) = txn.batch.get(key)
        {
            return Ok(op.is_some());
        }
        self.subdb.contains_committed(key)
    }

    /// Number of live entries (committed; an open batch is not counted).
    pub fn entry_count(&self) -> Result<usize, FreezerError> {
        self.subdb.committed_entry_count()
    }

    /// Stage `payload` under `key`.
    ///
    /// When the batch cannot absorb the record, the current batch is
    /// committed and the put retried once, transparently. A record that
    /// can never fit the write buffer surfaces [`FreezerError::TxnFull`].
    pub fn put(&mut self, key: &[u8], payload: &[u8]) -> Result<(), FreezerError> {
        let capacity = self.env.opts.txn_write_buffer;
        let cost = put_cost(key.len(), payload.len());

        let TxnKind::Write(txn) = &mut self.txn else {
            return Err(FreezerError::TxnBegin("put on a read transaction".into()));
        };

        if cost > capacity {
            return Err(FreezerError::TxnFull {
                needed: cost,
                capacity,
            });
        }
        if txn.pending_bytes + cost > capacity {
            debug!(
                subdb = self.subdb.id,
                pending = txn.pending_bytes,
                "write buffer full, committing mid-transaction"
            );
            self.subdb.commit(self.env, txn)?;
        }

        txn.batch.insert(key.to_vec(), Some(payload.to_vec()));
        txn.pending_bytes += cost;
        Ok(())
    }

    /// Stage a deletion of `key`.
    pub fn del(&mut self, key: &[u8]) -> Result<DelOutcome, FreezerError> {
        let capacity = self.env.opts.txn_write_buffer;
        let cost = del_cost(key.len());

        // Presence check before borrowing the txn mutably.
        let committed = self.subdb.contains_committed(key)?;

        let TxnKind::Write(txn) = &mut self.txn else {
            return Err(FreezerError::TxnBegin("del on a read transaction".into()));
        };

        let existed = match txn.batch.get(key) {
            Some(Some(_)) => true,
            Some(None) => false,
            None => committed,
        };
        if !existed {
            return Ok(DelOutcome::NotFound);
        }

        if cost > capacity {
            return Err(FreezerError::TxnFull {
                needed: cost,
                capacity,
            });
        }
        if txn.pending_bytes + cost > capacity {
            self.subdb.commit(self.env, txn)?;
        }

        txn.batch.insert(key.to_vec(), None);
        txn.pending_bytes += cost;
        Ok(DelOutcome::Deleted)
    }

    /// Remove every entry in the sub-database. Any staged batch is
    /// discarded first — the wipe supersedes it.
    pub fn clear(&mut self) -> Result<(), FreezerError> {
        let TxnKind::Write(txn) = &mut self.txn else {
            return Err(FreezerError::TxnBegin("clear on a read transaction".into()));
        };
        txn.batch.clear();
        txn.pending_bytes = 0;
        self.subdb.wipe(self.env)
    }

    /// Iterate a snapshot of all committed keys.
    ///
    /// Every `yield_every` keys, `service` is invoked so a cooperative
    /// caller can run its event loop. `visit` controls early termination.
    pub fn walk_keys(
        &self,
        yield_every: u64,
        service: &mut dyn FnMut(),
        visit: &mut dyn FnMut(&[u8]) -> Walk,
    ) -> Result<(), FreezerError> {
        let yield_every = yield_every.max(1);
        let keys = self.subdb.committed_keys()?;
        for (i, key) in keys.iter().enumerate() {
            if i > 0 && i as u64 % yield_every == 0 {
                service();
            }
            if visit(key) == Walk::Stop {
                break;
            }
        }
        Ok(())
    }

    /// Close the transaction: a writer commits its batch, a reader is
    /// simply released.
    pub fn close(mut self) -> Result<(), FreezerError> {
        if let TxnKind::Write(txn) = &mut self.txn {
            self.subdb.commit(self.env, txn)?;
        }
        Ok(())
    }
}

impl Drop for FreezerHandle<'_> {
    fn drop(&mut self) {
        if let TxnKind::Write(txn) = &self.txn
            && !txn.batch.is_empty()
        {
            debug!(
                subdb = self.subdb.id,
                staged = txn.batch.len(),
                "aborting uncommitted freezer write transaction"
            );
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Header / CRC helpers
// ------------------------------------------------------------------------------------------------

/// Writes a [`SubDbHeader`] followed by its CRC32 checksum.
fn write_header<W: Write>(writer: &mut W, header: &SubDbHeader) -> Result<(), FreezerError> {
    let raw = header.to_bytes();
    let crc = compute_crc(&[&raw]);
    writer.write_all(&raw)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

/// Computes a CRC32 checksum over one or more byte slices.
fn compute_crc(parts: &[&[u8]]) -> u32 {
    let mut hasher = Crc32::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize()
}

/// Verifies that the CRC32 over the given byte slices matches `expected`.
fn verify_crc(parts: &[&[u8]], expected: u32) -> Result<(), FreezerError> {
    if compute_crc(parts) != expected {
        return Err(FreezerError::Corrupt("checksum mismatch".into()));
    }
    Ok(())
}
