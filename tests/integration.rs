//! Integration tests for the public `Store` API.
//!
//! These tests exercise the full spillover stack (live map → dirty
//! tracker → background flush → freezer → snapshot) through the public
//! `permafrost::{Store, StoreConfig}` surface plus the freezer/payload
//! modules where a test needs to inspect or seed disk state directly.
//!
//! ## Coverage areas
//! - **Shadowing**: writes and deletes stay memory-authoritative over a
//!   stale freezer copy, before and during flushes
//! - **Flush**: persistence, dirty/flushing bookkeeping, concurrent
//!   mutations during a drain, failure merge-back
//! - **Snapshot**: coherent environment copies, deferred snapshots
//! - **Admin**: deferred replies end to end
//! - **Reopen**: a fresh process sees exactly the flushed state
//!
//! ## See also
//! - `src/flush/tests` — coordinator-level unit tests
//! - `src/freezer/tests` — on-disk format unit tests

use permafrost::freezer::{EnvOptions, FreezerEnv};
use permafrost::{AdminReply, BackgroundEvent, Store, StoreConfig, dispatch, payload};
use std::path::Path;
use tempfile::TempDir;

// ------------------------------------------------------------------------------------------------
// Helpers
// ------------------------------------------------------------------------------------------------

const DATABASES: u32 = 4;

fn config(tmp: &TempDir) -> StoreConfig {
    StoreConfig {
        databases: DATABASES,
        snapshot_dir: tmp.path().join("snapshot"),
        ..StoreConfig::default()
    }
}

fn open_store(tmp: &TempDir) -> Store {
    Store::open(tmp.path().join("store"), config(tmp)).expect("open store")
}

fn reopen_store(tmp: &TempDir) -> Store {
    Store::open(tmp.path().join("store"), config(tmp)).expect("reopen store")
}

fn wait_background(store: &mut Store) -> BackgroundEvent {
    for _ in 0..2000 {
        if let Some(event) = store.poll_background() {
            return event;
        }
        std::thread::sleep(std::time::Duration::from_millis(2));
    }
    panic!("background worker never completed");
}

fn flush_and_wait(store: &mut Store) {
    store.flush_begin().expect("flush");
    assert_eq!(wait_background(store), BackgroundEvent::FlushCompleted);
}

/// Open the freezer environment of `root` directly (the store must be
/// idle or dropped) and write an enveloped value.
fn poke_freezer(root: &Path, ldb: u32, key: &[u8], value: &[u8]) {
    let env = FreezerEnv::open(EnvOptions {
        root: root.join("freezer"),
        max_subdbs: DATABASES,
        map_reserve: 1 << 30,
        txn_write_buffer: 1 << 20,
    })
    .expect("open freezer env");
    let mut w = env.begin_write(ldb).expect("begin write");
    w.put(key, &payload::encode(value).expect("encode"))
        .expect("put");
    w.close().expect("commit");
}

// ================================================================================================
// Shadowing
// ================================================================================================

/// # Scenario
/// A freshly written key must be served from memory even when the freezer
/// holds a stale value for it.
///
/// # Starting environment
/// Freezer seeded with `("a", "0")` directly, store opened afterwards.
///
/// # Actions
/// 1. `set("a", "1")` — no flush.
/// 2. `get("a")`.
///
/// # Expected behavior
/// The returned value is `"1"`; the stale freezer copy is never consulted.
#[test]
fn write_then_read_bypasses_freezer() {
    let tmp = TempDir::new().unwrap();
    poke_freezer(&tmp.path().join("store"), 0, b"a", b"0");

    let mut store = open_store(&tmp);
    store.set(0, b"a", b"1").unwrap();
    assert_eq!(store.get(0, b"a").unwrap(), Some(b"1".to_vec()));
}

/// # Scenario
/// Deleting a key that only exists in the freezer hides the on-disk copy.
///
/// # Starting environment
/// Freezer seeded with `("a", "1")`; nothing in memory.
///
/// # Actions
/// 1. `del("a")`.
/// 2. `get("a")` / `exists("a")`.
///
/// # Expected behavior
/// The key is absent: the dirty shadow suppresses the freezer copy.
#[test]
fn delete_shadows_freezer() {
    let tmp = TempDir::new().unwrap();
    poke_freezer(&tmp.path().join("store"), 0, b"a", b"1");

    let mut store = open_store(&tmp);
    assert_eq!(store.get(0, b"a").unwrap(), Some(b"1".to_vec()));
    assert!(store.del(0, b"a").unwrap());
    assert_eq!(store.get(0, b"a").unwrap(), None);
    assert!(!store.exists(0, b"a").unwrap());
}

// ================================================================================================
// Flush
// ================================================================================================

/// # Scenario
/// A flush persists all dirty entries and leaves both shadow sets empty.
///
/// # Actions
/// 1. `set("a", "1")`, `set("b", "2")`.
/// 2. Admin `FLUSH`; poll to completion.
/// 3. Reopen the store from disk.
///
/// # Expected behavior
/// `dirty = flushing = 0` after completion; the reopened store serves
/// both keys from the freezer.
#[test]
fn flush_persists_and_clears_dirty() {
    let tmp = TempDir::new().unwrap();
    let mut store = open_store(&tmp);

    store.set(0, b"a", b"1").unwrap();
    store.set(0, b"b", b"2").unwrap();

    let AdminReply::Deferred(reply) = dispatch(&mut store, &["FLUSH"], &mut || {}) else {
        panic!("expected deferred reply");
    };
    assert_eq!(wait_background(&mut store), BackgroundEvent::FlushCompleted);
    assert_eq!(reply.recv().unwrap(), Ok("flush complete".to_string()));

    let stats = store.stats();
    assert_eq!(stats.dirty_keys, 0);
    assert_eq!(stats.flushing_keys, 0);
    assert_eq!(stats.flushes_completed, 1);
    drop(store);

    let mut store = reopen_store(&tmp);
    assert_eq!(store.get(0, b"a").unwrap(), Some(b"1".to_vec()));
    assert_eq!(store.get(0, b"b").unwrap(), Some(b"2".to_vec()));
    assert_eq!(store.stats().misses, 2, "served from the freezer");
}

/// # Scenario
/// Writes racing a flush land in the new dirty set and reach the freezer
/// with the next flush.
///
/// # Actions
/// 1. `set("a", "1")`; begin a flush.
/// 2. Immediately `set("b", "2")` while the worker runs.
/// 3. Complete; flush again; complete.
///
/// # Expected behavior
/// After the first completion `dirty = {b}`, `flushing = ∅`; after the
/// second, a reopened store serves both keys from disk.
#[test]
fn concurrent_writes_survive_a_flush() {
    let tmp = TempDir::new().unwrap();
    let mut store = open_store(&tmp);

    store.set(0, b"a", b"1").unwrap();
    store.flush_begin().unwrap();
    store.set(0, b"b", b"2").unwrap();

    assert_eq!(wait_background(&mut store), BackgroundEvent::FlushCompleted);
    assert_eq!(store.stats().dirty_keys, 1);
    assert_eq!(store.stats().flushing_keys, 0);

    flush_and_wait(&mut store);
    drop(store);

    let mut store = reopen_store(&tmp);
    assert_eq!(store.get(0, b"a").unwrap(), Some(b"1".to_vec()));
    assert_eq!(store.get(0, b"b").unwrap(), Some(b"2".to_vec()));
}

/// # Scenario
/// A failing background worker loses nothing: all captured keys return
/// to the dirty set and the parked client hears about the failure.
///
/// # Starting environment
/// A freezer write buffer too small for any record, so every drain fails.
///
/// # Actions
/// 1. `set("a", "1")`; admin `FLUSH` with a parked client.
/// 2. `set("b", "2")` while the doomed worker runs.
/// 3. Poll to completion.
///
/// # Expected behavior
/// `dirty = {a, b}`, `flushing = ∅`, failure stat incremented, the
/// client receives an error mentioning the logs.
#[test]
fn worker_failure_restores_dirty_keys() {
    let tmp = TempDir::new().unwrap();
    let mut store = Store::open(
        tmp.path().join("store"),
        StoreConfig {
            txn_write_buffer: 8,
            ..config(&tmp)
        },
    )
    .unwrap();

    store.set(0, b"a", b"1").unwrap();
    let AdminReply::Deferred(reply) = dispatch(&mut store, &["FLUSH"], &mut || {}) else {
        panic!("expected deferred reply");
    };
    store.set(0, b"b", b"2").unwrap();

    assert_eq!(wait_background(&mut store), BackgroundEvent::FlushFailed);
    assert_eq!(store.stats().dirty_keys, 2);
    assert_eq!(store.stats().flushing_keys, 0);
    assert_eq!(store.stats().flushes_failed, 1);

    let message = reply.recv().unwrap().unwrap_err();
    assert!(message.contains("consult logs"), "reply was: {message}");

    // Values remain correct in memory.
    assert_eq!(store.get(0, b"a").unwrap(), Some(b"1".to_vec()));
    assert_eq!(store.get(0, b"b").unwrap(), Some(b"2".to_vec()));
}

/// # Scenario
/// Keys spread over several logical databases flush in one pass and stay
/// partitioned.
#[test]
fn flush_covers_all_databases() {
    let tmp = TempDir::new().unwrap();
    let mut store = open_store(&tmp);

    for ldb in 0..DATABASES {
        store
            .set(ldb, b"where", format!("db-{ldb}").as_bytes())
            .unwrap();
    }
    flush_and_wait(&mut store);
    drop(store);

    let mut store = reopen_store(&tmp);
    for ldb in 0..DATABASES {
        assert_eq!(
            store.get(ldb, b"where").unwrap(),
            Some(format!("db-{ldb}").into_bytes())
        );
    }
}

// ================================================================================================
// Snapshot
// ================================================================================================

/// # Scenario
/// A snapshot issued while a flush runs is deferred, chains a follow-up
/// flush+snapshot, and produces a coherent on-disk copy.
///
/// # Actions
/// 1. `set("a", "1")`; begin a plain flush.
/// 2. Admin `SNAPSHOT` — deferred behind the running flush.
/// 3. `set("b", "2")` before the follow-up runs.
/// 4. Poll through both completions.
///
/// # Expected behavior
/// `snapshot_pending` while the first flush runs; afterwards the chained
/// flush+snapshot completes, the client gets one OK, and the snapshot
/// directory opens as a freezer environment holding both keys.
#[test]
fn deferred_snapshot_runs_after_the_flush() {
    let tmp = TempDir::new().unwrap();
    let mut store = open_store(&tmp);

    store.set(0, b"a", b"1").unwrap();
    store.flush_begin().unwrap();

    let AdminReply::Deferred(reply) = dispatch(&mut store, &["SNAPSHOT"], &mut || {}) else {
        panic!("expected deferred reply");
    };
    assert!(store.stats().snapshot_pending);

    store.set(0, b"b", b"2").unwrap();

    assert_eq!(wait_background(&mut store), BackgroundEvent::FlushCompleted);
    assert!(store.stats().snapshot_in_progress, "follow-up chained");
    assert_eq!(
        wait_background(&mut store),
        BackgroundEvent::SnapshotCompleted
    );
    assert_eq!(reply.recv().unwrap(), Ok("snapshot complete".to_string()));

    // The snapshot directory is a coherent freezer environment.
    let env = FreezerEnv::open(EnvOptions {
        root: tmp.path().join("snapshot"),
        max_subdbs: DATABASES,
        map_reserve: 1 << 30,
        txn_write_buffer: 1 << 20,
    })
    .unwrap();
    let r = env.begin_read(0).unwrap();
    let a = payload::decode(&r.get(b"a").unwrap().unwrap()).unwrap();
    let b = payload::decode(&r.get(b"b").unwrap().unwrap()).unwrap();
    assert_eq!(a, b"1");
    assert_eq!(b, b"2");
}

/// # Scenario
/// P3: after a flush and a reopen, the freezer agrees with the live view
/// for every key that was not subsequently mutated.
#[test]
fn freezer_matches_live_state_after_flush() {
    let tmp = TempDir::new().unwrap();
    let mut store = open_store(&tmp);

    let keys: Vec<Vec<u8>> = (0..32u32)
        .map(|i| format!("key-{i:03}").into_bytes())
        .collect();
    for (i, key) in keys.iter().enumerate() {
        store.set(1, key, format!("value-{i}").as_bytes()).unwrap();
    }
    // A few deletions mixed in.
    store.del(1, &keys[3]).unwrap();
    store.del(1, &keys[17]).unwrap();

    flush_and_wait(&mut store);
    let expected: Vec<Option<Vec<u8>>> = keys
        .iter()
        .map(|key| store.get(1, key).unwrap())
        .collect();
    drop(store);

    let mut store = reopen_store(&tmp);
    for (key, expected) in keys.iter().zip(expected) {
        assert_eq!(store.get(1, key).unwrap(), expected);
    }
}
