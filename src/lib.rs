//! # Permafrost
//!
//! A **disk-backed spillover store**: an in-memory key/value tier extended
//! with a persistent on-disk "freezer" tier, so the working set may exceed
//! RAM. Designed for single-threaded, event-loop-driven servers.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                        Store                            │
//! │  ┌─────────────┐   ┌───────────────┐   ┌─────────────┐  │
//! │  │  Live maps  │   │ Dirty/flushing│   │   Freezer   │  │
//! │  │ (in memory) │   │  shadow sets  │   │  (on disk)  │  │
//! │  └──────┬──────┘   └───────┬───────┘   └──────┬──────┘  │
//! │         │ write-back       │ rotate           │         │
//! │         └────────►         └────────►         │         │
//! │                                               │         │
//! │  ┌────────────────────────────────────────────┘         │
//! │  │  Background flush (capture → drain → merge back)     │
//! │  └──────────────────────────────────────────────────────│
//! │                                                         │
//! │  ┌─────────────────────────────────────────────────────┐│
//! │  │       Snapshot (environment copy after drain)       ││
//! │  └─────────────────────────────────────────────────────┘│
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`store`] | Logical databases, read-through / write-back glue, preload, stats |
//! | [`tracker`] | Per-database dirty/flushing shadow sets with rotation |
//! | [`freezer`] | On-disk environment: named sub-databases, transactions, cursor walk, copy |
//! | [`flush`] | Background flush coordinator and completion handling |
//! | [`snapshot`] | Coordinated, atomic freezer environment copies |
//! | [`admin`] | The `FREEZER` administrative command dispatcher |
//! | [`payload`] | Self-describing, CRC32-checksummed value envelopes |
//!
//! ## Key properties
//!
//! - **Shadowing** — a key mutated since the last flush is *dirty*; reads
//!   never serve the freezer's stale copy for a shadowed key.
//! - **Non-blocking flushes** — the foreground captures a point-in-time
//!   copy of the dirty payloads and rotates the shadow sets; a background
//!   worker drains the capture while new mutations accumulate freely.
//! - **Failure safety** — a failed or crashed worker merges every
//!   captured key back into the dirty set; nothing is lost, at worst a
//!   key is written twice.
//! - **Coherent snapshots** — a snapshot rides on a flush and copies the
//!   environment only after the drain, serialized against writers.
//! - **Checksums throughout** — freezer records and value envelopes are
//!   CRC32-protected; corruption is detected, logged, and demoted to a
//!   cache miss rather than served.
//!
//! ## Durability limit
//!
//! The dirty set lives in memory only: a crash loses mutations that no
//! flush has drained yet. Durability is "survives process crash after a
//! successful flush", by design.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use permafrost::{Store, StoreConfig};
//!
//! let mut store = Store::open("/var/lib/myserver", StoreConfig::default()).unwrap();
//!
//! // Foreground operations.
//! store.set(0, b"user:1", b"alice").unwrap();
//! assert_eq!(store.get(0, b"user:1").unwrap(), Some(b"alice".to_vec()));
//!
//! // Kick off a background flush; poll from the event loop.
//! store.flush_begin().unwrap();
//! loop {
//!     if let Some(event) = store.poll_background() {
//!         println!("flush finished: {event:?}");
//!         break;
//!     }
//!     std::thread::sleep(std::time::Duration::from_millis(10));
//! }
//! ```

pub mod admin;
pub mod flush;
pub mod freezer;
pub mod payload;
pub mod snapshot;
pub mod store;
pub mod tracker;

pub use admin::{AdminReply, dispatch};
pub use flush::{BackgroundEvent, DeferredReply};
pub use store::{Store, StoreConfig, StoreError, StoreStats};
