//! Storage Server core: a per-file piece-table editing engine with
//! sentence-granularity locking, write-ahead-free commit, checkpoint/undo,
//! and primary/replica sync (spec.md §1-§9).
//!
//! The binaries in `src/bin/` wire these modules together into the two
//! processes spec.md §6 describes: `storage-server` (the real daemon) and
//! `name-server` (a thin routing stand-in, out of scope per spec.md §1).

pub mod config;
pub mod dispatcher;
pub mod document;
pub mod error;
pub mod file_store;
pub mod lock_registry;
pub mod logging;
pub mod piece_table;
pub mod protocol;
pub mod replication;
pub mod session;
