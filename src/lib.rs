//! # AeternusDB
//!
//! An embeddable, version-controlled, document-oriented record store.
//! Every write is an occurrence of a `(key, value)` pair against a
//! record rather than an overwrite, so presence is a parity of
//! occurrences and history is never lost.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                     Engine                            │
//! │  ┌────────────┐        drain        ┌──────────────┐ │
//! │  │   Ledger    │ ───────────────────►│   Database   │ │
//! │  │ (mmapped    │   background thread │ (Segments:   │ │
//! │  │  Pages of   │                      │  Table/Index │ │
//! │  │  Writes)    │                      │  /Corpus)    │ │
//! │  └─────────────┘                      └──────────────┘ │
//! │                                                        │
//! │  ┌──────────────────────────────────────────────────┐  │
//! │  │ LockService / RangeLockService — just-in-time     │  │
//! │  │ locking for AtomicOperation / Transaction commit  │  │
//! │  └──────────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`engine`] | `Engine`, `AtomicOperation`, `Transaction` — the public API |
//! | [`ledger`] | Append-only, mmapped write-ahead buffer (`Page`/`Ledger`) |
//! | [`database`] | Sealed `Segment` collection, query routing, optimizer |
//! | [`segment`] | Immutable on-disk Segment (Table/Index/Corpus chunks) |
//! | [`lock`] | Token-keyed `LockService` and `RangeLockService` |
//! | [`token`] | `Token`, `RangeToken`, `Operator` |
//! | [`write`] | The `Write` revision unit and its bit-exact encoding |
//! | [`value`] | The typed `Value` primitive |
//! | [`encoding`] | Hand-written deterministic binary codec |
//!
//! ## Key Features
//!
//! - **Occurrence-based history** — a value is present iff it has been
//!   added an odd number of times; nothing is ever physically deleted.
//! - **Point-in-time reads** — every read takes a timestamp, so a
//!   record's state at any past version is reconstructible.
//! - **Full-text search** — an ordered-substring corpus index alongside
//!   the table and inverted-index chunks.
//! - **Optimistic, just-in-time locking** — `AtomicOperation`/
//!   `Transaction` record read/write expectations as they execute and
//!   only take locks at commit, re-verifying before transporting writes.
//! - **Range blocking** — a `find` held open by an `AtomicOperation`
//!   registers a live range read lock, so a concurrent write into the
//!   same range aborts at commit instead of landing underneath it.
//! - **Crash-recoverable transactions** — `Transaction` durably backs up
//!   its intent before committing, replayed on the next `Engine::open`.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use recordkernel::engine::{Engine, EngineConfig};
//! use recordkernel::value::Value;
//!
//! let engine = Engine::open("/tmp/my_db", EngineConfig::default()).unwrap();
//!
//! // Write
//! engine.add("name", Value::String("Alice".into()), 1).unwrap();
//!
//! // Read
//! assert!(engine.verify("name", &Value::String("Alice".into()), 1, engine.now()).unwrap());
//!
//! // Atomic, multi-write operation
//! let mut op = engine.start_atomic_operation();
//! op.add("age", Value::Integer(30), 1).unwrap();
//! assert!(op.commit().unwrap());
//!
//! // Graceful shutdown
//! engine.close().unwrap();
//! ```

#![allow(dead_code)]

pub mod database;
pub mod encoding;
pub mod engine;
pub mod ledger;
pub mod lock;
pub mod segment;
pub mod token;
pub mod value;
pub mod write;
