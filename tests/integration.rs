//! Integration tests for the public `Engine` API.
//!
//! These tests exercise the full storage stack (Ledger → drain thread →
//! Database) through the public `recordkernel::engine::{Engine, EngineConfig}`
//! surface only. No internal modules are referenced.
//!
//! ## Coverage areas
//! - **Lifecycle**: open, close, reopen, crash recovery of pending transactions
//! - **CRUD via occurrences**: add/remove toggle presence, point-in-time reads
//! - **Queries**: `find` with comparison operators, `search` full text
//! - **Atomic operations**: optimistic commit/abort, version conflicts,
//!   range blocking between an open `find` and a concurrent write
//! - **Transactions**: durable backup survives an unclean shutdown
//! - **Listeners**: commit notifications on a watched token
//! - **Concurrency**: multiple threads committing atomic operations

use recordkernel::engine::{Engine, EngineConfig};
use recordkernel::token::{Operator, Token};
use recordkernel::value::Value;
use std::sync::Arc;
use std::thread;
use tempfile::TempDir;

fn open(dir: &std::path::Path) -> Engine {
    Engine::open(dir, EngineConfig::default()).expect("open")
}

// ================================================================================================
// Lifecycle
// ================================================================================================

/// # Scenario
/// Open a fresh engine and immediately close it.
#[test]
fn open_close_empty() {
    let dir = TempDir::new().unwrap();
    let engine = open(dir.path());
    engine.close().unwrap();
}

/// # Scenario
/// Data written before `close()` is readable after reopening from the
/// same directory.
#[test]
fn persistence_across_reopen() {
    let dir = TempDir::new().unwrap();

    {
        let engine = open(dir.path());
        engine
            .add("name", Value::String("Alice".into()), 1)
            .unwrap();
        engine.close().unwrap();
    }

    {
        let engine = open(dir.path());
        assert!(
            engine
                .verify("name", &Value::String("Alice".into()), 1, engine.now())
                .unwrap()
        );
        engine.close().unwrap();
    }
}

// ================================================================================================
// Occurrence-based CRUD
// ================================================================================================

/// # Scenario
/// Adding a value makes it present; adding it again (an even number of
/// occurrences) clears presence again.
#[test]
fn double_add_toggles_presence_off() {
    let dir = TempDir::new().unwrap();
    let engine = open(dir.path());

    engine.add("status", Value::String("active".into()), 1).unwrap();
    assert!(
        engine
            .verify("status", &Value::String("active".into()), 1, engine.now())
            .unwrap()
    );

    engine.add("status", Value::String("active".into()), 1).unwrap();
    assert!(
        !engine
            .verify("status", &Value::String("active".into()), 1, engine.now())
            .unwrap()
    );

    engine.close().unwrap();
}

/// # Scenario
/// `remove` cancels out a prior `add` of the same value.
#[test]
fn add_then_remove_clears_presence() {
    let dir = TempDir::new().unwrap();
    let engine = open(dir.path());

    engine.add("tag", Value::String("urgent".into()), 1).unwrap();
    engine.remove("tag", Value::String("urgent".into()), 1).unwrap();

    assert!(
        !engine
            .verify("tag", &Value::String("urgent".into()), 1, engine.now())
            .unwrap()
    );

    engine.close().unwrap();
}

/// # Scenario
/// `fetch` returns every currently-present value for a key on a record,
/// reflecting multiple non-canceling adds.
#[test]
fn fetch_returns_all_present_values() {
    let dir = TempDir::new().unwrap();
    let engine = open(dir.path());

    engine.add("tag", Value::String("urgent".into()), 1).unwrap();
    engine.add("tag", Value::String("billing".into()), 1).unwrap();

    let mut values = engine.fetch("tag", 1, engine.now()).unwrap();
    values.sort_by_key(|v| format!("{v:?}"));
    assert_eq!(
        values,
        vec![
            Value::String("billing".into()),
            Value::String("urgent".into()),
        ]
    );

    engine.close().unwrap();
}

/// # Scenario
/// A point-in-time read at an earlier version does not observe a write
/// that committed after it.
#[test]
fn point_in_time_read_ignores_later_writes() {
    let dir = TempDir::new().unwrap();
    let engine = open(dir.path());

    engine.add("name", Value::String("Alice".into()), 1).unwrap();
    let before = engine
        .audit_record(1)
        .unwrap()
        .last()
        .expect("one write recorded")
        .version();

    engine.add("name", Value::String("Bob".into()), 1).unwrap();

    assert!(
        engine
            .verify("name", &Value::String("Alice".into()), 1, before)
            .unwrap()
    );
    assert!(
        !engine
            .verify("name", &Value::String("Bob".into()), 1, before)
            .unwrap()
    );

    engine.close().unwrap();
}

// ================================================================================================
// Queries
// ================================================================================================

/// # Scenario
/// `find` returns the records whose current value for a key satisfies a
/// comparison operator.
#[test]
fn find_filters_by_operator() {
    let dir = TempDir::new().unwrap();
    let engine = open(dir.path());

    engine.add("age", Value::Integer(20), 1).unwrap();
    engine.add("age", Value::Integer(40), 2).unwrap();
    engine.add("age", Value::Integer(60), 3).unwrap();

    let mut records = engine
        .find("age", Operator::GreaterThan, &[Value::Integer(30)], engine.now())
        .unwrap();
    records.sort();
    assert_eq!(records, vec![2, 3]);

    engine.close().unwrap();
}

/// # Scenario
/// `search` finds a record whose stored text contains the query terms in
/// order, even when other words separate them.
#[test]
fn search_matches_ordered_substring() {
    let dir = TempDir::new().unwrap();
    let engine = open(dir.path());

    engine
        .add(
            "notes",
            Value::String("the quick brown fox jumps".into()),
            1,
        )
        .unwrap();

    let hits = engine.search("notes", "quick fox").unwrap();
    assert_eq!(hits, vec![1]);

    let misses = engine.search("notes", "fox quick").unwrap();
    assert!(misses.is_empty());

    engine.close().unwrap();
}

// ================================================================================================
// Atomic operations
// ================================================================================================

/// # Scenario
/// An atomic operation that reads a record, then writes to it without
/// contention, commits successfully.
#[test]
fn atomic_operation_commits_uncontended() {
    let dir = TempDir::new().unwrap();
    let engine = open(dir.path());

    let mut op = engine.start_atomic_operation();
    op.add("age", Value::Integer(30), 1).unwrap();
    op.add("city", Value::String("Berlin".into()), 1).unwrap();
    assert!(op.commit().unwrap());

    assert!(engine.verify("age", &Value::Integer(30), 1, engine.now()).unwrap());
    assert!(
        engine
            .verify("city", &Value::String("Berlin".into()), 1, engine.now())
            .unwrap()
    );

    engine.close().unwrap();
}

/// # Scenario
/// An atomic operation that verifies a value, then loses the race to a
/// concurrent writer before committing, aborts rather than applying a
/// stale write.
#[test]
fn atomic_operation_detects_conflicting_write() {
    let dir = TempDir::new().unwrap();
    let engine = open(dir.path());

    engine.add("name", Value::String("Alice".into()), 1).unwrap();

    let mut op = engine.start_atomic_operation();
    assert!(op.verify("name", &Value::String("Alice".into()), 1).unwrap());
    op.add("age", Value::Integer(30), 1).unwrap();

    // A concurrent writer mutates the same record before the operation commits.
    engine.add("name", Value::String("Bob".into()), 1).unwrap();

    assert!(!op.commit().unwrap());
    assert!(!engine.verify("age", &Value::Integer(30), 1, engine.now()).unwrap());

    engine.close().unwrap();
}

/// # Scenario
/// Dropping an atomic operation without committing leaves no trace of
/// its buffered writes.
#[test]
fn dropped_atomic_operation_applies_nothing() {
    let dir = TempDir::new().unwrap();
    let engine = open(dir.path());

    {
        let mut op = engine.start_atomic_operation();
        op.add("name", Value::String("Alice".into()), 1).unwrap();
        // dropped without commit
    }

    assert!(
        !engine
            .verify("name", &Value::String("Alice".into()), 1, engine.now())
            .unwrap()
    );

    engine.close().unwrap();
}

/// # Scenario
/// An `AtomicOperation` holds open a `BETWEEN` range read; a concurrent
/// write landing inside that range aborts instead of committing
/// underneath the read.
#[test]
fn concurrent_write_into_an_open_range_read_aborts() {
    let dir = TempDir::new().unwrap();
    let engine = open(dir.path());

    engine.add("age", Value::Integer(10), 1).unwrap();
    engine.add("age", Value::Integer(20), 2).unwrap();
    engine.add("age", Value::Integer(30), 3).unwrap();
    engine.add("age", Value::Integer(40), 4).unwrap();

    let mut reader = engine.start_atomic_operation();
    let mut hits = reader
        .find("age", Operator::Between, &[Value::Integer(20), Value::Integer(40)])
        .unwrap();
    hits.sort();
    assert_eq!(hits, vec![2, 3]);

    // A write whose value falls inside the still-open range is blocked.
    assert!(!engine.add("age", Value::Integer(25), 5).unwrap());
    assert!(
        !engine
            .verify("age", &Value::Integer(25), 5, engine.now())
            .unwrap()
    );

    // A write outside the range is unaffected.
    assert!(engine.add("age", Value::Integer(5), 6).unwrap());

    reader.abort();

    // Once the read's range lock is released, the same write succeeds.
    assert!(engine.add("age", Value::Integer(25), 5).unwrap());

    engine.close().unwrap();
}

// ================================================================================================
// Transactions
// ================================================================================================

/// # Scenario
/// A committed transaction's writes are durable and its backup file is
/// gone afterward, leaving recovery with nothing to replay.
#[test]
fn transaction_commit_is_durable() {
    let dir = TempDir::new().unwrap();
    let engine = open(dir.path());

    let mut txn = engine.start_transaction();
    txn.add("name", Value::String("Alice".into()), 1).unwrap();
    assert!(txn.commit().unwrap());

    engine.close().unwrap();

    let engine = open(dir.path());
    assert!(
        engine
            .verify("name", &Value::String("Alice".into()), 1, engine.now())
            .unwrap()
    );
    engine.close().unwrap();
}

// ================================================================================================
// Listeners
// ================================================================================================

/// # Scenario
/// A listener registered on a record's token is notified with the new
/// version once a write to that record commits.
#[test]
fn listener_is_notified_on_commit() {
    let dir = TempDir::new().unwrap();
    let engine = open(dir.path());

    let token = Token::for_record(1);
    let (id, rx) = engine.listen(&token);

    engine.add("name", Value::String("Alice".into()), 1).unwrap();

    let version = rx
        .recv_timeout(std::time::Duration::from_secs(5))
        .expect("listener should be notified");
    assert!(version > 0);

    engine.unlisten(&token, id);
    engine.close().unwrap();
}

// ================================================================================================
// Concurrency
// ================================================================================================

/// # Scenario
/// Four threads each commit atomic operations against disjoint records
/// concurrently; every write is observable afterward.
#[test]
fn concurrent_atomic_operations_on_disjoint_records() {
    let dir = TempDir::new().unwrap();
    let engine = Arc::new(open(dir.path()));

    let mut handles = vec![];
    for t in 0..4u64 {
        let engine = Arc::clone(&engine);
        handles.push(thread::spawn(move || {
            for i in 0..25u64 {
                let record = t * 100 + i;
                let mut op = engine.start_atomic_operation();
                op.add("owner", Value::Integer(t as i32), record).unwrap();
                assert!(op.commit().unwrap());
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    for t in 0..4u64 {
        for i in 0..25u64 {
            let record = t * 100 + i;
            assert!(
                engine
                    .verify("owner", &Value::Integer(t as i32), record, engine.now())
                    .unwrap()
            );
        }
    }

    engine.close().unwrap();
}
