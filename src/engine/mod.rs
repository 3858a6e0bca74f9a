//! [`Engine`] — the crate's top-level handle: a [`crate::ledger::Ledger`]
//! write-ahead buffer draining into a [`crate::database::Database`],
//! plus the locking and atomic-operation machinery that sits above
//! both.
//!
//! Generalizes the teacher's `Engine::open` directory-scan-and-recover
//! lifecycle and its background compaction thread from an LSM
//! memtable/SSTable pair to a Ledger/Database pair, and from a
//! size-triggered flush to an always-on drain loop that continuously
//! transports writes out of the Ledger and into the Database.

pub mod atomic;

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use thiserror::Error;

use crate::database::{Database, DatabaseConfig, DatabaseError, DatabaseSink};
use crate::ledger::{Ledger, LedgerError};
use crate::lock::{LockGuard, LockKind, LockService, RangeLockError, RangeLockGuard, RangeLockService};
use crate::token::{Operator, RangeToken, Token};
use crate::value::Value;
use crate::write::Write as KernelWrite;

use atomic::{AtomicOperation, Expectation, Scope, Transaction};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("encoding error: {0}")]
    Encoding(#[from] crate::encoding::EncodingError),

    #[error("internal engine error: {0}")]
    Internal(String),
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub database: DatabaseConfig,
    pub ledger_page_capacity: usize,
    pub ledger_expected_insertions: usize,
    /// How long the background drain thread sleeps after finding the
    /// Ledger empty.
    pub drain_idle_sleep: Duration,
    /// Upper bound on the idle-backoff sleep before retrying.
    pub drain_max_backoff: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            ledger_page_capacity: 4096,
            ledger_expected_insertions: 10_000,
            drain_idle_sleep: Duration::from_millis(5),
            drain_max_backoff: Duration::from_millis(200),
        }
    }
}

struct DrainHandle {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

type ListenerId = u64;

#[derive(Default)]
struct Listeners {
    next_id: u64,
    by_token: HashMap<Vec<u8>, Vec<(ListenerId, mpsc::Sender<u64>)>>,
}

impl Listeners {
    fn register(&mut self, token: &Token, sender: mpsc::Sender<u64>) -> ListenerId {
        let id = self.next_id;
        self.next_id += 1;
        self.by_token.entry(token.as_bytes().to_vec()).or_default().push((id, sender));
        id
    }

    fn remove(&mut self, token: &Token, id: ListenerId) {
        if let Some(list) = self.by_token.get_mut(token.as_bytes()) {
            list.retain(|(existing, _)| *existing != id);
        }
    }

    /// Notifies every listener registered on `token` with `version`. A
    /// send failing (receiver dropped) is not an error — the listener
    /// simply stopped caring.
    fn notify(&self, token: &Token, version: u64) {
        if let Some(list) = self.by_token.get(token.as_bytes()) {
            for (_, sender) in list {
                let _ = sender.send(version);
            }
        }
    }
}

struct EngineInner {
    dir: PathBuf,
    ledger: Ledger,
    database: Arc<Database>,
    database_config: DatabaseConfig,
    lock_service: LockService,
    range_lock_service: RangeLockService,
    listeners: Mutex<Listeners>,
    drain: Mutex<Option<DrainHandle>>,
    next_txn_id: AtomicU64,
}

/// The crate's top-level handle. Cheaply `Clone`-able; every clone
/// shares the same underlying Ledger, Database, lock services, and
/// background drain thread.
#[derive(Clone)]
pub struct Engine(Arc<EngineInner>);

impl Engine {
    /// Opens (creating if necessary) an Engine rooted at `dir`: sets up
    /// `ledger/`, `segments/`, and `transactions/` subdirectories,
    /// replays any crash-surviving transaction backups, and starts the
    /// background drain thread.
    pub fn open(dir: impl AsRef<Path>, config: EngineConfig) -> Result<Self, EngineError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let ledger_dir = dir.join("ledger");
        let segments_dir = dir.join("segments");
        let txn_dir = dir.join("transactions");
        fs::create_dir_all(&txn_dir)?;

        let ledger = Ledger::open(&ledger_dir, config.ledger_page_capacity, config.ledger_expected_insertions)?;
        let database = Arc::new(Database::open(&segments_dir, config.database.clone())?);

        let inner = Arc::new(EngineInner {
            dir: dir.clone(),
            ledger,
            database,
            database_config: config.database.clone(),
            lock_service: LockService::new(),
            range_lock_service: RangeLockService::new(),
            listeners: Mutex::new(Listeners::default()),
            drain: Mutex::new(None),
            next_txn_id: AtomicU64::new(0),
        });
        let engine = Engine(inner);

        atomic::recover_transactions(&engine, &txn_dir)?;
        engine.spawn_drain_thread(config.drain_idle_sleep, config.drain_max_backoff);
        Ok(engine)
    }

    /// Stops the background drain thread and fsyncs the Ledger, leaving
    /// the Engine durably closed. Further use of this handle (or any
    /// clone) after `close()` is not supported.
    pub fn close(&self) -> Result<(), EngineError> {
        if let Some(drain) = self.0.drain.lock().expect("drain mutex poisoned").take() {
            drain.stop.store(true, Ordering::SeqCst);
            let _ = drain.handle.join();
        }
        self.0.ledger.sync()?;
        Ok(())
    }

    fn spawn_drain_thread(&self, idle_sleep: Duration, max_backoff: Duration) {
        let engine = self.clone();
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();

        let handle = std::thread::spawn(move || {
            let mut backoff = idle_sleep;
            let mut sink = DatabaseSink::new(engine.0.database.clone());
            while !stop_flag.load(Ordering::Relaxed) {
                match engine.0.ledger.transport(&mut sink) {
                    Ok(true) => backoff = idle_sleep,
                    Ok(false) => {
                        std::thread::sleep(backoff);
                        backoff = (backoff * 2).min(max_backoff);
                    }
                    Err(err) => {
                        tracing::error!(%err, "ledger drain failed");
                        std::thread::sleep(max_backoff);
                    }
                }
            }
        });

        *self.0.drain.lock().expect("drain mutex poisoned") = Some(DrainHandle { stop, handle });
    }

    /// The sentinel "current" timestamp — reads with this timestamp see
    /// every write accepted so far, including ones the drain thread has
    /// not yet transported into the Database.
    pub fn now(&self) -> u64 {
        u64::MAX
    }

    /// Merges the not-yet-drained Ledger writes for `record` with the
    /// Database's durable history, deduplicated by each write's
    /// globally unique `version`. A write can be visible from both
    /// sources at once while its backing Ledger page is draining but
    /// not yet deleted; deduplicating on version (assigned exactly once,
    /// at `Ledger::insert`) makes the merge correct regardless of that
    /// timing.
    fn merge_record(&self, record: u64) -> Result<HashMap<u64, KernelWrite>, EngineError> {
        let mut by_version = HashMap::new();
        for write in self.0.ledger.for_record(record)? {
            by_version.insert(write.version(), write);
        }
        for write in self.0.database.audit_record(record)? {
            by_version.entry(write.version()).or_insert(write);
        }
        Ok(by_version)
    }

    fn merge_key_record(&self, key: &str, record: u64) -> Result<HashMap<u64, KernelWrite>, EngineError> {
        let mut by_version = HashMap::new();
        for write in self.0.ledger.for_key_record(key, record)? {
            by_version.insert(write.version(), write);
        }
        for write in self.0.database.audit_key_record(key, record)? {
            by_version.entry(write.version()).or_insert(write);
        }
        Ok(by_version)
    }

    fn merge_key(&self, key: &str) -> Result<HashMap<u64, KernelWrite>, EngineError> {
        let mut by_version = HashMap::new();
        for write in self.0.ledger.for_key(key)? {
            by_version.insert(write.version(), write);
        }
        for write in self.0.database.audit_key(key)? {
            by_version.entry(write.version()).or_insert(write);
        }
        Ok(by_version)
    }

    /// `true` iff `(key, value, record)` is present at `timestamp`,
    /// consulting both the Ledger and the Database.
    pub fn verify(&self, key: &str, value: &Value, record: u64, timestamp: u64) -> Result<bool, EngineError> {
        let merged = self.merge_key_record(key, record)?;
        let versions = merged.values().filter(|w| w.key() == key && w.value() == value).map(|w| w.version());
        Ok(crate::database::is_present(versions, timestamp))
    }

    pub fn fetch(&self, key: &str, record: u64, timestamp: u64) -> Result<Vec<Value>, EngineError> {
        let merged = self.merge_key_record(key, record)?;
        Ok(crate::database::group_present_values(
            merged.values().filter(|w| w.key() == key),
            |w| w.value().clone(),
            |w| w.version(),
            timestamp,
        ))
    }

    pub fn browse_record(&self, record: u64, timestamp: u64) -> Result<Vec<(String, Value)>, EngineError> {
        let merged = self.merge_record(record)?;
        Ok(crate::database::group_present_pairs(
            merged.values(),
            |w| (w.key().to_string(), w.value().clone()),
            |w| w.version(),
            timestamp,
        ))
    }

    pub fn browse_key(&self, key: &str, timestamp: u64) -> Result<Vec<(Value, u64)>, EngineError> {
        let merged = self.merge_key(key)?;
        Ok(crate::database::group_present_pairs(
            merged.values(),
            |w| (w.value().clone(), w.record()),
            |w| w.version(),
            timestamp,
        ))
    }

    pub fn find(&self, key: &str, op: Operator, values: &[Value], timestamp: u64) -> Result<Vec<u64>, EngineError> {
        let present = self.browse_key(key, timestamp)?;
        Ok(crate::database::evaluate_find(present, op, values)?)
    }

    /// Registers `token` as a live range read lock, for the calling
    /// `AtomicOperation` to hold for its remaining lifetime. A `find`
    /// issued mid-operation blocks any write into the queried range
    /// that starts afterward, per the range-blocking contract.
    pub(crate) fn acquire_range_read(&self, token: RangeToken) -> Result<RangeLockGuard, RangeLockError> {
        self.0.range_lock_service.acquire(LockKind::Read, token)
    }

    /// Like `Database::search`, but over the merged (Ledger + Database)
    /// text for `key`, so a just-written field is searchable before the
    /// drain thread has transported it — read-your-own-write
    /// consistency for full-text search.
    pub fn search(&self, key: &str, query: &str) -> Result<Vec<u64>, EngineError> {
        let stopwords = &self.0.database_config.segment.stopwords;
        let min_size = self.0.database_config.segment.min_search_index_size;
        let query_tokens = crate::database::tokenize_query(query, stopwords, min_size);
        if query_tokens.is_empty() {
            return Ok(Vec::new());
        }

        let present = self.browse_key(key, self.now())?;
        let mut hits = Vec::new();
        for (value, record) in present {
            if let Value::String(text) = value {
                let text_tokens = crate::database::tokenize_query(&text, stopwords, min_size);
                if ordered_infix_match(&text_tokens, &query_tokens) {
                    hits.push(record);
                }
            }
        }
        hits.sort_unstable();
        hits.dedup();
        Ok(hits)
    }

    pub fn audit_record(&self, record: u64) -> Result<Vec<KernelWrite>, EngineError> {
        let mut writes: Vec<KernelWrite> = self.merge_record(record)?.into_values().collect();
        writes.sort_by_key(|w| w.version());
        Ok(writes)
    }

    pub fn audit_key_record(&self, key: &str, record: u64) -> Result<Vec<KernelWrite>, EngineError> {
        let mut writes: Vec<KernelWrite> = self.merge_key_record(key, record)?.into_values().collect();
        writes.sort_by_key(|w| w.version());
        Ok(writes)
    }

    fn version_of(merged: &HashMap<u64, KernelWrite>) -> u64 {
        merged.keys().copied().max().unwrap_or(0)
    }

    pub(crate) fn version_for_record(&self, record: u64) -> Result<u64, EngineError> {
        Ok(Self::version_of(&self.merge_record(record)?))
    }

    pub(crate) fn version_for_key(&self, key: &str) -> Result<u64, EngineError> {
        Ok(Self::version_of(&self.merge_key(key)?))
    }

    pub(crate) fn version_for_key_record(&self, key: &str, record: u64) -> Result<u64, EngineError> {
        Ok(Self::version_of(&self.merge_key_record(key, record)?))
    }

    fn version_for_scope(&self, scope: &Scope) -> Result<u64, EngineError> {
        match scope {
            Scope::Record(r) => self.version_for_record(*r),
            Scope::Key(k) => self.version_for_key(k),
            Scope::KeyRecord(k, r) => self.version_for_key_record(k, *r),
        }
    }

    /// One-shot, unbuffered write — adds `value` at `(key, record)` iff
    /// not already present.
    pub fn add(&self, key: &str, value: Value, record: u64) -> Result<bool, EngineError> {
        let mut op = self.start_atomic_operation();
        if !op.add(key, value, record).map_err(to_engine_error)? {
            return Ok(false);
        }
        op.commit().map_err(to_engine_error)
    }

    pub fn remove(&self, key: &str, value: Value, record: u64) -> Result<bool, EngineError> {
        let mut op = self.start_atomic_operation();
        if !op.remove(key, value, record).map_err(to_engine_error)? {
            return Ok(false);
        }
        op.commit().map_err(to_engine_error)
    }

    pub fn start_atomic_operation(&self) -> AtomicOperation {
        AtomicOperation::new(self.clone())
    }

    pub fn start_transaction(&self) -> Transaction {
        let id = self.0.next_txn_id.fetch_add(1, Ordering::SeqCst);
        Transaction::new(self.clone(), id, self.0.dir.join("transactions"))
    }

    /// Registers a listener for version changes against `token`,
    /// returning its id (for [`Self::unlisten`]) and a receiver that
    /// gets the new version on every successful commit touching it.
    pub fn listen(&self, token: &Token) -> (u64, mpsc::Receiver<u64>) {
        let (tx, rx) = mpsc::channel();
        let id = self.0.listeners.lock().expect("listeners mutex poisoned").register(token, tx);
        (id, rx)
    }

    pub fn unlisten(&self, token: &Token, id: u64) {
        self.0.listeners.lock().expect("listeners mutex poisoned").remove(token, id);
    }

    /// The shared commit protocol used by both `AtomicOperation::commit`
    /// and `Transaction::commit`:
    ///
    /// 1. Pre-check every expectation's recorded version against the
    ///    current version for its scope; abort on any mismatch.
    /// 2. Acquire a read lock on every scope (sorted by token bytes, a
    ///    deterministic order across concurrent commits to avoid
    ///    deadlock), then upgrade exactly the write-scoped locks.
    /// 3. Re-check every expectation with locks held; if still
    ///    satisfied, acquire a range write lock for each write's
    ///    `(key, value)` — aborting if it conflicts with a live range
    ///    read registered by another in-flight operation — then insert
    ///    all buffered writes into the Ledger, notify listeners, and
    ///    return `true`. Locks release on drop.
    pub(crate) fn do_commit(&self, expectations: &[Expectation], writes: &[KernelWrite]) -> Result<bool, EngineError> {
        if !self.expectations_hold(expectations)? {
            return Ok(false);
        }

        let mut ordered: Vec<&Expectation> = expectations.iter().collect();
        ordered.sort_by_key(|e| e.scope.token().as_bytes().to_vec());

        let mut guards: Vec<LockGuard> = Vec::with_capacity(ordered.len());
        for expectation in &ordered {
            guards.push(self.0.lock_service.read(expectation.scope.token()));
        }
        for (expectation, guard) in ordered.iter().zip(guards.iter_mut()) {
            if expectation.is_write {
                let taken = std::mem::replace(guard, LockGuard::no_op(expectation.scope.token()));
                *guard = self.0.lock_service.upgrade(taken);
            }
        }

        if !self.expectations_hold(expectations)? {
            return Ok(false);
        }

        let mut range_guards: Vec<RangeLockGuard> = Vec::with_capacity(writes.len());
        for write in writes {
            let token = RangeToken::for_write(write.key().to_string(), write.value().clone());
            match self.0.range_lock_service.acquire(LockKind::Write, token) {
                Ok(guard) => range_guards.push(guard),
                Err(_) => return Ok(false),
            }
        }

        for write in writes {
            self.0.ledger.insert(write.clone())?;
        }
        drop(range_guards);

        let listeners = self.0.listeners.lock().expect("listeners mutex poisoned");
        for expectation in expectations {
            if expectation.is_write {
                let token = expectation.scope.token();
                let version = self.version_for_scope(&expectation.scope).unwrap_or(0);
                listeners.notify(&token, version);
            }
        }
        drop(listeners);
        drop(guards);
        Ok(true)
    }

    fn expectations_hold(&self, expectations: &[Expectation]) -> Result<bool, EngineError> {
        for expectation in expectations {
            if let Some(expected) = expectation.expected_version
                && self.version_for_scope(&expectation.scope)? != expected
            {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Replays a recovered transaction backup directly into the Ledger,
    /// bypassing expectation re-verification — the spec's crash-recovery
    /// contract: a backup was already verified once, before the crash.
    /// Locks are still acquired in the kind the backup recorded, even
    /// though recovery runs before any concurrent access is possible,
    /// so the lock bookkeeping (refcounts) stays consistent.
    pub(crate) fn replay_recovered(&self, locks: &[(LockKind, Vec<u8>)], writes: Vec<KernelWrite>) -> Result<(), EngineError> {
        let mut guards = Vec::with_capacity(locks.len());
        for (kind, token_bytes) in locks {
            let token = Token::from_bytes(token_bytes.clone());
            guards.push(match kind {
                LockKind::Write => self.0.lock_service.write(token),
                LockKind::Read => self.0.lock_service.read(token),
            });
        }
        for write in writes {
            self.0.ledger.insert(write)?;
        }
        drop(guards);
        Ok(())
    }
}

fn to_engine_error(err: atomic::AtomicError) -> EngineError {
    match err {
        atomic::AtomicError::Engine(e) => e,
        other => EngineError::Internal(other.to_string()),
    }
}

/// `true` iff `query_tokens` appears as an ordered subsequence of
/// `text_tokens` — the same matching rule `Database::search` applies
/// over corpus term positions, applied here directly to literal stored
/// text.
fn ordered_infix_match(text_tokens: &[String], query_tokens: &[String]) -> bool {
    if query_tokens.is_empty() {
        return false;
    }
    let mut floor = 0usize;
    for (i, token) in query_tokens.iter().enumerate() {
        let start = if i == 0 { 0 } else { floor };
        match text_tokens[start..].iter().position(|t| t == token) {
            Some(idx) => floor = start + idx + 1,
            None => return false,
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_engine(tmp: &TempDir) -> Engine {
        Engine::open(tmp.path(), EngineConfig::default()).unwrap()
    }

    #[test]
    fn add_then_verify_round_trips_before_drain() {
        let tmp = TempDir::new().unwrap();
        let engine = open_engine(&tmp);
        assert!(engine.add("name", Value::String("Alice".into()), 1).unwrap());
        assert!(engine.verify("name", &Value::String("Alice".into()), 1, engine.now()).unwrap());
    }

    #[test]
    fn double_add_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let engine = open_engine(&tmp);
        assert!(engine.add("name", Value::String("Alice".into()), 1).unwrap());
        assert!(!engine.add("name", Value::String("Alice".into()), 1).unwrap());
    }

    #[test]
    fn add_then_remove_clears_presence() {
        let tmp = TempDir::new().unwrap();
        let engine = open_engine(&tmp);
        engine.add("name", Value::String("Alice".into()), 1).unwrap();
        assert!(engine.remove("name", Value::String("Alice".into()), 1).unwrap());
        assert!(!engine.verify("name", &Value::String("Alice".into()), 1, engine.now()).unwrap());
    }

    #[test]
    fn search_sees_value_before_drain() {
        let tmp = TempDir::new().unwrap();
        let engine = open_engine(&tmp);
        engine.add("bio", Value::String("a quick brown fox".into()), 1).unwrap();
        let hits = engine.search("bio", "quick fox").unwrap();
        assert_eq!(hits, vec![1]);
    }

    #[test]
    fn ordered_infix_match_requires_order() {
        let text: Vec<String> = ["a", "quick", "brown", "fox"].iter().map(|s| s.to_string()).collect();
        let query_ok: Vec<String> = ["quick", "fox"].iter().map(|s| s.to_string()).collect();
        let query_bad: Vec<String> = ["fox", "quick"].iter().map(|s| s.to_string()).collect();
        assert!(ordered_infix_match(&text, &query_ok));
        assert!(!ordered_infix_match(&text, &query_bad));
    }

    #[test]
    fn listener_is_notified_on_commit() {
        let tmp = TempDir::new().unwrap();
        let engine = open_engine(&tmp);
        let token = Token::for_key_record("name", 1);
        let (_id, rx) = engine.listen(&token);
        engine.add("name", Value::String("Alice".into()), 1).unwrap();
        rx.recv_timeout(Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn reopening_an_engine_preserves_committed_state() {
        let tmp = TempDir::new().unwrap();
        {
            let engine = open_engine(&tmp);
            engine.add("name", Value::String("Alice".into()), 1).unwrap();
            engine.close().unwrap();
        }
        let engine = open_engine(&tmp);
        assert!(engine.verify("name", &Value::String("Alice".into()), 1, engine.now()).unwrap());
    }
}
