//! [`LockService`] and [`RangeLockService`] — token-keyed, reference-
//! counted read/write locks used by `AtomicOperation::commit` for
//! just-in-time locking: no lock is held during an operation's reads
//! or writes, only across the brief re-check-then-transport window at
//! commit time.
//!
//! Grounded on the reader-slot acquire/release and dirty-page tracking
//! idiom seen in this corpus's transaction-support code (a live-handle
//! count keyed by scope, evicted to zero), adapted here to a token-
//! keyed map instead of a page-cache, and built on a hand-rolled
//! Mutex/Condvar shared lock rather than `std::sync::RwLock` so a
//! guard can own its lock handle independent of any borrowed lifetime.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use thiserror::Error;

use crate::token::{Operator, RangeToken, Token};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    Read,
    Write,
}

// ------------------------------------------------------------------------------------------------
// SharedLock — a reader/writer lock whose guards are owned, not borrowed
// ------------------------------------------------------------------------------------------------

struct SharedLockState {
    readers: u32,
    writer: bool,
}

struct SharedLock {
    state: Mutex<SharedLockState>,
    cond: Condvar,
}

impl SharedLock {
    fn new() -> Self {
        Self {
            state: Mutex::new(SharedLockState { readers: 0, writer: false }),
            cond: Condvar::new(),
        }
    }

    fn acquire_read(&self) {
        let mut state = self.state.lock().expect("shared lock poisoned");
        while state.writer {
            state = self.cond.wait(state).expect("shared lock poisoned");
        }
        state.readers += 1;
    }

    fn release_read(&self) {
        let mut state = self.state.lock().expect("shared lock poisoned");
        state.readers -= 1;
        if state.readers == 0 {
            self.cond.notify_all();
        }
    }

    fn acquire_write(&self) {
        let mut state = self.state.lock().expect("shared lock poisoned");
        while state.writer || state.readers > 0 {
            state = self.cond.wait(state).expect("shared lock poisoned");
        }
        state.writer = true;
    }

    fn release_write(&self) {
        let mut state = self.state.lock().expect("shared lock poisoned");
        state.writer = false;
        self.cond.notify_all();
    }
}

// ------------------------------------------------------------------------------------------------
// LockService — token -> SharedLock, refcounted
// ------------------------------------------------------------------------------------------------

struct TokenEntry {
    lock: Arc<SharedLock>,
    refcount: usize,
}

struct LockServiceInner {
    entries: Mutex<HashMap<Token, TokenEntry>>,
}

/// A token-keyed map of shared locks. Live tokens share one lock
/// instance; an entry is evicted once its last guard is dropped.
#[derive(Clone)]
pub struct LockService {
    inner: Arc<LockServiceInner>,
}

impl Default for LockService {
    fn default() -> Self {
        Self::new()
    }
}

impl LockService {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(LockServiceInner {
                entries: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn checkout(&self, token: &Token) -> Arc<SharedLock> {
        let mut entries = self.inner.entries.lock().expect("lock service poisoned");
        let entry = entries.entry(token.clone()).or_insert_with(|| TokenEntry {
            lock: Arc::new(SharedLock::new()),
            refcount: 0,
        });
        entry.refcount += 1;
        Arc::clone(&entry.lock)
    }

    fn checkin(&self, token: &Token) {
        let mut entries = self.inner.entries.lock().expect("lock service poisoned");
        if let Some(entry) = entries.get_mut(token) {
            entry.refcount -= 1;
            if entry.refcount == 0 {
                entries.remove(token);
            }
        }
    }

    /// Acquires a read lock scoped to `token`, blocking until available.
    pub fn read(&self, token: Token) -> LockGuard {
        let lock = self.checkout(&token);
        lock.acquire_read();
        LockGuard {
            service: Some(self.clone()),
            token,
            held: Held::Read(lock),
        }
    }

    /// Acquires a write lock scoped to `token`, blocking until available.
    pub fn write(&self, token: Token) -> LockGuard {
        let lock = self.checkout(&token);
        lock.acquire_write();
        LockGuard {
            service: Some(self.clone()),
            token,
            held: Held::Write(lock),
        }
    }

    /// Upgrades a held read lock to a write lock on the same token.
    /// Releases the read hold first and then acquires fresh — an
    /// upgrade is never reentrant, per the commit protocol.
    pub fn upgrade(&self, guard: LockGuard) -> LockGuard {
        let token = guard.token.clone();
        drop(guard);
        self.write(token)
    }

    /// Number of distinct tokens with at least one live guard —
    /// exposed for tests and diagnostics.
    pub fn live_token_count(&self) -> usize {
        self.inner.entries.lock().expect("lock service poisoned").len()
    }
}

enum Held {
    None,
    Read(Arc<SharedLock>),
    Write(Arc<SharedLock>),
}

/// A held lock, scoped to one [`Token`]. Dropping releases the lock and
/// decrements the service's reference count for that token.
pub struct LockGuard {
    service: Option<LockService>,
    token: Token,
    held: Held,
}

impl LockGuard {
    /// A pass-through guard that holds nothing — used inside
    /// transactions that are already single-threaded by construction,
    /// where real mutual exclusion is unnecessary.
    pub fn no_op(token: Token) -> Self {
        Self {
            service: None,
            token,
            held: Held::None,
        }
    }

    pub fn token(&self) -> &Token {
        &self.token
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        match &self.held {
            Held::Read(lock) => lock.release_read(),
            Held::Write(lock) => lock.release_write(),
            Held::None => {}
        }
        if let Some(service) = &self.service {
            service.checkin(&self.token);
        }
    }
}

// ------------------------------------------------------------------------------------------------
// RangeLockService — range-aware conflict detection between live range locks
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum RangeLockError {
    #[error("range lock for key {key:?} conflicts with a live range lock")]
    Blocked { key: String },
}

struct ActiveRangeLock {
    id: u64,
    kind: LockKind,
    token: RangeToken,
}

struct RangeServiceInner {
    next_id: AtomicU64,
    active: Mutex<Vec<ActiveRangeLock>>,
}

/// Tracks every currently live range lock and decides whether a new
/// one would conflict, per the range-blocking rules: a read is blocked
/// by a satisfying write, and a write is blocked by an exact-match or
/// `Between` read that is satisfied by it, or by two one-sided reads
/// that together bracket it.
#[derive(Clone)]
pub struct RangeLockService {
    inner: Arc<RangeServiceInner>,
}

impl Default for RangeLockService {
    fn default() -> Self {
        Self::new()
    }
}

impl RangeLockService {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RangeServiceInner {
                next_id: AtomicU64::new(0),
                active: Mutex::new(Vec::new()),
            }),
        }
    }

    /// `true` if acquiring `token` as `kind` would conflict with an
    /// already-live range lock for the same key.
    pub fn is_blocked(&self, kind: LockKind, token: &RangeToken) -> bool {
        let active = self.inner.active.lock().expect("range lock service poisoned");
        is_blocked(&active, kind, token)
    }

    /// Atomically checks for a conflict and, if none, registers `token`
    /// as live. Acquisition never blocks or times out — a conflict is
    /// reported immediately so the caller can abort the operation.
    pub fn acquire(&self, kind: LockKind, token: RangeToken) -> Result<RangeLockGuard, RangeLockError> {
        let mut active = self.inner.active.lock().expect("range lock service poisoned");
        if is_blocked(&active, kind, &token) {
            return Err(RangeLockError::Blocked { key: token.key().to_string() });
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        active.push(ActiveRangeLock { id, kind, token });
        Ok(RangeLockGuard { service: Some(self.clone()), id })
    }

    /// Number of currently live range locks — exposed for tests.
    pub fn live_count(&self) -> usize {
        self.inner.active.lock().expect("range lock service poisoned").len()
    }
}

fn is_blocked(active: &[ActiveRangeLock], kind: LockKind, token: &RangeToken) -> bool {
    match kind {
        LockKind::Read => is_read_blocked(active, token),
        LockKind::Write => is_write_blocked(active, token),
    }
}

fn is_read_blocked(active: &[ActiveRangeLock], read: &RangeToken) -> bool {
    active
        .iter()
        .filter(|a| a.kind == LockKind::Write && a.token.key() == read.key())
        .any(|a| a.token.values().first().is_some_and(|w| read.satisfied_by(w)))
}

fn is_write_blocked(active: &[ActiveRangeLock], write: &RangeToken) -> bool {
    let Some(w) = write.values().first() else {
        return false;
    };
    let reads: Vec<&RangeToken> = active
        .iter()
        .filter(|a| a.kind == LockKind::Read && a.token.key() == write.key())
        .map(|a| &a.token)
        .collect();

    let exact_match = reads.iter().any(|r| r.operator() == Operator::Equals && r.satisfied_by(w));
    if exact_match {
        return true;
    }

    let between_match = reads.iter().any(|r| r.operator() == Operator::Between && r.satisfied_by(w));
    if between_match {
        return true;
    }

    let lower_bracket = reads
        .iter()
        .any(|r| matches!(r.operator(), Operator::LessThan | Operator::LessThanOrEquals) && r.satisfied_by(w));
    let upper_bracket = reads
        .iter()
        .any(|r| matches!(r.operator(), Operator::GreaterThan | Operator::GreaterThanOrEquals) && r.satisfied_by(w));
    lower_bracket && upper_bracket
}

/// A live range lock. Dropping removes it from the service's active
/// set, which may unblock conflicting locks others attempt afterward.
pub struct RangeLockGuard {
    service: Option<RangeLockService>,
    id: u64,
}

impl RangeLockGuard {
    /// A pass-through guard, for the same single-threaded-transaction
    /// reason as [`LockGuard::no_op`].
    pub fn no_op() -> Self {
        Self { service: None, id: 0 }
    }
}

impl Drop for RangeLockGuard {
    fn drop(&mut self) {
        if let Some(service) = &self.service {
            let mut active = service.inner.active.lock().expect("range lock service poisoned");
            active.retain(|a| a.id != self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    #[test]
    fn read_locks_on_the_same_token_do_not_conflict() {
        let service = LockService::new();
        let token = Token::for_record(1);
        let a = service.read(token.clone());
        let b = service.read(token.clone());
        assert_eq!(service.live_token_count(), 1);
        drop(a);
        drop(b);
        assert_eq!(service.live_token_count(), 0);
    }

    #[test]
    fn upgrade_releases_then_reacquires_as_write() {
        let service = LockService::new();
        let token = Token::for_key_record("age", 1);
        let guard = service.read(token.clone());
        let upgraded = service.upgrade(guard);
        assert_eq!(upgraded.token(), &token);
        drop(upgraded);
        assert_eq!(service.live_token_count(), 0);
    }

    #[test]
    fn no_op_guard_touches_nothing() {
        let guard = LockGuard::no_op(Token::for_record(9));
        drop(guard);
        let range_guard = RangeLockGuard::no_op();
        drop(range_guard);
    }

    #[test]
    fn write_is_blocked_by_exact_match_read() {
        let service = RangeLockService::new();
        let read = RangeToken::for_read("age", Operator::Equals, vec![Value::Integer(30)]);
        let _guard = service.acquire(LockKind::Read, read).unwrap();

        let write = RangeToken::for_write("age", Value::Integer(30));
        assert!(service.is_blocked(LockKind::Write, &write));
    }

    #[test]
    fn write_is_blocked_by_bracketing_reads() {
        let service = RangeLockService::new();
        let lower = RangeToken::for_read("age", Operator::LessThan, vec![Value::Integer(50)]);
        let upper = RangeToken::for_read("age", Operator::GreaterThan, vec![Value::Integer(10)]);
        let _g1 = service.acquire(LockKind::Read, lower).unwrap();
        let _g2 = service.acquire(LockKind::Read, upper).unwrap();

        let write = RangeToken::for_write("age", Value::Integer(30));
        assert!(service.is_blocked(LockKind::Write, &write));

        // Outside the bracket, the write is not blocked.
        let safe_write = RangeToken::for_write("age", Value::Integer(5));
        assert!(!service.is_blocked(LockKind::Write, &safe_write));
    }

    #[test]
    fn write_is_blocked_by_a_satisfying_between_read() {
        let service = RangeLockService::new();
        let read = RangeToken::for_read("age", Operator::Between, vec![Value::Integer(20), Value::Integer(40)]);
        let _guard = service.acquire(LockKind::Read, read).unwrap();

        let write = RangeToken::for_write("age", Value::Integer(25));
        assert!(service.is_blocked(LockKind::Write, &write));

        let outside = RangeToken::for_write("age", Value::Integer(40));
        assert!(!service.is_blocked(LockKind::Write, &outside));
    }

    #[test]
    fn read_is_blocked_by_satisfying_write() {
        let service = RangeLockService::new();
        let write = RangeToken::for_write("age", Value::Integer(30));
        let _guard = service.acquire(LockKind::Write, write).unwrap();

        let read = RangeToken::for_read("age", Operator::GreaterThan, vec![Value::Integer(10)]);
        assert!(service.is_blocked(LockKind::Read, &read));

        let other_read = RangeToken::for_read("age", Operator::GreaterThan, vec![Value::Integer(50)]);
        assert!(!service.is_blocked(LockKind::Read, &other_read));
    }

    #[test]
    fn acquire_fails_and_does_not_register_when_blocked() {
        let service = RangeLockService::new();
        let write = RangeToken::for_write("age", Value::Integer(30));
        let _guard = service.acquire(LockKind::Write, write).unwrap();

        let read = RangeToken::for_read("age", Operator::Equals, vec![Value::Integer(30)]);
        let err = service.acquire(LockKind::Read, read).unwrap_err();
        assert!(matches!(err, RangeLockError::Blocked { .. }));
        assert_eq!(service.live_count(), 1);
    }

    #[test]
    fn dropping_a_guard_frees_its_slot() {
        let service = RangeLockService::new();
        let write = RangeToken::for_write("age", Value::Integer(30));
        let guard = service.acquire(LockKind::Write, write).unwrap();
        assert_eq!(service.live_count(), 1);
        drop(guard);
        assert_eq!(service.live_count(), 0);
    }
}
