//! The write-ahead buffer: [`Page`] (one memory-mapped, fixed-size slab)
//! and [`Ledger`] (an ordered sequence of Pages that accepts, drains,
//! and verifies [`Write`]s).
//!
//! This module generalizes the crate's generic, rotating,
//! CRC-checksummed write-ahead log (see [`crate::wal`]) from an
//! arbitrary byte record to the concrete [`Write`] type, and from a
//! single growing file to fixed-size, pre-allocated, memory-mapped
//! pages per the specified page file layout: `[4-byte recordSize][Write
//! bytes]*` filling the configured page size.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use bloomfilter::Bloom;
use memmap2::MmapMut;
use thiserror::Error;

use crate::encoding::{decode_from_slice, encode_to_vec};
use crate::write::Write;

const RECORD_LEN_SIZE: usize = 4;
const BLOOM_FALSE_POSITIVE_RATE: f64 = 0.01;

/// Errors produced by the Ledger and its Pages.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encoding error: {0}")]
    Encoding(#[from] crate::encoding::EncodingError),

    /// A Page cannot hold another write — recovered locally by rotating
    /// to a new Page.
    #[error("page at capacity ({used} of {capacity} bytes used, need {needed} more)")]
    Capacity {
        used: usize,
        capacity: usize,
        needed: usize,
    },

    /// The destination rejected a transported write.
    #[error("destination error during transport: {0}")]
    Destination(String),

    #[error("internal ledger error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Page — one fixed-size, memory-mapped slab of Writes
// ------------------------------------------------------------------------------------------------

/// One file-backed slab of the Ledger.
///
/// Pages are created at a fixed capacity and never resized. Writes are
/// appended sequentially as `[u32 record_len][Write bytes]`; each insert
/// updates the page's bloom filter over `(record, key, value)` triples
/// and issues an `mmap` flush, so a successful insert is durable before
/// `Page::insert` returns.
pub struct Page {
    path: PathBuf,
    mmap: MmapMut,
    capacity: usize,
    /// Byte offset of the next write to append.
    cursor: usize,
    /// Byte offset at which each inserted write begins, in insertion
    /// order — the page's local write index.
    offsets: Vec<usize>,
    /// Index into `offsets` of the next write to drain via `transport`.
    head: usize,
    bloom: Bloom<Vec<u8>>,
}

impl Page {
    /// Creates a new, empty page file of `capacity` bytes at `path`.
    pub fn create(path: impl AsRef<Path>, capacity: usize, expected_insertions: usize) -> Result<Self, LedgerError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(capacity as u64)?;
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        let bloom = Bloom::new_for_fp_rate(expected_insertions.max(1), BLOOM_FALSE_POSITIVE_RATE)
            .map_err(|e| LedgerError::Internal(e.to_string()))?;

        Ok(Self {
            path,
            mmap,
            capacity,
            cursor: 0,
            offsets: Vec::new(),
            head: 0,
            bloom,
        })
    }

    /// Reopens an existing page file, rebuilding the in-memory offset
    /// index, head cursor, and bloom filter by replaying its bytes.
    /// Used during crash recovery. Stops at the first malformed or
    /// truncated record, treating the remainder of the page as unused
    /// capacity (never-committed writes past that point).
    pub fn open(path: impl AsRef<Path>, expected_insertions: usize) -> Result<Self, LedgerError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let capacity = file.metadata()?.len() as usize;
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        let mut bloom = Bloom::new_for_fp_rate(expected_insertions.max(1), BLOOM_FALSE_POSITIVE_RATE)
            .map_err(|e| LedgerError::Internal(e.to_string()))?;

        let mut cursor = 0usize;
        let mut offsets = Vec::new();
        while cursor + RECORD_LEN_SIZE <= capacity {
            let len_bytes = &mmap[cursor..cursor + RECORD_LEN_SIZE];
            let record_len = u32::from_le_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]) as usize;
            if record_len == 0 || cursor + RECORD_LEN_SIZE + record_len > capacity {
                break;
            }
            let record_start = cursor + RECORD_LEN_SIZE;
            match decode_from_slice::<Write>(&mmap[record_start..record_start + record_len]) {
                Ok((write, _)) => {
                    bloom.set(&probe_bytes(write.record(), write.key(), write.value()));
                    offsets.push(cursor);
                    cursor = record_start + record_len;
                }
                Err(_) => break,
            }
        }

        Ok(Self {
            path,
            mmap,
            capacity,
            cursor,
            offsets,
            head: 0,
            bloom,
        })
    }

    /// Appends `write` to this page, returning
    /// [`LedgerError::Capacity`] if there is insufficient room.
    pub fn insert(&mut self, write: &Write) -> Result<(), LedgerError> {
        let bytes = encode_to_vec(write)?;
        let needed = RECORD_LEN_SIZE + bytes.len();
        if self.cursor + needed > self.capacity {
            return Err(LedgerError::Capacity {
                used: self.cursor,
                capacity: self.capacity,
                needed,
            });
        }

        let len = bytes.len() as u32;
        let start = self.cursor;
        self.mmap[start..start + RECORD_LEN_SIZE].copy_from_slice(&len.to_le_bytes());
        self.mmap[start + RECORD_LEN_SIZE..start + needed].copy_from_slice(&bytes);
        self.mmap.flush_range(start, needed)?;

        self.bloom.set(&probe_bytes(write.record(), write.key(), write.value()));
        self.offsets.push(start);
        self.cursor = start + needed;
        Ok(())
    }

    /// Decodes and returns the write at local index `idx`, if any.
    pub fn get(&self, idx: usize) -> Option<Write> {
        let start = *self.offsets.get(idx)?;
        let record_start = start + RECORD_LEN_SIZE;
        let len_bytes = &self.mmap[start..record_start];
        let record_len = u32::from_le_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]) as usize;
        decode_from_slice::<Write>(&self.mmap[record_start..record_start + record_len])
            .ok()
            .map(|(w, _)| w)
    }

    /// Number of writes inserted into this page so far.
    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// `true` if every inserted write has been transported (drained).
    pub fn is_fully_drained(&self) -> bool {
        self.head >= self.offsets.len()
    }

    /// The next local index to drain.
    pub fn head(&self) -> usize {
        self.head
    }

    fn advance_head(&mut self) {
        self.head += 1;
    }

    /// `true` if this page's bloom filter may contain `probe` — a
    /// false `false` (definite negative) means none of this page's
    /// writes can match.
    pub fn may_contain(&self, probe: &[u8]) -> bool {
        self.bloom.check(probe)
    }

    /// Iterates every write in this page in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = Write> + '_ {
        (0..self.offsets.len()).filter_map(move |i| self.get(i))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self) -> Result<(), LedgerError> {
        self.mmap.flush()?;
        Ok(())
    }
}

fn probe_bytes(record: u64, key: &str, value: &crate::value::Value) -> Vec<u8> {
    let mut bytes = record.to_le_bytes().to_vec();
    bytes.extend_from_slice(key.as_bytes());
    let _ = value.encode_to(&mut bytes);
    bytes
}

use crate::encoding::Encode;

// ------------------------------------------------------------------------------------------------
// Destination — the drain target for `Ledger::transport`
// ------------------------------------------------------------------------------------------------

/// A sink that `Ledger::transport` hands drained writes to.
///
/// Implemented by [`crate::database::Database`], which routes each
/// drained write to its current mutable segment, sealing and rotating
/// that segment when `begin_new_segment` is requested.
pub trait Destination {
    /// Accepts one drained write.
    fn accept(&mut self, write: Write) -> Result<(), LedgerError>;

    /// Called once a page has been fully drained, signalling that the
    /// destination should seal its current mutable unit (if any) and
    /// prepare to receive writes from a fresh one.
    fn begin_new_segment(&mut self) -> Result<(), LedgerError>;
}

// ------------------------------------------------------------------------------------------------
// Ledger
// ------------------------------------------------------------------------------------------------

struct LedgerInner {
    pages: VecDeque<Page>,
    next_page_id: u64,
}

/// The in-memory, durable, append-only write-ahead log: a sequence of
/// [`Page`]s.
///
/// Only the newest (current) page accepts inserts; only the oldest
/// (head) page is drained; all pages may be traversed by readers.
/// Versions are assigned here, at ledger acceptance, via a
/// monotonically increasing counter.
pub struct Ledger {
    dir: PathBuf,
    page_capacity: usize,
    expected_insertions: usize,
    inner: RwLock<LedgerInner>,
    next_version: AtomicU64,
}

impl Ledger {
    /// Opens (creating if necessary) a Ledger backed by page files
    /// under `dir`. Existing `page-*.dat` files are reopened and
    /// replayed in sorted order, per the directory-scan recovery
    /// discipline shared by every durable subsystem in this crate.
    pub fn open(dir: impl AsRef<Path>, page_capacity: usize, expected_insertions: usize) -> Result<Self, LedgerError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let mut entries: Vec<(u64, PathBuf)> = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if let Some(id) = parse_page_id(&path) {
                entries.push((id, path));
            }
        }
        entries.sort_by_key(|(id, _)| *id);

        let mut pages = VecDeque::new();
        let mut max_version = 0u64;
        let mut next_page_id = 0u64;
        for (id, path) in entries {
            let page = Page::open(&path, expected_insertions)?;
            for write in page.iter() {
                max_version = max_version.max(write.version());
            }
            next_page_id = next_page_id.max(id + 1);
            pages.push_back(page);
        }

        if pages.is_empty() {
            let path = dir.join(page_filename(0));
            pages.push_back(Page::create(&path, page_capacity, expected_insertions)?);
            next_page_id = 1;
        }

        Ok(Self {
            dir,
            page_capacity,
            expected_insertions,
            inner: RwLock::new(LedgerInner { pages, next_page_id }),
            next_version: AtomicU64::new(max_version + 1),
        })
    }

    /// Assigns the next monotonically increasing version. Exposed so
    /// callers (e.g. `Engine::version`) can read the optimistic-
    /// concurrency clock without inserting a write.
    pub fn current_version(&self) -> u64 {
        self.next_version.load(Ordering::SeqCst).saturating_sub(1)
    }

    /// Appends `write` (with a freshly assigned version) to the current
    /// page, rotating to a new page first if there is insufficient
    /// capacity. Returns `true` unconditionally on success, matching
    /// the specified `insert(Write) -> bool` contract.
    pub fn insert(&self, write: Write) -> Result<bool, LedgerError> {
        let version = self.next_version.fetch_add(1, Ordering::SeqCst);
        let write = write.with_version(version);

        let mut inner = self.inner.write().map_err(poison_err)?;
        match inner.pages.back_mut() {
            Some(page) => match page.insert(&write) {
                Ok(()) => {}
                Err(LedgerError::Capacity { .. }) => {
                    let id = inner.next_page_id;
                    inner.next_page_id += 1;
                    let path = self.dir.join(page_filename(id));
                    let mut new_page = Page::create(&path, self.page_capacity, self.expected_insertions)?;
                    new_page.insert(&write)?;
                    inner.pages.push_back(new_page);
                }
                Err(e) => return Err(e),
            },
            None => {
                let id = inner.next_page_id;
                inner.next_page_id += 1;
                let path = self.dir.join(page_filename(id));
                let mut new_page = Page::create(&path, self.page_capacity, self.expected_insertions)?;
                new_page.insert(&write)?;
                inner.pages.push_back(new_page);
            }
        }
        tracing::trace!(record = write.record(), key = write.key(), version, "ledger insert");
        Ok(true)
    }

    /// Drains one write from the oldest page into `destination`. When
    /// that page becomes fully drained *and* it is not the current
    /// (still-writable) page, the page is closed, its file deleted, and
    /// the destination is asked to begin a new segment.
    ///
    /// Returns `true` if a write was transported, `false` if there was
    /// nothing transportable.
    pub fn transport(&self, destination: &mut dyn Destination) -> Result<bool, LedgerError> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        let transported = {
            let Some(front) = inner.pages.front_mut() else {
                return Ok(false);
            };
            if front.is_fully_drained() {
                None
            } else {
                let idx = front.head();
                let write = front.get(idx).ok_or_else(|| {
                    LedgerError::Internal(format!("page missing write at head index {idx}"))
                })?;
                front.advance_head();
                Some(write)
            }
        };

        let Some(write) = transported else {
            return Ok(false);
        };

        destination
            .accept(write)
            .map_err(|e| LedgerError::Destination(e.to_string()))?;

        let should_close = inner.pages.len() > 1
            && inner
                .pages
                .front()
                .map(Page::is_fully_drained)
                .unwrap_or(false);
        if should_close {
            let page = inner.pages.pop_front().expect("checked non-empty above");
            std::fs::remove_file(page.path())?;
            destination
                .begin_new_segment()
                .map_err(|e| LedgerError::Destination(e.to_string()))?;
        }
        Ok(true)
    }

    /// Iterates writes in version order up to (and including)
    /// `timestamp`, toggling a boolean each time a stored write matches
    /// `probe` (ignoring action and version). Returns the final
    /// boolean, seeded with `prior_exists` — the parity contributed by
    /// state outside this Ledger (e.g. the Database's segments).
    pub fn verify(&self, probe: &Write, timestamp: u64, prior_exists: bool) -> Result<bool, LedgerError> {
        let inner = self.inner.read().map_err(poison_err)?;
        let mut present = prior_exists;
        for page in inner.pages.iter() {
            for write in page.iter() {
                if write.version() > timestamp {
                    continue;
                }
                if write.matches(probe) {
                    present = !present;
                }
            }
        }
        Ok(present)
    }

    /// Linear scan of every write ever inserted, in insertion order —
    /// the basis for `iterator`, `audit`, `describe`, `fetch`, and
    /// `browse`.
    pub fn iter_all(&self) -> Result<Vec<Write>, LedgerError> {
        let inner = self.inner.read().map_err(poison_err)?;
        Ok(inner.pages.iter().flat_map(Page::iter).collect())
    }

    /// All writes for a given record (`browse(record)`).
    pub fn for_record(&self, record: u64) -> Result<Vec<Write>, LedgerError> {
        Ok(self
            .iter_all()?
            .into_iter()
            .filter(|w| w.record() == record)
            .collect())
    }

    /// All writes for a given `(key, record)` (`audit(key, record)`).
    pub fn for_key_record(&self, key: &str, record: u64) -> Result<Vec<Write>, LedgerError> {
        Ok(self
            .iter_all()?
            .into_iter()
            .filter(|w| w.record() == record && w.key() == key)
            .collect())
    }

    /// All writes for a given key across every record (`browse(key)`).
    pub fn for_key(&self, key: &str) -> Result<Vec<Write>, LedgerError> {
        Ok(self.iter_all()?.into_iter().filter(|w| w.key() == key).collect())
    }

    /// Number of pages currently backing this ledger.
    pub fn page_count(&self) -> Result<usize, LedgerError> {
        Ok(self.inner.read().map_err(poison_err)?.pages.len())
    }

    /// Flushes every page's mapped region. Called during `Engine::close`.
    pub fn sync(&self) -> Result<(), LedgerError> {
        let inner = self.inner.read().map_err(poison_err)?;
        for page in inner.pages.iter() {
            page.flush()?;
        }
        Ok(())
    }
}

fn poison_err<T>(_: std::sync::PoisonError<T>) -> LedgerError {
    LedgerError::Internal("ledger lock poisoned".into())
}

fn page_filename(id: u64) -> String {
    format!("page-{id:06}.dat")
}

fn parse_page_id(path: &Path) -> Option<u64> {
    let stem = path.file_stem()?.to_str()?;
    let ext = path.extension()?.to_str()?;
    if ext != "dat" || !stem.starts_with("page-") {
        return None;
    }
    stem.trim_start_matches("page-").parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;
    use crate::write::Action;
    use tempfile::TempDir;

    struct CollectingDestination {
        accepted: Vec<Write>,
        segments_begun: usize,
    }

    impl Destination for CollectingDestination {
        fn accept(&mut self, write: Write) -> Result<(), LedgerError> {
            self.accepted.push(write);
            Ok(())
        }

        fn begin_new_segment(&mut self) -> Result<(), LedgerError> {
            self.segments_begun += 1;
            Ok(())
        }
    }

    fn probe_write(key: &str, value: Value, record: u64) -> Write {
        Write::probe(key, value, record)
    }

    #[test]
    fn insert_and_verify_xor_parity() {
        let tmp = TempDir::new().unwrap();
        let ledger = Ledger::open(tmp.path(), 1 << 16, 100).unwrap();

        ledger
            .insert(Write::new(Action::Add, "name", Value::String("Alice".into()), 1, 0))
            .unwrap();
        let probe = probe_write("name", Value::String("Alice".into()), 1);
        assert!(ledger.verify(&probe, u64::MAX, false).unwrap());

        ledger
            .insert(Write::new(Action::Remove, "name", Value::String("Alice".into()), 1, 0))
            .unwrap();
        assert!(!ledger.verify(&probe, u64::MAX, false).unwrap());

        ledger
            .insert(Write::new(Action::Add, "name", Value::String("Alice".into()), 1, 0))
            .unwrap();
        assert!(ledger.verify(&probe, u64::MAX, false).unwrap());
    }

    #[test]
    fn transport_drains_in_order_and_rotates_pages() {
        let tmp = TempDir::new().unwrap();
        // Small page capacity forces rotation after a couple of writes.
        let ledger = Ledger::open(tmp.path(), 256, 10).unwrap();

        for i in 0..5u64 {
            ledger
                .insert(Write::new(Action::Add, "k", Value::Integer(i as i32), i, 0))
                .unwrap();
        }
        assert!(ledger.page_count().unwrap() > 1);

        let mut dest = CollectingDestination {
            accepted: Vec::new(),
            segments_begun: 0,
        };
        while ledger.transport(&mut dest).unwrap() {}

        assert_eq!(dest.accepted.len(), 5);
        for (i, w) in dest.accepted.iter().enumerate() {
            assert_eq!(w.record(), i as u64);
        }
        assert!(dest.segments_begun >= 1);
    }

    #[test]
    fn recovers_pages_on_reopen() {
        let tmp = TempDir::new().unwrap();
        {
            let ledger = Ledger::open(tmp.path(), 1 << 16, 10).unwrap();
            ledger
                .insert(Write::new(Action::Add, "k", Value::Integer(1), 1, 0))
                .unwrap();
        }
        let ledger = Ledger::open(tmp.path(), 1 << 16, 10).unwrap();
        let writes = ledger.iter_all().unwrap();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].record(), 1);
        // Recovery continues version assignment above the max seen.
        assert!(ledger.current_version() >= writes[0].version());
    }

    #[test]
    fn capacity_error_recovers_by_rotating() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(page_filename(0));
        let mut page = Page::create(&path, 32, 10).unwrap();
        let write = Write::new(Action::Add, "a", Value::Boolean(true), 1, 1);
        page.insert(&write).unwrap();
        let err = page.insert(&write).unwrap_err();
        assert!(matches!(err, LedgerError::Capacity { .. }));
    }
}
