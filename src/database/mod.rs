//! [`Database`] — the ordered collection of [`Segment`]s: routes reads
//! to the right chunk, maintains one mutable (current) segment, and
//! hosts the optional size-tiered segment-merge optimizer.
//!
//! Generalizes `src/engine/mod.rs`'s layered-source read routing
//! (active memtable → frozen memtables → SSTables, newest first, with
//! bloom-gated early exit) from overwrite/LSN semantics to this
//! system's XOR-parity semantics — every source that might hold a
//! matching cell must be consulted and counted, since presence is a
//! parity of occurrences rather than "last write wins".

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use regex::Regex;
use thiserror::Error;

use crate::ledger::{Destination, LedgerError};
use crate::segment::chunk::{CorpusCell, IndexCell, TableCell};
use crate::segment::{Segment, SegmentBuilder, SegmentConfig, SegmentError};
use crate::token::Operator;
use crate::value::Value;
use crate::write::{Action, Write as KernelWrite};

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("segment error: {0}")]
    Segment(#[from] SegmentError),

    #[error("invalid regular expression: {0}")]
    Regex(#[from] regex::Error),

    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("internal database error: {0}")]
    Internal(String),
}

/// The value returned by `verify`/parity computations: a version and
/// whether the occurrence at that version was the matching one.
pub(crate) fn is_present(versions: impl Iterator<Item = u64>, timestamp: u64) -> bool {
    versions.filter(|&v| v <= timestamp).count() % 2 == 1
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub segment: SegmentConfig,
    pub max_writes_per_segment: u64,
    pub merge_similarity_threshold: f64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            segment: SegmentConfig::default(),
            max_writes_per_segment: 100_000,
            merge_similarity_threshold: 0.7,
        }
    }
}

struct Inner {
    sealed: Vec<Arc<Segment>>,
    current: Option<SegmentBuilder>,
}

/// The collection of sealed segments plus at most one mutable segment.
pub struct Database {
    dir: PathBuf,
    config: DatabaseConfig,
    next_segment_id: AtomicU64,
    inner: RwLock<Inner>,
}

impl Database {
    /// Opens (creating if necessary) a database rooted at `dir`,
    /// loading every `segment-*.seg` file present in sorted order.
    /// A file that fails signature/schema validation is quarantined
    /// (renamed to `.bad`) rather than aborting the open, matching
    /// the per-component "scan directory, skip what doesn't validate"
    /// recovery discipline. A segment that `intersects` one already
    /// loaded — the case where a crash left two copies of the same
    /// drained page on disk — is quarantined the same way rather than
    /// double-counting its occurrences.
    pub fn open(dir: impl AsRef<Path>, config: DatabaseConfig) -> Result<Self, DatabaseError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut entries: Vec<(u64, PathBuf)> = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if let Some(id) = parse_segment_id(&path) {
                entries.push((id, path));
            }
        }
        entries.sort_by_key(|(id, _)| *id);

        let mut sealed: Vec<Arc<Segment>> = Vec::new();
        let mut max_id = 0u64;
        for (id, path) in entries {
            match Segment::open(&path) {
                Ok(segment) => {
                    if let Some(duplicate_of) = sealed.iter().find(|existing| existing.intersects(&segment)) {
                        tracing::warn!(
                            ?path,
                            duplicate_min_ts = duplicate_of.min_ts(),
                            duplicate_max_ts = duplicate_of.max_ts(),
                            "quarantining segment that duplicates an already-loaded segment"
                        );
                        let bad_path = path.with_extension("bad");
                        let _ = fs::rename(&path, bad_path);
                        continue;
                    }
                    max_id = max_id.max(id);
                    sealed.push(Arc::new(segment));
                }
                Err(err) => {
                    tracing::warn!(?path, %err, "quarantining segment that failed to load");
                    let bad_path = path.with_extension("bad");
                    let _ = fs::rename(&path, bad_path);
                }
            }
        }
        sealed.sort_by(|a, b| crate::segment::temporal_cmp(a, b));

        Ok(Self {
            dir,
            config,
            next_segment_id: AtomicU64::new(max_id + 1),
            inner: RwLock::new(Inner { sealed, current: None }),
        })
    }

    fn poison<T>(_: std::sync::PoisonError<T>) -> DatabaseError {
        DatabaseError::Internal("database lock poisoned".into())
    }

    /// Routes `write` to the current mutable segment, creating one if
    /// needed; seals and rotates it once it reaches
    /// `max_writes_per_segment`.
    pub fn accept(&self, write: KernelWrite) -> Result<(), DatabaseError> {
        let mut inner = self.inner.write().map_err(Self::poison)?;
        if inner.current.is_none() {
            inner.current = Some(SegmentBuilder::new(self.config.segment.clone()));
        }
        {
            let builder = inner.current.as_ref().expect("just inserted");
            builder.acquire(&write)?;
        }
        let saturated = inner
            .current
            .as_ref()
            .map(|b| b.len())
            .transpose()?
            .is_some_and(|n| n >= self.config.max_writes_per_segment);
        if saturated {
            self.seal_current(&mut inner)?;
        }
        Ok(())
    }

    /// Seals the current mutable segment unconditionally (even if
    /// below the saturation threshold) — called when the Ledger page
    /// it is drawing from has been fully drained, so a segment never
    /// spans writes from two different pages.
    pub fn begin_new_segment(&self) -> Result<(), DatabaseError> {
        let mut inner = self.inner.write().map_err(Self::poison)?;
        if inner.current.as_ref().is_some_and(|b| !b.is_empty().unwrap_or(true)) {
            self.seal_current(&mut inner)?;
        }
        Ok(())
    }

    fn seal_current(&self, inner: &mut Inner) -> Result<(), DatabaseError> {
        let Some(builder) = inner.current.take() else {
            return Ok(());
        };
        let id = self.next_segment_id.fetch_add(1, Ordering::SeqCst);
        let path = self.dir.join(segment_filename(id));
        builder.sync(&path)?;
        let segment = Arc::new(Segment::open(&path)?);
        inner.sealed.push(segment);
        Ok(())
    }

    fn segments(&self) -> Result<(Vec<Arc<Segment>>, Option<SegmentBuilderSnapshot>), DatabaseError> {
        let inner = self.inner.read().map_err(Self::poison)?;
        Ok((inner.sealed.clone(), inner.current.as_ref().map(SegmentBuilderSnapshot::new)))
    }

    fn gather_table_cells(&self, record: u64) -> Result<Vec<TableCell>, DatabaseError> {
        let (sealed, current) = self.segments()?;
        let mut cells = Vec::new();
        for segment in &sealed {
            if segment.may_contain_record(record) {
                cells.extend(segment.table_cells_for_record(record)?);
            }
        }
        if let Some(current) = current {
            cells.extend(current.table_cells_for_record(record)?);
        }
        Ok(cells)
    }

    fn gather_index_cells(&self, key: &str) -> Result<Vec<IndexCell>, DatabaseError> {
        let (sealed, current) = self.segments()?;
        let mut cells = Vec::new();
        for segment in &sealed {
            if segment.may_contain_key(key) {
                cells.extend(segment.index_cells_for_key(key)?);
            }
        }
        if let Some(current) = current {
            cells.extend(current.index_cells_for_key(key)?);
        }
        Ok(cells)
    }

    fn gather_corpus_cells(&self, term: &str) -> Result<Vec<CorpusCell>, DatabaseError> {
        let (sealed, current) = self.segments()?;
        let mut cells = Vec::new();
        for segment in &sealed {
            if segment.may_contain_term(term) {
                cells.extend(segment.corpus_cells_for_term(term)?);
            }
        }
        if let Some(current) = current {
            cells.extend(current.corpus_cells_for_term(term)?);
        }
        Ok(cells)
    }

    /// `true` iff `(key, value, record)` is present at `timestamp`
    /// (the odd-occurrence-count rule).
    pub fn verify(&self, key: &str, value: &Value, record: u64, timestamp: u64) -> Result<bool, DatabaseError> {
        let cells = self.gather_table_cells(record)?;
        let versions = cells
            .into_iter()
            .filter(|c| c.key == key && &c.value == value)
            .map(|c| c.version);
        Ok(is_present(versions, timestamp))
    }

    /// The current values held for `(record, key)` at `timestamp`.
    pub fn fetch(&self, key: &str, record: u64, timestamp: u64) -> Result<Vec<Value>, DatabaseError> {
        let cells = self.gather_table_cells(record)?;
        Ok(group_present_values(
            cells.into_iter().filter(|c| c.key == key),
            |c| c.value.clone(),
            |c| c.version,
            timestamp,
        ))
    }

    /// Every `(key, value)` pair currently present for `record` at
    /// `timestamp`.
    pub fn browse_record(&self, record: u64, timestamp: u64) -> Result<Vec<(String, Value)>, DatabaseError> {
        let cells = self.gather_table_cells(record)?;
        Ok(group_present_pairs(
            cells.into_iter(),
            |c| (c.key.clone(), c.value.clone()),
            |c| c.version,
            timestamp,
        ))
    }

    /// Every `(value, record)` pair currently present for `key` at
    /// `timestamp` — the inverted-index read.
    pub fn browse_key(&self, key: &str, timestamp: u64) -> Result<Vec<(Value, u64)>, DatabaseError> {
        let cells = self.gather_index_cells(key)?;
        Ok(group_present_pairs(
            cells.into_iter(),
            |c| (c.value.clone(), c.record),
            |c| c.version,
            timestamp,
        ))
    }

    /// Records where `key op values` holds at `timestamp`.
    pub fn find(&self, key: &str, op: Operator, values: &[Value], timestamp: u64) -> Result<Vec<u64>, DatabaseError> {
        let present = self.browse_key(key, timestamp)?;
        evaluate_find(present, op, values)
    }

    /// Records whose `key` field currently contains `query` as an
    /// ordered sequence of substrings (stopwords stripped,
    /// case-insensitive).
    pub fn search(&self, key: &str, query: &str) -> Result<Vec<u64>, DatabaseError> {
        let stopwords = &self.config.segment.stopwords;
        let min_size = self.config.segment.min_search_index_size;
        let tokens = tokenize_query(query, stopwords, min_size);
        if tokens.is_empty() {
            return Ok(Vec::new());
        }

        // For each token, the set of (record -> sorted term positions)
        // currently present, restricted to this field key.
        let mut per_token: Vec<std::collections::HashMap<u64, Vec<u32>>> = Vec::with_capacity(tokens.len());
        for token in &tokens {
            let cells = self.gather_corpus_cells(token)?;
            let mut by_record: std::collections::HashMap<u64, Vec<(u32, u64)>> = std::collections::HashMap::new();
            for cell in cells.into_iter().filter(|c| c.field_key == key) {
                by_record
                    .entry(cell.position.record)
                    .or_default()
                    .push((cell.position.term_index, cell.version));
            }
            let mut present_positions: std::collections::HashMap<u64, Vec<u32>> = std::collections::HashMap::new();
            for (record, occurrences) in by_record {
                let mut by_position: std::collections::HashMap<u32, Vec<u64>> = std::collections::HashMap::new();
                for (pos, version) in occurrences {
                    by_position.entry(pos).or_default().push(version);
                }
                let mut positions: Vec<u32> = by_position
                    .into_iter()
                    .filter(|(_, versions)| is_present(versions.iter().copied(), u64::MAX))
                    .map(|(pos, _)| pos)
                    .collect();
                positions.sort_unstable();
                if !positions.is_empty() {
                    present_positions.insert(record, positions);
                }
            }
            per_token.push(present_positions);
        }

        let mut hits = Vec::new();
        let Some(first) = per_token.first() else {
            return Ok(Vec::new());
        };
        'records: for record in first.keys().copied() {
            let mut floor = None;
            for token_positions in &per_token {
                let Some(positions) = token_positions.get(&record) else {
                    continue 'records;
                };
                let next = match floor {
                    None => positions.first().copied(),
                    Some(f) => positions.iter().copied().find(|&p| p > f),
                };
                match next {
                    Some(p) => floor = Some(p),
                    None => continue 'records,
                }
            }
            hits.push(record);
        }
        hits.sort_unstable();
        Ok(hits)
    }

    /// Every revision ever recorded for `record`, regardless of
    /// parity, in version order.
    pub fn audit_record(&self, record: u64) -> Result<Vec<KernelWrite>, DatabaseError> {
        let mut cells = self.gather_table_cells(record)?;
        cells.sort_by_key(|c| c.version);
        Ok(cells.into_iter().map(table_cell_to_write).collect())
    }

    /// Every revision ever recorded for `(key, record)`, regardless of
    /// parity, in version order.
    pub fn audit_key_record(&self, key: &str, record: u64) -> Result<Vec<KernelWrite>, DatabaseError> {
        let mut writes = self.audit_record(record)?;
        writes.retain(|w| w.key() == key);
        Ok(writes)
    }

    /// Every revision ever recorded for `key` across every record,
    /// regardless of parity, in version order — the raw equivalent of
    /// [`Database::browse_key`], used by `Engine` to merge durable
    /// segment history with not-yet-transported Ledger writes.
    pub fn audit_key(&self, key: &str) -> Result<Vec<KernelWrite>, DatabaseError> {
        let mut cells = self.gather_index_cells(key)?;
        cells.sort_by_key(|c| c.version);
        Ok(cells.into_iter().map(index_cell_to_write).collect())
    }

    /// Attempts one size-tiered merge: finds the most-similar adjacent
    /// pair of sealed segments above `merge_similarity_threshold`,
    /// replays the union of their writes into a fresh segment, and
    /// retires the two originals. Returns `true` if a merge happened.
    ///
    /// Generalizes `compaction::stcs`'s bucket-then-select-then-merge
    /// pipeline from file-size buckets to segment `similarity()`; per
    /// the optimizer's optional status, a failed or skipped attempt is
    /// not an error — it simply returns `false`.
    pub fn optimize(&self) -> Result<bool, DatabaseError> {
        let best = {
            let inner = self.inner.read().map_err(Self::poison)?;
            let mut best: Option<(usize, f64)> = None;
            for i in 0..inner.sealed.len().saturating_sub(1) {
                let sim = inner.sealed[i].similarity(&inner.sealed[i + 1]);
                if sim >= self.config.merge_similarity_threshold && best.is_none_or(|(_, b)| sim > b) {
                    best = Some((i, sim));
                }
            }
            best.map(|(i, _)| (Arc::clone(&inner.sealed[i]), Arc::clone(&inner.sealed[i + 1]), i))
        };
        let Some((left, right, index)) = best else {
            return Ok(false);
        };

        let merged = SegmentBuilder::new(self.config.segment.clone());
        let mut writes: Vec<KernelWrite> = Vec::new();
        for cell in left.all_table_cells()?.into_iter().chain(right.all_table_cells()?) {
            writes.push(table_cell_to_write(cell));
        }
        writes.sort_by_key(|w| w.version());
        for write in &writes {
            merged.acquire(write)?;
        }

        let mut inner = self.inner.write().map_err(Self::poison)?;
        // Re-validate the pair is still adjacent and unchanged before
        // splicing, in case a concurrent merge already touched it.
        if index + 1 >= inner.sealed.len()
            || !Arc::ptr_eq(&inner.sealed[index], &left)
            || !Arc::ptr_eq(&inner.sealed[index + 1], &right)
        {
            return Ok(false);
        }

        let id = self.next_segment_id.fetch_add(1, Ordering::SeqCst);
        let path = self.dir.join(segment_filename(id));
        merged.sync(&path)?;
        let merged_segment = Arc::new(Segment::open(&path)?);

        inner.sealed.splice(index..index + 2, [merged_segment]);
        let _ = fs::remove_file(left.path());
        let _ = fs::remove_file(right.path());
        Ok(true)
    }
}

/// A snapshot handle letting read methods borrow the mutable
/// segment's in-memory chunk builders without holding the database
/// lock for the duration of the query.
struct SegmentBuilderSnapshot<'a> {
    builder: &'a SegmentBuilder,
}

impl<'a> SegmentBuilderSnapshot<'a> {
    fn new(builder: &'a SegmentBuilder) -> Self {
        Self { builder }
    }

    fn table_cells_for_record(&self, record: u64) -> Result<Vec<TableCell>, DatabaseError> {
        Ok(self.builder.table_cells_for_record(record)?)
    }

    fn index_cells_for_key(&self, key: &str) -> Result<Vec<IndexCell>, DatabaseError> {
        Ok(self.builder.index_cells_for_key(key)?)
    }

    fn corpus_cells_for_term(&self, term: &str) -> Result<Vec<CorpusCell>, DatabaseError> {
        Ok(self.builder.corpus_cells_for_term(term)?)
    }
}

fn table_cell_to_write(cell: TableCell) -> KernelWrite {
    KernelWrite::new(cell.action, cell.key, cell.value, cell.record, cell.version)
}

fn index_cell_to_write(cell: IndexCell) -> KernelWrite {
    KernelWrite::new(cell.action, cell.key, cell.value, cell.record, cell.version)
}

/// Shared by `Database::find` and `Engine::find` — evaluates a set of
/// already-present `(value, record)` pairs against a query operator.
pub(crate) fn evaluate_find(
    present: Vec<(Value, u64)>,
    op: Operator,
    values: &[Value],
) -> Result<Vec<u64>, DatabaseError> {
    let mut hits: Vec<u64> = match op {
        Operator::Regex | Operator::NotRegex => {
            let Some(Value::String(pattern)) = values.first() else {
                return Err(DatabaseError::UnsupportedOperation(
                    "REGEX/NOT_REGEX require a string pattern".into(),
                ));
            };
            let re = Regex::new(pattern)?;
            present
                .into_iter()
                .filter(|(v, _)| {
                    let is_match = re.is_match(&v.to_string());
                    if op == Operator::Regex { is_match } else { !is_match }
                })
                .map(|(_, r)| r)
                .collect()
        }
        Operator::Between => {
            let (Some(low), Some(high)) = (values.first(), values.get(1)) else {
                return Err(DatabaseError::UnsupportedOperation("BETWEEN requires two values".into()));
            };
            present.into_iter().filter(|(v, _)| v >= low && v < high).map(|(_, r)| r).collect()
        }
        _ => {
            let Some(value) = values.first() else {
                return Err(DatabaseError::UnsupportedOperation(format!("{op:?} requires one value")));
            };
            present.into_iter().filter(|(v, _)| op.evaluate_scalar(v, value)).map(|(_, r)| r).collect()
        }
    };
    hits.sort_unstable();
    hits.dedup();
    Ok(hits)
}

/// Lowercases, whitespace-splits, and strips stopwords/too-short tokens
/// from `query` — shared by `Database::search` (over corpus chunks) and
/// `Engine::search` (over merged Ledger+Database text).
pub(crate) fn tokenize_query(query: &str, stopwords: &[String], min_size: usize) -> Vec<String> {
    query
        .split_whitespace()
        .map(|t| t.to_lowercase())
        .filter(|t| t.len() >= min_size && !stopwords.iter().any(|s| s == t))
        .collect()
}

pub(crate) fn group_present_values<T>(
    items: impl Iterator<Item = T>,
    value_of: impl Fn(&T) -> Value,
    version_of: impl Fn(&T) -> u64,
    timestamp: u64,
) -> Vec<Value> {
    let mut groups: Vec<(Value, Vec<u64>)> = Vec::new();
    for item in items {
        let value = value_of(&item);
        match groups.iter_mut().find(|(v, _)| v == &value) {
            Some((_, versions)) => versions.push(version_of(&item)),
            None => groups.push((value, vec![version_of(&item)])),
        }
    }
    groups
        .into_iter()
        .filter(|(_, versions)| is_present(versions.iter().copied(), timestamp))
        .map(|(v, _)| v)
        .collect()
}

pub(crate) fn group_present_pairs<T, K: PartialEq>(
    items: impl Iterator<Item = T>,
    key_of: impl Fn(&T) -> K,
    version_of: impl Fn(&T) -> u64,
    timestamp: u64,
) -> Vec<K> {
    let mut groups: Vec<(K, Vec<u64>)> = Vec::new();
    for item in items {
        let key = key_of(&item);
        match groups.iter_mut().find(|(k, _)| k == &key) {
            Some((_, versions)) => versions.push(version_of(&item)),
            None => groups.push((key, vec![version_of(&item)])),
        }
    }
    groups
        .into_iter()
        .filter(|(_, versions)| is_present(versions.iter().copied(), timestamp))
        .map(|(k, _)| k)
        .collect()
}

fn segment_filename(id: u64) -> String {
    format!("segment-{id:06}.seg")
}

fn parse_segment_id(path: &Path) -> Option<u64> {
    let stem = path.file_stem()?.to_str()?;
    let ext = path.extension()?.to_str()?;
    if ext != "seg" || !stem.starts_with("segment-") {
        return None;
    }
    stem.trim_start_matches("segment-").parse().ok()
}

/// Adapts [`Database`] to the [`Destination`] contract the Ledger
/// drains into. A small `Arc`-holding handle rather than an impl
/// directly on `Database`, since `Database` is shared for concurrent
/// reads via `Arc<Database>` while `Destination` requires exclusive
/// (`&mut self`) access — the background drain thread owns its own
/// `DatabaseSink` value, so that exclusivity costs nothing.
pub struct DatabaseSink {
    database: Arc<Database>,
}

impl DatabaseSink {
    pub fn new(database: Arc<Database>) -> Self {
        Self { database }
    }
}

impl Destination for DatabaseSink {
    fn accept(&mut self, write: KernelWrite) -> Result<(), LedgerError> {
        self.database.accept(write).map_err(|e| LedgerError::Destination(e.to_string()))
    }

    fn begin_new_segment(&mut self) -> Result<(), LedgerError> {
        self.database
            .begin_new_segment()
            .map_err(|e| LedgerError::Destination(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config() -> DatabaseConfig {
        DatabaseConfig {
            max_writes_per_segment: 4,
            ..DatabaseConfig::default()
        }
    }

    #[test]
    fn accept_then_verify_round_trips() {
        let tmp = TempDir::new().unwrap();
        let db = Database::open(tmp.path(), config()).unwrap();
        db.accept(KernelWrite::new(Action::Add, "name", Value::String("Alice".into()), 1, 1))
            .unwrap();
        assert!(db.verify("name", &Value::String("Alice".into()), 1, u64::MAX).unwrap());

        db.accept(KernelWrite::new(Action::Remove, "name", Value::String("Alice".into()), 1, 2))
            .unwrap();
        assert!(!db.verify("name", &Value::String("Alice".into()), 1, u64::MAX).unwrap());
    }

    #[test]
    fn saturation_seals_and_rotates_segments() {
        let tmp = TempDir::new().unwrap();
        let db = Database::open(tmp.path(), config()).unwrap();
        for i in 0..10u64 {
            db.accept(KernelWrite::new(Action::Add, "k", Value::Integer(i as i32), i, i + 1)).unwrap();
        }
        let sealed_files: Vec<_> = fs::read_dir(tmp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().and_then(|s| s.to_str()) == Some("seg"))
            .collect();
        assert!(!sealed_files.is_empty());
    }

    #[test]
    fn find_between_is_half_open() {
        let tmp = TempDir::new().unwrap();
        let db = Database::open(tmp.path(), config()).unwrap();
        for (record, age) in [(1, 10), (2, 20), (3, 30), (4, 40)] {
            db.accept(KernelWrite::new(Action::Add, "age", Value::Integer(age), record, record)).unwrap();
        }
        let hits = db
            .find("age", Operator::Between, &[Value::Integer(20), Value::Integer(40)], u64::MAX)
            .unwrap();
        assert_eq!(hits, vec![2, 3]);
    }

    #[test]
    fn search_finds_infix_and_respects_stopwords() {
        let tmp = TempDir::new().unwrap();
        let db = Database::open(tmp.path(), config()).unwrap();
        db.accept(KernelWrite::new(
            Action::Add,
            "bio",
            Value::String("the quick brown fox".into()),
            7,
            1,
        ))
        .unwrap();
        assert_eq!(db.search("bio", "quic").unwrap(), vec![7]);
        assert!(db.search("bio", "the").unwrap().is_empty());
        assert_eq!(db.search("bio", "quic brow").unwrap(), vec![7]);
    }

    #[test]
    fn audit_keeps_every_revision_regardless_of_parity() {
        let tmp = TempDir::new().unwrap();
        let db = Database::open(tmp.path(), config()).unwrap();
        db.accept(KernelWrite::new(Action::Add, "x", Value::Integer(1), 1, 1)).unwrap();
        db.accept(KernelWrite::new(Action::Remove, "x", Value::Integer(1), 1, 2)).unwrap();
        db.accept(KernelWrite::new(Action::Add, "x", Value::Integer(1), 1, 3)).unwrap();
        let writes = db.audit_key_record("x", 1).unwrap();
        assert_eq!(writes.len(), 3);
        assert_eq!(writes.iter().map(|w| w.version()).collect::<Vec<_>>(), vec![1, 2, 3]);
    }
}
