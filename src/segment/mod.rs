//! [`Segment`] — an immutable, on-disk, indexed unit built from one
//! drained Ledger page — and [`SegmentBuilder`], its mutable
//! counterpart.
//!
//! A segment holds three chunks (by-record, by-value, by-term); this
//! module generalizes the atomic tmp-then-rename write, header/footer
//! CRC framing, and bloom-filter-gated read path of
//! `src/sstable/mod.rs` + `src/sstable/builder.rs` from one sorted
//! key/value stream to three independently-indexed chunks sharing one
//! sealed file.

pub mod chunk;

use std::fs::{self, File, OpenOptions};
use std::io::Write as IoWrite;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use bloomfilter::Bloom;
use memmap2::Mmap;
use thiserror::Error;

use crate::value::Value;
use crate::write::{Action, Write as KernelWrite};

use chunk::{
    decode_cells, encode_chunk, ChunkBuilder, CorpusCell, IndexCell, Manifest, Position, TableCell,
};

/// 13-byte file signature, reproduced bit-exact from the external
/// interface contract.
pub const SEGMENT_SIGNATURE: &[u8; 13] = b"Cinchapi Inc.";
const SCHEMA_VERSION: u8 = 1;
const CHUNK_BLOOM_FALSE_POSITIVE_RATE: f64 = 0.01;

/// Header size: 13 (signature) + 1 (schema) + 8*4 (count/minTs/maxTs/
/// syncTs) + 8*4 (reserved) + 8*9 (chunk lengths).
const HEADER_LEN: usize = 13 + 1 + 8 * 4 + 8 * 4 + 8 * 9;

#[derive(Debug, Error)]
pub enum SegmentError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encoding error: {0}")]
    Encoding(#[from] crate::encoding::EncodingError),

    #[error("segment signature mismatch")]
    BadSignature,

    #[error("unsupported segment schema version {0}")]
    UnsupportedSchema(u8),

    #[error("segment file too short: need at least {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("chunk fan-out task failed: {0}")]
    FanOut(String),

    #[error("internal segment error: {0}")]
    Internal(String),
}

/// Tunables threaded in from `KernelConfig`.
#[derive(Debug, Clone)]
pub struct SegmentConfig {
    pub min_search_index_size: usize,
    pub max_search_substring_length: usize,
    pub stopwords: Vec<String>,
    pub expected_insertions: usize,
    pub mmap_write_upper_limit: u64,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            min_search_index_size: 3,
            max_search_substring_length: 32,
            stopwords: default_stopwords(),
            expected_insertions: 10_000,
            mmap_write_upper_limit: 64 * 1024 * 1024,
        }
    }
}

fn default_stopwords() -> Vec<String> {
    ["a", "an", "and", "are", "as", "at", "be", "but", "by", "for", "if", "in", "into", "is",
     "it", "no", "not", "of", "on", "or", "such", "that", "the", "their", "then", "there",
     "these", "they", "this", "to", "was", "will", "with"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

// ------------------------------------------------------------------------------------------------
// SegmentBuilder — the mutable segment
// ------------------------------------------------------------------------------------------------

struct BuilderState {
    table: ChunkBuilder<TableCell>,
    index: ChunkBuilder<IndexCell>,
    corpus: ChunkBuilder<CorpusCell>,
    min_ts: u64,
    max_ts: u64,
    count: u64,
}

impl Default for BuilderState {
    fn default() -> Self {
        Self {
            table: ChunkBuilder::new(),
            index: ChunkBuilder::new(),
            corpus: ChunkBuilder::new(),
            min_ts: u64::MAX,
            max_ts: 0,
            count: 0,
        }
    }
}

/// The receipt returned from `SegmentBuilder::acquire`: one artifact
/// per chunk, confirming the write was fanned out successfully.
pub struct Receipt {
    pub table_cell: TableCell,
    pub index_cell: IndexCell,
    pub corpus_cells: Vec<CorpusCell>,
}

/// A mutable, in-memory segment accumulating writes fanned out across
/// its three chunks, until `sync` seals it to disk.
pub struct SegmentBuilder {
    config: SegmentConfig,
    state: RwLock<BuilderState>,
}

impl SegmentBuilder {
    pub fn new(config: SegmentConfig) -> Self {
        Self {
            config,
            state: RwLock::new(BuilderState::default()),
        }
    }

    /// Fans `write` out to the Table, Index, and Corpus chunk builders
    /// under a single write lock, using `crossbeam::scope` so the
    /// (CPU-bound) tokenization work for Corpus overlaps with the
    /// cheap Table/Index insertions, joined at a completion barrier —
    /// the same scoped-thread fan-out idiom the teacher uses for
    /// per-SSTable chunk construction, generalized from one stream to
    /// three independent ones.
    pub fn acquire(&self, write: &KernelWrite) -> Result<Receipt, SegmentError> {
        let table_cell = TableCell {
            record: write.record(),
            key: write.key().to_string(),
            value: write.value().clone(),
            action: write.action(),
            version: write.version(),
        };
        let index_cell = IndexCell {
            key: write.key().to_string(),
            value: write.value().clone(),
            record: write.record(),
            action: write.action(),
            version: write.version(),
        };

        let min_search = self.config.min_search_index_size;
        let max_search = self.config.max_search_substring_length;
        let stopwords = &self.config.stopwords;

        let (table_cell, index_cell, corpus_cells) = crossbeam::scope(|scope| {
            let table_handle = scope.spawn(|_| table_cell.clone());
            let index_handle = scope.spawn(|_| index_cell.clone());
            let corpus_handle =
                scope.spawn(|_| tokenize(write, min_search, max_search, stopwords));

            let table_cell = table_handle.join().map_err(|_| "table fan-out panicked".to_string());
            let index_cell = index_handle.join().map_err(|_| "index fan-out panicked".to_string());
            let corpus_cells = corpus_handle.join().map_err(|_| "corpus fan-out panicked".to_string());
            (table_cell, index_cell, corpus_cells)
        })
        .map_err(|_| SegmentError::FanOut("chunk fan-out thread panicked".into()))?;

        let table_cell = table_cell.map_err(SegmentError::FanOut)?;
        let index_cell = index_cell.map_err(SegmentError::FanOut)?;
        let corpus_cells = corpus_cells.map_err(SegmentError::FanOut)?;

        {
            let mut state = self.state.write().map_err(poison_err)?;
            state.min_ts = state.min_ts.min(write.version());
            state.max_ts = state.max_ts.max(write.version());
            state.count += 1;
            state
                .table
                .insert(write.record().to_le_bytes().to_vec(), table_cell.clone());
            state.index.insert(write.key().as_bytes().to_vec(), index_cell.clone());
            for cell in &corpus_cells {
                state.corpus.insert(cell.term.as_bytes().to_vec(), cell.clone());
            }
        }

        Ok(Receipt {
            table_cell,
            index_cell,
            corpus_cells,
        })
    }

    pub fn len(&self) -> Result<u64, SegmentError> {
        Ok(self.state.read().map_err(poison_err)?.count)
    }

    pub fn is_empty(&self) -> Result<bool, SegmentError> {
        Ok(self.len()? == 0)
    }

    /// Not-yet-synced table cells for `record` — the mutable
    /// segment's equivalent of `Segment::table_cells_for_record`.
    pub fn table_cells_for_record(&self, record: u64) -> Result<Vec<TableCell>, SegmentError> {
        Ok(self.state.read().map_err(poison_err)?.table.get(&record.to_le_bytes()))
    }

    /// Not-yet-synced index cells for `key`.
    pub fn index_cells_for_key(&self, key: &str) -> Result<Vec<IndexCell>, SegmentError> {
        Ok(self.state.read().map_err(poison_err)?.index.get(key.as_bytes()))
    }

    /// Not-yet-synced corpus cells for exact substring `term`.
    pub fn corpus_cells_for_term(&self, term: &str) -> Result<Vec<CorpusCell>, SegmentError> {
        Ok(self.state.read().map_err(poison_err)?.corpus.get(term.as_bytes()))
    }

    /// Writes this segment's layout (§6, bit-exact) to `path`: a
    /// temp-file-then-fsync-then-rename sequence identical to
    /// `src/sstable/builder.rs`'s `SstWriter`. Dispatches between a
    /// memory-mapped write and streaming `BufWriter` write based on
    /// `mmap_write_upper_limit`.
    pub fn sync(&self, path: impl AsRef<Path>) -> Result<(), SegmentError> {
        let path = path.as_ref();
        let mut state = self.state.write().map_err(poison_err)?;
        if state.count == 0 {
            state.min_ts = 0;
            state.max_ts = 0;
        }

        state.index.sort_groups_by(|a, b| a.value.cmp(&b.value).then(a.record.cmp(&b.record)));
        state
            .corpus
            .sort_groups_by(|a, b| a.position.record.cmp(&b.position.record).then(a.position.term_index.cmp(&b.position.term_index)));

        let expected = self.config.expected_insertions.max(1);
        let mut table_bloom = Bloom::new_for_fp_rate(expected, CHUNK_BLOOM_FALSE_POSITIVE_RATE)
            .map_err(|e| SegmentError::Internal(e.to_string()))?;
        let mut index_bloom = Bloom::new_for_fp_rate(expected, CHUNK_BLOOM_FALSE_POSITIVE_RATE)
            .map_err(|e| SegmentError::Internal(e.to_string()))?;
        let mut corpus_bloom = Bloom::new_for_fp_rate(expected, CHUNK_BLOOM_FALSE_POSITIVE_RATE)
            .map_err(|e| SegmentError::Internal(e.to_string()))?;

        let table_groups = std::mem::take(&mut state.table).into_groups();
        let index_groups = std::mem::take(&mut state.index).into_groups();
        let corpus_groups = std::mem::take(&mut state.corpus).into_groups();

        let (table_bytes, table_manifest) = encode_chunk(table_groups, &mut table_bloom)?;
        let (index_bytes, index_manifest) = encode_chunk(index_groups, &mut index_bloom)?;
        let (corpus_bytes, corpus_manifest) = encode_chunk(corpus_groups, &mut corpus_bloom)?;

        let table_bloom_bytes = table_bloom.as_slice().to_vec();
        let index_bloom_bytes = index_bloom.as_slice().to_vec();
        let corpus_bloom_bytes = corpus_bloom.as_slice().to_vec();

        let table_manifest_bytes = crate::encoding::encode_to_vec(&table_manifest)?;
        let index_manifest_bytes = crate::encoding::encode_to_vec(&index_manifest)?;
        let corpus_manifest_bytes = crate::encoding::encode_to_vec(&corpus_manifest)?;

        let mut body = Vec::new();
        body.extend_from_slice(&table_bloom_bytes);
        body.extend_from_slice(&index_bloom_bytes);
        body.extend_from_slice(&corpus_bloom_bytes);
        body.extend_from_slice(&table_manifest_bytes);
        body.extend_from_slice(&index_manifest_bytes);
        body.extend_from_slice(&corpus_manifest_bytes);
        body.extend_from_slice(&table_bytes);
        body.extend_from_slice(&index_bytes);
        body.extend_from_slice(&corpus_bytes);

        let sync_ts = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0)
            .max(state.max_ts);

        let mut header = Vec::with_capacity(HEADER_LEN);
        header.extend_from_slice(SEGMENT_SIGNATURE);
        header.push(SCHEMA_VERSION);
        header.extend_from_slice(&state.count.to_le_bytes());
        header.extend_from_slice(&state.min_ts.to_le_bytes());
        header.extend_from_slice(&state.max_ts.to_le_bytes());
        header.extend_from_slice(&sync_ts.to_le_bytes());
        for _ in 0..4 {
            header.extend_from_slice(&0u64.to_le_bytes());
        }
        for len in [
            table_bloom_bytes.len() as u64,
            index_bloom_bytes.len() as u64,
            corpus_bloom_bytes.len() as u64,
            table_manifest_bytes.len() as u64,
            index_manifest_bytes.len() as u64,
            corpus_manifest_bytes.len() as u64,
            table_bytes.len() as u64,
            index_bytes.len() as u64,
            corpus_bytes.len() as u64,
        ] {
            header.extend_from_slice(&len.to_le_bytes());
        }
        debug_assert_eq!(header.len(), HEADER_LEN);

        let total_len = header.len() as u64 + body.len() as u64;
        let tmp_path = path.with_extension("tmp");

        if total_len <= self.config.mmap_write_upper_limit {
            write_via_mmap(&tmp_path, &header, &body)?;
        } else {
            write_via_stream(&tmp_path, &header, &body)?;
        }

        fs::rename(&tmp_path, path)?;
        Ok(())
    }
}

fn write_via_stream(path: &Path, header: &[u8], body: &[u8]) -> Result<(), SegmentError> {
    let file = OpenOptions::new().create(true).write(true).truncate(true).open(path)?;
    let mut writer = std::io::BufWriter::new(&file);
    writer.write_all(header)?;
    writer.write_all(body)?;
    writer.flush()?;
    writer.get_ref().sync_all()?;
    Ok(())
}

fn write_via_mmap(path: &Path, header: &[u8], body: &[u8]) -> Result<(), SegmentError> {
    let total = header.len() + body.len();
    let file = OpenOptions::new().create(true).read(true).write(true).truncate(true).open(path)?;
    file.set_len(total as u64)?;
    let mut mmap = unsafe { memmap2::MmapMut::map_mut(&file)? };
    mmap[..header.len()].copy_from_slice(header);
    mmap[header.len()..].copy_from_slice(body);
    mmap.flush()?;
    drop(mmap);
    file.sync_all()?;
    Ok(())
}

/// Splits a string value on whitespace, drops stopwords, and emits
/// every substring of length `>= min_search_index_size` (capped at
/// `max_search_substring_length`) at each token position — the
/// corpus-indexing scheme that lets an infix query resolve to an exact
/// term lookup.
fn tokenize(
    write: &KernelWrite,
    min_search_index_size: usize,
    max_search_substring_length: usize,
    stopwords: &[String],
) -> Vec<CorpusCell> {
    let Value::String(text) = write.value() else {
        return Vec::new();
    };

    let mut cells = Vec::new();
    for (term_index, token) in text.split_whitespace().enumerate() {
        let lower = token.to_lowercase();
        if stopwords.iter().any(|s| s == &lower) {
            continue;
        }
        let chars: Vec<char> = token.chars().collect();
        let len = chars.len();
        if len < min_search_index_size {
            continue;
        }
        for start in 0..len {
            let max_end = (start + max_search_substring_length).min(len);
            for end in (start + min_search_index_size)..=max_end {
                let substring: String = chars[start..end].iter().collect();
                cells.push(CorpusCell {
                    term: substring,
                    field_key: write.key().to_string(),
                    position: Position {
                        record: write.record(),
                        term_index: term_index as u32,
                    },
                    action: write.action(),
                    version: write.version(),
                });
            }
        }
    }
    cells
}

fn poison_err<T>(_: std::sync::PoisonError<T>) -> SegmentError {
    SegmentError::Internal("segment builder lock poisoned".into())
}

// ------------------------------------------------------------------------------------------------
// Segment — the sealed, mmapped, read-only segment
// ------------------------------------------------------------------------------------------------

struct SectionLayout {
    table_bloom: (usize, usize),
    index_bloom: (usize, usize),
    corpus_bloom: (usize, usize),
    table_manifest: (usize, usize),
    index_manifest: (usize, usize),
    corpus_manifest: (usize, usize),
    table: (usize, usize),
    index: (usize, usize),
    corpus: (usize, usize),
}

/// An immutable, sealed, memory-mapped segment.
pub struct Segment {
    path: PathBuf,
    mmap: Mmap,
    count: u64,
    min_ts: u64,
    max_ts: u64,
    sync_ts: u64,
    layout: SectionLayout,
    table_manifest: Manifest,
    index_manifest: Manifest,
    corpus_manifest: Manifest,
}

impl Segment {
    /// Opens a sealed segment file, validating its signature, schema
    /// version, and declared section lengths before mapping it. Per
    /// the invariant that partial segments are never visible, any
    /// validation failure is fatal to this call and the caller is
    /// expected to quarantine the file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SegmentError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let mmap = unsafe { Mmap::map(&file)? };

        if mmap.len() < HEADER_LEN {
            return Err(SegmentError::Truncated {
                needed: HEADER_LEN,
                available: mmap.len(),
            });
        }
        if &mmap[0..13] != SEGMENT_SIGNATURE {
            return Err(SegmentError::BadSignature);
        }
        let schema_version = mmap[13];
        if schema_version != SCHEMA_VERSION {
            return Err(SegmentError::UnsupportedSchema(schema_version));
        }

        let mut cursor = 14;
        let count = read_u64(&mmap, &mut cursor);
        let min_ts = read_u64(&mmap, &mut cursor);
        let max_ts = read_u64(&mmap, &mut cursor);
        let sync_ts = read_u64(&mmap, &mut cursor);
        cursor += 8 * 4; // reserved

        let mut lens = [0u64; 9];
        for len in lens.iter_mut() {
            *len = read_u64(&mmap, &mut cursor);
        }

        let mut offset = HEADER_LEN;
        let mut section = |len: u64| {
            let start = offset;
            let end = start + len as usize;
            offset = end;
            (start, end)
        };
        let table_bloom = section(lens[0]);
        let index_bloom = section(lens[1]);
        let corpus_bloom = section(lens[2]);
        let table_manifest_range = section(lens[3]);
        let index_manifest_range = section(lens[4]);
        let corpus_manifest_range = section(lens[5]);
        let table = section(lens[6]);
        let index = section(lens[7]);
        let corpus = section(lens[8]);

        if offset > mmap.len() {
            return Err(SegmentError::Truncated {
                needed: offset,
                available: mmap.len(),
            });
        }

        let (table_manifest, _) = crate::encoding::decode_from_slice::<Manifest>(
            &mmap[table_manifest_range.0..table_manifest_range.1],
        )?;
        let (index_manifest, _) = crate::encoding::decode_from_slice::<Manifest>(
            &mmap[index_manifest_range.0..index_manifest_range.1],
        )?;
        let (corpus_manifest, _) = crate::encoding::decode_from_slice::<Manifest>(
            &mmap[corpus_manifest_range.0..corpus_manifest_range.1],
        )?;

        Ok(Self {
            path,
            mmap,
            count,
            min_ts,
            max_ts,
            sync_ts,
            layout: SectionLayout {
                table_bloom,
                index_bloom,
                corpus_bloom,
                table_manifest: table_manifest_range,
                index_manifest: index_manifest_range,
                corpus_manifest: corpus_manifest_range,
                table,
                index,
                corpus,
            },
            table_manifest,
            index_manifest,
            corpus_manifest,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn min_ts(&self) -> u64 {
        self.min_ts
    }

    pub fn max_ts(&self) -> u64 {
        self.max_ts
    }

    pub fn sync_ts(&self) -> u64 {
        self.sync_ts
    }

    fn table_bloom(&self) -> Option<Bloom<Vec<u8>>> {
        let (s, e) = self.layout.table_bloom;
        Bloom::from_slice(&self.mmap[s..e]).ok()
    }

    fn index_bloom(&self) -> Option<Bloom<Vec<u8>>> {
        let (s, e) = self.layout.index_bloom;
        Bloom::from_slice(&self.mmap[s..e]).ok()
    }

    fn corpus_bloom(&self) -> Option<Bloom<Vec<u8>>> {
        let (s, e) = self.layout.corpus_bloom;
        Bloom::from_slice(&self.mmap[s..e]).ok()
    }

    /// `true` if the table chunk might hold `record` — a `false` here
    /// is a definite negative.
    pub fn may_contain_record(&self, record: u64) -> bool {
        match self.table_bloom() {
            Some(bloom) => bloom.check(&record.to_le_bytes().to_vec()),
            None => true,
        }
    }

    /// `true` if the index chunk might hold entries for `key`.
    pub fn may_contain_key(&self, key: &str) -> bool {
        match self.index_bloom() {
            Some(bloom) => bloom.check(&key.as_bytes().to_vec()),
            None => true,
        }
    }

    /// `true` if the corpus chunk might hold `term`.
    pub fn may_contain_term(&self, term: &str) -> bool {
        match self.corpus_bloom() {
            Some(bloom) => bloom.check(&term.as_bytes().to_vec()),
            None => true,
        }
    }

    /// All table cells for `record` (`browse(record)`).
    pub fn table_cells_for_record(&self, record: u64) -> Result<Vec<TableCell>, SegmentError> {
        if !self.may_contain_record(record) {
            return Ok(Vec::new());
        }
        let (s, e) = self.layout.table;
        let data = &self.mmap[s..e];
        match self.table_manifest.find(&record.to_le_bytes()) {
            Some((offset, length)) => Ok(decode_cells::<TableCell>(data, offset, length)?),
            None => Ok(Vec::new()),
        }
    }

    /// All index cells for `key` (`find(key, ...)`).
    pub fn index_cells_for_key(&self, key: &str) -> Result<Vec<IndexCell>, SegmentError> {
        if !self.may_contain_key(key) {
            return Ok(Vec::new());
        }
        let (s, e) = self.layout.index;
        let data = &self.mmap[s..e];
        match self.index_manifest.find(key.as_bytes()) {
            Some((offset, length)) => Ok(decode_cells::<IndexCell>(data, offset, length)?),
            None => Ok(Vec::new()),
        }
    }

    /// All corpus cells for exact substring `term` (`search(key, ...)`
    /// resolves a query to a set of exact term lookups).
    pub fn corpus_cells_for_term(&self, term: &str) -> Result<Vec<CorpusCell>, SegmentError> {
        if !self.may_contain_term(term) {
            return Ok(Vec::new());
        }
        let (s, e) = self.layout.corpus;
        let data = &self.mmap[s..e];
        match self.corpus_manifest.find(term.as_bytes()) {
            Some((offset, length)) => Ok(decode_cells::<CorpusCell>(data, offset, length)?),
            None => Ok(Vec::new()),
        }
    }

    /// Every table cell this segment holds, across all locators — used
    /// by the segment-merge optimizer to replay a segment's full
    /// content into a fresh builder.
    pub fn all_table_cells(&self) -> Result<Vec<TableCell>, SegmentError> {
        let (s, e) = self.layout.table;
        let data = &self.mmap[s..e];
        let mut cells = Vec::new();
        for entry in self.table_manifest.entries() {
            cells.extend(decode_cells::<TableCell>(data, entry.offset, entry.length)?);
        }
        Ok(cells)
    }

    /// Every index cell this segment holds, across all locators.
    pub fn all_index_cells(&self) -> Result<Vec<IndexCell>, SegmentError> {
        let (s, e) = self.layout.index;
        let data = &self.mmap[s..e];
        let mut cells = Vec::new();
        for entry in self.index_manifest.entries() {
            cells.extend(decode_cells::<IndexCell>(data, entry.offset, entry.length)?);
        }
        Ok(cells)
    }

    /// Every corpus cell this segment holds, across all locators.
    pub fn all_corpus_cells(&self) -> Result<Vec<CorpusCell>, SegmentError> {
        let (s, e) = self.layout.corpus;
        let data = &self.mmap[s..e];
        let mut cells = Vec::new();
        for entry in self.corpus_manifest.entries() {
            cells.extend(decode_cells::<CorpusCell>(data, entry.offset, entry.length)?);
        }
        Ok(cells)
    }

    /// `true` if this segment's time range overlaps `other`'s AND
    /// their write content could overlap, approximated by checking
    /// whether either segment's table bloom filter may contain any
    /// record the other segment declares. Used to detect duplicate
    /// segments surviving a crash during recovery.
    pub fn intersects(&self, other: &Segment) -> bool {
        let time_overlap = self.min_ts <= other.max_ts && other.min_ts <= self.max_ts;
        if !time_overlap {
            return false;
        }
        let content_overlap = match other.all_table_cells() {
            Ok(cells) => cells.iter().any(|cell| self.may_contain_record(cell.record)),
            Err(_) => false,
        };
        if content_overlap {
            return true;
        }
        match self.all_table_cells() {
            Ok(cells) => cells.iter().any(|cell| other.may_contain_record(cell.record)),
            Err(_) => false,
        }
    }

    /// Estimated similarity in `[0, 1]`: the larger of the Table and
    /// Index chunk bloom filters' Jaccard-like overlap estimate,
    /// computed as the fraction of set bits shared between the two
    /// filters (a cheap proxy when the underlying crate exposes no
    /// direct intersection count). Used by the size-tiered segment
    /// optimizer to decide whether two segments are worth merging.
    pub fn similarity(&self, other: &Segment) -> f64 {
        let table_sim = bloom_bit_similarity(
            &self.mmap[self.layout.table_bloom.0..self.layout.table_bloom.1],
            &other.mmap[other.layout.table_bloom.0..other.layout.table_bloom.1],
        );
        let index_sim = bloom_bit_similarity(
            &self.mmap[self.layout.index_bloom.0..self.layout.index_bloom.1],
            &other.mmap[other.layout.index_bloom.0..other.layout.index_bloom.1],
        );
        table_sim.max(index_sim)
    }
}

fn bloom_bit_similarity(a: &[u8], b: &[u8]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut intersection = 0u32;
    let mut union = 0u32;
    for (x, y) in a.iter().zip(b.iter()) {
        intersection += (x & y).count_ones();
        union += (x | y).count_ones();
    }
    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}

fn read_u64(mmap: &Mmap, cursor: &mut usize) -> u64 {
    let bytes: [u8; 8] = mmap[*cursor..*cursor + 8].try_into().expect("checked length");
    *cursor += 8;
    u64::from_le_bytes(bytes)
}

/// Total order over segments used by `Database`'s segment list:
/// segments whose ranges are disjoint sort by range; overlapping
/// segments (possible after an out-of-order recovery or merge) fall
/// back to `syncTs`; a still-mutable segment (no `sync_ts` recorded
/// yet, represented by the caller as `None`) always sorts last.
pub fn temporal_cmp(a: &Segment, b: &Segment) -> std::cmp::Ordering {
    if a.max_ts < b.min_ts {
        std::cmp::Ordering::Less
    } else if b.max_ts < a.min_ts {
        std::cmp::Ordering::Greater
    } else {
        a.sync_ts.cmp(&b.sync_ts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(key: &str, value: Value, record: u64, version: u64) -> KernelWrite {
        KernelWrite::new(Action::Add, key, value, record, version)
    }

    #[test]
    fn acquire_fans_out_to_all_three_chunks() {
        let builder = SegmentBuilder::new(SegmentConfig::default());
        let w = write("bio", Value::String("the quick fox".into()), 7, 1);
        let receipt = builder.acquire(&w).unwrap();
        assert_eq!(receipt.table_cell.record, 7);
        assert_eq!(receipt.index_cell.key, "bio");
        assert!(!receipt.corpus_cells.is_empty());
        assert_eq!(builder.len().unwrap(), 1);
    }

    #[test]
    fn corpus_tokenizer_drops_stopwords_and_short_tokens() {
        let config = SegmentConfig::default();
        let w = write("bio", Value::String("the fox".into()), 1, 1);
        let cells = tokenize(&w, config.min_search_index_size, config.max_search_substring_length, &config.stopwords);
        assert!(cells.iter().all(|c| c.term.len() >= config.min_search_index_size));
        assert!(cells.iter().all(|c| !c.term.eq_ignore_ascii_case("the")));
    }

    #[test]
    fn sync_then_open_round_trips_table_lookup() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("segment-0.seg");

        let builder = SegmentBuilder::new(SegmentConfig::default());
        builder.acquire(&write("name", Value::String("Alice".into()), 1, 10)).unwrap();
        builder.acquire(&write("age", Value::Integer(30), 1, 11)).unwrap();
        builder.acquire(&write("age", Value::Integer(25), 2, 12)).unwrap();
        builder.sync(&path).unwrap();

        let segment = Segment::open(&path).unwrap();
        assert_eq!(segment.count(), 3);
        assert_eq!(segment.min_ts(), 10);
        assert_eq!(segment.max_ts(), 12);

        let cells = segment.table_cells_for_record(1).unwrap();
        assert_eq!(cells.len(), 2);

        let index_cells = segment.index_cells_for_key("age").unwrap();
        assert_eq!(index_cells.len(), 2);
        assert!(index_cells[0].value <= index_cells[1].value);

        assert!(!segment.may_contain_record(999));
    }

    #[test]
    fn search_resolves_infix_term_to_record() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("segment-0.seg");
        let builder = SegmentBuilder::new(SegmentConfig::default());
        builder
            .acquire(&write("bio", Value::String("the quick brown fox".into()), 7, 1))
            .unwrap();
        builder.sync(&path).unwrap();

        let segment = Segment::open(&path).unwrap();
        let hits = segment.corpus_cells_for_term("quic").unwrap();
        assert!(hits.iter().any(|c| c.position.record == 7));
        assert!(segment.corpus_cells_for_term("the").unwrap().is_empty());
    }

    #[test]
    fn rejects_bad_signature() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("not-a-segment.seg");
        fs::write(&path, b"not a real segment file at all..........").unwrap();
        let err = Segment::open(&path).unwrap_err();
        assert!(matches!(err, SegmentError::BadSignature));
    }
}
