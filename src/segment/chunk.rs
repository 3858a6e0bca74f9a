//! The three typed chunk cells and the generic chunk builder/reader
//! they share.
//!
//! A chunk groups its cells by *locator*: the field that callers seek
//! on (a record id for the Table chunk, a key name for the Index
//! chunk, a search term for the Corpus chunk). Cells sharing a locator
//! are written contiguously and addressed by an offset [`Manifest`]
//! entry, mirroring the block-index-over-a-sorted-key-space idiom of
//! `src/sstable/mod.rs`'s data-block index, generalized from one key
//! space to three.

use std::collections::BTreeMap;

use crate::encoding::{Decode, Encode, EncodingError};
use crate::value::Value;
use crate::write::Action;

fn action_tag(action: Action) -> u8 {
    match action {
        Action::Add => 0,
        Action::Remove => 1,
        Action::Compare => 2,
        Action::NotStorable => 3,
    }
}

fn action_from_tag(tag: u8) -> Result<Action, EncodingError> {
    match tag {
        0 => Ok(Action::Add),
        1 => Ok(Action::Remove),
        2 => Ok(Action::Compare),
        3 => Ok(Action::NotStorable),
        other => Err(EncodingError::InvalidTag {
            tag: other as u32,
            type_name: "Action",
        }),
    }
}

/// A Table chunk cell: `record` is the locator, `(key, value)` the
/// payload. Supports lookup by record and by `(record, key)`.
#[derive(Debug, Clone, PartialEq)]
pub struct TableCell {
    pub record: u64,
    pub key: String,
    pub value: Value,
    pub action: Action,
    pub version: u64,
}

impl Encode for TableCell {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.record.encode_to(buf)?;
        self.key.encode_to(buf)?;
        self.value.encode_to(buf)?;
        action_tag(self.action).encode_to(buf)?;
        self.version.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for TableCell {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (record, mut offset) = u64::decode_from(buf)?;
        let (key, n) = String::decode_from(&buf[offset..])?;
        offset += n;
        let (value, n) = Value::decode_from(&buf[offset..])?;
        offset += n;
        let (tag, n) = u8::decode_from(&buf[offset..])?;
        offset += n;
        let (version, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        Ok((
            TableCell {
                record,
                key,
                value,
                action: action_from_tag(tag)?,
                version,
            },
            offset,
        ))
    }
}

/// An Index chunk cell: `key` (field name) is the locator, `value` and
/// `record` the payload. Within one locator's group, cells are kept
/// sorted by `(value, record)` so a range query can binary-search or
/// linear-seek to its lower bound without scanning the whole group.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexCell {
    pub key: String,
    pub value: Value,
    pub record: u64,
    pub action: Action,
    pub version: u64,
}

impl Encode for IndexCell {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.key.encode_to(buf)?;
        self.value.encode_to(buf)?;
        self.record.encode_to(buf)?;
        action_tag(self.action).encode_to(buf)?;
        self.version.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for IndexCell {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (key, mut offset) = String::decode_from(buf)?;
        let (value, n) = Value::decode_from(&buf[offset..])?;
        offset += n;
        let (record, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (tag, n) = u8::decode_from(&buf[offset..])?;
        offset += n;
        let (version, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        Ok((
            IndexCell {
                key,
                value,
                record,
                action: action_from_tag(tag)?,
                version,
            },
            offset,
        ))
    }
}

/// One occurrence of a search term inside a field's tokenized text:
/// the record and the 0-based index of the token it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position {
    pub record: u64,
    pub term_index: u32,
}

/// A Corpus chunk cell: `term` (a substring of a tokenized field
/// value) is the locator, `field_key` and `position` the payload.
#[derive(Debug, Clone, PartialEq)]
pub struct CorpusCell {
    pub term: String,
    pub field_key: String,
    pub position: Position,
    pub action: Action,
    pub version: u64,
}

impl Encode for CorpusCell {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.term.encode_to(buf)?;
        self.field_key.encode_to(buf)?;
        self.position.record.encode_to(buf)?;
        self.position.term_index.encode_to(buf)?;
        action_tag(self.action).encode_to(buf)?;
        self.version.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for CorpusCell {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (term, mut offset) = String::decode_from(buf)?;
        let (field_key, n) = String::decode_from(&buf[offset..])?;
        offset += n;
        let (record, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (term_index, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        let (tag, n) = u8::decode_from(&buf[offset..])?;
        offset += n;
        let (version, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        Ok((
            CorpusCell {
                term,
                field_key,
                position: Position { record, term_index },
                action: action_from_tag(tag)?,
                version,
            },
            offset,
        ))
    }
}

// ------------------------------------------------------------------------------------------------
// Manifest — locator -> byte range, shared shape across all three chunks
// ------------------------------------------------------------------------------------------------

/// One `locator -> byte range` entry, in the order chunk bytes were
/// written (locator-sorted, since the builder groups by a `BTreeMap`).
#[derive(Debug, Clone, PartialEq)]
pub struct ManifestEntry {
    pub locator: Vec<u8>,
    pub offset: u64,
    pub length: u64,
}

impl Encode for ManifestEntry {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.locator.encode_to(buf)?;
        self.offset.encode_to(buf)?;
        self.length.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for ManifestEntry {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (locator, mut offset) = Vec::<u8>::decode_from(buf)?;
        let (off, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (length, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        Ok((ManifestEntry { locator, offset: off, length }, offset))
    }
}

/// A chunk's locator index: sorted by locator bytes, searched with
/// `binary_search_by`.
#[derive(Debug, Clone, Default)]
pub struct Manifest {
    entries: Vec<ManifestEntry>,
}

impl Manifest {
    pub fn new(entries: Vec<ManifestEntry>) -> Self {
        Self { entries }
    }

    /// Returns the byte range for `locator`, if present.
    pub fn find(&self, locator: &[u8]) -> Option<(u64, u64)> {
        self.entries
            .binary_search_by(|e| e.locator.as_slice().cmp(locator))
            .ok()
            .map(|i| (self.entries[i].offset, self.entries[i].length))
    }

    /// Returns every entry whose locator falls in `[low, high)` — used
    /// by range-chunk scans (the Index chunk locator is the field key,
    /// so this is only ever a single-entry lookup there; exposed
    /// generically for completeness).
    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }
}

impl Encode for Manifest {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        crate::encoding::encode_vec(&self.entries, buf)
    }
}

impl Decode for Manifest {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (entries, n) = crate::encoding::decode_vec::<ManifestEntry>(buf)?;
        Ok((Manifest { entries }, n))
    }
}

// ------------------------------------------------------------------------------------------------
// ChunkBuilder — groups cells by locator, used by all three chunk kinds
// ------------------------------------------------------------------------------------------------

/// Accumulates cells grouped by locator bytes while a segment is
/// mutable. `BTreeMap` gives deterministic, locator-sorted iteration
/// at sync time for free, producing the sorted manifest the reader
/// binary-searches.
pub struct ChunkBuilder<C> {
    groups: BTreeMap<Vec<u8>, Vec<C>>,
    len: usize,
}

impl<C> Default for ChunkBuilder<C> {
    fn default() -> Self {
        Self {
            groups: BTreeMap::new(),
            len: 0,
        }
    }
}

impl<C> ChunkBuilder<C> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, locator: Vec<u8>, cell: C) {
        self.groups.entry(locator).or_default().push(cell);
        self.len += 1;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Sorts each locator's group in place with `cmp` — used by the
    /// Index chunk to keep `(value, record)` order inside a key's
    /// group so range queries can seek without a full scan.
    pub fn sort_groups_by(&mut self, mut cmp: impl FnMut(&C, &C) -> std::cmp::Ordering) {
        for group in self.groups.values_mut() {
            group.sort_by(|a, b| cmp(a, b));
        }
    }

    /// Consumes the builder, returning its groups in locator-sorted
    /// order.
    pub fn into_groups(self) -> Vec<(Vec<u8>, Vec<C>)> {
        self.groups.into_iter().collect()
    }
}

impl<C: Clone> ChunkBuilder<C> {
    /// Returns a copy of the group at `locator`, if any — used to
    /// read a mutable segment's not-yet-synced cells (which have no
    /// manifest or bloom filter to consult yet).
    pub fn get(&self, locator: &[u8]) -> Vec<C> {
        self.groups.get(locator).cloned().unwrap_or_default()
    }
}

/// Serializes `groups` (locator-sorted) into a contiguous cell stream,
/// a [`Manifest`], and a bloom filter over the locator bytes.
pub fn encode_chunk<C: Encode>(
    groups: Vec<(Vec<u8>, Vec<C>)>,
    bloom: &mut bloomfilter::Bloom<Vec<u8>>,
) -> Result<(Vec<u8>, Manifest), EncodingError> {
    let mut data = Vec::new();
    let mut entries = Vec::with_capacity(groups.len());
    for (locator, cells) in groups {
        let start = data.len() as u64;
        for cell in &cells {
            cell.encode_to(&mut data)?;
        }
        let length = data.len() as u64 - start;
        bloom.set(&locator);
        entries.push(ManifestEntry {
            locator,
            offset: start,
            length,
        });
    }
    Ok((data, Manifest::new(entries)))
}

/// Decodes every cell in `data[offset..offset+length]` as a stream of
/// `C` values.
pub fn decode_cells<C: Decode>(data: &[u8], offset: u64, length: u64) -> Result<Vec<C>, EncodingError> {
    let start = offset as usize;
    let end = start + length as usize;
    if end > data.len() {
        return Err(EncodingError::UnexpectedEof {
            needed: end,
            available: data.len(),
        });
    }
    let mut slice = &data[start..end];
    let mut cells = Vec::new();
    while !slice.is_empty() {
        let (cell, consumed) = C::decode_from(slice)?;
        cells.push(cell);
        slice = &slice[consumed..];
    }
    Ok(cells)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_cell_round_trips() {
        let cell = TableCell {
            record: 7,
            key: "name".into(),
            value: Value::String("Alice".into()),
            action: Action::Add,
            version: 3,
        };
        let mut buf = Vec::new();
        cell.encode_to(&mut buf).unwrap();
        let (decoded, consumed) = TableCell::decode_from(&buf).unwrap();
        assert_eq!(consumed, buf.len());
        assert_eq!(decoded, cell);
    }

    #[test]
    fn chunk_builder_groups_and_sorts_by_locator() {
        let mut builder = ChunkBuilder::<TableCell>::new();
        builder.insert(
            7u64.to_le_bytes().to_vec(),
            TableCell {
                record: 7,
                key: "name".into(),
                value: Value::String("Alice".into()),
                action: Action::Add,
                version: 1,
            },
        );
        builder.insert(
            3u64.to_le_bytes().to_vec(),
            TableCell {
                record: 3,
                key: "age".into(),
                value: Value::Integer(30),
                action: Action::Add,
                version: 2,
            },
        );
        let groups = builder.into_groups();
        assert_eq!(groups.len(), 2);
        // BTreeMap orders by raw locator bytes, so record 3 (smaller
        // little-endian encoding) sorts before record 7.
        assert_eq!(groups[0].0, 3u64.to_le_bytes().to_vec());
    }

    #[test]
    fn manifest_finds_locator_by_binary_search() {
        let mut bloom = bloomfilter::Bloom::new_for_fp_rate(10, 0.01).unwrap();
        let mut builder = ChunkBuilder::<IndexCell>::new();
        builder.insert(
            b"age".to_vec(),
            IndexCell {
                key: "age".into(),
                value: Value::Integer(30),
                record: 1,
                action: Action::Add,
                version: 1,
            },
        );
        let (data, manifest) = encode_chunk(builder.into_groups(), &mut bloom).unwrap();
        let (offset, length) = manifest.find(b"age").unwrap();
        let cells: Vec<IndexCell> = decode_cells(&data, offset, length).unwrap();
        assert_eq!(cells.len(), 1);
        assert_eq!(cells[0].record, 1);
        assert!(manifest.find(b"missing").is_none());
    }
}
