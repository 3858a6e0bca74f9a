//! [`Write`] — the universal revision unit accepted by the Ledger.
//!
//! A `Write` is an immutable tuple `(action, key, value, record, version)`
//! plus a content fingerprint used for equality probing and segment
//! overlap detection. Its on-disk encoding is bit-exact (see module docs
//! below) and independent of the general-purpose [`crate::encoding`]
//! `Vec<T>`/`Option<T>` machinery used elsewhere in the crate.

use crc32fast::Hasher as Crc32;

use crate::encoding::{Decode, Encode, EncodingError};
use crate::value::Value;

/// The action a [`Write`] records against a `(record, key, value)` triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Adds one occurrence of the value.
    Add,
    /// Removes one occurrence of the value.
    Remove,
    /// A transient probe used by `verify`-style reads: asserts presence
    /// without mutating state.
    Compare,
    /// A transient probe with no durable representation; used only to
    /// carry a `(key, value, record)` triple into an equality check.
    /// Never written to a Ledger page or Segment.
    NotStorable,
}

impl Action {
    fn tag(self) -> u8 {
        match self {
            Action::Add => 0,
            Action::Remove => 1,
            Action::Compare => 2,
            Action::NotStorable => 3,
        }
    }

    fn from_tag(tag: u8) -> Result<Self, EncodingError> {
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
}

/// One revision: an action taken against `(record, key, value)` at a
/// given version.
///
/// `version` is meaningless for [`Action::NotStorable`] probes (the spec
/// calls out that these "exist only transiently as lookup probes (no
/// version)"); callers constructing a probe via [`Write::probe`] should
/// not inspect it.
#[derive(Debug, Clone)]
pub struct Write {
    action: Action,
    key: String,
    value: Value,
    record: u64,
    version: u64,
    /// Stable content fingerprint over `(key, value, record)` — excludes
    /// `action` and `version` so that an ADD and a REMOVE of the same
    /// triple fingerprint identically, matching `Ledger::verify`'s
    /// equality semantics. Not part of the on-disk wire format; it is a
    /// derived, in-memory convenience used for bloom-filter probing and
    /// segment `intersects()` checks.
    content_hash: u32,
}

impl Write {
    /// Constructs a durable `Write` accepted by the Ledger at `version`.
    pub fn new(action: Action, key: impl Into<String>, value: Value, record: u64, version: u64) -> Self {
        let key = key.into();
        let content_hash = Self::fingerprint(&key, &value, record);
        Self {
            action,
            key,
            value,
            record,
            version,
            content_hash,
        }
    }

    /// Constructs a transient, unversioned probe for equality checks
    /// (`Ledger::verify`, `Database::verify`). Never inserted into a
    /// Ledger or Segment.
    pub fn probe(key: impl Into<String>, value: Value, record: u64) -> Self {
        Self::new(Action::NotStorable, key, value, record, 0)
    }

    fn fingerprint(key: &str, value: &Value, record: u64) -> u32 {
        let mut hasher = Crc32::new();
        hasher.update(key.as_bytes());
        hasher.update(&record.to_le_bytes());
        let mut value_bytes = Vec::new();
        // Fingerprinting never fails: `Value::encode_to` is infallible in
        // practice (no variable-length field in `Value` can overflow a
        // u32 from realistic inputs), but propagate defensively by
        // falling back to the tag byte alone on the (unreachable) error
        // path rather than panicking.
        if value.encode_to(&mut value_bytes).is_err() {
            value_bytes = vec![value.tag()];
        }
        hasher.update(&value_bytes);
        hasher.finalize()
    }

    /// Returns `true` if `self` and `other` describe the same
    /// `(key, value, record)` triple, ignoring `action` and `version` —
    /// the equality used by [`crate::ledger::Ledger::verify`].
    pub fn matches(&self, other: &Write) -> bool {
        self.content_hash == other.content_hash
            && self.record == other.record
            && self.key == other.key
            && self.value == other.value
    }

    /// The action this revision records.
    pub fn action(&self) -> Action {
        self.action
    }

    /// The key (field name) this revision applies to.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The value this revision carries.
    pub fn value(&self) -> &Value {
        &self.value
    }

    /// The record this revision applies to.
    pub fn record(&self) -> u64 {
        self.record
    }

    /// The version (monotonic ledger-acceptance timestamp) of this
    /// revision. Meaningless for `NotStorable` probes.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// The content fingerprint over `(key, value, record)`.
    pub fn content_hash(&self) -> u32 {
        self.content_hash
    }

    /// Re-stamps this write with a new version, as assigned at Ledger
    /// acceptance. Used by `Ledger::insert` once a slot has been chosen.
    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    /// The bit-exact encoded size of this write: `13 + |key| + |record|
    /// + |value|` (`record` is always 8 bytes).
    pub fn encoded_len(&self) -> usize {
        13 + self.key.len() + 8 + self.encoded_value_len()
    }

    fn encoded_value_len(&self) -> usize {
        let mut buf = Vec::new();
        // Infallible in practice; see `fingerprint` above for the same
        // reasoning.
        let _ = self.value.encode_to(&mut buf);
        buf.len()
    }
}

impl PartialEq for Write {
    fn eq(&self, other: &Self) -> bool {
        self.matches(other) && self.action == other.action && self.version == other.version
    }
}

// ------------------------------------------------------------------------------------------------
// Bit-exact external encoding: [4-byte keySize][1-byte type][8-byte version][recordId][key][value]
// ------------------------------------------------------------------------------------------------

impl Encode for Write {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        let key_size = u32::try_from(self.key.len())
            .map_err(|_| EncodingError::LengthOverflow(format!("key length {} exceeds u32::MAX", self.key.len())))?;
        key_size.encode_to(buf)?;
        self.action.tag().encode_to(buf)?;
        self.version.encode_to(buf)?;
        self.record.encode_to(buf)?;
        buf.extend_from_slice(self.key.as_bytes());
        self.value.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for Write {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (key_size, mut offset) = u32::decode_from(buf)?;
        if key_size > crate::encoding::MAX_BYTE_LEN {
            return Err(EncodingError::LengthOverflow(format!(
                "write key length {key_size} exceeds MAX_BYTE_LEN"
            )));
        }
        let (type_tag, n) = u8::decode_from(&buf[offset..])?;
        offset += n;
        let action = Action::from_tag(type_tag)?;

        let (version, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (record, n) = u64::decode_from(&buf[offset..])?;
        offset += n;

        let key_size = key_size as usize;
        if buf.len() < offset + key_size {
            return Err(EncodingError::UnexpectedEof {
                needed: offset + key_size,
                available: buf.len(),
            });
        }
        let key = String::from_utf8(buf[offset..offset + key_size].to_vec())?;
        offset += key_size;

        let (value, n) = Value::decode_from(&buf[offset..])?;
        offset += n;

        Ok((Write::new(action, key, value, record, version), offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_bit_exact_encoding() {
        let write = Write::new(Action::Add, "name", Value::String("Alice".into()), 1, 42);
        let bytes = crate::encoding::encode_to_vec(&write).unwrap();
        assert_eq!(bytes.len(), write.encoded_len());

        let (decoded, consumed) = crate::encoding::decode_from_slice::<Write>(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(decoded.action(), Action::Add);
        assert_eq!(decoded.key(), "name");
        assert_eq!(decoded.value(), &Value::String("Alice".into()));
        assert_eq!(decoded.record(), 1);
        assert_eq!(decoded.version(), 42);
    }

    #[test]
    fn matches_ignores_action_and_version() {
        let add = Write::new(Action::Add, "age", Value::Integer(30), 7, 1);
        let remove = Write::new(Action::Remove, "age", Value::Integer(30), 7, 99);
        assert!(add.matches(&remove));
        assert_ne!(add, remove);
    }

    #[test]
    fn matches_is_type_and_record_sensitive() {
        let a = Write::new(Action::Add, "age", Value::Integer(30), 7, 1);
        let b = Write::new(Action::Add, "age", Value::Long(30), 7, 1);
        let c = Write::new(Action::Add, "age", Value::Integer(30), 8, 1);
        assert!(!a.matches(&b));
        assert!(!a.matches(&c));
    }

    #[test]
    fn probe_has_no_durable_version() {
        let probe = Write::probe("age", Value::Integer(30), 7);
        assert_eq!(probe.action(), Action::NotStorable);
        assert_eq!(probe.version(), 0);
    }
}
