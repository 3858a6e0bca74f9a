//! Lock tokens — opaque, content-addressed scopes for
//! [`crate::lock::LockService`] and [`crate::lock::RangeLockService`].
//!
//! A [`Token`] identifies the abstract scope an atomic operation's read
//! or write touches: `(record)`, `(key, record)`, or `(key)`. Two tokens
//! built from equal constituent bytes compare equal and hash equal, so
//! two callers presenting the same logical scope share the same lock
//! instance inside the service.

use std::hash::{Hash, Hasher};

use crate::value::Value;

/// An opaque identifier over the bytes of the objects it protects.
///
/// Equality and hashing are purely by content bytes — constructing a
/// `Token` from the same inputs twice always yields an equal token.
#[derive(Debug, Clone, Eq)]
pub struct Token {
    bytes: Vec<u8>,
}

impl Token {
    fn from_parts(parts: &[&[u8]]) -> Self {
        let mut bytes = Vec::new();
        for part in parts {
            bytes.extend_from_slice(&(part.len() as u32).to_le_bytes());
            bytes.extend_from_slice(part);
        }
        Token { bytes }
    }

    /// A token scoping an entire record.
    pub fn for_record(record: u64) -> Self {
        Self::from_parts(&[&record.to_le_bytes()])
    }

    /// A token scoping a single `(key, record)` pair.
    pub fn for_key_record(key: &str, record: u64) -> Self {
        Self::from_parts(&[key.as_bytes(), &record.to_le_bytes()])
    }

    /// A token scoping an entire key across all records (used for
    /// index-wide range reads).
    pub fn for_key(key: &str) -> Self {
        Self::from_parts(&[key.as_bytes()])
    }

    /// Raw bytes backing this token, used to produce a canonical lock
    /// acquisition order at commit time (sorted by these bytes).
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Reconstructs a token from bytes previously returned by
    /// [`Self::as_bytes`] — used when replaying a transaction backup's
    /// recorded lock entries, which carry only the raw bytes.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Token { bytes }
    }
}

impl PartialEq for Token {
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes
    }
}

impl Hash for Token {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.bytes.hash(state);
    }
}

impl PartialOrd for Token {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Token {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.bytes.cmp(&other.bytes)
    }
}

/// A query operator, shared between [`RangeToken`]'s range-blocking
/// rules and `Database::find`'s query evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Equals,
    NotEquals,
    GreaterThan,
    GreaterThanOrEquals,
    LessThan,
    LessThanOrEquals,
    /// Half-open `[low, high)`.
    Between,
    Regex,
    NotRegex,
    /// Normalized to `Equals` on a link-typed value before evaluation.
    LinksTo,
}

impl Operator {
    /// Evaluates `subject op values` for scalar (non-regex,
    /// non-between) operators. `Between`, `Regex`, and `NotRegex` are
    /// evaluated by their callers, which have the extra argument(s)
    /// those operators need.
    pub fn evaluate_scalar(self, subject: &Value, value: &Value) -> bool {
        match self {
            Operator::Equals | Operator::LinksTo => subject == value,
            Operator::NotEquals => subject != value,
            Operator::GreaterThan => subject > value,
            Operator::GreaterThanOrEquals => subject >= value,
            Operator::LessThan => subject < value,
            Operator::LessThanOrEquals => subject <= value,
            Operator::Between | Operator::Regex | Operator::NotRegex => false,
        }
    }
}

/// A range token: `(key, operator, values)`, used by
/// [`crate::lock::RangeLockService`] to detect conflicts between a
/// range read and a point write.
///
/// - A *write* range token always carries exactly one value and an
///   implicit `Equals` operator: `(key, value)`.
/// - A *read* range token carries the query operator and one or two
///   values (two only for `Between`).
#[derive(Debug, Clone)]
pub struct RangeToken {
    key: String,
    operator: Operator,
    values: Vec<Value>,
}

impl RangeToken {
    /// Builds a write range token `(key, value)` — implicitly `Equals`.
    pub fn for_write(key: impl Into<String>, value: Value) -> Self {
        Self {
            key: key.into(),
            operator: Operator::Equals,
            values: vec![value],
        }
    }

    /// Builds a read range token `(key, operator, values)`.
    pub fn for_read(key: impl Into<String>, operator: Operator, values: Vec<Value>) -> Self {
        Self {
            key: key.into(),
            operator,
            values,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn operator(&self) -> Operator {
        self.operator
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Returns `true` if `candidate` satisfies this token's
    /// `operator value(s)` predicate — the comparison semantics used
    /// both by query evaluation and by range-blocking.
    pub fn satisfied_by(&self, candidate: &Value) -> bool {
        match self.operator {
            Operator::Between => match (self.values.first(), self.values.get(1)) {
                (Some(low), Some(high)) => candidate >= low && candidate < high,
                _ => false,
            },
            Operator::Regex | Operator::NotRegex => false,
            _ => self
                .values
                .first()
                .is_some_and(|v| self.operator.evaluate_scalar(candidate, v)),
        }
    }

    /// Returns `true` if this is a single-value, implicit-`Equals`
    /// write token (as opposed to a multi-value read token).
    pub fn is_write(&self) -> bool {
        self.operator == Operator::Equals && self.values.len() == 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_inputs_produce_equal_tokens() {
        let a = Token::for_key_record("age", 7);
        let b = Token::for_key_record("age", 7);
        assert_eq!(a, b);

        let mut set = std::collections::HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }

    #[test]
    fn different_scopes_are_distinct() {
        assert_ne!(Token::for_record(1), Token::for_record(2));
        assert_ne!(Token::for_key("age"), Token::for_key_record("age", 1));
    }

    #[test]
    fn between_is_half_open() {
        let token = RangeToken::for_read(
            "age",
            Operator::Between,
            vec![Value::Integer(20), Value::Integer(40)],
        );
        assert!(token.satisfied_by(&Value::Integer(20)));
        assert!(token.satisfied_by(&Value::Integer(39)));
        assert!(!token.satisfied_by(&Value::Integer(40)));
    }

    #[test]
    fn write_token_is_equals_single_value() {
        let token = RangeToken::for_write("age", Value::Integer(7));
        assert!(token.is_write());
        assert!(token.satisfied_by(&Value::Integer(7)));
        assert!(!token.satisfied_by(&Value::Integer(8)));
    }
}
