//! Typed primitive values stored under a `(record, key)` pair.
//!
//! A [`Value`] carries its type tag alongside its bytes so that ordering
//! and equality are always type-sensitive: a `Long(3)` and a
//! `Double(3.0)` are distinct values even though their natural numeric
//! reading coincides.

use std::cmp::Ordering;

use crate::encoding::{Decode, Encode, EncodingError};

/// A typed, orderable scalar.
///
/// Ordering is type-then-natural-value: values first compare by their
/// type tag (in declaration order below), and only values of the same
/// type compare by their inner value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// A boolean scalar.
    Boolean(bool),
    /// A 32-bit signed integer.
    Integer(i32),
    /// A 64-bit signed integer.
    Long(i64),
    /// A 32-bit IEEE-754 float.
    Float(f32),
    /// A 64-bit IEEE-754 float.
    Double(f64),
    /// A UTF-8 string.
    String(String),
    /// A link to another record, by its 64-bit id.
    Link(u64),
}

/// Type tag ordinals. Values of different types order by this ordinal
/// first; the ordinal also doubles as the wire-format discriminant.
const TAG_BOOLEAN: u8 = 0;
const TAG_INTEGER: u8 = 1;
const TAG_LONG: u8 = 2;
const TAG_FLOAT: u8 = 3;
const TAG_DOUBLE: u8 = 4;
const TAG_STRING: u8 = 5;
const TAG_LINK: u8 = 6;

impl Value {
    /// Returns this value's type tag.
    pub fn tag(&self) -> u8 {
        match self {
            Value::Boolean(_) => TAG_BOOLEAN,
            Value::Integer(_) => TAG_INTEGER,
            Value::Long(_) => TAG_LONG,
            Value::Float(_) => TAG_FLOAT,
            Value::Double(_) => TAG_DOUBLE,
            Value::String(_) => TAG_STRING,
            Value::Link(_) => TAG_LINK,
        }
    }

    /// Returns `true` if this is a [`Value::Link`].
    pub fn is_link(&self) -> bool {
        matches!(self, Value::Link(_))
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Boolean(a), Value::Boolean(b)) => a.cmp(b),
            (Value::Integer(a), Value::Integer(b)) => a.cmp(b),
            (Value::Long(a), Value::Long(b)) => a.cmp(b),
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
            (Value::Double(a), Value::Double(b)) => a.total_cmp(b),
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Link(a), Value::Link(b)) => a.cmp(b),
            _ => self.tag().cmp(&other.tag()),
        }
    }
}

impl Encode for Value {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.tag().encode_to(buf)?;
        match self {
            Value::Boolean(v) => v.encode_to(buf)?,
            Value::Integer(v) => v.to_le_bytes().encode_to(buf)?,
            Value::Long(v) => v.encode_to(buf)?,
            Value::Float(v) => v.to_le_bytes().encode_to(buf)?,
            Value::Double(v) => v.to_le_bytes().encode_to(buf)?,
            Value::String(v) => v.encode_to(buf)?,
            Value::Link(v) => v.encode_to(buf)?,
        }
        Ok(())
    }
}

impl Decode for Value {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (tag, mut offset) = u8::decode_from(buf)?;
        let value = match tag {
            TAG_BOOLEAN => {
                let (v, n) = bool::decode_from(&buf[offset..])?;
                offset += n;
                Value::Boolean(v)
            }
            TAG_INTEGER => {
                let (bytes, n) = <[u8; 4]>::decode_from(&buf[offset..])?;
                offset += n;
                Value::Integer(i32::from_le_bytes(bytes))
            }
            TAG_LONG => {
                let (v, n) = i64::decode_from(&buf[offset..])?;
                offset += n;
                Value::Long(v)
            }
            TAG_FLOAT => {
                let (bytes, n) = <[u8; 4]>::decode_from(&buf[offset..])?;
                offset += n;
                Value::Float(f32::from_le_bytes(bytes))
            }
            TAG_DOUBLE => {
                let (bytes, n) = <[u8; 8]>::decode_from(&buf[offset..])?;
                offset += n;
                Value::Double(f64::from_le_bytes(bytes))
            }
            TAG_STRING => {
                let (v, n) = String::decode_from(&buf[offset..])?;
                offset += n;
                Value::String(v)
            }
            TAG_LINK => {
                let (v, n) = u64::decode_from(&buf[offset..])?;
                offset += n;
                Value::Link(v)
            }
            other => {
                return Err(EncodingError::InvalidTag {
                    tag: other as u32,
                    type_name: "Value",
                });
            }
        };
        Ok((value, offset))
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Boolean(v) => write!(f, "{v}"),
            Value::Integer(v) => write!(f, "{v}"),
            Value::Long(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Double(v) => write!(f, "{v}"),
            Value::String(v) => write!(f, "{v}"),
            Value::Link(v) => write!(f, "@{v}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::{decode_from_slice, encode_to_vec};

    #[test]
    fn type_then_value_ordering() {
        assert!(Value::Boolean(true) < Value::Integer(0));
        assert!(Value::Integer(100) < Value::Long(0));
        assert!(Value::Long(i64::MAX) < Value::Float(0.0));
        assert!(Value::String("a".into()) < Value::Link(0));
    }

    #[test]
    fn same_type_natural_ordering() {
        assert!(Value::Integer(1) < Value::Integer(2));
        assert!(Value::String("a".into()) < Value::String("b".into()));
        assert!(Value::Double(-1.5) < Value::Double(1.5));
    }

    #[test]
    fn equality_is_type_sensitive() {
        assert_ne!(Value::Long(3), Value::Double(3.0));
        assert_ne!(Value::Integer(3), Value::Long(3));
    }

    #[test]
    fn round_trips_every_variant() {
        let values = vec![
            Value::Boolean(true),
            Value::Integer(-42),
            Value::Long(i64::MIN),
            Value::Float(1.25),
            Value::Double(-2.5),
            Value::String("hello, record".into()),
            Value::Link(7),
        ];
        for value in values {
            let bytes = encode_to_vec(&value).unwrap();
            let (decoded, consumed) = decode_from_slice::<Value>(&bytes).unwrap();
            assert_eq!(consumed, bytes.len());
            assert_eq!(decoded, value);
        }
    }

    #[test]
    fn rejects_unknown_tag() {
        let bytes = vec![0xFFu8];
        let err = decode_from_slice::<Value>(&bytes).unwrap_err();
        assert!(matches!(err, EncodingError::InvalidTag { .. }));
    }
}
