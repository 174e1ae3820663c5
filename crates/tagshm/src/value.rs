//! Values stored in cells and the coercions used by `faa`.
//!
//! Fixed-width kinds (undefined, booleans, integers, floats) live inline in the
//! cell's payload word. Strings, serialized composites, and raw bytes live in
//! the region heap as length-prefixed blobs and the payload word holds their
//! heap offset. The kind itself is carried in the cell's tag word.

use std::fmt;

/// Kind code stored in a cell's tag word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ValueKind {
    Undefined = 0,
    Bool = 1,
    Int = 2,
    Float = 3,
    Str = 4,
    Json = 5,
    Bytes = 6,
}

impl ValueKind {
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::Undefined,
            1 => Self::Bool,
            2 => Self::Int,
            3 => Self::Float,
            4 => Self::Str,
            5 => Self::Json,
            6 => Self::Bytes,
            _ => return None,
        })
    }

    #[inline]
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Kinds whose payload lives in the heap.
    #[inline]
    pub fn is_heap(self) -> bool {
        matches!(self, Self::Str | Self::Json | Self::Bytes)
    }

    /// Kinds the core stores but never interprets.
    #[inline]
    pub fn is_composite(self) -> bool {
        matches!(self, Self::Json | Self::Bytes)
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Undefined => "undefined",
            Self::Bool => "boolean",
            Self::Int => "integer",
            Self::Float => "float",
            Self::Str => "string",
            Self::Json => "json",
            Self::Bytes => "bytes",
        })
    }
}

/// A value as seen at the API boundary.
///
/// `Json` carries an already-serialized composite value. `Bytes` carries an
/// opaque buffer. Neither takes part in arithmetic or compare-and-swap.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Undefined,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Json(String),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Undefined => ValueKind::Undefined,
            Self::Bool(_) => ValueKind::Bool,
            Self::Int(_) => ValueKind::Int,
            Self::Float(_) => ValueKind::Float,
            Self::Str(_) => ValueKind::Str,
            Self::Json(_) => ValueKind::Json,
            Self::Bytes(_) => ValueKind::Bytes,
        }
    }

    /// Exact identity: same kind and same bits. Unlike `==`, a NaN is
    /// identical to itself and `0.0` is not identical to `-0.0`.
    pub fn identical(&self, other: &Value) -> bool {
        match (self, other) {
            (Self::Float(a), Self::Float(b)) => a.to_bits() == b.to_bits(),
            _ => self == other,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) | Self::Json(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Split into the inline word for fixed-width kinds, or the heap bytes.
    pub(crate) fn encode(&self) -> Encoded<'_> {
        match self {
            Self::Undefined => Encoded::Inline(0),
            Self::Bool(b) => Encoded::Inline(*b as u64),
            Self::Int(v) => Encoded::Inline(*v as u64),
            Self::Float(v) => Encoded::Inline(v.to_bits()),
            Self::Str(s) | Self::Json(s) => Encoded::Heap(s.as_bytes()),
            Self::Bytes(b) => Encoded::Heap(b),
        }
    }

    /// Rebuild a fixed-width value from its inline word.
    pub(crate) fn decode_inline(kind: ValueKind, word: u64) -> Option<Value> {
        Some(match kind {
            ValueKind::Undefined => Self::Undefined,
            ValueKind::Bool => Self::Bool(word != 0),
            ValueKind::Int => Self::Int(word as i64),
            ValueKind::Float => Self::Float(f64::from_bits(word)),
            _ => return None,
        })
    }

    /// Rebuild a heap-backed value from its payload bytes.
    pub(crate) fn decode_heap(kind: ValueKind, bytes: Vec<u8>) -> Result<Value, &'static str> {
        match kind {
            ValueKind::Str => String::from_utf8(bytes)
                .map(Self::Str)
                .map_err(|_| "string payload is not UTF-8"),
            ValueKind::Json => String::from_utf8(bytes)
                .map(Self::Json)
                .map_err(|_| "json payload is not UTF-8"),
            ValueKind::Bytes => Ok(Self::Bytes(bytes)),
            _ => Err("inline kind has no heap payload"),
        }
    }

    /// Text used when this value is concatenated with a string.
    fn concat_text(&self) -> String {
        match self {
            Self::Undefined => "undefined".to_owned(),
            Self::Bool(b) => b.to_string(),
            Self::Int(v) => v.to_string(),
            Self::Float(v) => v.to_string(),
            Self::Str(s) | Self::Json(s) => s.clone(),
            Self::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
        }
    }

    /// The "addition" applied by fetch-and-add.
    ///
    /// - integers and booleans add as integers, promoting to float on overflow
    /// - any float operand makes the result a float
    /// - a string on either side concatenates the other operand's text
    /// - undefined with a number yields NaN
    /// - composites never combine
    pub fn add(&self, delta: &Value) -> Result<Value, (ValueKind, ValueKind)> {
        use Value::*;

        if self.kind().is_composite() || delta.kind().is_composite() {
            return Err((self.kind(), delta.kind()));
        }
        Ok(match (self, delta) {
            (Str(a), b) => Str(format!("{}{}", a, b.concat_text())),
            (a, Str(b)) => Str(format!("{}{}", a.concat_text(), b)),
            (Undefined, _) | (_, Undefined) => Float(f64::NAN),
            (Float(a), b) | (b, Float(a)) => Float(a + numeric(b)),
            (a, b) => {
                let (a, b) = (integral(a), integral(b));
                match a.checked_add(b) {
                    Some(sum) => Int(sum),
                    None => Float(a as f64 + b as f64),
                }
            }
        })
    }
}

fn integral(value: &Value) -> i64 {
    match value {
        Value::Bool(b) => *b as i64,
        Value::Int(v) => *v,
        _ => 0,
    }
}

fn numeric(value: &Value) -> f64 {
    match value {
        Value::Float(v) => *v,
        other => integral(other) as f64,
    }
}

pub(crate) enum Encoded<'a> {
    Inline(u64),
    Heap(&'a [u8]),
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(v as i64)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Self::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Str(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl From<&Value> for Value {
    fn from(v: &Value) -> Self {
        v.clone()
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            other => f.write_str(&other.concat_text()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_addition() {
        assert_eq!(Value::Int(40).add(&Value::Int(2)), Ok(Value::Int(42)));
        assert_eq!(Value::Bool(true).add(&Value::Int(2)), Ok(Value::Int(3)));
        assert_eq!(Value::Int(1).add(&Value::Bool(true)), Ok(Value::Int(2)));
    }

    #[test]
    fn test_overflow_promotes_to_float() {
        let sum = Value::Int(i64::MAX).add(&Value::Int(1)).unwrap();
        assert_eq!(sum.kind(), ValueKind::Float);
    }

    #[test]
    fn test_float_contaminates() {
        assert_eq!(Value::Int(1).add(&Value::Float(0.5)), Ok(Value::Float(1.5)));
        assert_eq!(Value::Float(0.5).add(&Value::Bool(true)), Ok(Value::Float(1.5)));
    }

    #[test]
    fn test_string_concatenation() {
        assert_eq!(
            Value::from("n=").add(&Value::Int(3)),
            Ok(Value::from("n=3"))
        );
        assert_eq!(
            Value::Bool(false).add(&Value::from("!")),
            Ok(Value::from("false!"))
        );
        assert_eq!(
            Value::Undefined.add(&Value::from("x")),
            Ok(Value::from("undefinedx"))
        );
    }

    #[test]
    fn test_undefined_yields_nan() {
        let sum = Value::Undefined.add(&Value::Int(1)).unwrap();
        assert!(sum.as_float().is_some_and(f64::is_nan));
    }

    #[test]
    fn test_composites_do_not_add() {
        assert_eq!(
            Value::Json("{}".into()).add(&Value::Int(1)),
            Err((ValueKind::Json, ValueKind::Int))
        );
        assert!(Value::Int(1).add(&Value::Bytes(vec![1])).is_err());
    }

    #[test]
    fn test_identity_is_bitwise_for_floats() {
        assert!(Value::Float(f64::NAN).identical(&Value::Float(f64::NAN)));
        assert!(!Value::Float(0.0).identical(&Value::Float(-0.0)));
        assert!(!Value::Int(1).identical(&Value::Float(1.0)));
        assert!(Value::from("abc").identical(&Value::from("abc")));
    }

    #[test]
    fn test_kind_codes_round_trip() {
        for code in 0..=6u8 {
            assert_eq!(ValueKind::from_code(code).map(ValueKind::code), Some(code));
        }
        assert_eq!(ValueKind::from_code(7), None);
    }
}
