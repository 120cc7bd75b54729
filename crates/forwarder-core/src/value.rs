//! Typed PV values.
//!
//! A PV carries one of:
//! - a numeric scalar (`Int8` .. `Double`),
//! - an array of one numeric element kind,
//! - a string.
//!
//! The [`ValueKind`] of the first value seen on a channel is the kind the
//! channel keeps for its lifetime; see `Registry::process_event`.

use std::fmt;

/// Numeric element kind, shared by scalars and arrays.
///
/// The discriminants are the element tags used on the wire.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ScalarKind {
    Int8 = 0,
    Int16 = 1,
    Int32 = 2,
    Int64 = 3,
    UInt8 = 4,
    UInt16 = 5,
    UInt32 = 6,
    UInt64 = 7,
    Float = 8,
    Double = 9,
}

impl ScalarKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(ScalarKind::Int8),
            1 => Some(ScalarKind::Int16),
            2 => Some(ScalarKind::Int32),
            3 => Some(ScalarKind::Int64),
            4 => Some(ScalarKind::UInt8),
            5 => Some(ScalarKind::UInt16),
            6 => Some(ScalarKind::UInt32),
            7 => Some(ScalarKind::UInt64),
            8 => Some(ScalarKind::Float),
            9 => Some(ScalarKind::Double),
            _ => None,
        }
    }

    /// Size of one element in bytes.
    pub fn width(self) -> usize {
        match self {
            ScalarKind::Int8 | ScalarKind::UInt8 => 1,
            ScalarKind::Int16 | ScalarKind::UInt16 => 2,
            ScalarKind::Int32 | ScalarKind::UInt32 | ScalarKind::Float => 4,
            ScalarKind::Int64 | ScalarKind::UInt64 | ScalarKind::Double => 8,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ScalarKind::Int8 => "int8",
            ScalarKind::Int16 => "int16",
            ScalarKind::Int32 => "int32",
            ScalarKind::Int64 => "int64",
            ScalarKind::UInt8 => "uint8",
            ScalarKind::UInt16 => "uint16",
            ScalarKind::UInt32 => "uint32",
            ScalarKind::UInt64 => "uint64",
            ScalarKind::Float => "float",
            ScalarKind::Double => "double",
        }
    }
}

/// Shape + element kind of a [`Value`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Scalar(ScalarKind),
    Array(ScalarKind),
    String,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueKind::Scalar(k) => write!(f, "{}", k.as_str()),
            ValueKind::Array(k) => write!(f, "{}[]", k.as_str()),
            ValueKind::String => write!(f, "string"),
        }
    }
}

/// A single numeric value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Scalar {
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    UInt8(u8),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    Float(f32),
    Double(f64),
}

impl Scalar {
    pub fn kind(&self) -> ScalarKind {
        match self {
            Scalar::Int8(_) => ScalarKind::Int8,
            Scalar::Int16(_) => ScalarKind::Int16,
            Scalar::Int32(_) => ScalarKind::Int32,
            Scalar::Int64(_) => ScalarKind::Int64,
            Scalar::UInt8(_) => ScalarKind::UInt8,
            Scalar::UInt16(_) => ScalarKind::UInt16,
            Scalar::UInt32(_) => ScalarKind::UInt32,
            Scalar::UInt64(_) => ScalarKind::UInt64,
            Scalar::Float(_) => ScalarKind::Float,
            Scalar::Double(_) => ScalarKind::Double,
        }
    }
}

/// A homogeneous numeric array.
#[derive(Debug, Clone, PartialEq)]
pub enum ArrayValue {
    Int8(Vec<i8>),
    Int16(Vec<i16>),
    Int32(Vec<i32>),
    Int64(Vec<i64>),
    UInt8(Vec<u8>),
    UInt16(Vec<u16>),
    UInt32(Vec<u32>),
    UInt64(Vec<u64>),
    Float(Vec<f32>),
    Double(Vec<f64>),
}

impl ArrayValue {
    pub fn element_kind(&self) -> ScalarKind {
        match self {
            ArrayValue::Int8(_) => ScalarKind::Int8,
            ArrayValue::Int16(_) => ScalarKind::Int16,
            ArrayValue::Int32(_) => ScalarKind::Int32,
            ArrayValue::Int64(_) => ScalarKind::Int64,
            ArrayValue::UInt8(_) => ScalarKind::UInt8,
            ArrayValue::UInt16(_) => ScalarKind::UInt16,
            ArrayValue::UInt32(_) => ScalarKind::UInt32,
            ArrayValue::UInt64(_) => ScalarKind::UInt64,
            ArrayValue::Float(_) => ScalarKind::Float,
            ArrayValue::Double(_) => ScalarKind::Double,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ArrayValue::Int8(v) => v.len(),
            ArrayValue::Int16(v) => v.len(),
            ArrayValue::Int32(v) => v.len(),
            ArrayValue::Int64(v) => v.len(),
            ArrayValue::UInt8(v) => v.len(),
            ArrayValue::UInt16(v) => v.len(),
            ArrayValue::UInt32(v) => v.len(),
            ArrayValue::UInt64(v) => v.len(),
            ArrayValue::Float(v) => v.len(),
            ArrayValue::Double(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A PV value as forwarded.
///
/// Equality compares floats with IEEE rules, so a value holding NaN is
/// never equal to itself.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Scalar(Scalar),
    Array(ArrayValue),
    String(String),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Scalar(s) => ValueKind::Scalar(s.kind()),
            Value::Array(a) => ValueKind::Array(a.element_kind()),
            Value::String(_) => ValueKind::String,
        }
    }

    /// Convenience constructor for the most common PV type.
    pub fn double(v: f64) -> Self {
        Value::Scalar(Scalar::Double(v))
    }

    /// Returns the value if this is a `Double` scalar.
    pub fn as_double(&self) -> Option<f64> {
        match self {
            Value::Scalar(Scalar::Double(v)) => Some(*v),
            _ => None,
        }
    }
}

impl From<Scalar> for Value {
    fn from(s: Scalar) -> Self {
        Value::Scalar(s)
    }
}

impl From<ArrayValue> for Value {
    fn from(a: ArrayValue) -> Self {
        Value::Array(a)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Scalar(Scalar::Double(v))
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Scalar(Scalar::Int32(v))
    }
}

impl From<Vec<f64>> for Value {
    fn from(v: Vec<f64>) -> Self {
        Value::Array(ArrayValue::Double(v))
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}
