//! Scalar value representation.

use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use super::DataType;
use crate::error::{CuboidError, Result};

/// A single scalar value flowing through the engine.
///
/// `Datum` is hashable so grouping keys can go straight into a hash map;
/// floats hash and compare by bit pattern for that purpose.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Datum {
    /// Null value
    Null,
    /// Boolean value
    Boolean(bool),
    /// 64-bit signed integer
    Int64(i64),
    /// 64-bit floating point
    Float64(f64),
    /// UTF-8 string
    Utf8(String),
}

impl Datum {
    /// Check if this value is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Datum::Null)
    }

    /// Get the data type of this value, if it is not null.
    pub fn data_type(&self) -> Option<DataType> {
        match self {
            Datum::Null => None,
            Datum::Boolean(_) => Some(DataType::Boolean),
            Datum::Int64(_) => Some(DataType::Int64),
            Datum::Float64(_) => Some(DataType::Float64),
            Datum::Utf8(_) => Some(DataType::Utf8),
        }
    }

    /// Check whether this value is valid for a column of the given type.
    /// Null is valid for any type; nullability is enforced by the schema.
    pub fn matches_type(&self, data_type: DataType) -> bool {
        match self.data_type() {
            None => true,
            Some(dt) => dt == data_type,
        }
    }

    /// Try to convert to i64.
    pub fn try_as_i64(&self) -> Result<Option<i64>> {
        match self {
            Datum::Null => Ok(None),
            Datum::Int64(v) => Ok(Some(*v)),
            other => Err(CuboidError::type_error(format!(
                "Cannot convert {:?} to i64",
                other.data_type()
            ))),
        }
    }

    /// Try to convert to f64. Integers widen losslessly within 2^53.
    pub fn try_as_f64(&self) -> Result<Option<f64>> {
        match self {
            Datum::Null => Ok(None),
            Datum::Int64(v) => Ok(Some(*v as f64)),
            Datum::Float64(v) => Ok(Some(*v)),
            other => Err(CuboidError::type_error(format!(
                "Cannot convert {:?} to f64",
                other.data_type()
            ))),
        }
    }

    /// Try to view as a string slice.
    pub fn try_as_str(&self) -> Result<Option<&str>> {
        match self {
            Datum::Null => Ok(None),
            Datum::Utf8(v) => Ok(Some(v)),
            other => Err(CuboidError::type_error(format!(
                "Cannot convert {:?} to string",
                other.data_type()
            ))),
        }
    }
}

impl PartialEq for Datum {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Datum::Null, Datum::Null) => true,
            (Datum::Boolean(a), Datum::Boolean(b)) => a == b,
            (Datum::Int64(a), Datum::Int64(b)) => a == b,
            (Datum::Float64(a), Datum::Float64(b)) => a.to_bits() == b.to_bits(),
            (Datum::Utf8(a), Datum::Utf8(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Datum {}

impl Hash for Datum {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Datum::Null => {}
            Datum::Boolean(v) => v.hash(state),
            Datum::Int64(v) => v.hash(state),
            Datum::Float64(v) => v.to_bits().hash(state),
            Datum::Utf8(v) => v.hash(state),
        }
    }
}

impl PartialOrd for Datum {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Datum {
    /// Total order used for canonical artifact row ordering. Nulls sort
    /// first, then values within a type, then across types by variant.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        use std::cmp::Ordering;
        match (self, other) {
            (Datum::Null, Datum::Null) => Ordering::Equal,
            (Datum::Null, _) => Ordering::Less,
            (_, Datum::Null) => Ordering::Greater,
            (Datum::Boolean(a), Datum::Boolean(b)) => a.cmp(b),
            (Datum::Int64(a), Datum::Int64(b)) => a.cmp(b),
            (Datum::Float64(a), Datum::Float64(b)) => {
                a.partial_cmp(b).unwrap_or_else(|| a.to_bits().cmp(&b.to_bits()))
            }
            (Datum::Utf8(a), Datum::Utf8(b)) => a.cmp(b),
            (a, b) => variant_rank(a).cmp(&variant_rank(b)),
        }
    }
}

fn variant_rank(d: &Datum) -> u8 {
    match d {
        Datum::Null => 0,
        Datum::Boolean(_) => 1,
        Datum::Int64(_) => 2,
        Datum::Float64(_) => 3,
        Datum::Utf8(_) => 4,
    }
}

impl fmt::Display for Datum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Datum::Null => write!(f, "NULL"),
            Datum::Boolean(v) => write!(f, "{}", v),
            Datum::Int64(v) => write!(f, "{}", v),
            Datum::Float64(v) => write!(f, "{}", v),
            Datum::Utf8(v) => write!(f, "'{}'", v),
        }
    }
}

// Convenience conversion implementations
impl From<bool> for Datum {
    fn from(v: bool) -> Self {
        Datum::Boolean(v)
    }
}

impl From<i64> for Datum {
    fn from(v: i64) -> Self {
        Datum::Int64(v)
    }
}

impl From<i32> for Datum {
    fn from(v: i32) -> Self {
        Datum::Int64(v as i64)
    }
}

impl From<f64> for Datum {
    fn from(v: f64) -> Self {
        Datum::Float64(v)
    }
}

impl From<&str> for Datum {
    fn from(v: &str) -> Self {
        Datum::Utf8(v.to_string())
    }
}

impl From<String> for Datum {
    fn from(v: String) -> Self {
        Datum::Utf8(v)
    }
}
