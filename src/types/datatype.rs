//! Data types supported by the fact/dimension model.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The data type of a column or scalar value.
///
/// The model is deliberately narrow: dimension attributes are strings,
/// booleans, or integers; measures are 64-bit integers or floats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    /// Boolean value
    Boolean,
    /// 64-bit signed integer
    Int64,
    /// 64-bit floating point
    Float64,
    /// UTF-8 string
    Utf8,
}

impl DataType {
    /// Whether values of this type can be fed to SUM/AVG/MIN/MAX.
    pub fn is_numeric(&self) -> bool {
        matches!(self, DataType::Int64 | DataType::Float64)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::Boolean => write!(f, "BOOLEAN"),
            DataType::Int64 => write!(f, "BIGINT"),
            DataType::Float64 => write!(f, "DOUBLE"),
            DataType::Utf8 => write!(f, "VARCHAR"),
        }
    }
}
