//! Core type definitions: scalar values, data types, and schemas.

mod datatype;
mod schema;
mod value;

pub use datatype::DataType;
pub use schema::{Field, Schema};
pub use value::Datum;
