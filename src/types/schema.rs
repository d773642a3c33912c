//! Schema definitions for fact and dimension tables.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::DataType;
use crate::error::{CuboidError, Result};

/// A field in a schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    name: String,
    data_type: DataType,
    nullable: bool,
}

impl Field {
    /// Create a new field.
    pub fn new(name: impl Into<String>, data_type: DataType, nullable: bool) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable,
        }
    }

    /// Get the field name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the data type.
    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    /// Check if the field is nullable.
    pub fn is_nullable(&self) -> bool {
        self.nullable
    }

    /// Create a qualified field name (table.column format).
    pub fn qualified_name(&self, qualifier: Option<&str>) -> String {
        match qualifier {
            Some(q) => format!("{}.{}", q, self.name),
            None => self.name.clone(),
        }
    }
}

/// A schema consisting of multiple named fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schema {
    fields: Vec<Field>,
    #[serde(skip)]
    field_index: HashMap<String, usize>,
}

impl PartialEq for Schema {
    fn eq(&self, other: &Self) -> bool {
        // The lookup index is a cache; equality is over the fields.
        self.fields == other.fields
    }
}

impl Eq for Schema {}

impl Schema {
    /// Create a new empty schema.
    pub fn empty() -> Self {
        Self {
            fields: Vec::new(),
            field_index: HashMap::new(),
        }
    }

    /// Create a new schema from fields.
    pub fn new(fields: Vec<Field>) -> Self {
        let field_index = fields
            .iter()
            .enumerate()
            .map(|(i, f)| (f.name().to_string(), i))
            .collect();
        Self {
            fields,
            field_index,
        }
    }

    /// Get the fields in this schema.
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Get a field by index.
    pub fn field(&self, index: usize) -> Option<&Field> {
        self.fields.get(index)
    }

    /// Get a field by name.
    pub fn field_by_name(&self, name: &str) -> Option<&Field> {
        self.lookup(name).map(|i| &self.fields[i])
    }

    /// Get the index of a field by name.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.lookup(name)
    }

    /// Get the number of fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Check if the schema is empty.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Check if a field exists.
    pub fn contains(&self, name: &str) -> bool {
        self.lookup(name).is_some()
    }

    /// Require a field by name.
    pub fn require(&self, name: &str) -> Result<&Field> {
        self.field_by_name(name)
            .ok_or_else(|| CuboidError::schema(format!("Column '{}' not found", name)))
    }

    /// Get an iterator over field names.
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name())
    }

    // The index is skipped during deserialization, so fall back to a
    // linear scan when it is empty but fields are not.
    fn lookup(&self, name: &str) -> Option<usize> {
        if self.field_index.len() == self.fields.len() {
            self.field_index.get(name).copied()
        } else {
            self.fields.iter().position(|f| f.name() == name)
        }
    }
}

impl Default for Schema {
    fn default() -> Self {
        Self::empty()
    }
}

impl From<Vec<Field>> for Schema {
    fn from(fields: Vec<Field>) -> Self {
        Self::new(fields)
    }
}

impl FromIterator<Field> for Schema {
    fn from_iter<T: IntoIterator<Item = Field>>(iter: T) -> Self {
        Self::new(iter.into_iter().collect())
    }
}
