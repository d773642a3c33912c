//! Star-schema model: one fact table plus the dimension tables its
//! foreign keys resolve to.
//!
//! The model is purely descriptive — it owns no data. It exists so the
//! spec registry can validate that grouping dimensions are reachable
//! through the join graph and that measures reference numeric fact
//! columns, before any aggregation runs.

use serde::{Deserialize, Serialize};

use crate::error::{CuboidError, Result};
use crate::types::{DataType, Schema};

/// Definition of the fact table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactTableDef {
    name: String,
    schema: Schema,
}

impl FactTableDef {
    /// Create a new fact table definition.
    pub fn new(name: impl Into<String>, schema: Schema) -> Self {
        Self {
            name: name.into(),
            schema,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }
}

/// Definition of one dimension table and the fact column joining to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimensionDef {
    name: String,
    /// Key column within the dimension table
    key_column: String,
    /// Fact table column holding the foreign key
    fact_fk_column: String,
    schema: Schema,
}

impl DimensionDef {
    /// Create a new dimension definition.
    pub fn new(
        name: impl Into<String>,
        key_column: impl Into<String>,
        fact_fk_column: impl Into<String>,
        schema: Schema,
    ) -> Self {
        Self {
            name: name.into(),
            key_column: key_column.into(),
            fact_fk_column: fact_fk_column.into(),
            schema,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn key_column(&self) -> &str {
        &self.key_column
    }

    pub fn fact_fk_column(&self) -> &str {
        &self.fact_fk_column
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }
}

/// An attribute reachable from the fact table: either a bare fact
/// column or a `dimension.attribute` path through one join.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttributePath {
    /// A column on the fact table itself
    Fact(String),
    /// A column on a dimension table, reached via the fact FK
    Dimension { dimension: String, attribute: String },
}

impl AttributePath {
    /// Parse a path string: `"amount"` or `"customer.country"`.
    pub fn parse(path: &str) -> Self {
        match path.split_once('.') {
            Some((dim, attr)) => AttributePath::Dimension {
                dimension: dim.to_string(),
                attribute: attr.to_string(),
            },
            None => AttributePath::Fact(path.to_string()),
        }
    }

    /// The qualified column name this path resolves to in a joined row.
    pub fn qualified(&self) -> String {
        match self {
            AttributePath::Fact(col) => col.clone(),
            AttributePath::Dimension {
                dimension,
                attribute,
            } => format!("{}.{}", dimension, attribute),
        }
    }
}

impl std::fmt::Display for AttributePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.qualified())
    }
}

impl From<&str> for AttributePath {
    fn from(path: &str) -> Self {
        AttributePath::parse(path)
    }
}

/// The star schema: fact table plus dimensions, forming the join graph
/// that grouping dimensions must be resolvable through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StarSchema {
    fact: FactTableDef,
    dimensions: Vec<DimensionDef>,
}

impl StarSchema {
    /// Create a star schema, validating the join graph.
    pub fn new(fact: FactTableDef, dimensions: Vec<DimensionDef>) -> Result<Self> {
        for dim in &dimensions {
            if !fact.schema().contains(dim.fact_fk_column()) {
                return Err(CuboidError::schema(format!(
                    "Fact table '{}' has no FK column '{}' for dimension '{}'",
                    fact.name(),
                    dim.fact_fk_column(),
                    dim.name()
                )));
            }
            if !dim.schema().contains(dim.key_column()) {
                return Err(CuboidError::schema(format!(
                    "Dimension '{}' has no key column '{}'",
                    dim.name(),
                    dim.key_column()
                )));
            }
        }

        let mut names: Vec<&str> = dimensions.iter().map(|d| d.name()).collect();
        names.sort_unstable();
        names.dedup();
        if names.len() != dimensions.len() {
            return Err(CuboidError::schema("Duplicate dimension name"));
        }

        Ok(Self { fact, dimensions })
    }

    pub fn fact(&self) -> &FactTableDef {
        &self.fact
    }

    pub fn dimensions(&self) -> &[DimensionDef] {
        &self.dimensions
    }

    /// Look up a dimension by name.
    pub fn dimension(&self, name: &str) -> Option<&DimensionDef> {
        self.dimensions.iter().find(|d| d.name() == name)
    }

    /// Resolve an attribute path to its data type and nullability.
    ///
    /// Dimension attributes are always nullable from the fact's point of
    /// view: a LEFT JOIN miss surfaces them as unknown.
    pub fn resolve_attribute(&self, path: &AttributePath) -> Result<(DataType, bool)> {
        match path {
            AttributePath::Fact(col) => {
                let field = self.fact.schema().field_by_name(col).ok_or_else(|| {
                    CuboidError::invalid_spec(format!(
                        "Attribute '{}' not found on fact table '{}'",
                        col,
                        self.fact.name()
                    ))
                })?;
                Ok((field.data_type(), field.is_nullable()))
            }
            AttributePath::Dimension {
                dimension,
                attribute,
            } => {
                let dim = self.dimension(dimension).ok_or_else(|| {
                    CuboidError::invalid_spec(format!(
                        "Dimension '{}' is not joined to fact table '{}'",
                        dimension,
                        self.fact.name()
                    ))
                })?;
                let field = dim.schema().field_by_name(attribute).ok_or_else(|| {
                    CuboidError::invalid_spec(format!(
                        "Attribute '{}' not found on dimension '{}'",
                        attribute, dimension
                    ))
                })?;
                Ok((field.data_type(), true))
            }
        }
    }
}
