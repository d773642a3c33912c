//! In-memory fact/dimension source.

use std::collections::HashMap;

use parking_lot::RwLock;

use super::{FactSource, JoinedRow, SourceSnapshot, Watermark};
use crate::error::{CuboidError, Result};
use crate::model::StarSchema;
use crate::types::{Datum, Schema};

/// An in-memory [`FactSource`] holding fact and dimension rows.
///
/// Facts are append-only and receive monotonically increasing sequence
/// numbers; dimension rows are keyed and overwrite in place on upsert
/// (no history is kept). Writes are validated against the star schema.
pub struct MemorySource {
    schema: StarSchema,
    inner: RwLock<SourceData>,
}

#[derive(Default)]
struct SourceData {
    /// (sequence number, fact column values in schema order)
    facts: Vec<(Watermark, Vec<Datum>)>,
    /// dimension name → key value → row values in schema order
    dimensions: HashMap<String, HashMap<Datum, Vec<Datum>>>,
    next_seq: Watermark,
    /// Advanced on every dimension upsert; see [`SourceSnapshot`]
    dim_epoch: u64,
}

impl MemorySource {
    /// Create an empty source for the given star schema.
    pub fn new(schema: StarSchema) -> Self {
        let mut dimensions = HashMap::new();
        for dim in schema.dimensions() {
            dimensions.insert(dim.name().to_string(), HashMap::new());
        }
        Self {
            schema,
            inner: RwLock::new(SourceData {
                facts: Vec::new(),
                dimensions,
                next_seq: 0,
                dim_epoch: 0,
            }),
        }
    }

    /// The star schema this source serves.
    pub fn schema(&self) -> &StarSchema {
        &self.schema
    }

    /// Append fact rows. Each row is a vector of values in fact schema
    /// order. Returns the watermark after the append.
    pub fn insert_facts(&self, rows: Vec<Vec<Datum>>) -> Result<Watermark> {
        let fact_schema = self.schema.fact().schema();
        for row in &rows {
            validate_row(fact_schema, row, self.schema.fact().name())?;
        }

        let mut data = self.inner.write();
        for row in rows {
            data.next_seq += 1;
            let seq = data.next_seq;
            data.facts.push((seq, row));
        }
        Ok(data.next_seq)
    }

    /// Insert or overwrite one dimension row, keyed by its key column.
    pub fn upsert_dimension(&self, dimension: &str, row: Vec<Datum>) -> Result<()> {
        let dim = self
            .schema
            .dimension(dimension)
            .ok_or_else(|| CuboidError::schema(format!("Unknown dimension '{}'", dimension)))?;
        validate_row(dim.schema(), &row, dim.name())?;

        let key_idx = dim
            .schema()
            .index_of(dim.key_column())
            .ok_or_else(|| CuboidError::internal("dimension key column vanished"))?;
        let key = row[key_idx].clone();
        if key.is_null() {
            return Err(CuboidError::schema(format!(
                "Dimension '{}' key must not be NULL",
                dimension
            )));
        }

        let mut data = self.inner.write();
        data.dim_epoch += 1;
        data.dimensions
            .get_mut(dimension)
            .expect("dimension map initialized in new()")
            .insert(key, row);
        Ok(())
    }

    /// Number of fact rows currently stored.
    pub fn fact_count(&self) -> usize {
        self.inner.read().facts.len()
    }
}

fn validate_row(schema: &Schema, row: &[Datum], table: &str) -> Result<()> {
    if row.len() != schema.len() {
        return Err(CuboidError::schema(format!(
            "Row for '{}' has {} values, schema has {} columns",
            table,
            row.len(),
            schema.len()
        )));
    }
    for (value, field) in row.iter().zip(schema.fields()) {
        if value.is_null() && !field.is_nullable() {
            return Err(CuboidError::schema(format!(
                "Column '{}' of '{}' is not nullable",
                field.name(),
                table
            )));
        }
        if !value.matches_type(field.data_type()) {
            return Err(CuboidError::type_error(format!(
                "Column '{}' of '{}' expects {}, got {}",
                field.name(),
                table,
                field.data_type(),
                value
            )));
        }
    }
    Ok(())
}

impl FactSource for MemorySource {
    fn scan_joined(&self, since: Option<Watermark>) -> Result<SourceSnapshot> {
        let data = self.inner.read();
        let fact_schema = self.schema.fact().schema();
        let mut rows = Vec::new();

        for (seq, fact) in &data.facts {
            if let Some(mark) = since {
                if *seq <= mark {
                    continue;
                }
            }

            let mut columns = HashMap::new();
            for (value, field) in fact.iter().zip(fact_schema.fields()) {
                columns.insert(field.name().to_string(), value.clone());
            }

            // Resolve each dimension FK; a miss leaves the dimension's
            // columns absent, which downstream reads as "unknown".
            for dim in self.schema.dimensions() {
                let fk_idx = fact_schema
                    .index_of(dim.fact_fk_column())
                    .ok_or_else(|| CuboidError::internal("FK column vanished"))?;
                let fk = &fact[fk_idx];
                if fk.is_null() {
                    continue;
                }
                let Some(dim_row) = data
                    .dimensions
                    .get(dim.name())
                    .and_then(|rows| rows.get(fk))
                else {
                    continue;
                };
                for (value, field) in dim_row.iter().zip(dim.schema().fields()) {
                    columns.insert(field.qualified_name(Some(dim.name())), value.clone());
                }
            }

            rows.push(JoinedRow {
                seq: *seq,
                columns,
            });
        }

        Ok(SourceSnapshot {
            rows,
            high_watermark: data.next_seq,
            dimension_epoch: data.dim_epoch,
        })
    }

    fn supports_watermark(&self) -> bool {
        true
    }
}
