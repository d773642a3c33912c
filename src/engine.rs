//! Aggregation engine: computes an artifact's rows from source data.
//!
//! Every grouping strategy (FLAT, ROLLUP, CUBE, GROUPING SETS) is first
//! expanded into an explicit list of dimension-subset masks; a single
//! generic hash-grouping routine then runs once per mask, feeding
//! per-measure accumulators. There is no reliance on a query engine's
//! built-in subtotal operators.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{CuboidError, Result};
use crate::registry::{AggregateFunc, AggregateSpec, Measure};
use crate::storage::{FactSource, JoinedRow, Watermark};
use crate::types::Datum;

/// One grouping-dimension value in an artifact row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DimValue {
    /// Subtotal marker: the dimension is absent from this grouping set
    All,
    /// Join miss or NULL attribute — the distinct "unknown" bucket
    Unknown,
    /// A concrete dimension value
    Value(Datum),
}

impl DimValue {
    /// Whether this is the ALL subtotal marker.
    pub fn is_all(&self) -> bool {
        matches!(self, DimValue::All)
    }

    /// The concrete value, if any.
    pub fn as_datum(&self) -> Option<&Datum> {
        match self {
            DimValue::Value(d) => Some(d),
            _ => None,
        }
    }
}

impl std::fmt::Display for DimValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DimValue::All => write!(f, "ALL"),
            DimValue::Unknown => write!(f, "NULL"),
            DimValue::Value(d) => write!(f, "{}", d),
        }
    }
}

/// One result row: values for the grouping dimensions plus the computed
/// measures, in spec order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRow {
    pub dims: Vec<DimValue>,
    pub measures: Vec<Datum>,
}

/// The computed output for one spec, tagged with the watermark and
/// dimension epoch of the snapshot it was computed from.
#[derive(Debug, Clone)]
pub struct Materialization {
    pub rows: Vec<ArtifactRow>,
    pub watermark: Watermark,
    pub dimension_epoch: u64,
}

/// Stateless aggregation routines.
pub struct AggregationEngine;

impl AggregationEngine {
    /// Compute the full artifact rows for a spec from a source scan.
    pub fn compute(spec: &AggregateSpec, source: &dyn FactSource) -> Result<Materialization> {
        let snapshot = source
            .scan_joined(None)
            .map_err(|e| CuboidError::compute(format!("source scan failed: {}", e)))?;
        let rows = Self::aggregate(spec, &snapshot.rows)?;
        Ok(Materialization {
            rows,
            watermark: snapshot.high_watermark,
            dimension_epoch: snapshot.dimension_epoch,
        })
    }

    /// Compute artifact rows over only the facts appended after the
    /// given watermark. The result covers just the touched groups and
    /// must be merged into an existing artifact.
    pub fn compute_delta(
        spec: &AggregateSpec,
        source: &dyn FactSource,
        since: Watermark,
    ) -> Result<Materialization> {
        let snapshot = source
            .scan_joined(Some(since))
            .map_err(|e| CuboidError::compute(format!("source delta scan failed: {}", e)))?;
        let rows = Self::aggregate(spec, &snapshot.rows)?;
        Ok(Materialization {
            rows,
            watermark: snapshot.high_watermark,
            dimension_epoch: snapshot.dimension_epoch,
        })
    }

    /// Group joined rows by every grouping set of the spec's strategy.
    fn aggregate(spec: &AggregateSpec, input: &[JoinedRow]) -> Result<Vec<ArtifactRow>> {
        let dim_cols: Vec<String> = spec.dimensions.iter().map(|p| p.qualified()).collect();
        // Duplicate grouping sets would double-count into the same key.
        let mut masks = Vec::new();
        for mask in spec.strategy.grouping_sets(dim_cols.len()) {
            if !masks.contains(&mask) {
                masks.push(mask);
            }
        }

        let mut groups: HashMap<Vec<DimValue>, Vec<Accumulator>> = HashMap::new();

        for mask in &masks {
            for row in input {
                let key: Vec<DimValue> = mask
                    .iter()
                    .zip(&dim_cols)
                    .map(|(&keep, col)| {
                        if !keep {
                            DimValue::All
                        } else {
                            match row.get(col) {
                                None | Some(Datum::Null) => DimValue::Unknown,
                                Some(d) => DimValue::Value(d.clone()),
                            }
                        }
                    })
                    .collect();

                let accumulators = groups
                    .entry(key)
                    .or_insert_with(|| spec.measures.iter().map(Accumulator::for_measure).collect());

                for (acc, measure) in accumulators.iter_mut().zip(&spec.measures) {
                    let value = match &measure.column {
                        // COUNT(*): every row contributes
                        None => Datum::Int64(1),
                        Some(col) => row.get(col).cloned().unwrap_or(Datum::Null),
                    };
                    acc.update(&value)?;
                }
            }
        }

        let mut rows: Vec<ArtifactRow> = groups
            .into_iter()
            .map(|(dims, accumulators)| {
                let measures = accumulators
                    .iter()
                    .map(|acc| acc.finalize())
                    .collect::<Result<Vec<Datum>>>()?;
                Ok(ArtifactRow { dims, measures })
            })
            .collect::<Result<Vec<_>>>()?;

        // Canonical ordering makes refreshes over unchanged data
        // reproduce the artifact exactly. Contractually rows are
        // unordered; any presentation ordering is a serving concern.
        rows.sort_by(|a, b| a.dims.cmp(&b.dims));
        Ok(rows)
    }

    /// Merge a delta computed by [`compute_delta`] into an existing
    /// artifact's rows. Only valid for decomposable specs (no AVG),
    /// append-only facts, and dimension rows unchanged since the
    /// existing artifact was computed (compare dimension epochs).
    ///
    /// [`compute_delta`]: AggregationEngine::compute_delta
    pub fn merge_delta(
        spec: &AggregateSpec,
        existing: &[ArtifactRow],
        delta: Vec<ArtifactRow>,
    ) -> Result<Vec<ArtifactRow>> {
        if !spec.is_decomposable() {
            return Err(CuboidError::internal(format!(
                "merge_delta called for non-decomposable spec '{}'",
                spec.name
            )));
        }

        let mut merged: HashMap<Vec<DimValue>, Vec<Datum>> = existing
            .iter()
            .map(|row| (row.dims.clone(), row.measures.clone()))
            .collect();

        for row in delta {
            match merged.get_mut(&row.dims) {
                None => {
                    merged.insert(row.dims, row.measures);
                }
                Some(measures) => {
                    for ((current, incoming), measure) in
                        measures.iter_mut().zip(row.measures).zip(&spec.measures)
                    {
                        *current = merge_measure(measure, current, &incoming)?;
                    }
                }
            }
        }

        let mut rows: Vec<ArtifactRow> = merged
            .into_iter()
            .map(|(dims, measures)| ArtifactRow { dims, measures })
            .collect();
        rows.sort_by(|a, b| a.dims.cmp(&b.dims));
        Ok(rows)
    }
}

/// Combine an existing finalized measure value with a delta value.
/// `Null` means no non-null input contributed on that side.
fn merge_measure(measure: &Measure, current: &Datum, incoming: &Datum) -> Result<Datum> {
    use AggregateFunc::*;

    match (current, incoming) {
        (Datum::Null, other) => Ok(other.clone()),
        (this, Datum::Null) => Ok(this.clone()),
        (a, b) => match measure.func {
            Count | Sum => match (a, b) {
                (Datum::Int64(x), Datum::Int64(y)) => x
                    .checked_add(*y)
                    .map(Datum::Int64)
                    .ok_or_else(|| sum_overflow(measure)),
                (Datum::Float64(x), Datum::Float64(y)) => Ok(Datum::Float64(x + y)),
                _ => Err(merge_type_mismatch(measure, a, b)),
            },
            Min => Ok(if b < a { b.clone() } else { a.clone() }),
            Max => Ok(if b > a { b.clone() } else { a.clone() }),
            Avg => Err(CuboidError::internal(
                "AVG is not decomposable; merge_delta must not see it",
            )),
        },
    }
}

fn sum_overflow(measure: &Measure) -> CuboidError {
    CuboidError::compute(format!("SUM overflow in measure '{}'", measure.output))
}

fn merge_type_mismatch(measure: &Measure, a: &Datum, b: &Datum) -> CuboidError {
    CuboidError::compute(format!(
        "Measure '{}': cannot merge {} with {}",
        measure.output, a, b
    ))
}

/// Per-group, per-measure accumulation state.
///
/// NULL inputs are ignored, matching SQL aggregate semantics; a measure
/// whose inputs were all NULL finalizes to NULL (COUNT finalizes to 0).
/// AVG accumulates its running sum in f64 and its count in u64, at
/// least as wide as any stored numeric type, so rounding drift does not
/// accumulate across large groups.
#[derive(Debug)]
enum Accumulator {
    Count(u64),
    SumInt(Option<i128>),
    SumFloat(Option<f64>),
    Avg { sum: f64, count: u64 },
    Min(Option<Datum>),
    Max(Option<Datum>),
    /// SUM before the first non-null input reveals the column type
    SumPending,
}

impl Accumulator {
    fn for_measure(measure: &Measure) -> Self {
        match measure.func {
            AggregateFunc::Count => Accumulator::Count(0),
            AggregateFunc::Sum => Accumulator::SumPending,
            AggregateFunc::Avg => Accumulator::Avg { sum: 0.0, count: 0 },
            AggregateFunc::Min => Accumulator::Min(None),
            AggregateFunc::Max => Accumulator::Max(None),
        }
    }

    fn update(&mut self, value: &Datum) -> Result<()> {
        if value.is_null() {
            return Ok(());
        }
        match self {
            Accumulator::Count(n) => {
                *n += 1;
            }
            Accumulator::SumPending => {
                *self = match value {
                    Datum::Int64(v) => Accumulator::SumInt(Some(*v as i128)),
                    Datum::Float64(v) => Accumulator::SumFloat(Some(*v)),
                    other => return Err(non_numeric(other)),
                };
            }
            Accumulator::SumInt(state) => {
                let v = value.try_as_i64().map_err(|_| non_numeric(value))?;
                if let Some(v) = v {
                    *state = Some(state.unwrap_or(0) + v as i128);
                }
            }
            Accumulator::SumFloat(state) => {
                let v = value.try_as_f64().map_err(|_| non_numeric(value))?;
                if let Some(v) = v {
                    *state = Some(state.unwrap_or(0.0) + v);
                }
            }
            Accumulator::Avg { sum, count } => {
                let v = value.try_as_f64().map_err(|_| non_numeric(value))?;
                if let Some(v) = v {
                    *sum += v;
                    *count += 1;
                }
            }
            Accumulator::Min(state) => {
                check_numeric(value)?;
                match state {
                    Some(current) if &*current <= value => {}
                    _ => *state = Some(value.clone()),
                }
            }
            Accumulator::Max(state) => {
                check_numeric(value)?;
                match state {
                    Some(current) if &*current >= value => {}
                    _ => *state = Some(value.clone()),
                }
            }
        }
        Ok(())
    }

    fn finalize(&self) -> Result<Datum> {
        Ok(match self {
            Accumulator::Count(n) => Datum::Int64(*n as i64),
            Accumulator::SumPending => Datum::Null,
            Accumulator::SumInt(state) => match state {
                None => Datum::Null,
                Some(total) => {
                    let v = i64::try_from(*total).map_err(|_| {
                        CuboidError::compute("SUM result exceeds 64-bit integer range")
                    })?;
                    Datum::Int64(v)
                }
            },
            Accumulator::SumFloat(state) => state.map(Datum::Float64).unwrap_or(Datum::Null),
            Accumulator::Avg { sum, count } => {
                if *count == 0 {
                    Datum::Null
                } else {
                    Datum::Float64(sum / *count as f64)
                }
            }
            Accumulator::Min(state) | Accumulator::Max(state) => {
                state.clone().unwrap_or(Datum::Null)
            }
        })
    }
}

fn check_numeric(value: &Datum) -> Result<()> {
    match value {
        Datum::Int64(_) | Datum::Float64(_) => Ok(()),
        other => Err(non_numeric(other)),
    }
}

fn non_numeric(value: &Datum) -> CuboidError {
    CuboidError::compute(format!(
        "Declared-numeric measure received non-numeric value {}",
        value
    ))
}
