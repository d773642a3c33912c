//! Aggregate spec registry.
//!
//! Specs are declarative: which grouping dimensions, which measures,
//! and which grouping strategy define a materialized artifact. The
//! registry validates them against the star schema's join graph at
//! registration time so the engine can assume every spec it sees is
//! well-formed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{CuboidError, Result};
use crate::model::{AttributePath, StarSchema};
use crate::types::DataType;

/// Registry-assigned identifier for an aggregate spec.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct SpecId(pub u64);

impl std::fmt::Display for SpecId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "spec#{}", self.0)
    }
}

/// Aggregation function applied to a measure column per group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AggregateFunc {
    Sum,
    Avg,
    Count,
    Min,
    Max,
}

impl AggregateFunc {
    /// Whether this function accepts a column of the given type.
    pub fn applicable_to(&self, data_type: DataType) -> bool {
        match self {
            AggregateFunc::Count => true,
            _ => data_type.is_numeric(),
        }
    }

    /// Whether per-group results can be merged with a delta computed
    /// over newly appended facts. AVG cannot: the finalized mean loses
    /// the contributing count. MIN/MAX merge safely only because facts
    /// are append-only.
    pub fn is_decomposable(&self) -> bool {
        !matches!(self, AggregateFunc::Avg)
    }
}

impl std::fmt::Display for AggregateFunc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AggregateFunc::Sum => "SUM",
            AggregateFunc::Avg => "AVG",
            AggregateFunc::Count => "COUNT",
            AggregateFunc::Min => "MIN",
            AggregateFunc::Max => "MAX",
        };
        write!(f, "{}", name)
    }
}

/// One measure of an aggregate spec: an aggregation function over a
/// fact column, surfaced under an output name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Measure {
    /// Input fact column; `None` means COUNT(*)
    pub column: Option<String>,
    pub func: AggregateFunc,
    /// Output column name in the artifact
    pub output: String,
}

impl Measure {
    /// Aggregate a fact column.
    pub fn new(func: AggregateFunc, column: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            column: Some(column.into()),
            func,
            output: output.into(),
        }
    }

    /// COUNT(*) under the given output name.
    pub fn count_star(output: impl Into<String>) -> Self {
        Self {
            column: None,
            func: AggregateFunc::Count,
            output: output.into(),
        }
    }
}

/// How many grouping granularities an artifact contains.
///
/// Every strategy reduces to an explicit list of dimension subsets
/// consumed by one generic grouping routine; ROLLUP and CUBE are just
/// enumerations over the spec's dimension list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupingStrategy {
    /// Plain GROUP BY over the full dimension tuple
    Flat,
    /// Full tuple plus every prefix, down to the grand total
    Rollup,
    /// Every subset of the dimension list (2^n grouping sets)
    Cube,
    /// Exactly the listed subsets of dimension indices. A grand-total
    /// row is produced only when the empty subset is listed.
    GroupingSets(Vec<Vec<usize>>),
}

impl GroupingStrategy {
    /// Expand to the explicit grouping-set masks over `n` dimensions.
    /// `mask[i]` is true when dimension `i` is retained in that set.
    pub fn grouping_sets(&self, n: usize) -> Vec<Vec<bool>> {
        match self {
            GroupingStrategy::Flat => vec![vec![true; n]],
            GroupingStrategy::Rollup => {
                // Full tuple first, then shrinking prefixes, then the
                // grand total.
                (0..=n)
                    .rev()
                    .map(|prefix| (0..n).map(|i| i < prefix).collect())
                    .collect()
            }
            GroupingStrategy::Cube => {
                // Deterministic order: descending bitmask, so the full
                // tuple comes first and the grand total last.
                (0..(1u64 << n))
                    .rev()
                    .map(|bits| (0..n).map(|i| bits & (1 << i) != 0).collect())
                    .collect()
            }
            GroupingStrategy::GroupingSets(sets) => sets
                .iter()
                .map(|set| (0..n).map(|i| set.contains(&i)).collect())
                .collect(),
        }
    }
}

/// A named, validated definition of one materialized artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateSpec {
    pub name: String,
    /// Ordered grouping dimensions (attribute paths through the join graph)
    pub dimensions: Vec<AttributePath>,
    pub measures: Vec<Measure>,
    pub strategy: GroupingStrategy,
}

impl AggregateSpec {
    pub fn new(
        name: impl Into<String>,
        dimensions: Vec<AttributePath>,
        measures: Vec<Measure>,
        strategy: GroupingStrategy,
    ) -> Self {
        Self {
            name: name.into(),
            dimensions,
            measures,
            strategy,
        }
    }

    /// Whether every measure can be maintained incrementally.
    pub fn is_decomposable(&self) -> bool {
        self.measures.iter().all(|m| m.func.is_decomposable())
    }

    /// Validate this spec against a star schema.
    pub fn validate(&self, schema: &StarSchema) -> Result<()> {
        if self.name.is_empty() {
            return Err(CuboidError::invalid_spec("Spec name must not be empty"));
        }
        if self.measures.is_empty() {
            return Err(CuboidError::invalid_spec(format!(
                "Spec '{}' has no measures",
                self.name
            )));
        }

        let mut seen_dims = Vec::new();
        for dim in &self.dimensions {
            schema.resolve_attribute(dim)?;
            if seen_dims.contains(&dim) {
                return Err(CuboidError::invalid_spec(format!(
                    "Spec '{}' lists grouping dimension '{}' twice",
                    self.name, dim
                )));
            }
            seen_dims.push(dim);
        }

        let mut seen_outputs = Vec::new();
        for measure in &self.measures {
            if measure.output.is_empty() {
                return Err(CuboidError::invalid_spec(format!(
                    "Spec '{}' has a measure with an empty output name",
                    self.name
                )));
            }
            if seen_outputs.contains(&&measure.output) {
                return Err(CuboidError::invalid_spec(format!(
                    "Spec '{}' has duplicate measure output '{}'",
                    self.name, measure.output
                )));
            }
            seen_outputs.push(&measure.output);

            match &measure.column {
                Some(column) => {
                    let path = AttributePath::Fact(column.clone());
                    let (data_type, _) = schema.resolve_attribute(&path).map_err(|_| {
                        CuboidError::invalid_spec(format!(
                            "Spec '{}': measure column '{}' not found on fact table",
                            self.name, column
                        ))
                    })?;
                    if !measure.func.applicable_to(data_type) {
                        return Err(CuboidError::invalid_spec(format!(
                            "Spec '{}': {} is not applicable to column '{}' of type {}",
                            self.name, measure.func, column, data_type
                        )));
                    }
                }
                None => {
                    if measure.func != AggregateFunc::Count {
                        return Err(CuboidError::invalid_spec(format!(
                            "Spec '{}': {} requires an input column",
                            self.name, measure.func
                        )));
                    }
                }
            }
        }

        match &self.strategy {
            GroupingStrategy::Cube if self.dimensions.len() > 16 => {
                return Err(CuboidError::invalid_spec(format!(
                    "Spec '{}': CUBE over {} dimensions would produce 2^{} grouping sets",
                    self.name,
                    self.dimensions.len(),
                    self.dimensions.len()
                )));
            }
            GroupingStrategy::GroupingSets(sets) => {
                if sets.is_empty() {
                    return Err(CuboidError::invalid_spec(format!(
                        "Spec '{}': GROUPING SETS list must not be empty",
                        self.name
                    )));
                }
                for set in sets {
                    for &idx in set {
                        if idx >= self.dimensions.len() {
                            return Err(CuboidError::invalid_spec(format!(
                                "Spec '{}': grouping set references dimension index {} \
                                 but only {} dimensions are declared",
                                self.name,
                                idx,
                                self.dimensions.len()
                            )));
                        }
                    }
                }
            }
            _ => {}
        }

        Ok(())
    }
}

/// Registry of aggregate specs, keyed by [`SpecId`].
///
/// Read-heavy and append-mostly; removal is supported so a retired spec
/// can take its artifact with it.
pub struct SpecRegistry {
    schema: StarSchema,
    specs: parking_lot::RwLock<HashMap<SpecId, Arc<AggregateSpec>>>,
    next_id: AtomicU64,
}

impl SpecRegistry {
    /// Create an empty registry bound to a star schema.
    pub fn new(schema: StarSchema) -> Self {
        Self {
            schema,
            specs: parking_lot::RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// The star schema specs are validated against.
    pub fn schema(&self) -> &StarSchema {
        &self.schema
    }

    /// Validate and register a spec, returning its assigned id.
    pub fn register(&self, spec: AggregateSpec) -> Result<SpecId> {
        spec.validate(&self.schema)?;
        let id = SpecId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.specs.write().insert(id, Arc::new(spec));
        Ok(id)
    }

    /// Get a registered spec.
    pub fn get(&self, id: SpecId) -> Result<Arc<AggregateSpec>> {
        self.specs
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| CuboidError::not_found(format!("{} is not registered", id)))
    }

    /// Remove a spec, returning it. The caller is responsible for
    /// retiring the spec's artifact.
    pub fn remove(&self, id: SpecId) -> Result<Arc<AggregateSpec>> {
        self.specs
            .write()
            .remove(&id)
            .ok_or_else(|| CuboidError::not_found(format!("{} is not registered", id)))
    }

    /// List registered spec ids, in ascending order.
    pub fn list(&self) -> Vec<SpecId> {
        let mut ids: Vec<SpecId> = self.specs.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Number of registered specs.
    pub fn len(&self) -> usize {
        self.specs.read().len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.specs.read().is_empty()
    }

    /// Dump all specs for persistence.
    pub(crate) fn snapshot(&self) -> Vec<(SpecId, AggregateSpec)> {
        let mut entries: Vec<(SpecId, AggregateSpec)> = self
            .specs
            .read()
            .iter()
            .map(|(id, spec)| (*id, spec.as_ref().clone()))
            .collect();
        entries.sort_by_key(|(id, _)| *id);
        entries
    }

    /// Restore specs from a persisted snapshot. Ids are preserved and
    /// the id counter advances past the highest restored id.
    pub(crate) fn restore(&self, entries: Vec<(SpecId, AggregateSpec)>) -> Result<()> {
        let mut specs = self.specs.write();
        let mut max_id = 0;
        for (id, spec) in entries {
            spec.validate(&self.schema)?;
            max_id = max_id.max(id.0);
            specs.insert(id, Arc::new(spec));
        }
        let next = self.next_id.load(Ordering::SeqCst).max(max_id + 1);
        self.next_id.store(next, Ordering::SeqCst);
        Ok(())
    }
}
