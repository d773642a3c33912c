//! # Cuboid
//!
//! An embedded aggregate materialization engine for star-schema data.
//!
//! Cuboid maintains precomputed aggregate artifacts (FLAT, ROLLUP, CUBE
//! and GROUPING SETS granularities) over an append-only fact table
//! joined to its dimensions, refreshes them on demand — fully or
//! incrementally from a fact watermark — and serves them to concurrent
//! readers with atomic whole-artifact swaps. Registered specs and their
//! artifacts can be persisted to a state directory and survive
//! restarts.
//!
//! ## Quick start
//!
//! ```
//! use cuboid::{
//!     AggregateFunc, AggregateSpec, AttributePath, DataType, Datum, DimensionDef,
//!     FactTableDef, Field, GroupingStrategy, Measure, RefreshMode, Schema, StarSchema,
//!     Warehouse,
//! };
//!
//! let fact = FactTableDef::new(
//!     "fact_billing",
//!     Schema::new(vec![
//!         Field::new("customer_id", DataType::Int64, false),
//!         Field::new("amount", DataType::Float64, false),
//!     ]),
//! );
//! let customer = DimensionDef::new(
//!     "customer",
//!     "customer_id",
//!     "customer_id",
//!     Schema::new(vec![
//!         Field::new("customer_id", DataType::Int64, false),
//!         Field::new("country", DataType::Utf8, true),
//!     ]),
//! );
//! let schema = StarSchema::new(fact, vec![customer])?;
//!
//! let warehouse = Warehouse::in_memory(schema);
//! warehouse.upsert_dimension("customer", vec![Datum::from(1), Datum::from("US")])?;
//! warehouse.insert_facts(vec![vec![Datum::from(1), Datum::from(100.0)]])?;
//!
//! let id = warehouse.register_spec(AggregateSpec::new(
//!     "billing_by_country",
//!     vec![AttributePath::parse("customer.country")],
//!     vec![Measure::new(AggregateFunc::Sum, "amount", "total")],
//!     GroupingStrategy::Flat,
//! ))?;
//!
//! warehouse.refresh(id, RefreshMode::Full)?;
//! let rows = warehouse.query(id, None)?;
//! assert_eq!(rows[0].measures, vec![Datum::from(100.0)]);
//! # Ok::<(), cuboid::CuboidError>(())
//! ```

pub mod engine;
pub mod error;
pub mod model;
pub mod persistence;
pub mod refresh;
pub mod registry;
pub mod storage;
pub mod store;
pub mod types;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub use engine::{AggregationEngine, ArtifactRow, DimValue, Materialization};
pub use error::{CuboidError, Result};
pub use model::{AttributePath, DimensionDef, FactTableDef, StarSchema};
pub use persistence::StateStore;
pub use refresh::{RefreshCoordinator, RefreshMode, RefreshOutcome, RefreshTrigger};
pub use registry::{AggregateFunc, AggregateSpec, GroupingStrategy, Measure, SpecId, SpecRegistry};
pub use storage::{FactSource, JoinedRow, MemorySource, SourceSnapshot, Watermark};
pub use store::{DimFilter, MaterializedArtifact, MaterializedStore, RefreshRecord};
pub use types::{DataType, Datum, Field, Schema};

/// Commonly used imports.
pub mod prelude {
    pub use crate::engine::{ArtifactRow, DimValue};
    pub use crate::error::{CuboidError, Result};
    pub use crate::model::{AttributePath, DimensionDef, FactTableDef, StarSchema};
    pub use crate::refresh::{RefreshMode, RefreshOutcome, RefreshTrigger};
    pub use crate::registry::{
        AggregateFunc, AggregateSpec, GroupingStrategy, Measure, SpecId,
    };
    pub use crate::store::DimFilter;
    pub use crate::types::{DataType, Datum, Field, Schema};
    pub use crate::{Warehouse, WarehouseConfig};
}

/// Configuration for a [`Warehouse`].
#[derive(Debug, Clone, Default)]
pub struct WarehouseConfig {
    state_dir: Option<PathBuf>,
    prefer_incremental: bool,
}

impl WarehouseConfig {
    pub fn new() -> Self {
        Self {
            state_dir: None,
            prefer_incremental: true,
        }
    }

    /// Persist specs and artifacts under this directory.
    pub fn state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = Some(dir.into());
        self
    }

    /// Whether trigger-driven refreshes prefer the incremental path
    /// (default true).
    pub fn prefer_incremental(mut self, prefer: bool) -> Self {
        self.prefer_incremental = prefer;
        self
    }
}

/// The top-level facade tying the pieces together: a star-schema
/// source, the spec registry, the materialized store, the refresh
/// coordinator and optional state persistence.
pub struct Warehouse {
    registry: Arc<SpecRegistry>,
    store: Arc<MaterializedStore>,
    coordinator: RefreshCoordinator,
    /// Present only for memory-backed warehouses; enables the fact and
    /// dimension write passthroughs.
    memory: Option<Arc<MemorySource>>,
    state: Option<StateStore>,
}

impl Warehouse {
    /// A memory-backed warehouse with no persistence.
    pub fn in_memory(schema: StarSchema) -> Self {
        let source = Arc::new(MemorySource::new(schema.clone()));
        Self::assemble(
            schema,
            source.clone(),
            Some(source),
            WarehouseConfig::new(),
            None,
        )
    }

    /// A memory-backed warehouse, loading any state persisted under the
    /// configured state directory. Restored artifacts keep serving
    /// until the next refresh recomputes them against current facts.
    pub fn open(schema: StarSchema, config: WarehouseConfig) -> Result<Self> {
        let source = Arc::new(MemorySource::new(schema.clone()));
        Self::with_source(schema, source.clone(), Some(source), config)
    }

    /// A warehouse over a caller-provided fact source.
    pub fn over_source(
        schema: StarSchema,
        source: Arc<dyn FactSource>,
        config: WarehouseConfig,
    ) -> Result<Self> {
        Self::with_source(schema, source, None, config)
    }

    fn with_source(
        schema: StarSchema,
        source: Arc<dyn FactSource>,
        memory: Option<Arc<MemorySource>>,
        config: WarehouseConfig,
    ) -> Result<Self> {
        let state = match &config.state_dir {
            Some(dir) => Some(StateStore::open(dir)?),
            None => None,
        };
        let warehouse = Self::assemble(schema, source, memory, config, state);
        warehouse.load_state()?;
        Ok(warehouse)
    }

    fn assemble(
        schema: StarSchema,
        source: Arc<dyn FactSource>,
        memory: Option<Arc<MemorySource>>,
        config: WarehouseConfig,
        state: Option<StateStore>,
    ) -> Self {
        let registry = Arc::new(SpecRegistry::new(schema));
        let store = Arc::new(MaterializedStore::new());
        let coordinator = RefreshCoordinator::new(registry.clone(), store.clone(), source)
            .with_prefer_incremental(config.prefer_incremental);
        Self {
            registry,
            store,
            coordinator,
            memory,
            state,
        }
    }

    fn load_state(&self) -> Result<()> {
        let Some(state) = &self.state else {
            return Ok(());
        };
        state.load_specs(&self.registry)?;
        for id in state.load_artifacts(&self.store)? {
            // An artifact whose spec is gone is an orphan from an
            // interrupted removal; finish the removal now.
            if self.registry.get(id).is_err() {
                self.store.remove(id);
                state.remove_artifact(id)?;
            }
        }
        Ok(())
    }

    /// The star schema this warehouse serves.
    pub fn schema(&self) -> &StarSchema {
        self.registry.schema()
    }

    /// Validate and register an aggregate spec.
    pub fn register_spec(&self, spec: AggregateSpec) -> Result<SpecId> {
        let id = self.registry.register(spec)?;
        if let Some(state) = &self.state {
            state.save_specs(&self.registry)?;
        }
        Ok(id)
    }

    /// Look up a registered spec.
    pub fn spec(&self, id: SpecId) -> Result<Arc<AggregateSpec>> {
        self.registry.get(id)
    }

    /// Registered spec ids, ascending.
    pub fn list_specs(&self) -> Vec<SpecId> {
        self.registry.list()
    }

    /// Remove a spec and retire its artifact.
    pub fn remove_spec(&self, id: SpecId) -> Result<()> {
        self.registry.remove(id)?;
        self.coordinator.retire(id);
        self.store.remove(id);
        if let Some(state) = &self.state {
            state.save_specs(&self.registry)?;
            state.remove_artifact(id)?;
        }
        Ok(())
    }

    /// Run (or coalesce into) a refresh, persisting the new artifact
    /// when a state directory is configured.
    pub fn refresh(&self, id: SpecId, mode: RefreshMode) -> Result<RefreshOutcome> {
        let outcome = self.coordinator.refresh(id, mode)?;
        if matches!(outcome, RefreshOutcome::Refreshed { .. }) {
            self.persist_artifact(id)?;
        }
        Ok(outcome)
    }

    fn persist_artifact(&self, id: SpecId) -> Result<()> {
        let Some(state) = &self.state else {
            return Ok(());
        };
        // The spec may have been removed between the refresh completing
        // and this write; removal owns the file cleanup in that case.
        let Ok(artifact) = self.store.get(id) else {
            return Ok(());
        };
        let record = self.store.record(id).unwrap_or_default();
        state.save_artifact(&artifact, &record)
    }

    /// Read the current artifact's rows, optionally filtered over
    /// grouping dimensions. Never blocks on an in-flight refresh.
    pub fn query(&self, id: SpecId, filter: Option<&DimFilter>) -> Result<Vec<ArtifactRow>> {
        self.store.query(id, filter)
    }

    /// The current artifact, with version and watermark metadata.
    pub fn artifact(&self, id: SpecId) -> Result<Arc<MaterializedArtifact>> {
        self.store.get(id)
    }

    /// Elapsed time since the artifact's last successful refresh.
    pub fn staleness(&self, id: SpecId) -> Result<Duration> {
        self.store.staleness(id)
    }

    /// Refresh metadata, if any refresh was ever attempted.
    pub fn refresh_record(&self, id: SpecId) -> Option<RefreshRecord> {
        self.store.record(id)
    }

    /// Append fact rows. Only available on memory-backed warehouses.
    pub fn insert_facts(&self, rows: Vec<Vec<Datum>>) -> Result<Watermark> {
        self.memory_source()?.insert_facts(rows)
    }

    /// Insert or overwrite a dimension row. Only available on
    /// memory-backed warehouses.
    pub fn upsert_dimension(&self, dimension: &str, row: Vec<Datum>) -> Result<()> {
        self.memory_source()?.upsert_dimension(dimension, row)
    }

    fn memory_source(&self) -> Result<&Arc<MemorySource>> {
        self.memory.as_ref().ok_or_else(|| {
            CuboidError::schema("Warehouse is not memory-backed; write to its source directly")
        })
    }
}

impl RefreshTrigger for Warehouse {
    fn on_trigger(&self, id: SpecId) -> Result<RefreshOutcome> {
        let outcome = self.coordinator.on_trigger(id)?;
        if matches!(outcome, RefreshOutcome::Refreshed { .. }) {
            self.persist_artifact(id)?;
        }
        Ok(outcome)
    }
}
