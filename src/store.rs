//! Materialized store: versioned artifacts and their refresh metadata.
//!
//! Readers are never blocked by a refresh. An artifact is an immutable
//! `Arc`'d value; `put` builds the replacement completely off to the
//! side and swaps the pointer in one short write section. A reader
//! holds whichever version it observed — old or new, never a torn mix.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::engine::{ArtifactRow, DimValue};
use crate::error::{CuboidError, Result};
use crate::registry::SpecId;
use crate::storage::Watermark;
use crate::types::Datum;

/// The current computed output for one spec.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaterializedArtifact {
    pub spec_id: SpecId,
    /// Monotonically increasing per-store version
    pub version: u64,
    pub refreshed_at: DateTime<Utc>,
    /// Fact watermark of the snapshot this artifact was computed from
    pub watermark: Watermark,
    /// Dimension epoch of that snapshot; a refresh compares it against
    /// the source to detect in-place dimension updates
    #[serde(default)]
    pub dimension_epoch: u64,
    pub rows: Vec<ArtifactRow>,
}

/// Refresh metadata per spec.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RefreshRecord {
    pub last_success: Option<DateTime<Utc>>,
    pub in_progress: bool,
    pub last_error: Option<String>,
    pub refresh_count: u64,
    pub last_watermark: Option<Watermark>,
}

/// Equality predicate over grouping-dimension values, applied to
/// artifact rows after materialization. Clauses are indexed by the
/// spec's dimension positions and are ANDed together.
#[derive(Debug, Clone, Default)]
pub struct DimFilter {
    clauses: Vec<(usize, DimValue)>,
}

impl DimFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require dimension `index` to equal the given value.
    pub fn with(mut self, index: usize, value: DimValue) -> Self {
        self.clauses.push((index, value));
        self
    }

    /// Convenience: require dimension `index` to equal a concrete datum.
    pub fn value(self, index: usize, datum: impl Into<Datum>) -> Self {
        self.with(index, DimValue::Value(datum.into()))
    }

    /// Whether a row satisfies every clause. Clauses referencing
    /// out-of-range dimensions never match.
    pub fn matches(&self, row: &ArtifactRow) -> bool {
        self.clauses
            .iter()
            .all(|(idx, value)| row.dims.get(*idx) == Some(value))
    }
}

/// In-memory store of current artifacts, one per spec.
pub struct MaterializedStore {
    artifacts: RwLock<HashMap<SpecId, Arc<MaterializedArtifact>>>,
    records: RwLock<HashMap<SpecId, RefreshRecord>>,
    next_version: AtomicU64,
}

impl MaterializedStore {
    pub fn new() -> Self {
        Self {
            artifacts: RwLock::new(HashMap::new()),
            records: RwLock::new(HashMap::new()),
            next_version: AtomicU64::new(1),
        }
    }

    /// Get the current artifact. Serves the most recently completed
    /// version even while a refresh for the same spec is in flight.
    pub fn get(&self, id: SpecId) -> Result<Arc<MaterializedArtifact>> {
        self.artifacts
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| CuboidError::not_found(format!("{} has no materialized artifact", id)))
    }

    /// Read artifact rows, optionally filtered over grouping dimensions.
    pub fn query(&self, id: SpecId, filter: Option<&DimFilter>) -> Result<Vec<ArtifactRow>> {
        let artifact = self.get(id)?;
        Ok(match filter {
            None => artifact.rows.clone(),
            Some(f) => artifact
                .rows
                .iter()
                .filter(|row| f.matches(row))
                .cloned()
                .collect(),
        })
    }

    /// Install a freshly computed artifact, atomically superseding the
    /// prior version, and mark the refresh successful.
    pub fn put(
        &self,
        id: SpecId,
        rows: Vec<ArtifactRow>,
        watermark: Watermark,
        dimension_epoch: u64,
    ) -> Arc<MaterializedArtifact> {
        let artifact = Arc::new(MaterializedArtifact {
            spec_id: id,
            version: self.next_version.fetch_add(1, Ordering::SeqCst),
            refreshed_at: Utc::now(),
            watermark,
            dimension_epoch,
            rows,
        });

        // The swap is the only synchronization point with readers.
        self.artifacts.write().insert(id, artifact.clone());

        let mut records = self.records.write();
        let record = records.entry(id).or_default();
        record.last_success = Some(artifact.refreshed_at);
        record.in_progress = false;
        record.last_error = None;
        record.refresh_count += 1;
        record.last_watermark = Some(watermark);

        artifact
    }

    /// Elapsed time since the last successful refresh.
    pub fn staleness(&self, id: SpecId) -> Result<Duration> {
        let refreshed_at = self.get(id)?.refreshed_at;
        let elapsed = Utc::now().signed_duration_since(refreshed_at);
        Ok(elapsed.to_std().unwrap_or(Duration::ZERO))
    }

    /// Refresh metadata for a spec, if any refresh was ever attempted.
    pub fn record(&self, id: SpecId) -> Option<RefreshRecord> {
        self.records.read().get(&id).cloned()
    }

    /// Retire a spec's artifact and metadata.
    pub fn remove(&self, id: SpecId) {
        self.artifacts.write().remove(&id);
        self.records.write().remove(&id);
    }

    /// Spec ids with a current artifact.
    pub fn list(&self) -> Vec<SpecId> {
        let mut ids: Vec<SpecId> = self.artifacts.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Mark a refresh as started.
    pub(crate) fn mark_in_progress(&self, id: SpecId) {
        let mut records = self.records.write();
        records.entry(id).or_default().in_progress = true;
    }

    /// Record a failed refresh. The prior artifact stays untouched and
    /// remains servable.
    pub(crate) fn mark_failed(&self, id: SpecId, error: &CuboidError) {
        let mut records = self.records.write();
        let record = records.entry(id).or_default();
        record.in_progress = false;
        record.last_error = Some(error.to_string());
    }

    /// Reinstall persisted state, preserving the artifact's version.
    pub(crate) fn restore(&self, artifact: MaterializedArtifact, record: RefreshRecord) {
        let id = artifact.spec_id;
        let version = artifact.version;
        self.artifacts.write().insert(id, Arc::new(artifact));
        let mut restored = record;
        // An in-flight refresh cannot survive a restart.
        restored.in_progress = false;
        self.records.write().insert(id, restored);

        let mut next = self.next_version.load(Ordering::SeqCst);
        while next <= version {
            match self.next_version.compare_exchange(
                next,
                version + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(actual) => next = actual,
            }
        }
    }
}

impl Default for MaterializedStore {
    fn default() -> Self {
        Self::new()
    }
}
