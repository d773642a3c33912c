//! Refresh coordinator: decides when and how an artifact is recomputed
//! and guarantees serving consistency while it happens.
//!
//! Each spec cycles `IDLE -> REFRESHING -> IDLE`, with a failed refresh
//! recording its error and leaving the prior artifact servable. At most
//! one refresh per spec is in flight; a request that arrives while one
//! is running is coalesced into it, not queued.
//! Different specs refresh concurrently — there is no cross-spec lock.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::engine::{AggregationEngine, Materialization};
use crate::error::Result;
use crate::registry::{AggregateSpec, SpecId, SpecRegistry};
use crate::store::MaterializedStore;
use crate::storage::FactSource;

/// Requested refresh strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshMode {
    /// Recompute the entire artifact from a full scan
    Full,
    /// Recompute only groups touched by newly appended facts and merge
    /// into the existing artifact. Falls back to full when the source
    /// has no watermark support, the spec has a non-decomposable
    /// measure (AVG), no prior artifact exists, or dimension rows were
    /// updated since the prior artifact.
    Incremental,
}

/// What a refresh call actually did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// A new artifact version was installed
    Refreshed {
        version: u64,
        rows: usize,
        /// The mode that actually ran (incremental may fall back)
        mode: RefreshMode,
    },
    /// A refresh for this spec was already in flight; this request was
    /// folded into it and did no work
    Coalesced,
    /// The spec was removed while the refresh ran; the computed result
    /// was discarded
    Retired,
}

/// The one-method abstraction external drivers talk to: a timer-based
/// scheduler, a change-data-capture listener, and a manual CLI all call
/// `on_trigger` without the coordinator depending on any of them.
pub trait RefreshTrigger: Send + Sync {
    fn on_trigger(&self, id: SpecId) -> Result<RefreshOutcome>;
}

/// Coordinates artifact recomputation per spec.
pub struct RefreshCoordinator {
    registry: Arc<SpecRegistry>,
    store: Arc<MaterializedStore>,
    source: Arc<dyn FactSource>,
    /// Per-spec in-flight locks; try-lock failure means coalesce
    in_flight: Mutex<HashMap<SpecId, Arc<Mutex<()>>>>,
    /// Mode used when driven through the trigger interface
    prefer_incremental: bool,
}

impl RefreshCoordinator {
    pub fn new(
        registry: Arc<SpecRegistry>,
        store: Arc<MaterializedStore>,
        source: Arc<dyn FactSource>,
    ) -> Self {
        Self {
            registry,
            store,
            source,
            in_flight: Mutex::new(HashMap::new()),
            prefer_incremental: true,
        }
    }

    /// Set whether trigger-driven refreshes prefer the incremental path.
    pub fn with_prefer_incremental(mut self, prefer: bool) -> Self {
        self.prefer_incremental = prefer;
        self
    }

    /// Run (or coalesce into) a refresh for one spec.
    ///
    /// Runs synchronously: the caller observes the refresh's own
    /// success or failure. A failure is also recorded in the spec's
    /// `RefreshRecord`; concurrent readers keep seeing the prior
    /// artifact either way. No retry policy is imposed here — callers
    /// own their backoff.
    pub fn refresh(&self, id: SpecId, mode: RefreshMode) -> Result<RefreshOutcome> {
        let spec = self.registry.get(id)?;
        let lock = self.spec_lock(id);

        let Some(_guard) = lock.try_lock() else {
            debug!(spec = %id, "refresh already in flight, coalescing");
            return Ok(RefreshOutcome::Coalesced);
        };

        self.store.mark_in_progress(id);
        match self.run(&spec, id, mode) {
            Ok(outcome) => {
                if let RefreshOutcome::Refreshed {
                    version,
                    rows,
                    mode,
                } = outcome
                {
                    info!(
                        spec = %id,
                        name = %spec.name,
                        version,
                        rows,
                        ?mode,
                        "artifact refreshed"
                    );
                }
                if outcome == RefreshOutcome::Retired {
                    debug!(spec = %id, "spec removed mid-refresh, result discarded");
                }
                Ok(outcome)
            }
            Err(err) => {
                warn!(spec = %id, name = %spec.name, error = %err, "refresh failed");
                self.store.mark_failed(id, &err);
                Err(err)
            }
        }
    }

    /// Retire a spec: wait out any in-flight refresh, then drop its
    /// lock. The registry entry must already be gone when this is
    /// called so a refresh that has not yet taken the lock fails its
    /// lookup instead of starting.
    pub(crate) fn retire(&self, id: SpecId) {
        let lock = self.in_flight.lock().remove(&id);
        if let Some(lock) = lock {
            drop(lock.lock());
        }
    }

    fn spec_lock(&self, id: SpecId) -> Arc<Mutex<()>> {
        self.in_flight.lock().entry(id).or_default().clone()
    }

    fn run(&self, spec: &AggregateSpec, id: SpecId, mode: RefreshMode) -> Result<RefreshOutcome> {
        let mode = self.effective_mode(spec, id, mode);

        let (result, mode) = match mode {
            RefreshMode::Full => (
                AggregationEngine::compute(spec, self.source.as_ref())?,
                RefreshMode::Full,
            ),
            RefreshMode::Incremental => {
                // effective_mode guarantees a prior artifact exists
                let prior = self.store.get(id)?;
                let delta =
                    AggregationEngine::compute_delta(spec, self.source.as_ref(), prior.watermark)?;
                if delta.dimension_epoch != prior.dimension_epoch {
                    // Dimension rows were overwritten since the prior
                    // artifact; historical facts may join differently
                    // now, so the delta cannot be merged.
                    debug!(spec = %id, "dimension rows changed since last refresh, recomputing fully");
                    (
                        AggregationEngine::compute(spec, self.source.as_ref())?,
                        RefreshMode::Full,
                    )
                } else {
                    let merged = AggregationEngine::merge_delta(spec, &prior.rows, delta.rows)?;
                    (
                        Materialization {
                            rows: merged,
                            watermark: delta.watermark,
                            dimension_epoch: delta.dimension_epoch,
                        },
                        RefreshMode::Incremental,
                    )
                }
            }
        };

        // The spec may have been retired while we computed; installing
        // the artifact now would resurrect it. Finish the retirement
        // instead.
        if self.registry.get(id).is_err() {
            self.store.remove(id);
            return Ok(RefreshOutcome::Retired);
        }

        let row_count = result.rows.len();
        let artifact = self
            .store
            .put(id, result.rows, result.watermark, result.dimension_epoch);
        Ok(RefreshOutcome::Refreshed {
            version: artifact.version,
            rows: row_count,
            mode,
        })
    }

    fn effective_mode(&self, spec: &AggregateSpec, id: SpecId, requested: RefreshMode) -> RefreshMode {
        if requested == RefreshMode::Full {
            return RefreshMode::Full;
        }
        if !self.source.supports_watermark() {
            debug!(spec = %id, "source has no watermark support, falling back to full refresh");
            return RefreshMode::Full;
        }
        if !spec.is_decomposable() {
            debug!(spec = %id, "spec has non-decomposable measures, falling back to full refresh");
            return RefreshMode::Full;
        }
        if self.store.get(id).is_err() {
            return RefreshMode::Full;
        }
        RefreshMode::Incremental
    }
}

impl RefreshTrigger for RefreshCoordinator {
    fn on_trigger(&self, id: SpecId) -> Result<RefreshOutcome> {
        let mode = if self.prefer_incremental {
            RefreshMode::Incremental
        } else {
            RefreshMode::Full
        };
        self.refresh(id, mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CuboidError;
    use crate::model::test_fixtures::billing_schema;
    use crate::model::AttributePath;
    use crate::registry::{AggregateFunc, GroupingStrategy, Measure};
    use crate::storage::{MemorySource, SourceSnapshot, Watermark};
    use crate::types::Datum;

    fn setup() -> (Arc<SpecRegistry>, Arc<MaterializedStore>, Arc<MemorySource>) {
        let schema = billing_schema();
        let source = Arc::new(MemorySource::new(schema.clone()));
        source
            .upsert_dimension(
                "customer",
                vec![Datum::from(1), Datum::from("US"), Datum::from("Gold")],
            )
            .unwrap();
        source
            .upsert_dimension(
                "month",
                vec![Datum::from(1), Datum::from(2024), Datum::from("Q1")],
            )
            .unwrap();
        source
            .insert_facts(vec![vec![
                Datum::from(1),
                Datum::from(1),
                Datum::from(100.0),
            ]])
            .unwrap();
        (
            Arc::new(SpecRegistry::new(schema)),
            Arc::new(MaterializedStore::new()),
            source,
        )
    }

    fn sum_by_country() -> AggregateSpec {
        AggregateSpec::new(
            "sum_by_country",
            vec![AttributePath::parse("customer.country")],
            vec![Measure::new(AggregateFunc::Sum, "amount", "total")],
            GroupingStrategy::Flat,
        )
    }

    #[test]
    fn test_full_refresh_installs_artifact() {
        let (registry, store, source) = setup();
        let id = registry.register(sum_by_country()).unwrap();
        let coordinator = RefreshCoordinator::new(registry, store.clone(), source);

        let outcome = coordinator.refresh(id, RefreshMode::Full).unwrap();
        assert!(matches!(
            outcome,
            RefreshOutcome::Refreshed {
                rows: 1,
                mode: RefreshMode::Full,
                ..
            }
        ));
        assert_eq!(store.get(id).unwrap().rows.len(), 1);
    }

    #[test]
    fn test_incremental_falls_back_without_prior_artifact() {
        let (registry, store, source) = setup();
        let id = registry.register(sum_by_country()).unwrap();
        let coordinator = RefreshCoordinator::new(registry, store, source);

        let outcome = coordinator.refresh(id, RefreshMode::Incremental).unwrap();
        assert!(matches!(
            outcome,
            RefreshOutcome::Refreshed {
                mode: RefreshMode::Full,
                ..
            }
        ));
    }

    #[test]
    fn test_incremental_refresh_after_append() {
        let (registry, store, source) = setup();
        let id = registry.register(sum_by_country()).unwrap();
        let coordinator = RefreshCoordinator::new(registry, store.clone(), source.clone());

        coordinator.refresh(id, RefreshMode::Full).unwrap();
        source
            .insert_facts(vec![vec![
                Datum::from(1),
                Datum::from(1),
                Datum::from(50.0),
            ]])
            .unwrap();

        let outcome = coordinator.refresh(id, RefreshMode::Incremental).unwrap();
        assert!(matches!(
            outcome,
            RefreshOutcome::Refreshed {
                mode: RefreshMode::Incremental,
                ..
            }
        ));

        let artifact = store.get(id).unwrap();
        assert_eq!(artifact.rows[0].measures, vec![Datum::from(150.0)]);
        assert_eq!(artifact.watermark, 2);
    }

    #[test]
    fn test_dimension_update_invalidates_incremental_path() {
        let (registry, store, source) = setup();
        let id = registry.register(sum_by_country()).unwrap();
        let coordinator = RefreshCoordinator::new(registry, store.clone(), source.clone());
        coordinator.refresh(id, RefreshMode::Full).unwrap();

        // Customer 1 moves from US to DE; one more fact arrives.
        source
            .upsert_dimension(
                "customer",
                vec![Datum::from(1), Datum::from("DE"), Datum::from("Gold")],
            )
            .unwrap();
        source
            .insert_facts(vec![vec![
                Datum::from(1),
                Datum::from(1),
                Datum::from(50.0),
            ]])
            .unwrap();

        // Merging the delta would leave the old fact under US; the
        // coordinator must notice the dimension change and recompute.
        let outcome = coordinator.refresh(id, RefreshMode::Incremental).unwrap();
        assert!(matches!(
            outcome,
            RefreshOutcome::Refreshed {
                mode: RefreshMode::Full,
                ..
            }
        ));

        let artifact = store.get(id).unwrap();
        assert_eq!(artifact.rows.len(), 1);
        assert_eq!(
            artifact.rows[0].dims,
            vec![crate::engine::DimValue::Value(Datum::from("DE"))]
        );
        assert_eq!(artifact.rows[0].measures, vec![Datum::from(150.0)]);
    }

    #[test]
    fn test_avg_spec_never_refreshes_incrementally() {
        let (registry, store, source) = setup();
        let spec = AggregateSpec::new(
            "avg_by_country",
            vec![AttributePath::parse("customer.country")],
            vec![Measure::new(AggregateFunc::Avg, "amount", "avg")],
            GroupingStrategy::Flat,
        );
        let id = registry.register(spec).unwrap();
        let coordinator = RefreshCoordinator::new(registry, store, source);

        coordinator.refresh(id, RefreshMode::Full).unwrap();
        let outcome = coordinator.refresh(id, RefreshMode::Incremental).unwrap();
        assert!(matches!(
            outcome,
            RefreshOutcome::Refreshed {
                mode: RefreshMode::Full,
                ..
            }
        ));
    }

    /// Source that always fails, for failure-isolation tests.
    struct FailingSource;

    impl FactSource for FailingSource {
        fn scan_joined(&self, _since: Option<Watermark>) -> crate::error::Result<SourceSnapshot> {
            Err(CuboidError::compute("storage collaborator is down"))
        }
    }

    #[test]
    fn test_failed_refresh_keeps_prior_artifact() {
        let (registry, store, source) = setup();
        let id = registry.register(sum_by_country()).unwrap();

        // Populate via the healthy source first.
        let coordinator = RefreshCoordinator::new(registry.clone(), store.clone(), source);
        coordinator.refresh(id, RefreshMode::Full).unwrap();
        let before = store.get(id).unwrap();

        // Now the collaborator goes down.
        let failing = RefreshCoordinator::new(registry, store.clone(), Arc::new(FailingSource));
        let err = failing.refresh(id, RefreshMode::Full).unwrap_err();
        assert!(matches!(err, CuboidError::Compute { .. }));

        let after = store.get(id).unwrap();
        assert_eq!(after.version, before.version);
        assert_eq!(after.rows, before.rows);

        let record = store.record(id).unwrap();
        assert!(record.last_error.is_some());
        assert!(!record.in_progress);
    }

    #[test]
    fn test_refresh_unknown_spec() {
        let (registry, store, source) = setup();
        let coordinator = RefreshCoordinator::new(registry, store, source);
        let err = coordinator.refresh(SpecId(99), RefreshMode::Full).unwrap_err();
        assert!(matches!(err, CuboidError::NotFound { .. }));
    }

    /// Source whose scans park on a barrier so a test can hold a
    /// refresh in flight deterministically.
    struct GatedSource {
        inner: Arc<MemorySource>,
        gate: std::sync::Barrier,
    }

    impl FactSource for GatedSource {
        fn scan_joined(&self, since: Option<Watermark>) -> crate::error::Result<SourceSnapshot> {
            self.gate.wait();
            self.inner.scan_joined(since)
        }

        fn supports_watermark(&self) -> bool {
            true
        }
    }

    #[test]
    fn test_concurrent_refreshes_coalesce() {
        let (registry, store, source) = setup();
        let id = registry.register(sum_by_country()).unwrap();
        let gated = Arc::new(GatedSource {
            inner: source,
            gate: std::sync::Barrier::new(2),
        });
        let coordinator = Arc::new(RefreshCoordinator::new(
            registry,
            store.clone(),
            gated.clone(),
        ));

        let worker = {
            let coordinator = coordinator.clone();
            std::thread::spawn(move || coordinator.refresh(id, RefreshMode::Full))
        };

        // Wait until the worker is inside the refresh critical section.
        while !store.record(id).map(|r| r.in_progress).unwrap_or(false) {
            std::thread::yield_now();
        }

        let outcome = coordinator.refresh(id, RefreshMode::Full).unwrap();
        assert_eq!(outcome, RefreshOutcome::Coalesced);

        // Release the gated scan and let the worker finish.
        gated.gate.wait();
        let worker_outcome = worker.join().unwrap().unwrap();
        assert!(matches!(worker_outcome, RefreshOutcome::Refreshed { .. }));
        assert_eq!(store.get(id).unwrap().rows.len(), 1);
    }

    #[test]
    fn test_remove_during_refresh_discards_result() {
        let (registry, store, source) = setup();
        let id = registry.register(sum_by_country()).unwrap();
        let gated = Arc::new(GatedSource {
            inner: source,
            gate: std::sync::Barrier::new(2),
        });
        let coordinator = Arc::new(RefreshCoordinator::new(
            registry.clone(),
            store.clone(),
            gated.clone(),
        ));

        let worker = {
            let coordinator = coordinator.clone();
            std::thread::spawn(move || coordinator.refresh(id, RefreshMode::Full))
        };
        while !store.record(id).map(|r| r.in_progress).unwrap_or(false) {
            std::thread::yield_now();
        }

        // The spec is removed while the worker's scan is parked. Once
        // released, the worker must discard its result rather than
        // reinstall an artifact for a spec that no longer exists.
        registry.remove(id).unwrap();
        gated.gate.wait();
        coordinator.retire(id);
        store.remove(id);

        assert_eq!(worker.join().unwrap().unwrap(), RefreshOutcome::Retired);
        assert!(store.get(id).is_err());
        assert!(store.record(id).is_none());
    }
}
