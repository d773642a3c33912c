//! End-to-end tests exercising the public warehouse API.

use std::sync::Arc;

use cuboid::{
    AggregateFunc, AggregateSpec, AttributePath, CuboidError, DataType, Datum, DimFilter,
    DimValue, DimensionDef, FactSource, FactTableDef, Field, GroupingStrategy, Measure,
    RefreshMode, RefreshOutcome, Schema, SourceSnapshot, StarSchema, Warehouse,
    WarehouseConfig, Watermark,
};

/// fact_billing(customer_id, month_id, amount) joined to
/// customer(country, category) and month(year, quarter).
fn billing_schema() -> StarSchema {
    let fact = FactTableDef::new(
        "fact_billing",
        Schema::new(vec![
            Field::new("customer_id", DataType::Int64, false),
            Field::new("month_id", DataType::Int64, false),
            Field::new("amount", DataType::Float64, false),
        ]),
    );
    let customer = DimensionDef::new(
        "customer",
        "customer_id",
        "customer_id",
        Schema::new(vec![
            Field::new("customer_id", DataType::Int64, false),
            Field::new("country", DataType::Utf8, true),
            Field::new("category", DataType::Utf8, true),
        ]),
    );
    let month = DimensionDef::new(
        "month",
        "month_id",
        "month_id",
        Schema::new(vec![
            Field::new("month_id", DataType::Int64, false),
            Field::new("year", DataType::Int64, false),
            Field::new("quarter", DataType::Utf8, false),
        ]),
    );
    StarSchema::new(fact, vec![customer, month]).unwrap()
}

fn populated_warehouse() -> Warehouse {
    let warehouse = Warehouse::in_memory(billing_schema());
    for (id, country, category) in [(1, "US", "Gold"), (2, "US", "Silver"), (3, "DE", "Gold")] {
        warehouse
            .upsert_dimension(
                "customer",
                vec![Datum::from(id), Datum::from(country), Datum::from(category)],
            )
            .unwrap();
    }
    for (id, year, quarter) in [(202401, 2024, "Q1"), (202407, 2024, "Q3"), (202501, 2025, "Q1")] {
        warehouse
            .upsert_dimension(
                "month",
                vec![Datum::from(id), Datum::from(year), Datum::from(quarter)],
            )
            .unwrap();
    }
    warehouse
        .insert_facts(vec![
            vec![Datum::from(1), Datum::from(202401), Datum::from(100.0)],
            vec![Datum::from(2), Datum::from(202401), Datum::from(50.0)],
            vec![Datum::from(3), Datum::from(202407), Datum::from(70.0)],
            vec![Datum::from(1), Datum::from(202501), Datum::from(30.0)],
        ])
        .unwrap();
    warehouse
}

fn sum_spec(name: &str, strategy: GroupingStrategy) -> AggregateSpec {
    AggregateSpec::new(
        name,
        vec![
            AttributePath::parse("customer.country"),
            AttributePath::parse("month.year"),
        ],
        vec![
            Measure::new(AggregateFunc::Sum, "amount", "total"),
            Measure::count_star("n"),
        ],
        strategy,
    )
}

fn find_row<'a>(
    rows: &'a [cuboid::ArtifactRow],
    dims: &[DimValue],
) -> &'a cuboid::ArtifactRow {
    rows.iter()
        .find(|r| r.dims == dims)
        .unwrap_or_else(|| panic!("no row with dims {:?}", dims))
}

#[test]
fn test_flat_aggregation_by_country_and_year() {
    let warehouse = populated_warehouse();
    let id = warehouse
        .register_spec(sum_spec("flat", GroupingStrategy::Flat))
        .unwrap();
    warehouse.refresh(id, RefreshMode::Full).unwrap();

    let rows = warehouse.query(id, None).unwrap();
    assert_eq!(rows.len(), 3);

    let us_2024 = find_row(
        &rows,
        &[
            DimValue::Value(Datum::from("US")),
            DimValue::Value(Datum::from(2024)),
        ],
    );
    assert_eq!(us_2024.measures, vec![Datum::from(150.0), Datum::from(2)]);

    let de_2024 = find_row(
        &rows,
        &[
            DimValue::Value(Datum::from("DE")),
            DimValue::Value(Datum::from(2024)),
        ],
    );
    assert_eq!(de_2024.measures, vec![Datum::from(70.0), Datum::from(1)]);
}

#[test]
fn test_rollup_contains_prefix_subtotals_and_grand_total() {
    let warehouse = populated_warehouse();
    let id = warehouse
        .register_spec(sum_spec("rollup", GroupingStrategy::Rollup))
        .unwrap();
    warehouse.refresh(id, RefreshMode::Full).unwrap();

    let rows = warehouse.query(id, None).unwrap();
    // 3 full-tuple rows + 2 country subtotals + 1 grand total.
    assert_eq!(rows.len(), 6);

    let grand = find_row(&rows, &[DimValue::All, DimValue::All]);
    assert_eq!(grand.measures, vec![Datum::from(250.0), Datum::from(4)]);

    let us = find_row(&rows, &[DimValue::Value(Datum::from("US")), DimValue::All]);
    assert_eq!(us.measures, vec![Datum::from(180.0), Datum::from(3)]);

    // Canonical ordering puts the grand total first.
    assert_eq!(rows[0].dims, vec![DimValue::All, DimValue::All]);
}

#[test]
fn test_cube_is_a_superset_of_rollup() {
    let warehouse = populated_warehouse();
    let rollup_id = warehouse
        .register_spec(sum_spec("rollup", GroupingStrategy::Rollup))
        .unwrap();
    let cube_id = warehouse
        .register_spec(sum_spec("cube", GroupingStrategy::Cube))
        .unwrap();
    warehouse.refresh(rollup_id, RefreshMode::Full).unwrap();
    warehouse.refresh(cube_id, RefreshMode::Full).unwrap();

    let rollup = warehouse.query(rollup_id, None).unwrap();
    let cube = warehouse.query(cube_id, None).unwrap();
    for row in &rollup {
        assert_eq!(find_row(&cube, &row.dims).measures, row.measures);
    }
    // Year-only subtotals exist only in the cube.
    let y2024 = find_row(&cube, &[DimValue::All, DimValue::Value(Datum::from(2024))]);
    assert_eq!(y2024.measures, vec![Datum::from(220.0), Datum::from(3)]);
}

#[test]
fn test_grouping_sets_produce_exactly_the_listed_sets() {
    let warehouse = populated_warehouse();
    let id = warehouse
        .register_spec(sum_spec(
            "sets",
            GroupingStrategy::GroupingSets(vec![vec![0], vec![1]]),
        ))
        .unwrap();
    warehouse.refresh(id, RefreshMode::Full).unwrap();

    let rows = warehouse.query(id, None).unwrap();
    // 2 countries + 2 years, and no grand total: the empty set was not listed.
    assert_eq!(rows.len(), 4);
    assert!(!rows.iter().any(|r| r.dims == vec![DimValue::All, DimValue::All]));
}

#[test]
fn test_join_miss_lands_in_unknown_bucket() {
    let warehouse = populated_warehouse();
    // customer_id=99 has no dimension row.
    warehouse
        .insert_facts(vec![vec![
            Datum::from(99),
            Datum::from(202401),
            Datum::from(5.0),
        ]])
        .unwrap();

    let id = warehouse
        .register_spec(sum_spec("flat", GroupingStrategy::Flat))
        .unwrap();
    warehouse.refresh(id, RefreshMode::Full).unwrap();

    let rows = warehouse.query(id, None).unwrap();
    let unknown = find_row(
        &rows,
        &[DimValue::Unknown, DimValue::Value(Datum::from(2024))],
    );
    assert_eq!(unknown.measures, vec![Datum::from(5.0), Datum::from(1)]);

    // The unknown bucket never leaks into the known countries.
    let us_2024 = find_row(
        &rows,
        &[
            DimValue::Value(Datum::from("US")),
            DimValue::Value(Datum::from(2024)),
        ],
    );
    assert_eq!(us_2024.measures, vec![Datum::from(150.0), Datum::from(2)]);
}

#[test]
fn test_refresh_is_idempotent_without_new_facts() {
    let warehouse = populated_warehouse();
    let id = warehouse
        .register_spec(sum_spec("cube", GroupingStrategy::Cube))
        .unwrap();

    warehouse.refresh(id, RefreshMode::Full).unwrap();
    let first = warehouse.query(id, None).unwrap();
    warehouse.refresh(id, RefreshMode::Full).unwrap();
    let second = warehouse.query(id, None).unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_incremental_refresh_matches_full_recompute() {
    let warehouse = populated_warehouse();
    let inc_id = warehouse
        .register_spec(sum_spec("inc", GroupingStrategy::Rollup))
        .unwrap();
    let full_id = warehouse
        .register_spec(sum_spec("full", GroupingStrategy::Rollup))
        .unwrap();
    warehouse.refresh(inc_id, RefreshMode::Full).unwrap();

    // New facts: one for an existing group, one opening a new group.
    warehouse
        .insert_facts(vec![
            vec![Datum::from(1), Datum::from(202401), Datum::from(25.0)],
            vec![Datum::from(3), Datum::from(202501), Datum::from(10.0)],
        ])
        .unwrap();

    let outcome = warehouse.refresh(inc_id, RefreshMode::Incremental).unwrap();
    assert!(matches!(
        outcome,
        RefreshOutcome::Refreshed {
            mode: RefreshMode::Incremental,
            ..
        }
    ));
    warehouse.refresh(full_id, RefreshMode::Full).unwrap();

    assert_eq!(
        warehouse.query(inc_id, None).unwrap(),
        warehouse.query(full_id, None).unwrap()
    );
    assert_eq!(
        warehouse.artifact(inc_id).unwrap().watermark,
        warehouse.artifact(full_id).unwrap().watermark
    );
}

#[test]
fn test_incremental_refresh_reflects_dimension_updates() {
    let warehouse = populated_warehouse();
    let inc_id = warehouse
        .register_spec(sum_spec("inc", GroupingStrategy::Flat))
        .unwrap();
    let full_id = warehouse
        .register_spec(sum_spec("full", GroupingStrategy::Flat))
        .unwrap();
    warehouse.refresh(inc_id, RefreshMode::Full).unwrap();

    // Customer 1 changes country between refreshes, and a new fact
    // arrives. Historical facts now join differently, so a delta merge
    // would disagree with a recompute.
    warehouse
        .upsert_dimension(
            "customer",
            vec![Datum::from(1), Datum::from("DE"), Datum::from("Gold")],
        )
        .unwrap();
    warehouse
        .insert_facts(vec![vec![
            Datum::from(1),
            Datum::from(202401),
            Datum::from(25.0),
        ]])
        .unwrap();

    let outcome = warehouse.refresh(inc_id, RefreshMode::Incremental).unwrap();
    assert!(matches!(
        outcome,
        RefreshOutcome::Refreshed {
            mode: RefreshMode::Full,
            ..
        }
    ));
    warehouse.refresh(full_id, RefreshMode::Full).unwrap();

    let inc = warehouse.query(inc_id, None).unwrap();
    assert_eq!(inc, warehouse.query(full_id, None).unwrap());

    // Customer 1's facts all moved to DE.
    let de_2024 = find_row(
        &inc,
        &[
            DimValue::Value(Datum::from("DE")),
            DimValue::Value(Datum::from(2024)),
        ],
    );
    assert_eq!(de_2024.measures, vec![Datum::from(195.0), Datum::from(3)]);
    let us_2024 = find_row(
        &inc,
        &[
            DimValue::Value(Datum::from("US")),
            DimValue::Value(Datum::from(2024)),
        ],
    );
    assert_eq!(us_2024.measures, vec![Datum::from(50.0), Datum::from(1)]);
}

#[test]
fn test_readers_see_complete_artifacts_during_refreshes() {
    let warehouse = Arc::new(populated_warehouse());
    let id = warehouse
        .register_spec(sum_spec("flat", GroupingStrategy::Flat))
        .unwrap();
    warehouse.refresh(id, RefreshMode::Full).unwrap();

    let writer = {
        let warehouse = warehouse.clone();
        std::thread::spawn(move || {
            for i in 0..20 {
                warehouse
                    .insert_facts(vec![vec![
                        Datum::from(1),
                        Datum::from(202401),
                        Datum::from(i as f64),
                    ]])
                    .unwrap();
                warehouse.refresh(id, RefreshMode::Incremental).unwrap();
            }
        })
    };

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let warehouse = warehouse.clone();
            std::thread::spawn(move || {
                for _ in 0..200 {
                    let artifact = warehouse.artifact(id).unwrap();
                    // SUM and COUNT always come from the same snapshot.
                    let us_2024 = artifact
                        .rows
                        .iter()
                        .find(|r| {
                            r.dims
                                == vec![
                                    DimValue::Value(Datum::from("US")),
                                    DimValue::Value(Datum::from(2024)),
                                ]
                        })
                        .expect("group present");
                    assert!(matches!(us_2024.measures[1], Datum::Int64(n) if n >= 2));
                }
            })
        })
        .collect();

    writer.join().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }

    // 150 + sum(0..20) = 340 over the US/2024 group.
    let rows = warehouse.query(id, None).unwrap();
    let us_2024 = find_row(
        &rows,
        &[
            DimValue::Value(Datum::from("US")),
            DimValue::Value(Datum::from(2024)),
        ],
    );
    assert_eq!(us_2024.measures, vec![Datum::from(340.0), Datum::from(22)]);
}

/// A source that fails on command, wrapping a healthy warehouse source.
struct FlakySource {
    inner: cuboid::MemorySource,
    fail: std::sync::atomic::AtomicBool,
}

impl FactSource for FlakySource {
    fn scan_joined(&self, since: Option<Watermark>) -> cuboid::Result<SourceSnapshot> {
        if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(CuboidError::compute("simulated source outage"));
        }
        self.inner.scan_joined(since)
    }

    fn supports_watermark(&self) -> bool {
        true
    }
}

#[test]
fn test_failed_refresh_leaves_prior_artifact_servable() {
    let schema = billing_schema();
    let flaky = Arc::new(FlakySource {
        inner: cuboid::MemorySource::new(schema.clone()),
        fail: std::sync::atomic::AtomicBool::new(false),
    });
    flaky
        .inner
        .upsert_dimension(
            "customer",
            vec![Datum::from(1), Datum::from("US"), Datum::from("Gold")],
        )
        .unwrap();
    flaky
        .inner
        .insert_facts(vec![vec![
            Datum::from(1),
            Datum::from(202401),
            Datum::from(100.0),
        ]])
        .unwrap();

    let warehouse =
        Warehouse::over_source(schema, flaky.clone(), WarehouseConfig::new()).unwrap();
    let id = warehouse
        .register_spec(sum_spec("flat", GroupingStrategy::Flat))
        .unwrap();
    warehouse.refresh(id, RefreshMode::Full).unwrap();
    let before = warehouse.artifact(id).unwrap();

    flaky.fail.store(true, std::sync::atomic::Ordering::SeqCst);
    let err = warehouse.refresh(id, RefreshMode::Full).unwrap_err();
    assert!(matches!(err, CuboidError::Compute { .. }));

    // Readers are unaffected; the failure is visible in the record.
    let after = warehouse.artifact(id).unwrap();
    assert_eq!(after.version, before.version);
    assert_eq!(after.rows, before.rows);
    let record = warehouse.refresh_record(id).unwrap();
    assert!(record.last_error.is_some());
    assert!(!record.in_progress);

    // The next successful refresh clears the error.
    flaky.fail.store(false, std::sync::atomic::Ordering::SeqCst);
    warehouse.refresh(id, RefreshMode::Full).unwrap();
    assert!(warehouse.refresh_record(id).unwrap().last_error.is_none());
}

#[test]
fn test_query_filters_on_grouping_dimensions() {
    let warehouse = populated_warehouse();
    let id = warehouse
        .register_spec(sum_spec("cube", GroupingStrategy::Cube))
        .unwrap();
    warehouse.refresh(id, RefreshMode::Full).unwrap();

    let us = warehouse
        .query(id, Some(&DimFilter::new().value(0, "US")))
        .unwrap();
    // US crossed with: 2024, 2025, and the year subtotal.
    assert_eq!(us.len(), 3);
    assert!(us
        .iter()
        .all(|r| r.dims[0] == DimValue::Value(Datum::from("US"))));

    let us_total = warehouse
        .query(
            id,
            Some(&DimFilter::new().value(0, "US").with(1, DimValue::All)),
        )
        .unwrap();
    assert_eq!(us_total.len(), 1);
    assert_eq!(us_total[0].measures, vec![Datum::from(180.0), Datum::from(3)]);
}

#[test]
fn test_specs_and_artifacts_survive_restart() {
    let tmp = tempfile::TempDir::new().unwrap();
    let config = || WarehouseConfig::new().state_dir(tmp.path());

    let (flat_id, cube_id, removed_id) = {
        let warehouse = Warehouse::open(billing_schema(), config()).unwrap();
        warehouse
            .upsert_dimension(
                "customer",
                vec![Datum::from(1), Datum::from("US"), Datum::from("Gold")],
            )
            .unwrap();
        warehouse
            .upsert_dimension(
                "month",
                vec![Datum::from(202401), Datum::from(2024), Datum::from("Q1")],
            )
            .unwrap();
        warehouse
            .insert_facts(vec![vec![
                Datum::from(1),
                Datum::from(202401),
                Datum::from(100.0),
            ]])
            .unwrap();

        let flat_id = warehouse
            .register_spec(sum_spec("flat", GroupingStrategy::Flat))
            .unwrap();
        let cube_id = warehouse
            .register_spec(sum_spec("cube", GroupingStrategy::Cube))
            .unwrap();
        let removed_id = warehouse
            .register_spec(sum_spec("doomed", GroupingStrategy::Flat))
            .unwrap();
        warehouse.refresh(flat_id, RefreshMode::Full).unwrap();
        warehouse.refresh(cube_id, RefreshMode::Full).unwrap();
        warehouse.remove_spec(removed_id).unwrap();
        (flat_id, cube_id, removed_id)
    };

    let reopened = Warehouse::open(billing_schema(), config()).unwrap();
    assert_eq!(reopened.list_specs(), vec![flat_id, cube_id]);
    assert!(reopened.spec(removed_id).is_err());

    let flat = reopened.artifact(flat_id).unwrap();
    assert_eq!(flat.rows.len(), 1);
    assert_eq!(flat.rows[0].measures, vec![Datum::from(100.0), Datum::from(1)]);
    assert!(reopened.artifact(cube_id).is_ok());
    assert_eq!(reopened.refresh_record(flat_id).unwrap().refresh_count, 1);

    // A re-registered spec never reuses a persisted id.
    let next = reopened
        .register_spec(sum_spec("new", GroupingStrategy::Flat))
        .unwrap();
    assert!(next.0 > cube_id.0);
}
