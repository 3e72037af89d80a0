//! End-to-end plan tests: build a logical query over an in-memory catalog, run
//! the optimizer with the built-in rules, and check the resulting EXPLAIN text
//! and fragment structure.

use distx_core::catalog::*;
use distx_core::config::OptimizerConfig;
use distx_core::cost::DefaultCostModel;
use distx_core::error::OptimizerError;
use distx_core::explain::{explain, ExplainLevel};
use distx_core::expr::*;
use distx_core::fragment::{DataSink, DistributedPlan, FragmentId};
use distx_core::physical::{JoinDistribution, PhysicalOp, PlanNode};
use distx_core::plan::{LogicalPlan, LogicalQuery};
use distx_core::search::Optimizer;
use distx_core::stats::ColumnStatistic;
use std::sync::Arc;

fn col(id: u32, name: &str) -> ColumnRef {
    ColumnRef::new(id, name)
}

/// Add `test.<name>` with key columns `names`, holding `rows` rows, optionally
/// bucketed by its first column into 3 buckets.
fn add_table(catalog: &mut InMemoryCatalog, name: &str, names: &[&str], rows: u64, bucket: Option<Option<&str>>) {
    let table = TableRef::new("test", name);
    let mut meta = TableMeta::new(
        table.clone(),
        names.iter().map(|n| ColumnMeta::key(*n)).collect(),
    );
    meta.distribution = bucket.map(|group| BucketDistributionMeta {
        columns: vec![names[0].to_string()],
        buckets: 3,
        colocate_group: group.map(str::to_string),
    });
    catalog.add_table(meta);
    catalog.set_row_count(&table, rows);
}

fn scan(table: &str, columns: &[(u32, &str)]) -> LogicalPlan {
    LogicalPlan::scan(ScanOp::new(
        TableRef::new("test", table),
        columns.iter().map(|(id, name)| col(*id, name)).collect(),
    ))
}

fn join(left: LogicalPlan, right: LogicalPlan, l: &ColumnRef, r: &ColumnRef) -> LogicalPlan {
    LogicalPlan::join(
        JoinType::Inner,
        Some(Expr::eq(Expr::col(l), Expr::col(r))),
        left,
        right,
    )
}

fn optimizer(catalog: &InMemoryCatalog) -> Optimizer {
    Optimizer::new(
        Arc::new(distx_rules::default_rule_registry()),
        Arc::new(DefaultCostModel::default()),
        Arc::new(catalog.clone()),
        Arc::new(catalog.clone()),
    )
}

fn optimize(catalog: &InMemoryCatalog, query: LogicalQuery, config: &OptimizerConfig) -> DistributedPlan {
    optimizer(catalog).optimize(&query, config).expect("optimization failed")
}

fn nodes<'a>(plan: &'a DistributedPlan, pred: impl Fn(&PhysicalOp) -> bool) -> Vec<&'a PlanNode> {
    let mut found = Vec::new();
    plan.visit(&mut |n| {
        if pred(&n.op) {
            found.push(n);
        }
    });
    found
}

fn join_distributions(plan: &DistributedPlan) -> Vec<JoinDistribution> {
    nodes(plan, |op| matches!(op, PhysicalOp::HashJoin { .. }))
        .into_iter()
        .filter_map(|n| match &n.op {
            PhysicalOp::HashJoin { distribution, .. } => Some(*distribution),
            _ => None,
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Grouping sets
// ---------------------------------------------------------------------------

fn repeat_over_t0(grouping_sets: Vec<Vec<ColumnId>>) -> LogicalQuery {
    LogicalQuery::new(LogicalPlan::new(
        LogicalOp::Repeat {
            repeat_columns: vec![col(1, "v1"), col(2, "v2")],
            grouping_sets,
            grouping_id: col(4, "GROUPING_ID"),
        },
        vec![scan("t0", &[(1, "v1"), (2, "v2"), (3, "v3")])],
    ))
}

#[test]
fn test_repeat_cardinality_is_rows_times_grouping_sets() {
    let mut catalog = InMemoryCatalog::new();
    add_table(&mut catalog, "t0", &["v1", "v2", "v3"], 10_000, None);
    let config = OptimizerConfig::default();

    // ROLLUP(v1, v2)
    let rollup = repeat_over_t0(vec![vec![ColumnId(1), ColumnId(2)], vec![ColumnId(1)], vec![]]);
    let plan = optimize(&catalog, rollup, &config);
    let repeat = nodes(&plan, |op| matches!(op, PhysicalOp::Repeat { .. }));
    assert_eq!(repeat.len(), 1);
    assert_eq!(repeat[0].stats.row_count, 30_000.0);
    let text = explain(&plan, ExplainLevel::Costs);
    assert!(text.contains("cardinality: 30000"), "{}", text);

    // CUBE(v1, v2)
    let cube = repeat_over_t0(vec![
        vec![ColumnId(1), ColumnId(2)],
        vec![ColumnId(1)],
        vec![ColumnId(2)],
        vec![],
    ]);
    let plan = optimize(&catalog, cube, &config);
    let repeat = nodes(&plan, |op| matches!(op, PhysicalOp::Repeat { .. }));
    assert_eq!(repeat[0].stats.row_count, 40_000.0);
}

// ---------------------------------------------------------------------------
// Aggregation staging
// ---------------------------------------------------------------------------

fn sum_by_v2(ndv: f64) -> (InMemoryCatalog, LogicalQuery) {
    let mut catalog = InMemoryCatalog::new();
    add_table(&mut catalog, "t0", &["v1", "v2", "v3"], 10_000, None);
    let table = TableRef::new("test", "t0");
    catalog.set_column_statistic(&table, "v2", ColumnStatistic::new(0.0, ndv, 0.0, 8.0, ndv));
    catalog.set_column_statistic(&table, "v3", ColumnStatistic::new(0.0, 1000.0, 0.0, 8.0, 1000.0));
    let query = LogicalQuery::new(LogicalPlan::aggregate(
        vec![col(2, "v2")],
        vec![AggExpr::new(AggFunc::Sum, Expr::col(&col(3, "v3")), col(4, "sum"))],
        scan("t0", &[(1, "v1"), (2, "v2"), (3, "v3")]),
    ));
    (catalog, query)
}

#[test]
fn test_low_cardinality_aggregation_is_one_phase() {
    let (catalog, query) = sum_by_v2(100.0);
    let text = explain(&optimize(&catalog, query, &OptimizerConfig::default()), ExplainLevel::Normal);
    assert!(text.contains("AGGREGATE (update finalize)"), "{}", text);
    assert!(!text.contains("merge finalize"), "{}", text);
    assert!(text.contains("HASH_PARTITIONED: 2: v2"), "{}", text);
}

#[test]
fn test_high_cardinality_aggregation_streams_local_stage() {
    let (catalog, query) = sum_by_v2(7000.0);
    let text = explain(&optimize(&catalog, query, &OptimizerConfig::default()), ExplainLevel::Normal);
    assert!(text.contains("AGGREGATE (merge finalize)"), "{}", text);
    assert!(text.contains("AGGREGATE (update serialize)"), "{}", text);
    assert!(text.contains("STREAMING"), "{}", text);
    assert!(text.contains("output: sum(4: sum)"), "{}", text);
}

// ---------------------------------------------------------------------------
// Join distribution
// ---------------------------------------------------------------------------

#[test]
fn test_same_colocate_group_joins_locally() {
    let mut catalog = InMemoryCatalog::new();
    add_table(&mut catalog, "a", &["a1", "a2"], 100_000, Some(Some("g1")));
    add_table(&mut catalog, "b", &["b1", "b2"], 100_000, Some(Some("g1")));
    let (a1, b1) = (col(1, "a1"), col(3, "b1"));
    let query = LogicalQuery::new(join(
        scan("a", &[(1, "a1"), (2, "a2")]),
        scan("b", &[(3, "b1"), (4, "b2")]),
        &a1,
        &b1,
    ));
    let plan = optimize(&catalog, query, &OptimizerConfig::default());
    assert_eq!(join_distributions(&plan), vec![JoinDistribution::Colocate]);
    let text = explain(&plan, ExplainLevel::Normal);
    assert!(text.contains("join op: INNER JOIN (COLOCATE)"), "{}", text);
    assert!(text.contains("colocate: true"), "{}", text);
    // nothing moves below the join: scans and join share one fragment
    assert_eq!(plan.fragments.len(), 2);
}

#[test]
fn test_different_groups_fall_back_to_bucket_shuffle() {
    let mut catalog = InMemoryCatalog::new();
    add_table(&mut catalog, "a", &["a1", "a2"], 100_000, Some(Some("g1")));
    add_table(&mut catalog, "b", &["b1", "b2"], 100_000, Some(Some("g2")));
    let (a1, b1) = (col(1, "a1"), col(3, "b1"));
    let query = LogicalQuery::new(join(
        scan("a", &[(1, "a1"), (2, "a2")]),
        scan("b", &[(3, "b1"), (4, "b2")]),
        &a1,
        &b1,
    ));
    let plan = optimize(&catalog, query, &OptimizerConfig::default());
    assert_eq!(join_distributions(&plan), vec![JoinDistribution::BucketShuffle]);
    let text = explain(&plan, ExplainLevel::Normal);
    assert!(
        text.contains("colocate: false, reason: inputs are not in the same colocate group"),
        "{}",
        text
    );
    assert!(text.contains("BUCKET_SHUFFLE_HASH_PARTITIONED"), "{}", text);
}

#[test]
fn test_unbucketed_small_table_is_broadcast() {
    let mut catalog = InMemoryCatalog::new();
    add_table(&mut catalog, "fact", &["f1", "f2"], 1_000_000, None);
    add_table(&mut catalog, "dim", &["d1", "d2"], 100, None);
    let (f1, d1) = (col(1, "f1"), col(3, "d1"));
    let query = LogicalQuery::new(join(
        scan("dim", &[(3, "d1"), (4, "d2")]),
        scan("fact", &[(1, "f1"), (2, "f2")]),
        &d1,
        &f1,
    ));
    let plan = optimize(&catalog, query, &OptimizerConfig::default());
    let joins = nodes(&plan, |op| matches!(op, PhysicalOp::HashJoin { .. }));
    assert_eq!(joins.len(), 1);
    let PhysicalOp::HashJoin {
        distribution,
        eq_keys,
        runtime_filters,
        ..
    } = &joins[0].op
    else {
        unreachable!();
    };
    assert_eq!(*distribution, JoinDistribution::Broadcast);
    // the big table probes, the small one is built and broadcast
    assert_eq!(eq_keys[0].0, f1);
    assert_eq!(runtime_filters.len(), 1);
    assert!(!runtime_filters[0].is_remote);

    let text = explain(&plan, ExplainLevel::Normal);
    assert!(text.contains("- filter_id = 0, build_expr = (3: d1), remote = false"), "{}", text);
    assert!(text.contains("- filter_id = 0, probe_expr = (1: f1)"), "{}", text);
}

#[test]
fn test_unknown_row_count_falls_back_to_shuffle() {
    let mut catalog = InMemoryCatalog::new();
    add_table(&mut catalog, "fact", &["f1", "f2"], 10_000, None);
    // no row count: the scan's size is a guess
    catalog.add_table(TableMeta::new(
        TableRef::new("test", "mystery"),
        vec![ColumnMeta::key("m1"), ColumnMeta::key("m2")],
    ));
    let (f1, m1) = (col(1, "f1"), col(3, "m1"));
    let query = LogicalQuery::new(join(
        scan("fact", &[(1, "f1"), (2, "f2")]),
        scan("mystery", &[(3, "m1"), (4, "m2")]),
        &f1,
        &m1,
    ));
    let plan = optimize(&catalog, query, &OptimizerConfig::default());
    assert_eq!(join_distributions(&plan), vec![JoinDistribution::Shuffle]);
    let text = explain(&plan, ExplainLevel::Normal);
    assert!(text.contains("join op: INNER JOIN (PARTITIONED)"), "{}", text);
}

#[test]
fn test_join_with_empty_input_estimates_no_rows() {
    let mut catalog = InMemoryCatalog::new();
    add_table(&mut catalog, "empty", &["e1", "e2"], 0, None);
    add_table(&mut catalog, "t", &["v1", "v2"], 500, None);
    let (e1, v1) = (col(1, "e1"), col(3, "v1"));
    let query = LogicalQuery::new(join(
        scan("empty", &[(1, "e1"), (2, "e2")]),
        scan("t", &[(3, "v1"), (4, "v2")]),
        &e1,
        &v1,
    ));
    let plan = optimize(&catalog, query, &OptimizerConfig::default());
    let joins = nodes(&plan, |op| matches!(op, PhysicalOp::HashJoin { .. }));
    assert_eq!(joins.len(), 1);
    assert_eq!(joins[0].stats.row_count, 0.0);
}

// ---------------------------------------------------------------------------
// Runtime filters and CTEs
// ---------------------------------------------------------------------------

/// CTE 1 = scan(t0); two consumers, each in one branch of a UNION ALL. The first
/// consumer is always joined with `dim`; the second only when `join_both` is set.
fn cte_union(join_both: bool) -> (InMemoryCatalog, LogicalQuery, OptimizerConfig) {
    let mut catalog = InMemoryCatalog::new();
    add_table(&mut catalog, "t0", &["v1", "v2"], 100_000, None);
    add_table(&mut catalog, "dim", &["d1", "d2"], 10, None);

    let consumer = |first: u32| {
        LogicalPlan::new(
            LogicalOp::CteConsumer {
                cte_id: CteId(1),
                columns: vec![(col(first, "v1"), ColumnId(1)), (col(first + 1, "v2"), ColumnId(2))],
            },
            vec![],
        )
    };
    let first = join(
        consumer(11),
        scan("dim", &[(31, "d1"), (32, "d2")]),
        &col(11, "v1"),
        &col(31, "d1"),
    );
    let (second, second_input) = if join_both {
        let plan = join(
            consumer(21),
            scan("dim", &[(41, "d1"), (42, "d2")]),
            &col(21, "v1"),
            &col(41, "d1"),
        );
        (plan, vec![col(21, "v1"), col(41, "d1")])
    } else {
        let plan = LogicalPlan::project(
            vec![(col(21, "v1"), Expr::col(&col(21, "v1"))), (col(43, "d1"), Expr::col(&col(22, "v2")))],
            consumer(21),
        );
        (plan, vec![col(21, "v1"), col(43, "d1")])
    };
    let union = LogicalPlan::new(
        LogicalOp::SetOperation {
            kind: SetOpKind::UnionAll,
            output: vec![col(50, "v1"), col(51, "d1")],
            inputs: vec![vec![col(11, "v1"), col(31, "d1")], second_input],
        },
        vec![first, second],
    );
    let query = LogicalQuery::new(union).with_cte(1, scan("t0", &[(1, "v1"), (2, "v2")]));
    let config = OptimizerConfig {
        cte_reuse_ratio_threshold: 0.0,
        ..Default::default()
    };
    (catalog, query, config)
}

fn probe_filters_on(plan: &DistributedPlan, pred: impl Fn(&PhysicalOp) -> bool) -> usize {
    nodes(plan, pred)
        .into_iter()
        .map(|n| match &n.op {
            PhysicalOp::OlapScan { runtime_filters, .. } | PhysicalOp::CteConsumer { runtime_filters, .. } => {
                runtime_filters.len()
            }
            _ => 0,
        })
        .sum()
}

#[test]
fn test_filter_on_one_cte_consumer_stays_at_that_consumer() {
    let (catalog, query, config) = cte_union(false);
    let plan = optimize(&catalog, query, &config);

    let producer_scan = |op: &PhysicalOp| matches!(op, PhysicalOp::OlapScan { table, .. } if table.name == "t0");
    assert_eq!(probe_filters_on(&plan, producer_scan), 0);
    assert_eq!(probe_filters_on(&plan, |op| matches!(op, PhysicalOp::CteConsumer { .. })), 1);

    let text = explain(&plan, ExplainLevel::Normal);
    assert!(text.contains("MULTI CAST DATA SINK"), "{}", text);
    assert!(text.contains("- filter_id = 0, probe_expr = (11: v1)"), "{}", text);
}

#[test]
fn test_filters_on_every_cte_consumer_reach_the_producer() {
    let (catalog, query, config) = cte_union(true);
    let plan = optimize(&catalog, query, &config);

    assert_eq!(probe_filters_on(&plan, |op| matches!(op, PhysicalOp::CteConsumer { .. })), 0);
    let scans = nodes(&plan, |op| matches!(op, PhysicalOp::OlapScan { table, .. } if table.name == "t0"));
    assert_eq!(scans.len(), 1);
    let PhysicalOp::OlapScan { runtime_filters, .. } = &scans[0].op else {
        unreachable!();
    };
    assert_eq!(runtime_filters.len(), 1);
    assert_eq!(runtime_filters[0].filter_ids.len(), 2);
    assert_eq!(runtime_filters[0].probe_expr, Expr::col(&col(1, "v1")));
}

// ---------------------------------------------------------------------------
// Set operations
// ---------------------------------------------------------------------------

/// `t0(v1)` with 1000 rows and 100 distinct values, `t1(v1)` with 400 rows and
/// 50 distinct values.
fn set_op_catalog() -> InMemoryCatalog {
    let mut catalog = InMemoryCatalog::new();
    for (name, rows, ndv) in [("t0", 1000, 100.0), ("t1", 400, 50.0)] {
        add_table(&mut catalog, name, &["v1"], rows, None);
        catalog.set_column_statistic(
            &TableRef::new("test", name),
            "v1",
            ColumnStatistic::new(0.0, ndv, 0.0, 8.0, ndv),
        );
    }
    catalog
}

fn set_op_rows(kind: SetOpKind) -> f64 {
    let query = LogicalQuery::new(LogicalPlan::new(
        LogicalOp::SetOperation {
            kind,
            output: vec![col(10, "v1")],
            inputs: vec![vec![col(1, "v1")], vec![col(2, "v1")]],
        },
        vec![scan("t0", &[(1, "v1")]), scan("t1", &[(2, "v1")])],
    ));
    let plan = optimize(&set_op_catalog(), query, &OptimizerConfig::default());
    let set_ops = nodes(&plan, |op| matches!(op, PhysicalOp::SetOperation { .. }));
    assert_eq!(set_ops.len(), 1);
    set_ops[0].stats.row_count
}

#[test]
fn test_set_operation_cardinality() {
    // smallest input scaled by the distinct-value containment 50/100
    assert_eq!(set_op_rows(SetOpKind::Intersect), 200.0);
    // left input minus the overlapping half
    assert_eq!(set_op_rows(SetOpKind::Except), 500.0);
    assert_eq!(set_op_rows(SetOpKind::UnionAll), 1400.0);
}

#[test]
fn test_runtime_filter_reaches_every_union_branch() {
    let mut catalog = InMemoryCatalog::new();
    add_table(&mut catalog, "a", &["a1", "a2"], 100_000, None);
    add_table(&mut catalog, "b", &["b1", "b2"], 100_000, None);
    add_table(&mut catalog, "dim", &["d1", "d2"], 10, None);
    let union = LogicalPlan::new(
        LogicalOp::SetOperation {
            kind: SetOpKind::UnionAll,
            output: vec![col(10, "u1")],
            inputs: vec![vec![col(1, "a1")], vec![col(3, "b1")]],
        },
        vec![scan("a", &[(1, "a1"), (2, "a2")]), scan("b", &[(3, "b1"), (4, "b2")])],
    );
    let query = LogicalQuery::new(join(
        union,
        scan("dim", &[(5, "d1"), (6, "d2")]),
        &col(10, "u1"),
        &col(5, "d1"),
    ));
    let plan = optimize(&catalog, query, &OptimizerConfig::default());
    assert_eq!(join_distributions(&plan), vec![JoinDistribution::Broadcast]);

    for (table, probe) in [("a", col(1, "a1")), ("b", col(3, "b1"))] {
        let scans = nodes(&plan, |op| matches!(op, PhysicalOp::OlapScan { table: t, .. } if t.name == table));
        assert_eq!(scans.len(), 1);
        let PhysicalOp::OlapScan { runtime_filters, .. } = &scans[0].op else {
            unreachable!();
        };
        assert_eq!(runtime_filters.len(), 1, "{}", table);
        assert_eq!(runtime_filters[0].filter_ids.len(), 1);
        assert_eq!(runtime_filters[0].probe_expr, Expr::col(&probe));
    }
}

// ---------------------------------------------------------------------------
// Rollups
// ---------------------------------------------------------------------------

fn sales_catalog(rollup_rows: [u64; 2]) -> InMemoryCatalog {
    let mut catalog = InMemoryCatalog::new();
    let table = TableRef::new("test", "sales");
    let mut meta = TableMeta::new(
        table.clone(),
        vec![
            ColumnMeta::key("region"),
            ColumnMeta::key("city"),
            ColumnMeta::value("amount", StorageAggType::Sum),
        ],
    );
    meta.keys_type = KeysType::Aggregate;
    let by_region = |name: &str, rows: u64| RollupMeta {
        name: name.to_string(),
        keys_type: KeysType::Aggregate,
        key_columns: vec!["region".to_string()],
        value_columns: vec![RollupValueColumn {
            name: "amount".to_string(),
            agg: StorageAggType::Sum,
            source: "amount".to_string(),
        }],
        row_count: Some(rows),
    };
    // declared out of name order on purpose
    meta.rollups = vec![by_region("r_region_b", rollup_rows[1]), by_region("r_region_a", rollup_rows[0])];
    catalog.add_table(meta);
    catalog.set_row_count(&table, 50_000);
    catalog
}

fn amount_by_region() -> LogicalQuery {
    LogicalQuery::new(LogicalPlan::aggregate(
        vec![col(1, "region")],
        vec![AggExpr::new(AggFunc::Sum, Expr::col(&col(3, "amount")), col(4, "sum"))],
        scan("sales", &[(1, "region"), (2, "city"), (3, "amount")]),
    ))
}

fn rollup_line(text: &str) -> Option<&str> {
    text.lines().map(str::trim).find(|l| l.starts_with("rollup: "))
}

#[test]
fn test_rollup_ties_break_by_name() {
    let catalog = sales_catalog([20, 20]);
    let text = explain(
        &optimize(&catalog, amount_by_region(), &OptimizerConfig::default()),
        ExplainLevel::Normal,
    );
    assert_eq!(rollup_line(&text), Some("rollup: r_region_a"));
    // keyed exactly on the group-by: storage merges, no aggregation node
    assert!(text.contains("PREAGGREGATION: OFF. Reason: None aggregate function"), "{}", text);
    assert!(!text.contains(":AGGREGATE"), "{}", text);
}

#[test]
fn test_smallest_rollup_wins() {
    let catalog = sales_catalog([30, 20]);
    let text = explain(
        &optimize(&catalog, amount_by_region(), &OptimizerConfig::default()),
        ExplainLevel::Normal,
    );
    assert_eq!(rollup_line(&text), Some("rollup: r_region_b"));
}

#[test]
fn test_rollup_as_large_as_base_keeps_base() {
    let catalog = sales_catalog([50_000, 50_000]);
    let text = explain(
        &optimize(&catalog, amount_by_region(), &OptimizerConfig::default()),
        ExplainLevel::Normal,
    );
    assert_eq!(rollup_line(&text), Some("rollup: sales"));
    assert!(text.contains("PREAGGREGATION: ON"), "{}", text);
}

#[test]
fn test_group_by_outside_rollup_key_prefix_reads_base() {
    let mut catalog = InMemoryCatalog::new();
    let table = TableRef::new("test", "sales");
    let mut meta = TableMeta::new(
        table.clone(),
        vec![
            ColumnMeta::key("region"),
            ColumnMeta::key("city"),
            ColumnMeta::value("amount", StorageAggType::Sum),
        ],
    );
    meta.keys_type = KeysType::Aggregate;
    meta.rollups = vec![RollupMeta {
        name: "r_region_city".to_string(),
        keys_type: KeysType::Aggregate,
        key_columns: vec!["region".to_string(), "city".to_string()],
        value_columns: vec![RollupValueColumn {
            name: "amount".to_string(),
            agg: StorageAggType::Sum,
            source: "amount".to_string(),
        }],
        row_count: Some(20),
    }];
    catalog.add_table(meta);
    catalog.set_row_count(&table, 50_000);

    let query = LogicalQuery::new(LogicalPlan::aggregate(
        vec![col(2, "city")],
        vec![AggExpr::new(AggFunc::Sum, Expr::col(&col(3, "amount")), col(4, "sum"))],
        scan("sales", &[(1, "region"), (2, "city"), (3, "amount")]),
    ));
    let text = explain(&optimize(&catalog, query, &OptimizerConfig::default()), ExplainLevel::Normal);
    assert_eq!(rollup_line(&text), Some("rollup: sales"));
    assert!(text.contains("PREAGGREGATION: ON"), "{}", text);
}

// ---------------------------------------------------------------------------
// Fragments
// ---------------------------------------------------------------------------

#[test]
fn test_fragments_are_numbered_children_first() {
    let mut catalog = InMemoryCatalog::new();
    add_table(&mut catalog, "a", &["a1", "a2"], 100_000, None);
    add_table(&mut catalog, "b", &["b1", "b2"], 100_000, None);
    let query = LogicalQuery::new(LogicalPlan::new(
        LogicalOp::Join {
            join_type: JoinType::Inner,
            condition: Some(Expr::eq(Expr::col(&col(1, "a1")), Expr::col(&col(3, "b1")))),
            hint: JoinHint::Shuffle,
        },
        vec![scan("a", &[(1, "a1"), (2, "a2")]), scan("b", &[(3, "b1"), (4, "b2")])],
    ));
    let plan = optimize(&catalog, query, &OptimizerConfig::default());

    // two scan fragments, the partitioned join, the result
    assert_eq!(plan.fragments.len(), 4);
    for (index, fragment) in plan.fragments.iter().enumerate() {
        assert_eq!(fragment.id, FragmentId(index as u32));
        if let DataSink::Stream { destination, .. } = &fragment.sink {
            assert!(*destination > fragment.id);
            assert!(plan.fragment(*destination).is_some());
        }
    }
    let result = plan.result_fragment().expect("result fragment");
    assert_eq!(result.sink, DataSink::Result);
    assert_eq!(result.id, FragmentId(3));

    let text = explain(&plan, ExplainLevel::Normal);
    assert!(text.starts_with("PLAN FRAGMENT 3"), "{}", text);
    assert!(text.contains("join op: INNER JOIN (PARTITIONED)"), "{}", text);
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

fn small_catalog() -> InMemoryCatalog {
    let mut catalog = InMemoryCatalog::new();
    add_table(&mut catalog, "t0", &["v1", "v2"], 10, None);
    catalog
}

fn consumer_of(cte: u32, out: u32, source: u32) -> LogicalPlan {
    LogicalPlan::new(
        LogicalOp::CteConsumer {
            cte_id: CteId(cte),
            columns: vec![(col(out, "c"), ColumnId(source))],
        },
        vec![],
    )
}

#[test]
fn test_invalid_inputs_are_user_errors() {
    let catalog = small_catalog();
    let optimizer = optimizer(&catalog);
    let config = OptimizerConfig::default();

    let cyclic = LogicalQuery::new(consumer_of(1, 20, 10))
        .with_cte(1, consumer_of(2, 10, 11))
        .with_cte(2, consumer_of(1, 11, 10));
    let err = optimizer.optimize(&cyclic, &config).expect_err("cycle");
    assert!(matches!(err, OptimizerError::CyclicCte(_)), "{:?}", err);

    let unknown = LogicalQuery::new(consumer_of(7, 20, 1));
    let err = optimizer.optimize(&unknown, &config).expect_err("unknown cte");
    assert!(matches!(err, OptimizerError::UnknownCte(CteId(7))), "{:?}", err);

    let dangling = LogicalQuery::new(LogicalPlan::filter(
        Expr::eq(Expr::col(&col(99, "ghost")), Expr::int(1)),
        scan("t0", &[(1, "v1"), (2, "v2")]),
    ));
    let err = optimizer.optimize(&dangling, &config).expect_err("dangling column");
    assert!(
        matches!(err, OptimizerError::DanglingColumn { column: ColumnId(99), .. }),
        "{:?}",
        err
    );

    let inverted = OptimizerConfig {
        low_cardinality_threshold: 0.9,
        high_cardinality_threshold: 0.1,
        ..Default::default()
    };
    let query = LogicalQuery::new(scan("t0", &[(1, "v1")]));
    let err = optimizer.optimize(&query, &inverted).expect_err("bad config");
    assert!(matches!(err, OptimizerError::Config(_)), "{:?}", err);

    for err in [
        OptimizerError::UnknownCte(CteId(1)),
        OptimizerError::Config(String::new()),
    ] {
        assert!(err.is_user_error());
    }
    assert!(!OptimizerError::Internal(String::new()).is_user_error());
}
