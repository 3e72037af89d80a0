//! Fixtures shared by the rule tests.

use distx_core::catalog::{BucketDistributionMeta, ColumnMeta, InMemoryCatalog, StatisticsCache, TableMeta};
use distx_core::config::OptimizerConfig;
use distx_core::cost::DefaultCostModel;
use distx_core::expr::*;
use distx_core::physical::{PhysicalOp, PhysicalPlan, PlanNode};
use distx_core::plan::{CteTable, LogicalPlan, LogicalQuery};
use distx_core::rule::OptContext;
use distx_core::search::Optimizer;
use distx_core::stats::ColumnStatistic;
use std::sync::Arc;

pub(crate) fn v(id: u32) -> ColumnRef {
    ColumnRef::new(id, format!("v{}", id))
}

fn bucketed_table(name: &str, first: u32, rows: u64, catalog: &mut InMemoryCatalog) {
    let table = TableRef::new("test", name);
    let mut meta = TableMeta::new(
        table.clone(),
        (first..first + 3)
            .map(|i| ColumnMeta::key(format!("v{}", i)))
            .collect(),
    );
    meta.distribution = Some(BucketDistributionMeta {
        columns: vec![format!("v{}", first)],
        buckets: 3,
        colocate_group: None,
    });
    catalog.add_table(meta);
    catalog.set_row_count(&table, rows);
}

/// `test.t0(v1, v2, v3)` and `test.t1(v4, v5, v6)`, bucketed by their first column
/// into 3 buckets, both holding `rows` rows.
pub(crate) fn t0_catalog(rows: u64) -> InMemoryCatalog {
    let mut catalog = InMemoryCatalog::new();
    bucketed_table("t0", 1, rows, &mut catalog);
    bucketed_table("t1", 4, rows, &mut catalog);
    catalog
}

/// Set a uniform column statistic with the given distinct count.
pub(crate) fn set_ndv(catalog: &mut InMemoryCatalog, table: &str, column: &str, ndv: f64) {
    catalog.set_column_statistic(
        &TableRef::new("test", table),
        column,
        ColumnStatistic::new(0.0, ndv, 0.0, 8.0, ndv),
    );
}

pub(crate) fn t0_scan() -> LogicalPlan {
    LogicalPlan::scan(ScanOp::new(TableRef::new("test", "t0"), vec![v(1), v(2), v(3)]))
}

pub(crate) fn t1_scan() -> LogicalPlan {
    LogicalPlan::scan(ScanOp::new(TableRef::new("test", "t1"), vec![v(4), v(5), v(6)]))
}

pub(crate) fn optimize(catalog: &InMemoryCatalog, plan: LogicalPlan, config: &OptimizerConfig) -> PhysicalPlan {
    let optimizer = Optimizer::new(
        Arc::new(crate::default_rule_registry()),
        Arc::new(DefaultCostModel::default()),
        Arc::new(catalog.clone()),
        Arc::new(catalog.clone()),
    );
    optimizer
        .optimize_physical(&LogicalQuery::new(plan), config)
        .expect("optimization failed")
}

/// First node (pre-order) whose operator matches.
pub(crate) fn find_op<'a>(node: &'a PlanNode, pred: impl Fn(&PhysicalOp) -> bool) -> Option<&'a PlanNode> {
    node.find(&|n: &PlanNode| pred(&n.op))
}

/// Every node whose operator matches, in pre-order.
pub(crate) fn collect_ops<'a>(node: &'a PlanNode, pred: &impl Fn(&PhysicalOp) -> bool) -> Vec<&'a PlanNode> {
    let mut out = Vec::new();
    if pred(&node.op) {
        out.push(node);
    }
    for child in &node.children {
        out.extend(collect_ops(child, pred));
    }
    out
}

/// Run `f` with a fresh optimization context over `catalog`.
pub(crate) fn with_context<R>(
    catalog: &InMemoryCatalog,
    config: &OptimizerConfig,
    f: impl FnOnce(&mut OptContext) -> R,
) -> R {
    let cost_model = DefaultCostModel::default();
    let mut ctx = OptContext::new(
        catalog,
        StatisticsCache::new(catalog),
        config,
        &cost_model,
        ColumnFactory::starting_after(ColumnId(100)),
        CteTable::new(),
    );
    f(&mut ctx)
}
