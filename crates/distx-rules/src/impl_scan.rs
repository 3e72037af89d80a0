//! # Scan Implementation Rule
//!
//! Maps a logical Scan to a physical `OlapScan`. Besides the one-to-one mapping,
//! this is where the storage-facing decisions that need table metadata are made:
//!
//! - **Predicate classification**: conjuncts referencing only partition columns
//!   are separated from row-level conjuncts ([`ScanOperatorPredicates`]).
//! - **Partition pruning**: every partition whose values provably fail a partition
//!   conjunct is dropped; EXPLAIN prints the survivors as `partitions=k/n`.
//! - **Index choice for plain scans**: a scan not claimed by the rollup matcher
//!   (no aggregation above it) may still read a smaller duplicate-keyed rollup that
//!   stores every column it needs.
//! - **Pre-aggregation**: a plain scan of an aggregate-keyed table must let the
//!   storage engine merge rows, so pre-aggregation is switched off.
//! - **Bucket layout**: when every bucket column is scanned, the output is
//!   hash-distributed by the storage bucket function. This is what colocate and
//!   bucket-shuffle joins, and colocated aggregations, build on.

use distx_core::catalog::{KeysType, TableMeta};
use distx_core::error::Result;
use distx_core::expr::*;
use distx_core::pattern::Pattern;
use distx_core::physical::{PhysicalOp, PlanNode};
use distx_core::plan::LogicalPlan;
use distx_core::properties::{BucketSpec, HashDistribution, HashSource};
use distx_core::rule::{OptContext, Rule, RuleType};
use distx_core::stats::{Statistics, StatisticsSource};
use std::cmp::Ordering;
use tracing::trace;

/// Reason recorded when rows of an aggregate-keyed index are read without an
/// aggregation that could merge them.
pub const NO_AGGREGATE_REASON: &str = "None aggregate function";

/// Implement a logical scan as an OLAP scan.
pub struct ImplOlapScanRule;

impl Rule for ImplOlapScanRule {
    fn name(&self) -> &str {
        "ImplOlapScan"
    }

    fn rule_type(&self) -> RuleType {
        RuleType::Implementation
    }

    fn pattern(&self) -> Pattern {
        Pattern::scan()
    }

    fn implement(
        &self,
        plan: &LogicalPlan,
        _children: &[PlanNode],
        stats: &Statistics,
        ctx: &mut OptContext,
    ) -> Result<Vec<PlanNode>> {
        let LogicalOp::Scan(scan) = &plan.op else {
            return Ok(vec![]);
        };
        let catalog = ctx.catalog;
        let meta = catalog.table(&scan.table);

        let mut scan = scan.clone();
        let mut stats = stats.clone();
        if scan.rollup.is_none() {
            if let Some(meta) = meta {
                if let Some(rollup) = select_detail_index(&scan, meta, ctx) {
                    scan.rollup = Some(rollup);
                    stats = ctx.scan_statistics(&scan);
                }
            }
        }

        let partition_columns = meta.map(|m| m.partition_columns.clone()).unwrap_or_default();
        let mut predicates = ScanOperatorPredicates::classify(&scan, &partition_columns);
        if let Some(meta) = meta.filter(|m| !m.partitions.is_empty()) {
            predicates.selected_partitions = Some(prune_partitions(meta, &scan, &predicates.partition_conjuncts));
        }

        let pre_aggregation = scan
            .pre_aggregation
            .clone()
            .unwrap_or_else(|| default_pre_aggregation(meta));
        let rollup = scan.rollup.clone().unwrap_or_else(|| scan.table.name.clone());
        let bucket = meta.and_then(|m| bucket_distribution(&scan, m));
        trace!(
            "Scan {} reads index {} ({:.0} rows, bucketed={})",
            scan.table,
            rollup,
            stats.row_count,
            bucket.is_some()
        );

        let node = ctx.make_node(
            PhysicalOp::OlapScan {
                table: scan.table.clone(),
                columns: scan.columns.clone(),
                predicates,
                rollup,
                pre_aggregation,
                bucket,
                runtime_filters: Vec::new(),
            },
            vec![],
            stats,
        );
        Ok(vec![node])
    }
}

fn default_pre_aggregation(meta: Option<&TableMeta>) -> PreAggregation {
    match meta.map(|m| m.keys_type) {
        Some(KeysType::Aggregate) => PreAggregation::Off {
            reason: NO_AGGREGATE_REASON.to_string(),
        },
        _ => PreAggregation::On,
    }
}

/// Smallest duplicate-keyed rollup storing every scanned column, if one is smaller
/// than the base table. Ties keep the base table.
fn select_detail_index(scan: &ScanOp, meta: &TableMeta, ctx: &OptContext) -> Option<String> {
    if meta.keys_type != KeysType::Duplicate {
        return None;
    }
    let base_rows = ctx.statistics.table_row_count(&scan.table);
    let rows = |r: Option<u64>| r.or(base_rows).map(|r| r as f64).unwrap_or(f64::INFINITY);
    let base = rows(base_rows);

    meta.rollups
        .iter()
        .filter(|r| r.keys_type == KeysType::Duplicate)
        .filter(|r| scan.columns.iter().all(|c| r.has_column(&c.name)))
        .map(|r| (rows(r.row_count), r.key_columns.len() + r.value_columns.len(), r.name.as_str()))
        .filter(|(rows, _, _)| *rows < base)
        .min_by(|a, b| {
            a.0.total_cmp(&b.0)
                .then(a.1.cmp(&b.1))
                .then_with(|| a.2.cmp(b.2))
        })
        .map(|(_, _, name)| name.to_string())
}

/// Storage bucketing of the scan output, when all bucket columns are scanned.
fn bucket_distribution(scan: &ScanOp, meta: &TableMeta) -> Option<HashDistribution> {
    let dist = meta.distribution.as_ref()?;
    let columns = dist
        .columns
        .iter()
        .map(|name| scan.columns.iter().find(|c| &c.name == name).cloned())
        .collect::<Option<Vec<_>>>()?;
    if columns.is_empty() {
        return None;
    }
    Some(HashDistribution {
        columns,
        source: HashSource::Bucket(BucketSpec {
            group: dist
                .colocate_group
                .clone()
                .unwrap_or_else(|| meta.table.to_string()),
            buckets: dist.buckets,
        }),
    })
}

/// Partition ids that may contain matching rows, and the total partition count.
fn prune_partitions(meta: &TableMeta, scan: &ScanOp, conjuncts: &[Expr]) -> (Vec<u64>, usize) {
    let selected = meta
        .partitions
        .iter()
        .filter(|partition| {
            let value_of = |id: ColumnId| -> Option<&ScalarValue> {
                let name = scan.column_name(id)?;
                let index = meta.partition_columns.iter().position(|p| p == name)?;
                partition.values.get(index)
            };
            conjuncts
                .iter()
                .all(|c| evaluate(c, &value_of) != Some(false))
        })
        .map(|p| p.id)
        .collect();
    (selected, meta.partitions.len())
}

/// Evaluate a partition conjunct against one partition's values. `None` means the
/// outcome cannot be decided statically.
fn evaluate<'a>(expr: &Expr, value_of: &impl Fn(ColumnId) -> Option<&'a ScalarValue>) -> Option<bool> {
    match expr {
        Expr::And(exprs) => {
            let mut result = Some(true);
            for e in exprs {
                match evaluate(e, value_of) {
                    Some(false) => return Some(false),
                    None => result = None,
                    Some(true) => {}
                }
            }
            result
        }
        Expr::Or(exprs) => {
            let mut result = Some(false);
            for e in exprs {
                match evaluate(e, value_of) {
                    Some(true) => return Some(true),
                    None => result = None,
                    Some(false) => {}
                }
            }
            result
        }
        Expr::InList {
            expr,
            list,
            negated,
        } => {
            let Expr::Column(c) = expr.as_ref() else {
                return None;
            };
            let value = value_of(c.id)?;
            let mut decided = true;
            for item in list {
                match value.partial_cmp(item) {
                    Some(Ordering::Equal) => return Some(!*negated),
                    Some(_) => {}
                    None => decided = false,
                }
            }
            decided.then_some(*negated)
        }
        other => {
            let (column, op, literal) = other.as_column_comparison()?;
            let ordering = value_of(column.id)?.partial_cmp(literal)?;
            Some(match op {
                BinaryOp::Eq => ordering == Ordering::Equal,
                BinaryOp::NotEq => ordering != Ordering::Equal,
                BinaryOp::Lt => ordering == Ordering::Less,
                BinaryOp::LtEq => ordering != Ordering::Greater,
                BinaryOp::Gt => ordering == Ordering::Greater,
                BinaryOp::GtEq => ordering != Ordering::Less,
                _ => return None,
            })
        }
    }
}
