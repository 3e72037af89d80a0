//! # Rollup Selection
//!
//! An aggregate over a scan (optionally through a projection of plain columns) can
//! often be answered from a rollup: a pre-aggregated or narrower copy of the table
//! kept by the storage layer. This rule enumerates the base index and every rollup,
//! keeps the ones that can answer the query, and points the scan at the one with
//! the fewest rows.
//!
//! An index can answer the query when:
//!
//! - every group-by and predicate column is a key of the index (any stored column
//!   of a duplicate-keyed index);
//! - every aggregate is derivable from what the index stores:
//!
//! | query aggregate          | aggregate-keyed index stores        | rewritten as     |
//! |--------------------------|-------------------------------------|------------------|
//! | `min(k)`, `max(k)`       | key `k`                             | unchanged        |
//! | `agg(DISTINCT k)`        | key `k`                             | unchanged        |
//! | `sum(x)`                 | `SUM` column of `x`                 | `sum(column)`    |
//! | `max(x)` / `min(x)`      | `MAX` / `MIN` column of `x`         | same function    |
//! | `count(x)`               | `COUNT` column of `x`               | `sum(column)`    |
//!
//! Ties on the row estimate go to the base table, then to the narrower index, then
//! to the lexicographically smaller name, so the choice is deterministic.
//!
//! When the chosen aggregate-keyed index is keyed on exactly the group-by columns,
//! every stored row is already one group: the aggregate is replaced by a projection
//! and the storage engine merges rows on read (pre-aggregation off).

use crate::impl_scan::NO_AGGREGATE_REASON;
use distx_core::catalog::{KeysType, RollupMeta, StorageAggType, TableMeta};
use distx_core::error::Result;
use distx_core::expr::*;
use distx_core::pattern::Pattern;
use distx_core::plan::LogicalPlan;
use distx_core::rule::{OptContext, Rule, RuleType};
use std::collections::HashSet;
use tracing::debug;

pub struct RollupSelectionRule;

impl Rule for RollupSelectionRule {
    fn name(&self) -> &str {
        "RollupSelection"
    }

    fn rule_type(&self) -> RuleType {
        RuleType::Transformation
    }

    fn pattern(&self) -> Pattern {
        Pattern::aggregate()
    }

    fn transform(&self, plan: &LogicalPlan, ctx: &mut OptContext) -> Result<Option<LogicalPlan>> {
        let LogicalOp::Aggregate {
            group_by,
            aggregates,
        } = &plan.op
        else {
            return Ok(None);
        };
        let Some(child) = plan.children.first() else {
            return Ok(None);
        };
        let Some(input) = AggregateInput::of(child) else {
            return Ok(None);
        };
        if input.scan.rollup.is_some() {
            return Ok(None);
        }
        let catalog = ctx.catalog;
        let Some(meta) = catalog.table(&input.scan.table) else {
            return Ok(None);
        };

        let Some(query) = QueryShape::resolve(&input, group_by, aggregates) else {
            return Ok(None);
        };
        let base_rows = ctx.statistics.table_row_count(&input.scan.table);
        let Some((index, derivations)) = select_index(meta, base_rows, &query) else {
            debug!(
                "No index of {} answers the aggregation; reading the base table",
                input.scan.table
            );
            return Ok(Some(fallback_to_base(plan, &input, meta)));
        };
        debug!("Aggregation over {} reads index {}", input.scan.table, index.name);

        let mut rewriter = Rewriter {
            input: input.clone(),
            extra_scan_columns: Vec::new(),
        };
        let new_aggregates: Vec<AggExpr> = aggregates
            .iter()
            .zip(&derivations)
            .map(|(agg, derivation)| rewriter.apply(agg, derivation, ctx))
            .collect();

        let eliminated = index.keys_type == KeysType::Aggregate
            && same_names(&index.key_columns, &query.group_names)
            && aggregates.iter().all(|a| {
                !a.distinct
                    && matches!(a.func, AggFunc::Sum | AggFunc::Min | AggFunc::Max | AggFunc::Count)
            });

        let pre_aggregation = if eliminated {
            PreAggregation::Off {
                reason: NO_AGGREGATE_REASON.to_string(),
            }
        } else {
            PreAggregation::On
        };
        let new_child = rewriter.build_child(&index.name, pre_aggregation, group_by, &new_aggregates);

        if eliminated {
            let mut exprs: Vec<(ColumnRef, Expr)> =
                group_by.iter().map(|g| (g.clone(), Expr::col(g))).collect();
            for agg in &new_aggregates {
                let value = agg.arg.clone().unwrap_or_else(|| Expr::col(&agg.output));
                exprs.push((agg.output.clone(), value));
            }
            debug!("Index {} is keyed on the group-by; aggregate eliminated", index.name);
            return Ok(Some(LogicalPlan::project(exprs, new_child)));
        }
        Ok(Some(LogicalPlan::aggregate(
            group_by.clone(),
            new_aggregates,
            new_child,
        )))
    }
}

/// The scan below an aggregate and the optional column-only projection between them.
#[derive(Clone)]
struct AggregateInput {
    scan: ScanOp,
    project: Option<Vec<(ColumnRef, Expr)>>,
}

impl AggregateInput {
    fn of(child: &LogicalPlan) -> Option<Self> {
        match &child.op {
            LogicalOp::Scan(scan) => Some(Self {
                scan: scan.clone(),
                project: None,
            }),
            LogicalOp::Project { exprs } if exprs.iter().all(|(_, e)| matches!(e, Expr::Column(_))) => {
                match child.children.first().map(|c| &c.op) {
                    Some(LogicalOp::Scan(scan)) => Some(Self {
                        scan: scan.clone(),
                        project: Some(exprs.clone()),
                    }),
                    _ => None,
                }
            }
            _ => None,
        }
    }

    /// The scan column an aggregate-level column reads.
    fn scan_column(&self, id: ColumnId) -> Option<&ColumnRef> {
        let id = match &self.project {
            None => id,
            Some(exprs) => match exprs.iter().find(|(out, _)| out.id == id) {
                Some((_, Expr::Column(c))) => c.id,
                _ => return None,
            },
        };
        self.scan.columns.iter().find(|c| c.id == id)
    }

    fn storage_name(&self, id: ColumnId) -> Option<String> {
        self.scan_column(id).map(|c| c.name.clone())
    }
}

/// What one aggregate needs from an index.
enum AggNeed {
    CountStar,
    Column {
        func: AggFunc,
        name: String,
        distinct: bool,
    },
    /// Aggregate over a computed expression of these stored columns.
    Expr(Vec<String>),
}

/// How an aggregate is computed from the chosen index.
#[derive(Debug, Clone, PartialEq)]
enum Derivation {
    Keep,
    Reaggregate { func: AggFunc, storage: String },
}

struct QueryShape {
    group_names: Vec<String>,
    predicate_names: Vec<String>,
    needs: Vec<AggNeed>,
}

impl QueryShape {
    fn resolve(input: &AggregateInput, group_by: &[ColumnRef], aggregates: &[AggExpr]) -> Option<Self> {
        let group_names = group_by
            .iter()
            .map(|g| input.storage_name(g.id))
            .collect::<Option<Vec<_>>>()?;
        let mut predicate_names: Vec<String> = Vec::new();
        for predicate in &input.scan.predicates {
            for column in predicate.columns() {
                let name = input.scan.column_name(column.id)?.to_string();
                if !predicate_names.contains(&name) {
                    predicate_names.push(name);
                }
            }
        }
        let needs = aggregates
            .iter()
            .map(|a| match &a.arg {
                None => Some(AggNeed::CountStar),
                Some(Expr::Column(c)) => Some(AggNeed::Column {
                    func: a.func,
                    name: input.storage_name(c.id)?,
                    distinct: a.distinct,
                }),
                Some(other) => other
                    .columns()
                    .iter()
                    .map(|c| input.storage_name(c.id))
                    .collect::<Option<Vec<_>>>()
                    .map(AggNeed::Expr),
            })
            .collect::<Option<Vec<_>>>()?;
        Some(Self {
            group_names,
            predicate_names,
            needs,
        })
    }
}

/// Pick the smallest index that answers the query, with the derivation of every
/// aggregate from it.
fn select_index(meta: &TableMeta, base_rows: Option<u64>, query: &QueryShape) -> Option<(RollupMeta, Vec<Derivation>)> {
    let base = meta.base_index(base_rows);
    let candidates = std::iter::once((true, base)).chain(meta.rollups.iter().map(|r| (false, r.clone())));

    candidates
        .filter_map(|(is_base, index)| {
            if !is_base && !leads_with_group_by(&index, query) {
                return None;
            }
            let derivations = answers(&index, query)?;
            let rows = index.row_count.or(base_rows).unwrap_or(u64::MAX);
            Some(((rows, !is_base, index_width(&index), index.name.clone()), index, derivations))
        })
        .min_by(|a, b| a.0.cmp(&b.0))
        .map(|(_, index, derivations)| (index, derivations))
}

fn index_width(index: &RollupMeta) -> usize {
    index.key_columns.len() + index.value_columns.len()
}

/// A rollup is sorted and aggregated by its key columns in order, so the group-by
/// columns must be exactly its leading keys.
fn leads_with_group_by(index: &RollupMeta, query: &QueryShape) -> bool {
    let group: HashSet<&str> = query.group_names.iter().map(String::as_str).collect();
    index.key_columns.len() >= group.len()
        && index.key_columns[..group.len()]
            .iter()
            .map(String::as_str)
            .collect::<HashSet<_>>()
            == group
}

fn answers(index: &RollupMeta, query: &QueryShape) -> Option<Vec<Derivation>> {
    let keyed = |name: &String| match index.keys_type {
        KeysType::Aggregate => index.has_key(name),
        KeysType::Duplicate => index.has_column(name),
    };
    if !query.group_names.iter().all(keyed) || !query.predicate_names.iter().all(keyed) {
        return None;
    }
    query.needs.iter().map(|need| derive(index, need)).collect()
}

fn derive(index: &RollupMeta, need: &AggNeed) -> Option<Derivation> {
    match (index.keys_type, need) {
        (KeysType::Duplicate, AggNeed::CountStar) => Some(Derivation::Keep),
        (KeysType::Duplicate, AggNeed::Column { name, .. }) => index.has_column(name).then_some(Derivation::Keep),
        (KeysType::Duplicate, AggNeed::Expr(names)) => {
            names.iter().all(|n| index.has_column(n)).then_some(Derivation::Keep)
        }
        (KeysType::Aggregate, AggNeed::CountStar | AggNeed::Expr(_)) => None,
        (
            KeysType::Aggregate,
            AggNeed::Column {
                func,
                name,
                distinct,
            },
        ) => {
            let on_key = index.has_key(name);
            let identity = matches!(
                func,
                AggFunc::Min | AggFunc::Max | AggFunc::MultiDistinctCount | AggFunc::MultiDistinctSum
            );
            if on_key && (*distinct || identity) {
                return Some(Derivation::Keep);
            }
            if *distinct {
                return None;
            }
            let (stored, combinator) = match func {
                AggFunc::Sum => (StorageAggType::Sum, AggFunc::Sum),
                AggFunc::Max => (StorageAggType::Max, AggFunc::Max),
                AggFunc::Min => (StorageAggType::Min, AggFunc::Min),
                AggFunc::Count => (StorageAggType::Count, AggFunc::Sum),
                _ => return None,
            };
            let column = index.value_column(name, stored)?;
            if combinator == *func && column.name == *name {
                Some(Derivation::Keep)
            } else {
                Some(Derivation::Reaggregate {
                    func: combinator,
                    storage: column.name.clone(),
                })
            }
        }
    }
}

fn same_names(a: &[String], b: &[String]) -> bool {
    let a: HashSet<&String> = a.iter().collect();
    let b: HashSet<&String> = b.iter().collect();
    a == b
}

/// Rebuilds the aggregate's input against the chosen index.
struct Rewriter {
    input: AggregateInput,
    /// Stored columns the rewritten aggregates read that the scan did not output.
    extra_scan_columns: Vec<ColumnRef>,
}

impl Rewriter {
    fn apply(&mut self, agg: &AggExpr, derivation: &Derivation, ctx: &mut OptContext) -> AggExpr {
        let Derivation::Reaggregate { func, storage } = derivation else {
            return agg.clone();
        };
        let column = match self
            .input
            .scan
            .columns
            .iter()
            .chain(&self.extra_scan_columns)
            .find(|c| &c.name == storage)
        {
            Some(existing) => existing.clone(),
            None => {
                let fresh = ctx.create_column(storage.clone());
                self.extra_scan_columns.push(fresh.clone());
                fresh
            }
        };
        // Through a projection the stored column is passed up under its own id.
        let arg = match &self.input.project {
            Some(exprs) => exprs
                .iter()
                .find(|(_, e)| matches!(e, Expr::Column(c) if c.id == column.id))
                .map(|(out, _)| Expr::col(out))
                .unwrap_or_else(|| Expr::col(&column)),
            None => Expr::col(&column),
        };
        AggExpr {
            func: *func,
            arg: Some(arg),
            distinct: false,
            output: agg.output.clone(),
        }
    }

    /// The scan (and projection) reading only the columns the aggregate needs.
    fn build_child(
        self,
        index: &str,
        pre_aggregation: PreAggregation,
        group_by: &[ColumnRef],
        aggregates: &[AggExpr],
    ) -> LogicalPlan {
        let mut used: HashSet<ColumnId> = group_by.iter().map(|g| g.id).collect();
        for agg in aggregates {
            used.extend(agg.arg_columns().iter().map(|c| c.id));
        }

        let Rewriter {
            input,
            extra_scan_columns,
        } = self;
        let mut scan = input.scan.clone();
        let mut all_columns = scan.columns.clone();
        all_columns.extend(extra_scan_columns.iter().cloned());

        let project = input.project.map(|exprs| {
            let mut kept: Vec<(ColumnRef, Expr)> =
                exprs.into_iter().filter(|(out, _)| used.contains(&out.id)).collect();
            for extra in &extra_scan_columns {
                if used.contains(&extra.id) {
                    kept.push((extra.clone(), Expr::col(extra)));
                }
            }
            kept
        });

        let mut scan_used: HashSet<ColumnId> = match &project {
            Some(exprs) => exprs.iter().flat_map(|(_, e)| e.column_ids()).collect(),
            None => used.clone(),
        };
        for predicate in &scan.predicates {
            scan_used.extend(predicate.column_ids());
        }
        let mut columns: Vec<ColumnRef> = all_columns
            .iter()
            .filter(|c| scan_used.contains(&c.id))
            .cloned()
            .collect();
        if columns.is_empty() {
            // count(*) still needs one column to count rows of.
            columns.extend(all_columns.first().cloned());
        }
        scan.columns = columns;
        scan.rollup = Some(index.to_string());
        scan.pre_aggregation = Some(pre_aggregation);

        let scan = LogicalPlan::scan(scan);
        match project {
            Some(exprs) => LogicalPlan::project(exprs, scan),
            None => scan,
        }
    }
}

/// No index answers the aggregates: read the base table and let storage merge rows.
fn fallback_to_base(plan: &LogicalPlan, input: &AggregateInput, meta: &TableMeta) -> LogicalPlan {
    let mut scan = input.scan.clone();
    scan.rollup = Some(meta.table.name.clone());
    scan.pre_aggregation = Some(match meta.keys_type {
        KeysType::Aggregate => PreAggregation::Off {
            reason: "Aggregate functions do not match the stored aggregation".to_string(),
        },
        KeysType::Duplicate => PreAggregation::On,
    });
    let scan = LogicalPlan::scan(scan);
    let child = match &input.project {
        Some(exprs) => LogicalPlan::project(exprs.clone(), scan),
        None => scan,
    };
    LogicalPlan::new(plan.op.clone(), vec![child])
}
