//! # Distinct Aggregate Rewrite
//!
//! The staging rule can only plan DISTINCT aggregates that all deduplicate the
//! same plain column, with nothing else computed alongside. Everything else is
//! lowered here:
//!
//! - distinct arguments that differ, are computed expressions, or a forced one-
//!   or two-stage plan: `count(DISTINCT x)` becomes `multi_distinct_count(x)` and
//!   `sum(DISTINCT x)` becomes `multi_distinct_sum(x)`, which deduplicate inside
//!   the aggregate state;
//! - DISTINCT and plain aggregates over one distinct column `d`: an inner aggregate
//!   grouped by `G ∪ {d}` computes partial plain aggregates, and an outer
//!   aggregate grouped by `G` combines them and counts `d`.

use distx_core::config::AggStageOverride;
use distx_core::error::Result;
use distx_core::expr::*;
use distx_core::pattern::Pattern;
use distx_core::plan::LogicalPlan;
use distx_core::rule::{OptContext, Rule, RuleType};
use tracing::debug;

pub struct DistinctAggregateRewriteRule;

impl Rule for DistinctAggregateRewriteRule {
    fn name(&self) -> &str {
        "DistinctAggregateRewrite"
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
        let distinct: Vec<&AggExpr> = aggregates.iter().filter(|a| a.distinct).collect();
        let Some(first) = distinct.first() else {
            return Ok(None);
        };

        let forced_multi = matches!(
            ctx.config.distinct_agg_stage_count_override,
            AggStageOverride::One | AggStageOverride::Two
        );
        let same_args = distinct.iter().all(|a| a.arg == first.arg);
        let distinct_column = match &first.arg {
            Some(Expr::Column(c)) if same_args => Some(c.clone()),
            _ => None,
        };

        let Some(distinct_column) = distinct_column.filter(|_| !forced_multi) else {
            debug!("Rewriting {} distinct aggregates to multi-distinct combinators", distinct.len());
            return Ok(Some(multi_distinct(plan, group_by, aggregates, child, ctx)));
        };
        if distinct.len() == aggregates.len() {
            return Ok(None);
        }
        match split_aggregate(plan, group_by, aggregates, &distinct_column, child, ctx) {
            Some(rewritten) => {
                debug!("Split mixed distinct aggregation on {}", distinct_column);
                Ok(Some(rewritten))
            }
            // partial multi-distinct states cannot be combined across levels
            None => Ok(Some(multi_distinct(plan, group_by, aggregates, child, ctx))),
        }
    }
}

/// Replace every DISTINCT aggregate by a combinator that deduplicates in its state.
fn multi_distinct(
    plan: &LogicalPlan,
    group_by: &[ColumnRef],
    aggregates: &[AggExpr],
    child: &LogicalPlan,
    ctx: &mut OptContext,
) -> LogicalPlan {
    let mut rewritten = Vec::with_capacity(aggregates.len());
    let mut finals: Vec<(ColumnRef, Expr)> = Vec::new();
    for agg in aggregates {
        if !agg.distinct {
            rewritten.push(agg.clone());
            continue;
        }
        let with = |func: AggFunc, output: ColumnRef| AggExpr {
            func,
            arg: agg.arg.clone(),
            distinct: false,
            output,
        };
        match agg.func {
            AggFunc::Count => rewritten.push(with(AggFunc::MultiDistinctCount, agg.output.clone())),
            AggFunc::Sum => rewritten.push(with(AggFunc::MultiDistinctSum, agg.output.clone())),
            AggFunc::Avg => {
                let sum = ctx.create_column("multi_distinct_sum");
                let count = ctx.create_column("multi_distinct_count");
                rewritten.push(with(AggFunc::MultiDistinctSum, sum.clone()));
                rewritten.push(with(AggFunc::MultiDistinctCount, count.clone()));
                finals.push((agg.output.clone(), divide(&sum, &count)));
            }
            // min and max ignore duplicates
            func => rewritten.push(with(func, agg.output.clone())),
        }
    }

    let aggregate = LogicalPlan::aggregate(group_by.to_vec(), rewritten, child.clone());
    if finals.is_empty() {
        return aggregate;
    }
    LogicalPlan::project(restore_outputs(plan, &finals), aggregate)
}

/// `Aggregate(G; distinct over d, plain aggregates)` →
/// `Aggregate(G; combinators) <- Aggregate(G ∪ {d}; partials)`.
fn split_aggregate(
    plan: &LogicalPlan,
    group_by: &[ColumnRef],
    aggregates: &[AggExpr],
    distinct_column: &ColumnRef,
    child: &LogicalPlan,
    ctx: &mut OptContext,
) -> Option<LogicalPlan> {
    let mut inner_group_by = group_by.to_vec();
    if !inner_group_by.iter().any(|g| g.id == distinct_column.id) {
        inner_group_by.push(distinct_column.clone());
    }

    let mut inner = Vec::new();
    let mut outer = Vec::new();
    let mut finals: Vec<(ColumnRef, Expr)> = Vec::new();
    for agg in aggregates {
        if agg.distinct {
            // one row per distinct value already: aggregate the column plainly
            outer.push(AggExpr {
                func: agg.func,
                arg: Some(Expr::col(distinct_column)),
                distinct: false,
                output: agg.output.clone(),
            });
            continue;
        }
        let mut partial = |ctx: &mut OptContext, func: AggFunc| {
            let output = ctx.create_column(func.to_string());
            inner.push(AggExpr {
                func,
                arg: agg.arg.clone(),
                distinct: false,
                output: output.clone(),
            });
            output
        };
        match agg.func {
            AggFunc::Count if group_by.is_empty() => {
                // summing no partial counts gives NULL where the count is 0
                let p = partial(ctx, AggFunc::Count);
                let merged = ctx.create_column("count");
                outer.push(AggExpr::new(AggFunc::Sum, Expr::col(&p), merged.clone()));
                finals.push((agg.output.clone(), coalesce_zero(&merged)));
            }
            AggFunc::Count | AggFunc::Sum => {
                let p = partial(ctx, agg.func);
                outer.push(AggExpr::new(AggFunc::Sum, Expr::col(&p), agg.output.clone()));
            }
            AggFunc::Min | AggFunc::Max => {
                let p = partial(ctx, agg.func);
                outer.push(AggExpr::new(agg.func, Expr::col(&p), agg.output.clone()));
            }
            AggFunc::Avg => {
                let s = partial(ctx, AggFunc::Sum);
                let c = partial(ctx, AggFunc::Count);
                let total = ctx.create_column("sum");
                let rows = ctx.create_column("count");
                outer.push(AggExpr::new(AggFunc::Sum, Expr::col(&s), total.clone()));
                outer.push(AggExpr::new(AggFunc::Sum, Expr::col(&c), rows.clone()));
                finals.push((agg.output.clone(), divide(&total, &rows)));
            }
            AggFunc::MultiDistinctCount | AggFunc::MultiDistinctSum => return None,
        }
    }

    let inner = LogicalPlan::aggregate(inner_group_by, inner, child.clone());
    let outer = LogicalPlan::aggregate(group_by.to_vec(), outer, inner);
    if finals.is_empty() {
        return Some(outer);
    }
    Some(LogicalPlan::project(restore_outputs(plan, &finals), outer))
}

fn coalesce_zero(column: &ColumnRef) -> Expr {
    Expr::Function {
        name: "coalesce".to_string(),
        args: vec![Expr::col(column), Expr::int(0)],
    }
}

fn divide(numerator: &ColumnRef, denominator: &ColumnRef) -> Expr {
    Expr::binary(BinaryOp::Div, Expr::col(numerator), Expr::col(denominator))
}

/// Projection restoring the original aggregate's output columns, with averages
/// computed from their sum and count and global counts defaulted to 0.
fn restore_outputs(plan: &LogicalPlan, finals: &[(ColumnRef, Expr)]) -> Vec<(ColumnRef, Expr)> {
    plan.output_columns()
        .into_iter()
        .map(|c| {
            let expr = finals
                .iter()
                .find(|(out, _)| out.id == c.id)
                .map(|(_, e)| e.clone())
                .unwrap_or_else(|| Expr::col(&c));
            (c, expr)
        })
        .collect()
}
