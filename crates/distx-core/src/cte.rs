//! # CTE Inline/Reuse Decision
//!
//! After the rewrite pass every CTE is either *inlined* (each consumer replaced by a
//! private copy of the producer plan) or *reused* (computed once in a multicast
//! fragment that feeds all consumers).
//!
//! `cte_reuse_ratio_threshold` drives the decision:
//!
//! - negative: always inline;
//! - zero: always reuse;
//! - otherwise a CTE with several consumers is reused when
//!   `consumers × work > threshold × (work + consumers × rows)`, where `work` is the
//!   number of rows processed by the producer plan and `rows` its output rows.
//!
//! CTEs without consumers are dropped. Inlined copies get fresh column ids so that
//! two copies of the same producer never share a column.

use crate::error::{OptimizerError, Result};
use crate::expr::{CteId, Expr, LogicalOp};
use crate::plan::{CteProducer, LogicalPlan, LogicalQuery};
use crate::rule::OptContext;
use crate::stats::{derive_statistics, Statistics};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Result of the CTE decision: the root with inlined CTEs substituted, plus the
/// reused CTEs ordered so that producers come before the CTEs consuming them.
#[derive(Debug, Clone)]
pub struct CtePlan {
    pub root: LogicalPlan,
    pub reused: Vec<CteId>,
}

pub fn plan_ctes(root: LogicalPlan, ctx: &mut OptContext) -> Result<CtePlan> {
    if ctx.ctes.is_empty() {
        return Ok(CtePlan {
            root,
            reused: Vec::new(),
        });
    }

    let order = LogicalQuery {
        root: root.clone(),
        ctes: ctx.ctes.values().map(|p| (**p).clone()).collect(),
    }
    .cte_order()?;

    // Count consumers reachable from the root; unreachable producers do not count.
    let mut counts = BTreeMap::new();
    root.count_cte_consumers(&mut counts);
    for id in order.iter().rev() {
        if counts.get(id).copied().unwrap_or(0) == 0 {
            continue;
        }
        let producer = ctx.ctes.get(id).ok_or(OptimizerError::UnknownCte(*id))?.clone();
        producer.plan.count_cte_consumers(&mut counts);
    }

    let mut inlined: BTreeMap<CteId, LogicalPlan> = BTreeMap::new();
    let mut reused = Vec::new();
    for id in order {
        let consumers = counts.get(&id).copied().unwrap_or(0);
        let producer = ctx.ctes.get(&id).ok_or(OptimizerError::UnknownCte(id))?.clone();
        if consumers == 0 {
            ctx.ctes.remove(&id);
            continue;
        }
        let body = inline_consumers(&producer.plan, &inlined, ctx)?;
        let (stats, work) = plan_work(&body, ctx);
        let reuse = should_reuse(consumers, work, stats.row_count, ctx.config.cte_reuse_ratio_threshold);
        debug!(
            cte = id.0,
            consumers,
            work,
            rows = stats.row_count,
            reuse,
            "CTE decision"
        );
        if reuse {
            ctx.set_cte_statistics(id, stats);
            ctx.ctes.insert(id, Arc::new(CteProducer { id, plan: body }));
            reused.push(id);
        } else {
            ctx.ctes.remove(&id);
            inlined.insert(id, body);
        }
    }

    let root = inline_consumers(&root, &inlined, ctx)?;
    Ok(CtePlan { root, reused })
}

fn should_reuse(consumers: usize, work: f64, rows: f64, threshold: f64) -> bool {
    if threshold < 0.0 {
        return false;
    }
    if threshold == 0.0 {
        return true;
    }
    if consumers < 2 {
        return false;
    }
    let n = consumers as f64;
    n * work > threshold * (work + n * rows)
}

/// Output statistics of a plan and the total number of rows its operators produce.
fn plan_work(plan: &LogicalPlan, ctx: &OptContext) -> (Statistics, f64) {
    let mut work = 0.0;
    let mut child_stats = Vec::with_capacity(plan.children.len());
    for child in &plan.children {
        let (stats, child_work) = plan_work(child, ctx);
        work += child_work;
        child_stats.push(stats);
    }
    let refs: Vec<&Statistics> = child_stats.iter().collect();
    let stats = derive_statistics(&plan.op, &refs, ctx);
    work += stats.row_count;
    (stats, work)
}

/// Replace consumers of inlined CTEs with a fresh copy of the producer plan under a
/// projection that restores the consumer's column ids.
fn inline_consumers(
    plan: &LogicalPlan,
    inlined: &BTreeMap<CteId, LogicalPlan>,
    ctx: &mut OptContext,
) -> Result<LogicalPlan> {
    if let LogicalOp::CteConsumer { cte_id, columns } = &plan.op {
        let Some(body) = inlined.get(cte_id) else {
            return Ok(plan.clone());
        };
        let (copy, mapping) = body.with_fresh_columns(&mut ctx.columns);
        let mut exprs = Vec::with_capacity(columns.len());
        for (out, source) in columns {
            let column = mapping
                .get(source)
                .ok_or_else(|| OptimizerError::Internal(format!("CTE {} lost column {}", cte_id, source)))?;
            exprs.push((out.clone(), Expr::Column(column.clone())));
        }
        return Ok(LogicalPlan::project(exprs, copy));
    }
    let children = plan
        .children
        .iter()
        .map(|c| inline_consumers(c, inlined, ctx))
        .collect::<Result<Vec<_>>>()?;
    Ok(LogicalPlan::new(plan.op.clone(), children))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold_extremes() {
        assert!(!should_reuse(5, 1e9, 1.0, -1.0));
        assert!(should_reuse(1, 1.0, 1.0, 0.0));
    }

    #[test]
    fn test_expensive_producer_with_small_output_is_reused() {
        // scan 10000 rows, aggregate to 100, two consumers
        assert!(should_reuse(2, 10100.0, 100.0, 1.15));
        // plain scan: recomputing is cheaper than materializing
        assert!(!should_reuse(2, 10000.0, 10000.0, 1.15));
        assert!(!should_reuse(1, 10100.0, 100.0, 1.15));
    }
}
