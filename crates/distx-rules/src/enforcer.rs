//! Order and limit operators.
//!
//! Sorting and limiting a distributed input happens in two steps: every backend
//! sorts (or keeps its first `offset + count` rows) locally, and a gathering
//! exchange merges the partial results. The merging exchange applies the final
//! offset and limit itself, so no operator is needed above it. Inputs that are
//! already on a single backend get the plain operator.

use distx_core::config::OptimizerConfig;
use distx_core::error::Result;
use distx_core::expr::{LogicalOp, LogicalOpKind, SortKey};
use distx_core::pattern::Pattern;
use distx_core::physical::{PhysicalOp, PlanNode};
use distx_core::plan::LogicalPlan;
use distx_core::properties::{Distribution, ExchangeKind};
use distx_core::rule::{OptContext, Rule, RuleType};
use distx_core::stats::{derive_limit_stats, Statistics};

fn single_child(children: &[PlanNode]) -> Option<&PlanNode> {
    match children {
        [child] => Some(child),
        _ => None,
    }
}

fn gather(
    ctx: &mut OptContext,
    child: PlanNode,
    merge_order: Option<Vec<SortKey>>,
    offset: u64,
    limit: Option<u64>,
    stats: &Statistics,
) -> PlanNode {
    ctx.make_node(
        PhysicalOp::Exchange {
            kind: ExchangeKind::Gather,
            merge_order,
            offset,
            limit,
            runtime_filters: Vec::new(),
        },
        vec![child],
        stats.clone(),
    )
}

/// Statistics of a per-backend limit of `count` rows.
fn local_limit_stats(input: &Statistics, count: u64, config: &OptimizerConfig) -> Statistics {
    derive_limit_stats(input, count.saturating_mul(config.backend_count as u64))
}

pub struct ImplSortRule;

impl Rule for ImplSortRule {
    fn name(&self) -> &str {
        "ImplSort"
    }

    fn rule_type(&self) -> RuleType {
        RuleType::Implementation
    }

    fn pattern(&self) -> Pattern {
        Pattern::node(LogicalOpKind::Sort)
    }

    fn implement(
        &self,
        plan: &LogicalPlan,
        children: &[PlanNode],
        stats: &Statistics,
        ctx: &mut OptContext,
    ) -> Result<Vec<PlanNode>> {
        let (LogicalOp::Sort { order }, Some(child)) = (&plan.op, single_child(children)) else {
            return Ok(vec![]);
        };
        if child.distribution == Distribution::Single {
            let node = ctx.make_node(
                PhysicalOp::Sort {
                    order: order.clone(),
                    partial: false,
                },
                vec![child.clone()],
                stats.clone(),
            );
            return Ok(vec![node]);
        }
        let partial = ctx.make_node(
            PhysicalOp::Sort {
                order: order.clone(),
                partial: true,
            },
            vec![child.clone()],
            stats.clone(),
        );
        Ok(vec![gather(ctx, partial, Some(order.clone()), 0, None, stats)])
    }
}

pub struct ImplTopNRule;

impl Rule for ImplTopNRule {
    fn name(&self) -> &str {
        "ImplTopN"
    }

    fn rule_type(&self) -> RuleType {
        RuleType::Implementation
    }

    fn pattern(&self) -> Pattern {
        Pattern::node(LogicalOpKind::TopN)
    }

    fn implement(
        &self,
        plan: &LogicalPlan,
        children: &[PlanNode],
        stats: &Statistics,
        ctx: &mut OptContext,
    ) -> Result<Vec<PlanNode>> {
        let (
            LogicalOp::TopN {
                order,
                offset,
                count,
            },
            Some(child),
        ) = (&plan.op, single_child(children))
        else {
            return Ok(vec![]);
        };
        if child.distribution == Distribution::Single {
            let node = ctx.make_node(
                PhysicalOp::TopN {
                    order: order.clone(),
                    offset: *offset,
                    count: *count,
                    partial: false,
                },
                vec![child.clone()],
                stats.clone(),
            );
            return Ok(vec![node]);
        }
        let local_count = count.saturating_add(*offset);
        let local_stats = local_limit_stats(&child.stats, local_count, ctx.config);
        let partial = ctx.make_node(
            PhysicalOp::TopN {
                order: order.clone(),
                offset: 0,
                count: local_count,
                partial: true,
            },
            vec![child.clone()],
            local_stats,
        );
        Ok(vec![gather(
            ctx,
            partial,
            Some(order.clone()),
            *offset,
            Some(*count),
            stats,
        )])
    }
}

pub struct ImplLimitRule;

impl Rule for ImplLimitRule {
    fn name(&self) -> &str {
        "ImplLimit"
    }

    fn rule_type(&self) -> RuleType {
        RuleType::Implementation
    }

    fn pattern(&self) -> Pattern {
        Pattern::node(LogicalOpKind::Limit)
    }

    fn implement(
        &self,
        plan: &LogicalPlan,
        children: &[PlanNode],
        stats: &Statistics,
        ctx: &mut OptContext,
    ) -> Result<Vec<PlanNode>> {
        let (LogicalOp::Limit { offset, count }, Some(child)) = (&plan.op, single_child(children)) else {
            return Ok(vec![]);
        };
        if child.distribution == Distribution::Single {
            let node = ctx.make_node(
                PhysicalOp::Limit {
                    offset: *offset,
                    count: *count,
                },
                vec![child.clone()],
                stats.clone(),
            );
            return Ok(vec![node]);
        }
        let local_count = count.saturating_add(*offset);
        let local_stats = local_limit_stats(&child.stats, local_count, ctx.config);
        let local = ctx.make_node(
            PhysicalOp::Limit {
                offset: 0,
                count: local_count,
            },
            vec![child.clone()],
            local_stats,
        );
        Ok(vec![gather(ctx, local, None, *offset, Some(*count), stats)])
    }
}
