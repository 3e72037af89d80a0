//! Set operations and grouping-set expansion.
//!
//! UNION ALL concatenates its inputs where they are. UNION, INTERSECT and EXCEPT
//! compare whole rows, so every input is shuffled on all of its columns first.
//! INTERSECT is commutative and builds its hash table from the first input; the
//! inputs are reordered smallest first.

use distx_core::error::Result;
use distx_core::expr::{LogicalOp, LogicalOpKind, SetOpKind};
use distx_core::pattern::Pattern;
use distx_core::physical::{PhysicalOp, PlanNode};
use distx_core::plan::LogicalPlan;
use distx_core::properties::DistributionRequirement;
use distx_core::rule::{OptContext, Rule, RuleType};
use distx_core::stats::Statistics;
use tracing::debug;

pub struct ImplSetOperationRule;

impl Rule for ImplSetOperationRule {
    fn name(&self) -> &str {
        "ImplSetOperation"
    }

    fn rule_type(&self) -> RuleType {
        RuleType::Implementation
    }

    fn pattern(&self) -> Pattern {
        Pattern::node(LogicalOpKind::SetOperation)
    }

    fn implement(
        &self,
        plan: &LogicalPlan,
        children: &[PlanNode],
        stats: &Statistics,
        ctx: &mut OptContext,
    ) -> Result<Vec<PlanNode>> {
        let LogicalOp::SetOperation {
            kind,
            output,
            inputs,
        } = &plan.op
        else {
            return Ok(vec![]);
        };

        let mut branches: Vec<(PlanNode, Vec<_>)> = children
            .iter()
            .cloned()
            .zip(inputs.iter().cloned())
            .collect();
        if *kind == SetOpKind::Intersect {
            branches.sort_by(|(a, _), (b, _)| a.stats.row_count.total_cmp(&b.stats.row_count));
        }

        let (children, inputs): (Vec<PlanNode>, Vec<_>) = if *kind == SetOpKind::UnionAll {
            branches.into_iter().unzip()
        } else {
            branches
                .into_iter()
                .map(|(child, columns)| {
                    let required = DistributionRequirement::ShuffleHash(columns.clone());
                    (ctx.enforce(child, &required), columns)
                })
                .unzip()
        };
        debug!("{:?} over {} inputs", kind, children.len());

        let node = ctx.make_node(
            PhysicalOp::SetOperation {
                kind: *kind,
                output: output.clone(),
                inputs,
            },
            children,
            stats.clone(),
        );
        Ok(vec![node])
    }
}

/// Repeat → Repeat. Runs wherever its input is; the aggregate above handles
/// placement.
pub struct ImplRepeatRule;

impl Rule for ImplRepeatRule {
    fn name(&self) -> &str {
        "ImplRepeat"
    }

    fn rule_type(&self) -> RuleType {
        RuleType::Implementation
    }

    fn pattern(&self) -> Pattern {
        Pattern::node(LogicalOpKind::Repeat)
    }

    fn implement(
        &self,
        plan: &LogicalPlan,
        children: &[PlanNode],
        stats: &Statistics,
        ctx: &mut OptContext,
    ) -> Result<Vec<PlanNode>> {
        let LogicalOp::Repeat {
            repeat_columns,
            grouping_sets,
            grouping_id,
        } = &plan.op
        else {
            return Ok(vec![]);
        };
        let node = ctx.make_node(
            PhysicalOp::Repeat {
                repeat_columns: repeat_columns.clone(),
                grouping_sets: grouping_sets.clone(),
                grouping_id: grouping_id.clone(),
            },
            children.to_vec(),
            stats.clone(),
        );
        Ok(vec![node])
    }
}
