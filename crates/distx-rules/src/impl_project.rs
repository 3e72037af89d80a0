//! One-to-one implementation rules: Filter, Project and CTE consumers map directly
//! onto their physical counterparts and keep the child's distribution.

use distx_core::error::Result;
use distx_core::expr::{LogicalOp, LogicalOpKind};
use distx_core::pattern::Pattern;
use distx_core::physical::{PhysicalOp, PlanNode};
use distx_core::plan::LogicalPlan;
use distx_core::rule::{OptContext, Rule, RuleType};
use distx_core::stats::Statistics;

/// Filter → Filter.
pub struct ImplFilterRule;

impl Rule for ImplFilterRule {
    fn name(&self) -> &str {
        "ImplFilter"
    }

    fn rule_type(&self) -> RuleType {
        RuleType::Implementation
    }

    fn pattern(&self) -> Pattern {
        Pattern::filter()
    }

    fn implement(
        &self,
        plan: &LogicalPlan,
        children: &[PlanNode],
        stats: &Statistics,
        ctx: &mut OptContext,
    ) -> Result<Vec<PlanNode>> {
        let LogicalOp::Filter { predicate } = &plan.op else {
            return Ok(vec![]);
        };
        let node = ctx.make_node(
            PhysicalOp::Filter {
                predicate: predicate.clone(),
            },
            children.to_vec(),
            stats.clone(),
        );
        Ok(vec![node])
    }
}

/// Project → Project.
pub struct ImplProjectRule;

impl Rule for ImplProjectRule {
    fn name(&self) -> &str {
        "ImplProject"
    }

    fn rule_type(&self) -> RuleType {
        RuleType::Implementation
    }

    fn pattern(&self) -> Pattern {
        Pattern::project()
    }

    fn implement(
        &self,
        plan: &LogicalPlan,
        children: &[PlanNode],
        stats: &Statistics,
        ctx: &mut OptContext,
    ) -> Result<Vec<PlanNode>> {
        let LogicalOp::Project { exprs } = &plan.op else {
            return Ok(vec![]);
        };
        let node = ctx.make_node(
            PhysicalOp::Project {
                exprs: exprs.clone(),
            },
            children.to_vec(),
            stats.clone(),
        );
        Ok(vec![node])
    }
}

/// A consumer of a reused CTE. Inlined CTEs never reach implementation.
pub struct ImplCteConsumerRule;

impl Rule for ImplCteConsumerRule {
    fn name(&self) -> &str {
        "ImplCteConsumer"
    }

    fn rule_type(&self) -> RuleType {
        RuleType::Implementation
    }

    fn pattern(&self) -> Pattern {
        Pattern::node(LogicalOpKind::CteConsumer)
    }

    fn implement(
        &self,
        plan: &LogicalPlan,
        _children: &[PlanNode],
        stats: &Statistics,
        ctx: &mut OptContext,
    ) -> Result<Vec<PlanNode>> {
        let LogicalOp::CteConsumer { cte_id, columns } = &plan.op else {
            return Ok(vec![]);
        };
        let node = ctx.make_node(
            PhysicalOp::CteConsumer {
                cte_id: *cte_id,
                columns: columns.clone(),
                runtime_filters: Vec::new(),
            },
            vec![],
            stats.clone(),
        );
        Ok(vec![node])
    }
}
