//! # Optimization Pass
//!
//! [`Optimizer`] drives one optimization of a [`LogicalQuery`] through a fixed
//! sequence of phases. Each phase is a single bounded traversal, so a pass always
//! terminates:
//!
//! 1. **Validate** the configuration and the query (dangling columns, unknown or
//!    cyclic CTE references).
//! 2. **Rewrite** bottom-up: children first, then every transformation rule whose
//!    pattern matches, in registry order. CTE producers are rewritten before the
//!    root.
//! 3. **CTE decision**: inline or reuse every CTE (see [`crate::cte`]).
//! 4. **Implement** bottom-up: statistics are derived for each logical node from its
//!    implemented children, every matching implementation rule proposes physical
//!    alternatives, and the cheapest one wins.
//! 5. **Runtime filters** are planned on the chosen tree.
//! 6. **Fragments** are cut at the exchanges.
//!
//! The optimizer itself holds no per-pass state; all of it lives in an
//! [`OptContext`] created for the pass, so one `Optimizer` can serve concurrent
//! passes.

use crate::catalog::{Catalog, StatisticsCache, StatisticsProvider};
use crate::config::OptimizerConfig;
use crate::cost::CostModel;
use crate::cte::plan_ctes;
use crate::error::{OptimizerError, Result};
use crate::expr::{ColumnFactory, CteId};
use crate::fragment::{assemble_fragments, DistributedPlan};
use crate::pattern::matches;
use crate::physical::{PhysicalPlan, PlanNode};
use crate::plan::{CteProducer, LogicalPlan, LogicalQuery};
use crate::rule::{OptContext, RuleRegistry};
use crate::runtime_filter::plan_runtime_filters;
use crate::stats::{derive_statistics, Statistics};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, trace};

/// The optimizer: rules, cost model and the external metadata services.
pub struct Optimizer {
    /// Registry of transformation and implementation rules to apply.
    pub rule_registry: Arc<RuleRegistry>,
    /// Cost model used to compare physical alternatives.
    pub cost_model: Arc<dyn CostModel>,
    /// Table metadata.
    pub catalog: Arc<dyn Catalog>,
    /// Row counts and column statistics.
    pub statistics: Arc<dyn StatisticsProvider>,
}

impl Optimizer {
    pub fn new(
        rule_registry: Arc<RuleRegistry>,
        cost_model: Arc<dyn CostModel>,
        catalog: Arc<dyn Catalog>,
        statistics: Arc<dyn StatisticsProvider>,
    ) -> Self {
        Self {
            rule_registry,
            cost_model,
            catalog,
            statistics,
        }
    }

    /// Optimize `query` into a fragmented, distributable plan.
    pub fn optimize(&self, query: &LogicalQuery, config: &OptimizerConfig) -> Result<DistributedPlan> {
        let physical = self.optimize_physical(query, config)?;
        let plan = assemble_fragments(physical, query.root.output_columns());
        debug!("Optimization complete: fragments={}", plan.fragments.len());
        Ok(plan)
    }

    /// Optimize `query` up to the physical plan with runtime filters attached.
    pub fn optimize_physical(&self, query: &LogicalQuery, config: &OptimizerConfig) -> Result<PhysicalPlan> {
        config.validate()?;
        query.validate()?;

        let mut ctx = OptContext::new(
            self.catalog.as_ref(),
            StatisticsCache::new(self.statistics.as_ref()),
            config,
            self.cost_model.as_ref(),
            ColumnFactory::starting_after(query.max_column_id()),
            query.cte_table(),
        );

        debug!("Rewrite phase: ctes={}", ctx.ctes.len());
        let user_ctes: Vec<CteId> = ctx.ctes.keys().copied().collect();
        for id in user_ctes {
            let Some(producer) = ctx.ctes.get(&id).cloned() else {
                continue;
            };
            let plan = self.rewrite(&producer.plan, &mut ctx)?;
            ctx.ctes.insert(id, Arc::new(CteProducer { id, plan }));
        }
        let root = self.rewrite(&query.root, &mut ctx)?;

        let cte_plan = plan_ctes(root, &mut ctx)?;

        debug!("Implementation phase: reused ctes={:?}", cte_plan.reused);
        let mut cte_producers = BTreeMap::new();
        for id in &cte_plan.reused {
            let producer = ctx
                .ctes
                .get(id)
                .cloned()
                .ok_or(OptimizerError::UnknownCte(*id))?;
            let node = self.implement(&producer.plan, &mut ctx)?;
            cte_producers.insert(*id, node);
        }
        let root = self.implement(&cte_plan.root, &mut ctx)?;
        debug!(
            "Best plan: cost={:.1}, rows={:.0}",
            root.cost.total, root.stats.row_count
        );

        Ok(plan_runtime_filters(PhysicalPlan { root, cte_producers }, config))
    }

    /// Bottom-up rewrite with the transformation rules.
    fn rewrite(&self, plan: &LogicalPlan, ctx: &mut OptContext) -> Result<LogicalPlan> {
        let children = plan
            .children
            .iter()
            .map(|c| self.rewrite(c, ctx))
            .collect::<Result<Vec<_>>>()?;
        let mut node = LogicalPlan::new(plan.op.clone(), children);
        for rule in self.rule_registry.transformation_rules() {
            if !matches(&node, &rule.pattern()) {
                continue;
            }
            if let Some(rewritten) = rule.transform(&node, ctx)? {
                trace!("Applied transformation rule '{}' to {:?}", rule.name(), node.op.kind());
                node = rewritten;
            }
        }
        Ok(node)
    }

    /// Bottom-up implementation: the cheapest alternative of every node wins.
    fn implement(&self, plan: &LogicalPlan, ctx: &mut OptContext) -> Result<PlanNode> {
        let children = plan
            .children
            .iter()
            .map(|c| self.implement(c, ctx))
            .collect::<Result<Vec<_>>>()?;
        let stats = {
            let child_stats: Vec<&Statistics> = children.iter().map(|c| &c.stats).collect();
            derive_statistics(&plan.op, &child_stats, &*ctx)
        };

        let mut best: Option<PlanNode> = None;
        for rule in self.rule_registry.implementation_rules() {
            if !matches(plan, &rule.pattern()) {
                continue;
            }
            trace!("Applying implementation rule '{}' to {:?}", rule.name(), plan.op.kind());
            for candidate in rule.implement(plan, &children, &stats, ctx)? {
                let better = best
                    .as_ref()
                    .map_or(true, |current| candidate.cost < current.cost);
                if better {
                    best = Some(candidate);
                }
            }
        }
        best.ok_or_else(|| {
            OptimizerError::Internal(format!("no implementation rule for {:?}", plan.op.kind()))
        })
    }
}
