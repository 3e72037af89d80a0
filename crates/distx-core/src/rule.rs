//! # Rule System
//!
//! This module defines the rule trait, the rule registry and the context rules run
//! in.
//!
//! ## Rule Types
//!
//! There are two kinds of optimization rules:
//!
//! - **Transformation rules** (`RuleType::Transformation`): rewrite a logical subtree
//!   into an equivalent logical subtree (predicate pushdown, grouping-set lowering,
//!   rollup selection, distinct rewrite). They run once per node during the
//!   bottom-up rewrite pass, in registry order.
//!
//! - **Implementation rules** (`RuleType::Implementation`): map a logical operator to
//!   one or more physical alternatives over already-implemented children. The engine
//!   keeps the cheapest alternative.
//!
//! ## Pattern Matching
//!
//! Each rule declares a `Pattern` that describes the structure it matches against.
//! The engine checks the pattern before calling `transform`/`implement`.
//!
//! ## Building Physical Nodes
//!
//! Implementation rules never assemble a [`PlanNode`] by hand: they call
//! [`OptContext::make_node`], which derives cost, distribution and output columns,
//! and [`OptContext::enforce`], which inserts an Exchange when a child does not
//! deliver the distribution the operator needs.

use crate::catalog::{Catalog, StatisticsCache};
use crate::config::OptimizerConfig;
use crate::cost::{Cost, CostModel};
use crate::error::Result;
use crate::expr::{ColumnFactory, ColumnRef, CteId, ScanOp};
use crate::pattern::Pattern;
use crate::physical::{PhysicalOp, PlanNode, PlanNodeId};
use crate::plan::{CteProducer, CteTable, LogicalPlan};
use crate::properties::{derive_distribution, DistributionRequirement, ExchangeKind};
use crate::stats::{derive_scan_stats, derive_statistics, Statistics, StatisticsSource};
use std::collections::HashMap;
use std::sync::Arc;

/// Classification of optimization rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleType {
    /// Logical → Logical transformation (e.g., predicate pushdown).
    Transformation,
    /// Logical → Physical implementation (e.g., join → hash join).
    Implementation,
}

/// Per-pass state shared by all rules.
pub struct OptContext<'a> {
    pub catalog: &'a dyn Catalog,
    pub statistics: StatisticsCache<'a>,
    pub config: &'a OptimizerConfig,
    pub cost_model: &'a dyn CostModel,
    pub columns: ColumnFactory,
    /// CTE producers known to the pass, including ones created by rewrites.
    pub ctes: CteTable,
    cte_stats: HashMap<CteId, Statistics>,
    next_node_id: u32,
}

impl<'a> OptContext<'a> {
    pub fn new(
        catalog: &'a dyn Catalog,
        statistics: StatisticsCache<'a>,
        config: &'a OptimizerConfig,
        cost_model: &'a dyn CostModel,
        columns: ColumnFactory,
        ctes: CteTable,
    ) -> Self {
        Self {
            catalog,
            statistics,
            config,
            cost_model,
            columns,
            ctes,
            cte_stats: HashMap::new(),
            next_node_id: 0,
        }
    }

    pub fn create_column(&mut self, name: impl Into<String>) -> ColumnRef {
        self.columns.create(name)
    }

    /// Register a new CTE producer and return its id.
    pub fn register_cte(&mut self, plan: LogicalPlan) -> CteId {
        let id = CteId(self.ctes.keys().last().map(|id| id.0 + 1).unwrap_or(1));
        self.ctes.insert(id, Arc::new(CteProducer { id, plan }));
        id
    }

    pub fn set_cte_statistics(&mut self, cte_id: CteId, stats: Statistics) {
        self.cte_stats.insert(cte_id, stats);
    }

    /// Statistics of a logical subtree, derived bottom-up.
    pub fn logical_statistics(&self, plan: &LogicalPlan) -> Statistics {
        let children: Vec<Statistics> = plan
            .children
            .iter()
            .map(|c| self.logical_statistics(c))
            .collect();
        let refs: Vec<&Statistics> = children.iter().collect();
        derive_statistics(&plan.op, &refs, self)
    }

    /// Build a physical node: derives cost, distribution and output columns.
    pub fn make_node(&mut self, op: PhysicalOp, children: Vec<PlanNode>, stats: Statistics) -> PlanNode {
        let input: Vec<&Statistics> = children.iter().map(|c| &c.stats).collect();
        let costs: Vec<Cost> = children.iter().map(|c| c.cost).collect();
        let cost = self
            .cost_model
            .compute_cost(&op, &input, &stats, &costs, self.config);
        let distribution = derive_distribution(&op, &children);
        let output = op.output_columns(&children);
        let id = PlanNodeId(self.next_node_id);
        self.next_node_id += 1;
        PlanNode {
            id,
            op,
            children,
            stats,
            cost,
            distribution,
            output,
        }
    }

    /// Return `child` unchanged when it satisfies `required`, otherwise wrap it in
    /// the Exchange that does.
    pub fn enforce(&mut self, child: PlanNode, required: &DistributionRequirement) -> PlanNode {
        if child.distribution.satisfies(required) {
            return child;
        }
        let Some(kind) = ExchangeKind::for_requirement(required) else {
            return child;
        };
        self.exchange(child, kind)
    }

    /// Wrap `child` in an exchange of the given kind.
    pub fn exchange(&mut self, child: PlanNode, kind: ExchangeKind) -> PlanNode {
        let stats = child.stats.clone();
        self.make_node(
            PhysicalOp::Exchange {
                kind,
                merge_order: None,
                offset: 0,
                limit: None,
                runtime_filters: Vec::new(),
            },
            vec![child],
            stats,
        )
    }
}

impl StatisticsSource for OptContext<'_> {
    fn scan_statistics(&self, scan: &ScanOp) -> Statistics {
        let base_rows = self.statistics.table_row_count(&scan.table);
        let rows = match (&scan.rollup, self.catalog.table(&scan.table)) {
            (Some(name), Some(meta)) => meta
                .rollup(name)
                .and_then(|r| r.row_count)
                .or(base_rows),
            _ => base_rows,
        };
        let columns = scan
            .columns
            .iter()
            .map(|c| (c.id, self.statistics.column_statistic(&scan.table, &c.name)))
            .collect();
        derive_scan_stats(rows, columns, &scan.predicates)
    }

    fn cte_statistics(&self, cte_id: CteId) -> Option<Statistics> {
        if let Some(stats) = self.cte_stats.get(&cte_id) {
            return Some(stats.clone());
        }
        self.ctes
            .get(&cte_id)
            .map(|producer| self.logical_statistics(&producer.plan))
    }
}

/// A rule transforms or implements plan nodes.
pub trait Rule: Send + Sync {
    /// Unique name of this rule.
    fn name(&self) -> &str;

    /// Whether this rule is a transformation or implementation rule.
    fn rule_type(&self) -> RuleType;

    /// Pattern that this rule matches against.
    fn pattern(&self) -> Pattern;

    /// Rewrite a matching logical subtree. `Ok(None)` means the rule does not apply.
    fn transform(&self, _plan: &LogicalPlan, _ctx: &mut OptContext) -> Result<Option<LogicalPlan>> {
        Ok(None)
    }

    /// Produce physical alternatives for `plan` over its implemented `children`.
    /// `stats` are the derived statistics of `plan`'s output.
    fn implement(
        &self,
        _plan: &LogicalPlan,
        _children: &[PlanNode],
        _stats: &Statistics,
        _ctx: &mut OptContext,
    ) -> Result<Vec<PlanNode>> {
        Ok(Vec::new())
    }
}

/// Registry of optimization rules. Order matters: transformation rules run in the
/// order they were added.
pub struct RuleRegistry {
    pub rules: Vec<Box<dyn Rule>>,
}

impl RuleRegistry {
    pub fn new() -> Self {
        Self { rules: Vec::new() }
    }

    pub fn add_rule(&mut self, rule: Box<dyn Rule>) {
        self.rules.push(rule);
    }

    pub fn active_rules(&self) -> Vec<&dyn Rule> {
        self.rules.iter().map(|r| r.as_ref()).collect()
    }

    /// Get all transformation rules.
    pub fn transformation_rules(&self) -> Vec<&dyn Rule> {
        self.active_rules()
            .into_iter()
            .filter(|r| r.rule_type() == RuleType::Transformation)
            .collect()
    }

    /// Get all implementation rules.
    pub fn implementation_rules(&self) -> Vec<&dyn Rule> {
        self.active_rules()
            .into_iter()
            .filter(|r| r.rule_type() == RuleType::Implementation)
            .collect()
    }
}

impl Default for RuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}
