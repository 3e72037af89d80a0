//! # Built-in Optimization Rules
//!
//! This crate provides the default set of optimization rules for the distx
//! optimizer. Rules are divided into two categories:
//!
//! ## Transformation Rules (Logical -> Logical)
//!
//! These rules run once per node during the bottom-up rewrite pass, in the order
//! they are registered:
//!
//! - **`PredicatePushdownRule`** / **`JoinPredicatePushdownRule`**: Move filter and
//!   join-condition conjuncts as close to the scans as the join semantics allow,
//!   deriving constant predicates across equi-join keys.
//! - **`GroupingSetsToUnionAllRule`**: Lowers `Aggregate(Repeat(x))` into a UNION ALL
//!   of one aggregate per grouping set over a shared CTE (opt-in).
//! - **`RollupSelectionRule`**: Substitutes the base-table scan below an aggregate
//!   with the smallest rollup that can answer it.
//! - **`DistinctAggregateRewriteRule`**: Rewrites DISTINCT aggregates into
//!   multi-distinct combinators or a pair of stacked aggregates.
//!
//! ## Implementation Rules (Logical -> Physical)
//!
//! These rules produce the physical alternatives the cost model scores:
//!
//! - **`ImplOlapScanRule`**: Partition pruning, index choice and bucket layout.
//! - **`ImplFilterRule`**, **`ImplProjectRule`**, **`ImplCteConsumerRule`**: One-to-one.
//! - **`ImplHashJoinRule`** / **`ImplNestLoopJoinRule`**: Join distribution selection.
//! - **`ImplHashAggregateRule`**: Aggregation staging (1 to 4 phases).
//! - **`ImplSetOperationRule`**, **`ImplRepeatRule`**: Set operations and grouping sets.
//! - **`ImplSortRule`**, **`ImplTopNRule`**, **`ImplLimitRule`**: Order and limits,
//!   split into a per-backend stage and a gathering exchange.

pub mod distinct_rewrite;
pub mod enforcer;
pub mod grouping_sets;
pub mod impl_agg;
pub mod impl_join;
pub mod impl_project;
pub mod impl_scan;
pub mod impl_set_op;
pub mod predicate_pushdown;
pub mod rollup_selection;

#[cfg(test)]
mod testing;

use distx_core::rule::RuleRegistry;

/// Create a default rule registry with all built-in rules.
///
/// This is the standard configuration for the optimizer. Extra rules can be added
/// to the returned registry with `add_rule()`; transformation rules added later run
/// after the built-in ones.
pub fn default_rule_registry() -> RuleRegistry {
    let mut registry = RuleRegistry::new();

    // Transformation rules: applied once per node, bottom-up, in this order.
    registry.add_rule(Box::new(predicate_pushdown::PredicatePushdownRule));
    registry.add_rule(Box::new(predicate_pushdown::JoinPredicatePushdownRule));
    registry.add_rule(Box::new(grouping_sets::GroupingSetsToUnionAllRule));
    registry.add_rule(Box::new(rollup_selection::RollupSelectionRule));
    registry.add_rule(Box::new(distinct_rewrite::DistinctAggregateRewriteRule));

    // Implementation rules: map logical operators to physical alternatives.
    registry.add_rule(Box::new(impl_scan::ImplOlapScanRule));
    registry.add_rule(Box::new(impl_project::ImplFilterRule));
    registry.add_rule(Box::new(impl_project::ImplProjectRule));
    registry.add_rule(Box::new(impl_project::ImplCteConsumerRule));
    registry.add_rule(Box::new(impl_join::ImplHashJoinRule));
    registry.add_rule(Box::new(impl_join::ImplNestLoopJoinRule));
    registry.add_rule(Box::new(impl_agg::ImplHashAggregateRule));
    registry.add_rule(Box::new(impl_set_op::ImplSetOperationRule));
    registry.add_rule(Box::new(impl_set_op::ImplRepeatRule));
    registry.add_rule(Box::new(enforcer::ImplSortRule));
    registry.add_rule(Box::new(enforcer::ImplTopNRule));
    registry.add_rule(Box::new(enforcer::ImplLimitRule));

    registry
}
