//! # Aggregation Staging
//!
//! A logical aggregate becomes one to four physical `HashAggregate` stages with
//! exchanges between them. Which plan is used depends on the ratio of the group-by
//! NDV estimate to the input rows:
//!
//! ```text
//! colocated      AGG(update finalize)                        input already placed
//! one phase      AGG(update finalize) <- SHUFFLE(G)          ratio < low threshold
//! two phases     AGG(merge finalize) <- SHUFFLE(G) <- AGG(update serialize)
//!                (the local stage is STREAMING when ratio >= high or unknown)
//! ```
//!
//! DISTINCT aggregates that reach this rule share one argument set `D` (the
//! rewrite rule lowers every other case). They deduplicate on `G ∪ D` first:
//!
//! ```text
//! three phases   AGG(update finalize, G) <- AGG(merge serialize, G∪D) <- SHUFFLE(G)
//!                  <- AGG(update serialize, G∪D)
//! four phases    AGG(merge finalize, G) <- SHUFFLE(G) <- AGG(update serialize, G)
//!                  <- AGG(merge serialize, G∪D) <- SHUFFLE(G∪D) <- AGG(update serialize, G∪D)
//! ```
//!
//! Merge stages reuse the aggregate function over the column the previous stage
//! produced, so `sum(v)` is merged as `sum(<sum output>)`.

use distx_core::config::{AggStageOverride, OptimizerConfig};
use distx_core::error::{OptimizerError, Result};
use distx_core::expr::*;
use distx_core::pattern::Pattern;
use distx_core::physical::{AggMode, PhysicalOp, PlanNode};
use distx_core::plan::LogicalPlan;
use distx_core::properties::{Distribution, DistributionRequirement};
use distx_core::rule::{OptContext, Rule, RuleType};
use distx_core::stats::{derive_aggregate_stats, group_by_ndv, Statistics};
use tracing::debug;

/// Implement a logical aggregate as staged hash aggregations.
pub struct ImplHashAggregateRule;

impl Rule for ImplHashAggregateRule {
    fn name(&self) -> &str {
        "ImplHashAggregate"
    }

    fn rule_type(&self) -> RuleType {
        RuleType::Implementation
    }

    fn pattern(&self) -> Pattern {
        Pattern::aggregate()
    }

    fn implement(
        &self,
        plan: &LogicalPlan,
        children: &[PlanNode],
        stats: &Statistics,
        ctx: &mut OptContext,
    ) -> Result<Vec<PlanNode>> {
        let LogicalOp::Aggregate {
            group_by,
            aggregates,
        } = &plan.op
        else {
            return Ok(vec![]);
        };
        let [child] = children else {
            return Ok(vec![]);
        };
        let stager = AggregateStager {
            group_by,
            aggregates,
            stats,
        };
        let node = if aggregates.iter().any(|a| a.distinct) {
            stager.distinct(child.clone(), ctx)?
        } else {
            stager.plain(child.clone(), ctx)
        };
        Ok(vec![node])
    }
}

/// NDV of `columns` relative to the input rows, when known.
fn cardinality_ratio(input: &Statistics, columns: &[ColumnRef]) -> Option<f64> {
    group_by_ndv(input, columns).map(|ndv| ndv / input.row_count.max(1.0))
}

fn hash_aggregate(mode: AggMode, streaming: bool, group_by: &[ColumnRef], aggregates: Vec<AggExpr>) -> PhysicalOp {
    PhysicalOp::HashAggregate {
        mode,
        streaming,
        group_by: group_by.to_vec(),
        aggregates,
    }
}

/// Aggregates of a merge stage: the same function over the partial state column.
fn merge_aggregates(aggregates: &[AggExpr]) -> Vec<AggExpr> {
    aggregates
        .iter()
        .map(|a| AggExpr::new(a.func, Expr::col(&a.output), a.output.clone()))
        .collect()
}

/// Rows left after a per-backend pre-aggregation: at most one row per group per
/// backend, never more than the input.
fn local_rows(groups: f64, input: &Statistics, config: &OptimizerConfig) -> f64 {
    (groups * config.backend_count as f64).min(input.row_count)
}

fn with_rows(stats: &Statistics, rows: f64) -> Statistics {
    let mut out = stats.clone();
    out.row_count = rows;
    out
}

struct AggregateStager<'p> {
    group_by: &'p [ColumnRef],
    aggregates: &'p [AggExpr],
    /// Statistics of the aggregate's final output.
    stats: &'p Statistics,
}

impl AggregateStager<'_> {
    /// Aggregation without DISTINCT aggregates.
    fn plain(&self, child: PlanNode, ctx: &mut OptContext) -> PlanNode {
        let config = ctx.config;
        let group_by = self.group_by;

        let colocated = child.distribution == Distribution::Single
            || (!group_by.is_empty()
                && child
                    .distribution
                    .satisfies(&DistributionRequirement::HashSubset(group_by.to_vec())));
        if colocated {
            debug!("Aggregation on {:?} runs colocated in one stage", names(group_by));
            return ctx.make_node(
                hash_aggregate(AggMode::UpdateFinalize, false, group_by, self.aggregates.to_vec()),
                vec![child],
                self.stats.clone(),
            );
        }

        let ratio = cardinality_ratio(&child.stats, group_by);
        let one_phase = match config.distinct_agg_stage_count_override {
            AggStageOverride::One => true,
            AggStageOverride::Two => false,
            _ => {
                !group_by.is_empty()
                    && config.trust_table_row_count
                    && child.stats.row_count_known
                    && ratio.is_some_and(|r| r < config.low_cardinality_threshold)
            }
        };

        if one_phase {
            debug!(
                "Aggregation on {:?} planned in one phase (ndv ratio {:?})",
                names(group_by),
                ratio
            );
            let input = ctx.enforce(
                child,
                &DistributionRequirement::HashSubset(group_by.to_vec()),
            );
            return ctx.make_node(
                hash_aggregate(AggMode::UpdateFinalize, false, group_by, self.aggregates.to_vec()),
                vec![input],
                self.stats.clone(),
            );
        }

        let streaming = !group_by.is_empty()
            && ratio.map_or(true, |r| r >= config.high_cardinality_threshold);
        debug!(
            "Aggregation on {:?} planned in two phases (ndv ratio {:?}, streaming={})",
            names(group_by),
            ratio,
            streaming
        );
        let local_stats = with_rows(
            self.stats,
            local_rows(self.stats.row_count, &child.stats, config),
        );
        let local = ctx.make_node(
            hash_aggregate(AggMode::UpdateSerialize, streaming, group_by, self.aggregates.to_vec()),
            vec![child],
            local_stats,
        );
        let exchanged = ctx.enforce(
            local,
            &DistributionRequirement::HashSubset(group_by.to_vec()),
        );
        ctx.make_node(
            hash_aggregate(AggMode::MergeFinalize, false, group_by, merge_aggregates(self.aggregates)),
            vec![exchanged],
            self.stats.clone(),
        )
    }

    /// Aggregation whose aggregates are all DISTINCT over one argument set.
    fn distinct(&self, child: PlanNode, ctx: &mut OptContext) -> Result<PlanNode> {
        let config = ctx.config;
        if self.aggregates.iter().any(|a| !a.distinct) {
            return Err(OptimizerError::Internal(
                "distinct and plain aggregates must be split before staging".to_string(),
            ));
        }
        let group_by = self.group_by;
        let mut dedup_keys: Vec<ColumnRef> = group_by.to_vec();
        for agg in self.aggregates {
            for column in agg.arg_columns() {
                if !dedup_keys.iter().any(|c| c.id == column.id) {
                    dedup_keys.push(column.clone());
                }
            }
        }

        let four_phase = match config.distinct_agg_stage_count_override {
            AggStageOverride::Four => true,
            AggStageOverride::Three => false,
            _ => group_by.is_empty(),
        };
        debug!(
            "Distinct aggregation on {:?} planned in {} phases",
            names(group_by),
            if four_phase { 4 } else { 3 }
        );

        // Stages 1 and 2: deduplicate on G ∪ D.
        let dedup_stats = derive_aggregate_stats(&child.stats, &dedup_keys, &[]);
        let ratio = cardinality_ratio(&child.stats, &dedup_keys);
        let streaming = ratio.map_or(true, |r| r >= config.high_cardinality_threshold);
        let local_stats = with_rows(
            &dedup_stats,
            local_rows(dedup_stats.row_count, &child.stats, config),
        );
        let local = ctx.make_node(
            hash_aggregate(AggMode::UpdateSerialize, streaming, &dedup_keys, vec![]),
            vec![child],
            local_stats,
        );
        let shuffle_keys = if four_phase {
            dedup_keys.clone()
        } else {
            group_by.to_vec()
        };
        let exchanged = ctx.enforce(local, &DistributionRequirement::HashSubset(shuffle_keys));
        let deduplicated = ctx.make_node(
            hash_aggregate(AggMode::MergeSerialize, false, &dedup_keys, vec![]),
            vec![exchanged],
            dedup_stats.clone(),
        );

        let plain: Vec<AggExpr> = self
            .aggregates
            .iter()
            .map(|a| AggExpr {
                distinct: false,
                ..a.clone()
            })
            .collect();

        if !four_phase {
            return Ok(ctx.make_node(
                hash_aggregate(AggMode::UpdateFinalize, false, group_by, plain),
                vec![deduplicated],
                self.stats.clone(),
            ));
        }

        // Stages 3 and 4: aggregate the distinct values per group.
        let partial = ctx.make_node(
            hash_aggregate(AggMode::UpdateSerialize, false, group_by, plain.clone()),
            vec![deduplicated],
            with_rows(
                self.stats,
                local_rows(self.stats.row_count, &dedup_stats, config),
            ),
        );
        let exchanged = ctx.enforce(
            partial,
            &DistributionRequirement::HashSubset(group_by.to_vec()),
        );
        Ok(ctx.make_node(
            hash_aggregate(AggMode::MergeFinalize, false, group_by, merge_aggregates(&plain)),
            vec![exchanged],
            self.stats.clone(),
        ))
    }
}

fn names(columns: &[ColumnRef]) -> Vec<&str> {
    columns.iter().map(|c| c.name.as_str()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;
    use distx_core::physical::PhysicalPlan;
    use distx_core::properties::ExchangeKind;

    fn sum_v2_group_by(key: ColumnRef) -> LogicalPlan {
        LogicalPlan::aggregate(
            vec![key],
            vec![AggExpr::new(AggFunc::Sum, Expr::col(&v(2)), ColumnRef::new(4, "sum"))],
            t0_scan(),
        )
    }

    /// Aggregation modes from the root down.
    fn stages(plan: &PhysicalPlan) -> Vec<(AggMode, bool)> {
        collect_ops(&plan.root, &|op| matches!(op, PhysicalOp::HashAggregate { .. }))
            .into_iter()
            .filter_map(|n| match &n.op {
                PhysicalOp::HashAggregate { mode, streaming, .. } => Some((*mode, *streaming)),
                _ => None,
            })
            .collect()
    }

    fn exchanges(plan: &PhysicalPlan) -> Vec<ExchangeKind> {
        collect_ops(&plan.root, &|op| matches!(op, PhysicalOp::Exchange { .. }))
            .into_iter()
            .filter_map(|n| match &n.op {
                PhysicalOp::Exchange { kind, .. } => Some(kind.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_low_cardinality_group_by_is_one_phase() {
        let mut catalog = t0_catalog(10_000);
        set_ndv(&mut catalog, "t0", "v2", 100.0);
        let plan = optimize(&catalog, sum_v2_group_by(v(2)), &OptimizerConfig::default());
        assert_eq!(stages(&plan), vec![(AggMode::UpdateFinalize, false)]);
        assert_eq!(exchanges(&plan), vec![ExchangeKind::Shuffle(vec![v(2)])]);
    }

    #[test]
    fn test_high_cardinality_group_by_streams_locally() {
        let mut catalog = t0_catalog(10_000);
        set_ndv(&mut catalog, "t0", "v2", 7000.0);
        let plan = optimize(&catalog, sum_v2_group_by(v(2)), &OptimizerConfig::default());
        assert_eq!(
            stages(&plan),
            vec![(AggMode::MergeFinalize, false), (AggMode::UpdateSerialize, true)]
        );
        match &plan.root.op {
            PhysicalOp::HashAggregate { aggregates, .. } => {
                assert_eq!(aggregates[0].to_string(), "sum(4: sum)");
            }
            other => panic!("unexpected root {:?}", other),
        }
    }

    #[test]
    fn test_unknown_ndv_is_never_one_phase() {
        let catalog = t0_catalog(10_000);
        let plan = optimize(&catalog, sum_v2_group_by(v(2)), &OptimizerConfig::default());
        assert_eq!(
            stages(&plan),
            vec![(AggMode::MergeFinalize, false), (AggMode::UpdateSerialize, true)]
        );
    }

    #[test]
    fn test_untrusted_row_count_disables_one_phase() {
        let mut catalog = t0_catalog(10_000);
        set_ndv(&mut catalog, "t0", "v2", 100.0);
        let config = OptimizerConfig {
            trust_table_row_count: false,
            ..Default::default()
        };
        let plan = optimize(&catalog, sum_v2_group_by(v(2)), &config);
        assert_eq!(
            stages(&plan),
            vec![(AggMode::MergeFinalize, false), (AggMode::UpdateSerialize, false)]
        );
    }

    #[test]
    fn test_phase_count_grows_with_ndv() {
        let mut previous = 0;
        for ndv in [10.0, 100.0, 400.0, 499.0, 500.0, 2000.0, 9000.0] {
            let mut catalog = t0_catalog(10_000);
            set_ndv(&mut catalog, "t0", "v2", ndv);
            let plan = optimize(&catalog, sum_v2_group_by(v(2)), &OptimizerConfig::default());
            let phases = stages(&plan).len();
            assert!(phases >= previous, "ndv {} went from {} to {} phases", ndv, previous, phases);
            previous = phases;
        }
        assert_eq!(previous, 2);
    }

    #[test]
    fn test_group_by_bucket_column_is_colocated() {
        let catalog = t0_catalog(10_000);
        let plan = LogicalPlan::aggregate(
            vec![v(1)],
            vec![AggExpr::count_star(ColumnRef::new(4, "count"))],
            t0_scan(),
        );
        let plan = optimize(&catalog, plan, &OptimizerConfig::default());
        assert_eq!(stages(&plan), vec![(AggMode::UpdateFinalize, false)]);
        assert!(exchanges(&plan).is_empty());
    }

    #[test]
    fn test_global_aggregate_gathers_partials() {
        let catalog = t0_catalog(10_000);
        let plan = LogicalPlan::aggregate(
            vec![],
            vec![AggExpr::count_star(ColumnRef::new(4, "count"))],
            t0_scan(),
        );
        let plan = optimize(&catalog, plan, &OptimizerConfig::default());
        assert_eq!(
            stages(&plan),
            vec![(AggMode::MergeFinalize, false), (AggMode::UpdateSerialize, false)]
        );
        assert_eq!(exchanges(&plan), vec![ExchangeKind::Gather]);
    }

    #[test]
    fn test_grouped_distinct_uses_three_phases() {
        let catalog = t0_catalog(10_000);
        let plan = LogicalPlan::aggregate(
            vec![v(3)],
            vec![AggExpr::new(AggFunc::Count, Expr::col(&v(2)), ColumnRef::new(4, "count")).distinct()],
            t0_scan(),
        );
        let plan = optimize(&catalog, plan, &OptimizerConfig::default());
        let modes: Vec<AggMode> = stages(&plan).into_iter().map(|(m, _)| m).collect();
        assert_eq!(
            modes,
            vec![AggMode::UpdateFinalize, AggMode::MergeSerialize, AggMode::UpdateSerialize]
        );
        assert_eq!(exchanges(&plan), vec![ExchangeKind::Shuffle(vec![v(3)])]);
        match &plan.root.op {
            PhysicalOp::HashAggregate { aggregates, .. } => {
                assert_eq!(aggregates[0].to_string(), "count(2: v2)");
            }
            other => panic!("unexpected root {:?}", other),
        }
    }

    #[test]
    fn test_global_distinct_uses_four_phases() {
        let catalog = t0_catalog(10_000);
        let plan = LogicalPlan::aggregate(
            vec![],
            vec![AggExpr::new(AggFunc::Count, Expr::col(&v(2)), ColumnRef::new(4, "count")).distinct()],
            t0_scan(),
        );
        let plan = optimize(&catalog, plan, &OptimizerConfig::default());
        let modes: Vec<AggMode> = stages(&plan).into_iter().map(|(m, _)| m).collect();
        assert_eq!(
            modes,
            vec![
                AggMode::MergeFinalize,
                AggMode::UpdateSerialize,
                AggMode::MergeSerialize,
                AggMode::UpdateSerialize,
            ]
        );
        assert_eq!(
            exchanges(&plan),
            vec![ExchangeKind::Gather, ExchangeKind::Shuffle(vec![v(2)])]
        );
    }
}
