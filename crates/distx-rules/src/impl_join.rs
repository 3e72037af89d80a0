//! # Join Distribution Selection
//!
//! Implements logical joins as distributed hash joins (or nested-loop joins when
//! the condition has no equi key). The strategy decides which side moves:
//!
//! | Strategy        | Probe side          | Build side                       |
//! |-----------------|---------------------|----------------------------------|
//! | `Colocate`      | stays               | stays                            |
//! | `BucketShuffle` | stays               | shuffled by the probe's buckets  |
//! | `Broadcast`     | stays               | copied to every backend          |
//! | `Replicated`    | stays               | copied to every backend          |
//! | `Shuffle`       | shuffled on the keys| shuffled on the keys             |
//!
//! The first feasible strategy in that order wins, so a colocate join is chosen
//! even when a broadcast would be estimated cheaper. Inner joins are planned in
//! both orientations: the orientation with the higher-precedence strategy wins,
//! ties go to the cheaper one. Outer, semi and anti joins keep their sides.
//!
//! A join hint forces its strategy when it is feasible. Infeasible hints fall back
//! to the precedence order and the reason is kept on the join node next to the
//! reason colocation was not possible.

use distx_core::config::OptimizerConfig;
use distx_core::error::Result;
use distx_core::expr::*;
use distx_core::pattern::Pattern;
use distx_core::physical::{JoinDistribution, PhysicalOp, PlanNode};
use distx_core::plan::LogicalPlan;
use distx_core::properties::{BucketSpec, DistributionRequirement};
use distx_core::rule::{OptContext, Rule, RuleType};
use distx_core::stats::Statistics;
use std::collections::HashSet;
use tracing::debug;

/// Implement equi joins as hash joins with a distribution strategy.
pub struct ImplHashJoinRule;

impl Rule for ImplHashJoinRule {
    fn name(&self) -> &str {
        "ImplHashJoin"
    }

    fn rule_type(&self) -> RuleType {
        RuleType::Implementation
    }

    fn pattern(&self) -> Pattern {
        Pattern::join()
    }

    fn implement(
        &self,
        plan: &LogicalPlan,
        children: &[PlanNode],
        stats: &Statistics,
        ctx: &mut OptContext,
    ) -> Result<Vec<PlanNode>> {
        let LogicalOp::Join {
            join_type,
            condition,
            hint,
        } = &plan.op
        else {
            return Ok(vec![]);
        };
        let [left, right] = children else {
            return Ok(vec![]);
        };
        let (eq_keys, residual) = extract_equi_keys(condition.as_ref(), &ids(left), &ids(right));
        if eq_keys.is_empty() {
            return Ok(vec![]);
        }
        let join_type = match join_type {
            JoinType::Cross => JoinType::Inner,
            other => *other,
        };
        let other_condition = Expr::and_all(residual);

        let mut orientations = vec![Orientation {
            probe: left,
            build: right,
            eq_keys: eq_keys.clone(),
        }];
        if join_type == JoinType::Inner {
            orientations.push(Orientation {
                probe: right,
                build: left,
                eq_keys: eq_keys.iter().map(|(l, r)| (r.clone(), l.clone())).collect(),
            });
        }

        let mut best: Option<PlanNode> = None;
        let mut best_precedence = 0;
        for orientation in &orientations {
            let (strategy, reasons) = choose_strategy(orientation, join_type, *hint, ctx.config);
            let distribution = strategy.distribution();
            let (probe_req, build_req) = strategy.requirements(orientation);
            let probe = ctx.enforce(orientation.probe.clone(), &probe_req);
            let build = ctx.enforce(orientation.build.clone(), &build_req);
            let node = ctx.make_node(
                PhysicalOp::HashJoin {
                    join_type,
                    distribution,
                    eq_keys: orientation.eq_keys.clone(),
                    other_condition: other_condition.clone(),
                    colocate_reason: reasons.join("; "),
                    runtime_filters: Vec::new(),
                },
                vec![probe, build],
                stats.clone(),
            );
            let precedence = distribution.precedence();
            let better = match &best {
                None => true,
                Some(current) => {
                    precedence > best_precedence
                        || (precedence == best_precedence && node.cost < current.cost)
                }
            };
            if better {
                best_precedence = precedence;
                best = Some(node);
            }
        }

        if let Some(node) = &best {
            if let PhysicalOp::HashJoin { distribution, .. } = &node.op {
                debug!(
                    "{} join planned as {} (probe rows={:.0}, build rows={:.0})",
                    join_type,
                    distribution,
                    node.children[0].stats.row_count,
                    node.children[1].stats.row_count
                );
            }
        }
        Ok(best.into_iter().collect())
    }
}

/// Implement joins without an equi key as nested-loop joins.
///
/// The right side is broadcast; right and full outer joins need every row of both
/// sides in one place, so both are gathered instead.
pub struct ImplNestLoopJoinRule;

impl Rule for ImplNestLoopJoinRule {
    fn name(&self) -> &str {
        "ImplNestLoopJoin"
    }

    fn rule_type(&self) -> RuleType {
        RuleType::Implementation
    }

    fn pattern(&self) -> Pattern {
        Pattern::join()
    }

    fn implement(
        &self,
        plan: &LogicalPlan,
        children: &[PlanNode],
        stats: &Statistics,
        ctx: &mut OptContext,
    ) -> Result<Vec<PlanNode>> {
        let LogicalOp::Join {
            join_type,
            condition,
            ..
        } = &plan.op
        else {
            return Ok(vec![]);
        };
        let [left, right] = children else {
            return Ok(vec![]);
        };
        let (eq_keys, _) = extract_equi_keys(condition.as_ref(), &ids(left), &ids(right));
        if !eq_keys.is_empty() {
            return Ok(vec![]);
        }

        let (left, right) = if matches!(join_type, JoinType::Right | JoinType::Full) {
            (
                ctx.enforce(left.clone(), &DistributionRequirement::Single),
                ctx.enforce(right.clone(), &DistributionRequirement::Single),
            )
        } else {
            (
                left.clone(),
                ctx.enforce(right.clone(), &DistributionRequirement::Replicated),
            )
        };
        debug!("{} join without equi keys planned as nested loop", join_type);
        let node = ctx.make_node(
            PhysicalOp::NestLoopJoin {
                join_type: *join_type,
                condition: condition.clone(),
            },
            vec![left, right],
            stats.clone(),
        );
        Ok(vec![node])
    }
}

fn ids(node: &PlanNode) -> HashSet<ColumnId> {
    node.output.iter().map(|c| c.id).collect()
}

/// One way of assigning the join inputs to the probe and build roles.
struct Orientation<'a> {
    probe: &'a PlanNode,
    build: &'a PlanNode,
    /// `(probe column, build column)` pairs.
    eq_keys: Vec<(ColumnRef, ColumnRef)>,
}

enum Strategy {
    Colocate,
    /// Build columns to shuffle on, in the probe's bucket column order.
    BucketShuffle(Vec<ColumnRef>, BucketSpec),
    Broadcast,
    Replicated,
    Shuffle,
}

impl Strategy {
    fn distribution(&self) -> JoinDistribution {
        match self {
            Strategy::Colocate => JoinDistribution::Colocate,
            Strategy::BucketShuffle(..) => JoinDistribution::BucketShuffle,
            Strategy::Broadcast => JoinDistribution::Broadcast,
            Strategy::Replicated => JoinDistribution::Replicated,
            Strategy::Shuffle => JoinDistribution::Shuffle,
        }
    }

    /// What the probe and build inputs must deliver.
    fn requirements(&self, o: &Orientation) -> (DistributionRequirement, DistributionRequirement) {
        match self {
            Strategy::Colocate => (DistributionRequirement::Any, DistributionRequirement::Any),
            Strategy::BucketShuffle(columns, spec) => (
                DistributionRequirement::Any,
                DistributionRequirement::BucketShuffle {
                    columns: columns.clone(),
                    spec: spec.clone(),
                },
            ),
            Strategy::Broadcast | Strategy::Replicated => {
                (DistributionRequirement::Any, DistributionRequirement::Replicated)
            }
            Strategy::Shuffle => (
                DistributionRequirement::ShuffleHash(o.eq_keys.iter().map(|(p, _)| p.clone()).collect()),
                DistributionRequirement::ShuffleHash(o.eq_keys.iter().map(|(_, b)| b.clone()).collect()),
            ),
        }
    }
}

/// Pick the strategy for one orientation. Also returns why colocation (or a
/// hinted strategy) was not used.
fn choose_strategy(
    o: &Orientation,
    join_type: JoinType,
    hint: JoinHint,
    config: &OptimizerConfig,
) -> (Strategy, Vec<String>) {
    let mut reasons = Vec::new();
    let colocate = check_colocate(o, config);
    if let Err(reason) = &colocate {
        reasons.push(reason.clone());
    }
    let semi_like = matches!(join_type, JoinType::Semi | JoinType::Anti);

    let hinted = match hint {
        JoinHint::None => None,
        JoinHint::Shuffle => Some(Strategy::Shuffle),
        JoinHint::Colocate => match &colocate {
            Ok(()) => Some(Strategy::Colocate),
            Err(_) => {
                reasons.push("colocate hint ignored".to_string());
                None
            }
        },
        JoinHint::Bucket => match check_bucket_shuffle(o, config) {
            Ok((columns, spec)) => Some(Strategy::BucketShuffle(columns, spec)),
            Err(reason) => {
                reasons.push(format!("bucket hint ignored: {}", reason));
                None
            }
        },
        JoinHint::Broadcast => match check_broadcast_allowed(join_type) {
            Ok(()) => Some(Strategy::Broadcast),
            Err(reason) => {
                reasons.push(format!("broadcast hint ignored: {}", reason));
                None
            }
        },
        JoinHint::Replicated => {
            if !semi_like {
                reasons.push("replicated hint needs a semi or anti join, using broadcast".to_string());
            }
            match check_broadcast_allowed(join_type) {
                Ok(()) if semi_like => Some(Strategy::Replicated),
                Ok(()) => Some(Strategy::Broadcast),
                Err(reason) => {
                    reasons.push(format!("replicated hint ignored: {}", reason));
                    None
                }
            }
        }
    };
    if let Some(strategy) = hinted {
        return (strategy, reasons);
    }

    if colocate.is_ok() {
        return (Strategy::Colocate, reasons);
    }
    if let Ok((columns, spec)) = check_bucket_shuffle(o, config) {
        return (Strategy::BucketShuffle(columns, spec), reasons);
    }
    if check_broadcast_allowed(join_type).is_ok() && broadcast_pays_off(o, config) {
        if semi_like && config.enable_replicate_join {
            return (Strategy::Replicated, reasons);
        }
        return (Strategy::Broadcast, reasons);
    }
    (Strategy::Shuffle, reasons)
}

/// Both inputs bucketed with the same layout, and every bucket column pair joined
/// by an equi key.
fn check_colocate(o: &Orientation, config: &OptimizerConfig) -> std::result::Result<(), String> {
    if !config.enable_colocate_join {
        return Err("colocate join is disabled".to_string());
    }
    let Some((probe_columns, probe_spec)) = o.probe.distribution.bucket() else {
        return Err("probe side is not bucketed".to_string());
    };
    let Some((build_columns, build_spec)) = o.build.distribution.bucket() else {
        return Err("build side is not bucketed".to_string());
    };
    if probe_spec != build_spec {
        return Err("inputs are not in the same colocate group".to_string());
    }
    if probe_columns.len() != build_columns.len() {
        return Err("bucket columns differ".to_string());
    }
    let paired = probe_columns.iter().zip(build_columns).all(|(p, b)| {
        o.eq_keys
            .iter()
            .any(|(kp, kb)| kp.id == p.id && kb.id == b.id)
    });
    if !paired {
        return Err("join keys do not cover the bucket columns".to_string());
    }
    Ok(())
}

/// The probe side is bucketed and every bucket column is a probe join key. Returns
/// the build columns to shuffle on, paired with the probe bucket columns.
fn check_bucket_shuffle(
    o: &Orientation,
    config: &OptimizerConfig,
) -> std::result::Result<(Vec<ColumnRef>, BucketSpec), String> {
    if !config.enable_bucket_shuffle_join {
        return Err("bucket shuffle join is disabled".to_string());
    }
    let Some((probe_columns, spec)) = o.probe.distribution.bucket() else {
        return Err("probe side is not bucketed".to_string());
    };
    let build_columns = probe_columns
        .iter()
        .map(|p| {
            o.eq_keys
                .iter()
                .find(|(kp, _)| kp.id == p.id)
                .map(|(_, kb)| kb.clone())
        })
        .collect::<Option<Vec<_>>>()
        .ok_or_else(|| "join keys do not cover the probe bucket columns".to_string())?;
    Ok((build_columns, spec.clone()))
}

/// A right or full outer join must see every build row exactly once.
fn check_broadcast_allowed(join_type: JoinType) -> std::result::Result<(), String> {
    match join_type {
        JoinType::Right | JoinType::Full => Err(format!("{} cannot broadcast its build side", join_type)),
        _ => Ok(()),
    }
}

/// The build side is small enough to copy to every backend, and copying it costs
/// no more than shuffling both inputs. Sizes only count when both row counts are
/// known; otherwise the join shuffles.
fn broadcast_pays_off(o: &Orientation, config: &OptimizerConfig) -> bool {
    let build = &o.build.stats;
    let probe = &o.probe.stats;
    if !build.row_count_known || !probe.row_count_known {
        return false;
    }
    if build.row_count > config.broadcast_row_count_threshold as f64 {
        return false;
    }
    let build_bytes = build.output_size();
    if build_bytes > config.broadcast_size_threshold_bytes as f64 {
        return false;
    }
    build_bytes * config.backend_count as f64 <= probe.output_size() + build_bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;
    use distx_core::physical::PhysicalPlan;
    use distx_core::properties::ExchangeKind;

    fn t0_alias() -> LogicalPlan {
        LogicalPlan::scan(ScanOp::new(
            TableRef::new("test", "t0"),
            vec![ColumnRef::new(4, "v1"), ColumnRef::new(5, "v2"), ColumnRef::new(6, "v3")],
        ))
    }

    fn join_on(join_type: JoinType, left: LogicalPlan, right: LogicalPlan, l: u32, r: u32) -> LogicalPlan {
        let right_col = right
            .output_columns()
            .into_iter()
            .find(|c| c.id.0 == r)
            .expect("right key column");
        LogicalPlan::join(
            join_type,
            Some(Expr::eq(Expr::col(&v(l)), Expr::col(&right_col))),
            left,
            right,
        )
    }

    fn join_of(plan: &PhysicalPlan) -> (&PlanNode, JoinDistribution) {
        let node = find_op(&plan.root, |op| matches!(op, PhysicalOp::HashJoin { .. }))
            .unwrap_or_else(|| panic!("no hash join in\n{}", plan.root.display(0)));
        match &node.op {
            PhysicalOp::HashJoin { distribution, .. } => (node, *distribution),
            _ => unreachable!(),
        }
    }

    fn with_hint(plan: LogicalPlan, hint: JoinHint) -> LogicalPlan {
        let LogicalPlan { op, children } = plan;
        match op {
            LogicalOp::Join {
                join_type,
                condition,
                ..
            } => LogicalPlan::new(
                LogicalOp::Join {
                    join_type,
                    condition,
                    hint,
                },
                children,
            ),
            op => LogicalPlan::new(op, children),
        }
    }

    #[test]
    fn test_self_join_on_bucket_column_is_colocated() {
        let catalog = t0_catalog(10_000);
        let plan = join_on(JoinType::Inner, t0_scan(), t0_alias(), 1, 4);
        let physical = optimize(&catalog, plan, &OptimizerConfig::default());
        let (node, distribution) = join_of(&physical);
        assert_eq!(distribution, JoinDistribution::Colocate);
        assert!(node
            .children
            .iter()
            .all(|c| !matches!(c.op, PhysicalOp::Exchange { .. })));
    }

    #[test]
    fn test_colocate_beats_cheaper_broadcast() {
        let catalog = t0_catalog(10_000);
        let filtered = LogicalPlan::filter(
            Expr::binary(BinaryOp::Lt, Expr::col(&ColumnRef::new(5, "v2")), Expr::int(10)),
            t0_alias(),
        );
        let plan = join_on(JoinType::Inner, t0_scan(), filtered, 1, 4);
        let physical = optimize(&catalog, plan, &OptimizerConfig::default());
        assert_eq!(join_of(&physical).1, JoinDistribution::Colocate);
    }

    #[test]
    fn test_bucket_shuffle_moves_only_build_side() {
        let catalog = t0_catalog(10_000);
        let plan = join_on(JoinType::Inner, t0_scan(), t1_scan(), 1, 4);
        let physical = optimize(&catalog, plan, &OptimizerConfig::default());
        let (node, distribution) = join_of(&physical);
        assert_eq!(distribution, JoinDistribution::BucketShuffle);
        assert!(!matches!(node.children[0].op, PhysicalOp::Exchange { .. }));
        assert!(matches!(
            node.children[1].op,
            PhysicalOp::Exchange {
                kind: ExchangeKind::BucketShuffle(..),
                ..
            }
        ));
        let PhysicalOp::HashJoin { colocate_reason, .. } = &node.op else {
            unreachable!();
        };
        assert_eq!(colocate_reason, "inputs are not in the same colocate group");
    }

    #[test]
    fn test_small_build_side_is_broadcast_in_best_orientation() {
        let mut catalog = t0_catalog(10_000);
        catalog.set_row_count(&TableRef::new("test", "t1"), 100);
        let config = OptimizerConfig {
            enable_bucket_shuffle_join: false,
            ..Default::default()
        };
        // written with the small table on the probe side
        let plan = join_on(JoinType::Inner, t1_scan(), t0_scan(), 4, 1);
        let physical = optimize(&catalog, plan, &config);
        let (node, distribution) = join_of(&physical);
        assert_eq!(distribution, JoinDistribution::Broadcast);
        assert_eq!(node.children[1].stats.row_count, 100.0);
    }

    #[test]
    fn test_unknown_row_count_shuffles() {
        use distx_core::catalog::{ColumnMeta, TableMeta};

        let mut catalog = t0_catalog(10_000);
        let t2 = TableRef::new("test", "t2");
        catalog.add_table(TableMeta::new(
            t2.clone(),
            vec![ColumnMeta::key("v7"), ColumnMeta::key("v8")],
        ));
        let config = OptimizerConfig {
            enable_bucket_shuffle_join: false,
            ..Default::default()
        };
        let t2_scan = LogicalPlan::scan(ScanOp::new(t2, vec![v(7), v(8)]));
        let plan = join_on(JoinType::Inner, t0_scan(), t2_scan, 1, 7);
        let physical = optimize(&catalog, plan, &config);
        let (node, distribution) = join_of(&physical);
        assert_eq!(distribution, JoinDistribution::Shuffle);
        assert!(!node.stats.row_count_known);
    }

    #[test]
    fn test_right_join_never_broadcasts() {
        let mut catalog = t0_catalog(10_000);
        catalog.set_row_count(&TableRef::new("test", "t1"), 100);
        let config = OptimizerConfig {
            enable_bucket_shuffle_join: false,
            ..Default::default()
        };
        let plan = join_on(JoinType::Right, t0_scan(), t1_scan(), 1, 4);
        let physical = optimize(&catalog, plan, &config);
        assert_eq!(join_of(&physical).1, JoinDistribution::Shuffle);
    }

    #[test]
    fn test_shuffle_hint_overrides_precedence() {
        let catalog = t0_catalog(10_000);
        let plan = with_hint(join_on(JoinType::Inner, t0_scan(), t0_alias(), 1, 4), JoinHint::Shuffle);
        let physical = optimize(&catalog, plan, &OptimizerConfig::default());
        assert_eq!(join_of(&physical).1, JoinDistribution::Shuffle);
    }

    #[test]
    fn test_infeasible_broadcast_hint_falls_back_with_reason() {
        let catalog = t0_catalog(10_000);
        let plan = with_hint(join_on(JoinType::Full, t0_scan(), t1_scan(), 1, 4), JoinHint::Broadcast);
        let physical = optimize(&catalog, plan, &OptimizerConfig::default());
        let (node, distribution) = join_of(&physical);
        assert_eq!(distribution, JoinDistribution::BucketShuffle);
        let PhysicalOp::HashJoin { colocate_reason, .. } = &node.op else {
            unreachable!();
        };
        assert!(colocate_reason.contains("broadcast hint ignored"), "{}", colocate_reason);
    }

    #[test]
    fn test_semi_join_replicates_when_enabled() {
        let mut catalog = t0_catalog(10_000);
        catalog.set_row_count(&TableRef::new("test", "t1"), 100);
        let config = OptimizerConfig {
            enable_bucket_shuffle_join: false,
            enable_replicate_join: true,
            ..Default::default()
        };
        let plan = join_on(JoinType::Semi, t0_scan(), t1_scan(), 1, 4);
        let physical = optimize(&catalog, plan, &config);
        assert_eq!(join_of(&physical).1, JoinDistribution::Replicated);
    }

    #[test]
    fn test_cross_join_uses_nest_loop_with_broadcast() {
        let catalog = t0_catalog(10_000);
        let plan = LogicalPlan::join(JoinType::Cross, None, t0_scan(), t1_scan());
        let physical = optimize(&catalog, plan, &OptimizerConfig::default());
        let node = find_op(&physical.root, |op| matches!(op, PhysicalOp::NestLoopJoin { .. }))
            .expect("nest loop join");
        assert!(matches!(
            node.children[1].op,
            PhysicalOp::Exchange {
                kind: ExchangeKind::Broadcast,
                ..
            }
        ));
        assert!(find_op(&physical.root, |op| matches!(op, PhysicalOp::HashJoin { .. })).is_none());
    }
}
