//! # Predicate Pushdown Rules
//!
//! Predicate pushdown reduces the amount of data flowing through the plan as early
//! as possible. Two rules share the same machinery:
//!
//! - [`PredicatePushdownRule`] matches a Filter and sinks its conjuncts through
//!   projections, sorts, aggregates (grouping keys only), repeats (columns present
//!   in every grouping set), set operations (into every branch) and joins, down
//!   into the scans' predicate lists.
//! - [`JoinPredicatePushdownRule`] matches a Join and moves the single-side
//!   conjuncts of its ON condition into the inputs.
//!
//! ## Join Semantics
//!
//! Which side may receive a conjunct depends on where it comes from. A WHERE
//! conjunct may filter a side whose rows survive the join unchanged; an ON
//! conjunct may only filter a side that does not get null-extended:
//!
//! ```text
//!                 WHERE left  WHERE right  ON left  ON right
//! INNER / CROSS       yes         yes        yes       yes
//! LEFT OUTER          yes          -          -        yes
//! RIGHT OUTER          -          yes        yes        -
//! LEFT SEMI           yes          -         yes       yes
//! LEFT ANTI           yes          -          -        yes
//! FULL OUTER           -           -          -         -
//! ```
//!
//! ## Derived Predicates
//!
//! A `column <op> literal` conjunct on one equi-join key also holds for the paired
//! key of every matching row, so the same comparison is derived for the other side
//! whenever that side may be filtered by the join condition:
//!
//! ```text
//! t0 LEFT JOIN t1 ON t0.v1 = t1.v4 AND t0.v1 = 1
//!   => t1 scan gets v4 = 1, t0 keeps every row
//! ```
//!
//! The rewrite pass never revisits subtrees a rule produced, so the pushdown
//! recurses on its own until every conjunct has found its lowest position.

use distx_core::error::Result;
use distx_core::expr::*;
use distx_core::pattern::Pattern;
use distx_core::plan::LogicalPlan;
use distx_core::rule::{OptContext, Rule, RuleType};
use std::collections::{HashMap, HashSet};
use tracing::trace;

/// Sink filter conjuncts as deep into the tree as they can go.
pub struct PredicatePushdownRule;

impl Rule for PredicatePushdownRule {
    fn name(&self) -> &str {
        "PredicatePushdown"
    }

    fn rule_type(&self) -> RuleType {
        RuleType::Transformation
    }

    fn pattern(&self) -> Pattern {
        Pattern::filter()
    }

    fn transform(&self, plan: &LogicalPlan, _ctx: &mut OptContext) -> Result<Option<LogicalPlan>> {
        let LogicalOp::Filter { predicate } = &plan.op else {
            return Ok(None);
        };
        let Some(child) = plan.children.first() else {
            return Ok(None);
        };
        let pushed = push_down(child.clone(), predicate.clone().into_conjuncts());
        if pushed == *plan {
            return Ok(None);
        }
        Ok(Some(pushed))
    }
}

/// Move the single-side conjuncts of a join condition into the join inputs.
pub struct JoinPredicatePushdownRule;

impl Rule for JoinPredicatePushdownRule {
    fn name(&self) -> &str {
        "JoinPredicatePushdown"
    }

    fn rule_type(&self) -> RuleType {
        RuleType::Transformation
    }

    fn pattern(&self) -> Pattern {
        Pattern::join()
    }

    fn transform(&self, plan: &LogicalPlan, _ctx: &mut OptContext) -> Result<Option<LogicalPlan>> {
        let LogicalOp::Join {
            join_type,
            condition: Some(condition),
            hint,
        } = &plan.op
        else {
            return Ok(None);
        };
        let [left, right] = plan.children.as_slice() else {
            return Ok(None);
        };

        let sides = JoinSides::new(left, right);
        let conjuncts = condition.clone().into_conjuncts();
        let keys = sides.keys(&conjuncts);
        let split = sides.split(*join_type, conjuncts, &keys, Origin::On);
        if split.left.is_empty() && split.right.is_empty() {
            return Ok(None);
        }
        trace!(
            "Pushing join conjuncts: left={}, right={}, kept={}",
            split.left.len(),
            split.right.len(),
            split.on.len()
        );
        Ok(Some(LogicalPlan::new(
            LogicalOp::Join {
                join_type: *join_type,
                condition: Expr::and_all(split.on),
                hint: *hint,
            },
            vec![
                push_down(left.clone(), split.left),
                push_down(right.clone(), split.right),
            ],
        )))
    }
}

/// Push `conjuncts` into `plan`; conjuncts that cannot move further end up in a
/// Filter directly above the deepest node that accepted them.
pub fn push_down(plan: LogicalPlan, conjuncts: Vec<Expr>) -> LogicalPlan {
    if conjuncts.is_empty() {
        return plan;
    }
    let LogicalPlan { op, children } = plan;
    match op {
        LogicalOp::Scan(scan) => LogicalPlan::scan(scan.with_predicates(conjuncts)),
        LogicalOp::Filter { predicate } => {
            let mut all = predicate.into_conjuncts();
            for c in conjuncts {
                if !all.contains(&c) {
                    all.push(c);
                }
            }
            match single_child(children) {
                Ok(child) => push_down(child, all),
                Err(children) => LogicalPlan::new(LogicalOp::Filter { predicate: Expr::And(all) }, children),
            }
        }
        LogicalOp::Project { exprs } => {
            let mapping: HashMap<ColumnId, Expr> = exprs.iter().map(|(c, e)| (c.id, e.clone())).collect();
            let below = conjuncts.iter().map(|c| c.substitute(&mapping)).collect();
            rebuild_unary(LogicalOp::Project { exprs }, children, below)
        }
        LogicalOp::Sort { order } => rebuild_unary(LogicalOp::Sort { order }, children, conjuncts),
        LogicalOp::Aggregate {
            group_by,
            aggregates,
        } => {
            let keys: HashSet<ColumnId> = group_by.iter().map(|c| c.id).collect();
            let (below, above) = partition_bound(conjuncts, &keys);
            let op = LogicalOp::Aggregate {
                group_by,
                aggregates,
            };
            filter_above(rebuild_unary(op, children, below), above)
        }
        LogicalOp::Repeat {
            repeat_columns,
            grouping_sets,
            grouping_id,
        } => {
            let varying: HashSet<ColumnId> = repeat_columns
                .iter()
                .filter(|c| grouping_sets.iter().any(|set| !set.contains(&c.id)))
                .map(|c| c.id)
                .collect();
            let stable: HashSet<ColumnId> = children
                .first()
                .map(|c| c.output_ids())
                .unwrap_or_default()
                .into_iter()
                .filter(|id| !varying.contains(id))
                .collect();
            let (below, above) = partition_bound(conjuncts, &stable);
            let op = LogicalOp::Repeat {
                repeat_columns,
                grouping_sets,
                grouping_id,
            };
            filter_above(rebuild_unary(op, children, below), above)
        }
        LogicalOp::SetOperation {
            kind,
            output,
            inputs,
        } => {
            let children = children
                .into_iter()
                .enumerate()
                .map(|(i, child)| {
                    let mapping: HashMap<ColumnId, Expr> = output
                        .iter()
                        .zip(inputs.get(i).into_iter().flatten())
                        .map(|(out, input)| (out.id, Expr::col(input)))
                        .collect();
                    let renamed = conjuncts.iter().map(|c| c.substitute(&mapping)).collect();
                    push_down(child, renamed)
                })
                .collect();
            LogicalPlan::new(
                LogicalOp::SetOperation {
                    kind,
                    output,
                    inputs,
                },
                children,
            )
        }
        LogicalOp::Join {
            join_type,
            condition,
            hint,
        } => {
            let mut children = children.into_iter();
            let (Some(left), Some(right)) = (children.next(), children.next()) else {
                return filter_above(
                    LogicalPlan::new(
                        LogicalOp::Join {
                            join_type,
                            condition,
                            hint,
                        },
                        Vec::new(),
                    ),
                    conjuncts,
                );
            };
            let sides = JoinSides::new(&left, &right);
            let mut key_source = condition.clone().map(Expr::into_conjuncts).unwrap_or_default();
            if matches!(join_type, JoinType::Inner | JoinType::Cross) {
                key_source.extend(conjuncts.iter().cloned());
            }
            let keys = sides.keys(&key_source);
            let split = sides.split(join_type, conjuncts, &keys, Origin::Where);
            let mut on = condition.map(Expr::into_conjuncts).unwrap_or_default();
            append_unique(&mut on, split.on);
            let join_type = if join_type == JoinType::Cross && !on.is_empty() {
                JoinType::Inner
            } else {
                join_type
            };
            let join = LogicalPlan::new(
                LogicalOp::Join {
                    join_type,
                    condition: Expr::and_all(on),
                    hint,
                },
                vec![push_down(left, split.left), push_down(right, split.right)],
            );
            filter_above(join, split.above)
        }
        op @ (LogicalOp::TopN { .. } | LogicalOp::Limit { .. } | LogicalOp::CteConsumer { .. }) => {
            filter_above(LogicalPlan::new(op, children), conjuncts)
        }
    }
}

fn single_child(mut children: Vec<LogicalPlan>) -> std::result::Result<LogicalPlan, Vec<LogicalPlan>> {
    if children.len() == 1 {
        if let Some(child) = children.pop() {
            return Ok(child);
        }
    }
    Err(children)
}

fn rebuild_unary(op: LogicalOp, children: Vec<LogicalPlan>, below: Vec<Expr>) -> LogicalPlan {
    match single_child(children) {
        Ok(child) => LogicalPlan::new(op, vec![push_down(child, below)]),
        Err(children) => filter_above(LogicalPlan::new(op, children), below),
    }
}

fn filter_above(plan: LogicalPlan, conjuncts: Vec<Expr>) -> LogicalPlan {
    match Expr::and_all(conjuncts) {
        Some(predicate) => LogicalPlan::filter(predicate, plan),
        None => plan,
    }
}

fn partition_bound(conjuncts: Vec<Expr>, ids: &HashSet<ColumnId>) -> (Vec<Expr>, Vec<Expr>) {
    conjuncts
        .into_iter()
        .partition(|c| !c.columns().is_empty() && c.bound_by(ids))
}

fn append_unique(target: &mut Vec<Expr>, extra: Vec<Expr>) {
    for e in extra {
        if !target.contains(&e) {
            target.push(e);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    /// A Filter above the join.
    Where,
    /// The join's own condition.
    On,
}

#[derive(Debug, Default)]
struct JoinSplit {
    left: Vec<Expr>,
    right: Vec<Expr>,
    /// Conjuncts that stay in (or move into) the join condition.
    on: Vec<Expr>,
    /// Conjuncts that must stay above the join.
    above: Vec<Expr>,
}

struct JoinSides {
    left_ids: HashSet<ColumnId>,
    right_ids: HashSet<ColumnId>,
}

impl JoinSides {
    fn new(left: &LogicalPlan, right: &LogicalPlan) -> Self {
        Self {
            left_ids: left.output_ids(),
            right_ids: right.output_ids(),
        }
    }

    /// Equi-join key pairs among `conjuncts`, left column first.
    fn keys(&self, conjuncts: &[Expr]) -> Vec<(ColumnRef, ColumnRef)> {
        let condition = Expr::and_all(conjuncts.to_vec());
        extract_equi_keys(condition.as_ref(), &self.left_ids, &self.right_ids).0
    }

    fn split(
        &self,
        join_type: JoinType,
        conjuncts: Vec<Expr>,
        keys: &[(ColumnRef, ColumnRef)],
        origin: Origin,
    ) -> JoinSplit {
        let (left_ok, right_ok) = match origin {
            Origin::Where => where_pushable(join_type),
            Origin::On => on_pushable(join_type),
        };
        let (derive_left, derive_right) = on_pushable(join_type);

        let mut split = JoinSplit::default();
        let mut derived_left = Vec::new();
        let mut derived_right = Vec::new();

        for conjunct in conjuncts {
            let has_columns = !conjunct.columns().is_empty();
            let on_left = has_columns && conjunct.bound_by(&self.left_ids);
            let on_right = has_columns && conjunct.bound_by(&self.right_ids);

            if let Some((column, op, value)) = conjunct.as_column_comparison() {
                for (l, r) in keys {
                    if l.id == column.id && derive_right {
                        derived_right.push(Expr::binary(op, Expr::col(r), Expr::lit(value.clone())));
                    } else if r.id == column.id && derive_left {
                        derived_left.push(Expr::binary(op, Expr::col(l), Expr::lit(value.clone())));
                    }
                }
            }

            if on_left && left_ok {
                split.left.push(conjunct);
            } else if on_right && right_ok {
                split.right.push(conjunct);
            } else if origin == Origin::On || matches!(join_type, JoinType::Inner | JoinType::Cross) {
                split.on.push(conjunct);
            } else {
                split.above.push(conjunct);
            }
        }
        append_unique(&mut split.left, derived_left);
        append_unique(&mut split.right, derived_right);
        split
    }
}

/// Sides a conjunct from a Filter above the join may be pushed into.
fn where_pushable(join_type: JoinType) -> (bool, bool) {
    match join_type {
        JoinType::Inner | JoinType::Cross => (true, true),
        JoinType::Left | JoinType::Semi | JoinType::Anti => (true, false),
        JoinType::Right => (false, true),
        JoinType::Full => (false, false),
    }
}

/// Sides the join condition itself may filter before the join.
fn on_pushable(join_type: JoinType) -> (bool, bool) {
    match join_type {
        JoinType::Inner | JoinType::Cross | JoinType::Semi => (true, true),
        JoinType::Left | JoinType::Anti => (false, true),
        JoinType::Right => (true, false),
        JoinType::Full => (false, false),
    }
}
