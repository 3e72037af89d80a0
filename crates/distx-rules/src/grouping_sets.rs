//! # Grouping Sets to UNION ALL
//!
//! `Aggregate(Repeat(x))` multiplies every input row by the number of grouping
//! sets before aggregating. When `rewrite_grouping_sets_to_union_all` is set the
//! pair is lowered instead into one aggregate per grouping set over a shared CTE:
//!
//! ```text
//! UNION ALL
//!   Project(absent keys := NULL, GROUPING_ID := id)
//!     Aggregate(keys of set 0)
//!       CteConsumer(x)
//!   Project(...)
//!     Aggregate(keys of set 1)
//!       CteConsumer(x)
//!   ...
//! ```
//!
//! Every branch reads fresh column ids, so the branches are independent subtrees;
//! the UNION ALL outputs the original aggregate's columns. Aggregations with
//! DISTINCT aggregates keep the Repeat form.

use distx_core::error::Result;
use distx_core::expr::*;
use distx_core::pattern::Pattern;
use distx_core::plan::LogicalPlan;
use distx_core::rule::{OptContext, Rule, RuleType};
use std::collections::HashMap;
use tracing::debug;

pub struct GroupingSetsToUnionAllRule;

impl Rule for GroupingSetsToUnionAllRule {
    fn name(&self) -> &str {
        "GroupingSetsToUnionAll"
    }

    fn rule_type(&self) -> RuleType {
        RuleType::Transformation
    }

    fn pattern(&self) -> Pattern {
        Pattern::aggregate_repeat()
    }

    fn transform(&self, plan: &LogicalPlan, ctx: &mut OptContext) -> Result<Option<LogicalPlan>> {
        if !ctx.config.rewrite_grouping_sets_to_union_all {
            return Ok(None);
        }
        let LogicalOp::Aggregate {
            group_by,
            aggregates,
        } = &plan.op
        else {
            return Ok(None);
        };
        if aggregates.iter().any(|a| a.distinct) {
            return Ok(None);
        }
        let Some(repeat) = plan.children.first() else {
            return Ok(None);
        };
        let LogicalOp::Repeat {
            repeat_columns,
            grouping_sets,
            grouping_id,
        } = &repeat.op
        else {
            return Ok(None);
        };
        let Some(input) = repeat.children.first() else {
            return Ok(None);
        };

        let input_columns = input.output_columns();
        let cte_id = ctx.register_cte(input.clone());
        let ids = grouping_ids(repeat_columns, grouping_sets);
        let output = plan.output_columns();

        let mut branches = Vec::with_capacity(grouping_sets.len());
        let mut inputs = Vec::with_capacity(grouping_sets.len());
        for (set, id) in grouping_sets.iter().zip(ids) {
            let absent = |c: &ColumnRef| {
                repeat_columns.iter().any(|r| r.id == c.id) && !set.contains(&c.id)
            };

            let mut consumer_columns = Vec::with_capacity(input_columns.len());
            let mut mapping: HashMap<ColumnId, Expr> = HashMap::new();
            for column in &input_columns {
                let fresh = ctx.create_column(column.name.clone());
                let value = if absent(column) {
                    Expr::lit(ScalarValue::Null)
                } else {
                    Expr::col(&fresh)
                };
                mapping.insert(column.id, value);
                consumer_columns.push((fresh, column.id));
            }
            let fresh_of = |c: &ColumnRef| -> Option<ColumnRef> {
                consumer_columns
                    .iter()
                    .find(|(_, source)| *source == c.id)
                    .map(|(fresh, _)| fresh.clone())
            };

            let set_group_by: Vec<ColumnRef> = group_by
                .iter()
                .filter(|g| g.id != grouping_id.id && !absent(g))
                .filter_map(|g| fresh_of(g))
                .collect();
            let set_aggregates: Vec<AggExpr> = aggregates
                .iter()
                .map(|a| AggExpr {
                    func: a.func,
                    arg: a.arg.as_ref().map(|e| e.substitute(&mapping)),
                    distinct: false,
                    output: ctx.create_column(a.output.name.clone()),
                })
                .collect();

            let mut projection = Vec::with_capacity(output.len());
            for g in group_by {
                let expr = if g.id == grouping_id.id {
                    Expr::int(id as i64)
                } else if absent(g) {
                    Expr::lit(ScalarValue::Null)
                } else {
                    match fresh_of(g) {
                        Some(fresh) => Expr::col(&fresh),
                        None => return Ok(None),
                    }
                };
                projection.push((ctx.create_column(g.name.clone()), expr));
            }
            for (original, rewritten) in aggregates.iter().zip(&set_aggregates) {
                projection.push((
                    ctx.create_column(original.output.name.clone()),
                    Expr::col(&rewritten.output),
                ));
            }
            inputs.push(projection.iter().map(|(c, _)| c.clone()).collect());

            let consumer = LogicalPlan::new(
                LogicalOp::CteConsumer {
                    cte_id,
                    columns: consumer_columns,
                },
                vec![],
            );
            branches.push(LogicalPlan::project(
                projection,
                LogicalPlan::aggregate(set_group_by, set_aggregates, consumer),
            ));
        }

        debug!(
            "Lowered {} grouping sets into UNION ALL over cte {}",
            branches.len(),
            cte_id
        );
        Ok(Some(LogicalPlan::new(
            LogicalOp::SetOperation {
                kind: SetOpKind::UnionAll,
                output,
                inputs,
            },
            branches,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;
    use distx_core::config::OptimizerConfig;
    use distx_core::physical::PhysicalOp;

    fn rollup_count() -> LogicalPlan {
        let repeat = LogicalPlan::new(
            LogicalOp::Repeat {
                repeat_columns: vec![v(1), v(2)],
                grouping_sets: vec![vec![ColumnId(1), ColumnId(2)], vec![ColumnId(1)], vec![]],
                grouping_id: ColumnRef::new(4, "GROUPING_ID"),
            },
            vec![t0_scan()],
        );
        LogicalPlan::aggregate(
            vec![v(1), v(2), ColumnRef::new(4, "GROUPING_ID")],
            vec![AggExpr::count_star(ColumnRef::new(5, "count"))],
            repeat,
        )
    }

    fn enabled() -> OptimizerConfig {
        OptimizerConfig {
            rewrite_grouping_sets_to_union_all: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_rollup_becomes_union_of_aggregates() {
        let catalog = t0_catalog(10_000);
        let config = enabled();
        let plan = rollup_count();
        let (rewritten, ctes) = with_context(&catalog, &config, |ctx| {
            let rewritten = GroupingSetsToUnionAllRule
                .transform(&plan, ctx)
                .expect("transform")
                .expect("rule applies");
            (rewritten, ctx.ctes.len())
        });
        assert_eq!(ctes, 1);
        let LogicalOp::SetOperation {
            kind,
            output,
            inputs,
        } = &rewritten.op
        else {
            panic!("expected union, got {:?}", rewritten.op);
        };
        assert_eq!(*kind, SetOpKind::UnionAll);
        assert_eq!(output, &plan.output_columns());
        assert_eq!(inputs.len(), 3);

        // second grouping set: (v1)
        let LogicalOp::Project { exprs } = &rewritten.children[1].op else {
            panic!("expected project");
        };
        assert_eq!(exprs[1].1, Expr::lit(ScalarValue::Null));
        assert_eq!(exprs[2].1, Expr::int(1));
        let LogicalOp::Aggregate { group_by, .. } = &rewritten.children[1].children[0].op else {
            panic!("expected aggregate");
        };
        assert_eq!(group_by.len(), 1);
        assert_eq!(group_by[0].name, "v1");

        // empty grouping set aggregates globally
        let LogicalOp::Aggregate { group_by, .. } = &rewritten.children[2].children[0].op else {
            panic!("expected aggregate");
        };
        assert!(group_by.is_empty());
    }

    #[test]
    fn test_disabled_or_distinct_keeps_repeat() {
        let catalog = t0_catalog(10_000);
        let plan = rollup_count();
        let default = OptimizerConfig::default();
        with_context(&catalog, &default, |ctx| {
            assert!(GroupingSetsToUnionAllRule.transform(&plan, ctx).expect("transform").is_none());
        });

        let config = enabled();
        let LogicalPlan { children, .. } = rollup_count();
        let distinct = LogicalPlan::aggregate(
            vec![v(1), v(2), ColumnRef::new(4, "GROUPING_ID")],
            vec![AggExpr::new(AggFunc::Count, Expr::col(&v(3)), ColumnRef::new(5, "count")).distinct()],
            children.into_iter().next().expect("repeat"),
        );
        with_context(&catalog, &config, |ctx| {
            assert!(GroupingSetsToUnionAllRule
                .transform(&distinct, ctx)
                .expect("transform")
                .is_none());
        });
    }

    #[test]
    fn test_lowered_plan_has_no_repeat() {
        let catalog = t0_catalog(10_000);
        let plan = optimize(&catalog, rollup_count(), &enabled());
        let mut repeats = 0;
        plan.visit(&mut |n| {
            if matches!(n.op, PhysicalOp::Repeat { .. }) {
                repeats += 1;
            }
        });
        assert_eq!(repeats, 0);
        assert!(matches!(plan.root.op, PhysicalOp::SetOperation { .. }));
    }
}
