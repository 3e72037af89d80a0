//! # Logical Plans and Queries
//!
//! A [`LogicalPlan`] is a tree of logical operators; every node owns its children
//! exclusively. Common table expressions live beside the tree in a
//! [`LogicalQuery`]: the producer plans are stored once and consumers only hold a
//! `(cte_id, column mapping)` pair.
//!
//! Validation happens once, before any rewrite: dangling column references, unknown
//! CTE ids and CTE cycles are rejected with a typed error.

use crate::error::{OptimizerError, Result};
use crate::expr::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LogicalPlan {
    pub op: LogicalOp,
    #[serde(default)]
    pub children: Vec<LogicalPlan>,
}

impl LogicalPlan {
    pub fn new(op: LogicalOp, children: Vec<LogicalPlan>) -> Self {
        Self { op, children }
    }

    pub fn scan(scan: ScanOp) -> Self {
        Self::new(LogicalOp::Scan(scan), vec![])
    }

    pub fn filter(predicate: Expr, child: LogicalPlan) -> Self {
        Self::new(LogicalOp::Filter { predicate }, vec![child])
    }

    pub fn project(exprs: Vec<(ColumnRef, Expr)>, child: LogicalPlan) -> Self {
        Self::new(LogicalOp::Project { exprs }, vec![child])
    }

    pub fn join(join_type: JoinType, condition: Option<Expr>, left: LogicalPlan, right: LogicalPlan) -> Self {
        Self::new(
            LogicalOp::Join {
                join_type,
                condition,
                hint: JoinHint::None,
            },
            vec![left, right],
        )
    }

    pub fn aggregate(group_by: Vec<ColumnRef>, aggregates: Vec<AggExpr>, child: LogicalPlan) -> Self {
        Self::new(
            LogicalOp::Aggregate {
                group_by,
                aggregates,
            },
            vec![child],
        )
    }

    /// Output columns of this node, in order.
    pub fn output_columns(&self) -> Vec<ColumnRef> {
        let child = |i: usize| {
            self.children
                .get(i)
                .map(|c| c.output_columns())
                .unwrap_or_default()
        };
        match &self.op {
            LogicalOp::Scan(scan) => scan.columns.clone(),
            LogicalOp::Filter { .. }
            | LogicalOp::Sort { .. }
            | LogicalOp::TopN { .. }
            | LogicalOp::Limit { .. } => child(0),
            LogicalOp::Project { exprs } => exprs.iter().map(|(c, _)| c.clone()).collect(),
            LogicalOp::Join { join_type, .. } => {
                let mut out = child(0);
                if join_type.outputs_right() {
                    out.extend(child(1));
                }
                out
            }
            LogicalOp::Aggregate {
                group_by,
                aggregates,
            } => group_by
                .iter()
                .cloned()
                .chain(aggregates.iter().map(|a| a.output.clone()))
                .collect(),
            LogicalOp::Repeat { grouping_id, .. } => {
                let mut out = child(0);
                out.push(grouping_id.clone());
                out
            }
            LogicalOp::SetOperation { output, .. } => output.clone(),
            LogicalOp::CteConsumer { columns, .. } => columns.iter().map(|(c, _)| c.clone()).collect(),
        }
    }

    pub fn output_ids(&self) -> HashSet<ColumnId> {
        self.output_columns().into_iter().map(|c| c.id).collect()
    }

    /// Pre-order visit of every node.
    pub fn visit<'a>(&'a self, f: &mut impl FnMut(&'a LogicalPlan)) {
        f(self);
        for child in &self.children {
            child.visit(f);
        }
    }

    /// Largest column id defined or referenced anywhere in the tree.
    pub fn max_column_id(&self) -> ColumnId {
        let mut max = ColumnId(0);
        let mut bump = |c: &ColumnRef| {
            if c.id > max {
                max = c.id;
            }
        };
        self.visit(&mut |node| {
            for c in node.output_columns() {
                bump(&c);
            }
            if let LogicalOp::Aggregate { group_by, .. } = &node.op {
                for c in group_by {
                    bump(c);
                }
            }
        });
        max
    }

    /// Number of consumers of each CTE in this tree.
    pub fn count_cte_consumers(&self, counts: &mut BTreeMap<CteId, usize>) {
        self.visit(&mut |node| {
            if let LogicalOp::CteConsumer { cte_id, .. } = &node.op {
                *counts.entry(*cte_id).or_insert(0) += 1;
            }
        });
    }

    /// Copy of this plan in which every column defined by the tree gets a fresh id.
    ///
    /// Returns the copy and the mapping from old to new columns. Column references to
    /// columns defined outside the tree (none in a well-formed plan) are kept.
    pub fn with_fresh_columns(&self, factory: &mut ColumnFactory) -> (LogicalPlan, HashMap<ColumnId, ColumnRef>) {
        let mut mapping = HashMap::new();
        let plan = self.remap(factory, &mut mapping);
        (plan, mapping)
    }

    fn remap(&self, factory: &mut ColumnFactory, mapping: &mut HashMap<ColumnId, ColumnRef>) -> LogicalPlan {
        let children: Vec<LogicalPlan> = self
            .children
            .iter()
            .map(|c| c.remap(factory, mapping))
            .collect();
        let op = match &self.op {
            LogicalOp::Scan(scan) => {
                let columns: Vec<ColumnRef> = scan
                    .columns
                    .iter()
                    .map(|c| fresh(c, factory, mapping))
                    .collect();
                LogicalOp::Scan(ScanOp {
                    columns,
                    predicates: scan.predicates.iter().map(|p| p.rename(mapping)).collect(),
                    ..scan.clone()
                })
            }
            LogicalOp::Filter { predicate } => LogicalOp::Filter {
                predicate: predicate.rename(mapping),
            },
            LogicalOp::Project { exprs } => {
                let renamed: Vec<Expr> = exprs.iter().map(|(_, e)| e.rename(mapping)).collect();
                LogicalOp::Project {
                    exprs: exprs
                        .iter()
                        .zip(renamed)
                        .map(|((c, _), e)| (fresh(c, factory, mapping), e))
                        .collect(),
                }
            }
            LogicalOp::Join {
                join_type,
                condition,
                hint,
            } => LogicalOp::Join {
                join_type: *join_type,
                condition: condition.as_ref().map(|c| c.rename(mapping)),
                hint: *hint,
            },
            LogicalOp::Aggregate {
                group_by,
                aggregates,
            } => {
                let group_by = group_by.iter().map(|c| renamed(c, mapping)).collect();
                let args: Vec<Option<Expr>> = aggregates
                    .iter()
                    .map(|a| a.arg.as_ref().map(|e| e.rename(mapping)))
                    .collect();
                let aggregates = aggregates
                    .iter()
                    .zip(args)
                    .map(|(a, arg)| AggExpr {
                        func: a.func,
                        arg,
                        distinct: a.distinct,
                        output: fresh(&a.output, factory, mapping),
                    })
                    .collect();
                LogicalOp::Aggregate {
                    group_by,
                    aggregates,
                }
            }
            LogicalOp::Repeat {
                repeat_columns,
                grouping_sets,
                grouping_id,
            } => LogicalOp::Repeat {
                repeat_columns: repeat_columns.iter().map(|c| renamed(c, mapping)).collect(),
                grouping_sets: grouping_sets
                    .iter()
                    .map(|set| {
                        set.iter()
                            .map(|id| mapping.get(id).map(|c| c.id).unwrap_or(*id))
                            .collect()
                    })
                    .collect(),
                grouping_id: fresh(grouping_id, factory, mapping),
            },
            LogicalOp::SetOperation {
                kind,
                output,
                inputs,
            } => {
                let inputs = inputs
                    .iter()
                    .map(|cols| cols.iter().map(|c| renamed(c, mapping)).collect())
                    .collect();
                LogicalOp::SetOperation {
                    kind: *kind,
                    output: output.iter().map(|c| fresh(c, factory, mapping)).collect(),
                    inputs,
                }
            }
            LogicalOp::Sort { order } => LogicalOp::Sort {
                order: rename_keys(order, mapping),
            },
            LogicalOp::TopN {
                order,
                offset,
                count,
            } => LogicalOp::TopN {
                order: rename_keys(order, mapping),
                offset: *offset,
                count: *count,
            },
            LogicalOp::Limit { offset, count } => LogicalOp::Limit {
                offset: *offset,
                count: *count,
            },
            LogicalOp::CteConsumer { cte_id, columns } => LogicalOp::CteConsumer {
                cte_id: *cte_id,
                columns: columns
                    .iter()
                    .map(|(c, source)| (fresh(c, factory, mapping), *source))
                    .collect(),
            },
        };
        LogicalPlan { op, children }
    }

    /// Check arity and that every referenced column is produced by the node's input.
    pub fn validate_columns(&self) -> Result<()> {
        for child in &self.children {
            child.validate_columns()?;
        }
        let expected = match &self.op {
            LogicalOp::Scan(_) | LogicalOp::CteConsumer { .. } => 0,
            LogicalOp::Join { .. } => 2,
            LogicalOp::SetOperation { inputs, .. } => inputs.len(),
            _ => 1,
        };
        if self.children.len() != expected {
            return Err(OptimizerError::InvalidPlan(format!(
                "{:?} expects {} children, got {}",
                self.op.kind(),
                expected,
                self.children.len()
            )));
        }

        let available: HashSet<ColumnId> = match &self.op {
            LogicalOp::Scan(scan) => scan.columns.iter().map(|c| c.id).collect(),
            _ => self.children.iter().flat_map(|c| c.output_ids()).collect(),
        };
        let operator = format!("{:?}", self.op.kind());
        let check = |id: ColumnId| -> Result<()> {
            if available.contains(&id) {
                Ok(())
            } else {
                Err(OptimizerError::DanglingColumn {
                    column: id,
                    operator: operator.clone(),
                })
            }
        };
        let check_expr = |e: &Expr| -> Result<()> {
            for c in e.columns() {
                check(c.id)?;
            }
            Ok(())
        };

        match &self.op {
            LogicalOp::Scan(scan) => scan.predicates.iter().try_for_each(check_expr)?,
            LogicalOp::Filter { predicate } => check_expr(predicate)?,
            LogicalOp::Project { exprs } => exprs.iter().try_for_each(|(_, e)| check_expr(e))?,
            LogicalOp::Join { condition, .. } => {
                if let Some(c) = condition {
                    check_expr(c)?;
                }
            }
            LogicalOp::Aggregate {
                group_by,
                aggregates,
            } => {
                group_by.iter().try_for_each(|c| check(c.id))?;
                for a in aggregates {
                    if let Some(arg) = &a.arg {
                        check_expr(arg)?;
                    }
                }
            }
            LogicalOp::Repeat {
                repeat_columns,
                grouping_sets,
                ..
            } => {
                repeat_columns.iter().try_for_each(|c| check(c.id))?;
                for set in grouping_sets {
                    set.iter().try_for_each(|id| check(*id))?;
                }
                if grouping_sets.is_empty() {
                    return Err(OptimizerError::InvalidPlan(
                        "repeat without grouping sets".to_string(),
                    ));
                }
            }
            LogicalOp::SetOperation { output, inputs, .. } => {
                for (child, cols) in self.children.iter().zip(inputs) {
                    if cols.len() != output.len() {
                        return Err(OptimizerError::InvalidPlan(format!(
                            "set operation input has {} columns, output has {}",
                            cols.len(),
                            output.len()
                        )));
                    }
                    let ids = child.output_ids();
                    for c in cols {
                        if !ids.contains(&c.id) {
                            return Err(OptimizerError::DanglingColumn {
                                column: c.id,
                                operator: operator.clone(),
                            });
                        }
                    }
                }
            }
            LogicalOp::Sort { order } | LogicalOp::TopN { order, .. } => {
                order.iter().try_for_each(|k| check_expr(&k.expr))?
            }
            LogicalOp::Limit { .. } | LogicalOp::CteConsumer { .. } => {}
        }
        Ok(())
    }
}

fn fresh(c: &ColumnRef, factory: &mut ColumnFactory, mapping: &mut HashMap<ColumnId, ColumnRef>) -> ColumnRef {
    let n = factory.create(c.name.clone());
    mapping.insert(c.id, n.clone());
    n
}

fn renamed(c: &ColumnRef, mapping: &HashMap<ColumnId, ColumnRef>) -> ColumnRef {
    mapping.get(&c.id).cloned().unwrap_or_else(|| c.clone())
}

fn rename_keys(order: &[SortKey], mapping: &HashMap<ColumnId, ColumnRef>) -> Vec<SortKey> {
    order
        .iter()
        .map(|k| SortKey {
            expr: k.expr.rename(mapping),
            ascending: k.ascending,
            nulls_first: k.nulls_first,
        })
        .collect()
}

/// Producer side of a common table expression.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CteProducer {
    pub id: CteId,
    pub plan: LogicalPlan,
}

/// Shared table of CTE producers, keyed by id.
pub type CteTable = BTreeMap<CteId, Arc<CteProducer>>;

/// Input of one optimization pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogicalQuery {
    pub root: LogicalPlan,
    #[serde(default)]
    pub ctes: Vec<CteProducer>,
}

impl LogicalQuery {
    pub fn new(root: LogicalPlan) -> Self {
        Self {
            root,
            ctes: Vec::new(),
        }
    }

    pub fn with_cte(mut self, id: u32, plan: LogicalPlan) -> Self {
        self.ctes.push(CteProducer { id: CteId(id), plan });
        self
    }

    pub fn cte_table(&self) -> CteTable {
        self.ctes
            .iter()
            .map(|p| (p.id, Arc::new(p.clone())))
            .collect()
    }

    /// Reject structurally invalid input: duplicate or unknown CTE ids, CTE cycles and
    /// dangling column references.
    pub fn validate(&self) -> Result<()> {
        let mut producers: BTreeMap<CteId, &CteProducer> = BTreeMap::new();
        for p in &self.ctes {
            if producers.insert(p.id, p).is_some() {
                return Err(OptimizerError::InvalidPlan(format!("duplicate CTE id {}", p.id)));
            }
        }

        let check_consumers = |plan: &LogicalPlan| -> Result<()> {
            let mut result = Ok(());
            plan.visit(&mut |node| {
                if result.is_err() {
                    return;
                }
                if let LogicalOp::CteConsumer { cte_id, columns } = &node.op {
                    match producers.get(cte_id) {
                        None => result = Err(OptimizerError::UnknownCte(*cte_id)),
                        Some(p) => {
                            let ids = p.plan.output_ids();
                            if let Some((_, missing)) = columns.iter().find(|(_, s)| !ids.contains(s)) {
                                result = Err(OptimizerError::DanglingColumn {
                                    column: *missing,
                                    operator: format!("CteConsumer({})", cte_id),
                                });
                            }
                        }
                    }
                }
            });
            result
        };

        check_consumers(&self.root)?;
        self.root.validate_columns()?;
        for p in &self.ctes {
            check_consumers(&p.plan)?;
            p.plan.validate_columns()?;
        }
        self.cte_order()?;
        Ok(())
    }

    /// CTE ids ordered so that every CTE comes after the CTEs it consumes.
    pub fn cte_order(&self) -> Result<Vec<CteId>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }

        fn dependencies(plan: &LogicalPlan) -> Vec<CteId> {
            let mut counts = BTreeMap::new();
            plan.count_cte_consumers(&mut counts);
            counts.into_keys().collect()
        }

        fn visit(
            id: CteId,
            graph: &BTreeMap<CteId, Vec<CteId>>,
            marks: &mut HashMap<CteId, Mark>,
            order: &mut Vec<CteId>,
        ) -> Result<()> {
            match marks.get(&id) {
                Some(Mark::Done) => return Ok(()),
                Some(Mark::Visiting) => return Err(OptimizerError::CyclicCte(id)),
                None => {}
            }
            marks.insert(id, Mark::Visiting);
            let deps = graph.get(&id).ok_or(OptimizerError::UnknownCte(id))?;
            for dep in deps {
                visit(*dep, graph, marks, order)?;
            }
            marks.insert(id, Mark::Done);
            order.push(id);
            Ok(())
        }

        let graph: BTreeMap<CteId, Vec<CteId>> = self
            .ctes
            .iter()
            .map(|p| (p.id, dependencies(&p.plan)))
            .collect();
        let mut marks = HashMap::new();
        let mut order = Vec::new();
        for id in graph.keys() {
            visit(*id, &graph, &mut marks, &mut order)?;
        }
        Ok(order)
    }

    /// Largest column id used by the root or any producer.
    pub fn max_column_id(&self) -> ColumnId {
        self.ctes
            .iter()
            .map(|p| p.plan.max_column_id())
            .fold(self.root.max_column_id(), ColumnId::max)
    }
}
