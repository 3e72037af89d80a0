//! # Declarative Pattern Matching for Optimization Rules
//!
//! Each optimization rule declares a `Pattern` that describes the shape of plans it
//! can rewrite or implement. Before applying a rule, the engine checks the pattern
//! against the current plan node so `transform`/`implement` are only called on
//! matching input.
//!
//! ## Pattern Language
//!
//! - `Pattern::Operator(kind, children)`: matches a node whose operator has the given
//!   kind and whose children match the given child patterns one by one.
//! - `Pattern::Node(kind)`: matches a node of the given kind with any number of
//!   children. Used by implementation rules and by N-ary operators.
//! - `Pattern::Any`: matches any subtree.
//! - `Pattern::Leaf`: matches only nodes without children.
//!
//! Common patterns have named constructors (e.g., `Pattern::join()`,
//! `Pattern::filter()`) to reduce boilerplate in rule definitions.

use crate::expr::LogicalOpKind;
use crate::plan::LogicalPlan;

/// Pattern for matching logical plan nodes.
#[derive(Debug, Clone)]
pub enum Pattern {
    /// Match an operator with child patterns.
    Operator(LogicalOpKind, Vec<Pattern>),
    /// Match an operator regardless of its children.
    Node(LogicalOpKind),
    /// Match any subtree.
    Any,
    /// Match a leaf node (no children).
    Leaf,
}

impl Pattern {
    /// Match a logical join with two any-children.
    pub fn join() -> Self {
        Pattern::Operator(LogicalOpKind::Join, vec![Pattern::Any, Pattern::Any])
    }

    /// Match a logical scan.
    pub fn scan() -> Self {
        Pattern::Operator(LogicalOpKind::Scan, vec![])
    }

    /// Match a logical filter with one child.
    pub fn filter() -> Self {
        Pattern::Operator(LogicalOpKind::Filter, vec![Pattern::Any])
    }

    /// Match a logical aggregate.
    pub fn aggregate() -> Self {
        Pattern::Operator(LogicalOpKind::Aggregate, vec![Pattern::Any])
    }

    /// Match an aggregate directly on top of a repeat.
    pub fn aggregate_repeat() -> Self {
        Pattern::Operator(
            LogicalOpKind::Aggregate,
            vec![Pattern::Operator(LogicalOpKind::Repeat, vec![Pattern::Any])],
        )
    }

    /// Match a project with one child.
    pub fn project() -> Self {
        Pattern::Operator(LogicalOpKind::Project, vec![Pattern::Any])
    }

    /// Match any node of the given kind.
    pub fn node(kind: LogicalOpKind) -> Self {
        Pattern::Node(kind)
    }
}

/// Check if a plan node matches a pattern.
pub fn matches(plan: &LogicalPlan, pattern: &Pattern) -> bool {
    match pattern {
        Pattern::Any => true,
        Pattern::Leaf => plan.children.is_empty(),
        Pattern::Node(kind) => plan.op.kind() == *kind,
        Pattern::Operator(kind, child_patterns) => {
            if plan.op.kind() != *kind {
                return false;
            }
            if plan.children.len() != child_patterns.len() {
                return false;
            }
            plan.children
                .iter()
                .zip(child_patterns.iter())
                .all(|(child, p)| matches(child, p))
        }
    }
}
