//! # Fragment Assembler
//!
//! Lowers the final physical tree into the unit of distributed execution: a list of
//! [`PlanFragment`]s. Every Exchange is cut into a sink (at the bottom of the child
//! fragment) and a source (the Exchange node, now a leaf, in the parent fragment).
//!
//! Node ids are renumbered in post-order of the final tree so that exchange ids read
//! bottom-up. Fragments are emitted in post-order as well: a fragment's id is its
//! index in [`DistributedPlan::fragments`] and the result fragment comes last.
//! Every reused CTE producer becomes one multicast fragment feeding each fragment
//! that reads it.

use crate::expr::{ColumnRef, CteId};
use crate::physical::{PhysicalOp, PhysicalPlan, PlanNode, PlanNodeId};
use crate::properties::{DataPartition, Distribution, ExchangeKind};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FragmentId(pub u32);

impl fmt::Display for FragmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a fragment sends its output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DataSink {
    /// Rows are returned to the client.
    Result,
    /// Rows feed the exchange `exchange_id` of fragment `destination`.
    Stream {
        exchange_id: PlanNodeId,
        destination: FragmentId,
        partition: DataPartition,
    },
    /// A reused CTE: rows feed every consumer fragment.
    MultiCast {
        cte_id: CteId,
        destinations: Vec<FragmentId>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanFragment {
    pub id: FragmentId,
    /// Fragment tree; exchanges appear as leaves reading from child fragments.
    pub root: PlanNode,
    /// How the fragment's instances are spread over the backends.
    pub partition: DataPartition,
    pub sink: DataSink,
    pub output_columns: Vec<ColumnRef>,
}

/// The optimizer's final output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributedPlan {
    /// Fragments in post-order; the result fragment is last.
    pub fragments: Vec<PlanFragment>,
    pub output_columns: Vec<ColumnRef>,
}

impl DistributedPlan {
    pub fn result_fragment(&self) -> Option<&PlanFragment> {
        self.fragments.last()
    }

    pub fn fragment(&self, id: FragmentId) -> Option<&PlanFragment> {
        self.fragments.get(id.0 as usize)
    }

    /// Post-order visit of every node in every fragment.
    pub fn visit<'a>(&'a self, f: &mut impl FnMut(&'a PlanNode)) {
        for fragment in &self.fragments {
            fragment.root.visit(f);
        }
    }
}

/// Cut the physical plan into fragments. `output_columns` are the query's result
/// columns.
pub fn assemble_fragments(plan: PhysicalPlan, output_columns: Vec<ColumnRef>) -> DistributedPlan {
    let PhysicalPlan {
        root,
        mut cte_producers,
    } = plan;

    let mut root = gather_root(root);
    let mut next_id = 0;
    renumber(&mut root, &mut next_id);
    for producer in cte_producers.values_mut() {
        renumber(producer, &mut next_id);
    }

    let mut assembler = FragmentAssembler {
        producers: cte_producers,
        fragments: Vec::new(),
        cte_fragments: HashMap::new(),
    };
    let result = assembler.build(root, DataSink::Result, output_columns.clone());
    debug!(
        fragments = assembler.fragments.len(),
        result = result.0,
        "fragments assembled"
    );
    DistributedPlan {
        fragments: assembler.fragments,
        output_columns,
    }
}

fn gather_root(root: PlanNode) -> PlanNode {
    if root.distribution == Distribution::Single {
        return root;
    }
    let kind = ExchangeKind::Gather;
    PlanNode {
        id: root.id,
        stats: root.stats.clone(),
        cost: root.cost,
        distribution: kind.delivered(),
        output: root.output.clone(),
        op: PhysicalOp::Exchange {
            kind,
            merge_order: None,
            offset: 0,
            limit: None,
            runtime_filters: Vec::new(),
        },
        children: vec![root],
    }
}

fn renumber(node: &mut PlanNode, next: &mut u32) {
    for child in &mut node.children {
        renumber(child, next);
    }
    node.id = PlanNodeId(*next);
    *next += 1;
}

struct FragmentAssembler {
    producers: BTreeMap<CteId, PlanNode>,
    fragments: Vec<PlanFragment>,
    cte_fragments: HashMap<CteId, usize>,
}

impl FragmentAssembler {
    /// Build the fragment rooted at `root` after all of its child fragments, and
    /// return its id.
    fn build(&mut self, root: PlanNode, sink: DataSink, output_columns: Vec<ColumnRef>) -> FragmentId {
        let mut children = Vec::new();
        let mut cte_reads = Vec::new();
        let root = self.cut(root, &mut children, &mut cte_reads);
        let partition = fragment_partition(&root);

        let id = FragmentId(self.fragments.len() as u32);
        for child in children {
            if let Some(fragment) = self.fragments.get_mut(child) {
                if let DataSink::Stream { destination, .. } = &mut fragment.sink {
                    *destination = id;
                }
            }
        }
        for producer in cte_reads {
            if let Some(fragment) = self.fragments.get_mut(producer) {
                if let DataSink::MultiCast { destinations, .. } = &mut fragment.sink {
                    if !destinations.contains(&id) {
                        destinations.push(id);
                    }
                }
            }
        }
        self.fragments.push(PlanFragment {
            id,
            root,
            partition,
            sink,
            output_columns,
        });
        id
    }

    /// Detach the subtrees below exchanges into their own fragments.
    fn cut(&mut self, mut node: PlanNode, children: &mut Vec<usize>, cte_reads: &mut Vec<usize>) -> PlanNode {
        if let PhysicalOp::Exchange { kind, .. } = &node.op {
            let partition = kind.partition();
            if let Some(child) = node.children.pop() {
                let output = child.output.clone();
                let sink = DataSink::Stream {
                    exchange_id: node.id,
                    destination: FragmentId(0),
                    partition,
                };
                let fragment = self.build(child, sink, output);
                children.push(fragment.0 as usize);
            }
            node.children.clear();
            return node;
        }
        if let PhysicalOp::CteConsumer { cte_id, .. } = &node.op {
            let cte_id = *cte_id;
            let index = match self.cte_fragments.get(&cte_id).copied() {
                Some(index) => Some(index),
                None => {
                    let index = self.build_producer(cte_id);
                    if let Some(index) = index {
                        self.cte_fragments.insert(cte_id, index);
                    }
                    index
                }
            };
            cte_reads.extend(index);
            return node;
        }
        node.children = std::mem::take(&mut node.children)
            .into_iter()
            .map(|c| self.cut(c, children, cte_reads))
            .collect();
        node
    }

    fn build_producer(&mut self, cte_id: CteId) -> Option<usize> {
        let producer = self.producers.remove(&cte_id)?;
        let output = producer.output.clone();
        let sink = DataSink::MultiCast {
            cte_id,
            destinations: Vec::new(),
        };
        Some(self.build(producer, sink, output).0 as usize)
    }
}

/// Scans and CTE reads run wherever their data lives; otherwise the fragment takes
/// the partitioning of the exchange that feeds it.
fn fragment_partition(root: &PlanNode) -> DataPartition {
    let mut reads_storage = false;
    let mut exchange_partition = None;
    root.visit(&mut |node| match &node.op {
        PhysicalOp::OlapScan { .. } | PhysicalOp::CteConsumer { .. } => reads_storage = true,
        PhysicalOp::Exchange { kind, .. } => {
            if exchange_partition.is_none() && *kind != ExchangeKind::Broadcast {
                exchange_partition = Some(kind.partition());
            }
        }
        _ => {}
    });
    if reads_storage {
        return DataPartition::Random;
    }
    exchange_partition.unwrap_or(DataPartition::Unpartitioned)
}
