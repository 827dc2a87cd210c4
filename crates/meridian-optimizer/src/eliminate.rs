//! Identity and dead-node elimination

use meridian_core::graph::is_standard_domain;
use meridian_core::{Graph, NodeIndex, Result};

use crate::transformer::GraphTransformer;

/// Removes `Identity` nodes and rewires their consumers to the input.
///
/// An `Identity` that produces a graph output is kept: removing it would
/// rename the output. So is one whose output a sub-graph reads by name.
#[derive(Debug, Default, Clone, Copy)]
pub struct EliminateIdentity;

impl EliminateIdentity {
    fn removable(graph: &Graph, index: NodeIndex) -> bool {
        let Some(node) = graph.node(index) else {
            return false;
        };
        if node.op_type != "Identity" || !is_standard_domain(&node.domain) {
            return false;
        }
        let ([_], [output]) = (node.inputs.as_slice(), node.outputs.as_slice()) else {
            return false;
        };
        !graph.is_graph_output(*output) && !graph.subgraph_reads(graph.arg_name(*output))
    }
}

impl GraphTransformer for EliminateIdentity {
    fn name(&self) -> &str {
        "EliminateIdentity"
    }

    fn apply(&self, graph: &mut Graph) -> Result<bool> {
        let candidates: Vec<NodeIndex> = graph
            .topological_order()?
            .iter()
            .copied()
            .filter(|&index| Self::removable(graph, index))
            .collect();

        for &index in &candidates {
            if let Some(node) = graph.remove_node(index) {
                let rewired = graph.replace_all_uses(node.outputs[0], node.inputs[0]);
                tracing::debug!(node = %node.name, rewired, "identity_eliminated");
            }
        }
        Ok(!candidates.is_empty())
    }
}

/// Removes nodes whose outputs nothing reads, transitively, then drops the
/// initializers they were the last readers of.
#[derive(Debug, Default, Clone, Copy)]
pub struct EliminateDeadNodes;

impl EliminateDeadNodes {
    fn dead(graph: &Graph) -> Vec<NodeIndex> {
        graph
            .nodes()
            .filter(|(_, node)| {
                node.outputs
                    .iter()
                    .all(|&arg| !graph.is_used(arg) && !graph.subgraph_reads(graph.arg_name(arg)))
            })
            .map(|(index, _)| index)
            .collect()
    }
}

impl GraphTransformer for EliminateDeadNodes {
    fn name(&self) -> &str {
        "EliminateDeadNodes"
    }

    fn apply(&self, graph: &mut Graph) -> Result<bool> {
        let mut removed = 0;
        loop {
            let dead = Self::dead(graph);
            if dead.is_empty() {
                break;
            }
            for index in dead {
                if let Some(node) = graph.remove_node(index) {
                    tracing::debug!(node = %node.name, op_type = %node.op_type, "dead_node_removed");
                    removed += 1;
                }
            }
        }
        let dropped = graph.remove_unused_initializers();
        Ok(removed > 0 || !dropped.is_empty())
    }
}
