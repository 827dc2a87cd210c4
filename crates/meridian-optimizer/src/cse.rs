//! Common subexpression elimination
//!
//! Two nodes that apply the same operator with the same attributes to the
//! same values compute the same thing. The later one is removed and its
//! consumers read the earlier one's outputs instead.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use meridian_core::{ArgId, Graph, Node, NodeIndex, Result};

use crate::constant_folding::is_non_deterministic;
use crate::transformer::GraphTransformer;

#[derive(Debug, Default, Clone, Copy)]
pub struct CommonSubexpressionElimination;

fn fingerprint(node: &Node) -> u64 {
    let mut hasher = DefaultHasher::new();
    node.op_type.hash(&mut hasher);
    node.domain.hash(&mut hasher);
    node.inputs.hash(&mut hasher);
    node.outputs.len().hash(&mut hasher);
    for (name, value) in &node.attributes {
        name.hash(&mut hasher);
        value.fingerprint(&mut hasher);
    }
    hasher.finish()
}

fn equivalent(a: &Node, b: &Node) -> bool {
    a.op_type == b.op_type
        && a.domain == b.domain
        && a.inputs == b.inputs
        && a.outputs.len() == b.outputs.len()
        && a.provider == b.provider
        && a.attributes.len() == b.attributes.len()
        && a.attributes
            .iter()
            .zip(&b.attributes)
            .all(|((ka, va), (kb, vb))| ka == kb && va.same_as(vb))
}

fn mergeable(graph: &Graph, node: &Node) -> bool {
    !is_non_deterministic(&node.op_type)
        && !node.has_subgraph()
        && node
            .outputs
            .iter()
            .all(|&arg| !graph.is_graph_output(arg) && !graph.subgraph_reads(graph.arg_name(arg)))
}

impl GraphTransformer for CommonSubexpressionElimination {
    fn name(&self) -> &str {
        "CommonSubexpressionElimination"
    }

    fn apply(&self, graph: &mut Graph) -> Result<bool> {
        let order = graph.topological_order()?.to_vec();
        let mut seen: HashMap<u64, Vec<NodeIndex>> = HashMap::new();
        let mut merged = 0;

        for index in order {
            // Re-read each node: earlier merges may have rewired its inputs.
            let Some(node) = graph.node(index) else {
                continue;
            };
            let key = fingerprint(node);
            let original = seen.get(&key).and_then(|candidates| {
                candidates
                    .iter()
                    .copied()
                    .find(|&c| graph.node(c).is_some_and(|other| equivalent(other, node)))
            });

            match original {
                Some(original) if mergeable(graph, node) => {
                    let pairs: Vec<(ArgId, ArgId)> = match graph.node(original) {
                        Some(kept) => node.outputs.iter().copied().zip(kept.outputs.iter().copied()).collect(),
                        None => continue,
                    };
                    let name = node.name.clone();
                    graph.remove_node(index);
                    for (duplicate, kept) in pairs {
                        graph.replace_all_uses(duplicate, kept);
                    }
                    tracing::debug!(node = %name, "common_subexpression_merged");
                    merged += 1;
                }
                _ => seen.entry(key).or_default().push(index),
            }
        }
        Ok(merged > 0)
    }
}
