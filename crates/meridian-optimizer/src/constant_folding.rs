//! Constant folding
//!
//! Evaluates nodes whose inputs are all constant and replaces them with
//! initializers holding the results.
//!
//! ```text
//!   [init a] ──┐
//!              ├─► Add ─► y ─► Relu ─► z      =>      [init z]
//!   [init b] ──┘
//! ```
//!
//! Nodes are visited in topological order, so a node whose inputs were folded
//! earlier in the same sweep is folded as well. Folding runs the same CPU
//! kernels a session would, on an inline thread pool, so folded values are
//! bit-identical to what the unoptimized graph computes on the CPU.

use std::collections::BTreeSet;
use std::sync::Arc;

use meridian_core::graph::{DEFAULT_DOMAIN, ONNX_DOMAIN};
use meridian_core::{Error, Graph, MemoryType, Node, NodeIndex, Result, Tensor, ThreadPool};
use meridian_providers::{CpuExecutionProvider, CpuProviderOptions, ExecutionProvider, KernelContext};
use serde::{Deserialize, Serialize};

use crate::transformer::GraphTransformer;

/// Ops whose output differs between evaluations; folding them would freeze
/// one sample into the graph.
pub const NON_DETERMINISTIC_OPS: [&str; 5] = [
    "RandomUniform",
    "RandomNormal",
    "RandomUniformLike",
    "RandomNormalLike",
    "Multinomial",
];

pub fn is_non_deterministic(op_type: &str) -> bool {
    NON_DETERMINISTIC_OPS.contains(&op_type)
}

/// Which nodes constant folding may touch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConstantFoldingOptions {
    /// Operator domains eligible for folding. Custom-domain ops have
    /// semantics only their own provider knows, so they are excluded unless
    /// listed here.
    pub foldable_domains: BTreeSet<String>,
    /// Providers whose already-assigned nodes may be folded. Empty accepts
    /// every provider. Unassigned nodes are always eligible.
    pub compatible_providers: BTreeSet<String>,
}

impl Default for ConstantFoldingOptions {
    fn default() -> Self {
        Self {
            foldable_domains: [DEFAULT_DOMAIN, ONNX_DOMAIN].into_iter().map(String::from).collect(),
            compatible_providers: BTreeSet::new(),
        }
    }
}

#[derive(Debug)]
pub struct ConstantFolding {
    options: ConstantFoldingOptions,
    cpu: CpuExecutionProvider,
    pool: ThreadPool,
}

impl Default for ConstantFolding {
    fn default() -> Self {
        Self::new(ConstantFoldingOptions::default())
    }
}

impl ConstantFolding {
    pub fn new(options: ConstantFoldingOptions) -> Self {
        // Folded tensors outlive the pass as initializers; an arena would
        // pin its chunks for the life of the graph.
        let cpu = CpuExecutionProvider::new(CpuProviderOptions {
            use_arena: false,
            ..CpuProviderOptions::default()
        });
        Self {
            options,
            cpu,
            pool: ThreadPool::inline(),
        }
    }

    pub fn options(&self) -> &ConstantFoldingOptions {
        &self.options
    }

    /// True if every structural condition for folding `node` holds. The
    /// kernel may still be missing or fail, in which case the node stays.
    pub fn can_fold(&self, graph: &Graph, node: &Node) -> bool {
        if is_non_deterministic(&node.op_type) || node.has_subgraph() {
            return false;
        }
        if !self.options.foldable_domains.contains(&node.domain) {
            return false;
        }
        if let Some(provider) = &node.provider {
            if !self.options.compatible_providers.is_empty() && !self.options.compatible_providers.contains(provider)
            {
                return false;
            }
        }
        // An initializer that is also a graph input can be overridden by a feed.
        node.inputs
            .iter()
            .all(|&arg| graph.is_initializer(arg) && !graph.is_graph_input(arg))
    }

    fn evaluate(&self, graph: &Graph, node: &Node) -> Result<Vec<Tensor>> {
        let kernel = self.cpu.create_kernel(graph, node)?;
        let inputs = node
            .inputs
            .iter()
            .map(|&arg| {
                let name = graph.arg_name(arg);
                graph
                    .initializer(name)
                    .cloned()
                    .ok_or_else(|| Error::MissingInput(name.to_string()))
            })
            .collect::<Result<Vec<Arc<Tensor>>>>()?;
        let allocator = self.cpu.allocator(MemoryType::Default)?;
        let mut ctx = KernelContext::new(node, &inputs, allocator, &self.pool);
        self.cpu.compute(kernel.as_ref(), &mut ctx)?;
        ctx.into_outputs()
    }

    fn fold(&self, graph: &mut Graph, index: NodeIndex) -> bool {
        let Some(node) = graph.node(index) else {
            return false;
        };
        if !self.can_fold(graph, node) {
            return false;
        }
        match self.evaluate(graph, node) {
            Ok(outputs) => {
                let names: Vec<String> = node.outputs.iter().map(|&arg| graph.arg_name(arg).to_string()).collect();
                tracing::debug!(node = %node.name, op_type = %node.op_type, outputs = ?names, "node_folded");
                graph.remove_node(index);
                for (name, tensor) in names.iter().zip(outputs) {
                    graph.add_initializer(name, tensor);
                }
                true
            }
            Err(err) => {
                tracing::warn!(
                    node = %node.name,
                    op_type = %node.op_type,
                    error = %err,
                    "constant folding skipped node"
                );
                false
            }
        }
    }
}

impl GraphTransformer for ConstantFolding {
    fn name(&self) -> &str {
        "ConstantFolding"
    }

    fn apply(&self, graph: &mut Graph) -> Result<bool> {
        let order = graph.topological_order()?.to_vec();
        let mut modified = false;
        for index in order {
            modified |= self.fold(graph, index);
        }
        if modified {
            let dropped = graph.remove_unused_initializers();
            tracing::debug!(dropped = dropped.len(), "unused_initializers_removed");
        }
        Ok(modified)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_core::graph::{NodeDef, TypeInfo};
    use meridian_core::DataType;

    fn folded(graph: &mut Graph) -> bool {
        graph.resolve().unwrap();
        ConstantFolding::default().apply(graph).unwrap()
    }

    #[test]
    fn test_folds_chains_in_one_sweep() {
        let mut graph = Graph::new("chain");
        graph.add_initializer("a", Tensor::from_slice([2], &[2.0f32, -5.0]).unwrap());
        graph.add_initializer("b", Tensor::from_slice([2], &[3.0f32, 1.0]).unwrap());
        graph.add_node(NodeDef::new("Add").inputs(["a", "b"]).outputs(["s"]));
        graph.add_node(NodeDef::new("Relu").inputs(["s"]).outputs(["y"]));
        graph.add_output("y");

        assert!(folded(&mut graph));
        assert_eq!(graph.node_count(), 0);
        let y = graph.initializer("y").unwrap();
        assert_eq!(y.to_vec::<f32>().unwrap(), vec![5.0, 0.0]);
        // intermediates and consumed inputs are gone
        assert!(graph.initializer("s").is_none());
        assert!(graph.initializer("a").is_none());
    }

    #[test]
    fn test_runtime_inputs_block_folding() {
        let mut graph = Graph::new("mixed");
        graph.add_input("x", TypeInfo::new(DataType::F32, [1]));
        graph.add_initializer("c", Tensor::from_slice([1], &[1.0f32]).unwrap());
        graph.add_node(NodeDef::new("Neg").inputs(["c"]).outputs(["n"]));
        graph.add_node(NodeDef::new("Mul").inputs(["x", "n"]).outputs(["y"]));
        graph.add_output("y");

        assert!(folded(&mut graph));
        assert_eq!(graph.node_count(), 1);
        assert_eq!(graph.initializer("n").unwrap().to_vec::<f32>().unwrap(), vec![-1.0]);
    }

    #[test]
    fn test_overridable_initializer_is_not_constant() {
        let mut graph = Graph::new("overridable");
        graph.add_input("c", TypeInfo::new(DataType::F32, [1]));
        graph.add_initializer("c", Tensor::from_slice([1], &[1.0f32]).unwrap());
        graph.add_node(NodeDef::new("Neg").inputs(["c"]).outputs(["y"]));
        graph.add_output("y");
        assert!(!folded(&mut graph));
    }

    #[test]
    fn test_denylisted_ops_stay() {
        let mut graph = Graph::new("random");
        graph.add_node(
            NodeDef::new("RandomUniform")
                .attr("shape", vec![3i64])
                .attr("seed", 1.0f32)
                .outputs(["r"]),
        );
        graph.add_output("r");
        assert!(!folded(&mut graph));
        assert_eq!(graph.node_count(), 1);
    }

    #[test]
    fn test_custom_domains_need_opt_in() {
        let build = || {
            let mut graph = Graph::new("custom");
            graph.add_opset_import("", 17);
            graph.add_opset_import("com.vendor", 1);
            graph.add_initializer("a", Tensor::from_slice([1], &[1.0f32]).unwrap());
            graph.add_node(NodeDef::new("Relu").domain("com.vendor").inputs(["a"]).outputs(["y"]));
            graph.add_output("y");
            graph.resolve().unwrap();
            graph
        };

        let mut graph = build();
        assert!(!ConstantFolding::default().apply(&mut graph).unwrap());

        // Opting the domain in is not enough without a CPU kernel for it.
        let mut options = ConstantFoldingOptions::default();
        options.foldable_domains.insert("com.vendor".to_string());
        let folding = ConstantFolding::new(options);
        let mut graph = build();
        let node = graph.find_node("Relu_0").unwrap();
        assert!(folding.can_fold(&graph, graph.node(node).unwrap()));
        assert!(!folding.apply(&mut graph).unwrap());
    }

    #[test]
    fn test_incompatible_provider_is_skipped() {
        let mut graph = Graph::new("assigned");
        graph.add_initializer("a", Tensor::from_slice([1], &[4.0f32]).unwrap());
        let index = graph.add_node(NodeDef::new("Sqrt").inputs(["a"]).outputs(["y"]));
        graph.add_output("y");
        graph.set_node_provider(index, "GpuSimExecutionProvider").unwrap();

        let options = ConstantFoldingOptions {
            compatible_providers: ["CPUExecutionProvider".to_string()].into_iter().collect(),
            ..ConstantFoldingOptions::default()
        };
        let folding = ConstantFolding::new(options);
        graph.resolve().unwrap();
        assert!(!folding.can_fold(&graph, graph.node(index).unwrap()));

        // The default policy accepts any provider.
        assert!(ConstantFolding::default().apply(&mut graph).unwrap());
        assert_eq!(graph.initializer("y").unwrap().to_vec::<f32>().unwrap(), vec![2.0]);
    }

    #[test]
    fn test_kernel_failure_leaves_the_node() {
        let mut graph = Graph::new("div0");
        graph.add_initializer("a", Tensor::from_slice([1], &[1i32]).unwrap());
        graph.add_initializer("z", Tensor::from_slice([1], &[0i32]).unwrap());
        graph.add_node(NodeDef::new("Div").inputs(["a", "z"]).outputs(["y"]));
        graph.add_output("y");
        assert!(!folded(&mut graph));
        assert_eq!(graph.node_count(), 1);
        assert!(graph.initializer("z").is_some());
    }
}
