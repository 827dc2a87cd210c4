//! Dataflow graph model
//!
//! Nodes live in a stable-index arena and refer to their edges through
//! [`ArgId`]s into the graph's name table, so rewrite passes can remove or
//! replace nodes without leaving dangling references behind. Every structural
//! mutation clears the resolved flag; [`Graph::resolve`] re-validates all
//! references, rejects cycles, runs type inference and caches a topological
//! order.

mod attribute;
mod node;
mod resolve;

pub use attribute::AttributeValue;
pub use node::{ArgId, Node, NodeArg, NodeDef, NodeIndex, TypeInfo};
pub use resolve::infer_output_types;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::tensor::Tensor;

/// The default (standard operator set) domain.
pub const DEFAULT_DOMAIN: &str = "";
/// Alias of the default domain used by some exporters.
pub const ONNX_DOMAIN: &str = "ai.onnx";

/// True for the standard operator domains.
pub fn is_standard_domain(domain: &str) -> bool {
    domain == DEFAULT_DOMAIN || domain == ONNX_DOMAIN
}

/// A resolvable dataflow graph.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    name: String,
    nodes: Vec<Option<Node>>,
    args: Vec<NodeArg>,
    arg_index: HashMap<String, ArgId>,
    inputs: Vec<ArgId>,
    outputs: Vec<ArgId>,
    initializers: BTreeMap<String, Arc<Tensor>>,
    opset_imports: BTreeMap<String, i64>,
    topological_order: Option<Vec<NodeIndex>>,
}

impl Graph {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    // ============================================================================================
    // Name table
    // ============================================================================================

    /// Id of the arg called `name`, creating an untyped one if needed.
    pub fn get_or_create_arg(&mut self, name: &str) -> ArgId {
        if let Some(id) = self.arg_index.get(name) {
            return *id;
        }
        let id = ArgId::new(self.args.len());
        self.args.push(NodeArg {
            name: name.to_string(),
            type_info: None,
        });
        self.arg_index.insert(name.to_string(), id);
        id
    }

    pub fn arg_id(&self, name: &str) -> Option<ArgId> {
        self.arg_index.get(name).copied()
    }

    /// Panics on an id from another graph; ids are only minted by this graph.
    pub fn arg(&self, id: ArgId) -> &NodeArg {
        &self.args[id.index()]
    }

    pub fn arg_name(&self, id: ArgId) -> &str {
        &self.args[id.index()].name
    }

    /// Declare the static type of an arg.
    pub fn set_arg_type(&mut self, id: ArgId, type_info: TypeInfo) {
        self.args[id.index()].type_info = Some(type_info);
        self.invalidate();
    }

    // ============================================================================================
    // Graph inputs, outputs, initializers
    // ============================================================================================

    /// Declare a graph input.
    pub fn add_input(&mut self, name: &str, type_info: TypeInfo) -> ArgId {
        let id = self.get_or_create_arg(name);
        self.args[id.index()].type_info = Some(type_info);
        if !self.inputs.contains(&id) {
            self.inputs.push(id);
        }
        self.invalidate();
        id
    }

    /// Declare a graph output.
    pub fn add_output(&mut self, name: &str) -> ArgId {
        let id = self.get_or_create_arg(name);
        if !self.outputs.contains(&id) {
            self.outputs.push(id);
        }
        self.invalidate();
        id
    }

    pub fn inputs(&self) -> &[ArgId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[ArgId] {
        &self.outputs
    }

    pub fn is_graph_input(&self, id: ArgId) -> bool {
        self.inputs.contains(&id)
    }

    pub fn is_graph_output(&self, id: ArgId) -> bool {
        self.outputs.contains(&id)
    }

    /// Add or replace the constant tensor named `name`.
    pub fn add_initializer(&mut self, name: &str, tensor: Tensor) -> ArgId {
        self.add_shared_initializer(name, Arc::new(tensor))
    }

    pub fn add_shared_initializer(&mut self, name: &str, tensor: Arc<Tensor>) -> ArgId {
        let id = self.get_or_create_arg(name);
        if self.args[id.index()].type_info.is_none() {
            self.args[id.index()].type_info = Some(TypeInfo::new(tensor.dtype(), tensor.shape().clone()));
        }
        self.initializers.insert(name.to_string(), tensor);
        self.invalidate();
        id
    }

    pub fn remove_initializer(&mut self, name: &str) -> Option<Arc<Tensor>> {
        let removed = self.initializers.remove(name);
        if removed.is_some() {
            self.invalidate();
        }
        removed
    }

    pub fn initializer(&self, name: &str) -> Option<&Arc<Tensor>> {
        self.initializers.get(name)
    }

    pub fn is_initializer(&self, id: ArgId) -> bool {
        self.initializers.contains_key(self.arg_name(id))
    }

    pub fn initializers(&self) -> impl Iterator<Item = (&str, &Arc<Tensor>)> {
        self.initializers.iter().map(|(name, tensor)| (name.as_str(), tensor))
    }

    pub fn initializer_count(&self) -> usize {
        self.initializers.len()
    }

    // ============================================================================================
    // Opset imports
    // ============================================================================================

    pub fn add_opset_import(&mut self, domain: &str, version: i64) {
        self.opset_imports.insert(domain.to_string(), version);
        self.invalidate();
    }

    pub fn opset_imports(&self) -> &BTreeMap<String, i64> {
        &self.opset_imports
    }

    // ============================================================================================
    // Nodes
    // ============================================================================================

    pub fn add_node(&mut self, def: NodeDef) -> NodeIndex {
        let index = NodeIndex::new(self.nodes.len());
        let inputs = def.inputs.iter().map(|name| self.get_or_create_arg(name)).collect();
        let outputs = def.outputs.iter().map(|name| self.get_or_create_arg(name)).collect();
        let name = if def.name.is_empty() {
            format!("{}_{}", def.op_type, index.index())
        } else {
            def.name
        };
        self.nodes.push(Some(Node {
            name,
            op_type: def.op_type,
            domain: def.domain,
            inputs,
            outputs,
            attributes: def.attributes,
            provider: None,
        }));
        self.invalidate();
        index
    }

    /// Remove a node. Its index stays retired.
    pub fn remove_node(&mut self, index: NodeIndex) -> Option<Node> {
        let removed = self.nodes.get_mut(index.index()).and_then(Option::take);
        if removed.is_some() {
            self.invalidate();
        }
        removed
    }

    pub fn node(&self, index: NodeIndex) -> Option<&Node> {
        self.nodes.get(index.index()).and_then(Option::as_ref)
    }

    /// Mutable access; clears the resolved flag.
    pub fn node_mut(&mut self, index: NodeIndex) -> Option<&mut Node> {
        self.topological_order = None;
        self.nodes.get_mut(index.index()).and_then(Option::as_mut)
    }

    /// Live nodes in index order.
    pub fn nodes(&self) -> impl Iterator<Item = (NodeIndex, &Node)> {
        self.nodes
            .iter()
            .enumerate()
            .filter_map(|(i, node)| node.as_ref().map(|node| (NodeIndex::new(i), node)))
    }

    pub fn node_indices(&self) -> Vec<NodeIndex> {
        self.nodes().map(|(index, _)| index).collect()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.iter().filter(|node| node.is_some()).count()
    }

    pub fn find_node(&self, name: &str) -> Option<NodeIndex> {
        self.nodes().find(|(_, node)| node.name == name).map(|(index, _)| index)
    }

    /// Record the execution provider assigned to a node. Does not affect resolution.
    pub fn set_node_provider(&mut self, index: NodeIndex, provider: &str) -> Result<()> {
        let node = self
            .nodes
            .get_mut(index.index())
            .and_then(Option::as_mut)
            .ok_or_else(|| Error::graph_integrity(format!("{index} does not exist")))?;
        node.provider = Some(provider.to_string());
        Ok(())
    }

    // ============================================================================================
    // Edges
    // ============================================================================================

    /// Node producing `arg`, if any.
    pub fn producer(&self, arg: ArgId) -> Option<NodeIndex> {
        self.nodes()
            .find(|(_, node)| node.outputs.contains(&arg))
            .map(|(index, _)| index)
    }

    /// Nodes reading `arg`, in index order.
    pub fn consumers(&self, arg: ArgId) -> Vec<NodeIndex> {
        self.nodes()
            .filter(|(_, node)| node.inputs.contains(&arg))
            .map(|(index, _)| index)
            .collect()
    }

    /// True if some node reads `arg` or it is a graph output.
    pub fn is_used(&self, arg: ArgId) -> bool {
        self.is_graph_output(arg) || self.nodes().any(|(_, node)| node.inputs.contains(&arg))
    }

    /// True if a sub-graph of some node (at any depth) reads the outer
    /// value `name`.
    pub fn subgraph_reads(&self, name: &str) -> bool {
        self.nodes().any(|(_, node)| {
            node.attributes.values().any(|value| match value {
                AttributeValue::Graph(body) => {
                    body.nodes().any(|(_, inner)| inner.inputs.iter().any(|arg| body.arg_name(*arg) == name))
                        || body.subgraph_reads(name)
                }
                _ => false,
            })
        })
    }

    /// Rewire every node input reading `old` to read `new` instead.
    /// Graph outputs are left alone. Returns the number of rewired inputs.
    pub fn replace_all_uses(&mut self, old: ArgId, new: ArgId) -> usize {
        let mut replaced = 0;
        for node in self.nodes.iter_mut().flatten() {
            for input in node.inputs.iter_mut().filter(|input| **input == old) {
                *input = new;
                replaced += 1;
            }
        }
        if replaced > 0 {
            self.invalidate();
        }
        replaced
    }

    /// Drop initializers nothing reads. Returns their names.
    pub fn remove_unused_initializers(&mut self) -> Vec<String> {
        let used: HashSet<ArgId> = self
            .nodes()
            .flat_map(|(_, node)| node.inputs.iter().copied())
            .chain(self.outputs.iter().copied())
            .chain(self.inputs.iter().copied())
            .collect();
        let unused: Vec<String> = self
            .initializers
            .keys()
            .filter(|name| self.arg_id(name).map_or(true, |id| !used.contains(&id)))
            .filter(|name| !self.subgraph_reads(name))
            .cloned()
            .collect();
        for name in &unused {
            self.initializers.remove(name);
        }
        if !unused.is_empty() {
            self.invalidate();
        }
        unused
    }

    // ============================================================================================
    // Resolution
    // ============================================================================================

    pub fn is_resolved(&self) -> bool {
        self.topological_order.is_some()
    }

    /// Validate the graph and cache a topological order.
    pub fn resolve(&mut self) -> Result<()> {
        self.resolve_with_outer_scope(&HashSet::new())
    }

    /// Resolve a sub-graph that may read `outer_scope` values of its parent.
    pub fn resolve_with_outer_scope(&mut self, outer_scope: &HashSet<String>) -> Result<()> {
        if self.is_resolved() {
            return Ok(());
        }
        let order = resolve::resolve(self, outer_scope)?;
        tracing::trace!(graph = %self.name, nodes = order.len(), "graph_resolved");
        self.topological_order = Some(order);
        Ok(())
    }

    /// Cached topological order; the graph must be resolved.
    pub fn topological_order(&self) -> Result<&[NodeIndex]> {
        self.topological_order
            .as_deref()
            .ok_or_else(|| Error::graph_integrity(format!("graph '{}' must be resolved first", self.name)))
    }

    /// Forget the cached resolution.
    pub fn invalidate(&mut self) {
        self.topological_order = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_type::DataType;

    fn add_graph() -> Graph {
        let mut graph = Graph::new("add");
        graph.add_input("a", TypeInfo::new(DataType::F32, [2]));
        graph.add_initializer("b", Tensor::from_slice([2], &[1.0f32, 2.0]).unwrap());
        graph.add_node(NodeDef::new("Add").name("add").inputs(["a", "b"]).outputs(["y"]));
        graph.add_output("y");
        graph
    }

    #[test]
    fn test_node_indices_are_stable() {
        let mut graph = add_graph();
        let relu = graph.add_node(NodeDef::new("Relu").inputs(["y"]).outputs(["z"]));
        let add = graph.find_node("add").unwrap();
        graph.remove_node(add);
        assert!(graph.node(add).is_none());
        assert_eq!(graph.node(relu).unwrap().name, "Relu_1");
        let again = graph.add_node(NodeDef::new("Neg").inputs(["a"]).outputs(["w"]));
        assert_eq!(again.index(), 2);
        assert_eq!(graph.node_count(), 2);
    }

    #[test]
    fn test_mutation_invalidates_resolution() {
        let mut graph = add_graph();
        graph.resolve().unwrap();
        assert!(graph.is_resolved());
        graph.add_initializer("c", Tensor::scalar(1.0f32).unwrap());
        assert!(!graph.is_resolved());
        assert!(graph.topological_order().is_err());
    }

    #[test]
    fn test_provider_assignment_keeps_resolution() {
        let mut graph = add_graph();
        graph.resolve().unwrap();
        let add = graph.find_node("add").unwrap();
        graph.set_node_provider(add, "CPUExecutionProvider").unwrap();
        assert!(graph.is_resolved());
        assert_eq!(graph.node(add).unwrap().provider.as_deref(), Some("CPUExecutionProvider"));
    }

    #[test]
    fn test_producer_and_consumers() {
        let mut graph = add_graph();
        graph.add_node(NodeDef::new("Relu").name("relu").inputs(["y"]).outputs(["z"]));
        let y = graph.arg_id("y").unwrap();
        assert_eq!(graph.producer(y), graph.find_node("add"));
        assert_eq!(graph.consumers(y), vec![graph.find_node("relu").unwrap()]);
        assert!(graph.is_used(y));
    }

    #[test]
    fn test_replace_all_uses() {
        let mut graph = add_graph();
        let relu = graph.add_node(NodeDef::new("Relu").inputs(["y"]).outputs(["z"]));
        let y = graph.arg_id("y").unwrap();
        let a = graph.arg_id("a").unwrap();
        assert_eq!(graph.replace_all_uses(y, a), 1);
        assert_eq!(graph.node(relu).unwrap().inputs, vec![a]);
        // graph outputs are untouched
        assert!(graph.is_graph_output(y));
    }

    #[test]
    fn test_remove_unused_initializers() {
        let mut graph = add_graph();
        graph.add_initializer("unused", Tensor::scalar(0i64).unwrap());
        assert_eq!(graph.remove_unused_initializers(), vec!["unused".to_string()]);
        assert!(graph.initializer("b").is_some());
    }

    #[test]
    fn test_initializers_read_by_subgraphs_survive() {
        let mut body = Graph::new("body");
        body.add_node(NodeDef::new("Identity").inputs(["outer"]).outputs(["inner"]));
        body.add_output("inner");

        let mut graph = add_graph();
        graph.add_initializer("outer", Tensor::scalar(2.0f32).unwrap());
        graph.add_node(NodeDef::new("Loop").inputs(["a"]).outputs(["l"]).attr("body", body));
        assert!(graph.subgraph_reads("outer"));
        assert!(!graph.subgraph_reads("b"));
        assert!(graph.remove_unused_initializers().is_empty());
    }
}
