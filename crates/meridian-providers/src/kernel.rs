//! Kernel contract and registry
//!
//! A kernel is created once per node at session initialization, bound to
//! the node's attributes, and then invoked once per run through a
//! [`KernelContext`] that carries the node's input values, the provider's
//! output allocator and the session's intra-op thread pool.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use meridian_core::graph::{Graph, Node};
use meridian_core::{Allocator, DataType, Error, Result, Shape, Tensor, ThreadPool};

/// A node-bound computation.
pub trait OpKernel: Send + Sync + fmt::Debug {
    /// Read inputs from `ctx` and produce every output of the node.
    fn compute(&self, ctx: &mut KernelContext<'_>) -> Result<()>;
}

/// Per-invocation view of one node's inputs and outputs.
pub struct KernelContext<'a> {
    node: &'a Node,
    inputs: &'a [Arc<Tensor>],
    outputs: Vec<Option<Tensor>>,
    allocator: Arc<dyn Allocator>,
    thread_pool: &'a ThreadPool,
}

impl<'a> KernelContext<'a> {
    pub fn new(
        node: &'a Node,
        inputs: &'a [Arc<Tensor>],
        allocator: Arc<dyn Allocator>,
        thread_pool: &'a ThreadPool,
    ) -> Self {
        Self {
            node,
            inputs,
            outputs: (0..node.outputs.len()).map(|_| None).collect(),
            allocator,
            thread_pool,
        }
    }

    pub fn node(&self) -> &'a Node {
        self.node
    }

    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }

    pub fn input(&self, index: usize) -> Result<&'a Tensor> {
        self.inputs.get(index).map(Arc::as_ref).ok_or_else(|| {
            Error::invalid_argument(format!(
                "node '{}' has {} inputs, input {index} requested",
                self.node.name,
                self.inputs.len()
            ))
        })
    }

    /// Allocate output `index` from the provider's allocator.
    pub fn output(&mut self, index: usize, dtype: DataType, shape: impl Into<Shape>) -> Result<&mut Tensor> {
        let tensor = Tensor::allocate(dtype, shape, &self.allocator)?;
        self.set_output(index, tensor)?;
        self.outputs[index]
            .as_mut()
            .ok_or_else(|| Error::invalid_argument(format!("output {index} was not set")))
    }

    /// Hand over an already built output tensor.
    pub fn set_output(&mut self, index: usize, tensor: Tensor) -> Result<()> {
        let count = self.outputs.len();
        let slot = self.outputs.get_mut(index).ok_or_else(|| {
            Error::invalid_argument(format!("node has {count} outputs, output {index} requested"))
        })?;
        *slot = Some(tensor);
        Ok(())
    }

    pub fn allocator(&self) -> &Arc<dyn Allocator> {
        &self.allocator
    }

    pub fn thread_pool(&self) -> &'a ThreadPool {
        self.thread_pool
    }

    /// The produced outputs in node order. Fails if the kernel left one unset.
    pub fn into_outputs(self) -> Result<Vec<Tensor>> {
        let node = self.node;
        self.outputs
            .into_iter()
            .enumerate()
            .map(|(index, tensor)| {
                tensor.ok_or_else(|| {
                    Error::compute(&node.name, &node.op_type, format!("kernel did not produce output {index}"))
                })
            })
            .collect()
    }
}

/// Creates a kernel bound to one node.
pub type KernelFactory = Arc<dyn Fn(&Node) -> Result<Box<dyn OpKernel>> + Send + Sync>;

/// Registration key and type constraints of one kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelDef {
    pub op_type: String,
    pub domain: String,
    pub provider: String,
    /// Element types accepted for the node's `T`; empty means any
    pub type_constraints: Vec<DataType>,
}

impl KernelDef {
    pub fn new(op_type: impl Into<String>, domain: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            op_type: op_type.into(),
            domain: domain.into(),
            provider: provider.into(),
            type_constraints: Vec::new(),
        }
    }

    pub fn type_constraint(mut self, types: impl IntoIterator<Item = DataType>) -> Self {
        self.type_constraints = types.into_iter().collect();
        self
    }

    pub fn accepts(&self, dtype: Option<DataType>) -> bool {
        if self.type_constraints.is_empty() {
            return true;
        }
        dtype.is_some_and(|dtype| self.type_constraints.contains(&dtype))
    }
}

struct Registration {
    def: KernelDef,
    factory: KernelFactory,
}

/// Kernels of one provider keyed by `(op_type, domain)`.
///
/// Several registrations may share a key as long as their type
/// constraints differ; lookup picks the first one accepting the node's `T`.
#[derive(Default)]
pub struct KernelRegistry {
    kernels: HashMap<(String, String), Vec<Registration>>,
}

impl KernelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, def: KernelDef, factory: F)
    where
        F: Fn(&Node) -> Result<Box<dyn OpKernel>> + Send + Sync + 'static,
    {
        let key = (def.op_type.clone(), normalize_domain(&def.domain).to_string());
        self.kernels.entry(key).or_default().push(Registration {
            def,
            factory: Arc::new(factory),
        });
    }

    /// Registration matching `node` inside `graph`, if any.
    pub fn lookup(&self, graph: &Graph, node: &Node) -> Option<&KernelDef> {
        self.find(graph, node).map(|registration| &registration.def)
    }

    pub fn has_kernel(&self, graph: &Graph, node: &Node) -> bool {
        self.find(graph, node).is_some()
    }

    /// Instantiate the kernel for `node`, or fail with [`Error::NoKernelFound`].
    pub fn create_kernel(&self, graph: &Graph, node: &Node, provider: &str) -> Result<Box<dyn OpKernel>> {
        let registration = self.find(graph, node).ok_or_else(|| Error::NoKernelFound {
            node: node.name.clone(),
            op_type: node.op_type.clone(),
            domain: node.domain.clone(),
            provider: Some(provider.to_string()),
        })?;
        (registration.factory)(node)
    }

    pub fn len(&self) -> usize {
        self.kernels.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.kernels.is_empty()
    }

    /// Every registration, in no particular order.
    pub fn kernel_defs(&self) -> impl Iterator<Item = &KernelDef> {
        self.kernels.values().flatten().map(|registration| &registration.def)
    }

    fn find(&self, graph: &Graph, node: &Node) -> Option<&Registration> {
        let key = (node.op_type.clone(), normalize_domain(&node.domain).to_string());
        let dtype = type_of_t(graph, node);
        self.kernels
            .get(&key)?
            .iter()
            .find(|registration| registration.def.accepts(dtype))
    }
}

impl fmt::Debug for KernelRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ops: Vec<_> = self.kernels.keys().map(|(op, _)| op.as_str()).collect();
        ops.sort_unstable();
        f.debug_struct("KernelRegistry").field("ops", &ops).finish()
    }
}

/// `ai.onnx` is an alias of the default domain.
fn normalize_domain(domain: &str) -> &str {
    if domain == meridian_core::graph::ONNX_DOMAIN {
        meridian_core::graph::DEFAULT_DOMAIN
    } else {
        domain
    }
}

/// Element type bound to a node's `T`: its first input, or its first output
/// for ops without inputs.
pub fn type_of_t(graph: &Graph, node: &Node) -> Option<DataType> {
    node.inputs
        .first()
        .or_else(|| node.outputs.first())
        .and_then(|arg| graph.arg(*arg).dtype())
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_core::graph::{NodeDef, TypeInfo};

    #[derive(Debug)]
    struct Noop;

    impl OpKernel for Noop {
        fn compute(&self, _ctx: &mut KernelContext<'_>) -> Result<()> {
            Ok(())
        }
    }

    fn graph_with(dtype: DataType) -> (Graph, meridian_core::NodeIndex) {
        let mut graph = Graph::new("g");
        graph.add_input("x", TypeInfo::new(dtype, [2]));
        let node = graph.add_node(NodeDef::new("Relu").inputs(["x"]).outputs(["y"]));
        graph.add_output("y");
        (graph, node)
    }

    #[test]
    fn test_lookup_honors_type_constraints() {
        let mut registry = KernelRegistry::new();
        registry.register(
            KernelDef::new("Relu", "", "Test").type_constraint([DataType::F32]),
            |_| Ok(Box::new(Noop) as Box<dyn OpKernel>),
        );

        let (graph, node) = graph_with(DataType::F32);
        assert!(registry.has_kernel(&graph, graph.node(node).unwrap()));

        let (graph, node) = graph_with(DataType::I64);
        assert!(!registry.has_kernel(&graph, graph.node(node).unwrap()));
    }

    #[test]
    fn test_onnx_domain_alias() {
        let mut registry = KernelRegistry::new();
        registry.register(KernelDef::new("Relu", "ai.onnx", "Test"), |_| {
            Ok(Box::new(Noop) as Box<dyn OpKernel>)
        });
        let (graph, node) = graph_with(DataType::F32);
        assert!(registry.lookup(&graph, graph.node(node).unwrap()).is_some());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_missing_kernel_names_the_provider() {
        let registry = KernelRegistry::new();
        let (graph, node) = graph_with(DataType::F32);
        let err = registry
            .create_kernel(&graph, graph.node(node).unwrap(), "TestProvider")
            .unwrap_err();
        match err {
            Error::NoKernelFound { op_type, provider, .. } => {
                assert_eq!(op_type, "Relu");
                assert_eq!(provider.as_deref(), Some("TestProvider"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_context_requires_every_output() {
        let (graph, node) = graph_with(DataType::F32);
        let node = graph.node(node).unwrap();
        let pool = ThreadPool::inline();
        let allocator: Arc<dyn Allocator> = Arc::new(meridian_core::allocator::DirectAllocator::host());
        let inputs = vec![Arc::new(Tensor::from_slice([2], &[1.0f32, -1.0]).unwrap())];

        let ctx = KernelContext::new(node, &inputs, allocator.clone(), &pool);
        assert!(matches!(ctx.into_outputs(), Err(Error::Compute { .. })));

        let mut ctx = KernelContext::new(node, &inputs, allocator, &pool);
        assert!(ctx.input(1).is_err());
        ctx.output(0, DataType::F32, [2]).unwrap();
        assert!(ctx.output(1, DataType::F32, [2]).is_err());
        assert_eq!(ctx.into_outputs().unwrap().len(), 1);
    }
}
