//! Execution plan
//!
//! Built once per session from the partitioned graph: one step per node in
//! topological order, each with its provider and a kernel bound to the
//! node's attributes, plus the step after which each intermediate value is
//! dead and can be released.
//!
//! ```text
//! step  node        provider   releases
//! 0     Mul_0       gpu        -
//! 1     Relu_1      gpu        m
//! 2     Sqrt_2      cpu        r
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use meridian_core::{ArgId, Device, Error, Graph, MemoryType, NodeIndex, Result, Tensor};
use meridian_providers::{ExecutionProvider, OpKernel};

pub struct ExecutionStep {
    pub node: NodeIndex,
    /// Index into the session's provider list
    pub provider: usize,
    pub kernel: Box<dyn OpKernel>,
    /// Values whose last reader is this step
    pub release: Vec<ArgId>,
}

impl fmt::Debug for ExecutionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionStep")
            .field("node", &self.node)
            .field("provider", &self.provider)
            .field("release", &self.release)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub struct ExecutionPlan {
    steps: Vec<ExecutionStep>,
    /// Initializers already copied to the devices that read them
    staged_initializers: HashMap<(ArgId, Device), Arc<Tensor>>,
}

impl ExecutionPlan {
    /// Create kernels for every node of a partitioned, resolved graph and
    /// stage initializers on the devices of their readers.
    pub fn new(graph: &Graph, providers: &[Arc<dyn ExecutionProvider>]) -> Result<Self> {
        let order = graph.topological_order()?;
        let by_name: HashMap<&str, usize> = providers
            .iter()
            .enumerate()
            .map(|(i, provider)| (provider.name(), i))
            .collect();

        let mut last_use: HashMap<ArgId, usize> = HashMap::new();
        for (step, &index) in order.iter().enumerate() {
            if let Some(node) = graph.node(index) {
                for &arg in &node.inputs {
                    last_use.insert(arg, step);
                }
            }
        }

        let mut steps = Vec::with_capacity(order.len());
        let mut staged_initializers = HashMap::new();
        for (step, &index) in order.iter().enumerate() {
            let node = graph
                .node(index)
                .ok_or_else(|| Error::graph_integrity(format!("{index} vanished while planning")))?;
            let provider_index = node
                .provider
                .as_deref()
                .and_then(|name| by_name.get(name).copied())
                .ok_or_else(|| Error::NoKernelFound {
                    node: node.name.clone(),
                    op_type: node.op_type.clone(),
                    domain: node.domain.clone(),
                    provider: node.provider.clone(),
                })?;
            let provider = &providers[provider_index];
            let kernel = provider.create_kernel(graph, node)?;

            let device = provider.device();
            for &arg in &node.inputs {
                let Some(tensor) = graph.initializer(graph.arg_name(arg)) else {
                    continue;
                };
                if device == tensor.device() || staged_initializers.contains_key(&(arg, device)) {
                    continue;
                }
                // Overridable initializers are staged per run instead.
                if graph.is_graph_input(arg) {
                    continue;
                }
                let staged = stage(tensor, provider.as_ref())?;
                staged_initializers.insert((arg, device), Arc::new(staged));
            }

            let mut release: Vec<ArgId> = node
                .inputs
                .iter()
                .copied()
                .filter(|arg| last_use.get(arg) == Some(&step))
                .filter(|&arg| !graph.is_graph_output(arg) && !graph.is_initializer(arg))
                .collect();
            release.sort();
            release.dedup();

            tracing::debug!(
                step,
                node = %node.name,
                op_type = %node.op_type,
                provider = provider.name(),
                "execution_step_planned"
            );
            steps.push(ExecutionStep {
                node: index,
                provider: provider_index,
                kernel,
                release,
            });
        }

        for provider in providers {
            provider.synchronize()?;
        }

        Ok(Self {
            steps,
            staged_initializers,
        })
    }

    pub fn steps(&self) -> &[ExecutionStep] {
        &self.steps
    }

    pub fn staged_initializer(&self, arg: ArgId, device: Device) -> Option<&Arc<Tensor>> {
        self.staged_initializers.get(&(arg, device))
    }

    pub fn staged_initializer_count(&self) -> usize {
        self.staged_initializers.len()
    }
}

/// Copy `tensor` into `provider`'s default memory.
pub(crate) fn stage(tensor: &Tensor, provider: &dyn ExecutionProvider) -> Result<Tensor> {
    let allocator = provider.allocator(MemoryType::Default)?;
    let mut staged = Tensor::allocate(tensor.dtype(), tensor.shape().clone(), &allocator)?;
    provider.copy_tensor(tensor, &mut staged)?;
    Ok(staged)
}
