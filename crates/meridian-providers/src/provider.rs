//! Execution provider contract
//!
//! An execution provider is one hardware backend: it owns the allocators for
//! the memory classes it exposes, a registry of kernels, and the logic for
//! moving tensors on and off its device.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                 ExecutionProvider (trait)                │
//! │  allocator(MemoryType)   kernel_registry()   capability  │
//! │  compute(kernel, ctx)    copy_tensor         synchronize │
//! └──────────────┬───────────────────────────┬───────────────┘
//!                ▼                           ▼
//!       ┌─────────────────┐         ┌─────────────────┐
//!       │       CPU       │         │     GpuSim      │
//!       │ arena | direct  │         │ device + pinned │
//!       │ kernel catalog  │         │ stream handles  │
//!       └─────────────────┘         └─────────────────┘
//! ```

use std::fmt;
use std::sync::Arc;

use meridian_core::graph::{Graph, Node};
use meridian_core::{Allocator, Device, Error, MemoryType, NodeIndex, Result, Tensor};

use crate::kernel::{KernelContext, KernelRegistry, OpKernel};

/// Name of the CPU execution provider.
pub const CPU_EXECUTION_PROVIDER: &str = "CPUExecutionProvider";
/// Name of the simulated GPU execution provider.
pub const GPU_SIM_EXECUTION_PROVIDER: &str = "GpuSimExecutionProvider";

/// A hardware backend.
///
/// Implementations are shared between the session and its runs, so every
/// method takes `&self`; state that differs per calling thread (device
/// streams, scratch space) must be looked up per thread.
pub trait ExecutionProvider: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// The device kernels of this provider run on.
    fn device(&self) -> Device;

    /// Every allocator the provider exposes.
    fn allocators(&self) -> Vec<Arc<dyn Allocator>>;

    /// Allocator serving `memory_type`.
    fn allocator(&self, memory_type: MemoryType) -> Result<Arc<dyn Allocator>> {
        self.allocators()
            .into_iter()
            .find(|allocator| allocator.info().memory_type == memory_type)
            .ok_or_else(|| Error::UnsupportedMemoryType {
                provider: self.name().to_string(),
                memory_type,
            })
    }

    fn kernel_registry(&self) -> &KernelRegistry;

    /// Unassigned nodes of `graph` this provider has a kernel for.
    fn capability(&self, graph: &Graph) -> Vec<NodeIndex> {
        let registry = self.kernel_registry();
        graph
            .nodes()
            .filter(|(_, node)| node.provider.is_none() && registry.has_kernel(graph, node))
            .map(|(index, _)| index)
            .collect()
    }

    /// Instantiate the kernel for a node this provider claimed.
    fn create_kernel(&self, graph: &Graph, node: &Node) -> Result<Box<dyn OpKernel>> {
        self.kernel_registry().create_kernel(graph, node, self.name())
    }

    /// Run one kernel. Called concurrently for different nodes and runs.
    fn compute(&self, kernel: &dyn OpKernel, ctx: &mut KernelContext<'_>) -> Result<()> {
        kernel.compute(ctx)
    }

    /// True if this provider can move data from `src` to `dst`.
    fn can_copy(&self, src: Device, dst: Device) -> bool {
        let own = self.device();
        (src == own || src.is_host()) && (dst == own || dst.is_host())
    }

    /// Copy `src` into the already allocated `dst`.
    fn copy_tensor(&self, src: &Tensor, dst: &mut Tensor) -> Result<()> {
        if !self.can_copy(src.device(), dst.device()) {
            return Err(Error::invalid_argument(format!(
                "provider '{}' cannot copy from {} to {}",
                self.name(),
                src.device(),
                dst.device()
            )));
        }
        dst.copy_from(src)
    }

    /// Wait for all outstanding device work of the calling thread.
    fn synchronize(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_core::allocator::DirectAllocator;
    use meridian_core::graph::{NodeDef, TypeInfo};
    use meridian_core::DataType;

    use crate::kernel::KernelDef;

    #[derive(Debug)]
    struct HostOnly {
        allocator: Arc<dyn Allocator>,
        registry: KernelRegistry,
    }

    #[derive(Debug)]
    struct Negate;

    impl OpKernel for Negate {
        fn compute(&self, ctx: &mut KernelContext<'_>) -> Result<()> {
            let input = ctx.input(0)?;
            let values: Vec<f32> = input.data::<f32>()?.iter().map(|v| -v).collect();
            ctx.output(0, DataType::F32, input.shape().clone())?
                .data_mut::<f32>()?
                .copy_from_slice(&values);
            Ok(())
        }
    }

    impl ExecutionProvider for HostOnly {
        fn name(&self) -> &str {
            "HostOnly"
        }

        fn device(&self) -> Device {
            Device::CPU
        }

        fn allocators(&self) -> Vec<Arc<dyn Allocator>> {
            vec![self.allocator.clone()]
        }

        fn kernel_registry(&self) -> &KernelRegistry {
            &self.registry
        }
    }

    fn provider() -> HostOnly {
        let mut registry = KernelRegistry::new();
        registry.register(KernelDef::new("Neg", "", "HostOnly"), |_| {
            Ok(Box::new(Negate) as Box<dyn OpKernel>)
        });
        HostOnly {
            allocator: Arc::new(DirectAllocator::host()),
            registry,
        }
    }

    #[test]
    fn test_default_allocator_lookup() {
        let provider = provider();
        assert!(provider.allocator(MemoryType::Cpu).is_ok());
        let err = provider.allocator(MemoryType::CpuPinned).unwrap_err();
        assert!(matches!(
            err,
            Error::UnsupportedMemoryType {
                memory_type: MemoryType::CpuPinned,
                ..
            }
        ));
    }

    #[test]
    fn test_default_capability_skips_assigned_nodes() {
        let provider = provider();
        let mut graph = Graph::new("g");
        graph.add_input("x", TypeInfo::new(DataType::F32, [2]));
        let first = graph.add_node(NodeDef::new("Neg").inputs(["x"]).outputs(["y"]));
        let second = graph.add_node(NodeDef::new("Neg").inputs(["y"]).outputs(["z"]));
        graph.add_node(NodeDef::new("Relu").inputs(["z"]).outputs(["w"]));
        graph.set_node_provider(first, "Other").unwrap();
        assert_eq!(provider.capability(&graph), vec![second]);
    }

    #[test]
    fn test_default_compute_runs_the_kernel() {
        let provider = provider();
        let mut graph = Graph::new("g");
        graph.add_input("x", TypeInfo::new(DataType::F32, [2]));
        let index = graph.add_node(NodeDef::new("Neg").inputs(["x"]).outputs(["y"]));
        let node = graph.node(index).unwrap();
        let kernel = provider.create_kernel(&graph, node).unwrap();

        let pool = meridian_core::ThreadPool::inline();
        let inputs = vec![Arc::new(Tensor::from_slice([2], &[1.0f32, -2.0]).unwrap())];
        let mut ctx = KernelContext::new(node, &inputs, provider.allocator(MemoryType::Cpu).unwrap(), &pool);
        provider.compute(kernel.as_ref(), &mut ctx).unwrap();
        let outputs = ctx.into_outputs().unwrap();
        assert_eq!(outputs[0].to_vec::<f32>().unwrap(), vec![-1.0, 2.0]);
    }

    #[test]
    fn test_host_provider_refuses_foreign_devices() {
        let provider = provider();
        assert!(provider.can_copy(Device::CPU, Device::CPU));
        assert!(!provider.can_copy(Device::gpu(0), Device::CPU));
    }
}
