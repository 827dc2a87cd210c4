//! Node-to-provider assignment
//!
//! Providers are asked in registration order; each claims the unassigned
//! nodes it has kernels for, so the first provider able to run a node gets
//! it. Claims on nodes that are already assigned are ignored, and a claim
//! the provider has no kernel for fails. A node nobody claims is a
//! [`Error::NoKernelFound`].

use std::collections::BTreeMap;
use std::sync::Arc;

use meridian_core::{Error, Graph, Result};
use meridian_providers::ExecutionProvider;

/// Nodes assigned per provider, by provider name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionSummary {
    pub assigned: BTreeMap<String, usize>,
}

impl PartitionSummary {
    pub fn count(&self, provider: &str) -> usize {
        self.assigned.get(provider).copied().unwrap_or(0)
    }
}

/// Assign every node of a resolved `graph` to one of `providers`.
pub fn partition(graph: &mut Graph, providers: &[Arc<dyn ExecutionProvider>]) -> Result<PartitionSummary> {
    graph.topological_order()?;
    let mut summary = PartitionSummary::default();

    for provider in providers {
        let mut claimed = 0;
        for index in provider.capability(graph) {
            let Some(node) = graph.node(index) else {
                continue;
            };
            // an earlier provider already holds it
            if node.provider.is_some() {
                continue;
            }
            if !provider.kernel_registry().has_kernel(graph, node) {
                return Err(Error::NoKernelFound {
                    node: node.name.clone(),
                    op_type: node.op_type.clone(),
                    domain: node.domain.clone(),
                    provider: Some(provider.name().to_string()),
                });
            }
            graph.set_node_provider(index, provider.name())?;
            claimed += 1;
        }
        tracing::debug!(provider = provider.name(), nodes = claimed, "provider_claimed_nodes");
        *summary.assigned.entry(provider.name().to_string()).or_default() += claimed;
    }

    if let Some((_, node)) = graph.nodes().find(|(_, node)| node.provider.is_none()) {
        return Err(Error::NoKernelFound {
            node: node.name.clone(),
            op_type: node.op_type.clone(),
            domain: node.domain.clone(),
            provider: None,
        });
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_core::graph::{NodeDef, TypeInfo};
    use meridian_core::{Allocator, DataType, Device, NodeIndex};
    use meridian_providers::{CpuExecutionProvider, KernelRegistry, DeviceRegistry, GpuSimExecutionProvider, GpuSimProviderOptions};

    fn gpu() -> Arc<dyn ExecutionProvider> {
        Arc::new(
            GpuSimExecutionProvider::new(GpuSimProviderOptions::default(), &DeviceRegistry::with_devices(1, 1 << 20))
                .unwrap(),
        )
    }

    fn graph() -> Graph {
        let mut graph = Graph::new("mixed");
        graph.add_input("x", TypeInfo::new(DataType::F32, [4]));
        graph.add_node(NodeDef::new("Relu").name("relu").inputs(["x"]).outputs(["r"]));
        graph.add_node(NodeDef::new("Sqrt").name("sqrt").inputs(["r"]).outputs(["y"]));
        graph.add_output("y");
        graph.resolve().unwrap();
        graph
    }

    fn provider_of<'g>(graph: &'g Graph, name: &str) -> Option<&'g str> {
        graph.node(graph.find_node(name)?)?.provider.as_deref()
    }

    #[test]
    fn test_first_claim_wins() {
        let mut g = graph();
        let providers = vec![gpu(), Arc::new(CpuExecutionProvider::default()) as Arc<dyn ExecutionProvider>];
        let summary = partition(&mut g, &providers).unwrap();
        assert_eq!(provider_of(&g, "relu"), Some("GpuSimExecutionProvider"));
        assert_eq!(provider_of(&g, "sqrt"), Some("CPUExecutionProvider"));
        assert_eq!(summary.count("GpuSimExecutionProvider"), 1);
        assert_eq!(summary.count("CPUExecutionProvider"), 1);

        let mut g = graph();
        let providers = vec![Arc::new(CpuExecutionProvider::default()) as Arc<dyn ExecutionProvider>, gpu()];
        let summary = partition(&mut g, &providers).unwrap();
        assert_eq!(summary.count("CPUExecutionProvider"), 2);
        assert_eq!(summary.count("GpuSimExecutionProvider"), 0);
    }

    /// Claims every node, assigned or not, without registering a kernel.
    #[derive(Debug, Default)]
    struct Greedy {
        registry: KernelRegistry,
    }

    impl ExecutionProvider for Greedy {
        fn name(&self) -> &str {
            "Greedy"
        }

        fn device(&self) -> Device {
            Device::CPU
        }

        fn allocators(&self) -> Vec<Arc<dyn Allocator>> {
            Vec::new()
        }

        fn kernel_registry(&self) -> &KernelRegistry {
            &self.registry
        }

        fn capability(&self, graph: &Graph) -> Vec<NodeIndex> {
            graph.nodes().map(|(index, _)| index).collect()
        }
    }

    #[test]
    fn test_later_provider_cannot_take_assigned_nodes() {
        let mut g = graph();
        let providers = vec![
            Arc::new(CpuExecutionProvider::default()) as Arc<dyn ExecutionProvider>,
            Arc::new(Greedy::default()),
        ];
        let summary = partition(&mut g, &providers).unwrap();
        assert_eq!(provider_of(&g, "relu"), Some("CPUExecutionProvider"));
        assert_eq!(provider_of(&g, "sqrt"), Some("CPUExecutionProvider"));
        assert_eq!(summary.count("CPUExecutionProvider"), 2);
        assert_eq!(summary.count("Greedy"), 0);
    }

    #[test]
    fn test_claim_without_kernel_fails() {
        let mut g = graph();
        let providers = vec![Arc::new(Greedy::default()) as Arc<dyn ExecutionProvider>];
        match partition(&mut g, &providers).unwrap_err() {
            Error::NoKernelFound { provider, .. } => assert_eq!(provider.as_deref(), Some("Greedy")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_unclaimed_node_is_reported() {
        let mut g = graph();
        let err = partition(&mut g, &[gpu()]).unwrap_err();
        match err {
            Error::NoKernelFound { node, op_type, .. } => {
                assert_eq!(node, "sqrt");
                assert_eq!(op_type, "Sqrt");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
