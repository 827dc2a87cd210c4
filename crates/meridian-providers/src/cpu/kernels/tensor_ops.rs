//! Data movement kernels: Identity and Constant

use std::sync::Arc;

use meridian_core::graph::{AttributeValue, Node};
use meridian_core::{Error, Result, Tensor};

use crate::kernel::{KernelContext, KernelDef, KernelRegistry, OpKernel};

#[derive(Debug)]
pub struct IdentityKernel;

impl OpKernel for IdentityKernel {
    fn compute(&self, ctx: &mut KernelContext<'_>) -> Result<()> {
        let input = ctx.input(0)?;
        ctx.output(0, input.dtype(), input.shape().clone())?.copy_from(input)
    }
}

/// Emits the tensor bound at creation from the node's `value` attribute.
#[derive(Debug)]
pub struct ConstantKernel {
    value: Arc<Tensor>,
}

impl ConstantKernel {
    pub fn new(node: &Node) -> Result<Self> {
        let value = node
            .attribute("value")
            .and_then(AttributeValue::as_tensor)
            .cloned()
            .ok_or_else(|| {
                Error::invalid_argument(format!("Constant node '{}' has no tensor 'value' attribute", node.name))
            })?;
        Ok(Self { value })
    }
}

impl OpKernel for ConstantKernel {
    fn compute(&self, ctx: &mut KernelContext<'_>) -> Result<()> {
        let value = self.value.as_ref();
        ctx.output(0, value.dtype(), value.shape().clone())?.copy_from(value)
    }
}

pub(super) fn register(registry: &mut KernelRegistry, provider: &str) {
    registry.register(KernelDef::new("Identity", "", provider), |_| {
        Ok(Box::new(IdentityKernel) as Box<dyn OpKernel>)
    });
    registry.register(KernelDef::new("Constant", "", provider), |node| {
        Ok(Box::new(ConstantKernel::new(node)?) as Box<dyn OpKernel>)
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::kernels::test_util::run_kernel;
    use meridian_core::graph::NodeDef;

    #[test]
    fn test_identity_copies() {
        let x = Tensor::from_slice([3], &[1i32, 2, 3]).unwrap();
        let out = run_kernel(&IdentityKernel, "Identity", vec![x], 1).unwrap();
        assert_eq!(out[0].to_vec::<i32>().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_constant_requires_value() {
        let mut graph = meridian_core::Graph::new("g");
        let index = graph.add_node(NodeDef::new("Constant").outputs(["c"]));
        let err = ConstantKernel::new(graph.node(index).unwrap()).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));

        let value = Tensor::from_slice([2], &[0.5f64, 1.5]).unwrap();
        let index = graph.add_node(NodeDef::new("Constant").outputs(["d"]).attr("value", value));
        let kernel = ConstantKernel::new(graph.node(index).unwrap()).unwrap();
        let out = run_kernel(&kernel, "Constant", vec![], 1).unwrap();
        assert_eq!(out[0].to_vec::<f64>().unwrap(), vec![0.5, 1.5]);
    }
}
