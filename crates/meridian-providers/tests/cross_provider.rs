//! The simulated GPU and the CPU provider must agree on every kernel they share.

use std::sync::Arc;

use meridian_core::graph::{Graph, NodeDef, TypeInfo};
use meridian_core::{DataType, MemoryType, Tensor, ThreadPool};
use meridian_providers::{
    CpuExecutionProvider, DeviceRegistry, ExecutionProvider, GpuSimExecutionProvider, GpuSimProviderOptions,
    KernelContext,
};
use proptest::prelude::*;

fn run_on(provider: &dyn ExecutionProvider, op_type: &str, inputs: &[Tensor]) -> Tensor {
    let mut graph = Graph::new("cross");
    let names: Vec<String> = (0..inputs.len()).map(|i| format!("x{i}")).collect();
    for (name, tensor) in names.iter().zip(inputs) {
        graph.add_input(name, TypeInfo::new(tensor.dtype(), tensor.shape().clone()));
    }
    let index = graph.add_node(NodeDef::new(op_type).inputs(names.clone()).outputs(["y"]));
    graph.add_output("y");
    graph.resolve().unwrap();
    let node = graph.node(index).unwrap();

    let device = provider.allocator(MemoryType::Default).unwrap();
    let staged: Vec<Arc<Tensor>> = inputs
        .iter()
        .map(|tensor| {
            let mut on_device = Tensor::allocate(tensor.dtype(), tensor.shape().clone(), &device).unwrap();
            provider.copy_tensor(tensor, &mut on_device).unwrap();
            Arc::new(on_device)
        })
        .collect();

    let kernel = provider.create_kernel(&graph, node).unwrap();
    let pool = ThreadPool::new(2).unwrap();
    let mut ctx = KernelContext::new(node, &staged, device, &pool);
    provider.compute(kernel.as_ref(), &mut ctx).unwrap();
    let output = ctx.into_outputs().unwrap().remove(0);

    let mut host = Tensor::zeros(output.dtype(), output.shape().clone()).unwrap();
    provider.copy_tensor(&output, &mut host).unwrap();
    host
}

fn gpu() -> GpuSimExecutionProvider {
    GpuSimExecutionProvider::new(GpuSimProviderOptions::default(), &DeviceRegistry::with_devices(1, 64 << 20)).unwrap()
}

fn values(len: usize) -> impl Strategy<Value = Vec<f32>> {
    prop::collection::vec(-1.0e3f32..1.0e3, len)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn binary_ops_match(rows in 1usize..8, cols in 1usize..8, seed in 0usize..3) {
        let op = ["Add", "Sub", "Mul"][seed];
        let lhs: Vec<f32> = (0..rows * cols).map(|i| (i as f32 * 0.37).sin() * 10.0).collect();
        let rhs: Vec<f32> = (0..cols).map(|i| i as f32 - 2.5).collect();
        let inputs = [
            Tensor::from_slice([rows, cols], &lhs).unwrap(),
            Tensor::from_slice([cols], &rhs).unwrap(),
        ];
        let cpu = run_on(&CpuExecutionProvider::default(), op, &inputs);
        let gpu = run_on(&gpu(), op, &inputs);
        prop_assert!(cpu.bitwise_eq(&gpu));
    }

    #[test]
    fn relu_matches(data in values(37)) {
        let inputs = [Tensor::from_slice([data.len()], &data).unwrap()];
        let cpu = run_on(&CpuExecutionProvider::default(), "Relu", &inputs);
        let gpu = run_on(&gpu(), "Relu", &inputs);
        prop_assert!(cpu.bitwise_eq(&gpu));
    }
}

#[test]
fn gpu_claims_only_f32_nodes() {
    let provider = gpu();
    let mut graph = Graph::new("types");
    graph.add_input("f", TypeInfo::new(DataType::F32, [2]));
    graph.add_input("i", TypeInfo::new(DataType::I64, [2]));
    let float_add = graph.add_node(NodeDef::new("Add").inputs(["f", "f"]).outputs(["a"]));
    graph.add_node(NodeDef::new("Add").inputs(["i", "i"]).outputs(["b"]));
    graph.add_node(NodeDef::new("Div").inputs(["f", "f"]).outputs(["c"]));
    assert_eq!(provider.capability(&graph), vec![float_add]);
}

#[test]
fn identity_keeps_device_residency() {
    let provider = gpu();
    let output = run_on(&provider, "Identity", &[Tensor::from_slice([2], &[4.0f32, -4.0]).unwrap()]);
    assert_eq!(output.to_vec::<f32>().unwrap(), vec![4.0, -4.0]);
}
