//! Device kernels
//!
//! A [`DeviceKernel`] only enqueues work on the calling thread's stream.
//! [`DeviceOpKernel`] adapts it to [`OpKernel`]: enqueue, then synchronize,
//! and turn a deferred device fault into [`Error::Compute`] for the node.

use std::fmt;
use std::sync::Arc;

use meridian_core::shape::BroadcastIndexer;
use meridian_core::{DataType, Error, Result, Shape};

use crate::gpu_sim::stream::{ComputeHandle, ComputeHandles};
use crate::kernel::{KernelContext, KernelDef, KernelRegistry, OpKernel};

/// Proof that a kernel submitted its work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub struct Enqueued {
    /// Stream launches issued
    pub launches: usize,
}

/// Kernel whose work runs on a device stream.
pub trait DeviceKernel: Send + Sync + fmt::Debug {
    /// Validate inputs, allocate outputs and launch work on `handle`'s stream.
    ///
    /// Errors returned here are immediate; failures of the launched work are
    /// only observable by synchronizing the stream.
    fn enqueue(&self, ctx: &mut KernelContext<'_>, handle: &ComputeHandle) -> Result<Enqueued>;
}

/// Runs a [`DeviceKernel`] to completion on the caller's compute handle.
#[derive(Debug)]
pub struct DeviceOpKernel<K> {
    kernel: K,
    handles: Arc<ComputeHandles>,
}

impl<K: DeviceKernel> DeviceOpKernel<K> {
    pub fn new(kernel: K, handles: Arc<ComputeHandles>) -> Self {
        Self { kernel, handles }
    }
}

impl<K: DeviceKernel> OpKernel for DeviceOpKernel<K> {
    fn compute(&self, ctx: &mut KernelContext<'_>) -> Result<()> {
        let handle = self.handles.current();
        let enqueued = self.kernel.enqueue(ctx, &handle);
        // synchronize even after an enqueue error so no fault lingers on the stream
        let synchronized = handle.synchronize();
        let enqueued = enqueued?;

        synchronized.map_err(|fault| {
            let node = ctx.node();
            tracing::debug!(node = %node.name, launches = enqueued.launches, %fault, "deferred_device_fault");
            Error::compute(&node.name, &node.op_type, fault.to_string())
        })
    }
}

// ================================================================================================
// Elementwise f32 kernels
// ================================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceBinaryOp {
    Add,
    Sub,
    Mul,
}

impl DeviceBinaryOp {
    fn op_type(self) -> &'static str {
        match self {
            DeviceBinaryOp::Add => "Add",
            DeviceBinaryOp::Sub => "Sub",
            DeviceBinaryOp::Mul => "Mul",
        }
    }

    fn launch_name(self) -> &'static str {
        match self {
            DeviceBinaryOp::Add => "add_f32",
            DeviceBinaryOp::Sub => "sub_f32",
            DeviceBinaryOp::Mul => "mul_f32",
        }
    }

    fn apply(self, lhs: f32, rhs: f32) -> f32 {
        match self {
            DeviceBinaryOp::Add => lhs + rhs,
            DeviceBinaryOp::Sub => lhs - rhs,
            DeviceBinaryOp::Mul => lhs * rhs,
        }
    }
}

#[derive(Debug)]
pub struct DeviceBinaryKernel {
    op: DeviceBinaryOp,
}

impl DeviceKernel for DeviceBinaryKernel {
    fn enqueue(&self, ctx: &mut KernelContext<'_>, handle: &ComputeHandle) -> Result<Enqueued> {
        let lhs = ctx.input(0)?;
        let rhs = ctx.input(1)?;
        let out_shape = Shape::broadcast(lhs.shape(), rhs.shape())?;
        let a = lhs.data::<f32>()?;
        let b = rhs.data::<f32>()?;
        let indexer = BroadcastIndexer::new(lhs.shape(), rhs.shape(), &out_shape);
        let out = ctx.output(0, DataType::F32, out_shape)?.data_mut::<f32>()?;

        let op = self.op;
        handle.stream().launch(op.launch_name(), || {
            for (i, value) in out.iter_mut().enumerate() {
                let (l, r) = indexer.offsets(i);
                *value = op.apply(a[l], b[r]);
            }
            Ok(())
        });
        Ok(Enqueued { launches: 1 })
    }
}

#[derive(Debug)]
pub struct DeviceReluKernel;

impl DeviceKernel for DeviceReluKernel {
    fn enqueue(&self, ctx: &mut KernelContext<'_>, handle: &ComputeHandle) -> Result<Enqueued> {
        let input = ctx.input(0)?;
        let src = input.data::<f32>()?;
        let out = ctx.output(0, DataType::F32, input.shape().clone())?.data_mut::<f32>()?;
        handle.stream().launch("relu_f32", || {
            for (value, x) in out.iter_mut().zip(src) {
                *value = if *x < 0.0 { 0.0 } else { *x };
            }
            Ok(())
        });
        Ok(Enqueued { launches: 1 })
    }
}

#[derive(Debug)]
pub struct DeviceIdentityKernel;

impl DeviceKernel for DeviceIdentityKernel {
    fn enqueue(&self, ctx: &mut KernelContext<'_>, handle: &ComputeHandle) -> Result<Enqueued> {
        let input = ctx.input(0)?;
        let out = ctx.output(0, input.dtype(), input.shape().clone())?;
        handle
            .stream()
            .launch("copy_device_to_device", || out.copy_from(input).map_err(|err| err.to_string()));
        Ok(Enqueued { launches: 1 })
    }
}

/// Register the device kernels under `provider`, bound to `handles`.
pub fn register_kernels(registry: &mut KernelRegistry, provider: &str, handles: &Arc<ComputeHandles>) {
    for op in [DeviceBinaryOp::Add, DeviceBinaryOp::Sub, DeviceBinaryOp::Mul] {
        let handles = handles.clone();
        registry.register(
            KernelDef::new(op.op_type(), "", provider).type_constraint([DataType::F32]),
            move |_| {
                Ok(Box::new(DeviceOpKernel::new(DeviceBinaryKernel { op }, handles.clone())) as Box<dyn OpKernel>)
            },
        );
    }

    let relu_handles = handles.clone();
    registry.register(
        KernelDef::new("Relu", "", provider).type_constraint([DataType::F32]),
        move |_| Ok(Box::new(DeviceOpKernel::new(DeviceReluKernel, relu_handles.clone())) as Box<dyn OpKernel>),
    );

    let identity_handles = handles.clone();
    registry.register(
        KernelDef::new("Identity", "", provider).type_constraint([DataType::F32]),
        move |_| {
            Ok(Box::new(DeviceOpKernel::new(DeviceIdentityKernel, identity_handles.clone())) as Box<dyn OpKernel>)
        },
    );
}
