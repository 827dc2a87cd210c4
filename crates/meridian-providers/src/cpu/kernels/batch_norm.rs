//! Inference-mode batch normalization
//!
//! `Y = (X - mean) / sqrt(var + epsilon) * scale + B`, computed as
//! `Y = X * inv_std + (B - mean * inv_std)` with `inv_std = scale / sqrt(var + epsilon)`.
//!
//! `X` is `[N, C, D1, ..., Dk]`; a rank-1 `X` of length `N` is read as `[N, 1]`.
//! In spatial mode (the default) `scale`, `B`, `mean` and `var` are `[C]`;
//! otherwise they are `[C, D1, ..., Dk]`.

use meridian_core::graph::Node;
use meridian_core::{Error, Result, Shape, Tensor};

use crate::cpu::kernels::elementwise::{dispatch_arithmetic, Arithmetic, FLOAT_TYPES};
use crate::kernel::{KernelContext, KernelDef, KernelRegistry, OpKernel};

pub const DEFAULT_EPSILON: f32 = 1e-5;

#[derive(Debug)]
pub struct BatchNormKernel {
    epsilon: f32,
    spatial: bool,
}

impl BatchNormKernel {
    pub fn new(node: &Node) -> Result<Self> {
        if node.attr_int("training_mode", 0) != 0 {
            return Err(Error::invalid_argument(format!(
                "node '{}': training mode batch normalization is not supported",
                node.name
            )));
        }
        Ok(Self {
            epsilon: node.attr_float("epsilon", DEFAULT_EPSILON),
            spatial: node.attr_int("spatial", 1) == 1,
        })
    }

    fn run<T: Arithmetic>(&self, ctx: &mut KernelContext<'_>, params: &BatchNormInputs<'_>) -> Result<()> {
        let layout = validate_inputs(params, self.spatial)?;
        let x = params.x.data::<T>()?;
        let scale = params.scale.data::<T>()?;
        let bias = params.bias.data::<T>()?;
        let mean = params.mean.data::<T>()?;
        let var = params.var.data::<T>()?;

        let epsilon = T::from_f64(f64::from(self.epsilon));
        let (inv_std, shift): (Vec<T>, Vec<T>) = (0..scale.len())
            .map(|k| {
                let inv_std = scale[k].div(var[k].add(epsilon).sqrt());
                (inv_std, bias[k].sub(mean[k].mul(inv_std)))
            })
            .unzip();

        let pool = ctx.thread_pool();
        let out = ctx.output(0, T::DATA_TYPE, params.x.shape().clone())?.data_mut::<T>()?;
        if out.is_empty() {
            return Ok(());
        }

        let spatial = self.spatial;
        let BatchNormLayout { channels, spatial_size } = layout;
        // one chunk per (n, c) row of `spatial_size` elements
        pool.parallel_chunks_mut(out, spatial_size, |row, values| {
            let channel = row % channels;
            let base = row * spatial_size;
            for (s, value) in values.iter_mut().enumerate() {
                let k = if spatial { channel } else { channel * spatial_size + s };
                *value = x[base + s].mul(inv_std[k]).add(shift[k]);
            }
        })
    }
}

impl OpKernel for BatchNormKernel {
    fn compute(&self, ctx: &mut KernelContext<'_>) -> Result<()> {
        let params = BatchNormInputs {
            x: ctx.input(0)?,
            scale: ctx.input(1)?,
            bias: ctx.input(2)?,
            mean: ctx.input(3)?,
            var: ctx.input(4)?,
        };
        let dtype = params.x.dtype();
        if !FLOAT_TYPES.contains(&dtype) {
            return Err(Error::TypeMismatch {
                expected: "a floating point type".to_string(),
                actual: dtype.to_string(),
            });
        }
        for tensor in [params.scale, params.bias, params.mean, params.var] {
            if tensor.dtype() != dtype {
                return Err(Error::TypeMismatch {
                    expected: dtype.to_string(),
                    actual: tensor.dtype().to_string(),
                });
            }
        }
        dispatch_arithmetic!(dtype, T => self.run::<T>(ctx, &params))
    }
}

pub struct BatchNormInputs<'a> {
    pub x: &'a Tensor,
    pub scale: &'a Tensor,
    pub bias: &'a Tensor,
    pub mean: &'a Tensor,
    pub var: &'a Tensor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchNormLayout {
    pub channels: usize,
    /// Product of the dims after `C` (1 for rank-1 and rank-2 inputs)
    pub spatial_size: usize,
}

/// Check the shapes of the five inputs against each other.
pub fn validate_inputs(inputs: &BatchNormInputs<'_>, spatial: bool) -> Result<BatchNormLayout> {
    let x_dims = inputs.x.shape().dims();
    if x_dims.is_empty() {
        return Err(Error::invalid_argument(
            "Invalid input X: The rank of input X must be at least 1",
        ));
    }
    let x_dims: Vec<usize> = if x_dims.len() == 1 {
        vec![x_dims[0], 1]
    } else {
        x_dims.to_vec()
    };
    let channels = x_dims[1];
    let feature_dims = &x_dims[2..];
    let mut expected_dims = vec![channels];
    if !spatial {
        expected_dims.extend_from_slice(feature_dims);
    }
    let expected = Shape::new(expected_dims);

    for (name, tensor) in [
        ("scale", inputs.scale),
        ("B", inputs.bias),
        ("mean", inputs.mean),
        ("var", inputs.var),
    ] {
        let dims = tensor.shape().dims();
        if dims.len() != expected.rank() {
            return Err(Error::invalid_argument(format!(
                "Invalid input {name}: {}, expect a tensor with {} dimensions",
                tensor.shape(),
                expected.rank()
            )));
        }
        if dims[0] != channels {
            return Err(Error::invalid_argument(format!(
                "Invalid input {name}: 0th dimension != {channels}"
            )));
        }
        if tensor.shape() != &expected {
            return Err(Error::invalid_argument(format!(
                "Invalid input {name}: {}, expect {expected}",
                tensor.shape()
            )));
        }
    }

    Ok(BatchNormLayout {
        channels,
        spatial_size: feature_dims.iter().product(),
    })
}

pub(super) fn register(registry: &mut KernelRegistry, provider: &str) {
    registry.register(
        KernelDef::new("BatchNormalization", "", provider).type_constraint(FLOAT_TYPES),
        |node| Ok(Box::new(BatchNormKernel::new(node)?) as Box<dyn OpKernel>),
    );
}
