//! Random generators: RandomUniform, RandomNormal and their `*Like` variants
//!
//! Each kernel owns its generator, so successive runs draw fresh values.
//! With a `seed` attribute the sequence is reproducible across sessions.
//! These ops are never constant folded.

use meridian_core::graph::{AttributeValue, Node};
use meridian_core::{DataType, Error, Result, Shape, Tensor};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::cpu::kernels::elementwise::FLOAT_TYPES;
use crate::kernel::{KernelContext, KernelDef, KernelRegistry, OpKernel};

#[derive(Debug, Clone, Copy, PartialEq)]
enum Distribution {
    Uniform { low: f64, high: f64 },
    Normal { mean: f64, scale: f64 },
}

impl Distribution {
    fn sample(self, rng: &mut StdRng) -> f64 {
        match self {
            Distribution::Uniform { low, high } => low + (high - low) * rng.gen::<f64>(),
            Distribution::Normal { mean, scale } => {
                // Box-Muller; 1 - u keeps the logarithm finite
                let u1 = 1.0 - rng.gen::<f64>();
                let u2 = rng.gen::<f64>();
                let z = (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos();
                mean + scale * z
            }
        }
    }
}

/// Where the output shape comes from.
#[derive(Debug, Clone, PartialEq)]
enum OutputShape {
    Fixed(Shape),
    LikeInput,
}

#[derive(Debug)]
pub struct RandomKernel {
    distribution: Distribution,
    shape: OutputShape,
    /// `None` for the `*Like` variants without a `dtype` attribute
    dtype: Option<DataType>,
    rng: Mutex<StdRng>,
}

impl RandomKernel {
    pub fn new(node: &Node) -> Result<Self> {
        let like = node.op_type.ends_with("Like");
        let distribution = if node.op_type.starts_with("RandomUniform") {
            let low = f64::from(node.attr_float("low", 0.0));
            let high = f64::from(node.attr_float("high", 1.0));
            if low.is_nan() || high.is_nan() || low >= high {
                return Err(Error::invalid_argument(format!(
                    "node '{}': high ({high}) must be greater than low ({low})",
                    node.name
                )));
            }
            Distribution::Uniform { low, high }
        } else {
            Distribution::Normal {
                mean: f64::from(node.attr_float("mean", 0.0)),
                scale: f64::from(node.attr_float("scale", 1.0)),
            }
        };

        let dtype = match node.attribute("dtype").and_then(AttributeValue::as_int) {
            Some(code) => Some(
                DataType::from_onnx(code)
                    .filter(|dtype| FLOAT_TYPES.contains(dtype))
                    .ok_or_else(|| Error::invalid_argument(format!("node '{}': unsupported dtype {code}", node.name)))?,
            ),
            None if like => None,
            None => Some(DataType::F32),
        };

        let shape = if like {
            OutputShape::LikeInput
        } else {
            let dims = node
                .attribute("shape")
                .and_then(AttributeValue::as_ints)
                .ok_or_else(|| Error::invalid_argument(format!("node '{}' requires a 'shape' attribute", node.name)))?;
            let dims = dims
                .iter()
                .map(|dim| usize::try_from(*dim))
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|_| Error::invalid_argument(format!("node '{}' has a negative dimension", node.name)))?;
            OutputShape::Fixed(Shape::new(dims))
        };

        let rng = match node.attribute("seed").and_then(AttributeValue::as_float) {
            Some(seed) => StdRng::seed_from_u64(u64::from(seed.to_bits())),
            None => StdRng::from_entropy(),
        };

        Ok(Self {
            distribution,
            shape,
            dtype,
            rng: Mutex::new(rng),
        })
    }
}

impl OpKernel for RandomKernel {
    fn compute(&self, ctx: &mut KernelContext<'_>) -> Result<()> {
        let (dtype, shape) = match &self.shape {
            OutputShape::Fixed(shape) => (self.dtype.unwrap_or(DataType::F32), shape.clone()),
            OutputShape::LikeInput => {
                let input = ctx.input(0)?;
                (self.dtype.unwrap_or(input.dtype()), input.shape().clone())
            }
        };
        let out = ctx.output(0, dtype, shape)?;
        let mut rng = self.rng.lock();
        fill(out, || self.distribution.sample(&mut rng))
    }
}

fn fill(out: &mut Tensor, mut sample: impl FnMut() -> f64) -> Result<()> {
    match out.dtype() {
        DataType::F32 => out.data_mut::<f32>()?.iter_mut().for_each(|v| *v = sample() as f32),
        DataType::F64 => out.data_mut::<f64>()?.iter_mut().for_each(|v| *v = sample()),
        DataType::F16 => out
            .data_mut::<half::f16>()?
            .iter_mut()
            .for_each(|v| *v = half::f16::from_f64(sample())),
        other => {
            return Err(Error::TypeMismatch {
                expected: "a floating point type".to_string(),
                actual: other.to_string(),
            })
        }
    }
    Ok(())
}

pub(super) fn register(registry: &mut KernelRegistry, provider: &str) {
    for op in ["RandomUniform", "RandomNormal", "RandomUniformLike", "RandomNormalLike"] {
        registry.register(KernelDef::new(op, "", provider), |node| {
            Ok(Box::new(RandomKernel::new(node)?) as Box<dyn OpKernel>)
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::kernels::test_util::run_kernel;
    use meridian_core::graph::{Graph, NodeDef};

    fn kernel(def: NodeDef) -> Result<RandomKernel> {
        let mut graph = Graph::new("g");
        let index = graph.add_node(def);
        RandomKernel::new(graph.node(index).unwrap())
    }

    #[test]
    fn test_uniform_respects_bounds_and_shape() {
        let kernel = kernel(
            NodeDef::new("RandomUniform")
                .outputs(["r"])
                .attr("shape", vec![4i64, 8])
                .attr("low", -2.0f32)
                .attr("high", 3.0f32),
        )
        .unwrap();
        let out = run_kernel(&kernel, "RandomUniform", vec![], 1).unwrap();
        assert_eq!(out[0].shape(), &Shape::from([4, 8]));
        assert!(out[0].data::<f32>().unwrap().iter().all(|v| (-2.0..3.0).contains(v)));
    }

    #[test]
    fn test_seeded_kernels_agree() {
        let def = || {
            NodeDef::new("RandomNormal")
                .outputs(["r"])
                .attr("shape", vec![16i64])
                .attr("seed", 7.0f32)
                .attr("dtype", DataType::F64.onnx_code())
        };
        let a = run_kernel(&kernel(def()).unwrap(), "RandomNormal", vec![], 1).unwrap();
        let b = run_kernel(&kernel(def()).unwrap(), "RandomNormal", vec![], 1).unwrap();
        assert!(a[0].bitwise_eq(&b[0]));
        assert_eq!(a[0].dtype(), DataType::F64);
    }

    #[test]
    fn test_like_variant_copies_input_shape_and_type() {
        let kernel = kernel(NodeDef::new("RandomUniformLike").inputs(["x"]).outputs(["r"])).unwrap();
        let x = Tensor::zeros(DataType::F64, [3, 2]).unwrap();
        let out = run_kernel(&kernel, "RandomUniformLike", vec![x], 1).unwrap();
        assert_eq!(out[0].dtype(), DataType::F64);
        assert_eq!(out[0].shape(), &Shape::from([3, 2]));
    }

    #[test]
    fn test_invalid_attributes_are_rejected() {
        let inverted = NodeDef::new("RandomUniform")
            .outputs(["r"])
            .attr("shape", vec![1i64])
            .attr("low", 1.0f32)
            .attr("high", 0.0f32);
        assert!(kernel(inverted).is_err());

        let int_dtype = NodeDef::new("RandomUniform")
            .outputs(["r"])
            .attr("shape", vec![1i64])
            .attr("dtype", DataType::I64.onnx_code());
        assert!(kernel(int_dtype).is_err());

        assert!(kernel(NodeDef::new("RandomNormal").outputs(["r"])).is_err());
    }
}
