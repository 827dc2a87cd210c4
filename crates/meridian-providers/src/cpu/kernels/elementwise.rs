//! Elementwise arithmetic: broadcasting binary ops and unary ops

use half::f16;
use meridian_core::shape::BroadcastIndexer;
use meridian_core::{DataType, Element, Error, Result, Shape, Tensor};

use crate::kernel::{KernelContext, KernelDef, KernelRegistry, OpKernel};

/// Elements per scheduled chunk.
const CHUNK_LEN: usize = 16 * 1024;

/// Numeric element types the CPU kernels compute on.
///
/// Integer ops wrap instead of overflowing.
pub(crate) trait Arithmetic: Element + Copy + PartialOrd {
    const ZERO: Self;

    fn add(self, rhs: Self) -> Self;
    fn sub(self, rhs: Self) -> Self;
    fn mul(self, rhs: Self) -> Self;
    fn div(self, rhs: Self) -> Self;
    fn neg(self) -> Self;
    fn abs(self) -> Self;
    fn sqrt(self) -> Self;
    fn from_f64(value: f64) -> Self;
}

macro_rules! impl_float_arithmetic {
    ($($ty:ty),*) => {
        $(
            impl Arithmetic for $ty {
                const ZERO: Self = 0.0;

                fn add(self, rhs: Self) -> Self { self + rhs }
                fn sub(self, rhs: Self) -> Self { self - rhs }
                fn mul(self, rhs: Self) -> Self { self * rhs }
                fn div(self, rhs: Self) -> Self { self / rhs }
                fn neg(self) -> Self { -self }
                fn abs(self) -> Self { <$ty>::abs(self) }
                fn sqrt(self) -> Self { <$ty>::sqrt(self) }
                fn from_f64(value: f64) -> Self { value as $ty }
            }
        )*
    };
}

macro_rules! impl_int_arithmetic {
    ($($ty:ty),*) => {
        $(
            impl Arithmetic for $ty {
                const ZERO: Self = 0;

                fn add(self, rhs: Self) -> Self { self.wrapping_add(rhs) }
                fn sub(self, rhs: Self) -> Self { self.wrapping_sub(rhs) }
                fn mul(self, rhs: Self) -> Self { self.wrapping_mul(rhs) }
                fn div(self, rhs: Self) -> Self { self.wrapping_div(rhs) }
                fn neg(self) -> Self { self.wrapping_neg() }
                fn abs(self) -> Self { self.wrapping_abs() }
                fn sqrt(self) -> Self { (self as f64).sqrt() as $ty }
                fn from_f64(value: f64) -> Self { value as $ty }
            }
        )*
    };
}

impl_float_arithmetic!(f32, f64);
impl_int_arithmetic!(i32, i64);

// f16 computes in f32 and rounds once per op
impl Arithmetic for f16 {
    const ZERO: Self = f16::ZERO;

    fn add(self, rhs: Self) -> Self {
        f16::from_f32(self.to_f32() + rhs.to_f32())
    }
    fn sub(self, rhs: Self) -> Self {
        f16::from_f32(self.to_f32() - rhs.to_f32())
    }
    fn mul(self, rhs: Self) -> Self {
        f16::from_f32(self.to_f32() * rhs.to_f32())
    }
    fn div(self, rhs: Self) -> Self {
        f16::from_f32(self.to_f32() / rhs.to_f32())
    }
    fn neg(self) -> Self {
        -self
    }
    fn abs(self) -> Self {
        f16::from_bits(self.to_bits() & 0x7fff)
    }
    fn sqrt(self) -> Self {
        f16::from_f32(self.to_f32().sqrt())
    }
    fn from_f64(value: f64) -> Self {
        f16::from_f64(value)
    }
}

/// Dispatch `$body` over the element type `$dtype` with `$t` bound to the
/// matching Rust type.
macro_rules! dispatch_arithmetic {
    ($dtype:expr, $t:ident => $body:expr) => {
        match $dtype {
            meridian_core::DataType::F32 => {
                type $t = f32;
                $body
            }
            meridian_core::DataType::F64 => {
                type $t = f64;
                $body
            }
            meridian_core::DataType::F16 => {
                type $t = half::f16;
                $body
            }
            meridian_core::DataType::I32 => {
                type $t = i32;
                $body
            }
            meridian_core::DataType::I64 => {
                type $t = i64;
                $body
            }
            other => Err(meridian_core::Error::TypeMismatch {
                expected: "a numeric type".to_string(),
                actual: other.to_string(),
            }),
        }
    };
}
pub(crate) use dispatch_arithmetic;

pub(crate) const NUMERIC_TYPES: [DataType; 5] =
    [DataType::F32, DataType::F64, DataType::F16, DataType::I32, DataType::I64];
pub(crate) const FLOAT_TYPES: [DataType; 3] = [DataType::F32, DataType::F64, DataType::F16];

// ================================================================================================
// Binary
// ================================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl BinaryOp {
    pub const ALL: [BinaryOp; 4] = [BinaryOp::Add, BinaryOp::Sub, BinaryOp::Mul, BinaryOp::Div];

    pub fn op_type(self) -> &'static str {
        match self {
            BinaryOp::Add => "Add",
            BinaryOp::Sub => "Sub",
            BinaryOp::Mul => "Mul",
            BinaryOp::Div => "Div",
        }
    }

    fn apply<T: Arithmetic>(self, lhs: T, rhs: T) -> T {
        match self {
            BinaryOp::Add => lhs.add(rhs),
            BinaryOp::Sub => lhs.sub(rhs),
            BinaryOp::Mul => lhs.mul(rhs),
            BinaryOp::Div => lhs.div(rhs),
        }
    }
}

/// Broadcasting binary arithmetic.
#[derive(Debug)]
pub struct BinaryKernel {
    op: BinaryOp,
}

impl BinaryKernel {
    pub fn new(op: BinaryOp) -> Self {
        Self { op }
    }

    fn run<T: Arithmetic>(&self, ctx: &mut KernelContext<'_>, lhs: &Tensor, rhs: &Tensor) -> Result<()> {
        let out_shape = Shape::broadcast(lhs.shape(), rhs.shape())?;
        let a = lhs.data::<T>()?;
        let b = rhs.data::<T>()?;
        if self.op == BinaryOp::Div && !T::DATA_TYPE.is_float() && b.iter().any(|v| *v == T::ZERO) {
            return Err(Error::invalid_argument("integer division by zero"));
        }

        let pool = ctx.thread_pool();
        let op = self.op;
        let out = ctx.output(0, T::DATA_TYPE, out_shape.clone())?.data_mut::<T>()?;

        if lhs.shape() == rhs.shape() {
            pool.parallel_chunks_mut(out, CHUNK_LEN, |chunk, values| {
                let base = chunk * CHUNK_LEN;
                for (i, value) in values.iter_mut().enumerate() {
                    *value = op.apply(a[base + i], b[base + i]);
                }
            })
        } else {
            let indexer = BroadcastIndexer::new(lhs.shape(), rhs.shape(), &out_shape);
            pool.parallel_chunks_mut(out, CHUNK_LEN, |chunk, values| {
                let base = chunk * CHUNK_LEN;
                for (i, value) in values.iter_mut().enumerate() {
                    let (l, r) = indexer.offsets(base + i);
                    *value = op.apply(a[l], b[r]);
                }
            })
        }
    }
}

impl OpKernel for BinaryKernel {
    fn compute(&self, ctx: &mut KernelContext<'_>) -> Result<()> {
        let lhs = ctx.input(0)?;
        let rhs = ctx.input(1)?;
        if lhs.dtype() != rhs.dtype() {
            return Err(Error::TypeMismatch {
                expected: lhs.dtype().to_string(),
                actual: rhs.dtype().to_string(),
            });
        }
        dispatch_arithmetic!(lhs.dtype(), T => self.run::<T>(ctx, lhs, rhs))
    }
}

// ================================================================================================
// Unary
// ================================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Abs,
    Relu,
    Sqrt,
}

impl UnaryOp {
    pub const ALL: [UnaryOp; 4] = [UnaryOp::Neg, UnaryOp::Abs, UnaryOp::Relu, UnaryOp::Sqrt];

    pub fn op_type(self) -> &'static str {
        match self {
            UnaryOp::Neg => "Neg",
            UnaryOp::Abs => "Abs",
            UnaryOp::Relu => "Relu",
            UnaryOp::Sqrt => "Sqrt",
        }
    }

    fn apply<T: Arithmetic>(self, value: T) -> T {
        match self {
            UnaryOp::Neg => value.neg(),
            UnaryOp::Abs => value.abs(),
            UnaryOp::Relu => {
                if value < T::ZERO {
                    T::ZERO
                } else {
                    value
                }
            }
            UnaryOp::Sqrt => value.sqrt(),
        }
    }

    fn supported_types(self) -> &'static [DataType] {
        match self {
            UnaryOp::Sqrt => &FLOAT_TYPES,
            _ => &NUMERIC_TYPES,
        }
    }
}

#[derive(Debug)]
pub struct UnaryKernel {
    op: UnaryOp,
}

impl UnaryKernel {
    pub fn new(op: UnaryOp) -> Self {
        Self { op }
    }

    fn run<T: Arithmetic>(&self, ctx: &mut KernelContext<'_>, input: &Tensor) -> Result<()> {
        let src = input.data::<T>()?;
        let pool = ctx.thread_pool();
        let op = self.op;
        let out = ctx.output(0, T::DATA_TYPE, input.shape().clone())?.data_mut::<T>()?;
        pool.parallel_chunks_mut(out, CHUNK_LEN, |chunk, values| {
            let base = chunk * CHUNK_LEN;
            for (i, value) in values.iter_mut().enumerate() {
                *value = op.apply(src[base + i]);
            }
        })
    }
}

impl OpKernel for UnaryKernel {
    fn compute(&self, ctx: &mut KernelContext<'_>) -> Result<()> {
        let input = ctx.input(0)?;
        if !self.op.supported_types().contains(&input.dtype()) {
            return Err(Error::TypeMismatch {
                expected: "a floating point type".to_string(),
                actual: input.dtype().to_string(),
            });
        }
        dispatch_arithmetic!(input.dtype(), T => self.run::<T>(ctx, input))
    }
}

pub(super) fn register(registry: &mut KernelRegistry, provider: &str) {
    for op in BinaryOp::ALL {
        registry.register(
            KernelDef::new(op.op_type(), "", provider).type_constraint(NUMERIC_TYPES),
            move |_| Ok(Box::new(BinaryKernel::new(op)) as Box<dyn OpKernel>),
        );
    }
    for op in UnaryOp::ALL {
        registry.register(
            KernelDef::new(op.op_type(), "", provider).type_constraint(op.supported_types().iter().copied()),
            move |_| Ok(Box::new(UnaryKernel::new(op)) as Box<dyn OpKernel>),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::kernels::test_util::run_kernel;

    #[test]
    fn test_add_broadcasts_row_vector() {
        let a = Tensor::from_slice([2, 3], &[1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let b = Tensor::from_slice([3], &[10.0f32, 20.0, 30.0]).unwrap();
        let out = run_kernel(&BinaryKernel::new(BinaryOp::Add), "Add", vec![a, b], 1).unwrap();
        assert_eq!(out[0].shape(), &Shape::from([2, 3]));
        assert_eq!(out[0].to_vec::<f32>().unwrap(), vec![11.0, 22.0, 33.0, 14.0, 25.0, 36.0]);
    }

    #[test]
    fn test_sub_with_scalar_on_the_left() {
        let a = Tensor::scalar(10i64).unwrap();
        let b = Tensor::from_slice([3], &[1i64, 2, 3]).unwrap();
        let out = run_kernel(&BinaryKernel::new(BinaryOp::Sub), "Sub", vec![a, b], 2).unwrap();
        assert_eq!(out[0].to_vec::<i64>().unwrap(), vec![9, 8, 7]);
    }

    #[test]
    fn test_integer_division_by_zero_is_an_error() {
        let a = Tensor::from_slice([2], &[4i32, 6]).unwrap();
        let b = Tensor::from_slice([2], &[2i32, 0]).unwrap();
        let err = run_kernel(&BinaryKernel::new(BinaryOp::Div), "Div", vec![a, b], 1).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_float_division_by_zero_is_infinite() {
        let a = Tensor::from_slice([1], &[1.0f64]).unwrap();
        let b = Tensor::from_slice([1], &[0.0f64]).unwrap();
        let out = run_kernel(&BinaryKernel::new(BinaryOp::Div), "Div", vec![a, b], 1).unwrap();
        assert_eq!(out[0].to_vec::<f64>().unwrap(), vec![f64::INFINITY]);
    }

    #[test]
    fn test_incompatible_shapes_are_rejected() {
        let a = Tensor::from_slice([2], &[1.0f32, 2.0]).unwrap();
        let b = Tensor::from_slice([3], &[1.0f32, 2.0, 3.0]).unwrap();
        let err = run_kernel(&BinaryKernel::new(BinaryOp::Mul), "Mul", vec![a, b], 1).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch(_)));
    }

    #[test]
    fn test_mixed_types_are_rejected() {
        let a = Tensor::from_slice([1], &[1.0f32]).unwrap();
        let b = Tensor::from_slice([1], &[1i32]).unwrap();
        let err = run_kernel(&BinaryKernel::new(BinaryOp::Add), "Add", vec![a, b], 1).unwrap_err();
        assert!(matches!(err, Error::TypeMismatch { .. }));
    }

    #[test]
    fn test_unary_ops() {
        let x = || Tensor::from_slice([4], &[-2.0f32, -0.5, 0.0, 4.0]).unwrap();
        let relu = run_kernel(&UnaryKernel::new(UnaryOp::Relu), "Relu", vec![x()], 1).unwrap();
        assert_eq!(relu[0].to_vec::<f32>().unwrap(), vec![0.0, 0.0, 0.0, 4.0]);
        let neg = run_kernel(&UnaryKernel::new(UnaryOp::Neg), "Neg", vec![x()], 1).unwrap();
        assert_eq!(neg[0].to_vec::<f32>().unwrap(), vec![2.0, 0.5, -0.0, -4.0]);
        let abs = run_kernel(&UnaryKernel::new(UnaryOp::Abs), "Abs", vec![x()], 1).unwrap();
        assert_eq!(abs[0].to_vec::<f32>().unwrap(), vec![2.0, 0.5, 0.0, 4.0]);
    }

    #[test]
    fn test_sqrt_rejects_integers() {
        let x = Tensor::from_slice([1], &[4i64]).unwrap();
        let err = run_kernel(&UnaryKernel::new(UnaryOp::Sqrt), "Sqrt", vec![x], 1).unwrap_err();
        assert!(matches!(err, Error::TypeMismatch { .. }));
    }

    #[test]
    fn test_f16_add() {
        let a = Tensor::from_slice([2], &[f16::from_f32(1.5), f16::from_f32(-2.0)]).unwrap();
        let b = Tensor::from_slice([2], &[f16::from_f32(0.25), f16::from_f32(2.0)]).unwrap();
        let out = run_kernel(&BinaryKernel::new(BinaryOp::Add), "Add", vec![a, b], 1).unwrap();
        assert_eq!(out[0].to_vec::<f16>().unwrap(), vec![f16::from_f32(1.75), f16::from_f32(0.0)]);
    }

    #[test]
    fn test_large_input_is_identical_across_pool_sizes() {
        let values: Vec<f32> = (0..100_000).map(|i| (i as f32).sin()).collect();
        let run = |threads| {
            let a = Tensor::from_slice([values.len()], &values).unwrap();
            let b = Tensor::scalar(0.5f32).unwrap();
            run_kernel(&BinaryKernel::new(BinaryOp::Mul), "Mul", vec![a, b], threads).unwrap()
        };
        assert!(run(1)[0].bitwise_eq(&run(4)[0]));
    }
}
