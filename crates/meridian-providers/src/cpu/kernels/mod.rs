//! CPU kernel catalog
//!
//! | op | types |
//! |----|-------|
//! | Add, Sub, Mul, Div (broadcasting) | f32, f64, f16, i32, i64 |
//! | Neg, Abs, Relu | f32, f64, f16, i32, i64 |
//! | Sqrt | f32, f64, f16 |
//! | Identity, Constant | any |
//! | RandomUniform, RandomNormal, RandomUniformLike, RandomNormalLike | f32, f64, f16 outputs |
//! | BatchNormalization (inference) | f32, f64, f16 |

pub mod batch_norm;
pub mod elementwise;
pub mod random;
pub mod tensor_ops;

use crate::kernel::KernelRegistry;

/// Register every CPU kernel under `provider`.
pub fn register_kernels(registry: &mut KernelRegistry, provider: &str) {
    elementwise::register(registry, provider);
    tensor_ops::register(registry, provider);
    random::register(registry, provider);
    batch_norm::register(registry, provider);
}
