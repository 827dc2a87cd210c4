//! # meridian-providers
//!
//! Execution providers for the Meridian engine.
//!
//! - [`provider`]: the [`ExecutionProvider`] contract
//! - [`kernel`]: [`OpKernel`], [`KernelContext`] and the [`KernelRegistry`]
//! - [`cpu`]: the CPU provider and its kernel catalog
//! - [`gpu_sim`]: a simulated discrete GPU with streams and deferred faults
//! - [`factory`]: factories sessions use to create providers
//!
//! ```rust
//! use meridian_providers::{CpuExecutionProvider, ExecutionProvider};
//! use meridian_core::MemoryType;
//!
//! let cpu = CpuExecutionProvider::default();
//! assert_eq!(cpu.name(), "CPUExecutionProvider");
//! assert!(cpu.allocator(MemoryType::Default).is_ok());
//! ```

pub mod cpu;
pub mod factory;
pub mod gpu_sim;
pub mod kernel;
pub mod provider;

pub use cpu::{CpuExecutionProvider, CpuProviderOptions};
pub use factory::{CpuProviderFactory, GpuSimProviderFactory, ProviderFactory};
pub use gpu_sim::{DeviceProperties, DeviceRegistry, GpuSimExecutionProvider, GpuSimProviderOptions};
pub use kernel::{KernelContext, KernelDef, KernelRegistry, OpKernel};
pub use provider::{ExecutionProvider, CPU_EXECUTION_PROVIDER, GPU_SIM_EXECUTION_PROVIDER};
