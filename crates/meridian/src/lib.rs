//! # Meridian
//!
//! A heterogeneous graph-execution engine: load a dataflow graph, rewrite it
//! into a cheaper equivalent, spread its nodes over execution providers and
//! run it with intra-op parallelism.
//!
//! ## Architecture
//!
//! ```text
//! meridian (sessions)
//!   ├── meridian-optimizer   graph rewrites, constant folding
//!   ├── meridian-providers   CPU and simulated GPU providers, kernels
//!   ├── meridian-core        graph, tensors, allocators, thread pool
//!   └── meridian-tracing     subscriber setup, performance spans
//! ```
//!
//! ## Example
//!
//! ```rust
//! use std::collections::HashMap;
//!
//! use meridian::{InferenceSession, SessionBuilder, SessionOptions};
//! use meridian_core::graph::{Graph, NodeDef, TypeInfo};
//! use meridian_core::{DataType, Tensor};
//!
//! let mut graph = Graph::new("scale");
//! graph.add_input("x", TypeInfo::new(DataType::F32, [2]));
//! graph.add_initializer("w", Tensor::from_slice([2], &[2.0f32, 3.0]).unwrap());
//! graph.add_node(NodeDef::new("Mul").inputs(["x", "w"]).outputs(["y"]));
//! graph.add_output("y");
//!
//! let session = SessionBuilder::new()
//!     .with_options(SessionOptions::default().with_intra_op_num_threads(1))
//!     .build(graph)
//!     .unwrap();
//! let feeds = HashMap::from([("x".to_string(), Tensor::from_slice([2], &[1.0f32, 1.0]).unwrap())]);
//! let y = session.run(feeds, &["y"]).unwrap();
//! assert_eq!(y[0].to_vec::<f32>().unwrap(), vec![2.0, 3.0]);
//! # let _ = InferenceSession::builder();
//! ```

pub mod options;
pub mod partition;
pub mod plan;
pub mod session;

pub use options::{ProviderConfig, SessionOptions};
pub use partition::{partition, PartitionSummary};
pub use plan::{ExecutionPlan, ExecutionStep};
pub use session::{InferenceSession, SessionBuilder};

pub use meridian_core::{DataType, Error, Graph, Result, Tensor};
pub use meridian_optimizer::GraphOptimizationLevel;
pub use meridian_providers::{
    CpuProviderFactory, DeviceRegistry, ExecutionProvider, GpuSimExecutionProvider, GpuSimProviderFactory,
    GpuSimProviderOptions,
};
