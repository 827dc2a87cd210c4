//! # meridian-core
//!
//! Foundation types of the Meridian graph-execution engine:
//!
//! - [`tensor`], [`shape`], [`data_type`]: typed, shaped, row-major buffers
//! - [`allocator`]: device memory, arena and direct allocators
//! - [`threadpool`]: the intra-op `ParallelFor` / `BatchParallelFor` scheduler
//! - [`graph`]: the mutable, resolvable dataflow graph
//! - [`error`]: the error taxonomy shared by every Meridian crate
//!
//! ```rust
//! use meridian_core::graph::{Graph, NodeDef};
//! use meridian_core::Tensor;
//!
//! # fn main() -> meridian_core::Result<()> {
//! let mut graph = Graph::new("example");
//! graph.add_initializer("a", Tensor::scalar(2.0f32)?);
//! graph.add_initializer("b", Tensor::scalar(3.0f32)?);
//! graph.add_node(NodeDef::new("Add").inputs(["a", "b"]).outputs(["y"]));
//! graph.add_output("y");
//! graph.resolve()?;
//! assert_eq!(graph.topological_order()?.len(), 1);
//! # Ok(())
//! # }
//! ```

pub mod allocator;
pub mod data_type;
pub mod error;
pub mod graph;
pub mod shape;
pub mod tensor;
pub mod threadpool;

pub use allocator::{Allocator, Device, DeviceKind, MemoryInfo, MemoryType};
pub use data_type::{DataType, Element};
pub use error::{Error, Result};
pub use graph::{ArgId, Graph, Node, NodeArg, NodeDef, NodeIndex, TypeInfo};
pub use shape::Shape;
pub use tensor::Tensor;
pub use threadpool::ThreadPool;
