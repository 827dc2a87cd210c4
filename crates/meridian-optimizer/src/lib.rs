//! # meridian-optimizer
//!
//! Graph rewrite passes and the manager that runs them to a fixpoint.
//!
//! ```text
//! GraphTransformerManager
//! ├── Basic
//! │   ├── ConstantFolding
//! │   ├── EliminateIdentity
//! │   └── EliminateDeadNodes
//! └── Extended
//!     └── CommonSubexpressionElimination
//! ```
//!
//! ```rust
//! use meridian_core::graph::{Graph, NodeDef};
//! use meridian_core::Tensor;
//! use meridian_optimizer::{default_transformers, ConstantFoldingOptions, GraphOptimizationLevel};
//!
//! let mut graph = Graph::new("fold");
//! graph.add_initializer("a", Tensor::scalar(2.0f32).unwrap());
//! graph.add_initializer("b", Tensor::scalar(3.0f32).unwrap());
//! graph.add_node(NodeDef::new("Add").inputs(["a", "b"]).outputs(["y"]));
//! graph.add_output("y");
//!
//! let manager = default_transformers(ConstantFoldingOptions::default(), 5);
//! manager.apply(&mut graph, GraphOptimizationLevel::All).unwrap();
//! assert_eq!(graph.node_count(), 0);
//! assert_eq!(graph.initializer("y").unwrap().to_vec::<f32>().unwrap(), vec![5.0]);
//! ```

pub mod constant_folding;
pub mod cse;
pub mod eliminate;
pub mod transformer;

pub use constant_folding::{ConstantFolding, ConstantFoldingOptions, NON_DETERMINISTIC_OPS};
pub use cse::CommonSubexpressionElimination;
pub use eliminate::{EliminateDeadNodes, EliminateIdentity};
pub use transformer::{
    GraphOptimizationLevel, GraphTransformer, GraphTransformerManager, TransformReport, TransformerLevel,
    DEFAULT_MAX_STEPS,
};

/// The standard pass list.
pub fn default_transformers(constant_folding: ConstantFoldingOptions, max_steps: usize) -> GraphTransformerManager {
    let mut manager = GraphTransformerManager::new(max_steps);
    manager.register(TransformerLevel::Basic, Box::new(ConstantFolding::new(constant_folding)));
    manager.register(TransformerLevel::Basic, Box::new(EliminateIdentity));
    manager.register(TransformerLevel::Basic, Box::new(EliminateDeadNodes));
    manager.register(TransformerLevel::Extended, Box::new(CommonSubexpressionElimination));
    manager
}
