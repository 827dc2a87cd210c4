//! Error types shared by every Meridian crate

use crate::allocator::MemoryType;

/// Result type for Meridian operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while building, optimizing or running a graph
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The graph does not resolve: dangling reference, cycle, duplicate
    /// producer, or type mismatch. Fatal, surfaced before execution.
    #[error("Graph integrity error: {0}")]
    GraphIntegrity(String),

    /// No registered provider has a kernel for this node
    #[error("No kernel found for node '{node}' (op_type={op_type}, domain='{domain}'){}", provider_suffix(.provider))]
    NoKernelFound {
        node: String,
        op_type: String,
        domain: String,
        provider: Option<String>,
    },

    /// Device memory exhausted
    #[error("Device allocation failed: requested {requested} bytes from allocator '{allocator}' on {device}")]
    DeviceAllocation {
        requested: usize,
        allocator: String,
        device: String,
    },

    /// A kernel failed, including errors reported late by a device
    #[error("Compute error in node '{node}' (op_type={op_type}): {message}")]
    Compute {
        node: String,
        op_type: String,
        message: String,
    },

    /// The provider exposes no allocator for the requested memory type
    #[error("Provider '{provider}' has no allocator for memory type {memory_type:?}")]
    UnsupportedMemoryType { provider: String, memory_type: MemoryType },

    /// A required graph input was not fed
    #[error("Missing input: '{0}'")]
    MissingInput(String),

    /// A requested output is not a graph output
    #[error("Unknown output: '{0}'")]
    UnknownOutput(String),

    /// Caller supplied an invalid argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Element type mismatch
    #[error("Type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },

    /// Shapes that cannot be combined
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    /// A parallel region was opened from inside one of the pool's own workers
    #[error("Nested parallel region: ParallelFor called from a worker of the same thread pool")]
    NestedParallelRegion,

    /// The thread pool could not be created
    #[error("Thread pool error: {0}")]
    ThreadPool(String),
}

fn provider_suffix(provider: &Option<String>) -> String {
    provider
        .as_ref()
        .map(|name| format!(" in provider '{name}'"))
        .unwrap_or_default()
}

impl Error {
    pub fn graph_integrity(message: impl Into<String>) -> Self {
        Error::GraphIntegrity(message.into())
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Error::InvalidArgument(message.into())
    }

    /// Compute failure attributed to a node.
    pub fn compute(node: impl Into<String>, op_type: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Compute {
            node: node.into(),
            op_type: op_type.into(),
            message: message.into(),
        }
    }

    /// Attribute an error raised inside a kernel to `node`/`op_type`.
    ///
    /// Errors that already carry their own identity (allocation failures,
    /// nested compute errors) are returned unchanged.
    pub fn within_node(self, node: &str, op_type: &str) -> Self {
        match self {
            Error::Compute { .. } | Error::DeviceAllocation { .. } | Error::NoKernelFound { .. } => self,
            other => Error::compute(node, op_type, other.to_string()),
        }
    }

    /// True for errors raised because the graph failed to resolve.
    pub fn is_graph_integrity(&self) -> bool {
        matches!(self, Error::GraphIntegrity(_))
    }
}
