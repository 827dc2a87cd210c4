//! Nodes, edges and their handles

use std::collections::BTreeMap;
use std::fmt;

use crate::data_type::DataType;
use crate::graph::AttributeValue;
use crate::shape::Shape;

/// Stable handle to a node. Removing a node never reuses its index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeIndex(usize);

impl NodeIndex {
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    pub const fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for NodeIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node{}", self.0)
    }
}

/// Stable handle to a [`NodeArg`] in the graph's name table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArgId(usize);

impl ArgId {
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    pub const fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for ArgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "arg{}", self.0)
    }
}

/// Static element type and (optionally) shape of a value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TypeInfo {
    pub dtype: DataType,
    pub shape: Option<Shape>,
}

impl TypeInfo {
    pub fn new(dtype: DataType, shape: impl Into<Shape>) -> Self {
        Self {
            dtype,
            shape: Some(shape.into()),
        }
    }

    /// Known element type, unknown shape.
    pub fn of(dtype: DataType) -> Self {
        Self { dtype, shape: None }
    }
}

/// A named, typed edge endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeArg {
    pub name: String,
    pub type_info: Option<TypeInfo>,
}

impl NodeArg {
    pub fn dtype(&self) -> Option<DataType> {
        self.type_info.as_ref().map(|t| t.dtype)
    }

    pub fn shape(&self) -> Option<&Shape> {
        self.type_info.as_ref().and_then(|t| t.shape.as_ref())
    }
}

/// One graph operation.
#[derive(Debug, Clone)]
pub struct Node {
    pub name: String,
    pub op_type: String,
    pub domain: String,
    pub inputs: Vec<ArgId>,
    pub outputs: Vec<ArgId>,
    pub attributes: BTreeMap<String, AttributeValue>,
    /// Execution provider the partitioner assigned, if any
    pub provider: Option<String>,
}

impl Node {
    pub fn attribute(&self, name: &str) -> Option<&AttributeValue> {
        self.attributes.get(name)
    }

    pub fn attr_int(&self, name: &str, default: i64) -> i64 {
        self.attribute(name).and_then(AttributeValue::as_int).unwrap_or(default)
    }

    pub fn attr_float(&self, name: &str, default: f32) -> f32 {
        self.attribute(name).and_then(AttributeValue::as_float).unwrap_or(default)
    }

    pub fn has_subgraph(&self) -> bool {
        self.attributes.values().any(|v| matches!(v, AttributeValue::Graph(_)))
    }

    /// `op_type` qualified with its domain, for messages.
    pub fn qualified_op(&self) -> String {
        if self.domain.is_empty() {
            self.op_type.clone()
        } else {
            format!("{}::{}", self.domain, self.op_type)
        }
    }
}

/// Description of a node to insert, with arguments named rather than indexed.
///
/// ```rust
/// use meridian_core::graph::{Graph, NodeDef};
///
/// let mut graph = Graph::new("g");
/// let node = graph.add_node(
///     NodeDef::new("Add").name("add0").inputs(["a", "b"]).outputs(["y"]),
/// );
/// assert_eq!(graph.node(node).unwrap().op_type, "Add");
/// ```
#[derive(Debug, Clone, Default)]
pub struct NodeDef {
    pub name: String,
    pub op_type: String,
    pub domain: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub attributes: BTreeMap<String, AttributeValue>,
}

impl NodeDef {
    pub fn new(op_type: impl Into<String>) -> Self {
        Self {
            op_type: op_type.into(),
            ..Self::default()
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }

    pub fn inputs<I, S>(mut self, inputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inputs = inputs.into_iter().map(Into::into).collect();
        self
    }

    pub fn outputs<I, S>(mut self, outputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.outputs = outputs.into_iter().map(Into::into).collect();
        self
    }

    pub fn attr(mut self, name: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }
}
