//! Node attributes

use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::graph::Graph;
use crate::tensor::Tensor;

/// A named node attribute value
#[derive(Debug, Clone)]
pub enum AttributeValue {
    Int(i64),
    Float(f32),
    String(String),
    Ints(Vec<i64>),
    Floats(Vec<f32>),
    Tensor(Arc<Tensor>),
    /// Body of a control-flow op
    Graph(Box<Graph>),
}

impl AttributeValue {
    pub fn kind(&self) -> &'static str {
        match self {
            AttributeValue::Int(_) => "int",
            AttributeValue::Float(_) => "float",
            AttributeValue::String(_) => "string",
            AttributeValue::Ints(_) => "ints",
            AttributeValue::Floats(_) => "floats",
            AttributeValue::Tensor(_) => "tensor",
            AttributeValue::Graph(_) => "graph",
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            AttributeValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f32> {
        match self {
            AttributeValue::Float(v) => Some(*v),
            AttributeValue::Int(v) => Some(*v as f32),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::String(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_ints(&self) -> Option<&[i64]> {
        match self {
            AttributeValue::Ints(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_floats(&self) -> Option<&[f32]> {
        match self {
            AttributeValue::Floats(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_tensor(&self) -> Option<&Arc<Tensor>> {
        match self {
            AttributeValue::Tensor(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_graph(&self) -> Option<&Graph> {
        match self {
            AttributeValue::Graph(g) => Some(g),
            _ => None,
        }
    }

    /// Feed a structural fingerprint of the value into `state`.
    ///
    /// Floats hash by bit pattern and tensors by content, so two attributes
    /// with equal fingerprints are interchangeable for a kernel. Sub-graphs
    /// hash by address: equal bodies in different nodes are never merged.
    pub fn fingerprint<H: Hasher>(&self, state: &mut H) {
        self.kind().hash(state);
        match self {
            AttributeValue::Int(v) => v.hash(state),
            AttributeValue::Float(v) => v.to_bits().hash(state),
            AttributeValue::String(v) => v.hash(state),
            AttributeValue::Ints(v) => v.hash(state),
            AttributeValue::Floats(v) => v.iter().for_each(|f| f.to_bits().hash(state)),
            AttributeValue::Tensor(t) => {
                t.dtype().hash(state);
                t.shape().hash(state);
                t.as_bytes().hash(state);
            }
            AttributeValue::Graph(g) => (g.as_ref() as *const Graph as usize).hash(state),
        }
    }

    /// Structural equality matching [`AttributeValue::fingerprint`].
    pub fn same_as(&self, other: &AttributeValue) -> bool {
        match (self, other) {
            (AttributeValue::Int(a), AttributeValue::Int(b)) => a == b,
            (AttributeValue::Float(a), AttributeValue::Float(b)) => a.to_bits() == b.to_bits(),
            (AttributeValue::String(a), AttributeValue::String(b)) => a == b,
            (AttributeValue::Ints(a), AttributeValue::Ints(b)) => a == b,
            (AttributeValue::Floats(a), AttributeValue::Floats(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.to_bits() == y.to_bits())
            }
            (AttributeValue::Tensor(a), AttributeValue::Tensor(b)) => a.bitwise_eq(b),
            (AttributeValue::Graph(a), AttributeValue::Graph(b)) => std::ptr::eq(a.as_ref(), b.as_ref()),
            _ => false,
        }
    }
}

impl From<i64> for AttributeValue {
    fn from(v: i64) -> Self {
        AttributeValue::Int(v)
    }
}

impl From<f32> for AttributeValue {
    fn from(v: f32) -> Self {
        AttributeValue::Float(v)
    }
}

impl From<&str> for AttributeValue {
    fn from(v: &str) -> Self {
        AttributeValue::String(v.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(v: String) -> Self {
        AttributeValue::String(v)
    }
}

impl From<Vec<i64>> for AttributeValue {
    fn from(v: Vec<i64>) -> Self {
        AttributeValue::Ints(v)
    }
}

impl From<Vec<f32>> for AttributeValue {
    fn from(v: Vec<f32>) -> Self {
        AttributeValue::Floats(v)
    }
}

impl From<Tensor> for AttributeValue {
    fn from(v: Tensor) -> Self {
        AttributeValue::Tensor(Arc::new(v))
    }
}

impl From<Graph> for AttributeValue {
    fn from(v: Graph) -> Self {
        AttributeValue::Graph(Box::new(v))
    }
}
