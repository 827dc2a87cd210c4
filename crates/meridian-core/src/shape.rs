//! Tensor shapes and broadcasting

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Ordered, non-negative dimension sizes. Rank 0 is a scalar.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Shape(Vec<usize>);

impl Shape {
    pub fn new(dims: impl Into<Vec<usize>>) -> Self {
        Shape(dims.into())
    }

    pub fn scalar() -> Self {
        Shape(Vec::new())
    }

    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    pub fn rank(&self) -> usize {
        self.0.len()
    }

    /// Product of the dimensions (1 for a scalar). Saturates at `usize::MAX`;
    /// use [`Shape::checked_numel`] on shapes that have not been validated.
    pub fn numel(&self) -> usize {
        self.0.iter().fold(1usize, |acc, dim| acc.saturating_mul(*dim))
    }

    /// Product of the dimensions, failing when it does not fit in `usize`.
    pub fn checked_numel(&self) -> Result<usize> {
        self.0
            .iter()
            .try_fold(1usize, |acc, dim| acc.checked_mul(*dim))
            .ok_or_else(|| Error::ShapeMismatch(format!("element count of shape {self} overflows")))
    }

    pub fn dim(&self, axis: usize) -> Option<usize> {
        self.0.get(axis).copied()
    }

    /// Row-major strides in elements
    pub fn strides(&self) -> Vec<usize> {
        let mut strides = vec![1; self.0.len()];
        for axis in (0..self.0.len().saturating_sub(1)).rev() {
            strides[axis] = strides[axis + 1] * self.0[axis + 1];
        }
        strides
    }

    /// Numpy-style broadcast of two shapes.
    pub fn broadcast(lhs: &Shape, rhs: &Shape) -> Result<Shape> {
        let rank = lhs.rank().max(rhs.rank());
        let mut dims = vec![0; rank];
        for (i, dim) in dims.iter_mut().enumerate() {
            let l = lhs.aligned_dim(i, rank);
            let r = rhs.aligned_dim(i, rank);
            *dim = match (l, r) {
                (a, b) if a == b => a,
                (1, b) => b,
                (a, 1) => a,
                _ => {
                    return Err(Error::ShapeMismatch(format!("cannot broadcast {lhs} with {rhs}")));
                }
            };
        }
        Ok(Shape(dims))
    }

    /// Strides to read `self` as if it had been broadcast to `target`
    /// (zero stride on broadcast axes).
    pub fn broadcast_strides(&self, target: &Shape) -> Vec<usize> {
        let rank = target.rank();
        let own = self.strides();
        let offset = rank - self.rank();
        (0..rank)
            .map(|i| {
                if i < offset || self.0[i - offset] == 1 {
                    0
                } else {
                    own[i - offset]
                }
            })
            .collect()
    }

    fn aligned_dim(&self, axis: usize, rank: usize) -> usize {
        let offset = rank - self.rank();
        if axis < offset {
            1
        } else {
            self.0[axis - offset]
        }
    }
}

impl From<Vec<usize>> for Shape {
    fn from(dims: Vec<usize>) -> Self {
        Shape(dims)
    }
}

impl From<&[usize]> for Shape {
    fn from(dims: &[usize]) -> Self {
        Shape(dims.to_vec())
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(dims: [usize; N]) -> Self {
        Shape(dims.to_vec())
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, dim) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{dim}")?;
        }
        write!(f, "]")
    }
}

/// Maps output linear indices to input offsets for a binary broadcast.
#[derive(Debug, Clone)]
pub struct BroadcastIndexer {
    out_dims: Vec<usize>,
    lhs_strides: Vec<usize>,
    rhs_strides: Vec<usize>,
}

impl BroadcastIndexer {
    pub fn new(lhs: &Shape, rhs: &Shape, out: &Shape) -> Self {
        Self {
            out_dims: out.dims().to_vec(),
            lhs_strides: lhs.broadcast_strides(out),
            rhs_strides: rhs.broadcast_strides(out),
        }
    }

    /// Offsets into the left and right inputs for output element `index`.
    pub fn offsets(&self, mut index: usize) -> (usize, usize) {
        let (mut lhs, mut rhs) = (0, 0);
        for axis in (0..self.out_dims.len()).rev() {
            let dim = self.out_dims[axis];
            let coord = index % dim;
            index /= dim;
            lhs += coord * self.lhs_strides[axis];
            rhs += coord * self.rhs_strides[axis];
        }
        (lhs, rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numel_and_strides() {
        let shape = Shape::from([2, 3, 4]);
        assert_eq!(shape.numel(), 24);
        assert_eq!(shape.strides(), vec![12, 4, 1]);
        assert_eq!(Shape::scalar().numel(), 1);
        assert_eq!(Shape::from([3, 0]).numel(), 0);
    }

    #[test]
    fn test_numel_overflow_is_an_error() {
        let huge = Shape::new([usize::MAX, 2]);
        assert!(matches!(huge.checked_numel(), Err(Error::ShapeMismatch(_))));
        assert_eq!(huge.numel(), usize::MAX);
        assert_eq!(Shape::new([3, 4]).checked_numel().unwrap(), 12);
        assert_eq!(Shape::scalar().checked_numel().unwrap(), 1);
    }

    #[test]
    fn test_broadcast() {
        let out = Shape::broadcast(&Shape::from([2, 1, 4]), &Shape::from([3, 1])).unwrap();
        assert_eq!(out, Shape::from([2, 3, 4]));

        let scalar = Shape::broadcast(&Shape::scalar(), &Shape::from([5])).unwrap();
        assert_eq!(scalar, Shape::from([5]));

        assert!(matches!(
            Shape::broadcast(&Shape::from([2]), &Shape::from([3])),
            Err(Error::ShapeMismatch(_))
        ));
    }

    #[test]
    fn test_broadcast_indexer() {
        let lhs = Shape::from([2, 3]);
        let rhs = Shape::from([3]);
        let out = Shape::broadcast(&lhs, &rhs).unwrap();
        let indexer = BroadcastIndexer::new(&lhs, &rhs, &out);
        assert_eq!(indexer.offsets(0), (0, 0));
        assert_eq!(indexer.offsets(4), (4, 1));
        assert_eq!(indexer.offsets(5), (5, 2));
    }

    #[test]
    fn test_display() {
        assert_eq!(Shape::from([1, 2]).to_string(), "[1, 2]");
        assert_eq!(Shape::scalar().to_string(), "[]");
    }
}
