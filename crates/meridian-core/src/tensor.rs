//! Typed, shaped tensors
//!
//! A [`Tensor`] owns one contiguous, row-major buffer. The buffer comes
//! either from the host heap (tensors built from Rust data, such as
//! initializers and feeds) or from an [`Allocator`], in which case it goes
//! back to that allocator when the tensor is dropped.

use std::fmt;
use std::sync::Arc;

use crate::allocator::{Allocator, Device, DeviceMemory, HostMemory, MemoryBlock, MemoryInfo};
use crate::data_type::{DataType, Element};
use crate::error::{Error, Result};
use crate::shape::Shape;

enum Owner {
    Host(HostMemory),
    Allocator(Arc<dyn Allocator>),
}

struct Storage {
    block: MemoryBlock,
    owner: Owner,
}

impl Drop for Storage {
    fn drop(&mut self) {
        let block = std::mem::replace(&mut self.block, MemoryBlock::empty());
        match &self.owner {
            Owner::Host(memory) => memory.release(block),
            Owner::Allocator(allocator) => allocator.free(block),
        }
    }
}

/// A typed, shaped buffer
pub struct Tensor {
    dtype: DataType,
    shape: Shape,
    storage: Storage,
}

impl Tensor {
    /// Allocate a zero-filled tensor from `allocator`.
    pub fn allocate(dtype: DataType, shape: impl Into<Shape>, allocator: &Arc<dyn Allocator>) -> Result<Self> {
        let shape = shape.into();
        let bytes = byte_len(dtype, &shape)?;
        let block = allocator.alloc(bytes)?;
        // SAFETY: the block is at least `bytes` long and exclusively ours.
        unsafe { std::ptr::write_bytes(block.as_ptr(), 0, bytes) };
        Ok(Self {
            dtype,
            shape,
            storage: Storage {
                block,
                owner: Owner::Allocator(Arc::clone(allocator)),
            },
        })
    }

    /// Zero-filled host tensor.
    pub fn zeros(dtype: DataType, shape: impl Into<Shape>) -> Result<Self> {
        let shape = shape.into();
        let bytes = byte_len(dtype, &shape)?;
        let memory = HostMemory::new();
        let block = memory.allocate(bytes)?;
        Ok(Self {
            dtype,
            shape,
            storage: Storage {
                block,
                owner: Owner::Host(memory),
            },
        })
    }

    /// Host tensor holding a copy of `data`.
    pub fn from_slice<T: Element>(shape: impl Into<Shape>, data: &[T]) -> Result<Self> {
        let shape = shape.into();
        if shape.checked_numel()? != data.len() {
            return Err(Error::ShapeMismatch(format!(
                "{} elements do not fill shape {shape}",
                data.len()
            )));
        }
        let mut tensor = Self::zeros(T::DATA_TYPE, shape)?;
        tensor.as_bytes_mut().copy_from_slice(bytemuck::cast_slice(data));
        Ok(tensor)
    }

    /// Rank-0 host tensor.
    pub fn scalar<T: Element>(value: T) -> Result<Self> {
        Self::from_slice(Shape::scalar(), &[value])
    }

    /// Boolean host tensor (one byte per element).
    pub fn from_bools(shape: impl Into<Shape>, data: &[bool]) -> Result<Self> {
        let bytes: Vec<u8> = data.iter().map(|b| u8::from(*b)).collect();
        let mut tensor = Self::from_slice(shape, &bytes)?;
        tensor.dtype = DataType::Bool;
        Ok(tensor)
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn numel(&self) -> usize {
        self.shape.numel()
    }

    pub fn size_bytes(&self) -> usize {
        self.numel() * self.dtype.size_bytes()
    }

    /// Memory description of the owning allocator; `None` for host heap tensors.
    pub fn memory_info(&self) -> Option<&MemoryInfo> {
        match &self.storage.owner {
            Owner::Host(_) => None,
            Owner::Allocator(allocator) => Some(allocator.info()),
        }
    }

    /// Device the buffer lives on.
    pub fn device(&self) -> Device {
        self.memory_info().map_or(Device::CPU, |info| info.device)
    }

    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: the block holds at least size_bytes() initialized bytes.
        unsafe { std::slice::from_raw_parts(self.storage.block.as_ptr(), self.size_bytes()) }
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above, and `&mut self` guarantees exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.storage.block.as_ptr(), self.size_bytes()) }
    }

    /// Typed view. Fails when `T` does not match the element type.
    pub fn data<T: Element>(&self) -> Result<&[T]> {
        self.check_type::<T>()?;
        // SAFETY: type checked above; blocks are ALIGNMENT-aligned which
        // satisfies every Element's alignment; length is numel.
        Ok(unsafe { std::slice::from_raw_parts(self.storage.block.as_ptr() as *const T, self.numel()) })
    }

    pub fn data_mut<T: Element>(&mut self) -> Result<&mut [T]> {
        self.check_type::<T>()?;
        // SAFETY: see `data`; `&mut self` guarantees exclusive access.
        Ok(unsafe { std::slice::from_raw_parts_mut(self.storage.block.as_ptr() as *mut T, self.numel()) })
    }

    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        Ok(self.data::<T>()?.to_vec())
    }

    /// Deep copy into memory from `allocator`.
    pub fn copy_to(&self, allocator: &Arc<dyn Allocator>) -> Result<Tensor> {
        let mut copy = Tensor::allocate(self.dtype, self.shape.clone(), allocator)?;
        copy.as_bytes_mut().copy_from_slice(self.as_bytes());
        Ok(copy)
    }

    /// Deep copy into host heap memory.
    pub fn try_clone(&self) -> Result<Tensor> {
        let mut copy = Tensor::zeros(self.dtype, self.shape.clone())?;
        copy.as_bytes_mut().copy_from_slice(self.as_bytes());
        Ok(copy)
    }

    /// Overwrite this tensor's bytes with `src`'s. Element type and shape must match.
    pub fn copy_from(&mut self, src: &Tensor) -> Result<()> {
        if self.dtype != src.dtype {
            return Err(Error::TypeMismatch {
                expected: self.dtype.to_string(),
                actual: src.dtype.to_string(),
            });
        }
        if self.shape != src.shape {
            return Err(Error::ShapeMismatch(format!("copy from {} into {}", src.shape, self.shape)));
        }
        self.as_bytes_mut().copy_from_slice(src.as_bytes());
        Ok(())
    }

    /// Same element type, shape and bytes.
    pub fn bitwise_eq(&self, other: &Tensor) -> bool {
        self.dtype == other.dtype && self.shape == other.shape && self.as_bytes() == other.as_bytes()
    }

    fn check_type<T: Element>(&self) -> Result<()> {
        let matches = T::DATA_TYPE == self.dtype || (self.dtype == DataType::Bool && T::DATA_TYPE == DataType::U8);
        if matches {
            Ok(())
        } else {
            Err(Error::TypeMismatch {
                expected: self.dtype.to_string(),
                actual: T::DATA_TYPE.to_string(),
            })
        }
    }
}

fn byte_len(dtype: DataType, shape: &Shape) -> Result<usize> {
    shape
        .dims()
        .iter()
        .try_fold(dtype.size_bytes(), |acc, dim| acc.checked_mul(*dim))
        .ok_or_else(|| Error::invalid_argument(format!("tensor of shape {shape} overflows the address space")))
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("dtype", &self.dtype)
            .field("shape", &self.shape)
            .field("device", &self.device())
            .finish()
    }
}
