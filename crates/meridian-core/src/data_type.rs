//! Tensor element types

use std::fmt;

use serde::{Deserialize, Serialize};

/// Element type of a tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DataType {
    F32,
    F64,
    F16,
    I32,
    I64,
    U8,
    /// Stored as one byte per element (0 or 1)
    Bool,
}

impl DataType {
    /// Size of one element in bytes
    pub const fn size_bytes(self) -> usize {
        match self {
            DataType::F32 | DataType::I32 => 4,
            DataType::F64 | DataType::I64 => 8,
            DataType::F16 => 2,
            DataType::U8 | DataType::Bool => 1,
        }
    }

    pub const fn is_float(self) -> bool {
        matches!(self, DataType::F32 | DataType::F64 | DataType::F16)
    }

    pub const fn name(self) -> &'static str {
        match self {
            DataType::F32 => "float32",
            DataType::F64 => "float64",
            DataType::F16 => "float16",
            DataType::I32 => "int32",
            DataType::I64 => "int64",
            DataType::U8 => "uint8",
            DataType::Bool => "bool",
        }
    }

    /// Element type for an ONNX `TensorProto.DataType` code.
    pub const fn from_onnx(code: i64) -> Option<Self> {
        match code {
            1 => Some(DataType::F32),
            2 => Some(DataType::U8),
            6 => Some(DataType::I32),
            7 => Some(DataType::I64),
            9 => Some(DataType::Bool),
            10 => Some(DataType::F16),
            11 => Some(DataType::F64),
            _ => None,
        }
    }

    pub const fn onnx_code(self) -> i64 {
        match self {
            DataType::F32 => 1,
            DataType::U8 => 2,
            DataType::I32 => 6,
            DataType::I64 => 7,
            DataType::Bool => 9,
            DataType::F16 => 10,
            DataType::F64 => 11,
        }
    }

    /// All element types, in declaration order.
    pub const ALL: [DataType; 7] = [
        DataType::F32,
        DataType::F64,
        DataType::F16,
        DataType::I32,
        DataType::I64,
        DataType::U8,
        DataType::Bool,
    ];
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Rust types that can back a tensor buffer.
pub trait Element: bytemuck::Pod + Send + Sync + fmt::Debug + PartialEq + 'static {
    const DATA_TYPE: DataType;
}

macro_rules! impl_element {
    ($($ty:ty => $dtype:ident),* $(,)?) => {
        $(
            impl Element for $ty {
                const DATA_TYPE: DataType = DataType::$dtype;
            }
        )*
    };
}

impl_element! {
    f32 => F32,
    f64 => F64,
    half::f16 => F16,
    i32 => I32,
    i64 => I64,
    u8 => U8,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sizes_match_rust_types() {
        assert_eq!(DataType::F32.size_bytes(), std::mem::size_of::<f32>());
        assert_eq!(DataType::F64.size_bytes(), std::mem::size_of::<f64>());
        assert_eq!(DataType::F16.size_bytes(), std::mem::size_of::<half::f16>());
        assert_eq!(DataType::I64.size_bytes(), std::mem::size_of::<i64>());
        assert_eq!(DataType::Bool.size_bytes(), 1);
    }

    #[test]
    fn test_element_data_types() {
        assert_eq!(<f32 as Element>::DATA_TYPE, DataType::F32);
        assert_eq!(<half::f16 as Element>::DATA_TYPE, DataType::F16);
        assert_eq!(<u8 as Element>::DATA_TYPE, DataType::U8);
    }

    #[test]
    fn test_onnx_codes_round_trip() {
        for dtype in DataType::ALL {
            assert_eq!(DataType::from_onnx(dtype.onnx_code()), Some(dtype));
        }
        assert_eq!(DataType::from_onnx(16), None);
    }

    #[test]
    fn test_serde_names() {
        let json = serde_json::to_string(&DataType::I32).unwrap();
        assert_eq!(json, "\"I32\"");
        let back: DataType = serde_json::from_str(&json).unwrap();
        assert_eq!(back, DataType::I32);
    }
}
