//! Core data types for tflconv

/// Element types found in checkpoints and mobile models
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    // Float types
    Float32,
    Float16,
    BFloat16,
    Float64,
    // Integer types
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Bool,
}

impl DataType {
    /// Size of one element in bytes
    pub fn element_size(&self) -> usize {
        match self {
            DataType::Float32 => 4,
            DataType::Float16 | DataType::BFloat16 => 2,
            DataType::Float64 => 8,
            DataType::Int8 | DataType::UInt8 | DataType::Bool => 1,
            DataType::Int16 | DataType::UInt16 => 2,
            DataType::Int32 | DataType::UInt32 => 4,
            DataType::Int64 | DataType::UInt64 => 8,
        }
    }

    /// Bytes needed for a tensor of this type, or `None` on overflow
    pub fn byte_len(&self, shape: &[usize]) -> Option<usize> {
        shape
            .iter()
            .try_fold(self.element_size(), |acc, &d| acc.checked_mul(d))
    }

    /// Check if this is a float type
    pub fn is_float(&self) -> bool {
        matches!(
            self,
            DataType::Float32 | DataType::Float16 | DataType::BFloat16 | DataType::Float64
        )
    }

    /// Short lowercase name, as printed by `tflconv inspect`
    pub fn name(&self) -> &'static str {
        match self {
            DataType::Float32 => "f32",
            DataType::Float16 => "f16",
            DataType::BFloat16 => "bf16",
            DataType::Float64 => "f64",
            DataType::Int8 => "i8",
            DataType::UInt8 => "u8",
            DataType::Int16 => "i16",
            DataType::UInt16 => "u16",
            DataType::Int32 => "i32",
            DataType::UInt32 => "u32",
            DataType::Int64 => "i64",
            DataType::UInt64 => "u64",
            DataType::Bool => "bool",
        }
    }
}

/// A named tensor with little-endian element data
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    /// Tensor name/identifier
    pub name: String,
    /// Shape dimensions
    pub shape: Vec<usize>,
    /// Data type
    pub dtype: DataType,
    /// Raw tensor data
    pub data: Vec<u8>,
}

impl Tensor {
    /// Build an f32 tensor from values
    pub fn from_f32(name: impl Into<String>, shape: Vec<usize>, values: &[f32]) -> Self {
        let data = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self {
            name: name.into(),
            shape,
            dtype: DataType::Float32,
            data,
        }
    }

    /// An f32 tensor filled with zeros, or `None` if the shape overflows
    pub fn zeros(name: impl Into<String>, shape: Vec<usize>) -> Option<Self> {
        let len = DataType::Float32.byte_len(&shape)?;
        Some(Self {
            name: name.into(),
            shape,
            dtype: DataType::Float32,
            data: vec![0; len],
        })
    }

    /// Number of elements described by the shape
    pub fn num_elements(&self) -> usize {
        self.shape.iter().product()
    }

    /// Check that the data length matches shape and dtype
    pub fn is_consistent(&self) -> bool {
        self.dtype.byte_len(&self.shape) == Some(self.data.len())
    }

    /// Decode float data to f32 values
    ///
    /// Returns `None` for non-float tensors or when the data length does not
    /// match the shape.
    pub fn to_f32_vec(&self) -> Option<Vec<f32>> {
        if !self.dtype.is_float() || !self.is_consistent() {
            return None;
        }

        let size = self.dtype.element_size();
        let values = self
            .data
            .chunks_exact(size)
            .map(|c| match self.dtype {
                DataType::Float32 => f32::from_le_bytes([c[0], c[1], c[2], c[3]]),
                DataType::Float16 => half::f16::from_le_bytes([c[0], c[1]]).to_f32(),
                DataType::BFloat16 => half::bf16::from_le_bytes([c[0], c[1]]).to_f32(),
                DataType::Float64 => f64::from_le_bytes([
                    c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7],
                ]) as f32,
                _ => unreachable!("checked is_float above"),
            })
            .collect();

        Some(values)
    }

    /// Lightweight metadata view
    pub fn info(&self) -> TensorInfo {
        TensorInfo {
            name: self.name.clone(),
            shape: self.shape.clone(),
            dtype: self.dtype,
            size: self.data.len(),
        }
    }
}

/// Lightweight tensor metadata (no data)
#[derive(Debug, Clone, PartialEq)]
pub struct TensorInfo {
    pub name: String,
    pub shape: Vec<usize>,
    pub dtype: DataType,
    pub size: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_element_size() {
        assert_eq!(DataType::Float32.element_size(), 4);
        assert_eq!(DataType::BFloat16.element_size(), 2);
        assert_eq!(DataType::Int64.element_size(), 8);
        assert_eq!(DataType::Bool.element_size(), 1);
    }

    #[test]
    fn test_from_f32_roundtrip() {
        let tensor = Tensor::from_f32("w", vec![2, 2], &[1.0, -2.0, 0.5, 3.25]);
        assert!(tensor.is_consistent());
        assert_eq!(tensor.to_f32_vec().unwrap(), vec![1.0, -2.0, 0.5, 3.25]);
    }

    #[test]
    fn test_half_precision_decodes() {
        let data: Vec<u8> = [1.5f32, -4.0]
            .iter()
            .flat_map(|v| half::f16::from_f32(*v).to_le_bytes())
            .collect();
        let tensor = Tensor {
            name: "h".into(),
            shape: vec![2],
            dtype: DataType::Float16,
            data,
        };
        assert_eq!(tensor.to_f32_vec().unwrap(), vec![1.5, -4.0]);
    }

    #[test]
    fn test_integer_tensor_not_decoded() {
        let tensor = Tensor {
            name: "steps".into(),
            shape: vec![1],
            dtype: DataType::Int64,
            data: 7i64.to_le_bytes().to_vec(),
        };
        assert!(tensor.to_f32_vec().is_none());
    }

    #[test]
    fn test_inconsistent_length_not_decoded() {
        let tensor = Tensor {
            name: "bad".into(),
            shape: vec![3],
            dtype: DataType::Float32,
            data: vec![0; 8],
        };
        assert!(!tensor.is_consistent());
        assert!(tensor.to_f32_vec().is_none());
    }

    #[test]
    fn test_zeros() {
        let tensor = Tensor::zeros("b", vec![4]).unwrap();
        assert_eq!(tensor.data.len(), 16);
        assert!(tensor.to_f32_vec().unwrap().iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_overflowing_shape() {
        let shape = vec![usize::MAX / 2, 3];
        assert_eq!(DataType::Float32.byte_len(&shape), None);
        assert!(Tensor::zeros("huge", shape.clone()).is_none());

        let tensor = Tensor {
            name: "huge".into(),
            shape,
            dtype: DataType::Float32,
            data: Vec::new(),
        };
        assert!(!tensor.is_consistent());
    }
}
