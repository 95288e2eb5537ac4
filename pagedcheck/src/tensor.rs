//! Host tensor implementation.

use std::sync::Arc;

use half::f16;

use crate::dtype::DType;

/// A host-resident tensor backed by shared byte storage.
///
/// Uses `Arc<Vec<u8>>` so clones and `slice_view` are cheap (shared
/// backing). Data is always contiguous and row-major; a `reshape` is an
/// explicit reinterpretation of the same buffer under asserted size
/// equality, never a reflow.
#[derive(Clone)]
pub struct HostTensor {
    data: Arc<Vec<u8>>,
    offset: usize,
    shape: Vec<usize>,
    dtype: DType,
}

impl HostTensor {
    /// Create a tensor from an f32 slice.
    #[must_use]
    pub fn from_f32(shape: &[usize], data: &[f32]) -> Self {
        let numel: usize = shape.iter().product();
        assert_eq!(
            data.len(),
            numel,
            "data len {} != shape product {numel}",
            data.len()
        );
        Self {
            data: Arc::new(bytemuck::cast_slice(data).to_vec()),
            offset: 0,
            shape: shape.to_vec(),
            dtype: DType::F32,
        }
    }

    /// Create a tensor from an f16 slice.
    #[must_use]
    pub fn from_f16(shape: &[usize], data: &[f16]) -> Self {
        let numel: usize = shape.iter().product();
        assert_eq!(data.len(), numel);
        Self {
            data: Arc::new(bytemuck::cast_slice(data).to_vec()),
            offset: 0,
            shape: shape.to_vec(),
            dtype: DType::F16,
        }
    }

    /// Create an f16 tensor by rounding f32 values.
    #[must_use]
    pub fn from_f32_as_f16(shape: &[usize], data: &[f32]) -> Self {
        let halves: Vec<f16> = data.iter().map(|&v| f16::from_f32(v)).collect();
        Self::from_f16(shape, &halves)
    }

    /// Create a tensor from an i32 slice.
    #[must_use]
    pub fn from_i32(shape: &[usize], data: &[i32]) -> Self {
        let numel: usize = shape.iter().product();
        assert_eq!(data.len(), numel);
        Self {
            data: Arc::new(bytemuck::cast_slice(data).to_vec()),
            offset: 0,
            shape: shape.to_vec(),
            dtype: DType::I32,
        }
    }

    /// Create a zero-filled tensor of the given dtype.
    #[must_use]
    pub fn zeros(shape: &[usize], dtype: DType) -> Self {
        let numel: usize = shape.iter().product();
        Self {
            data: Arc::new(vec![0u8; numel * dtype.size_in_bytes()]),
            offset: 0,
            shape: shape.to_vec(),
            dtype,
        }
    }

    /// Returns the shape of the tensor.
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Returns the data type of tensor elements.
    #[must_use]
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Returns the total number of elements in the tensor.
    #[must_use]
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    /// Returns the number of dimensions (rank) of the tensor.
    #[must_use]
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Returns the row-major stride for each dimension.
    #[must_use]
    pub fn strides(&self) -> Vec<usize> {
        let mut strides = vec![1; self.shape.len()];
        for i in (0..self.shape.len().saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * self.shape[i + 1];
        }
        strides
    }

    /// Returns the size of the tensor data in bytes.
    #[must_use]
    pub fn size_in_bytes(&self) -> usize {
        self.numel() * self.dtype.size_in_bytes()
    }

    /// Create a view with a different shape (same data, same element count).
    ///
    /// # Panics
    /// Panics if the new shape has a different number of elements.
    #[must_use]
    pub fn reshape(&self, shape: &[usize]) -> Self {
        let new_numel: usize = shape.iter().product();
        assert_eq!(
            self.numel(),
            new_numel,
            "reshape: {} elements != {new_numel} elements",
            self.numel()
        );
        Self {
            data: Arc::clone(&self.data),
            offset: self.offset,
            shape: shape.to_vec(),
            dtype: self.dtype,
        }
    }

    /// Create a zero-copy sub-slice view starting at element `offset` with
    /// the given `shape`.
    ///
    /// # Panics
    /// Panics if the view extends beyond the backing allocation.
    #[must_use]
    pub fn slice_view(&self, offset: usize, shape: &[usize]) -> Self {
        let elem_size = self.dtype.size_in_bytes();
        let byte_offset = self.offset + offset * elem_size;
        let new_numel: usize = shape.iter().product();
        assert!(
            byte_offset + new_numel * elem_size <= self.data.len(),
            "slice_view out of bounds"
        );
        Self {
            data: Arc::clone(&self.data),
            offset: byte_offset,
            shape: shape.to_vec(),
            dtype: self.dtype,
        }
    }

    /// Get the data as an f32 slice.
    ///
    /// # Panics
    /// Panics if dtype is not F32.
    #[must_use]
    pub fn as_f32_slice(&self) -> &[f32] {
        assert_eq!(self.dtype, DType::F32, "expected F32 tensor");
        let start = self.offset;
        let end = start + self.numel() * 4;
        bytemuck::cast_slice(&self.data[start..end])
    }

    /// Get the data as an f16 slice.
    ///
    /// # Panics
    /// Panics if dtype is not F16.
    #[must_use]
    pub fn as_f16_slice(&self) -> &[f16] {
        assert_eq!(self.dtype, DType::F16, "expected F16 tensor");
        let start = self.offset;
        let end = start + self.numel() * 2;
        bytemuck::cast_slice(&self.data[start..end])
    }

    /// Get the data as an i32 slice.
    ///
    /// # Panics
    /// Panics if dtype is not I32.
    #[must_use]
    pub fn as_i32_slice(&self) -> &[i32] {
        assert_eq!(self.dtype, DType::I32, "expected I32 tensor");
        let start = self.offset;
        let end = start + self.numel() * 4;
        bytemuck::cast_slice(&self.data[start..end])
    }

    /// Get the raw bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        let start = self.offset;
        let end = start + self.size_in_bytes();
        &self.data[start..end]
    }

    /// Convert to an f32 Vec, casting from f16 if necessary.
    ///
    /// # Panics
    /// Panics if dtype is I32.
    #[must_use]
    pub fn to_f32_vec(&self) -> Vec<f32> {
        match self.dtype {
            DType::F32 => self.as_f32_slice().to_vec(),
            DType::F16 => self.as_f16_slice().iter().map(|v| v.to_f32()).collect(),
            DType::I32 => panic!("to_f32_vec: unsupported dtype i32"),
        }
    }
}

impl std::fmt::Debug for HostTensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostTensor")
            .field("shape", &self.shape)
            .field("dtype", &self.dtype)
            .finish_non_exhaustive()
    }
}
