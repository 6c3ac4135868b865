//! Dtype handling for the encoder stack.
//!
//! Half-precision parameters are promoted to `f32` for matmuls. Norm
//! statistics and the history weighted sum reduce in `f32` (or `f64` when the
//! parameters are already `f64`).

use candle_core::{DType, Result, Tensor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrecisionPolicy {
    storage: DType,
    compute: DType,
    reduction: DType,
}

impl PrecisionPolicy {
    pub fn new(storage: DType, compute: DType, reduction: DType) -> Self {
        Self {
            storage,
            compute,
            reduction,
        }
    }

    /// Policy for parameters stored as `storage`.
    pub fn from_parameter_dtype(storage: DType) -> Self {
        match storage {
            DType::F16 | DType::BF16 => Self::new(storage, DType::F32, DType::F32),
            DType::F64 => Self::new(storage, DType::F64, DType::F64),
            other => Self::new(other, other, DType::F32),
        }
    }

    /// Same policy with intermediate results kept in the compute dtype, for
    /// tensors that never leave a layer (attention probabilities).
    pub fn internal(&self) -> Self {
        Self::new(self.compute, self.compute, self.reduction)
    }

    pub fn storage(&self) -> DType {
        self.storage
    }

    pub fn compute(&self) -> DType {
        self.compute
    }

    pub fn reduction(&self) -> DType {
        self.reduction
    }

    pub fn cast_for_matmul(&self, tensor: &Tensor) -> Result<Tensor> {
        cast(tensor, self.compute)
    }

    pub fn cast_for_reduction(&self, tensor: &Tensor) -> Result<Tensor> {
        cast(tensor, self.reduction)
    }

    pub fn cast_to_storage(&self, tensor: &Tensor) -> Result<Tensor> {
        cast(tensor, self.storage)
    }
}

fn cast(tensor: &Tensor, dtype: DType) -> Result<Tensor> {
    if tensor.dtype() == dtype {
        Ok(tensor.clone())
    } else {
        tensor.to_dtype(dtype)
    }
}
