//! Precision policy shared by projections and the attention layer.
//!
//! Parameters may live in `f16`/`bf16`, but matmuls, the softmax and the
//! masked score tensor are evaluated in `f32`; `-inf` and very small weights
//! survive that way. [`PrecisionPolicy`] records the storage and compute
//! dtypes so every layer casts at the same points.

use candle_core::{DType, Result, Tensor};

/// Describes how tensors are cast on the way into and out of a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrecisionPolicy {
    storage: DType,
    compute: DType,
}

impl PrecisionPolicy {
    /// Constructs a policy from explicit dtype selections.
    pub fn new(storage: DType, compute: DType) -> Self {
        Self { storage, compute }
    }

    /// Builds a policy from the parameter storage dtype.
    pub fn from_parameter_dtype(storage: DType) -> Self {
        let compute = match storage {
            DType::F16 | DType::BF16 => DType::F32,
            other => other,
        };
        Self::new(storage, compute)
    }

    /// Keeps the storage dtype but forces `f32` compute.
    pub fn force_f32(storage: DType) -> Self {
        let compute = match storage {
            DType::F64 => DType::F64,
            _ => DType::F32,
        };
        Self::new(storage, compute)
    }

    /// Returns the dtype used to store parameters and outputs.
    pub fn storage(&self) -> DType {
        self.storage
    }

    /// Returns the dtype used for matmuls and the softmax.
    pub fn compute(&self) -> DType {
        self.compute
    }

    /// Indicates whether the policy performs mixed precision work.
    pub fn is_mixed_precision(&self) -> bool {
        self.storage != self.compute
    }

    /// Comparison tolerance for values held in the storage dtype.
    pub fn storage_epsilon(&self) -> f32 {
        epsilon_for(self.storage)
    }

    /// Casts a tensor to the compute dtype.
    pub fn cast_for_matmul(&self, tensor: &Tensor) -> Result<Tensor> {
        cast_tensor(tensor, self.compute)
    }

    /// Casts a tensor back to the storage dtype (or leaves it unchanged).
    pub fn cast_to_storage(&self, tensor: &Tensor) -> Result<Tensor> {
        cast_tensor(tensor, self.storage)
    }
}

fn cast_tensor(tensor: &Tensor, dtype: DType) -> Result<Tensor> {
    if tensor.dtype() == dtype {
        Ok(tensor.clone())
    } else {
        tensor.to_dtype(dtype)
    }
}

fn epsilon_for(dtype: DType) -> f32 {
    match dtype {
        DType::BF16 => 2e-2,
        DType::F16 => 5e-3,
        DType::F32 => 1e-5,
        DType::F64 => 1e-7,
        _ => 0.0,
    }
}
