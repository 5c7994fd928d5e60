//! Precision and dtype policy utilities used throughout the decoder crates.
//!
//! Parameters may reside in `f16`/`bf16` while projections and activations
//! promote tensors to `f32`. [`PrecisionPolicy`] lets callers cast
//! consistently before a matmul and back to storage afterwards.

use candle_core::{DType, Result, Tensor};

/// Describes how tensors should be cast during different phases of a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrecisionPolicy {
    storage: DType,
    compute: DType,
}

impl PrecisionPolicy {
    /// Constructs a new policy from explicit dtype selections.
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

    /// Returns the dtype used to store parameters and outputs.
    pub fn storage(&self) -> DType {
        self.storage
    }

    /// Returns the dtype used for matmuls and activation evaluation.
    pub fn compute(&self) -> DType {
        self.compute
    }

    /// Casts a tensor to the compute dtype for matmul readiness.
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

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn policy_promotes_reduced_precision_parameters() {
        let policy = PrecisionPolicy::from_parameter_dtype(DType::BF16);
        assert_eq!(policy.storage(), DType::BF16);
        assert_eq!(policy.compute(), DType::F32);
    }

    #[test]
    fn casts_round_trip_through_storage() -> Result<()> {
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F32);
        assert_eq!(policy.compute(), policy.storage());
        let tensor = Tensor::new(&[0.5f32, -1.5], &Device::Cpu)?;
        let cast = policy.cast_for_matmul(&tensor)?;
        assert_eq!(cast.dtype(), DType::F32);
        let half = PrecisionPolicy::from_parameter_dtype(DType::F16);
        assert_eq!(half.cast_to_storage(&cast)?.dtype(), DType::F16);
        Ok(())
    }
}
