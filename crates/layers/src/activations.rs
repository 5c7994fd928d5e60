//! Activation catalogue for attention scoring, gates, and output projections.
//!
//! Activations keep the input layout. Each implementation promotes inputs to
//! the compute dtype requested by [`PrecisionPolicy`] before evaluating the
//! non-linearity, then casts the result back to the storage dtype so callers
//! can chain additional mixed-precision aware operations.
//!
//! # Built-in formulas
//!
//! * **Tanh** squashes alignment energies and the final decoder output.
//! * **ReLU** replaces tanh in the rectified additive scorer.
//! * **Sigmoid** computes `1 / (1 + exp(-x))` from `exp` and `recip` and
//!   drives window-centre prediction and the hybrid gate.

use std::sync::Arc;

use candle_core::{Result, Tensor};

use crate::dtypes::PrecisionPolicy;

/// Identifies which non-linearity is implemented by an [`Activation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationKind {
    /// Hyperbolic tangent.
    Tanh,
    /// Rectified linear unit.
    Relu,
    /// Logistic sigmoid.
    Sigmoid,
}

/// Common interface shared by activation functions.
pub trait Activation: Send + Sync {
    /// Applies the activation to `input` using the precision rules in `policy`.
    fn forward(&self, input: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor>;
}

/// Built-in activation backed by Candle kernels.
struct BuiltinActivation {
    kind: ActivationKind,
}

impl Activation for BuiltinActivation {
    fn forward(&self, input: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        let compute = policy.cast_for_matmul(input)?;
        let activated = match self.kind {
            ActivationKind::Tanh => compute.tanh()?,
            ActivationKind::Relu => compute.relu()?,
            ActivationKind::Sigmoid => sigmoid(&compute)?,
        };
        policy.cast_to_storage(&activated)
    }
}

/// Returns a shared built-in activation implementation.
pub fn builtin(kind: ActivationKind) -> Arc<dyn Activation> {
    Arc::new(BuiltinActivation { kind })
}

/// Logistic sigmoid composed from differentiable primitives.
pub fn sigmoid(input: &Tensor) -> Result<Tensor> {
    let denom = input.neg()?.exp()?.affine(1.0, 1.0)?;
    denom.recip()
}
