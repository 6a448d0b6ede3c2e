//! Layer normalization without bias.
//!
//! # Formula
//!
//! `LayerNorm(x) = (x - mean(x)) / sqrt(var(x) + eps) * weight`

use crate::error::{Result, RuntimeError};
use candle_core::{DType, Device, Tensor, D};

/// Epsilon used by every norm in the model.
pub const LAYER_NORM_EPS: f64 = 1e-5;

/// Layer normalization over the last axis, scale only.
#[derive(Debug, Clone)]
pub struct LayerNorm {
    /// Learnable scale parameter.
    weight: Tensor,
    /// Small constant for numerical stability.
    eps: f64,
}

impl LayerNorm {
    /// Create a norm with the given weight.
    pub fn new(weight: Tensor, eps: f64) -> Result<Self> {
        if weight.rank() != 1 {
            return Err(RuntimeError::ShapeMismatch(format!(
                "norm weight must be a vector, got {:?}",
                weight.dims()
            )));
        }
        Ok(Self { weight, eps })
    }

    /// Create a norm with unit weight (for testing).
    pub fn ones(hidden_size: usize, device: &Device) -> Result<Self> {
        let weight = Tensor::ones(hidden_size, DType::F32, device)?;
        Ok(Self {
            weight,
            eps: LAYER_NORM_EPS,
        })
    }

    /// Forward pass over `[..., hidden_size]`.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mean = x.mean_keepdim(D::Minus1)?;
        let centered = x.broadcast_sub(&mean)?;
        let var = centered.sqr()?.mean_keepdim(D::Minus1)?;
        let rstd = (var + self.eps)?.sqrt()?.recip()?;

        let normalized = centered.broadcast_mul(&rstd)?;
        Ok(normalized.broadcast_mul(&self.weight)?)
    }

    /// Hidden size.
    pub fn hidden_size(&self) -> usize {
        self.weight.dims()[0]
    }

    /// Epsilon value.
    pub fn eps(&self) -> f64 {
        self.eps
    }
}
