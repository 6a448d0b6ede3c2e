//! Projection weights, dense or block-quantized.

use super::{ElementType, TensorSpec};
use crate::error::{Result, RuntimeError};
use candle_core::quantized::{ggml_file, GgmlDType, QMatMul};
use candle_core::{Device, Module, Tensor};
use half::f16;

/// A `(out, in)` weight matrix applied as `x · Wᵀ`.
#[derive(Debug, Clone)]
pub enum Linear {
    /// Dense f32 weights.
    Dense(Tensor),
    /// Block-quantized weights multiplied without dequantizing up front.
    Quantized(QMatMul),
}

impl Linear {
    /// Build from raw container bytes laid out as `spec` describes.
    pub fn from_bytes(spec: &TensorSpec, bytes: &[u8], device: &Device) -> Result<Self> {
        let shape = spec.shape();
        match spec.element_type {
            ElementType::F32 | ElementType::F16 => {
                Ok(Self::Dense(dense_from_bytes(spec, bytes, device)?))
            }
            other => {
                let dtype = ggml_dtype(other)?;
                let qtensor = ggml_file::qtensor_from_ggml(dtype, bytes, shape, device)?;
                Ok(Self::Quantized(QMatMul::from_qtensor(qtensor)?))
            }
        }
    }

    /// Wrap a dense `(out, in)` f32 tensor.
    pub fn dense(weight: Tensor) -> Self {
        Self::Dense(weight)
    }

    /// Forward pass over `[n, in]`.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            Self::Dense(w) => Ok(x.matmul(&w.t()?)?),
            Self::Quantized(q) => Ok(q.forward(x)?),
        }
    }

    /// Whether the weights stay block-quantized.
    pub fn is_quantized(&self) -> bool {
        matches!(self, Self::Quantized(_))
    }
}

/// Decode an F32 or F16 payload into an f32 tensor of the spec's shape.
pub(crate) fn dense_from_bytes(spec: &TensorSpec, bytes: &[u8], device: &Device) -> Result<Tensor> {
    let values: Vec<f32> = match spec.element_type {
        ElementType::F32 => bytemuck::pod_collect_to_vec(bytes),
        ElementType::F16 => bytes
            .chunks_exact(2)
            .map(|c| f16::from_le_bytes([c[0], c[1]]).to_f32())
            .collect(),
        other => {
            return Err(RuntimeError::UnsupportedEncoding(format!(
                "tensor '{}' is {other}, expected f32 or f16",
                spec.name
            )))
        }
    };
    let expected = spec.elements()?;
    if values.len() != expected {
        return Err(RuntimeError::SizeMismatch(format!(
            "tensor '{}' decoded {} elements, expected {}",
            spec.name,
            values.len(),
            expected
        )));
    }
    Ok(Tensor::from_vec(values, spec.shape(), device)?)
}

fn ggml_dtype(element_type: ElementType) -> Result<GgmlDType> {
    let dtype = match element_type {
        ElementType::F32 => GgmlDType::F32,
        ElementType::F16 => GgmlDType::F16,
        ElementType::Q4_0 => GgmlDType::Q4_0,
        ElementType::Q4_1 => GgmlDType::Q4_1,
        ElementType::Q5_0 => GgmlDType::Q5_0,
        ElementType::Q5_1 => GgmlDType::Q5_1,
        ElementType::Q8_0 => GgmlDType::Q8_0,
        ElementType::Q8_1 => GgmlDType::Q8_1,
        ElementType::Q2K => GgmlDType::Q2K,
        ElementType::Q3K => GgmlDType::Q3K,
        ElementType::Q4K => GgmlDType::Q4K,
        ElementType::Q5K => GgmlDType::Q5K,
        ElementType::Q6K => GgmlDType::Q6K,
        ElementType::Q8K => GgmlDType::Q8K,
    };
    Ok(dtype)
}
