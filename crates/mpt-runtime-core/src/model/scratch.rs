//! Per-call scratch sizing.
//!
//! The forward pass stages its host-side inputs (ALiBi bias, causal mask) in
//! a buffer that is reused across calls and only ever grows. Its size is
//! estimated from a per-token cost measured once by a short calibration
//! pass. The estimate is a heuristic, not a bound; a call that needs
//! more than the estimate simply grows the buffer.
//!
//! Only the staging buffer is sized this way. The backend allocates the
//! intermediate tensors of the forward pass itself, so neither the estimate
//! nor the buffer capacity limits the memory an evaluation uses.

use crate::error::{Result, RuntimeError};
use candle_core::Tensor;

/// Tokens evaluated by the calibration pass.
pub const CALIBRATION_TOKENS: [u32; 4] = [1, 2, 3, 4];

/// Growth factor applied to the per-token estimate of the new tokens.
const TOKEN_MARGIN: f64 = 1.3;

/// Growth factor applied to the whole estimate.
const SAFETY_MARGIN: f64 = 1.1;

/// Byte tally of the intermediate tensors of one forward pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GraphStats {
    tensors: usize,
    bytes: usize,
}

impl GraphStats {
    /// Count one intermediate tensor.
    pub fn record(&mut self, tensor: &Tensor) {
        self.tensors += 1;
        self.bytes += tensor.elem_count() * tensor.dtype().size_in_bytes();
    }

    /// Number of recorded tensors.
    pub fn tensors(&self) -> usize {
        self.tensors
    }

    /// Total recorded bytes.
    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

/// Reusable staging buffer plus the calibrated per-token cost.
#[derive(Debug, Clone, Default)]
pub struct ScratchArena {
    mem_per_token: usize,
    buffer: Vec<f32>,
}

impl ScratchArena {
    /// Empty, uncalibrated arena.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the per-token cost has been measured.
    pub fn is_calibrated(&self) -> bool {
        self.mem_per_token > 0
    }

    /// Measured bytes per token, 0 before calibration.
    pub fn mem_per_token(&self) -> usize {
        self.mem_per_token
    }

    /// Record the per-token cost from a calibration pass. Only the first call counts.
    pub fn calibrate(&mut self, bytes_used: usize, n_tokens: usize) {
        if self.is_calibrated() || n_tokens == 0 {
            return;
        }
        self.mem_per_token = (bytes_used / n_tokens).max(1);
    }

    /// Byte estimate for a call over `n_tokens` new tokens after `n_past`.
    ///
    /// Sizes the host staging buffer only. Backend intermediates are
    /// allocated outside this arena and are not bounded by the estimate.
    pub fn estimate(&self, n_past: usize, n_tokens: usize) -> usize {
        let per_token = self.mem_per_token as f64;
        let estimate = SAFETY_MARGIN * (per_token * TOKEN_MARGIN * n_tokens as f64) + per_token * n_past as f64;
        estimate as usize
    }

    /// Make sure the staging buffer holds at least `required` bytes, and the
    /// calibrated estimate once available.
    pub fn plan(&mut self, n_past: usize, n_tokens: usize, required: usize) -> Result<()> {
        let target = if self.is_calibrated() {
            self.estimate(n_past, n_tokens).max(required)
        } else {
            required
        };
        let floats = target.div_ceil(std::mem::size_of::<f32>());
        if floats <= self.buffer.capacity() {
            return Ok(());
        }

        self.buffer.clear();
        self.buffer.try_reserve_exact(floats).map_err(|e| {
            RuntimeError::AllocationFailure(format!("scratch buffer of {target} bytes: {e}"))
        })?;
        tracing::debug!(bytes = target, n_past, n_tokens, "grew scratch buffer");
        Ok(())
    }

    /// Staging buffer for host-side graph inputs.
    pub fn staging(&mut self) -> &mut Vec<f32> {
        &mut self.buffer
    }

    /// Capacity of the staging buffer in bytes.
    pub fn capacity_bytes(&self) -> usize {
        self.buffer.capacity() * std::mem::size_of::<f32>()
    }
}

/// Calibration tokens that fit a model with `n_vocab` entries and `n_ctx` positions.
pub fn calibration_tokens(n_vocab: usize, n_ctx: usize) -> Vec<u32> {
    CALIBRATION_TOKENS
        .iter()
        .take(n_ctx)
        .map(|&t| (t as usize % n_vocab) as u32)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn stats_count_bytes() {
        let mut stats = GraphStats::default();
        stats.record(&Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap());
        stats.record(&Tensor::zeros(4, DType::F16, &Device::Cpu).unwrap());
        assert_eq!(stats.tensors(), 2);
        assert_eq!(stats.bytes(), 24 + 8);
    }

    #[test]
    fn uncalibrated_plan_is_exact() {
        let mut scratch = ScratchArena::new();
        scratch.plan(0, 4, 64).unwrap();
        assert!(scratch.capacity_bytes() >= 64);
        assert!(!scratch.is_calibrated());
    }

    #[test]
    fn calibrated_estimate_applies_margins() {
        let mut scratch = ScratchArena::new();
        scratch.calibrate(4000, 4);
        assert_eq!(scratch.mem_per_token(), 1000);

        // 1.1 * (1000 * 1.3 * 10) + 1000 * 5
        assert_eq!(scratch.estimate(5, 10), 14300 + 5000);

        scratch.plan(5, 10, 16).unwrap();
        assert!(scratch.capacity_bytes() >= 19300);
    }

    #[test]
    fn calibration_happens_once() {
        let mut scratch = ScratchArena::new();
        scratch.calibrate(0, 0);
        assert!(!scratch.is_calibrated());
        scratch.calibrate(400, 4);
        scratch.calibrate(8000, 4);
        assert_eq!(scratch.mem_per_token(), 100);
    }

    #[test]
    fn buffer_never_shrinks() {
        let mut scratch = ScratchArena::new();
        scratch.plan(0, 1, 4096).unwrap();
        let grown = scratch.capacity_bytes();
        scratch.plan(0, 1, 16).unwrap();
        assert_eq!(scratch.capacity_bytes(), grown);
    }

    #[test]
    fn calibration_tokens_fit_tiny_models() {
        assert_eq!(calibration_tokens(50432, 2048), vec![1, 2, 3, 4]);
        assert_eq!(calibration_tokens(3, 2), vec![1, 2]);
        assert_eq!(calibration_tokens(2, 8), vec![1, 0, 1, 0]);
    }
}
