//! Key/value cache for incremental decoding.
//!
//! Two flat half-precision buffers, one for keys and one for values, laid out
//! as `[layer][position][n_embd]`. Position `p` of layer `l` starts at
//! `(l * n_ctx + p) * n_embd`. Slots beyond the session's `n_past` hold stale
//! data and are never read.

use super::HyperParams;
use crate::error::{Result, RuntimeError};
use half::f16;

/// Per-session key/value storage.
#[derive(Debug, Clone)]
pub struct KvCache {
    keys: Vec<f16>,
    values: Vec<f16>,
    n_layer: usize,
    n_ctx: usize,
    n_embd: usize,
}

impl KvCache {
    /// Allocate a zero-filled cache sized for `hparams`.
    pub fn new(hparams: &HyperParams) -> Result<Self> {
        let n_elements = elements_for(hparams)?;

        Ok(Self {
            keys: zeroed(n_elements, "key")?,
            values: zeroed(n_elements, "value")?,
            n_layer: hparams.n_layer,
            n_ctx: hparams.n_ctx,
            n_embd: hparams.n_embd,
        })
    }

    /// Bytes a cache for `hparams` would take, keys and values together.
    pub fn required_bytes(hparams: &HyperParams) -> Result<usize> {
        elements_for(hparams)?
            .checked_mul(2 * std::mem::size_of::<f16>())
            .ok_or_else(overflow)
    }

    /// Element offset of `position` in `layer`.
    pub fn offset(&self, layer: usize, position: usize) -> usize {
        (layer * self.n_ctx + position) * self.n_embd
    }

    /// Store keys and values for consecutive positions starting at `position`.
    ///
    /// `keys` and `values` hold `n * n_embd` elements for `n` positions.
    pub fn write(&mut self, layer: usize, position: usize, keys: &[f16], values: &[f16]) -> Result<()> {
        if keys.len() != values.len() || keys.len() % self.n_embd != 0 {
            return Err(RuntimeError::ShapeMismatch(format!(
                "kv write of {} keys and {} values with n_embd {}",
                keys.len(),
                values.len(),
                self.n_embd
            )));
        }
        let n_tokens = keys.len() / self.n_embd;
        self.check_range(layer, position + n_tokens, n_tokens)?;

        let start = self.offset(layer, position);
        let end = start + keys.len();
        self.keys[start..end].copy_from_slice(keys);
        self.values[start..end].copy_from_slice(values);
        Ok(())
    }

    /// Keys of positions `[0, up_to)` in `layer`.
    pub fn read_keys(&self, layer: usize, up_to: usize) -> Result<&[f16]> {
        self.check_range(layer, up_to, 0)?;
        let start = self.offset(layer, 0);
        Ok(&self.keys[start..start + up_to * self.n_embd])
    }

    /// Values of positions `[0, up_to)` in `layer`.
    pub fn read_values(&self, layer: usize, up_to: usize) -> Result<&[f16]> {
        self.check_range(layer, up_to, 0)?;
        let start = self.offset(layer, 0);
        Ok(&self.values[start..start + up_to * self.n_embd])
    }

    fn check_range(&self, layer: usize, end: usize, n_tokens: usize) -> Result<()> {
        if layer >= self.n_layer {
            return Err(RuntimeError::ShapeMismatch(format!(
                "layer {layer} out of range for {} layers",
                self.n_layer
            )));
        }
        if end > self.n_ctx {
            return Err(RuntimeError::ContextLimitExceeded {
                n_past: end - n_tokens,
                n_tokens,
                n_ctx: self.n_ctx,
            });
        }
        Ok(())
    }

    /// Size of both buffers in bytes.
    pub fn memory_size(&self) -> usize {
        (self.keys.len() + self.values.len()) * std::mem::size_of::<f16>()
    }

    /// Number of layers.
    pub fn n_layer(&self) -> usize {
        self.n_layer
    }

    /// Positions per layer.
    pub fn n_ctx(&self) -> usize {
        self.n_ctx
    }

    /// Width of one stored row.
    pub fn n_embd(&self) -> usize {
        self.n_embd
    }
}

fn zeroed(n_elements: usize, what: &str) -> Result<Vec<f16>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(n_elements).map_err(|e| {
        RuntimeError::AllocationFailure(format!("{what} cache of {n_elements} elements: {e}"))
    })?;
    buf.resize(n_elements, f16::ZERO);
    Ok(buf)
}

fn elements_for(hparams: &HyperParams) -> Result<usize> {
    hparams
        .n_layer
        .checked_mul(hparams.n_ctx)
        .and_then(|n| n.checked_mul(hparams.n_embd))
        .ok_or_else(overflow)
}

fn overflow() -> RuntimeError {
    RuntimeError::AllocationFailure("kv cache size overflows".into())
}
