//! MPT decoder block.
//!
//! A single block combining:
//! - Pre-attention LayerNorm
//! - Fused QKV projection with optional clamping
//! - Multi-head attention over the KV cache with ALiBi bias
//! - Pre-feed-forward LayerNorm
//! - GELU feed-forward

use super::{GraphStats, KvCache, LayerNorm, Linear};
use crate::error::Result;
use candle_core::{DType, Tensor};
use half::f16;

/// Self-attention with a fused query/key/value projection.
#[derive(Debug, Clone)]
pub struct MptAttention {
    /// Fused projection: [3 * n_embd, n_embd]
    wqkv: Linear,
    /// Output projection: [n_embd, n_embd]
    out_proj: Linear,
    n_head: usize,
    head_dim: usize,
    /// Clamp bound for QKV activations; 0 disables.
    clip_qkv: f32,
}

impl MptAttention {
    /// Create attention from its projections.
    pub fn new(wqkv: Linear, out_proj: Linear, n_head: usize, head_dim: usize, clip_qkv: f32) -> Self {
        Self {
            wqkv,
            out_proj,
            n_head,
            head_dim,
            clip_qkv,
        }
    }

    fn n_embd(&self) -> usize {
        self.n_head * self.head_dim
    }

    /// Project `[n, n_embd]` into query, key and value, each `[n, n_embd]`.
    pub fn project(&self, x: &Tensor, stats: &mut GraphStats) -> Result<(Tensor, Tensor, Tensor)> {
        let mut qkv = self.wqkv.forward(x)?;
        stats.record(&qkv);
        if self.clip_qkv > 0.0 {
            qkv = qkv.clamp(-self.clip_qkv, self.clip_qkv)?;
            stats.record(&qkv);
        }

        let n_embd = self.n_embd();
        let q = qkv.narrow(1, 0, n_embd)?;
        let k = qkv.narrow(1, n_embd, n_embd)?;
        let v = qkv.narrow(1, 2 * n_embd, n_embd)?;
        Ok((q, k, v))
    }

    /// Attend `q` (`[n, n_embd]`) over `k`/`v` (`[n_kv, n_embd]`).
    ///
    /// `bias` is `[n_head, n, n_kv]` and already contains the causal mask.
    pub fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        bias: &Tensor,
        stats: &mut GraphStats,
    ) -> Result<Tensor> {
        let n = q.dims()[0];
        let n_kv = k.dims()[0];
        let scale = 1.0 / (self.head_dim as f64).sqrt();

        // [seq, n_embd] -> [n_head, seq, head_dim]
        let q = q.reshape((n, self.n_head, self.head_dim))?.transpose(0, 1)?.contiguous()?;
        let k = k.reshape((n_kv, self.n_head, self.head_dim))?.transpose(0, 1)?.contiguous()?;
        let v = v.reshape((n_kv, self.n_head, self.head_dim))?.transpose(0, 1)?.contiguous()?;

        let scores = (q.matmul(&k.t()?)? * scale)?;
        stats.record(&scores);
        let scores = scores.broadcast_add(bias)?;
        stats.record(&scores);

        let weights = candle_nn::ops::softmax_last_dim(&scores)?;
        stats.record(&weights);

        let out = weights.matmul(&v)?;
        stats.record(&out);

        // [n_head, n, head_dim] -> [n, n_embd]
        let out = out.transpose(0, 1)?.contiguous()?.reshape((n, self.n_embd()))?;
        let out = self.out_proj.forward(&out)?;
        stats.record(&out);
        Ok(out)
    }
}

/// GELU feed-forward: up projection, GELU, down projection.
#[derive(Debug, Clone)]
pub struct MptFeedForward {
    up_proj: Linear,
    down_proj: Linear,
}

impl MptFeedForward {
    /// Create from projections.
    pub fn new(up_proj: Linear, down_proj: Linear) -> Self {
        Self { up_proj, down_proj }
    }

    /// Forward pass over `[n, n_embd]`.
    pub fn forward(&self, x: &Tensor, stats: &mut GraphStats) -> Result<Tensor> {
        let hidden = self.up_proj.forward(x)?;
        stats.record(&hidden);
        let hidden = hidden.gelu()?;
        stats.record(&hidden);
        let out = self.down_proj.forward(&hidden)?;
        stats.record(&out);
        Ok(out)
    }
}

/// One decoder block.
#[derive(Debug, Clone)]
pub struct MptBlock {
    norm_1: LayerNorm,
    attention: MptAttention,
    norm_2: LayerNorm,
    ffn: MptFeedForward,
    layer_idx: usize,
}

impl MptBlock {
    /// Create a block.
    pub fn new(
        norm_1: LayerNorm,
        attention: MptAttention,
        norm_2: LayerNorm,
        ffn: MptFeedForward,
        layer_idx: usize,
    ) -> Self {
        Self {
            norm_1,
            attention,
            norm_2,
            ffn,
            layer_idx,
        }
    }

    /// Forward pass with KV cache for autoregressive generation.
    ///
    /// Stores this call's keys and values at positions `[n_past, n_past + n)`
    /// of the block's cache layer, then attends over `[0, n_past + n)`.
    ///
    /// # Arguments
    ///
    /// * `x` - Hidden states [n, n_embd]
    /// * `cache` - Session KV cache
    /// * `n_past` - Positions already evaluated
    /// * `bias` - ALiBi bias plus causal mask [n_head, n, n_past + n]
    pub fn forward(
        &self,
        x: &Tensor,
        cache: &mut KvCache,
        n_past: usize,
        bias: &Tensor,
        stats: &mut GraphStats,
    ) -> Result<Tensor> {
        let n = x.dims()[0];
        let n_embd = x.dims()[1];
        let device = x.device();

        let normed = self.norm_1.forward(x)?;
        stats.record(&normed);

        let (q, k, v) = self.attention.project(&normed, stats)?;

        let new_keys = to_halves(&k)?;
        let new_values = to_halves(&v)?;
        cache.write(self.layer_idx, n_past, &new_keys, &new_values)?;

        let n_kv = n_past + n;
        let keys = Tensor::from_slice(cache.read_keys(self.layer_idx, n_kv)?, (n_kv, n_embd), device)?
            .to_dtype(DType::F32)?;
        let values = Tensor::from_slice(cache.read_values(self.layer_idx, n_kv)?, (n_kv, n_embd), device)?
            .to_dtype(DType::F32)?;
        stats.record(&keys);
        stats.record(&values);

        let attn_output = self.attention.attend(&q, &keys, &values, bias, stats)?;

        // Residual connection
        let hidden_states = (x + attn_output)?;

        let normed = self.norm_2.forward(&hidden_states)?;
        stats.record(&normed);
        let ffn_output = self.ffn.forward(&normed, stats)?;

        // Residual connection
        let output = (hidden_states + ffn_output)?;
        stats.record(&output);
        Ok(output)
    }

    /// Layer index.
    pub fn layer_idx(&self) -> usize {
        self.layer_idx
    }
}

fn to_halves(t: &Tensor) -> Result<Vec<f16>> {
    Ok(t.to_dtype(DType::F16)?.flatten_all()?.to_vec1::<f16>()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{attention_bias, causal_mask, slopes, FileType, HyperParams};
    use candle_core::Device;

    fn hparams(n_embd: usize, n_head: usize) -> HyperParams {
        HyperParams {
            n_vocab: 8,
            n_ctx: 16,
            n_embd,
            n_head,
            n_layer: 1,
            alibi_bias_max: 8.0,
            clip_qkv: 0.0,
            ftype: FileType::AllF32,
            expand: 4,
        }
    }

    fn random_linear(n_out: usize, n_in: usize) -> Linear {
        Linear::dense(Tensor::randn(0.0f32, 0.2, (n_out, n_in), &Device::Cpu).unwrap())
    }

    fn random_block(hp: &HyperParams, clip_qkv: f32) -> MptBlock {
        let e = hp.n_embd;
        MptBlock::new(
            LayerNorm::ones(e, &Device::Cpu).unwrap(),
            MptAttention::new(random_linear(3 * e, e), random_linear(e, e), hp.n_head, hp.head_dim(), clip_qkv),
            LayerNorm::ones(e, &Device::Cpu).unwrap(),
            MptFeedForward::new(random_linear(hp.ffn_dim(), e), random_linear(e, hp.ffn_dim())),
            0,
        )
    }

    fn bias(hp: &HyperParams, n_past: usize, n: usize) -> Tensor {
        let s = slopes(hp.n_head, hp.alibi_bias_max);
        let bias = attention_bias(&s, n_past, n, &mut Vec::new(), &Device::Cpu).unwrap();
        let mask = causal_mask(n_past, n, &mut Vec::new(), &Device::Cpu).unwrap();
        bias.broadcast_add(&mask).unwrap()
    }

    #[test]
    fn block_forward_shape() {
        let hp = hparams(16, 4);
        let block = random_block(&hp, 0.0);
        let mut cache = KvCache::new(&hp).unwrap();
        let mut stats = GraphStats::default();

        let x = Tensor::randn(0.0f32, 1.0, (5, 16), &Device::Cpu).unwrap();
        let out = block.forward(&x, &mut cache, 0, &bias(&hp, 0, 5), &mut stats).unwrap();
        assert_eq!(out.dims(), &[5, 16]);
        assert!(stats.bytes() > 0);
    }

    #[test]
    fn incremental_matches_batch() {
        let hp = hparams(16, 2);
        let block = random_block(&hp, 0.0);
        let x = Tensor::randn(0.0f32, 1.0, (4, 16), &Device::Cpu).unwrap();

        let mut batch_cache = KvCache::new(&hp).unwrap();
        let batch = block
            .forward(&x, &mut batch_cache, 0, &bias(&hp, 0, 4), &mut GraphStats::default())
            .unwrap();
        let batch_last: Vec<f32> = batch.get(3).unwrap().to_vec1().unwrap();

        let mut cache = KvCache::new(&hp).unwrap();
        block
            .forward(&x.narrow(0, 0, 3).unwrap(), &mut cache, 0, &bias(&hp, 0, 3), &mut GraphStats::default())
            .unwrap();
        let step = block
            .forward(&x.narrow(0, 3, 1).unwrap(), &mut cache, 3, &bias(&hp, 3, 1), &mut GraphStats::default())
            .unwrap();
        let step_last: Vec<f32> = step.get(0).unwrap().to_vec1().unwrap();

        for (a, b) in batch_last.iter().zip(&step_last) {
            assert!((a - b).abs() < 1e-4, "{a} vs {b}");
        }
    }

    #[test]
    fn clipping_bounds_projections() {
        let hp = hparams(8, 1);
        let e = hp.n_embd;
        let wqkv = Linear::dense((Tensor::ones((3 * e, e), DType::F32, &Device::Cpu).unwrap() * 10.0).unwrap());
        let attn = MptAttention::new(wqkv, random_linear(e, e), 1, e, 0.5);

        let x = Tensor::ones((2, e), DType::F32, &Device::Cpu).unwrap();
        let (q, k, v) = attn.project(&x, &mut GraphStats::default()).unwrap();
        for t in [q, k, v] {
            let vals: Vec<f32> = t.flatten_all().unwrap().to_vec1().unwrap();
            assert!(vals.iter().all(|v| *v == 0.5));
        }
    }

    #[test]
    fn cache_receives_new_keys() {
        let hp = hparams(8, 2);
        let block = random_block(&hp, 0.0);
        let mut cache = KvCache::new(&hp).unwrap();
        let x = Tensor::randn(0.0f32, 1.0, (2, 8), &Device::Cpu).unwrap();
        block
            .forward(&x, &mut cache, 5, &bias(&hp, 5, 2), &mut GraphStats::default())
            .unwrap();

        let keys = cache.read_keys(0, 7).unwrap();
        assert!(keys[..5 * 8].iter().all(|v| *v == f16::ZERO));
        assert!(keys[5 * 8..].iter().any(|v| *v != f16::ZERO));
    }
}
