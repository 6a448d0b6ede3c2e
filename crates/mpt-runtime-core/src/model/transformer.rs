//! Forward-pass engine.

use super::{
    alibi, GraphStats, HyperParams, KvCache, LayerNorm, MptAttention, MptBlock, MptFeedForward,
    ModelWeights, ScratchArena,
};
use crate::error::{Result, RuntimeError};
use candle_core::{Device, Tensor};
use tracing::debug;

/// A loaded, read-only model. Shared between sessions behind an `Arc`.
#[derive(Debug)]
pub struct Model {
    hparams: HyperParams,
    /// Token embeddings `[n_vocab, n_embd]`; also the tied output projection.
    wte: Tensor,
    blocks: Vec<MptBlock>,
    norm_f: LayerNorm,
    slopes: Vec<f32>,
    device: Device,
}

impl Model {
    /// Assemble a model from materialized weights.
    pub fn new(hparams: HyperParams, weights: ModelWeights, device: Device) -> Result<Self> {
        hparams.validate()?;
        if weights.layers.len() != hparams.n_layer {
            return Err(RuntimeError::ShapeMismatch(format!(
                "{} layers of weights for n_layer {}",
                weights.layers.len(),
                hparams.n_layer
            )));
        }

        let head_dim = hparams.head_dim();
        let blocks = weights
            .layers
            .into_iter()
            .enumerate()
            .map(|(i, layer)| {
                Ok(MptBlock::new(
                    ModelWeights::norm(&layer.norm_1)?,
                    MptAttention::new(
                        layer.attn_qkv,
                        layer.attn_out,
                        hparams.n_head,
                        head_dim,
                        hparams.clip_qkv,
                    ),
                    ModelWeights::norm(&layer.norm_2)?,
                    MptFeedForward::new(layer.ffn_up, layer.ffn_down),
                    i,
                ))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            slopes: alibi::slopes(hparams.n_head, hparams.alibi_bias_max),
            norm_f: ModelWeights::norm(&weights.norm_f)?,
            wte: weights.wte,
            blocks,
            hparams,
            device,
        })
    }

    /// Hyperparameters (with any context override applied).
    pub fn hparams(&self) -> &HyperParams {
        &self.hparams
    }

    /// Vocabulary size.
    pub fn n_vocab(&self) -> usize {
        self.hparams.n_vocab
    }

    /// Context length.
    pub fn n_ctx(&self) -> usize {
        self.hparams.n_ctx
    }

    /// Compute device.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Check an evaluation request without touching any state.
    pub fn check_batch(&self, n_past: usize, tokens: &[u32]) -> Result<()> {
        if tokens.is_empty() {
            return Err(RuntimeError::EmptyBatch);
        }
        if n_past + tokens.len() > self.hparams.n_ctx {
            return Err(RuntimeError::ContextLimitExceeded {
                n_past,
                n_tokens: tokens.len(),
                n_ctx: self.hparams.n_ctx,
            });
        }
        if let Some(&token) = tokens.iter().find(|&&t| t as usize >= self.hparams.n_vocab) {
            return Err(RuntimeError::InvalidToken {
                token,
                n_vocab: self.hparams.n_vocab,
            });
        }
        Ok(())
    }

    /// Run the decoder over `tokens` placed after `n_past` cached positions.
    ///
    /// Writes keys and values for positions `[n_past, n_past + tokens.len())`
    /// into `cache` and replaces `out_scores` with the `n_vocab` scores of the
    /// last token. Does not advance any position counter; the caller owns
    /// `n_past`. Returns the byte tally of the intermediate tensors.
    pub fn evaluate(
        &self,
        cache: &mut KvCache,
        scratch: &mut ScratchArena,
        n_past: usize,
        tokens: &[u32],
        out_scores: &mut Vec<f32>,
    ) -> Result<GraphStats> {
        self.check_batch(n_past, tokens)?;
        if cache.n_ctx() < self.hparams.n_ctx || cache.n_layer() != self.hparams.n_layer {
            return Err(RuntimeError::ShapeMismatch(
                "kv cache does not match the model".into(),
            ));
        }

        let n = tokens.len();
        let n_kv = n_past + n;
        let mut stats = GraphStats::default();

        let required = self.hparams.n_head * n * n_kv * std::mem::size_of::<f32>();
        scratch.plan(n_past, n, required)?;
        let bias = alibi::attention_bias(&self.slopes, n_past, n, scratch.staging(), &self.device)?;
        let mask = alibi::causal_mask(n_past, n, scratch.staging(), &self.device)?;
        let bias = bias.broadcast_add(&mask)?;
        stats.record(&bias);

        let ids = Tensor::from_slice(tokens, n, &self.device)?;
        let mut x = self.wte.index_select(&ids, 0)?;
        stats.record(&x);

        for block in &self.blocks {
            x = block.forward(&x, cache, n_past, &bias, &mut stats)?;
        }

        let x = self.norm_f.forward(&x)?;
        stats.record(&x);

        // only the last position's scores are returned
        let last = x.narrow(0, n - 1, 1)?;
        let logits = last.matmul(&self.wte.t()?)?;
        stats.record(&logits);

        out_scores.clear();
        out_scores.extend(logits.flatten_all()?.to_vec1::<f32>()?);

        debug!(
            n_past,
            n_tokens = n,
            tensors = stats.tensors(),
            bytes = stats.bytes(),
            "evaluated batch"
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FileType, LayerWeights, Linear};
    use candle_core::DType;

    fn hparams(n_vocab: usize, n_embd: usize, n_head: usize, n_layer: usize) -> HyperParams {
        HyperParams {
            n_vocab,
            n_ctx: 8,
            n_embd,
            n_head,
            n_layer,
            alibi_bias_max: 8.0,
            clip_qkv: 0.0,
            ftype: FileType::AllF32,
            expand: 4,
        }
    }

    fn random_model(hp: &HyperParams) -> Model {
        let dev = Device::Cpu;
        let e = hp.n_embd;
        let rand = |rows: usize, cols: usize| Tensor::randn(0.0f32, 0.3, (rows, cols), &dev).unwrap();
        let layers = (0..hp.n_layer)
            .map(|_| LayerWeights {
                norm_1: Tensor::ones(e, DType::F32, &dev).unwrap(),
                norm_2: Tensor::ones(e, DType::F32, &dev).unwrap(),
                attn_qkv: Linear::dense(rand(3 * e, e)),
                attn_out: Linear::dense(rand(e, e)),
                ffn_up: Linear::dense(rand(hp.ffn_dim(), e)),
                ffn_down: Linear::dense(rand(e, hp.ffn_dim())),
            })
            .collect();
        let weights = ModelWeights {
            wte: rand(hp.n_vocab, e),
            norm_f: Tensor::ones(e, DType::F32, &dev).unwrap(),
            layers,
        };
        Model::new(hp.clone(), weights, dev).unwrap()
    }

    #[test]
    fn scores_cover_vocabulary() {
        let hp = hparams(16, 8, 2, 2);
        let model = random_model(&hp);
        let mut cache = KvCache::new(&hp).unwrap();
        let mut scratch = ScratchArena::new();
        let mut scores = vec![0.0; 3];

        let stats = model
            .evaluate(&mut cache, &mut scratch, 0, &[1, 5, 7], &mut scores)
            .unwrap();
        assert_eq!(scores.len(), 16);
        assert!(scores.iter().all(|s| s.is_finite()));
        assert!(stats.bytes() > 0);
    }

    #[test]
    fn incremental_matches_full_prompt() {
        let hp = hparams(16, 8, 2, 2);
        let model = random_model(&hp);

        let mut full = Vec::new();
        let mut cache = KvCache::new(&hp).unwrap();
        model
            .evaluate(&mut cache, &mut ScratchArena::new(), 0, &[3, 1, 4, 1], &mut full)
            .unwrap();

        let mut step = Vec::new();
        let mut cache = KvCache::new(&hp).unwrap();
        let mut scratch = ScratchArena::new();
        model.evaluate(&mut cache, &mut scratch, 0, &[3, 1], &mut step).unwrap();
        model.evaluate(&mut cache, &mut scratch, 2, &[4], &mut step).unwrap();
        model.evaluate(&mut cache, &mut scratch, 3, &[1], &mut step).unwrap();

        for (a, b) in full.iter().zip(&step) {
            assert!((a - b).abs() < 1e-3, "{a} vs {b}");
        }
    }

    #[test]
    fn context_limit_is_checked_first() {
        let hp = hparams(4, 8, 1, 1);
        let model = random_model(&hp);
        let mut cache = KvCache::new(&hp).unwrap();
        let before = cache.read_keys(0, 8).unwrap().to_vec();

        let err = model
            .evaluate(&mut cache, &mut ScratchArena::new(), 7, &[1, 2], &mut Vec::new())
            .unwrap_err();
        assert!(matches!(err, RuntimeError::ContextLimitExceeded { n_past: 7, n_tokens: 2, n_ctx: 8 }));
        assert_eq!(cache.read_keys(0, 8).unwrap(), before.as_slice());
    }

    #[test]
    fn out_of_vocab_token_is_rejected_before_writes() {
        let hp = hparams(4, 8, 1, 1);
        let model = random_model(&hp);
        let mut cache = KvCache::new(&hp).unwrap();

        let err = model
            .evaluate(&mut cache, &mut ScratchArena::new(), 0, &[1, 4], &mut Vec::new())
            .unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidToken { token: 4, n_vocab: 4 }));
        assert!(cache.read_keys(0, 8).unwrap().iter().all(|v| *v == half::f16::ZERO));

        let err = model
            .evaluate(&mut cache, &mut ScratchArena::new(), 0, &[], &mut Vec::new())
            .unwrap_err();
        assert!(matches!(err, RuntimeError::EmptyBatch));
    }

    #[test]
    fn layer_count_must_match() {
        let hp = hparams(4, 8, 1, 2);
        let model = random_model(&hparams(4, 8, 1, 1));
        let weights = ModelWeights {
            wte: model.wte.clone(),
            norm_f: Tensor::ones(8, DType::F32, &Device::Cpu).unwrap(),
            layers: Vec::new(),
        };
        assert!(Model::new(hp, weights, Device::Cpu).is_err());
    }
}
