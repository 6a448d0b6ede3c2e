//! Model hyperparameters and runtime configuration.

use super::FileType;
use crate::error::{Result, RuntimeError};
use serde::{Deserialize, Serialize};

/// Feed-forward expansion factor; not stored in the container.
pub const DEFAULT_EXPAND: usize = 4;

/// Hyperparameters of an MPT-style decoder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HyperParams {
    /// Vocabulary size.
    pub n_vocab: usize,
    /// Context length (maximum positions held by the KV cache).
    pub n_ctx: usize,
    /// Embedding width.
    pub n_embd: usize,
    /// Number of attention heads.
    pub n_head: usize,
    /// Number of decoder blocks.
    pub n_layer: usize,
    /// Upper bound of the ALiBi slope exponent.
    pub alibi_bias_max: f32,
    /// Clamp bound for the fused QKV activations; 0 disables clamping.
    pub clip_qkv: f32,
    /// Storage encoding of the large weight matrices.
    pub ftype: FileType,
    /// Feed-forward expansion factor.
    #[serde(default = "default_expand")]
    pub expand: usize,
}

fn default_expand() -> usize {
    DEFAULT_EXPAND
}

impl HyperParams {
    /// Width of one attention head.
    pub fn head_dim(&self) -> usize {
        self.n_embd / self.n_head
    }

    /// Width of the feed-forward hidden layer.
    pub fn ffn_dim(&self) -> usize {
        self.expand * self.n_embd
    }

    /// Check structural invariants.
    pub fn validate(&self) -> Result<()> {
        let fields = [
            ("n_vocab", self.n_vocab),
            ("n_ctx", self.n_ctx),
            ("n_embd", self.n_embd),
            ("n_head", self.n_head),
            ("n_layer", self.n_layer),
            ("expand", self.expand),
        ];
        if let Some((name, _)) = fields.iter().find(|(_, v)| *v == 0) {
            return Err(RuntimeError::InvalidFormat(format!("{name} must be positive")));
        }
        if self.n_embd % self.n_head != 0 {
            return Err(RuntimeError::InvalidFormat(format!(
                "n_head {} does not divide n_embd {}",
                self.n_head, self.n_embd
            )));
        }
        if !self.clip_qkv.is_finite() || self.clip_qkv < 0.0 {
            return Err(RuntimeError::InvalidFormat(format!(
                "clip_qkv must be a non-negative number, got {}",
                self.clip_qkv
            )));
        }
        if !self.alibi_bias_max.is_finite() {
            return Err(RuntimeError::InvalidFormat(
                "alibi_bias_max must be finite".into(),
            ));
        }
        Ok(())
    }
}

impl Default for HyperParams {
    fn default() -> Self {
        // MPT-7B
        Self {
            n_vocab: 50432,
            n_ctx: 2048,
            n_embd: 4096,
            n_head: 32,
            n_layer: 32,
            alibi_bias_max: 8.0,
            clip_qkv: 0.0,
            ftype: FileType::MostlyF16,
            expand: DEFAULT_EXPAND,
        }
    }
}

/// Default worker count for the forward pass.
pub const DEFAULT_THREADS: usize = 4;

/// Options applied when loading a model into a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Replaces the stored context length when non-zero.
    pub n_ctx_override: usize,
    /// Worker threads for the forward pass; 0 selects the default.
    pub n_threads: usize,
    /// Reject files that leave catalog entries unwritten.
    pub verify_complete: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            n_ctx_override: 0,
            n_threads: DEFAULT_THREADS,
            verify_complete: true,
        }
    }
}

impl RuntimeConfig {
    /// Load from JSON file.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)?;
        Ok(config)
    }

    /// Worker count with the zero-means-default rule applied.
    pub fn threads(&self) -> usize {
        if self.n_threads > 0 {
            self.n_threads
        } else {
            DEFAULT_THREADS
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mpt7b_defaults() {
        let hp = HyperParams::default();
        assert_eq!(hp.head_dim(), 128);
        assert_eq!(hp.ffn_dim(), 16384);
        hp.validate().unwrap();
    }

    #[test]
    fn head_count_must_divide_width() {
        let hp = HyperParams {
            n_embd: 10,
            n_head: 3,
            ..HyperParams::default()
        };
        assert!(matches!(hp.validate(), Err(RuntimeError::InvalidFormat(_))));
    }

    #[test]
    fn negative_clip_is_rejected() {
        let hp = HyperParams {
            clip_qkv: -1.0,
            ..HyperParams::default()
        };
        assert!(hp.validate().is_err());
    }

    #[test]
    fn runtime_config_from_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runtime.json");
        std::fs::write(&path, r#"{ "n_ctx_override": 512, "n_threads": 0 }"#).unwrap();

        let config = RuntimeConfig::from_file(&path).unwrap();
        assert_eq!(config.n_ctx_override, 512);
        assert_eq!(config.threads(), DEFAULT_THREADS);
        assert!(config.verify_complete);
    }

    #[test]
    fn hparams_serde_defaults_expand() {
        let json = r#"{
            "n_vocab": 4, "n_ctx": 8, "n_embd": 2, "n_head": 1, "n_layer": 1,
            "alibi_bias_max": 8.0, "clip_qkv": 0.0, "ftype": "all_f32"
        }"#;
        let hp: HyperParams = serde_json::from_str(json).unwrap();
        assert_eq!(hp.expand, DEFAULT_EXPAND);
        assert_eq!(hp.ftype, FileType::AllF32);
    }
}
