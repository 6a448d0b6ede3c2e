//! Fixture containers for unit tests.

use crate::model::{ContainerWriter, FileType, HyperParams, TensorSchema};
use std::path::{Path, PathBuf};

/// The smallest useful model: 4 tokens, 8 positions, one 2-wide head.
pub(crate) fn tiny_hparams() -> HyperParams {
    HyperParams {
        n_vocab: 4,
        n_ctx: 8,
        n_embd: 2,
        n_head: 1,
        n_layer: 1,
        alibi_bias_max: 8.0,
        clip_qkv: 0.0,
        ftype: FileType::AllF32,
        expand: 4,
    }
}

/// A model wide enough for block-quantized projections.
pub(crate) fn small_hparams() -> HyperParams {
    HyperParams {
        n_vocab: 16,
        n_ctx: 16,
        n_embd: 32,
        n_head: 4,
        n_layer: 2,
        alibi_bias_max: 8.0,
        clip_qkv: 6.0,
        ftype: FileType::AllF32,
        expand: 4,
    }
}

/// How fixture weights are filled.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Fill {
    Zeros,
    /// Deterministic non-trivial values; norms are ones.
    Pattern,
}

/// Weights of tensor number `index` with `len` elements.
pub(crate) fn fixture_values(fill: Fill, index: usize, len: usize, is_norm: bool) -> Vec<f32> {
    match fill {
        Fill::Zeros => vec![0.0; len],
        Fill::Pattern if is_norm => vec![1.0; len],
        Fill::Pattern => (0..len)
            .map(|i| (((i * 7 + index * 13) % 17) as f32 / 17.0 - 0.5) * 0.5)
            .collect(),
    }
}

/// Serialize a complete f32 container.
pub(crate) fn container_bytes(hp: &HyperParams, fill: Fill) -> Vec<u8> {
    let mut writer = ContainerWriter::new(Vec::new(), hp).unwrap();
    for (index, spec) in TensorSchema::for_hparams(hp).specs().iter().enumerate() {
        let values = fixture_values(fill, index, spec.elements().unwrap(), spec.n_dims == 1);
        writer
            .write_f32(&spec.name, &spec.ne[..spec.n_dims], &values)
            .unwrap();
    }
    writer.finish().unwrap()
}

/// Write a complete f32 container to `dir/name`.
pub(crate) fn write_model(dir: &Path, name: &str, hp: &HyperParams, fill: Fill) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, container_bytes(hp, fill)).unwrap();
    path
}
