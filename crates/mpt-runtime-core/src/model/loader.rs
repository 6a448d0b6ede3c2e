//! Container loading.
//!
//! Reads the header, sizes and carves the weight arena, streams every tensor
//! record into its catalog slot, and finally turns the arena into backend
//! tensors.
//!
//! # Example
//!
//! ```ignore
//! use mpt_runtime_core::model;
//!
//! let model = model::load("/path/to/ggml-mpt-7b-q4_0.bin", 0)?;
//! println!("vocab: {}", model.n_vocab());
//! ```

use super::linear::dense_from_bytes;
use super::{
    Header, HyperParams, KvCache, LayerNorm, Linear, Model, RecordHeader, RuntimeConfig,
    TensorId, TensorSchema, WeightCatalog, LAYER_NORM_EPS,
};
use crate::error::{Result, RuntimeError};
use candle_core::{Device, Tensor};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use tracing::{debug, info, warn};

/// Backend tensors of one decoder block.
#[derive(Debug, Clone)]
pub struct LayerWeights {
    /// Pre-attention norm weight.
    pub norm_1: Tensor,
    /// Pre-feed-forward norm weight.
    pub norm_2: Tensor,
    /// Fused QKV projection.
    pub attn_qkv: Linear,
    /// Attention output projection.
    pub attn_out: Linear,
    /// Feed-forward expansion.
    pub ffn_up: Linear,
    /// Feed-forward contraction.
    pub ffn_down: Linear,
}

/// All backend tensors of a model, addressed by position.
#[derive(Debug, Clone)]
pub struct ModelWeights {
    /// Token embedding table `[n_vocab, n_embd]`, also the output projection.
    pub wte: Tensor,
    /// Final norm weight.
    pub norm_f: Tensor,
    /// Per-block weights.
    pub layers: Vec<LayerWeights>,
}

impl ModelWeights {
    /// Materialize every catalog entry once.
    pub fn from_catalog(catalog: &WeightCatalog, device: &Device) -> Result<Self> {
        let dense = |id: TensorId| dense_from_bytes(catalog.spec(id), catalog.bytes(id), device);
        let linear = |id: TensorId| Linear::from_bytes(catalog.spec(id), catalog.bytes(id), device);

        let schema = catalog.schema();
        let mut layers = Vec::with_capacity(schema.n_layer());
        for i in 0..schema.n_layer() {
            let ids = schema.layer(i);
            layers.push(LayerWeights {
                norm_1: dense(ids.norm_1)?,
                norm_2: dense(ids.norm_2)?,
                attn_qkv: linear(ids.attn_qkv)?,
                attn_out: linear(ids.attn_out)?,
                ffn_up: linear(ids.ffn_up)?,
                ffn_down: linear(ids.ffn_down)?,
            });
        }

        Ok(Self {
            wte: dense(TensorSchema::WTE)?,
            norm_f: dense(TensorSchema::NORM_F)?,
            layers,
        })
    }

    pub(crate) fn norm(weight: &Tensor) -> Result<LayerNorm> {
        LayerNorm::new(weight.clone(), LAYER_NORM_EPS)
    }
}

/// Load a model file; `context_override` replaces the stored context length
/// when non-zero.
pub fn load(path: impl AsRef<Path>, context_override: usize) -> Result<Model> {
    let config = RuntimeConfig {
        n_ctx_override: context_override,
        ..RuntimeConfig::default()
    };
    load_with(path, &config)
}

/// Load a model file with explicit runtime options.
pub fn load_with(path: impl AsRef<Path>, config: &RuntimeConfig) -> Result<Model> {
    let path = path.as_ref();
    info!(path = %path.display(), "loading model");

    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let (hparams, catalog) = read_container(&mut reader, config)?;

    let device = Device::Cpu;
    let weights = ModelWeights::from_catalog(&catalog, &device)?;
    drop(catalog);

    Model::new(hparams, weights, device)
}

/// Parse a whole container into a filled catalog.
pub(crate) fn read_container<R: Read>(
    reader: &mut R,
    config: &RuntimeConfig,
) -> Result<(HyperParams, WeightCatalog)> {
    let mut hparams = Header::read(reader)?.hparams;
    if config.n_ctx_override != 0 {
        hparams.n_ctx = config.n_ctx_override;
    }
    hparams.validate()?;

    info!("n_vocab        = {}", hparams.n_vocab);
    info!("n_ctx          = {}", hparams.n_ctx);
    info!("n_embd         = {}", hparams.n_embd);
    info!("n_head         = {}", hparams.n_head);
    info!("n_layer        = {}", hparams.n_layer);
    info!("alibi_bias_max = {}", hparams.alibi_bias_max);
    info!("clip_qkv       = {}", hparams.clip_qkv);
    info!("ftype          = {}", hparams.ftype.id());

    let mut catalog = WeightCatalog::new(&hparams)?;
    info!(
        "weight arena size = {:.2} MB",
        catalog.arena_size() as f64 / (1024.0 * 1024.0)
    );
    let kv_bytes = KvCache::required_bytes(&hparams)?;
    info!(
        "kv cache size = {:.2} MB per session",
        kv_bytes as f64 / (1024.0 * 1024.0)
    );

    let mut n_tensors = 0usize;
    let mut total_bytes = 0usize;
    while let Some(record) = RecordHeader::read(reader)? {
        let id = check_record(&catalog, &record)?;
        let slot = catalog.slot_mut(id);
        reader
            .read_exact(slot)
            .map_err(|e| RuntimeError::from_read(e, "tensor payload"))?;

        debug!(
            name = %record.name,
            dims = ?record.dims,
            ty = %record.element_type,
            bytes = slot.len(),
            "loaded tensor"
        );
        n_tensors += 1;
        total_bytes += slot.len();
    }

    let missing: Vec<&str> = catalog.unwritten().map(|spec| spec.name.as_str()).collect();
    if !missing.is_empty() {
        if config.verify_complete {
            return Err(RuntimeError::MissingTensor(missing.join(", ")));
        }
        warn!(count = missing.len(), "tensors missing from file, left zero-filled");
    }

    info!(
        "model size = {:.2} MB / num tensors = {}",
        total_bytes as f64 / (1024.0 * 1024.0),
        n_tensors
    );
    Ok((hparams, catalog))
}

/// Validate one record against its catalog entry.
fn check_record(catalog: &WeightCatalog, record: &RecordHeader) -> Result<TensorId> {
    let id = catalog
        .lookup(&record.name)
        .ok_or_else(|| RuntimeError::UnknownTensor(record.name.clone()))?;
    let spec = catalog.spec(id);

    let elements = record.elements()?;
    let expected_elements = spec.elements()?;
    if elements != expected_elements {
        return Err(RuntimeError::ShapeMismatch(format!(
            "tensor '{}' has {} elements in file, expected {}",
            record.name, elements, expected_elements
        )));
    }
    let dims_match = record.dims[0] == spec.ne[0]
        && (record.n_dims() < 2 || record.dims[1] == spec.ne[1]);
    if !dims_match {
        return Err(RuntimeError::ShapeMismatch(format!(
            "tensor '{}' has dims {:?} in file, expected {:?}",
            record.name,
            record.dims,
            &spec.ne[..spec.n_dims]
        )));
    }

    // file bytes, measured in blocks of the expected encoding
    let expected = spec.nbytes()?;
    let declared = elements
        .checked_mul(record.element_type.type_size())
        .ok_or_else(|| {
            RuntimeError::SizeMismatch(format!("tensor '{}' byte size overflows", record.name))
        })?
        / spec.element_type.block_size();
    if declared != expected {
        return Err(RuntimeError::SizeMismatch(format!(
            "tensor '{}' has {} bytes in file, expected {}",
            record.name, declared, expected
        )));
    }
    if record.element_type != spec.element_type {
        return Err(RuntimeError::SizeMismatch(format!(
            "tensor '{}' is stored as {}, expected {}",
            record.name, record.element_type, spec.element_type
        )));
    }
    Ok(id)
}
