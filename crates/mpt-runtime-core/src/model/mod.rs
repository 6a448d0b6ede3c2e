//! Model loading and inference.
//!
//! Provides the pieces of an MPT-style decoder:
//! - Container format and hyperparameters
//! - Weight catalog and loader
//! - Key/value cache
//! - Forward pass

mod alibi;
mod catalog;
mod config;
mod format;
mod kv_cache;
mod layer;
mod layer_norm;
mod linear;
mod loader;
mod scratch;
mod transformer;

pub use alibi::{attention_bias, causal_mask, slopes};
pub use catalog::{
    estimate_arena_size, LayerIds, TensorId, TensorSchema, TensorSpec, WeightArena,
    WeightCatalog, OBJECT_OVERHEAD,
};
pub use config::{HyperParams, RuntimeConfig, DEFAULT_EXPAND, DEFAULT_THREADS};
pub use format::{
    ContainerWriter, ElementType, FileType, Header, RecordHeader, FORMAT_VERSION, MAGIC,
};
pub use kv_cache::KvCache;
pub use layer::{MptAttention, MptBlock, MptFeedForward};
pub use layer_norm::{LayerNorm, LAYER_NORM_EPS};
pub use linear::Linear;
pub use loader::{load, load_with, LayerWeights, ModelWeights};
pub(crate) use loader::read_container;
pub use scratch::{calibration_tokens, GraphStats, ScratchArena, CALIBRATION_TOKENS};
pub use transformer::Model;
