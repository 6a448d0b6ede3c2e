//! # MPT Runtime Core
//!
//! Inference engine for MPT-style decoder-only transformers.
//!
//! This crate provides:
//! - **Container loader** with an explicit tensor schema and a single weight arena
//! - **Forward pass** with fused QKV, ALiBi attention and a GELU feed-forward
//! - **Sessions** with an f16 KV cache, rewind and O(cache) fork
//! - **Quantizer** re-encoding containers into 4/5/8-bit block formats

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod error;
pub mod model;
pub mod quantization;
pub mod session;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{ErrorCode, Result, RuntimeError};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::error::{ErrorCode, Result, RuntimeError};
    pub use crate::model::{FileType, HyperParams, Model, RuntimeConfig};
    pub use crate::quantization::{quantize, QuantizeReport, Quantizer};
    pub use crate::session::Session;
}
