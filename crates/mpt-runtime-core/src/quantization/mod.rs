//! Offline quantization of model containers.
//!
//! Re-encodes the large weight matrices of an f32/f16 container into one of
//! the 32-element block encodings, copying every other tensor unchanged.
//!
//! # Supported targets
//!
//! - **q4_0 / q4_1**: 4-bit codes, scale only or scale plus minimum
//! - **q5_0 / q5_1**: 5-bit codes, same two variants
//! - **q8_0**: 8-bit codes with one scale
//!
//! # Usage
//!
//! ```rust,ignore
//! use mpt_runtime_core::model::FileType;
//! use mpt_runtime_core::quantization::quantize;
//!
//! let report = quantize(input, output, FileType::MostlyQ4_0)?;
//! println!("{} of {} tensors quantized", report.quantized, report.tensors);
//! ```

mod blocks;
mod patterns;
mod quantizer;

pub use blocks::{
    dequantize_row, is_supported_target, quantize_row, BLOCK_SIZE, HISTOGRAM_BUCKETS,
};
pub use patterns::{any_match, NamePattern};
pub use quantizer::{quantize, QuantizeReport, Quantizer, MPT_INCLUDE};
