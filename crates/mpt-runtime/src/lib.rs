//! # MPT Runtime
//!
//! Inference runtime for MPT-style decoder-only transformers stored in the
//! ggml container format.
//!
//! - **Sessions**: load a model, evaluate token batches, rewind and fork
//! - **Handles**: a generational session table for embedders that only keep
//!   integer-like handles and status codes
//! - **Quantizer**: offline re-encoding of projection weights into
//!   Q4_0/Q4_1/Q5_0/Q5_1/Q8_0 blocks (see the `mpt-quantize` binary)
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use mpt_runtime::prelude::*;
//!
//! fn main() -> anyhow::Result<()> {
//!     let mut table = SessionTable::new();
//!     let session = table.load("mpt-7b-q4_0.bin", 0).map_err(|c| anyhow::anyhow!("{c:?}"))?;
//!
//!     let mut scores = Vec::new();
//!     assert_eq!(table.eval(session, &[1, 2, 3], &mut scores), ErrorCode::Ok);
//!
//!     let branch = table.fork(session).map_err(|c| anyhow::anyhow!("{c:?}"))?;
//!     table.eval(branch, &[4], &mut scores);
//!     table.free(branch);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

// Re-export core crate
pub use mpt_runtime_core::*;

mod handles;

pub use handles::{SessionHandle, SessionTable, SharedSessionTable};

/// Commonly used types.
pub mod prelude {
    pub use crate::handles::{SessionHandle, SessionTable, SharedSessionTable};
    pub use mpt_runtime_core::prelude::*;

    // Re-export useful external types
    pub use anyhow;
    pub use tracing;
}
