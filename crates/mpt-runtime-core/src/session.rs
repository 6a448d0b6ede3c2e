//! Inference sessions.
//!
//! A session pairs a shared, read-only [`Model`] with its own KV cache,
//! scratch arena, position counter and worker pool. Sessions forked from one
//! another share the model and nothing else.
//!
//! # Example
//!
//! ```ignore
//! use mpt_runtime_core::session::Session;
//!
//! let mut session = Session::load("/path/to/model.bin", 0)?;
//! let mut scores = Vec::new();
//! session.eval(&[1, 2, 3], &mut scores)?;
//!
//! let mut branch = session.fork()?;
//! branch.eval(&[4], &mut scores)?;
//! ```

use crate::error::{Result, RuntimeError};
use crate::model::{self, calibration_tokens, KvCache, Model, RuntimeConfig, ScratchArena, DEFAULT_THREADS};
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// One independent decoding stream over a shared model.
///
/// All mutating operations take `&mut self`; a session is driven by one
/// caller at a time. Separate sessions may run concurrently.
pub struct Session {
    model: Arc<Model>,
    cache: KvCache,
    scratch: ScratchArena,
    n_past: usize,
    n_threads: usize,
    pool: ThreadPool,
}

impl Session {
    /// Load a model file into a fresh session.
    pub fn load(path: impl AsRef<Path>, context_override: usize) -> Result<Self> {
        let config = RuntimeConfig {
            n_ctx_override: context_override,
            ..RuntimeConfig::default()
        };
        Self::from_config(path, &config)
    }

    /// Load a model file using explicit runtime options.
    pub fn from_config(path: impl AsRef<Path>, config: &RuntimeConfig) -> Result<Self> {
        let model = Arc::new(model::load_with(path, config)?);
        Self::with_threads(model, config.threads())
    }

    /// Start a session over an already loaded model.
    pub fn new(model: Arc<Model>) -> Result<Self> {
        Self::with_threads(model, DEFAULT_THREADS)
    }

    /// Start a session with a given worker count (0 selects the default).
    pub fn with_threads(model: Arc<Model>, n_threads: usize) -> Result<Self> {
        let n_threads = effective_threads(n_threads);
        let cache = KvCache::new(model.hparams())?;
        info!(
            n_threads,
            kv_bytes = cache.memory_size(),
            "session created"
        );
        Ok(Self {
            cache,
            scratch: ScratchArena::new(),
            n_past: 0,
            pool: build_pool(n_threads)?,
            n_threads,
            model,
        })
    }

    /// Create an independent copy sharing the model.
    ///
    /// The cache is copied in full; position counter, thread count and
    /// scratch calibration carry over. Later evaluation in either session is
    /// invisible to the other.
    pub fn fork(&self) -> Result<Self> {
        debug!(n_past = self.n_past, "forking session");
        Ok(Self {
            model: Arc::clone(&self.model),
            cache: self.cache.clone(),
            scratch: self.scratch.clone(),
            n_past: self.n_past,
            n_threads: self.n_threads,
            pool: build_pool(self.n_threads)?,
        })
    }

    /// Evaluate `tokens` after the current position.
    ///
    /// On success `scores` holds the `n_vocab` next-token scores of the last
    /// token and the position advances by `tokens.len()`. On failure the
    /// position is unchanged.
    pub fn eval(&mut self, tokens: &[u32], scores: &mut Vec<f32>) -> Result<()> {
        self.model.check_batch(self.n_past, tokens)?;
        if !self.scratch.is_calibrated() && self.n_past == 0 {
            self.calibrate()?;
        }

        let Self {
            model,
            cache,
            scratch,
            n_past,
            pool,
            ..
        } = self;
        pool.install(|| model.evaluate(cache, scratch, *n_past, tokens, scores))?;

        self.n_past += tokens.len();
        Ok(())
    }

    /// Measure the per-token scratch cost with a short pass at position 0.
    fn calibrate(&mut self) -> Result<()> {
        let tokens = calibration_tokens(self.model.n_vocab(), self.model.n_ctx());
        let mut discard = Vec::new();
        let Self {
            model,
            cache,
            scratch,
            pool,
            ..
        } = self;
        let stats = pool.install(|| model.evaluate(cache, scratch, 0, &tokens, &mut discard))?;
        scratch.calibrate(stats.bytes(), tokens.len());
        info!(
            mem_per_token = scratch.mem_per_token(),
            "calibrated scratch estimate"
        );
        Ok(())
    }

    /// Step the position back by up to `n` tokens.
    ///
    /// The cache is left as is; positions past the new `n_past` are
    /// overwritten by the next evaluation.
    pub fn rewind(&mut self, n: usize) {
        self.n_past = self.n_past.saturating_sub(n);
    }

    /// Return to position 0.
    pub fn reset(&mut self) {
        self.n_past = 0;
    }

    /// Change the worker count (0 selects the default).
    pub fn set_thread_count(&mut self, n_threads: usize) -> Result<()> {
        let n_threads = effective_threads(n_threads);
        if n_threads != self.n_threads {
            self.pool = build_pool(n_threads)?;
            self.n_threads = n_threads;
        }
        Ok(())
    }

    /// Release the session. Equivalent to dropping it.
    pub fn free(self) {
        debug!(n_past = self.n_past, "session freed");
    }

    /// Vocabulary size.
    pub fn n_vocab(&self) -> usize {
        self.model.n_vocab()
    }

    /// Context length.
    pub fn n_ctx(&self) -> usize {
        self.model.n_ctx()
    }

    /// Positions evaluated so far.
    pub fn n_past(&self) -> usize {
        self.n_past
    }

    /// Worker count.
    pub fn n_threads(&self) -> usize {
        self.n_threads
    }

    /// The shared model.
    pub fn model(&self) -> &Arc<Model> {
        &self.model
    }

    /// Measured scratch bytes per token, 0 until the first evaluation.
    pub fn mem_per_token(&self) -> usize {
        self.scratch.mem_per_token()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("n_vocab", &self.n_vocab())
            .field("n_ctx", &self.n_ctx())
            .field("n_past", &self.n_past)
            .field("n_threads", &self.n_threads)
            .finish()
    }
}

fn effective_threads(n_threads: usize) -> usize {
    if n_threads == 0 {
        DEFAULT_THREADS
    } else {
        n_threads
    }
}

fn build_pool(n_threads: usize) -> Result<ThreadPool> {
    ThreadPoolBuilder::new()
        .num_threads(n_threads)
        .thread_name(|i| format!("mpt-eval-{i}"))
        .build()
        .map_err(|e| RuntimeError::AllocationFailure(format!("worker pool of {n_threads} threads: {e}")))
}
