//! Handle-based session API.
//!
//! Sessions live in a [`SessionTable`] and are addressed by copyable
//! [`SessionHandle`]s. A handle carries the generation of its slot, so a
//! handle kept after `free` never reaches the session that reuses the slot.
//! Every operation reports failure through [`ErrorCode`] or `None`.

use mpt_runtime_core::model::RuntimeConfig;
use mpt_runtime_core::session::Session;
use mpt_runtime_core::{ErrorCode, RuntimeError};
use parking_lot::Mutex;
use std::path::Path;
use tracing::warn;

/// Opaque reference to a session in a [`SessionTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle {
    index: u32,
    generation: u32,
}

impl SessionHandle {
    /// Slot index.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Slot generation the handle was issued for.
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    session: Option<Session>,
}

/// Owner of all sessions reachable through handles.
#[derive(Debug, Default)]
pub struct SessionTable {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl SessionTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a model into a new session.
    pub fn load(
        &mut self,
        path: impl AsRef<Path>,
        context_override: usize,
    ) -> Result<SessionHandle, ErrorCode> {
        let config = RuntimeConfig {
            n_ctx_override: context_override,
            ..RuntimeConfig::default()
        };
        self.load_with(path, &config)
    }

    /// Load a model into a new session with explicit runtime options.
    pub fn load_with(
        &mut self,
        path: impl AsRef<Path>,
        config: &RuntimeConfig,
    ) -> Result<SessionHandle, ErrorCode> {
        let path = path.as_ref();
        let session = Session::from_config(path, config).map_err(|e| {
            warn!(path = %path.display(), error = %e, "load failed");
            e.code()
        })?;
        self.insert(session)
    }

    /// Fork the session behind `handle` into a new one.
    pub fn fork(&mut self, handle: SessionHandle) -> Result<SessionHandle, ErrorCode> {
        let forked = self
            .get(handle)
            .ok_or(ErrorCode::Invalid)?
            .fork()
            .map_err(|e| e.code())?;
        self.insert(forked)
    }

    /// Evaluate `tokens`, leaving the last token's scores in `scores`.
    pub fn eval(&mut self, handle: SessionHandle, tokens: &[u32], scores: &mut Vec<f32>) -> ErrorCode {
        let Some(session) = self.get_mut(handle) else {
            return ErrorCode::Invalid;
        };
        match session.eval(tokens, scores) {
            Ok(()) => ErrorCode::Ok,
            Err(e) => {
                warn!(error = %e, "eval failed");
                e.code()
            }
        }
    }

    /// Step back up to `n` positions.
    pub fn rewind(&mut self, handle: SessionHandle, n: usize) -> ErrorCode {
        match self.get_mut(handle) {
            Some(session) => {
                session.rewind(n);
                ErrorCode::Ok
            }
            None => ErrorCode::Invalid,
        }
    }

    /// Return to position 0.
    pub fn reset(&mut self, handle: SessionHandle) -> ErrorCode {
        match self.get_mut(handle) {
            Some(session) => {
                session.reset();
                ErrorCode::Ok
            }
            None => ErrorCode::Invalid,
        }
    }

    /// Change the worker count (0 selects the default).
    pub fn set_thread_count(&mut self, handle: SessionHandle, n_threads: usize) -> ErrorCode {
        match self.get_mut(handle) {
            Some(session) => match session.set_thread_count(n_threads) {
                Ok(()) => ErrorCode::Ok,
                Err(e) => e.code(),
            },
            None => ErrorCode::Invalid,
        }
    }

    /// Vocabulary size.
    pub fn n_vocab(&self, handle: SessionHandle) -> Option<usize> {
        self.get(handle).map(Session::n_vocab)
    }

    /// Context length.
    pub fn n_ctx(&self, handle: SessionHandle) -> Option<usize> {
        self.get(handle).map(Session::n_ctx)
    }

    /// Positions evaluated so far.
    pub fn n_past(&self, handle: SessionHandle) -> Option<usize> {
        self.get(handle).map(Session::n_past)
    }

    /// Release a session. The handle and all its copies become stale.
    pub fn free(&mut self, handle: SessionHandle) -> ErrorCode {
        let Some(slot) = self.slot_mut(handle) else {
            return ErrorCode::Invalid;
        };
        let Some(session) = slot.session.take() else {
            return ErrorCode::Invalid;
        };
        slot.generation = slot.generation.wrapping_add(1);
        session.free();
        self.free.push(handle.index);
        ErrorCode::Ok
    }

    /// Live sessions.
    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    /// True when no session is live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Borrow the session behind a live handle.
    pub fn get(&self, handle: SessionHandle) -> Option<&Session> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.session.as_ref())
    }

    /// Mutably borrow the session behind a live handle.
    pub fn get_mut(&mut self, handle: SessionHandle) -> Option<&mut Session> {
        self.slot_mut(handle).and_then(|slot| slot.session.as_mut())
    }

    fn slot_mut(&mut self, handle: SessionHandle) -> Option<&mut Slot> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
    }

    fn insert(&mut self, session: Session) -> Result<SessionHandle, ErrorCode> {
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.session = Some(session);
                Ok(SessionHandle {
                    index,
                    generation: slot.generation,
                })
            }
            None => {
                let index = slot_index(self.slots.len())?;
                self.slots.push(Slot {
                    generation: 0,
                    session: Some(session),
                });
                Ok(SessionHandle {
                    index,
                    generation: 0,
                })
            }
        }
    }
}

/// Index for a new slot appended after `len` existing ones.
fn slot_index(len: usize) -> Result<u32, ErrorCode> {
    u32::try_from(len).map_err(|_| {
        let err = RuntimeError::AllocationFailure(format!("session table is full at {len} slots"));
        warn!(error = %err, "session not registered");
        err.code()
    })
}

/// A [`SessionTable`] behind a mutex, for callers sharing one table.
///
/// Evaluation holds the lock for its whole duration, so calls on different
/// handles are serialized. Give each thread its own table (or its own
/// [`Session`]) to evaluate in parallel.
#[derive(Debug, Default)]
pub struct SharedSessionTable {
    inner: Mutex<SessionTable>,
}

impl SharedSessionTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// See [`SessionTable::load`].
    pub fn load(&self, path: impl AsRef<Path>, context_override: usize) -> Result<SessionHandle, ErrorCode> {
        self.inner.lock().load(path, context_override)
    }

    /// See [`SessionTable::fork`].
    pub fn fork(&self, handle: SessionHandle) -> Result<SessionHandle, ErrorCode> {
        self.inner.lock().fork(handle)
    }

    /// See [`SessionTable::eval`].
    pub fn eval(&self, handle: SessionHandle, tokens: &[u32], scores: &mut Vec<f32>) -> ErrorCode {
        self.inner.lock().eval(handle, tokens, scores)
    }

    /// See [`SessionTable::rewind`].
    pub fn rewind(&self, handle: SessionHandle, n: usize) -> ErrorCode {
        self.inner.lock().rewind(handle, n)
    }

    /// See [`SessionTable::reset`].
    pub fn reset(&self, handle: SessionHandle) -> ErrorCode {
        self.inner.lock().reset(handle)
    }

    /// See [`SessionTable::set_thread_count`].
    pub fn set_thread_count(&self, handle: SessionHandle, n_threads: usize) -> ErrorCode {
        self.inner.lock().set_thread_count(handle, n_threads)
    }

    /// See [`SessionTable::n_vocab`].
    pub fn n_vocab(&self, handle: SessionHandle) -> Option<usize> {
        self.inner.lock().n_vocab(handle)
    }

    /// See [`SessionTable::n_ctx`].
    pub fn n_ctx(&self, handle: SessionHandle) -> Option<usize> {
        self.inner.lock().n_ctx(handle)
    }

    /// See [`SessionTable::n_past`].
    pub fn n_past(&self, handle: SessionHandle) -> Option<usize> {
        self.inner.lock().n_past(handle)
    }

    /// See [`SessionTable::free`].
    pub fn free(&self, handle: SessionHandle) -> ErrorCode {
        self.inner.lock().free(handle)
    }

    /// Run `f` with exclusive access to the table.
    pub fn with<T>(&self, f: impl FnOnce(&mut SessionTable) -> T) -> T {
        f(&mut self.inner.lock())
    }
}
