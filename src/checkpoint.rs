// SPDX-License-Identifier: MIT OR Apache-2.0

//! Parameter snapshots, scoped rollback, and checkpoint history.
//!
//! - [`ParamSnapshot`]: deep CPU copy of every model parameter.
//! - [`ModificationScope`]: guard that captures parameters, edit log and
//!   dirty flag on creation and restores all three when dropped.
//! - [`Checkpoint`]: immutable timestamped copy of the edit log.
//!
//! A scope holds `&mut` access to the context and only exposes the
//! context (which has no `scope` method), so scopes cannot nest.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::time::SystemTime;

use candle_core::{Device, Tensor};

use crate::abliterator::{AbliterationContext, Abliterator};
use crate::backend::AbliterationBackend;
use crate::error::Result;
use crate::surgery::ModificationLog;

/// Copy `tensor` to the CPU without sharing storage with the original.
///
/// # Errors
///
/// Returns [`AbliterationError::Model`](crate::AbliterationError::Model)
/// if the copy fails.
pub(crate) fn detach_to_cpu(tensor: &Tensor) -> Result<Tensor> {
    if tensor.device().is_cpu() {
        Ok(tensor.copy()?)
    } else {
        Ok(tensor.to_device(&Device::Cpu)?)
    }
}

// ---------------------------------------------------------------------------
// ParamSnapshot
// ---------------------------------------------------------------------------

/// Deep copy of every model parameter, held on the CPU.
///
/// Later in-place writes to the model cannot reach a snapshot.
#[derive(Debug, Clone)]
pub struct ParamSnapshot {
    /// Parameter values by name.
    params: HashMap<String, Tensor>,
}

impl ParamSnapshot {
    /// Capture the current parameters of `backend`.
    ///
    /// # Errors
    ///
    /// Propagates backend and copy errors.
    pub fn capture(backend: &dyn AbliterationBackend) -> Result<Self> {
        let params = backend
            .named_parameters()?
            .into_iter()
            .map(|(name, tensor)| Ok((name, detach_to_cpu(&tensor)?)))
            .collect::<Result<HashMap<_, _>>>()?;
        Ok(Self { params })
    }

    /// Write the captured values back into `backend`.
    ///
    /// # Errors
    ///
    /// Propagates [`AbliterationBackend::load_parameters`] errors.
    pub fn restore_into(&self, backend: &mut dyn AbliterationBackend) -> Result<()> {
        backend.load_parameters(&self.params)
    }

    /// Captured value of one parameter.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.params.get(name)
    }

    /// Number of captured parameters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.params.len()
    }

    /// Whether the snapshot holds no parameters.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Checkpoint
// ---------------------------------------------------------------------------

/// Immutable copy of the modification log at one point in time.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    /// When the checkpoint was taken.
    created_at: SystemTime,
    /// The log as it was.
    log: ModificationLog,
}

impl Checkpoint {
    /// Build a checkpoint from its parts (used when loading a session).
    #[must_use]
    pub(crate) const fn from_parts(created_at: SystemTime, log: ModificationLog) -> Self {
        Self { created_at, log }
    }

    /// When the checkpoint was taken.
    #[must_use]
    pub const fn created_at(&self) -> SystemTime {
        self.created_at
    }

    /// The captured modification log.
    #[must_use]
    pub const fn log(&self) -> &ModificationLog {
        &self.log
    }
}

// ---------------------------------------------------------------------------
// ModificationScope
// ---------------------------------------------------------------------------

/// State captured when a scope opens.
struct SavedState {
    /// Full parameter copy.
    params: ParamSnapshot,
    /// Edit log at scope entry.
    log: ModificationLog,
    /// Dirty flag at scope entry.
    modified: bool,
}

/// Guard restoring parameters, edit log and dirty flag when it goes away.
///
/// Obtained from [`Abliterator::scope`]. Derefs to the
/// [`AbliterationContext`], so every editing and scoring operation is
/// available inside the scope. Dropping the guard restores silently
/// (logging failures); call [`restore`](Self::restore) to observe errors.
///
/// ```compile_fail
/// # fn nested(abliterator: &mut candle_abliterate::Abliterator) {
/// let mut outer = abliterator.scope().unwrap();
/// let inner = outer.scope(); // the context has no `scope`
/// # }
/// ```
pub struct ModificationScope<'a> {
    /// The context being guarded.
    ctx: &'a mut AbliterationContext,
    /// `None` once restored.
    saved: Option<SavedState>,
}

impl<'a> ModificationScope<'a> {
    /// Capture the context's state and open the scope.
    pub(crate) fn open(ctx: &'a mut AbliterationContext) -> Result<Self> {
        let saved = SavedState {
            params: ParamSnapshot::capture(ctx.backend.as_ref())?,
            log: ctx.log.clone(),
            modified: ctx.modified,
        };
        ctx.scoped = true;
        Ok(Self {
            ctx,
            saved: Some(saved),
        })
    }

    /// Restore the captured state now, reporting failures.
    ///
    /// # Errors
    ///
    /// Propagates parameter load errors. The log and dirty flag are
    /// restored even when the parameter load fails.
    pub fn restore(mut self) -> Result<()> {
        self.restore_saved()
    }

    /// Shared restore path for [`restore`](Self::restore) and `Drop`.
    fn restore_saved(&mut self) -> Result<()> {
        let Some(saved) = self.saved.take() else {
            return Ok(());
        };
        let loaded = saved.params.restore_into(self.ctx.backend.as_mut());
        self.ctx.log = saved.log;
        self.ctx.modified = saved.modified;
        self.ctx.scoped = false;
        loaded
    }
}

impl Deref for ModificationScope<'_> {
    type Target = AbliterationContext;

    fn deref(&self) -> &Self::Target {
        self.ctx
    }
}

impl DerefMut for ModificationScope<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.ctx
    }
}

impl Drop for ModificationScope<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.restore_saved() {
            tracing::error!("failed to restore parameters on scope exit: {e}");
        }
    }
}

// ---------------------------------------------------------------------------
// Context and orchestrator operations
// ---------------------------------------------------------------------------

impl Abliterator {
    /// Open a modification scope.
    ///
    /// Parameters, the edit log and the dirty flag are captured now and
    /// restored on every exit path of the returned guard.
    ///
    /// # Errors
    ///
    /// Propagates snapshot errors.
    pub fn scope(&mut self) -> Result<ModificationScope<'_>> {
        ModificationScope::open(self.context_mut())
    }
}

impl AbliterationContext {
    /// Restore the weights captured at construction and clear the edit log.
    ///
    /// Checkpoint history is kept.
    ///
    /// # Errors
    ///
    /// Propagates parameter load errors.
    pub fn reset_state(&mut self) -> Result<()> {
        self.original.restore_into(self.backend.as_mut())?;
        self.log.clear();
        self.modified = false;
        tracing::info!("model restored to original weights");
        Ok(())
    }

    /// Append a copy of the current edit log to the checkpoint history.
    pub fn checkpoint(&mut self) {
        self.checkpoints
            .push(Checkpoint::from_parts(SystemTime::now(), self.log.clone()));
        tracing::debug!(
            checkpoints = self.checkpoints.len(),
            edits = self.log.num_edits(),
            "checkpoint taken"
        );
    }

    /// Checkpoint history, oldest first.
    #[must_use]
    pub fn checkpoints(&self) -> &[Checkpoint] {
        &self.checkpoints
    }
}
