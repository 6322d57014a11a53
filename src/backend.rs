// SPDX-License-Identifier: MIT OR Apache-2.0

//! Model backend trait and parameter-map helpers.
//!
//! [`AbliterationBackend`] is the contract an externally supplied model
//! implements: a hook-aware forward pass, per-layer access to the two
//! output matrices we edit, and whole-parameter export/import for
//! snapshots. Architecture definition and weight loading stay with the
//! caller.

use std::collections::HashMap;

use candle_core::{Device, Tensor};
use candle_nn::VarMap;

use crate::error::{AbliterationError, Result};
use crate::hooks::{HookCache, HookSpec};
use crate::surgery::WeightKind;

// ---------------------------------------------------------------------------
// AbliterationBackend trait
// ---------------------------------------------------------------------------

/// Unified interface to the model being edited.
///
/// The forward pass follows the hook protocol of [`HookSpec`]: the
/// backend captures every requested [`HookPoint`](crate::HookPoint) it
/// reaches, applies registered interventions through
/// [`apply_intervention`](crate::hooks::apply_intervention), and returns
/// the logits in a [`HookCache`].
///
/// Weight accessors use a residual-space layout: the returned matrix has
/// `d_model` as its **last** dimension, so each row is a vector written
/// into the residual stream. Backends storing `[d_model, d_in]` (the
/// `candle_nn::Linear` convention) transpose on the way in and out.
pub trait AbliterationBackend: Send + Sync {
    // --- Metadata --------------------------------------------------------

    /// Number of layers.
    fn num_layers(&self) -> usize;

    /// Hidden dimension (`d_model`).
    fn hidden_size(&self) -> usize;

    /// Vocabulary size.
    fn vocab_size(&self) -> usize;

    /// Device holding the weights; input ids are created here.
    fn device(&self) -> &Device;

    // --- Core forward pass -----------------------------------------------

    /// Forward pass with optional hook capture and interventions.
    ///
    /// # Shapes
    /// - `input_ids`: `[batch, seq]` -- token IDs (`u32`)
    /// - returns: [`HookCache`] containing `logits` at `[batch, seq, vocab_size]`
    ///
    /// # Errors
    ///
    /// Returns [`AbliterationError::Model`] on tensor operation failures.
    fn forward(&self, input_ids: &Tensor, hooks: &HookSpec) -> Result<HookCache>;

    // --- Logit projection ------------------------------------------------

    /// Project residual-stream vectors through the final norm and the
    /// unembedding.
    ///
    /// # Shapes
    /// - `hidden`: `[..., d_model]`
    /// - returns: `[..., vocab_size]`
    ///
    /// # Errors
    ///
    /// Returns [`AbliterationError::Model`] on shape mismatch or tensor
    /// operation failure.
    fn project_to_vocab(&self, hidden: &Tensor) -> Result<Tensor>;

    // --- Weight access ---------------------------------------------------

    /// Current output matrix of `kind` at `layer`.
    ///
    /// # Shapes
    /// - returns: `[..., d_model]`
    ///
    /// # Errors
    ///
    /// Returns [`AbliterationError::Index`] if `layer >= num_layers()`.
    fn weight(&self, layer: usize, kind: WeightKind) -> Result<Tensor>;

    /// Overwrite the output matrix of `kind` at `layer`.
    ///
    /// `weight` already has the device and dtype of the current matrix.
    ///
    /// # Errors
    ///
    /// Returns [`AbliterationError::Index`] for an unknown layer and
    /// [`AbliterationError::Model`] if the write fails.
    fn set_weight(&mut self, layer: usize, kind: WeightKind, weight: Tensor) -> Result<()>;

    // --- Whole-model parameters -------------------------------------------

    /// Every parameter by name. Tensors may share storage with the live
    /// model; callers deep-copy before keeping them.
    ///
    /// # Errors
    ///
    /// Returns an error if the parameter store cannot be read.
    fn named_parameters(&self) -> Result<Vec<(String, Tensor)>>;

    /// Load parameter values by name, moving them onto the model's device.
    ///
    /// # Errors
    ///
    /// Returns [`AbliterationError::Index`] if a model parameter is missing
    /// from `params`, or [`AbliterationError::Model`] on shape mismatch.
    fn load_parameters(&mut self, params: &HashMap<String, Tensor>) -> Result<()>;
}

// ---------------------------------------------------------------------------
// VarMap helpers
// ---------------------------------------------------------------------------

/// Export every variable of a [`VarMap`], sorted by name.
///
/// Backends built on `candle_nn::VarMap` can forward
/// [`AbliterationBackend::named_parameters`] here.
///
/// # Errors
///
/// Returns [`AbliterationError::State`] if the variable map lock is poisoned.
pub fn varmap_parameters(varmap: &VarMap) -> Result<Vec<(String, Tensor)>> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| AbliterationError::State("variable map lock poisoned".into()))?;
    let mut params: Vec<(String, Tensor)> = data
        .iter()
        // BORROW: explicit .clone(): name owned by the locked map
        .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
        .collect();
    params.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(params)
}

/// Write `params` into the variables of a [`VarMap`] in place.
///
/// Every variable must have an entry; values are converted to the
/// variable's device and dtype first.
///
/// # Errors
///
/// Returns [`AbliterationError::Index`] if a variable has no entry in
/// `params`, [`AbliterationError::Model`] if a copy fails, or
/// [`AbliterationError::State`] if the lock is poisoned.
pub fn load_varmap_parameters(varmap: &VarMap, params: &HashMap<String, Tensor>) -> Result<()> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| AbliterationError::State("variable map lock poisoned".into()))?;
    for (name, var) in data.iter() {
        let value = params
            .get(name)
            .ok_or_else(|| AbliterationError::Index(format!("parameter `{name}` missing")))?;
        let value = value.to_device(var.device())?.to_dtype(var.dtype())?;
        var.set(&value)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
