// SPDX-License-Identifier: MIT OR Apache-2.0

//! Weight surgery: projecting a direction out of (or into) per-layer
//! output matrices, with a log of every edit.
//!
//! The pure helpers [`project`] and [`orthogonal_complement`] work on any
//! `[..., d_model]` tensor, so the same arithmetic serves both weight
//! ablation and activation-time ablation
//! ([`Intervention::Ablate`](crate::Intervention::Ablate)).

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use candle_core::{D, DType, Tensor};

use crate::abliterator::AbliterationContext;
use crate::checkpoint::detach_to_cpu;
use crate::error::{AbliterationError, Result};
use crate::hooks::HookPoint;

// ---------------------------------------------------------------------------
// Projection arithmetic
// ---------------------------------------------------------------------------

/// Dtype used for projection arithmetic on `dtype` inputs.
const fn compute_dtype(dtype: DType) -> DType {
    match dtype {
        // PROMOTE: half-precision dot products lose the small components we remove
        DType::BF16 | DType::F16 => DType::F32,
        other => other,
    }
}

/// Component of every row of `matrix` along the unit `direction`.
///
/// `(matrix · direction) ⊗ direction`, broadcast over all leading
/// dimensions.
///
/// # Shapes
/// - `matrix`: `[..., d_model]`
/// - `direction`: `[d_model]`
/// - returns: same shape as `matrix`
///
/// # Errors
///
/// Returns [`AbliterationError::Shape`] if `direction` is not 1-D or its
/// width differs from the last dimension of `matrix`.
pub fn project(matrix: &Tensor, direction: &Tensor) -> Result<Tensor> {
    let dtype = matrix.dtype();
    let projection = project_in(matrix, direction, compute_dtype(dtype))?;
    Ok(projection.to_dtype(dtype)?)
}

/// `matrix - project(matrix, direction)`.
///
/// # Shapes
/// - `matrix`: `[..., d_model]`
/// - `direction`: `[d_model]`
/// - returns: same shape as `matrix`
///
/// # Errors
///
/// Same as [`project`].
pub fn orthogonal_complement(matrix: &Tensor, direction: &Tensor) -> Result<Tensor> {
    let dtype = matrix.dtype();
    let compute = compute_dtype(dtype);
    let projection = project_in(matrix, direction, compute)?;
    let complement = (matrix.to_dtype(compute)? - projection)?;
    Ok(complement.to_dtype(dtype)?)
}

/// Projection computed in `compute` dtype, not converted back.
fn project_in(matrix: &Tensor, direction: &Tensor, compute: DType) -> Result<Tensor> {
    let width = match direction.dims() {
        [w] => *w,
        dims => {
            return Err(AbliterationError::Shape(format!(
                "direction must be 1-D, got shape {dims:?}"
            )));
        }
    };
    let matrix_width = matrix.dim(D::Minus1)?;
    if width != matrix_width {
        return Err(AbliterationError::Shape(format!(
            "direction width {width} does not match matrix width {matrix_width}"
        )));
    }

    let dir = direction.to_device(matrix.device())?.to_dtype(compute)?;
    let m = matrix.to_dtype(compute)?.contiguous()?;
    let single_row = m.rank() == 1;
    let m = if single_row { m.unsqueeze(0)? } else { m };

    // [..., d] @ [d, 1] -> [..., 1], then scale the direction per row.
    let coefficients = m.broadcast_matmul(&dir.reshape((width, 1))?)?;
    let projection = coefficients.broadcast_mul(&dir)?;

    if single_row {
        Ok(projection.squeeze(0)?)
    } else {
        Ok(projection)
    }
}

// ---------------------------------------------------------------------------
// WeightKind
// ---------------------------------------------------------------------------

/// Which per-layer output matrix an edit targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WeightKind {
    /// Attention output projection (`W_O`).
    AttnOut,
    /// MLP output projection (`W_out` / `down_proj`).
    MlpOut,
}

impl WeightKind {
    /// Both kinds, in edit order.
    pub const ALL: [Self; 2] = [Self::AttnOut, Self::MlpOut];

    /// Short name used in logs and persisted bundles.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::AttnOut => "attn_out",
            Self::MlpOut => "mlp_out",
        }
    }
}

impl fmt::Display for WeightKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for WeightKind {
    type Err = AbliterationError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "attn_out" => Ok(Self::AttnOut),
            "mlp_out" => Ok(Self::MlpOut),
            other => Err(AbliterationError::Bundle(format!(
                "unknown weight kind `{other}`"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// ModificationLog
// ---------------------------------------------------------------------------

/// One recorded overwrite of a weight matrix. Both tensors live on the CPU.
#[derive(Debug, Clone)]
pub struct WeightEdit {
    /// Matrix before the write.
    pub previous: Tensor,
    /// Matrix written.
    pub replacement: Tensor,
}

/// Ordered history of weight edits, per weight kind and layer.
///
/// Cloning is cheap: recorded tensors are immutable CPU copies shared by
/// reference count.
#[derive(Debug, Clone, Default)]
pub struct ModificationLog {
    /// Edits keyed by `(kind, layer)`, oldest first.
    edits: BTreeMap<(WeightKind, usize), Vec<WeightEdit>>,
}

impl ModificationLog {
    /// Create an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an edit for `(kind, layer)`.
    pub fn record(&mut self, kind: WeightKind, layer: usize, edit: WeightEdit) {
        self.edits.entry((kind, layer)).or_default().push(edit);
    }

    /// Edits recorded for `(kind, layer)`, oldest first.
    #[must_use]
    pub fn edits(&self, kind: WeightKind, layer: usize) -> &[WeightEdit] {
        self.edits.get(&(kind, layer)).map_or(&[], Vec::as_slice)
    }

    /// Remove and return the most recent edit for `(kind, layer)`.
    pub fn pop_last(&mut self, kind: WeightKind, layer: usize) -> Option<WeightEdit> {
        let list = self.edits.get_mut(&(kind, layer))?;
        let edit = list.pop();
        if list.is_empty() {
            self.edits.remove(&(kind, layer));
        }
        edit
    }

    /// Layers of `kind` with at least one edit, ascending.
    #[must_use]
    pub fn layers(&self, kind: WeightKind) -> Vec<usize> {
        self.edits
            .keys()
            .filter(|(k, _)| *k == kind)
            .map(|(_, layer)| *layer)
            .collect()
    }

    /// Iterate over `(kind, layer, edits)` in key order.
    pub fn iter(&self) -> impl Iterator<Item = (WeightKind, usize, &[WeightEdit])> {
        self.edits
            .iter()
            .map(|((kind, layer), edits)| (*kind, *layer, edits.as_slice()))
    }

    /// Total number of recorded edits.
    #[must_use]
    pub fn num_edits(&self) -> usize {
        self.edits.values().map(Vec::len).sum()
    }

    /// Whether no edit has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.edits.is_empty()
    }

    /// Forget every edit.
    pub fn clear(&mut self) {
        self.edits.clear();
    }
}

// ---------------------------------------------------------------------------
// Surgery on the context
// ---------------------------------------------------------------------------

impl AbliterationContext {
    /// Read the `kind` matrix at `layer`, optionally overwriting it first.
    ///
    /// A replacement is moved to the matrix's device and dtype, written,
    /// and logged as `(previous, replacement)`. Blacklisted layers ignore
    /// the replacement. Always returns the current matrix.
    ///
    /// # Errors
    ///
    /// Returns [`AbliterationError::Index`] if `layer` is out of range and
    /// [`AbliterationError::Shape`] if the replacement shape differs.
    pub fn layer_weight(
        &mut self,
        layer: usize,
        kind: WeightKind,
        replacement: Option<&Tensor>,
    ) -> Result<Tensor> {
        self.check_layer(layer)?;
        let current = self.backend.weight(layer, kind)?;

        let Some(replacement) = replacement else {
            return Ok(current);
        };
        if self.blacklist.contains(&layer) {
            tracing::debug!(layer, %kind, "skipping write to blacklisted layer");
            return Ok(current);
        }
        if replacement.dims() != current.dims() {
            return Err(AbliterationError::Shape(format!(
                "replacement shape {:?} does not match {kind} shape {:?} at layer {layer}",
                replacement.dims(),
                current.dims()
            )));
        }

        let previous = detach_to_cpu(&current)?;
        let written = replacement
            .to_device(current.device())?
            .to_dtype(current.dtype())?;
        let logged = detach_to_cpu(&written)?;
        self.backend.set_weight(layer, kind, written)?;
        self.log.record(
            kind,
            layer,
            WeightEdit {
                previous,
                replacement: logged,
            },
        );
        self.modified = true;

        self.backend.weight(layer, kind)
    }

    /// Read (and optionally overwrite) the attention output matrix.
    ///
    /// # Errors
    ///
    /// See [`layer_weight`](Self::layer_weight).
    pub fn layer_attn(&mut self, layer: usize, replacement: Option<&Tensor>) -> Result<Tensor> {
        self.layer_weight(layer, WeightKind::AttnOut, replacement)
    }

    /// Read (and optionally overwrite) the MLP output matrix.
    ///
    /// # Errors
    ///
    /// See [`layer_weight`](Self::layer_weight).
    pub fn layer_mlp(&mut self, layer: usize, replacement: Option<&Tensor>) -> Result<Tensor> {
        self.layer_weight(layer, WeightKind::MlpOut, replacement)
    }

    /// Ablate each direction from the selected matrices of `layers`
    /// (default: every layer but 0).
    ///
    /// Directions are applied in order onto the already-edited matrices,
    /// so the edits accumulate.
    ///
    /// # Errors
    ///
    /// Returns [`AbliterationError::Index`] for an out-of-range layer and
    /// [`AbliterationError::Shape`] for a direction of the wrong width.
    pub fn apply_refusal_dirs(
        &mut self,
        directions: &[Tensor],
        attn: bool,
        mlp: bool,
        layers: Option<&[usize]>,
    ) -> Result<()> {
        let layers = self.target_layers(layers);
        for direction in directions {
            for &layer in &layers {
                for kind in selected_kinds(attn, mlp) {
                    let matrix = self.layer_weight(layer, kind, None)?;
                    let ablated = orthogonal_complement(&matrix, direction)?;
                    self.layer_weight(layer, kind, Some(&ablated))?;
                }
            }
        }
        tracing::debug!(
            directions = directions.len(),
            layers = layers.len(),
            "applied refusal directions"
        );
        Ok(())
    }

    /// Push the model toward expressing `direction` instead of removing it.
    ///
    /// Each selected matrix loses its projection onto `direction` and gains
    /// `direction` scaled by the harmful mean's projection at the layer's
    /// primary activation site. Experimental: the scaling has not been
    /// tuned and results vary by model.
    ///
    /// # Errors
    ///
    /// Returns [`AbliterationError::State`] if no activation cache exists,
    /// and [`AbliterationError::Index`] if the primary site of a layer is
    /// not cached.
    pub fn induce_refusal_dir(
        &mut self,
        direction: &Tensor,
        attn: bool,
        mlp: bool,
        layers: Option<&[usize]>,
    ) -> Result<()> {
        let primary = self
            .sites
            .first()
            .cloned()
            .ok_or_else(|| AbliterationError::Config("no activation sites configured".into()))?;

        for layer in self.target_layers(layers) {
            let site = HookPoint::for_site(&primary, layer);
            let (harmful_projection, _) = self.avg_projections(&site, direction)?;
            let added = (direction.to_dtype(DType::F32)? * f64::from(harmful_projection))?;

            for kind in selected_kinds(attn, mlp) {
                let matrix = self.layer_weight(layer, kind, None)?;
                let complement = orthogonal_complement(&matrix, direction)?;
                let added = added
                    .to_device(complement.device())?
                    .to_dtype(complement.dtype())?;
                let induced = complement.broadcast_add(&added)?;
                self.layer_weight(layer, kind, Some(&induced))?;
            }
        }
        Ok(())
    }

    /// Undo the most recent logged edit of `kind` at `layer`.
    ///
    /// Returns `false` when there is nothing to undo or the layer is
    /// blacklisted.
    ///
    /// # Errors
    ///
    /// Returns [`AbliterationError::Index`] if `layer` is out of range.
    pub fn undo_last_edit(&mut self, kind: WeightKind, layer: usize) -> Result<bool> {
        self.check_layer(layer)?;
        if self.blacklist.contains(&layer) {
            return Ok(false);
        }
        let Some(edit) = self.log.pop_last(kind, layer) else {
            return Ok(false);
        };
        let current = self.backend.weight(layer, kind)?;
        let restored = edit
            .previous
            .to_device(current.device())?
            .to_dtype(current.dtype())?;
        self.backend.set_weight(layer, kind, restored)?;
        self.modified = !self.log.is_empty();
        Ok(true)
    }

    /// Resolve an optional layer list to the default "all but layer 0".
    fn target_layers(&self, layers: Option<&[usize]>) -> Vec<usize> {
        layers.map_or_else(
            || (1..self.backend.num_layers()).collect(),
            <[usize]>::to_vec,
        )
    }
}

/// Weight kinds selected by the `attn` / `mlp` flags, in edit order.
fn selected_kinds(attn: bool, mlp: bool) -> impl Iterator<Item = WeightKind> {
    WeightKind::ALL.into_iter().filter(move |kind| match kind {
        WeightKind::AttnOut => attn,
        WeightKind::MlpOut => mlp,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn projection_of_rows() {
        let device = Device::Cpu;
        let m = Tensor::new(&[[3.0_f32, 4.0], [1.0, -2.0]], &device).unwrap();
        let d = Tensor::new(&[1.0_f32, 0.0], &device).unwrap();

        let p = project(&m, &d).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(p, vec![vec![3.0, 0.0], vec![1.0, 0.0]]);

        let c = orthogonal_complement(&m, &d).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(c, vec![vec![0.0, 4.0], vec![0.0, -2.0]]);
    }

    #[test]
    fn orthogonal_direction_projects_to_zero() {
        let device = Device::Cpu;
        let m = Tensor::new(&[[1.5_f32, -2.0, 0.0], [7.0, 0.25, 0.0]], &device).unwrap();
        let d = Tensor::new(&[0.0_f32, 0.0, 1.0], &device).unwrap();

        let p = project(&m, &d).unwrap().to_vec2::<f32>().unwrap();
        assert!(p.iter().flatten().all(|&x| x == 0.0));

        let c = orthogonal_complement(&m, &d).unwrap();
        assert_eq!(c.to_vec2::<f32>().unwrap(), m.to_vec2::<f32>().unwrap());
    }

    #[test]
    fn projection_broadcasts_over_leading_dims() {
        let device = Device::Cpu;
        // [heads=2, d_head=1, d_model=2], like an attention W_O.
        let m = Tensor::new(&[[[2.0_f32, 2.0]], [[0.0, 5.0]]], &device).unwrap();
        let d = Tensor::new(&[0.0_f32, 1.0], &device).unwrap();
        let c = orthogonal_complement(&m, &d).unwrap();
        assert_eq!(c.dims(), &[2, 1, 2]);
        let flat: Vec<f32> = c.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(flat, vec![2.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn single_vector_projection() {
        let device = Device::Cpu;
        let v = Tensor::new(&[2.0_f32, 3.0], &device).unwrap();
        let d = Tensor::new(&[0.0_f32, 1.0], &device).unwrap();
        let p = project(&v, &d).unwrap();
        assert_eq!(p.to_vec1::<f32>().unwrap(), vec![0.0, 3.0]);
    }

    #[test]
    fn bf16_matrix_keeps_dtype() {
        let device = Device::Cpu;
        let m = Tensor::new(&[[1.0_f32, 1.0]], &device)
            .unwrap()
            .to_dtype(DType::BF16)
            .unwrap();
        let d = Tensor::new(&[1.0_f32, 0.0], &device).unwrap();
        let c = orthogonal_complement(&m, &d).unwrap();
        assert_eq!(c.dtype(), DType::BF16);
        let c: Vec<f32> = c
            .to_dtype(DType::F32)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert_eq!(c, vec![0.0, 1.0]);
    }

    #[test]
    fn width_mismatch_is_a_shape_error() {
        let device = Device::Cpu;
        let m = Tensor::zeros((2, 3), DType::F32, &device).unwrap();
        let d = Tensor::zeros(4, DType::F32, &device).unwrap();
        assert!(matches!(
            project(&m, &d),
            Err(AbliterationError::Shape(_))
        ));
        let d2 = Tensor::zeros((1, 3), DType::F32, &device).unwrap();
        assert!(matches!(
            project(&m, &d2),
            Err(AbliterationError::Shape(_))
        ));
    }

    #[test]
    fn log_records_and_pops_in_order() {
        let device = Device::Cpu;
        let t = |v: f32| Tensor::new(&[v], &device).unwrap();
        let mut log = ModificationLog::new();
        assert!(log.is_empty());

        log.record(WeightKind::AttnOut, 2, WeightEdit { previous: t(0.0), replacement: t(1.0) });
        log.record(WeightKind::AttnOut, 2, WeightEdit { previous: t(1.0), replacement: t(2.0) });
        log.record(WeightKind::MlpOut, 1, WeightEdit { previous: t(5.0), replacement: t(6.0) });

        assert_eq!(log.num_edits(), 3);
        assert_eq!(log.layers(WeightKind::AttnOut), vec![2]);
        assert_eq!(log.edits(WeightKind::AttnOut, 2).len(), 2);
        assert!(log.edits(WeightKind::AttnOut, 7).is_empty());

        let last = log.pop_last(WeightKind::AttnOut, 2).unwrap();
        assert_eq!(last.replacement.to_vec1::<f32>().unwrap(), vec![2.0]);
        assert_eq!(log.num_edits(), 2);

        log.pop_last(WeightKind::AttnOut, 2).unwrap();
        assert!(log.layers(WeightKind::AttnOut).is_empty());
        assert!(log.pop_last(WeightKind::AttnOut, 2).is_none());
    }

    #[test]
    fn weight_kind_names_roundtrip() {
        for kind in WeightKind::ALL {
            assert_eq!(kind.name().parse::<WeightKind>().unwrap(), kind);
        }
        assert!("q_proj".parse::<WeightKind>().is_err());
    }
}
