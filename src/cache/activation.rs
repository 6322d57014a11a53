// SPDX-License-Identifier: MIT OR Apache-2.0

//! Pooled per-site activation records.

use std::collections::BTreeMap;

use candle_core::{D, Tensor};

use crate::checkpoint::detach_to_cpu;
use crate::error::{AbliterationError, Result};
use crate::hooks::HookPoint;

/// Mean of the last `window` positions of a captured activation.
///
/// A window of `0` is treated as `1`; a window longer than the sequence
/// covers the whole sequence.
///
/// # Shapes
/// - `activation`: `[batch, seq, d_model]`
/// - returns: `[batch, d_model]`
///
/// # Errors
///
/// Returns [`AbliterationError::Shape`] if `activation` is not 3-D.
pub fn pool_last(activation: &Tensor, window: usize) -> Result<Tensor> {
    let [_, seq, _] = activation.dims() else {
        return Err(AbliterationError::Shape(format!(
            "expected [batch, seq, d_model] activation, got {:?}",
            activation.dims()
        )));
    };
    let window = window.clamp(1, (*seq).max(1));
    let tail = activation.narrow(1, seq - window, window)?;
    Ok(tail.mean(1)?)
}

/// Pooled activations per site, one row per prompt.
///
/// All tensors live on the CPU and have shape `[num_prompts, d_model]`.
/// Rows are in the order prompts were cached.
///
/// # Example
///
/// ```
/// use candle_abliterate::{ActivationStore, HookPoint};
/// use candle_core::{DType, Device, Tensor};
///
/// let mut store = ActivationStore::new();
/// let batch = Tensor::zeros((2, 16), DType::F32, &Device::Cpu).unwrap();
/// store.append(HookPoint::ResidPost(3), &batch).unwrap();
/// store.append(HookPoint::ResidPost(3), &batch).unwrap();
/// assert_eq!(store.num_prompts(), 4);
/// assert_eq!(store.hidden_size(), Some(16));
/// ```
#[derive(Debug, Clone, Default)]
pub struct ActivationStore {
    /// `[num_prompts, d_model]` per site, ordered by hook point.
    records: BTreeMap<HookPoint, Tensor>,
}

impl ActivationStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append pooled rows for `site`, copying them to the CPU.
    ///
    /// # Shapes
    /// - `rows`: `[batch, d_model]`
    ///
    /// # Errors
    ///
    /// Returns [`AbliterationError::Shape`] if `rows` is not 2-D or its width
    /// differs from rows already stored for `site`.
    pub fn append(&mut self, site: HookPoint, rows: &Tensor) -> Result<()> {
        let [_, width] = rows.dims() else {
            return Err(AbliterationError::Shape(format!(
                "pooled rows for `{site}` must be 2-D, got {:?}",
                rows.dims()
            )));
        };
        let rows = detach_to_cpu(rows)?;
        match self.records.get_mut(&site) {
            Some(existing) => {
                let stored = existing.dim(D::Minus1)?;
                if stored != *width {
                    return Err(AbliterationError::Shape(format!(
                        "site `{site}` holds width {stored}, got {width}"
                    )));
                }
                *existing = Tensor::cat(&[&*existing, &rows], 0)?;
            }
            None => {
                self.records.insert(site, rows);
            }
        }
        Ok(())
    }

    /// Insert (or replace) the full record of `site`.
    pub fn insert(&mut self, site: HookPoint, record: Tensor) {
        self.records.insert(site, record);
    }

    /// Record for `site`, if cached.
    #[must_use]
    pub fn get(&self, site: &HookPoint) -> Option<&Tensor> {
        self.records.get(site)
    }

    /// Record for `site`.
    ///
    /// # Errors
    ///
    /// Returns [`AbliterationError::Index`] if `site` is not cached.
    pub fn require(&self, site: &HookPoint) -> Result<&Tensor> {
        self.records
            .get(site)
            .ok_or_else(|| AbliterationError::Index(format!("site `{site}` not in activation cache")))
    }

    /// Whether `site` is cached.
    #[must_use]
    pub fn contains(&self, site: &HookPoint) -> bool {
        self.records.contains_key(site)
    }

    /// Cached sites in order.
    pub fn sites(&self) -> impl Iterator<Item = &HookPoint> {
        self.records.keys()
    }

    /// Iterate over `(site, record)` in site order.
    pub fn iter(&self) -> impl Iterator<Item = (&HookPoint, &Tensor)> {
        self.records.iter()
    }

    /// Number of cached sites.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no site is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Number of prompt rows (taken from the first site).
    #[must_use]
    pub fn num_prompts(&self) -> usize {
        self.records
            .values()
            .next()
            .and_then(|t| t.dim(0).ok())
            .unwrap_or(0)
    }

    /// Width of the records (taken from the first site).
    #[must_use]
    pub fn hidden_size(&self) -> Option<usize> {
        self.records.values().next().and_then(|t| t.dim(D::Minus1).ok())
    }

    /// Forget every record.
    pub fn clear(&mut self) {
        self.records.clear();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
