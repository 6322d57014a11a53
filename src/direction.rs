// SPDX-License-Identifier: MIT OR Apache-2.0

//! Mean activations and refusal directions.
//!
//! A refusal direction at a site is the normalised difference between the
//! mean harmful and mean harmless activation there. All arithmetic runs in
//! `f32` on the CPU, where the activation stores live.

use candle_core::{DType, Tensor};

use crate::abliterator::AbliterationContext;
use crate::cache::ActivationStore;
use crate::error::{AbliterationError, Result};
use crate::hooks::HookPoint;

/// Norm at or below which a mean difference counts as zero.
const DEGENERATE_NORM: f32 = f32::EPSILON;

/// Unit vector in residual space tied to one activation site.
#[derive(Debug, Clone)]
pub struct Direction {
    /// Site the direction was derived at.
    pub site: HookPoint,
    /// `[d_model]`, `f32`, on the CPU. All zeros when `degenerate`.
    pub vector: Tensor,
    /// The mean difference had zero norm; `vector` is not a unit vector.
    pub degenerate: bool,
}

/// Per-split means at one site.
#[derive(Debug, Clone)]
pub struct MeanDirs {
    /// Mean harmful activation, `[d_model]`.
    pub harmful_mean: Tensor,
    /// Mean harmless activation, `[d_model]`.
    pub harmless_mean: Tensor,
    /// Mean over both splits together, when requested.
    pub overall_mean: Option<Tensor>,
}

/// Means of both stores at `site`.
///
/// The overall mean sums and halves when both records have the same shape
/// and device, and concatenates first otherwise; both give the mean over
/// every row when the row counts match.
///
/// # Errors
///
/// Returns [`AbliterationError::Index`] if `site` is missing from either
/// store or the widths differ.
pub fn mean_dirs(
    harmful: &ActivationStore,
    harmless: &ActivationStore,
    site: &HookPoint,
    include_overall: bool,
) -> Result<MeanDirs> {
    let bad = harmful.require(site)?.to_dtype(DType::F32)?;
    let good = harmless.require(site)?.to_dtype(DType::F32)?;
    let (bad_width, good_width) = (bad.dim(1)?, good.dim(1)?);
    if bad_width != good_width {
        return Err(AbliterationError::Index(format!(
            "site `{site}` has width {bad_width} (harmful) vs {good_width} (harmless)"
        )));
    }

    let overall_mean = if !include_overall {
        None
    } else if bad.dims() == good.dims() && bad.device().same_device(good.device()) {
        Some(((&bad + &good)?.mean(0)? / 2.0)?)
    } else {
        Some(Tensor::cat(&[&bad, &good], 0)?.mean(0)?)
    };

    Ok(MeanDirs {
        harmful_mean: bad.mean(0)?,
        harmless_mean: good.mean(0)?,
        overall_mean,
    })
}

/// Verify both stores cover the same sites with the same width.
///
/// # Errors
///
/// Returns [`AbliterationError::Index`] naming the first mismatch.
pub fn check_compatible(harmful: &ActivationStore, harmless: &ActivationStore) -> Result<()> {
    if let Some(site) = harmful.sites().find(|s| !harmless.contains(s)) {
        return Err(AbliterationError::Index(format!(
            "site `{site}` cached for harmful prompts only"
        )));
    }
    if let Some(site) = harmless.sites().find(|s| !harmful.contains(s)) {
        return Err(AbliterationError::Index(format!(
            "site `{site}` cached for harmless prompts only"
        )));
    }
    if harmful.hidden_size() != harmless.hidden_size() {
        return Err(AbliterationError::Index(format!(
            "activation width differs: {:?} (harmful) vs {:?} (harmless)",
            harmful.hidden_size(),
            harmless.hidden_size()
        )));
    }
    Ok(())
}

/// Refusal direction of every cached site outside layer 0.
///
/// `normalize(harmful_mean - harmless_mean)`, reversed when `invert`.
/// Layer 0 is skipped: its activations are dominated by the embedding.
///
/// # Errors
///
/// Returns [`AbliterationError::State`] if either store is empty and
/// [`AbliterationError::Index`] if the stores are incompatible.
pub fn refusal_dirs(
    harmful: &ActivationStore,
    harmless: &ActivationStore,
    invert: bool,
) -> Result<Vec<Direction>> {
    if harmful.is_empty() || harmless.is_empty() {
        return Err(AbliterationError::State(
            "no activation cache; call cache_activations first".into(),
        ));
    }
    check_compatible(harmful, harmless)?;

    harmful
        .sites()
        .filter(|site| site.layer() != Some(0))
        .map(|site| {
            let means = mean_dirs(harmful, harmless, site, false)?;
            let diff = if invert {
                (means.harmless_mean - means.harmful_mean)?
            } else {
                (means.harmful_mean - means.harmless_mean)?
            };
            normalize(site, &diff)
        })
        .collect()
}

/// Unit vector along `diff`, or a flagged zero vector.
fn normalize(site: &HookPoint, diff: &Tensor) -> Result<Direction> {
    let norm = diff.sqr()?.sum_all()?.sqrt()?.to_scalar::<f32>()?;
    if !norm.is_finite() || norm <= DEGENERATE_NORM {
        tracing::warn!(%site, norm, "degenerate refusal direction");
        return Ok(Direction {
            site: site.clone(),
            vector: diff.zeros_like()?,
            degenerate: true,
        });
    }
    Ok(Direction {
        site: site.clone(),
        vector: (diff / f64::from(norm))?,
        degenerate: false,
    })
}

/// Sort directions by descending absolute mean component.
///
/// A coarse salience ranking.
///
/// # Errors
///
/// Returns [`AbliterationError::Model`] if a mean cannot be computed.
pub fn rank_by_salience(directions: Vec<Direction>) -> Result<Vec<Direction>> {
    let mut keyed = directions
        .into_iter()
        .map(|d| Ok((d.vector.mean_all()?.to_scalar::<f32>()?.abs(), d)))
        .collect::<Result<Vec<_>>>()?;
    keyed.sort_by(|a, b| b.0.total_cmp(&a.0));
    Ok(keyed.into_iter().map(|(_, d)| d).collect())
}

/// Projections of the harmful and harmless means at `site` onto `direction`.
///
/// # Errors
///
/// Returns [`AbliterationError::Index`] if `site` is not cached in both
/// stores and [`AbliterationError::Shape`] if `direction` has the wrong
/// width.
pub fn avg_projections(
    harmful: &ActivationStore,
    harmless: &ActivationStore,
    site: &HookPoint,
    direction: &Tensor,
) -> Result<(f32, f32)> {
    let means = mean_dirs(harmful, harmless, site, false)?;
    let direction = direction.to_device(means.harmful_mean.device())?.to_dtype(DType::F32)?;
    if direction.dims() != means.harmful_mean.dims() {
        return Err(AbliterationError::Shape(format!(
            "direction shape {:?} does not match activation shape {:?}",
            direction.dims(),
            means.harmful_mean.dims()
        )));
    }
    let dot = |mean: &Tensor| -> Result<f32> {
        Ok((mean * &direction)?.sum_all()?.to_scalar::<f32>()?)
    };
    Ok((dot(&means.harmful_mean)?, dot(&means.harmless_mean)?))
}

// ---------------------------------------------------------------------------
// Context operations
// ---------------------------------------------------------------------------

impl AbliterationContext {
    /// Refusal directions from the cached activations.
    ///
    /// # Errors
    ///
    /// See [`refusal_dirs`].
    pub fn refusal_dirs(&self, invert: bool) -> Result<Vec<Direction>> {
        refusal_dirs(&self.harmful, &self.harmless, invert)
    }

    /// Refusal directions at the configured sites of whitelisted layers,
    /// most salient first.
    ///
    /// # Errors
    ///
    /// See [`refusal_dirs`].
    pub fn scored_dirs(&self, invert: bool) -> Result<Vec<Direction>> {
        let layers = self.whitelisted_layers();
        let selected = self
            .refusal_dirs(invert)?
            .into_iter()
            .filter(|d| {
                d.site.layer().is_some_and(|l| layers.contains(&l))
                    && self.sites.iter().any(|s| s == d.site.site_name())
            })
            .collect();
        rank_by_salience(selected)
    }

    /// Mean activations at `site` (default: the primary site) of `layer`.
    ///
    /// # Errors
    ///
    /// Returns [`AbliterationError::Index`] if `layer` is out of range or
    /// the site is not cached, and [`AbliterationError::State`] if nothing
    /// is cached.
    pub fn layer_dirs(
        &self,
        layer: usize,
        site: Option<&str>,
        include_overall: bool,
    ) -> Result<MeanDirs> {
        self.check_layer(layer)?;
        self.require_cache()?;
        let name = match site {
            Some(name) => name,
            None => self
                .sites
                .first()
                .map(String::as_str)
                .ok_or_else(|| AbliterationError::Config("no activation sites configured".into()))?,
        };
        mean_dirs(
            &self.harmful,
            &self.harmless,
            &HookPoint::for_site(name, layer),
            include_overall,
        )
    }

    /// Average projections of the cached means at `site` onto `direction`,
    /// as `(harmful, harmless)`.
    ///
    /// # Errors
    ///
    /// Returns [`AbliterationError::State`] if nothing is cached; see also
    /// [`avg_projections`].
    pub fn avg_projections(&self, site: &HookPoint, direction: &Tensor) -> Result<(f32, f32)> {
        self.require_cache()?;
        avg_projections(&self.harmful, &self.harmless, site, direction)
    }

    /// Fail unless both activation stores hold something.
    pub(crate) fn require_cache(&self) -> Result<()> {
        if self.harmful.is_empty() || self.harmless.is_empty() {
            return Err(AbliterationError::State(
                "no activation cache; call cache_activations first".into(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
