// SPDX-License-Identifier: MIT OR Apache-2.0

//! Activation sites and the hook protocol between us and a backend.
//!
//! A [`HookPoint`] names one residual-width activation inside a layer and
//! doubles as the key of an activation record. A [`HookSpec`] travels into
//! [`AbliterationBackend::forward`](crate::AbliterationBackend::forward)
//! saying which sites to copy out and which [`Intervention`]s to run there;
//! the backend answers with a [`HookCache`].
//!
//! Sites a backend never reaches are not an error: they simply have no
//! entry in the returned cache.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

use candle_core::Tensor;

use crate::error::{AbliterationError, Result};
use crate::surgery;

// ---------------------------------------------------------------------------
// HookPoint
// ---------------------------------------------------------------------------

/// A per-layer activation site, `[batch, seq, d_model]` at run time.
///
/// Renders as `blocks.{layer}.hook_{site}`:
///
/// ```
/// use candle_abliterate::HookPoint;
///
/// let site = HookPoint::for_site("resid_post", 5);
/// assert_eq!(site, HookPoint::ResidPost(5));
/// assert_eq!(site.to_string(), "blocks.5.hook_resid_post");
/// assert_eq!("blocks.5.hook_resid_post".parse::<HookPoint>().unwrap(), site);
/// ```
///
/// Ordering follows the forward pass within a layer (`resid_pre` first,
/// `resid_post` last), so sorted collections walk sites in execution order
/// per layer index.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HookPoint {
    /// Residual stream entering layer `i`.
    ResidPre(usize),
    /// Attention block output of layer `i`, before it joins the residual.
    AttnOut(usize),
    /// Residual stream between attention and MLP of layer `i`.
    ResidMid(usize),
    /// MLP block output of layer `i`, before it joins the residual.
    MlpOut(usize),
    /// Residual stream leaving layer `i`.
    ResidPost(usize),
    /// Any other name, kept verbatim. No backend is required to fill it.
    Custom(String),
}

impl HookPoint {
    /// Site at `layer` for a short name (`resid_pre`, `resid_mid`,
    /// `resid_post`, `attn_out`, `mlp_out`).
    ///
    /// Other names become `Custom("blocks.{layer}.{name}")`.
    #[must_use]
    pub fn for_site(name: &str, layer: usize) -> Self {
        match name {
            "resid_pre" => Self::ResidPre(layer),
            "attn_out" => Self::AttnOut(layer),
            "resid_mid" => Self::ResidMid(layer),
            "mlp_out" => Self::MlpOut(layer),
            "resid_post" => Self::ResidPost(layer),
            other => Self::Custom(format!("blocks.{layer}.{other}")),
        }
    }

    /// Layer of the site. Custom names yield their first numeric segment.
    #[must_use]
    pub fn layer(&self) -> Option<usize> {
        match self {
            Self::ResidPre(layer)
            | Self::AttnOut(layer)
            | Self::ResidMid(layer)
            | Self::MlpOut(layer)
            | Self::ResidPost(layer) => Some(*layer),
            Self::Custom(name) => name.split('.').find_map(|seg| seg.parse().ok()),
        }
    }

    /// Short site name; the last dotted segment for custom names.
    #[must_use]
    pub fn site_name(&self) -> &str {
        match self {
            Self::ResidPre(_) => "resid_pre",
            Self::AttnOut(_) => "attn_out",
            Self::ResidMid(_) => "resid_mid",
            Self::MlpOut(_) => "mlp_out",
            Self::ResidPost(_) => "resid_post",
            Self::Custom(name) => name.rsplit('.').next().unwrap_or(name),
        }
    }
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self, self.layer()) {
            (Self::Custom(name), _) => f.write_str(name),
            (site, Some(layer)) => write!(f, "blocks.{layer}.hook_{}", site.site_name()),
            (site, None) => f.write_str(site.site_name()),
        }
    }
}

impl From<&str> for HookPoint {
    fn from(name: &str) -> Self {
        let known = name
            .strip_prefix("blocks.")
            .and_then(|rest| rest.split_once(".hook_"))
            .and_then(|(layer, site)| Some((layer.parse::<usize>().ok()?, site)))
            .map(|(layer, site)| Self::for_site(site, layer))
            .filter(|point| !matches!(point, Self::Custom(_)));
        known.unwrap_or_else(|| Self::Custom(name.to_string()))
    }
}

/// Never fails: unknown names become [`HookPoint::Custom`].
impl FromStr for HookPoint {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self::from(s))
    }
}

// ---------------------------------------------------------------------------
// Intervention
// ---------------------------------------------------------------------------

/// Rewrite of an activation while the forward pass runs.
///
/// Crate operations build `Ablate` themselves. `Replace` and `Add` are for
/// callers: push them onto the session spec through
/// [`hooks_mut`](crate::AbliterationContext::hooks_mut) and every later
/// generation, measurement and cache run applies them.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub enum Intervention {
    /// Use this tensor instead of the activation.
    Replace(Tensor),
    /// Add a (broadcast) vector to the activation.
    Add(Tensor),
    /// Project a unit `[d_model]` direction out of every position.
    Ablate(Tensor),
}

/// Run one intervention on the activation at a hook point.
///
/// # Shapes
/// - `tensor`: `[..., d_model]`
/// - returns: same shape as `tensor` (except for `Replace`, which returns
///   its tensor as given)
///
/// # Errors
///
/// Returns [`AbliterationError::Shape`] if an ablation direction has the
/// wrong width, and [`AbliterationError::Model`] if broadcasting fails.
pub fn apply_intervention(tensor: &Tensor, intervention: &Intervention) -> Result<Tensor> {
    match intervention {
        // BORROW: explicit .clone(): the `HookSpec` keeps its tensor for later steps
        Intervention::Replace(value) => Ok(value.clone()),
        Intervention::Add(delta) => Ok(tensor.broadcast_add(delta)?),
        Intervention::Ablate(direction) => surgery::orthogonal_complement(tensor, direction),
    }
}

// ---------------------------------------------------------------------------
// HookSpec
// ---------------------------------------------------------------------------

/// Sites to capture and interventions to run during one forward pass.
///
/// ```
/// use candle_abliterate::{HookPoint, HookSpec};
///
/// let mut hooks = HookSpec::new();
/// hooks.capture(HookPoint::ResidPre(1)).capture("blocks.1.hook_mlp_out");
/// assert!(hooks.is_captured(&HookPoint::MlpOut(1)));
/// ```
#[derive(Debug, Clone, Default)]
pub struct HookSpec {
    /// Sites copied into the [`HookCache`].
    captures: BTreeSet<HookPoint>,
    /// Interventions per site, in registration order.
    interventions: BTreeMap<HookPoint, Vec<Intervention>>,
}

impl HookSpec {
    /// No captures, no interventions.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the backend to copy out the activation at `hook`.
    pub fn capture<H: Into<HookPoint>>(&mut self, hook: H) -> &mut Self {
        self.captures.insert(hook.into());
        self
    }

    /// Run `intervention` at `hook`, after any registered earlier.
    pub fn intervene<H: Into<HookPoint>>(&mut self, hook: H, intervention: Intervention) -> &mut Self {
        self.interventions
            .entry(hook.into())
            .or_default()
            .push(intervention);
        self
    }

    /// Add every capture and intervention of `other`; its interventions
    /// run after ours at shared sites.
    pub fn extend_from(&mut self, other: &Self) -> &mut Self {
        // BORROW: explicit .clone(): `other` stays usable
        self.captures.extend(other.captures.iter().cloned());
        for (hook, list) in &other.interventions {
            self.interventions
                .entry(hook.clone())
                .or_default()
                .extend(list.iter().cloned());
        }
        self
    }

    /// Whether `hook` is to be captured.
    #[must_use]
    pub fn is_captured(&self, hook: &HookPoint) -> bool {
        self.captures.contains(hook)
    }

    /// Sites to capture, in order.
    pub fn captures(&self) -> impl Iterator<Item = &HookPoint> {
        self.captures.iter()
    }

    /// Interventions at `hook`, in the order they must run.
    pub fn interventions_at(&self, hook: &HookPoint) -> impl Iterator<Item = &Intervention> {
        self.interventions.get(hook).into_iter().flatten()
    }

    /// Total interventions over all sites.
    #[must_use]
    pub fn num_interventions(&self) -> usize {
        self.interventions.values().map(Vec::len).sum()
    }
}

// ---------------------------------------------------------------------------
// HookCache
// ---------------------------------------------------------------------------

/// What a backend returns from a forward pass: logits plus captures.
#[derive(Debug)]
pub struct HookCache {
    /// `[batch, seq, vocab]` logits.
    logits: Tensor,
    /// Captured activations.
    captures: HashMap<HookPoint, Tensor>,
}

impl HookCache {
    /// Wrap the logits of a forward pass.
    #[must_use]
    pub fn new(logits: Tensor) -> Self {
        Self {
            logits,
            captures: HashMap::new(),
        }
    }

    /// Record the activation seen at `hook`.
    pub fn store(&mut self, hook: HookPoint, activation: Tensor) {
        self.captures.insert(hook, activation);
    }

    /// Activation captured at `hook`, if any.
    #[must_use]
    pub fn get(&self, hook: &HookPoint) -> Option<&Tensor> {
        self.captures.get(hook)
    }

    /// Activation captured at `hook`.
    ///
    /// # Errors
    ///
    /// Returns [`AbliterationError::Hook`] if the backend did not fill it.
    pub fn require(&self, hook: &HookPoint) -> Result<&Tensor> {
        self.get(hook)
            .ok_or_else(|| AbliterationError::Hook(format!("no activation captured at `{hook}`")))
    }

    /// Split into logits and captures.
    #[must_use]
    pub fn into_parts(self) -> (Tensor, HashMap<HookPoint, Tensor>) {
        (self.logits, self.captures)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn names_render_and_parse() {
        for (point, name) in [
            (HookPoint::ResidPre(0), "blocks.0.hook_resid_pre"),
            (HookPoint::AttnOut(2), "blocks.2.hook_attn_out"),
            (HookPoint::ResidMid(11), "blocks.11.hook_resid_mid"),
            (HookPoint::MlpOut(4), "blocks.4.hook_mlp_out"),
            (HookPoint::ResidPost(9), "blocks.9.hook_resid_post"),
        ] {
            assert_eq!(point.to_string(), name);
            assert_eq!(HookPoint::from(name), point);
        }
        let odd = HookPoint::from("blocks.3.hook_q");
        assert_eq!(odd, HookPoint::Custom("blocks.3.hook_q".into()));
        assert_eq!(odd.to_string(), "blocks.3.hook_q");
        assert_eq!(HookPoint::from("blocks.x.hook_resid_pre").layer(), None);
    }

    #[test]
    fn unknown_site_names_stay_custom() {
        let custom = HookPoint::for_site("hook_q", 7);
        assert_eq!(custom, HookPoint::Custom("blocks.7.hook_q".into()));
        assert_eq!(custom.layer(), Some(7));
        assert_eq!(custom.site_name(), "hook_q");
        assert_eq!(HookPoint::for_site("mlp_out", 1).site_name(), "mlp_out");
    }

    #[test]
    fn sites_sort_in_execution_order() {
        let mut sites = vec![
            HookPoint::ResidPost(0),
            HookPoint::ResidPre(1),
            HookPoint::MlpOut(0),
            HookPoint::ResidPre(0),
        ];
        sites.sort();
        assert_eq!(sites.first(), Some(&HookPoint::ResidPre(0)));
        assert_eq!(sites.last(), Some(&HookPoint::ResidPost(0)));
    }

    #[test]
    fn merged_interventions_run_after_ours() {
        let device = Device::Cpu;
        let site = HookPoint::ResidPost(1);
        let mut base = HookSpec::new();
        base.capture(site.clone())
            .intervene(site.clone(), Intervention::Add(Tensor::ones(2, DType::F32, &device).unwrap()));
        let mut extra = HookSpec::new();
        extra.intervene(site.clone(), Intervention::Replace(Tensor::zeros(2, DType::F32, &device).unwrap()));

        base.extend_from(&extra);
        assert_eq!(base.num_interventions(), 2);
        assert_eq!(base.captures().count(), 1);
        let order: Vec<bool> = base
            .interventions_at(&site)
            .map(|i| matches!(i, Intervention::Replace(_)))
            .collect();
        assert_eq!(order, vec![false, true]);
        assert_eq!(base.interventions_at(&HookPoint::ResidPost(2)).count(), 0);
    }

    #[test]
    fn ablation_removes_the_direction() {
        let device = Device::Cpu;
        let act = Tensor::new(&[[[1.0_f32, 2.0, 3.0]]], &device).unwrap();
        let dir = Tensor::new(&[0.0_f32, 1.0, 0.0], &device).unwrap();
        let out = apply_intervention(&act, &Intervention::Ablate(dir)).unwrap();
        let out: Vec<f32> = out.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(out, vec![1.0, 0.0, 3.0]);
    }

    #[test]
    fn missing_capture_is_a_hook_error() {
        let logits = Tensor::zeros((1, 1, 4), DType::F32, &Device::Cpu).unwrap();
        let mut cache = HookCache::new(logits);
        cache.store(HookPoint::MlpOut(0), Tensor::zeros((1, 1, 2), DType::F32, &Device::Cpu).unwrap());
        assert!(cache.get(&HookPoint::MlpOut(0)).is_some());
        assert!(matches!(
            cache.require(&HookPoint::AttnOut(0)),
            Err(AbliterationError::Hook(_))
        ));
        let (_, captures) = cache.into_parts();
        assert_eq!(captures.len(), 1);
    }
}
