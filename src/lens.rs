// SPDX-License-Identifier: MIT OR Apache-2.0

//! Residual-stream decomposition and layer rankings.
//!
//! The cached activations are read back as a stack of residual-stream
//! vectors and projected through the model's final norm and unembedding,
//! to see at which layer the refusal (or compliance) tokens surface.
//!
//! Two readings of the stack:
//!
//! | Mode | Components |
//! |------|------------|
//! | [`ResidualMode::Decomposed`] | `resid_pre` of layer 0, then `attn_out` and `mlp_out` of every layer |
//! | [`ResidualMode::Accumulated`] | every cached `resid_pre`/`resid_mid`, and `resid_post` where no later `resid_pre` repeats it |

use candle_core::{DType, Device, Tensor};

use crate::abliterator::AbliterationContext;
use crate::cache::ActivationStore;
use crate::error::{AbliterationError, Result};
use crate::hooks::HookPoint;

/// How [`AbliterationContext::residual_stack`] reads the residual stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResidualMode {
    /// What each block writes into the stream.
    #[default]
    Decomposed,
    /// The stream itself, after every step that changes it.
    Accumulated,
}

/// Residual components of both classes, in execution order.
#[derive(Debug, Clone)]
pub struct ResidualStack {
    /// Site of each component.
    pub labels: Vec<HookPoint>,
    /// `[components, num_prompts, d_model]`, `f32`, on the CPU.
    pub harmful: Tensor,
    /// `[components, num_prompts, d_model]`, `f32`, on the CPU.
    pub harmless: Tensor,
}

/// Rank of the best-placed token of a set in one component's logits.
///
/// Rank 0 means a token of the set is the top prediction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerRanking {
    /// Component the logits came from.
    pub site: HookPoint,
    /// Best rank among the harmful class's mean logits.
    pub harmful_rank: usize,
    /// Best rank among the harmless class's mean logits.
    pub harmless_rank: usize,
}

/// `(layer, step within the layer)`; `None` for custom sites.
fn execution_key(site: &HookPoint) -> Option<(usize, u8)> {
    let step = match site {
        HookPoint::ResidPre(_) => 0,
        HookPoint::AttnOut(_) => 1,
        HookPoint::ResidMid(_) => 2,
        HookPoint::MlpOut(_) => 3,
        HookPoint::ResidPost(_) => 4,
        HookPoint::Custom(_) => return None,
    };
    site.layer().map(|layer| (layer, step))
}

/// Sites forming the residual stack of `store` under `mode`.
///
/// # Errors
///
/// Returns [`AbliterationError::Index`] if a decomposed component is not
/// cached, or if no residual-stream site is cached at all.
pub fn residual_sites(
    store: &ActivationStore,
    mode: ResidualMode,
    num_layers: usize,
) -> Result<Vec<HookPoint>> {
    match mode {
        ResidualMode::Decomposed => {
            let mut sites = vec![HookPoint::ResidPre(0)];
            for layer in 0..num_layers {
                sites.push(HookPoint::AttnOut(layer));
                sites.push(HookPoint::MlpOut(layer));
            }
            if let Some(missing) = sites.iter().find(|s| !store.contains(s)) {
                return Err(AbliterationError::Index(format!(
                    "decomposing the residual stream needs {missing} cached"
                )));
            }
            Ok(sites)
        }
        ResidualMode::Accumulated => {
            let mut sites: Vec<HookPoint> = store
                .sites()
                .filter(|site| match site {
                    HookPoint::ResidPre(_) | HookPoint::ResidMid(_) => true,
                    // Same tensor as the next layer's resid_pre.
                    HookPoint::ResidPost(layer) => {
                        !store.contains(&HookPoint::ResidPre(layer + 1))
                    }
                    _ => false,
                })
                .cloned()
                .collect();
            if sites.is_empty() {
                return Err(AbliterationError::Index(
                    "no residual-stream sites cached".into(),
                ));
            }
            sites.sort_by_key(execution_key);
            Ok(sites)
        }
    }
}

/// Stack the records of `sites` along a new leading axis.
///
/// # Shapes
/// - returns: `[sites, num_prompts, d_model]`
fn stack_records(store: &ActivationStore, sites: &[HookPoint]) -> Result<Tensor> {
    let records = sites
        .iter()
        .map(|site| Ok(store.require(site)?.to_dtype(DType::F32)?))
        .collect::<Result<Vec<_>>>()?;
    Ok(Tensor::stack(&records, 0)?)
}

/// Best rank of any token of `tokens` in `logits`.
///
/// A token's rank counts the entries with a strictly larger logit, so ties
/// share the better rank.
fn best_rank(logits: &[f32], tokens: &[u32]) -> Option<usize> {
    tokens
        .iter()
        .filter_map(|&id| usize::try_from(id).ok().and_then(|i| logits.get(i)))
        .map(|&value| logits.iter().filter(|&&other| other > value).count())
        .min()
}

/// Fail unless `tokens` is non-empty and fits a vocabulary of `vocab`.
fn check_tokens(tokens: &[u32], vocab: usize) -> Result<()> {
    if tokens.is_empty() {
        return Err(AbliterationError::Config("empty token set".into()));
    }
    if let Some(&bad) = tokens
        .iter()
        .find(|&&id| usize::try_from(id).map_or(true, |i| i >= vocab))
    {
        return Err(AbliterationError::Index(format!(
            "token {bad} outside vocabulary of {vocab}"
        )));
    }
    Ok(())
}

impl AbliterationContext {
    /// Cached residual components of both classes.
    ///
    /// # Errors
    ///
    /// Returns [`AbliterationError::State`] if nothing is cached, and
    /// [`AbliterationError::Index`] if a needed site is missing from either
    /// store.
    pub fn residual_stack(&self, mode: ResidualMode) -> Result<ResidualStack> {
        self.require_cache()?;
        let labels = residual_sites(&self.harmful, mode, self.backend.num_layers())?;
        Ok(ResidualStack {
            harmful: stack_records(&self.harmful, &labels)?,
            harmless: stack_records(&self.harmless, &labels)?,
            labels,
        })
    }

    /// Project residual vectors to vocabulary logits.
    ///
    /// # Shapes
    /// - `resid`: `[..., d_model]`
    /// - returns: `[..., vocab_size]`, `f32`, on the CPU
    ///
    /// # Errors
    ///
    /// Propagates backend projection errors.
    pub fn unembed_resid(&self, resid: &Tensor) -> Result<Tensor> {
        let hidden = resid.to_device(self.backend.device())?;
        let logits = self.backend.project_to_vocab(&hidden)?;
        // PROMOTE: rankings compare logits in F32
        Ok(logits.to_device(&Device::Cpu)?.to_dtype(DType::F32)?)
    }

    /// Where `tokens` rank in the logits of each residual component.
    ///
    /// Each component's class-mean vector is unembedded and the best rank
    /// of any token in the set is reported. `harmless_tokens` ranks a
    /// different set on the harmless side (default: `tokens`).
    ///
    /// # Errors
    ///
    /// Returns [`AbliterationError::Config`] for an empty token set,
    /// [`AbliterationError::Index`] for a token outside the vocabulary,
    /// and see [`residual_stack`](Self::residual_stack).
    pub fn layer_rankings(
        &self,
        tokens: &[u32],
        mode: ResidualMode,
        harmless_tokens: Option<&[u32]>,
    ) -> Result<Vec<LayerRanking>> {
        let harmless_tokens = harmless_tokens.unwrap_or(tokens);
        let vocab = self.backend.vocab_size();
        check_tokens(tokens, vocab)?;
        check_tokens(harmless_tokens, vocab)?;

        let stack = self.residual_stack(mode)?;
        let harmful: Vec<Vec<f32>> = self.unembed_resid(&stack.harmful.mean(1)?)?.to_vec2()?;
        let harmless: Vec<Vec<f32>> = self.unembed_resid(&stack.harmless.mean(1)?)?.to_vec2()?;

        let rankings = stack
            .labels
            .into_iter()
            .zip(harmful.iter().zip(&harmless))
            .map(|(site, (bad, good))| {
                let rank = |logits: &[f32], set: &[u32]| {
                    best_rank(logits, set).ok_or_else(|| {
                        AbliterationError::Shape(format!(
                            "logits at {site} are narrower than the vocabulary"
                        ))
                    })
                };
                Ok(LayerRanking {
                    harmful_rank: rank(bad.as_slice(), tokens)?,
                    harmless_rank: rank(good.as_slice(), harmless_tokens)?,
                    site,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        tracing::debug!(components = rankings.len(), ?mode, "layer rankings");
        Ok(rankings)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn store(sites: &[HookPoint]) -> ActivationStore {
        let mut store = ActivationStore::new();
        for site in sites {
            store.insert(
                site.clone(),
                Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap(),
            );
        }
        store
    }

    #[test]
    fn accumulated_sites_skip_repeated_streams() {
        let cached = store(&[
            HookPoint::ResidPost(1),
            HookPoint::ResidPre(1),
            HookPoint::ResidPost(0),
            HookPoint::AttnOut(0),
            HookPoint::ResidMid(0),
            HookPoint::ResidPre(0),
        ]);
        let sites = residual_sites(&cached, ResidualMode::Accumulated, 2).unwrap();
        assert_eq!(
            sites,
            vec![
                HookPoint::ResidPre(0),
                HookPoint::ResidMid(0),
                HookPoint::ResidPre(1),
                HookPoint::ResidPost(1),
            ]
        );
    }

    #[test]
    fn decomposition_needs_every_block_output() {
        let cached = store(&[HookPoint::ResidPre(0), HookPoint::AttnOut(0)]);
        assert!(matches!(
            residual_sites(&cached, ResidualMode::Decomposed, 1),
            Err(AbliterationError::Index(_))
        ));
        let cached = store(&[
            HookPoint::ResidPre(0),
            HookPoint::AttnOut(0),
            HookPoint::MlpOut(0),
        ]);
        let sites = residual_sites(&cached, ResidualMode::Decomposed, 1).unwrap();
        assert_eq!(sites.len(), 3);
        let stacked = stack_records(&cached, &sites).unwrap();
        assert_eq!(stacked.dims(), &[3, 2, 3]);
    }

    #[test]
    fn ties_share_the_better_rank() {
        let logits = [0.5_f32, 2.0, 2.0, -1.0];
        assert_eq!(best_rank(&logits, &[2]), Some(0));
        assert_eq!(best_rank(&logits, &[0, 3]), Some(2));
        assert_eq!(best_rank(&logits, &[9]), None);
    }

    #[test]
    fn token_sets_are_checked() {
        assert!(matches!(check_tokens(&[], 4), Err(AbliterationError::Config(_))));
        assert!(matches!(check_tokens(&[4], 4), Err(AbliterationError::Index(_))));
        assert!(check_tokens(&[3], 4).is_ok());
    }
}
