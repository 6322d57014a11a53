// SPDX-License-Identifier: MIT OR Apache-2.0

//! Batched activation caching under bounded memory.

use candle_core::DType;

use crate::backend::AbliterationBackend;
use crate::cache::activation::{ActivationStore, pool_last};
use crate::error::Result;
use crate::hooks::{HookPoint, HookSpec};
use crate::runner::{GenerateOptions, generate_logits};
use crate::scoring::{Reducer, TokenSets, reduce_logits};

/// Runs a token corpus through a backend batch by batch and pools the
/// activations of every requested site.
///
/// Peak memory is one batch of raw activations plus the pooled rows of
/// the whole corpus: per-batch tensors are dropped and the device is
/// synchronised before the next batch starts.
pub struct StoreBuilder<'a> {
    /// Model to run.
    pub backend: &'a dyn AbliterationBackend,
    /// Sites to capture.
    pub sites: Vec<HookPoint>,
    /// Interventions active during caching.
    pub hooks: &'a HookSpec,
    /// Token sets used for refusal labels and the refusal drop.
    pub token_sets: &'a TokenSets,
    /// End-of-sequence id.
    pub eos_id: u32,
    /// Prompts per forward batch.
    pub batch_size: usize,
    /// Trailing positions averaged per prompt.
    pub pooling_window: usize,
    /// Tokens generated per batch; values above 1 also produce labels.
    pub score_window: usize,
}

impl StoreBuilder<'_> {
    /// Capture plan: configured sites plus the shared interventions.
    fn hook_spec(&self) -> HookSpec {
        let mut spec = HookSpec::new();
        for site in &self.sites {
            // BORROW: explicit .clone(): HookPoint owned by the builder
            spec.capture(site.clone());
        }
        spec.extend_from(self.hooks);
        spec
    }

    /// Pool the activations of `prompts` (left-padded, equal length).
    ///
    /// Returns the store and, when `score_window > 1`, the maximum
    /// negative-token probability of each prompt over the generated
    /// window. Sites the backend never fills have no record.
    ///
    /// # Errors
    ///
    /// Propagates runner and tensor errors; a failure in any batch aborts
    /// the whole call.
    pub fn build(&self, prompts: &[Vec<u32>]) -> Result<(ActivationStore, Option<Vec<f32>>)> {
        let spec = self.hook_spec();
        let options = GenerateOptions {
            max_new_tokens: self.score_window,
            drop_refusals: true,
            stop_at_eos: false,
        };
        let refusal = self.token_sets.negative_set();
        let mut store = ActivationStore::new();
        let mut labels = (self.score_window > 1).then(Vec::new);

        for (index, batch) in prompts.chunks(self.batch_size.max(1)).enumerate() {
            let generation =
                generate_logits(self.backend, batch, &spec, &options, &refusal, self.eos_id)?;

            if let Some(labels) = labels.as_mut() {
                let scores = reduce_logits(
                    &generation.logits,
                    self.score_window,
                    Reducer::Max,
                    self.token_sets,
                )?;
                labels.extend(scores.negative.to_dtype(DType::F32)?.to_vec1::<f32>()?);
            }
            for site in &self.sites {
                if let Some(raw) = generation.captures.get(site) {
                    store.append(site.clone(), &pool_last(raw, self.pooling_window)?)?;
                }
            }

            drop(generation);
            self.backend.device().synchronize()?;
            tracing::debug!(batch = index, prompts = batch.len(), "cached batch");
        }

        Ok((store, labels))
    }
}
