// SPDX-License-Identifier: MIT OR Apache-2.0

//! Refusal scoring: token-probability mass reduced to scalars.
//!
//! [`reduce_logits`] turns the logits of a generated window into one
//! negative (refusal-indicative) and one positive (compliance-indicative)
//! value per prompt. [`AbliterationContext::measure`] runs fresh
//! continuations on the harmful test split and reduces across the batch;
//! [`Abliterator::test_dir`] and [`Abliterator::find_best_refusal_dir`]
//! score candidate directions.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use candle_core::{D, DType, Device, Tensor};

use crate::abliterator::{AbliterationContext, Abliterator};
use crate::direction::Direction;
use crate::error::{AbliterationError, Result};
use crate::hooks::{HookPoint, HookSpec, Intervention};
use crate::runner::{GenerateOptions, generate_logits};

// ---------------------------------------------------------------------------
// Reducer
// ---------------------------------------------------------------------------

/// Reduction applied over one dimension of a score tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reducer {
    /// Arithmetic mean.
    Mean,
    /// Lower median (the smaller middle value for even counts).
    Median,
    /// Maximum.
    Max,
    /// No reduction: the values are kept as they are.
    Stack,
}

impl Reducer {
    /// Every reducer, in documentation order.
    pub const ALL: [Self; 4] = [Self::Mean, Self::Median, Self::Max, Self::Stack];

    /// Name accepted by [`FromStr`].
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Mean => "mean",
            Self::Median => "median",
            Self::Max => "max",
            Self::Stack => "stack",
        }
    }

    /// Reduce `values` over `dim`.
    ///
    /// # Shapes
    /// - `values`: any shape with `dim` in range
    /// - returns: `values` without `dim` ([`Stack`](Self::Stack) keeps it)
    ///
    /// # Errors
    ///
    /// Returns [`AbliterationError::Model`] if `dim` is out of range or the
    /// reduction fails.
    pub fn reduce(self, values: &Tensor, dim: usize) -> Result<Tensor> {
        match self {
            Self::Mean => Ok(values.mean(dim)?),
            Self::Max => Ok(values.max(dim)?),
            Self::Median => lower_median(values, dim),
            Self::Stack => Ok(values.clone()),
        }
    }
}

/// Lower median over `dim`, via a sort along the last dimension.
fn lower_median(values: &Tensor, dim: usize) -> Result<Tensor> {
    let rank = values.rank();
    let count = values.dim(dim)?;
    // Move `dim` last, keeping the order of the others.
    let order: Vec<usize> = (0..rank).filter(|&d| d != dim).chain([dim]).collect();
    let moved = values.permute(order)?.contiguous()?;
    let (sorted, _) = moved.sort_last_dim(true)?;
    Ok(sorted
        .narrow(D::Minus1, count.saturating_sub(1) / 2, 1)?
        .squeeze(D::Minus1)?)
}

impl fmt::Display for Reducer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Reducer {
    type Err = AbliterationError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|r| r.name() == s)
            .ok_or_else(|| AbliterationError::UnknownReducer {
                name: s.to_string(),
                valid: Self::ALL
                    .iter()
                    .map(|r| r.name())
                    .collect::<Vec<_>>()
                    .join(", "),
            })
    }
}

// ---------------------------------------------------------------------------
// Token sets
// ---------------------------------------------------------------------------

/// Compliance (positive) and refusal (negative) vocabulary subsets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenSets {
    /// Compliance-indicative token IDs, sorted and deduplicated.
    positive: Vec<u32>,
    /// Refusal-indicative token IDs, sorted and deduplicated.
    negative: Vec<u32>,
}

impl TokenSets {
    /// Build both sets.
    ///
    /// # Errors
    ///
    /// Returns [`AbliterationError::Config`] if either set is empty.
    pub fn new(
        positive: impl IntoIterator<Item = u32>,
        negative: impl IntoIterator<Item = u32>,
    ) -> Result<Self> {
        let positive = sorted_unique(positive);
        let negative = sorted_unique(negative);
        if positive.is_empty() || negative.is_empty() {
            return Err(AbliterationError::Config(
                "positive and negative token sets must not be empty".into(),
            ));
        }
        Ok(Self { positive, negative })
    }

    /// Compliance-indicative IDs.
    #[must_use]
    pub fn positive(&self) -> &[u32] {
        &self.positive
    }

    /// Refusal-indicative IDs.
    #[must_use]
    pub fn negative(&self) -> &[u32] {
        &self.negative
    }

    /// Negative IDs as a set, for the generation refusal check.
    #[must_use]
    pub fn negative_set(&self) -> HashSet<u32> {
        self.negative.iter().copied().collect()
    }

    /// Largest ID in either set.
    #[must_use]
    pub fn max_id(&self) -> Option<u32> {
        self.positive.iter().chain(&self.negative).copied().max()
    }
}

/// Sort and deduplicate token IDs.
fn sorted_unique(ids: impl IntoIterator<Item = u32>) -> Vec<u32> {
    let mut ids: Vec<u32> = ids.into_iter().collect();
    ids.sort_unstable();
    ids.dedup();
    ids
}

// ---------------------------------------------------------------------------
// Logit reduction
// ---------------------------------------------------------------------------

/// Negative and positive scores.
#[derive(Debug, Clone)]
pub struct ScorePair {
    /// Refusal-indicative score.
    pub negative: Tensor,
    /// Compliance-indicative score.
    pub positive: Tensor,
}

impl ScorePair {
    /// Score of the chosen polarity.
    #[must_use]
    pub const fn select(&self, positive: bool) -> &Tensor {
        if positive { &self.positive } else { &self.negative }
    }

    /// Score of the chosen polarity as a single `f32`.
    ///
    /// # Errors
    ///
    /// Returns [`AbliterationError::Shape`] if the score holds more than
    /// one value (a [`Reducer::Stack`] result).
    pub fn scalar(&self, positive: bool) -> Result<f32> {
        let score = self.select(positive);
        if score.elem_count() != 1 {
            return Err(AbliterationError::Shape(format!(
                "score of shape {:?} is not a scalar",
                score.dims()
            )));
        }
        let values: Vec<f32> = score.flatten_all()?.to_dtype(DType::F32)?.to_vec1()?;
        values
            .first()
            .copied()
            .ok_or_else(|| AbliterationError::Shape("empty score".into()))
    }
}

/// Per-prompt scores over the last `window` positions of `logits`.
///
/// Softmax over the vocabulary, restricted to each token set, maximum per
/// step within each set, then `reducer` over the window.
///
/// # Shapes
/// - `logits`: `[batch, seq, vocab]`
/// - returns: `[batch]` per polarity (`[batch, window]` for
///   [`Reducer::Stack`])
///
/// # Errors
///
/// Returns [`AbliterationError::Shape`] if `logits` is not 3-D and
/// [`AbliterationError::Index`] if a token ID exceeds the vocabulary.
pub fn reduce_logits(
    logits: &Tensor,
    window: usize,
    reducer: Reducer,
    tokens: &TokenSets,
) -> Result<ScorePair> {
    let [_, seq, vocab] = logits.dims() else {
        return Err(AbliterationError::Shape(format!(
            "expected [batch, seq, vocab] logits, got {:?}",
            logits.dims()
        )));
    };
    if let Some(max_id) = tokens.max_id() {
        if usize::try_from(max_id).map_or(true, |id| id >= *vocab) {
            return Err(AbliterationError::Index(format!(
                "token {max_id} outside vocabulary of {vocab}"
            )));
        }
    }
    let window = window.clamp(1, (*seq).max(1));

    // PROMOTE: softmax in F32 on the CPU
    let tail = logits
        .narrow(1, seq - window, window)?
        .to_device(&Device::Cpu)?
        .to_dtype(DType::F32)?
        .contiguous()?;
    let probs = candle_nn::ops::softmax_last_dim(&tail)?;

    let group_max = |ids: &[u32]| -> Result<Tensor> {
        let index = Tensor::from_slice(ids, ids.len(), &Device::Cpu)?;
        // [batch, window, |ids|] -> [batch, window]
        Ok(probs.index_select(&index, 2)?.max(D::Minus1)?)
    };
    let negative = reducer.reduce(&group_max(tokens.negative())?, 1)?;
    let positive = reducer.reduce(&group_max(tokens.positive())?, 1)?;
    Ok(ScorePair { negative, positive })
}

// ---------------------------------------------------------------------------
// Measurement
// ---------------------------------------------------------------------------

/// Options for [`AbliterationContext::measure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeasureOptions {
    /// Harmful test prompts to score.
    pub n: usize,
    /// Tokens generated per prompt; also the scoring window.
    pub sampled_tokens: usize,
    /// Reduction over the window, per prompt.
    pub reducer: Reducer,
    /// Reduction across prompts.
    pub batch_reducer: Reducer,
}

impl Default for MeasureOptions {
    fn default() -> Self {
        Self {
            n: 4,
            sampled_tokens: 8,
            reducer: Reducer::Max,
            batch_reducer: Reducer::Max,
        }
    }
}

impl AbliterationContext {
    /// Score fresh continuations of the first `n` harmful test prompts.
    ///
    /// # Errors
    ///
    /// Returns [`AbliterationError::Config`] if the harmful test split is
    /// empty, and propagates tokenizer, runner and reduction errors.
    pub fn measure(&self, options: &MeasureOptions) -> Result<ScorePair> {
        self.measure_with_hooks(options, &HookSpec::new())
    }

    /// [`measure`](Self::measure) with extra interventions active.
    ///
    /// # Errors
    ///
    /// Same as [`measure`](Self::measure).
    pub fn measure_with_hooks(&self, options: &MeasureOptions, extra: &HookSpec) -> Result<ScorePair> {
        let test = &self.corpus.harmful.test;
        let prompts = test.get(..options.n.min(test.len())).unwrap_or_default();
        if prompts.is_empty() {
            return Err(AbliterationError::Config(
                "no harmful test prompts to measure".into(),
            ));
        }
        let tokens = self.tokenize_instructions(prompts)?;

        let mut hooks = self.hooks.clone();
        hooks.extend_from(extra);
        let generation = generate_logits(
            self.backend.as_ref(),
            &tokens,
            &hooks,
            &GenerateOptions {
                max_new_tokens: options.sampled_tokens,
                drop_refusals: false,
                stop_at_eos: false,
            },
            &self.token_sets.negative_set(),
            self.tokenizer.eos_id(),
        )?;

        let per_prompt = reduce_logits(
            &generation.logits,
            options.sampled_tokens,
            options.reducer,
            &self.token_sets,
        )?;
        let scores = ScorePair {
            negative: options.batch_reducer.reduce(&per_prompt.negative, 0)?,
            positive: options.batch_reducer.reduce(&per_prompt.positive, 0)?,
        };
        tracing::debug!(prompts = prompts.len(), "measured refusal scores");
        Ok(scores)
    }
}

impl Abliterator {
    /// Score the model with `direction` removed.
    ///
    /// With `use_hooks`, the direction is projected out of the activations
    /// at every configured site of `layers` during the forward pass; the
    /// weights are untouched. Otherwise the direction is ablated from the
    /// weights of `layers` inside a modification scope that rolls back on
    /// return. `layers` defaults to the whitelisted layers.
    ///
    /// # Errors
    ///
    /// Propagates surgery and measurement errors.
    pub fn test_dir(
        &mut self,
        direction: &Tensor,
        use_hooks: bool,
        layers: Option<&[usize]>,
        options: &MeasureOptions,
    ) -> Result<ScorePair> {
        let layers = layers.map_or_else(|| self.whitelisted_layers(), <[usize]>::to_vec);
        if use_hooks {
            let mut hooks = HookSpec::new();
            for &layer in &layers {
                for site in &self.sites {
                    hooks.intervene(
                        HookPoint::for_site(site, layer),
                        Intervention::Ablate(direction.clone()),
                    );
                }
            }
            self.measure_with_hooks(options, &hooks)
        } else {
            let mut scope = self.scope()?;
            scope.apply_refusal_dirs(
                std::slice::from_ref(direction),
                true,
                true,
                Some(layers.as_slice()),
            )?;
            let scores = scope.measure(options);
            scope.restore()?;
            scores
        }
    }

    /// Score every refusal direction and sort ascending by the chosen
    /// polarity (lowest first: the strongest suppression of that polarity).
    ///
    /// Degenerate directions are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`AbliterationError::State`] if no activation cache exists,
    /// [`AbliterationError::Shape`] for a non-scalar reducer, and
    /// propagates scoring errors.
    pub fn find_best_refusal_dir(
        &mut self,
        options: &MeasureOptions,
        positive: bool,
        use_hooks: bool,
        invert: bool,
    ) -> Result<Vec<(f32, Direction)>> {
        let directions = self.refusal_dirs(invert)?;
        if self.modified {
            tracing::warn!("model is modified; every candidate is scored on the modified weights");
        }
        tracing::info!(candidates = directions.len(), use_hooks, "scoring refusal directions");

        let mut scored = Vec::with_capacity(directions.len());
        for direction in directions {
            if direction.degenerate {
                tracing::warn!(site = %direction.site, "skipping degenerate direction");
                continue;
            }
            let scores = self.test_dir(&direction.vector, use_hooks, None, options)?;
            scored.push((scores.scalar(positive)?, direction));
        }
        scored.sort_by(|a, b| a.0.total_cmp(&b.0));
        Ok(scored)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
