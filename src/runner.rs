// SPDX-License-Identifier: MIT OR Apache-2.0

//! Greedy step-wise generation with hook capture.
//!
//! [`generate_logits`] feeds a left-padded prompt batch through an
//! [`AbliterationBackend`] one token at a time, appending the argmax token
//! of every active sequence after each step. The logits and captured
//! activations of the final forward pass are returned.
//!
//! Two early stops exist:
//!
//! - **Refusal drop**: if any active sequence emits a negative token, the
//!   whole batch stops at once. Per-sequence dropping is deliberately not
//!   done; callers rely on the batch-wide abort.
//! - **End marker**: a sequence whose last emitted token is the end marker
//!   leaves the active set; generation stops once no sequence is active.

use std::collections::{HashMap, HashSet};

use candle_core::{D, Tensor};

use crate::backend::AbliterationBackend;
use crate::error::{AbliterationError, Result};
use crate::hooks::{HookPoint, HookSpec};

/// Options for [`generate_logits`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerateOptions {
    /// Tokens to generate; `0` is treated as `1`.
    pub max_new_tokens: usize,
    /// Stop the whole batch when any sequence emits a negative token.
    pub drop_refusals: bool,
    /// Retire sequences once they emit the end marker.
    pub stop_at_eos: bool,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            max_new_tokens: 1,
            drop_refusals: true,
            stop_at_eos: false,
        }
    }
}

/// Output of [`generate_logits`].
#[derive(Debug)]
pub struct Generation {
    /// Logits of the final forward pass.
    ///
    /// # Shapes
    /// - `[rows.len(), seq, vocab]`, where `seq` covers the prompt plus
    ///   every generated token except the last.
    pub logits: Tensor,
    /// Activations captured during the final forward pass.
    pub captures: HashMap<HookPoint, Tensor>,
    /// Batch index of every row of `logits` and of the captures.
    pub rows: Vec<usize>,
    /// Tokens generated per sequence.
    pub generated: Vec<Vec<u32>>,
    /// Sequences that emitted the end marker.
    pub finished: Vec<bool>,
    /// Forward passes run.
    pub steps: usize,
    /// Whether generation stopped on a negative token.
    pub stopped_on_refusal: bool,
}

/// Greedily extend every prompt by up to `options.max_new_tokens` tokens.
///
/// # Shapes
/// - `prompts`: `batch` sequences of equal length (left-padded)
///
/// # Errors
///
/// Returns [`AbliterationError::Shape`] if `prompts` is empty or ragged,
/// and propagates backend errors.
pub fn generate_logits(
    backend: &dyn AbliterationBackend,
    prompts: &[Vec<u32>],
    hooks: &HookSpec,
    options: &GenerateOptions,
    refusal_tokens: &HashSet<u32>,
    eos_id: u32,
) -> Result<Generation> {
    let width = check_rectangular(prompts)?;
    let steps = options.max_new_tokens.max(1);

    let mut tokens: Vec<Vec<u32>> = prompts.to_vec();
    let mut generated: Vec<Vec<u32>> = vec![Vec::with_capacity(steps); prompts.len()];
    let mut finished = vec![false; prompts.len()];
    let mut active: Vec<usize> = (0..prompts.len()).collect();
    let mut last_pass: Option<(Tensor, HashMap<HookPoint, Tensor>, Vec<usize>)> = None;
    let mut stopped_on_refusal = false;
    let mut steps_run = 0;

    for step in 0..steps {
        let seq_len = width + step;
        let flat: Vec<u32> = active
            .iter()
            .filter_map(|&idx| tokens.get(idx))
            .flat_map(|seq| seq.iter().copied())
            .collect();
        let input = Tensor::from_vec(flat, (active.len(), seq_len), backend.device())?;

        let (logits, captures) = backend.forward(&input, hooks)?.into_parts();
        steps_run += 1;

        // [rows, seq, vocab] -> [rows] argmax at the last position.
        let next: Vec<u32> = logits
            .narrow(1, seq_len - 1, 1)?
            .squeeze(1)?
            .argmax(D::Minus1)?
            .to_vec1()?;

        for (&idx, &token) in active.iter().zip(&next) {
            if let Some(seq) = tokens.get_mut(idx) {
                seq.push(token);
            }
            if let Some(out) = generated.get_mut(idx) {
                out.push(token);
            }
        }
        last_pass = Some((logits, captures, active.clone()));

        if options.drop_refusals && next.iter().any(|t| refusal_tokens.contains(t)) {
            tracing::debug!(step, "negative token emitted, stopping batch");
            stopped_on_refusal = true;
            break;
        }
        if options.stop_at_eos {
            for (&idx, &token) in active.iter().zip(&next) {
                if token == eos_id {
                    if let Some(done) = finished.get_mut(idx) {
                        *done = true;
                    }
                }
            }
            active.retain(|&idx| !finished.get(idx).copied().unwrap_or(true));
            if active.is_empty() {
                tracing::debug!(step, "every sequence emitted the end marker");
                break;
            }
        }
    }

    let (logits, captures, rows) = last_pass
        .ok_or_else(|| AbliterationError::State("generation ran no forward pass".into()))?;
    Ok(Generation {
        logits,
        captures,
        rows,
        generated,
        finished,
        steps: steps_run,
        stopped_on_refusal,
    })
}

/// Common length of all prompts.
fn check_rectangular(prompts: &[Vec<u32>]) -> Result<usize> {
    let Some(first) = prompts.first() else {
        return Err(AbliterationError::Shape("empty prompt batch".into()));
    };
    let width = first.len();
    if width == 0 {
        return Err(AbliterationError::Shape("prompts must not be empty".into()));
    }
    if let Some(bad) = prompts.iter().position(|p| p.len() != width) {
        return Err(AbliterationError::Shape(format!(
            "prompt {bad} has {} tokens, expected {width} (pad the batch first)",
            prompts.get(bad).map_or(0, Vec::len)
        )));
    }
    Ok(width)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::as_conversions
)]
mod tests {
    use super::*;
    use crate::surgery::WeightKind;
    use candle_core::{DType, Device};

    /// Predicts `(token + 1) % vocab` at every position.
    struct Counter {
        device: Device,
        vocab: usize,
    }

    impl AbliterationBackend for Counter {
        fn num_layers(&self) -> usize {
            1
        }
        fn hidden_size(&self) -> usize {
            self.vocab
        }
        fn vocab_size(&self) -> usize {
            self.vocab
        }
        fn device(&self) -> &Device {
            &self.device
        }
        fn forward(&self, input_ids: &Tensor, hooks: &HookSpec) -> Result<crate::HookCache> {
            let (batch, seq) = input_ids.dims2()?;
            let mut one_hot = vec![0.0_f32; batch * seq * self.vocab];
            for (pos, token) in input_ids.flatten_all()?.to_vec1::<u32>()?.into_iter().enumerate() {
                let next = (token as usize + 1) % self.vocab;
                one_hot[pos * self.vocab + next] = 1.0;
            }
            let logits = Tensor::from_vec(one_hot, (batch, seq, self.vocab), &self.device)?;
            let mut cache = crate::HookCache::new(logits.clone());
            let point = HookPoint::ResidPost(0);
            if hooks.is_captured(&point) {
                cache.store(point, logits);
            }
            Ok(cache)
        }
        fn project_to_vocab(&self, hidden: &Tensor) -> Result<Tensor> {
            Ok(hidden.clone())
        }
        fn weight(&self, _: usize, _: WeightKind) -> Result<Tensor> {
            Ok(Tensor::zeros((1, self.vocab), DType::F32, &self.device)?)
        }
        fn set_weight(&mut self, _: usize, _: WeightKind, _: Tensor) -> Result<()> {
            Ok(())
        }
        fn named_parameters(&self) -> Result<Vec<(String, Tensor)>> {
            Ok(Vec::new())
        }
        fn load_parameters(&mut self, _: &HashMap<String, Tensor>) -> Result<()> {
            Ok(())
        }
    }

    fn counter() -> Counter {
        Counter {
            device: Device::Cpu,
            vocab: 8,
        }
    }

    #[test]
    fn greedy_steps_feed_back() {
        let backend = counter();
        let mut hooks = HookSpec::new();
        hooks.capture(HookPoint::ResidPost(0)).capture("blocks.0.nowhere");
        let options = GenerateOptions {
            max_new_tokens: 3,
            drop_refusals: false,
            stop_at_eos: false,
        };
        let out = generate_logits(&backend, &[vec![0, 1], vec![4, 5]], &hooks, &options, &HashSet::new(), 7)
            .unwrap();

        assert_eq!(out.steps, 3);
        assert_eq!(out.generated, vec![vec![2, 3, 4], vec![6, 7, 0]]);
        assert_eq!(out.rows, vec![0, 1]);
        // Final pass sees prompt + two generated tokens.
        assert_eq!(out.logits.dims(), &[2, 4, 8]);
        assert!(out.captures.contains_key(&HookPoint::ResidPost(0)));
        assert_eq!(out.captures.len(), 1);
    }

    #[test]
    fn zero_tokens_still_runs_one_step() {
        let options = GenerateOptions {
            max_new_tokens: 0,
            ..GenerateOptions::default()
        };
        let out = generate_logits(&counter(), &[vec![1]], &HookSpec::new(), &options, &HashSet::new(), 7)
            .unwrap();
        assert_eq!(out.steps, 1);
        assert_eq!(out.generated, vec![vec![2]]);
    }

    #[test]
    fn refusal_stops_whole_batch() {
        let options = GenerateOptions {
            max_new_tokens: 5,
            drop_refusals: true,
            stop_at_eos: false,
        };
        let refusal: HashSet<u32> = [3].into_iter().collect();
        // Row 0 emits 3 at step 2; row 1 never does before the stop.
        let out = generate_logits(&counter(), &[vec![1], vec![5]], &HookSpec::new(), &options, &refusal, 7)
            .unwrap();
        assert!(out.stopped_on_refusal);
        assert_eq!(out.steps, 2);
        assert_eq!(out.generated, vec![vec![2, 3], vec![6, 7]]);
    }

    #[test]
    fn end_marker_retires_only_that_sequence() {
        let options = GenerateOptions {
            max_new_tokens: 4,
            drop_refusals: false,
            stop_at_eos: true,
        };
        let out = generate_logits(&counter(), &[vec![5], vec![0]], &HookSpec::new(), &options, &HashSet::new(), 7)
            .unwrap();
        assert_eq!(out.finished, vec![true, false]);
        assert_eq!(out.generated[0], vec![6, 7]);
        assert_eq!(out.generated[1], vec![1, 2, 3, 4]);
        assert_eq!(out.rows, vec![1]);
    }

    #[test]
    fn ragged_batch_is_a_shape_error() {
        let err = generate_logits(
            &counter(),
            &[vec![1, 2], vec![3]],
            &HookSpec::new(),
            &GenerateOptions::default(),
            &HashSet::new(),
            7,
        )
        .unwrap_err();
        assert!(matches!(err, AbliterationError::Shape(_)));
    }
}
