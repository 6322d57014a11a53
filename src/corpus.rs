// SPDX-License-Identifier: MIT OR Apache-2.0

//! Instruction corpora and chat templates.

use rand::SeedableRng;
use rand::seq::SliceRandom;

use crate::error::{AbliterationError, Result};

/// Fraction of an unsplit list held out for testing.
pub const DEFAULT_TEST_FRACTION: f64 = 0.1;

/// Seed of the shuffle in [`InstructionSplit::from_unsplit`].
pub const DEFAULT_SPLIT_SEED: u64 = 42;

// ---------------------------------------------------------------------------
// InstructionSplit / Corpus
// ---------------------------------------------------------------------------

/// Train and test instructions of one behaviour class.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstructionSplit {
    /// Instructions used for activation caching.
    pub train: Vec<String>,
    /// Instructions used for scoring and manual tests.
    pub test: Vec<String>,
}

impl InstructionSplit {
    /// Wrap an existing split.
    #[must_use]
    pub const fn new(train: Vec<String>, test: Vec<String>) -> Self {
        Self { train, test }
    }

    /// Shuffle `instructions` with `seed` and hold out `test_fraction`
    /// (rounded up) for testing.
    ///
    /// # Errors
    ///
    /// Returns [`AbliterationError::Config`] if `test_fraction` is not in
    /// `(0, 1)` or either side would be empty.
    pub fn from_unsplit(instructions: Vec<String>, test_fraction: f64, seed: u64) -> Result<Self> {
        if !(test_fraction > 0.0 && test_fraction < 1.0) {
            return Err(AbliterationError::Config(format!(
                "test fraction must be in (0, 1), got {test_fraction}"
            )));
        }
        let total = instructions.len();
        #[allow(
            clippy::as_conversions,
            clippy::cast_precision_loss,
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss
        )]
        // PROMOTE: corpus sizes are far below 2^52
        let n_test = (test_fraction * total as f64).ceil() as usize;
        if n_test == 0 || n_test >= total {
            return Err(AbliterationError::Config(format!(
                "cannot split {total} instructions with test fraction {test_fraction}"
            )));
        }

        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        let mut shuffled = instructions;
        shuffled.shuffle(&mut rng);
        let test = shuffled.split_off(total - n_test);
        Ok(Self {
            train: shuffled,
            test,
        })
    }
}

/// Harmful and harmless instructions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Corpus {
    /// Instructions the model tends to refuse.
    pub harmful: InstructionSplit,
    /// Instructions the model answers.
    pub harmless: InstructionSplit,
}

impl Corpus {
    /// Pair two splits.
    ///
    /// # Errors
    ///
    /// Returns [`AbliterationError::Config`] if either training list is
    /// empty.
    pub fn new(harmful: InstructionSplit, harmless: InstructionSplit) -> Result<Self> {
        if harmful.train.is_empty() || harmless.train.is_empty() {
            return Err(AbliterationError::Config(
                "harmful and harmless training instructions must not be empty".into(),
            ));
        }
        Ok(Self { harmful, harmless })
    }
}

// ---------------------------------------------------------------------------
// ChatTemplate
// ---------------------------------------------------------------------------

/// Placeholder replaced by the instruction.
const PLACEHOLDER: &str = "{instruction}";

/// Llama-3 instruct format.
pub const LLAMA3_CHAT_TEMPLATE: &str = "<|start_header_id|>user<|end_header_id|>\n{instruction}<|eot_id|><|start_header_id|>assistant<|end_header_id|>\n\n";

/// Phi-3 instruct format.
pub const PHI3_CHAT_TEMPLATE: &str = "<|user|>\n{instruction}<|end|>\n<|assistant|>";

/// Prompt format wrapping a bare instruction.
///
/// ```
/// use candle_abliterate::ChatTemplate;
///
/// let t = ChatTemplate::phi3();
/// assert_eq!(t.format("hi"), "<|user|>\nhi<|end|>\n<|assistant|>");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatTemplate {
    /// Template text containing the placeholder.
    template: String,
}

impl ChatTemplate {
    /// Build from text containing `{instruction}`.
    ///
    /// # Errors
    ///
    /// Returns [`AbliterationError::Config`] if the placeholder is missing.
    pub fn new(template: &str) -> Result<Self> {
        if !template.contains(PLACEHOLDER) {
            return Err(AbliterationError::Config(format!(
                "chat template has no {PLACEHOLDER} placeholder"
            )));
        }
        Ok(Self {
            template: template.to_string(),
        })
    }

    /// Llama-3 instruct template.
    #[must_use]
    pub fn llama3() -> Self {
        Self {
            template: LLAMA3_CHAT_TEMPLATE.to_string(),
        }
    }

    /// Phi-3 instruct template.
    #[must_use]
    pub fn phi3() -> Self {
        Self {
            template: PHI3_CHAT_TEMPLATE.to_string(),
        }
    }

    /// Substitute `instruction` into the template.
    #[must_use]
    pub fn format(&self, instruction: &str) -> String {
        self.template.replace(PLACEHOLDER, instruction)
    }

    /// Raw template text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.template
    }
}

impl Default for ChatTemplate {
    fn default() -> Self {
        Self::llama3()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
