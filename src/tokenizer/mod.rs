// SPDX-License-Identifier: MIT OR Apache-2.0

//! Prompt tokenization: the [`PromptTokenizer`] contract, left padding,
//! and a `HuggingFace` adapter.
//!
//! Batches are left-padded so the last position of every row is the last
//! prompt token; pooling and generation read from the right edge.

use crate::error::Result;
#[cfg(feature = "hf-tokenizer")]
use crate::error::AbliterationError;

/// Text-to-token conversion supplied by the caller.
pub trait PromptTokenizer: Send + Sync {
    /// Encode one formatted prompt, adding the tokenizer's special tokens.
    ///
    /// # Errors
    ///
    /// Returns [`AbliterationError::Tokenizer`](crate::AbliterationError::Tokenizer)
    /// if encoding fails.
    fn encode(&self, text: &str) -> Result<Vec<u32>>;

    /// Decode token IDs, skipping special tokens.
    ///
    /// # Errors
    ///
    /// Returns [`AbliterationError::Tokenizer`](crate::AbliterationError::Tokenizer)
    /// if decoding fails.
    fn decode(&self, ids: &[u32]) -> Result<String>;

    /// Token used for left padding.
    fn pad_id(&self) -> u32;

    /// End-of-sequence marker.
    fn eos_id(&self) -> u32;

    /// Encode several prompts into one rectangular, left-padded batch.
    ///
    /// # Errors
    ///
    /// Propagates [`encode`](Self::encode) errors.
    fn encode_batch(&self, texts: &[String]) -> Result<Vec<Vec<u32>>> {
        let encoded = texts
            .iter()
            .map(|t| self.encode(t))
            .collect::<Result<Vec<_>>>()?;
        Ok(pad_left(encoded, self.pad_id()))
    }
}

/// Left-pad every sequence to the length of the longest one.
#[must_use]
pub fn pad_left(sequences: Vec<Vec<u32>>, pad_id: u32) -> Vec<Vec<u32>> {
    let width = sequences.iter().map(Vec::len).max().unwrap_or(0);
    sequences
        .into_iter()
        .map(|seq| {
            let mut padded = vec![pad_id; width - seq.len()];
            padded.extend(seq);
            padded
        })
        .collect()
}

// ---------------------------------------------------------------------------
// HuggingFace adapter
// ---------------------------------------------------------------------------

/// [`PromptTokenizer`] backed by the `HuggingFace` `tokenizers` crate.
///
/// The pad token defaults to the end-of-sequence token, as most chat
/// models ship without a dedicated pad token.
///
/// # Example
///
/// ```no_run
/// use candle_abliterate::{HfPromptTokenizer, PromptTokenizer};
///
/// # fn main() -> candle_abliterate::Result<()> {
/// let tok = HfPromptTokenizer::from_file("tokenizer.json", "<|eot_id|>")?;
/// let batch = tok.encode_batch(&["hi".into(), "a longer prompt".into()])?;
/// assert_eq!(batch[0].len(), batch[1].len());
/// # Ok(())
/// # }
/// ```
#[cfg(feature = "hf-tokenizer")]
pub struct HfPromptTokenizer {
    /// Wrapped tokenizer.
    inner: Box<tokenizers::Tokenizer>,
    /// End-of-sequence id.
    eos_id: u32,
    /// Padding id.
    pad_id: u32,
}

#[cfg(feature = "hf-tokenizer")]
impl HfPromptTokenizer {
    /// Load a `tokenizer.json` file; `eos_token` names the end marker.
    ///
    /// # Errors
    ///
    /// Returns [`AbliterationError::Tokenizer`] if the file cannot be loaded
    /// or `eos_token` is not in the vocabulary.
    pub fn from_file(path: impl AsRef<std::path::Path>, eos_token: &str) -> Result<Self> {
        let tok = tokenizers::Tokenizer::from_file(path.as_ref()).map_err(|e| {
            AbliterationError::Tokenizer(format!(
                "failed to load HF tokenizer from {}: {e}",
                path.as_ref().display()
            ))
        })?;
        Self::from_tokenizer(tok, eos_token)
    }

    /// Wrap an already-loaded tokenizer.
    ///
    /// # Errors
    ///
    /// Returns [`AbliterationError::Tokenizer`] if `eos_token` is not in the
    /// vocabulary.
    pub fn from_tokenizer(tokenizer: tokenizers::Tokenizer, eos_token: &str) -> Result<Self> {
        let eos_id = tokenizer.token_to_id(eos_token).ok_or_else(|| {
            AbliterationError::Tokenizer(format!("end marker `{eos_token}` not in vocabulary"))
        })?;
        Ok(Self {
            inner: Box::new(tokenizer),
            eos_id,
            pad_id: eos_id,
        })
    }

    /// Use a dedicated padding token instead of the end marker.
    #[must_use]
    pub const fn with_pad_id(mut self, pad_id: u32) -> Self {
        self.pad_id = pad_id;
        self
    }
}

#[cfg(feature = "hf-tokenizer")]
impl PromptTokenizer for HfPromptTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, true)
            .map_err(|e| AbliterationError::Tokenizer(format!("HF encode failed: {e}")))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        self.inner
            .decode(ids, true)
            .map_err(|e| AbliterationError::Tokenizer(format!("HF decode failed: {e}")))
    }

    fn pad_id(&self) -> u32 {
        self.pad_id
    }

    fn eos_id(&self) -> u32 {
        self.eos_id
    }
}

#[cfg(feature = "hf-tokenizer")]
impl std::fmt::Debug for HfPromptTokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HfPromptTokenizer")
            .field("eos_id", &self.eos_id)
            .field("pad_id", &self.pad_id)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
