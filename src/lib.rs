// SPDX-License-Identifier: MIT OR Apache-2.0

//! # candle-abliterate
//!
//! Refusal-direction discovery and weight orthogonalization
//! ("abliteration") for language models, built on
//! [candle](https://github.com/huggingface/candle).
//!
//! Given a model that exposes `TransformerLens`-style hook points and its
//! per-layer output matrices, candle-abliterate caches pooled activations
//! for harmful and harmless instructions, derives candidate refusal
//! directions from their mean difference, scores each candidate by how
//! much refusal-token probability drops when it is ablated, and projects
//! the best one out of the attention and MLP output weights. Every edit is
//! logged, can be undone, checkpointed, rolled back by a
//! [`ModificationScope`], and saved with [`save_session`](AbliterationContext::save_session).
//!
//! ## Seams
//!
//! - [`AbliterationBackend`]: the model (forward pass with hooks, weight
//!   accessors, parameter export/import). Architecture and loading stay
//!   with the caller.
//! - [`PromptTokenizer`]: encode/decode with left padding;
//!   [`HfPromptTokenizer`] wraps a `tokenizers` JSON file (feature
//!   `hf-tokenizer`, on by default).
//!
//! ## Workflow
//!
//! 1. [`Abliterator::new`] with a backend, tokenizer, [`Corpus`] and
//!    [`AbliteratorConfig`].
//! 2. [`cache_activations`](AbliterationContext::cache_activations).
//! 3. [`find_best_refusal_dir`](Abliterator::find_best_refusal_dir) or
//!    [`scored_dirs`](AbliterationContext::scored_dirs).
//! 4. [`apply_refusal_dirs`](AbliterationContext::apply_refusal_dirs) and
//!    [`measure`](AbliterationContext::measure).
//!
//! [`layer_rankings`](AbliterationContext::layer_rankings) shows at which
//! layer the refusal tokens surface in the cached residual stream.

#![warn(missing_docs)]

pub mod abliterator;
pub mod backend;
pub mod cache;
pub mod checkpoint;
pub mod config;
pub mod corpus;
pub mod direction;
pub mod error;
pub mod hooks;
pub mod lens;
pub mod persist;
pub mod runner;
pub mod scoring;
pub mod surgery;
pub mod tokenizer;

// --- Session -----------------------------------------------------------------
pub use abliterator::{AbliterationContext, Abliterator, CacheOptions};
pub use checkpoint::{Checkpoint, ModificationScope, ParamSnapshot};
pub use config::AbliteratorConfig;
pub use corpus::{ChatTemplate, Corpus, InstructionSplit};

// --- Model seams -------------------------------------------------------------
pub use backend::{AbliterationBackend, load_varmap_parameters, varmap_parameters};
pub use hooks::{HookCache, HookPoint, HookSpec, Intervention, apply_intervention};
#[cfg(feature = "hf-tokenizer")]
pub use tokenizer::HfPromptTokenizer;
pub use tokenizer::{PromptTokenizer, pad_left};

// --- Analysis ----------------------------------------------------------------
pub use cache::{ActivationStore, StoreBuilder, pool_last};
pub use direction::{Direction, MeanDirs};
pub use lens::{LayerRanking, ResidualMode, ResidualStack};
pub use runner::{GenerateOptions, Generation, generate_logits};
pub use scoring::{MeasureOptions, Reducer, ScorePair, TokenSets, reduce_logits};
pub use surgery::{ModificationLog, WeightEdit, WeightKind, orthogonal_complement, project};

// --- Errors ------------------------------------------------------------------
pub use error::{AbliterationError, Result};
