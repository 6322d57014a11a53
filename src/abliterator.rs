// SPDX-License-Identifier: MIT OR Apache-2.0

//! The owning session: model, tokenizer, corpus, caches and edit history.
//!
//! [`AbliterationContext`] holds every piece of mutable session state and
//! carries the caching, direction, surgery and scoring operations (spread
//! across the modules that implement them). [`Abliterator`] owns a context
//! and adds the operations that open a
//! [`ModificationScope`](crate::ModificationScope); since the scope only
//! exposes the context, scopes cannot nest.
//!
//! ```no_run
//! # use candle_abliterate::*;
//! # fn run(backend: Box<dyn AbliterationBackend>, tokenizer: Box<dyn PromptTokenizer>,
//! #        corpus: Corpus) -> Result<()> {
//! let mut abliterator = Abliterator::new(backend, tokenizer, corpus, &AbliteratorConfig::default())?;
//! abliterator.cache_activations(&CacheOptions::default())?;
//! let best = abliterator.find_best_refusal_dir(&MeasureOptions::default(), false, true, false)?;
//! if let Some((_, direction)) = best.first() {
//!     abliterator.apply_refusal_dirs(&[direction.vector.clone()], true, true, None)?;
//! }
//! # Ok(())
//! # }
//! ```

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::ops::{Deref, DerefMut};

use candle_core::DType;

use crate::backend::AbliterationBackend;
use crate::cache::{ActivationStore, StoreBuilder};
use crate::checkpoint::{Checkpoint, ParamSnapshot};
use crate::config::AbliteratorConfig;
use crate::corpus::{ChatTemplate, Corpus};
use crate::error::{AbliterationError, Result};
use crate::hooks::{HookPoint, HookSpec};
use crate::runner::{GenerateOptions, generate_logits};
use crate::scoring::TokenSets;
use crate::surgery::ModificationLog;
use crate::tokenizer::PromptTokenizer;

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Options for [`AbliterationContext::cache_activations`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheOptions {
    /// Training prompts taken from each class.
    pub n: usize,
    /// Prompts per forward batch.
    pub batch_size: usize,
    /// Trailing positions averaged per prompt.
    pub pooling_window: usize,
    /// Tokens generated per batch; above 1, refusal labels are recorded.
    pub score_window: usize,
    /// Discard the stores being rebuilt, and their labels, before building.
    pub reset: bool,
    /// Keep an existing harmless store instead of rebuilding it.
    pub preserve_harmless: bool,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            n: 128,
            batch_size: 8,
            pooling_window: 1,
            score_window: 0,
            reset: true,
            preserve_harmless: true,
        }
    }
}

// ---------------------------------------------------------------------------
// AbliterationContext
// ---------------------------------------------------------------------------

/// Mutable state of one abliteration session.
pub struct AbliterationContext {
    /// Model being edited.
    pub(crate) backend: Box<dyn AbliterationBackend>,
    /// Prompt tokenizer.
    pub(crate) tokenizer: Box<dyn PromptTokenizer>,
    /// Prompt format.
    pub(crate) template: ChatTemplate,
    /// Instruction corpus.
    pub(crate) corpus: Corpus,
    /// Short site names cached at every layer.
    pub(crate) sites: Vec<String>,
    /// Scoring vocabulary.
    pub(crate) token_sets: TokenSets,
    /// Pooled harmful activations.
    pub(crate) harmful: ActivationStore,
    /// Pooled harmless activations.
    pub(crate) harmless: ActivationStore,
    /// Per-prompt refusal labels of the harmful cache.
    pub(crate) harmful_labels: Vec<f32>,
    /// Per-prompt refusal labels of the harmless cache.
    pub(crate) harmless_labels: Vec<f32>,
    /// Every weight edit since the last reset.
    pub(crate) log: ModificationLog,
    /// Append-only checkpoint history.
    pub(crate) checkpoints: Vec<Checkpoint>,
    /// Layers exempt from edits.
    pub(crate) blacklist: BTreeSet<usize>,
    /// Whether any weight differs from the original.
    pub(crate) modified: bool,
    /// Whether a modification scope is open.
    pub(crate) scoped: bool,
    /// Parameters captured at construction.
    pub(crate) original: ParamSnapshot,
    /// Interventions applied to every forward pass.
    pub(crate) hooks: HookSpec,
}

impl AbliterationContext {
    // --- Layers --------------------------------------------------------------

    /// Fail unless `layer` exists.
    ///
    /// # Errors
    ///
    /// Returns [`AbliterationError::Index`] if `layer >= num_layers`.
    pub fn check_layer(&self, layer: usize) -> Result<()> {
        let n_layers = self.backend.num_layers();
        if layer >= n_layers {
            return Err(AbliterationError::Index(format!(
                "layer {layer} out of range (model has {n_layers} layers)"
            )));
        }
        Ok(())
    }

    /// Exempt `layers` from every edit.
    pub fn blacklist_layers(&mut self, layers: impl IntoIterator<Item = usize>) {
        self.blacklist.extend(layers);
    }

    /// Allow edits to `layers` again.
    pub fn whitelist_layers(&mut self, layers: impl IntoIterator<Item = usize>) {
        for layer in layers {
            self.blacklist.remove(&layer);
        }
    }

    /// Layers not on the blacklist, ascending.
    #[must_use]
    pub fn whitelisted_layers(&self) -> Vec<usize> {
        (0..self.backend.num_layers())
            .filter(|l| !self.blacklist.contains(l))
            .collect()
    }

    /// Blacklisted layers.
    #[must_use]
    pub const fn blacklist(&self) -> &BTreeSet<usize> {
        &self.blacklist
    }

    /// Every configured site at every layer.
    #[must_use]
    pub fn activation_points(&self) -> Vec<HookPoint> {
        (0..self.backend.num_layers())
            .flat_map(|layer| {
                self.sites
                    .iter()
                    .map(move |site| HookPoint::for_site(site, layer))
            })
            .collect()
    }

    // --- Prompts and generation ---------------------------------------------

    /// Format and tokenize `instructions` into one left-padded batch.
    ///
    /// # Errors
    ///
    /// Propagates tokenizer errors.
    pub fn tokenize_instructions(&self, instructions: &[String]) -> Result<Vec<Vec<u32>>> {
        let prompts: Vec<String> = instructions
            .iter()
            .map(|i| self.template.format(i))
            .collect();
        self.tokenizer.encode_batch(&prompts)
    }

    /// Greedily continue `instructions` and decode prompt plus continuation.
    ///
    /// For manual inspection; nothing is cached.
    ///
    /// # Errors
    ///
    /// Propagates tokenizer and runner errors.
    pub fn generate(
        &self,
        instructions: &[String],
        max_new_tokens: usize,
        stop_at_eos: bool,
    ) -> Result<Vec<String>> {
        if instructions.is_empty() {
            return Ok(Vec::new());
        }
        let tokens = self.tokenize_instructions(instructions)?;
        let generation = generate_logits(
            self.backend.as_ref(),
            &tokens,
            &self.hooks,
            &GenerateOptions {
                max_new_tokens,
                drop_refusals: false,
                stop_at_eos,
            },
            &HashSet::new(),
            self.tokenizer.eos_id(),
        )?;
        tokens
            .iter()
            .zip(&generation.generated)
            .map(|(prompt, continuation)| {
                let mut ids = prompt.clone();
                ids.extend(continuation);
                self.tokenizer.decode(&ids)
            })
            .collect()
    }

    /// Generate for the first `n` harmful test instructions, `batch_size`
    /// at a time, logging each completion.
    ///
    /// # Errors
    ///
    /// Propagates [`generate`](Self::generate) errors.
    pub fn test(&self, n: usize, batch_size: usize, max_new_tokens: usize) -> Result<Vec<String>> {
        let test = &self.corpus.harmful.test;
        let selected = test.get(..n.min(test.len())).unwrap_or_default();
        let mut completions = Vec::with_capacity(selected.len());
        for batch in selected.chunks(batch_size.max(1)) {
            for completion in self.generate(batch, max_new_tokens, true)? {
                tracing::info!("{completion}");
                completions.push(completion);
            }
        }
        Ok(completions)
    }

    // --- Activation caching --------------------------------------------------

    /// Tokenize the first `n` harmful and harmless training instructions as
    /// one batch (shared padding) and return the two halves.
    fn aligned_training_tokens(&self, n: usize) -> Result<(Vec<Vec<u32>>, Vec<Vec<u32>>)> {
        let harmful = &self.corpus.harmful.train;
        let harmless = &self.corpus.harmless.train;
        let split = n.min(harmful.len());
        let instructions: Vec<String> = harmful
            .iter()
            .take(n)
            .chain(harmless.iter().take(n))
            .cloned()
            .collect();
        let mut tokens = self.tokenize_instructions(&instructions)?;
        let harmless_tokens = tokens.split_off(split);
        Ok((tokens, harmless_tokens))
    }

    /// Store builder over the configured sites.
    fn store_builder(&self, batch_size: usize, pooling_window: usize, score_window: usize) -> StoreBuilder<'_> {
        StoreBuilder {
            backend: self.backend.as_ref(),
            sites: self.activation_points(),
            hooks: &self.hooks,
            token_sets: &self.token_sets,
            eos_id: self.tokenizer.eos_id(),
            batch_size,
            pooling_window,
            score_window,
        }
    }

    /// Build the harmful (and unless preserved, harmless) activation stores.
    ///
    /// # Errors
    ///
    /// Propagates tokenizer and runner errors. When building fails the
    /// stores are empty under `reset`, and left as they were otherwise.
    pub fn cache_activations(&mut self, options: &CacheOptions) -> Result<()> {
        if self.scoped {
            tracing::warn!("caching activations inside a modification scope");
        }
        if self.modified {
            tracing::warn!("caching activations on a modified model");
        }
        let preserve = options.preserve_harmless && !self.harmless.is_empty();
        if preserve {
            tracing::info!(
                prompts = self.harmless.num_prompts(),
                "reusing cached harmless activations"
            );
        }

        if options.reset {
            self.harmful = ActivationStore::new();
            self.harmful_labels.clear();
            if !preserve {
                self.harmless = ActivationStore::new();
                self.harmless_labels.clear();
            }
        }

        let (harmful_tokens, harmless_tokens) = self.aligned_training_tokens(options.n)?;
        let builder = self.store_builder(options.batch_size, options.pooling_window, options.score_window);

        tracing::info!(prompts = harmful_tokens.len(), "caching harmful activations");
        let (harmful, harmful_labels) = builder.build(&harmful_tokens)?;
        let harmless = if preserve || harmless_tokens.is_empty() {
            None
        } else {
            tracing::info!(prompts = harmless_tokens.len(), "caching harmless activations");
            Some(builder.build(&harmless_tokens)?)
        };

        // Labels describe the rows of their store and are replaced with it.
        self.harmful = harmful;
        self.harmful_labels = harmful_labels.unwrap_or_default();
        if let Some((store, labels)) = harmless {
            self.harmless = store;
            self.harmless_labels = labels.unwrap_or_default();
        }
        tracing::info!(sites = self.harmful.len(), "activation cache ready");
        Ok(())
    }

    /// Mean squared error, per site, between harmless activations of the
    /// current model and the cached harmless store.
    ///
    /// A rough measure of how far edits moved ordinary behaviour.
    ///
    /// # Errors
    ///
    /// Returns [`AbliterationError::State`] if no harmless cache exists,
    /// and propagates tokenizer and runner errors.
    pub fn mse_against_harmless(
        &self,
        n: usize,
        batch_size: usize,
        pooling_window: usize,
    ) -> Result<BTreeMap<HookPoint, f32>> {
        if self.harmless.is_empty() {
            return Err(AbliterationError::State(
                "no harmless activation cache; call cache_activations first".into(),
            ));
        }
        let (_, mut harmless_tokens) = self.aligned_training_tokens(n)?;
        harmless_tokens.truncate(n);
        let (current, _) = self.store_builder(batch_size, pooling_window, 0).build(&harmless_tokens)?;

        let mut errors = BTreeMap::new();
        for (site, fresh) in current.iter() {
            let cached = self.harmless.require(site)?;
            let rows = fresh.dim(0)?.min(cached.dim(0)?).min(n);
            let fresh = fresh.narrow(0, 0, rows)?.to_dtype(DType::F32)?;
            let cached = cached.narrow(0, 0, rows)?.to_dtype(DType::F32)?;
            let mse = (fresh - cached)?.sqr()?.mean_all()?.to_scalar::<f32>()?;
            errors.insert(site.clone(), mse);
        }
        Ok(errors)
    }

    // --- Accessors -----------------------------------------------------------

    /// Model being edited.
    #[must_use]
    pub fn backend(&self) -> &dyn AbliterationBackend {
        self.backend.as_ref()
    }

    /// Prompt tokenizer.
    #[must_use]
    pub fn tokenizer(&self) -> &dyn PromptTokenizer {
        self.tokenizer.as_ref()
    }

    /// Prompt format.
    #[must_use]
    pub const fn template(&self) -> &ChatTemplate {
        &self.template
    }

    /// Replace the prompt format.
    pub fn set_template(&mut self, template: ChatTemplate) {
        self.template = template;
    }

    /// Instruction corpus.
    #[must_use]
    pub const fn corpus(&self) -> &Corpus {
        &self.corpus
    }

    /// Configured short site names.
    #[must_use]
    pub fn sites(&self) -> &[String] {
        &self.sites
    }

    /// Scoring vocabulary.
    #[must_use]
    pub const fn token_sets(&self) -> &TokenSets {
        &self.token_sets
    }

    /// Cached harmful activations.
    #[must_use]
    pub const fn harmful(&self) -> &ActivationStore {
        &self.harmful
    }

    /// Cached harmless activations.
    #[must_use]
    pub const fn harmless(&self) -> &ActivationStore {
        &self.harmless
    }

    /// Refusal labels of the harmful cache (empty unless caching generated
    /// more than one token).
    #[must_use]
    pub fn harmful_labels(&self) -> &[f32] {
        &self.harmful_labels
    }

    /// Refusal labels of the harmless cache.
    #[must_use]
    pub fn harmless_labels(&self) -> &[f32] {
        &self.harmless_labels
    }

    /// Weight edits since the last reset.
    #[must_use]
    pub const fn log(&self) -> &ModificationLog {
        &self.log
    }

    /// Whether any weight differs from the original.
    #[must_use]
    pub const fn is_modified(&self) -> bool {
        self.modified
    }

    /// Interventions applied to every forward pass.
    #[must_use]
    pub const fn hooks(&self) -> &HookSpec {
        &self.hooks
    }

    /// Mutable access to the session-wide interventions.
    pub fn hooks_mut(&mut self) -> &mut HookSpec {
        &mut self.hooks
    }
}

// ---------------------------------------------------------------------------
// Abliterator
// ---------------------------------------------------------------------------

/// Owner of an [`AbliterationContext`].
///
/// Derefs to the context for every operation; adds the scope-based ones
/// ([`scope`](Self::scope), [`test_dir`](Self::test_dir),
/// [`find_best_refusal_dir`](Self::find_best_refusal_dir)).
pub struct Abliterator {
    /// The session state.
    ctx: AbliterationContext,
}

impl Abliterator {
    /// Start a session over `backend`.
    ///
    /// Captures the original parameters for [`reset_state`](AbliterationContext::reset_state).
    ///
    /// # Errors
    ///
    /// Returns [`AbliterationError::Config`] if the configuration is
    /// invalid or a scoring token lies outside the vocabulary, and
    /// propagates snapshot errors.
    pub fn new(
        backend: Box<dyn AbliterationBackend>,
        tokenizer: Box<dyn PromptTokenizer>,
        corpus: Corpus,
        config: &AbliteratorConfig,
    ) -> Result<Self> {
        config.validate()?;
        let token_sets = config.token_sets()?;
        let vocab = backend.vocab_size();
        if let Some(max_id) = token_sets.max_id() {
            if usize::try_from(max_id).map_or(true, |id| id >= vocab) {
                return Err(AbliterationError::Config(format!(
                    "scoring token {max_id} outside vocabulary of {vocab}"
                )));
            }
        }
        let original = ParamSnapshot::capture(backend.as_ref())?;
        tracing::info!(
            layers = backend.num_layers(),
            hidden = backend.hidden_size(),
            parameters = original.len(),
            "abliteration session ready"
        );

        Ok(Self {
            ctx: AbliterationContext {
                backend,
                tokenizer,
                template: config.template()?,
                corpus,
                sites: config.activation_sites.clone(),
                token_sets,
                harmful: ActivationStore::new(),
                harmless: ActivationStore::new(),
                harmful_labels: Vec::new(),
                harmless_labels: Vec::new(),
                log: ModificationLog::new(),
                checkpoints: Vec::new(),
                blacklist: BTreeSet::new(),
                modified: false,
                scoped: false,
                original,
                hooks: HookSpec::new(),
            },
        })
    }

    /// Exclusive access to the context.
    pub(crate) fn context_mut(&mut self) -> &mut AbliterationContext {
        &mut self.ctx
    }

    /// Give up the owner, keeping the session state.
    #[must_use]
    pub fn into_context(self) -> AbliterationContext {
        self.ctx
    }
}

impl Deref for Abliterator {
    type Target = AbliterationContext;

    fn deref(&self) -> &Self::Target {
        &self.ctx
    }
}

impl DerefMut for Abliterator {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.ctx
    }
}
