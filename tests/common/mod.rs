// SPDX-License-Identifier: MIT OR Apache-2.0

//! Deterministic toy model and word tokenizer shared by the integration
//! tests.
//!
//! Vocabulary: `<pad> <eos> bad good refuse comply please now`. Embedding
//! and unembedding are tied; `bad`, `good`, `refuse` and `comply` map to
//! the four basis vectors, everything else to zero. Layers are
//! position-wise (`h += h·W_attn`, then `h += h·W_mlp`); layer 0 is the
//! identity, layers 1 and 2 write `refuse` for `bad` (attention) and
//! `comply` for `good` (MLP). A harmful prompt therefore refuses with
//! probability ~0.86.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::collections::HashMap;

use candle_abliterate::{
    AbliterationBackend, AbliterationError, Abliterator, AbliteratorConfig, Corpus, HookCache,
    HookPoint, HookSpec, InstructionSplit, PromptTokenizer, Result, WeightKind, apply_intervention,
    load_varmap_parameters, varmap_parameters,
};
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::VarMap;

pub const D_MODEL: usize = 4;
pub const N_LAYERS: usize = 3;
pub const WORDS: [&str; 8] = ["<pad>", "<eos>", "bad", "good", "refuse", "comply", "please", "now"];
pub const PAD: u32 = 0;
pub const EOS: u32 = 1;
pub const REFUSE: u32 = 4;
pub const COMPLY: u32 = 5;

// ---------------------------------------------------------------------------
// Toy model
// ---------------------------------------------------------------------------

pub struct ToyModel {
    varmap: VarMap,
    device: Device,
}

fn weight_name(layer: usize, kind: WeightKind) -> String {
    format!("blocks.{layer}.{kind}")
}

fn insert(varmap: &VarMap, name: &str, rows: &[[f32; D_MODEL]]) {
    let flat: Vec<f32> = rows.iter().flatten().copied().collect();
    let tensor = Tensor::from_vec(flat, (rows.len(), D_MODEL), &Device::Cpu).unwrap();
    varmap
        .data()
        .lock()
        .unwrap()
        .insert(name.to_string(), Var::from_tensor(&tensor).unwrap());
}

impl ToyModel {
    pub fn new() -> Self {
        let varmap = VarMap::new();
        let zero = [0.0; D_MODEL];
        insert(
            &varmap,
            "embed",
            &[
                zero,
                zero,
                [1.0, 0.0, 0.0, 0.0],
                [0.0, 1.0, 0.0, 0.0],
                [0.0, 0.0, 1.0, 0.0],
                [0.0, 0.0, 0.0, 1.0],
                zero,
                zero,
            ],
        );
        for layer in 0..N_LAYERS {
            let (attn, mlp) = if layer == 0 {
                ([zero; D_MODEL], [zero; D_MODEL])
            } else {
                (
                    [[0.0, 0.0, 2.0, 0.0], zero, zero, zero],
                    [zero, [0.0, 0.0, 0.0, 2.0], zero, zero],
                )
            };
            insert(&varmap, &weight_name(layer, WeightKind::AttnOut), &attn);
            insert(&varmap, &weight_name(layer, WeightKind::MlpOut), &mlp);
        }
        Self {
            varmap,
            device: Device::Cpu,
        }
    }

    fn param(&self, name: &str) -> Result<Tensor> {
        let data = self.varmap.data().lock().unwrap();
        data.get(name)
            .map(|var| var.as_tensor().clone())
            .ok_or_else(|| AbliterationError::Index(format!("no parameter `{name}`")))
    }

    fn hook(
        hooks: &HookSpec,
        point: HookPoint,
        mut h: Tensor,
        captured: &mut Vec<(HookPoint, Tensor)>,
    ) -> Result<Tensor> {
        for intervention in hooks.interventions_at(&point) {
            h = apply_intervention(&h, intervention)?;
        }
        if hooks.is_captured(&point) {
            captured.push((point, h.clone()));
        }
        Ok(h)
    }
}

impl AbliterationBackend for ToyModel {
    fn num_layers(&self) -> usize {
        N_LAYERS
    }

    fn hidden_size(&self) -> usize {
        D_MODEL
    }

    fn vocab_size(&self) -> usize {
        WORDS.len()
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn forward(&self, input_ids: &Tensor, hooks: &HookSpec) -> Result<HookCache> {
        let (batch, seq) = input_ids.dims2()?;
        let embed = self.param("embed")?;
        let mut h = embed
            .index_select(&input_ids.flatten_all()?, 0)?
            .reshape((batch, seq, D_MODEL))?;
        let mut captured = Vec::new();

        for layer in 0..N_LAYERS {
            let w_attn = self.param(&weight_name(layer, WeightKind::AttnOut))?;
            let w_mlp = self.param(&weight_name(layer, WeightKind::MlpOut))?;

            h = Self::hook(hooks, HookPoint::ResidPre(layer), h, &mut captured)?;
            let attn = h.broadcast_matmul(&w_attn)?;
            let attn = Self::hook(hooks, HookPoint::AttnOut(layer), attn, &mut captured)?;
            h = (h + attn)?;
            h = Self::hook(hooks, HookPoint::ResidMid(layer), h, &mut captured)?;
            let mlp = h.broadcast_matmul(&w_mlp)?;
            let mlp = Self::hook(hooks, HookPoint::MlpOut(layer), mlp, &mut captured)?;
            h = (h + mlp)?;
            h = Self::hook(hooks, HookPoint::ResidPost(layer), h, &mut captured)?;
        }

        let logits = self.project_to_vocab(&h)?;
        let mut cache = HookCache::new(logits);
        for (point, tensor) in captured {
            cache.store(point, tensor);
        }
        Ok(cache)
    }

    fn project_to_vocab(&self, hidden: &Tensor) -> Result<Tensor> {
        let embed = self.param("embed")?;
        Ok(hidden.broadcast_matmul(&embed.t()?.contiguous()?)?)
    }

    fn weight(&self, layer: usize, kind: WeightKind) -> Result<Tensor> {
        if layer >= N_LAYERS {
            return Err(AbliterationError::Index(format!("layer {layer}")));
        }
        self.param(&weight_name(layer, kind))
    }

    fn set_weight(&mut self, layer: usize, kind: WeightKind, weight: Tensor) -> Result<()> {
        let data = self.varmap.data().lock().unwrap();
        let var = data
            .get(&weight_name(layer, kind))
            .ok_or_else(|| AbliterationError::Index(format!("layer {layer}")))?;
        var.set(&weight)?;
        Ok(())
    }

    fn named_parameters(&self) -> Result<Vec<(String, Tensor)>> {
        varmap_parameters(&self.varmap)
    }

    fn load_parameters(&mut self, params: &HashMap<String, Tensor>) -> Result<()> {
        load_varmap_parameters(&self.varmap, params)
    }
}

// ---------------------------------------------------------------------------
// Successor model
// ---------------------------------------------------------------------------

/// Predicts `NEXT[token]` at every position; no weights.
pub struct Successor {
    device: Device,
}

/// `bad -> please -> <eos>`, `good <-> now`, `refuse <-> comply`.
pub const NEXT: [u32; 8] = [0, 1, 6, 7, 5, 4, 1, 3];

impl Successor {
    pub fn new() -> Self {
        Self {
            device: Device::Cpu,
        }
    }
}

impl AbliterationBackend for Successor {
    fn num_layers(&self) -> usize {
        1
    }

    fn hidden_size(&self) -> usize {
        WORDS.len()
    }

    fn vocab_size(&self) -> usize {
        WORDS.len()
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn forward(&self, input_ids: &Tensor, _hooks: &HookSpec) -> Result<HookCache> {
        let (batch, seq) = input_ids.dims2()?;
        let vocab = WORDS.len();
        let mut one_hot = vec![0.0_f32; batch * seq * vocab];
        for (pos, token) in input_ids.flatten_all()?.to_vec1::<u32>()?.into_iter().enumerate() {
            let next = NEXT[usize::try_from(token).unwrap()];
            one_hot[pos * vocab + usize::try_from(next).unwrap()] = 1.0;
        }
        Ok(HookCache::new(Tensor::from_vec(
            one_hot,
            (batch, seq, vocab),
            &self.device,
        )?))
    }

    fn project_to_vocab(&self, hidden: &Tensor) -> Result<Tensor> {
        Ok(hidden.clone())
    }

    fn weight(&self, _layer: usize, _kind: WeightKind) -> Result<Tensor> {
        Ok(Tensor::zeros((1, WORDS.len()), DType::F32, &self.device)?)
    }

    fn set_weight(&mut self, _layer: usize, _kind: WeightKind, _weight: Tensor) -> Result<()> {
        Ok(())
    }

    fn named_parameters(&self) -> Result<Vec<(String, Tensor)>> {
        Ok(Vec::new())
    }

    fn load_parameters(&mut self, _params: &HashMap<String, Tensor>) -> Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tokenizer and session helpers
// ---------------------------------------------------------------------------

/// Whitespace tokenizer over [`WORDS`].
pub struct WordTokenizer;

impl PromptTokenizer for WordTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        text.split_whitespace()
            .map(|word| {
                WORDS
                    .iter()
                    .position(|w| *w == word)
                    .and_then(|i| u32::try_from(i).ok())
                    .ok_or_else(|| AbliterationError::Tokenizer(format!("unknown word `{word}`")))
            })
            .collect()
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        let words: Vec<&str> = ids
            .iter()
            .filter(|&&id| id != PAD && id != EOS)
            .map(|&id| WORDS[usize::try_from(id).unwrap()])
            .collect();
        Ok(words.join(" "))
    }

    fn pad_id(&self) -> u32 {
        PAD
    }

    fn eos_id(&self) -> u32 {
        EOS
    }
}

const PREFIXES: [&str; 8] = [
    "",
    "please ",
    "now ",
    "please now ",
    "now please ",
    "please please ",
    "now now ",
    "please now please ",
];

/// Eight prompts ending in `last`.
pub fn prompts(last: &str) -> Vec<String> {
    PREFIXES.iter().map(|p| format!("{p}{last}")).collect()
}

/// Both classes train and test on the same eight prompts.
pub fn corpus() -> Corpus {
    Corpus::new(
        InstructionSplit::new(prompts("bad"), prompts("bad")),
        InstructionSplit::new(prompts("good"), prompts("good")),
    )
    .unwrap()
}

pub fn config() -> AbliteratorConfig {
    AbliteratorConfig {
        activation_sites: vec!["resid_pre".into(), "resid_post".into()],
        positive_tokens: Some(vec![COMPLY]),
        negative_tokens: Some(vec![REFUSE]),
        chat_template: Some("{instruction}".into()),
    }
}

pub fn abliterator() -> Abliterator {
    Abliterator::new(
        Box::new(ToyModel::new()),
        Box::new(WordTokenizer),
        corpus(),
        &config(),
    )
    .unwrap()
}

/// Every parameter as flat `f32` values, by name.
pub fn parameters(abliterator: &Abliterator) -> Vec<(String, Vec<f32>)> {
    abliterator
        .backend()
        .named_parameters()
        .unwrap()
        .into_iter()
        .map(|(name, t)| (name, t.flatten_all().unwrap().to_vec1::<f32>().unwrap()))
        .collect()
}

/// Flat values of one output matrix.
pub fn matrix(abliterator: &Abliterator, layer: usize, kind: WeightKind) -> Vec<f32> {
    abliterator
        .backend()
        .weight(layer, kind)
        .unwrap()
        .flatten_all()
        .unwrap()
        .to_vec1::<f32>()
        .unwrap()
}
