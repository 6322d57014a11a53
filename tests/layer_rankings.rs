// SPDX-License-Identifier: MIT OR Apache-2.0

//! Residual decomposition and layer rankings on the toy model.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]

mod common;

use candle_abliterate::{
    AbliterationError, Abliterator, AbliteratorConfig, CacheOptions, HookPoint, LayerRanking,
    ResidualMode,
};

use common::{COMPLY, N_LAYERS, REFUSE, ToyModel, WordTokenizer, abliterator, config, corpus};

fn options() -> CacheOptions {
    CacheOptions {
        n: 8,
        batch_size: 4,
        ..CacheOptions::default()
    }
}

/// Toy session caching every block output as well as the stream.
fn fully_cached() -> Abliterator {
    let config = AbliteratorConfig {
        activation_sites: ["resid_pre", "attn_out", "mlp_out", "resid_post"]
            .into_iter()
            .map(String::from)
            .collect(),
        ..config()
    };
    let mut ab = Abliterator::new(
        Box::new(ToyModel::new()),
        Box::new(WordTokenizer),
        corpus(),
        &config,
    )
    .unwrap();
    ab.cache_activations(&options()).unwrap();
    ab
}

fn ranking_at(rankings: &[LayerRanking], site: &HookPoint) -> LayerRanking {
    rankings
        .iter()
        .find(|r| &r.site == site)
        .cloned()
        .expect("ranking for site")
}

#[test]
fn decomposed_components_sum_to_final_stream() {
    let ab = fully_cached();
    let stack = ab.residual_stack(ResidualMode::Decomposed).unwrap();
    assert_eq!(stack.labels.len(), 1 + 2 * N_LAYERS);
    assert_eq!(stack.labels[0], HookPoint::ResidPre(0));
    assert_eq!(stack.harmful.dims(), &[1 + 2 * N_LAYERS, 8, 4]);

    let summed: Vec<Vec<f32>> = stack.harmful.sum(0).unwrap().to_vec2().unwrap();
    let last: Vec<Vec<f32>> = ab
        .harmful()
        .require(&HookPoint::ResidPost(N_LAYERS - 1))
        .unwrap()
        .to_vec2()
        .unwrap();
    assert_eq!(summed, last);
}

#[test]
fn rankings_locate_the_writing_block() {
    let ab = fully_cached();
    let rankings = ab
        .layer_rankings(&[REFUSE], ResidualMode::Decomposed, Some(&[COMPLY]))
        .unwrap();
    assert_eq!(rankings.len(), 1 + 2 * N_LAYERS);

    // The embedding of `bad` / `good` outranks both answer tokens.
    let embed = ranking_at(&rankings, &HookPoint::ResidPre(0));
    assert_eq!((embed.harmful_rank, embed.harmless_rank), (1, 1));
    // Attention writes `refuse` for harmful prompts, the MLP `comply`
    // for harmless ones.
    assert_eq!(ranking_at(&rankings, &HookPoint::AttnOut(1)).harmful_rank, 0);
    assert_eq!(ranking_at(&rankings, &HookPoint::MlpOut(1)).harmless_rank, 0);
}

#[test]
fn accumulated_stream_ends_on_refusal() {
    let mut ab = abliterator();
    ab.cache_activations(&options()).unwrap();
    let rankings = ab
        .layer_rankings(&[REFUSE], ResidualMode::Accumulated, None)
        .unwrap();
    let sites: Vec<HookPoint> = rankings.iter().map(|r| r.site.clone()).collect();
    assert_eq!(
        sites,
        vec![
            HookPoint::ResidPre(0),
            HookPoint::ResidPre(1),
            HookPoint::ResidPre(2),
            HookPoint::ResidPost(2),
        ]
    );
    assert_eq!(rankings[1].harmful_rank, 1);
    assert_eq!(rankings[3].harmful_rank, 0);
}

#[test]
fn decomposition_needs_block_outputs() {
    let mut ab = abliterator();
    assert!(matches!(
        ab.residual_stack(ResidualMode::Accumulated),
        Err(AbliterationError::State(_))
    ));
    ab.cache_activations(&options()).unwrap();
    assert!(matches!(
        ab.residual_stack(ResidualMode::Decomposed),
        Err(AbliterationError::Index(_))
    ));
    assert!(matches!(
        ab.layer_rankings(&[99], ResidualMode::Accumulated, None),
        Err(AbliterationError::Index(_))
    ));
}
