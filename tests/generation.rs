// SPDX-License-Identifier: MIT OR Apache-2.0

//! Greedy generation stops, and reducer parsing.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]

mod common;

use std::collections::HashSet;

use candle_abliterate::{
    AbliterationError, GenerateOptions, HookSpec, Reducer, TokenSets, generate_logits,
    reduce_logits,
};

use common::{EOS, REFUSE, Successor};

#[test]
fn end_marker_finishes_only_its_sequence() {
    // Third sequence ends in `bad`: `please` at step 1, `<eos>` at step 2.
    let prompts = vec![vec![6, 3], vec![6, 4], vec![6, 2], vec![6, 5]];
    let options = GenerateOptions {
        max_new_tokens: 4,
        drop_refusals: false,
        stop_at_eos: true,
    };
    let out = generate_logits(&Successor::new(), &prompts, &HookSpec::new(), &options, &HashSet::new(), EOS)
        .unwrap();

    assert_eq!(out.finished, vec![false, false, true, false]);
    assert_eq!(out.generated[2], vec![6, EOS]);
    assert_eq!(out.generated[0], vec![7, 3, 7, 3]);
    assert_eq!(out.generated[1], vec![5, 4, 5, 4]);
    assert_eq!(out.generated[3].len(), 4);
    assert_eq!(out.steps, 4);
    // The last pass ran without the finished sequence.
    assert_eq!(out.rows, vec![0, 1, 3]);
    assert_eq!(out.logits.dims()[0], 3);
}

#[test]
fn refusal_token_stops_every_sequence() {
    let prompts = vec![vec![3], vec![5]];
    let options = GenerateOptions {
        max_new_tokens: 4,
        drop_refusals: true,
        stop_at_eos: false,
    };
    let refusal: HashSet<u32> = [REFUSE].into_iter().collect();
    // `comply` -> `refuse` at step 1.
    let out = generate_logits(&Successor::new(), &prompts, &HookSpec::new(), &options, &refusal, EOS)
        .unwrap();
    assert!(out.stopped_on_refusal);
    assert_eq!(out.steps, 1);
    assert_eq!(out.generated, vec![vec![7], vec![REFUSE]]);
}

#[test]
fn unknown_reducer_names_the_valid_set() {
    let err = "average".parse::<Reducer>().unwrap_err();
    let AbliterationError::UnknownReducer { name, valid } = &err else {
        panic!("unexpected error {err:?}");
    };
    assert_eq!(name, "average");
    for reducer in Reducer::ALL {
        assert!(valid.contains(reducer.name()));
    }
}

#[test]
fn window_scores_follow_the_reducer() {
    let prompts = vec![vec![2], vec![4]];
    let options = GenerateOptions {
        max_new_tokens: 3,
        drop_refusals: false,
        stop_at_eos: false,
    };
    let out = generate_logits(&Successor::new(), &prompts, &HookSpec::new(), &options, &HashSet::new(), EOS)
        .unwrap();
    let sets = TokenSets::new(vec![5], vec![REFUSE]).unwrap();

    // Row 1 alternates refuse/comply; one-hot logits give softmax mass
    // e/(e+7) to the predicted token.
    let peak = 1.0_f32.exp() / (1.0_f32.exp() + 7.0);
    let max = reduce_logits(&out.logits, 3, Reducer::Max, &sets).unwrap();
    let negative: Vec<f32> = max.negative.to_vec1().unwrap();
    assert!((negative[1] - peak).abs() < 1e-5);

    let stacked = reduce_logits(&out.logits, 3, Reducer::Stack, &sets).unwrap();
    assert_eq!(stacked.negative.dims(), &[2, 3]);
}
