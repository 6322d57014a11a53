// SPDX-License-Identifier: MIT OR Apache-2.0

//! Activation caching.
//!
//! - [`ActivationStore`]: pooled `[num_prompts, d_model]` records per site.
//! - [`StoreBuilder`]: batched capture and pooling through the runner.

mod activation;
mod builder;

pub use activation::{ActivationStore, pool_last};
pub use builder::StoreBuilder;
