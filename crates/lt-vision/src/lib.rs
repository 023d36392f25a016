// SPDX-License-Identifier: AGPL-3.0-or-later
// Part of LatentTorch — Licensed under AGPL-3.0-or-later.

//! Vision backbones for LatentTorch: the adversarial generative encoder pair
//! and the introspective-VAE encoder/generator, assembled from `lt-nn`
//! layers. Images travel as `[batch, channels * height * width]` matrices in
//! channel-first order.

pub mod models;

pub use models::{
    reparameterize, AgeConfig, AgeEncoder, AgeGenerator, IntroConfig, IntroEncoder,
    IntroGenerator, ResidualBlock, ResidualKind,
};
