// SPDX-License-Identifier: AGPL-3.0-or-later
// Part of LatentTorch — Licensed under AGPL-3.0-or-later.

//! Neural-network building blocks over the dense [`lt_tensor::Tensor`].
//!
//! Feature maps are carried as `[batch, channels * height * width]` matrices
//! in row-major channel-first order. Layers implement the [`module::Module`]
//! trait; convolutional stacks are declared through [`stack::StackBuilder`]
//! and batch fan-out across worker threads goes through
//! [`parallel::DataParallel`].

pub mod io;
pub mod layers;
pub mod module;
pub mod parallel;
pub mod stack;

pub use lt_tensor::{PureResult, Tensor, TensorError};

pub use layers::{
    AvgPool2d, BatchNorm2d, Conv2d, ConvTranspose2d, LeakyRelu, Linear, Relu, Sequential, Tanh,
    Upsample2d,
};
pub use module::{BoxedModule, Module, Parameter};
pub use parallel::{available_devices, check_devices, parallel_apply, DataParallel};
pub use stack::{LayerSpec, Stack, StackBuilder};
