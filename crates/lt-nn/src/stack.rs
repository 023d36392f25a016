// SPDX-License-Identifier: AGPL-3.0-or-later
// Part of LatentTorch — Licensed under AGPL-3.0-or-later.

use crate::layers::conv::{conv_output_hw, deconv_output_hw, pool_output_hw};
use crate::layers::{
    AvgPool2d, BatchNorm2d, Conv2d, ConvTranspose2d, LeakyRelu, Relu, Sequential, Tanh,
    Upsample2d,
};
use crate::{PureResult, TensorError};

/// Declarative description of one layer in a convolutional stack.
///
/// Kernel, stride and padding are square; the builder threads the channel
/// count and spatial extent through the stack so each descriptor only states
/// what changes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LayerSpec {
    /// Strided convolution to `out_channels`.
    Conv {
        out_channels: usize,
        kernel: usize,
        stride: usize,
        padding: usize,
        bias: bool,
    },
    /// Fractionally-strided convolution to `out_channels`.
    ConvTranspose {
        out_channels: usize,
        kernel: usize,
        stride: usize,
        padding: usize,
        bias: bool,
    },
    /// Batch normalisation over the current channel count.
    BatchNorm,
    /// Rectified linear activation.
    Relu,
    /// Leaky rectified linear activation.
    LeakyRelu { negative_slope: f32 },
    /// Hyperbolic tangent activation.
    Tanh,
    /// Average pooling.
    AvgPool { kernel: usize, stride: usize },
    /// Nearest-neighbour upsampling.
    Upsample { scale: usize },
}

/// A compiled stack together with its output geometry.
#[derive(Debug)]
pub struct Stack {
    net: Sequential,
    out_channels: usize,
    out_hw: (usize, usize),
}

impl Stack {
    /// Consumes the stack and returns the compiled network.
    pub fn into_net(self) -> Sequential {
        self.net
    }

    /// Borrows the compiled network.
    pub fn net(&self) -> &Sequential {
        &self.net
    }

    /// Channel count of the final feature map.
    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    /// Spatial extent of the final feature map.
    pub fn out_hw(&self) -> (usize, usize) {
        self.out_hw
    }
}

/// Builder that turns a list of [`LayerSpec`] descriptors into a
/// [`Sequential`] in a single compilation pass.
#[derive(Debug, Clone)]
pub struct StackBuilder {
    name: String,
    in_channels: usize,
    input_hw: (usize, usize),
    momentum: f32,
    epsilon: f32,
    specs: Vec<LayerSpec>,
}

impl StackBuilder {
    /// Starts a stack over `in_channels` maps of extent `input_hw`.
    pub fn new(name: impl Into<String>, in_channels: usize, input_hw: (usize, usize)) -> Self {
        Self {
            name: name.into(),
            in_channels,
            input_hw,
            momentum: 0.1,
            epsilon: 1e-5,
            specs: Vec::new(),
        }
    }

    /// Overrides the momentum used by every batch-norm descriptor.
    pub fn with_momentum(mut self, momentum: f32) -> Self {
        self.momentum = momentum;
        self
    }

    /// Overrides the epsilon used by every batch-norm descriptor.
    pub fn with_epsilon(mut self, epsilon: f32) -> Self {
        self.epsilon = epsilon;
        self
    }

    /// Appends a descriptor to the stack.
    pub fn push(mut self, spec: LayerSpec) -> Self {
        self.specs.push(spec);
        self
    }

    /// Appends a sequence of descriptors to the stack.
    pub fn extend(mut self, specs: impl IntoIterator<Item = LayerSpec>) -> Self {
        self.specs.extend(specs);
        self
    }

    /// Compiles the descriptors into a [`Sequential`], threading channel count
    /// and spatial extent from one layer to the next.
    pub fn build(self) -> PureResult<Stack> {
        let mut net = Sequential::new();
        let mut channels = self.in_channels;
        let mut hw = self.input_hw;
        for (index, spec) in self.specs.into_iter().enumerate() {
            match spec {
                LayerSpec::Conv {
                    out_channels,
                    kernel,
                    stride,
                    padding,
                    bias,
                } => {
                    let conv = Conv2d::new(
                        format!("{}.{index}", self.name),
                        channels,
                        out_channels,
                        (kernel, kernel),
                        (stride, stride),
                        (padding, padding),
                        hw,
                    )?;
                    hw = conv_output_hw(hw, (kernel, kernel), (stride, stride), (padding, padding))?;
                    channels = out_channels;
                    if bias {
                        net.push(conv);
                    } else {
                        net.push(conv.without_bias());
                    }
                }
                LayerSpec::ConvTranspose {
                    out_channels,
                    kernel,
                    stride,
                    padding,
                    bias,
                } => {
                    let deconv = ConvTranspose2d::new(
                        format!("{}.{index}", self.name),
                        channels,
                        out_channels,
                        (kernel, kernel),
                        (stride, stride),
                        (padding, padding),
                        hw,
                    )?;
                    hw = deconv_output_hw(hw, (kernel, kernel), (stride, stride), (padding, padding))?;
                    channels = out_channels;
                    if bias {
                        net.push(deconv);
                    } else {
                        net.push(deconv.without_bias());
                    }
                }
                LayerSpec::BatchNorm => {
                    net.push(BatchNorm2d::new(
                        format!("{}.{index}", self.name),
                        channels,
                        self.momentum,
                        self.epsilon,
                    )?);
                }
                LayerSpec::Relu => net.push(Relu),
                LayerSpec::LeakyRelu { negative_slope } => {
                    net.push(LeakyRelu::new(negative_slope)?);
                }
                LayerSpec::Tanh => net.push(Tanh),
                LayerSpec::AvgPool { kernel, stride } => {
                    let pool =
                        AvgPool2d::new(channels, (kernel, kernel), (stride, stride), hw)?;
                    hw = pool_output_hw(hw, (kernel, kernel), (stride, stride), (0, 0))?;
                    net.push(pool);
                }
                LayerSpec::Upsample { scale } => {
                    if scale == 0 {
                        return Err(TensorError::InvalidValue {
                            label: "upsample_scale",
                        });
                    }
                    net.push(Upsample2d::new(channels, scale, hw)?);
                    hw = (hw.0 * scale, hw.1 * scale);
                }
            }
        }
        Ok(Stack {
            net,
            out_channels: channels,
            out_hw: hw,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::Module;
    use crate::Tensor;

    #[test]
    fn stack_threads_geometry_through_descriptors() {
        let stack = StackBuilder::new("enc", 3, (32, 32))
            .push(LayerSpec::Conv {
                out_channels: 8,
                kernel: 4,
                stride: 2,
                padding: 1,
                bias: false,
            })
            .push(LayerSpec::BatchNorm)
            .push(LayerSpec::LeakyRelu {
                negative_slope: 0.2,
            })
            .push(LayerSpec::AvgPool {
                kernel: 2,
                stride: 2,
            })
            .build()
            .unwrap();
        assert_eq!(stack.out_channels(), 8);
        assert_eq!(stack.out_hw(), (8, 8));
        let input = Tensor::random_uniform(2, 3 * 32 * 32, -1.0, 1.0, Some(11)).unwrap();
        let output = stack.net().forward(&input).unwrap();
        assert_eq!(output.shape(), (2, 8 * 8 * 8));
    }

    #[test]
    fn stack_compiles_transposed_and_upsample_descriptors() {
        let stack = StackBuilder::new("gen", 16, (1, 1))
            .push(LayerSpec::ConvTranspose {
                out_channels: 8,
                kernel: 4,
                stride: 1,
                padding: 0,
                bias: false,
            })
            .push(LayerSpec::Relu)
            .push(LayerSpec::Upsample { scale: 2 })
            .push(LayerSpec::Conv {
                out_channels: 3,
                kernel: 1,
                stride: 1,
                padding: 0,
                bias: true,
            })
            .push(LayerSpec::Tanh)
            .build()
            .unwrap();
        assert_eq!(stack.out_channels(), 3);
        assert_eq!(stack.out_hw(), (8, 8));
        let latent = Tensor::random_uniform(2, 16, -1.0, 1.0, Some(23)).unwrap();
        let output = stack.net().forward(&latent).unwrap();
        assert_eq!(output.shape(), (2, 3 * 8 * 8));
        for value in output.data() {
            assert!((-1.0..=1.0).contains(value));
        }
    }

    #[test]
    fn stack_rejects_geometry_underflow() {
        let result = StackBuilder::new("bad", 1, (2, 2))
            .push(LayerSpec::Conv {
                out_channels: 1,
                kernel: 4,
                stride: 2,
                padding: 0,
                bias: true,
            })
            .build();
        assert!(result.is_err());
    }
}
