// SPDX-License-Identifier: AGPL-3.0-or-later
// Part of LatentTorch — Licensed under AGPL-3.0-or-later.

use lt_nn::layers::{AvgPool2d, BatchNorm2d, Conv2d, LeakyRelu, Linear, Relu, Upsample2d};
use lt_nn::module::{Module, Parameter};
use lt_nn::parallel::{check_devices, parallel_apply};
use lt_nn::{PureResult, Sequential};
use lt_tensor::{Tensor, TensorError};

/// Configuration for the introspective VAE backbones.
///
/// Only two topologies are hard-coded: 256x256 images with a 512-wide latent
/// and 128x128 images with a 256-wide latent.
#[derive(Clone, Debug)]
pub struct IntroConfig {
    pub image_dim: usize,
    pub image_channels: usize,
    pub latent_dim: usize,
    pub devices: usize,
}

impl Default for IntroConfig {
    fn default() -> Self {
        Self {
            image_dim: 256,
            image_channels: 3,
            latent_dim: 512,
            devices: 1,
        }
    }
}

impl IntroConfig {
    fn validate(&self) -> PureResult<()> {
        if self.image_channels == 0 {
            return Err(TensorError::InvalidValue {
                label: "introvae_image_channels",
            });
        }
        let required_latent = match self.image_dim {
            256 => 512,
            128 => 256,
            other => {
                return Err(TensorError::UnsupportedConfiguration {
                    label: "introvae_image_dim",
                    value: other,
                })
            }
        };
        if self.latent_dim != required_latent {
            return Err(TensorError::UnsupportedConfiguration {
                label: "introvae_latent_dim",
                value: self.latent_dim,
            });
        }
        check_devices(self.devices, lt_nn::available_devices())
    }

    // Channel width produced by the stem convolution.
    fn stem_channels(&self) -> usize {
        self.image_dim / 8
    }
}

/// Structural variant of a residual block, fixed at construction from the
/// channel comparison alone.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResidualKind {
    /// `in == out`. Plain residual add with a trailing norm + activation.
    Same,
    /// `in < out`. Channel-expanding shortcut; the residual add is *not*
    /// followed by another activation. The encoder relies on this asymmetry.
    Expand,
    /// `in > out`. Channel-reducing shortcut with a trailing norm +
    /// activation; the generator pairs it with nearest-neighbour upsampling.
    Reduce,
}

impl ResidualKind {
    /// Selects the variant from the channel counts alone.
    pub fn from_channels(in_channels: usize, out_channels: usize) -> Self {
        use std::cmp::Ordering;
        match in_channels.cmp(&out_channels) {
            Ordering::Equal => ResidualKind::Same,
            Ordering::Less => ResidualKind::Expand,
            Ordering::Greater => ResidualKind::Reduce,
        }
    }
}

/// Residual block shared by the IntroVAE encoder and generator.
///
/// The two main convolutions are shape-preserving (kernel 3, stride 1,
/// padding 1); the shortcut, when channels change, is a 1x1 convolution.
/// One norm and one activation instance are reused at both points of the
/// main path, mirroring how the block shares those parameters.
#[derive(Debug)]
pub struct ResidualBlock {
    kind: ResidualKind,
    conv1: Conv2d,
    conv2: Conv2d,
    norm: BatchNorm2d,
    act: LeakyRelu,
    shortcut: Option<Conv2d>,
    upsampler: Option<Upsample2d>,
    pool: Option<AvgPool2d>,
    devices: usize,
    in_channels: usize,
    input_hw: (usize, usize),
}

impl ResidualBlock {
    /// Builds a residual block over `input_hw` feature maps.
    ///
    /// `avg` requests a trailing 2x average pool and is honoured by the
    /// `Same` and `Expand` variants; `upsample` requests a leading 2x
    /// nearest-neighbour upsample and is honoured by `Same` and `Reduce`.
    /// The other combinations are ignored, matching the roles the encoder
    /// and generator assign to each variant.
    pub fn new(
        name: impl Into<String>,
        in_channels: usize,
        out_channels: usize,
        input_hw: (usize, usize),
        avg: bool,
        upsample: bool,
        devices: usize,
    ) -> PureResult<Self> {
        check_devices(devices, lt_nn::available_devices())?;
        let name = name.into();
        let kind = ResidualKind::from_channels(in_channels, out_channels);
        let upsample = upsample && kind != ResidualKind::Expand;
        let avg = avg && kind != ResidualKind::Reduce;
        let body_hw = if upsample {
            (input_hw.0 * 2, input_hw.1 * 2)
        } else {
            input_hw
        };
        let conv1 = Conv2d::new(
            format!("{name}::conv1"),
            in_channels,
            out_channels,
            (3, 3),
            (1, 1),
            (1, 1),
            body_hw,
        )?
        .without_bias();
        let conv2 = Conv2d::new(
            format!("{name}::conv2"),
            out_channels,
            out_channels,
            (3, 3),
            (1, 1),
            (1, 1),
            body_hw,
        )?
        .without_bias();
        let norm = BatchNorm2d::new(format!("{name}::norm"), out_channels, 0.1, 1e-5)?;
        let act = LeakyRelu::new(0.2)?;
        let shortcut = if kind == ResidualKind::Same {
            None
        } else {
            Some(
                Conv2d::new(
                    format!("{name}::shortcut"),
                    in_channels,
                    out_channels,
                    (1, 1),
                    (1, 1),
                    (0, 0),
                    body_hw,
                )?
                .without_bias(),
            )
        };
        let upsampler = if upsample {
            Some(Upsample2d::new(in_channels, 2, input_hw)?)
        } else {
            None
        };
        let pool = if avg {
            Some(AvgPool2d::new(out_channels, (2, 2), (2, 2), body_hw)?)
        } else {
            None
        };
        Ok(Self {
            kind,
            conv1,
            conv2,
            norm,
            act,
            shortcut,
            upsampler,
            pool,
            devices,
            in_channels,
            input_hw,
        })
    }

    /// Structural variant chosen at construction.
    pub fn kind(&self) -> ResidualKind {
        self.kind
    }

    /// Spatial extent of the produced feature map.
    pub fn output_hw(&self) -> (usize, usize) {
        let mut hw = self.input_hw;
        if self.upsampler.is_some() {
            hw = (hw.0 * 2, hw.1 * 2);
        }
        if self.pool.is_some() {
            hw = (hw.0 / 2, hw.1 / 2);
        }
        hw
    }

    fn guard_input(&self, input: &Tensor) -> PureResult<()> {
        let expected = self.in_channels * self.input_hw.0 * self.input_hw.1;
        if input.shape().1 != expected {
            return Err(TensorError::ShapeMismatch {
                left: input.shape(),
                right: (input.shape().0, expected),
            });
        }
        Ok(())
    }

    // The shared norm sits at two points of the pass; the replay variant is
    // used when recomputing activations for backward so the running
    // statistics only advance on the real forward pass.
    fn apply_norm(&self, input: &Tensor, replay: bool) -> PureResult<Tensor> {
        if replay {
            self.norm.replay_forward(input)
        } else {
            self.norm.forward(input)
        }
    }

    // conv1 -> norm -> act -> conv2, the dispatchable two-conv path.
    fn main_path(&self, input: &Tensor, replay: bool) -> PureResult<Tensor> {
        let c1 = self.conv1.forward(input)?;
        let a1 = self.act.forward(&self.apply_norm(&c1, replay)?)?;
        self.conv2.forward(&a1)
    }

    fn forward_same(&self, input: &Tensor, replay: bool) -> PureResult<Tensor> {
        let x = match &self.upsampler {
            Some(up) => up.forward(input)?,
            None => input.clone(),
        };
        let main = parallel_apply(&x, self.devices, |shard| self.main_path(shard, replay))?;
        let summed = main.add(&x)?;
        let out = self.act.forward(&self.apply_norm(&summed, replay)?)?;
        match &self.pool {
            Some(pool) => pool.forward(&out),
            None => Ok(out),
        }
    }

    fn forward_expand(&self, input: &Tensor, replay: bool) -> PureResult<Tensor> {
        let shortcut = self
            .shortcut
            .as_ref()
            .ok_or(TensorError::InvalidValue {
                label: "residual_shortcut_missing",
            })?
            .forward(input)?;
        let summed = self.main_path(input, replay)?.add(&shortcut)?;
        match &self.pool {
            Some(pool) => pool.forward(&summed),
            None => Ok(summed),
        }
    }

    fn forward_reduce(&self, input: &Tensor, replay: bool) -> PureResult<Tensor> {
        let x = match &self.upsampler {
            Some(up) => up.forward(input)?,
            None => input.clone(),
        };
        let shortcut = self
            .shortcut
            .as_ref()
            .ok_or(TensorError::InvalidValue {
                label: "residual_shortcut_missing",
            })?
            .forward(&x)?;
        let summed = self.main_path(&x, replay)?.add(&shortcut)?;
        self.act.forward(&self.apply_norm(&summed, replay)?)
    }

    fn backward_same(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        let x = match &self.upsampler {
            Some(up) => up.forward(input)?,
            None => input.clone(),
        };
        let c1 = self.conv1.forward(&x)?;
        let n1 = self.norm.replay_forward(&c1)?;
        let a1 = self.act.forward(&n1)?;
        let c2 = self.conv2.forward(&a1)?;
        let summed = c2.add(&x)?;
        let n2 = self.norm.replay_forward(&summed)?;
        let mut grad = match &mut self.pool {
            Some(pool) => {
                let a2 = self.act.forward(&n2)?;
                pool.backward(&a2, grad_output)?
            }
            None => grad_output.clone(),
        };
        grad = self.act.backward(&n2, &grad)?;
        grad = self.norm.backward(&summed, &grad)?;
        let grad_residual = grad.clone();
        grad = self.conv2.backward(&a1, &grad)?;
        grad = self.act.backward(&n1, &grad)?;
        grad = self.norm.backward(&c1, &grad)?;
        grad = self.conv1.backward(&x, &grad)?;
        grad = grad.add(&grad_residual)?;
        match &mut self.upsampler {
            Some(up) => up.backward(input, &grad),
            None => Ok(grad),
        }
    }

    fn backward_expand(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        let c1 = self.conv1.forward(input)?;
        let n1 = self.norm.replay_forward(&c1)?;
        let a1 = self.act.forward(&n1)?;
        let grad = match &mut self.pool {
            Some(pool) => {
                let c2 = self.conv2.forward(&a1)?;
                let shortcut_out = self
                    .shortcut
                    .as_ref()
                    .ok_or(TensorError::InvalidValue {
                        label: "residual_shortcut_missing",
                    })?
                    .forward(input)?;
                let summed = c2.add(&shortcut_out)?;
                pool.backward(&summed, grad_output)?
            }
            None => grad_output.clone(),
        };
        let grad_shortcut = self
            .shortcut
            .as_mut()
            .ok_or(TensorError::InvalidValue {
                label: "residual_shortcut_missing",
            })?
            .backward(input, &grad)?;
        let mut grad_main = self.conv2.backward(&a1, &grad)?;
        grad_main = self.act.backward(&n1, &grad_main)?;
        grad_main = self.norm.backward(&c1, &grad_main)?;
        grad_main = self.conv1.backward(input, &grad_main)?;
        grad_main.add(&grad_shortcut)
    }

    fn backward_reduce(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        let x = match &self.upsampler {
            Some(up) => up.forward(input)?,
            None => input.clone(),
        };
        let c1 = self.conv1.forward(&x)?;
        let n1 = self.norm.replay_forward(&c1)?;
        let a1 = self.act.forward(&n1)?;
        let c2 = self.conv2.forward(&a1)?;
        let shortcut_out = self
            .shortcut
            .as_ref()
            .ok_or(TensorError::InvalidValue {
                label: "residual_shortcut_missing",
            })?
            .forward(&x)?;
        let summed = c2.add(&shortcut_out)?;
        let n2 = self.norm.replay_forward(&summed)?;
        let mut grad = self.act.backward(&n2, grad_output)?;
        grad = self.norm.backward(&summed, &grad)?;
        let grad_shortcut = self
            .shortcut
            .as_mut()
            .ok_or(TensorError::InvalidValue {
                label: "residual_shortcut_missing",
            })?
            .backward(&x, &grad)?;
        let mut grad_main = self.conv2.backward(&a1, &grad)?;
        grad_main = self.act.backward(&n1, &grad_main)?;
        grad_main = self.norm.backward(&c1, &grad_main)?;
        grad_main = self.conv1.backward(&x, &grad_main)?;
        let grad = grad_main.add(&grad_shortcut)?;
        match &mut self.upsampler {
            Some(up) => up.backward(input, &grad),
            None => Ok(grad),
        }
    }
}

impl Module for ResidualBlock {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        self.guard_input(input)?;
        match self.kind {
            ResidualKind::Same => self.forward_same(input, false),
            ResidualKind::Expand => self.forward_expand(input, false),
            ResidualKind::Reduce => self.forward_reduce(input, false),
        }
    }

    fn replay_forward(&self, input: &Tensor) -> PureResult<Tensor> {
        self.guard_input(input)?;
        match self.kind {
            ResidualKind::Same => self.forward_same(input, true),
            ResidualKind::Expand => self.forward_expand(input, true),
            ResidualKind::Reduce => self.forward_reduce(input, true),
        }
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        self.guard_input(input)?;
        match self.kind {
            ResidualKind::Same => self.backward_same(input, grad_output),
            ResidualKind::Expand => self.backward_expand(input, grad_output),
            ResidualKind::Reduce => self.backward_reduce(input, grad_output),
        }
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.conv1.visit_parameters(visitor)?;
        self.norm.visit_parameters(visitor)?;
        self.conv2.visit_parameters(visitor)?;
        if let Some(shortcut) = &self.shortcut {
            shortcut.visit_parameters(visitor)?;
        }
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.conv1.visit_parameters_mut(visitor)?;
        self.norm.visit_parameters_mut(visitor)?;
        self.conv2.visit_parameters_mut(visitor)?;
        if let Some(shortcut) = &mut self.shortcut {
            shortcut.visit_parameters_mut(visitor)?;
        }
        Ok(())
    }

    fn set_training(&self, training: bool) {
        self.norm.set_training(training);
    }
}

/// Encoder that maps images to the joint `[batch, 2 * latent]` statistics of
/// a latent Gaussian. [`IntroEncoder::encode`] splits the joint output into
/// its mean and log-variance halves.
#[derive(Debug)]
pub struct IntroEncoder {
    net: Sequential,
    fc: Linear,
    image_dim: usize,
    image_channels: usize,
    latent_dim: usize,
    devices: usize,
}

impl IntroEncoder {
    /// Builds the encoder topology selected by `config.image_dim`.
    pub fn new(config: &IntroConfig) -> PureResult<Self> {
        config.validate()?;
        let stem_channels = config.stem_channels();
        let dim = config.image_dim;
        let mut net = Sequential::new();
        net.push(
            Conv2d::new(
                "intro_enc::stem",
                config.image_channels,
                stem_channels,
                (5, 5),
                (1, 1),
                (2, 2),
                (dim, dim),
            )?
            .without_bias(),
        );
        net.push(BatchNorm2d::new("intro_enc::stem_norm", stem_channels, 0.1, 1e-5)?);
        net.push(LeakyRelu::new(0.2)?);
        net.push(AvgPool2d::new(stem_channels, (2, 2), (2, 2), (dim, dim))?);

        let mut hw = (dim / 2, dim / 2);
        let mut channels = stem_channels;
        let stages: &[(usize, bool)] = match dim {
            256 => &[
                (64, true),
                (128, true),
                (256, true),
                (512, true),
                (512, true),
                (512, false),
            ],
            _ => &[(32, true), (64, true), (128, true), (256, true), (256, false)],
        };
        for (index, &(out_channels, avg)) in stages.iter().enumerate() {
            let block = ResidualBlock::new(
                format!("intro_enc::res{index}"),
                channels,
                out_channels,
                hw,
                avg,
                false,
                config.devices,
            )?;
            hw = block.output_hw();
            channels = out_channels;
            net.push(block);
        }
        debug_assert_eq!(hw, (4, 4));
        debug_assert_eq!(channels, config.latent_dim);
        let fc = Linear::new(
            "intro_enc::fc",
            config.latent_dim * 16,
            2 * config.latent_dim,
        )?;
        Ok(Self {
            net,
            fc,
            image_dim: config.image_dim,
            image_channels: config.image_channels,
            latent_dim: config.latent_dim,
            devices: config.devices,
        })
    }

    /// Latent width of each Gaussian half.
    pub fn latent_dim(&self) -> usize {
        self.latent_dim
    }

    /// Runs the encoder and splits the joint output into `(mean, logvar)`.
    pub fn encode(&self, input: &Tensor) -> PureResult<(Tensor, Tensor)> {
        let joint = self.forward(input)?;
        split_columns(&joint, self.latent_dim)
    }

    fn guard_input(&self, input: &Tensor) -> PureResult<()> {
        let expected = self.image_channels * self.image_dim * self.image_dim;
        if input.shape().1 != expected {
            return Err(TensorError::ShapeMismatch {
                left: input.shape(),
                right: (input.shape().0, expected),
            });
        }
        Ok(())
    }
}

impl Module for IntroEncoder {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        self.guard_input(input)?;
        let features = parallel_apply(input, self.devices, |shard| self.net.forward(shard))?;
        parallel_apply(&features, self.devices, |shard| self.fc.forward(shard))
    }

    fn replay_forward(&self, input: &Tensor) -> PureResult<Tensor> {
        self.guard_input(input)?;
        let features = self.net.replay_forward(input)?;
        self.fc.forward(&features)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        self.guard_input(input)?;
        let features = self.net.replay_forward(input)?;
        let grad_features = self.fc.backward(&features, grad_output)?;
        self.net.backward(input, &grad_features)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.net.visit_parameters(visitor)?;
        self.fc.visit_parameters(visitor)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.net.visit_parameters_mut(visitor)?;
        self.fc.visit_parameters_mut(visitor)
    }

    fn set_training(&self, training: bool) {
        self.net.set_training(training);
    }
}

/// Generator that maps latent vectors back to image-shaped maps.
///
/// No squashing nonlinearity follows the final convolution; the output range
/// is left to the training loss.
#[derive(Debug)]
pub struct IntroGenerator {
    fc: Linear,
    relu: Relu,
    net: Sequential,
    image_dim: usize,
    image_channels: usize,
    latent_dim: usize,
    devices: usize,
}

impl IntroGenerator {
    /// Builds the generator topology selected by `config.latent_dim`.
    pub fn new(config: &IntroConfig) -> PureResult<Self> {
        config.validate()?;
        let z = config.latent_dim;
        let fc = Linear::new("intro_gen::fc", z, z * 16)?;
        let mut net = Sequential::new();
        let stages: &[(usize, bool)] = match z {
            512 => &[
                (512, false),
                (512, true),
                (256, true),
                (128, true),
                (64, true),
                (32, true),
                (32, true),
            ],
            _ => &[
                (256, false),
                (128, true),
                (64, true),
                (32, true),
                (16, true),
                (16, true),
            ],
        };
        let mut channels = z;
        let mut hw = (4, 4);
        for (index, &(out_channels, upsample)) in stages.iter().enumerate() {
            let block = ResidualBlock::new(
                format!("intro_gen::res{index}"),
                channels,
                out_channels,
                hw,
                false,
                upsample,
                config.devices,
            )?;
            hw = block.output_hw();
            channels = out_channels;
            net.push(block);
        }
        debug_assert_eq!(hw, (config.image_dim, config.image_dim));
        net.push(Conv2d::new(
            "intro_gen::proj",
            channels,
            config.image_channels,
            (5, 5),
            (1, 1),
            (2, 2),
            hw,
        )?);
        Ok(Self {
            fc,
            relu: Relu,
            net,
            image_dim: config.image_dim,
            image_channels: config.image_channels,
            latent_dim: z,
            devices: config.devices,
        })
    }

    /// Edge length of the generated square images.
    pub fn image_dim(&self) -> usize {
        self.image_dim
    }

    /// Channel count of the generated images.
    pub fn image_channels(&self) -> usize {
        self.image_channels
    }

    fn guard_input(&self, input: &Tensor) -> PureResult<()> {
        if input.shape().1 != self.latent_dim {
            return Err(TensorError::ShapeMismatch {
                left: input.shape(),
                right: (input.shape().0, self.latent_dim),
            });
        }
        Ok(())
    }
}

impl Module for IntroGenerator {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        self.guard_input(input)?;
        // The fc output is read as a [latent, 4, 4] map; in the flat layout
        // the reshape is a no-op.
        let seed = self.relu.forward(&self.fc.forward(input)?)?;
        parallel_apply(&seed, self.devices, |shard| self.net.forward(shard))
    }

    fn replay_forward(&self, input: &Tensor) -> PureResult<Tensor> {
        self.guard_input(input)?;
        let seed = self.relu.forward(&self.fc.forward(input)?)?;
        self.net.replay_forward(&seed)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        self.guard_input(input)?;
        let pre_act = self.fc.forward(input)?;
        let seed = self.relu.forward(&pre_act)?;
        let grad_seed = self.net.backward(&seed, grad_output)?;
        let grad_pre = self.relu.backward(&pre_act, &grad_seed)?;
        self.fc.backward(input, &grad_pre)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.fc.visit_parameters(visitor)?;
        self.net.visit_parameters(visitor)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.fc.visit_parameters_mut(visitor)?;
        self.net.visit_parameters_mut(visitor)
    }

    fn set_training(&self, training: bool) {
        self.net.set_training(training);
    }
}

/// Splits a `[batch, 2 * width]` tensor into two `[batch, width]` halves.
fn split_columns(joint: &Tensor, width: usize) -> PureResult<(Tensor, Tensor)> {
    let (rows, cols) = joint.shape();
    if cols != 2 * width {
        return Err(TensorError::ShapeMismatch {
            left: (rows, cols),
            right: (rows, 2 * width),
        });
    }
    let mut mean = Vec::with_capacity(rows * width);
    let mut logvar = Vec::with_capacity(rows * width);
    for r in 0..rows {
        let row = &joint.data()[r * cols..(r + 1) * cols];
        mean.extend_from_slice(&row[..width]);
        logvar.extend_from_slice(&row[width..]);
    }
    Ok((
        Tensor::from_vec(rows, width, mean)?,
        Tensor::from_vec(rows, width, logvar)?,
    ))
}

/// Draws `z = mean + exp(0.5 * logvar) * noise` with standard-normal noise.
pub fn reparameterize(mean: &Tensor, logvar: &Tensor, seed: Option<u64>) -> PureResult<Tensor> {
    if mean.shape() != logvar.shape() {
        return Err(TensorError::ShapeMismatch {
            left: mean.shape(),
            right: logvar.shape(),
        });
    }
    let (rows, cols) = mean.shape();
    let noise = Tensor::random_normal(rows, cols, 0.0, 1.0, seed)?;
    let mut data = Vec::with_capacity(rows * cols);
    for idx in 0..rows * cols {
        let std = (0.5 * logvar.data()[idx]).exp();
        data.push(mean.data()[idx] + std * noise.data()[idx]);
    }
    Tensor::from_vec(rows, cols, data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variant_selection_depends_only_on_channels() {
        assert_eq!(ResidualKind::from_channels(64, 64), ResidualKind::Same);
        assert_eq!(ResidualKind::from_channels(32, 64), ResidualKind::Expand);
        assert_eq!(ResidualKind::from_channels(64, 32), ResidualKind::Reduce);
    }

    #[test]
    fn same_block_preserves_geometry_and_adds_residual() {
        let block = ResidualBlock::new("res", 4, 4, (8, 8), false, false, 0).unwrap();
        assert_eq!(block.kind(), ResidualKind::Same);
        assert_eq!(block.output_hw(), (8, 8));
        let input = Tensor::random_uniform(2, 4 * 8 * 8, -1.0, 1.0, Some(19)).unwrap();
        let output = block.forward(&input).unwrap();
        assert_eq!(output.shape(), input.shape());
    }

    #[test]
    fn expand_block_halves_extent_with_avg_pool() {
        let block = ResidualBlock::new("res", 4, 8, (8, 8), true, false, 0).unwrap();
        assert_eq!(block.kind(), ResidualKind::Expand);
        assert_eq!(block.output_hw(), (4, 4));
        let input = Tensor::random_uniform(2, 4 * 8 * 8, -1.0, 1.0, Some(29)).unwrap();
        let output = block.forward(&input).unwrap();
        assert_eq!(output.shape(), (2, 8 * 4 * 4));
    }

    #[test]
    fn reduce_block_doubles_extent_with_upsample() {
        let block = ResidualBlock::new("res", 8, 4, (4, 4), false, true, 0).unwrap();
        assert_eq!(block.kind(), ResidualKind::Reduce);
        assert_eq!(block.output_hw(), (8, 8));
        let input = Tensor::random_uniform(2, 8 * 4 * 4, -1.0, 1.0, Some(37)).unwrap();
        let output = block.forward(&input).unwrap();
        assert_eq!(output.shape(), (2, 4 * 8 * 8));
    }

    #[test]
    fn same_block_dispatch_matches_plain_path() {
        let plain = ResidualBlock::new("res", 4, 4, (4, 4), false, false, 0).unwrap();
        let dispatched = ResidualBlock::new("res", 4, 4, (4, 4), false, false, 1).unwrap();
        let input = Tensor::random_uniform(3, 4 * 4 * 4, -1.0, 1.0, Some(43)).unwrap();
        let a = plain.forward(&input).unwrap();
        let b = dispatched.forward(&input).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn residual_block_backward_returns_input_shaped_grad() {
        for (in_ch, out_ch, avg, upsample) in
            [(4usize, 4usize, false, false), (4, 8, true, false), (8, 4, false, true)]
        {
            let mut block =
                ResidualBlock::new("res", in_ch, out_ch, (4, 4), avg, upsample, 0).unwrap();
            let input = Tensor::random_uniform(2, in_ch * 16, -1.0, 1.0, Some(3)).unwrap();
            let output = block.forward(&input).unwrap();
            let grad_output =
                Tensor::from_vec(2, output.shape().1, vec![1.0; 2 * output.shape().1]).unwrap();
            let grad_input = block.backward(&input, &grad_output).unwrap();
            assert_eq!(grad_input.shape(), input.shape());
            for value in grad_input.data() {
                assert!(value.is_finite());
            }
        }
    }

    #[test]
    fn unsupported_configurations_are_rejected() {
        let bad_dim = IntroConfig {
            image_dim: 64,
            latent_dim: 128,
            ..IntroConfig::default()
        };
        assert!(matches!(
            IntroEncoder::new(&bad_dim),
            Err(TensorError::UnsupportedConfiguration {
                label: "introvae_image_dim",
                ..
            })
        ));
        let bad_latent = IntroConfig {
            image_dim: 256,
            latent_dim: 256,
            ..IntroConfig::default()
        };
        assert!(matches!(
            IntroGenerator::new(&bad_latent),
            Err(TensorError::UnsupportedConfiguration {
                label: "introvae_latent_dim",
                ..
            })
        ));
    }

    #[test]
    fn reparameterize_collapses_to_mean_for_tiny_variance() {
        let mean = Tensor::from_vec(2, 3, vec![0.5, -1.0, 2.0, 0.0, 1.0, -0.5]).unwrap();
        let logvar = Tensor::from_vec(2, 3, vec![-40.0; 6]).unwrap();
        let z = reparameterize(&mean, &logvar, Some(11)).unwrap();
        for (sample, expected) in z.data().iter().zip(mean.data()) {
            assert!((sample - expected).abs() < 1e-4);
        }
    }

    #[test]
    fn split_columns_separates_halves() {
        let joint = Tensor::from_vec(2, 4, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]).unwrap();
        let (mean, logvar) = split_columns(&joint, 2).unwrap();
        assert_eq!(mean.data(), &[1.0, 2.0, 5.0, 6.0]);
        assert_eq!(logvar.data(), &[3.0, 4.0, 7.0, 8.0]);
    }
}
