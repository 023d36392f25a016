// SPDX-License-Identifier: AGPL-3.0-or-later
// Part of LatentTorch — Licensed under AGPL-3.0-or-later.

use lt_nn::module::{Module, Parameter};
use lt_nn::parallel::{check_devices, parallel_apply};
use lt_nn::stack::{LayerSpec, StackBuilder};
use lt_nn::{PureResult, Sequential};
use lt_tensor::{Tensor, TensorError};

/// Configuration for the adversarial generative encoder pair.
///
/// `image_dim` selects one of the two hard-coded topologies (32 or 128).
/// `devices` counts forward-pass workers; zero selects the undispatched
/// plain path.
#[derive(Clone, Debug)]
pub struct AgeConfig {
    pub image_dim: usize,
    pub image_channels: usize,
    pub latent_dim: usize,
    pub base_filters: usize,
    pub sphere_projection: bool,
    pub devices: usize,
}

impl Default for AgeConfig {
    fn default() -> Self {
        Self {
            image_dim: 32,
            image_channels: 3,
            latent_dim: 128,
            base_filters: 64,
            sphere_projection: true,
            devices: 1,
        }
    }
}

impl AgeConfig {
    fn validate(&self) -> PureResult<()> {
        if self.image_channels == 0 {
            return Err(TensorError::InvalidValue {
                label: "age_image_channels",
            });
        }
        if self.latent_dim == 0 {
            return Err(TensorError::InvalidValue {
                label: "age_latent_dim",
            });
        }
        if self.base_filters == 0 {
            return Err(TensorError::InvalidValue {
                label: "age_base_filters",
            });
        }
        if self.image_dim != 32 && self.image_dim != 128 {
            return Err(TensorError::UnsupportedConfiguration {
                label: "age_image_dim",
                value: self.image_dim,
            });
        }
        check_devices(self.devices, lt_nn::available_devices())
    }
}

fn encoder_specs(config: &AgeConfig) -> Vec<LayerSpec> {
    let f = config.base_filters;
    let z = config.latent_dim;
    let leaky = LayerSpec::LeakyRelu {
        negative_slope: 0.2,
    };
    let down = |out_channels: usize, bias: bool| LayerSpec::Conv {
        out_channels,
        kernel: 4,
        stride: 2,
        padding: 1,
        bias,
    };
    match config.image_dim {
        32 => vec![
            down(f, false),
            leaky,
            down(2 * f, false),
            LayerSpec::BatchNorm,
            leaky,
            down(4 * f, false),
            LayerSpec::BatchNorm,
            leaky,
            down(z, true),
            LayerSpec::AvgPool {
                kernel: 2,
                stride: 2,
            },
        ],
        _ => vec![
            down(f, false),
            leaky,
            down(2 * f, false),
            LayerSpec::BatchNorm,
            leaky,
            down(4 * f, false),
            LayerSpec::BatchNorm,
            leaky,
            down(8 * f, false),
            LayerSpec::BatchNorm,
            leaky,
            down(16 * f, false),
            LayerSpec::BatchNorm,
            leaky,
            LayerSpec::Conv {
                out_channels: z,
                kernel: 4,
                stride: 1,
                padding: 0,
                bias: true,
            },
        ],
    }
}

fn generator_specs(config: &AgeConfig) -> Vec<LayerSpec> {
    let f = config.base_filters;
    let c = config.image_channels;
    let up = |out_channels: usize| LayerSpec::ConvTranspose {
        out_channels,
        kernel: 4,
        stride: 2,
        padding: 1,
        bias: false,
    };
    match config.image_dim {
        32 => vec![
            LayerSpec::ConvTranspose {
                out_channels: 8 * f,
                kernel: 4,
                stride: 1,
                padding: 0,
                bias: false,
            },
            LayerSpec::BatchNorm,
            LayerSpec::Relu,
            up(4 * f),
            LayerSpec::BatchNorm,
            LayerSpec::Relu,
            up(2 * f),
            LayerSpec::BatchNorm,
            LayerSpec::Relu,
            up(2 * f),
            LayerSpec::BatchNorm,
            LayerSpec::Relu,
            LayerSpec::Conv {
                out_channels: c,
                kernel: 1,
                stride: 1,
                padding: 0,
                bias: true,
            },
            LayerSpec::Tanh,
        ],
        _ => vec![
            LayerSpec::ConvTranspose {
                out_channels: 16 * f,
                kernel: 4,
                stride: 1,
                padding: 0,
                bias: false,
            },
            LayerSpec::BatchNorm,
            LayerSpec::Relu,
            up(8 * f),
            LayerSpec::BatchNorm,
            LayerSpec::Relu,
            up(4 * f),
            LayerSpec::BatchNorm,
            LayerSpec::Relu,
            up(2 * f),
            LayerSpec::BatchNorm,
            LayerSpec::Relu,
            up(f),
            LayerSpec::BatchNorm,
            LayerSpec::Relu,
            up(c),
            LayerSpec::Tanh,
        ],
    }
}

/// Convolutional encoder that maps images to latent codes, optionally
/// projected onto the unit sphere.
#[derive(Debug)]
pub struct AgeEncoder {
    net: Sequential,
    image_dim: usize,
    image_channels: usize,
    latent_dim: usize,
    sphere_projection: bool,
    devices: usize,
}

impl AgeEncoder {
    /// Builds the encoder topology selected by `config.image_dim`.
    pub fn new(config: &AgeConfig) -> PureResult<Self> {
        config.validate()?;
        let stack = StackBuilder::new(
            "age_enc",
            config.image_channels,
            (config.image_dim, config.image_dim),
        )
        .extend(encoder_specs(config))
        .build()?;
        debug_assert_eq!(stack.out_hw(), (1, 1));
        Ok(Self {
            net: stack.into_net(),
            image_dim: config.image_dim,
            image_channels: config.image_channels,
            latent_dim: config.latent_dim,
            sphere_projection: config.sphere_projection,
            devices: config.devices,
        })
    }

    /// Latent width produced per sample.
    pub fn latent_dim(&self) -> usize {
        self.latent_dim
    }

    /// Whether latent codes are renormalised onto the unit sphere.
    pub fn sphere_projection(&self) -> bool {
        self.sphere_projection
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

    // Gradient of x / |x| applied row-wise: (g - (g . u) u) / |x|.
    fn sphere_grad(raw: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        let (rows, cols) = raw.shape();
        let mut grad = vec![0.0f32; rows * cols];
        for r in 0..rows {
            let x = &raw.data()[r * cols..(r + 1) * cols];
            let g = &grad_output.data()[r * cols..(r + 1) * cols];
            let norm = x.iter().map(|v| v * v).sum::<f32>().sqrt();
            if norm <= f32::EPSILON {
                return Err(TensorError::NonFiniteValue {
                    label: "sphere_projection_norm",
                    value: norm,
                });
            }
            let dot: f32 = x
                .iter()
                .zip(g.iter())
                .map(|(xv, gv)| xv * gv / norm)
                .sum();
            for c in 0..cols {
                grad[r * cols + c] = (g[c] - dot * x[c] / norm) / norm;
            }
        }
        Tensor::from_vec(rows, cols, grad)
    }
}

impl Module for AgeEncoder {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        self.guard_input(input)?;
        let latent = parallel_apply(input, self.devices, |shard| self.net.forward(shard))?;
        if self.sphere_projection {
            latent.l2_normalize_rows()
        } else {
            Ok(latent)
        }
    }

    fn replay_forward(&self, input: &Tensor) -> PureResult<Tensor> {
        self.guard_input(input)?;
        let latent = self.net.replay_forward(input)?;
        if self.sphere_projection {
            latent.l2_normalize_rows()
        } else {
            Ok(latent)
        }
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        self.guard_input(input)?;
        if self.sphere_projection {
            let raw = self.net.replay_forward(input)?;
            let grad = Self::sphere_grad(&raw, grad_output)?;
            self.net.backward(input, &grad)
        } else {
            self.net.backward(input, grad_output)
        }
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.net.visit_parameters(visitor)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.net.visit_parameters_mut(visitor)
    }

    fn set_training(&self, training: bool) {
        self.net.set_training(training);
    }
}

/// Transposed-convolutional generator that maps latent codes back to images
/// in `[-1, 1]`.
#[derive(Debug)]
pub struct AgeGenerator {
    net: Sequential,
    image_dim: usize,
    image_channels: usize,
    latent_dim: usize,
    devices: usize,
}

impl AgeGenerator {
    /// Builds the generator topology selected by `config.image_dim`.
    pub fn new(config: &AgeConfig) -> PureResult<Self> {
        config.validate()?;
        let stack = StackBuilder::new("age_gen", config.latent_dim, (1, 1))
            .extend(generator_specs(config))
            .build()?;
        debug_assert_eq!(stack.out_hw(), (config.image_dim, config.image_dim));
        Ok(Self {
            net: stack.into_net(),
            image_dim: config.image_dim,
            image_channels: config.image_channels,
            latent_dim: config.latent_dim,
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

impl Module for AgeGenerator {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        self.guard_input(input)?;
        parallel_apply(input, self.devices, |shard| self.net.forward(shard))
    }

    fn replay_forward(&self, input: &Tensor) -> PureResult<Tensor> {
        self.guard_input(input)?;
        self.net.replay_forward(input)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        self.guard_input(input)?;
        self.net.backward(input, grad_output)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.net.visit_parameters(visitor)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.net.visit_parameters_mut(visitor)
    }

    fn set_training(&self, training: bool) {
        self.net.set_training(training);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_image_dim_is_rejected() {
        let config = AgeConfig {
            image_dim: 64,
            ..AgeConfig::default()
        };
        assert!(matches!(
            AgeEncoder::new(&config),
            Err(TensorError::UnsupportedConfiguration {
                label: "age_image_dim",
                value: 64,
            })
        ));
        assert!(AgeGenerator::new(&config).is_err());
    }

    #[test]
    fn encoder_flattens_to_latent_width() {
        let config = AgeConfig {
            base_filters: 8,
            latent_dim: 16,
            devices: 0,
            ..AgeConfig::default()
        };
        let encoder = AgeEncoder::new(&config).unwrap();
        let images = Tensor::random_uniform(4, 3 * 32 * 32, -1.0, 1.0, Some(9)).unwrap();
        let latent = encoder.forward(&images).unwrap();
        assert_eq!(latent.shape(), (4, 16));
    }

    #[test]
    fn sphere_projection_normalises_every_row() {
        let config = AgeConfig {
            base_filters: 8,
            latent_dim: 16,
            devices: 0,
            ..AgeConfig::default()
        };
        let encoder = AgeEncoder::new(&config).unwrap();
        let images = Tensor::random_uniform(3, 3 * 32 * 32, -1.0, 1.0, Some(31)).unwrap();
        let latent = encoder.forward(&images).unwrap();
        for row in 0..3 {
            let slice = &latent.data()[row * 16..(row + 1) * 16];
            let norm = slice.iter().map(|v| v * v).sum::<f32>().sqrt();
            assert!((norm - 1.0).abs() < 1e-4, "row {row} norm {norm}");
        }
    }

    #[test]
    fn sphere_grad_is_orthogonal_to_the_projection() {
        let raw = Tensor::from_vec(1, 3, vec![3.0, 0.0, 4.0]).unwrap();
        let grad_output = Tensor::from_vec(1, 3, vec![0.5, -1.0, 0.25]).unwrap();
        let grad = AgeEncoder::sphere_grad(&raw, &grad_output).unwrap();
        // The projected gradient has no component along the code direction.
        let dot: f32 = grad
            .data()
            .iter()
            .zip(raw.data())
            .map(|(g, x)| g * x)
            .sum();
        assert!(dot.abs() < 1e-6);
    }

    #[test]
    fn generator_output_is_bounded_by_tanh() {
        let config = AgeConfig {
            base_filters: 8,
            latent_dim: 16,
            devices: 0,
            ..AgeConfig::default()
        };
        let generator = AgeGenerator::new(&config).unwrap();
        let latent = Tensor::random_normal(2, 16, 0.0, 1.0, Some(7)).unwrap();
        let images = generator.forward(&latent).unwrap();
        assert_eq!(images.shape(), (2, 3 * 32 * 32));
        for value in images.data() {
            assert!((-1.0..=1.0).contains(value));
        }
    }

    #[test]
    fn round_trip_preserves_image_geometry() {
        let config = AgeConfig {
            base_filters: 8,
            latent_dim: 16,
            devices: 0,
            ..AgeConfig::default()
        };
        let encoder = AgeEncoder::new(&config).unwrap();
        let generator = AgeGenerator::new(&config).unwrap();
        let images = Tensor::random_uniform(2, 3 * 32 * 32, -1.0, 1.0, Some(3)).unwrap();
        let latent = encoder.forward(&images).unwrap();
        let restored = generator.forward(&latent).unwrap();
        assert_eq!(restored.shape(), images.shape());
    }
}
