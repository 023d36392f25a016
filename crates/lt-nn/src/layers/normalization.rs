// SPDX-License-Identifier: AGPL-3.0-or-later
// Part of LatentTorch — Licensed under AGPL-3.0-or-later.

use crate::module::{Module, Parameter};
use crate::{PureResult, Tensor, TensorError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Batch normalisation over `[batch, channels * spatial]` feature maps.
///
/// Statistics are accumulated per channel across the batch and spatial
/// positions. The spatial extent is derived from the input width at forward
/// time, so the same layer instance can normalise maps of different sizes as
/// long as the channel count matches. Running statistics live behind a
/// `Mutex` and the training flag behind an `AtomicBool` so the layer stays
/// `Sync` when a model fans out across worker threads.
#[derive(Debug)]
pub struct BatchNorm2d {
    channels: usize,
    epsilon: f32,
    momentum: f32,
    gamma: Parameter,
    beta: Parameter,
    running_mean: Mutex<Vec<f32>>,
    running_var: Mutex<Vec<f32>>,
    training: AtomicBool,
}

impl BatchNorm2d {
    /// Creates a new batch normalisation layer over `channels` feature maps.
    pub fn new(
        name: impl Into<String>,
        channels: usize,
        momentum: f32,
        epsilon: f32,
    ) -> PureResult<Self> {
        if channels == 0 {
            return Err(TensorError::InvalidDimensions {
                rows: 1,
                cols: channels,
            });
        }
        if !(0.0..=1.0).contains(&momentum) || !momentum.is_finite() {
            return Err(TensorError::InvalidValue {
                label: "batchnorm_momentum",
            });
        }
        if epsilon <= 0.0 || !epsilon.is_finite() {
            return Err(TensorError::NonFiniteValue {
                label: "batchnorm_epsilon",
                value: epsilon,
            });
        }
        let name = name.into();
        let gamma = Tensor::from_vec(1, channels, vec![1.0; channels])?;
        let beta = Tensor::zeros(1, channels)?;
        Ok(Self {
            channels,
            epsilon,
            momentum,
            gamma: Parameter::new(format!("{name}::gamma"), gamma),
            beta: Parameter::new(format!("{name}::beta"), beta),
            running_mean: Mutex::new(vec![0.0; channels]),
            running_var: Mutex::new(vec![1.0; channels]),
            training: AtomicBool::new(true),
        })
    }

    /// Number of normalised channels.
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Returns the momentum applied to the running statistics.
    pub fn momentum(&self) -> f32 {
        self.momentum
    }

    /// Returns the epsilon used to stabilise the variance estimate.
    pub fn epsilon(&self) -> f32 {
        self.epsilon
    }

    /// Switches the layer to training mode.
    pub fn train(&self) {
        self.set_training(true);
    }

    /// Switches the layer to evaluation mode.
    pub fn eval(&self) {
        self.set_training(false);
    }

    fn is_training(&self) -> bool {
        self.training.load(Ordering::Relaxed)
    }

    fn guard_input(&self, input: &Tensor) -> PureResult<usize> {
        let (rows, cols) = input.shape();
        if rows == 0 {
            return Err(TensorError::EmptyInput("batchnorm_input"));
        }
        if cols == 0 || cols % self.channels != 0 {
            return Err(TensorError::ShapeMismatch {
                left: (rows, cols),
                right: (rows, self.channels),
            });
        }
        Ok(cols / self.channels)
    }

    fn compute_stats(&self, input: &Tensor, spatial: usize) -> (Vec<f32>, Vec<f32>) {
        let (batch, cols) = input.shape();
        let count = (batch * spatial) as f32;
        let mut mean = vec![0.0f32; self.channels];
        for row in 0..batch {
            let slice = &input.data()[row * cols..(row + 1) * cols];
            for c in 0..self.channels {
                for s in 0..spatial {
                    mean[c] += slice[c * spatial + s];
                }
            }
        }
        for value in mean.iter_mut() {
            *value /= count;
        }
        let mut variance = vec![0.0f32; self.channels];
        for row in 0..batch {
            let slice = &input.data()[row * cols..(row + 1) * cols];
            for c in 0..self.channels {
                for s in 0..spatial {
                    let centered = slice[c * spatial + s] - mean[c];
                    variance[c] += centered * centered;
                }
            }
        }
        for value in variance.iter_mut() {
            *value /= count;
        }
        (mean, variance)
    }

    fn poison_error() -> TensorError {
        TensorError::InvalidValue {
            label: "batchnorm_running_stats_poisoned",
        }
    }

    // Shared by forward and replay_forward: the replay path normalises with
    // the same batch statistics but must not advance the running averages a
    // second time.
    fn normalize(&self, input: &Tensor, update_running: bool) -> PureResult<Tensor> {
        let spatial = self.guard_input(input)?;
        let (batch, cols) = input.shape();
        let gamma = self.gamma.value().data();
        let beta = self.beta.value().data();
        let (mean, variance) = if self.is_training() {
            let (mean, variance) = self.compute_stats(input, spatial);
            if update_running {
                {
                    let mut running = self
                        .running_mean
                        .lock()
                        .map_err(|_| Self::poison_error())?;
                    for c in 0..self.channels {
                        running[c] = self.momentum * mean[c] + (1.0 - self.momentum) * running[c];
                    }
                }
                let mut running = self
                    .running_var
                    .lock()
                    .map_err(|_| Self::poison_error())?;
                for c in 0..self.channels {
                    running[c] = self.momentum * variance[c] + (1.0 - self.momentum) * running[c];
                }
            }
            (mean, variance)
        } else {
            let mean = self
                .running_mean
                .lock()
                .map_err(|_| Self::poison_error())?
                .clone();
            let variance = self
                .running_var
                .lock()
                .map_err(|_| Self::poison_error())?
                .clone();
            (mean, variance)
        };
        let inv_std: Vec<f32> = variance
            .iter()
            .map(|v| 1.0 / (v + self.epsilon).sqrt())
            .collect();
        let mut output = Vec::with_capacity(batch * cols);
        for row in 0..batch {
            let slice = &input.data()[row * cols..(row + 1) * cols];
            for c in 0..self.channels {
                for s in 0..spatial {
                    let normed = (slice[c * spatial + s] - mean[c]) * inv_std[c];
                    output.push(normed * gamma[c] + beta[c]);
                }
            }
        }
        Tensor::from_vec(batch, cols, output)
    }
}

impl Module for BatchNorm2d {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        self.normalize(input, true)
    }

    fn replay_forward(&self, input: &Tensor) -> PureResult<Tensor> {
        self.normalize(input, false)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        let spatial = self.guard_input(input)?;
        if input.shape() != grad_output.shape() {
            return Err(TensorError::ShapeMismatch {
                left: input.shape(),
                right: grad_output.shape(),
            });
        }
        if !self.is_training() {
            return Err(TensorError::InvalidValue {
                label: "batchnorm_backward_eval",
            });
        }
        // Statistics are recomputed from the input argument instead of being
        // cached at forward time. A residual block reuses one norm layer at
        // two points of the same pass, so a single forward cache would hand
        // the wrong statistics to one of the two backward calls.
        let (mean, variance) = self.compute_stats(input, spatial);
        let (batch, cols) = input.shape();
        let count = (batch * spatial) as f32;
        let gamma = self.gamma.value().data();
        let mut grad_input = vec![0.0f32; batch * cols];
        let mut grad_gamma = vec![0.0f32; self.channels];
        let mut grad_beta = vec![0.0f32; self.channels];

        for c in 0..self.channels {
            let inv_std = 1.0 / (variance[c] + self.epsilon).sqrt();
            let mut sum_grad = 0.0f32;
            let mut sum_grad_norm = 0.0f32;
            for row in 0..batch {
                for s in 0..spatial {
                    let idx = row * cols + c * spatial + s;
                    let normed = (input.data()[idx] - mean[c]) * inv_std;
                    let go = grad_output.data()[idx];
                    grad_gamma[c] += go * normed;
                    grad_beta[c] += go;
                    let go_gamma = go * gamma[c];
                    sum_grad += go_gamma;
                    sum_grad_norm += go_gamma * normed;
                }
            }
            for row in 0..batch {
                for s in 0..spatial {
                    let idx = row * cols + c * spatial + s;
                    let normed = (input.data()[idx] - mean[c]) * inv_std;
                    let go_gamma = grad_output.data()[idx] * gamma[c];
                    let term = (count * go_gamma - sum_grad - normed * sum_grad_norm) / count;
                    grad_input[idx] = term * inv_std;
                }
            }
        }

        let grad_gamma = Tensor::from_vec(1, self.channels, grad_gamma)?;
        let grad_beta = Tensor::from_vec(1, self.channels, grad_beta)?;
        self.gamma.accumulate_euclidean(&grad_gamma)?;
        self.beta.accumulate_euclidean(&grad_beta)?;
        Tensor::from_vec(batch, cols, grad_input)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&self.gamma)?;
        visitor(&self.beta)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&mut self.gamma)?;
        visitor(&mut self.beta)
    }

    fn set_training(&self, training: bool) {
        self.training.store(training, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_norm_normalises_per_channel() {
        let layer = BatchNorm2d::new("bn", 2, 0.1, 1e-5).unwrap();
        // Two channels of 2x2 maps; batch of 2.
        let input = Tensor::from_vec(
            2,
            8,
            vec![
                0.5, 1.0, -0.5, 1.5, 10.0, 12.0, 8.0, 9.0, // sample 0
                -1.0, 0.2, 0.75, 0.0, 11.0, 7.0, 13.0, 10.0, // sample 1
            ],
        )
        .unwrap();
        let output = layer.forward(&input).unwrap();
        for c in 0..2 {
            let mut mean = 0.0f32;
            let mut var = 0.0f32;
            for row in 0..2 {
                for s in 0..4 {
                    let value = output.data()[row * 8 + c * 4 + s];
                    mean += value;
                    var += value * value;
                }
            }
            mean /= 8.0;
            var /= 8.0;
            assert!(mean.abs() < 1e-4);
            assert!((var - 1.0).abs() < 1e-2);
        }
    }

    #[test]
    fn batch_norm_eval_uses_running_statistics() {
        let layer = BatchNorm2d::new("bn", 1, 1.0, 1e-5).unwrap();
        let input = Tensor::from_vec(2, 2, vec![0.0, 2.0, 4.0, 6.0]).unwrap();
        let _ = layer.forward(&input).unwrap();
        layer.eval();
        // With momentum 1 the running stats equal the batch stats, so the
        // eval-mode output of the same batch matches the training output.
        let eval_output = layer.forward(&input).unwrap();
        layer.train();
        let train_output = layer.forward(&input).unwrap();
        for (a, b) in eval_output.data().iter().zip(train_output.data()) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn batch_norm_replay_leaves_running_statistics_untouched() {
        let replayed = BatchNorm2d::new("bn", 1, 0.5, 1e-5).unwrap();
        let reference = BatchNorm2d::new("bn", 1, 0.5, 1e-5).unwrap();
        let input = Tensor::from_vec(2, 2, vec![1.0, 3.0, 5.0, 7.0]).unwrap();
        let trained = replayed.forward(&input).unwrap();
        let replay = replayed.replay_forward(&input).unwrap();
        assert_eq!(trained, replay);
        let _ = reference.forward(&input).unwrap();
        // One extra replay must not advance the running averages, so both
        // layers agree in evaluation mode.
        replayed.eval();
        reference.eval();
        assert_eq!(
            replayed.forward(&input).unwrap(),
            reference.forward(&input).unwrap()
        );
    }

    #[test]
    fn batch_norm_accepts_any_spatial_extent() {
        let layer = BatchNorm2d::new("bn", 4, 0.1, 1e-5).unwrap();
        let small = Tensor::random_uniform(2, 4 * 4, -1.0, 1.0, Some(1)).unwrap();
        let large = Tensor::random_uniform(2, 4 * 16, -1.0, 1.0, Some(2)).unwrap();
        assert_eq!(layer.forward(&small).unwrap().shape(), (2, 16));
        assert_eq!(layer.forward(&large).unwrap().shape(), (2, 64));
    }

    #[test]
    fn batch_norm_rejects_non_channel_multiple() {
        let layer = BatchNorm2d::new("bn", 3, 0.1, 1e-5).unwrap();
        let input = Tensor::from_vec(1, 4, vec![0.0; 4]).unwrap();
        assert!(matches!(
            layer.forward(&input),
            Err(TensorError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn batch_norm_backward_matches_numeric_gradients() {
        let mut layer = BatchNorm2d::new("bn", 1, 0.1, 1e-4).unwrap();
        let input = Tensor::from_vec(2, 2, vec![0.3, -0.6, 1.2, 0.4]).unwrap();
        let grad_output = Tensor::from_vec(2, 2, vec![0.2, -0.1, 0.05, 0.3]).unwrap();
        let grad_input = layer.backward(&input, &grad_output).unwrap();

        let eps = 1e-3;
        let base = input.data().to_vec();
        for idx in 0..4 {
            let mut plus = base.clone();
            plus[idx] += eps;
            let mut minus = base.clone();
            minus[idx] -= eps;
            let reference = BatchNorm2d::new("bn", 1, 0.1, 1e-4).unwrap();
            let loss = |t: &Tensor| -> f32 {
                reference
                    .forward(t)
                    .unwrap()
                    .data()
                    .iter()
                    .zip(grad_output.data())
                    .map(|(o, g)| o * g)
                    .sum()
            };
            let numeric = (loss(&Tensor::from_vec(2, 2, plus).unwrap())
                - loss(&Tensor::from_vec(2, 2, minus).unwrap()))
                / (2.0 * eps);
            assert!((grad_input.data()[idx] - numeric).abs() < 1e-3);
        }
    }

    #[test]
    fn batch_norm_backward_populates_parameter_grads() {
        let mut layer = BatchNorm2d::new("bn", 2, 0.2, 1e-5).unwrap();
        let input = Tensor::from_vec(2, 4, vec![0.2, -0.3, 1.0, 0.5, -1.5, 2.0, 0.7, -0.1]).unwrap();
        let grad_output =
            Tensor::from_vec(2, 4, vec![0.1, -0.2, 0.05, 0.3, -0.4, 0.6, 0.2, -0.5]).unwrap();
        let grad_input = layer.backward(&input, &grad_output).unwrap();
        assert_eq!(grad_input.shape(), input.shape());
        let gamma_grad = layer.gamma.gradient().unwrap();
        let beta_grad = layer.beta.gradient().unwrap();
        assert_eq!(gamma_grad.shape(), (1, 2));
        assert_eq!(beta_grad.shape(), (1, 2));
        for value in grad_input.data() {
            assert!(value.is_finite());
        }
    }
}
