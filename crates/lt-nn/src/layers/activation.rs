// SPDX-License-Identifier: AGPL-3.0-or-later
// Part of LatentTorch — Licensed under AGPL-3.0-or-later.

use crate::module::{Module, Parameter};
use crate::{PureResult, Tensor, TensorError};

fn map_elementwise<F>(input: &Tensor, f: F) -> PureResult<Tensor>
where
    F: Fn(f32) -> f32,
{
    let (rows, cols) = input.shape();
    let data = input.data().iter().map(|&v| f(v)).collect();
    Tensor::from_vec(rows, cols, data)
}

fn guard_pair(input: &Tensor, grad_output: &Tensor) -> PureResult<()> {
    if input.shape() != grad_output.shape() {
        return Err(TensorError::ShapeMismatch {
            left: input.shape(),
            right: grad_output.shape(),
        });
    }
    Ok(())
}

/// Stateless rectifier. Does not participate in parameter visits.
#[derive(Debug, Default, Clone, Copy)]
pub struct Relu;

impl Relu {
    /// Creates a new ReLU layer.
    pub fn new() -> Self {
        Self
    }
}

impl Module for Relu {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        map_elementwise(input, |v| v.max(0.0))
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        guard_pair(input, grad_output)?;
        let (rows, cols) = input.shape();
        let data = input
            .data()
            .iter()
            .zip(grad_output.data().iter())
            .map(|(&x, &g)| if x > 0.0 { g } else { 0.0 })
            .collect();
        Tensor::from_vec(rows, cols, data)
    }

    fn visit_parameters(
        &self,
        _visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        _visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        Ok(())
    }
}

/// Leaky rectifier with a configurable negative slope.
#[derive(Debug, Clone, Copy)]
pub struct LeakyRelu {
    negative_slope: f32,
}

impl LeakyRelu {
    /// Creates a leaky rectifier. The slope must be finite and non-negative.
    pub fn new(negative_slope: f32) -> PureResult<Self> {
        if !negative_slope.is_finite() || negative_slope < 0.0 {
            return Err(TensorError::NonFiniteValue {
                label: "leaky_relu_negative_slope",
                value: negative_slope,
            });
        }
        Ok(Self { negative_slope })
    }

    /// Returns the configured negative slope.
    pub fn negative_slope(&self) -> f32 {
        self.negative_slope
    }
}

impl Module for LeakyRelu {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        let slope = self.negative_slope;
        map_elementwise(input, |v| if v > 0.0 { v } else { v * slope })
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        guard_pair(input, grad_output)?;
        let slope = self.negative_slope;
        let (rows, cols) = input.shape();
        let data = input
            .data()
            .iter()
            .zip(grad_output.data().iter())
            .map(|(&x, &g)| if x > 0.0 { g } else { g * slope })
            .collect();
        Tensor::from_vec(rows, cols, data)
    }

    fn visit_parameters(
        &self,
        _visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        _visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        Ok(())
    }
}

/// Hyperbolic-tangent squashing into `[-1, 1]`.
#[derive(Debug, Default, Clone, Copy)]
pub struct Tanh;

impl Tanh {
    /// Creates a new tanh layer.
    pub fn new() -> Self {
        Self
    }
}

impl Module for Tanh {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        map_elementwise(input, f32::tanh)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        guard_pair(input, grad_output)?;
        let (rows, cols) = input.shape();
        let data = input
            .data()
            .iter()
            .zip(grad_output.data().iter())
            .map(|(&x, &g)| {
                let t = x.tanh();
                g * (1.0 - t * t)
            })
            .collect();
        Tensor::from_vec(rows, cols, data)
    }

    fn visit_parameters(
        &self,
        _visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        _visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relu_forward_backward() {
        let relu = Relu::new();
        let input = Tensor::from_vec(1, 4, vec![-1.0, -0.5, 0.2, 1.5]).unwrap();
        let output = relu.forward(&input).unwrap();
        assert_eq!(output.data(), &[0.0, 0.0, 0.2, 1.5]);

        let mut relu = relu;
        let grad_output = Tensor::from_vec(1, 4, vec![0.3, 0.4, 0.5, 0.6]).unwrap();
        let grad_input = relu.backward(&input, &grad_output).unwrap();
        assert_eq!(grad_input.data(), &[0.0, 0.0, 0.5, 0.6]);
    }

    #[test]
    fn leaky_relu_keeps_scaled_negatives() {
        let layer = LeakyRelu::new(0.2).unwrap();
        let input = Tensor::from_vec(1, 3, vec![-1.0, 0.0, 2.0]).unwrap();
        let output = layer.forward(&input).unwrap();
        assert_eq!(output.data(), &[-0.2, 0.0, 2.0]);

        let mut layer = layer;
        let grad_output = Tensor::from_vec(1, 3, vec![1.0, 1.0, 1.0]).unwrap();
        let grad_input = layer.backward(&input, &grad_output).unwrap();
        assert_eq!(grad_input.data(), &[0.2, 0.2, 1.0]);
    }

    #[test]
    fn leaky_relu_rejects_negative_slope_below_zero() {
        assert!(LeakyRelu::new(-0.1).is_err());
    }

    #[test]
    fn tanh_output_stays_in_unit_interval() {
        let layer = Tanh::new();
        let input = Tensor::from_vec(1, 4, vec![-10.0, -0.5, 0.5, 10.0]).unwrap();
        let output = layer.forward(&input).unwrap();
        for value in output.data() {
            assert!(*value >= -1.0 && *value <= 1.0);
        }
    }
}
