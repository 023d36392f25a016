// SPDX-License-Identifier: AGPL-3.0-or-later
// Part of LatentTorch — Licensed under AGPL-3.0-or-later.

use crate::module::{Module, Parameter};
use crate::{PureResult, Tensor, TensorError};

fn validate_positive(value: usize, _label: &str) -> PureResult<()> {
    if value == 0 {
        return Err(TensorError::InvalidDimensions {
            rows: 1,
            cols: value,
        });
    }
    Ok(())
}

/// Output extent of a strided convolution over `input_hw`.
pub fn conv_output_hw(
    input_hw: (usize, usize),
    kernel: (usize, usize),
    stride: (usize, usize),
    padding: (usize, usize),
) -> PureResult<(usize, usize)> {
    let (h, w) = input_hw;
    if h == 0 || w == 0 {
        return Err(TensorError::InvalidDimensions { rows: h, cols: w });
    }
    if h + 2 * padding.0 < kernel.0 || w + 2 * padding.1 < kernel.1 {
        return Err(TensorError::InvalidDimensions {
            rows: h + 2 * padding.0,
            cols: kernel.0.max(kernel.1),
        });
    }
    let oh = (h + 2 * padding.0 - kernel.0) / stride.0 + 1;
    let ow = (w + 2 * padding.1 - kernel.1) / stride.1 + 1;
    Ok((oh, ow))
}

/// Output extent of a pooling window over `input_hw`.
pub fn pool_output_hw(
    input_hw: (usize, usize),
    kernel: (usize, usize),
    stride: (usize, usize),
    padding: (usize, usize),
) -> PureResult<(usize, usize)> {
    conv_output_hw(input_hw, kernel, stride, padding)
}

/// Output extent of a fractionally-strided (transposed) convolution.
pub fn deconv_output_hw(
    input_hw: (usize, usize),
    kernel: (usize, usize),
    stride: (usize, usize),
    padding: (usize, usize),
) -> PureResult<(usize, usize)> {
    let (h, w) = input_hw;
    if h == 0 || w == 0 {
        return Err(TensorError::InvalidDimensions { rows: h, cols: w });
    }
    let full_h = (h - 1) * stride.0 + kernel.0;
    let full_w = (w - 1) * stride.1 + kernel.1;
    if full_h <= 2 * padding.0 || full_w <= 2 * padding.1 {
        return Err(TensorError::InvalidDimensions {
            rows: full_h,
            cols: full_w,
        });
    }
    Ok((full_h - 2 * padding.0, full_w - 2 * padding.1))
}

/// Strided 2D convolution over feature maps flattened as `[batch, C*H*W]`.
#[derive(Debug)]
pub struct Conv2d {
    weight: Parameter,
    bias: Option<Parameter>,
    in_channels: usize,
    out_channels: usize,
    kernel: (usize, usize),
    stride: (usize, usize),
    padding: (usize, usize),
    input_hw: (usize, usize),
}

impl Conv2d {
    /// Creates a convolution with deterministic small weights and a bias
    /// term. Use [`Conv2d::without_bias`] to drop the bias.
    pub fn new(
        name: impl Into<String>,
        in_channels: usize,
        out_channels: usize,
        kernel: (usize, usize),
        stride: (usize, usize),
        padding: (usize, usize),
        input_hw: (usize, usize),
    ) -> PureResult<Self> {
        validate_positive(in_channels, "in_channels")?;
        validate_positive(out_channels, "out_channels")?;
        validate_positive(kernel.0, "kernel_h")?;
        validate_positive(kernel.1, "kernel_w")?;
        validate_positive(stride.0, "stride_h")?;
        validate_positive(stride.1, "stride_w")?;
        validate_positive(input_hw.0, "input_height")?;
        validate_positive(input_hw.1, "input_width")?;
        let name = name.into();
        let span = in_channels * kernel.0 * kernel.1;
        let mut seed = 0.02f32;
        let weight = Tensor::from_fn(out_channels, span, |_r, _c| {
            let value = seed;
            seed = (seed * 1.57).rem_euclid(0.15).max(5e-3);
            value
        })?;
        let bias = Tensor::zeros(1, out_channels)?;
        let conv = Self {
            weight: Parameter::new(format!("{name}::weight"), weight),
            bias: Some(Parameter::new(format!("{name}::bias"), bias)),
            in_channels,
            out_channels,
            kernel,
            stride,
            padding,
            input_hw,
        };
        // Validate the configuration by computing the output size once.
        conv.output_hw()?;
        Ok(conv)
    }

    /// Builder-style helper that removes the bias term.
    pub fn without_bias(mut self) -> Self {
        self.bias = None;
        self
    }

    /// Spatial extent of the produced feature map.
    pub fn output_hw(&self) -> PureResult<(usize, usize)> {
        conv_output_hw(self.input_hw, self.kernel, self.stride, self.padding)
    }

    /// Number of input channels.
    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    /// Number of output channels.
    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    fn guard_input(&self, input: &Tensor) -> PureResult<usize> {
        let (batch, cols) = input.shape();
        let expected = self.in_channels * self.input_hw.0 * self.input_hw.1;
        if cols != expected {
            return Err(TensorError::ShapeMismatch {
                left: (batch, cols),
                right: (batch, expected),
            });
        }
        Ok(batch)
    }

    fn im2col(&self, input: &Tensor, batch: usize, oh: usize, ow: usize) -> PureResult<Tensor> {
        let kernel_elems = self.in_channels * self.kernel.0 * self.kernel.1;
        let mut columns = Tensor::zeros(batch * oh * ow, kernel_elems)?;
        let cols = input.shape().1;
        let (h, w) = self.input_hw;
        let pad_h = self.padding.0 as isize;
        let pad_w = self.padding.1 as isize;
        {
            let input_data = input.data();
            let column_data = columns.data_mut();
            for b in 0..batch {
                let row = &input_data[b * cols..(b + 1) * cols];
                for oh_idx in 0..oh {
                    for ow_idx in 0..ow {
                        let row_index = b * oh * ow + oh_idx * ow + ow_idx;
                        let offset = row_index * kernel_elems;
                        let mut col_idx = 0;
                        for ic in 0..self.in_channels {
                            let channel_offset = ic * h * w;
                            for kh in 0..self.kernel.0 {
                                for kw in 0..self.kernel.1 {
                                    let idx_h =
                                        (oh_idx * self.stride.0 + kh) as isize - pad_h;
                                    let idx_w =
                                        (ow_idx * self.stride.1 + kw) as isize - pad_w;
                                    column_data[offset + col_idx] = if idx_h < 0
                                        || idx_w < 0
                                        || idx_h >= h as isize
                                        || idx_w >= w as isize
                                    {
                                        0.0
                                    } else {
                                        row[channel_offset
                                            + idx_h as usize * w
                                            + idx_w as usize]
                                    };
                                    col_idx += 1;
                                }
                            }
                        }
                    }
                }
            }
        }
        Ok(columns)
    }

    fn col2im(&self, cols: &Tensor, batch: usize, oh: usize, ow: usize) -> PureResult<Tensor> {
        let kernel_elems = self.in_channels * self.kernel.0 * self.kernel.1;
        if cols.shape() != (batch * oh * ow, kernel_elems) {
            return Err(TensorError::ShapeMismatch {
                left: cols.shape(),
                right: (batch * oh * ow, kernel_elems),
            });
        }
        let mut output =
            Tensor::zeros(batch, self.in_channels * self.input_hw.0 * self.input_hw.1)?;
        let (h, w) = self.input_hw;
        let pad_h = self.padding.0 as isize;
        let pad_w = self.padding.1 as isize;
        let spatial = oh * ow;
        let output_cols = output.shape().1;
        {
            let cols_data = cols.data();
            let output_data = output.data_mut();
            for b in 0..batch {
                let out_row = &mut output_data[b * output_cols..(b + 1) * output_cols];
                for oh_idx in 0..oh {
                    for ow_idx in 0..ow {
                        let row_index = b * spatial + oh_idx * ow + ow_idx;
                        let column_row =
                            &cols_data[row_index * kernel_elems..(row_index + 1) * kernel_elems];
                        let mut col_idx = 0;
                        for ic in 0..self.in_channels {
                            let channel_offset = ic * h * w;
                            for kh in 0..self.kernel.0 {
                                for kw in 0..self.kernel.1 {
                                    let idx_h =
                                        (oh_idx * self.stride.0 + kh) as isize - pad_h;
                                    let idx_w =
                                        (ow_idx * self.stride.1 + kw) as isize - pad_w;
                                    if idx_h >= 0
                                        && idx_w >= 0
                                        && idx_h < h as isize
                                        && idx_w < w as isize
                                    {
                                        out_row[channel_offset
                                            + idx_h as usize * w
                                            + idx_w as usize] += column_row[col_idx];
                                    }
                                    col_idx += 1;
                                }
                            }
                        }
                    }
                }
            }
        }
        Ok(output)
    }

    fn grad_output_to_matrix(
        &self,
        grad_output: &Tensor,
        batch: usize,
        oh: usize,
        ow: usize,
    ) -> PureResult<Tensor> {
        let mut matrix = Tensor::zeros(batch * oh * ow, self.out_channels)?;
        let grad_cols = grad_output.shape().1;
        let spatial = oh * ow;
        {
            let grad_data = grad_output.data();
            let matrix_data = matrix.data_mut();
            for b in 0..batch {
                let grad_row = &grad_data[b * grad_cols..(b + 1) * grad_cols];
                for spatial_idx in 0..spatial {
                    let offset = (b * spatial + spatial_idx) * self.out_channels;
                    for oc in 0..self.out_channels {
                        matrix_data[offset + oc] = grad_row[oc * spatial + spatial_idx];
                    }
                }
            }
        }
        Ok(matrix)
    }
}

impl Module for Conv2d {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        let batch = self.guard_input(input)?;
        let (oh, ow) = self.output_hw()?;
        let spatial = oh * ow;
        let patches = self.im2col(input, batch, oh, ow)?;
        let weight_t = self.weight.value().transpose();
        let product = patches.matmul(&weight_t)?;
        let mut out = Tensor::zeros(batch, self.out_channels * spatial)?;
        let bias = self.bias.as_ref().map(|b| b.value().data());
        {
            let product_data = product.data();
            let out_data = out.data_mut();
            for b in 0..batch {
                let out_row =
                    &mut out_data[b * self.out_channels * spatial..(b + 1) * self.out_channels * spatial];
                for spatial_idx in 0..spatial {
                    let src = (b * spatial + spatial_idx) * self.out_channels;
                    for oc in 0..self.out_channels {
                        let mut value = product_data[src + oc];
                        if let Some(bias) = bias {
                            value += bias[oc];
                        }
                        out_row[oc * spatial + spatial_idx] = value;
                    }
                }
            }
        }
        Ok(out)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        let batch = self.guard_input(input)?;
        let (oh, ow) = self.output_hw()?;
        if grad_output.shape() != (batch, self.out_channels * oh * ow) {
            return Err(TensorError::ShapeMismatch {
                left: grad_output.shape(),
                right: (batch, self.out_channels * oh * ow),
            });
        }
        let patches = self.im2col(input, batch, oh, ow)?;
        let grad_matrix = self.grad_output_to_matrix(grad_output, batch, oh, ow)?;
        let grad_weight = grad_matrix
            .transpose()
            .matmul(&patches)?
            .scale(1.0 / batch as f32)?;
        self.weight.accumulate_euclidean(&grad_weight)?;
        if let Some(bias) = self.bias.as_mut() {
            let sums = grad_matrix.sum_axis0();
            let grad_bias =
                Tensor::from_vec(1, self.out_channels, sums)?.scale(1.0 / batch as f32)?;
            bias.accumulate_euclidean(&grad_bias)?;
        }
        let grad_patches = grad_matrix.matmul(self.weight.value())?;
        self.col2im(&grad_patches, batch, oh, ow)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&self.weight)?;
        if let Some(bias) = &self.bias {
            visitor(bias)?;
        }
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&mut self.weight)?;
        if let Some(bias) = &mut self.bias {
            visitor(bias)?;
        }
        Ok(())
    }
}

/// Fractionally-strided convolution used to double spatial extent inside
/// the generator stacks.
#[derive(Debug)]
pub struct ConvTranspose2d {
    weight: Parameter,
    bias: Option<Parameter>,
    in_channels: usize,
    out_channels: usize,
    kernel: (usize, usize),
    stride: (usize, usize),
    padding: (usize, usize),
    input_hw: (usize, usize),
}

impl ConvTranspose2d {
    /// Creates a transposed convolution. Weight layout is
    /// `[in_channels, out_channels * kh * kw]`.
    pub fn new(
        name: impl Into<String>,
        in_channels: usize,
        out_channels: usize,
        kernel: (usize, usize),
        stride: (usize, usize),
        padding: (usize, usize),
        input_hw: (usize, usize),
    ) -> PureResult<Self> {
        validate_positive(in_channels, "in_channels")?;
        validate_positive(out_channels, "out_channels")?;
        validate_positive(kernel.0, "kernel_h")?;
        validate_positive(kernel.1, "kernel_w")?;
        validate_positive(stride.0, "stride_h")?;
        validate_positive(stride.1, "stride_w")?;
        validate_positive(input_hw.0, "input_height")?;
        validate_positive(input_hw.1, "input_width")?;
        let name = name.into();
        let span = out_channels * kernel.0 * kernel.1;
        let mut seed = 0.02f32;
        let weight = Tensor::from_fn(in_channels, span, |_r, _c| {
            let value = seed;
            seed = (seed * 1.57).rem_euclid(0.15).max(5e-3);
            value
        })?;
        let bias = Tensor::zeros(1, out_channels)?;
        let conv = Self {
            weight: Parameter::new(format!("{name}::weight"), weight),
            bias: Some(Parameter::new(format!("{name}::bias"), bias)),
            in_channels,
            out_channels,
            kernel,
            stride,
            padding,
            input_hw,
        };
        conv.output_hw()?;
        Ok(conv)
    }

    /// Builder-style helper that removes the bias term.
    pub fn without_bias(mut self) -> Self {
        self.bias = None;
        self
    }

    /// Spatial extent of the produced feature map.
    pub fn output_hw(&self) -> PureResult<(usize, usize)> {
        deconv_output_hw(self.input_hw, self.kernel, self.stride, self.padding)
    }

    fn guard_input(&self, input: &Tensor) -> PureResult<usize> {
        let (batch, cols) = input.shape();
        let expected = self.in_channels * self.input_hw.0 * self.input_hw.1;
        if cols != expected {
            return Err(TensorError::ShapeMismatch {
                left: (batch, cols),
                right: (batch, expected),
            });
        }
        Ok(batch)
    }
}

impl Module for ConvTranspose2d {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        let batch = self.guard_input(input)?;
        let (out_h, out_w) = self.output_hw()?;
        let (h, w) = self.input_hw;
        let (kh, kw) = self.kernel;
        let out_spatial = out_h * out_w;
        let kernel_elems = kh * kw;
        let mut out = Tensor::zeros(batch, self.out_channels * out_spatial)?;
        let in_cols = input.shape().1;
        let out_cols = out.shape().1;
        let weight = self.weight.value().data();
        let weight_cols = self.out_channels * kernel_elems;
        {
            let input_data = input.data();
            let out_data = out.data_mut();
            for b in 0..batch {
                let in_row = &input_data[b * in_cols..(b + 1) * in_cols];
                let out_row = &mut out_data[b * out_cols..(b + 1) * out_cols];
                for ic in 0..self.in_channels {
                    let in_offset = ic * h * w;
                    let w_row = &weight[ic * weight_cols..(ic + 1) * weight_cols];
                    for ih in 0..h {
                        for iw in 0..w {
                            let value = in_row[in_offset + ih * w + iw];
                            if value == 0.0 {
                                continue;
                            }
                            for oc in 0..self.out_channels {
                                let w_base = oc * kernel_elems;
                                let o_base = oc * out_spatial;
                                for dkh in 0..kh {
                                    let pos_h = ih * self.stride.0 + dkh;
                                    if pos_h < self.padding.0 {
                                        continue;
                                    }
                                    let oh = pos_h - self.padding.0;
                                    if oh >= out_h {
                                        continue;
                                    }
                                    for dkw in 0..kw {
                                        let pos_w = iw * self.stride.1 + dkw;
                                        if pos_w < self.padding.1 {
                                            continue;
                                        }
                                        let ow = pos_w - self.padding.1;
                                        if ow >= out_w {
                                            continue;
                                        }
                                        out_row[o_base + oh * out_w + ow] +=
                                            value * w_row[w_base + dkh * kw + dkw];
                                    }
                                }
                            }
                        }
                    }
                }
                if let Some(bias) = &self.bias {
                    let bias = bias.value().data();
                    for oc in 0..self.out_channels {
                        for spatial_idx in 0..out_spatial {
                            out_row[oc * out_spatial + spatial_idx] += bias[oc];
                        }
                    }
                }
            }
        }
        Ok(out)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        let batch = self.guard_input(input)?;
        let (out_h, out_w) = self.output_hw()?;
        let out_spatial = out_h * out_w;
        if grad_output.shape() != (batch, self.out_channels * out_spatial) {
            return Err(TensorError::ShapeMismatch {
                left: grad_output.shape(),
                right: (batch, self.out_channels * out_spatial),
            });
        }
        let (h, w) = self.input_hw;
        let (kh, kw) = self.kernel;
        let kernel_elems = kh * kw;
        let weight_cols = self.out_channels * kernel_elems;
        let weight = self.weight.value().data().to_vec();
        let mut grad_weight = vec![0.0f32; self.in_channels * weight_cols];
        let mut grad_input = Tensor::zeros(batch, self.in_channels * h * w)?;
        let in_cols = input.shape().1;
        let grad_cols = grad_output.shape().1;
        {
            let input_data = input.data();
            let grad_data = grad_output.data();
            let grad_in_data = grad_input.data_mut();
            for b in 0..batch {
                let in_row = &input_data[b * in_cols..(b + 1) * in_cols];
                let grad_row = &grad_data[b * grad_cols..(b + 1) * grad_cols];
                let grad_in_row = &mut grad_in_data[b * in_cols..(b + 1) * in_cols];
                for ic in 0..self.in_channels {
                    let in_offset = ic * h * w;
                    let w_row = &weight[ic * weight_cols..(ic + 1) * weight_cols];
                    let gw_row = &mut grad_weight[ic * weight_cols..(ic + 1) * weight_cols];
                    for ih in 0..h {
                        for iw in 0..w {
                            let value = in_row[in_offset + ih * w + iw];
                            let mut acc = 0.0f32;
                            for oc in 0..self.out_channels {
                                let w_base = oc * kernel_elems;
                                let o_base = oc * out_spatial;
                                for dkh in 0..kh {
                                    let pos_h = ih * self.stride.0 + dkh;
                                    if pos_h < self.padding.0 {
                                        continue;
                                    }
                                    let oh = pos_h - self.padding.0;
                                    if oh >= out_h {
                                        continue;
                                    }
                                    for dkw in 0..kw {
                                        let pos_w = iw * self.stride.1 + dkw;
                                        if pos_w < self.padding.1 {
                                            continue;
                                        }
                                        let ow = pos_w - self.padding.1;
                                        if ow >= out_w {
                                            continue;
                                        }
                                        let g = grad_row[o_base + oh * out_w + ow];
                                        acc += g * w_row[w_base + dkh * kw + dkw];
                                        gw_row[w_base + dkh * kw + dkw] += g * value;
                                    }
                                }
                            }
                            grad_in_row[in_offset + ih * w + iw] = acc;
                        }
                    }
                }
            }
        }
        let grad_weight = Tensor::from_vec(self.in_channels, weight_cols, grad_weight)?
            .scale(1.0 / batch as f32)?;
        self.weight.accumulate_euclidean(&grad_weight)?;
        if let Some(bias) = self.bias.as_mut() {
            let mut sums = vec![0.0f32; self.out_channels];
            let grad_data = grad_output.data();
            for b in 0..batch {
                let grad_row = &grad_data[b * grad_cols..(b + 1) * grad_cols];
                for oc in 0..self.out_channels {
                    for spatial_idx in 0..out_spatial {
                        sums[oc] += grad_row[oc * out_spatial + spatial_idx];
                    }
                }
            }
            let grad_bias =
                Tensor::from_vec(1, self.out_channels, sums)?.scale(1.0 / batch as f32)?;
            bias.accumulate_euclidean(&grad_bias)?;
        }
        Ok(grad_input)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&self.weight)?;
        if let Some(bias) = &self.bias {
            visitor(bias)?;
        }
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&mut self.weight)?;
        if let Some(bias) = &mut self.bias {
            visitor(bias)?;
        }
        Ok(())
    }
}

/// Average pooling over 2D feature maps.
#[derive(Debug)]
pub struct AvgPool2d {
    channels: usize,
    kernel: (usize, usize),
    stride: (usize, usize),
    input_hw: (usize, usize),
}

impl AvgPool2d {
    /// Creates an average-pooling layer.
    pub fn new(
        channels: usize,
        kernel: (usize, usize),
        stride: (usize, usize),
        input_hw: (usize, usize),
    ) -> PureResult<Self> {
        validate_positive(channels, "channels")?;
        validate_positive(kernel.0, "kernel_h")?;
        validate_positive(kernel.1, "kernel_w")?;
        validate_positive(stride.0, "stride_h")?;
        validate_positive(stride.1, "stride_w")?;
        validate_positive(input_hw.0, "input_height")?;
        validate_positive(input_hw.1, "input_width")?;
        let pool = Self {
            channels,
            kernel,
            stride,
            input_hw,
        };
        pool.output_hw()?;
        Ok(pool)
    }

    /// Spatial extent of the pooled feature map.
    pub fn output_hw(&self) -> PureResult<(usize, usize)> {
        pool_output_hw(self.input_hw, self.kernel, self.stride, (0, 0))
    }

    fn guard_input(&self, input: &Tensor) -> PureResult<usize> {
        let (batch, cols) = input.shape();
        let expected = self.channels * self.input_hw.0 * self.input_hw.1;
        if cols != expected {
            return Err(TensorError::ShapeMismatch {
                left: (batch, cols),
                right: (batch, expected),
            });
        }
        Ok(batch)
    }
}

impl Module for AvgPool2d {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        let batch = self.guard_input(input)?;
        let (oh, ow) = self.output_hw()?;
        let (h, w) = self.input_hw;
        let area = (self.kernel.0 * self.kernel.1) as f32;
        let mut out = Tensor::zeros(batch, self.channels * oh * ow)?;
        let in_cols = input.shape().1;
        let out_cols = out.shape().1;
        {
            let out_data = out.data_mut();
            for b in 0..batch {
                let row = &input.data()[b * in_cols..(b + 1) * in_cols];
                let out_row = &mut out_data[b * out_cols..(b + 1) * out_cols];
                for c in 0..self.channels {
                    let channel_offset = c * h * w;
                    for oh_idx in 0..oh {
                        for ow_idx in 0..ow {
                            let mut acc = 0.0f32;
                            for dkh in 0..self.kernel.0 {
                                for dkw in 0..self.kernel.1 {
                                    let ih = oh_idx * self.stride.0 + dkh;
                                    let iw = ow_idx * self.stride.1 + dkw;
                                    acc += row[channel_offset + ih * w + iw];
                                }
                            }
                            out_row[c * oh * ow + oh_idx * ow + ow_idx] = acc / area;
                        }
                    }
                }
            }
        }
        Ok(out)
    }

    fn backward(&mut self, _input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        let (batch, cols) = grad_output.shape();
        let (oh, ow) = self.output_hw()?;
        if cols != self.channels * oh * ow {
            return Err(TensorError::ShapeMismatch {
                left: (batch, cols),
                right: (batch, self.channels * oh * ow),
            });
        }
        let (h, w) = self.input_hw;
        let area = (self.kernel.0 * self.kernel.1) as f32;
        let mut grad_input = Tensor::zeros(batch, self.channels * h * w)?;
        let in_cols = grad_input.shape().1;
        {
            let grad_in_data = grad_input.data_mut();
            for b in 0..batch {
                let grad_row = &grad_output.data()[b * cols..(b + 1) * cols];
                let grad_in_row = &mut grad_in_data[b * in_cols..(b + 1) * in_cols];
                for c in 0..self.channels {
                    let channel_offset = c * h * w;
                    for oh_idx in 0..oh {
                        for ow_idx in 0..ow {
                            let go = grad_row[c * oh * ow + oh_idx * ow + ow_idx] / area;
                            for dkh in 0..self.kernel.0 {
                                for dkw in 0..self.kernel.1 {
                                    let ih = oh_idx * self.stride.0 + dkh;
                                    let iw = ow_idx * self.stride.1 + dkw;
                                    grad_in_row[channel_offset + ih * w + iw] += go;
                                }
                            }
                        }
                    }
                }
            }
        }
        Ok(grad_input)
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

/// Nearest-neighbour upsampling by an integer scale factor.
#[derive(Debug)]
pub struct Upsample2d {
    channels: usize,
    scale: usize,
    input_hw: (usize, usize),
}

impl Upsample2d {
    /// Creates a nearest-neighbour upsampler.
    pub fn new(channels: usize, scale: usize, input_hw: (usize, usize)) -> PureResult<Self> {
        validate_positive(channels, "channels")?;
        validate_positive(scale, "scale")?;
        validate_positive(input_hw.0, "input_height")?;
        validate_positive(input_hw.1, "input_width")?;
        Ok(Self {
            channels,
            scale,
            input_hw,
        })
    }

    /// Spatial extent of the upsampled feature map.
    pub fn output_hw(&self) -> (usize, usize) {
        (self.input_hw.0 * self.scale, self.input_hw.1 * self.scale)
    }

    fn guard_input(&self, input: &Tensor) -> PureResult<usize> {
        let (batch, cols) = input.shape();
        let expected = self.channels * self.input_hw.0 * self.input_hw.1;
        if cols != expected {
            return Err(TensorError::ShapeMismatch {
                left: (batch, cols),
                right: (batch, expected),
            });
        }
        Ok(batch)
    }
}

impl Module for Upsample2d {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        let batch = self.guard_input(input)?;
        let (h, w) = self.input_hw;
        let (oh, ow) = self.output_hw();
        let mut out = Tensor::zeros(batch, self.channels * oh * ow)?;
        let in_cols = input.shape().1;
        let out_cols = out.shape().1;
        {
            let out_data = out.data_mut();
            for b in 0..batch {
                let row = &input.data()[b * in_cols..(b + 1) * in_cols];
                let out_row = &mut out_data[b * out_cols..(b + 1) * out_cols];
                for c in 0..self.channels {
                    let src_offset = c * h * w;
                    let dst_offset = c * oh * ow;
                    for oh_idx in 0..oh {
                        let ih = oh_idx / self.scale;
                        for ow_idx in 0..ow {
                            let iw = ow_idx / self.scale;
                            out_row[dst_offset + oh_idx * ow + ow_idx] =
                                row[src_offset + ih * w + iw];
                        }
                    }
                }
            }
        }
        Ok(out)
    }

    fn backward(&mut self, _input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        let (batch, cols) = grad_output.shape();
        let (h, w) = self.input_hw;
        let (oh, ow) = self.output_hw();
        if cols != self.channels * oh * ow {
            return Err(TensorError::ShapeMismatch {
                left: (batch, cols),
                right: (batch, self.channels * oh * ow),
            });
        }
        let mut grad_input = Tensor::zeros(batch, self.channels * h * w)?;
        let in_cols = grad_input.shape().1;
        {
            let grad_in_data = grad_input.data_mut();
            for b in 0..batch {
                let grad_row = &grad_output.data()[b * cols..(b + 1) * cols];
                let grad_in_row = &mut grad_in_data[b * in_cols..(b + 1) * in_cols];
                for c in 0..self.channels {
                    let src_offset = c * oh * ow;
                    let dst_offset = c * h * w;
                    for oh_idx in 0..oh {
                        let ih = oh_idx / self.scale;
                        for ow_idx in 0..ow {
                            let iw = ow_idx / self.scale;
                            grad_in_row[dst_offset + ih * w + iw] +=
                                grad_row[src_offset + oh_idx * ow + ow_idx];
                        }
                    }
                }
            }
        }
        Ok(grad_input)
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

    fn fill_parameter(param: &mut Parameter, value: f32) {
        for slot in param.value_mut().data_mut() {
            *slot = value;
        }
    }

    #[test]
    fn conv2d_one_by_one_kernel_acts_as_channel_mix() {
        let mut conv = Conv2d::new("mix", 2, 1, (1, 1), (1, 1), (0, 0), (2, 2)).unwrap();
        conv.visit_parameters_mut(&mut |param| {
            fill_parameter(param, if param.name().contains("weight") { 1.0 } else { 0.0 });
            Ok(())
        })
        .unwrap();
        let input = Tensor::from_vec(
            1,
            8,
            vec![1.0, 2.0, 3.0, 4.0, 10.0, 20.0, 30.0, 40.0],
        )
        .unwrap();
        let output = conv.forward(&input).unwrap();
        assert_eq!(output.shape(), (1, 4));
        assert_eq!(output.data(), &[11.0, 22.0, 33.0, 44.0]);
    }

    #[test]
    fn conv2d_strided_halves_spatial_extent() {
        let conv = Conv2d::new("down", 3, 8, (4, 4), (2, 2), (1, 1), (32, 32)).unwrap();
        assert_eq!(conv.output_hw().unwrap(), (16, 16));
        let input = Tensor::random_uniform(2, 3 * 32 * 32, -1.0, 1.0, Some(7)).unwrap();
        let output = conv.forward(&input).unwrap();
        assert_eq!(output.shape(), (2, 8 * 16 * 16));
    }

    #[test]
    fn conv2d_backward_matches_finite_differences() {
        let mut conv = Conv2d::new("fd", 1, 1, (2, 2), (1, 1), (0, 0), (3, 3)).unwrap();
        let input = Tensor::random_uniform(1, 9, -1.0, 1.0, Some(13)).unwrap();
        let (oh, ow) = conv.output_hw().unwrap();
        let grad_output = Tensor::from_vec(1, oh * ow, vec![1.0; oh * ow]).unwrap();
        let grad_input = conv.backward(&input, &grad_output).unwrap();
        let epsilon = 1e-3f32;
        for idx in 0..9 {
            let mut plus = input.clone();
            plus.data_mut()[idx] += epsilon;
            let mut minus = input.clone();
            minus.data_mut()[idx] -= epsilon;
            let f_plus: f32 = conv.forward(&plus).unwrap().data().iter().sum();
            let f_minus: f32 = conv.forward(&minus).unwrap().data().iter().sum();
            let numeric = (f_plus - f_minus) / (2.0 * epsilon);
            assert!(
                (numeric - grad_input.data()[idx]).abs() < 1e-2,
                "grad mismatch at {idx}: numeric={numeric} analytic={}",
                grad_input.data()[idx]
            );
        }
    }

    #[test]
    fn conv_transpose_doubles_spatial_extent() {
        let deconv =
            ConvTranspose2d::new("up", 4, 2, (4, 4), (2, 2), (1, 1), (8, 8)).unwrap();
        assert_eq!(deconv.output_hw().unwrap(), (16, 16));
        let input = Tensor::random_uniform(2, 4 * 8 * 8, -1.0, 1.0, Some(3)).unwrap();
        let output = deconv.forward(&input).unwrap();
        assert_eq!(output.shape(), (2, 2 * 16 * 16));
    }

    #[test]
    fn conv_transpose_projects_latent_to_four_by_four() {
        let deconv = ConvTranspose2d::new("seed", 16, 8, (4, 4), (1, 1), (0, 0), (1, 1)).unwrap();
        assert_eq!(deconv.output_hw().unwrap(), (4, 4));
        let latent = Tensor::random_uniform(3, 16, -1.0, 1.0, Some(5)).unwrap();
        let output = deconv.forward(&latent).unwrap();
        assert_eq!(output.shape(), (3, 8 * 4 * 4));
    }

    #[test]
    fn conv_transpose_backward_matches_finite_differences() {
        let mut deconv =
            ConvTranspose2d::new("fd", 1, 1, (2, 2), (2, 2), (0, 0), (2, 2)).unwrap();
        let input = Tensor::random_uniform(1, 4, -1.0, 1.0, Some(17)).unwrap();
        let (oh, ow) = deconv.output_hw().unwrap();
        let grad_output = Tensor::from_vec(1, oh * ow, vec![1.0; oh * ow]).unwrap();
        let grad_input = deconv.backward(&input, &grad_output).unwrap();
        let epsilon = 1e-3f32;
        for idx in 0..4 {
            let mut plus = input.clone();
            plus.data_mut()[idx] += epsilon;
            let mut minus = input.clone();
            minus.data_mut()[idx] -= epsilon;
            let f_plus: f32 = deconv.forward(&plus).unwrap().data().iter().sum();
            let f_minus: f32 = deconv.forward(&minus).unwrap().data().iter().sum();
            let numeric = (f_plus - f_minus) / (2.0 * epsilon);
            assert!((numeric - grad_input.data()[idx]).abs() < 1e-2);
        }
    }

    #[test]
    fn avg_pool_averages_windows() {
        let pool = AvgPool2d::new(1, (2, 2), (2, 2), (2, 2)).unwrap();
        let input = Tensor::from_vec(1, 4, vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let output = pool.forward(&input).unwrap();
        assert_eq!(output.shape(), (1, 1));
        assert_eq!(output.data(), &[2.5]);
    }

    #[test]
    fn upsample_replicates_nearest_neighbours() {
        let up = Upsample2d::new(1, 2, (2, 2)).unwrap();
        let input = Tensor::from_vec(1, 4, vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let output = up.forward(&input).unwrap();
        assert_eq!(output.shape(), (1, 16));
        assert_eq!(
            output.data(),
            &[1.0, 1.0, 2.0, 2.0, 1.0, 1.0, 2.0, 2.0, 3.0, 3.0, 4.0, 4.0, 3.0, 3.0, 4.0, 4.0]
        );
    }

    #[test]
    fn upsample_backward_sums_replicated_gradients() {
        let mut up = Upsample2d::new(1, 2, (2, 2)).unwrap();
        let input = Tensor::from_vec(1, 4, vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let grad_output = Tensor::from_vec(1, 16, vec![1.0; 16]).unwrap();
        let grad_input = up.backward(&input, &grad_output).unwrap();
        assert_eq!(grad_input.data(), &[4.0, 4.0, 4.0, 4.0]);
    }
}
