// SPDX-License-Identifier: AGPL-3.0-or-later
// Part of LatentTorch — Licensed under AGPL-3.0-or-later.

//! Pure-Rust tensor primitives backing the LatentTorch model stacks.
//!
//! Tensors are dense row-major `f32` matrices. Image batches travel through
//! the network crates flattened as `[batch, channels * height * width]` and
//! latent batches as `[batch, latent_dim]`, so a two-axis layout is all the
//! layer kernels require.

use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal, Uniform};
use rayon::prelude::*;
use std::fmt;

/// Result alias used throughout the LatentTorch crates.
pub type PureResult<T> = Result<T, TensorError>;

/// Errors emitted by tensor utilities and every layer built on top of them.
#[derive(Clone, Debug, PartialEq)]
pub enum TensorError {
    /// A tensor constructor received an invalid shape.
    InvalidDimensions { rows: usize, cols: usize },
    /// Data provided to a constructor does not match the tensor shape.
    DataLength { expected: usize, got: usize },
    /// An operator was asked to combine tensors of incompatible shapes.
    ShapeMismatch {
        left: (usize, usize),
        right: (usize, usize),
    },
    /// Computation received an empty input which would otherwise panic.
    EmptyInput(&'static str),
    /// Attempted to load or update a parameter missing from the state dict.
    MissingParameter { name: String },
    /// Generic configuration violation for layer constructors.
    InvalidValue { label: &'static str },
    /// Numeric guard detected a non-finite value.
    NonFiniteValue { label: &'static str, value: f32 },
    /// A model factory was asked for a topology it does not hard-code.
    UnsupportedConfiguration { label: &'static str, value: usize },
    /// More parallel devices were requested than the runtime can supply.
    DeviceUnavailable { requested: usize, available: usize },
    /// Wrapper around I/O failures when persisting or restoring tensors.
    IoError { message: String },
    /// Wrapper around serde failures when deserialising tensors.
    SerializationError { message: String },
}

impl fmt::Display for TensorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TensorError::InvalidDimensions { rows, cols } => {
                write!(
                    f,
                    "invalid tensor dimensions ({rows} x {cols}); both axes must be non-zero"
                )
            }
            TensorError::DataLength { expected, got } => {
                write!(f, "data length mismatch: expected {expected}, got {got}")
            }
            TensorError::ShapeMismatch { left, right } => {
                write!(
                    f,
                    "shape mismatch: left={:?}, right={:?} cannot be combined",
                    left, right
                )
            }
            TensorError::EmptyInput(label) => {
                write!(f, "{label} received an empty input")
            }
            TensorError::MissingParameter { name } => {
                write!(f, "state dict is missing parameter `{name}`")
            }
            TensorError::InvalidValue { label } => {
                write!(f, "invalid value for {label}")
            }
            TensorError::NonFiniteValue { label, value } => {
                write!(f, "{label} must be finite, got {value}")
            }
            TensorError::UnsupportedConfiguration { label, value } => {
                write!(f, "unsupported configuration: {label}={value}")
            }
            TensorError::DeviceUnavailable {
                requested,
                available,
            } => {
                write!(
                    f,
                    "requested {requested} parallel devices but only {available} are available"
                )
            }
            TensorError::IoError { message } => write!(f, "tensor io error: {message}"),
            TensorError::SerializationError { message } => {
                write!(f, "tensor serialization error: {message}")
            }
        }
    }
}

impl std::error::Error for TensorError {}

/// Dense row-major matrix of `f32` values.
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
}

// Below this element count a serial matmul beats the fork/join overhead.
const MATMUL_PAR_WORK: usize = 1 << 15;

impl Tensor {
    fn check_shape(rows: usize, cols: usize) -> PureResult<()> {
        if rows == 0 || cols == 0 {
            return Err(TensorError::InvalidDimensions { rows, cols });
        }
        Ok(())
    }

    /// Create a tensor filled with zeros.
    pub fn zeros(rows: usize, cols: usize) -> PureResult<Self> {
        Self::check_shape(rows, cols)?;
        Ok(Self {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        })
    }

    /// Create a tensor from raw data. The provided vector must hold exactly
    /// `rows * cols` elements.
    pub fn from_vec(rows: usize, cols: usize, data: Vec<f32>) -> PureResult<Self> {
        Self::check_shape(rows, cols)?;
        if data.len() != rows * cols {
            return Err(TensorError::DataLength {
                expected: rows * cols,
                got: data.len(),
            });
        }
        Ok(Self { rows, cols, data })
    }

    /// Construct a tensor by applying a generator function to each coordinate.
    pub fn from_fn<F>(rows: usize, cols: usize, mut f: F) -> PureResult<Self>
    where
        F: FnMut(usize, usize) -> f32,
    {
        Self::check_shape(rows, cols)?;
        let mut data = Vec::with_capacity(rows * cols);
        for r in 0..rows {
            for c in 0..cols {
                data.push(f(r, c));
            }
        }
        Ok(Self { rows, cols, data })
    }

    fn seedable_rng(seed: Option<u64>) -> StdRng {
        match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        }
    }

    /// Construct a tensor by sampling a uniform distribution in `[min, max)`.
    ///
    /// When `seed` is provided the RNG becomes deterministic which keeps
    /// tests and benchmarks reproducible.
    pub fn random_uniform(
        rows: usize,
        cols: usize,
        min: f32,
        max: f32,
        seed: Option<u64>,
    ) -> PureResult<Self> {
        Self::check_shape(rows, cols)?;
        if !(min < max) {
            return Err(TensorError::InvalidValue {
                label: "random_uniform_bounds",
            });
        }
        let mut rng = Self::seedable_rng(seed);
        let distribution = Uniform::new(min, max);
        let data = (0..rows * cols)
            .map(|_| distribution.sample(&mut rng))
            .collect();
        Ok(Self { rows, cols, data })
    }

    /// Construct a tensor by sampling a normal distribution with the provided
    /// mean and standard deviation.
    pub fn random_normal(
        rows: usize,
        cols: usize,
        mean: f32,
        std: f32,
        seed: Option<u64>,
    ) -> PureResult<Self> {
        Self::check_shape(rows, cols)?;
        if std <= 0.0 || !std.is_finite() {
            return Err(TensorError::InvalidValue {
                label: "random_normal_std",
            });
        }
        let mut rng = Self::seedable_rng(seed);
        let gaussian = StandardNormal;
        let data = (0..rows * cols)
            .map(|_| {
                let sample: f64 = gaussian.sample(&mut rng);
                mean + std * sample as f32
            })
            .collect();
        Ok(Self { rows, cols, data })
    }

    /// Returns the `(rows, cols)` pair of the tensor.
    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    /// Immutable view of the underlying row-major buffer.
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Mutable view of the underlying row-major buffer.
    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Returns a copy of the rows in `[start, end)` as a new tensor.
    pub fn slice_rows(&self, start: usize, end: usize) -> PureResult<Tensor> {
        if start >= end || end > self.rows {
            return Err(TensorError::InvalidDimensions {
                rows: end.saturating_sub(start),
                cols: self.cols,
            });
        }
        let data = self.data[start * self.cols..end * self.cols].to_vec();
        Tensor::from_vec(end - start, self.cols, data)
    }

    /// Stacks tensors with identical column counts along the batch axis.
    pub fn concat_rows(parts: &[Tensor]) -> PureResult<Tensor> {
        let first = parts.first().ok_or(TensorError::EmptyInput("concat_rows"))?;
        let cols = first.cols;
        let mut rows = 0;
        let mut data = Vec::new();
        for part in parts {
            if part.cols != cols {
                return Err(TensorError::ShapeMismatch {
                    left: (first.rows, cols),
                    right: part.shape(),
                });
            }
            rows += part.rows;
            data.extend_from_slice(&part.data);
        }
        Tensor::from_vec(rows, cols, data)
    }

    /// Reinterprets the buffer with a new shape holding the same volume.
    pub fn reshape(&self, rows: usize, cols: usize) -> PureResult<Tensor> {
        Self::check_shape(rows, cols)?;
        if rows * cols != self.rows * self.cols {
            return Err(TensorError::DataLength {
                expected: self.rows * self.cols,
                got: rows * cols,
            });
        }
        Tensor::from_vec(rows, cols, self.data.clone())
    }

    fn ensure_same_shape(&self, other: &Tensor) -> PureResult<()> {
        if self.shape() != other.shape() {
            return Err(TensorError::ShapeMismatch {
                left: self.shape(),
                right: other.shape(),
            });
        }
        Ok(())
    }

    /// Element-wise addition.
    pub fn add(&self, other: &Tensor) -> PureResult<Tensor> {
        self.ensure_same_shape(other)?;
        let data = self
            .data
            .iter()
            .zip(other.data.iter())
            .map(|(a, b)| a + b)
            .collect();
        Tensor::from_vec(self.rows, self.cols, data)
    }

    /// Element-wise subtraction.
    pub fn sub(&self, other: &Tensor) -> PureResult<Tensor> {
        self.ensure_same_shape(other)?;
        let data = self
            .data
            .iter()
            .zip(other.data.iter())
            .map(|(a, b)| a - b)
            .collect();
        Tensor::from_vec(self.rows, self.cols, data)
    }

    /// Element-wise product.
    pub fn hadamard(&self, other: &Tensor) -> PureResult<Tensor> {
        self.ensure_same_shape(other)?;
        let data = self
            .data
            .iter()
            .zip(other.data.iter())
            .map(|(a, b)| a * b)
            .collect();
        Tensor::from_vec(self.rows, self.cols, data)
    }

    /// Multiplies every element by a scalar.
    pub fn scale(&self, value: f32) -> PureResult<Tensor> {
        let data = self.data.iter().map(|a| a * value).collect();
        Tensor::from_vec(self.rows, self.cols, data)
    }

    /// In-place `self += other * scale`.
    pub fn add_scaled(&mut self, other: &Tensor, scale: f32) -> PureResult<()> {
        self.ensure_same_shape(other)?;
        for (a, b) in self.data.iter_mut().zip(other.data.iter()) {
            *a += b * scale;
        }
        Ok(())
    }

    /// Adds a row vector to every row of the tensor.
    pub fn add_row_inplace(&mut self, bias: &[f32]) -> PureResult<()> {
        if bias.len() != self.cols {
            return Err(TensorError::DataLength {
                expected: self.cols,
                got: bias.len(),
            });
        }
        for row in self.data.chunks_mut(self.cols) {
            for (value, b) in row.iter_mut().zip(bias.iter()) {
                *value += b;
            }
        }
        Ok(())
    }

    /// Returns the transposed tensor.
    pub fn transpose(&self) -> Tensor {
        let mut data = vec![0.0; self.rows * self.cols];
        for r in 0..self.rows {
            for c in 0..self.cols {
                data[c * self.rows + r] = self.data[r * self.cols + c];
            }
        }
        Tensor {
            rows: self.cols,
            cols: self.rows,
            data,
        }
    }

    /// Column sums collapsed into a single row.
    pub fn sum_axis0(&self) -> Vec<f32> {
        let mut sums = vec![0.0f32; self.cols];
        for row in self.data.chunks(self.cols) {
            for (sum, value) in sums.iter_mut().zip(row.iter()) {
                *sum += value;
            }
        }
        sums
    }

    /// Squared L2 norm over the whole buffer.
    pub fn squared_l2_norm(&self) -> f32 {
        self.data.iter().map(|v| v * v).sum()
    }

    /// Projects every row onto the unit hypersphere.
    ///
    /// Fails when a row has zero norm; a direction cannot be recovered from
    /// the origin.
    pub fn l2_normalize_rows(&self) -> PureResult<Tensor> {
        let mut data = Vec::with_capacity(self.rows * self.cols);
        for row in self.data.chunks(self.cols) {
            let norm = row.iter().map(|v| v * v).sum::<f32>().sqrt();
            if norm <= f32::EPSILON {
                return Err(TensorError::InvalidValue {
                    label: "l2_normalize_rows_zero_row",
                });
            }
            data.extend(row.iter().map(|v| v / norm));
        }
        Tensor::from_vec(self.rows, self.cols, data)
    }

    fn matmul_row_into(lhs_row: &[f32], rhs: &Tensor, out_row: &mut [f32]) {
        for (k, &a) in lhs_row.iter().enumerate() {
            if a == 0.0 {
                continue;
            }
            let rhs_row = &rhs.data[k * rhs.cols..(k + 1) * rhs.cols];
            for (out, &b) in out_row.iter_mut().zip(rhs_row.iter()) {
                *out += a * b;
            }
        }
    }

    /// Dense matrix product. Large products fan rows out across the rayon
    /// thread pool.
    pub fn matmul(&self, other: &Tensor) -> PureResult<Tensor> {
        if self.cols != other.rows {
            return Err(TensorError::ShapeMismatch {
                left: self.shape(),
                right: other.shape(),
            });
        }
        let mut out = vec![0.0f32; self.rows * other.cols];
        let work = self.rows * self.cols * other.cols;
        if work >= MATMUL_PAR_WORK {
            out.par_chunks_mut(other.cols)
                .enumerate()
                .for_each(|(r, out_row)| {
                    let lhs_row = &self.data[r * self.cols..(r + 1) * self.cols];
                    Self::matmul_row_into(lhs_row, other, out_row);
                });
        } else {
            for (r, out_row) in out.chunks_mut(other.cols).enumerate() {
                let lhs_row = &self.data[r * self.cols..(r + 1) * self.cols];
                Self::matmul_row_into(lhs_row, other, out_row);
            }
        }
        Tensor::from_vec(self.rows, other.cols, out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_vec_rejects_wrong_length() {
        let err = Tensor::from_vec(2, 2, vec![1.0, 2.0, 3.0]).unwrap_err();
        assert_eq!(err, TensorError::DataLength { expected: 4, got: 3 });
    }

    #[test]
    fn matmul_matches_manual_product() {
        let a = Tensor::from_vec(2, 3, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let b = Tensor::from_vec(3, 2, vec![7.0, 8.0, 9.0, 10.0, 11.0, 12.0]).unwrap();
        let out = a.matmul(&b).unwrap();
        assert_eq!(out.shape(), (2, 2));
        assert_eq!(out.data(), &[58.0, 64.0, 139.0, 154.0]);
    }

    #[test]
    fn matmul_parallel_agrees_with_serial() {
        let a = Tensor::random_uniform(48, 40, -1.0, 1.0, Some(3)).unwrap();
        let b = Tensor::random_uniform(40, 48, -1.0, 1.0, Some(5)).unwrap();
        let parallel = a.matmul(&b).unwrap();
        let mut serial = vec![0.0f32; 48 * 48];
        for (r, out_row) in serial.chunks_mut(48).enumerate() {
            Tensor::matmul_row_into(&a.data()[r * 40..(r + 1) * 40], &b, out_row);
        }
        for (p, s) in parallel.data().iter().zip(serial.iter()) {
            assert!((p - s).abs() < 1e-5);
        }
    }

    #[test]
    fn transpose_round_trips() {
        let a = Tensor::from_vec(2, 3, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        assert_eq!(a.transpose().transpose(), a);
    }

    #[test]
    fn l2_normalize_rows_produces_unit_rows() {
        let a = Tensor::from_vec(2, 3, vec![3.0, 0.0, 4.0, 0.0, 5.0, 12.0]).unwrap();
        let normed = a.l2_normalize_rows().unwrap();
        for row in normed.data().chunks(3) {
            let norm = row.iter().map(|v| v * v).sum::<f32>().sqrt();
            assert!((norm - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn l2_normalize_rows_rejects_zero_row() {
        let a = Tensor::zeros(1, 4).unwrap();
        assert!(a.l2_normalize_rows().is_err());
    }

    #[test]
    fn slice_and_concat_round_trip() {
        let a = Tensor::random_uniform(5, 3, 0.0, 1.0, Some(9)).unwrap();
        let head = a.slice_rows(0, 2).unwrap();
        let tail = a.slice_rows(2, 5).unwrap();
        let glued = Tensor::concat_rows(&[head, tail]).unwrap();
        assert_eq!(glued, a);
    }

    #[test]
    fn random_normal_is_seed_deterministic() {
        let a = Tensor::random_normal(2, 8, 0.0, 1.0, Some(42)).unwrap();
        let b = Tensor::random_normal(2, 8, 0.0, 1.0, Some(42)).unwrap();
        assert_eq!(a, b);
    }
}
