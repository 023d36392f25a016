// SPDX-License-Identifier: AGPL-3.0-or-later
// Part of LatentTorch — Licensed under AGPL-3.0-or-later.

use crate::module::{Module, Parameter};
use crate::{PureResult, Tensor, TensorError};
use rayon::prelude::*;

/// Validates a requested worker count against what the runtime offers.
///
/// Zero workers is always accepted and selects the plain single-call path.
pub fn check_devices(requested: usize, available: usize) -> PureResult<()> {
    if requested > 0 && requested > available {
        return Err(TensorError::DeviceUnavailable {
            requested,
            available,
        });
    }
    Ok(())
}

/// Worker count offered by the rayon thread pool.
pub fn available_devices() -> usize {
    rayon::current_num_threads()
}

fn shard_ranges(batch: usize, shards: usize) -> Vec<(usize, usize)> {
    let base = batch / shards;
    let remainder = batch % shards;
    let mut ranges = Vec::with_capacity(shards);
    let mut start = 0;
    for shard in 0..shards {
        let len = base + usize::from(shard < remainder);
        ranges.push((start, start + len));
        start += len;
    }
    ranges
}

/// Splits `input` into contiguous row shards, applies `f` to each shard on
/// the rayon pool, and re-concatenates the results in shard order.
///
/// `devices == 0` is the distinguished plain path: `f` runs once on the full
/// batch with no dispatch machinery involved. A shard count larger than the
/// batch collapses to one shard per row, so results never depend on how many
/// workers were requested.
pub fn parallel_apply<F>(input: &Tensor, devices: usize, f: F) -> PureResult<Tensor>
where
    F: Fn(&Tensor) -> PureResult<Tensor> + Sync,
{
    if devices == 0 {
        return f(input);
    }
    check_devices(devices, available_devices())?;
    let (batch, _) = input.shape();
    let shards = devices.min(batch);
    if shards <= 1 {
        return f(input);
    }
    let parts = shard_ranges(batch, shards)
        .into_par_iter()
        .map(|(start, end)| {
            let shard = input.slice_rows(start, end)?;
            f(&shard)
        })
        .collect::<PureResult<Vec<_>>>()?;
    Tensor::concat_rows(&parts)
}

/// Wrapper that fans a module's forward pass out across batch shards.
///
/// Only the forward pass is dispatched. Backward runs undispatched on the
/// wrapped module so gradient accumulation stays a single-threaded, ordered
/// affair.
#[derive(Debug)]
pub struct DataParallel<M> {
    inner: M,
    devices: usize,
}

impl<M: Module + Sync> DataParallel<M> {
    /// Wraps `inner`, validating the worker count up front.
    pub fn new(inner: M, devices: usize) -> PureResult<Self> {
        check_devices(devices, available_devices())?;
        Ok(Self { inner, devices })
    }

    /// Number of workers the forward pass fans out to.
    pub fn devices(&self) -> usize {
        self.devices
    }

    /// Borrows the wrapped module.
    pub fn inner(&self) -> &M {
        &self.inner
    }

    /// Mutably borrows the wrapped module.
    pub fn inner_mut(&mut self) -> &mut M {
        &mut self.inner
    }

    /// Unwraps the module.
    pub fn into_inner(self) -> M {
        self.inner
    }
}

impl<M: Module + Sync> Module for DataParallel<M> {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        parallel_apply(input, self.devices, |shard| self.inner.forward(shard))
    }

    fn replay_forward(&self, input: &Tensor) -> PureResult<Tensor> {
        self.inner.replay_forward(input)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        self.inner.backward(input, grad_output)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.inner.visit_parameters(visitor)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.inner.visit_parameters_mut(visitor)
    }

    fn set_training(&self, training: bool) {
        self.inner.set_training(training);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::Linear;

    #[test]
    fn shard_ranges_cover_batch_without_overlap() {
        let ranges = shard_ranges(7, 3);
        assert_eq!(ranges, vec![(0, 3), (3, 5), (5, 7)]);
        let ranges = shard_ranges(4, 4);
        assert_eq!(ranges, vec![(0, 1), (1, 2), (2, 3), (3, 4)]);
    }

    #[test]
    fn dispatched_forward_matches_plain_path() {
        let layer = Linear::new("fc", 6, 4).unwrap();
        let input = Tensor::random_uniform(5, 6, -1.0, 1.0, Some(41)).unwrap();
        let plain = parallel_apply(&input, 0, |t| layer.forward(t)).unwrap();
        let single = parallel_apply(&input, 1, |t| layer.forward(t)).unwrap();
        let sharded = parallel_apply(&input, 2, |t| layer.forward(t)).unwrap();
        assert_eq!(plain, single);
        assert_eq!(plain, sharded);
    }

    #[test]
    fn oversubscribed_request_is_rejected() {
        let available = available_devices();
        let result = check_devices(available + 1, available);
        assert!(matches!(
            result,
            Err(TensorError::DeviceUnavailable { .. })
        ));
    }

    #[test]
    fn wrapper_forwards_and_reaches_parameters() {
        let wrapped = DataParallel::new(Linear::new("fc", 3, 2).unwrap(), 1).unwrap();
        let input = Tensor::random_uniform(4, 3, -1.0, 1.0, Some(5)).unwrap();
        let expected = wrapped.inner().forward(&input).unwrap();
        assert_eq!(wrapped.forward(&input).unwrap(), expected);
        let mut count = 0;
        wrapped
            .visit_parameters(&mut |_| {
                count += 1;
                Ok(())
            })
            .unwrap();
        assert_eq!(count, 2);
    }
}
