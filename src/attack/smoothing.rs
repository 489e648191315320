use anyhow::{Result, ensure};
use burn::{
    prelude::*,
    tensor::{module::conv2d, ops::ConvOptions},
};

use super::Direction;

/// Penalizes high-frequency content of a perturbation: the L1 norm of what a
/// `kernel_size` box blur removes from it. Disabled when `eta` is zero.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Smoothing {
    kernel_size: usize,
    eta: f32,
}

impl Smoothing {
    pub fn new(kernel_size: usize, eta: f32) -> Result<Self> {
        ensure!(kernel_size % 2 == 1, "smoothing kernel size must be odd, got {kernel_size}");
        ensure!(eta.is_finite() && eta >= 0.0, "smoothing weight must be non-negative, got {eta}");

        Ok(Self { kernel_size, eta })
    }

    pub fn enabled(&self) -> bool {
        self.eta > 0.0
    }

    /// High-frequency energy of `(batch, steps, c, h, w)` deltas.
    pub fn penalty<B: Backend>(&self, delta: Tensor<B, 5>) -> Tensor<B, 1> {
        let [b, t, c, h, w] = delta.dims();
        let k = self.kernel_size;
        let x = delta.reshape([b * t, c, h, w]);

        let weight = Tensor::<B, 4>::ones([c, 1, k, k], &x.device()).div_scalar((k * k) as f32);
        let options = ConvOptions::new([1, 1], [k / 2, k / 2], [1, 1], c);
        let blurred = conv2d(x.clone(), weight, None, options);

        (x - blurred).abs().sum()
    }

    /// Folds the penalty into `loss` so the attack direction always works against it.
    pub fn regularize<B: Backend>(&self, loss: Tensor<B, 1>, delta: Tensor<B, 5>, direction: Direction) -> Tensor<B, 1> {
        if !self.enabled() {
            return loss;
        }

        loss - self.penalty(delta).mul_scalar(self.eta * direction.sign())
    }
}
