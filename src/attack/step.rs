use anyhow::{Result, ensure};
use burn::prelude::*;

use super::Direction;

/// One projected signed-gradient update: `clamp(delta + step * sign, -eps, eps)`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SignGradientStep {
    pub step_size: f32,
    pub epsilon: f32,
    pub direction: Direction,
}

impl SignGradientStep {
    pub fn new(step_size: f32, epsilon: f32, direction: Direction) -> Result<Self> {
        ensure!(step_size.is_finite() && step_size >= 0.0, "step size must be non-negative");
        ensure!(epsilon.is_finite() && epsilon >= 0.0, "epsilon must be non-negative");

        Ok(Self {
            step_size,
            epsilon,
            direction,
        })
    }

    /// `signs` may be an accumulated sum of per-sample signs.
    pub fn apply<B: Backend, const D: usize>(&self, delta: Tensor<B, D>, signs: Tensor<B, D>) -> Tensor<B, D> {
        let update = signs.mul_scalar(self.step_size * self.direction.sign());
        (delta + update).clamp(-self.epsilon, self.epsilon)
    }
}
