use std::ops::Range;

use anyhow::{Result, ensure};
use burn::{module::AutodiffModule, prelude::*, tensor::backend::AutodiffBackend};
use rand::Rng;
use serde::{Deserialize, Serialize};
use strum::Display;

use crate::{
    normalizer::{FieldStats, LinearNormalizer},
    observation::Observation,
    sampler::ActionBounds,
};

pub mod bc;
pub mod encoder;
pub mod ibc;

pub use bc::{BcModel, BcPolicy, BcPolicyConfig};
pub use encoder::{EncoderConfig, ImageMeta, LowDimMeta, ObsEncoder};
pub use ibc::{IbcModel, IbcPolicy, IbcPolicyConfig};

/// Whether stochastic layers such as dropout are active.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum Phase {
    Train,
    Eval,
}

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PolicyKind {
    Ibc,
    Bc,
}

/// Temporal layout shared by all policies.
#[derive(Config, Debug)]
pub struct PolicyShape {
    pub action_dim: usize,

    #[config(default = 2)]
    pub n_obs_steps: usize,

    #[config(default = 1)]
    pub n_action_steps: usize,

    #[config(default = 2)]
    pub horizon: usize,
}

impl PolicyShape {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.action_dim > 0, "action_dim must be positive");
        ensure!(
            self.n_obs_steps > 0 && self.n_action_steps > 0,
            "n_obs_steps and n_action_steps must be positive"
        );
        ensure!(
            self.horizon >= self.action_window().end,
            "horizon {} is shorter than the action window {:?}",
            self.horizon,
            self.action_window()
        );
        Ok(())
    }

    /// Steps of a demonstration horizon the policy is trained to output.
    pub fn action_window(&self) -> Range<usize> {
        let start = self.n_obs_steps - 1;
        start..start + self.n_action_steps
    }

    /// Cuts the action window out of `(batch, horizon, action_dim)` actions.
    pub fn window<B: Backend>(&self, actions: Tensor<B, 3>) -> Result<Tensor<B, 3>> {
        let [b, t, d] = actions.dims();
        let window = self.action_window();
        ensure!(
            t >= window.end,
            "actions cover {t} steps but the policy needs steps {window:?}"
        );
        ensure!(d == self.action_dim, "actions have dimension {d}, expected {}", self.action_dim);

        Ok(actions.slice([0..b, window, 0..d]))
    }
}

/// A visuomotor policy mapping observation windows to action sequences.
///
/// Actions passed in and returned are in the unnormalized action space; the
/// policy applies its own normalizer.
pub trait Policy<B: Backend> {
    fn shape(&self) -> &PolicyShape;

    fn normalizer(&self) -> &LinearNormalizer;

    /// Observation features `(batch, n_obs_steps, feature_dim)`.
    fn encode_observations(&self, obs: &Observation<B>) -> Result<Tensor<B, 3>>;

    /// Actions `(batch, n_action_steps, action_dim)`.
    fn predict_action<R: Rng>(&self, obs: &Observation<B>, rng: &mut R) -> Result<Tensor<B, 3>>;

    /// Training objective against demonstrated actions `(batch, horizon, action_dim)`.
    fn compute_loss<R: Rng>(
        &self,
        obs: &Observation<B>,
        actions: Tensor<B, 3>,
        phase: Phase,
        rng: &mut R,
    ) -> Result<Tensor<B, 1>>;

    /// Loss that decreases as the policy moves towards `target`, both windows
    /// `(batch, n_action_steps, action_dim)`. `clean` is the unperturbed prediction.
    fn targeted_loss<R: Rng>(
        &self,
        obs: &Observation<B>,
        target: Tensor<B, 3>,
        clean: Tensor<B, 3>,
        rng: &mut R,
    ) -> Result<Tensor<B, 1>>;

    /// Statistics of the normalized action field.
    fn normalizer_stats(&self) -> Result<FieldStats> {
        Ok(self.normalizer().action()?.output_stats())
    }

    fn action_bounds(&self) -> Result<ActionBounds> {
        ActionBounds::from_stats(&self.normalizer_stats()?, self.shape().action_dim)
    }
}

/// A policy whose parameters live in a single autodiff module.
pub trait TrainablePolicy<B: AutodiffBackend>: Policy<B> + Sized {
    type Model: AutodiffModule<B>;

    fn model(&self) -> &Self::Model;

    fn with_model(self, model: Self::Model) -> Self;

    /// Stops gradients from accumulating in the parameters.
    fn freeze(self) -> Self {
        let model = self.model().clone().no_grad();
        self.with_model(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{TestBackend, device};

    #[test]
    fn window_starts_at_the_last_observation_step() {
        let shape = PolicyShape::new(2).with_n_obs_steps(2).with_n_action_steps(3).with_horizon(5);
        let actions = Tensor::<TestBackend, 1, Int>::arange(0..20, &device()).float().reshape([2, 5, 2]);

        let window = shape.window(actions).unwrap();

        assert_eq!(shape.action_window(), 1..4);
        assert_eq!(window.dims(), [2, 3, 2]);
        assert!(shape.validate().is_ok());
        assert!(shape.with_horizon(3).validate().is_err());
    }
}
