//! Explicit behavior cloning: observation features regressed directly onto the
//! normalized action window.
use anyhow::Result;
use burn::{
    nn::{
        Linear, LinearConfig,
        loss::{MseLoss, Reduction},
    },
    prelude::*,
    tensor::{activation::relu, backend::AutodiffBackend},
};
use rand::Rng;

use super::{
    Phase, Policy, PolicyShape, TrainablePolicy,
    encoder::{EncoderConfig, ObsEncoder},
};
use crate::{normalizer::LinearNormalizer, observation::Observation};

#[derive(Config, Debug)]
pub struct BcPolicyConfig {
    pub shape: PolicyShape,
    pub encoder: EncoderConfig,

    #[config(default = 256)]
    pub hidden_size: usize,
}

impl BcPolicyConfig {
    pub fn init_model<B: Backend>(&self, device: &B::Device) -> BcModel<B> {
        BcModel::new(self, device)
    }

    pub fn init<B: Backend>(&self, normalizer: LinearNormalizer, device: &B::Device) -> Result<BcPolicy<B>> {
        BcPolicy::new(self.clone(), self.init_model(device), normalizer)
    }
}

#[derive(Module, Debug)]
pub struct BcModel<B: Backend> {
    encoder: ObsEncoder<B>,
    fc1: Linear<B>,
    fc2: Linear<B>,
    action: Linear<B>,
}

impl<B> BcModel<B>
where
    B: Backend,
{
    pub fn new(config: &BcPolicyConfig, device: &B::Device) -> Self {
        let shape = &config.shape;
        let input = shape.n_obs_steps * config.encoder.output_size();
        let output = shape.n_action_steps * shape.action_dim;

        let encoder = config.encoder.init(device);
        let fc1 = LinearConfig::new(input, config.hidden_size).init(device);
        let fc2 = LinearConfig::new(config.hidden_size, config.hidden_size).init(device);
        let action = LinearConfig::new(config.hidden_size, output).init(device);

        Self {
            encoder,
            fc1,
            fc2,
            action,
        }
    }

    /// Normalized actions `(batch, steps, action_dim)`.
    pub fn forward(&self, features: Tensor<B, 3>, steps: usize, action_dim: usize) -> Tensor<B, 3> {
        let [b, t, f] = features.dims();

        let x = relu(self.fc1.forward(features.reshape([b, t * f])));
        let x = relu(self.fc2.forward(x));

        self.action.forward(x).reshape([b, steps, action_dim])
    }
}

#[derive(Clone, Debug)]
pub struct BcPolicy<B: Backend> {
    model: BcModel<B>,
    config: BcPolicyConfig,
    normalizer: LinearNormalizer,
}

impl<B> BcPolicy<B>
where
    B: Backend,
{
    pub fn new(config: BcPolicyConfig, model: BcModel<B>, normalizer: LinearNormalizer) -> Result<Self> {
        config.shape.validate()?;
        normalizer.action()?;

        Ok(Self {
            model,
            config,
            normalizer,
        })
    }

    pub fn config(&self) -> &BcPolicyConfig {
        &self.config
    }

    pub fn bc_model(&self) -> &BcModel<B> {
        &self.model
    }

    fn forward(&self, obs: &Observation<B>) -> Result<Tensor<B, 3>> {
        let features = self.encode_observations(obs)?;
        let shape = &self.config.shape;
        Ok(self.model.forward(features, shape.n_action_steps, shape.action_dim))
    }
}

impl<B> Policy<B> for BcPolicy<B>
where
    B: Backend,
{
    fn shape(&self) -> &PolicyShape {
        &self.config.shape
    }

    fn normalizer(&self) -> &LinearNormalizer {
        &self.normalizer
    }

    fn encode_observations(&self, obs: &Observation<B>) -> Result<Tensor<B, 3>> {
        obs.ensure_supported()?;
        let obs = self.normalizer.normalize_observation(obs)?;
        self.model
            .encoder
            .forward(&self.config.encoder, &obs, self.config.shape.n_obs_steps)
    }

    fn predict_action<R: Rng>(&self, obs: &Observation<B>, _rng: &mut R) -> Result<Tensor<B, 3>> {
        let actions = self.forward(obs)?.detach();
        Ok(self.normalizer.action()?.unnormalize(actions))
    }

    fn compute_loss<R: Rng>(
        &self,
        obs: &Observation<B>,
        actions: Tensor<B, 3>,
        _phase: Phase,
        _rng: &mut R,
    ) -> Result<Tensor<B, 1>> {
        let target = self.normalizer.action()?.normalize(self.config.shape.window(actions)?);
        Ok(MseLoss::new().forward(self.forward(obs)?, target, Reduction::Mean))
    }

    fn targeted_loss<R: Rng>(
        &self,
        obs: &Observation<B>,
        target: Tensor<B, 3>,
        _clean: Tensor<B, 3>,
        _rng: &mut R,
    ) -> Result<Tensor<B, 1>> {
        let target = self.normalizer.action()?.normalize(target);
        Ok(MseLoss::new().forward(self.forward(obs)?, target, Reduction::Mean))
    }
}

impl<B> TrainablePolicy<B> for BcPolicy<B>
where
    B: AutodiffBackend,
{
    type Model = BcModel<B>;

    fn model(&self) -> &Self::Model {
        &self.model
    }

    fn with_model(self, model: Self::Model) -> Self {
        Self { model, ..self }
    }
}
