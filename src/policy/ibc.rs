//! Implicit behavior cloning: an energy model over (observation, action) pairs,
//! trained with an InfoNCE objective and queried through the DFO sampler.
use anyhow::{Result, ensure};
use burn::{
    nn::{Dropout, DropoutConfig, Linear, LinearConfig},
    prelude::*,
    tensor::{
        activation::{log_softmax, relu},
        backend::AutodiffBackend,
    },
};
use rand::Rng;
use rand_distr::{Distribution, Normal};

use super::{
    Phase, Policy, PolicyShape, TrainablePolicy,
    encoder::{EncoderConfig, ObsEncoder},
};
use crate::{
    normalizer::LinearNormalizer,
    observation::Observation,
    sampler::{ActionBounds, DfoConfig, DfoSampler},
};

/// Jitter added to demonstrated actions before they are scored as positives.
const POSITIVE_JITTER: f32 = 1e-4;

#[derive(Config, Debug)]
pub struct IbcPolicyConfig {
    pub shape: PolicyShape,
    pub encoder: EncoderConfig,

    #[config(default = "DfoConfig::new()")]
    pub sampler: DfoConfig,

    #[config(default = 512)]
    pub hidden_size: usize,

    #[config(default = 3)]
    pub hidden_layers: usize,

    #[config(default = 0.1)]
    pub dropout: f64,

    /// Uniform negatives scored against every positive during training.
    #[config(default = 128)]
    pub train_n_neg: usize,
}

impl IbcPolicyConfig {
    pub fn init_model<B: Backend>(&self, device: &B::Device) -> IbcModel<B> {
        IbcModel::new(self, device)
    }

    pub fn init<B: Backend>(&self, normalizer: LinearNormalizer, device: &B::Device) -> Result<IbcPolicy<B>> {
        IbcPolicy::new(self.clone(), self.init_model(device), normalizer)
    }
}

/// Energy network. The first dense layer is split into an observation and an
/// action projection so observation features are computed once per batch
/// element rather than once per candidate.
#[derive(Module, Debug)]
pub struct IbcModel<B: Backend> {
    encoder: ObsEncoder<B>,
    obs_proj: Linear<B>,
    act_proj: Linear<B>,
    hidden: Vec<Linear<B>>,
    energy: Linear<B>,
    dropout: Dropout,
}

impl<B> IbcModel<B>
where
    B: Backend,
{
    pub fn new(config: &IbcPolicyConfig, device: &B::Device) -> Self {
        let shape = &config.shape;
        let obs_size = shape.n_obs_steps * config.encoder.output_size();
        let act_size = shape.n_action_steps * shape.action_dim;

        let encoder = config.encoder.init(device);
        let obs_proj = LinearConfig::new(obs_size, config.hidden_size).init(device);
        let act_proj = LinearConfig::new(act_size, config.hidden_size)
            .with_bias(false)
            .init(device);
        let hidden = (0..config.hidden_layers)
            .map(|_| LinearConfig::new(config.hidden_size, config.hidden_size).init(device))
            .collect();
        let energy = LinearConfig::new(config.hidden_size, 1).init(device);
        let dropout = DropoutConfig::new(config.dropout).init();

        Self {
            encoder,
            obs_proj,
            act_proj,
            hidden,
            energy,
            dropout,
        }
    }

    pub fn encoder(&self) -> &ObsEncoder<B> {
        &self.encoder
    }

    /// Scores `(batch, n, steps, dim)` candidates against `(batch, obs_steps, features)`.
    pub fn forward(&self, features: Tensor<B, 3>, samples: Tensor<B, 4>, phase: Phase) -> Tensor<B, 2> {
        let [b, t, f] = features.dims();
        let [_, n, steps, dim] = samples.dims();

        let obs = self.obs_proj.forward(features.reshape([b, t * f])).unsqueeze_dim::<3>(1);
        let act = self.act_proj.forward(samples.reshape([b, n, steps * dim]));

        let mut x = self.regularize(relu(obs + act), phase);
        for layer in &self.hidden {
            x = self.regularize(relu(layer.forward(x)), phase);
        }

        self.energy.forward(x).reshape([b, n])
    }

    fn regularize(&self, x: Tensor<B, 3>, phase: Phase) -> Tensor<B, 3> {
        match phase {
            Phase::Train => self.dropout.forward(x),
            Phase::Eval => x,
        }
    }
}

#[derive(Clone, Debug)]
pub struct IbcPolicy<B: Backend> {
    model: IbcModel<B>,
    config: IbcPolicyConfig,
    normalizer: LinearNormalizer,
    sampler: DfoSampler,
}

impl<B> IbcPolicy<B>
where
    B: Backend,
{
    pub fn new(config: IbcPolicyConfig, model: IbcModel<B>, normalizer: LinearNormalizer) -> Result<Self> {
        config.shape.validate()?;
        ensure!(config.train_n_neg >= 1, "training needs at least one negative sample");
        let sampler = config.sampler.init()?;
        normalizer.action()?;

        Ok(Self {
            model,
            config,
            normalizer,
            sampler,
        })
    }

    pub fn config(&self) -> &IbcPolicyConfig {
        &self.config
    }

    pub fn ibc_model(&self) -> &IbcModel<B> {
        &self.model
    }

    /// Final candidate distribution of the sampler, `(batch, num_samples)`,
    /// together with the candidates in unnormalized action space.
    pub fn action_distribution<R: Rng>(
        &self,
        obs: &Observation<B>,
        rng: &mut R,
    ) -> Result<(Tensor<B, 2>, Tensor<B, 4>)> {
        let features = self.encode_observations(obs)?.detach();
        let outcome = self.sampler.run(
            features,
            self.config.shape.n_action_steps,
            &self.action_bounds()?,
            &|f: Tensor<B, 3>, s: Tensor<B, 4>| self.model.forward(f, s, Phase::Eval),
            None,
            rng,
        )?;

        let candidates = self.normalizer.action()?.unnormalize(outcome.candidates);
        Ok((outcome.probabilities, candidates))
    }

    /// Predicts like [`Policy::predict_action`] with `candidate`, an
    /// unnormalized `(batch, n_action_steps, action_dim)` action, placed in
    /// the sampler's initial population.
    pub fn predict_action_with_candidate<R: Rng>(
        &self,
        obs: &Observation<B>,
        candidate: Tensor<B, 3>,
        rng: &mut R,
    ) -> Result<Tensor<B, 3>> {
        let action = self.normalizer.action()?;
        let features = self.encode_observations(obs)?.detach();
        let actions = self.sampler.sample_with_seed_candidate(
            features,
            self.config.shape.n_action_steps,
            &self.action_bounds()?,
            &|f: Tensor<B, 3>, s: Tensor<B, 4>| self.model.forward(f, s, Phase::Eval),
            action.normalize(candidate.detach()),
            rng,
        )?;

        Ok(action.unnormalize(actions))
    }

    fn negatives<R: Rng>(&self, batch: usize, count: usize, rng: &mut R, device: &B::Device) -> Result<Tensor<B, 4>> {
        let bounds: ActionBounds = self.action_bounds()?;
        Ok(bounds.uniform_tensor([batch, count, self.config.shape.n_action_steps], device, rng))
    }

    /// Cross entropy with the positive candidate at index 0.
    fn info_nce(&self, obs: &Observation<B>, samples: Tensor<B, 4>, phase: Phase) -> Result<Tensor<B, 1>> {
        let features = self.encode_observations(obs)?;
        let logits = self.model.forward(features, samples, phase);
        let [b, _] = logits.dims();

        Ok(log_softmax(logits, 1).slice([0..b, 0..1]).mean().neg())
    }
}

impl<B> Policy<B> for IbcPolicy<B>
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

    fn predict_action<R: Rng>(&self, obs: &Observation<B>, rng: &mut R) -> Result<Tensor<B, 3>> {
        let features = self.encode_observations(obs)?.detach();
        let actions = self.sampler.sample(
            features,
            self.config.shape.n_action_steps,
            &self.action_bounds()?,
            &|f: Tensor<B, 3>, s: Tensor<B, 4>| self.model.forward(f, s, Phase::Eval),
            rng,
        )?;

        Ok(self.normalizer.action()?.unnormalize(actions))
    }

    fn compute_loss<R: Rng>(
        &self,
        obs: &Observation<B>,
        actions: Tensor<B, 3>,
        phase: Phase,
        rng: &mut R,
    ) -> Result<Tensor<B, 1>> {
        let positive = self.normalizer.action()?.normalize(self.config.shape.window(actions)?);
        let [b, t, d] = positive.dims();
        let device = positive.device();

        let noise = Normal::new(0.0f32, POSITIVE_JITTER)?;
        let jitter = (0..b * t * d).map(|_| noise.sample(rng)).collect::<Vec<_>>();
        let positive = positive + Tensor::from_data(TensorData::new(jitter, [b, t, d]), &device);

        let negatives = self.negatives(b, self.config.train_n_neg, rng, &device)?;
        let samples = Tensor::cat(vec![positive.unsqueeze_dim::<4>(1), negatives], 1);

        self.info_nce(obs, samples, phase)
    }

    /// The clean prediction is always among the negatives, so lowering this
    /// loss both raises the target and suppresses the unperturbed action.
    fn targeted_loss<R: Rng>(
        &self,
        obs: &Observation<B>,
        target: Tensor<B, 3>,
        clean: Tensor<B, 3>,
        rng: &mut R,
    ) -> Result<Tensor<B, 1>> {
        let action = self.normalizer.action()?;
        let target = action.normalize(target);
        let clean = action.normalize(clean);
        let [b, _, _] = target.dims();
        let device = target.device();

        let mut samples = vec![target.unsqueeze_dim::<4>(1), clean.unsqueeze_dim::<4>(1)];
        if self.config.train_n_neg > 1 {
            samples.push(self.negatives(b, self.config.train_n_neg - 1, rng, &device)?);
        }
        let samples = Tensor::cat(samples, 1);

        self.info_nce(obs, samples, Phase::Eval)
    }
}

impl<B> TrainablePolicy<B> for IbcPolicy<B>
where
    B: AutodiffBackend,
{
    type Model = IbcModel<B>;

    fn model(&self) -> &Self::Model {
        &self.model
    }

    fn with_model(self, model: Self::Model) -> Self {
        Self { model, ..self }
    }
}
