use std::collections::BTreeMap;

use anyhow::{Result, ensure};
use burn::{
    data::{dataloader::batcher::Batcher, dataset::Dataset},
    prelude::*,
};
use rand::{SeedableRng, rngs::StdRng};
use serde::{Deserialize, Serialize};

use crate::{
    attack::Perturbation,
    data::{DemoBatcher, DemoDataset},
    policy::Policy,
    util::to_vec,
};

/// Summary of one evaluation pass.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RolloutLog {
    pub mean_score: f32,
    pub episodes: usize,
    #[serde(flatten)]
    pub metrics: BTreeMap<String, f32>,
}

/// Scores a policy, optionally under a perturbation.
pub trait RolloutEvaluator<B: Backend, P: Policy<B>> {
    fn run(&mut self, policy: &P, perturbation: Option<&Perturbation<B>>) -> Result<RolloutLog>;
}

#[derive(Config, Debug)]
pub struct RolloutConfig {
    /// Largest per-element deviation from the demonstration that still counts as a success.
    #[config(default = 0.1)]
    pub tolerance: f32,

    #[config(default = 32)]
    pub batch_size: usize,

    #[config(default = "None")]
    pub max_batches: Option<usize>,

    #[config(default = 42)]
    pub seed: u64,
}

/// Replays held-out demonstrations: a window succeeds when the predicted
/// action window stays within `tolerance` of the demonstrated one.
#[derive(Clone, Debug)]
pub struct OfflineEvaluator<B: Backend> {
    config: RolloutConfig,
    dataset: DemoDataset,
    batcher: DemoBatcher<B>,
}

impl<B: Backend> OfflineEvaluator<B> {
    pub fn new(config: RolloutConfig, dataset: DemoDataset, device: B::Device) -> Result<Self> {
        ensure!(config.batch_size > 0, "rollout batch size must be positive");
        ensure!(dataset.len() > 0, "rollout dataset is empty");

        let batcher = DemoBatcher::new(device, dataset.meta().clone());
        Ok(Self {
            config,
            dataset,
            batcher,
        })
    }
}

impl<B, P> RolloutEvaluator<B, P> for OfflineEvaluator<B>
where
    B: Backend,
    P: Policy<B>,
{
    fn run(&mut self, policy: &P, perturbation: Option<&Perturbation<B>>) -> Result<RolloutLog> {
        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let indices = (0..self.dataset.len()).collect::<Vec<_>>();
        let batches = indices
            .chunks(self.config.batch_size)
            .take(self.config.max_batches.unwrap_or(usize::MAX));

        let mut successes = 0usize;
        let mut episodes = 0usize;
        let mut error = 0.0f64;

        for chunk in batches {
            let items = chunk.iter().filter_map(|&i| self.dataset.get(i)).collect();
            let batch = self.batcher.batch(items);

            let obs = match perturbation {
                Some(perturbation) => perturbation.apply(&batch.obs)?,
                None => batch.obs,
            };

            let predicted = to_vec(policy.predict_action(&obs, &mut rng)?)?;
            let expected = to_vec(policy.shape().window(batch.action)?)?;
            let width = policy.shape().n_action_steps * policy.shape().action_dim;

            for (p, e) in predicted.chunks(width).zip(expected.chunks(width)) {
                let worst = p.iter().zip(e).map(|(a, b)| (a - b).abs()).fold(0.0f32, f32::max);
                let l2 = p.iter().zip(e).map(|(a, b)| (a - b).powi(2)).sum::<f32>().sqrt();

                successes += (worst <= self.config.tolerance) as usize;
                error += l2 as f64;
                episodes += 1;
            }
        }

        ensure!(episodes > 0, "rollout evaluated no episodes");

        Ok(RolloutLog {
            mean_score: successes as f32 / episodes as f32,
            episodes,
            metrics: BTreeMap::from([("action_error".to_string(), (error / episodes as f64) as f32)]),
        })
    }
}
