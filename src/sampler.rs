//! Derivative-free optimization over energy-based action proposals.
//!
//! Candidates are drawn uniformly inside the action bounds, scored by an
//! [`EnergyFunction`], and refined by resampling proportionally to
//! `softmax(energy)` followed by Gaussian jitter. All randomness comes from the
//! caller's generator and candidate bookkeeping happens on the host, so a fixed
//! seed reproduces the same actions on every backend.
use anyhow::{Result, anyhow, ensure};
use burn::{prelude::*, tensor::activation::softmax};
use rand::{
    Rng, SeedableRng,
    distr::{Distribution, weighted::WeightedIndex},
    rngs::StdRng,
};
use rand_distr::Normal;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use strum::Display;

use crate::{normalizer::FieldStats, util::to_vec};

/// Scores action candidates; higher energy means more probable.
pub trait EnergyFunction<B: Backend> {
    /// `features` is `(batch, obs_steps, feature_dim)`, `samples` is
    /// `(batch, num_samples, action_steps, action_dim)`. Returns `(batch, num_samples)`.
    fn energy(&self, features: Tensor<B, 3>, samples: Tensor<B, 4>) -> Tensor<B, 2>;
}

impl<B, F> EnergyFunction<B> for F
where
    B: Backend,
    F: Fn(Tensor<B, 3>, Tensor<B, 4>) -> Tensor<B, 2>,
{
    fn energy(&self, features: Tensor<B, 3>, samples: Tensor<B, 4>) -> Tensor<B, 2> {
        self(features, samples)
    }
}

/// Whether refined candidates are projected back into the bounds between iterations.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Resampling {
    Clipped,
    Unclipped,
}

/// How the final action is picked from the last candidate distribution.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Selection {
    Best,
    Sample,
}

#[derive(Config, Debug)]
pub struct DfoConfig {
    #[config(default = 5)]
    pub iterations: usize,

    #[config(default = 1024)]
    pub samples: usize,

    #[config(default = 0.03)]
    pub noise_std: f32,

    #[config(default = "Resampling::Clipped")]
    pub resampling: Resampling,

    #[config(default = "Selection::Best")]
    pub selection: Selection,
}

impl DfoConfig {
    pub fn init(&self) -> Result<DfoSampler> {
        ensure!(self.iterations >= 1, "the sampler needs at least one iteration");
        ensure!(self.samples >= 1, "the sampler needs at least one candidate");
        ensure!(
            self.noise_std.is_finite() && self.noise_std >= 0.0,
            "noise_std must be a non-negative number, got {}",
            self.noise_std
        );

        Ok(DfoSampler {
            config: self.clone(),
        })
    }
}

/// Per-dimension box constraint on normalized actions.
#[derive(Clone, Debug, PartialEq)]
pub struct ActionBounds {
    min: Vec<f32>,
    max: Vec<f32>,
}

impl ActionBounds {
    pub fn new(min: Vec<f32>, max: Vec<f32>) -> Result<Self> {
        ensure!(!min.is_empty(), "action bounds need at least one dimension");
        ensure!(
            min.len() == max.len(),
            "action bounds disagree on dimension: {} vs {}",
            min.len(),
            max.len()
        );
        ensure!(
            min.iter().zip(&max).all(|(lo, hi)| lo <= hi),
            "action lower bounds must not exceed upper bounds"
        );

        Ok(Self { min, max })
    }

    /// Tiles the normalizer statistics up to `action_dim` dimensions.
    pub fn from_stats(stats: &FieldStats, action_dim: usize) -> Result<Self> {
        let dim = stats.dim();
        ensure!(dim > 0 && action_dim > 0, "action bounds need at least one dimension");
        ensure!(
            action_dim % dim == 0,
            "action dimension {action_dim} is not a multiple of the statistics dimension {dim}"
        );

        let repeats = action_dim / dim;
        Self::new(stats.min.repeat(repeats), stats.max.repeat(repeats))
    }

    pub fn dim(&self) -> usize {
        self.min.len()
    }

    pub fn min(&self) -> &[f32] {
        &self.min
    }

    pub fn max(&self) -> &[f32] {
        &self.max
    }

    pub fn contains(&self, values: &[f32]) -> bool {
        values
            .chunks(self.dim())
            .all(|row| row.iter().enumerate().all(|(d, v)| *v >= self.min[d] && *v <= self.max[d]))
    }

    pub fn clamp(&self, values: &mut [f32]) {
        for row in values.chunks_mut(self.dim()) {
            for (d, v) in row.iter_mut().enumerate() {
                *v = v.clamp(self.min[d], self.max[d]);
            }
        }
    }

    /// Draws `rows` uniform vectors inside the box, row-major.
    pub fn sample_uniform<R: Rng>(&self, rows: usize, rng: &mut R) -> Vec<f32> {
        let mut values = Vec::with_capacity(rows * self.dim());
        for _ in 0..rows {
            for (lo, hi) in self.min.iter().zip(&self.max) {
                values.push(lo + (hi - lo) * rng.random::<f32>());
            }
        }
        values
    }

    /// Uniform candidates shaped `(batch, samples, steps, dim)`.
    pub fn uniform_tensor<B: Backend, R: Rng>(
        &self,
        shape: [usize; 3],
        device: &B::Device,
        rng: &mut R,
    ) -> Tensor<B, 4> {
        let [batch, samples, steps] = shape;
        let values = self.sample_uniform(batch * samples * steps, rng);
        Tensor::from_data(TensorData::new(values, [batch, samples, steps, self.dim()]), device)
    }
}

/// Result of one sampler run.
#[derive(Clone, Debug)]
pub struct DfoOutcome<B: Backend> {
    /// Chosen actions `(batch, action_steps, action_dim)` in normalized space.
    pub actions: Tensor<B, 3>,
    /// Final `softmax(energy)` over the candidates, `(batch, num_samples)`.
    pub probabilities: Tensor<B, 2>,
    /// Final candidates `(batch, num_samples, action_steps, action_dim)`.
    pub candidates: Tensor<B, 4>,
}

#[derive(Clone, Debug)]
pub struct DfoSampler {
    config: DfoConfig,
}

impl DfoSampler {
    pub fn config(&self) -> &DfoConfig {
        &self.config
    }

    /// Returns the refined action for every batch element.
    pub fn sample<B, E, R>(
        &self,
        features: Tensor<B, 3>,
        horizon: usize,
        bounds: &ActionBounds,
        energy: &E,
        rng: &mut R,
    ) -> Result<Tensor<B, 3>>
    where
        B: Backend,
        E: EnergyFunction<B> + ?Sized,
        R: Rng,
    {
        Ok(self.run(features, horizon, bounds, energy, None, rng)?.actions)
    }

    /// Like [`sample`](Self::sample), but with `candidate` injected into the
    /// initial population.
    pub fn sample_with_seed_candidate<B, E, R>(
        &self,
        features: Tensor<B, 3>,
        horizon: usize,
        bounds: &ActionBounds,
        energy: &E,
        candidate: Tensor<B, 3>,
        rng: &mut R,
    ) -> Result<Tensor<B, 3>>
    where
        B: Backend,
        E: EnergyFunction<B> + ?Sized,
        R: Rng,
    {
        Ok(self.run(features, horizon, bounds, energy, Some(candidate), rng)?.actions)
    }

    /// Full sampler run. `seed_candidate`, a `(batch, horizon, dim)` action in
    /// normalized space, replaces the first uniform candidate of every batch element.
    pub fn run<B, E, R>(
        &self,
        features: Tensor<B, 3>,
        horizon: usize,
        bounds: &ActionBounds,
        energy: &E,
        seed_candidate: Option<Tensor<B, 3>>,
        rng: &mut R,
    ) -> Result<DfoOutcome<B>>
    where
        B: Backend,
        E: EnergyFunction<B> + ?Sized,
        R: Rng,
    {
        ensure!(horizon >= 1, "the sampled horizon must be at least one step");

        let [batch, _, _] = features.dims();
        let device = features.device();
        let samples = self.config.samples;
        let dim = bounds.dim();
        let row = samples * horizon * dim;

        let mut candidates = bounds.sample_uniform(batch * samples * horizon, rng);
        if let Some(seed) = seed_candidate {
            ensure!(
                seed.dims() == [batch, horizon, dim],
                "seed candidate has shape {:?}, expected {:?}",
                seed.dims(),
                [batch, horizon, dim]
            );
            let seed = to_vec(seed)?;
            for (b, action) in seed.chunks(horizon * dim).enumerate() {
                candidates[b * row..b * row + horizon * dim].copy_from_slice(action);
            }
        }

        let noise = Normal::new(0.0f32, self.config.noise_std)?;
        let mut probabilities = Vec::new();
        for iteration in 0..self.config.iterations {
            let logits = energy.energy(features.clone(), candidate_tensor(&candidates, batch, samples, horizon, dim, &device));
            ensure!(
                logits.dims() == [batch, samples],
                "energy returned shape {:?}, expected {:?}",
                logits.dims(),
                [batch, samples]
            );
            probabilities = to_vec(softmax(logits, 1))?;

            if iteration + 1 == self.config.iterations {
                break;
            }

            let clip = (self.config.resampling == Resampling::Clipped).then_some(bounds);
            let seeds: Vec<u64> = (0..batch).map(|_| rng.random()).collect();
            candidates = candidates
                .par_chunks(row)
                .zip(probabilities.par_chunks(samples))
                .zip(seeds)
                .map(|((rows, probs), seed)| {
                    refine(rows, probs, horizon * dim, &noise, clip, &mut StdRng::seed_from_u64(seed))
                })
                .collect::<Result<Vec<_>>>()?
                .concat();
        }

        let mut actions = Vec::with_capacity(batch * horizon * dim);
        for (rows, probs) in candidates.chunks(row).zip(probabilities.chunks(samples)) {
            let chosen = match self.config.selection {
                Selection::Best => argmax(probs),
                Selection::Sample => WeightedIndex::new(probs)
                    .map_err(|err| anyhow!("invalid candidate distribution: {err}"))?
                    .sample(rng),
            };
            actions.extend_from_slice(&rows[chosen * horizon * dim..(chosen + 1) * horizon * dim]);
        }
        bounds.clamp(&mut actions);

        Ok(DfoOutcome {
            actions: Tensor::from_data(TensorData::new(actions, [batch, horizon, dim]), &device),
            probabilities: Tensor::from_data(TensorData::new(probabilities, [batch, samples]), &device),
            candidates: candidate_tensor(&candidates, batch, samples, horizon, dim, &device),
        })
    }
}

fn candidate_tensor<B: Backend>(
    values: &[f32],
    batch: usize,
    samples: usize,
    horizon: usize,
    dim: usize,
    device: &B::Device,
) -> Tensor<B, 4> {
    Tensor::from_data(TensorData::new(values.to_vec(), [batch, samples, horizon, dim]), device)
}

/// Resamples one batch element proportionally to `probs`, then jitters.
fn refine(
    rows: &[f32],
    probs: &[f32],
    width: usize,
    noise: &Normal<f32>,
    clip: Option<&ActionBounds>,
    rng: &mut StdRng,
) -> Result<Vec<f32>> {
    let index = WeightedIndex::new(probs).map_err(|err| anyhow!("invalid candidate distribution: {err}"))?;

    let mut out = Vec::with_capacity(rows.len());
    for _ in 0..probs.len() {
        let chosen = index.sample(rng);
        out.extend(rows[chosen * width..(chosen + 1) * width].iter().map(|v| v + noise.sample(rng)));
    }
    if let Some(bounds) = clip {
        bounds.clamp(&mut out);
    }

    Ok(out)
}

fn argmax(values: &[f32]) -> usize {
    values
        .iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |(best, max), (i, &v)| if v > max { (i, v) } else { (best, max) })
        .0
}
