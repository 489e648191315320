use std::collections::BTreeMap;

use anyhow::{Result, anyhow, ensure};
use burn::prelude::*;

use crate::util::ensure_unit_range;

/// Observation key reserved for previous actions; no policy here consumes it.
pub const PAST_ACTION_KEY: &str = "past_action";

/// A batch of observations keyed by name.
///
/// Image views are `(batch, obs_steps, channels, height, width)` with pixels in
/// `[0, 1]`; low dimensional keys are `(batch, obs_steps, dim)`.
#[derive(Clone, Debug)]
pub struct Observation<B: Backend> {
    pub images: BTreeMap<String, Tensor<B, 5>>,
    pub low_dim: BTreeMap<String, Tensor<B, 3>>,
}

impl<B: Backend> Default for Observation<B> {
    fn default() -> Self {
        Self {
            images: BTreeMap::new(),
            low_dim: BTreeMap::new(),
        }
    }
}

impl<B: Backend> Observation<B> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_image(mut self, key: impl Into<String>, image: Tensor<B, 5>) -> Self {
        self.images.insert(key.into(), image);
        self
    }

    pub fn with_low_dim(mut self, key: impl Into<String>, value: Tensor<B, 3>) -> Self {
        self.low_dim.insert(key.into(), value);
        self
    }

    pub fn contains(&self, key: &str) -> bool {
        self.images.contains_key(key) || self.low_dim.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.images.keys().chain(self.low_dim.keys())
    }

    pub fn batch_size(&self) -> usize {
        self.images
            .values()
            .map(|image| image.dims()[0])
            .chain(self.low_dim.values().map(|value| value.dims()[0]))
            .next()
            .unwrap_or(0)
    }

    pub fn image(&self, view: &str) -> Result<&Tensor<B, 5>> {
        self.images
            .get(view)
            .ok_or_else(|| anyhow!("observation has no image view `{view}`"))
    }

    /// Rejects inputs the policies cannot consume.
    pub fn ensure_supported(&self) -> Result<()> {
        ensure!(
            !self.contains(PAST_ACTION_KEY),
            "observations carrying `{PAST_ACTION_KEY}` are not supported"
        );

        let batch = self.batch_size();
        ensure!(
            self.images.values().all(|image| image.dims()[0] == batch)
                && self.low_dim.values().all(|value| value.dims()[0] == batch),
            "observation keys disagree on the batch size"
        );

        Ok(())
    }

    pub fn ensure_unit_range(&self, view: &str) -> Result<()> {
        ensure_unit_range(self.image(view)?, view)
    }

    /// Keeps the first `steps` observation steps of every key.
    pub fn leading_steps(&self, steps: usize) -> Result<Self> {
        let images = self
            .images
            .iter()
            .map(|(key, image)| {
                let [b, t, c, h, w] = image.dims();
                ensure!(t >= steps, "`{key}` has {t} steps, {steps} required");
                Ok((key.clone(), image.clone().slice([0..b, 0..steps, 0..c, 0..h, 0..w])))
            })
            .collect::<Result<_>>()?;

        let low_dim = self
            .low_dim
            .iter()
            .map(|(key, value)| {
                let [b, t, d] = value.dims();
                ensure!(t >= steps, "`{key}` has {t} steps, {steps} required");
                Ok((key.clone(), value.clone().slice([0..b, 0..steps, 0..d])))
            })
            .collect::<Result<_>>()?;

        Ok(Self { images, low_dim })
    }

    pub fn detach(self) -> Self {
        Self {
            images: self
                .images
                .into_iter()
                .map(|(key, image)| (key, image.detach()))
                .collect(),
            low_dim: self
                .low_dim
                .into_iter()
                .map(|(key, value)| (key, value.detach()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{TestBackend, device};

    #[test]
    fn past_action_is_rejected() {
        let device = device();
        let obs = Observation::<TestBackend>::new()
            .with_low_dim("agent_pos", Tensor::zeros([2, 1, 2], &device))
            .with_low_dim(PAST_ACTION_KEY, Tensor::zeros([2, 1, 2], &device));

        assert!(obs.ensure_supported().is_err());
    }

    #[test]
    fn leading_steps_trims_the_time_axis() {
        let device = device();
        let obs = Observation::<TestBackend>::new()
            .with_image("agentview_image", Tensor::zeros([2, 3, 3, 4, 4], &device))
            .with_low_dim("agent_pos", Tensor::zeros([2, 3, 2], &device));

        let trimmed = obs.leading_steps(2).unwrap();

        assert_eq!(trimmed.images["agentview_image"].dims(), [2, 2, 3, 4, 4]);
        assert_eq!(trimmed.low_dim["agent_pos"].dims(), [2, 2, 2]);
        assert!(obs.leading_steps(4).is_err());
    }
}
