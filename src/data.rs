//! Demonstration windows: fixed-length observation histories paired with the
//! demonstrated action horizon.
use std::{collections::BTreeMap, fs, path::Path};

use anyhow::{Context, Result, anyhow, ensure};
use burn::{
    data::{dataloader::batcher::Batcher, dataset::Dataset},
    prelude::*,
};
use rand::{SeedableRng, rngs::StdRng, seq::SliceRandom};
use serde::{Deserialize, Serialize};

use crate::{
    attack::{MaskSpec, ViewLayout},
    normalizer::{ACTION_KEY, FieldNormalizer, FieldStats, LinearNormalizer},
    observation::Observation,
    policy::{ImageMeta, LowDimMeta},
};

/// Shapes shared by every sample of a dataset.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DemoMeta {
    pub obs_steps: usize,
    pub horizon: usize,
    pub action_dim: usize,
    pub images: Vec<ImageMeta>,
    pub low_dim: Vec<LowDimMeta>,
}

impl DemoMeta {
    pub fn image(&self, key: &str) -> Result<&ImageMeta> {
        self.images
            .iter()
            .find(|meta| meta.key == key)
            .ok_or_else(|| anyhow!("dataset has no image view `{key}`"))
    }

    pub fn layout(&self, views: &[String], mask: &MaskSpec) -> Result<Vec<ViewLayout>> {
        views
            .iter()
            .map(|view| {
                let meta = self.image(view)?;
                Ok(ViewLayout {
                    name: view.clone(),
                    shape: [meta.channels, meta.height, meta.width],
                    mask: mask.clone(),
                })
            })
            .collect()
    }
}

/// One window; every buffer is flattened row-major.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DemoSample {
    /// `(obs_steps, c, h, w)` per view, pixels in `[0, 1]`.
    pub images: BTreeMap<String, Vec<f32>>,
    /// `(obs_steps, dim)` per key.
    pub low_dim: BTreeMap<String, Vec<f32>>,
    /// `(horizon, action_dim)`.
    pub action: Vec<f32>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DemoDataset {
    meta: DemoMeta,
    samples: Vec<DemoSample>,
}

impl DemoDataset {
    pub fn new(meta: DemoMeta, samples: Vec<DemoSample>) -> Result<Self> {
        for (index, sample) in samples.iter().enumerate() {
            for image in &meta.images {
                let len = sample.images.get(&image.key).map(Vec::len);
                let expected = meta.obs_steps * image.channels * image.height * image.width;
                ensure!(
                    len == Some(expected),
                    "sample {index}: view `{}` has {len:?} values, expected {expected}",
                    image.key
                );
            }
            for low in &meta.low_dim {
                let len = sample.low_dim.get(&low.key).map(Vec::len);
                ensure!(
                    len == Some(meta.obs_steps * low.dim),
                    "sample {index}: `{}` has {len:?} values, expected {}",
                    low.key,
                    meta.obs_steps * low.dim
                );
            }
            ensure!(
                sample.action.len() == meta.horizon * meta.action_dim,
                "sample {index}: action has {} values, expected {}",
                sample.action.len(),
                meta.horizon * meta.action_dim
            );
        }

        Ok(Self { meta, samples })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        let dataset: Self =
            rmp_serde::decode::from_slice(&bytes).with_context(|| format!("failed to decode {}", path.display()))?;

        Self::new(dataset.meta, dataset.samples)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let bytes = rmp_serde::encode::to_vec_named(self)?;
        fs::write(path, bytes).with_context(|| format!("failed to write {}", path.display()))
    }

    pub fn meta(&self) -> &DemoMeta {
        &self.meta
    }

    pub fn samples(&self) -> &[DemoSample] {
        &self.samples
    }

    /// Shuffles with `seed` and holds out `val_ratio` of the samples.
    pub fn split(&self, val_ratio: f32, seed: u64) -> Result<(Self, Self)> {
        ensure!((0.0..1.0).contains(&val_ratio), "val_ratio must lie in [0, 1), got {val_ratio}");

        let mut samples = self.samples.clone();
        samples.shuffle(&mut StdRng::seed_from_u64(seed));

        let n_val = (samples.len() as f32 * val_ratio).round() as usize;
        let train = samples.split_off(n_val);

        Ok((
            Self {
                meta: self.meta.clone(),
                samples: train,
            },
            Self {
                meta: self.meta.clone(),
                samples,
            },
        ))
    }

    /// Limits normalization for actions and low dimensional keys, fixed
    /// `[0, 1] -> [-1, 1]` scaling for images.
    pub fn fit_normalizer(&self) -> Result<LinearNormalizer> {
        let mut normalizer = LinearNormalizer::new();

        let dim = self.meta.action_dim;
        let actions = self.samples.iter().flat_map(|sample| sample.action.chunks(dim));
        normalizer.insert(
            ACTION_KEY,
            FieldNormalizer::limits(FieldStats::from_rows(actions, dim)?, -1.0, 1.0, 1e-4),
        );

        for low in &self.meta.low_dim {
            let rows = self
                .samples
                .iter()
                .filter_map(|sample| sample.low_dim.get(&low.key))
                .flat_map(|values| values.chunks(low.dim));
            normalizer.insert(
                low.key.clone(),
                FieldNormalizer::limits(FieldStats::from_rows(rows, low.dim)?, -1.0, 1.0, 1e-4),
            );
        }

        for image in &self.meta.images {
            normalizer.insert(image.key.clone(), FieldNormalizer::image_range());
        }

        Ok(normalizer)
    }
}

impl Dataset<DemoSample> for DemoDataset {
    fn get(&self, index: usize) -> Option<DemoSample> {
        self.samples.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.samples.len()
    }
}

#[derive(Clone, Debug)]
pub struct DemoBatcher<B: Backend> {
    device: B::Device,
    meta: DemoMeta,
}

#[derive(Clone, Debug)]
pub struct DemoBatch<B: Backend> {
    pub obs: Observation<B>,
    /// `(batch, horizon, action_dim)`.
    pub action: Tensor<B, 3>,
}

impl<B: Backend> DemoBatcher<B> {
    pub fn new(device: B::Device, meta: DemoMeta) -> Self {
        Self { device, meta }
    }
}

impl<B: Backend> Batcher<DemoSample, DemoBatch<B>> for DemoBatcher<B> {
    fn batch(&self, items: Vec<DemoSample>) -> DemoBatch<B> {
        let n = items.len();
        let meta = &self.meta;
        let mut obs = Observation::new();

        // samples were validated against `meta` when the dataset was built
        for image in &meta.images {
            let values = items
                .iter()
                .flat_map(|item| item.images[&image.key].iter().copied())
                .collect::<Vec<_>>();
            let shape = [n, meta.obs_steps, image.channels, image.height, image.width];
            obs = obs.with_image(image.key.clone(), Tensor::from_data(TensorData::new(values, shape), &self.device));
        }

        for low in &meta.low_dim {
            let values = items
                .iter()
                .flat_map(|item| item.low_dim[&low.key].iter().copied())
                .collect::<Vec<_>>();
            let shape = [n, meta.obs_steps, low.dim];
            obs = obs.with_low_dim(low.key.clone(), Tensor::from_data(TensorData::new(values, shape), &self.device));
        }

        let action = items
            .iter()
            .flat_map(|item| item.action.iter().copied())
            .collect::<Vec<_>>();
        let action = Tensor::from_data(
            TensorData::new(action, [n, meta.horizon, meta.action_dim]),
            &self.device,
        );

        DemoBatch { obs, action }
    }
}
