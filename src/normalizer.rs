use std::{collections::BTreeMap, fs, path::Path};

use anyhow::{Context, Result, anyhow, ensure};
use burn::prelude::*;
use serde::{Deserialize, Serialize};

use crate::{observation::Observation, util::last_axis};

/// Field holding the actions in every normalizer.
pub const ACTION_KEY: &str = "action";

/// Per-dimension statistics of one field.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldStats {
    pub min: Vec<f32>,
    pub max: Vec<f32>,
    pub mean: Vec<f32>,
    pub std: Vec<f32>,
}

impl FieldStats {
    /// Computes statistics over `rows`, each a vector of length `dim`.
    pub fn from_rows<'a>(rows: impl IntoIterator<Item = &'a [f32]>, dim: usize) -> Result<Self> {
        ensure!(dim > 0, "statistics need at least one dimension");

        let mut min = vec![f32::INFINITY; dim];
        let mut max = vec![f32::NEG_INFINITY; dim];
        let mut sum = vec![0.0f64; dim];
        let mut sum_sq = vec![0.0f64; dim];
        let mut count = 0usize;

        for row in rows {
            ensure!(row.len() == dim, "expected rows of length {dim}, got {}", row.len());
            for (d, &value) in row.iter().enumerate() {
                min[d] = min[d].min(value);
                max[d] = max[d].max(value);
                sum[d] += value as f64;
                sum_sq[d] += (value as f64) * (value as f64);
            }
            count += 1;
        }
        ensure!(count > 0, "cannot compute statistics of an empty field");

        let n = count as f64;
        let mean = sum.iter().map(|s| (s / n) as f32).collect();
        let std = sum
            .iter()
            .zip(&sum_sq)
            .map(|(s, sq)| ((sq / n - (s / n).powi(2)).max(0.0)).sqrt() as f32)
            .collect();

        Ok(Self { min, max, mean, std })
    }

    pub fn dim(&self) -> usize {
        self.min.len()
    }
}

/// Affine map `x * scale + offset` applied along the last axis.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldNormalizer {
    pub scale: Vec<f32>,
    pub offset: Vec<f32>,
    pub input_stats: FieldStats,
}

impl FieldNormalizer {
    pub fn identity(stats: FieldStats) -> Self {
        let dim = stats.dim();
        Self {
            scale: vec![1.0; dim],
            offset: vec![0.0; dim],
            input_stats: stats,
        }
    }

    /// Maps pixels in `[0, 1]` to `[-1, 1]`.
    pub fn image_range() -> Self {
        Self {
            scale: vec![2.0],
            offset: vec![-1.0],
            input_stats: FieldStats {
                min: vec![0.0],
                max: vec![1.0],
                mean: vec![0.5],
                std: vec![(1.0f32 / 12.0).sqrt()],
            },
        }
    }

    /// Maps `[min, max]` of every dimension onto `[output_min, output_max]`.
    /// Dimensions whose range is below `range_eps` are centred instead.
    pub fn limits(stats: FieldStats, output_min: f32, output_max: f32, range_eps: f32) -> Self {
        let (scale, offset) = stats
            .min
            .iter()
            .zip(&stats.max)
            .map(|(&lo, &hi)| {
                let range = hi - lo;
                if range < range_eps {
                    (1.0, (output_max + output_min) / 2.0 - lo)
                } else {
                    let scale = (output_max - output_min) / range;
                    (scale, output_min - scale * lo)
                }
            })
            .unzip();

        Self {
            scale,
            offset,
            input_stats: stats,
        }
    }

    /// Zero mean, unit variance.
    pub fn gaussian(stats: FieldStats, range_eps: f32) -> Self {
        let (scale, offset) = stats
            .mean
            .iter()
            .zip(&stats.std)
            .map(|(&mean, &std)| {
                let scale = if std < range_eps { 1.0 } else { 1.0 / std };
                (scale, -mean * scale)
            })
            .unzip();

        Self {
            scale,
            offset,
            input_stats: stats,
        }
    }

    pub fn dim(&self) -> usize {
        self.scale.len()
    }

    pub fn normalize<B: Backend, const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        let device = x.device();
        x * last_axis::<B, D>(&self.scale, &device) + last_axis::<B, D>(&self.offset, &device)
    }

    pub fn unnormalize<B: Backend, const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        let device = x.device();
        (x - last_axis::<B, D>(&self.offset, &device)) / last_axis::<B, D>(&self.scale, &device)
    }

    /// Statistics of the normalized field.
    pub fn output_stats(&self) -> FieldStats {
        let map = |values: &[f32]| -> Vec<f32> {
            values
                .iter()
                .enumerate()
                .map(|(d, v)| v * self.scale[d % self.dim()] + self.offset[d % self.dim()])
                .collect()
        };

        let mut min = map(&self.input_stats.min);
        let mut max = map(&self.input_stats.max);
        for (lo, hi) in min.iter_mut().zip(max.iter_mut()) {
            if lo > hi {
                std::mem::swap(lo, hi);
            }
        }

        FieldStats {
            min,
            max,
            mean: map(&self.input_stats.mean),
            std: self
                .input_stats
                .std
                .iter()
                .enumerate()
                .map(|(d, s)| s * self.scale[d % self.dim()].abs())
                .collect(),
        }
    }
}

/// Named collection of field normalizers, one per observation key plus [`ACTION_KEY`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LinearNormalizer {
    fields: BTreeMap<String, FieldNormalizer>,
}

impl LinearNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, field: FieldNormalizer) {
        self.fields.insert(key.into(), field);
    }

    pub fn with(mut self, key: impl Into<String>, field: FieldNormalizer) -> Self {
        self.insert(key, field);
        self
    }

    pub fn get(&self, key: &str) -> Result<&FieldNormalizer> {
        self.fields
            .get(key)
            .ok_or_else(|| anyhow!("normalizer has no field `{key}`"))
    }

    pub fn action(&self) -> Result<&FieldNormalizer> {
        self.get(ACTION_KEY)
    }

    pub fn normalize_observation<B: Backend>(&self, obs: &Observation<B>) -> Result<Observation<B>> {
        let images = obs
            .images
            .iter()
            .map(|(key, image)| Ok((key.clone(), self.get(key)?.normalize(image.clone()))))
            .collect::<Result<_>>()?;
        let low_dim = obs
            .low_dim
            .iter()
            .map(|(key, value)| Ok((key.clone(), self.get(key)?.normalize(value.clone()))))
            .collect::<Result<_>>()?;

        Ok(Observation { images, low_dim })
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json =
            fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
        Ok(serde_json::from_str(&json)?)
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;
    use crate::{
        test_util::{TestBackend, device},
        util::to_vec,
    };

    fn stats(rows: &[[f32; 2]]) -> FieldStats {
        FieldStats::from_rows(rows.iter().map(|row| row.as_slice()), 2).unwrap()
    }

    #[test]
    fn limits_map_the_data_range_onto_unit_interval() {
        let field = FieldNormalizer::limits(stats(&[[0.0, 10.0], [2.0, 30.0]]), -1.0, 1.0, 1e-4);
        let x = Tensor::<TestBackend, 2>::from_data([[0.0, 10.0], [2.0, 30.0], [1.0, 20.0]], &device());

        let y = to_vec(field.normalize(x.clone())).unwrap();
        let back = to_vec(field.unnormalize(field.normalize(x.clone()))).unwrap();

        for (got, want) in y.iter().zip([-1.0, -1.0, 1.0, 1.0, 0.0, 0.0]) {
            assert_relative_eq!(*got, want, epsilon = 1e-6);
        }
        for (got, want) in back.iter().zip(to_vec(x).unwrap()) {
            assert_relative_eq!(*got, want, epsilon = 1e-5);
        }
    }

    #[test]
    fn constant_dimensions_are_centred() {
        let field = FieldNormalizer::limits(stats(&[[3.0, 0.0], [3.0, 1.0]]), -1.0, 1.0, 1e-4);
        let out = field.output_stats();

        assert_relative_eq!(out.min[0], 0.0);
        assert_relative_eq!(out.max[0], 0.0);
        assert_relative_eq!(out.min[1], -1.0);
        assert_relative_eq!(out.max[1], 1.0);
    }

    #[test]
    fn gaussian_standardizes() {
        let field = FieldNormalizer::gaussian(stats(&[[1.0, 0.0], [3.0, 4.0]]), 1e-4);
        let out = field.output_stats();

        assert_relative_eq!(out.mean[0], 0.0, epsilon = 1e-6);
        assert_relative_eq!(out.std[1], 1.0, epsilon = 1e-6);
    }

    #[test]
    fn missing_fields_are_reported() {
        let normalizer = LinearNormalizer::new().with(ACTION_KEY, FieldNormalizer::image_range());
        let obs = Observation::<TestBackend>::new()
            .with_low_dim("agent_pos", Tensor::zeros([1, 1, 2], &device()));

        assert!(normalizer.normalize_observation(&obs).is_err());
        assert!(normalizer.action().is_ok());
    }

    #[test]
    fn normalizer_survives_a_json_round_trip() {
        let normalizer = LinearNormalizer::new()
            .with(ACTION_KEY, FieldNormalizer::limits(stats(&[[0.0, 1.0], [2.0, 3.0]]), -1.0, 1.0, 1e-4))
            .with("agentview_image", FieldNormalizer::image_range());
        let path = std::env::temp_dir().join(format!("normalizer-{}.json", std::process::id()));

        normalizer.save(&path).unwrap();
        let loaded = LinearNormalizer::load(&path).unwrap();
        let _ = fs::remove_file(&path);

        assert_eq!(loaded, normalizer);
    }
}
