use std::collections::BTreeMap;

use burn::{
    backend::{Autodiff, NdArray},
    prelude::*,
};

use crate::{
    data::{DemoDataset, DemoMeta, DemoSample},
    normalizer::{ACTION_KEY, FieldNormalizer, FieldStats, LinearNormalizer},
    observation::Observation,
    policy::{BcPolicyConfig, EncoderConfig, IbcPolicyConfig, ImageMeta, LowDimMeta, PolicyShape},
    sampler::DfoConfig,
};

pub type TestBackend = NdArray;
pub type TestAutodiffBackend = Autodiff<TestBackend>;

pub const VIEW: &str = "agentview_image";
pub const LOW_DIM: &str = "agent_pos";

pub fn device() -> <TestBackend as Backend>::Device {
    Default::default()
}

pub fn shape() -> PolicyShape {
    PolicyShape::new(2)
        .with_n_obs_steps(2)
        .with_n_action_steps(1)
        .with_horizon(2)
}

pub fn encoder_config() -> EncoderConfig {
    EncoderConfig::new(vec![ImageMeta::new(VIEW.into(), 3, 8, 8)])
        .with_low_dim(vec![LowDimMeta::new(LOW_DIM.into(), 2)])
        .with_channels(4)
        .with_feature_dim(8)
}

pub fn ibc_config() -> IbcPolicyConfig {
    IbcPolicyConfig::new(shape(), encoder_config())
        .with_sampler(DfoConfig::new().with_samples(32).with_iterations(3))
        .with_hidden_size(16)
        .with_hidden_layers(1)
        .with_train_n_neg(8)
}

pub fn bc_config() -> BcPolicyConfig {
    BcPolicyConfig::new(shape(), encoder_config()).with_hidden_size(16)
}

/// Actions and `agent_pos` live in `[-1, 1]`, so limits normalization is the identity.
pub fn unit_normalizer() -> LinearNormalizer {
    let unit = || {
        FieldNormalizer::limits(
            FieldStats {
                min: vec![-1.0, -1.0],
                max: vec![1.0, 1.0],
                mean: vec![0.0, 0.0],
                std: vec![0.5, 0.5],
            },
            -1.0,
            1.0,
            1e-4,
        )
    };

    LinearNormalizer::new()
        .with(ACTION_KEY, unit())
        .with(LOW_DIM, unit())
        .with(VIEW, FieldNormalizer::image_range())
}

/// Deterministic observation with pixels strictly inside `(0, 1)`.
pub fn observation<B: Backend>(batch: usize, device: &B::Device) -> Observation<B> {
    let pixels = batch * 2 * 3 * 8 * 8;
    let image = (0..pixels)
        .map(|i| 0.2 + 0.6 * ((i * 37 % 101) as f32 / 100.0))
        .collect::<Vec<_>>();
    let pos = (0..batch * 2 * 2)
        .map(|i| ((i % 5) as f32 - 2.0) / 4.0)
        .collect::<Vec<_>>();

    Observation::new()
        .with_image(VIEW, Tensor::from_data(TensorData::new(image, [batch, 2, 3, 8, 8]), device))
        .with_low_dim(LOW_DIM, Tensor::from_data(TensorData::new(pos, [batch, 2, 2]), device))
}

pub fn demo_meta() -> DemoMeta {
    DemoMeta {
        obs_steps: 2,
        horizon: 2,
        action_dim: 2,
        images: vec![ImageMeta::new(VIEW.into(), 3, 8, 8)],
        low_dim: vec![LowDimMeta::new(LOW_DIM.into(), 2)],
    }
}

/// Samples whose action is a linear function of the uniform pixel level.
pub fn demo_dataset(len: usize) -> DemoDataset {
    let samples = (0..len)
        .map(|i| {
            let level = 0.1 + 0.8 * (i as f32 / len.max(1) as f32);
            DemoSample {
                images: BTreeMap::from([(VIEW.to_string(), vec![level; 2 * 3 * 8 * 8])]),
                low_dim: BTreeMap::from([(LOW_DIM.to_string(), vec![level - 0.5; 4])]),
                action: vec![level, -level, level, -level],
            }
        })
        .collect();

    DemoDataset::new(demo_meta(), samples).unwrap()
}
