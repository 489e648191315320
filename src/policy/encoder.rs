use anyhow::{Result, anyhow, ensure};
use burn::{
    nn::{
        Linear, LinearConfig, PaddingConfig2d,
        conv::{Conv2d, Conv2dConfig},
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig},
    },
    prelude::*,
    tensor::activation::relu,
};

use crate::observation::Observation;

#[derive(Config, Debug, PartialEq)]
pub struct ImageMeta {
    pub key: String,
    pub channels: usize,
    pub height: usize,
    pub width: usize,
}

#[derive(Config, Debug, PartialEq)]
pub struct LowDimMeta {
    pub key: String,
    pub dim: usize,
}

#[derive(Config, Debug)]
pub struct EncoderConfig {
    pub images: Vec<ImageMeta>,

    #[config(default = "Vec::new()")]
    pub low_dim: Vec<LowDimMeta>,

    #[config(default = 32)]
    pub channels: usize,

    /// Features produced per image view and step.
    #[config(default = 64)]
    pub feature_dim: usize,
}

impl EncoderConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> ObsEncoder<B> {
        ObsEncoder::new(self, device)
    }

    pub fn output_size(&self) -> usize {
        self.images.len() * self.feature_dim + self.low_dim.iter().map(|meta| meta.dim).sum::<usize>()
    }
}

#[derive(Module, Debug)]
pub struct ViewEncoder<B: Backend> {
    conv1: Conv2d<B>,
    conv2: Conv2d<B>,
    pool: AdaptiveAvgPool2d,
    proj: Linear<B>,
}

impl<B> ViewEncoder<B>
where
    B: Backend,
{
    fn new(meta: &ImageMeta, config: &EncoderConfig, device: &B::Device) -> Self {
        let conv1 = Conv2dConfig::new([meta.channels, config.channels], [3, 3])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .init(device);
        let conv2 = Conv2dConfig::new([config.channels, config.channels], [3, 3])
            .with_stride([2, 2])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .init(device);
        let pool = AdaptiveAvgPool2dConfig::new([1, 1]).init();
        let proj = LinearConfig::new(config.channels, config.feature_dim).init(device);

        Self {
            conv1,
            conv2,
            pool,
            proj,
        }
    }

    /// `(batch, steps, c, h, w)` to `(batch, steps, feature_dim)`.
    fn forward(&self, image: Tensor<B, 5>) -> Tensor<B, 3> {
        let [b, t, c, h, w] = image.dims();

        let x = image.reshape([b * t, c, h, w]);
        let x = relu(self.conv1.forward(x));
        let x = relu(self.conv2.forward(x));
        let x = self.pool.forward(x);

        let [n, channels, _, _] = x.dims();
        let x = self.proj.forward(x.reshape([n, channels]));

        let [_, features] = x.dims();
        x.reshape([b, t, features])
    }
}

/// Per-view convolutional encoder; low dimensional keys pass through.
#[derive(Module, Debug)]
pub struct ObsEncoder<B: Backend> {
    views: Vec<ViewEncoder<B>>,
}

impl<B> ObsEncoder<B>
where
    B: Backend,
{
    pub fn new(config: &EncoderConfig, device: &B::Device) -> Self {
        let views = config
            .images
            .iter()
            .map(|meta| ViewEncoder::new(meta, config, device))
            .collect();

        Self { views }
    }

    /// Encodes the first `steps` steps of a normalized observation into
    /// `(batch, steps, output_size)` features.
    pub fn forward(&self, config: &EncoderConfig, obs: &Observation<B>, steps: usize) -> Result<Tensor<B, 3>> {
        let obs = obs.leading_steps(steps)?;
        let mut features = Vec::with_capacity(config.images.len() + config.low_dim.len());

        for (meta, encoder) in config.images.iter().zip(&self.views) {
            let image = obs.image(&meta.key)?;
            let [_, _, c, h, w] = image.dims();
            ensure!(
                [c, h, w] == [meta.channels, meta.height, meta.width],
                "view `{}` has shape {:?}, expected {:?}",
                meta.key,
                [c, h, w],
                [meta.channels, meta.height, meta.width]
            );
            features.push(encoder.forward(image.clone()));
        }

        for meta in &config.low_dim {
            let value = obs
                .low_dim
                .get(&meta.key)
                .ok_or_else(|| anyhow!("observation has no low dimensional key `{}`", meta.key))?;
            ensure!(
                value.dims()[2] == meta.dim,
                "`{}` has dimension {}, expected {}",
                meta.key,
                value.dims()[2],
                meta.dim
            );
            features.push(value.clone());
        }

        ensure!(!features.is_empty(), "the encoder has no observation keys");

        Ok(Tensor::cat(features, 2))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{TestBackend, device};

    #[test]
    fn features_concatenate_views_and_low_dim_keys() {
        let device = device();
        let config = EncoderConfig::new(vec![ImageMeta::new("agentview_image".into(), 3, 8, 8)])
            .with_low_dim(vec![LowDimMeta::new("agent_pos".into(), 2)])
            .with_channels(4)
            .with_feature_dim(6);
        let encoder = config.init::<TestBackend>(&device);
        let obs = Observation::new()
            .with_image("agentview_image", Tensor::zeros([3, 2, 3, 8, 8], &device))
            .with_low_dim("agent_pos", Tensor::zeros([3, 2, 2], &device));

        let features = encoder.forward(&config, &obs, 2).unwrap();

        assert_eq!(features.dims(), [3, 2, config.output_size()]);
        assert_eq!(config.output_size(), 8);
    }

    #[test]
    fn wrong_view_shape_is_rejected() {
        let device = device();
        let config = EncoderConfig::new(vec![ImageMeta::new("agentview_image".into(), 3, 8, 8)]);
        let encoder = config.init::<TestBackend>(&device);
        let obs = Observation::new().with_image("agentview_image", Tensor::zeros([1, 1, 3, 6, 6], &device));

        assert!(encoder.forward(&config, &obs, 1).is_err());
    }
}
