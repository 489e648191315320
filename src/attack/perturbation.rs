use std::collections::BTreeMap;

use anyhow::{Result, anyhow, ensure};
use burn::prelude::*;
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::{AttackKind, MaskSpec, TargetOffsets};
use crate::{
    artifact::{ArtifactTensor, ArtifactView, PerturbationArtifact},
    observation::Observation,
    util::{ensure_unit_range, to_vec},
};

/// Valid pixel range after composition.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClipRange {
    pub min: f32,
    pub max: f32,
}

impl Default for ClipRange {
    fn default() -> Self {
        Self { min: 0.0, max: 1.0 }
    }
}

/// `clamp(image * (1 - mask) + (image + delta) * mask)`, broadcasting the
/// `(c, h, w)` delta and mask over batch and time.
pub fn compose<B: Backend>(image: Tensor<B, 5>, delta: Tensor<B, 3>, mask: Tensor<B, 3>, clip: ClipRange) -> Tensor<B, 5> {
    let [c, h, w] = delta.dims();
    let delta = delta.reshape([1, 1, c, h, w]);
    let mask = mask.reshape([1, 1, c, h, w]);
    let keep = mask.ones_like() - mask.clone();

    (image.clone() * keep + (image + delta) * mask).clamp(clip.min, clip.max)
}

/// Name, shape and mask of one perturbed view.
#[derive(Clone, Debug, PartialEq)]
pub struct ViewLayout {
    pub name: String,
    pub shape: [usize; 3],
    pub mask: MaskSpec,
}

#[derive(Clone, Debug)]
pub struct ViewPerturbation<B: Backend> {
    pub delta: Tensor<B, 3>,
    pub mask: Tensor<B, 3>,
}

/// Additive per-view image perturbation.
#[derive(Clone, Debug)]
pub struct Perturbation<B: Backend> {
    views: BTreeMap<String, ViewPerturbation<B>>,
    clip: ClipRange,
}

impl<B> Perturbation<B>
where
    B: Backend,
{
    pub fn zeros(layout: &[ViewLayout], clip: ClipRange, device: &B::Device) -> Result<Self> {
        Self::from_fn(layout, clip, device, |count| vec![0.0; count])
    }

    /// Every element drawn uniformly from `[-bound, bound]`.
    pub fn uniform<R: Rng>(
        layout: &[ViewLayout],
        bound: f32,
        clip: ClipRange,
        rng: &mut R,
        device: &B::Device,
    ) -> Result<Self> {
        ensure!(bound.is_finite() && bound >= 0.0, "uniform bound must be non-negative");
        Self::from_fn(layout, clip, device, |count| {
            (0..count).map(|_| bound * (2.0 * rng.random::<f32>() - 1.0)).collect()
        })
    }

    fn from_fn(
        layout: &[ViewLayout],
        clip: ClipRange,
        device: &B::Device,
        mut fill: impl FnMut(usize) -> Vec<f32>,
    ) -> Result<Self> {
        ensure!(!layout.is_empty(), "a perturbation needs at least one view");

        let views = layout
            .iter()
            .map(|view| {
                let [c, h, w] = view.shape;
                let delta = Tensor::from_data(TensorData::new(fill(c * h * w), view.shape), device);
                let mask = view.mask.tensor(view.shape, device)?;
                Ok((view.name.clone(), ViewPerturbation { delta, mask }))
            })
            .collect::<Result<_>>()?;

        Ok(Self { views, clip })
    }

    pub fn clip(&self) -> ClipRange {
        self.clip
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.views.keys()
    }

    pub fn view(&self, name: &str) -> Result<&ViewPerturbation<B>> {
        self.views
            .get(name)
            .ok_or_else(|| anyhow!("perturbation has no view `{name}`"))
    }

    pub fn set_delta(&mut self, name: &str, delta: Tensor<B, 3>) -> Result<()> {
        let view = self
            .views
            .get_mut(name)
            .ok_or_else(|| anyhow!("perturbation has no view `{name}`"))?;
        ensure!(
            view.delta.dims() == delta.dims(),
            "delta for `{name}` has shape {:?}, expected {:?}",
            delta.dims(),
            view.delta.dims()
        );
        view.delta = delta;
        Ok(())
    }

    /// Composes one view of `image`, which must lie in `[0, 1]`.
    pub fn compose_view(&self, name: &str, image: Tensor<B, 5>) -> Result<Tensor<B, 5>> {
        ensure_unit_range(&image, name)?;
        let view = self.view(name)?;
        let [_, _, c, h, w] = image.dims();
        ensure!(
            [c, h, w] == view.delta.dims(),
            "view `{name}` has shape {:?}, the perturbation {:?}",
            [c, h, w],
            view.delta.dims()
        );

        Ok(compose(image, view.delta.clone(), view.mask.clone(), self.clip))
    }

    /// Perturbs every view this perturbation covers; other keys pass through.
    pub fn apply(&self, obs: &Observation<B>) -> Result<Observation<B>> {
        let mut perturbed = obs.clone();
        for name in self.views.keys() {
            let image = obs.image(name)?.clone();
            perturbed.images.insert(name.clone(), self.compose_view(name, image)?);
        }
        Ok(perturbed)
    }

    /// Largest absolute element over all views.
    pub fn linf_norm(&self) -> Result<f32> {
        self.views.values().try_fold(0.0f32, |norm, view| {
            Ok(to_vec(view.delta.clone().abs())?.into_iter().fold(norm, f32::max))
        })
    }

    pub fn to_backend<B2: Backend>(&self, device: &B2::Device) -> Result<Perturbation<B2>> {
        let views = self
            .views
            .iter()
            .map(|(name, view)| {
                let delta = Tensor::from_data(view.delta.to_data(), device);
                let mask = Tensor::from_data(view.mask.to_data(), device);
                Ok((name.clone(), ViewPerturbation { delta, mask }))
            })
            .collect::<Result<_>>()?;

        Ok(Perturbation { views, clip: self.clip })
    }

    pub fn to_artifact(
        &self,
        kind: AttackKind,
        epsilon: f32,
        epoch: usize,
        mean_score: Option<f32>,
        target_offsets: Option<&TargetOffsets>,
    ) -> Result<PerturbationArtifact> {
        let views = self
            .views
            .iter()
            .map(|(name, view)| {
                let view = ArtifactView {
                    delta: ArtifactTensor::from_tensor(view.delta.clone())?,
                    mask: ArtifactTensor::from_tensor(view.mask.clone())?,
                };
                Ok((name.clone(), view))
            })
            .collect::<Result<_>>()?;

        Ok(PerturbationArtifact {
            kind,
            epsilon,
            epoch,
            mean_score,
            clip: self.clip,
            views,
            target_offsets: target_offsets.map(|offsets| offsets.rows().to_vec()),
        })
    }

    pub fn from_artifact(artifact: &PerturbationArtifact, device: &B::Device) -> Result<Self> {
        ensure!(!artifact.views.is_empty(), "artifact holds no views");

        let views = artifact
            .views
            .iter()
            .map(|(name, view)| {
                let delta = view.delta.to_tensor::<B, 3>(device)?;
                let mask = view.mask.to_tensor::<B, 3>(device)?;
                ensure!(
                    delta.dims() == mask.dims(),
                    "view `{name}` has mismatched delta and mask shapes"
                );
                Ok((name.clone(), ViewPerturbation { delta, mask }))
            })
            .collect::<Result<_>>()?;

        Ok(Self {
            views,
            clip: artifact.clip,
        })
    }
}

#[cfg(test)]
mod tests {
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;
    use crate::test_util::{TestBackend, VIEW, device, observation};

    fn layout(mask: MaskSpec) -> Vec<ViewLayout> {
        vec![ViewLayout {
            name: VIEW.into(),
            shape: [3, 8, 8],
            mask,
        }]
    }

    #[test]
    fn an_empty_mask_leaves_the_image_untouched() {
        let device = device();
        let obs = observation::<TestBackend>(2, &device);
        let mut perturbation = Perturbation::<TestBackend>::uniform(
            &layout(MaskSpec::Rect {
                top: 0,
                left: 0,
                height: 0,
                width: 0,
            }),
            0.1,
            ClipRange::default(),
            &mut StdRng::seed_from_u64(0),
            &device,
        )
        .unwrap();
        perturbation
            .set_delta(VIEW, Tensor::full([3, 8, 8], 0.1, &device))
            .unwrap();

        let perturbed = perturbation.apply(&obs).unwrap();

        assert_eq!(
            to_vec(perturbed.images[VIEW].clone()).unwrap(),
            to_vec(obs.images[VIEW].clone()).unwrap()
        );
    }

    #[test]
    fn composition_stays_in_the_clip_range() {
        let device = device();
        let obs = observation::<TestBackend>(1, &device);
        let mut perturbation =
            Perturbation::<TestBackend>::zeros(&layout(MaskSpec::Full), ClipRange::default(), &device).unwrap();
        perturbation
            .set_delta(VIEW, Tensor::full([3, 8, 8], 0.9, &device))
            .unwrap();

        let values = to_vec(perturbation.apply(&obs).unwrap().images[VIEW].clone()).unwrap();

        assert!(values.iter().all(|v| (0.0..=1.0).contains(v)));
        assert!(values.iter().any(|v| *v == 1.0));
    }

    #[test]
    fn out_of_range_images_are_refused() {
        let device = device();
        let perturbation =
            Perturbation::<TestBackend>::zeros(&layout(MaskSpec::Full), ClipRange::default(), &device).unwrap();
        let image = Tensor::<TestBackend, 5>::full([1, 1, 3, 8, 8], 1.5, &device);

        assert!(perturbation.compose_view(VIEW, image).is_err());
    }

    #[test]
    fn uniform_init_respects_its_bound() {
        let perturbation = Perturbation::<TestBackend>::uniform(
            &layout(MaskSpec::Full),
            0.05,
            ClipRange::default(),
            &mut StdRng::seed_from_u64(4),
            &device(),
        )
        .unwrap();

        let norm = perturbation.linf_norm().unwrap();
        assert!(norm <= 0.05 && norm > 0.0);
    }

    #[test]
    fn artifacts_restore_the_same_perturbation() {
        let device = device();
        let perturbation = Perturbation::<TestBackend>::uniform(
            &layout(MaskSpec::Full),
            0.05,
            ClipRange::default(),
            &mut StdRng::seed_from_u64(9),
            &device,
        )
        .unwrap();

        let artifact = perturbation
            .to_artifact(AttackKind::Untargeted, 0.05, 3, Some(0.5), None)
            .unwrap();
        let restored = Perturbation::<TestBackend>::from_artifact(&artifact, &device).unwrap();

        assert_eq!(
            to_vec(restored.view(VIEW).unwrap().delta.clone()).unwrap(),
            to_vec(perturbation.view(VIEW).unwrap().delta.clone()).unwrap()
        );
    }
}
