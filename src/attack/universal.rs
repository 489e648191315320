//! Universal attack: one full-frame perturbation per view shared by every
//! observation, updated once per epoch from the gradient accumulated over it.
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use anyhow::{Result, anyhow, ensure};
use burn::{data::dataloader::DataLoaderBuilder, prelude::*, tensor::backend::AutodiffBackend};
use log::info;
use num_format::{Locale, ToFormattedString};
use rand::{SeedableRng, rngs::StdRng};
use serde_json::json;

use super::{
    ArtifactSink, AttackKind, AttackSession, ClipRange, MaskSpec, Objective, Perturbation, SignGradientStep,
    Smoothing, TargetOffsets, ensure_fresh_output, initial_perturbation, open_logger, validate_budget,
};
use crate::{
    data::{DemoBatch, DemoBatcher, DemoDataset},
    policy::TrainablePolicy,
    rollout::RolloutEvaluator,
    util::scalar,
};

#[derive(Config, Debug)]
pub struct UniversalAttackConfig {
    pub views: Vec<String>,
    pub epsilon: f32,
    pub step_size: f32,

    #[config(default = "AttackKind::Untargeted")]
    pub kind: AttackKind,

    #[config(default = "Vec::new()")]
    pub target_offsets: Vec<Vec<f32>>,

    #[config(default = 0.0)]
    pub clip_min: f32,

    #[config(default = 1.0)]
    pub clip_max: f32,

    #[config(default = 10)]
    pub num_epochs: usize,

    #[config(default = 1)]
    pub rollout_every: usize,

    #[config(default = 32)]
    pub batch_size: usize,

    #[config(default = 1)]
    pub num_workers: usize,

    #[config(default = 42)]
    pub seed: u64,

    #[config(default = "None")]
    pub max_train_steps: Option<usize>,

    #[config(default = 3)]
    pub kernel_size: usize,

    #[config(default = 0.0)]
    pub eta: f32,

    #[config(default = false)]
    pub debug: bool,
}

impl UniversalAttackConfig {
    pub fn clip(&self) -> ClipRange {
        ClipRange {
            min: self.clip_min,
            max: self.clip_max,
        }
    }

    pub fn offsets(&self) -> Result<Option<TargetOffsets>> {
        match self.kind {
            AttackKind::Targeted => Ok(Some(TargetOffsets::new(self.target_offsets.clone())?)),
            AttackKind::Untargeted => Ok(None),
        }
    }

    pub fn debugged(mut self) -> Self {
        if self.debug {
            self.num_epochs = 2;
            self.max_train_steps = Some(3);
            self.rollout_every = 1;
        }
        self
    }
}

pub struct UniversalWorkspace<B: AutodiffBackend, P: TrainablePolicy<B>> {
    config: UniversalAttackConfig,
    policy: P,
    perturbation: Perturbation<B::InnerBackend>,
    step: SignGradientStep,
    smoothing: Smoothing,
    offsets: Option<TargetOffsets>,
    sink: ArtifactSink,
    output_dir: PathBuf,
    session: AttackSession,
    rng: StdRng,
    device: B::Device,
}

impl<B, P> UniversalWorkspace<B, P>
where
    B: AutodiffBackend,
    P: TrainablePolicy<B>,
{
    pub fn new(
        config: UniversalAttackConfig,
        policy: P,
        dataset: &DemoDataset,
        output_dir: impl Into<PathBuf>,
        artifact_dir: impl Into<PathBuf>,
        prior: Option<&Path>,
        device: B::Device,
    ) -> Result<Self> {
        let config = config.debugged();
        validate_budget(config.epsilon, config.step_size, config.clip())?;
        ensure!(!config.views.is_empty(), "a universal attack needs at least one view");
        ensure!(config.rollout_every > 0, "rollout_every must be positive");
        let output_dir = output_dir.into();
        ensure_fresh_output(&output_dir)?;

        let layout = dataset.meta().layout(&config.views, &MaskSpec::Full)?;
        let mut rng = StdRng::seed_from_u64(config.seed);
        let (perturbation, fixed_path) = initial_perturbation::<B::InnerBackend, _>(
            config.kind,
            &layout,
            config.epsilon,
            config.clip(),
            prior,
            &mut rng,
            &device,
        )?;

        let offsets = config.offsets()?;
        let sink = ArtifactSink {
            dir: artifact_dir.into(),
            fixed_path,
            kind: config.kind,
            epsilon: config.epsilon,
            target_offsets: offsets.clone(),
        };

        Ok(Self {
            step: SignGradientStep::new(config.step_size, config.epsilon, config.kind.direction())?,
            smoothing: Smoothing::new(config.kernel_size, config.eta)?,
            config,
            policy: policy.freeze(),
            perturbation,
            offsets,
            sink,
            output_dir,
            session: AttackSession::default(),
            rng,
            device,
        })
    }

    pub fn perturbation(&self) -> &Perturbation<B::InnerBackend> {
        &self.perturbation
    }

    /// Attack loss of one batch. When `accumulate` is set the gradient of
    /// every view, masked and summed over batch and time, is added to `totals`.
    pub fn batch_loss(
        &mut self,
        batch: DemoBatch<B>,
        totals: Option<&mut BTreeMap<String, Tensor<B::InnerBackend, 3>>>,
    ) -> Result<f32> {
        let objective = Objective::for_batch(
            self.config.kind,
            &self.policy,
            &batch.obs,
            batch.action,
            self.offsets.as_ref(),
            &mut self.rng,
        )?;

        let mut perturbed = batch.obs.clone();
        let mut leaves = Vec::with_capacity(self.config.views.len());
        for view in &self.config.views {
            let image = batch.obs.image(view)?.clone().inner();
            let composed = self.perturbation.compose_view(view, image.clone())?;
            let leaf = Tensor::<B, 5>::from_inner(composed).require_grad();
            perturbed.images.insert(view.clone(), leaf.clone());
            leaves.push((view, leaf, image));
        }

        let mut loss = objective.loss(&self.policy, &perturbed, self.session.phase, &mut self.rng)?;
        let value = scalar(loss.clone());

        let Some(totals) = totals else {
            return Ok(value);
        };

        for (_, leaf, image) in &leaves {
            let delta = leaf.clone() - Tensor::from_inner(image.clone());
            loss = self.smoothing.regularize(loss, delta, self.step.direction);
        }

        let grads = loss.backward();
        for (view, leaf, _) in leaves {
            let grad = leaf
                .grad(&grads)
                .ok_or_else(|| anyhow!("no gradient reached view `{view}`"))?;
            let mask = self.perturbation.view(view)?.mask.clone();
            let [c, h, w] = mask.dims();

            let grad = (grad * mask.reshape([1, 1, c, h, w])).sum_dim(0).sum_dim(1).reshape([c, h, w]);
            let total = totals
                .remove(view)
                .map_or_else(|| grad.clone(), |total| total + grad.clone());
            totals.insert(view.clone(), total);
        }

        Ok(value)
    }

    pub fn run<E>(mut self, dataset: DemoDataset, evaluator: &mut E) -> Result<Perturbation<B::InnerBackend>>
    where
        E: RolloutEvaluator<B, P> + ?Sized,
    {
        let mut logger = open_logger(&self.output_dir)?;
        self.config.save(self.output_dir.join("config.json"))?;

        let batcher = DemoBatcher::<B>::new(self.device.clone(), dataset.meta().clone());
        let loader = DataLoaderBuilder::new(batcher)
            .batch_size(self.config.batch_size)
            .shuffle(self.config.seed)
            .num_workers(self.config.num_workers)
            .build(dataset);

        info!(
            "universal attack on {:?}: {} with eps {} for {} epochs",
            self.config.views, self.config.kind, self.config.epsilon, self.config.num_epochs
        );

        for epoch in 0..self.config.num_epochs {
            let mut totals = BTreeMap::new();
            let mut losses = Vec::new();

            for (batch_idx, batch) in loader.iter().enumerate() {
                if self.config.max_train_steps.is_some_and(|max| batch_idx >= max) {
                    break;
                }

                // the first epoch only measures the starting perturbation
                let accumulate = (epoch > 0).then_some(&mut totals);
                let loss = self.batch_loss(batch, accumulate)?;

                logger.log(&json!({
                    "attack_loss": loss,
                    "epoch": epoch,
                    "global_step": self.session.global_step,
                    "step_size": self.config.step_size,
                }));
                losses.push(loss);
                self.session.advance();
            }

            for (view, total) in totals {
                let delta = self.perturbation.view(&view)?.delta.clone();
                self.perturbation.set_delta(&view, self.step.apply(delta, total.sign()))?;
            }

            let mean = losses.iter().sum::<f32>() / losses.len().max(1) as f32;
            info!(
                "epoch {epoch} ({} steps): mean attack loss {mean:.5}, |delta| {:.4}",
                self.session.global_step.to_formatted_string(&Locale::en),
                self.perturbation.linf_norm()?
            );
            logger.log(&json!({
                "epoch": epoch,
                "global_step": self.session.global_step,
                "train_loss": mean,
            }));

            if epoch % self.config.rollout_every == 0 || epoch + 1 == self.config.num_epochs {
                self.sink.checkpoint::<B, P, E>(
                    &self.policy,
                    evaluator,
                    &self.perturbation,
                    &self.session,
                    &self.device,
                    &mut logger,
                )?;
            }
            self.session.finish_epoch();
        }

        Ok(self.perturbation)
    }
}

#[cfg(test)]
mod tests {
    use burn::data::dataloader::batcher::Batcher;

    use super::*;
    use crate::{
        policy::{BcPolicy, BcPolicyConfig, EncoderConfig, LowDimMeta},
        test_util::{LOW_DIM, TestAutodiffBackend, VIEW, bc_config, demo_dataset, device, shape, unit_normalizer},
        util::to_vec,
    };

    fn workspace_with(
        kind: AttackKind,
        policy: BcPolicyConfig,
    ) -> UniversalWorkspace<TestAutodiffBackend, BcPolicy<TestAutodiffBackend>> {
        let device = device();
        let data = demo_dataset(4);
        let policy = policy.init(unit_normalizer(), &device).unwrap();
        let config = UniversalAttackConfig::new(vec![VIEW.into()], 0.1, 0.01)
            .with_kind(kind)
            .with_target_offsets(vec![vec![0.2, 0.2]]);
        let dir = std::env::temp_dir().join(format!("universal-unit-{}", std::process::id()));

        UniversalWorkspace::new(config, policy, &data, dir.join("logs"), &dir, None, device).unwrap()
    }

    fn workspace(kind: AttackKind) -> UniversalWorkspace<TestAutodiffBackend, BcPolicy<TestAutodiffBackend>> {
        workspace_with(kind, bc_config())
    }

    #[test]
    fn targeted_runs_start_from_zero_and_untargeted_from_noise() {
        assert_eq!(workspace(AttackKind::Targeted).perturbation().linf_norm().unwrap(), 0.0);

        let noisy = workspace(AttackKind::Untargeted).perturbation().linf_norm().unwrap();
        assert!(noisy > 0.0 && noisy <= 0.1);
    }

    #[test]
    fn accumulation_collects_a_gradient_per_view() {
        let mut workspace = workspace(AttackKind::Untargeted);
        let data = demo_dataset(4);
        let batch =
            DemoBatcher::<TestAutodiffBackend>::new(device(), data.meta().clone()).batch(data.samples().to_vec());
        let mut totals = BTreeMap::new();

        let measured = workspace.batch_loss(batch.clone(), None).unwrap();
        let accumulated = workspace.batch_loss(batch, Some(&mut totals)).unwrap();

        assert!(measured.is_finite());
        approx::assert_relative_eq!(measured, accumulated, epsilon = 1e-5);
        assert_eq!(totals[VIEW].dims(), [3, 8, 8]);
        assert!(to_vec(totals[VIEW].clone()).unwrap().iter().any(|g| *g != 0.0));
    }

    #[test]
    fn views_the_policy_ignores_get_no_gradient() {
        let blind = BcPolicyConfig::new(
            shape(),
            EncoderConfig::new(Vec::new()).with_low_dim(vec![LowDimMeta::new(LOW_DIM.into(), 2)]),
        )
        .with_hidden_size(16);
        let mut workspace = workspace_with(AttackKind::Untargeted, blind);
        let data = demo_dataset(4);
        let batch =
            DemoBatcher::<TestAutodiffBackend>::new(device(), data.meta().clone()).batch(data.samples().to_vec());

        assert!(workspace.batch_loss(batch.clone(), None).is_ok());

        let err = workspace.batch_loss(batch, Some(&mut BTreeMap::new())).unwrap_err();
        assert!(err.to_string().contains("no gradient reached"), "{err}");
    }
}
