//! Patch attack: a masked perturbation of one view, refined by several signed
//! gradient steps on every batch.
use std::path::{Path, PathBuf};

use anyhow::{Result, anyhow, ensure};
use burn::{data::dataloader::DataLoaderBuilder, prelude::*, tensor::backend::AutodiffBackend};
use log::{debug, info};
use rand::{Rng, SeedableRng, rngs::StdRng};
use serde_json::json;

use super::{
    ArtifactSink, AttackKind, AttackSession, ClipRange, MaskSpec, Objective, Perturbation, SignGradientStep,
    Smoothing, TargetOffsets, compose, ensure_fresh_output, initial_perturbation, open_logger, validate_budget,
};
use crate::{
    data::{DemoBatcher, DemoDataset},
    observation::Observation,
    policy::{Policy, TrainablePolicy},
    rollout::RolloutEvaluator,
    util::{ensure_unit_range, scalar},
};

#[derive(Config, Debug)]
pub struct PatchAttackConfig {
    pub view: String,
    pub epsilon: f32,
    pub step_size: f32,

    #[config(default = "MaskSpec::Full")]
    pub mask: MaskSpec,

    #[config(default = "AttackKind::Targeted")]
    pub kind: AttackKind,

    /// One row broadcast over the action steps, or one row per step.
    #[config(default = "Vec::new()")]
    pub target_offsets: Vec<Vec<f32>>,

    #[config(default = 0.0)]
    pub clip_min: f32,

    #[config(default = 1.0)]
    pub clip_max: f32,

    /// Gradient steps per batch.
    #[config(default = 10)]
    pub iterations: usize,

    #[config(default = 1)]
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

    /// Weight of the smoothing penalty; zero disables it.
    #[config(default = 0.0)]
    pub eta: f32,

    #[config(default = false)]
    pub debug: bool,
}

impl PatchAttackConfig {
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

    /// Shrinks the run to a couple of steps.
    pub fn debugged(mut self) -> Self {
        if self.debug {
            self.num_epochs = 2;
            self.max_train_steps = Some(3);
            self.rollout_every = 1;
        }
        self
    }
}

/// Optimizes a patch over one batch at a time.
#[derive(Clone, Debug)]
pub struct PatchAttack<B: AutodiffBackend> {
    view: String,
    kind: AttackKind,
    mask: Tensor<B::InnerBackend, 3>,
    step: SignGradientStep,
    clip: ClipRange,
    iterations: usize,
    offsets: Option<TargetOffsets>,
    smoothing: Smoothing,
}

impl<B> PatchAttack<B>
where
    B: AutodiffBackend,
{
    pub fn new(config: &PatchAttackConfig, shape: [usize; 3], device: &B::Device) -> Result<Self> {
        validate_budget(config.epsilon, config.step_size, config.clip())?;
        ensure!(config.iterations > 0, "a patch attack needs at least one iteration per batch");

        Ok(Self {
            view: config.view.clone(),
            kind: config.kind,
            mask: config.mask.tensor(shape, device)?,
            step: SignGradientStep::new(config.step_size, config.epsilon, config.kind.direction())?,
            clip: config.clip(),
            iterations: config.iterations,
            offsets: config.offsets()?,
            smoothing: Smoothing::new(config.kernel_size, config.eta)?,
        })
    }

    pub fn mask(&self) -> &Tensor<B::InnerBackend, 3> {
        &self.mask
    }

    /// Runs the configured number of steps on `obs` starting from `patch` and
    /// returns the refined patch with the attack loss of the last step.
    pub fn optimize_batch<P, R>(
        &self,
        policy: &P,
        obs: &Observation<B>,
        actions: Tensor<B, 3>,
        patch: Tensor<B::InnerBackend, 3>,
        session: &AttackSession,
        rng: &mut R,
    ) -> Result<(Tensor<B::InnerBackend, 3>, f32)>
    where
        P: Policy<B>,
        R: Rng,
    {
        let image = obs.image(&self.view)?.clone().inner();
        ensure_unit_range(&image, &self.view)?;

        let objective = Objective::for_batch(self.kind, policy, obs, actions, self.offsets.as_ref(), rng)?;
        let [c, h, w] = patch.dims();
        let mask = self.mask.clone().reshape([1, 1, c, h, w]);

        let mut patch = patch;
        let mut value = 0.0;
        for iteration in 0..self.iterations {
            let composed = compose(image.clone(), patch.clone(), self.mask.clone(), self.clip);
            let leaf = Tensor::<B, 5>::from_inner(composed).require_grad();
            let perturbed = obs.clone().with_image(self.view.clone(), leaf.clone());

            let loss = objective.loss(policy, &perturbed, session.phase, rng)?;
            value = scalar(loss.clone());
            let delta = leaf.clone() - Tensor::from_inner(image.clone());
            let loss = self.smoothing.regularize(loss, delta, self.step.direction);

            let grads = loss.backward();
            let grad = leaf
                .grad(&grads)
                .ok_or_else(|| anyhow!("no gradient reached view `{}`", self.view))?;

            let signs = (grad.sign() * mask.clone()).sum_dim(0).sum_dim(1).reshape([c, h, w]);
            patch = self.step.apply(patch, signs);

            debug!("step {} iteration {iteration}: loss {value:.5}", session.global_step);
        }

        Ok((patch, value))
    }
}

/// Trains a patch over the demonstration set, evaluating and saving it every
/// `rollout_every` epochs.
pub struct PatchWorkspace<B: AutodiffBackend, P: TrainablePolicy<B>> {
    config: PatchAttackConfig,
    policy: P,
    attack: PatchAttack<B>,
    patch: Perturbation<B::InnerBackend>,
    sink: ArtifactSink,
    output_dir: PathBuf,
    session: AttackSession,
    rng: StdRng,
    device: B::Device,
}

impl<B, P> PatchWorkspace<B, P>
where
    B: AutodiffBackend,
    P: TrainablePolicy<B>,
{
    /// `artifact_dir` receives the perturbation files, `output_dir` the logs.
    /// With `prior` set the patch resumes from that artifact.
    pub fn new(
        config: PatchAttackConfig,
        policy: P,
        dataset: &DemoDataset,
        output_dir: impl Into<PathBuf>,
        artifact_dir: impl Into<PathBuf>,
        prior: Option<&Path>,
        device: B::Device,
    ) -> Result<Self> {
        let config = config.debugged();
        ensure!(config.rollout_every > 0, "rollout_every must be positive");
        let output_dir = output_dir.into();
        ensure_fresh_output(&output_dir)?;

        let layout = dataset
            .meta()
            .layout(std::slice::from_ref(&config.view), &config.mask)?;
        let attack = PatchAttack::new(&config, layout[0].shape, &device)?;

        let mut rng = StdRng::seed_from_u64(config.seed);
        let (patch, fixed_path) = initial_perturbation::<B::InnerBackend, _>(
            config.kind,
            &layout,
            config.epsilon,
            config.clip(),
            prior,
            &mut rng,
            &device,
        )?;

        let sink = ArtifactSink {
            dir: artifact_dir.into(),
            fixed_path,
            kind: config.kind,
            epsilon: config.epsilon,
            target_offsets: config.offsets()?,
        };

        Ok(Self {
            config,
            policy: policy.freeze(),
            attack,
            patch,
            sink,
            output_dir,
            session: AttackSession::default(),
            rng,
            device,
        })
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
            "patch attack on `{}`: {} with eps {} for {} epochs",
            self.config.view, self.config.kind, self.config.epsilon, self.config.num_epochs
        );

        let view = self.config.view.clone();
        for epoch in 0..self.config.num_epochs {
            let mut losses = Vec::new();

            for (batch_idx, batch) in loader.iter().enumerate() {
                if self.config.max_train_steps.is_some_and(|max| batch_idx >= max) {
                    break;
                }

                let delta = self.patch.view(&view)?.delta.clone();
                let (delta, loss) = self.attack.optimize_batch(
                    &self.policy,
                    &batch.obs,
                    batch.action,
                    delta,
                    &self.session,
                    &mut self.rng,
                )?;
                self.patch.set_delta(&view, delta)?;

                logger.log(&json!({
                    "attack_loss": loss,
                    "epoch": epoch,
                    "global_step": self.session.global_step,
                    "step_size": self.config.step_size,
                }));
                losses.push(loss);
                self.session.advance();
            }

            let mean = losses.iter().sum::<f32>() / losses.len().max(1) as f32;
            info!("epoch {epoch}: mean attack loss {mean:.5}");

            if epoch % self.config.rollout_every == 0 || epoch + 1 == self.config.num_epochs {
                self.sink.checkpoint::<B, P, E>(
                    &self.policy,
                    evaluator,
                    &self.patch,
                    &self.session,
                    &self.device,
                    &mut logger,
                )?;
            }
            self.session.finish_epoch();
        }

        Ok(self.patch)
    }
}
